//! In-memory remote services with fault injection.
//!
//! Each fake keeps its state behind a `Mutex` and exposes call counters so
//! idempotency can be asserted, plus hooks to inject errors or script the
//! status sequence a run reports while it is polled.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, RwLock};

use super::{
    AssetRecord, AssetRepository, CatalogService, ConnectionSpec, CrawlerService, CrawlerSpec,
    CrawlerState, DataSourceRun, DataSourceSpec, DataSourceSummary, DatasetSpec, JobRun,
    ProfileJobSpec, ProfilingService, ProjectSummary, RecipeJobSpec, RemoteError,
};
use crate::payload::RunStatus;

fn default_script() -> Vec<RunStatus> {
    vec![RunStatus::Running, RunStatus::Succeeded]
}

/// Queued one-shot errors per operation name.
#[derive(Debug, Default)]
struct FaultPlan {
    queued: HashMap<&'static str, VecDeque<RemoteError>>,
}

impl FaultPlan {
    fn push(&mut self, operation: &'static str, error: RemoteError) {
        self.queued.entry(operation).or_default().push_back(error);
    }

    fn take(&mut self, operation: &'static str) -> Result<(), RemoteError> {
        match self.queued.get_mut(operation).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// A polled status sequence: pops until one entry remains, which then sticks.
#[derive(Debug, Clone)]
struct StatusScript {
    remaining: VecDeque<RunStatus>,
}

impl StatusScript {
    fn new(statuses: &[RunStatus]) -> Self {
        let mut remaining: VecDeque<RunStatus> = statuses.iter().copied().collect();
        if remaining.is_empty() {
            remaining.push_back(RunStatus::Succeeded);
        }
        Self { remaining }
    }

    fn current(&self) -> RunStatus {
        self.remaining.front().copied().unwrap_or(RunStatus::Succeeded)
    }

    fn advance(&mut self) -> RunStatus {
        if self.remaining.len() > 1 {
            self.remaining.pop_front();
        }
        self.current()
    }
}

fn poisoned() -> RemoteError {
    RemoteError::Service {
        message: "lock poisoned".to_string(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, RemoteError> {
    mutex.lock().map_err(|_| poisoned())
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RunEntry {
    data_source_id: String,
    script: StatusScript,
    // First read reports the status as of start; later reads advance.
    observed: bool,
}

#[derive(Debug)]
struct CatalogState {
    projects: HashMap<(String, String), ProjectSummary>,
    data_sources: HashMap<String, (String, DataSourceSpec, DataSourceSummary)>,
    runs: HashMap<String, RunEntry>,
    run_order: Vec<String>,
    run_script: Vec<RunStatus>,
    racing_projects: HashSet<(String, String)>,
    next_project: u32,
    next_data_source: u32,
    next_run: u32,
    project_creates: usize,
    data_source_creates: usize,
    run_starts: usize,
    faults: FaultPlan,
}

#[derive(Debug)]
pub struct MemoryCatalogService {
    state: Mutex<CatalogState>,
}

impl Default for MemoryCatalogService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCatalogService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CatalogState {
                projects: HashMap::new(),
                data_sources: HashMap::new(),
                runs: HashMap::new(),
                run_order: Vec::new(),
                run_script: default_script(),
                racing_projects: HashSet::new(),
                next_project: 1,
                next_data_source: 1,
                next_run: 1,
                project_creates: 0,
                data_source_creates: 0,
                run_starts: 0,
                faults: FaultPlan::default(),
            }),
        }
    }

    /// Queue an error for the next call of `operation` (trait method name).
    pub fn fail_next(&self, operation: &'static str, error: RemoteError) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.push(operation, error);
        }
    }

    /// Status sequence reported by runs started from now on.
    pub fn script_runs(&self, statuses: &[RunStatus]) {
        if let Ok(mut state) = self.state.lock() {
            state.run_script = statuses.to_vec();
        }
    }

    /// Make the next `create_project` for this name lose a creation race:
    /// the project appears, but the call reports `AlreadyExists`.
    pub fn race_project_creation(&self, domain_id: &str, name: &str) {
        if let Ok(mut state) = self.state.lock() {
            state
                .racing_projects
                .insert((domain_id.to_string(), name.to_string()));
        }
    }

    pub fn delete_data_source(&self, data_source_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.data_sources.remove(data_source_id);
        }
    }

    pub fn project_creates(&self) -> usize {
        self.state.lock().map(|s| s.project_creates).unwrap_or(0)
    }

    pub fn data_source_creates(&self) -> usize {
        self.state.lock().map(|s| s.data_source_creates).unwrap_or(0)
    }

    pub fn run_starts(&self) -> usize {
        self.state.lock().map(|s| s.run_starts).unwrap_or(0)
    }

    pub fn data_source_spec(&self, data_source_id: &str) -> Option<DataSourceSpec> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.data_sources.get(data_source_id).map(|(_, spec, _)| spec.clone()))
    }
}

impl CatalogState {
    fn insert_project(&mut self, domain_id: &str, name: &str) -> ProjectSummary {
        let project = ProjectSummary {
            id: format!("proj-{}", self.next_project),
            name: name.to_string(),
            domain_id: domain_id.to_string(),
        };
        self.next_project += 1;
        self.projects
            .insert((domain_id.to_string(), name.to_string()), project.clone());
        project
    }

    fn run_view(&self, run_id: &str) -> Option<DataSourceRun> {
        self.runs.get(run_id).map(|entry| DataSourceRun {
            id: run_id.to_string(),
            data_source_id: entry.data_source_id.clone(),
            status: entry.script.current(),
        })
    }
}

#[async_trait]
impl CatalogService for MemoryCatalogService {
    async fn find_project(
        &self,
        domain_id: &str,
        name: &str,
    ) -> Result<Option<ProjectSummary>, RemoteError> {
        let mut state = lock(&self.state)?;
        state.faults.take("find_project")?;
        Ok(state
            .projects
            .get(&(domain_id.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_project(
        &self,
        domain_id: &str,
        name: &str,
    ) -> Result<ProjectSummary, RemoteError> {
        let mut state = lock(&self.state)?;
        state.faults.take("create_project")?;
        let key = (domain_id.to_string(), name.to_string());
        if state.racing_projects.remove(&key) {
            state.insert_project(domain_id, name);
            return Err(RemoteError::AlreadyExists {
                resource: format!("project {name}"),
            });
        }
        if state.projects.contains_key(&key) {
            return Err(RemoteError::AlreadyExists {
                resource: format!("project {name}"),
            });
        }
        state.project_creates += 1;
        Ok(state.insert_project(domain_id, name))
    }

    async fn find_data_source(
        &self,
        domain_id: &str,
        project_id: &str,
        name: &str,
    ) -> Result<Option<DataSourceSummary>, RemoteError> {
        let mut state = lock(&self.state)?;
        state.faults.take("find_data_source")?;
        Ok(state
            .data_sources
            .values()
            .find(|(domain, _, ds)| {
                domain == domain_id && ds.project_id == project_id && ds.name == name
            })
            .map(|(_, _, ds)| ds.clone()))
    }

    async fn create_data_source(
        &self,
        domain_id: &str,
        spec: &DataSourceSpec,
    ) -> Result<DataSourceSummary, RemoteError> {
        let mut state = lock(&self.state)?;
        state.faults.take("create_data_source")?;
        let exists = state.data_sources.values().any(|(domain, _, ds)| {
            domain == domain_id && ds.project_id == spec.project_id && ds.name == spec.name
        });
        if exists {
            return Err(RemoteError::AlreadyExists {
                resource: format!("data source {}", spec.name),
            });
        }

        let summary = DataSourceSummary {
            id: format!("DS{}", state.next_data_source),
            name: spec.name.clone(),
            project_id: spec.project_id.clone(),
            kind: spec.configuration.kind(),
        };
        state.next_data_source += 1;
        state.data_source_creates += 1;
        state.data_sources.insert(
            summary.id.clone(),
            (domain_id.to_string(), spec.clone(), summary.clone()),
        );
        Ok(summary)
    }

    async fn get_data_source(
        &self,
        _domain_id: &str,
        data_source_id: &str,
    ) -> Result<DataSourceSummary, RemoteError> {
        let mut state = lock(&self.state)?;
        state.faults.take("get_data_source")?;
        state
            .data_sources
            .get(data_source_id)
            .map(|(_, _, ds)| ds.clone())
            .ok_or_else(|| RemoteError::not_found(format!("data source {data_source_id}")))
    }

    async fn start_data_source_run(
        &self,
        _domain_id: &str,
        data_source_id: &str,
    ) -> Result<DataSourceRun, RemoteError> {
        let mut state = lock(&self.state)?;
        state.faults.take("start_data_source_run")?;
        if !state.data_sources.contains_key(data_source_id) {
            return Err(RemoteError::not_found(format!("data source {data_source_id}")));
        }
        let in_flight = state.runs.values().any(|run| {
            run.data_source_id == data_source_id && run.script.current() == RunStatus::Running
        });
        if in_flight {
            return Err(RemoteError::Conflict {
                resource: format!("data source {data_source_id} run"),
            });
        }

        let id = format!("R{}", state.next_run);
        state.next_run += 1;
        state.run_starts += 1;
        let script = StatusScript::new(&state.run_script);
        state.runs.insert(
            id.clone(),
            RunEntry {
                data_source_id: data_source_id.to_string(),
                script,
                observed: false,
            },
        );
        state.run_order.push(id.clone());
        state
            .run_view(&id)
            .ok_or_else(|| RemoteError::not_found(format!("run {id}")))
    }

    async fn get_data_source_run(
        &self,
        _domain_id: &str,
        run_id: &str,
    ) -> Result<DataSourceRun, RemoteError> {
        let mut state = lock(&self.state)?;
        state.faults.take("get_data_source_run")?;
        let entry = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| RemoteError::not_found(format!("run {run_id}")))?;
        if entry.observed {
            entry.script.advance();
        }
        entry.observed = true;
        state
            .run_view(run_id)
            .ok_or_else(|| RemoteError::not_found(format!("run {run_id}")))
    }

    async fn latest_data_source_run(
        &self,
        _domain_id: &str,
        data_source_id: &str,
    ) -> Result<Option<DataSourceRun>, RemoteError> {
        let mut state = lock(&self.state)?;
        state.faults.take("latest_data_source_run")?;
        let latest = state
            .run_order
            .iter()
            .rev()
            .find(|id| {
                state
                    .runs
                    .get(*id)
                    .is_some_and(|run| run.data_source_id == data_source_id)
            })
            .cloned();
        Ok(latest.and_then(|id| state.run_view(&id)))
    }
}

// ---------------------------------------------------------------------------
// Crawler
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CrawlerEntry {
    spec: CrawlerSpec,
    crawl: Option<(StatusScript, bool)>,
}

#[derive(Debug, Default)]
struct CrawlerServiceState {
    connections: HashMap<String, ConnectionSpec>,
    databases: HashSet<String>,
    crawlers: HashMap<String, CrawlerEntry>,
    crawl_script: Option<Vec<RunStatus>>,
    connection_creates: usize,
    database_creates: usize,
    crawler_creates: usize,
    crawler_starts: usize,
    faults: FaultPlan,
}

#[derive(Debug, Default)]
pub struct MemoryCrawlerService {
    state: Mutex<CrawlerServiceState>,
}

impl MemoryCrawlerService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, operation: &'static str, error: RemoteError) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.push(operation, error);
        }
    }

    /// Status sequence reported by crawls started from now on.
    pub fn script_crawls(&self, statuses: &[RunStatus]) {
        if let Ok(mut state) = self.state.lock() {
            state.crawl_script = Some(statuses.to_vec());
        }
    }

    pub fn connection_creates(&self) -> usize {
        self.state.lock().map(|s| s.connection_creates).unwrap_or(0)
    }

    pub fn database_creates(&self) -> usize {
        self.state.lock().map(|s| s.database_creates).unwrap_or(0)
    }

    pub fn crawler_creates(&self) -> usize {
        self.state.lock().map(|s| s.crawler_creates).unwrap_or(0)
    }

    pub fn crawler_starts(&self) -> usize {
        self.state.lock().map(|s| s.crawler_starts).unwrap_or(0)
    }

    pub fn has_connection(&self, name: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.connections.contains_key(name))
            .unwrap_or(false)
    }

    pub fn has_crawler(&self, name: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.crawlers.contains_key(name))
            .unwrap_or(false)
    }
}

#[async_trait]
impl CrawlerService for MemoryCrawlerService {
    async fn create_connection(&self, spec: &ConnectionSpec) -> Result<(), RemoteError> {
        let mut state = lock(&self.state)?;
        state.faults.take("create_connection")?;
        if state.connections.contains_key(&spec.name) {
            return Err(RemoteError::AlreadyExists {
                resource: format!("connection {}", spec.name),
            });
        }
        state.connection_creates += 1;
        state.connections.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn delete_connection(&self, name: &str) -> Result<(), RemoteError> {
        let mut state = lock(&self.state)?;
        state.faults.take("delete_connection")?;
        state
            .connections
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RemoteError::not_found(format!("connection {name}")))
    }

    async fn create_database(&self, name: &str) -> Result<(), RemoteError> {
        let mut state = lock(&self.state)?;
        state.faults.take("create_database")?;
        if !state.databases.insert(name.to_string()) {
            return Err(RemoteError::AlreadyExists {
                resource: format!("database {name}"),
            });
        }
        state.database_creates += 1;
        Ok(())
    }

    async fn create_crawler(&self, spec: &CrawlerSpec) -> Result<(), RemoteError> {
        let mut state = lock(&self.state)?;
        state.faults.take("create_crawler")?;
        if state.crawlers.contains_key(&spec.name) {
            return Err(RemoteError::AlreadyExists {
                resource: format!("crawler {}", spec.name),
            });
        }
        state.crawler_creates += 1;
        state.crawlers.insert(
            spec.name.clone(),
            CrawlerEntry {
                spec: spec.clone(),
                crawl: None,
            },
        );
        Ok(())
    }

    async fn start_crawler(&self, name: &str) -> Result<(), RemoteError> {
        let mut state = lock(&self.state)?;
        state.faults.take("start_crawler")?;
        let script = state.crawl_script.clone().unwrap_or_else(default_script);
        let entry = state
            .crawlers
            .get_mut(name)
            .ok_or_else(|| RemoteError::not_found(format!("crawler {name}")))?;
        if let Some((crawl, _)) = &entry.crawl {
            if crawl.current() == RunStatus::Running {
                return Err(RemoteError::Conflict {
                    resource: format!("crawler {name} is already running"),
                });
            }
        }
        entry.crawl = Some((StatusScript::new(&script), false));
        state.crawler_starts += 1;
        Ok(())
    }

    async fn get_crawler_state(&self, name: &str) -> Result<CrawlerState, RemoteError> {
        let mut state = lock(&self.state)?;
        state.faults.take("get_crawler_state")?;
        let entry = state
            .crawlers
            .get_mut(name)
            .ok_or_else(|| RemoteError::not_found(format!("crawler {name}")))?;
        let Some((crawl, observed)) = entry.crawl.as_mut() else {
            return Ok(CrawlerState {
                status: None,
                tables: Vec::new(),
            });
        };
        let status = if *observed { crawl.advance() } else { crawl.current() };
        *observed = true;
        let tables = if status == RunStatus::Succeeded {
            vec![entry.spec.target.table_name()]
        } else {
            Vec::new()
        };
        Ok(CrawlerState {
            status: Some(status),
            tables,
        })
    }

    async fn delete_crawler(&self, name: &str) -> Result<(), RemoteError> {
        let mut state = lock(&self.state)?;
        state.faults.take("delete_crawler")?;
        state
            .crawlers
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RemoteError::not_found(format!("crawler {name}")))
    }
}

// ---------------------------------------------------------------------------
// Profiling
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct JobEntry {
    output_location: String,
    runs: Vec<(String, StatusScript, bool)>,
}

#[derive(Debug, Default)]
struct ProfilingState {
    datasets: HashMap<String, DatasetSpec>,
    jobs: HashMap<String, JobEntry>,
    job_script: Option<Vec<RunStatus>>,
    next_run: u32,
    dataset_creates: usize,
    job_creates: usize,
    job_starts: usize,
    faults: FaultPlan,
}

#[derive(Debug, Default)]
pub struct MemoryProfilingService {
    state: Mutex<ProfilingState>,
}

impl MemoryProfilingService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, operation: &'static str, error: RemoteError) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.push(operation, error);
        }
    }

    /// Status sequence reported by job runs started from now on.
    pub fn script_runs(&self, statuses: &[RunStatus]) {
        if let Ok(mut state) = self.state.lock() {
            state.job_script = Some(statuses.to_vec());
        }
    }

    pub fn dataset_creates(&self) -> usize {
        self.state.lock().map(|s| s.dataset_creates).unwrap_or(0)
    }

    pub fn job_creates(&self) -> usize {
        self.state.lock().map(|s| s.job_creates).unwrap_or(0)
    }

    pub fn job_starts(&self) -> usize {
        self.state.lock().map(|s| s.job_starts).unwrap_or(0)
    }

    pub fn has_job(&self, name: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.jobs.contains_key(name))
            .unwrap_or(false)
    }

    fn create_job(
        &self,
        operation: &'static str,
        name: &str,
        output_location: &str,
    ) -> Result<(), RemoteError> {
        let mut state = lock(&self.state)?;
        state.faults.take(operation)?;
        if state.jobs.contains_key(name) {
            return Err(RemoteError::AlreadyExists {
                resource: format!("job {name}"),
            });
        }
        state.job_creates += 1;
        state.jobs.insert(
            name.to_string(),
            JobEntry {
                output_location: output_location.to_string(),
                runs: Vec::new(),
            },
        );
        Ok(())
    }
}

fn job_run_view(job_name: &str, entry: &JobEntry, run_id: &str, status: RunStatus) -> JobRun {
    JobRun {
        id: run_id.to_string(),
        job_name: job_name.to_string(),
        status,
        output_location: (status == RunStatus::Succeeded).then(|| entry.output_location.clone()),
        error_message: (status == RunStatus::Failed).then(|| format!("job run {run_id} failed")),
    }
}

#[async_trait]
impl ProfilingService for MemoryProfilingService {
    async fn create_dataset(&self, spec: &DatasetSpec) -> Result<(), RemoteError> {
        let mut state = lock(&self.state)?;
        state.faults.take("create_dataset")?;
        if state.datasets.contains_key(&spec.name) {
            return Err(RemoteError::AlreadyExists {
                resource: format!("dataset {}", spec.name),
            });
        }
        state.dataset_creates += 1;
        state.datasets.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn create_profile_job(&self, spec: &ProfileJobSpec) -> Result<(), RemoteError> {
        if !lock(&self.state)?.datasets.contains_key(&spec.dataset_name) {
            return Err(RemoteError::not_found(format!("dataset {}", spec.dataset_name)));
        }
        self.create_job("create_profile_job", &spec.name, &spec.output_location)
    }

    async fn create_recipe_job(&self, spec: &RecipeJobSpec) -> Result<(), RemoteError> {
        if !lock(&self.state)?.datasets.contains_key(&spec.dataset_name) {
            return Err(RemoteError::not_found(format!("dataset {}", spec.dataset_name)));
        }
        self.create_job("create_recipe_job", &spec.name, &spec.output_location)
    }

    async fn start_job_run(&self, job_name: &str) -> Result<JobRun, RemoteError> {
        let mut state = lock(&self.state)?;
        state.faults.take("start_job_run")?;
        let script = state.job_script.clone().unwrap_or_else(default_script);
        let run_id = format!("jr-{}", state.next_run);
        let entry = state
            .jobs
            .get_mut(job_name)
            .ok_or_else(|| RemoteError::not_found(format!("job {job_name}")))?;
        if entry
            .runs
            .iter()
            .any(|(_, run, _)| run.current() == RunStatus::Running)
        {
            return Err(RemoteError::Conflict {
                resource: format!("job {job_name} run"),
            });
        }
        let script = StatusScript::new(&script);
        let status = script.current();
        entry.runs.push((run_id.clone(), script, false));
        let view = job_run_view(job_name, entry, &run_id, status);
        state.next_run += 1;
        state.job_starts += 1;
        Ok(view)
    }

    async fn get_job_run(&self, job_name: &str, run_id: &str) -> Result<JobRun, RemoteError> {
        let mut state = lock(&self.state)?;
        state.faults.take("get_job_run")?;
        let entry = state
            .jobs
            .get_mut(job_name)
            .ok_or_else(|| RemoteError::not_found(format!("job {job_name}")))?;
        let (_, script, observed) = entry
            .runs
            .iter_mut()
            .find(|(id, _, _)| id == run_id)
            .ok_or_else(|| RemoteError::not_found(format!("job run {run_id}")))?;
        let status = if *observed { script.advance() } else { script.current() };
        *observed = true;
        Ok(job_run_view(job_name, entry, run_id, status))
    }

    async fn latest_job_run(&self, job_name: &str) -> Result<Option<JobRun>, RemoteError> {
        let mut state = lock(&self.state)?;
        state.faults.take("latest_job_run")?;
        let Some(entry) = state.jobs.get(job_name) else {
            return Ok(None);
        };
        Ok(entry
            .runs
            .last()
            .map(|(id, script, _)| job_run_view(job_name, entry, id, script.current())))
    }
}

// ---------------------------------------------------------------------------
// Asset records
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryAssetRepository {
    records: RwLock<HashMap<String, AssetRecord>>,
}

impl MemoryAssetRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AssetRepository for MemoryAssetRepository {
    async fn save(&self, record: AssetRecord) -> Result<(), RemoteError> {
        self.records
            .write()
            .map_err(|_| poisoned())?
            .insert(record.asset_id.clone(), record);
        Ok(())
    }

    async fn get(&self, asset_id: &str) -> Result<Option<AssetRecord>, RemoteError> {
        Ok(self
            .records
            .read()
            .map_err(|_| poisoned())?
            .get(asset_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{CrawlTarget, DataSourceConfiguration};

    fn glue_spec(project_id: &str) -> DataSourceSpec {
        DataSourceSpec {
            project_id: project_id.to_string(),
            name: "a1-source".to_string(),
            configuration: DataSourceConfiguration::Glue {
                database: "a1_db".to_string(),
                table: None,
            },
        }
    }

    #[tokio::test]
    async fn test_run_script_advances_on_each_poll() {
        let catalog = MemoryCatalogService::new();
        catalog.script_runs(&[RunStatus::Running, RunStatus::Running, RunStatus::Succeeded]);
        let ds = catalog.create_data_source("D1", &glue_spec("proj-1")).await.unwrap();
        let run = catalog.start_data_source_run("D1", &ds.id).await.unwrap();
        assert_eq!(run.id, "R1");
        assert_eq!(run.status, RunStatus::Running);

        let mut statuses = Vec::new();
        for _ in 0..4 {
            statuses.push(catalog.get_data_source_run("D1", &run.id).await.unwrap().status);
        }
        assert_eq!(
            statuses,
            vec![RunStatus::Running, RunStatus::Running, RunStatus::Succeeded, RunStatus::Succeeded]
        );
    }

    #[tokio::test]
    async fn test_second_start_while_running_conflicts() {
        let catalog = MemoryCatalogService::new();
        let ds = catalog.create_data_source("D1", &glue_spec("proj-1")).await.unwrap();
        catalog.start_data_source_run("D1", &ds.id).await.unwrap();

        let err = catalog.start_data_source_run("D1", &ds.id).await.unwrap_err();
        assert!(matches!(err, RemoteError::Conflict { .. }));
        assert_eq!(catalog.run_starts(), 1);
    }

    #[tokio::test]
    async fn test_injected_fault_fires_once() {
        let catalog = MemoryCatalogService::new();
        catalog.fail_next(
            "find_project",
            RemoteError::Throttled {
                service: "catalog".into(),
                message: "rate".into(),
            },
        );
        assert!(catalog.find_project("D1", "P1").await.is_err());
        assert!(catalog.find_project("D1", "P1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_crawler_conflict_and_tables() {
        let crawler = MemoryCrawlerService::new();
        crawler
            .create_crawler(&CrawlerSpec {
                name: "a1-crawler".into(),
                database: "a1_db".into(),
                target: CrawlTarget::ObjectStore {
                    path: "s3://bucket/raw/".into(),
                },
            })
            .await
            .unwrap();
        crawler.start_crawler("a1-crawler").await.unwrap();
        assert!(matches!(
            crawler.start_crawler("a1-crawler").await,
            Err(RemoteError::Conflict { .. })
        ));

        let first = crawler.get_crawler_state("a1-crawler").await.unwrap();
        assert_eq!(first.status, Some(RunStatus::Running));
        let second = crawler.get_crawler_state("a1-crawler").await.unwrap();
        assert_eq!(second.status, Some(RunStatus::Succeeded));
        assert_eq!(second.tables, vec!["raw".to_string()]);
    }
}
