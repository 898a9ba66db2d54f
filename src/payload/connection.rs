use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use super::types::ValidationError;

static S3_URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^s3://([a-z0-9][a-z0-9.\-]{1,61}[a-z0-9])/(.+)$").expect("static s3 uri pattern")
});

/// Physical source backing a data asset. Exactly one variant per workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Connection {
    ObjectStoreSource(ObjectStoreSource),
    WarehouseSource(WarehouseSource),
    CatalogTableSource(CatalogTableSource),
}

impl Connection {
    pub fn kind(&self) -> &'static str {
        match self {
            Connection::ObjectStoreSource(_) => "objectStoreSource",
            Connection::WarehouseSource(_) => "warehouseSource",
            Connection::CatalogTableSource(_) => "catalogTableSource",
        }
    }

    pub fn region(&self) -> &str {
        match self {
            Connection::ObjectStoreSource(s) => &s.region,
            Connection::WarehouseSource(s) => &s.region,
            Connection::CatalogTableSource(s) => &s.region,
        }
    }

    /// Check the variant carries the addressing fields every step relies on.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let missing = |field: &'static str, value: &str| {
            if value.trim().is_empty() {
                Err(ValidationError::MissingField(field))
            } else {
                Ok(())
            }
        };
        match self {
            Connection::ObjectStoreSource(s) => {
                missing("connection.bucket", &s.bucket)?;
                missing("connection.key", &s.key)?;
                missing("connection.region", &s.region)
            }
            Connection::WarehouseSource(s) => {
                missing("connection.database", &s.database)?;
                missing("connection.table", &s.table)?;
                missing("connection.region", &s.region)?;
                s.resource_arn().map(drop)
            }
            Connection::CatalogTableSource(s) => {
                missing("connection.database", &s.database)?;
                missing("connection.table", &s.table)?;
                missing("connection.region", &s.region)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStoreSource {
    pub bucket: String,
    pub key: String,
    pub region: String,
}

impl ObjectStoreSource {
    /// Parse an `s3://bucket/key` URI.
    pub fn from_uri(uri: &str, region: &str) -> Result<Self, ValidationError> {
        let captures = S3_URI
            .captures(uri.trim())
            .ok_or_else(|| ValidationError::InvalidField {
                field: "connection.uri",
                reason: format!("expected s3://bucket/key, got '{uri}'"),
            })?;

        Ok(Self {
            bucket: captures[1].to_string(),
            key: captures[2].to_string(),
            region: region.to_string(),
        })
    }

    pub fn uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }

    /// Prefix the crawler points at: the key's parent "directory".
    pub fn crawl_path(&self) -> String {
        match self.key.rsplit_once('/') {
            Some((parent, _)) => format!("s3://{}/{}/", self.bucket, parent),
            None => format!("s3://{}/", self.bucket),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarehouseSource {
    #[serde(default)]
    pub cluster_identifier: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    pub database: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    pub region: String,
}

fn default_schema() -> String {
    "public".to_string()
}

impl WarehouseSource {
    /// Redshift database ARN for the data source.
    ///
    /// Requires both the cluster identifier and the owning account; the asset
    /// name is never a valid substitute.
    pub fn resource_arn(&self) -> Result<String, ValidationError> {
        let cluster = self
            .cluster_identifier
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or(ValidationError::MissingField("connection.clusterIdentifier"))?;
        let account = self
            .account_id
            .as_deref()
            .filter(|a| !a.trim().is_empty())
            .ok_or(ValidationError::MissingField("connection.accountId"))?;

        Ok(format!(
            "arn:aws:redshift:{}:{}:dbname:{}/{}",
            self.region, account, cluster, self.database
        ))
    }

    pub fn jdbc_url(&self) -> Result<String, ValidationError> {
        let cluster = self
            .cluster_identifier
            .as_deref()
            .ok_or(ValidationError::MissingField("connection.clusterIdentifier"))?;
        Ok(format!(
            "jdbc:redshift://{}.{}.redshift.amazonaws.com:5439/{}",
            cluster, self.region, self.database
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogTableSource {
    pub database: String,
    pub table: String,
    pub region: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_s3_uri() {
        let source = ObjectStoreSource::from_uri("s3://bucket/key.csv", "eu-west-1").unwrap();
        assert_eq!(source.bucket, "bucket");
        assert_eq!(source.key, "key.csv");
        assert_eq!(source.uri(), "s3://bucket/key.csv");
        assert_eq!(source.crawl_path(), "s3://bucket/");
    }

    #[test]
    fn test_crawl_path_uses_parent_prefix() {
        let source = ObjectStoreSource::from_uri("s3://sales-data/raw/2024/orders.csv", "us-east-1")
            .unwrap();
        assert_eq!(source.crawl_path(), "s3://sales-data/raw/2024/");
    }

    #[test]
    fn test_reject_non_s3_uri() {
        let result = ObjectStoreSource::from_uri("https://bucket/key.csv", "us-east-1");
        assert!(matches!(result, Err(ValidationError::InvalidField { .. })));
    }

    #[test]
    fn test_redshift_arn_requires_cluster_and_account() {
        let mut source = WarehouseSource {
            cluster_identifier: Some("analytics".to_string()),
            account_id: Some("111122223333".to_string()),
            database: "dev".to_string(),
            schema: "public".to_string(),
            table: "orders".to_string(),
            region: "us-east-1".to_string(),
        };
        assert_eq!(
            source.resource_arn().unwrap(),
            "arn:aws:redshift:us-east-1:111122223333:dbname:analytics/dev"
        );

        source.cluster_identifier = None;
        assert!(matches!(
            source.resource_arn(),
            Err(ValidationError::MissingField("connection.clusterIdentifier"))
        ));
    }

    #[test]
    fn test_connection_is_internally_tagged() {
        let connection = Connection::ObjectStoreSource(ObjectStoreSource {
            bucket: "bucket".to_string(),
            key: "key.csv".to_string(),
            region: "us-east-1".to_string(),
        });
        let value = serde_json::to_value(&connection).unwrap();
        assert_eq!(value["type"], "objectStoreSource");
        assert_eq!(value["bucket"], "bucket");

        let parsed: Connection = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, connection);
    }

    #[test]
    fn test_validate_flags_empty_fields() {
        let connection = Connection::CatalogTableSource(CatalogTableSource {
            database: "sales".to_string(),
            table: " ".to_string(),
            region: "us-east-1".to_string(),
        });
        assert!(matches!(
            connection.validate(),
            Err(ValidationError::MissingField("connection.table"))
        ));
    }

    #[test]
    fn test_validate_requires_warehouse_addressing() {
        let source = WarehouseSource {
            cluster_identifier: Some("analytics".to_string()),
            account_id: None,
            database: "dev".to_string(),
            schema: "public".to_string(),
            table: "orders".to_string(),
            region: "us-east-1".to_string(),
        };
        assert!(matches!(
            Connection::WarehouseSource(source.clone()).validate(),
            Err(ValidationError::MissingField("connection.accountId"))
        ));

        let no_cluster = WarehouseSource {
            cluster_identifier: None,
            account_id: Some("222222222222".to_string()),
            ..source
        };
        assert!(matches!(
            Connection::WarehouseSource(no_cluster).validate(),
            Err(ValidationError::MissingField("connection.clusterIdentifier"))
        ));
    }
}
