//! Cross-account event envelope and its typed classification.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::RelayConfig;

/// EventBridge-shaped envelope carried between the hub and spoke buses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub id: String,
    pub source: String,
    #[serde(rename = "detail-type")]
    pub detail_type: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub detail: Value,
}

impl RelayEnvelope {
    pub fn new<T: Serialize>(
        source: impl Into<String>,
        detail_type: impl Into<String>,
        detail: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            detail_type: detail_type.into(),
            time: Utc::now(),
            detail: serde_json::to_value(detail)?,
        })
    }
}

/// Hub to spoke: a payload is ready for enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffDetail {
    pub asset_id: String,
    pub full_payload_signed_url: String,
    pub data_source_run_id: String,
}

/// Spoke to hub: enrichment finished, successfully or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionDetail {
    pub asset_id: String,
    pub full_payload_signed_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source_run_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    HandoffRequested(HandoffDetail),
    EnrichmentCompleted(CompletionDetail),
    EnrichmentFailed(CompletionDetail),
    Unhandled {
        source: String,
        detail_type: String,
        reason: String,
    },
}

impl RelayEvent {
    /// Map an envelope to the event it carries. Unknown `(source,
    /// detail-type)` pairs and malformed details are `Unhandled`.
    pub fn classify(envelope: &RelayEnvelope, config: &RelayConfig) -> RelayEvent {
        let source = envelope.source.as_str();
        let detail_type = envelope.detail_type.as_str();

        if source == config.hub_source && detail_type == config.handoff_detail_type {
            return parse_detail(envelope, RelayEvent::HandoffRequested);
        }
        if source == config.spoke_source && detail_type == config.completed_detail_type {
            return parse_detail(envelope, RelayEvent::EnrichmentCompleted);
        }
        if source == config.spoke_source && detail_type == config.failed_detail_type {
            return parse_detail(envelope, RelayEvent::EnrichmentFailed);
        }

        RelayEvent::Unhandled {
            source: envelope.source.clone(),
            detail_type: envelope.detail_type.clone(),
            reason: "no route for source and detail-type".to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RelayEvent::HandoffRequested(_) => "HandoffRequested",
            RelayEvent::EnrichmentCompleted(_) => "EnrichmentCompleted",
            RelayEvent::EnrichmentFailed(_) => "EnrichmentFailed",
            RelayEvent::Unhandled { .. } => "Unhandled",
        }
    }
}

fn parse_detail<T, F>(envelope: &RelayEnvelope, wrap: F) -> RelayEvent
where
    T: DeserializeOwned,
    F: FnOnce(T) -> RelayEvent,
{
    match serde_json::from_value::<T>(envelope.detail.clone()) {
        Ok(detail) => wrap(detail),
        Err(e) => RelayEvent::Unhandled {
            source: envelope.source.clone(),
            detail_type: envelope.detail_type.clone(),
            reason: format!("malformed detail: {e}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(source: &str, detail_type: &str, detail: Value) -> RelayEnvelope {
        RelayEnvelope {
            id: "evt-1".into(),
            source: source.into(),
            detail_type: detail_type.into(),
            time: Utc::now(),
            detail,
        }
    }

    #[test]
    fn test_classify_handoff() {
        let config = RelayConfig::default();
        let event = RelayEvent::classify(
            &envelope(
                "datalake.hub.orchestration",
                "Enrichment Requested",
                json!({
                    "assetId": "A1",
                    "fullPayloadSignedUrl": "memory://b/p?x",
                    "dataSourceRunId": "R1"
                }),
            ),
            &config,
        );
        match event {
            RelayEvent::HandoffRequested(detail) => {
                assert_eq!(detail.asset_id, "A1");
                assert_eq!(detail.data_source_run_id, "R1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_classify_completion_without_run_id() {
        let event = RelayEvent::classify(
            &envelope(
                "datalake.spoke.enrichment",
                "Enrichment Completed",
                json!({"assetId": "A1", "fullPayloadSignedUrl": "memory://b/p"}),
            ),
            &RelayConfig::default(),
        );
        assert!(matches!(
            event,
            RelayEvent::EnrichmentCompleted(ref d) if d.data_source_run_id.is_none()
        ));
    }

    #[test]
    fn test_swapped_source_is_unhandled() {
        let event = RelayEvent::classify(
            &envelope(
                "datalake.spoke.enrichment",
                "Enrichment Requested",
                json!({"assetId": "A1", "fullPayloadSignedUrl": "u", "dataSourceRunId": "R1"}),
            ),
            &RelayConfig::default(),
        );
        assert_eq!(event.name(), "Unhandled");
    }

    #[test]
    fn test_malformed_detail_is_unhandled() {
        let event = RelayEvent::classify(
            &envelope("datalake.hub.orchestration", "Enrichment Requested", json!({"assetId": 7})),
            &RelayConfig::default(),
        );
        match event {
            RelayEvent::Unhandled { reason, .. } => assert!(reason.starts_with("malformed detail")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_envelope_wire_name() {
        let env = RelayEnvelope::new("s", "Enrichment Failed", &json!({})).unwrap();
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["detail-type"], "Enrichment Failed");
    }
}
