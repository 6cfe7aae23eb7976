use std::{collections::BTreeSet, sync::OnceLock};

use serde::{Deserialize, Serialize};

use crate::validate_event_type;

const REALTIME_EVENT_MANIFEST_JSON: &str = include_str!("events/realtime_events_manifest.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RealtimeEventScope {
    Connection,
    Conversation,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RealtimeEventLifecycle {
    #[default]
    Active,
    Deprecated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RealtimeEventManifestEntry {
    pub event_type: String,
    pub schema_version: u16,
    pub scope: RealtimeEventScope,
    #[serde(default)]
    pub lifecycle: RealtimeEventLifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RealtimeEventManifest {
    pub events: Vec<RealtimeEventManifestEntry>,
}

impl RealtimeEventManifest {
    #[must_use]
    pub fn get(&self, event_type: &str) -> Option<&RealtimeEventManifestEntry> {
        self.events
            .iter()
            .find(|entry| entry.event_type == event_type)
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RealtimeEventManifestError {
    #[error("invalid manifest json")]
    InvalidJson,
    #[error("realtime event type `{0}` failed identifier validation")]
    InvalidEventType(String),
    #[error("duplicate realtime event type `{0}` in manifest")]
    DuplicateEventType(String),
    #[error("realtime event `{event_type}` has invalid schema version {schema_version}")]
    InvalidSchemaVersion {
        event_type: String,
        schema_version: u16,
    },
    #[error("realtime event `{event_type}` is deprecated and must include a migration note")]
    MissingDeprecatedMigration { event_type: String },
    #[error("realtime event `{event_type}` is active but includes migration note")]
    UnexpectedActiveMigration { event_type: String },
}

impl From<serde_json::Error> for RealtimeEventManifestError {
    fn from(_: serde_json::Error) -> Self {
        Self::InvalidJson
    }
}

/// Parse and validate a realtime event manifest.
///
/// # Errors
/// Returns [`RealtimeEventManifestError`] when JSON is invalid or when manifest
/// invariants fail (identifier format, duplicates, schema version, lifecycle metadata).
pub fn parse_realtime_event_manifest(
    json: &str,
) -> Result<RealtimeEventManifest, RealtimeEventManifestError> {
    let manifest: RealtimeEventManifest = serde_json::from_str(json)?;
    validate_realtime_event_manifest(&manifest)?;
    Ok(manifest)
}

/// Return the embedded realtime event manifest, parsed once.
///
/// # Errors
/// Returns the validation error of the embedded manifest file.
pub fn realtime_event_manifest(
) -> Result<&'static RealtimeEventManifest, RealtimeEventManifestError> {
    static MANIFEST: OnceLock<Result<RealtimeEventManifest, RealtimeEventManifestError>> =
        OnceLock::new();
    MANIFEST
        .get_or_init(|| parse_realtime_event_manifest(REALTIME_EVENT_MANIFEST_JSON))
        .as_ref()
        .map_err(Clone::clone)
}

fn validate_realtime_event_manifest(
    manifest: &RealtimeEventManifest,
) -> Result<(), RealtimeEventManifestError> {
    let mut seen = BTreeSet::new();

    for entry in &manifest.events {
        validate_event_type(&entry.event_type)
            .map_err(|_| RealtimeEventManifestError::InvalidEventType(entry.event_type.clone()))?;

        if entry.schema_version == 0 {
            return Err(RealtimeEventManifestError::InvalidSchemaVersion {
                event_type: entry.event_type.clone(),
                schema_version: entry.schema_version,
            });
        }

        if !seen.insert(entry.event_type.clone()) {
            return Err(RealtimeEventManifestError::DuplicateEventType(
                entry.event_type.clone(),
            ));
        }

        match entry.lifecycle {
            RealtimeEventLifecycle::Active if entry.migration.is_some() => {
                return Err(RealtimeEventManifestError::UnexpectedActiveMigration {
                    event_type: entry.event_type.clone(),
                });
            }
            RealtimeEventLifecycle::Deprecated
                if entry
                    .migration
                    .as_ref()
                    .is_none_or(|value| value.trim().is_empty()) =>
            {
                return Err(RealtimeEventManifestError::MissingDeprecatedMigration {
                    event_type: entry.event_type.clone(),
                });
            }
            RealtimeEventLifecycle::Active | RealtimeEventLifecycle::Deprecated => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        parse_realtime_event_manifest, realtime_event_manifest, RealtimeEventManifestError,
        RealtimeEventScope,
    };
    use crate::{
        CONNECTION_ESTABLISHED_EVENT, MESSAGE_DELETED_EVENT, MESSAGE_EDITED_EVENT,
        MESSAGE_NEW_EVENT, SUBSCRIPTION_ERROR_EVENT, SUBSCRIPTION_SUCCEEDED_EVENT,
    };

    #[test]
    fn embedded_manifest_lists_every_emitted_event() {
        let manifest = realtime_event_manifest().unwrap();
        for event_type in [MESSAGE_NEW_EVENT, MESSAGE_EDITED_EVENT, MESSAGE_DELETED_EVENT] {
            assert_eq!(
                manifest.get(event_type).unwrap().scope,
                RealtimeEventScope::Conversation
            );
        }
        for event_type in [
            CONNECTION_ESTABLISHED_EVENT,
            SUBSCRIPTION_SUCCEEDED_EVENT,
            SUBSCRIPTION_ERROR_EVENT,
        ] {
            assert_eq!(
                manifest.get(event_type).unwrap().scope,
                RealtimeEventScope::Connection
            );
        }
    }

    #[test]
    fn parse_rejects_deprecated_event_without_migration() {
        let error = parse_realtime_event_manifest(
            r#"{"events":[{"event_type":"message:new","schema_version":1,"scope":"conversation","lifecycle":"deprecated"}]}"#,
        )
        .expect_err("deprecated event without migration must fail");

        assert_eq!(
            error,
            RealtimeEventManifestError::MissingDeprecatedMigration {
                event_type: String::from("message:new"),
            }
        );
    }

    #[test]
    fn parse_rejects_duplicate_event_types() {
        let error = parse_realtime_event_manifest(
            r#"{"events":[{"event_type":"message:new","schema_version":1,"scope":"conversation"},{"event_type":"message:new","schema_version":1,"scope":"conversation"}]}"#,
        )
        .expect_err("duplicate event types must fail");

        assert_eq!(
            error,
            RealtimeEventManifestError::DuplicateEventType(String::from("message:new"))
        );
    }

    #[test]
    fn parse_rejects_zero_schema_version() {
        let error = parse_realtime_event_manifest(
            r#"{"events":[{"event_type":"message:new","schema_version":0,"scope":"conversation"}]}"#,
        )
        .expect_err("schema version zero must fail");

        assert!(matches!(
            error,
            RealtimeEventManifestError::InvalidSchemaVersion { .. }
        ));
    }
}
