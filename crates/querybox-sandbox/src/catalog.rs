//! Resolution of instance identifiers to connection parameters.
//!
//! The executor never sees credentials in requests. It asks an
//! [`InstanceCatalog`] for them at execution time and hands them to the worker
//! over IPC only.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ipc::ConnectionParams;
use crate::result::BackendKind;

const DEFAULT_PG_PORT: u16 = 5432;

/// Why an instance could not be resolved.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CatalogError {
    /// No instance with this identifier.
    #[error("unknown instance '{0}'")]
    UnknownInstance(String),

    /// The instance exists but is a different kind of database.
    #[error("instance '{instance}' is {actual}, not {expected}")]
    KindMismatch {
        /// Instance identifier.
        instance: String,
        /// Kind the request asked for.
        expected: BackendKind,
        /// Kind the catalog holds.
        actual: BackendKind,
    },

    /// A required setting is neither configured nor in the environment.
    #[error("instance '{instance}' has no {what} configured")]
    MissingCredential {
        /// Instance identifier.
        instance: String,
        /// What is missing, e.g. `ANALYTICS_PG_PASSWORD`.
        what: String,
    },
}

/// Looks up connection parameters by instance identifier.
#[async_trait]
pub trait InstanceCatalog: Send + Sync {
    /// Resolve `instance_id`, checking it is a `kind` database.
    async fn resolve(
        &self,
        instance_id: &str,
        kind: BackendKind,
    ) -> Result<ConnectionParams, CatalogError>;

    /// The kind of `instance_id`, if known.
    fn backend_kind(&self, instance_id: &str) -> Option<BackendKind>;
}

/// One configured instance. Credentials may be inline or read from
/// `{credentials_env_prefix}_USER`, `_PASSWORD`, and `_CONNECTION_STRING`.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceEntry {
    /// Backend kind.
    pub kind: Option<BackendKind>,
    /// Relational host.
    #[serde(default)]
    pub host: Option<String>,
    /// Relational port (default 5432).
    #[serde(default)]
    pub port: Option<u16>,
    /// Relational user.
    #[serde(default)]
    pub user: Option<String>,
    /// Relational password.
    #[serde(default)]
    pub password: Option<String>,
    /// Document-store connection URI.
    #[serde(default)]
    pub uri: Option<String>,
    /// Environment variable prefix for credentials.
    #[serde(default)]
    pub credentials_env_prefix: Option<String>,
}

impl std::fmt::Debug for InstanceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceEntry")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("uri", &self.uri.as_ref().map(|_| "***"))
            .field("credentials_env_prefix", &self.credentials_env_prefix)
            .finish()
    }
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// A fixed set of instances, typically loaded from configuration.
#[derive(Clone)]
pub struct StaticCatalog {
    instances: BTreeMap<String, InstanceEntry>,
    env: EnvLookup,
}

impl StaticCatalog {
    /// Catalog over `instances`, reading credentials from the process environment.
    pub fn new(instances: BTreeMap<String, InstanceEntry>) -> Self {
        Self {
            instances,
            env: Arc::new(|key| std::env::var(key).ok()),
        }
    }

    /// Replace the environment lookup.
    pub fn with_env_lookup(
        mut self,
        lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.env = Arc::new(lookup);
        self
    }

    /// Instance identifiers, sorted.
    pub fn instance_ids(&self) -> impl Iterator<Item = &str> {
        self.instances.keys().map(String::as_str)
    }

    fn setting(
        &self,
        instance: &str,
        inline: Option<&String>,
        prefix: Option<&String>,
        suffix: &str,
    ) -> Result<String, CatalogError> {
        if let Some(value) = inline {
            return Ok(value.clone());
        }
        let Some(prefix) = prefix else {
            return Err(CatalogError::MissingCredential {
                instance: instance.to_string(),
                what: suffix.trim_start_matches('_').to_ascii_lowercase(),
            });
        };
        let key = format!("{prefix}{suffix}");
        (self.env)(&key).ok_or(CatalogError::MissingCredential {
            instance: instance.to_string(),
            what: key,
        })
    }
}

#[async_trait]
impl InstanceCatalog for StaticCatalog {
    async fn resolve(
        &self,
        instance_id: &str,
        kind: BackendKind,
    ) -> Result<ConnectionParams, CatalogError> {
        let entry = self
            .instances
            .get(instance_id)
            .ok_or_else(|| CatalogError::UnknownInstance(instance_id.to_string()))?;
        let actual = entry.kind.unwrap_or(kind);
        if actual != kind {
            return Err(CatalogError::KindMismatch {
                instance: instance_id.to_string(),
                expected: kind,
                actual,
            });
        }

        let prefix = entry.credentials_env_prefix.as_ref();
        match kind {
            BackendKind::Relational => {
                let host = entry.host.clone().ok_or(CatalogError::MissingCredential {
                    instance: instance_id.to_string(),
                    what: "host".into(),
                })?;
                Ok(ConnectionParams::Relational {
                    host,
                    port: entry.port.unwrap_or(DEFAULT_PG_PORT),
                    user: self.setting(instance_id, entry.user.as_ref(), prefix, "_USER")?,
                    password: self.setting(
                        instance_id,
                        entry.password.as_ref(),
                        prefix,
                        "_PASSWORD",
                    )?,
                })
            }
            BackendKind::Document => Ok(ConnectionParams::Document {
                uri: self.setting(
                    instance_id,
                    entry.uri.as_ref(),
                    prefix,
                    "_CONNECTION_STRING",
                )?,
            }),
        }
    }

    fn backend_kind(&self, instance_id: &str) -> Option<BackendKind> {
        self.instances.get(instance_id).and_then(|e| e.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> StaticCatalog {
        let mut instances = BTreeMap::new();
        instances.insert(
            "analytics-pg".to_string(),
            InstanceEntry {
                kind: Some(BackendKind::Relational),
                host: Some("db.internal".into()),
                credentials_env_prefix: Some("ANALYTICS_PG".into()),
                ..Default::default()
            },
        );
        instances.insert(
            "events-mongo".to_string(),
            InstanceEntry {
                kind: Some(BackendKind::Document),
                credentials_env_prefix: Some("EVENTS_MONGO".into()),
                ..Default::default()
            },
        );
        StaticCatalog::new(instances).with_env_lookup(|key| match key {
            "ANALYTICS_PG_USER" => Some("reader".into()),
            "ANALYTICS_PG_PASSWORD" => Some("s3cret".into()),
            "EVENTS_MONGO_CONNECTION_STRING" => Some("mongodb://events:27017".into()),
            _ => None,
        })
    }

    #[tokio::test]
    async fn resolves_relational_from_env_prefix() {
        let params = catalog()
            .resolve("analytics-pg", BackendKind::Relational)
            .await
            .unwrap();
        assert_eq!(
            params,
            ConnectionParams::Relational {
                host: "db.internal".into(),
                port: 5432,
                user: "reader".into(),
                password: "s3cret".into(),
            }
        );
    }

    #[tokio::test]
    async fn resolves_document_uri() {
        let params = catalog()
            .resolve("events-mongo", BackendKind::Document)
            .await
            .unwrap();
        assert_eq!(
            params,
            ConnectionParams::Document {
                uri: "mongodb://events:27017".into()
            }
        );
    }

    #[tokio::test]
    async fn rejects_unknown_and_mismatched() {
        let catalog = catalog();
        assert_eq!(
            catalog.resolve("nope", BackendKind::Relational).await,
            Err(CatalogError::UnknownInstance("nope".into()))
        );
        assert!(matches!(
            catalog.resolve("events-mongo", BackendKind::Relational).await,
            Err(CatalogError::KindMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn missing_env_credential_names_the_variable() {
        let catalog = catalog().with_env_lookup(|_| None);
        let err = catalog
            .resolve("analytics-pg", BackendKind::Relational)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ANALYTICS_PG_USER"), "{err}");
    }

    #[test]
    fn debug_hides_secrets() {
        let entry = InstanceEntry {
            password: Some("hunter2".into()),
            uri: Some("mongodb://u:p@h".into()),
            ..Default::default()
        };
        let text = format!("{entry:?}");
        assert!(!text.contains("hunter2"));
        assert!(!text.contains("u:p@h"));
    }
}
