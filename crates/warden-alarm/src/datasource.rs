//! Datasources — where alarm checks get their JSON documents from.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use ::http::Method;
use regex::{Captures, Regex};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use warden_state::DataSourceInstance;

use crate::http::{self, HttpError, HttpRequest};
use crate::parse_duration;

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised while fetching a datasource document.
#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("datasource {0:?} is not configured")]
    Unknown(String),

    #[error("datasource {datasource:?} is missing metadata key {key:?}")]
    MissingMetadata { datasource: String, key: String },

    #[error("datasource {datasource:?} has invalid metadata: {reason}")]
    InvalidMetadata { datasource: String, reason: String },

    #[error("datasource {datasource:?} returned invalid JSON: {reason}")]
    InvalidJson { datasource: String, reason: String },

    #[error("datasource {datasource:?}: {source}")]
    Http {
        datasource: String,
        #[source]
        source: HttpError,
    },
}

/// Fetches the JSON document behind a datasource instance.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn fetch(&self, instance: &DataSourceInstance) -> Result<Value, DataSourceError>;
}

/// HTTP datasource.
///
/// Metadata keys: `url` (required), `method` (default `GET`), `body`,
/// `timeout` (e.g. `"5s"`). Defaults registered with
/// [`HttpDataSource::with_datasource`] are merged under the metadata carried
/// by the alarm, and `{key}` placeholders in `url` and `body` are replaced
/// by the merged metadata values (e.g. `{instance}`).
#[derive(Debug, Clone, Default)]
pub struct HttpDataSource {
    defaults: HashMap<String, BTreeMap<String, String>>,
}

impl HttpDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register default metadata for the datasource called `name`.
    pub fn with_datasource(mut self, name: &str, metadata: BTreeMap<String, String>) -> Self {
        self.defaults.insert(name.to_string(), metadata);
        self
    }

    /// Build the HTTP request for an instance.
    pub fn request_for(&self, instance: &DataSourceInstance) -> Result<HttpRequest, DataSourceError> {
        let mut metadata = self.defaults.get(&instance.name).cloned().unwrap_or_default();
        metadata.extend(instance.metadata.clone());

        let invalid = |reason: String| DataSourceError::InvalidMetadata {
            datasource: instance.name.clone(),
            reason,
        };

        let url = match metadata.get("url") {
            Some(url) if !url.is_empty() => interpolate(url, &metadata).map_err(invalid)?,
            _ => {
                return Err(if self.defaults.contains_key(&instance.name) || !instance.metadata.is_empty() {
                    DataSourceError::MissingMetadata {
                        datasource: instance.name.clone(),
                        key: "url".to_string(),
                    }
                } else {
                    DataSourceError::Unknown(instance.name.clone())
                });
            }
        };

        let method = match metadata.get("method").map(|m| m.trim()) {
            None | Some("") => Method::GET,
            Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .map_err(|e| invalid(format!("method {m:?}: {e}")))?,
        };

        let timeout = match metadata.get("timeout") {
            Some(t) => parse_duration(t).ok_or_else(|| invalid(format!("timeout {t:?}")))?,
            None => DEFAULT_FETCH_TIMEOUT,
        };

        let mut request = HttpRequest::new(method, url, timeout);
        if let Some(body) = metadata.get("body").filter(|b| !b.is_empty()) {
            request = request.body(interpolate(body, &metadata).map_err(invalid)?);
        }
        Ok(request)
    }
}

#[async_trait]
impl DataSource for HttpDataSource {
    async fn fetch(&self, instance: &DataSourceInstance) -> Result<Value, DataSourceError> {
        let request = self.request_for(instance)?;
        debug!(datasource = %instance.name, url = %request.url, "fetching datasource");
        let bytes = http::send(&request)
            .await
            .map_err(|source| DataSourceError::Http {
                datasource: instance.name.clone(),
                source,
            })?;
        serde_json::from_slice(&bytes).map_err(|e| DataSourceError::InvalidJson {
            datasource: instance.name.clone(),
            reason: e.to_string(),
        })
    }
}

/// Datasource answering with fixed documents, keyed by datasource name.
#[derive(Debug, Clone, Default)]
pub struct StaticDataSource {
    documents: HashMap<String, Value>,
}

impl StaticDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(mut self, name: &str, document: Value) -> Self {
        self.documents.insert(name.to_string(), document);
        self
    }
}

#[async_trait]
impl DataSource for StaticDataSource {
    async fn fetch(&self, instance: &DataSourceInstance) -> Result<Value, DataSourceError> {
        self.documents
            .get(&instance.name)
            .cloned()
            .ok_or_else(|| DataSourceError::Unknown(instance.name.clone()))
    }
}

const PLACEHOLDER: &str = r"\{([^{}]+)\}";

/// Replace `{key}` with `values[key]` in a single pass; substituted values
/// are not rescanned. Unknown placeholders, `{url}` and `{body}` are left
/// as is.
fn interpolate(template: &str, values: &BTreeMap<String, String>) -> Result<String, String> {
    let placeholder = Regex::new(PLACEHOLDER).map_err(|e| e.to_string())?;
    let out = placeholder.replace_all(template, |caps: &Captures| {
        let key = &caps[1];
        match values.get(key) {
            Some(value) if key != "url" && key != "body" => value.clone(),
            _ => caps[0].to_string(),
        }
    });
    Ok(out.into_owned())
}
