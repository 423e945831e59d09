//! Alarm condition check: fetch every datasource, then evaluate.

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use warden_expr::{Evaluator, ExprError};
use warden_state::Alarm;

use crate::datasource::{DataSource, DataSourceError};

/// Key under which the primary datasource document is exposed.
pub const PRIMARY_KEY: &str = "data";

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("alarm {0:?} has no datasources")]
    NoDataSources(String),

    #[error(transparent)]
    DataSource(#[from] DataSourceError),

    #[error("evaluating {expression:?}: {source}")]
    Evaluation {
        expression: String,
        #[source]
        source: ExprError,
    },
}

/// Whether the alarm's condition currently holds.
///
/// Reads no event history and has no side effects beyond the fetches.
pub async fn check(
    alarm: &Alarm,
    datasource: &dyn DataSource,
    evaluator: &dyn Evaluator,
) -> Result<bool, CheckError> {
    let document = fetch_document(alarm, datasource).await?;
    let result = evaluator
        .evaluate(&alarm.expression, &document)
        .map_err(|source| CheckError::Evaluation {
            expression: alarm.expression.clone(),
            source,
        })?;
    debug!(alarm = %alarm.name, result, "alarm checked");
    Ok(result)
}

/// Build the evaluation document: each datasource under its own name and
/// the first one also under `data`.
pub async fn fetch_document(alarm: &Alarm, datasource: &dyn DataSource) -> Result<Value, CheckError> {
    let mut document = Map::new();
    let mut primary = None;
    for instance in &alarm.data_sources {
        let doc = datasource.fetch(instance).await?;
        if primary.is_none() {
            primary = Some(doc.clone());
        }
        document.insert(instance.name.clone(), doc);
    }
    let primary = primary.ok_or_else(|| CheckError::NoDataSources(alarm.name.clone()))?;
    document.insert(PRIMARY_KEY.to_string(), primary);
    Ok(Value::Object(document))
}
