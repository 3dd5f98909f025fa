//! Wire format of the HTTP surface

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use koala_core::{
    binding_name_from_filename, ColumnSchema, DatasetBinding, DatasetFormat, DatasetSource,
    EngineHealth, ExecutionRequest, LimitOverrides,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, ServerError};

/// Body of `POST /execute`.
#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    pub script: String,
    #[serde(default)]
    pub datasets: Vec<DatasetPayload>,
    #[serde(default)]
    pub limits: Option<LimitOverrides>,
}

/// One dataset shipped inline.
///
/// `name` may be left out when `filename` is given; the binding name is then
/// derived from the file name the same way uploads are named elsewhere.
#[derive(Debug, Deserialize)]
pub struct DatasetPayload {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    pub content_base64: String,
    #[serde(default)]
    pub format: Option<DatasetFormat>,
    #[serde(default)]
    pub columns: Vec<ColumnSchema>,
}

impl DatasetPayload {
    fn into_binding(self, index: usize) -> Result<DatasetBinding> {
        let name = match (self.name, &self.filename) {
            (Some(name), _) => name,
            (None, Some(filename)) => binding_name_from_filename(filename),
            (None, None) => {
                return Err(ServerError::invalid_request(format!(
                    "dataset #{} needs a name or a filename",
                    index
                )))
            }
        };
        let bytes = STANDARD.decode(self.content_base64.trim()).map_err(|e| {
            ServerError::invalid_request(format!("dataset '{}' is not valid base64: {}", name, e))
        })?;
        let format = self
            .format
            .or_else(|| self.filename.as_deref().and_then(|f| DatasetFormat::from_path(Path::new(f))));

        Ok(DatasetBinding {
            name,
            source: DatasetSource::Bytes(bytes),
            format,
            columns: self.columns,
        })
    }
}

impl ExecuteBody {
    pub fn into_request(self) -> Result<ExecutionRequest> {
        let datasets = self
            .datasets
            .into_iter()
            .enumerate()
            .map(|(i, payload)| payload.into_binding(i))
            .collect::<Result<Vec<_>>>()?;
        Ok(ExecutionRequest {
            script: self.script,
            datasets,
            limits: self.limits,
        })
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub engine: EngineHealth,
}

impl HealthResponse {
    pub fn healthy(engine: EngineHealth) -> Self {
        Self {
            status: "healthy".to_string(),
            timestamp: Utc::now(),
            engine,
        }
    }
}
