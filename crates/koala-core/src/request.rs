//! Request types handed to the engine by the orchestration layer

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::limits::LimitOverrides;

/// How a dataset is parsed inside the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetFormat {
    Csv,
    Tsv,
    Excel,
    Parquet,
    Json,
}

impl DatasetFormat {
    /// Infer the format from a file name's extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(DatasetFormat::Csv),
            "tsv" | "tab" => Some(DatasetFormat::Tsv),
            "xlsx" | "xls" => Some(DatasetFormat::Excel),
            "parquet" | "pq" => Some(DatasetFormat::Parquet),
            "json" => Some(DatasetFormat::Json),
            _ => None,
        }
    }

    /// Extension used for the staged copy.
    pub fn extension(&self) -> &'static str {
        match self {
            DatasetFormat::Csv => "csv",
            DatasetFormat::Tsv => "tsv",
            DatasetFormat::Excel => "xlsx",
            DatasetFormat::Parquet => "parquet",
            DatasetFormat::Json => "json",
        }
    }
}

/// Where a dataset's bytes come from.
#[derive(Debug, Clone)]
pub enum DatasetSource {
    Bytes(Vec<u8>),
    File(PathBuf),
}

/// A column the caller expects the dataset to have.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
}

/// One named input. Owned by the request that declares it.
#[derive(Debug, Clone)]
pub struct DatasetBinding {
    pub name: String,
    pub source: DatasetSource,
    /// Inferred from a file source's extension when absent
    pub format: Option<DatasetFormat>,
    pub columns: Vec<ColumnSchema>,
}

impl DatasetBinding {
    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>, format: DatasetFormat) -> Self {
        Self {
            name: name.into(),
            source: DatasetSource::Bytes(bytes),
            format: Some(format),
            columns: Vec::new(),
        }
    }

    pub fn from_file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source: DatasetSource::File(path.into()),
            format: None,
            columns: Vec::new(),
        }
    }

    /// Bind a file under a name derived from its file name.
    pub fn from_uploaded_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = binding_name_from_filename(&path.to_string_lossy());
        Self::from_file(name, path)
    }

    pub fn with_columns(mut self, columns: Vec<ColumnSchema>) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_format(mut self, format: DatasetFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Declared format, falling back to the file extension.
    pub fn resolved_format(&self) -> Option<DatasetFormat> {
        self.format.or_else(|| match &self.source {
            DatasetSource::File(path) => DatasetFormat::from_path(path),
            DatasetSource::Bytes(_) => None,
        })
    }
}

/// Everything the engine needs for one execution. Immutable once submitted.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub script: String,
    pub datasets: Vec<DatasetBinding>,
    pub limits: Option<LimitOverrides>,
}

impl ExecutionRequest {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            datasets: Vec::new(),
            limits: None,
        }
    }

    pub fn with_dataset(mut self, binding: DatasetBinding) -> Self {
        self.datasets.push(binding);
        self
    }

    pub fn with_limits(mut self, limits: LimitOverrides) -> Self {
        self.limits = Some(limits);
        self
    }
}

/// Turn an uploaded file name such as `Q3 sales-2024.csv` into `Q3_sales_2024`.
pub fn binding_name_from_filename(filename: &str) -> String {
    let base = Path::new(filename)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = match base.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => base,
    };

    let cleaned: String = stem
        .chars()
        .map(|c| if c == '-' || c == ' ' { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    // leading underscores would hide the binding from result capture
    let mut name = cleaned.trim_start_matches('_').to_string();

    if name.is_empty() {
        return "data".to_string();
    }
    if name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        name.insert_str(0, "data_");
    }
    name
}
