//! Configuration type definitions for the execution engine
//!
//! Every section is optional in YAML; missing fields fall back to the defaults
//! below, so an empty file (or no file at all) yields a usable configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KoalaConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub staging: StagingSettings,
    #[serde(default)]
    pub harness: HarnessSettings,
    #[serde(default)]
    pub validator: ValidatorSettings,
    #[serde(default)]
    pub container: ContainerSettings,
    #[serde(default)]
    pub process: ProcessSettings,
}

/// Which isolation strategy to use for the lifetime of the process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Probe the container runtime and fall back to processes when it is missing
    #[default]
    Auto,
    Container,
    Process,
}

impl std::str::FromStr for BackendPreference {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(BackendPreference::Auto),
            "container" | "docker" => Ok(BackendPreference::Container),
            "process" | "subprocess" => Ok(BackendPreference::Process),
            other => Err(EngineError::Config(format!(
                "Unknown backend '{}', expected auto, container or process",
                other
            ))),
        }
    }
}

/// What happens to a request when every session slot is taken.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Wait up to `admission_wait_seconds` for a slot
    #[default]
    Queue,
    /// Fail immediately with a backpressure error
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub backend: BackendPreference,
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    #[serde(default)]
    pub admission: AdmissionPolicy,
    #[serde(default = "default_admission_wait_seconds")]
    pub admission_wait_seconds: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            backend: BackendPreference::default(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
            admission: AdmissionPolicy::default(),
            admission_wait_seconds: default_admission_wait_seconds(),
        }
    }
}

/// Host-wide resource ceilings. Per-request overrides may only tighten these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_cpu_seconds")]
    pub cpu_seconds: u64,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_max_processes")]
    pub max_processes: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: u64,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_max_open_files")]
    pub max_open_files: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            cpu_seconds: default_cpu_seconds(),
            memory_mb: default_memory_mb(),
            max_processes: default_max_processes(),
            max_output_bytes: default_max_output_bytes(),
            max_file_size_mb: default_max_file_size_mb(),
            max_open_files: default_max_open_files(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingSettings {
    #[serde(default = "default_max_dataset_bytes")]
    pub max_dataset_bytes: u64,
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: u64,
    #[serde(default = "default_max_datasets")]
    pub max_datasets: usize,
    /// Parent directory for session directories; the system temp dir when unset
    #[serde(default)]
    pub root: Option<PathBuf>,
}

impl Default for StagingSettings {
    fn default() -> Self {
        Self {
            max_dataset_bytes: default_max_dataset_bytes(),
            max_total_bytes: default_max_total_bytes(),
            max_datasets: default_max_datasets(),
            root: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessSettings {
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    #[serde(default = "default_max_columns")]
    pub max_columns: usize,
    #[serde(default = "default_max_images")]
    pub max_images: usize,
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: u64,
    #[serde(default = "default_max_stdout_bytes")]
    pub max_stdout_bytes: u64,
    #[serde(default = "default_max_text_bytes")]
    pub max_text_bytes: u64,
    #[serde(default = "default_max_trace_bytes")]
    pub max_trace_bytes: usize,
    #[serde(default = "default_image_dpi")]
    pub image_dpi: u32,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
            max_columns: default_max_columns(),
            max_images: default_max_images(),
            max_image_bytes: default_max_image_bytes(),
            max_stdout_bytes: default_max_stdout_bytes(),
            max_text_bytes: default_max_text_bytes(),
            max_trace_bytes: default_max_trace_bytes(),
            image_dpi: default_image_dpi(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorSettings {
    #[serde(default = "default_allowed_modules")]
    pub allowed_modules: Vec<String>,
    #[serde(default = "default_max_script_bytes")]
    pub max_script_bytes: usize,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            allowed_modules: default_allowed_modules(),
            max_script_bytes: default_max_script_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSettings {
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    /// `uid:gid` for the sandbox user; derived from the host when unset
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_tmpfs_mb")]
    pub tmpfs_mb: u64,
    #[serde(default = "default_container_python")]
    pub python: String,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            image: default_image(),
            cpus: default_cpus(),
            user: None,
            tmpfs_mb: default_tmpfs_mb(),
            python: default_container_python(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSettings {
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
        }
    }
}

impl KoalaConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.engine.max_concurrent_sessions == 0 {
            return Err(EngineError::Config(
                "engine.max_concurrent_sessions must be greater than 0".to_string(),
            ));
        }

        let limits = &self.limits;
        for (name, value) in [
            ("timeout_seconds", limits.timeout_seconds),
            ("cpu_seconds", limits.cpu_seconds),
            ("memory_mb", limits.memory_mb),
            ("max_processes", limits.max_processes),
            ("max_output_bytes", limits.max_output_bytes),
            ("max_file_size_mb", limits.max_file_size_mb),
            ("max_open_files", limits.max_open_files),
        ] {
            if value == 0 {
                return Err(EngineError::Config(format!(
                    "limits.{} must be greater than 0",
                    name
                )));
            }
        }

        if self.staging.max_dataset_bytes == 0 || self.staging.max_total_bytes == 0 {
            return Err(EngineError::Config(
                "staging size ceilings must be greater than 0".to_string(),
            ));
        }

        if self.harness.max_rows == 0 || self.harness.max_columns == 0 {
            return Err(EngineError::Config(
                "harness.max_rows and harness.max_columns must be greater than 0".to_string(),
            ));
        }

        if self.validator.allowed_modules.is_empty() {
            return Err(EngineError::Config(
                "validator.allowed_modules cannot be empty".to_string(),
            ));
        }

        if self.container.image.trim().is_empty() {
            return Err(EngineError::Config(
                "container.image cannot be empty".to_string(),
            ));
        }

        if self.container.cpus.is_nan() || self.container.cpus <= 0.0 {
            return Err(EngineError::Config(
                "container.cpus must be greater than 0".to_string(),
            ));
        }

        if self.process.interpreter.trim().is_empty() {
            return Err(EngineError::Config(
                "process.interpreter cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

// Default value functions
fn default_max_concurrent_sessions() -> usize { 4 }
fn default_admission_wait_seconds() -> u64 { 30 }
fn default_timeout_seconds() -> u64 { 30 }
fn default_cpu_seconds() -> u64 { 30 }
fn default_memory_mb() -> u64 { 512 }
fn default_max_processes() -> u64 { 1 }
fn default_max_output_bytes() -> u64 { 5 * 1024 * 1024 }
fn default_max_file_size_mb() -> u64 { 10 }
fn default_max_open_files() -> u64 { 64 }
fn default_max_dataset_bytes() -> u64 { 100 * 1024 * 1024 }
fn default_max_total_bytes() -> u64 { 250 * 1024 * 1024 }
fn default_max_datasets() -> usize { 16 }
fn default_max_rows() -> usize { 1000 }
fn default_max_columns() -> usize { 100 }
fn default_max_images() -> usize { 5 }
fn default_max_image_bytes() -> u64 { 2 * 1024 * 1024 }
fn default_max_stdout_bytes() -> u64 { 64 * 1024 }
fn default_max_text_bytes() -> u64 { 64 * 1024 }
fn default_max_trace_bytes() -> usize { 8 * 1024 }
fn default_image_dpi() -> u32 { 100 }
fn default_max_script_bytes() -> usize { 64 * 1024 }
fn default_image() -> String { "koala-sandbox:latest".to_string() }
fn default_cpus() -> f64 { 0.5 }
fn default_tmpfs_mb() -> u64 { 64 }
fn default_container_python() -> String { "python".to_string() }
fn default_interpreter() -> String { "python3".to_string() }

fn default_allowed_modules() -> Vec<String> {
    [
        "pandas", "numpy", "matplotlib", "seaborn", "scipy", "math", "statistics",
        "datetime", "collections", "itertools", "functools", "re", "json", "decimal",
        "fractions", "random", "string", "calendar", "textwrap", "typing",
    ]
    .iter()
    .map(|m| m.to_string())
    .collect()
}
