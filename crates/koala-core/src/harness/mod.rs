//! Scaffolding installed around every submitted script
//!
//! The script is never run verbatim. [`Harness::install`] drops the runner
//! template and a JSON manifest next to it; inside the session the runner
//! binds each staged dataset to its name, runs the script in a namespace with
//! a guarded `__import__`, and writes the captured outputs to
//! `output/result.json`. What counts as an output and how large it may be is
//! decided here and nowhere else.

use serde::Serialize;
use tokio::fs;

use crate::config::{HarnessSettings, ValidatorSettings};
use crate::errors::StagingError;
use crate::request::{ColumnSchema, DatasetFormat};
use crate::staging::{StagedSession, HARNESS_FILE, MANIFEST_FILE, RESULT_FILE, SCRIPT_FILE};

/// The runner executed by the sandboxed interpreter.
pub const RUNNER_SOURCE: &str = include_str!("runner.py");

/// Exit codes the runner uses.
pub const EXIT_OK: i64 = 0;
pub const EXIT_HARNESS_ERROR: i64 = 3;
/// Out of memory before even an error report could be written.
pub const EXIT_OUT_OF_MEMORY: i64 = 4;

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    script: &'static str,
    result_path: &'static str,
    datasets: Vec<ManifestDataset<'a>>,
    caps: &'a HarnessSettings,
    allowed_modules: &'a [String],
}

#[derive(Debug, Serialize)]
struct ManifestDataset<'a> {
    name: &'a str,
    format: DatasetFormat,
    path: &'a str,
    columns: &'a [ColumnSchema],
}

#[derive(Debug, Clone)]
pub struct Harness {
    caps: HarnessSettings,
    allowed_modules: Vec<String>,
}

impl Harness {
    pub fn new(caps: HarnessSettings, validator: &ValidatorSettings) -> Self {
        Self {
            caps,
            allowed_modules: validator.allowed_modules.clone(),
        }
    }

    /// Write the runner and its manifest into a staged session.
    pub async fn install(&self, session: &StagedSession) -> Result<(), StagingError> {
        let manifest = self.manifest_json(session)?;
        fs::write(session.path(HARNESS_FILE), RUNNER_SOURCE).await?;
        fs::write(session.path(MANIFEST_FILE), manifest).await?;
        Ok(())
    }

    fn manifest_json(&self, session: &StagedSession) -> Result<Vec<u8>, StagingError> {
        let manifest = Manifest {
            script: SCRIPT_FILE,
            result_path: RESULT_FILE,
            datasets: session
                .datasets()
                .iter()
                .map(|d| ManifestDataset {
                    name: &d.name,
                    format: d.format,
                    path: &d.relative_path,
                    columns: &d.columns,
                })
                .collect(),
            caps: &self.caps,
            allowed_modules: &self.allowed_modules,
        };
        Ok(serde_json::to_vec_pretty(&manifest)?)
    }
}

/// Arguments that start the runner from inside the session directory.
pub fn runner_args() -> Vec<String> {
    // -I ignores PYTHON* variables and user site-packages, -B skips .pyc writes
    ["-I", "-B", "-u", HARNESS_FILE, MANIFEST_FILE]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StagingSettings;
    use crate::request::{DatasetBinding, ExecutionRequest};
    use crate::staging::DatasetStager;
    use serde_json::Value;

    #[tokio::test]
    async fn test_install_writes_runner_and_manifest() {
        let root = tempfile::tempdir().unwrap();
        let stager = DatasetStager::new(StagingSettings {
            root: Some(root.path().to_path_buf()),
            ..StagingSettings::default()
        });
        let request = ExecutionRequest::new("result = sales.revenue.sum()").with_dataset(
            DatasetBinding::from_bytes("sales", b"revenue\n1\n".to_vec(), DatasetFormat::Csv).with_columns(vec![
                ColumnSchema {
                    name: "revenue".to_string(),
                    dtype: Some("float".to_string()),
                },
            ]),
        );
        let session = stager.stage(&request).await.unwrap();
        let harness = Harness::new(HarnessSettings::default(), &ValidatorSettings::default());
        harness.install(&session).await.unwrap();

        let runner = std::fs::read_to_string(session.path(HARNESS_FILE)).unwrap();
        assert_eq!(runner, RUNNER_SOURCE);

        let manifest: Value =
            serde_json::from_slice(&std::fs::read(session.path(MANIFEST_FILE)).unwrap()).unwrap();
        assert_eq!(manifest["script"], "analysis.py");
        assert_eq!(manifest["result_path"], "output/result.json");
        assert_eq!(manifest["datasets"][0]["name"], "sales");
        assert_eq!(manifest["datasets"][0]["format"], "csv");
        assert_eq!(manifest["datasets"][0]["path"], "inputs/00_sales.csv");
        assert_eq!(manifest["datasets"][0]["columns"][0]["name"], "revenue");
        assert_eq!(manifest["caps"]["max_rows"], 1000);
        assert_eq!(manifest["caps"]["max_images"], 5);
        assert!(manifest["allowed_modules"]
            .as_array()
            .unwrap()
            .iter()
            .any(|m| m == "pandas"));
    }

    #[test]
    fn test_runner_uses_the_same_sentinel_and_layout() {
        assert!(RUNNER_SOURCE.contains(&format!("NON_FINITE_KEY = \"{}\"", crate::result::NON_FINITE_KEY)));
        assert!(RUNNER_SOURCE.contains(&format!("SCRIPT_NAME = \"{}\"", SCRIPT_FILE)));
        assert!(RUNNER_SOURCE.contains(&format!("EXIT_HARNESS_ERROR = {}", EXIT_HARNESS_ERROR)));
        assert!(RUNNER_SOURCE.contains(&format!("EXIT_OUT_OF_MEMORY = {}", EXIT_OUT_OF_MEMORY)));
    }

    #[test]
    fn test_runner_stubs_process_control_before_the_script_runs() {
        for name in ["\"system\"", "\"fork\"", "\"execv\"", "\"posix_spawn\"", "\"killpg\""] {
            assert!(RUNNER_SOURCE.contains(name), "{} is not stubbed", name);
        }
        let stubbed = RUNNER_SOURCE.find("        deny_process_control()").unwrap();
        let runs = RUNNER_SOURCE.find("final_value = run_script(").unwrap();
        assert!(stubbed < runs);
    }

    #[test]
    fn test_runner_args_point_at_session_files() {
        let args = runner_args();
        assert_eq!(args.last().map(String::as_str), Some(MANIFEST_FILE));
        assert!(args.contains(&HARNESS_FILE.to_string()));
    }
}
