//! Session working directories and the datasets copied into them
//!
//! Every request gets its own directory, created with owner-only permissions
//! and removed when the [`StagedSession`] is dropped:
//!
//! ```text
//! <root>/koala-XXXXXX/
//!     analysis.py      the submitted script
//!     harness.py       scaffolding that runs it
//!     manifest.json    bindings and caps for the harness
//!     inputs/00_sales.csv
//!     output/result.json
//!     tmp/
//! ```

use log::{debug, warn};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::fs;
use uuid::Uuid;

use crate::config::StagingSettings;
use crate::errors::StagingError;
use crate::request::{ColumnSchema, DatasetBinding, DatasetFormat, DatasetSource, ExecutionRequest};

pub const SCRIPT_FILE: &str = "analysis.py";
pub const HARNESS_FILE: &str = "harness.py";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const INPUT_DIR: &str = "inputs";
pub const OUTPUT_DIR: &str = "output";
pub const TMP_DIR: &str = "tmp";
pub const RESULT_FILE: &str = "output/result.json";

/// Names the harness binds itself; a dataset may not shadow them.
const RESERVED_NAMES: &[&str] = &["pd", "np", "plt", "result", "_"];

const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise",
    "return", "try", "while", "with", "yield", "match", "case", "type",
];

/// A dataset after it has been copied into a session directory.
#[derive(Debug, Clone)]
pub struct StagedDataset {
    pub name: String,
    pub format: DatasetFormat,
    /// Path relative to the session root
    pub relative_path: String,
    pub size: u64,
    pub columns: Vec<ColumnSchema>,
}

/// A prepared, not yet executed, session directory.
#[derive(Debug)]
pub struct StagedSession {
    id: String,
    dir: TempDir,
    datasets: Vec<StagedDataset>,
}

impl StagedSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn datasets(&self) -> &[StagedDataset] {
        &self.datasets
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    pub fn result_path(&self) -> PathBuf {
        self.path(RESULT_FILE)
    }

    /// Remove the directory now rather than on drop, logging failures.
    pub fn close(self) {
        let root = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!("Failed to remove session directory {}: {}", root.display(), e);
        }
    }
}

/// Copies request datasets into fresh session directories.
#[derive(Debug, Clone)]
pub struct DatasetStager {
    settings: StagingSettings,
}

impl DatasetStager {
    pub fn new(settings: StagingSettings) -> Self {
        Self { settings }
    }

    /// Create a session directory holding the script and every dataset.
    ///
    /// Nothing is written until the bindings pass the name and count checks;
    /// a failure part way through drops the directory with whatever it held.
    pub async fn stage(&self, request: &ExecutionRequest) -> Result<StagedSession, StagingError> {
        self.check_bindings(&request.datasets)?;

        let dir = self.create_session_dir()?;
        let root = dir.path().to_path_buf();
        for sub in [INPUT_DIR, OUTPUT_DIR, TMP_DIR] {
            fs::create_dir(root.join(sub)).await?;
        }
        fs::write(root.join(SCRIPT_FILE), request.script.as_bytes()).await?;

        let mut datasets = Vec::with_capacity(request.datasets.len());
        let mut total: u64 = 0;
        for (index, binding) in request.datasets.iter().enumerate() {
            let staged = self.stage_one(&root, index, binding).await?;
            total += staged.size;
            if total > self.settings.max_total_bytes {
                return Err(StagingError::TotalTooLarge {
                    size: total,
                    limit: self.settings.max_total_bytes,
                });
            }
            debug!("Staged dataset '{}' as {} ({} bytes)", staged.name, staged.relative_path, staged.size);
            datasets.push(staged);
        }

        Ok(StagedSession {
            id: Uuid::new_v4().to_string(),
            dir,
            datasets,
        })
    }

    fn create_session_dir(&self) -> Result<TempDir, StagingError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("koala-");
        let dir = match &self.settings.root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(dir)
    }

    fn check_bindings(&self, bindings: &[DatasetBinding]) -> Result<(), StagingError> {
        if bindings.len() > self.settings.max_datasets {
            return Err(StagingError::TooManyDatasets {
                count: bindings.len(),
                limit: self.settings.max_datasets,
            });
        }

        let mut seen = HashSet::new();
        for binding in bindings {
            check_binding_name(&binding.name)?;
            if !seen.insert(binding.name.as_str()) {
                return Err(StagingError::DuplicateName(binding.name.clone()));
            }
            if binding.resolved_format().is_none() {
                return Err(StagingError::UnknownFormat {
                    name: binding.name.clone(),
                });
            }
        }
        Ok(())
    }

    async fn stage_one(
        &self,
        root: &Path,
        index: usize,
        binding: &DatasetBinding,
    ) -> Result<StagedDataset, StagingError> {
        let format = binding.resolved_format().ok_or_else(|| StagingError::UnknownFormat {
            name: binding.name.clone(),
        })?;
        let relative_path = format!("{}/{:02}_{}.{}", INPUT_DIR, index, binding.name, format.extension());
        let target = root.join(&relative_path);
        let limit = self.settings.max_dataset_bytes;

        let size = match &binding.source {
            DatasetSource::Bytes(bytes) => {
                let size = bytes.len() as u64;
                self.check_size(&binding.name, size)?;
                fs::write(&target, bytes).await?;
                size
            }
            DatasetSource::File(path) => {
                let unreadable = |e: std::io::Error| StagingError::Unreadable {
                    name: binding.name.clone(),
                    reason: format!("{}: {}", path.display(), e),
                };
                let metadata = fs::metadata(path).await.map_err(unreadable)?;
                if !metadata.is_file() {
                    return Err(StagingError::Unreadable {
                        name: binding.name.clone(),
                        reason: format!("{} is not a regular file", path.display()),
                    });
                }
                self.check_size(&binding.name, metadata.len())?;
                // the source may have grown since it was measured
                let copied = fs::copy(path, &target).await.map_err(unreadable)?;
                if copied > limit {
                    return Err(StagingError::DatasetTooLarge {
                        name: binding.name.clone(),
                        size: copied,
                        limit,
                    });
                }
                copied
            }
        };

        Ok(StagedDataset {
            name: binding.name.clone(),
            format,
            relative_path,
            size,
            columns: binding.columns.clone(),
        })
    }

    fn check_size(&self, name: &str, size: u64) -> Result<(), StagingError> {
        if size > self.settings.max_dataset_bytes {
            return Err(StagingError::DatasetTooLarge {
                name: name.to_string(),
                size,
                limit: self.settings.max_dataset_bytes,
            });
        }
        Ok(())
    }
}

/// A binding must be a plain identifier the harness can assign to.
fn check_binding_name(name: &str) -> Result<(), StagingError> {
    let invalid = |reason: &str| {
        Err(StagingError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };

    let mut chars = name.chars();
    match chars.next() {
        None => return invalid("name is empty"),
        Some(c) if !(c.is_ascii_alphabetic() || c == '_') => {
            return invalid("must start with a letter")
        }
        _ => {}
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return invalid("only ASCII letters, digits and underscores are allowed");
    }
    if name.starts_with('_') {
        return invalid("leading underscores are reserved");
    }
    if PYTHON_KEYWORDS.contains(&name) {
        return invalid("is a Python keyword");
    }
    if RESERVED_NAMES.contains(&name) || name.starts_with("result_") {
        return invalid("is reserved for harness bindings and results");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn stager_in(root: &Path) -> DatasetStager {
        DatasetStager::new(StagingSettings {
            root: Some(root.to_path_buf()),
            ..StagingSettings::default()
        })
    }

    #[tokio::test]
    async fn test_stage_writes_script_and_datasets() {
        let root = tempdir().unwrap();
        let source = root.path().join("upload.tsv");
        std::fs::write(&source, "a\tb\n1\t2\n").unwrap();

        let request = ExecutionRequest::new("result = sales.shape")
            .with_dataset(DatasetBinding::from_bytes("sales", b"x,y\n1,2\n".to_vec(), DatasetFormat::Csv))
            .with_dataset(DatasetBinding::from_file("lookup", &source));

        let session = stager_in(root.path()).stage(&request).await.unwrap();
        let names: Vec<_> = session.datasets().iter().map(|d| d.relative_path.as_str()).collect();
        assert_eq!(names, vec!["inputs/00_sales.csv", "inputs/01_lookup.tsv"]);
        assert_eq!(
            std::fs::read_to_string(session.path(SCRIPT_FILE)).unwrap(),
            "result = sales.shape"
        );
        assert_eq!(std::fs::read(session.path("inputs/01_lookup.tsv")).unwrap(), b"a\tb\n1\t2\n");
        assert!(session.path(OUTPUT_DIR).is_dir());
        assert!(session.root().starts_with(root.path()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_session_dir_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let root = tempdir().unwrap();
        let session = stager_in(root.path()).stage(&ExecutionRequest::new("x = 1")).await.unwrap();
        let mode = std::fs::metadata(session.root()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn test_sessions_do_not_share_directories() {
        let root = tempdir().unwrap();
        let stager = stager_in(root.path());
        let a = stager.stage(&ExecutionRequest::new("x = 1")).await.unwrap();
        let b = stager.stage(&ExecutionRequest::new("x = 1")).await.unwrap();
        assert_ne!(a.root(), b.root());
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_directory_removed_on_close() {
        let root = tempdir().unwrap();
        let session = stager_in(root.path()).stage(&ExecutionRequest::new("x = 1")).await.unwrap();
        let path = session.root().to_path_buf();
        session.close();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_oversized_dataset_is_rejected() {
        let root = tempdir().unwrap();
        let stager = DatasetStager::new(StagingSettings {
            root: Some(root.path().to_path_buf()),
            max_dataset_bytes: 4,
            ..StagingSettings::default()
        });
        let request = ExecutionRequest::new("x = 1")
            .with_dataset(DatasetBinding::from_bytes("big", vec![b'a'; 5], DatasetFormat::Csv));
        let err = stager.stage(&request).await.unwrap_err();
        assert!(matches!(err, StagingError::DatasetTooLarge { size: 5, limit: 4, .. }));
        assert!(err.is_size_limit());
    }

    #[tokio::test]
    async fn test_total_size_ceiling() {
        let root = tempdir().unwrap();
        let stager = DatasetStager::new(StagingSettings {
            root: Some(root.path().to_path_buf()),
            max_dataset_bytes: 10,
            max_total_bytes: 15,
            ..StagingSettings::default()
        });
        let request = ExecutionRequest::new("x = 1")
            .with_dataset(DatasetBinding::from_bytes("a", vec![b'a'; 8], DatasetFormat::Csv))
            .with_dataset(DatasetBinding::from_bytes("b", vec![b'b'; 8], DatasetFormat::Csv));
        let err = stager.stage(&request).await.unwrap_err();
        assert!(matches!(err, StagingError::TotalTooLarge { size: 16, limit: 15 }));
    }

    #[tokio::test]
    async fn test_binding_problems() {
        let root = tempdir().unwrap();
        let stager = stager_in(root.path());
        let csv = |name: &str| DatasetBinding::from_bytes(name, b"a\n1\n".to_vec(), DatasetFormat::Csv);

        let duplicate = ExecutionRequest::new("x = 1").with_dataset(csv("sales")).with_dataset(csv("sales"));
        assert!(matches!(stager.stage(&duplicate).await, Err(StagingError::DuplicateName(_))));

        for bad in ["", "1st", "my-data", "class", "pd", "result_total", "_hidden", "données"] {
            let request = ExecutionRequest::new("x = 1").with_dataset(csv(bad));
            assert!(
                matches!(stager.stage(&request).await, Err(StagingError::InvalidName { .. })),
                "{} should be rejected",
                bad
            );
        }

        let unknown = ExecutionRequest::new("x = 1").with_dataset(DatasetBinding::from_file("blob", root.path().join("data.bin")));
        assert!(matches!(stager.stage(&unknown).await, Err(StagingError::UnknownFormat { .. })));

        let missing = ExecutionRequest::new("x = 1").with_dataset(DatasetBinding::from_file("gone", root.path().join("gone.csv")));
        assert!(matches!(stager.stage(&missing).await, Err(StagingError::Unreadable { .. })));
    }

    #[tokio::test]
    async fn test_too_many_datasets() {
        let root = tempdir().unwrap();
        let stager = DatasetStager::new(StagingSettings {
            root: Some(root.path().to_path_buf()),
            max_datasets: 1,
            ..StagingSettings::default()
        });
        let request = ExecutionRequest::new("x = 1")
            .with_dataset(DatasetBinding::from_bytes("a", vec![], DatasetFormat::Csv))
            .with_dataset(DatasetBinding::from_bytes("b", vec![], DatasetFormat::Csv));
        assert!(matches!(
            stager.stage(&request).await,
            Err(StagingError::TooManyDatasets { count: 2, limit: 1 })
        ));
    }
}
