//! Isolation backends for running staged sessions.
//!
//! Two implementations share one capability set: [`ContainerBackend`] runs each
//! session in a throwaway, network-less container, and [`ProcessBackend`] runs
//! it as an rlimited child of the host interpreter where no container runtime
//! is reachable. The backend is chosen once per process by [`select_backend`]
//! and request handling never asks which one it got.

use async_trait::async_trait;
use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{BackendPreference, KoalaConfig};
use crate::errors::{BackendError, EngineError};
use crate::limits::{CappedOutput, ResourceLimits, Termination};
use crate::staging::{StagedSession, TMP_DIR};

pub mod docker;
pub mod process;

pub use docker::ContainerBackend;
pub use process::ProcessBackend;

/// Cap on stderr kept for diagnostics; stderr is never part of the envelope.
pub(crate) const STDERR_CAP: u64 = 64 * 1024;
/// How long to keep draining output after a session was killed.
pub(crate) const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Container,
    Process,
}

impl BackendKind {
    pub fn isolation(&self) -> IsolationLevel {
        match self {
            BackendKind::Container => IsolationLevel::Namespaced,
            BackendKind::Process => IsolationLevel::ProcessLimits,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Container => f.write_str("container"),
            BackendKind::Process => f.write_str("process"),
        }
    }
}

/// The isolation guarantee a backend offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Separate filesystem, network and process namespaces plus cgroup limits
    Namespaced,
    /// Kernel rlimits and a scrubbed environment only; the network and the
    /// host filesystem are not isolated
    ProcessLimits,
}

/// How the session's main process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Code(i64),
    Signal(i32),
    /// Killed by the supervisor before an exit status was observed
    Unknown,
}

impl ExitKind {
    /// Container runtimes report death by signal `n` as status `128 + n`.
    pub fn from_container_status(status: i64) -> Self {
        if (129..160).contains(&status) {
            ExitKind::Signal((status - 128) as i32)
        } else {
            ExitKind::Code(status)
        }
    }

    #[cfg(unix)]
    pub fn from_exit_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitKind::Code(code as i64),
            (None, Some(signal)) => ExitKind::Signal(signal),
            (None, None) => ExitKind::Unknown,
        }
    }
}

/// State of `output/result.json` after the session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultFile {
    Missing,
    TooLarge { size: u64 },
    Contents(Vec<u8>),
}

impl ResultFile {
    /// Read the result file unless it is absent, not a regular file, or above `cap`.
    pub async fn collect(path: &Path, cap: u64) -> Result<Self, BackendError> {
        let metadata = match tokio::fs::symlink_metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ResultFile::Missing),
            Err(e) => return Err(e.into()),
        };
        if !metadata.is_file() {
            debug!("Ignoring result path {} that is not a regular file", path.display());
            return Ok(ResultFile::Missing);
        }
        if metadata.len() > cap {
            return Ok(ResultFile::TooLarge {
                size: metadata.len(),
            });
        }
        Ok(ResultFile::Contents(tokio::fs::read(path).await?))
    }
}

/// Everything a backend observed about one session, before classification.
#[derive(Debug, Clone)]
pub struct RawOutcome {
    pub exit: ExitKind,
    /// Set when the supervisor ended the session itself
    pub termination: Option<Termination>,
    pub oom_killed: bool,
    pub stdout: CappedOutput,
    pub stderr: CappedOutput,
    pub result_file: ResultFile,
    pub elapsed: Duration,
}

#[async_trait]
pub trait IsolationBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Run the harness of a staged session under `limits`.
    ///
    /// Implementations own the wall-clock deadline and must have killed and
    /// reaped the session before returning, including when `cancel` fires or
    /// the returned future is dropped.
    async fn run(
        &self,
        session: &StagedSession,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<RawOutcome, BackendError>;
}

/// Environment visible to the sandboxed interpreter. `root` is the session
/// directory as the interpreter sees it.
pub(crate) fn sandbox_env(root: &str) -> Vec<(String, String)> {
    let scratch = format!("{}/{}", root, TMP_DIR);
    [
        ("PATH", "/usr/local/bin:/usr/bin:/bin".to_string()),
        ("HOME", scratch.clone()),
        ("TMPDIR", scratch.clone()),
        ("MPLCONFIGDIR", scratch),
        ("MPLBACKEND", "Agg".to_string()),
        ("LANG", "C.UTF-8".to_string()),
        ("PYTHONDONTWRITEBYTECODE", "1".to_string()),
        ("PYTHONUNBUFFERED", "1".to_string()),
        ("OMP_NUM_THREADS", "1".to_string()),
        ("OPENBLAS_NUM_THREADS", "1".to_string()),
        ("MKL_NUM_THREADS", "1".to_string()),
        ("NUMEXPR_NUM_THREADS", "1".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

static ACTIVE_BACKEND: OnceCell<BackendKind> = OnceCell::new();

/// The backend chosen at startup, if one has been chosen yet.
pub fn active_backend() -> Option<BackendKind> {
    ACTIVE_BACKEND.get().copied()
}

/// Probe the host and build the backend the configuration asks for.
///
/// The first successful selection in a process is recorded for
/// [`active_backend`] and never changes afterwards.
pub async fn select_backend(config: &KoalaConfig) -> Result<Arc<dyn IsolationBackend>, EngineError> {
    let backend: Arc<dyn IsolationBackend> = match config.engine.backend {
        BackendPreference::Process => Arc::new(ProcessBackend::new(&config.process)?),
        BackendPreference::Container => {
            let backend = ContainerBackend::connect(&config.container)
                .await
                .map_err(|e| EngineError::BackendUnavailable(e.to_string()))?;
            Arc::new(backend)
        }
        BackendPreference::Auto => match ContainerBackend::connect(&config.container).await {
            Ok(backend) => Arc::new(backend),
            Err(e) => {
                warn!(
                    "Container runtime unavailable ({}), falling back to process isolation",
                    e
                );
                Arc::new(ProcessBackend::new(&config.process)?)
            }
        },
    };

    let kind = backend.kind();
    let recorded = *ACTIVE_BACKEND.get_or_init(|| kind);
    if recorded != kind {
        warn!(
            "Backend {} selected but {} was already recorded for this process",
            kind, recorded
        );
    }
    info!(
        "Using {} backend ({:?} isolation)",
        kind,
        kind.isolation()
    );
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_status_mapping() {
        assert_eq!(ExitKind::from_container_status(0), ExitKind::Code(0));
        assert_eq!(ExitKind::from_container_status(3), ExitKind::Code(3));
        assert_eq!(ExitKind::from_container_status(137), ExitKind::Signal(9));
        assert_eq!(ExitKind::from_container_status(152), ExitKind::Signal(24));
        assert_eq!(ExitKind::from_container_status(255), ExitKind::Code(255));
    }

    #[test]
    fn test_isolation_levels() {
        assert_eq!(BackendKind::Container.isolation(), IsolationLevel::Namespaced);
        assert_eq!(BackendKind::Process.isolation(), IsolationLevel::ProcessLimits);
        assert_eq!(
            serde_json::to_string(&IsolationLevel::ProcessLimits).unwrap(),
            "\"process_limits\""
        );
    }

    #[test]
    fn test_sandbox_env_is_minimal() {
        let env = sandbox_env("/sandbox");
        let get = |key: &str| env.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());
        assert_eq!(get("HOME"), Some("/sandbox/tmp"));
        assert_eq!(get("OMP_NUM_THREADS"), Some("1"));
        assert!(get("AWS_SECRET_ACCESS_KEY").is_none());
        assert!(env.iter().all(|(k, _)| !k.starts_with("KOALA_")));
    }

    #[tokio::test]
    async fn test_result_file_states() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.json");
        assert_eq!(ResultFile::collect(&path, 10).await.unwrap(), ResultFile::Missing);

        std::fs::write(&path, b"{\"status\":\"ok\"}").unwrap();
        assert_eq!(
            ResultFile::collect(&path, 4).await.unwrap(),
            ResultFile::TooLarge { size: 15 }
        );
        assert_eq!(
            ResultFile::collect(&path, 1024).await.unwrap(),
            ResultFile::Contents(b"{\"status\":\"ok\"}".to_vec())
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_result_symlink_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("secret");
        std::fs::write(&target, b"host data").unwrap();
        let link = dir.path().join("result.json");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        assert_eq!(ResultFile::collect(&link, 1024).await.unwrap(), ResultFile::Missing);
    }
}
