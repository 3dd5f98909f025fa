use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
    sandbox_env, BackendKind, ExitKind, IsolationBackend, RawOutcome, ResultFile, DRAIN_GRACE,
    STDERR_CAP,
};
use crate::config::ProcessSettings;
use crate::errors::{BackendError, EngineError};
use crate::harness::runner_args;
use crate::limits::{read_capped, CappedOutput, ResourceLimits, Termination, Watchdog};
use crate::staging::{StagedSession, RESULT_FILE};

/// Runs sessions as rlimited children of a host interpreter.
///
/// The child gets a scrubbed environment, its own process group and kernel
/// ceilings on address space, CPU time, process count and file size. It
/// shares the host's network and filesystem view, so this backend is only
/// used where no container runtime is reachable.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    interpreter: PathBuf,
}

impl ProcessBackend {
    pub fn new(settings: &ProcessSettings) -> Result<Self, EngineError> {
        let interpreter = which::which(&settings.interpreter).map_err(|e| {
            EngineError::BackendUnavailable(format!(
                "interpreter '{}' not found: {}",
                settings.interpreter, e
            ))
        })?;
        debug!("Process backend will use {}", interpreter.display());
        Ok(Self { interpreter })
    }

    pub fn interpreter(&self) -> &PathBuf {
        &self.interpreter
    }

    fn command(&self, session: &StagedSession, limits: &ResourceLimits) -> Command {
        let root = session.root().to_string_lossy().into_owned();
        let mut command = Command::new(&self.interpreter);
        command
            .args(runner_args())
            .current_dir(session.root())
            .env_clear()
            .envs(sandbox_env(&root))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            let limits = *limits;
            command.process_group(0);
            // SAFETY: the closure only calls setrlimit, which is async-signal-safe.
            unsafe {
                command.pre_exec(move || crate::limits::apply_rlimits(&limits));
            }
        }
        command
    }
}

#[async_trait]
impl IsolationBackend for ProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    async fn run(
        &self,
        session: &StagedSession,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<RawOutcome, BackendError> {
        let started = Instant::now();
        let mut child = self.command(session, limits).spawn().map_err(|e| {
            BackendError::Spawn(format!("{}: {}", self.interpreter.display(), e))
        })?;
        let mut group = ProcessGroupGuard::new(child.id());
        debug!("Spawned pid {:?} for session {}", child.id(), session.id());

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Collection("child stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::Collection("child stderr was not captured".to_string()))?;
        let stderr_task = tokio::spawn(read_capped(stderr, STDERR_CAP, false));
        let stdout_read = read_capped(stdout, limits.max_output_bytes, true);
        tokio::pin!(stdout_read);

        let watchdog = Watchdog::start(limits.timeout, cancel.clone());
        let mut collected: Option<CappedOutput> = None;
        let (mut exit, termination) = loop {
            tokio::select! {
                status = child.wait() => break (ExitKind::from_exit_status(status?), None),
                tripped = watchdog.tripped() => break (ExitKind::Unknown, Some(tripped)),
                output = &mut stdout_read, if collected.is_none() => {
                    let output = output?;
                    let overflowed = output.overflowed;
                    collected = Some(output);
                    if overflowed {
                        break (ExitKind::Unknown, Some(Termination::OutputOverflow));
                    }
                }
            }
        };

        if let Some(reason) = termination {
            warn!("Killing session {} early: {:?}", session.id(), reason);
            group.kill();
            if let Err(e) = child.start_kill() {
                debug!("Child already gone: {}", e);
            }
            exit = ExitKind::from_exit_status(child.wait().await?);
        }
        // the leader is reaped but children it left behind keep the group
        // alive, so the id cannot have been reused yet
        group.kill();
        group.disarm();

        let stdout = match collected {
            Some(output) => output,
            None => match tokio::time::timeout(DRAIN_GRACE, &mut stdout_read).await {
                Ok(output) => output?,
                Err(_) => CappedOutput::default(),
            },
        };
        let stderr = match tokio::time::timeout(DRAIN_GRACE, stderr_task).await {
            Ok(Ok(output)) => output?,
            Ok(Err(e)) => return Err(BackendError::Collection(e.to_string())),
            Err(_) => CappedOutput::default(),
        };

        let result_file = ResultFile::collect(&session.path(RESULT_FILE), limits.max_output_bytes).await?;
        let elapsed = started.elapsed();
        info!(
            "Process session {} finished in {:.2}s ({:?})",
            session.id(),
            elapsed.as_secs_f64(),
            exit
        );
        Ok(RawOutcome {
            exit,
            termination,
            oom_killed: false,
            stdout,
            stderr,
            result_file,
            elapsed,
        })
    }
}

/// Kills the child's whole process group unless disarmed, so descendants of
/// a finished or abandoned session die with it.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn kill(&self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            // SAFETY: killpg only sends a signal; a stale group id fails with ESRCH.
            unsafe {
                libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
            }
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}
