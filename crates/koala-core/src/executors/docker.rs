use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    InspectContainerOptions as BollardInspectContainerOptionsQuery,
    LogsOptions as BollardLogsOptionsQuery,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    WaitContainerOptions as BollardWaitContainerOptionsQuery,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::Path;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
    sandbox_env, BackendKind, ExitKind, IsolationBackend, RawOutcome, ResultFile, DRAIN_GRACE,
    STDERR_CAP,
};
use crate::config::ContainerSettings;
use crate::errors::BackendError;
use crate::harness::runner_args;
use crate::limits::{clamp_i64, CappedOutput, ResourceLimits, Termination, Watchdog};
use crate::staging::{StagedSession, RESULT_FILE};

/// Where the session directory is mounted inside the container.
const SANDBOX_DIR: &str = "/sandbox";
/// Unprivileged identity used when the host itself runs as root.
const NOBODY: &str = "65534:65534";
/// The pids cgroup counts threads, so it cannot be as tight as the rlimit.
const MIN_PIDS_LIMIT: u64 = 32;

pub struct ContainerBackend {
    docker: Docker,
    settings: ContainerSettings,
    user: String,
}

impl ContainerBackend {
    /// Connect to the local runtime and make sure the sandbox image exists.
    pub async fn connect(settings: &ContainerSettings) -> Result<Self, BackendError> {
        let docker = Docker::connect_with_local_defaults()?;
        docker
            .ping()
            .await
            .map_err(|e| BackendError::RuntimeUnavailable(e.to_string()))?;
        docker.inspect_image(&settings.image).await.map_err(|e| {
            BackendError::RuntimeUnavailable(format!(
                "sandbox image {} is not available: {}",
                settings.image, e
            ))
        })?;

        Ok(Self {
            docker,
            settings: settings.clone(),
            user: settings.user.clone().unwrap_or_else(default_user),
        })
    }

    fn container_config(&self, session: &StagedSession, limits: &ResourceLimits) -> ContainerCreateBody {
        let mut cmd = vec![self.settings.python.clone()];
        cmd.extend(runner_args());

        let env = sandbox_env(SANDBOX_DIR)
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let tmpfs = HashMap::from([(
            "/tmp".to_string(),
            format!("rw,noexec,nosuid,size={}m", self.settings.tmpfs_mb),
        )]);

        ContainerCreateBody {
            image: Some(self.settings.image.clone()),
            cmd: Some(cmd),
            env: Some(env),
            user: Some(self.user.clone()),
            working_dir: Some(SANDBOX_DIR.to_string()),
            network_disabled: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(HostConfig {
                binds: Some(vec![format!(
                    "{}:{}:rw",
                    session.root().to_string_lossy(),
                    SANDBOX_DIR
                )]),
                network_mode: Some("none".to_string()),
                readonly_rootfs: Some(true),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                memory: Some(clamp_i64(limits.memory_bytes)),
                memory_swap: Some(clamp_i64(limits.memory_bytes)),
                nano_cpus: Some((self.settings.cpus * 1_000_000_000.0) as i64),
                pids_limit: Some(clamp_i64(limits.max_processes.max(MIN_PIDS_LIMIT))),
                ulimits: Some(limits.container_ulimits()),
                tmpfs: Some(tmpfs),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Give the sandbox user the session directory when the host runs as root.
    #[cfg(unix)]
    fn hand_over(&self, root: &Path) -> Result<(), BackendError> {
        // SAFETY: getuid has no preconditions and cannot fail.
        if unsafe { libc::getuid() } != 0 {
            return Ok(());
        }
        let Some((uid, gid)) = parse_user(&self.user) else {
            return Ok(());
        };
        chown_tree(root, uid, gid)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn hand_over(&self, _root: &Path) -> Result<(), BackendError> {
        Ok(())
    }

    async fn oom_killed(&self, id: &str) -> bool {
        match self
            .docker
            .inspect_container(id, None::<BollardInspectContainerOptionsQuery>)
            .await
        {
            Ok(details) => details
                .state
                .and_then(|state| state.oom_killed)
                .unwrap_or(false),
            Err(e) => {
                warn!("Could not inspect container {}: {}", id, e);
                false
            }
        }
    }
}

#[async_trait]
impl IsolationBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn run(
        &self,
        session: &StagedSession,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<RawOutcome, BackendError> {
        let started = Instant::now();
        self.hand_over(session.root())?;

        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(format!("koala-{}", session.id())),
            ..Default::default()
        });
        let container = self
            .docker
            .create_container(options, self.container_config(session, limits))
            .await?;
        let mut guard = ContainerGuard::new(self.docker.clone(), container.id.clone());
        debug!("Created container {} for session {}", container.id, session.id());

        self.docker
            .start_container(&container.id, None::<BollardStartContainerOptionsQuery>)
            .await?;

        let watchdog = Watchdog::start(limits.timeout, cancel.clone());
        let logs = collect_logs(self.docker.clone(), container.id.clone(), limits.max_output_bytes);
        tokio::pin!(logs);
        let mut wait = self
            .docker
            .wait_container(&container.id, None::<BollardWaitContainerOptionsQuery>);

        let mut collected: Option<(CappedOutput, CappedOutput)> = None;
        let (exit, termination) = loop {
            tokio::select! {
                status = wait.next() => break (wait_status(status)?, None),
                tripped = watchdog.tripped() => break (ExitKind::Unknown, Some(tripped)),
                output = &mut logs, if collected.is_none() => {
                    let output = output?;
                    let overflowed = output.0.overflowed;
                    collected = Some(output);
                    if overflowed {
                        break (ExitKind::Unknown, Some(Termination::OutputOverflow));
                    }
                }
            }
        };

        let oom_killed = match termination {
            Some(reason) => {
                warn!("Stopping container {} early: {:?}", container.id, reason);
                guard.remove().await;
                false
            }
            None => self.oom_killed(&container.id).await,
        };

        let (stdout, stderr) = match collected {
            Some(output) => output,
            None => match tokio::time::timeout(DRAIN_GRACE, &mut logs).await {
                Ok(output) => output?,
                Err(_) => (CappedOutput::default(), CappedOutput::default()),
            },
        };

        let result_file = ResultFile::collect(&session.path(RESULT_FILE), limits.max_output_bytes).await?;
        guard.remove().await;

        let elapsed = started.elapsed();
        info!(
            "Container session {} finished in {:.2}s ({:?})",
            session.id(),
            elapsed.as_secs_f64(),
            exit
        );
        Ok(RawOutcome {
            exit,
            termination,
            oom_killed,
            stdout,
            stderr,
            result_file,
            elapsed,
        })
    }
}

fn wait_status(
    status: Option<Result<bollard::models::ContainerWaitResponse, bollard::errors::Error>>,
) -> Result<ExitKind, BackendError> {
    match status {
        Some(Ok(response)) => Ok(ExitKind::from_container_status(response.status_code)),
        // a nonzero exit is reported as an error by the wait endpoint
        Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
            Ok(ExitKind::from_container_status(code))
        }
        Some(Err(e)) => Err(BackendError::Bollard(e)),
        None => Err(BackendError::Collection(
            "container wait stream ended unexpectedly".to_string(),
        )),
    }
}

/// Follow a container's output until it exits or stdout passes `stdout_cap`.
async fn collect_logs(
    docker: Docker,
    id: String,
    stdout_cap: u64,
) -> Result<(CappedOutput, CappedOutput), BackendError> {
    let mut stream = docker.logs(
        &id,
        Some(BollardLogsOptionsQuery {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        }),
    );

    let mut stdout = CappedOutput::default();
    let mut stderr = CappedOutput::default();
    while let Some(item) = stream.next().await {
        match item {
            Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                stdout.push(&message, stdout_cap);
                if stdout.overflowed {
                    break;
                }
            }
            Ok(LogOutput::StdErr { message }) => stderr.push(&message, STDERR_CAP),
            Ok(_) => {}
            // the container can vanish under a follow stream once it is removed
            Err(e) => {
                debug!("Log stream for {} ended: {}", id, e);
                break;
            }
        }
    }
    Ok((stdout, stderr))
}

/// Removes the container when dropped, so a cancelled request cannot leak it.
struct ContainerGuard {
    docker: Docker,
    id: String,
    removed: bool,
}

impl ContainerGuard {
    fn new(docker: Docker, id: String) -> Self {
        Self {
            docker,
            id,
            removed: false,
        }
    }

    async fn remove(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = self.docker.remove_container(&self.id, Some(force_remove())).await {
            warn!("Failed to remove container {}: {}", self.id, e);
        }
        self.removed = true;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        let docker = self.docker.clone();
        let id = std::mem::take(&mut self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = docker.remove_container(&id, Some(force_remove())).await {
                        warn!("Failed to remove abandoned container {}: {}", id, e);
                    }
                });
            }
            Err(_) => warn!("No runtime available to remove container {}", id),
        }
    }
}

fn force_remove() -> BollardRemoveContainerOptionsQuery {
    BollardRemoveContainerOptionsQuery {
        force: true,
        v: true,
        ..Default::default()
    }
}

fn default_user() -> String {
    #[cfg(unix)]
    {
        // SAFETY: getuid and getgid have no preconditions and cannot fail.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        if uid != 0 {
            return format!("{}:{}", uid, gid);
        }
    }
    NOBODY.to_string()
}

fn parse_user(user: &str) -> Option<(u32, u32)> {
    let (uid, gid) = user.split_once(':').unwrap_or((user, user));
    Some((uid.parse().ok()?, gid.parse().ok()?))
}

#[cfg(unix)]
fn chown_tree(path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))?;
    if std::fs::symlink_metadata(path)?.is_dir() {
        for entry in std::fs::read_dir(path)? {
            chown_tree(&entry?.path(), uid, gid)?;
        }
    }
    Ok(())
}
