//! Resource ceilings and the supervisor pieces that enforce them
//!
//! The limiter never relies on the script's cooperation. Wall-clock time is
//! owned by a [`Watchdog`] in the orchestrating process, output volume is
//! counted while it is read, and CPU, memory and process count are pushed
//! into the kernel (rlimits for child processes, cgroup limits and ulimits
//! for containers) before any user code runs.

use bollard::models::ResourcesUlimits;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::LimitSettings;
use crate::result::ResourceKind;

const MIB: u64 = 1024 * 1024;
const READ_CHUNK: usize = 8 * 1024;

/// Per-request overrides. Each field can only tighten the configured ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverrides {
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub cpu_seconds: Option<u64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub max_output_bytes: Option<u64>,
}

/// Effective ceilings for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub timeout: Duration,
    pub cpu_seconds: u64,
    pub memory_bytes: u64,
    pub max_processes: u64,
    pub max_output_bytes: u64,
    pub max_file_bytes: u64,
    pub max_open_files: u64,
}

impl ResourceLimits {
    pub fn from_settings(settings: &LimitSettings) -> Self {
        Self {
            timeout: Duration::from_secs(settings.timeout_seconds),
            cpu_seconds: settings.cpu_seconds,
            memory_bytes: settings.memory_mb.saturating_mul(MIB),
            max_processes: settings.max_processes,
            max_output_bytes: settings.max_output_bytes,
            max_file_bytes: settings.max_file_size_mb.saturating_mul(MIB),
            max_open_files: settings.max_open_files,
        }
    }

    /// Apply caller overrides, clamped to the host ceilings. Zero is ignored.
    pub fn tightened(mut self, overrides: Option<&LimitOverrides>) -> Self {
        let Some(o) = overrides else {
            return self;
        };
        if let Some(secs) = o.timeout_seconds.filter(|v| *v > 0) {
            self.timeout = self.timeout.min(Duration::from_secs(secs));
        }
        if let Some(secs) = o.cpu_seconds.filter(|v| *v > 0) {
            self.cpu_seconds = self.cpu_seconds.min(secs);
        }
        if let Some(mb) = o.memory_mb.filter(|v| *v > 0) {
            self.memory_bytes = self.memory_bytes.min(mb.saturating_mul(MIB));
        }
        if let Some(bytes) = o.max_output_bytes.filter(|v| *v > 0) {
            self.max_output_bytes = self.max_output_bytes.min(bytes);
        }
        self
    }

    /// ulimits handed to the container runtime alongside the cgroup limits.
    pub fn container_ulimits(&self) -> Vec<ResourcesUlimits> {
        let ulimit = |name: &str, soft: u64, hard: u64| ResourcesUlimits {
            name: Some(name.to_string()),
            soft: Some(clamp_i64(soft)),
            hard: Some(clamp_i64(hard)),
        };
        vec![
            ulimit("cpu", self.cpu_seconds, self.cpu_seconds + 1),
            ulimit("fsize", self.max_file_bytes, self.max_file_bytes),
            ulimit("nofile", self.max_open_files, self.max_open_files),
            ulimit("core", 0, 0),
        ]
    }
}

pub(crate) fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Why the supervisor ended a session early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    TimedOut,
    OutputOverflow,
    Cancelled,
}

/// Owns the wall-clock deadline of one session.
#[derive(Debug, Clone)]
pub struct Watchdog {
    deadline: Instant,
    cancel: CancellationToken,
}

impl Watchdog {
    pub fn start(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    /// Resolves when the deadline passes or the caller cancels.
    pub async fn tripped(&self) -> Termination {
        tokio::select! {
            _ = tokio::time::sleep_until(self.deadline) => Termination::TimedOut,
            _ = self.cancel.cancelled() => Termination::Cancelled,
        }
    }
}

/// Bytes read from a stream, capped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CappedOutput {
    pub bytes: Vec<u8>,
    pub total: u64,
    pub overflowed: bool,
}

impl CappedOutput {
    pub fn push(&mut self, chunk: &[u8], cap: u64) {
        self.total += chunk.len() as u64;
        let room = cap.saturating_sub(self.bytes.len() as u64) as usize;
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if self.total > cap {
            self.overflowed = true;
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Read `reader` to EOF keeping at most `cap` bytes.
///
/// With `stop_on_overflow` the read ends as soon as the cap is passed, which
/// lets the supervisor kill the writer; otherwise the excess is drained and
/// discarded so the writer never blocks on a full pipe.
pub async fn read_capped<R>(mut reader: R, cap: u64, stop_on_overflow: bool) -> std::io::Result<CappedOutput>
where
    R: AsyncRead + Unpin,
{
    let mut out = CappedOutput::default();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        out.push(&buf[..n], cap);
        if out.overflowed && stop_on_overflow {
            break;
        }
    }
    Ok(out)
}

/// Map a terminating signal to the ceiling that most likely raised it.
///
/// SIGXCPU is the soft CPU rlimit and SIGXFSZ the file size rlimit. SIGKILL
/// that the supervisor did not send comes from the kernel: the OOM killer or
/// the hard CPU rlimit, and the latter only fires if SIGXCPU was ignored,
/// which user code cannot arrange.
pub fn classify_signal(signal: i32) -> Option<ResourceKind> {
    match signal {
        libc::SIGXCPU => Some(ResourceKind::Cpu),
        libc::SIGXFSZ => Some(ResourceKind::OutputSize),
        libc::SIGKILL => Some(ResourceKind::Memory),
        _ => None,
    }
}

/// Lower the calling process's own ceilings. Runs in the forked child just
/// before `exec`, so only async-signal-safe calls are allowed here.
#[cfg(unix)]
pub fn apply_rlimits(limits: &ResourceLimits) -> std::io::Result<()> {
    fn check(rc: libc::c_int) -> std::io::Result<()> {
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
    fn rlimit(soft: u64, hard: u64) -> libc::rlimit {
        libc::rlimit {
            rlim_cur: soft as libc::rlim_t,
            rlim_max: hard as libc::rlim_t,
        }
    }

    // SAFETY: setrlimit only reads the struct passed by reference.
    unsafe {
        check(libc::setrlimit(
            libc::RLIMIT_AS,
            &rlimit(limits.memory_bytes, limits.memory_bytes),
        ))?;
        check(libc::setrlimit(
            libc::RLIMIT_CPU,
            &rlimit(limits.cpu_seconds, limits.cpu_seconds + 1),
        ))?;
        check(libc::setrlimit(
            libc::RLIMIT_NPROC,
            &rlimit(limits.max_processes, limits.max_processes),
        ))?;
        check(libc::setrlimit(
            libc::RLIMIT_FSIZE,
            &rlimit(limits.max_file_bytes, limits.max_file_bytes),
        ))?;
        check(libc::setrlimit(
            libc::RLIMIT_NOFILE,
            &rlimit(limits.max_open_files, limits.max_open_files),
        ))?;
        check(libc::setrlimit(libc::RLIMIT_CORE, &rlimit(0, 0)))?;
    }
    Ok(())
}
