//! Classification of raw session outcomes into result envelopes
//!
//! Supervisor terminations and kernel kills are checked before the harness
//! report is even looked at, so a killed session can never come back as a
//! truncated success.

use log::debug;
use serde::Deserialize;

use crate::config::HarnessSettings;
use crate::errors::BackendError;
use crate::executors::{ExitKind, RawOutcome, ResultFile};
use crate::harness::{EXIT_HARNESS_ERROR, EXIT_OK, EXIT_OUT_OF_MEMORY};
use crate::limits::{classify_signal, Termination};
use crate::result::{ExecutionResult, Output, ResourceKind};

/// What the runner writes to `output/result.json`.
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum HarnessReport {
    Ok {
        outputs: Vec<Output>,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stdout_truncated: bool,
    },
    Error {
        error_kind: String,
        message: String,
        #[serde(default)]
        trace: String,
    },
    HarnessError {
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct ResultMarshaller {
    max_trace_bytes: usize,
}

impl ResultMarshaller {
    pub fn new(settings: &HarnessSettings) -> Self {
        Self {
            max_trace_bytes: settings.max_trace_bytes,
        }
    }

    pub fn marshal(&self, outcome: &RawOutcome) -> ExecutionResult {
        debug!(
            "Classifying outcome: exit={:?} termination={:?} oom={} result_file={}",
            outcome.exit,
            outcome.termination,
            outcome.oom_killed,
            match &outcome.result_file {
                ResultFile::Missing => "missing".to_string(),
                ResultFile::TooLarge { size } => format!("{} bytes, too large", size),
                ResultFile::Contents(bytes) => format!("{} bytes", bytes.len()),
            }
        );

        match outcome.termination {
            Some(Termination::TimedOut) => return exceeded(ResourceKind::Timeout),
            Some(Termination::OutputOverflow) => return exceeded(ResourceKind::OutputSize),
            Some(Termination::Cancelled) => {
                return ExecutionResult::InfrastructureFailure {
                    reason: "session was cancelled before it finished".to_string(),
                }
            }
            None => {}
        }
        if outcome.oom_killed {
            return exceeded(ResourceKind::Memory);
        }
        if let ExitKind::Signal(signal) = outcome.exit {
            return match classify_signal(signal) {
                Some(kind) => exceeded(kind),
                None => ExecutionResult::RuntimeFailure {
                    error_kind: "Crashed".to_string(),
                    message: format!("interpreter terminated by signal {}", signal),
                    trace: self.tail(&outcome.stderr.text()),
                },
            };
        }

        match &outcome.result_file {
            ResultFile::TooLarge { .. } => exceeded(ResourceKind::OutputSize),
            ResultFile::Contents(bytes) => self.from_report(bytes),
            ResultFile::Missing => self.without_report(outcome),
        }
    }

    /// A backend that could not run the session at all.
    pub fn marshal_backend_error(&self, err: &BackendError) -> ExecutionResult {
        ExecutionResult::InfrastructureFailure {
            reason: err.to_string(),
        }
    }

    fn from_report(&self, bytes: &[u8]) -> ExecutionResult {
        let report: HarnessReport = match serde_json::from_slice(bytes) {
            Ok(report) => report,
            Err(e) => {
                return ExecutionResult::InfrastructureFailure {
                    reason: format!("harness result could not be decoded: {}", e),
                }
            }
        };

        match report {
            HarnessReport::Ok {
                outputs,
                stdout,
                stdout_truncated,
            } => ExecutionResult::Success {
                outputs,
                stdout_text: stdout,
                stdout_truncated,
            },
            // the address-space rlimit surfaces as an exception, not a kill
            HarnessReport::Error { error_kind, .. } if error_kind == "MemoryError" => {
                exceeded(ResourceKind::Memory)
            }
            HarnessReport::Error {
                error_kind,
                message,
                trace,
            } => ExecutionResult::RuntimeFailure {
                error_kind,
                message: self.head(&message),
                trace: self.tail(&trace),
            },
            HarnessReport::HarnessError { message } => ExecutionResult::InfrastructureFailure {
                reason: format!("harness failed: {}", message),
            },
        }
    }

    fn without_report(&self, outcome: &RawOutcome) -> ExecutionResult {
        match outcome.exit {
            ExitKind::Code(126) | ExitKind::Code(127) => ExecutionResult::InfrastructureFailure {
                reason: "sandbox interpreter could not be started".to_string(),
            },
            ExitKind::Code(EXIT_OUT_OF_MEMORY) => exceeded(ResourceKind::Memory),
            ExitKind::Code(code) if code == EXIT_OK || code == EXIT_HARNESS_ERROR => {
                let stderr = outcome.stderr.text();
                ExecutionResult::InfrastructureFailure {
                    reason: if stderr.trim().is_empty() {
                        format!("harness exited with status {} without a result", code)
                    } else {
                        format!("harness exited with status {}: {}", code, self.tail(stderr.trim()))
                    },
                }
            }
            ExitKind::Code(code) => ExecutionResult::RuntimeFailure {
                error_kind: "InterpreterExit".to_string(),
                message: format!("interpreter exited with status {}", code),
                trace: self.tail(&outcome.stderr.text()),
            },
            ExitKind::Signal(_) | ExitKind::Unknown => ExecutionResult::InfrastructureFailure {
                reason: "session ended without an exit status".to_string(),
            },
        }
    }

    /// The last `max_trace_bytes` of `text`; the innermost frames are at the end.
    fn tail(&self, text: &str) -> String {
        if text.len() <= self.max_trace_bytes {
            return text.to_string();
        }
        let mut start = text.len() - self.max_trace_bytes;
        while !text.is_char_boundary(start) {
            start += 1;
        }
        format!("...{}", &text[start..])
    }

    fn head(&self, text: &str) -> String {
        if text.len() <= self.max_trace_bytes {
            return text.to_string();
        }
        let mut end = self.max_trace_bytes;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    }
}

fn exceeded(kind: ResourceKind) -> ExecutionResult {
    ExecutionResult::ResourceExceeded { kind }
}
