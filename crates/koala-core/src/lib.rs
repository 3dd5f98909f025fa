//! Sandboxed execution engine for machine-generated data-analysis scripts.
//!
//! A caller hands over a finished script plus named datasets and receives one
//! bounded, structured result envelope. In between, the script is screened,
//! its inputs are copied into a private session directory, and it runs under
//! hard resource ceilings in a session that is always destroyed afterwards.
//!
//! # Architecture Overview
//!
//! - **Validation** ([`validator`]): lexical screening that rejects hostile
//!   scripts before anything is spawned
//! - **Staging** ([`staging`]): per-session working directories and dataset copies
//! - **Harness** ([`harness`]): scaffolding that binds datasets, captures outputs
//!   and serialises them
//! - **Isolation** ([`executors`]): container and process backends behind one trait,
//!   selected once at startup
//! - **Limits** ([`limits`]): wall-clock watchdog, rlimits, cgroup limits and output caps
//! - **Marshalling** ([`marshal`]): classification of raw outcomes into envelopes
//! - **Engine** ([`engine`]): the admission gate and the request pipeline

pub mod config;
pub mod engine;
pub mod errors;
pub mod executors;
pub mod harness;
pub mod limits;
pub mod marshal;
pub mod request;
pub mod result;
pub mod staging;
pub mod validator;

pub use config::*;
pub use engine::{AdmissionGate, EngineHealth, ExecutionEngine};
pub use errors::{BackendError, EngineError, RequestError, StagingError};
pub use executors::{active_backend, BackendKind, IsolationBackend, IsolationLevel, RawOutcome};
pub use limits::{LimitOverrides, ResourceLimits};
pub use request::{
    binding_name_from_filename, ColumnSchema, DatasetBinding, DatasetFormat, DatasetSource,
    ExecutionRequest,
};
pub use result::{DataValue, ExecutionResult, Output, ResourceKind, TypedValue};
pub use validator::{Rejection, RejectionRule, Validator};
