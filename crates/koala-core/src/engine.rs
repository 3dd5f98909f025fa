//! Request pipeline: validate, admit, stage, run, marshal.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::{AdmissionPolicy, KoalaConfig};
use crate::errors::{EngineError, RequestError};
use crate::executors::{select_backend, BackendKind, IsolationBackend, IsolationLevel};
use crate::harness::Harness;
use crate::limits::{ResourceLimits, Termination};
use crate::marshal::ResultMarshaller;
use crate::request::ExecutionRequest;
use crate::result::ExecutionResult;
use crate::staging::DatasetStager;
use crate::validator::Validator;

/// Bounds how many sessions exist at once.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    policy: AdmissionPolicy,
    wait: Duration,
}

impl AdmissionGate {
    pub fn new(capacity: usize, policy: AdmissionPolicy, wait: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            policy,
            wait,
        }
    }

    /// Take a session slot. The slot is released when the permit is dropped.
    pub async fn admit(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit, RequestError> {
        let busy = RequestError::Backpressure {
            capacity: self.capacity,
        };
        match self.policy {
            AdmissionPolicy::Reject => self.semaphore.clone().try_acquire_owned().map_err(|_| busy),
            AdmissionPolicy::Queue => {
                let acquire = tokio::time::timeout(self.wait, self.semaphore.clone().acquire_owned());
                tokio::select! {
                    acquired = acquire => match acquired {
                        Ok(Ok(permit)) => Ok(permit),
                        Ok(Err(_)) | Err(_) => Err(busy),
                    },
                    _ = cancel.cancelled() => Err(RequestError::Cancelled),
                }
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active(&self) -> usize {
        self.capacity.saturating_sub(self.semaphore.available_permits())
    }
}

/// Readiness report for the orchestration layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineHealth {
    pub backend: BackendKind,
    pub isolation: IsolationLevel,
    pub max_concurrent_sessions: usize,
    pub active_sessions: usize,
    pub version: String,
}

pub struct ExecutionEngine {
    validator: Validator,
    stager: DatasetStager,
    harness: Harness,
    backend: Arc<dyn IsolationBackend>,
    gate: AdmissionGate,
    marshaller: ResultMarshaller,
    base_limits: ResourceLimits,
}

impl ExecutionEngine {
    /// Build an engine, probing the host for the configured backend.
    pub async fn from_config(config: KoalaConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let backend = select_backend(&config).await?;
        Ok(Self::with_backend(config, backend))
    }

    /// Build an engine around an already chosen backend.
    pub fn with_backend(config: KoalaConfig, backend: Arc<dyn IsolationBackend>) -> Self {
        Self {
            validator: Validator::new(&config.validator),
            stager: DatasetStager::new(config.staging.clone()),
            harness: Harness::new(config.harness.clone(), &config.validator),
            gate: AdmissionGate::new(
                config.engine.max_concurrent_sessions,
                config.engine.admission,
                Duration::from_secs(config.engine.admission_wait_seconds),
            ),
            marshaller: ResultMarshaller::new(&config.harness),
            base_limits: ResourceLimits::from_settings(&config.limits),
            backend,
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn health(&self) -> EngineHealth {
        let backend = self.backend.kind();
        EngineHealth {
            backend,
            isolation: backend.isolation(),
            max_concurrent_sessions: self.gate.capacity(),
            active_sessions: self.gate.active(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, RequestError> {
        self.execute_with_cancel(request, CancellationToken::new()).await
    }

    /// Run one request to completion or until `cancel` fires.
    ///
    /// Validation and staging failures return before any session exists.
    /// Once a session was spawned the outcome is always an envelope, except
    /// for cancellation, which is reported as [`RequestError::Cancelled`]
    /// after the session has been torn down.
    pub async fn execute_with_cancel(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, RequestError> {
        if let Err(rejection) = self.validator.validate(&request.script) {
            info!("Script rejected before execution: {}", rejection);
            return Err(rejection.into());
        }

        let permit = self.gate.admit(&cancel).await?;
        debug!(
            "Admitted request, {} of {} slots in use",
            self.gate.active(),
            self.gate.capacity()
        );

        let session = self.stager.stage(request).await?;
        self.harness.install(&session).await?;
        if cancel.is_cancelled() {
            session.close();
            return Err(RequestError::Cancelled);
        }

        let limits = self.base_limits.tightened(request.limits.as_ref());
        info!(
            "Starting session {} on {} backend ({} datasets, timeout {}s)",
            session.id(),
            self.backend.kind(),
            session.datasets().len(),
            limits.timeout.as_secs()
        );

        let outcome = self.backend.run(&session, &limits, &cancel).await;
        let result = match outcome {
            Ok(raw) if raw.termination == Some(Termination::Cancelled) => {
                info!("Session {} cancelled by caller", session.id());
                session.close();
                return Err(RequestError::Cancelled);
            }
            Ok(raw) => self.marshaller.marshal(&raw),
            Err(e) => {
                warn!("Backend failure in session {}: {}", session.id(), e);
                self.marshaller.marshal_backend_error(&e)
            }
        };

        match &result {
            ExecutionResult::ResourceExceeded { kind } => {
                warn!("Session {} exceeded its {} limit", session.id(), kind)
            }
            other => info!("Session {} finished: {}", session.id(), other.variant_name()),
        }
        session.close();
        drop(permit);
        Ok(result)
    }
}
