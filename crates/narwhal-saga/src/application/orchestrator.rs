//! The saga orchestrator: registration, forward execution, compensation and recovery.
//!
//! Every saga executes on its own task under a child of the orchestrator's
//! shutdown token. The store is written before each state transition and
//! after each step so a restarted process resumes at `current_step`.
//! Shutdown interrupts the running step without compensating.

use std::collections::HashMap;
use std::sync::Arc;

use narwhal_core::clock::Clock;
use narwhal_core::context::Context;
use narwhal_core::envelope::IntegrationEnvelope;
use narwhal_core::error::DomainError;
use narwhal_core::ports::IntegrationPublisher;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::store::SagaStore;
use crate::domain::events::{
    SAGA_AGGREGATE_TYPE, SAGA_COMPENSATED_EVENT_TYPE, SAGA_COMPLETED_EVENT_TYPE, SAGA_FAILED_EVENT_TYPE,
    SAGA_STARTED_EVENT_TYPE, SagaCompensated, SagaCompleted, SagaFailed, SagaStarted, SagaStepRecorded,
    step_compensated_event_type, step_completed_event_type,
};
use crate::domain::saga::{Saga, SagaData, SagaState};
use crate::domain::step::{SagaDefinition, SagaStep};
use crate::error::SagaError;

/// A started saga and its background execution.
#[derive(Debug)]
pub struct SagaHandle {
    /// The saga as persisted when execution was scheduled.
    pub saga: Saga,
    task: JoinHandle<Result<Saga, DomainError>>,
}

impl SagaHandle {
    /// Saga identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.saga.id
    }

    /// Waits for the execution task and returns the saga as it stopped.
    ///
    /// An interrupted saga comes back in `running` or `compensating`.
    ///
    /// # Errors
    ///
    /// Returns the store failure that ended execution, or
    /// `DomainError::Infrastructure` if the task panicked.
    pub async fn wait(self) -> Result<Saga, DomainError> {
        self.task
            .await
            .map_err(|e| DomainError::Infrastructure(format!("saga task failed: {e}")))?
    }
}

struct Inner {
    definitions: RwLock<HashMap<String, Arc<dyn SagaDefinition>>>,
    store: Arc<dyn SagaStore>,
    publisher: Arc<dyn IntegrationPublisher>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Runs registered saga definitions.
#[derive(Clone)]
pub struct SagaOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SagaOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaOrchestrator")
            .field("saga_types", &self.saga_types())
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

impl SagaOrchestrator {
    /// Creates an orchestrator with no definitions.
    #[must_use]
    pub fn new(store: Arc<dyn SagaStore>, publisher: Arc<dyn IntegrationPublisher>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                definitions: RwLock::new(HashMap::new()),
                store,
                publisher,
                clock,
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Registers a definition, replacing one of the same type.
    pub fn register(&self, definition: Arc<dyn SagaDefinition>) {
        let saga_type = definition.saga_type().to_owned();
        info!(saga_type = %saga_type, steps = definition.steps().len(), "registered saga definition");
        self.inner.definitions.write().insert(saga_type, definition);
    }

    /// Registered type names, sorted.
    #[must_use]
    pub fn saga_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.inner.definitions.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SagaStore> {
        &self.inner.store
    }

    /// Number of sagas currently executing.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Persists a new saga, publishes `SagaStarted` and schedules execution.
    ///
    /// Returns as soon as execution is scheduled.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for an unregistered type, or the
    /// store failure.
    pub async fn start_saga(&self, ctx: &Context, saga_type: &str, data: SagaData) -> Result<SagaHandle, DomainError> {
        let definition = self.inner.definition(saga_type)?;
        ctx.check()?;
        let saga = Saga::new(saga_type, data, self.inner.clock.now());
        self.inner.store.save(ctx, &saga).await?;
        self.inner
            .publish(
                ctx,
                &saga,
                SAGA_STARTED_EVENT_TYPE,
                &SagaStarted {
                    saga_id: saga.id,
                    saga_type: saga.saga_type.clone(),
                    data: saga.data.clone(),
                },
            )
            .await;
        info!(saga_id = %saga.id, saga_type, correlation_id = ctx.correlation_id(), "saga started");
        Ok(self.spawn(ctx, saga, definition))
    }

    /// Loads a saga.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` for an unknown id.
    pub async fn get_saga(&self, ctx: &Context, id: Uuid) -> Result<Saga, DomainError> {
        self.inner.store.get(ctx, id).await
    }

    /// Resumes every saga left `pending`, `running` or `compensating`.
    ///
    /// Forward execution re-runs `current_step`; compensation continues
    /// downward from it. A saga whose type is no longer registered is
    /// marked `failed`.
    ///
    /// # Errors
    ///
    /// Returns the store failure.
    pub async fn resume_incomplete(&self, ctx: &Context) -> Result<Vec<SagaHandle>, DomainError> {
        let sagas = self.inner.store.find_incomplete(ctx).await?;
        let mut handles = Vec::with_capacity(sagas.len());
        for mut saga in sagas {
            match self.inner.definition(&saga.saga_type) {
                Ok(definition) => {
                    info!(
                        saga_id = %saga.id,
                        saga_type = %saga.saga_type,
                        state = %saga.state,
                        current_step = saga.current_step,
                        "resuming saga"
                    );
                    handles.push(self.spawn(ctx, saga, definition));
                }
                Err(err) => {
                    error!(saga_id = %saga.id, saga_type = %saga.saga_type, error = %err, "cannot resume saga");
                    saga.error = Some(err.to_string());
                    saga.finish(SagaState::Failed, self.inner.clock.now());
                    self.inner.store.save(ctx, &saga).await?;
                    let payload = SagaFailed {
                        saga_id: saga.id,
                        saga_type: saga.saga_type.clone(),
                        error: err.to_string(),
                    };
                    self.inner.publish(ctx, &saga, SAGA_FAILED_EVENT_TYPE, &payload).await;
                }
            }
        }
        Ok(handles)
    }

    /// Interrupts every executing saga and waits for the tasks to stop.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("saga orchestrator stopped");
    }

    fn spawn(&self, ctx: &Context, saga: Saga, definition: Arc<dyn SagaDefinition>) -> SagaHandle {
        let run_ctx = execution_context(ctx, &self.inner.shutdown);
        let inner = Arc::clone(&self.inner);
        let snapshot = saga.clone();
        let task = self.inner.tasks.spawn(async move {
            let saga_id = saga.id;
            let result = inner.run(&run_ctx, saga, definition.steps()).await;
            if let Err(err) = &result {
                error!(saga_id = %saga_id, error = %err, "saga execution aborted");
            }
            result
        });
        SagaHandle { saga: snapshot, task }
    }
}

fn continue_trace(base: Context, ctx: &Context) -> Context {
    let base = base.with_correlation(ctx.correlation_id());
    match ctx.causation_id() {
        Some(causation_id) => base.with_causation(causation_id),
        None => base,
    }
}

/// A context tied to the orchestrator's lifetime, continuing the caller's trace.
fn execution_context(ctx: &Context, shutdown: &CancellationToken) -> Context {
    continue_trace(Context::with_token(shutdown.child_token()), ctx)
}

/// Store writes and publishes outlive shutdown of the step they record.
fn storage_context(ctx: &Context) -> Context {
    continue_trace(Context::background(), ctx)
}

fn step_payload(saga: &Saga, step: &dyn SagaStep, index: usize) -> SagaStepRecorded {
    SagaStepRecorded {
        saga_id: saga.id,
        saga_type: saga.saga_type.clone(),
        step: step.name().to_owned(),
        step_index: index,
    }
}

impl Inner {
    fn definition(&self, saga_type: &str) -> Result<Arc<dyn SagaDefinition>, DomainError> {
        self.definitions
            .read()
            .get(saga_type)
            .cloned()
            .ok_or_else(|| SagaError::UnknownSagaType(saga_type.to_owned()).into())
    }

    async fn save(&self, ctx: &Context, saga: &mut Saga) -> Result<(), DomainError> {
        saga.touch(self.clock.now());
        self.store.save(&storage_context(ctx), saga).await
    }

    async fn run(&self, ctx: &Context, mut saga: Saga, steps: &[Arc<dyn SagaStep>]) -> Result<Saga, DomainError> {
        if saga.state == SagaState::Compensating {
            let from = (saga.current_step + 1).min(saga.completed_steps.len());
            return self.compensate(ctx, saga, steps, from).await;
        }

        self.store
            .update_state(&storage_context(ctx), saga.id, SagaState::Running)
            .await?;
        saga.mark_started(self.clock.now());

        let resume_at = saga.completed_steps.len();
        for (index, step) in steps.iter().enumerate().skip(resume_at) {
            if ctx.is_cancelled() {
                info!(saga_id = %saga.id, current_step = saga.current_step, "saga interrupted before step");
                return Ok(saga);
            }
            saga.current_step = index;
            self.save(ctx, &mut saga).await?;
            debug!(saga_id = %saga.id, step = step.name(), step_index = index, "executing saga step");

            match step.execute(ctx, &mut saga).await {
                Ok(()) => {
                    saga.completed_steps.push(step.name().to_owned());
                    self.save(ctx, &mut saga).await?;
                    let payload = step_payload(&saga, step.as_ref(), index);
                    self.publish(ctx, &saga, &step_completed_event_type(step.name()), &payload)
                        .await;
                    info!(saga_id = %saga.id, step = step.name(), "saga step completed");
                }
                Err(err) if ctx.is_cancelled() => {
                    info!(saga_id = %saga.id, step = step.name(), error = %err, "saga step interrupted by shutdown");
                    self.save(ctx, &mut saga).await?;
                    return Ok(saga);
                }
                Err(err) => {
                    warn!(saga_id = %saga.id, step = step.name(), error = %err, "saga step failed, compensating");
                    saga.error = Some(err.to_string());
                    saga.state = SagaState::Compensating;
                    self.save(ctx, &mut saga).await?;
                    return self.compensate(ctx, saga, steps, index).await;
                }
            }
        }

        saga.finish(SagaState::Completed, self.clock.now());
        self.save(ctx, &mut saga).await?;
        let payload = SagaCompleted {
            saga_id: saga.id,
            saga_type: saga.saga_type.clone(),
        };
        self.publish(ctx, &saga, SAGA_COMPLETED_EVENT_TYPE, &payload).await;
        info!(saga_id = %saga.id, saga_type = %saga.saga_type, "saga completed");
        Ok(saga)
    }

    /// Compensates `steps[..from]` in reverse.
    async fn compensate(
        &self,
        ctx: &Context,
        mut saga: Saga,
        steps: &[Arc<dyn SagaStep>],
        from: usize,
    ) -> Result<Saga, DomainError> {
        let from = from.min(steps.len());
        for (index, step) in steps[..from].iter().enumerate().rev() {
            if ctx.is_cancelled() {
                info!(saga_id = %saga.id, current_step = saga.current_step, "saga compensation interrupted");
                return Ok(saga);
            }
            saga.current_step = index;
            self.save(ctx, &mut saga).await?;

            match step.compensate(ctx, &saga).await {
                Ok(()) => debug!(saga_id = %saga.id, step = step.name(), "saga step compensated"),
                Err(_) if ctx.is_cancelled() => {
                    info!(saga_id = %saga.id, step = step.name(), "saga compensation interrupted by shutdown");
                    return Ok(saga);
                }
                Err(err) => {
                    warn!(saga_id = %saga.id, step = step.name(), error = %err, "compensation failed, continuing");
                }
            }
            let payload = step_payload(&saga, step.as_ref(), index);
            self.publish(ctx, &saga, &step_compensated_event_type(step.name()), &payload)
                .await;
        }

        saga.finish(SagaState::Compensated, self.clock.now());
        self.save(ctx, &mut saga).await?;
        let payload = SagaCompensated {
            saga_id: saga.id,
            saga_type: saga.saga_type.clone(),
            error: saga.error.clone().unwrap_or_default(),
        };
        self.publish(ctx, &saga, SAGA_COMPENSATED_EVENT_TYPE, &payload).await;
        info!(saga_id = %saga.id, saga_type = %saga.saga_type, error = ?saga.error, "saga compensated");
        Ok(saga)
    }

    /// Publishes a lifecycle event; the store stays authoritative when this fails.
    async fn publish<T: Serialize>(&self, ctx: &Context, saga: &Saga, event_type: &str, payload: &T) {
        let data = match serde_json::to_value(payload) {
            Ok(data) => data,
            Err(err) => {
                warn!(saga_id = %saga.id, event_type, error = %err, "failed to encode saga event");
                return;
            }
        };
        let publish_ctx = storage_context(ctx);
        let envelope = IntegrationEnvelope::new(
            event_type,
            SAGA_AGGREGATE_TYPE,
            saga.id,
            data,
            &publish_ctx,
            self.clock.now(),
        );
        if let Err(err) = self.publisher.publish(&publish_ctx, envelope).await {
            warn!(saga_id = %saga.id, event_type, error = %err, "failed to publish saga event");
        }
    }
}
