//! Task execution: parameter resolution, invocation, write-backs.
//!
//! The user-code invocation is the only place arbitrary, unbounded-duration
//! code runs. It happens on the blocking pool with panics contained; nothing
//! here holds the cache lock across it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use crate::context::WorkerContext;
use crate::error::{
    ExitCode, FatalError, ProtocolError, SerializationError, TaskFailure, UserCodeError,
};
use crate::message;
use crate::registry::CallContext;
use crate::store;
use crate::task::direction::Direction;
use crate::task::spec::{FailurePolicy, ParamType, ParamValue, TaskSpec};

/// Tagged result of one task, consulted against the task's failure policy.
#[derive(Debug)]
pub enum TaskOutcome {
    Success {
        types: Vec<ParamType>,
        values: Vec<String>,
    },
    Failure(TaskFailure),
}

impl TaskOutcome {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Success { .. } => ExitCode::Success,
            Self::Failure(f) => f.exit_code(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Either a reportable per-task failure or a slot-terminating fault.
enum Interrupt {
    Task(TaskFailure),
    Fatal(FatalError),
}

impl From<ProtocolError> for Interrupt {
    fn from(e: ProtocolError) -> Self {
        Self::Task(e.into())
    }
}

impl From<SerializationError> for Interrupt {
    fn from(e: SerializationError) -> Self {
        Self::Task(e.into())
    }
}

impl From<UserCodeError> for Interrupt {
    fn from(e: UserCodeError) -> Self {
        Self::Task(e.into())
    }
}

pub struct TaskExecutor {
    ctx: Arc<WorkerContext>,
}

impl TaskExecutor {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    /// Execute one task, applying its failure policy.
    ///
    /// `Err` means the slot can no longer be trusted (cache invariant
    /// violation); per-task failures come back as [`TaskOutcome::Failure`].
    pub async fn execute(&self, spec: &TaskSpec) -> Result<TaskOutcome, FatalError> {
        let mut attempt: u32 = 0;
        loop {
            let outcome = match self.run(spec).await {
                Ok(outcome) => outcome,
                Err(Interrupt::Task(failure)) => TaskOutcome::Failure(failure),
                Err(Interrupt::Fatal(fatal)) => return Err(fatal),
            };

            if let TaskOutcome::Failure(failure) = &outcome {
                match spec.on_failure {
                    FailurePolicy::Retry if attempt < spec.retries => {
                        attempt += 1;
                        tracing::warn!(
                            task = %spec.qualified_name,
                            attempt,
                            retries = spec.retries,
                            error = %failure,
                            "Task failed, retrying"
                        );
                        continue;
                    }
                    FailurePolicy::Ignore => {
                        tracing::warn!(
                            task = %spec.qualified_name,
                            error = %failure,
                            "Task failed, ignoring per policy"
                        );
                        return Ok(self.ignored_success(spec));
                    }
                    _ => {}
                }
            }
            return Ok(outcome);
        }
    }

    /// Success shape for IGNORE policy: parameter pairs only, no returns.
    fn ignored_success(&self, spec: &TaskSpec) -> TaskOutcome {
        let (types, values) = param_pairs(spec);
        TaskOutcome::Success { types, values }
    }

    async fn run(&self, spec: &TaskSpec) -> Result<TaskOutcome, Interrupt> {
        let started = Instant::now();
        let callable = self.ctx.registry().resolve(&spec.qualified_name)?;

        // Held for the full task body: commutative tasks on the same object
        // never overlap across slots.
        let _commutative_guards = self
            .ctx
            .commutative()
            .lock_all(&spec.commutative_identifiers())
            .await;

        if spec.tracing || self.ctx.config().debug {
            tracing::debug!(
                task = %spec.qualified_name,
                params = spec.parameters.len(),
                returns = spec.return_count,
                "Executing task"
            );
        }

        // Resolve runtime values in declared order. Cache pins taken here are
        // owed back on every exit path below.
        let mut pinned: Vec<(Direction, String)> = Vec::new();
        let mut args = Vec::with_capacity(spec.parameters.len());
        for param in &spec.parameters {
            let value = match (&param.value, param.direction) {
                // Files and streams hand their identifier through whatever
                // the direction: the task works on the target in place.
                (ParamValue::Reference(id), _) if param.ptype.is_reference_only() => {
                    serde_json::Value::String(id.clone())
                }
                (_, Direction::Out) => serde_json::Value::Null,
                (ParamValue::Literal(v), _) => v.clone(),
                (ParamValue::Reference(id), direction) => {
                    let store = Arc::clone(self.ctx.store());
                    let key = id.clone();
                    let loaded = self
                        .ctx
                        .cache()
                        .get_or_load(id, move || async move {
                            let bytes = store.read(&key).await?;
                            let size = bytes.len() as u64;
                            let value = store::from_bytes(&key, &bytes)?;
                            Ok((value, size))
                        })
                        .await;
                    match loaded {
                        Ok(handle) => {
                            pinned.push((direction, id.clone()));
                            (*handle).clone()
                        }
                        Err(e) => {
                            self.release_pins(&pinned)?;
                            return Err(e.into());
                        }
                    }
                }
            };
            args.push(value);
        }

        // Invoke the registered callable. Arbitrary user code: contained on
        // the blocking pool, panics converted to UserCodeError.
        let call_ctx = CallContext {
            working_dir: spec.working_dir.clone(),
            tracing: spec.tracing,
        };
        let mut values = args;
        let joined = tokio::task::spawn_blocking(move || {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                callable(&call_ctx, &mut values)
            }));
            (values, result)
        })
        .await;

        let (args, call_result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                self.release_pins(&pinned)?;
                return Err(UserCodeError::new(format!("task aborted: {e}")).into());
            }
        };

        let returns = match call_result {
            Ok(Ok(returns)) => returns,
            Ok(Err(message)) => {
                self.release_pins(&pinned)?;
                return Err(UserCodeError::new(message).into());
            }
            Err(payload) => {
                self.release_pins(&pinned)?;
                return Err(UserCodeError::new(panic_message(&payload)).into());
            }
        };

        // Read-only pins are done once the call returns.
        let (held, done): (Vec<_>, Vec<_>) = pinned
            .into_iter()
            .partition(|(direction, _)| direction.holds_pin());
        self.release_pins(&done)?;

        // Write back mutated outputs, then invalidate so the next reader
        // anywhere re-loads the fresh store content. Completed write-backs
        // are never rolled back.
        for (i, param) in spec.parameters.iter().enumerate() {
            if !param.direction.writes_back() {
                continue;
            }
            // Reference-only types are mutated in place by the task; the
            // argument is just the identifier, never an object to store.
            if param.ptype.is_reference_only() {
                continue;
            }
            let Some(id) = param.value.reference() else {
                continue;
            };
            let bytes = match store::to_bytes(id, &args[i]) {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.release_pins(&held)?;
                    return Err(e.into());
                }
            };
            if let Err(e) = self.ctx.store().write(id, &bytes).await {
                self.release_pins(&held)?;
                return Err(e.into());
            }
            self.ctx.cache().invalidate(id);
        }

        // Invalidation consumed the INOUT pins with their entries; whatever
        // is left (commutative holds, INOUT ids invalidated above) releases
        // here — release after invalidate is a no-op.
        self.release_pins(&held)?;

        if returns.len() != spec.return_count {
            return Err(UserCodeError::new(format!(
                "declared {} return values, task produced {}",
                spec.return_count,
                returns.len()
            ))
            .into());
        }

        let (mut types, mut values) = param_pairs(spec);
        for ret in &returns {
            types.push(ParamType::Object);
            values.push(message::encode_return_value(ret)?);
        }

        tracing::debug!(
            task = %spec.qualified_name,
            elapsed = ?started.elapsed(),
            "Task finished"
        );
        Ok(TaskOutcome::Success { types, values })
    }

    fn release_pins(&self, pins: &[(Direction, String)]) -> Result<(), Interrupt> {
        for (_, id) in pins {
            self.ctx
                .cache()
                .release(id)
                .map_err(Interrupt::Fatal)?;
        }
        Ok(())
    }
}

/// Per-parameter return pairs: persistent objects report their identifier,
/// everything else reports `null`.
fn param_pairs(spec: &TaskSpec) -> (Vec<ParamType>, Vec<String>) {
    let mut types = Vec::with_capacity(spec.parameters.len());
    let mut values = Vec::with_capacity(spec.parameters.len());
    for param in &spec.parameters {
        types.push(param.ptype);
        let value = match (param.ptype.is_persistent(), param.value.reference()) {
            (true, Some(id)) => id.to_string(),
            _ => message::NULL_VALUE.to_string(),
        };
        values.push(value);
    }
    (types, values)
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("task panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("task panicked: {s}")
    } else {
        "task panicked".to_string()
    }
}
