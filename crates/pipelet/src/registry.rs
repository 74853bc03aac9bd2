//! Task registry: qualified name to callable, populated once at startup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::ProtocolError;

/// Per-invocation context handed to the callable.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub working_dir: Option<PathBuf>,
    pub tracing: bool,
}

/// A registered task body.
///
/// Receives resolved argument values in declared order; OUT slots start as
/// `Null`, INOUT slots are mutated in place. Returns the produced values
/// (matching the declared return arity) or an error message.
pub type TaskFn = Arc<
    dyn Fn(&CallContext, &mut Vec<serde_json::Value>) -> Result<Vec<serde_json::Value>, String>
        + Send
        + Sync,
>;

pub struct TaskRegistry {
    tasks: HashMap<String, TaskFn>,
}

impl TaskRegistry {
    pub fn builder() -> TaskRegistryBuilder {
        TaskRegistryBuilder {
            tasks: HashMap::new(),
        }
    }

    /// Resolution failure is a per-task protocol error, not fatal to the slot.
    pub fn resolve(&self, qualified_name: &str) -> Result<TaskFn, ProtocolError> {
        self.tasks
            .get(qualified_name)
            .cloned()
            .ok_or_else(|| ProtocolError::UnknownSymbol(qualified_name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

pub struct TaskRegistryBuilder {
    tasks: HashMap<String, TaskFn>,
}

impl TaskRegistryBuilder {
    pub fn register<F>(mut self, qualified_name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&CallContext, &mut Vec<serde_json::Value>) -> Result<Vec<serde_json::Value>, String>
            + Send
            + Sync
            + 'static,
    {
        self.tasks.insert(qualified_name.into(), Arc::new(f));
        self
    }

    pub fn build(self) -> TaskRegistry {
        TaskRegistry { tasks: self.tasks }
    }
}
