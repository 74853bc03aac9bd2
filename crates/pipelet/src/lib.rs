//! pipelet: persistent worker protocol and object cache.
//!
//! An external orchestrator dispatches tasks over per-slot pipe pairs using
//! a line-oriented command protocol. Each slot executes one command at a
//! time against a shared registry of callables, with a process-wide pinned
//! LRU cache of deserialized objects between tasks.

pub mod bridge;
pub mod logging;
pub mod task;

mod cache;
mod commutative;
mod context;
mod error;
mod message;
mod pool;
mod registry;
mod store;

pub use cache::ObjectCache;
pub use commutative::CommutativeLocks;
pub use context::{WorkerConfig, WorkerContext};
pub use error::{
    ExitCode, FatalError, ProtocolError, SerializationError, TaskFailure, UserCodeError,
};
pub use message::{
    NULL_VALUE, build_return_message, decode_return_value, encode_error_value,
    encode_return_value, parse_return_message,
};
pub use pool::{ExecutorPool, PoolError, PoolState, SlotId};
pub use registry::{CallContext, TaskFn, TaskRegistry, TaskRegistryBuilder};
pub use store::{FsStore, MemoryStore, ObjectStore};
pub use task::direction::Direction;
pub use task::executor::{TaskExecutor, TaskOutcome};
pub use task::spec::{FailurePolicy, ParamType, ParamValue, Parameter, TaskSpec};
