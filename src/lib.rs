//! Core library for the multi-device render task dispatcher: a FIFO task
//! queue with device-eligibility rules, a TTL-backed task cache, and a thin
//! HTTP surface in front of them. The actual model inference, on-disk model
//! registry, and plugin system are external collaborators modeled only
//! through [`runtime_adapter::RuntimeAdapter`].

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod runtime_adapter;
pub mod state;
pub mod task;
pub mod task_cache;
pub mod worker;

pub use config::{AppConfig, CliArgs};
pub use dispatcher::{Dispatcher, DispatcherConfig, EnqueueOutcome};
pub use error::{DispatchError, Result};
pub use runtime_adapter::{MockRuntimeAdapter, RuntimeAdapter};
pub use state::{DispatcherState, ServerState};
pub use task::{RenderRequest, Task, TaskError};
pub use task_cache::TaskCache;
