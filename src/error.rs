// error.rs - Typed failures for the dispatcher, cache, and worker layers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("lock acquisition timed out after {0:?}")]
    LockTimeout(std::time::Duration),

    #[error("no render workers are alive")]
    NoWorkers,

    #[error("session {0} already has a pending task")]
    Pending(String),

    #[error("failed to admit task into cache")]
    AdmissionFailed,

    #[error("device {0} failed to initialize: {1}")]
    InitError(String, String),

    #[error("device {0} did not come online within the startup budget")]
    DeviceStartTimeout(String),

    #[error("cuda:0 is not available; remove the face-correction filter")]
    FilterUnavailable,

    #[error("{0} is not currently active")]
    DeviceUnavailable(String),

    #[error("render failed: {0}")]
    RuntimeFailure(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("server is shutting down")]
    Shutdown,

    #[error("unknown task {0}")]
    UnknownTask(String),

    #[error("task {0} is already stopped")]
    AlreadyStopped(String),

    #[error("no task is currently rendering")]
    NothingRendering,

    #[error("image slot {0} is not yet available")]
    SlotEmpty(usize),

    #[error("invalid render_devices value: {0}")]
    InvalidDeviceSpec(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

impl DispatchError {
    /// True for the handful of task-level failures that should be reported
    /// as a single failed/cancelled chunk rather than crashing the worker.
    pub fn is_task_level(&self) -> bool {
        matches!(
            self,
            DispatchError::FilterUnavailable
                | DispatchError::DeviceUnavailable(_)
                | DispatchError::RuntimeFailure(_)
                | DispatchError::Cancelled
        )
    }
}
