// task.rs - One rendering job: request payload, completion signal, error
// slot, streaming chunk buffer, and temp-image slots.

use crate::error::DispatchError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Request body for `POST /render`. Fields the dispatcher cares about are
/// named explicitly; everything else (prompt, seed, sampler, dimensions, ...)
/// is forwarded opaquely to the runtime as `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderRequest {
    pub session_id: String,
    pub render_device: Option<String>,
    pub use_face_correction: Option<String>,
    #[serde(default = "default_model")]
    pub use_stable_diffusion_model: String,
    pub use_vae_model: Option<String>,
    #[serde(default)]
    pub stream_progress_updates: bool,
    #[serde(default)]
    pub stream_image_progress: bool,
    #[serde(default = "default_num_outputs")]
    pub num_outputs: u32,
    #[serde(default)]
    pub show_only_filtered_image: bool,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_model() -> String {
    "sd-v1-4".to_string()
}

fn default_num_outputs() -> u32 {
    1
}

impl RenderRequest {
    fn temp_image_slots(&self) -> usize {
        let multiplier = if self.show_only_filtered_image { 1 } else { 2 };
        (self.num_outputs as usize).max(1) * multiplier
    }
}

/// Distinguished error stored on `Task::error`: either a user-facing
/// failure or a cooperative cancel sentinel.
#[derive(Debug, Clone)]
pub enum TaskError {
    Failure(String),
    Cancelled,
}

impl TaskError {
    pub fn detail(&self) -> &str {
        match self {
            TaskError::Failure(msg) => msg,
            TaskError::Cancelled => "task cancelled",
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            TaskError::Failure(_) => "failed",
            TaskError::Cancelled => "cancelled",
        }
    }
}

impl From<DispatchError> for TaskError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Cancelled => TaskError::Cancelled,
            other => TaskError::Failure(other.to_string()),
        }
    }
}

/// One rendering job. A task is in at most one of {queued, running,
/// completed}; `running` is held iff a worker is currently driving it.
pub struct Task {
    pub task_id: String,
    pub request: RenderRequest,
    pub pinned_device: Option<String>,
    pub created_at: Instant,

    response: Mutex<Option<serde_json::Value>>,
    error: Mutex<Option<TaskError>>,
    buffer: Mutex<VecDeque<Vec<u8>>>,
    temp_images: Mutex<Vec<Option<Vec<u8>>>>,
    running: AtomicBool,
}

impl Task {
    pub fn new(task_id: String, request: RenderRequest) -> Self {
        let pinned_device = request.render_device.clone();
        let slots = request.temp_image_slots();
        Self {
            task_id,
            pinned_device,
            created_at: Instant::now(),
            response: Mutex::new(None),
            error: Mutex::new(None),
            buffer: Mutex::new(VecDeque::new()),
            temp_images: Mutex::new(vec![None; slots]),
            running: AtomicBool::new(false),
            request,
        }
    }

    /// Non-blocking acquire. Returns false if already held - the caller
    /// must treat that as a fatal invariant violation, never a retry.
    pub fn try_acquire_running(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release_running(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn push_chunk(&self, chunk: Vec<u8>) {
        self.buffer.lock().unwrap().push_back(chunk);
    }

    /// Drains every chunk buffered since the last drain. This is a
    /// snapshot-at-call, not a live tail: matches the source's
    /// `read_buffer_generator`, which empties whatever is queued and ends.
    pub fn drain_chunks(&self) -> Vec<Vec<u8>> {
        self.buffer.lock().unwrap().drain(..).collect()
    }

    pub fn has_buffered_chunks(&self) -> bool {
        !self.buffer.lock().unwrap().is_empty()
    }

    pub fn set_response(&self, value: serde_json::Value) {
        *self.response.lock().unwrap() = Some(value);
    }

    pub fn response(&self) -> Option<serde_json::Value> {
        self.response.lock().unwrap().clone()
    }

    pub fn set_error(&self, err: TaskError) {
        *self.error.lock().unwrap() = Some(err);
    }

    pub fn error(&self) -> Option<TaskError> {
        self.error.lock().unwrap().clone()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error(), Some(TaskError::Cancelled))
    }

    /// "Already started" check used by admission: no response, no error,
    /// and no worker currently holding the running flag.
    pub fn is_unstarted(&self) -> bool {
        self.response().is_none() && self.error().is_none() && !self.is_running()
    }

    pub fn set_temp_image(&self, slot: usize, data: Vec<u8>) {
        let mut slots = self.temp_images.lock().unwrap();
        if let Some(cell) = slots.get_mut(slot) {
            *cell = Some(data);
        }
    }

    pub fn temp_image(&self, slot: usize) -> Option<Vec<u8>> {
        self.temp_images.lock().unwrap().get(slot).cloned().flatten()
    }

    pub fn temp_image_slot_count(&self) -> usize {
        self.temp_images.lock().unwrap().len()
    }
}

impl Clone for TaskError {
    fn clone(&self) -> Self {
        match self {
            TaskError::Failure(m) => TaskError::Failure(m.clone()),
            TaskError::Cancelled => TaskError::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(session_id: &str) -> RenderRequest {
        RenderRequest {
            session_id: session_id.to_string(),
            render_device: None,
            use_face_correction: None,
            use_stable_diffusion_model: default_model(),
            use_vae_model: None,
            stream_progress_updates: true,
            stream_image_progress: false,
            num_outputs: 2,
            show_only_filtered_image: false,
            extra: Default::default(),
        }
    }

    #[test]
    fn temp_image_slot_count_accounts_for_filter_pass() {
        let t = Task::new("t1".into(), req("s1"));
        assert_eq!(t.temp_image_slot_count(), 4); // 2 outputs * (raw + filtered)

        let mut r = req("s2");
        r.show_only_filtered_image = true;
        let t2 = Task::new("t2".into(), r);
        assert_eq!(t2.temp_image_slot_count(), 2);
    }

    #[test]
    fn running_flag_is_exclusive() {
        let t = Task::new("t1".into(), req("s1"));
        assert!(t.try_acquire_running());
        assert!(!t.try_acquire_running());
        t.release_running();
        assert!(t.try_acquire_running());
    }

    #[test]
    fn drain_chunks_empties_the_buffer() {
        let t = Task::new("t1".into(), req("s1"));
        t.push_chunk(b"a".to_vec());
        t.push_chunk(b"b".to_vec());
        assert_eq!(t.drain_chunks(), vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(!t.has_buffered_chunks());
    }

    #[test]
    fn is_unstarted_until_response_error_or_running() {
        let t = Task::new("t1".into(), req("s1"));
        assert!(t.is_unstarted());
        t.try_acquire_running();
        assert!(!t.is_unstarted());
        t.release_running();
        t.set_response(serde_json::json!({"status": "succeeded"}));
        assert!(!t.is_unstarted());
    }
}
