// worker.rs - Per-device loop: initialize device, poll for eligible task,
// drive the runtime adapter, stream chunks, mark cache alive, handle
// cancel/shutdown. One of these runs per device as its own tokio task.

use crate::dispatcher::{Dispatcher, WorkerInfo};
use crate::runtime_adapter::RuntimeAdapter;
use crate::state::{ServerState, StateError};
use crate::task::{Task, TaskError};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;

const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub async fn run(
    dispatcher: Arc<Dispatcher>,
    info: Arc<WorkerInfo>,
    adapter: Arc<dyn RuntimeAdapter>,
    device: String,
    ready_tx: tokio::sync::oneshot::Sender<Result<(), String>>,
) {
    if let Err(e) = adapter.device_init(&device) {
        log::error!("device {device} failed to initialize: {e}");
        let _ = ready_tx.send(Err(e.to_string()));
        return;
    }

    let device_name = adapter.current_device_name();
    dispatcher.register_worker_alive(&info, device_name.clone()).await;
    let _ = ready_tx.send(Ok(()));
    log::info!("device {device} ({device_name}) online");

    let is_solo_worker = dispatcher.is_alive(None).await == 1;
    if device != "cpu" || is_solo_worker {
        preload_default_model(&dispatcher, &adapter).await;
    }

    loop {
        let _ = dispatcher.cache().clean().await;

        if dispatcher.is_shutting_down() {
            dispatcher.state().set(ServerState::Unavailable).await;
            break;
        }

        if !info.is_alive() {
            log::info!("device {device} decommissioned, stopping worker loop");
            break;
        }

        let task = match dispatcher.select_next_task(&device).await {
            Some(task) => task,
            None => {
                if dispatcher.cpu_should_unload(&device).await {
                    adapter.unload_models();
                    adapter.unload_filters();
                    dispatcher.clear_cpu_active(&device).await;
                }
                tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                continue;
            }
        };

        if let Some(err) = task.error() {
            emit_terminal_chunk(&task, &err);
            continue;
        }

        if let Some(state_err) = dispatcher.state().error().await {
            let err = TaskError::Failure(state_err.0.clone());
            task.set_error(err.clone());
            emit_terminal_chunk(&task, &err);
            continue;
        }

        if !task.try_acquire_running() {
            // Invariant violation: two workers picked the same task.
            panic!("task {} was already running when picked up", task.task_id);
        }

        if device == "cpu" && dispatcher.other_workers_alive(&device).await {
            dispatcher.mark_cpu_active(&device).await;
        }

        run_render(&dispatcher, &adapter, &task, &device).await;

        task.release_running();
        log_outcome(&task, &device_name);
        let _ = dispatcher
            .cache()
            .keep(&task.request.session_id, dispatcher.task_ttl())
            .await;
        dispatcher.state().set(ServerState::Online).await;
    }
}

async fn preload_default_model(dispatcher: &Arc<Dispatcher>, adapter: &Arc<dyn RuntimeAdapter>) {
    dispatcher.state().set(ServerState::LoadingModel).await;
    match adapter.load_model(None, None) {
        Ok(()) => {
            dispatcher.state().set(ServerState::Online).await;
        }
        Err(e) => {
            log::error!("default model failed to load: {e}");
            dispatcher
                .state()
                .set_error(Some(StateError(e.to_string())))
                .await;
            dispatcher.state().set(ServerState::Unavailable).await;
        }
    }
}

fn emit_terminal_chunk(task: &Task, err: &TaskError) {
    let payload = serde_json::json!({ "status": err.status(), "detail": err.detail() });
    task.push_chunk(serde_json::to_vec(&payload).unwrap_or_default());
    task.set_response(payload);
}

fn log_outcome(task: &Task, device_name: &str) {
    match task.error() {
        Some(TaskError::Cancelled) => {
            log::info!("session {} task {} cancelled", task.request.session_id, task.task_id)
        }
        Some(TaskError::Failure(detail)) => log::warn!(
            "session {} task {} failed: {detail}",
            task.request.session_id,
            task.task_id
        ),
        None => log::info!(
            "session {} task {} completed on {device_name}",
            task.request.session_id,
            task.task_id
        ),
    }
}

async fn run_render(
    dispatcher: &Arc<Dispatcher>,
    adapter: &Arc<dyn RuntimeAdapter>,
    task: &Arc<Task>,
    device: &str,
) {
    let loaded = dispatcher.state().loaded_model().await;
    let model_matches = loaded.model.as_deref() == Some(task.request.use_stable_diffusion_model.as_str());
    let mut awaiting_model_switch = !model_matches;
    dispatcher
        .state()
        .set(if model_matches {
            ServerState::Rendering
        } else {
            ServerState::LoadingModel
        })
        .await;

    let mut chunks = adapter.render(&task.request);
    while let Some(item) = chunks.next().await {
        let raw = match item {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("session {} task {} render failed: {e}", task.request.session_id, task.task_id);
                let err = TaskError::Failure(e.to_string());
                task.set_error(err.clone());
                emit_terminal_chunk(task, &err);
                adapter.request_stop();
                break;
            }
        };

        if awaiting_model_switch {
            dispatcher
                .state()
                .set_loaded_model(
                    task.request.use_stable_diffusion_model.clone(),
                    task.request.use_vae_model.clone(),
                )
                .await;
            dispatcher.state().set(ServerState::Rendering).await;
            awaiting_model_switch = false;
        }

        if dispatcher.is_shutting_down() && !task.is_cancelled() {
            // Process-wide shutdown observed mid-render: treat as a cancel
            // so the chunk loop still drains to completion cleanly.
            task.set_error(TaskError::Cancelled);
        }
        if dispatcher.is_shutting_down() || task.is_cancelled() {
            adapter.request_stop();
        }

        if task.request.stream_progress_updates {
            task.push_chunk(raw.clone());
        }

        if let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(&raw) {
            apply_outputs(task, adapter, &parsed);
            task.set_response(parsed);
        }

        let _ = dispatcher
            .cache()
            .keep(&task.request.session_id, dispatcher.task_ttl())
            .await;
    }

    let _ = device;
}

/// Pulls produced images out of a chunk's `output` array into the task's
/// temp-image slots: a server-local `path` or inline base64 `data`.
fn apply_outputs(task: &Task, adapter: &Arc<dyn RuntimeAdapter>, parsed: &serde_json::Value) {
    let Some(outputs) = parsed.get("output").and_then(|v| v.as_array()) else {
        return;
    };
    for (idx, entry) in outputs.iter().enumerate() {
        if idx >= task.temp_image_slot_count() {
            break;
        }
        if let Some(data) = entry.get("data").and_then(|v| v.as_str()) {
            let encoded = data
                .strip_prefix("data:image/jpeg;base64,")
                .or_else(|| data.strip_prefix("data:image/png;base64,"))
                .unwrap_or(data);
            match adapter.base64_decode(encoded) {
                Ok(bytes) => task.set_temp_image(idx, bytes),
                Err(e) => log::warn!("output {idx} carried unparsable inline data: {e}"),
            }
        } else if let Some(path) = entry.get("path").and_then(|v| v.as_str()) {
            match adapter.temp_image_bytes(path) {
                Some(bytes) => task.set_temp_image(idx, bytes),
                None => log::warn!("output {idx} referenced server path {path} with no local copy"),
            }
        }
    }
}
