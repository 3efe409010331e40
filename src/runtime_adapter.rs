// runtime_adapter.rs - Contract exposed to workers by the external
// inference engine (ModelRuntime). The real engine, the on-disk model
// registry, and the plugin injection machinery are out of scope for this
// crate; `MockRuntimeAdapter` stands in for them so the dispatcher and
// binary compile and run end to end without a neural-network backend.

use crate::error::{DispatchError, Result};
use crate::task::RenderRequest;
use base64::{engine::general_purpose, Engine as _};
use futures_util::stream::{self, Stream};
use image::{ImageBuffer, ImageFormat, Rgb};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One item per publish point. `Err` signals a render-time failure from the
/// runtime (§7 `RuntimeFailure`); the worker turns it into a terminal chunk
/// and moves on without dying.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// What a worker needs from the inference engine. Each device owns its
/// own adapter instance; no state is ever shared across workers.
pub trait RuntimeAdapter: Send + Sync {
    fn device_init(&self, device: &str) -> Result<()>;
    fn current_device(&self) -> String;
    fn current_device_name(&self) -> String;
    fn load_model(&self, ckpt_path: Option<&str>, vae_path: Option<&str>) -> Result<()>;
    fn unload_models(&self);
    fn unload_filters(&self);
    /// Produces a finite lazy sequence of chunks. Each item is a publish
    /// point; the adapter must honor `request_stop` within a bounded
    /// number of subsequent items. An `Err` item ends the sequence.
    fn render(&self, request: &RenderRequest) -> ChunkStream;
    fn request_stop(&self);
    fn is_first_cuda_device(&self, tag: &str) -> bool;
    fn base64_decode(&self, data: &str) -> Result<Vec<u8>> {
        general_purpose::STANDARD
            .decode(data)
            .map_err(|e| DispatchError::RuntimeFailure(format!("invalid base64 chunk: {e}")))
    }
    /// Returns bytes the adapter has buffered locally for a server path
    /// referenced by a chunk's `output[].path` field (mirrors the source's
    /// `runtime.thread_data.temp_images` side table). `None` if the adapter
    /// keeps no local copy for that path.
    fn temp_image_bytes(&self, _path: &str) -> Option<Vec<u8>> {
        None
    }
}

fn encode_placeholder_jpeg(seed: u8) -> Vec<u8> {
    let jitter: u8 = rand::random();
    let img = ImageBuffer::from_fn(4, 4, |x, y| {
        Rgb([seed.wrapping_add(x as u8 * 16).wrapping_add(jitter), y as u8 * 32, 128])
    });
    let mut bytes = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut bytes);
    img.write_to(&mut cursor, ImageFormat::Jpeg)
        .expect("encoding a 4x4 placeholder jpeg never fails");
    bytes
}

const TEMP_IMAGE_PATH_PREFIX: &str = "/tmp/image/";

/// Synthesizes progress chunks on a short, fixed cadence so the dispatcher
/// can be exercised without a real GPU or model weights. Even-indexed
/// outputs are published as a server `path` (backed by `temp_store`),
/// odd-indexed ones as inline base64 `data`, exercising both branches of
/// the worker's output-handling code the way a real runtime would mix them.
pub struct MockRuntimeAdapter {
    device: String,
    device_name: String,
    stop_requested: Arc<AtomicBool>,
    steps: u32,
    step_delay: Duration,
    fail_at_step: Option<u32>,
    temp_store: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MockRuntimeAdapter {
    pub fn new(device: impl Into<String>) -> Self {
        let device = device.into();
        let device_name = if device == "cpu" {
            "CPU".to_string()
        } else {
            format!("Mock GPU ({device})")
        };
        Self {
            device,
            device_name,
            stop_requested: Arc::new(AtomicBool::new(false)),
            steps: 5,
            step_delay: Duration::from_millis(15),
            fail_at_step: None,
            temp_store: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Builds an adapter whose render stream ends with an `Err` at the
    /// given step, for exercising the worker's render-failure handling.
    pub fn failing_at(device: impl Into<String>, step: u32) -> Self {
        Self {
            fail_at_step: Some(step),
            ..Self::new(device)
        }
    }
}

impl RuntimeAdapter for MockRuntimeAdapter {
    fn device_init(&self, _device: &str) -> Result<()> {
        Ok(())
    }

    fn current_device(&self) -> String {
        self.device.clone()
    }

    fn current_device_name(&self) -> String {
        self.device_name.clone()
    }

    fn load_model(&self, _ckpt_path: Option<&str>, _vae_path: Option<&str>) -> Result<()> {
        Ok(())
    }

    fn unload_models(&self) {
        log::debug!("{}: unload_models (mock, no-op)", self.device);
    }

    fn unload_filters(&self) {
        log::debug!("{}: unload_filters (mock, no-op)", self.device);
    }

    fn render(&self, request: &RenderRequest) -> ChunkStream {
        let total = self.steps;
        let delay = self.step_delay;
        let stop = self.stop_requested.clone();
        let num_outputs = request.num_outputs.max(1);
        let use_face_correction = request.use_face_correction.is_some();
        let fail_at_step = self.fail_at_step;
        let temp_store = self.temp_store.clone();
        let device = self.device.clone();

        Box::pin(stream::unfold(0u32, move |step| {
            let stop = stop.clone();
            let temp_store = temp_store.clone();
            let device = device.clone();
            async move {
                if step >= total {
                    return None;
                }
                tokio::time::sleep(delay).await;

                if fail_at_step == Some(step) {
                    return Some((
                        Err(DispatchError::RuntimeFailure(format!(
                            "mock runtime failure on {device} at step {step}"
                        ))),
                        total,
                    ));
                }

                let stopped = stop.load(Ordering::Acquire);
                let finished = stopped || step + 1 == total;

                let chunk = if finished {
                    let output: Vec<serde_json::Value> = (0..num_outputs)
                        .map(|i| {
                            let bytes = encode_placeholder_jpeg(i as u8 + step as u8);
                            if i % 2 == 0 {
                                let key = format!("mock-{step}-{i}");
                                temp_store.lock().unwrap().insert(key.clone(), bytes);
                                serde_json::json!({ "path": format!("{TEMP_IMAGE_PATH_PREFIX}{key}") })
                            } else {
                                serde_json::json!({
                                    "data": format!(
                                        "data:image/jpeg;base64,{}",
                                        general_purpose::STANDARD.encode(bytes)
                                    ),
                                })
                            }
                        })
                        .collect();
                    serde_json::json!({
                        "status": if stopped { "cancelled" } else { "succeeded" },
                        "step": step,
                        "total_steps": total,
                        "use_face_correction": use_face_correction,
                        "output": output,
                    })
                } else {
                    serde_json::json!({
                        "status": "processing",
                        "step": step,
                        "total_steps": total,
                    })
                };

                let next_step = if finished { total } else { step + 1 };
                Some((Ok(serde_json::to_vec(&chunk).unwrap_or_default()), next_step))
            }
        }))
    }

    fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    fn is_first_cuda_device(&self, tag: &str) -> bool {
        tag == "cuda:0"
    }

    fn temp_image_bytes(&self, path: &str) -> Option<Vec<u8>> {
        let key = path.strip_prefix(TEMP_IMAGE_PATH_PREFIX).unwrap_or(path);
        self.temp_store.lock().unwrap().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn req() -> RenderRequest {
        RenderRequest {
            session_id: "s1".into(),
            render_device: None,
            use_face_correction: None,
            use_stable_diffusion_model: "sd-v1-4".into(),
            use_vae_model: None,
            stream_progress_updates: true,
            stream_image_progress: false,
            num_outputs: 2,
            show_only_filtered_image: true,
            extra: Default::default(),
        }
    }

    #[tokio::test]
    async fn render_stream_terminates_with_succeeded_status() {
        let adapter = MockRuntimeAdapter::new("cpu");
        let mut stream = adapter.render(&req());
        let mut last = None;
        while let Some(chunk) = stream.next().await {
            last = Some(chunk.unwrap());
        }
        let value: serde_json::Value = serde_json::from_slice(&last.unwrap()).unwrap();
        assert_eq!(value["status"], "succeeded");
    }

    #[tokio::test]
    async fn request_stop_ends_the_stream_with_cancelled_status() {
        let adapter = MockRuntimeAdapter::new("cuda:0");
        let mut stream = adapter.render(&req());
        // Let one chunk through, then request a stop.
        stream.next().await;
        adapter.request_stop();
        let mut last = None;
        while let Some(chunk) = stream.next().await {
            last = Some(chunk.unwrap());
        }
        let value: serde_json::Value = serde_json::from_slice(&last.unwrap()).unwrap();
        assert_eq!(value["status"], "cancelled");
    }

    #[tokio::test]
    async fn failing_adapter_yields_an_err_item() {
        let adapter = MockRuntimeAdapter::failing_at("cuda:0", 1);
        let mut stream = adapter.render(&req());
        let mut saw_failure = false;
        while let Some(chunk) = stream.next().await {
            if chunk.is_err() {
                saw_failure = true;
                break;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn path_outputs_are_retrievable_through_temp_image_bytes() {
        let adapter = MockRuntimeAdapter::new("cpu");
        let mut stream = adapter.render(&req());
        let mut last = None;
        while let Some(chunk) = stream.next().await {
            last = Some(chunk.unwrap());
        }
        let value: serde_json::Value = serde_json::from_slice(&last.unwrap()).unwrap();
        let output = value["output"].as_array().unwrap();
        let path = output[0]["path"].as_str().expect("even-indexed output uses path");
        assert!(adapter.temp_image_bytes(path).is_some());
        assert!(output[1].get("data").is_some(), "odd-indexed output uses inline data");
    }

    #[test]
    fn is_first_cuda_device_only_matches_cuda_zero() {
        let adapter = MockRuntimeAdapter::new("cuda:1");
        assert!(adapter.is_first_cuda_device("cuda:0"));
        assert!(!adapter.is_first_cuda_device("cuda:1"));
    }
}
