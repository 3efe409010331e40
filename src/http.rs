// http.rs - Endpoints that submit, stream, stop, and introspect. Thin glue
// over Dispatcher/Task/TaskCache: no business logic beyond parameter
// validation and status-code mapping, mirroring the teacher's filter
// composition in http_server.rs.

use crate::config::AppConfig;
use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;
use crate::task::{RenderRequest, Task, TaskError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::{Response, StatusCode};
use warp::{Filter, Rejection, Reply};

#[derive(Debug)]
struct ServiceError {
    message: String,
    status_code: StatusCode,
}

impl warp::reject::Reject for ServiceError {}

impl ServiceError {
    fn new(status_code: StatusCode, message: impl Into<String>) -> Rejection {
        warp::reject::custom(Self {
            message: message.into(),
            status_code,
        })
    }
}

/// Maps a `DispatchError` from the admission path onto the status codes
/// named in the spec's endpoint table.
fn admission_rejection(err: DispatchError) -> Rejection {
    let status = match err {
        DispatchError::NoWorkers => StatusCode::INTERNAL_SERVER_ERROR,
        DispatchError::Pending(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    ServiceError::new(status, err.to_string())
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (code, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not Found".to_string())
    } else if let Some(service_err) = err.find::<ServiceError>() {
        (service_err.status_code, service_err.message.clone())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed".to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Payload too large".to_string())
    } else {
        log::error!("unhandled rejection: {err:?}");
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
    };

    let json = warp::reply::json(&serde_json::json!({
        "error": message,
        "status_code": code.as_u16(),
    }));
    Ok(no_cache(warp::reply::with_status(json, code)))
}

fn no_cache<T: Reply>(reply: T) -> impl Reply {
    warp::reply::with_header(reply, "Cache-Control", "no-cache, no-store, must-revalidate")
}

fn with_state<T: Clone + Send>(state: T) -> impl Filter<Extract = (T,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn json_body() -> impl Filter<Extract = (RenderRequest,), Error = Rejection> + Clone {
    warp::body::content_length_limit(1024 * 1024 * 10).and(warp::body::json())
}

// ---- response shapes ------------------------------------------------------

#[derive(Serialize)]
struct RenderResponse {
    status: String,
    queue_len: usize,
    stream: String,
    task_id: String,
}

#[derive(Serialize)]
struct PingResponse {
    status: String,
    devices: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tasks: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct AppConfigUpdate {
    render_devices: Option<String>,
}

#[derive(Deserialize)]
struct StopQuery {
    #[serde(default)]
    task: Option<String>,
}

#[derive(Deserialize)]
struct PingQuery {
    #[serde(default)]
    session_id: Option<String>,
}

fn task_status_label(task: &Task) -> String {
    if let Some(err) = task.error() {
        return err.status().to_string();
    }
    if let Some(response) = task.response() {
        if let Some(status) = response.get("status").and_then(|v| v.as_str()) {
            return status.to_string();
        }
    }
    if task.is_running() {
        "running".to_string()
    } else {
        "queued".to_string()
    }
}

// ---- handlers --------------------------------------------------------------

async fn handle_health() -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&serde_json::json!({
        "status": "healthy",
        "service": "render-dispatcher",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

async fn handle_render(
    request: RenderRequest,
    dispatcher: Arc<Dispatcher>,
) -> Result<impl Reply, Rejection> {
    let outcome = dispatcher.enqueue(request).await.map_err(admission_rejection)?;
    let status = dispatcher.state().get().await;
    Ok(no_cache(warp::reply::json(&RenderResponse {
        status: status.to_string(),
        queue_len: outcome.queue_len,
        stream: format!("/image/stream/{}", outcome.task_id),
        task_id: outcome.task_id,
    })))
}

async fn handle_stream(task_id: String, dispatcher: Arc<Dispatcher>) -> Result<impl Reply, Rejection> {
    let task = dispatcher
        .resolve_task(&task_id)
        .await
        .map_err(|e| ServiceError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or_else(|| ServiceError::new(StatusCode::NOT_FOUND, format!("task {task_id} not found")))?;

    if task.has_buffered_chunks() {
        let chunks = task.drain_chunks();
        let body = chunks
            .into_iter()
            .map(|c| String::from_utf8_lossy(&c).into_owned())
            .collect::<Vec<_>>()
            .join("\n");
        return Ok(no_cache(
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "application/json")
                .body(body)
                .unwrap(),
        ));
    }

    if !task.is_running() {
        if let Some(response) = task.response() {
            return Ok(no_cache(
                Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "application/json")
                    .body(response.to_string())
                    .unwrap(),
            ));
        }
        return Err(ServiceError::new(
            StatusCode::from_u16(425).unwrap(),
            "task not started yet".to_string(),
        ));
    }

    Ok(no_cache(
        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body("[]".to_string())
            .unwrap(),
    ))
}

async fn handle_stop(query: StopQuery, dispatcher: Arc<Dispatcher>) -> Result<impl Reply, Rejection> {
    let task_id = match query.task {
        Some(id) => id,
        None => dispatcher
            .currently_rendering_task_id()
            .await
            .ok_or_else(|| ServiceError::new(StatusCode::CONFLICT, "no task is currently rendering".to_string()))?,
    };

    let task = dispatcher
        .resolve_task(&task_id)
        .await
        .map_err(|e| ServiceError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or_else(|| ServiceError::new(StatusCode::NOT_FOUND, format!("task {task_id} not found")))?;

    if task.is_cancelled() {
        return Err(ServiceError::new(
            StatusCode::CONFLICT,
            format!("task {task_id} is already stopped"),
        ));
    }

    task.set_error(TaskError::Cancelled);
    Ok(no_cache(warp::reply::json(&serde_json::json!("OK"))))
}

async fn handle_temp_image(
    task_id: String,
    img_id: usize,
    dispatcher: Arc<Dispatcher>,
) -> Result<impl Reply, Rejection> {
    let task = dispatcher
        .resolve_task(&task_id)
        .await
        .map_err(|e| ServiceError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or_else(|| ServiceError::new(StatusCode::GONE, format!("task {task_id} could not be found")))?;

    let bytes = task
        .temp_image(img_id)
        .ok_or_else(|| ServiceError::new(StatusCode::from_u16(425).unwrap(), "image slot not yet available".to_string()))?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "image/jpeg")
        .header("Cache-Control", "no-cache, no-store, must-revalidate")
        .body(bytes)
        .unwrap())
}

async fn handle_ping(query: PingQuery, dispatcher: Arc<Dispatcher>) -> Result<impl Reply, Rejection> {
    if dispatcher.is_alive(None).await == 0 {
        let detail = dispatcher
            .state()
            .error()
            .await
            .map(|e| e.0)
            .unwrap_or_else(|| "render worker pool is dead".to_string());
        return Err(ServiceError::new(StatusCode::INTERNAL_SERVER_ERROR, detail));
    }
    if let Some(err) = dispatcher.state().error().await {
        return Err(ServiceError::new(StatusCode::INTERNAL_SERVER_ERROR, err.0));
    }

    let status = dispatcher.state().get().await.to_string();
    let devices = dispatcher.get_devices().await;

    let tasks = match query.session_id {
        Some(session_id) => {
            let _ = dispatcher.cache().keep(&session_id, dispatcher.task_ttl()).await;
            dispatcher
                .cache()
                .try_get(&session_id)
                .await
                .ok()
                .flatten()
                .map(|task| {
                    let mut m = HashMap::new();
                    m.insert(task.task_id.clone(), task_status_label(&task));
                    m
                })
        }
        None => None,
    };

    Ok(no_cache(warp::reply::json(&PingResponse {
        status,
        devices,
        tasks,
    })))
}

async fn handle_get(key: String, dispatcher: Arc<Dispatcher>, config: AppConfig) -> Result<impl Reply, Rejection> {
    if key.is_empty() {
        return Err(ServiceError::new(
            StatusCode::from_u16(418).unwrap(),
            "render-dispatcher is drawing a teapot!".to_string(),
        ));
    }
    let body = match key.as_str() {
        "app_config" => serde_json::json!({
            "render_devices": config.render_devices,
            "bind_addr": config.bind_addr.to_string(),
        }),
        "system_info" => serde_json::json!({
            "devices": dispatcher.get_devices().await,
            "hosts": [config.bind_addr.to_string()],
        }),
        // ModelRegistry, the plugin injection machinery, and the static
        // file server are out of scope; these keys exist for API parity
        // but carry no data this crate is responsible for.
        "models" => serde_json::json!({}),
        "ui_plugins" => serde_json::json!([]),
        "output_dir" => serde_json::json!({ "output_dir": "." }),
        _ => return Err(ServiceError::new(StatusCode::NOT_FOUND, format!("unknown key {key}"))),
    };
    Ok(no_cache(warp::reply::json(&body)))
}

async fn handle_app_config(
    update: AppConfigUpdate,
    dispatcher: Arc<Dispatcher>,
) -> Result<impl Reply, Rejection> {
    if let Some(spec) = update.render_devices {
        let devices = crate::config::resolve_render_devices(&spec)
            .map_err(|e| ServiceError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
        dispatcher
            .update_workers(&devices)
            .await
            .map_err(|e| ServiceError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    }
    Ok(no_cache(warp::reply::json(&serde_json::json!({"status": "ok"}))))
}

fn with_cors() -> warp::cors::Builder {
    warp::cors()
        .allow_any_origin()
        .allow_headers(vec!["Accept", "Content-Type", "Authorization", "X-Requested-With"])
        .allow_methods(vec!["GET", "POST", "OPTIONS"])
        .max_age(3600)
}

pub fn routes(
    dispatcher: Arc<Dispatcher>,
    config: AppConfig,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let health = warp::path("health").and(warp::get()).and_then(handle_health);

    let render = warp::path("render")
        .and(warp::post())
        .and(json_body())
        .and(with_state(dispatcher.clone()))
        .and_then(handle_render);

    let stream = warp::path!("image" / "stream" / String)
        .and(warp::get())
        .and(with_state(dispatcher.clone()))
        .and_then(handle_stream);

    let stop = warp::path!("image" / "stop")
        .and(warp::get())
        .and(warp::query::<StopQuery>())
        .and(with_state(dispatcher.clone()))
        .and_then(handle_stop);

    let temp_image = warp::path!("image" / "tmp" / String / usize)
        .and(warp::get())
        .and(with_state(dispatcher.clone()))
        .and_then(handle_temp_image);

    let ping = warp::path("ping")
        .and(warp::get())
        .and(warp::query::<PingQuery>())
        .and(with_state(dispatcher.clone()))
        .and_then(handle_ping);

    let get = warp::path!("get" / String)
        .and(warp::get())
        .and(with_state(dispatcher.clone()))
        .and(with_state(config.clone()))
        .and_then(handle_get);

    let app_config = warp::path("app_config")
        .and(warp::post())
        .and(warp::body::json::<AppConfigUpdate>())
        .and(with_state(dispatcher.clone()))
        .and_then(handle_app_config);

    health
        .or(render)
        .or(stream)
        .or(stop)
        .or(temp_image)
        .or(ping)
        .or(get)
        .or(app_config)
        .recover(handle_rejection)
        .with(with_cors())
        .with(warp::log("render_dispatcher"))
}
