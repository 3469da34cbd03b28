use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

use crate::alerts::BroadcastNotifier;
use crate::analysis::AnalysisSession;
use crate::config::{MAX_ANALYSIS_INTERVAL, MIN_ANALYSIS_INTERVAL};
use crate::errors::MonitorError;
use crate::monitor::SafetyMonitor;
use crate::scheduler::CycleOutcome;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<u16>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn error(message: &str, code: u16) -> ApiResponse<()> {
        ApiResponse {
            status: "error".to_string(),
            data: None,
            error: Some(message.to_string()),
            code: Some(code),
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(ApiResponse::<()>::error(message, status.as_u16()))).into_response()
}

fn status_for(err: &MonitorError) -> StatusCode {
    match err {
        MonitorError::Capacity { .. } => StatusCode::CONFLICT,
        MonitorError::NotFound { .. } => StatusCode::NOT_FOUND,
        MonitorError::Config { .. } => StatusCode::BAD_REQUEST,
        MonitorError::Device { .. } | MonitorError::Analysis { .. } | MonitorError::Http { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond<T: Serialize>(result: crate::errors::Result<T>) -> Response {
    match result {
        Ok(data) => Json(ApiResponse::success(data)).into_response(),
        Err(e) => error_response(status_for(&e), &e.to_string()),
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub monitor: SafetyMonitor,
    pub alerts: BroadcastNotifier,
    sessions: Arc<Mutex<HashMap<String, AnalysisSession>>>,
}

impl ApiState {
    pub fn new(monitor: SafetyMonitor, alerts: BroadcastNotifier) -> Self {
        Self {
            monitor,
            alerts,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub fn cors_layer(allow_origin: Option<&str>) -> CorsLayer {
    match allow_origin {
        None | Some("*") => CorsLayer::permissive(),
        Some(origin) => match origin.parse::<HeaderValue>() {
            Ok(origin_header) => CorsLayer::new()
                .allow_origin(origin_header)
                .allow_methods(Any)
                .allow_headers(Any),
            Err(_) => {
                warn!("Invalid CORS origin '{}', falling back to permissive", origin);
                CorsLayer::permissive()
            }
        },
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/devices", get(list_devices))
        .route("/api/cameras", get(list_cameras).post(add_camera))
        .route("/api/cameras/:id", get(get_camera).delete(remove_camera))
        .route("/api/cameras/:id/start", post(start_camera))
        .route("/api/cameras/:id/stop", post(stop_camera))
        .route("/api/cameras/:id/toggle", post(toggle_camera))
        .route("/api/cameras/:id/name", put(rename_camera))
        .route("/api/cameras/:id/analysis", post(set_analysis))
        .route("/api/cameras/:id/analyze", post(analyze_now))
        .route("/api/cameras/:id/capture", get(capture))
        .route("/api/cameras/:id/ask", post(ask))
        .route("/api/detections", get(list_detections))
        .route("/api/detections/stats", get(detection_stats))
        .route("/ws/alerts", get(alerts_websocket))
        .with_state(state)
}

async fn list_devices(State(state): State<ApiState>) -> Response {
    match state.monitor.scan_devices().await {
        Ok(devices) => {
            let available = state.monitor.available_devices().await;
            Json(ApiResponse::success(serde_json::json!({
                "devices": devices,
                "available": available,
            }))).into_response()
        }
        Err(e) => error_response(status_for(&e), &e.to_string()),
    }
}

async fn list_cameras(State(state): State<ApiState>) -> Response {
    Json(ApiResponse::success(state.monitor.cameras().await)).into_response()
}

#[derive(Debug, Deserialize)]
pub struct AddCameraRequest {
    pub device_id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub auto_start: bool,
}

async fn add_camera(State(state): State<ApiState>, Json(request): Json<AddCameraRequest>) -> Response {
    let result = state.monitor
        .add_camera(&request.device_id, request.name, request.auto_start)
        .await;
    match result {
        Ok(view) => (StatusCode::CREATED, Json(ApiResponse::success(view))).into_response(),
        Err(e) => error_response(status_for(&e), &e.to_string()),
    }
}

async fn get_camera(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.monitor.camera(&id).await)
}

async fn remove_camera(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let result = state.monitor.remove_camera(&id).await;
    if result.is_ok() {
        state.sessions.lock().await.remove(&id);
    }
    respond(result)
}

async fn start_camera(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.monitor.start_camera(&id).await)
}

async fn stop_camera(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.monitor.stop_camera(&id).await)
}

async fn toggle_camera(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.monitor.toggle_camera(&id).await)
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

async fn rename_camera(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> Response {
    respond(state.monitor.rename_camera(&id, &request.name).await)
}

#[derive(Debug, Deserialize)]
pub struct AnalysisRequest {
    pub enabled: bool,
    pub interval_ms: Option<u64>,
}

async fn set_analysis(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<AnalysisRequest>,
) -> Response {
    if !request.enabled {
        return respond(state.monitor.disable_analysis(&id).await);
    }

    let interval = request.interval_ms.map(Duration::from_millis);
    if let Some(interval) = interval {
        if interval < MIN_ANALYSIS_INTERVAL || interval > MAX_ANALYSIS_INTERVAL {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!(
                    "Analysis interval must be between {}ms and {}ms",
                    MIN_ANALYSIS_INTERVAL.as_millis(),
                    MAX_ANALYSIS_INTERVAL.as_millis()
                ),
            );
        }
    }
    respond(state.monitor.enable_analysis(&id, interval).await)
}

fn outcome_json(outcome: CycleOutcome) -> serde_json::Value {
    match outcome {
        CycleOutcome::Skipped(reason) => serde_json::json!({
            "outcome": "skipped",
            "reason": format!("{:?}", reason),
        }),
        CycleOutcome::Clear => serde_json::json!({ "outcome": "clear" }),
        CycleOutcome::Hazard(detection) => serde_json::json!({
            "outcome": "hazard",
            "detection": detection,
        }),
        CycleOutcome::Failed(message) => serde_json::json!({
            "outcome": "failed",
            "error": message,
        }),
        CycleOutcome::Discarded => serde_json::json!({ "outcome": "discarded" }),
    }
}

async fn analyze_now(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.monitor.analyze_now(&id).await.map(outcome_json))
}

async fn capture(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.monitor.capture_snapshot(&id).await {
        Ok(Some(image)) => (
            [(header::CONTENT_TYPE, image.mime_type.clone())],
            image.data,
        ).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(status_for(&e), &e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub question: String,
}

async fn ask(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<AskRequest>,
) -> Response {
    let Some(analyzer) = state.monitor.analyzer() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Analysis is not configured");
    };

    let latest = match state.monitor.open_session(&id).await {
        Ok(session) => session,
        Err(e) => return error_response(status_for(&e), &e.to_string()),
    };

    // Start over whenever a newer frame has been analyzed
    let mut session = match state.sessions.lock().await.remove(&id) {
        Some(existing) if existing.image.captured_at == latest.image.captured_at => existing,
        _ => latest,
    };

    let timeout = state.monitor.settings().analysis_timeout;
    let result = session.ask(analyzer.as_ref(), &request.question, timeout).await;
    let transcript = session.transcript().to_vec();
    state.sessions.lock().await.insert(id.clone(), session);

    match result {
        Ok(answer) => Json(ApiResponse::success(serde_json::json!({
            "camera_id": id,
            "answer": answer,
            "transcript": transcript,
        }))).into_response(),
        Err(e) => {
            warn!("Follow-up question for camera '{}' failed: {}", id, e);
            error_response(status_for(&e), &e.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DetectionQuery {
    pub limit: Option<usize>,
    pub camera_id: Option<String>,
}

async fn list_detections(State(state): State<ApiState>, Query(query): Query<DetectionQuery>) -> Response {
    let limit = query.limit.unwrap_or(state.monitor.settings().history_limit);
    let detections = state.monitor.recent_detections(limit, query.camera_id.as_deref()).await;
    Json(ApiResponse::success(detections)).into_response()
}

async fn detection_stats(State(state): State<ApiState>) -> Response {
    Json(ApiResponse::success(state.monitor.detection_stats().await)).into_response()
}

async fn alerts_websocket(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    ws.on_upgrade(move |socket| handle_alert_socket(socket, state.alerts.subscribe()))
}

async fn handle_alert_socket(socket: WebSocket, mut alerts: broadcast::Receiver<crate::alerts::Alert>) {
    let (mut sender, mut receiver) = socket.split();
    info!("New alert WebSocket client connected");

    let mut send_task = tokio::spawn(async move {
        let mut sent = 0u64;
        loop {
            match alerts.recv().await {
                Ok(alert) => {
                    let payload = match serde_json::to_string(&alert) {
                        Ok(payload) => payload,
                        Err(e) => {
                            error!("Failed to serialize alert: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(payload)).await.is_err() {
                        debug!("Alert WebSocket closed while sending");
                        break;
                    }
                    sent += 1;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Alert WebSocket lagged, dropped {} alerts", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("Alert WebSocket send task ended (sent: {})", sent);
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => {
                    debug!("Alert WebSocket client sent close");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Alert WebSocket receive error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    info!("Alert WebSocket client disconnected");
}
