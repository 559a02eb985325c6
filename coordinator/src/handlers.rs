use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{
    AckResponse, BlockedList, Command, ErrorBody, HealthResponse, ReportRequest, ReportResponse,
    StatsSnapshot, StopResponse, WorkerInfo, WorkerRegisterRequest, WorkerRegisterResponse,
};
use serde::Deserialize;
use std::any::Any;
use std::net::SocketAddr;
use std::time::{Instant, SystemTime};
use subtle::ConstantTimeEq;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::error::CoordinatorError;
use crate::extract::{ValidJson, ValidQuery};
use crate::state::{AppState, Registration};

pub fn build_router(state: AppState) -> Router {
    // rutas que exigen el secreto compartido
    let protected = Router::new()
        .route("/report", post(report))
        .route("/workers", get(list_workers))
        .route("/stats", get(get_stats))
        .route("/enqueue", get(enqueue))
        .route("/stop", get(stop_all))
        .route("/stop-worker", get(stop_worker))
        .route("/block", get(block_worker))
        .route("/unblock", get(unblock_worker))
        .route("/blocked", get(list_blocked))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    let app = Router::new()
        .route("/health", get(health))
        .route("/register", post(register_worker))
        .route("/poll", get(poll))
        .merge(protected)
        .with_state(state);

    with_boundary(app)
}

// Un panic en un handler se responde como 500 con el mismo cuerpo JSON
fn with_boundary(app: Router) -> Router {
    app.layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("sin detalle");
    error!("panic atendiendo request: {}", detail);

    let body = ErrorBody {
        error: "error interno del coordinador".to_string(),
    };
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

/* ---------------- rate limit ---------------- */

// La clave es la IP del peer; sin ConnectInfo (tests en proceso) todos
// comparten un bucket.
async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, CoordinatorError> {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "local".to_string());

    match state.limiter.try_acquire(&client, Instant::now()) {
        Ok(()) => Ok(next.run(request).await),
        Err(wait) => {
            warn!("rate limit excedido por {} en {}", client, request.uri().path());
            Err(CoordinatorError::RateLimited {
                retry_after_secs: (wait.as_secs_f64().ceil() as u64).max(1),
            })
        }
    }
}

/* ---------------- auth ---------------- */

#[derive(Debug, Default, Deserialize)]
struct TokenParam {
    token: Option<String>,
}

fn header_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    Some(raw.strip_prefix("Bearer ").unwrap_or(raw).trim())
}

fn token_matches(provided: &str, expected: &str) -> bool {
    // comparación en tiempo constante; largos distintos dan false
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

// El token puede venir en Authorization o como ?token=
async fn require_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    ValidQuery(param): ValidQuery<TokenParam>,
    request: Request,
    next: Next,
) -> Result<Response, CoordinatorError> {
    let provided = header_token(&headers).or(param.token.as_deref());

    match provided {
        Some(token) if token_matches(token, &state.auth_token) => Ok(next.run(request).await),
        Some(_) => {
            warn!("token inválido en {}", request.uri().path());
            Err(CoordinatorError::Unauthorized)
        }
        None => {
            debug!("request sin token a {}", request.uri().path());
            Err(CoordinatorError::Unauthorized)
        }
    }
}

/* ---------------- parámetros ---------------- */

#[derive(Debug, Deserialize)]
struct WorkerParam {
    worker: Option<String>,
}

impl WorkerParam {
    fn worker(self) -> Result<String, CoordinatorError> {
        self.worker
            .filter(|w| !w.trim().is_empty())
            .ok_or_else(|| CoordinatorError::Validation("falta el parámetro worker".into()))
    }
}

#[derive(Debug, Deserialize)]
struct EnqueueParams {
    worker: Option<String>,
    task: Option<String>,
    duration: Option<String>,
    resource: Option<String>,
}

/* ---------------- handlers HTTP ---------------- */

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.coordinator.uptime(SystemTime::now()).as_secs(),
    })
}

// Registra un worker (o refresca su last_seen si ya estaba)
async fn register_worker(
    State(state): State<AppState>,
    ValidJson(req): ValidJson<WorkerRegisterRequest>,
) -> Result<Json<WorkerRegisterResponse>, CoordinatorError> {
    let outcome = match state.coordinator.register(&req.url, SystemTime::now()) {
        Ok(outcome) => outcome,
        Err(CoordinatorError::Blocked(id)) => {
            warn!("worker bloqueado intentó registrarse: {}", id);
            return Err(CoordinatorError::Blocked(id));
        }
        Err(e) => return Err(e),
    };

    let message = match outcome {
        Registration::New => {
            info!("worker registrado: {}", req.url.trim());
            "worker registrado"
        }
        Registration::Refreshed => "worker ya registrado",
    };

    Ok(Json(WorkerRegisterResponse {
        registered: true,
        message: message.to_string(),
    }))
}

// Entrega (y borra) el comando pendiente del worker, si hay
async fn poll(
    State(state): State<AppState>,
    ValidQuery(param): ValidQuery<WorkerParam>,
) -> Result<Json<Command>, CoordinatorError> {
    let worker = param.worker()?;
    let cmd = state.coordinator.poll(&worker, SystemTime::now())?;

    if !cmd.is_none() {
        info!("entregando {:?} al worker {}", cmd, worker);
    }
    Ok(Json(cmd))
}

// Worker reporta que terminó una tarea
async fn report(
    State(state): State<AppState>,
    ValidJson(req): ValidJson<ReportRequest>,
) -> Result<Json<ReportResponse>, CoordinatorError> {
    state.coordinator.report(&req, SystemTime::now())?;
    debug!(
        "reporte de {}: task={} units={} success={}",
        req.worker, req.task, req.units, req.success
    );
    Ok(Json(ReportResponse { ok: true }))
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerInfo>> {
    Json(state.coordinator.workers(SystemTime::now()))
}

async fn get_stats(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(state.coordinator.stats(SystemTime::now()))
}

async fn enqueue(
    State(state): State<AppState>,
    ValidQuery(params): ValidQuery<EnqueueParams>,
) -> Result<Json<AckResponse>, CoordinatorError> {
    let worker = WorkerParam {
        worker: params.worker,
    }
    .worker()?;

    let task = params
        .task
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| CoordinatorError::Validation("falta el parámetro task".into()))?;

    let duration: u64 = params
        .duration
        .as_deref()
        .ok_or_else(|| CoordinatorError::Validation("falta el parámetro duration".into()))?
        .trim()
        .parse()
        .map_err(|_| CoordinatorError::Validation("duration debe ser un entero positivo".into()))?;

    state
        .coordinator
        .enqueue(&worker, &task, params.resource, duration, SystemTime::now())?;

    info!(
        "comando encolado para {}: task={} duration={}s",
        worker, task, duration
    );
    Ok(Json(AckResponse {
        ok: true,
        message: format!("comando encolado para {worker}"),
    }))
}

async fn stop_all(State(state): State<AppState>) -> Json<StopResponse> {
    let workers = state.coordinator.broadcast_stop();
    info!("stop encolado para {} workers", workers);
    Json(StopResponse { ok: true, workers })
}

async fn stop_worker(
    State(state): State<AppState>,
    ValidQuery(param): ValidQuery<WorkerParam>,
) -> Result<Json<AckResponse>, CoordinatorError> {
    let worker = param.worker()?;
    state.coordinator.stop_worker(&worker)?;
    info!("stop encolado para {}", worker);
    Ok(Json(AckResponse {
        ok: true,
        message: format!("stop encolado para {worker}"),
    }))
}

async fn block_worker(
    State(state): State<AppState>,
    ValidQuery(param): ValidQuery<WorkerParam>,
) -> Result<Json<AckResponse>, CoordinatorError> {
    let worker = param.worker()?;
    let was_registered = state.coordinator.block(&worker)?;
    info!("worker bloqueado: {} (estaba registrado={})", worker, was_registered);
    Ok(Json(AckResponse {
        ok: true,
        message: format!("worker {worker} bloqueado"),
    }))
}

async fn unblock_worker(
    State(state): State<AppState>,
    ValidQuery(param): ValidQuery<WorkerParam>,
) -> Result<Json<AckResponse>, CoordinatorError> {
    let worker = param.worker()?;
    let message = if state.coordinator.unblock(&worker)? {
        info!("worker desbloqueado: {}", worker);
        format!("worker {worker} desbloqueado")
    } else {
        format!("worker {worker} no estaba bloqueado")
    };
    Ok(Json(AckResponse { ok: true, message }))
}

async fn list_blocked(State(state): State<AppState>) -> Json<BlockedList> {
    Json(BlockedList {
        blocked: state.coordinator.blocked(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::{RateLimiter, RateLimiterConfig};
    use crate::state::{Coordinator, CoordinatorSettings};
    use std::time::Duration;
    use axum::{
        body::{to_bytes, Body},
        http::{Method, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const TOKEN: &str = "s3cret";

    fn app_with_limit(limits: RateLimiterConfig) -> (Router, AppState) {
        let mut settings = CoordinatorSettings::default();
        settings.task_types.insert("T".to_string());
        let state = AppState::new(
            Coordinator::new(settings, SystemTime::now()),
            TOKEN,
            RateLimiter::new(limits),
        );
        (build_router(state.clone()), state)
    }

    fn app() -> (Router, AppState) {
        app_with_limit(RateLimiterConfig::default())
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        send_raw(app, method, uri, body.map(|b| b.to_string())).await
    }

    async fn send_raw(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<String>,
    ) -> (StatusCode, Value) {
        let builder = axum::http::Request::builder().method(method).uri(uri);
        let req = match body {
            Some(b) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(b))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
        send(app, Method::GET, uri, None).await
    }

    async fn register(app: &Router, url: &str) -> (StatusCode, Value) {
        send(app, Method::POST, "/register", Some(json!({ "url": url }))).await
    }

    #[tokio::test]
    async fn health_is_public() {
        let (app, _) = app();
        let (status, body) = get(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn enqueue_then_poll_twice() {
        let (app, _) = app();
        let (status, body) = register(&app, "w1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["registered"], true);

        let (status, _) = get(&app, &format!("/enqueue?worker=w1&task=T&duration=30&token={TOKEN}")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = get(&app, "/poll?worker=w1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"action": "task", "task": "T", "duration": 30}));

        let (_, body) = get(&app, "/poll?worker=w1").await;
        assert_eq!(body, json!({"action": "none"}));
    }

    #[tokio::test]
    async fn double_registration_keeps_one_worker() {
        let (app, state) = app();
        register(&app, "w1").await;
        let (status, body) = register(&app, "w1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "worker ya registrado");
        assert_eq!(state.coordinator.worker_count(), 1);
    }

    #[tokio::test]
    async fn protected_routes_reject_missing_or_bad_token() {
        let (app, state) = app();
        register(&app, "w1").await;

        for path in [
            "/workers",
            "/stats",
            "/enqueue?worker=w1&task=T&duration=5",
            "/stop",
            "/stop-worker?worker=w1",
            "/block?worker=w1",
            "/unblock?worker=w1",
            "/blocked",
        ] {
            let (status, _) = get(&app, path).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{path} sin token");

            let sep = if path.contains('?') { '&' } else { '?' };
            let (status, _) = get(&app, &format!("{path}{sep}token=wrong")).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{path} con token malo");
        }

        let (status, _) = send(
            &app,
            Method::POST,
            "/report",
            Some(json!({"worker": "w1", "task": "noop", "units": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // nada cambió
        assert_eq!(state.coordinator.worker_count(), 1);
        assert!(state.coordinator.pending_command("w1").is_none());
        assert!(state.coordinator.blocked().is_empty());
    }

    #[tokio::test]
    async fn bearer_header_is_accepted() {
        let (app, _) = app();
        let req = axum::http::Request::builder()
            .uri("/stats")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn enqueue_validates_parameters() {
        let (app, _) = app();
        register(&app, "w1").await;

        let cases = [
            ("/enqueue?task=T&duration=5", StatusCode::BAD_REQUEST),
            ("/enqueue?worker=w1&duration=5", StatusCode::BAD_REQUEST),
            ("/enqueue?worker=w1&task=T", StatusCode::BAD_REQUEST),
            ("/enqueue?worker=w1&task=T&duration=abc", StatusCode::BAD_REQUEST),
            ("/enqueue?worker=w1&task=T&duration=999999", StatusCode::BAD_REQUEST),
            ("/enqueue?worker=w1&task=bogus&duration=5", StatusCode::BAD_REQUEST),
            ("/enqueue?worker=ghost&task=T&duration=5", StatusCode::NOT_FOUND),
        ];
        for (path, expected) in cases {
            let (status, body) = get(&app, &format!("{path}&token={TOKEN}")).await;
            assert_eq!(status, expected, "{path}");
            assert!(body["error"].is_string());
        }

        let (_, body) = get(&app, "/poll?worker=w1").await;
        assert_eq!(body["action"], "none");
    }

    #[tokio::test]
    async fn poll_errors() {
        let (app, _) = app();
        let (status, _) = get(&app, "/poll").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = get(&app, "/poll?worker=ghost").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = register(&app, "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn block_and_unblock_flow() {
        let (app, _) = app();
        register(&app, "http://10.0.0.5:3000").await;

        let (status, _) = get(&app, &format!("/block?worker=http%3A%2F%2F10.0.0.5%3A3000&token={TOKEN}")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = register(&app, "http://10.0.0.5:3000").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = get(&app, "/poll?worker=http%3A%2F%2F10.0.0.5%3A3000").await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (_, body) = get(&app, &format!("/blocked?token={TOKEN}")).await;
        assert_eq!(body["blocked"], json!(["http://10.0.0.5:3000"]));

        let (status, _) = get(&app, &format!("/unblock?worker=http%3A%2F%2F10.0.0.5%3A3000&token={TOKEN}")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = register(&app, "http://10.0.0.5:3000").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn stop_broadcast_via_api() {
        let (app, _) = app();
        register(&app, "w1").await;
        register(&app, "w2").await;
        get(&app, &format!("/enqueue?worker=w1&task=T&duration=30&token={TOKEN}")).await;

        let (status, body) = get(&app, &format!("/stop?token={TOKEN}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["workers"], 2);

        for w in ["w1", "w2"] {
            let (_, body) = get(&app, &format!("/poll?worker={w}")).await;
            assert_eq!(body, json!({"action": "stop"}));
            let (_, body) = get(&app, &format!("/poll?worker={w}")).await;
            assert_eq!(body, json!({"action": "none"}));
        }
    }

    #[tokio::test]
    async fn report_feeds_stats_and_worker_list() {
        let (app, state) = app();
        register(&app, "w1").await;

        let (status, _) = send(
            &app,
            Method::POST,
            &format!("/report?token={TOKEN}"),
            Some(json!({
                "worker": "w1",
                "task": "sleep",
                "resource": "batch-3",
                "units": 12,
                "latency_ms": 80.0,
                "success": true
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            &app,
            Method::POST,
            &format!("/report?token={TOKEN}"),
            Some(json!({"worker": "ghost", "task": "sleep", "units": 100})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        state.coordinator.tick_stats(SystemTime::now());
        let (_, stats) = get(&app, &format!("/stats?token={TOKEN}")).await;
        assert_eq!(stats["total_units"], 12);
        assert_eq!(stats["total_reports"], 1);
        assert_eq!(stats["by_task_type"]["sleep"], 1);
        assert_eq!(stats["mean_latency_ms"], 80.0);
        assert_eq!(stats["workers_registered"], 1);

        let (_, workers) = get(&app, &format!("/workers?token={TOKEN}")).await;
        assert_eq!(workers[0]["worker_id"], "w1");
        assert_eq!(workers[0]["units_reported"], 12);
        assert_eq!(workers[0]["tasks_completed"], 1);
    }

    #[tokio::test]
    async fn malformed_bodies_get_json_errors() {
        let (app, _) = app();
        register(&app, "w1").await;

        let (status, body) = send_raw(&app, Method::POST, "/register", Some("{not json".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        // falta task
        let (status, body) = send(
            &app,
            Method::POST,
            &format!("/report?token={TOKEN}"),
            Some(json!({"worker": "w1"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("task"));

        // sin content-type
        let req = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/register")
            .body(Body::from(r#"{"url":"w2"}"#))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn malformed_query_gets_json_error() {
        let (app, _) = app();
        register(&app, "w1").await;

        let (status, body) = get(&app, "/poll?worker=w1&worker=w2").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, body) = get(
            &app,
            &format!("/enqueue?worker=w1&worker=w1&task=T&duration=5&token={TOKEN}"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    async fn explode() -> &'static str {
        panic!("handler roto")
    }

    #[tokio::test]
    async fn panics_become_json_500() {
        let app = with_boundary(Router::new().route("/boom", axum::routing::get(explode)));
        let (status, body) = get(&app, "/boom").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "error interno del coordinador");
    }

    #[test]
    fn token_comparison() {
        assert!(token_matches("s3cret", "s3cret"));
        assert!(!token_matches("s3cres", "s3cret"));
        assert!(!token_matches("s3cre", "s3cret"));
        assert!(!token_matches("s3cret-and-more", "s3cret"));
        assert!(!token_matches("", "s3cret"));
    }

    #[tokio::test]
    async fn protected_routes_are_rate_limited() {
        let (app, state) = app_with_limit(RateLimiterConfig {
            capacity: 3,
            window: Duration::from_secs(60),
        });
        register(&app, "w1").await;

        for _ in 0..3 {
            let (status, _) = get(&app, &format!("/stats?token={TOKEN}")).await;
            assert_eq!(status, StatusCode::OK);
        }

        let req = axum::http::Request::builder()
            .uri(format!("/block?worker=w1&token={TOKEN}"))
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry: u64 = resp.headers()[header::RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=20).contains(&retry));
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["error"].is_string());

        // rechazado antes de llegar al handler
        assert!(state.coordinator.blocked().is_empty());

        // el camino de los workers no consume del bucket
        let (status, _) = get(&app, "/poll?worker=w1").await;
        assert_eq!(status, StatusCode::OK);
    }
}
