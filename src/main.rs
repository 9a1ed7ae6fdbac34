use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::{Config as RedisPoolConfig, Pool, Runtime};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

use livewire::dispatch::PublishError;
use livewire::event::{EventKind, SyncEvent};
use livewire::registry::{ConnectionRegistry, SinkError, ViewerSink};
use livewire::store::RedisStore;
use livewire::{Dispatcher, Metrics, Relay, Scheduler, ShutdownSignal, StoreReader, SyncConfig};

struct AppState {
    dispatcher: Dispatcher,
    registry: Arc<ConnectionRegistry>,
    redis_pool: Pool,
    metrics: Arc<Metrics>,
    api_key: Option<String>,
}

/// Response returned when an event is accepted for dispatch.
#[derive(Debug, Serialize, Deserialize)]
struct PublishResponse {
    id: String,
    status: String,
}

/// Producer surface: kind + payload, optionally keyed and prioritized.
#[derive(Debug, Deserialize)]
struct PublishRequest {
    kind: EventKind,
    payload: Value,
    #[serde(rename = "correlationKey")]
    correlation_key: Option<String>,
    priority: Option<u8>,
}

#[tokio::main]
async fn main() {
    // 1. Logging and environment
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    // 2. Configuration
    let config = SyncConfig::load().expect("invalid configuration");
    let instance = config.instance_id();
    let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| config.redis.url.clone());
    let api_key = env::var("LIVEWIRE_API_KEY")
        .ok()
        .or_else(|| config.server.api_key.clone());
    if api_key.is_none() {
        warn!("No API key configured, the ingest endpoint is open. DO NOT RUN LIKE THIS IN PRODUCTION.");
    }

    // 3. Redis pool (shared channel + aggregate reads)
    let pool = RedisPoolConfig::from_url(redis_url.clone())
        .create_pool(Some(Runtime::Tokio1))
        .expect("failed to create Redis pool");

    // 4. Engine wiring. Registry and dispatcher construction are the only
    //    process-fatal steps; everything after degrades at runtime instead.
    let metrics = Arc::new(Metrics::new());
    let store: Arc<dyn StoreReader> = Arc::new(RedisStore::new(pool.clone()));
    let registry = Arc::new(ConnectionRegistry::new(
        Arc::clone(&store),
        Arc::clone(&metrics),
        config.registry_config(),
    ));
    let shutdown = ShutdownSignal::new();

    let relay = Relay::new(
        pool.clone(),
        redis_url,
        instance.clone(),
        config.relay_config(),
        Arc::clone(&metrics),
        shutdown.clone(),
    );
    let relay_handle = relay.handle();

    let builder = Dispatcher::builder(instance.clone())
        .lanes(config.sync.lanes)
        .queue_depth(config.sync.queue_depth);
    let builder = config.register_routes(builder);
    let dispatcher = builder.build(
        Arc::clone(&registry),
        Some(relay_handle),
        Arc::clone(&metrics),
        shutdown.clone(),
    );

    relay.spawn(dispatcher.clone());
    Scheduler::new(
        dispatcher.clone(),
        Arc::clone(&store),
        Arc::clone(&metrics),
        config.scheduler_config(),
        shutdown.clone(),
    )
    .spawn();

    // 5. HTTP/WS surface
    let app_state = Arc::new(AppState {
        dispatcher,
        registry,
        redis_pool: pool,
        metrics,
        api_key,
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/ws", get(ws_handler))
        .route("/api/v1/events", post(emit_event))
        .layer(middleware::from_fn_with_state(
            app_state.clone(),
            auth_middleware,
        ))
        .with_state(app_state);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.server.port)
        .parse()
        .expect("invalid listen address");

    info!(%addr, instance = %instance, "livewire listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind listen address");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.wait().await })
        .await
        .expect("server error");

    info!("livewire stopped");
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // Viewers and probes connect unauthenticated; only producers need a key.
    let path = req.uri().path();
    if path != "/api/v1/events" {
        return Ok(next.run(req).await);
    }

    let Some(api_key) = &state.api_key else {
        return Ok(next.run(req).await);
    };

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok());

    match auth_header {
        Some(auth_header) if auth_header.starts_with("Bearer ") => {
            if &auth_header[7..] == api_key {
                Ok(next.run(req).await)
            } else {
                warn!("Invalid API key attempt");
                Err(StatusCode::UNAUTHORIZED)
            }
        }
        _ => {
            warn!("Missing or malformed Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let mut conn = state.redis_pool.get().await.map_err(|e| {
        error!(error = %e, "Failed to get Redis connection");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let _: String = cmd("PING").query_async(&mut conn).await.map_err(|e| {
        error!(error = %e, "Redis PING failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(json!({
        "status": "ok",
        "redis": "connected",
        "relay": if state.metrics.relay_reachable() { "reachable" } else { "unreachable" },
    })))
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let uptime = state.metrics.uptime_seconds();

    let mut summary = state.metrics.summary();
    summary["version"] = json!(env!("CARGO_PKG_VERSION"));
    summary["uptimeSeconds"] = json!(uptime);
    summary["instance"] = json!(state.dispatcher.instance());

    Json(summary)
}

async fn emit_event(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PublishRequest>,
) -> Result<(StatusCode, Json<PublishResponse>), StatusCode> {
    let mut event = SyncEvent::new(
        request.kind,
        request.payload,
        state.dispatcher.instance().to_string(),
    );
    if let Some(key) = request.correlation_key {
        event = event.with_correlation_key(key);
    }
    if let Some(priority) = request.priority {
        event = event.with_priority(priority);
    }

    let kind = event.kind;
    match state.dispatcher.publish_event(event) {
        Ok(id) => {
            info!(id = %id, kind = %kind, "Event accepted");
            Ok((
                StatusCode::ACCEPTED,
                Json(PublishResponse {
                    id,
                    status: "accepted".to_string(),
                }),
            ))
        }
        Err(PublishError::Saturated) => {
            warn!(kind = %kind, "Dispatcher saturated, rejecting event");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
        Err(PublishError::Closed) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_viewer(state, socket))
}

/// One task per viewer: the write half is handed to the registry (which
/// owns it exclusively through the connection's writer task), the read half
/// drives liveness and disconnect.
async fn handle_viewer(state: Arc<AppState>, socket: WebSocket) {
    let (write, mut read) = socket.split();

    let id = match state.registry.accept(Box::new(WsSink { write })).await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "Viewer handshake failed");
            return;
        }
    };

    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => state.registry.touch(id),
        }
    }

    state.registry.disconnect(id);
}

struct WsSink {
    write: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl ViewerSink for WsSink {
    async fn send(&mut self, frame: &str) -> Result<(), SinkError> {
        self.write
            .send(Message::Text(frame.to_string()))
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.write.send(Message::Close(None)).await;
    }
}
