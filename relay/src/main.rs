mod room_relay;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::HeaderValue;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use socketioxide::SocketIo;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use room_relay::{new_registry, on_connect};

// ─── Global startup time (for uptime reporting) ──────────────────────────────
static STARTUP_MS: AtomicU64 = AtomicU64::new(0);

// ─── Time Sync Endpoint ───────────────────────────────────────────────────────
// Devices use this to seed their wall-clock reference before the real
// peer-to-peer SYNC handshake takes over; it is not itself the sync source.

async fn time_sync() -> axum::Json<serde_json::Value> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
    axum::Json(json!({ "serverTime": now }))
}

// ─── Health Endpoint ──────────────────────────────────────────────────────────
// GET /health → { status, version, uptimeSecs }

async fn health_check() -> axum::Json<serde_json::Value> {
    let now_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
    let startup = STARTUP_MS.load(Ordering::Relaxed);
    let uptime_secs = if startup > 0 { (now_ms - startup) / 1000 } else { 0 };
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": uptime_secs,
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let startup_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
    STARTUP_MS.store(startup_ms, Ordering::Relaxed);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "timer_relay=info,socketioxide=warn".into()),
        )
        .init();

    info!("timer-relay v{} starting", env!("CARGO_PKG_VERSION"));

    let rooms = new_registry();

    let (socket_layer, io) = SocketIo::builder().build_layer();

    io.ns("/", move |socket: socketioxide::extract::SocketRef| {
        let rooms = rooms.clone();
        async move {
            on_connect(socket, rooms).await;
        }
    });

    // CORS — local dev allows the usual vite/CRA ports; deployments set
    // CORS_ORIGINS=* to let native apps and browsers from any origin connect.
    let cors_origins_env = std::env::var("CORS_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000,http://localhost:5173".to_string());

    let cors = if cors_origins_env.trim() == "*" {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> =
            cors_origins_env.split(',').filter_map(|o| o.trim().parse::<HeaderValue>().ok()).collect();
        CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any)
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/sync", get(time_sync))
        .layer(socket_layer)
        .layer(cors);

    let port = std::env::var("PORT").unwrap_or_else(|_| "3001".to_string());
    let addr = format!("0.0.0.0:{port}");
    info!("listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
