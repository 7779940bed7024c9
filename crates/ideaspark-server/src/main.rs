mod config;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use ideaspark_api::auth::verify_token;
use ideaspark_api::cache::{MemoryStore, RateLimiter};
use ideaspark_api::generation::GeminiClient;
use ideaspark_api::mailer::{LogMailer, WelcomeEmail};
use ideaspark_api::queue::{JobQueue, QueueConfig};
use ideaspark_api::reply::ReplyPipeline;
use ideaspark_api::service::ConversationService;
use ideaspark_api::{AppError, AppState, AppStateInner};
use ideaspark_db::Database;
use ideaspark_gateway::{Dispatcher, connection};

use crate::config::Config;

const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ideaspark=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Arc::new(Database::open(&config.db_path)?);

    // Reply pipeline
    if config.gemini_api_key.is_none() {
        warn!("GEMINI_API_KEY is not set; every reply will be an apology");
    }
    let provider = GeminiClient::new(config.gemini_api_key.clone(), config.gemini_model.clone())?;
    let dispatcher = Dispatcher::new();
    let replies = ReplyPipeline::new(
        Arc::new(provider),
        Arc::new(dispatcher.clone()),
        config.generation_timeout,
    );
    let conversations = ConversationService::new(db.clone(), replies, config.daily_ideas);

    // Background jobs
    let shutdown = CancellationToken::new();
    let queue = JobQueue::new(
        db.clone(),
        QueueConfig {
            concurrency: config.job_concurrency,
            ..QueueConfig::default()
        },
        vec![Arc::new(WelcomeEmail::new(Arc::new(LogMailer)))],
    );
    let mut tasks = queue.start(shutdown.clone());

    // Rate limiting
    let store = Arc::new(MemoryStore::new());
    let limiter = RateLimiter::new(store.clone(), config.rate_limit_window, config.rate_limit_max);
    tasks.push(tokio::spawn(purge_cache(store, shutdown.clone())));

    let state: AppState = Arc::new(AppStateInner {
        db,
        dispatcher,
        conversations,
        queue,
        limiter,
        jwt_secret: config.jwt_secret.clone(),
        token_ttl_days: config.token_ttl_days,
        daily_ideas: config.daily_ideas,
    });

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(state.clone());

    let app = ideaspark_api::router(state)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("IdeaSpark server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!("Background tasks stopped");

    Ok(())
}

#[derive(Debug, Deserialize)]
struct GatewayParams {
    token: Option<String>,
}

/// The token rides in the query string because browsers cannot set headers
/// on a WebSocket handshake.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<GatewayParams>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, AppError> {
    let token = params.token.ok_or(AppError::Unauthorized)?;
    let claims = verify_token(&state.jwt_secret, &token)?;
    let dispatcher = state.dispatcher.clone();
    Ok(ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, dispatcher, claims.sub, claims.username)
    }))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn purge_cache(store: Arc<MemoryStore>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(CACHE_PURGE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let purged = store.purge_expired().await;
                if purged > 0 {
                    info!("Cache: purged {} expired keys", purged);
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Could not install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
