mod webhook;

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use codemend_core::{
    config::Config,
    dispatch::DispatchSweeper,
    github::GithubClient,
    pipeline::Remediator,
    runner::Runner,
    store::ScheduleStore,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<ScheduleStore>,
    pub remediator: Arc<Remediator>,
    pub sweeper: Arc<DispatchSweeper>,
}

// ── Error helper ──────────────────────────────────────────────────────────

fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "codemend_server=info,codemend_core=info".into()),
        )
        .init();

    let config = Arc::new(Config::from_env()?);

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = format!("{}/codemend.db", config.data_dir);
    let store = ScheduleStore::open(&db_path)?;
    store.migrate()?;
    let store = Arc::new(store);

    setup_git_identity(&config).await;

    let host = Arc::new(GithubClient::new(
        config.github_token.clone(),
        config.api_base_url.clone(),
    ));

    let remediator = Arc::new(Remediator::new(
        host.clone(),
        Arc::clone(&store),
        Arc::clone(&config),
    ));
    let sweeper = Arc::new(DispatchSweeper::new(host, Arc::clone(&store)));

    // Time-driven sweep loop
    {
        let sweeper = Arc::clone(&sweeper);
        let interval_s = config.sweep_interval_s;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval_s)).await;
                if let Err(e) = sweeper.run_sweep().await {
                    tracing::error!("dispatch sweep failed: {e}");
                }
            }
        });
    }

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        store,
        remediator,
        sweeper,
    });

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/schedules", get(list_schedules))
        .route("/webhook", post(webhook::handle_webhook))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.web_bind, config.web_port);
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Set the bot's git identity once at startup so commits in every workspace
/// carry it. Skipped with a warning when unconfigured.
async fn setup_git_identity(config: &Config) {
    if config.git_author_name.is_empty() || config.git_author_email.is_empty() {
        warn!("GIT_AUTHOR_NAME / GIT_AUTHOR_EMAIL unset, commits will use the host identity");
        return;
    }
    let runner = Runner::new(config.command_timeout_s);
    for (key, value) in [
        ("user.name", config.git_author_name.as_str()),
        ("user.email", config.git_author_email.as_str()),
    ] {
        if let Err(e) = runner
            .run("git", &["config", "--global", key, value], None, None)
            .await
        {
            warn!("failed to set git {key}: {e}");
        }
    }
    info!("git identity configured");
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct SchedulesQuery {
    owner: String,
}

async fn list_schedules(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SchedulesQuery>,
) -> Result<Json<Value>, StatusCode> {
    let records = state
        .store
        .list_schedules_for_owner(&q.owner)
        .map_err(internal)?;
    Ok(Json(json!(records)))
}
