//! # HTTP Status Dashboard
//!
//! Read-only HTTP surface over the orchestrator: JSON status endpoints
//! plus an SSE stream of periodic fleet snapshots. The dashboard borrows
//! the same `Arc` handles the MCP service uses and never mutates state,
//! so it can run alongside any transport.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Sse},
    routing::get,
};
use futures::stream::StreamExt;
use serde_json::json;
use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::orchestrator::Orchestrator;

const STATUS_STREAM_INTERVAL: Duration = Duration::from_secs(2);

struct DashboardState {
    orchestrator: Arc<Orchestrator>,
    broadcast_tx: broadcast::Sender<String>,
}

/// Serve the dashboard until the process exits.
pub async fn start_dashboard(
    orchestrator: Arc<Orchestrator>,
    bind_addr: SocketAddr,
) -> anyhow::Result<()> {
    let (broadcast_tx, _) = broadcast::channel(16);

    // Publisher: one status snapshot per tick for every SSE subscriber.
    {
        let orchestrator = Arc::clone(&orchestrator);
        let broadcast_tx = broadcast_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(STATUS_STREAM_INTERVAL).await;
                if broadcast_tx.receiver_count() == 0 {
                    continue;
                }
                match orchestrator.teams_get_status(None, true).await {
                    Ok(status) => {
                        if let Ok(text) = serde_json::to_string(&status) {
                            let _ = broadcast_tx.send(text);
                        }
                    }
                    Err(e) => tracing::warn!("Status snapshot for stream failed: {}", e),
                }
            }
        });
    }

    let state = Arc::new(DashboardState {
        orchestrator,
        broadcast_tx,
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/status", get(get_status))
        .route("/api/teams", get(get_teams))
        .route("/api/teams/{team}/notifications", get(get_team_notifications))
        .route("/api/status/stream", get(stream_status))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!("Dashboard listening on http://{}", bind_addr);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn get_status(State(state): State<Arc<DashboardState>>) -> impl IntoResponse {
    match state.orchestrator.teams_get_status(None, true).await {
        Ok(status) => Json(serde_json::to_value(status).unwrap_or_default()).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(e.to_envelope()),
        )
            .into_response(),
    }
}

async fn get_teams(State(state): State<Arc<DashboardState>>) -> impl IntoResponse {
    let config = state.orchestrator.config().snapshot();
    let teams: Vec<_> = config
        .teams
        .iter()
        .map(|(name, team)| {
            json!({
                "name": name,
                "description": team.description,
                "path": team.path,
                "color": team.color,
            })
        })
        .collect();
    Json(json!({ "teams": teams }))
}

async fn get_team_notifications(
    State(state): State<Arc<DashboardState>>,
    Path(team): Path<String>,
) -> impl IntoResponse {
    match state
        .orchestrator
        .notifications()
        .get_history(&team, Some(100))
        .await
    {
        Ok(history) => Json(json!({ "team": team, "notifications": history })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(e.to_envelope()),
        )
            .into_response(),
    }
}

async fn stream_status(State(state): State<Arc<DashboardState>>) -> impl IntoResponse {
    let rx = state.broadcast_tx.subscribe();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).map(
        |msg| -> Result<_, Infallible> {
            match msg {
                Ok(text) => Ok(axum::response::sse::Event::default().data(text)),
                Err(_) => Ok(axum::response::sse::Event::default().comment("missed snapshots")),
            }
        },
    );
    Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::default())
}
