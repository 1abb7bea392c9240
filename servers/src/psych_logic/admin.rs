use crate::psych_logic::config::Config;
use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use http::StatusCode;
use lib_psych::core::{
    CoreError, CounterSnapshot, Diagnostics, Dispatcher, PsychProvider, Republish, RepublishMode,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct AdminState {
    pub provider: Arc<PsychProvider>,
    pub dispatcher: Arc<Dispatcher>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CountersQuery {
    #[serde(default)]
    pub reset: bool,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/counters", get(counters_handler))
        .route("/republish", post(republish_soft_handler))
        .route("/republish/hard", post(republish_hard_handler))
        .with_state(state)
}

pub async fn run(config: Config, state: AdminState, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
    let addr = config.admin_addr()?;
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Admin server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Admin server shutting down.");
        })
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<AdminState>) -> impl IntoResponse {
    if state.provider.is_shutdown().await {
        (StatusCode::SERVICE_UNAVAILABLE, "SHUTDOWN")
    } else {
        (StatusCode::OK, "OK")
    }
}

async fn status_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let resources = state.provider.resource_status().await;
    let shutdown = state.provider.is_shutdown().await;
    Json(serde_json::json!({
        "service": state.provider.config().service_name,
        "shutdown": shutdown,
        "catalogGeneration": state.provider.catalog().generation(),
        "clients": state.dispatcher.client_count(),
        "openStreams": state.dispatcher.open_streams(),
        "resources": resources,
    }))
}

async fn counters_handler(State(state): State<AdminState>, Query(query): Query<CountersQuery>) -> Json<CounterSnapshot> {
    let snapshot = if query.reset {
        state.provider.snapshot_counters().await
    } else {
        state.provider.counters().await
    };
    Json(snapshot)
}

async fn republish_soft_handler(State(state): State<AdminState>) -> Response {
    republish(&state, RepublishMode::Soft).await
}

async fn republish_hard_handler(State(state): State<AdminState>) -> Response {
    republish(&state, RepublishMode::Hard).await
}

async fn republish(state: &AdminState, mode: RepublishMode) -> Response {
    log::info!("Manual {:?} republish requested", mode);
    match state.provider.republish(mode).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => {
            let status = match e {
                CoreError::Shutdown | CoreError::NotStarted | CoreError::WorkerGone => StatusCode::SERVICE_UNAVAILABLE,
                CoreError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            log::warn!("Manual {:?} republish failed: {}", mode, e);
            (status, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_psych::configs::PsychConfig;
    use lib_psych::core::CounterKind;

    fn state() -> AdminState {
        let config = PsychConfig::from_json_str(
            r#"{
                "baseUrl": "http://127.0.0.1:9/",
                "resources": [{
                    "name": "fx",
                    "source": "News",
                    "path": "fx.txt",
                    "fields": { "bid": 22 },
                    "items": {}
                }]
            }"#,
        )
        .unwrap();
        let dispatcher = Arc::new(Dispatcher::new());
        let provider = PsychProvider::with_http(config, dispatcher.clone()).unwrap();
        AdminState {
            provider: Arc::new(provider),
            dispatcher,
        }
    }

    #[tokio::test]
    async fn test_health_ok_until_shutdown() {
        let response = health_handler(State(state())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_republish_before_start_is_unavailable() {
        let response = republish_hard_handler(State(state())).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_counters_reset_window() {
        let state = state();
        let query = |reset| Query(CountersQuery { reset });
        let Json(first) = counters_handler(State(state.clone()), query(false)).await;
        assert_eq!(first.windowed(CounterKind::RequestsSent), 0);
        let Json(reset) = counters_handler(State(state.clone()), query(true)).await;
        let Json(after) = counters_handler(State(state), query(false)).await;
        assert_eq!(after.window_started, reset.taken_at);
    }
}
