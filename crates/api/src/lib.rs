#![forbid(unsafe_code)]

use axum::routing::get;
use axum::{extract::State, http::StatusCode, Router};

pub mod commands;
mod error;
mod services;
mod ws;

pub use commands::{handle, Command, Reply};
pub use error::{
    CommandError, ERR_CODE_BAD_REQUEST, ERR_CODE_FORBIDDEN, ERR_CODE_INTERNAL,
    ERR_CODE_INVALID_PARAMS, ERR_CODE_METHOD_NOT_FOUND,
};
pub use services::Services;
pub use ws::{CLIENT_ID_HEADER, CLIENT_INSTANCE_ID_HEADER, WS_SUBPROTOCOL};

#[derive(Clone)]
pub struct ApiState {
    services: Services,
}

impl ApiState {
    #[must_use]
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    #[must_use]
    pub fn services(&self) -> &Services {
        &self.services
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::websocket_upgrade))
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> StatusCode {
    match state.services.entities.ping().await {
        Ok(()) => StatusCode::OK,
        Err(error) => {
            tracing::warn!(%error, "health check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
