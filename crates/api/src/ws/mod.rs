use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header::SEC_WEBSOCKET_PROTOCOL;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use cloudsync_core::Client;
use cloudsync_engine::EngineError;
use cloudsync_realtime::broker::BrokerError;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use uuid::Uuid;

use crate::commands::{self, Command};
use crate::{ApiState, Services};

mod frames;

pub const WS_SUBPROTOCOL: &str = "cloudsync.v1";
/// Identity headers set by the authenticating proxy in front of the server.
pub const CLIENT_ID_HEADER: &str = "x-client-id";
pub const CLIENT_INSTANCE_ID_HEADER: &str = "x-client-instance-id";

pub const CLOSE_TOO_MANY_CONNECTIONS: u16 = 4003;
pub const CLOSE_PROTOCOL_ERROR: u16 = 4005;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Interval between keepalive frames (CBOR null).
const WS_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Maximum size of a single inbound WebSocket message (4 MiB).
const WS_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

type SocketSender = SplitSink<WebSocket, Message>;

pub(crate) async fn websocket_upgrade(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !requested_subprotocol(&headers) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let Some((client_id, client_instance_id)) = identity(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let services = state.services().clone();
    let client = match services
        .presence
        .register(&client_id, &client_instance_id)
        .await
    {
        Ok(client) if client.client_id == client_id => client,
        Ok(_) => return StatusCode::FORBIDDEN.into_response(),
        Err(error) => {
            tracing::error!(%error, %client_instance_id, "failed to register client");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    ws.protocols([WS_SUBPROTOCOL])
        .max_frame_size(WS_MAX_MESSAGE_SIZE)
        .max_message_size(WS_MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| serve_websocket(socket, services, client))
        .into_response()
}

fn requested_subprotocol(headers: &HeaderMap) -> bool {
    headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .split(',')
                .map(str::trim)
                .any(|candidate| candidate == WS_SUBPROTOCOL)
        })
}

fn identity(headers: &HeaderMap) -> Option<(String, String)> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned)
    };
    Some((header(CLIENT_ID_HEADER)?, header(CLIENT_INSTANCE_ID_HEADER)?))
}

async fn serve_websocket(socket: WebSocket, services: Services, client: Client) {
    let (mut socket_sender, mut socket_receiver) = socket.split();
    let client_instance_id = client.client_instance_id.clone();
    let connection_id = Uuid::new_v4().to_string();

    let mut connection = match services
        .presence
        .connect(&client_instance_id, &connection_id)
        .await
    {
        Ok(connection) => connection,
        Err(EngineError::Broker(BrokerError::TooManyConnections)) => {
            tracing::info!(%client_instance_id, "connection limit reached");
            send_close(&mut socket_sender, CLOSE_TOO_MANY_CONNECTIONS, "too many connections").await;
            return;
        }
        Err(error) => {
            tracing::error!(%error, %client_instance_id, "failed to connect client");
            send_close(&mut socket_sender, CLOSE_INTERNAL_ERROR, "internal").await;
            return;
        }
    };

    let mut keepalive = tokio::time::interval(WS_KEEPALIVE_INTERVAL);
    keepalive.tick().await; // first tick fires immediately, skip it

    loop {
        tokio::select! {
            push = connection.receiver.recv() => {
                // The broker dropped this subscriber.
                let Some(payload) = push else { break };
                if socket_sender
                    .send(Message::Binary(payload.to_vec().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            message = socket_receiver.next() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(_)) | None => break,
                };
                match message {
                    Message::Binary(payload) => match frames::parse_request(&payload) {
                        Ok(Some(request)) => {
                            let Some(response) = handle_request(&services, &client, request).await
                            else {
                                continue;
                            };
                            if socket_sender
                                .send(Message::Binary(response.into()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(error) => {
                            tracing::debug!(%error, %client_instance_id, "closing on bad frame");
                            send_close(&mut socket_sender, CLOSE_PROTOCOL_ERROR, "invalid frame").await;
                            break;
                        }
                    },
                    Message::Text(_) => {
                        send_close(
                            &mut socket_sender,
                            CLOSE_PROTOCOL_ERROR,
                            "expected binary rpc frame",
                        )
                        .await;
                        break;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
            _ = keepalive.tick() => {
                if socket_sender
                    .send(Message::Binary(frames::CBOR_NULL.to_vec().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    connection.closed_flag().store(true, Ordering::Relaxed);
    if let Err(error) = services
        .presence
        .disconnect(&client_instance_id, connection)
        .await
    {
        tracing::warn!(%error, %client_instance_id, "failed to record disconnect");
    }
}

/// Runs one request and encodes its response frame.
async fn handle_request(
    services: &Services,
    client: &Client,
    request: frames::RequestFrame,
) -> Option<Vec<u8>> {
    let outcome = match Command::decode(&request.method, request.params) {
        Ok(command) => commands::handle(services, client, command).await,
        Err(error) => Err(error),
    };
    let encoded = match outcome {
        Ok(reply) => frames::encode_result(&request.id, &reply),
        Err(error) => {
            if error.code() == crate::error::ERR_CODE_INTERNAL {
                tracing::error!(%error, method = %request.method, client_instance_id = %client.client_instance_id, "command failed");
            } else {
                tracing::debug!(%error, method = %request.method, client_instance_id = %client.client_instance_id, "command rejected");
            }
            frames::encode_error(&request.id, error.code(), error.public_message())
        }
    };
    match encoded {
        Ok(encoded) => Some(encoded),
        Err(error) => {
            tracing::error!(%error, method = %request.method, "failed to encode response");
            None
        }
    }
}

async fn send_close(sender: &mut SocketSender, code: u16, reason: &'static str) {
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

#[cfg(test)]
mod tests;
