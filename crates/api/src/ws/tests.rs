use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::header::SEC_WEBSOCKET_PROTOCOL;
use axum::http::{HeaderValue, StatusCode};
use cloudsync_engine::SynchronizationPolicy;
use cloudsync_realtime::broker::{BrokerConfig, GroupBroker};
use cloudsync_storage::{Entities, MemoryStore};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

use super::{
    CLIENT_ID_HEADER, CLIENT_INSTANCE_ID_HEADER, CLOSE_PROTOCOL_ERROR, CLOSE_TOO_MANY_CONNECTIONS,
    WS_SUBPROTOCOL,
};
use crate::{router, ApiState, Services};

type TestSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[tokio::test]
async fn websocket_rejects_missing_subprotocol() {
    let server = spawn_server(test_state(BrokerConfig::default())).await;
    let request = ws_request(server.addr, None, Some(("owner-a", "a")));

    let error = connect_async(request)
        .await
        .expect_err("missing subprotocol should be rejected");
    assert_http_status(error, StatusCode::BAD_REQUEST);

    server.handle.abort();
}

#[tokio::test]
async fn websocket_rejects_missing_identity() {
    let server = spawn_server(test_state(BrokerConfig::default())).await;
    let request = ws_request(server.addr, Some(WS_SUBPROTOCOL), None);

    let error = connect_async(request)
        .await
        .expect_err("anonymous socket should be rejected");
    assert_http_status(error, StatusCode::UNAUTHORIZED);

    server.handle.abort();
}

#[tokio::test]
async fn websocket_rejects_instance_claimed_by_another_client() {
    let server = spawn_server(test_state(BrokerConfig::default())).await;
    let mut socket = connect(server.addr, "owner-a", "a").await;
    socket.close(None).await.expect("close socket");

    let request = ws_request(server.addr, Some(WS_SUBPROTOCOL), Some(("intruder", "a")));
    let error = connect_async(request)
        .await
        .expect_err("foreign client id should be rejected");
    assert_http_status(error, StatusCode::FORBIDDEN);

    server.handle.abort();
}

#[tokio::test]
async fn websocket_create_session_round_trip() {
    let server = spawn_server(test_state(BrokerConfig::default())).await;
    let mut socket = connect(server.addr, "owner-a", "a").await;

    send_request(&mut socket, "req-1", "create_session", create_session_params()).await;
    let response: RpcResultResponse<SessionResult> = read_frame(&mut socket).await;

    assert_eq!(response.frame_type, super::frames::RPC_RESPONSE);
    assert_eq!(response.id, "req-1");
    assert_eq!(response.result.session_id.len(), 9);
    assert!(!response.result.is_activated);

    server.handle.abort();
}

#[tokio::test]
async fn websocket_delivers_pushes_to_session_members() {
    let server = spawn_server(test_state(BrokerConfig::default())).await;
    let mut a = connect(server.addr, "owner-a", "a").await;
    let mut b = connect(server.addr, "owner-b", "b").await;

    send_request(&mut a, "req-1", "create_session", create_session_params()).await;
    let created: RpcResultResponse<SessionResult> = read_frame(&mut a).await;
    let session_id = created.result.session_id;

    send_request(
        &mut b,
        "req-2",
        "ask_password_exchange_key",
        serde_json::json!({ "session_id": session_id, "public_key": [2, 2] }),
    )
    .await;
    let answered: RpcResultResponse<serde_json::Value> = read_frame(&mut b).await;
    assert_eq!(answered.id, "req-2");
    assert_eq!(answered.result["status"], "ProcessingNormally");

    let push: PushFrame = read_frame(&mut a).await;
    assert_eq!(push.method, "password_exchange_key_requested");
    assert_eq!(push.params["joiner_instance_id"], "b");

    server.handle.abort();
}

#[tokio::test]
async fn websocket_unknown_method_returns_method_not_found() {
    let server = spawn_server(test_state(BrokerConfig::default())).await;
    let mut socket = connect(server.addr, "owner-a", "a").await;

    send_request(&mut socket, "req-9", "teleport", serde_json::Value::Null).await;
    let response: RpcErrorResponse = read_frame(&mut socket).await;
    assert_eq!(response.id, "req-9");
    assert_eq!(response.error.code, crate::ERR_CODE_METHOD_NOT_FOUND);

    // The connection stays usable.
    send_request(&mut socket, "req-10", "create_session", create_session_params()).await;
    let response: RpcResultResponse<SessionResult> = read_frame(&mut socket).await;
    assert_eq!(response.id, "req-10");

    server.handle.abort();
}

#[tokio::test]
async fn websocket_outsider_gets_forbidden() {
    let server = spawn_server(test_state(BrokerConfig::default())).await;
    let mut a = connect(server.addr, "owner-a", "a").await;
    let mut z = connect(server.addr, "owner-z", "z").await;

    send_request(&mut a, "req-1", "create_session", create_session_params()).await;
    let created: RpcResultResponse<SessionResult> = read_frame(&mut a).await;

    send_request(
        &mut z,
        "req-2",
        "start_synchronization",
        serde_json::json!({ "session_id": created.result.session_id, "actions_groups": [] }),
    )
    .await;
    let response: RpcErrorResponse = read_frame(&mut z).await;
    assert_eq!(response.error.code, crate::ERR_CODE_FORBIDDEN);

    server.handle.abort();
}

#[tokio::test]
async fn websocket_text_frame_closes_with_protocol_error() {
    let server = spawn_server(test_state(BrokerConfig::default())).await;
    let mut socket = connect(server.addr, "owner-a", "a").await;

    socket
        .send(WsMessage::Text("hello".into()))
        .await
        .expect("send text frame");
    assert_eq!(expect_close_code(&mut socket).await, CLOSE_PROTOCOL_ERROR);

    server.handle.abort();
}

#[tokio::test]
async fn websocket_invalid_cbor_closes_with_protocol_error() {
    let server = spawn_server(test_state(BrokerConfig::default())).await;
    let mut socket = connect(server.addr, "owner-a", "a").await;

    socket
        .send(WsMessage::Binary(vec![0xFF, 0x00].into()))
        .await
        .expect("send binary frame");
    assert_eq!(expect_close_code(&mut socket).await, CLOSE_PROTOCOL_ERROR);

    server.handle.abort();
}

#[tokio::test]
async fn websocket_keepalive_is_ignored() {
    let server = spawn_server(test_state(BrokerConfig::default())).await;
    let mut socket = connect(server.addr, "owner-a", "a").await;

    socket
        .send(WsMessage::Binary(super::frames::CBOR_NULL.to_vec().into()))
        .await
        .expect("send keepalive");
    send_request(&mut socket, "req-1", "create_session", create_session_params()).await;
    let response: RpcResultResponse<SessionResult> = read_frame(&mut socket).await;
    assert_eq!(response.id, "req-1");

    server.handle.abort();
}

#[tokio::test]
async fn websocket_connection_limit_closes_extra_sockets() {
    let server = spawn_server(test_state(BrokerConfig {
        max_connections_per_client: 1,
    }))
    .await;
    let mut first = connect(server.addr, "owner-a", "a").await;
    // A served request means the first connection holds its slot.
    send_request(&mut first, "req-1", "create_session", create_session_params()).await;
    let _: RpcResultResponse<SessionResult> = read_frame(&mut first).await;

    let mut second = connect(server.addr, "owner-a", "a").await;

    assert_eq!(
        expect_close_code(&mut second).await,
        CLOSE_TOO_MANY_CONNECTIONS
    );

    server.handle.abort();
}

struct TestServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

async fn spawn_server(state: ApiState) -> TestServer {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("listener addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve app");
    });
    TestServer { addr, handle }
}

fn test_state(config: BrokerConfig) -> ApiState {
    let entities = Entities::new(Arc::new(MemoryStore::new()));
    let broker = Arc::new(GroupBroker::new(config));
    ApiState::new(Services::new(
        entities,
        broker,
        SynchronizationPolicy::default(),
    ))
}

fn ws_request(
    addr: SocketAddr,
    subprotocol: Option<&str>,
    identity: Option<(&str, &str)>,
) -> axum::http::Request<()> {
    let mut request = format!("ws://{addr}/ws")
        .into_client_request()
        .expect("request");
    if let Some(subprotocol) = subprotocol {
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(subprotocol).expect("valid protocol header"),
        );
    }
    if let Some((client_id, client_instance_id)) = identity {
        request.headers_mut().insert(
            CLIENT_ID_HEADER,
            HeaderValue::from_str(client_id).expect("valid client id header"),
        );
        request.headers_mut().insert(
            CLIENT_INSTANCE_ID_HEADER,
            HeaderValue::from_str(client_instance_id).expect("valid instance id header"),
        );
    }
    request
}

async fn connect(addr: SocketAddr, client_id: &str, client_instance_id: &str) -> TestSocket {
    let request = ws_request(
        addr,
        Some(WS_SUBPROTOCOL),
        Some((client_id, client_instance_id)),
    );
    let (socket, _) = connect_async(request).await.expect("connect websocket");
    socket
}

fn assert_http_status(error: WsError, status: StatusCode) {
    match error {
        WsError::Http(response) => assert_eq!(response.status(), status),
        other => panic!("expected HTTP error, got {other:?}"),
    }
}

fn create_session_params() -> serde_json::Value {
    serde_json::json!({ "settings": [1, 2, 3], "creator_public_key": [9, 9] })
}

async fn send_request(
    socket: &mut TestSocket,
    id: &str,
    method: &str,
    params: serde_json::Value,
) {
    let frame = serde_cbor::to_vec(&serde_json::json!({
        "type": super::frames::RPC_REQUEST,
        "id": id,
        "method": method,
        "params": params,
    }))
    .expect("encode request frame");
    socket
        .send(WsMessage::Binary(frame.into()))
        .await
        .expect("send request frame");
}

async fn expect_close_code(socket: &mut TestSocket) -> u16 {
    let frame = tokio::time::timeout(Duration::from_secs(2), socket.next())
        .await
        .expect("read timeout")
        .expect("close frame")
        .expect("websocket read");

    match frame {
        WsMessage::Close(Some(close)) => u16::from(close.code),
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[derive(Debug, Deserialize)]
struct RpcResultResponse<T> {
    #[serde(rename = "type")]
    frame_type: i32,
    id: String,
    result: T,
}

#[derive(Debug, Deserialize)]
struct RpcErrorResponse {
    id: String,
    error: RpcErrorPayload,
}

#[derive(Debug, Deserialize)]
struct RpcErrorPayload {
    code: String,
    #[serde(rename = "message")]
    _message: String,
}

#[derive(Debug, Deserialize)]
struct SessionResult {
    session_id: String,
    is_activated: bool,
}

#[derive(Debug, Deserialize)]
struct PushFrame {
    method: String,
    params: serde_json::Value,
}

async fn read_frame<T: serde::de::DeserializeOwned>(socket: &mut TestSocket) -> T {
    let frame = tokio::time::timeout(Duration::from_secs(2), socket.next())
        .await
        .expect("read timeout")
        .expect("response frame")
        .expect("websocket read");

    match frame {
        WsMessage::Binary(data) => serde_cbor::from_slice(&data).expect("decode frame"),
        other => panic!("expected binary frame, got {other:?}"),
    }
}
