//! CBOR frames exchanged on the client socket.
//!
//! Requests are `{type: 0, id, method, params}` and are answered by
//! `{type: 1, id, result}` or `{type: 1, id, error: {code, message}}`. Push
//! events go out as `{method, params}` without an id. A bare CBOR null is a
//! keepalive in both directions.

use serde::{Deserialize, Serialize};

pub(crate) const RPC_REQUEST: i32 = 0;
pub(crate) const RPC_RESPONSE: i32 = 1;
pub(crate) const CBOR_NULL: &[u8] = &[0xF6];

#[derive(Debug, Deserialize)]
pub(crate) struct RequestFrame {
    #[serde(rename = "type")]
    pub frame_type: i32,
    pub id: String,
    pub method: String,
    #[serde(default = "null_params")]
    pub params: serde_cbor::Value,
}

fn null_params() -> serde_cbor::Value {
    serde_cbor::Value::Null
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_cbor::Error),
    #[error("unexpected frame type {0}")]
    UnexpectedType(i32),
}

/// Parses an inbound binary frame. `Ok(None)` is a keepalive.
pub(crate) fn parse_request(payload: &[u8]) -> Result<Option<RequestFrame>, FrameError> {
    if payload == CBOR_NULL {
        return Ok(None);
    }
    let frame: RequestFrame = serde_cbor::from_slice(payload)?;
    if frame.frame_type != RPC_REQUEST {
        return Err(FrameError::UnexpectedType(frame.frame_type));
    }
    Ok(Some(frame))
}

#[derive(Debug, Serialize)]
struct ResultFrame<'a, T: Serialize> {
    #[serde(rename = "type")]
    frame_type: i32,
    id: &'a str,
    result: &'a T,
}

#[derive(Debug, Serialize)]
struct ErrorFrame<'a> {
    #[serde(rename = "type")]
    frame_type: i32,
    id: &'a str,
    error: ErrorPayload<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorPayload<'a> {
    code: &'a str,
    message: String,
}

pub(crate) fn encode_result<T: Serialize>(id: &str, result: &T) -> Result<Vec<u8>, serde_cbor::Error> {
    serde_cbor::to_vec(&ResultFrame {
        frame_type: RPC_RESPONSE,
        id,
        result,
    })
}

pub(crate) fn encode_error(id: &str, code: &str, message: String) -> Result<Vec<u8>, serde_cbor::Error> {
    serde_cbor::to_vec(&ErrorFrame {
        frame_type: RPC_RESPONSE,
        id,
        error: ErrorPayload { code, message },
    })
}
