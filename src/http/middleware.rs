//! Lobby -> match RPC signing and verification

use axum::{
    body::{to_bytes, Body},
    extract::{Query, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

use crate::app::AppState;
use crate::http::routes::MatchRpcQuery;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Match-Signature";

/// Maximum accepted clock skew between lobby and match server
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Snapshots with a replay attached can be large
const MAX_RPC_BODY: usize = 16 * 1024 * 1024;

fn mac_for(
    secret: &str,
    timestamp: i64,
    room_id: &str,
    cmd: &str,
    body: &[u8],
) -> Result<HmacSha256, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Invalid)?;
    mac.update(format!("{}.{}.{}.", timestamp, room_id, cmd).as_bytes());
    mac.update(body);
    Ok(mac)
}

/// Header value `t=<unix secs>,v1=<hex hmac>` for one RPC call
pub fn sign_match_rpc(
    secret: &str,
    timestamp: i64,
    room_id: &str,
    cmd: &str,
    body: &[u8],
) -> Result<String, SignatureError> {
    let mac = mac_for(secret, timestamp, room_id, cmd, body)?;
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

pub fn verify_match_rpc(
    header: &str,
    secret: &str,
    room_id: &str,
    cmd: &str,
    body: &[u8],
    now: i64,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        let mut kv = part.trim().splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some("t"), Some(value)) => timestamp = value.parse().ok(),
            (Some("v1"), Some(value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Invalid)?;
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(SignatureError::Expired);
    }

    let valid = signatures.iter().any(|sig| {
        let Ok(provided) = hex::decode(sig) else {
            return false;
        };
        mac_for(secret, timestamp, room_id, cmd, body)
            .map(|mac| mac.verify_slice(&provided).is_ok())
            .unwrap_or(false)
    });
    if !valid {
        return Err(SignatureError::Invalid);
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("Missing X-Match-Signature header")]
    Missing,

    #[error("Invalid request payload")]
    InvalidPayload,

    #[error("Invalid signature")]
    Invalid,

    #[error("Signature timestamp outside tolerance")]
    Expired,
}

impl IntoResponse for SignatureError {
    fn into_response(self) -> Response {
        let status = match &self {
            SignatureError::Missing => StatusCode::UNAUTHORIZED,
            SignatureError::InvalidPayload => StatusCode::BAD_REQUEST,
            SignatureError::Invalid => StatusCode::UNAUTHORIZED,
            SignatureError::Expired => StatusCode::UNAUTHORIZED,
        };

        (status, self.to_string()).into_response()
    }
}

/// Reject match RPCs that were not signed with the shared secret
pub async fn require_match_signature(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, SignatureError> {
    let header = request
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::to_owned)
        .ok_or(SignatureError::Missing)?;

    let Query(query) = Query::<MatchRpcQuery>::try_from_uri(request.uri())
        .map_err(|_| SignatureError::InvalidPayload)?;

    let (parts, body) = request.into_parts();
    let bytes = to_bytes(body, MAX_RPC_BODY)
        .await
        .map_err(|_| SignatureError::InvalidPayload)?;

    let now = chrono::Utc::now().timestamp();
    if let Err(e) = verify_match_rpc(
        &header,
        &state.config.match_rpc_secret,
        &query.room_id.to_string(),
        query.cmd.as_str(),
        &bytes,
        now,
    ) {
        warn!(room_id = %query.room_id, identity = %query.identity, error = %e, "Rejected match RPC");
        return Err(e);
    }

    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}
