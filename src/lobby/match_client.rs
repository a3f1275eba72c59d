//! Lobby-side client for the match server RPC endpoint
//!
//! Calls are fire-and-complete: the caller hands over a completion closure
//! that runs on a tokio worker once the reply (or failure) is in. The lobby
//! passes closures that post back onto its transport thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::error::{Error, RpcResult};
use crate::game::host::{CreateMatchRequest, MatchCommand, MatchRpcResponse};
use crate::http::middleware::{sign_match_rpc, SIGNATURE_HEADER};
use crate::util::time::SharedClock;
use crate::ws::protocol::RoomId;

pub type Completion<T> = Box<dyn FnOnce(RpcResult<T>) + Send>;

/// One match server conversation. At most one call is in flight per
/// instance; a second call while busy fails with `Busy`.
pub trait MatchServerClient: Send + Sync {
    fn create_match(
        &self,
        room_id: RoomId,
        request: CreateMatchRequest,
        done: Completion<()>,
    ) -> Result<(), MatchClientError>;

    fn is_alive(&self, room_id: RoomId, done: Completion<bool>) -> Result<(), MatchClientError>;

    fn destroy_match(&self, room_id: RoomId, done: Completion<()>)
        -> Result<(), MatchClientError>;

    fn is_busy(&self) -> bool;
}

/// Hands out one client per room
pub trait MatchClientFactory: Send + Sync {
    fn connect(&self, room_id: RoomId) -> Arc<dyn MatchServerClient>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchClientError {
    #[error("A match server call is already in flight")]
    Busy,

    #[error("Match server request timed out")]
    Timeout,

    #[error("Could not reach match server: {0}")]
    Connect(String),

    #[error("Match server closed the connection")]
    Closed,

    #[error("Match server answered HTTP {0}")]
    Http(u16),

    #[error("Malformed match server reply: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for MatchClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            MatchClientError::Timeout
        } else if e.is_decode() {
            MatchClientError::Decode(e.to_string())
        } else if e.is_body() {
            MatchClientError::Closed
        } else if let Some(status) = e.status() {
            MatchClientError::Http(status.as_u16())
        } else {
            MatchClientError::Connect(e.to_string())
        }
    }
}

impl From<MatchClientError> for Error {
    fn from(e: MatchClientError) -> Self {
        match e {
            MatchClientError::Busy => Error::NotAllowed("a match server call is already in flight"),
            MatchClientError::Timeout => Error::RequestTimeout,
            MatchClientError::Connect(message) => Error::ConnectionError(message),
            MatchClientError::Closed => Error::ConnectionClosed,
            MatchClientError::Http(status) => {
                Error::ConnectionError(format!("match server answered HTTP {}", status))
            }
            MatchClientError::Decode(message) => Error::Unhandled(message),
        }
    }
}

/// Where and how to reach the match server
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// RPC endpoint, e.g. `http://match:8081/match/rpc`
    pub base_url: String,
    /// Sent as `identity`
    pub server_id: String,
    pub secret: String,
    pub timeout: Duration,
}

pub struct HttpMatchClientFactory {
    http: reqwest::Client,
    config: Arc<HttpClientConfig>,
    runtime: Handle,
    clock: SharedClock,
}

impl HttpMatchClientFactory {
    pub fn new(
        config: HttpClientConfig,
        runtime: Handle,
        clock: SharedClock,
    ) -> Result<Self, MatchClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .build()
            .map_err(MatchClientError::from)?;
        Ok(Self {
            http,
            config: Arc::new(config),
            runtime,
            clock,
        })
    }
}

impl MatchClientFactory for HttpMatchClientFactory {
    fn connect(&self, _room_id: RoomId) -> Arc<dyn MatchServerClient> {
        Arc::new(HttpMatchServerClient {
            http: self.http.clone(),
            config: self.config.clone(),
            runtime: self.runtime.clone(),
            clock: self.clock.clone(),
            busy: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// Signed JSON-over-HTTP client; the injected clock times each call
pub struct HttpMatchServerClient {
    http: reqwest::Client,
    config: Arc<HttpClientConfig>,
    runtime: Handle,
    clock: SharedClock,
    busy: Arc<AtomicBool>,
}

impl HttpMatchServerClient {
    fn call<T, P>(
        &self,
        room_id: RoomId,
        cmd: MatchCommand,
        body: Vec<u8>,
        parse: P,
        done: Completion<T>,
    ) -> Result<(), MatchClientError>
    where
        T: Send + 'static,
        P: FnOnce(MatchRpcResponse) -> RpcResult<T> + Send + 'static,
    {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(MatchClientError::Busy);
        }

        let http = self.http.clone();
        let config = self.config.clone();
        let busy = self.busy.clone();
        let clock = self.clock.clone();
        let started = clock.now();

        self.runtime.spawn(async move {
            let reply = tokio::time::timeout(
                config.timeout,
                post_rpc(&http, &config, room_id, cmd, body),
            )
            .await
            .unwrap_or(Err(MatchClientError::Timeout));

            let result = reply.map_err(Error::from).and_then(parse);
            busy.store(false, Ordering::SeqCst);

            let elapsed_ms = clock.now().saturating_sub(started).as_millis() as u64;
            match &result {
                Ok(_) => debug!(room_id = %room_id, cmd = cmd.as_str(), elapsed_ms, "Match RPC done"),
                Err(e) => {
                    warn!(room_id = %room_id, cmd = cmd.as_str(), elapsed_ms, error = %e, "Match RPC failed")
                }
            }
            done(result);
        });
        Ok(())
    }
}

async fn post_rpc(
    http: &reqwest::Client,
    config: &HttpClientConfig,
    room_id: RoomId,
    cmd: MatchCommand,
    body: Vec<u8>,
) -> Result<MatchRpcResponse, MatchClientError> {
    let room = room_id.to_string();
    let timestamp = chrono::Utc::now().timestamp();
    let signature = sign_match_rpc(&config.secret, timestamp, &room, cmd.as_str(), &body)
        .map_err(|e| MatchClientError::Decode(e.to_string()))?;

    let response = http
        .post(&config.base_url)
        .query(&[
            ("roomId", room.as_str()),
            ("identity", config.server_id.as_str()),
            ("cmd", cmd.as_str()),
        ])
        .header(CONTENT_TYPE, "application/json")
        .header(SIGNATURE_HEADER, signature)
        .body(body)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(MatchClientError::Http(status.as_u16()));
    }
    Ok(response.json::<MatchRpcResponse>().await?)
}

impl MatchServerClient for HttpMatchServerClient {
    fn create_match(
        &self,
        room_id: RoomId,
        request: CreateMatchRequest,
        done: Completion<()>,
    ) -> Result<(), MatchClientError> {
        let body =
            serde_json::to_vec(&request).map_err(|e| MatchClientError::Decode(e.to_string()))?;
        self.call(
            room_id,
            MatchCommand::Create,
            body,
            |reply| reply.into_result().map(|_| ()),
            done,
        )
    }

    fn is_alive(&self, room_id: RoomId, done: Completion<bool>) -> Result<(), MatchClientError> {
        self.call(
            room_id,
            MatchCommand::IsAlive,
            Vec::new(),
            MatchRpcResponse::into_result,
            done,
        )
    }

    fn destroy_match(
        &self,
        room_id: RoomId,
        done: Completion<()>,
    ) -> Result<(), MatchClientError> {
        self.call(
            room_id,
            MatchCommand::Destroy,
            Vec::new(),
            |reply| reply.into_result().map(|_| ()),
            done,
        )
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_map_to_transport_statuses() {
        assert_eq!(Error::from(MatchClientError::Timeout), Error::RequestTimeout);
        assert_eq!(Error::from(MatchClientError::Closed), Error::ConnectionClosed);
        assert_eq!(
            Error::from(MatchClientError::Connect("refused".into())),
            Error::ConnectionError("refused".into())
        );
        assert!(matches!(
            Error::from(MatchClientError::Decode("eof".into())),
            Error::Unhandled(_)
        ));
    }

    #[test]
    fn unreachable_server_reports_connection_error_and_frees_the_client() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let factory = HttpMatchClientFactory::new(
            HttpClientConfig {
                // port 9 (discard) is closed on test hosts
                base_url: "http://127.0.0.1:9/match/rpc".into(),
                server_id: "lobby-test".into(),
                secret: "s".into(),
                timeout: Duration::from_secs(2),
            },
            runtime.handle().clone(),
            crate::util::time::SystemClock::shared(),
        )
        .unwrap();
        let client = factory.connect(RoomId::new());

        let (tx, rx) = std::sync::mpsc::channel();
        client
            .is_alive(RoomId::new(), Box::new(move |r| tx.send(r).unwrap()))
            .unwrap();

        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            result,
            Err(Error::ConnectionError(_)) | Err(Error::RequestTimeout)
        ));
        assert!(!client.is_busy());
    }
}
