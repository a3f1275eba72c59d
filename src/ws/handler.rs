//! WebSocket upgrade handlers and the socket <-> transport adapter

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::error::Error;
use crate::transport::{Connection, Request, Service, Transport, TransportError};
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::ws::protocol::{decode, ClientFrame, ClientId, RemoteResult, RoomId};

/// How long a fresh socket may take to send its `Register` frame
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Query parameters for the match WebSocket
#[derive(Debug, Deserialize)]
pub struct MatchWsQuery {
    #[serde(rename = "roomId")]
    pub room_id: RoomId,
}

/// `/lobby` upgrade handler
pub async fn lobby_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let Some(lobby) = state.lobby.clone() else {
        return (StatusCode::NOT_FOUND, "No lobby on this server").into_response();
    };
    let rate_limit = state.config.client_rate_limit;
    ws.on_upgrade(move |socket| handle_socket(socket, lobby.transport, rate_limit))
}

/// `/match?roomId=` upgrade handler
pub async fn match_ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<MatchWsQuery>,
    State(state): State<AppState>,
) -> Response {
    let Some(host) = state.match_host.clone() else {
        return (StatusCode::NOT_FOUND, "No matches on this server").into_response();
    };
    let Some(handle) = host.registry().get(&query.room_id) else {
        warn!(room_id = %query.room_id, "WebSocket upgrade for unknown match");
        return (StatusCode::NOT_FOUND, "Unknown match").into_response();
    };
    info!(room_id = %query.room_id, "WebSocket upgrade for match");
    let rate_limit = state.config.client_rate_limit;
    ws.on_upgrade(move |socket| handle_socket(socket, handle.transport, rate_limit))
}

/// Outbound half of a socket as seen by the transport's sender thread
pub struct WsConnection {
    tx: mpsc::UnboundedSender<Message>,
    closed: AtomicBool,
}

impl WsConnection {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            tx,
            closed: AtomicBool::new(false),
        }
    }
}

impl Connection for WsConnection {
    fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(Message::Binary(frame.to_vec()))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(Message::Close(None));
        }
    }
}

/// Handle the upgraded WebSocket connection
async fn handle_socket<S: Service>(
    socket: WebSocket,
    transport: Arc<Transport<S>>,
    rate_limit: u32,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let client_id = match tokio::time::timeout(REGISTER_TIMEOUT, await_register(&mut ws_stream)).await
    {
        Ok(Some(client_id)) => client_id,
        Ok(None) => {
            debug!(transport = %transport.name(), "Socket closed before registering");
            return;
        }
        Err(_) => {
            warn!(transport = %transport.name(), "Socket did not register in time");
            let _ = ws_sink.send(Message::Close(None)).await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let connection = Arc::new(WsConnection::new(tx));
    if let Err(e) = transport.register_connection(client_id, connection.clone()) {
        warn!(transport = %transport.name(), client_id = %client_id, error = %e, "Rejected connection");
        let _ = ws_sink.send(Message::Close(None)).await;
        return;
    }
    info!(transport = %transport.name(), client_id = %client_id, "New WebSocket connection");

    // Writer task: transport sender thread -> WebSocket
    let writer_handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = ws_sink.send(msg).await {
                debug!(client_id = %client_id, error = %e, "WebSocket send failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    // Reader loop: WebSocket -> transport
    let rate_limiter = ConnectionRateLimiter::new(rate_limit);
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Binary(data)) => {
                if !rate_limiter.check_frame() {
                    warn!(client_id = %client_id, "Rate limited inbound frame");
                    continue;
                }
                match decode::<ClientFrame>(&data) {
                    Ok(frame) => route_frame(&transport, client_id, frame),
                    Err(e) => warn!(client_id = %client_id, error = %e, "Failed to decode frame"),
                }
            }
            Ok(Message::Text(_)) => {
                debug!(client_id = %client_id, "Ignoring text frame");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                debug!(client_id = %client_id, "Client closed connection");
                break;
            }
            Err(e) => {
                debug!(client_id = %client_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    transport.unregister_connection(client_id);
    connection.close();
    writer_handle.abort();
    info!(transport = %transport.name(), client_id = %client_id, "WebSocket connection closed");
}

/// Wait for the `Register` frame every connection must open with
async fn await_register(
    ws_stream: &mut futures::stream::SplitStream<WebSocket>,
) -> Option<ClientId> {
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Binary(data)) => match decode::<ClientFrame>(&data) {
                Ok(ClientFrame::Register { client_id }) => return Some(client_id),
                Ok(_) => warn!("Frame before registration dropped"),
                Err(e) => warn!(error = %e, "Failed to decode frame"),
            },
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

/// Hand one decoded frame to the transport. Requests must carry the id of
/// the connection they arrived on.
pub fn route_frame<S: Service>(transport: &Transport<S>, client_id: ClientId, frame: ClientFrame) {
    match frame {
        ClientFrame::Register { .. } => {
            warn!(client_id = %client_id, "Duplicate register frame ignored");
        }
        ClientFrame::Request { id, call } => {
            let request = Request {
                client_id,
                id,
                call,
            };
            if request.call.client_id != client_id {
                warn!(
                    client_id = %client_id,
                    claimed = %request.call.client_id,
                    "Request for another client rejected"
                );
                transport
                    .outbox()
                    .respond(request.reply_to(), RemoteResult::error(&Error::NotAuthorized));
                return;
            }
            transport.on_incoming_request(request);
        }
        ClientFrame::Message(event) => transport.on_incoming_message(client_id, event),
    }
}
