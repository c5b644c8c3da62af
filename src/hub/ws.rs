//! WebSocket endpoint for hub consumers
//!
//! Every path on the consumer port upgrades to a WebSocket. The socket task
//! forwards the consumer's [`Outbound`] queue to the wire and feeds pongs back
//! into the hub's liveness tracking.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, trace};

use super::{Outbound, SharedHub};

/// Router serving the consumer WebSocket on any path
pub fn router(hub: SharedHub) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/{*path}", get(ws_handler))
        .with_state(hub)
}

/// GET (upgrade) - register a new consumer
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(hub): State<SharedHub>,
) -> Response {
    // The client's handshake key is unique enough to tell consumers apart in logs
    let token = headers
        .get("sec-websocket-key")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    ws.on_upgrade(move |socket| serve_consumer(socket, hub, token))
}

async fn serve_consumer(socket: WebSocket, hub: SharedHub, token: Option<String>) {
    let registration = hub.register(token);
    let id = registration.id;
    let token = registration.token;
    let mut queue = registration.rx;

    let (mut sink, mut stream) = socket.split();

    let writer = async {
        while let Some(frame) = queue.recv().await {
            let message = match frame {
                Outbound::Text(payload) => Message::Text(payload.to_string().into()),
                Outbound::Ping => {
                    trace!("pinging client: {}", token);
                    Message::Ping(Default::default())
                }
                Outbound::Close => {
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        trace!("close frame to {} failed: {}", token, e);
                    }
                    break;
                }
            };

            if let Err(e) = sink.send(message).await {
                debug!("write to client {} failed: {}", token, e);
                break;
            }
        }

        if let Err(e) = sink.close().await {
            trace!("closing socket for {} failed: {}", token, e);
        }
    };

    let reader = async {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                Message::Pong(_) => {
                    hub.acknowledge(id);
                }
                Message::Text(text) => trace!("< {} {}", token, text.as_str()),
                Message::Close(_) => break,
                _ => {}
            }
        }
    };

    // Either side finishing ends the connection
    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }

    hub.remove(id);
}
