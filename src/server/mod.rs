use crate::config::ServerConfig;
use crate::context::IntegrationContext;
use crate::handler;
use crate::session::Connection;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{future, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

#[derive(Clone)]
struct ServerState {
    context: Arc<IntegrationContext>,
}

pub fn bind_address(config: &ServerConfig) -> Result<SocketAddr, Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.host, config.port).parse()?;
    Ok(addr)
}

pub async fn start(
    config: ServerConfig,
    context: Arc<IntegrationContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = bind_address(&config)?;
    let state = Arc::new(ServerState { context });

    let app = Router::new()
        .route("/health", get(health_check))
        .route(&config.path, get(ws_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, path = %config.path, "integration server listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown_rx.changed().await;
    })
    .await?;

    Ok(())
}

async fn health_check() -> impl IntoResponse {
    "ok"
}

async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let context = Arc::clone(&state.context);
    ws.on_upgrade(move |socket| handle_socket(socket, context, addr.to_string()))
}

async fn handle_socket(socket: WebSocket, context: Arc<IntegrationContext>, ws_id: String) {
    let (mut sender, receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let conn = Connection::new(ws_id, context, outbound_tx);

    let aborted = conn.abort_token().clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = aborted.cancelled() => break,
                next = outbound_rx.recv() => match next {
                    Some(text) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = sender.close().await;
    });

    let frames = Box::pin(
        receiver
            .take_while(|msg| future::ready(matches!(msg, Ok(m) if !matches!(m, Message::Close(_)))))
            .filter_map(|msg| future::ready(msg.ok().and_then(frame_text))),
    );
    handler::run_connection(Arc::clone(&conn), frames).await;

    if let Err(err) = writer.await {
        tracing::warn!(ws_id = %conn.id(), error = %err, "socket writer failed");
    }
}

/// Text payload of a data frame. Control frames carry none.
fn frame_text(msg: Message) -> Option<String> {
    match msg {
        Message::Text(text) => Some(text),
        Message::Binary(bytes) => String::from_utf8(bytes).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frames_yield_text() {
        assert_eq!(frame_text(Message::Text("{}".to_string())), Some("{}".to_string()));
        assert_eq!(
            frame_text(Message::Binary(br#"{"msg":"connect"}"#.to_vec())),
            Some(r#"{"msg":"connect"}"#.to_string())
        );
        assert_eq!(frame_text(Message::Binary(vec![0xff, 0xfe])), None);
        assert_eq!(frame_text(Message::Ping(vec![1])), None);
    }

    #[test]
    fn bind_address_from_config() {
        let addr = bind_address(&ServerConfig::default()).unwrap();
        assert_eq!(addr.port(), 9001);
        assert!(addr.ip().is_unspecified());

        let bad = ServerConfig {
            host: "not a host".to_string(),
            ..ServerConfig::default()
        };
        assert!(bind_address(&bad).is_err());
    }
}
