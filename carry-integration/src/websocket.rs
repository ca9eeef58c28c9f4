use crate::error::SocketError;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, connect_async_with_config,
    tungstenite::{client::IntoClientRequest, protocol::WebSocketConfig},
};
use tracing::debug;

/// A venue public-stream socket, TLS or plain.
pub type WebSocket = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Frame type exchanged with a venue.
pub type WsMessage = tokio_tungstenite::tungstenite::Message;

/// Transport-level failure on a venue socket.
pub type WsError = tokio_tungstenite::tungstenite::Error;

/// Maximum inbound frame and message size accepted on a venue public stream.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Default duration after which an in-flight connection attempt is abandoned.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Establish a venue socket with the [`MAX_FRAME_BYTES`] cap applied, abandoning the attempt
/// once `timeout` elapses.
///
/// Venue depth snapshots can run to megabytes, but anything past the cap indicates a broken
/// peer rather than data, so both the message and frame limits are pinned.
pub async fn connect<R>(request: R, timeout: Duration) -> Result<WebSocket, SocketError>
where
    R: IntoClientRequest + Unpin + std::fmt::Debug,
{
    debug!(?request, "attempting to establish WebSocket connection");

    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_FRAME_BYTES);
    config.max_frame_size = Some(MAX_FRAME_BYTES);

    match tokio::time::timeout(timeout, connect_async_with_config(request, Some(config), false))
        .await
    {
        Ok(Ok((websocket, _response))) => Ok(websocket),
        Ok(Err(error)) => Err(SocketError::WebSocket(Box::new(error))),
        Err(_elapsed) => Err(SocketError::ConnectTimeout(timeout.as_millis() as u64)),
    }
}
