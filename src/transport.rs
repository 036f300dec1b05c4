//! WebSocket transport behind a small connector seam
//!
//! The live client never touches `tokio_tungstenite` directly. It asks a
//! [`Connector`] for a write half and a read half, which lets tests swap in
//! in-memory channels and drive reconnection timing deterministically.

use futures_util::future::BoxFuture;
use futures_util::sink::Sink;
use futures_util::stream::Stream;
use futures_util::{SinkExt, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

/// Write half of an open connection.
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

/// Read half of an open connection.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// Opens connections to the live endpoint.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<(FrameSink, FrameStream), WsError>>;
}

/// Production connector over `tokio_tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<(FrameSink, FrameStream), WsError>> {
        let url = url.to_string();
        Box::pin(async move {
            let (ws_stream, resp) = connect_async(url.as_str()).await?;
            debug!("WebSocket handshake response: {:?}", resp.status());

            let (sink, stream) = ws_stream.split();
            let sink: FrameSink = Box::pin(sink);
            let stream: FrameStream = Box::pin(stream);
            Ok((sink, stream))
        })
    }
}

/// Send `message` and flush it.
pub async fn write_frame(sink: &mut FrameSink, message: Message) -> Result<(), WsError> {
    sink.send(message).await
}
