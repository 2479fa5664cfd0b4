//! WebSocket transport on top of tokio-tungstenite

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::frame::validate_endpoint;
use super::transport::{InboundMessage, UplinkConnector, UplinkSocket};
use super::UplinkError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn transport_error(e: tokio_tungstenite::tungstenite::Error) -> UplinkError {
    UplinkError::TransportError(e.to_string())
}

/// Opens `ws://` and `wss://` connections.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

#[async_trait]
impl UplinkConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn UplinkSocket>, UplinkError> {
        validate_endpoint(url)?;
        let (stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(transport_error)?;
        log::debug!("WebSocket handshake with {} ({})", url, response.status());

        let (sink, stream) = stream.split();
        Ok(Box::new(WebSocketSocket {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }))
    }
}

/// An open WebSocket. Reads and writes are locked independently so the
/// receive loop never blocks a send.
pub struct WebSocketSocket {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
}

#[async_trait]
impl UplinkSocket for WebSocketSocket {
    async fn send_text(&self, text: String) -> Result<(), UplinkError> {
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(transport_error)
    }

    async fn recv(&self) -> Result<InboundMessage, UplinkError> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(InboundMessage::Text(text)),
                Some(Ok(Message::Binary(data))) => return Ok(InboundMessage::Binary(data)),
                Some(Ok(Message::Close(frame))) => {
                    log::debug!("Server closed the WebSocket: {:?}", frame);
                    return Ok(InboundMessage::Close);
                }
                // Ping replies are queued by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(transport_error(e)),
                None => return Ok(InboundMessage::Close),
            }
        }
    }

    async fn close(&self) -> Result<(), UplinkError> {
        self.sink.lock().await.close().await.map_err(transport_error)
    }
}
