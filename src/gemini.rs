//! Gemini Live transport
//!
//! WebSocket connection to the Gemini Live API. The socket is split into a
//! sink owned by [`GeminiTransport`] and a stream drained by a background
//! task that decodes each frame and forwards it as [`TransportEvent`]s.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use crate::protocol::{decode_frame, ClientMessage, Inbound, Outbound, Setup};
use crate::transport::{
    Connector, EventSink, SessionParams, Transport, TransportEvent, ABNORMAL_CLOSURE,
};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Opens Gemini Live sessions.
#[derive(Clone)]
pub struct GeminiConnector {
    endpoint: String,
    api_key: String,
}

impl GeminiConnector {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    pub fn from_api_key(api_key: &str) -> Self {
        Self::new(DEFAULT_ENDPOINT, api_key)
    }

    fn url(&self) -> String {
        format!("{}?key={}", self.endpoint, self.api_key)
    }
}

#[async_trait]
impl Connector for GeminiConnector {
    async fn connect(
        &self,
        params: &SessionParams,
        events: EventSink,
    ) -> Result<Box<dyn Transport>, TransportError> {
        info!("Connecting to Gemini Live at {}", self.endpoint);

        let (ws_stream, resp) = connect_async(self.url()).await?;
        debug!("WebSocket handshake status: {}", resp.status());

        let (mut sink, stream) = ws_stream.split();

        let setup = ClientMessage::Setup(Setup::new(
            &params.model,
            &params.system_instruction,
            params.voice.as_deref(),
        ));
        let json = serde_json::to_string(&setup)?;
        debug!("Sending setup: {}", json);
        sink.send(Message::text(json)).await?;

        let reader = tokio::spawn(read_loop(stream, events));

        Ok(Box::new(GeminiTransport {
            sink,
            reader,
            closed: false,
        }))
    }
}

pub struct GeminiTransport {
    sink: WsSink,
    reader: JoinHandle<()>,
    closed: bool,
}

#[async_trait]
impl Transport for GeminiTransport {
    async fn send(&mut self, message: Outbound) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ChannelClosed);
        }
        let json = serde_json::to_string(&message.to_client_message())?;
        match &message {
            Outbound::Text(text) => debug!("Sending text: {}", text),
            other => debug!("Sending {} ({} bytes)", other.kind(), json.len()),
        }
        self.sink.send(Message::text(json)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        info!("Closing Gemini session");
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: String::from("session ended").into(),
        };
        self.sink.send(Message::Close(Some(frame))).await?;
        self.sink.close().await?;
        Ok(())
    }
}

impl Drop for GeminiTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(mut stream: WsStream, events: EventSink) {
    debug!("Inbound task started for session {}", events.generation());

    while let Some(message) = stream.next().await {
        let delivered = match message {
            Ok(Message::Text(text)) => forward_frame(text.as_str(), &events),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => forward_frame(text, &events),
                Err(_) => {
                    debug!("Ignoring non-UTF-8 binary frame ({} bytes)", bytes.len());
                    true
                }
            },
            Ok(Message::Close(frame)) => {
                let (code, reason) = match frame {
                    Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_string()),
                    None => (ABNORMAL_CLOSURE, String::new()),
                };
                info!("WebSocket closed ({}): {}", code, reason);
                events.emit(TransportEvent::Closed { code, reason });
                return;
            }
            Ok(_) => true,
            Err(e) => {
                error!("WebSocket error: {}", e);
                events.emit(TransportEvent::Error(e.to_string()));
                return;
            }
        };
        if !delivered {
            debug!("Session dropped its event channel, stopping inbound task");
            return;
        }
    }

    warn!("WebSocket stream ended without a close frame");
    events.emit(TransportEvent::Closed {
        code: ABNORMAL_CLOSURE,
        reason: "connection lost".to_string(),
    });
}

fn forward_frame(text: &str, events: &EventSink) -> bool {
    let decoded = match decode_frame(text) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!("Dropping undecodable frame: {}", e);
            return true;
        }
    };
    for inbound in decoded {
        let event = match inbound {
            Inbound::SetupComplete => {
                info!("Gemini session setup complete");
                TransportEvent::Open
            }
            other => TransportEvent::Message(other),
        };
        if !events.emit(event) {
            return false;
        }
    }
    true
}
