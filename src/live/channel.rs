//! # Remote Live Channel
//!
//! The bidirectional link to the inference endpoint, modelled as an owned resource with
//! explicit `send` / `recv` / `close` instead of an opaque handle.
//!
//! ## Seams:
//! - **LiveConnector**: opens a channel and resolves only once the remote acknowledged the setup
//! - **LiveChannel**: one open session; `send` never waits, `recv` is cancel-safe
//!
//! ## WebSocket implementation:
//! The socket is split into a writer task and a reader task. `send` serializes the frame
//! and pushes it onto an unbounded queue that the writer drains in order, so sends are
//! initiated in capture order and the session loop never blocks on the network. There
//! is no flow control: if the remote cannot keep up, frames pile up in that queue.

use crate::audio::capture::EncodedFrame;
use crate::error::{AppError, AppResult};
use crate::live::protocol::{parse_server_payload, ClientMessage, ServerEvent, SessionSetup};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

/// How long `close` waits for the writer to flush the close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// One open session with the remote endpoint.
pub trait LiveChannel: Send {
    /// Queue a frame for transmission without waiting for it to go out.
    fn send(&mut self, frame: EncodedFrame) -> AppResult<()>;

    /// Next event from the remote.
    ///
    /// - `Some(Ok(event))`: an event
    /// - `Some(Err(ChannelFault))`: the channel failed; no further events follow
    /// - `None`: the remote closed the channel
    fn recv(&mut self) -> BoxFuture<'_, Option<AppResult<ServerEvent>>>;

    /// Close the channel. Safe to call more than once.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Opens channels.
pub trait LiveConnector: Send + Sync {
    /// Resolves after the remote acknowledged the setup, or fails with `ChannelOpenFailed`.
    fn connect<'a>(&'a self, setup: &'a SessionSetup) -> BoxFuture<'a, AppResult<Box<dyn LiveChannel>>>;
}

/// Connector for the WebSocket live endpoint.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl LiveConnector for WebSocketConnector {
    fn connect<'a>(&'a self, setup: &'a SessionSetup) -> BoxFuture<'a, AppResult<Box<dyn LiveChannel>>> {
        Box::pin(async move {
            let channel = WebSocketChannel::open(setup).await?;
            Ok(Box::new(channel) as Box<dyn LiveChannel>)
        })
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the reader and writer tasks report back to the channel.
#[derive(Debug)]
enum Inbound {
    Event(ServerEvent),
    Fault(AppError),
    Closed,
}

/// A live session over a WebSocket.
pub struct WebSocketChannel {
    outbound: mpsc::UnboundedSender<Message>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    /// No more events will be delivered
    finished: bool,
    /// `close` was called
    closed: bool,
}

impl WebSocketChannel {
    /// Connect, send the setup and wait for `setupComplete`.
    ///
    /// The whole handshake shares one `connect_timeout_ms` budget.
    pub async fn open(setup: &SessionSetup) -> AppResult<Self> {
        let deadline = Instant::now() + Duration::from_millis(setup.connect_timeout_ms);

        let (mut socket, response) = tokio::time::timeout_at(deadline.into(), connect_async(setup.url.as_str()))
            .await
            .map_err(|_| AppError::ChannelOpenFailed("timed out connecting to live endpoint".to_string()))?
            .map_err(|e| AppError::ChannelOpenFailed(e.to_string()))?;

        debug!(status = %response.status(), "live endpoint accepted WebSocket upgrade");

        let setup_json = serde_json::to_string(&setup.to_message())
            .map_err(|e| AppError::Internal(format!("failed to serialize setup: {}", e)))?;
        socket
            .send(Message::Text(setup_json))
            .await
            .map_err(|e| AppError::ChannelOpenFailed(e.to_string()))?;

        tokio::time::timeout_at(deadline.into(), wait_for_setup_complete(&mut socket))
            .await
            .map_err(|_| AppError::ChannelOpenFailed("timed out waiting for setup acknowledgement".to_string()))??;

        info!(model = %setup.qualified_model(), voice = %setup.voice_name, "live channel acknowledged");
        Ok(Self::spawn(socket))
    }

    /// Split the socket into writer and reader tasks.
    fn spawn(socket: Socket) -> Self {
        let (mut sink, mut stream) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();

        let fault_tx = inbound_tx.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = sink.send(message).await {
                    if !closing {
                        warn!(error = %err, "live channel send failed");
                        let _ = fault_tx.send(Inbound::Fault(err.into()));
                    }
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let payload = match message {
                    Ok(Message::Text(text)) => text.into_bytes(),
                    Ok(Message::Binary(bytes)) => bytes,
                    Ok(Message::Close(frame)) => {
                        info!(reason = ?frame, "live endpoint closed the channel");
                        break;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        let _ = inbound_tx.send(Inbound::Fault(err.into()));
                        return;
                    }
                };

                match parse_server_payload(&payload) {
                    Ok(events) => {
                        for event in events {
                            trace!(?event, "live event");
                            if inbound_tx.send(Inbound::Event(event)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        let _ = inbound_tx.send(Inbound::Fault(AppError::ChannelFault(format!(
                            "unparsable server message: {}",
                            err
                        ))));
                        return;
                    }
                }
            }
            let _ = inbound_tx.send(Inbound::Closed);
        });

        Self {
            outbound: outbound_tx,
            inbound: inbound_rx,
            writer: Some(writer),
            reader: Some(reader),
            finished: false,
            closed: false,
        }
    }
}

/// Read until the remote acknowledges the setup.
async fn wait_for_setup_complete(socket: &mut Socket) -> AppResult<()> {
    while let Some(message) = socket.next().await {
        let payload = match message.map_err(|e| AppError::ChannelOpenFailed(e.to_string()))? {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(frame) => {
                let reason = frame
                    .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                    .unwrap_or_else(|| "no reason given".to_string());
                return Err(AppError::ChannelOpenFailed(format!("remote closed during setup: {}", reason)));
            }
            _ => continue,
        };

        let events = parse_server_payload(&payload)
            .map_err(|e| AppError::ChannelOpenFailed(format!("unexpected setup reply: {}", e)))?;
        if events.contains(&ServerEvent::SetupComplete) {
            return Ok(());
        }
    }
    Err(AppError::ChannelOpenFailed("connection ended before setup completed".to_string()))
}

impl LiveChannel for WebSocketChannel {
    fn send(&mut self, frame: EncodedFrame) -> AppResult<()> {
        if self.closed || self.finished {
            return Err(AppError::ChannelFault("channel is closed".to_string()));
        }
        let json = serde_json::to_string(&ClientMessage::audio(frame))
            .map_err(|e| AppError::Internal(format!("failed to serialize frame: {}", e)))?;
        self.outbound
            .send(Message::Text(json))
            .map_err(|_| AppError::ChannelFault("writer task stopped".to_string()))
    }

    fn recv(&mut self) -> BoxFuture<'_, Option<AppResult<ServerEvent>>> {
        Box::pin(async move {
            if self.finished {
                return None;
            }
            match self.inbound.recv().await {
                Some(Inbound::Event(event)) => Some(Ok(event)),
                Some(Inbound::Fault(err)) => {
                    self.finished = true;
                    Some(Err(err))
                }
                Some(Inbound::Closed) | None => {
                    self.finished = true;
                    None
                }
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.closed {
                return;
            }
            self.closed = true;
            self.finished = true;

            let _ = self.outbound.send(Message::Close(None));
            if let Some(mut writer) = self.writer.take() {
                if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
                    writer.abort();
                }
            }
            if let Some(reader) = self.reader.take() {
                reader.abort();
            }
            debug!("live channel closed");
        })
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use tokio::net::TcpListener;

    fn setup_for(url: String) -> SessionSetup {
        let mut setup = SessionSetup::from_config(&AppConfig::default());
        setup.url = url;
        setup.connect_timeout_ms = 2_000;
        setup
    }

    /// A tiny stand-in for the live endpoint: acknowledges the setup, streams one audio
    /// chunk plus an interruption, echoes the first realtime input back as text, then closes.
    async fn spawn_fake_endpoint() -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

            let setup = ws.next().await.unwrap().unwrap();
            assert!(setup.into_text().unwrap().contains("\"setup\""));
            ws.send(Message::Binary(br#"{"setupComplete":{}}"#.to_vec())).await.unwrap();

            let content = r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAAA"}}]},"interrupted":true}}"#;
            ws.send(Message::Text(content.to_string())).await.unwrap();

            let input = ws.next().await.unwrap().unwrap().into_text().unwrap();
            ws.close(None).await.unwrap();
            input
        });

        (format!("ws://{}", addr), server)
    }

    #[tokio::test]
    async fn test_websocket_channel_round_trip() {
        let (url, server) = spawn_fake_endpoint().await;
        let mut channel = WebSocketConnector.connect(&setup_for(url)).await.unwrap();

        assert_eq!(channel.recv().await.unwrap().unwrap(), ServerEvent::Audio("AAAA".to_string()));
        assert_eq!(channel.recv().await.unwrap().unwrap(), ServerEvent::Interrupted);

        channel
            .send(EncodedFrame {
                data: "AAAA".to_string(),
                mime_type: "audio/pcm;rate=16000".to_string(),
            })
            .unwrap();

        let received = server.await.unwrap();
        assert_eq!(
            received,
            r#"{"realtimeInput":{"mediaChunks":[{"data":"AAAA","mimeType":"audio/pcm;rate=16000"}]}}"#
        );

        // Remote closed: the channel reports the end, then stays finished
        assert!(channel.recv().await.is_none());
        assert!(channel.recv().await.is_none());
        channel.close().await;
        channel.close().await;
    }

    #[tokio::test]
    async fn test_open_fails_when_remote_closes_during_setup() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _ = ws.next().await;
            let _ = ws.close(None).await;
        });

        let result = WebSocketChannel::open(&setup_for(format!("ws://{}", addr))).await;
        assert!(matches!(result, Err(AppError::ChannelOpenFailed(_))));
    }

    #[tokio::test]
    async fn test_open_fails_when_nothing_listens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = WebSocketChannel::open(&setup_for(format!("ws://{}", addr))).await;
        assert!(matches!(result, Err(AppError::ChannelOpenFailed(_))));
    }
}
