//! Persistent WebSocket control channel to the bridge
//!
//! Each opened channel runs in its own task that owns the socket. Outbound
//! lines reach it through an unbounded queue; everything the socket reports
//! goes back to the engine as [`TransportEvent`]s tagged with the channel id.
//! Every task ends with exactly one `Closed` event.

use futures_util::{SinkExt, StreamExt};
use preamp_core::{ChannelFactory, ChannelId, ControlChannel, TransportError, TransportEvent};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

enum Outbound {
    Line(String),
    Close,
}

/// Opens WebSocket channels against one bridge URL
pub struct WebSocketConnector {
    url: String,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl WebSocketConnector {
    pub fn new(
        url: impl Into<String>,
        connect_timeout: Duration,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
            events,
        }
    }
}

impl ChannelFactory for WebSocketConnector {
    fn open(&mut self, id: ChannelId) -> Box<dyn ControlChannel> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_channel(
            id,
            self.url.clone(),
            self.connect_timeout,
            outbound_rx,
            self.events.clone(),
        ));
        Box::new(WebSocketChannel {
            id,
            outbound: outbound_tx,
        })
    }
}

/// Handle to one channel task. Dropping it closes the socket.
pub struct WebSocketChannel {
    id: ChannelId,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl ControlChannel for WebSocketChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn send(&mut self, line: &str) -> Result<(), TransportError> {
        self.outbound
            .send(Outbound::Line(line.to_string()))
            .map_err(|_| TransportError::NotOpen(self.id))
    }

    fn close(&mut self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

async fn run_channel(
    id: ChannelId,
    url: String,
    connect_timeout: Duration,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    debug!("Connecting {} to {}", id, url);
    let connected = match timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("no handshake after {:?}", connect_timeout)),
    };
    let stream = match connected {
        Ok(stream) => stream,
        Err(reason) => {
            warn!("WebSocket connect to {} failed: {}", url, reason);
            let _ = events.send(TransportEvent::Error(id));
            let _ = events.send(TransportEvent::Closed {
                channel: id,
                code: None,
            });
            return;
        }
    };

    info!("WebSocket {} open", id);
    let _ = events.send(TransportEvent::Opened(id));
    let (mut write, mut read) = stream.split();

    let code = loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Line(line)) => {
                    if let Err(e) = write.send(Message::Text(line)).await {
                        warn!("WebSocket {} send failed: {}", id, e);
                        let _ = events.send(TransportEvent::Error(id));
                        break None;
                    }
                }
                Some(Outbound::Close) | None => {
                    debug!("Closing WebSocket {}", id);
                    let _ = write.send(Message::Close(None)).await;
                    break None;
                }
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    for line in text.lines().filter(|line| !line.trim().is_empty()) {
                        let _ = events.send(TransportEvent::Line(id, line.to_string()));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame.map(|frame| u16::from(frame.code));
                }
                // ping/pong are answered by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket {} error: {}", id, e);
                    let _ = events.send(TransportEvent::Error(id));
                    break None;
                }
                None => break None,
            },
        }
    };

    info!("WebSocket {} closed (code {:?})", id, code);
    let _ = events.send(TransportEvent::Closed { channel: id, code });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_lines_in_and_out_then_going_away() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::Text("STATE VOL=5\nSTATE BAL=1\n".to_string()))
                .await
                .unwrap();
            let received = loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => break text,
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected: {:?}", other),
                }
            };
            ws.close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: Cow::Borrowed("restart"),
            }))
            .await
            .unwrap();
            received
        });

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut connector = WebSocketConnector::new(
            format!("ws://{}/ws", addr),
            Duration::from_secs(5),
            events_tx,
        );
        let mut channel = connector.open(ChannelId(1));

        assert_eq!(next_event(&mut events_rx).await, TransportEvent::Opened(ChannelId(1)));
        assert_eq!(
            next_event(&mut events_rx).await,
            TransportEvent::Line(ChannelId(1), "STATE VOL=5".to_string())
        );
        assert_eq!(
            next_event(&mut events_rx).await,
            TransportEvent::Line(ChannelId(1), "STATE BAL=1".to_string())
        );

        channel.send("GET STATE").unwrap();
        assert_eq!(server.await.unwrap(), "GET STATE");
        assert_eq!(
            next_event(&mut events_rx).await,
            TransportEvent::Closed {
                channel: ChannelId(1),
                code: Some(1001)
            }
        );
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut connector = WebSocketConnector::new(
            format!("ws://{}/ws", addr),
            Duration::from_secs(5),
            events_tx,
        );
        let _channel = connector.open(ChannelId(7));

        assert_eq!(next_event(&mut events_rx).await, TransportEvent::Error(ChannelId(7)));
        assert_eq!(
            next_event(&mut events_rx).await,
            TransportEvent::Closed {
                channel: ChannelId(7),
                code: None
            }
        );
    }

    #[tokio::test]
    async fn test_stalled_handshake_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // accept the TCP connection but never answer the upgrade request
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(tcp);
        });

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut connector = WebSocketConnector::new(
            format!("ws://{}/ws", addr),
            Duration::from_millis(200),
            events_tx,
        );
        let _channel = connector.open(ChannelId(3));

        assert_eq!(next_event(&mut events_rx).await, TransportEvent::Error(ChannelId(3)));
        assert_eq!(
            next_event(&mut events_rx).await,
            TransportEvent::Closed {
                channel: ChannelId(3),
                code: None
            }
        );
        server.abort();
    }
}
