//! Async driver for the synchronous [`SyncEngine`]
//!
//! A single task owns the engine and waits on three things at once: transport
//! events, user intents, and the engine's next timer deadline. After every
//! step the resulting [`EngineView`] is published through a watch channel.

use crate::http::{BridgeHttpClient, HttpFallback};
use crate::websocket::WebSocketConnector;
use anyhow::{anyhow, Result};
use preamp_core::{ms, ClientConfig, TransportEvent};
use preamp_sync::{EngineView, SyncEngine, UserIntent};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub struct SyncRuntime {
    engine: SyncEngine,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl SyncRuntime {
    /// `events` must be the receiving end of the sender given to the
    /// engine's transports
    pub fn new(engine: SyncEngine, events: mpsc::UnboundedReceiver<TransportEvent>) -> Self {
        Self { engine, events }
    }

    /// Wire the WebSocket and HTTP transports for `config` into a new engine
    pub fn connect(config: &ClientConfig) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connector = WebSocketConnector::new(
            config.ws_url(),
            ms(config.sync.connect_timeout_ms),
            events_tx.clone(),
        );
        let http = BridgeHttpClient::new(config.http_base_url(), config.http_timeout())?;
        let fallback = HttpFallback::new(http, events_tx, &config.sync);
        let engine = SyncEngine::new(config.sync.clone(), Box::new(connector), Box::new(fallback));
        Ok(Self::new(engine, events_rx))
    }

    /// Start the engine on a background task
    pub fn spawn(self) -> SyncHandle {
        let (intents_tx, intents_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(self.engine.view());
        let task = tokio::spawn(self.run(intents_rx, view_tx));
        SyncHandle {
            intents: intents_tx,
            view: view_rx,
            task,
        }
    }

    async fn run(
        self,
        mut intents: mpsc::UnboundedReceiver<UserIntent>,
        view: watch::Sender<EngineView>,
    ) {
        let SyncRuntime {
            mut engine,
            mut events,
        } = self;

        engine.start(Instant::now());
        publish(&view, engine.view());

        loop {
            let deadline = engine.next_deadline();
            tokio::select! {
                Some(event) = events.recv() => {
                    engine.handle_event(event, Instant::now());
                }
                intent = intents.recv() => match intent {
                    Some(intent) => {
                        if let Err(e) = engine.apply_intent(intent, Instant::now()) {
                            tracing::debug!("Intent rejected: {}", e);
                        }
                    }
                    None => break,
                },
                _ = sleep_until(deadline) => {
                    engine.fire_due_timers(Instant::now());
                }
            }
            publish(&view, engine.view());
        }

        engine.shutdown();
        publish(&view, engine.view());
        tracing::info!("Sync runtime stopped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

fn publish(view: &watch::Sender<EngineView>, next: EngineView) {
    view.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
}

/// Front-end side of a running engine
pub struct SyncHandle {
    intents: mpsc::UnboundedSender<UserIntent>,
    view: watch::Receiver<EngineView>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub fn send(&self, intent: UserIntent) -> Result<()> {
        self.intents
            .send(intent)
            .map_err(|_| anyhow!("sync runtime has stopped"))
    }

    /// Latest published view
    pub fn view(&self) -> EngineView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineView> {
        self.view.clone()
    }

    /// Stop the engine, closing the channel, and wait for the task to finish
    pub async fn shutdown(self) -> Result<()> {
        let SyncHandle { intents, task, .. } = self;
        drop(intents);
        task.await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use preamp_core::{
        ChannelFactory, ChannelId, ControlChannel, FallbackClient, SyncConfig, TransportError,
    };
    use preamp_sync::{ConnectionState, Control};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::timeout;

    /// Channel that opens immediately and echoes every `SET VOL` back as state
    struct LoopbackChannel {
        id: ChannelId,
        events: mpsc::UnboundedSender<TransportEvent>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl ControlChannel for LoopbackChannel {
        fn id(&self) -> ChannelId {
            self.id
        }

        fn send(&mut self, line: &str) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(line.to_string());
            if let Some(value) = line.strip_prefix("SET VOL ") {
                let _ = self
                    .events
                    .send(TransportEvent::Line(self.id, format!("STATE VOL={}", value)));
            }
            Ok(())
        }

        fn close(&mut self) {
            let _ = self.events.send(TransportEvent::Closed {
                channel: self.id,
                code: None,
            });
        }
    }

    struct LoopbackFactory {
        events: mpsc::UnboundedSender<TransportEvent>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl ChannelFactory for LoopbackFactory {
        fn open(&mut self, id: ChannelId) -> Box<dyn ControlChannel> {
            let _ = self.events.send(TransportEvent::Opened(id));
            Box::new(LoopbackChannel {
                id,
                events: self.events.clone(),
                sent: self.sent.clone(),
            })
        }
    }

    struct NoFallback;

    impl FallbackClient for NoFallback {
        fn post_command(&mut self, _line: String) {}

        fn fetch_snapshot(&mut self, _include_meta: bool) {}
    }

    #[tokio::test]
    async fn test_intents_flow_through_engine() {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let factory = LoopbackFactory {
            events: events_tx,
            sent: sent.clone(),
        };
        let engine = SyncEngine::new(SyncConfig::default(), Box::new(factory), Box::new(NoFallback));
        let handle = SyncRuntime::new(engine, events_rx).spawn();

        let mut view = handle.subscribe();
        timeout(
            Duration::from_secs(5),
            view.wait_for(|v| v.connection == ConnectionState::Connected),
        )
        .await
        .unwrap()
        .unwrap();

        handle.send(UserIntent::SetControl(Control::Volume, 42)).unwrap();
        let was_sent = |line: &str| sent.lock().unwrap().iter().any(|l| l == line);
        timeout(Duration::from_secs(5), async {
            while !was_sent("SET VOL 42") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(was_sent("GET STATE"));
        assert_eq!(handle.view().volume, Some(42));

        handle.shutdown().await.unwrap();
    }
}
