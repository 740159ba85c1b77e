//! HTTP fallback transport
//!
//! Used while no WebSocket is open: single commands are posted to
//! `/api/cmd`, and state is polled from the plain-text read endpoints.

use anyhow::{Context, Result};
use async_trait::async_trait;
use preamp_core::{FallbackClient, PolledSnapshot, SyncConfig, TransportError, TransportEvent};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Read endpoints of the bridge
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    State,
    Labels,
    AmpStates,
    Tubes,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::State => "/api/state",
            Endpoint::Labels => "/api/labels",
            Endpoint::AmpStates => "/api/amp_states",
            Endpoint::Tubes => "/api/tubes",
        }
    }
}

pub const COMMAND_PATH: &str = "/api/cmd";

/// Request/response access to the bridge
#[async_trait]
pub trait HttpApi: Send + Sync + 'static {
    /// Post one command line
    async fn post_command(&self, line: &str) -> Result<(), TransportError>;

    /// Fetch the plain-text body of a read endpoint
    async fn fetch_text(&self, endpoint: Endpoint) -> Result<String, TransportError>;
}

/// [`HttpApi`] over reqwest
pub struct BridgeHttpClient {
    base_url: String,
    client: Client,
}

impl BridgeHttpClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl HttpApi for BridgeHttpClient {
    async fn post_command(&self, line: &str) -> Result<(), TransportError> {
        let url = self.url(COMMAND_PATH);
        tracing::debug!("POST {} <- {}", url, line);

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "text/plain")
            .body(line.to_string())
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    async fn fetch_text(&self, endpoint: Endpoint) -> Result<String, TransportError> {
        let url = self.url(endpoint.path());
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        if !response.status().is_success() {
            tracing::warn!("Bridge returned status {} for {}", response.status(), url);
            return Err(TransportError::Status(response.status().as_u16()));
        }

        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        tracing::trace!("GET {} -> {}", url, text.trim());
        Ok(text)
    }
}

/// [`FallbackClient`] that runs each request as a task and reports the
/// outcome as a [`TransportEvent`]
pub struct HttpFallback<A> {
    api: Arc<A>,
    events: mpsc::UnboundedSender<TransportEvent>,
    retries: u32,
    backoff: Duration,
}

impl<A: HttpApi> HttpFallback<A> {
    pub fn new(api: A, events: mpsc::UnboundedSender<TransportEvent>, config: &SyncConfig) -> Self {
        Self {
            api: Arc::new(api),
            events,
            retries: config.http_command_retries,
            backoff: Duration::from_millis(config.http_retry_backoff_ms),
        }
    }
}

impl<A: HttpApi> FallbackClient for HttpFallback<A> {
    fn post_command(&mut self, line: String) {
        let api = self.api.clone();
        let events = self.events.clone();
        let retries = self.retries;
        let backoff = self.backoff;

        tokio::spawn(async move {
            let delivered = post_with_retry(api.as_ref(), &line, retries, backoff).await;
            let _ = events.send(TransportEvent::CommandPosted { line, delivered });
        });
    }

    fn fetch_snapshot(&mut self, include_meta: bool) {
        let api = self.api.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let snapshot = fetch_snapshot(api.as_ref(), include_meta).await;
            let _ = events.send(TransportEvent::PollCompleted(snapshot));
        });
    }
}

/// Post a line, retrying up to `retries` more times. Returns whether it was delivered.
pub async fn post_with_retry<A: HttpApi + ?Sized>(
    api: &A,
    line: &str,
    retries: u32,
    backoff: Duration,
) -> bool {
    let mut attempt = 0;
    loop {
        match api.post_command(line).await {
            Ok(()) => return true,
            Err(e) if attempt < retries => {
                tracing::debug!("Posting '{}' failed ({}), retrying", line, e);
                attempt += 1;
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                tracing::warn!("Posting '{}' failed: {}", line, e);
                return false;
            }
        }
    }
}

/// One poll: always the state line; labels, amp states and tubes with `include_meta`.
/// A failed state fetch fails the whole poll; metadata failures only leave gaps.
pub async fn fetch_snapshot<A: HttpApi + ?Sized>(
    api: &A,
    include_meta: bool,
) -> Option<PolledSnapshot> {
    if !include_meta {
        return match api.fetch_text(Endpoint::State).await {
            Ok(state) => Some(PolledSnapshot {
                state: Some(state),
                ..Default::default()
            }),
            Err(e) => {
                tracing::debug!("State poll failed: {}", e);
                None
            }
        };
    }

    let (state, labels, amp_states, tubes) = tokio::join!(
        api.fetch_text(Endpoint::State),
        api.fetch_text(Endpoint::Labels),
        api.fetch_text(Endpoint::AmpStates),
        api.fetch_text(Endpoint::Tubes),
    );
    let state = match state {
        Ok(state) => state,
        Err(e) => {
            tracing::debug!("State poll failed: {}", e);
            return None;
        }
    };

    Some(PolledSnapshot {
        state: Some(state),
        labels: labels.ok(),
        amp_states: amp_states.ok(),
        tubes: tubes.ok(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeApi {
        failures_left: Mutex<u32>,
        posted: Mutex<Vec<String>>,
        fetched: Mutex<Vec<Endpoint>>,
        fail_labels: bool,
    }

    #[async_trait]
    impl HttpApi for FakeApi {
        async fn post_command(&self, line: &str) -> Result<(), TransportError> {
            self.posted.lock().unwrap().push(line.to_string());
            let mut failures = self.failures_left.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(TransportError::Status(503));
            }
            Ok(())
        }

        async fn fetch_text(&self, endpoint: Endpoint) -> Result<String, TransportError> {
            self.fetched.lock().unwrap().push(endpoint);
            match endpoint {
                Endpoint::State => Ok("STATE VOL=10\n".to_string()),
                Endpoint::Labels if self.fail_labels => Err(TransportError::Status(500)),
                Endpoint::Labels => Ok("SELECTOR_LABELS INP1=\"CD\"\n".to_string()),
                Endpoint::AmpStates => Ok("AMP_STATES 3=\"Operate\"\n".to_string()),
                Endpoint::Tubes => Ok("TUBE NUM=1 ACT=Y HOUR=1 MIN=0\nEND TUBES\n".to_string()),
            }
        }
    }

    fn api_failing(times: u32) -> FakeApi {
        FakeApi {
            failures_left: Mutex::new(times),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_post_retries_once() {
        let api = api_failing(1);
        assert!(post_with_retry(&api, "SET MUTE 1", 1, Duration::from_millis(1)).await);
        assert_eq!(api.posted.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_post_gives_up_after_retry() {
        let api = api_failing(5);
        assert!(!post_with_retry(&api, "SET MUTE 1", 1, Duration::from_millis(1)).await);
        assert_eq!(api.posted.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_state_only_poll() {
        let api = FakeApi::default();
        let snapshot = fetch_snapshot(&api, false).await.unwrap();

        assert_eq!(snapshot.state.as_deref(), Some("STATE VOL=10\n"));
        assert_eq!(snapshot.labels, None);
        assert_eq!(*api.fetched.lock().unwrap(), vec![Endpoint::State]);
    }

    #[tokio::test]
    async fn test_meta_poll_tolerates_partial_failure() {
        let api = FakeApi {
            fail_labels: true,
            ..Default::default()
        };
        let snapshot = fetch_snapshot(&api, true).await.unwrap();

        assert!(snapshot.state.is_some());
        assert_eq!(snapshot.labels, None);
        assert!(snapshot.amp_states.is_some());
        assert!(snapshot.tubes.unwrap().contains("END TUBES"));
        assert_eq!(api.fetched.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_fallback_reports_events() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let config = SyncConfig {
            http_retry_backoff_ms: 1,
            ..Default::default()
        };
        let mut fallback = HttpFallback::new(api_failing(3), events_tx, &config);

        fallback.post_command("SET INP 2".to_string());
        assert_eq!(
            events_rx.recv().await,
            Some(TransportEvent::CommandPosted {
                line: "SET INP 2".to_string(),
                delivered: false
            })
        );

        fallback.fetch_snapshot(false);
        match events_rx.recv().await {
            Some(TransportEvent::PollCompleted(Some(snapshot))) => {
                assert_eq!(snapshot.state.as_deref(), Some("STATE VOL=10\n"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_endpoint_paths() {
        assert_eq!(Endpoint::State.path(), "/api/state");
        assert_eq!(Endpoint::AmpStates.path(), "/api/amp_states");
        let client = BridgeHttpClient::new("http://preamp.local/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.url(COMMAND_PATH), "http://preamp.local/api/cmd");
    }
}
