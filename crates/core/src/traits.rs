use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Close code the bridge uses when only the socket is going away; the client
/// reconnects the channel without falling back to polling
pub const GOING_AWAY_CLOSE_CODE: u16 = 1001;

/// Generation id of a persistent channel. Every new connection attempt gets a
/// larger id, so events from replaced channels can be recognized and dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

impl ChannelId {
    pub fn next(self) -> Self {
        ChannelId(self.0 + 1)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch#{}", self.0)
    }
}

/// One persistent full-duplex connection to the bridge.
///
/// Opening, inbound lines and closing are reported asynchronously as
/// [`TransportEvent`]s tagged with the channel's id.
pub trait ControlChannel: Send {
    fn id(&self) -> ChannelId;

    /// Hand one command line to the channel without blocking
    fn send(&mut self, line: &str) -> Result<(), TransportError>;

    /// Request an orderly close
    fn close(&mut self);
}

/// Opens persistent channels (e.g. a WebSocket at `/ws`)
pub trait ChannelFactory: Send {
    fn open(&mut self, id: ChannelId) -> Box<dyn ControlChannel>;
}

/// Request/response fallback used while no persistent channel is available.
///
/// Both calls return immediately; their outcome comes back as
/// [`TransportEvent::CommandPosted`] and [`TransportEvent::PollCompleted`].
pub trait FallbackClient: Send {
    fn post_command(&mut self, line: String);

    /// Fetch the state line, and with `include_meta` also the labels, amp
    /// state table and tube list
    fn fetch_snapshot(&mut self, include_meta: bool);
}

/// Bodies returned by one fallback poll; `None` where an endpoint was not fetched
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolledSnapshot {
    pub state: Option<String>,
    pub labels: Option<String>,
    pub amp_states: Option<String>,
    pub tubes: Option<String>,
}

/// Everything the transports report back to the engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Opened(ChannelId),
    Line(ChannelId, String),
    Error(ChannelId),
    Closed { channel: ChannelId, code: Option<u16> },
    CommandPosted { line: String, delivered: bool },
    /// `None` when the poll failed
    PollCompleted(Option<PolledSnapshot>),
}
