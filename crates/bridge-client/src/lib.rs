pub mod http;
pub mod runtime;
pub mod websocket;

pub use http::{BridgeHttpClient, Endpoint, HttpApi, HttpFallback};
pub use runtime::{SyncHandle, SyncRuntime};
pub use websocket::{WebSocketChannel, WebSocketConnector};
