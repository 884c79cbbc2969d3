#![deny(unsafe_code)]

//! Network edge of the chat client: REST snapshot and session calls, and
//! the supervised websocket channel that carries sends and deltas.

pub mod channel;
mod error;
pub mod http;
pub mod sessions;
pub mod snapshot;
pub mod wire;

pub use channel::{
    ChannelConfig, ChannelEvent, ChannelHandle, ChannelManager, Connection, ReconnectPolicy,
};
pub use error::{ChannelError, ChannelResult, FetchError, FetchResult};
pub use http::ApiEndpoint;
pub use sessions::{MAX_UPLOAD_BYTES, SessionClient, UPLOAD_EXTENSIONS};
pub use snapshot::SnapshotLoader;
