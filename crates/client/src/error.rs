use std::path::PathBuf;

use snafu::Snafu;

/// Failures of request/response calls against the REST API.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FetchError {
    #[snafu(display("invalid API base URL '{raw}' on `{stage}`: {source}"))]
    InvalidBaseUrl {
        stage: &'static str,
        raw: String,
        source: url::ParseError,
    },
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildHttpClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request to {url} failed on `{stage}`: {source}"))]
    Request {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },
    #[snafu(display("{url} returned status {status}: {body}"))]
    Status {
        stage: &'static str,
        url: String,
        status: u16,
        body: String,
    },
    #[snafu(display("malformed response body from {url} on `{stage}`: {source}"))]
    MalformedBody {
        stage: &'static str,
        url: String,
        source: serde_json::Error,
    },
    #[snafu(display("failed to read upload file {path:?}"))]
    ReadUpload {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("upload {path:?} rejected: {reason}"))]
    UploadRejected {
        stage: &'static str,
        path: PathBuf,
        reason: String,
    },
}

pub type FetchResult<T> = Result<T, FetchError>;

/// Failures of the duplex channel.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChannelError {
    #[snafu(display("failed to connect channel to {url} on `{stage}`: {source}"))]
    Connect {
        stage: &'static str,
        url: String,
        source: Box<tokio_tungstenite::tungstenite::Error>,
    },
    #[snafu(display("failed to encode outbound frame on `{stage}`: {source}"))]
    Encode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("channel for session {session_id} is closed"))]
    Closed {
        stage: &'static str,
        session_id: String,
    },
    #[snafu(display("channel gave up after {attempts} reconnect attempts"))]
    ReconnectExhausted { stage: &'static str, attempts: u32 },
}

pub type ChannelResult<T> = Result<T, ChannelError>;
