/// Errors from the relay's side-effect paths: sink delivery, the
/// callback-URL guard, and webhook dispatch. The data plane logs and
/// absorbs these; none of them may fail a WebSocket forward or an HTTP
/// response.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The structured sink could not deliver a record.
    #[error("sink delivery failed: {0}")]
    Sink(String),

    /// A callback URL failed the SSRF guard and was dropped.
    #[error("callback URL rejected: {0}")]
    CallbackRejected(String),

    /// A tool webhook dispatch failed: transport, status, or decode.
    #[error("{0}")]
    Dispatch(String),
}

pub type Result<T> = std::result::Result<T, Error>;
