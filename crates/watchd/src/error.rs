//! Error taxonomy for the cases callers need to match on. Everything else
//! is logged in place and swallowed — no exception is allowed to cross a
//! watcher boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("config error: {0}")]
    Config(String),

    #[error("dependency path '{0}' is not '<watchId>.<subject>'")]
    DependencyPath(String),

    #[error("sms unavailable: {0}")]
    SmsUnavailable(String),
}
