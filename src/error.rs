use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures reported by a navigation session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("timed out after {}ms waiting for {locator}", .after.as_millis())]
    Timeout { locator: String, after: Duration },

    #[error("stale or unknown element {0}")]
    StaleElement(String),

    #[error("webdriver error ({status}): {message}")]
    Protocol { status: u16, message: String },

    #[error("could not start a browser session: {0}")]
    Unavailable(String),

    #[error("network error: {0}")]
    Network(String),
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        SessionError::Network(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("request for {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("{0} returned an empty body")]
    EmptyBody(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// A record for this key is already on disk. Reaching this means the
    /// skip check was bypassed.
    #[error("record {0} already exists")]
    WriteConflict(String),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum GroundTruthError {
    #[error("identifier '{0}' is not of the form <source>_<related>")]
    MalformedIdentifier(String),
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("cannot read class group {path}: {source}")]
    ClassGroup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
