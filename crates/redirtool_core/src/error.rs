use serde::Serialize;
use thiserror::Error;

/// Failure reported by an [`crate::resolver::HttpProbe`] implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("too many redirects: {0}")]
    TooManyRedirects(String),
    #[error("request failed: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveErrorKind {
    Http,
    TooManyRedirects,
    Transport,
}

impl ResolveErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::TooManyRedirects => "too_many_redirects",
            Self::Transport => "transport",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("HTTP status {status} for {url}")]
    Http { url: String, status: u16 },
    #[error("too many redirects for {url}: {message}")]
    TooManyRedirects { url: String, message: String },
    #[error("request for {url} failed: {message}")]
    Transport { url: String, message: String },
}

impl ResolveError {
    pub fn kind(&self) -> ResolveErrorKind {
        match self {
            Self::Http { .. } => ResolveErrorKind::Http,
            Self::TooManyRedirects { .. } => ResolveErrorKind::TooManyRedirects,
            Self::Transport { .. } => ResolveErrorKind::Transport,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("no site found for url: {0}")]
    NoMatchingSite(String),
    #[error("url {url} is outside base {prefix} of site {site}")]
    OutsideSiteBase {
        url: String,
        site: String,
        prefix: String,
    },
    #[error("malformed route result for {url}: {reason}")]
    MalformedResult { url: String, reason: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpdateError {
    #[error("expected 1 changed row, got {changed} for uid={uid}")]
    RowCount { uid: i64, changed: usize },
    #[error("storage error: {0}")]
    Storage(String),
}
