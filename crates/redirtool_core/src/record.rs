use std::fmt;

use serde::Serialize;

pub const TYPOLINK_PAGE_PREFIX: &str = "t3://page?";
pub const TYPOLINK_FILE_PREFIX: &str = "t3://file?";

/// Stored redirect target. The column holds either a page id or free text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RedirectTarget {
    Int(i64),
    Str(String),
}

impl RedirectTarget {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Int(_) => None,
            Self::Str(value) => Some(value),
        }
    }
}

impl fmt::Display for RedirectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Str(value) => f.write_str(value),
        }
    }
}

impl From<&str> for RedirectTarget {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<i64> for RedirectTarget {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedirectRecord {
    pub uid: i64,
    pub source_host: String,
    pub source_path: String,
    pub target: RedirectTarget,
    pub force_https: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Unknown,
    Path,
    AbsoluteUrl,
    PageId,
    TypolinkPage,
    TypolinkFile,
}

impl TargetType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Path => "path",
            Self::AbsoluteUrl => "url",
            Self::PageId => "page id",
            Self::TypolinkPage => "typolink page",
            Self::TypolinkFile => "typolink file",
        }
    }
}

pub fn classify(target: &RedirectTarget) -> TargetType {
    let text = match target {
        RedirectTarget::Int(_) => return TargetType::PageId,
        RedirectTarget::Str(text) => text,
    };
    if text.starts_with(TYPOLINK_PAGE_PREFIX) {
        TargetType::TypolinkPage
    } else if text.starts_with(TYPOLINK_FILE_PREFIX) {
        TargetType::TypolinkFile
    } else if text.starts_with('/') {
        TargetType::Path
    } else if text.starts_with("http") {
        TargetType::AbsoluteUrl
    } else {
        TargetType::Unknown
    }
}

/// Absolute URL for a path target, or an empty string when the record has no
/// usable host. `force_https` wins over the record flag when set.
pub fn build_probe_url(record: &RedirectRecord, force_https: bool) -> String {
    let host = record.source_host.trim();
    if host.is_empty() || host == "*" {
        return String::new();
    }
    let path = match &record.target {
        RedirectTarget::Str(path) => path.as_str(),
        RedirectTarget::Int(_) => return String::new(),
    };
    let scheme = if force_https || record.force_https {
        "https"
    } else {
        "http"
    };
    format!("{scheme}://{host}{path}")
}
