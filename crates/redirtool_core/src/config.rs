use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::link::LanguageParameter;
use crate::routing::{Site, SiteLanguage, SiteRegistry};

pub const DEFAULT_USER_AGENT: &str = "redirtool/0.1 (internal redirects sanitizer)";
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RedirtoolConfig {
    #[serde(default)]
    pub redirects: RedirectsSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub sites: Vec<SiteEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RedirectsSection {
    pub force_https: Option<bool>,
    pub always_link_to_original_language: Option<bool>,
    pub language_parameter: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HttpSection {
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub max_redirects: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SiteEntry {
    pub identifier: String,
    pub base: String,
    #[serde(default)]
    pub languages: Vec<LanguageEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LanguageEntry {
    pub language_id: u32,
    pub base: String,
    pub title: Option<String>,
}

/// Resolved HTTP client settings for the redirect probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub user_agent: String,
    /// `None` keeps the transport default.
    pub timeout_ms: Option<u64>,
    pub max_redirects: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_ms: None,
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }
}

impl RedirtoolConfig {
    /// Global https default: env REDIRTOOL_FORCE_HTTPS > config > false.
    pub fn force_https(&self) -> bool {
        if let Some(value) = env_value("REDIRTOOL_FORCE_HTTPS").and_then(|value| parse_flag(&value))
        {
            return value;
        }
        self.redirects.force_https.unwrap_or(false)
    }

    pub fn always_link_to_original_language(&self) -> bool {
        self.redirects
            .always_link_to_original_language
            .unwrap_or(false)
    }

    /// Language qualifier: env REDIRTOOL_LANGUAGE_PARAMETER > config > `L`.
    pub fn language_parameter(&self) -> Result<LanguageParameter> {
        match env_value("REDIRTOOL_LANGUAGE_PARAMETER")
            .or_else(|| self.redirects.language_parameter.clone())
        {
            Some(value) => LanguageParameter::parse(&value),
            None => Ok(LanguageParameter::default()),
        }
    }

    /// Probe settings: env REDIRTOOL_USER_AGENT and REDIRTOOL_HTTP_TIMEOUT_MS > config > default.
    pub fn http_settings(&self) -> Result<HttpSettings> {
        let user_agent = env_value("REDIRTOOL_USER_AGENT")
            .or_else(|| self.http.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let timeout_ms = match env_value("REDIRTOOL_HTTP_TIMEOUT_MS") {
            Some(value) => Some(
                parse_timeout_ms(&value).context("invalid REDIRTOOL_HTTP_TIMEOUT_MS")?,
            ),
            None => self.http.timeout_ms,
        };
        Ok(HttpSettings {
            user_agent,
            timeout_ms,
            max_redirects: self.http.max_redirects.unwrap_or(DEFAULT_MAX_REDIRECTS),
        })
    }
}

impl SiteRegistry for RedirtoolConfig {
    fn list_sites(&self) -> Result<Vec<Site>> {
        self.sites
            .iter()
            .map(|entry| {
                let languages = entry
                    .languages
                    .iter()
                    .map(|language| {
                        SiteLanguage::new(language.language_id, &language.base)
                            .map(|site_language| site_language.with_title(language.title.clone()))
                    })
                    .collect::<Result<Vec<_>>>()
                    .with_context(|| format!("invalid language base in site {}", entry.identifier))?;
                Site::new(&entry.identifier, &entry.base, languages)
            })
            .collect()
    }
}

/// Load and parse the config file. Returns default if the file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<RedirtoolConfig> {
    if !config_path.exists() {
        return Ok(RedirtoolConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: RedirtoolConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_timeout_ms(value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .with_context(|| format!("expected a timeout in milliseconds, got {value:?}"))
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_no_sites() {
        let config = RedirtoolConfig::default();
        assert!(config.sites.is_empty());
        assert!(!config.always_link_to_original_language());
        assert_eq!(config.http.max_redirects, None);
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert!(config.sites.is_empty());
    }

    #[test]
    fn load_config_parses_sites_and_languages() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[redirects]
force_https = true
always_link_to_original_language = true
language_parameter = "_language"

[http]
user_agent = "test-agent/1.0"
timeout_ms = 2500
max_redirects = 3

[[sites]]
identifier = "main"
base = "https://example.com/"

[[sites.languages]]
language_id = 0
base = "/"
title = "English"

[[sites.languages]]
language_id = 1
base = "https://de.example.com/"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.redirects.force_https, Some(true));
        assert!(config.always_link_to_original_language());
        assert_eq!(config.sites.len(), 1);
        assert_eq!(config.sites[0].languages.len(), 2);
        assert_eq!(config.sites[0].languages[0].title.as_deref(), Some("English"));
        assert_eq!(config.http.timeout_ms, Some(2500));
        assert_eq!(config.http.max_redirects, Some(3));

        let sites = config.list_sites().expect("sites");
        assert_eq!(sites[0].identifier, "main");
        assert_eq!(sites[0].languages[1].language_id, 1);
        assert_eq!(sites[0].languages[0].title.as_deref(), Some("English"));
        assert_eq!(sites[0].languages[1].title, None);
    }

    #[test]
    fn load_config_tolerates_partial_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[paths]\nproject_root = \"/foo\"\n").expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert!(config.sites.is_empty());
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[redirects\nforce_https = true").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn list_sites_rejects_unparsable_base() {
        let config = RedirtoolConfig {
            sites: vec![SiteEntry {
                identifier: "broken".to_string(),
                base: "https://".to_string(),
                languages: Vec::new(),
            }],
            ..RedirtoolConfig::default()
        };
        assert!(config.list_sites().is_err());
    }

    #[test]
    fn http_settings_fall_back_to_defaults() {
        let config = RedirtoolConfig::default();
        let settings = config.http_settings().expect("settings");
        assert_eq!(settings.max_redirects, DEFAULT_MAX_REDIRECTS);
    }

    #[test]
    fn timeout_must_be_whole_milliseconds() {
        assert_eq!(parse_timeout_ms("2500").expect("parse"), 2500);
        let error = parse_timeout_ms("2.5s").expect_err("must fail");
        assert!(error.to_string().contains("\"2.5s\""));
        assert!(parse_timeout_ms("-1").is_err());
    }

    #[test]
    fn parse_flag_accepts_common_spellings() {
        assert_eq!(parse_flag("Yes"), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
