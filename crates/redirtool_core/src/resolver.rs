use std::error::Error as StdError;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::redirect::{Attempt, Policy};
use thiserror::Error;
use tracing::debug;

use crate::config::HttpSettings;
use crate::error::{ProbeError, ResolveError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    /// URL actually reached after following redirects.
    pub effective_url: String,
}

/// One outbound GET with redirect following. Implementations must not retry.
pub trait HttpProbe {
    fn get(&mut self, url: &str) -> std::result::Result<ProbeResponse, ProbeError>;
}

#[derive(Debug, Error)]
enum RedirectRejected {
    #[error("exceeded {0} redirects")]
    TooMany(usize),
    #[error("redirect target is not an http(s) url: {0}")]
    InvalidTarget(String),
}

pub struct ReqwestProbe {
    client: Client,
}

impl ReqwestProbe {
    pub fn new(settings: &HttpSettings) -> Result<Self> {
        let max_redirects = settings.max_redirects;
        let mut builder = Client::builder()
            .cookie_store(true)
            .user_agent(settings.user_agent.clone())
            .redirect(Policy::custom(move |attempt| {
                strict_redirect(attempt, max_redirects)
            }));
        if let Some(timeout_ms) = settings.timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout_ms));
        }
        let client = builder
            .build()
            .context("failed to build redirect probe HTTP client")?;
        Ok(Self { client })
    }
}

fn strict_redirect(attempt: Attempt<'_>, max_redirects: usize) -> reqwest::redirect::Action {
    if attempt.previous().len() > max_redirects {
        return attempt.error(RedirectRejected::TooMany(max_redirects));
    }
    if !matches!(attempt.url().scheme(), "http" | "https") {
        let target = attempt.url().to_string();
        return attempt.error(RedirectRejected::InvalidTarget(target));
    }
    attempt.follow()
}

impl HttpProbe for ReqwestProbe {
    fn get(&mut self, url: &str) -> std::result::Result<ProbeResponse, ProbeError> {
        let response = self.client.get(url).send().map_err(classify_transport_error)?;
        Ok(ProbeResponse {
            status: response.status().as_u16(),
            effective_url: response.url().to_string(),
        })
    }
}

fn classify_transport_error(error: reqwest::Error) -> ProbeError {
    if error.is_redirect() {
        let mut source = error.source();
        while let Some(cause) = source {
            if matches!(
                cause.downcast_ref::<RedirectRejected>(),
                Some(RedirectRejected::InvalidTarget(_))
            ) {
                return ProbeError::Transport(error.to_string());
            }
            source = cause.source();
        }
        return ProbeError::TooManyRedirects(error.to_string());
    }
    if let Some(status) = error.status() {
        return ProbeError::Status {
            status: status.as_u16(),
            message: error.to_string(),
        };
    }
    ProbeError::Transport(error.to_string())
}

/// Follows a URL to its effective location and classifies failures.
///
/// The error of the most recent call stays readable through [`last_error`]
/// until the next call to [`resolve`].
///
/// [`last_error`]: UrlResolver::last_error
/// [`resolve`]: UrlResolver::resolve
pub struct UrlResolver<P> {
    probe: P,
    last_error: Option<ResolveError>,
}

impl<P: HttpProbe> UrlResolver<P> {
    pub fn new(probe: P) -> Self {
        Self {
            probe,
            last_error: None,
        }
    }

    pub fn resolve(&mut self, url: &str) -> std::result::Result<String, ResolveError> {
        self.last_error = None;
        let outcome = match self.probe.get(url) {
            Ok(response) if response.status < 300 => Ok(response.effective_url),
            Ok(response) => Err(ResolveError::Http {
                url: response.effective_url,
                status: response.status,
            }),
            Err(ProbeError::Status { status, .. }) => Err(ResolveError::Http {
                url: url.to_string(),
                status,
            }),
            Err(ProbeError::TooManyRedirects(message)) => Err(ResolveError::TooManyRedirects {
                url: url.to_string(),
                message,
            }),
            Err(ProbeError::Transport(message)) => Err(ResolveError::Transport {
                url: url.to_string(),
                message,
            }),
        };
        match &outcome {
            Ok(effective) => debug!(url, effective = effective.as_str(), "resolved"),
            Err(error) => {
                debug!(url, kind = error.kind().as_str(), "resolution failed");
                self.last_error = Some(error.clone());
            }
        }
        outcome
    }

    pub fn last_error(&self) -> Option<&ResolveError> {
        self.last_error.as_ref()
    }

    pub fn error_message(&self) -> String {
        self.last_error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "unknown error".to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::{BufRead, BufReader, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    use super::*;
    use crate::error::ResolveErrorKind;

    #[derive(Default)]
    struct ScriptedProbe {
        replies: VecDeque<std::result::Result<ProbeResponse, ProbeError>>,
        requested: Vec<String>,
    }

    impl HttpProbe for ScriptedProbe {
        fn get(&mut self, url: &str) -> std::result::Result<ProbeResponse, ProbeError> {
            self.requested.push(url.to_string());
            self.replies
                .pop_front()
                .unwrap_or_else(|| Err(ProbeError::Transport("no scripted reply".to_string())))
        }
    }

    fn ok(status: u16, effective_url: &str) -> std::result::Result<ProbeResponse, ProbeError> {
        Ok(ProbeResponse {
            status,
            effective_url: effective_url.to_string(),
        })
    }

    #[test]
    fn success_returns_effective_url() {
        let probe = ScriptedProbe {
            replies: VecDeque::from([ok(200, "https://example.com/abc")]),
            ..ScriptedProbe::default()
        };
        let mut resolver = UrlResolver::new(probe);
        let effective = resolver.resolve("http://example.com/abc").expect("resolve");
        assert_eq!(effective, "https://example.com/abc");
        assert!(resolver.last_error().is_none());
        assert_eq!(resolver.probe.requested, vec!["http://example.com/abc"]);
    }

    #[test]
    fn status_at_or_above_300_is_http_error() {
        let probe = ScriptedProbe {
            replies: VecDeque::from([ok(404, "https://example.com/gone")]),
            ..ScriptedProbe::default()
        };
        let mut resolver = UrlResolver::new(probe);
        let error = resolver.resolve("http://example.com/gone").expect_err("must fail");
        assert_eq!(error.kind(), ResolveErrorKind::Http);
        assert_eq!(error.status(), Some(404));
    }

    #[test]
    fn probe_errors_are_classified() {
        let probe = ScriptedProbe {
            replies: VecDeque::from([
                Err(ProbeError::TooManyRedirects("loop".to_string())),
                Err(ProbeError::Status {
                    status: 503,
                    message: "unavailable".to_string(),
                }),
                Err(ProbeError::Transport("dns".to_string())),
            ]),
            ..ScriptedProbe::default()
        };
        let mut resolver = UrlResolver::new(probe);
        let kinds = (0..3)
            .map(|_| resolver.resolve("http://example.com/").expect_err("fail").kind())
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                ResolveErrorKind::TooManyRedirects,
                ResolveErrorKind::Http,
                ResolveErrorKind::Transport
            ]
        );
    }

    #[test]
    fn last_error_is_request_scoped() {
        let probe = ScriptedProbe {
            replies: VecDeque::from([
                Err(ProbeError::Transport("refused".to_string())),
                ok(200, "http://example.com/"),
            ]),
            ..ScriptedProbe::default()
        };
        let mut resolver = UrlResolver::new(probe);
        assert_eq!(resolver.error_message(), "unknown error");
        resolver.resolve("http://example.com/").expect_err("fail");
        assert!(resolver.error_message().contains("refused"));
        resolver.resolve("http://example.com/").expect("ok");
        assert!(resolver.last_error().is_none());
    }

    fn read_request_path(stream: &TcpStream) -> String {
        let mut reader = BufReader::new(stream);
        let mut request_line = String::new();
        reader.read_line(&mut request_line).expect("request line");
        loop {
            let mut header = String::new();
            let read = reader.read_line(&mut header).expect("header");
            if read == 0 || header == "\r\n" {
                break;
            }
        }
        request_line
            .split_whitespace()
            .nth(1)
            .unwrap_or("/")
            .to_string()
    }

    fn spawn_fixture_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = listener.local_addr().expect("addr");
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let path = read_request_path(&stream);
                let response = match path.as_str() {
                    "/old" => "HTTP/1.1 301 Moved Permanently\r\nLocation: /new\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
                    "/new" => "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok".to_string(),
                    "/loop" => "HTTP/1.1 302 Found\r\nLocation: /loop\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
                    "/ftp" => "HTTP/1.1 302 Found\r\nLocation: ftp://example.com/file\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
                    _ => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
                };
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{address}")
    }

    fn live_resolver() -> UrlResolver<ReqwestProbe> {
        let settings = HttpSettings {
            timeout_ms: Some(5_000),
            max_redirects: 5,
            ..HttpSettings::default()
        };
        UrlResolver::new(ReqwestProbe::new(&settings).expect("probe"))
    }

    #[test]
    fn reqwest_probe_follows_redirects_to_final_url() {
        let base = spawn_fixture_server();
        let mut resolver = live_resolver();
        let effective = resolver.resolve(&format!("{base}/old")).expect("resolve");
        assert_eq!(effective, format!("{base}/new"));
    }

    #[test]
    fn reqwest_probe_reports_http_status() {
        let base = spawn_fixture_server();
        let mut resolver = live_resolver();
        let error = resolver
            .resolve(&format!("{base}/missing"))
            .expect_err("must fail");
        assert_eq!(error.status(), Some(404));
    }

    #[test]
    fn reqwest_probe_detects_redirect_loops() {
        let base = spawn_fixture_server();
        let mut resolver = live_resolver();
        let error = resolver.resolve(&format!("{base}/loop")).expect_err("must fail");
        assert_eq!(error.kind(), ResolveErrorKind::TooManyRedirects);
    }

    #[test]
    fn reqwest_probe_rejects_non_http_redirect_targets() {
        let base = spawn_fixture_server();
        let mut resolver = live_resolver();
        let error = resolver.resolve(&format!("{base}/ftp")).expect_err("must fail");
        assert_eq!(error.kind(), ResolveErrorKind::Transport);
    }

    #[test]
    fn reqwest_probe_reports_refused_connection_as_transport() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = listener.local_addr().expect("addr");
        drop(listener);
        let mut resolver = live_resolver();
        let error = resolver
            .resolve(&format!("http://{address}/abc"))
            .expect_err("must fail");
        assert_eq!(error.kind(), ResolveErrorKind::Transport);
    }
}
