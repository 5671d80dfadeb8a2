use anyhow::{Context, Result, bail};
use percent_encoding::percent_decode_str;
use reqwest::Url;
use serde::Serialize;

use crate::error::RouteError;

/// Source of the registered sites. Read once per run.
pub trait SiteRegistry {
    fn list_sites(&self) -> Result<Vec<Site>>;
}

/// Host and normalized path prefix of a site or language base.
/// The prefix is plain text without trailing slash, so the root is the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Base {
    pub host: Option<String>,
    pub prefix: String,
}

impl Base {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() || (raw.starts_with('/') && !raw.starts_with("//")) {
            return Ok(Self {
                host: None,
                prefix: normalize_prefix(raw),
            });
        }
        let absolute = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("https://{}", raw.trim_start_matches('/'))
        };
        let url = Url::parse(&absolute).map_err(|error| anyhow::anyhow!("{raw}: {error}"))?;
        let Some(host) = url.host_str().filter(|host| !host.is_empty()) else {
            bail!("base has no host: {raw}");
        };
        let path = percent_decode_str(url.path())
            .decode_utf8()
            .with_context(|| format!("base path is not UTF-8: {raw}"))?;
        Ok(Self {
            host: Some(host.to_ascii_lowercase()),
            prefix: normalize_prefix(&path),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteLanguage {
    pub language_id: u32,
    pub base: Base,
    pub title: Option<String>,
}

impl SiteLanguage {
    pub fn new(language_id: u32, base: &str) -> Result<Self> {
        Ok(Self {
            language_id,
            base: Base::parse(base)?,
            title: None,
        })
    }

    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Site {
    pub identifier: String,
    pub host: String,
    pub prefix: String,
    pub languages: Vec<SiteLanguage>,
}

impl Site {
    pub fn new(identifier: &str, base: &str, languages: Vec<SiteLanguage>) -> Result<Self> {
        let parsed = Base::parse(base)?;
        let Some(host) = parsed.host else {
            bail!("site {identifier} needs an absolute base, got {base}");
        };
        Ok(Self {
            identifier: identifier.to_string(),
            host,
            prefix: parsed.prefix,
            languages,
        })
    }

    pub fn language_host<'a>(&'a self, language: &'a SiteLanguage) -> &'a str {
        language.base.host.as_deref().unwrap_or(&self.host)
    }

    /// Path prefix of a language. Relative language bases nest under the site base.
    pub fn language_prefix(&self, language: &SiteLanguage) -> String {
        match language.base.host {
            Some(_) => language.base.prefix.clone(),
            None => format!("{}{}", self.prefix, language.base.prefix),
        }
    }

    pub fn serves_host(&self, host: &str) -> bool {
        self.host == host
            || self
                .languages
                .iter()
                .any(|language| language.base.host.as_deref() == Some(host))
    }

    pub fn default_language(&self) -> Option<&SiteLanguage> {
        self.languages
            .iter()
            .find(|language| language.language_id == 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteMatch {
    pub site: Site,
    pub language: SiteLanguage,
    /// Decoded path after the language prefix, without leading slash.
    pub tail: String,
}

impl RouteMatch {
    pub fn slug_path(&self) -> String {
        format!("/{}", self.tail)
    }
}

pub struct RouteMatcher {
    sites: Vec<Site>,
}

impl RouteMatcher {
    pub fn new(sites: Vec<Site>) -> Self {
        Self { sites }
    }

    pub fn from_registry(registry: &dyn SiteRegistry) -> Result<Self> {
        Ok(Self::new(registry.list_sites()?))
    }

    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    pub fn match_route(&self, url: &str) -> std::result::Result<RouteMatch, RouteError> {
        let parsed =
            Url::parse(url).map_err(|error| RouteError::InvalidUrl(format!("{url}: {error}")))?;
        let host = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| RouteError::InvalidUrl(url.to_string()))?;

        // Hosts are expected not to overlap between sites; first match wins.
        let site = self
            .sites
            .iter()
            .find(|site| site.serves_host(&host))
            .ok_or_else(|| RouteError::NoMatchingSite(url.to_string()))?;

        let Ok(path) = percent_decode_str(parsed.path()).decode_utf8() else {
            return Err(RouteError::MalformedResult {
                url: url.to_string(),
                reason: "path is not UTF-8 once percent-decoded".to_string(),
            });
        };
        let path: &str = &path;
        let mut best: Option<(&SiteLanguage, String)> = None;
        for language in &site.languages {
            if site.language_host(language) != host {
                continue;
            }
            let prefix = site.language_prefix(language);
            if !has_path_prefix(path, &prefix) {
                continue;
            }
            if best
                .as_ref()
                .is_none_or(|(_, current)| prefix.len() > current.len())
            {
                best = Some((language, prefix));
            }
        }

        let (language, prefix) = match best {
            Some(found) => found,
            None => {
                let fallback =
                    site.default_language()
                        .ok_or_else(|| RouteError::MalformedResult {
                            url: url.to_string(),
                            reason: format!(
                                "site {} has no language for host {host} and no default language",
                                site.identifier
                            ),
                        })?;
                let prefix = site.language_prefix(fallback);
                if !has_path_prefix(path, &prefix) {
                    return Err(RouteError::OutsideSiteBase {
                        url: url.to_string(),
                        site: site.identifier.clone(),
                        prefix,
                    });
                }
                (fallback, prefix)
            }
        };

        let tail = path[prefix.len()..].trim_start_matches('/').to_string();
        Ok(RouteMatch {
            site: site.clone(),
            language: language.clone(),
            tail,
        })
    }
}

fn normalize_prefix(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn has_path_prefix(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn testing_site() -> Site {
        Site::new(
            "testing",
            "https://example.com/",
            vec![
                SiteLanguage::new(0, "/").expect("en"),
                SiteLanguage::new(1, "https://de.example.com/").expect("de"),
                SiteLanguage::new(2, "/es/").expect("es"),
            ],
        )
        .expect("site")
    }

    fn matcher() -> RouteMatcher {
        RouteMatcher::new(vec![testing_site()])
    }

    #[test]
    fn base_parse_handles_relative_and_absolute_forms() {
        let relative = Base::parse("/es/").expect("relative");
        assert_eq!(relative.host, None);
        assert_eq!(relative.prefix, "/es");

        let root = Base::parse("/").expect("root");
        assert_eq!(root.prefix, "");

        let absolute = Base::parse("https://DE.example.com/shop/").expect("absolute");
        assert_eq!(absolute.host.as_deref(), Some("de.example.com"));
        assert_eq!(absolute.prefix, "/shop");

        let bare = Base::parse("example.org").expect("bare host");
        assert_eq!(bare.host.as_deref(), Some("example.org"));
        assert_eq!(bare.prefix, "");
    }

    #[test]
    fn default_language_on_site_host() {
        let route = matcher()
            .match_route("https://example.com/abc")
            .expect("route");
        assert_eq!(route.site.identifier, "testing");
        assert_eq!(route.language.language_id, 0);
        assert_eq!(route.tail, "abc");
        assert_eq!(route.slug_path(), "/abc");
    }

    #[test]
    fn language_with_distinct_host() {
        let route = matcher()
            .match_route("https://de.example.com/abc")
            .expect("route");
        assert_eq!(route.language.language_id, 1);
        assert_eq!(route.tail, "abc");
    }

    #[test]
    fn language_with_path_prefix_wins_over_root() {
        let route = matcher()
            .match_route("https://example.com/es/abc/def")
            .expect("route");
        assert_eq!(route.language.language_id, 2);
        assert_eq!(route.tail, "abc/def");

        let bare = matcher().match_route("https://example.com/es").expect("route");
        assert_eq!(bare.language.language_id, 2);
        assert_eq!(bare.tail, "");
    }

    #[test]
    fn prefix_matching_respects_segments() {
        let route = matcher()
            .match_route("https://example.com/espresso")
            .expect("route");
        assert_eq!(route.language.language_id, 0);
        assert_eq!(route.tail, "espresso");
    }

    #[test]
    fn host_match_ignores_case_and_query() {
        let route = matcher()
            .match_route("https://EXAMPLE.com/abc?x=1")
            .expect("route");
        assert_eq!(route.tail, "abc");
    }

    #[test]
    fn unknown_host_is_no_matching_site() {
        let error = matcher()
            .match_route("https://unknown.org/abc")
            .expect_err("must fail");
        assert!(matches!(error, RouteError::NoMatchingSite(_)));
    }

    #[test]
    fn unparsable_url_is_invalid() {
        let error = matcher().match_route("not a url").expect_err("must fail");
        assert!(matches!(error, RouteError::InvalidUrl(_)));
    }

    #[test]
    fn site_without_default_language_is_malformed() {
        let site = Site::new(
            "nolang",
            "https://example.net/",
            vec![SiteLanguage::new(3, "/fr/").expect("fr")],
        )
        .expect("site");
        let matcher = RouteMatcher::new(vec![site]);
        let error = matcher
            .match_route("https://example.net/abc")
            .expect_err("must fail");
        assert!(matches!(error, RouteError::MalformedResult { .. }));
    }

    #[test]
    fn first_site_with_matching_host_wins() {
        let first = Site::new(
            "first",
            "https://example.com/",
            vec![SiteLanguage::new(0, "/").expect("en")],
        )
        .expect("first");
        let second = Site::new(
            "second",
            "https://example.com/",
            vec![SiteLanguage::new(0, "/").expect("en")],
        )
        .expect("second");
        let matcher = RouteMatcher::new(vec![first, second]);
        let route = matcher
            .match_route("https://example.com/abc")
            .expect("route");
        assert_eq!(route.site.identifier, "first");
    }

    fn portal_matcher() -> RouteMatcher {
        let site = Site::new(
            "main",
            "https://example.com/portal/",
            vec![SiteLanguage::new(0, "/").expect("en")],
        )
        .expect("site");
        RouteMatcher::new(vec![site])
    }

    #[test]
    fn path_outside_site_base_has_no_route() {
        let matcher = portal_matcher();
        let error = matcher
            .match_route("https://example.com/other")
            .expect_err("must fail");
        assert_eq!(
            error,
            RouteError::OutsideSiteBase {
                url: "https://example.com/other".to_string(),
                site: "main".to_string(),
                prefix: "/portal".to_string(),
            }
        );

        let error = matcher
            .match_route("https://example.com/portalen/abc")
            .expect_err("must fail");
        assert!(matches!(error, RouteError::OutsideSiteBase { .. }));

        let route = matcher
            .match_route("https://example.com/portal/other")
            .expect("route");
        assert_eq!(route.tail, "other");
    }

    #[test]
    fn tail_is_percent_decoded() {
        let route = matcher()
            .match_route("https://example.com/%C3%BCber-uns/team%20a")
            .expect("route");
        assert_eq!(route.tail, "über-uns/team a");
        assert_eq!(route.slug_path(), "/über-uns/team a");
    }

    #[test]
    fn undecodable_path_is_malformed() {
        let error = matcher()
            .match_route("https://example.com/%FF%FE")
            .expect_err("must fail");
        assert!(matches!(error, RouteError::MalformedResult { .. }));
    }

    #[test]
    fn encoded_language_prefix_matches_decoded_path() {
        let site = Site::new(
            "intl",
            "https://example.com/",
            vec![
                SiteLanguage::new(0, "/").expect("en"),
                SiteLanguage::new(4, "https://example.com/%C3%A9t%C3%A9/").expect("fr"),
            ],
        )
        .expect("site");
        let route = RouteMatcher::new(vec![site])
            .match_route("https://example.com/%C3%A9t%C3%A9/plage")
            .expect("route");
        assert_eq!(route.language.language_id, 4);
        assert_eq!(route.tail, "plage");
    }

    #[test]
    fn site_base_path_nests_relative_language_prefixes() {
        let site = Site::new(
            "nested",
            "https://example.org/portal/",
            vec![
                SiteLanguage::new(0, "/").expect("en"),
                SiteLanguage::new(1, "/de/").expect("de"),
            ],
        )
        .expect("site");
        let matcher = RouteMatcher::new(vec![site]);
        let route = matcher
            .match_route("https://example.org/portal/de/kontakt")
            .expect("route");
        assert_eq!(route.language.language_id, 1);
        assert_eq!(route.tail, "kontakt");

        let route = matcher
            .match_route("https://example.org/portal/contact")
            .expect("route");
        assert_eq!(route.language.language_id, 0);
        assert_eq!(route.tail, "contact");
    }
}
