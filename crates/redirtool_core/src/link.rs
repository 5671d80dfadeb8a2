use anyhow::{Result, bail};
use serde::Serialize;

use crate::record::TYPOLINK_PAGE_PREFIX;
use crate::slugs::SlugCandidate;

pub trait LinkBuilder {
    fn to_link_string(&self, page_id: u32) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PageLinkBuilder;

impl LinkBuilder for PageLinkBuilder {
    fn to_link_string(&self, page_id: u32) -> String {
        format!("{TYPOLINK_PAGE_PREFIX}uid={page_id}")
    }
}

/// Query parameter carrying the language of a page link. Which one the target
/// installation expects depends on its version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum LanguageParameter {
    #[default]
    L,
    Language,
}

impl LanguageParameter {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().trim_start_matches('&').trim_end_matches('=') {
            "L" => Ok(Self::L),
            "_language" => Ok(Self::Language),
            other => bail!("unsupported language parameter: {other} (expected L|_language)"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::L => "L",
            Self::Language => "_language",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageSelection {
    pub page_id: u32,
    pub language_id: u32,
}

/// Picks the page and language a link should point to. With
/// `always_link_to_original_language`, translations are redirected to their
/// default-language parent.
pub fn select_page(
    candidate: &SlugCandidate,
    always_link_to_original_language: bool,
) -> Option<PageSelection> {
    let uid = candidate.uid?;
    if candidate.language_id != 0 && always_link_to_original_language {
        let page_id = if candidate.l10n_parent != 0 {
            candidate.l10n_parent
        } else {
            uid
        };
        return Some(PageSelection {
            page_id,
            language_id: 0,
        });
    }
    Some(PageSelection {
        page_id: uid,
        language_id: candidate.language_id,
    })
}

pub struct PageReferenceSynthesizer<B> {
    builder: B,
    language_parameter: LanguageParameter,
}

impl<B: LinkBuilder> PageReferenceSynthesizer<B> {
    pub fn new(builder: B, language_parameter: LanguageParameter) -> Self {
        Self {
            builder,
            language_parameter,
        }
    }

    pub fn synthesize(&self, page_id: u32, language_id: u32) -> String {
        let mut link = self.builder.to_link_string(page_id);
        if !link.is_empty() && language_id != 0 {
            link.push_str(&format!(
                "&{}={language_id}",
                self.language_parameter.as_str()
            ));
        }
        link
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(uid: u32, l10n_parent: u32, language_id: u32) -> SlugCandidate {
        SlugCandidate {
            uid: Some(uid),
            l10n_parent,
            slug: "/abc".to_string(),
            language_id,
        }
    }

    #[test]
    fn default_language_link_has_no_qualifier() {
        let synthesizer = PageReferenceSynthesizer::new(PageLinkBuilder, LanguageParameter::L);
        assert_eq!(synthesizer.synthesize(2, 0), "t3://page?uid=2");
    }

    #[test]
    fn translated_link_appends_configured_qualifier() {
        let with_l = PageReferenceSynthesizer::new(PageLinkBuilder, LanguageParameter::L);
        assert_eq!(with_l.synthesize(2, 1), "t3://page?uid=2&L=1");

        let with_language =
            PageReferenceSynthesizer::new(PageLinkBuilder, LanguageParameter::Language);
        assert_eq!(with_language.synthesize(2, 2), "t3://page?uid=2&_language=2");
    }

    #[test]
    fn empty_link_stays_empty() {
        struct NullBuilder;
        impl LinkBuilder for NullBuilder {
            fn to_link_string(&self, _page_id: u32) -> String {
                String::new()
            }
        }
        let synthesizer = PageReferenceSynthesizer::new(NullBuilder, LanguageParameter::L);
        assert_eq!(synthesizer.synthesize(2, 1), "");
    }

    #[test]
    fn language_parameter_parse_accepts_both_conventions() {
        assert_eq!(LanguageParameter::parse("L").expect("L"), LanguageParameter::L);
        assert_eq!(
            LanguageParameter::parse("&_language=").expect("_language"),
            LanguageParameter::Language
        );
        assert!(LanguageParameter::parse("lang").is_err());
    }

    #[test]
    fn selection_keeps_translation_by_default() {
        let selection = select_page(&candidate(2, 0, 1), false).expect("selection");
        assert_eq!(
            selection,
            PageSelection {
                page_id: 2,
                language_id: 1
            }
        );
    }

    #[test]
    fn selection_retargets_to_parent_when_requested() {
        let selection = select_page(&candidate(5, 2, 1), true).expect("selection");
        assert_eq!(
            selection,
            PageSelection {
                page_id: 2,
                language_id: 0
            }
        );
    }

    #[test]
    fn default_language_candidate_ignores_original_language_flag() {
        let selection = select_page(&candidate(2, 0, 0), true).expect("selection");
        assert_eq!(selection.page_id, 2);
        assert_eq!(selection.language_id, 0);
    }

    #[test]
    fn candidate_without_uid_has_no_selection() {
        let mut missing = candidate(2, 0, 0);
        missing.uid = None;
        assert!(select_page(&missing, false).is_none());
    }
}
