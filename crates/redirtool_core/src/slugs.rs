use std::collections::HashMap;
use std::collections::hash_map::Entry;

use anyhow::Result;
use serde::Serialize;
use tracing::debug;

use crate::routing::{Site, SiteLanguage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlugCandidate {
    pub uid: Option<u32>,
    /// Default-language page this one translates, 0 for default-language pages.
    pub l10n_parent: u32,
    pub slug: String,
    pub language_id: u32,
}

pub trait SlugCandidateProvider {
    /// All candidates that could serve `path` in the language. Several slug
    /// decompositions of one path may match; callers pick.
    fn candidates_for_path(&self, path: &str, language_id: u32) -> Result<Vec<SlugCandidate>>;
}

pub trait SlugProviderFactory {
    fn for_site(&self, site: &Site) -> Result<Box<dyn SlugCandidateProvider>>;
}

/// Looks up the page behind a tail path. Providers index a whole site, so one
/// is built per site identifier and kept for the resolver's lifetime.
pub struct SlugResolver<F> {
    factory: F,
    providers: HashMap<String, Box<dyn SlugCandidateProvider>>,
}

impl<F: SlugProviderFactory> SlugResolver<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            providers: HashMap::new(),
        }
    }

    pub fn cached_providers(&self) -> usize {
        self.providers.len()
    }

    pub fn find_candidate(
        &mut self,
        site: &Site,
        language: &SiteLanguage,
        tail: &str,
    ) -> Result<Option<SlugCandidate>> {
        let provider = match self.providers.entry(site.identifier.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                debug!(site = site.identifier.as_str(), "building slug candidate provider");
                entry.insert(self.factory.for_site(site)?)
            }
        };

        let path = format!("/{tail}");
        let candidates = provider.candidates_for_path(&path, language.language_id)?;
        let selected = candidates
            .into_iter()
            .find(|candidate| candidate.slug == path && candidate.uid.is_some());
        Ok(selected.map(|mut candidate| {
            candidate.language_id = language.language_id;
            candidate
        }))
    }
}

/// Slugs that may serve `path`: the path itself, then each shorter segment prefix.
pub fn candidate_slugs(path: &str) -> Vec<String> {
    let mut output = vec![path.to_string()];
    let mut current = path.trim_end_matches('/');
    if current != path && !current.is_empty() {
        output.push(current.to_string());
    }
    while let Some(index) = current.rfind('/') {
        if index == 0 {
            break;
        }
        current = &current[..index];
        output.push(current.to_string());
    }
    output
}

/// In-memory slug index for one site.
#[derive(Debug, Default)]
pub struct IndexedSlugProvider {
    by_slug: HashMap<(u32, String), Vec<SlugCandidate>>,
}

impl IndexedSlugProvider {
    pub fn from_candidates<I>(candidates: I) -> Self
    where
        I: IntoIterator<Item = SlugCandidate>,
    {
        let mut by_slug: HashMap<(u32, String), Vec<SlugCandidate>> = HashMap::new();
        for candidate in candidates {
            by_slug
                .entry((candidate.language_id, candidate.slug.clone()))
                .or_default()
                .push(candidate);
        }
        Self { by_slug }
    }

    pub fn len(&self) -> usize {
        self.by_slug.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_slug.is_empty()
    }
}

impl SlugCandidateProvider for IndexedSlugProvider {
    fn candidates_for_path(&self, path: &str, language_id: u32) -> Result<Vec<SlugCandidate>> {
        let mut output = Vec::new();
        for slug in candidate_slugs(path) {
            if let Some(found) = self.by_slug.get(&(language_id, slug)) {
                output.extend(found.iter().cloned());
            }
        }
        Ok(output)
    }
}
