use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{ResolveErrorKind, RouteError, UpdateError};
use crate::link::{LinkBuilder, PageReferenceSynthesizer, select_page};
use crate::record::{RedirectRecord, TargetType, build_probe_url, classify};
use crate::resolver::{HttpProbe, UrlResolver};
use crate::routing::RouteMatcher;
use crate::slugs::{SlugCandidate, SlugProviderFactory, SlugResolver};

/// Field values written back to a redirect record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedirectUpdate {
    pub target: String,
}

pub trait RedirectUpdater {
    /// Succeeds only when exactly one row changed.
    fn update(&mut self, uid: i64, values: &RedirectUpdate) -> std::result::Result<(), UpdateError>;
}

pub trait Confirm {
    fn confirm(&mut self, prompt: &str) -> bool;
}

/// Declines every prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decline;

impl Confirm for Decline {
    fn confirm(&mut self, _prompt: &str) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConvertOptions {
    pub dry_run: bool,
    pub interactive: bool,
    pub force_https: bool,
    pub always_link_to_original_language: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    SkippedWrongType,
    SkippedUnbuildableUrl,
    SkippedUnresolvable,
    SkippedNoRoute,
    SkippedNoCandidate,
    SkippedEmptySynthesis,
    Convertible,
    Failed,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SkippedWrongType => "skipped_wrong_type",
            Self::SkippedUnbuildableUrl => "skipped_unbuildable_url",
            Self::SkippedUnresolvable => "skipped_unresolvable",
            Self::SkippedNoRoute => "skipped_no_route",
            Self::SkippedNoCandidate => "skipped_no_candidate",
            Self::SkippedEmptySynthesis => "skipped_empty_synthesis",
            Self::Convertible => "convertible",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    DryRun,
    Updated,
    Declined,
    Failed,
}

impl UpdateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DryRun => "dry_run",
            Self::Updated => "updated",
            Self::Declined => "declined",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionResult {
    pub valid: bool,
    pub target: String,
    pub page_id: u32,
    pub language_id: u32,
    pub slug: String,
    pub original_target: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordOutcome {
    pub record_id: i64,
    pub decision: Decision,
    pub detail: String,
    pub original_target: String,
    pub error_kind: Option<ResolveErrorKind>,
    pub conversion: Option<ConversionResult>,
    pub update: Option<UpdateStatus>,
    pub update_error: Option<String>,
}

impl RecordOutcome {
    fn new(record: &RedirectRecord, decision: Decision, detail: String) -> Self {
        Self {
            record_id: record.uid,
            decision,
            detail,
            original_target: record.target.to_string(),
            error_kind: None,
            conversion: None,
            update: None,
            update_error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConvertSummary {
    pub total: usize,
    pub by_decision: BTreeMap<String, usize>,
    pub updated: usize,
    pub update_failures: usize,
    pub declined: usize,
}

impl ConvertSummary {
    pub fn from_outcomes(outcomes: &[RecordOutcome]) -> Self {
        let mut summary = Self {
            total: outcomes.len(),
            ..Self::default()
        };
        for outcome in outcomes {
            *summary
                .by_decision
                .entry(outcome.decision.as_str().to_string())
                .or_default() += 1;
            match outcome.update {
                Some(UpdateStatus::Updated) => summary.updated += 1,
                Some(UpdateStatus::Failed) => summary.update_failures += 1,
                Some(UpdateStatus::Declined) => summary.declined += 1,
                Some(UpdateStatus::DryRun) | None => {}
            }
        }
        summary
    }
}

/// Page reached by a URL, with the link that should replace the path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageInfo {
    pub site: String,
    pub matched_language_title: Option<String>,
    pub tail: String,
    pub candidate: SlugCandidate,
    pub page_id: u32,
    pub language_id: u32,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageLookup {
    Found(PageInfo),
    NoRoute(RouteError),
    NoCandidate {
        site: String,
        language_id: u32,
        slug: String,
    },
    EmptySynthesis {
        page_id: u32,
        language_id: u32,
    },
}

pub struct RedirectConverter<P, F, B> {
    resolver: UrlResolver<P>,
    matcher: RouteMatcher,
    slugs: SlugResolver<F>,
    links: PageReferenceSynthesizer<B>,
    default_force_https: bool,
}

impl<P, F, B> RedirectConverter<P, F, B>
where
    P: HttpProbe,
    F: SlugProviderFactory,
    B: LinkBuilder,
{
    pub fn new(
        resolver: UrlResolver<P>,
        matcher: RouteMatcher,
        slugs: SlugResolver<F>,
        links: PageReferenceSynthesizer<B>,
    ) -> Self {
        Self {
            resolver,
            matcher,
            slugs,
            links,
            default_force_https: false,
        }
    }

    pub fn with_default_force_https(mut self, force_https: bool) -> Self {
        self.default_force_https = force_https;
        self
    }

    pub fn resolver(&self) -> &UrlResolver<P> {
        &self.resolver
    }

    /// Runs every record through the pipeline in source order. Failures stay
    /// attached to their record; the batch always completes.
    pub fn convert<I>(
        &mut self,
        records: I,
        options: &ConvertOptions,
        updater: &mut dyn RedirectUpdater,
        confirm: &mut dyn Confirm,
    ) -> Vec<RecordOutcome>
    where
        I: IntoIterator<Item = RedirectRecord>,
    {
        let mut outcomes = Vec::new();
        for record in records {
            let mut outcome = self.check_record(&record, options);
            if outcome.decision == Decision::Convertible {
                apply_update(&record, &mut outcome, options, updater, confirm);
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    pub fn check_record(
        &mut self,
        record: &RedirectRecord,
        options: &ConvertOptions,
    ) -> RecordOutcome {
        let uid = record.uid;
        let original = record.target.to_string();

        let target_type = classify(&record.target);
        if target_type != TargetType::Path {
            debug!(
                uid,
                redirect_target = original.as_str(),
                "skipping, target type is {}",
                target_type.as_str()
            );
            return RecordOutcome::new(
                record,
                Decision::SkippedWrongType,
                format!("target type is {}, not path: {original}", target_type.as_str()),
            );
        }

        let url = build_probe_url(record, options.force_https || self.default_force_https);
        if url.is_empty() {
            debug!(uid, host = record.source_host.as_str(), "skipping, can't build URL");
            return RecordOutcome::new(
                record,
                Decision::SkippedUnbuildableUrl,
                format!(
                    "can't build URL: host={} target={original}",
                    record.source_host
                ),
            );
        }

        let effective_url = match self.resolver.resolve(&url) {
            Ok(effective_url) => effective_url,
            Err(resolve_error) => {
                debug!(uid, url = url.as_str(), "skipping, URL does not resolve: {resolve_error}");
                let mut outcome = RecordOutcome::new(
                    record,
                    Decision::SkippedUnresolvable,
                    format!("URL does not resolve to valid URL: {resolve_error}"),
                );
                outcome.error_kind = Some(resolve_error.kind());
                return outcome;
            }
        };

        let always_original = options.always_link_to_original_language;
        let lookup = match self.lookup_page(&effective_url, always_original) {
            Ok(lookup) => lookup,
            Err(lookup_error) => {
                warn!(uid, url = effective_url.as_str(), "lookup failed: {lookup_error:#}");
                return RecordOutcome::new(record, Decision::Failed, format!("{lookup_error:#}"));
            }
        };

        match lookup {
            PageLookup::NoRoute(route_error) => {
                warn!(uid, "skipping, no route: {route_error}");
                RecordOutcome::new(record, Decision::SkippedNoRoute, route_error.to_string())
            }
            PageLookup::NoCandidate {
                site,
                language_id,
                slug,
            } => {
                warn!(
                    uid,
                    site = site.as_str(),
                    language_id,
                    slug = slug.as_str(),
                    "skipping, no page for slug"
                );
                RecordOutcome::new(
                    record,
                    Decision::SkippedNoCandidate,
                    format!("no page with slug {slug} in site {site}, language {language_id}"),
                )
            }
            PageLookup::EmptySynthesis {
                page_id,
                language_id,
            } => {
                warn!(uid, page_id, language_id, "skipping, redirect has no page link");
                RecordOutcome::new(
                    record,
                    Decision::SkippedEmptySynthesis,
                    format!("empty page link for page {page_id}, language {language_id}"),
                )
            }
            PageLookup::Found(info) => {
                info!(
                    uid,
                    source = record.source_path.as_str(),
                    "target path {original} can be converted to {}",
                    info.target
                );
                let mut outcome = RecordOutcome::new(
                    record,
                    Decision::Convertible,
                    format!("{original} -> {}", info.target),
                );
                outcome.conversion = Some(ConversionResult {
                    valid: true,
                    target: info.target,
                    page_id: info.page_id,
                    language_id: info.language_id,
                    slug: info.candidate.slug,
                    original_target: original,
                    error: None,
                });
                outcome
            }
        }
    }

    /// Maps an already resolved URL to the page it shows.
    pub fn lookup_page(
        &mut self,
        url: &str,
        always_link_to_original_language: bool,
    ) -> Result<PageLookup> {
        let route = match self.matcher.match_route(url) {
            Ok(route) => route,
            Err(route_error) => return Ok(PageLookup::NoRoute(route_error)),
        };
        let slug = route.slug_path();
        let Some(candidate) = self
            .slugs
            .find_candidate(&route.site, &route.language, &route.tail)?
        else {
            return Ok(PageLookup::NoCandidate {
                site: route.site.identifier,
                language_id: route.language.language_id,
                slug,
            });
        };
        let Some(selection) = select_page(&candidate, always_link_to_original_language) else {
            return Ok(PageLookup::NoCandidate {
                site: route.site.identifier,
                language_id: route.language.language_id,
                slug,
            });
        };

        let target = self
            .links
            .synthesize(selection.page_id, selection.language_id);
        if target.is_empty() {
            return Ok(PageLookup::EmptySynthesis {
                page_id: selection.page_id,
                language_id: selection.language_id,
            });
        }
        Ok(PageLookup::Found(PageInfo {
            site: route.site.identifier,
            matched_language_title: route.language.title,
            tail: route.tail,
            candidate,
            page_id: selection.page_id,
            language_id: selection.language_id,
            target,
        }))
    }

    /// Follows redirects for `url`, then maps the effective URL to its page.
    pub fn url_to_page(
        &mut self,
        url: &str,
        always_link_to_original_language: bool,
    ) -> Result<(String, PageLookup)> {
        let effective_url = self.resolver.resolve(url)?;
        let lookup = self.lookup_page(&effective_url, always_link_to_original_language)?;
        Ok((effective_url, lookup))
    }
}

fn apply_update(
    record: &RedirectRecord,
    outcome: &mut RecordOutcome,
    options: &ConvertOptions,
    updater: &mut dyn RedirectUpdater,
    confirm: &mut dyn Confirm,
) {
    let Some(conversion) = &outcome.conversion else {
        return;
    };
    let target = conversion.target.clone();

    if options.dry_run {
        info!(uid = record.uid, "dry run, would set target to {target}");
        outcome.update = Some(UpdateStatus::DryRun);
        return;
    }

    if options.interactive {
        let prompt = format!(
            "Convert redirect uid={} source={}{} from {} to {target}?",
            record.uid, record.source_host, record.source_path, outcome.original_target
        );
        if !confirm.confirm(&prompt) {
            debug!(uid = record.uid, "update declined");
            outcome.update = Some(UpdateStatus::Declined);
            return;
        }
    }

    match updater.update(record.uid, &RedirectUpdate { target }) {
        Ok(()) => {
            info!(uid = record.uid, "redirect target updated");
            outcome.update = Some(UpdateStatus::Updated);
        }
        Err(update_error) => {
            error!(uid = record.uid, "update failed: {update_error}");
            outcome.update = Some(UpdateStatus::Failed);
            outcome.update_error = Some(update_error.to_string());
        }
    }
}
