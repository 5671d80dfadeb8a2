use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, params};
use serde::Serialize;
use tracing::debug;

use crate::convert::{RedirectUpdate, RedirectUpdater};
use crate::error::UpdateError;
use crate::record::{RedirectRecord, RedirectTarget, classify};
use crate::routing::Site;
use crate::slugs::{
    IndexedSlugProvider, SlugCandidate, SlugCandidateProvider, SlugProviderFactory,
};

/// Opens the redirect database with WAL and a busy timeout, so a second
/// process can read while a conversion run writes.
pub fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open redirect database {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

/// Reads live redirect records in uid order. Records flagged `protected` are
/// left out unless `include_protected` is set.
pub fn load_redirects(
    connection: &Connection,
    include_protected: bool,
) -> Result<Vec<RedirectRecord>> {
    let mut statement = connection
        .prepare(
            "SELECT uid, source_host, source_path, target, force_https
             FROM sys_redirect
             WHERE deleted = 0 AND disabled = 0 AND (?1 OR protected = 0)
             ORDER BY uid",
        )
        .context("failed to prepare redirect query")?;
    let rows = statement
        .query_map(params![include_protected], |row| {
            Ok(RedirectRecord {
                uid: row.get(0)?,
                source_host: row.get(1)?,
                source_path: row.get(2)?,
                target: target_from_value(row.get_ref(3)?),
                force_https: row.get::<_, i64>(4)? != 0,
            })
        })
        .context("failed to query redirects")?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row.context("failed to decode redirect row")?);
    }
    debug!(count = records.len(), include_protected, "loaded redirects");
    Ok(records)
}

fn target_from_value(value: ValueRef<'_>) -> RedirectTarget {
    match value {
        ValueRef::Integer(id) => RedirectTarget::Int(id),
        ValueRef::Real(number) => RedirectTarget::Str(number.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            RedirectTarget::Str(String::from_utf8_lossy(bytes).into_owned())
        }
        ValueRef::Null => RedirectTarget::Str(String::new()),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RedirectStats {
    pub redirects: usize,
    pub protected: usize,
    pub by_target_type: BTreeMap<String, usize>,
    pub pages: usize,
}

pub fn redirect_stats(connection: &Connection) -> Result<RedirectStats> {
    let records = load_redirects(connection, true)?;
    let mut by_target_type = BTreeMap::new();
    for record in &records {
        *by_target_type
            .entry(classify(&record.target).as_str().to_string())
            .or_insert(0) += 1;
    }
    let protected: i64 = connection
        .query_row(
            "SELECT COUNT(*) FROM sys_redirect WHERE deleted = 0 AND disabled = 0 AND protected = 1",
            [],
            |row| row.get(0),
        )
        .context("failed to count protected redirects")?;
    let pages: i64 = connection
        .query_row("SELECT COUNT(*) FROM pages WHERE deleted = 0", [], |row| {
            row.get(0)
        })
        .context("failed to count pages")?;
    Ok(RedirectStats {
        redirects: records.len(),
        protected: usize::try_from(protected).unwrap_or(0),
        by_target_type,
        pages: usize::try_from(pages).unwrap_or(0),
    })
}

/// Writes converted targets back to `sys_redirect`.
pub struct SqliteRedirectStore {
    connection: Connection,
}

impl SqliteRedirectStore {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self::new(open_connection(db_path)?))
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl RedirectUpdater for SqliteRedirectStore {
    fn update(
        &mut self,
        uid: i64,
        values: &RedirectUpdate,
    ) -> std::result::Result<(), UpdateError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        let changed = self
            .connection
            .execute(
                "UPDATE sys_redirect SET target = ?1, updatedon = ?2 WHERE uid = ?3 AND deleted = 0",
                params![values.target, i64::try_from(now).unwrap_or(i64::MAX), uid],
            )
            .map_err(|error| UpdateError::Storage(error.to_string()))?;
        if changed != 1 {
            return Err(UpdateError::RowCount { uid, changed });
        }
        Ok(())
    }
}

/// Slug index backed by the `pages` table.
pub struct SqlitePageIndex {
    connection: Connection,
}

impl SqlitePageIndex {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self::new(open_connection(db_path)?))
    }

    fn site_candidates(&self, site: &str) -> Result<Vec<SlugCandidate>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT uid, sys_language_uid, l10n_parent, slug
                 FROM pages
                 WHERE site = ?1 AND deleted = 0
                 ORDER BY uid",
            )
            .context("failed to prepare page slug query")?;
        let rows = statement
            .query_map([site], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .with_context(|| format!("failed to query page slugs for site {site}"))?;

        let mut candidates = Vec::new();
        for row in rows {
            let (uid, language_id, l10n_parent, slug) =
                row.with_context(|| format!("failed to decode page row for site {site}"))?;
            // Links address the default-language page; the language travels separately.
            let page_id = if language_id > 0 && l10n_parent > 0 {
                l10n_parent
            } else {
                uid
            };
            candidates.push(SlugCandidate {
                uid: u32::try_from(page_id).ok().filter(|id| *id > 0),
                l10n_parent: u32::try_from(l10n_parent).unwrap_or(0),
                slug,
                language_id: u32::try_from(language_id).unwrap_or(0),
            });
        }
        Ok(candidates)
    }
}

impl SlugProviderFactory for SqlitePageIndex {
    fn for_site(&self, site: &Site) -> Result<Box<dyn SlugCandidateProvider>> {
        let candidates = self.site_candidates(&site.identifier)?;
        let provider = IndexedSlugProvider::from_candidates(candidates);
        debug!(site = site.identifier.as_str(), slugs = provider.len(), "indexed page slugs");
        Ok(Box::new(provider))
    }
}
