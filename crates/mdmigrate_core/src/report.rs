use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::apply::unified_diff;
use crate::config::MigrateConfig;
use crate::filesystem::read_workspace_file;
use crate::git::{GitCli, VersionControl};
use crate::lock::read_lock;
use crate::model::{AuditEntry, ItemType, LockRecord, MigrateItem};
use crate::runtime::{WorkspacePaths, ensure_workspace_initialized};
use crate::store::{read_audit, read_items_if_exists, read_metadata};

pub const DEFAULT_LOG_LIMIT: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeCounts {
    pub total: usize,
    pub applied: usize,
    pub pending: usize,
    pub changed: usize,
    pub errors: usize,
}

impl TypeCounts {
    fn add(&mut self, item: &MigrateItem) {
        self.total += 1;
        if item.applied {
            self.applied += 1;
        } else if item.changed {
            self.pending += 1;
        }
        if item.changed {
            self.changed += 1;
        }
        if item.apply_error.is_some() || item.rollback_error.is_some() {
            self.errors += 1;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub project_key: String,
    pub project_name: String,
    pub base_branch: String,
    pub current_branch: Option<String>,
    pub lock: Option<LockRecord>,
    pub lock_present: bool,
    pub totals: TypeCounts,
    pub by_type: BTreeMap<String, TypeCounts>,
    pub warnings_total: usize,
    pub audit_entries: usize,
}

pub fn workspace_status(paths: &WorkspacePaths, config: &MigrateConfig) -> Result<StatusReport> {
    workspace_status_with(paths, &GitCli::new(&paths.root, config.git_identity()))
}

pub fn workspace_status_with<V: VersionControl>(
    paths: &WorkspacePaths,
    vcs: &V,
) -> Result<StatusReport> {
    ensure_workspace_initialized(paths)?;
    let metadata = read_metadata(paths)?;
    let items = read_items_if_exists(&paths.items_path)?;

    let mut totals = TypeCounts::default();
    let mut by_type: BTreeMap<String, TypeCounts> = ItemType::ALL
        .iter()
        .map(|item_type| (item_type.as_str().to_string(), TypeCounts::default()))
        .collect();
    let mut warnings_total = 0;
    for item in &items {
        totals.add(item);
        by_type
            .entry(item.item_type.as_str().to_string())
            .or_default()
            .add(item);
        warnings_total += item.warning_total();
    }

    Ok(StatusReport {
        project_key: metadata.project_key,
        project_name: metadata.project_name,
        base_branch: metadata.base_branch,
        current_branch: vcs.current_branch().ok(),
        lock: read_lock(&paths.lock_path),
        lock_present: paths.lock_path.exists(),
        totals,
        by_type,
        warnings_total,
        audit_entries: read_audit(paths)?.len(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ListEntry {
    pub item_type: ItemType,
    pub item_key: String,
    pub path: String,
    pub url: String,
    pub detected_mode: String,
    pub score: i64,
    pub changed: bool,
    pub applied: bool,
    pub warnings: usize,
    pub error: Option<String>,
    /// Pristine snapshot against current on-disk content; `None` when identical or not
    /// requested.
    pub diff: Option<String>,
}

pub fn list_items(
    paths: &WorkspacePaths,
    config: &MigrateConfig,
    with_diff: bool,
) -> Result<Vec<ListEntry>> {
    list_items_with(
        paths,
        &GitCli::new(&paths.root, config.git_identity()),
        with_diff,
    )
}

pub fn list_items_with<V: VersionControl>(
    paths: &WorkspacePaths,
    vcs: &V,
    with_diff: bool,
) -> Result<Vec<ListEntry>> {
    ensure_workspace_initialized(paths)?;
    let items = read_items_if_exists(&paths.items_path)?;
    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let diff = if with_diff {
            pristine_diff(paths, vcs, &item)?
        } else {
            None
        };
        entries.push(ListEntry {
            item_type: item.item_type,
            detected_mode: item.detected_mode.as_str().to_string(),
            score: item.score,
            changed: item.changed,
            applied: item.applied,
            warnings: item.warning_total(),
            error: item.apply_error.clone().or(item.rollback_error.clone()),
            diff,
            item_key: item.item_key,
            path: item.path,
            url: item.url,
        });
    }
    Ok(entries)
}

fn pristine_diff<V: VersionControl>(
    paths: &WorkspacePaths,
    vcs: &V,
    item: &MigrateItem,
) -> Result<Option<String>> {
    let Some(revision) = vcs.first_revision(&item.path)? else {
        return Ok(None);
    };
    let pristine = vcs
        .show_file(&revision, &item.path)
        .with_context(|| format!("failed to read {} at {revision}", item.path))?;
    let current = read_workspace_file(paths, &item.path)?;
    if pristine == current {
        return Ok(None);
    }
    Ok(Some(unified_diff(&pristine, &current, &item.path)))
}

/// Most recent audit entries, oldest first. `limit` of `None` returns the whole log.
pub fn read_logs(paths: &WorkspacePaths, limit: Option<usize>) -> Result<Vec<AuditEntry>> {
    ensure_workspace_initialized(paths)?;
    let mut entries = read_audit(paths)?;
    if let Some(limit) = limit
        && entries.len() > limit
    {
        entries.drain(..entries.len() - limit);
    }
    Ok(entries)
}
