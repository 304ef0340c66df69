use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::filesystem::{MAX_JSONL_LINE_BYTES, for_each_jsonl_line, sidecar_relative_path, write_atomic};
use crate::model::{AuditEntry, ItemIdentity, ItemType, MigrateItem, SidecarMetadata, WorkspaceMetadata};
use crate::runtime::WorkspacePaths;

/// Read every item from `items.jsonl`. A missing log is an error here.
pub fn read_items(path: &Path) -> Result<Vec<MigrateItem>> {
    let mut items = Vec::new();
    for_each_jsonl_line(path, MAX_JSONL_LINE_BYTES, |line_number, line| {
        let item: MigrateItem = serde_json::from_str(line).with_context(|| {
            format!("failed to parse item on line {line_number} of {}", path.display())
        })?;
        items.push(item);
        Ok(())
    })?;
    Ok(items)
}

/// Like [`read_items`], but an absent log means an empty workspace.
pub fn read_items_if_exists(path: &Path) -> Result<Vec<MigrateItem>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    read_items(path)
}

/// Rewrite the whole item log in one atomic replace.
pub fn write_items(path: &Path, items: &[MigrateItem]) -> Result<()> {
    let mut buffer = Vec::with_capacity(items.len() * 512);
    for item in items {
        serde_json::to_writer(&mut buffer, item)
            .with_context(|| format!("failed to serialize item {}", item.item_key))?;
        buffer.push(b'\n');
    }
    write_atomic(path, &buffer)
}

pub fn identity_set(items: &[MigrateItem]) -> BTreeSet<ItemIdentity> {
    items.iter().map(MigrateItem::identity).collect()
}

pub fn read_metadata(paths: &WorkspacePaths) -> Result<WorkspaceMetadata> {
    let raw = fs::read_to_string(&paths.metadata_path)
        .with_context(|| format!("failed to read {}", paths.metadata_path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", paths.metadata_path.display()))
}

pub fn write_metadata(paths: &WorkspacePaths, metadata: &WorkspaceMetadata) -> Result<()> {
    let mut raw =
        serde_json::to_vec_pretty(metadata).context("failed to serialize workspace metadata")?;
    raw.push(b'\n');
    write_atomic(&paths.metadata_path, &raw)
}

pub fn write_sidecar(
    paths: &WorkspacePaths,
    item_type: ItemType,
    sidecar: &SidecarMetadata,
) -> Result<Option<String>> {
    let Some(relative) = sidecar_relative_path(item_type, sidecar.id) else {
        return Ok(None);
    };
    let mut raw = serde_json::to_vec_pretty(sidecar).context("failed to serialize sidecar")?;
    raw.push(b'\n');
    write_atomic(&paths.absolute(&relative), &raw)?;
    Ok(Some(relative))
}

/// Append one audit entry. The audit log is never rewritten.
pub fn append_audit(paths: &WorkspacePaths, entry: &AuditEntry) -> Result<()> {
    let mut line = serde_json::to_vec(entry).context("failed to serialize audit entry")?;
    line.push(b'\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.logs_path)
        .with_context(|| format!("failed to open {}", paths.logs_path.display()))?;
    file.write_all(&line)
        .with_context(|| format!("failed to append to {}", paths.logs_path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush {}", paths.logs_path.display()))
}

pub fn read_audit(paths: &WorkspacePaths) -> Result<Vec<AuditEntry>> {
    if !paths.logs_path.exists() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for_each_jsonl_line(&paths.logs_path, MAX_JSONL_LINE_BYTES, |line_number, line| {
        let entry: AuditEntry = serde_json::from_str(line).with_context(|| {
            format!(
                "failed to parse audit entry on line {line_number} of {}",
                paths.logs_path.display()
            )
        })?;
        entries.push(entry);
        Ok(())
    })?;
    Ok(entries)
}
