use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};

use crate::model::ItemType;
use crate::runtime::{WorkspacePaths, normalize_for_display};

/// Upper bound for one JSON-lines record. Larger lines are rejected instead of buffered.
pub const MAX_JSONL_LINE_BYTES: usize = 16 * 1024 * 1024;

pub const ISSUES_DIR: &str = "issues";
pub const COMMENTS_DIR: &str = "comments";
pub const WIKIS_DIR: &str = "wikis";
pub const ISSUE_TYPES_DIR: &str = "issue_types";

/// Stable fingerprint of text content (hex sha-256 of the UTF-8 bytes).
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut output = String::with_capacity(64);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

/// Filesystem-safe rendition of a human key such as `PROJ-12`.
pub fn slugify(key: &str) -> String {
    let mut slug = String::with_capacity(key.len());
    for ch in key.trim().chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            slug.push(ch);
        } else {
            slug.push('_');
        }
    }
    let slug = slug.trim_matches('.').to_string();
    if slug.is_empty() {
        "_".to_string()
    } else {
        slug
    }
}

/// Workspace-relative content location for an item. Wiki and issue-type content is keyed
/// by numeric id so remote renames never move the file.
pub fn content_relative_path(item_type: ItemType, item_id: i64, item_key: &str) -> String {
    match item_type {
        ItemType::Issue => format!("{ISSUES_DIR}/{}.md", slugify(item_key)),
        ItemType::Comment => {
            let issue_key = item_key.split('#').next().unwrap_or(item_key);
            format!("{COMMENTS_DIR}/{}/{item_id}.md", slugify(issue_key))
        }
        ItemType::Wiki => format!("{WIKIS_DIR}/{item_id}/content.md"),
        ItemType::IssueTypeDescription => format!("{ISSUE_TYPES_DIR}/{item_id}/description.md"),
    }
}

pub fn sidecar_relative_path(item_type: ItemType, item_id: i64) -> Option<String> {
    match item_type {
        ItemType::Wiki => Some(format!("{WIKIS_DIR}/{item_id}/metadata.json")),
        ItemType::IssueTypeDescription => Some(format!("{ISSUE_TYPES_DIR}/{item_id}/metadata.json")),
        ItemType::Issue | ItemType::Comment => None,
    }
}

/// Reject paths that would leave the workspace or reach into version-control internals.
pub fn validate_scoped_path(paths: &WorkspacePaths, candidate: &Path) -> Result<()> {
    let absolute = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        paths.root.join(candidate)
    };
    let normalized = normalize_pathbuf(&absolute);
    let root = normalize_pathbuf(&paths.root);
    if !normalized.starts_with(&root) || normalized == root {
        bail!(
            "path escapes workspace directory: {}\nworkspace: {}",
            normalize_for_display(&normalized),
            normalize_for_display(&root)
        );
    }
    if normalized.starts_with(root.join(".git")) {
        bail!(
            "path points into version-control internals: {}",
            normalize_for_display(&normalized)
        );
    }
    Ok(())
}

/// Replace `path` with `content` so readers observe either the old or the new file, never a
/// partial one: write a sibling temp file, flush it to disk, then rename over the target.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    ensure_parent_dir(path)?;
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("path has no file name: {}", path.display()))?;
    let mut temp_name = std::ffi::OsString::from(".");
    temp_name.push(file_name);
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    let result = (|| -> Result<()> {
        let mut file = File::create(&temp_path)
            .with_context(|| format!("failed to create {}", temp_path.display()))?;
        file.write_all(content)
            .with_context(|| format!("failed to write {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", temp_path.display()))?;
        fs::rename(&temp_path, path).with_context(|| {
            format!(
                "failed to rename {} to {}",
                temp_path.display(),
                path.display()
            )
        })
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

/// Stream the non-blank lines of a JSON-lines file, refusing any line longer than
/// `max_line_bytes`. `visit` receives the 1-based line number and the line text.
pub fn for_each_jsonl_line<F>(path: &Path, max_line_bytes: usize, mut visit: F) -> Result<()>
where
    F: FnMut(usize, &str) -> Result<()>,
{
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let limit = u64::try_from(max_line_bytes)
        .unwrap_or(u64::MAX)
        .saturating_add(1);
    let mut buffer = Vec::new();
    let mut line_number = 0usize;

    loop {
        buffer.clear();
        line_number += 1;
        let read = (&mut reader)
            .take(limit)
            .read_until(b'\n', &mut buffer)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if read == 0 {
            break;
        }
        if buffer.last() == Some(&b'\n') {
            buffer.pop();
            if buffer.last() == Some(&b'\r') {
                buffer.pop();
            }
        } else if buffer.len() > max_line_bytes {
            bail!(
                "line {line_number} of {} exceeds the {max_line_bytes} byte limit",
                path.display()
            );
        }

        let line = std::str::from_utf8(&buffer).with_context(|| {
            format!("line {line_number} of {} is not valid UTF-8", path.display())
        })?;
        if line.trim().is_empty() {
            continue;
        }
        visit(line_number, line)?;
    }
    Ok(())
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))
}

/// Write item content below the workspace root after scoping the path.
pub fn write_workspace_file(paths: &WorkspacePaths, relative: &str, content: &str) -> Result<()> {
    let absolute = paths.absolute(relative);
    validate_scoped_path(paths, &absolute)?;
    write_atomic(&absolute, content.as_bytes())
}

pub fn read_workspace_file(paths: &WorkspacePaths, relative: &str) -> Result<String> {
    let absolute = paths.absolute(relative);
    validate_scoped_path(paths, &absolute)?;
    fs::read_to_string(&absolute).with_context(|| format!("failed to read {}", absolute.display()))
}

fn normalize_pathbuf(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(std::path::MAIN_SEPARATOR_STR)),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}
