use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::notation::DetectedMode;

/// The four kinds of remote rich-text content the migration understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Issue,
    Comment,
    Wiki,
    IssueTypeDescription,
}

impl ItemType {
    pub const ALL: [ItemType; 4] = [
        ItemType::Issue,
        ItemType::Comment,
        ItemType::Wiki,
        ItemType::IssueTypeDescription,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Comment => "comment",
            Self::Wiki => "wiki",
            Self::IssueTypeDescription => "issue_type_description",
        }
    }

    /// Wiki pages and issue types can be renamed remotely, so their identity is the numeric id.
    pub fn is_id_keyed(self) -> bool {
        matches!(self, Self::Wiki | Self::IssueTypeDescription)
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "issue" | "issues" => Ok(Self::Issue),
            "comment" | "comments" => Ok(Self::Comment),
            "wiki" | "wikis" => Ok(Self::Wiki),
            "issue_type_description" | "issue_type" | "issue_types" | "issuetype" | "type" => {
                Ok(Self::IssueTypeDescription)
            }
            other => bail!(
                "unknown item type `{other}` (expected issue, comment, wiki, issue_type_description)"
            ),
        }
    }
}

/// Parse a comma separated type filter. An empty filter selects every type.
pub fn parse_item_types(raw: &str) -> Result<Vec<ItemType>> {
    let mut types = Vec::new();
    for part in raw.split(',') {
        if part.trim().is_empty() {
            continue;
        }
        let parsed = part.parse::<ItemType>()?;
        if !types.contains(&parsed) {
            types.push(parsed);
        }
    }
    Ok(types)
}

/// Stable deduplication key for an item across runs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ItemIdentity {
    Key(ItemType, String),
    Id(ItemType, i64),
}

/// One conversion unit, persisted as one line of `items.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrateItem {
    pub item_type: ItemType,
    #[serde(default)]
    pub item_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i64>,
    pub item_key: String,
    #[serde(default)]
    pub url: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub detected_mode: DetectedMode,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default)]
    pub warnings: BTreeMap<String, usize>,
    #[serde(default)]
    pub warning_lines: BTreeMap<String, Vec<usize>>,
    #[serde(default)]
    pub changed: bool,
    pub input_hash: String,
    pub output_hash: String,
    #[serde(default)]
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_error: Option<String>,
}

impl MigrateItem {
    pub fn identity(&self) -> ItemIdentity {
        if self.item_type.is_id_keyed() {
            ItemIdentity::Id(self.item_type, self.item_id)
        } else {
            ItemIdentity::Key(self.item_type, self.item_key.clone())
        }
    }

    pub fn warning_total(&self) -> usize {
        self.warnings.values().sum()
    }

    /// Whether the item answers to an operator-supplied target (key, id or path).
    pub fn matches_target(&self, target: &str) -> bool {
        let target = target.trim();
        if target.is_empty() {
            return false;
        }
        self.item_key.eq_ignore_ascii_case(target)
            || self.path == target
            || (self.item_id != 0 && self.item_id.to_string() == target)
    }
}

/// Identity key of a comment item, derived from its issue key and comment id.
pub fn comment_item_key(issue_key: &str, comment_id: i64) -> String {
    format!("{issue_key}#comment-{comment_id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceMetadata {
    pub project_key: String,
    pub project_name: String,
    #[serde(default)]
    pub project_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub base_branch: String,
}

/// Diagnostic contents of the lock file. The file's existence is the lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    pub command: String,
}

/// Sidecar written next to wiki and issue-type content, whose names can change remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarMetadata {
    pub id: i64,
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Apply,
    Rollback,
    Clean,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::Rollback => "rollback",
            Self::Clean => "clean",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Applied,
    DryRun,
    NoChange,
    Rejected,
    Skipped,
    Error,
    RolledBack,
    NoSnapshot,
    Cleanup,
}

impl AuditStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::DryRun => "dry_run",
            Self::NoChange => "no_change",
            Self::Rejected => "rejected",
            Self::Skipped => "skipped",
            Self::Error => "error",
            Self::RolledBack => "rolled_back",
            Self::NoSnapshot => "no_snapshot",
            Self::Cleanup => "cleanup",
        }
    }
}

/// One line of the append-only `logs.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub status: AuditStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<ItemType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AuditEntry {
    pub fn for_item(
        action: AuditAction,
        status: AuditStatus,
        item: &MigrateItem,
        message: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            status,
            item_type: Some(item.item_type),
            item_key: Some(item.item_key.clone()),
            url: Some(item.url.clone()).filter(|url| !url.is_empty()),
            message,
        }
    }
}
