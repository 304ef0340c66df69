use std::collections::BTreeSet;
use std::fs;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::MigrateConfig;
use crate::filesystem::{content_hash, content_relative_path, write_workspace_file};
use crate::git::{GitCli, VersionControl, ensure_gitignore};
use crate::lock::WorkspaceLock;
use crate::model::{
    AuditAction, AuditEntry, AuditStatus, ItemIdentity, MigrateItem, SidecarMetadata,
    WorkspaceMetadata,
};
use crate::notation::{ConvertOptions, ConvertResult, Rule, convert};
use crate::remote::{
    ContentGateway, HttpGateway, HttpGatewayConfig, RemoteContent, RemoteEntry, RemoteProject,
};
use crate::runtime::{
    CONFIG_FILENAME, GITIGNORE_FILENAME, ITEMS_FILENAME, LOCK_FILENAME, METADATA_FILENAME,
    WorkspacePaths, ensure_workspace_initialized, normalize_for_display,
};
use crate::store::{
    append_audit, identity_set, read_items_if_exists, read_metadata, write_items,
    write_metadata, write_sidecar,
};

/// Converter settings shared by every item of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversionSettings {
    pub excluded_rules: BTreeSet<Rule>,
    pub force: bool,
}

impl ConversionSettings {
    pub fn from_config(config: &MigrateConfig) -> Result<Self> {
        Ok(Self {
            excluded_rules: config.excluded_rules()?,
            force: config.convert.force,
        })
    }

    pub fn options_for(&self, item: &MigrateItem, remote: &RemoteContent) -> ConvertOptions {
        ConvertOptions {
            force: self.force,
            item_key: Some(item.item_key.clone()),
            attachment_names: remote.attachment_names.clone(),
            excluded_rules: self.excluded_rules.clone(),
        }
    }
}

/// Copy converter diagnostics onto the item record.
pub fn record_diagnostics(item: &mut MigrateItem, result: &ConvertResult) {
    item.detected_mode = result.mode;
    item.score = result.score;
    item.rules = result.rule_names();
    item.warnings = result.warnings.clone();
    item.warning_lines = result.warning_lines.clone();
    item.changed = result.changed;
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub project_key: String,
    pub space_url: Option<String>,
    pub with_comments: bool,
    pub base_branch: String,
    pub settings: ConversionSettings,
}

#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    pub with_comments: bool,
    pub force_lock: bool,
    pub settings: ConversionSettings,
    pub command: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotReport {
    pub project_key: String,
    pub base_branch: String,
    pub listed: usize,
    pub added: usize,
    pub skipped_existing: usize,
    pub failed: Vec<String>,
    pub items_total: usize,
    pub committed: bool,
    pub request_count: usize,
}

impl SnapshotReport {
    fn new(project_key: &str, base_branch: &str) -> Self {
        Self {
            project_key: project_key.to_string(),
            base_branch: base_branch.to_string(),
            listed: 0,
            added: 0,
            skipped_existing: 0,
            failed: Vec::new(),
            items_total: 0,
            committed: false,
            request_count: 0,
        }
    }
}

pub fn init_workspace(
    paths: &WorkspacePaths,
    config: &MigrateConfig,
    options: &InitOptions,
) -> Result<SnapshotReport> {
    let mut gateway = HttpGateway::new(HttpGatewayConfig::from_config(config)?)?;
    let vcs = GitCli::new(&paths.root, config.git_identity());
    let options = InitOptions {
        space_url: Some(gateway.space_url().to_string()),
        ..options.clone()
    };
    init_workspace_with(paths, &options, &mut gateway, &vcs)
}

pub fn snapshot_append(
    paths: &WorkspacePaths,
    config: &MigrateConfig,
    options: &SnapshotOptions,
) -> Result<SnapshotReport> {
    let mut gateway = HttpGateway::new(HttpGatewayConfig::from_config(config)?)?;
    let vcs = GitCli::new(&paths.root, config.git_identity());
    snapshot_append_with(paths, options, &mut gateway, &vcs)
}

/// Create the workspace, its repository and the initial snapshot of every remote item.
pub fn init_workspace_with<G, V>(
    paths: &WorkspacePaths,
    options: &InitOptions,
    gateway: &mut G,
    vcs: &V,
) -> Result<SnapshotReport>
where
    G: ContentGateway,
    V: VersionControl,
{
    let project_key = options.project_key.trim();
    if project_key.is_empty() {
        bail!("init requires a project key");
    }
    if paths.metadata_path.exists() {
        bail!(
            "workspace is already initialized: {}\nUse `mdmigrate snapshot --append` to pick up new items",
            normalize_for_display(&paths.metadata_path)
        );
    }
    fs::create_dir_all(&paths.root).with_context(|| {
        format!(
            "failed to create workspace directory {}",
            paths.root.display()
        )
    })?;

    let project = gateway
        .get_project(project_key)
        .with_context(|| format!("failed to load project {project_key}"))?;

    let base_branch = if vcs.init_if_absent(&options.base_branch)? {
        options.base_branch.clone()
    } else {
        let existing = vcs.current_branch()?;
        debug!(branch = %existing, "reusing existing repository branch");
        existing
    };
    ensure_gitignore(paths)?;

    let now = Utc::now();
    let metadata = WorkspaceMetadata {
        project_key: project.key.clone(),
        project_name: project.name.clone(),
        project_id: project.id,
        space_url: options.space_url.clone(),
        created_at: now,
        updated_at: now,
        base_branch: base_branch.clone(),
    };
    write_metadata(paths, &metadata)?;

    let mut report = SnapshotReport::new(&project.key, &base_branch);
    let mut items = Vec::new();
    let mut staged = snapshot_project(
        paths,
        gateway,
        &project,
        options.with_comments,
        &options.settings,
        &mut items,
        &mut report,
    )?;
    write_items(&paths.items_path, &items)?;

    staged.extend([
        ITEMS_FILENAME.to_string(),
        METADATA_FILENAME.to_string(),
        GITIGNORE_FILENAME.to_string(),
    ]);
    vcs.add(&staged)?;
    report.committed = vcs.commit(&format!(
        "snapshot: init {} ({} items)",
        project.key,
        items.len()
    ))?;
    report.items_total = items.len();
    report.request_count = gateway.request_count();
    info!(
        project = %project.key,
        items = items.len(),
        failed = report.failed.len(),
        "workspace initialized"
    );
    Ok(report)
}

/// Snapshot remote items whose identity is not yet tracked.
pub fn snapshot_append_with<G, V>(
    paths: &WorkspacePaths,
    options: &SnapshotOptions,
    gateway: &mut G,
    vcs: &V,
) -> Result<SnapshotReport>
where
    G: ContentGateway,
    V: VersionControl,
{
    ensure_workspace_initialized(paths)?;
    let lock = WorkspaceLock::acquire(paths, options.force_lock, &options.command)?;

    let mut metadata = read_metadata(paths)?;
    if vcs.init_if_absent(&metadata.base_branch)? {
        warn!(
            root = %normalize_for_display(&paths.root),
            "repository was missing; re-initialized"
        );
    }
    ensure_gitignore(paths)?;

    let project = gateway
        .get_project(&metadata.project_key)
        .with_context(|| format!("failed to load project {}", metadata.project_key))?;
    let mut items = read_items_if_exists(&paths.items_path)?;
    let mut report = SnapshotReport::new(&project.key, &metadata.base_branch);
    let mut staged = snapshot_project(
        paths,
        gateway,
        &project,
        options.with_comments,
        &options.settings,
        &mut items,
        &mut report,
    )?;

    metadata.project_name = project.name.clone();
    metadata.updated_at = Utc::now();
    write_metadata(paths, &metadata)?;
    write_items(&paths.items_path, &items)?;

    staged.extend([
        ITEMS_FILENAME.to_string(),
        METADATA_FILENAME.to_string(),
        GITIGNORE_FILENAME.to_string(),
    ]);
    vcs.add(&staged)?;
    report.committed = if report.added > 0 {
        vcs.commit(&format!(
            "snapshot: append {} ({} new items)",
            project.key, report.added
        ))?
    } else {
        false
    };
    report.items_total = items.len();
    report.request_count = gateway.request_count();
    lock.release()?;
    Ok(report)
}

/// List every remote entry of the project and snapshot the untracked ones into `items`.
/// Listing failures abort; per-item fetch failures are recorded in the report.
fn snapshot_project<G: ContentGateway>(
    paths: &WorkspacePaths,
    gateway: &mut G,
    project: &RemoteProject,
    with_comments: bool,
    settings: &ConversionSettings,
    items: &mut Vec<MigrateItem>,
    report: &mut SnapshotReport,
) -> Result<Vec<String>> {
    let mut known: BTreeSet<ItemIdentity> = identity_set(items);
    let mut entries = Vec::new();
    for issue in gateway
        .list_issues(project)
        .context("failed to list issues")?
    {
        let comments = if with_comments {
            gateway
                .list_comments(&issue)
                .with_context(|| format!("failed to list comments of {}", issue.key))?
        } else {
            Vec::new()
        };
        entries.push(issue);
        entries.extend(comments);
    }
    entries.extend(gateway.list_wikis(project).context("failed to list wikis")?);
    entries.extend(
        gateway
            .list_issue_types(project)
            .context("failed to list issue types")?,
    );

    let mut staged = Vec::new();
    for entry in entries {
        report.listed += 1;
        let mut item = item_from_entry(&entry);
        if !known.insert(item.identity()) {
            report.skipped_existing += 1;
            continue;
        }
        match snapshot_item(paths, gateway, settings, &mut item) {
            Ok(written) => {
                staged.extend(written);
                items.push(item);
                report.added += 1;
            }
            Err(error) => {
                warn!(item = %entry.key, error = %format!("{error:#}"), "snapshot failed");
                known.remove(&item.identity());
                report.failed.push(format!("{}: {error:#}", entry.key));
            }
        }
    }
    Ok(staged)
}

fn item_from_entry(entry: &RemoteEntry) -> MigrateItem {
    MigrateItem {
        item_type: entry.item_type,
        item_id: entry.id,
        parent_id: entry.parent_id,
        item_key: entry.key.clone(),
        url: entry.url.clone(),
        path: content_relative_path(entry.item_type, entry.id, &entry.key),
        fetched_at: None,
        updated_at: None,
        detected_mode: Default::default(),
        score: 0,
        rules: Vec::new(),
        warnings: Default::default(),
        warning_lines: Default::default(),
        changed: false,
        input_hash: String::new(),
        output_hash: String::new(),
        applied: false,
        applied_at: None,
        apply_error: None,
        rollback_at: None,
        rollback_error: None,
    }
}

/// Fetch one item, write its raw content and sidecar, and fill in hashes and a preview of
/// the conversion diagnostics. Returns the workspace-relative paths written.
fn snapshot_item<G: ContentGateway>(
    paths: &WorkspacePaths,
    gateway: &mut G,
    settings: &ConversionSettings,
    item: &mut MigrateItem,
) -> Result<Vec<String>> {
    let remote = gateway
        .fetch_current(item)
        .with_context(|| format!("failed to fetch {}", item.item_key))?;
    if item.item_type.is_id_keyed()
        && let Some(name) = remote.name.as_deref().map(str::trim)
        && !name.is_empty()
    {
        item.item_key = name.to_string();
    }

    write_workspace_file(paths, &item.path, &remote.content)?;
    let hash = content_hash(&remote.content);
    item.input_hash = hash.clone();
    item.output_hash = hash;
    item.fetched_at = Some(Utc::now());
    item.updated_at = remote.updated_at.clone();
    let preview = convert(&remote.content, &settings.options_for(item, &remote));
    record_diagnostics(item, &preview);

    let mut written = vec![item.path.clone()];
    if let Some(sidecar) = write_item_sidecar(paths, item)? {
        written.push(sidecar);
    }
    debug!(item = %item.item_key, path = %item.path, mode = %item.detected_mode, "snapshotted");
    Ok(written)
}

/// Write the sidecar for id-keyed items. Returns its relative path when one was written.
pub fn write_item_sidecar(paths: &WorkspacePaths, item: &MigrateItem) -> Result<Option<String>> {
    write_sidecar(
        paths,
        item.item_type,
        &SidecarMetadata {
            id: item.item_id,
            name: item.item_key.clone(),
            url: item.url.clone(),
            updated_at: item.updated_at.clone(),
        },
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanReport {
    pub removed_entries: Vec<String>,
    pub removed_files: usize,
}

const PRESERVED_ON_CLEAN: [&str; 4] = [METADATA_FILENAME, CONFIG_FILENAME, LOCK_FILENAME, ".env"];

/// Remove every workspace entry except the metadata record and local configuration.
/// `confirmed` must be true; interactive confirmation is the caller's job.
pub fn clean_workspace(
    paths: &WorkspacePaths,
    confirmed: bool,
    command: &str,
) -> Result<CleanReport> {
    ensure_workspace_initialized(paths)?;
    if !confirmed {
        bail!("clean erases the workspace history and content; re-run with --force to confirm");
    }
    let lock = WorkspaceLock::acquire(paths, false, command)?;

    let mut report = CleanReport {
        removed_entries: Vec::new(),
        removed_files: 0,
    };
    let mut entries = fs::read_dir(&paths.root)
        .with_context(|| format!("failed to read {}", paths.root.display()))?
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("failed to read {}", paths.root.display()))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        if PRESERVED_ON_CLEAN.contains(&name.as_str()) {
            continue;
        }
        let path = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to inspect {}", path.display()))?;
        if file_type.is_dir() {
            report.removed_files += WalkDir::new(&path)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|walked| !walked.file_type().is_dir())
                .count();
            fs::remove_dir_all(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        } else {
            report.removed_files += 1;
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        report.removed_entries.push(name);
    }

    append_audit(
        paths,
        &AuditEntry {
            timestamp: Utc::now(),
            action: AuditAction::Clean,
            status: AuditStatus::Cleanup,
            item_type: None,
            item_key: None,
            url: None,
            message: Some(format!(
                "removed {} entries ({} files)",
                report.removed_entries.len(),
                report.removed_files
            )),
        },
    )?;
    lock.release()?;
    info!(removed = report.removed_files, "workspace cleaned");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::{
        ConversionSettings, InitOptions, SnapshotOptions, clean_workspace, init_workspace_with,
        snapshot_append_with,
    };
    use crate::model::{AuditStatus, ItemType};
    use crate::notation::DetectedMode;
    use crate::runtime::WorkspacePaths;
    use crate::store::{read_audit, read_items, read_metadata};
    use crate::testing::{MemoryVcs, MockGateway};

    fn init_options(with_comments: bool) -> InitOptions {
        InitOptions {
            project_key: "PRJ".to_string(),
            space_url: Some("https://space.test".to_string()),
            with_comments,
            base_branch: "main".to_string(),
            settings: ConversionSettings::default(),
        }
    }

    fn append_options() -> SnapshotOptions {
        SnapshotOptions {
            with_comments: false,
            force_lock: false,
            settings: ConversionSettings::default(),
            command: "snapshot --append".to_string(),
        }
    }

    fn sample_remote() -> MockGateway {
        MockGateway::new("PRJ")
            .with_issue(1, "PRJ-1", "* Title\n''bold''")
            .with_comment(1, "PRJ-1", 501, "plain comment")
            .with_wiki(10, "Home", "** Section")
            .with_issue_type(3, "Bug", "{code}\nx\n{/code}")
    }

    #[test]
    fn init_snapshots_every_item_and_commits_once() {
        let temp = tempdir().expect("tempdir");
        let paths = WorkspacePaths::at(&temp.path().join("ws"));
        let mut gateway = sample_remote();
        let vcs = MemoryVcs::new(&paths.root);

        let report =
            init_workspace_with(&paths, &init_options(false), &mut gateway, &vcs).expect("init");
        assert_eq!(report.added, 3);
        assert!(report.committed);
        assert_eq!(vcs.messages(), vec!["snapshot: init PRJ (3 items)"]);

        let items = read_items(&paths.items_path).expect("items");
        let keys: Vec<&str> = items.iter().map(|item| item.item_key.as_str()).collect();
        assert_eq!(keys, vec!["PRJ-1", "Home", "Bug"]);
        let issue = &items[0];
        assert_eq!(issue.path, "issues/PRJ-1.md");
        assert_eq!(issue.input_hash, issue.output_hash);
        assert_eq!(issue.detected_mode, DetectedMode::Legacy);
        assert!(issue.rules.contains(&"bold".to_string()));
        assert_eq!(
            fs::read_to_string(paths.absolute("issues/PRJ-1.md")).expect("content"),
            "* Title\n''bold''"
        );
        assert!(paths.absolute("wikis/10/metadata.json").exists());
        let metadata = read_metadata(&paths).expect("metadata");
        assert_eq!(metadata.project_id, 77);
        assert_eq!(metadata.base_branch, "main");
        assert_eq!(metadata.space_url.as_deref(), Some("https://space.test"));

        let again = init_workspace_with(&paths, &init_options(false), &mut gateway, &vcs);
        assert!(again.expect_err("second init").to_string().contains("already initialized"));
    }

    #[test]
    fn init_with_comments_includes_comment_items() {
        let temp = tempdir().expect("tempdir");
        let paths = WorkspacePaths::at(temp.path());
        let mut gateway = sample_remote();
        let vcs = MemoryVcs::new(&paths.root);

        init_workspace_with(&paths, &init_options(true), &mut gateway, &vcs).expect("init");
        let items = read_items(&paths.items_path).expect("items");
        let comment = items
            .iter()
            .find(|item| item.item_type == ItemType::Comment)
            .expect("comment item");
        assert_eq!(comment.item_key, "PRJ-1#comment-501");
        assert_eq!(comment.parent_id, Some(1));
        assert_eq!(comment.path, "comments/PRJ-1/501.md");
    }

    #[test]
    fn fetch_failures_are_reported_not_fatal() {
        let temp = tempdir().expect("tempdir");
        let paths = WorkspacePaths::at(temp.path());
        let mut gateway = sample_remote();
        gateway.fail_fetch.insert("Home".to_string());
        let vcs = MemoryVcs::new(&paths.root);

        let report =
            init_workspace_with(&paths, &init_options(false), &mut gateway, &vcs).expect("init");
        assert_eq!(report.added, 2);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].starts_with("Home:"));
    }

    #[test]
    fn append_adds_only_new_identities() {
        let temp = tempdir().expect("tempdir");
        let paths = WorkspacePaths::at(temp.path());
        let mut gateway = sample_remote();
        let vcs = MemoryVcs::new(&paths.root);
        init_workspace_with(&paths, &init_options(false), &mut gateway, &vcs).expect("init");

        let unchanged =
            snapshot_append_with(&paths, &append_options(), &mut gateway, &vcs).expect("append");
        assert_eq!(unchanged.added, 0);
        assert_eq!(unchanged.skipped_existing, 3);
        assert!(!unchanged.committed);

        gateway.record_mut(ItemType::Wiki, 10).expect("wiki").entry.key = "Start".to_string();
        gateway = gateway.with_issue(2, "PRJ-2", "new issue");
        let report =
            snapshot_append_with(&paths, &append_options(), &mut gateway, &vcs).expect("append");
        assert_eq!(report.added, 1);
        assert_eq!(report.items_total, 4);
        assert!(report.committed);
        assert!(!paths.lock_path.exists());
        assert_eq!(
            vcs.messages().last().map(String::as_str),
            Some("snapshot: append PRJ (1 new items)")
        );
    }

    #[test]
    fn clean_requires_confirmation_and_keeps_metadata() {
        let temp = tempdir().expect("tempdir");
        let paths = WorkspacePaths::at(temp.path());
        let mut gateway = sample_remote();
        let vcs = MemoryVcs::new(&paths.root);
        init_workspace_with(&paths, &init_options(false), &mut gateway, &vcs).expect("init");
        fs::write(&paths.config_path, "[convert]\n").expect("config");

        assert!(clean_workspace(&paths, false, "clean").is_err());
        let report = clean_workspace(&paths, true, "clean --force").expect("clean");
        assert!(report.removed_entries.contains(&"issues".to_string()));
        assert!(report.removed_files >= 4);
        assert!(paths.metadata_path.exists());
        assert!(paths.config_path.exists());
        assert!(!paths.items_path.exists());
        assert!(!paths.lock_path.exists());

        let audit = read_audit(&paths).expect("audit");
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].status, AuditStatus::Cleanup);
    }
}
