use std::fmt::Write as _;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::Serialize;
use similar::{ChangeTag, TextDiff};
use tracing::{debug, info, warn};

use crate::config::MigrateConfig;
use crate::filesystem::{content_hash, write_workspace_file};
use crate::git::{GitCli, VersionControl};
use crate::lock::WorkspaceLock;
use crate::model::{AuditAction, AuditEntry, AuditStatus, ItemType, MigrateItem};
use crate::notation::convert;
use crate::remote::{ContentGateway, HttpGateway, HttpGatewayConfig, RemoteContent};
use crate::runtime::{ITEMS_FILENAME, WorkspacePaths, ensure_workspace_initialized};
use crate::store::{append_audit, read_items_if_exists, read_metadata, write_items};
use crate::workspace::{ConversionSettings, record_diagnostics, write_item_sidecar};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
    Skip,
    Quit,
}

/// What the operator is asked to confirm for one item.
#[derive(Debug)]
pub struct PromptRequest<'a> {
    pub action: AuditAction,
    pub item: &'a MigrateItem,
    pub diff: &'a str,
    /// 1-based position among the items eligible for this run.
    pub index: usize,
    pub total: usize,
}

pub type Decider<'a> = dyn FnMut(&PromptRequest<'_>) -> Result<Decision> + 'a;

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub force_lock: bool,
    pub auto: bool,
    pub dry_run: bool,
    /// Empty means every item type.
    pub types: Vec<ItemType>,
    pub no_branch: bool,
    pub settings: ConversionSettings,
    pub command: String,
}

#[derive(Debug, Clone)]
pub struct RollbackOptions {
    pub force_lock: bool,
    pub auto: bool,
    pub types: Vec<ItemType>,
    /// Item keys, ids or paths. Empty means every eligible item.
    pub targets: Vec<String>,
    pub no_branch: bool,
    pub command: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemOutcome {
    pub item_key: String,
    pub status: AuditStatus,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub action: AuditAction,
    pub dry_run: bool,
    pub eligible: usize,
    /// Items applied (or rolled back, for rollback runs).
    pub applied: usize,
    /// Rejected, skipped, errored and snapshot-less items.
    pub skipped: usize,
    pub unchanged: usize,
    pub errors: usize,
    pub drift_refreshed: usize,
    pub commits: usize,
    pub quit: bool,
    pub branch: Option<String>,
    pub merged: bool,
    pub request_count: usize,
    pub outcomes: Vec<ItemOutcome>,
}

impl RunReport {
    fn new(action: AuditAction, dry_run: bool) -> Self {
        Self {
            action,
            dry_run,
            eligible: 0,
            applied: 0,
            skipped: 0,
            unchanged: 0,
            errors: 0,
            drift_refreshed: 0,
            commits: 0,
            quit: false,
            branch: None,
            merged: false,
            request_count: 0,
            outcomes: Vec::new(),
        }
    }

    pub fn summary(&self) -> String {
        match self.action {
            AuditAction::Rollback => format!(
                "Rolled back: {}, Skipped: {}, Unchanged: {}",
                self.applied, self.skipped, self.unchanged
            ),
            _ => format!(
                "Applied: {}, Skipped: {}, Unchanged: {}",
                self.applied, self.skipped, self.unchanged
            ),
        }
    }
}

enum Step {
    Continue,
    Quit,
}

/// Mutable state of one apply or rollback run.
struct Run<'a, G, V> {
    paths: &'a WorkspacePaths,
    gateway: &'a mut G,
    vcs: &'a V,
    items: Vec<MigrateItem>,
    report: RunReport,
}

impl<G: ContentGateway, V: VersionControl> Run<'_, G, V> {
    /// Rewrite the item log and commit it together with `changed` paths.
    fn persist(&mut self, changed: &[String], message: &str) -> Result<()> {
        write_items(&self.paths.items_path, &self.items)?;
        let mut staged = changed.to_vec();
        staged.push(ITEMS_FILENAME.to_string());
        self.vcs.add(&staged)?;
        if self.vcs.commit(message)? {
            self.report.commits += 1;
            debug!(message, "committed");
        }
        Ok(())
    }

    fn record(&mut self, index: usize, status: AuditStatus, message: Option<String>) -> Result<()> {
        let action = self.report.action;
        let item = &self.items[index];
        append_audit(
            self.paths,
            &AuditEntry::for_item(action, status, item, message.clone()),
        )?;
        self.report.outcomes.push(ItemOutcome {
            item_key: item.item_key.clone(),
            status,
            message,
        });
        match status {
            AuditStatus::Applied | AuditStatus::DryRun | AuditStatus::RolledBack => {
                self.report.applied += 1;
            }
            AuditStatus::NoChange => self.report.unchanged += 1,
            AuditStatus::Error => {
                self.report.errors += 1;
                self.report.skipped += 1;
            }
            AuditStatus::Rejected | AuditStatus::Skipped | AuditStatus::NoSnapshot => {
                self.report.skipped += 1;
            }
            AuditStatus::Cleanup => {}
        }
        Ok(())
    }

    /// Ask the decider unless the run is unattended.
    fn decide(
        &self,
        decider: &mut Decider<'_>,
        auto: bool,
        index: usize,
        position: usize,
        diff: &str,
    ) -> Result<Decision> {
        if auto {
            return Ok(Decision::Approve);
        }
        decider(&PromptRequest {
            action: self.report.action,
            item: &self.items[index],
            diff,
            index: position,
            total: self.report.eligible,
        })
    }

    /// Persist a remote rename or content drift before converting. Returns the fetched
    /// content.
    fn refresh_snapshot(&mut self, index: usize) -> Result<RemoteContent> {
        let remote = self
            .gateway
            .fetch_current(&self.items[index])
            .with_context(|| format!("failed to fetch {}", self.items[index].item_key))?;
        let remote_hash = content_hash(&remote.content);

        let item = &mut self.items[index];
        let mut renamed = false;
        if item.item_type.is_id_keyed()
            && let Some(name) = remote.name.as_deref().map(str::trim)
            && !name.is_empty()
            && name != item.item_key
        {
            info!(from = %item.item_key, to = name, "remote item renamed");
            item.item_key = name.to_string();
            renamed = true;
        }
        let drifted = remote_hash != item.input_hash;
        if drifted {
            info!(item = %item.item_key, "remote content drifted since last snapshot");
            write_workspace_file(self.paths, &item.path, &remote.content)?;
            item.input_hash = remote_hash.clone();
            item.output_hash = remote_hash;
            item.fetched_at = Some(Utc::now());
            item.updated_at = remote.updated_at.clone();
        }
        if !renamed && !drifted {
            return Ok(remote);
        }

        let mut changed = vec![item.path.clone()];
        let key = item.item_key.clone();
        if let Some(sidecar) = write_item_sidecar(self.paths, item)? {
            changed.push(sidecar);
        }
        let message = if drifted {
            self.report.drift_refreshed += 1;
            format!("snapshot: refresh {key}")
        } else {
            format!("snapshot: rename {key}")
        };
        self.persist(&changed, &message)?;
        Ok(remote)
    }

    fn apply_item(
        &mut self,
        index: usize,
        position: usize,
        options: &ApplyOptions,
        decider: &mut Decider<'_>,
    ) -> Result<Step> {
        let remote = self.refresh_snapshot(index)?;
        let result = convert(
            &remote.content,
            &options.settings.options_for(&self.items[index], &remote),
        );
        if result.output == remote.content {
            self.record(index, AuditStatus::NoChange, None)?;
            return Ok(Step::Continue);
        }

        let diff = unified_diff(&remote.content, &result.output, &self.items[index].path);
        match self.decide(decider, options.auto, index, position, &diff)? {
            Decision::Approve => {}
            Decision::Reject => {
                self.record(index, AuditStatus::Rejected, None)?;
                return Ok(Step::Continue);
            }
            Decision::Skip => {
                self.record(index, AuditStatus::Skipped, None)?;
                return Ok(Step::Continue);
            }
            Decision::Quit => return Ok(Step::Quit),
        }

        let output_hash = content_hash(&result.output);
        if !options.dry_run {
            let updated_at = self
                .gateway
                .push(&self.items[index], &result.output)
                .with_context(|| format!("failed to update {}", self.items[index].item_key))?;
            let item = &mut self.items[index];
            item.updated_at = updated_at.or(item.updated_at.take());
            item.input_hash = output_hash.clone();
            item.applied = true;
            item.applied_at = Some(Utc::now());
        }
        let item = &mut self.items[index];
        write_workspace_file(self.paths, &item.path, &result.output)?;
        item.output_hash = output_hash;
        item.apply_error = None;
        record_diagnostics(item, &result);

        let path = item.path.clone();
        let (status, message) = if options.dry_run {
            (AuditStatus::DryRun, format!("dry-run: {}", item.item_key))
        } else {
            (AuditStatus::Applied, format!("apply: {}", item.item_key))
        };
        self.persist(&[path], &message)?;
        self.record(index, status, Some(result.rule_names().join(",")).filter(|r| !r.is_empty()))?;
        Ok(Step::Continue)
    }

    fn rollback_item(
        &mut self,
        index: usize,
        position: usize,
        options: &RollbackOptions,
        decider: &mut Decider<'_>,
    ) -> Result<Step> {
        let path = self.items[index].path.clone();
        let Some(revision) = self.vcs.first_revision(&path)? else {
            self.record(
                index,
                AuditStatus::NoSnapshot,
                Some(format!("no committed snapshot of {path}")),
            )?;
            return Ok(Step::Continue);
        };
        let pristine = self
            .vcs
            .show_file(&revision, &path)
            .with_context(|| format!("failed to read {path} at {revision}"))?;
        let pristine_hash = content_hash(&pristine);
        let remote = self
            .gateway
            .fetch_current(&self.items[index])
            .with_context(|| format!("failed to fetch {}", self.items[index].item_key))?;

        if remote.content == pristine {
            if self.items[index].output_hash != pristine_hash {
                let item = &mut self.items[index];
                write_workspace_file(self.paths, &item.path, &pristine)?;
                item.output_hash = pristine_hash.clone();
                item.input_hash = pristine_hash;
                item.applied = false;
                let message = format!("rollback: restore {}", item.item_key);
                self.persist(&[path], &message)?;
            }
            self.record(index, AuditStatus::NoChange, None)?;
            return Ok(Step::Continue);
        }

        let diff = unified_diff(&remote.content, &pristine, &path);
        match self.decide(decider, options.auto, index, position, &diff)? {
            Decision::Approve => {}
            Decision::Reject => {
                self.record(index, AuditStatus::Rejected, None)?;
                return Ok(Step::Continue);
            }
            Decision::Skip => {
                self.record(index, AuditStatus::Skipped, None)?;
                return Ok(Step::Continue);
            }
            Decision::Quit => return Ok(Step::Quit),
        }

        let updated_at = self
            .gateway
            .push(&self.items[index], &pristine)
            .with_context(|| format!("failed to restore {}", self.items[index].item_key))?;
        let item = &mut self.items[index];
        write_workspace_file(self.paths, &item.path, &pristine)?;
        item.updated_at = updated_at.or(item.updated_at.take());
        item.input_hash = pristine_hash.clone();
        item.output_hash = pristine_hash;
        item.applied = false;
        item.rollback_at = Some(Utc::now());
        item.rollback_error = None;
        let message = format!("rollback: {}", item.item_key);
        self.persist(&[path], &message)?;
        self.record(index, AuditStatus::RolledBack, Some(format!("restored {revision}")))?;
        Ok(Step::Continue)
    }

    /// Record a per-item failure and keep going.
    fn record_failure(&mut self, index: usize, error: &anyhow::Error) -> Result<()> {
        let message = format!("{error:#}");
        warn!(item = %self.items[index].item_key, error = %message, "item failed");
        let item = &mut self.items[index];
        let commit_message = match self.report.action {
            AuditAction::Rollback => {
                item.rollback_error = Some(message.clone());
                format!("rollback: error {}", item.item_key)
            }
            _ => {
                item.apply_error = Some(message.clone());
                format!("apply: error {}", item.item_key)
            }
        };
        self.persist(&[], &commit_message)?;
        self.record(index, AuditStatus::Error, Some(message))
    }
}

/// Dedicated working branch for one run.
struct BranchSession {
    original: String,
    working: Option<String>,
    created: bool,
}

impl BranchSession {
    fn begin<V: VersionControl>(vcs: &V, mode: &str, no_branch: bool) -> Result<Self> {
        let original = vcs.current_branch()?;
        if no_branch {
            return Ok(Self {
                original,
                working: None,
                created: false,
            });
        }
        let prefix = format!("migrate/{mode}-");
        if original.starts_with(&prefix) {
            debug!(branch = %original, "already on a {mode} branch");
            return Ok(Self {
                working: Some(original.clone()),
                original,
                created: false,
            });
        }
        let branch = format!("{prefix}{}", Utc::now().format("%Y%m%d-%H%M%S"));
        let created = if vcs.branch_exists(&branch)? {
            vcs.checkout(&branch)?;
            false
        } else {
            vcs.create_branch(&branch, Some(&original))?;
            true
        };
        info!(branch = %branch, from = %original, "switched to working branch");
        Ok(Self {
            original,
            working: Some(branch),
            created,
        })
    }

    /// Merge a working branch that gained commits into `base` and delete it. Afterwards the
    /// run returns to the branch it started on, or to `base` when it started on the working
    /// branch itself. Returns whether a merge happened.
    fn finish<V: VersionControl>(
        &self,
        vcs: &V,
        base: &str,
        commits: usize,
        mergeable: bool,
    ) -> Result<bool> {
        let Some(working) = self.working.as_deref() else {
            return Ok(false);
        };
        let resumed = working == self.original;
        if commits == 0 {
            if !resumed {
                vcs.checkout(&self.original)?;
                if self.created {
                    vcs.delete_branch(working)?;
                    debug!(branch = working, "removed empty working branch");
                }
            }
            return Ok(false);
        }
        if !mergeable {
            if !resumed {
                vcs.checkout(&self.original)?;
            }
            info!(branch = working, "kept dry-run branch for inspection");
            return Ok(false);
        }
        vcs.checkout(base)?;
        vcs.merge_no_ff(working, &format!("merge {working} into {base}"))?;
        vcs.delete_branch(working)?;
        if !resumed && self.original != base {
            vcs.checkout(&self.original)?;
        }
        info!(branch = working, base, "merged working branch");
        Ok(true)
    }
}

/// Settle the working branch once the item loop is over. A loop that aborted keeps its own
/// error; branch handling still runs first.
fn conclude<V: VersionControl>(
    session: &BranchSession,
    vcs: &V,
    base: &str,
    report: &mut RunReport,
    mergeable: bool,
    aborted: Option<anyhow::Error>,
) -> Result<()> {
    let finished = session.finish(vcs, base, report.commits, mergeable);
    if let Some(error) = aborted {
        if let Err(branch_error) = finished {
            warn!(error = %format!("{branch_error:#}"), "branch handling failed after aborted run");
        }
        return Err(error);
    }
    report.merged = finished?;
    Ok(())
}

fn eligible(items: &[MigrateItem], types: &[ItemType], targets: &[String]) -> Vec<usize> {
    items
        .iter()
        .enumerate()
        .filter(|(_, item)| types.is_empty() || types.contains(&item.item_type))
        .filter(|(_, item)| {
            targets.is_empty() || targets.iter().any(|target| item.matches_target(target))
        })
        .map(|(index, _)| index)
        .collect()
}

fn prepare_run<V: VersionControl>(paths: &WorkspacePaths, vcs: &V) -> Result<Vec<MigrateItem>> {
    if vcs.has_uncommitted_changes()? {
        bail!("workspace has uncommitted changes; commit or discard them before running");
    }
    read_items_if_exists(&paths.items_path)
}

pub fn apply(
    paths: &WorkspacePaths,
    config: &MigrateConfig,
    options: &ApplyOptions,
    decider: &mut Decider<'_>,
) -> Result<RunReport> {
    let mut gateway = HttpGateway::new(HttpGatewayConfig::from_config(config)?)?;
    let vcs = GitCli::new(&paths.root, config.git_identity());
    apply_with(paths, options, &mut gateway, &vcs, decider)
}

pub fn rollback(
    paths: &WorkspacePaths,
    config: &MigrateConfig,
    options: &RollbackOptions,
    decider: &mut Decider<'_>,
) -> Result<RunReport> {
    let mut gateway = HttpGateway::new(HttpGatewayConfig::from_config(config)?)?;
    let vcs = GitCli::new(&paths.root, config.git_identity());
    rollback_with(paths, options, &mut gateway, &vcs, decider)
}

/// Convert eligible items and push approved conversions to the remote.
pub fn apply_with<G, V>(
    paths: &WorkspacePaths,
    options: &ApplyOptions,
    gateway: &mut G,
    vcs: &V,
    decider: &mut Decider<'_>,
) -> Result<RunReport>
where
    G: ContentGateway,
    V: VersionControl,
{
    ensure_workspace_initialized(paths)?;
    let metadata = read_metadata(paths)?;
    let lock = WorkspaceLock::acquire(paths, options.force_lock, &options.command)?;
    let items = prepare_run(paths, vcs)?;
    let mode = if options.dry_run { "dry-run" } else { "apply" };
    let session = BranchSession::begin(vcs, mode, options.no_branch)?;

    let indices = eligible(&items, &options.types, &[]);
    let mut run = Run {
        paths,
        gateway,
        vcs,
        items,
        report: RunReport::new(AuditAction::Apply, options.dry_run),
    };
    run.report.eligible = indices.len();
    run.report.branch = session.working.clone();

    let mut aborted = None;
    for (position, index) in indices.into_iter().enumerate() {
        match run.apply_item(index, position + 1, options, decider) {
            Ok(Step::Continue) => {}
            Ok(Step::Quit) => {
                run.report.quit = true;
                break;
            }
            Err(error) => {
                if let Err(fatal) = run.record_failure(index, &error) {
                    aborted = Some(fatal);
                    break;
                }
            }
        }
    }

    let mut report = run.report;
    report.request_count = gateway.request_count();
    conclude(
        &session,
        vcs,
        &metadata.base_branch,
        &mut report,
        !options.dry_run,
        aborted,
    )?;
    lock.release()?;
    info!(summary = %report.summary(), commits = report.commits, "apply finished");
    Ok(report)
}

/// Restore eligible items to their first committed snapshot, locally and remotely.
pub fn rollback_with<G, V>(
    paths: &WorkspacePaths,
    options: &RollbackOptions,
    gateway: &mut G,
    vcs: &V,
    decider: &mut Decider<'_>,
) -> Result<RunReport>
where
    G: ContentGateway,
    V: VersionControl,
{
    ensure_workspace_initialized(paths)?;
    let metadata = read_metadata(paths)?;
    let lock = WorkspaceLock::acquire(paths, options.force_lock, &options.command)?;
    let items = prepare_run(paths, vcs)?;
    let session = BranchSession::begin(vcs, "rollback", options.no_branch)?;

    let indices = eligible(&items, &options.types, &options.targets);
    let mut run = Run {
        paths,
        gateway,
        vcs,
        items,
        report: RunReport::new(AuditAction::Rollback, false),
    };
    run.report.eligible = indices.len();
    run.report.branch = session.working.clone();

    let mut aborted = None;
    for (position, index) in indices.into_iter().enumerate() {
        match run.rollback_item(index, position + 1, options, decider) {
            Ok(Step::Continue) => {}
            Ok(Step::Quit) => {
                run.report.quit = true;
                break;
            }
            Err(error) => {
                if let Err(fatal) = run.record_failure(index, &error) {
                    aborted = Some(fatal);
                    break;
                }
            }
        }
    }

    let mut report = run.report;
    report.request_count = gateway.request_count();
    conclude(&session, vcs, &metadata.base_branch, &mut report, true, aborted)?;
    lock.release()?;
    info!(summary = %report.summary(), commits = report.commits, "rollback finished");
    Ok(report)
}

/// Unified diff of `old` against `new` with three lines of context per hunk.
pub fn unified_diff(old: &str, new: &str, path: &str) -> String {
    let diff = TextDiff::from_lines(old, new);
    let mut output = String::new();
    let _ = writeln!(output, "--- a/{path}");
    let _ = writeln!(output, "+++ b/{path}");

    for group in diff.grouped_ops(3) {
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            continue;
        };
        let old_start = first.old_range().start;
        let new_start = first.new_range().start;
        let old_len = last.old_range().end - old_start;
        let new_len = last.new_range().end - new_start;
        let _ = writeln!(
            output,
            "@@ -{},{old_len} +{},{new_len} @@",
            old_start + 1,
            new_start + 1
        );
        for op in &group {
            for change in diff.iter_changes(op) {
                let sign = match change.tag() {
                    ChangeTag::Delete => '-',
                    ChangeTag::Insert => '+',
                    ChangeTag::Equal => ' ',
                };
                output.push(sign);
                output.push_str(change.value());
                if !change.value().ends_with('\n') {
                    output.push('\n');
                }
            }
        }
    }
    output
}
