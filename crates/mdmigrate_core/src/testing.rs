use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};

use crate::git::VersionControl;
use crate::model::{ItemType, MigrateItem};
use crate::notation::DetectedMode;
use crate::remote::{
    ContentGateway, RemoteContent, RemoteEntry, RemoteProject, comment_url, issue_type_url,
    issue_url, wiki_url,
};

pub const SPACE: &str = "https://space.test";

pub fn item(item_type: ItemType, item_id: i64, key: &str) -> MigrateItem {
    MigrateItem {
        item_type,
        item_id,
        parent_id: None,
        item_key: key.to_string(),
        url: String::new(),
        path: format!("x/{item_id}.md"),
        fetched_at: None,
        updated_at: None,
        detected_mode: DetectedMode::Ambiguous,
        score: 0,
        rules: Vec::new(),
        warnings: BTreeMap::new(),
        warning_lines: BTreeMap::new(),
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

#[derive(Debug, Clone)]
pub struct MockRecord {
    pub entry: RemoteEntry,
    pub content: String,
    pub updated_at: Option<String>,
    pub attachments: BTreeSet<String>,
}

/// In-memory remote with request counting and injectable per-key failures.
#[derive(Debug)]
pub struct MockGateway {
    pub project: RemoteProject,
    pub records: Vec<MockRecord>,
    pub fail_fetch: BTreeSet<String>,
    pub fail_push: BTreeSet<String>,
    pub pushes: Vec<(String, String)>,
    requests: usize,
    revision: usize,
}

impl MockGateway {
    pub fn new(project_key: &str) -> Self {
        Self {
            project: RemoteProject {
                id: 77,
                key: project_key.to_string(),
                name: format!("{project_key} project"),
            },
            records: Vec::new(),
            fail_fetch: BTreeSet::new(),
            fail_push: BTreeSet::new(),
            pushes: Vec::new(),
            requests: 0,
            revision: 0,
        }
    }

    pub fn with_issue(mut self, id: i64, key: &str, content: &str) -> Self {
        self.push_record(ItemType::Issue, id, None, key, issue_url(SPACE, key), content);
        self
    }

    pub fn with_comment(mut self, issue_id: i64, issue_key: &str, id: i64, content: &str) -> Self {
        let key = crate::model::comment_item_key(issue_key, id);
        let url = comment_url(SPACE, issue_key, id);
        self.push_record(ItemType::Comment, id, Some(issue_id), &key, url, content);
        self
    }

    pub fn with_wiki(mut self, id: i64, name: &str, content: &str) -> Self {
        let parent = Some(self.project.id);
        self.push_record(ItemType::Wiki, id, parent, name, wiki_url(SPACE, id), content);
        self
    }

    pub fn with_issue_type(mut self, id: i64, name: &str, content: &str) -> Self {
        let parent = Some(self.project.id);
        let url = issue_type_url(SPACE, id);
        self.push_record(ItemType::IssueTypeDescription, id, parent, name, url, content);
        self
    }

    fn push_record(
        &mut self,
        item_type: ItemType,
        id: i64,
        parent_id: Option<i64>,
        key: &str,
        url: String,
        content: &str,
    ) {
        self.records.push(MockRecord {
            entry: RemoteEntry {
                item_type,
                id,
                parent_id,
                key: key.to_string(),
                url,
            },
            content: content.to_string(),
            updated_at: Some("2024-01-01T00:00:00Z".to_string()),
            attachments: BTreeSet::new(),
        });
    }

    pub fn record_mut(&mut self, item_type: ItemType, id: i64) -> Option<&mut MockRecord> {
        self.records
            .iter_mut()
            .find(|record| record.entry.item_type == item_type && record.entry.id == id)
    }

    pub fn content_of(&self, item_type: ItemType, id: i64) -> Option<&str> {
        self.records
            .iter()
            .find(|record| record.entry.item_type == item_type && record.entry.id == id)
            .map(|record| record.content.as_str())
    }

    fn entries_of(&self, item_type: ItemType) -> Vec<RemoteEntry> {
        self.records
            .iter()
            .filter(|record| record.entry.item_type == item_type)
            .map(|record| record.entry.clone())
            .collect()
    }
}

impl ContentGateway for MockGateway {
    fn get_project(&mut self, project_key: &str) -> Result<RemoteProject> {
        self.requests += 1;
        if project_key != self.project.key {
            bail!("no such project: {project_key}");
        }
        Ok(self.project.clone())
    }

    fn list_issues(&mut self, _project: &RemoteProject) -> Result<Vec<RemoteEntry>> {
        self.requests += 1;
        Ok(self.entries_of(ItemType::Issue))
    }

    fn list_comments(&mut self, issue: &RemoteEntry) -> Result<Vec<RemoteEntry>> {
        self.requests += 1;
        Ok(self
            .entries_of(ItemType::Comment)
            .into_iter()
            .filter(|entry| entry.parent_id == Some(issue.id))
            .collect())
    }

    fn list_wikis(&mut self, _project: &RemoteProject) -> Result<Vec<RemoteEntry>> {
        self.requests += 1;
        Ok(self.entries_of(ItemType::Wiki))
    }

    fn list_issue_types(&mut self, _project: &RemoteProject) -> Result<Vec<RemoteEntry>> {
        self.requests += 1;
        Ok(self.entries_of(ItemType::IssueTypeDescription))
    }

    fn fetch_current(&mut self, item: &MigrateItem) -> Result<RemoteContent> {
        self.requests += 1;
        if self.fail_fetch.contains(&item.item_key) {
            bail!("simulated fetch failure for {}", item.item_key);
        }
        let Some(record) = self
            .records
            .iter()
            .find(|record| record.entry.item_type == item.item_type && record.entry.id == item.item_id)
        else {
            bail!("remote item not found: {}", item.item_key);
        };
        Ok(RemoteContent {
            content: record.content.clone(),
            updated_at: record.updated_at.clone(),
            attachment_names: record.attachments.clone(),
            name: Some(record.entry.key.clone()),
        })
    }

    fn push(&mut self, item: &MigrateItem, content: &str) -> Result<Option<String>> {
        self.requests += 1;
        if self.fail_push.contains(&item.item_key) {
            bail!("simulated push failure for {}", item.item_key);
        }
        self.revision += 1;
        let stamp = format!("2024-02-01T00:00:{:02}Z", self.revision % 60);
        let Some(record) = self.record_mut(item.item_type, item.item_id) else {
            bail!("remote item not found: {}", item.item_key);
        };
        record.content = content.to_string();
        record.updated_at = Some(stamp.clone());
        self.pushes.push((item.item_key.clone(), content.to_string()));
        Ok(Some(stamp))
    }

    fn request_count(&self) -> usize {
        self.requests
    }
}

#[derive(Debug, Clone)]
pub struct MemoryCommit {
    pub id: String,
    pub message: String,
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    initialized: bool,
    branch: String,
    branches: BTreeSet<String>,
    staged: BTreeMap<String, String>,
    tracked: BTreeMap<String, String>,
    commits: Vec<MemoryCommit>,
    failing_commit_prefix: Option<String>,
}

/// Recording version-control double with a single linear history. Branch operations
/// are tracked by name only.
#[derive(Debug)]
pub struct MemoryVcs {
    root: PathBuf,
    state: RefCell<MemoryState>,
}

impl MemoryVcs {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            state: RefCell::new(MemoryState::default()),
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.state
            .borrow()
            .commits
            .iter()
            .map(|commit| commit.message.clone())
            .collect()
    }

    pub fn branch_names(&self) -> Vec<String> {
        self.state.borrow().branches.iter().cloned().collect()
    }

    /// Make every later commit whose message starts with `prefix` fail.
    pub fn fail_commits_starting_with(&self, prefix: &str) {
        self.state.borrow_mut().failing_commit_prefix = Some(prefix.to_string());
    }
}

impl VersionControl for MemoryVcs {
    fn init_if_absent(&self, base_branch: &str) -> Result<bool> {
        let mut state = self.state.borrow_mut();
        if state.initialized {
            return Ok(false);
        }
        state.initialized = true;
        state.branch = base_branch.to_string();
        state.branches.insert(base_branch.to_string());
        Ok(true)
    }

    fn add(&self, paths: &[String]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        for path in paths {
            let content = fs::read_to_string(self.root.join(path))?;
            if state.tracked.get(path) != Some(&content) {
                state.staged.insert(path.clone(), content);
            }
        }
        Ok(())
    }

    fn commit(&self, message: &str) -> Result<bool> {
        let mut state = self.state.borrow_mut();
        if let Some(prefix) = state.failing_commit_prefix.as_deref()
            && message.starts_with(prefix)
        {
            bail!("simulated commit failure: {message}");
        }
        if state.staged.is_empty() {
            return Ok(false);
        }
        let files = std::mem::take(&mut state.staged);
        for (path, content) in &files {
            state.tracked.insert(path.clone(), content.clone());
        }
        let id = format!("c{}", state.commits.len() + 1);
        state.commits.push(MemoryCommit {
            id,
            message: message.to_string(),
            files,
        });
        Ok(true)
    }

    fn has_uncommitted_changes(&self) -> Result<bool> {
        let state = self.state.borrow();
        for (path, content) in &state.tracked {
            let on_disk = fs::read_to_string(self.root.join(path)).ok();
            if on_disk.as_ref() != Some(content) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn current_branch(&self) -> Result<String> {
        Ok(self.state.borrow().branch.clone())
    }

    fn checkout(&self, branch: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.branches.contains(branch) {
            bail!("unknown branch {branch}");
        }
        state.branch = branch.to_string();
        Ok(())
    }

    fn create_branch(&self, branch: &str, _start_point: Option<&str>) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.branches.insert(branch.to_string()) {
            bail!("branch already exists: {branch}");
        }
        state.branch = branch.to_string();
        Ok(())
    }

    fn branch_exists(&self, branch: &str) -> Result<bool> {
        Ok(self.state.borrow().branches.contains(branch))
    }

    fn first_revision(&self, path: &str) -> Result<Option<String>> {
        Ok(self
            .state
            .borrow()
            .commits
            .iter()
            .find(|commit| commit.files.contains_key(path))
            .map(|commit| commit.id.clone()))
    }

    fn show_file(&self, revision: &str, path: &str) -> Result<String> {
        let state = self.state.borrow();
        let Some(commit) = state.commits.iter().find(|commit| commit.id == revision) else {
            bail!("unknown revision {revision}");
        };
        let mut content = None;
        for candidate in &state.commits {
            if let Some(file) = candidate.files.get(path) {
                content = Some(file.clone());
            }
            if candidate.id == commit.id {
                break;
            }
        }
        content.ok_or_else(|| anyhow::anyhow!("{path} not present at {revision}"))
    }

    fn merge_no_ff(&self, branch: &str, message: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.branches.contains(branch) {
            bail!("unknown branch {branch}");
        }
        let id = format!("c{}", state.commits.len() + 1);
        state.commits.push(MemoryCommit {
            id,
            message: message.to_string(),
            files: BTreeMap::new(),
        });
        Ok(())
    }

    fn delete_branch(&self, branch: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.branch == branch {
            bail!("cannot delete the checked-out branch {branch}");
        }
        state.branches.remove(branch);
        Ok(())
    }

    fn commit_count(&self) -> Result<usize> {
        Ok(self.state.borrow().commits.len())
    }
}
