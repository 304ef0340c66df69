use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::runtime::{LOCK_FILENAME, LOGS_FILENAME, WorkspacePaths};

/// Entries every workspace keeps out of history: the audit log, the lock, local secrets
/// and atomic-write temp files.
pub const IGNORED_PATTERNS: [&str; 4] = [LOGS_FILENAME, LOCK_FILENAME, ".env", ".*.tmp"];

/// Version-control primitives the migration engine relies on. Paths are relative to the
/// workspace root and use `/` separators.
pub trait VersionControl {
    /// Create the repository with `base_branch` as its initial branch. Returns false if a
    /// repository already existed.
    fn init_if_absent(&self, base_branch: &str) -> Result<bool>;
    fn add(&self, paths: &[String]) -> Result<()>;
    /// Commit whatever is staged. Returns false, without error, when nothing is staged.
    fn commit(&self, message: &str) -> Result<bool>;
    /// Whether tracked files differ from the last commit.
    fn has_uncommitted_changes(&self) -> Result<bool>;
    fn current_branch(&self) -> Result<String>;
    fn checkout(&self, branch: &str) -> Result<()>;
    fn create_branch(&self, branch: &str, start_point: Option<&str>) -> Result<()>;
    fn branch_exists(&self, branch: &str) -> Result<bool>;
    /// The oldest commit that touched `path`, if any.
    fn first_revision(&self, path: &str) -> Result<Option<String>>;
    fn show_file(&self, revision: &str, path: &str) -> Result<String>;
    fn merge_no_ff(&self, branch: &str, message: &str) -> Result<()>;
    fn delete_branch(&self, branch: &str) -> Result<()>;
    fn commit_count(&self) -> Result<usize>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

impl Default for GitIdentity {
    fn default() -> Self {
        Self {
            name: "mdmigrate".to_string(),
            email: "mdmigrate@localhost".to_string(),
        }
    }
}

/// [`VersionControl`] backed by the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
    identity: GitIdentity,
}

impl GitCli {
    pub fn new(root: &Path, identity: GitIdentity) -> Self {
        Self {
            root: root.to_path_buf(),
            identity,
        }
    }

    fn command(&self, args: &[&str]) -> Result<Output> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .arg("-c")
            .arg(format!("user.name={}", self.identity.name))
            .arg("-c")
            .arg(format!("user.email={}", self.identity.email))
            .args(["-c", "commit.gpgsign=false", "-c", "core.autocrlf=false"])
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("LC_ALL", "C")
            .output()
            .with_context(|| format!("failed to run git {}", args.join(" ")))?;
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.command(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        String::from_utf8(output.stdout)
            .with_context(|| format!("git {} produced non-UTF-8 output", args.join(" ")))
    }

    fn has_head(&self) -> Result<bool> {
        Ok(self
            .command(&["rev-parse", "--verify", "--quiet", "HEAD"])?
            .status
            .success())
    }
}

impl VersionControl for GitCli {
    fn init_if_absent(&self, base_branch: &str) -> Result<bool> {
        if self.root.join(".git").exists() {
            return Ok(false);
        }
        self.run(&["init", "--quiet"])?;
        let head = format!("refs/heads/{base_branch}");
        self.run(&["symbolic-ref", "HEAD", &head])?;
        debug!(root = %self.root.display(), branch = base_branch, "initialized repository");
        Ok(true)
    }

    fn add(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run(&args)?;
        Ok(())
    }

    fn commit(&self, message: &str) -> Result<bool> {
        let staged = self.command(&["diff", "--cached", "--quiet"])?;
        match staged.status.code() {
            Some(0) => return Ok(false),
            Some(1) => {}
            _ => {
                let stderr = String::from_utf8_lossy(&staged.stderr);
                bail!("git diff --cached failed: {}", stderr.trim());
            }
        }
        self.run(&["commit", "--quiet", "--no-verify", "-m", message])?;
        debug!(message, "committed");
        Ok(true)
    }

    fn has_uncommitted_changes(&self) -> Result<bool> {
        let status = self.run(&["status", "--porcelain", "--untracked-files=no"])?;
        Ok(!status.trim().is_empty())
    }

    fn current_branch(&self) -> Result<String> {
        Ok(self.run(&["symbolic-ref", "--short", "HEAD"])?.trim().to_string())
    }

    fn checkout(&self, branch: &str) -> Result<()> {
        self.run(&["checkout", "--quiet", branch])?;
        Ok(())
    }

    fn create_branch(&self, branch: &str, start_point: Option<&str>) -> Result<()> {
        let mut args = vec!["checkout", "--quiet", "-b", branch];
        if let Some(start) = start_point {
            args.push(start);
        }
        self.run(&args)?;
        Ok(())
    }

    fn branch_exists(&self, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{branch}");
        Ok(self
            .command(&["rev-parse", "--verify", "--quiet", &reference])?
            .status
            .success())
    }

    fn first_revision(&self, path: &str) -> Result<Option<String>> {
        if !self.has_head()? {
            return Ok(None);
        }
        let log = self.run(&["log", "--format=%H", "--reverse", "--", path])?;
        Ok(log
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string))
    }

    fn show_file(&self, revision: &str, path: &str) -> Result<String> {
        let spec = format!("{revision}:{path}");
        self.run(&["show", &spec])
    }

    fn merge_no_ff(&self, branch: &str, message: &str) -> Result<()> {
        self.run(&["merge", "--quiet", "--no-ff", "--no-edit", "-m", message, branch])?;
        Ok(())
    }

    fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run(&["branch", "--quiet", "-D", branch])?;
        Ok(())
    }

    fn commit_count(&self) -> Result<usize> {
        if !self.has_head()? {
            return Ok(0);
        }
        let count = self.run(&["rev-list", "--count", "HEAD"])?;
        count
            .trim()
            .parse::<usize>()
            .with_context(|| format!("unexpected rev-list output: {}", count.trim()))
    }
}

/// Make sure `.gitignore` lists every pattern in [`IGNORED_PATTERNS`]. Returns true when
/// the file was changed.
pub fn ensure_gitignore(paths: &WorkspacePaths) -> Result<bool> {
    let existing = if paths.gitignore_path.exists() {
        fs::read_to_string(&paths.gitignore_path)
            .with_context(|| format!("failed to read {}", paths.gitignore_path.display()))?
    } else {
        String::new()
    };
    let present: Vec<&str> = existing.lines().map(str::trim).collect();
    let missing: Vec<&str> = IGNORED_PATTERNS
        .iter()
        .copied()
        .filter(|pattern| !present.contains(pattern))
        .collect();
    if missing.is_empty() {
        return Ok(false);
    }

    let mut updated = existing;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    for pattern in missing {
        updated.push_str(pattern);
        updated.push('\n');
    }
    fs::write(&paths.gitignore_path, updated)
        .with_context(|| format!("failed to write {}", paths.gitignore_path.display()))?;
    Ok(true)
}

/// Whether a usable `git` executable is on `PATH`.
pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}
