use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{debug, warn};

use crate::model::LockRecord;
use crate::runtime::{WorkspacePaths, normalize_for_display};

/// Exclusive hold on a workspace for the duration of one apply or rollback run.
///
/// The lock file's existence is the lock. It is removed on [`WorkspaceLock::release`]
/// or when the guard is dropped.
#[derive(Debug)]
pub struct WorkspaceLock {
    path: PathBuf,
    released: bool,
}

impl WorkspaceLock {
    pub fn acquire(paths: &WorkspacePaths, force: bool, command: &str) -> Result<Self> {
        let record = LockRecord {
            pid: std::process::id(),
            created_at: Utc::now(),
            command: command.to_string(),
        };
        match try_create(&paths.lock_path, &record) {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::AlreadyExists && force => {
                warn!(
                    path = %normalize_for_display(&paths.lock_path),
                    holder = %describe_holder(&paths.lock_path),
                    "removing existing workspace lock"
                );
                fs::remove_file(&paths.lock_path).with_context(|| {
                    format!("failed to remove stale lock {}", paths.lock_path.display())
                })?;
                try_create(&paths.lock_path, &record).with_context(|| {
                    format!("failed to create lock {}", paths.lock_path.display())
                })?;
            }
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                bail!(
                    "workspace is locked by another run ({})\nlock: {}\nIf no other run is active, retry with --force-lock",
                    describe_holder(&paths.lock_path),
                    normalize_for_display(&paths.lock_path)
                );
            }
            Err(error) => {
                return Err(error).with_context(|| {
                    format!("failed to create lock {}", paths.lock_path.display())
                });
            }
        }
        debug!(path = %normalize_for_display(&paths.lock_path), "workspace lock acquired");
        Ok(Self {
            path: paths.lock_path.clone(),
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error)
                .with_context(|| format!("failed to remove lock {}", self.path.display())),
        }
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

pub fn read_lock(path: &Path) -> Option<LockRecord> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn try_create(path: &Path, record: &LockRecord) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let raw = serde_json::to_vec(record).map_err(std::io::Error::other)?;
    file.write_all(&raw)?;
    file.sync_all()
}

fn describe_holder(path: &Path) -> String {
    match read_lock(path) {
        Some(record) => format!(
            "pid {} since {}: {}",
            record.pid,
            record.created_at.to_rfc3339(),
            record.command
        ),
        None => "unknown holder".to_string(),
    }
}
