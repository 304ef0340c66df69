use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

pub const METADATA_FILENAME: &str = "metadata.json";
pub const ITEMS_FILENAME: &str = "items.jsonl";
pub const LOGS_FILENAME: &str = "logs.jsonl";
pub const LOCK_FILENAME: &str = "lock";
pub const CONFIG_FILENAME: &str = "config.toml";
pub const GITIGNORE_FILENAME: &str = ".gitignore";

pub const WORKSPACE_DIR_ENV: &str = "MDMIGRATE_DIR";
pub const CONFIG_PATH_ENV: &str = "MDMIGRATE_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub workspace_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

/// Every on-disk location a migration workspace owns.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub metadata_path: PathBuf,
    pub items_path: PathBuf,
    pub logs_path: PathBuf,
    pub lock_path: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
    pub root_source: ValueSource,
    pub config_source: ValueSource,
}

impl WorkspacePaths {
    /// Layout rooted at `root` with every file at its default location.
    pub fn at(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            metadata_path: root.join(METADATA_FILENAME),
            items_path: root.join(ITEMS_FILENAME),
            logs_path: root.join(LOGS_FILENAME),
            lock_path: root.join(LOCK_FILENAME),
            config_path: root.join(CONFIG_FILENAME),
            gitignore_path: root.join(GITIGNORE_FILENAME),
            root_source: ValueSource::Default,
            config_source: ValueSource::Default,
        }
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "workspace={} ({})\nmetadata={}\nitems={}\nlogs={}\nlock={}\nconfig={} ({})",
            normalize_for_display(&self.root),
            self.root_source.as_str(),
            normalize_for_display(&self.metadata_path),
            normalize_for_display(&self.items_path),
            normalize_for_display(&self.logs_path),
            normalize_for_display(&self.lock_path),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }

    /// Absolute location of a `/`-separated path relative to the workspace root.
    pub fn absolute(&self, relative: &str) -> PathBuf {
        let mut output = self.root.clone();
        for segment in relative.split('/') {
            if !segment.is_empty() {
                output.push(segment);
            }
        }
        output
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceStatus {
    pub root_exists: bool,
    pub metadata_exists: bool,
    pub items_exists: bool,
    pub logs_exists: bool,
    pub lock_exists: bool,
    pub repository_exists: bool,
    pub config_exists: bool,
}

pub fn inspect_workspace(paths: &WorkspacePaths) -> WorkspaceStatus {
    WorkspaceStatus {
        root_exists: paths.root.exists(),
        metadata_exists: paths.metadata_path.exists(),
        items_exists: paths.items_path.exists(),
        logs_exists: paths.logs_path.exists(),
        lock_exists: paths.lock_path.exists(),
        repository_exists: paths.root.join(".git").exists(),
        config_exists: paths.config_path.exists(),
    }
}

pub fn ensure_workspace_initialized(paths: &WorkspacePaths) -> Result<()> {
    if !paths.root.exists() {
        bail!(
            "workspace directory does not exist: {}\nRun: mdmigrate init <PROJECT_KEY> --dir {}",
            normalize_for_display(&paths.root),
            normalize_for_display(&paths.root)
        );
    }
    if !paths.metadata_path.exists() {
        bail!(
            "workspace metadata is missing: {}\nRun: mdmigrate init <PROJECT_KEY> --dir {}",
            normalize_for_display(&paths.metadata_path),
            normalize_for_display(&paths.root)
        );
    }
    Ok(())
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<WorkspacePaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<WorkspacePaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (root, root_source) = if let Some(path) = overrides.workspace_dir.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = non_empty(lookup_env(WORKSPACE_DIR_ENV)) {
        (
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        )
    } else {
        (context.cwd.clone(), ValueSource::Default)
    };
    if root.exists() && !root.is_dir() {
        bail!(
            "workspace path is not a directory: {}",
            normalize_for_display(&root)
        );
    }

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &root), ValueSource::Flag)
    } else if let Some(value) = non_empty(lookup_env(CONFIG_PATH_ENV)) {
        (absolutize(Path::new(value.trim()), &root), ValueSource::Env)
    } else {
        (root.join(CONFIG_FILENAME), ValueSource::Default)
    };

    let mut paths = WorkspacePaths::at(&root);
    paths.config_path = config_path;
    paths.root_source = root_source;
    paths.config_source = config_source;
    Ok(paths)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
