use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::git::GitIdentity;
use crate::notation::{Rule, parse_rules};

pub const DEFAULT_USER_AGENT: &str = "mdmigrate/0.2";
pub const DEFAULT_BASE_BRANCH: &str = "main";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_RETRIES: usize = 2;

pub const SPACE_URL_ENV: &str = "MDMIGRATE_SPACE_URL";
pub const API_KEY_ENV: &str = "MDMIGRATE_API_KEY";
pub const USER_AGENT_ENV: &str = "MDMIGRATE_USER_AGENT";
pub const TIMEOUT_ENV: &str = "MDMIGRATE_HTTP_TIMEOUT_MS";
pub const RETRIES_ENV: &str = "MDMIGRATE_HTTP_RETRIES";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MigrateConfig {
    #[serde(default)]
    pub remote: RemoteSection,
    #[serde(default)]
    pub convert: ConvertSection,
    #[serde(default)]
    pub git: GitSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RemoteSection {
    pub space_url: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ConvertSection {
    /// Rule ids never applied by apply runs.
    #[serde(default)]
    pub unsafe_rules: Vec<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct GitSection {
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub base_branch: Option<String>,
}

impl MigrateConfig {
    pub fn excluded_rules(&self) -> Result<BTreeSet<Rule>> {
        parse_rules(&self.convert.unsafe_rules).context("invalid [convert] unsafe_rules")
    }

    pub fn git_identity(&self) -> GitIdentity {
        let defaults = GitIdentity::default();
        GitIdentity {
            name: non_blank(self.git.author_name.as_deref()).unwrap_or(defaults.name),
            email: non_blank(self.git.author_email.as_deref()).unwrap_or(defaults.email),
        }
    }

    /// Branch a fresh workspace starts on.
    pub fn base_branch(&self) -> String {
        non_blank(self.git.base_branch.as_deref())
            .unwrap_or_else(|| DEFAULT_BASE_BRANCH.to_string())
    }
}

/// Load the workspace config. A missing file yields defaults.
pub fn load_config(config_path: &Path) -> Result<MigrateConfig> {
    if !config_path.exists() {
        return Ok(MigrateConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MigrateConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
