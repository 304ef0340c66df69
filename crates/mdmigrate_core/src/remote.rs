use std::collections::{BTreeSet, HashMap};
use std::env;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::config::{
    API_KEY_ENV, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_MS, DEFAULT_USER_AGENT, MigrateConfig,
    RETRIES_ENV, SPACE_URL_ENV, TIMEOUT_ENV, USER_AGENT_ENV,
};
use crate::model::{ItemType, MigrateItem, comment_item_key};

const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteProject {
    pub id: i64,
    pub key: String,
    pub name: String,
}

/// One listed remote item: enough identity to build a [`MigrateItem`] and fetch it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub item_type: ItemType,
    pub id: i64,
    pub parent_id: Option<i64>,
    pub key: String,
    pub url: String,
}

/// Current remote state of one item.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteContent {
    pub content: String,
    pub updated_at: Option<String>,
    pub attachment_names: BTreeSet<String>,
    /// Current display name (wiki title, issue-type name); may differ from the stored key.
    pub name: Option<String>,
}

/// Narrow view of the tracked system consumed by the migration engine.
pub trait ContentGateway {
    fn get_project(&mut self, project_key: &str) -> Result<RemoteProject>;
    fn list_issues(&mut self, project: &RemoteProject) -> Result<Vec<RemoteEntry>>;
    fn list_comments(&mut self, issue: &RemoteEntry) -> Result<Vec<RemoteEntry>>;
    fn list_wikis(&mut self, project: &RemoteProject) -> Result<Vec<RemoteEntry>>;
    fn list_issue_types(&mut self, project: &RemoteProject) -> Result<Vec<RemoteEntry>>;
    fn fetch_current(&mut self, item: &MigrateItem) -> Result<RemoteContent>;
    /// Replace the item's remote content. Returns the remote update timestamp when known.
    fn push(&mut self, item: &MigrateItem, content: &str) -> Result<Option<String>>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub space_url: String,
    pub api_key: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
    pub max_retries: usize,
    pub max_write_retries: usize,
    pub retry_delay_ms: u64,
}

impl HttpGatewayConfig {
    /// Resolve settings: environment > config file > defaults. The API key only comes
    /// from the environment.
    pub fn from_config(config: &MigrateConfig) -> Result<Self> {
        Self::from_config_with_lookup(config, |key| env::var(key).ok())
    }

    fn from_config_with_lookup<F>(config: &MigrateConfig, lookup_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_value = |key: &str| {
            lookup_env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let space_url = env_value(SPACE_URL_ENV)
            .or_else(|| config.remote.space_url.clone())
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!("remote space URL is not set (set {SPACE_URL_ENV} or [remote] space_url)")
            })?;
        Url::parse(&space_url).with_context(|| format!("invalid space URL: {space_url}"))?;
        let Some(api_key) = env_value(API_KEY_ENV) else {
            bail!("{API_KEY_ENV} is not set");
        };

        let user_agent = env_value(USER_AGENT_ENV)
            .or_else(|| config.remote.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let timeout_ms = env_value(TIMEOUT_ENV)
            .and_then(|value| value.parse::<u64>().ok())
            .or(config.remote.timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        let max_retries = env_value(RETRIES_ENV)
            .and_then(|value| value.parse::<usize>().ok())
            .or(config.remote.max_retries)
            .unwrap_or(DEFAULT_MAX_RETRIES);

        Ok(Self {
            space_url,
            api_key,
            user_agent,
            timeout_ms,
            rate_limit_read_ms: 200,
            rate_limit_write_ms: 500,
            max_retries,
            max_write_retries: 1,
            retry_delay_ms: 500,
        })
    }
}

pub fn issue_url(space_url: &str, issue_key: &str) -> String {
    format!("{space_url}/view/{issue_key}")
}

pub fn comment_url(space_url: &str, issue_key: &str, comment_id: i64) -> String {
    format!("{space_url}/view/{issue_key}#comment-{comment_id}")
}

pub fn wiki_url(space_url: &str, wiki_id: i64) -> String {
    format!("{space_url}/alias/wiki/{wiki_id}")
}

pub fn issue_type_url(space_url: &str, issue_type_id: i64) -> String {
    format!("{space_url}/EditIssueType.action?issueType.id={issue_type_id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueTypeRecord {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub template_description: Option<String>,
}

/// Issue types per project id. The remote has no single issue-type endpoint, so the
/// full list is fetched once per project and dropped after any write.
#[derive(Debug, Default)]
pub struct IssueTypeCache {
    entries: HashMap<i64, Vec<IssueTypeRecord>>,
}

impl IssueTypeCache {
    pub fn get(&self, project_id: i64) -> Option<&[IssueTypeRecord]> {
        self.entries.get(&project_id).map(Vec::as_slice)
    }

    pub fn insert(&mut self, project_id: i64, records: Vec<IssueTypeRecord>) {
        self.entries.insert(project_id, records);
    }

    pub fn invalidate(&mut self, project_id: i64) {
        self.entries.remove(&project_id);
    }
}

/// [`ContentGateway`] speaking the tracked system's REST v2 API.
pub struct HttpGateway {
    client: Client,
    config: HttpGatewayConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
    issue_types: IssueTypeCache,
}

impl HttpGateway {
    pub fn new(config: HttpGatewayConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
            issue_types: IssueTypeCache::default(),
        })
    }

    pub fn space_url(&self) -> &str {
        &self.config.space_url
    }

    fn get<T: DeserializeOwned>(&mut self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let payload = self.request(Method::GET, path, query, &[])?;
        serde_json::from_value(payload)
            .with_context(|| format!("failed to decode response from {path}"))
    }

    fn patch<T: DeserializeOwned>(&mut self, path: &str, form: &[(&str, String)]) -> Result<T> {
        let payload = self.request(Method::PATCH, path, &[], form)?;
        serde_json::from_value(payload)
            .with_context(|| format!("failed to decode response from {path}"))
    }

    fn request(
        &mut self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        form: &[(&str, String)],
    ) -> Result<Value> {
        let is_write = method != Method::GET;
        let max_retries = if is_write {
            self.config.max_write_retries
        } else {
            self.config.max_retries
        };
        let url = format!("{}/api/v2/{path}", self.config.space_url);
        let url = Url::parse(&url).with_context(|| format!("invalid request URL: {url}"))?;

        let mut pairs = Vec::with_capacity(query.len() + 1);
        pairs.push(("apiKey".to_string(), self.config.api_key.clone()));
        for (key, value) in query {
            pairs.push(((*key).to_string(), value.clone()));
        }

        for attempt in 0..=max_retries {
            self.apply_rate_limit(is_write);
            let mut builder: RequestBuilder = self
                .client
                .request(method.clone(), url.clone())
                .header("User-Agent", self.config.user_agent.clone())
                .query(&pairs);
            if !form.is_empty() {
                builder = builder.form(form);
            }

            match builder.send() {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt, is_write);
                            continue;
                        }
                        let body = response.text().unwrap_or_default();
                        bail!(
                            "{method} {path} failed with HTTP {status}: {}",
                            remote_error_message(&body)
                        );
                    }
                    return response
                        .json::<Value>()
                        .with_context(|| format!("failed to decode JSON from {path}"));
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    return Err(error).with_context(|| format!("failed to call {method} {path}"));
                }
            }
        }

        bail!("{method} {path} exhausted retry budget")
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize, is_write: bool) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        let multiplier = if is_write { 2u64 } else { 1u64 };
        let delay = base.saturating_mul(multiplier).saturating_add(jitter);
        debug!(attempt, delay_ms = delay, "retrying remote request");
        sleep(Duration::from_millis(delay));
    }

    fn issue_types_for(&mut self, project_id: i64) -> Result<Vec<IssueTypeRecord>> {
        if let Some(cached) = self.issue_types.get(project_id) {
            return Ok(cached.to_vec());
        }
        let records: Vec<IssueTypeRecord> =
            self.get(&format!("projects/{project_id}/issueTypes"), &[])?;
        self.issue_types.insert(project_id, records.clone());
        Ok(records)
    }
}

impl ContentGateway for HttpGateway {
    fn get_project(&mut self, project_key: &str) -> Result<RemoteProject> {
        let project: ProjectPayload = self.get(&format!("projects/{project_key}"), &[])?;
        Ok(RemoteProject {
            id: project.id,
            key: project.project_key,
            name: project.name,
        })
    }

    fn list_issues(&mut self, project: &RemoteProject) -> Result<Vec<RemoteEntry>> {
        let mut entries = Vec::new();
        let mut offset = 0usize;
        loop {
            let page: Vec<IssuePayload> = self.get(
                "issues",
                &[
                    ("projectId[]", project.id.to_string()),
                    ("count", PAGE_SIZE.to_string()),
                    ("offset", offset.to_string()),
                    ("sort", "created".to_string()),
                    ("order", "asc".to_string()),
                ],
            )?;
            let fetched = page.len();
            for issue in page {
                entries.push(RemoteEntry {
                    item_type: ItemType::Issue,
                    id: issue.id,
                    parent_id: None,
                    url: issue_url(&self.config.space_url, &issue.issue_key),
                    key: issue.issue_key,
                });
            }
            if fetched < PAGE_SIZE {
                break;
            }
            offset += fetched;
        }
        Ok(entries)
    }

    fn list_comments(&mut self, issue: &RemoteEntry) -> Result<Vec<RemoteEntry>> {
        let mut entries = Vec::new();
        let mut min_id: Option<i64> = None;
        loop {
            let mut query = vec![
                ("count", PAGE_SIZE.to_string()),
                ("order", "asc".to_string()),
            ];
            if let Some(min_id) = min_id {
                query.push(("minId", min_id.to_string()));
            }
            let page: Vec<CommentPayload> =
                self.get(&format!("issues/{}/comments", issue.key), &query)?;
            let fetched = page.len();
            for comment in page {
                min_id = Some(comment.id + 1);
                // System comments (status changes) carry no text and are not migrated.
                if comment.content.as_deref().is_none_or(|text| text.trim().is_empty()) {
                    continue;
                }
                entries.push(RemoteEntry {
                    item_type: ItemType::Comment,
                    id: comment.id,
                    parent_id: Some(issue.id),
                    key: comment_item_key(&issue.key, comment.id),
                    url: comment_url(&self.config.space_url, &issue.key, comment.id),
                });
            }
            if fetched < PAGE_SIZE {
                break;
            }
        }
        Ok(entries)
    }

    fn list_wikis(&mut self, project: &RemoteProject) -> Result<Vec<RemoteEntry>> {
        let wikis: Vec<WikiPayload> =
            self.get("wikis", &[("projectIdOrKey", project.key.clone())])?;
        Ok(wikis
            .into_iter()
            .map(|wiki| RemoteEntry {
                item_type: ItemType::Wiki,
                id: wiki.id,
                parent_id: Some(project.id),
                url: wiki_url(&self.config.space_url, wiki.id),
                key: wiki.name,
            })
            .collect())
    }

    fn list_issue_types(&mut self, project: &RemoteProject) -> Result<Vec<RemoteEntry>> {
        let records = self.issue_types_for(project.id)?;
        Ok(records
            .into_iter()
            .map(|record| RemoteEntry {
                item_type: ItemType::IssueTypeDescription,
                id: record.id,
                parent_id: Some(project.id),
                url: issue_type_url(&self.config.space_url, record.id),
                key: record.name,
            })
            .collect())
    }

    fn fetch_current(&mut self, item: &MigrateItem) -> Result<RemoteContent> {
        match item.item_type {
            ItemType::Issue => {
                let issue: IssuePayload = self.get(&format!("issues/{}", item.item_key), &[])?;
                Ok(RemoteContent {
                    content: issue.description.unwrap_or_default(),
                    updated_at: issue.updated,
                    attachment_names: attachment_names(&issue.attachments),
                    name: Some(issue.issue_key),
                })
            }
            ItemType::Comment => {
                let issue_key = issue_key_of_comment(item)?;
                let comment: CommentPayload = self.get(
                    &format!("issues/{issue_key}/comments/{}", item.item_id),
                    &[],
                )?;
                Ok(RemoteContent {
                    content: comment.content.unwrap_or_default(),
                    updated_at: comment.updated,
                    attachment_names: BTreeSet::new(),
                    name: None,
                })
            }
            ItemType::Wiki => {
                let wiki: WikiPayload = self.get(&format!("wikis/{}", item.item_id), &[])?;
                Ok(RemoteContent {
                    content: wiki.content.unwrap_or_default(),
                    updated_at: wiki.updated,
                    attachment_names: attachment_names(&wiki.attachments),
                    name: Some(wiki.name),
                })
            }
            ItemType::IssueTypeDescription => {
                let project_id = item.parent_id.ok_or_else(|| {
                    anyhow::anyhow!("issue type {} has no project id", item.item_key)
                })?;
                let record = self
                    .issue_types_for(project_id)?
                    .into_iter()
                    .find(|record| record.id == item.item_id)
                    .ok_or_else(|| {
                        anyhow::anyhow!("issue type {} no longer exists", item.item_id)
                    })?;
                Ok(RemoteContent {
                    content: record.template_description.unwrap_or_default(),
                    updated_at: None,
                    attachment_names: BTreeSet::new(),
                    name: Some(record.name),
                })
            }
        }
    }

    fn push(&mut self, item: &MigrateItem, content: &str) -> Result<Option<String>> {
        match item.item_type {
            ItemType::Issue => {
                let issue: IssuePayload = self.patch(
                    &format!("issues/{}", item.item_key),
                    &[("description", content.to_string())],
                )?;
                Ok(issue.updated)
            }
            ItemType::Comment => {
                let issue_key = issue_key_of_comment(item)?;
                let comment: CommentPayload = self.patch(
                    &format!("issues/{issue_key}/comments/{}", item.item_id),
                    &[("content", content.to_string())],
                )?;
                Ok(comment.updated)
            }
            ItemType::Wiki => {
                let wiki: WikiPayload = self.patch(
                    &format!("wikis/{}", item.item_id),
                    &[("content", content.to_string())],
                )?;
                Ok(wiki.updated)
            }
            ItemType::IssueTypeDescription => {
                let project_id = item.parent_id.ok_or_else(|| {
                    anyhow::anyhow!("issue type {} has no project id", item.item_key)
                })?;
                let _: IssueTypeRecord = self.patch(
                    &format!("projects/{project_id}/issueTypes/{}", item.item_id),
                    &[("templateDescription", content.to_string())],
                )?;
                self.issue_types.invalidate(project_id);
                Ok(None)
            }
        }
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn issue_key_of_comment(item: &MigrateItem) -> Result<&str> {
    match item.item_key.split_once("#comment-") {
        Some((issue_key, _)) if !issue_key.is_empty() => Ok(issue_key),
        _ => bail!("malformed comment key: {}", item.item_key),
    }
}

fn attachment_names(attachments: &[AttachmentPayload]) -> BTreeSet<String> {
    attachments
        .iter()
        .map(|attachment| attachment.name.clone())
        .collect()
}

fn remote_error_message(body: &str) -> String {
    let parsed: Option<ErrorResponse> = serde_json::from_str(body).ok();
    match parsed {
        Some(response) if !response.errors.is_empty() => response
            .errors
            .into_iter()
            .map(|error| error.message)
            .collect::<Vec<_>>()
            .join("; "),
        _ => body.chars().take(200).collect(),
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectPayload {
    id: i64,
    project_key: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssuePayload {
    id: i64,
    issue_key: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    updated: Option<String>,
    #[serde(default)]
    attachments: Vec<AttachmentPayload>,
}

#[derive(Debug, Deserialize)]
struct CommentPayload {
    id: i64,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    updated: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WikiPayload {
    id: i64,
    name: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    updated: Option<String>,
    #[serde(default)]
    attachments: Vec<AttachmentPayload>,
}

#[derive(Debug, Deserialize)]
struct AttachmentPayload {
    name: String,
}

#[derive(Debug, Deserialize, Default)]
struct ErrorResponse {
    #[serde(default)]
    errors: Vec<ErrorPayload>,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    message: String,
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{
        HttpGatewayConfig, IssuePayload, IssueTypeCache, IssueTypeRecord, WikiPayload,
        attachment_names, comment_url, issue_key_of_comment, issue_type_url, remote_error_message,
        wiki_url,
    };
    use crate::config::{API_KEY_ENV, MigrateConfig, SPACE_URL_ENV, TIMEOUT_ENV};
    use crate::model::ItemType;
    use crate::testing::item;

    #[test]
    fn config_prefers_env_over_file() {
        let mut config = MigrateConfig::default();
        config.remote.space_url = Some("https://file.backlog.test/".to_string());
        config.remote.timeout_ms = Some(1_000);
        let env = HashMap::from([
            (API_KEY_ENV.to_string(), "secret".to_string()),
            (TIMEOUT_ENV.to_string(), "2500".to_string()),
        ]);

        let resolved = HttpGatewayConfig::from_config_with_lookup(&config, |key| {
            env.get(key).cloned()
        })
        .expect("resolve");
        assert_eq!(resolved.space_url, "https://file.backlog.test");
        assert_eq!(resolved.api_key, "secret");
        assert_eq!(resolved.timeout_ms, 2_500);
        assert_eq!(resolved.max_retries, 2);

        let env = HashMap::from([
            (API_KEY_ENV.to_string(), "secret".to_string()),
            (SPACE_URL_ENV.to_string(), "https://env.backlog.test".to_string()),
        ]);
        let resolved = HttpGatewayConfig::from_config_with_lookup(&config, |key| {
            env.get(key).cloned()
        })
        .expect("resolve");
        assert_eq!(resolved.space_url, "https://env.backlog.test");
    }

    #[test]
    fn config_requires_space_and_key() {
        let config = MigrateConfig::default();
        let err = HttpGatewayConfig::from_config_with_lookup(&config, |_| None)
            .expect_err("missing space");
        assert!(err.to_string().contains("space URL"));

        let mut config = MigrateConfig::default();
        config.remote.space_url = Some("https://space.test".to_string());
        let err =
            HttpGatewayConfig::from_config_with_lookup(&config, |_| None).expect_err("no key");
        assert!(err.to_string().contains(API_KEY_ENV));
    }

    #[test]
    fn deep_links() {
        assert_eq!(
            comment_url("https://s.test", "PROJ-1", 9),
            "https://s.test/view/PROJ-1#comment-9"
        );
        assert_eq!(wiki_url("https://s.test", 4), "https://s.test/alias/wiki/4");
        assert_eq!(
            issue_type_url("https://s.test", 7),
            "https://s.test/EditIssueType.action?issueType.id=7"
        );
    }

    #[test]
    fn issue_type_cache_is_per_project() {
        let mut cache = IssueTypeCache::default();
        let record = IssueTypeRecord {
            id: 1,
            name: "Bug".to_string(),
            template_description: None,
        };
        cache.insert(10, vec![record.clone()]);
        assert_eq!(cache.get(10), Some(&[record][..]));
        assert!(cache.get(11).is_none());
        cache.invalidate(10);
        assert!(cache.get(10).is_none());
    }

    #[test]
    fn decodes_payloads() {
        let issue: IssuePayload = serde_json::from_str(
            r#"{"id":1,"issueKey":"PROJ-1","summary":"s","description":null,"updated":"2024-01-01T00:00:00Z","attachments":[{"id":3,"name":"a.png"}]}"#,
        )
        .expect("issue");
        assert_eq!(issue.issue_key, "PROJ-1");
        assert!(issue.description.is_none());
        assert!(attachment_names(&issue.attachments).contains("a.png"));

        let wiki: WikiPayload =
            serde_json::from_str(r#"{"id":5,"name":"Home","content":"* Hi"}"#).expect("wiki");
        assert_eq!(wiki.content.as_deref(), Some("* Hi"));
        assert!(wiki.attachments.is_empty());
    }

    #[test]
    fn remote_errors_are_summarised() {
        assert_eq!(
            remote_error_message(r#"{"errors":[{"message":"No issue.","code":6}]}"#),
            "No issue."
        );
        assert_eq!(remote_error_message("gateway down"), "gateway down");
    }

    #[test]
    fn comment_keys_yield_issue_keys() {
        let comment = item(ItemType::Comment, 9, "PROJ-1#comment-9");
        assert_eq!(issue_key_of_comment(&comment).expect("key"), "PROJ-1");
        let broken = item(ItemType::Comment, 9, "PROJ-1");
        assert!(issue_key_of_comment(&broken).is_err());
    }
}
