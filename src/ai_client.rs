//! Classification oracle client
//!
//! Sends tab metadata to the external grouping service and turns its
//! responses into validated structures. The oracle is untrusted: it can
//! reference ids that were never sent ("hallucinations"), drop ids, or
//! return garbage, so every response is filtered against the input set
//! before anything reaches the tree.
//!
//! Two request modes share one `{mode, payload}` envelope:
//! - `FULL_REGROUP` classifies an entire tab set into a fresh tree
//! - `INCREMENTAL` returns one placement action per new tab, against a
//!   compressed summary of the existing tree (titles and ids only)

use crate::models::{ClusterTree, Group, Subgroup, TabRecord};
use crate::utils::safe_truncate;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::{sleep, Duration};

/// Retry budget for transient oracle failures
pub const MAX_RETRIES: u32 = 5;

/// Titles longer than this are truncated in request payloads
const MAX_TITLE_BYTES: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClassifyMode {
    #[serde(rename = "FULL_REGROUP")]
    FullRegroup,
    #[serde(rename = "INCREMENTAL")]
    Incremental,
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("rate limited by classification service")]
    RateLimited,
    #[error("classification service error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("request failed: {0}")]
    Transport(String),
    #[error("malformed oracle response: {0}")]
    Malformed(String),
}

impl OracleError {
    /// Rate limits, 5xx responses, and transport drops are worth
    /// retrying; other API errors and parse failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            OracleError::RateLimited => true,
            OracleError::Api { status, .. } => *status >= 500,
            OracleError::Transport(_) => true,
            OracleError::Malformed(_) => false,
        }
    }
}

#[async_trait]
pub trait OracleTransport: Send + Sync {
    async fn call(&self, mode: ClassifyMode, payload: Value) -> Result<Value, OracleError>;
}

#[async_trait]
impl<T: OracleTransport + ?Sized> OracleTransport for std::sync::Arc<T> {
    async fn call(&self, mode: ClassifyMode, payload: Value) -> Result<Value, OracleError> {
        (**self).call(mode, payload).await
    }
}

// ==================== Retry / backoff ====================

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig { max_retries: MAX_RETRIES, base_delay_ms: 1000 }
    }
}

impl RetryConfig {
    /// Exponential backoff with full jitter: `2^attempt * base` plus a
    /// random `0..base` slice
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        let jitter = if self.base_delay_ms > 0 {
            rand::thread_rng().gen_range(0..self.base_delay_ms)
        } else {
            0
        };
        Duration::from_millis(backoff + jitter)
    }
}

/// Wraps any transport with the retry budget. Non-retryable errors and
/// budget exhaustion propagate to the caller, who applies the
/// everything-ungrouped fallback.
pub struct RetryingTransport<T: OracleTransport> {
    inner: T,
    config: RetryConfig,
}

impl<T: OracleTransport> RetryingTransport<T> {
    pub fn new(inner: T, config: RetryConfig) -> Self {
        RetryingTransport { inner, config }
    }
}

#[async_trait]
impl<T: OracleTransport> OracleTransport for RetryingTransport<T> {
    async fn call(&self, mode: ClassifyMode, payload: Value) -> Result<Value, OracleError> {
        let attempts = self.config.max_retries.max(1);
        for attempt in 0..attempts {
            match self.inner.call(mode, payload.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    eprintln!("[Oracle] Attempt {}/{} failed: {}", attempt + 1, attempts, e);
                    sleep(self.config.delay_for(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("retry loop returns on last attempt")
    }
}

// ==================== HTTP transport ====================

/// Single-shot POST of the `{mode, payload}` envelope
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        HttpTransport {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
        }
    }

    /// The production transport: HTTP with the standard retry budget
    pub fn with_retries(
        endpoint: impl Into<String>,
        api_key: Option<String>,
    ) -> RetryingTransport<HttpTransport> {
        RetryingTransport::new(Self::new(endpoint, api_key), RetryConfig::default())
    }
}

#[async_trait]
impl OracleTransport for HttpTransport {
    async fn call(&self, mode: ClassifyMode, payload: Value) -> Result<Value, OracleError> {
        let envelope = json!({ "mode": mode, "payload": payload });
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&envelope);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(OracleError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::Api { status: status.as_u16(), body });
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| OracleError::Malformed(e.to_string()))
    }
}

// ==================== Wire types ====================

#[derive(Debug, Serialize)]
struct TabMeta<'a> {
    id: &'a str,
    title: &'a str,
    url: &'a str,
}

impl<'a> TabMeta<'a> {
    fn from_record(tab: &'a TabRecord) -> Self {
        TabMeta {
            id: &tab.id,
            title: safe_truncate(&tab.title, MAX_TITLE_BYTES),
            url: &tab.url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireTabRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireSubgroup {
    title: String,
    #[serde(default)]
    tabs: Vec<WireTabRef>,
}

#[derive(Debug, Deserialize)]
struct WireGroup {
    title: String,
    #[serde(default)]
    subgroups: Vec<WireSubgroup>,
}

#[derive(Debug, Deserialize)]
struct WireFullResponse {
    #[serde(default)]
    groups: Vec<WireGroup>,
    #[serde(default)]
    ungrouped: Vec<WireTabRef>,
}

/// Compressed view of the existing tree for incremental requests:
/// titles and already-placed ids only, never full tab metadata
#[derive(Debug, Serialize)]
struct SummarySubgroup<'a> {
    title: &'a str,
    #[serde(rename = "existingTabIds")]
    existing_tab_ids: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
struct SummaryGroup<'a> {
    title: &'a str,
    subgroups: Vec<SummarySubgroup<'a>>,
}

fn summarize_tree(tree: &ClusterTree) -> Vec<SummaryGroup<'_>> {
    tree.groups
        .iter()
        .map(|group| SummaryGroup {
            title: &group.title,
            subgroups: group
                .subgroups
                .iter()
                .map(|sg| SummarySubgroup {
                    title: &sg.title,
                    existing_tab_ids: sg.tabs.iter().map(|t| t.id.as_str()).collect(),
                })
                .collect(),
        })
        .collect()
}

// ==================== Actions ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAction {
    tab_id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    target_group_title: Option<String>,
    #[serde(default)]
    target_subgroup_title: Option<String>,
    #[serde(default)]
    new_subgroup_title: Option<String>,
    #[serde(default)]
    new_group_title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireActionsResponse {
    actions: Vec<RawAction>,
}

/// One placement decision per new tab, as returned by the oracle.
/// `Unknown` carries anything unrecognized so the merge can route the tab
/// to the ungrouped bucket instead of dropping it.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    AppendSubgroup { tab_id: String, group_title: String, subgroup_title: String },
    InsertSubgroup { tab_id: String, group_title: String, subgroup_title: String },
    InsertGroup { tab_id: String, group_title: String, subgroup_title: String },
    Ungrouped { tab_id: String },
    Unknown { tab_id: String, kind: String },
}

impl Action {
    pub fn tab_id(&self) -> &str {
        match self {
            Action::AppendSubgroup { tab_id, .. }
            | Action::InsertSubgroup { tab_id, .. }
            | Action::InsertGroup { tab_id, .. }
            | Action::Ungrouped { tab_id }
            | Action::Unknown { tab_id, .. } => tab_id,
        }
    }
}

impl From<RawAction> for Action {
    fn from(raw: RawAction) -> Self {
        // A recognized kind missing its required titles degrades to
        // Unknown, which the merge routes to ungrouped
        match raw.kind.as_str() {
            "APPEND_SUBGROUP" => {
                match (raw.target_group_title, raw.target_subgroup_title) {
                    (Some(group), Some(subgroup)) => Action::AppendSubgroup {
                        tab_id: raw.tab_id,
                        group_title: group,
                        subgroup_title: subgroup,
                    },
                    _ => Action::Unknown { tab_id: raw.tab_id, kind: raw.kind },
                }
            }
            "INSERT_SUBGROUP" => match (raw.target_group_title, raw.new_subgroup_title) {
                (Some(group), Some(subgroup)) => Action::InsertSubgroup {
                    tab_id: raw.tab_id,
                    group_title: group,
                    subgroup_title: subgroup,
                },
                _ => Action::Unknown { tab_id: raw.tab_id, kind: raw.kind },
            },
            "INSERT_GROUP" => match (raw.new_group_title, raw.new_subgroup_title) {
                (Some(group), Some(subgroup)) => Action::InsertGroup {
                    tab_id: raw.tab_id,
                    group_title: group,
                    subgroup_title: subgroup,
                },
                _ => Action::Unknown { tab_id: raw.tab_id, kind: raw.kind },
            },
            "UNGROUPED" => Action::Ungrouped { tab_id: raw.tab_id },
            _ => Action::Unknown { tab_id: raw.tab_id, kind: raw.kind },
        }
    }
}

// ==================== Client ====================

/// Prompt-level context forwarded with each request
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub custom_instruction: Option<String>,
}

impl PromptContext {
    pub fn from_settings(settings: &crate::settings::Settings) -> Self {
        PromptContext {
            custom_instruction: settings.active_custom_instruction().map(String::from),
        }
    }
}

pub struct AiClient {
    transport: Box<dyn OracleTransport>,
}

impl AiClient {
    pub fn new(transport: impl OracleTransport + 'static) -> Self {
        AiClient { transport: Box::new(transport) }
    }

    /// Classify an entire tab set into a fresh tree.
    ///
    /// Never fails: any transport or parse problem degrades to the
    /// conservative everything-ungrouped tree. Hallucinated ids are
    /// dropped; input ids the oracle failed to place are appended to
    /// `ungrouped` so no archived tab can disappear.
    pub async fn classify_full(&self, tabs: &[TabRecord], ctx: &PromptContext) -> ClusterTree {
        if tabs.is_empty() {
            return ClusterTree::default();
        }
        println!("[Oracle] Full regroup requested for {} tabs", tabs.len());

        let mut payload = json!({
            "tabs": tabs.iter().map(TabMeta::from_record).collect::<Vec<_>>(),
        });
        if let Some(instruction) = &ctx.custom_instruction {
            payload["customInstruction"] = json!(instruction);
        }

        let response = match self.transport.call(ClassifyMode::FullRegroup, payload).await {
            Ok(value) => value,
            Err(e) => {
                eprintln!("[Oracle] Full regroup failed: {}", e);
                return everything_ungrouped(tabs);
            }
        };

        let parsed: WireFullResponse = match serde_json::from_value(response) {
            Ok(parsed) => parsed,
            Err(e) => {
                eprintln!("[Oracle] Unusable full-regroup response: {}", e);
                return everything_ungrouped(tabs);
            }
        };

        rehydrate_full_response(parsed, tabs)
    }

    /// Ask for one placement action per new tab, against a compressed
    /// summary of the existing tree. Errors propagate: the caller owns
    /// the push-to-ungrouped fallback because it must also clear the
    /// unprocessed queue.
    pub async fn classify_incremental(
        &self,
        new_tabs: &[TabRecord],
        existing: &ClusterTree,
        ctx: &PromptContext,
    ) -> Result<Vec<Action>, OracleError> {
        println!(
            "[Oracle] Incremental integration requested for {} new tabs",
            new_tabs.len()
        );

        let mut payload = json!({
            "newTabs": new_tabs.iter().map(TabMeta::from_record).collect::<Vec<_>>(),
            "existingGroups": summarize_tree(existing),
        });
        if let Some(instruction) = &ctx.custom_instruction {
            payload["customInstruction"] = json!(instruction);
        }

        let response = self.transport.call(ClassifyMode::Incremental, payload).await?;
        let parsed: WireActionsResponse = serde_json::from_value(response)
            .map_err(|e| OracleError::Malformed(format!("missing or invalid actions array: {}", e)))?;

        Ok(parsed.actions.into_iter().map(Action::from).collect())
    }
}

fn everything_ungrouped(tabs: &[TabRecord]) -> ClusterTree {
    ClusterTree { groups: Vec::new(), ungrouped: tabs.to_vec() }
}

/// Swap the oracle's bare id references back for full records, dropping
/// hallucinated ids and re-appending any input id the oracle lost
fn rehydrate_full_response(parsed: WireFullResponse, tabs: &[TabRecord]) -> ClusterTree {
    let lookup: std::collections::HashMap<&str, &TabRecord> =
        tabs.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut placed = std::collections::HashSet::new();

    let mut take = |id: &str| -> Option<TabRecord> {
        let record = lookup.get(id)?;
        if !placed.insert(record.id.clone()) {
            eprintln!("[Oracle] Duplicate placement for tab {} ignored", id);
            return None;
        }
        Some((*record).clone())
    };

    let groups = parsed
        .groups
        .into_iter()
        .map(|group| Group {
            title: group.title,
            subgroups: group
                .subgroups
                .into_iter()
                .map(|sg| Subgroup {
                    title: sg.title,
                    tabs: sg.tabs.iter().filter_map(|r| take(&r.id)).collect(),
                })
                .collect(),
            live_group_id: None,
        })
        .collect();

    let mut ungrouped: Vec<TabRecord> =
        parsed.ungrouped.iter().filter_map(|r| take(&r.id)).collect();
    drop(take);

    // Contract says every input id comes back exactly once; enforce the
    // "at least once" half ourselves
    for tab in tabs {
        if !placed.contains(&tab.id) {
            eprintln!("[Oracle] Tab {} missing from response, keeping it ungrouped", tab.id);
            ungrouped.push(tab.clone());
        }
    }

    ClusterTree { groups, ungrouped }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Transport stub fed a queue of canned results. Records every call.
    pub struct StubTransport {
        responses: Mutex<VecDeque<Result<Value, OracleError>>>,
        pub calls: Mutex<Vec<(ClassifyMode, Value)>>,
    }

    impl StubTransport {
        pub fn new() -> Self {
            StubTransport { responses: Mutex::new(VecDeque::new()), calls: Mutex::new(Vec::new()) }
        }

        pub fn reply_ok(self, value: Value) -> Self {
            self.responses.lock().unwrap().push_back(Ok(value));
            self
        }

        pub fn reply_err(self, error: OracleError) -> Self {
            self.responses.lock().unwrap().push_back(Err(error));
            self
        }

        pub fn push_ok(&self, value: Value) {
            self.responses.lock().unwrap().push_back(Ok(value));
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl OracleTransport for StubTransport {
        async fn call(&self, mode: ClassifyMode, payload: Value) -> Result<Value, OracleError> {
            self.calls.lock().unwrap().push((mode, payload));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(OracleError::Transport("stub exhausted".to_string())))
        }
    }
}
