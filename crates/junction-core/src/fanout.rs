//! Parallel fan-out of one unit of work to several roles.
//!
//! Every target runs in its own task under a shared per-call timeout. A
//! failing or timed-out target becomes an error entry in the returned map;
//! it never cancels its siblings and the batch call itself never fails.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, instrument, warn};

use crate::config::RetryPolicy;
use crate::hub::{HubError, HubResult, MessageKind, RoleKey};
use crate::metrics::Metrics;
use crate::self_healing::Clearable;

/// Paired request/response transport. [`crate::hub::Hub`] is the production
/// implementation; tests substitute stubs.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn call(
        &self,
        from: RoleKey,
        to: RoleKey,
        kind: MessageKind,
        payload: Value,
        timeout: Duration,
    ) -> HubResult<Value>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct FanOutTarget {
    pub role: RoleKey,
    pub kind: MessageKind,
    pub payload: Value,
}

impl FanOutTarget {
    pub fn new(role: RoleKey, kind: MessageKind, payload: Value) -> Self {
        Self {
            role,
            kind,
            payload,
        }
    }
}

/// Per-target failure. Timeouts are kept distinct from every other failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("call to {role} timed out after {timeout_ms}ms")]
    Timeout { role: RoleKey, timeout_ms: u64 },

    #[error("call to {role} failed: {reason}")]
    Failed { role: RoleKey, reason: String },
}

pub type FanOutResults = BTreeMap<RoleKey, Result<Value, CallError>>;

/// Number of successful entries in a fan-out result map.
pub fn successes(results: &FanOutResults) -> usize {
    results.values().filter(|r| r.is_ok()).count()
}

pub struct FanOutExecutor {
    dispatch: Arc<dyn Dispatch>,
    cache: Option<Arc<ResultCache>>,
    cache_horizon: Duration,
    retry: RetryPolicy,
    max_concurrent: usize,
    metrics: Arc<Metrics>,
}

impl FanOutExecutor {
    pub fn new(dispatch: Arc<dyn Dispatch>, metrics: Arc<Metrics>) -> Self {
        Self {
            dispatch,
            cache: None,
            cache_horizon: Duration::MAX,
            retry: RetryPolicy::none(),
            max_concurrent: 8,
            metrics,
        }
    }

    /// Consult `cache` before calling; entries older than `horizon` are ignored.
    pub fn with_cache(mut self, cache: Arc<ResultCache>, horizon: Duration) -> Self {
        self.cache = Some(cache);
        self.cache_horizon = horizon;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    /// Call every target concurrently and collect one outcome per role.
    /// When a role appears twice, the later target's outcome wins.
    #[instrument(skip(self, targets), fields(from = %from, targets = targets.len()))]
    pub async fn execute(
        &self,
        from: RoleKey,
        targets: &[FanOutTarget],
        timeout: Duration,
    ) -> FanOutResults {
        let results: Arc<Mutex<Vec<(usize, RoleKey, Result<Value, CallError>)>>> =
            Arc::new(Mutex::new(Vec::with_capacity(targets.len())));
        let sem = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = Vec::with_capacity(targets.len());

        for (index, target) in targets.iter().cloned().enumerate() {
            if let Some(value) = self.cached(&target) {
                self.metrics.inc_cache_hits();
                debug!(role = %target.role, "fan-out cache hit");
                results.lock().await.push((index, target.role, Ok(value)));
                continue;
            }

            let dispatch = Arc::clone(&self.dispatch);
            let cache = self.cache.clone();
            let retry = self.retry.clone();
            let results = Arc::clone(&results);
            let sem = Arc::clone(&sem);

            tasks.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                let role = target.role;
                let outcome = match tokio::time::timeout(
                    timeout,
                    call_with_retry(dispatch.as_ref(), from, &target, timeout, &retry),
                )
                .await
                {
                    Ok(Ok(value)) => {
                        if let Some(cache) = cache {
                            cache.put(role, &target.payload, value.clone());
                        }
                        Ok(value)
                    }
                    Ok(Err(HubError::Timeout { timeout_ms, .. })) => {
                        Err(CallError::Timeout { role, timeout_ms })
                    }
                    Ok(Err(e)) => Err(CallError::Failed {
                        role,
                        reason: e.to_string(),
                    }),
                    Err(_) => Err(CallError::Timeout {
                        role,
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                };
                if let Err(e) = &outcome {
                    warn!(role = %role, error = %e, "fan-out target failed");
                }
                results.lock().await.push((index, role, outcome));
            }));
        }

        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "fan-out task aborted");
            }
        }

        let mut collected = std::mem::take(&mut *results.lock().await);
        collected.sort_by_key(|(index, _, _)| *index);
        collected
            .into_iter()
            .map(|(_, role, outcome)| (role, outcome))
            .collect()
    }

    fn cached(&self, target: &FanOutTarget) -> Option<Value> {
        self.cache
            .as_ref()?
            .get_fresh(target.role, &target.payload, self.cache_horizon)
    }
}

async fn call_with_retry(
    dispatch: &dyn Dispatch,
    from: RoleKey,
    target: &FanOutTarget,
    timeout: Duration,
    retry: &RetryPolicy,
) -> HubResult<Value> {
    let mut attempt = 0u32;
    loop {
        match dispatch
            .call(from, target.role, target.kind, target.payload.clone(), timeout)
            .await
        {
            Err(e) if e.is_transient() && attempt < retry.max_retries => {
                attempt += 1;
                let delay = retry.backoff(attempt);
                debug!(role = %target.role, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying transient failure");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    stored_at: DateTime<Utc>,
}

/// Content-addressed store of fan-out results keyed by role and canonical
/// payload. Overwrite-on-write; staleness is judged by the reader.
#[derive(Debug, Default)]
pub struct ResultCache {
    entries: std::sync::Mutex<HashMap<String, CacheEntry>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// SHA-256 over the role name and the payload's canonical JSON.
    pub fn key(role: RoleKey, payload: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(role.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical_json(payload).as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn put(&self, role: RoleKey, payload: &Value, value: Value) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            Self::key(role, payload),
            CacheEntry {
                value,
                stored_at: Utc::now(),
            },
        );
    }

    pub fn get(&self, role: RoleKey, payload: &Value) -> Option<Value> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(&Self::key(role, payload)).map(|e| e.value.clone())
    }

    /// Like [`get`](Self::get) but ignores entries older than `horizon`.
    pub fn get_fresh(&self, role: RoleKey, payload: &Value, horizon: Duration) -> Option<Value> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(&Self::key(role, payload))?;
        let age = Utc::now()
            .signed_duration_since(entry.stored_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        (age <= horizon).then(|| entry.value.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Clearable for ResultCache {
    fn cache_name(&self) -> &'static str {
        "fanout.result_cache"
    }

    fn clear_cache(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let n = entries.len();
        entries.clear();
        n
    }
}

/// JSON with object keys sorted recursively.
pub fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let ordered: BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, sorted(v))).collect();
                Value::Object(ordered.into_iter().map(|(k, v)| (k.clone(), v)).collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}
