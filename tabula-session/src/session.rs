//! Request-facing coordinator.
//!
//! [`SessionCoordinator`] owns the dataset registry, the stats engine, the analysis
//! cache and the rate limiter. One instance is built at startup and shared by
//! handle with every request handler. Each dataset moves through three states:
//! registered on upload, paged any number of times, and expired by the sweep.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::cache::{AnalysisKey, BoundedCache};
use crate::clock::{system_clock, Clock};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::llm::{build_prompt, LlmClient, OfflineClient, Provider};
use crate::log_data_op;
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::registry::{DatasetInfo, DatasetRegistry, PageData};
use crate::security::{client_identity, ApiKeyGate, SecureString};
use crate::sources::{StorageHandle, TableReader};
use crate::stats::{IncrementalStatsEngine, RunningAggregate};

const MAX_MODEL_NAME_LEN: usize = 128;

/// Who is calling, as seen at the request boundary.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub identity: String,
    pub api_key: Option<SecureString>,
}

impl ClientRequest {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            api_key: None,
        }
    }

    /// Builds a request from the forwarded-for header, the peer address and the API key header.
    pub fn from_parts(
        forwarded_for: Option<&str>,
        peer: Option<IpAddr>,
        api_key: Option<&str>,
    ) -> Self {
        Self {
            identity: client_identity(forwarded_for, peer),
            api_key: api_key.map(SecureString::from),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(SecureString::new(key.into()));
        self
    }
}

/// Page request for an already uploaded dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub dataset_id: String,
    pub page: usize,
    #[serde(default)]
    pub page_size: Option<usize>,
}

impl PageRequest {
    pub fn new(dataset_id: impl Into<String>, page: usize, page_size: usize) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            page,
            page_size: Some(page_size),
        }
    }
}

/// Rows of one page plus everything a client needs to paginate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageResponse {
    pub dataset_id: String,
    pub columns: Vec<String>,
    pub table_data: Vec<Map<String, Value>>,
    pub total_rows: usize,
    pub current_page: usize,
    pub page_size: usize,
    pub total_pages: usize,
    pub aggregate: RunningAggregate,
}

impl PageResponse {
    fn build(
        dataset_id: String,
        page: PageData,
        total_rows: usize,
        aggregate: RunningAggregate,
    ) -> Result<Self> {
        Ok(Self {
            table_data: page.to_json_rows()?,
            total_pages: total_rows.div_ceil(page.page_size),
            dataset_id,
            columns: page.columns,
            total_rows,
            current_page: page.page,
            page_size: page.page_size,
            aggregate,
        })
    }
}

/// Table slice to send for analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub provider: String,
    pub model: String,
    pub table_data: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyzeResponse {
    /// `provider:model`
    pub model: String,
    #[serde(rename = "analysis")]
    pub result: String,
    pub timestamp: DateTime<Utc>,
    /// Whether the result came from the cache. Not exposed to clients.
    #[serde(skip)]
    pub cache_hit: bool,
}

/// What one sweep pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub datasets_evicted: Vec<String>,
    pub orphaned_aggregates: usize,
    pub cache_entries_expired: usize,
    pub rate_buckets_pruned: usize,
}

/// Renders table rows as stable text for prompting and cache keying.
///
/// Columns are the sorted union of all row keys, so the same data produces the
/// same text regardless of key order. Only the first `row_limit` rows are used.
pub fn canonical_table_text(rows: &[Map<String, Value>], row_limit: usize) -> String {
    let rows = &rows[..rows.len().min(row_limit)];
    let columns: BTreeSet<&str> = rows
        .iter()
        .flat_map(|row| row.keys().map(String::as_str))
        .collect();

    let mut text = columns.iter().copied().collect::<Vec<_>>().join("\t");
    for row in rows {
        text.push('\n');
        let cells: Vec<String> = columns
            .iter()
            .map(|column| match row.get(*column) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(value)) => value.clone(),
                Some(other) => other.to_string(),
            })
            .collect();
        text.push_str(&cells.join("\t"));
    }
    text
}

/// Wires the registry, stats engine, cache and rate limiter into request flows.
#[derive(Debug)]
pub struct SessionCoordinator {
    config: SessionConfig,
    registry: Arc<DatasetRegistry>,
    stats: Arc<IncrementalStatsEngine>,
    cache: Arc<BoundedCache<AnalysisKey, String>>,
    limiter: RateLimiter,
    gate: ApiKeyGate,
    llm: Arc<dyn LlmClient>,
}

impl SessionCoordinator {
    /// Builds a coordinator. In test mode `llm` is replaced by [`OfflineClient`].
    pub fn new(
        config: SessionConfig,
        reader: Arc<dyn TableReader>,
        llm: Arc<dyn LlmClient>,
    ) -> Result<Self> {
        Self::with_clock(config, reader, llm, system_clock())
    }

    pub fn with_clock(
        config: SessionConfig,
        reader: Arc<dyn TableReader>,
        llm: Arc<dyn LlmClient>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let llm: Arc<dyn LlmClient> = if config.test_mode() {
            info!("Test mode enabled, analysis requests use the offline client");
            Arc::new(OfflineClient)
        } else {
            llm
        };

        let registry = DatasetRegistry::with_clock(reader, Arc::clone(&clock))
            .with_materialization(config.materialize_full_tables())
            .with_log_config(config.log().clone());
        let cache = BoundedCache::with_clock(
            config.cache_ttl(),
            config.cache_max_entries(),
            Arc::clone(&clock),
        );
        let limiter = RateLimiter::with_clock(
            config.rate_window(),
            config.rate_max_requests(),
            clock,
        );
        let gate = ApiKeyGate::new(config.api_key());

        Ok(Self {
            registry: Arc::new(registry),
            stats: Arc::new(IncrementalStatsEngine::new()),
            cache: Arc::new(cache),
            limiter,
            gate,
            llm,
            config,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &DatasetRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &IncrementalStatsEngine {
        &self.stats
    }

    pub fn cache(&self) -> &BoundedCache<AnalysisKey, String> {
        &self.cache
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Admission check run before any other work: rate limit first, then API key.
    pub fn gate(&self, request: &ClientRequest) -> Result<()> {
        if let RateDecision::Limited { retry_after_secs } = self.limiter.check(&request.identity)
        {
            warn!(
                identity = %self.config.log().key_field(&request.identity),
                retry_after_secs,
                "Request rejected by rate limiter"
            );
            return Err(SessionError::TooManyRequests { retry_after_secs });
        }

        self.gate
            .verify(request.api_key.as_ref().map(SecureString::expose))
            .inspect_err(|_| {
                warn!(
                    identity = %self.config.log().key_field(&request.identity),
                    "Request rejected by API key check"
                );
            })
    }

    fn resolve_page_size(&self, requested: Option<usize>) -> Result<usize> {
        match requested {
            None => Ok(self.config.default_page_size()),
            Some(0) => Err(SessionError::invalid_input("page_size must be positive")),
            Some(size) => Ok(size.min(self.config.max_page_size())),
        }
    }

    /// Registers an uploaded file, reads page 1 and seeds its aggregate.
    ///
    /// Uploads over the size limit or without data rows are rejected, and an
    /// ephemeral upload that fails to register is deleted.
    #[instrument(skip_all, fields(path = %handle.path().display(), kind = %handle.kind()))]
    pub async fn upload(
        &self,
        request: &ClientRequest,
        handle: StorageHandle,
        page_size: Option<usize>,
    ) -> Result<PageResponse> {
        self.gate(request)?;
        let page_size = self.resolve_page_size(page_size)?;

        let outcome = self.register_upload(handle.clone(), page_size).await;
        if outcome.is_err() && handle.is_ephemeral() {
            if let Err(e) = handle.release() {
                warn!(error = %e, "Failed to delete rejected upload");
            }
        }
        outcome
    }

    async fn register_upload(
        &self,
        handle: StorageHandle,
        page_size: usize,
    ) -> Result<PageResponse> {
        let size = handle.metadata()?.len();
        if size > self.config.max_upload_bytes() {
            return Err(SessionError::invalid_input(format!(
                "file is {size} bytes, the limit is {} bytes",
                self.config.max_upload_bytes()
            )));
        }

        let registry = Arc::clone(&self.registry);
        let stats = Arc::clone(&self.stats);
        let (dataset_id, page, total_rows, aggregate) = tokio::task::spawn_blocking(move || {
            let dataset_id = registry.register_source(handle)?;
            let total_rows = registry.total_rows(&dataset_id)?;
            if total_rows == 0 {
                registry.evict(&dataset_id, &stats);
                return Err(SessionError::invalid_input("file contains no data rows"));
            }
            let page = registry
                .fetch_page(&dataset_id, 1, page_size)
                .inspect_err(|_| {
                    registry.evict(&dataset_id, &stats);
                })?;
            let aggregate = stats.initialize(&dataset_id, &page.batch);
            Ok::<_, SessionError>((dataset_id, page, total_rows, aggregate))
        })
        .await??;

        log_data_op!(
            self.config.log(),
            dataset_id = %dataset_id,
            total_rows,
            page_size,
            "Dataset uploaded"
        );
        PageResponse::build(dataset_id, page, total_rows, aggregate)
    }

    /// Reads a page and merges it into the dataset's running aggregate.
    #[instrument(skip_all, fields(dataset_id = %page_request.dataset_id, page = page_request.page))]
    pub async fn fetch_page(
        &self,
        request: &ClientRequest,
        page_request: PageRequest,
    ) -> Result<PageResponse> {
        self.read_page(request, page_request, true).await
    }

    /// Reads a page without touching the aggregate.
    ///
    /// Safe to repeat: the response carries the aggregate as it currently stands.
    #[instrument(skip_all, fields(dataset_id = %page_request.dataset_id, page = page_request.page))]
    pub async fn peek_page(
        &self,
        request: &ClientRequest,
        page_request: PageRequest,
    ) -> Result<PageResponse> {
        self.read_page(request, page_request, false).await
    }

    async fn read_page(
        &self,
        request: &ClientRequest,
        page_request: PageRequest,
        merge: bool,
    ) -> Result<PageResponse> {
        self.gate(request)?;
        let page_size = self.resolve_page_size(page_request.page_size)?;
        let PageRequest {
            dataset_id, page, ..
        } = page_request;

        let registry = Arc::clone(&self.registry);
        let stats = Arc::clone(&self.stats);
        let (dataset_id, page, total_rows, aggregate) = tokio::task::spawn_blocking(move || {
            let total_rows = registry.total_rows(&dataset_id)?;
            let page = registry.fetch_page(&dataset_id, page, page_size)?;
            let aggregate = if merge {
                stats.update(&dataset_id, &page.batch)
            } else {
                stats.aggregate(&dataset_id).unwrap_or_default()
            };
            Ok::<_, SessionError>((dataset_id, page, total_rows, aggregate))
        })
        .await??;

        debug!(rows = page.num_rows(), merged = merge, "Served page");
        PageResponse::build(dataset_id, page, total_rows, aggregate)
    }

    /// Metadata of a registered dataset.
    pub fn dataset_info(&self, request: &ClientRequest, dataset_id: &str) -> Result<DatasetInfo> {
        self.gate(request)?;
        self.registry.info(dataset_id)
    }

    /// Drops a dataset, its aggregate and, for uploads, its file.
    pub fn evict(&self, dataset_id: &str) -> bool {
        self.registry.evict(dataset_id, &self.stats)
    }

    /// Returns an analysis of the table slice, from the cache when possible.
    ///
    /// On a miss the LLM call runs in its own task bounded by the configured
    /// timeout. The task stores a successful result in the cache even if this
    /// future is dropped before it finishes. Failures are never cached.
    #[instrument(skip_all, fields(provider = %analyze.provider, model = %analyze.model))]
    pub async fn analyze(
        &self,
        request: &ClientRequest,
        analyze: AnalyzeRequest,
    ) -> Result<AnalyzeResponse> {
        self.gate(request)?;

        let provider: Provider = analyze.provider.parse()?;
        let model = analyze.model.trim().to_string();
        if model.is_empty()
            || model.len() > MAX_MODEL_NAME_LEN
            || model.chars().any(char::is_control)
        {
            return Err(SessionError::invalid_input("model name is missing or malformed"));
        }
        if analyze.table_data.is_empty() {
            return Err(SessionError::invalid_input("table_data must contain rows"));
        }
        if analyze.table_data.len() > self.config.max_page_size() {
            return Err(SessionError::invalid_input(format!(
                "table_data has {} rows, the limit is {}",
                analyze.table_data.len(),
                self.config.max_page_size()
            )));
        }

        let table_text =
            canonical_table_text(&analyze.table_data, self.config.analysis_row_limit());
        let key = AnalysisKey::new(provider.as_str(), &model, &table_text);
        let label = format!("{provider}:{model}");

        if let Some(result) = self.cache.get(&key) {
            debug!(key = %self.config.log().key_field(key.as_str()), "Analysis cache hit");
            return Ok(AnalyzeResponse {
                model: label,
                result,
                timestamp: Utc::now(),
                cache_hit: true,
            });
        }

        let llm = Arc::clone(&self.llm);
        let cache = Arc::clone(&self.cache);
        let timeout = self.config.llm_timeout();
        let prompt = build_prompt(&table_text);
        let task = tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, llm.complete(provider, &model, &prompt))
                .await
                .map_err(|_| {
                    SessionError::upstream(
                        provider.as_str(),
                        format!("no response within {timeout:?}"),
                    )
                })?
                .map_err(|e| match e {
                    SessionError::UpstreamFailure { .. } => e,
                    other => SessionError::upstream(provider.as_str(), other.to_string()),
                })?;
            cache.put(key, result.clone());
            Ok::<_, SessionError>(result)
        });

        let result = task.await?.inspect_err(|e| {
            warn!(error = %e, "Analysis request failed");
        })?;

        Ok(AnalyzeResponse {
            model: label,
            result,
            timestamp: Utc::now(),
            cache_hit: false,
        })
    }

    /// One pass of background hygiene.
    ///
    /// Evicts datasets older than the configured age, drops aggregates whose
    /// dataset is gone, purges expired cache entries and idle rate buckets.
    pub fn sweep(&self) -> SweepReport {
        let datasets_evicted = self
            .registry
            .evict_older_than(self.config.dataset_max_age(), &self.stats);
        let registry = &self.registry;
        let orphaned_aggregates = self.stats.retain(|id| registry.contains(id));

        let report = SweepReport {
            datasets_evicted,
            orphaned_aggregates,
            cache_entries_expired: self.cache.sweep_expired(),
            rate_buckets_pruned: self.limiter.sweep_idle(),
        };

        if !report.datasets_evicted.is_empty() || report.cache_entries_expired > 0 {
            info!(
                datasets = report.datasets_evicted.len(),
                cache_entries = report.cache_entries_expired,
                rate_buckets = report.rate_buckets_pruned,
                "Sweep removed expired state"
            );
        }
        report
    }

    /// Runs [`sweep`](Self::sweep) on the configured interval until `shutdown` flips to true
    /// or its sender is dropped.
    pub fn spawn_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.config.sweep_interval().as_secs(), "Sweeper started");
            let mut ticker = interval(self.config.sweep_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let coordinator = Arc::clone(&self);
                        if let Err(e) = tokio::task::spawn_blocking(move || coordinator.sweep()).await {
                            warn!(error = %e, "Sweep pass failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Sweeper stopped");
        })
    }
}
