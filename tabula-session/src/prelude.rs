//! Prelude for commonly used types and traits in tabula-session.

pub use crate::cache::{AnalysisKey, BoundedCache, CacheStats};
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::SessionConfig;
pub use crate::error::{Result, SessionError};
pub use crate::llm::{LlmClient, OfflineClient, Provider};
pub use crate::logging::LogConfig;
pub use crate::rate_limit::{RateDecision, RateLimiter};
pub use crate::registry::{DatasetInfo, DatasetRegistry, PageData};
pub use crate::session::{
    AnalyzeRequest, AnalyzeResponse, ClientRequest, PageRequest, PageResponse,
    SessionCoordinator, SweepReport,
};
pub use crate::sources::{FileTableReader, SourceKind, StorageHandle, TableReader, TextEncoding};
pub use crate::stats::{IncrementalStatsEngine, RunningAggregate};
