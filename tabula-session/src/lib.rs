//! # Tabula Session - Stateful Layer for Paged Tabular Datasets
//!
//! Tabula Session keeps the server-side state behind a table viewer that lets
//! users upload CSV and Excel files, page through them, and ask an LLM to
//! analyze what they see. It leverages Apache Arrow for page reads and keeps
//! memory bounded no matter how many pages a client requests.
//!
//! ## Overview
//!
//! A [`SessionCoordinator`](session::SessionCoordinator) ties together:
//!
//! - **Dataset registry**: uploaded files are fingerprinted into a stable
//!   16-character id and served page by page.
//! - **Incremental statistics**: every page read is folded into a running
//!   per-column aggregate (sum, mean, min, max, distinct values) without
//!   retaining rows.
//! - **Analysis cache**: LLM answers are cached by provider, model and table
//!   content with a TTL and a hard entry cap.
//! - **Rate limiting**: a sliding window per client identity guards every request.
//! - **Sweeper**: a background task expires old datasets, cache entries and
//!   idle rate buckets.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tabula_session::prelude::*;
//!
//! # async fn example() -> tabula_session::error::Result<()> {
//! let config = SessionConfig::from_env()?;
//! let coordinator = Arc::new(SessionCoordinator::new(
//!     config,
//!     Arc::new(FileTableReader::new()),
//!     Arc::new(OfflineClient),
//! )?);
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let sweeper = Arc::clone(&coordinator).spawn_sweeper(shutdown_rx);
//!
//! let client = ClientRequest::new("203.0.113.7");
//! let handle = StorageHandle::new("/tmp/uploads/sales.csv")?.ephemeral();
//! let first = coordinator.upload(&client, handle, Some(500)).await?;
//! println!("{} rows over {} pages", first.total_rows, first.total_pages);
//!
//! let second = coordinator
//!     .fetch_page(&client, PageRequest::new(first.dataset_id.clone(), 2, 500))
//!     .await?;
//! println!("rows seen so far: {}", second.aggregate.rows_seen);
//!
//! shutdown_tx.send(true).ok();
//! sweeper.await.ok();
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//!
//! All components log through `tracing`. Call
//! [`init_logging`](logging::setup::init_logging) once at startup, or install
//! your own subscriber.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod llm;
pub mod logging;
pub mod prelude;
pub mod rate_limit;
pub mod registry;
pub mod security;
pub mod session;
pub mod sources;
pub mod stats;
