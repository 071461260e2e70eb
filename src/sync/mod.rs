//! Upstream synchronization
//!
//! Everything between the Sienge API and the local store: the rate-limited
//! HTTP client with retry, the pagination driver, the entity table, the
//! credential-aware API client and the run orchestrator.
//!
//! # Components
//!
//! - [`retry`]: Retry manager with exponential backoff for transient failures
//! - [`http_client`]: Rate-limited HTTP client shared by every upstream call
//! - [`pagination`]: Offset/limit page walker tolerant of envelope shapes
//! - [`entities`]: Entity kinds, priorities, endpoints and ceilings
//! - [`api_client`]: Credential loading, validation and data calls
//! - [`orchestrator`]: Run admission, per-entity execution and cancellation
//!
//! # Example
//!
//! ```ignore
//! use sienge_sync::sync::{Orchestrator, SiengeClient};
//!
//! let client = Arc::new(SiengeClient::new(&config, database.clone())?);
//! let orchestrator = Orchestrator::new(database, client);
//!
//! let run = orchestrator.run_sync(&["customers", "companies"]).await?;
//! println!("{} records", run.records_processed);
//! ```

pub mod api_client;
pub mod entities;
pub mod http_client;
pub mod orchestrator;
pub mod pagination;
pub mod retry;

// Re-export main types for convenience
pub use api_client::SiengeClient;
pub use entities::{EntityDef, EntityKind, RequestedEntity};
pub use http_client::{ApiRequest, HttpClientWithRateLimit, RateLimitStats};
pub use orchestrator::{CancelSignal, EntityFetch, EntityFetcher, Orchestrator};
pub use pagination::{PageCursor, PageLimits, PageResult, PageSource, ResponseShape};
pub use retry::RetryManager;
