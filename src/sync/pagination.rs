//! Pagination over bulk list endpoints
//!
//! A [`PageCursor`] walks one endpoint with increasing offsets, one page at a
//! time, until the upstream signals the end of data or a ceiling is hit.
//! Pages are always requested in offset order.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::SyncError;

/// Anything that can fetch one page of an endpoint
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetch `endpoint` with the given query parameters and return the parsed body
    async fn fetch_page(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<Value, SyncError>;
}

/// Paging metadata reported alongside a results array
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageMetadata {
    pub total: Option<u64>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

/// A list response, classified by inspection
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseShape {
    /// Bare JSON array
    Array(Vec<Value>),
    /// Object holding the records array
    Envelope {
        results: Vec<Value>,
        metadata: Option<PageMetadata>,
        has_more: Option<bool>,
    },
    /// No recognizable records array
    Unknown,
}

const RECORD_KEYS: [&str; 4] = ["results", "records", "data", "items"];

impl ResponseShape {
    pub fn parse(value: Value) -> Self {
        match value {
            Value::Array(records) => ResponseShape::Array(records),
            Value::Object(mut object) => {
                let has_more = ["hasMore", "has_more"]
                    .iter()
                    .find_map(|key| object.get(*key).and_then(Value::as_bool));
                let metadata = object.get("resultSetMetadata").and_then(parse_metadata);

                let key = RECORD_KEYS
                    .iter()
                    .find(|key| object.get(**key).is_some_and(Value::is_array))
                    .map(|key| key.to_string())
                    .or_else(|| {
                        object
                            .iter()
                            .find(|(_, value)| value.is_array())
                            .map(|(key, _)| key.clone())
                    });

                match key.and_then(|key| object.remove(&key)) {
                    Some(Value::Array(results)) => ResponseShape::Envelope {
                        results,
                        metadata,
                        has_more,
                    },
                    _ => ResponseShape::Unknown,
                }
            }
            _ => ResponseShape::Unknown,
        }
    }

    /// Shape name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ResponseShape::Array(_) => "array",
            ResponseShape::Envelope { .. } => "envelope",
            ResponseShape::Unknown => "unknown",
        }
    }

    /// The records, empty for an unknown shape
    pub fn into_records(self) -> Vec<Value> {
        match self {
            ResponseShape::Array(records) => records,
            ResponseShape::Envelope { results, .. } => results,
            ResponseShape::Unknown => Vec::new(),
        }
    }
}

fn parse_metadata(value: &Value) -> Option<PageMetadata> {
    let object: &Map<String, Value> = value.as_object()?;
    let number = |key: &str| object.get(key).and_then(Value::as_u64);

    Some(PageMetadata {
        total: number("count").or_else(|| number("totalRecords")),
        offset: number("offset"),
        limit: number("limit"),
    })
}

/// Ceilings for one logical fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub page_size: usize,
    pub max_pages: usize,
    pub max_records: usize,
    pub timeout: Duration,
}

impl PageLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            page_size: config.upstream.page_size,
            max_pages: config.pagination.max_pages,
            max_records: config.pagination.max_records,
            timeout: Duration::from_secs(config.pagination.timeout_secs),
        }
    }
}

impl Default for PageLimits {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// One fetched page
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// 1-based page number
    pub number: usize,
    pub records: Vec<Value>,
}

/// Everything gathered by one drained cursor
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PageResult {
    pub records: Vec<Value>,
    /// Pages requested from the upstream
    pub pages: usize,
    /// A ceiling stopped the fetch before the upstream signalled the end
    pub truncated: bool,
    pub warnings: Vec<String>,
}

/// Lazy page-by-page walk over one endpoint
pub struct PageCursor<'a, S: PageSource + ?Sized> {
    source: &'a S,
    endpoint: String,
    base_params: Vec<(String, String)>,
    limits: PageLimits,
    started: Instant,
    pages: usize,
    fetched: usize,
    finished: bool,
    truncated: bool,
    warnings: Vec<String>,
}

impl<'a, S: PageSource + ?Sized> PageCursor<'a, S> {
    pub fn new(
        source: &'a S,
        endpoint: &str,
        base_params: &[(String, String)],
        limits: PageLimits,
    ) -> Self {
        // limit/offset belong to the cursor
        let base_params = base_params
            .iter()
            .filter(|(key, _)| key != "limit" && key != "offset")
            .cloned()
            .collect();

        Self {
            source,
            endpoint: endpoint.to_string(),
            base_params,
            limits,
            started: Instant::now(),
            pages: 0,
            fetched: 0,
            finished: false,
            truncated: false,
            warnings: Vec::new(),
        }
    }

    /// Fetch the next page, or None once the walk is over
    pub async fn next_page(&mut self) -> Result<Option<Page>, SyncError> {
        if self.finished {
            return Ok(None);
        }
        if let Some(reason) = self.ceiling_reached() {
            warn!(endpoint = %self.endpoint, pages = self.pages, records = self.fetched, reason = reason, "Pagination ceiling reached");
            self.warnings.push(format!("stopped early: {}", reason));
            self.truncated = true;
            self.finished = true;
            return Ok(None);
        }

        let number = self.pages + 1;
        let offset = self.pages * self.limits.page_size;
        let mut params = self.base_params.clone();
        params.push(("limit".to_string(), self.limits.page_size.to_string()));
        params.push(("offset".to_string(), offset.to_string()));

        let body = self.source.fetch_page(&self.endpoint, &params).await?;
        self.pages = number;

        let shape = ResponseShape::parse(body);
        debug!(endpoint = %self.endpoint, page = number, offset = offset, shape = shape.kind(), "Fetched page");

        let (mut records, metadata, has_more) = match shape {
            ResponseShape::Array(records) => (records, None, None),
            ResponseShape::Envelope {
                results,
                metadata,
                has_more,
            } => (results, metadata, has_more),
            ResponseShape::Unknown => {
                warn!(endpoint = %self.endpoint, page = number, "Unrecognized response shape, treating as empty");
                self.warnings
                    .push(format!("page {}: unrecognized response shape", number));
                self.finished = true;
                return Ok(None);
            }
        };

        if records.is_empty() {
            self.finished = true;
            return Ok(None);
        }

        if number > 1 && metadata.and_then(|m| m.offset) == Some(0) {
            warn!(endpoint = %self.endpoint, page = number, "Upstream returned offset 0 again, stopping to avoid a loop");
            self.warnings.push(format!(
                "page {}: upstream reset offset to 0, possible pagination loop",
                number
            ));
            self.finished = true;
            return Ok(None);
        }

        let room = self.limits.max_records.saturating_sub(self.fetched);
        if records.len() > room {
            records.truncate(room);
            self.warnings.push(format!(
                "stopped early: record ceiling of {} reached",
                self.limits.max_records
            ));
            self.truncated = true;
            self.finished = true;
        }
        self.fetched += records.len();

        if has_more == Some(false) {
            self.finished = true;
        }
        if let Some(total) = metadata.and_then(|m| m.total) {
            let meta = metadata.unwrap_or_default();
            let page_offset = meta.offset.unwrap_or(offset as u64);
            let page_limit = meta.limit.unwrap_or(self.limits.page_size as u64);
            if page_offset + page_limit >= total || self.fetched as u64 >= total {
                self.finished = true;
            }
        }

        Ok(Some(Page { number, records }))
    }

    /// Drain the cursor
    pub async fn fetch_all(mut self) -> Result<PageResult, SyncError> {
        let mut records = Vec::new();
        while let Some(page) = self.next_page().await? {
            records.extend(page.records);
        }

        debug!(
            endpoint = %self.endpoint,
            pages = self.pages,
            records = records.len(),
            truncated = self.truncated,
            "Pagination finished"
        );

        Ok(PageResult {
            records,
            pages: self.pages,
            truncated: self.truncated,
            warnings: self.warnings,
        })
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    fn ceiling_reached(&self) -> Option<&'static str> {
        if self.pages >= self.limits.max_pages {
            Some("page ceiling reached")
        } else if self.fetched >= self.limits.max_records {
            Some("record ceiling reached")
        } else if self.started.elapsed() >= self.limits.timeout {
            Some("fetch timeout reached")
        } else {
            None
        }
    }
}

/// Fetch every page of `endpoint`
pub async fn fetch_all<S: PageSource + ?Sized>(
    source: &S,
    endpoint: &str,
    base_params: &[(String, String)],
    limits: PageLimits,
) -> Result<PageResult, SyncError> {
    PageCursor::new(source, endpoint, base_params, limits)
        .fetch_all()
        .await
}
