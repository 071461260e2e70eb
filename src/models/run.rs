//! Sync run domain models
//!
//! This module defines the persisted record of one orchestrator run and the
//! per-entity slots it tracks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall status of a sync run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run created but not yet admitted
    #[default]
    Pending,
    /// Run is executing
    InProgress,
    /// Every entity succeeded
    Completed,
    /// At least one entity failed
    CompletedWithErrors,
    /// A cancellation was observed
    Cancelled,
}

impl RunStatus {
    /// True once the run has left `in_progress`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::CompletedWithErrors | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::InProgress => write!(f, "in_progress"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::CompletedWithErrors => write!(f, "completed_with_errors"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "in_progress" => Ok(RunStatus::InProgress),
            "completed" => Ok(RunStatus::Completed),
            "completed_with_errors" => Ok(RunStatus::CompletedWithErrors),
            "cancelled" => Ok(RunStatus::Cancelled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Status of a single entity within a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    #[default]
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl std::fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityStatus::Pending => write!(f, "pending"),
            EntityStatus::InProgress => write!(f, "in_progress"),
            EntityStatus::Succeeded => write!(f, "succeeded"),
            EntityStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome slot for one requested entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySlot {
    /// Entity identifier as requested (canonicalized when known)
    pub entity: String,

    /// Slot status
    pub status: EntityStatus,

    /// Records fetched from upstream
    pub records: u64,

    /// Endpoint that produced the data
    pub endpoint: Option<String>,

    /// Error recorded when the entity failed
    pub error: Option<String>,

    /// Whether a pagination ceiling cut the fetch short
    #[serde(default)]
    pub truncated: bool,

    /// Non-fatal warnings (unexpected shapes, loops, ceilings)
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl EntitySlot {
    /// Create a pending slot
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            status: EntityStatus::Pending,
            records: 0,
            endpoint: None,
            error: None,
            truncated: false,
            warnings: Vec::new(),
        }
    }

    /// Mark as in progress
    pub fn in_progress(mut self) -> Self {
        self.status = EntityStatus::InProgress;
        self
    }

    /// Mark as succeeded
    pub fn succeeded(mut self, records: u64, endpoint: impl Into<String>) -> Self {
        self.status = EntityStatus::Succeeded;
        self.records = records;
        self.endpoint = Some(endpoint.into());
        self.error = None;
        self
    }

    /// Mark as failed
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.status = EntityStatus::Failed;
        self.error = Some(error.into());
        self
    }

    /// Whether the slot reached a final state
    pub fn is_finished(&self) -> bool {
        matches!(self.status, EntityStatus::Succeeded | EntityStatus::Failed)
    }
}

/// Persisted record of one orchestrator run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRun {
    /// Store-assigned identifier (None until inserted)
    pub id: Option<i64>,

    /// One slot per requested entity, in execution order
    pub entities: Vec<EntitySlot>,

    /// Overall status
    pub status: RunStatus,

    pub records_processed: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub records_errors: u64,
    pub api_calls_made: u64,

    /// When the run was created
    pub started_at: DateTime<Utc>,

    /// When the run reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,

    /// Summary of failures or the cancellation reason
    pub error_message: Option<String>,
}

impl SyncRun {
    /// Create a pending run with one slot per entity
    pub fn new<I, S>(entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: None,
            entities: entities.into_iter().map(EntitySlot::new).collect(),
            status: RunStatus::Pending,
            records_processed: 0,
            records_inserted: 0,
            records_updated: 0,
            records_errors: 0,
            api_calls_made: 0,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
        }
    }

    /// Mark as in progress
    pub fn in_progress(mut self) -> Self {
        self.status = RunStatus::InProgress;
        self
    }

    /// Names of the requested entities in execution order
    pub fn entity_names(&self) -> Vec<&str> {
        self.entities.iter().map(|slot| slot.entity.as_str()).collect()
    }

    /// Number of slots that failed
    pub fn failed_entities(&self) -> usize {
        self.entities
            .iter()
            .filter(|slot| slot.status == EntityStatus::Failed)
            .count()
    }

    /// Percentage of slots that reached a final state
    pub fn progress_percent(&self) -> u8 {
        if self.entities.is_empty() {
            return if self.status.is_terminal() { 100 } else { 0 };
        }
        let finished = self.entities.iter().filter(|s| s.is_finished()).count();
        ((finished * 100) / self.entities.len()) as u8
    }

    /// Close the run with the status implied by its slots
    ///
    /// `completed` when every slot succeeded, `completed_with_errors` otherwise.
    pub fn finish(mut self) -> Self {
        let failed = self.failed_entities();
        self.status = if failed == 0 {
            RunStatus::Completed
        } else {
            RunStatus::CompletedWithErrors
        };
        if failed > 0 {
            self.error_message = Some(format!(
                "{} of {} entities failed",
                failed,
                self.entities.len()
            ));
        }
        self.completed_at = Some(Utc::now());
        self
    }

    /// Close the run as cancelled
    pub fn cancelled(mut self, reason: impl Into<String>) -> Self {
        self.status = RunStatus::Cancelled;
        self.error_message = Some(reason.into());
        self.completed_at = Some(Utc::now());
        self
    }
}

/// Result of writing one entity's records to the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveSummary {
    pub inserted: u64,
    pub updated: u64,
    pub errors: u64,
}
