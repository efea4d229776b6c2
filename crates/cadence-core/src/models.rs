use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::identity::OccurrenceId;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum Priority {
    None,
    Low,
    Medium,
    High,
}

#[derive(Error, Debug, PartialEq)]
#[error("Invalid priority: {0}")]
pub struct ParsePriorityError(String);

impl FromStr for Priority {
    type Err = ParsePriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Priority::None),
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            _ => Err(ParsePriorityError(s.to_string())),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::None => write!(f, "none"),
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// The persisted definition of a (possibly recurring) task.
///
/// A series with `rrule = None` is a one-off task: its single occurrence is
/// `dtstart` and its completion state lives directly on the record
/// (`completed_at`). A recurring series never sets `completed_at`; per
/// occurrence completion is an [`OccurrenceOverride`] concern.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Series {
    #[serde(with = "uuid::serde::compact")]
    pub id: Uuid,
    #[serde(with = "uuid::serde::compact")]
    pub owner_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub pinned: bool,
    pub item_order: i64,
    pub list_id: Option<Uuid>,
    /// First occurrence's start instant, UTC. Civil-time interpretation is
    /// resolved by the caller once, at write time.
    pub dtstart: DateTime<Utc>,
    pub duration_minutes: i64,
    /// RFC 5545 RRULE property value (no DTSTART prefix), or None for a
    /// one-off task.
    pub rrule: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Monotonic counter bumped by every write that can change what this
    /// series materializes to. Callers may memoize resolved windows keyed
    /// by `(id, window, revision)`.
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Series {
    pub fn is_recurring(&self) -> bool {
        self.rrule.is_some()
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.duration_minutes)
    }
}

impl Default for Series {
    fn default() -> Self {
        Self {
            id: Uuid::now_v7(),
            owner_id: Uuid::now_v7(),
            title: String::new(),
            description: None,
            priority: Priority::None,
            pinned: false,
            item_order: 0,
            list_id: None,
            dtstart: Utc::now(),
            duration_minutes: 0,
            rrule: None,
            completed_at: None,
            revision: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

/// One instant excluded from a series' generated sequence.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExceptionDate {
    #[serde(with = "uuid::serde::compact")]
    pub series_id: Uuid,
    pub occurrence_dt: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Per-occurrence customization of a recurring series.
///
/// `occurrence_dt` is always the nominal, rule-implied instant of the
/// occurrence this record customizes, never the post-override start. Only
/// the non-None fields apply; everything else falls through to the series
/// defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct OccurrenceOverride {
    #[serde(with = "uuid::serde::compact")]
    pub series_id: Uuid,
    pub occurrence_dt: DateTime<Utc>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OccurrenceOverride {
    /// An override that customizes nothing and marks nothing complete has
    /// returned to the `absent` state and should be deleted, not kept.
    pub fn is_empty(&self) -> bool {
        self.start_at.is_none()
            && self.end_at.is_none()
            && self.title.is_none()
            && self.description.is_none()
            && self.priority.is_none()
            && !self.completed
    }
}

/// One concrete calendar occurrence, computed per request and never
/// persisted. Either virtual (pure rule output plus series defaults) or
/// overridden (series defaults with an [`OccurrenceOverride`] overlaid).
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedOccurrence {
    pub id: OccurrenceId,
    pub series_id: Uuid,
    /// Nominal rule-implied instant; stable across start/end overrides.
    pub occurrence_dt: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub completed: bool,
    pub is_overridden: bool,
}

impl MaterializedOccurrence {
    /// Materialize an occurrence straight from the series defaults.
    pub fn virtual_slot(series: &Series, occurrence_dt: DateTime<Utc>) -> Self {
        Self {
            id: OccurrenceId::for_series(series, occurrence_dt),
            series_id: series.id,
            occurrence_dt,
            start: occurrence_dt,
            end: occurrence_dt + series.duration(),
            title: series.title.clone(),
            description: series.description.clone(),
            priority: series.priority.clone(),
            completed: series.completed_at.is_some(),
            is_overridden: false,
        }
    }

    /// Materialize an occurrence with an override overlaid on the series
    /// defaults. Partial overlay: only the override's non-None fields
    /// replace the defaults.
    pub fn overridden(
        series: &Series,
        occurrence_dt: DateTime<Utc>,
        ov: &OccurrenceOverride,
    ) -> Self {
        Self {
            id: OccurrenceId::for_series(series, occurrence_dt),
            series_id: series.id,
            occurrence_dt,
            start: ov.start_at.unwrap_or(occurrence_dt),
            end: ov.end_at.unwrap_or(occurrence_dt + series.duration()),
            title: ov.title.clone().unwrap_or_else(|| series.title.clone()),
            description: ov.description.clone().or_else(|| series.description.clone()),
            priority: ov.priority.clone().unwrap_or_else(|| series.priority.clone()),
            completed: ov.completed,
            is_overridden: true,
        }
    }
}

/// Output of resolving one window: the merged occurrence list plus the
/// unresolved-override channel. Orphaned overrides (keys the current rule
/// no longer generates) are reported here; they are never silently dropped
/// and never rendered as phantom occurrences.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResolvedWindow {
    pub occurrences: Vec<MaterializedOccurrence>,
    pub unresolved: Vec<OccurrenceOverride>,
}

/// Data required to create a new series.
#[derive(Debug, Clone)]
pub struct NewSeriesData {
    pub owner_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub pinned: bool,
    pub list_id: Option<Uuid>,
    pub dtstart: DateTime<Utc>,
    pub duration_minutes: i64,
    /// Raw RRULE property value; validated at creation time.
    pub rrule: Option<String>,
}

impl Default for NewSeriesData {
    fn default() -> Self {
        Self {
            owner_id: Uuid::now_v7(),
            title: String::new(),
            description: None,
            priority: None,
            pinned: false,
            list_id: None,
            dtstart: Utc::now(),
            duration_minutes: 0,
            rrule: None,
        }
    }
}

/// Series-level edit (`applyToAll = true`). Double-`Option` fields
/// distinguish "leave unchanged" (outer None) from "set to NULL"
/// (Some(None)). Changing `dtstart` or `rrule` triggers override
/// re-keying.
#[derive(Debug, Clone, Default)]
pub struct UpdateSeriesData {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub priority: Option<Priority>,
    pub pinned: Option<bool>,
    pub item_order: Option<i64>,
    pub list_id: Option<Option<Uuid>>,
    pub dtstart: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i64>,
    pub rrule: Option<Option<String>>,
}

impl UpdateSeriesData {
    pub fn is_noop(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.priority.is_none()
            && self.pinned.is_none()
            && self.item_order.is_none()
            && self.list_id.is_none()
            && self.dtstart.is_none()
            && self.duration_minutes.is_none()
            && self.rrule.is_none()
    }
}

/// Single-occurrence edit (`applyToAll = false`). Each Some field is
/// written into the occurrence's override; None fields keep whatever the
/// override (or the series default) already says.
#[derive(Debug, Clone, Default)]
pub struct OccurrenceEdit {
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
}

impl OccurrenceEdit {
    pub fn is_noop(&self) -> bool {
        self.start_at.is_none()
            && self.end_at.is_none()
            && self.title.is_none()
            && self.description.is_none()
            && self.priority.is_none()
    }
}
