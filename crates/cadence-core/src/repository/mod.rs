use crate::db::DbPool;
use crate::error::CoreError;
use crate::identity::OccurrenceId;
use crate::models::{
    ExceptionDate, NewSeriesData, OccurrenceEdit, OccurrenceOverride, ResolvedWindow, Series,
    UpdateSeriesData,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

// Re-export domain modules
pub mod occurrences;
pub mod series;

/// Series-level operations. `update_series` is the series edit
/// (`applyToAll = true`); when it changes `dtstart` or `rrule` it re-keys
/// the series' overrides inside the same transaction, so readers never see
/// a half-migrated override set. Exception-date edits never re-key.
#[async_trait]
pub trait SeriesStore {
    async fn create_series(&self, data: NewSeriesData) -> Result<Series, CoreError>;
    async fn find_series_by_id(&self, id: Uuid) -> Result<Option<Series>, CoreError>;
    async fn find_series_by_owner(&self, owner_id: Uuid) -> Result<Vec<Series>, CoreError>;
    async fn update_series(&self, id: Uuid, data: UpdateSeriesData) -> Result<Series, CoreError>;
    async fn delete_series(&self, id: Uuid) -> Result<(), CoreError>;
    async fn add_exception_date(
        &self,
        series_id: Uuid,
        occurrence_dt: DateTime<Utc>,
    ) -> Result<(), CoreError>;
    async fn remove_exception_date(
        &self,
        series_id: Uuid,
        occurrence_dt: DateTime<Utc>,
    ) -> Result<(), CoreError>;
    async fn find_exception_dates(&self, series_id: Uuid) -> Result<Vec<ExceptionDate>, CoreError>;
}

/// Occurrence-level operations: window materialization plus the
/// single-occurrence mutations (`applyToAll = false`). Instance mutations
/// on a recurring series go through override records keyed by the nominal
/// occurrence instant; on a one-off series they route to the series record
/// itself.
#[async_trait]
pub trait OccurrenceStore {
    async fn occurrences_for_series(
        &self,
        series_id: Uuid,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<ResolvedWindow, CoreError>;
    async fn occurrences_for_owner(
        &self,
        owner_id: Uuid,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<ResolvedWindow, CoreError>;
    async fn edit_occurrence(&self, id: OccurrenceId, edit: OccurrenceEdit)
        -> Result<(), CoreError>;
    async fn complete_occurrence(&self, id: OccurrenceId, completed: bool)
        -> Result<(), CoreError>;
    async fn delete_occurrence(&self, id: OccurrenceId) -> Result<(), CoreError>;
    async fn find_overrides(&self, series_id: Uuid) -> Result<Vec<OccurrenceOverride>, CoreError>;
    async fn find_orphaned_overrides(
        &self,
        series_id: Uuid,
    ) -> Result<Vec<OccurrenceOverride>, CoreError>;
}

/// Main store trait composing the domain traits.
pub trait Store: SeriesStore + OccurrenceStore {}

/// SQLite implementation of the store.
///
/// Every mutation runs inside a single write transaction, which also
/// serializes mutations per series: the re-keying pass reads-then-writes
/// the whole override set and must not interleave with instance edits.
pub struct SqliteRepository {
    pool: DbPool,
}

impl SqliteRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool for internal use across modules
    pub(crate) fn pool(&self) -> &DbPool {
        &self.pool
    }
}

impl Store for SqliteRepository {}
