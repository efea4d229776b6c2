use crate::error::CoreError;
use crate::expander::{OccurrenceExpander, MAX_OCCURRENCES};
use crate::identity::OccurrenceId;
use crate::models::{
    ExceptionDate, OccurrenceEdit, OccurrenceOverride, ResolvedWindow, Series,
};
use crate::repository::SqliteRepository;
use crate::resolver;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, Transaction};
use std::collections::HashSet;
use uuid::Uuid;

#[async_trait]
impl super::OccurrenceStore for SqliteRepository {
    async fn occurrences_for_series(
        &self,
        series_id: Uuid,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<ResolvedWindow, CoreError> {
        // One transaction for the reads: the resolver must see a series
        // and its override set from the same snapshot.
        let mut tx = self.pool().begin().await?;
        let resolved =
            Self::resolve_series_in_transaction(&mut tx, series_id, window_start, window_end)
                .await?;
        tx.commit().await?;
        Ok(resolved)
    }

    async fn occurrences_for_owner(
        &self,
        owner_id: Uuid,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<ResolvedWindow, CoreError> {
        let mut tx = self.pool().begin().await?;

        let series_list: Vec<Series> = sqlx::query_as(
            "SELECT * FROM series WHERE owner_id = $1 ORDER BY item_order, created_at",
        )
        .bind(owner_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut merged = ResolvedWindow::default();
        for series in &series_list {
            let resolved =
                Self::resolve_series_in_transaction(&mut tx, series.id, window_start, window_end)
                    .await?;
            merged.occurrences.extend(resolved.occurrences);
            merged.unresolved.extend(resolved.unresolved);
        }
        tx.commit().await?;

        merged
            .occurrences
            .sort_by_key(|occ| (occ.start, occ.occurrence_dt, occ.series_id));
        Ok(merged)
    }

    async fn edit_occurrence(
        &self,
        id: OccurrenceId,
        edit: OccurrenceEdit,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool().begin().await?;
        let series = Self::fetch_series(&mut tx, id.series_id).await?;

        match addressed_instant(&series, &id)? {
            // A one-off's single occurrence is the series record itself.
            None => {
                if edit.is_noop() {
                    return Ok(());
                }
                let new_dtstart = edit.start_at.unwrap_or(series.dtstart);
                let duration_minutes = match edit.end_at {
                    Some(end) => {
                        let minutes = (end - new_dtstart).num_minutes();
                        if minutes < 0 {
                            return Err(CoreError::InvalidInput(
                                "end_at must not precede the occurrence start".to_string(),
                            ));
                        }
                        minutes
                    }
                    None => series.duration_minutes,
                };
                sqlx::query(
                    r#"UPDATE series SET
                        title = COALESCE($1, title),
                        description = COALESCE($2, description),
                        priority = COALESCE($3, priority),
                        dtstart = $4,
                        duration_minutes = $5,
                        revision = revision + 1,
                        updated_at = $6
                    WHERE id = $7"#,
                )
                .bind(&edit.title)
                .bind(&edit.description)
                .bind(&edit.priority)
                .bind(new_dtstart)
                .bind(duration_minutes)
                .bind(Utc::now())
                .bind(series.id)
                .execute(&mut *tx)
                .await?;
            }
            Some(occurrence_dt) => {
                // Target resolution runs even for a field-less edit; a
                // missing instant is a conflict either way.
                let existing =
                    Self::resolve_override_target(&mut tx, &series, occurrence_dt).await?;
                if edit.is_noop() {
                    return Ok(());
                }

                let mut ov = existing.unwrap_or_else(|| blank_override(series.id, occurrence_dt));
                if edit.start_at.is_some() {
                    ov.start_at = edit.start_at;
                }
                if edit.end_at.is_some() {
                    ov.end_at = edit.end_at;
                }
                if edit.title.is_some() {
                    ov.title = edit.title;
                }
                if edit.description.is_some() {
                    ov.description = edit.description;
                }
                if edit.priority.is_some() {
                    ov.priority = edit.priority;
                }
                ov.updated_at = Utc::now();

                Self::upsert_override(&mut tx, &ov).await?;
                Self::touch_series(&mut tx, series.id).await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn complete_occurrence(
        &self,
        id: OccurrenceId,
        completed: bool,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool().begin().await?;
        let series = Self::fetch_series(&mut tx, id.series_id).await?;

        match addressed_instant(&series, &id)? {
            None => {
                let completed_at: Option<DateTime<Utc>> = completed.then(Utc::now);
                sqlx::query(
                    "UPDATE series SET completed_at = $1, revision = revision + 1, updated_at = $2 WHERE id = $3",
                )
                .bind(completed_at)
                .bind(Utc::now())
                .bind(series.id)
                .execute(&mut *tx)
                .await?;
            }
            Some(occurrence_dt) => {
                let existing =
                    Self::resolve_override_target(&mut tx, &series, occurrence_dt).await?;

                let mut ov = existing.unwrap_or_else(|| blank_override(series.id, occurrence_dt));
                ov.completed = completed;
                ov.updated_at = Utc::now();

                if ov.is_empty() {
                    // Un-completing an otherwise untouched occurrence
                    // returns it to the absent state.
                    sqlx::query(
                        "DELETE FROM occurrence_overrides WHERE series_id = $1 AND occurrence_dt = $2",
                    )
                    .bind(series.id)
                    .bind(occurrence_dt)
                    .execute(&mut *tx)
                    .await?;
                } else {
                    Self::upsert_override(&mut tx, &ov).await?;
                }
                Self::touch_series(&mut tx, series.id).await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_occurrence(&self, id: OccurrenceId) -> Result<(), CoreError> {
        let mut tx = self.pool().begin().await?;
        let series = Self::fetch_series(&mut tx, id.series_id).await?;

        match addressed_instant(&series, &id)? {
            // Deleting a one-off's only occurrence deletes the task.
            None => {
                sqlx::query("DELETE FROM series WHERE id = $1")
                    .bind(series.id)
                    .execute(&mut *tx)
                    .await?;
            }
            Some(occurrence_dt) => {
                // Resolves to exactly one occurrence or conflicts; the
                // exception date then keeps it from resurfacing as a
                // virtual occurrence, and the override removal keeps it
                // from lingering as an orphan.
                Self::resolve_override_target(&mut tx, &series, occurrence_dt).await?;
                Self::add_exception_date_in_transaction(&mut tx, series.id, occurrence_dt).await?;
                Self::touch_series(&mut tx, series.id).await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_overrides(&self, series_id: Uuid) -> Result<Vec<OccurrenceOverride>, CoreError> {
        let overrides = sqlx::query_as(
            "SELECT * FROM occurrence_overrides WHERE series_id = $1 ORDER BY occurrence_dt",
        )
        .bind(series_id)
        .fetch_all(self.pool())
        .await?;
        Ok(overrides)
    }

    async fn find_orphaned_overrides(
        &self,
        series_id: Uuid,
    ) -> Result<Vec<OccurrenceOverride>, CoreError> {
        let mut tx = self.pool().begin().await?;
        let series = Self::fetch_series(&mut tx, series_id).await?;
        let exception_dates = Self::fetch_exception_dates(&mut tx, series_id).await?;
        let overrides: Vec<OccurrenceOverride> = sqlx::query_as(
            "SELECT * FROM occurrence_overrides WHERE series_id = $1 ORDER BY occurrence_dt",
        )
        .bind(series_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let expander = OccurrenceExpander::new(&series, &exception_dates)?;
        let generated: HashSet<DateTime<Utc>> =
            expander.sequence(MAX_OCCURRENCES).into_iter().collect();

        Ok(overrides
            .into_iter()
            .filter(|ov| !generated.contains(&ov.occurrence_dt))
            .collect())
    }
}

/// The nominal instant an occurrence id addresses on this series, or None
/// for the one-off case. Rejects mismatched addressing up front.
fn addressed_instant(
    series: &Series,
    id: &OccurrenceId,
) -> Result<Option<DateTime<Utc>>, CoreError> {
    match (series.is_recurring(), id.occurrence_dt) {
        (true, Some(dt)) => Ok(Some(dt)),
        (false, None) => Ok(None),
        (true, None) => Err(CoreError::InvalidInput(format!(
            "series {} is recurring; an occurrence instant is required",
            series.id
        ))),
        (false, Some(_)) => Err(CoreError::InvalidInput(format!(
            "series {} is a one-off and is addressed by its id alone",
            series.id
        ))),
    }
}

fn blank_override(series_id: Uuid, occurrence_dt: DateTime<Utc>) -> OccurrenceOverride {
    OccurrenceOverride {
        series_id,
        occurrence_dt,
        start_at: None,
        end_at: None,
        title: None,
        description: None,
        priority: None,
        completed: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

impl SqliteRepository {
    pub(crate) async fn fetch_series(
        tx: &mut Transaction<'_, Sqlite>,
        series_id: Uuid,
    ) -> Result<Series, CoreError> {
        let series: Series = sqlx::query_as("SELECT * FROM series WHERE id = $1")
            .bind(series_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Series with id {} not found", series_id)))?;
        Ok(series)
    }

    pub(crate) async fn fetch_exception_dates(
        tx: &mut Transaction<'_, Sqlite>,
        series_id: Uuid,
    ) -> Result<Vec<ExceptionDate>, CoreError> {
        let exception_dates: Vec<ExceptionDate> = sqlx::query_as(
            "SELECT * FROM series_exception_dates WHERE series_id = $1 ORDER BY occurrence_dt",
        )
        .bind(series_id)
        .fetch_all(&mut **tx)
        .await?;
        Ok(exception_dates)
    }

    async fn resolve_series_in_transaction(
        tx: &mut Transaction<'_, Sqlite>,
        series_id: Uuid,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<ResolvedWindow, CoreError> {
        let series = Self::fetch_series(tx, series_id).await?;
        let exception_dates = Self::fetch_exception_dates(tx, series_id).await?;
        let overrides: Vec<OccurrenceOverride> =
            sqlx::query_as("SELECT * FROM occurrence_overrides WHERE series_id = $1")
                .bind(series_id)
                .fetch_all(&mut **tx)
                .await?;

        let resolved =
            resolver::resolve_window(&series, &exception_dates, &overrides, window_start, window_end)?;
        if !resolved.unresolved.is_empty() {
            log::debug!(
                "series {}: {} unresolved override(s) in [{}, {})",
                series_id,
                resolved.unresolved.len(),
                window_start,
                window_end
            );
        }
        Ok(resolved)
    }

    /// Confirm the addressed instant resolves to exactly one occurrence:
    /// either the current rule generates it or an override already holds
    /// it. Returns the override when one exists; conflicts otherwise.
    async fn resolve_override_target(
        tx: &mut Transaction<'_, Sqlite>,
        series: &Series,
        occurrence_dt: DateTime<Utc>,
    ) -> Result<Option<OccurrenceOverride>, CoreError> {
        let existing: Option<OccurrenceOverride> = sqlx::query_as(
            "SELECT * FROM occurrence_overrides WHERE series_id = $1 AND occurrence_dt = $2",
        )
        .bind(series.id)
        .bind(occurrence_dt)
        .fetch_optional(&mut **tx)
        .await?;

        if existing.is_none() {
            let exception_dates = Self::fetch_exception_dates(tx, series.id).await?;
            let expander = OccurrenceExpander::new(series, &exception_dates)?;
            if !expander.generates(occurrence_dt) {
                return Err(CoreError::OccurrenceNotFound {
                    series_id: series.id,
                    occurrence_dt,
                });
            }
        }

        Ok(existing)
    }

    async fn upsert_override(
        tx: &mut Transaction<'_, Sqlite>,
        ov: &OccurrenceOverride,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"INSERT INTO occurrence_overrides (series_id, occurrence_dt, start_at, end_at, title, description, priority, completed, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (series_id, occurrence_dt) DO UPDATE SET
                start_at = excluded.start_at,
                end_at = excluded.end_at,
                title = excluded.title,
                description = excluded.description,
                priority = excluded.priority,
                completed = excluded.completed,
                updated_at = excluded.updated_at"#,
        )
        .bind(ov.series_id)
        .bind(ov.occurrence_dt)
        .bind(ov.start_at)
        .bind(ov.end_at)
        .bind(&ov.title)
        .bind(&ov.description)
        .bind(&ov.priority)
        .bind(ov.completed)
        .bind(ov.created_at)
        .bind(ov.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}
