use crate::error::CoreError;
use crate::expander::{self, MAX_OCCURRENCES};
use crate::models::{ExceptionDate, NewSeriesData, OccurrenceOverride, Priority, Series, UpdateSeriesData};
use crate::repository::SqliteRepository;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

#[async_trait]
impl super::SeriesStore for SqliteRepository {
    async fn create_series(&self, data: NewSeriesData) -> Result<Series, CoreError> {
        if let Some(rule) = &data.rrule {
            expander::validate_rule(rule, data.dtstart)?;
        }
        if data.duration_minutes < 0 {
            return Err(CoreError::InvalidInput(
                "duration_minutes must be non-negative".to_string(),
            ));
        }

        let series = Series {
            id: Uuid::now_v7(),
            owner_id: data.owner_id,
            title: data.title,
            description: data.description,
            priority: data.priority.unwrap_or(Priority::None),
            pinned: data.pinned,
            item_order: 0,
            list_id: data.list_id,
            dtstart: data.dtstart,
            duration_minutes: data.duration_minutes,
            rrule: data.rrule,
            completed_at: None,
            revision: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        sqlx::query(
            r#"INSERT INTO series (id, owner_id, title, description, priority, pinned, item_order, list_id, dtstart, duration_minutes, rrule, completed_at, revision, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"#,
        )
        .bind(series.id)
        .bind(series.owner_id)
        .bind(&series.title)
        .bind(&series.description)
        .bind(&series.priority)
        .bind(series.pinned)
        .bind(series.item_order)
        .bind(series.list_id)
        .bind(series.dtstart)
        .bind(series.duration_minutes)
        .bind(&series.rrule)
        .bind(series.completed_at)
        .bind(series.revision)
        .bind(series.created_at)
        .bind(series.updated_at)
        .execute(self.pool())
        .await?;

        Ok(series)
    }

    async fn find_series_by_id(&self, id: Uuid) -> Result<Option<Series>, CoreError> {
        let series = sqlx::query_as("SELECT * FROM series WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(series)
    }

    async fn find_series_by_owner(&self, owner_id: Uuid) -> Result<Vec<Series>, CoreError> {
        let series = sqlx::query_as(
            "SELECT * FROM series WHERE owner_id = $1 ORDER BY item_order, created_at",
        )
        .bind(owner_id)
        .fetch_all(self.pool())
        .await?;
        Ok(series)
    }

    async fn update_series(&self, id: Uuid, data: UpdateSeriesData) -> Result<Series, CoreError> {
        let mut tx = self.pool().begin().await?;

        let current: Series = sqlx::query_as("SELECT * FROM series WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Series with id {} not found", id)))?;

        if data.is_noop() {
            return Ok(current);
        }

        let new_dtstart = data.dtstart.unwrap_or(current.dtstart);
        let new_rrule = match &data.rrule {
            Some(rule) => rule.clone(),
            None => current.rrule.clone(),
        };
        if let Some(rule) = &new_rrule {
            // Validate against the start instant the rule will actually
            // be anchored to after this edit.
            expander::validate_rule(rule, new_dtstart)?;
        }
        if let Some(minutes) = data.duration_minutes {
            if minutes < 0 {
                return Err(CoreError::InvalidInput(
                    "duration_minutes must be non-negative".to_string(),
                ));
            }
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE series SET ");

        if let Some(title) = &data.title {
            qb.push("title = ");
            qb.push_bind(title);
            qb.push(", ");
        }
        if let Some(description) = &data.description {
            qb.push("description = ");
            qb.push_bind(description);
            qb.push(", ");
        }
        if let Some(priority) = &data.priority {
            qb.push("priority = ");
            qb.push_bind(priority);
            qb.push(", ");
        }
        if let Some(pinned) = data.pinned {
            qb.push("pinned = ");
            qb.push_bind(pinned);
            qb.push(", ");
        }
        if let Some(item_order) = data.item_order {
            qb.push("item_order = ");
            qb.push_bind(item_order);
            qb.push(", ");
        }
        if let Some(list_id) = &data.list_id {
            qb.push("list_id = ");
            qb.push_bind(*list_id);
            qb.push(", ");
        }
        if let Some(dtstart) = data.dtstart {
            qb.push("dtstart = ");
            qb.push_bind(dtstart);
            qb.push(", ");
        }
        if let Some(minutes) = data.duration_minutes {
            qb.push("duration_minutes = ");
            qb.push_bind(minutes);
            qb.push(", ");
        }
        if let Some(rrule) = &data.rrule {
            qb.push("rrule = ");
            qb.push_bind(rrule.clone());
            qb.push(", ");
        }
        qb.push("revision = revision + 1, updated_at = ");
        qb.push_bind(Utc::now());
        qb.push(" WHERE id = ");
        qb.push_bind(id);

        qb.build().execute(&mut *tx).await?;

        // A changed start or rule shifts the generated sequence; re-attach
        // the overrides to their new nominal instants before anyone reads.
        let schedule_changed = new_dtstart != current.dtstart || new_rrule != current.rrule;
        if schedule_changed {
            Self::rekey_overrides(&mut tx, &current, new_dtstart, new_rrule.as_deref()).await?;
        }

        let updated: Series = sqlx::query_as("SELECT * FROM series WHERE id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn delete_series(&self, id: Uuid) -> Result<(), CoreError> {
        let mut tx = self.pool().begin().await?;

        sqlx::query("DELETE FROM occurrence_overrides WHERE series_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM series_exception_dates WHERE series_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM series WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("Series with id {} not found", id)));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn add_exception_date(
        &self,
        series_id: Uuid,
        occurrence_dt: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool().begin().await?;
        Self::add_exception_date_in_transaction(&mut tx, series_id, occurrence_dt).await?;
        Self::touch_series(&mut tx, series_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn remove_exception_date(
        &self,
        series_id: Uuid,
        occurrence_dt: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool().begin().await?;

        let result = sqlx::query(
            "DELETE FROM series_exception_dates WHERE series_id = $1 AND occurrence_dt = $2",
        )
        .bind(series_id)
        .bind(occurrence_dt)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!(
                "Exception date not found for series {} at {}",
                series_id, occurrence_dt
            )));
        }

        Self::touch_series(&mut tx, series_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_exception_dates(&self, series_id: Uuid) -> Result<Vec<ExceptionDate>, CoreError> {
        let exception_dates = sqlx::query_as(
            "SELECT * FROM series_exception_dates WHERE series_id = $1 ORDER BY occurrence_dt",
        )
        .bind(series_id)
        .fetch_all(self.pool())
        .await?;
        Ok(exception_dates)
    }
}

impl SqliteRepository {
    /// Bump the series revision inside an existing transaction. Every
    /// write that can change what the series materializes to goes through
    /// this, so `(series_id, window, revision)` stays a valid cache key.
    pub(crate) async fn touch_series(
        tx: &mut Transaction<'_, Sqlite>,
        series_id: Uuid,
    ) -> Result<(), CoreError> {
        let result =
            sqlx::query("UPDATE series SET revision = revision + 1, updated_at = $1 WHERE id = $2")
                .bind(Utc::now())
                .bind(series_id)
                .execute(&mut **tx)
                .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!(
                "Series with id {} not found",
                series_id
            )));
        }
        Ok(())
    }

    /// Add an exception date inside an existing transaction. An exception
    /// landing exactly on an override's key deletes that override: the
    /// occurrence is gone, so nothing may keep customizing it.
    pub(crate) async fn add_exception_date_in_transaction(
        tx: &mut Transaction<'_, Sqlite>,
        series_id: Uuid,
        occurrence_dt: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"INSERT INTO series_exception_dates (series_id, occurrence_dt, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (series_id, occurrence_dt) DO NOTHING"#,
        )
        .bind(series_id)
        .bind(occurrence_dt)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;

        sqlx::query("DELETE FROM occurrence_overrides WHERE series_id = $1 AND occurrence_dt = $2")
            .bind(series_id)
            .bind(occurrence_dt)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    /// Re-attach overrides after a schedule change, by ordinal position.
    ///
    /// The old and new rule-implied sequences (exception dates excluded)
    /// are aligned by position: an override keyed to the old sequence's
    /// i-th instant moves to the new sequence's i-th instant, and its
    /// customized start/end shift by the same delta so they keep their
    /// offset relative to the slot. An override whose ordinal does not
    /// exist in the new sequence is dropped, as is one whose key the old
    /// sequence never generated. Ordinal alignment is only meaningful
    /// within one frequency; a frequency change (including adding or
    /// removing the rule) resets the series and drops all overrides.
    ///
    /// Runs entirely inside the caller's transaction: it either completes
    /// or rolls back with the rest of the series edit.
    pub(crate) async fn rekey_overrides(
        tx: &mut Transaction<'_, Sqlite>,
        old: &Series,
        new_dtstart: DateTime<Utc>,
        new_rrule: Option<&str>,
    ) -> Result<(), CoreError> {
        let overrides: Vec<OccurrenceOverride> =
            sqlx::query_as("SELECT * FROM occurrence_overrides WHERE series_id = $1")
                .bind(old.id)
                .fetch_all(&mut **tx)
                .await?;

        if overrides.is_empty() {
            return Ok(());
        }

        let old_freq = old.rrule.as_deref().and_then(expander::rule_frequency);
        let new_freq = new_rrule.and_then(expander::rule_frequency);

        if old_freq != new_freq {
            log::warn!(
                "series {}: frequency changed ({:?} -> {:?}), dropping {} override(s)",
                old.id,
                old_freq,
                new_freq,
                overrides.len()
            );
            sqlx::query("DELETE FROM occurrence_overrides WHERE series_id = $1")
                .bind(old.id)
                .execute(&mut **tx)
                .await?;
            return Ok(());
        }

        let old_sequence =
            expander::nominal_sequence(old.dtstart, old.rrule.as_deref(), MAX_OCCURRENCES)?;
        let new_sequence = expander::nominal_sequence(new_dtstart, new_rrule, MAX_OCCURRENCES)?;

        let ordinals: HashMap<DateTime<Utc>, usize> = old_sequence
            .iter()
            .enumerate()
            .map(|(i, dt)| (*dt, i))
            .collect();

        // Delete-and-reinsert so a re-keyed instant can land on another
        // override's old key without a mid-pass unique-constraint clash.
        sqlx::query("DELETE FROM occurrence_overrides WHERE series_id = $1")
            .bind(old.id)
            .execute(&mut **tx)
            .await?;

        for ov in overrides {
            let Some(&ordinal) = ordinals.get(&ov.occurrence_dt) else {
                log::warn!(
                    "series {}: dropping orphaned override at {} (not in the old sequence)",
                    old.id,
                    ov.occurrence_dt
                );
                continue;
            };
            let Some(&new_key) = new_sequence.get(ordinal) else {
                log::warn!(
                    "series {}: dropping override at {} (ordinal {} beyond the new sequence)",
                    old.id,
                    ov.occurrence_dt,
                    ordinal
                );
                continue;
            };

            let delta = new_key - ov.occurrence_dt;
            log::debug!(
                "series {}: re-keying override {} -> {} (ordinal {})",
                old.id,
                ov.occurrence_dt,
                new_key,
                ordinal
            );

            sqlx::query(
                r#"INSERT INTO occurrence_overrides (series_id, occurrence_dt, start_at, end_at, title, description, priority, completed, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
            )
            .bind(ov.series_id)
            .bind(new_key)
            .bind(ov.start_at.map(|dt| dt + delta))
            .bind(ov.end_at.map(|dt| dt + delta))
            .bind(&ov.title)
            .bind(&ov.description)
            .bind(&ov.priority)
            .bind(ov.completed)
            .bind(ov.created_at)
            .bind(Utc::now())
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }
}
