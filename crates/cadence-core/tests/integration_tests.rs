use cadence_core::db::establish_connection;
use cadence_core::error::CoreError;
use cadence_core::identity::OccurrenceId;
use cadence_core::models::*;
use cadence_core::repository::{OccurrenceStore, SeriesStore, SqliteRepository};
use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::SqlitePool;
use tempfile::TempDir;
use uuid::Uuid;

/// Helper function to create a test database
async fn setup_test_db() -> (SqliteRepository, SqlitePool, TempDir) {
    let _ = env_logger::builder().is_test(true).try_init();

    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
    let db_path = temp_dir.path().join("test.db");

    let pool = establish_connection(&db_path.to_string_lossy())
        .await
        .expect("Failed to establish test database connection");

    (SqliteRepository::new(pool.clone()), pool, temp_dir)
}

fn jan(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, day, 9, 0, 0).unwrap()
}

fn january() -> (DateTime<Utc>, DateTime<Utc>) {
    (
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap(),
    )
}

/// Weekly series starting Tuesday Jan 13 2026, 09:00 UTC.
async fn create_weekly_series(repo: &SqliteRepository, owner_id: Uuid) -> Series {
    repo.create_series(NewSeriesData {
        owner_id,
        title: "Weekly review".to_string(),
        description: Some("Go through the backlog".to_string()),
        priority: Some(Priority::Medium),
        dtstart: jan(13),
        duration_minutes: 60,
        rrule: Some("FREQ=WEEKLY".to_string()),
        ..Default::default()
    })
    .await
    .expect("Failed to create weekly series")
}

async fn create_one_off(repo: &SqliteRepository, owner_id: Uuid, day: u32) -> Series {
    repo.create_series(NewSeriesData {
        owner_id,
        title: "File taxes".to_string(),
        dtstart: jan(day),
        duration_minutes: 30,
        rrule: None,
        ..Default::default()
    })
    .await
    .expect("Failed to create one-off series")
}

#[tokio::test]
async fn test_weekly_expansion_in_window() {
    let (repo, _pool, _temp_dir) = setup_test_db().await;
    let series = create_weekly_series(&repo, Uuid::now_v7()).await;

    let (start, end) = january();
    let resolved = repo
        .occurrences_for_series(series.id, start, end)
        .await
        .expect("Failed to materialize window");

    let instants: Vec<_> = resolved.occurrences.iter().map(|o| o.occurrence_dt).collect();
    assert_eq!(instants, vec![jan(13), jan(20), jan(27)]);
    assert!(resolved.unresolved.is_empty());
    assert!(resolved.occurrences.iter().all(|o| !o.is_overridden));
    assert_eq!(resolved.occurrences[0].end, jan(13) + Duration::minutes(60));
}

#[tokio::test]
async fn test_override_overlay_is_partial() {
    let (repo, _pool, _temp_dir) = setup_test_db().await;
    let series = create_weekly_series(&repo, Uuid::now_v7()).await;

    repo.edit_occurrence(
        OccurrenceId::recurring(series.id, jan(20)),
        OccurrenceEdit {
            title: Some("X".to_string()),
            ..Default::default()
        },
    )
    .await
    .expect("Failed to edit occurrence");

    let (start, end) = january();
    let resolved = repo.occurrences_for_series(series.id, start, end).await.unwrap();

    let second = &resolved.occurrences[1];
    assert_eq!(second.title, "X");
    assert!(second.is_overridden);
    // Untouched fields keep the series defaults.
    assert_eq!(second.start, jan(20));
    assert_eq!(second.priority, Priority::Medium);
    assert_eq!(second.description, Some("Go through the backlog".to_string()));
    assert!(!resolved.occurrences[0].is_overridden);
    assert!(!resolved.occurrences[2].is_overridden);
}

#[tokio::test]
async fn test_rekeying_after_dtstart_shift() {
    // Regression for the instance-date-drifting defect: a customized
    // occurrence must follow its ordinal slot when the series start moves,
    // instead of duplicating or ghosting near its old dates.
    let (repo, _pool, _temp_dir) = setup_test_db().await;
    let series = create_weekly_series(&repo, Uuid::now_v7()).await;

    repo.edit_occurrence(
        OccurrenceId::recurring(series.id, jan(20)),
        OccurrenceEdit {
            start_at: Some(jan(19)),
            title: Some("X".to_string()),
            ..Default::default()
        },
    )
    .await
    .expect("Failed to edit occurrence");

    // Series edit: shift the whole sequence by one day.
    repo.update_series(
        series.id,
        UpdateSeriesData {
            dtstart: Some(jan(14)),
            ..Default::default()
        },
    )
    .await
    .expect("Failed to update series");

    let (start, end) = january();
    let resolved = repo.occurrences_for_series(series.id, start, end).await.unwrap();

    let instants: Vec<_> = resolved.occurrences.iter().map(|o| o.occurrence_dt).collect();
    assert_eq!(instants, vec![jan(14), jan(21), jan(28)]);
    assert!(resolved.unresolved.is_empty());

    // The second ordinal slot carries the customization, with the moved
    // start keeping its one-day offset before the slot.
    let second = &resolved.occurrences[1];
    assert!(second.is_overridden);
    assert_eq!(second.title, "X");
    assert_eq!(second.start, jan(20));
    assert_eq!(second.id, OccurrenceId::recurring(series.id, jan(21)));

    // No duplicate/ghost entry near Jan 19-20.
    assert_eq!(resolved.occurrences.len(), 3);
    assert!(resolved
        .occurrences
        .iter()
        .all(|o| o.occurrence_dt != jan(19) && o.occurrence_dt != jan(20)));

    let overrides = repo.find_overrides(series.id).await.unwrap();
    assert_eq!(overrides.len(), 1);
    assert_eq!(overrides[0].occurrence_dt, jan(21));
}

#[tokio::test]
async fn test_delete_occurrence_clears_override_and_exception_dates() {
    let (repo, _pool, _temp_dir) = setup_test_db().await;
    let series = create_weekly_series(&repo, Uuid::now_v7()).await;
    let target = OccurrenceId::recurring(series.id, jan(20));

    repo.edit_occurrence(
        target,
        OccurrenceEdit {
            title: Some("X".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    repo.delete_occurrence(target).await.expect("Failed to delete occurrence");

    // Jan 20 must not resurface, neither virtual nor overridden.
    let (start, end) = january();
    let resolved = repo.occurrences_for_series(series.id, start, end).await.unwrap();
    let instants: Vec<_> = resolved.occurrences.iter().map(|o| o.occurrence_dt).collect();
    assert_eq!(instants, vec![jan(13), jan(27)]);
    assert!(resolved.unresolved.is_empty());

    assert!(repo.find_overrides(series.id).await.unwrap().is_empty());
    let exception_dates = repo.find_exception_dates(series.id).await.unwrap();
    assert_eq!(exception_dates.len(), 1);
    assert_eq!(exception_dates[0].occurrence_dt, jan(20));

    // The slot is gone; addressing it again is a conflict.
    let result = repo.delete_occurrence(target).await;
    assert!(matches!(result, Err(CoreError::OccurrenceNotFound { .. })));
}

#[tokio::test]
async fn test_materialization_is_idempotent() {
    let (repo, _pool, _temp_dir) = setup_test_db().await;
    let series = create_weekly_series(&repo, Uuid::now_v7()).await;

    repo.edit_occurrence(
        OccurrenceId::recurring(series.id, jan(20)),
        OccurrenceEdit {
            start_at: Some(jan(19)),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let (start, end) = january();
    let first = repo.occurrences_for_series(series.id, start, end).await.unwrap();
    let second = repo.occurrences_for_series(series.id, start, end).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_override_dropped_when_ordinal_no_longer_exists() {
    let (repo, _pool, _temp_dir) = setup_test_db().await;
    let series = create_weekly_series(&repo, Uuid::now_v7()).await;

    repo.edit_occurrence(
        OccurrenceId::recurring(series.id, jan(27)),
        OccurrenceEdit {
            title: Some("third slot".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // Shrink the horizon: the sequence now ends at Jan 20, so ordinal 2
    // no longer exists.
    repo.update_series(
        series.id,
        UpdateSeriesData {
            rrule: Some(Some("FREQ=WEEKLY;UNTIL=20260120T090000Z".to_string())),
            ..Default::default()
        },
    )
    .await
    .expect("Failed to shrink series horizon");

    let (start, end) = january();
    let resolved = repo.occurrences_for_series(series.id, start, end).await.unwrap();
    let instants: Vec<_> = resolved.occurrences.iter().map(|o| o.occurrence_dt).collect();
    assert_eq!(instants, vec![jan(13), jan(20)]);
    assert!(resolved.unresolved.is_empty(), "no out-of-window ghost");
    assert!(repo.find_overrides(series.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_frequency_change_resets_overrides() {
    let (repo, _pool, _temp_dir) = setup_test_db().await;
    let series = create_weekly_series(&repo, Uuid::now_v7()).await;

    repo.complete_occurrence(OccurrenceId::recurring(series.id, jan(20)), true)
        .await
        .unwrap();
    assert_eq!(repo.find_overrides(series.id).await.unwrap().len(), 1);

    repo.update_series(
        series.id,
        UpdateSeriesData {
            rrule: Some(Some("FREQ=DAILY".to_string())),
            ..Default::default()
        },
    )
    .await
    .expect("Failed to change frequency");

    // Ordinal correspondence is meaningless across frequencies; the edit
    // acts as a series reset.
    assert!(repo.find_overrides(series.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_exception_date_edits_do_not_rekey() {
    let (repo, _pool, _temp_dir) = setup_test_db().await;
    let series = create_weekly_series(&repo, Uuid::now_v7()).await;

    repo.edit_occurrence(
        OccurrenceId::recurring(series.id, jan(20)),
        OccurrenceEdit {
            title: Some("X".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // An exception at a different instant leaves the override untouched.
    repo.add_exception_date(series.id, jan(13)).await.unwrap();
    let overrides = repo.find_overrides(series.id).await.unwrap();
    assert_eq!(overrides.len(), 1);
    assert_eq!(overrides[0].occurrence_dt, jan(20));

    // An exception exactly at the override's key deletes it.
    repo.add_exception_date(series.id, jan(20)).await.unwrap();
    assert!(repo.find_overrides(series.id).await.unwrap().is_empty());

    let (start, end) = january();
    let resolved = repo.occurrences_for_series(series.id, start, end).await.unwrap();
    let instants: Vec<_> = resolved.occurrences.iter().map(|o| o.occurrence_dt).collect();
    assert_eq!(instants, vec![jan(27)]);
}

#[tokio::test]
async fn test_remove_exception_date_restores_the_occurrence() {
    let (repo, _pool, _temp_dir) = setup_test_db().await;
    let series = create_weekly_series(&repo, Uuid::now_v7()).await;
    let (start, end) = january();

    repo.add_exception_date(series.id, jan(20)).await.unwrap();
    let resolved = repo.occurrences_for_series(series.id, start, end).await.unwrap();
    let instants: Vec<_> = resolved.occurrences.iter().map(|o| o.occurrence_dt).collect();
    assert_eq!(instants, vec![jan(13), jan(27)]);

    repo.remove_exception_date(series.id, jan(20)).await.unwrap();
    let resolved = repo.occurrences_for_series(series.id, start, end).await.unwrap();
    let instants: Vec<_> = resolved.occurrences.iter().map(|o| o.occurrence_dt).collect();
    assert_eq!(instants, vec![jan(13), jan(20), jan(27)]);
    assert!(repo.find_exception_dates(series.id).await.unwrap().is_empty());

    // Both edits changed what the series materializes to.
    let reloaded = repo.find_series_by_id(series.id).await.unwrap().unwrap();
    assert_eq!(reloaded.revision, 2);

    // Removing an exception that was never added is not found.
    let result = repo.remove_exception_date(series.id, jan(19)).await;
    assert!(matches!(result, Err(CoreError::NotFound(_))));
}

#[tokio::test]
async fn test_noop_instance_edit_still_validates_the_target() {
    let (repo, _pool, _temp_dir) = setup_test_db().await;
    let series = create_weekly_series(&repo, Uuid::now_v7()).await;

    // A field-less edit must not paper over a bad address.
    let result = repo
        .edit_occurrence(
            OccurrenceId::recurring(Uuid::now_v7(), jan(20)),
            OccurrenceEdit::default(),
        )
        .await;
    assert!(matches!(result, Err(CoreError::NotFound(_))));

    let result = repo
        .edit_occurrence(
            OccurrenceId::recurring(series.id, jan(19)),
            OccurrenceEdit::default(),
        )
        .await;
    assert!(matches!(result, Err(CoreError::OccurrenceNotFound { .. })));

    // Against a valid instant it succeeds and writes nothing.
    repo.edit_occurrence(
        OccurrenceId::recurring(series.id, jan(20)),
        OccurrenceEdit::default(),
    )
    .await
    .unwrap();
    assert!(repo.find_overrides(series.id).await.unwrap().is_empty());
    let reloaded = repo.find_series_by_id(series.id).await.unwrap().unwrap();
    assert_eq!(reloaded.revision, 0);
}

#[tokio::test]
async fn test_one_off_edit_rejects_end_before_start() {
    let (repo, _pool, _temp_dir) = setup_test_db().await;
    let series = create_one_off(&repo, Uuid::now_v7(), 15).await;

    let result = repo
        .edit_occurrence(
            OccurrenceId::one_off(series.id),
            OccurrenceEdit {
                end_at: Some(jan(14)),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(result, Err(CoreError::InvalidInput(_))));

    // The rejected edit left the record untouched.
    let reloaded = repo.find_series_by_id(series.id).await.unwrap().unwrap();
    assert_eq!(reloaded.dtstart, jan(15));
    assert_eq!(reloaded.duration_minutes, 30);
    assert_eq!(reloaded.revision, 0);
}

#[tokio::test]
async fn test_instance_mutation_on_unknown_instant_is_a_conflict() {
    let (repo, _pool, _temp_dir) = setup_test_db().await;
    let series = create_weekly_series(&repo, Uuid::now_v7()).await;

    // Jan 19 is not generated by the weekly rule and holds no override.
    let result = repo
        .edit_occurrence(
            OccurrenceId::recurring(series.id, jan(19)),
            OccurrenceEdit {
                title: Some("X".to_string()),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(result, Err(CoreError::OccurrenceNotFound { .. })));

    let result = repo
        .complete_occurrence(OccurrenceId::recurring(series.id, jan(19)), true)
        .await;
    assert!(matches!(result, Err(CoreError::OccurrenceNotFound { .. })));

    // Nothing was invented.
    assert!(repo.find_overrides(series.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_completion_round_trip_returns_override_to_absent() {
    let (repo, _pool, _temp_dir) = setup_test_db().await;
    let series = create_weekly_series(&repo, Uuid::now_v7()).await;
    let target = OccurrenceId::recurring(series.id, jan(20));

    repo.complete_occurrence(target, true).await.unwrap();

    let (start, end) = january();
    let resolved = repo.occurrences_for_series(series.id, start, end).await.unwrap();
    // Completed occurrences are included, not filtered.
    assert_eq!(resolved.occurrences.len(), 3);
    assert!(resolved.occurrences[1].completed);

    // Un-completing an otherwise untouched occurrence removes the record.
    repo.complete_occurrence(target, false).await.unwrap();
    assert!(repo.find_overrides(series.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_one_off_mutations_route_to_the_series() {
    let (repo, _pool, _temp_dir) = setup_test_db().await;
    let owner_id = Uuid::now_v7();
    let series = create_one_off(&repo, owner_id, 15).await;
    let target = OccurrenceId::one_off(series.id);

    let (start, end) = january();
    let resolved = repo.occurrences_for_series(series.id, start, end).await.unwrap();
    assert_eq!(resolved.occurrences.len(), 1);
    assert_eq!(resolved.occurrences[0].id, target);

    // Completion lands on the series record.
    repo.complete_occurrence(target, true).await.unwrap();
    let reloaded = repo.find_series_by_id(series.id).await.unwrap().unwrap();
    assert!(reloaded.completed_at.is_some());
    assert!(repo.find_overrides(series.id).await.unwrap().is_empty());
    let resolved = repo.occurrences_for_series(series.id, start, end).await.unwrap();
    assert!(resolved.occurrences[0].completed);

    // So does an instance edit: the occurrence is the series.
    repo.edit_occurrence(
        target,
        OccurrenceEdit {
            start_at: Some(jan(16)),
            title: Some("File taxes (moved)".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let reloaded = repo.find_series_by_id(series.id).await.unwrap().unwrap();
    assert_eq!(reloaded.dtstart, jan(16));
    assert_eq!(reloaded.title, "File taxes (moved)");

    // Deleting the only occurrence deletes the task.
    repo.delete_occurrence(target).await.unwrap();
    assert!(repo.find_series_by_id(series.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_one_off_rejects_instant_addressing_and_vice_versa() {
    let (repo, _pool, _temp_dir) = setup_test_db().await;
    let owner_id = Uuid::now_v7();
    let one_off = create_one_off(&repo, owner_id, 15).await;
    let weekly = create_weekly_series(&repo, owner_id).await;

    let result = repo
        .complete_occurrence(OccurrenceId::recurring(one_off.id, jan(15)), true)
        .await;
    assert!(matches!(result, Err(CoreError::InvalidInput(_))));

    let result = repo.complete_occurrence(OccurrenceId::one_off(weekly.id), true).await;
    assert!(matches!(result, Err(CoreError::InvalidInput(_))));
}

#[tokio::test]
async fn test_series_delete_cascades() {
    let (repo, _pool, _temp_dir) = setup_test_db().await;
    let series = create_weekly_series(&repo, Uuid::now_v7()).await;

    repo.edit_occurrence(
        OccurrenceId::recurring(series.id, jan(20)),
        OccurrenceEdit {
            title: Some("X".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    repo.delete_occurrence(OccurrenceId::recurring(series.id, jan(27)))
        .await
        .unwrap();

    repo.delete_series(series.id).await.expect("Failed to delete series");

    assert!(repo.find_series_by_id(series.id).await.unwrap().is_none());
    assert!(repo.find_overrides(series.id).await.unwrap().is_empty());
    assert!(repo.find_exception_dates(series.id).await.unwrap().is_empty());

    let result = repo.delete_series(series.id).await;
    assert!(matches!(result, Err(CoreError::NotFound(_))));
}

#[tokio::test]
async fn test_revision_tracks_materialization_relevant_writes() {
    let (repo, _pool, _temp_dir) = setup_test_db().await;
    let series = create_weekly_series(&repo, Uuid::now_v7()).await;
    assert_eq!(series.revision, 0);

    let updated = repo
        .update_series(
            series.id,
            UpdateSeriesData {
                title: Some("Weekly review (renamed)".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.revision, 1);

    repo.edit_occurrence(
        OccurrenceId::recurring(series.id, jan(20)),
        OccurrenceEdit {
            title: Some("X".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let reloaded = repo.find_series_by_id(series.id).await.unwrap().unwrap();
    assert_eq!(reloaded.revision, 2);

    repo.add_exception_date(series.id, jan(13)).await.unwrap();
    let reloaded = repo.find_series_by_id(series.id).await.unwrap().unwrap();
    assert_eq!(reloaded.revision, 3);
}

#[tokio::test]
async fn test_invalid_rules_are_rejected_at_write_time() {
    let (repo, _pool, _temp_dir) = setup_test_db().await;

    let result = repo
        .create_series(NewSeriesData {
            title: "Broken".to_string(),
            dtstart: jan(13),
            rrule: Some("FREQ=SOMETIMES".to_string()),
            ..Default::default()
        })
        .await;
    assert!(matches!(result, Err(CoreError::InvalidRule(_))));

    let series = create_weekly_series(&repo, Uuid::now_v7()).await;
    let result = repo
        .update_series(
            series.id,
            UpdateSeriesData {
                rrule: Some(Some("FREQ=YEARLY;BYDAY=MO".to_string())),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(result, Err(CoreError::InvalidRule(_))));

    // The failed edit rolled back: the stored rule still expands.
    let (start, end) = january();
    let resolved = repo.occurrences_for_series(series.id, start, end).await.unwrap();
    assert_eq!(resolved.occurrences.len(), 3);
}

#[tokio::test]
async fn test_legacy_drifted_override_is_reported_not_rendered() {
    let (repo, pool, _temp_dir) = setup_test_db().await;
    let series = create_weekly_series(&repo, Uuid::now_v7()).await;

    // Simulate pre-existing drifted data: an override keyed to an instant
    // the rule never generated, inserted behind the store's back.
    sqlx::query(
        r#"INSERT INTO occurrence_overrides (series_id, occurrence_dt, start_at, end_at, title, description, priority, completed, created_at, updated_at)
        VALUES ($1, $2, NULL, NULL, $3, NULL, NULL, 0, $4, $5)"#,
    )
    .bind(series.id)
    .bind(jan(19))
    .bind("stranded")
    .bind(Utc::now())
    .bind(Utc::now())
    .execute(&pool)
    .await
    .expect("Failed to insert drifted override");

    let (start, end) = january();
    let resolved = repo.occurrences_for_series(series.id, start, end).await.unwrap();

    // Reported through the unresolved channel, not rendered as a ghost.
    assert_eq!(resolved.occurrences.len(), 3);
    assert!(resolved.occurrences.iter().all(|o| o.occurrence_dt != jan(19)));
    assert_eq!(resolved.unresolved.len(), 1);
    assert_eq!(resolved.unresolved[0].occurrence_dt, jan(19));

    let orphans = repo.find_orphaned_overrides(series.id).await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].occurrence_dt, jan(19));

    // A series edit reconciles: the orphan has no ordinal to map from.
    repo.update_series(
        series.id,
        UpdateSeriesData {
            dtstart: Some(jan(14)),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(repo.find_orphaned_overrides(series.id).await.unwrap().is_empty());
    assert!(repo.find_overrides(series.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_owner_window_merges_series_in_start_order() {
    let (repo, _pool, _temp_dir) = setup_test_db().await;
    let owner_id = Uuid::now_v7();
    let weekly = create_weekly_series(&repo, owner_id).await;
    let one_off = create_one_off(&repo, owner_id, 15).await;
    // Another owner's series must not leak in.
    create_one_off(&repo, Uuid::now_v7(), 16).await;

    let (start, end) = january();
    let resolved = repo.occurrences_for_owner(owner_id, start, end).await.unwrap();

    let starts: Vec<_> = resolved.occurrences.iter().map(|o| o.start).collect();
    assert_eq!(starts, vec![jan(13), jan(15), jan(20), jan(27)]);
    assert_eq!(resolved.occurrences[1].series_id, one_off.id);
    assert!(resolved
        .occurrences
        .iter()
        .filter(|o| o.series_id == weekly.id)
        .count() == 3);
}
