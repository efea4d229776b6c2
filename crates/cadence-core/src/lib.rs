//! # Cadence Core Library
//!
//! Recurrence materialization and per-occurrence override resolution for
//! task calendars: the part of a task manager that turns a recurring
//! definition into concrete occurrences, overlays single-occurrence edits
//! and completions without mutating the series, and keeps those overrides
//! attached to the right occurrence when the series definition changes.
//!
//! ## Features
//!
//! - **Pure expansion**: RFC 5545 rules expanded deterministically over
//!   absolute UTC instants, with exception dates and `UNTIL`/`COUNT`
//!   bounds honored
//! - **Partial overrides**: per-occurrence customization overlaid field by
//!   field on the series defaults, keyed by the nominal occurrence instant
//! - **Stable identity**: occurrences keep their external key even after
//!   their own start/end is moved
//! - **Re-keying on series edits**: when `dtstart` or the rule changes,
//!   overrides are re-attached by ordinal position in one transaction
//!   instead of being orphaned or duplicated
//! - **Orphan reporting**: overrides the current rule no longer generates
//!   are surfaced through a dedicated channel, never rendered as ghost
//!   occurrences and never silently discarded
//!
//! ## Core Modules
//!
//! - [`db`]: Database connection and schema management
//! - [`models`]: Core data structures and transfer objects
//! - [`expander`]: Recurrence rule expansion
//! - [`resolver`]: Occurrence/override merging
//! - [`identity`]: External occurrence addressing
//! - [`repository`]: Data access layer with per-domain store traits
//! - [`error`]: Error types
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use cadence_core::{
//!     db,
//!     models::NewSeriesData,
//!     repository::{OccurrenceStore, SeriesStore, SqliteRepository},
//! };
//! use chrono::{Duration, Utc};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), cadence_core::error::CoreError> {
//!     let pool = db::establish_connection("tasks.db").await?;
//!     let repo = SqliteRepository::new(pool);
//!
//!     let series = repo
//!         .create_series(NewSeriesData {
//!             title: "Daily standup".to_string(),
//!             dtstart: Utc::now(),
//!             duration_minutes: 15,
//!             rrule: Some("FREQ=DAILY;BYDAY=MO,TU,WE,TH,FR".to_string()),
//!             ..Default::default()
//!         })
//!         .await?;
//!
//!     let window = repo
//!         .occurrences_for_series(series.id, Utc::now(), Utc::now() + Duration::days(30))
//!         .await?;
//!     for occurrence in &window.occurrences {
//!         println!("{}: {}", occurrence.start, occurrence.title);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod db;
pub mod error;
pub mod expander;
pub mod identity;
pub mod models;
pub mod repository;
pub mod resolver;
