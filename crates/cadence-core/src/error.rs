use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Database error")]
    Database(#[from] sqlx::Error),

    #[error("IO error")]
    Io(#[from] std::io::Error),

    #[error("Invalid recurrence rule: {0}")]
    InvalidRule(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The addressed occurrence is neither generated by the current rule
    /// nor held by an existing override. Surfaced as a conflict so the
    /// caller can re-fetch instead of the store inventing a record.
    #[error("Occurrence {occurrence_dt} of series {series_id} does not exist")]
    OccurrenceNotFound {
        series_id: Uuid,
        occurrence_dt: DateTime<Utc>,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
