//! Stable external addressing for occurrences.
//!
//! An occurrence is addressed by its series id plus the nominal,
//! rule-implied instant it was generated at. The key deliberately ignores
//! any overridden start/end, so a customized occurrence keeps the same
//! identity before and after its own time is moved. Non-recurring series
//! have exactly one occurrence and are addressed by the series id alone.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::models::Series;

const INSTANT_FORMAT: &str = "%Y%m%dT%H%M%SZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OccurrenceId {
    pub series_id: Uuid,
    /// Nominal occurrence instant; None for one-off series.
    pub occurrence_dt: Option<DateTime<Utc>>,
}

impl OccurrenceId {
    pub fn one_off(series_id: Uuid) -> Self {
        Self {
            series_id,
            occurrence_dt: None,
        }
    }

    pub fn recurring(series_id: Uuid, occurrence_dt: DateTime<Utc>) -> Self {
        Self {
            series_id,
            occurrence_dt: Some(occurrence_dt),
        }
    }

    pub fn for_series(series: &Series, occurrence_dt: DateTime<Utc>) -> Self {
        if series.is_recurring() {
            Self::recurring(series.id, occurrence_dt)
        } else {
            Self::one_off(series.id)
        }
    }
}

impl fmt::Display for OccurrenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.occurrence_dt {
            Some(dt) => write!(f, "{}@{}", self.series_id, dt.format(INSTANT_FORMAT)),
            None => write!(f, "{}", self.series_id),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
#[error("Invalid occurrence id: {0}")]
pub struct ParseOccurrenceIdError(String);

impl FromStr for OccurrenceId {
    type Err = ParseOccurrenceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            None => {
                let series_id =
                    Uuid::parse_str(s).map_err(|_| ParseOccurrenceIdError(s.to_string()))?;
                Ok(Self::one_off(series_id))
            }
            Some((id_part, dt_part)) => {
                let series_id =
                    Uuid::parse_str(id_part).map_err(|_| ParseOccurrenceIdError(s.to_string()))?;
                let naive = NaiveDateTime::parse_from_str(dt_part, INSTANT_FORMAT)
                    .map_err(|_| ParseOccurrenceIdError(s.to_string()))?;
                Ok(Self::recurring(series_id, naive.and_utc()))
            }
        }
    }
}
