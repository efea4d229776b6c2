//! Occurrence resolution.
//!
//! Merges the expander's output for one series with that series' override
//! records, producing the final materialized occurrence list for a window.
//! Pure and deterministic: the same series state and window always yield
//! the same result, so callers may memoize on `(series id, window,
//! revision)`.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::error::CoreError;
use crate::expander::OccurrenceExpander;
use crate::models::{
    ExceptionDate, MaterializedOccurrence, OccurrenceOverride, ResolvedWindow, Series,
};

/// Resolves one series over `[window_start, window_end)`.
///
/// Each expanded instant materializes either virtually (series defaults)
/// or with its override overlaid, matched by exact nominal-instant
/// equality. Overrides whose key lies inside the window but matches no
/// expanded instant are orphans: they go to the unresolved channel for a
/// reconciliation pass, never into the occurrence list. Completed
/// occurrences stay in the list with `completed = true`; filtering them is
/// the caller's concern.
pub fn resolve_window(
    series: &Series,
    exception_dates: &[ExceptionDate],
    overrides: &[OccurrenceOverride],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Result<ResolvedWindow, CoreError> {
    let expander = OccurrenceExpander::new(series, exception_dates)?;

    let mut by_key: HashMap<DateTime<Utc>, &OccurrenceOverride> = overrides
        .iter()
        .map(|ov| (ov.occurrence_dt, ov))
        .collect();

    let mut occurrences = Vec::new();
    for instant in expander.between(window_start, window_end) {
        match by_key.remove(&instant) {
            Some(ov) => occurrences.push(MaterializedOccurrence::overridden(series, instant, ov)),
            None => occurrences.push(MaterializedOccurrence::virtual_slot(series, instant)),
        }
    }

    let mut unresolved: Vec<OccurrenceOverride> = by_key
        .into_values()
        .filter(|ov| ov.occurrence_dt >= window_start && ov.occurrence_dt < window_end)
        .cloned()
        .collect();
    unresolved.sort_by_key(|ov| ov.occurrence_dt);

    Ok(ResolvedWindow {
        occurrences,
        unresolved,
    })
}
