//! Recurrence expansion.
//!
//! Pure turning of a series definition into concrete occurrence instants.
//! Rules are RFC 5545 RRULE property values; the series' `dtstart` is
//! injected as DTSTART at parse time, and all arithmetic happens on
//! absolute UTC instants. The expander knows nothing about overrides.

use chrono::{DateTime, Duration, Utc};
use rrule::{RRuleSet, Tz as RRuleTz};
use std::collections::HashSet;

use crate::error::CoreError;
use crate::models::{ExceptionDate, Series};

/// Cap on instants produced per expansion. Rules dense enough to exceed
/// this within one window are truncated rather than allowed to run away.
pub const MAX_OCCURRENCES: u16 = 1000;

/// Validates an RRULE property value against the series start instant.
///
/// Rejected at series-write time so malformed rules never reach read-path
/// expansion: unparseable text, embedded DTSTART/RRULE framing (the store
/// owns those), missing FREQ, and frequency-incompatible fields such as
/// BYDAY under YEARLY without a BYMONTH/BYWEEKNO anchor.
pub fn validate_rule(rule: &str, dtstart: DateTime<Utc>) -> Result<(), CoreError> {
    let upper = rule.to_uppercase();
    if upper.trim().is_empty() {
        return Err(CoreError::InvalidRule("empty rule".to_string()));
    }
    if upper.contains("DTSTART") || upper.contains("RRULE:") {
        return Err(CoreError::InvalidRule(
            "rule must be a bare RRULE property value without DTSTART".to_string(),
        ));
    }
    if !upper.split(';').any(|part| part.starts_with("FREQ=")) {
        return Err(CoreError::InvalidRule(format!("missing FREQ in '{rule}'")));
    }
    if rule_frequency(rule).as_deref() == Some("YEARLY")
        && upper.contains("BYDAY=")
        && !upper.contains("BYMONTH=")
        && !upper.contains("BYWEEKNO=")
    {
        return Err(CoreError::InvalidRule(format!(
            "BYDAY is undefined for YEARLY without BYMONTH or BYWEEKNO: '{rule}'"
        )));
    }
    parse_rule_set(dtstart, rule)?;
    Ok(())
}

/// Extracts the FREQ token of a rule, uppercased. The re-keying policy
/// compares old and new frequencies to decide between ordinal re-mapping
/// and a series reset.
pub fn rule_frequency(rule: &str) -> Option<String> {
    rule.to_uppercase()
        .split(';')
        .find_map(|part| part.strip_prefix("FREQ=").map(str::to_string))
}

/// The raw rule-implied sequence from `dtstart`, ignoring exception dates.
///
/// This is the ordinal basis used when re-keying overrides across a rule
/// change: exception dates are keyed deletions, and letting them shift
/// every later ordinal would reintroduce the mismatch this pass removes.
/// `UNTIL`/`COUNT` bound the sequence; unbounded rules are capped at
/// `limit` instants.
pub fn nominal_sequence(
    dtstart: DateTime<Utc>,
    rule: Option<&str>,
    limit: u16,
) -> Result<Vec<DateTime<Utc>>, CoreError> {
    match rule {
        None => Ok(vec![dtstart]),
        Some(rule) => {
            let set = parse_rule_set(dtstart, rule)?;
            let (dates, _) = set.all(limit);
            Ok(dates.into_iter().map(|dt| dt.with_timezone(&Utc)).collect())
        }
    }
}

fn parse_rule_set(dtstart: DateTime<Utc>, rule: &str) -> Result<RRuleSet, CoreError> {
    let rrule_string = format!(
        "DTSTART:{}\nRRULE:{}",
        dtstart.format("%Y%m%dT%H%M%SZ"),
        rule
    );
    rrule_string
        .parse::<RRuleSet>()
        .map_err(|e| CoreError::InvalidRule(format!("failed to parse '{rule}': {e}")))
}

/// Expands one series into occurrence instants.
///
/// Built once per series from the definition and its exception dates, then
/// queried any number of times. Side-effect free; safe to use concurrently
/// across series.
#[derive(Debug)]
pub struct OccurrenceExpander {
    dtstart: DateTime<Utc>,
    rrule_set: Option<RRuleSet>,
    exception_dates: HashSet<DateTime<Utc>>,
}

impl OccurrenceExpander {
    pub fn new(series: &Series, exception_dates: &[ExceptionDate]) -> Result<Self, CoreError> {
        let rrule_set = match series.rrule.as_deref() {
            Some(rule) => Some(parse_rule_set(series.dtstart, rule)?),
            None => None,
        };
        Ok(Self {
            dtstart: series.dtstart,
            rrule_set,
            exception_dates: exception_dates.iter().map(|e| e.occurrence_dt).collect(),
        })
    }

    /// Ascending, duplicate-free nominal instants in `[start, end)`, with
    /// exception dates removed.
    pub fn between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut instants = match &self.rrule_set {
            None => {
                if self.dtstart >= start && self.dtstart < end {
                    vec![self.dtstart]
                } else {
                    Vec::new()
                }
            }
            Some(set) => {
                // rrule's after/before bounds are inclusive; pad the lower
                // bound and apply the exact half-open filter afterwards.
                let lower = (start - Duration::seconds(1)).with_timezone(&RRuleTz::UTC);
                let upper = end.with_timezone(&RRuleTz::UTC);
                let (dates, _) = set.clone().after(lower).before(upper).all(MAX_OCCURRENCES);
                dates
                    .into_iter()
                    .map(|dt| dt.with_timezone(&Utc))
                    .filter(|dt| *dt >= start && *dt < end)
                    .collect()
            }
        };
        instants.retain(|dt| !self.exception_dates.contains(dt));
        instants.dedup();
        instants
    }

    /// Whether the series currently generates an occurrence at exactly
    /// this nominal instant. Exception-dated instants do not count.
    pub fn generates(&self, instant: DateTime<Utc>) -> bool {
        if self.exception_dates.contains(&instant) {
            return false;
        }
        match &self.rrule_set {
            None => instant == self.dtstart,
            Some(set) => {
                let lower = (instant - Duration::seconds(1)).with_timezone(&RRuleTz::UTC);
                let upper = (instant + Duration::seconds(1)).with_timezone(&RRuleTz::UTC);
                let (dates, _) = set.clone().after(lower).before(upper).all(4);
                dates.iter().any(|dt| dt.with_timezone(&Utc) == instant)
            }
        }
    }

    /// The generated sequence from the start of the series, exception
    /// dates removed, capped at `limit` instants. Reconciliation scans use
    /// this as the authoritative membership set.
    pub fn sequence(&self, limit: u16) -> Vec<DateTime<Utc>> {
        let mut instants = match &self.rrule_set {
            None => vec![self.dtstart],
            Some(set) => {
                let (dates, _) = set.clone().all(limit);
                dates.into_iter().map(|dt| dt.with_timezone(&Utc)).collect()
            }
        };
        instants.retain(|dt| !self.exception_dates.contains(dt));
        instants
    }
}
