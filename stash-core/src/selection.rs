/*!
Pure selection over backup records.

Retention decides which archives may be deleted; restore selection decides
which archives a restore run extracts. Neither function touches the store,
and both return records in a deterministic order.
*/

use crate::key::{Timestamp, DATE_LEN, TIMESTAMP_LEN};
use crate::record::BackupRecord;
use crate::{Result, StashError};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::BTreeMap;

/// `(max_age_days, keep_latest)` pair governing deletion eligibility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    max_age_days: i64,
    keep_latest: usize,
}

impl RetentionPolicy {
    /// Rejects a non-positive age with a configuration error.
    pub fn new(max_age_days: i64, keep_latest: usize) -> Result<Self> {
        if max_age_days <= 0 {
            return Err(StashError::config(format!(
                "retention age must be greater than 0 days, got {max_age_days}"
            )));
        }
        Ok(Self {
            max_age_days,
            keep_latest,
        })
    }

    pub fn max_age_days(&self) -> i64 {
        self.max_age_days
    }

    pub fn keep_latest(&self) -> usize {
        self.keep_latest
    }

    /// Instant before which unprotected archives expire.
    ///
    /// `None` when the age reaches past the representable range, in which
    /// case nothing is old enough to expire.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        Duration::try_days(self.max_age_days).and_then(|age| now.checked_sub_signed(age))
    }
}

fn group_by_path(records: &[BackupRecord]) -> BTreeMap<(&str, &str), Vec<&BackupRecord>> {
    let mut groups: BTreeMap<(&str, &str), Vec<&BackupRecord>> = BTreeMap::new();
    for record in records {
        groups
            .entry((record.service.as_str(), record.path_name.as_str()))
            .or_default()
            .push(record);
    }
    for group in groups.values_mut() {
        group.sort_by(|a, b| (a.timestamp, &a.key).cmp(&(b.timestamp, &b.key)));
    }
    groups
}

/// Records eligible for deletion under `policy` at `now`.
///
/// Within each (service, path) group the newest `keep_latest` records are
/// protected; any other record strictly older than the cutoff is selected.
/// The result is sorted oldest first (ties by key).
pub fn select_expired(
    records: &[BackupRecord],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<BackupRecord> {
    let Some(cutoff) = policy.cutoff(now) else {
        return Vec::new();
    };

    let mut expired: Vec<BackupRecord> = group_by_path(records)
        .into_values()
        .flat_map(|group| {
            group
                .into_iter()
                .rev()
                .skip(policy.keep_latest)
                .filter(|record| record.timestamp.to_utc() < cutoff)
                .cloned()
                .collect::<Vec<_>>()
        })
        .collect();

    expired.sort_by(|a, b| (a.timestamp, &a.key).cmp(&(b.timestamp, &b.key)));
    expired
}

/// Which archives a restore run should extract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreFilter {
    /// Newest archive of every path
    Latest,
    /// Archives with exactly this timestamp
    Exact(Timestamp),
    /// Archives taken on this UTC day; `latest` keeps only the newest per path
    Day { date: NaiveDate, latest: bool },
}

impl RestoreFilter {
    /// Build a filter from an optional `YYYYMMDD` or `YYYYMMDD-HHMMSS` token.
    pub fn parse(token: Option<&str>, latest: bool) -> Result<Self> {
        let Some(token) = token else {
            return Ok(Self::Latest);
        };

        let parsed = match token.len() {
            TIMESTAMP_LEN => Timestamp::parse(token).map(Self::Exact),
            DATE_LEN if token.bytes().all(|b| b.is_ascii_digit()) => {
                NaiveDate::parse_from_str(token, "%Y%m%d")
                    .ok()
                    .map(|date| Self::Day { date, latest })
            }
            _ => None,
        };

        parsed.ok_or_else(|| {
            StashError::config(format!(
                "invalid date '{token}': expected YYYYMMDD or YYYYMMDD-HHMMSS"
            ))
        })
    }

    fn matches(&self, record: &BackupRecord) -> bool {
        match self {
            Self::Latest => true,
            Self::Exact(timestamp) => record.timestamp == *timestamp,
            Self::Day { date, .. } => record.timestamp.date() == *date,
        }
    }

    fn one_per_path(&self) -> bool {
        match self {
            Self::Latest | Self::Exact(_) => true,
            Self::Day { latest, .. } => *latest,
        }
    }
}

/// Records to restore, ordered by path then timestamp.
pub fn select_for_restore(records: &[BackupRecord], filter: &RestoreFilter) -> Vec<BackupRecord> {
    let matching: Vec<BackupRecord> = records
        .iter()
        .filter(|record| filter.matches(record))
        .cloned()
        .collect();

    group_by_path(&matching)
        .into_values()
        .flat_map(|group| {
            if filter.one_per_path() {
                group.last().map(|record| vec![(*record).clone()]).unwrap_or_default()
            } else {
                group.into_iter().cloned().collect()
            }
        })
        .collect()
}
