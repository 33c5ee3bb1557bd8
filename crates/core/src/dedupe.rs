use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Time granularity within which repeated triggers for the same
/// (hub, recipe, member) collapse into a single enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupePeriod {
    Day,
    Week,
}

impl Default for DedupePeriod {
    fn default() -> Self {
        Self::Day
    }
}

impl DedupePeriod {
    /// Returns the bucket string for the given instant.
    ///
    /// `Day` buckets are the UTC calendar date (`YYYY-MM-DD`); `Week`
    /// buckets are the ISO-8601 week (`YYYY-Www`, Monday-start, keyed by the
    /// ISO week-year so year boundaries never collide).
    pub fn bucket(self, now: DateTime<Utc>) -> String {
        match self {
            Self::Day => now.format("%Y-%m-%d").to_string(),
            Self::Week => {
                let week = now.iso_week();
                format!("{:04}-W{:02}", week.year(), week.week())
            }
        }
    }
}

/// Derives the stable dedupe key for a (hub, recipe, member, bucket) tuple.
///
/// SHA-256 hex of `hub:recipe:member:bucket`; used purely as a uniqueness
/// constraint value, not for security.
pub fn dedupe_key(
    hub_id: &str,
    recipe: &str,
    member_id: &str,
    period: DedupePeriod,
    now: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(hub_id.as_bytes());
    hasher.update(b":");
    hasher.update(recipe.as_bytes());
    hasher.update(b":");
    hasher.update(member_id.as_bytes());
    hasher.update(b":");
    hasher.update(period.bucket(now).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn same_day_yields_identical_keys() {
        let morning = at("2024-03-04T01:00:00Z");
        let evening = at("2024-03-04T23:59:59Z");
        assert_eq!(
            dedupe_key("hub", "welcome", "mem", DedupePeriod::Day, morning),
            dedupe_key("hub", "welcome", "mem", DedupePeriod::Day, evening),
        );
    }

    #[test]
    fn different_days_yield_different_keys() {
        let monday = at("2024-03-04T12:00:00Z");
        let tuesday = at("2024-03-05T12:00:00Z");
        assert_ne!(
            dedupe_key("hub", "welcome", "mem", DedupePeriod::Day, monday),
            dedupe_key("hub", "welcome", "mem", DedupePeriod::Day, tuesday),
        );
    }

    #[test]
    fn week_bucket_spans_monday_to_sunday() {
        // 2024-03-04 is a Monday, 2024-03-10 the following Sunday.
        let monday = at("2024-03-04T00:00:00Z");
        let sunday = at("2024-03-10T23:00:00Z");
        let next_monday = at("2024-03-11T00:00:00Z");
        assert_eq!(
            DedupePeriod::Week.bucket(monday),
            DedupePeriod::Week.bucket(sunday)
        );
        assert_ne!(
            DedupePeriod::Week.bucket(monday),
            DedupePeriod::Week.bucket(next_monday)
        );
    }

    #[test]
    fn iso_week_year_applies_at_year_boundary() {
        // 2024-12-30 belongs to ISO week 1 of 2025.
        let bucket = DedupePeriod::Week.bucket(at("2024-12-30T00:00:00Z"));
        assert_eq!(bucket, "2025-W01");
    }

    #[test]
    fn distinct_members_never_collide() {
        let now = at("2024-03-04T12:00:00Z");
        assert_ne!(
            dedupe_key("hub", "welcome", "mem-a", DedupePeriod::Day, now),
            dedupe_key("hub", "welcome", "mem-b", DedupePeriod::Day, now),
        );
    }
}
