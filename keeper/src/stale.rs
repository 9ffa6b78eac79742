//! Age-based flagging shared by the allocation monitor and the liquidation
//! backlog report

use chrono::{DateTime, Duration, Utc};

/// Item flagged as stale along with how long it has been waiting
#[derive(Debug, Clone, PartialEq)]
pub struct Stale<T> {
    pub item: T,
    pub age: Duration,
}

/// Keep the items whose reference time is at least `threshold` before
/// `now`, oldest first, at most `top`.
///
/// Returns the flagged items and the total number that qualified before
/// truncation.
pub fn flag_stale<T, F>(
    items: impl IntoIterator<Item = T>,
    since: F,
    threshold: Duration,
    now: DateTime<Utc>,
    top: usize,
) -> (Vec<Stale<T>>, usize)
where
    F: Fn(&T) -> DateTime<Utc>,
{
    let mut flagged: Vec<Stale<T>> = items
        .into_iter()
        .filter_map(|item| {
            let age = now - since(&item);
            (age >= threshold).then_some(Stale { item, age })
        })
        .collect();
    flagged.sort_by(|a, b| b.age.cmp(&a.age));
    let total = flagged.len();
    flagged.truncate(top);
    (flagged, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_flags_oldest_first_and_truncates() {
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let ages = [5i64, 45, 30, 90, 29];
        let items = ages.iter().map(|m| now - Duration::minutes(*m));

        let (flagged, total) = flag_stale(items, |at| *at, Duration::minutes(30), now, 2);
        assert_eq!(total, 3);
        let minutes: Vec<i64> = flagged.iter().map(|s| s.age.num_minutes()).collect();
        assert_eq!(minutes, vec![90, 45]);
    }

    #[test]
    fn test_future_timestamps_never_flag() {
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let (flagged, total) = flag_stale(
            [now + Duration::minutes(10)],
            |at| *at,
            Duration::zero(),
            now,
            20,
        );
        assert!(flagged.is_empty());
        assert_eq!(total, 0);
    }
}
