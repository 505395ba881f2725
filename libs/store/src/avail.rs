//! Rolling availability bookkeeping.
//!
//! Every accepted poll result adds its inter-poll interval to a per-server,
//! per-UTC-day `up` or `down` bucket. The 3-day window weights the oldest
//! day by the fraction of today that has not yet passed, which smooths the
//! discontinuity at UTC midnight.

use crate::{Result, Store, keys};

const DAY: i64 = 86400;
const PRUNE_AFTER_DAYS: i64 = 37;
const WINDOW_DAYS: i64 = 30;

pub(crate) async fn update(
    store: &dyn Store,
    id: &str,
    tdif: i64,
    up: bool,
    now: i64,
) -> Result<(Option<f64>, Option<f64>)> {
    let today = day_epoch(now);
    let state = if up { "up" } else { "down" };

    store
        .hash_incr_by(keys::AVAIL, &format!("{id}.{today}.{state}"), tdif)
        .await?;

    prune(store, id, today).await?;

    compute(store, id, now).await
}

/// Recompute `(avail_3, avail_30)` from the stored buckets.
pub(crate) async fn compute(
    store: &dyn Store,
    id: &str,
    now: i64,
) -> Result<(Option<f64>, Option<f64>)> {
    let today = day_epoch(now);

    let mut fields = Vec::with_capacity(WINDOW_DAYS as usize * 2);
    for offset in 0..WINDOW_DAYS {
        let day = today - offset * DAY;
        fields.push(format!("{id}.{day}.up"));
        fields.push(format!("{id}.{day}.down"));
    }

    let values = store.hash_get_many(keys::AVAIL, &fields).await?;
    let seconds = |i: usize| -> f64 {
        values
            .get(i)
            .and_then(|v| v.as_deref())
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0)
    };

    // Fraction of today that is still ahead of us; weights the oldest day
    // of the 3-day window.
    let day3_weight = 1.0 - (now - today) as f64 / DAY as f64;

    let mut up_3 = 0.0;
    let mut down_3 = 0.0;
    let mut up_30 = 0.0;
    let mut down_30 = 0.0;

    for offset in 0..WINDOW_DAYS as usize {
        let up = seconds(offset * 2);
        let down = seconds(offset * 2 + 1);

        up_30 += up;
        down_30 += down;

        match offset {
            0..=2 => {
                up_3 += up;
                down_3 += down;
            }
            3 => {
                up_3 += up * day3_weight;
                down_3 += down * day3_weight;
            }
            _ => {}
        }
    }

    Ok((percentage(up_3, down_3), percentage(up_30, down_30)))
}

async fn prune(store: &dyn Store, id: &str, today: i64) -> Result<()> {
    let cutoff = today - PRUNE_AFTER_DAYS * DAY;
    let prefix = format!("{id}.");

    for field in store.hash_keys(keys::AVAIL).await? {
        let Some(rest) = field.strip_prefix(&prefix) else {
            continue;
        };
        let Some(day) = rest.split('.').next().and_then(|d| d.parse::<i64>().ok()) else {
            continue;
        };

        if day < cutoff {
            store.hash_del(keys::AVAIL, &field).await?;
        }
    }

    Ok(())
}

fn percentage(up: f64, down: f64) -> Option<f64> {
    let total = up + down;
    if total <= 0.0 {
        return None;
    }

    Some(up / total * 100.0)
}

fn day_epoch(now: i64) -> i64 {
    now - now.rem_euclid(DAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemStore;

    const NOON: i64 = 20_000 * DAY + DAY / 2;

    #[tokio::test]
    async fn all_up_is_100_percent() {
        let store = MemStore::new();

        let (a3, a30) = update(&store, "T2TEST", 300, true, NOON).await.unwrap();

        assert_eq!(a3, Some(100.0));
        assert_eq!(a30, Some(100.0));
    }

    #[tokio::test]
    async fn no_data_yields_none() {
        let store = MemStore::new();

        let (a3, a30) = compute(&store, "T2TEST", NOON).await.unwrap();

        assert_eq!(a3, None);
        assert_eq!(a30, None);
    }

    #[tokio::test]
    async fn downtime_lowers_the_ratio() {
        let store = MemStore::new();

        update(&store, "T2TEST", 900, true, NOON).await.unwrap();
        let (a3, a30) = update(&store, "T2TEST", 100, false, NOON).await.unwrap();

        assert_eq!(a3, Some(90.0));
        assert_eq!(a30, Some(90.0));
    }

    #[tokio::test]
    async fn old_downtime_ages_out_of_the_3_day_window() {
        let store = MemStore::new();

        // Downtime four days ago is outside the 3-day window but inside
        // the 30-day one.
        let four_days_ago = NOON - 4 * DAY;
        update(&store, "T2TEST", 600, false, four_days_ago)
            .await
            .unwrap();

        let (a3, a30) = update(&store, "T2TEST", 600, true, NOON).await.unwrap();

        assert_eq!(a3, Some(100.0));
        assert_eq!(a30, Some(50.0));
    }

    #[tokio::test]
    async fn day3_bucket_is_weighted_by_time_of_day() {
        let store = MemStore::new();

        let three_days_ago = NOON - 3 * DAY;
        update(&store, "T2TEST", 1000, false, three_days_ago)
            .await
            .unwrap();
        let (a3, _) = update(&store, "T2TEST", 1000, true, NOON).await.unwrap();

        // At noon, half of the day-3 bucket still counts: 1000 up versus
        // 500 weighted down.
        let a3 = a3.unwrap();
        assert!((a3 - 1000.0 / 1500.0 * 100.0).abs() < 1e-9, "{a3}");
    }

    #[tokio::test]
    async fn buckets_older_than_37_days_are_pruned() {
        let store = MemStore::new();

        update(&store, "T2TEST", 100, true, NOON - 40 * DAY)
            .await
            .unwrap();
        update(&store, "T2TEST", 100, true, NOON).await.unwrap();

        let fields = store.hash_keys(keys::AVAIL).await.unwrap();
        assert_eq!(fields.len(), 1);
        assert!(fields[0].starts_with("T2TEST."));
        assert!(fields[0].ends_with(".up"));
        assert!(fields[0].contains(&day_epoch(NOON).to_string()));
    }

    #[tokio::test]
    async fn other_servers_buckets_are_left_alone() {
        let store = MemStore::new();

        update(&store, "T2OTHER", 100, true, NOON - 40 * DAY)
            .await
            .unwrap();
        update(&store, "T2TEST", 100, true, NOON).await.unwrap();

        let fields = store.hash_keys(keys::AVAIL).await.unwrap();
        assert_eq!(fields.len(), 2);
    }
}
