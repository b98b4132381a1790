//! crates/concierge_core/src/quota.rs
//!
//! Monthly message quotas: the per-tier usage computation consumed by
//! gating logic, and the platform-wide calendar sweep that zeroes every
//! property's counter on the first of the month.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde_json::json;
use tracing::info;

use crate::domain::{paths, Property, QuotaUsage, SubscriptionTier};
use crate::store::{DocumentStore, FieldUpdate, StoreResult};

/// Computes the quota snapshot for one property under the owner's tier.
///
/// Unbounded tiers report a percentage of 0; the UI renders them as
/// "unlimited" rather than as a meter.
pub fn usage(tier: SubscriptionTier, property: &Property) -> QuotaUsage {
    let used = property.message_count.max(0) as u64;
    match tier.monthly_quota() {
        Some(quota) => QuotaUsage {
            used,
            quota: Some(quota),
            percentage: ((used as f32 / quota as f32) * 100.0).min(100.0),
            reset_date: property.message_quota_reset_date,
        },
        None => QuotaUsage {
            used,
            quota: None,
            percentage: 0.0,
            reset_date: property.message_quota_reset_date,
        },
    }
}

/// Midnight UTC on the first day of the month after `now`.
pub fn first_of_next_month(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .expect("the first of a month at midnight UTC is always representable")
}

/// The platform-wide monthly sweep: zeroes every property's `messageCount`
/// and stamps the next reset boundary, as one atomic batch. Properties
/// created mid-cycle reset on the same boundary as everyone else; there is
/// no pro-rating.
///
/// Returns the number of properties that were reset.
pub async fn reset_monthly_counts(
    store: &dyn DocumentStore,
    now: DateTime<Utc>,
) -> StoreResult<usize> {
    let next_reset = first_of_next_month(now);
    let properties = store.list(paths::PROPERTIES).await?;

    let writes: Vec<_> = properties
        .into_iter()
        .map(|(path, _)| {
            (
                path,
                vec![
                    FieldUpdate::set("messageCount", json!(0)),
                    FieldUpdate::set("messageQuotaResetDate", json!(next_reset)),
                ],
            )
        })
        .collect();

    let reset = writes.len();
    store.apply_batch(writes).await?;
    info!(properties = reset, %next_reset, "monthly message quota sweep complete");
    Ok(reset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn property_with_count(count: i64) -> Property {
        Property {
            owner_id: Some("o1".to_string()),
            name: "Villa".to_string(),
            address: String::new(),
            description: String::new(),
            amenities: Vec::new(),
            rules: String::new(),
            status: Default::default(),
            message_count: count,
            message_quota_reset_date: None,
            review_count: 0,
            rating_sum: 0.0,
            average_rating: 0.0,
        }
    }

    #[test]
    fn free_tier_percentage_tracks_usage() {
        let snapshot = usage(SubscriptionTier::Free, &property_with_count(25));
        assert_eq!(snapshot.used, 25);
        assert_eq!(snapshot.quota, Some(50));
        assert!((snapshot.percentage - 50.0).abs() < f32::EPSILON);
    }

    #[test]
    fn percentage_is_clamped_at_one_hundred() {
        let snapshot = usage(SubscriptionTier::Free, &property_with_count(80));
        assert!((snapshot.percentage - 100.0).abs() < f32::EPSILON);
    }

    #[test]
    fn premium_tier_is_unbounded() {
        let snapshot = usage(SubscriptionTier::Premium, &property_with_count(100_000));
        assert_eq!(snapshot.quota, None);
        assert_eq!(snapshot.percentage, 0.0);
    }

    #[test]
    fn next_month_boundary_rolls_over_december() {
        let mid_june = Utc.with_ymd_and_hms(2024, 6, 14, 9, 30, 0).single().unwrap();
        assert_eq!(
            first_of_next_month(mid_june),
            Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).single().unwrap()
        );

        let new_years_eve = Utc
            .with_ymd_and_hms(2024, 12, 31, 23, 59, 59)
            .single()
            .unwrap();
        assert_eq!(
            first_of_next_month(new_years_eve),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap()
        );
    }

    #[tokio::test]
    async fn sweep_resets_every_property_and_stamps_boundary() {
        let store = MemoryStore::new();
        for (id, count) in [("p1", 12), ("p2", 0), ("p3", 50)] {
            store
                .apply(
                    &paths::property(id),
                    vec![
                        FieldUpdate::set("ownerId", json!("o1")),
                        FieldUpdate::set("name", json!(id)),
                        FieldUpdate::set("messageCount", json!(count)),
                    ],
                )
                .await
                .unwrap();
        }

        let run_time = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 5).single().unwrap();
        let reset = reset_monthly_counts(&store, run_time).await.unwrap();
        assert_eq!(reset, 3);

        let expected_boundary = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).single().unwrap();
        for id in ["p1", "p2", "p3"] {
            let doc = store.get(&paths::property(id)).await.unwrap().unwrap();
            assert_eq!(doc.get("messageCount"), Some(&json!(0)));
            let stamped: DateTime<Utc> =
                serde_json::from_value(doc.get("messageQuotaResetDate").cloned().unwrap())
                    .unwrap();
            assert_eq!(stamped, expected_boundary);
        }
    }

    #[tokio::test]
    async fn sweep_on_empty_store_is_a_no_op() {
        let store = MemoryStore::new();
        assert_eq!(
            reset_monthly_counts(&store, Utc::now()).await.unwrap(),
            0
        );
    }

    #[test]
    fn usage_reads_reset_date_from_property() {
        let mut property = property_with_count(1);
        let boundary = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).single().unwrap();
        property.message_quota_reset_date = Some(boundary);
        let snapshot = usage(SubscriptionTier::Pro, &property);
        assert_eq!(snapshot.reset_date, Some(boundary));
        assert_eq!(snapshot.quota, Some(500));
    }
}
