use std::time::Duration;

use crate::error::ArchiveError;
use crate::index::IndexQuery;
use crate::model::{CountAndLastUpdated, MembershipQuery, SetDocument};

/// Counts the set's members in the live index and rejects the set when the
/// count differs from its declared size.
pub async fn check(
    index: &dyn IndexQuery,
    set: &SetDocument,
    timeout: Duration,
) -> Result<CountAndLastUpdated, ArchiveError> {
    let query = MembershipQuery::SetTermsLookup { set_id: set.set_id };
    let aggregation = tokio::time::timeout(timeout, index.count_and_last_updated(&query))
        .await
        .map_err(|_| ArchiveError::Timeout {
            operation: "set aggregation",
            seconds: timeout.as_secs(),
        })?
        .map_err(ArchiveError::Index)?;

    if aggregation.count != set.size {
        tracing::warn!(
            set_id = %set.set_id,
            expected = set.size,
            actual = aggregation.count,
            "set is inconsistent with the index"
        );
        return Err(ArchiveError::InconsistentSet {
            expected: set.size,
            actual: aggregation.count,
        });
    }
    Ok(aggregation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeIndex;
    use serde_json::json;
    use uuid::Uuid;

    fn set(size: i64) -> SetDocument {
        SetDocument {
            set_id: Uuid::new_v4(),
            sqon: json!({}),
            size,
        }
    }

    #[tokio::test]
    async fn matching_count_passes_aggregation_through() {
        let index = FakeIndex::with_objects(&["a", "b", "c"], "t1");
        let result = check(&index, &set(3), Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.count, 3);
        assert_eq!(result.last_updated, "t1");
    }

    #[tokio::test]
    async fn count_mismatch_is_rejected() {
        let index = FakeIndex::with_objects(&["a", "b", "c", "d", "e", "f", "g"], "t1");
        let err = check(&index, &set(10), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::InconsistentSet {
                expected: 10,
                actual: 7
            }
        ));
    }

    #[tokio::test]
    async fn slow_aggregation_times_out() {
        let index = FakeIndex::with_objects(&["a"], "t1").with_delay(Duration::from_millis(200));
        let err = check(&index, &set(1), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Timeout { .. }));
    }
}
