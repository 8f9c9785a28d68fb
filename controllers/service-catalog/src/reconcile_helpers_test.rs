//! Unit tests for reconcile_helpers module

#[cfg(test)]
mod tests {
    use crate::reconcile_helpers::*;
    use catalog_crds::{ConditionStatus, ConditionType};
    use chrono::{Duration as ChronoDuration, Utc};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::time::Duration;

    #[test]
    fn test_set_condition_inserts_new_type() {
        let now = Utc::now();
        let mut conditions = Vec::new();
        let changed = set_condition(&mut conditions, ConditionType::Ready, ConditionStatus::False, "Provisioning", "", now);
        assert!(changed, "New condition should report a change");
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, now);
    }

    #[test]
    fn test_set_condition_keeps_transition_time_when_status_unchanged() {
        let start = Utc::now();
        let later = start + ChronoDuration::seconds(30);
        let mut conditions = Vec::new();
        set_condition(&mut conditions, ConditionType::Ready, ConditionStatus::False, "A", "first", start);

        let changed = set_condition(&mut conditions, ConditionType::Ready, ConditionStatus::False, "B", "second", later);
        assert!(changed);
        assert_eq!(conditions[0].reason, "B");
        assert_eq!(conditions[0].last_transition_time, start, "Same status should keep the transition time");

        set_condition(&mut conditions, ConditionType::Ready, ConditionStatus::True, "B", "second", later);
        assert_eq!(conditions[0].last_transition_time, later, "Status flip should stamp a new transition time");
    }

    #[test]
    fn test_set_condition_identical_is_no_change() {
        let now = Utc::now();
        let mut conditions = Vec::new();
        set_condition(&mut conditions, ConditionType::Failed, ConditionStatus::True, "X", "msg", now);
        let changed = set_condition(
            &mut conditions,
            ConditionType::Failed,
            ConditionStatus::True,
            "X",
            "msg",
            now + ChronoDuration::seconds(5),
        );
        assert!(!changed, "Identical condition should not count as a change");
    }

    #[test]
    fn test_distinct_condition_types_coexist() {
        let now = Utc::now();
        let mut conditions = Vec::new();
        set_condition(&mut conditions, ConditionType::Ready, ConditionStatus::False, "R", "", now);
        set_condition(&mut conditions, ConditionType::Failed, ConditionStatus::True, "F", "", now);
        assert_eq!(conditions.len(), 2);
        assert!(is_condition_true(&conditions, ConditionType::Failed));
        assert!(!is_condition_true(&conditions, ConditionType::Ready));

        assert!(remove_condition(&mut conditions, ConditionType::Failed));
        assert!(!remove_condition(&mut conditions, ConditionType::Failed));
        assert!(get_condition(&conditions, ConditionType::Failed).is_none());
    }

    #[test]
    fn test_finalizer_add_remove() {
        let mut meta = ObjectMeta::default();
        assert!(add_finalizer(&mut meta, "a/b"));
        assert!(!add_finalizer(&mut meta, "a/b"), "Adding twice should be a no-op");
        assert!(has_finalizer(&meta, "a/b"));

        assert!(remove_finalizer(&mut meta, "a/b"));
        assert!(!remove_finalizer(&mut meta, "a/b"));
        assert!(!has_finalizer(&meta, "a/b"));
    }

    #[test]
    fn test_retry_window() {
        let start = Utc::now();
        let window = Duration::from_secs(7 * 24 * 3600); // 7 days

        assert!(!retry_window_elapsed(None, start, window), "No start means no window");
        assert!(!retry_window_elapsed(Some(start), start + ChronoDuration::days(6), window));
        assert!(retry_window_elapsed(Some(start), start + ChronoDuration::days(7), window));
    }
}
