//! Helper functions shared by all reconcilers
//!
//! Condition bookkeeping, finalizer handling and the retry window check.
//! Everything here works on plain condition lists and `ObjectMeta` so the
//! same code serves brokers, instances and bindings.

use crate::clock::elapsed;
use catalog_crds::{Condition, ConditionStatus, ConditionType};
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::time::Duration;

/// Insert or update the condition of type `type_`.
///
/// `last_transition_time` is only moved when the status changes. Returns
/// whether anything about the condition changed.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status == status && existing.reason == reason && existing.message == message {
                return false;
            }
            if existing.status != status {
                existing.last_transition_time = now;
            }
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            true
        }
        None => {
            conditions.push(Condition {
                type_,
                status,
                last_transition_time: now,
                reason: reason.to_string(),
                message: message.to_string(),
            });
            true
        }
    }
}

pub fn get_condition(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: ConditionType) -> bool {
    get_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Drop the condition of type `type_`; returns whether one was present
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: ConditionType) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.type_ != type_);
    conditions.len() != before
}

pub fn is_deleting(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers.as_ref().is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Returns whether the finalizer was added
pub fn add_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    if has_finalizer(meta, finalizer) {
        return false;
    }
    meta.finalizers.get_or_insert_with(Vec::new).push(finalizer.to_string());
    true
}

/// Returns whether the finalizer was present
pub fn remove_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    match meta.finalizers.as_mut() {
        Some(finalizers) => {
            let before = finalizers.len();
            finalizers.retain(|f| f != finalizer);
            finalizers.len() != before
        }
        None => false,
    }
}

/// The retry window opened at `start` has closed.
///
/// An unset start means no retriable failure is being tracked.
pub fn retry_window_elapsed(start: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
    start.is_some_and(|start| elapsed(now, start) >= window)
}

pub fn generation(meta: &ObjectMeta) -> i64 {
    meta.generation.unwrap_or(0)
}
