//! Trigger rule evaluation
//!
//! Rules are stateless predicates evaluated per event. Safety alerts never
//! match any rule.

use kiosk_common::events::TriggerEvent;
use kiosk_common::models::{TriggerKind, TriggerRule};

/// Does `rule` match `event`?
///
/// - age bounds are inclusive; an event without an age fails a bounded rule
/// - gender `None` or `"any"` (case-insensitive) matches every gender
/// - a loyalty rule without `member_id` matches any event carrying a member;
///   with `member_id` it matches only that member
pub fn rule_matches(rule: &TriggerRule, event: &TriggerEvent) -> bool {
    match (rule.kind, event) {
        (TriggerKind::Demographic, TriggerEvent::Demographic { age, gender, .. }) => {
            age_matches(rule, *age) && gender_matches(rule.gender.as_deref(), gender.as_deref())
        }
        (TriggerKind::Loyalty, TriggerEvent::Loyalty { member_id, .. }) => {
            match (rule.member_id.as_deref(), member_id.as_deref()) {
                (_, None) => false,
                (None, Some(_)) => true,
                (Some(wanted), Some(seen)) => wanted == seen,
            }
        }
        _ => false,
    }
}

fn age_matches(rule: &TriggerRule, age: Option<u32>) -> bool {
    if rule.age_min.is_none() && rule.age_max.is_none() {
        return true;
    }
    let Some(age) = age else {
        return false;
    };
    rule.age_min.map_or(true, |min| age >= min) && rule.age_max.map_or(true, |max| age <= max)
}

fn gender_matches(wanted: Option<&str>, seen: Option<&str>) -> bool {
    match wanted {
        None => true,
        Some(w) if w.eq_ignore_ascii_case("any") => true,
        Some(w) => seen.map_or(false, |s| s.eq_ignore_ascii_case(w)),
    }
}
