use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// CPU/memory resource requests+limits for a managed workload container.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ResourceSpec {
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

/// Sets (or replaces) a condition of the given `type_`, keeping the list
/// keyed by type as required by `spec.md` §3. `observed_generation` is
/// stamped from the resource's `metadata.generation` at the time the
/// controller observed it.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: bool,
    reason: &str,
    message: String,
    observed_generation: i64,
) {
    let now = Time(chrono::Utc::now());
    let status_str = if status { "True" } else { "False" }.to_string();
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status_str {
            existing.last_transition_time = now;
        }
        existing.status = status_str;
        existing.reason = reason.to_string();
        existing.message = message;
        existing.observed_generation = Some(observed_generation);
        return;
    }
    conditions.push(Condition {
        type_: type_.to_string(),
        status: status_str,
        reason: reason.to_string(),
        message,
        observed_generation: Some(observed_generation),
        last_transition_time: now,
    });
}

/// Looks up a condition by type, returning `true` iff it is present with
/// `status: "True"`.
pub fn condition_is_true(conditions: &[Condition], type_: &str) -> bool {
    conditions
        .iter()
        .find(|c| c.type_ == type_)
        .is_some_and(|c| c.status == "True")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sets_new_condition() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Ready", true, "AllGood", "ok".into(), 3);
        assert_eq!(conditions.len(), 1);
        assert!(condition_is_true(&conditions, "Ready"));
        assert_eq!(conditions[0].observed_generation, Some(3));
    }

    #[test]
    fn updates_existing_condition_in_place() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Ready", true, "A", "a".into(), 1);
        let first_transition = conditions[0].last_transition_time.clone();
        set_condition(&mut conditions, "Ready", true, "B", "b".into(), 2);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].reason, "B");
        // Status didn't flip, so the transition time must not change.
        assert_eq!(conditions[0].last_transition_time, first_transition);
    }

    #[test]
    fn transition_time_updates_on_status_flip() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "Ready", true, "A", "a".into(), 1);
        set_condition(&mut conditions, "Ready", false, "B", "b".into(), 2);
        assert!(!condition_is_true(&conditions, "Ready"));
    }
}
