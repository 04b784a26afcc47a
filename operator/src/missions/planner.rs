use chrono::{DateTime, Utc};
use roundtable_types::{AgentReadiness, MissionPipelineRef, MissionStage};

/// `startedAt + TTL`, computed once at status init (`spec.md` §4.3 "TTL").
pub fn compute_expiry(started_at: DateTime<Utc>, ttl_seconds: u64) -> DateTime<Utc> {
    started_at + chrono::Duration::seconds(ttl_seconds as i64)
}

pub fn is_expired(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now >= expires_at
}

/// Shared by the Active-phase overall timeout check.
pub fn timed_out(started_at: DateTime<Utc>, now: DateTime<Utc>, timeout_seconds: u64) -> bool {
    (now - started_at).num_seconds() > timeout_seconds as i64
}

/// The Assembling->Briefing gate: every *non-ephemeral* participant ready,
/// and at least one exists (`spec.md` §4.3: "all referenced agents Ready,
/// >=1 non-ephemeral"). Ephemeral participants never enter `readiness`.
pub fn non_ephemeral_agents_ready(readiness: &[AgentReadiness]) -> bool {
    !readiness.is_empty() && readiness.iter().all(|a| a.ready)
}

/// Filters a Mission's pipeline references down to one stage.
pub fn pipelines_in_stage(
    pipelines: &[MissionPipelineRef],
    stage: MissionStage,
) -> impl Iterator<Item = &MissionPipelineRef> {
    pipelines.iter().filter(move |p| p.stage == stage)
}

/// Sums decimal-string costs, tolerating unparsable entries as zero.
pub fn sum_costs<'a>(costs: impl IntoIterator<Item = &'a str>) -> f64 {
    costs.into_iter().filter_map(|c| c.parse::<f64>().ok()).sum()
}

pub fn format_cost(total: f64) -> String {
    format!("{total:.2}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ready(name: &str, ready: bool) -> AgentReadiness {
        AgentReadiness {
            name: name.to_string(),
            ready,
            tasks: 0,
        }
    }

    #[test]
    fn expiry_is_started_plus_ttl() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let expiry = compute_expiry(start, 60);
        assert_eq!(expiry, start + chrono::Duration::seconds(60));
    }

    #[test]
    fn expired_once_now_reaches_expiry() {
        let expiry = Utc::now() - chrono::Duration::seconds(1);
        assert!(is_expired(expiry, Utc::now()));
    }

    #[test]
    fn not_expired_before_expiry() {
        let expiry = Utc::now() + chrono::Duration::seconds(60);
        assert!(!is_expired(expiry, Utc::now()));
    }

    #[test]
    fn gate_requires_non_empty_and_all_ready() {
        assert!(!non_ephemeral_agents_ready(&[]));
        assert!(!non_ephemeral_agents_ready(&[ready("a", true), ready("b", false)]));
        assert!(non_ephemeral_agents_ready(&[ready("a", true), ready("b", true)]));
    }

    #[test]
    fn pipelines_in_stage_filters_correctly() {
        let pipelines = vec![
            MissionPipelineRef {
                name: "setup".to_string(),
                stage: MissionStage::Setup,
                input: None,
            },
            MissionPipelineRef {
                name: "deploy".to_string(),
                stage: MissionStage::Active,
                input: None,
            },
            MissionPipelineRef {
                name: "teardown".to_string(),
                stage: MissionStage::Teardown,
                input: None,
            },
        ];
        let active: Vec<&str> = pipelines_in_stage(&pipelines, MissionStage::Active)
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(active, vec!["deploy"]);
    }

    #[test]
    fn sum_costs_ignores_garbage() {
        assert_eq!(sum_costs(["1.50", "2.50", "garbage"]), 4.0);
    }

    #[test]
    fn timeout_compares_against_wall_clock() {
        let start = Utc::now() - chrono::Duration::seconds(100);
        assert!(timed_out(start, Utc::now(), 60));
        assert!(!timed_out(start, Utc::now(), 600));
    }
}
