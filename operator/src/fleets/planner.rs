use roundtable_types::FleetAgentSummary;

/// Health rollup for a set of discovered Agents: ready count and the
/// per-agent summary list (`spec.md` §4.4 step 2-3).
pub fn summarize(agents: &[FleetAgentSummary]) -> (u32, u32) {
    let total = agents.len() as u32;
    let ready = agents.iter().filter(|a| a.ready).count() as u32;
    (ready, total)
}

/// Sums decimal-string agent costs, tolerating unparsable entries.
pub fn sum_costs<'a>(costs: impl IntoIterator<Item = &'a str>) -> f64 {
    costs.into_iter().filter_map(|c| c.parse::<f64>().ok()).sum()
}

pub fn format_cost(total: f64) -> String {
    format!("{total:.2}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(name: &str, ready: bool) -> FleetAgentSummary {
        FleetAgentSummary {
            name: name.to_string(),
            phase: if ready { "Ready".to_string() } else { "Provisioning".to_string() },
            ready,
        }
    }

    #[test]
    fn summarize_counts_ready_and_total() {
        let agents = vec![summary("a", true), summary("b", false), summary("c", true)];
        assert_eq!(summarize(&agents), (2, 3));
    }

    #[test]
    fn summarize_empty_is_zero_zero() {
        assert_eq!(summarize(&[]), (0, 0));
    }

    #[test]
    fn sum_costs_ignores_garbage() {
        assert_eq!(sum_costs(["1.00", "bogus", "2.25"]), 3.25);
    }
}
