//! Selection strategies over a tier's available candidates.
//!
//! Candidates arriving here are already filtered for context fit,
//! availability, and attempt history; strategies only order them.

use crate::config::Strategy;

/// A selectable model with its live capacity figures.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub model: String,
    /// Position in the tier's ordered list.
    pub list_index: usize,
    pub in_flight: usize,
    pub effective_max: usize,
    pub effective_cost: f64,
    /// Sliding 429 penalty factor in (0, 1].
    pub penalty_factor: f64,
}

impl Candidate {
    pub fn available_slots(&self) -> usize {
        self.effective_max.saturating_sub(self.in_flight)
    }
}

/// Pick the winning candidate index (into `candidates`) for a strategy.
pub fn pick(strategy: Strategy, candidates: &[Candidate]) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    match strategy {
        // Strictly ordered lists: first viable candidate wins.
        Strategy::Quality | Strategy::Failover => candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.list_index)
            .map(|(i, _)| i),
        Strategy::Throughput => best_by(candidates, |c| {
            (c.available_slots() as f64, -c.effective_cost)
        }),
        Strategy::Pool => best_by(candidates, |c| {
            let score =
                c.available_slots() as f64 * c.penalty_factor * (1.0 / c.effective_cost.max(1e-6));
            (score, -c.effective_cost)
        }),
        Strategy::Balanced => best_by(candidates, |c| {
            let quality = 1.0 / (c.list_index + 1) as f64;
            let availability = if c.effective_max == 0 {
                0.0
            } else {
                c.available_slots() as f64 / c.effective_max as f64
            };
            (quality * availability, -c.effective_cost)
        }),
    }
}

/// Max by a `(score, tiebreak)` pair; ties broken by the second component
/// (negated cost, so cheaper wins).
fn best_by<F>(candidates: &[Candidate], score: F) -> Option<usize>
where
    F: Fn(&Candidate) -> (f64, f64),
{
    let mut best: Option<(usize, (f64, f64))> = None;
    for (i, c) in candidates.iter().enumerate() {
        let s = score(c);
        let better = match &best {
            None => true,
            Some((_, cur)) => s.0 > cur.0 || (s.0 == cur.0 && s.1 > cur.1),
        };
        if better {
            best = Some((i, s));
        }
    }
    best.map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(
        model: &str,
        list_index: usize,
        in_flight: usize,
        max: usize,
        cost: f64,
        penalty: f64,
    ) -> Candidate {
        Candidate {
            model: model.into(),
            list_index,
            in_flight,
            effective_max: max,
            effective_cost: cost,
            penalty_factor: penalty,
        }
    }

    #[test]
    fn quality_takes_list_order() {
        let cands = vec![
            candidate("second", 1, 0, 10, 1.0, 1.0),
            candidate("first", 0, 9, 10, 9.0, 0.5),
        ];
        let picked = pick(Strategy::Quality, &cands).unwrap();
        assert_eq!(cands[picked].model, "first");
    }

    #[test]
    fn throughput_takes_most_slots() {
        let cands = vec![
            candidate("narrow", 0, 8, 10, 0.1, 1.0),
            candidate("wide", 1, 5, 50, 5.0, 1.0),
        ];
        let picked = pick(Strategy::Throughput, &cands).unwrap();
        assert_eq!(cands[picked].model, "wide");
    }

    #[test]
    fn throughput_ties_break_on_cost() {
        let cands = vec![
            candidate("pricey", 0, 0, 10, 5.0, 1.0),
            candidate("cheap", 1, 0, 10, 0.5, 1.0),
        ];
        let picked = pick(Strategy::Throughput, &cands).unwrap();
        assert_eq!(cands[picked].model, "cheap");
    }

    #[test]
    fn pool_prefers_unpenalized_capacity() {
        // Same slots and cost; the 429-penalized model loses.
        let cands = vec![
            candidate("penalized", 0, 0, 10, 1.0, 0.25),
            candidate("clean", 1, 0, 10, 1.0, 1.0),
        ];
        let picked = pick(Strategy::Pool, &cands).unwrap();
        assert_eq!(cands[picked].model, "clean");
    }

    #[test]
    fn pool_weighs_cost_into_score() {
        let cands = vec![
            candidate("expensive", 0, 0, 10, 4.2, 1.0),
            candidate("cheap", 1, 0, 10, 0.4, 1.0),
        ];
        let picked = pick(Strategy::Pool, &cands).unwrap();
        assert_eq!(cands[picked].model, "cheap");
    }

    #[test]
    fn balanced_degrades_first_choice_under_load() {
        // First model nearly saturated, second idle: balanced flips over.
        let cands = vec![
            candidate("first", 0, 9, 10, 1.0, 1.0),
            candidate("second", 1, 0, 10, 1.0, 1.0),
        ];
        let picked = pick(Strategy::Balanced, &cands).unwrap();
        assert_eq!(cands[picked].model, "second");

        // With both idle, list order wins.
        let cands = vec![
            candidate("first", 0, 0, 10, 1.0, 1.0),
            candidate("second", 1, 0, 10, 1.0, 1.0),
        ];
        let picked = pick(Strategy::Balanced, &cands).unwrap();
        assert_eq!(cands[picked].model, "first");
    }

    #[test]
    fn empty_candidates_yield_none() {
        assert_eq!(pick(Strategy::Pool, &[]), None);
    }
}
