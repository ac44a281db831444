use indexmap::IndexMap;
use serde::Serialize;

use crate::types::survey_data::{Condition, InstrumentTree, ScaleResponses, SimulationResults};

/// Completeness and value summary for one (model, condition) pair.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RunStats {
    pub model: String,
    pub condition: Condition,
    pub expected: usize,
    pub valid: usize,
    pub missing: usize,
    pub completeness: f64,
    pub min: Option<u8>,
    pub max: Option<u8>,
    pub mean: Option<f64>,
}

#[derive(Default)]
struct Accumulator {
    expected: usize,
    valid: usize,
    sum: u64,
    min: Option<u8>,
    max: Option<u8>,
}

impl Accumulator {
    fn add(&mut self, value: Option<u8>) {
        self.expected += 1;
        if let Some(v) = value {
            self.valid += 1;
            self.sum += u64::from(v);
            self.min = Some(self.min.map_or(v, |m| m.min(v)));
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
    }

    fn finish(self, model: String, condition: Condition) -> RunStats {
        let completeness = if self.expected == 0 {
            0.0
        } else {
            self.valid as f64 / self.expected as f64
        };
        RunStats {
            model,
            condition,
            expected: self.expected,
            valid: self.valid,
            missing: self.expected - self.valid,
            completeness,
            min: self.min,
            max: self.max,
            mean: (self.valid > 0).then(|| self.sum as f64 / self.valid as f64),
        }
    }
}

fn lookup(responses: &ScaleResponses, scale: &str, subscale: &str, question_id: &str) -> Option<u8> {
    responses.get(scale)?.get(subscale)?.get(question_id).copied().flatten()
}

/// Aggregates every stored condition of every entry against the full tree.
///
/// Each question of the tree is one expected slot; a slot that is absent
/// (failed triple) or `null` (unparseable answer) counts as missing.
/// Output is sorted by model, then condition.
pub fn compute_run_stats(results: &SimulationResults, tree: &InstrumentTree) -> Vec<RunStats> {
    let mut groups: IndexMap<(String, Condition), Accumulator> = IndexMap::new();

    for entry in results.entries.values() {
        for (condition, responses) in &entry.responses {
            let acc = groups.entry((entry.model.clone(), *condition)).or_default();
            for (scale_name, scale) in &tree.scales {
                for (sub_name, sub) in &scale.subscales {
                    for question_id in sub.questions.keys() {
                        acc.add(lookup(responses, scale_name, sub_name, question_id));
                    }
                }
            }
        }
    }

    groups.sort_keys();
    groups
        .into_iter()
        .map(|((model, condition), acc)| acc.finish(model, condition))
        .collect()
}
