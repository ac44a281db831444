use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;

use crate::types::survey_data::{Condition, InstrumentTree, Scale};

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct QuestionView<'a> {
    pub id: &'a str,
    pub text: &'a str,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SubscaleView<'a> {
    pub name: &'a str,
    pub response_scale: Option<&'a str>,
    pub questions: Vec<QuestionView<'a>>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ScaleView<'a> {
    pub name: &'a str,
    pub scale_id: u32,
    pub response_scale: Option<&'a str>,
    pub subscales: Vec<SubscaleView<'a>>,
}

/// An ordered, borrowed view over (part of) an instrument tree.
///
/// Only the ordering is owned; names and question text point into the tree.
#[derive(Serialize, Debug, Clone, PartialEq, Default)]
pub struct InstrumentView<'a> {
    pub scales: Vec<ScaleView<'a>>,
}

/// Location of one answer in the results mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot<'a> {
    pub scale: &'a str,
    pub subscale: &'a str,
    pub question_id: &'a str,
}

fn scale_view<'a>(name: &'a str, scale: &'a Scale) -> ScaleView<'a> {
    ScaleView {
        name,
        scale_id: scale.scale_id,
        response_scale: scale.response_scale.as_deref(),
        subscales: scale
            .subscales
            .iter()
            .map(|(sub_name, sub)| SubscaleView {
                name: sub_name.as_str(),
                response_scale: sub.response_scale.as_deref(),
                questions: sub
                    .questions
                    .iter()
                    .map(|(id, text)| QuestionView {
                        id: id.as_str(),
                        text: text.as_str(),
                    })
                    .collect(),
            })
            .collect(),
    }
}

impl<'a> InstrumentView<'a> {
    /// Every scale of the tree in source order.
    pub fn full(tree: &'a InstrumentTree) -> Self {
        Self {
            scales: tree
                .scales
                .iter()
                .map(|(name, scale)| scale_view(name.as_str(), scale))
                .collect(),
        }
    }

    pub fn scale_names(&self) -> Vec<&'a str> {
        self.scales.iter().map(|s| s.name).collect()
    }

    pub fn question_count(&self) -> usize {
        self.slots().len()
    }

    /// Answer slots in presentation order.
    pub fn slots(&self) -> Vec<Slot<'a>> {
        let mut slots = Vec::new();
        for scale in &self.scales {
            for sub in &scale.subscales {
                for q in &sub.questions {
                    slots.push(Slot {
                        scale: scale.name,
                        subscale: sub.name,
                        question_id: q.id,
                    });
                }
            }
        }
        slots
    }

    /// Splits the view into the units presented to the model in one call each.
    pub fn prompt_units(&self, condition: Condition) -> Vec<InstrumentView<'a>> {
        match condition {
            Condition::FullContext => vec![self.clone()],
            Condition::PerScale => self
                .scales
                .iter()
                .map(|scale| InstrumentView {
                    scales: vec![scale.clone()],
                })
                .collect(),
            Condition::PerQuestion => {
                let mut units = Vec::new();
                for scale in &self.scales {
                    for sub in &scale.subscales {
                        for q in &sub.questions {
                            units.push(InstrumentView {
                                scales: vec![ScaleView {
                                    subscales: vec![SubscaleView {
                                        questions: vec![q.clone()],
                                        ..sub.clone()
                                    }],
                                    ..scale.clone()
                                }],
                            });
                        }
                    }
                }
                units
            }
        }
    }
}

/// Shuffle seed for one persona: a pure function of the run seed and persona id.
pub fn persona_seed(run_seed: u64, persona_id: u64) -> u64 {
    run_seed ^ persona_id.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Orders the instrument tree for `condition` without touching the tree.
///
/// `full_context` shuffles scale order with a generator seeded from `seed`;
/// the other conditions keep source order.
pub fn build_condition_view(tree: &InstrumentTree, condition: Condition, seed: u64) -> InstrumentView<'_> {
    let mut view = InstrumentView::full(tree);
    if condition == Condition::FullContext {
        let mut rng = StdRng::seed_from_u64(seed);
        view.scales.shuffle(&mut rng);
    }
    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::survey_data::Subscale;
    use indexmap::IndexMap;

    fn tree(scale_count: usize) -> InstrumentTree {
        let mut tree = InstrumentTree::default();
        for i in 0..scale_count {
            let mut questions = IndexMap::new();
            questions.insert(format!("{}", i * 2 + 1), format!("question {}a", i));
            questions.insert(format!("{}", i * 2 + 2), format!("question {}b", i));
            let mut subscales = IndexMap::new();
            subscales.insert("main".to_string(), Subscale { response_scale: None, questions });
            tree.scales.insert(
                format!("Scale{}", i),
                Scale {
                    scale_id: i as u32 + 1,
                    response_scale: Some("1-7".into()),
                    subscales,
                },
            );
        }
        tree
    }

    #[test]
    fn fixed_conditions_preserve_source_order_and_content() {
        let t = tree(6);
        for condition in [Condition::PerQuestion, Condition::PerScale] {
            let view = build_condition_view(&t, condition, 1234);
            assert_eq!(view, InstrumentView::full(&t));
            let names: Vec<_> = t.scales.keys().map(String::as_str).collect();
            assert_eq!(view.scale_names(), names);
        }
    }

    #[test]
    fn full_context_permutes_the_same_set_reproducibly() {
        let t = tree(8);
        let a = build_condition_view(&t, Condition::FullContext, 42);
        let b = build_condition_view(&t, Condition::FullContext, 42);
        assert_eq!(a.scale_names(), b.scale_names());

        let mut sorted = a.scale_names();
        sorted.sort();
        let mut expected: Vec<_> = t.scales.keys().map(String::as_str).collect();
        expected.sort();
        assert_eq!(sorted, expected);

        // with 8! orderings, some seed among a handful must differ from source order
        let source: Vec<_> = t.scales.keys().map(String::as_str).collect();
        assert!((0..5).any(|s| build_condition_view(&t, Condition::FullContext, s).scale_names() != source));
    }

    #[test]
    fn input_tree_is_untouched() {
        let t = tree(4);
        let before = t.clone();
        let _ = build_condition_view(&t, Condition::FullContext, 7);
        assert_eq!(t, before);
    }

    #[test]
    fn prompt_units_follow_the_condition() {
        let t = tree(3);
        let view = InstrumentView::full(&t);
        assert_eq!(view.prompt_units(Condition::FullContext).len(), 1);
        assert_eq!(view.prompt_units(Condition::PerScale).len(), 3);

        let per_question = view.prompt_units(Condition::PerQuestion);
        assert_eq!(per_question.len(), 6);
        assert!(per_question.iter().all(|u| u.question_count() == 1));
        let flattened: Vec<_> = per_question.iter().flat_map(|u| u.slots()).collect();
        assert_eq!(flattened, view.slots());
    }

    #[test]
    fn persona_seed_is_deterministic_and_persona_specific() {
        assert_eq!(persona_seed(42, 3), persona_seed(42, 3));
        assert_ne!(persona_seed(42, 3), persona_seed(42, 4));
        assert_eq!(persona_seed(42, 0), 42);
    }
}
