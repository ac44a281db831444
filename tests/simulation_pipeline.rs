use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use pretty_assertions::assert_eq;
use serde_json::json;

use persona_sim::clock::ManualClock;
use persona_sim::error::ProviderError;
use persona_sim::io::{instruments_from_value, load_results, write_json};
use persona_sim::prompt::{TemplateComposer, DEFAULT_TEMPLATE};
use persona_sim::providers::{GenerationOptions, ProviderClient, SimulatedClient, UsageStats};
use persona_sim::simulation::{JsonFileSink, ModelRunner, OrchestratorSettings, SimulationOrchestrator};
use persona_sim::types::survey_data::{Condition, InstrumentTree, Persona, SimulationResults};

/// Answers every prompt with the same text.
struct FixedClient {
    answer: &'static str,
    calls: AtomicU64,
}

impl FixedClient {
    fn new(answer: &'static str) -> Self {
        Self {
            answer,
            calls: AtomicU64::new(0),
        }
    }
}

impl ProviderClient for FixedClient {
    fn generate_response(&self, _prompt: &str, _options: &GenerationOptions) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.answer.to_string())
    }

    fn stats(&self) -> UsageStats {
        UsageStats {
            request_count: self.calls.load(Ordering::Relaxed),
            total_tokens: 0,
            model_name: "fixed".into(),
        }
    }

    fn reset_stats(&self) {
        self.calls.store(0, Ordering::Relaxed);
    }
}

struct DownClient;

impl ProviderClient for DownClient {
    fn generate_response(&self, _prompt: &str, _options: &GenerationOptions) -> Result<String, ProviderError> {
        Err(ProviderError::Transport {
            provider: "down",
            message: "connection refused".into(),
        })
    }

    fn stats(&self) -> UsageStats {
        UsageStats {
            request_count: 0,
            total_tokens: 0,
            model_name: "down".into(),
        }
    }

    fn reset_stats(&self) {}
}

fn two_by_two() -> InstrumentTree {
    instruments_from_value(json!({
        "Wellbeing": { "scale_id": 1, "Mood": { "1": "I feel cheerful.", "2": "I feel calm." } },
        "Grit": { "scale_id": 2, "Persistence": { "3": "I finish what I begin.", "4": "Setbacks don't discourage me." } }
    }))
    .unwrap()
}

fn many_scales(n: usize) -> InstrumentTree {
    let mut value = serde_json::Map::new();
    for i in 0..n {
        let mut main = serde_json::Map::new();
        main.insert((i + 1).to_string(), json!("How true is this?"));
        value.insert(format!("Scale {}", i), json!({ "scale_id": i + 1, "main": main }));
    }
    instruments_from_value(serde_json::Value::Object(value)).unwrap()
}

fn persona(id: u64) -> Persona {
    let mut demographics = IndexMap::new();
    demographics.insert("age".to_string(), "41".to_string());
    Persona {
        id,
        name: format!("Persona {}", id),
        demographics,
        responses: Vec::new(),
    }
}

#[test]
fn fixed_answer_fills_every_slot_under_every_condition() {
    let composer = TemplateComposer::new(DEFAULT_TEMPLATE).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out/persona_responses.json");

    let runner = ModelRunner::new("stub", Box::new(FixedClient::new("4")), GenerationOptions::default());
    let mut orchestrator = SimulationOrchestrator::new(
        vec![runner],
        &composer,
        Arc::new(ManualClock::new()),
        OrchestratorSettings::default(),
    );
    let report = orchestrator
        .run(&[persona(1)], &two_by_two(), &mut JsonFileSink::new(&path))
        .unwrap();
    assert_eq!(report.failed().count(), 0);

    let results = load_results(&path).unwrap();
    let entry = results.get(1, "stub").unwrap();
    assert_eq!(entry.persona_id, 1);
    assert_eq!(entry.model, "stub");

    let keys: Vec<_> = entry.responses.keys().map(|c| c.key()).collect();
    assert_eq!(keys, ["condition_1", "condition_2", "condition_3"]);
    for scales in entry.responses.values() {
        let values: Vec<_> = scales
            .values()
            .flat_map(|subs| subs.values())
            .flat_map(|questions| questions.values())
            .copied()
            .collect();
        assert_eq!(values, vec![Some(4); 4]);
    }
    assert!(report.stats.iter().all(|s| s.completeness == 1.0 && s.mean == Some(4.0)));
}

#[test]
fn unreachable_provider_yields_empty_mappings_and_other_models_continue() {
    let composer = TemplateComposer::new(DEFAULT_TEMPLATE).unwrap();
    let clock = Arc::new(ManualClock::new());
    let models = vec![
        ModelRunner::new("down", Box::new(DownClient), GenerationOptions::default()),
        ModelRunner::new("stub", Box::new(FixedClient::new("7")), GenerationOptions::default()),
    ];
    let mut orchestrator = SimulationOrchestrator::new(models, &composer, clock.clone(), OrchestratorSettings::default());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.json");
    let report = orchestrator
        .run(&[persona(1), persona(2)], &two_by_two(), &mut JsonFileSink::new(&path))
        .unwrap();

    assert_eq!(report.outcomes.len(), 12);
    assert_eq!(report.failed().count(), 6);
    assert!(report.failed().all(|o| o.model == "down"));

    let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(raw["persona_2_down"]["responses"]["condition_3"], json!({}));
    assert_eq!(raw["persona_2_stub"]["responses"]["condition_1"]["Grit"]["Persistence"]["4"], 7);

    // 6 failed triples, two backoff sleeps each
    assert_eq!(clock.sleeps().len(), 12);
}

#[test]
fn full_context_order_is_reproducible_across_runs() {
    let composer = TemplateComposer::new(DEFAULT_TEMPLATE).unwrap();
    let tree = many_scales(7);
    let settings = OrchestratorSettings {
        seed: 2024,
        conditions: vec![Condition::FullContext],
        ..Default::default()
    };

    let run_once = || {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        let runner = ModelRunner::new("sim", Box::new(SimulatedClient::new("sim", 5)), GenerationOptions::default());
        let mut orchestrator =
            SimulationOrchestrator::new(vec![runner], &composer, Arc::new(ManualClock::new()), settings.clone());
        orchestrator
            .run(&[persona(1), persona(2)], &tree, &mut JsonFileSink::new(&path))
            .unwrap();
        std::fs::read(&path).unwrap()
    };

    let first = run_once();
    let second = run_once();
    assert_eq!(first, second);

    let results: SimulationResults = serde_json::from_slice(&first).unwrap();
    let order = |id: u64| -> Vec<String> {
        results.get(id, "sim").unwrap().responses[&Condition::FullContext]
            .keys()
            .cloned()
            .collect()
    };
    let mut sorted = order(1);
    sorted.sort();
    let mut expected: Vec<String> = tree.scales.keys().cloned().collect();
    expected.sort();
    assert_eq!(sorted, expected);
}

#[test]
fn resumed_run_only_fills_missing_entries() {
    let composer = TemplateComposer::new(DEFAULT_TEMPLATE).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.json");

    let runner = ModelRunner::new("stub", Box::new(FixedClient::new("3")), GenerationOptions::default());
    let mut first = SimulationOrchestrator::new(
        vec![runner],
        &composer,
        Arc::new(ManualClock::new()),
        OrchestratorSettings::default(),
    );
    first
        .run(&[persona(1)], &two_by_two(), &mut JsonFileSink::new(&path))
        .unwrap();
    let mut previous = first.into_results();
    // interrupted before persona 2 got past its first condition
    previous.merge(2, "stub", Condition::PerQuestion, Default::default());
    write_json(&previous, &path).unwrap();

    let runner = ModelRunner::new("stub", Box::new(FixedClient::new("9")), GenerationOptions::default());
    let mut orchestrator = SimulationOrchestrator::new(
        vec![runner],
        &composer,
        Arc::new(ManualClock::new()),
        OrchestratorSettings::default(),
    )
    .with_existing(load_results(&path).unwrap());
    let report = orchestrator
        .run(&[persona(1), persona(2)], &two_by_two(), &mut JsonFileSink::new(&path))
        .unwrap();

    assert_eq!(report.skipped, 1);
    assert!(report.outcomes.iter().all(|o| o.persona_id == 2));
    // 3 conditions x 4 items
    assert_eq!(report.usage[0].request_count, 12);

    let results = load_results(&path).unwrap();
    let kept = &results.get(1, "stub").unwrap().responses[&Condition::PerScale]["Wellbeing"]["Mood"]["1"];
    assert_eq!(*kept, Some(3));
    let filled = &results.get(2, "stub").unwrap().responses[&Condition::PerQuestion]["Grit"]["Persistence"]["3"];
    assert_eq!(*filled, Some(9));
}
