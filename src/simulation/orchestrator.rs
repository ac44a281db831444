//! Drives persona x model x condition triples through composer, provider and parser.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::conditions::{build_condition_view, persona_seed, Slot};
use super::stats::{compute_run_stats, RunStats};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{PipelineError, PromptError, ProviderError};
use crate::io::write_json;
use crate::parsing::parse_likert_responses;
use crate::prompt::{condition_instructions, item_instructions, PromptComposer};
use crate::providers::{GenerationOptions, ProviderClient, UsageStats};
use crate::types::survey_data::{Condition, InstrumentTree, Persona, ScaleResponses, SimulationEntry, SimulationResults};

/// One configured model: its results-file key, client, and generation options.
pub struct ModelRunner {
    pub key: String,
    pub client: Box<dyn ProviderClient>,
    pub options: GenerationOptions,
}

impl ModelRunner {
    pub fn new(key: impl Into<String>, client: Box<dyn ProviderClient>, options: GenerationOptions) -> Self {
        Self {
            key: key.into(),
            client,
            options,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub seed: u64,
    pub conditions: Vec<Condition>,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub checkpoint_interval: usize,
    pub triple_timeout: Option<Duration>,
    /// Ask a whole context unit in one call instead of one call per item.
    pub batch_prompts: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            seed: 42,
            conditions: Condition::ALL.to_vec(),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            checkpoint_interval: 10,
            triple_timeout: None,
            batch_prompts: false,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            seed: config.seed,
            conditions: config.conditions.clone(),
            max_retries: config.max_retries,
            retry_base_delay: config.retry_base_delay(),
            checkpoint_interval: config.checkpoint_interval,
            triple_timeout: config.triple_timeout(),
            batch_prompts: config.batch_prompts,
        }
    }

    /// Delay before attempt `failed_attempt + 1`: base, 2x base, 4x base, ...
    pub fn backoff_delay(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(20);
        self.retry_base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Receives the accumulated results at every checkpoint and at the end of a run.
pub trait ResultSink {
    fn flush(&mut self, results: &SimulationResults) -> Result<(), PipelineError>;
}

/// Rewrites the whole results file on each flush.
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ResultSink for JsonFileSink {
    fn flush(&mut self, results: &SimulationResults) -> Result<(), PipelineError> {
        write_json(results, &self.path)?;
        debug!(path = %self.path.display(), entries = results.len(), "Flushed results");
        Ok(())
    }
}

#[derive(Debug, Error)]
enum TripleFailure {
    #[error("prompt rendering failed: {0}")]
    Prompt(#[from] PromptError),

    #[error("provider failed after {attempts} attempt(s): {source}")]
    Provider {
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("timed out after {elapsed:?}: {last_error}")]
    TimedOut { elapsed: Duration, last_error: ProviderError },
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum TripleStatus {
    Answered,
    Failed(String),
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TripleOutcome {
    pub persona_id: u64,
    pub model: String,
    pub condition: Condition,
    pub status: TripleStatus,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RunReport {
    pub outcomes: Vec<TripleOutcome>,
    /// (persona, model) pairs skipped because a previous run completed them.
    pub skipped: usize,
    pub usage: Vec<UsageStats>,
    pub stats: Vec<RunStats>,
}

impl RunReport {
    pub fn failed(&self) -> impl Iterator<Item = &TripleOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, TripleStatus::Failed(_)))
    }

    pub fn answered_count(&self) -> usize {
        self.outcomes.len() - self.failed().count()
    }
}

/// Owns the result accumulator; the only writer of the output mapping.
pub struct SimulationOrchestrator<'a> {
    models: Vec<ModelRunner>,
    composer: &'a dyn PromptComposer,
    clock: Arc<dyn Clock>,
    settings: OrchestratorSettings,
    results: SimulationResults,
}

impl<'a> SimulationOrchestrator<'a> {
    pub fn new(
        models: Vec<ModelRunner>,
        composer: &'a dyn PromptComposer,
        clock: Arc<dyn Clock>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            models,
            composer,
            clock,
            settings,
            results: SimulationResults::default(),
        }
    }

    /// Seeds the accumulator with a previous run's results; complete entries are skipped.
    pub fn with_existing(mut self, results: SimulationResults) -> Self {
        self.results = results;
        self
    }

    pub fn results(&self) -> &SimulationResults {
        &self.results
    }

    pub fn into_results(self) -> SimulationResults {
        self.results
    }

    pub fn flush(&self, sink: &mut dyn ResultSink) -> Result<(), PipelineError> {
        sink.flush(&self.results)
    }

    fn is_complete(&self, entry: Option<&SimulationEntry>) -> bool {
        entry.is_some_and(|entry| {
            self.settings
                .conditions
                .iter()
                .all(|c| entry.responses.get(c).is_some_and(|r| !r.is_empty()))
        })
    }

    /// Runs every triple in order, flushing every `checkpoint_interval`
    /// personas and once more at the end.
    ///
    /// Provider and prompt failures are recorded per triple and never abort
    /// the run; only the final flush can fail it.
    pub fn run(
        &mut self,
        personas: &[Persona],
        tree: &InstrumentTree,
        sink: &mut dyn ResultSink,
    ) -> Result<RunReport, PipelineError> {
        let interval = self.settings.checkpoint_interval.max(1);
        let mut outcomes = Vec::new();
        let mut skipped = 0;

        info!(
            personas = personas.len(),
            models = self.models.len(),
            conditions = self.settings.conditions.len(),
            "Starting simulation run"
        );

        for (index, persona) in personas.iter().enumerate() {
            for model_index in 0..self.models.len() {
                let model_key = self.models[model_index].key.clone();
                if self.is_complete(self.results.get(persona.id, &model_key)) {
                    debug!(persona_id = persona.id, model = %model_key, "Already complete, skipping");
                    skipped += 1;
                    continue;
                }

                for condition in self.settings.conditions.clone() {
                    let outcome = self.run_triple(persona, model_index, tree, condition);
                    outcomes.push(outcome);
                }
            }

            let processed = index + 1;
            if processed % interval == 0 {
                if let Err(e) = self.flush(sink) {
                    error!(processed, error = %e, "Checkpoint flush failed");
                } else {
                    info!(processed, total = personas.len(), "Checkpoint saved");
                }
            }
        }

        self.flush(sink)?;

        let report = RunReport {
            outcomes,
            skipped,
            usage: self.models.iter().map(|m| m.client.stats()).collect(),
            stats: compute_run_stats(&self.results, tree),
        };
        info!(
            answered = report.answered_count(),
            failed = report.failed().count(),
            skipped,
            "Simulation run finished"
        );
        Ok(report)
    }

    fn run_triple(
        &mut self,
        persona: &Persona,
        model_index: usize,
        tree: &InstrumentTree,
        condition: Condition,
    ) -> TripleOutcome {
        let model_key = self.models[model_index].key.clone();
        let (responses, status) = match self.answer_triple(persona, &self.models[model_index], tree, condition) {
            Ok(responses) => {
                debug!(persona_id = persona.id, model = %model_key, %condition, "Triple answered");
                (responses, TripleStatus::Answered)
            }
            Err(failure) => {
                warn!(
                    persona_id = persona.id,
                    model = %model_key,
                    %condition,
                    error = %failure,
                    "Triple failed; recording empty responses"
                );
                (ScaleResponses::new(), TripleStatus::Failed(failure.to_string()))
            }
        };

        self.results.merge(persona.id, &model_key, condition, responses);
        TripleOutcome {
            persona_id: persona.id,
            model: model_key,
            condition,
            status,
        }
    }

    fn answer_triple(
        &self,
        persona: &Persona,
        runner: &ModelRunner,
        tree: &InstrumentTree,
        condition: Condition,
    ) -> Result<ScaleResponses, TripleFailure> {
        let view = build_condition_view(tree, condition, persona_seed(self.settings.seed, persona.id));

        // every prompt is rendered before the first provider call
        let mut requests: Vec<(Vec<Slot<'_>>, String)> = Vec::new();
        for unit in view.prompt_units(condition) {
            let slots = unit.slots();
            if self.settings.batch_prompts {
                let instructions = condition_instructions(condition, slots.len());
                let prompt = self.composer.render(persona, &unit, &instructions)?;
                requests.push((slots, prompt));
            } else {
                for slot in slots {
                    let prompt = self.composer.render(persona, &unit, &item_instructions(slot.question_id))?;
                    requests.push((vec![slot], prompt));
                }
            }
        }

        let mut started = None;
        let mut responses = ScaleResponses::new();
        for (slots, prompt) in &requests {
            let text = self.call_with_retry(runner, prompt, &mut started)?;
            store_answers(&mut responses, slots, &text);
        }
        Ok(responses)
    }

    fn call_with_retry(
        &self,
        runner: &ModelRunner,
        prompt: &str,
        started: &mut Option<Instant>,
    ) -> Result<String, TripleFailure> {
        let max_attempts = self.settings.max_retries.max(1);
        let started_at = *started.get_or_insert_with(|| self.clock.now());
        let mut attempt = 1;

        loop {
            let err = match runner.client.generate_response(prompt, &runner.options) {
                Ok(text) => return Ok(text),
                Err(err) => err,
            };
            if attempt >= max_attempts || !err.is_retryable() {
                return Err(TripleFailure::Provider {
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.settings.backoff_delay(attempt);
            if let Some(timeout) = self.settings.triple_timeout {
                let elapsed = self.clock.now().saturating_duration_since(started_at);
                if elapsed.saturating_add(delay) > timeout {
                    return Err(TripleFailure::TimedOut {
                        elapsed,
                        last_error: err,
                    });
                }
            }

            warn!(
                model = %runner.key,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Provider call failed, backing off"
            );
            self.clock.sleep(delay);
            attempt += 1;
        }
    }
}

fn store_answers(responses: &mut ScaleResponses, slots: &[Slot<'_>], text: &str) {
    let values = parse_likert_responses(text, slots.len());
    for (slot, value) in slots.iter().zip(values) {
        responses
            .entry(slot.scale.to_string())
            .or_default()
            .entry(slot.subscale.to_string())
            .or_default()
            .insert(slot.question_id.to_string(), value);
    }
}
