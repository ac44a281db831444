pub mod conditions;
pub mod orchestrator;
pub mod stats;

pub use conditions::{build_condition_view, persona_seed, InstrumentView};
pub use orchestrator::{
    JsonFileSink, ModelRunner, OrchestratorSettings, ResultSink, RunReport, SimulationOrchestrator,
    TripleOutcome, TripleStatus,
};
pub use stats::{compute_run_stats, RunStats};
