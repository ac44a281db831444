// Library half of persona_sim; the binary in main.rs is a thin CLI over it.

pub mod clock;
pub mod config;
pub mod error;
pub mod io;
pub mod logging;
pub mod parsing;
pub mod prompt;
pub mod providers;
pub mod simulation;
pub mod types {
    pub mod survey_data;
}

pub use config::Config;
pub use error::{ConfigError, PipelineError, PromptError, ProviderError, ValidationError};
pub use types::survey_data::{Condition, InstrumentTree, Persona, SimulationResults};
