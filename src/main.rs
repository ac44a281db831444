use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use persona_sim::clock::{Clock, SystemClock};
use persona_sim::config::{load_config_from_file, Config};
use persona_sim::io::{load_instruments, load_personas, load_results, write_json};
use persona_sim::logging::init_logging;
use persona_sim::prompt::{write_persona_prompts, TemplateComposer};
use persona_sim::providers::{create_client_with_env, GenerationOptions};
use persona_sim::simulation::{
    compute_run_stats, JsonFileSink, ModelRunner, OrchestratorSettings, RunStats, SimulationOrchestrator,
};
use persona_sim::types::survey_data::SimulationResults;

#[derive(Parser, Debug)]
#[command(name = "persona_sim", version, about = "Simulate persona survey responses across language models")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every persona x model x condition triple and write the results file
    Simulate {
        /// Comma-separated model keys; defaults to every configured model
        #[arg(long, value_delimiter = ',')]
        models: Vec<String>,

        /// Only simulate the first N personas
        #[arg(long)]
        limit: Option<usize>,

        /// Keep complete entries from an existing results file
        #[arg(long)]
        resume: bool,
    },
    /// Write one full-instrument prompt per persona into the prompts directory
    RenderPrompts,
    /// Validate the results file and rewrite it pretty-printed
    FormatOutput,
    /// Print completeness and value statistics for the results file
    Stats,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = load_config_from_file(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    init_logging(&config.log_level);

    match cli.command {
        Command::Simulate { models, limit, resume } => simulate(&config, &models, limit, resume),
        Command::RenderPrompts => render_prompts(&config),
        Command::FormatOutput => format_output(&config),
        Command::Stats => stats(&config),
    }
}

/// Builds a runner per requested model; providers with config errors are skipped, anything else aborts.
fn build_runners(config: &Config, requested: &[String], clock: Arc<dyn Clock>) -> Result<Vec<ModelRunner>> {
    let keys: Vec<String> = if requested.is_empty() {
        config.models.keys().cloned().collect()
    } else {
        requested.to_vec()
    };

    let mut runners = Vec::new();
    for key in keys {
        match create_client_with_env(&key, config, |var| std::env::var(var).ok(), clock.clone()) {
            Ok(client) => {
                let options = config
                    .models
                    .get(&key)
                    .map(GenerationOptions::from_model)
                    .unwrap_or_default();
                info!(model = %key, "Provider ready");
                runners.push(ModelRunner::new(key, client, options));
            }
            Err(e) if e.is_config() => error!(model = %key, error = %e, "Skipping provider"),
            Err(e) => return Err(e).with_context(|| format!("building provider {}", key)),
        }
    }

    if runners.is_empty() {
        bail!("no provider could be initialized; check model keys and credentials");
    }
    Ok(runners)
}

fn simulate(config: &Config, models: &[String], limit: Option<usize>, resume: bool) -> Result<()> {
    let mut personas = load_personas(&config.personas_path, &config.required_demographics)
        .context("loading personas")?
        .personas;
    if let Some(limit) = limit {
        personas.truncate(limit);
    }
    let tree = load_instruments(&config.instruments_path).context("loading instruments")?;
    let composer =
        TemplateComposer::from_optional_file(config.template_path.as_deref()).context("loading prompt template")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let runners = build_runners(config, models, clock.clone())?;

    let existing = if resume && config.responses_path.exists() {
        load_results(&config.responses_path).context("loading previous results for resume")?
    } else {
        if resume {
            warn!(path = %config.responses_path.display(), "No previous results found; starting fresh");
        }
        SimulationResults::default()
    };

    let mut orchestrator =
        SimulationOrchestrator::new(runners, &composer, clock, OrchestratorSettings::from_config(config))
            .with_existing(existing);
    let mut sink = JsonFileSink::new(config.responses_path.clone());
    let report = orchestrator
        .run(&personas, &tree, &mut sink)
        .context("running simulation")?;

    for outcome in report.failed() {
        warn!(
            persona_id = outcome.persona_id,
            model = %outcome.model,
            condition = %outcome.condition,
            "Failed triple"
        );
    }
    for usage in &report.usage {
        info!(
            model = %usage.model_name,
            requests = usage.request_count,
            tokens = usage.total_tokens,
            "Provider usage"
        );
    }
    print_stats(&report.stats);
    println!(
        "Answered {} triple(s), failed {}, skipped {} complete entr(ies). Results: {}",
        report.answered_count(),
        report.failed().count(),
        report.skipped,
        config.responses_path.display()
    );
    Ok(())
}

fn render_prompts(config: &Config) -> Result<()> {
    let personas = load_personas(&config.personas_path, &config.required_demographics).context("loading personas")?;
    let tree = load_instruments(&config.instruments_path).context("loading instruments")?;
    let composer =
        TemplateComposer::from_optional_file(config.template_path.as_deref()).context("loading prompt template")?;

    let written = write_persona_prompts(&personas.personas, &tree, &composer, &config.prompts_dir)
        .context("rendering prompts")?;
    println!("Wrote {} prompt(s) to {}", written.len(), config.prompts_dir.display());
    Ok(())
}

fn format_output(config: &Config) -> Result<()> {
    let results = load_results(&config.responses_path).context("loading results")?;
    write_json(&results, &config.responses_path).context("writing formatted results")?;
    println!("Formatted {} entr(ies) in {}", results.len(), config.responses_path.display());
    Ok(())
}

fn stats(config: &Config) -> Result<()> {
    let results = load_results(&config.responses_path).context("loading results")?;
    let tree = load_instruments(&config.instruments_path).context("loading instruments")?;
    print_stats(&compute_run_stats(&results, &tree));
    Ok(())
}

fn print_stats(stats: &[RunStats]) {
    println!(
        "{:<20} {:<14} {:>8} {:>8} {:>8} {:>6} {:>6} {:>7}",
        "model", "condition", "expected", "missing", "complete", "min", "max", "mean"
    );
    let or_dash = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());
    for s in stats {
        println!(
            "{:<20} {:<14} {:>8} {:>8} {:>7.1}% {:>6} {:>6} {:>7}",
            s.model,
            s.condition.label(),
            s.expected,
            s.missing,
            s.completeness * 100.0,
            or_dash(s.min.map(|v| v.to_string())),
            or_dash(s.max.map(|v| v.to_string())),
            or_dash(s.mean.map(|v| format!("{:.2}", v))),
        );
    }
}
