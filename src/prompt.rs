//! Per-persona prompt rendering.

use std::fs;
use std::path::{Path, PathBuf};

use handlebars::Handlebars;
use serde::Serialize;
use tracing::info;

use crate::error::{PipelineError, PromptError};
use crate::io::write_text;
use crate::simulation::conditions::InstrumentView;
use crate::types::survey_data::{Condition, InstrumentTree, Persona};

/// Prefix of every rendered question line; backends that fake answers count these.
pub const ITEM_MARKER: &str = "[item ";

const TEMPLATE_NAME: &str = "prompt";

pub const DEFAULT_TEMPLATE: &str = r#"You are answering a questionnaire as the person described below.

Persona #{{persona.id}}{{#if persona.name}}: {{persona.name}}{{/if}}
{{#each persona.demographics}}
- {{@key}}: {{this}}
{{/each}}
{{#if persona.responses}}
In earlier interviews this person said:
{{#each persona.responses}}
- {{revised_response}}
{{/each}}
{{/if}}

{{#each instruments.scales}}
Scale: {{name}}{{#if response_scale}} (response scale: {{response_scale}}){{/if}}
{{#each subscales}}
{{#each questions}}
[item {{id}}] {{text}}
{{/each}}
{{/each}}

{{/each}}
{{instructions}}
"#;

/// Supplies prompt text for a persona and a subset of the instruments.
pub trait PromptComposer: Send + Sync {
    fn render(
        &self,
        persona: &Persona,
        instruments: &InstrumentView<'_>,
        extra_instructions: &str,
    ) -> Result<String, PromptError>;
}

#[derive(Serialize)]
struct PromptContext<'a> {
    persona: &'a Persona,
    instruments: &'a InstrumentView<'a>,
    instructions: &'a str,
}

/// Handlebars-backed composer. Strict mode: any key the template names must exist.
pub struct TemplateComposer {
    registry: Handlebars<'static>,
}

impl TemplateComposer {
    pub fn new(template: &str) -> Result<Self, PromptError> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);
        registry
            .register_template_string(TEMPLATE_NAME, template)
            .map_err(|e| PromptError::Template(e.to_string()))?;
        Ok(Self { registry })
    }

    pub fn from_file(path: &Path) -> Result<Self, PromptError> {
        let template = fs::read_to_string(path).map_err(|source| PromptError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::new(&template)
    }

    /// The configured template file, or the built-in template.
    pub fn from_optional_file(path: Option<&Path>) -> Result<Self, PromptError> {
        match path {
            Some(p) => Self::from_file(p),
            None => Self::new(DEFAULT_TEMPLATE),
        }
    }
}

impl PromptComposer for TemplateComposer {
    fn render(
        &self,
        persona: &Persona,
        instruments: &InstrumentView<'_>,
        extra_instructions: &str,
    ) -> Result<String, PromptError> {
        let context = PromptContext {
            persona,
            instruments,
            instructions: extra_instructions,
        };
        self.registry.render(TEMPLATE_NAME, &context).map_err(|e| {
            if e.desc.contains("strict mode") {
                PromptError::MissingContext(e.desc)
            } else {
                PromptError::Template(e.to_string())
            }
        })
    }
}

/// Answer-format instructions appended to each prompt.
pub fn condition_instructions(condition: Condition, item_count: usize) -> String {
    match condition {
        Condition::PerQuestion => {
            "Answer the item above with a single whole number from its response scale. Reply with the number only.".to_string()
        }
        Condition::PerScale => format!(
            "Answer each of the {} items of this scale in the order shown. Write one whole number per line and nothing else.",
            item_count
        ),
        Condition::FullContext => format!(
            "Answer all {} items above in the order shown, across every scale. Write one whole number per line and nothing else.",
            item_count
        ),
    }
}

/// Instructions for asking a single item while the rest of the unit stays visible as context.
pub fn item_instructions(question_id: &str) -> String {
    format!(
        "Answer item {} only, with a single whole number from its response scale. Reply with the number only.",
        question_id
    )
}

/// Renders one full-instrument prompt per persona into `out_dir/persona_<id>_prompt.txt`.
pub fn write_persona_prompts(
    personas: &[Persona],
    instruments: &InstrumentTree,
    composer: &dyn PromptComposer,
    out_dir: &Path,
) -> Result<Vec<PathBuf>, PipelineError> {
    let view = InstrumentView::full(instruments);
    let instructions = condition_instructions(Condition::FullContext, view.question_count());
    let mut written = Vec::with_capacity(personas.len());
    for persona in personas {
        let text = composer.render(persona, &view, &instructions)?;
        let path = out_dir.join(format!("persona_{}_prompt.txt", persona.id));
        write_text(&text, &path)?;
        info!(persona_id = persona.id, path = %path.display(), "Rendered prompt");
        written.push(path);
    }
    Ok(written)
}
