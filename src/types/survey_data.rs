use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ResponseRecord {
    pub question_id: u32,
    #[serde(default)]
    pub original_response: String,
    #[serde(default)]
    pub revised_response: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Persona {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub demographics: IndexMap<String, String>,
    #[serde(default)]
    pub responses: Vec<ResponseRecord>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PersonaFile {
    pub personas: Vec<Persona>,
}

impl PersonaFile {
    pub fn validate(&self, required_demographics: &[String]) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for persona in &self.personas {
            if !seen.insert(persona.id) {
                return Err(ValidationError::new(
                    "personas",
                    format!("duplicate persona id {}", persona.id),
                ));
            }
            for field in required_demographics {
                if !persona.demographics.contains_key(field) {
                    return Err(ValidationError::new(
                        format!("persona {}", persona.id),
                        format!("missing demographic field '{}'", field),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Subscale {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_scale: Option<String>,
    pub questions: IndexMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Scale {
    pub scale_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_scale: Option<String>,
    pub subscales: IndexMap<String, Subscale>,
}

impl Scale {
    pub fn question_count(&self) -> usize {
        self.subscales.values().map(|s| s.questions.len()).sum()
    }
}

/// Scale name -> scale, in source order.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct InstrumentTree {
    pub scales: IndexMap<String, Scale>,
}

impl InstrumentTree {
    pub fn question_count(&self) -> usize {
        self.scales.values().map(Scale::question_count).sum()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.scales.is_empty() {
            return Err(ValidationError::new("instruments", "no scales defined"));
        }
        let mut ids = HashSet::new();
        for (scale_name, scale) in &self.scales {
            let context = format!("scale '{}'", scale_name);
            if scale.scale_id == 0 {
                return Err(ValidationError::new(context, "scale_id must be a positive integer"));
            }
            if !ids.insert(scale.scale_id) {
                return Err(ValidationError::new(
                    context,
                    format!("duplicate scale_id {}", scale.scale_id),
                ));
            }
            if scale.subscales.is_empty() {
                return Err(ValidationError::new(context, "scale has no subscales"));
            }
            for (sub_name, sub) in &scale.subscales {
                if sub.questions.is_empty() {
                    return Err(ValidationError::new(
                        context,
                        format!("subscale '{}' has no questions", sub_name),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Experimental context-management strategy.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Condition {
    #[serde(rename = "condition_1", alias = "per_question")]
    PerQuestion,
    #[serde(rename = "condition_2", alias = "per_scale")]
    PerScale,
    #[serde(rename = "condition_3", alias = "full_context")]
    FullContext,
}

impl Condition {
    pub const ALL: [Condition; 3] = [
        Condition::PerQuestion,
        Condition::PerScale,
        Condition::FullContext,
    ];

    /// Key used in the results file.
    pub fn key(self) -> &'static str {
        match self {
            Condition::PerQuestion => "condition_1",
            Condition::PerScale => "condition_2",
            Condition::FullContext => "condition_3",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Condition::PerQuestion => "per_question",
            Condition::PerScale => "per_scale",
            Condition::FullContext => "full_context",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Condition {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Condition::ALL
            .into_iter()
            .find(|c| c.key() == s || c.label() == s)
            .ok_or_else(|| ValidationError::new("condition", format!("unknown condition '{}'", s)))
    }
}

/// question_id -> parsed value; `None` marks an unparseable or missing answer.
pub type QuestionResponses = IndexMap<String, Option<u8>>;
/// subscale -> questions
pub type SubscaleResponses = IndexMap<String, QuestionResponses>;
/// scale -> subscales
pub type ScaleResponses = IndexMap<String, SubscaleResponses>;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SimulationEntry {
    pub persona_id: u64,
    pub model: String,
    pub responses: IndexMap<Condition, ScaleResponses>,
}

/// The persisted results file, keyed by `persona_<id>_<model>`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct SimulationResults {
    pub entries: IndexMap<String, SimulationEntry>,
}

impl SimulationResults {
    pub fn entry_key(persona_id: u64, model: &str) -> String {
        format!("persona_{}_{}", persona_id, model)
    }

    pub fn get(&self, persona_id: u64, model: &str) -> Option<&SimulationEntry> {
        self.entries.get(&Self::entry_key(persona_id, model))
    }

    /// Merges one triple's responses, creating the (persona, model) entry on first sight.
    pub fn merge(&mut self, persona_id: u64, model: &str, condition: Condition, responses: ScaleResponses) {
        let entry = self
            .entries
            .entry(Self::entry_key(persona_id, model))
            .or_insert_with(|| SimulationEntry {
                persona_id,
                model: model.to_string(),
                responses: IndexMap::new(),
            });
        entry.responses.insert(condition, responses);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for (key, entry) in &self.entries {
            let expected = Self::entry_key(entry.persona_id, &entry.model);
            if *key != expected {
                return Err(ValidationError::new(
                    format!("entry '{}'", key),
                    format!("key does not match persona/model (expected '{}')", expected),
                ));
            }
            for (condition, scales) in &entry.responses {
                for (scale, subscales) in scales {
                    for (subscale, questions) in subscales {
                        for (qid, value) in questions {
                            if let Some(v) = value {
                                if !(1..=10).contains(v) {
                                    return Err(ValidationError::new(
                                        format!("entry '{}' {} {}/{}/{}", key, condition, scale, subscale, qid),
                                        format!("response value {} outside 1-10", v),
                                    ));
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
