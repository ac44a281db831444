use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::error::{PipelineError, ValidationError};
use crate::types::survey_data::{InstrumentTree, PersonaFile, Scale, SimulationResults, Subscale};

fn ensure_parent(path: &Path) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| PipelineError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Writes into a temporary file beside `path`, then renames it over `path`.
/// On any failure the temporary file is discarded and `path` is untouched.
fn replace_file<F>(path: &Path, write: F) -> Result<(), PipelineError>
where
    F: FnOnce(&mut BufWriter<&mut File>) -> Result<(), PipelineError>,
{
    ensure_parent(path)?;
    let io_err = |source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        write(&mut writer)?;
        writer.flush().map_err(io_err)?;
    }
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// Writes pretty-printed (2-space) UTF-8 JSON, creating parent directories.
/// Non-ASCII text is written as-is. The target is replaced atomically.
pub fn write_json<T: Serialize + ?Sized>(data: &T, path: &Path) -> Result<(), PipelineError> {
    replace_file(path, |writer| {
        serde_json::to_writer_pretty(&mut *writer, data).map_err(|source| PipelineError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        writer.write_all(b"\n").map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })
    })
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, PipelineError> {
    let file = File::open(path).map_err(|source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| PipelineError::Json {
        path: path.to_path_buf(),
        source,
    })
}

pub fn write_text(text: &str, path: &Path) -> Result<(), PipelineError> {
    replace_file(path, |writer| {
        writer.write_all(text.as_bytes()).map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })
    })
}

pub fn load_personas(path: &Path, required_demographics: &[String]) -> Result<PersonaFile, PipelineError> {
    let personas: PersonaFile = read_json(path)?;
    personas.validate(required_demographics)?;
    Ok(personas)
}

pub fn load_instruments(path: &Path) -> Result<InstrumentTree, PipelineError> {
    let value: Value = read_json(path)?;
    let tree = instruments_from_value(value)?;
    tree.validate()?;
    Ok(tree)
}

pub fn load_results(path: &Path) -> Result<SimulationResults, PipelineError> {
    let results: SimulationResults = read_json(path)?;
    results.validate()?;
    Ok(results)
}

fn question_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn flat_subscale(context: &str, block: &serde_json::Map<String, Value>) -> Result<Subscale, ValidationError> {
    let mut subscale = Subscale::default();
    for (key, value) in block {
        if key == "response_scale" {
            subscale.response_scale = value.as_str().map(str::to_string);
            continue;
        }
        let text = question_text(value).ok_or_else(|| {
            ValidationError::new(context, format!("question '{}' is not text", key))
        })?;
        subscale.questions.insert(key.clone(), text);
    }
    Ok(subscale)
}

fn flat_scale(name: &str, block: &serde_json::Map<String, Value>) -> Result<Scale, ValidationError> {
    let context = format!("scale '{}'", name);
    let scale_id = block
        .get("scale_id")
        .and_then(Value::as_u64)
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| ValidationError::new(&context, "missing or invalid scale_id"))?;

    let mut scale = Scale {
        scale_id,
        response_scale: block.get("response_scale").and_then(Value::as_str).map(str::to_string),
        subscales: IndexMap::new(),
    };

    for (key, value) in block {
        if key == "scale_id" || key == "response_scale" {
            continue;
        }
        let sub_block = value.as_object().ok_or_else(|| {
            ValidationError::new(&context, format!("entry '{}' is neither a subscale nor metadata", key))
        })?;
        let sub_context = format!("{} subscale '{}'", context, key);
        scale.subscales.insert(key.clone(), flat_subscale(&sub_context, sub_block)?);
    }
    Ok(scale)
}

/// Accepts the structured layout (`subscales`/`questions`) or the flat layout
/// emitted by the CSV conversion step, where subscales and an optional `items`
/// block sit directly inside each scale object. Source key order is kept.
pub fn instruments_from_value(value: Value) -> Result<InstrumentTree, ValidationError> {
    let Value::Object(scales) = value else {
        return Err(ValidationError::new("instruments", "top level must be an object"));
    };

    let mut tree = InstrumentTree::default();
    for (name, block) in scales {
        let Value::Object(block) = block else {
            return Err(ValidationError::new(format!("scale '{}'", name), "must be an object"));
        };
        let scale = if block.get("subscales").is_some_and(Value::is_object) {
            serde_json::from_value::<Scale>(Value::Object(block))
                .map_err(|e| ValidationError::new(format!("scale '{}'", name), e.to_string()))?
        } else {
            flat_scale(&name, &block)?
        };
        tree.scales.insert(name, scale);
    }
    Ok(tree)
}
