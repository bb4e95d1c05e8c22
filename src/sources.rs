//! Dataset source loading.
//!
//! Sources are re-read on every monitor tick so datasets can be added or
//! removed without a restart.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;

use crate::db::{Dataset, ProbeMethod};

/// A malformed or empty dataset source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to read sources file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse sources: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("dataset source is empty")]
    Empty,
    #[error("dataset #{index} is missing required field `{field}`")]
    MissingField { index: usize, field: &'static str },
    #[error("duplicate dataset id `{0}`")]
    DuplicateId(String),
}

/// Anything that can produce the current dataset list.
pub trait DatasetSource: Send + Sync {
    fn load(&self) -> Result<Vec<Dataset>, SourceError>;
}

#[derive(Debug, Deserialize)]
struct SourcesFile {
    #[serde(default)]
    datasets: Vec<RawDataset>,
}

// Every field optional so a missing one is reported by name.
#[derive(Debug, Deserialize)]
struct RawDataset {
    id: Option<String>,
    name: Option<String>,
    category: Option<String>,
    url: Option<String>,
    #[serde(default)]
    method: Option<ProbeMethod>,
    timeout: Option<f64>,
    description: Option<String>,
}

fn required(value: Option<String>, index: usize, field: &'static str) -> Result<String, SourceError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(SourceError::MissingField { index, field }),
    }
}

/// Parse a YAML document with a top-level `datasets:` list.
pub fn parse_datasets(content: &str) -> Result<Vec<Dataset>, SourceError> {
    let file: SourcesFile = serde_yaml::from_str(content)?;

    let mut datasets = Vec::with_capacity(file.datasets.len());
    for (index, raw) in file.datasets.into_iter().enumerate() {
        let mut ds = Dataset::new(
            &required(raw.id, index, "id")?,
            &required(raw.name, index, "name")?,
            &required(raw.category, index, "category")?,
            &required(raw.url, index, "url")?,
        );
        if let Some(method) = raw.method {
            ds.method = method;
        }
        if let Some(timeout) = raw.timeout {
            ds.set_timeout(timeout);
        }
        ds.description = raw.description;
        datasets.push(ds);
    }

    validate(&datasets)?;
    Ok(datasets)
}

/// Reject empty lists and duplicate ids.
pub fn validate(datasets: &[Dataset]) -> Result<(), SourceError> {
    if datasets.is_empty() {
        return Err(SourceError::Empty);
    }
    let mut seen = HashSet::new();
    for ds in datasets {
        if !seen.insert(ds.id.as_str()) {
            return Err(SourceError::DuplicateId(ds.id.clone()));
        }
    }
    Ok(())
}

/// Datasets read from a YAML file on every load.
#[derive(Debug, Clone)]
pub struct YamlSource {
    path: PathBuf,
}

impl YamlSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DatasetSource for YamlSource {
    fn load(&self) -> Result<Vec<Dataset>, SourceError> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| SourceError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        parse_datasets(&content)
    }
}

/// A fixed in-memory list.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    datasets: Vec<Dataset>,
}

impl StaticSource {
    pub fn new(datasets: Vec<Dataset>) -> Self {
        Self { datasets }
    }
}

impl DatasetSource for StaticSource {
    fn load(&self) -> Result<Vec<Dataset>, SourceError> {
        validate(&self.datasets)?;
        Ok(self.datasets.clone())
    }
}
