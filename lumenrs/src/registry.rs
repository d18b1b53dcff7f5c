use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

use glob::glob;
use serde::Serialize;

use crate::error::{LumenError, Result};
use crate::models::{Aggregation, SourceSchema};

/// Immutable lookup of logical sources. Construction validates join
/// references so the query path never sees a dangling or cyclic join.
#[derive(Debug, Default, Clone)]
pub struct SourceRegistry {
    sources: HashMap<String, SourceSchema>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicSource {
    pub label: String,
    pub dimensions: Vec<PublicField>,
    pub measures: Vec<PublicMeasure>,
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublicField {
    pub key: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicMeasure {
    pub key: String,
    pub label: String,
    pub default_agg: Aggregation,
}

impl SourceRegistry {
    pub fn from_sources(sources: Vec<SourceSchema>) -> Result<Self> {
        let mut registry = SourceRegistry::default();
        for source in sources {
            registry.insert(source)?;
        }
        Ok(registry)
    }

    /// Load every `*.yml` / `*.yaml` file in `root`, one source per file.
    pub fn load_from_dir<P: AsRef<Path>>(root: P) -> Result<Self> {
        let dir = root.as_ref();
        if !dir.exists() {
            return Err(LumenError::Config(format!(
                "sources directory not found: {}",
                dir.display()
            )));
        }
        let mut registry = SourceRegistry::default();
        for pattern in ["yml", "yaml"] {
            for entry in glob(&format!("{}/*.{pattern}", dir.display()))
                .map_err(|e| LumenError::Other(e.into()))?
                .flatten()
            {
                let contents = fs::read_to_string(&entry)?;
                let source: SourceSchema = serde_yaml::from_str(&contents)?;
                tracing::debug!(source = %source.name, path = %entry.display(), "loaded source");
                registry.insert(source)?;
            }
        }
        tracing::info!(sources = registry.sources.len(), "source registry loaded");
        Ok(registry)
    }

    fn insert(&mut self, source: SourceSchema) -> Result<()> {
        validate_source(&source)?;
        if self.sources.contains_key(&source.name) {
            return Err(LumenError::Schema(format!(
                "source {} defined more than once",
                source.name
            )));
        }
        self.sources.insert(source.name.clone(), source);
        Ok(())
    }

    pub fn get_source(&self, name: &str) -> Option<&SourceSchema> {
        self.sources.get(name)
    }

    pub fn source_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sources.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Labels and keys only; SQL fragments never leave the registry.
    pub fn public_schema(&self) -> BTreeMap<String, PublicSource> {
        self.sources
            .values()
            .map(|source| {
                let dimensions = source
                    .dimensions
                    .iter()
                    .map(|(key, dim)| PublicField {
                        key: key.clone(),
                        label: dim.label.clone().unwrap_or_else(|| key.clone()),
                    })
                    .collect();
                let measures = source
                    .measures
                    .iter()
                    .map(|(key, measure)| PublicMeasure {
                        key: key.clone(),
                        label: measure.label.clone().unwrap_or_else(|| key.clone()),
                        default_agg: measure.default_agg,
                    })
                    .collect();
                let filters = source.filter_columns.keys().cloned().collect();
                (
                    source.name.clone(),
                    PublicSource {
                        label: source.display_label().to_string(),
                        dimensions,
                        measures,
                        filters,
                    },
                )
            })
            .collect()
    }
}

fn validate_source(source: &SourceSchema) -> Result<()> {
    if source.table.trim().is_empty() {
        return Err(LumenError::Schema(format!(
            "source {} has no table",
            source.name
        )));
    }

    let check_ref = |owner: &str, key: &str, join: &Option<String>| -> Result<()> {
        match join {
            Some(name) if !source.joins.contains_key(name) => Err(LumenError::Schema(format!(
                "source {}: {owner} {key} references unknown join {name}",
                source.name
            ))),
            _ => Ok(()),
        }
    };
    for (key, dim) in &source.dimensions {
        check_ref("dimension", key, &dim.join)?;
    }
    for (key, measure) in &source.measures {
        check_ref("measure", key, &measure.join)?;
    }
    for (key, filter) in &source.filter_columns {
        check_ref("filter", key, &filter.join)?;
    }
    for (name, join) in &source.joins {
        for dep in &join.requires {
            if !source.joins.contains_key(dep) {
                return Err(LumenError::Schema(format!(
                    "source {}: join {name} requires unknown join {dep}",
                    source.name
                )));
            }
        }
    }

    let mut done: HashSet<&str> = HashSet::new();
    for name in source.joins.keys() {
        let mut path: Vec<&str> = Vec::new();
        detect_cycle(source, name, &mut path, &mut done)?;
    }
    Ok(())
}

fn detect_cycle<'a>(
    source: &'a SourceSchema,
    name: &'a str,
    path: &mut Vec<&'a str>,
    done: &mut HashSet<&'a str>,
) -> Result<()> {
    if done.contains(name) {
        return Ok(());
    }
    if path.contains(&name) {
        path.push(name);
        return Err(LumenError::Schema(format!(
            "source {}: cyclic join requirements {}",
            source.name,
            path.join(" -> ")
        )));
    }
    path.push(name);
    if let Some(join) = source.joins.get(name) {
        for dep in &join.requires {
            detect_cycle(source, dep, path, done)?;
        }
    }
    path.pop();
    done.insert(name);
    Ok(())
}
