//! Filesystem datasource: one JSON document per item.
//!
//! Walks the configured root, keeps files matching the include globs and not
//! matching the exclude globs, and uses the relative path as the source id.
//! The item language comes from a top-level document property (`language`
//! by default) and falls back to `und`.
//!
//! Field values are read by dotted property path (`meta.tags`); arrays yield
//! one value per element.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use search_harness_core::datasource::Datasource;
use search_harness_core::models::{Field, FieldValue, ItemId, ItemValues};

use crate::config::DatasourceConfig;

/// Language code used when a document declares none.
pub const UNDEFINED_LANGUAGE: &str = "und";

pub struct FsDatasource {
    id: String,
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
    language_property: String,
}

impl FsDatasource {
    pub fn from_config(id: &str, config: &DatasourceConfig) -> Result<Self> {
        let mut default_excludes = vec!["**/.git/**".to_string(), "**/node_modules/**".to_string()];
        default_excludes.extend(config.exclude_globs.clone());
        Ok(Self {
            id: id.to_string(),
            root: config.root.clone(),
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&default_excludes)?,
            follow_symlinks: config.follow_symlinks,
            language_property: config.language_property.clone(),
        })
    }

    fn read_document(&self, path: &Path) -> Result<Value> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
    }

    fn language_of(&self, doc: &Value) -> String {
        doc.get(&self.language_property)
            .and_then(Value::as_str)
            .filter(|l| !l.is_empty())
            .unwrap_or(UNDEFINED_LANGUAGE)
            .to_string()
    }
}

#[async_trait]
impl Datasource for FsDatasource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn item_ids(&self) -> Result<Vec<ItemId>> {
        if !self.root.exists() {
            bail!(
                "Datasource '{}' root does not exist: {}",
                self.id,
                self.root.display()
            );
        }

        let mut ids = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(self.follow_symlinks) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");
            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }
            match self.read_document(path) {
                Ok(doc) => ids.push(ItemId::new(&self.id, rel_str, self.language_of(&doc))),
                Err(e) => warn!(datasource = %self.id, file = %rel_str, error = %e, "skipping unreadable document"),
            }
        }

        // Sort for deterministic ordering
        ids.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(ids)
    }

    async fn extract_field_values(&self, id: &ItemId, fields: &[Field]) -> Result<Option<ItemValues>> {
        if id.datasource != self.id {
            return Ok(None);
        }
        let path = self.root.join(&id.source_id);
        if !path.is_file() {
            return Ok(None);
        }
        let doc = self.read_document(&path)?;
        if self.language_of(&doc) != id.language {
            return Ok(None);
        }

        let mut values = ItemValues::new();
        for field in fields {
            let Some(raw) = value_at_path(&doc, field.path()) else {
                continue;
            };
            let converted: Vec<FieldValue> = match raw {
                Value::Array(elements) => elements
                    .iter()
                    .filter_map(|v| FieldValue::from_json(field.field_type, v))
                    .collect(),
                other => FieldValue::from_json(field.field_type, other).into_iter().collect(),
            };
            if !converted.is_empty() {
                values.insert(field.name.clone(), converted);
            }
        }
        Ok(Some(values))
    }
}

fn value_at_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, key| current.get(key))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
