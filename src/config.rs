use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use search_harness_core::backend::BackendSettings;
use search_harness_core::models::{Field, IndexDef, IndexOptions};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
    #[serde(default)]
    pub datasources: BTreeMap<String, DatasourceConfig>,
    #[serde(default)]
    pub indexes: BTreeMap<String, IndexConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TasksConfig {
    /// Seconds after which an abandoned sweep claim may be taken over.
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: i64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            claim_lease_secs: default_claim_lease_secs(),
        }
    }
}

fn default_claim_lease_secs() -> i64 {
    300
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Tables in the configured SQLite database.
    #[default]
    Database,
    /// Process-local storage. Contents are lost on exit and rebuilt by the
    /// next indexing pass.
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(flatten)]
    pub settings: BackendSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatasourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Document property holding the item language.
    #[serde(default = "default_language_property")]
    pub language_property: String,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.json".to_string()]
}

fn default_language_property() -> String {
    "language".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    pub server: String,
    pub datasource: String,
    #[serde(default)]
    pub options: IndexOptions,
    #[serde(default)]
    pub fields: Vec<Field>,
}

impl Config {
    /// The definition of a configured index.
    pub fn index_def(&self, id: &str) -> Result<IndexDef> {
        let index = self
            .indexes
            .get(id)
            .with_context(|| format!("Unknown index: '{}'", id))?;
        Ok(IndexDef {
            id: id.to_string(),
            server: index.server.clone(),
            datasource: index.datasource.clone(),
            fields: index.fields.clone(),
            options: index.options.clone(),
        })
    }

    /// Every configured index definition, ordered by id.
    pub fn index_defs(&self) -> Result<Vec<IndexDef>> {
        self.indexes.keys().map(|id| self.index_def(id)).collect()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.tasks.claim_lease_secs < 1 {
        bail!("tasks.claim_lease_secs must be >= 1");
    }

    for (id, server) in &config.servers {
        if id.trim().is_empty() {
            bail!("server ids must not be empty");
        }
        if server.settings.min_chars == 0 {
            bail!("servers.{}.min_chars must be >= 1", id);
        }
    }

    for id in config.datasources.keys() {
        if id.is_empty() || id.contains('/') || id.contains(':') {
            bail!("datasource id '{}' must be non-empty and contain no '/' or ':'", id);
        }
    }

    for (id, index) in &config.indexes {
        if !config.servers.contains_key(&index.server) {
            bail!("indexes.{}.server refers to unknown server '{}'", id, index.server);
        }
        if !config.datasources.contains_key(&index.datasource) {
            bail!(
                "indexes.{}.datasource refers to unknown datasource '{}'",
                id,
                index.datasource
            );
        }
        if index.fields.is_empty() {
            bail!("indexes.{} must declare at least one field", id);
        }
        if index.options.cron_limit == 0 {
            bail!("indexes.{}.options.cron_limit must be >= 1", id);
        }
        config
            .index_def(id)?
            .validate()
            .with_context(|| format!("Invalid definition for index '{}'", id))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use search_harness_core::models::FieldType;

    const SAMPLE: &str = r#"
[db]
path = "./data/search.sqlite"

[servers.default]
backend = "database"
min_chars = 3
partial_matches = true

[servers.scratch]
backend = "memory"

[datasources.articles]
root = "./content"

[indexes.content]
server = "default"
datasource = "articles"

[[indexes.content.fields]]
name = "body"
type = "text"
boost = 2.0

[[indexes.content.fields]]
name = "tags"
type = "string"
multi_valued = true
property_path = "meta.tags"
"#;

    fn parse(s: &str) -> Result<Config> {
        let config: Config = toml::from_str(s)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn parses_servers_and_indexes() {
        let config = parse(SAMPLE).unwrap();
        let default = &config.servers["default"];
        assert_eq!(default.backend, BackendKind::Database);
        assert_eq!(default.settings.min_chars, 3);
        assert!(default.settings.partial_matches);
        assert_eq!(config.servers["scratch"].backend, BackendKind::Memory);
        assert_eq!(config.servers["scratch"].settings.min_chars, 1);
        assert_eq!(config.tasks.claim_lease_secs, 300);

        let def = config.index_def("content").unwrap();
        assert_eq!(def.fields[0].field_type, FieldType::Text);
        assert_eq!(def.fields[0].boost, 2.0);
        assert_eq!(def.fields[1].path(), "meta.tags");
        assert!(def.fields[1].multi_valued);
        assert_eq!(config.datasources["articles"].include_globs, vec!["**/*.json"]);
    }

    #[test]
    fn rejects_unknown_server() {
        let broken = SAMPLE.replace("server = \"default\"", "server = \"nope\"");
        let err = parse(&broken).unwrap_err();
        assert!(err.to_string().contains("unknown server"));
    }

    #[test]
    fn rejects_datasource_id_with_slash() {
        let broken = SAMPLE
            .replace("[datasources.articles]", "[datasources.\"a/b\"]")
            .replace("datasource = \"articles\"", "datasource = \"a/b\"");
        assert!(parse(&broken).is_err());
    }

    #[test]
    fn rejects_invalid_field_definition() {
        let broken = SAMPLE.replace("boost = 2.0", "boost = 0.0");
        assert!(parse(&broken).is_err());
    }
}
