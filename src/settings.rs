//! Runtime settings, read from an optional TOML file and `METABLE__*`
//! environment variables (`METABLE__DATABASE__PATH=...`).
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::Result;
use crate::persist::PersistenceMode;
use crate::schema::DEFAULT_META_SUFFIX;

pub const DEFAULT_CONFIG_FILE: &str = "metable.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file; in memory when absent.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetaSettings {
    pub table_suffix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    pub filter: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseSettings,
    pub meta: MetaSettings,
    pub log: LogSettings,
}

impl Settings {
    /// Loads `file`, or `metable.toml` if it exists when no file is given.
    pub fn load(file: Option<&str>) -> Result<Self> {
        let settings = Config::builder()
            .set_default("meta.table_suffix", DEFAULT_META_SUFFIX)?
            .set_default("log.filter", "info")?
            .add_source(File::with_name(file.unwrap_or(DEFAULT_CONFIG_FILE)).required(file.is_some()))
            .add_source(
                Environment::with_prefix("METABLE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
    pub fn persistence_mode(&self) -> PersistenceMode {
        match &self.database.path {
            Some(path) => PersistenceMode::File(path.clone()),
            None => PersistenceMode::InMemory,
        }
    }
    pub fn meta_table_for(&self, table: &str) -> String {
        format!("{}{}", table, self.meta.table_suffix)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseSettings::default(),
            meta: MetaSettings { table_suffix: DEFAULT_META_SUFFIX.to_owned() },
            log: LogSettings { filter: "info".to_owned() },
        }
    }
}
