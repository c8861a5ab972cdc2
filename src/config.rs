use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

use crate::holder::ExcludedNamespaces;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub upload_interval_secs: u64,
    /// A list, or a comma-separated string such as
    /// `EGRESS_MAPPER_EXCLUDED_NAMESPACES=kube-system,monitoring`.
    #[serde(deserialize_with = "namespace_list")]
    pub excluded_namespaces: Vec<String>,
    pub log_batches: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upload_interval_secs: 60,
            excluded_namespaces: Vec::new(),
            log_batches: true,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("egress-mapper.toml"))
            .merge(Json::file("egress-mapper.json"))
            .merge(Env::prefixed("EGRESS_MAPPER_"));
        let mut config = Self::from_figment(figment)?;

        // Namespaces can also come from a mounted file, one per line
        if let Ok(path) = std::env::var("EGRESS_MAPPER_EXCLUDED_NAMESPACES_FILE") {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path, e))?;
            config
                .excluded_namespaces
                .extend(parse_namespace_list(&contents));
        }

        Ok(config)
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if config.upload_interval_secs == 0 {
            anyhow::bail!("upload_interval_secs must be > 0");
        }

        Ok(config)
    }

    pub fn upload_interval(&self) -> Duration {
        Duration::from_secs(self.upload_interval_secs)
    }

    pub fn excluded(&self) -> ExcludedNamespaces {
        ExcludedNamespaces::new(self.excluded_namespaces.iter().cloned())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NamespaceList {
    List(Vec<String>),
    Joined(String),
}

fn namespace_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match NamespaceList::deserialize(deserializer)? {
        NamespaceList::List(namespaces) => namespaces,
        NamespaceList::Joined(joined) => joined
            .split(',')
            .map(str::trim)
            .filter(|namespace| !namespace.is_empty())
            .map(str::to_string)
            .collect(),
    })
}

/// One namespace per line; blank lines and `#` comments are ignored.
fn parse_namespace_list(contents: &str) -> impl Iterator<Item = String> + '_ {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
}
