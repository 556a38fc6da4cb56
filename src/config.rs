use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// tracing filter directive, e.g. "info" or "we0_index=debug".
    pub level: String,
    /// Also write logs to `log/we0-index.log`.
    pub file: bool,
    pub debug: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: false,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Pgvector,
    Qdrant,
    Lite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Openai,
    Jina,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgSettings {
    pub db: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl PgSettings {
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.db
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QdrantSettings {
    /// gRPC endpoint, e.g. "http://localhost:6334".
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiteMode {
    Memory,
    Disk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LiteSettings {
    pub mode: LiteMode,
    /// Storage directory; required in disk mode.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VectorSettings {
    pub platform: Platform,
    #[serde(default)]
    pub code2desc: bool,
    #[serde(default = "default_chat_provider")]
    pub chat_provider: Provider,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embedding_provider")]
    pub embedding_provider: Provider,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default)]
    pub pgvector: Option<PgSettings>,
    #[serde(default)]
    pub qdrant: Option<QdrantSettings>,
    #[serde(default)]
    pub lite: Option<LiteSettings>,
}

fn default_chat_provider() -> Provider {
    Provider::Openai
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_provider() -> Provider {
    Provider::Openai
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_application")]
    pub application: String,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub log: LogSettings,
    pub vector: VectorSettings,
}

fn default_application() -> String {
    "we0-index".to_string()
}

/// YAML file root; the settings live under a `we0-index:` key so one file
/// can host several applications.
#[derive(Debug, Deserialize)]
struct SettingsFile {
    #[serde(rename = "we0-index")]
    we0_index: Settings,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Settings> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| IndexError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Settings> {
        let file: SettingsFile =
            serde_yaml::from_str(text).map_err(|e| IndexError::Config(e.to_string()))?;
        file.we0_index.validate()?;
        Ok(file.we0_index)
    }

    fn validate(&self) -> Result<()> {
        match self.vector.platform {
            Platform::Pgvector if self.vector.pgvector.is_none() => Err(IndexError::Config(
                "vector.platform is pgvector but vector.pgvector is missing".into(),
            )),
            Platform::Qdrant if self.vector.qdrant.is_none() => Err(IndexError::Config(
                "vector.platform is qdrant but vector.qdrant is missing".into(),
            )),
            Platform::Lite => match &self.vector.lite {
                Some(lite) if lite.mode == LiteMode::Disk && lite.path.is_none() => {
                    Err(IndexError::Config(
                        "vector.lite.mode is disk but vector.lite.path is missing".into(),
                    ))
                }
                None => Err(IndexError::Config(
                    "vector.platform is lite but vector.lite is missing".into(),
                )),
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
we0-index:
  application: we0-index
  server:
    host: 127.0.0.1
    port: 9090
  log:
    level: debug
  vector:
    platform: lite
    code2desc: false
    embedding-provider: jina
    embedding-model: jina-embeddings-v2-base-code
    lite:
      mode: memory
"#;

    #[test]
    fn parses_kebab_case_yaml() {
        let s = Settings::from_yaml(SAMPLE).unwrap();
        assert_eq!(s.server.port, 9090);
        assert_eq!(s.log.level, "debug");
        assert_eq!(s.vector.platform, Platform::Lite);
        assert_eq!(s.vector.embedding_provider, Provider::Jina);
        assert_eq!(s.vector.lite.as_ref().unwrap().mode, LiteMode::Memory);
    }

    #[test]
    fn defaults_fill_optional_sections() {
        let s = Settings::from_yaml(
            "we0-index:\n  vector:\n    platform: lite\n    lite:\n      mode: memory\n",
        )
        .unwrap();
        assert_eq!(s.server.host, "0.0.0.0");
        assert_eq!(s.vector.chat_model, "gpt-4o-mini");
        assert_eq!(s.vector.embedding_model, "text-embedding-3-small");
        assert!(!s.vector.code2desc);
    }

    #[test]
    fn missing_backend_block_is_a_config_error() {
        let err = Settings::from_yaml("we0-index:\n  vector:\n    platform: qdrant\n").unwrap_err();
        assert!(matches!(err, IndexError::Config(_)));
    }

    #[test]
    fn disk_mode_requires_path() {
        let err = Settings::from_yaml(
            "we0-index:\n  vector:\n    platform: lite\n    lite:\n      mode: disk\n",
        )
        .unwrap_err();
        assert!(matches!(err, IndexError::Config(_)));
    }
}
