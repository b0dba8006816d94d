//! Language table loading and lookup
//!
//! The language table maps a language name to the pair of environment specs
//! used for its two session kinds. It is read once at process start and shared
//! read-only between every session afterwards, so there is no reload path and
//! no interior mutability here.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::fs;

/// Image and startup command for one execution environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    pub image: String,
    /// Empty means the image's default command.
    #[serde(rename = "cmd", default)]
    pub command: Vec<String>,
}

impl EnvironmentSpec {
    pub fn new(image: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            image: image.into(),
            command,
        }
    }
}

/// The two kinds of session a client can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    /// Interactive terminal, `/term`.
    Terminal,
    /// Upload-and-run, `/run`.
    Run,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Terminal => "term",
            SessionKind::Run => "run",
        }
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a supported language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageProfile {
    #[serde(rename = "term")]
    pub terminal: EnvironmentSpec,
    pub run: EnvironmentSpec,
}

impl LanguageProfile {
    pub fn spec_for(&self, kind: SessionKind) -> &EnvironmentSpec {
        match kind {
            SessionKind::Terminal => &self.terminal,
            SessionKind::Run => &self.run,
        }
    }
}

/// Immutable map of language name to profile.
#[derive(Debug, Clone, Default)]
pub struct LanguageTable {
    languages: HashMap<String, LanguageProfile>,
}

impl LanguageTable {
    /// Build a table from already-parsed profiles, validating it.
    pub fn new(languages: HashMap<String, LanguageProfile>) -> Result<Self, ConfigError> {
        let table = Self { languages };
        table.validate()?;
        Ok(table)
    }

    /// Load the table from a JSON or YAML file.
    ///
    /// `.yaml`/`.yml` files are parsed as YAML and `.json` files as JSON. Any
    /// other extension is tried as JSON first, then YAML.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_json_str(&content).or_else(|json_err| {
                log::debug!(
                    "{} is not JSON ({}), trying YAML",
                    path.display(),
                    json_err
                );
                Self::from_yaml_str(&content)
            }),
        }
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let languages: HashMap<String, LanguageProfile> = serde_json::from_str(content)
            .map_err(|e| ConfigError::Parse(format!("invalid JSON: {}", e)))?;
        Self::new(languages)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let languages: HashMap<String, LanguageProfile> = serde_yaml::from_str(content)
            .map_err(|e| ConfigError::Parse(format!("invalid YAML: {}", e)))?;
        Self::new(languages)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.languages.is_empty() {
            return Err(ConfigError::Validation(
                "at least one language must be configured".to_string(),
            ));
        }

        for (name, profile) in &self.languages {
            if name.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "language names must not be empty".to_string(),
                ));
            }
            for kind in [SessionKind::Terminal, SessionKind::Run] {
                if profile.spec_for(kind).image.trim().is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "language '{}' has an empty {} image",
                        name, kind
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&LanguageProfile> {
        self.languages.get(name)
    }

    pub fn len(&self) -> usize {
        self.languages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }

    /// Languages in name order.
    pub fn sorted(&self) -> BTreeMap<&str, &LanguageProfile> {
        self.languages
            .iter()
            .map(|(name, profile)| (name.as_str(), profile))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    const LANGS_JSON: &str = r#"{
        "python": {
            "term": {"image": "python:3-alpine", "cmd": ["python3"]},
            "run": {"image": "python:3-alpine", "cmd": ["python3", "/code"]}
        },
        "sh": {
            "term": {"image": "alpine"},
            "run": {"image": "alpine", "cmd": ["sh", "/code"]}
        }
    }"#;

    #[test]
    fn test_parse_json_table() {
        let table = LanguageTable::from_json_str(LANGS_JSON).unwrap();
        assert_eq!(table.len(), 2);

        let python = table.get("python").unwrap();
        assert_eq!(python.terminal.image, "python:3-alpine");
        assert_eq!(python.terminal.command, vec!["python3"]);
        assert_eq!(
            python.spec_for(SessionKind::Run).command,
            vec!["python3", "/code"]
        );

        // omitted cmd falls back to the image default
        assert!(table.get("sh").unwrap().terminal.command.is_empty());
        assert!(table.get("cobol").is_none());
    }

    #[test]
    fn test_parse_yaml_table() {
        let yaml = r#"
python:
  term:
    image: python:3-alpine
    cmd: [python3]
  run:
    image: python:3-alpine
    cmd: [python3, /code]
"#;
        let table = LanguageTable::from_yaml_str(yaml).unwrap();
        assert_eq!(table.get("python").unwrap().run.image, "python:3-alpine");
    }

    #[test]
    fn test_sorted_listing() {
        let table = LanguageTable::from_json_str(LANGS_JSON).unwrap();
        let names: Vec<&str> = table.sorted().keys().copied().collect();
        assert_eq!(names, vec!["python", "sh"]);
    }

    #[test]
    fn test_rejects_empty_table() {
        let err = LanguageTable::from_json_str("{}").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_rejects_empty_image() {
        let json = r#"{"go": {"term": {"image": "golang"}, "run": {"image": " "}}}"#;
        let err = LanguageTable::from_json_str(json).unwrap_err();
        assert!(err.to_string().contains("'go' has an empty run image"));
    }

    #[test]
    fn test_rejects_missing_run_spec() {
        let json = r#"{"go": {"term": {"image": "golang"}}}"#;
        assert!(matches!(
            LanguageTable::from_json_str(json),
            Err(ConfigError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_from_file_by_extension() {
        let mut json_file = Builder::new().suffix(".json").tempfile().unwrap();
        write!(json_file, "{}", LANGS_JSON).unwrap();
        let table = LanguageTable::from_file(json_file.path()).await.unwrap();
        assert_eq!(table.len(), 2);

        let mut yaml_file = Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(yaml_file, "ruby:\n  term: {{image: ruby}}\n  run: {{image: ruby, cmd: [ruby, /code]}}").unwrap();
        let table = LanguageTable::from_file(yaml_file.path()).await.unwrap();
        assert_eq!(table.get("ruby").unwrap().run.command, vec!["ruby", "/code"]);
    }

    #[tokio::test]
    async fn test_from_file_unknown_extension_falls_back_to_yaml() {
        let mut file = Builder::new().suffix(".conf").tempfile().unwrap();
        writeln!(file, "lua:\n  term: {{image: lua}}\n  run: {{image: lua}}").unwrap();
        let table = LanguageTable::from_file(file.path()).await.unwrap();
        assert!(table.get("lua").is_some());
    }

    #[tokio::test]
    async fn test_missing_file_is_read_error() {
        let err = LanguageTable::from_file("/nonexistent/langs.json")
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
