use crate::process::LaunchSpec;
use crate::pump::LineCodec;
use anyhow::Context;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Timing bounds applied by `Session::stop`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownConfig {
    /// How long the child gets to exit after the `EXIT` token (in milliseconds)
    #[serde(default = "default_exit_timeout_ms")]
    pub exit_timeout_ms: u64,

    /// How long to wait for the child to be reaped after a forced kill (in milliseconds)
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,

    /// How long the line pumps may keep draining once the child is gone (in milliseconds)
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            exit_timeout_ms: default_exit_timeout_ms(),
            kill_timeout_ms: default_kill_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl ShutdownConfig {
    /// Create a ShutdownConfig with the default bounds
    pub fn new() -> Self {
        Self::default()
    }

    /// Short bounds, for children that are expected to exit immediately
    pub fn impatient() -> Self {
        Self {
            exit_timeout_ms: 200,
            kill_timeout_ms: 1_000,
            drain_timeout_ms: 100,
        }
    }

    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.exit_timeout_ms == 0 {
            return Err(anyhow::anyhow!("exit_timeout_ms must be greater than zero"));
        }

        if self.kill_timeout_ms == 0 {
            return Err(anyhow::anyhow!("kill_timeout_ms must be greater than zero"));
        }

        if self.exit_timeout_ms > 60_000 || self.kill_timeout_ms > 60_000 {
            return Err(anyhow::anyhow!(
                "shutdown timeouts should not exceed 60 seconds"
            ));
        }

        if self.drain_timeout_ms > 10_000 {
            return Err(anyhow::anyhow!(
                "drain_timeout_ms should not exceed 10 seconds"
            ));
        }

        Ok(())
    }

    pub fn exit_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_timeout_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// What a line pump does with bytes left without a terminator at end-of-stream
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrailingLinePolicy {
    /// Drop the unterminated remainder
    #[default]
    Discard,
    /// Deliver the remainder as a final line
    Flush,
}

/// Language and persona handed to the child as its two positional arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchProfile {
    pub language: String,
    pub persona: String,
}

impl Default for LaunchProfile {
    fn default() -> Self {
        Self::new("American", "Aria")
    }
}

impl LaunchProfile {
    pub fn new(language: impl Into<String>, persona: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            persona: persona.into(),
        }
    }

    /// Resolve the persona for `language` from an injected table
    pub fn from_table(language: &str, table: &PersonaTable) -> Option<Self> {
        let (language, persona) = table.lookup(language)?;
        Some(Self::new(language, persona))
    }
}

/// Mapping from language selection to persona name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonaTable(BTreeMap<String, String>);

impl Default for PersonaTable {
    fn default() -> Self {
        [
            ("American", "Aria"),
            ("French", "Amélie"),
            ("Spanish", "Sofía"),
            ("German", "Lena"),
            ("Japanese", "Yuki"),
        ]
        .into_iter()
        .collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PersonaTable {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        PersonaTable(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl PersonaTable {
    /// Parse a table from a JSON object of `{"language": "persona"}`
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let table: PersonaTable =
            serde_json::from_str(json).context("Failed to parse persona table")?;
        if table.0.is_empty() {
            return Err(anyhow::anyhow!("persona table must not be empty"));
        }
        Ok(table)
    }

    /// Load a table from a JSON file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read persona table {}", path.display()))?;
        Self::from_json_str(&json)
    }

    /// Case-insensitive lookup returning the canonical language name and its persona
    pub fn lookup(&self, language: &str) -> Option<(&str, &str)> {
        self.0
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(language.trim()))
            .map(|(name, persona)| (name.as_str(), persona.as_str()))
    }

    pub fn persona_for(&self, language: &str) -> Option<&str> {
        self.lookup(language).map(|(_, persona)| persona)
    }

    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn insert(&mut self, language: impl Into<String>, persona: impl Into<String>) {
        self.0.insert(language.into(), persona.into());
    }
}

/// Main session configuration
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(setter(into, strip_option), build_fn(validate = "Self::validate"))]
pub struct SessionConfig {
    /// Interpreter or executable that runs the conversation script
    #[builder(default = "default_interpreter()")]
    pub interpreter: String,
    /// Arguments placed before the script path (`-u` keeps output unbuffered)
    #[builder(default = "default_interpreter_args()")]
    #[builder(setter(custom))]
    pub interpreter_args: Vec<String>,
    #[builder(default = "default_script()")]
    pub script: PathBuf,
    #[builder(default)]
    pub profile: LaunchProfile,
    #[builder(default)]
    pub working_directory: Option<PathBuf>,
    #[builder(default)]
    #[builder(setter(custom))]
    pub env: HashMap<String, String>,
    #[builder(default)]
    pub shutdown: ShutdownConfig,
    #[builder(default)]
    pub trailing_line: TrailingLinePolicy,
    /// Optional cap on output line length; longer lines are dropped whole
    #[builder(default)]
    pub max_line_length: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            interpreter_args: default_interpreter_args(),
            script: default_script(),
            profile: LaunchProfile::default(),
            working_directory: None,
            env: HashMap::new(),
            shutdown: ShutdownConfig::default(),
            trailing_line: TrailingLinePolicy::default(),
            max_line_length: None,
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Arguments passed to the interpreter: its own flags, the script, language, persona
    pub fn launch_args(&self) -> Vec<String> {
        let mut args = self.interpreter_args.clone();
        args.push(self.script.to_string_lossy().into_owned());
        args.push(self.profile.language.clone());
        args.push(self.profile.persona.clone());
        args
    }

    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            command: self.interpreter.clone(),
            args: self.launch_args(),
            working_dir: self.working_directory.clone(),
            env: self.env.clone(),
        }
    }

    pub fn line_codec(&self) -> LineCodec {
        LineCodec::new(self.max_line_length, self.trailing_line)
    }
}

impl SessionConfigBuilder {
    pub fn interpreter_args<S: ToString, I: IntoIterator<Item = S>>(
        &mut self,
        iter: I,
    ) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.interpreter_args = Some(args);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());

        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }

    fn validate(&self) -> Result<(), String> {
        if let Some(interpreter) = &self.interpreter {
            if interpreter.trim().is_empty() {
                return Err("interpreter must not be empty".to_string());
            }
        }

        if let Some(profile) = &self.profile {
            if profile.language.trim().is_empty() || profile.persona.trim().is_empty() {
                return Err("launch profile needs both a language and a persona".to_string());
            }
        }

        if let Some(shutdown) = &self.shutdown {
            shutdown.validate().map_err(|e| e.to_string())?;
        }

        if self.max_line_length == Some(Some(0)) {
            return Err("max_line_length must be greater than zero".to_string());
        }

        Ok(())
    }
}

// Default value functions for serde and the builder
fn default_exit_timeout_ms() -> u64 {
    3_000
}
fn default_kill_timeout_ms() -> u64 {
    2_000
}
fn default_drain_timeout_ms() -> u64 {
    500
}
fn default_interpreter() -> String {
    "python3".to_string()
}
fn default_interpreter_args() -> Vec<String> {
    vec!["-u".to_string()]
}
fn default_script() -> PathBuf {
    PathBuf::from("penpal.py")
}
