//! Unified configuration for storyforge.
//!
//! Configuration is read from `storyforge.toml` and layered
//! file → environment → CLI. Every section is optional and defaulted.
//!
//! # Configuration File Format
//!
//! ```toml
//! [scheduler]
//! max_concurrent_runs = 2
//!
//! [provider]
//! provider = "openai"
//! model = "gpt-4o-mini"
//! base_url = "https://api.openai.com/v1"
//! api_key_env = "OPENAI_API_KEY"
//! temperature = 0.8
//! max_tokens = 4096
//!
//! [retry]
//! max_retries = 3
//! inactivity_timeout_secs = 90
//!
//! [compression]
//! mode = "auto"          # on | off | auto
//! threshold_chars = 120000
//! max_segments = 12
//!
//! [auto_resume]
//! max_rounds = 2
//!
//! [auto_resume.phases]
//! outline = false
//!
//! [phases.continuation]
//! temperature = 0.9
//!
//! [prompts]
//! "chapter1" = "Write chapter one of {{ title }} ..."
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::compression::{CompressionMode, CompressionSettings};
use crate::phase::{Phase, PromptKey};
use crate::provider::{Credentials, GenerationConfig, GenerationParams, RetryPolicy};

/// Default config file name, looked up in the working directory first.
pub const CONFIG_FILE_NAME: &str = "storyforge.toml";

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
}

fn default_max_concurrent_runs() -> usize {
    2
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
        }
    }
}

/// Default generation settings shared by every phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSection {
    #[serde(default = "default_provider_id")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Inline API key; takes precedence over `api_key_env`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_provider_id() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            provider: default_provider_id(),
            model: default_model(),
            base_url: None,
            api_key_env: default_api_key_env(),
            api_key: None,
            system_prompt: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
        }
    }
}

/// Per-phase generation overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseOverride {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Auto-resume policy after a length cutoff.
///
/// Eligibility is flag-driven for every generation phase. Phases missing from
/// `phases` are eligible; compression extraction is never resumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoResumePolicy {
    #[serde(default = "default_auto_resume_rounds")]
    pub max_rounds: u32,
    /// Per-phase eligibility flags keyed by phase name
    #[serde(default)]
    pub phases: BTreeMap<String, bool>,
}

fn default_auto_resume_rounds() -> u32 {
    2
}

impl Default for AutoResumePolicy {
    fn default() -> Self {
        Self {
            max_rounds: default_auto_resume_rounds(),
            phases: BTreeMap::new(),
        }
    }
}

impl AutoResumePolicy {
    pub fn is_eligible(&self, phase: Phase) -> bool {
        if phase == Phase::Compression {
            return false;
        }
        self.phases.get(phase.as_str()).copied().unwrap_or(true)
    }
}

/// Breakdown phase settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakdownSettings {
    /// Chapters covered by one chunk stage
    #[serde(default = "default_chapters_per_chunk")]
    pub chapters_per_chunk: u32,
    /// Target chapter count used when the session does not set one
    #[serde(default = "default_target_chapters")]
    pub default_target_chapters: u32,
}

fn default_chapters_per_chunk() -> u32 {
    10
}

fn default_target_chapters() -> u32 {
    30
}

impl Default for BreakdownSettings {
    fn default() -> Self {
        Self {
            chapters_per_chunk: default_chapters_per_chunk(),
            default_target_chapters: default_target_chapters(),
        }
    }
}

/// Consistency checker settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsistencySettings {
    /// Run the model-augmented pass after the rule pass
    #[serde(default)]
    pub model_check: bool,
    /// Model used for the review; defaults to the continuation model
    #[serde(default)]
    pub model: Option<String>,
}

/// Read-side view of the configuration used by the pipeline.
pub trait ConfigResolver: Send + Sync {
    fn generation(&self, phase: Phase) -> GenerationConfig;
    fn consistency_generation(&self) -> GenerationConfig;
    /// Template override for `key`; `None` selects the built-in template.
    fn prompt_template(&self, key: PromptKey) -> Option<String>;
    fn compression(&self) -> CompressionSettings;
    fn auto_resume(&self) -> AutoResumePolicy;
    fn breakdown(&self) -> BreakdownSettings;
    fn consistency(&self) -> ConsistencySettings;
    fn retry(&self) -> RetryPolicy;
}

/// The complete storyforge.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoryConfig {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub provider: ProviderSection,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub compression: CompressionSettings,
    #[serde(default)]
    pub auto_resume: AutoResumePolicy,
    #[serde(default)]
    pub breakdown: BreakdownSettings,
    #[serde(default)]
    pub consistency: ConsistencySettings,
    /// Overrides keyed by phase name (`[phases.continuation]`)
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseOverride>,
    #[serde(default)]
    pub prompts: HashMap<String, String>,
}

impl StoryConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse storyforge.toml")
    }

    /// Load from an explicit path, or from the first default location that exists.
    /// Returns the default configuration when nothing is found.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match default_config_paths().into_iter().find(|p| p.exists()) {
            Some(found) => Self::load(&found),
            None => Ok(Self::default()),
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize storyforge.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `STORYFORGE_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(model) = lookup("STORYFORGE_MODEL").filter(|v| !v.trim().is_empty()) {
            self.provider.model = model.trim().to_string();
        }
        if let Some(url) = lookup("STORYFORGE_BASE_URL").filter(|v| !v.trim().is_empty()) {
            self.provider.base_url = Some(url.trim().to_string());
        }
        if let Some(limit) = lookup("STORYFORGE_MAX_CONCURRENT_RUNS")
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            self.scheduler.max_concurrent_runs = limit;
        }
        if let Some(mode) = lookup("STORYFORGE_COMPRESSION_MODE")
            .and_then(|v| v.parse::<CompressionMode>().ok())
        {
            self.compression.mode = mode;
        }
    }

    /// Validate the configuration and return human-readable warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.scheduler.max_concurrent_runs == 0 {
            warnings.push("scheduler.max_concurrent_runs is 0; it will be raised to 1".to_string());
        }
        if self.compression.overlap >= self.compression.chunk_size {
            warnings.push(format!(
                "compression.overlap ({}) must be smaller than compression.chunk_size ({})",
                self.compression.overlap, self.compression.chunk_size
            ));
        }
        if self.compression.max_segments < 2 {
            warnings.push(
                "compression.max_segments below 2 cannot keep both the first and last chunk"
                    .to_string(),
            );
        }
        if self.compression.parallelism == 0 {
            warnings.push("compression.parallelism is 0; it will be raised to 1".to_string());
        }
        if self.breakdown.chapters_per_chunk == 0 {
            warnings.push("breakdown.chapters_per_chunk must be at least 1".to_string());
        }
        if self.resolve_api_key(|key| std::env::var(key).ok()).is_none() {
            warnings.push(format!(
                "No API key configured; set {} or provider.api_key",
                self.provider.api_key_env
            ));
        }
        for key in self.prompts.keys() {
            if !KNOWN_PROMPT_KEYS.contains(&key.as_str()) {
                warnings.push(format!("Unknown prompt key '{}' in [prompts]", key));
            }
        }

        warnings
    }

    fn resolve_api_key(&self, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
        self.provider
            .api_key
            .clone()
            .or_else(|| lookup(&self.provider.api_key_env))
            .filter(|k| !k.trim().is_empty())
    }

    fn build_generation(&self, phase_override: Option<&PhaseOverride>) -> GenerationConfig {
        let base = &self.provider;
        let o = phase_override.cloned().unwrap_or_default();
        GenerationConfig {
            provider: o.provider.unwrap_or_else(|| base.provider.clone()),
            model: o.model.unwrap_or_else(|| base.model.clone()),
            credentials: Credentials {
                api_key: self.resolve_api_key(|key| std::env::var(key).ok()),
                base_url: base.base_url.clone(),
            },
            system_prompt: o.system_prompt.or_else(|| base.system_prompt.clone()),
            params: GenerationParams {
                temperature: o.temperature.or(base.temperature),
                top_p: o.top_p.or(base.top_p),
                max_tokens: o.max_tokens.or(base.max_tokens),
            },
        }
    }
}

const KNOWN_PROMPT_KEYS: &[&str] = &[
    "compression.role_cards",
    "compression.style_guide",
    "compression.plot_ledger",
    "compression.evidence_pack",
    "compression.erotic_pack",
    "analysis",
    "outline.shape",
    "outline.tension",
    "breakdown.meta",
    "breakdown.chunk",
    "chapter1",
    "continuation",
    "consistency.review",
];

/// Candidate config locations: working directory, then the user config dir.
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("storyforge").join(CONFIG_FILE_NAME));
    }
    paths
}

impl ConfigResolver for StoryConfig {
    fn generation(&self, phase: Phase) -> GenerationConfig {
        self.build_generation(self.phases.get(phase.as_str()))
    }

    fn consistency_generation(&self) -> GenerationConfig {
        let mut config = self.build_generation(self.phases.get(Phase::Continuation.as_str()));
        if let Some(model) = &self.consistency.model {
            config.model = model.clone();
        }
        config
    }

    fn prompt_template(&self, key: PromptKey) -> Option<String> {
        self.prompts.get(key.as_str()).cloned()
    }

    fn compression(&self) -> CompressionSettings {
        self.compression.clone()
    }

    fn auto_resume(&self) -> AutoResumePolicy {
        self.auto_resume.clone()
    }

    fn breakdown(&self) -> BreakdownSettings {
        self.breakdown.clone()
    }

    fn consistency(&self) -> ConsistencySettings {
        self.consistency.clone()
    }

    fn retry(&self) -> RetryPolicy {
        self.retry.clone()
    }
}
