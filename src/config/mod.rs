use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths::Paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub guardian: GuardianConfig,

    #[serde(default)]
    pub reasoning: ReasoningConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Policy knobs consulted by the guardian on every evaluation.
///
/// Passed explicitly into `Guardian::evaluate`; there is no process-wide
/// copy. Call [`GuardianConfig::validate`] after editing by hand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardianConfig {
    /// When false, only the path/system/application layers run.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Escalate CAUTION/HIGH_RISK operations to the reasoning collaborator.
    #[serde(default)]
    pub use_ai_reasoning: bool,

    /// Approve CAUTION verdicts without user confirmation.
    #[serde(default)]
    pub auto_approve_caution: bool,

    /// Classifier confidence below this raises a logic warning.
    #[serde(default = "default_min_confidence")]
    pub min_confidence_threshold: f64,

    /// Built-in OS path matches are CRITICAL (true) or HIGH_RISK (false).
    #[serde(default = "default_true")]
    pub block_system_files: bool,

    /// Built-in application path matches are CRITICAL (true) or HIGH_RISK (false).
    #[serde(default = "default_true")]
    pub block_app_files: bool,

    /// true: ordinary user approval overrides HIGH_RISK.
    /// false: HIGH_RISK additionally needs elevated (admin) approval.
    #[serde(default = "default_true")]
    pub require_user_approval_high_risk: bool,

    /// Extra path prefixes treated as CRITICAL system matches.
    #[serde(default)]
    pub path_blacklist: Vec<String>,

    /// Executor should simulate approved operations.
    #[serde(default)]
    pub dry_run: bool,

    /// Warn when a move would leave less than this much free space (GiB).
    #[serde(default = "default_warn_threshold_gb")]
    pub warn_threshold_gb: f64,

    /// Deleting files larger than this is HIGH_RISK.
    #[serde(default = "default_large_delete_threshold_mb")]
    pub large_delete_threshold_mb: u64,

    /// Overwriting a destination larger than `ratio * source size` is HIGH_RISK.
    #[serde(default = "default_overwrite_size_ratio")]
    pub overwrite_size_ratio: f64,

    /// Destination paths longer than this raise a logic warning.
    #[serde(default = "default_max_path_length")]
    pub max_path_length: usize,

    /// Upper bound for a single filesystem probe.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Upper bound for one reasoning collaborator call.
    #[serde(default = "default_reasoning_timeout_secs")]
    pub reasoning_timeout_secs: u64,

    /// Record SAFE evaluations in the audit log too.
    #[serde(default)]
    pub log_safe_evaluations: bool,

    /// Destinations must resolve inside this directory (unchecked when unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_destination: Option<String>,

    /// Per-directory overrides, longest matching prefix wins.
    #[serde(default)]
    pub folder_policies: Vec<FolderPolicy>,

    /// Category name -> extensions that belong in it (lowercase, no dot).
    #[serde(default = "default_category_extensions")]
    pub category_extensions: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderPolicy {
    pub path: String,

    #[serde(default = "default_true")]
    pub allow_move: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    /// Reasoning backend: "ollama" or "none"
    #[serde(default = "default_reasoning_provider")]
    pub provider: String,

    #[serde(default = "default_ollama_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_ollama_model")]
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "text" (default) or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_min_confidence() -> f64 {
    0.75
}
fn default_warn_threshold_gb() -> f64 {
    1.0
}
fn default_large_delete_threshold_mb() -> u64 {
    100
}
fn default_overwrite_size_ratio() -> f64 {
    2.0
}
fn default_max_path_length() -> usize {
    250 // Windows MAX_PATH is 260
}
fn default_probe_timeout_ms() -> u64 {
    2000
}
fn default_reasoning_timeout_secs() -> u64 {
    30
}
fn default_category_extensions() -> BTreeMap<String, Vec<String>> {
    let table: [(&str, &[&str]); 6] = [
        (
            "documents",
            &[
                "pdf", "doc", "docx", "txt", "rtf", "odt", "md", "xls", "xlsx", "csv", "ppt",
                "pptx",
            ],
        ),
        (
            "pictures",
            &["jpg", "jpeg", "png", "gif", "bmp", "tiff", "webp", "heic", "svg", "raw"],
        ),
        (
            "videos",
            &["mp4", "avi", "mkv", "mov", "wmv", "webm", "m4v"],
        ),
        ("music", &["mp3", "wav", "flac", "aac", "ogg", "m4a", "wma"]),
        ("archives", &["zip", "rar", "7z", "tar", "gz", "bz2", "xz"]),
        ("installers", &["exe", "msi", "dmg", "pkg", "deb", "rpm", "appimage"]),
    ];
    table
        .iter()
        .map(|(category, exts)| {
            (
                category.to_string(),
                exts.iter().map(|e| e.to_string()).collect(),
            )
        })
        .collect()
}
fn default_reasoning_provider() -> String {
    "none".to_string()
}
fn default_ollama_endpoint() -> String {
    "http://localhost:11434".to_string()
}
fn default_ollama_model() -> String {
    "llama3".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            use_ai_reasoning: false,
            auto_approve_caution: false,
            min_confidence_threshold: default_min_confidence(),
            block_system_files: default_true(),
            block_app_files: default_true(),
            require_user_approval_high_risk: default_true(),
            path_blacklist: Vec::new(),
            dry_run: false,
            warn_threshold_gb: default_warn_threshold_gb(),
            large_delete_threshold_mb: default_large_delete_threshold_mb(),
            overwrite_size_ratio: default_overwrite_size_ratio(),
            max_path_length: default_max_path_length(),
            probe_timeout_ms: default_probe_timeout_ms(),
            reasoning_timeout_secs: default_reasoning_timeout_secs(),
            log_safe_evaluations: false,
            base_destination: None,
            folder_policies: Vec::new(),
            category_extensions: default_category_extensions(),
        }
    }
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            provider: default_reasoning_provider(),
            endpoint: default_ollama_endpoint(),
            model: default_ollama_model(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl GuardianConfig {
    /// Reject values no evaluation could be trusted with.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_confidence_threshold) {
            anyhow::bail!(
                "guardian.min_confidence_threshold must be within 0.0..=1.0 (got {})",
                self.min_confidence_threshold
            );
        }
        if !self.overwrite_size_ratio.is_finite() || self.overwrite_size_ratio < 1.0 {
            anyhow::bail!(
                "guardian.overwrite_size_ratio must be >= 1.0 (got {})",
                self.overwrite_size_ratio
            );
        }
        if !self.warn_threshold_gb.is_finite() || self.warn_threshold_gb < 0.0 {
            anyhow::bail!(
                "guardian.warn_threshold_gb must be >= 0 (got {})",
                self.warn_threshold_gb
            );
        }
        if self.max_path_length == 0 {
            anyhow::bail!("guardian.max_path_length must be > 0");
        }
        if self.probe_timeout_ms == 0 {
            anyhow::bail!("guardian.probe_timeout_ms must be > 0");
        }
        if self.reasoning_timeout_secs == 0 {
            anyhow::bail!("guardian.reasoning_timeout_secs must be > 0");
        }
        if let Some(ref base) = self.base_destination
            && !expand_path(base).is_absolute()
        {
            anyhow::bail!("guardian.base_destination must be absolute (got {})", base);
        }
        for policy in &self.folder_policies {
            if policy.path.trim().is_empty() {
                anyhow::bail!("guardian.folder_policies entries need a path");
            }
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn reasoning_timeout(&self) -> Duration {
        Duration::from_secs(self.reasoning_timeout_secs)
    }

    pub fn base_destination_path(&self) -> Option<PathBuf> {
        self.base_destination.as_deref().map(expand_path)
    }

    pub fn blacklist_paths(&self) -> Vec<PathBuf> {
        self.path_blacklist.iter().map(|p| expand_path(p)).collect()
    }

    pub fn large_delete_threshold_bytes(&self) -> u64 {
        self.large_delete_threshold_mb.saturating_mul(1024 * 1024)
    }

    pub fn warn_threshold_bytes(&self) -> u64 {
        (self.warn_threshold_gb * 1024.0 * 1024.0 * 1024.0) as u64
    }
}

/// Expand `~` and return the path as-is otherwise.
pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw.trim()).to_string())
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load from an explicit file, or from the XDG config file when `None`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let paths = Paths::resolve()?;
        paths.ensure_dirs()?;
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| paths.config_file());

        if !path.exists() {
            // Create default config file on first run
            let config = Config {
                paths,
                ..Config::default()
            };
            config.save_with_template_at(&path)?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config.paths = paths;
        config.guardian.validate()?;

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&self.paths.config_file())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;

        Ok(())
    }

    /// Save config with a helpful template (for first-time setup)
    fn save_with_template_at(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, DEFAULT_CONFIG_TEMPLATE)?;
        eprintln!("Created default config at {}", path.display());

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();
        let g = &self.guardian;

        match parts.as_slice() {
            ["guardian", "enabled"] => Ok(g.enabled.to_string()),
            ["guardian", "use_ai_reasoning"] => Ok(g.use_ai_reasoning.to_string()),
            ["guardian", "auto_approve_caution"] => Ok(g.auto_approve_caution.to_string()),
            ["guardian", "min_confidence_threshold"] => Ok(g.min_confidence_threshold.to_string()),
            ["guardian", "block_system_files"] => Ok(g.block_system_files.to_string()),
            ["guardian", "block_app_files"] => Ok(g.block_app_files.to_string()),
            ["guardian", "require_user_approval_high_risk"] => {
                Ok(g.require_user_approval_high_risk.to_string())
            }
            ["guardian", "dry_run"] => Ok(g.dry_run.to_string()),
            ["guardian", "warn_threshold_gb"] => Ok(g.warn_threshold_gb.to_string()),
            ["guardian", "large_delete_threshold_mb"] => Ok(g.large_delete_threshold_mb.to_string()),
            ["guardian", "overwrite_size_ratio"] => Ok(g.overwrite_size_ratio.to_string()),
            ["guardian", "max_path_length"] => Ok(g.max_path_length.to_string()),
            ["guardian", "probe_timeout_ms"] => Ok(g.probe_timeout_ms.to_string()),
            ["guardian", "reasoning_timeout_secs"] => Ok(g.reasoning_timeout_secs.to_string()),
            ["guardian", "log_safe_evaluations"] => Ok(g.log_safe_evaluations.to_string()),
            ["guardian", "base_destination"] => Ok(g.base_destination.clone().unwrap_or_default()),
            ["guardian", "path_blacklist"] => Ok(g.path_blacklist.join(",")),
            ["reasoning", "provider"] => Ok(self.reasoning.provider.clone()),
            ["reasoning", "endpoint"] => Ok(self.reasoning.endpoint.clone()),
            ["reasoning", "model"] => Ok(self.reasoning.model.clone()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            ["logging", "format"] => Ok(self.logging.format.clone()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();
        let g = &mut self.guardian;

        match parts.as_slice() {
            ["guardian", "enabled"] => g.enabled = value.parse()?,
            ["guardian", "use_ai_reasoning"] => g.use_ai_reasoning = value.parse()?,
            ["guardian", "auto_approve_caution"] => g.auto_approve_caution = value.parse()?,
            ["guardian", "min_confidence_threshold"] => {
                g.min_confidence_threshold = value.parse()?
            }
            ["guardian", "block_system_files"] => g.block_system_files = value.parse()?,
            ["guardian", "block_app_files"] => g.block_app_files = value.parse()?,
            ["guardian", "require_user_approval_high_risk"] => {
                g.require_user_approval_high_risk = value.parse()?
            }
            ["guardian", "dry_run"] => g.dry_run = value.parse()?,
            ["guardian", "warn_threshold_gb"] => g.warn_threshold_gb = value.parse()?,
            ["guardian", "large_delete_threshold_mb"] => {
                g.large_delete_threshold_mb = value.parse()?
            }
            ["guardian", "overwrite_size_ratio"] => g.overwrite_size_ratio = value.parse()?,
            ["guardian", "max_path_length"] => g.max_path_length = value.parse()?,
            ["guardian", "probe_timeout_ms"] => g.probe_timeout_ms = value.parse()?,
            ["guardian", "reasoning_timeout_secs"] => g.reasoning_timeout_secs = value.parse()?,
            ["guardian", "log_safe_evaluations"] => g.log_safe_evaluations = value.parse()?,
            ["guardian", "base_destination"] => {
                g.base_destination = Some(value.to_string()).filter(|v| !v.is_empty())
            }
            ["guardian", "path_blacklist"] => {
                g.path_blacklist = value
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            }
            ["reasoning", "provider"] => self.reasoning.provider = value.to_string(),
            ["reasoning", "endpoint"] => self.reasoning.endpoint = value.to_string(),
            ["reasoning", "model"] => self.reasoning.model = value.to_string(),
            ["logging", "level"] => self.logging.level = value.to_string(),
            ["logging", "format"] => self.logging.format = value.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        self.guardian.validate()
    }
}

/// Default config template with helpful comments (used for first-time setup)
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Safety Guardian Configuration
# Auto-created on first run. Edit as needed.

[guardian]
enabled = true
use_ai_reasoning = false
auto_approve_caution = false
min_confidence_threshold = 0.75
block_system_files = true
block_app_files = true

# true: user approval overrides HIGH_RISK verdicts
# false: HIGH_RISK additionally needs elevated (admin) approval
require_user_approval_high_risk = true

dry_run = false
warn_threshold_gb = 1.0
large_delete_threshold_mb = 100
overwrite_size_ratio = 2.0
max_path_length = 250
probe_timeout_ms = 2000
reasoning_timeout_secs = 30

# Record SAFE verdicts in the audit log as well
log_safe_evaluations = false

# Destinations must stay inside this directory
# base_destination = "~/Organized"

# Extra prefixes that are never touched
# path_blacklist = ["~/Private", "/mnt/backup"]

# Per-directory overrides
# [[guardian.folder_policies]]
# path = "~/Projects"
# allow_move = false

# Reasoning collaborator for escalated verdicts
[reasoning]
provider = "none"            # none | ollama
endpoint = "http://localhost:11434"
model = "llama3"

[logging]
level = "info"
format = "text"              # text | json
"#;
