//! XDG Base Directory Specification compliant path resolution.
//!
//! Every directory is resolved through a three-level fallback:
//! 1. Guardian-specific env var (SAFETY_GUARDIAN_CONFIG_DIR, etc.)
//! 2. XDG env var (XDG_CONFIG_HOME, etc.) via `etcetera`
//! 3. Platform default (~/.config, etc.)
//!
//! All paths are absolute. Relative paths from env vars are ignored per XDG spec.

use anyhow::{Context, Result};
#[cfg(unix)]
use libc::getuid;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "safety-guardian";

/// Resolved directory paths for the entire application.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Config directory: config.toml lives here
    pub config_dir: PathBuf,

    /// State directory: audit log
    pub state_dir: PathBuf,

    /// Runtime directory: destination lock files.
    /// None if no suitable runtime directory is available.
    pub runtime_dir: Option<PathBuf>,
}

impl Paths {
    /// Resolve all paths using real environment variables.
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve paths with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        use etcetera::BaseStrategy;

        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;

        let config_dir = env_or(&env_fn, "SAFETY_GUARDIAN_CONFIG_DIR", || {
            strategy.config_dir().join(APP_DIR)
        });

        let state_dir = env_or(&env_fn, "SAFETY_GUARDIAN_STATE_DIR", || {
            let base_state = strategy.state_dir().unwrap_or_else(|| strategy.data_dir());
            base_state.join(APP_DIR)
        });

        let runtime_dir = resolve_runtime_dir(&env_fn);

        Ok(Self {
            config_dir,
            state_dir,
            runtime_dir,
        })
    }

    /// Config file: config_dir/config.toml
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Audit log: state_dir/guardian.audit.jsonl
    pub fn audit_log(&self) -> PathBuf {
        self.state_dir.join(crate::safety::AUDIT_FILENAME)
    }

    /// Destination lock files (in runtime_dir, falls back to state_dir)
    pub fn locks_dir(&self) -> PathBuf {
        self.runtime_dir
            .as_ref()
            .unwrap_or(&self.state_dir)
            .join("locks")
    }

    /// Create all directories with appropriate permissions.
    pub fn ensure_dirs(&self) -> Result<()> {
        create_dir_with_mode(&self.config_dir)?;
        create_dir_with_mode(&self.state_dir)?;

        if let Some(ref runtime) = self.runtime_dir {
            create_dir_with_mode(runtime)?;
        }

        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::resolve().unwrap_or_else(|_| {
            // Emergency fallback, should never happen in practice
            let home = etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("."));
            Self {
                config_dir: home.join(".config").join(APP_DIR),
                state_dir: home.join(".local").join("state").join(APP_DIR),
                runtime_dir: None,
            }
        })
    }
}

/// Resolve an env var with fallback. Ignores empty and relative paths per XDG spec.
fn env_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .filter(|p| p.is_absolute()) // XDG spec: ignore relative paths
        .unwrap_or_else(default)
}

/// Resolve runtime directory.
fn resolve_runtime_dir<F>(env_fn: &F) -> Option<PathBuf>
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    if let Ok(dir) = env_fn("XDG_RUNTIME_DIR")
        && !dir.is_empty()
    {
        let path = PathBuf::from(&dir);
        if path.is_absolute() {
            return Some(path.join(APP_DIR));
        }
    }

    // Fallback: $TMPDIR/safety-guardian-$UID on Unix
    #[cfg(unix)]
    {
        let uid = unsafe { getuid() };
        let tmpdir = env_fn("TMPDIR").unwrap_or_else(|_| "/tmp".to_string());
        Some(PathBuf::from(tmpdir).join(format!("{}-{}", APP_DIR, uid)))
    }

    #[cfg(not(unix))]
    {
        env_fn("TEMP").ok().map(|t| {
            let user = env_fn("USERNAME").unwrap_or_else(|_| "user".into());
            PathBuf::from(t).join(format!("{}-{}", APP_DIR, user))
        })
    }
}

/// Create a directory with mode 0700 per XDG spec.
fn create_dir_with_mode(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}
