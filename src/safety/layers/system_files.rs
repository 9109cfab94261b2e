//! Layer 2: operating-system files, the configured blacklist, and folder
//! policies.
//!
//! Built-in prefixes are kept in [`pathutil::comparable`] form (lowercase,
//! `/` separators, no drive letter) so one list covers `C:\Windows` and
//! `/windows` alike.

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{Layer, LayerContext, LayerId};
use crate::config::GuardianConfig;
use crate::safety::pathutil::{self, comparable, comparable_starts_with, normalize};
use crate::safety::probe;
use crate::safety::threat::{Severity, ThreatFinding, ThreatType};

/// Windows directories whose contents keep the OS bootable.
pub const WINDOWS_SYSTEM_PREFIXES: &[&str] = &[
    "/windows",
    "/programdata/microsoft",
    "/users/default",
    "/users/public",
    "/system volume information",
    "/$recycle.bin",
    "/recovery",
    "/boot",
];

/// Unix and macOS system directories.
pub const UNIX_SYSTEM_PREFIXES: &[&str] = &[
    "/bin",
    "/sbin",
    "/usr/bin",
    "/usr/sbin",
    "/lib",
    "/lib64",
    "/usr/lib",
    "/usr/lib64",
    "/etc",
    "/boot",
    "/sys",
    "/proc",
    "/dev",
    "/var/log",
    "/var/lib/dpkg",
    "/var/lib/rpm",
    "/system",
    "/private/etc",
    "/private/var/db",
];

/// Files that are critical wherever they appear.
pub const SYSTEM_FILENAMES: &[&str] = &[
    "pagefile.sys",
    "hiberfil.sys",
    "swapfile.sys",
    "bootmgr",
    "ntldr",
    "boot.ini",
    "vmlinuz",
    "initrd.img",
];

/// Extensions that are critical when found under a system-looking directory.
pub const SYSTEM_EXTENSIONS: &[&str] = &[
    "sys", "dll", "exe", "drv", "ocx", "so", "dylib", "a", "ini", "cfg", "conf",
];

const SYSTEM_DIR_NAMES: &[&str] = &[
    "windows", "system32", "syswow64", "bin", "sbin", "lib", "lib64",
];

/// Why a path is protected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionMatch {
    pub reason: String,
    /// Built-in matches can be softened by `block_*` flags; configured ones
    /// (blacklist, folder policy) cannot.
    pub built_in: bool,
}

/// Check one path against every system-level protection.
pub fn system_protection(path: &Path, config: &GuardianConfig) -> Option<ProtectionMatch> {
    if let Some(reason) = built_in_system_match(path) {
        return Some(ProtectionMatch {
            reason,
            built_in: true,
        });
    }
    configured_match(path, config).map(|reason| ProtectionMatch {
        reason,
        built_in: false,
    })
}

fn built_in_system_match(path: &Path) -> Option<String> {
    let cmp = comparable(&normalize(path));

    for prefix in WINDOWS_SYSTEM_PREFIXES.iter().chain(UNIX_SYSTEM_PREFIXES) {
        if comparable_starts_with(&cmp, prefix) {
            return Some(format!("File is in system directory {}", prefix));
        }
    }

    let name = cmp.rsplit('/').next().unwrap_or_default();
    if SYSTEM_FILENAMES.contains(&name) {
        return Some(format!("{} is an operating system file", name));
    }

    if let Some(ext) = pathutil::extension(path)
        && SYSTEM_EXTENSIONS.contains(&ext.as_str())
    {
        if let Some(dir) = cmp
            .split('/')
            .rev()
            .skip(1)
            .find(|c| SYSTEM_DIR_NAMES.contains(c))
        {
            return Some(format!(
                ".{} file under system directory '{}'",
                ext, dir
            ));
        }
    }

    None
}

/// Blacklist and folder-policy checks. An explicit `allow_move = false`
/// always blocks; an explicit `allow_move = true` at least as specific as a
/// blacklist entry exempts the path from that entry.
fn configured_match(path: &Path, config: &GuardianConfig) -> Option<String> {
    let cmp = comparable(&normalize(path));

    let policy = config
        .folder_policies
        .iter()
        .map(|p| (comparable(&config_path(&p.path)), p.allow_move))
        .filter(|(prefix, _)| comparable_starts_with(&cmp, prefix))
        .max_by_key(|(prefix, _)| prefix.len());

    if let Some((ref prefix, false)) = policy {
        return Some(format!("Folder policy for {} disallows moves", prefix));
    }

    for entry in config.blacklist_paths() {
        let entry_cmp = comparable(&normalize(&entry));
        if !comparable_starts_with(&cmp, &entry_cmp) {
            continue;
        }
        let exempt = matches!(policy, Some((ref p, true)) if p.len() >= entry_cmp.len());
        if !exempt {
            return Some(format!("Path is blacklisted ({})", entry.display()));
        }
    }

    None
}

fn config_path(raw: &str) -> PathBuf {
    crate::config::expand_path(raw)
}

pub struct SystemProtectionLayer;

#[async_trait]
impl Layer for SystemProtectionLayer {
    fn id(&self) -> LayerId {
        LayerId::SystemProtection
    }

    async fn evaluate(&self, ctx: &LayerContext<'_>) -> Result<Vec<ThreatFinding>> {
        let op = ctx.operation;
        let mut targets: Vec<(&str, PathBuf)> = vec![("Source", op.source().to_path_buf())];
        if op.kind().writes_destination() {
            targets.push(("Destination", op.destination().to_path_buf()));
        }

        let mut findings = Vec::new();
        for (label, path) in targets {
            let mut hit = system_protection(&path, ctx.config);

            // Symlinks into system directories count as system files too. A
            // stalled resolve never hides the lexical match above.
            if hit.is_none() {
                let resolved = probe::bounded("resolve real path", ctx.config.probe_timeout(), {
                    let path = path.clone();
                    move || path.canonicalize().ok()
                })
                .await;
                match resolved {
                    Ok(real) => {
                        hit = real
                            .as_deref()
                            .filter(|r| *r != path.as_path())
                            .and_then(|r| system_protection(r, ctx.config));
                    }
                    Err(e) => {
                        warn!(path = %path.display(), "{}", e);
                        findings.push(ThreatFinding::new(
                            LayerId::SystemProtection,
                            ThreatType::PermissionDenied,
                            Severity::HighRisk,
                            format!(
                                "{}: could not resolve the real path of {}: {}",
                                label,
                                path.display(),
                                e
                            ),
                        ));
                    }
                }
            }

            if let Some(hit) = hit {
                let severity = if hit.built_in && !ctx.config.block_system_files {
                    Severity::HighRisk
                } else {
                    Severity::Critical
                };
                findings.push(ThreatFinding::new(
                    LayerId::SystemProtection,
                    ThreatType::SystemFile,
                    severity,
                    format!("{}: {}. {}", label, hit.reason, path.display()),
                ));
            }
        }

        debug!(findings = findings.len(), "system protection checked");
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FolderPolicy;
    use crate::safety::layers::test_support::{op, run};
    use crate::safety::operation::OperationKind;
    use crate::safety::probe::test_support::StalledPool;

    #[test]
    fn windows_and_unix_prefixes_match() {
        assert!(built_in_system_match(Path::new("/windows/system32/kernel32.dll")).is_some());
        assert!(built_in_system_match(Path::new("C:\\Windows\\System32\\kernel32.dll")).is_some());
        assert!(built_in_system_match(Path::new("/etc/passwd")).is_some());
        assert!(built_in_system_match(Path::new("/usr/lib/libc.so")).is_some());
    }

    #[test]
    fn lookalike_prefixes_do_not_match() {
        assert!(built_in_system_match(Path::new("/library-books/notes.txt")).is_none());
        assert!(built_in_system_match(Path::new("/etcetera/notes.txt")).is_none());
        assert!(built_in_system_match(Path::new("/home/u/Documents/report.pdf")).is_none());
    }

    #[test]
    fn critical_filenames_anywhere() {
        assert!(built_in_system_match(Path::new("D:\\pagefile.sys")).is_some());
    }

    #[test]
    fn extension_under_system_dir_name() {
        assert!(built_in_system_match(Path::new("/opt/tool/bin/helper.so")).is_some());
        assert!(built_in_system_match(Path::new("/home/u/library/notes.ini")).is_none());
    }

    #[test]
    fn blacklist_and_folder_policy() {
        let config = GuardianConfig {
            path_blacklist: vec!["/srv/keep".to_string()],
            folder_policies: vec![
                FolderPolicy {
                    path: "/home/u/Projects".to_string(),
                    allow_move: false,
                },
                FolderPolicy {
                    path: "/srv/keep/inbox".to_string(),
                    allow_move: true,
                },
            ],
            ..GuardianConfig::default()
        };

        let hit = system_protection(Path::new("/srv/keep/a.txt"), &config).unwrap();
        assert!(!hit.built_in);
        assert!(hit.reason.contains("blacklisted"));

        assert!(system_protection(Path::new("/srv/keep/inbox/a.txt"), &config).is_none());

        let hit = system_protection(Path::new("/home/u/Projects/app/main.rs"), &config).unwrap();
        assert!(hit.reason.contains("disallows moves"));
    }

    #[test]
    fn allow_move_never_overrides_built_in() {
        let config = GuardianConfig {
            folder_policies: vec![FolderPolicy {
                path: "/etc".to_string(),
                allow_move: true,
            }],
            ..GuardianConfig::default()
        };
        assert!(system_protection(Path::new("/etc/hosts"), &config).unwrap().built_in);
    }

    #[tokio::test]
    async fn system_source_is_critical() {
        let op = op(
            Path::new("/windows/system32/kernel32.dll"),
            Path::new("/documents/kernel32.dll"),
            OperationKind::Move,
        );
        let findings = run(&SystemProtectionLayer, &op, &GuardianConfig::default()).await;
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].threat, ThreatType::SystemFile);
        assert_eq!(findings[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn system_destination_is_critical_for_moves() {
        let op = op(
            Path::new("/home/u/Downloads/hosts"),
            Path::new("/etc/hosts"),
            OperationKind::Copy,
        );
        let findings = run(&SystemProtectionLayer, &op, &GuardianConfig::default()).await;
        assert_eq!(findings.len(), 1);
        assert!(findings[0].message.starts_with("Destination"));
    }

    #[tokio::test]
    async fn block_system_files_off_downgrades_built_in_only() {
        let config = GuardianConfig {
            block_system_files: false,
            path_blacklist: vec!["/srv/keep".to_string()],
            ..GuardianConfig::default()
        };
        let builtin = op(
            Path::new("/etc/hosts"),
            Path::new("/home/u/hosts"),
            OperationKind::Move,
        );
        let findings = run(&SystemProtectionLayer, &builtin, &config).await;
        assert_eq!(findings[0].severity, Severity::HighRisk);

        let blacklisted = op(
            Path::new("/srv/keep/a.txt"),
            Path::new("/home/u/a.txt"),
            OperationKind::Move,
        );
        let findings = run(&SystemProtectionLayer, &blacklisted, &config).await;
        assert_eq!(findings[0].severity, Severity::Critical);
    }

    #[test]
    fn stalled_resolve_keeps_lexical_critical() {
        let pool = StalledPool::new();
        let config = GuardianConfig {
            probe_timeout_ms: 50,
            ..GuardianConfig::default()
        };
        let op = op(
            Path::new("/etc/passwd"),
            Path::new("/home/u/passwd"),
            OperationKind::Move,
        );
        let findings = pool
            .runtime
            .block_on(run(&SystemProtectionLayer, &op, &config));

        assert!(findings.iter().any(|f| f.threat == ThreatType::SystemFile
            && f.severity == Severity::Critical
            && f.message.starts_with("Source")));
        assert!(findings.iter().any(|f| f.threat == ThreatType::PermissionDenied
            && f.severity == Severity::HighRisk
            && f.message.starts_with("Destination")));
    }
}
