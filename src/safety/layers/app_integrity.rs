//! Layer 3: installed applications and game libraries.

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{Layer, LayerContext, LayerId};
use crate::safety::pathutil::{self, comparable, normalize};
use crate::safety::probe;
use crate::safety::threat::{Severity, ThreatFinding, ThreatType};

/// Directory fragments that mark an application install, in comparable form.
pub const APP_INDICATORS: &[&str] = &[
    "program files",
    "program files (x86)",
    "programdata",
    "applications",
    "opt",
    "appdata/local/programs",
    "appdata/roaming",
    "appdata/locallow",
    "steamapps",
    "steamlibrary",
    "epic games",
    "gog games",
    "gog galaxy/games",
    "origin games",
    "ea games",
    "ubisoft game launcher/games",
    "riot games",
    "battle.net",
];

const EXECUTABLE_EXTENSIONS: &[&str] = &["exe", "dll", "so", "dylib", "app", "bin", "com", "sys"];

const CONFIG_EXTENSIONS: &[&str] = &["ini", "cfg", "conf", "plist", "manifest", "vdf"];

/// Packed game data that the engine expects at a fixed location.
const GAME_DATA_EXTENSIONS: &[&str] = &[
    "pak", "upk", "uasset", "umap", "assets", "resource", "bundle", "unity3d", "vpk", "bsa",
    "ba2", "esm", "esp", "wad", "pck", "forge",
];

/// Upper bound on directory entries inspected when looking for siblings.
const SIBLING_SCAN_LIMIT: usize = 512;

/// Lexical check for an application file: an install-directory indicator
/// plus a protected extension.
pub fn application_protection(path: &Path) -> Option<String> {
    let cmp = comparable(&normalize(path));
    let ext = pathutil::extension(path)?;

    let kind = if EXECUTABLE_EXTENSIONS.contains(&ext.as_str()) {
        "Executable/library"
    } else if CONFIG_EXTENSIONS.contains(&ext.as_str()) {
        "Configuration file"
    } else if GAME_DATA_EXTENSIONS.contains(&ext.as_str()) {
        "Game data file"
    } else {
        return None;
    };

    let indicator = install_indicator(&cmp)?;
    Some(format!(
        "{} in application directory ({}); moving it will break the application",
        kind, indicator
    ))
}

fn install_indicator(cmp: &str) -> Option<String> {
    let dirs = match cmp.rsplit_once('/') {
        Some((dirs, _)) => format!("{}/", dirs),
        None => return None,
    };

    for indicator in APP_INDICATORS {
        if dirs.contains(&format!("/{}/", indicator)) {
            return Some((*indicator).to_string());
        }
    }

    // macOS bundles: anything below `<name>.app/contents`.
    let parts: Vec<&str> = dirs.split('/').collect();
    parts
        .windows(2)
        .find(|w| w[0].ends_with(".app") && w[1] == "contents")
        .map(|w| format!("{}/contents", w[0]))
}

/// A directory holding both `.exe` and `.dll` files is treated as a
/// portable application folder.
fn is_application_folder(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };

    let mut has_exe = false;
    let mut has_dll = false;
    for entry in entries.flatten().take(SIBLING_SCAN_LIMIT) {
        match pathutil::extension(&entry.path()).as_deref() {
            Some("exe") => has_exe = true,
            Some("dll") => has_dll = true,
            _ => {}
        }
        if has_exe && has_dll {
            return true;
        }
    }
    false
}

pub struct ApplicationIntegrityLayer;

#[async_trait]
impl Layer for ApplicationIntegrityLayer {
    fn id(&self) -> LayerId {
        LayerId::ApplicationIntegrity
    }

    async fn evaluate(&self, ctx: &LayerContext<'_>) -> Result<Vec<ThreatFinding>> {
        let op = ctx.operation;
        let protected = if ctx.config.block_app_files {
            Severity::Critical
        } else {
            Severity::HighRisk
        };
        let mut findings = Vec::new();

        let mut targets = vec![("Source", op.source())];
        if op.kind().writes_destination() {
            targets.push(("Destination", op.destination()));
        }
        for (label, path) in targets {
            if let Some(reason) = application_protection(path) {
                findings.push(ThreatFinding::new(
                    LayerId::ApplicationIntegrity,
                    ThreatType::ApplicationFile,
                    protected,
                    format!("{}: {}. {}", label, reason, path.display()),
                ));
            }
        }

        if findings.is_empty()
            && let Some(parent) = op.source().parent().map(Path::to_path_buf)
        {
            let scanned: PathBuf = parent.clone();
            let app_folder = probe::bounded("scan source directory", ctx.config.probe_timeout(), move || {
                is_application_folder(&scanned)
            })
            .await?;

            if app_folder {
                let protected_ext = pathutil::extension(op.source()).is_some_and(|e| {
                    EXECUTABLE_EXTENSIONS.contains(&e.as_str())
                        || CONFIG_EXTENSIONS.contains(&e.as_str())
                        || GAME_DATA_EXTENSIONS.contains(&e.as_str())
                });
                let severity = if protected_ext { protected } else { Severity::HighRisk };
                findings.push(ThreatFinding::new(
                    LayerId::ApplicationIntegrity,
                    ThreatType::ApplicationFile,
                    severity,
                    format!(
                        "Source is inside an application folder ({} holds .exe and .dll files)",
                        parent.display()
                    ),
                ));
            }
        }

        debug!(findings = findings.len(), "application integrity checked");
        Ok(findings)
    }
}
