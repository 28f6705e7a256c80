use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::command::CommandHandler;
use crate::manifest::{HandlerManifest, Prerequisites};
use crate::registry::NodeRegistry;

/// Token a file must contain before it is parsed as a handler manifest.
pub const HANDLER_MARKER: &str = "[handler]";

/// Counts from one discovery pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    /// `.toml` files visited.
    pub scanned: usize,
    /// Files that carried the marker.
    pub candidates: usize,
    /// Manifests that produced a registered handler.
    pub loaded: usize,
    /// Candidates that failed to read, parse, or meet prerequisites.
    pub skipped: usize,
}

impl NodeRegistry {
    /// Scan directories for handler manifests and register them.
    ///
    /// Runs once per registry; later calls return an empty report. Files
    /// without the marker are never parsed, and broken candidates are
    /// skipped without aborting the scan.
    pub fn discover(&mut self, roots: &[PathBuf]) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        if self.scanned {
            debug!("Handler discovery already ran, skipping");
            return report;
        }
        self.scanned = true;

        for root in roots {
            if !root.is_dir() {
                debug!(path = %root.display(), "Handler directory missing, skipping");
                continue;
            }

            for entry in walkdir::WalkDir::new(root)
                .follow_links(true)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                    continue;
                }
                report.scanned += 1;

                let content = match std::fs::read_to_string(path) {
                    Ok(c) => c,
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "Unreadable file, skipping");
                        continue;
                    }
                };
                if !content.contains(HANDLER_MARKER) {
                    continue;
                }
                report.candidates += 1;

                match self.load_manifest(path, &content) {
                    Ok(registered) => {
                        report.loaded += 1;
                        debug!(path = %path.display(), registered, "Loaded handler manifest");
                    }
                    Err(reason) => {
                        report.skipped += 1;
                        warn!(path = %path.display(), reason = %reason, "Skipping handler manifest");
                    }
                }
            }
        }

        info!(
            scanned = report.scanned,
            loaded = report.loaded,
            skipped = report.skipped,
            "Handler discovery complete"
        );
        report
    }

    /// Register one manifest under all its ids. Returns how many ids were new.
    fn load_manifest(&mut self, path: &Path, content: &str) -> std::result::Result<usize, String> {
        let manifest = HandlerManifest::parse(content).map_err(|e| e.to_string())?;
        check_prerequisites(&manifest.prerequisites)?;

        let handler_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let ids: Vec<String> = manifest.ids().map(String::from).collect();
        let binding = Arc::new(
            CommandHandler::binding(manifest, handler_dir).map_err(|e| e.to_string())?,
        );

        let registered = ids
            .into_iter()
            .filter(|id| self.register_arc(id.clone(), binding.clone()))
            .count();
        Ok(registered)
    }
}

/// Check that a handler's prerequisites are met.
fn check_prerequisites(prereqs: &Prerequisites) -> std::result::Result<(), String> {
    for bin in &prereqs.required_binaries {
        if which(bin).is_none() {
            return Err(format!("required binary '{}' not found on PATH", bin));
        }
    }
    for var in &prereqs.required_env {
        if std::env::var(var).is_err() {
            return Err(format!("required env var '{}' is not set", var));
        }
    }
    Ok(())
}

/// Simple `which` implementation: searches PATH for a binary.
fn which(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var("PATH").ok()?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
