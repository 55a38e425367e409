//! Layered `.env` loading for session working directories.
//!
//! Resolution order, later files overriding earlier ones:
//! `.env` → `.env.local` → `.env.<deployment_mode>`. Missing files are
//! skipped; malformed lines are skipped with a warning. The result is
//! meant to be merged into [`crate::PtyConfig::env`] before spawn.

use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// Load the layered environment for a working directory.
pub fn layered_env(working_dir: &Path, deployment_mode: Option<&str>) -> Vec<(String, String)> {
    let mut merged: BTreeMap<String, String> = BTreeMap::new();

    let mut names = vec![".env".to_string(), ".env.local".to_string()];
    if let Some(mode) = deployment_mode {
        if !mode.is_empty() {
            names.push(format!(".env.{}", mode));
        }
    }

    for name in names {
        let path = working_dir.join(&name);
        if !path.is_file() {
            continue;
        }
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                let mut loaded = 0usize;
                for item in iter {
                    match item {
                        Ok((key, value)) => {
                            merged.insert(key, value);
                            loaded += 1;
                        }
                        Err(e) => {
                            warn!("skipping malformed line in {}: {}", path.display(), e);
                        }
                    }
                }
                debug!("loaded {} entries from {}", loaded, path.display());
            }
            Err(e) => {
                warn!("failed to read {}: {}", path.display(), e);
            }
        }
    }

    merged.into_iter().collect()
}
