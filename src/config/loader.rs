//! Reading and writing the JSON configuration file.
//!
//! A missing file is normal (first run); a broken one is reported and the
//! process continues on defaults rather than refusing to start.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::warn;

use crate::config::schema::Config;

/// Default configuration file location: `~/.voxbot/config.json`.
pub fn get_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".voxbot")
        .join("config.json")
}

/// Load the configuration, falling back to [`Config::default`] when the
/// file is absent, unreadable, or malformed. Pass `None` for the default
/// location.
pub fn load_config(config_path: Option<&Path>) -> Config {
    let path = config_path.map(Path::to_path_buf).unwrap_or_else(get_config_path);

    let contents = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) => {
            if e.kind() != ErrorKind::NotFound {
                warn!("config at {} is unreadable ({}); running on defaults", path.display(), e);
            }
            return Config::default();
        }
    };

    serde_json::from_str(&contents).unwrap_or_else(|e| {
        warn!("config at {} did not parse ({}); running on defaults", path.display(), e);
        Config::default()
    })
}

/// Write the configuration as pretty-printed JSON, creating parent
/// directories as needed. Pass `None` for the default location.
pub fn save_config(config: &Config, config_path: Option<&Path>) -> anyhow::Result<()> {
    let path = config_path.map(Path::to_path_buf).unwrap_or_else(get_config_path);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(config)?;
    fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_nonexistent_returns_default() {
        let path = Path::new("/tmp/voxbot_test_does_not_exist_987654.json");
        let cfg = load_config(Some(path));
        assert_eq!(cfg.server.port, 8790);
    }

    #[test]
    fn test_load_and_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let tmp_path = dir.path().join("nested").join("config_roundtrip.json");

        let mut cfg = Config::default();
        cfg.server.port = 9123;
        save_config(&cfg, Some(&tmp_path)).unwrap();

        let loaded = load_config(Some(&tmp_path));
        assert_eq!(loaded.server.port, 9123);
        assert_eq!(
            loaded.orchestrator.fallback_reply,
            cfg.orchestrator.fallback_reply
        );
    }

    #[test]
    fn test_load_corrupt_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let tmp_path = dir.path().join("corrupt.json");
        fs::write(&tmp_path, "{ not json").unwrap();

        let cfg = load_config(Some(&tmp_path));
        assert_eq!(cfg.server.port, 8790);
    }
}
