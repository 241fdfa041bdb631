//! # Config File Location
//!
//! Resolves which file the engine configuration is read from. The lookup order
//! is: an explicit path, then the `FINSTREAM_CONFIG` environment variable, then
//! `finstream.json` inside `CONFIGS_LOCATION`, and finally `finstream.json` next
//! to the running executable.

use std::env;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// File name searched for when no explicit path is given.
pub const CONFIG_FILE_NAME: &str = "finstream.json";

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_VAR: &str = "FINSTREAM_CONFIG";

/// Environment variable naming the directory that holds configuration files.
pub const CONFIG_DIR_VAR: &str = "CONFIGS_LOCATION";

#[derive(Debug, Error)]
pub enum ConfigPathError {
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    #[error("executable path {0} has no parent directory")]
    NoExecutableDir(PathBuf),
}

/// Picks the configuration file path.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigPathError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Ok(path) = env::var(CONFIG_PATH_VAR) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    if let Ok(dir) = env::var(CONFIG_DIR_VAR) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir).join(CONFIG_FILE_NAME));
        }
    }
    Ok(executable_dir()?.join(CONFIG_FILE_NAME))
}

fn executable_dir() -> Result<PathBuf, ConfigPathError> {
    let exe = env::current_exe()?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or(ConfigPathError::NoExecutableDir(exe))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_path_wins() {
        let path = resolve_config_path(Some(Path::new("/etc/finstream/prod.json"))).unwrap();
        assert_eq!(path, PathBuf::from("/etc/finstream/prod.json"));
    }

    // One test owns both variables so no other test races on them.
    #[test]
    fn test_environment_lookup_order() {
        env::set_var(CONFIG_PATH_VAR, "/srv/finstream/engine.json");
        env::set_var(CONFIG_DIR_VAR, "/srv/configs");
        assert_eq!(
            resolve_config_path(Some(Path::new("cli.json"))).unwrap(),
            PathBuf::from("cli.json")
        );
        assert_eq!(
            resolve_config_path(None).unwrap(),
            PathBuf::from("/srv/finstream/engine.json")
        );

        // Blank counts as unset.
        env::set_var(CONFIG_PATH_VAR, "  ");
        assert_eq!(
            resolve_config_path(None).unwrap(),
            PathBuf::from("/srv/configs").join(CONFIG_FILE_NAME)
        );

        env::remove_var(CONFIG_PATH_VAR);
        env::remove_var(CONFIG_DIR_VAR);
        let fallback = resolve_config_path(None).unwrap();
        assert_eq!(fallback, executable_dir().unwrap().join(CONFIG_FILE_NAME));
    }
}
