//! Layered configuration loading.
//!
//! Loads and merges configuration from:
//! 1. Global: `~/.config/connectgate/connectgate.toml`
//! 2. Explicit: the file given with `--config`
//! 3. Environment: `CONNECTGATE_*` variables
//!
//! A malformed global file is reported and ignored; a malformed explicit
//! file is an error, since the user asked for it by name.

use crate::{ConnectgateConfig, SettingsError};
use std::path::{Path, PathBuf};

/// Loads and merges `ConnectgateConfig` from every layer.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the merged configuration from the real global path and process environment.
    ///
    /// # Errors
    /// Returns an error if `explicit` cannot be read or parsed, or an
    /// environment variable is invalid. The result is not validated; call
    /// [`ConnectgateConfig::validate`] before use.
    pub fn load(explicit: Option<&Path>) -> Result<ConnectgateConfig, SettingsError> {
        Self::load_from(&Self::global_config_path(), explicit, |var| {
            std::env::var(var).ok()
        })
    }

    /// Load with an explicit global path and environment source.
    ///
    /// # Errors
    /// Same as [`ConfigLoader::load`].
    pub fn load_from<F>(
        global: &Path,
        explicit: Option<&Path>,
        env: F,
    ) -> Result<ConnectgateConfig, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::load_optional(global);
        if let Some(path) = explicit {
            config = config.merge(ConnectgateConfig::load(path)?);
        }
        config.apply_env_from(env)
    }

    /// Absolute path to the global config file.
    pub fn global_config_path() -> PathBuf {
        Self::global_config_dir()
            .unwrap_or_else(|| PathBuf::from(".connectgate"))
            .join("connectgate.toml")
    }

    fn global_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("connectgate"))
    }

    fn load_optional(path: &Path) -> ConnectgateConfig {
        if !path.exists() {
            return ConnectgateConfig::default();
        }
        match ConnectgateConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                // Warn but don't fail: a broken global file shouldn't block startup.
                eprintln!("connectgate-settings: warning: failed to parse {path:?}: {err}");
                ConnectgateConfig::default()
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{ENV_BIND_ADDR, ENV_MAX_TUNNELS_PER_DEST};
    use serial_test::serial;
    use std::fs;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_missing_files_return_default() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            ConfigLoader::load_from(&dir.path().join("absent.toml"), None, no_env).unwrap();
        assert_eq!(config, ConnectgateConfig::default());
    }

    #[test]
    fn test_explicit_overrides_global() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.toml");
        let explicit = dir.path().join("explicit.toml");
        fs::write(
            &global,
            "[server]\nbind_addr = \"0.0.0.0:8080\"\n[auth]\nrealm = \"global\"\n",
        )
        .unwrap();
        fs::write(&explicit, "[auth]\nrealm = \"explicit\"\n").unwrap();

        let config = ConfigLoader::load_from(&global, Some(&explicit), no_env).unwrap();
        assert_eq!(config.server.bind_addr.as_deref(), Some("0.0.0.0:8080"));
        assert_eq!(config.auth.realm.as_deref(), Some("explicit"));
    }

    #[test]
    fn test_env_overrides_files() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("explicit.toml");
        fs::write(&explicit, "[policy]\nmax_tunnels_per_destination = 8\n").unwrap();

        let config = ConfigLoader::load_from(&dir.path().join("absent.toml"), Some(&explicit), |var| {
            (var == ENV_MAX_TUNNELS_PER_DEST).then(|| "3".to_string())
        })
        .unwrap();
        assert_eq!(config.policy.max_tunnels_per_destination, Some(3));
    }

    #[test]
    fn test_malformed_global_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.toml");
        fs::write(&global, "not valid toml :::").unwrap();

        // Should not panic; should return default
        let config = ConfigLoader::load_from(&global, None, no_env).unwrap();
        assert_eq!(config, ConnectgateConfig::default());
    }

    #[test]
    fn test_malformed_explicit_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("explicit.toml");
        fs::write(&explicit, "not valid toml :::").unwrap();

        let result = ConfigLoader::load_from(&dir.path().join("absent.toml"), Some(&explicit), no_env);
        assert!(matches!(result, Err(SettingsError::ParseError(_))));
    }

    #[test]
    fn test_missing_explicit_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ConfigLoader::load_from(
            &dir.path().join("absent.toml"),
            Some(&dir.path().join("also-absent.toml")),
            no_env,
        );
        assert!(matches!(result, Err(SettingsError::Io(_))));
    }

    #[test]
    fn test_global_config_path_ends_with_connectgate_toml() {
        let path = ConfigLoader::global_config_path();
        assert!(path.ends_with("connectgate/connectgate.toml"));
    }

    #[test]
    #[serial]
    fn test_load_reads_process_environment() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("explicit.toml");
        fs::write(&explicit, "").unwrap();

        std::env::set_var(ENV_BIND_ADDR, "127.0.0.1:3128");
        let result = ConfigLoader::load(Some(&explicit));
        std::env::remove_var(ENV_BIND_ADDR);

        let config = result.unwrap();
        assert_eq!(config.server.bind_addr.as_deref(), Some("127.0.0.1:3128"));
    }
}
