use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{
    Error, Result,
    env_subst::substitute_env,
    schema::{JobstoreConfig, StorageConfig},
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "jobstore.toml",
    "jobstore.yaml",
    "jobstore.yml",
    "jobstore.json",
];

/// Environment variable that overrides `storage.connection_string`.
pub const CONNECTION_STRING_ENV: &str = "JOBSTORE_CONNECTION_STRING";

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<JobstoreConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| Error::read(path, e))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./jobstore.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/jobstore/jobstore.{toml,yaml,yml,json}` (user-global)
///
/// Falls back to defaults when nothing is found or the file is unreadable.
/// Environment overrides are applied in every case.
pub fn discover_and_load() -> JobstoreConfig {
    let mut config = match find_config_file() {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            load_config(&path).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                JobstoreConfig::default()
            })
        },
        None => {
            debug!("no config file found, using defaults");
            JobstoreConfig::default()
        },
    };
    apply_env_overrides(&mut config.storage);
    config
}

/// Overlay process environment on top of a loaded config.
pub fn apply_env_overrides(storage: &mut StorageConfig) {
    apply_env_overrides_with(storage, |name| std::env::var(name).ok());
}

fn apply_env_overrides_with(storage: &mut StorageConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(url) = lookup(CONNECTION_STRING_ENV).filter(|v| !v.trim().is_empty()) {
        debug!(env = CONNECTION_STRING_ENV, "connection string overridden from environment");
        storage.connection_string = url;
    }
}

/// Find the first config file in standard locations.
pub(crate) fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/jobstore/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "jobstore").map(|d| d.config_dir().to_path_buf())
}

/// Parse raw config text, choosing the format from the file extension.
pub fn parse_config(raw: &str, path: &Path) -> Result<JobstoreConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        other => Err(Error::unsupported_format(other)),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn loads_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[storage]\nconnection_string = \"sqlite://jobs.db\"\nretention_secs = 604800"
        )
        .unwrap();

        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.storage.connection_string, "sqlite://jobs.db");
        assert_eq!(cfg.storage.retention_secs, Some(604_800));
    }

    #[test]
    fn loads_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "storage:\n  connection_string: 'sqlite::memory:'\n  auto_create_schema: false"
        )
        .unwrap();

        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.storage.connection_string, "sqlite::memory:");
        assert!(!cfg.storage.auto_create_schema);
    }

    #[test]
    fn loads_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"storage": {{"max_connections": 2}}}}"#).unwrap();

        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.storage.max_connections, 2);
    }

    #[test]
    fn rejects_unknown_extension() {
        let err = parse_config("", Path::new("jobstore.ini")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat { ref extension } if extension == "ini"));
    }

    #[test]
    fn missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, Error::Read { .. }));
    }

    #[test]
    fn env_override_replaces_connection_string() {
        let mut storage = StorageConfig::with_connection_string("sqlite://file.db");
        apply_env_overrides_with(&mut storage, |name| {
            (name == CONNECTION_STRING_ENV).then(|| "sqlite::memory:".to_string())
        });
        assert_eq!(storage.connection_string, "sqlite::memory:");
    }

    #[test]
    fn blank_env_override_is_ignored() {
        let mut storage = StorageConfig::with_connection_string("sqlite://file.db");
        apply_env_overrides_with(&mut storage, |_| Some("  ".to_string()));
        assert_eq!(storage.connection_string, "sqlite://file.db");
    }
}
