//! Configuration loading and validation for the job store.
//!
//! Config files: `jobstore.toml`, `jobstore.yaml`, or `jobstore.json`
//! Searched in `./` then `~/.config/jobstore/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    error::{Error, Result},
    loader::{apply_env_overrides, config_dir, discover_and_load, load_config, parse_config},
    schema::{JobstoreConfig, MIN_RETENTION_SECS, StorageConfig},
    validate::{Diagnostic, Severity, ValidationResult, validate_config, validate_toml_str},
};
