//! Configuration validation.
//!
//! Produces diagnostics instead of failing on the first problem so a host can
//! report everything wrong with a config file at once. Any `Severity::Error`
//! diagnostic means the storage provider must not be constructed.

use std::{collections::HashMap, fmt};

use crate::schema::{JobstoreConfig, MIN_RETENTION_SECS, StorageConfig};

/// How serious a diagnostic is. Only errors block provider construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One finding against a config key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    /// One of "syntax", "unknown-field", "type-error", "required", "range".
    pub category: &'static str,
    /// Dotted key, e.g. "storage.retention_secs". Empty for file-level issues.
    pub path: String,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.severity, self.category)?;
        if !self.path.is_empty() {
            write!(f, " {}", self.path)?;
        }
        write!(f, ": {}", self.message)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.of(Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.of(Severity::Warning)
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.of(severity).count()
    }

    fn of(&self, severity: Severity) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(move |d| d.severity == severity)
    }

    fn push(
        &mut self,
        severity: Severity,
        category: &'static str,
        path: &str,
        message: impl Into<String>,
    ) {
        self.diagnostics.push(Diagnostic {
            severity,
            category,
            path: path.to_string(),
            message: message.into(),
        });
    }
}

/// Known keys of the config file, per table.
fn known_keys() -> HashMap<&'static str, &'static [&'static str]> {
    HashMap::from([
        ("", &["storage"][..]),
        (
            "storage",
            &[
                "connection_string",
                "retention_secs",
                "retention_interval_secs",
                "auto_create_schema",
                "max_connections",
            ][..],
        ),
    ])
}

/// Semantic checks on an already-parsed storage config.
#[must_use]
pub fn validate_config(config: &StorageConfig) -> ValidationResult {
    let mut result = ValidationResult::default();
    check_storage(config, &mut result);
    result
}

fn check_storage(config: &StorageConfig, result: &mut ValidationResult) {
    if config.connection_string.trim().is_empty() {
        result.push(
            Severity::Error,
            "required",
            "storage.connection_string",
            "no connection string provided",
        );
    }

    if let Some(retention) = config.retention_secs
        && retention < MIN_RETENTION_SECS
    {
        result.push(
            Severity::Error,
            "range",
            "storage.retention_secs",
            format!("retention must be at least one day ({MIN_RETENTION_SECS}s), got {retention}s"),
        );
    }

    if config.retention_interval_secs == 0 {
        result.push(
            Severity::Error,
            "range",
            "storage.retention_interval_secs",
            "sweep interval must be greater than zero",
        );
    } else if config
        .retention_secs
        .is_some_and(|retention| config.retention_interval_secs > retention)
    {
        result.push(
            Severity::Warning,
            "range",
            "storage.retention_interval_secs",
            "sweep interval is longer than the retention window; expired runs will linger",
        );
    }

    if config.max_connections == 0 {
        result.push(
            Severity::Error,
            "range",
            "storage.max_connections",
            "connection pool needs at least one connection",
        );
    }
}

/// Validate raw TOML text: syntax, unknown fields, types, then semantics.
#[must_use]
pub fn validate_toml_str(toml_str: &str) -> ValidationResult {
    let mut result = ValidationResult::default();

    let value: toml::Value = match toml::from_str(toml_str) {
        Ok(v) => v,
        Err(e) => {
            result.push(
                Severity::Error,
                "syntax",
                "",
                format!("TOML syntax error: {e}"),
            );
            return result;
        },
    };

    check_unknown_fields(&value, "", &mut result);

    match toml::from_str::<JobstoreConfig>(toml_str) {
        Ok(config) => check_storage(&config.storage, &mut result),
        Err(e) => result.push(
            Severity::Error,
            "type-error",
            "",
            format!("type error: {e}"),
        ),
    }

    result
}

fn check_unknown_fields(value: &toml::Value, prefix: &str, result: &mut ValidationResult) {
    let toml::Value::Table(table) = value else {
        return;
    };
    let keys = known_keys();
    let Some(allowed) = keys.get(prefix) else {
        return;
    };

    for (key, child) in table {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        if allowed.contains(&key.as_str()) {
            check_unknown_fields(child, &path, result);
            continue;
        }
        let message = match suggest(key, allowed, 3) {
            Some(s) => format!("unknown field (did you mean \"{s}\"?)"),
            None => "unknown field".to_string(),
        };
        result.push(Severity::Error, "unknown-field", &path, message);
    }
}

/// Edit distance, single-row dynamic programming.
fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = (diagonal + usize::from(ca != *cb))
                .min(above + 1)
                .min(row[j] + 1);
            diagonal = above;
        }
    }
    row[b.len()]
}

/// Nearest known key within `max_distance` edits.
fn suggest<'a>(key: &str, known: &[&'a str], max_distance: usize) -> Option<&'a str> {
    known
        .iter()
        .filter_map(|&candidate| {
            let distance = edit_distance(key, candidate);
            (1..=max_distance)
                .contains(&distance)
                .then_some((distance, candidate))
        })
        .min()
        .map(|(_, candidate)| candidate)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn valid() -> StorageConfig {
        StorageConfig::with_connection_string("sqlite::memory:")
    }

    #[test]
    fn default_connection_string_is_rejected() {
        let result = validate_config(&StorageConfig::default());
        assert!(result.has_errors());
        assert_eq!(result.diagnostics[0].path, "storage.connection_string");
    }

    #[test]
    fn minimal_config_is_valid() {
        let result = validate_config(&valid());
        assert!(result.diagnostics.is_empty());
    }

    #[rstest]
    #[case(None, false)]
    #[case(Some(MIN_RETENTION_SECS), false)]
    #[case(Some(MIN_RETENTION_SECS - 1), true)]
    #[case(Some(3600), true)]
    #[case(Some(30 * MIN_RETENTION_SECS), false)]
    fn retention_lower_bound(#[case] retention_secs: Option<u64>, #[case] rejected: bool) {
        let config = StorageConfig {
            retention_secs,
            ..valid()
        };
        assert_eq!(validate_config(&config).has_errors(), rejected);
    }

    #[test]
    fn zero_interval_and_pool_are_errors() {
        let config = StorageConfig {
            retention_interval_secs: 0,
            max_connections: 0,
            ..valid()
        };
        let result = validate_config(&config);
        assert_eq!(result.count(Severity::Error), 2);
    }

    #[test]
    fn interval_longer_than_retention_warns() {
        let config = StorageConfig {
            retention_secs: Some(MIN_RETENTION_SECS),
            retention_interval_secs: MIN_RETENTION_SECS * 2,
            ..valid()
        };
        let result = validate_config(&config);
        assert!(!result.has_errors());
        assert_eq!(result.count(Severity::Warning), 1);
    }

    #[test]
    fn toml_syntax_error() {
        let result = validate_toml_str("[storage");
        assert!(result.has_errors());
        assert_eq!(result.diagnostics[0].category, "syntax");
    }

    #[test]
    fn toml_unknown_field_suggests_fix() {
        let result = validate_toml_str(
            r#"
            [storage]
            connection_string = "sqlite::memory:"
            retention_sec = 86400
            "#,
        );
        let diag = result
            .diagnostics
            .iter()
            .find(|d| d.category == "unknown-field")
            .unwrap();
        assert_eq!(diag.path, "storage.retention_sec");
        assert!(diag.message.contains("retention_secs"));
    }

    #[test]
    fn toml_type_error() {
        let result = validate_toml_str("[storage]\nmax_connections = \"many\"");
        assert!(result.diagnostics.iter().any(|d| d.category == "type-error"));
    }

    #[test]
    fn toml_semantic_errors_surface() {
        let result = validate_toml_str("[storage]\nretention_secs = 60");
        let paths: Vec<_> = result.errors().map(|d| d.path.as_str()).collect();
        assert!(paths.contains(&"storage.connection_string"));
        assert!(paths.contains(&"storage.retention_secs"));
    }

    #[rstest]
    #[case("retention_sec", Some("retention_secs"))]
    #[case("max_conections", Some("max_connections"))]
    #[case("storage", None)]
    #[case("zzz", None)]
    fn suggests_nearby_keys(#[case] key: &str, #[case] expected: Option<&str>) {
        let known = known_keys();
        assert_eq!(suggest(key, known["storage"], 3), expected);
    }

    #[test]
    fn diagnostic_display() {
        let d = Diagnostic {
            severity: Severity::Error,
            category: "range",
            path: "storage.max_connections".into(),
            message: "bad".into(),
        };
        assert_eq!(d.to_string(), "error [range] storage.max_connections: bad");
    }
}
