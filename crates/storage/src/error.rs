use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("unique constraint violated: {field} '{value}' already exists")]
    UniqueConstraintViolation { field: &'static str, value: String },

    #[error("referenced row does not exist: {message}")]
    MissingReference { message: String },

    #[error("only one of job type, unique name or query filter may be set")]
    InvalidFilterCombination,

    #[error("invalid paging: page {page}, page size {page_size} (both must be at least 1)")]
    InvalidPaging { page: u32, page_size: u32 },

    #[error("invalid configuration: {}", .diagnostics.join("; "))]
    InvalidConfig { diagnostics: Vec<String> },

    #[error("corrupt data: {message}")]
    DataCorruption { message: String },
}

impl Error {
    #[must_use]
    pub fn unique_name_taken(value: impl Into<String>) -> Self {
        Self::UniqueConstraintViolation {
            field: "unique_name",
            value: value.into(),
        }
    }

    #[must_use]
    pub fn missing_reference(message: impl Into<String>) -> Self {
        Self::MissingReference {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid_config(diagnostics: impl IntoIterator<Item = impl ToString>) -> Self {
        Self::InvalidConfig {
            diagnostics: diagnostics.into_iter().map(|d| d.to_string()).collect(),
        }
    }

    #[must_use]
    pub fn data_corruption(message: impl Into<String>) -> Self {
        Self::DataCorruption {
            message: message.into(),
        }
    }

    /// Caller-side contract violations, raised before any I/O happens.
    #[must_use]
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidFilterCombination | Self::InvalidPaging { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
