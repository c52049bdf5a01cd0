//! Configuration from `.env` and the environment.
//!
//! | Variable           | Meaning                                   | Default  |
//! |--------------------|-------------------------------------------|----------|
//! | `DATABASE_URL`     | Postgres connection string                | required |
//! | `REKEY_SCHEMA`     | Schema to re-key                          | `public` |
//! | `REKEY_EXCLUDE`    | Comma-separated tables to leave untouched | none     |
//! | `REKEY_BATCH_SIZE` | Rows per `INSERT` when filling shadows    | `500`    |

use rekey::RekeyConfig;
use rekey::context::DEFAULT_BATCH_SIZE;

/// Everything the CLI needs to start a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_url: String,
    pub rekey: RekeyConfig,
}

impl Config {
    /// Load `.env` (if any), then read the environment.
    ///
    /// `database_url` takes precedence over `DATABASE_URL`.
    pub fn load(database_url: Option<String>) -> Result<Self, ConfigError> {
        // a missing .env is fine
        let _ = dotenvy::dotenv();
        Self::from_lookup(database_url, |key| std::env::var(key).ok())
    }

    pub fn from_lookup(
        database_url: Option<String>,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let database_url = database_url
            .or_else(|| var("DATABASE_URL"))
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::MissingDatabaseUrl)?;

        let schema = var("REKEY_SCHEMA")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "public".to_string());

        let excluded = var("REKEY_EXCLUDE")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let batch_size = match var("REKEY_BATCH_SIZE") {
            None => DEFAULT_BATCH_SIZE,
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(ConfigError::InvalidBatchSize(raw)),
            },
        };

        Ok(Self {
            database_url,
            rekey: RekeyConfig {
                schema,
                excluded,
                batch_size,
            },
        })
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// Neither `--database-url` nor `DATABASE_URL` given
    MissingDatabaseUrl,
    /// `REKEY_BATCH_SIZE` is not a positive integer
    InvalidBatchSize(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingDatabaseUrl => {
                write!(f, "No database URL: set DATABASE_URL or pass --database-url")
            }
            ConfigError::InvalidBatchSize(raw) => {
                write!(f, "REKEY_BATCH_SIZE must be a positive integer, got '{}'", raw)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
