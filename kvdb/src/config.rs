//! Engine configuration.
//!
//! This module provides the tuning knobs of the key-value engine and loading
//! them from environment variables.
//!
//! # Environment Variables
//!
//! - `KVDB_DIRECTORY`: Directory holding the segment files (default: `./data`)
//! - `KVDB_MAX_TRLOG_FILE_SIZE`: Transaction log rotation size in bytes (default: 64 MiB)
//! - `KVDB_MAX_INLINE_VALUE_SIZE`: Largest value stored inside the tree (default: 16)
//!
//! # Invariants
//!
//! - `max_trlog_file_size` lies in `MIN_TRLOG_FILE_SIZE..=MAX_TRLOG_FILE_SIZE`,
//!   which keeps every value offset below 2^32
//! - `tree` satisfies [`TreeConfig::is_valid`]

use std::path::PathBuf;

use crate::btree::TreeConfig;

/// Default transaction log size before rotation (64 MiB).
pub const DEFAULT_MAX_TRLOG_FILE_SIZE: u64 = 64 * 1024 * 1024;

/// Smallest accepted transaction log size (64 KiB).
pub const MIN_TRLOG_FILE_SIZE: u64 = 64 * 1024;

/// Largest accepted transaction log size (1 GiB).
pub const MAX_TRLOG_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// Default largest value kept inline in a leaf.
pub const DEFAULT_MAX_INLINE_VALUE_SIZE: usize = 16;

/// Default block size used when compaction reads a source file.
pub const DEFAULT_COMPACTION_BLOCK_SIZE: usize = 128 * 1024;

/// Engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbConfig {
    /// Size at which the transaction log rotates to a new file. Also the
    /// capacity of one pure value file written by compaction.
    pub max_trlog_file_size: u64,
    /// Values up to this many bytes live inside the tree; larger values are
    /// stored in a file and referenced.
    pub max_inline_value_size: usize,
    /// Node fanout of the in-memory tree.
    pub tree: TreeConfig,
    /// Read granularity when compaction loads a source file.
    pub compaction_block_size: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            max_trlog_file_size: DEFAULT_MAX_TRLOG_FILE_SIZE,
            max_inline_value_size: DEFAULT_MAX_INLINE_VALUE_SIZE,
            tree: TreeConfig::default(),
            compaction_block_size: DEFAULT_COMPACTION_BLOCK_SIZE,
        }
    }
}

/// Configuration of the `kvdb` binary.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Directory holding the segment files.
    pub directory: PathBuf,
    /// Engine settings.
    pub db: DbConfig,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A setting has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl DbConfig {
    /// Check the invariants listed in the module docs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_TRLOG_FILE_SIZE..=MAX_TRLOG_FILE_SIZE).contains(&self.max_trlog_file_size) {
            return Err(ConfigError::InvalidValue {
                name: "max_trlog_file_size".to_string(),
                message: format!(
                    "{} is outside {MIN_TRLOG_FILE_SIZE}..={MAX_TRLOG_FILE_SIZE}",
                    self.max_trlog_file_size
                ),
            });
        }
        if !self.tree.is_valid() {
            return Err(ConfigError::InvalidValue {
                name: "tree".to_string(),
                message: format!(
                    "fanout {:?} below minimum ({} entries, {} children)",
                    self.tree,
                    TreeConfig::MIN_LEAF_ENTRIES,
                    TreeConfig::MIN_BRANCH_CHILDREN
                ),
            });
        }
        if self.compaction_block_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "compaction_block_size".to_string(),
                message: "must not be zero".to_string(),
            });
        }
        Ok(())
    }

    /// Load engine settings from environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but does not parse, or if the
    /// resulting configuration fails [`DbConfig::validate`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            max_trlog_file_size: load_number(
                "KVDB_MAX_TRLOG_FILE_SIZE",
                DEFAULT_MAX_TRLOG_FILE_SIZE,
            )?,
            max_inline_value_size: load_number(
                "KVDB_MAX_INLINE_VALUE_SIZE",
                DEFAULT_MAX_INLINE_VALUE_SIZE,
            )?,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }
}

impl CliConfig {
    /// Default segment directory.
    pub const DEFAULT_DIRECTORY: &'static str = "./data";

    /// Load the binary's configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `KVDB_DIRECTORY`: Segment directory (default: `./data`)
    /// - everything read by [`DbConfig::from_env`]
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            directory: Self::load_directory(),
            db: DbConfig::from_env()?,
        })
    }

    /// Load the segment directory from environment.
    ///
    /// Returns the default if not set.
    fn load_directory() -> PathBuf {
        std::env::var("KVDB_DIRECTORY")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(Self::DEFAULT_DIRECTORY))
    }
}

/// Load a numeric setting, returning `default` if the variable is not set.
fn load_number<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => parse_number(name, &value),
        Err(_) => Ok(default),
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        name: name.to_string(),
        message: format!("'{value}' is not a valid number"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = DbConfig::default();
        assert_eq!(config.max_trlog_file_size, 64 * 1024 * 1024);
        assert_eq!(config.compaction_block_size, 128 * 1024);
        assert_eq!(CliConfig::DEFAULT_DIRECTORY, "./data");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range_log_size() {
        let small = DbConfig {
            max_trlog_file_size: 10,
            ..DbConfig::default()
        };
        let large = DbConfig {
            max_trlog_file_size: u64::from(u32::MAX) + 1,
            ..DbConfig::default()
        };

        assert!(matches!(
            small.validate(),
            Err(ConfigError::InvalidValue { name, .. }) if name == "max_trlog_file_size"
        ));
        assert!(large.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_tiny_fanout() {
        let config = DbConfig {
            tree: TreeConfig::new(1, 64),
            ..DbConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number::<u64>("X", " 4096 "), Ok(4096));
        assert_eq!(
            parse_number::<u64>("X", "lots"),
            Err(ConfigError::InvalidValue {
                name: "X".to_string(),
                message: "'lots' is not a valid number".to_string(),
            })
        );
    }

    #[test]
    fn test_unset_variable_keeps_default() {
        assert_eq!(load_number("KVDB_NOT_A_REAL_SETTING", 7u64), Ok(7));
    }

    #[test]
    fn test_config_error_display_invalid() {
        let error = ConfigError::InvalidValue {
            name: "TEST_VAR".to_string(),
            message: "bad value".to_string(),
        };
        assert_eq!(error.to_string(), "invalid value for TEST_VAR: bad value");
    }
}
