//! Error types for the engine's fallible entry points.
//!
//! Probe failures are deliberately absent: a timed-out or refused probe is a
//! failed [`crate::stats::Sample`], not an error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// A target definition was rejected at ingestion.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// The configuration already holds the maximum number of targets.
    #[error("target limit reached ({limit} targets)")]
    TargetLimit { limit: usize },

    /// A target with the same slug id already exists.
    #[error("duplicate target id '{0}'")]
    DuplicateId(String),

    /// No target with this id exists.
    #[error("no such target '{0}'")]
    UnknownTarget(String),

    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be parsed.
    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}
