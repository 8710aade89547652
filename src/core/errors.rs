//! CRW-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, CrawlerError>;

/// Top-level error type for the check crawler.
#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error("[CRW-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[CRW-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[CRW-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[CRW-1004] missing configuration option: {section}.{option}")]
    MissingOption { section: String, option: String },

    #[error("[CRW-2001] plugin directory unusable at {path}: {details}")]
    PluginDir { path: PathBuf, details: String },

    #[error("[CRW-2002] cannot load plugin {name}: {details}")]
    PluginLoad { name: String, details: String },

    #[error("[CRW-2003] check {plugin} failed: {details}")]
    CheckFailed { plugin: String, details: String },

    #[error("[CRW-3001] context {context} already registered by pid {pid}")]
    ContextBusy { context: String, pid: u32 },

    #[error("[CRW-3002] detach failure: {details}")]
    Detach { details: String },

    #[error("[CRW-3003] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[CRW-3004] pid {pid} still alive after termination budget")]
    StopTimeout { pid: u32 },

    #[error("[CRW-4001] mail delivery failure: {details}")]
    Mail { details: String },

    #[error("[CRW-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl CrawlerError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "CRW-1001",
            Self::MissingConfig { .. } => "CRW-1002",
            Self::ConfigParse { .. } => "CRW-1003",
            Self::MissingOption { .. } => "CRW-1004",
            Self::PluginDir { .. } => "CRW-2001",
            Self::PluginLoad { .. } => "CRW-2002",
            Self::CheckFailed { .. } => "CRW-2003",
            Self::ContextBusy { .. } => "CRW-3001",
            Self::Detach { .. } => "CRW-3002",
            Self::Io { .. } => "CRW-3003",
            Self::StopTimeout { .. } => "CRW-3004",
            Self::Mail { .. } => "CRW-4001",
            Self::Runtime { .. } => "CRW-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CheckFailed { .. }
                | Self::Io { .. }
                | Self::Mail { .. }
                | Self::StopTimeout { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// The full formatted error text, including the source chain.
    ///
    /// This is the "traceback" fed to the failure monitor: two failures with
    /// the same signature text are treated as the same recurring defect.
    #[must_use]
    pub fn signature(&self) -> String {
        let mut text = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            text.push_str("\n  caused by: ");
            text.push_str(&cause.to_string());
            source = cause.source();
        }
        text
    }
}

impl From<serde_json::Error> for CrawlerError {
    fn from(value: serde_json::Error) -> Self {
        Self::Runtime {
            details: format!("serde_json: {value}"),
        }
    }
}

impl From<toml::de::Error> for CrawlerError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(unix)]
impl From<nix::Error> for CrawlerError {
    fn from(value: nix::Error) -> Self {
        Self::Runtime {
            details: format!("errno: {value}"),
        }
    }
}
