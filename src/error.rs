//! Error types for Lighthouse broker operations.
//!
//! This module defines the canonical error type used throughout the broker.
//! Every subsystem returns `Result<T, LighthouseError>`; no subsystem defines
//! a parallel error enum of its own.

use std::env;
use std::io;
use thiserror::Error;

/// Canonical error type for all Lighthouse broker operations.
///
/// Variants map onto the error taxonomy kinds rather than implementation
/// types: a caller matching on `Unauthenticated` should never need to know
/// whether the underlying check happened in the authenticator or the
/// session validator.
#[derive(Error, Debug)]
pub enum LighthouseError {
    /// Caller is not in the authenticator. Never auto-authenticated.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Caller lacks the required permission for this operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Session token failed MAC verification or IP/UA binding check.
    #[error("invalid session: {0}")]
    InvalidSession(String),

    /// Schema, size, or encoding failure on a request payload.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Per-agent quota exceeded.
    #[error("rate limited: {0}")]
    RateLimited {
        message: String,
        retry_after_ms: u64,
    },

    /// Referenced entity (elicitation, task, expert, event) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation is invalid given the entity's current state machine state.
    #[error("conflict state: {0}")]
    ConflictState(String),

    /// A bounded wait exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Storage write error, open circuit breaker, or downstream unavailable.
    /// Callers may retry with backoff.
    #[error("transient error: {0}")]
    Transient(String),

    /// Data-at-rest integrity check failed (bad CRC or MAC). Fatal for the
    /// broker process.
    #[error("integrity fault: {0}")]
    IntegrityFault(String),

    /// Monotonic clock regression detected. Fatal for the broker process.
    #[error("clock fault: {0}")]
    ClockFault(String),

    /// Broker configuration failed validation.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// I/O error (auto-converts from `std::io::Error`)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON encode/decode failure (auto-converts from `serde_json::Error`)
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Binary event-log record encode/decode failure (bincode).
    #[error("codec error: {0}")]
    Codec(String),

    /// TOML decode failure (auto-converts from `toml::de::Error`)
    #[error("config decoding error: {0}")]
    TomlDecode(#[from] toml::de::Error),

    /// Environment variable error (auto-converts from `std::env::VarError`)
    #[error("environment variable error: {0}")]
    EnvVarError(#[from] env::VarError),
}

impl LighthouseError {
    /// The error taxonomy kind as a stable, machine-readable string, used in
    /// RPC error envelopes and audit trace entries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Unauthorized(_) => "unauthorized",
            Self::InvalidSession(_) => "invalid_session",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::RateLimited { .. } => "rate_limited",
            Self::NotFound(_) => "not_found",
            Self::ConflictState(_) => "conflict_state",
            Self::Timeout(_) => "timeout",
            Self::Transient(_) => "transient",
            Self::IntegrityFault(_) => "integrity_fault",
            Self::ClockFault(_) => "clock_fault",
            Self::ConfigError(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Encode(_) => "encode_error",
            Self::Codec(_) => "codec_error",
            Self::TomlDecode(_) => "config_decode_error",
            Self::EnvVarError(_) => "env_var_error",
        }
    }

    /// Whether this error kind is a fatal fault that must halt the broker
    /// process rather than be returned to a caller and retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::IntegrityFault(_) | Self::ClockFault(_))
    }

    /// The process exit code this error should produce if it is the reason
    /// the broker process terminates (see SPEC_FULL.md §6 exit codes).
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigError(_) | Self::TomlDecode(_) | Self::EnvVarError(_) => 1,
            Self::IntegrityFault(_) => 2,
            Self::ClockFault(_) => 3,
            _ => 0,
        }
    }
}

pub type Result<T> = std::result::Result<T, LighthouseError>;
