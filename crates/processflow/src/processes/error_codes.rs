// src/processes/error_codes.rs
use std::{convert::Infallible, fmt, str::FromStr};

/// Failure codes reported by job handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Timeout,
    DbDeadlock,
    Serialization,
    RateLimit,
    DependencyDown,
    Panic,
    BadPayload,
    UnknownJobType,
    ResourceMissing,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::DbDeadlock => "DB_DEADLOCK",
            Self::Serialization => "SERIALIZATION",
            Self::RateLimit => "RATE_LIMIT",
            Self::DependencyDown => "DEPENDENCY_DOWN",
            Self::Panic => "PANIC",
            Self::BadPayload => "BAD_PAYLOAD",
            Self::UnknownJobType => "UNKNOWN_JOB_TYPE",
            Self::ResourceMissing => "RESOURCE_MISSING",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl FromStr for ErrorCode {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_uppercase().as_str() {
            "TIMEOUT" => Self::Timeout,
            "DB_DEADLOCK" => Self::DbDeadlock,
            "SERIALIZATION" => Self::Serialization,
            "RATE_LIMIT" => Self::RateLimit,
            "DEPENDENCY_DOWN" => Self::DependencyDown,
            "PANIC" => Self::Panic,
            "BAD_PAYLOAD" => Self::BadPayload,
            "UNKNOWN_JOB_TYPE" => Self::UnknownJobType,
            "RESOURCE_MISSING" => Self::ResourceMissing,
            _ => Self::Unknown,
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
