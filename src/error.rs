//! # Error Severity Classification
//!
//! The brokering core distinguishes several error severities (see §7 of the
//! design spec): a transport hiccup closes one connection, a parse failure
//! disables one node but leaves the session running, and a handful of
//! protocol oddities are simply logged and tolerated. Rather than layering a
//! `thiserror` hierarchy on top of the `anyhow::Error` style already used
//! throughout this codebase, we attach a `Severity` tag to the handful of
//! call sites that need to branch on it.

use std::fmt;

/// How far up the stack a failure should propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The connection must be torn down; nothing on it can be trusted.
    ConnectionFatal,
    /// Only the node instance that triggered this is unusable; the session
    /// continues and its `.apx` file is left open for inspection.
    NodeFatal,
    /// Logged and otherwise ignored (duplicate FileInfo, write to an
    /// unknown address, and similar protocol oddities).
    Tolerated,
}

/// An [`anyhow::Error`] tagged with the severity it should be handled at.
#[derive(Debug)]
pub struct ApxError {
    pub severity: Severity,
    pub source: anyhow::Error,
}

impl ApxError {
    pub fn new(severity: Severity, source: anyhow::Error) -> Self {
        Self { severity, source }
    }

    pub fn connection_fatal(source: anyhow::Error) -> Self {
        Self::new(Severity::ConnectionFatal, source)
    }

    pub fn node_fatal(source: anyhow::Error) -> Self {
        Self::new(Severity::NodeFatal, source)
    }

    pub fn tolerated(source: anyhow::Error) -> Self {
        Self::new(Severity::Tolerated, source)
    }

    pub fn is_connection_fatal(&self) -> bool {
        self.severity == Severity::ConnectionFatal
    }
}

impl fmt::Display for ApxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.severity, self.source)
    }
}

impl std::error::Error for ApxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.source()
    }
}
