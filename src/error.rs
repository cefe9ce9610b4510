//! Typed failures that callers may want to match on.
//!
//! Everything else travels as `anyhow::Error` with context attached; these
//! variants are wrapped in it and recovered with `downcast_ref::<SyncError>()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Rule trees, symlink targets or roots that cannot be used
    #[error("configuration error: {0}")]
    Config(String),

    /// A filter rule or status line the sync tool grammar cannot carry
    #[error("malformed filter rule(s):\n{}", format_rules(.rules))]
    MalformedFilterRule { rules: Vec<String> },

    /// The sync tool failed without producing any status output
    #[error("{tool} exited with {status} and produced no output:\n{}", .stderr.join("\n"))]
    ToolInvocation {
        tool: String,
        status: String,
        stderr: Vec<String>,
    },

    /// The remote listing could not be fetched in full
    #[error("remote listing failed: {0}")]
    Listing(String),
}

fn format_rules(rules: &[String]) -> String {
    rules
        .iter()
        .map(|rule| format!("  {:?}", rule))
        .collect::<Vec<_>>()
        .join("\n")
}
