//! Document processing status as reported by the server.
//!
//! The same four values arrive over the push channel (`status`) and the
//! poll channel (`parse_status`).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Server-side processing state of one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    /// Uploaded, waiting for a parser.
    Pending,
    /// Parsing in progress.
    Processing,
    /// Parsing finished successfully. Terminal.
    Completed,
    /// Parsing failed. Terminal.
    Failed,
}

impl DocumentStatus {
    /// `completed` and `failed` end tracking for an entity.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
