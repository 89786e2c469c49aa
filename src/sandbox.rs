mod language;
mod output;
mod runner;
mod workspace;

pub use language::Language;
pub use output::CappedBuffer;
pub use runner::ProcessRunner;
pub use workspace::Workspace;

use serde::Serialize;

pub const DEFAULT_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Errors in the request itself, reported before any resource is allocated
///
/// Everything that can go wrong while actually running the program is folded
/// into [`RunOutcome`] instead.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("Missing code")]
    MissingCode,
}

/// One execution attempt
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub language: String,
    pub code: String,
    pub input: String,
    pub timeout_ms: u64,
    pub max_output_bytes: usize,
}

impl RunRequest {
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            code: code.into(),
            input: String::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = input.into();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }
}

/// Result of a single invocation, returned for every executional condition
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl RunOutcome {
    /// Outcome for a language tag with no runtime behind it
    pub fn unsupported(tag: &str) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!("Unsupported language: {tag}"),
            exit_code: None,
            timed_out: false,
            duration_ms: 0,
        }
    }
}
