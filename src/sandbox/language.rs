use std::fmt;

/// Runtimes the sandbox knows how to launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    JavaScript,
    Python,
}

impl Language {
    /// Maps a case-insensitive language tag to a runtime
    pub fn resolve(tag: &str) -> Option<Self> {
        match tag.to_lowercase().as_str() {
            "javascript" | "js" => Some(Self::JavaScript),
            "python" | "py" => Some(Self::Python),
            _ => None,
        }
    }

    /// Name of the source file written into the workspace
    pub fn file_name(self) -> &'static str {
        match self {
            Self::JavaScript => "main.js",
            Self::Python => "main.py",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JavaScript => f.write_str("javascript"),
            Self::Python => f.write_str("python"),
        }
    }
}
