//! Compiler error types.

use std::fmt;

/// Fatal error that aborts a compilation.
///
/// Recoverable diagnostics (bad tokens, unsupported constructs) are printed
/// and counted as the parser runs; this type covers the conditions that
/// prevent producing an output file at all.
#[derive(Debug)]
pub enum CompileError {
    /// File could not be opened, read, or written.
    Io(std::io::Error),
    /// The requested output kind is not implemented.
    Unsupported(String),
    /// One or more diagnostics were recorded; no output was written.
    Failed { errors: u32 },
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Io(e) => write!(f, "i/o error: {}", e),
            CompileError::Unsupported(what) => write!(f, "{}", what),
            CompileError::Failed { errors } => {
                write!(f, "compilation failed with {} error(s)", errors)
            }
        }
    }
}

impl std::error::Error for CompileError {}

impl From<std::io::Error> for CompileError {
    fn from(e: std::io::Error) -> Self {
        CompileError::Io(e)
    }
}

/// Error raised by a code generation operation.
///
/// These are semantic diagnostics (value stack misuse, missing operands).
/// The parser catches them at statement granularity, reports them with the
/// current source position, and resumes.
#[derive(Debug)]
pub struct CodeGenError(pub String);

impl fmt::Display for CodeGenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for CodeGenError {}

impl From<String> for CodeGenError {
    fn from(s: String) -> Self {
        CodeGenError(s)
    }
}

impl From<&str> for CodeGenError {
    fn from(s: &str) -> Self {
        CodeGenError(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = CompileError::Failed { errors: 3 };
        assert_eq!(e.to_string(), "compilation failed with 3 error(s)");
        let e = CodeGenError::from("value stack overflow");
        assert_eq!(e.to_string(), "value stack overflow");
    }
}
