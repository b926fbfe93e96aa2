//! Typed build errors.
//!
//! Stage functions return `anyhow::Result`; the variants below are the
//! conditions callers may want to match on after `downcast_ref`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{recipe} pattern is missing")]
    MissingRecipe { recipe: String },

    #[error("sketch cannot be located in build path ({})", path.display())]
    BuildPathEqualsSketchPath { path: PathBuf },

    #[error("invalid quoting, no closing `{quote}` char found in: {text}")]
    InvalidQuoting { quote: char, text: String },

    #[error("{command} exited with {status}")]
    ToolFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("{command} did not finish within {timeout:?}")]
    ToolTimeout { command: String, timeout: Duration },

    #[error("multiple libraries provide {header} with the same priority: {}", candidates.join(", "))]
    AmbiguousLibrary {
        header: String,
        candidates: Vec<String>,
    },

    #[error("invalid FQBN '{fqbn}': {reason}")]
    InvalidFqbn { fqbn: String, reason: String },

    #[error("board {fqbn} not found in any hardware folder")]
    MissingBoard { fqbn: String },

    #[error("no valid sketch found in {}", path.display())]
    NoSketch { path: PathBuf },

    #[error("ctags failed: {message}")]
    CtagsFailed { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_recipe_message() {
        let err = BuildError::MissingRecipe {
            recipe: "recipe.ar.pattern".into(),
        };
        assert_eq!(err.to_string(), "recipe.ar.pattern pattern is missing");
    }

    #[test]
    fn test_ambiguous_library_lists_candidates() {
        let err = BuildError::AmbiguousLibrary {
            header: "Servo.h".into(),
            candidates: vec!["/a/Servo".into(), "/b/Servo".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("Servo.h"));
        assert!(msg.contains("/a/Servo, /b/Servo"));
    }
}
