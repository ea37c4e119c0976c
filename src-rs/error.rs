use crate::content::Section;
use std::time::Duration;
use thiserror::Error;

/// Raised when a scale factor is requested before the image can be measured.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum GeometryError {
    #[error("image geometry unavailable (natural {natural_width}x{natural_height})")]
    Unavailable {
        natural_width: f64,
        natural_height: f64,
    },
}

/// Failures of the remote text-generation call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("failed to start generator `{command}`: {message}")]
    Spawn { command: String, message: String },

    #[error("generator timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("generator exited with status {code}: {stderr_tail}")]
    Failed { code: i32, stderr_tail: String },

    #[error("generator returned an empty response")]
    EmptyResponse,

    #[error("generator I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for GenerationError {
    fn from(err: std::io::Error) -> Self {
        GenerationError::Io(err.to_string())
    }
}

/// Failures turning generated text into a usable content record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContentError {
    #[error("remote text generation failed: {0}")]
    Transport(#[from] GenerationError),

    #[error("incomplete content, missing: {}", join_sections(.missing))]
    IncompleteContent { missing: Vec<Section> },
}

fn join_sections(sections: &[Section]) -> String {
    sections
        .iter()
        .map(|section| section.header())
        .collect::<Vec<_>>()
        .join(", ")
}
