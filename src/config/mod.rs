//! Reads the check configuration into a [Graph].
//!
//! The configuration is a keepalived-style list of keywords and blocks:
//!
//! ```text
//! track_file health {
//!     file /run/health
//!     weight 0
//! }
//! virtual_server 10.0.0.1 80 {
//!     real_server 10.0.0.2 80 {
//!         weight 10
//!         FILE_CHECK {
//!             track_file health
//!             weight -5 reverse
//!         }
//!     }
//! }
//! ```
//!
//! No error is fatal: each one is reported as a [Diagnostic], and the
//! offending element is left out of the graph.

mod lexer;
mod parser;

use crate::graph::Graph;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("track_file {0} not found")]
    UnresolvedResource(String),

    #[error("weight {value} must be in [{min}..{max}] inclusive, ignoring")]
    WeightOutOfRange { value: i64, min: i64, max: i64 },

    #[error("unknown option {0}, ignoring")]
    UnknownOption(String),

    #[error("FILE_CHECK has no track_file specified, ignoring")]
    MissingResource,

    #[error("track_file {0} has no file specified, removing")]
    MissingPath(String),

    #[error("{0} is missing an argument")]
    MissingArgument(String),

    #[error("{0} is not a valid number")]
    InvalidNumber(String),

    #[error("{0} is not a valid address")]
    InvalidAddress(String),

    #[error("unknown keyword {0}")]
    UnknownKeyword(String),

    #[error("{0} is not valid here")]
    MisplacedDirective(String),

    #[error("unbalanced braces")]
    UnbalancedBlock,

    #[error("track_file {0} is already defined")]
    DuplicateResource(String),

    #[error("{0} is already defined")]
    DuplicateServer(String),
}

/// A configuration error, and where it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: usize,
    pub error: Error,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.error)
    }
}

/// Parses configuration text.
///
/// The returned graph is not yet assembled; see [Graph::assemble].
pub fn parse(text: &str) -> (Graph, Vec<Diagnostic>) {
    parser::ParserContext::new().run(lexer::tokenize(text))
}
