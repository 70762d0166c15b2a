//! Source positions carried from the query front-end.
//!
//! Nodes record where the parser read them so that construction and
//! resolution errors can point back into the query text.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Line/column of the token a node was built from. 1-based, as reported
/// by the front-end parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePos {
    pub line: u64,
    pub col: u64,
}

impl SourcePos {
    pub const fn new(line: u64, col: u64) -> Self {
        Self { line, col }
    }
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}
