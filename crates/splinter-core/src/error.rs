//! Error taxonomy for construction, resolution, and structural failures.
//!
//! User-visible query errors (bad literal, unknown column/table/UDTF target)
//! carry an optional source position. Structural errors (dangling node id,
//! cyclic plan graph, missing sink) are compiler defects and are reported
//! through the internal class so callers can tell the two apart.

use crate::pos::SourcePos;
use thiserror::Error;

/// Canonical result for the compiler crates.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A caller passed an id or argument the graph store cannot honor
    /// (e.g. an edge endpoint that is not registered).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Node construction rejected its inputs (malformed literal, empty
    /// name, bad arity). Fatal to that node's creation only.
    #[error("Construction error{}: {msg}", fmt_pos(.pos))]
    Construction { msg: String, pos: Option<SourcePos> },

    /// A name could not be resolved during planning or encoding
    /// (column, table, UDTF placement target). Fatal to planning.
    #[error("Resolution error{}: {msg}", fmt_pos(.pos))]
    Resolution { msg: String, pos: Option<SourcePos> },

    /// A required structural element is absent (e.g. no sink in the graph).
    #[error("Not found: {0}")]
    NotFound(String),

    /// An invariant the compiler itself must uphold was violated.
    #[error("Internal invariant failed: {0}")]
    Internal(String),
}

fn fmt_pos(pos: &Option<SourcePos>) -> String {
    match pos {
        Some(p) => format!(" at {p}"),
        None => String::new(),
    }
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn construction(msg: impl Into<String>, pos: Option<SourcePos>) -> Self {
        Error::Construction {
            msg: msg.into(),
            pos,
        }
    }

    pub fn resolution(msg: impl Into<String>, pos: Option<SourcePos>) -> Self {
        Error::Resolution {
            msg: msg.into(),
            pos,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// True for failures that indicate a compiler defect rather than a
    /// mistake in the user's query.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Error::Internal(_) | Error::NotFound(_) | Error::InvalidArgument(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_render_in_messages() {
        let err = Error::resolution("column 'cpu' not found", Some(SourcePos::new(3, 14)));
        assert_eq!(err.to_string(), "Resolution error at 3:14: column 'cpu' not found");
        assert!(!err.is_internal());
    }

    #[test]
    fn internal_classification() {
        assert!(Error::internal("cycle in plan graph").is_internal());
        assert!(Error::NotFound("no sink".into()).is_internal());
        assert!(!Error::construction("empty column name", None).is_internal());
    }
}
