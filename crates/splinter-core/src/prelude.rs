//! Convenient re-exports for downstream crates.

pub use crate::error::{Error, Result};
pub use crate::hash::{hash_serde, Hash256};
pub use crate::id::{InstanceId, NodeId};
pub use crate::pos::SourcePos;
pub use crate::relation::{ColumnSpec, Relation};
pub use crate::types::{DataType, ScalarValue};
