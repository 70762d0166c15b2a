#![forbid(unsafe_code)]
//! splinter-core: shared leaf types for the Splinter query compiler.
//!
//! Everything here is pure data: strongly-typed ids, logical data types,
//! relations (ordered column schemas), the error taxonomy, source positions,
//! and stable hashing. No I/O, no async, no graph logic.

pub mod error;
pub mod hash;
pub mod id;
pub mod pos;
pub mod prelude;
pub mod relation;
pub mod types;
