//! Identifiers, closed enums and limits shared by every gubae crate.

pub mod constants;
pub mod error;
pub mod types;

pub use error::ParseError;
pub use types::*;
