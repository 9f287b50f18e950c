//! Utilities: string interning, dot-path JSON resolution, runtime constants

pub mod constants;
pub mod intern;
pub mod jsonpath;

pub use constants::*;
pub use intern::intern;
