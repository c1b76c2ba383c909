//! Progress reporting module
//!
//! Terminal rendering of transfer queue events for the command line.

mod reporter;

pub use reporter::*;
