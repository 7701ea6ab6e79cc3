//! Domain layer - Core records and port definitions
//!
//! This module defines the records stored in the coordination store and the
//! ports the relational projection implements.

pub mod ports;

pub use ports::*;
