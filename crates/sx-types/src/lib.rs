//! # sx-types
//!
//! Core types shared by the samplex crates: samples and their lifecycle,
//! engine messages, solver termination state, checkpoint records, conduit
//! configuration and the error taxonomy.

pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod message;
pub mod sample;
pub mod termination;

pub use checkpoint::*;
pub use config::*;
pub use errors::*;
pub use message::*;
pub use sample::*;
pub use termination::*;
