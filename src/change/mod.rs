//! Change module - the unit the approval engine works on
//!
//! Defines changes, their approval records and kind-specific payloads.

mod models;
mod payload;

pub use models::*;
pub use payload::*;
