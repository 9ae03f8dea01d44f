//! Domain models for Gantry.
//!
//! - `GantryError`: the error taxonomy shared by every component
//! - `TriggerEvent`: a request to run the pipeline at one revision

pub mod error;
pub mod event;

pub use error::{GantryError, Result, TransportError, TriggerError};
pub use event::TriggerEvent;
