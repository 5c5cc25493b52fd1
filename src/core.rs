//! Core abstractions for the gateway.
//!
//! This module provides the data model and shared primitives everything
//! else builds on.

pub mod data;
pub mod error;
pub mod ident;
pub mod quality;

pub use data::{Sample, Value, VarId, VarType};
pub use error::{GatewayError, Result};
pub use ident::IdAllocator;
pub use quality::Quality;
