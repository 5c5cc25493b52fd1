//! Real-time data storage.
//!
//! [`DataCache`] holds the latest sample, a bounded history, and the name
//! for every known variable. It is the only writer-protected sample store
//! in the gateway; every external reader obtains a coherent view through
//! its methods.

mod cache;

pub use cache::{DataCache, HISTORY_DEPTH};
