//! Core domain types for the conversion relay.
//!
//! This module contains all the fundamental types used throughout the
//! pipeline, designed to encode invariants via the type system.

pub mod event;
pub mod ids;
pub mod platform;

// Re-export commonly used types at the module level
pub use event::{ConsentFlags, EventOrigin, EventType, LineItem, NormalizedEvent};
pub use ids::{EventId, HolderToken, LockType, Nonce, OrderKey, ShopId};
pub use platform::{Platform, Region};
