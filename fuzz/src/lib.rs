//! Pure in-memory models of the chime protocol for property-based testing.
//!
//! The models mirror the shared-memory primitives without touching real
//! mapped memory, so bolero can explore operation sequences quickly.

pub mod endpoint_model;
pub mod notify_model;
pub mod ring_model;
