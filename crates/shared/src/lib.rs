//! Shared types for the crmsync realtime cache: wire frames, the document
//! model and the fetch job descriptor.

pub mod error;
pub mod models;
pub mod protocol;

pub use error::*;
pub use models::*;
pub use protocol::*;
