//! Shared types for the agora sync engine and the application shell.

pub mod models;
pub mod protocol;
pub mod error;

pub use models::*;
pub use protocol::*;
pub use error::*;
