//! scum Core - Shared functionality for the scum tools
//!
//! Secret Credentials Utility/Manager.

pub mod paths;

pub use paths::Paths;
