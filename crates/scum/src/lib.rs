//! scum - Secret Credentials Utility/Manager
//!
//! Credential profiles (cloud access keys, session credentials, API tokens)
//! live encrypted in a bag on disk. They can be shown, verified against the
//! service that issued them, rotated, or mounted for a limited time as files
//! on an in-memory filesystem.
//!
//! Each entry is sealed with a fresh AES-256-GCM data key; the data key is
//! wrapped to an age X25519 recipient whose identity is itself protected by
//! a passphrase.

pub mod bag;
pub mod config;
pub mod crypt;
pub mod error;
pub mod issuer;
pub mod mount;
pub mod profile;
pub mod prompt;
pub mod session;

pub use bag::Bag;
pub use config::Config;
pub use crypt::Crypt;
pub use error::{Error, IssuerError, Result};
pub use mount::{CancelToken, MountEnd, MountOptions, MountOutcome};
pub use profile::{Capabilities, Profile};
pub use prompt::{Prompter, TerminalPrompter};
pub use session::{EntryOutcome, EntryReport, MountPlan, Session};
