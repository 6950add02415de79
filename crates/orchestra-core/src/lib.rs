//! `orchestra-core` — configuration, error and identifier types shared by
//! every orchestra crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::OrchestraConfig;
pub use error::{OrchestraError, Result};
pub use types::{JobId, Platform, ProbeId};
