//! Plantsync Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging and error handling for the plantsync workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Logging**: `tracing` subscriber setup driven by `LOG_*` variables
//! - **Types**: identity types shared by the bridge and its tooling
//!   ([`AssetIdentity`], [`MessageKind`])
//!
//! # Example
//!
//! ```no_run
//! use plantsync_common::{AssetIdentity, MessageKind};
//!
//! let kind: MessageKind = "shift_add".parse().unwrap();
//! let asset = AssetIdentity::new("acme", "plant-1", "press-7");
//! assert_eq!(kind.namespace(), "shift_add");
//! assert_eq!(asset.to_string(), "acme/plant-1/press-7");
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use types::{AssetIdentity, MessageKind};
