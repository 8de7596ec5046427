//! Common types shared across the ubi-session crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
