//! Common types shared by the key pool and the key-rotating proxy

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
