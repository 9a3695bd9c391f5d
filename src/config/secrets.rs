//! Secret handling utilities.
//!
//! Re-exports the secrecy types callers need to read configured secrets.

pub use secrecy::{ExposeSecret, SecretString};
