//! Secret handling utilities.
//!
//! Re-exports secrecy types used for connection strings in searchq.

pub use secrecy::{ExposeSecret, SecretString};
