//! Secret handling.
//!
//! The Redis URL may carry a password, so it is held as a `SecretString`
//! and only exposed at the point a connection is opened.

pub use secrecy::{ExposeSecret, SecretString};
