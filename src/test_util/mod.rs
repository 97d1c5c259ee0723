//! Utilities for testing code that sits on top of message channels. They are part of the
//!  crate's regular (non-#[cfg(test)]) code so that applications can use them in their own tests.

pub mod shutdown;
