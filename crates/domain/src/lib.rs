//! Shared types used across B-Node crates: configuration and the error
//! taxonomy. Does not depend on `tokio` or any transport, kept inert so
//! it can be pulled into tests and tooling without pulling in the runtime.

pub mod config;
pub mod error;
