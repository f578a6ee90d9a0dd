//! SCGI proxying
//!
//! This module parses backend descriptors and forwards requests to the
//! backends they name, with one bounded relight-and-retry on failure.

pub mod descriptor;
pub mod upstream;

pub use descriptor::ScgiBackendSpec;
pub use upstream::ScgiProxy;
