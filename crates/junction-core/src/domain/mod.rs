//! Domain vocabulary shared by every junction component.

pub mod digest;
pub mod error;
pub mod signal;

pub use digest::ContentDigest;
pub use error::{JunctionError, Result};
pub use signal::{Signal, SignalInput};
