pub mod api;
pub mod client;
pub mod compliance;
pub mod config;
pub mod error;
pub mod relay;
pub mod supervisor;
pub mod transport;

pub use error::{RelayError, Result};
