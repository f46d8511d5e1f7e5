pub mod api;
pub mod config;
pub mod error;
pub mod node;
pub mod registry;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use error::{RelayError, Result};
