pub mod cleanup;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod git;
pub mod guard;
mod id;
pub mod log;
pub mod orchestration;
pub mod retry;
pub mod service;
pub mod store;
pub mod util;
pub mod workspace;

pub use error::{Error, Result};
pub use service::Forge;
