pub mod config;
pub mod pipeline;
mod session;

pub use config::*;
pub use pipeline::*;
