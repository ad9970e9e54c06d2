pub mod channel;
pub mod config;
pub mod error;
pub mod model;

pub use channel::*;
pub use config::Config;
pub use error::*;
pub use model::*;
