pub mod config;
pub mod messages;
pub mod signal;

pub use config::*;
pub use messages::*;
pub use signal::*;
