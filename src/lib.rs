pub mod config;
pub mod core;
pub mod logging;
pub mod session;
pub mod transport;
