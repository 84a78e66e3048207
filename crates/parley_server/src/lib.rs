#![forbid(unsafe_code)]

pub mod config;
pub mod server;
pub mod util;

pub use server::broadcast::Broadcaster;
pub use server::state::AppState;
