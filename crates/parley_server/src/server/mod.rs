#![forbid(unsafe_code)]

pub mod auth;
pub mod broadcast;
pub mod connection;
pub mod directory;
pub mod health;
pub mod presence;
pub mod room_hub;
pub mod router;
pub mod state;




#[cfg(test)]
mod router_tests;
