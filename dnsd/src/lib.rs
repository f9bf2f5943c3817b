pub mod cache;
pub mod config;
pub mod forward;
pub mod hosts;
pub mod reqmap;
pub mod server;
pub mod socket;
pub mod wire;
