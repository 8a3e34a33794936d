pub mod agent;
pub mod command;
pub mod config;
pub mod connection;
pub mod player;

pub use agent::ClientAgent;
pub use config::ClientConfig;
pub use player::{Player, SimulatedPlayer};
