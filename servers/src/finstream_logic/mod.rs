pub mod config;
pub mod edge;
pub mod state;
