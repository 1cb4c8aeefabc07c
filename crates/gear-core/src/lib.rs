pub mod command;
pub mod config;
pub mod label;
pub mod params;
pub mod resources;
pub mod types;

pub use config::{GearConfig, GearSettings, Policy};
pub use types::*;
