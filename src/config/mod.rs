//! Configuration
//!
//! Settings are read from a TOML file and can be overridden from the command line.

mod schema;
mod store;

pub use schema::*;
pub use store::{load_config, parse_config, resolve_config_path, CONFIG_ENV};
