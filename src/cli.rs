//! CLI domain: parse, route, output, and presentation only.
//! No load-management logic; the route table drives the dispatcher.

mod output;
mod parse;
mod presentation;
mod route;

pub use output::map_error;
pub use parse::{Cli, Commands};
pub use presentation::{format_config_toml, format_models_json, format_models_text, format_reply};
pub use route::RunContext;
