//! Command handlers.

pub mod credentials;
pub mod keys;
pub mod profile;
pub mod send;
pub mod upload;

use serde_json::Value;

use crate::cli::{GlobalOpts, OutputFormat};
use crate::error::CliError;

/// Print either the plain rendering or the JSON value, per `--output`.
pub fn emit(global: &GlobalOpts, plain: &str, json: &Value) -> Result<(), CliError> {
    match global.output {
        OutputFormat::Plain => println!("{plain}"),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(json)?),
    }
    Ok(())
}
