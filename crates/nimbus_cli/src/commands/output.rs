//! Rendering of records and values.

use super::CliResult;
use clap::ValueEnum;
use nimbus_client::{Entity, Value};
use nimbus_codec::to_wire;

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// One line per record: object id then `key=value` pairs.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Compact JSON form of a value.
pub fn value(value: &Value) -> CliResult<String> {
    let wire = to_wire(value).map_err(nimbus_client::ClientError::from)?;
    Ok(serde_json::to_string(&wire)?)
}

/// Renders a record.
pub fn entity(entity: &Entity, format: Format) -> CliResult<String> {
    match format {
        Format::Json => Ok(serde_json::to_string_pretty(&entity.to_json()?)?),
        Format::Text => {
            let mut line = entity.id().unwrap_or_else(|| "(unsaved)".to_string());
            for (key, attribute) in entity.attributes() {
                line.push(' ');
                line.push_str(&key);
                line.push('=');
                line.push_str(&value(&attribute)?);
            }
            Ok(line)
        }
    }
}
