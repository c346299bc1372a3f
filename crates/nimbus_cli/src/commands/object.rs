//! Single-record commands.

use super::output::{self, Format};
use super::CliResult;
use nimbus_client::Client;
use tracing::info;

/// Fetches and prints one record.
pub async fn get(client: &Client, class_name: &str, id: &str, format: Format) -> CliResult<()> {
    let entity = client.object_with_id(class_name, id)?;
    entity.fetch().await?;
    println!("{}", output::entity(&entity, format)?);
    Ok(())
}

/// Deletes one record.
pub async fn delete(client: &Client, class_name: &str, id: &str) -> CliResult<()> {
    client.object_with_id(class_name, id)?.destroy().await?;
    info!(class = %class_name, id = %id, "deleted");
    Ok(())
}
