//! Test fixtures and client helpers.
//!
//! Provides clients wired to a [`MemoryServer`] through each transport
//! path, plus seeded data sets for common query scenarios.

use crate::gate::GatedTransport;
use crate::server::MemoryServer;
use nimbus_client::{Client, ClientConfig, HttpTransport, LoopbackClient};
use serde_json::json;
use std::sync::Arc;

/// Application id used by test clients.
pub const TEST_APP_ID: &str = "test-app";

/// Server URL used by test clients.
pub const TEST_SERVER_URL: &str = "http://nimbus.test/1";

/// Class seeded by [`status_fixture`].
pub const FIXTURE_CLASS: &str = "Ticket";

/// Configuration for test clients.
pub fn test_config() -> ClientConfig {
    ClientConfig::new(TEST_APP_ID, TEST_SERVER_URL).with_rest_key("test-rest-key")
}

/// A client talking straight to a fresh in-memory server.
pub fn memory_client() -> (Client, Arc<MemoryServer>) {
    let server = Arc::new(MemoryServer::new());
    let client = Client::with_transport(test_config(), server.clone());
    (client, server)
}

/// A client whose responses wait for [`GatedTransport::release`].
pub fn gated_client() -> (Client, Arc<GatedTransport<Arc<MemoryServer>>>) {
    let server = Arc::new(MemoryServer::new());
    let gated = Arc::new(GatedTransport::new(server));
    let client = Client::with_transport(test_config(), gated.clone());
    (client, gated)
}

/// A client going through the full HTTP encoding path, looped back into
/// an in-memory server.
pub fn http_client() -> (Client, Arc<MemoryServer>) {
    let server = Arc::new(MemoryServer::new());
    let loopback = LoopbackClient::new(TEST_SERVER_URL, server.clone());
    let client = Client::new(test_config(), HttpTransport::new(test_config(), loopback));
    (client, server)
}

/// Seeds five tickets with `status` and `openedAt`:
///
/// | id | status | openedAt |
/// |----|--------|----------|
/// | tkt01 | open | 2024-03-05 |
/// | tkt02 | closed | 2024-03-01 |
/// | tkt03 | open | 2024-03-02 |
/// | tkt04 | open | 2024-03-04 |
/// | tkt05 | closed | 2024-03-03 |
///
/// The two earliest open tickets are `tkt03` then `tkt04`.
pub fn status_fixture(server: &MemoryServer) -> Vec<String> {
    [
        ("tkt01", "open", "2024-03-05"),
        ("tkt02", "closed", "2024-03-01"),
        ("tkt03", "open", "2024-03-02"),
        ("tkt04", "open", "2024-03-04"),
        ("tkt05", "closed", "2024-03-03"),
    ]
    .into_iter()
    .map(|(id, status, day)| {
        server.insert(
            FIXTURE_CLASS,
            json!({
                "objectId": id,
                "status": status,
                "openedAt": { "__type": "Date", "iso": format!("{day}T09:00:00.000Z") },
            }),
        )
    })
    .collect()
}

/// Seeds `count` records of `class_name` with an increasing `n`
/// attribute. Returns their ids in creation order.
pub fn numbered_records(server: &MemoryServer, class_name: &str, count: usize) -> Vec<String> {
    (0..count)
        .map(|n| server.insert(class_name, json!({ "n": n })))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_fixture_seeds_five() {
        let server = MemoryServer::new();
        let ids = status_fixture(&server);
        assert_eq!(ids.len(), 5);
        assert_eq!(server.len(FIXTURE_CLASS), 5);
        assert_eq!(server.record(FIXTURE_CLASS, "tkt03").unwrap()["status"], "open");
    }

    #[test]
    fn numbered_ids_sort_in_creation_order() {
        let server = MemoryServer::new();
        let ids = numbered_records(&server, "Row", 12);
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
