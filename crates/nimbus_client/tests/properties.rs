//! Property tests: whatever local edits an entity goes through, a
//! successful save leaves the server holding exactly the local view.

use nimbus_client::{Acl, Value};
use nimbus_testkit::prelude::*;
use proptest::prelude::*;
use std::collections::BTreeMap;

type Snapshot = (BTreeMap<String, Value>, Option<BTreeMap<String, Value>>);

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Applies each round of edits then saves, returning the local and
/// server attributes after every round.
fn edit_and_save(rounds: &[Vec<EntityEdit>]) -> Vec<Snapshot> {
    runtime().block_on(async {
        let (client, server) = memory_client();
        let entity = client.object("Sample").unwrap();
        let mut snapshots = Vec::new();
        for edits in rounds {
            for edit in edits {
                // Incompatible edits are rejected locally and change nothing
                let _ = edit.apply(&entity);
            }
            entity.save().await.unwrap();
            assert!(!entity.is_dirty());
            let id = entity.id().unwrap();
            snapshots.push((entity.attributes(), server.attributes("Sample", &id)));
        }
        snapshots
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn saved_state_matches_server(
        rounds in prop::collection::vec(prop::collection::vec(edit_strategy(), 0..8), 1..4)
    ) {
        for (local, remote) in edit_and_save(&rounds) {
            prop_assert_eq!(Some(local), remote);
        }
    }

    #[test]
    fn acl_survives_save_and_fetch(acl in acl_strategy()) {
        let fetched: Option<Acl> = runtime().block_on(async {
            let (client, _server) = memory_client();
            let entity = client.object("Sample").unwrap();
            entity.set_acl(&acl).unwrap();
            entity.save().await.unwrap();

            let copy = client.object_with_id("Sample", &entity.id().unwrap()).unwrap();
            copy.fetch().await.unwrap();
            copy.get_acl().unwrap()
        });
        let expected = if acl.is_empty() { None } else { Some(acl) };
        prop_assert_eq!(fetched.filter(|a| !a.is_empty()), expected);
    }
}
