//! End-to-end: fetch, detect under-replication, repair, re-fetch
//!
//! One owner key, relay R1 holding record E1 and an empty relay R2. After
//! repair both relays hold E1 under the same id and a second fetch still
//! sees exactly one record.

use std::sync::Arc;

use relaysafe_core::aggregator::{OwnedKey, SecretAggregator};
use relaysafe_core::crypto::EncryptionScheme;
use relaysafe_core::engine::DATABASE_FILE;
use relaysafe_core::secret::encode_secret_event;
use relaysafe_core::{
    EngineConfig, EngineEvent, Keys, MemoryNetwork, RelayConfig, RelayPool, SafeEngine, Storage,
    SyncReconciler,
};
use tempfile::tempdir;

const R1: &str = "wss://r1.test";
const R2: &str = "wss://r2.test";

fn config() -> EngineConfig {
    EngineConfig {
        fetch_timeout_secs: 1,
        publish_timeout_secs: 1,
        pbkdf2_iterations: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_fetch_repair_refetch() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let r1 = network.add_relay(R1);
    let r2 = network.add_relay(R2);

    let keys = Keys::generate();
    let e1 = encode_secret_event(&keys, "Router", "admin/admin", vec![], EncryptionScheme::Current)
        .unwrap();
    r1.insert_raw(e1.clone());

    let config = config();
    let pool = RelayPool::new(Arc::new(network.clone()), &config);
    let relays = RelayConfig::new([R1, R2]).unwrap();
    let aggregator = SecretAggregator::new(pool.clone(), relays.clone(), &config);
    let reconciler = SyncReconciler::new(pool, relays);
    let owned = [OwnedKey {
        key_id: "k".into(),
        keys: keys.clone(),
    }];

    // Fetch: one record on R1 only
    let first = aggregator.fetch(&owned, None).await.unwrap();
    assert_eq!(first.secrets.len(), 1);
    let record = &first.secrets[0];
    assert_eq!(record.id, e1.id);
    assert_eq!(record.relays.iter().collect::<Vec<_>>(), vec![R1]);

    // Detect
    let status = reconciler.status(record);
    assert_eq!(status.missing_relays, vec![R2]);
    assert_eq!(status.replication_percent, 50.0);

    // Repair: verbatim forward from R1
    let report = reconciler.sync_one(record).await;
    assert_eq!(report.source.as_deref(), Some(R1));
    assert_eq!(report.succeeded, vec![R2]);
    assert_eq!(r2.event(&e1.id), Some(e1.clone()));

    // Re-fetch: still one record, now on both relays
    let second = aggregator.fetch(&owned, None).await.unwrap();
    assert_eq!(second.secrets.len(), 1);
    assert_eq!(second.secrets[0].id, e1.id);
    assert_eq!(second.secrets[0].relays.len(), 2);
    assert!(!reconciler.status(&second.secrets[0]).needs_sync());
    assert_eq!(r1.events().len(), 1);
    assert_eq!(r2.events().len(), 1);
}

#[tokio::test]
async fn test_engine_lifecycle_across_restart() {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = tempdir().unwrap();
    let network = MemoryNetwork::new();
    network.add_relay(R1);
    let r2 = network.add_relay(R2);
    r2.set_online(false);

    // Seed a fast configuration before the first open
    {
        let storage = Storage::new(dir.path().join(DATABASE_FILE)).unwrap();
        config().save(&storage).unwrap();
    }

    let event_id = {
        let engine = SafeEngine::open_with(dir.path(), Arc::new(network.clone())).unwrap();
        assert_eq!(engine.data_dir(), Some(dir.path()));
        for url in engine.relays() {
            engine.remove_relay(&url).unwrap();
        }
        engine.add_relay(R1).unwrap();
        engine.add_relay(R2).unwrap();
        engine.create_vault(Some("2468")).unwrap();
        engine.generate_key("Home", Some("#22aa88".into())).unwrap();

        let outcome = engine
            .save("Router", "admin/admin", vec!["network".into()], None)
            .await
            .unwrap();
        assert!(outcome.is_published());
        outcome.event_id().to_string()
    };

    // Reopen: vault and relays persisted, R2 now reachable
    r2.set_online(true);
    let engine = SafeEngine::open_with(dir.path(), Arc::new(network.clone())).unwrap();
    assert!(engine.vault_exists().unwrap());
    assert_eq!(engine.relays(), vec![R1, R2]);
    engine.unlock(Some("2468")).unwrap();
    let mut events = engine.subscribe();

    engine.refresh().await.unwrap();
    let secrets = engine.secrets();
    assert_eq!(secrets.len(), 1);
    assert_eq!(secrets[0].id, event_id);
    assert_eq!(engine.under_replicated().len(), 1);

    let reports = engine.sync_all().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].is_complete());
    assert!(r2.has_event(&event_id));

    engine.refresh().await.unwrap();
    assert_eq!(engine.secrets().len(), 1);
    assert!(engine.under_replicated().is_empty());
    assert_eq!(engine.reveal(&event_id).unwrap().as_str(), "admin/admin");

    let mut saw_sync = false;
    while let Ok(event) = events.try_recv() {
        saw_sync |= matches!(event, EngineEvent::SyncCompleted { repaired: 1, failed: 0 });
    }
    assert!(saw_sync);
}

#[tokio::test]
async fn test_second_device_sees_imported_key_secrets() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    network.add_relay(R1);

    let make = || {
        let storage = Storage::in_memory().unwrap();
        RelayConfig::new([R1]).unwrap().save(&storage).unwrap();
        SafeEngine::with_config(storage, Arc::new(network.clone()), config()).unwrap()
    };

    let laptop = make();
    laptop.create_vault(None).unwrap();
    let key = laptop.generate_key("Shared", None).unwrap();
    laptop.save("Alarm", "1357", vec![], None).await.unwrap();

    let phone = make();
    phone.create_vault(None).unwrap();
    phone.import_key("Shared", &key.private_key, None).unwrap();
    phone.refresh().await.unwrap();

    let secrets = phone.secrets();
    assert_eq!(secrets.len(), 1);
    assert_eq!(secrets[0].title, "Alarm");
    assert_eq!(phone.reveal(&secrets[0].id).unwrap().as_str(), "1357");
}
