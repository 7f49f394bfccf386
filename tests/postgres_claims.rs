//! Claims against a real Postgres database. Run with `DATABASE_URL` set and `--ignored`.

use std::collections::HashSet;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use poap_bot::settings::Claims;
use poap_bot::store::ingest_codes;
use poap_bot::{ClaimArbitrator, ClaimError, ClaimWindows, EventRecord, EventStore, PgEventStore};

async fn store() -> Arc<PgEventStore> {
    let url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    Arc::new(
        PgEventStore::connect(&url, Duration::from_secs(2))
            .await
            .unwrap(),
    )
}

fn event(pass: &str) -> EventRecord {
    let now = Utc::now();
    EventRecord {
        id: Uuid::new_v4(),
        server: "integration".to_owned(),
        channel: "general".to_owned(),
        start_date: now,
        end_date: now + chrono::Duration::hours(1),
        response_message: "Your code: {code}".to_owned(),
        pass: pass.to_owned(),
        file_url: None,
        is_whitelisted: false,
        created_by: "tests".to_owned(),
        created_date: now,
        is_active: true,
    }
}

async fn event_with_codes(store: &PgEventStore, codes: usize) -> EventRecord {
    let event = event(&format!("pass-{}", Uuid::new_v4().simple()));
    store.insert_event(&event).await.unwrap();

    let codes: Vec<_> = (0..codes)
        .map(|i| format!("{}-{}", event.id.simple(), i))
        .collect();
    let ingested = ingest_codes(store, event.id, &codes).await.unwrap();
    assert_eq!(codes.len(), ingested.added);

    event
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn concurrent_claims_hand_out_each_code_once() {
    let store = store().await;
    let event = event_with_codes(&store, 10).await;

    let windows = ClaimWindows::default();
    windows.open(event.id);
    let arbitrator = Arc::new(ClaimArbitrator::new(
        store.clone(),
        windows,
        Claims::default(),
    ));

    let tasks: Vec<_> = (0..30)
        .map(|i| {
            let arbitrator = Arc::clone(&arbitrator);
            let pass = event.pass.clone();
            tokio::spawn(async move { arbitrator.claim(&pass, &format!("user-{}", i)).await })
        })
        .collect();

    let mut codes = HashSet::new();
    let mut exhausted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(claimed) => assert!(codes.insert(claimed.code)),
            Err(ClaimError::NoCodesLeft) => exhausted += 1,
            Err(e) => panic!("unexpected claim failure: {}", e),
        }
    }

    assert_eq!(10, codes.len());
    assert_eq!(20, exhausted);
    assert_eq!(10, store.count_codes(event.id, true).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn claimant_keeps_a_single_code() {
    let store = store().await;
    let event = event_with_codes(&store, 3).await;

    let first = store
        .claim_random_unclaimed_code(event.id, "repeat")
        .await
        .unwrap();
    assert!(first.starts_with(&event.id.simple().to_string()));

    let second = store.claim_random_unclaimed_code(event.id, "repeat").await;
    assert!(matches!(second, Err(ClaimError::AlreadyClaimed)));
    assert_eq!(1, store.count_codes(event.id, true).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn whitelisted_events_only_serve_listed_users() {
    let store = store().await;
    let mut event = event(&format!("pass-{}", Uuid::new_v4().simple()));
    event.is_whitelisted = true;
    store.insert_event(&event).await.unwrap();
    store.insert_code(event.id, &Uuid::new_v4().to_string()).await.unwrap();
    store.add_to_whitelist(event.id, "listed").await.unwrap();

    let stranger = store.claim_random_unclaimed_code(event.id, "stranger").await;
    assert!(matches!(stranger, Err(ClaimError::NotWhitelisted)));

    assert!(store
        .claim_random_unclaimed_code(event.id, "listed")
        .await
        .is_ok());
}

#[tokio::test]
#[ignore]
async fn events_are_found_by_normalized_pass() {
    let store = store().await;
    let pass = format!("Spring{}", Uuid::new_v4().simple());
    let event = event(&pass);
    store.insert_event(&event).await.unwrap();

    let found = store
        .find_event_by_pass(&format!("  !{} ", pass.to_uppercase()), true)
        .await
        .unwrap();
    assert_eq!(Some(event.id), found.map(|e| e.id));
}

#[tokio::test]
#[ignore]
async fn pass_lookup_uses_the_stored_key() {
    let store = store().await;
    let suffix = Uuid::new_v4().simple().to_string();
    let event = event(&format!("Spring Fest {}", suffix));
    store.insert_event(&event).await.unwrap();

    let found = store
        .find_event_by_pass(&format!("!springfest{}", suffix.to_uppercase()), true)
        .await
        .unwrap();
    assert_eq!(Some(event.id), found.map(|e| e.id));

    let mut renamed = event.clone();
    renamed.pass = format!("autumn {}", suffix);
    store.update_event(&renamed).await.unwrap();

    let old = store
        .find_event_by_pass(&format!("springfest{}", suffix), true)
        .await
        .unwrap();
    assert!(old.is_none());
    let new = store
        .find_event_by_pass(&format!("Autumn{}", suffix), true)
        .await
        .unwrap();
    assert_eq!(Some(event.id), new.map(|e| e.id));
    assert!(store.find_event_by_pass("  ! ", true).await.unwrap().is_none());
}
