//! Integration tests for check-out and check-in through library sets

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Harness, SCOPE, alice, bob};
use custodian_broker::prelude::*;
use custodian_broker::store::keys;
use custodian_broker::testing::{FlakyStore, MockUpstream};
use pretty_assertions::assert_eq;
use rstest::rstest;

#[tokio::test]
async fn test_first_available_member_is_lent() {
    // GIVEN: Set {A, B}, both available, max lease 24h
    let harness = Harness::start().await;
    let sets = harness.broker.library_sets();
    sets.create(
        LibrarySet::new("pool", ["sa-a", "sa-b"], SCOPE)
            .with_leases(Duration::from_secs(3600), Duration::from_secs(86_400)),
    )
    .await
    .unwrap();

    // WHEN: A caller checks out with a 1800s ttl
    let lease = sets
        .check_out("pool", Duration::from_secs(1800), &alice())
        .await
        .unwrap()
        .into_lease()
        .expect("an identity should be available");

    // THEN: A is lent for 1800s with a live key
    assert_eq!(lease.identity_id, "sa-a");
    assert_eq!(lease.lease_duration, Duration::from_secs(1800));
    assert!(lease.expires_at.is_some());
    assert!(harness.upstream.has_key(&lease.key_id));

    // THEN: Status shows A borrowed by the caller and B available
    let status = sets.status("pool").await.unwrap();
    assert_eq!(status.len(), 2);
    assert!(!status[0].available);
    assert_eq!(status[0].borrower_entity_id.as_deref(), Some("entity-alice"));
    assert!(status[0].checked_out_at.is_some());
    assert!(status[1].available);
    assert_eq!(status[1].borrower_entity_id, None);
}

#[tokio::test]
async fn test_exhausted_pool_is_not_an_error() {
    // GIVEN: Set {A, B} with both members checked out
    let harness = Harness::start().await;
    harness.create_set("pool", &["sa-a", "sa-b"]).await;
    let sets = harness.broker.library_sets();
    sets.check_out("pool", Duration::ZERO, &alice()).await.unwrap();
    sets.check_out("pool", Duration::ZERO, &bob()).await.unwrap();

    // WHEN: A third check-out is attempted
    let outcome = sets
        .check_out("pool", Duration::ZERO, &alice())
        .await
        .unwrap();

    // THEN: The result says none are available
    assert!(matches!(outcome, CheckOutOutcome::NoneAvailable));
    assert_eq!(harness.upstream.calls("create_key"), 2);
}

#[rstest]
#[case::zero_falls_back_to_default(0, 3600)]
#[case::shorter_request_honoured(900, 900)]
#[case::longer_request_capped_by_default(7200, 3600)]
#[case::far_over_max(10 * 86_400, 3600)]
#[tokio::test]
async fn test_lease_never_exceeds_policy(#[case] requested: u64, #[case] expected: u64) {
    // GIVEN: A set with a 1h default and 24h max lease
    let harness = Harness::start().await;
    harness.create_set("pool", &["sa-a"]).await;

    // WHEN: A caller asks for `requested` seconds
    let lease = harness
        .broker
        .library_sets()
        .check_out("pool", Duration::from_secs(requested), &alice())
        .await
        .unwrap()
        .into_lease()
        .unwrap();

    // THEN: The granted lease is clamped, never extended
    assert_eq!(lease.lease_duration, Duration::from_secs(expected));
}

#[tokio::test]
async fn test_unbounded_default_uses_max_lease() {
    // GIVEN: A set whose default lease is unbounded
    let harness = Harness::start().await;
    let sets = harness.broker.library_sets();
    sets.create(
        LibrarySet::new("pool", ["sa-a"], SCOPE)
            .with_leases(Duration::ZERO, Duration::from_secs(600)),
    )
    .await
    .unwrap();

    // WHEN: A caller asks for a week
    let lease = sets
        .check_out("pool", Duration::from_secs(7 * 86_400), &alice())
        .await
        .unwrap()
        .into_lease()
        .unwrap();

    // THEN: The max lease applies
    assert_eq!(lease.lease_duration, Duration::from_secs(600));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_check_outs_lend_one_identity() {
    // GIVEN: A single-member set and a slow upstream
    custodian_log::init_test();
    let upstream = MockUpstream::new().with_create_key_delay(Duration::from_millis(20));
    upstream.add_identity("sa-a", SCOPE);
    let broker = Arc::new(
        Broker::open(common::fast_config(), MemoryStore::new(), upstream.connector())
            .await
            .unwrap(),
    );
    broker
        .admin()
        .configure(AdminCredentialConfig::new(
            upstream.seed_admin_credential("root"),
            "root",
        ))
        .await
        .unwrap();
    broker
        .library_sets()
        .create(LibrarySet::new("solo", ["sa-a"], SCOPE))
        .await
        .unwrap();

    // WHEN: Eight callers check out at once
    let mut tasks = Vec::new();
    for i in 0..8 {
        let broker = Arc::clone(&broker);
        tasks.push(tokio::spawn(async move {
            broker
                .library_sets()
                .check_out("solo", Duration::ZERO, &Borrower::new(format!("caller-{i}"), ""))
                .await
        }));
    }
    let mut granted = 0;
    for task in tasks {
        if task.await.unwrap().unwrap().is_granted() {
            granted += 1;
        }
    }

    // THEN: Exactly one succeeded and exactly one key exists
    assert_eq!(granted, 1);
    assert_eq!(upstream.live_keys_for("sa-a"), 1);
}

#[tokio::test]
async fn test_check_in_round_trip() {
    // GIVEN: A borrowed identity
    let harness = Harness::start().await;
    harness.create_set("pool", &["sa-a"]).await;
    let sets = harness.broker.library_sets();
    let lease = sets
        .check_out("pool", Duration::ZERO, &alice())
        .await
        .unwrap()
        .into_lease()
        .unwrap();

    // WHEN: The borrower checks it in without naming it
    let returned = sets
        .check_in("pool", CheckInRequest::by(alice()))
        .await
        .unwrap();

    // THEN: It is available again and its key is gone
    assert_eq!(returned, vec!["sa-a"]);
    assert!(!harness.upstream.has_key(&lease.key_id));
    let status = sets.status("pool").await.unwrap();
    assert!(status[0].available);
    assert_eq!(status[0].borrower_token, None);
}

#[tokio::test]
async fn test_check_in_twice_is_idempotent() {
    // GIVEN: A borrowed identity
    let harness = Harness::start().await;
    harness.create_set("pool", &["sa-a"]).await;
    let sets = harness.broker.library_sets();
    sets.check_out("pool", Duration::ZERO, &alice()).await.unwrap();

    // WHEN: It is checked in twice by name
    let request = CheckInRequest::by(alice()).identities(["sa-a"]);
    sets.check_in("pool", request.clone()).await.unwrap();
    let second = sets.check_in("pool", request).await;

    // THEN: Both succeed and the identity stays available
    assert_eq!(second.unwrap(), vec!["sa-a"]);
    assert!(sets.status("pool").await.unwrap()[0].available);
    assert_eq!(harness.upstream.calls("delete_key"), 1);
}

#[tokio::test]
async fn test_only_borrower_may_check_in() {
    // GIVEN: An identity borrowed by alice in an enforcing set
    let harness = Harness::start().await;
    harness.create_set("pool", &["sa-a"]).await;
    let sets = harness.broker.library_sets();
    sets.check_out("pool", Duration::ZERO, &alice()).await.unwrap();

    // WHEN: Bob tries to return it
    let err = sets
        .check_in("pool", CheckInRequest::by(bob()).identities(["sa-a"]))
        .await
        .unwrap_err();

    // THEN: The request is refused and the identity stays borrowed
    assert!(matches!(err, BrokerError::Unauthorized { ref identity_id } if identity_id == "sa-a"));
    assert!(!sets.status("pool").await.unwrap()[0].available);

    // WHEN: An operator forces the check-in
    let returned = sets
        .check_in("pool", CheckInRequest::by(bob()).identities(["sa-a"]).forced())
        .await
        .unwrap();

    // THEN: The identity is returned
    assert_eq!(returned, vec!["sa-a"]);
    assert!(sets.status("pool").await.unwrap()[0].available);
}

#[tokio::test]
async fn test_borrower_matched_by_token_alone() {
    // GIVEN: An identity borrowed by alice
    let harness = Harness::start().await;
    harness.create_set("pool", &["sa-a"]).await;
    let sets = harness.broker.library_sets();
    sets.check_out("pool", Duration::ZERO, &alice()).await.unwrap();

    // WHEN: A request carrying only alice's token checks it in
    let returned = sets
        .check_in(
            "pool",
            CheckInRequest::by(Borrower::new("", "token-alice")).identities(["sa-a"]),
        )
        .await
        .unwrap();

    // THEN: It is accepted
    assert_eq!(returned, vec!["sa-a"]);
}

#[tokio::test]
async fn test_non_enforcing_set_accepts_anyone() {
    // GIVEN: A set without borrower enforcement
    let harness = Harness::start().await;
    let sets = harness.broker.library_sets();
    sets.create(LibrarySet::new("shared", ["sa-a"], SCOPE).with_enforcement(false))
        .await
        .unwrap();
    sets.check_out("shared", Duration::ZERO, &alice()).await.unwrap();

    // WHEN: Bob checks in without naming the identity
    let returned = sets
        .check_in("shared", CheckInRequest::by(bob()))
        .await
        .unwrap();

    // THEN: The single outstanding identity is returned
    assert_eq!(returned, vec!["sa-a"]);
}

#[tokio::test]
async fn test_ambiguous_check_in_is_rejected() {
    // GIVEN: Two identities borrowed by the same caller
    let harness = Harness::start().await;
    harness.create_set("pool", &["sa-a", "sa-b"]).await;
    let sets = harness.broker.library_sets();
    sets.check_out("pool", Duration::ZERO, &alice()).await.unwrap();
    sets.check_out("pool", Duration::ZERO, &alice()).await.unwrap();

    // WHEN: The caller checks in without naming identities
    let err = sets
        .check_in("pool", CheckInRequest::by(alice()))
        .await
        .unwrap_err();

    // THEN: The caller must disambiguate
    assert!(matches!(err, BrokerError::Validation(_)));
    assert!(sets.status("pool").await.unwrap().iter().all(|m| !m.available));
}

#[tokio::test]
async fn test_check_in_of_non_member_rejected() {
    let harness = Harness::start().await;
    harness.create_set("pool", &["sa-a"]).await;

    let err = harness
        .broker
        .library_sets()
        .check_in("pool", CheckInRequest::by(alice()).identities(["sa-c"]))
        .await
        .unwrap_err();

    assert!(matches!(err, BrokerError::Validation(_)));
}

#[tokio::test]
async fn test_key_deletion_failure_does_not_strand_identity() {
    // GIVEN: A borrowed identity and an upstream that cannot delete keys
    let harness = Harness::start().await;
    harness.create_set("pool", &["sa-a"]).await;
    let sets = harness.broker.library_sets();
    let lease = sets
        .check_out("pool", Duration::ZERO, &alice())
        .await
        .unwrap()
        .into_lease()
        .unwrap();
    harness.upstream.fail_key_deletion(true);

    // WHEN: The borrower checks in
    sets.check_in("pool", CheckInRequest::by(alice())).await.unwrap();

    // THEN: The identity is available; the key is left to lapse
    assert!(sets.status("pool").await.unwrap()[0].available);
    assert!(harness.upstream.has_key(&lease.key_id));
}

#[tokio::test]
async fn test_mint_failure_rolls_back_check_out() {
    // GIVEN: A set whose upstream fails the next key creation
    let harness = Harness::start().await;
    harness.create_set("pool", &["sa-a"]).await;
    harness.upstream.fail_next_create_key(1);
    let sets = harness.broker.library_sets();

    // WHEN: A caller checks out
    let err = sets
        .check_out("pool", Duration::ZERO, &alice())
        .await
        .unwrap_err();

    // THEN: The error surfaces and the identity is available again
    assert!(matches!(err, BrokerError::Upstream(_)));
    assert!(sets.status("pool").await.unwrap()[0].available);

    // THEN: The next attempt succeeds
    assert!(sets
        .check_out("pool", Duration::ZERO, &alice())
        .await
        .unwrap()
        .is_granted());
}

#[tokio::test]
async fn test_key_handle_persist_failure_rolls_back() {
    // GIVEN: A store that cannot record key handles
    custodian_log::init_test();
    let upstream = MockUpstream::new();
    upstream.add_identity("sa-a", SCOPE);
    let store = FlakyStore::new();
    let broker = Broker::open(common::fast_config(), store.clone(), upstream.connector())
        .await
        .unwrap();
    broker
        .admin()
        .configure(AdminCredentialConfig::new(
            upstream.seed_admin_credential("root"),
            "root",
        ))
        .await
        .unwrap();
    let sets = broker.library_sets();
    sets.create(LibrarySet::new("pool", ["sa-a"], SCOPE))
        .await
        .unwrap();
    store.fail_puts_under(keys::KEY_HANDLE_PREFIX);

    // WHEN: A caller checks out
    let err = sets
        .check_out("pool", Duration::ZERO, &alice())
        .await
        .unwrap_err();

    // THEN: The minted key is deleted and the identity is available
    assert!(matches!(err, BrokerError::Storage(_)));
    assert_eq!(upstream.live_keys_for("sa-a"), 0);
    assert!(sets.status("pool").await.unwrap()[0].available);
}

#[tokio::test(start_paused = true)]
async fn test_failed_mint_keeps_later_borrow() {
    // GIVEN: A single-member set, a slow upstream and one mint failure queued
    let harness = Harness::start().await;
    harness.create_set("solo", &["sa-a"]).await;
    let upstream = harness
        .upstream
        .clone()
        .with_create_key_delay(Duration::from_millis(200));
    upstream.fail_next_create_key(1);
    let sets = harness.broker.library_sets();

    // WHEN: While alice's key is minted, an operator returns sa-a and bob borrows it
    let alice = alice();
    let (alice_outcome, bob_outcome) = tokio::join!(
        sets.check_out("solo", Duration::ZERO, &alice),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            sets.check_in("solo", CheckInRequest::by(bob()).identities(["sa-a"]).forced())
                .await
                .unwrap();
            sets.check_out("solo", Duration::ZERO, &bob()).await
        }
    );

    // THEN: Alice's failed mint does not undo bob's borrow
    assert!(matches!(alice_outcome, Err(BrokerError::Upstream(_))));
    let lease = bob_outcome
        .unwrap()
        .into_lease()
        .expect("bob should hold sa-a");
    assert_eq!(lease.identity_id, "sa-a");
    let status = sets.status("solo").await.unwrap();
    assert_eq!(status[0].borrower_entity_id.as_deref(), Some("entity-bob"));

    // THEN: A third caller is not lent sa-a
    let outcome = sets
        .check_out("solo", Duration::ZERO, &Borrower::new("entity-carol", "token-carol"))
        .await
        .unwrap();
    assert!(matches!(outcome, CheckOutOutcome::NoneAvailable));
    assert_eq!(upstream.live_keys_for("sa-a"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_key_minted_after_forced_check_in_is_revoked() {
    // GIVEN: A single-member set and a slow upstream
    let harness = Harness::start().await;
    harness.create_set("solo", &["sa-a"]).await;
    let upstream = harness
        .upstream
        .clone()
        .with_create_key_delay(Duration::from_millis(200));
    let sets = harness.broker.library_sets();

    // WHEN: An operator returns sa-a while alice's key is minted
    let alice = alice();
    let (outcome, returned) = tokio::join!(
        sets.check_out("solo", Duration::ZERO, &alice),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            sets.check_in("solo", CheckInRequest::by(bob()).identities(["sa-a"]).forced())
                .await
        }
    );

    // THEN: Alice is told the check-out ended and the new key is deleted
    assert_eq!(returned.unwrap(), vec!["sa-a"]);
    assert!(matches!(
        outcome,
        Err(BrokerError::CheckOutLost { ref identity_id }) if identity_id == "sa-a"
    ));
    assert_eq!(upstream.live_keys_for("sa-a"), 0);
    assert!(sets.status("solo").await.unwrap()[0].available);
}

#[tokio::test(start_paused = true)]
async fn test_key_minted_after_set_deleted_is_revoked() {
    // GIVEN: A single-member set and a slow upstream
    let harness = Harness::start().await;
    harness.create_set("solo", &["sa-a"]).await;
    let upstream = harness
        .upstream
        .clone()
        .with_create_key_delay(Duration::from_millis(200));
    let sets = harness.broker.library_sets();

    // WHEN: The set is deleted while alice's key is minted
    let alice = alice();
    let (outcome, deleted) = tokio::join!(
        sets.check_out("solo", Duration::ZERO, &alice),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            sets.delete("solo").await
        }
    );

    // THEN: The key is deleted and no record of sa-a is left behind
    deleted.unwrap();
    assert!(matches!(outcome, Err(BrokerError::CheckOutLost { .. })));
    assert_eq!(upstream.live_keys_for("sa-a"), 0);
    assert!(harness.store.get(&keys::checkout("sa-a")).await.unwrap().is_none());
    assert!(harness.store.get(&keys::key_handle("sa-a")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_check_out_without_admin_credential() {
    // GIVEN: A broker with a set persisted but no admin credential
    let harness = Harness::start().await;
    harness.create_set("pool", &["sa-a"]).await;
    harness.store.delete(keys::ADMIN_CREDENTIAL).await.unwrap();
    let harness = harness.restart().await;

    // WHEN: A caller checks out
    let err = harness
        .broker
        .library_sets()
        .check_out("pool", Duration::ZERO, &alice())
        .await
        .unwrap_err();

    // THEN: The missing credential is reported and nothing stays borrowed
    assert!(matches!(
        err,
        BrokerError::NotFound {
            kind: custodian_broker::ResourceKind::AdminCredential,
            ..
        }
    ));
    assert!(harness.broker.library_sets().status("pool").await.unwrap()[0].available);
}

#[tokio::test]
async fn test_unknown_set_is_not_found() {
    let harness = Harness::start().await;
    let err = harness
        .broker
        .library_sets()
        .check_out("missing", Duration::ZERO, &alice())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}
