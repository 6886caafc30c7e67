mod common;

use std::time::Duration;

use common::{eventually, fast_config, owner, Harness};
use tether_core::persistence::PersistenceGateway;
use tether_core::session::SessionStatus;
use tether_core::state::{self, Transition};
use tether_engine::{OrchestratorConfig, OrchestratorError, SessionOrchestrator};

#[tokio::test]
async fn happy_path_pending_to_connected() {
    let h = Harness::new(fast_config());
    let session = h.orch.create_session(owner(1), "phone-A").await.unwrap();
    assert_eq!(session.status, SessionStatus::Pending);
    assert!(h.orch.quota().holds(&owner(1), &session.id));

    let code = h.orch.get_pairing_code(&session.id).await.unwrap();
    assert_eq!(code.expires_at - code.issued_at, chrono::Duration::seconds(30));
    assert_eq!(code.retry_count, 1);
    assert!(code.image.starts_with("data:image/svg+xml;base64,"));
    assert_eq!(h.status(&session.id), SessionStatus::PairingReady);

    h.client(&session.id)
        .simulate_paired("15551234567@s.whatsapp.net", b"noise-keys")
        .await;
    eventually("connected", || h.status(&session.id) == SessionStatus::Connected).await;

    let connected = h.session(&session.id);
    assert!(connected.connected_at.is_some());
    assert!(connected.pairing.is_none());
    assert_eq!(
        connected.protocol_identity.as_ref().map(|i| i.as_str()),
        Some("15551234567@s.whatsapp.net")
    );
    assert!(h.orch.quota().holds(&owner(1), &session.id));
    assert_eq!(
        h.store
            .load_identity_material(&session.id)
            .unwrap()
            .unwrap()
            .expose(),
        b"noise-keys"
    );
    assert_eq!(
        h.event_types(&session.id),
        ["session_created", "pairing_code_issued", "pairing_scanned", "connected"]
    );
}

#[tokio::test]
async fn pairing_code_is_idempotent_within_validity() {
    let h = Harness::new(fast_config());
    let session = h.orch.create_session(owner(1), "phone-A").await.unwrap();

    let first = h.orch.get_pairing_code(&session.id).await.unwrap();
    let second = h.orch.get_pairing_code(&session.id).await.unwrap();
    assert_eq!(first.code, second.code);
    assert_eq!(second.retry_count, 1);
    assert_eq!(h.client(&session.id).challenges_issued(), 1);
    assert_eq!(h.orch.current_pairing_code(&session.id).unwrap().code, first.code);

    h.expire_code(&session.id);
    assert!(matches!(
        h.orch.current_pairing_code(&session.id),
        Err(OrchestratorError::PairingExpired(_))
    ));

    let third = h.orch.get_pairing_code(&session.id).await.unwrap();
    assert_ne!(third.code, first.code);
    assert_eq!(third.retry_count, 2);
    assert_eq!(h.status(&session.id), SessionStatus::PairingReady);
    assert_eq!(h.client(&session.id).challenges_issued(), 2);
}

#[tokio::test]
async fn current_code_is_not_available_before_issue() {
    let h = Harness::new(fast_config());
    let session = h.orch.create_session(owner(1), "phone-A").await.unwrap();
    assert!(matches!(
        h.orch.current_pairing_code(&session.id),
        Err(OrchestratorError::NotAvailable {
            status: SessionStatus::Pending,
            ..
        })
    ));
}

#[tokio::test]
async fn code_validity_is_capped_by_the_library() {
    let h = Harness::new(fast_config());
    h.factory.script().set_challenge_timeout(Duration::from_secs(20));
    let session = h.orch.create_session(owner(1), "phone-A").await.unwrap();
    let code = h.orch.get_pairing_code(&session.id).await.unwrap();
    assert_eq!(code.expires_at - code.issued_at, chrono::Duration::seconds(20));
}

#[tokio::test]
async fn challenge_timeout_leaves_session_pending() {
    let h = Harness::new(OrchestratorConfig {
        challenge_timeout: Duration::from_millis(100),
        ..fast_config()
    });
    h.factory.script().hang_challenges(true);
    let session = h.orch.create_session(owner(1), "phone-A").await.unwrap();

    let err = h.orch.get_pairing_code(&session.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::PairingTimeout(_)), "got {err:?}");
    assert_eq!(h.status(&session.id), SessionStatus::Pending);

    h.factory.script().hang_challenges(false);
    assert!(h.orch.get_pairing_code(&session.id).await.is_ok());
    assert_eq!(h.status(&session.id), SessionStatus::PairingReady);
}

#[tokio::test]
async fn pairing_retries_are_capped() {
    let h = Harness::new(OrchestratorConfig {
        max_pairing_retries: 2,
        ..fast_config()
    });
    let session = h.orch.create_session(owner(1), "phone-A").await.unwrap();

    h.orch.get_pairing_code(&session.id).await.unwrap();
    h.expire_code(&session.id);
    assert_eq!(h.orch.get_pairing_code(&session.id).await.unwrap().retry_count, 2);
    h.expire_code(&session.id);

    let err = h.orch.get_pairing_code(&session.id).await.unwrap_err();
    assert!(
        matches!(err, OrchestratorError::RetryExhausted { retries: 2, .. }),
        "got {err:?}"
    );
    assert_eq!(h.status(&session.id), SessionStatus::Expired);
    assert_eq!(h.orch.quota().used(&owner(1)), 0);
    assert!(!h.orch.registry().contains(&session.id));
    assert!(matches!(
        h.orch.get_pairing_code(&session.id).await,
        Err(OrchestratorError::NotAvailable { .. })
    ));
}

#[tokio::test]
async fn pairing_failure_is_terminal() {
    let h = Harness::new(fast_config());
    let session = h.orch.create_session(owner(1), "phone-A").await.unwrap();
    h.orch.get_pairing_code(&session.id).await.unwrap();

    h.client(&session.id).simulate_pairing_failed("bad signature").await;
    eventually("failed", || h.status(&session.id) == SessionStatus::Failed).await;
    eventually("handle dropped", || !h.orch.registry().contains(&session.id)).await;
    assert_eq!(h.orch.quota().used(&owner(1)), 0);
    assert_eq!(
        h.event_types(&session.id),
        ["session_created", "pairing_code_issued", "pairing_scanned", "pairing_failed"]
    );
}

#[tokio::test]
async fn remote_logout_deactivates_and_forgets_keys() {
    let h = Harness::new(fast_config());
    let session = h.paired_session(&owner(1), "phone-A").await;

    h.client(&session.id).simulate_logout("device removed").await;
    eventually("logged out", || !h.session(&session.id).is_active).await;

    let after = h.session(&session.id);
    assert_eq!(after.status, SessionStatus::Disconnected);
    assert!(after.disconnected_at.is_some());
    assert_eq!(h.orch.quota().used(&owner(1)), 0);
    assert!(h.store.load_identity_material(&session.id).unwrap().is_none());
    eventually("handle dropped", || !h.orch.registry().contains(&session.id)).await;
    assert!(h.orch.reconnect(&session.id).await.is_err());
}

#[tokio::test]
async fn inbound_messages_touch_the_session() {
    let h = Harness::new(fast_config());
    let session = h.paired_session(&owner(1), "phone-A").await;
    let seen_before = h.session(&session.id).last_seen_at;

    h.client(&session.id).simulate_message("msg-1", "alice@s.whatsapp.net").await;
    eventually("message recorded", || {
        h.event_types(&session.id).contains(&"message_received".to_string())
    })
    .await;
    assert!(h.session(&session.id).last_seen_at >= seen_before);
    assert_eq!(h.status(&session.id), SessionStatus::Connected);
}

#[tokio::test]
async fn link_drop_reconnects_automatically() {
    let h = Harness::new(fast_config());
    let session = h.paired_session(&owner(1), "phone-A").await;

    h.client(&session.id).simulate_link_drop().await;
    eventually("reconnected", || {
        h.event_types(&session.id).contains(&"reconnected".to_string())
    })
    .await;
    eventually("connected", || h.status(&session.id) == SessionStatus::Connected).await;
    assert!(h.orch.quota().holds(&owner(1), &session.id));
    assert!(h.event_types(&session.id).contains(&"disconnected".to_string()));
}

#[tokio::test]
async fn exhausted_reconnect_fails_the_session() {
    let h = Harness::new(fast_config());
    let session = h.paired_session(&owner(1), "phone-A").await;

    h.factory.script().block_connects(true);
    h.client(&session.id).simulate_link_drop().await;
    eventually("failed", || h.status(&session.id) == SessionStatus::Failed).await;
    eventually("handle dropped", || !h.orch.registry().contains(&session.id)).await;

    assert_eq!(h.orch.quota().used(&owner(1)), 0);
    let events = h.orch.list_events(&session.id, None, 100).unwrap();
    let last = events.last().unwrap();
    assert_eq!(last.event_type(), "reconnect_failed");
    assert_eq!(last.payload.data()["attempts"], 3);
    assert_eq!(h.client(&session.id).connect_calls(), 3);
}

#[tokio::test]
async fn manual_disconnect_and_reconnect() {
    let h = Harness::new(fast_config());
    let session = h.paired_session(&owner(1), "phone-A").await;

    let down = h.orch.disconnect(&session.id).await.unwrap();
    assert_eq!(down.status, SessionStatus::Disconnected);
    assert!(!h.orch.registry().contains(&session.id));
    assert_eq!(h.orch.quota().used(&owner(1)), 0);

    let up = h.orch.reconnect(&session.id).await.unwrap();
    assert_eq!(up.status, SessionStatus::Connected);
    assert!(h.orch.registry().contains(&session.id));
    assert!(h.orch.quota().holds(&owner(1), &session.id));
    assert_eq!(h.factory.created_count(), 2);

    // Reconnecting a connected session is a no-op.
    assert_eq!(
        h.orch.reconnect(&session.id).await.unwrap().status,
        SessionStatus::Connected
    );
}

#[tokio::test]
async fn reconnect_of_pending_session_is_invalid() {
    let h = Harness::new(fast_config());
    let session = h.orch.create_session(owner(1), "phone-A").await.unwrap();
    assert!(matches!(
        h.orch.reconnect(&session.id).await,
        Err(OrchestratorError::InvalidTransition(_))
    ));
}

#[tokio::test]
async fn disconnect_of_unlinked_session_is_invalid() {
    let h = Harness::new(fast_config());
    let session = h.orch.create_session(owner(1), "phone-A").await.unwrap();
    assert!(matches!(
        h.orch.disconnect(&session.id).await,
        Err(OrchestratorError::InvalidTransition(_))
    ));
    assert!(h.orch.registry().is_live(&session.id));

    h.orch.get_pairing_code(&session.id).await.unwrap();
    assert!(matches!(
        h.orch.disconnect(&session.id).await,
        Err(OrchestratorError::InvalidTransition(_))
    ));
    assert_eq!(h.status(&session.id), SessionStatus::PairingReady);
    assert!(h.orch.registry().is_live(&session.id));
    assert_eq!(h.orch.quota().used(&owner(1)), 1);
}

#[tokio::test]
async fn delete_releases_everything() {
    let h = Harness::new(fast_config());
    let session = h.paired_session(&owner(1), "phone-A").await;

    h.orch.delete_session(&session.id).await.unwrap();
    assert!(matches!(
        h.orch.get_status(&session.id),
        Err(OrchestratorError::NotFound(_))
    ));
    assert!(!h.orch.registry().contains(&session.id));
    assert_eq!(h.orch.quota().used(&owner(1)), 0);
    assert!(h.store.load_identity_material(&session.id).unwrap().is_none());
    assert!(h.orch.list_sessions(&owner(1)).unwrap().is_empty());
    assert!(matches!(
        h.orch.delete_session(&session.id).await,
        Err(OrchestratorError::NotFound(_))
    ));

    // The name is free again.
    assert!(h.orch.create_session(owner(1), "phone-A").await.is_ok());
}

#[tokio::test]
async fn delete_unblocks_a_pending_pairing_wait() {
    let h = Harness::new(OrchestratorConfig {
        challenge_timeout: Duration::from_secs(10),
        ..fast_config()
    });
    h.factory.script().hang_challenges(true);
    let session = h.orch.create_session(owner(1), "phone-A").await.unwrap();

    let waiter = {
        let orch = h.orch.clone();
        let id = session.id.clone();
        tokio::spawn(async move { orch.get_pairing_code(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(2), h.orch.delete_session(&session.id))
        .await
        .expect("delete blocked behind the pairing wait")
        .unwrap();
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(OrchestratorError::Cancelled)), "got {result:?}");
    assert_eq!(h.orch.quota().used(&owner(1)), 0);
}

#[tokio::test]
async fn duplicate_names_are_rejected_per_owner() {
    let h = Harness::new(fast_config());
    h.orch.create_session(owner(1), "phone-A").await.unwrap();

    let err = h.orch.create_session(owner(1), "phone-A").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::DuplicateName { .. }), "got {err:?}");
    assert_eq!(h.orch.quota().used(&owner(1)), 1);

    assert!(h.orch.create_session(owner(2), "phone-A").await.is_ok());
    assert!(matches!(
        h.orch.create_session(owner(1), "  ").await,
        Err(OrchestratorError::InvalidName(_))
    ));
}

#[tokio::test]
async fn every_status_change_follows_the_graph() {
    let h = Harness::new(fast_config());
    let session = h.paired_session(&owner(1), "phone-A").await;
    h.client(&session.id).simulate_link_drop().await;
    eventually("reconnected", || {
        h.event_types(&session.id).contains(&"reconnected".to_string())
    })
    .await;
    eventually("connected", || h.status(&session.id) == SessionStatus::Connected).await;
    h.orch.disconnect(&session.id).await.unwrap();
    h.orch.reconnect(&session.id).await.unwrap();
    h.client(&session.id).simulate_logout("removed").await;
    eventually("logged out", || !h.session(&session.id).is_active).await;

    let transitions = [
        Transition::CodeScanned,
        Transition::CodeExpired,
        Transition::ReconnectSucceeded,
        Transition::ReconnectExhausted { attempts: 0 },
        Transition::RemoteLogout { reason: String::new() },
        Transition::LinkLost {
            reason: tether_core::state::DisconnectReason::Network,
        },
        Transition::PairingFailed { reason: String::new() },
        Transition::PairingSucceeded {
            identity: tether_core::ids::ProtocolIdentity::new("x"),
        },
    ];
    let events = h.orch.list_events(&session.id, None, 1000).unwrap();
    let mut previous = SessionStatus::Pending;
    for event in &events {
        if event.status != previous {
            let legal = (event.event_type() == "pairing_code_issued"
                && previous == SessionStatus::Pending)
                || transitions
                    .iter()
                    .any(|t| state::target(previous, t) == Some(event.status));
            assert!(legal, "illegal {previous} -> {} via {}", event.status, event.event_type());
        }
        previous = event.status;
    }
    assert_eq!(previous, SessionStatus::Disconnected);
}

#[tokio::test]
async fn shutdown_rejects_new_work() {
    let h = Harness::new(fast_config());
    let session = h.paired_session(&owner(1), "phone-A").await;
    h.orch.shutdown().await;

    assert!(h.orch.registry().is_empty());
    assert_eq!(h.status(&session.id), SessionStatus::Connected);
    assert!(matches!(
        h.orch.create_session(owner(1), "phone-B").await,
        Err(OrchestratorError::ShuttingDown)
    ));
}
