//! REST transport, session and API behavior against the mock backend.

mod common;

use chrono::{TimeZone, Utc};
use common::{eventually, jwt, user, MockBackend};
use crm_sync::bus::Event;
use crm_sync::model::{LeadFilter, NewCallLog, NewLead, NewReminder};
use crm_sync::store::TOKEN_KEY;
use crm_sync::SyncError;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use tokio::time::{timeout, Duration};

#[tokio::test]
async fn login_persists_session_and_restore_finds_it() {
    let backend = MockBackend::start().await;
    let manager = backend.manager().await;

    let user = manager
        .session()
        .login("rahim@example.com", "secret")
        .await
        .unwrap();
    assert_eq!(user.id, "u1");
    assert!(manager.store().token().await.unwrap().is_some());

    let restored = manager.session().restore().await.unwrap();
    assert_eq!(restored.map(|u| u.email), Some("rahim@example.com".to_string()));
}

#[tokio::test]
async fn bad_credentials_are_an_auth_error_without_forced_logout() {
    let backend = MockBackend::start().await;
    let manager = backend.manager().await;
    let mut events = manager.bus().subscribe();

    let err = manager
        .session()
        .login("rahim@example.com", "wrong")
        .await
        .unwrap_err();
    match err {
        SyncError::Auth(message) => assert_eq!(message, "Invalid email or password"),
        other => panic!("expected auth error, got {other:?}"),
    }
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn rejected_token_forces_logout() {
    let backend = MockBackend::start().await;
    let manager = backend.manager().await;
    manager
        .store()
        .save_session(&jwt(3600, "revoked"), &user())
        .await
        .unwrap();
    let mut events = manager.bus().subscribe();

    let mut lead = manager.api().lead("L1");
    let err = lead.loaded().await.unwrap_err();
    assert!(err.is_auth());

    assert!(manager.store().token().await.unwrap().is_none());
    assert!(manager.store().user().await.unwrap().is_none());
    let event = timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, Event::ForcedLogout { .. }));
}

#[tokio::test]
async fn token_written_mid_session_is_used_next() {
    let backend = MockBackend::start().await;
    let manager = backend.signed_in().await;
    let first = manager.store().token().await.unwrap().unwrap();

    let whoami: Value = manager.rest().get("/whoami").await.unwrap();
    assert_eq!(whoami["authorization"], format!("Bearer {first}"));

    let second = jwt(7200, "rotated");
    manager.store().set(TOKEN_KEY, &second).await.unwrap();

    let whoami: Value = manager.rest().get("/whoami").await.unwrap();
    assert_eq!(whoami["authorization"], format!("Bearer {second}"));
}

#[tokio::test]
async fn validation_message_reaches_caller_verbatim() {
    let backend = MockBackend::start().await;
    let manager = backend.signed_in().await;

    let lead = NewLead {
        name: "Karim".into(),
        phone: String::new(),
        source: "Facebook".into(),
        status: None,
        comment: None,
        images: Vec::new(),
        cre: None,
    };
    let err = manager.api().create_lead(&lead).await.unwrap_err();
    match err {
        SyncError::Validation { status, message } => {
            assert_eq!(status, 422);
            assert_eq!(message, "Phone number is required");
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    assert!(manager.store().token().await.unwrap().is_some());
}

#[tokio::test]
async fn create_lead_refetches_live_lead_lists() {
    let backend = MockBackend::start().await;
    let manager = backend.signed_in().await;

    let filter = LeadFilter {
        status: Some("hot".into()),
        ..LeadFilter::default()
    };
    let mut leads = manager.api().leads(&filter);
    let page = leads.loaded().await.unwrap();
    assert_eq!(
        page.as_leads().unwrap().extra["query"],
        "page=1&limit=100&status=hot"
    );
    while leads.try_changed().is_some() {}

    let lead = NewLead {
        name: "Karim".into(),
        phone: "01700000000".into(),
        source: "Facebook".into(),
        status: None,
        comment: None,
        images: Vec::new(),
        cre: None,
    };
    let ack = manager.api().create_lead(&lead).await.unwrap();
    assert_eq!(ack.lead.map(|l| l.id), Some("L9".to_string()));

    let refetched = timeout(Duration::from_secs(2), leads.changed())
        .await
        .unwrap()
        .unwrap();
    assert!(refetched.data.is_some());
}

#[tokio::test]
async fn server_failure_keeps_session() {
    let backend = MockBackend::start().await;
    let manager = backend.signed_in().await;

    let mut lead = manager.api().lead("boom");
    match lead.loaded().await.unwrap_err() {
        SyncError::Server { status, message } => {
            assert_eq!(status, 502);
            assert_eq!(message, "upstream unavailable");
        }
        other => panic!("expected server error, got {other:?}"),
    }
    assert!(manager.store().token().await.unwrap().is_some());
}

#[tokio::test]
async fn conversation_list_is_deduplicated_and_sorted() {
    let backend = MockBackend::start().await;
    let manager = backend.signed_in().await;

    let mut list = manager.api().conversations(1, 100, None);
    let page = list.loaded().await.unwrap();
    let ids: Vec<&str> = page
        .as_conversations()
        .unwrap()
        .leads
        .iter()
        .map(|c| c.id.as_str())
        .collect();
    assert_eq!(ids, ["A", "B"]);
}

#[tokio::test]
async fn mark_as_seen_commits_or_rolls_back() {
    let backend = MockBackend::start().await;
    backend.state.failing_seen.lock().insert("B".to_string());
    let manager = backend.signed_in().await;

    let mut list = manager.api().conversations(1, 100, None);
    list.loaded().await.unwrap();
    let key = list.key().clone();
    let seen = |id: &str| {
        let data = manager.cache().get(&key).unwrap();
        data.as_conversations()
            .unwrap()
            .leads
            .iter()
            .find(|c| c.id == id)
            .unwrap()
            .messages_seen
    };

    manager.api().mark_as_seen("A").await.unwrap();
    assert!(seen("A"));

    let err = manager.api().mark_as_seen("B").await.unwrap_err();
    match err {
        SyncError::ConflictDuringOptimisticUpdate { target, source } => {
            assert_eq!(target, "conversation B");
            assert!(matches!(*source, SyncError::Server { status: 500, .. }));
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert!(!seen("B"));
    assert!(seen("A"));
    assert_eq!(manager.cache().pending_layers(&key), 0);
}

#[tokio::test]
async fn mark_as_seen_refetches_lead_detail() {
    let backend = MockBackend::start().await;
    let manager = backend.signed_in().await;

    let mut lead = manager.api().lead("A");
    lead.loaded().await.unwrap();
    while lead.try_changed().is_some() {}
    let before = backend.state.lead_fetches.load(Ordering::SeqCst);

    manager.api().mark_as_seen("A").await.unwrap();

    let refreshed = timeout(Duration::from_secs(2), async {
        loop {
            let snapshot = lead.changed().await.unwrap();
            if !snapshot.fetching {
                break snapshot;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(refreshed.data.unwrap().as_lead().unwrap().id, "A");
    assert!(backend.state.lead_fetches.load(Ordering::SeqCst) > before);
}

#[tokio::test]
async fn lead_mutations_refetch_lead_detail() {
    let backend = MockBackend::start().await;
    let manager = backend.signed_in().await;
    let fetches = || backend.state.lead_fetches.load(Ordering::SeqCst);

    let mut lead = manager.api().lead("L1");
    lead.loaded().await.unwrap();

    let before = fetches();
    let reminder = NewReminder {
        time: Utc.with_ymd_and_hms(2024, 5, 2, 9, 0, 0).unwrap(),
        comment_id: None,
        comment: None,
        complete_last_reminder: None,
    };
    let ack = manager.api().add_reminder("L1", &reminder).await.unwrap();
    assert_eq!(ack.status, "success");
    assert_eq!(ack.reminders.len(), 1);
    assert_eq!(ack.reminders[0].id, "r1");
    assert_eq!(ack.reminders[0].time, reminder.time);
    assert!(eventually(|| fetches() > before).await);

    let before = fetches();
    let updated = manager
        .api()
        .update_reminder_status("L1", "r1", "completed")
        .await
        .unwrap();
    assert_eq!(updated["status"], "completed");
    assert!(eventually(|| fetches() > before).await);

    let before = fetches();
    let call = NewCallLog {
        recipient_number: "01700000000".into(),
        call_type: "outgoing".into(),
        status: "answered".into(),
        call_duration: Some(json!(42)),
        timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap(),
    };
    let ack = manager.api().add_call_log("L1", &call).await.unwrap();
    assert_eq!(ack.msg.as_deref(), Some("Call log added"));
    assert!(eventually(|| fetches() > before).await);

    let before = fetches();
    manager
        .api()
        .update_lead("L1", &json!({ "status": "hot" }))
        .await
        .unwrap();
    assert!(eventually(|| fetches() > before).await);

    drop(lead);
}

#[tokio::test]
async fn directory_lookups_decode() {
    let backend = MockBackend::start().await;
    let manager = backend.signed_in().await;

    let users = manager.api().fetch_users(Some("Sales"), Some("CRE")).await.unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].name_as_per_nid, "Rahim Uddin");

    let department = manager.api().fetch_department("d1").await.unwrap();
    assert_eq!(department.department_name, "Sales");
    assert_eq!(department.roles[0].role_name, "CRE");

    let updated = manager
        .api()
        .update_lead("L1", &json!({ "status": "hot" }))
        .await
        .unwrap();
    assert_eq!(updated.msg.as_deref(), Some("Lead updated"));
}

#[tokio::test]
async fn logout_clears_session_and_cache() {
    let backend = MockBackend::start().await;
    let manager = backend.signed_in().await;

    let mut lead = manager.api().lead("L1");
    lead.loaded().await.unwrap();
    let key = lead.key().clone();

    manager.logout().await.unwrap();
    assert!(manager.store().token().await.unwrap().is_none());
    assert!(!manager.cache().contains(&key));
    assert!(backend
        .state
        .auth_headers
        .lock()
        .iter()
        .any(|h| h.starts_with("Bearer ")));
}
