use super::*;
use crate::test_support::{epoch, payload};
use crate::types::InvalidProvisionalId;
use shared::domain::UserId;

fn alice() -> Author {
    Author {
        user_id: UserId(1),
        name: "alice".to_string(),
        avatar_url: None,
    }
}

fn draft(text: &str) -> Draft {
    Draft {
        group_id: GroupId(1),
        author: alice(),
        text: text.to_string(),
        is_anonymous: false,
    }
}

fn echo(id: i64, text: &str) -> Message {
    Message::from(payload(id, 1, "alice", text))
}

#[test]
fn begin_issues_unique_ids_and_inserts_pending() {
    let mut store = MessageStore::new();
    let mut tracker = SendTracker::new();

    let first = tracker.begin(&mut store, draft("one"), epoch());
    let second = tracker.begin(&mut store, draft("two"), epoch());

    assert_ne!(first, second);
    assert_eq!(store.len(), 2);
    let pending = store
        .get(MessageKey::Provisional(first))
        .expect("pending message");
    assert_eq!(pending.status, DeliveryStatus::Pending);
    assert_eq!(pending.text, "one");
    assert_eq!(tracker.pending_count(), 2);
    assert_eq!(
        tracker.state(first),
        Some(&SendState::Pending {
            submitted_at: epoch()
        })
    );
}

#[test]
fn provisional_ids_render_in_temp_namespace() {
    let mut store = MessageStore::new();
    let mut tracker = SendTracker::new();
    let id = tracker.begin(&mut store, draft("one"), epoch());

    let rendered = id.to_string();
    assert!(rendered.starts_with("temp_"));
    assert_eq!(rendered.parse::<ProvisionalId>(), Ok(id));
    assert!("42".parse::<ProvisionalId>().is_err());
}

#[test]
fn malformed_provisional_ids_report_the_rejected_text() {
    let err = "temp_x".parse::<ProvisionalId>().unwrap_err();
    assert_eq!(err, InvalidProvisionalId("temp_x".to_string()));
    assert_eq!(err.to_string(), "invalid provisional id 'temp_x'");

    let boxed: Box<dyn std::error::Error> = Box::new(err);
    assert!(boxed.source().is_none());
}

#[test]
fn resolve_replaces_pending_with_durable() {
    let mut store = MessageStore::new();
    let mut tracker = SendTracker::new();
    let id = tracker.begin(&mut store, draft("hi"), epoch());

    assert_eq!(tracker.resolve(&mut store, id, echo(42, "hi")), Transition::Applied);

    let all = store.all();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].key, MessageKey::Durable(MessageId(42)));
    assert_eq!(all[0].status, DeliveryStatus::Sent);
    assert_eq!(tracker.state(id), Some(&SendState::Resolved(MessageId(42))));
}

#[test]
fn discard_removes_pending_and_keeps_others() {
    let mut store = MessageStore::new();
    let mut tracker = SendTracker::new();
    store.merge([Message::from(payload(1, 2, "bob", "before"))]);
    let id = tracker.begin(&mut store, draft("doomed"), epoch());

    assert_eq!(tracker.discard(&mut store, id), Transition::Applied);

    assert_eq!(store.len(), 1);
    assert_eq!(store.all()[0].text, "before");
    assert_eq!(tracker.state(id), Some(&SendState::Discarded));
}

#[test]
fn terminal_states_ignore_further_transitions() {
    let mut store = MessageStore::new();
    let mut tracker = SendTracker::new();
    let resolved = tracker.begin(&mut store, draft("a"), epoch());
    let discarded = tracker.begin(&mut store, draft("b"), epoch());
    tracker.resolve(&mut store, resolved, echo(10, "a"));
    tracker.discard(&mut store, discarded);
    let snapshot = store.all();

    assert_eq!(
        tracker.resolve(&mut store, resolved, echo(11, "a")),
        Transition::AlreadySettled
    );
    assert_eq!(tracker.discard(&mut store, resolved), Transition::AlreadySettled);
    assert_eq!(
        tracker.resolve(&mut store, discarded, echo(12, "b")),
        Transition::AlreadySettled
    );
    assert_eq!(store.all(), snapshot);
}

#[test]
fn unknown_ids_are_ignored() {
    let mut store = MessageStore::new();
    let mut tracker = SendTracker::new();

    assert_eq!(
        tracker.resolve(&mut store, ProvisionalId(99), echo(1, "x")),
        Transition::Unknown
    );
    assert_eq!(
        tracker.discard(&mut store, ProvisionalId(99)),
        Transition::Unknown
    );
    assert!(store.is_empty());
}

#[test]
fn resolve_after_poll_merged_the_echo_leaves_one_copy() {
    let mut store = MessageStore::new();
    let mut tracker = SendTracker::new();
    let id = tracker.begin(&mut store, draft("hi"), epoch());
    store.merge([echo(42, "hi")]);

    tracker.resolve(&mut store, id, echo(42, "hi"));

    assert_eq!(store.len(), 1);
    assert_eq!(store.all()[0].durable_id(), Some(MessageId(42)));
}

#[test]
fn adopt_echo_resolves_oldest_matching_pending_send() {
    let mut store = MessageStore::new();
    let mut tracker = SendTracker::new();
    let first = tracker.begin(&mut store, draft("same"), epoch());
    let second = tracker.begin(&mut store, draft("same"), epoch());
    let other = tracker.begin(&mut store, draft("different"), epoch());

    assert_eq!(tracker.adopt_echo(&mut store, &echo(5, "same")), Some(first));

    assert_eq!(tracker.state(first), Some(&SendState::Resolved(MessageId(5))));
    assert!(matches!(tracker.state(second), Some(SendState::Pending { .. })));
    assert!(matches!(tracker.state(other), Some(SendState::Pending { .. })));
    assert_eq!(store.len(), 3);
}

#[test]
fn adopt_echo_ignores_other_authors_and_anonymity_mismatch() {
    let mut store = MessageStore::new();
    let mut tracker = SendTracker::new();
    tracker.begin(&mut store, draft("hi"), epoch());

    let from_bob = Message::from(payload(5, 2, "bob", "hi"));
    assert_eq!(tracker.adopt_echo(&mut store, &from_bob), None);

    let mut anonymous = echo(6, "hi");
    anonymous.is_anonymous = true;
    assert_eq!(tracker.adopt_echo(&mut store, &anonymous), None);

    assert_eq!(tracker.pending_count(), 1);
}
