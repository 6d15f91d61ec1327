//! Behavior-driven tests for dedup and cooldown state
//!
//! These tests verify HOW the store treats repeated events, concurrent
//! writers and the cross-source cooldown index.

use std::time::Duration;

use noticewatch_store::InsertOutcome;
use noticewatch_tests::{open_store, record, NOW};

// =============================================================================
// Dedup: Idempotent inserts
// =============================================================================

#[test]
fn when_an_event_is_marked_twice_then_the_second_is_a_duplicate() {
    // Given: A fresh store
    let (_temp, store) = open_store();
    let event = record(&"ab".repeat(32), "ABC", NOW.as_millis());

    // When: The same event is marked twice
    let first = store.try_mark_processed(&event).expect("first insert");
    let second = store.try_mark_processed(&event).expect("second insert");

    // Then: Inserted then duplicate, and one row exists
    assert_eq!(first, InsertOutcome::Inserted);
    assert_eq!(second, InsertOutcome::Duplicate);
    assert_eq!(store.event_count().expect("count"), 1);
    assert_eq!(store.event(&event.event_id).expect("read"), Some(event));
}

#[test]
fn when_many_writers_race_on_one_id_then_exactly_one_inserts() {
    // Given: A store shared by concurrent writers
    let (_temp, store) = open_store();
    let event = record(&"cd".repeat(32), "ABC", NOW.as_millis());

    // When: 16 threads mark the same event at once
    let outcomes: Vec<InsertOutcome> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..16)
            .map(|_| scope.spawn(|| store.try_mark_processed(&event).expect("insert")))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("writer thread"))
            .collect()
    });

    // Then: One insert, fifteen duplicates
    let inserted = outcomes
        .iter()
        .filter(|outcome| **outcome == InsertOutcome::Inserted)
        .count();
    assert_eq!(inserted, 1);
    assert_eq!(outcomes.len() - inserted, 15);
    assert_eq!(store.event_count().expect("count"), 1);
}

#[test]
fn when_an_event_id_is_not_a_digest_then_the_write_is_rejected() {
    // Given: A record with a malformed id
    let (_temp, store) = open_store();
    let event = record("not-a-digest", "ABC", NOW.as_millis());

    // When / Then: The store refuses it without writing
    assert!(store.try_mark_processed(&event).is_err());
    assert_eq!(store.event_count().expect("count"), 0);
}

// =============================================================================
// Dedup: Cooldown and retention
// =============================================================================

#[test]
fn when_a_base_was_acted_on_recently_then_it_is_in_cooldown() {
    // Given: A base traded one minute ago
    let (_temp, store) = open_store();
    let acted_at = NOW.as_millis() - 60_000;
    store
        .mark_base_as_traded("ABC", &"ef".repeat(32), acted_at)
        .expect("mark traded");

    // When / Then: It is in a 30 minute cooldown but not a 30 second one
    assert!(store
        .is_base_recently_traded("ABC", Duration::from_secs(30 * 60), NOW.as_millis())
        .expect("lookup"));
    assert!(!store
        .is_base_recently_traded("ABC", Duration::from_secs(30), NOW.as_millis())
        .expect("lookup"));
    assert!(!store
        .is_base_recently_traded("XYZ", Duration::from_secs(30 * 60), NOW.as_millis())
        .expect("lookup"));
}

#[test]
fn when_retention_cleanup_runs_then_only_old_rows_are_removed() {
    // Given: One old and one fresh event plus an old cooldown row
    let (_temp, store) = open_store();
    let day_ms = 24 * 60 * 60 * 1_000;
    let old = record(&"01".repeat(32), "OLD", NOW.as_millis() - 8 * day_ms);
    let fresh = record(&"02".repeat(32), "NEW", NOW.as_millis() - day_ms);
    store.try_mark_processed(&old).expect("insert old");
    store.try_mark_processed(&fresh).expect("insert fresh");
    store
        .mark_base_as_traded("OLD", &old.event_id, old.created_at)
        .expect("mark traded");

    // When: A seven day retention sweep runs
    let report = store
        .cleanup_older_than(Duration::from_secs(7 * 24 * 60 * 60), NOW.as_millis())
        .expect("cleanup");

    // Then: Only the old rows go
    assert_eq!(report.events_removed, 1);
    assert_eq!(report.bases_removed, 1);
    assert_eq!(store.event(&old.event_id).expect("read"), None);
    assert!(store.event(&fresh.event_id).expect("read").is_some());
}
