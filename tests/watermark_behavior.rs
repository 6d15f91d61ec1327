//! Behavior-driven tests for watermark progress
//!
//! These tests verify that the per-source watermark only moves forward and
//! gates which notices are considered.

use std::time::Duration;

use noticewatch_store::WatermarkPosition;
use noticewatch_tests::{notice, offline_client, open_store, NoticeOutcome, ProcessOptions, NOW};

const SOURCE: &str = "notice-api";

fn position(published_at: i64, item_id: &str) -> WatermarkPosition {
    WatermarkPosition::new(published_at, item_id)
}

// =============================================================================
// Watermark: Monotonicity
// =============================================================================

#[test]
fn when_a_batch_is_applied_then_the_watermark_covers_every_item() {
    // Given: A store with a watermark at (1000, "5")
    let (_temp, store) = open_store();
    store
        .update_watermark_from_batch(SOURCE, &[position(1_000, "5")], 1)
        .expect("seed");

    // When: A mixed batch arrives
    let batch = [position(900, "1"), position(2_000, "7"), position(2_000, "10")];
    let after = store
        .update_watermark_from_batch(SOURCE, &batch, 2)
        .expect("update")
        .expect("watermark");

    // Then: The watermark is the maximum of the batch and the old value
    let stored = after.position();
    assert!(batch.iter().all(|item| *item <= stored));
    assert!(position(1_000, "5") <= stored);
    assert_eq!(stored, position(2_000, "7"), "ids compare lexicographically");
}

#[test]
fn when_an_older_batch_arrives_then_the_watermark_does_not_regress() {
    // Given: A watermark at (5000, "9")
    let (_temp, store) = open_store();
    store
        .update_watermark_from_batch(SOURCE, &[position(5_000, "9")], 1)
        .expect("seed");

    // When: An out-of-order batch and an empty batch are applied
    store
        .update_watermark_from_batch(SOURCE, &[position(4_000, "99")], 2)
        .expect("older batch");
    let unchanged = store
        .update_watermark_from_batch(SOURCE, &[], 3)
        .expect("empty batch")
        .expect("watermark");

    // Then: The stored position is still the newest one ever seen
    assert_eq!(unchanged.position(), position(5_000, "9"));
    assert_eq!(unchanged.updated_at, 1);
}

#[test]
fn when_an_item_is_at_or_before_the_watermark_then_it_is_not_considered() {
    // Given: A watermark at (5000, "5")
    let (_temp, store) = open_store();
    store
        .update_watermark_from_batch(SOURCE, &[position(5_000, "5")], 1)
        .expect("seed");

    // When / Then: Only strictly newer positions pass
    let consider = |item: WatermarkPosition| store.should_consider(SOURCE, &item).expect("lookup");
    assert!(!consider(position(5_000, "5")));
    assert!(!consider(position(4_999, "9")));
    assert!(!consider(position(5_000, "4")));
    assert!(consider(position(5_000, "6")));
    assert!(consider(position(5_001, "0")));
    assert!(store.should_consider("other", &position(0, "")).expect("lookup"));
}

// =============================================================================
// Watermark: Boot and pipeline
// =============================================================================

#[test]
fn when_the_process_restarts_after_downtime_then_the_watermark_is_rearmed() {
    // Given: A client booted at NOW that then goes down for a day
    let (_temp, client) = offline_client();
    client.init_watermarks_at_boot(NOW).expect("boot");
    let next_day = NOW.saturating_add(Duration::from_secs(86_400));

    // When: It boots again and sees a listing published a minute before the restart
    client.init_watermarks_at_boot(next_day).expect("reboot");
    let missed = notice(
        "77",
        "신규 거래지원 안내 (ABC)",
        next_day.saturating_sub(Duration::from_secs(60)),
    );
    let outcomes = client
        .process_notice_at(&missed, ProcessOptions::default(), next_day)
        .expect("processed");

    // Then: The downtime is not replayed
    assert_eq!(outcomes, vec![NoticeOutcome::WatermarkSkipped]);
    let watermark = client
        .store()
        .watermark(SOURCE)
        .expect("lookup")
        .expect("watermark");
    assert_eq!(watermark.last_published_at, next_day.as_millis() - 5_000);
}

#[test]
fn when_the_process_restarts_quickly_then_a_newer_watermark_is_kept() {
    // Given: A watermark that already moved past the boot grace window
    let (_temp, store) = open_store();
    let grace = Duration::from_secs(5);
    store
        .initialize_watermark_at_boot(SOURCE, NOW.as_millis(), grace)
        .expect("boot");
    let advanced = store
        .update_watermark_from_batch(SOURCE, &[position(NOW.as_millis() + 30_000, "501")], 1)
        .expect("update")
        .expect("watermark");

    // When: The process boots again ten seconds later
    let rebooted = store
        .initialize_watermark_at_boot(SOURCE, NOW.as_millis() + 10_000, grace)
        .expect("reboot");

    // Then: Re-arming never moves the watermark backwards
    assert_eq!(rebooted, advanced);
}

#[test]
fn when_the_watermark_is_bypassed_then_old_notices_are_processed() {
    // Given: A client booted at NOW with an old listing notice
    let (_temp, client) = offline_client();
    client.init_watermarks_at_boot(NOW).expect("boot");
    let old = notice("42", "신규 거래지원 안내 (ABC)", NOW.saturating_sub(Duration::from_secs(3_600)));

    // When: It is processed normally and then with the watermark bypassed
    let gated = client
        .process_notice_at(&old, ProcessOptions::default(), NOW)
        .expect("gated pass");
    let replayed = client
        .process_notice_at(
            &old,
            ProcessOptions {
                bypass_watermark: true,
                bypass_cooldown: false,
            },
            NOW,
        )
        .expect("replay pass");

    // Then: The watermark skipped it first, the replay accepted it
    assert_eq!(gated, vec![NoticeOutcome::WatermarkSkipped]);
    assert!(replayed[0].accepted().is_some());
    assert_eq!(client.stats().snapshot().watermark_skipped, 1);
}
