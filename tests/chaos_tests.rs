// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the engine handles outages, hung targets and
//! corrupted input without panics, deadlocks or lost events.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::{email_insert, email_key, wait_until, Harness, Script, ScriptedTarget};
use insight_fanout::batch::DeliveryCoordinator;
use insight_fanout::config::{DeliveryConfig, FanoutConfig, SloConfig};
use insight_fanout::dead_letter::NoopDeadLetterSink;
use insight_fanout::error::ErrorKind;
use insight_fanout::stream::{encode_change_entry, maybe_decompress, parse_change_entry};
use insight_fanout::{EngineState, FanoutEngine, FanoutError, KeyedStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn coordinator_with(config: DeliveryConfig) -> DeliveryCoordinator {
    DeliveryCoordinator::new(config, SloConfig::default(), Arc::new(NoopDeadLetterSink))
}

async fn wait_for_activation(engine: &FanoutEngine, shard: &str) -> bool {
    wait_until(Duration::from_secs(2), move || async move {
        engine
            .health_check()
            .await
            .shard_checkpoints
            .get(shard)
            .is_some_and(|c| c.is_some())
    })
    .await
}

async fn audio_url(harness: &Harness, tenant: &str, id: &str) -> Option<String> {
    harness
        .store
        .get(&email_key(tenant, id))
        .await
        .ok()
        .flatten()
        .and_then(|r| r["aiInsights"]["summaryAudioUrl"].as_str().map(str::to_string))
}

// =============================================================================
// Corrupted Data Handling
// =============================================================================

/// Test: Corrupted zstd data doesn't panic
#[test]
fn corrupted_zstd_no_panic() {
    let corrupted_payloads: &[&[u8]] = &[
        // Just magic header, no content
        &[0x28, 0xB5, 0x2F, 0xFD],
        &[0x28, 0xB5, 0x2F, 0xFD, 0x00, 0x00, 0x00, 0x00],
        &[0x28, 0xB5, 0x2F, 0xFD, 0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE],
        // Truncated frame header
        &[0x28, 0xB5, 0x2F, 0xFD, 0x20],
    ];

    for (i, payload) in corrupted_payloads.iter().enumerate() {
        let result = maybe_decompress(payload);
        assert!(
            matches!(result, Err(FanoutError::Decompression(_))),
            "payload {} should fail to decompress",
            i
        );
    }

    // Partial magic is not zstd, so it passes through.
    let partial: [&[u8]; 4] = [&[0x28], &[0x28, 0xB5], &[0x28, 0xB5, 0x2F], &[]];
    for payload in partial {
        assert_eq!(maybe_decompress(payload).unwrap(), payload);
    }
}

/// Test: A corrupted image in a stream entry is a parse error, not a panic
#[test]
fn corrupted_entry_image_is_rejected() {
    let event = email_insert("s0", "1-0", "a@example.com", "1", Some("hello"));
    let encoded = encode_change_entry(&event, Some(0)).unwrap();

    let mut fields: HashMap<String, redis::Value> = encoded
        .into_iter()
        .map(|(k, v)| (k.to_string(), redis::Value::BulkString(v)))
        .collect();
    assert!(parse_change_entry("s0", "1-0", &fields).is_ok());

    // Keep the zstd magic, truncate the frame.
    fields.insert(
        "new".to_string(),
        redis::Value::BulkString(vec![0x28, 0xB5, 0x2F, 0xFD, 0x04, 0x00]),
    );
    assert!(parse_change_entry("s0", "1-0", &fields).is_err());

    // Valid JSON that does not match the recorded hash.
    fields.insert(
        "new".to_string(),
        redis::Value::BulkString(br#"{"userId":"mallory@example.com"}"#.to_vec()),
    );
    let err = parse_change_entry("s0", "1-0", &fields).unwrap_err();
    assert!(err.to_string().contains("hash mismatch"), "got: {}", err);
}

// =============================================================================
// Hung and Failing Targets
// =============================================================================

/// Test: A hung target call times out and only that record is redelivered
#[tokio::test]
async fn hung_target_times_out_without_stalling_batch() {
    let coordinator = coordinator_with(DeliveryConfig::testing());
    let target = ScriptedTarget::new("slow");
    target.script("2", Script::Hang);

    let batch: Vec<_> = (1..=4)
        .map(|i| email_insert("s0", &format!("{}-0", i), "a@example.com", &i.to_string(), Some("s")))
        .collect();

    let start = Instant::now();
    let outcomes = tokio::time::timeout(Duration::from_secs(2), coordinator.deliver(&batch, &*target))
        .await
        .expect("delivery must not hang");

    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(outcomes[1].needs_redelivery());
    assert!(outcomes.iter().enumerate().all(|(i, o)| i == 1 || o.is_success()));
    assert_eq!(target.delivered().len(), 3);
}

/// Test: Repeated transient failures open the circuit, which recovers
#[tokio::test]
async fn circuit_opens_and_recovers() {
    let mut config = DeliveryConfig::testing();
    config.circuit_failure_threshold = 2;
    config.circuit_reset_timeout = "100ms".to_string();
    let coordinator = coordinator_with(config);
    let target = ScriptedTarget::new("flaky");
    target.script("1", Script::Transient);
    let event = email_insert("s0", "1-0", "a@example.com", "1", Some("s"));

    for _ in 0..6 {
        let outcomes = coordinator.deliver(std::slice::from_ref(&event), &*target).await;
        assert!(outcomes[0].needs_redelivery());
    }

    let circuit = coordinator.circuit("flaky").await;
    assert!(circuit.rejections() >= 1, "circuit never rejected a call");
    assert!(target.calls() < 6);
    assert!(coordinator
        .circuit_states()
        .await
        .iter()
        .any(|(name, open)| name == "flaky" && *open));

    target.heal_all();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let outcomes = coordinator.deliver(std::slice::from_ref(&event), &*target).await;
    assert!(outcomes[0].is_success());
    assert_eq!(coordinator.attempts("flaky", "s0", &event.sequence_token).await, 0);
}

/// Test: A target that keeps failing is dead-lettered while its sibling
/// keeps delivering
#[tokio::test]
async fn failing_target_does_not_stall_sibling() {
    let mut harness = Harness::new(&["s0"]).await;
    harness.speech.fail_next(10_000);

    let mut engine = FanoutEngine::with_collaborators(
        FanoutConfig::for_testing("chaos"),
        Arc::new(harness.log.clone()),
        harness.collaborators.clone(),
    );
    engine.start().await.unwrap();
    assert!(wait_for_activation(&engine, "s0").await);

    harness.insert_email("s0", "a@example.com", "1", Some("Call me")).await;

    let bus = harness.bus.clone();
    assert!(wait_until(Duration::from_secs(2), move || {
        let bus = bus.clone();
        async move { bus.messages().await.len() == 1 }
    })
    .await);

    let letter = tokio::time::timeout(Duration::from_secs(5), harness.dead_letters.recv())
        .await
        .expect("tts failure was never dead-lettered")
        .unwrap();
    assert_eq!(letter.target, "tts");
    assert_eq!(letter.kind, ErrorKind::ExhaustedRetry);
    assert_eq!(letter.attempts, 10);
    assert!(audio_url(&harness, "a@example.com", "1").await.is_none());

    engine.shutdown().await;
}

// =============================================================================
// Source Outages
// =============================================================================

/// Test: Events written during a source outage are delivered once it ends
#[tokio::test]
async fn source_outage_delays_but_does_not_lose_events() {
    let harness = Harness::new(&["s0"]).await;
    let mut config = FanoutConfig::for_testing("outage");
    config.tts.enabled = false;

    let mut engine =
        FanoutEngine::with_collaborators(config, Arc::new(harness.log.clone()), harness.collaborators.clone());
    engine.start().await.unwrap();
    assert!(wait_for_activation(&engine, "s0").await);

    harness.log.set_available(false).await;
    harness.insert_email("s0", "a@example.com", "1", Some("s")).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(engine.state(), EngineState::Running);
    assert!(harness.bus.messages().await.is_empty());

    harness.log.set_available(true).await;
    let bus = harness.bus.clone();
    assert!(wait_until(Duration::from_secs(5), move || {
        let bus = bus.clone();
        async move { bus.messages().await.len() == 1 }
    })
    .await);

    engine.shutdown().await;
    assert_eq!(engine.state(), EngineState::Stopped);
}

// =============================================================================
// Shutdown and Restart
// =============================================================================

/// Test: Shutdown mid-batch abandons it, and a restart redelivers it
#[tokio::test]
async fn shutdown_mid_batch_redelivers_after_restart() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("checkpoints.db");
    let harness = Harness::new(&["s0"]).await;

    let mut config = FanoutConfig::for_testing("restart");
    config.cursor.sqlite_path = db.to_string_lossy().to_string();
    config.notifications.enabled = false;
    config.settings.delivery.call_timeout = "5s".to_string();

    harness.speech.set_delay(Some(Duration::from_millis(500)));
    let mut engine =
        FanoutEngine::with_collaborators(config.clone(), Arc::new(harness.log.clone()), harness.collaborators.clone());
    engine.start().await.unwrap();
    assert!(wait_for_activation(&engine, "s0").await);

    harness.insert_email("s0", "a@example.com", "1", Some("Quarterly review")).await;
    let speech = harness.speech.clone();
    assert!(wait_until(Duration::from_secs(2), move || {
        let speech = speech.clone();
        async move { speech.calls() >= 1 }
    })
    .await);

    let start = Instant::now();
    engine.shutdown().await;
    assert!(start.elapsed() < Duration::from_secs(2), "shutdown waited for the batch");
    assert!(audio_url(&harness, "a@example.com", "1").await.is_none());

    harness.speech.set_delay(None);
    let mut engine = FanoutEngine::with_collaborators(config, Arc::new(harness.log.clone()), harness.collaborators.clone());
    engine.start().await.unwrap();

    let h = &harness;
    let linked = wait_until(Duration::from_secs(5), move || async move {
        audio_url(h, "a@example.com", "1").await.is_some()
    })
    .await;
    assert!(linked, "abandoned event was not redelivered after restart");
    assert!(harness.speech.calls() >= 2);

    engine.shutdown().await;
}

/// Test: Shutdown while the source is down still completes
#[tokio::test]
async fn shutdown_during_outage_completes() {
    let harness = Harness::new(&["s0", "s1"]).await;
    let mut engine = FanoutEngine::with_collaborators(
        FanoutConfig::for_testing("down"),
        Arc::new(harness.log.clone()),
        harness.collaborators.clone(),
    );
    engine.start().await.unwrap();
    harness.log.set_available(false).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let result = tokio::time::timeout(Duration::from_secs(3), engine.shutdown()).await;
    assert!(result.is_ok(), "shutdown hung during outage");
    assert_eq!(engine.state(), EngineState::Stopped);
}
