//! Contract Test: Startup Detection
//!
//! Verifies how a tunnel attempt resolves from the process output, its exit
//! and the deadline.
//!
//! Constraints verified:
//! - A registered connection resolves the attempt without waiting for the deadline
//! - Noise alone runs into the deadline, and a timed-out process is terminated exactly once
//! - A fatal line before quorum fails the attempt; later success lines are ignored
//! - Resolution is exactly-once whichever terminal event comes first
//! - Repeated registrations of one connection index count once
//! - Advisory (INF) lines never fail an attempt, whatever they mention
//!
//! If this test fails, the state machine or its async driver lets a terminal
//! event be lost, reported twice, or resolved without stopping the process.

mod common;

use common::*;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tunnel_core::startup::{FailureReason, run_startup};
use tunnel_core::traits::TunnelProcess;
use tunnel_core::{
    CancellationToken, Error, NamedTunnel, Phase, SignalDetector, StartupConfig, StartupOutcome,
    TunnelAttempt, TunnelMode,
};

fn detector() -> SignalDetector {
    SignalDetector::new("trycloudflare.com").unwrap()
}

fn named() -> TunnelMode {
    TunnelMode::Named(NamedTunnel::new(
        "6ff42ae2-765d-4adf-8112-31c55c1551ef",
        "/etc/tunnel/6ff42ae2.json",
    ))
}

fn attempt(mode: TunnelMode, config: &StartupConfig) -> TunnelAttempt {
    TunnelAttempt::new(8080, mode, config)
}

fn scripted(script: Script) -> (ScriptedProcess, Arc<AtomicUsize>) {
    let terminations = Arc::new(AtomicUsize::new(0));
    (
        ScriptedProcess::spawn(script, Arc::clone(&terminations)),
        terminations,
    )
}

fn count(counter: &AtomicUsize) -> usize {
    counter.load(std::sync::atomic::Ordering::SeqCst)
}

#[tokio::test]
async fn registration_resolves_ready_without_waiting_for_deadline() {
    let script = Script::new()
        .line("2024-05-01T10:00:00Z INF Starting tunnel tunnelID=6ff42ae2-765d-4adf-8112-31c55c1551ef")
        .line(registered(0, "fra01"));
    let (mut process, terminations) = scripted(script);

    let started = std::time::Instant::now();
    let (outcome, rest) = run_startup(
        &mut process,
        attempt(named(), &StartupConfig::default()),
        &detector(),
        None,
    )
    .await;

    assert!(started.elapsed() < Duration::from_secs(1));
    let ready = assert_ok!(outcome.into_result());
    assert!(ready.connections >= 1);
    assert_eq!(ready.locations, vec!["fra01".to_string()]);
    assert_eq!(
        ready.tunnel_id.as_deref(),
        Some("6ff42ae2-765d-4adf-8112-31c55c1551ef")
    );
    assert!(rest.is_some(), "ready tunnels keep their output stream");
    assert_eq!(count(&terminations), 0);
    assert!(process.exit_watch().borrow().is_none());
}

#[tokio::test(start_paused = true)]
async fn noise_only_times_out_and_terminates_exactly_once() {
    let script = Script::new()
        .line("2024-05-01T10:00:00Z INF Starting tunnel tunnelID=6ff42ae2-765d-4adf-8112-31c55c1551ef")
        .line("2024-05-01T10:00:00Z INF Generated Connector ID: 2b1c7e09-6a3d-4f0e-9d3a-1f0b2c3d4e5f");
    let (mut process, terminations) = scripted(script);

    let (outcome, rest) = run_startup(
        &mut process,
        attempt(named(), &StartupConfig::default()),
        &detector(),
        None,
    )
    .await;

    match outcome {
        StartupOutcome::TimedOut { after, ref context } => {
            assert_eq!(after, Duration::from_secs(60));
            assert_eq!(context.last_lines.len(), 2);
            assert!(context.last_lines[1].contains("Generated Connector ID"));
        }
        other => panic!("expected TimedOut, got {:?}", other),
    }
    assert!(rest.is_none());
    assert_eq!(count(&terminations), 1);

    // Nothing re-arms after resolution
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(count(&terminations), 1);
}

#[tokio::test]
async fn fatal_line_before_quorum_never_becomes_ready() {
    let script = Script::new()
        .line("2024-05-01T10:00:00Z ERR Failed to get tunnel credentials: open /etc/tunnel/6ff42ae2.json: no such file or directory")
        .line(registered(0, "fra01"))
        .line(registered(1, "ams02"));
    let (mut process, terminations) = scripted(script);

    let (outcome, _) = run_startup(
        &mut process,
        attempt(named(), &StartupConfig::default()),
        &detector(),
        None,
    )
    .await;

    match outcome {
        StartupOutcome::Failed {
            reason: FailureReason::FatalLog { ref message },
            ..
        } => assert!(message.contains("credentials")),
        other => panic!("expected a fatal failure, got {:?}", other),
    }
    assert_eq!(count(&terminations), 1);
}

#[test]
fn ready_is_reached_exactly_once() {
    let now = tokio::time::Instant::now();
    let detector = detector();
    let mut attempt = attempt(named(), &StartupConfig::default());
    attempt.spawned();

    assert!(attempt.on_line("INF Starting tunnel", &detector, now).is_none());
    let first = attempt.on_line(&registered(0, "fra01"), &detector, now);
    assert!(matches!(first, Some(StartupOutcome::Ready(_))));

    // Later fatal lines, exits and the deadline are ignored
    assert!(
        attempt
            .on_line("ERR Unauthorized: Invalid tunnel secret", &detector, now)
            .is_none()
    );
    assert!(attempt.on_line(&registered(1, "ams02"), &detector, now).is_none());
    assert!(attempt.on_exit(Some(1)).is_none());
    assert!(attempt.on_deadline().is_none());
    assert_eq!(attempt.phase(), Phase::Ready);
}

#[tokio::test]
async fn exit_before_ready_fails_with_exit_code_and_tail() {
    let script = Script::new()
        .line("2024-05-01T10:00:00Z INF Starting tunnel tunnelID=6ff42ae2-765d-4adf-8112-31c55c1551ef")
        .exit(1);
    let (mut process, _) = scripted(script);

    let (outcome, _) = run_startup(
        &mut process,
        attempt(named(), &StartupConfig::default()),
        &detector(),
        None,
    )
    .await;

    let err = assert_err!(outcome.into_result());
    match err {
        Error::ProcessExited { code, ref context } => {
            assert_eq!(code, Some(1));
            assert_eq!(context.exit_code, Some(1));
            assert!(context.tail().contains("Starting tunnel"));
        }
        other => panic!("expected ProcessExited, got {:?}", other),
    }
}

#[tokio::test]
async fn fatal_line_written_just_before_exit_wins() {
    let script = Script::new()
        .line("2024-05-01T10:00:00Z ERR Register tunnel error from server side error=\"Unauthorized: Invalid tunnel secret\" connIndex=0")
        .exit(1);
    let (mut process, _) = scripted(script);

    let (outcome, _) = run_startup(
        &mut process,
        attempt(named(), &StartupConfig::default()),
        &detector(),
        None,
    )
    .await;

    assert!(matches!(assert_err!(outcome.into_result()), Error::FatalLogSignal { .. }));
}

#[tokio::test(start_paused = true)]
async fn quick_tunnel_waits_for_its_url() {
    let script = Script::new()
        .line("2024-05-01T10:00:00Z INF Requesting new quick Tunnel on trycloudflare.com...")
        .line(registered(0, "lax08"))
        .sleep(Duration::from_secs(2))
        .line(quick_url_banner("https://shiny-bird-lamp.trycloudflare.com"));
    let (mut process, terminations) = scripted(script);

    let (outcome, _) = run_startup(
        &mut process,
        attempt(TunnelMode::Quick, &StartupConfig::default()),
        &detector(),
        None,
    )
    .await;

    let ready = assert_ok!(outcome.into_result());
    assert_eq!(
        ready.url.as_deref(),
        Some("https://shiny-bird-lamp.trycloudflare.com")
    );
    assert!(ready.elapsed >= Duration::from_secs(2));
    assert_eq!(count(&terminations), 0);
}

#[tokio::test]
async fn quick_tunnel_without_origin_cert_becomes_ready() {
    let script = Script::new()
        .line("2024-05-01T10:00:00Z INF Requesting new quick Tunnel on trycloudflare.com...")
        .line(quick_url_banner("https://shiny-bird-lamp.trycloudflare.com"))
        .line("2024-05-01T10:00:00Z INF Cannot determine default origin certificate path. No file cert.pem in [~/.cloudflared ~/.cloudflare-warp ~/cloudflare-warp /etc/cloudflared /usr/local/etc/cloudflared]. You need to specify the origin certificate path by specifying the origincert option in the configuration file, or set TUNNEL_ORIGIN_CERT environment variable originCertPath=")
        .line(registered(0, "lax08"));
    let (mut process, terminations) = scripted(script);

    let (outcome, _) = run_startup(
        &mut process,
        attempt(TunnelMode::Quick, &StartupConfig::default()),
        &detector(),
        None,
    )
    .await;

    let ready = assert_ok!(outcome.into_result());
    assert_eq!(
        ready.url.as_deref(),
        Some("https://shiny-bird-lamp.trycloudflare.com")
    );
    assert_eq!(count(&terminations), 0);
}

#[tokio::test(start_paused = true)]
async fn repeated_connection_index_counts_once() {
    let config = StartupConfig {
        min_connections: 2,
        ..StartupConfig::default()
    };

    let duplicate = Script::new()
        .line(registered(0, "fra01"))
        .line(registered(0, "fra01"));
    let (mut first, _) = scripted(duplicate);
    let (outcome, _) = run_startup(&mut first, attempt(named(), &config), &detector(), None).await;
    assert!(matches!(outcome, StartupOutcome::TimedOut { .. }));

    let distinct = Script::new()
        .line(registered(0, "fra01"))
        .line(registered(1, "ams02"));
    let (mut second, _) = scripted(distinct);
    let (outcome, _) = run_startup(&mut second, attempt(named(), &config), &detector(), None).await;
    let ready = assert_ok!(outcome.into_result());
    assert_eq!(ready.connections, 2);
}

#[tokio::test(start_paused = true)]
async fn cancellation_fails_the_attempt_and_stops_the_process() {
    let (mut process, terminations) = scripted(Script::new().line("INF Starting tunnel"));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let (outcome, _) = run_startup(
        &mut process,
        attempt(named(), &StartupConfig::default()),
        &detector(),
        Some(cancel),
    )
    .await;

    assert!(matches!(
        outcome,
        StartupOutcome::Failed {
            reason: FailureReason::Cancelled,
            ..
        }
    ));
    assert_eq!(count(&terminations), 1);
}
