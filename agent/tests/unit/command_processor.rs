//! Unit tests for the inbound command processor.
//!
//! Drives `handle_remote`/`handle_local` directly with in-memory mocks and
//! inspects the relay queue, the store and the workloads that were built.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use hive_agent::application::services::command_processor::{Flow, ProcessorExit};
use hive_agent::domain::{AgentState, OutboundMessage};
use hive_common::Mode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::helpers::{
    AGENT, PROMPTLY, config, config_line, drain, processor, processor_with, processor_with_relay,
};
use crate::mocks::{Behaviour, MemoryConfigStore, RecordingFactory};

// ── CONFIG ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn first_config_is_acknowledged_persisted_and_started() {
    let (mut processor, mut fx) = processor(Behaviour::Cooperative);

    let flow = processor
        .handle_remote(&config_line("honeypot", 1))
        .await
        .expect("handled");

    assert_eq!(flow, Flow::Continue);
    assert_eq!(drain(&mut fx.relay_rx), vec![OutboundMessage::ping()]);
    assert_eq!(fx.store.saves(), vec![config(AGENT, "honeypot", 1)]);
    assert_eq!(fx.factory.built_modes(), vec![Mode::Honeypot]);
    assert_eq!(processor.config(), &config(AGENT, "honeypot", 1));
    assert!(processor.config_received());
    assert_eq!(*fx.state.borrow(), AgentState::Running);
    assert!(fx.supervisor.lock().await.is_running());
}

#[tokio::test]
async fn duplicate_config_is_acknowledged_but_not_reapplied() {
    let (mut processor, mut fx) = processor(Behaviour::Cooperative);

    processor.handle_remote(&config_line("honeypot", 1)).await.unwrap();
    processor.handle_remote(&config_line("honeypot", 1)).await.unwrap();

    assert_eq!(
        drain(&mut fx.relay_rx),
        vec![OutboundMessage::ping(), OutboundMessage::ping()]
    );
    assert_eq!(fx.store.saves().len(), 1);
    assert_eq!(fx.factory.built().len(), 1);
    assert!(!fx.log.contains("stop:honeypot"));
    assert!(!fx.factory.built()[0].stop_requested());
}

#[tokio::test]
async fn duplicate_with_reordered_keys_is_still_a_duplicate() {
    let (mut processor, fx) = processor(Behaviour::Cooperative);
    let reordered = format!(
        r#"{AGENT} CONFIG {{"sensor":{{"generation":1}},"coordinator":{{"event_url":"tcp://coord:5713","command_url":"tcp://coord:5712"}},"mode":"honeypot","id":"{AGENT}"}}"#
    );

    processor.handle_remote(&config_line("honeypot", 1)).await.unwrap();
    processor.handle_remote(&reordered).await.unwrap();

    assert_eq!(fx.store.saves().len(), 1);
    assert_eq!(fx.factory.built().len(), 1);
}

#[tokio::test]
async fn first_config_applies_even_when_equal_to_persisted() {
    // The processor starts from the persisted document: unset mode, generation 0.
    let (mut processor, fx) = processor(Behaviour::Cooperative);

    processor.handle_remote(&config_line("", 0)).await.unwrap();

    assert_eq!(fx.store.saves().len(), 1);
    assert!(fx.factory.built().is_empty());
    assert!(processor.config_received());
    assert_eq!(*fx.state.borrow(), AgentState::Configured);
}

#[tokio::test]
async fn new_config_persists_then_stops_old_then_builds_new() {
    let (mut processor, fx) = processor(Behaviour::Cooperative);

    processor.handle_remote(&config_line("honeypot", 1)).await.unwrap();
    processor.handle_remote(&config_line("client", 2)).await.unwrap();

    let saved = fx.log.position("save:client").expect("persisted");
    let stopped = fx.log.position("stop:honeypot").expect("old stopped");
    let built = fx.log.position("build:client").expect("new built");
    assert!(saved < stopped, "log: {:?}", fx.log.entries());
    assert!(stopped < built, "log: {:?}", fx.log.entries());

    let workloads = fx.factory.built();
    assert!(workloads[0].exited(), "previous workload still running");
    assert_eq!(workloads[1].config(), &config(AGENT, "client", 2));
    assert_eq!(fx.store.saves().last(), Some(&config(AGENT, "client", 2)));
    assert_eq!(fx.supervisor.lock().await.current_mode(), Some(Mode::Client));
}

#[tokio::test]
async fn changed_section_restarts_same_mode() {
    let (mut processor, fx) = processor(Behaviour::Cooperative);

    processor.handle_remote(&config_line("honeypot", 1)).await.unwrap();
    processor.handle_remote(&config_line("honeypot", 2)).await.unwrap();

    assert_eq!(fx.factory.built_modes(), vec![Mode::Honeypot, Mode::Honeypot]);
    assert!(fx.factory.built()[0].stop_requested());
}

#[tokio::test]
async fn switching_to_unset_stops_the_workload() {
    let (mut processor, fx) = processor(Behaviour::Cooperative);

    processor.handle_remote(&config_line("honeypot", 1)).await.unwrap();
    processor.handle_remote(&config_line("", 2)).await.unwrap();

    assert!(fx.factory.built()[0].exited());
    assert!(!fx.supervisor.lock().await.is_running());
    assert_eq!(*fx.state.borrow(), AgentState::Configured);
}

#[tokio::test]
async fn unparsable_config_is_acknowledged_then_discarded() {
    let (mut processor, mut fx) = processor(Behaviour::Cooperative);

    let flow = processor
        .handle_remote(&format!("{AGENT} CONFIG {{not json"))
        .await
        .unwrap();

    assert_eq!(flow, Flow::Continue);
    assert_eq!(drain(&mut fx.relay_rx), vec![OutboundMessage::ping()]);
    assert!(fx.store.saves().is_empty());
    assert!(!processor.config_received());
}

#[tokio::test]
async fn config_for_another_identity_is_discarded() {
    let (mut processor, fx) = processor(Behaviour::Cooperative);
    let foreign = format!("{AGENT} CONFIG {}", crate::helpers::config_doc("B7", "client", 1));

    processor.handle_remote(&foreign).await.unwrap();

    assert!(fx.store.saves().is_empty());
    assert!(fx.factory.built().is_empty());
    assert_eq!(processor.config(), &config(AGENT, "", 0));
}

// ── Protocol rejection ────────────────────────────────────────────────────────

#[tokio::test]
async fn message_for_another_agent_changes_nothing() {
    let (mut processor, mut fx) = processor(Behaviour::Cooperative);
    processor.handle_remote(&config_line("honeypot", 1)).await.unwrap();
    drain(&mut fx.relay_rx);

    for line in [
        format!("B7 CONFIG {}", crate::helpers::config_doc("B7", "client", 9)),
        format!("{AGENT}0 DELETE"),
        "B7 RESTART now".to_string(),
    ] {
        let flow = processor.handle_remote(&line).await.unwrap();
        assert_eq!(flow, Flow::Continue, "for {line:?}");
    }

    assert!(drain(&mut fx.relay_rx).is_empty());
    assert!(fx.dispatch_rx.try_recv().is_err());
    assert_eq!(fx.store.saves().len(), 1);
    assert_eq!(processor.config(), &config(AGENT, "honeypot", 1));
    assert!(!fx.factory.built()[0].stop_requested());
}

#[tokio::test]
async fn malformed_lines_are_discarded() {
    let (mut processor, mut fx) = processor(Behaviour::Cooperative);

    for line in ["", AGENT, " CONFIG {}"] {
        let flow = processor.handle_remote(line).await.unwrap();
        assert_eq!(flow, Flow::Continue, "for {line:?}");
    }

    assert!(drain(&mut fx.relay_rx).is_empty());
    assert!(fx.store.saves().is_empty());
}

// ── DELETE ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn delete_stops_the_running_workload() {
    let (mut processor, fx) = processor(Behaviour::Cooperative);
    processor.handle_remote(&config_line("client", 1)).await.unwrap();

    let flow = processor.handle_remote(&format!("{AGENT} DELETE")).await.unwrap();

    assert_eq!(flow, Flow::Delete);
    let workload = &fx.factory.built()[0];
    assert!(workload.stop_requested());
    assert!(workload.exited());
    assert!(!fx.supervisor.lock().await.is_running());
    assert_eq!(*fx.state.borrow(), AgentState::Terminating);
}

#[tokio::test]
async fn delete_without_workload_still_deletes() {
    let (mut processor, _fx) = processor(Behaviour::Cooperative);
    let flow = processor
        .handle_remote(&format!("{AGENT} DELETE ignored payload"))
        .await
        .unwrap();
    assert_eq!(flow, Flow::Delete);
}

// ── Pass-through ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_command_goes_to_dispatch_only() {
    let (mut processor, mut fx) = processor(Behaviour::Cooperative);

    let flow = processor
        .handle_remote(&format!("{AGENT} RESTART_CAPABILITY ssh  now"))
        .await
        .unwrap();

    assert_eq!(flow, Flow::Continue);
    assert_eq!(fx.dispatch_rx.try_recv().unwrap(), "RESTART_CAPABILITY ssh  now");
    assert!(drain(&mut fx.relay_rx).is_empty());
}

#[tokio::test]
async fn pass_through_without_listeners_is_fine() {
    let (mut processor, fx) = processor(Behaviour::Cooperative);
    drop(fx.dispatch_rx);
    let flow = processor.handle_remote(&format!("{AGENT} PROBE")).await.unwrap();
    assert_eq!(flow, Flow::Continue);
}

// ── Failures that escalate ────────────────────────────────────────────────────

#[tokio::test]
async fn persistence_failure_is_an_error_and_starts_nothing() {
    let (mut processor, fx) = processor_with(MemoryConfigStore::failing, |log| {
        RecordingFactory::new(log, Behaviour::Cooperative)
    });

    let err = processor
        .handle_remote(&config_line("honeypot", 1))
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("persisting configuration"));
    assert!(fx.factory.built().is_empty());
    assert_eq!(processor.config(), &config(AGENT, "", 0));
    assert!(!processor.config_received());
}

#[tokio::test]
async fn unbuildable_mode_is_an_error() {
    let (mut processor, _fx) = processor_with(MemoryConfigStore::new, |log| {
        RecordingFactory::new(log, Behaviour::Cooperative).refusing(Mode::Client)
    });

    let err = processor
        .handle_remote(&config_line("client", 1))
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("no command configured"));
}

// ── Local producers ───────────────────────────────────────────────────────────

#[tokio::test]
async fn local_line_is_forwarded_unchanged() {
    let (processor, mut fx) = processor(Behaviour::Cooperative);

    processor.handle_local(r#"SESSION {"src": "10.0.0.9"}"#);
    processor.handle_local("");
    processor.handle_local("HEARTBEAT");

    assert_eq!(
        drain(&mut fx.relay_rx),
        vec![
            OutboundMessage::new("SESSION", Some(r#"{"src": "10.0.0.9"}"#.to_string())),
            OutboundMessage::new("HEARTBEAT", None),
        ]
    );
}

// ── Full relay queue ──────────────────────────────────────────────────────────

#[tokio::test]
async fn full_relay_queue_drops_local_lines_instead_of_blocking() {
    let (processor, mut fx) = processor_with_relay(Behaviour::Cooperative, 1);

    processor.handle_local("EVT one");
    processor.handle_local("EVT two");

    assert_eq!(
        drain(&mut fx.relay_rx),
        vec![OutboundMessage::new("EVT", Some("one".to_string()))]
    );
}

#[tokio::test]
async fn config_applies_even_when_its_ack_cannot_be_queued() {
    let (mut processor, fx) = processor_with_relay(Behaviour::Cooperative, 1);
    processor.handle_local("EVT one");

    tokio::time::timeout(PROMPTLY, processor.handle_remote(&config_line("honeypot", 1)))
        .await
        .expect("not blocked on the relay queue")
        .unwrap();

    assert_eq!(fx.store.saves(), vec![config(AGENT, "honeypot", 1)]);
    assert_eq!(fx.factory.built_modes(), vec![Mode::Honeypot]);
}

#[tokio::test]
async fn delete_is_handled_while_the_relay_queue_is_full() {
    let (processor, _fx) = processor_with_relay(Behaviour::Cooperative, 1);
    let (remote_tx, remote_rx) = mpsc::channel(8);
    let (local_tx, local_rx) = mpsc::channel(8);
    let run = tokio::spawn(processor.run(remote_rx, Some(local_rx), CancellationToken::new()));

    local_tx.send("EVT one".to_string()).await.unwrap();
    local_tx.send("EVT two".to_string()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    remote_tx.send(format!("{AGENT} DELETE")).await.unwrap();

    let exit = tokio::time::timeout(PROMPTLY, run)
        .await
        .expect("DELETE handled despite the full relay queue")
        .unwrap()
        .expect("no error");
    assert_eq!(exit, ProcessorExit::Deleted);
}

// ── run() ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn run_ends_with_deleted_on_delete() {
    let (processor, mut fx) = processor(Behaviour::Cooperative);
    let (remote_tx, remote_rx) = mpsc::channel(8);

    remote_tx.send(config_line("honeypot", 1)).await.unwrap();
    remote_tx.send(format!("{AGENT} DELETE")).await.unwrap();

    let exit = tokio::time::timeout(
        PROMPTLY,
        processor.run(remote_rx, None, CancellationToken::new()),
    )
    .await
    .expect("run finished")
    .expect("no error");

    assert_eq!(exit, ProcessorExit::Deleted);
    assert!(fx.factory.built()[0].exited());
    assert_eq!(drain(&mut fx.relay_rx), vec![OutboundMessage::ping()]);
}

#[tokio::test]
async fn run_forwards_local_lines() {
    let (processor, mut fx) = processor(Behaviour::Cooperative);
    let (_remote_tx, remote_rx) = mpsc::channel::<String>(8);
    let (local_tx, local_rx) = mpsc::channel(8);
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(processor.run(remote_rx, Some(local_rx), shutdown.clone()));

    local_tx.send("ALERT brute force".to_string()).await.unwrap();
    let forwarded = tokio::time::timeout(PROMPTLY, fx.relay_rx.recv())
        .await
        .expect("forwarded in time")
        .unwrap();
    shutdown.cancel();

    assert_eq!(
        forwarded,
        OutboundMessage::new("ALERT", Some("brute force".to_string()))
    );
    let exit = run.await.unwrap().expect("no error");
    assert_eq!(exit, ProcessorExit::Stopped);
}

#[tokio::test]
async fn run_stops_when_coordinator_channel_closes() {
    let (processor, _fx) = processor(Behaviour::Cooperative);
    let (remote_tx, remote_rx) = mpsc::channel::<String>(8);
    drop(remote_tx);

    let exit = tokio::time::timeout(PROMPTLY, processor.run(remote_rx, None, CancellationToken::new()))
        .await
        .expect("run finished")
        .expect("no error");
    assert_eq!(exit, ProcessorExit::Stopped);
}

#[tokio::test]
async fn run_stops_on_shutdown_even_with_closed_local_queue() {
    let (processor, _fx) = processor(Behaviour::Cooperative);
    let (_remote_tx, remote_rx) = mpsc::channel::<String>(8);
    let (local_tx, local_rx) = mpsc::channel::<String>(8);
    drop(local_tx);
    let shutdown = CancellationToken::new();

    let run = tokio::spawn(processor.run(remote_rx, Some(local_rx), shutdown.clone()));
    tokio::task::yield_now().await;
    shutdown.cancel();

    let exit = tokio::time::timeout(PROMPTLY, run)
        .await
        .expect("run finished")
        .unwrap()
        .expect("no error");
    assert_eq!(exit, ProcessorExit::Stopped);
}
