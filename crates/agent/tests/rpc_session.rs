//! Drives a full agent session over an in-memory duplex channel:
//! handshake, load, count, run with event interleaving, stop.

mod common;

use agent::{AgentSession, SessionEnd};
use engine::RunSummary;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{DuplexStream, duplex};
use tokio_util::codec::Framed;
use types::{
    AgentCodec, CMD_COUNT_TEST_CASES, CMD_LOAD, CMD_RUN, CMD_STOP_RUN, CommandFrame,
    CommandOutcome, ErrorEnvelope, EventFrame, Frame, FrameKind, EVENT_AGENT_STARTED,
    EVENT_TEST_PROGRESS,
};

type Client = Framed<DuplexStream, AgentCodec>;

async fn start_session(agent_id: &str) -> (Client, tokio::task::JoinHandle<SessionEnd>) {
    let (client_stream, server_stream) = duplex(256 * 1024);
    let agent_id = agent_id.to_owned();
    let server = tokio::spawn(async move {
        AgentSession::new(agent_id)
            .serve_stream(server_stream)
            .await
            .expect("session should serve")
    });
    let mut client = Framed::new(client_stream, AgentCodec::default());

    let frame = client
        .next()
        .await
        .expect("handshake frame should arrive")
        .expect("handshake frame should decode");
    assert_eq!(frame.kind, FrameKind::Event);
    let event = EventFrame::decode(&frame.payload).expect("handshake event should decode");
    assert_eq!(event.code, EVENT_AGENT_STARTED);
    (client, server)
}

async fn send_command(client: &mut Client, name: &str, args: &[&str]) {
    let command = CommandFrame::new(name, args.iter().map(|arg| (*arg).to_owned()));
    client
        .send(Frame::command(&command))
        .await
        .expect("command frame should send");
}

/// Reads frames until the result arrives, returning interleaved progress
/// events and the outcome.
async fn read_conversation(client: &mut Client) -> (Vec<String>, CommandOutcome) {
    let mut events = Vec::new();
    loop {
        let frame = client
            .next()
            .await
            .expect("conversation frame should arrive")
            .expect("conversation frame should decode");
        match frame.kind {
            FrameKind::Event => {
                let event = EventFrame::decode(&frame.payload).expect("event should decode");
                assert_eq!(event.code, EVENT_TEST_PROGRESS);
                events.push(event.body);
            }
            FrameKind::CommandResult => {
                let outcome =
                    CommandOutcome::decode(&frame.payload).expect("outcome should decode");
                return (events, outcome);
            }
            other => panic!("unexpected frame kind {other:?} mid-conversation"),
        }
    }
}

fn expect_ok(outcome: CommandOutcome) -> String {
    match outcome {
        CommandOutcome::Ok(payload) => payload,
        CommandOutcome::Err(envelope) => panic!("command failed: {envelope}"),
    }
}

fn expect_err(outcome: CommandOutcome) -> ErrorEnvelope {
    match outcome {
        CommandOutcome::Ok(payload) => panic!("command unexpectedly succeeded: {payload}"),
        CommandOutcome::Err(envelope) => envelope,
    }
}

#[tokio::test]
async fn net45_mock_runs_with_the_reference_counts() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    common::write_framework_image(dir.path());
    let binary = common::write_mock_binary(
        dir.path(),
        "mock-assembly",
        ".NETFramework,Version=v4.5",
        &common::net45_mock_manifest(),
    );

    let (mut client, server) = start_session("agent-net45").await;

    send_command(
        &mut client,
        CMD_LOAD,
        &[&binary.display().to_string(), "{}"],
    )
    .await;
    let (events, outcome) = read_conversation(&mut client).await;
    assert!(events.is_empty());
    let tree = expect_ok(outcome);
    assert!(tree.contains("testcasecount=\"31\""));

    send_command(&mut client, CMD_COUNT_TEST_CASES, &["<filter/>"]).await;
    let (_, outcome) = read_conversation(&mut client).await;
    assert_eq!(expect_ok(outcome), "31");

    send_command(&mut client, CMD_RUN, &["<filter/>"]).await;
    let (events, outcome) = read_conversation(&mut client).await;
    let result = expect_ok(outcome);
    let summary = RunSummary::from_xml(&result);
    assert_eq!(summary.total, 31);
    assert_eq!(summary.passed, 18);
    assert_eq!(summary.failed, 5);
    assert_eq!(summary.warnings, 0);
    assert_eq!(summary.inconclusive, 1);
    assert_eq!(summary.skipped, 7);

    // Events arrive in emission order: the run header first, then a
    // start/result pair per case.
    assert_eq!(events.first().map(String::as_str), Some("<start-run count=\"31\"/>"));
    assert_eq!(events.len(), 1 + 2 * 31);
    assert!(events[1].starts_with("<start-test"));
    assert!(events[2].starts_with("<test-case"));

    client
        .send(Frame::stop())
        .await
        .expect("stop frame should send");
    let end = server.await.expect("server task should join");
    assert_eq!(end, SessionEnd::Stopped);
}

#[tokio::test]
async fn netcore21_mock_runs_with_the_reference_counts() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    common::write_framework_image(dir.path());
    let binary = common::write_mock_binary(
        dir.path(),
        "mock-assembly",
        ".NETCoreApp,Version=v2.1",
        &common::netcore21_mock_manifest(),
    );

    let (mut client, server) = start_session("agent-netcore21").await;
    send_command(
        &mut client,
        CMD_LOAD,
        &[&binary.display().to_string(), "{}"],
    )
    .await;
    let (_, outcome) = read_conversation(&mut client).await;
    expect_ok(outcome);

    send_command(&mut client, CMD_RUN, &["<filter/>"]).await;
    let (_, outcome) = read_conversation(&mut client).await;
    let summary = RunSummary::from_xml(&expect_ok(outcome));
    assert_eq!(summary.total, 36);
    assert_eq!(summary.passed, 23);
    assert_eq!(summary.failed, 5);
    assert_eq!(summary.warnings, 1);
    assert_eq!(summary.inconclusive, 1);
    assert_eq!(summary.skipped, 7);

    client
        .send(Frame::stop())
        .await
        .expect("stop frame should send");
    server.await.expect("server task should join");
}

#[tokio::test]
async fn commands_before_load_fail_with_not_loaded() {
    let (mut client, server) = start_session("agent-unloaded").await;

    send_command(&mut client, CMD_RUN, &["<filter/>"]).await;
    let (_, outcome) = read_conversation(&mut client).await;
    let envelope = expect_err(outcome);
    assert_eq!(envelope.kind, "NotLoaded");

    send_command(&mut client, CMD_STOP_RUN, &["false"]).await;
    let (_, outcome) = read_conversation(&mut client).await;
    assert_eq!(expect_err(outcome).kind, "NotLoaded");

    client
        .send(Frame::stop())
        .await
        .expect("stop frame should send");
    server.await.expect("server task should join");
}

#[tokio::test]
async fn forced_stop_is_rejected_after_load() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    common::write_framework_image(dir.path());
    let binary = common::write_mock_binary(
        dir.path(),
        "mock-assembly",
        ".NETFramework,Version=v4.5",
        &common::net45_mock_manifest(),
    );

    let (mut client, server) = start_session("agent-force").await;
    send_command(
        &mut client,
        CMD_LOAD,
        &[&binary.display().to_string(), "{}"],
    )
    .await;
    let (_, outcome) = read_conversation(&mut client).await;
    expect_ok(outcome);

    send_command(&mut client, CMD_STOP_RUN, &["true"]).await;
    let (_, outcome) = read_conversation(&mut client).await;
    assert_eq!(expect_err(outcome).kind, "ForceStopNotSupported");

    client
        .send(Frame::stop())
        .await
        .expect("stop frame should send");
    server.await.expect("server task should join");
}

#[tokio::test]
async fn excluding_filter_short_circuits_to_a_skipped_suite() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    common::write_framework_image(dir.path());
    let binary = common::write_mock_binary(
        dir.path(),
        "mock-assembly",
        ".NETFramework,Version=v4.5",
        &common::net45_mock_manifest(),
    );

    let (mut client, server) = start_session("agent-excluded").await;
    send_command(
        &mut client,
        CMD_LOAD,
        &[&binary.display().to_string(), "{}"],
    )
    .await;
    let (_, outcome) = read_conversation(&mut client).await;
    expect_ok(outcome);

    send_command(
        &mut client,
        CMD_RUN,
        &["<filter><test>No.Such.Test</test></filter>"],
    )
    .await;
    let (events, outcome) = read_conversation(&mut client).await;
    let result = expect_ok(outcome);
    assert!(result.contains("result=\"Skipped\""));
    assert!(result.contains("label=\"ExcludedByFilter\""));
    // The framework was never invoked, so no run events were emitted.
    assert!(events.is_empty());

    client
        .send(Frame::stop())
        .await
        .expect("stop frame should send");
    server.await.expect("server task should join");
}

#[tokio::test]
async fn missing_framework_image_reports_every_attempted_path() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    // No framework image on disk.
    let binary = common::write_mock_binary(
        dir.path(),
        "mock-assembly",
        ".NETFramework,Version=v4.5",
        &common::net45_mock_manifest(),
    );

    let (mut client, server) = start_session("agent-no-framework").await;
    send_command(
        &mut client,
        CMD_LOAD,
        &[&binary.display().to_string(), "{}"],
    )
    .await;
    let (_, outcome) = read_conversation(&mut client).await;
    let envelope = expect_err(outcome);
    assert_eq!(envelope.kind, "FrameworkNotFound");
    assert!(envelope.message.contains("nunit.framework.gimg"));

    client
        .send(Frame::stop())
        .await
        .expect("stop frame should send");
    server.await.expect("server task should join");
}

#[tokio::test]
async fn out_of_range_framework_version_is_incompatible() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    common::write_framework_image_with_version(
        dir.path(),
        inspector::ImageVersion::new(2, 7, 0),
    );
    let binary = common::write_mock_binary(
        dir.path(),
        "mock-assembly",
        ".NETFramework,Version=v4.5",
        &common::net45_mock_manifest(),
    );

    let (mut client, server) = start_session("agent-old-framework").await;
    send_command(
        &mut client,
        CMD_LOAD,
        &[&binary.display().to_string(), "{}"],
    )
    .await;
    let (_, outcome) = read_conversation(&mut client).await;
    assert_eq!(expect_err(outcome).kind, "IncompatibleFramework");

    client
        .send(Frame::stop())
        .await
        .expect("stop frame should send");
    server.await.expect("server task should join");
}

#[tokio::test]
async fn skip_non_test_assemblies_setting_skips_quietly() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    let binary = common::write_plain_binary(dir.path(), "utility");

    let (mut client, server) = start_session("agent-skip").await;
    send_command(
        &mut client,
        CMD_LOAD,
        &[
            &binary.display().to_string(),
            "{\"SkipNonTestAssemblies\":true}",
        ],
    )
    .await;
    let (_, outcome) = read_conversation(&mut client).await;
    let tree = expect_ok(outcome);
    assert!(tree.contains("label=\"NonTestAssembly\""));

    send_command(&mut client, CMD_RUN, &["<filter/>"]).await;
    let (_, outcome) = read_conversation(&mut client).await;
    let summary = RunSummary::from_xml(&expect_ok(outcome));
    assert_eq!(summary.total, 0);

    client
        .send(Frame::stop())
        .await
        .expect("stop frame should send");
    server.await.expect("server task should join");
}
