
use std::time::Duration;

use cmdbot::core::commands::{Command, CommandOptions, ShellCommand};
use cmdbot::core::executor::Submission;
use cmdbot::core::jobs::JobStatus;
use cmdbot::core::request::{Request, Style};
use cmdbot::core::tokens::TokenLedger;
use cmdbot::error::Error;
use hub_harness::{HubHarness, TestResult};

fn remote_echo() -> Command {
    Command::shell(
        CommandOptions::new("remote-echo").help("echo on the agent"),
        ShellCommand::new("echo"),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_command_round_trip() -> TestResult<()> {
    let harness = HubHarness::start(Duration::from_secs(5)).await?;
    let agent = harness
        .spawn_agent(vec![remote_echo()], None, "remote-echo")
        .await?;

    let request = Request::new("remote-echo", "alice").with_args(["hola"]);
    let job = match harness.executor.submit(request).await? {
        Submission::Queued(job) => job,
        other => return Err(format!("unexpected submission {:?}", other).into()),
    };
    harness.executor.shutdown().await;

    let stored = harness.executor.jobs().get(job.id).await?;
    assert_eq!(stored.status, JobStatus::Successful);
    let log = harness.executor.logs().get(job.id).await?;
    assert_eq!(log.lines, vec!["hola"]);
    assert!(log.error.is_none());

    let reply = harness.replies.replies().pop().ok_or("no reply")?;
    assert_eq!(reply.style, Style::Success);
    assert!(reply.text.contains("hola"));
    assert_eq!(harness.hub.pending_calls(), 0);

    let res = agent.stop().await;
    assert!(matches!(res, Err(Error::TransportFailure(_))));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_failure_is_recorded() -> TestResult<()> {
    let harness = HubHarness::start(Duration::from_secs(5)).await?;
    let failing = Command::shell(
        CommandOptions::new("remote-fail"),
        ShellCommand::new("sh").with_args(["-c", "echo before; echo nope >&2; exit 4"]),
    );
    let agent = harness.spawn_agent(vec![failing], None, "remote-fail").await?;

    let job = match harness
        .executor
        .submit(Request::new("remote-fail", "alice"))
        .await?
    {
        Submission::Queued(job) => job,
        other => return Err(format!("unexpected submission {:?}", other).into()),
    };
    harness.executor.shutdown().await;

    assert_eq!(
        harness.executor.jobs().get(job.id).await?.status,
        JobStatus::Failed
    );
    let log = harness.executor.logs().get(job.id).await?;
    assert_eq!(log.lines, vec!["before"]);
    assert!(log.error.unwrap_or_default().contains("nope"));

    let _ = agent.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agent_loss_fails_in_flight_job() -> TestResult<()> {
    let harness = HubHarness::start(Duration::from_secs(30)).await?;
    let slow = Command::shell(
        CommandOptions::new("remote-sleep"),
        ShellCommand::new("sleep").with_args(["30"]),
    );
    let agent = harness.spawn_agent(vec![slow], None, "remote-sleep").await?;

    let job = match harness
        .executor
        .submit(Request::new("remote-sleep", "alice"))
        .await?
    {
        Submission::Queued(job) => job,
        other => return Err(format!("unexpected submission {:?}", other).into()),
    };
    for _ in 0..100 {
        if harness.hub.pending_calls() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let _ = agent.stop().await;
    harness.executor.shutdown().await;

    assert_eq!(
        harness.executor.jobs().get(job.id).await?.status,
        JobStatus::Failed
    );
    assert_eq!(harness.hub.pending_calls(), 0);
    for _ in 0..100 {
        if harness.hub.find_command("remote-sleep").is_none() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Err("agent still registered after disconnect".into())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tokens_gate_registration() -> TestResult<()> {
    let harness = HubHarness::start(Duration::from_secs(5)).await?;
    let (raw, _) = TokenLedger::new(harness.store.clone()).create("ci").await?;

    let rejected = harness
        .spawn_agent(vec![remote_echo()], None, "remote-echo")
        .await;
    assert!(rejected.is_err());

    let agent = harness
        .spawn_agent(vec![remote_echo()], Some(raw), "remote-echo")
        .await?;
    assert_eq!(harness.hub.agents().len(), 1);
    let _ = agent.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_timeout_reply_keeps_partial_output() -> TestResult<()> {
    let harness = HubHarness::start(Duration::from_secs(5)).await?;
    let slow = Command::shell(
        CommandOptions::new("remote-part").timeout(Duration::from_secs(1)),
        ShellCommand::new("sh").with_args(["-c", "echo partial; sleep 5"]),
    );
    let agent = harness.spawn_agent(vec![slow], None, "remote-part").await?;

    let job = match harness
        .executor
        .submit(Request::new("remote-part", "alice"))
        .await?
    {
        Submission::Queued(job) => job,
        other => return Err(format!("unexpected submission {:?}", other).into()),
    };
    harness.executor.shutdown().await;

    assert_eq!(
        harness.executor.jobs().get(job.id).await?.status,
        JobStatus::Failed
    );
    assert_eq!(harness.executor.logs().get(job.id).await?.lines, vec!["partial"]);
    let reply = harness.replies.replies().pop().ok_or("no reply")?;
    assert_eq!(reply.style, Style::Failure);
    assert!(reply.text.contains("partial"), "reply was {:?}", reply.text);

    let _ = agent.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_declared_timeout_still_completes() -> TestResult<()> {
    let harness = HubHarness::start(Duration::from_secs(5)).await?;
    let big = Command::shell(
        CommandOptions::new("big").timeout(Duration::from_secs(u64::MAX)),
        ShellCommand::new("echo").with_args(["done"]),
    );
    let agent = harness.spawn_agent(vec![big], None, "big").await?;

    let job = match harness.executor.submit(Request::new("big", "alice")).await? {
        Submission::Queued(job) => job,
        other => return Err(format!("unexpected submission {:?}", other).into()),
    };
    harness.executor.shutdown().await;

    assert_eq!(
        harness.executor.jobs().get(job.id).await?.status,
        JobStatus::Successful
    );
    assert!(!harness.executor.is_running(job.id));
    assert!(harness.replies.replies().iter().any(|r| r.text.contains("done")));

    let _ = agent.stop().await;
    Ok(())
}
