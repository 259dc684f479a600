mod common;

use std::time::Duration;

use common::*;
use node_agent::protocol::ResultStatus;
use serde_json::json;
use serial_test::serial;

fn open_session(session_id: &str) -> serde_json::Value {
    signed(json!({
        "type": "shell_session",
        "command_id": format!("open-{session_id}"),
        "session_id": session_id,
        "action": "open",
        "cols": 100,
        "rows": 30
    }))
}

fn input(session_id: &str, data: &str) -> serde_json::Value {
    signed(json!({
        "type": "pty_input",
        "command_id": "input",
        "session_id": session_id,
        "data": data
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn shell_echoes_input_back_as_output() {
    node_agent::pty::install_reaper();
    let agent = TestAgent::new();

    let result = agent.router.dispatch(&open_session("s1")).await.expect("result");
    assert_eq!(result.status, ResultStatus::Completed);
    assert_eq!(result.output, "PTY session s1 opened");
    assert!(agent.pty.contains("s1").await);

    assert!(agent
        .router
        .dispatch(&input("s1", "echo pty-marker-$((40 + 2))\n"))
        .await
        .is_none());

    let sink = agent.sink.clone();
    let seen = wait_until(Duration::from_secs(10), || {
        sink.pty_output("s1").contains("pty-marker-42")
    })
    .await;
    assert!(seen, "output was: {:?}", agent.sink.pty_output("s1"));

    let resize = signed(json!({
        "type": "pty_resize",
        "command_id": "resize",
        "session_id": "s1",
        "cols": 120,
        "rows": 40
    }));
    assert!(agent.router.dispatch(&resize).await.is_none());

    agent.pty.close_all().await;
    assert!(agent.pty.is_empty().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn reopening_a_session_terminates_the_old_shell() {
    node_agent::pty::install_reaper();
    let agent = TestAgent::new();

    agent.router.dispatch(&open_session("dup")).await.expect("result");
    let first = agent.pty.child_pid("dup").await.expect("first pid");

    let result = agent.router.dispatch(&open_session("dup")).await.expect("result");
    assert_eq!(result.status, ResultStatus::Completed);
    let second = agent.pty.child_pid("dup").await.expect("second pid");

    assert_ne!(first, second);
    assert!(!process_alive(first));
    assert!(process_alive(second));
    assert_eq!(agent.pty.len().await, 1);

    agent.pty.close_all().await;
    assert!(!process_alive(second));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn explicit_close_removes_the_session() {
    node_agent::pty::install_reaper();
    let agent = TestAgent::new();

    agent.router.dispatch(&open_session("c1")).await.expect("result");
    let pid = agent.pty.child_pid("c1").await.expect("pid");

    let close = signed(json!({
        "type": "shell_session",
        "command_id": "close-c1",
        "session_id": "c1",
        "action": "close"
    }));
    let result = agent.router.dispatch(&close).await.expect("result");
    assert_eq!(result.status, ResultStatus::Completed);
    assert_eq!(result.output, "PTY session c1 closed");
    assert!(!agent.pty.contains("c1").await);
    assert!(!process_alive(pid));
    assert!(agent.sink.frames_of("pty_closed").is_empty());

    let again = agent.router.dispatch(&close).await.expect("result");
    assert_eq!(again.status, ResultStatus::Error);
    assert_eq!(again.exit_code, -1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn shell_exit_emits_pty_closed_once() {
    node_agent::pty::install_reaper();
    let agent = TestAgent::new();

    agent.router.dispatch(&open_session("exit")).await.expect("result");
    agent.router.dispatch(&input("exit", "exit\n")).await;

    let sink = agent.sink.clone();
    let closed = wait_until(Duration::from_secs(10), || {
        !sink.frames_of("pty_closed").is_empty()
    })
    .await;
    assert!(closed);

    // The session leaves the table before pty_closed is sent.
    assert!(agent.pty.is_empty().await);
    assert_eq!(
        agent.sink.frames_of("pty_closed"),
        vec![json!({"type": "pty_closed", "session_id": "exit"})]
    );
}

#[tokio::test]
async fn zero_window_size_is_rejected() {
    let agent = TestAgent::new();
    let envelope = signed(json!({
        "type": "shell_session",
        "command_id": "bad",
        "session_id": "bad",
        "cols": 0,
        "rows": 24
    }));
    let result = agent.router.dispatch(&envelope).await.expect("result");
    assert_eq!(result.status, ResultStatus::Error);
    assert_eq!(result.output, "Invalid command payload");
    assert!(agent.pty.is_empty().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn forks_are_spaced_at_least_one_second_apart() {
    node_agent::pty::install_reaper();
    let agent = TestAgent::new();

    let started = std::time::Instant::now();
    agent.router.dispatch(&open_session("a")).await.expect("result");
    let first_done = started.elapsed();
    agent.router.dispatch(&open_session("b")).await.expect("result");
    let second_done = started.elapsed();

    assert!(agent.pty.contains("a").await && agent.pty.contains("b").await);
    assert!(
        second_done >= node_agent::pty::FORK_INTERVAL,
        "second fork after {second_done:?} (first finished after {first_done:?})"
    );

    agent.pty.close_all().await;
}
