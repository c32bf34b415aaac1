// Round trips through a real child process. A local interpreter stands in
// for the runtime shell; `sh` stands in for a hung container.

use odoo_lens::config::Config;
use odoo_lens::model::ExecutionOutcome;
use odoo_lens::protocol;
use odoo_lens::router::{Gateway, Mode, Query};
use odoo_lens::shape::PaginationWindow;
use odoo_lens::transport::{CommandChannel, TransportFailure};
use serde_json::json;
use std::process::Command;
use std::time::{Duration, Instant};

fn python_channel() -> Option<CommandChannel> {
    let available = Command::new("python3")
        .arg("--version")
        .output()
        .is_ok_and(|output| output.status.success());
    if !available {
        eprintln!("python3 not available; skipping");
        return None;
    }
    CommandChannel::new(
        vec!["python3".to_string()],
        vec!["python3".to_string(), "-c".to_string()],
    )
    .ok()
}

#[test]
fn bound_result_comes_back_as_success() {
    let Some(channel) = python_channel() else {
        return;
    };
    let outcome = protocol::execute(&channel, "result = 2 + 2", Duration::from_secs(30));
    assert_eq!(outcome, ExecutionOutcome::Success(json!(4)));
}

#[test]
fn printed_output_and_remote_errors() {
    let Some(channel) = python_channel() else {
        return;
    };
    let outcome = protocol::execute(&channel, "print('hello')", Duration::from_secs(30));
    assert_eq!(outcome, ExecutionOutcome::Success(json!({"output": "hello\n"})));

    let outcome = protocol::execute(&channel, "raise ValueError('bad')", Duration::from_secs(30));
    assert_eq!(
        outcome,
        ExecutionOutcome::StructuredError {
            message: "bad".to_string(),
            kind: "ValueError".to_string(),
        }
    );
}

#[test]
fn exits_and_interrupts_are_remote_errors() {
    let Some(channel) = python_channel() else {
        return;
    };
    let outcome = protocol::execute(&channel, "raise SystemExit('bad snippet')", Duration::from_secs(30));
    assert_eq!(
        outcome,
        ExecutionOutcome::StructuredError {
            message: "bad snippet".to_string(),
            kind: "SystemExit".to_string(),
        }
    );

    let outcome = protocol::execute(&channel, "raise KeyboardInterrupt()", Duration::from_secs(30));
    assert_eq!(outcome.error_type(), Some("KeyboardInterrupt"));
}

#[test]
fn gateway_runs_allowed_imports() {
    let Some(channel) = python_channel() else {
        return;
    };
    let gateway = Gateway::new(channel, &Config::default());
    let query = Query::Execute {
        code: "import json\nresult = json.loads('[1, 2, 3]')".to_string(),
    };
    let response = gateway.resolve(Mode::Registry, &query, &PaginationWindow::new(1, 2, None));
    assert_eq!(response["success"], json!(true));
    assert_eq!(response["result"]["items"], json!([1, 2]));
    assert_eq!(response["result"]["pagination"]["total_count"], json!(3));
}

#[cfg(unix)]
#[test]
fn hung_shell_times_out() {
    let channel = CommandChannel::new(
        vec!["sh".to_string(), "-c".to_string(), "sleep 10".to_string()],
        vec!["sh".to_string(), "-c".to_string()],
    )
    .unwrap();
    let started = Instant::now();
    let outcome = protocol::execute(&channel, "result = 1", Duration::from_millis(300));
    assert_eq!(
        outcome,
        ExecutionOutcome::Transport(TransportFailure::Timeout {
            after: Duration::from_millis(300)
        })
    );
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(outcome.into_response()["error_type"], json!("Timeout"));
}

#[cfg(unix)]
#[test]
fn non_zero_exit_is_a_transport_failure() {
    let channel = CommandChannel::new(
        vec![
            "sh".to_string(),
            "-c".to_string(),
            "cat >/dev/null; echo 'Error: No such container: odoo' >&2; exit 125".to_string(),
        ],
        vec!["sh".to_string(), "-c".to_string()],
    )
    .unwrap();
    let outcome = protocol::execute(&channel, "result = 1", Duration::from_secs(10));
    match outcome {
        ExecutionOutcome::Transport(TransportFailure::ExecFailed { exit_code, stderr }) => {
            assert_eq!(exit_code, Some(125));
            assert!(stderr.starts_with("container not found"));
        }
        other => panic!("expected exec failure, got {other:?}"),
    }
}
