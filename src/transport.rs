//! Out-of-process exec channel.
//!
//! Every call is one fresh child process with a hard deadline. A local
//! timeout kills the local exec client only: the remote process behind the
//! container boundary may keep running, so execution is at-most-once from the
//! caller's point of view but not guaranteed to have stopped remotely.

use crate::config::Config;
use anyhow::{Result, bail};
use log::{debug, warn};
use serde_json::{Value, json};
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportFailure {
    #[error("command timed out after {}", describe_timeout(.after))]
    Timeout { after: Duration },
    #[error("exec failed ({}): {stderr}", describe_exit(.exit_code))]
    ExecFailed {
        exit_code: Option<i32>,
        stderr: String,
    },
}

fn describe_timeout(after: &Duration) -> String {
    format!("{:.1}s", after.as_secs_f64())
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code".to_string(),
    }
}

impl TransportFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportFailure::Timeout { .. } => "Timeout",
            TransportFailure::ExecFailed { .. } => "ExecFailed",
        }
    }

    pub fn into_response(self) -> Value {
        let mut response = json!({
            "success": false,
            "error": self.to_string(),
            "error_type": self.kind(),
        });
        if let TransportFailure::ExecFailed {
            exit_code: Some(code),
            ..
        } = self
        {
            response["exit_code"] = json!(code);
        }
        response
    }
}

/// Raw result of a child process that ran to completion.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Classify a non-zero exit. Well-known exec-client codes get a hint in
    /// front of the captured stderr.
    pub fn failure(&self) -> TransportFailure {
        let stderr = self.stderr.trim();
        let lowered = stderr.to_ascii_lowercase();
        let hint = match self.exit_code {
            Some(125) if lowered.contains("no such container") => {
                Some("container not found; is the stack running?")
            }
            Some(125) if lowered.contains("executable file not found") => {
                Some("runtime shell not found inside the container")
            }
            Some(125) => Some("the exec client could not run the command"),
            Some(126) => Some("permission denied executing inside the container"),
            Some(137) => Some("process was killed (likely out of memory)"),
            _ if lowered.contains("database") && lowered.contains("does not exist") => {
                Some("the configured database does not exist")
            }
            _ if lowered.contains("could not connect") => {
                Some("the runtime could not reach its database")
            }
            _ => None,
        };
        let stderr = match hint {
            Some(hint) if stderr.is_empty() => hint.to_string(),
            Some(hint) => format!("{hint}: {stderr}"),
            None => stderr.to_string(),
        };
        TransportFailure::ExecFailed {
            exit_code: self.exit_code,
            stderr,
        }
    }
}

/// The only way this crate reaches the remote runtime.
pub trait ExecChannel {
    /// Boot the runtime shell and feed it `input` on standard input.
    fn run_shell(&self, input: &str, timeout: Duration) -> Result<ExecOutput, TransportFailure>;

    /// Run a standalone program with the generic interpreter next to the
    /// runtime, passed as an inline argument.
    fn run_script(&self, program: &str, timeout: Duration)
    -> Result<ExecOutput, TransportFailure>;
}

impl<T: ExecChannel + ?Sized> ExecChannel for &T {
    fn run_shell(&self, input: &str, timeout: Duration) -> Result<ExecOutput, TransportFailure> {
        (**self).run_shell(input, timeout)
    }

    fn run_script(
        &self,
        program: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, TransportFailure> {
        (**self).run_script(program, timeout)
    }
}

/// Exec channel backed by plain argv prefixes, e.g.
/// `docker exec -i <container> /odoo/odoo-bin shell --database <db> --no-http`.
#[derive(Debug, Clone)]
pub struct CommandChannel {
    shell_argv: Vec<String>,
    script_argv: Vec<String>,
}

impl CommandChannel {
    pub fn new(shell_argv: Vec<String>, script_argv: Vec<String>) -> Result<Self> {
        if shell_argv.is_empty() || script_argv.is_empty() {
            bail!("exec channel needs a program for both shell and script invocations");
        }
        Ok(Self {
            shell_argv,
            script_argv,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        validate_container_name(&config.container_name)?;
        validate_container_name(&config.scan_container)?;
        let mut shell_argv = vec![
            config.exec_binary.clone(),
            "exec".to_string(),
            "-i".to_string(),
            config.container_name.clone(),
        ];
        shell_argv.extend(config.shell_command.split_whitespace().map(str::to_string));
        shell_argv.extend([
            "--database".to_string(),
            config.database.clone(),
            "--no-http".to_string(),
        ]);
        let script_argv = vec![
            config.exec_binary.clone(),
            "exec".to_string(),
            config.scan_container.clone(),
            config.python.clone(),
            "-c".to_string(),
        ];
        Self::new(shell_argv, script_argv)
    }

    pub fn shell_argv(&self) -> &[String] {
        &self.shell_argv
    }

    pub fn script_argv(&self) -> &[String] {
        &self.script_argv
    }
}

impl ExecChannel for CommandChannel {
    fn run_shell(&self, input: &str, timeout: Duration) -> Result<ExecOutput, TransportFailure> {
        let mut command = Command::new(&self.shell_argv[0]);
        command.args(&self.shell_argv[1..]);
        run_with_timeout(command, Some(input), timeout)
    }

    fn run_script(
        &self,
        program: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, TransportFailure> {
        let mut command = Command::new(&self.script_argv[0]);
        command.args(&self.script_argv[1..]).arg(program);
        run_with_timeout(command, None, timeout)
    }
}

/// Container names end up as exec arguments; keep them to plain identifiers
/// so they can never be read as a flag.
pub fn validate_container_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('-') {
        bail!("invalid container name: {name:?}");
    }
    let valid = name
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'));
    if !valid {
        bail!("invalid container name: {name:?}");
    }
    Ok(())
}

/// Spawn `command`, optionally feed `input` on stdin, and wait at most
/// `timeout`. Pipes are drained on helper threads so a chatty child cannot
/// stall on a full pipe while we poll.
pub fn run_with_timeout(
    mut command: Command,
    input: Option<&str>,
    timeout: Duration,
) -> Result<ExecOutput, TransportFailure> {
    let program = command.get_program().to_string_lossy().to_string();
    command
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|err| TransportFailure::ExecFailed {
        exit_code: None,
        stderr: format!("failed to spawn {program}: {err}"),
    })?;
    debug!("odoo-lens: spawned {program} (pid {})", child.id());

    let writer = match (input, child.stdin.take()) {
        (Some(text), Some(mut stdin)) => {
            let text = text.to_string();
            Some(thread::spawn(move || {
                // A child that exits early closes the pipe; nothing to report.
                let _ = stdin.write_all(text.as_bytes());
            }))
        }
        _ => None,
    };
    let stdout = spawn_reader(child.stdout.take());
    let stderr = spawn_reader(child.stderr.take());

    let start = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(err) => {
                let _ = child.kill();
                return Err(TransportFailure::ExecFailed {
                    exit_code: None,
                    stderr: format!("failed to poll {program}: {err}"),
                });
            }
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            warn!(
                "odoo-lens: Security: {program} timed out after {:.1}s; the remote side may still be running",
                timeout.as_secs_f64()
            );
            return Err(TransportFailure::Timeout { after: timeout });
        }
        thread::sleep(POLL_INTERVAL);
    };

    if let Some(writer) = writer {
        let _ = writer.join();
    }
    let output = ExecOutput {
        exit_code: status.code(),
        stdout: join_reader(stdout),
        stderr: join_reader(stderr),
    };
    debug!(
        "odoo-lens: {program} exited with {:?} ({} bytes stdout)",
        output.exit_code,
        output.stdout.len()
    );
    Ok(output)
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_docker_argv_from_config() {
        let config = Config::default();
        let channel = CommandChannel::from_config(&config).unwrap();
        assert_eq!(
            channel.shell_argv(),
            &[
                "docker",
                "exec",
                "-i",
                "odoo-script-runner-1",
                "/odoo/odoo-bin",
                "shell",
                "--database",
                "odoo",
                "--no-http",
            ]
        );
        assert_eq!(
            channel.script_argv(),
            &["docker", "exec", "odoo-script-runner-1", "python3", "-c"]
        );
    }

    #[test]
    fn rejects_flag_like_container_names() {
        assert!(validate_container_name("--privileged").is_err());
        assert!(validate_container_name("odoo; rm -rf /").is_err());
        assert!(validate_container_name("").is_err());
        assert!(validate_container_name("proj-web-1").is_ok());
    }

    #[test]
    fn classifies_well_known_exit_codes() {
        let output = ExecOutput {
            exit_code: Some(137),
            stdout: String::new(),
            stderr: String::new(),
        };
        match output.failure() {
            TransportFailure::ExecFailed { exit_code, stderr } => {
                assert_eq!(exit_code, Some(137));
                assert!(stderr.contains("out of memory"));
            }
            other => panic!("unexpected failure: {other:?}"),
        }

        let output = ExecOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "FATAL: database \"prod\" does not exist".to_string(),
        };
        let TransportFailure::ExecFailed { stderr, .. } = output.failure() else {
            panic!("expected exec failure");
        };
        assert!(stderr.starts_with("the configured database does not exist"));
        assert!(stderr.contains("FATAL"));
    }

    #[cfg(unix)]
    #[test]
    fn captures_stdout_stderr_and_exit_code() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("read line; echo \"got $line\"; echo oops >&2; exit 3");
        let output = run_with_timeout(command, Some("ping\n"), Duration::from_secs(10)).unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout.trim(), "got ping");
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[test]
    fn timeout_is_reported_not_raised() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("sleep 5");
        let started = Instant::now();
        let result = run_with_timeout(command, None, Duration::from_millis(200));
        assert_eq!(
            result.unwrap_err(),
            TransportFailure::Timeout {
                after: Duration::from_millis(200)
            }
        );
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn spawn_failure_is_exec_failed() {
        let command = Command::new("odoo-lens-definitely-missing-binary");
        let err = run_with_timeout(command, None, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(
            err,
            TransportFailure::ExecFailed {
                exit_code: None,
                ..
            }
        ));
    }
}
