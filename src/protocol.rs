//! Snippet harness and the JSON-line envelope decoder.
//!
//! The harness is the only code sent to the runtime shell. The caller's
//! snippet travels inside it as a string literal and is compiled remotely in
//! a copy of the shell's globals, so `env` is in scope and the harness's own
//! names cannot be clobbered.

use crate::model::ExecutionOutcome;
use crate::pylit;
use crate::transport::{ExecChannel, ExecOutput};
use log::debug;
use serde_json::Value;
use std::time::Duration;

/// Recordsets are summarised rather than serialised; these cap the summary.
const RECORDSET_ID_LIMIT: usize = 100;
const RECORDSET_NAME_LIMIT: usize = 10;

/// Kind reported when the remote side emits an error without a type name.
pub const REMOTE_ERROR_KIND: &str = "RemoteExecutionError";

pub fn harness(snippet: &str) -> String {
    format!(
        r#"import io as _lens_io
import json as _lens_json
import sys as _lens_sys

_lens_source = {source}
_lens_buffer = _lens_io.StringIO()
_lens_stdout = _lens_sys.stdout
_lens_scope = dict(globals())


def lens_encode(value):
    if hasattr(value, "_name") and hasattr(value, "ids"):
        return {{
            "result_type": "recordset",
            "model": value._name,
            "count": len(value),
            "ids": list(value.ids[:{ids}]),
            "display_names": [getattr(r, "display_name", str(r)) for r in value[:{names}]],
        }}
    return value


_lens_sys.stdout = _lens_buffer
try:
    exec(compile(_lens_source, "<snippet>", "exec"), _lens_scope)
    _lens_sys.stdout = _lens_stdout
    if "result" in _lens_scope:
        _lens_payload = {{"result": lens_encode(_lens_scope["result"])}}
    elif _lens_buffer.getvalue():
        _lens_payload = {{"output": _lens_buffer.getvalue()}}
    else:
        _lens_payload = {{"success": True}}
except BaseException as _lens_error:
    _lens_sys.stdout = _lens_stdout
    _lens_payload = {{"error": str(_lens_error), "error_type": type(_lens_error).__name__}}
finally:
    _lens_sys.stdout = _lens_stdout

try:
    _lens_line = _lens_json.dumps(_lens_payload, default=str)
except Exception as _lens_error:
    _lens_line = _lens_json.dumps({{"error": "result is not serializable: %s" % _lens_error, "error_type": "EncodeError"}})
print("")
print(_lens_line)
"#,
        source = pylit::string(snippet),
        ids = RECORDSET_ID_LIMIT,
        names = RECORDSET_NAME_LIMIT,
    )
}

/// Classify one finished exec. Only the last non-empty stdout line is
/// trusted as the answer; everything before it is boot noise. stderr carries
/// the shell's log stream and is only read to classify a failed exec, so
/// a late log line can never displace the envelope.
pub fn decode(output: &ExecOutput) -> ExecutionOutcome {
    if !output.success() {
        return ExecutionOutcome::Transport(output.failure());
    }
    let Some(line) = output
        .stdout
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
    else {
        return ExecutionOutcome::RawOutput(output.stdout.clone());
    };
    let parsed: Value = match serde_json::from_str(line) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!("odoo-lens: last output line is not JSON ({err}); passing raw output through");
            return ExecutionOutcome::RawOutput(output.stdout.clone());
        }
    };
    let Value::Object(mut envelope) = parsed else {
        return ExecutionOutcome::Success(parsed);
    };
    if let Some(error) = envelope.remove("error").filter(|error| !error.is_null()) {
        let message = match error {
            Value::String(text) => text,
            other => other.to_string(),
        };
        let kind = envelope
            .get("error_type")
            .and_then(Value::as_str)
            .unwrap_or(REMOTE_ERROR_KIND)
            .to_string();
        return ExecutionOutcome::StructuredError { message, kind };
    }
    match envelope.remove("result") {
        Some(result) => ExecutionOutcome::Success(result),
        None => ExecutionOutcome::Success(Value::Object(envelope)),
    }
}

/// Wrap, ship, and decode one snippet. The snippet must already have passed
/// the policy; this function does not validate. Transport failures are
/// returned as an outcome, never retried.
pub fn execute<C: ExecChannel + ?Sized>(
    channel: &C,
    snippet: &str,
    timeout: Duration,
) -> ExecutionOutcome {
    match channel.run_shell(&harness(snippet), timeout) {
        Ok(output) => decode(&output),
        Err(failure) => ExecutionOutcome::Transport(failure),
    }
}
