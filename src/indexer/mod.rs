use crate::model::ModelIndex;
use crate::transport::{ExecChannel, TransportFailure};
use log::{debug, info};
use serde_json::{Value, json};
use std::time::{Duration, Instant};

pub mod local;

/// Read-only scan program. Parses sources with `ast`; never imports them.
const SCAN_SOURCE: &str = include_str!("scan.py");

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IndexFailure {
    #[error(transparent)]
    Transport(#[from] TransportFailure),
    #[error("could not decode model index: {0}")]
    Decode(String),
}

impl IndexFailure {
    pub fn into_response(self) -> Value {
        match self {
            IndexFailure::Transport(failure) => failure.into_response(),
            IndexFailure::Decode(detail) => json!({
                "success": false,
                "error": format!("could not decode model index: {detail}"),
                "error_type": "DecodeFailure",
            }),
        }
    }
}

/// The full program shipped to the interpreter: a `roots` binding followed
/// by the fixed scan source.
pub fn scan_program(roots: &[String]) -> String {
    let roots = Value::from(roots.to_vec());
    format!("roots = {roots}\n{SCAN_SOURCE}")
}

/// Scan `roots` inside the container and return the merged model index.
/// Every call re-scans; nothing is cached here.
pub fn build_index<C: ExecChannel + ?Sized>(
    channel: &C,
    roots: &[String],
    timeout: Duration,
) -> Result<ModelIndex, IndexFailure> {
    let started = Instant::now();
    let output = channel.run_script(&scan_program(roots), timeout)?;
    if !output.success() {
        return Err(IndexFailure::Transport(output.failure()));
    }
    let document = output
        .stdout
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .ok_or_else(|| IndexFailure::Decode("scan produced no output".to_string()))?;
    let index: ModelIndex =
        serde_json::from_str(document).map_err(|err| IndexFailure::Decode(err.to_string()))?;
    info!(
        "odoo-lens: indexed {} models from {} roots in {:?}",
        index.len(),
        roots.len(),
        started.elapsed()
    );
    debug!("odoo-lens: scan stderr: {}", output.stderr.trim());
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_binds_roots_before_scan_source() {
        let program = scan_program(&["/odoo/addons".to_string(), "/opt/x y".to_string()]);
        let first = program.lines().next().unwrap();
        assert_eq!(first, r#"roots = ["/odoo/addons","/opt/x y"]"#);
        assert!(program.contains("ast.parse"));
        assert!(!program.contains("import_module"));
    }
}
