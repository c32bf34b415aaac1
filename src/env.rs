//! Typed access to the live model registry.
//!
//! Each operation is its own generated snippet, checked by the policy and
//! shipped through the protocol like any caller snippet. Nothing is proxied
//! lazily: a call is one remote round trip.

use crate::model::ExecutionOutcome;
use crate::policy::{Policy, PolicyViolation};
use crate::protocol;
use crate::pylit;
use crate::transport::{ExecChannel, TransportFailure};
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnvError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Policy(#[from] PolicyViolation),
    #[error(transparent)]
    Transport(#[from] TransportFailure),
    #[error("{kind}: {message}")]
    Remote { message: String, kind: String },
    #[error("unexpected result shape: {0}")]
    UnexpectedResult(String),
}

impl EnvError {
    pub fn into_response(self) -> Value {
        match self {
            EnvError::Policy(violation) => violation.into_response(),
            EnvError::Transport(failure) => failure.into_response(),
            EnvError::Remote { message, kind } => {
                ExecutionOutcome::StructuredError { message, kind }.into_response()
            }
            EnvError::InvalidArgument(detail) => json!({
                "success": false,
                "error": detail,
                "error_type": "InvalidArgument",
            }),
            EnvError::UnexpectedResult(detail) => json!({
                "success": false,
                "error": detail,
                "error_type": "DecodeFailure",
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRef {
    pub id: i64,
    pub display_name: String,
}

/// Named operations against the live registry.
pub trait ModelEnv {
    fn search(
        &self,
        model: &str,
        domain: &Value,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<RecordRef>, EnvError>;
    fn search_count(&self, model: &str, domain: &Value) -> Result<u64, EnvError>;
    /// Existing records among `ids`; missing ids are dropped.
    fn browse(&self, model: &str, ids: &[i64]) -> Result<Vec<RecordRef>, EnvError>;
    fn read(&self, model: &str, ids: &[i64], fields: &[String]) -> Result<Vec<Value>, EnvError>;
    /// Create and commit one record, returning its id.
    fn create(&self, model: &str, values: &Value) -> Result<i64, EnvError>;
    fn fields_get(&self, model: &str) -> Result<Value, EnvError>;
    fn model_names(&self) -> Result<Vec<String>, EnvError>;
}

pub struct RemoteEnv<'a, C: ExecChannel + ?Sized> {
    channel: &'a C,
    policy: &'a Policy,
    timeout: Duration,
}

impl<'a, C: ExecChannel + ?Sized> RemoteEnv<'a, C> {
    pub fn new(channel: &'a C, policy: &'a Policy, timeout: Duration) -> Self {
        Self {
            channel,
            policy,
            timeout,
        }
    }

    fn run<T: DeserializeOwned>(&self, snippet: &str) -> Result<T, EnvError> {
        self.policy.validate(snippet)?;
        match protocol::execute(self.channel, snippet, self.timeout) {
            ExecutionOutcome::Success(value) => serde_json::from_value(value)
                .map_err(|err| EnvError::UnexpectedResult(err.to_string())),
            ExecutionOutcome::StructuredError { message, kind } => {
                Err(EnvError::Remote { message, kind })
            }
            ExecutionOutcome::RawOutput(text) => {
                debug!("odoo-lens: raw output from generated snippet: {text}");
                Err(EnvError::UnexpectedResult(
                    "remote output was not a JSON envelope".to_string(),
                ))
            }
            ExecutionOutcome::Transport(failure) => Err(EnvError::Transport(failure)),
        }
    }
}

fn model_expr(model: &str) -> Result<String, EnvError> {
    if !pylit::is_model_name(model) {
        return Err(EnvError::InvalidArgument(format!(
            "invalid model name: {model:?}"
        )));
    }
    Ok(format!("env[{}]", pylit::string(model)))
}

fn domain_expr(domain: &Value) -> Result<String, EnvError> {
    pylit::domain(domain).map_err(|err| EnvError::InvalidArgument(err.to_string()))
}

fn ids_expr(ids: &[i64]) -> String {
    pylit::value(&json!(ids))
}

impl<C: ExecChannel + ?Sized> ModelEnv for RemoteEnv<'_, C> {
    fn search(
        &self,
        model: &str,
        domain: &Value,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<RecordRef>, EnvError> {
        let limit = limit.map_or_else(|| "None".to_string(), |limit| limit.to_string());
        let snippet = format!(
            "records = {}.search({}, limit={limit}, offset={offset})\n\
             result = [{{\"id\": r.id, \"display_name\": r.display_name}} for r in records]\n",
            model_expr(model)?,
            domain_expr(domain)?,
        );
        self.run(&snippet)
    }

    fn search_count(&self, model: &str, domain: &Value) -> Result<u64, EnvError> {
        let snippet = format!(
            "result = {}.search_count({})\n",
            model_expr(model)?,
            domain_expr(domain)?
        );
        self.run(&snippet)
    }

    fn browse(&self, model: &str, ids: &[i64]) -> Result<Vec<RecordRef>, EnvError> {
        let snippet = format!(
            "records = {}.browse({}).exists()\n\
             result = [{{\"id\": r.id, \"display_name\": r.display_name}} for r in records]\n",
            model_expr(model)?,
            ids_expr(ids),
        );
        self.run(&snippet)
    }

    fn read(&self, model: &str, ids: &[i64], fields: &[String]) -> Result<Vec<Value>, EnvError> {
        if let Some(bad) = fields.iter().find(|field| !pylit::is_identifier(field)) {
            return Err(EnvError::InvalidArgument(format!(
                "invalid field name: {bad:?}"
            )));
        }
        let fields = if fields.is_empty() {
            "None".to_string()
        } else {
            pylit::value(&json!(fields))
        };
        let snippet = format!(
            "result = {}.browse({}).exists().read({fields})\n",
            model_expr(model)?,
            ids_expr(ids),
        );
        self.run(&snippet)
    }

    fn create(&self, model: &str, values: &Value) -> Result<i64, EnvError> {
        if !values.is_object() {
            return Err(EnvError::InvalidArgument(
                "create values must be an object".to_string(),
            ));
        }
        let snippet = format!(
            "record = {}.create({})\nenv.cr.commit()\nresult = record.id\n",
            model_expr(model)?,
            pylit::value(values),
        );
        self.run(&snippet)
    }

    fn fields_get(&self, model: &str) -> Result<Value, EnvError> {
        let snippet = format!(
            "result = {}.fields_get(attributes=[\"type\", \"string\", \"required\", \"store\", \
             \"relation\", \"selection\", \"compute\", \"related\"])\n",
            model_expr(model)?
        );
        self.run(&snippet)
    }

    fn model_names(&self) -> Result<Vec<String>, EnvError> {
        self.run("result = sorted(env.registry.models.keys())\n")
    }
}

/// Registry model names, loaded on first use and kept until
/// [`ModelNameCache::invalidate`]. Owned by the caller; there is no
/// process-wide copy.
#[derive(Debug, Default)]
pub struct ModelNameCache {
    names: Option<Vec<String>>,
}

impl ModelNameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names<E: ModelEnv + ?Sized>(&mut self, env: &E) -> Result<&[String], EnvError> {
        if self.names.is_none() {
            self.names = Some(env.model_names()?);
        }
        Ok(self.names.as_deref().unwrap_or_default())
    }

    pub fn contains<E: ModelEnv + ?Sized>(&mut self, env: &E, model: &str) -> Result<bool, EnvError> {
        Ok(self.names(env)?.iter().any(|name| name == model))
    }

    pub fn is_loaded(&self) -> bool {
        self.names.is_some()
    }

    pub fn invalidate(&mut self) {
        self.names = None;
    }
}
