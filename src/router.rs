//! Per-query backend selection.
//!
//! `fs` answers from a fresh static index; `registry` and `auto` validate a
//! snippet and run it live. A failing backend is reported, never swapped for
//! the other one.

use crate::config::Config;
use crate::env::{EnvError, ModelEnv, RemoteEnv};
use crate::index_query::{self, DECORATOR_TYPES, MODEL_INFO_PAGE_SIZE, ModelSummary};
use crate::indexer::{self, IndexFailure};
use crate::model::{ExecutionOutcome, ModelIndex, error_response};
use crate::params;
use crate::policy::Policy;
use crate::protocol;
use crate::pylit;
use crate::shape::{self, PaginatedPage, PaginationWindow, TokenBudget};
use crate::transport::{CommandChannel, ExecChannel};
use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use log::info;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Mode {
    #[default]
    Auto,
    Fs,
    Registry,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Auto => "auto",
            Mode::Fs => "fs",
            Mode::Registry => "registry",
        }
    }

    pub fn uses_index(&self) -> bool {
        matches!(self, Mode::Fs)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Mode::Auto),
            "fs" => Ok(Mode::Fs),
            "registry" => Ok(Mode::Registry),
            other => bail!("unknown mode: {other} (expected auto, fs or registry)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Run a caller snippet as is.
    Execute { code: String },
    ModelInfo { model: String },
    SearchModels { pattern: String },
    SearchDecorators { decorator: String },
    /// Live only: records matching `domain`, counted.
    SearchCount { model: String, domain: Value },
    /// Live only: one page of `{id, display_name}` rows matching `domain`.
    SearchRecords { model: String, domain: Value },
}

impl Query {
    /// Build a query from a method name and its parameter object. Names are
    /// validated here, before any snippet is generated.
    pub fn from_method(method: &str, params: &Value) -> Result<Self> {
        fn parse<T: DeserializeOwned>(method: &str, params: &Value) -> Result<T> {
            serde_json::from_value(params.clone())
                .with_context(|| format!("invalid params for {method}"))
        }
        fn required(key: &str, value: String) -> Result<String> {
            let value = value.trim();
            if value.is_empty() {
                bail!("missing required parameter: {key}");
            }
            Ok(value.to_string())
        }
        let query = match params::canonical_method(method) {
            "execute" => {
                let p: params::ExecuteParams = parse(method, params)?;
                Query::Execute {
                    code: required("code", p.code)?,
                }
            }
            "model_info" => {
                let p: params::ModelInfoParams = parse(method, params)?;
                Query::ModelInfo {
                    model: required("model_name", p.model_name)?,
                }
            }
            "search_models" => {
                let p: params::SearchModelsParams = parse(method, params)?;
                Query::SearchModels {
                    pattern: required("pattern", p.pattern)?,
                }
            }
            "search_decorators" => {
                let p: params::SearchDecoratorsParams = parse(method, params)?;
                Query::SearchDecorators {
                    decorator: required("decorator", p.decorator)?,
                }
            }
            method @ ("search_count" | "search_records") => {
                let p: params::RecordQueryParams = parse(method, params)?;
                let model = required("model_name", p.model_name)?;
                if method == "search_count" {
                    Query::SearchCount {
                        model,
                        domain: p.domain,
                    }
                } else {
                    Query::SearchRecords {
                        model,
                        domain: p.domain,
                    }
                }
            }
            other => bail!("unknown method: {other}"),
        };
        query.validate()?;
        Ok(query)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Query::ModelInfo { model }
            | Query::SearchCount { model, .. }
            | Query::SearchRecords { model, .. }
                if !pylit::is_model_name(model) =>
            {
                bail!("invalid model name: {model:?}")
            }
            Query::SearchCount { domain, .. } | Query::SearchRecords { domain, .. } => {
                pylit::domain(domain).map(|_| ())
            }
            Query::SearchDecorators { decorator }
                if !DECORATOR_TYPES.contains(&decorator.as_str()) =>
            {
                bail!(
                    "invalid decorator: {decorator:?} (expected one of {})",
                    DECORATOR_TYPES.join(", ")
                )
            }
            _ => Ok(()),
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Query::Execute { .. } => "execute",
            Query::ModelInfo { .. } => "model_info",
            Query::SearchModels { .. } => "search_models",
            Query::SearchDecorators { .. } => "search_decorators",
            Query::SearchCount { .. } => "search_count",
            Query::SearchRecords { .. } => "search_records",
        }
    }

    /// Default page size when the caller gives none.
    pub fn default_page_size(&self) -> usize {
        match self {
            Query::ModelInfo { .. } => MODEL_INFO_PAGE_SIZE,
            _ => shape::DEFAULT_PAGE_SIZE,
        }
    }
}

pub struct Gateway<C: ExecChannel> {
    channel: C,
    policy: Policy,
    exec_timeout: Duration,
    scan_timeout: Duration,
    roots: Vec<String>,
    budget: TokenBudget,
}

impl Gateway<CommandChannel> {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(CommandChannel::from_config(config)?, config))
    }
}

impl<C: ExecChannel> Gateway<C> {
    pub fn new(channel: C, config: &Config) -> Self {
        Self {
            channel,
            policy: Policy::default(),
            exec_timeout: config.exec_timeout(),
            scan_timeout: config.scan_timeout(),
            roots: config.addons_path.clone(),
            budget: TokenBudget::from_config(config),
        }
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_roots(mut self, roots: Vec<String>) -> Self {
        self.roots = roots;
        self
    }

    pub fn with_budget(mut self, budget: TokenBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Typed registry operations over this gateway's channel and policy.
    pub fn env(&self) -> RemoteEnv<'_, C> {
        RemoteEnv::new(&self.channel, &self.policy, self.exec_timeout)
    }

    /// Re-scan the configured roots through the exec channel.
    pub fn build_index(&self) -> Result<ModelIndex, IndexFailure> {
        indexer::build_index(&self.channel, &self.roots, self.scan_timeout)
    }

    /// Answer one query through the selected backend and shape the result.
    /// Always returns a JSON object; failures carry `error` and `error_type`.
    pub fn resolve(&self, mode: Mode, query: &Query, window: &PaginationWindow) -> Value {
        info!("odoo-lens: resolving {} in {mode} mode", query.method());
        let response = match query.validate() {
            Err(err) => error_response(err.to_string(), "InvalidArgument"),
            Ok(()) if mode.uses_index() => self.resolve_from_index(query, window),
            Ok(()) => self.resolve_live(query, window),
        };
        shape::enforce_budget(response, &self.budget)
    }

    fn resolve_from_index(&self, query: &Query, window: &PaginationWindow) -> Value {
        let with_index = |answer: &dyn Fn(&ModelIndex) -> Value| match self.build_index() {
            Ok(index) => answer(&index),
            Err(failure) => failure.into_response(),
        };
        match query {
            Query::Execute { .. } => error_response(
                "fs mode cannot execute code; use registry mode",
                "UnsupportedMode",
            ),
            Query::SearchCount { .. } | Query::SearchRecords { .. } => error_response(
                format!("fs mode has no records; use registry mode for {}", query.method()),
                "UnsupportedMode",
            ),
            Query::ModelInfo { model } => {
                with_index(&|index| index_query::model_info(index, model, window))
            }
            Query::SearchModels { pattern } => {
                with_index(&|index| index_query::search_models(index, pattern, window))
            }
            Query::SearchDecorators { decorator } => {
                with_index(&|index| index_query::search_decorators(index, decorator, window))
            }
        }
    }

    fn resolve_live(&self, query: &Query, window: &PaginationWindow) -> Value {
        let answer = match query {
            Query::Execute { code } => return self.execute_shaped(code, window),
            Query::ModelInfo { model } => self
                .run_generated(&model_info_snippet(model))
                .map(|value| render_live_model_info(model, value, window)),
            Query::SearchModels { pattern } => {
                self.run_generated(MODEL_CATALOG_SNIPPET).map(|value| {
                    let candidates = value.as_array().cloned().unwrap_or_default();
                    let total = candidates.len();
                    let ranked = index_query::rank_models(pattern, candidates);
                    index_query::render_search_models(pattern, total, ranked, window)
                })
            }
            Query::SearchDecorators { decorator } => self
                .run_generated(&decorator_snippet(decorator))
                .map(|value| {
                    let rows = value.as_array().cloned().unwrap_or_default();
                    index_query::render_search_decorators(decorator, rows, window)
                }),
            Query::SearchCount { model, domain } => self
                .env()
                .search_count(model, domain)
                .map(|count| json!({"success": true, "model": model, "count": count}))
                .map_err(|err| err.into_response()),
            Query::SearchRecords { model, domain } => self
                .search_records(model, domain, window)
                .map_err(|err| err.into_response()),
        };
        match answer {
            Ok(mut response) => {
                if let Value::Object(map) = &mut response {
                    map.insert("mode_used".to_string(), json!(Mode::Registry.as_str()));
                }
                response
            }
            Err(failure) => failure,
        }
    }

    fn search_records(
        &self,
        model: &str,
        domain: &Value,
        window: &PaginationWindow,
    ) -> Result<Value, EnvError> {
        let env = self.env();
        let total = env.search_count(model, domain)?;
        let records = env.search(model, domain, Some(window.page_size), window.offset())?;
        let page = PaginatedPage {
            items: records,
            total_count: usize::try_from(total).unwrap_or(usize::MAX),
            page: window.page,
            page_size: window.page_size,
            filter_applied: None,
        };
        Ok(json!({
            "success": true,
            "model": model,
            "records": page.to_value().map_err(|err| EnvError::UnexpectedResult(err.to_string()))?,
        }))
    }

    /// Run one generated snippet. `Err` carries the ready-made failure
    /// envelope.
    fn run_generated(&self, snippet: &str) -> Result<Value, Value> {
        self.policy
            .validate(snippet)
            .map_err(|violation| violation.into_response())?;
        match protocol::execute(&self.channel, snippet, self.exec_timeout) {
            ExecutionOutcome::Success(value) => Ok(value),
            other => Err(other.into_response()),
        }
    }

    /// Caller snippets: list results are paginated, anything else passes
    /// through the envelope as is.
    fn execute_shaped(&self, code: &str, window: &PaginationWindow) -> Value {
        if let Err(violation) = self.policy.validate(code) {
            return violation.into_response();
        }
        match protocol::execute(&self.channel, code, self.exec_timeout) {
            ExecutionOutcome::Success(Value::Array(items)) => {
                let page = shape::paginate(items, window, &[]);
                json!({
                    "success": true,
                    "result": { "items": page.items, "pagination": page.pagination() },
                })
            }
            outcome => outcome.into_response(),
        }
    }
}

/// `{name, description, transient, abstract, table}` for every registry model.
const MODEL_CATALOG_SNIPPET: &str = r#"result = []
for name in sorted(env.registry.models.keys()):
    model = env[name]
    result.append({
        "name": name,
        "description": model._description or "",
        "transient": bool(model._transient),
        "abstract": bool(model._abstract),
        "table": model._table,
    })
"#;

fn model_info_snippet(model: &str) -> String {
    format!(
        r#"model = env[{model}]
fields = model.fields_get(attributes=["type", "string", "required", "readonly", "store", "relation", "selection", "compute", "related"])
cls = type(model)
methods = []
for name in dir(cls):
    if name.startswith("_"):
        continue
    if callable(getattr(cls, name, None)) and name not in fields:
        methods.append(name)
result = {{
    "name": model._name,
    "description": model._description or "",
    "table": model._table,
    "transient": bool(model._transient),
    "abstract": bool(model._abstract),
    "rec_name": model._rec_name,
    "order": model._order,
    "inherits": list(model._inherit) if isinstance(model._inherit, (list, tuple)) else [model._inherit] if model._inherit else [],
    "delegates": dict(model._inherits),
    "fields": fields,
    "methods": methods,
}}
"#,
        model = pylit::string(model)
    )
}

fn decorator_snippet(decorator: &str) -> String {
    format!(
        r#"decorator = {decorator}
marker = {{"depends": "_depends", "constrains": "_constrains", "onchange": "_onchange"}}.get(decorator)
result = []
for model_name in sorted(env.registry.models.keys()):
    try:
        model = env[model_name]
        cls = type(model)
        found = []
        for name in dir(cls):
            if name.startswith("_"):
                continue
            member = getattr(cls, name, None)
            if not callable(member):
                continue
            if marker and hasattr(member, marker):
                args = getattr(member, marker)
                args = [str(a) for a in args] if isinstance(args, (list, tuple)) else []
                found.append({{"method": name, "arguments": args}})
            elif decorator == "model_create_multi" and getattr(member, "_api", None) == "model_create":
                found.append({{"method": name, "arguments": []}})
        if found:
            result.append({{"model": model_name, "description": model._description or "", "methods": found}})
    except Exception:
        continue
"#,
        decorator = pylit::string(decorator)
    )
}

fn render_live_model_info(model: &str, value: Value, window: &PaginationWindow) -> Value {
    let Value::Object(mut payload) = value else {
        return error_response(
            format!("unexpected model_info payload for {model}"),
            "DecodeFailure",
        );
    };
    let fields: BTreeMap<String, Value> = match payload.remove("fields") {
        Some(Value::Object(fields)) => fields.into_iter().collect(),
        _ => BTreeMap::new(),
    };
    let methods: Vec<String> = payload
        .remove("methods")
        .and_then(|methods| serde_json::from_value(methods).ok())
        .unwrap_or_default();
    let name = payload
        .remove("name")
        .and_then(|name| name.as_str().map(str::to_string))
        .unwrap_or_else(|| model.to_string());
    let details: Map<String, Value> = payload;
    index_query::render_model_info(
        ModelSummary {
            name,
            details,
            fields,
            methods,
        },
        window,
    )
}
