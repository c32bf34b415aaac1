use anyhow::{Context, Result};
use clap::Parser;
use odoo_lens::cli::{self, PageArgs, SnippetSource};
use odoo_lens::config::Config;
use odoo_lens::indexer;
use odoo_lens::params;
use odoo_lens::policy::Policy;
use odoo_lens::router::{Gateway, Mode, Query};
use odoo_lens::shape::PaginationWindow;
use serde_json::{Value, json};
use std::path::PathBuf;

fn read_snippet(source: SnippetSource) -> Result<String> {
    match (source.code, source.file) {
        (Some(code), _) => Ok(code),
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("read snippet {}", path.display())),
        (None, None) => anyhow::bail!("either --code or --file is required"),
    }
}

fn page_arguments(page: &PageArgs) -> Value {
    let mut args = serde_json::Map::new();
    let mut put = |key: &str, value: Option<usize>| {
        if let Some(value) = value {
            args.insert(key.to_string(), json!(value));
        }
    };
    put("page", page.page);
    put("page_size", page.page_size);
    put("limit", page.limit);
    put("offset", page.offset);
    if let Some(filter) = &page.filter {
        args.insert("filter".to_string(), json!(filter));
    }
    Value::Object(args)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .init();

    let args = cli::Args::parse();
    let config = Config::get();

    match args.command {
        cli::Command::Validate { source } => {
            let snippet = read_snippet(source)?;
            let violations = Policy::default().violations(&snippet);
            print_json(&json!({
                "valid": violations.is_empty(),
                "violations": violations,
            }))
        }
        cli::Command::Exec { source, page } => {
            let snippet = read_snippet(source)?;
            let gateway = Gateway::from_config(config)?;
            let window = PaginationWindow::from_arguments(&page_arguments(&page));
            let response = gateway.resolve(Mode::Registry, &Query::Execute { code: snippet }, &window);
            print_json(&response)
        }
        cli::Command::Index { roots, local } => {
            let roots = if roots.is_empty() {
                config.addons_path.clone()
            } else {
                roots
            };
            if local {
                let paths: Vec<PathBuf> = roots.iter().map(PathBuf::from).collect();
                let index = indexer::local::index_roots(&paths)?;
                return print_json(&serde_json::to_value(&index)?);
            }
            let gateway = Gateway::from_config(config)?.with_roots(roots);
            match gateway.build_index() {
                Ok(index) => print_json(&serde_json::to_value(&index)?),
                Err(failure) => print_json(&failure.into_response()),
            }
        }
        cli::Command::Query {
            method,
            params,
            params_file,
            mode,
        } => {
            let params_raw = if let Some(path) = params_file {
                std::fs::read_to_string(&path)
                    .with_context(|| format!("read params {}", path.display()))?
            } else {
                params
            };
            let params: Value = serde_json::from_str(&params_raw).context("parse --params")?;
            let query = match Query::from_method(&method, &params) {
                Ok(query) => query,
                Err(err) => {
                    return print_json(&json!({
                        "success": false,
                        "error": err.to_string(),
                        "error_type": "InvalidArgument",
                    }));
                }
            };
            let window =
                PaginationWindow::from_arguments_with_default(&params, query.default_page_size());
            let gateway = Gateway::from_config(config)?;
            print_json(&gateway.resolve(mode, &query, &window))
        }
        cli::Command::Methods => print_json(&params::method_list()),
    }
}
