// Gateway integration tests
// Drive the router end to end over a scripted exec channel

use odoo_lens::config::Config;
use odoo_lens::indexer;
use odoo_lens::policy::Policy;
use odoo_lens::router::{Gateway, Mode, Query};
use odoo_lens::shape::{PaginationWindow, TokenBudget, estimate_tokens};
use odoo_lens::transport::{ExecChannel, ExecOutput, TransportFailure};
use serde_json::{Value, json};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::Duration;

/// Records every call and answers with canned stdout.
#[derive(Default)]
struct FakeChannel {
    shell_stdout: String,
    /// Per-call answers, used before falling back to `shell_stdout`.
    shell_replies: RefCell<VecDeque<String>>,
    script_stdout: String,
    shell_calls: RefCell<Vec<String>>,
    script_calls: RefCell<Vec<String>>,
}

impl FakeChannel {
    fn answering(result: Value) -> Self {
        Self {
            shell_stdout: format!("Odoo shell booting...\n\n{}\n", json!({ "result": result })),
            ..Default::default()
        }
    }

    fn replying(results: &[Value]) -> Self {
        Self {
            shell_replies: RefCell::new(
                results
                    .iter()
                    .map(|result| format!("\n{}\n", json!({ "result": result })))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn scanning(index: Value) -> Self {
        Self {
            script_stdout: format!("{index}\n"),
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.shell_calls.borrow().len() + self.script_calls.borrow().len()
    }
}

impl ExecChannel for FakeChannel {
    fn run_shell(&self, input: &str, _timeout: Duration) -> Result<ExecOutput, TransportFailure> {
        self.shell_calls.borrow_mut().push(input.to_string());
        let stdout = self
            .shell_replies
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| self.shell_stdout.clone());
        Ok(ExecOutput {
            exit_code: Some(0),
            stdout,
            stderr: String::new(),
        })
    }

    fn run_script(&self, program: &str, _timeout: Duration) -> Result<ExecOutput, TransportFailure> {
        self.script_calls.borrow_mut().push(program.to_string());
        Ok(ExecOutput {
            exit_code: Some(0),
            stdout: self.script_stdout.clone(),
            stderr: String::new(),
        })
    }
}

fn gateway(channel: &FakeChannel) -> Gateway<&FakeChannel> {
    Gateway::new(channel, &Config::default())
}

fn execute(code: &str) -> Query {
    Query::Execute {
        code: code.to_string(),
    }
}

fn sample_scan() -> Value {
    json!({
        "models": {
            "sale.order": {
                "class": "SaleOrder",
                "module": "sale",
                "file": "/odoo/addons/sale/models/sale_order.py",
                "description": "Sales Order",
                "inherits": ["mail.thread"],
                "fields": {
                    "partner_id": {"type": "many2one", "string": "Customer", "relation": "res.partner", "required": true, "store": true},
                    "amount_total": {"type": "monetary", "string": "Total", "compute": "_compute_amounts", "store": true}
                },
                "methods": ["action_confirm", "_compute_amounts"],
                "decorators": {
                    "_compute_amounts": [{"type": "depends", "args": ["order_line.price_total"]}]
                }
            },
            "res.partner": {
                "class": "Partner",
                "module": "base",
                "file": "/odoo/odoo/addons/base/models/res_partner.py",
                "description": "Contact"
            }
        }
    })
}

#[test]
fn rejected_snippet_never_reaches_the_channel() {
    let channel = FakeChannel::answering(json!(1));
    let gw = gateway(&channel);
    for snippet in [
        "import os\nresult = os.listdir('/')",
        "result = ().__class__.__bases__",
        "f = eval\nresult = f('1')",
        "while True:\n    pass",
    ] {
        let response = gw.resolve(Mode::Registry, &execute(snippet), &PaginationWindow::default());
        assert_eq!(response["success"], json!(false), "{snippet}");
        assert_eq!(response["error_type"], json!("PolicyViolation"), "{snippet}");
    }
    assert_eq!(channel.calls(), 0);
}

#[test]
fn widened_policy_admits_extra_modules() {
    let channel = FakeChannel::answering(json!(1));
    let snippet = execute("import yaml\nresult = 1");
    let refused = gateway(&channel).resolve(Mode::Registry, &snippet, &PaginationWindow::default());
    assert_eq!(refused["error_type"], json!("PolicyViolation"));
    assert_eq!(channel.calls(), 0);

    let widened = gateway(&channel).with_policy(Policy::default().allow_module("yaml"));
    let response = widened.resolve(Mode::Registry, &snippet, &PaginationWindow::default());
    assert_eq!(response, json!({"success": true, "result": 1}));
    assert_eq!(channel.calls(), 1);
}

#[test]
fn accepted_snippet_is_wrapped_and_decoded() {
    let channel = FakeChannel::answering(json!(42));
    let gw = gateway(&channel);
    let response = gw.resolve(
        Mode::Auto,
        &execute("result = env['res.partner'].search_count([])"),
        &PaginationWindow::default(),
    );
    assert_eq!(response, json!({"success": true, "result": 42}));
    let calls = channel.shell_calls.borrow();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].contains("search_count"));
    assert!(calls[0].contains("compile("));
}

#[test]
fn list_results_are_paginated() {
    let items: Vec<Value> = (1..=250).map(|id| json!({"id": id})).collect();
    let channel = FakeChannel::answering(Value::Array(items));
    let gw = gateway(&channel);
    let window = PaginationWindow::from_arguments(&json!({"page": 3, "page_size": 100}));
    let response = gw.resolve(Mode::Registry, &execute("result = rows"), &window);

    let page = &response["result"];
    assert_eq!(page["items"].as_array().unwrap().len(), 50);
    assert_eq!(page["items"][0]["id"], json!(201));
    assert_eq!(page["pagination"]["total_count"], json!(250));
    assert_eq!(page["pagination"]["total_pages"], json!(3));
    assert_eq!(page["pagination"]["has_next_page"], json!(false));
    assert_eq!(page["pagination"]["has_previous_page"], json!(true));
}

#[test]
fn limit_offset_addresses_the_same_page() {
    let by_page = PaginationWindow::from_arguments(&json!({"page": 3, "page_size": 25}));
    let by_limit = PaginationWindow::from_arguments(&json!({"limit": 25, "offset": 50}));
    assert_eq!(by_page, by_limit);
    let by_strings = PaginationWindow::from_arguments(&json!({"limit": "25", "offset": "50"}));
    assert_eq!(by_page, by_strings);
}

#[test]
fn oversized_answers_come_back_smaller() {
    let filler = "x".repeat(200);
    let items: Vec<Value> = (0..400).map(|id| json!({"id": id, "note": filler})).collect();
    let before = estimate_tokens(&Value::Array(items.clone()));
    let channel = FakeChannel::answering(Value::Array(items));
    let gw = gateway(&channel).with_budget(TokenBudget {
        soft: 2_000,
        hard: 4_000,
    });
    let window = PaginationWindow::new(1, 400, None);
    let response = gw.resolve(Mode::Registry, &execute("result = rows"), &window);

    assert_eq!(response["truncated"], json!(true));
    let after = estimate_tokens(&response);
    assert!(after < before, "{after} >= {before}");
    assert!(after <= 4_000, "{after} tokens");
    let info = &response["truncation_info"];
    assert_eq!(info["original_count"], json!(400));
    let returned = info["returned_count"].as_u64().unwrap() as usize;
    assert!(returned < 400);
    assert_eq!(response["result"]["items"].as_array().unwrap().len(), returned);
}

#[test]
fn oversized_maps_come_back_smaller() {
    let fields: serde_json::Map<String, Value> = (0..5000)
        .map(|i| (format!("field_{i:05}"), json!("char")))
        .collect();
    let before = estimate_tokens(&json!({"success": true, "result": fields.clone()}));
    let channel = FakeChannel::answering(Value::Object(fields));
    let gw = gateway(&channel).with_budget(TokenBudget {
        soft: 1_000,
        hard: 2_000,
    });
    let response = gw.resolve(
        Mode::Registry,
        &execute("result = env['sale.order'].fields_get()"),
        &PaginationWindow::default(),
    );
    assert_eq!(response["truncated"], json!(true));
    let after = estimate_tokens(&response);
    assert!(after < before, "{after} >= {before}");
    assert!(after <= 2_000, "{after} tokens");
}

#[test]
fn far_page_numbers_return_an_empty_page() {
    let items: Vec<Value> = (1..=250).map(|id| json!({"id": id})).collect();
    let channel = FakeChannel::answering(Value::Array(items));
    let window = PaginationWindow::from_arguments(&json!({"page": i64::MAX, "page_size": 100}));
    let response = gateway(&channel).resolve(Mode::Registry, &execute("result = rows"), &window);
    assert_eq!(response["success"], json!(true));
    assert_eq!(response["result"]["items"], json!([]));
    assert_eq!(response["result"]["pagination"]["total_count"], json!(250));
    assert_eq!(response["result"]["pagination"]["has_next_page"], json!(false));
}

#[test]
fn fs_mode_answers_from_the_scan() {
    let channel = FakeChannel::scanning(sample_scan());
    let gw = gateway(&channel).with_roots(vec!["/odoo/addons".to_string()]);

    let query = Query::from_method("model_info", &json!({"model_name": "sale.order"})).unwrap();
    let window = PaginationWindow::from_arguments_with_default(&json!({}), query.default_page_size());
    let info = gw.resolve(Mode::Fs, &query, &window);
    assert_eq!(info["success"], json!(true));
    assert_eq!(info["mode_used"], json!("fs"));
    assert_eq!(info["data_quality"], json!("approximate"));
    assert_eq!(info["total_field_count"], json!(2));
    assert_eq!(info["fields"]["items"][0]["name"], json!("amount_total"));

    let query = Query::from_method("search_decorators", &json!({"decorator": "depends"})).unwrap();
    let found = gw.resolve(Mode::Fs, &query, &PaginationWindow::default());
    assert_eq!(found["results"]["items"][0]["model"], json!("sale.order"));
    assert_eq!(
        found["results"]["items"][0]["methods"][0]["arguments"],
        json!(["order_line.price_total"])
    );

    // fs never touches the runtime shell, and each query re-scans.
    assert!(channel.shell_calls.borrow().is_empty());
    assert_eq!(channel.script_calls.borrow().len(), 2);
    assert!(channel.script_calls.borrow()[0].starts_with(r#"roots = ["/odoo/addons"]"#));
}

#[test]
fn fs_mode_refuses_to_execute() {
    let channel = FakeChannel::scanning(sample_scan());
    let response = gateway(&channel).resolve(
        Mode::Fs,
        &execute("result = 1"),
        &PaginationWindow::default(),
    );
    assert_eq!(response["error_type"], json!("UnsupportedMode"));
    assert_eq!(channel.calls(), 0);
}

#[test]
fn registry_mode_ranks_live_models() {
    let catalog = json!([
        {"name": "res.partner", "description": "Contact"},
        {"name": "res.partner.bank", "description": "Bank Accounts"},
        {"name": "account.move", "description": "Journal Entry for partner"},
        {"name": "sale.order", "description": "Sales Order"}
    ]);
    let channel = FakeChannel::answering(catalog);
    let query = Query::SearchModels {
        pattern: "partner".to_string(),
    };
    let response = gateway(&channel).resolve(Mode::Registry, &query, &PaginationWindow::default());
    assert_eq!(response["mode_used"], json!("registry"));
    assert_eq!(response["total_models"], json!(4));
    let names: Vec<&str> = response["matches"]["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["res.partner", "res.partner.bank", "account.move"]);
}

#[test]
fn record_queries_run_typed_registry_operations() {
    let channel = FakeChannel::replying(&[
        json!(42),
        json!([{"id": 7, "display_name": "S00007"}, {"id": 8, "display_name": "S00008"}]),
    ]);
    let query = Query::from_method(
        "search_records",
        &json!({"model_name": "sale.order", "domain": [["state", "=", "sale"]]}),
    )
    .unwrap();
    let window = PaginationWindow::from_arguments(&json!({"page": 3, "page_size": 2}));
    let response = gateway(&channel).resolve(Mode::Auto, &query, &window);

    assert_eq!(response["success"], json!(true));
    assert_eq!(response["mode_used"], json!("registry"));
    assert_eq!(response["records"]["items"][1]["display_name"], json!("S00008"));
    assert_eq!(response["records"]["pagination"]["total_count"], json!(42));
    assert_eq!(response["records"]["pagination"]["total_pages"], json!(21));
    let calls = channel.shell_calls.borrow();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].contains("search_count("));
    assert!(calls[1].contains("limit=2, offset=4"));
}

#[test]
fn record_counts_and_their_limits() {
    let channel = FakeChannel::answering(json!(3));
    let gw = gateway(&channel);
    let count = Query::from_method("search_count", &json!({"model": "res.partner"})).unwrap();
    let response = gw.resolve(Mode::Registry, &count, &PaginationWindow::default());
    assert_eq!(response["count"], json!(3));
    assert_eq!(response["model"], json!("res.partner"));

    let refused = gw.resolve(Mode::Fs, &count, &PaginationWindow::default());
    assert_eq!(refused["error_type"], json!("UnsupportedMode"));
    assert!(Query::from_method("search_count", &json!({"model_name": "res.partner", "domain": {"a": 1}})).is_err());
    assert!(Query::from_method("search_records", &json!({"model_name": "x'];import os#"})).is_err());
    assert_eq!(channel.calls(), 1);
}

#[test]
fn scan_failures_are_reported_not_swapped() {
    let channel = FakeChannel {
        script_stdout: "Traceback (most recent call last):\n".to_string(),
        ..Default::default()
    };
    let query = Query::SearchModels {
        pattern: "sale".to_string(),
    };
    let response = gateway(&channel).resolve(Mode::Fs, &query, &PaginationWindow::default());
    assert_eq!(response["success"], json!(false));
    assert_eq!(response["error_type"], json!("DecodeFailure"));
    assert!(channel.shell_calls.borrow().is_empty());

    let err = indexer::build_index(&channel, &[], Duration::from_secs(1)).unwrap_err();
    assert!(matches!(err, indexer::IndexFailure::Decode(_)));
}
