//! Pagination, filtering and the response token budget.
//!
//! Everything here is a pure function of its inputs. The same contract is
//! applied to live and index-backed answers.

use crate::config::Config;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const MAX_PAGE_SIZE: usize = 1000;

/// Caps applied by the generic truncation pass.
const LIST_CAP: usize = 10;
const STRING_CAP: usize = 1000;
const ELLIPSIS: &str = "...";
/// Headroom left under the hard limit when shrinking an items list.
const SHRINK_FACTOR: f64 = 0.8;
/// Strings at or below this length are left whole by the final fitting pass.
const MIN_HALVED_STRING: usize = 16;
const MAX_FIT_ROUNDS: usize = 64;
const MAX_FIT_DEPTH: usize = 8;

/// Keys added by the shaping layer itself; never truncated.
const BOOKKEEPING_KEYS: &[&str] = &[
    "success",
    "pagination",
    "size_warning",
    "truncated",
    "truncation_info",
    "truncated_fields",
    "mode_used",
    "data_quality",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationWindow {
    pub page: usize,
    pub page_size: usize,
    pub filter_text: Option<String>,
}

impl Default for PaginationWindow {
    fn default() -> Self {
        Self::new(1, DEFAULT_PAGE_SIZE, None)
    }
}

impl PaginationWindow {
    pub fn new(page: usize, page_size: usize, filter_text: Option<String>) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
            filter_text: filter_text.filter(|text| !text.is_empty()),
        }
    }

    /// `limit`/`offset` addressing. The offset is rounded down to the page
    /// that contains it.
    pub fn from_limit_offset(limit: usize, offset: usize, filter_text: Option<String>) -> Self {
        let page_size = limit.clamp(1, MAX_PAGE_SIZE);
        Self::new(offset / page_size + 1, page_size, filter_text)
    }

    /// Read `page`, `page_size`, `limit`, `offset` and `filter` from a tool
    /// argument object. Numbers may arrive as JSON numbers or numeric strings.
    pub fn from_arguments(arguments: &Value) -> Self {
        Self::from_arguments_with_default(arguments, DEFAULT_PAGE_SIZE)
    }

    pub fn from_arguments_with_default(arguments: &Value, default_page_size: usize) -> Self {
        let filter_text = arguments
            .get("filter")
            .and_then(|value| match value {
                Value::String(text) => Some(text.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|text| !text.is_empty());

        if let Some(limit) = int_argument(arguments, "limit").filter(|limit| *limit > 0) {
            let offset = int_argument(arguments, "offset").unwrap_or(0).max(0);
            return Self::from_limit_offset(limit as usize, offset as usize, filter_text);
        }

        let page = int_argument(arguments, "page").filter(|page| *page != 0).unwrap_or(1);
        let page_size = int_argument(arguments, "page_size")
            .filter(|size| *size != 0)
            .unwrap_or(default_page_size as i64);
        Self::new(page.max(1) as usize, page_size.max(1) as usize, filter_text)
    }

    /// Saturates, so a far-out page simply lies past the end.
    pub fn offset(&self) -> usize {
        self.page.saturating_sub(1).saturating_mul(self.page_size)
    }
}

fn int_argument(arguments: &Value, key: &str) -> Option<i64> {
    match arguments.get(key)? {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|value| value as i64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaginatedPage<T> {
    pub items: Vec<T>,
    pub total_count: usize,
    pub page: usize,
    pub page_size: usize,
    pub filter_applied: Option<String>,
}

impl<T> PaginatedPage<T> {
    pub fn total_pages(&self) -> usize {
        self.total_count.div_ceil(self.page_size)
    }

    pub fn has_next_page(&self) -> bool {
        self.page < self.total_pages()
    }

    pub fn has_previous_page(&self) -> bool {
        self.page > 1
    }

    pub fn pagination(&self) -> Value {
        json!({
            "page": self.page,
            "page_size": self.page_size,
            "total_count": self.total_count,
            "total_pages": self.total_pages(),
            "has_next_page": self.has_next_page(),
            "has_previous_page": self.has_previous_page(),
            "filter_applied": self.filter_applied,
        })
    }
}

impl<T: Serialize> PaginatedPage<T> {
    pub fn to_value(&self) -> serde_json::Result<Value> {
        Ok(json!({
            "items": serde_json::to_value(&self.items)?,
            "pagination": self.pagination(),
        }))
    }
}

/// Filter then slice. `total_count` counts the filtered set. With
/// `search_fields` the filter only looks at those keys of object items.
pub fn paginate<T: Serialize>(
    items: Vec<T>,
    window: &PaginationWindow,
    search_fields: &[&str],
) -> PaginatedPage<T> {
    let filtered: Vec<T> = match window.filter_text.as_deref() {
        Some(needle) => {
            let needle = needle.to_lowercase();
            items
                .into_iter()
                .filter(|item| match serde_json::to_value(item) {
                    Ok(value) => matches_filter(&value, &needle, search_fields),
                    Err(_) => false,
                })
                .collect()
        }
        None => items,
    };

    let total_count = filtered.len();
    let page_items = filtered
        .into_iter()
        .skip(window.offset())
        .take(window.page_size)
        .collect();
    PaginatedPage {
        items: page_items,
        total_count,
        page: window.page,
        page_size: window.page_size,
        filter_applied: window.filter_text.clone(),
    }
}

fn matches_filter(item: &Value, needle: &str, search_fields: &[&str]) -> bool {
    match (item, search_fields.is_empty()) {
        (Value::Object(map), false) => search_fields
            .iter()
            .filter_map(|field| map.get(*field))
            .any(|value| display_text(value).to_lowercase().contains(needle)),
        _ => display_text(item).to_lowercase().contains(needle),
    }
}

fn display_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Soft and hard thresholds in estimated tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    pub soft: usize,
    pub hard: usize,
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self {
            soft: 20_000,
            hard: 25_000,
        }
    }
}

impl TokenBudget {
    pub fn from_config(config: &Config) -> Self {
        Self {
            soft: config.warn_tokens.min(config.max_tokens),
            hard: config.max_tokens,
        }
    }
}

/// Serialized length / 4.
pub fn estimate_tokens(value: &Value) -> usize {
    serde_json::to_string(value)
        .map(|text| text.len() / 4)
        .unwrap_or(0)
}

/// Attach a warning above the soft threshold, truncate above the hard one.
/// Never fails: an oversized answer always comes back smaller, not as an
/// error.
pub fn enforce_budget(response: Value, budget: &TokenBudget) -> Value {
    let estimated = estimate_tokens(&response);
    if estimated <= budget.soft {
        return response;
    }
    let Value::Object(mut map) = response else {
        warn!("odoo-lens: oversized non-object response ({estimated} tokens) left as is");
        return response;
    };

    if estimated <= budget.hard {
        map.insert(
            "size_warning".to_string(),
            json!({
                "estimated_tokens": estimated,
                "threshold": budget.soft,
                "max_tokens": budget.hard,
                "hints": [
                    "Use page and page_size to fetch smaller pages",
                    "Use filter to narrow the results",
                    "Ask a narrower question, e.g. a single model or field",
                ],
            }),
        );
        return Value::Object(map);
    }

    warn!(
        "odoo-lens: response of ~{estimated} tokens exceeds the {} token limit; truncating",
        budget.hard
    );
    let mut info = Map::new();
    info.insert("estimated_tokens".to_string(), json!(estimated));
    info.insert("max_tokens".to_string(), json!(budget.hard));

    let shrunk = shrink_items(&mut map, estimated, budget.hard);
    if let Some((path, original)) = &shrunk {
        let returned = items_len(&map, path).unwrap_or(0);
        info.insert("strategy".to_string(), json!("items"));
        info.insert("items_path".to_string(), json!(path.join(".")));
        info.insert("original_count".to_string(), json!(original));
        info.insert("returned_count".to_string(), json!(returned));
        info.insert("message".to_string(), json!(items_message(returned, *original)));
    } else {
        info.insert("strategy".to_string(), json!("generic"));
    }
    map.insert("truncated".to_string(), json!(true));
    map.insert("truncation_info".to_string(), Value::Object(info));

    let mut altered = Vec::new();
    if estimate_map(&map) > budget.hard {
        altered = truncate_generic(&mut map);
        debug!("odoo-lens: generic truncation altered {altered:?}");
    }
    fit_to_budget(&mut map, budget.hard, &mut altered);

    if let Some((path, original)) = &shrunk {
        let returned = items_len(&map, path).unwrap_or(0);
        if let Some(Value::Object(info)) = map.get_mut("truncation_info") {
            info.insert("returned_count".to_string(), json!(returned));
            info.insert("message".to_string(), json!(items_message(returned, *original)));
        }
    }
    Value::Object(map)
}

fn items_message(returned: usize, original: usize) -> String {
    format!("Showing {returned} of {original} items; use pagination or filter to see the rest")
}

fn estimate_map(map: &Map<String, Value>) -> usize {
    serde_json::to_string(map)
        .map(|text| text.len() / 4)
        .unwrap_or(0)
}

fn serialized_len(value: &Value) -> usize {
    serde_json::to_string(value).map(|text| text.len()).unwrap_or(0)
}

/// Halve the largest remaining value, descending into a child that holds
/// at least half of its parent, until the response fits under `hard` or
/// nothing is left to shrink.
fn fit_to_budget(map: &mut Map<String, Value>, hard: usize, altered: &mut Vec<String>) {
    for _ in 0..MAX_FIT_ROUNDS {
        if !altered.is_empty() {
            map.insert("truncated_fields".to_string(), json!(altered));
        }
        if estimate_map(map) <= hard {
            return;
        }
        let Some(path) = largest_shrinkable(map) else {
            warn!("odoo-lens: nothing left to shrink; response stays over {hard} tokens");
            return;
        };
        if let Some(target) = value_at_mut(map, &path) {
            halve(target);
        }
        let dotted = path.join(".");
        if !altered.contains(&dotted) {
            altered.push(dotted);
        }
    }
}

fn largest_shrinkable(map: &Map<String, Value>) -> Option<Vec<String>> {
    let (key, mut current) = map
        .iter()
        .filter(|(key, value)| !BOOKKEEPING_KEYS.contains(&key.as_str()) && can_halve(value))
        .max_by_key(|(_, value)| serialized_len(value))?;
    let mut path = vec![key.clone()];
    while path.len() < MAX_FIT_DEPTH {
        let Some((step, child)) = largest_child(current) else {
            break;
        };
        if serialized_len(child) * 2 < serialized_len(current) {
            break;
        }
        path.push(step);
        current = child;
    }
    Some(path)
}

fn largest_child(value: &Value) -> Option<(String, &Value)> {
    match value {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .filter(|(_, item)| can_halve(item))
            .max_by_key(|(_, item)| serialized_len(item))
            .map(|(index, item)| (index.to_string(), item)),
        Value::Object(fields) => fields
            .iter()
            .filter(|(_, item)| can_halve(item))
            .max_by_key(|(_, item)| serialized_len(item))
            .map(|(key, item)| (key.clone(), item)),
        _ => None,
    }
}

fn can_halve(value: &Value) -> bool {
    match value {
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
        Value::String(text) => text.chars().count() > MIN_HALVED_STRING,
        _ => false,
    }
}

fn halve(value: &mut Value) {
    match value {
        Value::Array(items) => items.truncate(items.len() / 2),
        Value::Object(fields) => {
            let keep = fields.len() / 2;
            *fields = std::mem::take(fields).into_iter().take(keep).collect();
        }
        Value::String(text) => {
            let keep = text.chars().count() / 2;
            let mut halved: String = text.chars().take(keep).collect();
            halved.push_str(ELLIPSIS);
            *text = halved;
        }
        _ => {}
    }
}

fn value_at_mut<'a>(map: &'a mut Map<String, Value>, path: &[String]) -> Option<&'a mut Value> {
    let (first, rest) = path.split_first()?;
    let mut current = map.get_mut(first)?;
    for step in rest {
        current = match current {
            Value::Array(items) => items.get_mut(step.parse::<usize>().ok()?)?,
            other => other.get_mut(step.as_str())?,
        };
    }
    Some(current)
}

/// Path of the known items list: top-level `items`, or `items` inside a
/// top-level object field.
fn find_items(map: &Map<String, Value>) -> Option<Vec<String>> {
    if map.get("items").is_some_and(Value::is_array) {
        return Some(vec!["items".to_string()]);
    }
    map.iter()
        .filter(|(key, _)| !BOOKKEEPING_KEYS.contains(&key.as_str()))
        .find(|(_, value)| value.get("items").is_some_and(Value::is_array))
        .map(|(key, _)| vec![key.clone(), "items".to_string()])
}

fn items_mut<'a>(map: &'a mut Map<String, Value>, path: &[String]) -> Option<&'a mut Vec<Value>> {
    let (first, rest) = path.split_first()?;
    let mut current = map.get_mut(first)?;
    for key in rest {
        current = current.get_mut(key)?;
    }
    current.as_array_mut()
}

fn items_len(map: &Map<String, Value>, path: &[String]) -> Option<usize> {
    let (first, rest) = path.split_first()?;
    let mut current = map.get(first)?;
    for key in rest {
        current = current.get(key)?;
    }
    current.as_array().map(Vec::len)
}

fn shrink_items(
    map: &mut Map<String, Value>,
    estimated: usize,
    hard: usize,
) -> Option<(Vec<String>, usize)> {
    let path = find_items(map)?;
    let items = items_mut(map, &path)?;
    let original = items.len();
    let keep = (original as f64 * (hard as f64 / estimated as f64) * SHRINK_FACTOR).floor() as usize;
    items.truncate(keep.min(original));
    Some((path, original))
}

/// Cap long lists and strings at the top level and one object level down.
/// Returns the dotted names of the fields that changed.
fn truncate_generic(map: &mut Map<String, Value>) -> Vec<String> {
    let mut altered = Vec::new();
    for (key, value) in map.iter_mut() {
        if BOOKKEEPING_KEYS.contains(&key.as_str()) {
            continue;
        }
        if cap_value(value) {
            altered.push(key.clone());
            continue;
        }
        if let Value::Object(inner) = value {
            for (inner_key, inner_value) in inner.iter_mut() {
                if cap_value(inner_value) {
                    altered.push(format!("{key}.{inner_key}"));
                }
            }
        }
    }
    altered
}

fn cap_value(value: &mut Value) -> bool {
    match value {
        Value::Array(items) if items.len() > LIST_CAP => {
            items.truncate(LIST_CAP);
            true
        }
        Value::String(text) if text.chars().count() > STRING_CAP => {
            let mut capped: String = text.chars().take(STRING_CAP).collect();
            capped.push_str(ELLIPSIS);
            *text = capped;
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_clamps_and_defaults() {
        let window = PaginationWindow::from_arguments(&json!({}));
        assert_eq!(window, PaginationWindow::new(1, 100, None));

        let window = PaginationWindow::from_arguments(&json!({"page": "2", "page_size": 5000}));
        assert_eq!((window.page, window.page_size), (2, 1000));

        let window = PaginationWindow::from_arguments(&json!({"page": -4, "page_size": -1}));
        assert_eq!((window.page, window.page_size), (1, 1));

        let window = PaginationWindow::from_arguments(&json!({"filter": ""}));
        assert_eq!(window.filter_text, None);
    }

    #[test]
    fn limit_without_offset_starts_at_zero() {
        let window = PaginationWindow::from_arguments(&json!({"limit": 10}));
        assert_eq!((window.page, window.page_size), (1, 10));
        let window = PaginationWindow::from_arguments(&json!({"limit": 10, "offset": 25}));
        assert_eq!((window.page, window.page_size), (3, 10));
        let window = PaginationWindow::from_arguments(&json!({"limit": 5000, "offset": 0}));
        assert_eq!(window.page_size, MAX_PAGE_SIZE);
    }

    #[test]
    fn far_pages_lie_past_the_end() {
        let window = PaginationWindow::from_arguments(&json!({"page": i64::MAX, "page_size": 100}));
        assert_eq!(window.offset(), usize::MAX);
        let page = paginate((0..10).collect::<Vec<i32>>(), &window, &[]);
        assert!(page.items.is_empty());
        assert_eq!(page.total_count, 10);
        assert!(!page.has_next_page());
    }

    #[test]
    fn filter_counts_before_slicing() {
        let items: Vec<Value> = (1..=30)
            .map(|i| json!({"id": i, "name": if i % 3 == 0 { format!("Fizz {i}") } else { format!("n{i}") }}))
            .collect();
        let window = PaginationWindow::new(2, 4, Some("fizz".to_string()));
        let page = paginate(items, &window, &["name"]);
        assert_eq!(page.total_count, 10);
        assert_eq!(page.total_pages(), 3);
        assert_eq!(page.items.len(), 4);
        assert_eq!(page.items[0]["id"], json!(15));
        assert!(page.has_next_page());
        assert!(page.has_previous_page());
    }

    #[test]
    fn search_fields_restrict_matching() {
        let items = vec![
            json!({"name": "alpha", "description": "beta"}),
            json!({"name": "gamma", "description": "alpha"}),
        ];
        let window = PaginationWindow::new(1, 10, Some("ALPHA".to_string()));
        assert_eq!(paginate(items.clone(), &window, &["name"]).total_count, 1);
        assert_eq!(paginate(items, &window, &[]).total_count, 2);
    }

    #[test]
    fn plain_strings_match_their_text() {
        let items = vec!["sale.order", "res.partner"];
        let window = PaginationWindow::new(1, 10, Some("Partner".to_string()));
        let page = paginate(items, &window, &[]);
        assert_eq!(page.items, vec!["res.partner"]);
        assert_eq!(page.filter_applied.as_deref(), Some("Partner"));
    }

    #[test]
    fn under_soft_threshold_is_untouched() {
        let response = json!({"success": true, "result": "small"});
        assert_eq!(enforce_budget(response.clone(), &TokenBudget::default()), response);
    }

    #[test]
    fn soft_threshold_adds_warning() {
        let budget = TokenBudget { soft: 10, hard: 1000 };
        let response = json!({"result": "x".repeat(200)});
        let shaped = enforce_budget(response, &budget);
        assert_eq!(shaped["size_warning"]["threshold"], json!(10));
        assert!(shaped.get("truncated").is_none());
    }

    #[test]
    fn nested_items_shrink_proportionally() {
        let items: Vec<Value> = (0..400).map(|i| json!({"id": i, "name": format!("record {i}")})).collect();
        let response = json!({"success": true, "result": {"items": items, "pagination": {}}});
        let before = estimate_tokens(&response);
        let budget = TokenBudget { soft: 100, hard: 500 };
        let shaped = enforce_budget(response, &budget);
        let kept = shaped["result"]["items"].as_array().unwrap().len();
        let expected = (400.0 * (500.0 / before as f64) * 0.8).floor() as usize;
        assert_eq!(kept, expected);
        assert_eq!(shaped["truncated"], json!(true));
        assert_eq!(shaped["truncation_info"]["original_count"], json!(400));
        assert_eq!(shaped["truncation_info"]["items_path"], json!("result.items"));
    }

    #[test]
    fn generic_pass_caps_lists_and_strings() {
        let response = json!({
            "success": true,
            "names": (0..5000).map(|i| format!("n{i}")).collect::<Vec<_>>(),
            "blob": "y".repeat(50_000),
            "short": "ok",
        });
        let shaped = enforce_budget(response, &TokenBudget { soft: 100, hard: 1000 });
        assert_eq!(shaped["names"].as_array().unwrap().len(), LIST_CAP);
        let blob = shaped["blob"].as_str().unwrap();
        assert_eq!(blob.len(), STRING_CAP + ELLIPSIS.len());
        assert!(blob.ends_with(ELLIPSIS));
        assert_eq!(shaped["short"], json!("ok"));
        let fields = shaped["truncated_fields"].as_array().unwrap();
        assert!(fields.contains(&json!("names")));
        assert!(fields.contains(&json!("blob")));
        assert_eq!(shaped["truncation_info"]["strategy"], json!("generic"));
    }

    #[test]
    fn wide_objects_shrink_under_the_hard_limit() {
        let fields: Map<String, Value> = (0..5000)
            .map(|i| (format!("field_{i:05}"), json!("char")))
            .collect();
        let response = json!({"success": true, "result": fields});
        let before = estimate_tokens(&response);
        let budget = TokenBudget { soft: 1000, hard: 2000 };
        let shaped = enforce_budget(response, &budget);
        let after = estimate_tokens(&shaped);
        assert!(after < before);
        assert!(after <= budget.hard, "{after} tokens");
        assert_eq!(shaped["truncated"], json!(true));
        assert_eq!(shaped["success"], json!(true));
        assert_eq!(shaped["truncation_info"]["strategy"], json!("generic"));
        assert_eq!(shaped["truncated_fields"], json!(["result"]));
        let kept = shaped["result"].as_object().unwrap();
        assert!(!kept.is_empty() && kept.len() < 5000);
        assert!(kept.contains_key("field_00000"));
    }

    #[test]
    fn one_huge_record_is_cut_inside() {
        let response = json!({
            "success": true,
            "result": {
                "name": "export",
                "rows": [{"id": 1}, {"id": 2, "body": "z".repeat(40_000)}],
            },
        });
        let budget = TokenBudget { soft: 500, hard: 1000 };
        let shaped = enforce_budget(response, &budget);
        assert!(estimate_tokens(&shaped) <= budget.hard);
        assert_eq!(shaped["truncated_fields"], json!(["result.rows.1.body"]));
        let rows = shaped["result"]["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["id"], json!(2));
        assert!(rows[1]["body"].as_str().unwrap().ends_with(ELLIPSIS));
    }
}
