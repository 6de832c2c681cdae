use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{self, parse_rows, parse_string_list};
use crate::ipc::types::{AppState, Request};
use crate::mapping::{expected_field, resolve_headers};
use crate::store::SqliteMappingCache;
use serde_json::json;

/// Resolves a header row without opening a session. The cache is read, never
/// written; only a committed import confirms a mapping.
fn handle_mapping_resolve(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let headers = match req.params.get("headers") {
        Some(v) => match parse_string_list(v, "headers") {
            Ok(h) => h,
            Err(msg) => return err(&req.id, "bad_params", msg, None),
        },
        None => return err(&req.id, "bad_params", "missing params.headers", None),
    };
    if headers.is_empty() {
        return err(&req.id, "bad_params", "headers must not be empty", None);
    }
    let rows = match req.params.get("rows") {
        Some(v) => match parse_rows(v, &headers) {
            Ok(r) => r,
            Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
        },
        None => Vec::new(),
    };
    let (catalog, config) = match helpers::load_context(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let cache = SqliteMappingCache::new(conn);
    let resolution = resolve_headers(&headers, &rows, &catalog, &cache, &config);
    let expected = headers
        .iter()
        .map(|h| json!({ "header": h, "field": expected_field(h, &catalog) }))
        .collect::<Vec<_>>();
    ok(
        &req.id,
        json!({
            "resolution": resolution,
            "expected": expected,
            "fields": catalog.fields(),
        }),
    )
}

fn handle_custom_fields_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match helpers::load_catalog(conn) {
        Ok(catalog) => ok(
            &req.id,
            json!({
                "customFields": catalog.custom_fields(),
                "fields": catalog.fields(),
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "mapping.resolve" => Some(handle_mapping_resolve(state, req)),
        "customFields.list" => Some(handle_custom_fields_list(state, req)),
        _ => None,
    }
}
