use crate::config::ImportConfig;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{self, parse_string_list};
use crate::ipc::types::{AppState, Request};
use crate::matching::{resolve_identities, scope_directory, ExamScope, FileStudent, FuzzyChoice};
use crate::session::match_options;
use crate::store::{self, StudentDirectory, StudentInput};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let classes = match req.params.get("classNames") {
        None | Some(serde_json::Value::Null) => None,
        Some(v) => match parse_string_list(v, "classNames") {
            Ok(c) => Some(c),
            Err(msg) => return err(&req.id, "bad_params", msg, None),
        },
    };
    match store::SqliteWorkspace::new(conn).list_students(classes.as_deref()) {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(raw) = req.params.get("students") else {
        return err(&req.id, "bad_params", "missing params.students", None);
    };
    let students: Vec<StudentInput> = match serde_json::from_value(raw.clone()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_params", format!("invalid students: {}", e), None),
    };
    match store::upsert_students(conn, &students) {
        Ok(ids) => ok(&req.id, json!({ "ids": ids })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChoiceParam {
    file_index: usize,
    #[serde(flatten)]
    choice: FuzzyChoice,
}

/// Stateless identity resolution of a student list against the directory.
fn handle_students_match(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(raw) = req.params.get("fileStudents") else {
        return err(&req.id, "bad_params", "missing params.fileStudents", None);
    };
    let file_students: Vec<FileStudent> = match serde_json::from_value(raw.clone()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_params", format!("invalid fileStudents: {}", e), None),
    };
    let choices: BTreeMap<usize, FuzzyChoice> = match req.params.get("choices") {
        None | Some(serde_json::Value::Null) => BTreeMap::new(),
        Some(v) => match serde_json::from_value::<Vec<ChoiceParam>>(v.clone()) {
            Ok(list) => list.into_iter().map(|c| (c.file_index, c.choice)).collect(),
            Err(e) => return err(&req.id, "bad_params", format!("invalid choices: {}", e), None),
        },
    };
    let config = match ImportConfig::load(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let scope = match helpers::get_optional_str(&req.params, "scope") {
        Some(s) => match ExamScope::parse(s) {
            Some(v) => v,
            None => return err(&req.id, "bad_params", "scope must be one of: class, grade", None),
        },
        None => config.default_exam_scope,
    };

    let (directory, notice) = helpers::load_directory(conn);
    let directory = scope_directory(&directory, &file_students, scope);
    let report = resolve_identities(&file_students, &directory, &choices, &match_options(&config));
    let advice = report.advice(&choices);
    ok(
        &req.id,
        json!({
            "report": report,
            "advice": advice,
            "warnings": notice.into_iter().collect::<Vec<_>>(),
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.upsert" => Some(handle_students_upsert(state, req)),
        "students.match" => Some(handle_students_match(state, req)),
        _ => None,
    }
}
