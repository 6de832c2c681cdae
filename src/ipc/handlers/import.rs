use crate::catalog::FieldCatalog;
use crate::commit::{execute_commit, MergeStrategy, NewStudentStrategy};
use crate::error::ImportError;
use crate::ipc::error::{err, import_err, ok};
use crate::ipc::helpers::{self, get_optional_str, get_required_str, parse_string_list, parse_target};
use crate::ipc::types::{AppState, Request};
use crate::mapping::{resolve_headers, MappingCache, MappingTarget};
use crate::matching::{ExamScope, FuzzyChoice};
use crate::session::{reduce, ImportSession, Notice, SessionContext, SessionEvent, Step};
use crate::store::{self, CustomFieldRegistry, SqliteGradeStore, SqliteMappingCache};
use crate::suggest::{run_batches, LocalRuleSource, Suggestion, SuggestionRequest};
use serde_json::{json, Value};

const PREVIEW_ROWS: usize = 10;

fn snapshot(session: &ImportSession, catalog: &FieldCatalog, extra: &[Notice]) -> Value {
    let file = &session.file;
    let preview = file.rows.iter().take(PREVIEW_ROWS).collect::<Vec<_>>();
    let choices = session
        .fuzzy_choices
        .iter()
        .map(|(idx, choice)| json!({ "fileIndex": idx, "choice": choice }))
        .collect::<Vec<_>>();
    let report = session.report();
    let advice = report.map(|r| r.advice(&session.fuzzy_choices));
    let warnings = session.warnings.iter().chain(extra).collect::<Vec<_>>();
    json!({
        "sessionId": session.id,
        "step": session.step.as_str(),
        "stepNumber": session.step.number(),
        "fileName": file.file_name,
        "headers": file.headers,
        "rowCount": file.rows.len(),
        "preview": preview,
        "signature": session.signature,
        "examInfo": session.exam_info,
        "mapping": session.mapping,
        "confidence": session.confidence,
        "mappingFromCache": session.mapping_from_cache,
        "mappingRevision": session.mapping_revision,
        "autoSkippedMapping": session.auto_skipped_mapping,
        "manualHeaders": session.manual_headers,
        "pendingSuggestions": session.pending_suggestions,
        "mergeStrategy": session.merge_strategy,
        "newStudentStrategy": session.new_student_strategy,
        "examScope": session.exam_scope,
        "fuzzyChoices": choices,
        "pendingFuzzy": session.pending_fuzzy(),
        "match": report,
        "advice": advice,
        "commitInFlight": session.commit_in_flight,
        "lastCommit": session.last_commit,
        "warnings": warnings,
        "fields": catalog.fields(),
    })
}

/// `Input` errors invalidate the file, so the session goes with them.
fn fail(state: &mut AppState, req: &Request, e: &ImportError) -> Value {
    if e.is_fatal() && state.session.take().is_some() {
        log::info!("import session closed: {}", e);
    }
    import_err(&req.id, e)
}

fn needs_directory(step: Step, event: &SessionEvent) -> bool {
    step == Step::StudentStrategy && matches!(event, SessionEvent::Advance)
}

/// Runs one event through the reducer and stores the resulting session.
fn apply_event(state: &mut AppState, req: &Request, event: SessionEvent) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(session) = state.session.as_ref() else {
        return err(&req.id, "no_session", "open an import first", None);
    };
    let (catalog, config) = match helpers::load_context(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (directory, notice) = if needs_directory(session.step, &event) {
        helpers::load_directory(conn)
    } else {
        (Vec::new(), None)
    };
    let ctx = SessionContext {
        directory: &directory,
        catalog: &catalog,
        config: &config,
    };
    match reduce(session, event, &ctx) {
        Ok(next) => {
            let body = snapshot(&next, &catalog, notice.as_slice());
            // A closed session is reported once, then discarded.
            state.session = (!next.step.is_terminal()).then_some(next);
            ok(&req.id, body)
        }
        Err(e) => fail(state, req, &e),
    }
}

fn handle_import_open(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if state.session.as_ref().is_some_and(|s| s.commit_in_flight) {
        return import_err(&req.id, &ImportError::CommitInFlight);
    }
    let file = match helpers::parse_file(&req.params) {
        Ok(f) => f,
        Err(e) => return fail(state, req, &e),
    };
    let (catalog, config) = match helpers::load_context(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let cache = SqliteMappingCache::new(conn);
    let resolution = resolve_headers(&file.headers, &file.rows, &catalog, &cache, &config);
    log::debug!(
        "import {}: {} headers, {} rows, {:?} confidence",
        file.file_name,
        file.headers.len(),
        file.rows.len(),
        resolution.confidence
    );
    match ImportSession::open(file, resolution, &config) {
        Ok(session) => {
            let body = snapshot(&session, &catalog, &[]);
            state.session = Some(session);
            ok(&req.id, body)
        }
        Err(e) => fail(state, req, &e),
    }
}

fn handle_import_session(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(session) = state.session.as_ref() else {
        return ok(&req.id, json!({ "session": null }));
    };
    match helpers::load_catalog(conn) {
        Ok(catalog) => ok(&req.id, json!({ "session": snapshot(session, &catalog, &[]) })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

const STEPS: [Step; 5] = [
    Step::Preview,
    Step::ExamMetadata,
    Step::MappingReview,
    Step::StudentStrategy,
    Step::FinalConfirm,
];

fn parse_step(v: &Value) -> Option<Step> {
    match v {
        Value::Number(n) => n.as_u64().and_then(Step::from_number),
        Value::String(s) => STEPS.into_iter().find(|st| st.as_str() == s.trim()),
        _ => None,
    }
}

fn handle_import_back(state: &mut AppState, req: &Request) -> Value {
    let Some(target) = req.params.get("step").and_then(parse_step) else {
        return err(&req.id, "bad_params", "step must be a step number (1-5) or name", None);
    };
    apply_event(state, req, SessionEvent::GoBack(target))
}

fn handle_import_set_exam_info(state: &mut AppState, req: &Request) -> Value {
    let Some(session) = state.session.as_ref() else {
        return err(&req.id, "no_session", "open an import first", None);
    };
    let mut info = session.exam_info.clone();
    for (key, slot) in [
        ("title", &mut info.title),
        ("type", &mut info.exam_type),
        ("date", &mut info.date),
    ] {
        match req.params.get(key) {
            None => {}
            Some(Value::String(s)) => *slot = s.clone(),
            Some(_) => return err(&req.id, "bad_params", format!("{} must be string", key), None),
        }
    }
    match req.params.get("subject") {
        None => {}
        Some(Value::Null) => info.subject = None,
        Some(Value::String(s)) => info.subject = Some(s.clone()),
        Some(_) => return err(&req.id, "bad_params", "subject must be string or null", None),
    }
    apply_event(state, req, SessionEvent::SetExamInfo(info))
}

fn handle_import_set_mapping(state: &mut AppState, req: &Request) -> Value {
    let header = match get_required_str(&req.params, "header") {
        Ok(h) => h.to_string(),
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let target = match parse_target(req.params.get("target").unwrap_or(&Value::Null)) {
        Ok(t) => t,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    apply_event(state, req, SessionEvent::SetMapping { header, target })
}

/// Requests suggestions for the given headers (default: every unclaimed,
/// unconfirmed header) from the local rules and applies them in order.
fn handle_import_suggest_mappings(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(session) = state.session.as_ref() else {
        return err(&req.id, "no_session", "open an import first", None);
    };
    let headers = match req.params.get("headers") {
        None | Some(Value::Null) => session
            .mapping
            .entries()
            .iter()
            .filter(|e| {
                matches!(e.target, MappingTarget::Ignored | MappingTarget::PendingCustom { .. })
                    && !session.manual_headers.contains(&e.header)
            })
            .map(|e| e.header.clone())
            .collect::<Vec<_>>(),
        Some(v) => match parse_string_list(v, "headers") {
            Ok(h) => h,
            Err(msg) => return err(&req.id, "bad_params", msg, None),
        },
    };
    let (catalog, config) = match helpers::load_context(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let ctx = SessionContext {
        directory: &[],
        catalog: &catalog,
        config: &config,
    };

    let mut current = match reduce(session, SessionEvent::SuggestionsRequested(headers.clone()), &ctx) {
        Ok(s) => s,
        Err(e) => return fail(state, req, &e),
    };
    let requests = headers
        .iter()
        .filter(|h| current.pending_suggestions.contains(*h))
        .map(|h| SuggestionRequest {
            header: h.clone(),
            sample: current
                .file
                .header_index(h)
                .map(|idx| {
                    current
                        .file
                        .column_sample(idx, config.sample_size)
                        .into_iter()
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
        })
        .collect::<Vec<_>>();
    let outcomes = run_batches(
        &LocalRuleSource,
        &requests,
        &catalog,
        config.suggestion_batch_size,
        config.suggestion_retries,
    );

    let mut notices = Vec::new();
    for outcome in &outcomes {
        let event = SessionEvent::SuggestionArrived {
            header: outcome.header.clone(),
            suggestion: outcome.suggestion.clone(),
        };
        match reduce(&current, event, &ctx) {
            Ok(next) => {
                notices.extend(next.warnings.iter().cloned());
                current = next;
            }
            Err(e) => log::warn!("suggestion for {:?} not applied: {}", outcome.header, e),
        }
    }
    current.warnings = notices;

    let mut body = snapshot(&current, &catalog, &[]);
    body["suggestions"] = json!(outcomes);
    state.session = Some(current);
    ok(&req.id, body)
}

/// Applies one externally produced suggestion, e.g. from the shell's AI proxy.
fn handle_import_apply_suggestion(state: &mut AppState, req: &Request) -> Value {
    let header = match get_required_str(&req.params, "header") {
        Ok(h) => h.to_string(),
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let suggestion = match req.params.get("suggestion") {
        None | Some(Value::Null) => None,
        Some(v) => match serde_json::from_value::<Suggestion>(v.clone()) {
            Ok(s) => Some(s),
            Err(e) => return err(&req.id, "bad_params", format!("invalid suggestion: {}", e), None),
        },
    };
    if let Some(msg) = get_optional_str(&req.params, "error") {
        log::warn!("external suggestion for {:?} failed: {}", header, msg);
    }
    apply_event(state, req, SessionEvent::SuggestionArrived { header, suggestion })
}

fn handle_import_create_custom_field(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(session) = state.session.as_ref() else {
        return err(&req.id, "no_session", "open an import first", None);
    };
    let header = match get_required_str(&req.params, "header") {
        Ok(h) => h.to_string(),
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let Some(entry) = session.mapping.get(&header) else {
        return err(&req.id, "bad_params", format!("unknown header: {}", header), None);
    };
    if session.step > Step::MappingReview {
        let e = ImportError::InvalidTransition {
            step: session.step.as_str(),
            action: "create custom field",
            reason: "go back to the mapping step first".into(),
        };
        return import_err(&req.id, &e);
    }
    let label = match (get_optional_str(&req.params, "label"), &entry.target) {
        (Some(l), _) => l.to_string(),
        (None, MappingTarget::PendingCustom { label }) => label.clone(),
        (None, _) => header.clone(),
    };

    let field = match store::SqliteWorkspace::new(conn).create_field(&label, &header) {
        Ok(f) => f,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    log::info!("custom field {} registered for {:?}", field.key, header);
    apply_event(state, req, SessionEvent::CustomFieldCreated { header, field })
}

fn handle_import_set_strategies(state: &mut AppState, req: &Request) -> Value {
    let merge = match get_optional_str(&req.params, "mergeStrategy") {
        None => None,
        Some(s) => match MergeStrategy::parse(s) {
            Some(m) => Some(m),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "mergeStrategy must be one of: merge, replace, add_only",
                    None,
                )
            }
        },
    };
    let new_student = match get_optional_str(&req.params, "newStudentStrategy") {
        None => None,
        Some(s) => match NewStudentStrategy::parse(s) {
            Some(n) => Some(n),
            None => {
                return err(&req.id, "bad_params", "newStudentStrategy must be one of: create, ignore", None)
            }
        },
    };
    let scope = match get_optional_str(&req.params, "examScope") {
        None => None,
        Some(s) => match ExamScope::parse(s) {
            Some(v) => Some(v),
            None => return err(&req.id, "bad_params", "examScope must be one of: class, grade", None),
        },
    };
    apply_event(
        state,
        req,
        SessionEvent::SetStrategies {
            merge,
            new_student,
            scope,
        },
    )
}

/// `decision` is `confirmed` (with `systemStudentId`), `rejected`, or absent
/// to clear an earlier decision.
fn handle_import_resolve_fuzzy(state: &mut AppState, req: &Request) -> Value {
    let Some(file_index) = req.params.get("fileIndex").and_then(|v| v.as_u64()) else {
        return err(&req.id, "bad_params", "missing params.fileIndex", None);
    };
    let choice = match req.params.get("decision") {
        None | Some(Value::Null) => None,
        Some(_) => match serde_json::from_value::<FuzzyChoice>(req.params.clone()) {
            Ok(c) => Some(c),
            Err(e) => return err(&req.id, "bad_params", format!("invalid decision: {}", e), None),
        },
    };
    apply_event(
        state,
        req,
        SessionEvent::ResolveFuzzy {
            file_index: file_index as usize,
            choice,
        },
    )
}

/// Writes the session's rows inside one transaction. Row failures are part
/// of the summary; a failure to save the exam or to commit the transaction
/// rolls everything back and leaves the session at final confirmation.
fn handle_import_commit(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(session) = state.session.as_ref() else {
        return err(&req.id, "no_session", "open an import first", None);
    };
    let require_resolved = req
        .params
        .get("requireResolved")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if require_resolved && session.step == Step::FinalConfirm {
        let pending = session.pending_fuzzy();
        if pending > 0 {
            return import_err(&req.id, &ImportError::ResolutionAmbiguous { pending });
        }
    }
    let (catalog, config) = match helpers::load_context(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let ctx = SessionContext {
        directory: &[],
        catalog: &catalog,
        config: &config,
    };

    let in_flight = match reduce(session, SessionEvent::BeginCommit, &ctx) {
        Ok(s) => s,
        Err(e) => return fail(state, req, &e),
    };

    let outcome = (|| -> Result<_, ImportError> {
        let plan = in_flight.commit_plan(&catalog)?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| ImportError::Commit(format!("transaction could not start: {}", e)))?;
        let summary = {
            let mut grade_store = SqliteGradeStore::new(&tx);
            execute_commit(&plan, &mut grade_store)?
        };
        tx.commit()
            .map_err(|e| ImportError::Commit(format!("transaction could not commit: {}", e)))?;
        Ok(summary)
    })();

    let event = match outcome {
        Ok(summary) => {
            let cache = SqliteMappingCache::new(conn);
            if let Err(e) = cache.put(&in_flight.signature, &in_flight.file.headers, &in_flight.mapping) {
                log::warn!("mapping cache write failed: {:#}", e);
            }
            if let Err(e) = store::save_last_confirmed_mapping(
                conn,
                &in_flight.signature,
                &in_flight.file.headers,
                &in_flight.mapping,
            ) {
                log::warn!("last confirmed mapping not saved: {:#}", e);
            }
            SessionEvent::CommitFinished(summary)
        }
        Err(e) => {
            log::warn!("import commit failed: {}", e);
            let failed = reduce(&in_flight, SessionEvent::CommitFailed(e.to_string()), &ctx);
            state.session = failed.ok().or(Some(in_flight));
            let commit_error = match e {
                ImportError::Store(inner) => ImportError::Commit(format!("{:#}", inner)),
                other => other,
            };
            return import_err(&req.id, &commit_error);
        }
    };

    match reduce(&in_flight, event, &ctx) {
        Ok(done) => {
            let body = snapshot(&done, &catalog, &[]);
            state.session = None;
            ok(&req.id, body)
        }
        Err(e) => fail(state, req, &e),
    }
}

fn handle_import_cancel(state: &mut AppState, req: &Request) -> Value {
    apply_event(state, req, SessionEvent::Cancel)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "import.open" => Some(handle_import_open(state, req)),
        "import.session" => Some(handle_import_session(state, req)),
        "import.next" => Some(apply_event(state, req, SessionEvent::Advance)),
        "import.back" => Some(handle_import_back(state, req)),
        "import.setExamInfo" => Some(handle_import_set_exam_info(state, req)),
        "import.setMapping" => Some(handle_import_set_mapping(state, req)),
        "import.suggestMappings" => Some(handle_import_suggest_mappings(state, req)),
        "import.applySuggestion" => Some(handle_import_apply_suggestion(state, req)),
        "import.createCustomField" => Some(handle_import_create_custom_field(state, req)),
        "import.setStrategies" => Some(handle_import_set_strategies(state, req)),
        "import.resolveFuzzy" => Some(handle_import_resolve_fuzzy(state, req)),
        "import.commit" => Some(handle_import_commit(state, req)),
        "import.cancel" => Some(handle_import_cancel(state, req)),
        _ => None,
    }
}
