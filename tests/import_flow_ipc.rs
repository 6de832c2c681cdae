mod test_support;

use serde_json::json;
use test_support::{error_code, request, request_ok, seed_workspace, spawn_sidecar};

fn exam_file() -> serde_json::Value {
    json!({
        "fileName": "期中考试.xlsx",
        "headers": ["学号", "姓名", "班级", "科目", "分数"],
        "rows": [
            ["20230001", "张三", "1班", "数学", 88],
            ["", "李小四", "1班", "数学", 92],
            ["20230003", "王五", "1班", "数学", 75]
        ]
    })
}

#[test]
fn high_confidence_import_runs_end_to_end() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let ids = seed_workspace(
        &mut stdin,
        &mut reader,
        "gradeimportd-flow",
        json!([
            { "name": "张三", "studentId": "20230001", "className": "1班" },
            { "name": "李晓四", "studentId": "20239999", "className": "1班" }
        ]),
    );
    assert_eq!(ids.len(), 2);

    let s = request_ok(&mut stdin, &mut reader, "1", "import.open", exam_file());
    assert_eq!(s["step"], json!("preview"));
    assert_eq!(s["confidence"], json!("high"));
    assert_eq!(s["mappingFromCache"], json!(false));
    assert_eq!(s["examInfo"]["title"], json!("期中考试"));
    assert_eq!(s["rowCount"], json!(3));

    let s = request_ok(&mut stdin, &mut reader, "2", "import.next", json!({}));
    assert_eq!(s["step"], json!("exam_metadata"));
    let blocked = request(&mut stdin, &mut reader, "3", "import.next", json!({}));
    assert_eq!(error_code(&blocked), "invalid_transition");

    let s = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "import.setExamInfo",
        json!({ "type": "期中", "date": "2024/4/20" }),
    );
    assert_eq!(s["examInfo"]["date"], json!("2024-04-20"));

    let s = request_ok(&mut stdin, &mut reader, "5", "import.next", json!({}));
    assert_eq!(s["step"], json!("student_strategy"));
    assert_eq!(s["autoSkippedMapping"], json!(true));
    assert_eq!(s["warnings"][0]["code"], json!("mapping_auto_skipped"));

    let no_strategy = request(&mut stdin, &mut reader, "6", "import.next", json!({}));
    assert_eq!(error_code(&no_strategy), "invalid_transition");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "import.setStrategies",
        json!({ "mergeStrategy": "merge", "newStudentStrategy": "create" }),
    );
    let s = request_ok(&mut stdin, &mut reader, "8", "import.next", json!({}));
    assert_eq!(s["step"], json!("final_confirm"));
    assert_eq!(s["pendingFuzzy"], json!(1));
    let stats = &s["match"]["statistics"];
    assert_eq!(stats["exactMatchCount"], json!(1));
    assert_eq!(stats["fuzzyMatchCount"], json!(1));
    assert_eq!(stats["newStudentCount"], json!(1));
    assert_eq!(s["match"]["records"][1]["type"], json!("fuzzy_match"));
    assert_eq!(
        s["match"]["records"][1]["candidates"][0]["systemStudent"]["id"],
        json!(ids[1])
    );

    let strict = request(
        &mut stdin,
        &mut reader,
        "9",
        "import.commit",
        json!({ "requireResolved": true }),
    );
    assert_eq!(error_code(&strict), "resolution_ambiguous");
    assert_eq!(strict["error"]["details"]["pending"], json!(1));

    let s = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "import.resolveFuzzy",
        json!({ "fileIndex": 1, "decision": "confirmed", "systemStudentId": ids[1] }),
    );
    assert_eq!(s["pendingFuzzy"], json!(0));

    let s = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "import.commit",
        json!({ "requireResolved": true }),
    );
    assert_eq!(s["step"], json!("committed"));
    assert_eq!(s["lastCommit"]["inserted"], json!(3));
    assert_eq!(s["lastCommit"]["createdStudents"], json!(1));
    assert_eq!(s["lastCommit"]["heldFuzzy"], json!(0));

    let closed = request(&mut stdin, &mut reader, "12", "import.next", json!({}));
    assert_eq!(error_code(&closed), "no_session");
    let current = request_ok(&mut stdin, &mut reader, "12b", "import.session", json!({}));
    assert!(current["session"].is_null());

    let exams = request_ok(&mut stdin, &mut reader, "13", "exams.list", json!({}));
    let exam = &exams["exams"][0];
    assert_eq!(exam["title"], json!("期中考试"));
    assert_eq!(exam["date"], json!("2024-04-20"));
    assert_eq!(exam["recordCount"], json!(3));

    let grades = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "grades.list",
        json!({ "examId": exam["id"] }),
    );
    let records = grades["records"].as_array().expect("records");
    assert_eq!(records.len(), 3);
    let fuzzy = records
        .iter()
        .find(|r| r["studentRef"] == json!(ids[1]))
        .expect("confirmed fuzzy row");
    assert_eq!(fuzzy["matchType"], json!("fuzzy_confirmed"));
    assert_eq!(fuzzy["name"], json!("李晓四"));
    assert_eq!(fuzzy["score"], json!(92.0));
    assert!(records.iter().all(|r| r["subject"] == json!("数学")));

    let students = request_ok(&mut stdin, &mut reader, "15", "students.list", json!({}));
    assert_eq!(students["students"].as_array().map(|a| a.len()), Some(3));

    // The confirmed mapping is reused for the same header row.
    let again = request_ok(&mut stdin, &mut reader, "16", "import.open", exam_file());
    assert_eq!(again["mappingFromCache"], json!(true));
    assert_eq!(again["mapping"][0]["source"], json!("cache"));
    assert_eq!(again["mapping"][0]["target"]["key"], json!("student_id"));

    let cancelled = request_ok(&mut stdin, &mut reader, "17", "import.cancel", json!({}));
    assert_eq!(cancelled["step"], json!("cancelled"));
    let current = request_ok(&mut stdin, &mut reader, "18", "import.session", json!({}));
    assert!(current["session"].is_null());

    let _ = child.kill();
}

#[test]
fn invalid_file_is_rejected_and_clears_the_session() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = seed_workspace(&mut stdin, &mut reader, "gradeimportd-bad-file", json!([]));

    let _ = request_ok(&mut stdin, &mut reader, "1", "import.open", exam_file());
    let bad = request(
        &mut stdin,
        &mut reader,
        "2",
        "import.open",
        json!({ "headers": ["姓名", "姓名"], "rows": [["a", "b"]] }),
    );
    assert_eq!(error_code(&bad), "input_error");

    let current = request_ok(&mut stdin, &mut reader, "3", "import.session", json!({}));
    assert!(current["session"].is_null());

    let empty = request(
        &mut stdin,
        &mut reader,
        "4",
        "import.open",
        json!({ "headers": ["姓名"], "rows": [[""], [null]] }),
    );
    assert_eq!(error_code(&empty), "input_error");

    let _ = child.kill();
}
