mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{request_ok, seed_workspace, spawn_sidecar};

fn run_import(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    tag: &str,
    row: serde_json::Value,
    merge: &str,
) -> serde_json::Value {
    let id = |n: u32| format!("{}-{}", tag, n);
    let _ = request_ok(
        stdin,
        reader,
        &id(1),
        "import.open",
        json!({
            "fileName": "月考.csv",
            "headers": ["学号", "姓名", "班级", "科目", "分数", "等级"],
            "rows": [row]
        }),
    );
    let _ = request_ok(stdin, reader, &id(2), "import.next", json!({}));
    let _ = request_ok(
        stdin,
        reader,
        &id(3),
        "import.setExamInfo",
        json!({ "type": "月考", "date": "2024-03-15" }),
    );
    let s = request_ok(stdin, reader, &id(4), "import.next", json!({}));
    assert_eq!(s["step"], json!("student_strategy"));
    let _ = request_ok(
        stdin,
        reader,
        &id(5),
        "import.setStrategies",
        json!({ "mergeStrategy": merge, "newStudentStrategy": "ignore" }),
    );
    let _ = request_ok(stdin, reader, &id(6), "import.next", json!({}));
    let s = request_ok(stdin, reader, &id(7), "import.commit", json!({}));
    assert_eq!(s["step"], json!("committed"));
    s["lastCommit"].clone()
}

fn only_record(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, id: &str) -> serde_json::Value {
    let grades = request_ok(stdin, reader, id, "grades.list", json!({}));
    let records = grades["records"].as_array().expect("records");
    assert_eq!(records.len(), 1);
    records[0].clone()
}

#[test]
fn merge_strategies_apply_to_existing_keys() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = seed_workspace(
        &mut stdin,
        &mut reader,
        "gradeimportd-merge",
        json!([{ "name": "张三", "studentId": "20230001", "className": "1班" }]),
    );

    let first = run_import(
        &mut stdin,
        &mut reader,
        "a",
        json!(["20230001", "张三", "1班", "数学", 70, "B"]),
        "merge",
    );
    assert_eq!(first["inserted"], json!(1));

    let add_only = run_import(
        &mut stdin,
        &mut reader,
        "b",
        json!(["20230001", "张三", "1班", "数学", 95, "A"]),
        "add_only",
    );
    assert_eq!(add_only["skippedExisting"], json!(1));
    let rec = only_record(&mut stdin, &mut reader, "b-r");
    assert_eq!(rec["score"], json!(70.0));
    assert_eq!(rec["originalGrade"], json!("B"));

    let merged = run_import(
        &mut stdin,
        &mut reader,
        "c",
        json!(["20230001", "张三", "1班", "数学", 95, ""]),
        "merge",
    );
    assert_eq!(merged["updated"], json!(1));
    let rec = only_record(&mut stdin, &mut reader, "c-r");
    assert_eq!(rec["score"], json!(95.0));
    assert_eq!(rec["originalGrade"], json!("B"));

    let replaced = run_import(
        &mut stdin,
        &mut reader,
        "d",
        json!(["20230001", "张三", "1班", "数学", 60, null]),
        "replace",
    );
    assert_eq!(replaced["replaced"], json!(1));
    let rec = only_record(&mut stdin, &mut reader, "d-r");
    assert_eq!(rec["score"], json!(60.0));
    assert!(rec["originalGrade"].is_null());

    let exams = request_ok(&mut stdin, &mut reader, "e", "exams.list", json!({}));
    assert_eq!(exams["exams"].as_array().map(|a| a.len()), Some(1));

    let _ = child.kill();
}

#[test]
fn ignored_new_students_are_counted_not_written() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = seed_workspace(&mut stdin, &mut reader, "gradeimportd-ignore-new", json!([]));

    let summary = run_import(
        &mut stdin,
        &mut reader,
        "a",
        json!(["20230005", "周七", "2班", "英语", 81, "A"]),
        "merge",
    );
    assert_eq!(summary["droppedNew"], json!(1));
    assert_eq!(summary["inserted"], json!(0));

    let grades = request_ok(&mut stdin, &mut reader, "g", "grades.list", json!({}));
    assert_eq!(grades["records"], json!([]));
    let students = request_ok(&mut stdin, &mut reader, "s", "students.list", json!({}));
    assert_eq!(students["students"], json!([]));

    let _ = child.kill();
}
