mod test_support;

use serde_json::json;
use test_support::{error_code, request, request_ok, seed_workspace, spawn_sidecar};

#[test]
fn import_setup_defaults_and_validation() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = seed_workspace(&mut stdin, &mut reader, "gradeimportd-setup", json!([]));

    let setup = request_ok(&mut stdin, &mut reader, "1", "setup.get", json!({}));
    let import = &setup["import"];
    assert_eq!(import["similarityThreshold"], json!(0.6));
    assert_eq!(import["candidateCap"], json!(3));
    assert_eq!(import["sampleSize"], json!(10));
    assert_eq!(import["numericFallbackRatio"], json!(0.8));
    assert_eq!(import["suggestionBatchSize"], json!(3));
    assert_eq!(import["suggestionRetries"], json!(2));
    assert_eq!(import["autoSkipHighConfidence"], json!(true));
    assert_eq!(import["defaultExamScope"], json!("class"));

    let bad = request(
        &mut stdin,
        &mut reader,
        "2",
        "setup.update",
        json!({ "section": "import", "patch": { "candidateCap": 0, "sampleSize": 20 } }),
    );
    assert_eq!(error_code(&bad), "bad_params");
    let unknown = request(
        &mut stdin,
        &mut reader,
        "3",
        "setup.update",
        json!({ "section": "printer", "patch": {} }),
    );
    assert_eq!(error_code(&unknown), "bad_params");

    let setup = request_ok(&mut stdin, &mut reader, "4", "setup.get", json!({}));
    assert_eq!(setup["import"]["sampleSize"], json!(10));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "setup.update",
        json!({
            "section": "import",
            "patch": { "similarityThreshold": 0.7, "defaultExamScope": "grade" }
        }),
    );
    let setup = request_ok(&mut stdin, &mut reader, "6", "setup.get", json!({}));
    assert_eq!(setup["import"]["similarityThreshold"], json!(0.7));
    assert_eq!(setup["import"]["defaultExamScope"], json!("grade"));

    let _ = child.kill();
}

#[test]
fn similarity_threshold_setting_drives_matching() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = seed_workspace(
        &mut stdin,
        &mut reader,
        "gradeimportd-threshold",
        json!([{ "name": "李晓四", "studentId": "20239999", "className": "1班" }]),
    );
    let file_students = json!({ "fileStudents": [{ "name": "李小四", "className": "1班" }] });

    let loose = request_ok(&mut stdin, &mut reader, "1", "students.match", file_students.clone());
    assert_eq!(loose["report"]["records"][0]["type"], json!("fuzzy_match"));
    assert_eq!(loose["report"]["statistics"]["fuzzyMatchCount"], json!(1));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "setup.update",
        json!({ "section": "import", "patch": { "similarityThreshold": 0.9 } }),
    );
    let strict = request_ok(&mut stdin, &mut reader, "3", "students.match", file_students);
    assert_eq!(strict["report"]["records"][0]["type"], json!("new_student"));
    assert_eq!(strict["report"]["missingStudents"][0]["type"], json!("missing_student"));

    let _ = child.kill();
}
