use crate::error::ImportError;
use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

pub fn import_err(id: &str, e: &ImportError) -> serde_json::Value {
    let details = match e {
        ImportError::ResolutionAmbiguous { pending } => Some(json!({ "pending": pending })),
        ImportError::InvalidTransition { step, action, .. } => {
            Some(json!({ "step": step, "action": action }))
        }
        ImportError::Input(_) => Some(json!({ "sessionCleared": true })),
        _ => None,
    };
    err(id, e.code(), format!("{:#}", e), details)
}
