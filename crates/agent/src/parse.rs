//! Interpreting the oracle's free-form answer.
//!
//! An answer either signals completion or carries exactly one call. The
//! call is the substring from the first `{` to the last `}` of the trimmed
//! answer, parsed as one JSON object. Anything else is a parse error and
//! ends the session; it is never retried.

use droidpilot_core::error::SessionError;
use droidpilot_core::protocol::ToolCall;
use serde_json::{Map, Value};

/// Result text when a completed answer carries no message of its own.
pub const DEFAULT_RESULT: &str = "Task completed successfully!";

/// What the oracle asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    /// The task is done; the string is the result shown to the caller.
    Complete(String),
    /// Perform this call next.
    Call(ToolCall),
}

/// Classify an answer: completion first, otherwise a call.
pub fn interpret(answer: &str, markers: &[String]) -> Result<Answer, SessionError> {
    if let Some(result) = completion(answer, markers) {
        return Ok(Answer::Complete(result));
    }
    extract_call(answer).map(Answer::Call)
}

/// Return the result text if `answer` signals completion.
///
/// Completion is any configured marker substring (case-sensitive), or an
/// embedded object whose `status` is `"completed"`.
pub fn completion(answer: &str, markers: &[String]) -> Option<String> {
    let object = extract_object(answer).ok();
    let status_completed = object
        .as_ref()
        .and_then(|o| o.get("status"))
        .and_then(Value::as_str)
        .is_some_and(|s| s.eq_ignore_ascii_case("completed"));
    let marked = markers
        .iter()
        .any(|m| !m.is_empty() && answer.contains(m.as_str()));

    if !(status_completed || marked) {
        return None;
    }

    let message = object
        .as_ref()
        .filter(|_| status_completed)
        .and_then(|o| o.get("message"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(String::from);

    Some(message.unwrap_or_else(|| DEFAULT_RESULT.to_string()))
}

/// Extract the single call embedded in `answer`.
///
/// The oracle's `id` is ignored; the controller assigns a fresh one.
/// `params` defaults to an empty object when absent.
pub fn extract_call(answer: &str) -> Result<ToolCall, SessionError> {
    let mut object = extract_object(answer)?;

    let method = match object.remove("method") {
        Some(Value::String(m)) if !m.trim().is_empty() => m,
        _ => return Err(parse_error(answer)),
    };

    let params = match object.remove("params") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(params @ Value::Object(_)) => params,
        // JSON-RPC also allows positional params.
        Some(params @ Value::Array(_)) => params,
        Some(_) => return Err(parse_error(answer)),
    };

    Ok(ToolCall { method, params })
}

fn extract_object(answer: &str) -> Result<Map<String, Value>, SessionError> {
    let trimmed = answer.trim();
    let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) else {
        return Err(parse_error(answer));
    };
    if end < start {
        return Err(parse_error(answer));
    }

    match serde_json::from_str::<Value>(&trimmed[start..=end]) {
        Ok(Value::Object(object)) => Ok(object),
        _ => Err(parse_error(answer)),
    }
}

fn parse_error(answer: &str) -> SessionError {
    SessionError::OracleParse {
        answer: answer.to_string(),
    }
}
