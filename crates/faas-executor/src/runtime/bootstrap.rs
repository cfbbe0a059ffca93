//! Launcher executed inside the container for every invocation.
//!
//! The launcher reads `{"code": ..., "input": ...}` from stdin, runs the
//! function and prints its return value as JSON on a single marker line at
//! the end of stdout. Exceptions go to stderr with exit code 1.

use serde_json::Value;

pub const RETURN_MARKER: &str = "__FAAS_RETURN__:";

pub const LAUNCHER: &str = r#"
import inspect
import json
import sys
import traceback

MARKER = "__FAAS_RETURN__:"


def _resolve(code):
    scope = {"__name__": "__faas__"}
    try:
        compiled = compile(code, "<function>", "exec")
    except SyntaxError:
        compiled = None
    if compiled is not None:
        exec(compiled, scope)
        for name in ("handler", "main"):
            fn = scope.get(name)
            if callable(fn):
                return fn
        return lambda event: None
    body = "\n".join("    " + line for line in code.splitlines()) or "    pass"
    scope = {"__name__": "__faas__"}
    exec(compile("def __faas_body(event):\n" + body, "<function>", "exec"), scope)
    return scope["__faas_body"]


def _call(fn, event):
    try:
        params = inspect.signature(fn).parameters
    except (TypeError, ValueError):
        return fn(event)
    return fn(event) if len(params) > 0 else fn()


def _run():
    envelope = json.load(sys.stdin)
    event = envelope.get("input")
    try:
        result = _call(_resolve(envelope.get("code", "")), event)
    except Exception:
        traceback.print_exc()
        sys.stderr.flush()
        sys.exit(1)
    try:
        encoded = json.dumps(result)
    except (TypeError, ValueError):
        encoded = repr(result)
    sys.stdout.flush()
    sys.stdout.write("\n" + MARKER + encoded + "\n")
    sys.stdout.flush()


_run()
"#;

/// Stdin payload handed to the launcher.
pub fn envelope(code: &str, input: &Value) -> Vec<u8> {
    serde_json::json!({ "code": code, "input": input })
        .to_string()
        .into_bytes()
}

/// Stdout as the launcher would emit it for `value`. Used by in-process backends.
pub fn encode_return(value: &Value) -> String {
    format!("\n{RETURN_MARKER}{value}\n")
}

/// Split the launcher's return line off captured stdout.
///
/// Returns the user-visible stdout and the raw return payload, if the
/// marker line was found at the start of a line.
pub fn split_return(stdout: &str) -> (String, Option<String>) {
    let Some(pos) = stdout.rfind(RETURN_MARKER) else {
        return (stdout.to_string(), None);
    };
    if pos > 0 && !stdout[..pos].ends_with('\n') {
        return (stdout.to_string(), None);
    }

    let rest = &stdout[pos + RETURN_MARKER.len()..];
    let (raw, tail) = match rest.find('\n') {
        Some(i) => (&rest[..i], &rest[i + 1..]),
        None => (rest, ""),
    };

    let mut visible = stdout[..pos].to_string();
    // Separator newline written by the launcher.
    if visible.ends_with('\n') {
        visible.pop();
    }
    visible.push_str(tail);
    (visible, Some(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_return_strips_marker_line() {
        let stdout = format!("hello\n{}", encode_return(&json!({"ok": true})));
        let (visible, raw) = split_return(&stdout);
        assert_eq!(visible, "hello\n");
        assert_eq!(raw.as_deref(), Some(r#"{"ok":true}"#));
    }

    #[test]
    fn test_split_return_without_output() {
        let (visible, raw) = split_return(&encode_return(&json!(2)));
        assert_eq!(visible, "");
        assert_eq!(raw.as_deref(), Some("2"));
    }

    #[test]
    fn test_marker_mid_line_is_ignored() {
        let stdout = format!("print {RETURN_MARKER}5");
        let (visible, raw) = split_return(&stdout);
        assert_eq!(visible, stdout);
        assert!(raw.is_none());
    }

    #[test]
    fn test_envelope_shape() {
        let bytes = envelope("return 1+1", &json!({}));
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["code"], "return 1+1");
        assert_eq!(parsed["input"], json!({}));
    }
}
