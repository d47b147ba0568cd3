//! Wrapping of user code for the sandboxed runtime, and the stdout marker
//! protocol the wrapper speaks back to us.
//!
//! Layout of a wrapped file: the user's import statements hoisted first, then
//! the bridge preamble (request context, helper global, progress reporter),
//! then the remaining user body, then a trailer that resolves the exported
//! entrypoint and prints the final `__RESULT__::` marker.

use serde::Deserialize;
use serde_json::Value;

use super::job::Progress;

/// Reserved stdout prefix for progress updates.
pub const PROGRESS_PREFIX: &str = "__PROGRESS__::";
/// Reserved stdout prefix for the final result (last one wins).
pub const RESULT_PREFIX: &str = "__RESULT__::";

/// One classified line of subprocess stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputLine {
    Progress(Progress),
    /// Raw JSON text after the result marker.
    Result(String),
    Log(String),
}

/// Classify a stdout line according to the marker protocol. A marker line
/// whose JSON does not parse is demoted to a plain log line rather than
/// dropped.
pub fn classify_line(line: &str) -> OutputLine {
    if let Some(rest) = line.strip_prefix(PROGRESS_PREFIX) {
        match serde_json::from_str::<Progress>(rest) {
            Ok(progress) => OutputLine::Progress(progress.clamped()),
            Err(_) => OutputLine::Log(line.to_string()),
        }
    } else if let Some(rest) = line.strip_prefix(RESULT_PREFIX) {
        OutputLine::Result(rest.to_string())
    } else {
        OutputLine::Log(line.to_string())
    }
}

/// The shape of a `__RESULT__::` payload.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RawResult {
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub stack: Option<String>,
}

/// Outcome of result parsing, before exit-status handling.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResult {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Resolve the final result from what the subprocess printed.
///
/// Preference order: the last `__RESULT__::` line; then the whole non-marker
/// stdout parsed as the same `{success, ...}` shape; then the tolerant
/// fallbacks (empty stdout is success, plain text becomes `{output}`, an
/// error-looking stderr without a marker is a failure). `strict` replaces the
/// fallbacks with a protocol error.
pub fn parse_result(
    result_line: Option<&str>,
    stdout: &str,
    stderr: &str,
    strict: bool,
) -> ParsedResult {
    if let Some(raw) = result_line {
        if let Ok(parsed) = serde_json::from_str::<RawResult>(raw) {
            return ParsedResult {
                success: parsed.success,
                result: parsed.result,
                error: parsed.error,
            };
        }
    }

    if strict {
        return ParsedResult {
            success: false,
            result: None,
            error: Some("no valid result marker in output".to_string()),
        };
    }

    let stdout = stdout.trim();

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(stdout) {
        if let Some(Value::Bool(success)) = map.get("success") {
            return ParsedResult {
                success: *success,
                result: map.get("result").cloned(),
                error: map
                    .get("error")
                    .and_then(|e| e.as_str())
                    .map(|e| e.to_string()),
            };
        }
    }

    if stderr.contains("error") || stderr.contains("Error") {
        return ParsedResult {
            success: false,
            result: None,
            error: Some(stderr.trim().to_string()),
        };
    }

    if stdout.is_empty() {
        return ParsedResult {
            success: true,
            result: None,
            error: None,
        };
    }

    ParsedResult {
        success: true,
        result: Some(serde_json::json!({ "output": stdout })),
        error: None,
    }
}

/// Wrap user code into a self-contained script for the runtime.
///
/// `request` is the serialised execution request the helper global exposes
/// through `getJobPayload()`/`getJobContext()`.
pub fn wrap_code(code: &str, request: &Value) -> String {
    let (imports, body) = split_imports(code);
    let body = rewrite_exports(&body);
    let request_json = request.to_string();

    let mut wrapped = String::with_capacity(code.len() + 2048);
    wrapped.push_str(&imports);
    wrapped.push_str(&format!(
        r#"
const __jobRequest = {request_json};
const __fluxbase = {{
  reportProgress(percent, message, data) {{
    const update = {{ percent }};
    if (message !== undefined) update.message = message;
    if (data !== undefined) update.data = data;
    console.log("{PROGRESS_PREFIX}" + JSON.stringify(update));
  }},
  getJobPayload() {{
    return __jobRequest.payload;
  }},
  getJobContext() {{
    return {{
      jobId: __jobRequest.job_id,
      jobName: __jobRequest.job_name,
      namespace: __jobRequest.namespace,
      retryCount: __jobRequest.retry_count,
      createdBy: __jobRequest.created_by,
      userRole: __jobRequest.user_role,
      userEmail: __jobRequest.user_email,
    }};
  }},
  checkCancellation() {{
    return (globalThis.Deno?.env.get("CANCELLED") ?? "false") === "true";
  }},
}};
globalThis.fluxbase = __fluxbase;
"#
    ));
    wrapped.push_str(&body);
    wrapped.push_str(&format!(
        r#"
await (async () => {{
  let __fn;
  if (typeof handler === "function") __fn = handler;
  else if (typeof __default === "function") __fn = __default;
  else if (typeof main === "function") __fn = main;
  if (!__fn) {{
    console.log("{RESULT_PREFIX}" + JSON.stringify({{
      success: false,
      error: "function must export one of: handler, default, main",
    }}));
    globalThis.Deno?.exit(1);
    return;
  }}
  try {{
    let __result = await __fn(__jobRequest.payload, __fluxbase.getJobContext());
    if (__result && typeof __result === "object" && "status" in __result && "body" in __result) {{
      __result = typeof __result.body === "string" ? JSON.parse(__result.body) : __result.body;
    }}
    console.log("{RESULT_PREFIX}" + JSON.stringify({{
      success: true,
      result: __result === undefined ? null : __result,
    }}));
  }} catch (err) {{
    console.log("{RESULT_PREFIX}" + JSON.stringify({{
      success: false,
      error: String(err && err.message ? err.message : err),
      stack: err && err.stack ? String(err.stack) : undefined,
    }}));
    globalThis.Deno?.exit(1);
  }}
}})();
"#
    ));

    wrapped
}

/// Hoist import statements out of the user code so they can sit above the
/// bridge preamble (imports must stay at module top level).
fn split_imports(code: &str) -> (String, String) {
    let mut imports = String::new();
    let mut body = String::new();
    let mut in_import = false;

    for line in code.lines() {
        let trimmed = line.trim_start();
        if in_import {
            imports.push_str(line);
            imports.push('\n');
            in_import = !import_terminated(trimmed);
        } else if trimmed.starts_with("import ")
            || trimmed.starts_with("import\"")
            || trimmed.starts_with("import'")
        {
            imports.push_str(line);
            imports.push('\n');
            in_import = !import_terminated(trimmed);
        } else {
            body.push_str(line);
            body.push('\n');
        }
    }

    (imports, body)
}

// A multi-line import ends on the line that carries the module specifier
// (a quote) or an explicit semicolon.
fn import_terminated(line: &str) -> bool {
    line.contains('"') || line.contains('\'') || line.trim_end().ends_with(';')
}

/// Turn export declarations into plain bindings the trailer can reach.
/// `export default` has no binding of its own, so it is renamed.
fn rewrite_exports(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    for line in body.lines() {
        let indent_len = line.len() - line.trim_start().len();
        let (indent, rest) = line.split_at(indent_len);
        if let Some(decl) = rest.strip_prefix("export default ") {
            out.push_str(indent);
            out.push_str("const __default = ");
            out.push_str(decl);
        } else if let Some(decl) = rest.strip_prefix("export ") {
            out.push_str(indent);
            out.push_str(decl);
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_progress_line() {
        let line = r#"__PROGRESS__::{"percent":25,"message":"stage A"}"#;
        match classify_line(line) {
            OutputLine::Progress(p) => {
                assert_eq!(p.percent, 25.0);
                assert_eq!(p.message.as_deref(), Some("stage A"));
            }
            other => panic!("expected progress, got {other:?}"),
        }
    }

    #[test]
    fn classify_result_line() {
        let line = r#"__RESULT__::{"success":true,"result":{"sum":6}}"#;
        assert_eq!(
            classify_line(line),
            OutputLine::Result(r#"{"success":true,"result":{"sum":6}}"#.to_string())
        );
    }

    #[test]
    fn malformed_progress_marker_becomes_log() {
        let line = "__PROGRESS__::not json";
        assert_eq!(classify_line(line), OutputLine::Log(line.to_string()));
    }

    #[test]
    fn plain_line_is_log() {
        assert_eq!(
            classify_line("hello world"),
            OutputLine::Log("hello world".to_string())
        );
    }

    #[test]
    fn result_marker_wins() {
        let parsed = parse_result(
            Some(r#"{"success":true,"result":{"sum":6}}"#),
            "ignored",
            "",
            false,
        );
        assert!(parsed.success);
        assert_eq!(parsed.result, Some(json!({"sum": 6})));
    }

    #[test]
    fn whole_stdout_with_result_shape_is_used() {
        let parsed = parse_result(None, r#"{"success":false,"error":"boom"}"#, "", false);
        assert!(!parsed.success);
        assert_eq!(parsed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn empty_stdout_is_success_with_nil_result() {
        let parsed = parse_result(None, "", "", false);
        assert!(parsed.success);
        assert!(parsed.result.is_none());
    }

    #[test]
    fn plain_text_stdout_becomes_output_object() {
        let parsed = parse_result(None, "did the thing\n", "", false);
        assert!(parsed.success);
        assert_eq!(parsed.result, Some(json!({"output": "did the thing"})));
    }

    #[test]
    fn error_looking_stderr_without_marker_fails() {
        let parsed = parse_result(None, "", "TypeError: x is not a function", false);
        assert!(!parsed.success);
        assert!(parsed.error.unwrap().contains("TypeError"));
    }

    #[test]
    fn strict_mode_rejects_missing_marker() {
        let parsed = parse_result(None, "plain text", "", true);
        assert!(!parsed.success);
        assert!(parsed.error.unwrap().contains("result marker"));
    }

    #[test]
    fn imports_are_hoisted_above_the_preamble() {
        let code = "import { x } from \"./x.ts\";\nexport function handler() { return x; }\n";
        let wrapped = wrap_code(code, &json!({"payload": null}));

        let import_pos = wrapped.find("import { x }").unwrap();
        let preamble_pos = wrapped.find("const __jobRequest").unwrap();
        assert!(import_pos < preamble_pos);
    }

    #[test]
    fn multi_line_import_is_hoisted_whole() {
        let code = "import {\n  a,\n  b,\n} from \"./mod.ts\";\nconst handler = () => a + b;\n";
        let wrapped = wrap_code(code, &json!({}));

        let preamble_pos = wrapped.find("const __jobRequest").unwrap();
        let from_pos = wrapped.find("} from \"./mod.ts\";").unwrap();
        assert!(from_pos < preamble_pos);
        // The body line must stay below the preamble.
        assert!(wrapped.find("const handler").unwrap() > preamble_pos);
    }

    #[test]
    fn export_default_is_rewritten_to_a_binding() {
        let code = "export default async function (payload) { return payload; }\n";
        let wrapped = wrap_code(code, &json!({}));
        assert!(wrapped.contains("const __default = async function"));
        assert!(!wrapped.contains("export default"));
    }

    #[test]
    fn export_prefix_is_stripped_from_named_declarations() {
        let code = "export function handler() { return 1; }\n";
        let wrapped = wrap_code(code, &json!({}));
        assert!(wrapped.contains("function handler()"));
        assert!(!wrapped.contains("export function"));
    }

    #[test]
    fn trailer_tries_handler_then_default_then_main() {
        let wrapped = wrap_code("function main() {}\n", &json!({}));
        let handler_pos = wrapped.find("typeof handler === \"function\"").unwrap();
        let default_pos = wrapped.find("typeof __default === \"function\"").unwrap();
        let main_pos = wrapped.find("typeof main === \"function\"").unwrap();
        assert!(handler_pos < default_pos && default_pos < main_pos);
    }
}
