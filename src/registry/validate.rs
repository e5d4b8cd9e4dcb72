//! Upload-time static validation of script source
//!
//! The engine hosts scripts written in Python but does not embed an
//! interpreter, so upload-time validation is a conservative line/token
//! scan: it rejects every construct the sandbox would refuse anyway
//! (non-whitelisted imports, relative imports, dynamic code loading,
//! dunder reflection) and requires the `generate_decisions` entry point.
//! The sandbox worker remains the authoritative enforcement layer at
//! execution time; this pass exists so a broken script fails at upload
//! rather than at tick time.

/// Modules scripts may import: pure computation only.
pub const ALLOWED_MODULES: &[&str] = &["math", "statistics", "random"];

/// Call-shaped primitives that load or introspect code dynamically.
const FORBIDDEN_CALLS: &[&str] = &[
    "eval(",
    "exec(",
    "compile(",
    "__import__",
    "open(",
    "globals(",
    "locals(",
    "vars(",
    "input(",
    "breakpoint(",
];

/// Validate script source. Returns the first violation found.
pub fn validate_source(code: &str) -> Result<(), String> {
    if code.trim().is_empty() {
        return Err("script is empty".to_string());
    }

    let mut has_entry = false;
    for (line_no, raw_line) in code.lines().enumerate() {
        let line = strip_comment(raw_line);
        let trimmed = line.trim_start();

        if let Some(signature) = trimmed.strip_prefix("def generate_decisions") {
            // entry symbol must be top-level and take a single argument
            if raw_line.starts_with("def generate_decisions") {
                validate_entry_signature(signature, line_no + 1)?;
                has_entry = true;
            }
        }

        if let Some(rest) = trimmed.strip_prefix("import ") {
            for name in rest.split(',') {
                let module = name.trim().split_whitespace().next().unwrap_or("");
                check_module(module, line_no + 1)?;
            }
        } else if let Some(rest) = trimmed.strip_prefix("from ") {
            let module = rest.split_whitespace().next().unwrap_or("");
            if module.starts_with('.') {
                return Err(format!("line {}: relative imports are forbidden", line_no + 1));
            }
            check_module(module, line_no + 1)?;
        }

        for call in FORBIDDEN_CALLS {
            if line.contains(call) {
                return Err(format!(
                    "line {}: forbidden construct '{}'",
                    line_no + 1,
                    call.trim_end_matches('(')
                ));
            }
        }

        // reflection into private attributes
        if line.contains(".__") {
            return Err(format!(
                "line {}: access to double-underscore attributes is forbidden",
                line_no + 1
            ));
        }
        if line.contains("getattr") {
            return Err(format!(
                "line {}: attribute reflection is forbidden",
                line_no + 1
            ));
        }
    }

    if !has_entry {
        return Err("script must define generate_decisions(context) at top level".to_string());
    }
    Ok(())
}

fn validate_entry_signature(signature: &str, line_no: usize) -> Result<(), String> {
    let open = signature.find('(');
    let close = signature.find(')');
    match (open, close) {
        (Some(open), Some(close)) if open < close => {
            let params = &signature[open + 1..close];
            let count = params
                .split(',')
                .filter(|p| !p.trim().is_empty())
                .count();
            if count != 1 {
                return Err(format!(
                    "line {line_no}: generate_decisions must take exactly one argument"
                ));
            }
            Ok(())
        }
        _ => Err(format!(
            "line {line_no}: malformed generate_decisions signature"
        )),
    }
}

fn check_module(module: &str, line_no: usize) -> Result<(), String> {
    let allowed = ALLOWED_MODULES
        .iter()
        .any(|m| module == *m || module.starts_with(&format!("{m}.")));
    if allowed {
        Ok(())
    } else {
        Err(format!("line {line_no}: import of '{module}' is forbidden"))
    }
}

/// Drop an unquoted `#` comment tail; good enough for a line scanner.
fn strip_comment(line: &str) -> &str {
    let mut in_single = false;
    let mut in_double = false;
    for (idx, ch) in line.char_indices() {
        match ch {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '#' if !in_single && !in_double => return &line[..idx],
            _ => {}
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = "import math\n\ndef generate_decisions(context):\n    return {}\n";

    #[test]
    fn test_valid_script_passes() {
        assert!(validate_source(VALID).is_ok());
    }

    #[test]
    fn test_missing_entry_point() {
        let err = validate_source("x = 1\n").unwrap_err();
        assert!(err.contains("generate_decisions"));
    }

    #[test]
    fn test_entry_point_arity() {
        let err =
            validate_source("def generate_decisions(a, b):\n    return {}\n").unwrap_err();
        assert!(err.contains("exactly one argument"));
    }

    #[test]
    fn test_forbidden_import() {
        let code = "import os\n\ndef generate_decisions(context):\n    return {}\n";
        let err = validate_source(code).unwrap_err();
        assert!(err.contains("'os'"));
    }

    #[test]
    fn test_relative_import() {
        let code = "from . import helper\n\ndef generate_decisions(context):\n    return {}\n";
        let err = validate_source(code).unwrap_err();
        assert!(err.contains("relative"));
    }

    #[test]
    fn test_dynamic_eval_rejected() {
        let code = "def generate_decisions(context):\n    return eval('{}')\n";
        assert!(validate_source(code).is_err());
    }

    #[test]
    fn test_dunder_reflection_rejected() {
        let code = "def generate_decisions(context):\n    return context.__class__\n";
        assert!(validate_source(code).is_err());
    }

    #[test]
    fn test_whitelisted_submodule_allowed() {
        let code = "import random\nimport statistics\n\ndef generate_decisions(context):\n    return {}\n";
        assert!(validate_source(code).is_ok());
    }

    #[test]
    fn test_comment_mentioning_eval_is_fine() {
        let code = "def generate_decisions(context):\n    # never eval( anything here\n    return {}\n";
        assert!(validate_source(code).is_ok());
    }
}
