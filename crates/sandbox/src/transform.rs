//! Interactive-mode rewrite: the last top-level bare expression prints its value.
//!
//! The user source is embedded base64-encoded in a small Python driver, so no
//! quoting or escaping of user content is ever needed. The driver parses the
//! source, runs every statement but the last in `exec` mode, and runs the last
//! one in `single` mode when it is a bare expression. Only that one statement
//! is affected; expressions nested in a trailing block are not printed.
//!
//! User code runs in a fresh module installed as `sys.modules["__main__"]`
//! with `__file__` pointing at the entrypoint, so pickling of user-defined
//! classes and `__file__` lookups behave as they would for the raw source.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::layout::entrypoint_path;

const SOURCE_PLACEHOLDER: &str = "@SOURCE_B64@";
const FILE_PLACEHOLDER: &str = "@ENTRYPOINT@";

const DRIVER: &str = r#"import ast as _ast
import base64 as _base64
import linecache as _linecache
import sys as _sys
import traceback as _traceback
import types as _types

_src = _base64.b64decode("@SOURCE_B64@").decode("utf-8")
_linecache.cache["<stdin>"] = (len(_src), None, _src.splitlines(True), "<stdin>")

_driver = _sys.modules["__main__"]
_main = _types.ModuleType("__main__")
_main.__file__ = "@ENTRYPOINT@"
_main.__builtins__ = __builtins__
_sys.modules["__main__"] = _main
_ns = _main.__dict__

try:
    _tree = _ast.parse(_src, "<stdin>")
except SyntaxError as _exc:
    _sys.stderr.write("".join(_traceback.format_exception_only(type(_exc), _exc)))
    _sys.exit(1)

try:
    if _tree.body:
        _head = _ast.Module(body=_tree.body[:-1], type_ignores=[])
        exec(compile(_head, "<stdin>", "exec"), _ns)
        _last = _tree.body[-1]
        if isinstance(_last, _ast.Expr):
            _tail = _ast.Interactive(body=[_last])
            _mode = "single"
        else:
            _tail = _ast.Module(body=[_last], type_ignores=[])
            _mode = "exec"
        exec(compile(_tail, "<stdin>", _mode), _ns)
except SystemExit:
    raise
except BaseException as _exc:
    _tb = _exc.__traceback__
    while _tb is not None and _tb.tb_frame.f_code.co_filename != "<stdin>":
        _tb = _tb.tb_next
    _traceback.print_exception(type(_exc), _exc, _tb)
    _sys.stderr.flush()
    _sys.exit(1)
"#;

/// Produce the code written to the entrypoint.
///
/// With `interactive` off the source is returned verbatim. Syntax errors are
/// not detected here: the driver reports them the same way the interpreter
/// would for the raw source.
pub fn transform(code: &str, interactive: bool) -> String {
    if !interactive {
        return code.to_owned();
    }
    DRIVER
        .replace(FILE_PLACEHOLDER, &entrypoint_path())
        .replace(SOURCE_PLACEHOLDER, &STANDARD.encode(code.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedded_source(driver: &str) -> String {
        let start = driver.find("b64decode(\"").unwrap() + "b64decode(\"".len();
        let end = start + driver[start..].find('"').unwrap();
        String::from_utf8(STANDARD.decode(&driver[start..end]).unwrap()).unwrap()
    }

    #[test]
    fn non_interactive_is_verbatim() {
        let code = "print('Hello, World!')\n2 + 2";
        assert_eq!(transform(code, false), code);
    }

    #[test]
    fn interactive_embeds_source_losslessly() {
        let code = "s = '''a \\ \"b\" '''\nprint(s)\n2 + 2\n";
        let driver = transform(code, true);
        assert_eq!(embedded_source(&driver), code);
        assert!(!driver.contains(SOURCE_PLACEHOLDER));
    }

    #[test]
    fn user_text_never_appears_raw() {
        let code = "__import__('os').system('id')";
        let driver = transform(code, true);
        assert!(!driver.contains(code));
    }

    #[test]
    fn only_last_statement_uses_single_mode() {
        let driver = transform("1\n2", true);
        assert_eq!(driver.matches("\"single\"").count(), 1);
        assert!(driver.contains("_tree.body[:-1]"));
        assert!(driver.contains("_tree.body[-1]"));
    }

    #[test]
    fn empty_source_still_produces_driver() {
        let driver = transform("", true);
        assert_eq!(embedded_source(&driver), "");
        assert!(driver.contains("if _tree.body:"));
    }

    #[test]
    fn non_ascii_source_round_trips() {
        let code = "print('héllo ✓')";
        assert_eq!(embedded_source(&transform(code, true)), code);
    }

    #[test]
    fn entrypoint_path_is_substituted() {
        let driver = transform("1", true);
        assert!(driver.contains("_main.__file__ = \"/workspace/__main__.py\""));
        assert!(!driver.contains(FILE_PLACEHOLDER));
    }

    /// Run the driver for `code` under a local `python3`, or `None` when no
    /// interpreter is installed.
    fn run_driver(code: &str) -> Option<std::process::Output> {
        match std::process::Command::new("python3")
            .arg("-c")
            .arg(transform(code, true))
            .output()
        {
            Ok(output) => Some(output),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                eprintln!("python3 not installed, driver not executed");
                None
            }
            Err(e) => panic!("spawn python3: {e}"),
        }
    }

    fn stdout_of(code: &str) -> Option<String> {
        let output = run_driver(code)?;
        assert!(
            output.status.success(),
            "driver failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        Some(String::from_utf8(output.stdout).unwrap())
    }

    #[test]
    fn last_expression_value_is_printed() {
        let Some(stdout) = stdout_of("print('Hello, World!')\n2 + 2") else {
            return;
        };
        assert_eq!(stdout, "Hello, World!\n4\n");
    }

    #[test]
    fn earlier_expressions_are_silent() {
        let Some(stdout) = stdout_of("1\n2") else {
            return;
        };
        assert_eq!(stdout, "2\n");
    }

    #[test]
    fn expressions_nested_in_trailing_block_are_silent() {
        let Some(stdout) = stdout_of("for i in range(3):\n    i\n") else {
            return;
        };
        assert_eq!(stdout, "");
    }

    #[test]
    fn none_result_prints_nothing() {
        let Some(stdout) = stdout_of("x = [1]\nx.append(2)") else {
            return;
        };
        assert_eq!(stdout, "");
    }

    #[test]
    fn user_classes_pickle_through_main() {
        let code = "import pickle\nclass P:\n    pass\nlen(pickle.dumps(P())) > 0";
        let Some(stdout) = stdout_of(code) else {
            return;
        };
        assert_eq!(stdout, "True\n");
    }

    #[test]
    fn dunder_file_names_the_entrypoint() {
        let Some(stdout) = stdout_of("import os\nos.path.basename(__file__)") else {
            return;
        };
        assert_eq!(stdout, "'__main__.py'\n");
    }

    #[test]
    fn main_guard_runs() {
        let Some(stdout) = stdout_of("if __name__ == '__main__':\n    print('main')") else {
            return;
        };
        assert_eq!(stdout, "main\n");
    }

    #[test]
    fn driver_names_do_not_leak_into_user_namespace() {
        let Some(stdout) = stdout_of("'_tree' in globals() or '_sys' in globals()") else {
            return;
        };
        assert_eq!(stdout, "False\n");
    }

    #[test]
    fn syntax_error_reported_like_the_interpreter() {
        let Some(output) = run_driver("def broken(:\n    pass") else {
            return;
        };
        assert_eq!(output.status.code(), Some(1));
        let stderr = String::from_utf8(output.stderr).unwrap();
        assert!(stderr.contains("SyntaxError"), "{stderr}");
        assert!(!stderr.contains("Traceback"), "{stderr}");
    }

    #[test]
    fn runtime_traceback_hides_driver_frames() {
        let Some(output) = run_driver("x = 1\n1 / 0") else {
            return;
        };
        assert_eq!(output.status.code(), Some(1));
        let stderr = String::from_utf8(output.stderr).unwrap();
        assert!(stderr.contains("ZeroDivisionError"), "{stderr}");
        assert!(stderr.contains("File \"<stdin>\", line 2"), "{stderr}");
        assert_eq!(stderr.matches("File ").count(), 1, "{stderr}");
        assert!(!stderr.contains("_tree"), "{stderr}");
    }
}
