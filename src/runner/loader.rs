//! Loading submitted code and calling its entry point

use pyo3::exceptions::PyMemoryError;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyTuple};

use crate::codec::{self, RunnerFailure, Value};
use crate::runner::convert;
use crate::runner::ENTRYPOINT;

/// Longest exception message forwarded to the caller
const MAX_MESSAGE_CHARS: usize = 512;

/// The entry point returned normally
#[derive(Debug, Clone, PartialEq)]
pub struct Completed {
    pub result: Option<Value>,
    pub result_omitted: bool,
}

/// Why the entry point did not return
#[derive(Debug, Clone, PartialEq)]
pub enum Failure {
    /// `run` is missing, ambiguous, or not a plain callable
    Definition(String),
    /// An exception escaped while loading or calling the code
    Raised {
        failure: RunnerFailure,
        memory_exhausted: bool,
    },
}

/// Load `code` into a fresh namespace, call `run(*arguments)` and print
/// what it returns. Python's own stdout and stderr are flushed before this
/// returns, whatever the outcome.
pub fn invoke(
    py: Python<'_>,
    code: &str,
    arguments: &[Value],
    result_limit: usize,
) -> Result<Completed, Failure> {
    let outcome = call_entrypoint(py, code, arguments, result_limit);
    flush_streams(py);
    outcome
}

fn call_entrypoint(
    py: Python<'_>,
    code: &str,
    arguments: &[Value],
    result_limit: usize,
) -> Result<Completed, Failure> {
    let scan = scan_bindings(py, code).map_err(|e| raised(py, &e))?;
    if scan.bindings > 1 {
        return Err(Failure::Definition(format!(
            "`{}` is bound {} times at module level",
            ENTRYPOINT, scan.bindings
        )));
    }
    if scan.coroutine {
        return Err(Failure::Definition(format!(
            "`{}` must be a plain function, not a coroutine function",
            ENTRYPOINT
        )));
    }

    let globals = fresh_namespace(py).map_err(|e| raised(py, &e))?;
    py.run(code, Some(globals), None)
        .map_err(|e| raised(py, &e))?;

    let entrypoint = find_entrypoint(py, globals)?;

    let arguments = arguments
        .iter()
        .map(|argument| convert::to_python(py, argument))
        .collect::<PyResult<Vec<_>>>()
        .map_err(|e| raised(py, &e))?;

    let returned = entrypoint
        .call1(PyTuple::new(py, arguments))
        .map_err(|e| raised(py, &e))?;

    py.import("builtins")
        .and_then(|builtins| builtins.getattr("print"))
        .and_then(|print| print.call1((returned,)))
        .map_err(|e| raised(py, &e))?;

    let (result, result_omitted) = structured(returned, result_limit);
    Ok(Completed {
        result,
        result_omitted,
    })
}

#[derive(Debug, Default)]
struct BindingScan {
    bindings: usize,
    coroutine: bool,
}

/// Count module-level bindings of the entry point name without executing anything
fn scan_bindings(py: Python<'_>, code: &str) -> PyResult<BindingScan> {
    let ast = py.import("ast")?;
    let tree = ast.call_method1("parse", (code,))?;

    let function_def = ast.getattr("FunctionDef")?;
    let async_function_def = ast.getattr("AsyncFunctionDef")?;
    let class_def = ast.getattr("ClassDef")?;
    let assign = ast.getattr("Assign")?;
    let name = ast.getattr("Name")?;

    let mut scan = BindingScan::default();
    for node in tree.getattr("body")?.iter()? {
        let node = node?;

        let is_async = node.is_instance(async_function_def)?;
        if is_async || node.is_instance(function_def)? || node.is_instance(class_def)? {
            if node.getattr("name")?.extract::<&str>()? == ENTRYPOINT {
                scan.bindings += 1;
                scan.coroutine |= is_async;
            }
        } else if node.is_instance(assign)? {
            for target in node.getattr("targets")?.iter()? {
                let target = target?;
                if target.is_instance(name)? && target.getattr("id")?.extract::<&str>()? == ENTRYPOINT
                {
                    scan.bindings += 1;
                }
            }
        }
    }

    Ok(scan)
}

fn fresh_namespace(py: Python<'_>) -> PyResult<&PyDict> {
    let globals = PyDict::new(py);
    globals.set_item("__builtins__", py.import("builtins")?)?;
    globals.set_item("__name__", "__main__")?;
    Ok(globals)
}

fn find_entrypoint<'py>(py: Python<'py>, globals: &'py PyDict) -> Result<&'py PyAny, Failure> {
    let entrypoint = globals
        .get_item(ENTRYPOINT)
        .map_err(|e| raised(py, &e))?
        .ok_or_else(|| {
            Failure::Definition(format!("no callable named `{}` is defined", ENTRYPOINT))
        })?;

    if !entrypoint.is_callable() {
        return Err(Failure::Definition(format!(
            "`{}` is bound to a `{}`, not a callable",
            ENTRYPOINT,
            convert::type_name(entrypoint)
        )));
    }

    Ok(entrypoint)
}

/// Structured copy of the return value, when it fits the codec and the cap.
///
/// The cap is enforced while converting, so a huge return value is never
/// copied out of the interpreter just to be measured.
fn structured(returned: &PyAny, limit: usize) -> (Option<Value>, bool) {
    match convert::from_python_within(returned, limit) {
        Ok(Some(value)) => match codec::encode(&value) {
            Ok(bytes) if bytes.len() <= limit => (Some(value), false),
            Ok(_) => (None, true),
            Err(_) => (None, false),
        },
        Ok(None) => (None, true),
        Err(_) => (None, false),
    }
}

fn raised(py: Python<'_>, err: &PyErr) -> Failure {
    Failure::Raised {
        failure: describe(py, err),
        memory_exhausted: err.is_instance_of::<PyMemoryError>(py),
    }
}

/// Exception class name and the first line of its message; never a traceback
pub fn describe(py: Python<'_>, err: &PyErr) -> RunnerFailure {
    let exception = err
        .get_type(py)
        .name()
        .map(str::to_owned)
        .unwrap_or_else(|_| "Exception".to_string());

    let message = err
        .value(py)
        .str()
        .map(|text| text.to_string_lossy().into_owned())
        .unwrap_or_default();

    RunnerFailure {
        exception,
        message: first_line(&message),
    }
}

fn first_line(message: &str) -> String {
    message
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .chars()
        .take(MAX_MESSAGE_CHARS)
        .collect()
}

fn flush_streams(py: Python<'_>) {
    if let Ok(sys) = py.import("sys") {
        for name in ["stdout", "stderr"] {
            if let Ok(stream) = sys.getattr(name) {
                let _ = stream.call_method0("flush");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(code: &str, arguments: &[Value]) -> Result<Completed, Failure> {
        Python::with_gil(|py| invoke(py, code, arguments, usize::MAX))
    }

    fn definition_message(outcome: Result<Completed, Failure>) -> String {
        match outcome {
            Err(Failure::Definition(message)) => message,
            other => panic!("expected a definition error, got {:?}", other),
        }
    }

    fn raised_failure(outcome: Result<Completed, Failure>) -> (RunnerFailure, bool) {
        match outcome {
            Err(Failure::Raised {
                failure,
                memory_exhausted,
            }) => (failure, memory_exhausted),
            other => panic!("expected an exception, got {:?}", other),
        }
    }

    #[test]
    fn test_returns_structured_result() {
        let completed = run(
            "def run(user): return user['first_name'] + ' ' + user['last_name']",
            &[json!({"first_name": "Ivan", "last_name": "Petrov"})],
        )
        .unwrap();
        assert_eq!(completed.result, Some(json!("Ivan Petrov")));
        assert!(!completed.result_omitted);
    }

    #[test]
    fn test_positional_arguments() {
        let completed = run("def run(a, b): return [b, a]", &[json!(1), json!("two")]).unwrap();
        assert_eq!(completed.result, Some(json!(["two", 1])));
    }

    #[test]
    fn test_missing_entrypoint() {
        let message = definition_message(run("def main(x): return x", &[json!({})]));
        assert!(message.contains("no callable named `run`"));
    }

    #[test]
    fn test_ambiguous_entrypoint() {
        let code = "def run(x):\n    return 1\n\ndef run(x):\n    return 2\n";
        let message = definition_message(run(code, &[json!({})]));
        assert!(message.contains("bound 2 times"));
    }

    #[test]
    fn test_coroutine_entrypoint() {
        let message = definition_message(run("async def run(x):\n    return x\n", &[json!({})]));
        assert!(message.contains("coroutine"));
    }

    #[test]
    fn test_non_callable_entrypoint() {
        let message = definition_message(run("run = 42", &[json!({})]));
        assert!(message.contains("not a callable"));
    }

    #[test]
    fn test_exception_is_summarised() {
        let (failure, memory) = raised_failure(run("def run(x): return 1/0", &[json!({})]));
        assert_eq!(failure.exception, "ZeroDivisionError");
        assert_eq!(failure.message, "division by zero");
        assert!(!memory);
    }

    #[test]
    fn test_syntax_error_is_a_user_fault() {
        let (failure, _) = raised_failure(run("def run(x) return x", &[json!({})]));
        assert_eq!(failure.exception, "SyntaxError");
    }

    #[test]
    fn test_memory_error_is_flagged() {
        let (failure, memory) = raised_failure(run("def run(x): raise MemoryError()", &[json!({})]));
        assert_eq!(failure.exception, "MemoryError");
        assert!(memory);
    }

    #[test]
    fn test_multiline_message_keeps_first_line() {
        let code = "def run(x): raise ValueError('first\\nsecond')";
        let (failure, _) = raised_failure(run(code, &[json!({})]));
        assert_eq!(failure.message, "first");
    }

    #[test]
    fn test_unencodable_result_is_dropped() {
        let completed = run("def run(x): return {1: 'one'}", &[json!({})]).unwrap();
        assert!(completed.result.is_none());
        assert!(!completed.result_omitted);
    }

    #[test]
    fn test_oversized_result_is_omitted() {
        let completed = Python::with_gil(|py| {
            invoke(py, "def run(x): return 'x' * 1000", &[json!({})], 100)
        })
        .unwrap();
        assert!(completed.result.is_none());
        assert!(completed.result_omitted);
    }

    #[test]
    fn test_large_collection_is_omitted() {
        let completed = Python::with_gil(|py| {
            invoke(py, "def run(x): return list(range(10_000))", &[json!({})], 1024)
        })
        .unwrap();
        assert!(completed.result.is_none());
        assert!(completed.result_omitted);
    }

    #[test]
    fn test_each_invocation_gets_a_fresh_namespace() {
        run("counter = 1\ndef run(x): return counter", &[json!({})]).unwrap();
        let (failure, _) = raised_failure(run("def run(x): return counter", &[json!({})]));
        assert_eq!(failure.exception, "NameError");
    }

    #[test]
    fn test_first_line() {
        assert_eq!(first_line("\n  boom  \nmore"), "boom");
        assert_eq!(first_line(""), "");
        assert_eq!(first_line(&"y".repeat(2000)).len(), MAX_MESSAGE_CHARS);
    }
}
