//! Installing modules the submitted code imports but the interpreter lacks
//!
//! Imports are read from the syntax tree only; the code itself is never
//! executed in the supervisor.

use std::collections::BTreeSet;
use std::process::Command;

use log::{error, info, warn};
use pyo3::prelude::*;

use crate::errors::{Result, SandboxError};

const PIP_PROGRAM: &str = "pip";

/// Top-level module names imported anywhere in `code`, sorted and deduplicated.
///
/// Relative imports are skipped. Code that does not parse yields no modules;
/// the runner reports the syntax error itself.
pub fn extract_imports(code: &str) -> Result<Vec<String>> {
    Python::with_gil(|py| {
        let ast = py.import("ast")?;
        let tree = match ast.call_method1("parse", (code,)) {
            Ok(tree) => tree,
            Err(e) => {
                warn!("Failed to extract imports: {}", e);
                return Ok(Vec::new());
            }
        };

        let import = ast.getattr("Import")?;
        let import_from = ast.getattr("ImportFrom")?;

        let mut modules = BTreeSet::new();
        for node in ast.call_method1("walk", (tree,))?.iter()? {
            let node = node?;
            if node.is_instance(import)? {
                for alias in node.getattr("names")?.iter()? {
                    let name: String = alias?.getattr("name")?.extract()?;
                    modules.insert(top_level(&name));
                }
            } else if node.is_instance(import_from)? {
                let level: usize = node.getattr("level")?.extract()?;
                let module: Option<String> = node.getattr("module")?.extract()?;
                if let (0, Some(name)) = (level, module) {
                    modules.insert(top_level(&name));
                }
            }
        }

        let modules: Vec<String> = modules.into_iter().collect();
        info!("Extracted imports: {:?}", modules);
        Ok(modules)
    })
}

/// Subset of `modules` the embedded interpreter cannot locate
pub fn missing_modules(modules: &[String]) -> Result<Vec<String>> {
    Python::with_gil(|py| {
        let util = py.import("importlib.util")?;
        let mut missing = Vec::new();
        for name in modules {
            if util.call_method1("find_spec", (name.as_str(),))?.is_none() {
                missing.push(name.clone());
            }
        }
        Ok(missing)
    })
}

/// Install `modules` with pip
pub fn install(modules: &[String]) -> Result<()> {
    if modules.is_empty() {
        return Ok(());
    }

    info!("Installing missing modules: {:?}", modules);
    let output = Command::new(PIP_PROGRAM)
        .args(["install", "--no-cache-dir"])
        .args(modules)
        .output()
        .map_err(|e| {
            error!("Subprocess error during pip install: {}", e);
            SandboxError::Dependency(format!("failed to run {}: {}", PIP_PROGRAM, e))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        error!("Pip install error: {}", stderr);
        return Err(SandboxError::Dependency(format!(
            "Failed to install modules: {}",
            stderr
        )));
    }

    Ok(())
}

/// Make sure every module imported by `code` can be found before it runs
pub fn ensure_installed(code: &str) -> Result<()> {
    let modules = extract_imports(code)?;
    let missing = missing_modules(&modules)?;
    install(&missing)
}

fn top_level(name: &str) -> String {
    name.split('.').next().unwrap_or(name).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_imports() {
        let code = "import os, json as j\nfrom collections.abc import Mapping\nfrom . import sibling\nimport xml.dom.minidom\n\ndef run(x):\n    import math\n    return x\n";
        let modules = extract_imports(code).unwrap();
        assert_eq!(modules, vec!["collections", "json", "math", "os", "xml"]);
    }

    #[test]
    fn test_extract_imports_from_invalid_code() {
        assert!(extract_imports("def run(x) return x").unwrap().is_empty());
    }

    #[test]
    fn test_missing_modules() {
        let modules = vec![
            "json".to_string(),
            "definitely_not_a_real_module_4f2a".to_string(),
        ];
        assert_eq!(
            missing_modules(&modules).unwrap(),
            vec!["definitely_not_a_real_module_4f2a"]
        );
    }

    #[test]
    fn test_stdlib_only_code_needs_nothing() {
        ensure_installed("import json\ndef run(x): return json.dumps(x)").unwrap();
    }

    #[test]
    fn test_install_nothing_is_a_no_op() {
        install(&[]).unwrap();
    }

    #[test]
    fn test_top_level() {
        assert_eq!(top_level("a.b.c"), "a");
        assert_eq!(top_level("plain"), "plain");
    }
}
