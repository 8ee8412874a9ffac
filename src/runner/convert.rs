//! Conversion between codec values and Python objects

use pyo3::prelude::*;
use pyo3::types::{PyBool, PyDict, PyFloat, PyList, PyLong, PyString, PyTuple};
use serde_json::{Map, Number};

use crate::codec::{Value, MAX_DEPTH};
use crate::errors::{Result, SandboxError};

/// Build the Python object handed to the entry point
pub fn to_python(py: Python<'_>, value: &Value) -> PyResult<PyObject> {
    let object = match value {
        Value::Null => py.None(),
        Value::Bool(flag) => (*flag).into_py(py),
        Value::Number(number) => {
            if let Some(n) = number.as_i64() {
                n.into_py(py)
            } else if let Some(n) = number.as_u64() {
                n.into_py(py)
            } else {
                number.as_f64().unwrap_or_default().into_py(py)
            }
        }
        Value::String(text) => text.as_str().into_py(py),
        Value::Array(items) => {
            let items = items
                .iter()
                .map(|item| to_python(py, item))
                .collect::<PyResult<Vec<_>>>()?;
            PyList::new(py, items).into_py(py)
        }
        Value::Object(map) => {
            let dict = PyDict::new(py);
            for (key, item) in map {
                dict.set_item(key, to_python(py, item)?)?;
            }
            dict.into_py(py)
        }
    };

    Ok(object)
}

/// Read a Python object back into a codec value.
///
/// Fails with an encoding error on shapes the codec cannot carry: non-text
/// mapping keys, non-finite floats, integers beyond 64 bits, arbitrary
/// objects, and self-referencing containers (caught by the depth bound).
pub fn from_python(object: &PyAny) -> Result<Value> {
    match from_python_within(object, usize::MAX)? {
        Some(value) => Ok(value),
        None => Err(SandboxError::Encoding("value is too large".to_string())),
    }
}

/// Like [`from_python`], but gives up with `Ok(None)` as soon as the encoded
/// form is known to exceed `limit` bytes. Sizes are charged before anything
/// is copied, so an oversized value never gets materialised.
pub fn from_python_within(object: &PyAny, limit: usize) -> Result<Option<Value>> {
    let mut budget = Budget { remaining: limit };
    match convert(object, 1, &mut budget) {
        Ok(value) => Ok(Some(value)),
        Err(Stop::OverBudget) => Ok(None),
        Err(Stop::Invalid(e)) => Err(e),
    }
}

enum Stop {
    Invalid(SandboxError),
    OverBudget,
}

impl From<SandboxError> for Stop {
    fn from(e: SandboxError) -> Self {
        Stop::Invalid(e)
    }
}

/// Lower bound on the encoded bytes still allowed
struct Budget {
    remaining: usize,
}

impl Budget {
    fn charge(&mut self, bytes: usize) -> std::result::Result<(), Stop> {
        self.remaining = self.remaining.checked_sub(bytes).ok_or(Stop::OverBudget)?;
        Ok(())
    }

    /// Brackets plus separators of a container with `len` entries
    fn charge_container(&mut self, len: usize) -> std::result::Result<(), Stop> {
        self.charge(len.saturating_add(1).max(2))
    }
}

fn convert(object: &PyAny, depth: usize, budget: &mut Budget) -> std::result::Result<Value, Stop> {
    if depth > MAX_DEPTH {
        return Err(SandboxError::Encoding(format!(
            "value nests deeper than {} levels or refers to itself",
            MAX_DEPTH
        ))
        .into());
    }

    if object.is_none() {
        budget.charge(4)?;
        return Ok(Value::Null);
    }

    // bool is a subclass of int, so it has to be checked first
    if let Ok(flag) = object.downcast::<PyBool>() {
        let flag = flag.is_true();
        budget.charge(if flag { 4 } else { 5 })?;
        return Ok(Value::Bool(flag));
    }

    if let Ok(int) = object.downcast::<PyLong>() {
        let value = if let Ok(n) = int.extract::<i64>() {
            Value::from(n)
        } else if let Ok(n) = int.extract::<u64>() {
            Value::from(n)
        } else {
            return Err(SandboxError::Encoding("integer does not fit in 64 bits".to_string()).into());
        };
        budget.charge(value.to_string().len())?;
        return Ok(value);
    }

    if let Ok(float) = object.downcast::<PyFloat>() {
        let number = Number::from_f64(float.value())
            .ok_or_else(|| SandboxError::Encoding("non-finite float".to_string()))?;
        budget.charge(number.to_string().len())?;
        return Ok(Value::Number(number));
    }

    if let Ok(text) = object.downcast::<PyString>() {
        return text_within(text, budget).map(Value::String);
    }

    if let Ok(list) = object.downcast::<PyList>() {
        budget.charge_container(list.len())?;
        return list
            .iter()
            .map(|item| convert(item, depth + 1, budget))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Value::Array);
    }

    if let Ok(tuple) = object.downcast::<PyTuple>() {
        budget.charge_container(tuple.len())?;
        return tuple
            .iter()
            .map(|item| convert(item, depth + 1, budget))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Value::Array);
    }

    if let Ok(dict) = object.downcast::<PyDict>() {
        // One colon per entry on top of the separators
        budget.charge_container(dict.len())?;
        budget.charge(dict.len())?;
        let mut map = Map::new();
        for (key, item) in dict.iter() {
            let key = key.downcast::<PyString>().map_err(|_| {
                SandboxError::Encoding(format!(
                    "mapping key of type `{}` is not text",
                    type_name(key)
                ))
            })?;
            let key = text_within(key, budget)?;
            map.insert(key, convert(item, depth + 1, budget)?);
        }
        return Ok(Value::Object(map));
    }

    Err(SandboxError::Encoding(format!(
        "values of type `{}` are not supported",
        type_name(object)
    ))
    .into())
}

/// Charge a string with its quotes before copying it out of the interpreter
fn text_within(text: &PyString, budget: &mut Budget) -> std::result::Result<String, Stop> {
    let text = text
        .to_str()
        .map_err(|_| SandboxError::Encoding("text is not valid UTF-8".to_string()))?;
    budget.charge(text.len().saturating_add(2))?;
    Ok(text.to_owned())
}

pub(crate) fn type_name(object: &PyAny) -> String {
    object
        .get_type()
        .name()
        .map(str::to_owned)
        .unwrap_or_else(|_| "object".to_string())
}
