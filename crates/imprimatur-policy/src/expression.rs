//! JMESPath evaluation over JSON values.
//!
//! A single runtime is shared by the whole process. It carries the standard
//! function library plus `trim_prefix(str, prefix)`, which policies use to
//! normalize image values such as `docker://nginx:1.25`.

use std::sync::LazyLock;

use jmespath::functions::{ArgumentType, CustomFunction, Signature};
use jmespath::{JmespathError, Rcvar, Runtime, Variable};
use serde_json::Value;

static RUNTIME: LazyLock<Runtime> = LazyLock::new(|| {
    let mut runtime = Runtime::new();
    runtime.register_builtin_functions();
    runtime.register_function(
        "trim_prefix",
        Box::new(CustomFunction::new(
            Signature::new(vec![ArgumentType::String, ArgumentType::String], None),
            Box::new(trim_prefix),
        )),
    );
    runtime
});

/// Errors from compiling or evaluating an expression.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    /// The expression does not parse.
    #[error("invalid jmespath {expression}: {reason}")]
    Compile {
        /// The expression text.
        expression: String,
        /// Parser message.
        reason: String,
    },

    /// The expression parsed but failed at runtime.
    #[error("failed to apply jmespath {expression}: {reason}")]
    Search {
        /// The expression text.
        expression: String,
        /// Interpreter message.
        reason: String,
    },

    /// The result could not be converted back into JSON.
    #[error("jmespath {expression} produced an unrepresentable value: {source}")]
    Convert {
        /// The expression text.
        expression: String,
        /// Conversion error.
        source: serde_json::Error,
    },
}

/// Evaluate `expression` against `data`.
///
/// A path that does not exist yields `Value::Null`, not an error.
pub fn search(expression: &str, data: &Value) -> Result<Value, ExpressionError> {
    let compiled = RUNTIME
        .compile(expression)
        .map_err(|e| ExpressionError::Compile {
            expression: expression.to_owned(),
            reason: e.to_string(),
        })?;
    let result = compiled.search(data).map_err(|e| ExpressionError::Search {
        expression: expression.to_owned(),
        reason: e.to_string(),
    })?;
    serde_json::to_value(&*result).map_err(|source| ExpressionError::Convert {
        expression: expression.to_owned(),
        source,
    })
}

fn trim_prefix(args: &[Rcvar], _: &mut jmespath::Context<'_>) -> Result<Rcvar, JmespathError> {
    let trimmed = match (&*args[0], &*args[1]) {
        (Variable::String(value), Variable::String(prefix)) => value
            .strip_prefix(prefix.as_str())
            .unwrap_or(value)
            .to_owned(),
        (Variable::String(value), _) => value.clone(),
        _ => String::new(),
    };
    Ok(Rcvar::new(Variable::String(trimmed)))
}
