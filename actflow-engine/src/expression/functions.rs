// Built-in Functions for workflow expressions

use crate::expression::evaluator::{EvalError, ExpressionContext};
use crate::expression::value::Value;

use sha2::{Digest, Sha256};

use std::path::{Path, PathBuf};

const BUILTINS: [&str; 12] = [
    "success",
    "failure",
    "always",
    "cancelled",
    "contains",
    "startswith",
    "endswith",
    "format",
    "join",
    "tojson",
    "fromjson",
    "hashfiles",
];

/// Registry of built-in functions
pub struct BuiltinFunctions;

impl BuiltinFunctions {
    pub fn new() -> Self {
        Self
    }

    /// Function names are case-insensitive
    pub fn is_builtin(name: &str) -> bool {
        BUILTINS.contains(&name.to_lowercase().as_str())
    }

    /// Call a built-in function
    pub fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        context: &ExpressionContext,
    ) -> Result<Value, EvalError> {
        match name.to_lowercase().as_str() {
            // Status functions
            "success" => self.status(args, "success", context.status.success),
            "failure" => self.status(args, "failure", context.status.failure),
            "cancelled" => self.status(args, "cancelled", context.status.cancelled),
            "always" => self.status(args, "always", true),

            // String functions
            "contains" => self.fn_contains(args),
            "startswith" => self.fn_startswith(args),
            "endswith" => self.fn_endswith(args),
            "format" => self.fn_format(args),
            "join" => self.fn_join(args),

            // Conversion functions
            "tojson" => self.fn_to_json(args),
            "fromjson" => self.fn_from_json(args),

            // Workspace functions
            "hashfiles" => self.fn_hash_files(args, &context.workspace),

            _ => Err(EvalError::UnknownFunction(name.to_string())),
        }
    }

    // =========================================================================
    // Status Functions
    // =========================================================================

    fn status(&self, args: Vec<Value>, name: &str, state: bool) -> Result<Value, EvalError> {
        self.require_args(&args, 0, 0, name)?;
        Ok(Value::Bool(state))
    }

    // =========================================================================
    // String Functions
    // =========================================================================

    fn fn_contains(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        self.require_args(&args, 2, 2, "contains")?;

        let found = match &args[0] {
            Value::Array(items) => items.iter().any(|item| item.loosely_equals(&args[1])),
            haystack => haystack
                .as_string()
                .to_lowercase()
                .contains(&args[1].as_string().to_lowercase()),
        };

        Ok(Value::Bool(found))
    }

    fn fn_startswith(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        self.require_args(&args, 2, 2, "startsWith")?;
        let (s, prefix) = self.lowered(&args);
        Ok(Value::Bool(s.starts_with(&prefix)))
    }

    fn fn_endswith(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        self.require_args(&args, 2, 2, "endsWith")?;
        let (s, suffix) = self.lowered(&args);
        Ok(Value::Bool(s.ends_with(&suffix)))
    }

    /// `format('{0} and {1}', a, b)`; `{{` and `}}` escape literal braces
    fn fn_format(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        self.require_args(&args, 1, usize::MAX, "format")?;

        let template = args[0].as_string();
        let replacements = &args[1..];
        let mut result = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    result.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    result.push('}');
                }
                '{' => {
                    let mut digits = String::new();
                    for c in chars.by_ref() {
                        if c == '}' {
                            break;
                        }
                        digits.push(c);
                    }
                    let index: usize = digits.trim().parse().map_err(|_| {
                        EvalError::invalid_args(
                            "format",
                            format!("invalid placeholder '{{{}}}'", digits),
                        )
                    })?;
                    let value = replacements.get(index).ok_or_else(|| {
                        EvalError::invalid_args(
                            "format",
                            format!("placeholder {{{}}} has no matching argument", index),
                        )
                    })?;
                    result.push_str(&value.as_string());
                }
                '}' => {
                    return Err(EvalError::invalid_args("format", "unbalanced '}'"));
                }
                c => result.push(c),
            }
        }

        Ok(Value::String(result))
    }

    fn fn_join(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        self.require_args(&args, 1, 2, "join")?;

        let separator = args.get(1).map(Value::as_string).unwrap_or_else(|| ",".to_string());
        let joined = match &args[0] {
            Value::Array(items) => items
                .iter()
                .map(Value::as_string)
                .collect::<Vec<_>>()
                .join(&separator),
            other => other.as_string(),
        };

        Ok(Value::String(joined))
    }

    // =========================================================================
    // Conversion Functions
    // =========================================================================

    fn fn_to_json(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        self.require_args(&args, 1, 1, "toJSON")?;
        let json = serde_json::to_string_pretty(&args[0].to_json())
            .map_err(|e| EvalError::invalid_args("toJSON", e.to_string()))?;
        Ok(Value::String(json))
    }

    fn fn_from_json(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        self.require_args(&args, 1, 1, "fromJSON")?;
        let text = args[0].as_string();
        let parsed: serde_json::Value = serde_json::from_str(text.trim())
            .map_err(|e| EvalError::invalid_args("fromJSON", e.to_string()))?;
        Ok(Value::from(parsed))
    }

    // =========================================================================
    // Workspace Functions
    // =========================================================================

    /// SHA-256 over the SHA-256 of every matched file, in path order.
    /// Patterns starting with `!` exclude. No match yields ''.
    fn fn_hash_files(&self, args: Vec<Value>, workspace: &Path) -> Result<Value, EvalError> {
        self.require_args(&args, 1, usize::MAX, "hashFiles")?;

        let mut includes = Vec::new();
        let mut excludes = Vec::new();
        for arg in &args {
            let pattern = arg.as_string();
            match pattern.strip_prefix('!') {
                Some(negated) => excludes.push(
                    glob::Pattern::new(&workspace.join(negated).to_string_lossy())
                        .map_err(|e| EvalError::invalid_args("hashFiles", e.to_string()))?,
                ),
                None => includes.push(workspace.join(&pattern).to_string_lossy().into_owned()),
            }
        }

        let mut files: Vec<PathBuf> = Vec::new();
        for pattern in &includes {
            let paths = glob::glob(pattern)
                .map_err(|e| EvalError::invalid_args("hashFiles", e.to_string()))?;
            files.extend(
                paths
                    .filter_map(Result::ok)
                    .filter(|p| p.is_file())
                    .filter(|p| !excludes.iter().any(|ex| ex.matches_path(p))),
            );
        }
        files.sort();
        files.dedup();

        if files.is_empty() {
            return Ok(Value::String(String::new()));
        }

        let mut outer = Sha256::new();
        for file in &files {
            let content = std::fs::read(file).map_err(|e| {
                EvalError::invalid_args("hashFiles", format!("{}: {}", file.display(), e))
            })?;
            outer.update(Sha256::digest(&content));
        }

        Ok(Value::String(to_hex(&outer.finalize())))
    }

    // =========================================================================
    // Helper Functions
    // =========================================================================

    fn require_args(
        &self,
        args: &[Value],
        min: usize,
        max: usize,
        name: &str,
    ) -> Result<(), EvalError> {
        if args.len() < min || args.len() > max {
            let expected = if min == max {
                format!("{}", min)
            } else if max == usize::MAX {
                format!("at least {}", min)
            } else {
                format!("{} to {}", min, max)
            };
            return Err(EvalError::invalid_args(
                name,
                format!("expected {} argument(s), got {}", expected, args.len()),
            ));
        }
        Ok(())
    }

    fn lowered(&self, args: &[Value]) -> (String, String) {
        (
            args[0].as_string().to_lowercase(),
            args[1].as_string().to_lowercase(),
        )
    }
}

impl Default for BuiltinFunctions {
    fn default() -> Self {
        Self::new()
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
