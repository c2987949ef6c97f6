use serde_json::Value;

use crate::{Error, ErrorKind, Result, rpc_error::Violation};

/// Checks the parameters of a call before its handler runs.
pub trait ParamsValidator: Send + Sync {
    /// # Errors
    ///
    /// Returns every violation found; the list is never empty.
    fn validate(&self, params: &Value) -> std::result::Result<(), Vec<Violation>>;
}

/// [`ParamsValidator`] backed by a compiled JSON Schema.
pub struct JsonSchemaValidator {
    validator: jsonschema::Validator,
}

impl JsonSchemaValidator {
    /// Compiles `schema` with the draft it declares, or the latest one.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::SchemaCompileFailed`] for an invalid schema.
    pub fn compile(schema: &Value) -> Result<Self> {
        let validator = jsonschema::validator_for(schema)
            .map_err(|e| Error::new(ErrorKind::SchemaCompileFailed, e.to_string()))?;
        Ok(Self { validator })
    }
}

impl ParamsValidator for JsonSchemaValidator {
    fn validate(&self, params: &Value) -> std::result::Result<(), Vec<Violation>> {
        let violations: Vec<Violation> = self
            .validator
            .iter_errors(params)
            .map(|err| Violation::new(err.instance_path.to_string(), err.to_string()))
            .collect();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

impl std::fmt::Debug for JsonSchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonSchemaValidator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_number_schema() {
        let validator = JsonSchemaValidator::compile(&json!({"type": "number"})).unwrap();
        assert!(validator.validate(&json!(5)).is_ok());

        let violations = validator.validate(&json!("a")).unwrap_err();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, "");
        assert!(violations[0].message.contains("number"));
    }

    #[test]
    fn test_nested_violations() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "integer"}, "b": {"type": "string"}},
            "required": ["a"],
        });
        let validator = JsonSchemaValidator::compile(&schema).unwrap();
        let violations = validator.validate(&json!({"a": "x", "b": 1})).unwrap_err();
        let mut paths: Vec<_> = violations.iter().map(|v| v.path.as_str()).collect();
        paths.sort_unstable();
        assert_eq!(paths, ["/a", "/b"]);
    }

    #[test]
    fn test_invalid_schema() {
        let err = JsonSchemaValidator::compile(&json!({"type": 12})).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SchemaCompileFailed);
    }
}
