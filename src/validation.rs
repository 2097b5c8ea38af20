//! JSON Schema validation for initial run parameters.
//!
//! Workflows can declare an `input_schema` to validate the parameters a run
//! is started with, before any block executes.
//!
//! ## Example
//!
//! ```yaml
//! name: invoice-download
//! input_schema:
//!   type: object
//!   required:
//!     - account_id
//!   properties:
//!     account_id:
//!       type: string
//!       pattern: "^ACC-[0-9]+$"
//!     max_invoices:
//!       type: integer
//!       minimum: 1
//! ```

use jsonschema::{validator_for, ValidationError, Validator};
use serde_json::Value;

use crate::error::{Error, Result};

/// Compiled JSON Schema validator.
pub struct SchemaValidator {
    validator: Validator,
}

impl SchemaValidator {
    /// Compile a JSON Schema for validation.
    pub fn new(schema: &Value) -> Result<Self> {
        let validator = validator_for(schema)
            .map_err(|e| Error::Validation(format!("Invalid JSON Schema: {}", e)))?;

        Ok(Self { validator })
    }

    /// Validate run parameters against the schema.
    pub fn validate(&self, input: &Value) -> Result<()> {
        if let Err(error) = self.validator.validate(input) {
            return Err(Error::Validation(format!(
                "Run parameter validation failed: {}",
                format_validation_error(&error)
            )));
        }

        Ok(())
    }
}

fn format_validation_error(error: &ValidationError) -> String {
    let path = error.instance_path.to_string();
    if path.is_empty() || path == "/" {
        error.to_string()
    } else {
        format!("at '{}': {}", path, error)
    }
}

/// Validate run parameters against an optional declared schema.
pub fn validate_input(schema: Option<&Value>, input: &Value) -> Result<()> {
    match schema {
        Some(schema) => SchemaValidator::new(schema)?.validate(input),
        None => Ok(()),
    }
}
