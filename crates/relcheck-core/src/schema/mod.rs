pub mod types;
pub mod validation;

pub use types::{
    EntityDefinition, PermissionDef, Reference, RelationDef, RewriteRule, Schema, SubjectTypeRef,
};
pub use validation::{ValidationError, validate_schema};

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("malformed schema document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("schema validation errors: {}", format_validation_errors(.0))]
    Invalid(Vec<ValidationError>),
}

/// Decodes a compiled schema from its JSON form and validates it.
pub fn schema_from_json(input: &str) -> Result<Schema, SchemaError> {
    let schema: Schema = serde_json::from_str(input)?;
    validate_schema(&schema).map_err(SchemaError::Invalid)?;
    Ok(schema)
}

pub fn schema_to_json(schema: &Schema) -> Result<String, SchemaError> {
    Ok(serde_json::to_string(schema)?)
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
