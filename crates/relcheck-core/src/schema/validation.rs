use std::collections::HashSet;

use super::types::{EntityDefinition, RewriteRule, Schema};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("duplicate type: {0}")]
    DuplicateType(String),
    #[error("duplicate name '{name}' in type '{type_name}'")]
    DuplicateName { type_name: String, name: String },
    #[error("relation '{relation}' on type '{type_name}' allows unknown subject type '{subject_type}'")]
    UnknownSubjectType {
        type_name: String,
        relation: String,
        subject_type: String,
    },
    #[error("permission '{permission}' on type '{type_name}' uses undefined relation '{relation}'")]
    UnknownRelation {
        type_name: String,
        permission: String,
        relation: String,
    },
    #[error("permission '{permission}' on type '{type_name}' references undefined name '{name}'")]
    UnknownReference {
        type_name: String,
        permission: String,
        name: String,
    },
    #[error("permission '{permission}' on type '{type_name}' has an empty operator")]
    EmptyOperator {
        type_name: String,
        permission: String,
    },
}

/// Checks that every name used by a compiled schema resolves. Returns every
/// problem found rather than stopping at the first.
pub fn validate_schema(schema: &Schema) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut seen_types = HashSet::new();

    for type_def in &schema.types {
        if !seen_types.insert(type_def.name.as_str()) {
            errors.push(ValidationError::DuplicateType(type_def.name.clone()));
        }

        let mut seen_names = HashSet::new();
        let names = type_def
            .relations
            .iter()
            .map(|r| &r.name)
            .chain(type_def.permissions.iter().map(|p| &p.name));
        for name in names {
            if !seen_names.insert(name.as_str()) {
                errors.push(ValidationError::DuplicateName {
                    type_name: type_def.name.clone(),
                    name: name.clone(),
                });
            }
        }

        for relation in &type_def.relations {
            for subject_type in &relation.subject_types {
                if schema.get_type(&subject_type.type_name).is_none() {
                    errors.push(ValidationError::UnknownSubjectType {
                        type_name: type_def.name.clone(),
                        relation: relation.name.clone(),
                        subject_type: subject_type.type_name.clone(),
                    });
                }
            }
        }

        for permission in &type_def.permissions {
            check_rule(
                schema,
                type_def,
                &permission.name,
                &permission.rule,
                &mut errors,
            );
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_rule(
    schema: &Schema,
    type_def: &EntityDefinition,
    permission: &str,
    rule: &RewriteRule,
    errors: &mut Vec<ValidationError>,
) {
    match rule {
        RewriteRule::This(relation) => {
            if type_def.get_relation(relation).is_none() {
                errors.push(unknown_relation(type_def, permission, relation));
            }
        }
        RewriteRule::Computed(name) => {
            if type_def.reference(name).is_none() {
                errors.push(ValidationError::UnknownReference {
                    type_name: type_def.name.clone(),
                    permission: permission.to_string(),
                    name: name.clone(),
                });
            }
        }
        RewriteRule::Arrow(relation, target) => {
            let Some(relation_def) = type_def.get_relation(relation) else {
                errors.push(unknown_relation(type_def, permission, relation));
                return;
            };
            // The target only has to exist on one of the relation's subject
            // types; evaluation skips related entities whose type lacks it.
            // An untyped relation is checked at evaluation time.
            let resolvable = relation_def.subject_types.is_empty()
                || relation_def.subject_types.iter().any(|st| {
                    schema
                        .get_type(&st.type_name)
                        .is_some_and(|t| t.reference(target).is_some())
                });
            if !resolvable {
                errors.push(ValidationError::UnknownReference {
                    type_name: type_def.name.clone(),
                    permission: permission.to_string(),
                    name: format!("{relation}.{target}"),
                });
            }
        }
        RewriteRule::Union(children) | RewriteRule::Intersection(children) => {
            if children.is_empty() {
                errors.push(ValidationError::EmptyOperator {
                    type_name: type_def.name.clone(),
                    permission: permission.to_string(),
                });
            }
            for child in children {
                check_rule(schema, type_def, permission, child, errors);
            }
        }
        RewriteRule::Exclusion(child) => check_rule(schema, type_def, permission, child, errors),
    }
}

fn unknown_relation(type_def: &EntityDefinition, permission: &str, relation: &str) -> ValidationError {
    ValidationError::UnknownRelation {
        type_name: type_def.name.clone(),
        permission: permission.to_string(),
        relation: relation.to_string(),
    }
}
