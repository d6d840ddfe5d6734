use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub types: Vec<EntityDefinition>,
}

impl Schema {
    pub fn get_type(&self, name: &str) -> Option<&EntityDefinition> {
        self.types.iter().find(|t| t.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDefinition {
    pub name: String,
    #[serde(default)]
    pub relations: Vec<RelationDef>,
    #[serde(default)]
    pub permissions: Vec<PermissionDef>,
}

impl EntityDefinition {
    pub fn get_relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn get_permission(&self, name: &str) -> Option<&PermissionDef> {
        self.permissions.iter().find(|p| p.name == name)
    }

    /// Resolves a name to a relation or a permission. Relations win when a
    /// schema (incorrectly) declares both.
    pub fn reference(&self, name: &str) -> Option<Reference<'_>> {
        self.get_relation(name)
            .map(Reference::Relation)
            .or_else(|| self.get_permission(name).map(Reference::Permission))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference<'a> {
    Relation(&'a RelationDef),
    Permission(&'a PermissionDef),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDef {
    pub name: String,
    #[serde(default)]
    pub subject_types: Vec<SubjectTypeRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectTypeRef {
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDef {
    pub name: String,
    pub rule: RewriteRule,
}

/// Permission expression tree.
///
/// - `This(rel)`: subjects stored directly under relation `rel`, following
///   userset subjects.
/// - `Computed(name)`: another permission or relation of the same entity.
/// - `Arrow(rel, name)`: `name` evaluated on every entity reached via `rel`.
/// - `Exclusion(child)`: negation of `child`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteRule {
    This(String),
    Computed(String),
    Arrow(String, String),
    Union(Vec<RewriteRule>),
    Intersection(Vec<RewriteRule>),
    Exclusion(Box<RewriteRule>),
}
