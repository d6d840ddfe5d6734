use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// Relation marker meaning "the subject set itself", not a further relation.
pub const ELLIPSIS: &str = "...";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantId(Uuid);

impl TenantId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for TenantId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefParseError {
    #[error("expected 'type:id', got '{0}'")]
    MissingSeparator(String),
    #[error("empty type or id in '{0}'")]
    EmptyComponent(String),
    #[error("empty relation in '{0}'")]
    EmptyRelation(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

impl FromStr for EntityRef {
    type Err = RefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (entity_type, entity_id) = s
            .split_once(':')
            .ok_or_else(|| RefParseError::MissingSeparator(s.to_string()))?;
        if entity_type.is_empty() || entity_id.is_empty() {
            return Err(RefParseError::EmptyComponent(s.to_string()));
        }
        Ok(Self::new(entity_type, entity_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubjectRef {
    pub subject_type: String,
    pub subject_id: String,
    pub subject_relation: Option<String>,
}

impl SubjectRef {
    pub fn direct(subject_type: impl Into<String>, subject_id: impl Into<String>) -> Self {
        Self {
            subject_type: subject_type.into(),
            subject_id: subject_id.into(),
            subject_relation: None,
        }
    }

    pub fn userset(
        subject_type: impl Into<String>,
        subject_id: impl Into<String>,
        relation: impl Into<String>,
    ) -> Self {
        Self {
            subject_type: subject_type.into(),
            subject_id: subject_id.into(),
            subject_relation: Some(relation.into()),
        }
    }

    /// Relation with the ellipsis marker folded into `None`.
    pub fn normalized_relation(&self) -> Option<&str> {
        match self.subject_relation.as_deref() {
            None | Some(ELLIPSIS) => None,
            Some(rel) => Some(rel),
        }
    }

    /// True when this subject is a concrete member rather than a userset.
    pub fn is_direct(&self) -> bool {
        self.normalized_relation().is_none()
    }

    /// Membership equality: type and id match exactly, relations match after
    /// ellipsis normalization. The stored relation string is never rewritten.
    pub fn same_member(&self, other: &SubjectRef) -> bool {
        self.subject_type == other.subject_type
            && self.subject_id == other.subject_id
            && self.normalized_relation() == other.normalized_relation()
    }

    pub fn entity(&self) -> EntityRef {
        EntityRef::new(&self.subject_type, &self.subject_id)
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.subject_type, self.subject_id)?;
        if let Some(ref rel) = self.subject_relation {
            write!(f, "#{rel}")?;
        }
        Ok(())
    }
}

impl FromStr for SubjectRef {
    type Err = RefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (entity_part, relation) = match s.split_once('#') {
            Some((_, "")) => return Err(RefParseError::EmptyRelation(s.to_string())),
            Some((entity, rel)) => (entity, Some(rel)),
            None => (s, None),
        };
        let entity: EntityRef = entity_part.parse().map_err(|e| match e {
            RefParseError::MissingSeparator(_) => RefParseError::MissingSeparator(s.to_string()),
            _ => RefParseError::EmptyComponent(s.to_string()),
        })?;
        Ok(Self {
            subject_type: entity.entity_type,
            subject_id: entity.entity_id,
            subject_relation: relation.map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tuple {
    pub entity: EntityRef,
    pub relation: String,
    pub subject: SubjectRef,
}

impl Tuple {
    pub fn new(entity: EntityRef, relation: impl Into<String>, subject: SubjectRef) -> Self {
        Self {
            entity,
            relation: relation.into(),
            subject,
        }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.entity, self.relation, self.subject)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleWrite {
    pub entity: EntityRef,
    pub relation: String,
    pub subject: SubjectRef,
}

impl TupleWrite {
    pub fn new(entity: EntityRef, relation: impl Into<String>, subject: SubjectRef) -> Self {
        Self {
            entity,
            relation: relation.into(),
            subject,
        }
    }
}

impl From<TupleWrite> for Tuple {
    fn from(write: TupleWrite) -> Self {
        Self {
            entity: write.entity,
            relation: write.relation,
            subject: write.subject,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("entity id filter requires an entity type")]
    IdsWithoutType,
    #[error("relation filter must not be empty")]
    EmptyRelation,
}

/// Read predicate over tuples. An empty `entity_ids` list matches any id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TupleFilter {
    pub entity_type: Option<String>,
    pub entity_ids: Vec<String>,
    pub relation: Option<String>,
    pub subject_type: Option<String>,
    pub subject_id: Option<String>,
    pub subject_relation: Option<Option<String>>,
}

impl TupleFilter {
    pub fn for_relation(entity: &EntityRef, relation: &str) -> Self {
        Self {
            entity_type: Some(entity.entity_type.clone()),
            entity_ids: vec![entity.entity_id.clone()],
            relation: Some(relation.to_string()),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), FilterError> {
        if !self.entity_ids.is_empty() && self.entity_type.is_none() {
            return Err(FilterError::IdsWithoutType);
        }
        if matches!(self.relation.as_deref(), Some("")) {
            return Err(FilterError::EmptyRelation);
        }
        Ok(())
    }

    pub fn matches(&self, tuple: &Tuple) -> bool {
        if let Some(ref et) = self.entity_type
            && et != &tuple.entity.entity_type
        {
            return false;
        }
        if !self.entity_ids.is_empty() && !self.entity_ids.contains(&tuple.entity.entity_id) {
            return false;
        }
        if let Some(ref r) = self.relation
            && r != &tuple.relation
        {
            return false;
        }
        if let Some(ref st) = self.subject_type
            && st != &tuple.subject.subject_type
        {
            return false;
        }
        if let Some(ref si) = self.subject_id
            && si != &tuple.subject.subject_id
        {
            return false;
        }
        if let Some(ref sr) = self.subject_relation
            && sr != &tuple.subject.subject_relation
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotToken(u64);

impl SnapshotToken {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SnapshotToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid snapshot token '{0}'")]
pub struct TokenParseError(String);

impl FromStr for SnapshotToken {
    type Err = TokenParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|_| TokenParseError(s.to_string()))
    }
}

/// Which snapshot a call reads. `Latest` is pinned to the store's head
/// snapshot once, when the call starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    Latest,
    AtSnapshot(SnapshotToken),
}
