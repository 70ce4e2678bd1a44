//! Entity mapping collaborator.
//!
//! [`EntityMapping`] is the interface the binder, policy rewriter and
//! comparison rewriter consult. [`StaticMapping`] implements it from statically
//! declared [`EntitySchema`] descriptors: field list, primary key,
//! relationships and the members a constructor needs.

use crate::error::{TranslationError, TranslationResult};
use crate::types::{Name, ScalarKind};
use std::collections::HashMap;

/// A member mapped to a table column
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    /// Column name in the table (defaults to the member name)
    pub column: Name,
    pub kind: ScalarKind,
    pub primary_key: bool,
    /// Value produced by the database on insert
    pub generated: bool,
    pub nullable: bool,
    /// Stored type name overriding the dialect default, e.g. `NVARCHAR(40)`
    pub db_type: Option<String>,
}

/// A member navigating to another entity
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipSchema {
    pub target: Name,
    /// Members on this side of the association
    pub key_members: Vec<Name>,
    /// Matching members on the related side
    pub related_key_members: Vec<Name>,
    /// Collection-valued (one-to-many) when true
    pub many: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MemberKind {
    Column(ColumnSchema),
    Relationship(RelationshipSchema),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemberSchema {
    pub name: Name,
    pub kind: MemberKind,
}

/// Static descriptor of one mapped entity.
///
/// ```
/// use quarry::mapping::EntitySchema;
/// use quarry::types::ScalarKind;
///
/// let order = EntitySchema::new("Order", "Orders")
///     .generated_key("OrderID", ScalarKind::Int)
///     .column("CustomerID", ScalarKind::Text)
///     .has_one("Customer", "Customer", &["CustomerID"], &["CustomerID"]);
/// assert_eq!(&*order.primary_key()[0], "OrderID");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySchema {
    pub name: Name,
    pub table: Name,
    pub members: Vec<MemberSchema>,
    /// Read-only members that must be supplied when constructing the entity
    pub constructor: Vec<Name>,
}

impl EntitySchema {
    pub fn new(name: &str, table: &str) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            members: Vec::new(),
            constructor: Vec::new(),
        }
    }

    fn push_column(mut self, member: &str, column: ColumnSchema) -> Self {
        self.members.push(MemberSchema {
            name: member.into(),
            kind: MemberKind::Column(column),
        });
        self
    }

    /// Add a nullable column named after the member
    pub fn column(self, member: &str, kind: ScalarKind) -> Self {
        self.column_named(member, member, kind)
    }

    /// Add a nullable column whose table name differs from the member
    pub fn column_named(self, member: &str, column: &str, kind: ScalarKind) -> Self {
        self.push_column(
            member,
            ColumnSchema {
                column: column.into(),
                kind,
                primary_key: false,
                generated: false,
                nullable: true,
                db_type: None,
            },
        )
    }

    /// Add a column with an explicit stored type name
    pub fn typed_column(self, member: &str, kind: ScalarKind, db_type: &str) -> Self {
        let schema = self.column(member, kind);
        schema.with_last_column(|c| c.db_type = Some(db_type.to_string()))
    }

    /// Add a primary key column
    pub fn key(self, member: &str, kind: ScalarKind) -> Self {
        self.push_column(
            member,
            ColumnSchema {
                column: member.into(),
                kind,
                primary_key: true,
                generated: false,
                nullable: false,
                db_type: None,
            },
        )
    }

    /// Add a database-generated primary key column
    pub fn generated_key(self, member: &str, kind: ScalarKind) -> Self {
        self.key(member, kind).with_last_column(|c| c.generated = true)
    }

    /// Mark the most recently added column as not nullable
    pub fn required(self) -> Self {
        self.with_last_column(|c| c.nullable = false)
    }

    fn with_last_column(mut self, f: impl FnOnce(&mut ColumnSchema)) -> Self {
        if let Some(MemberSchema {
            kind: MemberKind::Column(column),
            ..
        }) = self.members.last_mut()
        {
            f(column);
        }
        self
    }

    /// Add a to-one relationship
    pub fn has_one(mut self, member: &str, target: &str, keys: &[&str], related: &[&str]) -> Self {
        self.members.push(MemberSchema {
            name: member.into(),
            kind: MemberKind::Relationship(RelationshipSchema {
                target: target.into(),
                key_members: keys.iter().map(|k| Name::from(*k)).collect(),
                related_key_members: related.iter().map(|k| Name::from(*k)).collect(),
                many: false,
            }),
        });
        self
    }

    /// Add a to-many relationship
    pub fn has_many(mut self, member: &str, target: &str, keys: &[&str], related: &[&str]) -> Self {
        self = self.has_one(member, target, keys, related);
        if let Some(MemberSchema {
            kind: MemberKind::Relationship(rel),
            ..
        }) = self.members.last_mut()
        {
            rel.many = true;
        }
        self
    }

    /// Declare the members a constructor binds
    pub fn constructed_with(mut self, members: &[&str]) -> Self {
        self.constructor = members.iter().map(|m| Name::from(*m)).collect();
        self
    }

    pub fn member(&self, name: &str) -> Option<&MemberSchema> {
        self.members.iter().find(|m| &*m.name == name)
    }

    pub fn primary_key(&self) -> Vec<Name> {
        self.members
            .iter()
            .filter(|m| matches!(&m.kind, MemberKind::Column(c) if c.primary_key))
            .map(|m| m.name.clone())
            .collect()
    }
}

/// Entity-to-table mapping consumed by the pipeline
pub trait EntityMapping: Send + Sync {
    /// Table backing the entity
    fn table_name(&self, entity: &str) -> TranslationResult<Name>;

    /// All mapped members, columns first in declaration order
    fn mapped_members(&self, entity: &str) -> TranslationResult<Vec<Name>>;

    /// Column mapping of a member, if it is a column
    fn column(&self, entity: &str, member: &str) -> Option<&ColumnSchema>;

    /// Relationship mapping of a member, if it is a relationship
    fn relationship(&self, entity: &str, member: &str) -> Option<&RelationshipSchema>;

    /// Primary key members
    fn primary_key(&self, entity: &str) -> TranslationResult<Vec<Name>>;

    /// Members that a constructor must receive
    fn constructor_members(&self, _entity: &str) -> Vec<Name> {
        Vec::new()
    }

    fn is_column(&self, entity: &str, member: &str) -> bool {
        self.column(entity, member).is_some()
    }

    fn is_relationship(&self, entity: &str, member: &str) -> bool {
        self.relationship(entity, member).is_some()
    }

    fn is_primary_key(&self, entity: &str, member: &str) -> bool {
        self.column(entity, member).is_some_and(|c| c.primary_key)
    }

    fn is_generated(&self, entity: &str, member: &str) -> bool {
        self.column(entity, member).is_some_and(|c| c.generated)
    }

    fn related_entity(&self, entity: &str, member: &str) -> Option<Name> {
        self.relationship(entity, member).map(|r| r.target.clone())
    }

    fn key_members(&self, entity: &str, member: &str) -> Vec<Name> {
        self.relationship(entity, member)
            .map(|r| r.key_members.clone())
            .unwrap_or_default()
    }

    fn related_key_members(&self, entity: &str, member: &str) -> Vec<Name> {
        self.relationship(entity, member)
            .map(|r| r.related_key_members.clone())
            .unwrap_or_default()
    }

    fn column_db_type_override(&self, entity: &str, member: &str) -> Option<&str> {
        self.column(entity, member).and_then(|c| c.db_type.as_deref())
    }
}

/// Mapping built from declared schemas
#[derive(Debug, Clone, Default)]
pub struct StaticMapping {
    entities: HashMap<Name, EntitySchema>,
}

impl StaticMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity schema (replaces one with the same name)
    pub fn with_entity(mut self, schema: EntitySchema) -> Self {
        self.entities.insert(schema.name.clone(), schema);
        self
    }

    pub fn entity(&self, entity: &str) -> TranslationResult<&EntitySchema> {
        self.entities
            .get(entity)
            .ok_or_else(|| TranslationError::UnknownEntity {
                entity: entity.to_string(),
            })
    }
}

impl EntityMapping for StaticMapping {
    fn table_name(&self, entity: &str) -> TranslationResult<Name> {
        Ok(self.entity(entity)?.table.clone())
    }

    fn mapped_members(&self, entity: &str) -> TranslationResult<Vec<Name>> {
        let schema = self.entity(entity)?;
        let columns = schema
            .members
            .iter()
            .filter(|m| matches!(m.kind, MemberKind::Column(_)));
        let relationships = schema
            .members
            .iter()
            .filter(|m| matches!(m.kind, MemberKind::Relationship(_)));
        Ok(columns.chain(relationships).map(|m| m.name.clone()).collect())
    }

    fn column(&self, entity: &str, member: &str) -> Option<&ColumnSchema> {
        match &self.entities.get(entity)?.member(member)?.kind {
            MemberKind::Column(c) => Some(c),
            MemberKind::Relationship(_) => None,
        }
    }

    fn relationship(&self, entity: &str, member: &str) -> Option<&RelationshipSchema> {
        match &self.entities.get(entity)?.member(member)?.kind {
            MemberKind::Relationship(r) => Some(r),
            MemberKind::Column(_) => None,
        }
    }

    fn primary_key(&self, entity: &str) -> TranslationResult<Vec<Name>> {
        Ok(self.entity(entity)?.primary_key())
    }

    fn constructor_members(&self, entity: &str) -> Vec<Name> {
        self.entities
            .get(entity)
            .map(|e| e.constructor.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> StaticMapping {
        StaticMapping::new()
            .with_entity(
                EntitySchema::new("Customer", "Customers")
                    .key("CustomerID", ScalarKind::Text)
                    .typed_column("City", ScalarKind::Text, "NVARCHAR(15)")
                    .has_many("Orders", "Order", &["CustomerID"], &["CustomerID"]),
            )
            .with_entity(
                EntitySchema::new("Order", "Orders")
                    .generated_key("OrderID", ScalarKind::Int)
                    .column("CustomerID", ScalarKind::Text)
                    .has_one("Customer", "Customer", &["CustomerID"], &["CustomerID"]),
            )
    }

    #[test]
    fn test_member_classification() {
        let m = mapping();
        assert!(m.is_column("Customer", "City"));
        assert!(m.is_relationship("Customer", "Orders"));
        assert!(m.is_primary_key("Customer", "CustomerID"));
        assert!(!m.is_primary_key("Customer", "City"));
        assert!(m.is_generated("Order", "OrderID"));
        assert_eq!(m.column_db_type_override("Customer", "City"), Some("NVARCHAR(15)"));
    }

    #[test]
    fn test_relationship_keys() {
        let m = mapping();
        assert_eq!(m.related_entity("Order", "Customer").as_deref(), Some("Customer"));
        assert_eq!(m.key_members("Customer", "Orders"), vec![Name::from("CustomerID")]);
        assert!(m.relationship("Customer", "Orders").unwrap().many);
        assert!(!m.relationship("Order", "Customer").unwrap().many);
    }

    #[test]
    fn test_mapped_members_lists_columns_before_relationships() {
        let members = mapping().mapped_members("Customer").unwrap();
        let names: Vec<&str> = members.iter().map(|m| &**m).collect();
        assert_eq!(names, vec!["CustomerID", "City", "Orders"]);
    }

    #[test]
    fn test_unknown_entity() {
        let err = mapping().table_name("Invoice").unwrap_err();
        assert!(matches!(err, TranslationError::UnknownEntity { .. }));
    }
}
