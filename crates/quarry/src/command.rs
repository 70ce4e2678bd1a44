//! Data-modification commands.
//!
//! [`CommandBuilder`] turns an entity value (a JSON object keyed by member
//! name) into insert, update, delete and upsert trees over the same
//! table/column vocabulary the queries use. Values are bound as parameters
//! typed from the mapped columns.
//!
//! Generated identities come back through a declared variable on products
//! that batch statements; elsewhere the read-back is a second command.

use crate::dialect::Dialect;
use crate::error::{RenderError, TranslationError, TranslationResult};
use crate::expr::{
    AliasGenerator, BlockCommand, ColumnAssignment, ColumnDeclaration, ColumnExpr,
    DeclarationCommand, DeleteCommand, ExistsExpr, Expr, IfCommand, InsertCommand,
    NamedValueExpr, SelectExpr, TableExpr, UpdateCommand, VariableDeclaration, VariableExpr,
};
use crate::mapping::{ColumnSchema, EntityMapping};
use crate::render::{QueryRenderer, RenderedQuery, SqlFormatter};
use crate::types::{Name, Value, ValueType};
use std::cell::Cell;
use std::sync::Arc;
use tracing::debug;

/// Builds command trees for mapped entities
pub struct CommandBuilder<'a> {
    mapping: &'a dyn EntityMapping,
    dialect: &'a dyn Dialect,
    aliases: AliasGenerator,
    next_param: Cell<usize>,
}

/// A mapped column of the entity being written
struct Target {
    member: Name,
    column: Arc<ColumnExpr>,
    schema: ColumnSchema,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(mapping: &'a dyn EntityMapping, dialect: &'a dyn Dialect) -> Self {
        Self {
            mapping,
            dialect,
            aliases: AliasGenerator::new(),
            next_param: Cell::new(0),
        }
    }

    fn table(&self, entity: &str) -> TranslationResult<Arc<TableExpr>> {
        Ok(Arc::new(TableExpr {
            alias: self.aliases.next_alias(),
            entity: entity.into(),
            name: self.mapping.table_name(entity)?,
        }))
    }

    fn targets(&self, entity: &str, table: &TableExpr) -> TranslationResult<Vec<Target>> {
        let mut out = Vec::new();
        for member in self.mapping.mapped_members(entity)? {
            let Some(schema) = self.mapping.column(entity, &member) else {
                continue;
            };
            let db_type = self
                .dialect
                .column_type(schema.kind, schema.db_type.as_deref());
            let db_type = if schema.nullable { db_type } else {
                db_type.not_null()
            };
            out.push(Target {
                column: Arc::new(ColumnExpr {
                    ty: ValueType::Scalar(schema.kind),
                    db_type,
                    alias: table.alias,
                    name: schema.column.clone(),
                }),
                member,
                schema: schema.clone(),
            });
        }
        Ok(out)
    }

    fn param(&self, value: &Value, target: &Target) -> Expr {
        let n = self.next_param.get();
        self.next_param.set(n + 1);
        Expr::NamedValue(Arc::new(NamedValueExpr {
            name: format!("p{n}").into(),
            db_type: Some(target.column.db_type.nullable()),
            value: Expr::constant_of(value.clone(), target.column.ty.clone()),
        }))
    }

    fn member_value<'v>(
        &self,
        entity: &str,
        values: &'v Value,
        member: &str,
    ) -> TranslationResult<&'v Value> {
        values.get(member).ok_or_else(|| {
            TranslationError::invalid(
                "Command",
                format!("'{entity}' value has no key member '{member}'"),
            )
        })
    }

    /// `key = @p AND ...` over the primary key
    fn key_predicate(
        &self,
        entity: &str,
        targets: &[Target],
        values: &Value,
    ) -> TranslationResult<Expr> {
        let mut predicates = Vec::new();
        for t in targets.iter().filter(|t| t.schema.primary_key) {
            let value = self.member_value(entity, values, &t.member)?;
            predicates.push(Expr::Column(t.column.clone()).equal(self.param(value, t)));
        }
        Expr::conjunction(predicates).ok_or_else(|| {
            TranslationError::invalid("Command", format!("'{entity}' has no primary key"))
        })
    }

    /// Insert `values`, reading back generated members
    pub fn insert(&self, entity: &str, values: &Value) -> TranslationResult<Vec<Expr>> {
        let table = self.table(entity)?;
        let targets = self.targets(entity, &table)?;
        let assignments = targets
            .iter()
            .filter(|t| !t.schema.generated)
            .map(|t| ColumnAssignment {
                column: t.column.clone(),
                expr: self.param(values.get(&*t.member).unwrap_or(&Value::Null), t),
            })
            .collect();
        let insert = Expr::Insert(Arc::new(InsertCommand {
            table,
            assignments,
        }));

        let generated: Vec<&Target> = targets.iter().filter(|t| t.schema.generated).collect();
        if generated.is_empty() {
            return Ok(vec![insert]);
        }
        debug!(entity, generated = generated.len(), "insert reads back generated members");
        let mut commands = vec![insert];
        commands.extend(self.generated_read_back(entity, &generated)?);
        if self.dialect.allows_multiple_statements() {
            Ok(vec![Expr::Block(Arc::new(BlockCommand { commands }))])
        } else {
            Ok(commands)
        }
    }

    /// Statements that return the generated members of the last insert
    fn generated_read_back(
        &self,
        entity: &str,
        generated: &[&Target],
    ) -> TranslationResult<Vec<Expr>> {
        let identity = |t: &Target| self.dialect.generated_id_expression(t.column.db_type);
        if !self.dialect.allows_multiple_statements() {
            let columns = generated
                .iter()
                .map(|t| ColumnDeclaration {
                    name: t.column.name.clone(),
                    expr: identity(t),
                    db_type: t.column.db_type,
                })
                .collect();
            return Ok(vec![Expr::select(SelectExpr::new(
                self.aliases.next_alias(),
                columns,
                None,
            ))]);
        }

        let declaration = Expr::Declaration(Arc::new(DeclarationCommand {
            variables: generated
                .iter()
                .map(|t| VariableDeclaration {
                    name: t.member.clone(),
                    db_type: t.column.db_type,
                    expr: identity(t),
                })
                .collect(),
            source: None,
        }));

        // read the row back through the declared variables
        let table = self.table(entity)?;
        let targets = self.targets(entity, &table)?;
        let columns = targets
            .iter()
            .filter(|t| t.schema.generated)
            .map(|t| ColumnDeclaration {
                name: t.column.name.clone(),
                expr: Expr::Column(t.column.clone()),
                db_type: t.column.db_type,
            })
            .collect();
        let predicate = Expr::conjunction(targets.iter().filter(|t| t.schema.generated).map(|t| {
            Expr::Column(t.column.clone()).equal(Expr::Variable(Arc::new(VariableExpr {
                name: t.member.clone(),
                ty: t.column.ty.clone(),
                db_type: t.column.db_type,
            })))
        }));
        let select = SelectExpr::new(self.aliases.next_alias(), columns, Some(Expr::Table(table)))
            .with_where(predicate);
        Ok(vec![declaration, Expr::select(select)])
    }

    /// Update the non-key members present in `values`, matched by key
    pub fn update(&self, entity: &str, values: &Value) -> TranslationResult<Expr> {
        let table = self.table(entity)?;
        let targets = self.targets(entity, &table)?;
        let assignments: Vec<ColumnAssignment> = targets
            .iter()
            .filter(|t| !t.schema.primary_key && !t.schema.generated)
            .filter_map(|t| {
                values.get(&*t.member).map(|v| ColumnAssignment {
                    column: t.column.clone(),
                    expr: self.param(v, t),
                })
            })
            .collect();
        if assignments.is_empty() {
            return Err(TranslationError::invalid(
                "Update",
                format!("no members of '{entity}' to set"),
            ));
        }
        let where_clause = Some(self.key_predicate(entity, &targets, values)?);
        Ok(Expr::Update(Arc::new(UpdateCommand {
            table,
            where_clause,
            assignments,
        })))
    }

    /// Delete the row whose key members appear in `key`
    pub fn delete(&self, entity: &str, key: &Value) -> TranslationResult<Expr> {
        let table = self.table(entity)?;
        let targets = self.targets(entity, &table)?;
        let where_clause = Some(self.key_predicate(entity, &targets, key)?);
        Ok(Expr::Delete(Arc::new(DeleteCommand {
            table,
            where_clause,
        })))
    }

    /// Update when a row with the same key exists, insert otherwise
    pub fn upsert(&self, entity: &str, values: &Value) -> TranslationResult<Expr> {
        if !self.dialect.allows_multiple_statements() {
            return Err(TranslationError::UnsupportedForDialect {
                dialect: self.dialect.name().to_string(),
                capability: "upsert".to_string(),
            });
        }
        let table = self.table(entity)?;
        let targets = self.targets(entity, &table)?;
        let key = self.key_predicate(entity, &targets, values)?;
        let from = Some(Expr::Table(table));
        let existing =
            SelectExpr::new(self.aliases.next_alias(), Vec::new(), from).with_where(Some(key));
        let check = Expr::Exists(Arc::new(ExistsExpr {
            select: Arc::new(existing),
        }));

        let update = self.update(entity, values)?;
        let mut insert = self.insert(entity, values)?;
        let if_false = match insert.len() {
            1 => insert.remove(0),
            _ => Expr::Block(Arc::new(BlockCommand { commands: insert })),
        };
        Ok(Expr::If(Arc::new(IfCommand {
            check,
            if_true: update,
            if_false: Some(if_false),
        })))
    }

    /// Render commands with this builder's dialect
    pub fn render(&self, commands: &[Expr]) -> Result<Vec<RenderedQuery>, RenderError> {
        let formatter = SqlFormatter::new(self.dialect);
        commands.iter().map(|c| formatter.render(c)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{SqlServerDialect, SqliteDialect};
    use crate::testing::northwind;
    use crate::types::ScalarKind;
    use serde_json::json;

    #[test]
    fn test_insert_reads_back_identity_in_one_batch() {
        let mapping = northwind();
        let dialect = SqlServerDialect::new();
        let builder = CommandBuilder::new(&mapping, &dialect);
        let commands = builder
            .insert("Order", &json!({ "CustomerID": "ALFKI", "OrderDate": "2024-01-01" }))
            .unwrap();
        assert_eq!(commands.len(), 1);

        let rendered = builder.render(&commands).unwrap();
        assert_eq!(
            rendered[0].sql,
            "INSERT INTO [Orders]([CustomerID], [OrderDate]) VALUES (@p0, @p1);\n\
             DECLARE @OrderID INT;\n\
             SELECT @OrderID = SCOPE_IDENTITY();\n\
             SELECT t0.[OrderID] FROM [Orders] AS t0 WHERE (t0.[OrderID] = @OrderID)"
        );
        assert_eq!(rendered[0].params.len(), 2);
        assert_eq!(rendered[0].params[0].value, Expr::constant("ALFKI"));
    }

    #[test]
    fn test_single_statement_insert_uses_a_second_command() {
        let mapping = northwind();
        let dialect = SqliteDialect::new();
        let builder = CommandBuilder::new(&mapping, &dialect);
        let commands = builder.insert("Order", &json!({ "CustomerID": "ALFKI" })).unwrap();

        let rendered = builder.render(&commands).unwrap();
        assert_eq!(rendered.len(), 2);
        assert_eq!(rendered[1].sql, "SELECT last_insert_rowid() AS \"OrderID\"");
        assert_eq!(
            rendered[0].param("p1").map(|p| p.value.clone()),
            Some(Expr::constant_of(Value::Null, ValueType::Scalar(ScalarKind::DateTime)))
        );
    }

    #[test]
    fn test_update_and_delete_match_by_key() {
        let mapping = northwind();
        let dialect = SqlServerDialect::new();
        let builder = CommandBuilder::new(&mapping, &dialect);

        let update = builder
            .update("Customer", &json!({ "CustomerID": "ALFKI", "City": "Berlin" }))
            .unwrap();
        let rendered = builder.render(&[update]).unwrap();
        assert_eq!(
            rendered[0].sql,
            "UPDATE [Customers] SET [City] = @p0 WHERE ([CustomerID] = @p1)"
        );

        let delete = builder.delete("OrderLine", &json!({ "OrderID": 1, "ProductID": 7 })).unwrap();
        let rendered = builder.render(&[delete]).unwrap();
        assert_eq!(
            rendered[0].sql,
            "DELETE FROM [OrderLines] WHERE (([OrderID] = @p2) AND ([ProductID] = @p3))"
        );

        let err = builder.delete("OrderLine", &json!({ "OrderID": 1 })).unwrap_err();
        assert!(matches!(err, TranslationError::InvalidTree { node: "Command", .. }));
    }

    #[test]
    fn test_upsert_needs_batches() {
        let mapping = northwind();
        let server = SqlServerDialect::new();
        let builder = CommandBuilder::new(&mapping, &server);
        let upsert = builder
            .upsert("Customer", &json!({ "CustomerID": "ALFKI", "CompanyName": "Alfreds" }))
            .unwrap();
        let sql = builder.render(&[upsert]).unwrap().remove(0).sql;
        assert!(sql.starts_with(
            "IF EXISTS(SELECT NULL FROM [Customers] AS t0 WHERE (t0.[CustomerID] = @p0))"
        ));
        assert!(sql.contains("UPDATE [Customers] SET [CompanyName] = @p1"));
        assert!(sql.contains("ELSE\nBEGIN\nINSERT INTO [Customers]"));

        let sqlite = SqliteDialect::new();
        let builder = CommandBuilder::new(&mapping, &sqlite);
        assert!(matches!(
            builder.upsert("Customer", &json!({ "CustomerID": "ALFKI" })),
            Err(TranslationError::UnsupportedForDialect { .. })
        ));
    }
}
