//! Validation transform.
//!
//! Checks that a rewritten tree is well-formed before rendering:
//!
//! * column names are unique within each select
//! * every column reference names an alias declared by an enclosing `FROM`,
//!   directly or as a correlated outer reference
//! * a reference to a select's alias names a column that select declares

use crate::error::{TranslationError, TranslationResult};
use crate::expr::util::declared_aliases;
use crate::expr::visit::{walk, Visitor};
use crate::expr::{Expr, SelectExpr, TableAlias};
use crate::transform::{QueryTransform, TransformContext};
use crate::types::Name;
use std::collections::{HashMap, HashSet};

/// Validation transform that checks alias scoping and column uniqueness
pub struct ValidateTransform;

impl QueryTransform for ValidateTransform {
    fn name(&self) -> &'static str {
        "validate"
    }

    fn transform(&self, expr: Expr, _cx: &TransformContext<'_>) -> TranslationResult<Expr> {
        validate(&expr)?;
        Ok(expr)
    }
}

/// Check a tree without going through a pipeline
pub fn validate(expr: &Expr) -> TranslationResult<()> {
    let mut validator = Validator {
        scopes: Vec::new(),
        columns: HashMap::new(),
        error: None,
    };
    validator.visit(expr);
    match validator.error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

struct Validator {
    scopes: Vec<HashSet<TableAlias>>,
    /// Column names declared by each select seen so far
    columns: HashMap<TableAlias, HashSet<Name>>,
    error: Option<TranslationError>,
}

impl Validator {
    fn fail(&mut self, node: &'static str, detail: String) {
        if self.error.is_none() {
            self.error = Some(TranslationError::invalid(node, detail));
        }
    }

    fn in_scope(&mut self, scope: HashSet<TableAlias>, expr: &Expr) {
        self.scopes.push(scope);
        self.visit(expr);
        self.scopes.pop();
    }

    fn declare(&mut self, select: &SelectExpr) {
        let names = select.columns.iter().map(|c| c.name.clone()).collect();
        self.columns.insert(select.alias, names);
    }

    /// Record the columns of the selects a `FROM` source declares
    fn declare_sources(&mut self, source: &Expr) {
        match source {
            Expr::Select(s) => self.declare(s),
            Expr::Join(j) => {
                self.declare_sources(&j.left);
                self.declare_sources(&j.right);
            }
            _ => {}
        }
    }

    fn check_select(&mut self, select: &SelectExpr) {
        let mut names = HashSet::new();
        for column in &select.columns {
            if !names.insert(&column.name) {
                self.fail(
                    "Select",
                    format!("{} declares column '{}' twice", select.alias, column.name),
                );
            }
        }
    }
}

impl Visitor for Validator {
    fn visit(&mut self, expr: &Expr) {
        if self.error.is_some() {
            return;
        }
        match expr {
            Expr::Column(c) => {
                if !self.scopes.iter().any(|s| s.contains(&c.alias)) {
                    self.fail(
                        "Column",
                        format!("'{}' references undeclared alias {}", c.name, c.alias),
                    );
                    return;
                }
                let undeclared = self
                    .columns
                    .get(&c.alias)
                    .is_some_and(|names| !names.contains(&c.name));
                if undeclared {
                    self.fail(
                        "Column",
                        format!("'{}' is not a column of {}", c.name, c.alias),
                    );
                }
            }
            Expr::Select(s) => {
                self.check_select(s);
                if let Some(from) = &s.from {
                    self.declare_sources(from);
                }
                let scope = s.from.as_ref().map(declared_aliases).unwrap_or_default();
                self.scopes.push(scope);
                walk(self, expr);
                self.scopes.pop();
            }
            Expr::Projection(p) => {
                self.visit(&Expr::Select(p.select.clone()));
                self.declare(&p.select);
                self.in_scope(HashSet::from([p.select.alias]), &p.projector);
            }
            Expr::ClientJoin(c) => {
                c.outer_key.iter().for_each(|k| self.visit(k));
                self.visit(&Expr::Projection(c.projection.clone()));
                let inner = HashSet::from([c.projection.select.alias]);
                for key in &c.inner_key {
                    self.in_scope(inner.clone(), key);
                }
            }
            Expr::Grouping(g) => {
                self.visit(&g.key);
                self.visit(&g.elements);
            }
            Expr::Update(u) => {
                let scope = HashSet::from([u.table.alias]);
                for assignment in &u.assignments {
                    self.in_scope(scope.clone(), &assignment.expr);
                }
                if let Some(w) = &u.where_clause {
                    self.in_scope(scope, w);
                }
            }
            Expr::Delete(d) => {
                if let Some(w) = &d.where_clause {
                    self.in_scope(HashSet::from([d.table.alias]), w);
                }
            }
            Expr::Declaration(d) => {
                if let Some(source) = &d.source {
                    self.visit(&Expr::Select(source.clone()));
                    self.declare(source);
                    let scope = HashSet::from([source.alias]);
                    for variable in &d.variables {
                        self.in_scope(scope.clone(), &variable.expr);
                    }
                } else {
                    walk(self, expr);
                }
            }
            _ => walk(self, expr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{AliasGenerator, BinaryOp, ColumnDeclaration, ProjectionExpr, TableExpr};
    use crate::types::{QueryType, SqlType, ValueType};
    use std::sync::Arc;

    fn int() -> QueryType {
        QueryType::new(SqlType::Int)
    }

    fn col(alias: TableAlias, name: &str) -> Expr {
        Expr::column(alias, name.into(), ValueType::Unknown, int())
    }

    fn table(alias: TableAlias) -> Expr {
        Expr::Table(Arc::new(TableExpr {
            alias,
            entity: "Order".into(),
            name: "Orders".into(),
        }))
    }

    fn decl(name: &str, expr: Expr) -> ColumnDeclaration {
        ColumnDeclaration {
            name: name.into(),
            expr,
            db_type: int(),
        }
    }

    /// `SELECT OrderID` from the table aliased `t`
    fn order_ids(gen: &AliasGenerator, t: TableAlias) -> SelectExpr {
        SelectExpr::new(gen.next_alias(), vec![decl("OrderID", col(t, "OrderID"))], Some(table(t)))
    }

    #[test]
    fn test_validate_scoped_projection() {
        let gen = AliasGenerator::new();
        let t = gen.next_alias();
        let select = order_ids(&gen, t);
        let projector = col(select.alias, "OrderID");
        let tree = Expr::projection(ProjectionExpr::new(select, projector));

        assert!(validate(&tree).is_ok());
    }

    #[test]
    fn test_validate_rejects_dangling_reference() {
        let gen = AliasGenerator::new();
        let t = gen.next_alias();
        let hidden = gen.next_alias();
        let dangling = Expr::binary(BinaryOp::Eq, col(hidden, "x"), Expr::constant(1));
        let select = order_ids(&gen, t).with_where(Some(dangling));

        let err = validate(&Expr::select(select)).unwrap_err();
        assert!(matches!(err, TranslationError::InvalidTree { node: "Column", .. }));
    }

    #[test]
    fn test_validate_rejects_column_missing_from_select() {
        let gen = AliasGenerator::new();
        let t = gen.next_alias();
        let inner = order_ids(&gen, t);
        let i = inner.alias;
        let outer = |name: &str| {
            SelectExpr::new(
                gen.next_alias(),
                vec![decl("OrderID", col(i, name))],
                Some(Expr::select(inner.clone())),
            )
        };

        assert!(validate(&Expr::select(outer("OrderID"))).is_ok());
        let err = validate(&Expr::select(outer("CustomerID"))).unwrap_err();
        assert!(matches!(err, TranslationError::InvalidTree { node: "Column", .. }));
    }

    #[test]
    fn test_validate_rejects_projector_reading_missing_column() {
        let gen = AliasGenerator::new();
        let t = gen.next_alias();
        let select = order_ids(&gen, t);
        let projector = col(select.alias, "OrderDate");
        let tree = Expr::projection(ProjectionExpr::new(select, projector));

        let err = validate(&tree).unwrap_err();
        assert!(matches!(err, TranslationError::InvalidTree { node: "Column", .. }));
    }

    #[test]
    fn test_validate_rejects_duplicate_column_names() {
        let gen = AliasGenerator::new();
        let t = gen.next_alias();
        let select = SelectExpr::new(
            gen.next_alias(),
            vec![decl("a", col(t, "a")), decl("a", col(t, "b"))],
            Some(table(t)),
        );

        let err = validate(&Expr::select(select)).unwrap_err();
        assert!(matches!(err, TranslationError::InvalidTree { node: "Select", .. }));
    }
}
