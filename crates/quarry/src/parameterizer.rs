//! Command parameters.
//!
//! Client constants inside selects become [`NamedValueExpr`]s named `p0`,
//! `p1`, ... in order of first appearance; equal values of equal type share
//! one parameter. Some constants stay literal because they shape the SQL
//! rather than feed it:
//!
//! * `NULL` and boolean constants
//! * `Skip` / `Take` counts, which paging rewrites compute with
//! * a constant that is a column declaration on its own (outer-join tests)
//!
//! Constants in client projectors are evaluated by the materializer and are
//! left alone.

use crate::error::{TranslationError, TranslationResult};
use crate::expr::rewrite::Rewriter;
use crate::expr::{
    BinaryExpr, BinaryOp, ColumnExpr, ConstantExpr, Expr, NamedValueExpr, ProjectionExpr,
};
use crate::transform::TransformContext;
use crate::types::{QueryType, TypeSystem, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Replace client constants in `expr`'s selects by named parameters
pub fn parameterize(expr: &Expr, cx: &TransformContext<'_>) -> TranslationResult<Expr> {
    let mut parameterizer = Parameterizer {
        types: cx.dialect.type_system(),
        in_select: false,
        literal: Vec::new(),
        values: HashMap::new(),
        next: 0,
    };
    parameterizer.rewrite(expr)
}

struct Parameterizer<'a> {
    types: &'a dyn TypeSystem,
    /// Whether the node being visited is rendered to SQL
    in_select: bool,
    /// Nodes of the enclosing selects that must stay literal
    literal: Vec<Expr>,
    values: HashMap<(String, Option<QueryType>), Expr>,
    next: usize,
}

impl Parameterizer<'_> {
    fn is_literal(&self, constant: &ConstantExpr) -> bool {
        matches!(constant.value, Value::Null | Value::Bool(_))
    }

    fn named(
        &mut self,
        original: &Expr,
        constant: &ConstantExpr,
        db_type: Option<QueryType>,
    ) -> TranslationResult<Expr> {
        let db_type = match db_type.or_else(|| self.types.type_for(&constant.ty)) {
            Some(ty) => Some(ty),
            None if matches!(constant.value, Value::Array(_) | Value::Object(_)) => {
                return Err(TranslationError::AmbiguousParameterType {
                    name: format!("p{}", self.next),
                })
            }
            None => None,
        };
        let key = (constant.value.to_string(), db_type);
        if let Some(existing) = self.values.get(&key) {
            return Ok(existing.clone());
        }
        let name = format!("p{}", self.next);
        self.next += 1;
        trace!(parameter = %name, "parameterized constant");
        let named = Expr::NamedValue(Arc::new(NamedValueExpr {
            name: name.into(),
            db_type,
            value: original.clone(),
        }));
        self.values.insert(key, named.clone());
        Ok(named)
    }

    /// `column op constant`: the parameter takes the column's type
    fn comparison(&mut self, expr: &Expr) -> TranslationResult<Option<Expr>> {
        let Expr::Binary(b) = expr else {
            return Ok(None);
        };
        if !b.op.is_comparison() && b.op != BinaryOp::Coalesce {
            return Ok(None);
        }
        if let Some(typed) = typed_argument(b) {
            return Ok(Some(typed));
        }
        let (column, constant, constant_on_left) = match (&b.left, &b.right) {
            (Expr::Column(c), Expr::Constant(k)) => (c, k, false),
            (Expr::Constant(k), Expr::Column(c)) => (c, k, true),
            _ => return Ok(None),
        };
        if self.is_literal(constant) {
            return Ok(None);
        }
        let db_type = Some(column.db_type.nullable());
        if constant_on_left {
            let named = self.named(&b.left, constant, db_type)?;
            Ok(Some(Expr::binary(b.op, named, b.right.clone())))
        } else {
            let named = self.named(&b.right, constant, db_type)?;
            Ok(Some(Expr::binary(b.op, b.left.clone(), named)))
        }
    }
}

/// `column op value` over an argument that was named without a type
fn typed_argument(b: &BinaryExpr) -> Option<Expr> {
    let typed = |n: &NamedValueExpr, c: &ColumnExpr| {
        Expr::NamedValue(Arc::new(NamedValueExpr {
            name: n.name.clone(),
            db_type: Some(c.db_type.nullable()),
            value: n.value.clone(),
        }))
    };
    match (&b.left, &b.right) {
        (Expr::Column(c), Expr::NamedValue(n)) if n.db_type.is_none() => {
            Some(Expr::binary(b.op, b.left.clone(), typed(n, c)))
        }
        (Expr::NamedValue(n), Expr::Column(c)) if n.db_type.is_none() => {
            Some(Expr::binary(b.op, typed(n, c), b.right.clone()))
        }
        _ => None,
    }
}

impl Rewriter for Parameterizer<'_> {
    fn rewrite(&mut self, expr: &Expr) -> TranslationResult<Expr> {
        if self.literal.iter().any(|l| l.same(expr)) {
            return Ok(expr.clone());
        }
        match expr {
            Expr::Projection(p) => {
                let outer = self.in_select;
                self.in_select = true;
                let select = self.rewrite(&Expr::Select(p.select.clone()));
                self.in_select = false;
                let projector = self.rewrite(&p.projector);
                self.in_select = outer;
                let (select, projector) = (select?, projector?);
                let Expr::Select(select) = select else {
                    return Err(TranslationError::invalid(
                        "Projection",
                        "select rewritten to another node",
                    ));
                };
                if Arc::ptr_eq(&select, &p.select) && projector.same(&p.projector) {
                    return Ok(expr.clone());
                }
                Ok(Expr::projection(ProjectionExpr {
                    select,
                    projector,
                    aggregator: p.aggregator,
                }))
            }
            Expr::Select(s) => {
                let outer = self.in_select;
                self.in_select = true;
                let marked = self.literal.len();
                self.literal.extend(s.skip.iter().chain(s.take.iter()).cloned());
                self.literal.extend(
                    s.columns
                        .iter()
                        .filter(|c| matches!(c.expr, Expr::Constant(_)))
                        .map(|c| c.expr.clone()),
                );
                let out = self.rewrite_children(expr);
                self.literal.truncate(marked);
                self.in_select = outer;
                out
            }
            Expr::Constant(c) if self.in_select && !self.is_literal(c) => self.named(expr, c, None),
            Expr::NamedValue(_) => Ok(expr.clone()),
            Expr::Binary(_) if self.in_select => match self.comparison(expr)? {
                Some(rewritten) => Ok(rewritten),
                None => self.rewrite_children(expr),
            },
            _ => self.rewrite_children(expr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::SqlServerDialect;
    use crate::expr::visit::for_each_node;
    use crate::expr::{AliasGenerator, ColumnDeclaration, SelectExpr, TableAlias, TableExpr};
    use crate::types::{ScalarKind, SqlType, ValueType};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn text(alias: TableAlias, name: &str) -> Expr {
        Expr::column(
            alias,
            name.into(),
            ValueType::Scalar(ScalarKind::Text),
            QueryType::new(SqlType::NVarChar).with_length(15).not_null(),
        )
    }

    fn customers(gen: &AliasGenerator, predicate: impl FnOnce(TableAlias) -> Expr) -> SelectExpr {
        let t = gen.next_alias();
        let from = Expr::Table(Arc::new(TableExpr {
            alias: t,
            entity: "Customer".into(),
            name: "Customers".into(),
        }));
        SelectExpr::new(
            gen.next_alias(),
            vec![ColumnDeclaration {
                name: "City".into(),
                expr: text(t, "City"),
                db_type: QueryType::new(SqlType::NVarChar),
            }],
            Some(from),
        )
        .with_where(Some(predicate(t)))
    }

    fn run(expr: &Expr) -> Expr {
        let gen = AliasGenerator::new();
        let dialect = SqlServerDialect::new();
        let cx = TransformContext::new(&gen, &dialect);
        parameterize(expr, &cx).unwrap()
    }

    fn parameters(expr: &Expr) -> Vec<(String, Option<QueryType>)> {
        let mut out = Vec::new();
        for_each_node(expr, &mut |e| {
            if let Expr::NamedValue(n) = e {
                out.push((n.name.to_string(), n.db_type));
            }
        });
        out
    }

    #[test]
    fn test_comparison_parameter_takes_column_type() {
        let gen = AliasGenerator::new();
        let select = customers(&gen, |t| text(t, "City").equal(Expr::constant("London")));
        let out = run(&Expr::select(select));

        let params = parameters(&out);
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].0, "p0");
        assert_eq!(params[0].1, Some(QueryType::new(SqlType::NVarChar).with_length(15)));
    }

    #[test]
    fn test_equal_values_share_a_parameter() {
        let gen = AliasGenerator::new();
        let select = customers(&gen, |t| {
            text(t, "City")
                .equal(Expr::constant("London"))
                .or(text(t, "Country").equal(Expr::constant("London")))
                .or(text(t, "Phone").equal(Expr::constant("Paris")))
        });
        let out = run(&Expr::select(select));
        let names: BTreeSet<String> = parameters(&out).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, BTreeSet::from(["p0".to_string(), "p1".to_string()]));
    }

    #[test]
    fn test_paging_null_and_booleans_stay_literal() {
        let gen = AliasGenerator::new();
        let select = customers(&gen, |t| {
            Expr::is_null_test(text(t, "Region"))
                .or(Expr::constant(true).equal(Expr::constant(false)))
        })
        .with_skip(Some(Expr::constant(5)))
        .with_take(Some(Expr::constant(10)));
        let out = run(&Expr::select(select));

        assert!(parameters(&out).is_empty());
        let Expr::Select(s) = &out else {
            panic!("expected a select")
        };
        assert_eq!(s.skip.as_ref().and_then(Expr::as_constant), Some(&json!(5)));
    }

    #[test]
    fn test_constant_column_stays_literal_beside_equal_filter() {
        let gen = AliasGenerator::new();
        let mut select = customers(&gen, |t| text(t, "City").equal(Expr::constant("London")));
        select.columns.push(ColumnDeclaration {
            name: "Tag".into(),
            expr: Expr::constant("London"),
            db_type: QueryType::new(SqlType::NVarChar),
        });
        let out = run(&Expr::select(select));

        let Expr::Select(s) = &out else {
            panic!("expected a select")
        };
        assert_eq!(s.columns[1].expr.as_constant(), Some(&json!("London")));
        assert_eq!(parameters(&out).len(), 1);
    }

    #[test]
    fn test_projector_constants_are_left_to_the_client() {
        let gen = AliasGenerator::new();
        let select = customers(&gen, |t| text(t, "City").equal(Expr::constant("London")));
        let alias = select.alias;
        let projector = Expr::record([("City", text(alias, "City")), ("Tag", Expr::constant("x"))]);
        let tree = Expr::projection(ProjectionExpr::new(select, projector));
        let out = run(&tree);

        let Expr::Projection(p) = &out else {
            panic!("expected a projection")
        };
        let Expr::New(record) = &p.projector else {
            panic!("expected a record")
        };
        assert!(matches!(record.field("Tag"), Some(Expr::Constant(_))));
        assert_eq!(parameters(&out).len(), 1);
    }

    #[test]
    fn test_untyped_argument_takes_column_type() {
        let gen = AliasGenerator::new();
        let argument = Expr::NamedValue(Arc::new(NamedValueExpr {
            name: "a0".into(),
            db_type: None,
            value: Expr::constant("London"),
        }));
        let select = customers(&gen, |t| text(t, "City").equal(argument));
        let out = run(&Expr::select(select));

        assert_eq!(
            parameters(&out),
            vec![("a0".to_string(), Some(QueryType::new(SqlType::NVarChar).with_length(15)))]
        );
    }

    #[test]
    fn test_unchanged_tree_is_returned_as_is() {
        let gen = AliasGenerator::new();
        let select = customers(&gen, |t| Expr::is_null_test(text(t, "City")));
        let tree = Expr::select(select);
        assert!(run(&tree).same(&tree));
    }
}
