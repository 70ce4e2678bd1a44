//! Column projection.
//!
//! Splits a client projector into the columns a new select must return and
//! the expression that rebuilds the client value from those columns.
//!
//! Two passes over the same tree: the nominator marks, bottom-up, every
//! subexpression that can be computed by the server, and the projector then
//! replaces each outermost candidate with a column of the new select. Column
//! references to aliases outside the bound set are correlated references and
//! are left as they are.

use crate::dialect::Dialect;
use crate::error::TranslationResult;
use crate::expr::rewrite::{replace_nodes, Rewriter};
use crate::expr::util::{column_key, unique_column_name, ColumnKey};
use crate::expr::{ColumnDeclaration, ColumnExpr, Expr, GroupingExpr, TableAlias};
use crate::types::{QueryType, ScalarKind};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Result of projecting an expression through a new select
#[derive(Debug, Clone)]
pub struct ProjectedColumns {
    pub projector: Expr,
    pub columns: Vec<ColumnDeclaration>,
}

/// Nodes the server must produce as columns wherever they appear
pub fn must_be_column(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Column(_)
            | Expr::Aggregate(_)
            | Expr::Scalar(_)
            | Expr::Exists(_)
            | Expr::In(_)
            | Expr::RowNumber(_)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Nomination {
    Candidate,
    /// Constants: computable anywhere, never a column on their own
    Neutral,
    Blocked,
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnProjector<'a> {
    dialect: &'a dyn Dialect,
    server_affinity: bool,
}

impl<'a> ColumnProjector<'a> {
    pub fn new(dialect: &'a dyn Dialect, server_affinity: bool) -> Self {
        Self {
            dialect,
            server_affinity,
        }
    }

    /// Whether a non-mandatory node may become a column
    fn can_be_column(&self, expr: &Expr) -> bool {
        if must_be_column(expr) {
            return true;
        }
        if !self.server_affinity {
            return false;
        }
        let computed = matches!(
            expr,
            Expr::Unary(_)
                | Expr::Binary(_)
                | Expr::Conditional(_)
                | Expr::Function(_)
                | Expr::IsNull(_)
                | Expr::Between(_)
        );
        computed && self.dialect.is_scalar_type(&expr.value_type())
    }

    /// Project `expr` into a select aliased `new_alias` whose source declares
    /// `bound`, appending to `existing` columns.
    pub fn project(
        &self,
        expr: &Expr,
        existing: &[ColumnDeclaration],
        new_alias: TableAlias,
        bound: &HashSet<TableAlias>,
    ) -> TranslationResult<ProjectedColumns> {
        let mut nominator = Nominator {
            projector: self,
            candidates: Vec::new(),
        };
        nominator.nominate(expr);

        let mut projector = Projector {
            dialect: self.dialect,
            candidates: &nominator.candidates,
            columns: existing.to_vec(),
            map: HashMap::new(),
            new_alias,
            bound,
        };
        let projected = projector.rewrite(expr)?;
        Ok(ProjectedColumns {
            projector: projected,
            columns: projector.columns,
        })
    }
}

struct Nominator<'p, 'a> {
    projector: &'p ColumnProjector<'a>,
    /// Nomination depends only on a node's subtree, so a shared allocation
    /// is a candidate wherever it appears
    candidates: Vec<Expr>,
}

impl Nominator<'_, '_> {
    fn nominate(&mut self, expr: &Expr) -> Nomination {
        if must_be_column(expr) {
            self.candidates.push(expr.clone());
            return Nomination::Candidate;
        }
        match expr {
            Expr::Constant(_) | Expr::NamedValue(_) => return Nomination::Neutral,
            // Client-side structures: only their correlated columns matter
            Expr::Projection(_) | Expr::ClientJoin(_) | Expr::Lambda(_) | Expr::Sequence(_) => {
                return Nomination::Blocked
            }
            Expr::Grouping(g) => {
                self.nominate(&g.key);
                return Nomination::Blocked;
            }
            _ => {}
        }

        let mut blocked = false;
        expr.for_each_child(&mut |child| {
            if self.nominate(child) == Nomination::Blocked {
                blocked = true;
            }
        });

        if !blocked && self.projector.can_be_column(expr) {
            self.candidates.push(expr.clone());
            Nomination::Candidate
        } else {
            Nomination::Blocked
        }
    }
}

struct Projector<'a> {
    dialect: &'a dyn Dialect,
    candidates: &'a [Expr],
    columns: Vec<ColumnDeclaration>,
    map: HashMap<ColumnKey, Expr>,
    new_alias: TableAlias,
    bound: &'a HashSet<TableAlias>,
}

impl Projector<'_> {
    fn reference(&self, index: usize) -> Expr {
        let decl = &self.columns[index];
        Expr::column(
            self.new_alias,
            decl.name.clone(),
            decl.expr.value_type(),
            decl.db_type,
        )
    }

    fn next_column_name(&self) -> Arc<str> {
        (0..)
            .map(|i| format!("c{i}"))
            .find(|n| !self.columns.iter().any(|c| &*c.name == n.as_str()))
            .map(Arc::from)
            .unwrap_or_else(|| Arc::from("c"))
    }

    fn project_column(&mut self, column: &ColumnExpr, original: &Expr) -> Expr {
        let key = column_key(column);
        if let Some(mapped) = self.map.get(&key) {
            return mapped.clone();
        }
        let existing = self.columns.iter().position(|c| {
            c.expr
                .as_column()
                .is_some_and(|e| e.alias == column.alias && e.name == column.name)
        });
        if let Some(index) = existing {
            let mapped = self.reference(index);
            self.map.insert(key, mapped.clone());
            return mapped;
        }
        if !self.bound.contains(&column.alias) {
            return original.clone();
        }
        let name = unique_column_name(&self.columns, &column.name);
        self.columns.push(ColumnDeclaration {
            name,
            expr: original.clone(),
            db_type: column.db_type,
        });
        let mapped = self.reference(self.columns.len() - 1);
        self.map.insert(key, mapped.clone());
        mapped
    }

    fn project_candidate(&mut self, expr: &Expr) -> Expr {
        if let Expr::Column(column) = expr {
            return self.project_column(column, expr);
        }
        if let Some(index) = self.columns.iter().position(|c| &c.expr == expr) {
            return self.reference(index);
        }
        let types = self.dialect.type_system();
        let db_type: QueryType = expr
            .query_type(types)
            .unwrap_or_else(|| types.column_type(ScalarKind::Text));
        let name = self.next_column_name();
        self.columns.push(ColumnDeclaration {
            name,
            expr: expr.clone(),
            db_type,
        });
        self.reference(self.columns.len() - 1)
    }

    /// Map correlated references inside a nested client structure
    fn remap_correlated(&mut self, expr: &Expr) -> TranslationResult<Expr> {
        replace_nodes(expr, &mut |node| match node {
            Expr::Column(c) if self.bound.contains(&c.alias) => Some(self.project_column(c, node)),
            _ => None,
        })
    }
}

impl Rewriter for Projector<'_> {
    fn rewrite(&mut self, expr: &Expr) -> TranslationResult<Expr> {
        if self.candidates.iter().any(|c| c.same(expr)) {
            return Ok(self.project_candidate(expr));
        }
        match expr {
            Expr::Projection(_) | Expr::ClientJoin(_) => self.remap_correlated(expr),
            Expr::Grouping(g) => {
                let key = self.rewrite(&g.key)?;
                let elements = self.remap_correlated(&g.elements)?;
                if key.same(&g.key) && elements.same(&g.elements) {
                    return Ok(expr.clone());
                }
                Ok(Expr::Grouping(Arc::new(GroupingExpr {
                    key,
                    elements,
                    key_source: g.key_source.clone(),
                    element_source: g.element_source.clone(),
                })))
            }
            _ => self.rewrite_children(expr),
        }
    }
}
