//! Structural rewriting.
//!
//! [`Expr::map_children`] rebuilds a node from rewritten children and hands
//! back the original when every child came back unchanged, so a pass that
//! finds nothing to do returns the identical tree.

use super::*;
use crate::error::{TranslationError, TranslationResult};

type ChildFn<'a> = dyn FnMut(&Expr) -> TranslationResult<Expr> + 'a;

struct Mapper<'f, 'a> {
    f: &'f mut ChildFn<'a>,
    changed: bool,
}

impl Mapper<'_, '_> {
    fn expr(&mut self, e: &Expr) -> TranslationResult<Expr> {
        let out = (self.f)(e)?;
        if !out.same(e) {
            self.changed = true;
        }
        Ok(out)
    }

    fn opt(&mut self, e: &Option<Expr>) -> TranslationResult<Option<Expr>> {
        e.as_ref().map(|e| self.expr(e)).transpose()
    }

    fn list(&mut self, es: &[Expr]) -> TranslationResult<Vec<Expr>> {
        es.iter().map(|e| self.expr(e)).collect()
    }

    fn orders(&mut self, os: &[OrderExpr]) -> TranslationResult<Vec<OrderExpr>> {
        os.iter()
            .map(|o| Ok(OrderExpr::new(o.direction, self.expr(&o.expr)?)))
            .collect()
    }

    fn lambda(&mut self, l: &Arc<LambdaExpr>) -> TranslationResult<Arc<LambdaExpr>> {
        let body = self.expr(&l.body)?;
        if body.same(&l.body) {
            return Ok(l.clone());
        }
        Ok(Arc::new(LambdaExpr {
            params: l.params.clone(),
            body,
        }))
    }

    fn opt_lambda(
        &mut self,
        l: &Option<Arc<LambdaExpr>>,
    ) -> TranslationResult<Option<Arc<LambdaExpr>>> {
        l.as_ref().map(|l| self.lambda(l)).transpose()
    }

    /// Map an embedded select as a whole node
    fn select(&mut self, s: &Arc<SelectExpr>) -> TranslationResult<Arc<SelectExpr>> {
        match self.expr(&Expr::Select(s.clone()))? {
            Expr::Select(out) => Ok(out),
            other => Err(TranslationError::invalid(
                "Select",
                format!("embedded select rewritten to {}", other.kind_name()),
            )),
        }
    }

    fn projection(&mut self, p: &Arc<ProjectionExpr>) -> TranslationResult<Arc<ProjectionExpr>> {
        match self.expr(&Expr::Projection(p.clone()))? {
            Expr::Projection(out) => Ok(out),
            other => Err(TranslationError::invalid(
                "Projection",
                format!("embedded projection rewritten to {}", other.kind_name()),
            )),
        }
    }

    fn assignments(&mut self, a: &[ColumnAssignment]) -> TranslationResult<Vec<ColumnAssignment>> {
        a.iter()
            .map(|a| {
                Ok(ColumnAssignment {
                    column: a.column.clone(),
                    expr: self.expr(&a.expr)?,
                })
            })
            .collect()
    }
}

impl Expr {
    /// Rebuild this node with every direct child replaced by `f(child)`.
    ///
    /// Selects embedded in `Scalar`, `Exists`, `In`, `Projection` and
    /// `Declaration` are passed to `f` wrapped as [`Expr::Select`] and must
    /// come back as selects.
    pub fn map_children(&self, f: &mut ChildFn<'_>) -> TranslationResult<Expr> {
        let mut m = Mapper { f, changed: false };
        let out = match self {
            Expr::Constant(_)
            | Expr::Parameter(_)
            | Expr::Table(_)
            | Expr::Column(_)
            | Expr::Variable(_) => return Ok(self.clone()),
            Expr::Member(x) => {
                let expr = m.expr(&x.expr)?;
                Expr::Member(Arc::new(MemberExpr {
                    expr,
                    member: x.member.clone(),
                }))
            }
            Expr::Unary(x) => {
                let operand = m.expr(&x.operand)?;
                Expr::unary(x.op, operand)
            }
            Expr::Binary(x) => {
                let left = m.expr(&x.left)?;
                let right = m.expr(&x.right)?;
                Expr::binary(x.op, left, right)
            }
            Expr::Conditional(x) => {
                let test = m.expr(&x.test)?;
                let if_true = m.expr(&x.if_true)?;
                let if_false = m.expr(&x.if_false)?;
                Expr::Conditional(Arc::new(ConditionalExpr {
                    test,
                    if_true,
                    if_false,
                }))
            }
            Expr::New(x) => {
                let fields = x
                    .fields
                    .iter()
                    .map(|(n, e)| Ok((n.clone(), m.expr(e)?)))
                    .collect::<TranslationResult<Vec<_>>>()?;
                Expr::New(Arc::new(NewExpr {
                    kind: x.kind.clone(),
                    fields,
                }))
            }
            Expr::Function(x) => {
                let args = m.list(&x.args)?;
                Expr::Function(Arc::new(FunctionExpr {
                    function: x.function,
                    ty: x.ty.clone(),
                    args,
                }))
            }
            Expr::Lambda(x) => Expr::Lambda(m.lambda(x)?),
            Expr::Sequence(op) => Expr::Sequence(Arc::new(map_sequence(op, &mut m)?)),
            Expr::Select(s) => Expr::Select(Arc::new(map_select(s, &mut m)?)),
            Expr::Join(x) => {
                let left = m.expr(&x.left)?;
                let right = m.expr(&x.right)?;
                let condition = m.opt(&x.condition)?;
                Expr::join(x.kind, left, right, condition)
            }
            Expr::Scalar(x) => {
                let select = m.select(&x.select)?;
                Expr::Scalar(Arc::new(ScalarExpr {
                    ty: x.ty.clone(),
                    select,
                }))
            }
            Expr::Exists(x) => {
                let select = m.select(&x.select)?;
                Expr::Exists(Arc::new(ExistsExpr { select }))
            }
            Expr::In(x) => {
                let expr = m.expr(&x.expr)?;
                let values = match &x.values {
                    InValues::Select(s) => InValues::Select(m.select(s)?),
                    InValues::List(vs) => InValues::List(m.list(vs)?),
                };
                Expr::In(Arc::new(InExpr { expr, values }))
            }
            Expr::Aggregate(x) => {
                let argument = m.opt(&x.argument)?;
                Expr::aggregate(x.kind, x.ty.clone(), argument, x.distinct)
            }
            Expr::IsNull(x) => Expr::is_null_test(m.expr(&x.expr)?),
            Expr::Between(x) => {
                let expr = m.expr(&x.expr)?;
                let lower = m.expr(&x.lower)?;
                let upper = m.expr(&x.upper)?;
                Expr::Between(Arc::new(BetweenExpr { expr, lower, upper }))
            }
            Expr::RowNumber(x) => {
                let order_by = m.orders(&x.order_by)?;
                Expr::RowNumber(Arc::new(RowNumberExpr { order_by }))
            }
            Expr::NamedValue(x) => {
                let value = m.expr(&x.value)?;
                Expr::NamedValue(Arc::new(NamedValueExpr {
                    name: x.name.clone(),
                    db_type: x.db_type,
                    value,
                }))
            }
            Expr::Entity(x) => {
                let expr = m.expr(&x.expr)?;
                Expr::entity(x.entity.clone(), expr)
            }
            Expr::OuterJoined(x) => {
                let test = m.expr(&x.test)?;
                let expr = m.expr(&x.expr)?;
                Expr::OuterJoined(Arc::new(OuterJoinedExpr { test, expr }))
            }
            Expr::Grouping(x) => {
                let key = m.expr(&x.key)?;
                let elements = m.expr(&x.elements)?;
                let key_source = m.expr(&x.key_source)?;
                let element_source = m.expr(&x.element_source)?;
                Expr::Grouping(Arc::new(GroupingExpr {
                    key,
                    elements,
                    key_source,
                    element_source,
                }))
            }
            Expr::Projection(x) => {
                let select = m.select(&x.select)?;
                let projector = m.expr(&x.projector)?;
                Expr::Projection(Arc::new(ProjectionExpr {
                    select,
                    projector,
                    aggregator: x.aggregator,
                }))
            }
            Expr::ClientJoin(x) => {
                let projection = m.projection(&x.projection)?;
                let outer_key = m.list(&x.outer_key)?;
                let inner_key = m.list(&x.inner_key)?;
                Expr::ClientJoin(Arc::new(ClientJoinExpr {
                    projection,
                    outer_key,
                    inner_key,
                    nulls_match: x.nulls_match,
                }))
            }
            Expr::Insert(x) => {
                let assignments = m.assignments(&x.assignments)?;
                Expr::Insert(Arc::new(InsertCommand {
                    table: x.table.clone(),
                    assignments,
                }))
            }
            Expr::Update(x) => {
                let where_clause = m.opt(&x.where_clause)?;
                let assignments = m.assignments(&x.assignments)?;
                Expr::Update(Arc::new(UpdateCommand {
                    table: x.table.clone(),
                    where_clause,
                    assignments,
                }))
            }
            Expr::Delete(x) => {
                let where_clause = m.opt(&x.where_clause)?;
                Expr::Delete(Arc::new(DeleteCommand {
                    table: x.table.clone(),
                    where_clause,
                }))
            }
            Expr::Block(x) => {
                let commands = m.list(&x.commands)?;
                Expr::Block(Arc::new(BlockCommand { commands }))
            }
            Expr::If(x) => {
                let check = m.expr(&x.check)?;
                let if_true = m.expr(&x.if_true)?;
                let if_false = m.opt(&x.if_false)?;
                Expr::If(Arc::new(IfCommand {
                    check,
                    if_true,
                    if_false,
                }))
            }
            Expr::Declaration(x) => {
                let source = x.source.as_ref().map(|s| m.select(s)).transpose()?;
                let variables = x
                    .variables
                    .iter()
                    .map(|v| {
                        Ok(VariableDeclaration {
                            name: v.name.clone(),
                            db_type: v.db_type,
                            expr: m.expr(&v.expr)?,
                        })
                    })
                    .collect::<TranslationResult<Vec<_>>>()?;
                Expr::Declaration(Arc::new(DeclarationCommand { variables, source }))
            }
        };
        Ok(if m.changed { out } else { self.clone() })
    }
}

fn map_select(s: &SelectExpr, m: &mut Mapper<'_, '_>) -> TranslationResult<SelectExpr> {
    let columns = s
        .columns
        .iter()
        .map(|c| {
            Ok(ColumnDeclaration {
                name: c.name.clone(),
                expr: m.expr(&c.expr)?,
                db_type: c.db_type,
            })
        })
        .collect::<TranslationResult<Vec<_>>>()?;
    Ok(SelectExpr {
        alias: s.alias,
        columns,
        from: m.opt(&s.from)?,
        where_clause: m.opt(&s.where_clause)?,
        group_by: m.list(&s.group_by)?,
        order_by: m.orders(&s.order_by)?,
        distinct: s.distinct,
        skip: m.opt(&s.skip)?,
        take: m.opt(&s.take)?,
        reverse: s.reverse,
    })
}

fn map_sequence(op: &SequenceOp, m: &mut Mapper<'_, '_>) -> TranslationResult<SequenceOp> {
    Ok(match op {
        SequenceOp::Source { entity } => SequenceOp::Source {
            entity: entity.clone(),
        },
        SequenceOp::Where { source, predicate } => SequenceOp::Where {
            source: m.expr(source)?,
            predicate: m.lambda(predicate)?,
        },
        SequenceOp::Select { source, selector } => SequenceOp::Select {
            source: m.expr(source)?,
            selector: m.lambda(selector)?,
        },
        SequenceOp::SelectMany {
            source,
            collection,
            result,
        } => SequenceOp::SelectMany {
            source: m.expr(source)?,
            collection: m.lambda(collection)?,
            result: m.opt_lambda(result)?,
        },
        SequenceOp::Join {
            outer,
            inner,
            outer_key,
            inner_key,
            result,
        } => SequenceOp::Join {
            outer: m.expr(outer)?,
            inner: m.expr(inner)?,
            outer_key: m.lambda(outer_key)?,
            inner_key: m.lambda(inner_key)?,
            result: m.lambda(result)?,
        },
        SequenceOp::GroupBy {
            source,
            key,
            element,
        } => SequenceOp::GroupBy {
            source: m.expr(source)?,
            key: m.lambda(key)?,
            element: m.opt_lambda(element)?,
        },
        SequenceOp::OrderBy {
            source,
            key,
            direction,
            then,
        } => SequenceOp::OrderBy {
            source: m.expr(source)?,
            key: m.lambda(key)?,
            direction: *direction,
            then: *then,
        },
        SequenceOp::Reverse { source } => SequenceOp::Reverse {
            source: m.expr(source)?,
        },
        SequenceOp::Distinct { source } => SequenceOp::Distinct {
            source: m.expr(source)?,
        },
        SequenceOp::DefaultIfEmpty { source } => SequenceOp::DefaultIfEmpty {
            source: m.expr(source)?,
        },
        SequenceOp::Skip { source, count } => SequenceOp::Skip {
            source: m.expr(source)?,
            count: m.expr(count)?,
        },
        SequenceOp::Take { source, count } => SequenceOp::Take {
            source: m.expr(source)?,
            count: m.expr(count)?,
        },
        SequenceOp::Aggregate {
            source,
            kind,
            selector,
        } => SequenceOp::Aggregate {
            source: m.expr(source)?,
            kind: *kind,
            selector: m.opt_lambda(selector)?,
        },
        SequenceOp::Any { source, predicate } => SequenceOp::Any {
            source: m.expr(source)?,
            predicate: m.opt_lambda(predicate)?,
        },
        SequenceOp::All { source, predicate } => SequenceOp::All {
            source: m.expr(source)?,
            predicate: m.lambda(predicate)?,
        },
        SequenceOp::Contains { source, value } => SequenceOp::Contains {
            source: m.expr(source)?,
            value: m.expr(value)?,
        },
        SequenceOp::Element {
            source,
            kind,
            predicate,
        } => SequenceOp::Element {
            source: m.expr(source)?,
            kind: *kind,
            predicate: m.opt_lambda(predicate)?,
        },
    })
}

/// Fallible bottom-up or top-down rewrite of a tree.
///
/// The default [`Rewriter::rewrite`] recurses into children; implementors
/// match the nodes they care about and call [`Rewriter::rewrite_children`]
/// for the rest.
pub trait Rewriter {
    fn rewrite(&mut self, expr: &Expr) -> TranslationResult<Expr> {
        self.rewrite_children(expr)
    }

    fn rewrite_children(&mut self, expr: &Expr) -> TranslationResult<Expr> {
        expr.map_children(&mut |child| self.rewrite(child))
    }
}

/// Replace every node for which `f` returns `Some`, top-down.
///
/// A replaced node's children are not visited.
pub fn replace_nodes(
    expr: &Expr,
    f: &mut dyn FnMut(&Expr) -> Option<Expr>,
) -> TranslationResult<Expr> {
    if let Some(replacement) = f(expr) {
        return Ok(replacement);
    }
    expr.map_children(&mut |child| replace_nodes(child, &mut *f))
}
