//! Read-only traversal.

use super::*;

impl Expr {
    /// Call `f` on every direct child in evaluation order.
    ///
    /// Selects embedded in other nodes are presented as [`Expr::Select`],
    /// matching what [`Expr::map_children`] hands its callback.
    pub fn for_each_child(&self, f: &mut dyn FnMut(&Expr)) {
        match self {
            Expr::Constant(_)
            | Expr::Parameter(_)
            | Expr::Table(_)
            | Expr::Column(_)
            | Expr::Variable(_) => {}
            Expr::Member(m) => f(&m.expr),
            Expr::Unary(u) => f(&u.operand),
            Expr::Binary(b) => {
                f(&b.left);
                f(&b.right);
            }
            Expr::Conditional(c) => {
                f(&c.test);
                f(&c.if_true);
                f(&c.if_false);
            }
            Expr::New(n) => n.fields.iter().for_each(|(_, e)| f(e)),
            Expr::Function(func) => func.args.iter().for_each(|e| f(e)),
            Expr::Lambda(l) => f(&l.body),
            Expr::Sequence(op) => op.for_each_child(f),
            Expr::Select(s) => s.for_each_child(f),
            Expr::Join(j) => {
                f(&j.left);
                f(&j.right);
                if let Some(c) = &j.condition {
                    f(c);
                }
            }
            Expr::Scalar(s) => f(&Expr::Select(s.select.clone())),
            Expr::Exists(e) => f(&Expr::Select(e.select.clone())),
            Expr::In(i) => {
                f(&i.expr);
                match &i.values {
                    InValues::Select(s) => f(&Expr::Select(s.clone())),
                    InValues::List(values) => values.iter().for_each(|e| f(e)),
                }
            }
            Expr::Aggregate(a) => {
                if let Some(arg) = &a.argument {
                    f(arg);
                }
            }
            Expr::IsNull(n) => f(&n.expr),
            Expr::Between(b) => {
                f(&b.expr);
                f(&b.lower);
                f(&b.upper);
            }
            Expr::RowNumber(r) => r.order_by.iter().for_each(|o| f(&o.expr)),
            Expr::NamedValue(n) => f(&n.value),
            Expr::Entity(e) => f(&e.expr),
            Expr::OuterJoined(o) => {
                f(&o.test);
                f(&o.expr);
            }
            Expr::Grouping(g) => {
                f(&g.key);
                f(&g.elements);
                f(&g.key_source);
                f(&g.element_source);
            }
            Expr::Projection(p) => {
                f(&Expr::Select(p.select.clone()));
                f(&p.projector);
            }
            Expr::ClientJoin(c) => {
                f(&Expr::Projection(c.projection.clone()));
                c.outer_key.iter().for_each(|e| f(e));
                c.inner_key.iter().for_each(|e| f(e));
            }
            Expr::Insert(i) => i.assignments.iter().for_each(|a| f(&a.expr)),
            Expr::Update(u) => {
                if let Some(w) = &u.where_clause {
                    f(w);
                }
                u.assignments.iter().for_each(|a| f(&a.expr));
            }
            Expr::Delete(d) => {
                if let Some(w) = &d.where_clause {
                    f(w);
                }
            }
            Expr::Block(b) => b.commands.iter().for_each(|e| f(e)),
            Expr::If(i) => {
                f(&i.check);
                f(&i.if_true);
                if let Some(e) = &i.if_false {
                    f(e);
                }
            }
            Expr::Declaration(d) => {
                if let Some(s) = &d.source {
                    f(&Expr::Select(s.clone()));
                }
                d.variables.iter().for_each(|v| f(&v.expr));
            }
        }
    }
}

impl SelectExpr {
    pub fn for_each_child(&self, f: &mut dyn FnMut(&Expr)) {
        self.columns.iter().for_each(|c| f(&c.expr));
        if let Some(from) = &self.from {
            f(from);
        }
        if let Some(w) = &self.where_clause {
            f(w);
        }
        self.group_by.iter().for_each(|e| f(e));
        self.order_by.iter().for_each(|o| f(&o.expr));
        if let Some(s) = &self.skip {
            f(s);
        }
        if let Some(t) = &self.take {
            f(t);
        }
    }
}

impl SequenceOp {
    pub fn for_each_child(&self, f: &mut dyn FnMut(&Expr)) {
        fn lambda(l: &LambdaExpr, f: &mut dyn FnMut(&Expr)) {
            f(&l.body);
        }
        match self {
            SequenceOp::Source { .. } => {}
            SequenceOp::Where { source, predicate } => {
                f(source);
                lambda(predicate, f);
            }
            SequenceOp::Select { source, selector } => {
                f(source);
                lambda(selector, f);
            }
            SequenceOp::SelectMany {
                source,
                collection,
                result,
            } => {
                f(source);
                lambda(collection, f);
                if let Some(r) = result {
                    lambda(r, f);
                }
            }
            SequenceOp::Join {
                outer,
                inner,
                outer_key,
                inner_key,
                result,
            } => {
                f(outer);
                f(inner);
                lambda(outer_key, f);
                lambda(inner_key, f);
                lambda(result, f);
            }
            SequenceOp::GroupBy {
                source,
                key,
                element,
            } => {
                f(source);
                lambda(key, f);
                if let Some(e) = element {
                    lambda(e, f);
                }
            }
            SequenceOp::OrderBy { source, key, .. } => {
                f(source);
                lambda(key, f);
            }
            SequenceOp::Reverse { source }
            | SequenceOp::Distinct { source }
            | SequenceOp::DefaultIfEmpty { source } => f(source),
            SequenceOp::Skip { source, count } | SequenceOp::Take { source, count } => {
                f(source);
                f(count);
            }
            SequenceOp::Aggregate {
                source, selector, ..
            } => {
                f(source);
                if let Some(s) = selector {
                    lambda(s, f);
                }
            }
            SequenceOp::Any { source, predicate } => {
                f(source);
                if let Some(p) = predicate {
                    lambda(p, f);
                }
            }
            SequenceOp::All { source, predicate } => {
                f(source);
                lambda(predicate, f);
            }
            SequenceOp::Contains { source, value } => {
                f(source);
                f(value);
            }
            SequenceOp::Element {
                source, predicate, ..
            } => {
                f(source);
                if let Some(p) = predicate {
                    lambda(p, f);
                }
            }
        }
    }
}

/// Read-only walk over a tree.
///
/// Override [`Visitor::visit`] to intercept nodes; call [`walk`] to continue
/// into the children.
pub trait Visitor {
    fn visit(&mut self, expr: &Expr) {
        walk(self, expr);
    }
}

/// Visit every direct child of `expr`
pub fn walk<V: Visitor + ?Sized>(visitor: &mut V, expr: &Expr) {
    expr.for_each_child(&mut |child| visitor.visit(child));
}

/// Visit every node in pre-order with a closure
pub fn for_each_node(expr: &Expr, f: &mut dyn FnMut(&Expr)) {
    f(expr);
    expr.for_each_child(&mut |child| for_each_node(child, &mut *f));
}

/// Whether any node satisfies `pred`
pub fn any_node(expr: &Expr, pred: &dyn Fn(&Expr) -> bool) -> bool {
    let mut found = false;
    for_each_node(expr, &mut |e| {
        if !found && pred(e) {
            found = true;
        }
    });
    found
}
