//! Fluent construction of input queries.
//!
//! ```
//! use quarry::expr::Expr;
//!
//! let query = Expr::source("Customer")
//!     .filter("c", |c| c.member("City").equal(Expr::constant("London")))
//!     .map("c", |c| c.member("Phone"));
//! assert_eq!(query.kind_name(), "Sequence");
//! ```

use super::*;

fn lambda(param: &str, body: impl FnOnce(Expr) -> Expr) -> Arc<LambdaExpr> {
    let body = body(Expr::Parameter(Name::from(param)));
    LambdaExpr::new(&[param], body)
}

fn sequence(op: SequenceOp) -> Expr {
    Expr::Sequence(Arc::new(op))
}

impl Expr {
    /// All instances of a mapped entity
    pub fn source(entity: &str) -> Expr {
        sequence(SequenceOp::Source {
            entity: entity.into(),
        })
    }

    /// Reference to an enclosing lambda parameter
    pub fn param(name: &str) -> Expr {
        Expr::Parameter(name.into())
    }

    pub fn member(self, member: &str) -> Expr {
        Expr::Member(Arc::new(MemberExpr {
            expr: self,
            member: member.into(),
        }))
    }

    /// Anonymous record from named fields
    pub fn record<'a>(fields: impl IntoIterator<Item = (&'a str, Expr)>) -> Expr {
        Expr::new_record(
            fields
                .into_iter()
                .map(|(name, e)| (Name::from(name), e))
                .collect(),
        )
    }

    pub fn call(function: ScalarFunction, ty: ValueType, args: Vec<Expr>) -> Expr {
        Expr::Function(Arc::new(FunctionExpr { function, ty, args }))
    }

    pub fn iif(test: Expr, if_true: Expr, if_false: Expr) -> Expr {
        Expr::Conditional(Arc::new(ConditionalExpr {
            test,
            if_true,
            if_false,
        }))
    }

    pub fn equal(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::Eq, self, other)
    }

    pub fn not_equal(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::Ne, self, other)
    }

    pub fn less_than(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::Lt, self, other)
    }

    pub fn less_or_equal(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::Le, self, other)
    }

    pub fn greater_than(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::Gt, self, other)
    }

    pub fn greater_or_equal(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::Ge, self, other)
    }

    pub fn and(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::And, self, other)
    }

    pub fn or(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::Or, self, other)
    }

    pub fn arith(self, op: BinaryOp, other: Expr) -> Expr {
        Expr::binary(op, self, other)
    }

    pub fn concat(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::Concat, self, other)
    }

    pub fn coalesce(self, other: Expr) -> Expr {
        Expr::binary(BinaryOp::Coalesce, self, other)
    }

    // Sequence operators

    pub fn filter(self, param: &str, predicate: impl FnOnce(Expr) -> Expr) -> Expr {
        sequence(SequenceOp::Where {
            source: self,
            predicate: lambda(param, predicate),
        })
    }

    pub fn map(self, param: &str, selector: impl FnOnce(Expr) -> Expr) -> Expr {
        sequence(SequenceOp::Select {
            source: self,
            selector: lambda(param, selector),
        })
    }

    pub fn flat_map(self, param: &str, collection: impl FnOnce(Expr) -> Expr) -> Expr {
        sequence(SequenceOp::SelectMany {
            source: self,
            collection: lambda(param, collection),
            result: None,
        })
    }

    /// `SelectMany` with a result selector over `(outer, inner)`
    pub fn flat_map_with(
        self,
        param: &str,
        collection: impl FnOnce(Expr) -> Expr,
        params: (&str, &str),
        result: impl FnOnce(Expr, Expr) -> Expr,
    ) -> Expr {
        let body = result(Expr::param(params.0), Expr::param(params.1));
        sequence(SequenceOp::SelectMany {
            source: self,
            collection: lambda(param, collection),
            result: Some(LambdaExpr::new(&[params.0, params.1], body)),
        })
    }

    /// Equi-join on keys, combining matches with `result(outer, inner)`
    pub fn join_on(
        self,
        inner: Expr,
        outer_key: (&str, Box<dyn FnOnce(Expr) -> Expr>),
        inner_key: (&str, Box<dyn FnOnce(Expr) -> Expr>),
        result: (&str, &str, Box<dyn FnOnce(Expr, Expr) -> Expr>),
    ) -> Expr {
        let (o, i, f) = result;
        let body = f(Expr::param(o), Expr::param(i));
        sequence(SequenceOp::Join {
            outer: self,
            inner,
            outer_key: lambda(outer_key.0, outer_key.1),
            inner_key: lambda(inner_key.0, inner_key.1),
            result: LambdaExpr::new(&[o, i], body),
        })
    }

    pub fn group_by(self, param: &str, key: impl FnOnce(Expr) -> Expr) -> Expr {
        sequence(SequenceOp::GroupBy {
            source: self,
            key: lambda(param, key),
            element: None,
        })
    }

    pub fn group_by_element(
        self,
        param: &str,
        key: impl FnOnce(Expr) -> Expr,
        element: impl FnOnce(Expr) -> Expr,
    ) -> Expr {
        sequence(SequenceOp::GroupBy {
            source: self,
            key: lambda(param, key),
            element: Some(lambda(param, element)),
        })
    }

    fn ordered(
        self,
        param: &str,
        key: impl FnOnce(Expr) -> Expr,
        direction: OrderDirection,
        then: bool,
    ) -> Expr {
        sequence(SequenceOp::OrderBy {
            source: self,
            key: lambda(param, key),
            direction,
            then,
        })
    }

    pub fn order_by(self, param: &str, key: impl FnOnce(Expr) -> Expr) -> Expr {
        self.ordered(param, key, OrderDirection::Ascending, false)
    }

    pub fn order_by_desc(self, param: &str, key: impl FnOnce(Expr) -> Expr) -> Expr {
        self.ordered(param, key, OrderDirection::Descending, false)
    }

    pub fn then_by(self, param: &str, key: impl FnOnce(Expr) -> Expr) -> Expr {
        self.ordered(param, key, OrderDirection::Ascending, true)
    }

    pub fn then_by_desc(self, param: &str, key: impl FnOnce(Expr) -> Expr) -> Expr {
        self.ordered(param, key, OrderDirection::Descending, true)
    }

    pub fn reverse(self) -> Expr {
        sequence(SequenceOp::Reverse { source: self })
    }

    pub fn skip(self, count: impl Into<Value>) -> Expr {
        sequence(SequenceOp::Skip {
            source: self,
            count: Expr::constant(count),
        })
    }

    pub fn take(self, count: impl Into<Value>) -> Expr {
        sequence(SequenceOp::Take {
            source: self,
            count: Expr::constant(count),
        })
    }

    pub fn distinct(self) -> Expr {
        sequence(SequenceOp::Distinct { source: self })
    }

    pub fn default_if_empty(self) -> Expr {
        sequence(SequenceOp::DefaultIfEmpty { source: self })
    }

    pub fn aggregate_by(self, kind: AggregateKind, selector: Option<Arc<LambdaExpr>>) -> Expr {
        sequence(SequenceOp::Aggregate {
            source: self,
            kind,
            selector,
        })
    }

    pub fn count(self) -> Expr {
        self.aggregate_by(AggregateKind::Count, None)
    }

    pub fn count_where(self, param: &str, predicate: impl FnOnce(Expr) -> Expr) -> Expr {
        self.filter(param, predicate).count()
    }

    pub fn sum(self, param: &str, selector: impl FnOnce(Expr) -> Expr) -> Expr {
        self.aggregate_by(AggregateKind::Sum, Some(lambda(param, selector)))
    }

    pub fn min(self, param: &str, selector: impl FnOnce(Expr) -> Expr) -> Expr {
        self.aggregate_by(AggregateKind::Min, Some(lambda(param, selector)))
    }

    pub fn max(self, param: &str, selector: impl FnOnce(Expr) -> Expr) -> Expr {
        self.aggregate_by(AggregateKind::Max, Some(lambda(param, selector)))
    }

    pub fn average(self, param: &str, selector: impl FnOnce(Expr) -> Expr) -> Expr {
        self.aggregate_by(AggregateKind::Average, Some(lambda(param, selector)))
    }

    pub fn any(self) -> Expr {
        sequence(SequenceOp::Any {
            source: self,
            predicate: None,
        })
    }

    pub fn any_where(self, param: &str, predicate: impl FnOnce(Expr) -> Expr) -> Expr {
        sequence(SequenceOp::Any {
            source: self,
            predicate: Some(lambda(param, predicate)),
        })
    }

    pub fn all(self, param: &str, predicate: impl FnOnce(Expr) -> Expr) -> Expr {
        sequence(SequenceOp::All {
            source: self,
            predicate: lambda(param, predicate),
        })
    }

    pub fn contains(self, value: Expr) -> Expr {
        sequence(SequenceOp::Contains {
            source: self,
            value,
        })
    }

    fn element(self, kind: ElementKind) -> Expr {
        sequence(SequenceOp::Element {
            source: self,
            kind,
            predicate: None,
        })
    }

    pub fn first(self) -> Expr {
        self.element(ElementKind::First)
    }

    pub fn first_or_default(self) -> Expr {
        self.element(ElementKind::FirstOrDefault)
    }

    pub fn single(self) -> Expr {
        self.element(ElementKind::Single)
    }

    pub fn single_or_default(self) -> Expr {
        self.element(ElementKind::SingleOrDefault)
    }

    pub fn first_where(self, param: &str, predicate: impl FnOnce(Expr) -> Expr) -> Expr {
        sequence(SequenceOp::Element {
            source: self,
            kind: ElementKind::First,
            predicate: Some(lambda(param, predicate)),
        })
    }

    /// Constant sequence usable with [`Expr::contains`]
    pub fn list(values: impl IntoIterator<Item = Value>) -> Expr {
        Expr::constant_of(Value::Array(values.into_iter().collect()), ValueType::Sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lambda_binds_parameter_name() {
        let q = Expr::source("Customer")
            .filter("c", |c| c.member("City").equal(Expr::constant("London")));
        let Expr::Sequence(op) = &q else {
            panic!("expected sequence")
        };
        let SequenceOp::Where { predicate, .. } = &**op else {
            panic!("expected where")
        };
        assert_eq!(&*predicate.params[0], "c");
        let Expr::Binary(b) = &predicate.body else {
            panic!("expected comparison")
        };
        let Expr::Member(m) = &b.left else {
            panic!("expected member")
        };
        assert_eq!(m.expr, Expr::param("c"));
    }

    #[test]
    fn test_order_by_chain() {
        let q = Expr::source("Customer")
            .order_by("c", |c| c.member("City"))
            .then_by_desc("c", |c| c.member("Phone"));
        let Expr::Sequence(op) = &q else {
            panic!("expected sequence")
        };
        assert!(matches!(
            &**op,
            SequenceOp::OrderBy {
                direction: OrderDirection::Descending,
                then: true,
                ..
            }
        ));
    }
}
