//! Row materializers.
//!
//! A projector is compiled once into a [`Reader`] tree whose column leaves
//! hold ordinals into the row, so reading a row never looks anything up by
//! name. Nested projections become either a client-side hash join (one
//! extra query per plan execution) or, when correlated by more than key
//! equality, a child plan run once per outer row.

use super::executor::{QueryExecutor, RowReader};
use super::{build_nested, Arguments, ClientJoinPlan, ExecutionPlan, Lookup};
use crate::dialect::Dialect;
use crate::error::{ExecutionError, QueryResult, TranslationError};
use crate::expr::rewrite::replace_nodes;
use crate::expr::util::{column_key, ColumnKey};
use crate::expr::{
    BinaryOp, ColumnExpr, Expr, NamedValueExpr, ProjectionExpr, ScalarFunction, SelectExpr,
    UnaryOp,
};
use crate::types::{Name, ScalarKind, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Compiled projector
#[derive(Debug, Clone)]
pub(crate) enum Reader {
    Column {
        ordinal: usize,
        kind: Option<ScalarKind>,
    },
    Constant(Value),
    /// A bound parameter: the caller's argument, else its constant value
    Argument {
        name: Name,
        default: Option<Value>,
    },
    Record(Vec<(Name, Reader)>),
    /// Null unless `test` matched
    OuterJoined {
        test: Box<Reader>,
        value: Box<Reader>,
    },
    Unary(UnaryOp, Box<Reader>),
    Binary(BinaryOp, Box<Reader>, Box<Reader>),
    Conditional(Box<Reader>, Box<Reader>, Box<Reader>),
    IsNull(Box<Reader>),
    Function(ScalarFunction, Vec<Reader>),
    /// Child plan executed with outer columns bound as arguments
    Nested {
        plan: Box<ExecutionPlan>,
        bindings: Vec<(Name, Reader)>,
    },
    /// Elements of the client join at this index whose key matches the row
    Joined {
        join: usize,
        outer_key: Vec<Reader>,
        nulls_match: bool,
    },
}

/// Services a reader needs beyond the row itself
pub(crate) struct ReadContext<'a> {
    pub executor: &'a dyn QueryExecutor,
    pub arguments: &'a Arguments,
    pub lookups: &'a [Lookup],
}

/// Turns one row of a projection's select into one client value
#[derive(Debug, Clone)]
pub struct Materializer {
    pub(crate) reader: Reader,
    pub(crate) joins: Vec<ClientJoinPlan>,
}

impl Materializer {
    /// Number of client joins fetched alongside the primary query
    pub fn join_count(&self) -> usize {
        self.joins.len()
    }

    /// Whether any nested projection runs once per outer row
    pub fn has_per_row_queries(&self) -> bool {
        self.reader.has_nested()
            || self
                .joins
                .iter()
                .any(|j| j.plan.materializer.has_per_row_queries())
    }

    pub(crate) fn read(
        &self,
        row: &dyn RowReader,
        cx: &ReadContext<'_>,
    ) -> Result<Value, ExecutionError> {
        self.reader.read(row, cx)
    }
}

/// Compiles a projector against the columns of its select
pub(crate) struct ReaderCompiler<'a> {
    pub dialect: &'a dyn Dialect,
    pub select: &'a SelectExpr,
    /// Nesting level, used to keep outer-row argument names distinct
    pub depth: usize,
    pub joins: Vec<ClientJoinPlan>,
}

impl<'a> ReaderCompiler<'a> {
    pub(crate) fn new(dialect: &'a dyn Dialect, select: &'a SelectExpr, depth: usize) -> Self {
        Self {
            dialect,
            select,
            depth,
            joins: Vec::new(),
        }
    }

    pub(crate) fn finish(self, reader: Reader) -> Materializer {
        Materializer {
            reader,
            joins: self.joins,
        }
    }

    fn column(&self, column: &ColumnExpr) -> QueryResult<Reader> {
        column_reader(self.select, column).map_err(Into::into)
    }

    pub(crate) fn compile(&mut self, expr: &Expr) -> QueryResult<Reader> {
        let boxed = |r: Reader| Box::new(r);
        let reader = match expr {
            Expr::Column(c) => self.column(c)?,
            Expr::Constant(c) => Reader::Constant(c.value.clone()),
            Expr::NamedValue(n) => Reader::Argument {
                name: n.name.clone(),
                default: n.value.as_constant().cloned(),
            },
            Expr::New(n) => Reader::Record(
                n.fields
                    .iter()
                    .map(|(name, e)| Ok((name.clone(), self.compile(e)?)))
                    .collect::<QueryResult<_>>()?,
            ),
            Expr::Entity(e) => self.compile(&e.expr)?,
            Expr::OuterJoined(o) => Reader::OuterJoined {
                test: boxed(self.compile(&o.test)?),
                value: boxed(self.compile(&o.expr)?),
            },
            Expr::Grouping(g) => Reader::Record(vec![
                (Name::from("Key"), self.compile(&g.key)?),
                (Name::from("Elements"), self.compile(&g.elements)?),
            ]),
            Expr::Unary(u) => Reader::Unary(u.op, boxed(self.compile(&u.operand)?)),
            Expr::Binary(b) => Reader::Binary(
                b.op,
                boxed(self.compile(&b.left)?),
                boxed(self.compile(&b.right)?),
            ),
            Expr::Conditional(c) => Reader::Conditional(
                boxed(self.compile(&c.test)?),
                boxed(self.compile(&c.if_true)?),
                boxed(self.compile(&c.if_false)?),
            ),
            Expr::IsNull(n) => Reader::IsNull(boxed(self.compile(&n.expr)?)),
            Expr::Function(f) => Reader::Function(
                f.function,
                f.args.iter().map(|a| self.compile(a)).collect::<QueryResult<_>>()?,
            ),
            Expr::ClientJoin(cj) => {
                let outer_key = cj
                    .outer_key
                    .iter()
                    .map(|k| self.compile(k))
                    .collect::<QueryResult<Vec<_>>>()?;
                let plan = build_nested(&cj.projection, self.dialect, self.depth + 1)?;
                let inner_key = {
                    let compiler =
                        ReaderCompiler::new(self.dialect, &cj.projection.select, self.depth + 1);
                    cj.inner_key
                        .iter()
                        .map(|k| match k {
                            Expr::Column(c) => compiler.column(c),
                            other => Err(TranslationError::invalid(
                                "ClientJoin",
                                format!("inner key is a {}", other.kind_name()),
                            )
                            .into()),
                        })
                        .collect::<QueryResult<Vec<_>>>()?
                };
                self.joins.push(ClientJoinPlan {
                    plan,
                    inner_key,
                    nulls_match: cj.nulls_match,
                });
                Reader::Joined {
                    join: self.joins.len() - 1,
                    outer_key,
                    nulls_match: cj.nulls_match,
                }
            }
            Expr::Projection(p) => self.per_row(p)?,
            other => {
                return Err(TranslationError::unsupported(format!(
                    "{} in a client projector",
                    other.kind_name()
                ))
                .into())
            }
        };
        Ok(reader)
    }

    /// A nested projection correlated by more than key equality
    fn per_row(&mut self, nested: &Arc<ProjectionExpr>) -> QueryResult<Reader> {
        let outer = self.select.alias;
        let depth = self.depth;
        let mut bound: HashMap<ColumnKey, Expr> = HashMap::new();
        let mut correlated: Vec<(Name, ColumnExpr)> = Vec::new();
        let rewritten = replace_nodes(&Expr::Projection(nested.clone()), &mut |e| match e {
            Expr::Column(c) if c.alias == outer => {
                let named = bound.entry(column_key(c)).or_insert_with(|| {
                    let name = Name::from(format!("o{depth}_{}", correlated.len()));
                    correlated.push((name.clone(), (**c).clone()));
                    Expr::NamedValue(Arc::new(NamedValueExpr {
                        name,
                        db_type: Some(c.db_type),
                        value: e.clone(),
                    }))
                });
                Some(named.clone())
            }
            _ => None,
        })?;
        let Expr::Projection(rewritten) = rewritten else {
            return Err(TranslationError::invalid("Projection", "rewritten to another node").into());
        };

        warn!(
            correlated = correlated.len(),
            "nested projection runs once per outer row"
        );
        let plan = build_nested(&rewritten, self.dialect, depth + 1)?;
        let bindings = correlated
            .iter()
            .map(|(name, c)| Ok((name.clone(), self.column(c)?)))
            .collect::<QueryResult<_>>()?;
        Ok(Reader::Nested {
            plan: Box::new(plan),
            bindings,
        })
    }
}

/// Ordinal reader for a column of `select`
fn column_reader(select: &SelectExpr, column: &ColumnExpr) -> Result<Reader, TranslationError> {
    if column.alias != select.alias {
        return Err(TranslationError::invalid(
            "Column",
            format!("'{}' does not belong to the projected select", column.name),
        ));
    }
    let ordinal = select
        .columns
        .iter()
        .position(|c| c.name == column.name)
        .ok_or_else(|| {
            TranslationError::invalid("Column", format!("'{}' is not declared", column.name))
        })?;
    Ok(Reader::Column {
        ordinal,
        kind: column.ty.scalar_kind(),
    })
}

/// Lookup key for a client join; the key text of nulls matches nulls
pub(crate) fn join_key(values: &[Value]) -> String {
    Value::Array(values.to_vec()).to_string()
}

/// Whether a key can match under SQL equality
pub(crate) fn comparable_key(values: &[Value]) -> bool {
    !values.iter().any(Value::is_null)
}

impl Reader {
    fn has_nested(&self) -> bool {
        match self {
            Self::Nested { .. } => true,
            Self::Column { .. }
            | Self::Constant(_)
            | Self::Argument { .. }
            | Self::Joined { .. } => false,
            Self::Record(fields) => fields.iter().any(|(_, r)| r.has_nested()),
            Self::OuterJoined { test, value } => test.has_nested() || value.has_nested(),
            Self::Unary(_, r) | Self::IsNull(r) => r.has_nested(),
            Self::Binary(_, a, b) => a.has_nested() || b.has_nested(),
            Self::Conditional(a, b, c) => a.has_nested() || b.has_nested() || c.has_nested(),
            Self::Function(_, args) => args.iter().any(Reader::has_nested),
        }
    }

    pub(crate) fn read(
        &self,
        row: &dyn RowReader,
        cx: &ReadContext<'_>,
    ) -> Result<Value, ExecutionError> {
        match self {
            Self::Column { ordinal, kind } => match kind {
                Some(ScalarKind::Bool) => {
                    Ok(row.get_bool(*ordinal)?.map_or(Value::Null, Value::Bool))
                }
                Some(ScalarKind::Int | ScalarKind::BigInt) => {
                    Ok(row.get_i64(*ordinal)?.map_or(Value::Null, Value::from))
                }
                _ => Ok(row.value(*ordinal)?.clone()),
            },
            Self::Constant(v) => Ok(v.clone()),
            Self::Argument { name, default } => cx
                .arguments
                .get(name)
                .or(default.as_ref())
                .cloned()
                .ok_or_else(|| ExecutionError::MissingArgument {
                    name: name.to_string(),
                }),
            Self::Record(fields) => {
                let mut object = serde_json::Map::new();
                for (name, reader) in fields {
                    object.insert(name.to_string(), reader.read(row, cx)?);
                }
                Ok(Value::Object(object))
            }
            Self::OuterJoined { test, value } => {
                if test.read(row, cx)?.is_null() {
                    Ok(Value::Null)
                } else {
                    value.read(row, cx)
                }
            }
            Self::Unary(op, operand) => eval_unary(*op, operand.read(row, cx)?),
            Self::Binary(op, left, right) => {
                eval_binary(*op, left.read(row, cx)?, right.read(row, cx)?)
            }
            Self::Conditional(test, if_true, if_false) => match truth(&test.read(row, cx)?) {
                Some(true) => if_true.read(row, cx),
                _ => if_false.read(row, cx),
            },
            Self::IsNull(operand) => Ok(Value::Bool(operand.read(row, cx)?.is_null())),
            Self::Function(function, args) => {
                let args = args
                    .iter()
                    .map(|a| a.read(row, cx))
                    .collect::<Result<Vec<_>, _>>()?;
                eval_function(*function, &args)
            }
            Self::Nested { plan, bindings } => {
                let mut arguments = cx.arguments.clone();
                for (name, reader) in bindings {
                    arguments.insert(name.clone(), reader.read(row, cx)?);
                }
                plan.execute(cx.executor, &arguments)
            }
            Self::Joined {
                join,
                outer_key,
                nulls_match,
            } => {
                let key = outer_key
                    .iter()
                    .map(|k| k.read(row, cx))
                    .collect::<Result<Vec<_>, _>>()?;
                if !nulls_match && !comparable_key(&key) {
                    return Ok(Value::Array(Vec::new()));
                }
                let elements = cx
                    .lookups
                    .get(*join)
                    .and_then(|lookup| lookup.get(&join_key(&key)))
                    .cloned()
                    .unwrap_or_default();
                Ok(Value::Array(elements))
            }
        }
    }
}

// ============================================================================
// Client evaluation
// ============================================================================

fn evaluation(what: impl Into<String>) -> ExecutionError {
    ExecutionError::Evaluation(what.into())
}

fn truth(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        _ => None,
    }
}

fn eval_unary(op: UnaryOp, operand: Value) -> Result<Value, ExecutionError> {
    match (op, &operand) {
        (_, Value::Null) => Ok(Value::Null),
        (UnaryOp::Not, v) => truth(v)
            .map(|b| Value::Bool(!b))
            .ok_or_else(|| evaluation("NOT of a non-boolean")),
        (UnaryOp::Negate, Value::Number(n)) => match n.as_i64() {
            Some(i) => Ok(Value::from(-i)),
            None => Ok(Value::from(-n.as_f64().unwrap_or_default())),
        },
        (UnaryOp::Negate, _) => Err(evaluation("negation of a non-number")),
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (a, b) if a == b => Some(Ordering::Equal),
        _ => None,
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn eval_binary(
    op: BinaryOp,
    left: Value,
    right: Value,
) -> Result<Value, ExecutionError> {
    match op {
        BinaryOp::And => Ok(match (truth(&left), truth(&right)) {
            (Some(false), _) | (_, Some(false)) => Value::Bool(false),
            (Some(true), Some(true)) => Value::Bool(true),
            _ => Value::Null,
        }),
        BinaryOp::Or => Ok(match (truth(&left), truth(&right)) {
            (Some(true), _) | (_, Some(true)) => Value::Bool(true),
            (Some(false), Some(false)) => Value::Bool(false),
            _ => Value::Null,
        }),
        BinaryOp::Eq | BinaryOp::Ne if left.is_null() || right.is_null() => {
            let both = left.is_null() && right.is_null();
            Ok(Value::Bool(if op == BinaryOp::Eq { both } else { !both }))
        }
        BinaryOp::Eq => Ok(Value::Bool(compare(&left, &right) == Some(Ordering::Equal))),
        BinaryOp::Ne => Ok(Value::Bool(compare(&left, &right) != Some(Ordering::Equal))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            if left.is_null() || right.is_null() {
                return Ok(Value::Null);
            }
            let ord = compare(&left, &right)
                .ok_or_else(|| evaluation("comparison of unrelated values"))?;
            let result = match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::Concat => Ok(Value::String(text(&left) + &text(&right))),
        BinaryOp::Coalesce => Ok(if left.is_null() { right } else { left }),
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arithmetic(op, &left, &right)
        }
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExecutionError> {
    let (Value::Number(a), Value::Number(b)) = (left, right) else {
        if left.is_null() || right.is_null() {
            return Ok(Value::Null);
        }
        return Err(evaluation("arithmetic on non-numbers"));
    };
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let result = match op {
            BinaryOp::Add => x.checked_add(y),
            BinaryOp::Sub => x.checked_sub(y),
            BinaryOp::Mul => x.checked_mul(y),
            BinaryOp::Div => x.checked_div(y),
            _ => x.checked_rem(y),
        };
        return result
            .map(Value::from)
            .ok_or_else(|| evaluation("integer overflow or division by zero"));
    }
    let (x, y) = (a.as_f64().unwrap_or_default(), b.as_f64().unwrap_or_default());
    let result = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div => x / y,
        _ => x % y,
    };
    Ok(Value::from(result))
}

fn eval_function(function: ScalarFunction, args: &[Value]) -> Result<Value, ExecutionError> {
    if args.first().is_some_and(Value::is_null) {
        return Ok(Value::Null);
    }
    let string = |i: usize| match args.get(i) {
        Some(Value::String(s)) => Ok(s.as_str()),
        _ => Err(evaluation(format!("{function:?} of a non-string"))),
    };
    let number = |i: usize| {
        args.get(i)
            .and_then(Value::as_f64)
            .ok_or_else(|| evaluation(format!("{function:?} of a non-number")))
    };
    let value = match function {
        ScalarFunction::Lower => Value::from(string(0)?.to_lowercase()),
        ScalarFunction::Upper => Value::from(string(0)?.to_uppercase()),
        ScalarFunction::Trim => Value::from(string(0)?.trim()),
        ScalarFunction::Length => Value::from(string(0)?.chars().count() as i64),
        ScalarFunction::StartsWith => Value::Bool(string(0)?.starts_with(string(1)?)),
        ScalarFunction::EndsWith => Value::Bool(string(0)?.ends_with(string(1)?)),
        ScalarFunction::Contains => Value::Bool(string(0)?.contains(string(1)?)),
        ScalarFunction::Substring => {
            // 1-based start, as on the server
            let start = (number(1)? as usize).saturating_sub(1);
            let chars = string(0)?.chars().skip(start);
            let taken: String = match args.get(2) {
                Some(_) => chars.take(number(2)? as usize).collect(),
                None => chars.collect(),
            };
            Value::from(taken)
        }
        ScalarFunction::Abs => match args.first().and_then(Value::as_i64) {
            Some(i) => Value::from(i.abs()),
            None => Value::from(number(0)?.abs()),
        },
        ScalarFunction::Round => {
            let digits = args.get(1).and_then(Value::as_i64).unwrap_or(0) as i32;
            let scale = 10f64.powi(digits);
            Value::from((number(0)? * scale).round() / scale)
        }
        ScalarFunction::Now | ScalarFunction::GeneratedId => {
            return Err(evaluation(format!("{function:?}")))
        }
    };
    Ok(value)
}
