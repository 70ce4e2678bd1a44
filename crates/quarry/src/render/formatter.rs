//! Generic SQL formatter.
//!
//! One recursive walk over the relational and command nodes. Everything
//! product-specific (quoting, placeholders, paging, function names,
//! concatenation, statement batching) is asked of the [`Dialect`].
//!
//! Tables and selects used as `FROM` sources are printed as `t0`, `t1`, ...
//! in the order they are first reached; the outermost select and the target
//! table of a command stay unnamed, so their columns print unqualified.

use super::{QueryParameter, QueryRenderer, RenderedQuery};
use crate::dialect::{Dialect, Paging};
use crate::error::RenderError;
use crate::expr::{
    AggregateExpr, AggregateKind, BinaryExpr, BinaryOp, ColumnAssignment, DeclarationCommand,
    Expr, FunctionExpr, IfCommand, InValues, JoinKind, OrderDirection, OrderExpr, ScalarFunction,
    SelectExpr, TableAlias, TableExpr, UnaryOp,
};
use crate::types::{Name, ScalarKind, Value};
use std::collections::{HashMap, HashSet};

/// Escape character declared on every rendered `LIKE`
const LIKE_ESCAPE: char = '\\';

/// Renders trees with the spellings of one dialect
#[derive(Debug, Clone, Copy)]
pub struct SqlFormatter<'a> {
    dialect: &'a dyn Dialect,
}

impl<'a> SqlFormatter<'a> {
    pub fn new(dialect: &'a dyn Dialect) -> Self {
        Self { dialect }
    }
}

impl QueryRenderer for SqlFormatter<'_> {
    fn name(&self) -> &str {
        self.dialect.name()
    }

    fn render(&self, expr: &Expr) -> Result<RenderedQuery, RenderError> {
        let mut writer = Writer::new(self.dialect);
        writer.statement(expr)?;
        Ok(RenderedQuery {
            sql: writer.out,
            params: writer.params,
        })
    }
}

struct Writer<'a> {
    dialect: &'a dyn Dialect,
    out: String,
    names: HashMap<TableAlias, String>,
    params: Vec<QueryParameter>,
    seen: HashSet<Name>,
}

/// Position of an expression: some products cannot use a predicate as a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Value,
    Predicate,
}

fn unsupported(node: &Expr) -> RenderError {
    RenderError::UnsupportedNode {
        node: node.kind_name(),
    }
}

type RenderResult = Result<(), RenderError>;

impl<'a> Writer<'a> {
    fn new(dialect: &'a dyn Dialect) -> Self {
        Self {
            dialect,
            out: String::new(),
            names: HashMap::new(),
            params: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn push(&mut self, text: &str) {
        self.out.push_str(text);
    }

    fn quoted(&mut self, name: &str) {
        let quoted = self.dialect.quote_identifier(name);
        self.out.push_str(&quoted);
    }

    fn unsupported_for_dialect(&self, construct: &str) -> RenderError {
        RenderError::UnsupportedForDialect {
            dialect: self.dialect.name().to_string(),
            construct: construct.to_string(),
        }
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn statement(&mut self, expr: &Expr) -> RenderResult {
        match expr {
            Expr::Select(s) => self.select(s),
            Expr::Projection(p) => self.select(&p.select),
            Expr::Insert(insert) => self.insert(&insert.table, &insert.assignments),
            Expr::Update(update) => {
                self.push("UPDATE ");
                self.quoted(&update.table.name);
                self.push(" SET ");
                self.assignments(&update.assignments)?;
                self.where_clause(update.where_clause.as_ref())
            }
            Expr::Delete(delete) => {
                self.push("DELETE FROM ");
                self.quoted(&delete.table.name);
                self.where_clause(delete.where_clause.as_ref())
            }
            Expr::Block(block) => {
                if block.commands.len() > 1 && !self.dialect.allows_multiple_statements() {
                    return Err(self.unsupported_for_dialect("multiple statements in one command"));
                }
                for (i, command) in block.commands.iter().enumerate() {
                    if i > 0 {
                        self.push(";\n");
                    }
                    self.statement(command)?;
                }
                Ok(())
            }
            Expr::If(command) => self.if_command(command),
            Expr::Declaration(declaration) => self.declaration(declaration),
            other => Err(unsupported(other)),
        }
    }

    fn insert(&mut self, table: &TableExpr, assignments: &[ColumnAssignment]) -> RenderResult {
        self.push("INSERT INTO ");
        self.quoted(&table.name);
        if assignments.is_empty() {
            self.push(" DEFAULT VALUES");
            return Ok(());
        }
        self.push("(");
        for (i, a) in assignments.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.quoted(&a.column.name);
        }
        self.push(") VALUES (");
        for (i, a) in assignments.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.expr(&a.expr, Position::Value)?;
        }
        self.push(")");
        Ok(())
    }

    fn assignments(&mut self, assignments: &[ColumnAssignment]) -> RenderResult {
        for (i, a) in assignments.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.quoted(&a.column.name);
            self.push(" = ");
            self.expr(&a.expr, Position::Value)?;
        }
        Ok(())
    }

    fn if_command(&mut self, command: &IfCommand) -> RenderResult {
        if !self.dialect.allows_multiple_statements() {
            return Err(self.unsupported_for_dialect("conditional commands"));
        }
        self.push("IF ");
        self.expr(&command.check, Position::Predicate)?;
        self.push("\nBEGIN\n");
        self.statement(&command.if_true)?;
        self.push("\nEND");
        if let Some(if_false) = &command.if_false {
            self.push("\nELSE\nBEGIN\n");
            self.statement(if_false)?;
            self.push("\nEND");
        }
        Ok(())
    }

    fn declaration(&mut self, declaration: &DeclarationCommand) -> RenderResult {
        if !self.dialect.allows_multiple_statements() {
            return Err(self.unsupported_for_dialect("variable declarations"));
        }
        for v in &declaration.variables {
            self.push("DECLARE ");
            let name = self.dialect.variable_name(&v.name);
            self.push(&name);
            self.push(" ");
            let ty = self.dialect.format_type(&v.db_type, false);
            self.push(&ty);
            self.push(";\n");
        }
        self.push("SELECT ");
        for (i, v) in declaration.variables.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            let name = self.dialect.variable_name(&v.name);
            self.push(&name);
            self.push(" = ");
            self.expr(&v.expr, Position::Value)?;
        }
        if let Some(source) = &declaration.source {
            if let Some(from) = &source.from {
                self.name_sources(from);
                self.push(" FROM ");
                self.source(from)?;
            }
            self.where_clause(source.where_clause.as_ref())?;
        }
        Ok(())
    }

    // ========================================================================
    // Selects
    // ========================================================================

    /// Assign printable names to the sources of one `FROM` clause
    fn name_sources(&mut self, from: &Expr) {
        match from {
            Expr::Table(t) => self.name_alias(t.alias),
            Expr::Select(s) => self.name_alias(s.alias),
            Expr::Join(j) => {
                self.name_sources(&j.left);
                self.name_sources(&j.right);
            }
            _ => {}
        }
    }

    fn name_alias(&mut self, alias: TableAlias) {
        let next = self.names.len();
        self.names.entry(alias).or_insert_with(|| format!("t{next}"));
    }

    fn select(&mut self, select: &SelectExpr) -> RenderResult {
        if let Some(from) = &select.from {
            self.name_sources(from);
        }
        let paging = self.dialect.paging();
        if select.skip.is_some() && paging == Paging::Top {
            return Err(self.unsupported_for_dialect("Skip without row numbering"));
        }

        self.push("SELECT ");
        if select.distinct {
            self.push("DISTINCT ");
        }
        if let (Some(take), Paging::Top) = (&select.take, paging) {
            self.push("TOP (");
            self.expr(take, Position::Value)?;
            self.push(") ");
        }
        if select.columns.is_empty() {
            self.push("NULL");
        }
        for (i, column) in select.columns.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.expr(&column.expr, Position::Value)?;
            let same_name = matches!(&column.expr, Expr::Column(c) if c.name == column.name);
            if !same_name {
                self.push(" AS ");
                self.quoted(&column.name);
            }
        }
        if let Some(from) = &select.from {
            self.push(" FROM ");
            self.source(from)?;
        }
        self.where_clause(select.where_clause.as_ref())?;
        if !select.group_by.is_empty() {
            self.push(" GROUP BY ");
            for (i, key) in select.group_by.iter().enumerate() {
                if i > 0 {
                    self.push(", ");
                }
                self.expr(key, Position::Value)?;
            }
        }
        if !select.order_by.is_empty() {
            self.push(" ORDER BY ");
            self.orderings(&select.order_by)?;
        }
        if paging == Paging::LimitOffset {
            match (&select.take, &select.skip) {
                (Some(take), skip) => {
                    self.push(" LIMIT ");
                    self.expr(take, Position::Value)?;
                    if let Some(skip) = skip {
                        self.push(" OFFSET ");
                        self.expr(skip, Position::Value)?;
                    }
                }
                (None, Some(skip)) => {
                    self.push(" LIMIT -1 OFFSET ");
                    self.expr(skip, Position::Value)?;
                }
                (None, None) => {}
            }
        }
        Ok(())
    }

    fn where_clause(&mut self, predicate: Option<&Expr>) -> RenderResult {
        if let Some(predicate) = predicate {
            self.push(" WHERE ");
            self.expr(predicate, Position::Predicate)?;
        }
        Ok(())
    }

    fn orderings(&mut self, orderings: &[OrderExpr]) -> RenderResult {
        for (i, o) in orderings.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.expr(&o.expr, Position::Value)?;
            if o.direction == OrderDirection::Descending {
                self.push(" DESC");
            }
        }
        Ok(())
    }

    fn source(&mut self, source: &Expr) -> RenderResult {
        match source {
            Expr::Table(t) => {
                self.quoted(&t.name);
                self.alias_suffix(t.alias);
                Ok(())
            }
            Expr::Select(s) => {
                self.push("(");
                self.select(s)?;
                self.push(")");
                self.alias_suffix(s.alias);
                Ok(())
            }
            Expr::Join(j) => {
                self.source(&j.left)?;
                let keyword = match j.kind {
                    JoinKind::Cross => " CROSS JOIN ",
                    JoinKind::Inner => " INNER JOIN ",
                    JoinKind::LeftOuter | JoinKind::SingletonLeftOuter => " LEFT OUTER JOIN ",
                    JoinKind::CrossApply | JoinKind::OuterApply
                        if !self.dialect.supports_apply() =>
                    {
                        return Err(self.unsupported_for_dialect("correlated joins"))
                    }
                    JoinKind::CrossApply => " CROSS APPLY ",
                    JoinKind::OuterApply => " OUTER APPLY ",
                };
                self.push(keyword);
                self.source(&j.right)?;
                match (j.kind, &j.condition) {
                    (kind, cond) if kind != JoinKind::Cross && !kind.is_apply() => {
                        self.push(" ON ");
                        match cond {
                            Some(cond) => self.expr(cond, Position::Predicate)?,
                            None => self.push("1 = 1"),
                        }
                    }
                    // cross joins and applies take no ON clause
                    (_, Some(_)) => return Err(unsupported(source)),
                    (_, None) => {}
                }
                Ok(())
            }
            other => Err(unsupported(other)),
        }
    }

    fn alias_suffix(&mut self, alias: TableAlias) {
        if let Some(name) = self.names.get(&alias) {
            let suffix = format!(" AS {name}");
            self.push(&suffix);
        }
    }
}

impl Writer<'_> {
    // ========================================================================
    // Expressions
    // ========================================================================

    fn expr(&mut self, expr: &Expr, position: Position) -> RenderResult {
        let booleans = self.dialect.supports_boolean_values();
        match position {
            Position::Value if expr.is_predicate() && !booleans => {
                self.push("CASE WHEN ");
                self.predicate(expr)?;
                self.push(" THEN 1 ELSE 0 END");
                Ok(())
            }
            Position::Value => self.value(expr),
            Position::Predicate if expr.is_predicate() => self.predicate(expr),
            Position::Predicate => match expr.as_constant() {
                Some(Value::Bool(true)) => {
                    self.push("1 = 1");
                    Ok(())
                }
                Some(Value::Bool(false)) => {
                    self.push("1 = 0");
                    Ok(())
                }
                _ if booleans => self.value(expr),
                _ => {
                    self.push("(");
                    self.value(expr)?;
                    self.push(" <> 0)");
                    Ok(())
                }
            },
        }
    }

    /// A node that is a truth value in SQL
    fn predicate(&mut self, expr: &Expr) -> RenderResult {
        match expr {
            Expr::Binary(b) => self.binary(b),
            Expr::Unary(u) if u.op == UnaryOp::Not => match &u.operand {
                Expr::IsNull(test) => {
                    self.expr(&test.expr, Position::Value)?;
                    self.push(" IS NOT NULL");
                    Ok(())
                }
                operand => {
                    self.push("NOT ");
                    self.expr(operand, Position::Predicate)
                }
            },
            Expr::IsNull(test) => {
                self.expr(&test.expr, Position::Value)?;
                self.push(" IS NULL");
                Ok(())
            }
            Expr::Exists(e) => {
                self.push("EXISTS(");
                self.select(&e.select)?;
                self.push(")");
                Ok(())
            }
            Expr::In(e) => {
                if let InValues::List(values) = &e.values {
                    if values.is_empty() {
                        self.push("1 = 0");
                        return Ok(());
                    }
                }
                self.expr(&e.expr, Position::Value)?;
                self.push(" IN (");
                match &e.values {
                    InValues::Select(select) => self.select(select)?,
                    InValues::List(values) => self.list(values)?,
                }
                self.push(")");
                Ok(())
            }
            Expr::Between(b) => {
                self.expr(&b.expr, Position::Value)?;
                self.push(" BETWEEN ");
                self.expr(&b.lower, Position::Value)?;
                self.push(" AND ");
                self.expr(&b.upper, Position::Value)
            }
            Expr::Function(f) if f.function.is_predicate() => self.like(f),
            other => Err(unsupported(other)),
        }
    }

    fn binary(&mut self, b: &BinaryExpr) -> RenderResult {
        if b.op == BinaryOp::Coalesce {
            self.push("COALESCE(");
            self.expr(&b.left, Position::Value)?;
            self.push(", ");
            self.expr(&b.right, Position::Value)?;
            self.push(")");
            return Ok(());
        }
        if matches!(b.op, BinaryOp::Eq | BinaryOp::Ne) {
            let tested = match (&b.left, &b.right) {
                (e, n) | (n, e) if n.is_null_constant() => Some(e),
                _ => None,
            };
            if let Some(tested) = tested {
                self.expr(tested, Position::Value)?;
                self.push(if b.op == BinaryOp::Eq { " IS NULL" } else { " IS NOT NULL" });
                return Ok(());
            }
        }
        let operand = if b.op.is_logical() {
            Position::Predicate
        } else {
            Position::Value
        };
        let op = match b.op {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Concat => self.dialect.concat_operator(),
            BinaryOp::Coalesce => return Err(RenderError::UnsupportedNode { node: "Binary" }),
        };
        self.push("(");
        self.expr(&b.left, operand)?;
        self.push(" ");
        self.push(op);
        self.push(" ");
        self.expr(&b.right, operand)?;
        self.push(")");
        Ok(())
    }

    /// `StartsWith` / `EndsWith` / `Contains` as `LIKE` with wildcards
    fn like(&mut self, f: &FunctionExpr) -> RenderResult {
        let [subject, pattern] = f.args.as_slice() else {
            return Err(RenderError::UnsupportedNode { node: "Function" });
        };
        let concat = self.dialect.concat_operator();
        self.push("(");
        self.expr(subject, Position::Value)?;
        self.push(" LIKE ");
        if matches!(f.function, ScalarFunction::EndsWith | ScalarFunction::Contains) {
            self.push("'%' ");
            self.push(concat);
            self.push(" ");
        }
        self.like_pattern(pattern)?;
        if matches!(f.function, ScalarFunction::StartsWith | ScalarFunction::Contains) {
            self.push(" ");
            self.push(concat);
            self.push(" '%'");
        }
        let escape = format!(" ESCAPE '{LIKE_ESCAPE}')");
        self.push(&escape);
        Ok(())
    }

    /// The searched text with its wildcards escaped, so it matches literally
    fn like_pattern(&mut self, pattern: &Expr) -> RenderResult {
        let wildcards = self.dialect.like_wildcards();
        if let Expr::Constant(c) = pattern {
            if let Value::String(text) = &c.value {
                let mut escaped = String::with_capacity(text.len());
                for ch in text.chars() {
                    if ch == LIKE_ESCAPE || wildcards.contains(&ch) {
                        escaped.push(LIKE_ESCAPE);
                    }
                    escaped.push(ch);
                }
                let text = format!("'{}'", escaped.replace('\'', "''"));
                self.push(&text);
                return Ok(());
            }
        }
        // parameters and columns are escaped by the server
        let replaced: Vec<char> = std::iter::once(LIKE_ESCAPE)
            .chain(wildcards.iter().copied())
            .collect();
        for _ in &replaced {
            self.push("REPLACE(");
        }
        self.expr(pattern, Position::Value)?;
        for ch in replaced {
            let text = format!(", '{ch}', '{LIKE_ESCAPE}{ch}')");
            self.push(&text);
        }
        Ok(())
    }

    fn list(&mut self, values: &[Expr]) -> RenderResult {
        for (i, v) in values.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.expr(v, Position::Value)?;
        }
        Ok(())
    }

    /// A node that is a scalar value in SQL
    fn value(&mut self, expr: &Expr) -> RenderResult {
        match expr {
            Expr::Constant(c) => self.literal(expr, &c.value),
            Expr::Column(c) => {
                if let Some(name) = self.names.get(&c.alias) {
                    let prefix = format!("{name}.");
                    self.push(&prefix);
                }
                self.quoted(&c.name);
                Ok(())
            }
            Expr::NamedValue(n) => {
                let placeholder = self.dialect.parameter_placeholder(&n.name);
                self.push(&placeholder);
                if self.seen.insert(n.name.clone()) {
                    self.params.push(QueryParameter {
                        name: n.name.clone(),
                        ty: n.value.value_type(),
                        db_type: n.db_type,
                        value: n.value.clone(),
                    });
                }
                Ok(())
            }
            Expr::Variable(v) => {
                let name = self.dialect.variable_name(&v.name);
                self.push(&name);
                Ok(())
            }
            Expr::Unary(u) if u.op == UnaryOp::Negate => {
                self.push("-");
                self.expr(&u.operand, Position::Value)
            }
            Expr::Binary(b) if !b.op.is_comparison() && !b.op.is_logical() => self.binary(b),
            Expr::Conditional(c) => {
                self.push("CASE WHEN ");
                self.expr(&c.test, Position::Predicate)?;
                self.push(" THEN ");
                self.expr(&c.if_true, Position::Value)?;
                self.push(" ELSE ");
                self.expr(&c.if_false, Position::Value)?;
                self.push(" END");
                Ok(())
            }
            Expr::Function(f) if !f.function.is_predicate() => self.function(f),
            Expr::Scalar(s) => {
                self.push("(");
                self.select(&s.select)?;
                self.push(")");
                Ok(())
            }
            Expr::Aggregate(a) => self.aggregate(a),
            Expr::RowNumber(r) => {
                self.push("ROW_NUMBER() OVER (ORDER BY ");
                self.orderings(&r.order_by)?;
                self.push(")");
                Ok(())
            }
            // boolean-capable products read predicates as values directly
            other if other.is_predicate() => self.predicate(other),
            other => Err(unsupported(other)),
        }
    }

    fn literal(&mut self, expr: &Expr, value: &Value) -> RenderResult {
        match value {
            Value::Null => self.push("NULL"),
            Value::Bool(b) => self.push(if *b { "1" } else { "0" }),
            Value::Number(n) => {
                let text = n.to_string();
                self.push(&text);
            }
            Value::String(s) => {
                let text = format!("'{}'", s.replace('\'', "''"));
                self.push(&text);
            }
            Value::Array(_) | Value::Object(_) => return Err(unsupported(expr)),
        }
        Ok(())
    }

    fn function(&mut self, f: &FunctionExpr) -> RenderResult {
        let name = self.dialect.function_name(f.function);
        self.push(name);
        // niladic keyword, takes no argument list
        if f.args.is_empty() && name == "CURRENT_TIMESTAMP" {
            return Ok(());
        }
        self.push("(");
        self.list(&f.args)?;
        self.push(")");
        Ok(())
    }

    fn aggregate(&mut self, a: &AggregateExpr) -> RenderResult {
        let name = match a.kind {
            AggregateKind::Count => "COUNT",
            AggregateKind::Sum => "SUM",
            AggregateKind::Min => "MIN",
            AggregateKind::Max => "MAX",
            AggregateKind::Average => "AVG",
        };
        self.push(name);
        self.push("(");
        if a.distinct {
            if !self.dialect.allows_distinct_in_aggregate() {
                return Err(self.unsupported_for_dialect("DISTINCT in aggregates"));
            }
            self.push("DISTINCT ");
        }
        match &a.argument {
            Some(arg) if a.kind == AggregateKind::Average && self.integer_average(arg) => {
                let float = self.dialect.type_system().column_type(ScalarKind::Float);
                self.push("CAST(");
                self.expr(arg, Position::Value)?;
                let cast = format!(" AS {})", self.dialect.format_type(&float, true));
                self.push(&cast);
            }
            Some(arg) => self.expr(arg, Position::Value)?,
            None => self.push("*"),
        }
        self.push(")");
        Ok(())
    }

    fn integer_average(&self, argument: &Expr) -> bool {
        self.dialect.truncates_integer_average()
            && matches!(
                argument.value_type().scalar_kind(),
                Some(ScalarKind::Int | ScalarKind::BigInt)
            )
    }
}
