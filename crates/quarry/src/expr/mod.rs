//! Query expression model.
//!
//! A closed sum type over every node the pipeline handles: the caller-facing
//! query language (members, lambdas, sequence operators), the relational
//! vocabulary (tables, columns, selects, joins, subqueries), client-side
//! reconstruction nodes (entities, outer-joined values, projections, client
//! joins) and data-modification commands.
//!
//! Nodes are immutable. Composite variants hold their payload behind an
//! [`Arc`], so cloning a tree is cheap and a rewrite that changes nothing can
//! hand back the original allocation (see [`Expr::same`]).

mod query;
pub mod rewrite;
pub mod util;
pub mod visit;

use crate::types::{Name, QueryType, ScalarKind, TypeSystem, Value, ValueType};
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

/// Opaque identity of a table or select within one compilation.
///
/// Equality is handle equality; aliases carry no name. The formatter assigns
/// printable names when the SQL text is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableAlias(u32);

impl TableAlias {
    pub fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TableAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "A{}", self.0)
    }
}

/// Allocates fresh aliases for one compilation
#[derive(Debug, Default)]
pub struct AliasGenerator {
    next: Cell<u32>,
}

impl AliasGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_alias(&self) -> TableAlias {
        let id = self.next.get();
        self.next.set(id + 1);
        TableAlias(id)
    }
}

// ============================================================================
// Query-language nodes
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ConstantExpr {
    pub value: Value,
    pub ty: ValueType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemberExpr {
    pub expr: Expr,
    pub member: Name,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Negate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnaryExpr {
    pub op: UnaryOp,
    pub operand: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
    Coalesce,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, Self::And | Self::Or)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryExpr {
    pub op: BinaryOp,
    pub left: Expr,
    pub right: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalExpr {
    pub test: Expr,
    pub if_true: Expr,
    pub if_false: Expr,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NewKind {
    /// Anonymous record
    Record,
    /// Construction of a mapped entity
    Entity(Name),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewExpr {
    pub kind: NewKind,
    pub fields: Vec<(Name, Expr)>,
}

impl NewExpr {
    pub fn field(&self, name: &str) -> Option<&Expr> {
        self.fields
            .iter()
            .find(|(n, _)| &**n == name)
            .map(|(_, e)| e)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|(n, _)| &**n).collect()
    }
}

/// Scalar functions understood by every dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarFunction {
    Lower,
    Upper,
    Length,
    Trim,
    Substring,
    Abs,
    Round,
    Now,
    StartsWith,
    EndsWith,
    Contains,
    /// Database-generated identity of the last insert
    GeneratedId,
}

impl ScalarFunction {
    /// Functions rendered as `LIKE` predicates
    pub fn is_predicate(self) -> bool {
        matches!(self, Self::StartsWith | Self::EndsWith | Self::Contains)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionExpr {
    pub function: ScalarFunction,
    pub ty: ValueType,
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LambdaExpr {
    pub params: Vec<Name>,
    pub body: Expr,
}

impl LambdaExpr {
    pub fn new(params: &[&str], body: Expr) -> Arc<Self> {
        Arc::new(Self {
            params: params.iter().map(|p| Name::from(*p)).collect(),
            body,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

impl OrderDirection {
    pub fn reversed(self) -> Self {
        match self {
            Self::Ascending => Self::Descending,
            Self::Descending => Self::Ascending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateKind {
    Count,
    Sum,
    Min,
    Max,
    Average,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    First,
    FirstOrDefault,
    Single,
    SingleOrDefault,
}

/// Sequence operators of the input language
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceOp {
    Source {
        entity: Name,
    },
    Where {
        source: Expr,
        predicate: Arc<LambdaExpr>,
    },
    Select {
        source: Expr,
        selector: Arc<LambdaExpr>,
    },
    SelectMany {
        source: Expr,
        collection: Arc<LambdaExpr>,
        result: Option<Arc<LambdaExpr>>,
    },
    Join {
        outer: Expr,
        inner: Expr,
        outer_key: Arc<LambdaExpr>,
        inner_key: Arc<LambdaExpr>,
        result: Arc<LambdaExpr>,
    },
    GroupBy {
        source: Expr,
        key: Arc<LambdaExpr>,
        element: Option<Arc<LambdaExpr>>,
    },
    OrderBy {
        source: Expr,
        key: Arc<LambdaExpr>,
        direction: OrderDirection,
        /// `ThenBy` when true
        then: bool,
    },
    Reverse {
        source: Expr,
    },
    Skip {
        source: Expr,
        count: Expr,
    },
    Take {
        source: Expr,
        count: Expr,
    },
    Distinct {
        source: Expr,
    },
    DefaultIfEmpty {
        source: Expr,
    },
    Aggregate {
        source: Expr,
        kind: AggregateKind,
        selector: Option<Arc<LambdaExpr>>,
    },
    Any {
        source: Expr,
        predicate: Option<Arc<LambdaExpr>>,
    },
    All {
        source: Expr,
        predicate: Arc<LambdaExpr>,
    },
    Contains {
        source: Expr,
        value: Expr,
    },
    Element {
        source: Expr,
        kind: ElementKind,
        predicate: Option<Arc<LambdaExpr>>,
    },
}

// ============================================================================
// Relational nodes
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct TableExpr {
    pub alias: TableAlias,
    pub entity: Name,
    pub name: Name,
}

/// Reference to a column produced by the node owning `alias`
#[derive(Debug, Clone)]
pub struct ColumnExpr {
    pub ty: ValueType,
    pub db_type: QueryType,
    pub alias: TableAlias,
    pub name: Name,
}

/// Columns compare by `(alias, name)` only
impl PartialEq for ColumnExpr {
    fn eq(&self, other: &Self) -> bool {
        self.alias == other.alias && self.name == other.name
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDeclaration {
    pub name: Name,
    pub expr: Expr,
    pub db_type: QueryType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderExpr {
    pub direction: OrderDirection,
    pub expr: Expr,
}

impl OrderExpr {
    pub fn new(direction: OrderDirection, expr: Expr) -> Self {
        Self { direction, expr }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectExpr {
    pub alias: TableAlias,
    pub columns: Vec<ColumnDeclaration>,
    pub from: Option<Expr>,
    pub where_clause: Option<Expr>,
    pub order_by: Vec<OrderExpr>,
    pub group_by: Vec<Expr>,
    pub distinct: bool,
    pub skip: Option<Expr>,
    pub take: Option<Expr>,
    /// Transient marker consumed by order-by normalization
    pub reverse: bool,
}

impl SelectExpr {
    pub fn new(alias: TableAlias, columns: Vec<ColumnDeclaration>, from: Option<Expr>) -> Self {
        Self {
            alias,
            columns,
            from,
            where_clause: None,
            order_by: Vec::new(),
            group_by: Vec::new(),
            distinct: false,
            skip: None,
            take: None,
            reverse: false,
        }
    }

    pub fn with_where(mut self, predicate: Option<Expr>) -> Self {
        self.where_clause = predicate;
        self
    }

    pub fn with_order_by(mut self, order_by: Vec<OrderExpr>) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn with_group_by(mut self, group_by: Vec<Expr>) -> Self {
        self.group_by = group_by;
        self
    }

    pub fn with_distinct(mut self, distinct: bool) -> Self {
        self.distinct = distinct;
        self
    }

    pub fn with_skip(mut self, skip: Option<Expr>) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_take(mut self, take: Option<Expr>) -> Self {
        self.take = take;
        self
    }

    pub fn with_reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDeclaration> {
        self.columns.iter().find(|c| &*c.name == name)
    }

    /// Column reference to one of this select's declared columns
    pub fn column_ref(&self, decl: &ColumnDeclaration) -> Expr {
        Expr::column(self.alias, decl.name.clone(), decl.expr.value_type(), decl.db_type)
    }

    /// Whether any declared column is an aggregate
    pub fn has_aggregates(&self) -> bool {
        self.columns
            .iter()
            .any(|c| matches!(c.expr, Expr::Aggregate(_)))
    }

    /// Wrap this select in a new outer select that keeps `self.alias`.
    ///
    /// The original moves under `inner_alias` and the outer select re-exposes
    /// every column by name, so references to `self.alias` stay valid.
    pub fn add_redundant_select(&self, inner_alias: TableAlias) -> SelectExpr {
        let mut inner = self.clone();
        inner.alias = inner_alias;
        let columns = inner
            .columns
            .iter()
            .map(|c| ColumnDeclaration {
                name: c.name.clone(),
                expr: inner.column_ref(c),
                db_type: c.db_type,
            })
            .collect();
        SelectExpr::new(self.alias, columns, Some(Expr::Select(Arc::new(inner))))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinKind {
    Cross,
    Inner,
    LeftOuter,
    /// Left outer join known to match at most one row
    SingletonLeftOuter,
    CrossApply,
    OuterApply,
}

impl JoinKind {
    pub fn is_apply(self) -> bool {
        matches!(self, Self::CrossApply | Self::OuterApply)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinExpr {
    pub kind: JoinKind,
    pub left: Expr,
    pub right: Expr,
    pub condition: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScalarExpr {
    pub ty: ValueType,
    pub select: Arc<SelectExpr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExistsExpr {
    pub select: Arc<SelectExpr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InValues {
    Select(Arc<SelectExpr>),
    List(Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InExpr {
    pub expr: Expr,
    pub values: InValues,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateExpr {
    pub ty: ValueType,
    pub kind: AggregateKind,
    pub argument: Option<Expr>,
    pub distinct: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IsNullExpr {
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BetweenExpr {
    pub expr: Expr,
    pub lower: Expr,
    pub upper: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowNumberExpr {
    pub order_by: Vec<OrderExpr>,
}

/// A bound command parameter
#[derive(Debug, Clone, PartialEq)]
pub struct NamedValueExpr {
    pub name: Name,
    pub db_type: Option<QueryType>,
    pub value: Expr,
}

// ============================================================================
// Client reconstruction nodes
// ============================================================================

/// A constructed object tied to the entity it was read from
#[derive(Debug, Clone, PartialEq)]
pub struct EntityExpr {
    pub entity: Name,
    pub expr: Expr,
}

impl EntityExpr {
    /// The entity's construction, if it is a plain `New`
    pub fn new_expr(&self) -> Option<&NewExpr> {
        match &self.expr {
            Expr::New(n) => Some(n),
            _ => None,
        }
    }
}

/// A value read through a left outer join; `test` is null when nothing matched
#[derive(Debug, Clone, PartialEq)]
pub struct OuterJoinedExpr {
    pub test: Expr,
    pub expr: Expr,
}

/// A group produced by `GroupBy`
#[derive(Debug, Clone, PartialEq)]
pub struct GroupingExpr {
    /// Key in terms of the grouped select's columns
    pub key: Expr,
    /// Elements as a nested projection correlated on `key`
    pub elements: Expr,
    /// Key in terms of the grouped select's source
    pub key_source: Expr,
    /// Element in terms of the grouped select's source
    pub element_source: Expr,
}

/// How a projection's rows become one client value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aggregator {
    First,
    FirstOrDefault,
    Single,
    SingleOrDefault,
}

impl Aggregator {
    pub fn from_element(kind: ElementKind) -> Self {
        match kind {
            ElementKind::First => Self::First,
            ElementKind::FirstOrDefault => Self::FirstOrDefault,
            ElementKind::Single => Self::Single,
            ElementKind::SingleOrDefault => Self::SingleOrDefault,
        }
    }

    pub fn allows_empty(self) -> bool {
        matches!(self, Self::FirstOrDefault | Self::SingleOrDefault)
    }
}

/// A SQL query plus how to turn its rows into client values
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionExpr {
    pub select: Arc<SelectExpr>,
    pub projector: Expr,
    /// `None` for sequence results
    pub aggregator: Option<Aggregator>,
}

impl ProjectionExpr {
    pub fn new(select: SelectExpr, projector: Expr) -> Self {
        Self {
            select: Arc::new(select),
            projector,
            aggregator: None,
        }
    }

    pub fn is_singleton(&self) -> bool {
        self.aggregator.is_some()
    }
}

/// A relationship fetched by a second query and joined in memory
#[derive(Debug, Clone, PartialEq)]
pub struct ClientJoinExpr {
    pub projection: Arc<ProjectionExpr>,
    /// Key evaluated against the outer row
    pub outer_key: Vec<Expr>,
    /// Key evaluated against the inner row
    pub inner_key: Vec<Expr>,
    /// Null keys match each other, as in grouping; otherwise a key with a
    /// null component matches nothing
    pub nulls_match: bool,
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnAssignment {
    pub column: Arc<ColumnExpr>,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertCommand {
    pub table: Arc<TableExpr>,
    pub assignments: Vec<ColumnAssignment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateCommand {
    pub table: Arc<TableExpr>,
    pub where_clause: Option<Expr>,
    pub assignments: Vec<ColumnAssignment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteCommand {
    pub table: Arc<TableExpr>,
    pub where_clause: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockCommand {
    pub commands: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfCommand {
    pub check: Expr,
    pub if_true: Expr,
    pub if_false: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableDeclaration {
    pub name: Name,
    pub db_type: QueryType,
    pub expr: Expr,
}

/// Declares variables assigned from `source`'s single row
#[derive(Debug, Clone, PartialEq)]
pub struct DeclarationCommand {
    pub variables: Vec<VariableDeclaration>,
    pub source: Option<Arc<SelectExpr>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableExpr {
    pub name: Name,
    pub ty: ValueType,
    pub db_type: QueryType,
}

// ============================================================================
// The node union
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Constant(Arc<ConstantExpr>),
    /// Lambda parameter reference, resolved innermost scope first
    Parameter(Name),
    Member(Arc<MemberExpr>),
    Unary(Arc<UnaryExpr>),
    Binary(Arc<BinaryExpr>),
    Conditional(Arc<ConditionalExpr>),
    New(Arc<NewExpr>),
    Function(Arc<FunctionExpr>),
    Lambda(Arc<LambdaExpr>),
    Sequence(Arc<SequenceOp>),
    Table(Arc<TableExpr>),
    Column(Arc<ColumnExpr>),
    Select(Arc<SelectExpr>),
    Join(Arc<JoinExpr>),
    Scalar(Arc<ScalarExpr>),
    Exists(Arc<ExistsExpr>),
    In(Arc<InExpr>),
    Aggregate(Arc<AggregateExpr>),
    IsNull(Arc<IsNullExpr>),
    Between(Arc<BetweenExpr>),
    RowNumber(Arc<RowNumberExpr>),
    NamedValue(Arc<NamedValueExpr>),
    Entity(Arc<EntityExpr>),
    OuterJoined(Arc<OuterJoinedExpr>),
    Grouping(Arc<GroupingExpr>),
    Projection(Arc<ProjectionExpr>),
    ClientJoin(Arc<ClientJoinExpr>),
    Insert(Arc<InsertCommand>),
    Update(Arc<UpdateCommand>),
    Delete(Arc<DeleteCommand>),
    Block(Arc<BlockCommand>),
    If(Arc<IfCommand>),
    Declaration(Arc<DeclarationCommand>),
    Variable(Arc<VariableExpr>),
}

impl Expr {
    pub fn constant_of(value: Value, ty: ValueType) -> Self {
        Self::Constant(Arc::new(ConstantExpr { value, ty }))
    }

    /// Constant whose type is inferred from the value
    pub fn constant(value: impl Into<Value>) -> Self {
        let value = value.into();
        let ty = ValueType::of_value(&value);
        Self::constant_of(value, ty)
    }

    pub fn null() -> Self {
        Self::constant_of(Value::Null, ValueType::Null)
    }

    pub fn column(alias: TableAlias, name: Name, ty: ValueType, db_type: QueryType) -> Self {
        Self::Column(Arc::new(ColumnExpr {
            ty,
            db_type,
            alias,
            name,
        }))
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Self::Binary(Arc::new(BinaryExpr { op, left, right }))
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        Self::Unary(Arc::new(UnaryExpr { op, operand }))
    }

    pub fn negate(self) -> Self {
        Self::unary(UnaryOp::Not, self)
    }

    pub fn is_null_test(expr: Expr) -> Self {
        Self::IsNull(Arc::new(IsNullExpr { expr }))
    }

    pub fn new_record(fields: Vec<(Name, Expr)>) -> Self {
        Self::New(Arc::new(NewExpr {
            kind: NewKind::Record,
            fields,
        }))
    }

    pub fn new_entity(entity: Name, fields: Vec<(Name, Expr)>) -> Self {
        Self::New(Arc::new(NewExpr {
            kind: NewKind::Entity(entity),
            fields,
        }))
    }

    pub fn entity(entity: Name, expr: Expr) -> Self {
        Self::Entity(Arc::new(EntityExpr { entity, expr }))
    }

    pub fn select(select: SelectExpr) -> Self {
        Self::Select(Arc::new(select))
    }

    pub fn projection(projection: ProjectionExpr) -> Self {
        Self::Projection(Arc::new(projection))
    }

    pub fn join(kind: JoinKind, left: Expr, right: Expr, condition: Option<Expr>) -> Self {
        Self::Join(Arc::new(JoinExpr {
            kind,
            left,
            right,
            condition,
        }))
    }

    pub fn aggregate(
        kind: AggregateKind,
        ty: ValueType,
        argument: Option<Expr>,
        distinct: bool,
    ) -> Self {
        Self::Aggregate(Arc::new(AggregateExpr {
            ty,
            kind,
            argument,
            distinct,
        }))
    }

    /// AND-combine predicates, `None` when there are none
    pub fn conjunction(predicates: impl IntoIterator<Item = Expr>) -> Option<Expr> {
        predicates
            .into_iter()
            .reduce(|acc, p| Expr::binary(BinaryOp::And, acc, p))
    }

    pub fn as_constant(&self) -> Option<&Value> {
        match self {
            Self::Constant(c) => Some(&c.value),
            _ => None,
        }
    }

    pub fn is_null_constant(&self) -> bool {
        matches!(self, Self::Constant(c) if c.value.is_null())
    }

    pub fn as_column(&self) -> Option<&ColumnExpr> {
        match self {
            Self::Column(c) => Some(c),
            _ => None,
        }
    }

    /// Short variant name for diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Constant(_) => "Constant",
            Self::Parameter(_) => "Parameter",
            Self::Member(_) => "Member",
            Self::Unary(_) => "Unary",
            Self::Binary(_) => "Binary",
            Self::Conditional(_) => "Conditional",
            Self::New(_) => "New",
            Self::Function(_) => "Function",
            Self::Lambda(_) => "Lambda",
            Self::Sequence(_) => "Sequence",
            Self::Table(_) => "Table",
            Self::Column(_) => "Column",
            Self::Select(_) => "Select",
            Self::Join(_) => "Join",
            Self::Scalar(_) => "Scalar",
            Self::Exists(_) => "Exists",
            Self::In(_) => "In",
            Self::Aggregate(_) => "Aggregate",
            Self::IsNull(_) => "IsNull",
            Self::Between(_) => "Between",
            Self::RowNumber(_) => "RowNumber",
            Self::NamedValue(_) => "NamedValue",
            Self::Entity(_) => "Entity",
            Self::OuterJoined(_) => "OuterJoined",
            Self::Grouping(_) => "Grouping",
            Self::Projection(_) => "Projection",
            Self::ClientJoin(_) => "ClientJoin",
            Self::Insert(_) => "Insert",
            Self::Update(_) => "Update",
            Self::Delete(_) => "Delete",
            Self::Block(_) => "Block",
            Self::If(_) => "If",
            Self::Declaration(_) => "Declaration",
            Self::Variable(_) => "Variable",
        }
    }

    /// Whether both expressions are the same allocation (or equal leaves).
    ///
    /// Rewrites use this to detect that nothing changed without a deep
    /// structural comparison.
    pub fn same(&self, other: &Expr) -> bool {
        match (self, other) {
            (Self::Constant(a), Self::Constant(b)) => Arc::ptr_eq(a, b),
            (Self::Parameter(a), Self::Parameter(b)) => a == b,
            (Self::Member(a), Self::Member(b)) => Arc::ptr_eq(a, b),
            (Self::Unary(a), Self::Unary(b)) => Arc::ptr_eq(a, b),
            (Self::Binary(a), Self::Binary(b)) => Arc::ptr_eq(a, b),
            (Self::Conditional(a), Self::Conditional(b)) => Arc::ptr_eq(a, b),
            (Self::New(a), Self::New(b)) => Arc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => Arc::ptr_eq(a, b),
            (Self::Lambda(a), Self::Lambda(b)) => Arc::ptr_eq(a, b),
            (Self::Sequence(a), Self::Sequence(b)) => Arc::ptr_eq(a, b),
            (Self::Table(a), Self::Table(b)) => Arc::ptr_eq(a, b),
            (Self::Column(a), Self::Column(b)) => Arc::ptr_eq(a, b),
            (Self::Select(a), Self::Select(b)) => Arc::ptr_eq(a, b),
            (Self::Join(a), Self::Join(b)) => Arc::ptr_eq(a, b),
            (Self::Scalar(a), Self::Scalar(b)) => Arc::ptr_eq(a, b),
            (Self::Exists(a), Self::Exists(b)) => Arc::ptr_eq(a, b),
            (Self::In(a), Self::In(b)) => Arc::ptr_eq(a, b),
            (Self::Aggregate(a), Self::Aggregate(b)) => Arc::ptr_eq(a, b),
            (Self::IsNull(a), Self::IsNull(b)) => Arc::ptr_eq(a, b),
            (Self::Between(a), Self::Between(b)) => Arc::ptr_eq(a, b),
            (Self::RowNumber(a), Self::RowNumber(b)) => Arc::ptr_eq(a, b),
            (Self::NamedValue(a), Self::NamedValue(b)) => Arc::ptr_eq(a, b),
            (Self::Entity(a), Self::Entity(b)) => Arc::ptr_eq(a, b),
            (Self::OuterJoined(a), Self::OuterJoined(b)) => Arc::ptr_eq(a, b),
            (Self::Grouping(a), Self::Grouping(b)) => Arc::ptr_eq(a, b),
            (Self::Projection(a), Self::Projection(b)) => Arc::ptr_eq(a, b),
            (Self::ClientJoin(a), Self::ClientJoin(b)) => Arc::ptr_eq(a, b),
            (Self::Insert(a), Self::Insert(b)) => Arc::ptr_eq(a, b),
            (Self::Update(a), Self::Update(b)) => Arc::ptr_eq(a, b),
            (Self::Delete(a), Self::Delete(b)) => Arc::ptr_eq(a, b),
            (Self::Block(a), Self::Block(b)) => Arc::ptr_eq(a, b),
            (Self::If(a), Self::If(b)) => Arc::ptr_eq(a, b),
            (Self::Declaration(a), Self::Declaration(b)) => Arc::ptr_eq(a, b),
            (Self::Variable(a), Self::Variable(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// The client-side type of the value this node produces
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Constant(c) => c.ty.clone(),
            Self::Parameter(_) | Self::Member(_) | Self::Lambda(_) => ValueType::Unknown,
            Self::Unary(u) => match u.op {
                UnaryOp::Not => ValueType::Scalar(ScalarKind::Bool),
                UnaryOp::Negate => u.operand.value_type(),
            },
            Self::Binary(b) => match b.op {
                op if op.is_comparison() || op.is_logical() => ValueType::Scalar(ScalarKind::Bool),
                BinaryOp::Concat => ValueType::Scalar(ScalarKind::Text),
                BinaryOp::Coalesce => match b.left.value_type() {
                    ValueType::Null => b.right.value_type(),
                    other => other,
                },
                _ => match (b.left.value_type(), b.right.value_type()) {
                    (ValueType::Scalar(ScalarKind::Float), _)
                    | (_, ValueType::Scalar(ScalarKind::Float)) => {
                        ValueType::Scalar(ScalarKind::Float)
                    }
                    (ValueType::Null, right) => right,
                    (left, _) => left,
                },
            },
            Self::Conditional(c) => match c.if_true.value_type() {
                ValueType::Null => c.if_false.value_type(),
                other => other,
            },
            Self::New(n) => match &n.kind {
                NewKind::Record => ValueType::Record,
                NewKind::Entity(name) => ValueType::Entity(name.clone()),
            },
            Self::Function(f) => f.ty.clone(),
            Self::Sequence(_) | Self::Select(_) | Self::ClientJoin(_) => ValueType::Sequence,
            Self::Table(_) | Self::Join(_) => ValueType::Unknown,
            Self::Column(c) => c.ty.clone(),
            Self::Scalar(s) => s.ty.clone(),
            Self::Exists(_) | Self::In(_) | Self::IsNull(_) | Self::Between(_) => {
                ValueType::Scalar(ScalarKind::Bool)
            }
            Self::Aggregate(a) => a.ty.clone(),
            Self::RowNumber(_) => ValueType::Scalar(ScalarKind::BigInt),
            Self::NamedValue(n) => n.value.value_type(),
            Self::Entity(e) => ValueType::Entity(e.entity.clone()),
            Self::OuterJoined(o) => o.expr.value_type(),
            Self::Grouping(_) => ValueType::Grouping,
            Self::Projection(p) => {
                if p.is_singleton() {
                    p.projector.value_type()
                } else {
                    ValueType::Sequence
                }
            }
            Self::Insert(_)
            | Self::Update(_)
            | Self::Delete(_)
            | Self::Block(_)
            | Self::If(_)
            | Self::Declaration(_) => ValueType::Unknown,
            Self::Variable(v) => v.ty.clone(),
        }
    }

    /// Database type of the value, falling back to the type system default
    pub fn query_type(&self, types: &dyn TypeSystem) -> Option<QueryType> {
        match self {
            Self::Column(c) => Some(c.db_type),
            Self::NamedValue(n) => n.db_type.or_else(|| n.value.query_type(types)),
            Self::Variable(v) => Some(v.db_type),
            Self::Scalar(s) => s
                .select
                .columns
                .first()
                .map(|c| c.db_type)
                .or_else(|| types.type_for(&s.ty)),
            Self::Aggregate(a) => match (a.kind, &a.argument) {
                (AggregateKind::Min | AggregateKind::Max | AggregateKind::Sum, Some(arg)) => {
                    arg.query_type(types).map(QueryType::nullable)
                }
                _ => types.type_for(&a.ty),
            },
            Self::OuterJoined(o) => o.expr.query_type(types).map(QueryType::nullable),
            other => types.type_for(&other.value_type()),
        }
    }

    /// Whether the node yields a truth value rather than a scalar
    pub fn is_predicate(&self) -> bool {
        match self {
            Self::Binary(b) => b.op.is_comparison() || b.op.is_logical(),
            Self::Unary(u) => u.op == UnaryOp::Not,
            Self::Exists(_) | Self::In(_) | Self::IsNull(_) | Self::Between(_) => true,
            Self::Function(f) => f.function.is_predicate(),
            _ => false,
        }
    }
}

impl From<SelectExpr> for Expr {
    fn from(select: SelectExpr) -> Self {
        Expr::select(select)
    }
}

impl From<ProjectionExpr> for Expr {
    fn from(projection: ProjectionExpr) -> Self {
        Expr::projection(projection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SqlType;

    fn text() -> QueryType {
        QueryType::new(SqlType::NVarChar)
    }

    #[test]
    fn test_aliases_are_unique_per_generator() {
        let gen = AliasGenerator::new();
        let a = gen.next_alias();
        let b = gen.next_alias();
        assert_ne!(a, b);
        assert_eq!(a, a);
    }

    #[test]
    fn test_column_equality_ignores_types() {
        let gen = AliasGenerator::new();
        let alias = gen.next_alias();
        let a = Expr::column(alias, "City".into(), ValueType::Scalar(ScalarKind::Text), text());
        let int = QueryType::new(SqlType::Int);
        let b = Expr::column(alias, "City".into(), ValueType::Unknown, int);
        let c = Expr::column(gen.next_alias(), "City".into(), ValueType::Unknown, text());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_same_is_identity_not_structure() {
        let a = Expr::constant("x");
        let b = Expr::constant("x");
        assert_eq!(a, b);
        assert!(!a.same(&b));
        assert!(a.same(&a.clone()));
    }

    #[test]
    fn test_add_redundant_select_keeps_outer_alias() {
        let gen = AliasGenerator::new();
        let table = gen.next_alias();
        let alias = gen.next_alias();
        let col = Expr::column(table, "City".into(), ValueType::Scalar(ScalarKind::Text), text());
        let select = SelectExpr::new(
            alias,
            vec![ColumnDeclaration {
                name: "City".into(),
                expr: col,
                db_type: text(),
            }],
            None,
        );

        let inner_alias = gen.next_alias();
        let wrapped = select.add_redundant_select(inner_alias);

        assert_eq!(wrapped.alias, alias);
        let Some(Expr::Select(inner)) = &wrapped.from else {
            panic!("expected inner select");
        };
        assert_eq!(inner.alias, inner_alias);
        assert_eq!(
            wrapped.columns[0].expr.as_column().map(|c| c.alias),
            Some(inner_alias)
        );
    }

    #[test]
    fn test_conjunction() {
        assert!(Expr::conjunction(Vec::new()).is_none());
        let p = Expr::conjunction(vec![Expr::constant(true), Expr::constant(false)]).unwrap();
        assert!(matches!(p, Expr::Binary(b) if b.op == BinaryOp::And));
    }
}
