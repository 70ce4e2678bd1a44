//! Execution plans.
//!
//! [`build_plan`] pairs the rendered SQL of a final projection with a
//! compiled [`Materializer`] for its rows and the aggregator that folds
//! those rows into the client result. Client joins are fetched after the
//! primary rows and matched in memory by key.

mod executor;
mod materializer;

pub use executor::{BoundArguments, QueryExecutor, Row, RowReader};
pub use materializer::Materializer;

use crate::dialect::Dialect;
use crate::error::{ExecutionError, QueryResult, TranslationError};
use crate::expr::{Aggregator, Expr, ProjectionExpr};
use crate::render::{QueryRenderer, RenderedQuery, SqlFormatter};
use crate::types::{Name, Value};
use materializer::{comparable_key, join_key, ReadContext, Reader, ReaderCompiler};
use std::collections::HashMap;
use tracing::debug;

/// Caller-supplied values for named parameters, by name
pub type Arguments = HashMap<Name, Value>;

/// Elements of one client join grouped by their key
pub(crate) type Lookup = HashMap<String, Vec<Value>>;

/// A second query whose rows are matched to outer rows by key
#[derive(Debug, Clone)]
pub(crate) struct ClientJoinPlan {
    pub plan: ExecutionPlan,
    /// Key readers over the inner rows
    pub inner_key: Vec<Reader>,
    /// Keep inner rows whose key has a null component
    pub nulls_match: bool,
}

/// A compiled query: command text, row materializer and aggregator
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub command: RenderedQuery,
    pub materializer: Materializer,
    pub aggregator: Option<Aggregator>,
}

/// Compile a final projection into an executable plan
pub fn build_plan(expr: &Expr, dialect: &dyn Dialect) -> QueryResult<ExecutionPlan> {
    let Expr::Projection(projection) = expr else {
        return Err(TranslationError::invalid(
            "Projection",
            format!("plans are built from projections, not {}", expr.kind_name()),
        )
        .into());
    };
    build_nested(projection, dialect, 0)
}

pub(crate) fn build_nested(
    projection: &ProjectionExpr,
    dialect: &dyn Dialect,
    depth: usize,
) -> QueryResult<ExecutionPlan> {
    let command = SqlFormatter::new(dialect).render(&Expr::Select(projection.select.clone()))?;
    let mut compiler = ReaderCompiler::new(dialect, &projection.select, depth);
    let reader = compiler.compile(&projection.projector)?;
    let materializer = compiler.finish(reader);
    debug!(
        depth,
        params = command.params.len(),
        joins = materializer.join_count(),
        "built plan"
    );
    Ok(ExecutionPlan {
        command,
        materializer,
        aggregator: projection.aggregator,
    })
}

impl ExecutionPlan {
    /// Argument values for the command, in parameter order.
    ///
    /// A caller argument wins over the value captured at compile time.
    pub fn bind(&self, arguments: &Arguments) -> Result<BoundArguments, ExecutionError> {
        self.command
            .params
            .iter()
            .map(|p| {
                let value = arguments
                    .get(&p.name)
                    .or_else(|| p.value.as_constant())
                    .cloned()
                    .ok_or_else(|| ExecutionError::MissingArgument {
                        name: p.name.to_string(),
                    })?;
                Ok((p.name.clone(), value))
            })
            .collect()
    }

    /// Run the plan and fold its rows with the aggregator
    pub fn execute(
        &self,
        executor: &dyn QueryExecutor,
        arguments: &Arguments,
    ) -> Result<Value, ExecutionError> {
        let values = self.materialize(executor, arguments, |_, value| Ok(value))?;
        aggregate(self.aggregator, values)
    }

    /// Materialize every row, handing `each` the raw row and its value
    fn materialize<T>(
        &self,
        executor: &dyn QueryExecutor,
        arguments: &Arguments,
        mut each: impl FnMut(&Row, Value) -> Result<T, ExecutionError>,
    ) -> Result<Vec<T>, ExecutionError> {
        let rows = executor.query(&self.command, &self.bind(arguments)?)?;
        let lookups = self
            .materializer
            .joins
            .iter()
            .map(|join| join.fetch(executor, arguments))
            .collect::<Result<Vec<_>, _>>()?;
        let cx = ReadContext {
            executor,
            arguments,
            lookups: &lookups,
        };
        rows.iter()
            .map(|row| {
                let value = self.materializer.read(row, &cx)?;
                each(row, value)
            })
            .collect()
    }
}

impl ClientJoinPlan {
    fn fetch(
        &self,
        executor: &dyn QueryExecutor,
        arguments: &Arguments,
    ) -> Result<Lookup, ExecutionError> {
        let empty = Arguments::new();
        let no_lookups: [Lookup; 0] = [];
        let key_cx = ReadContext {
            executor,
            arguments: &empty,
            lookups: &no_lookups,
        };
        let keyed = self.plan.materialize(executor, arguments, |row, value| {
            let key = self
                .inner_key
                .iter()
                .map(|k| k.read(row, &key_cx))
                .collect::<Result<Vec<_>, _>>()?;
            Ok((key, value))
        })?;
        let mut lookup = Lookup::new();
        for (key, value) in keyed {
            if !self.nulls_match && !comparable_key(&key) {
                continue;
            }
            lookup.entry(join_key(&key)).or_default().push(value);
        }
        debug!(keys = lookup.len(), "fetched client join");
        Ok(lookup)
    }
}

/// Fold materialized rows into the client result
pub fn aggregate(
    aggregator: Option<Aggregator>,
    values: Vec<Value>,
) -> Result<Value, ExecutionError> {
    let Some(aggregator) = aggregator else {
        return Ok(Value::Array(values));
    };
    let single = matches!(aggregator, Aggregator::Single | Aggregator::SingleOrDefault);
    if single && values.len() > 1 {
        return Err(ExecutionError::MoreThanOneElement);
    }
    match values.into_iter().next() {
        Some(value) => Ok(value),
        None if aggregator.allows_empty() => Ok(Value::Null),
        None => Err(ExecutionError::NoElements),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::SqlServerDialect;
    use crate::expr::{
        AliasGenerator, ClientJoinExpr, ColumnDeclaration, NamedValueExpr, SelectExpr, TableExpr,
    };
    use crate::types::{QueryType, ScalarKind, SqlType, ValueType};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// Answers each command with canned rows, recording what it ran
    #[derive(Default)]
    struct CannedExecutor {
        responses: HashMap<String, Vec<Row>>,
        log: Mutex<Vec<(String, BoundArguments)>>,
    }

    impl CannedExecutor {
        fn respond(mut self, table: &str, rows: Vec<Row>) -> Self {
            self.responses.insert(table.to_string(), rows);
            self
        }
    }

    impl QueryExecutor for CannedExecutor {
        fn query(
            &self,
            command: &RenderedQuery,
            arguments: &BoundArguments,
        ) -> Result<Vec<Row>, ExecutionError> {
            self.log
                .lock()
                .map_err(|e| ExecutionError::Executor(e.to_string()))?
                .push((command.sql.clone(), arguments.clone()));
            Ok(self
                .responses
                .iter()
                .find(|(table, _)| command.sql.contains(&format!("[{table}]")))
                .map(|(_, rows)| rows.clone())
                .unwrap_or_default())
        }

        fn execute(
            &self,
            _command: &RenderedQuery,
            _arguments: &BoundArguments,
        ) -> Result<u64, ExecutionError> {
            Ok(0)
        }
    }

    fn text() -> QueryType {
        QueryType::new(SqlType::NVarChar)
    }

    fn column(alias: crate::expr::TableAlias, name: &str) -> Expr {
        Expr::column(alias, name.into(), ValueType::Scalar(ScalarKind::Text), text())
    }

    fn table_select(gen: &AliasGenerator, table: &str, columns: &[&str]) -> SelectExpr {
        let t = gen.next_alias();
        let from = Expr::Table(Arc::new(TableExpr {
            alias: t,
            entity: table.into(),
            name: table.into(),
        }));
        let columns = columns
            .iter()
            .map(|c| ColumnDeclaration {
                name: (*c).into(),
                expr: column(t, c),
                db_type: text(),
            })
            .collect();
        SelectExpr::new(gen.next_alias(), columns, Some(from))
    }

    #[test]
    fn test_sequence_result_reads_records() {
        let gen = AliasGenerator::new();
        let select = table_select(&gen, "Customers", &["City", "Phone"]);
        let a = select.alias;
        let projector = Expr::record([("City", column(a, "City")), ("Phone", column(a, "Phone"))]);
        let projection = Expr::projection(ProjectionExpr::new(select, projector));
        let plan = build_plan(&projection, &SqlServerDialect::new()).unwrap();

        let executor = CannedExecutor::default().respond(
            "Customers",
            vec![Row::new(vec![json!("London"), json!("555")])],
        );
        let result = plan.execute(&executor, &Arguments::new()).unwrap();
        assert_eq!(result, json!([{ "City": "London", "Phone": "555" }]));
    }

    #[test]
    fn test_aggregators() {
        assert_eq!(aggregate(Some(Aggregator::First), vec![json!(1), json!(2)]).unwrap(), json!(1));
        assert_eq!(aggregate(Some(Aggregator::FirstOrDefault), Vec::new()).unwrap(), Value::Null);
        assert_eq!(
            aggregate(Some(Aggregator::Single), Vec::new()).unwrap_err(),
            ExecutionError::NoElements
        );
        assert_eq!(
            aggregate(Some(Aggregator::SingleOrDefault), vec![json!(1), json!(2)]).unwrap_err(),
            ExecutionError::MoreThanOneElement
        );
        assert_eq!(aggregate(None, vec![json!(1)]).unwrap(), json!([1]));
    }

    #[test]
    fn test_arguments_override_compiled_values() {
        let gen = AliasGenerator::new();
        let select = table_select(&gen, "Customers", &["City"]);
        let a = select.alias;
        let param = Expr::NamedValue(Arc::new(NamedValueExpr {
            name: "p0".into(),
            db_type: Some(text()),
            value: Expr::constant("London"),
        }));
        let select = select.with_where(Some(column(a, "City").equal(param)));
        let projection = ProjectionExpr::new(select.clone(), column(select.alias, "City"));
        let plan = build_plan(&Expr::projection(projection), &SqlServerDialect::new()).unwrap();

        assert_eq!(
            plan.bind(&Arguments::new()).unwrap(),
            vec![(Name::from("p0"), json!("London"))]
        );
        let mut args = Arguments::new();
        args.insert("p0".into(), json!("Paris"));
        assert_eq!(plan.bind(&args).unwrap()[0].1, json!("Paris"));
    }

    /// Customers with their orders joined on `CustomerID`
    fn customer_orders(nulls_match: bool) -> ExecutionPlan {
        let gen = AliasGenerator::new();
        let orders = table_select(&gen, "Orders", &["OrderID", "CustomerID"]);
        let o = orders.alias;
        let customers = table_select(&gen, "Customers", &["CustomerID"]);
        let c = customers.alias;

        let join = Expr::ClientJoin(Arc::new(ClientJoinExpr {
            projection: Arc::new(ProjectionExpr::new(orders, column(o, "OrderID"))),
            outer_key: vec![column(c, "CustomerID")],
            inner_key: vec![column(o, "CustomerID")],
            nulls_match,
        }));
        let projector = Expr::record([("Id", column(c, "CustomerID")), ("Orders", join)]);
        build_plan(
            &Expr::projection(ProjectionExpr::new(customers, projector)),
            &SqlServerDialect::new(),
        )
        .unwrap()
    }

    fn null_keyed_rows() -> CannedExecutor {
        CannedExecutor::default()
            .respond("Customers", vec![Row::new(vec![json!("A")]), Row::new(vec![Value::Null])])
            .respond(
                "Orders",
                vec![
                    Row::new(vec![json!("1"), json!("A")]),
                    Row::new(vec![json!("2"), Value::Null]),
                ],
            )
    }

    #[test]
    fn test_client_join_matches_rows_by_key() {
        let plan = customer_orders(false);
        assert_eq!(plan.materializer.join_count(), 1);
        assert!(!plan.materializer.has_per_row_queries());

        let executor = CannedExecutor::default()
            .respond("Customers", vec![Row::new(vec![json!("A")]), Row::new(vec![json!("B")])])
            .respond(
                "Orders",
                vec![
                    Row::new(vec![json!("1"), json!("A")]),
                    Row::new(vec![json!("2"), json!("A")]),
                    Row::new(vec![json!("3"), json!("C")]),
                ],
            );
        let result = plan.execute(&executor, &Arguments::new()).unwrap();
        assert_eq!(
            result,
            json!([
                { "Id": "A", "Orders": ["1", "2"] },
                { "Id": "B", "Orders": [] }
            ])
        );
        // one query per side, not one per customer
        assert_eq!(executor.log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_client_join_null_keys_match_nothing() {
        let plan = customer_orders(false);
        let result = plan.execute(&null_keyed_rows(), &Arguments::new()).unwrap();
        assert_eq!(
            result,
            json!([
                { "Id": "A", "Orders": ["1"] },
                { "Id": null, "Orders": [] }
            ])
        );
    }

    #[test]
    fn test_client_join_null_keys_match_when_grouping() {
        let plan = customer_orders(true);
        let result = plan.execute(&null_keyed_rows(), &Arguments::new()).unwrap();
        assert_eq!(
            result,
            json!([
                { "Id": "A", "Orders": ["1"] },
                { "Id": null, "Orders": ["2"] }
            ])
        );
    }

    #[test]
    fn test_correlated_projection_runs_per_row() {
        let gen = AliasGenerator::new();
        let customers = table_select(&gen, "Customers", &["CustomerID"]);
        let c = customers.alias;
        let orders = table_select(&gen, "Orders", &["OrderID", "CustomerID"]);
        let o = orders.alias;
        let correlated = orders.with_where(Some(
            column(o, "CustomerID")
                .equal(column(c, "CustomerID"))
                .or(Expr::is_null_test(column(c, "CustomerID"))),
        ));
        let nested = Expr::projection(ProjectionExpr::new(correlated, column(o, "OrderID")));
        let plan = build_plan(
            &Expr::projection(ProjectionExpr::new(customers, nested)),
            &SqlServerDialect::new(),
        )
        .unwrap();
        assert!(plan.materializer.has_per_row_queries());

        let executor = CannedExecutor::default()
            .respond("Customers", vec![Row::new(vec![json!("A")]), Row::new(vec![json!("B")])]);
        let result = plan.execute(&executor, &Arguments::new()).unwrap();
        assert_eq!(result, json!([[], []]));

        let log = executor.log.lock().unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[1].1, vec![(Name::from("o0_0"), json!("A"))]);
        assert_eq!(log[2].1, vec![(Name::from("o0_0"), json!("B"))]);
    }
}
