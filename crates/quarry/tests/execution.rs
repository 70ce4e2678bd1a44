//! Plans run against a canned executor, plus commands and the plan cache.

mod common;

use common::{bare_server, compiler, init_test_logging, northwind, server, sqlite, FakeExecutor};
use quarry::types::{Name, ValueType};
use quarry::{
    CommandBuilder, CompilerConfig, ExecutionError, Expr, QueryCompiler, QueryError, ScalarKind,
};
use serde_json::json;

fn customers() -> FakeExecutor {
    FakeExecutor::new().with_rows(
        "Customers",
        vec![
            vec![json!("London"), json!("AROUT"), json!("Around the Horn"), json!("555-1")],
            vec![json!("London"), json!("BSBEV"), json!("B's Beverages"), json!(null)],
        ],
    )
}

// ============================================================================
// Materialization
// ============================================================================

#[test]
fn test_entities_are_materialized_from_rows() {
    init_test_logging();
    let mapping = northwind();
    let compiler = compiler(&mapping, server());
    let query = Expr::source("Customer")
        .filter("c", |c| c.member("City").equal(Expr::constant("London")));

    let executor = customers();
    let value = compiler.query(&query, &executor).unwrap();

    assert_eq!(
        value,
        json!([
            { "City": "London", "CustomerID": "AROUT", "CompanyName": "Around the Horn", "Phone": "555-1" },
            { "City": "London", "CustomerID": "BSBEV", "CompanyName": "B's Beverages", "Phone": null },
        ])
    );
    let queries = executor.queries();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].1, vec![(Name::from("a0"), json!("London"))]);
}

#[test]
fn test_cached_plan_runs_with_new_arguments() {
    init_test_logging();
    let mapping = northwind();
    let compiler = compiler(&mapping, server());
    let by_city = |city: &str| {
        Expr::source("Customer").filter("c", |c| c.member("City").equal(Expr::constant(city)))
    };

    let executor = customers();
    compiler.query(&by_city("London"), &executor).unwrap();
    compiler.query(&by_city("Paris"), &executor).unwrap();

    assert_eq!(compiler.cache().len(), 1);
    let queries = executor.queries();
    assert_eq!(queries[0].0, queries[1].0);
    assert_eq!(queries[1].1, vec![(Name::from("a0"), json!("Paris"))]);
}

#[test]
fn test_first_on_empty_result_fails() {
    let mapping = northwind();
    let compiler = compiler(&mapping, server());
    let executor = FakeExecutor::new().with_rows("Customers", Vec::new());

    let err = compiler.query(&Expr::source("Customer").first(), &executor).unwrap_err();
    assert_eq!(err, QueryError::Execution(ExecutionError::NoElements));

    let value = compiler
        .query(&Expr::source("Customer").first_or_default(), &executor)
        .unwrap();
    assert_eq!(value, json!(null));
}

#[test]
fn test_executor_failures_surface() {
    let mapping = northwind();
    let compiler = compiler(&mapping, server());
    let err = compiler
        .query(&Expr::source("Order"), &FakeExecutor::new())
        .unwrap_err();
    assert!(matches!(err, QueryError::Execution(ExecutionError::Executor(_))));
}

// ============================================================================
// Client joins
// ============================================================================

#[test]
fn test_null_correlation_keys_match_nothing() {
    init_test_logging();
    let mapping = northwind();
    let compiler = compiler(&mapping, server());
    let query = Expr::source("Customer").map("c", |c| {
        let phone = c.clone().member("Phone");
        Expr::record([
            ("Id", c.member("CustomerID")),
            (
                "Same",
                Expr::source("Order")
                    .filter("o", |o| o.member("CustomerID").equal(phone))
                    .map("o", |o| o.member("OrderID")),
            ),
        ])
    });

    let executor = FakeExecutor::new()
        .with_rows("Customers", vec![vec![json!("A"), json!(null)]])
        .with_rows(
            "Orders",
            vec![vec![json!(1), json!(null)], vec![json!(2), json!(null)]],
        );
    let value = compiler.query(&query, &executor).unwrap();

    assert_eq!(value, json!([{ "Id": "A", "Same": [] }]));
    assert_eq!(executor.queries().len(), 2);
}

#[test]
fn test_client_join_query_is_restricted_by_outer_filter() {
    let mapping = northwind();
    let compiler = compiler(&mapping, server());
    let query = Expr::source("Customer")
        .filter("c", |c| c.member("City").equal(Expr::constant("London")))
        .map("c", |c| c.member("Orders"));

    let executor = FakeExecutor::new()
        .with_rows("Customers", vec![vec![json!("AROUT")], vec![json!("BSBEV")]])
        .with_rows(
            "Orders",
            vec![
                vec![json!(10), json!("AROUT"), json!("1996-07-04")],
                vec![json!(11), json!("BSBEV"), json!("1996-07-05")],
            ],
        );
    compiler.query(&query, &executor).unwrap();

    let queries = executor.queries();
    assert_eq!(queries.len(), 2);
    let (orders_sql, orders_args) = &queries[1];
    assert!(orders_sql.starts_with("SELECT "), "{orders_sql}");
    assert!(orders_sql.contains("FROM [Orders]"), "{orders_sql}");
    assert!(orders_sql.contains("EXISTS("), "{orders_sql}");
    assert!(orders_sql.contains("[City] = @a0"), "{orders_sql}");
    assert_eq!(orders_args, &vec![(Name::from("a0"), json!("London"))]);
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_compiler_from_config_disables_cache() {
    let mapping = northwind();
    let config =
        CompilerConfig::from_toml_str("dialect = \"sqlite\"\n[cache]\nenabled = false\n").unwrap();
    let compiler = QueryCompiler::from_config(&mapping, &config).unwrap();
    let executor = customers();

    compiler.query(&Expr::source("Customer"), &executor).unwrap();
    compiler.query(&Expr::source("Customer"), &executor).unwrap();

    assert!(compiler.cache().is_empty());
    assert!(executor.queries()[0].0.contains("FROM \"Customers\""));
}

// ============================================================================
// Commands
// ============================================================================

#[test]
fn test_commands_share_the_query_vocabulary() {
    let mapping = northwind();
    let dialect = bare_server();
    let builder = CommandBuilder::new(&mapping, &*dialect);

    let update = builder
        .update("Customer", &json!({ "CustomerID": "ALFKI", "Phone": "030-0074321" }))
        .unwrap();
    let rendered = builder.render(&[update]).unwrap();
    assert_eq!(rendered[0].sql, "UPDATE [Customers] SET [Phone] = p0 WHERE ([CustomerID] = p1)");
    assert_eq!(rendered[0].params[1].value, Expr::constant("ALFKI"));
}

#[test]
fn test_insert_without_generated_members_is_one_statement() {
    let mapping = northwind();
    let compiler = compiler(&mapping, sqlite());
    let commands = compiler
        .commands()
        .insert(
            "Customer",
            &json!({ "CustomerID": "ALFKI", "CompanyName": "Alfreds", "City": "Berlin" }),
        )
        .unwrap();
    let rendered = compiler.commands().render(&commands).unwrap();

    assert_eq!(rendered.len(), 1);
    assert_eq!(
        rendered[0].sql,
        "INSERT INTO \"Customers\"(\"City\", \"CustomerID\", \"CompanyName\", \"Phone\") VALUES (:p0, :p1, :p2, :p3)"
    );
    assert_eq!(
        rendered[0].params[3].value,
        Expr::constant_of(json!(null), ValueType::Scalar(ScalarKind::Text))
    );
}
