//! End-to-end translation of representative queries.

mod common;

use common::{bare_server, compiler, northwind, select_list, server, sqlite};
use quarry::{Expr, QueryError, TranslationError};

fn london() -> Expr {
    Expr::source("Customer").filter("c", |c| c.member("City").equal(Expr::constant("London")))
}

// ============================================================================
// Filters and projections
// ============================================================================

#[test]
fn test_filter_becomes_parameterized_where() {
    let mapping = northwind();
    let rendered = compiler(&mapping, bare_server()).render(&london()).unwrap();

    assert_eq!(
        rendered.sql,
        "SELECT t0.[City], t0.[CustomerID], t0.[CompanyName], t0.[Phone] FROM [Customers] AS t0 WHERE (t0.[City] = p0)"
    );
    assert_eq!(rendered.params.len(), 1);
    assert_eq!(rendered.params[0].name.as_ref(), "p0");
    assert_eq!(rendered.params[0].value, Expr::constant("London"));
}

#[test]
fn test_record_projection_selects_only_its_columns() {
    let mapping = northwind();
    let query = Expr::source("Customer").map("c", |c| {
        Expr::record([("City", c.clone().member("City")), ("Phone", c.member("Phone"))])
    });
    let rendered = compiler(&mapping, server()).render(&query).unwrap();

    assert_eq!(rendered.sql, "SELECT t0.[City], t0.[Phone] FROM [Customers] AS t0");
    assert!(rendered.params.is_empty());
}

#[test]
fn test_null_relationship_comparison_tests_the_outer_join() {
    let mapping = northwind();
    let query = Expr::source("Order")
        .filter("o", |o| o.member("Customer").equal(Expr::null()))
        .map("o", |o| o.member("OrderID"));
    let rendered = compiler(&mapping, server()).render(&query).unwrap();

    assert!(rendered.sql.contains("LEFT OUTER JOIN"), "{}", rendered.sql);
    assert!(rendered.sql.contains("[CustomerID] IS NULL"), "{}", rendered.sql);
    assert!(!rendered.sql.contains("= NULL"));
    assert!(rendered.params.is_empty());
}

#[test]
fn test_paging_without_offset_numbers_rows() {
    let mapping = northwind();
    let query = Expr::source("Customer")
        .order_by("c", |c| c.member("City"))
        .skip(5)
        .take(10);
    let rendered = compiler(&mapping, server()).render(&query).unwrap();

    assert!(rendered.sql.contains("ROW_NUMBER() OVER (ORDER BY"), "{}", rendered.sql);
    assert!(rendered.sql.contains("BETWEEN 6 AND 15"), "{}", rendered.sql);
    assert!(!select_list(&rendered.sql).contains("rn"), "{}", rendered.sql);
    assert!(rendered.params.is_empty());
}

#[test]
fn test_paging_with_offset_uses_limit() {
    let mapping = northwind();
    let query = Expr::source("Customer")
        .order_by("c", |c| c.member("City"))
        .skip(5)
        .take(10);
    let rendered = compiler(&mapping, sqlite()).render(&query).unwrap();

    assert!(rendered.sql.ends_with("LIMIT 10 OFFSET 5"), "{}", rendered.sql);
    assert!(!rendered.sql.contains("ROW_NUMBER"));
}

#[test]
fn test_entity_equality_compares_keys() {
    let mapping = northwind();
    let query = Expr::source("Customer").join_on(
        Expr::source("Customer"),
        ("c", Box::new(|c: Expr| c)),
        ("d", Box::new(|d: Expr| d)),
        (
            "c",
            "d",
            Box::new(|c: Expr, d: Expr| {
                Expr::record([("City", c.member("City")), ("Phone", d.member("Phone"))])
            }),
        ),
    );
    let rendered = compiler(&mapping, server()).render(&query).unwrap();

    assert!(
        rendered
            .sql
            .contains("INNER JOIN [Customers] AS t1 ON (t0.[CustomerID] = t1.[CustomerID])"),
        "{}",
        rendered.sql
    );
    assert!(rendered.params.is_empty());
}

#[test]
fn test_navigation_in_join_keys_is_unsupported() {
    let mapping = northwind();
    let query = Expr::source("Order").join_on(
        Expr::source("Customer"),
        ("o", Box::new(|o: Expr| o.member("Customer"))),
        ("c", Box::new(|c: Expr| c)),
        ("o", "c", Box::new(|o: Expr, _| o)),
    );
    let err = compiler(&mapping, server()).render(&query).unwrap_err();
    assert!(matches!(err, QueryError::Translation(TranslationError::Unsupported { .. })));
}

#[test]
fn test_ordering_survives_later_operators() {
    let mapping = northwind();
    let query = Expr::source("Customer")
        .order_by("c", |c| c.member("City"))
        .filter("c", |c| c.member("Phone").not_equal(Expr::null()))
        .map("c", |c| c.member("CompanyName"));
    let rendered = compiler(&mapping, server()).render(&query).unwrap();

    assert!(rendered.sql.ends_with("ORDER BY t0.[City]"), "{}", rendered.sql);
    assert!(rendered.sql.contains("[Phone] IS NOT NULL"), "{}", rendered.sql);
    assert!(select_list(&rendered.sql).starts_with("SELECT t0.[CompanyName]"));
}

#[test]
fn test_contains_over_client_list_is_an_in_list() {
    let mapping = northwind();
    let cities = Expr::list(["London".into(), "Paris".into()]);
    let query = Expr::source("Customer").filter("c", move |c| cities.contains(c.member("City")));
    let rendered = compiler(&mapping, server()).render(&query).unwrap();

    assert!(rendered.sql.contains("t0.[City] IN ("), "{}", rendered.sql);
}

#[test]
fn test_root_count_is_a_single_row() {
    let mapping = northwind();
    let plan = compiler(&mapping, server()).compile(&london().count()).unwrap();

    assert!(plan.command.sql.starts_with("SELECT COUNT(*)"), "{}", plan.command.sql);
    assert!(plan.aggregator.is_some());
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_unmapped_member_is_reported() {
    let mapping = northwind();
    let query =
        Expr::source("Customer").filter("c", |c| c.member("Fax").equal(Expr::constant("1")));
    let err = compiler(&mapping, server()).render(&query).unwrap_err();

    assert!(matches!(
        err,
        QueryError::Translation(TranslationError::UnmappedMember { ref member, .. })
            if member == "Fax"
    ));
}

#[test]
fn test_unbound_lambda_parameter_is_reported() {
    let mapping = northwind();
    let query = Expr::source("Customer")
        .filter("c", |_| Expr::param("x").member("City").equal(Expr::constant("A")));
    let err = compiler(&mapping, server()).render(&query).unwrap_err();

    assert!(matches!(err, QueryError::Translation(TranslationError::UnboundParameter { .. })));
}
