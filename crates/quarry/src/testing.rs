//! Shared fixtures for unit tests.

use crate::mapping::{EntitySchema, StaticMapping};
use crate::types::ScalarKind;

/// Customers, their orders and order lines
pub(crate) fn northwind() -> StaticMapping {
    StaticMapping::new()
        .with_entity(
            EntitySchema::new("Customer", "Customers")
                .key("CustomerID", ScalarKind::Text)
                .column("CompanyName", ScalarKind::Text)
                .required()
                .column("City", ScalarKind::Text)
                .column("Country", ScalarKind::Text)
                .column("Phone", ScalarKind::Text)
                .has_many("Orders", "Order", &["CustomerID"], &["CustomerID"]),
        )
        .with_entity(
            EntitySchema::new("Order", "Orders")
                .generated_key("OrderID", ScalarKind::Int)
                .column("CustomerID", ScalarKind::Text)
                .column("OrderDate", ScalarKind::DateTime)
                .has_one("Customer", "Customer", &["CustomerID"], &["CustomerID"])
                .has_many("Lines", "OrderLine", &["OrderID"], &["OrderID"]),
        )
        .with_entity(
            EntitySchema::new("OrderLine", "OrderLines")
                .key("OrderID", ScalarKind::Int)
                .key("ProductID", ScalarKind::Int)
                .column("Quantity", ScalarKind::Int)
                .required()
                .column("UnitPrice", ScalarKind::Decimal),
        )
}
