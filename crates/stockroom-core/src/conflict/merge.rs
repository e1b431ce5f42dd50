//! Field-level merge of client and server copies

use serde_json::Value;

use super::detect::ensure_same_kind;
use crate::error::{Error, Result};
use crate::models::{Entity, Row};

/// Combine two copies of the same record into a candidate for manual editing.
///
/// Walks the declared fields of the kind. The server value wins unless the
/// client value differs and looks more recent: the server value is empty and
/// the client's is not, or the client's `updated_at` is strictly later. Ties
/// go to the server. The result does not resolve anything by itself.
pub fn merge_objects(client: &Entity, server: &Entity) -> Result<Entity> {
    ensure_same_kind(client, server)?;
    if client.id() != server.id() {
        return Err(Error::InvalidInput(format!(
            "cannot merge {} {} with {}",
            client.kind(),
            client.id(),
            server.id()
        )));
    }

    let client_newer = match (client.updated_at(), server.updated_at()) {
        (Some(client_at), Some(server_at)) => client_at > server_at,
        _ => false,
    };

    let mut client_row = client.to_row()?;
    let mut server_row = server.to_row()?;
    let mut merged = Row::new();

    for field in server.kind().fields() {
        let server_value = server_row.remove(*field).unwrap_or(Value::Null);
        let client_value = client_row.remove(*field).unwrap_or(Value::Null);

        let take_client = *field != "id"
            && client_value != server_value
            && !is_empty(&client_value)
            && (is_empty(&server_value) || client_newer);

        merged.insert(
            (*field).to_string(),
            if take_client { client_value } else { server_value },
        );
    }

    Entity::from_row(server.kind(), merged)
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Customer, Meter, Product};
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn customer(phone: Option<&str>, email: Option<&str>, address: Option<&str>) -> Customer {
        Customer {
            id: "customer-7".to_string(),
            name: "Ada".to_string(),
            phone: phone.map(str::to_string),
            email: email.map(str::to_string),
            address: address.map(str::to_string),
            ..Customer::default()
        }
    }

    #[test]
    fn conflicting_field_defaults_to_server() {
        let client = Entity::Customer(customer(Some("555-0100"), Some("ada@example.com"), None));
        let server = Entity::Customer(customer(Some("555-0199"), Some("ada@example.com"), None));

        let merged = merge_objects(&client, &server).unwrap();
        assert_eq!(merged, server);
    }

    #[test]
    fn client_fills_fields_empty_on_server() {
        let client = Entity::Customer(customer(Some("555-0100"), None, Some("1 Main St")));
        let server = Entity::Customer(customer(Some("555-0199"), Some("ada@example.com"), Some("  ")));

        let Entity::Customer(merged) = merge_objects(&client, &server).unwrap() else {
            panic!("kind changed");
        };
        assert_eq!(merged.phone.as_deref(), Some("555-0199"));
        assert_eq!(merged.email.as_deref(), Some("ada@example.com"));
        assert_eq!(merged.address.as_deref(), Some("1 Main St"));
    }

    #[test]
    fn newer_client_wins_differing_fields() {
        let client = Entity::Meter(Meter {
            id: "meter-1".to_string(),
            serial_number: "SN-1".to_string(),
            status: Some("sold".to_string()),
            location: Some("Depot".to_string()),
            updated_at: Some(Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap()),
            ..Meter::default()
        });
        let server = Entity::Meter(Meter {
            id: "meter-1".to_string(),
            serial_number: "SN-1".to_string(),
            status: Some("in_stock".to_string()),
            location: Some("Warehouse".to_string()),
            updated_at: Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()),
            ..Meter::default()
        });

        let merged = merge_objects(&client, &server).unwrap();
        assert_eq!(merged, client);
    }

    #[test]
    fn empty_client_value_never_erases_server_value() {
        let client = Entity::Product(Product {
            id: "product-1".to_string(),
            name: String::new(),
            updated_at: Some(Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap()),
            ..Product::default()
        });
        let server = Entity::Product(Product {
            id: "product-1".to_string(),
            name: "Smart meter".to_string(),
            price: Some(99.0),
            updated_at: Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()),
            ..Product::default()
        });

        let Entity::Product(merged) = merge_objects(&client, &server).unwrap() else {
            panic!("kind changed");
        };
        assert_eq!(merged.name, "Smart meter");
        assert_eq!(merged.price, Some(99.0));
        assert_eq!(merged.updated_at, client.updated_at());
    }

    #[test]
    fn merging_different_kinds_or_ids_fails() {
        let meter = Entity::Meter(Meter {
            id: "meter-1".to_string(),
            ..Meter::default()
        });
        let other_meter = Entity::Meter(Meter {
            id: "meter-2".to_string(),
            ..Meter::default()
        });
        let customer = Entity::Customer(customer(None, None, None));

        assert!(merge_objects(&meter, &customer).is_err());
        assert!(merge_objects(&meter, &other_meter).is_err());
    }
}
