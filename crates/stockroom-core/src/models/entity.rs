//! Entity model: the fixed set of synchronized record types
//!
//! Every record has a stable string id plus a declared list of fields. The
//! remote store and the local cache both exchange records as generic rows
//! (`serde_json` objects); conversion is always restricted to the declared
//! fields of the record's kind so incomparable schemas never mix.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A generic tabular row as exchanged with the remote store.
pub type Row = serde_json::Map<String, Value>;

/// Fields excluded from deep comparison.
pub const VOLATILE_FIELDS: &[&str] = &["created_at", "updated_at"];

/// Returns whether `field` is excluded from deep comparison.
pub fn is_volatile(field: &str) -> bool {
    VOLATILE_FIELDS.contains(&field)
}

/// The kind of a synchronized record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Product,
    Meter,
    Customer,
    Sale,
}

impl EntityKind {
    /// All tracked kinds, in storage order.
    pub const ALL: [Self; 4] = [Self::Product, Self::Meter, Self::Customer, Self::Sale];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Product => "product",
            Self::Meter => "meter",
            Self::Customer => "customer",
            Self::Sale => "sale",
        }
    }

    /// Local persistence key holding the cached collection.
    pub const fn storage_key(self) -> &'static str {
        match self {
            Self::Product => "products",
            Self::Meter => "meters",
            Self::Customer => "customers",
            Self::Sale => "sales",
        }
    }

    /// Remote table name. Matches the storage key.
    pub const fn table(self) -> &'static str {
        self.storage_key()
    }

    /// Declared fields for this kind, `id` first.
    pub const fn fields(self) -> &'static [&'static str] {
        match self {
            Self::Product => Product::FIELDS,
            Self::Meter => Meter::FIELDS,
            Self::Customer => Customer::FIELDS,
            Self::Sale => Sale::FIELDS,
        }
    }

    pub fn declares(self, field: &str) -> bool {
        self.fields().contains(&field)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "product" | "products" => Ok(Self::Product),
            "meter" | "meters" => Ok(Self::Meter),
            "customer" | "customers" => Ok(Self::Customer),
            "sale" | "sales" => Ok(Self::Sale),
            other => Err(Error::InvalidInput(format!("unknown entity type '{other}'"))),
        }
    }
}

/// Common behaviour of the four record shapes.
pub trait Record: Serialize + DeserializeOwned + Clone {
    const KIND: EntityKind;
    const FIELDS: &'static [&'static str];

    fn id(&self) -> &str;
    fn updated_at(&self) -> Option<DateTime<Utc>>;
    fn set_updated_at(&mut self, at: DateTime<Utc>);
}

/// Catalogue item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub sku: Option<String>,
    pub category: Option<String>,
    /// Unit price
    pub price: Option<f64>,
    /// Units on hand
    pub stock: Option<i64>,
    pub description: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A serialized meter unit, optionally installed at a customer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Meter {
    pub id: String,
    pub serial_number: String,
    pub product_id: Option<String>,
    pub customer_id: Option<String>,
    /// Lifecycle status (e.g. "in_stock", "sold", "installed")
    pub status: Option<String>,
    pub location: Option<String>,
    pub installed_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub notes: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A recorded sale of a meter to a customer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sale {
    pub id: String,
    pub meter_id: Option<String>,
    pub customer_id: Option<String>,
    pub amount: Option<f64>,
    pub payment_method: Option<String>,
    pub sold_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

macro_rules! impl_record {
    ($ty:ty, $kind:expr, [$($field:literal),+ $(,)?]) => {
        impl Record for $ty {
            const KIND: EntityKind = $kind;
            const FIELDS: &'static [&'static str] = &[$($field),+];

            fn id(&self) -> &str {
                &self.id
            }

            fn updated_at(&self) -> Option<DateTime<Utc>> {
                self.updated_at
            }

            fn set_updated_at(&mut self, at: DateTime<Utc>) {
                self.updated_at = Some(at);
            }
        }
    };
}

impl_record!(
    Product,
    EntityKind::Product,
    ["id", "name", "sku", "category", "price", "stock", "description", "created_at", "updated_at"]
);
impl_record!(
    Meter,
    EntityKind::Meter,
    [
        "id",
        "serial_number",
        "product_id",
        "customer_id",
        "status",
        "location",
        "installed_at",
        "created_at",
        "updated_at",
    ]
);
impl_record!(
    Customer,
    EntityKind::Customer,
    ["id", "name", "email", "phone", "address", "notes", "created_at", "updated_at"]
);
impl_record!(
    Sale,
    EntityKind::Sale,
    [
        "id",
        "meter_id",
        "customer_id",
        "amount",
        "payment_method",
        "sold_at",
        "created_at",
        "updated_at",
    ]
);

/// A synchronized record of any tracked kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Entity {
    Product(Product),
    Meter(Meter),
    Customer(Customer),
    Sale(Sale),
}

macro_rules! with_record {
    ($entity:expr, $record:ident => $body:expr) => {
        match $entity {
            Entity::Product($record) => $body,
            Entity::Meter($record) => $body,
            Entity::Customer($record) => $body,
            Entity::Sale($record) => $body,
        }
    };
}

impl Entity {
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Product(_) => EntityKind::Product,
            Self::Meter(_) => EntityKind::Meter,
            Self::Customer(_) => EntityKind::Customer,
            Self::Sale(_) => EntityKind::Sale,
        }
    }

    pub fn id(&self) -> &str {
        with_record!(self, record => record.id())
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        with_record!(self, record => record.updated_at())
    }

    pub fn set_updated_at(&mut self, at: DateTime<Utc>) {
        with_record!(self, record => record.set_updated_at(at));
    }

    /// Build a record of `kind` from a generic row.
    ///
    /// Undeclared columns are ignored; a missing or blank `id` is rejected.
    pub fn from_row(kind: EntityKind, row: Row) -> Result<Self> {
        let value = Value::Object(restrict_to_declared(kind, row));
        let entity = match kind {
            EntityKind::Product => Self::Product(serde_json::from_value(value)?),
            EntityKind::Meter => Self::Meter(serde_json::from_value(value)?),
            EntityKind::Customer => Self::Customer(serde_json::from_value(value)?),
            EntityKind::Sale => Self::Sale(serde_json::from_value(value)?),
        };

        if entity.id().trim().is_empty() {
            return Err(Error::InvalidInput(format!("{kind} row is missing an id")));
        }
        Ok(entity)
    }

    /// Like [`Entity::from_row`], for an arbitrary JSON value.
    pub fn from_value(kind: EntityKind, value: Value) -> Result<Self> {
        match value {
            Value::Object(row) => Self::from_row(kind, row),
            other => Err(Error::InvalidInput(format!(
                "expected a JSON object for {kind}, got {other}"
            ))),
        }
    }

    /// Convert to a generic row containing exactly the declared fields.
    pub fn to_row(&self) -> Result<Row> {
        let value = with_record!(self, record => serde_json::to_value(record)?);
        match value {
            Value::Object(row) => Ok(restrict_to_declared(self.kind(), row)),
            _ => Err(Error::InvalidInput(format!(
                "{} did not serialize to an object",
                self.kind()
            ))),
        }
    }

    /// Value of a single declared field, `Null` when absent.
    pub fn field(&self, field: &str) -> Result<Value> {
        Ok(self.to_row()?.remove(field).unwrap_or(Value::Null))
    }

    /// Return a copy with `patch` applied on top of this record.
    pub fn with_patch(&self, patch: &Row) -> Result<Self> {
        validate_patch(self.kind(), patch)?;
        let mut row = self.to_row()?;
        for (field, value) in patch {
            row.insert(field.clone(), value.clone());
        }
        Self::from_row(self.kind(), row)
    }
}

/// Reject patches touching `id` or fields the kind does not declare.
pub fn validate_patch(kind: EntityKind, patch: &Row) -> Result<()> {
    if patch.is_empty() {
        return Err(Error::InvalidInput(format!("empty {kind} patch")));
    }
    for field in patch.keys() {
        if field == "id" {
            return Err(Error::InvalidInput(
                "patch must not change the record id".to_string(),
            ));
        }
        if !kind.declares(field) {
            return Err(Error::InvalidInput(format!(
                "{kind} has no field named '{field}'"
            )));
        }
    }
    Ok(())
}

fn restrict_to_declared(kind: EntityKind, mut row: Row) -> Row {
    let mut restricted = Row::new();
    for field in kind.fields() {
        restricted.insert(
            (*field).to_string(),
            row.remove(*field).unwrap_or(Value::Null),
        );
    }
    restricted
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(row) => row,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn kind_parses_singular_and_plural_names() {
        assert_eq!("meter".parse::<EntityKind>().unwrap(), EntityKind::Meter);
        assert_eq!("Sales".parse::<EntityKind>().unwrap(), EntityKind::Sale);
        assert!("invoice".parse::<EntityKind>().is_err());
    }

    #[test]
    fn storage_keys_match_local_layout() {
        let keys: Vec<_> = EntityKind::ALL.iter().map(|k| k.storage_key()).collect();
        assert_eq!(keys, vec!["products", "meters", "customers", "sales"]);
    }

    #[test]
    fn from_row_ignores_undeclared_columns() {
        let entity = Entity::from_row(
            EntityKind::Customer,
            row(json!({"id": "customer-7", "name": "Ada", "loyalty_tier": "gold"})),
        )
        .unwrap();

        let converted = entity.to_row().unwrap();
        assert!(!converted.contains_key("loyalty_tier"));
        assert_eq!(converted.len(), Customer::FIELDS.len());
        assert_eq!(converted["name"], json!("Ada"));
    }

    #[test]
    fn from_row_rejects_missing_id() {
        let result = Entity::from_row(EntityKind::Product, row(json!({"name": "Widget"})));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn with_patch_updates_only_patched_fields() {
        let meter = Entity::Meter(Meter {
            id: "meter-1".to_string(),
            serial_number: "SN-001".to_string(),
            status: Some("in_stock".to_string()),
            ..Meter::default()
        });

        let patched = meter
            .with_patch(&row(json!({"status": "sold"})))
            .unwrap();

        let Entity::Meter(patched) = patched else {
            panic!("kind changed");
        };
        assert_eq!(patched.status.as_deref(), Some("sold"));
        assert_eq!(patched.serial_number, "SN-001");
    }

    #[test]
    fn validate_patch_rejects_unknown_and_id_fields() {
        assert!(validate_patch(EntityKind::Meter, &row(json!({"colour": "red"}))).is_err());
        assert!(validate_patch(EntityKind::Meter, &row(json!({"id": "meter-2"}))).is_err());
        assert!(validate_patch(EntityKind::Meter, &row(json!({"status": "sold"}))).is_ok());
    }

    #[test]
    fn entity_serializes_with_kind_tag() {
        let entity = Entity::Sale(Sale {
            id: "sale-1".to_string(),
            amount: Some(120.5),
            ..Sale::default()
        });
        let value = serde_json::to_value(&entity).unwrap();
        assert_eq!(value["kind"], json!("sale"));
        assert_eq!(value["data"]["amount"], json!(120.5));

        let back: Entity = serde_json::from_value(value).unwrap();
        assert_eq!(back, entity);
    }
}
