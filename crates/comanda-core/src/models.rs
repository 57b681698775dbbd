//! Data models for Comanda
//!
//! Records are free-form JSON field bags keyed by a string `id`. Stronger
//! per-collection shapes belong to the application layer, not to the sync core.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field map of a record, excluding its `id`
pub type Fields = Map<String, Value>;

/// Ordered contents of a collection
pub type Collection = Vec<Record>;

/// Name of the identifying field
pub const ID_FIELD: &str = "id";

/// Collection names used by the ordering application
pub mod collections {
    pub const PRODUCTS: &str = "products";
    pub const ORDERS: &str = "orders";
    pub const CATEGORIES: &str = "categories";
    pub const SUB_CATEGORIES: &str = "sub_categories";
    pub const COMPLEMENTS: &str = "complements";
    pub const CUSTOMERS: &str = "customers";
    pub const ZIP_RANGES: &str = "zip_ranges";
    pub const PAYMENT_METHODS: &str = "payment_methods";
    pub const COUPONS: &str = "coupons";
    pub const SETTINGS: &str = "settings";

    /// Every well-known collection
    pub const ALL: [&str; 10] = [
        PRODUCTS,
        ORDERS,
        CATEGORIES,
        SUB_CATEGORIES,
        COMPLEMENTS,
        CUSTOMERS,
        ZIP_RANGES,
        PAYMENT_METHODS,
        COUPONS,
        SETTINGS,
    ];
}

/// A single entity in a collection
///
/// Serializes as one flat JSON object: `{"id": "...", ...fields}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique identifier, immutable once created
    id: String,
    /// Every other field
    #[serde(flatten)]
    fields: Fields,
}

impl Record {
    /// Create an empty record with the given ID
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Fields::new(),
        }
    }

    /// Create a record from a field map
    ///
    /// An `id` entry in `fields` is dropped; the explicit `id` wins.
    pub fn from_fields(id: impl Into<String>, mut fields: Fields) -> Self {
        fields.remove(ID_FIELD);
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Generate a random record ID
    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// The record ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All fields except `id`
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Get a field value
    pub fn get(&self, key: &str) -> Option<&Value> {
        if key == ID_FIELD {
            return None;
        }
        self.fields.get(key)
    }

    /// Get a string field
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Set a single field. Setting `id` is ignored.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if key != ID_FIELD {
            self.fields.insert(key, value);
        }
    }

    /// Merge a patch into this record
    ///
    /// Fields present in `patch` overwrite, absent fields are kept. The `id`
    /// field of the patch is ignored.
    pub fn merge(&mut self, patch: &Fields) {
        for (key, value) in patch {
            if key != ID_FIELD {
                self.fields.insert(key.clone(), value.clone());
            }
        }
    }

    /// Convert into a flat JSON object
    pub fn to_value(&self) -> Value {
        let mut object = Map::with_capacity(self.fields.len() + 1);
        object.insert(ID_FIELD.to_string(), Value::String(self.id.clone()));
        for (key, value) in &self.fields {
            object.insert(key.clone(), value.clone());
        }
        Value::Object(object)
    }
}

/// Parse a JSON value into a field map
///
/// Returns `None` when the value is not an object.
pub fn fields_from_value(value: Value) -> Option<Fields> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}
