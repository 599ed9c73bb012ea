//! Syncable Entity Types
//!
//! Typed payloads for every resource the engine can replay against the
//! backend. The payload is a tagged union over the entity kind, so an
//! operation carrying the wrong shape for its target is unrepresentable
//! and unknown resource names are rejected at the API boundary instead of
//! at send time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Syncable resource kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// A stocked pantry item
    PantryItem,
    /// A grocery list
    GroceryList,
    /// A line item on a grocery list
    GroceryItem,
}

impl EntityKind {
    /// REST resource segment for this kind
    pub fn resource(&self) -> &'static str {
        match self {
            EntityKind::PantryItem => "pantry-items",
            EntityKind::GroceryList => "grocery-lists",
            EntityKind::GroceryItem => "grocery-items",
        }
    }

    /// Parse a stored resource name back into a kind
    pub fn from_resource(resource: &str) -> Option<Self> {
        match resource {
            "pantry-items" => Some(EntityKind::PantryItem),
            "grocery-lists" => Some(EntityKind::GroceryList),
            "grocery-items" => Some(EntityKind::GroceryItem),
            _ => None,
        }
    }

    /// Whether field-level merge is a sound resolution for this kind.
    ///
    /// Only structurally additive payloads qualify; pantry items carry
    /// interdependent quantity/unit fields that a blind field merge could
    /// tear apart.
    pub fn is_mergeable(&self) -> bool {
        matches!(self, EntityKind::GroceryItem)
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.resource())
    }
}

/// Where a pantry item is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageLocation {
    Pantry,
    Fridge,
    Freezer,
    Cupboard,
    Basement,
    Garage,
    Other,
}

/// Snapshot of a pantry item as the client intends it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PantryItemData {
    pub item_id: String,
    #[serde(default)]
    pub category_id: Option<String>,
    pub quantity: f64,
    pub unit: String,
    pub location: StorageLocation,
    #[serde(default)]
    pub expiry_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub purchase_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub custom_name: Option<String>,
}

/// Snapshot of a grocery list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroceryListData {
    pub name: String,
    pub is_active: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Snapshot of a grocery list line item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroceryItemData {
    pub list_id: String,
    pub name: String,
    pub quantity: f64,
    pub unit: String,
    pub is_checked: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Tagged payload union over the entity kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum EntityPayload {
    PantryItem(PantryItemData),
    GroceryList(GroceryListData),
    GroceryItem(GroceryItemData),
}

impl EntityPayload {
    /// The entity kind this payload belongs to
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityPayload::PantryItem(_) => EntityKind::PantryItem,
            EntityPayload::GroceryList(_) => EntityKind::GroceryList,
            EntityPayload::GroceryItem(_) => EntityKind::GroceryItem,
        }
    }

    /// The bare entity object as the backend expects it, without the tag
    pub fn to_wire_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            EntityPayload::PantryItem(data) => serde_json::to_value(data),
            EntityPayload::GroceryList(data) => serde_json::to_value(data),
            EntityPayload::GroceryItem(data) => serde_json::to_value(data),
        }
    }

    /// Rebuild a typed payload from a bare entity object of a known kind
    pub fn from_wire_value(
        kind: EntityKind,
        value: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            EntityKind::PantryItem => EntityPayload::PantryItem(serde_json::from_value(value)?),
            EntityKind::GroceryList => EntityPayload::GroceryList(serde_json::from_value(value)?),
            EntityKind::GroceryItem => EntityPayload::GroceryItem(serde_json::from_value(value)?),
        })
    }
}
