use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Which kind of listing a favorite points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Hostel / lodging listings
    Lodging,
    /// Tiffin / meal-subscription listings
    MealService,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::Lodging, Category::MealService];

    /// Path segment of the backend's per-category favorites endpoint.
    pub fn endpoint_segment(&self) -> &'static str {
        match self {
            Category::Lodging => "lodging",
            Category::MealService => "meal-service",
        }
    }

    /// Field the backend uses for the listing identifier in this category.
    pub fn id_field(&self) -> &'static str {
        match self {
            Category::Lodging => "hostelServiceId",
            Category::MealService => "tiffinServiceId",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Lodging => write!(f, "lodging"),
            Category::MealService => write!(f, "meal_service"),
        }
    }
}

impl std::str::FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lodging" | "hostel" => Ok(Category::Lodging),
            "meal_service" | "meal-service" | "tiffin" => Ok(Category::MealService),
            _ => Err(anyhow::anyhow!("Unknown category: {}", s)),
        }
    }
}

/// Composite identity of a favorite: `(category, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FavoriteKey {
    pub category: Category,
    pub id: String,
}

impl FavoriteKey {
    pub fn new(category: Category, id: impl Into<String>) -> Self {
        Self { category, id: id.into() }
    }
}

/// A favorited listing plus the display snapshot taken when it was favorited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FavoriteItem {
    /// Listing identifier; numeric ids are stored as their decimal string
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub category: Category,
    /// Opaque listing snapshot, never re-validated after merge
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_at: Option<DateTime<Utc>>,
}

impl FavoriteItem {
    pub fn new(id: impl Into<String>, category: Category, payload: Value) -> Self {
        Self {
            id: id.into(),
            category,
            payload,
            added_at: None,
        }
    }

    pub fn key(&self) -> FavoriteKey {
        FavoriteKey::new(self.category, self.id.clone())
    }

    pub fn matches(&self, id: &str, category: Category) -> bool {
        self.category == category && self.id == id
    }
}

/// Render a JSON identifier (string or number) as a string.
pub fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Identifier of a backend listing in `category`.
///
/// Checks the category's own id field (which may be populated with the
/// referenced document, in which case its `_id` is used), then `_id`,
/// then `id`.
pub fn listing_id(category: Category, listing: &Value) -> Option<String> {
    if let Some(field) = listing.get(category.id_field()) {
        let id = match field {
            Value::Object(_) => field.get("_id").and_then(id_from_value),
            other => id_from_value(other),
        };
        if id.is_some() {
            return id;
        }
    }
    listing
        .get("_id")
        .and_then(id_from_value)
        .or_else(|| listing.get("id").and_then(id_from_value))
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    id_from_value(&value)
        .ok_or_else(|| serde::de::Error::custom("favorite id must be a non-empty string or a number"))
}
