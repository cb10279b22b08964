// Car Listing Domain Model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::error::{FieldViolation, ValidationError};

/// Listing ID, assigned by the record store
pub type ListingId = i64;

// Wire field names - the payload contract with listing producers.
const WIRE_MAKE: &str = "normalizedMake";
const WIRE_MODEL: &str = "normalizedModel";
const WIRE_YEAR: &str = "year";
const WIRE_PRICE: &str = "price";
const WIRE_LOCATION: &str = "location";

/// A validated car listing, ready for persistence.
///
/// Instances exist only on the far side of payload validation; the single way to
/// build one from producer input is [`CarListing::from_value`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarListing {
    pub make: String,
    pub model: String,
    pub year: i32,
    pub price: f64,
    pub location: String,
}

impl CarListing {
    /// Map a decoded wire payload onto the listing schema and validate it.
    ///
    /// Required fields: `normalizedMake`, `normalizedModel` and `location` as
    /// non-empty strings, `year` as a whole number, `price` as a number. Extra
    /// fields are ignored - producers attach metadata this consumer does not
    /// care about. All violations are collected before failing so one warning
    /// can name every offending field.
    pub fn from_value(value: &Value) -> Result<Self, ValidationError> {
        let object = match value.as_object() {
            Some(object) => object,
            None => {
                return Err(ValidationError::new(vec![FieldViolation::new(
                    "payload",
                    "must be a JSON object",
                )]))
            }
        };

        let mut violations = Vec::new();

        let make = take_string(object, WIRE_MAKE, &mut violations);
        let model = take_string(object, WIRE_MODEL, &mut violations);
        let year = take_year(object, &mut violations);
        let price = take_number(object, WIRE_PRICE, &mut violations);
        let location = take_string(object, WIRE_LOCATION, &mut violations);

        match (make, model, year, price, location) {
            (Some(make), Some(model), Some(year), Some(price), Some(location)) => Ok(Self {
                make,
                model,
                year,
                price,
                location,
            }),
            _ => Err(ValidationError::new(violations)),
        }
    }
}

/// A listing as echoed back by the record store after a successful create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredListing {
    pub id: ListingId,
    pub make: String,
    pub model: String,
    pub year: i32,
    pub price: f64,
    pub location: String,
    pub created_at: DateTime<Utc>,
}

impl StoredListing {
    pub fn new(id: ListingId, listing: &CarListing, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            make: listing.make.clone(),
            model: listing.model.clone(),
            year: listing.year,
            price: listing.price,
            location: listing.location.clone(),
            created_at,
        }
    }
}

fn take_string(
    object: &serde_json::Map<String, Value>,
    field: &'static str,
    violations: &mut Vec<FieldViolation>,
) -> Option<String> {
    match object.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::String(_)) => {
            violations.push(FieldViolation::new(field, "must not be empty"));
            None
        }
        Some(_) => {
            violations.push(FieldViolation::new(field, "must be a string"));
            None
        }
        None => {
            violations.push(FieldViolation::new(field, "is missing"));
            None
        }
    }
}

fn take_year(
    object: &serde_json::Map<String, Value>,
    violations: &mut Vec<FieldViolation>,
) -> Option<i32> {
    match object.get(WIRE_YEAR) {
        Some(Value::Number(n)) => match n.as_i64().and_then(|y| i32::try_from(y).ok()) {
            Some(year) => Some(year),
            None => {
                violations.push(FieldViolation::new(WIRE_YEAR, "must be a whole number"));
                None
            }
        },
        Some(_) => {
            violations.push(FieldViolation::new(WIRE_YEAR, "must be a number"));
            None
        }
        None => {
            violations.push(FieldViolation::new(WIRE_YEAR, "is missing"));
            None
        }
    }
}

fn take_number(
    object: &serde_json::Map<String, Value>,
    field: &'static str,
    violations: &mut Vec<FieldViolation>,
) -> Option<f64> {
    match object.get(field) {
        Some(Value::Number(n)) => match n.as_f64() {
            Some(number) => Some(number),
            None => {
                violations.push(FieldViolation::new(field, "must be a number"));
                None
            }
        },
        Some(_) => {
            violations.push(FieldViolation::new(field, "must be a number"));
            None
        }
        None => {
            violations.push(FieldViolation::new(field, "is missing"));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value_valid_payload() {
        let payload = json!({
            "normalizedMake": "Toyota",
            "normalizedModel": "Camry",
            "year": 2020,
            "price": 25000,
            "location": "New York"
        });

        let listing = CarListing::from_value(&payload).unwrap();

        assert_eq!(listing.make, "Toyota");
        assert_eq!(listing.model, "Camry");
        assert_eq!(listing.year, 2020);
        assert_eq!(listing.price, 25000.0);
        assert_eq!(listing.location, "New York");
    }

    #[test]
    fn test_from_value_collects_all_violations() {
        // Empty make AND missing model must both be reported.
        let payload = json!({
            "normalizedMake": "",
            "year": 2020,
            "price": 25000,
            "location": "NY"
        });

        let err = CarListing::from_value(&payload).unwrap_err();

        assert_eq!(err.fields(), vec!["normalizedMake", "normalizedModel"]);
        assert_eq!(err.violations[0].message, "must not be empty");
        assert_eq!(err.violations[1].message, "is missing");
    }

    #[test]
    fn test_from_value_wrong_types() {
        let payload = json!({
            "normalizedMake": "Toyota",
            "normalizedModel": 42,
            "year": "2020",
            "price": "expensive",
            "location": "NY"
        });

        let err = CarListing::from_value(&payload).unwrap_err();

        assert_eq!(err.fields(), vec!["normalizedModel", "year", "price"]);
        assert_eq!(err.violations[1].message, "must be a number");
    }

    #[test]
    fn test_from_value_ignores_unknown_fields() {
        let payload = json!({
            "normalizedMake": "Honda",
            "normalizedModel": "Civic",
            "year": 2019,
            "price": 18500.50,
            "location": "Chicago",
            "sourceUrl": "https://example.com/listing/1",
            "scrapedAt": "2024-01-01T00:00:00Z"
        });

        let listing = CarListing::from_value(&payload).unwrap();

        assert_eq!(listing.model, "Civic");
        assert_eq!(listing.price, 18500.50);
    }

    #[test]
    fn test_from_value_rejects_non_object() {
        let err = CarListing::from_value(&json!([1, 2, 3])).unwrap_err();

        assert_eq!(err.violations.len(), 1);
        assert_eq!(err.violations[0].field, "payload");
    }

    #[test]
    fn test_from_value_rejects_fractional_year() {
        let payload = json!({
            "normalizedMake": "Toyota",
            "normalizedModel": "Camry",
            "year": 2020.5,
            "price": 25000,
            "location": "NY"
        });

        let err = CarListing::from_value(&payload).unwrap_err();

        assert_eq!(err.fields(), vec!["year"]);
        assert_eq!(err.violations[0].message, "must be a whole number");
    }

    #[test]
    fn test_validation_error_display_enumerates_fields() {
        let payload = json!({ "year": 2020, "price": 1, "location": "NY" });

        let err = CarListing::from_value(&payload).unwrap_err();
        let rendered = err.to_string();

        assert!(rendered.contains("normalizedMake: is missing"));
        assert!(rendered.contains("normalizedModel: is missing"));
    }

    #[test]
    fn test_stored_listing_from_parts() {
        let listing = CarListing {
            make: "Toyota".to_string(),
            model: "Camry".to_string(),
            year: 2020,
            price: 25000.0,
            location: "New York".to_string(),
        };
        let now = Utc::now();

        let stored = StoredListing::new(7, &listing, now);

        assert_eq!(stored.id, 7);
        assert_eq!(stored.make, "Toyota");
        assert_eq!(stored.created_at, now);
    }
}
