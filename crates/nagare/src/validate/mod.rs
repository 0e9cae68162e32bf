//! Declarative validation of scraped data.
//!
//! A [`Schema`] describes the shape a value must have and how to transform
//! it; [`validate`] returns the transformed value or a [`ValidationError`]
//! carrying the crumb path to the failure.

mod error;
mod schema;
mod value;
mod xml;

pub use error::ValidationError;
pub use schema::{optional, validate, MapKey, PathKey, Schema, UrlPart};
pub use value::{Value, ValueType};
pub use xml::XmlElement;

use serde::de::DeserializeOwned;

/// Validates `value` and deserializes the result into `T`.
pub fn validate_into<T: DeserializeOwned>(
    schema: &Schema,
    value: &Value,
) -> Result<T, ValidationError> {
    let result = validate(schema, value)?;
    serde_json::from_value(result.into_json())
        .map_err(|e| ValidationError::new("Deserialize", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Room {
        id: i64,
        hls: String,
    }

    #[test]
    fn test_validate_into() {
        let schema = Schema::all([
            Schema::ParseJson,
            Schema::get("room"),
            Schema::map([
                (MapKey::from("id"), Schema::from(ValueType::Int)),
                (MapKey::from("hls"), Schema::EndsWith(".m3u8".into())),
                (optional("title"), Schema::Pass),
            ]),
        ]);
        let input = Value::from(r#"{"room": {"id": 7, "hls": "https://a/b.m3u8", "title": "x"}}"#);
        let room: Room = validate_into(&schema, &input).unwrap();
        assert_eq!(
            room,
            Room {
                id: 7,
                hls: "https://a/b.m3u8".to_string()
            }
        );
    }
}
