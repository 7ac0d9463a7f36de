//! Kind-specific change payloads
//!
//! The stored payload is opaque JSON, but every submission is parsed into the
//! typed payload for its kind first so malformed requests never reach the
//! store.

use crate::change::ChangeKind;
use crate::error::{validation_error, AppError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::{Validate, ValidationError};

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid")
});

fn validate_identifier(value: &str) -> Result<(), ValidationError> {
    if IDENTIFIER.is_match(value) {
        Ok(())
    } else {
        let mut err = ValidationError::new("identifier");
        err.message = Some(
            format!(
                "'{}' must start with a letter or underscore and contain only letters, digits and underscores",
                value
            )
            .into(),
        );
        Err(err)
    }
}

/// Field definition used by table and field creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    #[validate(length(min = 1, max = 63, message = "Field name must be between 1 and 63 characters"))]
    #[validate(custom(function = "validate_identifier"))]
    pub name: String,

    #[validate(length(min = 1, message = "Field type is required"))]
    pub field_type: String,

    #[serde(default)]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TableCreatePayload {
    #[validate(length(min = 1, max = 63, message = "Table name must be between 1 and 63 characters"))]
    #[validate(custom(function = "validate_identifier"))]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[validate(length(min = 1, message = "At least one field is required"))]
    #[validate(nested)]
    pub fields: Vec<FieldSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_table_update"))]
pub struct TableUpdatePayload {
    #[validate(length(min = 1, message = "tableId is required"))]
    pub table_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_identifier"))]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn validate_table_update(payload: &TableUpdatePayload) -> Result<(), ValidationError> {
    if payload.name.is_none() && payload.description.is_none() {
        return Err(ValidationError::new("table_update_is_empty"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TableDeletePayload {
    #[validate(length(min = 1, message = "tableId is required"))]
    pub table_id: String,

    #[serde(default)]
    pub cascade: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FieldCreatePayload {
    #[validate(length(min = 1, message = "tableId is required"))]
    pub table_id: String,

    #[validate(nested)]
    pub field: FieldSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_field_update"))]
pub struct FieldUpdatePayload {
    #[validate(length(min = 1, message = "tableId is required"))]
    pub table_id: String,

    #[validate(length(min = 1, message = "fieldId is required"))]
    pub field_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_identifier"))]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

fn validate_field_update(payload: &FieldUpdatePayload) -> Result<(), ValidationError> {
    if payload.name.is_none() && payload.field_type.is_none() && payload.required.is_none() {
        return Err(ValidationError::new("field_update_is_empty"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FieldDeletePayload {
    #[validate(length(min = 1, message = "tableId is required"))]
    pub table_id: String,

    #[validate(length(min = 1, message = "fieldId is required"))]
    pub field_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    OneToOne,
    OneToMany,
    ManyToMany,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipCreatePayload {
    #[validate(length(min = 1, message = "sourceTableId is required"))]
    pub source_table_id: String,

    #[validate(length(min = 1, message = "targetTableId is required"))]
    pub target_table_id: String,

    pub relation_type: RelationType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_identifier"))]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipDeletePayload {
    #[validate(length(min = 1, message = "relationshipId is required"))]
    pub relationship_id: String,
}

/// Promotion of one codepage version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentPayload {
    #[validate(length(min = 1, message = "codepageId is required"))]
    pub codepage_id: String,

    #[validate(length(min = 1, max = 64, message = "version must be between 1 and 64 characters"))]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// A validated payload, tagged by the kind of change it describes
#[derive(Debug, Clone, PartialEq)]
pub enum ChangePayload {
    TableCreate(TableCreatePayload),
    TableUpdate(TableUpdatePayload),
    TableDelete(TableDeletePayload),
    FieldCreate(FieldCreatePayload),
    FieldUpdate(FieldUpdatePayload),
    FieldDelete(FieldDeletePayload),
    RelationshipCreate(RelationshipCreatePayload),
    RelationshipDelete(RelationshipDeletePayload),
    Deployment(DeploymentPayload),
}

impl ChangePayload {
    /// Parse and validate raw JSON as the payload of `kind`
    pub fn parse(kind: ChangeKind, raw: &Value) -> Result<Self, AppError> {
        match raw {
            Value::Object(map) if !map.is_empty() => {}
            _ => return Err(validation_error("Payload must be a non-empty JSON object")),
        }

        Ok(match kind {
            ChangeKind::TableCreate => ChangePayload::TableCreate(typed(raw)?),
            ChangeKind::TableUpdate => ChangePayload::TableUpdate(typed(raw)?),
            ChangeKind::TableDelete => ChangePayload::TableDelete(typed(raw)?),
            ChangeKind::FieldCreate => ChangePayload::FieldCreate(typed(raw)?),
            ChangeKind::FieldUpdate => ChangePayload::FieldUpdate(typed(raw)?),
            ChangeKind::FieldDelete => ChangePayload::FieldDelete(typed(raw)?),
            ChangeKind::RelationshipCreate => ChangePayload::RelationshipCreate(typed(raw)?),
            ChangeKind::RelationshipDelete => ChangePayload::RelationshipDelete(typed(raw)?),
            ChangeKind::Deployment => ChangePayload::Deployment(typed(raw)?),
        })
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangePayload::TableCreate(_) => ChangeKind::TableCreate,
            ChangePayload::TableUpdate(_) => ChangeKind::TableUpdate,
            ChangePayload::TableDelete(_) => ChangeKind::TableDelete,
            ChangePayload::FieldCreate(_) => ChangeKind::FieldCreate,
            ChangePayload::FieldUpdate(_) => ChangeKind::FieldUpdate,
            ChangePayload::FieldDelete(_) => ChangeKind::FieldDelete,
            ChangePayload::RelationshipCreate(_) => ChangeKind::RelationshipCreate,
            ChangePayload::RelationshipDelete(_) => ChangeKind::RelationshipDelete,
            ChangePayload::Deployment(_) => ChangeKind::Deployment,
        }
    }

    /// JSON form persisted on the change
    pub fn to_value(&self) -> Result<Value, AppError> {
        let value = match self {
            ChangePayload::TableCreate(p) => serde_json::to_value(p),
            ChangePayload::TableUpdate(p) => serde_json::to_value(p),
            ChangePayload::TableDelete(p) => serde_json::to_value(p),
            ChangePayload::FieldCreate(p) => serde_json::to_value(p),
            ChangePayload::FieldUpdate(p) => serde_json::to_value(p),
            ChangePayload::FieldDelete(p) => serde_json::to_value(p),
            ChangePayload::RelationshipCreate(p) => serde_json::to_value(p),
            ChangePayload::RelationshipDelete(p) => serde_json::to_value(p),
            ChangePayload::Deployment(p) => serde_json::to_value(p),
        };
        value.map_err(|e| AppError::Internal(format!("Failed to serialize payload: {}", e)))
    }
}

fn typed<T: DeserializeOwned + Validate>(raw: &Value) -> Result<T, AppError> {
    let payload: T = serde_json::from_value(raw.clone())
        .map_err(|e| validation_error(format!("Malformed payload: {}", e)))?;
    payload
        .validate()
        .map_err(|e| validation_error(e.to_string()))?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parses_table_create() {
        let raw = json!({
            "name": "orders",
            "fields": [{"name": "total", "fieldType": "number", "required": true}]
        });
        let payload = ChangePayload::parse(ChangeKind::TableCreate, &raw).unwrap();
        assert_eq!(payload.kind(), ChangeKind::TableCreate);

        let value = payload.to_value().unwrap();
        assert_eq!(value["fields"][0]["fieldType"], "number");
    }

    #[test]
    fn test_rejects_empty_and_non_object_payloads() {
        for raw in [json!({}), json!([]), json!("drop it"), Value::Null] {
            let result = ChangePayload::parse(ChangeKind::TableDelete, &raw);
            assert!(matches!(result, Err(AppError::Validation(_))), "{raw}");
        }
    }

    #[test]
    fn test_rejects_bad_identifiers() {
        let raw = json!({
            "name": "1orders",
            "fields": [{"name": "total", "fieldType": "number"}]
        });
        assert!(ChangePayload::parse(ChangeKind::TableCreate, &raw).is_err());

        let raw = json!({"tableId": "tbl_1", "field": {"name": "bad name", "fieldType": "text"}});
        assert!(ChangePayload::parse(ChangeKind::FieldCreate, &raw).is_err());
    }

    #[test]
    fn test_rejects_payload_of_another_kind() {
        let deployment = json!({"codepageId": "cp_1", "version": "1.4.0"});
        assert!(ChangePayload::parse(ChangeKind::Deployment, &deployment).is_ok());
        assert!(ChangePayload::parse(ChangeKind::FieldDelete, &deployment).is_err());
    }

    #[test]
    fn test_updates_must_change_something() {
        let raw = json!({"tableId": "tbl_1"});
        assert!(ChangePayload::parse(ChangeKind::TableUpdate, &raw).is_err());

        let raw = json!({"tableId": "tbl_1", "fieldId": "fld_1"});
        assert!(ChangePayload::parse(ChangeKind::FieldUpdate, &raw).is_err());

        let raw = json!({"tableId": "tbl_1", "fieldId": "fld_1", "required": false});
        assert!(ChangePayload::parse(ChangeKind::FieldUpdate, &raw).is_ok());
    }

    #[test]
    fn test_relationship_type_is_checked() {
        let raw = json!({
            "sourceTableId": "a",
            "targetTableId": "b",
            "relationType": "one_to_many"
        });
        assert!(ChangePayload::parse(ChangeKind::RelationshipCreate, &raw).is_ok());

        let raw = json!({
            "sourceTableId": "a",
            "targetTableId": "b",
            "relationType": "sideways"
        });
        assert!(ChangePayload::parse(ChangeKind::RelationshipCreate, &raw).is_err());
    }
}
