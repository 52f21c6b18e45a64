//! Entity descriptors.
//!
//! Every syncable table is described once: its fields, its owning parent (if
//! any) and whether it uses tombstones. Collection, apply and pull are all
//! generic over these descriptors, so adding a table never means adding a new
//! code path.

use crate::{error::Result, Error, RecordUuid, SchemaVersion, TableName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Namespace for identities derived from a natural key (technician signatures).
pub const IDENTITY_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2b9e_58d4_4a63_9b1e_7a0d_c3f5_e812);

/// Field types supported in descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Binary payload, base64 on the wire
    Bytes,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Bytes => write!(f, "Bytes"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field in a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Column name, identical locally, on the wire and server-side
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether a live row must carry a value
    pub required: bool,
    /// Whether placeholder text ("N/A", "-", ...) is stored as null
    pub placeholder_null: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            placeholder_null: false,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            placeholder_null: false,
        }
    }

    /// Treat placeholder values in this field as missing.
    pub fn placeholders_as_null(mut self) -> Self {
        self.placeholder_null = true;
        self
    }
}

/// The owning foreign key of a child table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentRef {
    /// Parent table name
    pub table: TableName,
    /// Local integer foreign-key column, never transmitted
    pub column: String,
    /// Wire field carrying the parent's uuid
    pub uuid_field: String,
}

/// Descriptor for one syncable table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDescriptor {
    /// Table name
    pub name: TableName,
    /// Field definitions, excluding the sync columns
    pub fields: Vec<FieldDef>,
    /// Owning parent, if any
    pub parent: Option<ParentRef>,
    /// Whether deletions are tombstones carried by `is_deleted`
    pub tombstones: bool,
    /// Natural-key field the uuid is derived from, if any
    pub identity_field: Option<String>,
}

impl EntityDescriptor {
    /// Create a new root table descriptor with tombstones enabled.
    pub fn new(name: impl Into<TableName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
            parent: None,
            tombstones: true,
            identity_field: None,
        }
    }

    /// Declare the owning parent.
    pub fn with_parent(
        mut self,
        table: impl Into<TableName>,
        column: impl Into<String>,
        uuid_field: impl Into<String>,
    ) -> Self {
        self.parent = Some(ParentRef {
            table: table.into(),
            column: column.into(),
            uuid_field: uuid_field.into(),
        });
        self
    }

    /// Rows of this table are overwritten in place, never tombstoned.
    pub fn without_tombstones(mut self) -> Self {
        self.tombstones = false;
        self
    }

    /// Derive the uuid deterministically from a natural key.
    pub fn with_identity_field(mut self, field: impl Into<String>) -> Self {
        self.identity_field = Some(field.into());
        self
    }

    /// Look up a field definition.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Column names in declaration order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Derive the uuid from the natural key, if this table has one.
    pub fn derive_uuid(&self, value: &Value) -> Option<RecordUuid> {
        self.identity_field.as_ref()?;
        let key = value.as_str()?.trim();
        if key.is_empty() {
            return None;
        }
        let scoped = format!("{}:{}", self.name, key.to_lowercase());
        Some(Uuid::new_v5(&IDENTITY_NAMESPACE, scoped.as_bytes()).to_string())
    }
}

/// Ordered set of descriptors. Iteration order is dependency order: every
/// parent table comes before its children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Schema version, bumped with the store migrations
    pub version: SchemaVersion,
    entities: Vec<EntityDescriptor>,
}

impl Schema {
    /// Create a new empty schema.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            entities: Vec::new(),
        }
    }

    /// Append a table. Parents must be added before their children.
    pub fn add_entity(&mut self, entity: EntityDescriptor) -> &mut Self {
        self.entities.push(entity);
        self
    }

    /// Builder-style method to add a table.
    pub fn with_entity(mut self, entity: EntityDescriptor) -> Self {
        self.add_entity(entity);
        self
    }

    /// Get a descriptor by table name.
    pub fn entity(&self, name: &str) -> Option<&EntityDescriptor> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Get a descriptor or fail with [`Error::UnknownTable`].
    pub fn require(&self, name: &str) -> Result<&EntityDescriptor> {
        self.entity(name)
            .ok_or_else(|| Error::UnknownTable(name.to_string()))
    }

    /// Descriptors in dependency order.
    pub fn entities(&self) -> impl DoubleEndedIterator<Item = &EntityDescriptor> {
        self.entities.iter()
    }

    /// Tables owned by `table`.
    pub fn children_of<'a>(
        &'a self,
        table: &'a str,
    ) -> impl Iterator<Item = &'a EntityDescriptor> + 'a {
        self.entities
            .iter()
            .filter(move |e| e.parent.as_ref().is_some_and(|p| p.table == table))
    }

    /// Check that names are unique and every parent precedes its children.
    pub fn validate(&self) -> Result<()> {
        for (idx, entity) in self.entities.iter().enumerate() {
            if self.entities[..idx].iter().any(|e| e.name == entity.name) {
                return Err(Error::InvalidSchema(format!(
                    "table '{}' declared twice",
                    entity.name
                )));
            }

            if let Some(parent) = &entity.parent {
                if !self.entities[..idx].iter().any(|e| e.name == parent.table) {
                    return Err(Error::InvalidSchema(format!(
                        "table '{}' must follow its parent '{}'",
                        entity.name, parent.table
                    )));
                }
            }

            if let Some(identity) = &entity.identity_field {
                if entity.field(identity).is_none() {
                    return Err(Error::InvalidSchema(format!(
                        "identity field '{}' is not a field of '{}'",
                        identity, entity.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// The verification dataset: customers own destinations own devices own
    /// verifications; profiles own their tests; instruments and signatures
    /// stand alone.
    pub fn standard() -> Self {
        use FieldType::*;

        Schema::new(1)
            .with_entity(EntityDescriptor::new(
                "customers",
                vec![
                    FieldDef::required("name", String),
                    FieldDef::optional("address", String),
                    FieldDef::optional("phone", String),
                    FieldDef::optional("email", String),
                ],
            ))
            .with_entity(EntityDescriptor::new(
                "mti_instruments",
                vec![
                    FieldDef::required("instrument_name", String),
                    FieldDef::optional("serial_number", String).placeholders_as_null(),
                    FieldDef::optional("fw_version", String),
                    FieldDef::optional("calibration_date", String),
                    FieldDef::optional("com_port", String),
                    FieldDef::optional("is_default", Bool),
                ],
            ))
            .with_entity(
                EntityDescriptor::new(
                    "signatures",
                    vec![
                        FieldDef::required("username", String),
                        FieldDef::optional("signature_data", Bytes),
                    ],
                )
                .without_tombstones()
                .with_identity_field("username"),
            )
            .with_entity(EntityDescriptor::new(
                "profiles",
                vec![
                    FieldDef::required("profile_key", String),
                    FieldDef::required("name", String),
                ],
            ))
            .with_entity(
                EntityDescriptor::new(
                    "profile_tests",
                    vec![
                        FieldDef::required("name", String),
                        FieldDef::optional("parameter", String),
                        FieldDef::optional("limits_json", Json),
                        FieldDef::optional("is_applied_part_test", Bool),
                    ],
                )
                .with_parent("profiles", "profile_id", "profile_uuid"),
            )
            .with_entity(
                EntityDescriptor::new(
                    "destinations",
                    vec![
                        FieldDef::required("name", String),
                        FieldDef::optional("address", String),
                    ],
                )
                .with_parent("customers", "customer_id", "customer_uuid"),
            )
            .with_entity(
                EntityDescriptor::new(
                    "devices",
                    vec![
                        FieldDef::optional("serial_number", String).placeholders_as_null(),
                        FieldDef::optional("description", String),
                        FieldDef::optional("manufacturer", String),
                        FieldDef::optional("model", String),
                        FieldDef::optional("department", String),
                        FieldDef::optional("applied_parts_json", Json),
                        FieldDef::optional("customer_inventory", String),
                        FieldDef::optional("ams_inventory", String),
                        FieldDef::optional("verification_interval", Int),
                        FieldDef::optional("default_profile_key", String),
                        FieldDef::optional("next_verification_date", String),
                        FieldDef::optional("status", String),
                    ],
                )
                .with_parent("destinations", "destination_id", "destination_uuid"),
            )
            .with_entity(
                EntityDescriptor::new(
                    "verifications",
                    vec![
                        FieldDef::optional("verification_date", String),
                        FieldDef::optional("profile_name", String),
                        FieldDef::optional("results_json", Json),
                        FieldDef::optional("overall_status", String),
                        FieldDef::optional("visual_inspection_json", Json),
                        FieldDef::optional("mti_instrument", String),
                        FieldDef::optional("mti_serial", String),
                        FieldDef::optional("mti_version", String),
                        FieldDef::optional("mti_cal_date", String),
                        FieldDef::optional("technician_name", String),
                        FieldDef::optional("technician_username", String),
                        FieldDef::optional("verification_code", String),
                    ],
                )
                .with_parent("devices", "device_id", "device_uuid"),
            )
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::standard()
    }
}
