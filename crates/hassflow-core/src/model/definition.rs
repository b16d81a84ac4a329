// ── Static entity and service definitions ──
//
// Supplied once at runtime construction and never mutated. The entity
// definition decides how raw state strings are converted; the service
// definition is carried for callers and tooling only.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::value::StateValue;
use crate::error::CoreError;

/// Declared type of an entity state or attribute.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ValueType {
    Number,
    #[default]
    String,
}

impl ValueType {
    /// Convert a raw state string.
    ///
    /// `Number` requires a finite decimal; anything else (including the
    /// `unavailable`/`unknown` placeholders) is a [`CoreError::Conversion`].
    pub fn convert(self, entity_id: &str, raw: &str) -> Result<StateValue, CoreError> {
        match self {
            Self::String => Ok(StateValue::Text(raw.to_owned())),
            Self::Number => raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .map(StateValue::Number)
                .ok_or_else(|| CoreError::Conversion {
                    entity_id: entity_id.to_owned(),
                    raw: raw.to_owned(),
                }),
        }
    }
}

/// Declared shape of one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitySpec {
    #[serde(default)]
    pub state_type: ValueType,
    #[serde(default)]
    pub attributes: IndexMap<String, ValueType>,
}

/// Entity id → declared types.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityDefinition {
    entities: IndexMap<String, EntitySpec>,
}

impl EntityDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an entity's state type.
    pub fn with_entity(mut self, entity_id: impl Into<String>, state_type: ValueType) -> Self {
        self.entities.entry(entity_id.into()).or_default().state_type = state_type;
        self
    }

    /// Declare one attribute's type.
    pub fn with_attribute(
        mut self,
        entity_id: impl Into<String>,
        attribute: impl Into<String>,
        attr_type: ValueType,
    ) -> Self {
        self.entities
            .entry(entity_id.into())
            .or_default()
            .attributes
            .insert(attribute.into(), attr_type);
        self
    }

    pub fn get(&self, entity_id: &str) -> Option<&EntitySpec> {
        self.entities.get(entity_id)
    }

    /// Entities absent from the definition are treated as `String`.
    pub fn state_type(&self, entity_id: &str) -> ValueType {
        self.get(entity_id).map_or(ValueType::String, |spec| spec.state_type)
    }

    pub fn convert(&self, entity_id: &str, raw: &str) -> Result<StateValue, CoreError> {
        self.state_type(entity_id).convert(entity_id, raw)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &EntitySpec)> {
        self.entities.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl FromIterator<(String, EntitySpec)> for EntityDefinition {
    fn from_iter<I: IntoIterator<Item = (String, EntitySpec)>>(iter: I) -> Self {
        Self {
            entities: iter.into_iter().collect(),
        }
    }
}

/// Accepted payload fields of one service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default)]
    pub fields: Vec<String>,
}

/// `"domain.service"` → accepted payload field names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceDefinition {
    services: IndexMap<String, ServiceSpec>,
}

impl ServiceDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service<I, S>(mut self, action_id: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields = fields.into_iter().map(Into::into).collect();
        self.services.insert(action_id.into(), ServiceSpec { fields });
        self
    }

    pub fn fields(&self, action_id: &str) -> Option<&[String]> {
        self.services.get(action_id).map(|s| s.fields.as_slice())
    }

    pub fn contains(&self, action_id: &str) -> bool {
        self.services.contains_key(action_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ServiceSpec)> {
        self.services.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
