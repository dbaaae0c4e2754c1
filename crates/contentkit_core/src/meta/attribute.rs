//! Attribute descriptions and tag matching.

use crate::meta::{MetadataError, MetadataResult};
use crate::model::value::Value;
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Semantic attribute type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Integer,
    Real,
    Boolean,
    #[default]
    String,
    Text,
    Date,
    DateTime,
}

impl ValueType {
    /// SQLite column type used for generated tables.
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Integer | Self::Boolean => "INTEGER",
            Self::Real => "REAL",
            Self::String | Self::Text | Self::Date | Self::DateTime => "TEXT",
        }
    }
}

/// How a requested tag set must relate to an attribute's own tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagMatch {
    /// Attribute carries every requested tag.
    All,
    /// Attribute carries none of the requested tags.
    None,
    /// Attribute carries at least one requested tag.
    Any,
}

impl TagMatch {
    pub fn matches(self, requested: &BTreeSet<String>, own: &BTreeSet<String>) -> bool {
        if requested.is_empty() {
            return true;
        }
        match self {
            Self::All => requested.is_subset(own),
            Self::None => requested.is_disjoint(own),
            Self::Any => !requested.is_disjoint(own),
        }
    }
}

/// Declared alias of another type's attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeReference {
    #[serde(rename = "type")]
    pub type_name: String,
    pub attribute: String,
}

/// Attribute as declared in metadata JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributeConfig {
    pub name: String,
    #[serde(rename = "type", default)]
    pub value_type: ValueType,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub restrictions_match: Option<String>,
    #[serde(default)]
    pub restrictions_not_match: Option<String>,
    #[serde(default)]
    pub restrictions_description: Option<String>,
    #[serde(default = "default_true")]
    pub editable: bool,
    #[serde(default)]
    pub input_type: Option<String>,
    #[serde(default)]
    pub display_type: Option<String>,
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default = "default_true")]
    pub persistent: bool,
    #[serde(default)]
    pub reference: Option<AttributeReference>,
}

fn default_true() -> bool {
    true
}

/// Validated attribute description.
///
/// Reference attributes start as a thin alias; the registry resolves the
/// full descriptor on first access and caches it in `resolved`.
#[derive(Debug, Clone)]
pub struct AttributeDescription {
    pub owner_type: String,
    pub name: String,
    pub value_type: ValueType,
    pub tags: BTreeSet<String>,
    pub default_value: Option<Value>,
    pub restrictions_match: Option<Regex>,
    pub restrictions_not_match: Option<Regex>,
    pub restrictions_description: Option<String>,
    pub editable: bool,
    pub input_type: Option<String>,
    pub display_type: Option<String>,
    /// Backing column; `None` for unmapped attributes.
    pub column: Option<String>,
    pub is_primary_key: bool,
    pub reference: Option<AttributeReference>,
    pub(crate) resolved: OnceCell<Box<AttributeDescription>>,
}

impl AttributeDescription {
    pub(crate) fn from_config(
        owner_type: &str,
        config: &AttributeConfig,
        is_primary_key: bool,
    ) -> MetadataResult<Self> {
        let qualified = format!("{owner_type}.{}", config.name);
        let restrictions_match = compile_pattern(&qualified, config.restrictions_match.as_deref())?;
        let restrictions_not_match =
            compile_pattern(&qualified, config.restrictions_not_match.as_deref())?;
        let default_value = config
            .default
            .as_ref()
            .map(|raw| default_to_value(&qualified, config.value_type, raw))
            .transpose()?
            .filter(|value| !value.is_null());
        let column = if config.persistent && config.reference.is_none() {
            Some(config.column.clone().unwrap_or_else(|| config.name.clone()))
        } else {
            None
        };

        Ok(Self {
            owner_type: owner_type.to_string(),
            name: config.name.clone(),
            value_type: config.value_type,
            tags: config.tags.iter().cloned().collect(),
            default_value,
            restrictions_match,
            restrictions_not_match,
            restrictions_description: config.restrictions_description.clone(),
            editable: config.editable,
            input_type: config.input_type.clone(),
            display_type: config.display_type.clone(),
            column,
            is_primary_key,
            reference: config.reference.clone(),
            resolved: OnceCell::new(),
        })
    }

    /// Returns whether the attribute has a backing column.
    pub fn is_mapped(&self) -> bool {
        self.column.is_some()
    }

    pub fn is_reference(&self) -> bool {
        self.reference.is_some()
    }

    /// Checks one value against both restriction patterns.
    ///
    /// Null values always pass. The error is the human-readable message.
    pub fn validate_value(&self, value: &Value) -> Result<(), String> {
        let Some(text) = value.as_text() else {
            return Ok(());
        };
        let describe = |fallback: String| {
            self.restrictions_description
                .clone()
                .unwrap_or(fallback)
        };
        if let Some(pattern) = &self.restrictions_match {
            if !pattern.is_match(&text) {
                return Err(describe(format!(
                    "value `{text}` does not match `{}`",
                    pattern.as_str()
                )));
            }
        }
        if let Some(pattern) = &self.restrictions_not_match {
            if pattern.is_match(&text) {
                return Err(describe(format!(
                    "value `{text}` must not match `{}`",
                    pattern.as_str()
                )));
            }
        }
        Ok(())
    }

    /// Builds the resolved form of a reference attribute from its target.
    pub(crate) fn resolved_from(&self, target: &AttributeDescription) -> Self {
        let mut tags = target.tags.clone();
        tags.extend(self.tags.iter().cloned());
        Self {
            owner_type: self.owner_type.clone(),
            name: self.name.clone(),
            value_type: target.value_type,
            tags,
            default_value: target.default_value.clone(),
            restrictions_match: target.restrictions_match.clone(),
            restrictions_not_match: target.restrictions_not_match.clone(),
            restrictions_description: target.restrictions_description.clone(),
            editable: false,
            input_type: target.input_type.clone(),
            display_type: target.display_type.clone(),
            column: None,
            is_primary_key: false,
            reference: self.reference.clone(),
            resolved: OnceCell::new(),
        }
    }
}

fn compile_pattern(attribute: &str, pattern: Option<&str>) -> MetadataResult<Option<Regex>> {
    pattern
        .filter(|value| !value.is_empty())
        .map(|value| {
            Regex::new(value).map_err(|err| MetadataError::InvalidPattern {
                attribute: attribute.to_string(),
                message: err.to_string(),
            })
        })
        .transpose()
}

fn default_to_value(
    attribute: &str,
    value_type: ValueType,
    raw: &serde_json::Value,
) -> MetadataResult<Value> {
    let invalid = || {
        MetadataError::InvalidConfig(format!(
            "default of `{attribute}` does not fit type {value_type:?}"
        ))
    };
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let value = match value_type {
        ValueType::Integer => Value::Integer(raw.as_i64().ok_or_else(invalid)?),
        ValueType::Real => Value::Real(raw.as_f64().ok_or_else(invalid)?),
        ValueType::Boolean => Value::Boolean(raw.as_bool().ok_or_else(invalid)?),
        ValueType::String | ValueType::Text | ValueType::Date | ValueType::DateTime => {
            match raw {
                serde_json::Value::String(text) => Value::Text(text.clone()),
                serde_json::Value::Number(number) => Value::Text(number.to_string()),
                _ => return Err(invalid()),
            }
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::{AttributeConfig, AttributeDescription, TagMatch};
    use crate::model::value::Value;
    use std::collections::BTreeSet;

    fn tags(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn any_means_at_least_one_common_tag() {
        let own = tags(&["DATATYPE_ATTRIBUTE", "SEARCHABLE"]);
        assert!(TagMatch::Any.matches(&tags(&["SEARCHABLE", "HIDDEN"]), &own));
        assert!(!TagMatch::Any.matches(&tags(&["HIDDEN"]), &own));
        assert!(!TagMatch::All.matches(&tags(&["SEARCHABLE", "HIDDEN"]), &own));
        assert!(TagMatch::None.matches(&tags(&["HIDDEN"]), &own));
        assert!(TagMatch::None.matches(&tags(&[]), &own));
    }

    #[test]
    fn restriction_patterns_produce_description() {
        let config: AttributeConfig = serde_json::from_str(
            r#"{
                "name": "email",
                "restrictions_match": "^[^@]+@[^@]+$",
                "restrictions_not_match": "example\\.org$",
                "restrictions_description": "a valid address"
            }"#,
        )
        .expect("config");
        let description = AttributeDescription::from_config("Author", &config, false).expect("attr");

        assert!(description.validate_value(&Value::from("ingo@cook.net")).is_ok());
        assert_eq!(
            description.validate_value(&Value::from("nope")),
            Err("a valid address".to_string())
        );
        assert!(description
            .validate_value(&Value::from("x@example.org"))
            .is_err());
        assert!(description.validate_value(&Value::Null).is_ok());
    }

    #[test]
    fn unmapped_attribute_has_no_column() {
        let config: AttributeConfig =
            serde_json::from_str(r#"{"name": "bio", "persistent": false}"#).expect("config");
        let description = AttributeDescription::from_config("Author", &config, false).expect("attr");
        assert!(!description.is_mapped());
    }
}
