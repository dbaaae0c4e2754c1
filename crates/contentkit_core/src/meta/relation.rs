//! Relation descriptions derived from two-ended relation declarations.

use crate::meta::{MetadataError, MetadataResult};
use serde::{Deserialize, Serialize};

/// Cardinality bounds of one relation end; `max = None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Multiplicity {
    #[serde(default)]
    pub min: u32,
    #[serde(default)]
    pub max: Option<u32>,
}

impl Multiplicity {
    pub fn is_single(self) -> bool {
        self.max == Some(1)
    }
}

/// Aggregation kind of one relation end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    #[default]
    None,
    Shared,
    Composite,
}

/// Position of the other end relative to this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hierarchy {
    /// The other end is the parent (this type holds the foreign key).
    Parent,
    /// The other end is a child (the other type holds the foreign key).
    Child,
    Undefined,
}

/// One declared relation end.
///
/// `role` is the name under which the opposite type navigates to this end;
/// `min`/`max` bound how many instances of this end relate to one instance
/// of the opposite end; `navigable` tells whether that navigation exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelationEndConfig {
    #[serde(rename = "type")]
    pub type_name: String,
    pub role: String,
    #[serde(default)]
    pub min: u32,
    #[serde(default)]
    pub max: Option<u32>,
    #[serde(default)]
    pub aggregation: Aggregation,
    #[serde(default = "default_navigable")]
    pub navigable: bool,
}

fn default_navigable() -> bool {
    true
}

impl RelationEndConfig {
    pub fn multiplicity(&self) -> Multiplicity {
        Multiplicity {
            min: self.min,
            max: self.max,
        }
    }
}

/// Relation as declared in metadata JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelationConfig {
    pub ends: [RelationEndConfig; 2],
    /// Foreign-key column in the child table.
    pub fk_column: String,
    /// Default order of the child end, `field [ASC|DESC]`.
    #[serde(default)]
    pub order: Option<String>,
}

/// One navigable direction of a relation, seen from `this_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDescription {
    pub this_type: String,
    pub this_role: String,
    pub other_type: String,
    pub other_role: String,
    pub this_multiplicity: Multiplicity,
    pub other_multiplicity: Multiplicity,
    pub this_aggregation: Aggregation,
    pub other_aggregation: Aggregation,
    pub this_navigable: bool,
    pub other_navigable: bool,
    pub hierarchy: Hierarchy,
    pub fk_column: String,
    pub order: Option<String>,
}

impl RelationDescription {
    /// Other end is the parent.
    pub fn is_parent(&self) -> bool {
        self.hierarchy == Hierarchy::Parent
    }

    /// Other end is a child.
    pub fn is_child(&self) -> bool {
        self.hierarchy == Hierarchy::Child
    }

    pub fn is_multi_valued(&self) -> bool {
        !self.other_multiplicity.is_single()
    }

    /// Children are owned by the parent end.
    pub fn is_composite(&self) -> bool {
        match self.hierarchy {
            Hierarchy::Child => self.this_aggregation == Aggregation::Composite,
            Hierarchy::Parent => self.other_aggregation == Aggregation::Composite,
            Hierarchy::Undefined => false,
        }
    }

    /// Type whose table holds the foreign-key column.
    pub fn child_type(&self) -> &str {
        if self.is_parent() {
            &self.this_type
        } else {
            &self.other_type
        }
    }

    /// Type referenced by the foreign-key column.
    pub fn parent_type(&self) -> &str {
        if self.is_parent() {
            &self.other_type
        } else {
            &self.this_type
        }
    }
}

impl RelationConfig {
    /// Index of the parent end; rejects many-to-many declarations.
    pub(crate) fn parent_index(&self) -> MetadataResult<usize> {
        let [first, second] = &self.ends;
        match (first.multiplicity().is_single(), second.multiplicity().is_single()) {
            (true, _) => Ok(0),
            (false, true) => Ok(1),
            (false, false) => Err(MetadataError::InvalidConfig(format!(
                "relation {}.{} <-> {}.{} is many-to-many; model it through an association type",
                first.type_name, first.role, second.type_name, second.role
            ))),
        }
    }

    /// Descriptions for every navigable direction.
    pub(crate) fn describe(&self) -> MetadataResult<Vec<RelationDescription>> {
        let parent = self.parent_index()?;
        let mut descriptions = Vec::with_capacity(2);
        for this_index in 0..2 {
            let other_index = 1 - this_index;
            let this_end = &self.ends[this_index];
            let other_end = &self.ends[other_index];
            if !other_end.navigable {
                continue;
            }
            let hierarchy = if other_index == parent {
                Hierarchy::Parent
            } else {
                Hierarchy::Child
            };
            descriptions.push(RelationDescription {
                this_type: this_end.type_name.clone(),
                this_role: this_end.role.clone(),
                other_type: other_end.type_name.clone(),
                other_role: other_end.role.clone(),
                this_multiplicity: this_end.multiplicity(),
                other_multiplicity: other_end.multiplicity(),
                this_aggregation: this_end.aggregation,
                other_aggregation: other_end.aggregation,
                this_navigable: this_end.navigable,
                other_navigable: other_end.navigable,
                hierarchy,
                fk_column: self.fk_column.clone(),
                order: if hierarchy == Hierarchy::Child {
                    self.order.clone()
                } else {
                    None
                },
            });
        }
        Ok(descriptions)
    }
}

#[cfg(test)]
mod tests {
    use super::{Hierarchy, RelationConfig};

    fn config(json: &str) -> RelationConfig {
        serde_json::from_str(json).expect("relation config")
    }

    #[test]
    fn hierarchy_follows_single_end() {
        let relation = config(
            r#"{
                "ends": [
                    {"type": "Recipe", "role": "Recipe", "min": 0, "max": null},
                    {"type": "Author", "role": "Author", "min": 0, "max": 1, "aggregation": "composite"}
                ],
                "fk_column": "authorFk"
            }"#,
        );
        let descriptions = relation.describe().expect("describe");
        let recipe_side = descriptions
            .iter()
            .find(|description| description.this_type == "Recipe")
            .expect("recipe side");
        assert_eq!(recipe_side.hierarchy, Hierarchy::Parent);
        assert_eq!(recipe_side.other_role, "Author");
        assert!(recipe_side.is_composite());

        let author_side = descriptions
            .iter()
            .find(|description| description.this_type == "Author")
            .expect("author side");
        assert_eq!(author_side.hierarchy, Hierarchy::Child);
        assert!(author_side.is_multi_valued());
        assert_eq!(author_side.child_type(), "Recipe");
    }

    #[test]
    fn many_to_many_is_rejected() {
        let relation = config(
            r#"{
                "ends": [
                    {"type": "Recipe", "role": "Recipe"},
                    {"type": "Tag", "role": "Tag"}
                ],
                "fk_column": "tagFk"
            }"#,
        );
        assert!(relation.describe().is_err());
    }

    #[test]
    fn non_navigable_end_is_not_registered() {
        let relation = config(
            r#"{
                "ends": [
                    {"type": "Author", "role": "Author", "max": 1},
                    {"type": "Recipe", "role": "Recipe", "navigable": false}
                ],
                "fk_column": "authorFk"
            }"#,
        );
        let descriptions = relation.describe().expect("describe");
        assert_eq!(descriptions.len(), 1);
        assert_eq!(descriptions[0].this_type, "Recipe");
    }
}
