//! Value validation against attribute restrictions.

use crate::error::{PersistenceError, PersistenceResult};
use crate::meta::MetadataRegistry;
use crate::model::entity::Entity;

/// Checks every present value of `entity`.
///
/// # Errors
/// - `UnknownField` when a value name is neither attribute nor relation role.
/// - `ValidationFailed` with the attribute name and restriction message.
pub fn validate_entity(registry: &MetadataRegistry, entity: &Entity) -> PersistenceResult<()> {
    let metadata = registry.type_metadata(entity.type_name())?;
    for (name, value) in entity.values() {
        if metadata.has_relation(name) {
            continue;
        }
        if !metadata.has_attribute(name) {
            return Err(PersistenceError::UnknownField {
                type_name: entity.type_name().to_string(),
                field: name.clone(),
            });
        }
        let attribute = registry.attribute(entity.type_name(), name)?;
        attribute
            .validate_value(value)
            .map_err(|message| PersistenceError::ValidationFailed {
                attribute: name.clone(),
                message,
            })?;
    }
    Ok(())
}
