use contentkit_core::meta::{Hierarchy, SortDirection};
use contentkit_core::{EntityId, IdError, MetadataError, MetadataRegistry, TagMatch, Value};

const COOKBOOK: &str = include_str!("fixtures/cookbook.json");

fn cookbook() -> MetadataRegistry {
    MetadataRegistry::from_json_str(COOKBOOK).unwrap()
}

#[test]
fn serialized_ids_round_trip_through_registry() {
    let registry = cookbook();
    for serialized in ["Author:1", "Recipe:42", "RecipeNote:7:de"] {
        let id = EntityId::parse(serialized, &registry).unwrap();
        assert_eq!(id.to_string(), serialized);
        assert!(EntityId::is_valid(serialized, &registry));
    }
}

#[test]
fn invalid_ids_are_rejected_with_reason() {
    let registry = cookbook();
    assert!(matches!(
        EntityId::parse("Chef:1", &registry),
        Err(IdError::UnknownType(name)) if name == "Chef"
    ));
    assert!(matches!(
        EntityId::parse("RecipeNote:7", &registry),
        Err(IdError::ArityMismatch { expected: 2, actual: 1, .. })
    ));
    assert!(matches!(
        EntityId::parse("Author", &registry),
        Err(IdError::Malformed(_))
    ));
    assert!(!EntityId::is_valid("Author::", &registry));
}

#[test]
fn provisional_ids_are_unique_and_detectable() {
    let registry = cookbook();
    let first = EntityId::new_provisional("Author", &registry).unwrap();
    let second = EntityId::new_provisional("Author", &registry).unwrap();

    assert!(first.is_provisional());
    assert_ne!(first, second);
    assert_eq!(EntityId::parse(&first.to_string(), &registry).unwrap(), first);

    let partial =
        EntityId::provisional_from("RecipeNote", &registry, &[Some("7".to_string()), None]).unwrap();
    assert!(!partial.is_provisional());
    assert!(partial.has_provisional_component());
}

#[test]
fn ids_serialize_as_plain_strings() {
    let id = EntityId::new("Recipe", ["3"]).unwrap();
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, "\"Recipe:3\"");
    let back: EntityId = serde_json::from_str(&json).unwrap();
    assert_eq!(back, id);
}

#[test]
fn registry_exposes_types_attributes_and_relations() {
    let registry = cookbook();
    let author = registry.type_metadata("Author").unwrap();
    assert_eq!(author.pk_names(), ["id".to_string()]);
    assert!(author.has_attribute("bio"));
    assert_eq!(author.column_for("bio"), None);
    assert!(author.has_relation("Recipe"));

    let recipe = registry.type_metadata("Recipe").unwrap();
    let to_author = recipe.relation("Author").unwrap();
    assert_eq!(to_author.hierarchy, Hierarchy::Parent);
    assert_eq!(to_author.fk_column, "authorFk");
    assert!(to_author.is_composite());

    let to_recipes = author.relation("Recipe").unwrap();
    assert!(to_recipes.is_child());
    assert!(to_recipes.is_multi_valued());
    let order = author.default_order(Some("Recipe")).unwrap();
    assert_eq!(order[0].field, "name");
    assert_eq!(order[0].direction, SortDirection::Asc);

    assert!(matches!(
        registry.type_metadata("Chef"),
        Err(MetadataError::UnknownType(_))
    ));
}

#[test]
fn reference_attributes_resolve_to_their_target() {
    let registry = cookbook();
    let alias = registry.attribute("Recipe", "authorName").unwrap();
    assert!(alias.is_reference());
    assert!(!alias.is_mapped());
    assert_eq!(alias.restrictions_description.as_deref(), Some("Only letters, spaces and punctuation"));
    assert!(alias.validate_value(&Value::from("R2D2!")).is_err());
}

#[test]
fn tag_matching_uses_set_semantics() {
    let registry = cookbook();
    let names = |tags: &[&str], mode| {
        registry
            .attributes("Author", tags, mode)
            .unwrap()
            .iter()
            .map(|attribute| attribute.name.clone())
            .collect::<Vec<_>>()
    };

    assert_eq!(names(&[], TagMatch::All).len(), 4);
    assert_eq!(names(&["listing"], TagMatch::All), ["name"]);
    assert_eq!(names(&["listing", "contact"], TagMatch::Any), ["name", "email"]);
    assert!(names(&["listing", "contact"], TagMatch::All).is_empty());
    assert!(!names(&["listing"], TagMatch::None).contains(&"name".to_string()));
}

#[test]
fn attribute_restrictions_report_description() {
    let registry = cookbook();
    let name = registry.attribute("Author", "name").unwrap();
    assert!(name.validate_value(&Value::from("Ingo Schmidt")).is_ok());
    assert_eq!(
        name.validate_value(&Value::from("R2D2!")).unwrap_err(),
        "Only letters, spaces and punctuation"
    );
    assert!(name.validate_value(&Value::Null).is_ok());
}

#[test]
fn broken_metadata_is_rejected() {
    let unknown_end = COOKBOOK.replace("{\"type\": \"Ingredient\", \"role\"", "{\"type\": \"Spice\", \"role\"");
    assert!(MetadataRegistry::from_json_str(&unknown_end).is_err());

    let bad_table = COOKBOOK.replace("\"recipe_notes\"", "\"recipe notes\"");
    assert!(matches!(
        MetadataRegistry::from_json_str(&bad_table),
        Err(MetadataError::InvalidConfig(_))
    ));

    let bad_pattern = COOKBOOK.replace("^[A-Za-z .'-]+$", "([");
    assert!(matches!(
        MetadataRegistry::from_json_str(&bad_pattern),
        Err(MetadataError::InvalidPattern { .. })
    ));

    assert!(matches!(
        MetadataRegistry::from_json_str("{\"types\": ["),
        Err(MetadataError::Parse(_))
    ));
}
