use contentkit_core::{
    BoolOperator, ComparisonOperator, Criterion, MetadataRegistry, ObjectQuery, QueryError,
    QuerySpec, StringQuery,
};

const COOKBOOK: &str = include_str!("fixtures/cookbook.json");

fn cookbook() -> MetadataRegistry {
    MetadataRegistry::from_json_str(COOKBOOK).unwrap()
}

#[test]
fn sibling_templates_and_children_compose_in_level_order() {
    let registry = cookbook();
    let mut query = ObjectQuery::new("Author");
    let by_name = query.template("Author");
    query.set_value(by_name, "name", "x").unwrap();
    let by_email = query.template("Author");
    query.set_value(by_email, "email", "y").unwrap();
    query.set_pre_operator(by_email, BoolOperator::Or).unwrap();
    let recipe = query.add_child(by_name, "Recipe").unwrap();
    query.set_value(recipe, "name", "z").unwrap();

    let statement = query.build(&registry).unwrap();

    assert_eq!(statement.tables, ["Author", "Recipe"]);
    assert_eq!(
        statement.where_clause(),
        "(Author.name LIKE '%x%') OR (Author.email LIKE '%y%') AND (Recipe.name LIKE '%z%') AND Recipe.authorFk = Author.id"
    );
    assert_eq!(
        statement.to_sql(&["Author.id".to_string()]),
        format!(
            "SELECT DISTINCT Author.id FROM Author, Recipe WHERE {}",
            statement.where_clause()
        )
    );
}

#[test]
fn grouped_templates_are_bracketed_together() {
    let registry = cookbook();
    let mut query = ObjectQuery::new("Author");
    let first = query.template("Author");
    query.set_value(first, "name", "x").unwrap();
    let second = query.template("Author");
    query.set_value(second, "email", "y").unwrap();
    query
        .make_group(&[first, second], BoolOperator::And, BoolOperator::Or)
        .unwrap();

    let statement = query.build(&registry).unwrap();
    assert_eq!(
        statement.condition,
        "((Author.name LIKE '%x%') OR (Author.email LIKE '%y%'))"
    );
}

#[test]
fn criteria_within_one_template_follow_its_inter_operator() {
    let registry = cookbook();
    let mut query = ObjectQuery::new("Recipe");
    let recipe = query.template("Recipe");
    query
        .set_condition(recipe, "portions", Criterion::new(ComparisonOperator::GreaterOrEqual, "4"))
        .unwrap();
    query
        .set_condition(recipe, "name", Criterion::new(ComparisonOperator::NotLike, "%cake%"))
        .unwrap();
    query.set_inter_operator(recipe, BoolOperator::Or).unwrap();
    query.set_pre_operator(recipe, BoolOperator::Not).unwrap();

    let statement = query.build(&registry).unwrap();
    assert_eq!(
        statement.condition,
        "NOT (Recipe.portions >= '4' OR Recipe.name NOT LIKE '%cake%')"
    );
}

#[test]
fn key_attributes_match_exactly_and_unmapped_attributes_are_neutral() {
    let registry = cookbook();
    let mut query = ObjectQuery::new("Author");
    let author = query.template("Author");
    query.set_value(author, "id", "3").unwrap();
    query.set_value(author, "bio", "chef").unwrap();

    let statement = query.build(&registry).unwrap();
    assert_eq!(statement.condition, "(Author.id = '3' AND TRUE)");

    query.set_inter_operator(author, BoolOperator::Or).unwrap();
    let statement = query.build(&registry).unwrap();
    assert_eq!(statement.condition, "(Author.id = '3' OR FALSE)");
}

#[test]
fn repeated_tables_get_numbered_aliases() {
    let registry = cookbook();
    let mut query = ObjectQuery::new("Author");
    let first = query.template("Author");
    let second = query.template("Author");
    let soups = query.add_child(first, "Recipe").unwrap();
    query.set_value(soups, "name", "soup").unwrap();
    let cakes = query.add_child(second, "Recipe").unwrap();
    query.set_value(cakes, "name", "cake").unwrap();
    let salt = query.add_child(soups, "Ingredient").unwrap();
    query.set_value(salt, "name", "salt").unwrap();

    let statement = query.build(&registry).unwrap();

    assert_eq!(
        statement.tables,
        ["Author", "Recipe", "Recipe AS Recipe1", "Ingredient"]
    );
    assert_eq!(
        statement.joins,
        [
            "Recipe.authorFk = Author.id",
            "Recipe1.authorFk = Author.id",
            "Ingredient.recipeFk = Recipe.id",
        ]
    );
    assert_eq!(
        statement.condition,
        "(Recipe.name LIKE '%soup%') AND (Recipe1.name LIKE '%cake%') AND (Ingredient.name LIKE '%salt%')"
    );
}

#[test]
fn parent_templates_join_from_the_child_side() {
    let registry = cookbook();
    let mut query = ObjectQuery::new("Recipe");
    let recipe = query.template("Recipe");
    let author = query.add_child(recipe, "Author").unwrap();
    query.set_value(author, "name", "Ingo").unwrap();

    let statement = query.build(&registry).unwrap();
    assert_eq!(statement.joins, ["Recipe.authorFk = Author.id"]);
    assert_eq!(statement.root_alias, "Recipe");
}

#[test]
fn empty_query_matches_everything() {
    let registry = cookbook();
    let mut query = ObjectQuery::new("Author");
    query.template("Author");

    let statement = query.build(&registry).unwrap();
    assert_eq!(statement.where_clause(), "1");
}

#[test]
fn invalid_template_forests_are_rejected() {
    let registry = cookbook();

    let mut foreign_root = ObjectQuery::new("Author");
    foreign_root.template("Recipe");
    assert!(matches!(
        foreign_root.build(&registry),
        Err(QueryError::DisconnectedTemplate { expected, actual }) if expected == "Author" && actual == "Recipe"
    ));

    let mut unrelated = ObjectQuery::new("Author");
    let author = unrelated.template("Author");
    unrelated.add_child(author, "RecipeNote").unwrap();
    assert!(matches!(
        unrelated.build(&registry),
        Err(QueryError::NoRelation { .. })
    ));

    let mut unknown_field = ObjectQuery::new("Author");
    let author = unknown_field.template("Author");
    unknown_field.set_value(author, "nickname", "x").unwrap();
    assert!(matches!(
        unknown_field.build(&registry),
        Err(QueryError::UnknownField { field, .. }) if field == "nickname"
    ));

    let mut unknown_type = ObjectQuery::new("Chef");
    unknown_type.template("Chef");
    assert!(matches!(
        unknown_type.build(&registry),
        Err(QueryError::UnknownType(name)) if name == "Chef"
    ));
}

#[test]
fn string_query_rewrites_fields_and_joins_referenced_types() {
    let registry = cookbook();
    let statement = StringQuery::new("Author", "Author.name LIKE '%ingo%' AND Recipe.portions = 4")
        .build(&registry)
        .unwrap();

    assert_eq!(statement.tables, ["Author", "Recipe"]);
    assert_eq!(
        statement.where_clause(),
        "(Author.name LIKE '%ingo%' AND Recipe.portions = 4) AND Recipe.authorFk = Author.id"
    );
}

#[test]
fn string_query_walks_multi_step_paths() {
    let registry = cookbook();

    let down = StringQuery::new("Author", "Ingredient.name = 'salt'")
        .build(&registry)
        .unwrap();
    assert_eq!(down.tables, ["Author", "Recipe", "Ingredient"]);
    assert_eq!(
        down.joins,
        ["Recipe.authorFk = Author.id", "Ingredient.recipeFk = Recipe.id"]
    );

    let up_and_down = StringQuery::new("Recipe", "Ingredient.name = 'salt' or Author.name = 'Ingo'")
        .build(&registry)
        .unwrap();
    assert_eq!(up_and_down.tables, ["Recipe", "Author", "Ingredient"]);
    assert_eq!(
        up_and_down.condition,
        "(Ingredient.name = 'salt' OR Author.name = 'Ingo')"
    );
}

#[test]
fn string_query_keeps_function_calls_and_keywords() {
    let registry = cookbook();
    let statement = StringQuery::new("Author", "lower(Author.name) like 'ingo%' and Author.email is not null")
        .build(&registry)
        .unwrap();
    assert_eq!(
        statement.condition,
        "(lower(Author.name) LIKE 'ingo%' AND Author.email IS NOT NULL)"
    );
    assert!(statement.joins.is_empty());
}

#[test]
fn string_query_errors_name_the_problem() {
    let registry = cookbook();

    assert!(matches!(
        StringQuery::new("Author", "name LIKE '%ingo%'").build(&registry),
        Err(QueryError::MissingTypeQualifier(token)) if token == "name"
    ));
    assert!(matches!(
        StringQuery::new("Author", "RecipeNote.language = 'de'").build(&registry),
        Err(QueryError::NoConnectionBetweenTypes { from, to }) if from == "Author" && to == "RecipeNote"
    ));
    assert!(matches!(
        StringQuery::new("Author", "Chef.name = 'x'").build(&registry),
        Err(QueryError::UnknownType(name)) if name == "Chef"
    ));
    assert!(matches!(
        StringQuery::new("Author", "Author.nickname = 'x'").build(&registry),
        Err(QueryError::UnknownField { .. })
    ));
    assert!(matches!(
        StringQuery::new("Author", "Author.name = 'open").build(&registry),
        Err(QueryError::Malformed { message, .. }) if message == "unterminated string literal"
    ));
    assert!(matches!(
        StringQuery::new("Author", "(Author.name = 'x'").build(&registry),
        Err(QueryError::Malformed { .. })
    ));
}

#[test]
fn query_spec_checks_the_requested_root() {
    let registry = cookbook();
    let templates = QuerySpec::Templates(ObjectQuery::new("Recipe"));
    assert!(matches!(
        templates.statement("Author", &registry),
        Err(QueryError::DisconnectedTemplate { .. })
    ));

    let condition = QuerySpec::Condition("Author.name = 'Ingo'".to_string());
    let statement = condition.statement("Author", &registry).unwrap();
    assert_eq!(statement.condition, "(Author.name = 'Ingo')");
}
