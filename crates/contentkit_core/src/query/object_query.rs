//! Template forest queries.
//!
//! A template is a stand-in entity whose attributes hold criteria instead of
//! data. Root templates are of the query's root type and share its table;
//! child templates join through the relation between their type and their
//! parent's type.

use crate::meta::MetadataRegistry;
use crate::query::condition::{BoolOperator, Criterion};
use crate::query::{join_condition, QueryError, QueryResult, SelectStatement};
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TemplateId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(usize);

#[derive(Debug, Clone)]
struct Template {
    type_name: String,
    conditions: Vec<(String, Criterion)>,
    pre_operator: BoolOperator,
    inter_operator: BoolOperator,
    parent: Option<TemplateId>,
    children: Vec<TemplateId>,
    group: Option<GroupId>,
}

impl Template {
    fn new(type_name: &str, parent: Option<TemplateId>) -> Self {
        Self {
            type_name: type_name.to_string(),
            conditions: Vec::new(),
            pre_operator: BoolOperator::And,
            inter_operator: BoolOperator::And,
            parent,
            children: Vec::new(),
            group: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Group {
    members: Vec<TemplateId>,
    pre_operator: BoolOperator,
    inter_operator: BoolOperator,
}

/// Forest of condition templates rooted at one type.
#[derive(Debug, Clone)]
pub struct ObjectQuery {
    root_type: String,
    templates: Vec<Template>,
    roots: Vec<TemplateId>,
    groups: Vec<Group>,
}

impl ObjectQuery {
    pub fn new(root_type: impl Into<String>) -> Self {
        Self {
            root_type: root_type.into(),
            templates: Vec::new(),
            roots: Vec::new(),
            groups: Vec::new(),
        }
    }

    pub fn root_type(&self) -> &str {
        &self.root_type
    }

    /// Adds a root template; its type is checked on `build`.
    pub fn template(&mut self, type_name: &str) -> TemplateId {
        let id = TemplateId(self.templates.len());
        self.templates.push(Template::new(type_name, None));
        self.roots.push(id);
        id
    }

    pub fn add_child(&mut self, parent: TemplateId, type_name: &str) -> QueryResult<TemplateId> {
        self.check(parent)?;
        let id = TemplateId(self.templates.len());
        self.templates.push(Template::new(type_name, Some(parent)));
        self.templates[parent.0].children.push(id);
        Ok(id)
    }

    /// Sets or replaces the criterion on `attribute`.
    pub fn set_condition(
        &mut self,
        template: TemplateId,
        attribute: &str,
        criterion: Criterion,
    ) -> QueryResult<()> {
        self.check(template)?;
        let conditions = &mut self.templates[template.0].conditions;
        match conditions.iter_mut().find(|(name, _)| name == attribute) {
            Some((_, existing)) => *existing = criterion,
            None => conditions.push((attribute.to_string(), criterion)),
        }
        Ok(())
    }

    /// Bare value under the default comparison policy.
    pub fn set_value(&mut self, template: TemplateId, attribute: &str, value: &str) -> QueryResult<()> {
        self.set_condition(template, attribute, Criterion::value(value))
    }

    pub fn set_pre_operator(&mut self, template: TemplateId, operator: BoolOperator) -> QueryResult<()> {
        self.check(template)?;
        self.templates[template.0].pre_operator = operator;
        Ok(())
    }

    pub fn set_inter_operator(&mut self, template: TemplateId, operator: BoolOperator) -> QueryResult<()> {
        self.check(template)?;
        self.templates[template.0].inter_operator = operator;
        Ok(())
    }

    /// Groups `members`; inside the group they are joined with
    /// `inter_operator`, and the group joins the outer condition with
    /// `pre_operator`. Members leave any earlier group.
    pub fn make_group(
        &mut self,
        members: &[TemplateId],
        pre_operator: BoolOperator,
        inter_operator: BoolOperator,
    ) -> QueryResult<GroupId> {
        for member in members {
            self.check(*member)?;
        }
        let id = GroupId(self.groups.len());
        for member in members {
            if let Some(previous) = self.templates[member.0].group {
                self.groups[previous.0].members.retain(|other| other != member);
            }
            self.templates[member.0].group = Some(id);
        }
        self.groups.push(Group {
            members: members.to_vec(),
            pre_operator,
            inter_operator,
        });
        Ok(id)
    }

    /// Composes tables, condition and joins.
    ///
    /// # Errors
    /// - `DisconnectedTemplate` for a root template of another type.
    /// - `NoRelation` for a child whose type is unrelated to its parent's.
    /// - `UnknownType` / `UnknownField` for names missing from metadata.
    pub fn build(&self, registry: &MetadataRegistry) -> QueryResult<SelectStatement> {
        let root_table = registry.type_metadata(&self.root_type)?.table().to_string();
        let mut statement = SelectStatement {
            root_type: self.root_type.clone(),
            root_alias: root_table.clone(),
            tables: vec![root_table.clone()],
            condition: String::new(),
            joins: Vec::new(),
        };

        let order = self.level_order();
        let mut aliases: HashMap<TemplateId, String> = HashMap::new();
        let mut used_aliases = HashSet::from([root_table.clone()]);
        for id in &order {
            let template = &self.templates[id.0];
            let metadata = registry.type_metadata(&template.type_name)?;
            let alias = match template.parent {
                None => {
                    if template.type_name != self.root_type {
                        return Err(QueryError::DisconnectedTemplate {
                            expected: self.root_type.clone(),
                            actual: template.type_name.clone(),
                        });
                    }
                    root_table.clone()
                }
                Some(parent) => {
                    let parent_template = &self.templates[parent.0];
                    let relation = registry
                        .type_metadata(&parent_template.type_name)?
                        .relation_to(&template.type_name)
                        .ok_or_else(|| QueryError::NoRelation {
                            from: parent_template.type_name.clone(),
                            to: template.type_name.clone(),
                        })?;
                    let table = metadata.table();
                    let alias = unique_alias(table, &mut used_aliases);
                    statement.add_table(if alias == table {
                        alias.clone()
                    } else {
                        format!("{table} AS {alias}")
                    });
                    let parent_alias = aliases.get(&parent).map_or(root_table.as_str(), String::as_str);
                    statement.add_join(join_condition(registry, relation, parent_alias, &alias)?);
                    alias
                }
            };
            aliases.insert(*id, alias);
        }

        let mut condition = String::new();
        for id in order.iter().filter(|id| self.templates[id.0].group.is_none()) {
            if let Some(part) = self.node_condition(*id, &aliases, registry)? {
                append_condition(&mut condition, self.templates[id.0].pre_operator, &part);
            }
        }
        for group in &self.groups {
            let mut inner = String::new();
            for member in &group.members {
                if let Some(part) = self.node_condition(*member, &aliases, registry)? {
                    append_condition(&mut inner, group.inter_operator.inter(), &part);
                }
            }
            if !inner.is_empty() {
                append_condition(&mut condition, group.pre_operator, &inner);
            }
        }
        statement.condition = condition;
        Ok(statement)
    }

    fn check(&self, template: TemplateId) -> QueryResult<()> {
        if template.0 < self.templates.len() {
            Ok(())
        } else {
            Err(QueryError::UnknownTemplate(template.0))
        }
    }

    /// Roots first, then each level of children in insertion order.
    fn level_order(&self) -> Vec<TemplateId> {
        let mut order = Vec::with_capacity(self.templates.len());
        let mut queue = self.roots.iter().copied().collect::<VecDeque<_>>();
        while let Some(id) = queue.pop_front() {
            order.push(id);
            queue.extend(self.templates[id.0].children.iter().copied());
        }
        order
    }

    fn node_condition(
        &self,
        id: TemplateId,
        aliases: &HashMap<TemplateId, String>,
        registry: &MetadataRegistry,
    ) -> QueryResult<Option<String>> {
        let template = &self.templates[id.0];
        if template.conditions.is_empty() {
            return Ok(None);
        }
        let metadata = registry.type_metadata(&template.type_name)?;
        let alias = aliases
            .get(&id)
            .map_or_else(|| metadata.table(), String::as_str);
        let mut parts = Vec::with_capacity(template.conditions.len());
        for (name, criterion) in &template.conditions {
            let attribute = metadata
                .attribute(name)
                .ok_or_else(|| QueryError::UnknownField {
                    type_name: template.type_name.clone(),
                    field: name.clone(),
                })?;
            match &attribute.column {
                Some(column) => parts.push(criterion.to_sql(&format!("{alias}.{column}"), metadata.is_pk(name))),
                None => parts.push(template.inter_operator.neutral().to_string()),
            }
        }
        Ok(Some(parts.join(template.inter_operator.inter().joiner())))
    }
}

fn unique_alias(table: &str, used: &mut HashSet<String>) -> String {
    if used.insert(table.to_string()) {
        return table.to_string();
    }
    let mut suffix = 1;
    loop {
        let candidate = format!("{table}{suffix}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        suffix += 1;
    }
}

fn append_condition(target: &mut String, operator: BoolOperator, part: &str) {
    if target.is_empty() {
        target.push_str(operator.leader());
    } else {
        target.push_str(operator.joiner());
    }
    target.push('(');
    target.push_str(part);
    target.push(')');
}

#[cfg(test)]
mod tests {
    use super::{append_condition, unique_alias};
    use crate::query::BoolOperator;
    use std::collections::HashSet;

    #[test]
    fn aliases_are_numbered_after_first_use() {
        let mut used = HashSet::new();
        assert_eq!(unique_alias("Recipe", &mut used), "Recipe");
        assert_eq!(unique_alias("Recipe", &mut used), "Recipe1");
        assert_eq!(unique_alias("Recipe", &mut used), "Recipe2");
    }

    #[test]
    fn leading_not_negates_first_part() {
        let mut condition = String::new();
        append_condition(&mut condition, BoolOperator::Not, "a = 1");
        append_condition(&mut condition, BoolOperator::Not, "b = 2");
        assert_eq!(condition, "NOT (a = 1) AND NOT (b = 2)");
    }
}
