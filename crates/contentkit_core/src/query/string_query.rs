//! Textual condition queries.
//!
//! Field references are written `Type.attribute` and rewritten to
//! `table.column`; joins to every referenced type are derived from the
//! relation graph.

use crate::meta::MetadataRegistry;
use crate::query::{join_condition, QueryError, QueryResult, SelectStatement};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"'(?:[^']|'')*'|[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)?|[0-9]+(?:\.[0-9]+)?|<>|<=|>=|!=|\|\||[=<>(),+\-*/%]|\s+",
    )
    .expect("valid query token regex")
});

const KEYWORDS: &[&str] = &[
    "AND", "OR", "NOT", "LIKE", "IN", "IS", "NULL", "BETWEEN", "TRUE", "FALSE", "ESCAPE", "GLOB",
    "COLLATE", "NOCASE",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token<'a> {
    Space,
    Word(&'a str),
    Field { type_name: &'a str, attribute: &'a str },
    Other(&'a str),
}

/// Condition string over `Type.attribute` references, rooted at one type.
#[derive(Debug, Clone)]
pub struct StringQuery {
    root_type: String,
    condition: String,
}

impl StringQuery {
    pub fn new(root_type: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            root_type: root_type.into(),
            condition: condition.into(),
        }
    }

    pub fn root_type(&self) -> &str {
        &self.root_type
    }

    pub fn condition(&self) -> &str {
        &self.condition
    }

    /// Rewrites field references and derives joins.
    ///
    /// # Errors
    /// - `MissingTypeQualifier` for a bare identifier that is neither a
    ///   keyword nor a function name.
    /// - `NoConnectionBetweenTypes` when a referenced type is neither an
    ///   ancestor nor a descendant of the root type.
    /// - `Malformed` for unterminated literals, stray characters or
    ///   unbalanced parentheses.
    pub fn build(&self, registry: &MetadataRegistry) -> QueryResult<SelectStatement> {
        let root_table = registry.type_metadata(&self.root_type)?.table().to_string();
        let tokens = self.tokenize()?;

        let mut rewritten = String::with_capacity(self.condition.len());
        let mut referenced = BTreeSet::new();
        let mut depth = 0_i32;
        for (index, token) in tokens.iter().enumerate() {
            match token {
                Token::Space => rewritten.push(' '),
                Token::Field {
                    type_name,
                    attribute,
                } => {
                    let metadata = registry.type_metadata(type_name)?;
                    if !metadata.has_attribute(attribute) {
                        return Err(QueryError::UnknownField {
                            type_name: type_name.to_string(),
                            field: attribute.to_string(),
                        });
                    }
                    let column = metadata.column_for(attribute).ok_or_else(|| QueryError::Malformed {
                        query: self.condition.clone(),
                        message: format!("`{type_name}.{attribute}` has no column"),
                    })?;
                    rewritten.push_str(metadata.table());
                    rewritten.push('.');
                    rewritten.push_str(column);
                    referenced.insert(type_name.to_string());
                }
                Token::Word(word) => {
                    let upper = word.to_ascii_uppercase();
                    if KEYWORDS.contains(&upper.as_str()) {
                        rewritten.push_str(&upper);
                    } else if next_significant(&tokens, index) == Some(&Token::Other("(")) {
                        rewritten.push_str(word);
                    } else {
                        return Err(QueryError::MissingTypeQualifier(word.to_string()));
                    }
                }
                Token::Other(text) => {
                    match *text {
                        "(" => depth += 1,
                        ")" => depth -= 1,
                        _ => {}
                    }
                    if depth < 0 {
                        return Err(self.malformed("unbalanced parentheses"));
                    }
                    rewritten.push_str(text);
                }
            }
        }
        if depth != 0 {
            return Err(self.malformed("unbalanced parentheses"));
        }

        let trimmed = rewritten.trim();
        let mut statement = SelectStatement {
            root_type: self.root_type.clone(),
            root_alias: root_table.clone(),
            tables: vec![root_table],
            condition: if trimmed.is_empty() {
                String::new()
            } else {
                format!("({trimmed})")
            },
            joins: Vec::new(),
        };
        for type_name in referenced.iter().filter(|name| **name != self.root_type) {
            let path = registry
                .connection_path(&self.root_type, type_name)
                .ok_or_else(|| QueryError::NoConnectionBetweenTypes {
                    from: self.root_type.clone(),
                    to: type_name.clone(),
                })?;
            for relation in path {
                let this_table = registry.type_metadata(&relation.this_type)?.table();
                let other_table = registry.type_metadata(&relation.other_type)?.table();
                statement.add_table(other_table.to_string());
                statement.add_join(join_condition(registry, relation, this_table, other_table)?);
            }
        }
        Ok(statement)
    }

    fn tokenize(&self) -> QueryResult<Vec<Token<'_>>> {
        let mut tokens = Vec::new();
        let mut position = 0;
        for found in TOKEN_RE.find_iter(&self.condition) {
            if found.start() != position {
                break;
            }
            position = found.end();
            let text = found.as_str();
            let first = text.chars().next().unwrap_or(' ');
            let token = if first.is_whitespace() {
                Token::Space
            } else if first.is_ascii_alphabetic() || first == '_' {
                match text.split_once('.') {
                    Some((type_name, attribute)) => Token::Field {
                        type_name,
                        attribute,
                    },
                    None => Token::Word(text),
                }
            } else {
                Token::Other(text)
            };
            tokens.push(token);
        }
        if position != self.condition.len() {
            let rest = &self.condition[position..];
            let message = if rest.starts_with('\'') {
                "unterminated string literal".to_string()
            } else {
                format!("unexpected input at `{rest}`")
            };
            return Err(self.malformed(&message));
        }
        Ok(tokens)
    }

    fn malformed(&self, message: &str) -> QueryError {
        QueryError::Malformed {
            query: self.condition.clone(),
            message: message.to_string(),
        }
    }
}

fn next_significant<'t, 'a>(tokens: &'t [Token<'a>], index: usize) -> Option<&'t Token<'a>> {
    tokens[index + 1..]
        .iter()
        .find(|token| **token != Token::Space)
}

#[cfg(test)]
mod tests {
    use super::StringQuery;
    use crate::query::QueryError;

    #[test]
    fn stray_characters_are_malformed() {
        let query = StringQuery::new("Author", "Author.name = 'x' ; DROP");
        assert!(matches!(query.tokenize(), Err(QueryError::Malformed { .. })));
    }

    #[test]
    fn unterminated_literal_is_malformed() {
        let query = StringQuery::new("Author", "Author.name = 'x");
        let err = query.tokenize().unwrap_err();
        assert!(err.to_string().contains("unterminated string literal"));
    }

    #[test]
    fn doubled_quotes_stay_inside_literal() {
        let query = StringQuery::new("Author", "Author.name = 'O''Brien'");
        assert_eq!(query.tokenize().unwrap().len(), 5);
    }
}
