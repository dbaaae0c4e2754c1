//! Attribute conditions and boolean connectives.

use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOperator {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    Like,
    NotLike,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

impl ComparisonOperator {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "<>",
            Self::Less => "<",
            Self::LessOrEqual => "<=",
            Self::Greater => ">",
            Self::GreaterOrEqual => ">=",
            Self::Like => "LIKE",
            Self::NotLike => "NOT LIKE",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
            Self::IsNull => "IS NULL",
            Self::IsNotNull => "IS NOT NULL",
        }
    }

    /// Case-insensitive; `!=` is accepted for `<>`.
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.split_whitespace().collect::<Vec<_>>().join(" ");
        match normalized.to_ascii_uppercase().as_str() {
            "=" => Some(Self::Equal),
            "<>" | "!=" => Some(Self::NotEqual),
            "<" => Some(Self::Less),
            "<=" => Some(Self::LessOrEqual),
            ">" => Some(Self::Greater),
            ">=" => Some(Self::GreaterOrEqual),
            "LIKE" => Some(Self::Like),
            "NOT LIKE" => Some(Self::NotLike),
            "IN" => Some(Self::In),
            "NOT IN" => Some(Self::NotIn),
            "IS NULL" => Some(Self::IsNull),
            "IS NOT NULL" => Some(Self::IsNotNull),
            _ => None,
        }
    }

    fn takes_value(self) -> bool {
        !matches!(self, Self::IsNull | Self::IsNotNull)
    }

    fn takes_list(self) -> bool {
        matches!(self, Self::In | Self::NotIn)
    }
}

impl Display for ComparisonOperator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Connective used as a template's pre-operator or inter-operator.
///
/// As an inter-operator `Not` behaves like `And`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BoolOperator {
    #[default]
    And,
    Or,
    Not,
}

impl BoolOperator {
    /// Text placed between two bracketed conditions.
    pub(crate) fn joiner(self) -> &'static str {
        match self {
            Self::And => " AND ",
            Self::Or => " OR ",
            Self::Not => " AND NOT ",
        }
    }

    /// Text placed before the first bracketed condition.
    pub(crate) fn leader(self) -> &'static str {
        match self {
            Self::Not => "NOT ",
            Self::And | Self::Or => "",
        }
    }

    pub(crate) fn inter(self) -> Self {
        match self {
            Self::Or => Self::Or,
            Self::And | Self::Not => Self::And,
        }
    }

    /// Neutral element under this connective.
    pub(crate) fn neutral(self) -> &'static str {
        match self.inter() {
            Self::Or => "FALSE",
            _ => "TRUE",
        }
    }
}

/// Condition on one attribute of a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Criterion {
    /// `None` applies the default policy.
    pub operator: Option<ComparisonOperator>,
    /// For `IN`/`NOT IN` a comma separated list.
    pub value: String,
}

impl Criterion {
    pub fn new(operator: ComparisonOperator, value: impl Into<String>) -> Self {
        Self {
            operator: Some(operator),
            value: value.into(),
        }
    }

    /// Bare value: `LIKE '%value%'`, or `= 'value'` on key attributes.
    pub fn value(value: impl Into<String>) -> Self {
        Self {
            operator: None,
            value: value.into(),
        }
    }

    pub fn is_null() -> Self {
        Self::new(ComparisonOperator::IsNull, "")
    }

    /// SQL for this criterion applied to `column`.
    pub fn to_sql(&self, column: &str, is_key: bool) -> String {
        let operator = match self.operator {
            Some(operator) => operator,
            None if is_key => return format!("{column} = {}", quote_literal(&self.value)),
            None => {
                return format!(
                    "{column} LIKE {}",
                    quote_literal(&format!("%{}%", self.value))
                )
            }
        };
        if !operator.takes_value() {
            return format!("{column} {operator}");
        }
        if operator.takes_list() {
            let items = self
                .value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(quote_literal)
                .collect::<Vec<_>>();
            return format!("{column} {operator} ({})", items.join(", "));
        }
        format!("{column} {operator} {}", quote_literal(&self.value))
    }
}

/// Single-quoted SQL literal with embedded quotes doubled.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
