//! Translation of [`Query`] parts into SQLite fragments.
//!
//! The primary table is always aliased `t`. Filters are boolean expressions
//! over `t`, with every multi-valued and fulltext test expressed as an
//! `t.item_id [NOT] IN (SELECT item_id FROM <aux> ...)` sub-query so that
//! each condition is evaluated against the full value set of an item.
//!
//! Placeholders are positional; a [`Fragment`] carries its arguments in the
//! order its `?`s appear.
//!
//! [`Query`]: search_harness_core::query::Query

use sqlx::query::Query as SqlxQuery;
use sqlx::sqlite::{Sqlite, SqliteArguments};

use search_harness_core::error::{Result, SearchError};
use search_harness_core::models::{Field, FieldValue, IndexDef};
use search_harness_core::query::{
    Condition, ConditionGroup, ConditionNode, ConditionValue, Conjunction, Keys, Operator,
    SortDirection, ID_FIELD, RELEVANCE_FIELD,
};
use search_harness_core::schema::{FieldTable, IndexSchema};
use search_harness_core::text::normalize;

/// A bindable SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<&FieldValue> for SqlValue {
    fn from(value: &FieldValue) -> Self {
        match value {
            FieldValue::Text(s) => SqlValue::Text(s.clone()),
            FieldValue::Integer(i) | FieldValue::Date(i) => SqlValue::Integer(*i),
            FieldValue::Decimal(f) => SqlValue::Real(*f),
            FieldValue::Boolean(b) => SqlValue::Integer(i64::from(*b)),
        }
    }
}

/// Bind `args` to `query` in order.
pub fn bind_values<'q>(
    mut query: SqlxQuery<'q, Sqlite, SqliteArguments<'q>>,
    args: &[SqlValue],
) -> SqlxQuery<'q, Sqlite, SqliteArguments<'q>> {
    for arg in args {
        query = match arg {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Integer(i) => query.bind(*i),
            SqlValue::Real(f) => query.bind(*f),
            SqlValue::Text(s) => query.bind(s.clone()),
        };
    }
    query
}

/// SQL text plus its positional arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    pub sql: String,
    pub args: Vec<SqlValue>,
}

impl Fragment {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(sql: impl Into<String>, args: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }

    /// Join fragments with a separator, keeping argument order.
    pub fn join(parts: Vec<Fragment>, separator: &str) -> Fragment {
        let mut sql = Vec::with_capacity(parts.len());
        let mut args = Vec::new();
        for part in parts {
            sql.push(part.sql);
            args.extend(part.args);
        }
        Fragment {
            sql: sql.join(separator),
            args,
        }
    }

    /// AND of all parts, or an always-true expression when empty.
    pub fn all(parts: Vec<Fragment>) -> Fragment {
        if parts.is_empty() {
            return Fragment::new("1 = 1");
        }
        let mut joined = Fragment::join(parts, " AND ");
        joined.sql = format!("({})", joined.sql);
        joined
    }
}

/// Escape `%`, `_` and the escape character itself for a `LIKE ... ESCAPE '\'`.
fn like_pattern(word: &str) -> String {
    let mut escaped = String::with_capacity(word.len() + 2);
    escaped.push('%');
    for c in word.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

pub struct Translator<'a> {
    index: &'a IndexDef,
    schema: &'a IndexSchema,
    partial: bool,
}

impl<'a> Translator<'a> {
    pub fn new(index: &'a IndexDef, schema: &'a IndexSchema, partial: bool) -> Self {
        Self {
            index,
            schema,
            partial,
        }
    }

    pub fn primary_table(&self) -> &str {
        &self.schema.index_table
    }

    /// Storage of a field, failing when the schema map is out of step with
    /// the definition.
    pub fn field_table(&self, name: &str) -> Result<(&'a Field, &'a FieldTable)> {
        let field = self.index.require_field(name)?;
        let table = self.schema.field_tables.get(name).ok_or_else(|| {
            SearchError::Schema(format!(
                "field '{}' of index '{}' has no storage; update the index first",
                name, self.index.id
            ))
        })?;
        Ok((field, table))
    }

    fn word_match(&self) -> &'static str {
        if self.partial {
            "word LIKE ? ESCAPE '\\'"
        } else {
            "word = ?"
        }
    }

    fn word_arg(&self, word: &str) -> SqlValue {
        if self.partial {
            SqlValue::Text(like_pattern(word))
        } else {
            SqlValue::Text(word.to_string())
        }
    }

    fn token_tables(&self, fields: &[String]) -> Result<Vec<&'a str>> {
        fields
            .iter()
            .map(|name| self.field_table(name).map(|(_, t)| t.table.as_str()))
            .collect()
    }

    /// Boolean expression selecting items that match `keys`.
    pub fn keys_filter(&self, keys: &Keys, fields: &[String]) -> Result<Fragment> {
        match keys {
            Keys::Keyword(word) => {
                let tables = self.token_tables(fields)?;
                if tables.is_empty() {
                    return Ok(Fragment::new("0"));
                }
                let selects: Vec<Fragment> = tables
                    .iter()
                    .map(|table| {
                        Fragment::with_args(
                            format!("SELECT item_id FROM \"{}\" WHERE {}", table, self.word_match()),
                            vec![self.word_arg(word)],
                        )
                    })
                    .collect();
                let mut union = Fragment::join(selects, " UNION ");
                union.sql = format!("t.item_id IN ({})", union.sql);
                Ok(union)
            }
            Keys::Group {
                conjunction,
                negation,
                children,
            } => {
                let parts = children
                    .iter()
                    .map(|c| self.keys_filter(c, fields))
                    .collect::<Result<Vec<_>>>()?;
                let separator = match conjunction {
                    Conjunction::And => " AND ",
                    Conjunction::Or => " OR ",
                };
                let mut group = if parts.is_empty() {
                    Fragment::new("1 = 1")
                } else {
                    Fragment::join(parts, separator)
                };
                group.sql = if *negation {
                    format!("NOT ({})", group.sql)
                } else {
                    format!("({})", group.sql)
                };
                Ok(group)
            }
        }
    }

    /// Relevance expression: summed token scores of every non-negated
    /// keyword.
    pub fn keys_score(&self, keys: &Keys, fields: &[String]) -> Result<Fragment> {
        let mut terms = Vec::new();
        self.collect_score_terms(keys, fields, &mut terms)?;
        if terms.is_empty() {
            return Ok(Fragment::new("0"));
        }
        let mut sum = Fragment::join(terms, " + ");
        sum.sql = format!("({})", sum.sql);
        Ok(sum)
    }

    fn collect_score_terms(&self, keys: &Keys, fields: &[String], terms: &mut Vec<Fragment>) -> Result<()> {
        match keys {
            Keys::Keyword(word) => {
                for table in self.token_tables(fields)? {
                    terms.push(Fragment::with_args(
                        format!(
                            "COALESCE((SELECT SUM(score) FROM \"{}\" s WHERE s.item_id = t.item_id AND s.{}), 0)",
                            table,
                            self.word_match()
                        ),
                        vec![self.word_arg(word)],
                    ));
                }
            }
            Keys::Group {
                negation: false,
                children,
                ..
            } => {
                for child in children {
                    self.collect_score_terms(child, fields, terms)?;
                }
            }
            Keys::Group { negation: true, .. } => {}
        }
        Ok(())
    }

    /// Boolean expression for a condition tree, or `None` when the tree
    /// imposes no restriction.
    pub fn conditions_filter(&self, group: &ConditionGroup) -> Result<Option<Fragment>> {
        let mut parts = Vec::new();
        for child in &group.children {
            let part = match child {
                ConditionNode::Condition(c) => Some(self.condition(c)?),
                ConditionNode::Group(g) => self.conditions_filter(g)?,
            };
            match (part, group.conjunction) {
                (Some(p), _) => parts.push(p),
                // An unrestricted alternative makes the whole OR unrestricted.
                (None, Conjunction::Or) => return Ok(None),
                (None, Conjunction::And) => {}
            }
        }
        if parts.is_empty() {
            return Ok(None);
        }
        let separator = match group.conjunction {
            Conjunction::And => " AND ",
            Conjunction::Or => " OR ",
        };
        let mut joined = Fragment::join(parts, separator);
        joined.sql = format!("({})", joined.sql);
        Ok(Some(joined))
    }

    fn operand(field: &Field, value: &FieldValue) -> SqlValue {
        match value {
            FieldValue::Text(s) if field.field_type.is_fulltext() => SqlValue::Text(normalize(s)),
            other => SqlValue::from(other),
        }
    }

    /// `OP ?` / `IN (?, ...)` / `BETWEEN ? AND ?` applied to `column`.
    fn comparison(field: &Field, column: &str, operator: Operator, value: &ConditionValue) -> Fragment {
        match value {
            ConditionValue::Single(v) => Fragment::with_args(
                format!("{} {} ?", column, operator.as_str()),
                vec![Self::operand(field, v)],
            ),
            ConditionValue::List(values) => Fragment::with_args(
                format!("{} {} ({})", column, operator.as_str(), placeholders(values.len())),
                values.iter().map(|v| Self::operand(field, v)).collect(),
            ),
            ConditionValue::Range(low, high) => Fragment::with_args(
                format!("{} {} ? AND ?", column, operator.as_str()),
                vec![Self::operand(field, low), Self::operand(field, high)],
            ),
            ConditionValue::Null => Fragment::new("0"),
        }
    }

    fn condition(&self, condition: &Condition) -> Result<Fragment> {
        let (field, table) = self.field_table(&condition.field)?;
        let negative = condition.operator.is_negative();

        if !table.is_auxiliary() {
            let column = format!("t.\"{}\"", table.column);
            return Ok(match (&condition.value, condition.operator) {
                (ConditionValue::Null, Operator::Eq) => Fragment::new(format!("{} IS NULL", column)),
                (ConditionValue::Null, _) => Fragment::new(format!("{} IS NOT NULL", column)),
                (value, op) if negative => {
                    let mut inner = Self::comparison(field, &column, op, value);
                    inner.sql = format!("({} IS NULL OR {})", column, inner.sql);
                    inner
                }
                (value, op) => Self::comparison(field, &column, op, value),
            });
        }

        let (membership, mut inner) = match (&condition.value, condition.operator) {
            (ConditionValue::Null, Operator::Eq) => {
                ("NOT IN", Fragment::new(format!("SELECT item_id FROM \"{}\"", table.table)))
            }
            (ConditionValue::Null, _) => {
                ("IN", Fragment::new(format!("SELECT item_id FROM \"{}\"", table.table)))
            }
            (value, op) => {
                let test = Self::comparison(field, &table.column, op.positive(), value);
                (
                    if negative { "NOT IN" } else { "IN" },
                    Fragment::with_args(
                        format!("SELECT item_id FROM \"{}\" WHERE {}", table.table, test.sql),
                        test.args,
                    ),
                )
            }
        };
        inner.sql = format!("t.item_id {} ({})", membership, inner.sql);
        Ok(inner)
    }

    /// `ORDER BY` terms, always ending with the item id tie-break. `score`
    /// must be selected under that alias when sorting by relevance.
    pub fn order_by(&self, sorts: &[(String, SortDirection)]) -> Result<String> {
        let mut terms = Vec::new();
        for (name, direction) in sorts {
            let dir = match direction {
                SortDirection::Asc => "ASC",
                SortDirection::Desc => "DESC",
            };
            match name.as_str() {
                RELEVANCE_FIELD => terms.push(format!("score {}", dir)),
                ID_FIELD => terms.push(format!("t.item_id {}", dir)),
                _ => {
                    let (_, table) = self.field_table(name)?;
                    let expr = if table.is_auxiliary() {
                        let agg = match direction {
                            SortDirection::Asc => "MIN",
                            SortDirection::Desc => "MAX",
                        };
                        format!(
                            "(SELECT {}(a.\"{}\") FROM \"{}\" a WHERE a.item_id = t.item_id)",
                            agg, table.column, table.table
                        )
                    } else {
                        format!("t.\"{}\"", table.column)
                    };
                    // NULLs last ascending, first descending.
                    terms.push(format!("{} IS NULL {}", expr, dir));
                    terms.push(format!("{} {}", expr, dir));
                }
            }
        }
        terms.push("t.item_id ASC".to_string());
        Ok(terms.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use search_harness_core::models::FieldType;

    fn index() -> IndexDef {
        IndexDef::new(
            "content",
            "default",
            "articles",
            vec![
                Field::new("body", FieldType::Text),
                Field::new("title", FieldType::Text),
                Field::new("category", FieldType::String),
                Field::new("tags", FieldType::String).multi(),
            ],
        )
    }

    fn text(s: &str) -> ConditionValue {
        ConditionValue::Single(FieldValue::Text(s.into()))
    }

    #[test]
    fn keyword_unions_over_searched_fields() {
        let index = index();
        let schema = IndexSchema::plan(&index);
        let translator = Translator::new(&index, &schema, false);
        let fields = vec!["body".to_string(), "title".to_string()];
        let fragment = translator.keys_filter(&Keys::keyword("foo"), &fields).unwrap();
        assert_eq!(
            fragment.sql,
            "t.item_id IN (SELECT item_id FROM \"search_content_body\" WHERE word = ? \
             UNION SELECT item_id FROM \"search_content_title\" WHERE word = ?)"
        );
        assert_eq!(fragment.args.len(), 2);
    }

    #[test]
    fn partial_mode_escapes_like_pattern() {
        let index = index();
        let schema = IndexSchema::plan(&index);
        let translator = Translator::new(&index, &schema, true);
        let fragment = translator
            .keys_filter(&Keys::keyword("a_b"), &["body".to_string()])
            .unwrap();
        assert!(fragment.sql.contains("LIKE ? ESCAPE"));
        assert_eq!(fragment.args, vec![SqlValue::Text("%a\\_b%".into())]);
    }

    #[test]
    fn negated_keywords_do_not_score() {
        let index = index();
        let schema = IndexSchema::plan(&index);
        let translator = Translator::new(&index, &schema, false);
        let keys = Keys::and(vec![Keys::keyword("foo"), Keys::keyword("bar").negate()]);
        let fields = vec!["body".to_string()];
        let filter = translator.keys_filter(&keys, &fields).unwrap();
        assert!(filter.sql.contains("NOT ("));
        let score = translator.keys_score(&keys, &fields).unwrap();
        assert_eq!(score.args, vec![SqlValue::Text("foo".into())]);
    }

    #[test]
    fn multi_valued_negation_uses_not_in() {
        let index = index();
        let schema = IndexSchema::plan(&index);
        let translator = Translator::new(&index, &schema, false);
        let group = ConditionGroup::new(Conjunction::And).condition("tags", text("A"), Operator::NotEq);
        let fragment = translator.conditions_filter(&group).unwrap().unwrap();
        assert_eq!(
            fragment.sql,
            "(t.item_id NOT IN (SELECT item_id FROM \"search_content_tags\" WHERE value = ?))"
        );
    }

    #[test]
    fn single_valued_not_equal_includes_null() {
        let index = index();
        let schema = IndexSchema::plan(&index);
        let translator = Translator::new(&index, &schema, false);
        let group = ConditionGroup::new(Conjunction::And).condition("category", text("x"), Operator::NotEq);
        let fragment = translator.conditions_filter(&group).unwrap().unwrap();
        assert_eq!(
            fragment.sql,
            "((t.\"category\" IS NULL OR t.\"category\" <> ?))"
        );
    }

    #[test]
    fn empty_groups_impose_nothing() {
        let index = index();
        let schema = IndexSchema::plan(&index);
        let translator = Translator::new(&index, &schema, false);
        let group = ConditionGroup::new(Conjunction::Or)
            .condition("category", text("x"), Operator::Eq)
            .group(ConditionGroup::new(Conjunction::And));
        assert!(translator.conditions_filter(&group).unwrap().is_none());
        let group = ConditionGroup::new(Conjunction::And)
            .condition("category", text("x"), Operator::Eq)
            .group(ConditionGroup::new(Conjunction::Or));
        assert!(translator.conditions_filter(&group).unwrap().is_some());
    }

    #[test]
    fn order_by_places_nulls_and_ties() {
        let index = index();
        let schema = IndexSchema::plan(&index);
        let translator = Translator::new(&index, &schema, false);
        let order = translator
            .order_by(&[("tags".to_string(), SortDirection::Desc)])
            .unwrap();
        assert!(order.starts_with("(SELECT MAX(a.\"value\")"));
        assert!(order.contains("IS NULL DESC"));
        assert!(order.ends_with("t.item_id ASC"));
    }
}
