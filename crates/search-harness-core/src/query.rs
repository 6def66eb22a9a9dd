//! Abstract search query model.
//!
//! A [`Query`] combines a fulltext keyword tree ([`Keys`]), a filter tree
//! ([`ConditionGroup`]), sorts, a result range, and facet requests. Backends
//! translate it into their own storage operations; [`Query::validate`] runs
//! the checks every backend shares before translation.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SearchError};
use crate::models::{FieldValue, IndexDef, ItemId};

/// Pseudo field sorting by relevance score.
pub const RELEVANCE_FIELD: &str = "search_api_relevance";
/// Pseudo field sorting by item id.
pub const ID_FIELD: &str = "search_api_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Conjunction {
    #[default]
    And,
    Or,
}

/// Fulltext keyword tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Keys {
    Keyword(String),
    Group {
        conjunction: Conjunction,
        negation: bool,
        children: Vec<Keys>,
    },
}

impl Keys {
    pub fn keyword(word: impl Into<String>) -> Self {
        Keys::Keyword(word.into())
    }

    pub fn and(children: Vec<Keys>) -> Self {
        Keys::Group {
            conjunction: Conjunction::And,
            negation: false,
            children,
        }
    }

    pub fn or(children: Vec<Keys>) -> Self {
        Keys::Group {
            conjunction: Conjunction::Or,
            negation: false,
            children,
        }
    }

    /// Negate this node. A bare keyword is wrapped in a negated AND group.
    pub fn negate(self) -> Self {
        match self {
            Keys::Keyword(_) => Keys::Group {
                conjunction: Conjunction::And,
                negation: true,
                children: vec![self],
            },
            Keys::Group {
                conjunction,
                negation,
                children,
            } => Keys::Group {
                conjunction,
                negation: !negation,
                children,
            },
        }
    }

    /// Parse simple search syntax.
    ///
    /// Whitespace separates keywords (AND), `"quoted phrases"` stay together,
    /// a leading `-` negates a keyword, and a bare `OR` splits the input into
    /// alternatives. Returns `None` for blank input.
    pub fn parse(input: &str) -> Option<Keys> {
        let mut alternatives: Vec<Vec<Keys>> = vec![Vec::new()];
        for (token, quoted) in split_terms(input) {
            if !quoted && token == "OR" {
                alternatives.push(Vec::new());
                continue;
            }
            let (negated, word) = match token.strip_prefix('-') {
                Some(rest) if !quoted && !rest.is_empty() => (true, rest.to_string()),
                _ => (false, token),
            };
            let key = Keys::Keyword(word);
            if let Some(current) = alternatives.last_mut() {
                current.push(if negated { key.negate() } else { key });
            }
        }
        let mut groups: Vec<Keys> = alternatives
            .into_iter()
            .filter(|a| !a.is_empty())
            .map(|mut a| if a.len() == 1 { a.remove(0) } else { Keys::and(a) })
            .collect();
        match groups.len() {
            0 => None,
            1 => groups.pop(),
            _ => Some(Keys::or(groups)),
        }
    }
}

fn split_terms(input: &str) -> Vec<(String, bool)> {
    let mut terms = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in input.chars() {
        match c {
            '"' => {
                if in_quotes || !current.is_empty() {
                    if !current.trim().is_empty() {
                        terms.push((current.trim().to_string(), in_quotes));
                    }
                    current.clear();
                }
                in_quotes = !in_quotes;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    terms.push((std::mem::take(&mut current), false));
                }
            }
            c => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        terms.push((current.trim().to_string(), in_quotes));
    }
    terms
}

/// Condition operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Between,
    NotBetween,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::NotEq => "<>",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::Between => "BETWEEN",
            Operator::NotBetween => "NOT BETWEEN",
        }
    }

    /// Operators meaning "no stored value satisfies the positive form".
    pub fn is_negative(self) -> bool {
        matches!(self, Operator::NotEq | Operator::NotIn | Operator::NotBetween)
    }

    /// The positive counterpart of a negative operator.
    pub fn positive(self) -> Operator {
        match self {
            Operator::NotEq => Operator::Eq,
            Operator::NotIn => Operator::In,
            Operator::NotBetween => Operator::Between,
            other => other,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = SearchError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
        Ok(match normalized.as_str() {
            "=" | "==" => Operator::Eq,
            "<>" | "!=" => Operator::NotEq,
            "<" => Operator::Lt,
            "<=" => Operator::Le,
            ">" => Operator::Gt,
            ">=" => Operator::Ge,
            "IN" => Operator::In,
            "NOT IN" => Operator::NotIn,
            "BETWEEN" => Operator::Between,
            "NOT BETWEEN" => Operator::NotBetween,
            _ => return Err(SearchError::InvalidQuery(format!("unknown operator '{}'", s))),
        })
    }
}

/// Right-hand side of a condition.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionValue {
    /// With `=` tests absence of any value, with `<>` presence.
    Null,
    Single(FieldValue),
    List(Vec<FieldValue>),
    Range(FieldValue, FieldValue),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub value: ConditionValue,
    pub operator: Operator,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConditionNode {
    Condition(Condition),
    Group(ConditionGroup),
}

/// A conjunction of conditions and nested groups, optionally tagged.
///
/// Tags of the form `facet:<field>` mark the filter a facet contributed so
/// that OR facets can ignore their own selection when counting.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConditionGroup {
    pub conjunction: Conjunction,
    pub tags: BTreeSet<String>,
    pub children: Vec<ConditionNode>,
}

impl ConditionGroup {
    pub fn new(conjunction: Conjunction) -> Self {
        Self {
            conjunction,
            tags: BTreeSet::new(),
            children: Vec::new(),
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn condition(mut self, field: impl Into<String>, value: ConditionValue, operator: Operator) -> Self {
        self.add_condition(field, value, operator);
        self
    }

    pub fn group(mut self, group: ConditionGroup) -> Self {
        self.children.push(ConditionNode::Group(group));
        self
    }

    pub fn add_condition(&mut self, field: impl Into<String>, value: ConditionValue, operator: Operator) {
        self.children.push(ConditionNode::Condition(Condition {
            field: field.into(),
            value,
            operator,
        }));
    }

    pub fn add_group(&mut self, group: ConditionGroup) {
        self.children.push(ConditionNode::Group(group));
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Copy of this tree with every nested group carrying `tag` removed.
    pub fn without_tag(&self, tag: &str) -> ConditionGroup {
        ConditionGroup {
            conjunction: self.conjunction,
            tags: self.tags.clone(),
            children: self
                .children
                .iter()
                .filter_map(|child| match child {
                    ConditionNode::Group(g) if g.tags.contains(tag) => None,
                    ConditionNode::Group(g) => Some(ConditionNode::Group(g.without_tag(tag))),
                    ConditionNode::Condition(c) => Some(ConditionNode::Condition(c.clone())),
                })
                .collect(),
        }
    }

    fn conditions(&self) -> Vec<&Condition> {
        let mut out = Vec::new();
        for child in &self.children {
            match child {
                ConditionNode::Condition(c) => out.push(c),
                ConditionNode::Group(g) => out.extend(g.conditions()),
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FacetOperator {
    #[default]
    And,
    Or,
}

/// One requested facet.
#[derive(Debug, Clone, PartialEq)]
pub struct FacetRequest {
    pub field: String,
    /// Maximum buckets returned; `0` means no cap.
    pub limit: usize,
    pub min_count: usize,
    /// Add a `!` bucket counting items without a value.
    pub missing: bool,
    pub operator: FacetOperator,
}

impl FacetRequest {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            limit: 0,
            min_count: 1,
            missing: false,
            operator: FacetOperator::And,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn min_count(mut self, min_count: usize) -> Self {
        self.min_count = min_count;
        self
    }

    pub fn missing(mut self, missing: bool) -> Self {
        self.missing = missing;
        self
    }

    pub fn operator(mut self, operator: FacetOperator) -> Self {
        self.operator = operator;
        self
    }

    /// Tag identifying filters contributed by this facet.
    pub fn tag(&self) -> String {
        facet_tag(&self.field)
    }

    /// Filters the facet counts are computed against.
    pub fn effective_conditions(&self, conditions: &ConditionGroup) -> ConditionGroup {
        match self.operator {
            FacetOperator::Or => conditions.without_tag(&self.tag()),
            FacetOperator::And => conditions.clone(),
        }
    }
}

/// The `facet:<field>` tag used on facet filter groups.
pub fn facet_tag(field: &str) -> String {
    format!("facet:{}", field)
}

/// A search request against one index.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub keys: Option<Keys>,
    /// Restrict fulltext matching to these fields (default: all text fields).
    pub fulltext_fields: Option<Vec<String>>,
    pub conditions: ConditionGroup,
    pub sorts: Vec<(String, SortDirection)>,
    pub offset: usize,
    /// `None` returns every result; `Some(0)` returns only the count.
    pub limit: Option<usize>,
    pub facets: Vec<FacetRequest>,
    /// Overrides the server's partial-match setting.
    pub partial_matches: Option<bool>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(mut self, keys: Keys) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn fulltext_fields(mut self, fields: Vec<String>) -> Self {
        self.fulltext_fields = Some(fields);
        self
    }

    pub fn condition(mut self, field: impl Into<String>, value: ConditionValue, operator: Operator) -> Self {
        self.conditions.add_condition(field, value, operator);
        self
    }

    pub fn condition_group(mut self, group: ConditionGroup) -> Self {
        self.conditions.add_group(group);
        self
    }

    pub fn sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sorts.push((field.into(), direction));
        self
    }

    pub fn range(mut self, offset: usize, limit: Option<usize>) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }

    pub fn facet(mut self, facet: FacetRequest) -> Self {
        self.facets.push(facet);
        self
    }

    pub fn partial_matches(mut self, enabled: bool) -> Self {
        self.partial_matches = Some(enabled);
        self
    }

    /// Names of the fulltext fields searched by this query.
    pub fn searched_fields(&self, index: &IndexDef) -> Vec<String> {
        match &self.fulltext_fields {
            Some(fields) => fields.clone(),
            None => index.fulltext_fields().map(|f| f.name.clone()).collect(),
        }
    }

    /// Reject references to unknown fields and malformed conditions.
    pub fn validate(&self, index: &IndexDef) -> Result<()> {
        if let Some(fields) = &self.fulltext_fields {
            for name in fields {
                let field = index.require_field(name)?;
                if !field.field_type.is_fulltext() {
                    return Err(SearchError::InvalidQuery(format!(
                        "field '{}' is not a fulltext field",
                        name
                    )));
                }
            }
        }

        for condition in self.conditions.conditions() {
            index.require_field(&condition.field)?;
            let shape_ok = match (&condition.value, condition.operator) {
                (ConditionValue::Null, Operator::Eq | Operator::NotEq) => true,
                (ConditionValue::Null, _) => false,
                (ConditionValue::List(values), Operator::In | Operator::NotIn) => !values.is_empty(),
                (ConditionValue::Range(..), Operator::Between | Operator::NotBetween) => true,
                (
                    ConditionValue::Single(_),
                    Operator::Eq | Operator::NotEq | Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge,
                ) => true,
                _ => false,
            };
            if !shape_ok {
                return Err(SearchError::InvalidQuery(format!(
                    "operator {} cannot be used with value {:?} on field '{}'",
                    condition.operator, condition.value, condition.field
                )));
            }
        }

        for (name, _) in &self.sorts {
            if name == RELEVANCE_FIELD || name == ID_FIELD {
                continue;
            }
            if index.require_field(name)?.field_type.is_fulltext() {
                return Err(SearchError::InvalidQuery(format!(
                    "cannot sort on fulltext field '{}'",
                    name
                )));
            }
        }

        for facet in &self.facets {
            if index.require_field(&facet.field)?.field_type.is_fulltext() {
                return Err(SearchError::InvalidQuery(format!(
                    "cannot facet on fulltext field '{}'",
                    facet.field
                )));
            }
        }
        Ok(())
    }
}

/// One result row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultItem {
    pub id: ItemId,
    pub score: f64,
}

/// One facet bucket: quoted value (or `!` for missing) and item count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacetBucket {
    pub filter: String,
    pub count: usize,
}

impl FacetBucket {
    /// Embedded `"` and `\` are backslash-escaped so the filter parses back.
    pub fn value(value: &FieldValue, count: usize) -> Self {
        let raw = value.filter_string();
        let mut filter = String::with_capacity(raw.len() + 2);
        filter.push('"');
        for c in raw.chars() {
            if c == '"' || c == '\\' {
                filter.push('\\');
            }
            filter.push(c);
        }
        filter.push('"');
        Self { filter, count }
    }

    pub fn missing(count: usize) -> Self {
        Self {
            filter: "!".to_string(),
            count,
        }
    }
}

/// Apply `min_count`, the deterministic order (count desc, filter asc), the
/// bucket limit, and the trailing missing bucket.
pub fn finalize_facet(
    request: &FacetRequest,
    mut buckets: Vec<FacetBucket>,
    missing_count: usize,
) -> Vec<FacetBucket> {
    buckets.retain(|b| b.count >= request.min_count && b.count > 0);
    buckets.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.filter.cmp(&b.filter)));
    if request.limit > 0 {
        buckets.truncate(request.limit);
    }
    if request.missing && missing_count > 0 && missing_count >= request.min_count {
        buckets.push(FacetBucket::missing(missing_count));
    }
    buckets
}

/// Outcome of a search.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultSet {
    pub result_count: usize,
    pub items: Vec<ResultItem>,
    pub ignored_keys: Vec<String>,
    pub warnings: Vec<String>,
    pub facets: BTreeMap<String, Vec<FacetBucket>>,
}

impl ResultSet {
    pub fn ids(&self) -> Vec<String> {
        self.items.iter().map(|i| i.id.to_string()).collect()
    }
}

/// Warning attached when every keyword was dropped.
pub const NO_VALID_KEYS_WARNING: &str = "No valid search keys were present in the query.";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Field, FieldType};

    fn index() -> IndexDef {
        IndexDef::new(
            "content",
            "default",
            "articles",
            vec![
                Field::new("body", FieldType::Text),
                Field::new("category", FieldType::String),
                Field::new("tags", FieldType::String).multi(),
            ],
        )
    }

    #[test]
    fn facet_filters_escape_quotes_and_backslashes() {
        assert_eq!(FacetBucket::value(&FieldValue::Text("item".into()), 1).filter, "\"item\"");
        assert_eq!(
            FacetBucket::value(&FieldValue::Text(r#"12" pipe \ 3"#.into()), 1).filter,
            r#""12\" pipe \\ 3""#
        );
        assert_eq!(FacetBucket::value(&FieldValue::Boolean(true), 1).filter, "\"1\"");
    }

    #[test]
    fn parse_plain_words_is_and() {
        assert_eq!(
            Keys::parse("foo bar"),
            Some(Keys::and(vec![Keys::keyword("foo"), Keys::keyword("bar")]))
        );
    }

    #[test]
    fn parse_or_and_negation() {
        let keys = Keys::parse("foo OR bar -baz").unwrap();
        assert_eq!(
            keys,
            Keys::or(vec![
                Keys::keyword("foo"),
                Keys::and(vec![Keys::keyword("bar"), Keys::keyword("baz").negate()]),
            ])
        );
    }

    #[test]
    fn parse_quoted_phrase() {
        assert_eq!(
            Keys::parse("\"hello world\""),
            Some(Keys::keyword("hello world"))
        );
        assert_eq!(Keys::parse("   "), None);
    }

    #[test]
    fn operator_from_str() {
        assert_eq!("not  in".parse::<Operator>().unwrap(), Operator::NotIn);
        assert_eq!("!=".parse::<Operator>().unwrap(), Operator::NotEq);
        assert!("LIKE".parse::<Operator>().is_err());
    }

    #[test]
    fn without_tag_drops_tagged_groups() {
        let conditions = ConditionGroup::new(Conjunction::And)
            .condition("tags", ConditionValue::Null, Operator::NotEq)
            .group(
                ConditionGroup::new(Conjunction::Or)
                    .tag(facet_tag("category"))
                    .condition("category", ConditionValue::Single(FieldValue::Text("a".into())), Operator::Eq),
            );
        let stripped = conditions.without_tag("facet:category");
        assert_eq!(stripped.children.len(), 1);
        assert_eq!(conditions.without_tag("facet:tags"), conditions);
    }

    #[test]
    fn validate_rejects_unknown_field() {
        let query = Query::new().condition("nope", ConditionValue::Null, Operator::Eq);
        assert!(matches!(query.validate(&index()), Err(SearchError::UnknownField { .. })));
    }

    #[test]
    fn validate_rejects_bad_value_shape() {
        let query = Query::new().condition(
            "category",
            ConditionValue::Single(FieldValue::Text("a".into())),
            Operator::In,
        );
        assert!(matches!(query.validate(&index()), Err(SearchError::InvalidQuery(_))));
        let query = Query::new().condition("category", ConditionValue::Null, Operator::Lt);
        assert!(query.validate(&index()).is_err());
    }

    #[test]
    fn validate_rejects_sort_and_facet_on_text() {
        assert!(Query::new().sort("body", SortDirection::Asc).validate(&index()).is_err());
        assert!(Query::new().facet(FacetRequest::new("body")).validate(&index()).is_err());
        assert!(Query::new()
            .sort(RELEVANCE_FIELD, SortDirection::Desc)
            .validate(&index())
            .is_ok());
    }

    #[test]
    fn finalize_orders_limits_and_appends_missing() {
        let request = FacetRequest::new("category").limit(2).missing(true);
        let buckets = vec![
            FacetBucket { filter: "\"b\"".into(), count: 2 },
            FacetBucket { filter: "\"a\"".into(), count: 2 },
            FacetBucket { filter: "\"c\"".into(), count: 5 },
        ];
        let out = finalize_facet(&request, buckets, 1);
        let filters: Vec<&str> = out.iter().map(|b| b.filter.as_str()).collect();
        assert_eq!(filters, vec!["\"c\"", "\"a\"", "!"]);
    }
}
