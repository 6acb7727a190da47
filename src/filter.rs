//! Resource filter evaluation.
//!
//! A resource is retained when it satisfies every `include` rule and none
//! of the `exclude` rules. Rules are validated and compiled once, before
//! orchestration starts, so per-resource evaluation cannot fail.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::EngineError;
use crate::types::{MetadataValue, Resource};

/// Whether a rule keeps or drops matching resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    Include,
    Exclude,
}

/// Comparison applied between a resource field and the rule operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Regex,
    In,
    NotIn,
    GreaterThan,
    LessThan,
    Exists,
    NotExists,
}

impl FilterOperator {
    fn is_multi_value(&self) -> bool {
        matches!(self, FilterOperator::In | FilterOperator::NotIn)
    }

    fn takes_no_value(&self) -> bool {
        matches!(self, FilterOperator::Exists | FilterOperator::NotExists)
    }
}

/// A stateless evaluation rule.
///
/// `values` is only populated for `in`/`not_in`; `value` is required for
/// every other operator except `exists`/`not_exists`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceFilter {
    #[serde(rename = "type")]
    pub filter_type: FilterType,
    pub field: String,
    pub operator: FilterOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<MetadataValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<MetadataValue>>,
}

impl ResourceFilter {
    pub fn new(filter_type: FilterType, field: impl Into<String>, operator: FilterOperator) -> Self {
        Self {
            filter_type,
            field: field.into(),
            operator,
            value: None,
            values: None,
        }
    }

    pub fn include(field: impl Into<String>, operator: FilterOperator) -> Self {
        Self::new(FilterType::Include, field, operator)
    }

    pub fn exclude(field: impl Into<String>, operator: FilterOperator) -> Self {
        Self::new(FilterType::Exclude, field, operator)
    }

    pub fn value(mut self, value: impl Into<MetadataValue>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn values<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<MetadataValue>,
    {
        self.values = Some(values.into_iter().map(Into::into).collect());
        self
    }
}

/// Resource attribute addressed by a filter's `field`
#[derive(Debug, Clone, PartialEq)]
enum FieldPath {
    Id,
    Name,
    Type,
    Provider,
    Region,
    Zone,
    Status,
    CreatedAt,
    UpdatedAt,
    Dependencies,
    Tag(String),
    Metadata(String),
}

impl FieldPath {
    fn parse(field: &str) -> Result<Self, String> {
        if let Some(key) = field.strip_prefix("tags.") {
            return non_empty_key(key).map(FieldPath::Tag);
        }
        if let Some(key) = field.strip_prefix("metadata.") {
            return non_empty_key(key).map(FieldPath::Metadata);
        }

        match field {
            "id" => Ok(FieldPath::Id),
            "name" => Ok(FieldPath::Name),
            "type" | "resourceType" | "resource_type" => Ok(FieldPath::Type),
            "provider" => Ok(FieldPath::Provider),
            "region" => Ok(FieldPath::Region),
            "zone" => Ok(FieldPath::Zone),
            "status" => Ok(FieldPath::Status),
            "createdAt" | "created_at" => Ok(FieldPath::CreatedAt),
            "updatedAt" | "updated_at" => Ok(FieldPath::UpdatedAt),
            "dependencies" => Ok(FieldPath::Dependencies),
            "" => Err("field must not be empty".to_string()),
            other => Err(format!("unknown field '{}'", other)),
        }
    }

    fn resolve<'a>(&self, resource: &'a Resource) -> Option<FieldValue<'a>> {
        match self {
            FieldPath::Id => Some(FieldValue::Text(&resource.id)),
            FieldPath::Name => Some(FieldValue::Text(&resource.name)),
            FieldPath::Type => Some(FieldValue::Text(&resource.resource_type)),
            FieldPath::Provider => Some(FieldValue::Text(resource.provider.as_str())),
            FieldPath::Region => Some(FieldValue::Text(&resource.region)),
            FieldPath::Zone => resource.zone.as_deref().map(FieldValue::Text),
            FieldPath::Status => resource.status.as_deref().map(FieldValue::Text),
            FieldPath::CreatedAt => resource.created_at.map(FieldValue::Time),
            FieldPath::UpdatedAt => resource.updated_at.map(FieldValue::Time),
            FieldPath::Dependencies if resource.dependencies.is_empty() => None,
            FieldPath::Dependencies => Some(FieldValue::List(&resource.dependencies)),
            FieldPath::Tag(key) => resource.tags.get(key).map(|v| FieldValue::Text(v)),
            FieldPath::Metadata(key) => resource.metadata.get(key).map(|v| match v {
                MetadataValue::String(s) => FieldValue::Text(s),
                MetadataValue::Number(n) => FieldValue::Number(*n),
                MetadataValue::Bool(b) => FieldValue::Bool(*b),
                MetadataValue::List(items) => FieldValue::List(items),
            }),
        }
    }
}

fn non_empty_key(key: &str) -> Result<String, String> {
    if key.is_empty() {
        Err("nested key must not be empty".to_string())
    } else {
        Ok(key.to_string())
    }
}

/// Borrowed view of a resource field
#[derive(Debug, Clone, Copy)]
enum FieldValue<'a> {
    Text(&'a str),
    Number(f64),
    Bool(bool),
    List(&'a [String]),
    Time(DateTime<Utc>),
}

impl FieldValue<'_> {
    fn equals(&self, operand: &MetadataValue) -> bool {
        match (self, operand) {
            (FieldValue::Text(a), MetadataValue::String(b)) => *a == b,
            (FieldValue::Number(a), MetadataValue::Number(b)) => a == b,
            (FieldValue::Bool(a), MetadataValue::Bool(b)) => a == b,
            (FieldValue::List(a), MetadataValue::List(b)) => *a == b.as_slice(),
            (FieldValue::Time(a), MetadataValue::String(b)) => parse_time(b) == Some(*a),
            _ => false,
        }
    }

    fn compare(&self, bound: &Bound) -> Option<Ordering> {
        match (self, bound) {
            (FieldValue::Number(a), Bound::Number(b)) => a.partial_cmp(b),
            (FieldValue::Time(a), Bound::Time(b)) => Some(a.cmp(b)),
            (FieldValue::Text(a), Bound::Time(b)) => parse_time(a).map(|t| t.cmp(b)),
            _ => None,
        }
    }

    fn text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(*s),
            _ => None,
        }
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Operand of an ordering comparison
#[derive(Debug, Clone, PartialEq)]
enum Bound {
    Number(f64),
    Time(DateTime<Utc>),
}

#[derive(Debug, Clone)]
enum Predicate {
    Equals(MetadataValue),
    NotEquals(MetadataValue),
    Contains(String),
    NotContains(String),
    StartsWith(String),
    EndsWith(String),
    Regex(Regex),
    In(Vec<MetadataValue>),
    NotIn(Vec<MetadataValue>),
    GreaterThan(Bound),
    LessThan(Bound),
    Exists,
    NotExists,
}

impl Predicate {
    fn compile(filter: &ResourceFilter) -> Result<Self, String> {
        let op = filter.operator;

        if op.is_multi_value() {
            if filter.value.is_some() {
                return Err(format!("{:?} takes `values`, not `value`", op));
            }
            let values = match &filter.values {
                Some(values) if !values.is_empty() => values.clone(),
                _ => return Err(format!("{:?} requires a non-empty `values` list", op)),
            };
            return Ok(match op {
                FilterOperator::In => Predicate::In(values),
                _ => Predicate::NotIn(values),
            });
        }

        if filter.values.is_some() {
            return Err(format!("{:?} does not accept `values`", op));
        }

        if op.takes_no_value() {
            if filter.value.is_some() {
                return Err(format!("{:?} does not accept a `value`", op));
            }
            return Ok(match op {
                FilterOperator::Exists => Predicate::Exists,
                _ => Predicate::NotExists,
            });
        }

        let value = filter
            .value
            .clone()
            .ok_or_else(|| format!("{:?} requires a `value`", op))?;

        let text = |value: MetadataValue| match value {
            MetadataValue::String(s) => Ok(s),
            other => Err(format!("{:?} requires a string value, got {:?}", op, other)),
        };

        Ok(match op {
            FilterOperator::Equals => Predicate::Equals(value),
            FilterOperator::NotEquals => Predicate::NotEquals(value),
            FilterOperator::Contains => Predicate::Contains(text(value)?),
            FilterOperator::NotContains => Predicate::NotContains(text(value)?),
            FilterOperator::StartsWith => Predicate::StartsWith(text(value)?),
            FilterOperator::EndsWith => Predicate::EndsWith(text(value)?),
            FilterOperator::Regex => {
                let pattern = text(value)?;
                Predicate::Regex(Regex::new(&pattern).map_err(|e| format!("regex: {}", e))?)
            }
            FilterOperator::GreaterThan => Predicate::GreaterThan(bound(op, value)?),
            FilterOperator::LessThan => Predicate::LessThan(bound(op, value)?),
            FilterOperator::In
            | FilterOperator::NotIn
            | FilterOperator::Exists
            | FilterOperator::NotExists => return Err(format!("{:?} takes no scalar `value`", op)),
        })
    }

    fn evaluate(&self, field: Option<FieldValue<'_>>) -> bool {
        match self {
            Predicate::Exists => field.is_some(),
            Predicate::NotExists => field.is_none(),
            Predicate::NotEquals(v) => field.map_or(true, |f| !f.equals(v)),
            Predicate::NotIn(values) => field.map_or(true, |f| !values.iter().any(|v| f.equals(v))),
            _ => match field {
                Some(f) => self.evaluate_present(f),
                None => false,
            },
        }
    }

    fn evaluate_present(&self, field: FieldValue<'_>) -> bool {
        match self {
            Predicate::Equals(v) => field.equals(v),
            Predicate::In(values) => values.iter().any(|v| field.equals(v)),
            Predicate::Contains(s) => field.text().is_some_and(|t| t.contains(s.as_str())),
            Predicate::NotContains(s) => field.text().is_some_and(|t| !t.contains(s.as_str())),
            Predicate::StartsWith(s) => field.text().is_some_and(|t| t.starts_with(s.as_str())),
            Predicate::EndsWith(s) => field.text().is_some_and(|t| t.ends_with(s.as_str())),
            Predicate::Regex(re) => field.text().is_some_and(|t| re.is_match(t)),
            Predicate::GreaterThan(b) => field.compare(b) == Some(Ordering::Greater),
            Predicate::LessThan(b) => field.compare(b) == Some(Ordering::Less),
            Predicate::NotEquals(_)
            | Predicate::NotIn(_)
            | Predicate::Exists
            | Predicate::NotExists => self.evaluate(Some(field)),
        }
    }
}

fn bound(op: FilterOperator, value: MetadataValue) -> Result<Bound, String> {
    match value {
        MetadataValue::Number(n) => Ok(Bound::Number(n)),
        MetadataValue::String(s) => parse_time(&s)
            .map(Bound::Time)
            .ok_or_else(|| format!("{:?} requires a number or RFC 3339 timestamp, got '{}'", op, s)),
        other => Err(format!("{:?} requires a number or timestamp, got {:?}", op, other)),
    }
}

#[derive(Debug, Clone)]
struct CompiledFilter {
    path: FieldPath,
    predicate: Predicate,
}

impl CompiledFilter {
    fn is_satisfied_by(&self, resource: &Resource) -> bool {
        self.predicate.evaluate(self.path.resolve(resource))
    }
}

/// A validated, ready-to-evaluate set of filter rules
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    includes: Vec<CompiledFilter>,
    excludes: Vec<CompiledFilter>,
}

impl FilterSet {
    /// Validate and compile rules; the first malformed rule is reported by index
    pub fn compile(filters: &[ResourceFilter]) -> Result<Self, EngineError> {
        let mut set = FilterSet::default();

        for (index, filter) in filters.iter().enumerate() {
            let invalid = |reason: String| EngineError::InvalidFilter { index, reason };

            let compiled = CompiledFilter {
                path: FieldPath::parse(&filter.field).map_err(invalid)?,
                predicate: Predicate::compile(filter).map_err(invalid)?,
            };

            match filter.filter_type {
                FilterType::Include => set.includes.push(compiled),
                FilterType::Exclude => set.excludes.push(compiled),
            }
        }

        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty() && self.excludes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.includes.len() + self.excludes.len()
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        self.includes.iter().all(|f| f.is_satisfied_by(resource))
            && !self.excludes.iter().any(|f| f.is_satisfied_by(resource))
    }
}

/// Decide whether `resource` is retained by `filters`
pub fn matches(resource: &Resource, filters: &[ResourceFilter]) -> Result<bool, EngineError> {
    Ok(FilterSet::compile(filters)?.matches(resource))
}
