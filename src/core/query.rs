//! Collection and document queries.
//!
//! A [`Query`] is what the application listens to; it lowers to a
//! [`Target`], the form registered with the backend. Queries that differ only
//! in `limit_to_last` share ordering rules but not targets.

use std::cmp::Ordering;
use std::fmt::Write;

use serde::Deserialize;
use serde::Serialize;

use super::Target;
use crate::model::Document;
use crate::model::DocumentKey;
use crate::model::FieldPath;
use crate::model::ResourcePath;
use crate::model::Value;
use crate::ModelError;
use crate::Result;

/// Upper bound on the operand of `in`, `not-in` and `array-contains-any`.
const MAX_DISJUNCTION_SIZE: usize = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl Operator {
    pub fn is_inequality(self) -> bool {
        matches!(
            self,
            Operator::LessThan
                | Operator::LessThanOrEqual
                | Operator::GreaterThan
                | Operator::GreaterThanOrEqual
                | Operator::NotEqual
                | Operator::NotIn
        )
    }

    fn takes_array_operand(self) -> bool {
        matches!(self, Operator::In | Operator::NotIn | Operator::ArrayContainsAny)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::GreaterThan => ">",
            Operator::GreaterThanOrEqual => ">=",
            Operator::ArrayContains => "array-contains",
            Operator::ArrayContainsAny => "array-contains-any",
            Operator::In => "in",
            Operator::NotIn => "not-in",
        }
    }
}

/// `field op value` predicate over one document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: FieldPath,
    pub op: Operator,
    pub value: Value,
}

impl FieldFilter {
    pub fn new(
        field: FieldPath,
        op: Operator,
        value: Value,
    ) -> Result<Self> {
        if op.takes_array_operand() {
            match value.as_array() {
                Some(values) if !values.is_empty() && values.len() <= MAX_DISJUNCTION_SIZE => {}
                _ => {
                    return Err(ModelError::InvalidQuery(format!(
                        "'{}' needs a non-empty array of at most {} values",
                        op.symbol(),
                        MAX_DISJUNCTION_SIZE
                    ))
                    .into())
                }
            }
        }
        if field.is_key_field_path() {
            if matches!(op, Operator::ArrayContains | Operator::ArrayContainsAny) {
                return Err(ModelError::InvalidQuery(format!(
                    "'{}' is not supported on document keys",
                    op.symbol()
                ))
                .into());
            }
            let all_references = match value.as_array().filter(|_| op.takes_array_operand()) {
                Some(values) => values.iter().all(|v| matches!(v, Value::Reference(_))),
                None => matches!(value, Value::Reference(_)),
            };
            if !all_references {
                return Err(ModelError::InvalidQuery(
                    "document key filters need reference values".to_string(),
                )
                .into());
            }
        }
        if value.is_nan() && op != Operator::Equal && op != Operator::NotEqual {
            return Err(ModelError::InvalidQuery(format!("NaN is not a valid operand for '{}'", op.symbol())).into());
        }
        Ok(Self { field, op, value })
    }

    pub fn matches(
        &self,
        doc: &Document,
    ) -> bool {
        let key_value;
        let other = if self.field.is_key_field_path() {
            key_value = Value::Reference(doc.key().clone());
            &key_value
        } else {
            match doc.field(&self.field) {
                Some(v) => v,
                None => return false,
            }
        };

        match self.op {
            Operator::Equal => other == &self.value,
            Operator::NotEqual => !other.is_null() && other != &self.value,
            Operator::ArrayContains => other.array_contains(&self.value),
            Operator::ArrayContainsAny => match self.value.as_array() {
                Some(candidates) => candidates.iter().any(|c| other.array_contains(c)),
                None => false,
            },
            Operator::In => self.value.array_contains(other),
            Operator::NotIn => {
                !other.is_null() && !self.value.array_contains(&Value::Null) && !self.value.array_contains(other)
            }
            Operator::LessThan => self.compare(other, |o| o == Ordering::Less),
            Operator::LessThanOrEqual => self.compare(other, |o| o != Ordering::Greater),
            Operator::GreaterThan => self.compare(other, |o| o == Ordering::Greater),
            Operator::GreaterThanOrEqual => self.compare(other, |o| o != Ordering::Less),
        }
    }

    /// Range operators only match values of the operand's type.
    fn compare(
        &self,
        other: &Value,
        accept: impl Fn(Ordering) -> bool,
    ) -> bool {
        other.same_type_order(&self.value) && accept(other.cmp(&self.value))
    }

    fn canonical_id(&self) -> String {
        format!("{}{}{:?}", self.field.canonical_string(), self.op.symbol(), self.value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    fn flipped(self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: FieldPath,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(
        field: FieldPath,
        direction: Direction,
    ) -> Self {
        Self { field, direction }
    }

    fn compare(
        &self,
        left: &Document,
        right: &Document,
    ) -> Ordering {
        let ordering = if self.field.is_key_field_path() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => l.cmp(r),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }

    fn canonical_id(&self) -> String {
        let dir = match self.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        format!("{}{}", self.field.canonical_string(), dir)
    }
}

/// Total order over documents induced by a normalized order-by list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentComparator {
    order_by: Vec<OrderBy>,
}

impl DocumentComparator {
    pub fn new(order_by: Vec<OrderBy>) -> Self {
        Self { order_by }
    }

    /// Orders by key only.
    pub fn by_key() -> Self {
        Self::new(vec![OrderBy::new(FieldPath::key_path(), Direction::Ascending)])
    }

    pub fn compare(
        &self,
        left: &Document,
        right: &Document,
    ) -> Ordering {
        for order in &self.order_by {
            let ordering = order.compare(left, right);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        left.key().cmp(right.key())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitType {
    #[default]
    First,
    Last,
}

/// A query over one collection, or a single-document lookup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    path: ResourcePath,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
}

impl Query {
    /// Query over the documents directly under `path`.
    pub fn collection(path: ResourcePath) -> Result<Self> {
        if path.len() % 2 == 0 {
            return Err(ModelError::InvalidCollectionPath {
                path: path.canonical_string(),
            }
            .into());
        }
        Ok(Self::at_path(path))
    }

    /// Query matching at most the document `key`.
    pub fn document(key: &DocumentKey) -> Self {
        Self::at_path(key.path().clone())
    }

    fn at_path(path: ResourcePath) -> Self {
        Self {
            path,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
        }
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path) && self.filters.is_empty()
    }

    /// Adds a filter, checking it against the existing ones.
    pub fn filter(
        mut self,
        filter: FieldFilter,
    ) -> Result<Self> {
        if self.is_document_query() {
            return Err(ModelError::InvalidQuery("document queries cannot be filtered".to_string()).into());
        }
        if filter.op.is_inequality() {
            if let Some(existing) = self.inequality_field() {
                if existing != &filter.field {
                    return Err(ModelError::InvalidQuery(format!(
                        "inequality filters on both '{}' and '{}'",
                        existing, filter.field
                    ))
                    .into());
                }
            }
            if let Some(first) = self.explicit_order_by.first() {
                if first.field != filter.field {
                    return Err(ModelError::InvalidQuery(format!(
                        "the first order-by '{}' must match the inequality field '{}'",
                        first.field, filter.field
                    ))
                    .into());
                }
            }
        }
        let conflicting = |ops: &[Operator]| self.filters.iter().any(|f| ops.contains(&f.op));
        let conflict = match filter.op {
            Operator::ArrayContains | Operator::ArrayContainsAny => {
                conflicting(&[Operator::ArrayContains, Operator::ArrayContainsAny])
            }
            Operator::In => conflicting(&[Operator::In, Operator::NotIn]),
            Operator::NotIn => conflicting(&[Operator::In, Operator::NotIn, Operator::NotEqual]),
            Operator::NotEqual => conflicting(&[Operator::NotIn]),
            _ => false,
        };
        if conflict {
            return Err(
                ModelError::InvalidQuery(format!("'{}' cannot be combined with the existing filters", filter.op.symbol()))
                    .into(),
            );
        }
        self.filters.push(filter);
        Ok(self)
    }

    /// Shorthand for [`Query::filter`] with a dotted field path.
    pub fn where_field(
        self,
        field: &str,
        op: Operator,
        value: impl Into<Value>,
    ) -> Result<Self> {
        let filter = FieldFilter::new(FieldPath::from_dot_separated(field)?, op, value.into())?;
        self.filter(filter)
    }

    pub fn order_by(
        mut self,
        field: FieldPath,
        direction: Direction,
    ) -> Result<Self> {
        if self.explicit_order_by.is_empty() {
            if let Some(inequality) = self.inequality_field() {
                if inequality != &field {
                    return Err(ModelError::InvalidQuery(format!(
                        "the first order-by '{}' must match the inequality field '{}'",
                        field, inequality
                    ))
                    .into());
                }
            }
        }
        self.explicit_order_by.push(OrderBy::new(field, direction));
        Ok(self)
    }

    pub fn limit_to_first(
        mut self,
        limit: u32,
    ) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    /// Keeps the last `limit` documents of the ordered result.
    pub fn limit_to_last(
        mut self,
        limit: u32,
    ) -> Result<Self> {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        if self.explicit_order_by.is_empty() {
            return Err(ModelError::InvalidQuery("limit_to_last needs an explicit order-by".to_string()).into());
        }
        Ok(self)
    }

    pub fn inequality_field(&self) -> Option<&FieldPath> {
        self.filters.iter().find(|f| f.op.is_inequality()).map(|f| &f.field)
    }

    /// Explicit ordering plus the implicit inequality and key orderings.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut order_by = self.explicit_order_by.clone();
        if order_by.is_empty() {
            if let Some(field) = self.inequality_field() {
                if !field.is_key_field_path() {
                    order_by.push(OrderBy::new(field.clone(), Direction::Ascending));
                }
            }
        }
        if !order_by.iter().any(|o| o.field.is_key_field_path()) {
            let direction = order_by.last().map(|o| o.direction).unwrap_or(Direction::Ascending);
            order_by.push(OrderBy::new(FieldPath::key_path(), direction));
        }
        order_by
    }

    pub fn comparator(&self) -> DocumentComparator {
        DocumentComparator::new(self.normalized_order_by())
    }

    pub fn matches(
        &self,
        doc: &Document,
    ) -> bool {
        document_matches(&self.path, &self.filters, &self.normalized_order_by(), doc)
    }

    /// The backend form of this query. `limit_to_last` queries run with the
    /// ordering reversed.
    pub fn to_target(&self) -> Target {
        let mut order_by = self.normalized_order_by();
        if self.limit_type == LimitType::Last {
            for order in &mut order_by {
                order.direction = order.direction.flipped();
            }
        }
        Target::new(self.path.clone(), self.filters.clone(), order_by, self.limit)
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{}", self.to_target().canonical_id(), limit_type)
    }
}

pub(crate) fn document_matches(
    path: &ResourcePath,
    filters: &[FieldFilter],
    order_by: &[OrderBy],
    doc: &Document,
) -> bool {
    if !doc.is_found_document() {
        return false;
    }
    let path_matches = if DocumentKey::is_document_key(path) {
        doc.key().path() == path
    } else {
        path.is_immediate_parent_of(doc.key().path())
    };
    path_matches
        && filters.iter().all(|f| f.matches(doc))
        && order_by
            .iter()
            .all(|o| o.field.is_key_field_path() || doc.field(&o.field).is_some())
}

pub(crate) fn canonical_target_id(
    path: &ResourcePath,
    filters: &[FieldFilter],
    order_by: &[OrderBy],
    limit: Option<u32>,
) -> String {
    let mut id = path.canonical_string();
    if !filters.is_empty() {
        id.push_str("|f:");
        for filter in filters {
            id.push_str(&filter.canonical_id());
        }
    }
    id.push_str("|ob:");
    for order in order_by {
        id.push_str(&order.canonical_id());
    }
    if let Some(limit) = limit {
        let _ = write!(id, "|l:{limit}");
    }
    id
}
