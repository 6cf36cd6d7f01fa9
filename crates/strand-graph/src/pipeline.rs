//! Post-processing for one resolved query section.
//!
//! Options run in [`Stage`] order regardless of where they appear in the
//! format, so derived values are visible to `where` and `sort`, and
//! aggregates see the filtered, sorted, limited set.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use tracing::debug;

use strand_core::schema::DataType;
use strand_core::Schema;

use crate::format::{
    resolve_property, Aggregate, Comparison, Condition, ConditionKind, DerivedGroup, DerivedItem,
    GeneratedSection, Operator, PropertyRef, QueryOption, SortDirection, Symbol, ValueSource,
    WhereClause,
};
use crate::hash;
use crate::response::ResponsePair;

/// What the pipeline decided about a section's final shape.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Outcome {
    /// Replace the array with its single item (or null).
    pub collapse: bool,
    /// Extra `(key, value)` pairs for the containing object.
    pub adjacent: Vec<(String, Value)>,
}

pub(crate) struct Pipeline<'a> {
    schema: &'a Schema,
    public_keys: &'a BTreeMap<String, String>,
}

impl<'a> Pipeline<'a> {
    pub fn new(schema: &'a Schema, public_keys: &'a BTreeMap<String, String>) -> Self {
        Self {
            schema,
            public_keys,
        }
    }

    /// Apply every option of `section` to `pair`.
    ///
    /// `presorted` means the items came from a sort index, so `$sort` is
    /// already satisfied.
    pub fn run(&self, section: &GeneratedSection, pair: &mut ResponsePair, presorted: bool) -> Outcome {
        let mut outcome = Outcome::default();
        let mut ordered: Vec<&QueryOption> = section.options.iter().collect();
        ordered.sort_by_key(|o| o.stage());

        for option in ordered {
            match option {
                QueryOption::Derived(derived) => {
                    let values = pair
                        .originals()
                        .iter()
                        .map(|item| evaluate_group(&derived.expression, item))
                        .collect();
                    pair.set_each(&derived.new_prop, values, !derived.is_response_hidden);
                }
                QueryOption::Where(WhereClause::Filter(condition)) => {
                    pair.retain(|item| self.matches(&section.node_name, condition, item));
                }
                QueryOption::Where(WhereClause::Find(condition)) => {
                    let index = pair
                        .originals()
                        .iter()
                        .position(|item| self.matches(&section.node_name, condition, item));
                    pair.keep_only(index);
                    outcome.collapse = true;
                }
                QueryOption::Sort(sort) => {
                    if presorted {
                        debug!(node = %section.node_name, "Order taken from sort index");
                        continue;
                    }
                    pair.sort_by(|a, b| {
                        let ord = sort_order(
                            &resolve_property(a, &sort.property),
                            &resolve_property(b, &sort.property),
                        );
                        match sort.direction {
                            SortDirection::Asc => ord,
                            SortDirection::Desc => ord.reverse(),
                        }
                    });
                }
                QueryOption::Limit { skip, count } => {
                    pair.slice(skip.unwrap_or(0), *count);
                }
                QueryOption::Aggregate(aggregate) => {
                    if apply_aggregate(aggregate, pair) {
                        outcome.collapse = true;
                    }
                }
                QueryOption::PropertyAsResponse(p) => {
                    let value = first_property(pair, &p.property);
                    pair.replace_with(value);
                    outcome.collapse = true;
                }
                QueryOption::PropertyAdjacentToResponse(p) => {
                    let value = first_property(pair, &p.property);
                    outcome.adjacent.push((p.adjacent_key.clone(), value));
                }
            }
        }
        outcome
    }

    // ── Where ────────────────────────────────────────────────────

    fn matches(&self, node: &str, condition: &Condition, item: &Value) -> bool {
        match condition.kind() {
            ConditionKind::Compare(op, comparison) => self.compare(node, op, comparison, item),
            ConditionKind::And(children) => children.iter().all(|c| self.matches(node, c, item)),
            ConditionKind::Or(children) => children.iter().any(|c| self.matches(node, c, item)),
        }
    }

    fn compare(&self, node: &str, op: Operator, comparison: &Comparison, item: &Value) -> bool {
        if matches!(op, Operator::Equals | Operator::DoesNotEqual) {
            if let Some(verified) = self.verify_hashed(node, comparison, item) {
                return if op == Operator::Equals { verified } else { !verified };
            }
        }
        let left = source_value(&comparison.left, item);
        let right = source_value(&comparison.right, item);
        compare_values(op, &left, &right)
    }

    /// `Some(verified)` when one side names a `hash` prop.
    fn verify_hashed(&self, node: &str, comparison: &Comparison, item: &Value) -> Option<bool> {
        let (hashed, plain) = match (&comparison.left, &comparison.right) {
            (ValueSource::Property(p), other) if self.is_hash(node, p) => (p, other),
            (other, ValueSource::Property(p)) if self.is_hash(node, p) => (p, other),
            _ => return None,
        };
        let signature = resolve_property(item, hashed);
        let plaintext = source_value(plain, item);
        let key = comparison
            .public_key
            .as_ref()
            .and_then(|name| self.public_keys.get(name));

        let verified = match (signature.as_str(), plaintext.as_str(), key) {
            (Some(signature), Some(plaintext), Some(key)) => hash::verify(key, signature, plaintext),
            _ => false,
        };
        Some(verified)
    }

    fn is_hash(&self, node: &str, property: &PropertyRef) -> bool {
        let mut node = node.to_string();
        for relationship in &property.relationships {
            match self.schema.relationship_prop(&node, relationship) {
                Some(binding) => node = binding.node_name,
                None => return false,
            }
        }
        self.schema
            .scalar_prop(&node, &property.prop)
            .is_some_and(|p| p.data_type == DataType::Hash)
    }
}

fn source_value(source: &ValueSource, item: &Value) -> Value {
    match source {
        ValueSource::Value(v) => v.clone(),
        ValueSource::Property(p) => resolve_property(item, p),
    }
}

pub(crate) fn compare_values(op: Operator, left: &Value, right: &Value) -> bool {
    use Operator as Op;
    match op {
        Op::Equals => values_equal(left, right),
        Op::DoesNotEqual => !values_equal(left, right),
        Op::GreaterThan => ordering(left, right) == Some(Ordering::Greater),
        Op::LessThan => ordering(left, right) == Some(Ordering::Less),
        Op::GreaterThanOrEqualTo => {
            matches!(ordering(left, right), Some(Ordering::Greater | Ordering::Equal))
        }
        Op::LessThanOrEqualTo => {
            matches!(ordering(left, right), Some(Ordering::Less | Ordering::Equal))
        }
        Op::StartsWith => texts(left, right).is_some_and(|(l, r)| l.starts_with(r)),
        Op::EndsWith => texts(left, right).is_some_and(|(l, r)| l.ends_with(r)),
        Op::Contains => texts(left, right).is_some_and(|(l, r)| l.contains(r)),
        Op::DoesNotContain => texts(left, right).is_some_and(|(l, r)| !l.contains(r)),
        Op::IsoIsBefore => matches!((iso(left), iso(right)), (Some(l), Some(r)) if l < r),
        Op::IsoIsAfter => matches!((iso(left), iso(right)), (Some(l), Some(r)) if l > r),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

/// Numeric when both are numbers, lexicographic when both are strings.
fn ordering(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

fn texts<'v>(left: &'v Value, right: &'v Value) -> Option<(&'v str, &'v str)> {
    Some((left.as_str()?, right.as_str()?))
}

fn iso(value: &Value) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(value.as_str()?).ok()
}

/// Total order for sorting: nulls first, then numbers or strings, then
/// anything else by its JSON text.
pub(crate) fn sort_order(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => ordering(a, b).unwrap_or_else(|| a.to_string().cmp(&b.to_string())),
    }
}

// ── Derived values ───────────────────────────────────────────────

/// Fold `group.items` left to right with `group.symbol`.
///
/// Nulls are skipped. Text only supports `add` (concatenation); any other
/// symbol leaves the running text unchanged.
pub(crate) fn evaluate_group(group: &DerivedGroup, item: &Value) -> Value {
    let mut running: Option<Value> = None;
    for operand in &group.items {
        let value = match operand {
            DerivedItem::Value(v) => v.clone(),
            DerivedItem::Property(p) => resolve_property(item, p),
            DerivedItem::Group(g) => evaluate_group(g, item),
        };
        if value.is_null() {
            continue;
        }
        running = Some(match running {
            None => value,
            Some(acc) => apply_symbol(group.symbol, acc, &value),
        });
    }
    running.unwrap_or(Value::Null)
}

fn apply_symbol(symbol: Symbol, acc: Value, operand: &Value) -> Value {
    if acc.is_string() || operand.is_string() {
        return match symbol {
            Symbol::Add => Value::String(format!("{}{}", text(&acc), text(operand))),
            _ => acc,
        };
    }
    let (Some(a), Some(b)) = (acc.as_f64(), operand.as_f64()) else {
        return acc;
    };
    match symbol {
        Symbol::Add => number(a + b),
        Symbol::Subtract => number(a - b),
        Symbol::Multiply => number(a * b),
        Symbol::Divide if b == 0.0 => Value::Null,
        Symbol::Divide => number(a / b),
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// JSON number, integral when the value is an exact integer.
pub(crate) fn number(n: f64) -> Value {
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;
    if n.is_finite() && n.fract() == 0.0 && n.abs() <= MAX_EXACT {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

// ── Aggregates ───────────────────────────────────────────────────

/// Returns whether the aggregate collapsed the section.
fn apply_aggregate(aggregate: &Aggregate, pair: &mut ResponsePair) -> bool {
    match aggregate {
        Aggregate::SumAsProperty(a) => {
            let value = sum(&amounts(pair, &a.compute_prop));
            pair.set_on_all(&a.new_prop, value, !a.is_response_hidden);
            false
        }
        Aggregate::AverageAsProperty(a) => {
            let value = average(&amounts(pair, &a.compute_prop));
            pair.set_on_all(&a.new_prop, value, !a.is_response_hidden);
            false
        }
        Aggregate::MinAmountAsProperty(a) => {
            let value = extreme(&amounts(pair, &a.compute_prop), Ordering::Less);
            pair.set_on_all(&a.new_prop, value, !a.is_response_hidden);
            false
        }
        Aggregate::MaxAmountAsProperty(a) => {
            let value = extreme(&amounts(pair, &a.compute_prop), Ordering::Greater);
            pair.set_on_all(&a.new_prop, value, !a.is_response_hidden);
            false
        }
        Aggregate::CountAsProperty(c) => {
            let value = Value::from(pair.len());
            pair.set_on_all(&c.new_prop, value, !c.is_response_hidden);
            false
        }
        Aggregate::SumAsResponse(p) => {
            let value = sum(&amounts(pair, p));
            pair.replace_with(value);
            true
        }
        Aggregate::AverageAsResponse(p) => {
            let value = average(&amounts(pair, p));
            pair.replace_with(value);
            true
        }
        Aggregate::MinAmountAsResponse(p) => {
            let value = extreme(&amounts(pair, p), Ordering::Less);
            pair.replace_with(value);
            true
        }
        Aggregate::MaxAmountAsResponse(p) => {
            let value = extreme(&amounts(pair, p), Ordering::Greater);
            pair.replace_with(value);
            true
        }
        Aggregate::MinNodeAsResponse(p) => {
            let index = extreme_index(pair, p, Ordering::Less);
            pair.keep_only(index);
            true
        }
        Aggregate::MaxNodeAsResponse(p) => {
            let index = extreme_index(pair, p, Ordering::Greater);
            pair.keep_only(index);
            true
        }
        Aggregate::CountAsResponse => {
            let value = Value::from(pair.len());
            pair.replace_with(value);
            true
        }
    }
}

fn amounts(pair: &ResponsePair, property: &PropertyRef) -> Vec<f64> {
    pair.originals()
        .iter()
        .filter_map(|item| resolve_property(item, property).as_f64())
        .collect()
}

fn sum(values: &[f64]) -> Value {
    number(values.iter().sum())
}

fn average(values: &[f64]) -> Value {
    if values.is_empty() {
        return Value::Null;
    }
    number(values.iter().sum::<f64>() / values.len() as f64)
}

fn extreme(values: &[f64], want: Ordering) -> Value {
    values
        .iter()
        .copied()
        .reduce(|best, v| if v.partial_cmp(&best) == Some(want) { v } else { best })
        .map(number)
        .unwrap_or(Value::Null)
}

/// Index of the first item holding the min or max of `property`.
fn extreme_index(pair: &ResponsePair, property: &PropertyRef, want: Ordering) -> Option<usize> {
    let mut best: Option<(usize, Value)> = None;
    for (i, item) in pair.originals().iter().enumerate() {
        let value = resolve_property(item, property);
        if value.is_null() {
            continue;
        }
        let replace = match &best {
            None => true,
            Some((_, current)) => sort_order(&value, current) == want,
        };
        if replace {
            best = Some((i, value));
        }
    }
    best.map(|(i, _)| i)
}

fn first_property(pair: &ResponsePair, property: &PropertyRef) -> Value {
    pair.originals()
        .first()
        .map(|item| resolve_property(item, property))
        .unwrap_or(Value::Null)
}
