//! Paired response arrays for one query section.
//!
//! `current` is what the caller sees (aliases applied, hidden values left
//! out); `original` uses schema names and feeds every comparison. Items are
//! only ever added, removed, or reordered through the paired methods here,
//! so index `i` in one array always describes the same node as index `i` in
//! the other.

use std::cmp::Ordering;

use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponsePair {
    current: Vec<Value>,
    original: Vec<Value>,
}

impl ResponsePair {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, current: Value, original: Value) {
        self.current.push(current);
        self.original.push(original);
    }

    pub fn len(&self) -> usize {
        self.original.len()
    }

    pub fn is_empty(&self) -> bool {
        self.original.is_empty()
    }

    /// Schema-named items, read-only.
    pub fn originals(&self) -> &[Value] {
        &self.original
    }

    /// Caller-visible items, read-only.
    pub fn currents(&self) -> &[Value] {
        &self.current
    }

    /// Keep items whose original satisfies `keep`, from both arrays.
    pub fn retain(&mut self, mut keep: impl FnMut(&Value) -> bool) {
        let decisions: Vec<bool> = self.original.iter().map(&mut keep).collect();
        let mut i = 0;
        self.original.retain(|_| {
            i += 1;
            decisions[i - 1]
        });
        let mut j = 0;
        self.current.retain(|_| {
            j += 1;
            decisions[j - 1]
        });
    }

    /// Keep only the item at `index`; an out-of-range index empties both.
    pub fn keep_only(&mut self, index: Option<usize>) {
        match index {
            Some(i) if i < self.len() => {
                self.original.swap(0, i);
                self.current.swap(0, i);
                self.original.truncate(1);
                self.current.truncate(1);
            }
            _ => {
                self.original.clear();
                self.current.clear();
            }
        }
    }

    /// Stable sort of both arrays by comparing originals.
    pub fn sort_by(&mut self, mut compare: impl FnMut(&Value, &Value) -> Ordering) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by(|&a, &b| compare(&self.original[a], &self.original[b]));
        self.original = permute(std::mem::take(&mut self.original), &order);
        self.current = permute(std::mem::take(&mut self.current), &order);
    }

    /// Skip `skip` items, then keep at most `count`.
    pub fn slice(&mut self, skip: usize, count: Option<usize>) {
        let start = skip.min(self.len());
        let end = match count {
            Some(c) => start.saturating_add(c).min(self.len()),
            None => self.len(),
        };
        self.original = self.original.drain(start..end).collect();
        self.current = self.current.drain(start..end).collect();
    }

    /// Write one value per item; `current` only receives it when `visible`.
    pub fn set_each(&mut self, prop: &str, values: Vec<Value>, visible: bool) {
        for (i, value) in values.into_iter().enumerate() {
            if visible {
                if let Some(obj) = self.current.get_mut(i).and_then(Value::as_object_mut) {
                    obj.insert(prop.to_string(), value.clone());
                }
            }
            if let Some(obj) = self.original.get_mut(i).and_then(Value::as_object_mut) {
                obj.insert(prop.to_string(), value);
            }
        }
    }

    /// Write the same value onto every item.
    pub fn set_on_all(&mut self, prop: &str, value: Value, visible: bool) {
        let values = vec![value; self.len()];
        self.set_each(prop, values, visible);
    }

    /// Replace the whole section with a single scalar.
    pub fn replace_with(&mut self, value: Value) {
        self.current = vec![value.clone()];
        self.original = vec![value];
    }

    /// First item of each array, `Null` when empty.
    pub fn into_single(mut self) -> (Value, Value) {
        if self.is_empty() {
            return (Value::Null, Value::Null);
        }
        (self.current.swap_remove(0), self.original.swap_remove(0))
    }

    pub fn into_arrays(self) -> (Value, Value) {
        (Value::Array(self.current), Value::Array(self.original))
    }
}

fn permute(mut items: Vec<Value>, order: &[usize]) -> Vec<Value> {
    order.iter().map(|&i| std::mem::take(&mut items[i])).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pair(ages: &[i64]) -> ResponsePair {
        let mut p = ResponsePair::new();
        for age in ages {
            p.push(json!({ "years": age }), json!({ "age": age }));
        }
        p
    }

    fn current_ages(p: &ResponsePair) -> Vec<i64> {
        p.currents().iter().map(|v| v["years"].as_i64().unwrap()).collect()
    }

    #[test]
    fn retain_moves_both_arrays() {
        let mut p = pair(&[25, 30, 35]);
        p.retain(|o| o["age"].as_i64() != Some(30));
        assert_eq!(p.len(), 2);
        assert_eq!(p.currents().len(), 2);
        assert_eq!(current_ages(&p), vec![25, 35]);
    }

    #[test]
    fn sort_reorders_current_by_original() {
        let mut p = pair(&[35, 25, 30]);
        p.sort_by(|a, b| a["age"].as_i64().cmp(&b["age"].as_i64()));
        assert_eq!(current_ages(&p), vec![25, 30, 35]);
        assert_eq!(p.originals()[0]["age"], 25);
    }

    #[test]
    fn slice_handles_out_of_range() {
        let mut p = pair(&[1, 2, 3, 4]);
        p.slice(1, Some(2));
        assert_eq!(current_ages(&p), vec![2, 3]);

        let mut p = pair(&[1, 2]);
        p.slice(5, None);
        assert!(p.is_empty());
        assert!(p.currents().is_empty());
    }

    #[test]
    fn keep_only_and_single() {
        let mut p = pair(&[1, 2, 3]);
        p.keep_only(Some(2));
        let (current, original) = p.into_single();
        assert_eq!(current, json!({ "years": 3 }));
        assert_eq!(original, json!({ "age": 3 }));

        let mut p = pair(&[1]);
        p.keep_only(None);
        assert_eq!(p.into_single(), (Value::Null, Value::Null));
    }

    #[test]
    fn hidden_values_only_reach_original() {
        let mut p = pair(&[1, 2]);
        p.set_on_all("total", json!(3), false);
        assert!(p.currents()[0].get("total").is_none());
        assert_eq!(p.originals()[1]["total"], 3);
    }
}
