//! Insertion-ordered dict and set storage keyed by hashable values

use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Result, SafepyError};
use crate::value::{Temporal, Value};

/// Hashable projection of a value. Values that compare equal in Python map
/// to the same key (`1`, `1.0` and `True` all become `Int(1)`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    None,
    Int(i64),
    Float(u64),
    Str(Rc<str>),
    /// Tuple items flattened in pre-order; a nested tuple is announced by
    /// `Nested(len)` followed by its own items
    Tuple(Vec<HashKey>),
    Nested(usize),
    Range(i64, i64, i64),
    Temporal(Temporal),
    Named(&'static str),
    Identity(usize),
}

impl HashKey {
    pub fn of(value: &Value) -> Result<HashKey> {
        let key = match value {
            Value::None => HashKey::None,
            Value::Bool(b) => HashKey::Int(*b as i64),
            Value::Int(i) => HashKey::Int(*i),
            Value::Float(f) => {
                if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 {
                    HashKey::Int(*f as i64)
                } else {
                    HashKey::Float(f.to_bits())
                }
            }
            Value::Str(s) => HashKey::Str(s.clone()),
            Value::Tuple(items) => flatten_tuple(items)?,
            Value::Range(r) => HashKey::Range(r.start, r.stop, r.step),
            Value::Temporal(t) => HashKey::Temporal(*t),
            Value::Builtin(b) => HashKey::Named(b.name),
            Value::List(_) | Value::Dict(_) | Value::Set(_) => {
                return Err(SafepyError::type_error(format!(
                    "unhashable type: '{}'",
                    value.type_name()
                )))
            }
            other => match other.identity() {
                Some(id) => HashKey::Identity(id),
                None => {
                    return Err(SafepyError::type_error(format!(
                        "unhashable type: '{}'",
                        other.type_name()
                    )))
                }
            },
        };
        Ok(key)
    }
}

fn flatten_tuple(items: &[Value]) -> Result<HashKey> {
    let mut tokens = Vec::with_capacity(items.len());
    let mut stack = vec![items.iter()];
    while let Some(iter) = stack.last_mut() {
        match iter.next() {
            Some(Value::Tuple(inner)) => {
                tokens.push(HashKey::Nested(inner.len()));
                stack.push(inner.iter());
            }
            Some(item) => tokens.push(HashKey::of(item)?),
            None => {
                stack.pop();
            }
        }
    }
    Ok(HashKey::Tuple(tokens))
}

/// Ordered hash table shared by [`Dict`] and [`Set`]. Removal leaves a
/// tombstone so iteration order stays stable; tombstones are compacted once
/// they outnumber live entries.
#[derive(Clone)]
struct Table<V> {
    entries: Vec<Option<(Value, V)>>,
    index: HashMap<HashKey, usize>,
}

impl<V> Default for Table<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<V: Clone> Table<V> {
    fn len(&self) -> usize {
        self.index.len()
    }

    fn get(&self, key: &HashKey) -> Option<&(Value, V)> {
        let slot = *self.index.get(key)?;
        self.entries[slot].as_ref()
    }

    fn get_mut(&mut self, key: &HashKey) -> Option<&mut V> {
        let slot = *self.index.get(key)?;
        self.entries[slot].as_mut().map(|(_, v)| v)
    }

    /// Insert or update; an existing entry keeps its original key object
    fn insert(&mut self, hash: HashKey, key: Value, value: V) -> Option<V> {
        if let Some(slot) = self.index.get(&hash) {
            if let Some((_, existing)) = self.entries[*slot].as_mut() {
                return Some(std::mem::replace(existing, value));
            }
        }
        self.index.insert(hash, self.entries.len());
        self.entries.push(Some((key, value)));
        None
    }

    fn remove(&mut self, hash: &HashKey) -> Option<(Value, V)> {
        let slot = self.index.remove(hash)?;
        let removed = self.entries[slot].take();
        if self.entries.len() > 16 && self.entries.len() > 2 * self.index.len() {
            self.compact();
        }
        removed
    }

    fn compact(&mut self) {
        let entries: Vec<(Value, V)> = self.entries.drain(..).flatten().collect();
        self.index.clear();
        for (key, value) in entries {
            if let Ok(hash) = HashKey::of(&key) {
                self.index.insert(hash, self.entries.len());
                self.entries.push(Some((key, value)));
            }
        }
    }

    fn iter(&self) -> impl Iterator<Item = &(Value, V)> {
        self.entries.iter().flatten()
    }

    fn pop_last(&mut self) -> Option<(Value, V)> {
        while let Some(entry) = self.entries.pop() {
            if let Some((key, value)) = entry {
                if let Ok(hash) = HashKey::of(&key) {
                    self.index.remove(&hash);
                }
                return Some((key, value));
            }
        }
        None
    }

    fn pop_first(&mut self) -> Option<(Value, V)> {
        let slot = self.entries.iter().position(Option::is_some)?;
        let (key, value) = self.entries[slot].take()?;
        if let Ok(hash) = HashKey::of(&key) {
            self.index.remove(&hash);
        }
        Some((key, value))
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

// ============================================================================
// Dict
// ============================================================================

/// Behaviour variants layered on a dict
#[derive(Clone, Default)]
pub enum DictFlavor {
    #[default]
    Plain,
    /// `collections.Counter`: missing keys read as 0
    Counter,
    /// `collections.defaultdict` holding its default factory
    DefaultDict(Value),
}

#[derive(Clone, Default)]
pub struct Dict {
    table: Table<Value>,
    pub flavor: DictFlavor,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flavor(flavor: DictFlavor) -> Self {
        Self {
            table: Table::default(),
            flavor,
        }
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (Value, Value)>) -> Result<Self> {
        let mut dict = Dict::new();
        for (key, value) in pairs {
            dict.insert(key, value)?;
        }
        Ok(dict)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.len() == 0
    }

    pub fn get(&self, key: &Value) -> Result<Option<Value>> {
        let hash = HashKey::of(key)?;
        Ok(self.table.get(&hash).map(|(_, v)| v.clone()))
    }

    pub fn get_str(&self, key: &str) -> Option<Value> {
        self.table
            .get(&HashKey::Str(Rc::from(key)))
            .map(|(_, v)| v.clone())
    }

    pub fn get_mut(&mut self, key: &Value) -> Result<Option<&mut Value>> {
        let hash = HashKey::of(key)?;
        Ok(self.table.get_mut(&hash))
    }

    pub fn contains(&self, key: &Value) -> Result<bool> {
        let hash = HashKey::of(key)?;
        Ok(self.table.get(&hash).is_some())
    }

    pub fn insert(&mut self, key: Value, value: Value) -> Result<Option<Value>> {
        let hash = HashKey::of(&key)?;
        Ok(self.table.insert(hash, key, value))
    }

    pub fn remove(&mut self, key: &Value) -> Result<Option<Value>> {
        let hash = HashKey::of(key)?;
        Ok(self.table.remove(&hash).map(|(_, v)| v))
    }

    pub fn pop_last(&mut self) -> Option<(Value, Value)> {
        self.table.pop_last()
    }

    pub fn clear(&mut self) {
        self.table.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.table.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> Vec<Value> {
        self.table.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.table.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn items(&self) -> Vec<(Value, Value)> {
        self.table.iter().cloned().collect()
    }

    /// Same entries, plain flavour
    pub fn to_plain(&self) -> Dict {
        Dict {
            table: self.table.clone(),
            flavor: DictFlavor::Plain,
        }
    }

    /// Empty the dict, returning every key, value and default factory
    pub(crate) fn take_values(&mut self) -> Vec<Value> {
        self.table.index.clear();
        let mut values = Vec::with_capacity(self.table.entries.len() * 2);
        for (key, value) in self.table.entries.drain(..).flatten() {
            values.push(key);
            values.push(value);
        }
        if let DictFlavor::DefaultDict(factory) = std::mem::take(&mut self.flavor) {
            values.push(factory);
        }
        values
    }
}

impl Drop for Dict {
    fn drop(&mut self) {
        crate::value::release(self.take_values());
    }
}

// ============================================================================
// Set
// ============================================================================

#[derive(Clone, Default)]
pub struct Set {
    table: Table<()>,
}

impl Set {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Result<Self> {
        let mut set = Set::new();
        for value in values {
            set.insert(value)?;
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.len() == 0
    }

    /// Returns true when the value was not already present
    pub fn insert(&mut self, value: Value) -> Result<bool> {
        let hash = HashKey::of(&value)?;
        Ok(self.table.insert(hash, value, ()).is_none())
    }

    pub fn contains(&self, value: &Value) -> Result<bool> {
        let hash = HashKey::of(value)?;
        Ok(self.table.get(&hash).is_some())
    }

    /// Returns true when the value was present
    pub fn remove(&mut self, value: &Value) -> Result<bool> {
        let hash = HashKey::of(value)?;
        Ok(self.table.remove(&hash).is_some())
    }

    pub fn pop_first(&mut self) -> Option<Value> {
        self.table.pop_first().map(|(v, _)| v)
    }

    pub fn clear(&mut self) {
        self.table.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.table.iter().map(|(v, _)| v)
    }

    pub fn items(&self) -> Vec<Value> {
        self.iter().cloned().collect()
    }

    pub fn is_subset(&self, other: &Set) -> bool {
        self.iter().all(|v| other.contains(v).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_keys_collapse() {
        let mut dict = Dict::new();
        dict.insert(Value::Int(1), Value::str("int")).unwrap();
        dict.insert(Value::Float(1.0), Value::str("float")).unwrap();
        dict.insert(Value::Bool(true), Value::str("bool")).unwrap();
        assert_eq!(dict.len(), 1);
        assert_eq!(dict.get(&Value::Int(1)).unwrap().unwrap().to_string(), "bool");
        // first key object is kept
        assert!(matches!(dict.keys()[0], Value::Int(1)));
    }

    #[test]
    fn test_insertion_order_survives_removal() {
        let mut dict = Dict::new();
        for i in 0..40 {
            dict.insert(Value::Int(i), Value::Int(i * i)).unwrap();
        }
        for i in 0..30 {
            dict.remove(&Value::Int(i)).unwrap();
        }
        dict.insert(Value::Int(0), Value::Int(0)).unwrap();
        let keys: Vec<i64> = dict.keys().iter().map(|k| k.as_int().unwrap()).collect();
        assert_eq!(keys, vec![30, 31, 32, 33, 34, 35, 36, 37, 38, 39, 0]);
        assert_eq!(dict.get(&Value::Int(35)).unwrap().unwrap().as_int().unwrap(), 1225);
    }

    #[test]
    fn test_unhashable_key() {
        let mut dict = Dict::new();
        let err = dict
            .insert(Value::list(vec![]), Value::None)
            .unwrap_err();
        assert!(err.message().contains("unhashable type: 'list'"));
    }

    #[test]
    fn test_nested_tuple_keys_keep_shape() {
        let left = Value::tuple(vec![
            Value::tuple(vec![Value::Int(1), Value::Int(2)]),
            Value::Int(3),
        ]);
        let right = Value::tuple(vec![
            Value::Int(1),
            Value::tuple(vec![Value::Int(2), Value::Int(3)]),
        ]);
        assert_ne!(HashKey::of(&left).unwrap(), HashKey::of(&right).unwrap());

        let mut set = Set::new();
        set.insert(left.clone()).unwrap();
        assert!(set.contains(&left).unwrap());
        assert!(!set.contains(&right).unwrap());

        let unhashable = Value::tuple(vec![Value::tuple(vec![Value::list(vec![])])]);
        assert!(HashKey::of(&unhashable).is_err());
    }

    #[test]
    fn test_tuple_keys() {
        let mut set = Set::new();
        let key = || Value::tuple(vec![Value::Int(1), Value::str("a")]);
        assert!(set.insert(key()).unwrap());
        assert!(!set.insert(key()).unwrap());
        assert!(set.contains(&key()).unwrap());
    }

    #[test]
    fn test_pop_last_is_lifo() {
        let mut dict = Dict::new();
        dict.insert(Value::str("a"), Value::Int(1)).unwrap();
        dict.insert(Value::str("b"), Value::Int(2)).unwrap();
        let (key, _) = dict.pop_last().unwrap();
        assert_eq!(key.to_string(), "b");
        assert_eq!(dict.len(), 1);
    }
}
