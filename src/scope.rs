//! Lexical environments.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use crate::annotated::Annotated;
use crate::value::{Symbol, Value};

/// Insertion-ordered bindings plus parents searched depth-first on a miss.
///
/// Cloning a scope shares it; closures keep their defining scope alive.
#[derive(Clone)]
pub struct Scope(Arc<ScopeData>);

struct ScopeData {
    parents: Vec<Scope>,
    bindings: RwLock<IndexMap<Symbol, Value>>,
    docs: RwLock<HashMap<Symbol, String>>,
    commentary: Mutex<Vec<Annotated>>,
}

impl Scope {
    pub fn new(parents: Vec<Scope>) -> Self {
        Scope(Arc::new(ScopeData {
            parents,
            bindings: RwLock::new(IndexMap::new()),
            docs: RwLock::new(HashMap::new()),
            commentary: Mutex::new(Vec::new()),
        }))
    }

    pub fn empty() -> Self {
        Scope::new(Vec::new())
    }

    pub fn child(&self) -> Self {
        Scope::new(vec![self.clone()])
    }

    pub fn parents(&self) -> &[Scope] {
        &self.0.parents
    }

    pub fn get(&self, symbol: &Symbol) -> Option<Value> {
        if let Some(value) = self.0.bindings.read().get(symbol) {
            return Some(value.clone());
        }
        self.0.parents.iter().find_map(|parent| parent.get(symbol))
    }

    pub fn set(&self, symbol: impl Into<Symbol>, value: Value) {
        self.0.bindings.write().insert(symbol.into(), value);
    }

    /// Bind with documentation.
    pub fn def(&self, symbol: impl Into<Symbol>, value: Value, doc: &str) {
        let symbol = symbol.into();
        self.set_doc(&symbol, doc);
        self.set(symbol, value);
    }

    pub fn set_doc(&self, symbol: &Symbol, doc: &str) {
        self.0.docs.write().insert(symbol.clone(), doc.to_string());
    }

    pub fn doc(&self, symbol: &Symbol) -> Option<String> {
        if let Some(doc) = self.0.docs.read().get(symbol) {
            return Some(doc.clone());
        }
        self.0.parents.iter().find_map(|parent| parent.doc(symbol))
    }

    pub fn comment(&self, entry: Annotated) {
        self.0.commentary.lock().push(entry);
    }

    pub fn commentary(&self) -> Vec<Annotated> {
        self.0.commentary.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.0.bindings.read().is_empty()
    }

    /// Own bindings in insertion order.
    pub fn bindings(&self) -> Vec<(Symbol, Value)> {
        self.0
            .bindings
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Every binding reachable from this scope, shadowed names omitted.
    pub fn visible_bindings(&self) -> Vec<(Symbol, Value)> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        self.collect_visible(&mut seen, &mut out);
        out
    }

    fn collect_visible(&self, seen: &mut HashSet<Symbol>, out: &mut Vec<(Symbol, Value)>) {
        for (symbol, value) in self.bindings() {
            if seen.insert(symbol.clone()) {
                out.push((symbol, value));
            }
        }
        for parent in &self.0.parents {
            parent.collect_visible(seen, out);
        }
    }

    pub fn ptr_eq(&self, other: &Scope) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Same scope, or the same own bindings and structurally equal parents.
    pub fn equal(&self, other: &Scope) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        let mine = self.bindings();
        let theirs = other.bindings();
        if mine.len() != theirs.len() || self.parents().len() != other.parents().len() {
            return false;
        }
        let theirs: HashMap<Symbol, Value> = theirs.into_iter().collect();
        mine.iter()
            .all(|(k, v)| theirs.get(k).is_some_and(|other| v.equal(other)))
            && self
                .parents()
                .iter()
                .zip(other.parents())
                .all(|(a, b)| a.equal(b))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (symbol, value)) in self.bindings().iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, ":{symbol} {value}")?;
        }
        f.write_str("}")
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parents_are_searched_in_order() {
        let first = Scope::empty();
        first.set("x", Value::Int(1));
        let second = Scope::empty();
        second.set("x", Value::Int(2));
        second.set("y", Value::Int(3));
        let scope = Scope::new(vec![first, second]);
        assert_eq!(scope.get(&Symbol::new("x")), Some(Value::Int(1)));
        assert_eq!(scope.get(&Symbol::new("y")), Some(Value::Int(3)));
        assert_eq!(scope.get(&Symbol::new("z")), None);
    }

    #[test]
    fn child_shadows_without_mutating_parent() {
        let parent = Scope::empty();
        parent.set("x", Value::Int(1));
        let child = parent.child();
        child.set("x", Value::Int(2));
        assert_eq!(child.get(&Symbol::new("x")), Some(Value::Int(2)));
        assert_eq!(parent.get(&Symbol::new("x")), Some(Value::Int(1)));
        let visible = child.visible_bindings();
        assert_eq!(visible.len(), 1);
    }

    #[test]
    fn docs_follow_parents() {
        let parent = Scope::empty();
        parent.def("f", Value::Null, "does f");
        let child = parent.child();
        assert_eq!(child.doc(&Symbol::new("f")).as_deref(), Some("does f"));
    }

    #[test]
    fn structural_equality() {
        let a = Scope::empty();
        a.set("k", Value::Int(1));
        let b = Scope::empty();
        b.set("k", Value::Int(1));
        assert!(a.equal(&b));
        b.set("k", Value::Int(2));
        assert!(!a.equal(&b));
        assert_eq!(a.to_string(), "{:k 1}");
    }
}
