//! Dependency tracking for formulas
//!
//! Static extraction of the variables a formula reads, and a graph of which
//! named formulas depend on which others.

use crate::ast::{Bound, FormulaExpr, RangeQualifier};
use crate::stack::ensure_sufficient_stack;
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};

/// A variable read by a formula, with its statically known range bounds
///
/// Bounds given by another variable (`[A]|[B]:0|`) are unknown before
/// evaluation and reported as unset; the bound variable is reported as a
/// dependency of its own.
#[derive(Debug, Clone, PartialEq)]
pub struct Dependency {
    pub name: String,
    pub lower: Option<Value>,
    pub upper: Option<Value>,
}

impl Dependency {
    fn unbounded(name: &str) -> Self {
        Self {
            name: name.to_string(),
            lower: None,
            upper: None,
        }
    }

    fn qualified(name: &str, range: &RangeQualifier) -> Self {
        Self {
            name: name.to_string(),
            lower: static_bound(&range.lower),
            upper: static_bound(&range.upper),
        }
    }
}

fn static_bound(bound: &Bound) -> Option<Value> {
    match bound {
        Bound::Literal(value) => Some(value.clone()),
        Bound::Unspecified | Bound::Dynamic(_) => None,
    }
}

/// Names of all variables `expr` reads
pub fn extract_dependencies(expr: &FormulaExpr) -> BTreeSet<String> {
    extract_dependencies_with_ranges(expr).into_keys().collect()
}

/// Variables `expr` reads, with their range bounds
///
/// When a name occurs more than once, the occurrence visited last (pre-order,
/// left to right) determines the reported bounds.
pub fn extract_dependencies_with_ranges(expr: &FormulaExpr) -> BTreeMap<String, Dependency> {
    let mut dependencies = BTreeMap::new();
    collect(expr, &mut dependencies);
    dependencies
}

fn collect(expr: &FormulaExpr, out: &mut BTreeMap<String, Dependency>) {
    ensure_sufficient_stack(|| match expr {
        FormulaExpr::Constant(_) => {}
        FormulaExpr::Variable { name, range: None } => {
            out.insert(name.clone(), Dependency::unbounded(name));
        }
        FormulaExpr::Variable {
            name,
            range: Some(range),
        } => {
            out.insert(name.clone(), Dependency::qualified(name, range));
            for bound in [&range.lower, &range.upper] {
                if let Bound::Dynamic(bound_name) = bound {
                    out.insert(bound_name.clone(), Dependency::unbounded(bound_name));
                }
            }
        }
        FormulaExpr::BinaryOp { left, right, .. } => {
            collect(left, out);
            collect(right, out);
        }
        FormulaExpr::Call { args, .. } => {
            for arg in args {
                collect(arg, out);
            }
        }
    })
}

/// Dependency graph for named formulas
///
/// Tracks which names depend on which other names, enabling ordered
/// recalculation and cycle detection.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Name → names that depend on it (dependents)
    dependents: BTreeMap<String, BTreeSet<String>>,
    /// Name → names it depends on (precedents)
    precedents: BTreeMap<String, BTreeSet<String>>,
    nodes: BTreeSet<String>,
}

impl DependencyGraph {
    /// Create a new empty dependency graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph of named formulas and the variables each one reads
    pub fn from_formulas<'a, S>(formulas: impl IntoIterator<Item = (S, &'a FormulaExpr)>) -> Self
    where
        S: AsRef<str>,
    {
        let mut graph = Self::new();
        for (name, expr) in formulas {
            let name = name.as_ref();
            graph.add_node(name);
            for precedent in extract_dependencies(expr) {
                graph.add_dependency(&precedent, name);
            }
        }
        graph
    }

    pub fn add_node(&mut self, name: &str) {
        if !self.nodes.contains(name) {
            self.nodes.insert(name.to_string());
        }
    }

    /// Add a dependency: dependent depends on precedent
    pub fn add_dependency(&mut self, precedent: &str, dependent: &str) {
        self.add_node(precedent);
        self.add_node(dependent);
        self.dependents
            .entry(precedent.to_string())
            .or_default()
            .insert(dependent.to_string());
        self.precedents
            .entry(dependent.to_string())
            .or_default()
            .insert(precedent.to_string());
    }

    /// Remove all dependencies for a name
    pub fn clear_dependencies(&mut self, name: &str) {
        // Remove from all precedents' dependents list
        if let Some(precedents) = self.precedents.remove(name) {
            for precedent in precedents {
                if let Some(deps) = self.dependents.get_mut(&precedent) {
                    deps.remove(name);
                }
            }
        }

        // Remove as a precedent for others
        if let Some(dependents) = self.dependents.remove(name) {
            for dependent in dependents {
                if let Some(precs) = self.precedents.get_mut(&dependent) {
                    precs.remove(name);
                }
            }
        }
    }

    /// Names that depend on the given name
    pub fn dependents(&self, name: &str) -> impl Iterator<Item = &str> + '_ {
        self.dependents
            .get(name)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Names the given name depends on
    pub fn precedents(&self, name: &str) -> impl Iterator<Item = &str> + '_ {
        self.precedents
            .get(name)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Every name in the graph
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.nodes.iter().map(String::as_str)
    }

    /// Names to recalculate, in order, when the given names change
    ///
    /// The changed names come first; every name appears after all of its
    /// precedents that are part of the result. Cycles are broken arbitrarily.
    pub fn recalc_order(&self, changed: &[&str]) -> Vec<String> {
        let mut result = Vec::new();
        let mut visited = BTreeSet::new();
        let mut in_stack = BTreeSet::new();

        for name in changed {
            self.visit_dependents(name, &mut result, &mut visited, &mut in_stack);
        }

        result.reverse();
        result
    }

    /// Topological sort helper (DFS over dependents, post-order)
    fn visit_dependents<'a>(
        &'a self,
        name: &'a str,
        result: &mut Vec<String>,
        visited: &mut BTreeSet<&'a str>,
        in_stack: &mut BTreeSet<&'a str>,
    ) {
        if visited.contains(name) || in_stack.contains(name) {
            return;
        }

        ensure_sufficient_stack(|| {
            in_stack.insert(name);
            for dependent in self.dependents(name) {
                self.visit_dependents(dependent, result, visited, in_stack);
            }
            in_stack.remove(name);
        });

        visited.insert(name);
        result.push(name.to_string());
    }

    /// Every name, each after all of its precedents
    ///
    /// Names on a cycle are ordered arbitrarily among themselves.
    pub fn calculation_order(&self) -> Vec<String> {
        let mut result = Vec::with_capacity(self.nodes.len());
        let mut visited = BTreeSet::new();
        let mut in_stack = BTreeSet::new();

        for name in &self.nodes {
            self.visit_precedents(name, &mut result, &mut visited, &mut in_stack);
        }
        result
    }

    fn visit_precedents<'a>(
        &'a self,
        name: &'a str,
        result: &mut Vec<String>,
        visited: &mut BTreeSet<&'a str>,
        in_stack: &mut BTreeSet<&'a str>,
    ) {
        if visited.contains(name) || in_stack.contains(name) {
            return;
        }

        ensure_sufficient_stack(|| {
            in_stack.insert(name);
            for precedent in self.precedents(name) {
                self.visit_precedents(precedent, result, visited, in_stack);
            }
            in_stack.remove(name);
        });

        visited.insert(name);
        result.push(name.to_string());
    }

    /// A chain of precedents leading from `name` back to itself
    ///
    /// The returned path starts and ends with `name`.
    pub fn find_cycle(&self, name: &str) -> Option<Vec<String>> {
        let mut path = vec![name.to_string()];
        let mut visited = BTreeSet::new();
        if self.cycle_from(name, name, &mut path, &mut visited) {
            Some(path)
        } else {
            None
        }
    }

    fn cycle_from<'a>(
        &'a self,
        target: &str,
        current: &str,
        path: &mut Vec<String>,
        visited: &mut BTreeSet<&'a str>,
    ) -> bool {
        ensure_sufficient_stack(|| {
            for precedent in self.precedents(current) {
                if precedent == target {
                    path.push(target.to_string());
                    return true;
                }
                if visited.insert(precedent) {
                    path.push(precedent.to_string());
                    if self.cycle_from(target, precedent, path, visited) {
                        return true;
                    }
                    path.pop();
                }
            }
            false
        })
    }

    /// Detect circular references involving a name
    pub fn has_circular_reference(&self, name: &str) -> bool {
        self.find_cycle(name).is_some()
    }

    /// Clear the entire graph
    pub fn clear(&mut self) {
        self.dependents.clear();
        self.precedents.clear();
        self.nodes.clear();
    }
}
