//! Variable providers
//!
//! A [`VariableProvider`] resolves variable names to values at evaluation
//! time. Providers are supplied by the caller for each evaluation; the engine
//! never owns or mutates them.
//!
//! - [`MapVariableProvider`]: a fixed set of values
//! - [`MutableVariableProvider`]: a shared map that can change between evaluations
//! - [`ExpressionVariableProvider`]: values defined by formulas, evaluated on lookup
//! - [`CompositeVariableProvider`]: an ordered chain of providers

use crate::ast::{Bound, FormulaExpr, RangeQualifier};
use crate::dependency::DependencyGraph;
use crate::error::{FormulaError, FormulaResult, SyntaxError};
use crate::functions::{FunctionProvider, FunctionRegistry};
use crate::interpreter::interpret;
use crate::parser::parse_formula;
use crate::value::Value;
use ahash::AHashMap;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::cell::RefCell;
use std::sync::{Arc, Weak};

/// Resolves variable names to values
pub trait VariableProvider: Send + Sync {
    /// Look up `name`, qualified by the evaluated range bounds
    ///
    /// `Ok(None)` means the provider has no value for the name, which
    /// evaluates to [`Value::Undefined`]. Errors are reserved for resolution
    /// failures that must abort evaluation.
    fn lookup(&self, name: &str, range: &ResolvedRange) -> FormulaResult<Option<Value>>;
}

impl<T: VariableProvider + ?Sized> VariableProvider for &T {
    fn lookup(&self, name: &str, range: &ResolvedRange) -> FormulaResult<Option<Value>> {
        (**self).lookup(name, range)
    }
}

impl<T: VariableProvider + ?Sized> VariableProvider for Box<T> {
    fn lookup(&self, name: &str, range: &ResolvedRange) -> FormulaResult<Option<Value>> {
        (**self).lookup(name, range)
    }
}

impl<T: VariableProvider + ?Sized> VariableProvider for Arc<T> {
    fn lookup(&self, name: &str, range: &ResolvedRange) -> FormulaResult<Option<Value>> {
        (**self).lookup(name, range)
    }
}

/// Range bounds after evaluation; `None` is an unset bound
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResolvedRange {
    pub lower: Option<Value>,
    pub upper: Option<Value>,
}

impl ResolvedRange {
    pub const UNBOUNDED: ResolvedRange = ResolvedRange {
        lower: None,
        upper: None,
    };

    pub fn is_unbounded(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }
}

/// Evaluate a range qualifier's bounds
///
/// Dynamic bounds are looked up through `variables`; an absent bound
/// variable leaves that bound unset.
pub fn resolve_range(
    range: Option<&RangeQualifier>,
    variables: &dyn VariableProvider,
) -> FormulaResult<ResolvedRange> {
    let range = match range {
        Some(range) => range,
        None => return Ok(ResolvedRange::UNBOUNDED),
    };

    Ok(ResolvedRange {
        lower: resolve_bound(&range.lower, variables)?,
        upper: resolve_bound(&range.upper, variables)?,
    })
}

fn resolve_bound(bound: &Bound, variables: &dyn VariableProvider) -> FormulaResult<Option<Value>> {
    match bound {
        Bound::Unspecified => Ok(None),
        Bound::Literal(value) => Ok(Some(value.clone())),
        Bound::Dynamic(name) => variables.lookup(name, &ResolvedRange::UNBOUNDED),
    }
}

/// Resolve a variable reference the way every evaluation backend does
pub(crate) fn resolve_variable(
    name: &str,
    range: Option<&RangeQualifier>,
    variables: &dyn VariableProvider,
) -> FormulaResult<Value> {
    let range = resolve_range(range, variables)?;
    Ok(variables.lookup(name, &range)?.unwrap_or(Value::Undefined))
}

// === Static values ===

/// A fixed mapping from names to values; range qualifiers are ignored
#[derive(Debug, Clone, Default)]
pub struct MapVariableProvider {
    values: AHashMap<String, Value>,
}

impl MapVariableProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for MapVariableProvider {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }
}

impl VariableProvider for MapVariableProvider {
    fn lookup(&self, name: &str, _range: &ResolvedRange) -> FormulaResult<Option<Value>> {
        Ok(self.values.get(name).cloned())
    }
}

// === Live values ===

/// A mapping that can be changed while formulas use it
///
/// Clones share the same storage, so a caller can keep a handle and update
/// values between evaluations. Lookups observe the value current at call
/// time. Writers and readers on different threads must be ordered by the
/// caller if they need a consistent view across several lookups.
#[derive(Debug, Clone, Default)]
pub struct MutableVariableProvider {
    values: Arc<RwLock<AHashMap<String, Value>>>,
}

impl MutableVariableProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, returning the previous one
    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.write().insert(name.into(), value.into())
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.values.write().remove(name)
    }

    pub fn clear(&self) {
        self.values.write().clear();
    }

    /// Current value of `name`
    pub fn get(&self, name: &str) -> Option<Value> {
        self.values.read().get(name).cloned()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for MutableVariableProvider {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let values = iter
            .into_iter()
            .map(|(name, value)| (name.into(), value.into()))
            .collect();
        Self {
            values: Arc::new(RwLock::new(values)),
        }
    }
}

impl VariableProvider for MutableVariableProvider {
    fn lookup(&self, name: &str, _range: &ResolvedRange) -> FormulaResult<Option<Value>> {
        Ok(self.values.read().get(name).cloned())
    }
}

// === Formula-defined values ===

/// Options for [`ExpressionVariableProvider`]
#[derive(Debug, Clone)]
pub struct ExpressionOptions {
    /// Longest chain of nested expression lookups before giving up (default: 256)
    pub max_depth: usize,
}

impl Default for ExpressionOptions {
    fn default() -> Self {
        Self { max_depth: 256 }
    }
}

struct ExpressionEntry {
    formula: String,
    parsed: OnceCell<Result<FormulaExpr, SyntaxError>>,
}

impl ExpressionEntry {
    fn parsed(&self) -> Result<&FormulaExpr, SyntaxError> {
        self.parsed
            .get_or_init(|| parse_formula(&self.formula))
            .as_ref()
            .map_err(Clone::clone)
    }
}

/// Variables whose values are formulas
///
/// A lookup parses the variable's formula (once) and interprets it. Names
/// inside the formula resolve against this provider, or against the
/// enclosing composite when built with [`within`](Self::within), so
/// formulas may refer to each other in any order. A name whose resolution
/// re-enters itself fails with [`FormulaError::RecursionLimit`].
///
/// ```rust
/// use formula_parser::{ExpressionVariableProvider, ResolvedRange, Value, VariableProvider};
///
/// let vars = ExpressionVariableProvider::new([("A", "B*C"), ("B", "C*10"), ("C", "SQRT(4)*5")]);
/// let a = vars.lookup("A", &ResolvedRange::UNBOUNDED).unwrap();
/// assert_eq!(a, Some(Value::Number(1000.0)));
/// ```
pub struct ExpressionVariableProvider {
    formulas: AHashMap<String, ExpressionEntry>,
    functions: Arc<dyn FunctionProvider>,
    scope: Option<CompositeHandle>,
    options: ExpressionOptions,
}

impl ExpressionVariableProvider {
    /// Formula-defined variables using the default functions
    pub fn new<K, V>(formulas: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self::with_functions(formulas, FunctionRegistry::shared())
    }

    pub fn with_functions<K, V>(
        formulas: impl IntoIterator<Item = (K, V)>,
        functions: Arc<dyn FunctionProvider>,
    ) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let formulas = formulas
            .into_iter()
            .map(|(name, formula)| {
                (
                    name.into(),
                    ExpressionEntry {
                        formula: formula.into(),
                        parsed: OnceCell::new(),
                    },
                )
            })
            .collect();

        Self {
            formulas,
            functions,
            scope: None,
            options: ExpressionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExpressionOptions) -> Self {
        self.options = options;
        self
    }

    /// Resolve names inside the formulas through the composite behind `handle`
    pub fn within(mut self, handle: &CompositeHandle) -> Self {
        self.scope = Some(handle.clone());
        self
    }

    /// Formula text of a variable
    pub fn formula(&self, name: &str) -> Option<&str> {
        self.formulas.get(name).map(|entry| entry.formula.as_str())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.formulas.keys().map(String::as_str)
    }

    /// Dependency graph between the formulas of this provider
    pub fn dependency_graph(&self) -> FormulaResult<DependencyGraph> {
        let mut parsed = Vec::with_capacity(self.formulas.len());
        for (name, entry) in &self.formulas {
            parsed.push((name.as_str(), entry.parsed()?));
        }
        Ok(DependencyGraph::from_formulas(parsed))
    }

    fn identity(&self) -> usize {
        self as *const Self as usize
    }
}

impl VariableProvider for ExpressionVariableProvider {
    fn lookup(&self, name: &str, _range: &ResolvedRange) -> FormulaResult<Option<Value>> {
        let entry = match self.formulas.get(name) {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let _guard = ResolutionGuard::enter(self.identity(), name, self.options.max_depth)?;
        let expr = entry.parsed()?;
        tracing::trace!(name, formula = %entry.formula, "resolving expression variable");

        let value = match self.scope.as_ref().and_then(CompositeHandle::upgrade) {
            Some(composite) => interpret(expr, composite.as_ref(), self.functions.as_ref())?,
            None => interpret(expr, self, self.functions.as_ref())?,
        };
        Ok(Some(value))
    }
}

thread_local! {
    /// Expression variables being resolved on this thread, innermost last
    static RESOLVING: RefCell<Vec<(usize, String)>> = const { RefCell::new(Vec::new()) };
}

/// Marks a variable as in progress for as long as it lives
struct ResolutionGuard;

impl ResolutionGuard {
    fn enter(owner: usize, name: &str, max_depth: usize) -> FormulaResult<Self> {
        RESOLVING.with(|resolving| {
            let mut resolving = resolving.borrow_mut();

            let cycle_start = resolving
                .iter()
                .position(|(o, n)| *o == owner && n == name);
            if cycle_start.is_some() || resolving.len() >= max_depth {
                let mut chain: Vec<String> = resolving[cycle_start.unwrap_or(0)..]
                    .iter()
                    .map(|(_, n)| n.clone())
                    .collect();
                chain.push(name.to_string());
                tracing::debug!(name, depth = resolving.len(), "expression variable recursion");
                return Err(FormulaError::RecursionLimit {
                    name: name.to_string(),
                    chain,
                });
            }

            resolving.push((owner, name.to_string()));
            Ok(ResolutionGuard)
        })
    }
}

impl Drop for ResolutionGuard {
    fn drop(&mut self) {
        RESOLVING.with(|resolving| {
            resolving.borrow_mut().pop();
        });
    }
}

// === Chains ===

/// Back-reference to a [`CompositeVariableProvider`] handed to its
/// sub-providers while it is being built
#[derive(Debug, Clone)]
pub struct CompositeHandle(Weak<CompositeVariableProvider>);

impl CompositeHandle {
    /// The composite, once construction has finished and while it is alive
    pub fn upgrade(&self) -> Option<Arc<CompositeVariableProvider>> {
        self.0.upgrade()
    }
}

/// Tries each sub-provider in order and returns the first value found
pub struct CompositeVariableProvider {
    providers: Vec<Box<dyn VariableProvider>>,
}

impl CompositeVariableProvider {
    pub fn new(providers: Vec<Box<dyn VariableProvider>>) -> Self {
        Self { providers }
    }

    /// Build a composite whose sub-providers may refer back to it
    ///
    /// `build` receives the composite's handle and returns the sub-providers
    /// in lookup order:
    ///
    /// ```rust
    /// use formula_parser::{
    ///     CompositeVariableProvider, ExpressionVariableProvider, MapVariableProvider,
    ///     ResolvedRange, Value, VariableProvider,
    /// };
    ///
    /// let vars = CompositeVariableProvider::build(|handle| {
    ///     vec![
    ///         Box::new(ExpressionVariableProvider::new([("Total", "[Net] * 1.2")]).within(handle))
    ///             as Box<dyn VariableProvider>,
    ///         Box::new(MapVariableProvider::from_iter([("Net", 100.0)])),
    ///     ]
    /// });
    /// let total = vars.lookup("Total", &ResolvedRange::UNBOUNDED).unwrap();
    /// assert_eq!(total, Some(Value::Number(120.0)));
    /// ```
    pub fn build<F>(build: F) -> Arc<Self>
    where
        F: FnOnce(&CompositeHandle) -> Vec<Box<dyn VariableProvider>>,
    {
        Arc::new_cyclic(|weak| {
            let handle = CompositeHandle(weak.clone());
            Self {
                providers: build(&handle),
            }
        })
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl VariableProvider for CompositeVariableProvider {
    fn lookup(&self, name: &str, range: &ResolvedRange) -> FormulaResult<Option<Value>> {
        for provider in &self.providers {
            if let Some(value) = provider.lookup(name, range)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}
