//! Functions callable from formulas

pub mod math;

use crate::value::Value;
use ahash::AHashMap;
use std::sync::{Arc, OnceLock, Weak};

/// A function formulas can call
pub trait FunctionImplementation: Send + Sync {
    fn name(&self) -> &str;

    /// Whether two calls with the same arguments may return different values
    ///
    /// Nondeterministic functions are never folded into constants.
    fn is_nondeterministic(&self) -> bool {
        false
    }

    /// Check the evaluated arguments before [`execute`](Self::execute)
    ///
    /// The error message ends up in [`FormulaError::Argument`](crate::FormulaError::Argument).
    fn validate(&self, args: &[Value]) -> Result<(), String>;

    fn execute(&self, args: &[Value]) -> Value;
}

/// Resolves function names to implementations
pub trait FunctionProvider: Send + Sync {
    fn lookup(&self, name: &str) -> Option<&dyn FunctionImplementation>;

    /// Names of all functions this provider knows
    fn known_functions(&self) -> Vec<String>;
}

impl<T: FunctionProvider + ?Sized> FunctionProvider for &T {
    fn lookup(&self, name: &str) -> Option<&dyn FunctionImplementation> {
        (**self).lookup(name)
    }

    fn known_functions(&self) -> Vec<String> {
        (**self).known_functions()
    }
}

impl<T: FunctionProvider + ?Sized> FunctionProvider for Box<T> {
    fn lookup(&self, name: &str) -> Option<&dyn FunctionImplementation> {
        (**self).lookup(name)
    }

    fn known_functions(&self) -> Vec<String> {
        (**self).known_functions()
    }
}

impl<T: FunctionProvider + ?Sized> FunctionProvider for Arc<T> {
    fn lookup(&self, name: &str) -> Option<&dyn FunctionImplementation> {
        (**self).lookup(name)
    }

    fn known_functions(&self) -> Vec<String> {
        (**self).known_functions()
    }
}

/// Function implementation signature
pub type FunctionImpl = fn(&[Value]) -> Value;

/// Function definition
pub struct FunctionDef {
    /// Function name (uppercase)
    pub name: &'static str,
    /// Minimum arguments
    pub min_args: usize,
    /// Maximum arguments (None = unlimited)
    pub max_args: Option<usize>,
    /// Implementation
    pub implementation: FunctionImpl,
    /// Returns a different value on each call
    pub nondeterministic: bool,
}

impl FunctionDef {
    /// A deterministic function taking `min_args..=max_args` arguments
    pub fn new(
        name: &'static str,
        min_args: usize,
        max_args: Option<usize>,
        implementation: FunctionImpl,
    ) -> Self {
        Self {
            name,
            min_args,
            max_args,
            implementation,
            nondeterministic: false,
        }
    }

    fn expected_args(&self) -> String {
        match self.max_args {
            Some(max) if max == self.min_args => format!("exactly {}", max),
            Some(max) => format!("{} to {}", self.min_args, max),
            None => format!("at least {}", self.min_args),
        }
    }
}

impl FunctionImplementation for FunctionDef {
    fn name(&self) -> &str {
        self.name
    }

    fn is_nondeterministic(&self) -> bool {
        self.nondeterministic
    }

    fn validate(&self, args: &[Value]) -> Result<(), String> {
        let count = args.len();
        if count < self.min_args || self.max_args.is_some_and(|max| count > max) {
            return Err(format!(
                "Wrong number of arguments for {}: expected {}, got {}",
                self.name,
                self.expected_args(),
                count
            ));
        }
        Ok(())
    }

    fn execute(&self, args: &[Value]) -> Value {
        (self.implementation)(args)
    }
}

static DEFAULT_REGISTRY: OnceLock<Arc<FunctionRegistry>> = OnceLock::new();

/// Function registry, matching names case-insensitively
pub struct FunctionRegistry {
    functions: AHashMap<String, Box<dyn FunctionImplementation>>,
}

impl FunctionRegistry {
    /// Create a new registry with all built-in functions
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register_math_functions();
        registry
    }

    /// A registry without any functions
    pub fn empty() -> Self {
        Self {
            functions: AHashMap::new(),
        }
    }

    /// The shared registry of built-in functions
    pub fn global() -> &'static FunctionRegistry {
        DEFAULT_REGISTRY.get_or_init(|| Arc::new(FunctionRegistry::new()))
    }

    /// [`global`](Self::global) as a provider that can be stored
    pub fn shared() -> Arc<dyn FunctionProvider> {
        DEFAULT_REGISTRY
            .get_or_init(|| Arc::new(FunctionRegistry::new()))
            .clone()
    }

    /// Register a function, replacing any function of the same name
    pub fn register(&mut self, function: impl FunctionImplementation + 'static) {
        self.functions
            .insert(function.name().to_uppercase(), Box::new(function));
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    fn register_math_functions(&mut self) {
        // SUM
        self.register(FunctionDef {
            name: "SUM",
            min_args: 1,
            max_args: None,
            implementation: math::fn_sum,
            nondeterministic: false,
        });

        // AVERAGE
        self.register(FunctionDef {
            name: "AVERAGE",
            min_args: 1,
            max_args: None,
            implementation: math::fn_average,
            nondeterministic: false,
        });

        // MIN
        self.register(FunctionDef {
            name: "MIN",
            min_args: 1,
            max_args: None,
            implementation: math::fn_min,
            nondeterministic: false,
        });

        // MAX
        self.register(FunctionDef {
            name: "MAX",
            min_args: 1,
            max_args: None,
            implementation: math::fn_max,
            nondeterministic: false,
        });

        // COUNT
        self.register(FunctionDef {
            name: "COUNT",
            min_args: 0,
            max_args: None,
            implementation: math::fn_count,
            nondeterministic: false,
        });

        // RAND (nondeterministic)
        self.register(FunctionDef {
            name: "RAND",
            min_args: 0,
            max_args: Some(0),
            implementation: math::fn_rand,
            nondeterministic: true,
        });

        for (name, implementation) in [
            ("ABS", math::fn_abs as FunctionImpl),
            ("SQRT", math::fn_sqrt),
            ("INT", math::fn_int),
            ("SIGN", math::fn_sign),
            ("EXP", math::fn_exp),
            ("LN", math::fn_ln),
            ("LOG10", math::fn_log10),
            ("SIN", math::fn_sin),
            ("COS", math::fn_cos),
            ("TAN", math::fn_tan),
        ] {
            self.register(FunctionDef {
                name,
                min_args: 1,
                max_args: Some(1),
                implementation,
                nondeterministic: false,
            });
        }

        // ROUND
        self.register(FunctionDef {
            name: "ROUND",
            min_args: 1,
            max_args: Some(2),
            implementation: math::fn_round,
            nondeterministic: false,
        });

        // LOG
        self.register(FunctionDef {
            name: "LOG",
            min_args: 1,
            max_args: Some(2),
            implementation: math::fn_log,
            nondeterministic: false,
        });

        // MOD
        self.register(FunctionDef {
            name: "MOD",
            min_args: 2,
            max_args: Some(2),
            implementation: math::fn_mod,
            nondeterministic: false,
        });

        // POWER
        self.register(FunctionDef {
            name: "POWER",
            min_args: 2,
            max_args: Some(2),
            implementation: math::fn_power,
            nondeterministic: false,
        });

        // PI
        self.register(FunctionDef {
            name: "PI",
            min_args: 0,
            max_args: Some(0),
            implementation: math::fn_pi,
            nondeterministic: false,
        });
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionProvider for FunctionRegistry {
    fn lookup(&self, name: &str) -> Option<&dyn FunctionImplementation> {
        self.functions.get(&name.to_uppercase()).map(|f| f.as_ref())
    }

    fn known_functions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Non-owning reference from a sub-provider back to its composite
#[derive(Clone)]
pub struct CompositeFunctionHandle(Weak<CompositeFunctionProvider>);

impl CompositeFunctionHandle {
    /// The composite, once construction has finished and while it is alive
    pub fn upgrade(&self) -> Option<Arc<CompositeFunctionProvider>> {
        self.0.upgrade()
    }
}

/// Tries each sub-provider in order; the first provider that knows a name wins
pub struct CompositeFunctionProvider {
    providers: Vec<Arc<dyn FunctionProvider>>,
}

impl CompositeFunctionProvider {
    pub fn new(providers: Vec<Arc<dyn FunctionProvider>>) -> Self {
        Self { providers }
    }

    /// Custom functions in front of the built-ins
    pub fn with_builtins(custom: Arc<dyn FunctionProvider>) -> Self {
        Self::new(vec![custom, FunctionRegistry::shared()])
    }

    /// Build a composite whose sub-providers may call back into it
    ///
    /// `build` receives a handle to the composite under construction. It
    /// upgrades only after `build` returns, so functions resolve other
    /// functions through it at call time.
    pub fn build<F>(build: F) -> Arc<Self>
    where
        F: FnOnce(&CompositeFunctionHandle) -> Vec<Arc<dyn FunctionProvider>>,
    {
        Arc::new_cyclic(|weak| {
            let handle = CompositeFunctionHandle(weak.clone());
            Self {
                providers: build(&handle),
            }
        })
    }
}

impl FunctionProvider for CompositeFunctionProvider {
    fn lookup(&self, name: &str) -> Option<&dyn FunctionImplementation> {
        self.providers
            .iter()
            .find_map(|provider| provider.lookup(name))
    }

    fn known_functions(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for provider in &self.providers {
            for name in provider.known_functions() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }
}
