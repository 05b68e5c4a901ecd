//! # formula-parser
//!
//! Parser and evaluation engine for arithmetic formulas over named variables.
//!
//! This crate provides:
//! - Formula parsing (text → AST)
//! - Interpretation (AST → value)
//! - Constant folding
//! - Compilation to closures and to native code (Cranelift)
//! - Pluggable variable and function providers
//! - Static dependency and range extraction
//!
//! Every evaluation path gives the same result for the same formula and
//! providers. Missing variables and arithmetic over non-numbers evaluate to
//! [`Value::Undefined`]; unknown functions and rejected arguments are errors.
//!
//! ## Example
//!
//! ```rust
//! use formula_parser::{
//!     compile, compile_native, fold, interpret, parse_formula, FunctionRegistry,
//!     MapVariableProvider, Value,
//! };
//!
//! let ast = parse_formula("SUM(SQRT((1 + 2 * [Var1] ^ [Var2]) / 5), 1)").unwrap();
//! let vars = MapVariableProvider::from_iter([("Var1", 2.0), ("Var2", 1.0)]);
//! let functions = FunctionRegistry::global();
//!
//! let expected = Value::Number(2.0);
//! assert_eq!(interpret(&ast, &vars, functions).unwrap(), expected);
//! assert_eq!(interpret(&fold(&ast, functions), &vars, functions).unwrap(), expected);
//! assert_eq!(compile(&ast).evaluate(&vars, functions).unwrap(), expected);
//! assert_eq!(compile_native(&ast).unwrap().evaluate(&vars, functions).unwrap(), expected);
//! ```

pub mod ast;
pub mod compiler;
pub mod dependency;
pub mod error;
pub mod fold;
pub mod functions;
pub mod interpreter;
pub mod native;
pub mod parser;
pub mod stack;
pub mod value;
pub mod variables;

pub use ast::{BinaryOperator, Bound, FormulaExpr, RangeQualifier};
pub use compiler::{compile, ClosureFormula};
pub use dependency::{
    extract_dependencies, extract_dependencies_with_ranges, Dependency, DependencyGraph,
};
pub use error::{FormulaError, FormulaResult, SyntaxError};
pub use fold::fold;
pub use functions::{
    CompositeFunctionHandle, CompositeFunctionProvider, FunctionDef, FunctionImplementation,
    FunctionProvider, FunctionRegistry,
};
pub use interpreter::{interpret, Evaluate};
pub use native::{compile_native, NativeCompiler, NativeFormula, NativeOptions, OptLevel};
pub use parser::parse_formula;
pub use value::Value;
pub use variables::{
    resolve_range, CompositeHandle, CompositeVariableProvider, ExpressionOptions,
    ExpressionVariableProvider, MapVariableProvider, MutableVariableProvider, ResolvedRange,
    VariableProvider,
};

/// Parse and interpret formula text
///
/// Returns `None` when the formula evaluates to anything but a number.
pub fn interpret_formula(
    formula: &str,
    variables: &dyn VariableProvider,
    functions: &dyn FunctionProvider,
) -> FormulaResult<Option<f64>> {
    let expr = parse_formula(formula)?;
    Ok(interpret(&expr, variables, functions)?.as_number())
}

/// Parse formula text and fold its constant subexpressions
pub fn fold_formula(formula: &str, functions: &dyn FunctionProvider) -> FormulaResult<FormulaExpr> {
    Ok(fold(&parse_formula(formula)?, functions))
}
