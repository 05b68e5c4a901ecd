//! Tree-walking formula interpreter
//!
//! Evaluates formula ASTs directly, consulting the providers at every
//! variable reference and function call.

use crate::ast::FormulaExpr;
use crate::error::{FormulaError, FormulaResult};
use crate::functions::FunctionProvider;
use crate::stack::ensure_sufficient_stack;
use crate::value::Value;
use crate::variables::{resolve_variable, VariableProvider};

/// Anything that can produce a value from a pair of providers
///
/// Implemented by the AST itself (interpretation) and by the compiled forms
/// [`ClosureFormula`](crate::ClosureFormula) and
/// [`NativeFormula`](crate::NativeFormula). All of them give the same result
/// for the same formula and providers.
pub trait Evaluate {
    fn evaluate(
        &self,
        variables: &dyn VariableProvider,
        functions: &dyn FunctionProvider,
    ) -> FormulaResult<Value>;
}

impl Evaluate for FormulaExpr {
    fn evaluate(
        &self,
        variables: &dyn VariableProvider,
        functions: &dyn FunctionProvider,
    ) -> FormulaResult<Value> {
        interpret(self, variables, functions)
    }
}

/// Evaluate a formula AST
pub fn interpret(
    expr: &FormulaExpr,
    variables: &dyn VariableProvider,
    functions: &dyn FunctionProvider,
) -> FormulaResult<Value> {
    ensure_sufficient_stack(|| match expr {
        FormulaExpr::Constant(value) => Ok(value.clone()),

        FormulaExpr::Variable { name, range } => resolve_variable(name, range.as_ref(), variables),

        FormulaExpr::BinaryOp { op, left, right } => {
            let left = interpret(left, variables, functions)?;
            let right = interpret(right, variables, functions)?;
            Ok(op.apply(&left, &right))
        }

        FormulaExpr::Call { name, args } => {
            let values = args
                .iter()
                .map(|arg| interpret(arg, variables, functions))
                .collect::<FormulaResult<Vec<_>>>()?;
            call_function(name, &values, functions)
        }
    })
}

/// Look up, validate and run a function on evaluated arguments
pub(crate) fn call_function(
    name: &str,
    args: &[Value],
    functions: &dyn FunctionProvider,
) -> FormulaResult<Value> {
    let function = functions
        .lookup(name)
        .ok_or_else(|| FormulaError::UnknownFunction(name.to_string()))?;

    function
        .validate(args)
        .map_err(|message| FormulaError::Argument {
            function: name.to_string(),
            message,
        })?;

    Ok(function.execute(args))
}
