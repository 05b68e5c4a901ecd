//! Closure compiler
//!
//! Turns an AST into a tree of boxed closures, one per node, so evaluation
//! no longer matches on node kinds. The result evaluates exactly like
//! [`interpret`](crate::interpret).

use crate::ast::{BinaryOperator, FormulaExpr};
use crate::error::FormulaResult;
use crate::functions::FunctionProvider;
use crate::interpreter::{call_function, Evaluate};
use crate::stack::ensure_sufficient_stack;
use crate::value::Value;
use crate::variables::{resolve_variable, ResolvedRange, VariableProvider};
use std::fmt;

type NodeFn =
    dyn Fn(&dyn VariableProvider, &dyn FunctionProvider) -> FormulaResult<Value> + Send + Sync;

/// One compiled node, owning the closures of its children
struct Evaluator(Box<NodeFn>);

impl Evaluator {
    #[inline]
    fn call(
        &self,
        variables: &dyn VariableProvider,
        functions: &dyn FunctionProvider,
    ) -> FormulaResult<Value> {
        (self.0)(variables, functions)
    }
}

/// Dropping a node drops its children's closures, one stack frame per level
impl Drop for Evaluator {
    fn drop(&mut self) {
        let released: Box<NodeFn> = Box::new(released_node);
        let node = std::mem::replace(&mut self.0, released);
        ensure_sufficient_stack(move || drop(node));
    }
}

fn released_node(
    _variables: &dyn VariableProvider,
    _functions: &dyn FunctionProvider,
) -> FormulaResult<Value> {
    Ok(Value::Undefined)
}

/// A formula compiled to closures
///
/// Holds no reference to the AST it was built from; it can be evaluated any
/// number of times, with different providers, from any thread.
pub struct ClosureFormula {
    eval: Evaluator,
    nodes: usize,
}

impl ClosureFormula {
    pub fn evaluate(
        &self,
        variables: &dyn VariableProvider,
        functions: &dyn FunctionProvider,
    ) -> FormulaResult<Value> {
        self.eval.call(variables, functions)
    }

    /// Number of AST nodes compiled
    pub fn nodes(&self) -> usize {
        self.nodes
    }
}

impl Evaluate for ClosureFormula {
    fn evaluate(
        &self,
        variables: &dyn VariableProvider,
        functions: &dyn FunctionProvider,
    ) -> FormulaResult<Value> {
        self.eval.call(variables, functions)
    }
}

impl fmt::Debug for ClosureFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosureFormula")
            .field("nodes", &self.nodes)
            .finish_non_exhaustive()
    }
}

/// Compile a formula AST to closures
pub fn compile(expr: &FormulaExpr) -> ClosureFormula {
    let mut nodes = 0;
    let eval = compile_expr(expr, &mut nodes);
    tracing::debug!(nodes, "compiled formula to closures");
    ClosureFormula { eval, nodes }
}

fn compile_expr(expr: &FormulaExpr, nodes: &mut usize) -> Evaluator {
    *nodes += 1;
    ensure_sufficient_stack(|| match expr {
        FormulaExpr::Constant(Value::Number(n)) => {
            let n = *n;
            evaluator(move |_, _| Ok(Value::Number(n)))
        }
        FormulaExpr::Constant(value) => {
            let value = value.clone();
            evaluator(move |_, _| Ok(value.clone()))
        }

        FormulaExpr::Variable { name, range: None } => {
            let name = name.clone();
            evaluator(move |variables, _| {
                Ok(variables
                    .lookup(&name, &ResolvedRange::UNBOUNDED)?
                    .unwrap_or(Value::Undefined))
            })
        }
        FormulaExpr::Variable {
            name,
            range: Some(range),
        } => {
            let name = name.clone();
            let range = range.clone();
            evaluator(move |variables, _| resolve_variable(&name, Some(&range), variables))
        }

        FormulaExpr::BinaryOp { op, left, right } => {
            let left = compile_expr(left, nodes);
            let right = compile_expr(right, nodes);
            binary(*op, left, right)
        }

        FormulaExpr::Call { name, args } => {
            let name = name.clone();
            let args: Vec<Evaluator> = args.iter().map(|arg| compile_expr(arg, nodes)).collect();
            evaluator(move |variables, functions| {
                let values = ensure_sufficient_stack(|| {
                    args.iter()
                        .map(|arg| arg.call(variables, functions))
                        .collect::<FormulaResult<Vec<_>>>()
                })?;
                call_function(&name, &values, functions)
            })
        }
    })
}

fn evaluator<F>(f: F) -> Evaluator
where
    F: Fn(&dyn VariableProvider, &dyn FunctionProvider) -> FormulaResult<Value>
        + Send
        + Sync
        + 'static,
{
    Evaluator(Box::new(f))
}

fn binary(op: BinaryOperator, left: Evaluator, right: Evaluator) -> Evaluator {
    evaluator(move |variables, functions| {
        ensure_sufficient_stack(|| {
            let l = left.call(variables, functions)?;
            let r = right.call(variables, functions)?;
            Ok(op.apply(&l, &r))
        })
    })
}
