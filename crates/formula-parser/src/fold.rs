//! Constant folding
//!
//! Replaces constant subexpressions with their values ahead of evaluation.
//! Folding is best effort: a subtree whose evaluation could fail is left as
//! it is, so a folded formula fails (or succeeds) exactly where the unfolded
//! one would.

use crate::ast::FormulaExpr;
use crate::functions::FunctionProvider;
use crate::stack::ensure_sufficient_stack;

/// Fold constant subexpressions of `expr`
///
/// Calls are folded when all arguments are constant, the function is known
/// to `functions`, deterministic, and accepts the arguments.
///
/// Folding may produce NaN constants, which `==` never considers equal;
/// compare folded trees with [`FormulaExpr::same_structure`].
pub fn fold(expr: &FormulaExpr, functions: &dyn FunctionProvider) -> FormulaExpr {
    let mut folder = ConstantFolder {
        functions,
        folded: 0,
    };
    let result = folder.fold_expr(expr);
    tracing::debug!(folded = folder.folded, "constant folding finished");
    result
}

struct ConstantFolder<'a> {
    functions: &'a dyn FunctionProvider,
    /// Nodes replaced by constants
    folded: usize,
}

impl ConstantFolder<'_> {
    fn fold_expr(&mut self, expr: &FormulaExpr) -> FormulaExpr {
        ensure_sufficient_stack(|| match expr {
            FormulaExpr::Constant(_) | FormulaExpr::Variable { .. } => expr.clone(),

            FormulaExpr::BinaryOp { op, left, right } => {
                let left = self.fold_expr(left);
                let right = self.fold_expr(right);
                match (&left, &right) {
                    (FormulaExpr::Constant(l), FormulaExpr::Constant(r)) => {
                        self.folded += 1;
                        FormulaExpr::Constant(op.apply(l, r))
                    }
                    _ => FormulaExpr::binary(*op, left, right),
                }
            }

            FormulaExpr::Call { name, args } => {
                let args: Vec<FormulaExpr> = args.iter().map(|arg| self.fold_expr(arg)).collect();
                match self.fold_call(name, &args) {
                    Some(folded) => folded,
                    None => FormulaExpr::call(name.clone(), args),
                }
            }
        })
    }

    fn fold_call(&mut self, name: &str, args: &[FormulaExpr]) -> Option<FormulaExpr> {
        let values = args
            .iter()
            .map(|arg| match arg {
                FormulaExpr::Constant(value) => Some(value.clone()),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;

        let function = self.functions.lookup(name)?;
        if function.is_nondeterministic() {
            return None;
        }
        if let Err(message) = function.validate(&values) {
            tracing::trace!(function = name, %message, "call left unfolded");
            return None;
        }

        self.folded += 1;
        Some(FormulaExpr::Constant(function.execute(&values)))
    }
}
