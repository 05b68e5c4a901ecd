//! Formula Abstract Syntax Tree types

use crate::stack::ensure_sufficient_stack;
use crate::value::Value;
use std::fmt;

/// Formula expression AST
///
/// Trees are immutable once built: folding and compilation produce new trees
/// or callables and leave their input untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum FormulaExpr {
    /// Numeric or text literal
    Constant(Value),

    /// Variable reference, `[Name]` or `Name`, with an optional range
    /// qualifier `[Name]|lower:upper|`
    Variable {
        name: String,
        range: Option<RangeQualifier>,
    },

    /// Binary operation
    BinaryOp {
        op: BinaryOperator,
        left: Box<FormulaExpr>,
        right: Box<FormulaExpr>,
    },

    /// Function call
    Call { name: String, args: Vec<FormulaExpr> },
}

impl FormulaExpr {
    pub fn number(n: f64) -> Self {
        FormulaExpr::Constant(Value::Number(n))
    }

    pub fn text(s: impl Into<String>) -> Self {
        FormulaExpr::Constant(Value::Text(s.into()))
    }

    /// Unqualified variable reference
    pub fn variable(name: impl Into<String>) -> Self {
        FormulaExpr::Variable {
            name: name.into(),
            range: None,
        }
    }

    pub fn binary(op: BinaryOperator, left: FormulaExpr, right: FormulaExpr) -> Self {
        FormulaExpr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn call(name: impl Into<String>, args: Vec<FormulaExpr>) -> Self {
        FormulaExpr::Call {
            name: name.into(),
            args,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, FormulaExpr::Constant(_))
    }

    /// Nesting depth of the tree; a lone constant or variable has depth 1
    pub fn depth(&self) -> usize {
        ensure_sufficient_stack(|| match self {
            FormulaExpr::Constant(_) | FormulaExpr::Variable { .. } => 1,
            FormulaExpr::BinaryOp { left, right, .. } => 1 + left.depth().max(right.depth()),
            FormulaExpr::Call { args, .. } => {
                1 + args.iter().map(FormulaExpr::depth).max().unwrap_or(0)
            }
        })
    }

    /// Structural equality that compares numbers by identity
    ///
    /// Unlike `==`, a NaN constant equals any other NaN constant, and `0`
    /// differs from `-0`.
    pub fn same_structure(&self, other: &FormulaExpr) -> bool {
        ensure_sufficient_stack(|| match (self, other) {
            (FormulaExpr::Constant(a), FormulaExpr::Constant(b)) => same_value(a, b),
            (
                FormulaExpr::Variable { name, range },
                FormulaExpr::Variable {
                    name: other_name,
                    range: other_range,
                },
            ) => {
                name == other_name
                    && match (range, other_range) {
                        (None, None) => true,
                        (Some(a), Some(b)) => {
                            same_bound(&a.lower, &b.lower) && same_bound(&a.upper, &b.upper)
                        }
                        _ => false,
                    }
            }
            (
                FormulaExpr::BinaryOp { op, left, right },
                FormulaExpr::BinaryOp {
                    op: other_op,
                    left: other_left,
                    right: other_right,
                },
            ) => {
                op == other_op
                    && left.same_structure(other_left)
                    && right.same_structure(other_right)
            }
            (
                FormulaExpr::Call { name, args },
                FormulaExpr::Call {
                    name: other_name,
                    args: other_args,
                },
            ) => {
                name == other_name
                    && args.len() == other_args.len()
                    && args
                        .iter()
                        .zip(other_args)
                        .all(|(a, b)| a.same_structure(b))
            }
            _ => false,
        })
    }

    fn has_children(&self) -> bool {
        matches!(self, FormulaExpr::BinaryOp { .. } | FormulaExpr::Call { .. })
    }
}

/// Nested nodes are released from a work list rather than by recursion, so
/// dropping a tree takes constant stack whatever its depth
impl Drop for FormulaExpr {
    fn drop(&mut self) {
        if !self.has_children() {
            return;
        }

        let mut pending = Vec::new();
        detach_children(self, &mut pending);
        while let Some(mut expr) = pending.pop() {
            detach_children(&mut expr, &mut pending);
        }
    }
}

fn detach_children(expr: &mut FormulaExpr, pending: &mut Vec<FormulaExpr>) {
    match expr {
        FormulaExpr::BinaryOp { left, right, .. } => {
            for child in [left, right] {
                if child.has_children() {
                    let placeholder = FormulaExpr::Constant(Value::Undefined);
                    pending.push(std::mem::replace(&mut **child, placeholder));
                }
            }
        }
        FormulaExpr::Call { args, .. } => {
            pending.extend(args.drain(..).filter(FormulaExpr::has_children));
        }
        FormulaExpr::Constant(_) | FormulaExpr::Variable { .. } => {}
    }
}

fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => {
            a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan())
        }
        _ => a == b,
    }
}

fn same_bound(a: &Bound, b: &Bound) -> bool {
    match (a, b) {
        (Bound::Literal(a), Bound::Literal(b)) => same_value(a, b),
        _ => a == b,
    }
}

/// Range qualifier attached to a variable reference
///
/// `[A]|5|` sets both bounds to 5; `[A]|:5|` only sets the upper bound.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeQualifier {
    pub lower: Bound,
    pub upper: Bound,
}

impl RangeQualifier {
    pub fn new(lower: Bound, upper: Bound) -> Self {
        Self { lower, upper }
    }

    /// Both bounds set to the same value
    pub fn single(bound: Bound) -> Self {
        Self {
            lower: bound.clone(),
            upper: bound,
        }
    }
}

/// One side of a range qualifier
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Bound {
    #[default]
    Unspecified,
    /// Integer or text literal
    Literal(Value),
    /// The bound is the value of another variable, known only at evaluation time
    Dynamic(String),
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Power,
}

impl BinaryOperator {
    /// Binding strength; higher binds tighter
    pub fn precedence(self) -> u8 {
        match self {
            BinaryOperator::Add | BinaryOperator::Subtract => 1,
            BinaryOperator::Multiply | BinaryOperator::Divide => 2,
            BinaryOperator::Power => 3,
        }
    }

    pub fn is_right_associative(self) -> bool {
        self == BinaryOperator::Power
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Subtract => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
            BinaryOperator::Power => "^",
        }
    }

    /// Apply the operator to two evaluated operands
    ///
    /// Anything other than two numbers yields `Undefined`, as does division
    /// by zero. This is the single arithmetic rule every backend follows.
    pub fn apply(self, left: &Value, right: &Value) -> Value {
        match (left, right) {
            (Value::Number(l), Value::Number(r)) => self.apply_numbers(*l, *r),
            _ => Value::Undefined,
        }
    }

    /// Arithmetic over two numbers
    pub fn apply_numbers(self, l: f64, r: f64) -> Value {
        match self {
            BinaryOperator::Add => Value::Number(l + r),
            BinaryOperator::Subtract => Value::Number(l - r),
            BinaryOperator::Multiply => Value::Number(l * r),
            BinaryOperator::Divide => {
                if r == 0.0 {
                    Value::Undefined
                } else {
                    Value::Number(l / r)
                }
            }
            BinaryOperator::Power => Value::Number(l.powf(r)),
        }
    }
}

impl fmt::Display for FormulaExpr {
    /// Formula text that parses back to the same tree
    ///
    /// Constants that have no literal syntax (undefined, NaN, infinities) are
    /// written in a readable but unparseable form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        ensure_sufficient_stack(|| match self {
            FormulaExpr::Constant(value) => write_literal(f, value),
            FormulaExpr::Variable { name, range } => {
                write!(f, "[{}]", name)?;
                if let Some(range) = range {
                    write!(f, "{}", range)?;
                }
                Ok(())
            }
            FormulaExpr::BinaryOp { op, left, right } => {
                let left_parens = needs_parens(left, *op, op.is_right_associative());
                let right_parens = needs_parens(right, *op, !op.is_right_associative());
                write_operand(f, left, left_parens)?;
                f.write_str(op.symbol())?;
                write_operand(f, right, right_parens)
            }
            FormulaExpr::Call { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
        })
    }
}

impl fmt::Display for RangeQualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lower == self.upper {
            return write!(f, "|{}|", self.lower);
        }
        write!(f, "|{}:{}|", self.lower, self.upper)
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bound::Unspecified => Ok(()),
            Bound::Literal(value) => write_literal(f, value),
            Bound::Dynamic(name) => write!(f, "[{}]", name),
        }
    }
}

fn needs_parens(child: &FormulaExpr, parent: BinaryOperator, on_equal: bool) -> bool {
    match child {
        FormulaExpr::BinaryOp { op, .. } => {
            op.precedence() < parent.precedence()
                || (op.precedence() == parent.precedence() && on_equal)
        }
        _ => false,
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, expr: &FormulaExpr, parens: bool) -> fmt::Result {
    if parens {
        write!(f, "({})", expr)
    } else {
        write!(f, "{}", expr)
    }
}

fn write_literal(f: &mut fmt::Formatter<'_>, value: &Value) -> fmt::Result {
    match value {
        Value::Text(s) => write!(f, "\"{}\"", s.replace('"', "\"\"")),
        other => write!(f, "{}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_arithmetic() {
        let two = Value::Number(2.0);
        let three = Value::Number(3.0);
        assert_eq!(BinaryOperator::Add.apply(&two, &three), Value::Number(5.0));
        assert_eq!(BinaryOperator::Subtract.apply(&two, &three), Value::Number(-1.0));
        assert_eq!(BinaryOperator::Multiply.apply(&two, &three), Value::Number(6.0));
        assert_eq!(BinaryOperator::Divide.apply(&three, &two), Value::Number(1.5));
        assert_eq!(BinaryOperator::Power.apply(&two, &three), Value::Number(8.0));
    }

    #[test]
    fn test_apply_undefined_propagation() {
        let one = Value::Number(1.0);
        for op in [
            BinaryOperator::Add,
            BinaryOperator::Subtract,
            BinaryOperator::Multiply,
            BinaryOperator::Divide,
            BinaryOperator::Power,
        ] {
            assert_eq!(op.apply(&one, &Value::Undefined), Value::Undefined);
            assert_eq!(op.apply(&Value::Undefined, &one), Value::Undefined);
            assert_eq!(op.apply(&Value::from("x"), &one), Value::Undefined);
        }
    }

    #[test]
    fn test_divide_by_zero() {
        let zero = Value::Number(0.0);
        assert_eq!(
            BinaryOperator::Divide.apply(&Value::Number(1.0), &zero),
            Value::Undefined
        );
        assert_eq!(
            BinaryOperator::Divide.apply(&Value::Number(1.0), &Value::Number(-0.0)),
            Value::Undefined
        );
    }

    #[test]
    fn test_fractional_power() {
        let result = BinaryOperator::Power.apply(&Value::Number(4.0), &Value::Number(0.5));
        assert_eq!(result, Value::Number(2.0));
        let result = BinaryOperator::Power.apply(&Value::Number(2.0), &Value::Number(-1.0));
        assert_eq!(result, Value::Number(0.5));
    }

    #[test]
    fn test_depth() {
        assert_eq!(FormulaExpr::number(1.0).depth(), 1);
        let expr = FormulaExpr::binary(
            BinaryOperator::Add,
            FormulaExpr::number(1.0),
            FormulaExpr::call("SQRT", vec![FormulaExpr::variable("A")]),
        );
        assert_eq!(expr.depth(), 3);
        assert_eq!(FormulaExpr::call("PI", vec![]).depth(), 1);
    }

    #[test]
    fn test_display_parentheses() {
        // (1+2)*3
        let expr = FormulaExpr::binary(
            BinaryOperator::Multiply,
            FormulaExpr::binary(
                BinaryOperator::Add,
                FormulaExpr::number(1.0),
                FormulaExpr::number(2.0),
            ),
            FormulaExpr::number(3.0),
        );
        assert_eq!(expr.to_string(), "(1+2)*3");

        // 1-(2-3)
        let expr = FormulaExpr::binary(
            BinaryOperator::Subtract,
            FormulaExpr::number(1.0),
            FormulaExpr::binary(
                BinaryOperator::Subtract,
                FormulaExpr::number(2.0),
                FormulaExpr::number(3.0),
            ),
        );
        assert_eq!(expr.to_string(), "1-(2-3)");

        // 2^3^2 is right associative, (2^3)^2 is not
        let right = FormulaExpr::binary(
            BinaryOperator::Power,
            FormulaExpr::number(2.0),
            FormulaExpr::binary(
                BinaryOperator::Power,
                FormulaExpr::number(3.0),
                FormulaExpr::number(2.0),
            ),
        );
        assert_eq!(right.to_string(), "2^3^2");
        let left = FormulaExpr::binary(
            BinaryOperator::Power,
            FormulaExpr::binary(
                BinaryOperator::Power,
                FormulaExpr::number(2.0),
                FormulaExpr::number(3.0),
            ),
            FormulaExpr::number(2.0),
        );
        assert_eq!(left.to_string(), "(2^3)^2");
    }

    #[test]
    fn test_display_variables_and_calls() {
        let expr = FormulaExpr::call(
            "SUM",
            vec![
                FormulaExpr::Variable {
                    name: "A".into(),
                    range: Some(RangeQualifier::new(
                        Bound::Dynamic("B".into()),
                        Bound::Literal(Value::Number(0.0)),
                    )),
                },
                FormulaExpr::Variable {
                    name: "C".into(),
                    range: Some(RangeQualifier::single(Bound::Literal(Value::Number(42.0)))),
                },
                FormulaExpr::text("say \"hi\""),
            ],
        );
        assert_eq!(
            expr.to_string(),
            "SUM([A]|[B]:0|, [C]|42|, \"say \"\"hi\"\"\")"
        );
    }

    #[test]
    fn test_drop_deep_tree() {
        let mut expr = FormulaExpr::number(1.0);
        for i in 0..100_000 {
            expr = if i % 2 == 0 {
                FormulaExpr::binary(BinaryOperator::Add, expr, FormulaExpr::number(1.0))
            } else {
                FormulaExpr::call("ABS", vec![expr])
            };
        }
        assert_eq!(expr.depth(), 100_001);
        drop(expr);
    }

    #[test]
    fn test_same_structure() {
        let nan = FormulaExpr::number(f64::NAN);
        assert_ne!(nan, nan.clone());
        assert!(nan.same_structure(&nan.clone()));

        assert!(!FormulaExpr::number(0.0).same_structure(&FormulaExpr::number(-0.0)));

        let ranged = |lower: f64| FormulaExpr::Variable {
            name: "A".into(),
            range: Some(RangeQualifier::new(
                Bound::Literal(Value::Number(lower)),
                Bound::Dynamic("B".into()),
            )),
        };
        assert!(ranged(1.0).same_structure(&ranged(1.0)));
        assert!(!ranged(1.0).same_structure(&ranged(2.0)));

        let power = |name: &str| {
            let arg = FormulaExpr::binary(
                BinaryOperator::Power,
                FormulaExpr::variable(name),
                nan.clone(),
            );
            FormulaExpr::call("SQRT", vec![arg])
        };
        assert!(power("X").same_structure(&power("X")));
        assert!(!power("X").same_structure(&power("Y")));
        assert!(!FormulaExpr::variable("X").same_structure(&FormulaExpr::text("X")));
    }
}
