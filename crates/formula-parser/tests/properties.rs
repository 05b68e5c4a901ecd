//! Property-based tests for folding and backend agreement
//!
//! Formulas are generated as text, so every case also exercises the parser.

use formula_parser::{
    compile, compile_native, fold, interpret, parse_formula, FormulaResult, FunctionRegistry,
    MapVariableProvider, Value,
};
use proptest::prelude::*;

// ============================================================================
// Strategies for generating formulas
// ============================================================================

/// Numeric literals, including negative ones and zero
fn arb_number() -> impl Strategy<Value = String> {
    prop_oneof![
        (0u32..100).prop_map(|n| n.to_string()),
        (0.0f64..100.0).prop_map(|f| format!("{:.2}", f)),
        (-50i32..0).prop_map(|n| n.to_string()),
        Just("0".to_string()),
    ]
}

/// Variable references: present, missing, text-valued and range-qualified
fn arb_variable() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("[A]".to_string()),
        Just("[B]".to_string()),
        Just("C".to_string()),
        Just("[Missing]".to_string()),
        Just("[Label]".to_string()),
        Just("[A]|-1:0|".to_string()),
        Just("[B]|[A]|".to_string()),
    ]
}

fn arb_leaf() -> impl Strategy<Value = String> {
    prop_oneof![
        3 => arb_number(),
        2 => arb_variable(),
        1 => Just("\"text\"".to_string()),
    ]
}

fn arb_operator() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just("+"), Just("-"), Just("*"), Just("/"), Just("^")]
}

/// Formulas built from arithmetic, parentheses and deterministic built-ins
fn arb_formula() -> impl Strategy<Value = String> {
    arb_leaf().prop_recursive(6, 64, 4, |inner| {
        prop_oneof![
            (inner.clone(), arb_operator(), inner.clone())
                .prop_map(|(l, op, r)| format!("{} {} {}", l, op, r)),
            inner.clone().prop_map(|e| format!("({})", e)),
            inner.clone().prop_map(|e| format!("-({})", e)),
            inner.clone().prop_map(|e| format!("SQRT({})", e)),
            inner.clone().prop_map(|e| format!("ABS({})", e)),
            (inner.clone(), 0u32..3).prop_map(|(e, digits)| format!("ROUND({}, {})", e, digits)),
            prop::collection::vec(inner.clone(), 1..4)
                .prop_map(|args| format!("SUM({})", args.join(", "))),
            prop::collection::vec(inner.clone(), 1..4)
                .prop_map(|args| format!("MAX({})", args.join(", "))),
            prop::collection::vec(inner, 0..3)
                .prop_map(|args| format!("COUNT({})", args.join(", "))),
        ]
    })
}

// ============================================================================
// Helpers
// ============================================================================

fn variables() -> MapVariableProvider {
    MapVariableProvider::from_iter([
        ("A", Value::Number(2.5)),
        ("B", Value::Number(-4.0)),
        ("C", Value::Number(0.0)),
        ("Label", Value::from("label")),
    ])
}

/// Equality that treats NaN as equal to itself
fn same(left: &FormulaResult<Value>, right: &FormulaResult<Value>) -> bool {
    match (left, right) {
        (Ok(Value::Number(l)), Ok(Value::Number(r))) => {
            (l == r && l.is_sign_negative() == r.is_sign_negative()) || (l.is_nan() && r.is_nan())
        }
        (Ok(l), Ok(r)) => l == r,
        (Err(l), Err(r)) => l == r,
        _ => false,
    }
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Every generated formula parses and interprets without panicking
    #[test]
    fn parsed_formulas_interpret(formula in arb_formula()) {
        let expr = parse_formula(&formula).unwrap();
        let vars = variables();
        let _ = interpret(&expr, &vars, FunctionRegistry::global());
    }

    /// Folding never changes the result of interpretation
    #[test]
    fn folding_preserves_semantics(formula in arb_formula()) {
        let expr = parse_formula(&formula).unwrap();
        let vars = variables();
        let functions = FunctionRegistry::global();

        let direct = interpret(&expr, &vars, functions);
        let folded = interpret(&fold(&expr, functions), &vars, functions);
        prop_assert!(same(&direct, &folded), "{}: {:?} vs {:?}", formula, direct, folded);
    }

    /// Folding an already folded tree changes nothing
    #[test]
    fn folding_is_idempotent(formula in arb_formula()) {
        let expr = parse_formula(&formula).unwrap();
        let functions = FunctionRegistry::global();

        let once = fold(&expr, functions);
        let twice = fold(&once, functions);
        prop_assert!(once.same_structure(&twice), "{}: {} vs {}", formula, once, twice);
    }

    /// Interpreter, closure compiler and native compiler agree
    #[test]
    fn backends_agree(formula in arb_formula()) {
        let expr = parse_formula(&formula).unwrap();
        let vars = variables();
        let functions = FunctionRegistry::global();

        let interpreted = interpret(&expr, &vars, functions);
        let closure = compile(&expr).evaluate(&vars, functions);
        let native = compile_native(&expr).unwrap().evaluate(&vars, functions);

        prop_assert!(same(&interpreted, &closure), "{}: closure {:?} vs {:?}", formula, closure, interpreted);
        prop_assert!(same(&interpreted, &native), "{}: native {:?} vs {:?}", formula, native, interpreted);
    }

    /// Formatting a tree gives text that parses back to an equivalent tree
    #[test]
    fn display_reparses(formula in arb_formula()) {
        let expr = parse_formula(&formula).unwrap();
        let reparsed = parse_formula(&expr.to_string()).unwrap();
        prop_assert_eq!(expr.to_string(), reparsed.to_string());
    }
}
