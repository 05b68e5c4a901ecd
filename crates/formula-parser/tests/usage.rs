//! End-to-end usage of the formula engine through its public API

use formula_parser::{
    compile, compile_native, extract_dependencies, extract_dependencies_with_ranges, fold,
    interpret, parse_formula, CompositeFunctionProvider, CompositeVariableProvider, Dependency,
    ExpressionVariableProvider, FormulaError, FormulaExpr, FunctionDef, FunctionImplementation,
    FunctionProvider, FunctionRegistry, MapVariableProvider, MutableVariableProvider,
    ResolvedRange, Value, VariableProvider,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

/// Evaluate with every backend and check they agree
fn evaluate_everywhere(
    expr: &FormulaExpr,
    vars: &dyn VariableProvider,
    functions: &dyn FunctionProvider,
) -> Value {
    let interpreted = interpret(expr, vars, functions).unwrap();
    let folded = interpret(&fold(expr, functions), vars, functions).unwrap();
    let closure = compile(expr).evaluate(vars, functions).unwrap();
    let native = compile_native(expr)
        .unwrap()
        .evaluate(vars, functions)
        .unwrap();

    assert_eq!(folded, interpreted, "folded interpretation of {expr}");
    assert_eq!(closure, interpreted, "closure evaluation of {expr}");
    assert_eq!(native, interpreted, "native evaluation of {expr}");
    interpreted
}

fn unbounded(name: &str) -> Dependency {
    Dependency {
        name: name.to_string(),
        lower: None,
        upper: None,
    }
}

struct MyFunc;

impl FunctionImplementation for MyFunc {
    fn name(&self) -> &str {
        "MyFunc"
    }

    fn validate(&self, args: &[Value]) -> Result<(), String> {
        if args.is_empty() {
            Ok(())
        } else {
            Err(format!("MyFunc takes no arguments, got {}", args.len()))
        }
    }

    fn execute(&self, _args: &[Value]) -> Value {
        Value::Number(42.0)
    }
}

struct MyFunctions;

impl FunctionProvider for MyFunctions {
    fn lookup(&self, name: &str) -> Option<&dyn FunctionImplementation> {
        (name == "MyFunc").then_some(&MyFunc as &dyn FunctionImplementation)
    }

    fn known_functions(&self) -> Vec<String> {
        vec!["MyFunc".to_string()]
    }
}

#[test]
fn test_constant_formula() {
    let expr = parse_formula("42").unwrap();
    let vars = MapVariableProvider::new();
    let result = evaluate_everywhere(&expr, &vars, FunctionRegistry::global());
    assert_eq!(result, Value::Number(42.0));
}

#[test]
fn test_deeply_nested_formula() {
    let formula = format!(
        "{}SQRT(Test){}{}",
        "(".repeat(500),
        ")",
        "* SQRT(Test))".repeat(499)
    );
    let expr = parse_formula(&formula).unwrap();
    let vars = MapVariableProvider::from_iter([("Test", 1.0)]);

    let result = evaluate_everywhere(&expr, &vars, FunctionRegistry::global());
    assert_eq!(result, Value::Number(1.0));
}

#[test]
fn test_very_deep_formula_lifecycle() {
    let depth = 100_000;
    let formula = format!("{}[X]{}", "(".repeat(depth), "+1)".repeat(depth));
    let vars = MapVariableProvider::from_iter([("X", 1.0)]);
    let functions = FunctionRegistry::global();
    let expected = Value::Number(depth as f64 + 1.0);

    let expr = parse_formula(&formula).unwrap();
    assert_eq!(interpret(&expr, &vars, functions).unwrap(), expected);
    assert_eq!(extract_dependencies(&expr).len(), 1);

    let folded = fold(&expr, functions);
    assert_eq!(interpret(&folded, &vars, functions).unwrap(), expected);

    let closure = compile(&expr);
    assert_eq!(closure.evaluate(&vars, functions).unwrap(), expected);

    drop(expr);
    drop(folded);
    drop(closure);
}

#[test]
fn test_custom_function_with_builtins() {
    let functions = CompositeFunctionProvider::with_builtins(Arc::new(MyFunctions));
    let expr = parse_formula("MyFunc() * SQRT(4)").unwrap();
    let vars = MapVariableProvider::new();

    let result = evaluate_everywhere(&expr, &vars, &functions);
    assert_eq!(result, Value::Number(84.0));

    // Without the custom provider the call is a hard error
    let err = interpret(&expr, &vars, FunctionRegistry::global()).unwrap_err();
    assert!(matches!(err, FormulaError::UnknownFunction(name) if name == "MyFunc"));
}

#[test]
fn test_custom_function_validation_is_surfaced() {
    let functions = CompositeFunctionProvider::with_builtins(Arc::new(MyFunctions));
    let expr = parse_formula("MyFunc(1)").unwrap();
    let vars = MapVariableProvider::new();

    for result in [
        interpret(&expr, &vars, &functions),
        compile(&expr).evaluate(&vars, &functions),
        compile_native(&expr).unwrap().evaluate(&vars, &functions),
    ] {
        match result {
            Err(FormulaError::Argument { function, message }) => {
                assert_eq!(function, "MyFunc");
                assert_eq!(message, "MyFunc takes no arguments, got 1");
            }
            other => panic!("expected argument error, got {other:?}"),
        }
    }
}

#[test]
fn test_dependency_extraction() {
    let deps = extract_dependencies_with_ranges(&parse_formula("[A]").unwrap());
    assert_eq!(deps.into_values().collect::<Vec<_>>(), vec![unbounded("A")]);

    let deps = extract_dependencies_with_ranges(&parse_formula("SUM([A]|-1:0|)").unwrap());
    assert_eq!(
        deps.into_values().collect::<Vec<_>>(),
        vec![Dependency {
            name: "A".to_string(),
            lower: Some(Value::Number(-1.0)),
            upper: Some(Value::Number(0.0)),
        }]
    );

    let deps = extract_dependencies_with_ranges(&parse_formula("SUM([A]|[B]:0|)").unwrap());
    assert_eq!(
        deps.into_values().collect::<Vec<_>>(),
        vec![
            Dependency {
                name: "A".to_string(),
                lower: None,
                upper: Some(Value::Number(0.0)),
            },
            unbounded("B"),
        ]
    );

    let deps = extract_dependencies_with_ranges(&parse_formula("[A]|42|").unwrap());
    assert_eq!(
        deps.into_values().collect::<Vec<_>>(),
        vec![Dependency {
            name: "A".to_string(),
            lower: Some(Value::Number(42.0)),
            upper: Some(Value::Number(42.0)),
        }]
    );
}

#[test]
fn test_dependencies_of_folded_formula() {
    let expr = parse_formula("SQRT(16) * [Price] + [Tax]|[Year]|").unwrap();
    let folded = fold(&expr, FunctionRegistry::global());

    let names: Vec<String> = extract_dependencies(&folded).into_iter().collect();
    assert_eq!(names, vec!["Price", "Tax", "Year"]);
    assert_eq!(extract_dependencies(&expr), extract_dependencies(&folded));
}

#[test]
fn test_expression_provider() {
    let vars =
        ExpressionVariableProvider::new([("A", "B*C"), ("B", "C*10"), ("C", "SQRT(4)*5")]);
    let a = vars.lookup("A", &ResolvedRange::UNBOUNDED).unwrap();
    assert_eq!(a, Some(Value::Number(1000.0)));

    let expr = parse_formula("[A] / [B]").unwrap();
    let result = evaluate_everywhere(&expr, &vars, FunctionRegistry::global());
    assert_eq!(result, Value::Number(10.0));
}

#[test]
fn test_expression_provider_cycle() {
    let vars = ExpressionVariableProvider::new([("A", "[B] + 1"), ("B", "[A] + 1")]);
    let err = vars.lookup("A", &ResolvedRange::UNBOUNDED).unwrap_err();
    match err {
        FormulaError::RecursionLimit { name, chain } => {
            assert_eq!(name, "A");
            assert_eq!(chain, vec!["A", "B", "A"]);
        }
        other => panic!("expected recursion limit, got {other:?}"),
    }

    // The same failure reaches callers of every backend
    let expr = parse_formula("[A] * 2").unwrap();
    let functions = FunctionRegistry::global();
    assert!(matches!(
        interpret(&expr, &vars, functions),
        Err(FormulaError::RecursionLimit { .. })
    ));
    assert!(matches!(
        compile(&expr).evaluate(&vars, functions),
        Err(FormulaError::RecursionLimit { .. })
    ));
    assert!(matches!(
        compile_native(&expr).unwrap().evaluate(&vars, functions),
        Err(FormulaError::RecursionLimit { .. })
    ));
}

#[test]
fn test_expressions_over_data() {
    let vars = CompositeVariableProvider::build(|handle| {
        vec![
            Box::new(
                ExpressionVariableProvider::new([
                    ("Gross", "[Net] * (1 + [Rate])"),
                    ("Rate", "[Percent] / 100"),
                ])
                .within(handle),
            ) as Box<dyn VariableProvider>,
            Box::new(MapVariableProvider::from_iter([
                ("Net", 200.0),
                ("Percent", 25.0),
            ])),
        ]
    });

    let expr = parse_formula("[Gross] - [Net]").unwrap();
    let result = evaluate_everywhere(&expr, vars.as_ref(), FunctionRegistry::global());
    assert_eq!(result, Value::Number(50.0));
}

#[test]
fn test_compiled_formula_sees_live_values() {
    let vars = MutableVariableProvider::new();
    let functions = FunctionRegistry::global();
    let expr = parse_formula("[X] * [X] + 1").unwrap();
    let closure = compile(&expr);
    let native = compile_native(&expr).unwrap();

    assert_eq!(closure.evaluate(&vars, functions).unwrap(), Value::Undefined);
    assert_eq!(native.evaluate(&vars, functions).unwrap(), Value::Undefined);

    for x in [0.0, 1.5, -3.0, 1e10] {
        vars.set("X", x);
        let expected = Value::Number(x * x + 1.0);
        assert_eq!(closure.evaluate(&vars, functions).unwrap(), expected);
        assert_eq!(native.evaluate(&vars, functions).unwrap(), expected);
    }
}

#[test]
fn test_undefined_propagation() {
    let vars = MapVariableProvider::from_iter([("Text", Value::from("abc"))]);
    let functions = FunctionRegistry::global();

    for formula in [
        "[Missing] + 1",
        "1 - [Missing]",
        "[Text] * 2",
        "2 ^ [Text]",
        "1 / 0",
        "([Missing] + 1) * 0",
        "SQRT(-1) + 1",
    ] {
        let expr = parse_formula(formula).unwrap();
        let result = evaluate_everywhere(&expr, &vars, functions);
        assert_eq!(result, Value::Undefined, "{formula}");
    }
}

#[test]
fn test_fold_keeps_nondeterministic_calls() {
    let functions = FunctionRegistry::global();
    let folded = fold(&parse_formula("RAND() * (2 + 3)").unwrap(), functions);
    assert_eq!(folded.to_string(), "RAND()*5");

    let folded = fold(&parse_formula("SUM(1, 2, SQRT(9))").unwrap(), functions);
    assert_eq!(folded, FormulaExpr::number(6.0));
}

#[test]
fn test_fold_keeps_argument_errors() {
    let functions = FunctionRegistry::global();
    let vars = MapVariableProvider::new();
    let expr = parse_formula("SQRT(1, 2) + 1").unwrap();
    let folded = fold(&expr, functions);

    assert_eq!(folded, expr);
    assert!(matches!(
        interpret(&folded, &vars, functions),
        Err(FormulaError::Argument { .. })
    ));
}

#[test]
fn test_custom_function_def() {
    fn double(args: &[Value]) -> Value {
        match args {
            [Value::Number(n)] => Value::Number(n * 2.0),
            _ => Value::Undefined,
        }
    }

    let mut registry = FunctionRegistry::empty();
    registry.register(FunctionDef::new("DOUBLE", 1, Some(1), double));
    let functions = CompositeFunctionProvider::new(vec![
        Arc::new(registry) as Arc<dyn FunctionProvider>,
        FunctionRegistry::shared(),
    ]);

    let expr = parse_formula("double(SQRT([X]))").unwrap();
    let vars = MapVariableProvider::from_iter([("X", 49.0)]);
    let result = evaluate_everywhere(&expr, &vars, &functions);
    assert_eq!(result, Value::Number(14.0));
}
