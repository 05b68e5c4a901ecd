//! Host side of natively compiled formulas
//!
//! Generated code keeps numbers in registers as `(tag, payload)` pairs and
//! calls back into the functions below for everything that needs Rust:
//! variable lookups, function calls, text constants and `^`. Each callback
//! receives a pointer to the evaluation [`Frame`], writes its payload into
//! the frame's first field and returns the tag.

use crate::ast::RangeQualifier;
use crate::error::{FormulaError, FormulaResult};
use crate::functions::FunctionProvider;
use crate::interpreter::call_function;
use crate::value::Value;
use crate::variables::{resolve_variable, VariableProvider};
use cranelift_jit::JITBuilder;
use std::any::Any;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

pub(crate) const TAG_NUMBER: i32 = 0;
/// Payload is an index into the frame's text table
pub(crate) const TAG_TEXT: i32 = 1;
pub(crate) const TAG_UNDEFINED: i32 = 2;
/// A host callback failed; the cause is in the frame
pub(crate) const TAG_ERROR: i32 = -1;

pub(crate) const SYMBOL_VARIABLE: &str = "formula_host_variable";
pub(crate) const SYMBOL_PUSH_ARG: &str = "formula_host_push_arg";
pub(crate) const SYMBOL_CALL: &str = "formula_host_call";
pub(crate) const SYMBOL_TEXT: &str = "formula_host_text";
pub(crate) const SYMBOL_POW: &str = "formula_host_pow";

/// Entry point of a compiled formula: takes the frame, returns the result tag
pub(crate) type EntryFn = unsafe extern "C" fn(*mut u8) -> i32;

/// Side tables referenced by index from generated code
#[derive(Debug, Default)]
pub(crate) struct Program {
    pub variables: Vec<VariableSite>,
    pub calls: Vec<String>,
    pub texts: Vec<Value>,
}

#[derive(Debug)]
pub(crate) struct VariableSite {
    pub name: String,
    pub range: Option<RangeQualifier>,
}

enum Failure {
    Error(FormulaError),
    Panic(Box<dyn Any + Send + 'static>),
}

/// Per-evaluation state shared between generated code and the host
#[repr(C)]
pub(crate) struct Frame<'a> {
    /// Payload of the last callback; generated code loads it from offset 0
    payload: f64,
    program: &'a Program,
    variables: &'a dyn VariableProvider,
    functions: &'a dyn FunctionProvider,
    /// Pending call arguments, innermost call last
    args: Vec<Value>,
    texts: Vec<String>,
    failure: Option<Failure>,
}

impl<'a> Frame<'a> {
    fn new(
        program: &'a Program,
        variables: &'a dyn VariableProvider,
        functions: &'a dyn FunctionProvider,
    ) -> Self {
        Self {
            payload: 0.0,
            program,
            variables,
            functions,
            args: Vec::new(),
            texts: Vec::new(),
            failure: None,
        }
    }

    /// # Safety
    ///
    /// `ptr` must be the frame pointer passed to the running formula.
    unsafe fn from_raw<'f>(ptr: *mut u8) -> &'f mut Frame<'f> {
        &mut *(ptr as *mut Frame<'f>)
    }

    /// Encode a value as a tag, leaving its payload in the frame
    fn store(&mut self, value: Value) -> i32 {
        match value {
            Value::Number(n) => {
                self.payload = n;
                TAG_NUMBER
            }
            Value::Text(s) => {
                self.payload = self.texts.len() as f64;
                self.texts.push(s);
                TAG_TEXT
            }
            Value::Undefined => {
                self.payload = 0.0;
                TAG_UNDEFINED
            }
        }
    }

    fn load(&self, tag: i32, payload: f64) -> Value {
        match tag {
            TAG_NUMBER => Value::Number(payload),
            TAG_TEXT => self
                .texts
                .get(payload as usize)
                .map_or(Value::Undefined, |s| Value::Text(s.clone())),
            _ => Value::Undefined,
        }
    }

    /// Run a fallible callback body, parking errors and panics in the frame
    ///
    /// Unwinding must not cross the generated code, so panics are caught
    /// here and resumed once control is back in [`run`].
    fn guarded(&mut self, body: impl FnOnce(&mut Self) -> FormulaResult<i32>) -> i32 {
        match catch_unwind(AssertUnwindSafe(|| body(self))) {
            Ok(Ok(tag)) => tag,
            Ok(Err(err)) => {
                self.failure = Some(Failure::Error(err));
                TAG_ERROR
            }
            Err(panic) => {
                self.failure = Some(Failure::Panic(panic));
                TAG_ERROR
            }
        }
    }
}

/// Evaluate a compiled formula
pub(crate) fn run(
    entry: EntryFn,
    program: &Program,
    variables: &dyn VariableProvider,
    functions: &dyn FunctionProvider,
) -> FormulaResult<Value> {
    let mut frame = Frame::new(program, variables, functions);

    // SAFETY: `entry` was generated together with `program` and only reaches
    // the frame through the callbacks in this module.
    let tag = unsafe { entry(&mut frame as *mut Frame<'_> as *mut u8) };

    if tag == TAG_ERROR {
        return match frame.failure.take() {
            Some(Failure::Error(err)) => Err(err),
            Some(Failure::Panic(panic)) => resume_unwind(panic),
            None => Err(FormulaError::Native(
                "compiled formula failed without a cause".to_string(),
            )),
        };
    }
    Ok(frame.load(tag, frame.payload))
}

pub(crate) fn register_symbols(builder: &mut JITBuilder) {
    builder.symbol(SYMBOL_VARIABLE, host_variable as *const u8);
    builder.symbol(SYMBOL_PUSH_ARG, host_push_arg as *const u8);
    builder.symbol(SYMBOL_CALL, host_call as *const u8);
    builder.symbol(SYMBOL_TEXT, host_text as *const u8);
    builder.symbol(SYMBOL_POW, host_pow as *const u8);
}

extern "C" fn host_variable(frame: *mut u8, site: u32) -> i32 {
    // SAFETY: called from generated code with its own frame pointer
    let frame = unsafe { Frame::from_raw(frame) };
    frame.guarded(|frame| {
        let program = frame.program;
        let site = &program.variables[site as usize];
        let value = resolve_variable(&site.name, site.range.as_ref(), frame.variables)?;
        Ok(frame.store(value))
    })
}

extern "C" fn host_push_arg(frame: *mut u8, tag: i32, payload: f64) {
    // SAFETY: called from generated code with its own frame pointer
    let frame = unsafe { Frame::from_raw(frame) };
    let value = frame.load(tag, payload);
    frame.args.push(value);
}

extern "C" fn host_call(frame: *mut u8, site: u32, argc: u32) -> i32 {
    // SAFETY: called from generated code with its own frame pointer
    let frame = unsafe { Frame::from_raw(frame) };
    frame.guarded(|frame| {
        let program = frame.program;
        let name = &program.calls[site as usize];
        let first = frame.args.len().saturating_sub(argc as usize);
        let args = frame.args.split_off(first);
        let value = call_function(name, &args, frame.functions)?;
        Ok(frame.store(value))
    })
}

extern "C" fn host_text(frame: *mut u8, index: u32) -> i32 {
    // SAFETY: called from generated code with its own frame pointer
    let frame = unsafe { Frame::from_raw(frame) };
    let program = frame.program;
    match program.texts.get(index as usize) {
        Some(value) => frame.store(value.clone()),
        None => frame.store(Value::Undefined),
    }
}

extern "C" fn host_pow(base: f64, exponent: f64) -> f64 {
    base.powf(exponent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::FunctionRegistry;
    use crate::variables::MapVariableProvider;

    #[test]
    fn test_store_and_load() {
        let program = Program::default();
        let vars = MapVariableProvider::new();
        let mut frame = Frame::new(&program, &vars, FunctionRegistry::global());

        let tag = frame.store(Value::Number(2.5));
        assert_eq!(tag, TAG_NUMBER);
        assert_eq!(frame.load(tag, frame.payload), Value::Number(2.5));

        let tag = frame.store(Value::from("abc"));
        assert_eq!(tag, TAG_TEXT);
        assert_eq!(frame.load(tag, frame.payload), Value::from("abc"));

        let tag = frame.store(Value::Undefined);
        assert_eq!(frame.load(tag, frame.payload), Value::Undefined);
    }

    #[test]
    fn test_payload_is_first_field() {
        let program = Program::default();
        let vars = MapVariableProvider::new();
        let frame = Frame::new(&program, &vars, FunctionRegistry::global());
        let base = &frame as *const Frame<'_> as usize;
        let payload = &frame.payload as *const f64 as usize;
        assert_eq!(payload - base, 0);
    }

    #[test]
    fn test_guarded_catches_panics() {
        let program = Program::default();
        let vars = MapVariableProvider::new();
        let mut frame = Frame::new(&program, &vars, FunctionRegistry::global());

        let tag = frame.guarded(|_| panic!("boom"));
        assert_eq!(tag, TAG_ERROR);
        assert!(matches!(frame.failure, Some(Failure::Panic(_))));

        let tag = frame.guarded(|_| Err(FormulaError::UnknownFunction("F".into())));
        assert_eq!(tag, TAG_ERROR);
        assert!(matches!(frame.failure, Some(Failure::Error(_))));
    }

    #[test]
    fn test_host_call_consumes_arguments() {
        let program = Program {
            calls: vec!["SUM".to_string()],
            ..Program::default()
        };
        let vars = MapVariableProvider::new();
        let mut frame = Frame::new(&program, &vars, FunctionRegistry::global());
        let ptr = &mut frame as *mut Frame<'_> as *mut u8;

        host_push_arg(ptr, TAG_NUMBER, 99.0);
        host_push_arg(ptr, TAG_NUMBER, 1.0);
        host_push_arg(ptr, TAG_NUMBER, 2.0);
        let tag = host_call(ptr, 0, 2);

        assert_eq!(tag, TAG_NUMBER);
        assert_eq!(frame.payload, 3.0);
        assert_eq!(frame.args, vec![Value::Number(99.0)]);
    }
}
