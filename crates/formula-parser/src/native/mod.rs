//! Native compilation
//!
//! Translates a formula into machine code with Cranelift. The generated
//! function evaluates arithmetic in registers and calls back into the host
//! for variables, functions and text, so it follows the same rules as the
//! interpreter while skipping per-node dispatch.
//!
//! Code generation recurses per nesting level and produces one basic block
//! per fallible callback, so it has a depth ceiling of its own
//! ([`NativeOptions::max_depth`]). Deeper formulas are rejected at compile
//! time with [`FormulaError::NestingTooDeep`].

mod codegen;
mod runtime;

use crate::ast::FormulaExpr;
use crate::error::{FormulaError, FormulaResult};
use crate::functions::FunctionProvider;
use crate::interpreter::Evaluate;
use crate::value::Value;
use crate::variables::VariableProvider;
use cranelift::codegen::settings::{self, Configurable};
use cranelift_jit::{JITBuilder, JITModule};
use runtime::{EntryFn, Program};
use std::fmt;
use std::mem::ManuallyDrop;
use std::time::Instant;

/// Cranelift optimization level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    /// Fastest compilation
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

impl OptLevel {
    fn as_str(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

/// Native compilation options
#[derive(Debug, Clone)]
pub struct NativeOptions {
    /// Deepest formula accepted (default: 512)
    pub max_depth: usize,
    /// Optimization level (default: speed)
    pub opt_level: OptLevel,
}

impl Default for NativeOptions {
    fn default() -> Self {
        Self {
            max_depth: 512,
            opt_level: OptLevel::Speed,
        }
    }
}

pub(crate) fn native_error(err: impl fmt::Display) -> FormulaError {
    FormulaError::Native(err.to_string())
}

/// Compile a formula to machine code with default options
pub fn compile_native(expr: &FormulaExpr) -> FormulaResult<NativeFormula> {
    NativeCompiler::default().compile(expr)
}

/// Compiles formulas to machine code
#[derive(Debug, Clone, Default)]
pub struct NativeCompiler {
    options: NativeOptions,
}

impl NativeCompiler {
    pub fn new(options: NativeOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &NativeOptions {
        &self.options
    }

    pub fn compile(&self, expr: &FormulaExpr) -> FormulaResult<NativeFormula> {
        let depth = expr.depth();
        if depth > self.options.max_depth {
            return Err(FormulaError::NestingTooDeep {
                depth,
                limit: self.options.max_depth,
            });
        }

        let started = Instant::now();
        let mut code = JitCode::new(self.create_module()?);
        let (func_id, program) = codegen::define_formula(&mut code.module, expr)?;
        code.module.finalize_definitions().map_err(native_error)?;
        let address = code.module.get_finalized_function(func_id);

        // SAFETY: the function was defined with the `EntryFn` signature and
        // lives as long as `code`, which the formula owns.
        let entry = unsafe { std::mem::transmute::<*const u8, EntryFn>(address) };

        tracing::debug!(
            depth,
            variables = program.variables.len(),
            calls = program.calls.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "compiled formula to native code"
        );

        Ok(NativeFormula {
            entry,
            program,
            depth,
            _code: code,
        })
    }

    fn create_module(&self) -> FormulaResult<JITModule> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", self.options.opt_level.as_str())
            .map_err(native_error)?;
        flag_builder
            .set("use_colocated_libcalls", "false")
            .map_err(native_error)?;
        flag_builder.set("is_pic", "false").map_err(native_error)?;

        let isa_builder = cranelift_native::builder().map_err(native_error)?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(native_error)?;

        let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        runtime::register_symbols(&mut builder);
        Ok(JITModule::new(builder))
    }
}

/// Executable memory of one compiled formula, released on drop
struct JitCode {
    module: ManuallyDrop<JITModule>,
}

impl JitCode {
    fn new(module: JITModule) -> Self {
        Self {
            module: ManuallyDrop::new(module),
        }
    }
}

impl Drop for JitCode {
    fn drop(&mut self) {
        // SAFETY: the module is never used again, and the only pointer into
        // its code is held by the `NativeFormula` being dropped.
        unsafe {
            let module = ManuallyDrop::take(&mut self.module);
            module.free_memory();
        }
    }
}

// SAFETY: the module is only touched during compilation and drop; compiled
// code is immutable and reentrant.
unsafe impl Send for JitCode {}
unsafe impl Sync for JitCode {}

/// A formula compiled to machine code
///
/// ```rust
/// use formula_parser::{compile_native, parse_formula, FunctionRegistry, MapVariableProvider, Value};
///
/// let expr = parse_formula("[Var1] ^ [Var2] / 4").unwrap();
/// let formula = compile_native(&expr).unwrap();
/// let vars = MapVariableProvider::from_iter([("Var1", 2.0), ("Var2", 4.0)]);
/// assert_eq!(formula.evaluate(&vars, FunctionRegistry::global()).unwrap(), Value::Number(4.0));
/// ```
pub struct NativeFormula {
    entry: EntryFn,
    program: Program,
    depth: usize,
    _code: JitCode,
}

impl NativeFormula {
    pub fn evaluate(
        &self,
        variables: &dyn VariableProvider,
        functions: &dyn FunctionProvider,
    ) -> FormulaResult<Value> {
        runtime::run(self.entry, &self.program, variables, functions)
    }

    /// Nesting depth of the compiled formula
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl Evaluate for NativeFormula {
    fn evaluate(
        &self,
        variables: &dyn VariableProvider,
        functions: &dyn FunctionProvider,
    ) -> FormulaResult<Value> {
        runtime::run(self.entry, &self.program, variables, functions)
    }
}

impl fmt::Debug for NativeFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFormula")
            .field("depth", &self.depth)
            .field("variables", &self.program.variables.len())
            .field("calls", &self.program.calls.len())
            .finish_non_exhaustive()
    }
}
