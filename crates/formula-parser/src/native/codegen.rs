//! Formula AST to Cranelift IR
//!
//! Every node produces a `(tag: i32, payload: f64)` pair. Arithmetic is
//! emitted inline and branch free: the payload is computed unconditionally
//! and `select` picks either the number or `Undefined` depending on the
//! operand tags. Only callbacks that can fail branch to the shared error
//! exit.

use super::runtime::{
    Program, VariableSite, SYMBOL_CALL, SYMBOL_POW, SYMBOL_PUSH_ARG, SYMBOL_TEXT,
    SYMBOL_VARIABLE, TAG_ERROR, TAG_NUMBER, TAG_UNDEFINED,
};
use super::native_error;
use crate::ast::{BinaryOperator, FormulaExpr};
use crate::error::FormulaResult;
use crate::stack::ensure_sufficient_stack;
use crate::value::Value;
use cranelift::codegen::ir::{FuncRef, Function};
use cranelift::prelude::{
    types, AbiParam, Block, FloatCC, FunctionBuilder, FunctionBuilderContext, InstBuilder, IntCC,
    MemFlags, Type, Value as IrValue,
};
use cranelift_jit::JITModule;
use cranelift_module::{FuncId, Linkage, Module};

/// Callbacks imported into a formula function
#[derive(Clone, Copy)]
struct HostRefs {
    variable: FuncRef,
    push_arg: FuncRef,
    call: FuncRef,
    text: FuncRef,
    pow: FuncRef,
}

impl HostRefs {
    fn declare(module: &mut JITModule, func: &mut Function) -> FormulaResult<Self> {
        let ptr = module.target_config().pointer_type();
        let mut import = |name: &str, params: &[Type], returns: &[Type]| -> FormulaResult<FuncRef> {
            let mut sig = module.make_signature();
            sig.params.extend(params.iter().map(|t| AbiParam::new(*t)));
            sig.returns.extend(returns.iter().map(|t| AbiParam::new(*t)));
            let id = module
                .declare_function(name, Linkage::Import, &sig)
                .map_err(native_error)?;
            Ok(module.declare_func_in_func(id, func))
        };

        Ok(Self {
            variable: import(SYMBOL_VARIABLE, &[ptr, types::I32], &[types::I32])?,
            push_arg: import(SYMBOL_PUSH_ARG, &[ptr, types::I32, types::F64], &[])?,
            call: import(SYMBOL_CALL, &[ptr, types::I32, types::I32], &[types::I32])?,
            text: import(SYMBOL_TEXT, &[ptr, types::I32], &[types::I32])?,
            pow: import(SYMBOL_POW, &[types::F64, types::F64], &[types::F64])?,
        })
    }
}

/// Define the function for `expr` in `module`
///
/// Returns the function and the side tables its code indexes into.
pub(crate) fn define_formula(
    module: &mut JITModule,
    expr: &FormulaExpr,
) -> FormulaResult<(FuncId, Program)> {
    let ptr = module.target_config().pointer_type();
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(ptr));
    sig.returns.push(AbiParam::new(types::I32));

    let func_id = module
        .declare_function("formula", Linkage::Local, &sig)
        .map_err(native_error)?;

    let mut ctx = module.make_context();
    ctx.func.signature = sig;
    let host = HostRefs::declare(module, &mut ctx.func)?;

    let mut program = Program::default();
    let mut builder_ctx = FunctionBuilderContext::new();
    {
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        let frame = builder.block_params(entry)[0];

        let mut translator = Translator {
            builder,
            host,
            frame,
            error_block: None,
            program: &mut program,
        };
        let (tag, payload) = translator.translate(expr);
        translator.finish(tag, payload);
    }

    module
        .define_function(func_id, &mut ctx)
        .map_err(native_error)?;
    module.clear_context(&mut ctx);

    Ok((func_id, program))
}

struct Translator<'a, 'f> {
    builder: FunctionBuilder<'f>,
    host: HostRefs,
    /// Frame pointer, the function's only parameter
    frame: IrValue,
    /// Returns `TAG_ERROR`; created on first use
    error_block: Option<Block>,
    program: &'a mut Program,
}

impl Translator<'_, '_> {
    fn translate(&mut self, expr: &FormulaExpr) -> (IrValue, IrValue) {
        ensure_sufficient_stack(|| match expr {
            FormulaExpr::Constant(Value::Number(n)) => {
                let tag = self.tag(TAG_NUMBER);
                let payload = self.builder.ins().f64const(*n);
                (tag, payload)
            }
            FormulaExpr::Constant(Value::Undefined) => {
                let tag = self.tag(TAG_UNDEFINED);
                let payload = self.builder.ins().f64const(0.0);
                (tag, payload)
            }
            FormulaExpr::Constant(text) => {
                let index = self.index(self.program.texts.len());
                self.program.texts.push(text.clone());
                let call = self.builder.ins().call(self.host.text, &[self.frame, index]);
                let tag = self.builder.inst_results(call)[0];
                (tag, self.load_payload())
            }

            FormulaExpr::Variable { name, range } => {
                let site = self.index(self.program.variables.len());
                self.program.variables.push(VariableSite {
                    name: name.clone(),
                    range: range.clone(),
                });
                let call = self
                    .builder
                    .ins()
                    .call(self.host.variable, &[self.frame, site]);
                let tag = self.builder.inst_results(call)[0];
                self.check_error(tag);
                (tag, self.load_payload())
            }

            FormulaExpr::BinaryOp { op, left, right } => {
                let left = self.translate(left);
                let right = self.translate(right);
                self.binary(*op, left, right)
            }

            FormulaExpr::Call { name, args } => {
                for arg in args {
                    let (tag, payload) = self.translate(arg);
                    self.builder
                        .ins()
                        .call(self.host.push_arg, &[self.frame, tag, payload]);
                }

                let site = self.index(self.program.calls.len());
                self.program.calls.push(name.clone());
                let argc = self.index(args.len());
                let call = self
                    .builder
                    .ins()
                    .call(self.host.call, &[self.frame, site, argc]);
                let tag = self.builder.inst_results(call)[0];
                self.check_error(tag);
                (tag, self.load_payload())
            }
        })
    }

    /// Same rule as [`BinaryOperator::apply`]
    fn binary(
        &mut self,
        op: BinaryOperator,
        (left_tag, left): (IrValue, IrValue),
        (right_tag, right): (IrValue, IrValue),
    ) -> (IrValue, IrValue) {
        let left_number = self
            .builder
            .ins()
            .icmp_imm(IntCC::Equal, left_tag, i64::from(TAG_NUMBER));
        let right_number = self
            .builder
            .ins()
            .icmp_imm(IntCC::Equal, right_tag, i64::from(TAG_NUMBER));
        let mut defined = self.builder.ins().band(left_number, right_number);

        let result = match op {
            BinaryOperator::Add => self.builder.ins().fadd(left, right),
            BinaryOperator::Subtract => self.builder.ins().fsub(left, right),
            BinaryOperator::Multiply => self.builder.ins().fmul(left, right),
            BinaryOperator::Divide => {
                let zero = self.builder.ins().f64const(0.0);
                let nonzero = self.builder.ins().fcmp(FloatCC::NotEqual, right, zero);
                defined = self.builder.ins().band(defined, nonzero);
                self.builder.ins().fdiv(left, right)
            }
            BinaryOperator::Power => {
                let call = self.builder.ins().call(self.host.pow, &[left, right]);
                self.builder.inst_results(call)[0]
            }
        };

        let number = self.tag(TAG_NUMBER);
        let undefined = self.tag(TAG_UNDEFINED);
        let tag = self.builder.ins().select(defined, number, undefined);
        let zero = self.builder.ins().f64const(0.0);
        let payload = self.builder.ins().select(defined, result, zero);
        (tag, payload)
    }

    fn tag(&mut self, tag: i32) -> IrValue {
        self.builder.ins().iconst(types::I32, i64::from(tag))
    }

    fn index(&mut self, index: usize) -> IrValue {
        self.builder.ins().iconst(types::I32, index as i64)
    }

    fn load_payload(&mut self) -> IrValue {
        self.builder
            .ins()
            .load(types::F64, MemFlags::trusted(), self.frame, 0)
    }

    /// Leave through the error exit if a callback reported failure
    fn check_error(&mut self, tag: IrValue) {
        let error_block = match self.error_block {
            Some(block) => block,
            None => {
                let block = self.builder.create_block();
                self.error_block = Some(block);
                block
            }
        };

        let failed = self
            .builder
            .ins()
            .icmp_imm(IntCC::Equal, tag, i64::from(TAG_ERROR));
        let next = self.builder.create_block();
        self.builder.ins().brif(failed, error_block, &[], next, &[]);
        self.builder.switch_to_block(next);
    }

    fn finish(mut self, tag: IrValue, payload: IrValue) {
        self.builder
            .ins()
            .store(MemFlags::trusted(), payload, self.frame, 0);
        self.builder.ins().return_(&[tag]);

        if let Some(block) = self.error_block {
            self.builder.switch_to_block(block);
            let error = self.tag(TAG_ERROR);
            self.builder.ins().return_(&[error]);
        }

        self.builder.seal_all_blocks();
        self.builder.finalize();
    }
}
