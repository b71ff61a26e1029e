//! JIT backends using Cranelift
//!
//! Lowers [`crate::formula::Expr`] to native code at first use:
//! - `scalar_compiled`: `extern "C" fn(f64, f64, f64, f64) -> f64`, one call per row
//! - `vectorized_compiled`: the whole row loop over raw column pointers
//!
//! Cranelift has no trigonometric instructions, so `sin`, `cos` and `asin` are
//! imported as C-callable helpers registered with the JIT module. `sqrt`,
//! arithmetic and the clamp (`fmin`/`fmax`) are native instructions.
//!
//! The compiled module is the artifact: it is built once per kernel through
//! an [`ArtifactCache`] and kept alive as long as the kernel.

use super::{ArtifactCache, BatchKernel, ColumnBatch, Method, RowFn, ScalarKernel};
use crate::formula::{haversine_expr, BinaryOp, Expr, UnaryOp};
use crate::{Error, Result};
use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{types, AbiParam, FuncRef, InstBuilder, MemFlags, Value};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, FuncId, Linkage, Module};
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// C-callable helpers imported by generated code
// ============================================================================

extern "C" fn haversine_jit_sin(x: f64) -> f64 {
    x.sin()
}

extern "C" fn haversine_jit_cos(x: f64) -> f64 {
    x.cos()
}

extern "C" fn haversine_jit_asin(x: f64) -> f64 {
    x.asin()
}

const HELPERS: [(&str, extern "C" fn(f64) -> f64); 3] = [
    ("haversine_jit_sin", haversine_jit_sin),
    ("haversine_jit_cos", haversine_jit_cos),
    ("haversine_jit_asin", haversine_jit_asin),
];

/// Signature of the compiled single-row function
pub type RowAbi = unsafe extern "C" fn(f64, f64, f64, f64) -> f64;

/// Signature of the compiled loop: `(x0, y0, x1, y1, out, len)`
pub type LoopAbi =
    unsafe extern "C" fn(*const f64, *const f64, *const f64, *const f64, *mut f64, usize);

/// True if Cranelift supports the host ISA
#[must_use]
pub fn is_available() -> bool {
    cranelift_native::builder().is_ok()
}

/// Finalized JIT module plus the entry point it exports
pub struct JitArtifact<F: Copy> {
    func: F,
    compile_time: Duration,
    _module: JITModule,
}

// SAFETY: the module is finalized before the artifact is constructed and never
// mutated afterwards; the only thing shared across threads is read-only
// executable memory and a function pointer into it.
unsafe impl<F: Copy> Send for JitArtifact<F> {}
// SAFETY: see `Send` above.
unsafe impl<F: Copy> Sync for JitArtifact<F> {}

impl<F: Copy> JitArtifact<F> {
    /// Compiled entry point
    pub const fn func(&self) -> F {
        self.func
    }

    /// Time spent generating and finalizing code
    pub const fn compile_time(&self) -> Duration {
        self.compile_time
    }
}

fn compile_err<E: Display>(method: Method, stage: &'static str) -> impl FnOnce(E) -> Error {
    move |e| Error::CompilationFailure {
        method: method.to_string(),
        reason: format!("{stage}: {e}"),
    }
}

fn new_module(method: Method) -> Result<JITModule> {
    let mut flag_builder = settings::builder();
    flag_builder
        .set("use_colocated_libcalls", "false")
        .map_err(compile_err(method, "JIT settings"))?;
    flag_builder
        .set("is_pic", "false")
        .map_err(compile_err(method, "JIT settings"))?;
    flag_builder
        .set("opt_level", "speed")
        .map_err(compile_err(method, "JIT settings"))?;

    let isa = cranelift_native::builder()
        .map_err(compile_err(method, "ISA builder"))?
        .finish(settings::Flags::new(flag_builder))
        .map_err(compile_err(method, "ISA finish"))?;

    let mut builder = JITBuilder::with_isa(isa, default_libcall_names());
    for (name, helper) in HELPERS {
        builder.symbol(name, helper as *const u8);
    }
    Ok(JITModule::new(builder))
}

fn declare_helpers(module: &mut JITModule, method: Method) -> Result<[FuncId; 3]> {
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(types::F64));
    sig.returns.push(AbiParam::new(types::F64));

    let mut ids = Vec::with_capacity(HELPERS.len());
    for (name, _) in HELPERS {
        let id = module
            .declare_function(name, Linkage::Import, &sig)
            .map_err(compile_err(method, "helper declaration"))?;
        ids.push(id);
    }
    Ok([ids[0], ids[1], ids[2]])
}

/// Helper references inside the function being built
struct Helpers {
    sin: FuncRef,
    cos: FuncRef,
    asin: FuncRef,
}

impl Helpers {
    fn import(module: &mut JITModule, ids: [FuncId; 3], builder: &mut FunctionBuilder<'_>) -> Self {
        let [sin, cos, asin] = ids.map(|id| module.declare_func_in_func(id, builder.func));
        Self { sin, cos, asin }
    }

    fn call(builder: &mut FunctionBuilder<'_>, callee: FuncRef, arg: Value) -> Value {
        let inst = builder.ins().call(callee, &[arg]);
        builder.inst_results(inst)[0]
    }
}

/// Emit IR for `expr` given the four input values of the current row
fn lower(builder: &mut FunctionBuilder<'_>, expr: &Expr, inputs: &[Value; 4], helpers: &Helpers) -> Value {
    match expr {
        Expr::Input(input) => inputs[*input as usize],
        Expr::Const(c) => builder.ins().f64const(*c),
        Expr::Unary(op, e) => {
            let v = lower(builder, e, inputs, helpers);
            match op {
                UnaryOp::Sqrt => builder.ins().sqrt(v),
                UnaryOp::Square => builder.ins().fmul(v, v),
                UnaryOp::Sin => Helpers::call(builder, helpers.sin, v),
                UnaryOp::Cos => Helpers::call(builder, helpers.cos, v),
                UnaryOp::Asin => Helpers::call(builder, helpers.asin, v),
            }
        }
        Expr::Binary(op, l, r) => {
            let l = lower(builder, l, inputs, helpers);
            let r = lower(builder, r, inputs, helpers);
            match op {
                BinaryOp::Add => builder.ins().fadd(l, r),
                BinaryOp::Sub => builder.ins().fsub(l, r),
                BinaryOp::Mul => builder.ins().fmul(l, r),
                BinaryOp::Div => builder.ins().fdiv(l, r),
            }
        }
        Expr::Clamp(e, lo, hi) => {
            // fmin/fmax return NaN if either operand is NaN, like f64::clamp
            let v = lower(builder, e, inputs, helpers);
            let hi = builder.ins().f64const(*hi);
            let lo = builder.ins().f64const(*lo);
            let capped = builder.ins().fmin(v, hi);
            builder.ins().fmax(capped, lo)
        }
    }
}

fn finalize<F: Copy>(
    mut module: JITModule,
    func_id: FuncId,
    method: Method,
    started: Instant,
    cast: impl FnOnce(*const u8) -> F,
) -> Result<JitArtifact<F>> {
    module
        .finalize_definitions()
        .map_err(compile_err(method, "finalize"))?;
    let func = cast(module.get_finalized_function(func_id));
    let compile_time = started.elapsed();

    tracing::debug!(
        method = %method,
        compile_ms = compile_time.as_secs_f64() * 1000.0,
        "compiled JIT kernel"
    );

    Ok(JitArtifact {
        func,
        compile_time,
        _module: module,
    })
}

/// Compile `expr` into a single-row function
///
/// # Errors
/// Returns `CompilationFailure` if Cranelift rejects the host or the IR
pub fn compile_row(expr: &Expr) -> Result<JitArtifact<RowAbi>> {
    let method = Method::ScalarCompiled;
    let started = Instant::now();
    let mut module = new_module(method)?;
    let helper_ids = declare_helpers(&mut module, method)?;

    let mut sig = module.make_signature();
    for _ in 0..4 {
        sig.params.push(AbiParam::new(types::F64));
    }
    sig.returns.push(AbiParam::new(types::F64));

    let func_id = module
        .declare_function("haversine_row", Linkage::Export, &sig)
        .map_err(compile_err(method, "function declaration"))?;

    let mut ctx = module.make_context();
    ctx.func.signature = sig;
    let mut builder_ctx = FunctionBuilderContext::new();
    {
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
        let helpers = Helpers::import(&mut module, helper_ids, &mut builder);

        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        builder.seal_block(entry);

        let params = builder.block_params(entry);
        let inputs = [params[0], params[1], params[2], params[3]];
        let distance = lower(&mut builder, expr, &inputs, &helpers);
        builder.ins().return_(&[distance]);
        builder.finalize();
    }

    module
        .define_function(func_id, &mut ctx)
        .map_err(compile_err(method, "function definition"))?;
    module.clear_context(&mut ctx);

    // SAFETY: `haversine_row` was declared with exactly the `RowAbi` signature
    finalize(module, func_id, method, started, |ptr| unsafe {
        std::mem::transmute::<*const u8, RowAbi>(ptr)
    })
}

/// Compile `expr` into a loop over whole columns
///
/// # Errors
/// Returns `CompilationFailure` if Cranelift rejects the host or the IR
pub fn compile_loop(expr: &Expr) -> Result<JitArtifact<LoopAbi>> {
    let method = Method::VectorizedCompiled;
    let started = Instant::now();
    let mut module = new_module(method)?;
    let helper_ids = declare_helpers(&mut module, method)?;
    let ptr = module.target_config().pointer_type();

    // (x0, y0, x1, y1, out, len)
    let mut sig = module.make_signature();
    for _ in 0..6 {
        sig.params.push(AbiParam::new(ptr));
    }

    let func_id = module
        .declare_function("haversine_loop", Linkage::Export, &sig)
        .map_err(compile_err(method, "function declaration"))?;

    let mut ctx = module.make_context();
    ctx.func.signature = sig;
    let mut builder_ctx = FunctionBuilderContext::new();
    {
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
        let helpers = Helpers::import(&mut module, helper_ids, &mut builder);

        let entry = builder.create_block();
        let header = builder.create_block();
        let body = builder.create_block();
        let exit = builder.create_block();

        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        let params = builder.block_params(entry).to_vec();
        let (columns, out_ptr, len) = ([params[0], params[1], params[2], params[3]], params[4], params[5]);
        let zero = builder.ins().iconst(ptr, 0);
        builder.ins().jump(header, &[zero]);

        // header(i): i < len ?
        builder.append_block_param(header, ptr);
        builder.switch_to_block(header);
        let i = builder.block_params(header)[0];
        let in_bounds = builder.ins().icmp(IntCC::UnsignedLessThan, i, len);
        builder.ins().brif(in_bounds, body, &[], exit, &[]);

        // body: out[i] = distance(x0[i], y0[i], x1[i], y1[i])
        builder.switch_to_block(body);
        let offset = builder.ins().ishl_imm(i, 3);
        let inputs = columns.map(|column| {
            let addr = builder.ins().iadd(column, offset);
            builder.ins().load(types::F64, MemFlags::trusted(), addr, 0)
        });
        let distance = lower(&mut builder, expr, &inputs, &helpers);
        let out_addr = builder.ins().iadd(out_ptr, offset);
        builder
            .ins()
            .store(MemFlags::trusted(), distance, out_addr, 0);
        let next = builder.ins().iadd_imm(i, 1);
        builder.ins().jump(header, &[next]);

        builder.switch_to_block(exit);
        builder.ins().return_(&[]);

        builder.seal_all_blocks();
        builder.finalize();
    }

    module
        .define_function(func_id, &mut ctx)
        .map_err(compile_err(method, "function definition"))?;
    module.clear_context(&mut ctx);

    // SAFETY: `haversine_loop` was declared with exactly the `LoopAbi` signature
    finalize(module, func_id, method, started, |ptr| unsafe {
        std::mem::transmute::<*const u8, LoopAbi>(ptr)
    })
}

/// `scalar_compiled`: JIT-compiled single-row function
pub struct CompiledScalarKernel {
    expr: Expr,
    cache: ArtifactCache<JitArtifact<RowAbi>>,
}

impl CompiledScalarKernel {
    /// Kernel for the haversine formula
    #[must_use]
    pub fn new() -> Self {
        Self {
            expr: haversine_expr(),
            cache: ArtifactCache::new(),
        }
    }

    /// Artifact cache (exposed for compile-once checks)
    #[must_use]
    pub const fn cache(&self) -> &ArtifactCache<JitArtifact<RowAbi>> {
        &self.cache
    }
}

impl Default for CompiledScalarKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl ScalarKernel for CompiledScalarKernel {
    fn method(&self) -> Method {
        Method::ScalarCompiled
    }

    fn row_fn(&self) -> Result<RowFn> {
        let artifact = self.cache.get_or_compile(|| compile_row(&self.expr))?;
        Ok(Arc::new(move |x0, y0, x1, y1| {
            // SAFETY: the artifact (and its executable memory) lives as long
            // as this closure; arguments are plain f64 values
            unsafe { (artifact.func())(x0, y0, x1, y1) }
        }))
    }
}

/// `vectorized_compiled`: JIT-compiled loop over whole columns
pub struct CompiledVectorizedKernel {
    expr: Expr,
    cache: ArtifactCache<JitArtifact<LoopAbi>>,
}

impl CompiledVectorizedKernel {
    /// Kernel for the haversine formula
    #[must_use]
    pub fn new() -> Self {
        Self {
            expr: haversine_expr(),
            cache: ArtifactCache::new(),
        }
    }

    /// Artifact cache (exposed for compile-once checks)
    #[must_use]
    pub const fn cache(&self) -> &ArtifactCache<JitArtifact<LoopAbi>> {
        &self.cache
    }
}

impl Default for CompiledVectorizedKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchKernel for CompiledVectorizedKernel {
    fn method(&self) -> Method {
        Method::VectorizedCompiled
    }

    fn compute(&self, batch: &ColumnBatch<'_>, out: &mut [f64]) -> Result<()> {
        batch.check_output(out)?;
        let artifact = self.cache.get_or_compile(|| compile_loop(&self.expr))?;
        if batch.is_empty() {
            return Ok(());
        }

        // SAFETY: all four inputs and `out` hold exactly `batch.len()` f64s
        // (ColumnBatch can only be built through try_new, `out` checked
        // above); the loop reads `[0, len)` of each input and writes
        // `[0, len)` of `out`
        unsafe {
            (artifact.func())(
                batch.x0().as_ptr(),
                batch.y0().as_ptr(),
                batch.x1().as_ptr(),
                batch.y1().as_ptr(),
                out.as_mut_ptr(),
                batch.len(),
            );
        }
        Ok(())
    }
}
