//! Function lowering: prologue, body, epilogue, and import thunks.

use swf::avm2::types::{Index, Method};

use crate::abc::code::{CodeWriter, Label};
use crate::assemble::{emit_domain_memory_reattach, Assembler};
use crate::error::{CompileError, Result};
use crate::trace::TraceConfig;
use crate::wasm::ir::{ExprTy, ValTy, WasmFunction};

/// An entry on the label stack: the wasm block name (if any) and the branch
/// target it maps to.
pub(crate) struct LabelScope {
    pub(crate) name: Option<String>,
    pub(crate) label: Label,
}

/// Per-function lowering state. The expression translator lives in
/// `lower::expr` as further methods on this type.
pub(crate) struct FuncLowerer<'a> {
    pub(crate) asm: &'a mut Assembler,
    pub(crate) w: CodeWriter,
    pub(crate) name: String,
    pub(crate) result: ExprTy,
    pub(crate) labels: Vec<LabelScope>,
    /// Statement counter for debugline/trace instrumentation.
    pub(crate) stmt: u32,
    pub(crate) debug: bool,
    pub(crate) trace_stmts: bool,
}

/// Emit a stack-neutral `trace(msg)` call.
pub(crate) fn emit_trace_call(asm: &mut Assembler, w: &mut CodeWriter, msg: &str) {
    let trace = asm.pool.member("trace");
    let text = asm.pool.string(msg);
    w.findpropstrict(trace);
    w.pushstring(text);
    w.callpropvoid(trace, 1);
}

/// Lower a defined function into a method and return its index.
pub(crate) fn lower_function(
    asm: &mut Assembler,
    func: &WasmFunction,
    cfg: &TraceConfig,
) -> Result<Index<Method>> {
    let body = func
        .body
        .as_ref()
        .ok_or_else(|| CompileError::internal(&func.name, "defined function without a body"))?;

    let mut w = CodeWriter::new();
    let num_params = func.params.len() as u32;
    w.set_local_base(1 + num_params + func.locals.len() as u32);

    // Receiver: standard scope prologue, then pin the receiver's type so
    // trait lookups verify against the class.
    w.getlocal(0);
    w.pushscope();
    let class = asm.class_multiname();
    w.getlocal(0);
    w.coerce(class);
    w.setlocal(0);

    // Parameters arrive as their declared AVM2 types; re-coerce and write
    // back so every later read sees int/Number exactly.
    for (k, ty) in func.params.iter().enumerate() {
        let index = k as u32 + 1;
        w.getlocal(index);
        coerce_value(&mut w, *ty);
        w.setlocal(index);
    }

    // Declared locals start as zero of their type.
    for (j, ty) in func.locals.iter().enumerate() {
        let index = 1 + num_params + j as u32;
        match ty {
            ValTy::I32 => {
                let zero = asm.pool.int(0);
                w.pushint(zero);
            }
            ValTy::F32 | ValTy::F64 => {
                let zero = asm.pool.double(0.0);
                w.pushdouble(zero);
            }
        }
        w.setlocal(index);
    }

    if cfg.debug {
        let file = asm.pool.string(cfg.source_name());
        w.debugfile(file);
    }
    if cfg.traces_function(&func.name) {
        emit_trace_call(asm, &mut w, &func.name);
    }

    let mut lowerer = FuncLowerer {
        asm: &mut *asm,
        w,
        name: func.name.clone(),
        result: func.result,
        labels: Vec::new(),
        stmt: 0,
        debug: cfg.debug,
        trace_stmts: cfg.traces_statements(&func.name),
    };
    lowerer.emit(body)?;
    debug_assert!(lowerer.labels.is_empty(), "label stack not empty at exit");

    let mut w = lowerer.w;
    match func.result {
        None => w.returnvoid(),
        Some(_) => {
            if !w.is_terminated() {
                return Err(CompileError::malformed(
                    &func.name,
                    "function body does not end in a return",
                ));
            }
        }
    }

    let blob = w
        .finish()
        .map_err(|message| CompileError::internal(&func.name, message))?;
    Ok(asm.add_method(
        &format!("func${}", func.name),
        &func.params,
        func.result,
        blob,
    ))
}

/// Lower an imported function into a thunk that forwards to the resolved
/// `import$<module>$<base>` slot. Calling out to the host may replace the
/// memory's backing buffer, so domain memory is reattached before returning.
pub(crate) fn lower_import(asm: &mut Assembler, func: &WasmFunction) -> Result<Index<Method>> {
    let (module, base) = func
        .import
        .as_ref()
        .ok_or_else(|| CompileError::internal(&func.name, "import thunk for a defined function"))?;
    let slot = asm.import_slot_name(module, base);
    let slot_mn = asm.pool.member(&slot);

    let mut w = CodeWriter::new();
    w.set_local_base(1 + func.params.len() as u32);
    w.getlocal(0);
    w.pushscope();

    w.getlocal(0);
    for k in 0..func.params.len() as u32 {
        w.getlocal(k + 1);
    }
    let num_args = func.params.len() as u32;
    match func.result {
        None => w.callpropvoid(slot_mn, num_args),
        Some(_) => w.callproperty(slot_mn, num_args),
    }

    // The call result (if any) rides below this balanced sequence.
    emit_domain_memory_reattach(asm, &mut w);

    match func.result {
        None => w.returnvoid(),
        Some(ty) => {
            coerce_value(&mut w, ty);
            w.returnvalue();
        }
    }

    let blob = w
        .finish()
        .map_err(|message| CompileError::internal(&func.name, message))?;
    Ok(asm.add_method(
        &format!("func${}", func.name),
        &func.params,
        func.result,
        blob,
    ))
}

pub(crate) fn coerce_value(w: &mut CodeWriter, ty: ValTy) {
    match ty {
        ValTy::I32 => w.convert_i(),
        ValTy::F32 | ValTy::F64 => w.convert_d(),
    }
}
