//! Wasm binary → expression IR.
//!
//! The input is expected to have been normalized upstream (i64 lowering,
//! flattening, legalization); this reader rebuilds the structured expression
//! tree from the operator stream by folding operands off a per-frame value
//! stack, generates label names for blocks and loops, and resolves branch
//! depths to those names. Anything outside the supported subset is rejected
//! here with the offending function's name.

use wasmparser::{BlockType, Operator, Parser, Payload, TypeRef, ValType};

use crate::error::{CompileError, Result};
use crate::wasm::ir::{
    BinOp, DataSegment, Export, ExportKind, Expr, ExprTy, Literal, TableSegment, UnOp, ValTy,
    WasmFunction, WasmGlobal, WasmModule,
};

/// Largest supported linear memory: the backing ByteArray is allocated at
/// this size and never smaller.
pub const MAX_MEMORY_BYTES: u64 = 1 << 24;

const WASM_PAGE_BYTES: u64 = 65536;

#[derive(Debug, Clone)]
struct FuncSig {
    params: Vec<ValTy>,
    result: ExprTy,
}

fn parse_err(e: wasmparser::BinaryReaderError) -> CompileError {
    CompileError::Parse(e.to_string())
}

fn val_ty(ty: ValType, func: &str) -> Result<ValTy> {
    match ty {
        ValType::I32 => Ok(ValTy::I32),
        ValType::F32 => Ok(ValTy::F32),
        ValType::F64 => Ok(ValTy::F64),
        ValType::I64 => Err(CompileError::unsupported(
            func,
            "i64 value (expected upstream i64 lowering)",
        )),
        other => Err(CompileError::unsupported(func, format!("{other:?} value"))),
    }
}

fn func_sig(ty: &wasmparser::FuncType, func: &str) -> Result<FuncSig> {
    let mut params = Vec::with_capacity(ty.params().len());
    for &p in ty.params() {
        params.push(val_ty(p, func)?);
    }
    let result = match ty.results() {
        [] => None,
        [r] => Some(val_ty(*r, func)?),
        _ => {
            return Err(CompileError::unsupported(func, "multi-value result"));
        }
    };
    Ok(FuncSig { params, result })
}

/// Decode a constant initializer expression to a single literal.
fn const_literal(expr: &wasmparser::ConstExpr, func: &str) -> Result<Literal> {
    let mut reader = expr.get_operators_reader();
    let op = reader.read().map_err(parse_err)?;
    let lit = match op {
        Operator::I32Const { value } => Literal::I32(value),
        Operator::F32Const { value } => Literal::F32(f32::from_bits(value.bits())),
        Operator::F64Const { value } => Literal::F64(f64::from_bits(value.bits())),
        other => {
            return Err(CompileError::malformed(
                func,
                format!("non-constant initializer: {other:?}"),
            ));
        }
    };
    match reader.read().map_err(parse_err)? {
        Operator::End => Ok(lit),
        _ => Err(CompileError::malformed(func, "non-constant initializer")),
    }
}

fn const_u32_offset(expr: &wasmparser::ConstExpr, func: &str) -> Result<u32> {
    match const_literal(expr, func)? {
        Literal::I32(v) => Ok(v as u32),
        _ => Err(CompileError::malformed(func, "non-i32 segment offset")),
    }
}

pub fn parse_module(bytes: &[u8]) -> Result<WasmModule> {
    let mut types: Vec<FuncSig> = Vec::new();
    let mut func_type_indices: Vec<u32> = Vec::new();
    let mut imports: Vec<(String, String)> = Vec::new();
    let mut globals: Vec<WasmGlobal> = Vec::new();
    let mut raw_exports: Vec<(String, wasmparser::ExternalKind, u32)> = Vec::new();
    let mut raw_elements: Vec<(u32, Vec<u32>)> = Vec::new();
    let mut data_segments: Vec<DataSegment> = Vec::new();
    let mut bodies: Vec<(Vec<ValTy>, Expr)> = Vec::new();
    let mut start_index: Option<u32> = None;
    let mut table_count = 0usize;

    // First pass over payloads: everything except code bodies, which need
    // the complete signature tables and are buffered for a second loop.
    let mut raw_bodies: Vec<wasmparser::FunctionBody> = Vec::new();

    for payload in Parser::new(0).parse_all(bytes) {
        match payload.map_err(parse_err)? {
            Payload::TypeSection(reader) => {
                for ty in reader.into_iter_err_on_gc_types() {
                    let ty = ty.map_err(parse_err)?;
                    types.push(func_sig(&ty, "module")?);
                }
            }
            Payload::ImportSection(reader) => {
                for import in reader {
                    let import = import.map_err(parse_err)?;
                    match import.ty {
                        TypeRef::Func(type_idx) => {
                            func_type_indices.push(type_idx);
                            imports.push((import.module.to_string(), import.name.to_string()));
                        }
                        other => {
                            return Err(CompileError::unsupported(
                                "module",
                                format!("non-function import {}.{}: {other:?}", import.module, import.name),
                            ));
                        }
                    }
                }
            }
            Payload::FunctionSection(reader) => {
                for type_idx in reader {
                    func_type_indices.push(type_idx.map_err(parse_err)?);
                }
            }
            Payload::MemorySection(reader) => {
                for mem in reader {
                    let mem = mem.map_err(parse_err)?;
                    if mem.memory64 || mem.shared {
                        return Err(CompileError::unsupported("module", "memory64/shared memory"));
                    }
                    if mem.initial * WASM_PAGE_BYTES > MAX_MEMORY_BYTES {
                        return Err(CompileError::malformed(
                            "module",
                            format!("initial memory of {} pages exceeds the 2^24 byte limit", mem.initial),
                        ));
                    }
                }
            }
            Payload::TableSection(reader) => {
                for table in reader {
                    table.map_err(parse_err)?;
                    table_count += 1;
                    if table_count > 1 {
                        return Err(CompileError::unsupported("module", "multiple tables"));
                    }
                }
            }
            Payload::GlobalSection(reader) => {
                for global in reader {
                    let global = global.map_err(parse_err)?;
                    let name = format!("g{}", globals.len());
                    globals.push(WasmGlobal {
                        ty: val_ty(global.ty.content_type, "module")?,
                        mutable: global.ty.mutable,
                        init: const_literal(&global.init_expr, "module")?,
                        name,
                    });
                }
            }
            Payload::ExportSection(reader) => {
                for export in reader {
                    let export = export.map_err(parse_err)?;
                    raw_exports.push((export.name.to_string(), export.kind, export.index));
                }
            }
            Payload::ElementSection(reader) => {
                for elem in reader {
                    let elem = elem.map_err(parse_err)?;
                    let wasmparser::ElementKind::Active { offset_expr, .. } = elem.kind else {
                        return Err(CompileError::unsupported("module", "passive element segment"));
                    };
                    let offset = const_u32_offset(&offset_expr, "module")?;
                    let mut indices = Vec::new();
                    match elem.items {
                        wasmparser::ElementItems::Functions(reader) => {
                            for idx in reader {
                                indices.push(idx.map_err(parse_err)?);
                            }
                        }
                        wasmparser::ElementItems::Expressions(..) => {
                            return Err(CompileError::unsupported(
                                "module",
                                "expression element segment",
                            ));
                        }
                    }
                    raw_elements.push((offset, indices));
                }
            }
            Payload::DataSection(reader) => {
                for data in reader {
                    let data = data.map_err(parse_err)?;
                    let wasmparser::DataKind::Active {
                        memory_index: 0,
                        offset_expr,
                    } = data.kind
                    else {
                        return Err(CompileError::unsupported("module", "passive data segment"));
                    };
                    data_segments.push(DataSegment {
                        offset: const_u32_offset(&offset_expr, "module")?,
                        bytes: data.data.to_vec(),
                    });
                }
            }
            Payload::StartSection { func, .. } => {
                start_index = Some(func);
            }
            Payload::CodeSectionEntry(body) => {
                raw_bodies.push(body);
            }
            _ => {}
        }
    }

    let func_names: Vec<String> = (0..func_type_indices.len()).map(|i| format!("f{i}")).collect();
    let sig_of = |func_idx: usize| -> Result<FuncSig> {
        let type_idx = *func_type_indices
            .get(func_idx)
            .ok_or_else(|| CompileError::Parse(format!("function index {func_idx} out of range")))?;
        types
            .get(type_idx as usize)
            .cloned()
            .ok_or_else(|| CompileError::Parse(format!("type index {type_idx} out of range")))
    };

    for (i, body) in raw_bodies.into_iter().enumerate() {
        let func_idx = imports.len() + i;
        let name = func_names[func_idx].clone();
        let sig = sig_of(func_idx)?;

        let mut locals: Vec<ValTy> = sig.params.clone();
        let locals_reader = body.get_locals_reader().map_err(parse_err)?;
        for local in locals_reader {
            let (count, ty) = local.map_err(parse_err)?;
            let ty = val_ty(ty, &name)?;
            for _ in 0..count {
                locals.push(ty);
            }
        }

        let mut builder = BodyBuilder {
            name: &name,
            result: sig.result,
            locals: &locals,
            globals: &globals,
            func_names: &func_names,
            func_type_indices: &func_type_indices,
            types: &types,
            frames: Vec::new(),
            label_counter: 0,
            skip_depth: None,
        };
        let expr = builder.build(body.get_operators_reader().map_err(parse_err)?)?;
        let declared: Vec<ValTy> = locals[sig.params.len()..].to_vec();
        bodies.push((declared, expr));
    }

    // Assemble the function list: imports first, then defined functions.
    let mut functions = Vec::with_capacity(func_type_indices.len());
    for (i, (module, base)) in imports.iter().enumerate() {
        let sig = sig_of(i)?;
        functions.push(WasmFunction {
            name: func_names[i].clone(),
            import: Some((module.clone(), base.clone())),
            params: sig.params.clone(),
            result: sig.result,
            locals: Vec::new(),
            body: None,
        });
    }
    for (i, (declared, expr)) in bodies.into_iter().enumerate() {
        let func_idx = imports.len() + i;
        let sig = sig_of(func_idx)?;
        functions.push(WasmFunction {
            name: func_names[func_idx].clone(),
            import: None,
            params: sig.params.clone(),
            result: sig.result,
            locals: declared,
            body: Some(expr),
        });
    }

    let resolve_func = |idx: u32| -> Result<String> {
        func_names
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| CompileError::Parse(format!("function index {idx} out of range")))
    };

    let mut exports = Vec::with_capacity(raw_exports.len());
    for (name, kind, index) in raw_exports {
        let (kind, target) = match kind {
            wasmparser::ExternalKind::Func => (ExportKind::Function, resolve_func(index)?),
            wasmparser::ExternalKind::Global => {
                let g = globals.get(index as usize).ok_or_else(|| {
                    CompileError::Parse(format!("global index {index} out of range"))
                })?;
                (ExportKind::Global, g.name.clone())
            }
            wasmparser::ExternalKind::Memory => (ExportKind::Memory, String::new()),
            wasmparser::ExternalKind::Table => (ExportKind::Table, String::new()),
            other => {
                return Err(CompileError::unsupported(
                    "module",
                    format!("export kind {other:?}"),
                ));
            }
        };
        exports.push(Export { name, kind, target });
    }

    let mut table_segments = Vec::with_capacity(raw_elements.len());
    for (offset, indices) in raw_elements {
        let mut names = Vec::with_capacity(indices.len());
        for idx in indices {
            names.push(resolve_func(idx)?);
        }
        table_segments.push(TableSegment { offset, names });
    }

    let start = match start_index {
        Some(idx) => Some(resolve_func(idx)?),
        None => None,
    };

    Ok(WasmModule {
        functions,
        globals,
        data_segments,
        table_segments,
        exports,
        start,
    })
}

// ---------------------------------------------------------------------------
// Body folding
// ---------------------------------------------------------------------------

enum FrameKind {
    Body,
    Block,
    Loop,
    If {
        cond: Expr,
        /// `Some` once the `else` operator has been seen; holds the
        /// completed then-branch statements.
        then: Option<Vec<Expr>>,
    },
}

struct Frame {
    kind: FrameKind,
    label: String,
    ty: ExprTy,
    exprs: Vec<Expr>,
    /// Set when any branch targets this frame's label.
    used: bool,
}

struct BodyBuilder<'m> {
    name: &'m str,
    result: ExprTy,
    locals: &'m [ValTy],
    globals: &'m [WasmGlobal],
    func_names: &'m [String],
    func_type_indices: &'m [u32],
    types: &'m [FuncSig],
    frames: Vec<Frame>,
    label_counter: u32,
    /// `Some(depth)` while skipping statically dead code after a terminator;
    /// counts nested control entries until the enclosing `end`/`else`.
    skip_depth: Option<u32>,
}

impl<'m> BodyBuilder<'m> {
    fn malformed(&self, msg: impl Into<String>) -> CompileError {
        CompileError::malformed(self.name, msg)
    }

    fn unsupported(&self, what: impl Into<String>) -> CompileError {
        CompileError::unsupported(self.name, what)
    }

    fn fresh_label(&mut self) -> String {
        let n = self.label_counter;
        self.label_counter += 1;
        format!("label{n}")
    }

    fn block_ty(&self, blockty: BlockType) -> Result<ExprTy> {
        match blockty {
            BlockType::Empty => Ok(None),
            BlockType::Type(t) => Ok(Some(val_ty(t, self.name)?)),
            BlockType::FuncType(_) => Err(self.unsupported("block with function type")),
        }
    }

    fn push(&mut self, e: Expr) {
        self.frames
            .last_mut()
            .expect("no open frame")
            .exprs
            .push(e);
    }

    fn pop_value(&mut self) -> Result<Expr> {
        let frame = self.frames.last_mut().expect("no open frame");
        match frame.exprs.pop() {
            Some(e) if e.ty().is_some() => Ok(e),
            Some(e) => {
                let msg = format!("expected a value operand, found {e:?}");
                frame.exprs.push(e);
                Err(self.malformed(msg))
            }
            None => Err(self.malformed("operand stack is empty (input not flattened?)")),
        }
    }

    fn pop_values(&mut self, n: usize) -> Result<Vec<Expr>> {
        let mut values = Vec::with_capacity(n);
        for _ in 0..n {
            values.push(self.pop_value()?);
        }
        values.reverse();
        Ok(values)
    }

    fn local_ty(&self, index: u32) -> Result<ValTy> {
        self.locals
            .get(index as usize)
            .copied()
            .ok_or_else(|| self.malformed(format!("local index {index} out of range")))
    }

    fn global(&self, index: u32) -> Result<&WasmGlobal> {
        self.globals
            .get(index as usize)
            .ok_or_else(|| self.malformed(format!("global index {index} out of range")))
    }

    fn call_sig(&self, func_idx: u32) -> Result<&FuncSig> {
        let type_idx = self
            .func_type_indices
            .get(func_idx as usize)
            .ok_or_else(|| self.malformed(format!("function index {func_idx} out of range")))?;
        self.types
            .get(*type_idx as usize)
            .ok_or_else(|| self.malformed(format!("type index {type_idx} out of range")))
    }

    /// Resolve a branch depth to a frame label and mark the frame as used.
    fn branch_target(&mut self, depth: u32) -> Result<String> {
        let idx = self
            .frames
            .len()
            .checked_sub(1 + depth as usize)
            .ok_or_else(|| self.malformed(format!("branch depth {depth} out of range")))?;
        if idx == 0 && self.result.is_some() {
            return Err(self.malformed("branch to the body of a function returning a value"));
        }
        self.frames[idx].used = true;
        Ok(self.frames[idx].label.clone())
    }

    fn binary(&mut self, op: BinOp) -> Result<()> {
        let rhs = self.pop_value()?;
        let lhs = self.pop_value()?;
        self.push(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        });
        Ok(())
    }

    fn unary(&mut self, op: UnOp) -> Result<()> {
        let value = self.pop_value()?;
        self.push(Expr::Unary {
            op,
            value: Box::new(value),
        });
        Ok(())
    }

    fn load(&mut self, memarg: wasmparser::MemArg, bytes: u8, signed: bool, ty: ValTy) -> Result<()> {
        let offset = u32::try_from(memarg.offset)
            .map_err(|_| self.malformed("load offset exceeds 32 bits"))?;
        let ptr = self.pop_value()?;
        self.push(Expr::Load {
            ptr: Box::new(ptr),
            offset,
            bytes,
            signed,
            ty,
        });
        Ok(())
    }

    fn store(&mut self, memarg: wasmparser::MemArg, bytes: u8, ty: ValTy) -> Result<()> {
        let offset = u32::try_from(memarg.offset)
            .map_err(|_| self.malformed("store offset exceeds 32 bits"))?;
        let value = self.pop_value()?;
        let ptr = self.pop_value()?;
        self.push(Expr::Store {
            ptr: Box::new(ptr),
            value: Box::new(value),
            offset,
            bytes,
            ty,
        });
        Ok(())
    }

    /// Wrap loose statements into a single expression.
    fn block_of(mut exprs: Vec<Expr>, ty: ExprTy) -> Expr {
        if exprs.len() == 1 {
            exprs.pop().unwrap()
        } else {
            Expr::Block {
                name: None,
                children: exprs,
                ty,
            }
        }
    }

    fn handle_end(&mut self) -> Result<()> {
        let frame = self.frames.pop().expect("no open frame");
        let expr = match frame.kind {
            FrameKind::Body => unreachable!("body frame ends the build loop"),
            FrameKind::Block => Expr::Block {
                name: Some(frame.label),
                children: frame.exprs,
                ty: frame.ty,
            },
            FrameKind::Loop => Expr::Loop {
                name: Some(frame.label),
                body: Box::new(Self::block_of(frame.exprs, frame.ty)),
                ty: frame.ty,
            },
            FrameKind::If { cond, then } => {
                let (then_exprs, else_exprs) = match then {
                    Some(t) => (t, Some(frame.exprs)),
                    None => (frame.exprs, None),
                };
                let if_expr = Expr::If {
                    cond: Box::new(cond),
                    then: Box::new(Self::block_of(then_exprs, frame.ty)),
                    otherwise: else_exprs.map(|e| Box::new(Self::block_of(e, frame.ty))),
                    ty: frame.ty,
                };
                if frame.used {
                    // A branch targets the end of the `if`: give it an
                    // enclosing named block to land on.
                    Expr::Block {
                        name: Some(frame.label),
                        children: vec![if_expr],
                        ty: frame.ty,
                    }
                } else {
                    if_expr
                }
            }
        };
        self.push(expr);
        Ok(())
    }

    fn handle_else(&mut self) -> Result<()> {
        let matched = {
            let frame = self.frames.last_mut().expect("no open frame");
            match &mut frame.kind {
                FrameKind::If { then, .. } if then.is_none() => {
                    *then = Some(std::mem::take(&mut frame.exprs));
                    true
                }
                _ => false,
            }
        };
        if matched {
            Ok(())
        } else {
            Err(self.malformed("else without matching if"))
        }
    }

    fn build(&mut self, reader: wasmparser::OperatorsReader<'_>) -> Result<Expr> {
        let body_label = self.fresh_label();
        self.frames.push(Frame {
            kind: FrameKind::Body,
            label: body_label,
            ty: self.result,
            exprs: Vec::new(),
            used: false,
        });

        for op in reader {
            let op = op.map_err(parse_err)?;

            if let Some(depth) = self.skip_depth {
                match op {
                    Operator::Block { .. } | Operator::Loop { .. } | Operator::If { .. } => {
                        self.skip_depth = Some(depth + 1);
                    }
                    Operator::End if depth == 0 => {
                        self.skip_depth = None;
                        if self.frames.len() == 1 {
                            break;
                        }
                        self.handle_end()?;
                    }
                    Operator::End => self.skip_depth = Some(depth - 1),
                    Operator::Else if depth == 0 => {
                        self.skip_depth = None;
                        self.handle_else()?;
                    }
                    _ => {}
                }
                continue;
            }

            match op {
                Operator::End => {
                    if self.frames.len() == 1 {
                        break;
                    }
                    self.handle_end()?;
                }
                Operator::Else => self.handle_else()?,
                other => self.handle_op(other)?,
            }
        }

        let mut frame = self.frames.pop().expect("body frame");
        if self.result.is_some() {
            if let Some(last) = frame.exprs.last() {
                if last.ty().is_some() && !matches!(last, Expr::Return { .. }) {
                    let value = frame.exprs.pop().unwrap();
                    frame.exprs.push(Expr::Return {
                        value: Some(Box::new(value)),
                    });
                }
            }
        }
        Ok(Expr::Block {
            name: Some(frame.label),
            children: frame.exprs,
            ty: None,
        })
    }

    fn handle_op(&mut self, op: Operator<'_>) -> Result<()> {
        use Operator as O;
        match op {
            // Control.
            O::Block { blockty } => {
                let ty = self.block_ty(blockty)?;
                let label = self.fresh_label();
                self.frames.push(Frame {
                    kind: FrameKind::Block,
                    label,
                    ty,
                    exprs: Vec::new(),
                    used: false,
                });
            }
            O::Loop { blockty } => {
                let ty = self.block_ty(blockty)?;
                let label = self.fresh_label();
                self.frames.push(Frame {
                    kind: FrameKind::Loop,
                    label,
                    ty,
                    exprs: Vec::new(),
                    used: false,
                });
            }
            O::If { blockty } => {
                let ty = self.block_ty(blockty)?;
                let cond = self.pop_value()?;
                let label = self.fresh_label();
                self.frames.push(Frame {
                    kind: FrameKind::If { cond, then: None },
                    label,
                    ty,
                    exprs: Vec::new(),
                    used: false,
                });
            }
            O::Br { relative_depth } => {
                let name = self.branch_target(relative_depth)?;
                self.push(Expr::Break {
                    name,
                    cond: None,
                    value: None,
                });
                self.skip_depth = Some(0);
            }
            O::BrIf { relative_depth } => {
                let cond = self.pop_value()?;
                let name = self.branch_target(relative_depth)?;
                self.push(Expr::Break {
                    name,
                    cond: Some(Box::new(cond)),
                    value: None,
                });
            }
            O::BrTable { targets } => {
                let cond = self.pop_value()?;
                let mut names = Vec::with_capacity(targets.len() as usize);
                for depth in targets.targets() {
                    let depth = depth.map_err(parse_err)?;
                    names.push(self.branch_target(depth)?);
                }
                let default = self.branch_target(targets.default())?;
                self.push(Expr::Switch {
                    cond: Box::new(cond),
                    names,
                    default,
                });
                self.skip_depth = Some(0);
            }
            O::Return => {
                let value = match self.result {
                    Some(_) => Some(Box::new(self.pop_value()?)),
                    None => None,
                };
                self.push(Expr::Return { value });
                self.skip_depth = Some(0);
            }
            O::Unreachable => {
                self.push(Expr::Unreachable);
                self.skip_depth = Some(0);
            }
            O::Nop => self.push(Expr::Nop),
            O::Drop => {
                let value = self.pop_value()?;
                self.push(Expr::Drop {
                    value: Box::new(value),
                });
            }
            O::Select | O::TypedSelect { .. } => {
                let cond = self.pop_value()?;
                let if_false = self.pop_value()?;
                let if_true = self.pop_value()?;
                self.push(Expr::Select {
                    if_true: Box::new(if_true),
                    if_false: Box::new(if_false),
                    cond: Box::new(cond),
                });
            }

            // Calls.
            O::Call { function_index } => {
                let sig = self.call_sig(function_index)?.clone();
                let operands = self.pop_values(sig.params.len())?;
                let target = self.func_names[function_index as usize].clone();
                self.push(Expr::Call {
                    target,
                    operands,
                    ty: sig.result,
                });
            }
            O::CallIndirect { type_index, .. } => {
                let sig = self
                    .types
                    .get(type_index as usize)
                    .ok_or_else(|| self.malformed(format!("type index {type_index} out of range")))?
                    .clone();
                let target = self.pop_value()?;
                let operands = self.pop_values(sig.params.len())?;
                self.push(Expr::CallIndirect {
                    target: Box::new(target),
                    operands,
                    ty: sig.result,
                });
            }

            // Locals and globals.
            O::LocalGet { local_index } => {
                let ty = self.local_ty(local_index)?;
                self.push(Expr::LocalGet {
                    index: local_index,
                    ty,
                });
            }
            O::LocalSet { local_index } => {
                self.local_ty(local_index)?;
                let value = self.pop_value()?;
                self.push(Expr::LocalSet {
                    index: local_index,
                    value: Box::new(value),
                    tee: false,
                });
            }
            O::LocalTee { local_index } => {
                self.local_ty(local_index)?;
                let value = self.pop_value()?;
                self.push(Expr::LocalSet {
                    index: local_index,
                    value: Box::new(value),
                    tee: true,
                });
            }
            O::GlobalGet { global_index } => {
                let g = self.global(global_index)?;
                let (name, ty) = (g.name.clone(), g.ty);
                self.push(Expr::GlobalGet { name, ty });
            }
            O::GlobalSet { global_index } => {
                let name = self.global(global_index)?.name.clone();
                let value = self.pop_value()?;
                self.push(Expr::GlobalSet {
                    name,
                    value: Box::new(value),
                });
            }

            // Memory.
            O::I32Load { memarg } => self.load(memarg, 4, false, ValTy::I32)?,
            O::I32Load8S { memarg } => self.load(memarg, 1, true, ValTy::I32)?,
            O::I32Load8U { memarg } => self.load(memarg, 1, false, ValTy::I32)?,
            O::I32Load16S { memarg } => self.load(memarg, 2, true, ValTy::I32)?,
            O::I32Load16U { memarg } => self.load(memarg, 2, false, ValTy::I32)?,
            O::F32Load { memarg } => self.load(memarg, 4, false, ValTy::F32)?,
            O::F64Load { memarg } => self.load(memarg, 8, false, ValTy::F64)?,
            O::I32Store { memarg } => self.store(memarg, 4, ValTy::I32)?,
            O::I32Store8 { memarg } => self.store(memarg, 1, ValTy::I32)?,
            O::I32Store16 { memarg } => self.store(memarg, 2, ValTy::I32)?,
            O::F32Store { memarg } => self.store(memarg, 4, ValTy::F32)?,
            O::F64Store { memarg } => self.store(memarg, 8, ValTy::F64)?,
            O::MemorySize { .. } => self.push(Expr::MemorySize),
            O::MemoryGrow { .. } => {
                let pages = self.pop_value()?;
                self.push(Expr::MemoryGrow {
                    pages: Box::new(pages),
                });
            }

            // Constants.
            O::I32Const { value } => self.push(Expr::Const(Literal::I32(value))),
            O::F32Const { value } => {
                self.push(Expr::Const(Literal::F32(f32::from_bits(value.bits()))));
            }
            O::F64Const { value } => {
                self.push(Expr::Const(Literal::F64(f64::from_bits(value.bits()))));
            }

            // i32 arithmetic.
            O::I32Add => self.binary(BinOp::AddI32)?,
            O::I32Sub => self.binary(BinOp::SubI32)?,
            O::I32Mul => self.binary(BinOp::MulI32)?,
            O::I32DivS => self.binary(BinOp::DivSI32)?,
            O::I32DivU => self.binary(BinOp::DivUI32)?,
            O::I32RemS => self.binary(BinOp::RemSI32)?,
            O::I32RemU => self.binary(BinOp::RemUI32)?,
            O::I32And => self.binary(BinOp::AndI32)?,
            O::I32Or => self.binary(BinOp::OrI32)?,
            O::I32Xor => self.binary(BinOp::XorI32)?,
            O::I32Shl => self.binary(BinOp::ShlI32)?,
            O::I32ShrS => self.binary(BinOp::ShrSI32)?,
            O::I32ShrU => self.binary(BinOp::ShrUI32)?,
            O::I32Rotl => self.binary(BinOp::RotlI32)?,
            O::I32Rotr => self.binary(BinOp::RotrI32)?,

            // i32 comparisons.
            O::I32Eq => self.binary(BinOp::EqI32)?,
            O::I32Ne => self.binary(BinOp::NeI32)?,
            O::I32LtS => self.binary(BinOp::LtSI32)?,
            O::I32LtU => self.binary(BinOp::LtUI32)?,
            O::I32LeS => self.binary(BinOp::LeSI32)?,
            O::I32LeU => self.binary(BinOp::LeUI32)?,
            O::I32GtS => self.binary(BinOp::GtSI32)?,
            O::I32GtU => self.binary(BinOp::GtUI32)?,
            O::I32GeS => self.binary(BinOp::GeSI32)?,
            O::I32GeU => self.binary(BinOp::GeUI32)?,
            O::I32Eqz => self.unary(UnOp::EqzI32)?,
            O::I32Clz => self.unary(UnOp::ClzI32)?,
            O::I32Ctz => self.unary(UnOp::CtzI32)?,
            O::I32Popcnt => self.unary(UnOp::PopcntI32)?,
            O::I32Extend8S => self.unary(UnOp::Extend8S)?,
            O::I32Extend16S => self.unary(UnOp::Extend16S)?,

            // Float arithmetic (f32 and f64 collapse onto Number).
            O::F32Add | O::F64Add => self.binary(BinOp::AddF)?,
            O::F32Sub | O::F64Sub => self.binary(BinOp::SubF)?,
            O::F32Mul | O::F64Mul => self.binary(BinOp::MulF)?,
            O::F32Div | O::F64Div => self.binary(BinOp::DivF)?,
            O::F32Min | O::F64Min => self.binary(BinOp::MinF)?,
            O::F32Max | O::F64Max => self.binary(BinOp::MaxF)?,
            O::F32Copysign | O::F64Copysign => self.binary(BinOp::CopySignF)?,
            O::F32Eq | O::F64Eq => self.binary(BinOp::EqF)?,
            O::F32Ne | O::F64Ne => self.binary(BinOp::NeF)?,
            O::F32Lt | O::F64Lt => self.binary(BinOp::LtF)?,
            O::F32Le | O::F64Le => self.binary(BinOp::LeF)?,
            O::F32Gt | O::F64Gt => self.binary(BinOp::GtF)?,
            O::F32Ge | O::F64Ge => self.binary(BinOp::GeF)?,
            O::F32Neg | O::F64Neg => self.unary(UnOp::NegF)?,
            O::F32Abs | O::F64Abs => self.unary(UnOp::AbsF)?,
            O::F32Ceil | O::F64Ceil => self.unary(UnOp::CeilF)?,
            O::F32Floor | O::F64Floor => self.unary(UnOp::FloorF)?,
            O::F32Trunc | O::F64Trunc => self.unary(UnOp::TruncF)?,
            O::F32Nearest | O::F64Nearest => self.unary(UnOp::NearestF)?,
            O::F32Sqrt | O::F64Sqrt => self.unary(UnOp::SqrtF)?,

            // Conversions.
            O::I32TruncF32S | O::I32TruncF64S => self.unary(UnOp::TruncSFToI32)?,
            O::I32TruncF32U | O::I32TruncF64U => self.unary(UnOp::TruncUFToI32)?,
            O::F32ConvertI32S | O::F64ConvertI32S => self.unary(UnOp::ConvertSI32ToF)?,
            O::F32ConvertI32U | O::F64ConvertI32U => self.unary(UnOp::ConvertUI32ToF)?,
            O::F64PromoteF32 => self.unary(UnOp::PromoteF32)?,
            O::F32DemoteF64 => self.unary(UnOp::DemoteF64)?,
            O::I32ReinterpretF32 => self.unary(UnOp::ReinterpretF32)?,
            O::F32ReinterpretI32 => self.unary(UnOp::ReinterpretI32)?,

            other => {
                return Err(self.unsupported(format!("{other:?}")));
            }
        }
        Ok(())
    }
}
