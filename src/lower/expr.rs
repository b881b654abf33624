//! The per-expression translator.
//!
//! `emit` appends AVM2 instructions that evaluate one wasm expression and
//! leave exactly its declared number of values on the operand stack. Every
//! i32 result is a signed 32-bit int on the AVM2 stack; unsigned operations
//! re-cast with convert_u/convert_i at their boundaries. f32 and f64 both
//! live as Number.

use crate::abc::code::Label;
use crate::error::{CompileError, Result};
use crate::lower::func::{emit_trace_call, FuncLowerer, LabelScope};
use crate::wasm::ir::{BinOp, Expr, Literal, UnOp, ValTy};

impl FuncLowerer<'_> {
    fn malformed(&self, message: impl Into<String>) -> CompileError {
        CompileError::malformed(&self.name, message)
    }

    fn unsupported(&self, construct: impl Into<String>) -> CompileError {
        CompileError::unsupported(&self.name, construct)
    }

    fn find_label(&self, name: &str) -> Result<Label> {
        self.labels
            .iter()
            .rev()
            .find(|scope| scope.name.as_deref() == Some(name))
            .map(|scope| scope.label)
            .ok_or_else(|| self.malformed(format!("branch to unknown label {name}")))
    }

    /// Emit a block child, interleaving debug/trace instrumentation at the
    /// statement boundary. Instrumentation is stack-neutral.
    fn emit_statement(&mut self, e: &Expr) -> Result<()> {
        self.stmt += 1;
        if self.debug {
            self.w.debugline(self.stmt);
        }
        if self.trace_stmts {
            let msg = format!("{}:{}", self.name, self.stmt);
            emit_trace_call(self.asm, &mut self.w, &msg);
        }
        self.emit(e)
    }

    pub(crate) fn emit(&mut self, e: &Expr) -> Result<()> {
        match e {
            Expr::Block { name, children, ty } => {
                if ty.is_some() {
                    return Err(self.malformed("block with a result type"));
                }
                let label = self.w.new_label();
                self.labels.push(LabelScope {
                    name: name.clone(),
                    label,
                });
                for child in children {
                    if child.ty().is_some() {
                        return Err(self.malformed("unconsumed value inside a block"));
                    }
                    self.emit_statement(child)?;
                }
                self.labels.pop();
                if self.w.used(label) {
                    self.w.bind(label);
                }
            }

            Expr::Loop { name, body, ty } => {
                if ty.is_some() {
                    return Err(self.malformed("loop with a result type"));
                }
                let label = self.w.new_label();
                self.labels.push(LabelScope {
                    name: name.clone(),
                    label,
                });
                // Loop labels bind at entry; branches to them are back-edges.
                self.w.bind_backward(label);
                self.emit(body)?;
                self.labels.pop();
            }

            Expr::If {
                cond,
                then,
                otherwise,
                ty,
            } => {
                if ty.is_some() {
                    return Err(self.malformed("if with a result type"));
                }
                let ifend = self.w.new_label();
                self.emit_branch_cond(cond, ifend, false)?;
                self.emit(then)?;
                match otherwise {
                    Some(e) => {
                        let elseend = self.w.new_label();
                        self.w.jump(elseend);
                        self.w.bind(ifend);
                        self.emit(e)?;
                        self.w.bind(elseend);
                    }
                    None => self.w.bind(ifend),
                }
            }

            Expr::Break { name, cond, value } => {
                if value.is_some() {
                    return Err(self.malformed("break with a value"));
                }
                let label = self.find_label(name)?;
                match cond {
                    Some(c) => self.emit_branch_cond(c, label, true)?,
                    None => self.w.jump(label),
                }
            }

            Expr::Switch {
                cond,
                names,
                default,
            } => {
                self.emit(cond)?;
                let default_label = self.find_label(default)?;
                if names.is_empty() {
                    self.w.pop();
                    self.w.jump(default_label);
                } else {
                    let mut cases = Vec::with_capacity(names.len());
                    for n in names {
                        cases.push(self.find_label(n)?);
                    }
                    self.w.lookupswitch(default_label, &cases);
                }
            }

            Expr::Return { value } => match (value, self.result) {
                (Some(v), Some(_)) => {
                    self.emit(v)?;
                    self.w.returnvalue();
                }
                _ => self.w.returnvoid(),
            },

            Expr::Unreachable => {
                let error = self.asm.pool.member("Error");
                let msg = self.asm.pool.string("unreachable");
                self.w.findpropstrict(error);
                self.w.pushstring(msg);
                self.w.constructprop(error, 1);
                self.w.throw();
            }

            Expr::Nop => self.w.nop(),

            Expr::Const(lit) => self.emit_const(*lit),

            Expr::LocalGet { index, .. } => self.w.getlocal(index + 1),

            Expr::LocalSet { index, value, tee } => {
                // Increment/decrement peephole for `local = local ± 1`.
                let step = match &**value {
                    Expr::Binary {
                        op: BinOp::AddI32,
                        lhs,
                        rhs,
                    } => match (&**lhs, &**rhs) {
                        (Expr::LocalGet { index: li, .. }, Expr::Const(Literal::I32(c)))
                            if li == index && (*c == 1 || *c == -1) =>
                        {
                            Some(*c)
                        }
                        _ => None,
                    },
                    _ => None,
                };
                match step {
                    Some(1) => {
                        self.w.inclocal_i(index + 1);
                        if *tee {
                            self.w.getlocal(index + 1);
                        }
                    }
                    Some(_) => {
                        self.w.declocal_i(index + 1);
                        if *tee {
                            self.w.getlocal(index + 1);
                        }
                    }
                    None => {
                        self.emit(value)?;
                        if *tee {
                            self.w.dup();
                        }
                        self.w.setlocal(index + 1);
                    }
                }
            }

            Expr::GlobalGet { name, ty } => {
                self.asm.ensure_global(name, *ty);
                let mn = self.asm.pool.member(&format!("global${name}"));
                self.w.getlocal(0);
                self.w.getproperty(mn);
                self.coerce(*ty);
            }

            Expr::GlobalSet { name, value } => {
                let ty = value
                    .ty()
                    .ok_or_else(|| self.malformed("global.set without a value"))?;
                self.asm.ensure_global(name, ty);
                let mn = self.asm.pool.member(&format!("global${name}"));
                self.w.getlocal(0);
                self.emit(value)?;
                self.w.setproperty(mn);
            }

            Expr::Load {
                ptr,
                offset,
                bytes,
                signed,
                ty,
            } => {
                self.emit(ptr)?;
                self.emit_offset(*offset);
                match (ty, bytes) {
                    (ValTy::I32, 1) => {
                        self.w.li8();
                        if *signed {
                            self.w.sxi8();
                        }
                    }
                    (ValTy::I32, 2) => {
                        self.w.li16();
                        if *signed {
                            self.w.sxi16();
                        }
                    }
                    (ValTy::I32, 4) => self.w.li32(),
                    (ValTy::F32, 4) => self.w.lf32(),
                    (ValTy::F64, 8) => self.w.lf64(),
                    _ => {
                        return Err(CompileError::internal(
                            &self.name,
                            format!("load of {bytes} bytes as {ty:?}"),
                        ));
                    }
                }
            }

            Expr::Store {
                ptr,
                value,
                offset,
                bytes,
                ty,
            } => {
                // AVM2 stores take value-then-pointer; wasm evaluates
                // pointer-then-value. Reorder only when the predicate proves
                // it unobservable, otherwise keep wasm order and swap.
                if ptr.effect_free() && value.effect_free() {
                    self.emit(value)?;
                    self.emit(ptr)?;
                    self.emit_offset(*offset);
                } else {
                    self.emit(ptr)?;
                    self.emit_offset(*offset);
                    self.emit(value)?;
                    self.w.swap();
                }
                match (ty, bytes) {
                    (ValTy::I32, 1) => self.w.si8(),
                    (ValTy::I32, 2) => self.w.si16(),
                    (ValTy::I32, 4) => self.w.si32(),
                    (ValTy::F32, 4) => self.w.sf32(),
                    (ValTy::F64, 8) => self.w.sf64(),
                    _ => {
                        return Err(CompileError::internal(
                            &self.name,
                            format!("store of {bytes} bytes as {ty:?}"),
                        ));
                    }
                }
            }

            Expr::Call {
                target,
                operands,
                ty,
            } => {
                self.w.getlocal(0);
                for operand in operands {
                    self.emit(operand)?;
                }
                let mn = self.asm.pool.member(&format!("func${target}"));
                let num_args = operands.len() as u32;
                match ty {
                    None => self.w.callpropvoid(mn, num_args),
                    Some(t) => {
                        self.w.callproperty(mn, num_args);
                        self.coerce(*t);
                    }
                }
            }

            Expr::CallIndirect {
                target,
                operands,
                ty,
            } => self.emit_call_indirect(target, operands, *ty)?,

            Expr::Select {
                if_true,
                if_false,
                cond,
            } => {
                // Both arms evaluate (wasm select is strict); the dead value
                // is popped after a conditional jump over a swap.
                self.emit(if_true)?;
                self.emit(if_false)?;
                let keep = self.w.new_label();
                self.emit_branch_cond(cond, keep, true)?;
                self.w.swap();
                self.w.bind(keep);
                self.w.pop();
            }

            Expr::Drop { value } => {
                self.emit(value)?;
                self.w.pop();
            }

            Expr::MemorySize => {
                let mn = self.asm.pool.member("wasm$memory_size");
                self.w.getlocal(0);
                self.w.callproperty(mn, 0);
                self.w.convert_i();
            }

            Expr::MemoryGrow { pages } => {
                let mn = self.asm.pool.member("wasm$memory_grow");
                self.w.getlocal(0);
                self.emit(pages)?;
                self.w.callproperty(mn, 1);
                self.w.convert_i();
            }

            Expr::Unary { op, value } => self.emit_unary(*op, value)?,
            Expr::Binary { op, lhs, rhs } => self.emit_binary(*op, lhs, rhs)?,
        }
        Ok(())
    }

    fn emit_const(&mut self, lit: Literal) {
        match lit {
            Literal::I32(v) => {
                let idx = self.asm.pool.int(v);
                self.w.pushint(idx);
            }
            Literal::F32(v) => self.emit_double(v as f64),
            Literal::F64(v) => self.emit_double(v),
        }
    }

    /// NaN goes through the dedicated opcode: the double pool cannot
    /// distinguish NaN payloads safely.
    fn emit_double(&mut self, v: f64) {
        if v.is_nan() {
            self.w.pushnan();
        } else {
            let idx = self.asm.pool.double(v);
            self.w.pushdouble(idx);
        }
    }

    fn coerce(&mut self, ty: ValTy) {
        match ty {
            ValTy::I32 => self.w.convert_i(),
            ValTy::F32 | ValTy::F64 => self.w.convert_d(),
        }
    }

    /// Add a constant byte offset to the pointer on the stack.
    fn emit_offset(&mut self, offset: u32) {
        match offset {
            0 => {}
            1 => self.w.increment_i(),
            n => {
                let idx = self.asm.pool.int(n as i32);
                self.w.pushint(idx);
                self.w.add_i();
            }
        }
    }

    /// Fold a condition directly into a conditional branch: branch to
    /// `target` when the condition is true (`branch_on_true`) or false.
    /// Semantically identical to materializing the boolean int; this only
    /// avoids the intermediate value.
    fn emit_branch_cond(&mut self, cond: &Expr, target: Label, branch_on_true: bool) -> Result<()> {
        use BinOp::*;
        match cond {
            Expr::Binary { op, lhs, rhs } if op.is_comparison() => {
                let unsigned = matches!(*op, LtUI32 | LeUI32 | GtUI32 | GeUI32);
                self.emit(lhs)?;
                if unsigned {
                    self.w.convert_u();
                }
                self.emit(rhs)?;
                if unsigned {
                    self.w.convert_u();
                }
                match (*op, branch_on_true) {
                    (EqI32 | EqF, true) | (NeI32 | NeF, false) => self.w.ifstricteq(target),
                    (EqI32 | EqF, false) | (NeI32 | NeF, true) => self.w.ifstrictne(target),
                    (LtSI32 | LtUI32 | LtF, true) => self.w.iflt(target),
                    (LtSI32 | LtUI32 | LtF, false) => self.w.ifnlt(target),
                    (LeSI32 | LeUI32 | LeF, true) => self.w.ifle(target),
                    (LeSI32 | LeUI32 | LeF, false) => self.w.ifnle(target),
                    (GtSI32 | GtUI32 | GtF, true) => self.w.ifgt(target),
                    (GtSI32 | GtUI32 | GtF, false) => self.w.ifngt(target),
                    (GeSI32 | GeUI32 | GeF, true) => self.w.ifge(target),
                    (GeSI32 | GeUI32 | GeF, false) => self.w.ifnge(target),
                    _ => unreachable!("non-comparison operator in condition fold"),
                }
            }
            Expr::Unary {
                op: UnOp::EqzI32,
                value,
            } => {
                self.emit(value)?;
                if branch_on_true {
                    self.w.iffalse(target);
                } else {
                    self.w.iftrue(target);
                }
            }
            other => {
                self.emit(other)?;
                if branch_on_true {
                    self.w.iftrue(target);
                } else {
                    self.w.iffalse(target);
                }
            }
        }
        Ok(())
    }

    fn emit_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<()> {
        use BinOp::*;

        match op {
            RotlI32 => return Err(self.unsupported("i32.rotl")),
            RotrI32 => return Err(self.unsupported("i32.rotr")),
            CopySignF => return Err(self.unsupported("copysign")),
            _ => {}
        }

        // Min/Max go through Math, whose receiver precedes the operands.
        if matches!(op, MinF | MaxF) {
            let math = self.asm.pool.member("Math");
            let method = self
                .asm
                .pool
                .member(if op == MinF { "min" } else { "max" });
            self.w.getlex(math);
            self.emit(lhs)?;
            self.emit(rhs)?;
            self.w.callproperty(method, 2);
            self.w.convert_d();
            return Ok(());
        }

        let unsigned = matches!(
            op,
            DivUI32 | RemUI32 | LtUI32 | LeUI32 | GtUI32 | GeUI32
        );
        self.emit(lhs)?;
        if unsigned {
            self.w.convert_u();
        }
        self.emit(rhs)?;
        if unsigned {
            self.w.convert_u();
        }

        match op {
            AddI32 => self.w.add_i(),
            SubI32 => self.w.subtract_i(),
            MulI32 => self.w.multiply_i(),
            // AVM2 division is Number division; truncate back to int.
            DivSI32 => {
                self.w.divide();
                self.w.convert_i();
            }
            DivUI32 => {
                self.w.divide();
                self.w.convert_u();
                self.w.convert_i();
            }
            RemSI32 => {
                self.w.modulo();
                self.w.convert_i();
            }
            RemUI32 => {
                self.w.modulo();
                self.w.convert_u();
                self.w.convert_i();
            }
            AndI32 => self.w.bitand(),
            OrI32 => self.w.bitor(),
            XorI32 => self.w.bitxor(),
            ShlI32 => self.w.lshift(),
            ShrSI32 => self.w.rshift(),
            ShrUI32 => {
                self.w.urshift();
                self.w.convert_i();
            }

            EqI32 | EqF => {
                self.w.strictequals();
                self.w.convert_i();
            }
            NeI32 | NeF => {
                self.w.strictequals();
                self.w.not();
                self.w.convert_i();
            }
            LtSI32 | LtUI32 | LtF => {
                self.w.lessthan();
                self.w.convert_i();
            }
            LeSI32 | LeUI32 | LeF => {
                self.w.lessequals();
                self.w.convert_i();
            }
            GtSI32 | GtUI32 | GtF => {
                self.w.greaterthan();
                self.w.convert_i();
            }
            GeSI32 | GeUI32 | GeF => {
                self.w.greaterequals();
                self.w.convert_i();
            }

            AddF => self.w.add(),
            SubF => self.w.subtract(),
            MulF => self.w.multiply(),
            DivF => self.w.divide(),

            MinF | MaxF | RotlI32 | RotrI32 | CopySignF => {
                unreachable!("handled above")
            }
        }
        Ok(())
    }

    fn emit_unary(&mut self, op: UnOp, value: &Expr) -> Result<()> {
        use UnOp::*;
        match op {
            CtzI32 => return Err(self.unsupported("i32.ctz")),
            PopcntI32 => return Err(self.unsupported("i32.popcnt")),
            TruncF => return Err(self.unsupported("float trunc")),
            NearestF => return Err(self.unsupported("float nearest")),

            ClzI32 => {
                let mn = self.asm.pool.member("wasm$clz32");
                self.w.getlocal(0);
                self.emit(value)?;
                self.w.callproperty(mn, 1);
                self.w.convert_i();
            }
            EqzI32 => {
                self.emit(value)?;
                let zero = self.asm.pool.int(0);
                self.w.pushint(zero);
                self.w.strictequals();
                self.w.convert_i();
            }
            Extend8S => {
                self.emit(value)?;
                self.w.sxi8();
            }
            Extend16S => {
                self.emit(value)?;
                self.w.sxi16();
            }

            NegF => {
                self.emit(value)?;
                self.w.negate();
            }
            AbsF | CeilF | FloorF | SqrtF => {
                let math = self.asm.pool.member("Math");
                let method = self.asm.pool.member(match op {
                    AbsF => "abs",
                    CeilF => "ceil",
                    FloorF => "floor",
                    _ => "sqrt",
                });
                self.w.getlex(math);
                self.emit(value)?;
                self.w.callproperty(method, 1);
                self.w.convert_d();
            }

            TruncSFToI32 => {
                self.emit(value)?;
                self.w.convert_i();
            }
            TruncUFToI32 => {
                self.emit(value)?;
                self.w.convert_u();
                self.w.convert_i();
            }
            ConvertSI32ToF => {
                self.emit(value)?;
                self.w.convert_d();
            }
            ConvertUI32ToF => {
                self.emit(value)?;
                self.w.convert_u();
                self.w.convert_d();
            }
            PromoteF32 => {
                // f32 already lives as Number.
                self.emit(value)?;
            }

            // Precision-faithful narrowing and bit reinterpretation both
            // round-trip through the host scratch slot.
            DemoteF64 => {
                let store = self.scratch("wasm2js_scratch_store_f64");
                let load = self.scratch("wasm2js_scratch_load_f32");
                self.w.getlocal(0);
                self.emit(value)?;
                self.w.callpropvoid(store, 1);
                self.w.getlocal(0);
                self.w.callproperty(load, 0);
                self.w.convert_d();
            }
            ReinterpretF32 => {
                let store = self.scratch("wasm2js_scratch_store_f32");
                let load = self.scratch("wasm2js_scratch_load_i32");
                self.w.getlocal(0);
                self.emit(value)?;
                self.w.callpropvoid(store, 1);
                self.w.getlocal(0);
                let two = self.asm.pool.int(2);
                self.w.pushint(two);
                self.w.callproperty(load, 1);
                self.w.convert_i();
            }
            ReinterpretI32 => {
                let store = self.scratch("wasm2js_scratch_store_i32");
                let load = self.scratch("wasm2js_scratch_load_f32");
                self.w.getlocal(0);
                let two = self.asm.pool.int(2);
                self.w.pushint(two);
                self.emit(value)?;
                self.w.callpropvoid(store, 2);
                self.w.getlocal(0);
                self.w.callproperty(load, 0);
                self.w.convert_d();
            }
        }
        Ok(())
    }

    /// Register a wasm2js scratch helper import and return the multiname of
    /// its slot. The helpers are usually declared by the module itself; if
    /// not, they are added so the instance initializer copies them in.
    fn scratch(&mut self, base: &str) -> swf::avm2::types::Index<swf::avm2::types::Multiname> {
        let slot = self.asm.ensure_scratch_import(base);
        self.asm.pool.member(&slot)
    }

    fn emit_call_indirect(
        &mut self,
        target: &Expr,
        operands: &[Expr],
        ty: Option<ValTy>,
    ) -> Result<()> {
        let table = self.asm.pool.member("wasm$table");
        let array = self.asm.pool.member("Array");
        let late = self.asm.pool.late_name();
        let num_args = operands.len() as u32;

        let pure = target.effect_free() && operands.iter().all(Expr::effect_free);
        if pure {
            // Cheap path: nothing observable can be reordered.
            self.w.getlocal(0);
            self.w.getproperty(table);
            self.w.coerce(array);
            self.emit(target)?;
            for operand in operands {
                self.emit(operand)?;
            }
        } else {
            // Wasm evaluates the operands, then the table index; AVM2 wants
            // the callee before the arguments. Spill the operands to scratch
            // locals in wasm order and reload them after the callee.
            let mut temps = Vec::with_capacity(operands.len());
            for operand in operands {
                self.emit(operand)?;
                let temp = self.w.acquire_temp();
                self.w.setlocal(temp);
                temps.push(temp);
            }
            self.w.getlocal(0);
            self.w.getproperty(table);
            self.w.coerce(array);
            self.emit(target)?;
            for &temp in &temps {
                self.w.getlocal(temp);
                self.w.kill(temp);
            }
            for &temp in temps.iter().rev() {
                self.w.release_temp(temp);
            }
        }

        match ty {
            None => self.w.callpropvoid_late(late, num_args),
            Some(t) => {
                self.w.callproperty_late(late, num_args);
                self.coerce(t);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abc::code::CodeWriter;
    use crate::assemble::Assembler;
    use crate::wasm::ir::WasmModule;
    use swf::avm2::types::Op;
    use swf::extensions::ReadSwfExt;

    fn decode(code: &[u8]) -> Vec<Op> {
        let mut reader = swf::avm2::read::Reader::new(code);
        let mut ops = Vec::new();
        loop {
            let offset = reader.as_slice().as_ptr() as usize - code.as_ptr() as usize;
            if offset >= code.len() {
                break;
            }
            ops.push(reader.read_op().expect("emitted bytecode must decode"));
        }
        ops
    }

    /// Lower one expression in a fresh method context and decode the result.
    fn lower(e: &Expr) -> (Vec<Op>, swf::avm2::types::ConstantPool, Assembler) {
        let module = WasmModule::default();
        let mut asm = Assembler::new("Instance", &module);
        let mut w = CodeWriter::new();
        w.set_local_base(8);
        let mut lowerer = FuncLowerer {
            asm: &mut asm,
            w,
            name: "f0".to_string(),
            result: None,
            labels: Vec::new(),
            stmt: 0,
            debug: false,
            trace_stmts: false,
        };
        lowerer.emit(e).expect("lowering failed");
        let mut w = lowerer.w;
        if e.ty().is_some() {
            w.pop();
        }
        let blob = w.finish().expect("emitter invariants hold");
        let ops = decode(&blob.code);
        let pool = std::mem::take(&mut asm.pool).finish();
        (ops, pool, asm)
    }

    fn int_const(pool: &swf::avm2::types::ConstantPool, idx: &swf::avm2::types::Index<i32>) -> i32 {
        pool.ints[(idx.0 - 1) as usize]
    }

    fn local(index: u32) -> Expr {
        Expr::LocalGet {
            index,
            ty: ValTy::I32,
        }
    }

    fn konst(v: i32) -> Expr {
        Expr::Const(Literal::I32(v))
    }

    fn call_void() -> Expr {
        Expr::Call {
            target: "f9".to_string(),
            operands: vec![],
            ty: None,
        }
    }

    fn call_i32() -> Expr {
        Expr::Call {
            target: "f9".to_string(),
            operands: vec![],
            ty: Some(ValTy::I32),
        }
    }

    #[test]
    fn i32_add_uses_integer_ops() {
        let e = Expr::Binary {
            op: BinOp::AddI32,
            lhs: Box::new(local(0)),
            rhs: Box::new(konst(7)),
        };
        let (ops, pool, _) = lower(&e);
        assert!(matches!(ops[0], Op::GetLocal { index: 1 }));
        let Op::PushInt { value } = &ops[1] else {
            panic!("expected pushint, got {:?}", ops[1]);
        };
        assert_eq!(int_const(&pool, value), 7);
        assert!(matches!(ops[2], Op::AddI));
    }

    #[test]
    fn unsigned_compare_is_framed_with_convert_u() {
        let e = Expr::Binary {
            op: BinOp::LtUI32,
            lhs: Box::new(local(0)),
            rhs: Box::new(local(1)),
        };
        let (ops, _, _) = lower(&e);
        assert!(matches!(ops[0], Op::GetLocal { index: 1 }));
        assert!(matches!(ops[1], Op::ConvertU));
        assert!(matches!(ops[2], Op::GetLocal { index: 2 }));
        assert!(matches!(ops[3], Op::ConvertU));
        assert!(matches!(ops[4], Op::LessThan));
        assert!(matches!(ops[5], Op::ConvertI));
    }

    #[test]
    fn unsigned_divide_recasts_the_result() {
        let e = Expr::Binary {
            op: BinOp::DivUI32,
            lhs: Box::new(local(0)),
            rhs: Box::new(local(1)),
        };
        let (ops, _, _) = lower(&e);
        let tail: Vec<_> = ops[ops.len() - 4..].iter().collect();
        assert!(matches!(tail[0], Op::Divide));
        assert!(matches!(tail[1], Op::ConvertU));
        assert!(matches!(tail[2], Op::ConvertI));
        assert!(matches!(tail[3], Op::Pop));
    }

    #[test]
    fn if_folds_the_inverse_comparator() {
        let e = Expr::If {
            cond: Box::new(Expr::Binary {
                op: BinOp::LtSI32,
                lhs: Box::new(local(0)),
                rhs: Box::new(local(1)),
            }),
            then: Box::new(Expr::Nop),
            otherwise: None,
            ty: None,
        };
        let (ops, _, _) = lower(&e);
        assert!(matches!(ops[0], Op::GetLocal { index: 1 }));
        assert!(matches!(ops[1], Op::GetLocal { index: 2 }));
        assert!(matches!(ops[2], Op::IfNlt { .. }), "{:?}", ops[2]);
        assert!(matches!(ops[3], Op::Nop));
    }

    #[test]
    fn conditional_break_folds_the_direct_comparator() {
        let e = Expr::Block {
            name: Some("out".to_string()),
            children: vec![Expr::Break {
                name: "out".to_string(),
                cond: Some(Box::new(Expr::Binary {
                    op: BinOp::GeUI32,
                    lhs: Box::new(local(0)),
                    rhs: Box::new(local(1)),
                })),
                value: None,
            }],
            ty: None,
        };
        let (ops, _, _) = lower(&e);
        assert!(matches!(ops[1], Op::ConvertU));
        assert!(matches!(ops[3], Op::ConvertU));
        assert!(matches!(ops[4], Op::IfGe { .. }), "{:?}", ops[4]);
    }

    #[test]
    fn eqz_condition_branches_on_the_value_itself() {
        let e = Expr::If {
            cond: Box::new(Expr::Unary {
                op: UnOp::EqzI32,
                value: Box::new(local(0)),
            }),
            then: Box::new(Expr::Nop),
            otherwise: None,
            ty: None,
        };
        let (ops, _, _) = lower(&e);
        assert!(matches!(ops[0], Op::GetLocal { index: 1 }));
        assert!(matches!(ops[1], Op::IfTrue { .. }));
    }

    #[test]
    fn loop_continue_is_a_labelled_back_edge() {
        let e = Expr::Block {
            name: Some("out".to_string()),
            children: vec![Expr::Loop {
                name: Some("top".to_string()),
                body: Box::new(Expr::Block {
                    name: None,
                    children: vec![
                        Expr::Break {
                            name: "out".to_string(),
                            cond: Some(Box::new(local(0))),
                            value: None,
                        },
                        Expr::Break {
                            name: "top".to_string(),
                            cond: None,
                            value: None,
                        },
                    ],
                    ty: None,
                }),
                ty: None,
            }],
            ty: None,
        };
        let (ops, _, _) = lower(&e);
        assert!(matches!(ops[0], Op::Label));
        let Op::Jump { offset } = ops[3] else {
            panic!("expected back-edge jump, got {:?}", ops[3]);
        };
        assert!(offset < 0, "back-edge offset must be negative: {offset}");
    }

    #[test]
    fn pure_store_emits_value_then_pointer() {
        let e = Expr::Store {
            ptr: Box::new(local(0)),
            value: Box::new(konst(1)),
            offset: 0,
            bytes: 4,
            ty: ValTy::I32,
        };
        let (ops, _, _) = lower(&e);
        assert!(matches!(ops[0], Op::PushInt { .. }));
        assert!(matches!(ops[1], Op::GetLocal { index: 1 }));
        assert!(matches!(ops[2], Op::Si32));
    }

    #[test]
    fn effectful_store_keeps_wasm_order_and_swaps() {
        let e = Expr::Store {
            ptr: Box::new(local(0)),
            value: Box::new(call_i32()),
            offset: 4,
            bytes: 4,
            ty: ValTy::I32,
        };
        let (ops, pool, _) = lower(&e);
        assert!(matches!(ops[0], Op::GetLocal { index: 1 }));
        let Op::PushInt { value } = &ops[1] else {
            panic!("expected offset pushint");
        };
        assert_eq!(int_const(&pool, value), 4);
        assert!(matches!(ops[2], Op::AddI));
        assert!(matches!(ops.last(), Some(Op::Si32)));
        assert!(
            ops.iter().any(|op| matches!(op, Op::Swap)),
            "effectful store must swap into value-then-pointer order"
        );
    }

    #[test]
    fn subword_signed_load_sign_extends() {
        let e = Expr::Load {
            ptr: Box::new(local(0)),
            offset: 1,
            bytes: 1,
            signed: true,
            ty: ValTy::I32,
        };
        let (ops, _, _) = lower(&e);
        assert!(matches!(ops[0], Op::GetLocal { index: 1 }));
        assert!(matches!(ops[1], Op::IncrementI));
        assert!(matches!(ops[2], Op::Li8));
        assert!(matches!(ops[3], Op::Sxi8));
    }

    #[test]
    fn local_increment_peephole() {
        let e = Expr::LocalSet {
            index: 2,
            value: Box::new(Expr::Binary {
                op: BinOp::AddI32,
                lhs: Box::new(local(2)),
                rhs: Box::new(konst(1)),
            }),
            tee: true,
        };
        let (ops, _, _) = lower(&e);
        assert!(matches!(ops[0], Op::IncLocalI { index: 3 }));
        assert!(matches!(ops[1], Op::GetLocal { index: 3 }));

        let e = Expr::LocalSet {
            index: 2,
            value: Box::new(Expr::Binary {
                op: BinOp::AddI32,
                lhs: Box::new(local(2)),
                rhs: Box::new(konst(-1)),
            }),
            tee: false,
        };
        let (ops, _, _) = lower(&e);
        assert!(matches!(ops[0], Op::DecLocalI { index: 3 }));
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn tee_without_peephole_dups() {
        let e = Expr::LocalSet {
            index: 0,
            value: Box::new(call_i32()),
            tee: true,
        };
        let (ops, _, _) = lower(&e);
        let n = ops.len();
        assert!(matches!(ops[n - 3], Op::Dup));
        assert!(matches!(ops[n - 2], Op::SetLocal { index: 1 }));
        assert!(matches!(ops[n - 1], Op::Pop));
    }

    #[test]
    fn global_access_registers_a_slot_and_coerces() {
        let e = Expr::GlobalGet {
            name: "g0".to_string(),
            ty: ValTy::I32,
        };
        let (ops, _, asm) = lower(&e);
        assert!(matches!(ops[0], Op::GetLocal { index: 0 }));
        assert!(matches!(ops[1], Op::GetProperty { .. }));
        assert!(matches!(ops[2], Op::ConvertI));
        assert_eq!(asm.global_slots().len(), 1);
        assert_eq!(asm.global_slots()[0].name, "g0");
    }

    #[test]
    fn select_evaluates_both_arms_strictly() {
        let e = Expr::Select {
            if_true: Box::new(konst(10)),
            if_false: Box::new(konst(20)),
            cond: Box::new(local(0)),
        };
        let (ops, _, _) = lower(&e);
        assert!(matches!(ops[0], Op::PushInt { .. }));
        assert!(matches!(ops[1], Op::PushInt { .. }));
        assert!(matches!(ops[2], Op::GetLocal { index: 1 }));
        assert!(matches!(ops[3], Op::IfTrue { .. }));
        assert!(matches!(ops[4], Op::Swap));
        assert!(matches!(ops[5], Op::Pop));
    }

    #[test]
    fn switch_lowers_to_lookupswitch() {
        let e = Expr::Block {
            name: Some("a".to_string()),
            children: vec![Expr::Block {
                name: Some("b".to_string()),
                children: vec![Expr::Switch {
                    cond: Box::new(local(0)),
                    names: vec!["a".to_string(), "b".to_string()],
                    default: "a".to_string(),
                }],
                ty: None,
            }],
            ty: None,
        };
        let (ops, _, _) = lower(&e);
        assert!(matches!(ops[0], Op::GetLocal { index: 1 }));
        let Op::LookupSwitch(switch) = &ops[1] else {
            panic!("expected lookupswitch, got {:?}", ops[1]);
        };
        assert_eq!(switch.case_offsets.len(), 2);
    }

    #[test]
    fn unreachable_throws_an_error() {
        let (ops, _, _) = lower(&Expr::Unreachable);
        assert!(matches!(ops[0], Op::FindPropStrict { .. }));
        assert!(matches!(ops[1], Op::PushString { .. }));
        assert!(matches!(ops[2], Op::ConstructProp { num_args: 1, .. }));
        assert!(matches!(ops[3], Op::Throw));
    }

    #[test]
    fn direct_call_pushes_receiver_first() {
        let e = Expr::Call {
            target: "f3".to_string(),
            operands: vec![local(0), konst(5)],
            ty: Some(ValTy::F64),
        };
        let (ops, _, _) = lower(&e);
        assert!(matches!(ops[0], Op::GetLocal { index: 0 }));
        assert!(matches!(ops[1], Op::GetLocal { index: 1 }));
        assert!(matches!(ops[2], Op::PushInt { .. }));
        assert!(matches!(ops[3], Op::CallProperty { num_args: 2, .. }));
        assert!(matches!(ops[4], Op::ConvertD));
    }

    #[test]
    fn pure_indirect_call_skips_the_temporaries() {
        let e = Expr::CallIndirect {
            target: Box::new(local(0)),
            operands: vec![local(1)],
            ty: Some(ValTy::I32),
        };
        let (ops, _, _) = lower(&e);
        assert!(matches!(ops[0], Op::GetLocal { index: 0 }));
        assert!(matches!(ops[1], Op::GetProperty { .. }));
        assert!(matches!(ops[2], Op::Coerce { .. }));
        assert!(matches!(ops[3], Op::GetLocal { index: 1 }));
        assert!(matches!(ops[4], Op::GetLocal { index: 2 }));
        assert!(matches!(ops[5], Op::CallProperty { num_args: 1, .. }));
        assert!(!ops.iter().any(|op| matches!(op, Op::Kill { .. })));
    }

    #[test]
    fn effectful_indirect_call_spills_operands_in_order() {
        let e = Expr::CallIndirect {
            target: Box::new(call_i32()),
            operands: vec![call_i32(), konst(3)],
            ty: None,
        };
        let (ops, _, _) = lower(&e);
        // Operands spill to the scratch locals in wasm order, then reload
        // after the callee with a kill each.
        let set_indices: Vec<u32> = ops
            .iter()
            .filter_map(|op| match op {
                Op::SetLocal { index } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(set_indices, vec![8, 9]);
        let kills: Vec<u32> = ops
            .iter()
            .filter_map(|op| match op {
                Op::Kill { index } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(kills, vec![8, 9]);
        assert!(matches!(ops.last(), Some(Op::CallPropVoid { num_args: 2, .. })));
    }

    #[test]
    fn demote_round_trips_through_the_scratch_helpers() {
        let e = Expr::Unary {
            op: UnOp::DemoteF64,
            value: Box::new(Expr::Const(Literal::F64(1.5))),
        };
        let (ops, _, asm) = lower(&e);
        assert!(matches!(ops[0], Op::GetLocal { index: 0 }));
        assert!(matches!(ops[1], Op::PushDouble { .. }));
        assert!(matches!(ops[2], Op::CallPropVoid { num_args: 1, .. }));
        assert!(matches!(ops[3], Op::GetLocal { index: 0 }));
        assert!(matches!(ops[4], Op::CallProperty { num_args: 0, .. }));
        assert!(matches!(ops[5], Op::ConvertD));
        let slots: Vec<&str> = asm.import_slots().iter().map(|i| i.base.as_str()).collect();
        assert!(slots.contains(&"wasm2js_scratch_store_f64"));
        assert!(slots.contains(&"wasm2js_scratch_load_f32"));
    }

    #[test]
    fn nan_uses_the_dedicated_opcode() {
        let (ops, pool, _) = lower(&Expr::Const(Literal::F64(f64::NAN)));
        assert!(matches!(ops[0], Op::PushNaN));
        assert!(pool.doubles.is_empty());
    }

    #[test]
    fn break_with_value_is_rejected() {
        let e = Expr::Block {
            name: Some("out".to_string()),
            children: vec![Expr::Break {
                name: "out".to_string(),
                cond: None,
                value: Some(Box::new(konst(1))),
            }],
            ty: None,
        };
        let module = WasmModule::default();
        let mut asm = Assembler::new("Instance", &module);
        let mut lowerer = FuncLowerer {
            asm: &mut asm,
            w: CodeWriter::new(),
            name: "f0".to_string(),
            result: None,
            labels: Vec::new(),
            stmt: 0,
            debug: false,
            trace_stmts: false,
        };
        let err = lowerer.emit(&e).unwrap_err();
        assert!(matches!(err, CompileError::Malformed { .. }), "{err}");
    }

    #[test]
    fn rotate_is_rejected_as_unsupported() {
        let e = Expr::Binary {
            op: BinOp::RotlI32,
            lhs: Box::new(local(0)),
            rhs: Box::new(local(1)),
        };
        let module = WasmModule::default();
        let mut asm = Assembler::new("Instance", &module);
        let mut lowerer = FuncLowerer {
            asm: &mut asm,
            w: CodeWriter::new(),
            name: "f0".to_string(),
            result: None,
            labels: Vec::new(),
            stmt: 0,
            debug: false,
            trace_stmts: false,
        };
        let err = lowerer.emit(&e).unwrap_err();
        assert!(matches!(err, CompileError::Unsupported { .. }), "{err}");
    }

    #[test]
    fn memory_host_ops_call_the_helpers() {
        let e = Expr::MemoryGrow {
            pages: Box::new(konst(1)),
        };
        let (ops, _, _) = lower(&e);
        assert!(matches!(ops[0], Op::GetLocal { index: 0 }));
        assert!(matches!(ops[1], Op::PushInt { .. }));
        assert!(matches!(ops[2], Op::CallProperty { num_args: 1, .. }));
        assert!(matches!(ops[3], Op::ConvertI));

        let (ops, _, _) = lower(&Expr::MemorySize);
        assert!(matches!(ops[1], Op::CallProperty { num_args: 0, .. }));
    }

    /// Lowering the folded and unfolded forms of the same comparison must
    /// branch the same way; the fold only skips materializing the boolean.
    #[test]
    fn folded_and_unfolded_conditions_use_matching_comparators() {
        let folded = Expr::If {
            cond: Box::new(Expr::Binary {
                op: BinOp::EqI32,
                lhs: Box::new(local(0)),
                rhs: Box::new(konst(0)),
            }),
            then: Box::new(Expr::Nop),
            otherwise: None,
            ty: None,
        };
        let (ops, _, _) = lower(&folded);
        assert!(matches!(ops[2], Op::IfStrictNe { .. }));

        // The unfolded boolean materialization of the same comparison.
        let unfolded = Expr::Binary {
            op: BinOp::EqI32,
            lhs: Box::new(local(0)),
            rhs: Box::new(konst(0)),
        };
        let (ops, _, _) = lower(&unfolded);
        assert!(matches!(ops[2], Op::StrictEquals));
        assert!(matches!(ops[3], Op::ConvertI));
    }
}
