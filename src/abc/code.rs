//! Method-body builder.
//!
//! Accumulates encoded AVM2 bytecode while statically simulating the operand
//! stack (for the method header's max_stack), the scope stack, and the local
//! register high-watermark. Branches go through `Label`s which may be
//! referenced before they are bound; forward references are patched when the
//! label binds. Branch offsets are s24 values relative to the end of the
//! branch instruction, except lookupswitch whose offsets are relative to the
//! switch opcode itself.
//!
//! Invariant violations (operand-stack underflow, binding a label twice,
//! releasing temporaries out of order, a used label never bound) are sticky:
//! the first one is reported by `finish`.

/// A branch target. Created unbound; bound at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug)]
struct Fixup {
    /// Byte position of the s24 placeholder.
    at: usize,
    /// Position the branch offset is relative to.
    base: usize,
}

#[derive(Debug, Default)]
struct LabelState {
    bound: Option<usize>,
    fixups: Vec<Fixup>,
    used: bool,
}

/// The finished body: code plus the header maxima.
#[derive(Debug)]
pub struct CodeBlob {
    pub code: Vec<u8>,
    pub max_stack: u32,
    pub local_count: u32,
    pub max_scope: u32,
}

pub struct CodeWriter {
    code: Vec<u8>,
    stack: u32,
    max_stack: u32,
    scope: u32,
    max_scope: u32,
    local_count: u32,
    next_temp: u32,
    labels: Vec<LabelState>,
    terminated: bool,
    error: Option<String>,
}

impl CodeWriter {
    pub fn new() -> Self {
        CodeWriter {
            code: Vec::new(),
            stack: 0,
            max_stack: 0,
            scope: 0,
            max_scope: 0,
            local_count: 1,
            next_temp: 1,
            labels: Vec::new(),
            terminated: false,
            error: None,
        }
    }

    // -- bookkeeping ------------------------------------------------------

    fn fail(&mut self, msg: String) {
        if self.error.is_none() {
            self.error = Some(msg);
        }
    }

    fn effect(&mut self, pops: u32, pushes: u32) {
        self.terminated = false;
        if self.stack < pops {
            self.fail(format!(
                "operand stack underflow at offset {}: need {pops}, have {}",
                self.code.len(),
                self.stack
            ));
            self.stack = 0;
        } else {
            self.stack -= pops;
        }
        self.stack += pushes;
        self.max_stack = self.max_stack.max(self.stack);
    }

    fn byte(&mut self, b: u8) {
        self.code.push(b);
    }

    fn u30(&mut self, mut value: u32) {
        loop {
            let b = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                self.byte(b);
                break;
            }
            self.byte(b | 0x80);
        }
    }

    fn touch_local(&mut self, index: u32) {
        self.local_count = self.local_count.max(index + 1);
    }

    /// First register index available for scratch temporaries (one past the
    /// receiver, parameters, and declared locals). Registers below the base
    /// count as occupied even if never touched.
    pub fn set_local_base(&mut self, base: u32) {
        self.next_temp = base;
        self.local_count = self.local_count.max(base);
    }

    pub fn acquire_temp(&mut self) -> u32 {
        let index = self.next_temp;
        self.next_temp += 1;
        self.touch_local(index);
        index
    }

    pub fn release_temp(&mut self, index: u32) {
        if index + 1 != self.next_temp {
            self.fail(format!("temporary local {index} released out of order"));
            return;
        }
        self.next_temp -= 1;
    }

    /// True when the last emitted instruction unconditionally left the
    /// method (return or throw) and no label has been bound since.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    // -- labels -----------------------------------------------------------

    pub fn new_label(&mut self) -> Label {
        self.labels.push(LabelState::default());
        Label(self.labels.len() - 1)
    }

    pub fn used(&self, label: Label) -> bool {
        self.labels[label.0].used
    }

    /// Bind a forward-referenced label at the current position.
    pub fn bind(&mut self, label: Label) {
        let here = self.code.len();
        let state = &mut self.labels[label.0];
        if state.bound.is_some() {
            self.fail(format!("label bound twice at offset {here}"));
            return;
        }
        state.bound = Some(here);
        let fixups = std::mem::take(&mut state.fixups);
        for fixup in fixups {
            self.patch(fixup.at, here as i64 - fixup.base as i64);
        }
        self.terminated = false;
    }

    /// Bind a label that will be the target of back-edges. The verifier
    /// requires a `label` instruction at such targets, so one is emitted at
    /// the bind site.
    pub fn bind_backward(&mut self, label: Label) {
        self.bind(label);
        self.byte(0x09); // label
    }

    fn patch(&mut self, at: usize, offset: i64) {
        if !(-(1 << 23)..(1 << 23)).contains(&offset) {
            self.fail(format!("branch offset {offset} exceeds s24 range"));
            return;
        }
        let bytes = (offset as i32).to_le_bytes();
        self.code[at..at + 3].copy_from_slice(&bytes[..3]);
    }

    /// Record a reference from the placeholder at `at` (relative to `base`).
    fn refer(&mut self, label: Label, at: usize, base: usize) {
        self.labels[label.0].used = true;
        match self.labels[label.0].bound {
            Some(target) => self.patch(at, target as i64 - base as i64),
            None => self.labels[label.0].fixups.push(Fixup { at, base }),
        }
    }

    fn branch(&mut self, opcode: u8, pops: u32, label: Label) {
        self.effect(pops, 0);
        self.byte(opcode);
        let at = self.code.len();
        self.code.extend_from_slice(&[0, 0, 0]);
        let base = self.code.len();
        self.refer(label, at, base);
    }

    // -- control flow -----------------------------------------------------

    pub fn jump(&mut self, label: Label) {
        self.branch(0x10, 0, label);
        self.terminated = true;
    }

    pub fn iftrue(&mut self, label: Label) {
        self.branch(0x11, 1, label);
    }

    pub fn iffalse(&mut self, label: Label) {
        self.branch(0x12, 1, label);
    }

    pub fn ifstricteq(&mut self, label: Label) {
        self.branch(0x19, 2, label);
    }

    pub fn ifstrictne(&mut self, label: Label) {
        self.branch(0x1A, 2, label);
    }

    pub fn iflt(&mut self, label: Label) {
        self.branch(0x15, 2, label);
    }

    pub fn ifle(&mut self, label: Label) {
        self.branch(0x16, 2, label);
    }

    pub fn ifgt(&mut self, label: Label) {
        self.branch(0x17, 2, label);
    }

    pub fn ifge(&mut self, label: Label) {
        self.branch(0x18, 2, label);
    }

    pub fn ifnlt(&mut self, label: Label) {
        self.branch(0x0C, 2, label);
    }

    pub fn ifnle(&mut self, label: Label) {
        self.branch(0x0D, 2, label);
    }

    pub fn ifngt(&mut self, label: Label) {
        self.branch(0x0E, 2, label);
    }

    pub fn ifnge(&mut self, label: Label) {
        self.branch(0x0F, 2, label);
    }

    /// lookupswitch with `cases` jump targets for values `0..cases.len()`
    /// and `default` for everything else. Offsets are relative to the
    /// opcode position.
    pub fn lookupswitch(&mut self, default: Label, cases: &[Label]) {
        if cases.is_empty() {
            self.fail("lookupswitch needs at least one case".to_string());
            return;
        }
        self.effect(1, 0);
        let base = self.code.len();
        self.byte(0x1B);
        let at = self.code.len();
        self.code.extend_from_slice(&[0, 0, 0]);
        self.refer(default, at, base);
        self.u30(cases.len() as u32 - 1);
        for &case in cases {
            let at = self.code.len();
            self.code.extend_from_slice(&[0, 0, 0]);
            self.refer(case, at, base);
        }
        self.terminated = true;
    }

    pub fn returnvoid(&mut self) {
        self.effect(0, 0);
        self.byte(0x47);
        self.terminated = true;
    }

    pub fn returnvalue(&mut self) {
        self.effect(1, 0);
        self.byte(0x48);
        self.terminated = true;
    }

    pub fn throw(&mut self) {
        self.effect(1, 0);
        self.byte(0x03);
        self.terminated = true;
    }

    pub fn nop(&mut self) {
        self.effect(0, 0);
        self.byte(0x02);
    }

    // -- locals -----------------------------------------------------------

    pub fn getlocal(&mut self, index: u32) {
        self.effect(0, 1);
        self.touch_local(index);
        if index <= 3 {
            self.byte(0xD0 + index as u8);
        } else {
            self.byte(0x62);
            self.u30(index);
        }
    }

    pub fn setlocal(&mut self, index: u32) {
        self.effect(1, 0);
        self.touch_local(index);
        if index <= 3 {
            self.byte(0xD4 + index as u8);
        } else {
            self.byte(0x63);
            self.u30(index);
        }
    }

    pub fn kill(&mut self, index: u32) {
        self.effect(0, 0);
        self.byte(0x08);
        self.u30(index);
    }

    pub fn inclocal_i(&mut self, index: u32) {
        self.effect(0, 0);
        self.touch_local(index);
        self.byte(0xC2);
        self.u30(index);
    }

    pub fn declocal_i(&mut self, index: u32) {
        self.effect(0, 0);
        self.touch_local(index);
        self.byte(0xC3);
        self.u30(index);
    }

    // -- stack and scope --------------------------------------------------

    pub fn dup(&mut self) {
        self.effect(1, 2);
        self.byte(0x2A);
    }

    pub fn swap(&mut self) {
        self.effect(2, 2);
        self.byte(0x2B);
    }

    pub fn pop(&mut self) {
        self.effect(1, 0);
        self.byte(0x29);
    }

    pub fn pushscope(&mut self) {
        self.effect(1, 0);
        self.byte(0x30);
        self.scope += 1;
        self.max_scope = self.max_scope.max(self.scope);
    }

    pub fn popscope(&mut self) {
        self.effect(0, 0);
        self.byte(0x1D);
        if self.scope == 0 {
            self.fail("scope stack underflow".to_string());
        } else {
            self.scope -= 1;
        }
    }

    pub fn getscopeobject(&mut self, index: u8) {
        self.effect(0, 1);
        self.byte(0x65);
        self.byte(index);
    }

    // -- constants --------------------------------------------------------

    pub fn pushint(&mut self, index: swf::avm2::types::Index<i32>) {
        self.effect(0, 1);
        self.byte(0x2D);
        self.u30(index.0);
    }

    pub fn pushdouble(&mut self, index: swf::avm2::types::Index<f64>) {
        self.effect(0, 1);
        self.byte(0x2F);
        self.u30(index.0);
    }

    pub fn pushnan(&mut self) {
        self.effect(0, 1);
        self.byte(0x28);
    }

    pub fn pushstring(&mut self, index: swf::avm2::types::Index<String>) {
        self.effect(0, 1);
        self.byte(0x2C);
        self.u30(index.0);
    }

    // -- arithmetic -------------------------------------------------------

    pub fn add(&mut self) {
        self.effect(2, 1);
        self.byte(0xA0);
    }

    pub fn add_i(&mut self) {
        self.effect(2, 1);
        self.byte(0xC5);
    }

    pub fn subtract(&mut self) {
        self.effect(2, 1);
        self.byte(0xA1);
    }

    pub fn subtract_i(&mut self) {
        self.effect(2, 1);
        self.byte(0xC6);
    }

    pub fn multiply(&mut self) {
        self.effect(2, 1);
        self.byte(0xA2);
    }

    pub fn multiply_i(&mut self) {
        self.effect(2, 1);
        self.byte(0xC7);
    }

    pub fn divide(&mut self) {
        self.effect(2, 1);
        self.byte(0xA3);
    }

    pub fn modulo(&mut self) {
        self.effect(2, 1);
        self.byte(0xA4);
    }

    pub fn negate(&mut self) {
        self.effect(1, 1);
        self.byte(0x90);
    }

    pub fn increment_i(&mut self) {
        self.effect(1, 1);
        self.byte(0xC0);
    }

    pub fn bitand(&mut self) {
        self.effect(2, 1);
        self.byte(0xA8);
    }

    pub fn bitor(&mut self) {
        self.effect(2, 1);
        self.byte(0xA9);
    }

    pub fn bitxor(&mut self) {
        self.effect(2, 1);
        self.byte(0xAA);
    }

    pub fn lshift(&mut self) {
        self.effect(2, 1);
        self.byte(0xA5);
    }

    pub fn rshift(&mut self) {
        self.effect(2, 1);
        self.byte(0xA6);
    }

    pub fn urshift(&mut self) {
        self.effect(2, 1);
        self.byte(0xA7);
    }

    pub fn sxi8(&mut self) {
        self.effect(1, 1);
        self.byte(0x51);
    }

    pub fn sxi16(&mut self) {
        self.effect(1, 1);
        self.byte(0x52);
    }

    // -- comparisons ------------------------------------------------------

    pub fn strictequals(&mut self) {
        self.effect(2, 1);
        self.byte(0xAC);
    }

    pub fn lessthan(&mut self) {
        self.effect(2, 1);
        self.byte(0xAD);
    }

    pub fn lessequals(&mut self) {
        self.effect(2, 1);
        self.byte(0xAE);
    }

    pub fn greaterthan(&mut self) {
        self.effect(2, 1);
        self.byte(0xAF);
    }

    pub fn greaterequals(&mut self) {
        self.effect(2, 1);
        self.byte(0xB0);
    }

    pub fn not(&mut self) {
        self.effect(1, 1);
        self.byte(0x96);
    }

    // -- conversions ------------------------------------------------------

    pub fn convert_i(&mut self) {
        self.effect(1, 1);
        self.byte(0x73);
    }

    pub fn convert_u(&mut self) {
        self.effect(1, 1);
        self.byte(0x74);
    }

    pub fn convert_d(&mut self) {
        self.effect(1, 1);
        self.byte(0x75);
    }

    pub fn coerce(&mut self, name: swf::avm2::types::Index<swf::avm2::types::Multiname>) {
        self.effect(1, 1);
        self.byte(0x80);
        self.u30(name.0);
    }

    // -- domain memory ----------------------------------------------------

    pub fn li8(&mut self) {
        self.effect(1, 1);
        self.byte(0x35);
    }

    pub fn li16(&mut self) {
        self.effect(1, 1);
        self.byte(0x36);
    }

    pub fn li32(&mut self) {
        self.effect(1, 1);
        self.byte(0x37);
    }

    pub fn lf32(&mut self) {
        self.effect(1, 1);
        self.byte(0x38);
    }

    pub fn lf64(&mut self) {
        self.effect(1, 1);
        self.byte(0x39);
    }

    pub fn si8(&mut self) {
        self.effect(2, 0);
        self.byte(0x3A);
    }

    pub fn si16(&mut self) {
        self.effect(2, 0);
        self.byte(0x3B);
    }

    pub fn si32(&mut self) {
        self.effect(2, 0);
        self.byte(0x3C);
    }

    pub fn sf32(&mut self) {
        self.effect(2, 0);
        self.byte(0x3D);
    }

    pub fn sf64(&mut self) {
        self.effect(2, 0);
        self.byte(0x3E);
    }

    // -- properties and calls ---------------------------------------------

    pub fn getproperty(&mut self, name: swf::avm2::types::Index<swf::avm2::types::Multiname>) {
        self.effect(1, 1);
        self.byte(0x66);
        self.u30(name.0);
    }

    pub fn setproperty(&mut self, name: swf::avm2::types::Index<swf::avm2::types::Multiname>) {
        self.effect(2, 0);
        self.byte(0x61);
        self.u30(name.0);
    }

    /// setproperty through a runtime multiname: pops value, name, object.
    pub fn setproperty_late(&mut self, name: swf::avm2::types::Index<swf::avm2::types::Multiname>) {
        self.effect(3, 0);
        self.byte(0x61);
        self.u30(name.0);
    }

    pub fn initproperty(&mut self, name: swf::avm2::types::Index<swf::avm2::types::Multiname>) {
        self.effect(2, 0);
        self.byte(0x68);
        self.u30(name.0);
    }

    pub fn findpropstrict(&mut self, name: swf::avm2::types::Index<swf::avm2::types::Multiname>) {
        self.effect(0, 1);
        self.byte(0x5D);
        self.u30(name.0);
    }

    pub fn getlex(&mut self, name: swf::avm2::types::Index<swf::avm2::types::Multiname>) {
        self.effect(0, 1);
        self.byte(0x60);
        self.u30(name.0);
    }

    pub fn callproperty(
        &mut self,
        name: swf::avm2::types::Index<swf::avm2::types::Multiname>,
        num_args: u32,
    ) {
        self.effect(1 + num_args, 1);
        self.byte(0x46);
        self.u30(name.0);
        self.u30(num_args);
    }

    /// callproperty through a runtime multiname: the name sits between the
    /// receiver and the arguments.
    pub fn callproperty_late(
        &mut self,
        name: swf::avm2::types::Index<swf::avm2::types::Multiname>,
        num_args: u32,
    ) {
        self.effect(2 + num_args, 1);
        self.byte(0x46);
        self.u30(name.0);
        self.u30(num_args);
    }

    pub fn callpropvoid(
        &mut self,
        name: swf::avm2::types::Index<swf::avm2::types::Multiname>,
        num_args: u32,
    ) {
        self.effect(1 + num_args, 0);
        self.byte(0x4F);
        self.u30(name.0);
        self.u30(num_args);
    }

    pub fn callpropvoid_late(
        &mut self,
        name: swf::avm2::types::Index<swf::avm2::types::Multiname>,
        num_args: u32,
    ) {
        self.effect(2 + num_args, 0);
        self.byte(0x4F);
        self.u30(name.0);
        self.u30(num_args);
    }

    pub fn constructprop(
        &mut self,
        name: swf::avm2::types::Index<swf::avm2::types::Multiname>,
        num_args: u32,
    ) {
        self.effect(1 + num_args, 1);
        self.byte(0x4A);
        self.u30(name.0);
        self.u30(num_args);
    }

    pub fn constructsuper(&mut self, num_args: u32) {
        self.effect(1 + num_args, 0);
        self.byte(0x49);
        self.u30(num_args);
    }

    pub fn newobject(&mut self, num_pairs: u32) {
        self.effect(2 * num_pairs, 1);
        self.byte(0x55);
        self.u30(num_pairs);
    }

    pub fn newarray(&mut self, num_args: u32) {
        self.effect(num_args, 1);
        self.byte(0x56);
        self.u30(num_args);
    }

    pub fn newclass(&mut self, class: swf::avm2::types::Index<swf::avm2::types::Class>) {
        self.effect(1, 1);
        self.byte(0x58);
        self.u30(class.0);
    }

    // -- debug ------------------------------------------------------------

    pub fn debugfile(&mut self, name: swf::avm2::types::Index<String>) {
        self.effect(0, 0);
        self.byte(0xF1);
        self.u30(name.0);
    }

    pub fn debugline(&mut self, line: u32) {
        self.effect(0, 0);
        self.byte(0xF0);
        self.u30(line);
    }

    // -- completion -------------------------------------------------------

    pub fn finish(self) -> Result<CodeBlob, String> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if self.stack != 0 {
            return Err(format!(
                "operand stack not empty at end of method: depth {}",
                self.stack
            ));
        }
        for (i, label) in self.labels.iter().enumerate() {
            if label.used && label.bound.is_none() {
                return Err(format!("label {i} referenced but never bound"));
            }
        }
        Ok(CodeBlob {
            code: self.code,
            max_stack: self.max_stack,
            local_count: self.local_count,
            max_scope: self.max_scope,
        })
    }
}

impl Default for CodeWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swf::avm2::types::Index;

    #[test]
    fn short_and_long_local_forms() {
        let mut w = CodeWriter::new();
        w.getlocal(0);
        w.getlocal(3);
        w.getlocal(4);
        w.setlocal(2);
        w.pop();
        w.pop();
        let blob = w.finish().unwrap();
        assert_eq!(blob.code, vec![0xD0, 0xD3, 0x62, 0x04, 0xD6, 0x29, 0x29]);
        assert_eq!(blob.local_count, 5);
        assert_eq!(blob.max_stack, 3);
    }

    #[test]
    fn u30_uses_seven_bit_groups() {
        let mut w = CodeWriter::new();
        w.getlocal(300);
        w.pop();
        let blob = w.finish().unwrap();
        assert_eq!(blob.code, vec![0x62, 0xAC, 0x02, 0x29]);
    }

    #[test]
    fn forward_branch_is_patched_at_bind() {
        let mut w = CodeWriter::new();
        let l = w.new_label();
        w.jump(l);
        w.nop();
        w.bind(l);
        w.returnvoid();
        let blob = w.finish().unwrap();
        // jump offset counts from the end of the instruction (position 4)
        // to the bind site (position 5).
        assert_eq!(blob.code, vec![0x10, 0x01, 0x00, 0x00, 0x02, 0x47]);
    }

    #[test]
    fn backward_branch_targets_the_label_opcode() {
        let mut w = CodeWriter::new();
        let l = w.new_label();
        w.bind_backward(l);
        w.nop();
        w.jump(l);
        let blob = w.finish().unwrap();
        // label at 0, nop at 1, jump at 2 with base 6: offset 0 - 6 = -6.
        assert_eq!(blob.code, vec![0x09, 0x02, 0x10, 0xFA, 0xFF, 0xFF]);
    }

    #[test]
    fn lookupswitch_offsets_are_switch_relative() {
        let mut w = CodeWriter::new();
        w.getlocal(1);
        let default = w.new_label();
        let case = w.new_label();
        w.lookupswitch(default, &[case]);
        w.bind(case);
        w.bind(default);
        w.returnvoid();
        let blob = w.finish().unwrap();
        // getlocal1 at 0, switch at 1, ends at 9; both targets bind at 9 →
        // offset 8 relative to the switch opcode.
        assert_eq!(
            blob.code,
            vec![0xD1, 0x1B, 0x08, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x47]
        );
    }

    #[test]
    fn stack_underflow_is_reported() {
        let mut w = CodeWriter::new();
        w.getlocal(1);
        w.add_i();
        let err = w.finish().unwrap_err();
        assert!(err.contains("underflow"), "{err}");
    }

    #[test]
    fn unbalanced_stack_is_reported() {
        let mut w = CodeWriter::new();
        w.getlocal(1);
        let err = w.finish().unwrap_err();
        assert!(err.contains("not empty"), "{err}");
    }

    #[test]
    fn used_unbound_label_is_reported() {
        let mut w = CodeWriter::new();
        let l = w.new_label();
        w.jump(l);
        let err = w.finish().unwrap_err();
        assert!(err.contains("never bound"), "{err}");
    }

    #[test]
    fn double_bind_is_reported() {
        let mut w = CodeWriter::new();
        let l = w.new_label();
        w.bind(l);
        w.bind(l);
        let err = w.finish().unwrap_err();
        assert!(err.contains("bound twice"), "{err}");
    }

    #[test]
    fn temporaries_are_stack_disciplined() {
        let mut w = CodeWriter::new();
        w.set_local_base(3);
        let a = w.acquire_temp();
        let b = w.acquire_temp();
        assert_eq!((a, b), (3, 4));
        w.release_temp(b);
        w.release_temp(a);
        let c = w.acquire_temp();
        assert_eq!(c, 3);
        w.release_temp(c);
        assert!(w.finish().unwrap().local_count >= 5);

        let mut w = CodeWriter::new();
        w.set_local_base(3);
        let a = w.acquire_temp();
        let _b = w.acquire_temp();
        w.release_temp(a);
        let err = w.finish().unwrap_err();
        assert!(err.contains("out of order"), "{err}");
    }

    #[test]
    fn max_stack_tracks_the_high_watermark() {
        let mut w = CodeWriter::new();
        let one = Index::new(1);
        w.pushint(one);
        w.pushint(one);
        w.pushint(one);
        w.add_i();
        w.add_i();
        w.returnvalue();
        let blob = w.finish().unwrap();
        assert_eq!(blob.max_stack, 3);
    }

    #[test]
    fn scope_depth_is_tracked() {
        let mut w = CodeWriter::new();
        w.getlocal(0);
        w.pushscope();
        w.returnvoid();
        let blob = w.finish().unwrap();
        assert_eq!(blob.max_scope, 1);
    }
}
