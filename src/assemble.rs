//! Module assembly: synthesizes the single ABC class representing the wasm
//! instance.
//!
//! The class carries one slot trait per global/memory/table/import, one
//! final method trait per wasm function, four runtime helpers, an instance
//! initializer that wires memory/table/globals/imports/exports together,
//! and a script initializer that installs the class (plus an optional
//! `Wrapper extends Sprite` shell for the Flash loader).

use std::collections::HashSet;

use swf::avm2::types::{
    AbcFile, Class, Index, Instance, Method, MethodBody, MethodFlags, MethodParam, Multiname,
    Script, Trait, TraitKind,
};

use crate::abc::code::{CodeBlob, CodeWriter};
use crate::abc::pool::PoolBuilder;
use crate::error::{CompileError, Result};
use crate::lower::{lower_function, lower_import};
use crate::trace::TraceConfig;
use crate::wasm::ir::{ExportKind, ExprTy, Literal, ValTy, WasmModule};

/// Default linear-memory allocation: the ByteArray starts at 2^24 bytes.
const DEFAULT_MEMORY_BYTES: i32 = 1 << 24;

#[derive(Debug, Clone)]
pub(crate) struct GlobalSlot {
    pub(crate) name: String,
    pub(crate) ty: ValTy,
}

#[derive(Debug, Clone)]
pub(crate) struct ImportSlot {
    pub(crate) module: String,
    pub(crate) base: String,
}

/// Shared assembly state: the constant pool, the method tables, and the
/// lazily discovered global/import registries.
pub(crate) struct Assembler {
    pub(crate) pool: PoolBuilder,
    class_name: String,
    methods: Vec<Method>,
    method_bodies: Vec<MethodBody>,
    globals: Vec<GlobalSlot>,
    global_names: HashSet<String>,
    imports: Vec<ImportSlot>,
    import_keys: HashSet<(String, String)>,
}

impl Assembler {
    pub(crate) fn new(class_name: &str, module: &WasmModule) -> Self {
        let mut asm = Assembler {
            pool: PoolBuilder::new(),
            class_name: class_name.to_string(),
            methods: Vec::new(),
            method_bodies: Vec::new(),
            globals: Vec::new(),
            global_names: HashSet::new(),
            imports: Vec::new(),
            import_keys: HashSet::new(),
        };
        for func in &module.functions {
            if let Some((module_name, base)) = &func.import {
                asm.register_import(module_name, base);
            }
        }
        asm
    }

    pub(crate) fn class_multiname(&mut self) -> Index<Multiname> {
        let name = self.class_name.clone();
        self.pool.member(&name)
    }

    /// Globals are discovered lazily as code references them; the assembler
    /// additionally walks exports to catch globals never touched by code.
    pub(crate) fn ensure_global(&mut self, name: &str, ty: ValTy) {
        if self.global_names.insert(name.to_string()) {
            self.globals.push(GlobalSlot {
                name: name.to_string(),
                ty,
            });
        }
    }

    pub(crate) fn global_slots(&self) -> &[GlobalSlot] {
        &self.globals
    }

    pub(crate) fn import_slots(&self) -> &[ImportSlot] {
        &self.imports
    }

    fn register_import(&mut self, module: &str, base: &str) {
        if self
            .import_keys
            .insert((module.to_string(), base.to_string()))
        {
            self.imports.push(ImportSlot {
                module: module.to_string(),
                base: base.to_string(),
            });
        }
    }

    /// Register a wasm2js scratch helper under the `env` module unless the
    /// input module already imports it, and return its slot name.
    pub(crate) fn ensure_scratch_import(&mut self, base: &str) -> String {
        self.register_import("env", base);
        self.import_slot_name("env", base)
    }

    pub(crate) fn import_slot_name(&self, module: &str, base: &str) -> String {
        format!("import${module}${base}")
    }

    fn val_type_multiname(&mut self, ty: ValTy) -> Index<Multiname> {
        match ty {
            ValTy::I32 => self.pool.member("int"),
            ValTy::F32 | ValTy::F64 => self.pool.member("Number"),
        }
    }

    /// Record a method with int/Number-typed parameters.
    pub(crate) fn add_method(
        &mut self,
        name: &str,
        params: &[ValTy],
        result: ExprTy,
        blob: CodeBlob,
    ) -> Index<Method> {
        let param_types: Vec<Index<Multiname>> =
            params.iter().map(|&p| self.val_type_multiname(p)).collect();
        let return_type = match result {
            None => self.pool.member("void"),
            Some(t) => self.val_type_multiname(t),
        };
        self.add_method_raw(name, param_types, return_type, blob)
    }

    pub(crate) fn add_method_raw(
        &mut self,
        name: &str,
        param_types: Vec<Index<Multiname>>,
        return_type: Index<Multiname>,
        blob: CodeBlob,
    ) -> Index<Method> {
        let name_idx = self.pool.string(name);
        let params = param_types
            .into_iter()
            .map(|kind| MethodParam {
                kind,
                name: None,
                default_value: None,
            })
            .collect();
        let index = Index::new(self.methods.len() as u32);
        self.methods.push(Method {
            name: name_idx,
            params,
            return_type,
            flags: MethodFlags::empty(),
            body: None,
        });
        self.method_bodies.push(MethodBody {
            method: index,
            max_stack: blob.max_stack,
            num_locals: blob.local_count,
            init_scope_depth: 0,
            max_scope_depth: blob.max_scope,
            code: blob.code,
            exceptions: Vec::new(),
            traits: Vec::new(),
        });
        index
    }

    fn finish_blob(&self, name: &str, w: CodeWriter) -> Result<CodeBlob> {
        w.finish()
            .map_err(|message| CompileError::internal(name, message))
    }
}

/// Reassign `ApplicationDomain.currentDomain.domainMemory` from the
/// `wasm$memory` slot. Required after any operation that may have replaced
/// the backing buffer. Stack-neutral.
pub(crate) fn emit_domain_memory_reattach(asm: &mut Assembler, w: &mut CodeWriter) {
    let app_domain = asm.pool.qname("flash.system", "ApplicationDomain");
    let current = asm.pool.member("currentDomain");
    let memory = asm.pool.member("wasm$memory");
    let domain_memory = asm.pool.member("domainMemory");
    w.getlex(app_domain);
    w.getproperty(current);
    w.getlocal(0);
    w.getproperty(memory);
    w.setproperty(domain_memory);
}

/// Encode data-segment bytes as one character per byte. This is the only
/// portable channel the ABC constant pool offers for binary payloads; the
/// instance initializer unpacks it with `wasm$memory_init`.
pub(crate) fn segment_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

// ---------------------------------------------------------------------------
// Runtime helpers
// ---------------------------------------------------------------------------

/// clz32(x:int):int counts leading zeros by binary search over the shifts
/// {16, 8, 4, 2, 1}.
fn emit_clz32(asm: &mut Assembler) -> Result<Index<Method>> {
    let mut w = CodeWriter::new();
    w.set_local_base(3);
    w.getlocal(0);
    w.pushscope();

    let nonzero = w.new_label();
    w.getlocal(1);
    w.iftrue(nonzero);
    w.pushint(asm.pool.int(32));
    w.returnvalue();
    w.bind(nonzero);

    w.pushint(asm.pool.int(0));
    w.setlocal(2);
    for (shift, step) in [(16, 16), (24, 8), (28, 4), (30, 2)] {
        let occupied = w.new_label();
        w.getlocal(1);
        w.pushint(asm.pool.int(shift));
        w.urshift();
        w.convert_i();
        w.iftrue(occupied);
        w.getlocal(2);
        w.pushint(asm.pool.int(step));
        w.add_i();
        w.setlocal(2);
        w.getlocal(1);
        w.pushint(asm.pool.int(step));
        w.lshift();
        w.setlocal(1);
        w.bind(occupied);
    }
    // n + 1 - (x >>> 31)
    w.getlocal(2);
    w.pushint(asm.pool.int(1));
    w.add_i();
    w.getlocal(1);
    w.pushint(asm.pool.int(31));
    w.urshift();
    w.convert_i();
    w.subtract_i();
    w.returnvalue();

    let blob = asm.finish_blob("wasm$clz32", w)?;
    Ok(asm.add_method("wasm$clz32", &[ValTy::I32], Some(ValTy::I32), blob))
}

/// memory_grow(pages:int):int resizes the ByteArray, reattach domain
/// memory, return the old size in pages. No maximum is enforced.
fn emit_memory_grow(asm: &mut Assembler) -> Result<Index<Method>> {
    let memory = asm.pool.member("wasm$memory");
    let length = asm.pool.member("length");
    let sixteen = asm.pool.int(16);

    let mut w = CodeWriter::new();
    w.set_local_base(3);
    w.getlocal(0);
    w.pushscope();

    // old = length >>> 16
    w.getlocal(0);
    w.getproperty(memory);
    w.getproperty(length);
    w.pushint(sixteen);
    w.urshift();
    w.convert_i();
    w.setlocal(2);

    // memory.length = (pages + old) << 16
    w.getlocal(0);
    w.getproperty(memory);
    w.getlocal(1);
    w.getlocal(2);
    w.add_i();
    w.pushint(sixteen);
    w.lshift();
    w.setproperty(length);

    emit_domain_memory_reattach(asm, &mut w);

    w.getlocal(2);
    w.returnvalue();

    let blob = asm.finish_blob("wasm$memory_grow", w)?;
    Ok(asm.add_method("wasm$memory_grow", &[ValTy::I32], Some(ValTy::I32), blob))
}

/// memory_size():int returns the byte length >>> 16.
fn emit_memory_size(asm: &mut Assembler) -> Result<Index<Method>> {
    let memory = asm.pool.member("wasm$memory");
    let length = asm.pool.member("length");
    let sixteen = asm.pool.int(16);

    let mut w = CodeWriter::new();
    w.getlocal(0);
    w.pushscope();
    w.getlocal(0);
    w.getproperty(memory);
    w.getproperty(length);
    w.pushint(sixteen);
    w.urshift();
    w.convert_i();
    w.returnvalue();

    let blob = asm.finish_blob("wasm$memory_size", w)?;
    Ok(asm.add_method("wasm$memory_size", &[], Some(ValTy::I32), blob))
}

/// memory_init(byteOffset:int, data:String):void writes charCodeAt(i) into
/// memory at byteOffset+i.
fn emit_memory_init(asm: &mut Assembler) -> Result<Index<Method>> {
    let char_code_at = asm.pool.member("charCodeAt");
    let length = asm.pool.member("length");
    let zero = asm.pool.int(0);

    let mut w = CodeWriter::new();
    w.set_local_base(4);
    w.getlocal(0);
    w.pushscope();

    w.pushint(zero);
    w.setlocal(3);
    let cond = w.new_label();
    let body = w.new_label();
    w.jump(cond);

    w.bind_backward(body);
    w.getlocal(2);
    w.getlocal(3);
    w.callproperty(char_code_at, 1);
    w.convert_i();
    w.getlocal(1);
    w.getlocal(3);
    w.add_i();
    w.si8();
    w.inclocal_i(3);

    w.bind(cond);
    w.getlocal(3);
    w.getlocal(2);
    w.getproperty(length);
    w.convert_i();
    w.iflt(body);
    w.returnvoid();

    let blob = asm.finish_blob("wasm$memory_init", w)?;
    let int_mn = asm.pool.member("int");
    let string_mn = asm.pool.member("String");
    let void_mn = asm.pool.member("void");
    Ok(asm.add_method_raw("wasm$memory_init", vec![int_mn, string_mn], void_mn, blob))
}

// ---------------------------------------------------------------------------
// Initializers
// ---------------------------------------------------------------------------

fn emit_instance_init(asm: &mut Assembler, module: &WasmModule) -> Result<Index<Method>> {
    let mut w = CodeWriter::new();
    w.set_local_base(2); // receiver + imports object
    w.getlocal(0);
    w.pushscope();
    // Pin the receiver's type before the trait writes below, as the
    // function prologues do.
    let class = asm.class_multiname();
    w.getlocal(0);
    w.coerce(class);
    w.setlocal(0);
    w.getlocal(0);
    w.constructsuper(0);

    // Constant-initialized globals. Only registered slots exist as traits.
    let slots = asm.global_slots().to_vec();
    for slot in &slots {
        let Some(global) = module.global(&slot.name) else {
            continue;
        };
        w.getlocal(0);
        match global.init {
            Literal::I32(v) => {
                let idx = asm.pool.int(v);
                w.pushint(idx);
            }
            Literal::F32(v) => push_double(asm, &mut w, v as f64),
            Literal::F64(v) => push_double(asm, &mut w, v),
        }
        let mn = asm.pool.member(&format!("global${}", slot.name));
        w.initproperty(mn);
    }

    // Backing memory: little-endian ByteArray, attached as domain memory.
    let byte_array = asm.pool.qname("flash.utils", "ByteArray");
    let length = asm.pool.member("length");
    let endian = asm.pool.member("endian");
    let memory = asm.pool.member("wasm$memory");
    w.getlocal(0);
    w.findpropstrict(byte_array);
    w.constructprop(byte_array, 0);
    w.dup();
    w.pushint(asm.pool.int(DEFAULT_MEMORY_BYTES));
    w.setproperty(length);
    w.dup();
    let little = asm.pool.string("littleEndian");
    w.pushstring(little);
    w.setproperty(endian);
    w.initproperty(memory);
    emit_domain_memory_reattach(asm, &mut w);

    // Data segments unpack through the helper.
    let memory_init = asm.pool.member("wasm$memory_init");
    for segment in &module.data_segments {
        w.getlocal(0);
        w.pushint(asm.pool.int(segment.offset as i32));
        let text = segment_string(&segment.bytes);
        let text_idx = asm.pool.string(&text);
        w.pushstring(text_idx);
        w.callpropvoid(memory_init, 2);
    }

    // Function table, populated by late-bound assignment.
    let table = asm.pool.member("wasm$table");
    w.getlocal(0);
    w.newarray(0);
    w.initproperty(table);
    let late = asm.pool.late_name();
    for segment in &module.table_segments {
        for (i, fname) in segment.names.iter().enumerate() {
            w.getlocal(0);
            w.getproperty(table);
            w.pushint(asm.pool.int(segment.offset as i32 + i as i32));
            w.getlocal(0);
            let func = asm.pool.member(&format!("func${fname}"));
            w.getproperty(func);
            w.setproperty_late(late);
        }
    }

    // Copy imports from the constructor's imports object.
    let imports = asm.import_slots().to_vec();
    for import in &imports {
        w.getlocal(0);
        w.getlocal(1);
        let module_mn = asm.pool.member(&import.module);
        w.getproperty(module_mn);
        let base_mn = asm.pool.member(&import.base);
        w.getproperty(base_mn);
        let slot = asm.import_slot_name(&import.module, &import.base);
        let slot_mn = asm.pool.member(&slot);
        w.initproperty(slot_mn);
    }

    if let Some(start) = &module.start {
        w.getlocal(0);
        let mn = asm.pool.member(&format!("func${start}"));
        w.callpropvoid(mn, 0);
    }

    // Exports object: one named property per wasm export.
    let exports_mn = asm.pool.member("exports");
    w.getlocal(0);
    w.newobject(0);
    for export in &module.exports {
        w.dup();
        w.getlocal(0);
        let member = match export.kind {
            ExportKind::Function => format!("func${}", export.target),
            ExportKind::Global => format!("global${}", export.target),
            ExportKind::Memory => "wasm$memory".to_string(),
            ExportKind::Table => "wasm$table".to_string(),
        };
        let member_mn = asm.pool.member(&member);
        w.getproperty(member_mn);
        let name_mn = asm.pool.member(&export.name);
        w.setproperty(name_mn);
    }
    w.initproperty(exports_mn);

    w.returnvoid();

    let blob = asm.finish_blob("Instance", w)?;
    let object_mn = asm.pool.member("Object");
    let void_mn = asm.pool.member("void");
    Ok(asm.add_method_raw("Instance", vec![object_mn], void_mn, blob))
}

fn push_double(asm: &mut Assembler, w: &mut CodeWriter, v: f64) {
    if v.is_nan() {
        w.pushnan();
    } else {
        let idx = asm.pool.double(v);
        w.pushdouble(idx);
    }
}

fn emit_empty_cinit(asm: &mut Assembler, name: &str) -> Result<Index<Method>> {
    let mut w = CodeWriter::new();
    w.returnvoid();
    let blob = asm.finish_blob(name, w)?;
    let void_mn = asm.pool.member("void");
    Ok(asm.add_method_raw(name, Vec::new(), void_mn, blob))
}

fn emit_wrapper_init(asm: &mut Assembler) -> Result<Index<Method>> {
    let mut w = CodeWriter::new();
    w.getlocal(0);
    w.pushscope();
    w.getlocal(0);
    w.constructsuper(0);
    w.returnvoid();
    let blob = asm.finish_blob("Wrapper", w)?;
    let void_mn = asm.pool.member("void");
    Ok(asm.add_method_raw("Wrapper", Vec::new(), void_mn, blob))
}

/// The script initializer installs the synthesized classes on the global
/// object, with each superclass chain on the scope stack for newclass.
fn emit_script_init(asm: &mut Assembler, sprite: bool) -> Result<Index<Method>> {
    let object = asm.pool.member("Object");
    let instance = asm.class_multiname();

    let mut w = CodeWriter::new();
    w.getlocal(0);
    w.pushscope();

    w.getscopeobject(0);
    w.getlex(object);
    w.pushscope();
    w.getlex(object);
    w.newclass(Index::new(0));
    w.popscope();
    w.initproperty(instance);

    if sprite {
        let chain = [
            asm.pool.member("Object"),
            asm.pool.qname("flash.events", "EventDispatcher"),
            asm.pool.qname("flash.display", "DisplayObject"),
            asm.pool.qname("flash.display", "InteractiveObject"),
            asm.pool.qname("flash.display", "DisplayObjectContainer"),
            asm.pool.qname("flash.display", "Sprite"),
        ];
        let wrapper = asm.pool.member("Wrapper");
        w.getscopeobject(0);
        for &mn in &chain {
            w.getlex(mn);
            w.pushscope();
        }
        w.getlex(chain[chain.len() - 1]);
        w.newclass(Index::new(1));
        for _ in &chain {
            w.popscope();
        }
        w.initproperty(wrapper);
    }

    w.returnvoid();
    let blob = asm.finish_blob("script", w)?;
    let void_mn = asm.pool.member("void");
    Ok(asm.add_method_raw("script", Vec::new(), void_mn, blob))
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// The instance traits table. Every trait name must be unique in the class.
struct TraitSet {
    traits: Vec<Trait>,
    seen: HashSet<String>,
}

impl TraitSet {
    fn new() -> Self {
        TraitSet {
            traits: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn check(&mut self, name: &str) -> Result<()> {
        if !self.seen.insert(name.to_string()) {
            return Err(CompileError::internal(
                "Instance",
                format!("trait name collision: {name}"),
            ));
        }
        Ok(())
    }

    fn add_method(&mut self, name: &str, mn: Index<Multiname>, method: Index<Method>) -> Result<()> {
        self.check(name)?;
        self.traits.push(Trait {
            name: mn,
            kind: TraitKind::Method { disp_id: 0, method },
            metadata: Vec::new(),
            is_final: true,
            is_override: false,
        });
        Ok(())
    }

    fn add_slot(&mut self, name: &str, mn: Index<Multiname>, type_name: Index<Multiname>) -> Result<()> {
        self.check(name)?;
        self.traits.push(Trait {
            name: mn,
            kind: TraitKind::Slot {
                slot_id: 0,
                type_name,
                value: None,
            },
            metadata: Vec::new(),
            is_final: false,
            is_override: false,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn assemble(module: &WasmModule, cfg: &TraceConfig, sprite: bool) -> Result<AbcFile> {
    let mut asm = Assembler::new("Instance", module);
    let mut traits = TraitSet::new();

    // Wasm functions, imports included (as forwarding thunks).
    for func in &module.functions {
        let method = if func.import.is_some() {
            lower_import(&mut asm, func)?
        } else {
            lower_function(&mut asm, func, cfg)?
        };
        let name = format!("func${}", func.name);
        let mn = asm.pool.member(&name);
        traits.add_method(&name, mn, method)?;
    }

    // Globals referenced only through exports still need slots.
    for export in &module.exports {
        if export.kind == ExportKind::Global {
            let global = module.global(&export.target).ok_or_else(|| {
                CompileError::malformed(
                    "module",
                    format!(
                        "export {} references unknown global {}",
                        export.name, export.target
                    ),
                )
            })?;
            asm.ensure_global(&global.name, global.ty);
        }
    }

    // Runtime helpers.
    let clz32 = emit_clz32(&mut asm)?;
    let grow = emit_memory_grow(&mut asm)?;
    let size = emit_memory_size(&mut asm)?;
    let init = emit_memory_init(&mut asm)?;
    for (name, method) in [
        ("wasm$clz32", clz32),
        ("wasm$memory_grow", grow),
        ("wasm$memory_size", size),
        ("wasm$memory_init", init),
    ] {
        let mn = asm.pool.member(name);
        traits.add_method(name, mn, method)?;
    }

    // Slot traits.
    let byte_array = asm.pool.qname("flash.utils", "ByteArray");
    let array = asm.pool.member("Array");
    let object = asm.pool.member("Object");
    let function = asm.pool.member("Function");
    let memory_mn = asm.pool.member("wasm$memory");
    traits.add_slot("wasm$memory", memory_mn, byte_array)?;
    let table_mn = asm.pool.member("wasm$table");
    traits.add_slot("wasm$table", table_mn, array)?;
    let exports_mn = asm.pool.member("exports");
    traits.add_slot("exports", exports_mn, object)?;
    for slot in asm.global_slots().to_vec() {
        let name = format!("global${}", slot.name);
        let mn = asm.pool.member(&name);
        let type_mn = asm.val_type_multiname(slot.ty);
        traits.add_slot(&name, mn, type_mn)?;
    }
    for import in asm.import_slots().to_vec() {
        let name = asm.import_slot_name(&import.module, &import.base);
        let mn = asm.pool.member(&name);
        traits.add_slot(&name, mn, function)?;
    }

    // Initializers and class records.
    let iinit = emit_instance_init(&mut asm, module)?;
    let cinit = emit_empty_cinit(&mut asm, "Instance$cinit")?;
    let sinit = emit_script_init(&mut asm, sprite)?;

    let instance_mn = asm.class_multiname();
    let object_mn = asm.pool.member("Object");
    let mut instances = vec![Instance {
        name: instance_mn,
        super_name: object_mn,
        protected_namespace: None,
        interfaces: Vec::new(),
        init_method: iinit,
        traits: traits.traits,
        is_sealed: true,
        is_final: true,
        is_interface: false,
    }];
    let mut classes = vec![Class {
        init_method: cinit,
        traits: Vec::new(),
    }];

    let mut script_traits = vec![Trait {
        name: instance_mn,
        kind: TraitKind::Class {
            slot_id: 0,
            class: Index::new(0),
        },
        metadata: Vec::new(),
        is_final: false,
        is_override: false,
    }];

    if sprite {
        let wrapper_iinit = emit_wrapper_init(&mut asm)?;
        let wrapper_cinit = emit_empty_cinit(&mut asm, "Wrapper$cinit")?;
        let wrapper_mn = asm.pool.member("Wrapper");
        let sprite_mn = asm.pool.qname("flash.display", "Sprite");
        instances.push(Instance {
            name: wrapper_mn,
            super_name: sprite_mn,
            protected_namespace: None,
            interfaces: Vec::new(),
            init_method: wrapper_iinit,
            traits: Vec::new(),
            is_sealed: true,
            is_final: false,
            is_interface: false,
        });
        classes.push(Class {
            init_method: wrapper_cinit,
            traits: Vec::new(),
        });
        script_traits.push(Trait {
            name: wrapper_mn,
            kind: TraitKind::Class {
                slot_id: 0,
                class: Index::new(1),
            },
            metadata: Vec::new(),
            is_final: false,
            is_override: false,
        });
    }

    let scripts = vec![Script {
        init_method: sinit,
        traits: script_traits,
    }];

    Ok(AbcFile {
        major_version: 46,
        minor_version: 16,
        constant_pool: asm.pool.finish(),
        methods: asm.methods,
        metadata: Vec::new(),
        instances,
        classes,
        scripts,
        method_bodies: asm.method_bodies,
    })
}
