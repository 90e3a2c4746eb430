/// Integration tests driving the VM the way a loaded bytecode file would:
/// hand-assembled `Function` bodies (no compiler exists in this crate),
/// run through the public `Interpreter` surface.
///
/// Covers:
///   • closure capture across a returned inner function
///   • try/catch/finally ordering
///   • scheduler suspension/resumption across multiple ticks
///   • bytecode save/load round-trip with class inheritance
///   • GC reclaiming objects once they're unreachable
use axiom::class::ClassDef;
use axiom::code::{Function, Op};
use axiom::errors::RuntimeError;
use axiom::interpreter::Interpreter;
use axiom::native::NativeRegistry;
use axiom::process::ProcessDef;
use axiom::value::Value;

fn new_vm() -> Interpreter {
    Interpreter::new(NativeRegistry::new())
}

fn func(vm: &mut Interpreter, name: &str, arity: u8, max_locals: u16, code: Vec<u8>, constants: Vec<Value>) -> Function {
    let lines = vec![1u32; code.len()];
    Function { name: vm.string_pool.intern(name), arity, upvalue_count: 0, max_locals, code, constants, lines }
}

fn func_with_upvalues(
    vm: &mut Interpreter,
    name: &str,
    arity: u8,
    max_locals: u16,
    upvalue_count: u8,
    code: Vec<u8>,
    constants: Vec<Value>,
) -> Function {
    let mut f = func(vm, name, arity, max_locals, code, constants);
    f.upvalue_count = upvalue_count;
    f
}

// ─── Closures ──────────────────────────────────────────────────────────────

#[test]
fn closure_captures_outer_local_across_a_returned_function() {
    let mut vm = new_vm();

    // adder(y): return x(upvalue 0) + y(local 0)
    let adder = func_with_upvalues(
        &mut vm,
        "adder",
        1,
        1,
        1,
        vec![Op::LoadUpvalue as u8, 0, Op::LoadLocal as u8, 0, Op::Add as u8, Op::Return as u8],
        vec![],
    );
    let adder_idx = vm.load_function(adder);

    // make_adder(x): captures local 0 (x) as an open upvalue over its own
    // stack slot and returns a closure over `adder`.
    let make_adder = func(
        &mut vm,
        "make_adder",
        1,
        1,
        vec![
            Op::PushConst as u8, 0, 0,
            Op::MakeClosure as u8, adder_idx as u8, (adder_idx >> 8) as u8,
            Op::Return as u8,
        ],
        vec![Value::UInt(0)],
    );
    let make_adder_idx = vm.load_function(make_adder);

    // main(): let add5 = make_adder(5); return add5(10)
    let main = func(
        &mut vm,
        "main",
        0,
        0,
        vec![
            Op::MakeClosure as u8, make_adder_idx as u8, (make_adder_idx >> 8) as u8,
            Op::PushConst as u8, 0, 0,
            Op::Call as u8, 1,
            Op::PushConst as u8, 1, 0,
            Op::Call as u8, 1,
            Op::Return as u8,
        ],
        vec![Value::Int(5), Value::Int(10)],
    );
    let main_idx = vm.load_function(main);

    let result = vm.call_function(main_idx, &[]).expect("call should succeed");
    assert_eq!(result, Value::Int(15));
}

#[test]
fn two_closures_over_the_same_template_stay_independent() {
    let mut vm = new_vm();
    let adder = func_with_upvalues(
        &mut vm,
        "adder",
        1,
        1,
        1,
        vec![Op::LoadUpvalue as u8, 0, Op::LoadLocal as u8, 0, Op::Add as u8, Op::Return as u8],
        vec![],
    );
    let adder_idx = vm.load_function(adder);
    let make_adder = func(
        &mut vm,
        "make_adder",
        1,
        1,
        vec![
            Op::PushConst as u8, 0, 0,
            Op::MakeClosure as u8, adder_idx as u8, (adder_idx >> 8) as u8,
            Op::Return as u8,
        ],
        vec![Value::UInt(0)],
    );
    let make_adder_idx = vm.load_function(make_adder);

    // one_call(n): let f = make_adder(n); return f(3)
    let one_call = func(
        &mut vm,
        "one_call",
        1,
        0,
        vec![
            Op::MakeClosure as u8, make_adder_idx as u8, (make_adder_idx >> 8) as u8,
            Op::LoadLocal as u8, 0,
            Op::Call as u8, 1,
            Op::PushConst as u8, 0, 0,
            Op::Call as u8, 1,
            Op::Return as u8,
        ],
        vec![Value::Int(3)],
    );
    let one_call_idx = vm.load_function(one_call);

    assert_eq!(vm.call_function(one_call_idx, &[Value::Int(5)]).unwrap(), Value::Int(8));
    assert_eq!(vm.call_function(one_call_idx, &[Value::Int(10)]).unwrap(), Value::Int(13));
}

// ─── Try / catch / finally ordering ────────────────────────────────────────

#[test]
fn finally_runs_after_a_caught_exception_and_overwrites_the_trace() {
    let mut vm = new_vm();
    let g = vm.define_global(Some("trace"), Value::Nil);

    // PushTry catch@9 finally@18
    // PushConst(99); Throw
    // catch: PushConst(2); StoreGlobal g; Pop
    // finally: PushConst(3); StoreGlobal g; Pop; PopTry
    // LoadGlobal g; Return
    let code = vec![
        Op::PushTry as u8, 4, 0, 13, 0, // catch_off=4 (-> ip 9), finally_off=13 (-> ip 18)
        Op::PushConst as u8, 0, 0, // push 99
        Op::Throw as u8,
        // catch (ip 9)
        Op::PushConst as u8, 1, 0, // push 2
        Op::StoreGlobal as u8, g as u8, (g >> 8) as u8, (g >> 16) as u8, (g >> 24) as u8,
        Op::Pop as u8,
        // finally (ip 18)
        Op::PushConst as u8, 2, 0, // push 3
        Op::StoreGlobal as u8, g as u8, (g >> 8) as u8, (g >> 16) as u8, (g >> 24) as u8,
        Op::Pop as u8,
        Op::PopTry as u8,
        Op::LoadGlobal as u8, g as u8, (g >> 8) as u8, (g >> 16) as u8, (g >> 24) as u8,
        Op::Return as u8,
    ];
    let f = func(&mut vm, "try_finally", 0, 0, code, vec![Value::Int(99), Value::Int(2), Value::Int(3)]);
    let idx = vm.load_function(f);

    let result = vm.call_function(idx, &[]).expect("caught exception should not propagate");
    assert_eq!(result, Value::Int(3), "finally must run after the catch body and run last");
}

#[test]
fn uncaught_throw_surfaces_as_a_runtime_error() {
    let mut vm = new_vm();
    let code = vec![Op::PushConst as u8, 0, 0, Op::Throw as u8];
    let f = func(&mut vm, "boom", 0, 0, code, vec![Value::Int(7)]);
    let idx = vm.load_function(f);
    assert!(matches!(vm.call_function(idx, &[]), Err(RuntimeError::UncaughtException { .. })));
}

// ─── Scheduler ──────────────────────────────────────────────────────────────

#[test]
fn scheduler_suspends_a_process_across_frame_calls_then_completes_it() {
    let mut vm = new_vm();
    // frame(100); frame(100); halt
    let code = vec![
        Op::PushConst as u8, 0, 0,
        Op::Frame as u8,
        Op::PushConst as u8, 0, 0,
        Op::Frame as u8,
        Op::Halt as u8,
    ];
    let f = func(&mut vm, "ticker", 0, 0, code, vec![Value::Int(100)]);
    let fidx = vm.load_function(f);
    let def_idx = vm.define_process(ProcessDef {
        name: vm.string_pool.intern("ticker_proc"),
        function: vm.functions[fidx as usize].clone(),
        private_overrides: vec![],
    });

    vm.spawn(def_idx, &[]).unwrap();
    assert_eq!(vm.processes.len(), 1);

    let dt = 1.0 / 60.0;
    vm.update(dt);
    assert_eq!(vm.processes.len(), 1, "still suspended after first frame()");

    vm.update(dt);
    assert_eq!(vm.processes.len(), 1, "suspended after second frame()");

    vm.update(dt);
    assert!(vm.processes.is_empty() || vm.processes[0].is_dead(), "dead process is recycled after halt");
}

// ─── Bytecode persistence ───────────────────────────────────────────────────

#[test]
fn bytecode_round_trip_preserves_class_inheritance_and_fields() {
    let mut vm = new_vm();

    let base_idx = vm.define_class(ClassDef {
        name: vm.string_pool.intern("Base"),
        parent: None,
        native_superclass: None,
        fields: vec![axiom::class::FieldDef { name: vm.string_pool.intern("hp"), default: Value::Int(100) }],
        methods: dashmap::DashMap::new(),
    });
    let base = vm.classes[base_idx as usize].clone();
    vm.define_class(ClassDef {
        name: vm.string_pool.intern("Derived"),
        parent: Some(base),
        native_superclass: None,
        fields: vec![axiom::class::FieldDef { name: vm.string_pool.intern("mana"), default: Value::Int(50) }],
        methods: dashmap::DashMap::new(),
    });

    let hp_name = vm.string_pool.intern("hp");
    let mana_name = vm.string_pool.intern("mana");
    let code = vec![
        Op::NewClassInst as u8, 1, 0,
        Op::StoreLocal as u8, 0,
        Op::Pop as u8,
        Op::LoadLocal as u8, 0,
        Op::GetField as u8, 0, 0,
        Op::LoadLocal as u8, 0,
        Op::GetField as u8, 1, 0,
        Op::Add as u8,
        Op::Return as u8,
    ];
    let f = Function {
        name: vm.string_pool.intern("sum_fields"),
        arity: 0,
        upvalue_count: 0,
        max_locals: 1,
        code,
        constants: vec![Value::String(hp_name), Value::String(mana_name)],
        lines: vec![1; 13],
    };
    vm.load_function(f);

    let dir = std::env::temp_dir();
    let path = dir.join(format!("axiom_test_{}.bu.bc", std::process::id()));
    vm.save_to_file(&path).expect("save should succeed");

    let mut loaded = new_vm();
    loaded.load_from_file(&path).expect("load should succeed");
    std::fs::remove_file(&path).ok();

    assert_eq!(loaded.classes.len(), 2);
    assert_eq!(loaded.classes[1].parent.as_ref().unwrap().name.as_str(), "Base");

    let result = loaded.call_function(0, &[]).expect("call should succeed");
    assert_eq!(result, Value::Int(150));
}

#[test]
fn bytecode_round_trip_preserves_process_defs() {
    let mut vm = new_vm();
    let code = vec![Op::PushConst as u8, 0, 0, Op::Frame as u8, Op::Halt as u8];
    let f = func(&mut vm, "ticker", 0, 0, code, vec![Value::Int(100)]);
    let fidx = vm.load_function(f);
    vm.define_process(ProcessDef {
        name: vm.string_pool.intern("ticker_proc"),
        function: vm.functions[fidx as usize].clone(),
        private_overrides: vec![(2, Value::Int(7))],
    });

    let dir = std::env::temp_dir();
    let path = dir.join(format!("axiom_test_proc_{}.bu.bc", std::process::id()));
    vm.save_to_file(&path).expect("save should succeed");

    let mut loaded = new_vm();
    loaded.load_from_file(&path).expect("load should succeed");
    std::fs::remove_file(&path).ok();

    assert_eq!(loaded.process_defs.len(), 1);
    let def = &loaded.process_defs[0];
    assert_eq!(def.name.as_str(), "ticker_proc");
    assert_eq!(def.private_overrides, vec![(2, Value::Int(7))]);
    assert!(std::rc::Rc::ptr_eq(&def.function, &loaded.functions[0]));
}

#[test]
fn load_rejects_a_native_function_arity_mismatch() {
    fn noop(_vm: &mut Interpreter, _args: &[Value]) -> Result<Value, axiom::errors::NativeError> {
        Ok(Value::Nil)
    }

    let mut vm = new_vm();
    vm.register_native_function("clamp", noop, 3);
    vm.save_to_file(&std::env::temp_dir().join(format!("axiom_test_arity_{}.bu.bc", std::process::id())))
        .expect("save should succeed");
    let path = std::env::temp_dir().join(format!("axiom_test_arity_{}.bu.bc", std::process::id()));

    let mut loaded = new_vm();
    loaded.register_native_function("clamp", noop, 2); // runtime now disagrees with the file
    let result = loaded.load_from_file(&path);
    std::fs::remove_file(&path).ok();

    assert!(
        matches!(result, Err(axiom::errors::LoadError::NativeArityMismatch { expected: 3, found: 2, .. })),
        "expected an arity mismatch error, got {result:?}"
    );
}

// ─── GC ─────────────────────────────────────────────────────────────────────

#[test]
fn gc_reclaims_an_array_once_it_is_unreachable() {
    let mut vm = new_vm();
    let f = func(&mut vm, "make_garbage", 0, 0, vec![Op::NewArray as u8, 0, 0, Op::Return as u8], vec![]);
    let idx = vm.load_function(f);

    let result = vm.call_function(idx, &[]).expect("call should succeed");
    assert!(matches!(result, Value::Array(_)));
    drop(result);

    assert!(vm.heap.stats().objects_live >= 1);
    let roots = vm.gc_roots();
    vm.heap.collect(roots);
    assert_eq!(vm.heap.stats().objects_live, 0, "the array is unreachable once the call_function process is gone");
}
