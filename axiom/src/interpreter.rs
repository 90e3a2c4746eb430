/// The interpreter: owns every VM-wide table (globals, functions, classes,
/// structs, process blueprints, the native registry, the GC heap) and the
/// scheduler that round-robins live processes through the bytecode dispatch
/// loop. This is the one place all the other modules meet.

use std::rc::Rc;

use crate::bytecode_io::{self, Reader, SectionCounts, SectionFlags, Writer};
use crate::class::{ClassDef, ClassInstance, Closure, StructDef, StructInstance, Upvalue};
use crate::code::{Function, Op};
use crate::conf::AxConf;
use crate::errors::{LoadError, NativeError, RuntimeError, Span};
use crate::gc::{Gc, Heap};
use crate::messages::Message;
use crate::native::{HostHooks, NativeRegistry};
use crate::pool::ProcessPool;
use crate::process::{CallFrame, Process, ProcessDef, ProcessState, TryHandler};
use crate::strings::{StrRef, StringPool};
use crate::value::{ArrayInstance, Buffer, BufferKind, MapInstance, Value};

/// What a fully-unwound scheduler pass over one process ended with.
#[derive(Debug, Clone)]
pub enum ProcessResult {
    Frame(i64),
    Done,
    Error(RuntimeError),
    CallReturn(Value),
}

enum Step {
    Continue,
    Finished(ProcessResult),
}

pub struct Interpreter {
    pub heap: Heap,
    pub string_pool: StringPool,
    pub globals: Vec<Value>,
    pub global_names: Vec<Option<StrRef>>,
    pub functions: Vec<Rc<Function>>,
    pub structs: Vec<Rc<StructDef>>,
    pub classes: Vec<Rc<ClassDef>>,
    pub process_defs: Vec<Rc<ProcessDef>>,
    pub registry: NativeRegistry,
    /// Flat, index-addressable view of `registry.functions`, assigned in
    /// registration order so `CallNative`'s u32 operand is a stable index —
    /// the registry itself stays name-keyed for host ergonomics.
    native_fn_table: Vec<String>,
    /// Arity declared at registration time for each entry in
    /// `native_fn_table`, in the same order. Written into the natives
    /// section on save and checked against the file's declared arity on
    /// load (spec.md §4.K load policy).
    native_fn_arity: Vec<u8>,
    pub processes: Vec<Process>,
    pub pool: ProcessPool,
    pub conf: AxConf,
    pub current_time: f64,
    pub last_frame_dt: f64,
    pub tick_count: u64,
    /// Host lifecycle callbacks wired up before any script runs.
    pub hooks: HostHooks,
    /// When set, the frame depth (for the process currently running via
    /// `call_function`/`call_method`) at which the interpreter should yield
    /// control back to the host instead of continuing (spec.md §4.F).
    stop_on_frame_count: Option<usize>,
}

impl Interpreter {
    pub fn new(registry: NativeRegistry) -> Self {
        let conf = AxConf::load();
        let mut heap = Heap::new();
        heap.set_verbose(conf.gc_verbose());
        Interpreter {
            heap,
            string_pool: StringPool::new(),
            globals: Vec::new(),
            global_names: Vec::new(),
            functions: Vec::new(),
            structs: Vec::new(),
            classes: Vec::new(),
            process_defs: Vec::new(),
            native_fn_table: registry.functions.keys().cloned().collect(),
            native_fn_arity: vec![0; registry.functions.len()],
            registry,
            processes: Vec::new(),
            pool: ProcessPool::new(),
            conf,
            current_time: 0.0,
            last_frame_dt: 0.0,
            tick_count: 0,
            hooks: HostHooks::default(),
            stop_on_frame_count: None,
        }
    }

    pub fn register_native_function(&mut self, name: &str, f: crate::native::NativeFn, arity: u8) -> u32 {
        self.registry.register_function(name, f);
        if let Some(pos) = self.native_fn_table.iter().position(|n| n == name) {
            self.native_fn_arity[pos] = arity;
            return pos as u32;
        }
        self.native_fn_table.push(name.to_string());
        self.native_fn_arity.push(arity);
        (self.native_fn_table.len() - 1) as u32
    }

    pub fn set_hooks(&mut self, hooks: HostHooks) {
        self.hooks = hooks;
    }

    /// Run the host's `on_create` hook once. Call after every native
    /// binding and hook has been registered, before the first `update`.
    pub fn fire_on_create(&mut self) {
        if let Some(f) = self.hooks.on_create {
            f(self);
        }
    }

    /// Run the host's `on_render` hook. Distinct from `update`: a host
    /// typically ticks the scheduler at a fixed rate but renders at the
    /// display's own rate, so this is exposed as its own entry point.
    pub fn render(&mut self) {
        if let Some(f) = self.hooks.on_render {
            f(self);
        }
    }

    pub fn define_global(&mut self, name: Option<&str>, initial: Value) -> u32 {
        self.globals.push(initial);
        let interned = name.map(|n| self.string_pool.intern(n));
        self.global_names.push(interned);
        (self.globals.len() - 1) as u32
    }

    pub fn load_function(&mut self, f: Function) -> u32 {
        self.functions.push(Rc::new(f));
        (self.functions.len() - 1) as u32
    }

    pub fn define_struct(&mut self, def: StructDef) -> u32 {
        self.structs.push(Rc::new(def));
        (self.structs.len() - 1) as u32
    }

    pub fn define_class(&mut self, def: ClassDef) -> u32 {
        self.classes.push(Rc::new(def));
        (self.classes.len() - 1) as u32
    }

    pub fn define_process(&mut self, def: ProcessDef) -> u32 {
        self.process_defs.push(Rc::new(def));
        (self.process_defs.len() - 1) as u32
    }

    /// Reset the VM to a clean empty state. Called before a bytecode load
    /// and exposed to scripts as `reset()`.
    pub fn reset(&mut self) {
        self.globals.clear();
        self.global_names.clear();
        self.functions.clear();
        self.structs.clear();
        self.classes.clear();
        self.process_defs.clear();
        self.processes.clear();
        self.heap = Heap::new();
        self.heap.set_verbose(self.conf.gc_verbose());
        self.current_time = 0.0;
        self.last_frame_dt = 0.0;
        self.tick_count = 0;
    }

    // ── Root set / GC ────────────────────────────────────────────────────

    pub fn gc_roots(&self) -> Vec<Value> {
        let mut roots = self.globals.clone();
        for p in &self.processes {
            roots.extend(p.gc_roots());
        }
        roots
    }

    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            let roots = self.gc_roots();
            self.heap.collect(roots);
        }
    }

    // ── Spawning ─────────────────────────────────────────────────────────

    pub fn spawn(&mut self, def_index: u32, args: &[Value]) -> Result<u32, RuntimeError> {
        let def = self
            .process_defs
            .get(def_index as usize)
            .cloned()
            .ok_or_else(|| RuntimeError::Generic {
                message: format!("no such process definition {def_index}"),
                span: Span::default(),
            })?;

        let mut process = self.pool.acquire();
        for (idx, value) in &def.private_overrides {
            if *idx < process.privates.len() {
                process.privates[*idx] = value.clone();
            }
        }
        self.maybe_collect();
        let closure = self.heap.alloc(Closure { function: def.function.clone(), upvalues: Vec::new() });
        for a in args {
            process.push(a.clone())?;
        }
        process.push_frame(CallFrame { closure, ip: 0, base: 0, self_value: None })?;
        let id = process.id;
        self.processes.push(process);
        Ok(id)
    }

    // ── Scheduler ────────────────────────────────────────────────────────

    /// One host `update(dt)` tick: advance every alive, non-frozen process
    /// to its next suspension point, per spec.md §4.H.
    pub fn update(&mut self, dt: f64) {
        self.current_time += dt;
        self.last_frame_dt = dt;
        self.tick_count += 1;

        let mut i = 0;
        while i < self.processes.len() {
            match self.processes[i].state {
                ProcessState::Frozen => {
                    i += 1;
                    continue;
                }
                ProcessState::Dead => {
                    i += 1;
                    continue;
                }
                ProcessState::Suspended => {
                    if self.current_time >= self.processes[i].resume_time {
                        self.processes[i].state = ProcessState::Running;
                    } else {
                        i += 1;
                        continue;
                    }
                }
                ProcessState::Running => {}
            }

            let pid = self.processes[i].id;
            let was_initialized = self.processes[i].initialized;

            let result = self.run_process(i);
            match result {
                ProcessResult::Frame(percent) => {
                    let resume = Process::compute_frame_resume(self.current_time, self.last_frame_dt, percent);
                    self.processes[i].state = ProcessState::Suspended;
                    self.processes[i].resume_time = resume;
                    if !was_initialized {
                        self.processes[i].initialized = true;
                        if let Some(f) = self.hooks.on_start {
                            f(self, pid);
                        }
                    }
                }
                ProcessResult::Done => {
                    self.processes[i].state = ProcessState::Dead;
                    self.processes[i].exit_code = 0;
                }
                ProcessResult::Error(_) => {
                    self.processes[i].state = ProcessState::Dead;
                    self.processes[i].exit_code = -1;
                }
                ProcessResult::CallReturn(_) => {
                    // only meaningful when driven by call_function; a scheduler
                    // tick never sets stop_on_frame_count, so this can't occur.
                }
            }
            if let Some(f) = self.hooks.on_update {
                f(self, pid, dt);
            }
            i += 1;
        }

        // clean-up pass: recycle every process marked Dead this tick.
        let mut j = 0;
        while j < self.processes.len() {
            if self.processes[j].is_dead() {
                let dead = self.processes.remove(j);
                let (pid, exit_code) = (dead.id, dead.exit_code);
                self.pool.release(dead);
                if let Some(f) = self.hooks.on_destroy {
                    f(self, pid, exit_code);
                }
            } else {
                j += 1;
            }
        }
        self.pool.on_tick();
    }

    /// Call a script function synchronously from the host, running it to
    /// completion (or to its first suspension, which is reported as an
    /// error since a host call cannot itself cooperatively yield).
    pub fn call_function(&mut self, function_index: u32, args: &[Value]) -> Result<Value, RuntimeError> {
        let function = self.functions.get(function_index as usize).cloned().ok_or_else(|| {
            RuntimeError::Generic { message: format!("no such function {function_index}"), span: Span::default() }
        })?;
        self.maybe_collect();
        let closure = self.heap.alloc(Closure { function, upvalues: Vec::new() });
        let mut process = Process::new(u32::MAX);
        for a in args {
            process.push(a.clone())?;
        }
        process.push_frame(CallFrame { closure, ip: 0, base: 0, self_value: None })?;
        self.processes.push(process);
        let idx = self.processes.len() - 1;
        self.stop_on_frame_count = Some(0);
        let result = self.run_process(idx);
        self.stop_on_frame_count = None;
        self.processes.remove(idx);
        match result {
            ProcessResult::CallReturn(v) => Ok(v),
            ProcessResult::Done => Ok(Value::Nil),
            ProcessResult::Error(e) => Err(e),
            ProcessResult::Frame(_) => Err(RuntimeError::Generic {
                message: "script suspended (frame/yield) during a synchronous host call".into(),
                span: Span::default(),
            }),
        }
    }

    // ── Dispatch loop ────────────────────────────────────────────────────

    /// Run process `idx` until it suspends, finishes, errors, or (if
    /// `stop_on_frame_count` is set) returns past the target frame depth.
    fn run_process(&mut self, idx: usize) -> ProcessResult {
        loop {
            if self.processes[idx].frames.is_empty() {
                return ProcessResult::Done;
            }
            let frame_i = self.processes[idx].frames.len() - 1;
            let ip = self.processes[idx].frames[frame_i].ip;
            let closure = self.processes[idx].frames[frame_i].closure.clone();
            let function = closure.borrow().function.clone();

            let Some(op) = function.read_op(ip) else {
                return ProcessResult::Done;
            };
            let operand_start = ip + 1;
            let next_ip = operand_start + op.operand_len();
            self.processes[idx].frames[frame_i].ip = next_ip;

            match self.execute(idx, frame_i, &function, op, operand_start) {
                Ok(Step::Continue) => continue,
                Ok(Step::Finished(result)) => return result,
                Err(err) => {
                    let thrown = runtime_error_to_value(&err, &mut self.string_pool);
                    if let Some(result) = self.unwind_or_die(idx, thrown) {
                        return result;
                    }
                }
            }
        }
    }

    fn execute(
        &mut self,
        idx: usize,
        frame_i: usize,
        function: &Function,
        op: Op,
        at: usize,
    ) -> Result<Step, RuntimeError> {
        use Op::*;
        match op {
            PushNil => self.push(idx, Value::Nil)?,
            PushTrue => self.push(idx, Value::Bool(true))?,
            PushFalse => self.push(idx, Value::Bool(false))?,
            PushByte => {
                let b = function.read_u8(at);
                self.push(idx, Value::Byte(b))?;
            }
            PushInt | PushConst => {
                let k = function.read_u16(at) as usize;
                let v = function.constants.get(k).cloned().unwrap_or(Value::Nil);
                self.push(idx, v)?;
            }
            Pop => {
                self.pop(idx);
            }
            Dup => {
                let top = self.peek(idx).clone();
                self.push(idx, top)?;
            }
            LoadLocal => {
                let slot = function.read_u8(at) as usize;
                let base = self.processes[idx].frames[frame_i].base;
                let v = self.processes[idx].operand_stack[base + slot].clone();
                self.push(idx, v)?;
            }
            StoreLocal => {
                let slot = function.read_u8(at) as usize;
                let base = self.processes[idx].frames[frame_i].base;
                let v = self.peek(idx).clone();
                self.processes[idx].operand_stack[base + slot] = v;
            }
            LoadGlobal => {
                let g = function.read_u32(at) as usize;
                let v = self.globals.get(g).cloned().ok_or_else(|| RuntimeError::UndefinedGlobal {
                    name: format!("#{g}"),
                    span: Span::default(),
                })?;
                self.push(idx, v)?;
            }
            StoreGlobal => {
                let g = function.read_u32(at) as usize;
                let v = self.peek(idx).clone();
                if g >= self.globals.len() {
                    return Err(RuntimeError::UndefinedGlobal { name: format!("#{g}"), span: Span::default() });
                }
                self.globals[g] = v;
            }
            LoadUpvalue => {
                let slot = function.read_u8(at) as usize;
                let uv = closure_upvalue(&self.processes[idx].frames[frame_i].closure, slot);
                let v = match &*uv.borrow() {
                    Upvalue::Open { stack_slot } => self.processes[idx].operand_stack[*stack_slot].clone(),
                    Upvalue::Closed(v) => v.clone(),
                };
                self.push(idx, v)?;
            }
            StoreUpvalue => {
                let slot = function.read_u8(at) as usize;
                let v = self.peek(idx).clone();
                let uv = closure_upvalue(&self.processes[idx].frames[frame_i].closure, slot);
                let target = match &*uv.borrow() {
                    Upvalue::Open { stack_slot } => Some(*stack_slot),
                    Upvalue::Closed(_) => None,
                };
                match target {
                    Some(slot) => self.processes[idx].operand_stack[slot] = v,
                    None => *uv.borrow_mut() = Upvalue::Closed(v),
                }
            }
            CloseUpvalue => {
                let slot = function.read_u8(at) as usize;
                let base = self.processes[idx].frames[frame_i].base;
                let abs = base + slot;
                let v = self.processes[idx].operand_stack[abs].clone();
                // closing is a best-effort scan: any upvalue this frame's
                // closure owns pointing at `abs` is promoted to Closed.
                let closure = self.processes[idx].frames[frame_i].closure.clone();
                for uv in &closure.borrow().upvalues {
                    let should_close = matches!(&*uv.borrow(), Upvalue::Open { stack_slot } if *stack_slot == abs);
                    if should_close {
                        *uv.borrow_mut() = Upvalue::Closed(v.clone());
                    }
                }
            }
            Add | Sub | Mul | Div | Mod => self.binary_arith(idx, op)?,
            Neg => {
                let v = self.pop(idx);
                let result = match v {
                    Value::Byte(b) => Value::Int(-(b as i32)),
                    Value::Int(i) => Value::Int(i.wrapping_neg()),
                    Value::UInt(u) => Value::Int(-(u as i64) as i32),
                    Value::Float(f) => Value::Float(-f),
                    Value::Double(d) => Value::Double(-d),
                    other => {
                        return Err(RuntimeError::TypeMismatch {
                            expected: "numeric".into(),
                            found: other.type_name().into(),
                            span: Span::default(),
                        })
                    }
                };
                self.push(idx, result)?;
            }
            Eq => {
                let b = self.pop(idx);
                let a = self.pop(idx);
                self.push(idx, Value::Bool(a == b))?;
            }
            Ne => {
                let b = self.pop(idx);
                let a = self.pop(idx);
                self.push(idx, Value::Bool(a != b))?;
            }
            Lt | Le | Gt | Ge => self.compare(idx, op)?,
            Not => {
                let v = self.pop(idx);
                self.push(idx, Value::Bool(!v.is_truthy()))?;
            }
            Jump => {
                let off = function.read_i16(at);
                self.jump(idx, frame_i, at, off);
            }
            JumpIfFalse => {
                let off = function.read_i16(at);
                if !self.peek(idx).is_truthy() {
                    self.jump(idx, frame_i, at, off);
                }
            }
            JumpIfTrue => {
                let off = function.read_i16(at);
                if self.peek(idx).is_truthy() {
                    self.jump(idx, frame_i, at, off);
                }
            }
            Loop => {
                let off = function.read_i16(at);
                self.jump(idx, frame_i, at, off);
            }
            Call => {
                let argc = function.read_u8(at) as usize;
                return self.do_call(idx, argc);
            }
            CallMethod => {
                let name_idx = function.read_u16(at) as usize;
                let argc = function.read_u8(at + 2) as usize;
                return self.do_call_method(idx, function, name_idx, argc);
            }
            CallNativeMethod => {
                let name_idx = function.read_u16(at) as usize;
                let argc = function.read_u8(at + 2) as usize;
                return self.do_call_native_method(idx, function, name_idx, argc);
            }
            CallNative => {
                let native_idx = function.read_u32(at);
                return self.do_call_native(idx, native_idx);
            }
            CallModule => {
                let module_id = function.read_u16(at);
                let func_id = function.read_u16(at + 2);
                return self.do_call_module(idx, module_id, func_id);
            }
            Return => {
                let v = self.pop(idx);
                return Ok(self.do_return(idx, v));
            }
            ReturnNil => {
                return Ok(self.do_return(idx, Value::Nil));
            }
            Gosub => {
                let off = function.read_i16(at);
                let return_ip = at + 2;
                self.processes[idx].push_gosub(return_ip)?;
                self.jump(idx, frame_i, at, off);
            }
            ReturnGosub => {
                let target = self.processes[idx].gosub_stack.pop().ok_or_else(|| RuntimeError::Generic {
                    message: "return from gosub with an empty gosub stack".into(),
                    span: Span::default(),
                })?;
                self.processes[idx].frames[frame_i].ip = target;
            }
            NewArray => {
                let n = function.read_u16(at) as usize;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(self.pop(idx));
                }
                items.reverse();
                self.maybe_collect();
                let g = self.heap.alloc::<ArrayInstance>(items);
                self.push(idx, Value::Array(g))?;
            }
            NewMap => {
                self.maybe_collect();
                let g = self.heap.alloc(MapInstance::new());
                self.push(idx, Value::Map(g))?;
            }
            NewStruct => {
                let def_idx = function.read_u16(at) as usize;
                let def = self.structs.get(def_idx).cloned().ok_or_else(|| RuntimeError::Generic {
                    message: format!("no such struct definition {def_idx}"),
                    span: Span::default(),
                })?;
                let mut fields = Vec::with_capacity(def.fields.len());
                for _ in 0..def.fields.len() {
                    fields.push(self.pop(idx));
                }
                fields.reverse();
                self.maybe_collect();
                let g = self.heap.alloc(StructInstance { def, fields });
                self.push(idx, Value::StructInstance(g))?;
            }
            NewClassInst => {
                let def_idx = function.read_u16(at) as usize;
                let def = self.classes.get(def_idx).cloned().ok_or_else(|| RuntimeError::Generic {
                    message: format!("no such class definition {def_idx}"),
                    span: Span::default(),
                })?;
                self.maybe_collect();
                let g = self.heap.alloc(ClassInstance::new(def));
                self.push(idx, Value::ClassInstance(g))?;
            }
            NewNativeClassInst => {
                let name_idx = function.read_u16(at) as usize;
                let name = self.const_str(function, name_idx)?;
                let argc = self.pop_argc(idx);
                let mut args = Vec::with_capacity(argc);
                for _ in 0..argc {
                    args.push(self.pop(idx));
                }
                args.reverse();
                let def = self.registry.classes.get(name.as_str()).cloned().ok_or_else(|| {
                    RuntimeError::Generic { message: format!("no such native class '{}'", name.as_str()), span: Span::default() }
                })?;
                let ctor = def.constructor.ok_or_else(|| RuntimeError::Generic {
                    message: format!("native class '{}' has no constructor", name.as_str()),
                    span: Span::default(),
                })?;
                let result = ctor(self, &args).map_err(native_error_to_runtime)?;
                self.push(idx, result)?;
            }
            NewNativeStructInst => {
                let name_idx = function.read_u16(at) as usize;
                let name = self.const_str(function, name_idx)?;
                let argc = self.pop_argc(idx);
                let mut args = Vec::with_capacity(argc);
                for _ in 0..argc {
                    args.push(self.pop(idx));
                }
                args.reverse();
                let def = self.registry.structs.get(name.as_str()).cloned().ok_or_else(|| {
                    RuntimeError::Generic { message: format!("no such native struct '{}'", name.as_str()), span: Span::default() }
                })?;
                let ctor = def.constructor.ok_or_else(|| RuntimeError::Generic {
                    message: format!("native struct '{}' has no constructor", name.as_str()),
                    span: Span::default(),
                })?;
                let result = ctor(self, &args).map_err(native_error_to_runtime)?;
                self.push(idx, result)?;
            }
            NewBuffer => {
                let kind_tag = function.read_u8(at);
                let count = function.read_u16(at + 1) as usize;
                let kind = BufferKind::from_tag(kind_tag).ok_or_else(|| RuntimeError::Generic {
                    message: format!("unknown buffer kind tag {kind_tag}"),
                    span: Span::default(),
                })?;
                let data = vec![0u8; count * kind.element_size()];
                self.maybe_collect();
                let g = self.heap.alloc(Buffer { kind, data, count, cursor: 0 });
                self.push(idx, Value::Buffer(g))?;
            }
            GetField => {
                let name_idx = function.read_u16(at) as usize;
                let name = self.const_str(function, name_idx)?;
                let recv = self.pop(idx);
                let v = self.get_field(&recv, name.as_str())?;
                self.push(idx, v)?;
            }
            SetField => {
                let name_idx = function.read_u16(at) as usize;
                let name = self.const_str(function, name_idx)?;
                let value = self.pop(idx);
                let recv = self.pop(idx);
                self.set_field(&recv, name, value)?;
            }
            GetIndex => {
                let index = self.pop(idx);
                let container = self.pop(idx);
                let v = self.get_index(&container, &index)?;
                self.push(idx, v)?;
            }
            SetIndex => {
                let value = self.pop(idx);
                let index = self.pop(idx);
                let container = self.pop(idx);
                self.set_index(&container, &index, value)?;
            }
            MakeClosure => {
                let func_idx = function.read_u16(at) as usize;
                let target = self.functions.get(func_idx).cloned().ok_or_else(|| RuntimeError::Generic {
                    message: format!("no such function {func_idx}"),
                    span: Span::default(),
                })?;
                let upvalue_count = target.upvalue_count as usize;
                let mut upvalues = Vec::with_capacity(upvalue_count);
                for _ in 0..upvalue_count {
                    let v = self.pop(idx);
                    let stack_slot = match v {
                        Value::UInt(slot) => slot as usize,
                        _ => {
                            return Err(RuntimeError::TypeMismatch {
                                expected: "upvalue slot index".into(),
                                found: v.type_name().into(),
                                span: Span::default(),
                            })
                        }
                    };
                    self.maybe_collect();
                    upvalues.push(self.heap.alloc(Upvalue::Open { stack_slot }));
                }
                upvalues.reverse();
                self.maybe_collect();
                let g = self.heap.alloc(Closure { function: target, upvalues });
                self.push(idx, Value::Closure(g))?;
            }
            SpawnProcess => {
                let def_idx = function.read_u16(at) as u32;
                let argc = self.pop_argc(idx);
                let mut args = Vec::with_capacity(argc);
                for _ in 0..argc {
                    args.push(self.pop(idx));
                }
                args.reverse();
                let pid = self.spawn(def_idx, &args)?;
                self.push(idx, Value::UInt(pid))?;
            }
            Yield => return Ok(Step::Finished(ProcessResult::Frame(100))),
            Frame => {
                let v = self.pop(idx);
                let percent = v.as_int().unwrap_or(100);
                return Ok(Step::Finished(ProcessResult::Frame(percent)));
            }
            KillProcess => {
                let v = self.pop(idx);
                if let Some(pid) = v.as_int() {
                    for p in &mut self.processes {
                        if p.id == pid as u32 {
                            p.state = ProcessState::Dead;
                        }
                    }
                }
            }
            PushTry => {
                let catch_off = function.read_i16(at);
                let finally_off = function.read_i16(at + 2);
                let catch_ip = if catch_off == 0 { None } else { Some((at as i64 + 4 + catch_off as i64) as usize) };
                let finally_ip =
                    if finally_off == 0 { None } else { Some((at as i64 + 4 + finally_off as i64) as usize) };
                let stack_restore = self.processes[idx].operand_stack.len();
                self.processes[idx].push_try(TryHandler::new(catch_ip, finally_ip, stack_restore, frame_i))?;
            }
            PopTry => {
                self.processes[idx].try_stack.pop();
            }
            Throw => {
                let v = self.pop(idx);
                return Ok(match self.unwind_or_die(idx, v) {
                    Some(result) => Step::Finished(result),
                    None => Step::Continue,
                });
            }
            EndFinally => return Ok(self.do_end_finally(idx)),
            Halt => return Ok(Step::Finished(ProcessResult::Done)),
        }
        Ok(Step::Continue)
    }

    // ── Stack helpers ────────────────────────────────────────────────────

    fn push(&mut self, idx: usize, v: Value) -> Result<(), RuntimeError> {
        self.processes[idx].push(v)
    }

    fn pop(&mut self, idx: usize) -> Value {
        self.processes[idx].pop()
    }

    fn peek(&self, idx: usize) -> &Value {
        self.processes[idx].operand_stack.last().unwrap_or(&Value::Nil)
    }

    /// `CallNative`/`CallModule`/`SpawnProcess` carry no argc operand (unlike
    /// `Call`/`CallMethod`), since the receiving table index already comes
    /// from the instruction stream: the compiler instead pushes the arg
    /// count as an Int directly on top of the pushed arguments.
    fn pop_argc(&mut self, idx: usize) -> usize {
        match self.pop(idx) {
            Value::Int(n) if n >= 0 => n as usize,
            _ => 0,
        }
    }

    fn jump(&mut self, idx: usize, frame_i: usize, at: usize, offset: i16) {
        let base = at as i64 + 2;
        let target = (base + offset as i64) as usize;
        self.processes[idx].frames[frame_i].ip = target;
    }

    fn const_str(&self, function: &Function, k: usize) -> Result<StrRef, RuntimeError> {
        match function.constants.get(k) {
            Some(Value::String(s)) => Ok(s.clone()),
            _ => Err(RuntimeError::Generic { message: format!("constant {k} is not a string"), span: Span::default() }),
        }
    }

    // ── Arithmetic / comparison ──────────────────────────────────────────

    fn binary_arith(&mut self, idx: usize, op: Op) -> Result<(), RuntimeError> {
        let b = self.pop(idx);
        let a = self.pop(idx);
        let result = numeric_binop(op, &a, &b)?;
        self.push(idx, result)
    }

    fn compare(&mut self, idx: usize, op: Op) -> Result<(), RuntimeError> {
        let b = self.pop(idx);
        let a = self.pop(idx);
        let (av, bv) = (
            a.as_double().ok_or_else(|| type_mismatch(&a))?,
            b.as_double().ok_or_else(|| type_mismatch(&b))?,
        );
        let result = match op {
            Op::Lt => av < bv,
            Op::Le => av <= bv,
            Op::Gt => av > bv,
            Op::Ge => av >= bv,
            _ => unreachable!(),
        };
        self.push(idx, Value::Bool(result))
    }

    // ── Field / index access ─────────────────────────────────────────────

    fn get_field(&mut self, recv: &Value, name: &str) -> Result<Value, RuntimeError> {
        match recv {
            Value::StructInstance(g) => {
                let inst = g.borrow();
                let pos = inst.def.fields.iter().position(|f| f.name.as_str() == name);
                match pos {
                    Some(i) => Ok(inst.fields[i].clone()),
                    None => Err(undefined_method(&inst.def.name, name)),
                }
            }
            Value::ClassInstance(g) => {
                let script_field = {
                    let inst = g.borrow();
                    inst.get_field(name)
                };
                if let Some(v) = script_field {
                    return Ok(v);
                }
                let native_getter = g.borrow().def.resolve_native_property(name);
                match native_getter {
                    Some(f) => f(self, &[recv.clone()]).map_err(native_error_to_runtime),
                    None => Err(undefined_method(&g.borrow().def.name, name)),
                }
            }
            Value::NativeClassInstance(g) => {
                let getter = g.borrow().def.resolve_property(name).ok_or_else(|| {
                    undefined_method(&g.borrow().def.name, name)
                })?;
                getter(self, &[recv.clone()]).map_err(native_error_to_runtime)
            }
            Value::NativeStructInstance(g) => {
                let inst = g.borrow();
                inst.def.field(name).map(|(i, _)| inst.values[i].clone()).ok_or_else(|| {
                    undefined_method(&inst.def.name, name)
                })
            }
            other => Err(RuntimeError::TypeMismatch {
                expected: "struct or class instance".into(),
                found: other.type_name().into(),
                span: Span::default(),
            }),
        }
    }

    fn set_field(&mut self, recv: &Value, name: StrRef, value: Value) -> Result<(), RuntimeError> {
        match recv {
            Value::StructInstance(g) => {
                let mut inst = g.borrow_mut();
                let pos = inst.def.fields.iter().position(|f| f.name.as_str() == name.as_str());
                match pos {
                    Some(i) => {
                        inst.fields[i] = value;
                        Ok(())
                    }
                    None => Err(undefined_method(&inst.def.name, name.as_str())),
                }
            }
            Value::ClassInstance(g) => {
                let has_script_field = g.borrow().get_field(name.as_str()).is_some();
                if has_script_field {
                    g.borrow().set_field(name, value);
                    return Ok(());
                }
                let native_setter = g.borrow().def.resolve_native_setter(name.as_str());
                match native_setter {
                    Some(f) => {
                        f(self, &[recv.clone(), value]).map_err(native_error_to_runtime)?;
                        Ok(())
                    }
                    None => Err(undefined_method(&g.borrow().def.name, name.as_str())),
                }
            }
            Value::NativeClassInstance(g) => {
                let setter = g.borrow().def.resolve_setter(name.as_str()).ok_or_else(|| {
                    undefined_method(&g.borrow().def.name, name.as_str())
                })?;
                setter(self, &[recv.clone(), value]).map_err(native_error_to_runtime)?;
                Ok(())
            }
            Value::NativeStructInstance(g) => {
                let mut inst = g.borrow_mut();
                let slot = inst.def.field(name.as_str()).map(|(i, f)| (i, f.read_only));
                match slot {
                    Some((_, true)) => Err(RuntimeError::Generic {
                        message: format!("field '{}' on native struct '{}' is read-only", name.as_str(), inst.def.name.as_str()),
                        span: Span::default(),
                    }),
                    Some((i, false)) => {
                        inst.values[i] = value;
                        Ok(())
                    }
                    None => Err(undefined_method(&inst.def.name, name.as_str())),
                }
            }
            other => Err(RuntimeError::TypeMismatch {
                expected: "struct or class instance".into(),
                found: other.type_name().into(),
                span: Span::default(),
            }),
        }
    }

    fn get_index(&self, container: &Value, index: &Value) -> Result<Value, RuntimeError> {
        match container {
            Value::Array(g) => {
                let arr = g.borrow();
                let i = index_as_usize(index, arr.len())?;
                arr.get(i).cloned().ok_or_else(|| RuntimeError::IndexOutOfBounds {
                    index: index.as_int().unwrap_or(-1),
                    length: arr.len(),
                    span: Span::default(),
                })
            }
            Value::Map(g) => {
                let key = index.as_str().ok_or_else(|| type_mismatch(index))?;
                g.borrow()
                    .table
                    .iter()
                    .find(|e| e.key().as_str() == key)
                    .map(|e| e.value().clone())
                    .ok_or_else(|| RuntimeError::Generic {
                        message: format!("no such map key '{key}'"),
                        span: Span::default(),
                    })
            }
            Value::Buffer(g) => {
                let buf = g.borrow();
                let i = index_as_usize(index, buf.count)?;
                Ok(buffer_read(&buf, i))
            }
            other => Err(RuntimeError::TypeMismatch {
                expected: "array, map, or buffer".into(),
                found: other.type_name().into(),
                span: Span::default(),
            }),
        }
    }

    fn set_index(&self, container: &Value, index: &Value, value: Value) -> Result<(), RuntimeError> {
        match container {
            Value::Array(g) => {
                let mut arr = g.borrow_mut();
                let len = arr.len();
                let i = index_as_usize(index, len)?;
                match arr.get_mut(i) {
                    Some(slot) => {
                        *slot = value;
                        Ok(())
                    }
                    None => Err(RuntimeError::IndexOutOfBounds {
                        index: index.as_int().unwrap_or(-1),
                        length: len,
                        span: Span::default(),
                    }),
                }
            }
            Value::Map(g) => {
                // map keys are interned strings; this crate has no scope to
                // intern from a runtime Value so we require the caller push
                // an already-interned Value::String key.
                match index {
                    Value::String(s) => {
                        g.borrow().table.insert(s.clone(), value);
                        Ok(())
                    }
                    other => Err(type_mismatch(other)),
                }
            }
            Value::Buffer(g) => {
                let mut buf = g.borrow_mut();
                let i = index_as_usize(index, buf.count)?;
                buffer_write(&mut buf, i, &value)
            }
            other => Err(RuntimeError::TypeMismatch {
                expected: "array, map, or buffer".into(),
                found: other.type_name().into(),
                span: Span::default(),
            }),
        }
    }

    // ── Calls ────────────────────────────────────────────────────────────

    fn do_call(&mut self, idx: usize, argc: usize) -> Result<Step, RuntimeError> {
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop(idx));
        }
        args.reverse();
        let callee = self.pop(idx);
        match callee {
            Value::Closure(g) => {
                let function = g.borrow().function.clone();
                if (args.len() as u8) != function.arity {
                    return Err(RuntimeError::ArityMismatch {
                        expected: function.arity as usize,
                        found: args.len(),
                        span: Span::default(),
                    });
                }
                let base = self.processes[idx].operand_stack.len();
                for a in args {
                    self.push(idx, a)?;
                }
                self.processes[idx].push_frame(CallFrame { closure: g, ip: 0, base, self_value: None })?;
                Ok(Step::Continue)
            }
            // a bare function index (as opposed to a closure) never carries
            // upvalues: the callee has none to capture, or the compiler
            // pushed the function reference directly rather than MakeClosure.
            Value::Function(func_idx) => {
                let function = self.functions.get(func_idx as usize).cloned().ok_or_else(|| {
                    RuntimeError::Generic { message: format!("no such function {func_idx}"), span: Span::default() }
                })?;
                if (args.len() as u8) != function.arity {
                    return Err(RuntimeError::ArityMismatch {
                        expected: function.arity as usize,
                        found: args.len(),
                        span: Span::default(),
                    });
                }
                self.maybe_collect();
                let closure = self.heap.alloc(Closure { function, upvalues: Vec::new() });
                let base = self.processes[idx].operand_stack.len();
                for a in args {
                    self.push(idx, a)?;
                }
                self.processes[idx].push_frame(CallFrame { closure, ip: 0, base, self_value: None })?;
                Ok(Step::Continue)
            }
            Value::Native(native_idx) => {
                let name = self.native_fn_table.get(native_idx as usize).cloned().ok_or_else(|| {
                    RuntimeError::Generic { message: format!("no such native function {native_idx}"), span: Span::default() }
                })?;
                let f = *self.registry.functions.get(&name).ok_or_else(|| RuntimeError::Generic {
                    message: format!("native function '{name}' is not registered"),
                    span: Span::default(),
                })?;
                let result = f(self, &args).map_err(native_error_to_runtime)?;
                self.push(idx, result)?;
                Ok(Step::Continue)
            }
            Value::NativeProcess(native_idx) => {
                let def = self.registry.native_processes.get(native_idx as usize).cloned().ok_or_else(|| {
                    RuntimeError::Generic { message: format!("no such native process {native_idx}"), span: Span::default() }
                })?;
                let result = (def.spawn)(self, &args).map_err(native_error_to_runtime)?;
                self.push(idx, result)?;
                Ok(Step::Continue)
            }
            Value::ModuleReference(_) => {
                let (module_id, func_id) = callee.unpack_module_ref().unwrap();
                let module = self.registry.modules.get(module_id as usize).cloned().ok_or_else(|| {
                    RuntimeError::Generic { message: format!("no such module {module_id}"), span: Span::default() }
                })?;
                let result = module.call(func_id, self, &args).map_err(native_error_to_runtime)?;
                self.push(idx, result)?;
                Ok(Step::Continue)
            }
            Value::Nil => Err(RuntimeError::NilCall { hint: "callee evaluated to nil".into(), span: Span::default() }),
            other => Err(RuntimeError::NotCallable { type_name: other.type_name().into(), span: Span::default() }),
        }
    }

    fn do_call_method(
        &mut self,
        idx: usize,
        function: &Function,
        name_idx: usize,
        argc: usize,
    ) -> Result<Step, RuntimeError> {
        let name = self.const_str(function, name_idx)?;
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop(idx));
        }
        args.reverse();
        let recv = self.pop(idx);

        // a script class falls back to its native superclass only once its
        // own method chain (and every script ancestor's) comes up empty.
        let native_fallback = match &recv {
            Value::ClassInstance(g) => {
                let inst = g.borrow();
                if inst.resolve_method(name.as_str()).is_none() {
                    inst.def.resolve_native_method(name.as_str())
                } else {
                    None
                }
            }
            Value::NativeClassInstance(g) => g.borrow().def.resolve_method(name.as_str()),
            _ => None,
        };
        if let Some(native_fn) = native_fallback {
            let mut full_args = Vec::with_capacity(args.len() + 1);
            full_args.push(recv);
            full_args.extend(args);
            let result = native_fn(self, &full_args).map_err(native_error_to_runtime)?;
            self.push(idx, result)?;
            return Ok(Step::Continue);
        }

        let method_fn_idx = match &recv {
            Value::ClassInstance(g) => g.borrow().resolve_method(name.as_str()).ok_or_else(|| {
                undefined_method(&g.borrow().def.name, name.as_str())
            })?,
            other => {
                return Err(RuntimeError::TypeMismatch {
                    expected: "class instance".into(),
                    found: other.type_name().into(),
                    span: Span::default(),
                })
            }
        };
        let callee_fn = self.functions.get(method_fn_idx as usize).cloned().ok_or_else(|| {
            RuntimeError::Generic { message: format!("method points at unknown function {method_fn_idx}"), span: Span::default() }
        })?;
        if (args.len() as u8) != callee_fn.arity {
            return Err(RuntimeError::ArityMismatch { expected: callee_fn.arity as usize, found: args.len(), span: Span::default() });
        }
        self.maybe_collect();
        let closure = self.heap.alloc(Closure { function: callee_fn, upvalues: Vec::new() });
        let base = self.processes[idx].operand_stack.len();
        for a in args {
            self.push(idx, a)?;
        }
        self.processes[idx].push_frame(CallFrame { closure, ip: 0, base, self_value: Some(recv) })?;
        Ok(Step::Continue)
    }

    /// `CallNativeMethod`: like `CallMethod` but the receiver is known
    /// statically to be (or is required to resolve to) a native method —
    /// used when the compiler can see the receiver's static type is a
    /// native class/struct instance, avoiding the script-chain probe above.
    fn do_call_native_method(
        &mut self,
        idx: usize,
        function: &Function,
        name_idx: usize,
        argc: usize,
    ) -> Result<Step, RuntimeError> {
        let name = self.const_str(function, name_idx)?;
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop(idx));
        }
        args.reverse();
        let recv = self.pop(idx);
        let native_fn = match &recv {
            Value::NativeClassInstance(g) => g.borrow().def.resolve_method(name.as_str()),
            Value::ClassInstance(g) => g.borrow().def.resolve_native_method(name.as_str()),
            other => {
                return Err(RuntimeError::TypeMismatch {
                    expected: "native class instance".into(),
                    found: other.type_name().into(),
                    span: Span::default(),
                })
            }
        }
        .ok_or_else(|| RuntimeError::Generic {
            message: format!("no native method '{name}' on this instance"),
            span: Span::default(),
        })?;
        let mut full_args = Vec::with_capacity(args.len() + 1);
        full_args.push(recv);
        full_args.extend(args);
        let result = native_fn(self, &full_args).map_err(native_error_to_runtime)?;
        self.push(idx, result)?;
        Ok(Step::Continue)
    }

    fn do_call_native(&mut self, idx: usize, native_idx: u32) -> Result<Step, RuntimeError> {
        let argc = self.pop_argc(idx);
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop(idx));
        }
        args.reverse();
        let name = self
            .native_fn_table
            .get(native_idx as usize)
            .cloned()
            .ok_or_else(|| RuntimeError::Generic { message: format!("no such native function {native_idx}"), span: Span::default() })?;
        let f = *self.registry.functions.get(&name).ok_or_else(|| RuntimeError::Generic {
            message: format!("native function '{name}' is not registered"),
            span: Span::default(),
        })?;
        let result = f(self, &args).map_err(native_error_to_runtime)?;
        self.push(idx, result)?;
        Ok(Step::Continue)
    }

    fn do_call_module(&mut self, idx: usize, module_id: u16, func_id: u16) -> Result<Step, RuntimeError> {
        let argc = self.pop_argc(idx);
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop(idx));
        }
        args.reverse();
        let module = self.registry.modules.get(module_id as usize).cloned().ok_or_else(|| {
            RuntimeError::Generic { message: format!("no such module {module_id}"), span: Span::default() }
        })?;
        let result = module.call(func_id, self, &args).map_err(native_error_to_runtime)?;
        self.push(idx, result)?;
        Ok(Step::Continue)
    }

    // ── Return / exceptions ──────────────────────────────────────────────

    fn do_return(&mut self, idx: usize, value: Value) -> Step {
        let process = &mut self.processes[idx];
        let current_frame = process.frames.len() - 1;

        if let Some(pos) = process
            .try_stack
            .iter()
            .rposition(|h| h.frame_restore == current_frame && h.finally_ip.is_some() && !h.in_finally)
        {
            let finally_ip = process.try_stack[pos].finally_ip.unwrap();
            if process.try_stack[pos].push_pending_return(value).is_ok() {
                process.try_stack[pos].in_finally = true;
                process.frames[current_frame].ip = finally_ip;
                return Step::Continue;
            }
        }

        let returning_base = process.frames[current_frame].base;
        process.frames.pop();
        if process.frames.is_empty() {
            if self.stop_on_frame_count.is_some() {
                return Step::Finished(ProcessResult::CallReturn(value));
            }
            return Step::Finished(ProcessResult::Done);
        }
        process.operand_stack.truncate(returning_base);
        let _ = process.push(value.clone());
        if let Some(target) = self.stop_on_frame_count {
            if process.frames.len() <= target {
                return Step::Finished(ProcessResult::CallReturn(value));
            }
        }
        Step::Continue
    }

    fn do_end_finally(&mut self, idx: usize) -> Step {
        let process = &mut self.processes[idx];
        let Some(handler) = process.try_stack.pop() else {
            return Step::Continue;
        };
        if handler.has_pending_error {
            if let Some(err_value) = handler.pending_error {
                if let Some(result) = self.unwind_or_die(idx, err_value) {
                    return Step::Finished(result);
                }
                return Step::Continue;
            }
        }
        if handler.has_pending_return {
            if let Some(v) = handler.pending_returns[0].clone() {
                return self.do_return(idx, v);
            }
        }
        Step::Continue
    }

    /// Attempt to deliver `error_value` to the nearest enclosing try-handler
    /// of process `idx` that isn't itself mid-`finally`. Returns
    /// `Some(result)` only if the process could not be recovered — a
    /// handled throw leaves the process ready to keep running and returns
    /// `None`.
    fn unwind_or_die(&mut self, idx: usize, error_value: Value) -> Option<ProcessResult> {
        let process = &mut self.processes[idx];

        for i in (0..process.try_stack.len()).rev() {
            if process.try_stack[i].in_finally {
                continue;
            }
            process.try_stack.truncate(i + 1);
            let restore_stack = process.try_stack[i].stack_restore;
            let restore_frame = process.try_stack[i].frame_restore;
            process.operand_stack.truncate(restore_stack);
            process.frames.truncate(restore_frame + 1);

            if let Some(catch_ip) = process.try_stack[i].catch_ip {
                process.try_stack[i].catch_consumed = true;
                let _ = process.push(error_value);
                process.frames[restore_frame].ip = catch_ip;
                return None;
            }
            if let Some(finally_ip) = process.try_stack[i].finally_ip {
                process.try_stack[i].has_pending_error = true;
                process.try_stack[i].pending_error = Some(error_value);
                process.try_stack[i].in_finally = true;
                process.frames[restore_frame].ip = finally_ip;
                return None;
            }
        }

        Some(ProcessResult::Error(RuntimeError::UncaughtException {
            message: format!("{}", error_value),
        }))
    }

    // ── Messages ─────────────────────────────────────────────────────────

    pub fn send_message(&mut self, to: u32, from: u32, kind: u16, value: Value) -> bool {
        self.processes.iter_mut().find(|p| p.id == to).map(|p| p.messages.send(from, kind, value)).unwrap_or(false)
    }

    pub fn pop_message(&mut self, process_id: u32) -> Option<Message> {
        self.processes.iter_mut().find(|p| p.id == process_id).and_then(|p| p.messages.pop())
    }

    // ── Bytecode save/load ───────────────────────────────────────────────

    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), LoadError> {
        let mut flags = SectionFlags::default();
        if !self.process_defs.is_empty() {
            flags.set(SectionFlags::HAS_PROCESSES);
        }
        if !self.structs.is_empty() {
            flags.set(SectionFlags::HAS_STRUCTS);
        }
        if !self.classes.is_empty() {
            flags.set(SectionFlags::HAS_CLASSES);
        }
        if self.global_names.iter().any(|n| n.is_some()) {
            flags.set(SectionFlags::HAS_GLOBAL_NAMES);
        }

        let mut counts = SectionCounts::default();
        counts.functions = self.functions.len() as u32;
        counts.processes = self.process_defs.len() as u32;
        counts.structs = self.structs.len() as u32;
        counts.classes = self.classes.len() as u32;
        counts.globals = self.globals.len() as u32;
        counts.natives = self.native_fn_table.len() as u32;
        counts.native_processes = self.registry.native_processes.len() as u32;
        counts.modules = self.registry.modules.len() as u32;

        let mut w = Writer::new();
        w.write_header(flags, &counts);

        for f in &self.functions {
            w.string(f.name.as_str());
            w.u8(f.arity);
            w.u8(f.upvalue_count);
            w.u16(f.max_locals);
            w.u32(f.code.len() as u32);
            w.bytes(&f.code);
            w.u32(f.lines.len() as u32);
            for l in &f.lines {
                w.u32(*l);
            }
            bytecode_io::write_constant_pool(&mut w, &f.constants);
        }

        for s in &self.structs {
            w.string(s.name.as_str());
            w.u32(s.fields.len() as u32);
            for field in &s.fields {
                w.string(field.name.as_str());
                bytecode_io::write_value(&mut w, &field.default);
            }
        }

        for c in &self.classes {
            w.string(c.name.as_str());
            w.optional_string(c.parent.as_ref().map(|p| p.name.as_str()));
            w.optional_string(c.native_superclass.as_ref().map(|n| n.name.as_str()));
            w.u32(c.fields.len() as u32);
            for field in &c.fields {
                w.string(field.name.as_str());
                bytecode_io::write_value(&mut w, &field.default);
            }
            w.u32(c.methods.len() as u32);
            for entry in c.methods.iter() {
                w.string(entry.key().as_str());
                w.u32(*entry.value());
            }
        }

        if flags.has(SectionFlags::HAS_GLOBAL_NAMES) {
            for name in &self.global_names {
                w.optional_string(name.as_ref().map(|s| s.as_str()));
            }
        }

        for p in &self.process_defs {
            w.string(p.name.as_str());
            let func_index = self
                .functions
                .iter()
                .position(|f| Rc::ptr_eq(f, &p.function))
                .ok_or_else(|| LoadError::TruncatedSection {
                    section: format!("process '{}' references a function not in the function table", p.name.as_str()),
                })?;
            w.u32(func_index as u32);
            w.u32(p.private_overrides.len() as u32);
            for (slot, value) in &p.private_overrides {
                w.u32(*slot as u32);
                bytecode_io::write_value(&mut w, value);
            }
        }

        for (index, name) in self.native_fn_table.iter().enumerate() {
            w.u32(index as u32);
            w.optional_string(Some(name));
            w.u32(*self.native_fn_arity.get(index).unwrap_or(&0) as u32);
        }

        for np in &self.registry.native_processes {
            w.string(np.name.as_str());
            w.u8(np.arity);
        }

        for m in &self.registry.modules {
            w.string(m.name.as_str());
            w.u32(m.functions.len() as u32);
            for (fname, _) in &m.functions {
                w.string(fname.as_str());
            }
        }

        bytecode_io::atomic_write(path, &w.into_bytes())
    }

    /// Load bytecode from `path`, resetting the VM first. Native functions
    /// referenced by the file must already be registered under the same
    /// name, or the load fails (spec.md §4.K load policy).
    pub fn load_from_file(&mut self, path: &std::path::Path) -> Result<(), LoadError> {
        let bytes = bytecode_io::read_file(path)?;
        self.reset();

        let mut r = Reader::new(&bytes);
        let header = r.read_header()?;

        for _ in 0..header.counts.functions {
            let name = r.string("function.name")?;
            let arity = r.u8("function.arity")?;
            let upvalue_count = r.u8("function.upvalue_count")?;
            let max_locals = r.u16("function.max_locals")?;
            let code_len = r.u32("function.code_len")? as usize;
            let code = r.bytes(code_len, "function.code")?.to_vec();
            let line_count = r.u32("function.line_count")? as usize;
            let mut lines = Vec::with_capacity(line_count);
            for _ in 0..line_count {
                lines.push(r.u32("function.line")?);
            }
            let constants = bytecode_io::read_constant_pool(&mut r, &mut self.string_pool)?;
            self.load_function(Function {
                name: self.string_pool.intern(&name),
                arity,
                upvalue_count,
                max_locals,
                code,
                constants,
                lines,
            });
        }

        for _ in 0..header.counts.structs {
            let name = r.string("struct.name")?;
            let field_count = r.u32("struct.field_count")?;
            let mut fields = Vec::with_capacity(field_count as usize);
            for _ in 0..field_count {
                let fname = r.string("struct.field.name")?;
                let default = bytecode_io::read_value(&mut r, &mut self.string_pool)?;
                fields.push(crate::class::FieldDef { name: self.string_pool.intern(&fname), default });
            }
            self.define_struct(StructDef { name: self.string_pool.intern(&name), fields });
        }

        let mut pending_classes = Vec::new();
        for _ in 0..header.counts.classes {
            let name = r.string("class.name")?;
            let parent_name = r.optional_string("class.parent")?;
            let native_superclass_name = r.optional_string("class.native_superclass")?;
            let field_count = r.u32("class.field_count")?;
            let mut fields = Vec::with_capacity(field_count as usize);
            for _ in 0..field_count {
                let fname = r.string("class.field.name")?;
                let default = bytecode_io::read_value(&mut r, &mut self.string_pool)?;
                fields.push(crate::class::FieldDef { name: self.string_pool.intern(&fname), default });
            }
            let method_count = r.u32("class.method_count")?;
            let methods = dashmap::DashMap::new();
            for _ in 0..method_count {
                let mname = r.string("class.method.name")?;
                let findex = r.u32("class.method.function_index")?;
                methods.insert(self.string_pool.intern(&mname), findex);
            }
            pending_classes.push((name, parent_name, native_superclass_name, fields, methods));
        }
        // link parent references by name, in declaration order (parents
        // must precede children in the file, matching compile order).
        for (name, parent_name, native_superclass_name, fields, methods) in pending_classes {
            let parent = parent_name.and_then(|pn| self.classes.iter().find(|c| c.name.as_str() == pn).cloned());
            let native_superclass = match native_superclass_name {
                Some(n) => Some(self.registry.classes.get(&n).cloned().ok_or_else(|| LoadError::TruncatedSection {
                    section: format!("native class '{n}' is not registered with this runtime"),
                })?),
                None => None,
            };
            self.define_class(ClassDef {
                name: self.string_pool.intern(&name),
                parent,
                native_superclass,
                fields,
                methods,
            });
        }

        if header.flags.has(SectionFlags::HAS_GLOBAL_NAMES) {
            for _ in 0..header.counts.globals {
                let name = r.optional_string("global.name")?;
                self.define_global(name.as_deref(), Value::Nil);
            }
        } else {
            for _ in 0..header.counts.globals {
                self.define_global(None, Value::Nil);
            }
        }

        for _ in 0..header.counts.processes {
            let name = r.string("process.name")?;
            let func_index = r.u32("process.function_index")? as usize;
            let function = self.functions.get(func_index).cloned().ok_or_else(|| LoadError::TruncatedSection {
                section: format!("process '{name}' references out-of-range function index {func_index}"),
            })?;
            let override_count = r.u32("process.override_count")?;
            let mut private_overrides = Vec::with_capacity(override_count as usize);
            for _ in 0..override_count {
                let slot = r.u32("process.override.slot")? as usize;
                let value = bytecode_io::read_value(&mut r, &mut self.string_pool)?;
                private_overrides.push((slot, value));
            }
            self.define_process(ProcessDef { name: self.string_pool.intern(&name), function, private_overrides });
        }

        for _ in 0..header.counts.natives {
            let _index = r.u32("native.index")?;
            let name = r.optional_string("native.name")?;
            let file_arity = r.u32("native.arity")? as u8;
            if let Some(name) = name {
                if !self.registry.functions.contains_key(&name) {
                    return Err(LoadError::TruncatedSection {
                        section: format!("native function '{name}' is not registered with this runtime"),
                    });
                }
                if let Some(pos) = self.native_fn_table.iter().position(|n| n == &name) {
                    let runtime_arity = self.native_fn_arity[pos];
                    if runtime_arity != file_arity {
                        return Err(LoadError::NativeArityMismatch { name, expected: file_arity, found: runtime_arity });
                    }
                }
            }
        }

        for _ in 0..header.counts.native_processes {
            let name = r.string("native_process.name")?;
            let file_arity = r.u8("native_process.arity")?;
            let np = self
                .registry
                .native_processes
                .iter()
                .find(|p| p.name.as_str() == name)
                .ok_or_else(|| LoadError::TruncatedSection {
                    section: format!("native process '{name}' is not registered with this runtime"),
                })?;
            if np.arity != file_arity {
                return Err(LoadError::NativeArityMismatch { name, expected: file_arity, found: np.arity });
            }
        }

        for _ in 0..header.counts.modules {
            let name = r.string("module.name")?;
            let func_count = r.u32("module.function_count")?;
            let mut names = Vec::with_capacity(func_count as usize);
            for _ in 0..func_count {
                names.push(r.string("module.function.name")?);
            }
            let module = self.registry.modules.iter().find(|m| m.name.as_str() == name).ok_or_else(|| {
                LoadError::TruncatedSection { section: format!("module '{name}' is not registered with this runtime") }
            })?;
            if module.functions.len() != names.len()
                || module.functions.iter().zip(names.iter()).any(|((n, _), file_n)| n.as_str() != file_n)
            {
                return Err(LoadError::TruncatedSection {
                    section: format!("module '{name}' function table does not match this runtime's registration"),
                });
            }
        }

        Ok(())
    }
}

fn closure_upvalue(closure: &Gc<Closure>, slot: usize) -> Gc<Upvalue> {
    closure.borrow().upvalues[slot].clone()
}

fn type_mismatch(v: &Value) -> RuntimeError {
    RuntimeError::TypeMismatch { expected: "numeric".into(), found: v.type_name().into(), span: Span::default() }
}

fn undefined_method(class_name: &StrRef, method: &str) -> RuntimeError {
    RuntimeError::UndefinedMethod { class_name: class_name.as_str().into(), method_name: method.into(), span: Span::default() }
}

fn native_error_to_runtime(e: NativeError) -> RuntimeError {
    RuntimeError::Generic { message: e.message, span: Span::default() }
}

/// Internal VM faults have no richer representation to hand a script-level
/// catch block than their message text (spec.md §7: a `RuntimeError` turns
/// into a script-visible throwable `Value`). An explicit `throw` of a
/// script `Value` never goes through this path — it keeps its original
/// value all the way to the handler.
fn runtime_error_to_value(e: &RuntimeError, pool: &mut StringPool) -> Value {
    Value::String(pool.intern(&e.to_string()))
}

fn index_as_usize(index: &Value, len: usize) -> Result<usize, RuntimeError> {
    let i = index.as_int().ok_or_else(|| type_mismatch(index))?;
    if i < 0 || i as usize >= len {
        return Err(RuntimeError::IndexOutOfBounds { index: i, length: len, span: Span::default() });
    }
    Ok(i as usize)
}

/// Read element `i` of a raw buffer, decoding the bytes per its element
/// kind. Bounds (`i < count`) are checked by the caller via
/// `index_as_usize`; the byte offset itself only ever lands inside
/// `data` because a buffer's backing `Vec<u8>` is always sized
/// `count * element_size` at construction.
fn buffer_read(buf: &Buffer, i: usize) -> Value {
    let off = i * buf.kind.element_size();
    match buf.kind {
        BufferKind::U8 => Value::Byte(buf.data[off]),
        BufferKind::I16 => Value::Int(i16::from_le_bytes([buf.data[off], buf.data[off + 1]]) as i32),
        BufferKind::U16 => Value::UInt(u16::from_le_bytes([buf.data[off], buf.data[off + 1]]) as u32),
        BufferKind::I32 => Value::Int(i32::from_le_bytes(buf.data[off..off + 4].try_into().unwrap())),
        BufferKind::U32 => Value::UInt(u32::from_le_bytes(buf.data[off..off + 4].try_into().unwrap())),
        BufferKind::F32 => Value::Float(f32::from_le_bytes(buf.data[off..off + 4].try_into().unwrap())),
        BufferKind::F64 => Value::Double(f64::from_le_bytes(buf.data[off..off + 8].try_into().unwrap())),
    }
}

fn buffer_write(buf: &mut Buffer, i: usize, value: &Value) -> Result<(), RuntimeError> {
    let off = i * buf.kind.element_size();
    match buf.kind {
        BufferKind::U8 => buf.data[off] = value.as_int().ok_or_else(|| type_mismatch(value))? as u8,
        BufferKind::I16 => {
            let v = value.as_int().ok_or_else(|| type_mismatch(value))? as i16;
            buf.data[off..off + 2].copy_from_slice(&v.to_le_bytes());
        }
        BufferKind::U16 => {
            let v = value.as_int().ok_or_else(|| type_mismatch(value))? as u16;
            buf.data[off..off + 2].copy_from_slice(&v.to_le_bytes());
        }
        BufferKind::I32 => {
            let v = value.as_int().ok_or_else(|| type_mismatch(value))? as i32;
            buf.data[off..off + 4].copy_from_slice(&v.to_le_bytes());
        }
        BufferKind::U32 => {
            let v = value.as_int().ok_or_else(|| type_mismatch(value))? as u32;
            buf.data[off..off + 4].copy_from_slice(&v.to_le_bytes());
        }
        BufferKind::F32 => {
            let v = value.as_double().ok_or_else(|| type_mismatch(value))? as f32;
            buf.data[off..off + 4].copy_from_slice(&v.to_le_bytes());
        }
        BufferKind::F64 => {
            let v = value.as_double().ok_or_else(|| type_mismatch(value))?;
            buf.data[off..off + 8].copy_from_slice(&v.to_le_bytes());
        }
    }
    Ok(())
}

/// Promote two operands per the Byte -> Int -> UInt -> Float -> Double
/// lattice and apply `op`. Division by zero is a runtime error; integer
/// overflow wraps, matching the value model's fixed-width scalars.
fn numeric_binop(op: Op, a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    use crate::value::{num_rank, NumRank};
    let (ra, rb) = (num_rank(a).ok_or_else(|| type_mismatch(a))?, num_rank(b).ok_or_else(|| type_mismatch(b))?);
    let rank = ra.max(rb);

    match rank {
        NumRank::Byte | NumRank::Int => {
            let (x, y) = (a.as_int().unwrap() as i32, b.as_int().unwrap() as i32);
            let result = match op {
                Op::Add => x.wrapping_add(y),
                Op::Sub => x.wrapping_sub(y),
                Op::Mul => x.wrapping_mul(y),
                Op::Div => {
                    if y == 0 {
                        return Err(RuntimeError::DivisionByZero { span: Span::default() });
                    }
                    x.wrapping_div(y)
                }
                Op::Mod => {
                    if y == 0 {
                        return Err(RuntimeError::DivisionByZero { span: Span::default() });
                    }
                    x.wrapping_rem(y)
                }
                _ => unreachable!(),
            };
            Ok(Value::Int(result))
        }
        NumRank::UInt => {
            let (x, y) = (a.as_int().unwrap() as u32, b.as_int().unwrap() as u32);
            let result = match op {
                Op::Add => x.wrapping_add(y),
                Op::Sub => x.wrapping_sub(y),
                Op::Mul => x.wrapping_mul(y),
                Op::Div => {
                    if y == 0 {
                        return Err(RuntimeError::DivisionByZero { span: Span::default() });
                    }
                    x.wrapping_div(y)
                }
                Op::Mod => {
                    if y == 0 {
                        return Err(RuntimeError::DivisionByZero { span: Span::default() });
                    }
                    x.wrapping_rem(y)
                }
                _ => unreachable!(),
            };
            Ok(Value::UInt(result))
        }
        NumRank::Float => {
            let (x, y) = (a.as_double().unwrap() as f32, b.as_double().unwrap() as f32);
            Ok(Value::Float(apply_float(op, x, y)?))
        }
        NumRank::Double => {
            let (x, y) = (a.as_double().unwrap(), b.as_double().unwrap());
            Ok(Value::Double(apply_float(op, x, y)?))
        }
    }
}

fn apply_float<T>(op: Op, x: T, y: T) -> Result<T, RuntimeError>
where
    T: std::ops::Add<Output = T> + std::ops::Sub<Output = T> + std::ops::Mul<Output = T> + std::ops::Div<Output = T> + std::ops::Rem<Output = T> + PartialEq + Default,
{
    match op {
        Op::Add => Ok(x + y),
        Op::Sub => Ok(x - y),
        Op::Mul => Ok(x * y),
        Op::Div => {
            if y == T::default() {
                return Err(RuntimeError::DivisionByZero { span: Span::default() });
            }
            Ok(x / y)
        }
        Op::Mod => {
            if y == T::default() {
                return Err(RuntimeError::DivisionByZero { span: Span::default() });
            }
            Ok(x % y)
        }
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::Op;

    fn simple_function(code: Vec<u8>, constants: Vec<Value>, arity: u8) -> Function {
        let mut pool = StringPool::new();
        Function {
            name: pool.intern("test"),
            arity,
            upvalue_count: 0,
            max_locals: 4,
            lines: vec![1; code.len()],
            code,
            constants,
        }
    }

    fn new_interpreter() -> Interpreter {
        Interpreter::new(NativeRegistry::new())
    }

    #[test]
    fn arithmetic_promotion_adds_int_and_double() {
        let mut vm = new_interpreter();
        let code = vec![
            Op::PushConst as u8, 0, 0,
            Op::PushConst as u8, 1, 0,
            Op::Add as u8,
            Op::Return as u8,
        ];
        let f = simple_function(code, vec![Value::Int(1), Value::Double(2.5)], 0);
        let idx = vm.load_function(f);
        let result = vm.call_function(idx, &[]).unwrap();
        assert_eq!(result, Value::Double(3.5));
    }

    #[test]
    fn division_by_zero_is_a_runtime_error() {
        let mut vm = new_interpreter();
        let code = vec![
            Op::PushConst as u8, 0, 0,
            Op::PushConst as u8, 1, 0,
            Op::Div as u8,
            Op::Return as u8,
        ];
        let f = simple_function(code, vec![Value::Int(1), Value::Int(0)], 0);
        let idx = vm.load_function(f);
        assert!(matches!(vm.call_function(idx, &[]), Err(RuntimeError::UncaughtException { .. }) | Err(RuntimeError::DivisionByZero { .. })));
    }

    #[test]
    fn new_array_of_zero_elements_is_empty_and_indexing_errors() {
        let mut vm = new_interpreter();
        let code = vec![
            Op::NewArray as u8, 0, 0,
            Op::PushConst as u8, 0, 0,
            Op::GetIndex as u8,
            Op::Return as u8,
        ];
        let f = simple_function(code, vec![Value::Int(0)], 0);
        let idx = vm.load_function(f);
        assert!(vm.call_function(idx, &[]).is_err());
    }

    #[test]
    fn scheduler_suspends_then_completes_process_per_spec_scenario() {
        let mut vm = new_interpreter();
        // frame(100); frame(200); exit (halt)
        let code = vec![
            Op::PushConst as u8, 0, 0,
            Op::Frame as u8,
            Op::PushConst as u8, 1, 0,
            Op::Frame as u8,
            Op::Halt as u8,
        ];
        let f = simple_function(code, vec![Value::Int(100), Value::Int(200)], 0);
        let fn_idx = vm.load_function(f);
        let def = ProcessDef {
            name: vm.string_pool.intern("P"),
            function: vm.functions[fn_idx as usize].clone(),
            private_overrides: Vec::new(),
        };
        let def_idx = vm.define_process(def);
        vm.spawn(def_idx, &[]).unwrap();

        let dt = 1.0 / 60.0;
        vm.update(dt);
        assert_eq!(vm.processes[0].state, ProcessState::Suspended);
        vm.update(dt);
        assert_eq!(vm.processes[0].state, ProcessState::Suspended);
        vm.update(dt);
        assert!(vm.processes.is_empty() || vm.processes[0].is_dead());
    }

    #[test]
    fn gc_reclaims_arrays_once_unreachable() {
        let mut vm = new_interpreter();
        for _ in 0..64 {
            vm.heap.alloc::<ArrayInstance>(vec![Value::Int(1)]);
        }
        let freed = vm.heap.collect(vec![]);
        assert_eq!(freed, 64);
        assert_eq!(vm.heap.stats().objects_live, 0);
    }
}
