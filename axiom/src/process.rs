/// Process fiber state: the operand stack, call frames, gosub stack, and
/// try-handler stack that make a cooperatively-scheduled process a
/// first-class, independently-suspendable unit of execution. One `Process`
/// corresponds to one `spawn` in the script; the scheduler (see
/// `interpreter.rs`) round-robins across every non-dead process each tick.

use crate::class::Closure;
use crate::errors::RuntimeError;
use crate::gc::Gc;
use crate::messages::MessageQueue;
use crate::value::Value;

pub const STACK_MAX: usize = 256;
pub const FRAMES_MAX: usize = 64;
pub const GOSUB_MAX: usize = 16;
pub const TRY_MAX: usize = 16;
pub const MAX_PRIVATES: usize = 28;
pub const MAX_PENDING_RETURNS: usize = 16;

/// Index of each well-known private slot, as fixed by the original
/// interpreter's `getProcessPrivateIndex` dispatch table.
pub mod privates {
    pub const X: usize = 0;
    pub const Y: usize = 1;
    pub const Z: usize = 2;
    pub const GRAPH: usize = 3;
    pub const ANGLE: usize = 4;
    pub const SIZE: usize = 5;
    pub const FLAGS: usize = 6;
    pub const ID: usize = 7;
    pub const FATHER: usize = 8;
    pub const RED: usize = 9;
    pub const GREEN: usize = 10;
    pub const BLUE: usize = 11;
    pub const ALPHA: usize = 12;
    pub const TAG: usize = 13;
    pub const STATE: usize = 14;
    pub const SPEED: usize = 15;
    pub const GROUP: usize = 16;
    pub const VELX: usize = 17;
    pub const VELY: usize = 18;
    pub const HP: usize = 19;
    pub const PROGRESS: usize = 20;
    pub const LIFE: usize = 21;
    pub const ACTIVE: usize = 22;
    pub const SHOW: usize = 23;
    pub const XOLD: usize = 24;
    pub const YOLD: usize = 25;
    pub const SIZEX: usize = 26;
    pub const SIZEY: usize = 27;

    /// (name, index) pairs in declaration order, for name -> index lookup
    /// and for building a fresh default vector.
    pub const NAMES: [(&str, usize); 28] = [
        ("x", X), ("y", Y), ("z", Z), ("graph", GRAPH), ("angle", ANGLE), ("size", SIZE),
        ("flags", FLAGS), ("id", ID), ("father", FATHER), ("red", RED), ("green", GREEN),
        ("blue", BLUE), ("alpha", ALPHA), ("tag", TAG), ("state", STATE), ("speed", SPEED),
        ("group", GROUP), ("velx", VELX), ("vely", VELY), ("hp", HP), ("progress", PROGRESS),
        ("life", LIFE), ("active", ACTIVE), ("show", SHOW), ("xold", XOLD), ("yold", YOLD),
        ("sizex", SIZEX), ("sizey", SIZEY),
    ];

    pub fn index_of(name: &str) -> Option<usize> {
        NAMES.iter().find(|(n, _)| *n == name).map(|(_, i)| *i)
    }
}

use crate::value::Value as V;

/// Default values for the 28 private slots, in declaration order.
pub fn default_privates() -> [Value; MAX_PRIVATES] {
    [
        V::Double(0.0), V::Double(0.0), V::Int(0), V::Int(-1), V::Int(0), V::Int(100),
        V::Int(0), V::Int(-1), V::Int(-1), V::Int(255), V::Int(255), V::Int(255), V::Int(255),
        V::Int(0), V::Int(0), V::Double(0.0), V::Int(0), V::Double(0.0), V::Double(0.0),
        V::Int(0), V::Double(0.0), V::Int(100), V::Int(1), V::Int(1), V::Int(0), V::Int(0),
        V::Double(1.0), V::Double(1.0),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Suspended,
    Frozen,
    Dead,
}

pub struct CallFrame {
    pub closure: Gc<Closure>,
    pub ip: usize,
    pub base: usize,
    pub self_value: Option<Value>,
}

/// One active try/catch/finally scope. `stack_restore` records the operand
/// stack depth to unwind to when a throw is caught; `pending_returns`
/// queues `return` statements executed inside a `finally` block that must
/// replay once the finally completes (spec.md §4.G).
pub struct TryHandler {
    pub catch_ip: Option<usize>,
    pub finally_ip: Option<usize>,
    pub stack_restore: usize,
    pub frame_restore: usize,
    pub in_finally: bool,
    pub has_pending_error: bool,
    pub pending_error: Option<Value>,
    pub catch_consumed: bool,
    pub pending_returns: [Option<Value>; MAX_PENDING_RETURNS],
    pub pending_return_count: usize,
    pub has_pending_return: bool,
}

impl TryHandler {
    pub fn new(catch_ip: Option<usize>, finally_ip: Option<usize>, stack_restore: usize, frame_restore: usize) -> Self {
        TryHandler {
            catch_ip,
            finally_ip,
            stack_restore,
            frame_restore,
            in_finally: false,
            has_pending_error: false,
            pending_error: None,
            catch_consumed: false,
            pending_returns: Default::default(),
            pending_return_count: 0,
            has_pending_return: false,
        }
    }

    pub fn push_pending_return(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.pending_return_count >= MAX_PENDING_RETURNS {
            return Err(RuntimeError::PendingReturnOverflow { limit: MAX_PENDING_RETURNS });
        }
        self.pending_returns[self.pending_return_count] = Some(value);
        self.pending_return_count += 1;
        self.has_pending_return = true;
        Ok(())
    }
}

pub struct Process {
    pub id: u32,
    pub state: ProcessState,
    pub operand_stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    pub gosub_stack: Vec<usize>,
    pub try_stack: Vec<TryHandler>,
    pub privates: [Value; MAX_PRIVATES],
    pub resume_time: f64,
    pub messages: MessageQueue,
    /// False until the process first suspends (yield/frame), then true for
    /// the remainder of its life. Drives the one-shot `on_start` host hook.
    pub initialized: bool,
    /// Set when the process dies, either to 0 on a normal `ProcessDone` or
    /// to a host/script-supplied code; read by the `on_destroy` host hook.
    pub exit_code: i32,
}

impl Process {
    pub fn new(id: u32) -> Self {
        Process {
            id,
            state: ProcessState::Running,
            operand_stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            gosub_stack: Vec::with_capacity(GOSUB_MAX),
            try_stack: Vec::with_capacity(TRY_MAX),
            privates: default_privates(),
            resume_time: 0.0,
            messages: MessageQueue::new(),
            initialized: false,
            exit_code: 0,
        }
    }

    /// Reset a recycled `Process` back to the freshly-spawned state
    /// (private-slot pool lifecycle, spec.md §4.F).
    pub fn reset_for_reuse(&mut self, id: u32) {
        self.id = id;
        self.state = ProcessState::Running;
        self.operand_stack.clear();
        self.frames.clear();
        self.gosub_stack.clear();
        self.try_stack.clear();
        self.privates = default_privates();
        self.resume_time = 0.0;
        self.messages.clear();
        self.initialized = false;
        self.exit_code = 0;
    }

    pub fn push(&mut self, v: Value) -> Result<(), RuntimeError> {
        if self.operand_stack.len() >= STACK_MAX {
            return Err(RuntimeError::OperandStackOverflow { limit: STACK_MAX });
        }
        self.operand_stack.push(v);
        Ok(())
    }

    pub fn pop(&mut self) -> Value {
        self.operand_stack.pop().unwrap_or(Value::Nil)
    }

    pub fn push_frame(&mut self, frame: CallFrame) -> Result<(), RuntimeError> {
        if self.frames.len() >= FRAMES_MAX {
            return Err(RuntimeError::StackOverflow { limit: FRAMES_MAX });
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn push_gosub(&mut self, return_ip: usize) -> Result<(), RuntimeError> {
        if self.gosub_stack.len() >= GOSUB_MAX {
            return Err(RuntimeError::GosubStackOverflow { limit: GOSUB_MAX });
        }
        self.gosub_stack.push(return_ip);
        Ok(())
    }

    pub fn push_try(&mut self, handler: TryHandler) -> Result<(), RuntimeError> {
        if self.try_stack.len() >= TRY_MAX {
            return Err(RuntimeError::TryStackOverflow { limit: TRY_MAX });
        }
        self.try_stack.push(handler);
        Ok(())
    }

    pub fn is_dead(&self) -> bool {
        self.state == ProcessState::Dead
    }

    /// Every `Value` this process keeps alive: operand stack, frame
    /// closures and self-values, and private slots. Call frames of a dead
    /// process are excluded from root collection, as dead processes no
    /// longer reference live script state the GC needs to trace on their
    /// behalf (spec.md §4.D root-set definition).
    pub fn gc_roots(&self) -> Vec<Value> {
        if self.is_dead() {
            return Vec::new();
        }
        let mut roots = Vec::new();
        roots.extend(self.operand_stack.iter().cloned());
        roots.extend(self.privates.iter().cloned());
        for frame in &self.frames {
            roots.push(Value::Closure(frame.closure.clone()));
            if let Some(sv) = &frame.self_value {
                roots.push(sv.clone());
            }
        }
        for handler in &self.try_stack {
            if let Some(err) = &handler.pending_error {
                roots.push(err.clone());
            }
            for pr in handler.pending_returns.iter().flatten() {
                roots.push(pr.clone());
            }
        }
        roots
    }

    /// Compute the wall-clock resume time for `frame(percent)`, per the
    /// resolved Open Question: the formula is applied uniformly, including
    /// for `percent < 100`, which yields an earlier-or-equal resume time
    /// and simply makes the process eligible again sooner.
    pub fn compute_frame_resume(current_time: f64, last_frame_dt: f64, percent: i64) -> f64 {
        current_time + last_frame_dt * ((percent - 100) as f64) / 100.0
    }
}

/// Blueprint a live `Process` is spawned from: the function its single
/// initial frame runs, and any private-slot values it overrides away from
/// `default_privates()`.
pub struct ProcessDef {
    pub name: crate::strings::StrRef,
    pub function: std::rc::Rc<crate::code::Function>,
    pub private_overrides: Vec<(usize, Value)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_privates_match_original_table() {
        let p = default_privates();
        assert_eq!(p[privates::SIZE], Value::Int(100));
        assert_eq!(p[privates::ID], Value::Int(-1));
        assert_eq!(p[privates::ALPHA], Value::Int(255));
        assert_eq!(p[privates::SIZEX], Value::Double(1.0));
    }

    #[test]
    fn private_name_lookup_resolves_every_slot() {
        for (name, idx) in privates::NAMES {
            assert_eq!(privates::index_of(name), Some(idx));
        }
    }

    #[test]
    fn operand_stack_overflow_is_reported() {
        let mut p = Process::new(1);
        for _ in 0..STACK_MAX {
            p.push(Value::Nil).unwrap();
        }
        assert!(p.push(Value::Nil).is_err());
    }

    #[test]
    fn frame_resume_with_n_below_100_is_not_later_than_now() {
        let now = 100.0;
        let dt = 0.016;
        let resume = Process::compute_frame_resume(now, dt, 50);
        assert!(resume <= now);
    }

    #[test]
    fn frame_resume_with_n_above_100_delays_past_now() {
        let now = 100.0;
        let dt = 0.016;
        let resume = Process::compute_frame_resume(now, dt, 200);
        assert!(resume > now);
    }

    #[test]
    fn reset_for_reuse_restores_defaults() {
        let mut p = Process::new(5);
        p.push(Value::Int(1)).unwrap();
        p.state = ProcessState::Dead;
        p.reset_for_reuse(9);
        assert_eq!(p.id, 9);
        assert_eq!(p.state, ProcessState::Running);
        assert!(p.operand_stack.is_empty());
        assert_eq!(p.privates[privates::SIZE], Value::Int(100));
    }
}
