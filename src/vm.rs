use crate::builtins::{self, Builtin};
use crate::config::VmConfig;
use crate::context::{Archives, Handler, HandlerTier};
use crate::datum::{Datum, ObjectRef};
use crate::error::{DecodeError, VmError};
use crate::symbol::SymbolTable;
use indexmap::IndexMap;
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Request flag for cutting a running script short. Clones share the flag,
/// so another thread may hold one while the script runs.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        AbortHandle::default()
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    /// The host asked for the script to stop
    External,
    Decode(DecodeError),
    Runtime(VmError),
    /// Too many instructions in one run
    SafetyValve(u32),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AbortReason::External => write!(f, "aborted by host"),
            AbortReason::Decode(e) => write!(f, "{}", e),
            AbortReason::Runtime(e) => write!(f, "{}", e),
            AbortReason::SafetyValve(n) => {
                write!(f, "runaway script stopped after {} instructions", n)
            }
        }
    }
}

/// Lifecycle of a script thread
#[derive(Debug, Clone, PartialEq)]
pub enum ExecState {
    Ready,
    Running,
    /// Suspended with its frames intact, resumable on a later tick
    Yielded,
    Stopped,
    Aborted(AbortReason),
}

impl ExecState {
    pub fn is_finished(&self) -> bool {
        matches!(self, ExecState::Stopped | ExecState::Aborted(_))
    }
}

/// One activation of a handler
#[derive(Debug, Clone)]
pub struct Frame {
    pub handler: Rc<Handler>,
    /// Next instruction, as a word index into the handler's code
    pub pc: usize,
    /// Caller's pc at the time of the call
    pub return_pc: usize,
    pub locals: IndexMap<String, Datum>,
    /// Operand stack height when the frame was entered
    pub stack_base: usize,
    pub me: Option<ObjectRef>,
}

impl Frame {
    /// Bind arguments to the handler's argument names in order. Missing
    /// arguments read as Void, extra ones are dropped.
    pub fn new(
        handler: Rc<Handler>,
        args: Vec<Datum>,
        return_pc: usize,
        stack_base: usize,
        me: Option<ObjectRef>,
    ) -> Self {
        if args.len() > handler.arg_names.len() {
            debug!(
                "{} called with {} arguments, takes {}",
                handler.name,
                args.len(),
                handler.arg_names.len()
            );
        }
        let mut locals = IndexMap::new();
        let mut args = args.into_iter();
        for name in &handler.arg_names {
            locals.insert(name.clone(), args.next().unwrap_or(Datum::Void));
        }
        for name in &handler.local_names {
            locals.entry(name.clone()).or_insert(Datum::Void);
        }
        Frame {
            handler,
            pc: 0,
            return_pc,
            locals,
            stack_base,
            me,
        }
    }
}

/// A resumable script: its reified call stack and operand stack
#[derive(Debug)]
pub struct ScriptThread {
    pub state: ExecState,
    pub frames: Vec<Frame>,
    pub stack: Vec<Datum>,
    /// Clock time before which a delayed thread does not run
    pub resume_at: Option<u64>,
    /// Entity whose event bindings calls resolve against
    pub entity_id: u16,
    /// Value returned by the outermost handler
    pub result: Option<Datum>,
    /// Instructions dispatched over the thread's lifetime
    pub dispatched: u64,
    stack_limit: usize,
    abort: AbortHandle,
}

impl ScriptThread {
    pub fn new(handler: Rc<Handler>, args: Vec<Datum>, entity_id: u16, me: Option<ObjectRef>) -> Self {
        ScriptThread {
            state: ExecState::Ready,
            frames: vec![Frame::new(handler, args, 0, 0, me)],
            stack: Vec::new(),
            resume_at: None,
            entity_id,
            result: None,
            dispatched: 0,
            stack_limit: usize::MAX,
            abort: AbortHandle::new(),
        }
    }

    pub fn with_stack_limit(mut self, limit: usize) -> Self {
        self.stack_limit = limit;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.is_requested()
    }

    pub fn name(&self) -> &str {
        self.frames
            .first()
            .map(|f| f.handler.name.as_str())
            .unwrap_or("<finished>")
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn current_frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// Local of the innermost frame, for inspection
    pub fn local(&self, name: &str) -> Option<&Datum> {
        self.frames.last().and_then(|f| f.locals.get(name))
    }

    pub fn push(&mut self, value: Datum) -> Result<(), VmError> {
        if self.stack.len() >= self.stack_limit {
            return Err(VmError::StackOverflow(self.stack_limit));
        }
        self.stack.push(value);
        Ok(())
    }

    /// Pop within the current frame; values below its base belong to the caller
    pub fn pop(&mut self) -> Result<Datum, VmError> {
        let base = self.frames.last().map(|f| f.stack_base).unwrap_or(0);
        if self.stack.len() <= base {
            return Err(VmError::StackUnderflow {
                needed: 1,
                available: 0,
            });
        }
        self.stack.pop().ok_or(VmError::StackUnderflow {
            needed: 1,
            available: 0,
        })
    }

    /// Pop `n` values, returned in push order
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<Datum>, VmError> {
        let base = self.frames.last().map(|f| f.stack_base).unwrap_or(0);
        let available = self.stack.len().saturating_sub(base);
        if n > available {
            return Err(VmError::StackUnderflow {
                needed: n,
                available,
            });
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    pub fn peek(&self) -> Result<&Datum, VmError> {
        let base = self.frames.last().map(|f| f.stack_base).unwrap_or(0);
        if self.stack.len() <= base {
            return Err(VmError::StackUnderflow {
                needed: 1,
                available: 0,
            });
        }
        self.stack.last().ok_or(VmError::StackUnderflow {
            needed: 1,
            available: 0,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    UndefinedVariable,
    ScopeMismatch,
    ReadOnlyVariable,
    UndefinedHandler,
    UnknownOpcode,
    SurfaceFailure,
    BadIndex,
}

/// Non-fatal problem met while running a script
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
}

/// Something a name can be called as
#[derive(Debug, Clone)]
pub enum Callable {
    Script(HandlerTier, Rc<Handler>),
    Builtin(&'static Builtin),
}

/// The VM core: everything scripts share. Threads are owned by the caller
/// and passed in to `execute`.
pub struct Vm {
    pub config: VmConfig,
    pub symbols: SymbolTable,
    pub archives: Archives,
    pub(crate) rng: StdRng,
    diagnostics: VecDeque<Diagnostic>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        let rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Vm {
            config,
            symbols: SymbolTable::new(),
            archives: Archives::new(),
            rng,
            diagnostics: VecDeque::new(),
        }
    }

    /// Start a thread on `handler` with this VM's stack limit
    pub fn spawn(
        &self,
        handler: Rc<Handler>,
        args: Vec<Datum>,
        entity_id: u16,
        me: Option<ObjectRef>,
    ) -> ScriptThread {
        ScriptThread::new(handler, args, entity_id, me).with_stack_limit(self.config.max_stack)
    }

    /// Resolve a call target: script tiers first, builtins last
    pub fn resolve_callable(&self, name: &str, entity_id: u16) -> Option<Callable> {
        if let Some((tier, handler)) = self.archives.resolve_handler(name, entity_id) {
            return Some(Callable::Script(tier, handler));
        }
        builtins::lookup(name).map(Callable::Builtin)
    }

    pub(crate) fn report(&mut self, kind: DiagnosticKind, message: String) {
        warn!("{}", message);
        if self.config.max_diagnostics == 0 {
            return;
        }
        while self.diagnostics.len() >= self.config.max_diagnostics {
            self.diagnostics.pop_front();
        }
        self.diagnostics.push_back(Diagnostic { kind, message });
    }

    pub fn diagnostics(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        self.diagnostics.drain(..).collect()
    }

    /// Drop every loaded script and global
    pub fn reset(&mut self) {
        self.archives.clear();
        self.symbols.clear();
        self.diagnostics.clear();
    }
}
