//! Dispatch loop
//!
//! `Vm::execute` runs one script thread until it yields, stops or aborts.
//! Each iteration checks the abort flag and the instruction limits, decodes
//! one instruction at the current frame's pc, advances the pc past it and
//! dispatches on the opcode.

use crate::builtins::{self, BuiltinContext};
use crate::datum::{Datum, DatumKind};
use crate::error::{DecodeError, VmError};
use crate::host::{Clock, Surface};
use crate::instruction::{Instruction, Opcode};
use crate::opcodes::Op;
use crate::symbol::{AssignOutcome, Scopes};
use crate::vm::{AbortReason, Callable, DiagnosticKind, ExecState, Frame, ScriptThread, Vm};
use indexmap::IndexMap;
use log::{debug, error};
use std::cmp::Ordering;

/// Outcome of a single instruction
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    /// Continue with the next instruction
    Continue,
    /// Jump taken, pc already updated
    Branched,
    /// Handler called, a new frame is on top
    Called,
    /// Frame returned to its caller
    Returned,
    /// Suspend until the next tick (or the resume time)
    Yielded,
    /// Script finished
    Stopped,
}

/// The host services one `execute` call may use
pub struct HostContext<'a> {
    pub clock: &'a dyn Clock,
    pub surface: &'a mut dyn Surface,
}

impl<'a> HostContext<'a> {
    pub fn new(clock: &'a dyn Clock, surface: &'a mut dyn Surface) -> Self {
        HostContext { clock, surface }
    }
}

fn missing_operand(inst: &Instruction) -> VmError {
    VmError::Decode(DecodeError::OperandCountMismatch {
        offset: inst.offset,
        opcode: inst.opcode.code(),
        declared: inst.operands.len(),
        expected: inst.operands.len() + 1,
    })
}

impl Vm {
    /// Run `thread` until it yields, stops or aborts, and return its state.
    ///
    /// A thread delayed past the current clock time stays Yielded without
    /// dispatching anything.
    pub fn execute(&mut self, thread: &mut ScriptThread, host: &mut HostContext) -> ExecState {
        if thread.state.is_finished() {
            return thread.state.clone();
        }
        if thread.abort_requested() {
            return self.abort(thread, AbortReason::External);
        }
        if let Some(at) = thread.resume_at {
            if host.clock.now_ms() < at {
                thread.state = ExecState::Yielded;
                return thread.state.clone();
            }
            thread.resume_at = None;
        }

        thread.state = ExecState::Running;
        let valve = self.config.safety_valve;
        let budget = self.config.tick_budget;
        let mut dispatched: u32 = 0;

        loop {
            if thread.abort_requested() {
                return self.abort(thread, AbortReason::External);
            }
            if thread.frames.is_empty() {
                thread.state = ExecState::Stopped;
                break;
            }
            if valve != 0 && dispatched >= valve {
                return self.abort(thread, AbortReason::SafetyValve(dispatched));
            }
            if budget.is_some_and(|b| dispatched >= b) {
                debug!("{} used its budget of {} instructions", thread.name(), dispatched);
                thread.state = ExecState::Yielded;
                break;
            }

            let result = self.step(thread, host);
            dispatched += 1;
            thread.dispatched += 1;
            match result {
                Ok(ExecutionResult::Yielded) => {
                    thread.state = ExecState::Yielded;
                    break;
                }
                Ok(ExecutionResult::Stopped) => {
                    thread.frames.clear();
                    thread.stack.clear();
                    thread.state = ExecState::Stopped;
                    break;
                }
                Ok(_) => {}
                Err(VmError::Decode(e)) => return self.abort(thread, AbortReason::Decode(e)),
                Err(e) => return self.abort(thread, AbortReason::Runtime(e)),
            }
        }
        thread.state.clone()
    }

    fn abort(&mut self, thread: &mut ScriptThread, reason: AbortReason) -> ExecState {
        let at = thread
            .current_frame()
            .map(|f| format!("{}@{}", f.handler.name, f.pc))
            .unwrap_or_default();
        error!("Script {} aborted at {}: {}", thread.name(), at, reason);
        thread.frames.clear();
        thread.stack.clear();
        thread.resume_at = None;
        thread.state = ExecState::Aborted(reason);
        thread.state.clone()
    }

    /// Decode and execute one instruction
    pub fn step(
        &mut self,
        thread: &mut ScriptThread,
        host: &mut HostContext,
    ) -> Result<ExecutionResult, VmError> {
        let (handler, pc) = match thread.frames.last() {
            Some(frame) => (frame.handler.clone(), frame.pc),
            None => return Ok(ExecutionResult::Stopped),
        };
        if pc >= handler.code.len() {
            // running off the end is an implicit return
            return self.do_return(thread, Datum::Void);
        }

        let inst = Instruction::decode(&handler.code, pc)?;
        if let Some(frame) = thread.frames.last_mut() {
            frame.pc = pc + inst.size;
        }
        debug!("{}@{:04}: {}", handler.name, pc, inst);

        match inst.opcode {
            Opcode::Unknown(code) => {
                self.report(
                    DiagnosticKind::UnknownOpcode,
                    format!(
                        "Unknown opcode {:#06x} at {}@{}, skipped {} words",
                        code,
                        handler.name,
                        pc,
                        inst.size - 1
                    ),
                );
                Ok(ExecutionResult::Continue)
            }
            Opcode::Known(op) => self.dispatch(op, &inst, thread, host),
        }
    }

    fn dispatch(
        &mut self,
        op: Op,
        inst: &Instruction,
        thread: &mut ScriptThread,
        host: &mut HostContext,
    ) -> Result<ExecutionResult, VmError> {
        let name = || inst.str_at(0).ok_or_else(|| missing_operand(inst));
        let int = |i: usize| inst.int_at(i).ok_or_else(|| missing_operand(inst));
        let precision = self.config.float_precision;

        match op {
            Op::Stop => return Ok(ExecutionResult::Stopped),
            Op::Nop => {}
            Op::PushVoid => thread.push(Datum::Void)?,
            Op::PushInt => thread.push(Datum::Int(int(0)?))?,
            Op::PushFloat => {
                let f = inst.float_at(0).ok_or_else(|| missing_operand(inst))?;
                thread.push(Datum::Float(f))?
            }
            Op::PushString => thread.push(Datum::string(name()?))?,
            Op::PushSymbol => thread.push(Datum::symbol(name()?))?,
            Op::PushVarRef => thread.push(Datum::var_ref(name()?))?,
            Op::PushCastRef => thread.push(Datum::CastRef(int(0)? as u32))?,
            Op::Pop => {
                thread.pop()?;
            }
            Op::Dup => {
                let top = thread.peek()?.clone();
                thread.push(top)?
            }

            Op::EvalVar => {
                let var = name()?;
                let resolved = {
                    let frame = thread.frames.last_mut();
                    let (locals, me) = frame_scopes(frame);
                    let scopes = Scopes::new(locals, me);
                    self.symbols.fetch(var, false, &scopes)
                };
                let value = match resolved {
                    Some(r) => r.value,
                    None => {
                        self.report(
                            DiagnosticKind::UndefinedVariable,
                            format!("Variable {} not defined", var),
                        );
                        Datum::Void
                    }
                };
                thread.push(value)?
            }
            Op::Assign | Op::AssignGlobal => {
                let var = name()?;
                let value = thread.pop()?;
                let declared_global = op == Op::AssignGlobal;
                let outcome = {
                    let frame = thread.frames.last_mut();
                    let (locals, me) = frame_scopes(frame);
                    let mut scopes = Scopes::new(locals, me);
                    self.symbols.assign(var, value, declared_global, &mut scopes)
                };
                match outcome {
                    AssignOutcome::Assigned(_) => {}
                    AssignOutcome::ScopeMismatch { found, .. } => self.report(
                        DiagnosticKind::ScopeMismatch,
                        format!("{} assigned in {} scope", var, found),
                    ),
                    AssignOutcome::NotDefined => self.report(
                        DiagnosticKind::UndefinedVariable,
                        format!("Variable {} not defined", var),
                    ),
                    AssignOutcome::ReadOnly => self.report(
                        DiagnosticKind::ReadOnlyVariable,
                        format!("{} is read-only", var),
                    ),
                }
            }
            Op::DeclareGlobal => self.symbols.declare_global(name()?),
            Op::DeclareProperty => {
                let me = thread.frames.last().and_then(|f| f.me.as_ref());
                self.symbols.declare_property(me, name()?);
            }

            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod => {
                let b = thread.pop()?;
                let a = thread.pop()?;
                thread.push(arithmetic(op, &a, &b)?)?
            }
            Op::Negate => {
                let a = thread.pop()?;
                let result = match Datum::arithmetic_kind(&a, &Datum::Void)? {
                    DatumKind::Float => Datum::Float(-a.as_float()),
                    _ => Datum::Int(a.as_int().wrapping_neg()),
                };
                thread.push(result)?
            }
            Op::Concat => {
                let b = thread.pop()?;
                let a = thread.pop()?;
                let mut text = a.as_string_with_precision(precision);
                text.push_str(&b.as_string_with_precision(precision));
                thread.push(Datum::string(text))?
            }

            Op::Eq | Op::Ne => {
                let b = thread.pop()?;
                let a = thread.pop()?;
                let equal = a.loosely_equals(&b)?;
                thread.push(Datum::from(equal == (op == Op::Eq)))?
            }
            Op::Lt | Op::Gt | Op::Le | Op::Ge => {
                let b = thread.pop()?;
                let a = thread.pop()?;
                let ord = a.compare_to(&b, false)?;
                let result = match op {
                    Op::Lt => ord == Ordering::Less,
                    Op::Gt => ord == Ordering::Greater,
                    Op::Le => ord != Ordering::Greater,
                    _ => ord != Ordering::Less,
                };
                thread.push(Datum::from(result))?
            }
            Op::And | Op::Or => {
                let b = thread.pop()?.is_truthy();
                let a = thread.pop()?.is_truthy();
                let result = if op == Op::And { a && b } else { a || b };
                thread.push(Datum::from(result))?
            }
            Op::Not => {
                let a = thread.pop()?;
                thread.push(Datum::from(!a.is_truthy()))?
            }

            Op::Jump => {
                let target = inst.offset_at(0).ok_or_else(|| missing_operand(inst))?;
                jump(thread, target)?;
                return Ok(ExecutionResult::Branched);
            }
            Op::JumpIfFalse => {
                let target = inst.offset_at(0).ok_or_else(|| missing_operand(inst))?;
                if !thread.pop()?.is_truthy() {
                    jump(thread, target)?;
                    return Ok(ExecutionResult::Branched);
                }
            }

            Op::Call => {
                let argc = int(1)?.max(0) as usize;
                let args = thread.pop_n(argc)?;
                return self.call(thread, name()?, args, None, host);
            }
            Op::CallMethod => {
                let argc = int(1)?.max(0) as usize;
                let mut args = thread.pop_n(argc)?;
                let receiver = if args.is_empty() {
                    Datum::Void
                } else {
                    args.remove(0)
                };
                return match receiver {
                    Datum::Object(obj) => self.call(thread, name()?, args, Some(obj), host),
                    other => {
                        debug!("method {} on a {}, calling as a function", name()?, other.kind());
                        args.insert(0, other);
                        self.call(thread, name()?, args, None, host)
                    }
                };
            }
            Op::Return => {
                let base = thread.frames.last().map(|f| f.stack_base).unwrap_or(0);
                let value = if thread.stack.len() > base {
                    thread.pop()?
                } else {
                    Datum::Void
                };
                return self.do_return(thread, value);
            }

            Op::MakeList => {
                let n = int(0)?.max(0) as usize;
                let items = thread.pop_n(n)?;
                thread.push(Datum::list(items))?
            }
            Op::MakePropList => {
                let n = int(0)?.max(0) as usize;
                let flat = thread.pop_n(n * 2)?;
                let mut pairs = Vec::with_capacity(n);
                let mut it = flat.into_iter();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    pairs.push((k, v));
                }
                thread.push(Datum::prop_list(pairs))?
            }
            Op::GetAt => {
                let index = thread.pop()?;
                let container = thread.pop()?;
                let value = match builtins::index_get(&container, &index)? {
                    Some(v) => v,
                    None => {
                        if !matches!(container, Datum::AssocArray(_) | Datum::Object(_)) {
                            self.report(
                                DiagnosticKind::BadIndex,
                                format!("Index {} out of range for {}", index, container.kind()),
                            );
                        }
                        Datum::Void
                    }
                };
                thread.push(value)?
            }
            Op::SetAt => {
                let value = thread.pop()?;
                let index = thread.pop()?;
                let container = thread.pop()?;
                if !builtins::index_set(&container, &index, value)? {
                    self.report(
                        DiagnosticKind::BadIndex,
                        format!("Cannot store at index {} of {}", index, container.kind()),
                    );
                }
            }
            Op::NewObject => {
                let props = thread.pop()?;
                let mut properties = IndexMap::new();
                match &props {
                    Datum::AssocArray(pairs) => {
                        for (k, v) in pairs.borrow().iter() {
                            properties.insert(builtins::property_name(k), v.clone());
                        }
                    }
                    Datum::Void => {}
                    other => {
                        return Err(VmError::Type(crate::datum::DatumError::NotIndexable(
                            other.kind(),
                        )))
                    }
                }
                thread.push(Datum::object(name()?, properties))?
            }

            Op::Host => {
                let host_op = int(0)?;
                let argc = int(1)?.max(0) as usize;
                let args = thread.pop_n(argc)?;
                let value = match host.surface.call(host_op as u16, &args) {
                    Ok(v) => v,
                    Err(e) => {
                        self.report(
                            DiagnosticKind::SurfaceFailure,
                            format!("Host op {:#06x} failed: {}", host_op, e),
                        );
                        Datum::Void
                    }
                };
                thread.push(value)?
            }
            Op::Print => {
                let value = thread.pop()?;
                if let Err(e) = host.surface.print(&value.as_string_with_precision(precision)) {
                    self.report(DiagnosticKind::SurfaceFailure, format!("print failed: {}", e));
                }
            }

            Op::Delay => {
                let ms = thread.pop()?.as_int().max(0) as u64;
                let at = host.clock.now_ms() + ms;
                debug!("{} delaying {}ms until {}", thread.name(), ms, at);
                thread.resume_at = Some(at);
                return Ok(ExecutionResult::Yielded);
            }
            Op::Wait => return Ok(ExecutionResult::Yielded),
        }
        Ok(ExecutionResult::Continue)
    }

    fn call(
        &mut self,
        thread: &mut ScriptThread,
        name: &str,
        args: Vec<Datum>,
        me: Option<crate::datum::ObjectRef>,
        host: &mut HostContext,
    ) -> Result<ExecutionResult, VmError> {
        match self.resolve_callable(name, thread.entity_id) {
            Some(Callable::Script(tier, handler)) => {
                if thread.frames.len() >= self.config.max_call_depth {
                    return Err(VmError::CallDepthExceeded(self.config.max_call_depth));
                }
                debug!("call {} ({:?}) with {} args", name, tier, args.len());
                let return_pc = thread.frames.last().map(|f| f.pc).unwrap_or(0);
                let stack_base = thread.stack.len();
                thread
                    .frames
                    .push(Frame::new(handler, args, return_pc, stack_base, me));
                Ok(ExecutionResult::Called)
            }
            Some(Callable::Builtin(builtin)) => {
                let mut ctx = BuiltinContext {
                    rng: &mut self.rng,
                    clock: host.clock,
                    float_precision: self.config.float_precision,
                };
                let value = builtin.invoke(&mut ctx, &args)?;
                thread.push(value)?;
                Ok(ExecutionResult::Continue)
            }
            None => {
                self.report(
                    DiagnosticKind::UndefinedHandler,
                    format!("Handler {} not found", name),
                );
                thread.push(Datum::Void)?;
                Ok(ExecutionResult::Continue)
            }
        }
    }

    fn do_return(
        &mut self,
        thread: &mut ScriptThread,
        value: Datum,
    ) -> Result<ExecutionResult, VmError> {
        let frame = match thread.frames.pop() {
            Some(frame) => frame,
            None => return Ok(ExecutionResult::Stopped),
        };
        thread.stack.truncate(frame.stack_base);
        if thread.frames.is_empty() {
            debug!("{} returned {}", frame.handler.name, value);
            thread.result = Some(value);
            return Ok(ExecutionResult::Stopped);
        }
        thread.push(value)?;
        Ok(ExecutionResult::Returned)
    }
}

fn frame_scopes(
    frame: Option<&mut Frame>,
) -> (Option<&mut IndexMap<String, Datum>>, Option<&crate::datum::ObjectRef>) {
    match frame {
        Some(frame) => (Some(&mut frame.locals), frame.me.as_ref()),
        None => (None, None),
    }
}

fn jump(thread: &mut ScriptThread, target: usize) -> Result<(), VmError> {
    let frame = thread.frames.last_mut().ok_or(VmError::StackUnderflow {
        needed: 1,
        available: 0,
    })?;
    let len = frame.handler.code.len();
    if target > len {
        return Err(VmError::BadJump { target, len });
    }
    frame.pc = target;
    Ok(())
}

fn arithmetic(op: Op, a: &Datum, b: &Datum) -> Result<Datum, VmError> {
    match Datum::arithmetic_kind(a, b)? {
        DatumKind::Float => {
            let (x, y) = (a.as_float(), b.as_float());
            Ok(Datum::Float(match op {
                Op::Add => x + y,
                Op::Sub => x - y,
                Op::Mul => x * y,
                Op::Div | Op::Mod if y == 0.0 => return Err(VmError::DivisionByZero),
                Op::Div => x / y,
                _ => x % y,
            }))
        }
        _ => {
            let (x, y) = (a.as_int(), b.as_int());
            Ok(Datum::Int(match op {
                Op::Add => x.wrapping_add(y),
                Op::Sub => x.wrapping_sub(y),
                Op::Mul => x.wrapping_mul(y),
                Op::Div | Op::Mod if y == 0 => return Err(VmError::DivisionByZero),
                Op::Div => x.wrapping_div(y),
                _ => x.wrapping_rem(y),
            }))
        }
    }
}
