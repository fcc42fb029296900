use crate::assembler::assemble;
use crate::config::VmConfig;
use crate::context::{ArchiveKind, ContextKey, HandlerDef, ScriptType};
use crate::datum::{Datum, DatumError, DatumKind};
use crate::error::{DecodeError, VmError};
use crate::host::{HeadlessSurface, ManualClock};
use crate::interpreter::HostContext;
use crate::vm::{AbortReason, DiagnosticKind, ExecState, ScriptThread, Vm};
use test_log::test;

struct Harness {
    vm: Vm,
    clock: ManualClock,
    surface: HeadlessSurface,
}

impl Harness {
    fn new(source: &str) -> Self {
        Harness::with_config(source, VmConfig::default())
    }

    fn with_config(source: &str, config: VmConfig) -> Self {
        let mut vm = Vm::new(VmConfig {
            random_seed: Some(1),
            ..config
        });
        let defs = assemble(source, ScriptType::Movie).unwrap();
        vm.archives.publish(key(1), defs);
        Harness {
            vm,
            clock: ManualClock::new(),
            surface: HeadlessSurface::new(),
        }
    }

    fn spawn(&self, name: &str, args: Vec<Datum>) -> ScriptThread {
        let (_, handler) = self.vm.archives.resolve_handler(name, 0).unwrap();
        self.vm.spawn(handler, args, 0, None)
    }

    fn run(&mut self, thread: &mut ScriptThread) -> ExecState {
        let mut surface = self.surface.clone();
        let mut host = HostContext::new(&self.clock, &mut surface);
        self.vm.execute(thread, &mut host)
    }

    /// Run a handler to its first stop and return its state and result
    fn call(&mut self, name: &str, args: Vec<Datum>) -> (ExecState, Option<Datum>) {
        let mut thread = self.spawn(name, args);
        let state = self.run(&mut thread);
        (state, thread.result.take())
    }

    fn diagnostics(&self, kind: DiagnosticKind) -> usize {
        self.vm.diagnostics().filter(|d| d.kind == kind).count()
    }
}

fn key(id: u16) -> ContextKey {
    ContextKey {
        archive: ArchiveKind::Local,
        script_type: ScriptType::Movie,
        id,
    }
}

fn runtime_error(state: &ExecState) -> Option<&VmError> {
    match state {
        ExecState::Aborted(AbortReason::Runtime(e)) => Some(e),
        _ => None,
    }
}

const SCOPES: &str = r#"
on shadow
  local x
  pushint 5
  assign x
  eval x
  print
  eval x
  return
end

on readGlobal
  eval x
  return
end

on writeGlobal
  global x
  pushint 9
  assignglobal x
end

on sloppyWrite
  pushint 11
  assign x
end

on writeUndeclared
  pushint 1
  assign nobody
  pushint 2
  assign pi
end
"#;

#[test]
fn test_local_shadows_global() {
    let mut h = Harness::new(SCOPES);
    h.vm.symbols.set_global("x", Datum::Int(1));

    assert_eq!(h.call("shadow", vec![]), (ExecState::Stopped, Some(Datum::Int(5))));
    assert_eq!(h.surface.output(), vec!["5"]);
    assert_eq!(h.vm.symbols.global("x"), Some(&Datum::Int(1)));
    assert_eq!(h.call("readGlobal", vec![]).1, Some(Datum::Int(1)));

    h.call("writeGlobal", vec![]);
    assert_eq!(h.vm.symbols.global("x"), Some(&Datum::Int(9)));
    assert_eq!(h.diagnostics(DiagnosticKind::ScopeMismatch), 0);
}

#[test]
fn test_wrong_scope_assignment_stores_and_warns() {
    let mut h = Harness::new(SCOPES);
    h.vm.symbols.set_global("x", Datum::Int(1));
    assert_eq!(h.call("sloppyWrite", vec![]).0, ExecState::Stopped);
    assert_eq!(h.vm.symbols.global("x"), Some(&Datum::Int(11)));
    assert_eq!(h.diagnostics(DiagnosticKind::ScopeMismatch), 1);
}

#[test]
fn test_assignment_never_creates_variables() {
    let mut h = Harness::new(SCOPES);
    assert_eq!(h.call("writeUndeclared", vec![]).0, ExecState::Stopped);
    assert!(h.vm.symbols.global("nobody").is_none());
    assert_eq!(h.diagnostics(DiagnosticKind::UndefinedVariable), 1);
    assert_eq!(h.diagnostics(DiagnosticKind::ReadOnlyVariable), 1);
}

#[test]
fn test_undefined_variable_reads_void() {
    let mut h = Harness::new("on f\n  eval ghost\n  return\nend");
    assert_eq!(h.call("f", vec![]), (ExecState::Stopped, Some(Datum::Void)));
    assert_eq!(h.diagnostics(DiagnosticKind::UndefinedVariable), 1);
}

#[test]
fn test_unknown_opcode_skips_declared_words() {
    // the skipped words would decode as `return` and `stop`
    let mut h = Harness::new("on f\n  raw 0x0099 82 0\n  pushint 3\n  return\nend");
    assert_eq!(h.call("f", vec![]), (ExecState::Stopped, Some(Datum::Int(3))));
    assert_eq!(h.diagnostics(DiagnosticKind::UnknownOpcode), 1);
}

#[test]
fn test_safety_valve_aborts_runaway_loop() {
    let mut h = Harness::new("on spin\ntop:\n  jump top\nend");
    let mut thread = h.spawn("spin", vec![]);
    assert_eq!(
        h.run(&mut thread),
        ExecState::Aborted(AbortReason::SafetyValve(1000))
    );
    assert_eq!(thread.dispatched, 1000);
    assert!(thread.frames.is_empty());
}

#[test]
fn test_tick_budget_yields() {
    let config = VmConfig {
        safety_valve: 0,
        tick_budget: Some(10),
        ..VmConfig::default()
    };
    let mut h = Harness::with_config("on spin\ntop:\n  jump top\nend", config);
    let mut thread = h.spawn("spin", vec![]);
    assert_eq!(h.run(&mut thread), ExecState::Yielded);
    assert_eq!(thread.dispatched, 10);
    assert_eq!(h.run(&mut thread), ExecState::Yielded);
    assert_eq!(thread.dispatched, 20);
}

#[test]
fn test_delay_gates_resumption() {
    let source = "on pause\n  pushint 1\n  print\n  pushint 100\n  delay\n  pushint 2\n  print\nend";
    let mut h = Harness::new(source);
    let mut thread = h.spawn("pause", vec![]);

    assert_eq!(h.run(&mut thread), ExecState::Yielded);
    assert_eq!(thread.resume_at, Some(100));
    let dispatched = thread.dispatched;

    h.clock.set(50);
    assert_eq!(h.run(&mut thread), ExecState::Yielded);
    assert_eq!(thread.dispatched, dispatched);
    assert_eq!(h.surface.output(), vec!["1"]);

    h.clock.set(100);
    assert_eq!(h.run(&mut thread), ExecState::Stopped);
    assert_eq!(h.surface.output(), vec!["1", "2"]);
}

#[test]
fn test_wait_yields_one_tick() {
    let mut h = Harness::new("on f\n  wait\n  pushint 4\n  return\nend");
    let mut thread = h.spawn("f", vec![]);
    assert_eq!(h.run(&mut thread), ExecState::Yielded);
    assert_eq!(h.run(&mut thread), ExecState::Stopped);
    assert_eq!(thread.result, Some(Datum::Int(4)));
}

const CALLS: &str = r#"
on fact n
  eval n
  pushint 1
  le
  jumpifnot recurse
  pushint 1
  return
recurse:
  eval n
  eval n
  pushint 1
  sub
  call fact 1
  mul
  return
end

on leavesJunk
  pushint 7
  pushint 8
end

on balanced
  pushint 1
  pushint 2
  call leavesJunk 0
  pop
  add
  return
end

on useBuiltin
  pushint -4
  call abs 1
  return
end

on missing
  call nowhere 0
  return
end

on firstArg a, b
  eval b
  return
end
"#;

#[test]
fn test_recursive_calls() {
    let mut h = Harness::new(CALLS);
    assert_eq!(
        h.call("fact", vec![Datum::Int(5)]),
        (ExecState::Stopped, Some(Datum::Int(120)))
    );
}

#[test]
fn test_every_call_pushes_one_result() {
    let mut h = Harness::new(CALLS);
    assert_eq!(h.call("balanced", vec![]).1, Some(Datum::Int(3)));
    assert_eq!(h.call("useBuiltin", vec![]).1, Some(Datum::Int(4)));
    assert_eq!(h.call("missing", vec![]).1, Some(Datum::Void));
    assert_eq!(h.diagnostics(DiagnosticKind::UndefinedHandler), 1);
    // missing arguments read as Void
    assert_eq!(h.call("firstArg", vec![Datum::Int(1)]).1, Some(Datum::Void));
}

#[test]
fn test_call_depth_limit() {
    let config = VmConfig {
        max_call_depth: 8,
        ..VmConfig::default()
    };
    let mut h = Harness::with_config(CALLS, config);
    let (state, _) = h.call("fact", vec![Datum::Int(20)]);
    assert_eq!(runtime_error(&state), Some(&VmError::CallDepthExceeded(8)));
}

#[test]
fn test_method_call_binds_me() {
    let source = r#"
on hurt amount
  eval hp
  eval amount
  sub
  assign hp
  eval me
  return
end

on make
  local m
  pushsym hp
  pushint 10
  proplist 1
  new Monster
  assign m
  eval m
  pushint 3
  callmethod hurt 2
  pop
  eval m
  pushsym hp
  getat
  return
end
"#;
    let mut h = Harness::new(source);
    assert_eq!(h.call("make", vec![]), (ExecState::Stopped, Some(Datum::Int(7))));
}

#[test]
fn test_lists_alias() {
    let source = r#"
on f
  local a, b
  pushint 1
  pushint 2
  list 2
  assign a
  eval a
  assign b
  eval b
  pushint 3
  pushstr "three"
  setat
  eval a
  return
end
"#;
    let mut h = Harness::new(source);
    let (_, result) = h.call("f", vec![]);
    let result = result.unwrap();
    assert_eq!(result.to_string(), "[1, 2, \"three\"]");
}

#[test]
fn test_comparisons() {
    let source = r#"
on eqCase
  pushstr "ABC"
  pushstr "abc"
  eq
  return
end

on ltCase
  pushstr "ABC"
  pushstr "abc"
  lt
  return
end

on mixed
  pushfloat 2.5
  pushint 2
  gt
  return
end
"#;
    let mut h = Harness::new(source);
    assert_eq!(h.call("eqCase", vec![]).1, Some(Datum::Int(1)));
    assert_eq!(h.call("ltCase", vec![]).1, Some(Datum::Int(1)));
    assert_eq!(h.call("mixed", vec![]).1, Some(Datum::Int(1)));
}

#[test]
fn test_type_errors_abort() {
    let source = r#"
on addSymbol
  pushsym a
  pushint 1
  add
end

on compareList
  pushint 0
  list 0
  pushint 1
  lt
end

on divide
  pushint 1
  pushint 0
  div
end
"#;
    let mut h = Harness::new(source);
    let (state, _) = h.call("addSymbol", vec![]);
    assert_eq!(
        runtime_error(&state),
        Some(&VmError::Type(DatumError::NotNumeric(DatumKind::Symbol)))
    );
    let (state, _) = h.call("compareList", vec![]);
    assert!(matches!(
        runtime_error(&state),
        Some(VmError::Type(DatumError::Incomparable(_, _)))
    ));
    let (state, _) = h.call("divide", vec![]);
    assert_eq!(runtime_error(&state), Some(&VmError::DivisionByZero));
}

#[test]
fn test_decode_error_aborts_only_its_thread() {
    let mut h = Harness::new("on fine\n  pushint 1\n  return\nend");
    h.vm.archives.publish(
        key(2),
        vec![HandlerDef {
            name: "broken".into(),
            code: vec![0x0001_0003],
            ..HandlerDef::default()
        }],
    );
    let mut broken = h.spawn("broken", vec![]);
    let mut fine = h.spawn("fine", vec![]);
    assert!(matches!(
        h.run(&mut broken),
        ExecState::Aborted(AbortReason::Decode(DecodeError::Truncated { .. }))
    ));
    assert_eq!(h.run(&mut fine), ExecState::Stopped);
    assert_eq!(fine.result, Some(Datum::Int(1)));
}

#[test]
fn test_external_abort() {
    let mut h = Harness::new("on f\n  pushint 1\n  return\nend");
    let mut thread = h.spawn("f", vec![]);
    thread.abort_handle().request();
    assert_eq!(h.run(&mut thread), ExecState::Aborted(AbortReason::External));
    assert_eq!(thread.result, None);
    // finished threads stay finished
    assert_eq!(h.run(&mut thread), ExecState::Aborted(AbortReason::External));
}

#[test]
fn test_stack_limit() {
    let config = VmConfig {
        max_stack: 4,
        ..VmConfig::default()
    };
    let source = "on f\n  pushint 1\n  pushint 2\n  pushint 3\n  pushint 4\n  pushint 5\nend";
    let mut h = Harness::with_config(source, config);
    let (state, _) = h.call("f", vec![]);
    assert_eq!(runtime_error(&state), Some(&VmError::StackOverflow(4)));
}

#[test]
fn test_host_calls_reach_surface() {
    let source = "on f\n  pushint 10\n  pushint 20\n  host 40960 2\n  return\nend";
    let mut h = Harness::new(source);
    assert_eq!(h.call("f", vec![]).1, Some(Datum::Void));
    let calls = h.surface.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].op, 0xA000);
    assert_eq!(calls[0].args, vec![Datum::Int(10), Datum::Int(20)]);
}

#[test]
fn test_random_is_seeded() {
    let source = "on roll\n  pushint 6\n  call random 1\n  return\nend";
    let mut a = Harness::new(source);
    let mut b = Harness::new(source);
    for _ in 0..5 {
        let x = a.call("roll", vec![]).1.unwrap();
        assert_eq!(Some(x.clone()), b.call("roll", vec![]).1);
        assert!((1..=6).contains(&x.as_int()));
    }
}
