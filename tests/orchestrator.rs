//! End-to-end runs through the orchestrator
//!
//! Scripts are loaded from resources, run on channels, resumed by ticks and
//! share a frame with sequences drawing through the same surface.

use retrovm::config::VmConfig;
use retrovm::context::{ArchiveKind, EventType, ScriptType};
use retrovm::datum::Datum;
use retrovm::host::{HeadlessSurface, ManualClock};
use retrovm::orchestrator::Orchestrator;
use retrovm::resources::MemoryResources;
use retrovm::sequence::{SequenceScript, ADD_SCENE, END, PLAY_SCENE};
use retrovm::track::{DRAW_PIXEL, SET_DELAY};
use retrovm::unit::to_bytes;
use retrovm::vm::{AbortReason, ExecState};
use test_log::test;

const TICKER: &str = r#"
on startMovie
  local i
  pushint 0
  assign i
top:
  eval i
  pushint 3
  lt
  jumpifnot done
  pushstr "tick"
  eval i
  concat
  print
  pushint 100
  delay
  eval i
  pushint 1
  add
  assign i
  jump top
done:
  pushstr "done"
  print
end
"#;

const TOCKER: &str = r#"
on startMovie
  pushstr "tock"
  print
  pushint 150
  delay
  pushstr "tock again"
  print
end
"#;

fn words(ws: &[u16]) -> Vec<u8> {
    ws.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn setup(resources: MemoryResources) -> (Orchestrator, ManualClock, HeadlessSurface) {
    let clock = ManualClock::new();
    let surface = HeadlessSurface::new();
    let orchestrator = Orchestrator::new(
        VmConfig::default(),
        Box::new(resources),
        Box::new(clock.clone()),
        Box::new(surface.clone()),
    );
    (orchestrator, clock, surface)
}

/// Advance the clock by `ms` per frame until nothing is left to run
fn run_until_idle(orchestrator: &mut Orchestrator, clock: &ManualClock, ms: u64) -> u64 {
    while !orchestrator.is_idle() {
        clock.advance(ms);
        orchestrator.tick();
        assert!(orchestrator.frame() < 1000, "never went idle");
    }
    orchestrator.frame()
}

#[test]
fn test_channels_interleave_on_the_clock() {
    let (mut orch, clock, surface) = setup(MemoryResources::new());
    orch.load(ArchiveKind::Local, ScriptType::Score, 1, TICKER).unwrap();
    orch.load(ArchiveKind::Local, ScriptType::Score, 2, TOCKER).unwrap();

    let a = orch.run_script(ScriptType::Score, 1, 0).unwrap();
    let b = orch.run_script(ScriptType::Score, 2, 0).unwrap();
    assert_eq!(a.channel, Some(0));
    assert_eq!(b.channel, Some(1));
    assert_eq!(orch.active_channels(), vec![0, 1]);

    run_until_idle(&mut orch, &clock, 50);
    assert_eq!(
        surface.output(),
        vec!["tick0", "tock", "tick1", "tock again", "tick2", "done"]
    );
}

#[test]
fn test_scripts_load_from_resources() {
    let compiled = retrovm::assembler::assemble(
        "on mouseUp\n  pushstr \"clicked\"\n  print\nend",
        ScriptType::Cast,
    )
    .unwrap();
    let resources = MemoryResources::new()
        .with("BUTTON.RVM", to_bytes(&compiled))
        .with("MOVIE.LS", "on mouseDown\n  pushstr \"movie\"\n  print\nend");
    let (mut orch, _clock, surface) = setup(resources);

    orch.load_resource(ArchiveKind::Local, ScriptType::Cast, 5, "BUTTON.RVM")
        .unwrap();
    orch.load_resource(ArchiveKind::Shared, ScriptType::Movie, 1, "MOVIE.LS")
        .unwrap();
    assert!(orch
        .load_resource(ArchiveKind::Local, ScriptType::Cast, 6, "MISSING.RVM")
        .is_err());

    orch.run_handler(ScriptType::Cast, 5, EventType::MouseUp, vec![])
        .unwrap()
        .unwrap();
    orch.run_handler(ScriptType::Cast, 5, EventType::MouseDown, vec![])
        .unwrap()
        .unwrap();
    assert!(orch
        .run_handler(ScriptType::Cast, 5, EventType::Idle, vec![])
        .unwrap()
        .is_none());
    assert_eq!(surface.output(), vec!["clicked", "movie"]);
}

#[test]
fn test_sequence_and_script_share_frames() {
    let ads = SequenceScript {
        names: vec!["WAVE.TTM".to_string()],
        script: words(&[ADD_SCENE, 1, 1, 0, 0, PLAY_SCENE, END]),
    };
    let resources = MemoryResources::new()
        .with("INTRO.ADS", ads.to_bytes())
        .with(
            "WAVE.TTM",
            words(&[DRAW_PIXEL | 2, 1, 1, SET_DELAY | 1, 5, DRAW_PIXEL | 2, 2, 2]),
        );
    let (mut orch, clock, surface) = setup(resources);
    orch.load(ArchiveKind::Local, ScriptType::Score, 1, TOCKER).unwrap();

    orch.start_sequence("INTRO.ADS").unwrap();
    orch.run_script(ScriptType::Score, 1, 0).unwrap();

    let report = orch.tick();
    assert_eq!(report.resumed, vec![0]);
    assert_eq!(report.sequences_stepped, 1);

    let frames = run_until_idle(&mut orch, &clock, 25);
    assert!(frames > 3);
    assert_eq!(surface.ops(), vec![DRAW_PIXEL, DRAW_PIXEL]);
    assert_eq!(
        surface.calls()[1].args,
        vec![Datum::Int(2), Datum::Int(2)]
    );
    assert_eq!(surface.output(), vec!["tock", "tock again"]);
}

#[test]
fn test_failures_stay_on_their_channel() {
    let (mut orch, clock, surface) = setup(MemoryResources::new());
    orch.load(
        ArchiveKind::Local,
        ScriptType::Score,
        1,
        "on startMovie\n  pushint 10\n  delay\n  pushint 1\n  pushint 0\n  div\nend",
    )
    .unwrap();
    orch.load(ArchiveKind::Local, ScriptType::Score, 2, TOCKER).unwrap();
    orch.run_script(ScriptType::Score, 1, 0).unwrap();
    orch.run_script(ScriptType::Score, 2, 0).unwrap();

    clock.advance(20);
    let report = orch.tick();
    assert_eq!(
        report.finished,
        vec![(
            0,
            ExecState::Aborted(AbortReason::Runtime(retrovm::error::VmError::DivisionByZero))
        )]
    );
    assert_eq!(orch.active_channels(), vec![1]);

    run_until_idle(&mut orch, &clock, 50);
    assert_eq!(surface.output(), vec!["tock", "tock again"]);
}

#[test]
fn test_stop_all_aborts_parked_threads() {
    let (mut orch, _clock, _surface) = setup(MemoryResources::new());
    orch.load(ArchiveKind::Local, ScriptType::Score, 1, TICKER).unwrap();
    orch.run_script(ScriptType::Score, 1, 0).unwrap();
    orch.run_script(ScriptType::Score, 1, 0).unwrap();
    assert_eq!(orch.active_channels().len(), 2);

    orch.stop_all();
    assert!(orch.is_idle());
    // nothing left to resume
    assert!(orch.tick().resumed.is_empty());
}
