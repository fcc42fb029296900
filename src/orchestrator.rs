//! Frame-driven scheduling of script threads and sequences
//!
//! The host calls `tick` once per frame. Each tick resumes every parked
//! script thread in channel order, then advances every active sequence by
//! one step. Discrete events (`run_handler`) and direct runs (`run_script`)
//! execute immediately and park on a channel only if they yield.

use crate::builtins::BuiltinContext;
use crate::config::VmConfig;
use crate::context::{
    ArchiveKind, ContextKey, EventType, Handler, HandlerDef, ScriptContext, ScriptType,
};
use crate::datum::Datum;
use crate::error::OrchestratorError;
use crate::host::{Clock, Surface};
use crate::interpreter::HostContext;
use crate::resources::ResourceProvider;
use crate::sequence::{Sequence, SequenceStatus};
use crate::unit;
use crate::vm::{AbortHandle, AbortReason, Callable, ExecState, ScriptThread, Vm};
use log::{debug, error, info, warn};
use std::rc::Rc;

pub type ChannelId = usize;

/// Outcome of an immediate run
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Channel the thread was parked on, if it yielded
    pub channel: Option<ChannelId>,
    pub state: ExecState,
    pub result: Option<Datum>,
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub frame: u64,
    /// Channels whose thread was resumed
    pub resumed: Vec<ChannelId>,
    /// Channels whose thread finished this tick, with its final state
    pub finished: Vec<(ChannelId, ExecState)>,
    /// Sequences that advanced
    pub sequences_stepped: usize,
    /// Sequences that ended or failed this tick
    pub sequences_finished: Vec<String>,
}

pub struct Orchestrator {
    vm: Vm,
    resources: Box<dyn ResourceProvider>,
    clock: Box<dyn Clock>,
    surface: Box<dyn Surface>,
    channels: Vec<Option<ScriptThread>>,
    sequences: Vec<Sequence>,
    frame: u64,
}

impl Orchestrator {
    pub fn new(
        config: VmConfig,
        resources: Box<dyn ResourceProvider>,
        clock: Box<dyn Clock>,
        surface: Box<dyn Surface>,
    ) -> Self {
        Orchestrator {
            vm: Vm::new(config),
            resources,
            clock,
            surface,
            channels: Vec::new(),
            sequences: Vec::new(),
            frame: 0,
        }
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Assemble `source` and publish it as script `id`
    pub fn load(
        &mut self,
        archive: ArchiveKind,
        script_type: ScriptType,
        id: u16,
        source: &str,
    ) -> Result<Rc<ScriptContext>, OrchestratorError> {
        let defs = unit::load_unit(source.as_bytes(), script_type)?;
        Ok(self.publish(archive, script_type, id, defs))
    }

    /// Load script `id` from a resource, compiled or source
    pub fn load_resource(
        &mut self,
        archive: ArchiveKind,
        script_type: ScriptType,
        id: u16,
        name: &str,
    ) -> Result<Rc<ScriptContext>, OrchestratorError> {
        let data = self.resources.open(name)?;
        let defs = unit::load_unit(&data, script_type)?;
        Ok(self.publish(archive, script_type, id, defs))
    }

    /// Publish already compiled handlers
    pub fn publish(
        &mut self,
        archive: ArchiveKind,
        script_type: ScriptType,
        id: u16,
        defs: Vec<HandlerDef>,
    ) -> Rc<ScriptContext> {
        let key = ContextKey {
            archive,
            script_type,
            id,
        };
        self.vm.archives.publish(key, defs)
    }

    /// Run handler `entry` of a loaded script on the first free channel
    pub fn run_script(
        &mut self,
        script_type: ScriptType,
        id: u16,
        entry: usize,
    ) -> Result<RunReport, OrchestratorError> {
        let channel = self.free_channel();
        self.run_script_on(channel, script_type, id, entry)
    }

    /// Run handler `entry` of a loaded script, parking it on `channel` if it
    /// yields. A thread still parked there is dropped.
    pub fn run_script_on(
        &mut self,
        channel: ChannelId,
        script_type: ScriptType,
        id: u16,
        entry: usize,
    ) -> Result<RunReport, OrchestratorError> {
        let context = self
            .vm
            .archives
            .context(script_type, id)
            .ok_or(OrchestratorError::UnknownScript(script_type, id))?;
        let handler = context
            .entry(entry)
            .cloned()
            .ok_or(OrchestratorError::UnknownEntry(script_type, id, entry))?;

        if let Some(old) = self.channels.get_mut(channel).and_then(|c| c.take()) {
            warn!(
                "Channel {} still running {}, replacing it",
                channel,
                old.name()
            );
        }
        let thread = self.vm.spawn(handler, Vec::new(), id, None);
        Ok(self.run_thread(thread, Some(channel)))
    }

    /// Deliver an event to script `id`: its own handler for the event, then
    /// the usual handler tiers with `id` as the entity, then movie scripts.
    /// An event nobody handles is logged and returns `None`.
    pub fn run_handler(
        &mut self,
        script_type: ScriptType,
        id: u16,
        event: EventType,
        args: Vec<Datum>,
    ) -> Result<Option<RunReport>, OrchestratorError> {
        let name = event.handler_name();
        let own = self
            .vm
            .archives
            .context(script_type, id)
            .and_then(|c| c.handler(name).cloned());
        let handler = match own {
            Some(h) => h,
            None => match self.vm.archives.resolve_handler(name, id) {
                Some((tier, h)) => {
                    debug!("{} for {} {} resolved as {:?}", name, script_type, id, tier);
                    h
                }
                None => match self.movie_handler(name) {
                    Some(h) => h,
                    None => {
                        debug!("No {} handler for {} {}", name, script_type, id);
                        return Ok(None);
                    }
                },
            },
        };
        let thread = self.vm.spawn(handler, args, id, None);
        Ok(Some(self.run_thread(thread, None)))
    }

    /// Call a handler or builtin by name
    pub fn call_handler(
        &mut self,
        name: &str,
        args: Vec<Datum>,
    ) -> Result<Option<RunReport>, OrchestratorError> {
        match self.vm.resolve_callable(name, 0) {
            Some(Callable::Script(_, handler)) => {
                let thread = self.vm.spawn(handler, args, 0, None);
                Ok(Some(self.run_thread(thread, None)))
            }
            Some(Callable::Builtin(builtin)) => {
                let mut ctx = BuiltinContext {
                    rng: &mut self.vm.rng,
                    clock: &*self.clock,
                    float_precision: self.vm.config.float_precision,
                };
                let (state, result) = match builtin.invoke(&mut ctx, &args) {
                    Ok(value) => (ExecState::Stopped, Some(value)),
                    Err(e) => {
                        error!("Builtin {} failed: {}", name, e);
                        (ExecState::Aborted(AbortReason::Runtime(e)), None)
                    }
                };
                Ok(Some(RunReport {
                    channel: None,
                    state,
                    result,
                }))
            }
            None => {
                warn!("Handler {} not found", name);
                Ok(None)
            }
        }
    }

    /// First movie script handler named `name`, local archive first
    fn movie_handler(&self, name: &str) -> Option<Rc<Handler>> {
        [ArchiveKind::Local, ArchiveKind::Shared]
            .iter()
            .flat_map(|&kind| self.vm.archives.archive(kind).contexts())
            .filter(|c| c.key.script_type == ScriptType::Movie)
            .find_map(|c| c.handler(name).cloned())
    }

    fn free_channel(&self) -> ChannelId {
        self.channels
            .iter()
            .position(|c| c.is_none())
            .unwrap_or(self.channels.len())
    }

    /// Execute a fresh thread, parking it if it yields
    fn run_thread(&mut self, mut thread: ScriptThread, channel: Option<ChannelId>) -> RunReport {
        let state = {
            let mut host = HostContext::new(&*self.clock, &mut *self.surface);
            self.vm.execute(&mut thread, &mut host)
        };
        if state != ExecState::Yielded {
            return RunReport {
                channel: None,
                state,
                result: thread.result.take(),
            };
        }
        let channel = channel.unwrap_or_else(|| self.free_channel());
        if self.channels.len() <= channel {
            self.channels.resize_with(channel + 1, || None);
        }
        debug!("{} parked on channel {}", thread.name(), channel);
        self.channels[channel] = Some(thread);
        RunReport {
            channel: Some(channel),
            state,
            result: None,
        }
    }

    /// Open a sequence resource and start running it on the next tick
    pub fn start_sequence(&mut self, name: &str) -> Result<(), OrchestratorError> {
        let sequence = Sequence::load(name, &*self.resources, self.vm.config.detail)?;
        self.sequences.push(sequence);
        Ok(())
    }

    /// Advance everything by one frame
    pub fn tick(&mut self) -> TickReport {
        self.frame += 1;
        let mut report = TickReport {
            frame: self.frame,
            ..TickReport::default()
        };

        let mut host = HostContext::new(&*self.clock, &mut *self.surface);
        for (channel, slot) in self.channels.iter_mut().enumerate() {
            let Some(thread) = slot else {
                continue;
            };
            report.resumed.push(channel);
            let state = self.vm.execute(thread, &mut host);
            if state.is_finished() {
                debug!("Channel {} finished: {:?}", channel, state);
                *slot = None;
                report.finished.push((channel, state));
            }
        }

        let resources = &*self.resources;
        self.sequences.retain_mut(|sequence| {
            report.sequences_stepped += 1;
            match sequence.step(resources, &mut host) {
                Ok(SequenceStatus::Finished) => {
                    info!("Sequence {} finished", sequence.name());
                    report.sequences_finished.push(sequence.name().to_string());
                    false
                }
                Ok(_) => true,
                Err(e) => {
                    error!("Sequence {} aborted: {}", sequence.name(), e);
                    report.sequences_finished.push(sequence.name().to_string());
                    false
                }
            }
        });
        report
    }

    pub fn channel(&self, channel: ChannelId) -> Option<&ScriptThread> {
        self.channels.get(channel).and_then(|c| c.as_ref())
    }

    /// Channels with a parked thread
    pub fn active_channels(&self) -> Vec<ChannelId> {
        self.channels
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|_| i))
            .collect()
    }

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    /// True when nothing is left to tick
    pub fn is_idle(&self) -> bool {
        self.channels.iter().all(|c| c.is_none()) && self.sequences.is_empty()
    }

    /// Flag for aborting the thread on `channel`, usable from another thread
    pub fn abort_handle(&self, channel: ChannelId) -> Option<AbortHandle> {
        self.channel(channel).map(|t| t.abort_handle())
    }

    /// Abort the thread on `channel` and free the channel
    pub fn abort_channel(&mut self, channel: ChannelId) -> Result<ExecState, OrchestratorError> {
        let mut thread = self
            .channels
            .get_mut(channel)
            .and_then(|c| c.take())
            .ok_or(OrchestratorError::UnknownChannel(channel))?;
        thread.abort_handle().request();
        let mut host = HostContext::new(&*self.clock, &mut *self.surface);
        Ok(self.vm.execute(&mut thread, &mut host))
    }

    /// Abort every parked thread and drop every sequence
    pub fn stop_all(&mut self) {
        for channel in 0..self.channels.len() {
            if self.channels[channel].is_some() {
                if let Err(e) = self.abort_channel(channel) {
                    warn!("{}", e);
                }
            }
        }
        self.channels.clear();
        self.sequences.clear();
    }

    /// Stop everything and drop every loaded script and global
    pub fn reset(&mut self) {
        info!("Resetting orchestrator");
        self.stop_all();
        self.vm.reset();
        self.frame = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HeadlessSurface, ManualClock};
    use crate::resources::MemoryResources;
    use test_log::test;

    fn orchestrator(resources: MemoryResources) -> (Orchestrator, ManualClock, HeadlessSurface) {
        let clock = ManualClock::new();
        let surface = HeadlessSurface::new();
        let config = VmConfig {
            random_seed: Some(7),
            ..VmConfig::default()
        };
        let orch = Orchestrator::new(
            config,
            Box::new(resources),
            Box::new(clock.clone()),
            Box::new(surface.clone()),
        );
        (orch, clock, surface)
    }

    #[test]
    fn test_run_script_to_completion() {
        let (mut orch, _, surface) = orchestrator(MemoryResources::new());
        orch.load(
            ArchiveKind::Local,
            ScriptType::Score,
            1,
            "pushstr \"frame\"\nprint\npushint 4\nreturn\n",
        )
        .unwrap();
        let report = orch.run_script(ScriptType::Score, 1, 0).unwrap();
        assert_eq!(report.state, ExecState::Stopped);
        assert_eq!(report.result, Some(Datum::Int(4)));
        assert_eq!(report.channel, None);
        assert_eq!(surface.output(), vec!["frame"]);
        assert!(orch.is_idle());
    }

    #[test]
    fn test_unknown_script_and_entry() {
        let (mut orch, _, _) = orchestrator(MemoryResources::new());
        assert_eq!(
            orch.run_script(ScriptType::Movie, 3, 0),
            Err(OrchestratorError::UnknownScript(ScriptType::Movie, 3))
        );
        orch.load(ArchiveKind::Local, ScriptType::Movie, 3, "nop").unwrap();
        assert_eq!(
            orch.run_script(ScriptType::Movie, 3, 2),
            Err(OrchestratorError::UnknownEntry(ScriptType::Movie, 3, 2))
        );
    }

    #[test]
    fn test_load_error_publishes_nothing() {
        let (mut orch, _, _) = orchestrator(MemoryResources::new());
        assert!(orch
            .load(ArchiveKind::Local, ScriptType::Movie, 1, "bogus")
            .is_err());
        assert!(orch.vm().archives.context(ScriptType::Movie, 1).is_none());
    }

    #[test]
    fn test_yielded_thread_parks_and_resumes() {
        let (mut orch, clock, surface) = orchestrator(MemoryResources::new());
        orch.load(
            ArchiveKind::Local,
            ScriptType::Score,
            2,
            "pushint 1\nprint\npushint 50\ndelay\npushint 2\nprint\n",
        )
        .unwrap();
        let report = orch.run_script(ScriptType::Score, 2, 0).unwrap();
        assert_eq!(report.state, ExecState::Yielded);
        assert_eq!(report.channel, Some(0));
        assert_eq!(orch.active_channels(), vec![0]);

        let tick = orch.tick();
        assert_eq!(tick.resumed, vec![0]);
        assert!(tick.finished.is_empty());
        assert_eq!(surface.output(), vec!["1"]);

        clock.advance(50);
        let tick = orch.tick();
        assert_eq!(tick.finished, vec![(0, ExecState::Stopped)]);
        assert_eq!(surface.output(), vec!["1", "2"]);
        assert!(orch.is_idle());
    }

    #[test]
    fn test_run_handler_resolution() {
        let (mut orch, _, surface) = orchestrator(MemoryResources::new());
        orch.load(
            ArchiveKind::Local,
            ScriptType::Sprite,
            5,
            "on mouseUp\n  pushstr \"clicked 5\"\n  print\nend\n",
        )
        .unwrap();
        orch.load(
            ArchiveKind::Shared,
            ScriptType::Movie,
            1,
            "on mouseDown\n  pushstr \"shared down\"\n  print\nend\n",
        )
        .unwrap();

        let report = orch
            .run_handler(ScriptType::Sprite, 5, EventType::MouseUp, vec![])
            .unwrap();
        assert_eq!(report.map(|r| r.state), Some(ExecState::Stopped));
        // unhandled events fall through to movie scripts
        assert!(orch
            .run_handler(ScriptType::Sprite, 5, EventType::MouseDown, vec![])
            .unwrap()
            .is_some());
        // nobody handles keyDown
        assert_eq!(
            orch.run_handler(ScriptType::Sprite, 5, EventType::KeyDown, vec![])
                .unwrap(),
            None
        );
        assert_eq!(surface.output(), vec!["clicked 5", "shared down"]);
    }

    #[test]
    fn test_call_handler_and_builtin() {
        let (mut orch, _, _) = orchestrator(MemoryResources::new());
        orch.load(
            ArchiveKind::Local,
            ScriptType::Movie,
            1,
            "on double n\n  eval n\n  pushint 2\n  mul\n  return\nend\n",
        )
        .unwrap();
        let report = orch
            .call_handler("double", vec![Datum::Int(21)])
            .unwrap()
            .unwrap();
        assert_eq!(report.result, Some(Datum::Int(42)));

        let report = orch
            .call_handler("abs", vec![Datum::Int(-3)])
            .unwrap()
            .unwrap();
        assert_eq!(report.result, Some(Datum::Int(3)));
        assert_eq!(orch.call_handler("missing", vec![]).unwrap(), None);
    }

    #[test]
    fn test_abort_channel() {
        let (mut orch, _, _) = orchestrator(MemoryResources::new());
        orch.load(ArchiveKind::Local, ScriptType::Score, 1, "top:\nwait\njump top\n")
            .unwrap();
        let report = orch.run_script(ScriptType::Score, 1, 0).unwrap();
        let channel = report.channel.unwrap();
        orch.tick();
        assert_eq!(
            orch.abort_channel(channel).unwrap(),
            ExecState::Aborted(AbortReason::External)
        );
        assert!(orch.is_idle());
        assert_eq!(
            orch.abort_channel(channel),
            Err(OrchestratorError::UnknownChannel(channel))
        );
    }

    #[test]
    fn test_external_abort_handle() {
        let (mut orch, _, _) = orchestrator(MemoryResources::new());
        orch.load(ArchiveKind::Local, ScriptType::Score, 1, "top:\nwait\njump top\n")
            .unwrap();
        let channel = orch.run_script(ScriptType::Score, 1, 0).unwrap().channel.unwrap();
        let handle = orch.abort_handle(channel).unwrap();
        std::thread::spawn(move || handle.request()).join().unwrap();
        let tick = orch.tick();
        assert_eq!(
            tick.finished,
            vec![(channel, ExecState::Aborted(AbortReason::External))]
        );
    }

    #[test]
    fn test_reset_clears_everything() {
        let (mut orch, _, _) = orchestrator(MemoryResources::new());
        orch.load(ArchiveKind::Local, ScriptType::Score, 1, "wait\n").unwrap();
        orch.vm_mut().symbols.set_global("score", Datum::Int(3));
        orch.run_script(ScriptType::Score, 1, 0).unwrap();
        orch.reset();
        assert!(orch.is_idle());
        assert!(orch.vm().archives.context(ScriptType::Score, 1).is_none());
        assert!(orch.vm().symbols.global("score").is_none());
        assert_eq!(orch.frame(), 0);
    }

    #[test]
    fn test_sequence_runs_on_ticks() {
        let track: Vec<u8> = [0x0FF0u16, 0x0FF0]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        let mut ads = vec![1, 0, 5, 0];
        ads.extend_from_slice(b"A.TTM");
        for w in [0x2005u16, 1, 1, 0, 0, 0x1510, 0xFFFF] {
            ads.extend_from_slice(&w.to_le_bytes());
        }
        let resources = MemoryResources::new()
            .with("A.TTM", track)
            .with("INTRO.ADS", ads);
        let (mut orch, _, surface) = orchestrator(resources);
        orch.start_sequence("INTRO.ADS").unwrap();
        assert!(orch.start_sequence("NOPE.ADS").is_err());

        let mut frames = 0;
        while !orch.is_idle() && frames < 20 {
            orch.tick();
            frames += 1;
        }
        assert!(orch.is_idle());
        assert_eq!(surface.ops(), vec![0x0FF0, 0x0FF0]);
    }
}
