//! Host collaborators: the frame clock and the presentation surface
//!
//! The VM never draws, plays or waits on its own. Side effects go through
//! a `Surface` by opcode number, and delays are timestamps read from a
//! `Clock` once per tick.

use crate::datum::Datum;
use log::{debug, info};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::Instant;

/// Millisecond time source
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// Wall-clock time since construction
#[derive(Debug)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Clock advanced by hand. Clones share the same time, so a test can keep
/// one while the orchestrator owns another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock::default()
    }

    pub fn set(&self, ms: u64) {
        self.now.set(ms);
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }
}

/// Error reported by a surface call
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceError {
    pub message: String,
}

impl SurfaceError {
    pub fn new(message: impl Into<String>) -> Self {
        SurfaceError {
            message: message.into(),
        }
    }
}

impl fmt::Display for SurfaceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Surface error: {}", self.message)
    }
}

impl std::error::Error for SurfaceError {}

/// Presentation layer the scripts drive. Operations are opaque to the VM,
/// which only cares whether a call succeeded.
pub trait Surface {
    /// Perform host operation `op` with the given arguments
    fn call(&mut self, op: u16, args: &[Datum]) -> Result<Datum, SurfaceError>;

    /// Script text output
    fn print(&mut self, text: &str) -> Result<(), SurfaceError>;
}

/// One recorded surface call
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceCall {
    pub op: u16,
    pub args: Vec<Datum>,
}

/// Everything a `HeadlessSurface` has seen
#[derive(Debug, Default)]
pub struct SurfaceLog {
    pub calls: Vec<SurfaceCall>,
    pub output: Vec<String>,
}

/// Surface that records calls and output without presenting anything.
/// Clones share one log.
#[derive(Debug, Clone, Default)]
pub struct HeadlessSurface {
    log: Rc<RefCell<SurfaceLog>>,
    /// Ops that report failure, for exercising error paths
    failing_ops: Vec<u16>,
}

impl HeadlessSurface {
    pub fn new() -> Self {
        HeadlessSurface::default()
    }

    pub fn failing_on(mut self, op: u16) -> Self {
        self.failing_ops.push(op);
        self
    }

    pub fn calls(&self) -> Vec<SurfaceCall> {
        self.log.borrow().calls.clone()
    }

    pub fn ops(&self) -> Vec<u16> {
        self.log.borrow().calls.iter().map(|c| c.op).collect()
    }

    pub fn output(&self) -> Vec<String> {
        self.log.borrow().output.clone()
    }

    pub fn clear(&self) {
        let mut log = self.log.borrow_mut();
        log.calls.clear();
        log.output.clear();
    }
}

impl Surface for HeadlessSurface {
    fn call(&mut self, op: u16, args: &[Datum]) -> Result<Datum, SurfaceError> {
        debug!("surface call {:#06x} {:?}", op, args);
        self.log.borrow_mut().calls.push(SurfaceCall {
            op,
            args: args.to_vec(),
        });
        if self.failing_ops.contains(&op) {
            return Err(SurfaceError::new(format!("op {:#06x} refused", op)));
        }
        Ok(Datum::Void)
    }

    fn print(&mut self, text: &str) -> Result<(), SurfaceError> {
        self.log.borrow_mut().output.push(text.to_string());
        Ok(())
    }
}

/// Surface for the command line runner: prints script output and logs
/// host operations.
#[derive(Debug, Default)]
pub struct ConsoleSurface;

impl Surface for ConsoleSurface {
    fn call(&mut self, op: u16, args: &[Datum]) -> Result<Datum, SurfaceError> {
        let args: Vec<String> = args.iter().map(|a| a.as_string()).collect();
        info!("host op {:#06x}({})", op, args.join(", "));
        Ok(Datum::Void)
    }

    fn print(&mut self, text: &str) -> Result<(), SurfaceError> {
        println!("{}", text);
        Ok(())
    }
}
