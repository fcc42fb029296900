//! Script contexts, archives and handler registration
//!
//! A script context is one compiled unit: an ordered list of handlers loaded
//! under a `(ScriptType, id)` key into either the local or the shared
//! archive. Loading registers each handler either as an event binding for
//! `(event, id)` or as a named function of its archive.

use indexmap::IndexMap;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptType {
    Movie,
    Score,
    Sprite,
    Cast,
}

impl ScriptType {
    pub const ALL: [ScriptType; 4] = [
        ScriptType::Movie,
        ScriptType::Score,
        ScriptType::Sprite,
        ScriptType::Cast,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ScriptType::Movie => "movie",
            ScriptType::Score => "score",
            ScriptType::Sprite => "sprite",
            ScriptType::Cast => "cast",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        ScriptType::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Name given to instructions written outside any handler block
    pub fn default_handler_name(self) -> &'static str {
        match self {
            ScriptType::Score => "enterFrame",
            ScriptType::Sprite | ScriptType::Cast => "mouseUp",
            ScriptType::Movie => "startMovie",
        }
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Discrete host events a script can handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    MouseUp,
    MouseDown,
    EnterFrame,
    ExitFrame,
    KeyDown,
    Idle,
    StartMovie,
    StopMovie,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        EventType::MouseUp,
        EventType::MouseDown,
        EventType::EnterFrame,
        EventType::ExitFrame,
        EventType::KeyDown,
        EventType::Idle,
        EventType::StartMovie,
        EventType::StopMovie,
    ];

    /// Handler name that binds to this event
    pub fn handler_name(self) -> &'static str {
        match self {
            EventType::MouseUp => "mouseUp",
            EventType::MouseDown => "mouseDown",
            EventType::EnterFrame => "enterFrame",
            EventType::ExitFrame => "exitFrame",
            EventType::KeyDown => "keyDown",
            EventType::Idle => "idle",
            EventType::StartMovie => "startMovie",
            EventType::StopMovie => "stopMovie",
        }
    }

    pub fn from_handler_name(name: &str) -> Option<Self> {
        EventType::ALL.into_iter().find(|e| e.handler_name() == name)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.handler_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveKind {
    /// The current movie's scripts
    Local,
    /// Scripts shared across movies
    Shared,
}

/// Identifies the context a handler was loaded from without owning it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextKey {
    pub archive: ArchiveKind,
    pub script_type: ScriptType,
    pub id: u16,
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let archive = match self.archive {
            ArchiveKind::Local => "local",
            ArchiveKind::Shared => "shared",
        };
        write!(f, "{} {} {}", archive, self.script_type, self.id)
    }
}

/// Handler as produced by the assembler or a compiled unit, before it is
/// bound to a context
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HandlerDef {
    pub name: String,
    pub arg_names: Vec<String>,
    pub local_names: Vec<String>,
    pub code: Vec<u32>,
}

/// A loaded handler
#[derive(Debug, Clone, PartialEq)]
pub struct Handler {
    pub name: String,
    pub arg_names: Vec<String>,
    pub local_names: Vec<String>,
    pub code: Vec<u32>,
    pub context: ContextKey,
}

impl Handler {
    pub fn from_def(def: HandlerDef, context: ContextKey) -> Self {
        Handler {
            name: def.name,
            arg_names: def.arg_names,
            local_names: def.local_names,
            code: def.code,
            context,
        }
    }
}

#[derive(Debug)]
pub struct ScriptContext {
    pub key: ContextKey,
    pub handlers: Vec<Rc<Handler>>,
}

impl ScriptContext {
    pub fn handler(&self, name: &str) -> Option<&Rc<Handler>> {
        self.handlers.iter().find(|h| h.name == name)
    }

    pub fn entry(&self, index: usize) -> Option<&Rc<Handler>> {
        self.handlers.get(index)
    }
}

/// Where a handler lookup was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerTier {
    Event,
    LocalFunction,
    SharedFunction,
    Builtin,
}

#[derive(Debug, Default)]
pub struct Archive {
    contexts: IndexMap<(ScriptType, u16), Rc<ScriptContext>>,
    event_handlers: HashMap<(EventType, u16), Rc<Handler>>,
    function_handlers: IndexMap<String, Rc<Handler>>,
}

impl Archive {
    pub fn context(&self, script_type: ScriptType, id: u16) -> Option<&Rc<ScriptContext>> {
        self.contexts.get(&(script_type, id))
    }

    pub fn contexts(&self) -> impl Iterator<Item = &Rc<ScriptContext>> {
        self.contexts.values()
    }

    pub fn function(&self, name: &str) -> Option<&Rc<Handler>> {
        self.function_handlers.get(name)
    }

    pub fn event_handler(&self, event: EventType, entity_id: u16) -> Option<&Rc<Handler>> {
        self.event_handlers.get(&(event, entity_id))
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    fn clear(&mut self) {
        self.contexts.clear();
        self.event_handlers.clear();
        self.function_handlers.clear();
    }
}

#[derive(Debug, Default)]
pub struct Archives {
    local: Archive,
    shared: Archive,
}

impl Archives {
    pub fn new() -> Self {
        Archives::default()
    }

    pub fn archive(&self, kind: ArchiveKind) -> &Archive {
        match kind {
            ArchiveKind::Local => &self.local,
            ArchiveKind::Shared => &self.shared,
        }
    }

    fn archive_mut(&mut self, kind: ArchiveKind) -> &mut Archive {
        match kind {
            ArchiveKind::Local => &mut self.local,
            ArchiveKind::Shared => &mut self.shared,
        }
    }

    /// Publish a compiled unit. A context already loaded under the same key
    /// is replaced with a warning, along with every binding it made.
    pub fn publish(
        &mut self,
        key: ContextKey,
        defs: Vec<HandlerDef>,
    ) -> Rc<ScriptContext> {
        let archive = self.archive_mut(key.archive);
        if archive.contexts.contains_key(&(key.script_type, key.id)) {
            warn!("Script already defined: {}, replacing", key);
            archive.function_handlers.retain(|_, h| h.context != key);
            archive.event_handlers.retain(|_, h| h.context != key);
        }

        let handlers: Vec<Rc<Handler>> = defs
            .into_iter()
            .map(|def| Rc::new(Handler::from_def(def, key)))
            .collect();

        for handler in &handlers {
            match EventType::from_handler_name(&handler.name) {
                Some(event) => {
                    debug!("Binding {} handler for entity {}", event, key.id);
                    if let Some(old) = archive
                        .event_handlers
                        .insert((event, key.id), handler.clone())
                    {
                        warn!("{} for entity {} redefined (was in {})", event, key.id, old.context);
                    }
                }
                None => {
                    if let Some(old) = archive
                        .function_handlers
                        .insert(handler.name.clone(), handler.clone())
                    {
                        warn!(
                            "Handler '{}' redefined by {} (was in {})",
                            handler.name, key, old.context
                        );
                    }
                }
            }
        }

        let context = Rc::new(ScriptContext { key, handlers });
        archive
            .contexts
            .insert((key.script_type, key.id), context.clone());
        info!("Loaded {} with {} handlers", key, context.handlers.len());
        context
    }

    /// Find a loaded context, local archive first
    pub fn context(&self, script_type: ScriptType, id: u16) -> Option<Rc<ScriptContext>> {
        self.local
            .context(script_type, id)
            .or_else(|| self.shared.context(script_type, id))
            .cloned()
    }

    /// Resolve a handler name through the script tiers: the local event
    /// binding for `entity_id`, then local functions, then shared ones.
    /// Builtins are the caller's last tier.
    pub fn resolve_handler(&self, name: &str, entity_id: u16) -> Option<(HandlerTier, Rc<Handler>)> {
        if let Some(event) = EventType::from_handler_name(name) {
            if let Some(h) = self.local.event_handler(event, entity_id) {
                return Some((HandlerTier::Event, h.clone()));
            }
        }
        if let Some(h) = self.local.function(name) {
            return Some((HandlerTier::LocalFunction, h.clone()));
        }
        self.shared
            .function(name)
            .map(|h| (HandlerTier::SharedFunction, h.clone()))
    }

    pub fn clear(&mut self) {
        self.local.clear();
        self.shared.clear();
    }
}
