//! Variable scopes
//!
//! Names resolve in a fixed order: locals of the current frame, properties
//! of the current `me` object, globals, then read-only built-in constants.
//! Lookups and assignments that go wrong are reported, never fatal.

use crate::datum::{Datum, ObjectRef};
use indexmap::IndexMap;
use log::{debug, warn};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Local,
    Instance,
    Global,
    Builtin,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Scope::Local => "local",
            Scope::Instance => "property",
            Scope::Global => "global",
            Scope::Builtin => "builtin",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub scope: Scope,
    pub value: Datum,
}

/// Result of an assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOutcome {
    Assigned(Scope),
    /// Stored, but the script's `global` declaration disagreed with the
    /// scope the name was found in
    ScopeMismatch { found: Scope, declared_global: bool },
    /// No scope holds the name; nothing was stored
    NotDefined,
    /// Built-in constants cannot be overwritten
    ReadOnly,
}

impl AssignOutcome {
    pub fn stored(self) -> bool {
        matches!(
            self,
            AssignOutcome::Assigned(_) | AssignOutcome::ScopeMismatch { .. }
        )
    }
}

/// The scopes visible to the instruction being executed
pub struct Scopes<'a> {
    pub locals: Option<&'a mut IndexMap<String, Datum>>,
    pub me: Option<&'a ObjectRef>,
}

impl<'a> Scopes<'a> {
    pub fn new(locals: Option<&'a mut IndexMap<String, Datum>>, me: Option<&'a ObjectRef>) -> Self {
        Scopes { locals, me }
    }

    /// No handler running: only globals and constants are visible
    pub fn top_level() -> Self {
        Scopes {
            locals: None,
            me: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SymbolTable {
    globals: IndexMap<String, Datum>,
    constants: IndexMap<String, Datum>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        let mut constants = IndexMap::new();
        constants.insert("true".to_string(), Datum::Int(1));
        constants.insert("false".to_string(), Datum::Int(0));
        constants.insert("void".to_string(), Datum::Void);
        constants.insert("empty".to_string(), Datum::string(""));
        constants.insert("pi".to_string(), Datum::Float(std::f64::consts::PI));
        constants.insert("return".to_string(), Datum::string("\r"));
        constants.insert("tab".to_string(), Datum::string("\t"));
        constants.insert("quote".to_string(), Datum::string("\""));
        SymbolTable {
            globals: IndexMap::new(),
            constants,
        }
    }

    pub fn globals(&self) -> &IndexMap<String, Datum> {
        &self.globals
    }

    pub fn global(&self, name: &str) -> Option<&Datum> {
        self.globals.get(name)
    }

    /// Host-side global write, creating the global when absent
    pub fn set_global(&mut self, name: &str, value: Datum) {
        self.globals.insert(name.to_string(), value);
    }

    /// `global x`: create the global as Void unless it already exists
    pub fn declare_global(&mut self, name: &str) {
        if !self.globals.contains_key(name) {
            debug!("Declaring global {}", name);
            self.globals.insert(name.to_string(), Datum::Void);
        }
    }

    /// `property x`: create a Void property on the current object
    pub fn declare_property(&self, me: Option<&ObjectRef>, name: &str) -> bool {
        match me {
            Some(obj) => {
                obj.borrow_mut()
                    .properties
                    .entry(name.to_string())
                    .or_insert(Datum::Void);
                true
            }
            None => {
                warn!("property {} declared with no current object", name);
                false
            }
        }
    }

    pub fn resolve(&self, name: &str, scopes: &Scopes) -> Option<Resolved> {
        if let Some(value) = scopes.locals.as_ref().and_then(|l| l.get(name)) {
            return Some(Resolved {
                scope: Scope::Local,
                value: value.clone(),
            });
        }
        if let Some(me) = scopes.me {
            if name == "me" {
                return Some(Resolved {
                    scope: Scope::Instance,
                    value: Datum::Object(me.clone()),
                });
            }
            if let Some(value) = me.borrow().properties.get(name) {
                return Some(Resolved {
                    scope: Scope::Instance,
                    value: value.clone(),
                });
            }
        }
        if let Some(value) = self.globals.get(name) {
            return Some(Resolved {
                scope: Scope::Global,
                value: value.clone(),
            });
        }
        self.constants.get(name).map(|value| Resolved {
            scope: Scope::Builtin,
            value: value.clone(),
        })
    }

    /// Read a variable for the `eval` opcode. A miss warns and reads Void.
    pub fn fetch(&self, name: &str, declared_global: bool, scopes: &Scopes) -> Option<Resolved> {
        let resolved = self.resolve(name, scopes);
        match &resolved {
            Some(r) if declared_global && r.scope == Scope::Local => {
                warn!("Local variable {} fetched as global", name)
            }
            Some(r) if !declared_global && r.scope == Scope::Global && scopes.locals.is_some() => {
                debug!("{} read from global scope", name)
            }
            Some(_) => {}
            None => warn!("Variable {} not defined", name),
        }
        resolved
    }

    /// Store into whichever scope holds `name`.
    ///
    /// Unlike reads, assignment never creates a variable: locals exist from
    /// frame creation and globals from `global` declarations.
    pub fn assign(
        &mut self,
        name: &str,
        value: Datum,
        declared_global: bool,
        scopes: &mut Scopes,
    ) -> AssignOutcome {
        let found = if scopes.locals.as_ref().is_some_and(|l| l.contains_key(name)) {
            Some(Scope::Local)
        } else if scopes
            .me
            .is_some_and(|me| me.borrow().properties.contains_key(name))
        {
            Some(Scope::Instance)
        } else if self.globals.contains_key(name) {
            Some(Scope::Global)
        } else if self.constants.contains_key(name) {
            Some(Scope::Builtin)
        } else {
            None
        };

        let scope = match found {
            Some(Scope::Builtin) => {
                warn!("Cannot assign to built-in constant {}", name);
                return AssignOutcome::ReadOnly;
            }
            Some(scope) => scope,
            None => {
                warn!("Variable {} not defined", name);
                return AssignOutcome::NotDefined;
            }
        };

        // the old value is dropped here, releasing its payload
        match scope {
            Scope::Local => {
                if let Some(locals) = scopes.locals.as_mut() {
                    locals.insert(name.to_string(), value);
                }
            }
            Scope::Instance => {
                if let Some(me) = scopes.me {
                    me.borrow_mut().properties.insert(name.to_string(), value);
                }
            }
            Scope::Global => {
                self.globals.insert(name.to_string(), value);
            }
            Scope::Builtin => {}
        }

        let mismatch = match scope {
            Scope::Local => declared_global,
            Scope::Global => !declared_global && scopes.locals.is_some(),
            _ => false,
        };
        if mismatch {
            warn!(
                "Variable {} assigned as {} but lives in {} scope",
                name,
                if declared_global { "global" } else { "local" },
                scope
            );
            AssignOutcome::ScopeMismatch {
                found: scope,
                declared_global,
            }
        } else {
            AssignOutcome::Assigned(scope)
        }
    }

    /// Forget every global, keeping the constants
    pub fn clear(&mut self) {
        self.globals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use crate::datum::ScriptObject;

    fn object(props: &[(&str, Datum)]) -> ObjectRef {
        Rc::new(RefCell::new(ScriptObject {
            name: Rc::from("thing"),
            properties: props
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }))
    }

    #[test]
    fn test_local_shadows_global() {
        let mut table = SymbolTable::new();
        table.declare_global("x");
        table.set_global("x", Datum::Int(1));
        let mut locals = IndexMap::new();
        locals.insert("x".to_string(), Datum::Int(2));

        let scopes = Scopes::new(Some(&mut locals), None);
        let r = table.resolve("x", &scopes).unwrap();
        assert_eq!(r.scope, Scope::Local);
        assert_eq!(r.value, Datum::Int(2));

        let r = table.resolve("x", &Scopes::top_level()).unwrap();
        assert_eq!(r.scope, Scope::Global);
        assert_eq!(r.value, Datum::Int(1));
    }

    #[test]
    fn test_scope_priority() {
        let mut table = SymbolTable::new();
        table.set_global("size", Datum::Int(1));
        table.set_global("true", Datum::Int(5));
        let me = object(&[("size", Datum::Int(2))]);
        let scopes = Scopes::new(None, Some(&me));
        assert_eq!(table.resolve("size", &scopes).unwrap().scope, Scope::Instance);
        // globals shadow constants
        assert_eq!(table.resolve("true", &scopes).unwrap().value, Datum::Int(5));
        assert_eq!(table.resolve("pi", &scopes).unwrap().scope, Scope::Builtin);
        let resolved = table.resolve("me", &scopes).unwrap();
        assert!(resolved.value.same_payload(&Datum::Object(me.clone())));
    }

    #[test]
    fn test_missing_variable() {
        let table = SymbolTable::new();
        assert!(table.fetch("ghost", false, &Scopes::top_level()).is_none());
    }

    #[test]
    fn test_assign_never_creates() {
        let mut table = SymbolTable::new();
        let outcome = table.assign("ghost", Datum::Int(1), false, &mut Scopes::top_level());
        assert_eq!(outcome, AssignOutcome::NotDefined);
        assert!(table.global("ghost").is_none());
    }

    #[test]
    fn test_wrong_scope_assignment_still_stores() {
        let mut table = SymbolTable::new();
        table.declare_global("score");
        let mut locals = IndexMap::new();
        locals.insert("count".to_string(), Datum::Void);

        // global written without a global declaration inside a handler
        let mut scopes = Scopes::new(Some(&mut locals), None);
        let outcome = table.assign("score", Datum::Int(10), false, &mut scopes);
        assert_eq!(
            outcome,
            AssignOutcome::ScopeMismatch {
                found: Scope::Global,
                declared_global: false
            }
        );
        assert!(outcome.stored());
        assert_eq!(table.global("score"), Some(&Datum::Int(10)));

        // local written through a global declaration
        let outcome = table.assign("count", Datum::Int(3), true, &mut scopes);
        assert_eq!(
            outcome,
            AssignOutcome::ScopeMismatch {
                found: Scope::Local,
                declared_global: true
            }
        );
        assert_eq!(locals.get("count"), Some(&Datum::Int(3)));
    }

    #[test]
    fn test_assign_property_and_constant() {
        let mut table = SymbolTable::new();
        let me = object(&[("hp", Datum::Int(3))]);
        let mut scopes = Scopes::new(None, Some(&me));
        assert_eq!(
            table.assign("hp", Datum::Int(9), false, &mut scopes),
            AssignOutcome::Assigned(Scope::Instance)
        );
        assert_eq!(me.borrow().properties["hp"], Datum::Int(9));
        assert_eq!(
            table.assign("pi", Datum::Int(3), false, &mut scopes),
            AssignOutcome::ReadOnly
        );
    }

    #[test]
    fn test_assignment_releases_old_value() {
        let mut table = SymbolTable::new();
        table.declare_global("list");
        let list = Datum::list(vec![Datum::Int(1)]);
        let mut scopes = Scopes::top_level();
        table.assign("list", list.clone(), true, &mut scopes);
        assert_eq!(list.ref_count(), Some(2));
        table.assign("list", Datum::Void, true, &mut scopes);
        assert_eq!(list.ref_count(), Some(1));
    }

    #[test]
    fn test_declare_property() {
        let table = SymbolTable::new();
        let me = object(&[]);
        assert!(table.declare_property(Some(&me), "mood"));
        assert_eq!(me.borrow().properties.get("mood"), Some(&Datum::Void));
        assert!(!table.declare_property(None, "mood"));
    }
}
