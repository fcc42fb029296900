//! Dynamically typed script values
//!
//! A `Datum` is the unit the operand stack, variables and builtins trade in.
//! Heap payloads live behind `Rc`, so cloning a datum shares the payload and
//! the last drop frees it. Lists, property lists and objects are interior
//! mutable: every alias observes an in-place change.

use indexmap::IndexMap;
use log::warn;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

pub const DEFAULT_FLOAT_PRECISION: usize = 4;

/// Containers nested deeper than this print as `...`
const MAX_PRINT_DEPTH: usize = 8;

pub type ListRef = Rc<RefCell<Vec<Datum>>>;
pub type PropListRef = Rc<RefCell<Vec<(Datum, Datum)>>>;
pub type ObjectRef = Rc<RefCell<ScriptObject>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatumKind {
    Void,
    Int,
    Float,
    String,
    Symbol,
    Array,
    AssocArray,
    Object,
    VariableRef,
    CastRef,
}

impl fmt::Display for DatumKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DatumKind::Void => "void",
            DatumKind::Int => "integer",
            DatumKind::Float => "float",
            DatumKind::String => "string",
            DatumKind::Symbol => "symbol",
            DatumKind::Array => "list",
            DatumKind::AssocArray => "property list",
            DatumKind::Object => "object",
            DatumKind::VariableRef => "variable reference",
            DatumKind::CastRef => "cast reference",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DatumError {
    /// No common type exists for the pair
    Incomparable(DatumKind, DatumKind),
    /// Arithmetic on a value that has no numeric reading
    NotNumeric(DatumKind),
    /// Indexing something that is not a container
    NotIndexable(DatumKind),
}

impl fmt::Display for DatumError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DatumError::Incomparable(a, b) => write!(f, "cannot compare {} with {}", a, b),
            DatumError::NotNumeric(kind) => write!(f, "{} is not a number", kind),
            DatumError::NotIndexable(kind) => write!(f, "{} cannot be indexed", kind),
        }
    }
}

impl std::error::Error for DatumError {}

/// Instance created by `new`: a named bag of properties bound as `me`
/// during method calls.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptObject {
    pub name: Rc<str>,
    pub properties: IndexMap<String, Datum>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Void,
    Int(i32),
    Float(f64),
    String(Rc<str>),
    Symbol(Rc<str>),
    Array(ListRef),
    AssocArray(PropListRef),
    Object(ObjectRef),
    /// Names a variable without owning its value
    VariableRef(Rc<str>),
    /// Names a cast member by number
    CastRef(u32),
}

/// Numeric alignment class of a single operand
#[derive(Debug, Clone, Copy, PartialEq)]
enum Align {
    Int,
    Float,
    Text,
    Opaque,
}

// Leading whitespace is skipped, anything after the number is rejected
fn parse_int(text: &str) -> Option<i32> {
    text.trim_start().parse::<i32>().ok()
}

fn parse_float(text: &str) -> Option<f64> {
    text.trim_start().parse::<f64>().ok()
}

impl Default for Datum {
    fn default() -> Self {
        Datum::Void
    }
}

impl From<i32> for Datum {
    fn from(value: i32) -> Self {
        Datum::Int(value)
    }
}

impl From<f64> for Datum {
    fn from(value: f64) -> Self {
        Datum::Float(value)
    }
}

impl From<bool> for Datum {
    fn from(value: bool) -> Self {
        Datum::Int(value as i32)
    }
}

impl From<&str> for Datum {
    fn from(value: &str) -> Self {
        Datum::String(Rc::from(value))
    }
}

impl From<String> for Datum {
    fn from(value: String) -> Self {
        Datum::String(Rc::from(value))
    }
}

impl Datum {
    pub fn string<S: AsRef<str>>(text: S) -> Datum {
        Datum::String(Rc::from(text.as_ref()))
    }

    pub fn symbol<S: AsRef<str>>(name: S) -> Datum {
        Datum::Symbol(Rc::from(name.as_ref()))
    }

    pub fn var_ref<S: AsRef<str>>(name: S) -> Datum {
        Datum::VariableRef(Rc::from(name.as_ref()))
    }

    pub fn list(items: Vec<Datum>) -> Datum {
        Datum::Array(Rc::new(RefCell::new(items)))
    }

    pub fn prop_list(pairs: Vec<(Datum, Datum)>) -> Datum {
        Datum::AssocArray(Rc::new(RefCell::new(pairs)))
    }

    pub fn object<S: AsRef<str>>(name: S, properties: IndexMap<String, Datum>) -> Datum {
        Datum::Object(Rc::new(RefCell::new(ScriptObject {
            name: Rc::from(name.as_ref()),
            properties,
        })))
    }

    pub fn kind(&self) -> DatumKind {
        match self {
            Datum::Void => DatumKind::Void,
            Datum::Int(_) => DatumKind::Int,
            Datum::Float(_) => DatumKind::Float,
            Datum::String(_) => DatumKind::String,
            Datum::Symbol(_) => DatumKind::Symbol,
            Datum::Array(_) => DatumKind::Array,
            Datum::AssocArray(_) => DatumKind::AssocArray,
            Datum::Object(_) => DatumKind::Object,
            Datum::VariableRef(_) => DatumKind::VariableRef,
            Datum::CastRef(_) => DatumKind::CastRef,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Datum::Void)
    }

    /// Number of live owners of the heap payload, `None` for inline values
    pub fn ref_count(&self) -> Option<usize> {
        match self {
            Datum::String(s) | Datum::Symbol(s) | Datum::VariableRef(s) => {
                Some(Rc::strong_count(s))
            }
            Datum::Array(list) => Some(Rc::strong_count(list)),
            Datum::AssocArray(pairs) => Some(Rc::strong_count(pairs)),
            Datum::Object(obj) => Some(Rc::strong_count(obj)),
            Datum::Void | Datum::Int(_) | Datum::Float(_) | Datum::CastRef(_) => None,
        }
    }

    /// True when both values alias the same heap payload
    pub fn same_payload(&self, other: &Datum) -> bool {
        match (self, other) {
            (Datum::String(a), Datum::String(b))
            | (Datum::Symbol(a), Datum::Symbol(b))
            | (Datum::VariableRef(a), Datum::VariableRef(b)) => Rc::ptr_eq(a, b),
            (Datum::Array(a), Datum::Array(b)) => Rc::ptr_eq(a, b),
            (Datum::AssocArray(a), Datum::AssocArray(b)) => Rc::ptr_eq(a, b),
            (Datum::Object(a), Datum::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Integer reading of the value. Unparseable text warns and yields 0.
    pub fn as_int(&self) -> i32 {
        match self {
            Datum::Void => 0,
            Datum::Int(i) => *i,
            Datum::Float(f) => *f as i32,
            Datum::CastRef(n) => *n as i32,
            Datum::String(s) | Datum::VariableRef(s) => match parse_int(s) {
                Some(i) => i,
                None => {
                    warn!("as_int: '{}' is not an integer", s);
                    0
                }
            },
            other => {
                warn!("as_int: {} has no integer value", other.kind());
                0
            }
        }
    }

    /// Float reading of the value. Unparseable text warns and yields 0.0.
    pub fn as_float(&self) -> f64 {
        match self {
            Datum::Void => 0.0,
            Datum::Int(i) => *i as f64,
            Datum::Float(f) => *f,
            Datum::CastRef(n) => *n as f64,
            Datum::String(s) | Datum::VariableRef(s) => match parse_float(s) {
                Some(f) => f,
                None => {
                    warn!("as_float: '{}' is not a number", s);
                    0.0
                }
            },
            other => {
                warn!("as_float: {} has no numeric value", other.kind());
                0.0
            }
        }
    }

    pub fn as_string(&self) -> String {
        self.as_string_with_precision(DEFAULT_FLOAT_PRECISION)
    }

    pub fn as_string_with_precision(&self, precision: usize) -> String {
        self.render(precision, 0, false)
    }

    fn render(&self, precision: usize, depth: usize, quoted: bool) -> String {
        if depth > MAX_PRINT_DEPTH {
            return "...".to_string();
        }
        match self {
            Datum::Void => "#void".to_string(),
            Datum::Int(i) => i.to_string(),
            Datum::Float(f) => format!("{:.*}", precision, f),
            Datum::String(s) if quoted => format!("\"{}\"", s),
            Datum::String(s) => s.to_string(),
            Datum::Symbol(s) => format!("#{}", s),
            Datum::VariableRef(s) => format!("var: #{}", s),
            Datum::CastRef(n) => format!("cast: {}", n),
            Datum::Object(obj) => format!("#{}", obj.borrow().name),
            Datum::Array(list) => {
                let items: Vec<String> = list
                    .borrow()
                    .iter()
                    .map(|d| d.render(precision, depth + 1, true))
                    .collect();
                format!("[{}]", items.join(", "))
            }
            Datum::AssocArray(pairs) => {
                let pairs = pairs.borrow();
                if pairs.is_empty() {
                    return "[:]".to_string();
                }
                let items: Vec<String> = pairs
                    .iter()
                    .map(|(k, v)| {
                        format!(
                            "{}: {}",
                            k.render(precision, depth + 1, true),
                            v.render(precision, depth + 1, true)
                        )
                    })
                    .collect();
                format!("[{}]", items.join(", "))
            }
        }
    }

    /// Condition reading used by conditional jumps and logic operators
    pub fn is_truthy(&self) -> bool {
        match self {
            Datum::Void => false,
            Datum::Int(i) => *i != 0,
            Datum::Float(f) => *f != 0.0,
            Datum::String(s) => parse_float(s).map(|f| f != 0.0).unwrap_or(false),
            _ => true,
        }
    }

    fn align_class(&self) -> Align {
        match self {
            Datum::Void | Datum::Int(_) | Datum::CastRef(_) => Align::Int,
            Datum::Float(_) => Align::Float,
            Datum::String(s) | Datum::VariableRef(s) => {
                if parse_float(s).is_some() {
                    Align::Float
                } else {
                    Align::Text
                }
            }
            Datum::Symbol(_) | Datum::Array(_) | Datum::AssocArray(_) | Datum::Object(_) => {
                Align::Opaque
            }
        }
    }

    /// Common kind two operands are compared or combined in: float when
    /// either side is float-like, integer when both are integer-like,
    /// string when text is involved. `None` when no alignment exists.
    pub fn aligned_kind(a: &Datum, b: &Datum) -> Option<DatumKind> {
        match (a.align_class(), b.align_class()) {
            (Align::Opaque, _) | (_, Align::Opaque) => None,
            (Align::Text, _) | (_, Align::Text) => Some(DatumKind::String),
            (Align::Float, _) | (_, Align::Float) => Some(DatumKind::Float),
            (Align::Int, Align::Int) => Some(DatumKind::Int),
        }
    }

    /// Kind used for arithmetic. Text that is not a number counts as an
    /// integer (reading as 0 with a warning), containers are rejected.
    pub fn arithmetic_kind(a: &Datum, b: &Datum) -> Result<DatumKind, DatumError> {
        for d in [a, b] {
            if d.align_class() == Align::Opaque {
                return Err(DatumError::NotNumeric(d.kind()));
            }
        }
        if a.align_class() == Align::Float || b.align_class() == Align::Float {
            Ok(DatumKind::Float)
        } else {
            Ok(DatumKind::Int)
        }
    }

    pub fn compare_to(&self, other: &Datum, ignore_case: bool) -> Result<Ordering, DatumError> {
        if let (Datum::Symbol(a), Datum::Symbol(b)) = (self, other) {
            return Ok(compare_text(a, b, ignore_case));
        }
        if matches!(self, Datum::Symbol(_)) || matches!(other, Datum::Symbol(_)) {
            return Err(DatumError::Incomparable(self.kind(), other.kind()));
        }
        // two strings always compare as text, numeric-looking or not
        if let (Datum::String(a), Datum::String(b)) = (self, other) {
            return Ok(compare_text(a, b, ignore_case));
        }
        match Datum::aligned_kind(self, other) {
            // NaN is never less than or equal to anything
            Some(DatumKind::Float) => Ok(self
                .as_float()
                .partial_cmp(&other.as_float())
                .unwrap_or(Ordering::Greater)),
            Some(DatumKind::Int) => Ok(self.as_int().cmp(&other.as_int())),
            Some(_) => Ok(compare_text(
                &self.as_string(),
                &other.as_string(),
                ignore_case,
            )),
            None => Err(DatumError::Incomparable(self.kind(), other.kind())),
        }
    }

    /// Equality as the `eq` opcode sees it: case-insensitive, and pairs
    /// without a common type are simply unequal when they alias nothing.
    pub fn loosely_equals(&self, other: &Datum) -> Result<bool, DatumError> {
        if self.same_payload(other) {
            return Ok(true);
        }
        self.compare_to(other, true).map(|o| o == Ordering::Equal)
    }

    /// Value stored under `key` in a property list, compared loosely
    pub fn prop_lookup(pairs: &[(Datum, Datum)], key: &Datum) -> Option<Datum> {
        pairs
            .iter()
            .find(|(k, _)| k.loosely_equals(key).unwrap_or(false))
            .map(|(_, v)| v.clone())
    }
}

fn compare_text(a: &str, b: &str, ignore_case: bool) -> Ordering {
    if ignore_case {
        a.to_lowercase().cmp(&b.to_lowercase())
    } else {
        a.cmp(b)
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(Datum::string("42").as_int(), 42);
        assert_eq!(Datum::string(" 7").as_int(), 7);
        assert_eq!(Datum::string("2.5").as_float(), 2.5);
        assert_eq!(Datum::Float(3.9).as_int(), 3);
        assert_eq!(Datum::Float(-3.9).as_int(), -3);
        assert_eq!(Datum::Int(5).as_float(), 5.0);
        assert_eq!(Datum::Void.as_int(), 0);
    }

    #[test]
    fn test_bad_text_reads_as_zero() {
        assert_eq!(Datum::string("12abc").as_int(), 0);
        assert_eq!(Datum::string("2.5").as_int(), 0);
        assert_eq!(Datum::string("hello").as_float(), 0.0);
        assert_eq!(Datum::symbol("foo").as_int(), 0);
    }

    #[test]
    fn test_as_string() {
        assert_eq!(Datum::Float(1.5).as_string(), "1.5000");
        assert_eq!(Datum::Float(1.5).as_string_with_precision(1), "1.5");
        assert_eq!(Datum::Void.as_string(), "#void");
        assert_eq!(Datum::symbol("done").as_string(), "#done");
        let list = Datum::list(vec![Datum::Int(1), Datum::string("a")]);
        assert_eq!(list.as_string(), "[1, \"a\"]");
        assert_eq!(Datum::prop_list(vec![]).as_string(), "[:]");
        let props = Datum::prop_list(vec![(Datum::symbol("x"), Datum::Int(3))]);
        assert_eq!(props.as_string(), "[#x: 3]");
    }

    #[test]
    fn test_self_referencing_list_prints() {
        let list = Datum::list(vec![]);
        if let Datum::Array(inner) = &list {
            inner.borrow_mut().push(list.clone());
        }
        assert!(list.as_string().contains("..."));
        // break the cycle so the test does not leak
        if let Datum::Array(inner) = &list {
            inner.borrow_mut().clear();
        }
    }

    #[test]
    fn test_aligned_kind() {
        assert_eq!(
            Datum::aligned_kind(&Datum::Int(1), &Datum::Void),
            Some(DatumKind::Int)
        );
        assert_eq!(
            Datum::aligned_kind(&Datum::Int(1), &Datum::Float(1.0)),
            Some(DatumKind::Float)
        );
        assert_eq!(
            Datum::aligned_kind(&Datum::string("2.5"), &Datum::Int(1)),
            Some(DatumKind::Float)
        );
        assert_eq!(
            Datum::aligned_kind(&Datum::string("abc"), &Datum::Int(1)),
            Some(DatumKind::String)
        );
        assert_eq!(
            Datum::aligned_kind(&Datum::list(vec![]), &Datum::Int(1)),
            None
        );
    }

    #[test]
    fn test_compare_numeric_ordering() {
        let values = [
            Datum::Int(-3),
            Datum::Void,
            Datum::Float(0.5),
            Datum::string("2"),
            Datum::Int(7),
            Datum::Float(10.25),
        ];
        for a in &values {
            for b in &values {
                if matches!((a, b), (Datum::String(_), Datum::String(_))) {
                    continue;
                }
                let expected = a.as_float().partial_cmp(&b.as_float()).unwrap();
                assert_eq!(a.compare_to(b, false).unwrap(), expected, "{} vs {}", a, b);
                assert_eq!(b.compare_to(a, false).unwrap(), expected.reverse());
            }
        }
        // a numeric string against a number aligns as float
        assert_eq!(
            Datum::string("10").compare_to(&Datum::Int(9), false).unwrap(),
            Ordering::Greater
        );
    }

    #[test]
    fn test_string_pairs_order_as_text() {
        let texts = ["10", "9", "10.25", "2", "-3", " 7", "1e3", "abc", "ABC", "0x10"];
        for a in texts {
            for b in texts {
                let (da, db) = (Datum::string(a), Datum::string(b));
                assert_eq!(da.compare_to(&db, false).unwrap(), a.cmp(b), "{:?} vs {:?}", a, b);
                assert_eq!(
                    da.compare_to(&db, true).unwrap(),
                    a.to_lowercase().cmp(&b.to_lowercase()),
                    "{:?} vs {:?} ignoring case",
                    a,
                    b
                );
            }
        }
        assert_eq!(
            Datum::string("10").compare_to(&Datum::string("9"), false).unwrap(),
            Ordering::Less
        );
        assert!(!Datum::string("1.0").loosely_equals(&Datum::string("1")).unwrap());
    }

    #[test]
    fn test_nan_is_never_equal() {
        let nan = Datum::string("nan");
        assert_eq!(nan.compare_to(&Datum::Int(5), false).unwrap(), Ordering::Greater);
        let raw = Datum::Float(f64::NAN);
        assert_eq!(raw.compare_to(&raw, false).unwrap(), Ordering::Greater);
        assert!(!nan.loosely_equals(&Datum::Int(5)).unwrap());
        assert!(!Datum::Int(5).loosely_equals(&nan).unwrap());
    }

    #[test]
    fn test_trailing_characters_are_rejected() {
        assert_eq!(Datum::string("7 ").as_int(), 0);
        assert_eq!(Datum::string("2.5\n").as_float(), 0.0);
        assert_eq!(
            Datum::aligned_kind(&Datum::string("7 "), &Datum::Int(1)),
            Some(DatumKind::String)
        );
        assert_eq!(
            Datum::aligned_kind(&Datum::string(" 7"), &Datum::Int(1)),
            Some(DatumKind::Float)
        );
        assert!(!Datum::string("1 ").is_truthy());
    }

    #[test]
    fn test_compare_strings() {
        let apple = Datum::string("apple");
        let banana = Datum::string("Banana");
        // 'B' sorts before 'a' when case matters
        assert_eq!(apple.compare_to(&banana, false).unwrap(), Ordering::Greater);
        assert_eq!(apple.compare_to(&banana, true).unwrap(), Ordering::Less);
        assert_eq!(
            Datum::string("HELLO")
                .compare_to(&Datum::string("hello"), true)
                .unwrap(),
            Ordering::Equal
        );
        assert_ne!(
            Datum::string("HELLO")
                .compare_to(&Datum::string("hello"), false)
                .unwrap(),
            Ordering::Equal
        );
    }

    #[test]
    fn test_symbols_compare_by_name_only() {
        let a = Datum::symbol("alpha");
        assert_eq!(
            a.compare_to(&Datum::symbol("alpha"), false).unwrap(),
            Ordering::Equal
        );
        assert_eq!(
            a.compare_to(&Datum::symbol("ALPHA"), true).unwrap(),
            Ordering::Equal
        );
        assert!(a.compare_to(&Datum::string("alpha"), false).is_err());
    }

    #[test]
    fn test_containers_are_incomparable() {
        let list = Datum::list(vec![Datum::Int(1)]);
        assert_eq!(
            list.compare_to(&Datum::Int(1), false),
            Err(DatumError::Incomparable(DatumKind::Array, DatumKind::Int))
        );
        assert!(list.loosely_equals(&list.clone()).unwrap());
    }

    #[test]
    fn test_ref_count_released_once() {
        let original = Datum::list(vec![Datum::Int(1), Datum::Int(2)]);
        let weak = match &original {
            Datum::Array(rc) => Rc::downgrade(rc),
            _ => unreachable!(),
        };
        let clones: Vec<Datum> = (0..5).map(|_| original.clone()).collect();
        assert_eq!(original.ref_count(), Some(6));
        assert!(clones.iter().all(|c| c.same_payload(&original)));
        drop(clones);
        assert_eq!(original.ref_count(), Some(1));
        assert!(weak.upgrade().is_some());
        drop(original);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_inline_values_have_no_ref_count() {
        assert_eq!(Datum::Int(3).ref_count(), None);
        assert_eq!(Datum::CastRef(3).ref_count(), None);
        assert_eq!(Datum::string("x").ref_count(), Some(1));
    }

    #[test]
    fn test_aliases_see_mutation() {
        let list = Datum::list(vec![]);
        let alias = list.clone();
        if let Datum::Array(inner) = &alias {
            inner.borrow_mut().push(Datum::Int(9));
        }
        assert_eq!(list.as_string(), "[9]");
    }

    #[test]
    fn test_prop_lookup_is_case_insensitive() {
        let pairs = vec![
            (Datum::symbol("Name"), Datum::string("box")),
            (Datum::string("size"), Datum::Int(4)),
        ];
        assert_eq!(
            Datum::prop_lookup(&pairs, &Datum::symbol("name")),
            Some(Datum::string("box"))
        );
        assert_eq!(
            Datum::prop_lookup(&pairs, &Datum::string("SIZE")),
            Some(Datum::Int(4))
        );
        assert_eq!(Datum::prop_lookup(&pairs, &Datum::Int(1)), None);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Datum::Void.is_truthy());
        assert!(!Datum::Int(0).is_truthy());
        assert!(Datum::Int(-1).is_truthy());
        assert!(Datum::Float(0.1).is_truthy());
        assert!(!Datum::string("abc").is_truthy());
        assert!(Datum::string("1").is_truthy());
        assert!(Datum::list(vec![]).is_truthy());
    }
}
