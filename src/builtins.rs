//! Built-in functions, the last tier of handler resolution

use crate::datum::{Datum, DatumError, DatumKind};
use crate::error::VmError;
use crate::host::Clock;
use indexmap::IndexMap;
use lazy_static::lazy_static;
use log::warn;
use rand::rngs::StdRng;
use rand::Rng;
use std::cmp::Ordering;

/// What a builtin may touch besides its arguments
pub struct BuiltinContext<'a> {
    pub rng: &'a mut StdRng,
    pub clock: &'a dyn Clock,
    pub float_precision: usize,
}

pub type BuiltinFn = fn(&mut BuiltinContext<'_>, &[Datum]) -> Result<Datum, VmError>;

pub struct Builtin {
    pub name: &'static str,
    pub min_args: usize,
    pub max_args: Option<usize>,
    pub func: BuiltinFn,
}

impl Builtin {
    pub fn invoke(&self, ctx: &mut BuiltinContext<'_>, args: &[Datum]) -> Result<Datum, VmError> {
        if args.len() < self.min_args {
            return Err(VmError::Builtin(format!(
                "{} needs at least {} arguments, got {}",
                self.name,
                self.min_args,
                args.len()
            )));
        }
        if let Some(max) = self.max_args {
            if args.len() > max {
                warn!("{} takes at most {} arguments, ignoring the rest", self.name, max);
                return (self.func)(ctx, &args[..max]);
            }
        }
        (self.func)(ctx, args)
    }
}

impl std::fmt::Debug for Builtin {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Builtin({})", self.name)
    }
}

macro_rules! builtin {
    ($name:expr, $min:expr, $max:expr, $func:expr) => {
        (
            $name,
            Builtin {
                name: $name,
                min_args: $min,
                max_args: $max,
                func: $func,
            },
        )
    };
}

lazy_static! {
    static ref BUILTINS: IndexMap<&'static str, Builtin> = [
        builtin!("abs", 1, Some(1), b_abs),
        builtin!("integer", 1, Some(1), b_integer),
        builtin!("float", 1, Some(1), b_float),
        builtin!("string", 1, Some(1), b_string),
        builtin!("symbol", 1, Some(1), b_symbol),
        builtin!("length", 1, Some(1), b_length),
        builtin!("count", 1, Some(1), b_count),
        builtin!("getAt", 2, Some(2), b_get_at),
        builtin!("append", 2, Some(2), b_append),
        builtin!("addProp", 3, Some(3), b_add_prop),
        builtin!("getProp", 2, Some(2), b_get_prop),
        builtin!("max", 1, None, b_max),
        builtin!("min", 1, None, b_min),
        builtin!("random", 1, Some(1), b_random),
        builtin!("milliseconds", 0, Some(0), b_milliseconds),
        builtin!("ticks", 0, Some(0), b_ticks),
    ]
    .into_iter()
    .collect();
}

pub fn lookup(name: &str) -> Option<&'static Builtin> {
    BUILTINS.get(name)
}

pub fn names() -> impl Iterator<Item = &'static str> {
    BUILTINS.keys().copied()
}

fn arg(args: &[Datum], index: usize) -> Datum {
    args.get(index).cloned().unwrap_or(Datum::Void)
}

fn is_numeric_kind(d: &Datum) -> Result<DatumKind, DatumError> {
    Datum::arithmetic_kind(d, &Datum::Void)
}

/// Element of a container by 1-based index (lists, strings), key
/// (property lists) or property name (objects). `Ok(None)` when the index
/// is out of range or the key is absent.
pub fn index_get(container: &Datum, index: &Datum) -> Result<Option<Datum>, DatumError> {
    match container {
        Datum::Array(list) => {
            let list = list.borrow();
            let i = index.as_int();
            if i < 1 {
                return Ok(None);
            }
            Ok(list.get(i as usize - 1).cloned())
        }
        Datum::AssocArray(pairs) => Ok(Datum::prop_lookup(&pairs.borrow(), index)),
        Datum::String(s) => {
            let i = index.as_int();
            if i < 1 {
                return Ok(None);
            }
            Ok(s.chars().nth(i as usize - 1).map(|c| Datum::string(c.to_string())))
        }
        Datum::Object(obj) => Ok(obj.borrow().properties.get(&property_name(index)).cloned()),
        other => Err(DatumError::NotIndexable(other.kind())),
    }
}

/// Store into a container in place; every alias sees the change. Lists
/// grow with Void padding when written past their end. Returns false for
/// an index below 1.
pub fn index_set(container: &Datum, index: &Datum, value: Datum) -> Result<bool, DatumError> {
    match container {
        Datum::Array(list) => {
            let i = index.as_int();
            if i < 1 {
                return Ok(false);
            }
            let i = i as usize - 1;
            let mut list = list.borrow_mut();
            if i >= list.len() {
                list.resize(i + 1, Datum::Void);
            }
            list[i] = value;
            Ok(true)
        }
        Datum::AssocArray(pairs) => {
            let mut pairs = pairs.borrow_mut();
            match pairs
                .iter_mut()
                .find(|(k, _)| k.loosely_equals(index).unwrap_or(false))
            {
                Some((_, slot)) => *slot = value,
                None => pairs.push((index.clone(), value)),
            }
            Ok(true)
        }
        Datum::Object(obj) => {
            obj.borrow_mut()
                .properties
                .insert(property_name(index), value);
            Ok(true)
        }
        other => Err(DatumError::NotIndexable(other.kind())),
    }
}

/// Property key for a symbol or string index
pub fn property_name(index: &Datum) -> String {
    match index {
        Datum::Symbol(s) | Datum::String(s) => s.to_string(),
        other => other.as_string(),
    }
}

fn b_abs(_: &mut BuiltinContext<'_>, args: &[Datum]) -> Result<Datum, VmError> {
    let x = arg(args, 0);
    Ok(match is_numeric_kind(&x)? {
        DatumKind::Float => Datum::Float(x.as_float().abs()),
        _ => Datum::Int(x.as_int().wrapping_abs()),
    })
}

fn b_integer(_: &mut BuiltinContext<'_>, args: &[Datum]) -> Result<Datum, VmError> {
    let x = arg(args, 0);
    let value = match &x {
        Datum::Float(f) => Datum::Int(f.round() as i32),
        Datum::String(s) => match s.trim_start().parse::<f64>() {
            Ok(f) => Datum::Int(f.round() as i32),
            Err(_) => Datum::Void,
        },
        Datum::Void | Datum::Int(_) | Datum::CastRef(_) => Datum::Int(x.as_int()),
        other => return Err(DatumError::NotNumeric(other.kind()).into()),
    };
    Ok(value)
}

fn b_float(_: &mut BuiltinContext<'_>, args: &[Datum]) -> Result<Datum, VmError> {
    let x = arg(args, 0);
    if let Datum::String(s) = &x {
        if s.trim_start().parse::<f64>().is_err() {
            return Ok(x.clone());
        }
    }
    Ok(Datum::Float(x.as_float()))
}

fn b_string(ctx: &mut BuiltinContext<'_>, args: &[Datum]) -> Result<Datum, VmError> {
    Ok(Datum::string(
        arg(args, 0).as_string_with_precision(ctx.float_precision),
    ))
}

fn b_symbol(_: &mut BuiltinContext<'_>, args: &[Datum]) -> Result<Datum, VmError> {
    Ok(match arg(args, 0) {
        s @ Datum::Symbol(_) => s,
        other => Datum::symbol(other.as_string().trim_start_matches('#')),
    })
}

fn b_length(ctx: &mut BuiltinContext<'_>, args: &[Datum]) -> Result<Datum, VmError> {
    let text = arg(args, 0).as_string_with_precision(ctx.float_precision);
    Ok(Datum::Int(text.chars().count() as i32))
}

fn b_count(_: &mut BuiltinContext<'_>, args: &[Datum]) -> Result<Datum, VmError> {
    let n = match arg(args, 0) {
        Datum::Array(list) => list.borrow().len(),
        Datum::AssocArray(pairs) => pairs.borrow().len(),
        Datum::Object(obj) => obj.borrow().properties.len(),
        other => return Err(DatumError::NotIndexable(other.kind()).into()),
    };
    Ok(Datum::Int(n as i32))
}

fn b_get_at(_: &mut BuiltinContext<'_>, args: &[Datum]) -> Result<Datum, VmError> {
    let (container, index) = (arg(args, 0), arg(args, 1));
    match index_get(&container, &index)? {
        Some(value) => Ok(value),
        None => {
            warn!("getAt: index {} out of range", index);
            Ok(Datum::Void)
        }
    }
}

fn b_append(_: &mut BuiltinContext<'_>, args: &[Datum]) -> Result<Datum, VmError> {
    let list = arg(args, 0);
    match &list {
        Datum::Array(items) => items.borrow_mut().push(arg(args, 1)),
        other => return Err(DatumError::NotIndexable(other.kind()).into()),
    }
    Ok(list)
}

fn b_add_prop(_: &mut BuiltinContext<'_>, args: &[Datum]) -> Result<Datum, VmError> {
    let plist = arg(args, 0);
    match &plist {
        Datum::AssocArray(pairs) => pairs.borrow_mut().push((arg(args, 1), arg(args, 2))),
        other => return Err(DatumError::NotIndexable(other.kind()).into()),
    }
    Ok(plist)
}

fn b_get_prop(_: &mut BuiltinContext<'_>, args: &[Datum]) -> Result<Datum, VmError> {
    match arg(args, 0) {
        Datum::AssocArray(pairs) => {
            Ok(Datum::prop_lookup(&pairs.borrow(), &arg(args, 1)).unwrap_or(Datum::Void))
        }
        Datum::Object(obj) => Ok(obj
            .borrow()
            .properties
            .get(&property_name(&arg(args, 1)))
            .cloned()
            .unwrap_or(Datum::Void)),
        other => Err(DatumError::NotIndexable(other.kind()).into()),
    }
}

fn extreme(args: &[Datum], keep: Ordering) -> Result<Datum, VmError> {
    let values: Vec<Datum> = match args {
        [Datum::Array(list)] => list.borrow().clone(),
        _ => args.to_vec(),
    };
    let mut best: Option<Datum> = None;
    for value in values {
        best = match best {
            Some(current) if value.compare_to(&current, false)? != keep => Some(current),
            _ => Some(value),
        };
    }
    Ok(best.unwrap_or(Datum::Void))
}

fn b_max(_: &mut BuiltinContext<'_>, args: &[Datum]) -> Result<Datum, VmError> {
    extreme(args, Ordering::Greater)
}

fn b_min(_: &mut BuiltinContext<'_>, args: &[Datum]) -> Result<Datum, VmError> {
    extreme(args, Ordering::Less)
}

/// random(n) picks from 1..=n
fn b_random(ctx: &mut BuiltinContext<'_>, args: &[Datum]) -> Result<Datum, VmError> {
    let n = arg(args, 0).as_int();
    if n <= 1 {
        return Ok(Datum::Int(1));
    }
    Ok(Datum::Int(ctx.rng.gen_range(1..=n)))
}

fn b_milliseconds(ctx: &mut BuiltinContext<'_>, _: &[Datum]) -> Result<Datum, VmError> {
    Ok(Datum::Int(ctx.clock.now_ms() as i32))
}

/// Sixtieths of a second since the clock started
fn b_ticks(ctx: &mut BuiltinContext<'_>, _: &[Datum]) -> Result<Datum, VmError> {
    Ok(Datum::Int((ctx.clock.now_ms() * 60 / 1000) as i32))
}
