//! Value type definitions for tessel.
//!
//! This module defines the `Value` enum which represents anything that can be
//! stored in a cell: scalars, links, polymorphic payloads and collections.

use crate::row::ObjKey;
use crate::types::{DataType, TypeFamily};
use core::cmp::Ordering;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// A 128-bit decimal: `mantissa * 10^-scale`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Decimal128 {
    mantissa: i128,
    scale: u32,
}

impl Decimal128 {
    pub const ZERO: Decimal128 = Decimal128 {
        mantissa: 0,
        scale: 0,
    };

    pub fn new(mantissa: i128, scale: u32) -> Self {
        Self { mantissa, scale }
    }

    pub fn from_i64(v: i64) -> Self {
        Self::new(v as i128, 0)
    }

    #[inline]
    pub fn mantissa(&self) -> i128 {
        self.mantissa
    }

    #[inline]
    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn to_f64(&self) -> f64 {
        self.mantissa as f64 / 10f64.powi(self.scale as i32)
    }

    /// Rescales both operands to a common scale, or `None` on overflow.
    fn aligned(&self, other: &Self) -> Option<(i128, i128, u32)> {
        let scale = self.scale.max(other.scale);
        let a = self
            .mantissa
            .checked_mul(10i128.checked_pow(scale - self.scale)?)?;
        let b = other
            .mantissa
            .checked_mul(10i128.checked_pow(scale - other.scale)?)?;
        Some((a, b, scale))
    }

    /// Adds two decimals, falling back to a lossy sum on overflow.
    pub fn add(&self, other: &Self) -> Self {
        match self.aligned(other) {
            Some((a, b, scale)) => match a.checked_add(b) {
                Some(m) => Self::new(m, scale),
                None => Self::from_f64_lossy(self.to_f64() + other.to_f64()),
            },
            None => Self::from_f64_lossy(self.to_f64() + other.to_f64()),
        }
    }

    fn from_f64_lossy(v: f64) -> Self {
        Self::new((v * 1e6).round() as i128, 6)
    }
}

impl PartialEq for Decimal128 {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Decimal128 {}

impl PartialOrd for Decimal128 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Decimal128 {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.aligned(other) {
            Some((a, b, _)) => a.cmp(&b),
            None => self
                .to_f64()
                .partial_cmp(&other.to_f64())
                .unwrap_or(Ordering::Equal),
        }
    }
}

impl Hash for Decimal128 {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Normalize trailing zeros so equal values hash equally.
        let (mut m, mut s) = (self.mantissa, self.scale);
        while s > 0 && m % 10 == 0 {
            m /= 10;
            s -= 1;
        }
        m.hash(state);
        s.hash(state);
    }
}

impl fmt::Display for Decimal128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.mantissa);
        }
        let sign = if self.mantissa < 0 { "-" } else { "" };
        let digits = self.mantissa.unsigned_abs().to_string();
        let scale = self.scale as usize;
        if digits.len() > scale {
            let (int, frac) = digits.split_at(digits.len() - scale);
            write!(f, "{}{}.{}", sign, int, frac)
        } else {
            write!(f, "{}0.{}{}", sign, "0".repeat(scale - digits.len()), digits)
        }
    }
}

impl FromStr for Decimal128 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let (int, frac) = body.split_once('.').unwrap_or((body, ""));
        if int.is_empty() && frac.is_empty() {
            return Err(format!("invalid decimal: {s}"));
        }
        if !int.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
            return Err(format!("invalid decimal: {s}"));
        }
        let joined = format!("{int}{frac}");
        let mantissa: i128 = joined
            .parse()
            .map_err(|_| format!("decimal out of range: {s}"))?;
        Ok(Self::new(
            if negative { -mantissa } else { mantissa },
            frac.len() as u32,
        ))
    }
}

static OBJECT_ID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// A 12-byte object identifier: 4 bytes of seconds, 8 bytes of counter/entropy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Generates a new identifier from the wall clock and a process counter.
    pub fn generate() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let counter = OBJECT_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
        let entropy = Uuid::new_v4();
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..8].copy_from_slice(&entropy.as_bytes()[..4]);
        bytes[8..].copy_from_slice(&counter.to_be_bytes());
        Self(bytes)
    }

    #[inline]
    pub fn bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl FromStr for ObjectId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 24 || !s.is_ascii() {
            return Err(format!("invalid object id: {s}"));
        }
        let mut bytes = [0u8; 12];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| format!("invalid object id: {s}"))?;
        }
        Ok(Self(bytes))
    }
}

/// A link to an object of a class named at runtime (payload of mixed fields).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypedLink {
    pub class: String,
    pub key: ObjKey,
}

/// A value that can be stored in a cell.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub enum Value {
    /// Null value
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f32),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
    /// Milliseconds since the Unix epoch
    Date(i64),
    Decimal(Decimal128),
    ObjectId(ObjectId),
    Uuid(Uuid),
    /// Link into the target table of a link column
    Link(ObjKey),
    /// Link carried by a mixed field, naming its class
    TypedLink(TypedLink),
    /// Content of a list or set column
    List(Vec<Value>),
}

impl Value {
    /// Returns the data type of this value, or None if it's Null or a collection.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null | Value::List(_) => None,
            Value::Bool(_) => Some(DataType::Bool),
            Value::Int(_) => Some(DataType::Int),
            Value::Float(_) => Some(DataType::Float),
            Value::Double(_) => Some(DataType::Double),
            Value::String(_) => Some(DataType::String),
            Value::Binary(_) => Some(DataType::Binary),
            Value::Date(_) => Some(DataType::Date),
            Value::Decimal(_) => Some(DataType::Decimal),
            Value::ObjectId(_) => Some(DataType::ObjectId),
            Value::Uuid(_) => Some(DataType::Uuid),
            Value::Link(_) | Value::TypedLink(_) => Some(DataType::Link),
        }
    }

    /// Returns the comparison family, or None for Null and collections.
    pub fn family(&self) -> Option<TypeFamily> {
        self.data_type().map(|t| t.family())
    }

    /// Returns a short name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::List(_) => "list",
            other => other.data_type().map(|t| t.name()).unwrap_or("null"),
        }
    }

    /// Returns true if this value is Null.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<i64> {
        match self {
            Value::Date(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal128> {
        match self {
            Value::Decimal(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_object_id(&self) -> Option<ObjectId> {
        match self {
            Value::ObjectId(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<ObjKey> {
        match self {
            Value::Link(k) => Some(*k),
            Value::TypedLink(l) => Some(l.key),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// Numeric view used by aggregates and cross-type comparisons.
    pub fn as_f64_lossy(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::Decimal(v) => Some(v.to_f64()),
            _ => None,
        }
    }

    /// Creates the value a fresh non-nullable column of `dt` starts with.
    pub fn default_for_type(dt: DataType) -> Self {
        match dt {
            DataType::Bool => Value::Bool(false),
            DataType::Int => Value::Int(0),
            DataType::Float => Value::Float(0.0),
            DataType::Double => Value::Double(0.0),
            DataType::String => Value::String(String::new()),
            DataType::Binary => Value::Binary(Vec::new()),
            DataType::Date => Value::Date(0),
            DataType::Decimal => Value::Decimal(Decimal128::ZERO),
            DataType::ObjectId => Value::ObjectId(ObjectId::from_bytes([0; 12])),
            DataType::Uuid => Value::Uuid(Uuid::nil()),
            DataType::Link | DataType::Mixed => Value::Null,
        }
    }

    /// Returns true if this value can be stored in a column of `dt`.
    pub fn fits(&self, dt: DataType) -> bool {
        match (self, dt) {
            (Value::Null, _) => true,
            (Value::List(_), _) => false,
            (Value::TypedLink(_), DataType::Link) => false,
            (_, DataType::Mixed) => !matches!(self, Value::Link(_)),
            (v, dt) => v.data_type() == Some(dt),
        }
    }

    /// Compares two values of the same family.
    ///
    /// Returns `None` when the values are not comparable (different families or
    /// either side null); numeric values compare across int/float/double/decimal.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Decimal(a), Value::Decimal(b)) => Some(a.cmp(b)),
            (Value::Decimal(a), Value::Int(b)) => Some(a.cmp(&Decimal128::from_i64(*b))),
            (Value::Int(a), Value::Decimal(b)) => Some(Decimal128::from_i64(*a).cmp(b)),
            (a, b) if a.family() == Some(TypeFamily::Numeric)
                && b.family() == Some(TypeFamily::Numeric) =>
            {
                let (x, y) = (a.as_f64_lossy()?, b.as_f64_lossy()?);
                x.partial_cmp(&y)
            }
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Binary(a), Value::Binary(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::ObjectId(a), Value::ObjectId(b)) => Some(a.cmp(b)),
            (Value::Uuid(a), Value::Uuid(b)) => Some(a.cmp(b)),
            (Value::Link(a), Value::Link(b)) => Some(a.cmp(b)),
            (Value::TypedLink(a), Value::TypedLink(b)) => {
                if a.class == b.class {
                    Some(a.key.cmp(&b.key))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Returns a type ordering value for comparing different types.
    fn type_order(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) | Value::Double(_) | Value::Decimal(_) => 2,
            Value::String(_) => 3,
            Value::Binary(_) => 4,
            Value::Date(_) => 5,
            Value::ObjectId(_) => 6,
            Value::Uuid(_) => 7,
            Value::Link(_) => 8,
            Value::TypedLink(_) => 9,
            Value::List(_) => 10,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Double(a), Value::Double(b)) => a == b || (a.is_nan() && b.is_nan()),
            (a, b) => a.compare(b) == Some(Ordering::Equal),
        }
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    /// Total order used for sorting: nulls first, then by family, NaN last
    /// within the numeric family.
    fn cmp(&self, other: &Self) -> Ordering {
        if let Some(ord) = self.compare(other) {
            return ord;
        }
        match (self, other) {
            (Value::List(a), Value::List(b)) => a.cmp(b),
            _ => {
                let nan = |v: &Value| match v {
                    Value::Float(f) => f.is_nan(),
                    Value::Double(d) => d.is_nan(),
                    _ => false,
                };
                match (nan(self), nan(other)) {
                    (true, true) => Ordering::Equal,
                    (true, false) if other.type_order() == 2 => Ordering::Greater,
                    (false, true) if self.type_order() == 2 => Ordering::Less,
                    _ => self.type_order().cmp(&other.type_order()),
                }
            }
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => 0u8.hash(state),
            Value::Bool(b) => b.hash(state),
            // Numeric values that compare equal must hash equal.
            Value::Int(_) | Value::Float(_) | Value::Double(_) | Value::Decimal(_) => {
                2u8.hash(state);
                self.as_f64_lossy().unwrap_or(0.0).to_bits().hash(state)
            }
            Value::String(s) => s.hash(state),
            Value::Binary(b) => b.hash(state),
            Value::Date(d) => d.hash(state),
            Value::ObjectId(o) => o.hash(state),
            Value::Uuid(u) => u.hash(state),
            Value::Link(k) => k.hash(state),
            Value::TypedLink(l) => l.hash(state),
            Value::List(v) => v.hash(state),
        }
    }
}

impl fmt::Display for Value {
    /// Diagnostic rendering. Typed links print class and key only, never the
    /// target's fields, so cyclic graphs render in bounded space.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::String(v) => f.write_str(v),
            Value::Binary(v) => write!(f, "binary({} bytes)", v.len()),
            Value::Date(v) => write!(f, "date({})", v),
            Value::Decimal(v) => write!(f, "{}", v),
            Value::ObjectId(v) => write!(f, "{}", v),
            Value::Uuid(v) => write!(f, "{}", v),
            Value::Link(k) => write!(f, "link({})", k),
            Value::TypedLink(l) => write!(f, "{}({})", l.class, l.key),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}

macro_rules! impl_from {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        }
    };
}

impl_from!(bool, Bool);
impl_from!(i64, Int);
impl_from!(f32, Float);
impl_from!(f64, Double);
impl_from!(String, String);
impl_from!(Vec<u8>, Binary);
impl_from!(Decimal128, Decimal);
impl_from!(ObjectId, ObjectId);
impl_from!(Uuid, Uuid);
impl_from!(TypedLink, TypedLink);

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Value::Null,
        }
    }
}

/// Conversion from a stored value into a Rust type, used by typed accessors.
pub trait FromValue: Sized {
    /// Stored type this conversion expects.
    const DATA_TYPE: DataType;

    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! impl_from_value {
    ($ty:ty, $dt:ident, $accessor:ident) => {
        impl FromValue for $ty {
            const DATA_TYPE: DataType = DataType::$dt;

            fn from_value(value: &Value) -> Option<Self> {
                value.$accessor()
            }
        }
    };
}

impl_from_value!(bool, Bool, as_bool);
impl_from_value!(i64, Int, as_int);
impl_from_value!(f32, Float, as_float);
impl_from_value!(f64, Double, as_double);
impl_from_value!(Decimal128, Decimal, as_decimal);
impl_from_value!(ObjectId, ObjectId, as_object_id);
impl_from_value!(Uuid, Uuid, as_uuid);

impl FromValue for String {
    const DATA_TYPE: DataType = DataType::String;

    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_string)
    }
}

impl FromValue for Vec<u8> {
    const DATA_TYPE: DataType = DataType::Binary;

    fn from_value(value: &Value) -> Option<Self> {
        value.as_binary().map(<[u8]>::to_vec)
    }
}
