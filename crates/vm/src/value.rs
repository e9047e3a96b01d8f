//! The surface value domain: seven script-visible types, their stack
//! footprints, truthiness rules, and text forms.
//!
//! Two representations exist. On the operand stack, integers, floats,
//! vectors and quaternions are inline while strings, keys and lists are
//! biased heap addresses. [`ScriptValue`] is the owned, heap-independent
//! form used for heap payloads, event arguments and the library-call
//! boundary.

use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

use uuid::Uuid;

#[cfg(feature = "serde-types")]
use serde::{Deserialize, Serialize};

/// 4-bit type codes used in instruction arguments and heap cell headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeTag {
    /// Absence of a value; terminates list payloads.
    Null = 0,
    /// 32-bit signed integer.
    Integer = 1,
    /// 32-bit IEEE-754 float.
    FloatingPoint = 2,
    /// Heap-addressed NUL-terminated byte string.
    String = 3,
    /// Heap-addressed UUID string.
    Key = 4,
    /// Three floats, inline on the stack.
    Vector = 5,
    /// Four floats, inline on the stack.
    Quaternion = 6,
    /// Heap-addressed element sequence.
    List = 7,
}

impl TypeTag {
    /// Decodes a 4-bit type code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Null),
            1 => Some(Self::Integer),
            2 => Some(Self::FloatingPoint),
            3 => Some(Self::String),
            4 => Some(Self::Key),
            5 => Some(Self::Vector),
            6 => Some(Self::Quaternion),
            7 => Some(Self::List),
            _ => None,
        }
    }

    /// Maps a library signature letter to a tag.
    pub fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'i' => Some(Self::Integer),
            'f' => Some(Self::FloatingPoint),
            's' => Some(Self::String),
            'k' => Some(Self::Key),
            'v' => Some(Self::Vector),
            'q' => Some(Self::Quaternion),
            'l' => Some(Self::List),
            _ => None,
        }
    }

    /// Bytes this type occupies on the operand stack.
    pub fn footprint(self) -> i32 {
        match self {
            Self::Vector => 12,
            Self::Quaternion => 16,
            _ => 4,
        }
    }

    /// Whether stack cells of this type carry a heap reference.
    pub fn is_reference(self) -> bool {
        matches!(self, Self::String | Self::Key | Self::List)
    }

    /// Lower-case name used by the instruction trace.
    pub fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer => "integer",
            Self::FloatingPoint => "float",
            Self::String => "string",
            Self::Key => "key",
            Self::Vector => "vector",
            Self::Quaternion => "quaternion",
            Self::List => "list",
        }
    }
}

/// A three-component vector, stored inline on the stack as 12 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde-types", derive(Serialize, Deserialize))]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    /// The zero vector.
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Exact component-wise zero test, used by truthiness.
    pub fn is_exactly_zero(&self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.z == 0.0
    }

    /// Scales every component.
    pub fn scale(self, s: f32) -> Self {
        Self::new(self.x * s, self.y * s, self.z * s)
    }

    /// Dot product.
    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    /// Cross product.
    pub fn cross(self, other: Self) -> Self {
        Self::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    /// Rotates this vector by a quaternion.
    pub fn rotate(self, q: Quaternion) -> Self {
        let axis = Vector3::new(q.x, q.y, q.z);
        let t = axis.cross(self).scale(2.0);
        self + t.scale(q.s) + axis.cross(t)
    }
}

impl Add for Vector3 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vector3 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Neg for Vector3 {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

/// A rotation quaternion, stored inline on the stack as 16 bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(Serialize, Deserialize))]
pub struct Quaternion {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub s: f32,
}

impl Quaternion {
    /// The identity rotation.
    pub const IDENTITY: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        s: 1.0,
    };

    pub fn new(x: f32, y: f32, z: f32, s: f32) -> Self {
        Self { x, y, z, s }
    }

    /// Exact identity test, used by truthiness.
    pub fn is_identity(&self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.z == 0.0 && self.s == 1.0
    }

    /// The conjugate rotation.
    pub fn conjugate(self) -> Self {
        Self::new(-self.x, -self.y, -self.z, self.s)
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Add for Quaternion {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(
            self.x + rhs.x,
            self.y + rhs.y,
            self.z + rhs.z,
            self.s + rhs.s,
        )
    }
}

impl Sub for Quaternion {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(
            self.x - rhs.x,
            self.y - rhs.y,
            self.z - rhs.z,
            self.s - rhs.s,
        )
    }
}

impl Mul for Quaternion {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        // Hamilton product, scalar-last convention.
        Self::new(
            self.s * rhs.x + self.x * rhs.s + self.y * rhs.z - self.z * rhs.y,
            self.s * rhs.y - self.x * rhs.z + self.y * rhs.s + self.z * rhs.x,
            self.s * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.s,
            self.s * rhs.s - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
        )
    }
}

impl Neg for Quaternion {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z, -self.s)
    }
}

/// An owned script value, independent of the VM image.
///
/// This is the form heap payloads decode into, the form event arguments
/// are enqueued as, and the form library functions receive and return.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-types", derive(Serialize, Deserialize))]
pub enum ScriptValue {
    Integer(i32),
    Float(f32),
    String(String),
    Key(String),
    Vector(Vector3),
    Quaternion(Quaternion),
    List(Vec<ScriptValue>),
}

impl Default for ScriptValue {
    fn default() -> Self {
        Self::Integer(0)
    }
}

impl ScriptValue {
    /// The surface type of this value.
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Self::Integer(_) => TypeTag::Integer,
            Self::Float(_) => TypeTag::FloatingPoint,
            Self::String(_) => TypeTag::String,
            Self::Key(_) => TypeTag::Key,
            Self::Vector(_) => TypeTag::Vector,
            Self::Quaternion(_) => TypeTag::Quaternion,
            Self::List(_) => TypeTag::List,
        }
    }

    /// Bytes this value occupies when pushed onto the operand stack.
    pub fn stack_footprint(&self) -> i32 {
        self.type_tag().footprint()
    }

    /// The zero value for a given type.
    pub fn zero_of(tag: TypeTag) -> Self {
        match tag {
            TypeTag::FloatingPoint => Self::Float(0.0),
            TypeTag::String => Self::String(String::new()),
            TypeTag::Key => Self::Key(String::new()),
            TypeTag::Vector => Self::Vector(Vector3::ZERO),
            TypeTag::Quaternion => Self::Quaternion(Quaternion::IDENTITY),
            TypeTag::List => Self::List(Vec::new()),
            _ => Self::Integer(0),
        }
    }

    /// Reinterprets a value under a declared type, as library returns
    /// and key list elements require (a key often arrives as a string).
    pub fn coerce_tag(self, tag: TypeTag) -> Self {
        match (tag, self) {
            (TypeTag::Key, Self::String(text)) => Self::Key(text),
            (TypeTag::String, Self::Key(text)) => Self::String(text),
            (_, value) => value,
        }
    }
}

impl fmt::Display for ScriptValue {
    /// The textual form used by casts. List elements concatenate with
    /// no separator.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v:.6}"),
            Self::String(text) | Self::Key(text) => f.write_str(text),
            Self::Vector(v) => write!(f, "<{:.5}, {:.5}, {:.5}>", v.x, v.y, v.z),
            Self::Quaternion(q) => {
                write!(f, "<{:.5}, {:.5}, {:.5}, {:.5}>", q.x, q.y, q.z, q.s)
            }
            Self::List(items) => {
                for item in items {
                    write!(f, "{item}")?;
                }
                Ok(())
            }
        }
    }
}

/// Integer parse with C `strtoul` semantics: optional leading
/// whitespace and sign, `0x`/`0X` selects hex, digits parsed greedily,
/// the accumulated magnitude wraps at 32 bits. No digits yield zero.
pub fn parse_integer_text(text: &str) -> i32 {
    let trimmed = text.trim_start();
    let (negative, rest) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let bytes = rest.as_bytes();
    let hex = bytes.len() >= 2 && bytes[0] == b'0' && (bytes[1] == b'x' || bytes[1] == b'X');
    let (radix, digits) = if hex { (16u32, &rest[2..]) } else { (10u32, rest) };

    let mut value: u32 = 0;
    for ch in digits.chars() {
        let Some(digit) = ch.to_digit(radix) else {
            break;
        };
        value = value.wrapping_mul(radix).wrapping_add(digit);
    }

    let value = value as i32;
    if negative {
        value.wrapping_neg()
    } else {
        value
    }
}

/// Float parse with C `atof` semantics: the longest valid prefix is
/// converted; an empty prefix yields zero.
pub fn parse_float_text(text: &str) -> f32 {
    let trimmed = text.trim_start();
    let bytes = trimmed.as_bytes();
    let mut end = 0;

    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    let mut seen_digit = false;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
        seen_digit = true;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
            seen_digit = true;
        }
    }
    if seen_digit && end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && (bytes[exp_end] == b'+' || bytes[exp_end] == b'-') {
            exp_end += 1;
        }
        if exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
                exp_end += 1;
            }
            end = exp_end;
        }
    }

    if !seen_digit {
        return 0.0;
    }
    trimmed[..end].parse().unwrap_or(0.0)
}

/// Parses the `<f, f, f>` textual vector form. Malformed input yields
/// `None`; casts substitute the zero vector.
pub fn parse_vector_text(text: &str) -> Option<Vector3> {
    let parts = parse_angle_components(text, 3)?;
    Some(Vector3::new(parts[0], parts[1], parts[2]))
}

/// Parses the `<f, f, f, f>` textual quaternion form. Malformed input
/// yields `None`; casts substitute the identity.
pub fn parse_quaternion_text(text: &str) -> Option<Quaternion> {
    let parts = parse_angle_components(text, 4)?;
    Some(Quaternion::new(parts[0], parts[1], parts[2], parts[3]))
}

fn parse_angle_components(text: &str, count: usize) -> Option<Vec<f32>> {
    let inner = text.trim().strip_prefix('<')?;
    let inner = inner.strip_suffix('>').unwrap_or(inner);
    let parts: Vec<&str> = inner.splitn(count, ',').collect();
    if parts.len() != count {
        return None;
    }
    let mut values = Vec::with_capacity(count);
    for part in parts {
        values.push(part.trim().parse().ok()?);
    }
    Some(values)
}

/// Key truthiness: non-empty and parses to a non-null UUID.
pub fn key_is_truthy(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    match Uuid::parse_str(text.trim()) {
        Ok(id) => !id.is_nil(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn footprints() {
        assert_eq!(TypeTag::Integer.footprint(), 4);
        assert_eq!(TypeTag::Vector.footprint(), 12);
        assert_eq!(TypeTag::Quaternion.footprint(), 16);
        assert_eq!(TypeTag::List.footprint(), 4);
    }

    #[test]
    fn vector_cross_follows_right_hand_rule() {
        let x = Vector3::new(1.0, 0.0, 0.0);
        let y = Vector3::new(0.0, 1.0, 0.0);
        assert_eq!(x.cross(y), Vector3::new(0.0, 0.0, 1.0));
        assert_eq!(y.cross(x), Vector3::new(0.0, 0.0, -1.0));
    }

    #[test]
    fn rotation_by_identity_is_exact() {
        let v = Vector3::new(3.0, -4.0, 5.0);
        assert_eq!(v.rotate(Quaternion::IDENTITY), v);
    }

    #[test]
    fn rotation_by_quarter_turn_about_z() {
        // 90 degrees about +Z maps +X onto +Y.
        let half = std::f32::consts::FRAC_PI_4;
        let q = Quaternion::new(0.0, 0.0, half.sin(), half.cos());
        let rotated = Vector3::new(1.0, 0.0, 0.0).rotate(q);
        assert!((rotated.x).abs() < 1e-6);
        assert!((rotated.y - 1.0).abs() < 1e-6);
        assert!((rotated.z).abs() < 1e-6);
    }

    #[test]
    fn quaternion_mul_identity() {
        let q = Quaternion::new(0.1, 0.2, 0.3, 0.9);
        assert_eq!(q * Quaternion::IDENTITY, q);
        assert_eq!(Quaternion::IDENTITY * q, q);
    }

    #[test]
    fn integer_text_decimal_and_hex() {
        assert_eq!(parse_integer_text("42"), 42);
        assert_eq!(parse_integer_text("-42"), -42);
        assert_eq!(parse_integer_text("0x2A"), 42);
        assert_eq!(parse_integer_text("0Xff"), 255);
        assert_eq!(parse_integer_text("12abc"), 12);
        assert_eq!(parse_integer_text(""), 0);
        assert_eq!(parse_integer_text("zebra"), 0);
        // Octal is never used; leading zeros stay decimal.
        assert_eq!(parse_integer_text("010"), 10);
    }

    #[test]
    fn float_text_prefix_rules() {
        assert_eq!(parse_float_text("1.5"), 1.5);
        assert_eq!(parse_float_text("-2.25 trailing"), -2.25);
        assert_eq!(parse_float_text("3e2"), 300.0);
        assert_eq!(parse_float_text("nope"), 0.0);
        assert_eq!(parse_float_text(".5"), 0.5);
    }

    #[test]
    fn vector_text_round_trip() {
        let v = Vector3::new(1.0, -2.5, 3.25);
        let text = ScriptValue::Vector(v).to_string();
        assert_eq!(parse_vector_text(&text), Some(v));
        assert_eq!(parse_vector_text("<1, 2>"), None);
        assert_eq!(parse_vector_text("garbage"), None);
    }

    #[test]
    fn key_truthiness() {
        assert!(key_is_truthy("6ba7b810-9dad-11d1-80b4-00c04fd430c8"));
        assert!(!key_is_truthy("00000000-0000-0000-0000-000000000000"));
        assert!(!key_is_truthy(""));
        assert!(!key_is_truthy("not a uuid"));
    }

    #[test]
    fn list_text_concatenates_without_separators() {
        let list = ScriptValue::List(vec![
            ScriptValue::Integer(1),
            ScriptValue::String("ab".into()),
            ScriptValue::Integer(2),
        ]);
        assert_eq!(list.to_string(), "1ab2");
    }

    proptest! {
        #[test]
        fn integer_to_text_round_trips(n in any::<i32>()) {
            let text = ScriptValue::Integer(n).to_string();
            prop_assert_eq!(parse_integer_text(&text), n);
        }

        #[test]
        fn hex_text_round_trips(n in any::<u32>()) {
            let text = format!("0x{n:x}");
            prop_assert_eq!(parse_integer_text(&text), n as i32);
        }

        #[test]
        fn float_to_text_agrees_to_six_decimals(f in -1.0e6f32..1.0e6f32) {
            let text = ScriptValue::Float(f).to_string();
            let back = parse_float_text(&text);
            prop_assert!((back - f).abs() <= 1.0e-6f32.max(f.abs() * 1.0e-5));
        }
    }
}
