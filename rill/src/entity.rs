//! Entity: the universal value, none / primitive scalar / object reference.
//!
//! Primitive: a scalar copied by value, no heap identity.
//!
//! ObjectRef: a generation-checked index into one process heap. Copying an
//! `ObjectRef` aliases the object; the heap's edge graph tracks who holds it.
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Primitive {
    Char(i8),
    Int(i64),
    Float(f64),
}

/// Handle to an object in a [`Heap`](crate::Heap).
///
/// The generation is bumped every time a slot is reclaimed, so a handle that
/// outlived its object is detected instead of aliasing the slot's next tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Entity {
    #[default]
    None,
    Primitive(Primitive),
    Object(ObjectRef),
}

impl ObjectRef {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl Primitive {
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Primitive::Char(c) => Some(c as i64),
            Primitive::Int(i) => Some(i),
            Primitive::Float(_) => None,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Primitive::Char(c) => c as f64,
            Primitive::Int(i) => i as f64,
            Primitive::Float(f) => f,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Primitive::Float(_))
    }

    pub fn type_name(self) -> &'static str {
        match self {
            Primitive::Char(_) => "Char",
            Primitive::Int(_) => "Int",
            Primitive::Float(_) => "Float",
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Primitive::Char(c) => write!(f, "{}", (*c as u8) as char),
            Primitive::Int(i) => write!(f, "{i}"),
            Primitive::Float(x) => write!(f, "{x}"),
        }
    }
}

impl Entity {
    pub const TRUE: Entity = Entity::Primitive(Primitive::Int(1));

    pub fn int(value: i64) -> Self {
        Entity::Primitive(Primitive::Int(value))
    }

    pub fn float(value: f64) -> Self {
        Entity::Primitive(Primitive::Float(value))
    }

    pub fn char(value: i8) -> Self {
        Entity::Primitive(Primitive::Char(value))
    }

    /// Language truth value: `Int(1)` for true, None for false.
    pub fn from_bool(value: bool) -> Self {
        if value { Self::TRUE } else { Entity::None }
    }

    /// None is the only false value.
    pub fn is_truthy(self) -> bool {
        !matches!(self, Entity::None)
    }

    pub fn is_none(self) -> bool {
        matches!(self, Entity::None)
    }

    pub fn as_object(self) -> Option<ObjectRef> {
        match self {
            Entity::Object(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_primitive(self) -> Option<Primitive> {
        match self {
            Entity::Primitive(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_int(self) -> Option<i64> {
        match self {
            Entity::Primitive(Primitive::Int(i)) => Some(i),
            Entity::Primitive(Primitive::Char(c)) => Some(c as i64),
            _ => None,
        }
    }

    /// Object identity, used to skip redundant edge updates.
    pub fn same_object(self, other: Entity) -> bool {
        match (self, other) {
            (Entity::Object(a), Entity::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl From<Primitive> for Entity {
    fn from(value: Primitive) -> Self {
        Entity::Primitive(value)
    }
}

impl From<ObjectRef> for Entity {
    fn from(value: ObjectRef) -> Self {
        Entity::Object(value)
    }
}

impl From<i64> for Entity {
    fn from(value: i64) -> Self {
        Entity::int(value)
    }
}

impl From<f64> for Entity {
    fn from(value: f64) -> Self {
        Entity::float(value)
    }
}
