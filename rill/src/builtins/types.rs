use crate::{
    ClassHooks, ClassId, Entity, Internal, Machine, Object, RuntimeError,
    RuntimeResult, SpecialClasses, VmError,
};

use super::Builtin;

pub(super) const STRING_HOOKS: ClassHooks = ClassHooks {
    init: Some(init_string),
    delete: None,
};

pub(super) const ARRAY_HOOKS: ClassHooks = ClassHooks {
    init: Some(init_array),
    delete: None,
};

pub(super) const TUPLE_HOOKS: ClassHooks = ClassHooks {
    init: Some(init_tuple),
    delete: None,
};

fn init_string(object: &mut Object) {
    object.internal = Internal::String(String::new());
}

fn init_array(object: &mut Object) {
    object.internal = Internal::Array(Vec::new());
}

fn init_tuple(object: &mut Object) {
    object.internal = Internal::Tuple(Box::new([]));
}

pub(super) const FUNCTIONS: &[Builtin] = &[
    Builtin::native("str", str_of),
    Builtin::native("len", len),
    Builtin::native("$__set_super", set_super),
];

const STRING: &[Builtin] = &[
    Builtin::native("len", len_of_self),
    Builtin::native("concat", string_concat),
];

const ARRAY: &[Builtin] = &[
    Builtin::native("len", len_of_self),
    Builtin::native("push", array_push),
    Builtin::native("pop", array_pop),
];

const TUPLE: &[Builtin] = &[Builtin::native("len", len_of_self)];

const ERROR: &[Builtin] = &[Builtin::native("new", error_new)];

pub(super) fn methods(special: &SpecialClasses) -> Vec<(ClassId, &'static [Builtin])> {
    vec![
        (special.string, STRING),
        (special.array, ARRAY),
        (special.tuple, TUPLE),
        (special.error, ERROR),
    ]
}

fn str_of(m: &mut Machine<'_>, _: Entity, arg: Entity) -> RuntimeResult<Entity> {
    if m.str_value(arg).is_some() {
        return Ok(arg);
    }
    let text = m.display(arg);
    Ok(m.new_string(text))
}

/// Byte length of a String, element count of an Array or Tuple; None is
/// empty.
fn length(m: &Machine<'_>, value: Entity) -> RuntimeResult<usize> {
    let not_sized = || RuntimeError::TypeError {
        expected: "String, Array or Tuple",
        got: m.type_name(value),
    };
    let r = match value {
        Entity::None => return Ok(0),
        Entity::Object(r) => r,
        _ => return Err(not_sized()),
    };
    match m.object(r)?.internal() {
        Internal::String(s) => Ok(s.len()),
        Internal::Array(items) => Ok(items.len()),
        Internal::Tuple(items) => Ok(items.len()),
        _ => Err(not_sized()),
    }
}

fn len(m: &mut Machine<'_>, _: Entity, arg: Entity) -> RuntimeResult<Entity> {
    Ok(Entity::int(length(m, arg)? as i64))
}

fn len_of_self(m: &mut Machine<'_>, receiver: Entity, _: Entity) -> RuntimeResult<Entity> {
    Ok(Entity::int(length(m, receiver)? as i64))
}

fn string_concat(m: &mut Machine<'_>, receiver: Entity, arg: Entity) -> RuntimeResult<Entity> {
    let mut text = m.expect_str(receiver)?;
    text.push_str(&m.display(arg));
    Ok(m.new_string(text))
}

fn array_push(m: &mut Machine<'_>, receiver: Entity, arg: Entity) -> RuntimeResult<Entity> {
    let r = m.expect_object(receiver, "Array")?;
    let len = m.heap().array_push(r, arg)?;
    Ok(Entity::int(len as i64))
}

fn array_pop(m: &mut Machine<'_>, receiver: Entity, _: Entity) -> RuntimeResult<Entity> {
    let r = m.expect_object(receiver, "Array")?;
    m.heap()
        .array_pop(r)?
        .ok_or(RuntimeError::IndexOutOfBounds { index: -1, len: 0 })
}

/// `Error(message)`: fill message and stack trace at construction.
fn error_new(m: &mut Machine<'_>, receiver: Entity, arg: Entity) -> RuntimeResult<Entity> {
    let r = m.expect_object(receiver, "Error")?;
    let message = match arg {
        Entity::None => m.new_string(""),
        other if m.str_value(other).is_some() => other,
        other => {
            let text = m.display(other);
            m.new_string(text)
        }
    };
    m.init_error(r, message)?;
    Ok(receiver)
}

/// `$__set_super((class, super))`.
fn set_super(m: &mut Machine<'_>, _: Entity, arg: Entity) -> RuntimeResult<Entity> {
    let pair = m.expect_object(arg, "Tuple")?;
    let (class, super_class) = match m.object(pair)?.as_tuple() {
        Some(&[class, super_class]) => (class, super_class),
        _ => {
            return Err(RuntimeError::TypeError {
                expected: "(class, superclass)",
                got: m.type_name(arg),
            });
        }
    };
    let class_id = |entity: Entity| -> RuntimeResult<ClassId> {
        let r = m.expect_object(entity, "Class")?;
        match *m.object(r)?.internal() {
            Internal::Class(c) => Ok(c),
            _ => Err(RuntimeError::TypeError {
                expected: "Class",
                got: m.type_name(entity),
            }),
        }
    };
    let (class, super_class) = (class_id(class)?, class_id(super_class)?);
    m.vm
        .registry
        .set_super(&m.vm.strings, class, super_class)
        .map_err(|err| match err {
            VmError::InheritanceCycle(_) => RuntimeError::InheritanceCycle(err.to_string()),
            other => other.into(),
        })?;
    Ok(Entity::None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_hooks_set_payloads() {
        let mut object = Object::new(ClassId(0));
        init_string(&mut object);
        assert_eq!(object.as_str(), Some(""));
        init_array(&mut object);
        assert_eq!(object.as_array().map(<[Entity]>::len), Some(0));
        init_tuple(&mut object);
        assert_eq!(object.as_tuple().map(<[Entity]>::len), Some(0));
    }
}
