use crate::{Entity, Machine, RuntimeResult};

use super::Builtin;

pub(super) const FUNCTIONS: &[Builtin] = &[
    Builtin::native("print", print),
    Builtin::native("println", println),
    Builtin::native("errorln", errorln),
];

/// Several arguments arrive as one Tuple and print space-separated.
fn text_of(m: &Machine<'_>, arg: Entity) -> String {
    let parts = arg
        .as_object()
        .and_then(|r| m.object(r).ok())
        .and_then(|o| o.as_tuple().map(<[Entity]>::to_vec));
    match parts {
        Some(parts) => parts
            .into_iter()
            .map(|p| m.display(p))
            .collect::<Vec<_>>()
            .join(" "),
        None => m.display(arg),
    }
}

fn print(m: &mut Machine<'_>, _: Entity, arg: Entity) -> RuntimeResult<Entity> {
    m.vm.write_out(&text_of(m, arg));
    Ok(Entity::None)
}

fn println(m: &mut Machine<'_>, _: Entity, arg: Entity) -> RuntimeResult<Entity> {
    let mut text = text_of(m, arg);
    text.push('\n');
    m.vm.write_out(&text);
    Ok(Entity::None)
}

/// Errors print with their stack trace.
fn errorln(m: &mut Machine<'_>, _: Entity, arg: Entity) -> RuntimeResult<Entity> {
    let text = if m.is_instance(arg, m.special().error) {
        m.render_error(arg)
    } else {
        let mut text = text_of(m, arg);
        text.push('\n');
        text
    };
    m.vm.write_err(&text);
    Ok(Entity::None)
}
