//! Behavior of the built-in control opcodes.
//!
//! Each handler receives the resolved arguments of one instruction and acts
//! on the engine through its [`ExecContext`]. Parameter names match the
//! `for_each_builtin_opcode!` table.

use crate::virtual_machine::args::{ArgValue, OpcodeArgs};
use crate::virtual_machine::data_type::Value;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::BuiltinOpcode;
use crate::virtual_machine::registry::{OpcodeDefinition, RegistryBuilder, handler_fn};
use crate::virtual_machine::vm::{Combine, ExecContext, LOCAL_SLOTS};

type BuiltinHandler = fn(&mut ExecContext<'_>, &OpcodeArgs) -> Result<(), VMError>;

/// Binds every built-in opcode to its handler.
pub fn register(builder: &mut RegistryBuilder) -> Result<(), VMError> {
    for builtin in BuiltinOpcode::ALL {
        let definition = OpcodeDefinition::new(builtin.id(), builtin.symbol(), builtin.params());
        builder.bind(definition, handler_fn(handler_for(*builtin)))?;
    }
    Ok(())
}

fn handler_for(builtin: BuiltinOpcode) -> BuiltinHandler {
    use BuiltinOpcode::*;
    match builtin {
        Wait => wait,
        TerminateThisScript => terminate_this_script,
        StartNewScriptWithArgs => start_new_script_with_args,
        StartNewScript => start_new_script,
        ScriptName => script_name,
        StartMission => start_mission,
        Goto => goto,
        GotoIfFalse => goto_if_false,
        Gosub => gosub,
        Return => return_from_gosub,
        Andor => andor,
        IsIntVarGreaterThanNumber => is_int_var_greater_than_number,
        IsIntVarEqualToNumber => is_int_var_equal_to_number,
        SetVarInt | SetLvarInt | SetVarFloat | SetLvarFloat => set_var,
        AddValToIntVar => add_val_to_int_var,
    }
}

/// Integer view of a variable's current value; floats truncate.
fn int_value(ctx: &ExecContext<'_>, arg: &ArgValue) -> Result<i32, VMError> {
    match arg.value {
        Value::Int(v) => Ok(v),
        Value::Float(v) => Ok(v as i32),
        Value::Str(_) => Err(VMError::AssertionFailure {
            opcode: ctx.opcode(),
            message: "string used as a number".to_string(),
        }),
    }
}

// ---- threads ----

fn wait(ctx: &mut ExecContext<'_>, args: &OpcodeArgs) -> Result<(), VMError> {
    let time = args.int("time")?.max(0) as u64;
    let wake_at = ctx.now().saturating_add(time);
    ctx.sleep_until(wake_at)
}

fn terminate_this_script(ctx: &mut ExecContext<'_>, _args: &OpcodeArgs) -> Result<(), VMError> {
    ctx.end_thread()
}

fn start_new_script(ctx: &mut ExecContext<'_>, args: &OpcodeArgs) -> Result<(), VMError> {
    let pc = ctx.resolve_target(args.int("label")?)?;
    ctx.start_thread(pc, false)?;
    Ok(())
}

fn start_new_script_with_args(
    ctx: &mut ExecContext<'_>,
    args: &OpcodeArgs,
) -> Result<(), VMError> {
    let var_args = args.var_args();
    ctx.ensure(var_args.len() > 1, "unassigned thread vars")?;
    ctx.ensure(
        var_args.len() - 1 <= LOCAL_SLOTS,
        "more thread vars than local slots",
    )?;
    let label = int_value(ctx, &var_args[0])?;
    let pc = ctx.resolve_target(label)?;
    let id = ctx.start_thread(pc, false)?;
    for (index, arg) in var_args[1..].iter().enumerate() {
        ctx.set_thread_local(id, index, arg.value.clone())?;
    }
    Ok(())
}

fn script_name(ctx: &mut ExecContext<'_>, args: &OpcodeArgs) -> Result<(), VMError> {
    ctx.set_thread_name(args.string("name")?)
}

fn start_mission(ctx: &mut ExecContext<'_>, args: &OpcodeArgs) -> Result<(), VMError> {
    let id = args.int("mission")?;
    let start = usize::try_from(id)
        .ok()
        .and_then(|id| ctx.regions().mission(id))
        .map(|mission| *mission.start());
    let Some(start) = start else {
        return Err(VMError::AssertionFailure {
            opcode: ctx.opcode(),
            message: format!("unknown mission {}", id),
        });
    };
    ctx.start_thread(start, true)?;
    Ok(())
}

// ---- jumps and calls ----

fn goto(ctx: &mut ExecContext<'_>, args: &OpcodeArgs) -> Result<(), VMError> {
    ctx.jump(args.int("label")?)
}

fn goto_if_false(ctx: &mut ExecContext<'_>, args: &OpcodeArgs) -> Result<(), VMError> {
    if !ctx.resolve_conditions()? {
        ctx.jump(args.int("label")?)?;
    }
    Ok(())
}

fn gosub(ctx: &mut ExecContext<'_>, args: &OpcodeArgs) -> Result<(), VMError> {
    ctx.call(args.int("label")?)
}

fn return_from_gosub(ctx: &mut ExecContext<'_>, _args: &OpcodeArgs) -> Result<(), VMError> {
    ctx.ret()
}

// ---- conditions ----

fn andor(ctx: &mut ExecContext<'_>, args: &OpcodeArgs) -> Result<(), VMError> {
    let mode = args.int("mode")?;
    let (count, combine) = match mode {
        0 => (1, Combine::All),
        1..=7 => (mode as usize + 1, Combine::All),
        21..=27 => (mode as usize - 19, Combine::Any),
        _ => {
            return Err(VMError::AssertionFailure {
                opcode: ctx.opcode(),
                message: format!("invalid andor mode {}", mode),
            });
        }
    };
    ctx.open_conditions(count, combine)
}

fn is_int_var_greater_than_number(
    ctx: &mut ExecContext<'_>,
    args: &OpcodeArgs,
) -> Result<(), VMError> {
    let var = int_value(ctx, args.get("var")?)?;
    let value = args.int("value")?;
    ctx.push_condition(var > value)
}

fn is_int_var_equal_to_number(
    ctx: &mut ExecContext<'_>,
    args: &OpcodeArgs,
) -> Result<(), VMError> {
    let var = int_value(ctx, args.get("var")?)?;
    let value = args.int("value")?;
    ctx.push_condition(var == value)
}

// ---- variables ----

fn set_var(ctx: &mut ExecContext<'_>, args: &OpcodeArgs) -> Result<(), VMError> {
    let var = args.var("var")?;
    let value = args.get("value")?.value.clone();
    ctx.assign(var, value)
}

fn add_val_to_int_var(ctx: &mut ExecContext<'_>, args: &OpcodeArgs) -> Result<(), VMError> {
    let var = args.var("var")?;
    let current = int_value(ctx, args.get("var")?)?;
    let value = int_value(ctx, args.get("value")?)?;
    ctx.assign(var, Value::Int(current.wrapping_add(value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::registry::OpcodeRegistry;

    #[test]
    fn every_builtin_is_bound() {
        let registry = OpcodeRegistry::builtin().unwrap();
        assert_eq!(registry.len(), BuiltinOpcode::ALL.len());
        for builtin in BuiltinOpcode::ALL {
            assert!(registry.is_bound(builtin.id()));
            let definition = registry.definition(builtin.id()).unwrap();
            assert_eq!(definition.symbol, builtin.symbol());
            assert_eq!(definition.params, builtin.params());
        }
    }

    #[test]
    fn registering_twice_is_rejected() {
        let mut builder = OpcodeRegistry::builder();
        register(&mut builder).unwrap();
        assert!(matches!(
            register(&mut builder),
            Err(VMError::DuplicateOpcode { .. })
        ));
    }
}
