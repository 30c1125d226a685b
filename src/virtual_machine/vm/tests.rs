use super::*;
use crate::utils::test_utils::utils::{ScriptBuilder, layout};
use crate::virtual_machine::data_type::{DataType, TypeConstraint, Value};
use crate::virtual_machine::registry::{OpcodeDefinition, Param, handler_fn};

/// Ticks spent on the three header jumps before main code runs.
const HEADER_TICKS: u64 = 3;
const GLOBALS: usize = 16;
const G0: u16 = 8;
const G1: u16 = 12;

fn script(missions: &[&str]) -> ScriptBuilder {
    layout(GameVariant::ViceCity, GLOBALS, &[], missions)
}

fn load_with(b: &ScriptBuilder, registry: OpcodeRegistry, config: VmConfig) -> VM {
    VM::load(b.build(), registry, config).expect("load failed")
}

fn load(b: &ScriptBuilder) -> VM {
    load_with(b, OpcodeRegistry::builtin().unwrap(), VmConfig::default())
}

/// Loads and runs through the header into main code.
fn boot(b: &ScriptBuilder) -> VM {
    let mut vm = load(b);
    vm.run(HEADER_TICKS).expect("header failed");
    vm
}

fn global(vm: &VM, address: u16) -> i32 {
    vm.memory().read_i32(address as usize).unwrap()
}

fn local(vm: &VM, thread: usize, index: usize) -> Value {
    vm.threads()[thread].local(index, vm.now()).unwrap()
}

fn run_expect_err(vm: &mut VM) -> VMError {
    let before = vm.snapshot();
    let err = vm.tick().expect_err("tick should fail");
    let after = vm.snapshot();
    assert_eq!(after.memory_digest, before.memory_digest);
    assert_eq!(after.threads, before.threads);
    assert_eq!(after.branch_conditions, before.branch_conditions);
    assert_eq!(after.tick, before.tick);
    assert_eq!(after.time, before.time);
    assert_eq!(after.current_thread, before.current_thread);
    err
}

// ==================== Loading ====================

#[test]
fn load_starts_main_thread_at_zero() {
    let mut b = script(&[]);
    b.op(0x004E);
    let vm = load(&b);
    assert_eq!(vm.threads().len(), 1);
    assert_eq!(vm.current_thread().unwrap().pc, 0);
    assert_eq!(vm.ticks(), 0);
    assert_eq!(vm.now(), 0);
    assert_eq!(vm.regions().main_code.start, b.address("main"));
}

#[test]
fn header_jumps_reach_main_code() {
    let mut b = script(&[]);
    b.op(0x004E);
    let vm = boot(&b);
    assert_eq!(vm.current_thread().unwrap().pc, b.address("main"));
    assert_eq!(vm.ticks(), HEADER_TICKS);
    assert_eq!(vm.now(), HEADER_TICKS);
}

#[test]
fn load_rejects_unstructured_blob() {
    let err = VM::load(vec![0; 4], OpcodeRegistry::builtin().unwrap(), VmConfig::default())
        .err()
        .unwrap();
    assert!(matches!(err, VMError::InvalidScriptStructure { .. }));
}

#[test]
fn tick_record_describes_instruction() {
    let mut b = script(&[]);
    b.op(0x0004).global(G0).int8(5);
    b.op(0x004E);
    let mut vm = boot(&b);
    let record = vm.tick().unwrap();
    assert_eq!(record.tick, HEADER_TICKS + 1);
    assert_eq!(record.thread, 0);
    assert_eq!(record.address, b.address("main"));
    assert_eq!(record.opcode, OpcodeId(0x0004));
    assert_eq!(record.byte_length, 2 + 3 + 2);
    assert!(!record.negated);
    assert!(!record.jumped);
    assert_eq!(
        vm.current_thread().unwrap().pc,
        b.address("main") + record.byte_length
    );
}

// ==================== Variables ====================

#[test]
fn set_global_int_and_float() {
    let mut b = script(&[]);
    b.op(0x0004).global(G0).int8(5);
    b.op(0x0005).global(G1).float(1.5);
    b.op(0x004E);
    let mut vm = boot(&b);
    vm.run(2).unwrap();

    assert_eq!(global(&vm, G0), 5);
    assert_eq!(vm.memory().read_f32(G1 as usize).unwrap(), 1.5);
    assert_eq!(
        vm.memory().allocation(G0 as usize).unwrap().data_type,
        DataType::Int32
    );
    assert_eq!(
        vm.memory().allocation(G1 as usize).unwrap().data_type,
        DataType::Float32
    );
}

#[test]
fn add_to_global() {
    let mut b = script(&[]);
    b.op(0x0004).global(G0).int16(1000);
    b.op(0x0008).global(G0).int8(-3);
    b.op(0x004E);
    let mut vm = boot(&b);
    vm.run(2).unwrap();
    assert_eq!(global(&vm, G0), 997);
}

#[test]
fn add_wraps() {
    let mut b = script(&[]);
    b.op(0x0004).global(G0).int32(i32::MAX);
    b.op(0x0008).global(G0).int8(1);
    b.op(0x004E);
    let mut vm = boot(&b);
    vm.run(2).unwrap();
    assert_eq!(global(&vm, G0), i32::MIN);
}

#[test]
fn set_and_add_local() {
    let mut b = script(&[]);
    b.op(0x0006).local(0).int8(7);
    b.op(0x0008).local(0).int8(1);
    b.op(0x0007).local(1).float(0.5);
    b.op(0x004E);
    let mut vm = boot(&b);
    vm.run(3).unwrap();
    assert_eq!(local(&vm, 0, 0), Value::Int(8));
    assert_eq!(local(&vm, 0, 1), Value::Float(0.5));
    assert_eq!(local(&vm, 0, 2), Value::Int(0));
}

#[test]
fn timer_counts_virtual_time() {
    let mut b = script(&[]);
    b.op(0x0006).local(32).int8(0);
    b.op(0x0004).global(G0).int8(0);
    b.op(0x0008).global(G0).local(32);
    b.op(0x004E);
    let mut vm = boot(&b);
    vm.run(3).unwrap();
    assert_eq!(global(&vm, G0), 2);
}

#[test]
fn local_index_past_timers_is_rejected() {
    let mut b = script(&[]);
    b.op(0x0006).local(40).int8(0);
    b.op(0x004E);
    let mut vm = boot(&b);
    assert_eq!(
        run_expect_err(&mut vm),
        VMError::InvalidLocalSlot {
            index: 40,
            available: LOCAL_SLOTS + TIMER_SLOTS
        }
    );
}

#[test]
fn argument_type_mismatch_fails_without_effects() {
    let mut b = script(&[]);
    b.op(0x0004).int8(1).int8(5);
    b.op(0x004E);
    let mut vm = boot(&b);
    assert!(matches!(
        run_expect_err(&mut vm),
        VMError::ArgumentTypeMismatch { arg_index: 0, .. }
    ));
    assert_eq!(vm.current_thread().unwrap().pc, b.address("main"));
}

// ==================== Threads ====================

#[test]
fn start_thread_switches_immediately() {
    let mut b = script(&[]);
    b.op(0x00D7).label_ref("worker");
    b.op(0x004E);
    b.label("worker").op(0x004E);
    let mut vm = boot(&b);
    vm.tick().unwrap();

    assert_eq!(vm.threads().len(), 2);
    assert_eq!(vm.current_thread().unwrap().id, 1);
    assert_eq!(vm.current_thread().unwrap().pc, b.address("worker"));
    assert_eq!(vm.threads()[0].pc, b.address("main") + 7);
    assert_eq!(vm.threads()[0].wake_at, Some(HEADER_TICKS));
}

#[test]
fn start_thread_without_switch_keeps_running() {
    let mut b = script(&[]);
    b.op(0x00D7).label_ref("worker");
    b.op(0x004E);
    b.label("worker").op(0x004E);
    let config = VmConfig {
        switch_on_new_thread: false,
        ..VmConfig::default()
    };
    let mut vm = load_with(&b, OpcodeRegistry::builtin().unwrap(), config);
    vm.run(HEADER_TICKS + 1).unwrap();
    assert_eq!(vm.threads().len(), 2);
    assert_eq!(vm.current_thread().unwrap().id, 0);
}

#[test]
fn wait_hands_control_to_most_overdue_thread() {
    let mut b = script(&[]);
    b.op(0x00D7).label_ref("worker");
    b.label("main_loop").op(0x0001).int8(100);
    b.op(0x0002).label_ref("main_loop");
    b.label("worker").op(0x0001).int8(10);
    b.op(0x0002).label_ref("worker");
    let mut vm = boot(&b);

    let threads: Vec<usize> = (0..6).map(|_| vm.tick().unwrap().thread).collect();
    assert_eq!(threads, vec![0, 1, 0, 1, 1, 1]);
}

#[test]
fn start_thread_with_args_fills_locals() {
    let mut b = script(&[]);
    b.op(0x004F).label_ref("worker").int8(42).float(2.5).end();
    b.op(0x004E);
    b.label("worker").op(0x004E);
    let mut vm = boot(&b);
    vm.tick().unwrap();

    assert_eq!(vm.current_thread().unwrap().id, 1);
    assert_eq!(local(&vm, 1, 0), Value::Int(42));
    assert_eq!(local(&vm, 1, 1), Value::Float(2.5));
    assert_eq!(local(&vm, 1, 2), Value::Int(0));
}

#[test]
fn start_thread_with_args_requires_args() {
    let mut b = script(&[]);
    b.op(0x004F).label_ref("worker").end();
    b.op(0x004E);
    b.label("worker").op(0x004E);
    let mut vm = boot(&b);
    assert_eq!(
        run_expect_err(&mut vm),
        VMError::AssertionFailure {
            opcode: OpcodeId(0x004F),
            message: "unassigned thread vars".to_string()
        }
    );
    assert_eq!(vm.threads().len(), 1);
}

#[test]
fn terminate_sleeps_forever() {
    let mut b = script(&[]);
    b.op(0x00D7).label_ref("worker");
    b.label("main_loop").op(0x0002).label_ref("main_loop");
    b.label("worker").op(0x004E);
    let mut vm = boot(&b);
    vm.run(2).unwrap();

    assert_eq!(vm.threads()[1].wake_at, Some(WAKE_NEVER));
    assert_eq!(vm.current_thread().unwrap().id, 0);
    vm.run(10).unwrap();
    assert_eq!(vm.current_thread().unwrap().id, 0);
}

#[test]
fn terminated_thread_never_runs_again() {
    let mut b = script(&[]);
    b.op(0x004E);
    b.op(0x0004).global(G0).int8(7);
    let mut vm = boot(&b);
    vm.tick().unwrap();

    assert!(vm.current_thread().is_none());
    assert_eq!(run_expect_err(&mut vm), VMError::AllThreadsTerminated);
    assert_eq!(global(&vm, G0), 0);
    assert_eq!(vm.threads()[0].wake_at, Some(WAKE_NEVER));
}

#[test]
fn all_threads_terminated_stops_the_run() {
    let mut b = script(&[]);
    b.op(0x00D7).label_ref("worker");
    b.op(0x004E);
    b.op(0x0004).global(G0).int8(7);
    b.label("worker").op(0x004E);
    b.op(0x0004).global(G1).int8(9);
    let mut vm = boot(&b);
    vm.run(3).unwrap();

    assert!(vm.threads().iter().all(|t| t.wake_at == Some(WAKE_NEVER)));
    assert_eq!(vm.run(5), Err(VMError::AllThreadsTerminated));
    assert_eq!(global(&vm, G0), 0);
    assert_eq!(global(&vm, G1), 0);
    assert_eq!(vm.ticks(), HEADER_TICKS + 3);
}

#[test]
fn sleeping_thread_outlives_terminated_one() {
    let mut b = script(&[]);
    b.op(0x00D7).label_ref("worker");
    b.op(0x004E);
    b.label("worker").op(0x0001).int8(50);
    b.op(0x0004).global(G0).int8(1);
    b.op(0x004E);
    let mut vm = boot(&b);
    // worker wakes early as the only runnable thread
    vm.run(4).unwrap();

    assert_eq!(global(&vm, G0), 1);
    assert_eq!(vm.threads()[0].wake_at, Some(WAKE_NEVER));
}

#[test]
fn script_name_names_thread() {
    let mut b = script(&[]);
    b.op(0x03A4).string8("intro");
    b.op(0x004E);
    let mut vm = boot(&b);
    vm.tick().unwrap();
    assert_eq!(vm.threads()[0].name.as_deref(), Some("intro"));
}

// ==================== Missions ====================

#[test]
fn start_mission_runs_relative_jumps() {
    let mut b = script(&["m0"]);
    b.op(0x0417).int8(0);
    b.op(0x004E);
    b.label("m0").op(0x0006).local(0).int8(1);
    b.label("m_loop").op(0x0008).local(0).int8(1);
    let offset = (b.address("m_loop") - b.address("m0")) as i32;
    b.op(0x0002).int32(-offset);
    let mut vm = boot(&b);

    vm.tick().unwrap();
    let mission = vm.current_thread().unwrap();
    assert_eq!(mission.id, 1);
    assert!(mission.is_mission);
    assert_eq!(mission.base_offset, Some(b.address("m0")));

    vm.run(2).unwrap();
    let record = vm.tick().unwrap();
    assert!(record.jumped);
    assert_eq!(vm.current_thread().unwrap().pc, b.address("m_loop"));
    vm.tick().unwrap();
    assert_eq!(local(&vm, 1, 0), Value::Int(3));
}

#[test]
fn threads_started_by_a_mission_inherit_its_base() {
    let mut b = script(&["m0"]);
    b.op(0x0417).int8(0);
    b.op(0x004E);
    b.label("m0").op(0x00D7).int32(-7);
    b.label("child").op(0x004E);
    assert_eq!(b.address("child") - b.address("m0"), 7);
    let mut vm = boot(&b);
    vm.run(2).unwrap();

    let child = vm.current_thread().unwrap();
    assert_eq!(child.id, 2);
    assert!(!child.is_mission);
    assert_eq!(child.base_offset, Some(b.address("m0")));
    assert_eq!(child.pc, b.address("child"));
}

#[test]
fn unknown_mission_is_an_assertion() {
    let mut b = script(&["m0"]);
    b.op(0x0417).int8(3);
    b.op(0x004E);
    b.label("m0").op(0x004E);
    let mut vm = boot(&b);
    assert!(matches!(
        run_expect_err(&mut vm),
        VMError::AssertionFailure { .. }
    ));
}

#[test]
fn relative_jump_without_mission_base_is_rejected() {
    // Main jumps into mission code, where a relative goto has no base.
    let mut b = script(&["m0"]);
    b.op(0x0002).label_ref("m0");
    b.label("m0").op(0x0002).int32(-7);
    b.op(0x004E);
    let mut vm = boot(&b);
    vm.tick().unwrap();
    assert_eq!(vm.current_thread().unwrap().pc, b.address("m0"));
    assert!(matches!(
        run_expect_err(&mut vm),
        VMError::InvalidJumpTarget { target: -7, .. }
    ));
}

#[test]
fn jump_into_instruction_middle_is_rejected() {
    let mut b = script(&[]);
    b.label("loop").op(0x0004).global(G0).int8(1);
    let target = b.address("loop") as i32 + 1;
    b.op(0x0002).int32(target);
    let mut vm = boot(&b);
    vm.tick().unwrap();
    assert!(matches!(
        run_expect_err(&mut vm),
        VMError::InvalidJumpTarget { .. }
    ));
}

// ==================== Conditions ====================

fn branch_script(mode: i8, first: (u16, i8), second: (u16, i8)) -> ScriptBuilder {
    let mut b = script(&[]);
    b.op(0x0004).global(G0).int8(5);
    b.op(0x00D6).int8(mode);
    b.op(first.0).global(G0).int8(first.1);
    b.op(second.0).global(G0).int8(second.1);
    b.op(0x004D).label_ref("else");
    b.op(0x0004).global(G1).int8(1);
    b.op(0x0002).label_ref("end");
    b.label("else").op(0x0004).global(G1).int8(2);
    b.label("end").op(0x004E);
    b
}

#[test]
fn and_block_with_negated_condition_takes_then_branch() {
    // 5 == 5 and not (5 == 6)
    let b = branch_script(1, (0x0038, 5), (0x8038, 6));
    let mut vm = boot(&b);
    vm.run(6).unwrap();
    assert_eq!(global(&vm, G1), 1);
    assert!(!vm.branch_conditions().is_open());
}

#[test]
fn or_block_of_false_conditions_jumps() {
    // 5 > 10 or 5 == 4
    let b = branch_script(21, (0x0018, 10), (0x0038, 4));
    let mut vm = boot(&b);
    vm.run(6).unwrap();
    assert_eq!(global(&vm, G1), 2);
}

#[test]
fn or_block_with_one_true_condition_falls_through() {
    // 5 > 4 or 5 == 4
    let b = branch_script(21, (0x0018, 4), (0x0038, 4));
    let mut vm = boot(&b);
    vm.run(6).unwrap();
    assert_eq!(global(&vm, G1), 1);
}

#[test]
fn snapshot_shows_open_conditions() {
    let b = branch_script(1, (0x0038, 5), (0x0038, 5));
    let mut vm = boot(&b);
    vm.run(3).unwrap();
    assert_eq!(
        vm.snapshot().branch_conditions,
        Some(vec![Some(true), None])
    );
}

#[test]
fn invalid_andor_mode_is_an_assertion() {
    let mut b = script(&[]);
    b.op(0x00D6).int8(9);
    b.op(0x004E);
    let mut vm = boot(&b);
    assert!(matches!(
        run_expect_err(&mut vm),
        VMError::AssertionFailure { .. }
    ));
    assert!(!vm.branch_conditions().is_open());
}

#[test]
fn condition_outside_block_is_misuse() {
    let mut b = script(&[]);
    b.op(0x0038).global(G0).int8(0);
    b.op(0x004E);
    let mut vm = boot(&b);
    assert!(matches!(
        run_expect_err(&mut vm),
        VMError::BranchConditionMisuse { .. }
    ));
}

// ==================== Calls ====================

#[test]
fn gosub_and_return() {
    let mut b = script(&[]);
    b.op(0x0050).label_ref("sub");
    b.op(0x0004).global(G0).int8(1);
    b.op(0x004E);
    b.label("sub").op(0x0004).global(G1).int8(2);
    b.op(0x0051);
    let mut vm = boot(&b);

    vm.tick().unwrap();
    assert_eq!(
        vm.current_thread().unwrap().call_stack(),
        &[b.address("main") + 7]
    );
    vm.run(3).unwrap();
    assert_eq!(global(&vm, G0), 1);
    assert_eq!(global(&vm, G1), 2);
    assert!(vm.current_thread().unwrap().call_stack().is_empty());
}

#[test]
fn return_without_gosub_underflows() {
    let mut b = script(&[]);
    b.op(0x0051);
    let mut vm = boot(&b);
    assert_eq!(run_expect_err(&mut vm), VMError::CallStackUnderflow);
    assert_eq!(vm.current_thread().unwrap().pc, b.address("main"));
}

#[test]
fn nested_gosub_overflows() {
    let mut b = script(&[]);
    b.label("rec").op(0x0050).label_ref("rec");
    let mut vm = boot(&b);
    vm.run(CALL_STACK_DEPTH as u64).unwrap();
    assert_eq!(
        run_expect_err(&mut vm),
        VMError::CallStackOverflow {
            depth: CALL_STACK_DEPTH
        }
    );
}

// ==================== Transactional ticks ====================

fn failing_registry() -> OpcodeRegistry {
    let mut builder = OpcodeRegistry::builder();
    builder.with_builtins().unwrap();
    builder
        .bind(
            OpcodeDefinition::new(
                OpcodeId(0x0A00),
                "poke_then_fail",
                vec![Param::single("var", TypeConstraint::Var)],
            ),
            handler_fn(|ctx, args| {
                ctx.assign(args.var("var")?, Value::Int(99))?;
                ctx.open_conditions(2, Combine::All)?;
                let pc = ctx.address();
                ctx.start_thread(pc, false)?;
                ctx.set_pc(pc)?;
                Err(VMError::AssertionFailure {
                    opcode: ctx.opcode(),
                    message: "boom".to_string(),
                })
            }),
        )
        .unwrap();
    builder.build().unwrap()
}

#[test]
fn failed_handler_rolls_back_every_effect() {
    let mut b = script(&[]);
    b.op(0x0A00).global(G0);
    b.op(0x004E);
    let mut vm = load_with(&b, failing_registry(), VmConfig::default());
    vm.run(HEADER_TICKS).unwrap();

    let err = run_expect_err(&mut vm);
    assert!(matches!(err, VMError::AssertionFailure { .. }));
    assert_eq!(global(&vm, G0), 0);
    assert!(vm.memory().allocation(G0 as usize).is_none());
    assert_eq!(vm.threads().len(), 1);
    assert_eq!(vm.current_thread().unwrap().pc, b.address("main"));
}

#[test]
fn decode_failure_leaves_state_unchanged() {
    let mut b = script(&[]);
    b.op(0x004E);
    let mut vm = boot(&b);
    // Global storage is zero-filled, and opcode 0000 is not registered.
    vm.set_thread_pc(0, G0 as usize).unwrap();
    assert_eq!(
        run_expect_err(&mut vm),
        VMError::UnknownOpcode {
            opcode: OpcodeId(0x0000),
            address: G0 as usize
        }
    );
    vm.set_thread_pc(0, b.address("main")).unwrap();
    vm.tick().unwrap();
}

#[test]
fn set_thread_pc_checks_bounds() {
    let mut b = script(&[]);
    b.op(0x004E);
    let mut vm = load(&b);
    let size = vm.memory().size();
    assert!(matches!(
        vm.set_thread_pc(0, size),
        Err(VMError::OutOfBoundsAccess { .. })
    ));
    assert_eq!(vm.set_thread_pc(5, 0), Err(VMError::NoThreads));
}

#[test]
fn dirty_ranges_cover_only_last_tick() {
    let mut b = script(&[]);
    b.op(0x0004).global(G0).int8(1);
    b.op(0x0001).int8(0);
    b.op(0x004E);
    let mut vm = boot(&b);

    vm.tick().unwrap();
    assert_eq!(vm.snapshot().dirty, vec![G0 as usize..G0 as usize + 4]);
    vm.tick().unwrap();
    assert!(vm.snapshot().dirty.is_empty());
}

#[test]
fn replay_is_deterministic() {
    let mut b = script(&["m0"]);
    b.op(0x00D7).label_ref("worker");
    b.op(0x0417).int8(0);
    b.label("main_loop").op(0x0008).global(G0).int8(3);
    b.op(0x0001).int8(2);
    b.op(0x0002).label_ref("main_loop");
    b.label("worker").op(0x0008).global(G1).int8(1);
    b.op(0x0001).int8(5);
    b.op(0x0002).label_ref("worker");
    b.label("m0").op(0x0006).local(0).int8(1);
    b.label("m_loop").op(0x0008).local(0).int8(2);
    let offset = (b.address("m_loop") - b.address("m0")) as i32;
    b.op(0x0001).int8(1);
    b.op(0x0002).int32(-offset);

    let run = || {
        let mut vm = load(&b);
        vm.run(200).unwrap();
        vm.snapshot()
    };
    let first = run();
    let second = run();
    assert_eq!(first, second);
    assert_eq!(first.threads.len(), 3);
    assert_eq!(first.tick, 200);
}

#[test]
fn snapshot_lists_threads() {
    let mut b = script(&[]);
    b.op(0x00D7).label_ref("worker");
    b.op(0x004E);
    b.label("worker").op(0x03A4).string8("worker");
    b.op(0x004E);
    let mut vm = boot(&b);
    vm.run(2).unwrap();

    let snapshot = vm.snapshot();
    assert_eq!(snapshot.current_thread, Some(1));
    assert_eq!(snapshot.pc, Some(b.address("worker") + 11));
    assert_eq!(snapshot.threads.len(), 2);
    assert_eq!(snapshot.threads[1].name.as_deref(), Some("worker"));
    assert_eq!(snapshot.memory_digest, vm.memory().digest());
}
