//! Interpreter scenarios: handler frames, calls, faults, casts,
//! materialization.

use uuid::Uuid;

use super::{run_to_idle, SharedBuf};
use crate::builder::{CodeBuf, ImageBuilder, StateDef};
use crate::error::FaultKind;
use crate::event::EventKind;
use crate::op_code::OpCode;
use crate::value::TypeTag;
use crate::vm::StepStatus;
use crate::ScriptVm;

fn vm_with_entry_handler(code: CodeBuf) -> ScriptVm {
    let mut builder = ImageBuilder::new();
    builder.add_state(StateDef::new().on(EventKind::StateEntry, 64, code));
    ScriptVm::new(builder.build().expect("image builds")).expect("image loads")
}

fn handler_tail(code: &mut CodeBuf) {
    code.end_handler();
}

#[test]
fn state_entry_handler_prints_forty_two() {
    let mut code = CodeBuf::new();
    code.push_integer(42).print(TypeTag::Integer);
    handler_tail(&mut code);

    let mut vm = vm_with_entry_handler(code);
    let out = SharedBuf::new();
    vm.set_print_writer(Box::new(out.clone()));

    run_to_idle(&mut vm, 100);

    assert!(out.contents().contains("42"));
    let registers = vm.registers();
    assert_eq!(registers.ip, 0);
    assert_eq!(registers.ce, 0);
    assert_eq!(registers.fr, 0);
}

#[test]
fn call_and_return_balance_ip_and_bp() {
    let mut builder = ImageBuilder::new();

    // Function: push two fives, add, stash the sum in the caller's
    // return slot.
    let mut function = CodeBuf::new();
    function.begin_function(24);
    function.push_integer(5).push_integer(5).binary(
        OpCode::Add,
        TypeTag::Integer,
        TypeTag::Integer,
    );
    function.store_return(0);
    function.end_function(24);
    let index = builder.add_function(function);

    // Handler: reserve the return slot, call, print what came back.
    let mut code = CodeBuf::new();
    code.emit(OpCode::PushE).call(index).print(TypeTag::Integer);
    handler_tail(&mut code);
    builder.add_state(StateDef::new().on(EventKind::StateEntry, 64, code));

    let mut vm = ScriptVm::new(builder.build().expect("image builds")).expect("image loads");
    let out = SharedBuf::new();
    let trace = SharedBuf::new();
    vm.set_print_writer(Box::new(out.clone()));
    vm.set_trace_writer(Box::new(trace.clone()));

    let actor = Uuid::nil();
    for _ in 0..200 {
        if vm.fault().is_some() || vm.is_idle() {
            break;
        }
        vm.step(true, &actor);
    }

    assert!(out.contents().contains("10"));
    assert_eq!(vm.fault(), None);
    assert_eq!(vm.registers().ip, 0);

    let trace = trace.contents();
    assert_eq!(trace.matches("PUSHARGI 5").count(), 2);
    assert_eq!(trace.matches("ADD integer, integer").count(), 1);
    assert!(trace.contains("CALL 0"));
    assert!(trace.contains("RETURN"));
}

#[test]
fn division_by_zero_latches_math_fault() {
    let mut code = CodeBuf::new();
    code.push_integer(7).push_integer(0).binary(
        OpCode::Div,
        TypeTag::Integer,
        TypeTag::Integer,
    );
    handler_tail(&mut code);

    let mut vm = vm_with_entry_handler(code);
    let actor = Uuid::nil();
    for _ in 0..10 {
        if vm.fault().is_some() {
            break;
        }
        vm.step(false, &actor);
    }

    assert_eq!(vm.fault(), Some(FaultKind::Math));
    assert_eq!(vm.fault_message(), "Math Error");
    assert_eq!(vm.registers().fr, FaultKind::Math.code());

    // Subsequent steps return immediately without executing anything.
    let count = vm.instruction_count();
    assert_eq!(vm.step(false, &actor), StepStatus::NO_DELETE);
    assert_eq!(vm.instruction_count(), count);
}

#[test]
fn integer_string_cast_round_trips_through_hex() {
    let mut code = CodeBuf::new();
    code.push_integer(42)
        .cast(TypeTag::Integer, TypeTag::String)
        .cast(TypeTag::String, TypeTag::Integer)
        .print(TypeTag::Integer);
    code.push_string("0x2A")
        .cast(TypeTag::String, TypeTag::Integer)
        .print(TypeTag::Integer);
    handler_tail(&mut code);

    let mut vm = vm_with_entry_handler(code);
    let out = SharedBuf::new();
    vm.set_print_writer(Box::new(out.clone()));
    run_to_idle(&mut vm, 200);

    assert_eq!(out.contents(), "42\n42\n");
    assert_eq!(vm.fault(), None);
}

#[test]
fn float_string_cast_agrees_to_six_decimals() {
    let mut code = CodeBuf::new();
    code.push_float(1.5)
        .cast(TypeTag::FloatingPoint, TypeTag::String)
        .cast(TypeTag::String, TypeTag::FloatingPoint)
        .print(TypeTag::FloatingPoint);
    handler_tail(&mut code);

    let mut vm = vm_with_entry_handler(code);
    let out = SharedBuf::new();
    vm.set_print_writer(Box::new(out.clone()));
    run_to_idle(&mut vm, 100);

    assert_eq!(out.contents(), "1.500000\n");
}

#[test]
fn jumpnif_skips_on_falsy_integer() {
    let mut code = CodeBuf::new();
    code.push_integer(0);
    // Skip the 5-byte push of 99 when the popped value is falsy.
    code.jump_nif(TypeTag::Integer, 5);
    code.push_integer(99);
    code.push_integer(1).print(TypeTag::Integer);
    handler_tail(&mut code);

    let mut vm = vm_with_entry_handler(code);
    let out = SharedBuf::new();
    vm.set_print_writer(Box::new(out.clone()));
    run_to_idle(&mut vm, 100);

    assert_eq!(out.contents(), "1\n");
}

#[test]
fn jumpif_on_list_tests_emptiness() {
    let mut code = CodeBuf::new();
    // An empty list is falsy: the jump is not taken.
    code.emit(OpCode::StackToL).emit_i32(0);
    code.jump_if(TypeTag::List, 5);
    code.push_integer(7).print(TypeTag::Integer);
    handler_tail(&mut code);

    let mut vm = vm_with_entry_handler(code);
    let out = SharedBuf::new();
    vm.set_print_writer(Box::new(out.clone()));
    run_to_idle(&mut vm, 100);

    assert_eq!(out.contents(), "7\n");
    assert_eq!(vm.fault(), None);
}

#[test]
fn stack_to_list_materializes_top_first() {
    let mut code = CodeBuf::new();
    code.push_integer(7).push_byte(TypeTag::Integer as u8);
    code.push_integer(8).push_byte(TypeTag::Integer as u8);
    code.emit(OpCode::StackToL).emit_i32(2);
    code.print(TypeTag::List);
    handler_tail(&mut code);

    let mut vm = vm_with_entry_handler(code);
    let out = SharedBuf::new();
    vm.set_print_writer(Box::new(out.clone()));
    run_to_idle(&mut vm, 100);

    assert_eq!(out.contents(), "list\n8\n7\n");
}

#[test]
fn nesting_a_list_inside_a_list_faults() {
    let mut code = CodeBuf::new();
    // Inner list on the heap, tagged as a list element of the outer.
    code.emit(OpCode::StackToL).emit_i32(0);
    code.push_byte(TypeTag::List as u8);
    code.emit(OpCode::StackToL).emit_i32(1);
    handler_tail(&mut code);

    let mut vm = vm_with_entry_handler(code);
    let actor = Uuid::nil();
    for _ in 0..20 {
        if vm.fault().is_some() {
            break;
        }
        vm.step(false, &actor);
    }
    assert_eq!(vm.fault(), Some(FaultKind::NestingLists));
    assert_eq!(vm.fault_message(), "Lists may not contain lists");
}

#[test]
fn stack_to_string_assembles_bytes() {
    let mut code = CodeBuf::new();
    code.push_byte(b'A').push_byte(b'B');
    code.push_integer(2);
    code.emit(OpCode::StackToS);
    code.print(TypeTag::String);
    handler_tail(&mut code);

    let mut vm = vm_with_entry_handler(code);
    let out = SharedBuf::new();
    vm.set_print_writer(Box::new(out.clone()));
    run_to_idle(&mut vm, 100);

    assert_eq!(out.contents(), "AB\n");
}

#[test]
fn string_concatenation_through_the_operand_stack() {
    let mut code = CodeBuf::new();
    // The right operand is pushed last and popped first.
    code.push_string("ab");
    code.push_string("cd");
    code.binary(OpCode::Add, TypeTag::String, TypeTag::String);
    code.print(TypeTag::String);
    handler_tail(&mut code);

    let mut vm = vm_with_entry_handler(code);
    let out = SharedBuf::new();
    vm.set_print_writer(Box::new(out.clone()));
    run_to_idle(&mut vm, 100);

    assert_eq!(out.contents(), "abcd\n");
    assert_eq!(vm.fault(), None);
}

#[test]
fn unmapped_opcode_is_a_no_op() {
    let mut code = CodeBuf::new();
    code.emit_byte(0x0B);
    code.push_integer(3).print(TypeTag::Integer);
    handler_tail(&mut code);

    let mut vm = vm_with_entry_handler(code);
    let out = SharedBuf::new();
    vm.set_print_writer(Box::new(out.clone()));
    run_to_idle(&mut vm, 100);

    assert_eq!(out.contents(), "3\n");
    assert_eq!(vm.fault(), None);
}

#[test]
fn version_one_images_execute_with_narrow_masks() {
    let mut builder = ImageBuilder::new().version(crate::memory::VERSION_1_END);
    let mut code = CodeBuf::new();
    code.push_integer(11).print(TypeTag::Integer);
    handler_tail(&mut code);
    builder.add_state(StateDef::new().on(EventKind::StateEntry, 32, code));

    let mut vm = ScriptVm::new(builder.build().expect("image builds")).expect("image loads");
    let out = SharedBuf::new();
    vm.set_print_writer(Box::new(out.clone()));
    run_to_idle(&mut vm, 100);

    assert_eq!(out.contents(), "11\n");
    assert_eq!(vm.fault(), None);
}

#[test]
fn host_asserted_faults_stop_execution() {
    let mut code = CodeBuf::new();
    code.push_integer(1).print(TypeTag::Integer);
    handler_tail(&mut code);

    let mut vm = vm_with_entry_handler(code);
    vm.raise_fault(FaultKind::Sandbox);
    assert_eq!(vm.step(false, &Uuid::nil()), StepStatus::NO_DELETE);
    assert_eq!(vm.instruction_count(), 0);
    assert_eq!(vm.fault_message(), "Hit Sandbox Limit");

    vm.clear_fault();
    run_to_idle(&mut vm, 100);
    assert_eq!(vm.fault(), None);
}

#[test]
fn unknown_version_marker_faults() {
    let mut builder = ImageBuilder::new().version(0x0300);
    let mut code = CodeBuf::new();
    handler_tail(&mut code);
    builder.add_state(StateDef::new().on(EventKind::StateEntry, 32, code));

    let mut vm = ScriptVm::new(builder.build().expect("image builds")).expect("image loads");
    vm.step(false, &Uuid::nil());
    assert_eq!(vm.fault(), Some(FaultKind::VersionMismatch));
    assert_eq!(vm.fault_message(), "Version Mismatch");
}

#[test]
fn snapshot_and_restore_rewind_execution() {
    let mut code = CodeBuf::new();
    code.push_integer(42).print(TypeTag::Integer);
    handler_tail(&mut code);

    let mut vm = vm_with_entry_handler(code);
    let snapshot = vm.snapshot();
    run_to_idle(&mut vm, 100);
    assert_eq!(vm.registers().ip, 0);

    vm.restore(&snapshot).expect("restore succeeds");
    let restored = vm.registers();
    assert_eq!(restored.ce, EventKind::StateEntry.bit());
    assert_eq!(restored.fr, 0);

    // The restored image runs again from the start.
    let out = SharedBuf::new();
    vm.set_print_writer(Box::new(out.clone()));
    run_to_idle(&mut vm, 100);
    assert!(out.contents().contains("42"));
}

#[test]
fn energy_is_debited_per_instruction() {
    let mut code = CodeBuf::new();
    code.emit(OpCode::Noop).emit(OpCode::Noop);
    handler_tail(&mut code);

    let mut vm = vm_with_entry_handler(code);
    let before = vm.energy();
    run_to_idle(&mut vm, 100);
    let executed = vm.instruction_count() as f32;
    let expected = before - executed * crate::vm::STEP_ENERGY_COST;
    // ESR lives near 10k where f32 steps are coarse; allow rounding.
    assert!((vm.energy() - expected).abs() < 0.05);
}
