//! Typed binary and unary operation dispatch.
//!
//! Binary opcodes carry a type-pair byte selecting a cell of a 7×7
//! table keyed by (left type, right type); unary opcodes carry a
//! single type. Unknown combinations collapse to one "unknown
//! operation" branch that consumes nothing.
//!
//! Operands are popped right first, then left. A pair function that
//! does not recognize the opcode still consumes its operands; this
//! mirrors the dispatch contract the compiler relies on.

use log::debug;

use crate::heap;
use crate::memory::MemoryImage;
use crate::op_code::OpCode;
use crate::value::{ScriptValue, TypeTag};

/// Dispatches one binary operation by type pair.
pub(crate) fn binary_operation(
    memory: &mut MemoryImage,
    left: TypeTag,
    right: TypeTag,
    opcode: OpCode,
) {
    use TypeTag::*;
    match (left, right) {
        (Integer, Integer) => integer_integer(memory, opcode),
        (Integer, FloatingPoint) => integer_float(memory, opcode),
        (Integer, Vector) => integer_vector(memory, opcode),
        (FloatingPoint, Integer) => float_integer(memory, opcode),
        (FloatingPoint, FloatingPoint) => float_float(memory, opcode),
        (FloatingPoint, Vector) => float_vector(memory, opcode),
        (String, String) | (String, Key) | (Key, String) | (Key, Key) => {
            string_compare(memory, left, right, opcode)
        }
        (Vector, Integer) => vector_integer(memory, opcode),
        (Vector, FloatingPoint) => vector_float(memory, opcode),
        (Vector, Vector) => vector_vector(memory, opcode),
        (Vector, Quaternion) => vector_quaternion(memory, opcode),
        (Quaternion, Quaternion) => quaternion_quaternion(memory, opcode),
        (Integer, List)
        | (FloatingPoint, List)
        | (String, List)
        | (Key, List)
        | (Vector, List)
        | (Quaternion, List) => element_list(memory, left, opcode),
        (List, Integer)
        | (List, FloatingPoint)
        | (List, String)
        | (List, Key)
        | (List, Vector)
        | (List, Quaternion) => list_element(memory, right, opcode),
        (List, List) => list_list(memory, opcode),
        _ => unknown_operation(left, right, opcode),
    }
}

/// Dispatches one unary operation by type.
pub(crate) fn unary_operation(memory: &mut MemoryImage, tag: TypeTag, opcode: OpCode) {
    match tag {
        TypeTag::Integer => integer_unary(memory, opcode),
        TypeTag::FloatingPoint => float_unary(memory, opcode),
        TypeTag::Vector => vector_unary(memory, opcode),
        TypeTag::Quaternion => quaternion_unary(memory, opcode),
        _ => debug!("unknown unary operation on {}", tag.name()),
    }
}

fn unknown_operation(left: TypeTag, right: TypeTag, opcode: OpCode) {
    debug!(
        "unknown arithmetic operation {} on ({}, {})",
        opcode.mnemonic(),
        left.name(),
        right.name()
    );
}

fn integer_integer(memory: &mut MemoryImage, opcode: OpCode) {
    let rside = memory.pop_i32();
    let lside = memory.pop_i32();
    let mut result = 0;

    match opcode {
        OpCode::Add => result = lside.wrapping_add(rside),
        OpCode::Sub => result = lside.wrapping_sub(rside),
        OpCode::Mul => result = lside.wrapping_mul(rside),
        OpCode::Div => {
            if rside != 0 {
                result = lside.wrapping_div(rside);
            } else {
                memory.set_fault(crate::error::FaultKind::Math);
            }
        }
        OpCode::Mod => {
            if rside != 0 {
                result = lside.wrapping_rem(rside);
            } else {
                memory.set_fault(crate::error::FaultKind::Math);
            }
        }
        OpCode::Eq => result = i32::from(lside == rside),
        OpCode::Neq => result = i32::from(lside != rside),
        OpCode::Leq => result = i32::from(lside <= rside),
        OpCode::Geq => result = i32::from(lside >= rside),
        OpCode::Less => result = i32::from(lside < rside),
        OpCode::Greater => result = i32::from(lside > rside),
        OpCode::BitAnd => result = lside & rside,
        OpCode::BitOr => result = lside | rside,
        OpCode::BitXor => result = lside ^ rside,
        OpCode::BoolAnd => result = i32::from(lside != 0 && rside != 0),
        OpCode::BoolOr => result = i32::from(lside != 0 || rside != 0),
        OpCode::Shl => result = lside.wrapping_shl(rside as u32),
        OpCode::Shr => result = lside.wrapping_shr(rside as u32),
        _ => {}
    }
    memory.push_i32(result);
}

fn integer_float(memory: &mut MemoryImage, opcode: OpCode) {
    let rside = memory.pop_f32();
    let lside = memory.pop_i32() as f32;
    numeric_float(memory, lside, rside, opcode);
}

fn float_integer(memory: &mut MemoryImage, opcode: OpCode) {
    let rside = memory.pop_i32() as f32;
    let lside = memory.pop_f32();
    numeric_float(memory, lside, rside, opcode);
}

fn float_float(memory: &mut MemoryImage, opcode: OpCode) {
    let rside = memory.pop_f32();
    let lside = memory.pop_f32();
    numeric_float(memory, lside, rside, opcode);
}

/// Shared float arithmetic: the left operand has already been promoted.
fn numeric_float(memory: &mut MemoryImage, lside: f32, rside: f32, opcode: OpCode) {
    match opcode {
        OpCode::Add => memory.push_f32(lside + rside),
        OpCode::Sub => memory.push_f32(lside - rside),
        OpCode::Mul => memory.push_f32(lside * rside),
        OpCode::Div => {
            let mut result = 0.0;
            if rside != 0.0 {
                result = lside / rside;
            } else {
                memory.set_fault(crate::error::FaultKind::Math);
            }
            memory.push_f32(result);
        }
        OpCode::Eq => memory.push_i32(i32::from(lside == rside)),
        OpCode::Neq => memory.push_i32(i32::from(lside != rside)),
        OpCode::Leq => memory.push_i32(i32::from(lside <= rside)),
        OpCode::Geq => memory.push_i32(i32::from(lside >= rside)),
        OpCode::Less => memory.push_i32(i32::from(lside < rside)),
        OpCode::Greater => memory.push_i32(i32::from(lside > rside)),
        _ => {}
    }
}

fn integer_vector(memory: &mut MemoryImage, opcode: OpCode) {
    let rside = memory.pop_vector();
    let lside = memory.pop_i32();
    if opcode == OpCode::Mul {
        memory.push_vector(rside.scale(lside as f32));
    }
}

fn float_vector(memory: &mut MemoryImage, opcode: OpCode) {
    let rside = memory.pop_vector();
    let lside = memory.pop_f32();
    if opcode == OpCode::Mul {
        memory.push_vector(rside.scale(lside));
    }
}

/// String and key comparisons are all payload-byte compares; the cross
/// pairs never concatenate.
fn string_compare(memory: &mut MemoryImage, left: TypeTag, right: TypeTag, opcode: OpCode) {
    let rside = memory.pop_i32();
    let lside = memory.pop_i32();
    match opcode {
        OpCode::Add if left == TypeTag::String && right == TypeTag::String => {
            let max = memory.max_heap_size();
            let address = heap::cat_strings(memory, lside, rside, max);
            memory.push_i32(address);
        }
        OpCode::Eq => {
            let result = i32::from(heap::cmp_strings(memory, lside, rside) == 0);
            memory.push_i32(result);
        }
        OpCode::Neq => {
            let result = heap::cmp_strings(memory, lside, rside);
            memory.push_i32(result);
        }
        _ => {}
    }
}

fn vector_integer(memory: &mut MemoryImage, opcode: OpCode) {
    let rside = memory.pop_i32();
    let lside = memory.pop_vector();
    match opcode {
        OpCode::Mul => memory.push_vector(lside.scale(rside as f32)),
        OpCode::Div => {
            let mut result = lside;
            if rside != 0 {
                result = lside.scale(1.0 / rside as f32);
            } else {
                memory.set_fault(crate::error::FaultKind::Math);
            }
            memory.push_vector(result);
        }
        _ => {}
    }
}

fn vector_float(memory: &mut MemoryImage, opcode: OpCode) {
    let rside = memory.pop_f32();
    let lside = memory.pop_vector();
    match opcode {
        OpCode::Mul => memory.push_vector(lside.scale(rside)),
        OpCode::Div => {
            let mut result = lside;
            if rside != 0.0 {
                result = lside.scale(1.0 / rside);
            } else {
                memory.set_fault(crate::error::FaultKind::Math);
            }
            memory.push_vector(result);
        }
        _ => {}
    }
}

fn vector_vector(memory: &mut MemoryImage, opcode: OpCode) {
    let rside = memory.pop_vector();
    let lside = memory.pop_vector();
    match opcode {
        OpCode::Add => memory.push_vector(lside + rside),
        OpCode::Sub => memory.push_vector(lside - rside),
        OpCode::Mul => memory.push_f32(lside.dot(rside)),
        OpCode::Mod => memory.push_vector(lside.cross(rside)),
        OpCode::Eq => memory.push_i32(i32::from(lside == rside)),
        OpCode::Neq => memory.push_i32(i32::from(lside != rside)),
        _ => {}
    }
}

fn vector_quaternion(memory: &mut MemoryImage, opcode: OpCode) {
    let rside = memory.pop_quaternion();
    let lside = memory.pop_vector();
    match opcode {
        OpCode::Mul => memory.push_vector(lside.rotate(rside)),
        OpCode::Div => memory.push_vector(lside.rotate(rside.conjugate())),
        _ => {}
    }
}

fn quaternion_quaternion(memory: &mut MemoryImage, opcode: OpCode) {
    let rside = memory.pop_quaternion();
    let lside = memory.pop_quaternion();
    match opcode {
        OpCode::Add => memory.push_quaternion(lside + rside),
        OpCode::Sub => memory.push_quaternion(lside - rside),
        OpCode::Mul => memory.push_quaternion(lside * rside),
        OpCode::Div => memory.push_quaternion(lside * rside.conjugate()),
        OpCode::Eq => memory.push_i32(i32::from(lside == rside)),
        OpCode::Neq => memory.push_i32(i32::from(lside != rside)),
        _ => {}
    }
}

/// `X + list` prepends the left element to the right list.
fn element_list(memory: &mut MemoryImage, left: TypeTag, opcode: OpCode) {
    let list = memory.pop_i32();
    let element = pop_element(memory, left);
    if opcode == OpCode::Add {
        let max = memory.max_heap_size();
        let address = heap::preadd_list(memory, element, list, max);
        memory.push_i32(address);
    }
}

/// `list + X` appends the right element to the left list.
fn list_element(memory: &mut MemoryImage, right: TypeTag, opcode: OpCode) {
    let element = pop_element(memory, right);
    let list = memory.pop_i32();
    if opcode == OpCode::Add {
        let max = memory.max_heap_size();
        let address = heap::postadd_list(memory, list, element, max);
        memory.push_i32(address);
    }
}

fn list_list(memory: &mut MemoryImage, opcode: OpCode) {
    let rside = memory.pop_i32();
    let lside = memory.pop_i32();
    match opcode {
        OpCode::Add => {
            let max = memory.max_heap_size();
            let address = heap::cat_lists(memory, lside, rside, max);
            memory.push_i32(address);
        }
        OpCode::Eq => {
            let result = i32::from(heap::cmp_lists(memory, lside, rside) == 0);
            memory.push_i32(result);
        }
        OpCode::Neq => {
            let result = heap::cmp_lists(memory, lside, rside);
            memory.push_i32(result);
        }
        _ => {}
    }
}

/// Pops one stack operand into its owned form, releasing any heap
/// reference it carried. Also used by library-call marshaling.
pub(crate) fn pop_element(memory: &mut MemoryImage, tag: TypeTag) -> ScriptValue {
    match tag {
        TypeTag::FloatingPoint => ScriptValue::Float(memory.pop_f32()),
        TypeTag::String | TypeTag::Key => {
            let address = memory.pop_i32();
            let value = heap::heap_get(memory, address, true)
                .unwrap_or_else(|| ScriptValue::String(String::new()));
            if address != 0 {
                heap::dec_ref(memory, address);
            }
            value.coerce_tag(tag)
        }
        TypeTag::Vector => ScriptValue::Vector(memory.pop_vector()),
        TypeTag::Quaternion => ScriptValue::Quaternion(memory.pop_quaternion()),
        _ => ScriptValue::Integer(memory.pop_i32()),
    }
}

fn integer_unary(memory: &mut MemoryImage, opcode: OpCode) {
    let lside = memory.pop_i32();
    let result = match opcode {
        OpCode::Neg => lside.wrapping_neg(),
        OpCode::BitNot => !lside,
        OpCode::BoolNot => i32::from(lside == 0),
        _ => 0,
    };
    memory.push_i32(result);
}

fn float_unary(memory: &mut MemoryImage, opcode: OpCode) {
    let lside = memory.pop_f32();
    if opcode == OpCode::Neg {
        memory.push_f32(-lside);
    }
}

fn vector_unary(memory: &mut MemoryImage, opcode: OpCode) {
    let lside = memory.pop_vector();
    if opcode == OpCode::Neg {
        memory.push_vector(-lside);
    }
}

fn quaternion_unary(memory: &mut MemoryImage, opcode: OpCode) {
    let lside = memory.pop_quaternion();
    if opcode == OpCode::Neg {
        memory.push_quaternion(-lside);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaultKind;
    use crate::memory::{Register, HEADER_SIZE, VERSION_2};
    use crate::value::{Quaternion, Vector3};

    fn image() -> MemoryImage {
        let size = 1024i32;
        let mut buffer = vec![0u8; size as usize];
        buffer[0..4].copy_from_slice(&size.to_be_bytes());
        let mut memory = MemoryImage::from_bytes(buffer).expect("valid image");
        memory.set_register(Register::Vn, VERSION_2);
        memory.set_register(Register::Hr, HEADER_SIZE);
        memory.set_register(Register::Hp, HEADER_SIZE);
        memory.set_register(Register::Sp, size);
        memory.set_register(Register::Bp, size);
        memory
    }

    #[test]
    fn integer_addition() {
        let mut memory = image();
        memory.push_i32(5);
        memory.push_i32(5);
        binary_operation(&mut memory, TypeTag::Integer, TypeTag::Integer, OpCode::Add);
        assert_eq!(memory.pop_i32(), 10);
        assert_eq!(memory.fault(), None);
    }

    #[test]
    fn division_by_zero_pushes_default_and_faults() {
        let mut memory = image();
        let sp0 = memory.get_register(Register::Sp);
        memory.push_i32(7);
        memory.push_i32(0);
        binary_operation(&mut memory, TypeTag::Integer, TypeTag::Integer, OpCode::Div);
        assert_eq!(memory.fault(), Some(FaultKind::Math));
        assert_eq!(memory.pop_i32(), 0);
        assert_eq!(memory.get_register(Register::Sp), sp0);
    }

    #[test]
    fn float_division_by_zero_faults() {
        let mut memory = image();
        memory.push_f32(7.0);
        memory.push_f32(0.0);
        binary_operation(
            &mut memory,
            TypeTag::FloatingPoint,
            TypeTag::FloatingPoint,
            OpCode::Div,
        );
        assert_eq!(memory.fault(), Some(FaultKind::Math));
        assert_eq!(memory.pop_f32(), 0.0);
    }

    #[test]
    fn mixed_numeric_promotes_to_float() {
        let mut memory = image();
        memory.push_i32(3);
        memory.push_f32(0.5);
        binary_operation(
            &mut memory,
            TypeTag::Integer,
            TypeTag::FloatingPoint,
            OpCode::Mul,
        );
        assert_eq!(memory.pop_f32(), 1.5);
    }

    #[test]
    fn shift_counts_wrap_like_the_hardware() {
        let mut memory = image();
        memory.push_i32(1);
        memory.push_i32(33);
        binary_operation(&mut memory, TypeTag::Integer, TypeTag::Integer, OpCode::Shl);
        assert_eq!(memory.pop_i32(), 2);
    }

    #[test]
    fn vector_dot_and_cross() {
        let mut memory = image();
        memory.push_vector(Vector3::new(1.0, 2.0, 3.0));
        memory.push_vector(Vector3::new(4.0, 5.0, 6.0));
        binary_operation(&mut memory, TypeTag::Vector, TypeTag::Vector, OpCode::Mul);
        assert_eq!(memory.pop_f32(), 32.0);

        memory.push_vector(Vector3::new(1.0, 0.0, 0.0));
        memory.push_vector(Vector3::new(0.0, 1.0, 0.0));
        binary_operation(&mut memory, TypeTag::Vector, TypeTag::Vector, OpCode::Mod);
        assert_eq!(memory.pop_vector(), Vector3::new(0.0, 0.0, 1.0));
    }

    #[test]
    fn vector_scale_by_zero_integer_faults() {
        let mut memory = image();
        memory.push_vector(Vector3::new(2.0, 4.0, 6.0));
        memory.push_i32(0);
        binary_operation(&mut memory, TypeTag::Vector, TypeTag::Integer, OpCode::Div);
        assert_eq!(memory.fault(), Some(FaultKind::Math));
        // The unscaled operand is still pushed.
        assert_eq!(memory.pop_vector(), Vector3::new(2.0, 4.0, 6.0));
    }

    #[test]
    fn quaternion_div_is_conjugate_multiply() {
        let mut memory = image();
        let q = Quaternion::new(0.0, 0.0, 0.5f32.sqrt(), 0.5f32.sqrt());
        memory.push_quaternion(q);
        memory.push_quaternion(q);
        binary_operation(
            &mut memory,
            TypeTag::Quaternion,
            TypeTag::Quaternion,
            OpCode::Div,
        );
        let result = memory.pop_quaternion();
        assert!((result.x).abs() < 1e-6);
        assert!((result.y).abs() < 1e-6);
        assert!((result.z).abs() < 1e-6);
        assert!((result.s - 1.0).abs() < 1e-6);
    }

    #[test]
    fn integer_prepends_to_list() {
        let mut memory = image();
        let max = memory.max_heap_size();
        let list = heap::heap_add(
            &mut memory,
            &ScriptValue::List(vec![ScriptValue::Integer(2)]),
            max,
            true,
        );
        memory.push_i32(1);
        memory.push_i32(list);
        binary_operation(&mut memory, TypeTag::Integer, TypeTag::List, OpCode::Add);
        let result = memory.pop_i32();
        assert_eq!(
            heap::heap_get(&mut memory, result, true),
            Some(ScriptValue::List(vec![
                ScriptValue::Integer(1),
                ScriptValue::Integer(2),
            ]))
        );
    }

    #[test]
    fn list_appends_string_element() {
        let mut memory = image();
        let max = memory.max_heap_size();
        let list = heap::heap_add(&mut memory, &ScriptValue::List(vec![]), max, true);
        let text = heap::heap_add(&mut memory, &ScriptValue::String("tail".into()), max, true);
        memory.push_i32(list);
        memory.push_i32(text);
        binary_operation(&mut memory, TypeTag::List, TypeTag::String, OpCode::Add);
        let result = memory.pop_i32();
        assert_eq!(
            heap::heap_get(&mut memory, result, true),
            Some(ScriptValue::List(vec![ScriptValue::String("tail".into())]))
        );
        assert_eq!(memory.fault(), None);
    }

    #[test]
    fn unknown_pair_consumes_nothing() {
        let mut memory = image();
        memory.push_i32(9);
        let sp = memory.get_register(Register::Sp);
        binary_operation(&mut memory, TypeTag::Key, TypeTag::Vector, OpCode::Add);
        assert_eq!(memory.get_register(Register::Sp), sp);
        assert_eq!(memory.pop_i32(), 9);
    }

    #[test]
    fn boolean_not() {
        let mut memory = image();
        memory.push_i32(0);
        unary_operation(&mut memory, TypeTag::Integer, OpCode::BoolNot);
        assert_eq!(memory.pop_i32(), 1);
        memory.push_i32(17);
        unary_operation(&mut memory, TypeTag::Integer, OpCode::BoolNot);
        assert_eq!(memory.pop_i32(), 0);
    }
}
