//! The instruction interpreter: consumes one opcode at the current
//! instruction pointer, updates registers, and returns.
//!
//! Handlers manipulate a cursor that starts past the opcode byte and
//! is written back to IP afterwards, so control-flow opcodes simply
//! reassign it. Unmapped opcode bytes are no-ops that advance IP by
//! one.

use uuid::Uuid;

use crate::error::FaultKind;
use crate::heap;
use crate::memory::Register;
use crate::op_code::OpCode;
use crate::ops;
use crate::value::{
    key_is_truthy, parse_float_text, parse_integer_text, parse_quaternion_text,
    parse_vector_text, ScriptValue, TypeTag, Vector3,
};
use crate::vm::ScriptVm;

fn split_pair(byte: u8) -> (Option<TypeTag>, Option<TypeTag>) {
    (TypeTag::from_code(byte >> 4), TypeTag::from_code(byte & 0xF))
}

impl ScriptVm {
    /// Executes the instruction at `ip`. Returns true when the script
    /// has completed and should be deleted.
    pub(crate) fn execute_instruction(
        &mut self,
        ip: i32,
        major: u32,
        trace: bool,
        actor: &Uuid,
    ) -> bool {
        let mut cursor = ip;
        let byte = self.memory.next_u8(&mut cursor);
        match OpCode::from_byte(byte) {
            Some(op) => self.run_opcode(op, ip, &mut cursor, major, trace, actor),
            None => {
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\t<unmapped {byte:#04X}>"));
                }
            }
        }
        self.memory.set_register(Register::Ip, cursor);
        false
    }

    #[allow(clippy::too_many_lines)]
    fn run_opcode(
        &mut self,
        op: OpCode,
        ip: i32,
        cursor: &mut i32,
        major: u32,
        trace: bool,
        actor: &Uuid,
    ) {
        use OpCode::*;
        match op {
            Noop => {
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tNOOP"));
                }
            }

            // === Stack ===
            Pop => {
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tPOP"));
                }
                self.memory.pop_bytes(TypeTag::Integer.footprint());
            }
            PopS | PopL => {
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\t{}", op.mnemonic()));
                }
                let address = self.memory.pop_i32();
                if address != 0 {
                    heap::dec_ref(&mut self.memory, address);
                }
            }
            PopV => {
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tPOPV"));
                }
                self.memory.pop_bytes(TypeTag::Vector.footprint());
            }
            PopQ => {
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tPOPQ"));
                }
                self.memory.pop_bytes(TypeTag::Quaternion.footprint());
            }
            PopArg => {
                let arg = self.memory.next_i32(cursor);
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tPOPARG {arg}"));
                }
                self.memory.pop_bytes(arg);
            }
            PopIp => {
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tPOPIP"));
                }
                *cursor = self.memory.pop_i32();
            }
            PopBp => {
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tPOPBP"));
                }
                let bp = self.memory.pop_i32();
                self.memory.set_register(Register::Bp, bp);
            }
            PopSp => {
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tPOPSP"));
                }
                let sp = self.memory.pop_i32();
                self.memory.set_register(Register::Sp, sp);
            }
            PopSlr => {
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tPOPSLR"));
                }
                let slr = self.memory.pop_f32();
                self.memory.set_register_f32(Register::Slr, slr);
            }

            Dup | DupS | DupL => {
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\t{}", op.mnemonic()));
                }
                let sp = self.memory.get_register(Register::Sp);
                let value = self.memory.read_i32_at(sp);
                self.memory.push_i32(value);
                if matches!(op, DupS | DupL) {
                    heap::inc_ref(&mut self.memory, value);
                }
            }
            DupV => {
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tDUPV"));
                }
                let sp = self.memory.get_register(Register::Sp);
                let value = self.memory.read_vector_at(sp);
                self.memory.push_vector(value);
            }
            DupQ => {
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tDUPQ"));
                }
                let sp = self.memory.get_register(Register::Sp);
                let value = self.memory.read_quaternion_at(sp);
                self.memory.push_quaternion(value);
            }

            // === Stores (value stays on the stack) ===
            Store | StoreG => {
                let offset = self.memory.next_i32(cursor);
                if trace {
                    self.trace_line(format_args!(
                        "[{ip:#X}]\t{} {offset:#X}",
                        op.mnemonic()
                    ));
                }
                let sp = self.memory.get_register(Register::Sp);
                let value = self.memory.read_i32_at(sp);
                if op == Store {
                    self.memory.local_store(offset, value);
                } else {
                    self.memory.global_store(offset, value);
                }
            }
            StoreS | StoreL | StoreGS | StoreGL => {
                let offset = self.memory.next_i32(cursor);
                if trace {
                    self.trace_line(format_args!(
                        "[{ip:#X}]\t{} {offset:#X}",
                        op.mnemonic()
                    ));
                }
                let global = matches!(op, StoreGS | StoreGL);
                let sp = self.memory.get_register(Register::Sp);
                let value = self.memory.read_i32_at(sp);
                let old = if global {
                    self.memory.global_load(offset)
                } else {
                    self.memory.local_load(offset)
                };
                if global {
                    self.memory.global_store(offset, value);
                } else {
                    self.memory.local_store(offset, value);
                }
                heap::inc_ref(&mut self.memory, value);
                if old != 0 {
                    heap::dec_ref(&mut self.memory, old);
                }
            }
            StoreV | StoreGV => {
                let offset = self.memory.next_i32(cursor);
                if trace {
                    self.trace_line(format_args!(
                        "[{ip:#X}]\t{} {offset:#X}",
                        op.mnemonic()
                    ));
                }
                let sp = self.memory.get_register(Register::Sp);
                let value = self.memory.read_vector_at(sp);
                if op == StoreV {
                    self.memory.local_store_vector(offset, value);
                } else {
                    self.memory.global_store_vector(offset, value);
                }
            }
            StoreQ | StoreGQ => {
                let offset = self.memory.next_i32(cursor);
                if trace {
                    self.trace_line(format_args!(
                        "[{ip:#X}]\t{} {offset:#X}",
                        op.mnemonic()
                    ));
                }
                let sp = self.memory.get_register(Register::Sp);
                let value = self.memory.read_quaternion_at(sp);
                if op == StoreQ {
                    self.memory.local_store_quaternion(offset, value);
                } else {
                    self.memory.global_store_quaternion(offset, value);
                }
            }

            // === Stores (popping) ===
            LoadP | LoadGP => {
                let offset = self.memory.next_i32(cursor);
                if trace {
                    self.trace_line(format_args!(
                        "[{ip:#X}]\t{} {offset:#X}",
                        op.mnemonic()
                    ));
                }
                let value = self.memory.pop_i32();
                if op == LoadP {
                    self.memory.local_store(offset, value);
                } else {
                    self.memory.global_store(offset, value);
                }
            }
            LoadSP | LoadLP | LoadGSP | LoadGLP => {
                let offset = self.memory.next_i32(cursor);
                if trace {
                    self.trace_line(format_args!(
                        "[{ip:#X}]\t{} {offset:#X}",
                        op.mnemonic()
                    ));
                }
                let global = matches!(op, LoadGSP | LoadGLP);
                let value = self.memory.pop_i32();
                let old = if global {
                    self.memory.global_load(offset)
                } else {
                    self.memory.local_load(offset)
                };
                if old != 0 {
                    heap::dec_ref(&mut self.memory, old);
                }
                if global {
                    self.memory.global_store(offset, value);
                } else {
                    self.memory.local_store(offset, value);
                }
            }
            LoadVP | LoadGVP => {
                let offset = self.memory.next_i32(cursor);
                if trace {
                    self.trace_line(format_args!(
                        "[{ip:#X}]\t{} {offset:#X}",
                        op.mnemonic()
                    ));
                }
                let value = self.memory.pop_vector();
                if op == LoadVP {
                    self.memory.local_store_vector(offset, value);
                } else {
                    self.memory.global_store_vector(offset, value);
                }
            }
            LoadQP | LoadGQP => {
                let offset = self.memory.next_i32(cursor);
                if trace {
                    self.trace_line(format_args!(
                        "[{ip:#X}]\t{} {offset:#X}",
                        op.mnemonic()
                    ));
                }
                let value = self.memory.pop_quaternion();
                if op == LoadQP {
                    self.memory.local_store_quaternion(offset, value);
                } else {
                    self.memory.global_store_quaternion(offset, value);
                }
            }

            // === Pushes from variables ===
            Push | PushG | PushS | PushGS | PushL | PushGL => {
                let offset = self.memory.next_i32(cursor);
                if trace {
                    self.trace_line(format_args!(
                        "[{ip:#X}]\t{} {offset:#X}",
                        op.mnemonic()
                    ));
                }
                let global = matches!(op, PushG | PushGS | PushGL);
                let value = if global {
                    self.memory.global_load(offset)
                } else {
                    self.memory.local_load(offset)
                };
                self.memory.push_i32(value);
                if matches!(op, PushS | PushGS | PushL | PushGL) {
                    heap::inc_ref(&mut self.memory, value);
                }
            }
            PushV | PushGV => {
                let offset = self.memory.next_i32(cursor);
                if trace {
                    self.trace_line(format_args!(
                        "[{ip:#X}]\t{} {offset:#X}",
                        op.mnemonic()
                    ));
                }
                let value = if op == PushV {
                    self.memory.local_load_vector(offset)
                } else {
                    self.memory.global_load_vector(offset)
                };
                self.memory.push_vector(value);
            }
            PushQ | PushGQ => {
                let offset = self.memory.next_i32(cursor);
                if trace {
                    self.trace_line(format_args!(
                        "[{ip:#X}]\t{} {offset:#X}",
                        op.mnemonic()
                    ));
                }
                let value = if op == PushQ {
                    self.memory.local_load_quaternion(offset)
                } else {
                    self.memory.global_load_quaternion(offset)
                };
                self.memory.push_quaternion(value);
            }
            PushIp => {
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tPUSHIP"));
                }
                self.memory.push_i32(*cursor);
            }
            PushBp => {
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tPUSHBP"));
                }
                let bp = self.memory.get_register(Register::Bp);
                self.memory.push_i32(bp);
            }
            PushSp => {
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tPUSHSP"));
                }
                let sp = self.memory.get_register(Register::Sp);
                self.memory.push_i32(sp);
            }

            // === Immediate pushes ===
            PushArgB => {
                let arg = self.memory.next_u8(cursor);
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tPUSHARGB {arg}"));
                }
                self.memory.push_u8(arg);
            }
            PushArgI => {
                let arg = self.memory.next_i32(cursor);
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tPUSHARGI {arg}"));
                }
                self.memory.push_i32(arg);
            }
            PushArgF => {
                let arg = self.memory.next_f32(cursor);
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tPUSHARGF {arg}"));
                }
                self.memory.push_f32(arg);
            }
            PushArgS => {
                let text = self.memory.next_cstr(cursor);
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tPUSHARGS {text}"));
                }
                let max = self.memory.max_heap_size();
                let address =
                    heap::heap_add(&mut self.memory, &ScriptValue::String(text), max, true);
                self.memory.push_i32(address);
            }
            PushArgV => {
                let arg = self.memory.next_vector(cursor);
                if trace {
                    self.trace_line(format_args!(
                        "[{ip:#X}]\tPUSHARGV < {}, {}, {} >",
                        arg.x, arg.y, arg.z
                    ));
                }
                self.memory.push_vector(arg);
            }
            PushArgQ => {
                let arg = self.memory.next_quaternion(cursor);
                if trace {
                    self.trace_line(format_args!(
                        "[{ip:#X}]\tPUSHARGQ < {}, {}, {}, {} >",
                        arg.x, arg.y, arg.z, arg.s
                    ));
                }
                self.memory.push_quaternion(arg);
            }
            PushE => {
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tPUSHE"));
                }
                self.memory.push_zeroed(TypeTag::Integer.footprint());
            }
            PushEV => {
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tPUSHEV"));
                }
                self.memory.push_zeroed(TypeTag::Vector.footprint());
            }
            PushEQ => {
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tPUSHEQ"));
                }
                self.memory.push_zeroed(TypeTag::Quaternion.footprint());
            }
            PushArgE => {
                let arg = self.memory.next_i32(cursor);
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tPUSHARGE {arg}"));
                }
                self.memory.push_zeroed(arg);
            }

            // === Binary arithmetic ===
            Add | Sub | Mul | Div | Mod | Eq | Neq | Leq | Geq | Less | Greater | BitAnd
            | BitOr | BitXor | BoolAnd | BoolOr | Shl | Shr => {
                let pair = self.memory.next_u8(cursor);
                let (left, right) = split_pair(pair);
                if trace {
                    self.trace_line(format_args!(
                        "[{ip:#X}]\t{} {}, {}",
                        op.mnemonic(),
                        left.map_or("?", TypeTag::name),
                        right.map_or("?", TypeTag::name),
                    ));
                }
                if let (Some(left), Some(right)) = (left, right) {
                    ops::binary_operation(&mut self.memory, left, right, op);
                }
            }

            // === Unary ===
            Neg => {
                let tag = self.memory.next_u8(cursor);
                let tag = TypeTag::from_code(tag);
                if trace {
                    self.trace_line(format_args!(
                        "[{ip:#X}]\tNEG {}",
                        tag.map_or("?", TypeTag::name)
                    ));
                }
                if let Some(tag) = tag {
                    ops::unary_operation(&mut self.memory, tag, op);
                }
            }
            BitNot | BoolNot => {
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\t{}", op.mnemonic()));
                }
                ops::unary_operation(&mut self.memory, TypeTag::Integer, op);
            }

            // === Control flow ===
            Jump => {
                let arg = self.memory.next_i32(cursor);
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tJUMP {arg}"));
                }
                *cursor += arg;
            }
            JumpIf | JumpNif => {
                let tag = TypeTag::from_code(self.memory.next_u8(cursor));
                let arg = self.memory.next_i32(cursor);
                if trace {
                    self.trace_line(format_args!(
                        "[{ip:#X}]\t{} {}, {arg}",
                        op.mnemonic(),
                        tag.map_or("?", TypeTag::name)
                    ));
                }
                if let Some(tag) = tag {
                    let truthy = self.pop_truthy(tag);
                    if truthy == (op == JumpIf) {
                        *cursor += arg;
                    }
                }
            }

            State => {
                let target = self.memory.next_i32(cursor);
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tSTATE {target}"));
                }
                let bp = self.memory.pop_i32();
                self.memory.set_register(Register::Bp, bp);
                *cursor = self.memory.pop_i32();

                let current = self.memory.get_register(Register::Cs);
                if target != current {
                    let pending = self.memory.get_event_register(Register::Ce, major)
                        | crate::event::EventKind::StateExit.bit();
                    self.memory.set_event_register(Register::Ce, pending, major);
                }
                self.memory.set_register(Register::Ns, target);
            }
            Call => {
                let index = self.memory.next_i32(cursor);
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tCALL {index}"));
                }
                self.memory.local_store(-8, *cursor);

                let minimum = self.memory.get_register(Register::Gfr);
                let maximum = self.memory.get_register(Register::Sr);
                let lookup = minimum + index * 4 + 4;
                if lookup >= minimum && lookup + 4 <= maximum {
                    let function = minimum + self.memory.read_i32_at(lookup);
                    if function >= minimum && function + 4 <= maximum {
                        *cursor = function + self.memory.read_i32_at(function);
                    } else {
                        self.memory.set_fault(FaultKind::BoundsCheck);
                    }
                } else {
                    self.memory.set_fault(FaultKind::BoundsCheck);
                }
            }
            Return => {
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tRETURN"));
                }
                let bp = self.memory.pop_i32();
                self.memory.set_register(Register::Bp, bp);
                *cursor = self.memory.pop_i32();
            }

            Cast => {
                let pair = self.memory.next_u8(cursor);
                let (from, to) = split_pair(pair);
                if trace {
                    self.trace_line(format_args!(
                        "[{ip:#X}]\tCAST {}, {}",
                        from.map_or("?", TypeTag::name),
                        to.map_or("?", TypeTag::name),
                    ));
                }
                if let (Some(from), Some(to)) = (from, to) {
                    self.run_cast(from, to);
                }
            }

            StackToS => {
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tSTACKTOS"));
                }
                self.run_stack_to_string();
            }
            StackToL => {
                let length = self.memory.next_i32(cursor);
                if trace {
                    self.trace_line(format_args!("[{ip:#X}]\tSTACKTOL {length}"));
                }
                self.run_stack_to_list(length);
            }

            Print => {
                let tag = TypeTag::from_code(self.memory.next_u8(cursor));
                if trace {
                    self.trace_line(format_args!(
                        "[{ip:#X}]\tPRINT {}",
                        tag.map_or("?", TypeTag::name)
                    ));
                }
                if let Some(tag) = tag {
                    self.run_print(tag);
                }
            }

            CallLib => {
                let index = self.memory.next_u8(cursor) as usize;
                self.run_call_library(index, ip, trace, actor);
            }
            CallLib2 => {
                let index = self.memory.next_u16(cursor) as usize;
                self.run_call_library(index, ip, trace, actor);
            }
        }
    }

    /// Truthiness for JUMPIF/JUMPNIF: numbers by non-zero, vectors by
    /// exact non-zero, quaternions by non-identity, strings by
    /// non-emptiness, keys by parsing to a non-null UUID, lists by
    /// non-emptiness. Popped heap references are released.
    fn pop_truthy(&mut self, tag: TypeTag) -> bool {
        match tag {
            TypeTag::Integer => self.memory.pop_i32() != 0,
            TypeTag::FloatingPoint => self.memory.pop_f32() != 0.0,
            TypeTag::Vector => !self.memory.pop_vector().is_exactly_zero(),
            TypeTag::Quaternion => !self.memory.pop_quaternion().is_identity(),
            TypeTag::String | TypeTag::Key => {
                let address = self.memory.pop_i32();
                if address == 0 {
                    return false;
                }
                let text = match heap::heap_get(&mut self.memory, address, true) {
                    Some(ScriptValue::String(text)) | Some(ScriptValue::Key(text)) => text,
                    _ => String::new(),
                };
                heap::dec_ref(&mut self.memory, address);
                if tag == TypeTag::Key {
                    key_is_truthy(&text)
                } else {
                    !text.is_empty()
                }
            }
            TypeTag::List => {
                let address = self.memory.pop_i32();
                if address == 0 {
                    return false;
                }
                let length = match heap::heap_get(&mut self.memory, address, true) {
                    Some(ScriptValue::List(items)) => items.len(),
                    _ => 0,
                };
                heap::dec_ref(&mut self.memory, address);
                length > 0
            }
            TypeTag::Null => false,
        }
    }

    /// Pops a heap reference and reads its text payload, releasing the
    /// reference. The null address reads as the empty string.
    fn pop_text(&mut self) -> String {
        let address = self.memory.pop_i32();
        if address == 0 {
            return String::new();
        }
        let text = match heap::heap_get(&mut self.memory, address, true) {
            Some(ScriptValue::String(text)) | Some(ScriptValue::Key(text)) => text,
            _ => String::new(),
        };
        heap::dec_ref(&mut self.memory, address);
        text
    }

    fn push_new_string(&mut self, text: String) {
        let max = self.memory.max_heap_size();
        let address = heap::heap_add(&mut self.memory, &ScriptValue::String(text), max, true);
        self.memory.push_i32(address);
    }

    fn push_new_list(&mut self, items: Vec<ScriptValue>) {
        let max = self.memory.max_heap_size();
        let address = heap::heap_add(&mut self.memory, &ScriptValue::List(items), max, true);
        self.memory.push_i32(address);
    }

    /// `CAST <(src<<4)|dst>`. Conversions not in the table leave the
    /// stack untouched.
    fn run_cast(&mut self, from: TypeTag, to: TypeTag) {
        use TypeTag::*;
        match (from, to) {
            (Integer, FloatingPoint) => {
                let value = self.memory.pop_i32();
                self.memory.push_f32(value as f32);
            }
            (Integer, String) => {
                let value = self.memory.pop_i32();
                self.push_new_string(value.to_string());
            }
            (Integer, List) => {
                let value = self.memory.pop_i32();
                self.push_new_list(vec![ScriptValue::Integer(value)]);
            }
            (FloatingPoint, Integer) => {
                let value = self.memory.pop_f32();
                self.memory.push_i32(value as i32);
            }
            (FloatingPoint, String) => {
                let value = self.memory.pop_f32();
                self.push_new_string(format!("{value:.6}"));
            }
            (FloatingPoint, List) => {
                let value = self.memory.pop_f32();
                self.push_new_list(vec![ScriptValue::Float(value)]);
            }
            (String, Integer) => {
                let text = self.pop_text();
                self.memory.push_i32(parse_integer_text(&text));
            }
            (String, FloatingPoint) => {
                let text = self.pop_text();
                self.memory.push_f32(parse_float_text(&text));
            }
            (String, Vector) => {
                let text = self.pop_text();
                let vector = parse_vector_text(&text).unwrap_or(Vector3::ZERO);
                self.memory.push_vector(vector);
            }
            (String, Quaternion) => {
                let text = self.pop_text();
                let quaternion = parse_quaternion_text(&text).unwrap_or(crate::value::Quaternion::IDENTITY);
                self.memory.push_quaternion(quaternion);
            }
            (String, List) => {
                let text = self.pop_text();
                self.push_new_list(vec![ScriptValue::String(text)]);
            }
            (Key, List) => {
                let text = self.pop_text();
                self.push_new_list(vec![ScriptValue::Key(text)]);
            }
            (Vector, String) => {
                let value = self.memory.pop_vector();
                self.push_new_string(ScriptValue::Vector(value).to_string());
            }
            (Vector, List) => {
                let value = self.memory.pop_vector();
                self.push_new_list(vec![ScriptValue::Vector(value)]);
            }
            (Quaternion, String) => {
                let value = self.memory.pop_quaternion();
                self.push_new_string(ScriptValue::Quaternion(value).to_string());
            }
            (Quaternion, List) => {
                let value = self.memory.pop_quaternion();
                self.push_new_list(vec![ScriptValue::Quaternion(value)]);
            }
            (List, String) => {
                let address = self.memory.pop_i32();
                let items = match heap::heap_get(&mut self.memory, address, true) {
                    Some(ScriptValue::List(items)) => items,
                    _ => Vec::new(),
                };
                if address != 0 {
                    heap::dec_ref(&mut self.memory, address);
                }
                self.push_new_string(ScriptValue::List(items).to_string());
            }
            // Identity casts and key/string reinterpretation leave the
            // cell as it is.
            _ => {}
        }
    }

    /// `STACKTOS`: the byte count comes from the stack, then that many
    /// bytes are popped, deepest byte first in the result.
    fn run_stack_to_string(&mut self) {
        let length = self.memory.pop_i32().max(0) as usize;
        let mut bytes = vec![0u8; length];
        for slot in (0..length).rev() {
            if self.memory.fault().is_some() {
                break;
            }
            bytes[slot] = self.memory.pop_u8();
        }
        if let Some(end) = bytes.iter().position(|&b| b == 0) {
            bytes.truncate(end);
        }
        let text = String::from_utf8_lossy(&bytes).into_owned();
        self.push_new_string(text);
    }

    /// `STACKTOL <n>`: pops `n` (type byte, value) pairs; the leftmost
    /// list element comes from the top of the stack.
    fn run_stack_to_list(&mut self, length: i32) {
        let mut items = Vec::new();
        for _ in 0..length.max(0) {
            if self.memory.fault().is_some() {
                break;
            }
            let Some(tag) = TypeTag::from_code(self.memory.pop_u8()) else {
                break;
            };
            if tag == TypeTag::Null {
                break;
            }
            items.push(ops::pop_element(&mut self.memory, tag));
        }
        self.push_new_list(items);
    }

    fn run_print(&mut self, tag: TypeTag) {
        match tag {
            TypeTag::Integer => {
                let value = self.memory.pop_i32();
                self.print_line(&value.to_string());
            }
            TypeTag::FloatingPoint => {
                let value = self.memory.pop_f32();
                self.print_line(&format!("{value:.6}"));
            }
            TypeTag::String | TypeTag::Key => {
                let text = self.pop_text();
                self.print_line(&text);
            }
            TypeTag::Vector => {
                let v = self.memory.pop_vector();
                self.print_line(&format!("< {:.6}, {:.6}, {:.6} >", v.x, v.y, v.z));
            }
            TypeTag::Quaternion => {
                let q = self.memory.pop_quaternion();
                self.print_line(&format!(
                    "< {:.6}, {:.6}, {:.6}, {:.6} >",
                    q.x, q.y, q.z, q.s
                ));
            }
            TypeTag::List => {
                let address = self.memory.pop_i32();
                let items = match heap::heap_get(&mut self.memory, address, true) {
                    Some(ScriptValue::List(items)) => items,
                    _ => Vec::new(),
                };
                if address != 0 {
                    heap::dec_ref(&mut self.memory, address);
                }
                self.print_line("list");
                for item in items {
                    match item {
                        ScriptValue::Float(v) => self.print_line(&format!("{v:.6}")),
                        ScriptValue::Vector(v) => self.print_line(&format!(
                            "< {:.6}, {:.6}, {:.6} >",
                            v.x, v.y, v.z
                        )),
                        ScriptValue::Quaternion(q) => self.print_line(&format!(
                            "< {:.6}, {:.6}, {:.6}, {:.6} >",
                            q.x, q.y, q.z, q.s
                        )),
                        other => self.print_line(&other.to_string()),
                    }
                }
            }
            TypeTag::Null => {}
        }
    }

    /// `CALLLIB` / `CALLLIB_TWO_BYTE`: marshals arguments per the
    /// descriptor signature, invokes the host callback synchronously,
    /// stores the return value in the caller's reserved slots, debits
    /// energy, queues sleep, and unwinds the call scaffold.
    fn run_call_library(&mut self, index: usize, ip: i32, trace: bool, actor: &Uuid) {
        let Some(function) = self.library.get(index).cloned() else {
            self.memory.set_fault(FaultKind::BoundsCheck);
            return;
        };
        if trace {
            self.trace_line(format_args!("[{ip:#X}]\tCALLLIB {index} ({})", function.name));
        }

        let tags: Vec<TypeTag> = function
            .args
            .chars()
            .filter_map(TypeTag::from_letter)
            .collect();
        let mut args = vec![ScriptValue::default(); tags.len()];
        for (slot, tag) in tags.iter().enumerate().rev() {
            args[slot] = ops::pop_element(&mut self.memory, *tag);
        }

        let mut returned = None;
        (function.exec)(&mut returned, &args, actor);

        self.memory
            .add_register_f32(Register::Esr, -function.energy_use);
        self.memory
            .add_register_f32(Register::Slr, function.sleep_time);

        if let Some(tag) = function.return_type {
            let value = returned
                .unwrap_or_else(|| ScriptValue::zero_of(tag))
                .coerce_tag(tag);
            self.store_library_return(value);
        }

        // Unwind the call scaffold the call site pushed.
        let bp = self.memory.pop_i32();
        self.memory.set_register(Register::Bp, bp);
        self.memory.pop_bytes(4);
    }

    /// Return values land in the caller's reserved frame slots:
    /// scalars and references at BP−12, vectors at BP−20, quaternions
    /// at BP−24.
    fn store_library_return(&mut self, value: ScriptValue) {
        match value {
            ScriptValue::Integer(v) => self.memory.local_store(-12, v),
            ScriptValue::Float(v) => {
                let address = self.memory.local_address(-12);
                self.memory.write_f32_at(address, v);
            }
            ScriptValue::Vector(v) => self.memory.local_store_vector(-20, v),
            ScriptValue::Quaternion(q) => self.memory.local_store_quaternion(-24, q),
            reference => {
                let max = self.memory.max_heap_size();
                let address = heap::heap_add(&mut self.memory, &reference, max, false);
                self.memory.local_store(-12, address);
            }
        }
    }
}
