//! The reference-counted heap for variable-length values.
//!
//! Heap cells live inside the image buffer between HR and HP. Every
//! cell starts with a 7-byte header: total size (header included),
//! type tag, refcount. String and key payloads are NUL-terminated;
//! list payloads are inline-tagged elements closed by a null tag.
//!
//! Allocation is first-fit over freed cells with an append fallback at
//! HP; freeing a cell retires trailing free space lazily by lowering
//! HP. Addresses handed to the stack are heap-relative and biased by
//! one so that zero means "no object".

use log::debug;

use crate::error::FaultKind;
use crate::memory::{MemoryImage, Register, HEAP_ENTRY_SIZE};
use crate::value::{ScriptValue, TypeTag};

/// Tag stored in the header of a freed cell.
const FREE_TAG: u8 = TypeTag::Null as u8;

/// Appends a value to the heap and returns its biased address, or zero
/// on failure. `mark_live` starts the refcount at one; otherwise the
/// cell is provisional (refcount zero) until a reference is taken.
///
/// Faults: `NestingLists` for a list containing a list (heap left
/// unchanged), `HeapError` when the cell cannot fit.
pub fn heap_add(
    memory: &mut MemoryImage,
    value: &ScriptValue,
    max_size: i32,
    mark_live: bool,
) -> i32 {
    let Some((tag, payload)) = encode_cell(memory, value) else {
        return 0;
    };
    let total = HEAP_ENTRY_SIZE + payload.len() as i32;

    let Some((address, cell_size)) = alloc_cell(memory, total, max_size) else {
        return 0;
    };

    memory.write_i32_at(address, cell_size);
    memory.write_u8_at(address + 4, tag as u8);
    memory.write_u16_at(address + 5, u16::from(mark_live));
    memory.write_bytes_at(address + HEAP_ENTRY_SIZE, &payload);

    memory.heap_biased(address)
}

/// Reads an owned copy of a heap value. Does not touch the refcount.
/// A shallow read of a list stops at the cell header and yields an
/// empty element vector.
///
/// The null address reads as `None` without faulting (zero means "no
/// object"); a freed cell or corrupt header faults `HeapError`.
pub fn heap_get(memory: &mut MemoryImage, biased: i32, deep: bool) -> Option<ScriptValue> {
    let address = memory.heap_absolute(biased)?;
    let header = read_header(memory, address)?;

    match header.tag {
        TypeTag::String => Some(ScriptValue::String(
            memory.read_cstr_at(address + HEAP_ENTRY_SIZE),
        )),
        TypeTag::Key => Some(ScriptValue::Key(
            memory.read_cstr_at(address + HEAP_ENTRY_SIZE),
        )),
        TypeTag::List => {
            if !deep {
                return Some(ScriptValue::List(Vec::new()));
            }
            decode_list(memory, address + HEAP_ENTRY_SIZE, address + header.size)
        }
        _ => {
            memory.set_fault(FaultKind::HeapError);
            None
        }
    }
}

/// Increments a cell's refcount. The null address is a no-op.
pub fn inc_ref(memory: &mut MemoryImage, biased: i32) {
    let Some(address) = memory.heap_absolute(biased) else {
        return;
    };
    let Some(header) = read_header(memory, address) else {
        return;
    };
    memory.write_u16_at(address + 5, header.refcount.saturating_add(1));
}

/// Decrements a cell's refcount, freeing the cell when it reaches
/// zero. The null address is a no-op; releasing a provisional
/// (zero-count) cell frees it immediately.
pub fn dec_ref(memory: &mut MemoryImage, biased: i32) {
    let Some(address) = memory.heap_absolute(biased) else {
        return;
    };
    let Some(header) = read_header(memory, address) else {
        return;
    };
    if header.refcount > 1 {
        memory.write_u16_at(address + 5, header.refcount - 1);
    } else {
        free_cell(memory, address);
    }
}

/// The current refcount of a cell, for tests and diagnostics.
pub fn ref_count(memory: &mut MemoryImage, biased: i32) -> u16 {
    memory
        .heap_absolute(biased)
        .and_then(|address| read_header(memory, address))
        .map(|header| header.refcount)
        .unwrap_or(0)
}

/// Concatenates two strings into a new cell, consuming both input
/// references.
pub fn cat_strings(memory: &mut MemoryImage, left: i32, right: i32, max_size: i32) -> i32 {
    let mut text = payload_text(memory, left);
    text.push_str(&payload_text(memory, right));
    dec_ref(memory, left);
    dec_ref(memory, right);
    heap_add(memory, &ScriptValue::String(text), max_size, true)
}

/// Compares two string payloads, consuming both input references.
/// Returns zero iff the payloads are byte-equal.
pub fn cmp_strings(memory: &mut MemoryImage, left: i32, right: i32) -> i32 {
    let a = payload_text(memory, left);
    let b = payload_text(memory, right);
    dec_ref(memory, left);
    dec_ref(memory, right);
    match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

/// Concatenates two lists into a new cell, consuming both inputs.
pub fn cat_lists(memory: &mut MemoryImage, left: i32, right: i32, max_size: i32) -> i32 {
    let mut items = list_items(memory, left);
    items.extend(list_items(memory, right));
    dec_ref(memory, left);
    dec_ref(memory, right);
    heap_add(memory, &ScriptValue::List(items), max_size, true)
}

/// Builds a new list with `element` prepended, consuming the list
/// reference.
pub fn preadd_list(
    memory: &mut MemoryImage,
    element: ScriptValue,
    list: i32,
    max_size: i32,
) -> i32 {
    let mut items = vec![element];
    items.extend(list_items(memory, list));
    dec_ref(memory, list);
    heap_add(memory, &ScriptValue::List(items), max_size, true)
}

/// Builds a new list with `element` appended, consuming the list
/// reference.
pub fn postadd_list(
    memory: &mut MemoryImage,
    list: i32,
    element: ScriptValue,
    max_size: i32,
) -> i32 {
    let mut items = list_items(memory, list);
    items.push(element);
    dec_ref(memory, list);
    heap_add(memory, &ScriptValue::List(items), max_size, true)
}

/// Compares two lists element-wise, consuming both inputs. Returns
/// zero iff they are the same length and every element is equal.
pub fn cmp_lists(memory: &mut MemoryImage, left: i32, right: i32) -> i32 {
    let a = list_items(memory, left);
    let b = list_items(memory, right);
    dec_ref(memory, left);
    dec_ref(memory, right);
    i32::from(a != b)
}

struct CellHeader {
    size: i32,
    tag: TypeTag,
    refcount: u16,
}

fn read_header(memory: &mut MemoryImage, address: i32) -> Option<CellHeader> {
    let hr = memory.get_register(Register::Hr);
    let hp = memory.get_register(Register::Hp);
    if address < hr || address + HEAP_ENTRY_SIZE > hp {
        memory.set_fault(FaultKind::HeapError);
        return None;
    }
    let size = memory.read_i32_at(address);
    let tag = memory.read_u8_at(address + 4);
    let refcount = memory.read_u16_at(address + 5);
    if size < HEAP_ENTRY_SIZE || address + size > hp {
        memory.set_fault(FaultKind::HeapError);
        return None;
    }
    let tag = match TypeTag::from_code(tag) {
        Some(tag) if tag != TypeTag::Null => tag,
        _ => {
            memory.set_fault(FaultKind::HeapError);
            return None;
        }
    };
    Some(CellHeader {
        size,
        tag,
        refcount,
    })
}

/// Finds room for `total` bytes: first fit over freed cells, else an
/// append at HP. Returns the absolute address and the granted cell
/// size.
fn alloc_cell(memory: &mut MemoryImage, total: i32, max_size: i32) -> Option<(i32, i32)> {
    let hr = memory.get_register(Register::Hr);
    let hp = memory.get_register(Register::Hp);

    let mut cursor = hr;
    while cursor + HEAP_ENTRY_SIZE <= hp {
        let size = memory.read_i32_at(cursor);
        if size < HEAP_ENTRY_SIZE || cursor + size > hp {
            memory.set_fault(FaultKind::HeapError);
            return None;
        }
        let tag = memory.read_u8_at(cursor + 4);
        if tag == FREE_TAG && size >= total {
            // Split when the remainder can hold another cell.
            let remainder = size - total;
            if remainder >= HEAP_ENTRY_SIZE + 1 {
                memory.write_i32_at(cursor + total, remainder);
                memory.write_u8_at(cursor + total + 4, FREE_TAG);
                memory.write_u16_at(cursor + total + 5, 0);
                debug!("heap: reusing cell at {cursor:#X}, split {remainder} bytes");
                return Some((cursor, total));
            }
            debug!("heap: reusing cell at {cursor:#X} whole");
            return Some((cursor, size));
        }
        cursor = cursor + size;
    }

    let end = hp as i64 + total as i64;
    let sp = memory.get_register(Register::Sp) as i64;
    if end > sp || (end - hr as i64) > max_size as i64 || end > memory.len() as i64 {
        memory.set_fault(FaultKind::HeapError);
        return None;
    }
    memory.set_register(Register::Hp, end as i32);
    Some((hp, total))
}

fn free_cell(memory: &mut MemoryImage, address: i32) {
    memory.write_u8_at(address + 4, FREE_TAG);
    memory.write_u16_at(address + 5, 0);
    retire_tail(memory);
}

/// Lowers HP past any run of free cells at the end of the heap so the
/// space is reclaimed rather than merely reusable.
fn retire_tail(memory: &mut MemoryImage) {
    let hr = memory.get_register(Register::Hr);
    loop {
        let hp = memory.get_register(Register::Hp);
        let mut cursor = hr;
        let mut last: Option<(i32, u8)> = None;
        while cursor + HEAP_ENTRY_SIZE <= hp {
            let size = memory.read_i32_at(cursor);
            if size < HEAP_ENTRY_SIZE || cursor + size > hp {
                return;
            }
            last = Some((cursor, memory.read_u8_at(cursor + 4)));
            cursor += size;
        }
        match last {
            Some((start, tag)) if tag == FREE_TAG => {
                memory.set_register(Register::Hp, start);
                debug!("heap: retired tail cell at {start:#X}");
            }
            _ => return,
        }
    }
}

fn encode_cell(memory: &mut MemoryImage, value: &ScriptValue) -> Option<(TypeTag, Vec<u8>)> {
    match value {
        ScriptValue::String(text) | ScriptValue::Key(text) => {
            let mut payload = text.as_bytes().to_vec();
            payload.push(0);
            Some((value.type_tag(), payload))
        }
        ScriptValue::List(items) => {
            let mut payload = Vec::new();
            for item in items {
                if matches!(item, ScriptValue::List(_)) {
                    memory.set_fault(FaultKind::NestingLists);
                    return None;
                }
                payload.push(item.type_tag() as u8);
                encode_element(&mut payload, item);
            }
            payload.push(TypeTag::Null as u8);
            Some((TypeTag::List, payload))
        }
        _ => {
            memory.set_fault(FaultKind::HeapError);
            None
        }
    }
}

fn encode_element(payload: &mut Vec<u8>, value: &ScriptValue) {
    match value {
        ScriptValue::Integer(v) => payload.extend_from_slice(&v.to_be_bytes()),
        ScriptValue::Float(v) => payload.extend_from_slice(&v.to_bits().to_be_bytes()),
        ScriptValue::String(text) | ScriptValue::Key(text) => {
            payload.extend_from_slice(text.as_bytes());
            payload.push(0);
        }
        ScriptValue::Vector(v) => {
            payload.extend_from_slice(&v.x.to_bits().to_be_bytes());
            payload.extend_from_slice(&v.y.to_bits().to_be_bytes());
            payload.extend_from_slice(&v.z.to_bits().to_be_bytes());
        }
        ScriptValue::Quaternion(q) => {
            payload.extend_from_slice(&q.x.to_bits().to_be_bytes());
            payload.extend_from_slice(&q.y.to_bits().to_be_bytes());
            payload.extend_from_slice(&q.z.to_bits().to_be_bytes());
            payload.extend_from_slice(&q.s.to_bits().to_be_bytes());
        }
        ScriptValue::List(_) => {}
    }
}

fn decode_list(memory: &mut MemoryImage, start: i32, end: i32) -> Option<ScriptValue> {
    let mut items = Vec::new();
    let mut cursor = start;
    loop {
        if cursor >= end {
            memory.set_fault(FaultKind::HeapError);
            return None;
        }
        let tag = memory.read_u8_at(cursor);
        cursor += 1;
        let tag = match TypeTag::from_code(tag) {
            Some(TypeTag::Null) => return Some(ScriptValue::List(items)),
            Some(tag) => tag,
            None => {
                memory.set_fault(FaultKind::HeapError);
                return None;
            }
        };
        match tag {
            TypeTag::Integer => {
                items.push(ScriptValue::Integer(memory.read_i32_at(cursor)));
                cursor += 4;
            }
            TypeTag::FloatingPoint => {
                items.push(ScriptValue::Float(memory.read_f32_at(cursor)));
                cursor += 4;
            }
            TypeTag::String | TypeTag::Key => {
                let text = memory.read_cstr_at(cursor);
                cursor += text.len() as i32 + 1;
                items.push(if tag == TypeTag::Key {
                    ScriptValue::Key(text)
                } else {
                    ScriptValue::String(text)
                });
            }
            TypeTag::Vector => {
                items.push(ScriptValue::Vector(memory.read_vector_at(cursor)));
                cursor += 12;
            }
            TypeTag::Quaternion => {
                items.push(ScriptValue::Quaternion(memory.read_quaternion_at(cursor)));
                cursor += 16;
            }
            _ => {
                memory.set_fault(FaultKind::HeapError);
                return None;
            }
        }
    }
}

fn payload_text(memory: &mut MemoryImage, biased: i32) -> String {
    match heap_get(memory, biased, true) {
        Some(ScriptValue::String(text)) | Some(ScriptValue::Key(text)) => text,
        _ => String::new(),
    }
}

fn list_items(memory: &mut MemoryImage, biased: i32) -> Vec<ScriptValue> {
    match heap_get(memory, biased, true) {
        Some(ScriptValue::List(items)) => items,
        _ => Vec::new(),
    }
}
