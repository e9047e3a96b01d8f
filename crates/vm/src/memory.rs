//! The program image: one contiguous byte buffer holding registers,
//! globals, the function and state tables, the downward-growing stack
//! and the upward-growing heap.
//!
//! Every multi-byte cell is big-endian. All access goes through checked
//! accessors: an out-of-range address latches `BoundsCheck` into the FR
//! register and leaves memory unchanged, a stack push that would cross
//! the heap high-water mark latches `StackHeapCollision`. Accessors
//! never panic on script-controlled input.

use std::fmt;

use crate::error::{FaultKind, VmError, VmResult};
use crate::event::EventKind;
use crate::value::{Quaternion, Vector3};

/// Size of the fixed register header at the front of every image.
pub const HEADER_SIZE: i32 = 80;

/// Byte offset of the global-variable area.
pub const GLOBALS_BASE: i32 = HEADER_SIZE;

/// Version marker for major version 1 (32-bit event masks).
pub const VERSION_1_END: i32 = 0x0101;

/// Version marker for major version 2 (64-bit event masks).
pub const VERSION_2: i32 = 0x0200;

/// Size of a heap cell header: u32 size, u8 type tag, u16 refcount.
pub const HEAP_ENTRY_SIZE: i32 = 7;

/// Named registers stored in the image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    /// Total image size.
    Tm,
    /// Instruction pointer.
    Ip,
    /// Stack pointer (address of the top cell).
    Sp,
    /// Base pointer anchoring the current frame.
    Bp,
    /// Current state.
    Cs,
    /// Next state.
    Ns,
    /// Pending-events mask.
    Ce,
    /// Events handled by the current state.
    Er,
    /// Event being dispatched right now.
    Ie,
    /// Heap region base.
    Hr,
    /// Heap high-water mark.
    Hp,
    /// Global-function region offset.
    Gfr,
    /// State region offset.
    Sr,
    /// Energy reserve (float).
    Esr,
    /// Sleep remaining (float).
    Slr,
    /// Fault code.
    Fr,
    /// Version marker.
    Vn,
}

impl Register {
    /// Byte offset of this register inside the header.
    pub fn offset(self) -> i32 {
        match self {
            Self::Tm => 0,
            Self::Ip => 4,
            Self::Sp => 8,
            Self::Bp => 12,
            Self::Cs => 16,
            Self::Ns => 20,
            Self::Ce => 24,
            Self::Er => 32,
            Self::Ie => 40,
            Self::Hr => 48,
            Self::Hp => 52,
            Self::Gfr => 56,
            Self::Sr => 60,
            Self::Esr => 64,
            Self::Slr => 68,
            Self::Fr => 72,
            Self::Vn => 76,
        }
    }

    /// Whether this register is an 8-byte event mask.
    pub fn is_event_mask(self) -> bool {
        matches!(self, Self::Ce | Self::Er | Self::Ie)
    }
}

/// The flat program image and register file.
#[derive(Debug, Clone)]
pub struct MemoryImage {
    buffer: Vec<u8>,
}

impl MemoryImage {
    /// Wraps an image buffer, validating the header and size field.
    pub fn from_bytes(buffer: Vec<u8>) -> VmResult<Self> {
        if buffer.len() < HEADER_SIZE as usize {
            return Err(VmError::ImageTooSmall {
                size: buffer.len(),
                required: HEADER_SIZE as usize,
            });
        }
        let image = Self { buffer };
        let declared = image.get_register(Register::Tm);
        if declared as i64 != image.buffer.len() as i64 {
            return Err(VmError::ImageSizeMismatch {
                declared,
                actual: image.buffer.len(),
            });
        }
        Ok(image)
    }

    /// Total buffer length.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer is empty (never true for a validated image).
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// The raw buffer; this is also the snapshot format.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Replaces the buffer wholesale (snapshot restore).
    pub fn restore(&mut self, bytes: &[u8]) -> VmResult<()> {
        if bytes.len() != self.buffer.len() {
            return Err(VmError::SnapshotSizeMismatch {
                expected: self.buffer.len(),
                actual: bytes.len(),
            });
        }
        self.buffer.copy_from_slice(bytes);
        Ok(())
    }

    // === Faults ===

    /// Latches a fault. The first fault wins; later ones are ignored
    /// until the host clears the register.
    pub fn set_fault(&mut self, fault: FaultKind) {
        let offset = Register::Fr.offset() as usize;
        let current = i32::from_be_bytes(self.buffer[offset..offset + 4].try_into().unwrap());
        if current == 0 {
            self.buffer[offset..offset + 4].copy_from_slice(&fault.code().to_be_bytes());
        }
    }

    /// The current fault, if any.
    pub fn fault(&self) -> Option<FaultKind> {
        FaultKind::from_code(self.get_register(Register::Fr))
    }

    /// Clears the fault register.
    pub fn clear_fault(&mut self) {
        self.set_register(Register::Fr, 0);
    }

    // === Registers ===

    /// Reads a 32-bit register.
    pub fn get_register(&self, register: Register) -> i32 {
        let offset = register.offset() as usize;
        i32::from_be_bytes(self.buffer[offset..offset + 4].try_into().unwrap())
    }

    /// Writes a 32-bit register.
    pub fn set_register(&mut self, register: Register, value: i32) {
        let offset = register.offset() as usize;
        self.buffer[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    /// Reads a float register (ESR, SLR).
    pub fn get_register_f32(&self, register: Register) -> f32 {
        f32::from_bits(self.get_register(register) as u32)
    }

    /// Writes a float register.
    pub fn set_register_f32(&mut self, register: Register, value: f32) {
        self.set_register(register, value.to_bits() as i32);
    }

    /// Adds a delta to a float register.
    pub fn add_register_f32(&mut self, register: Register, delta: f32) {
        let value = self.get_register_f32(register);
        self.set_register_f32(register, value + delta);
    }

    /// Reads an event-mask register. Major version 1 sees 32 bits.
    pub fn get_event_register(&self, register: Register, major_version: u32) -> u64 {
        let offset = register.offset() as usize;
        let value = u64::from_be_bytes(self.buffer[offset..offset + 8].try_into().unwrap());
        if major_version == 1 {
            value & 0xFFFF_FFFF
        } else {
            value
        }
    }

    /// Writes an event-mask register, masked to the version's width.
    pub fn set_event_register(&mut self, register: Register, value: u64, major_version: u32) {
        let value = if major_version == 1 {
            value & 0xFFFF_FFFF
        } else {
            value
        };
        let offset = register.offset() as usize;
        self.buffer[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
    }

    /// The major version selected by the VN register, if recognized.
    pub fn major_version(&self) -> Option<u32> {
        match self.get_register(Register::Vn) {
            VERSION_1_END => Some(1),
            VERSION_2 => Some(2),
            _ => None,
        }
    }

    // === Checked cell access ===

    fn check(&mut self, address: i32, size: i32) -> bool {
        let ok = address >= 0
            && size >= 0
            && (address as i64 + size as i64) <= self.buffer.len() as i64;
        if !ok {
            self.set_fault(FaultKind::BoundsCheck);
        }
        ok
    }

    /// Reads one byte; faults `BoundsCheck` and yields zero out of range.
    pub fn read_u8_at(&mut self, address: i32) -> u8 {
        if !self.check(address, 1) {
            return 0;
        }
        self.buffer[address as usize]
    }

    /// Writes one byte; faults `BoundsCheck` out of range.
    pub fn write_u8_at(&mut self, address: i32, value: u8) {
        if !self.check(address, 1) {
            return;
        }
        self.buffer[address as usize] = value;
    }

    /// Reads a big-endian i32 cell.
    pub fn read_i32_at(&mut self, address: i32) -> i32 {
        if !self.check(address, 4) {
            return 0;
        }
        let offset = address as usize;
        i32::from_be_bytes(self.buffer[offset..offset + 4].try_into().unwrap())
    }

    /// Writes a big-endian i32 cell.
    pub fn write_i32_at(&mut self, address: i32, value: i32) {
        if !self.check(address, 4) {
            return;
        }
        let offset = address as usize;
        self.buffer[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    /// Reads a big-endian u16 cell.
    pub fn read_u16_at(&mut self, address: i32) -> u16 {
        if !self.check(address, 2) {
            return 0;
        }
        let offset = address as usize;
        u16::from_be_bytes(self.buffer[offset..offset + 2].try_into().unwrap())
    }

    /// Writes a big-endian u16 cell.
    pub fn write_u16_at(&mut self, address: i32, value: u16) {
        if !self.check(address, 2) {
            return;
        }
        let offset = address as usize;
        self.buffer[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    /// Reads a big-endian f32 cell.
    pub fn read_f32_at(&mut self, address: i32) -> f32 {
        f32::from_bits(self.read_i32_at(address) as u32)
    }

    /// Writes a big-endian f32 cell.
    pub fn write_f32_at(&mut self, address: i32, value: f32) {
        self.write_i32_at(address, value.to_bits() as i32);
    }

    /// Reads a 12-byte vector cell.
    pub fn read_vector_at(&mut self, address: i32) -> Vector3 {
        Vector3::new(
            self.read_f32_at(address),
            self.read_f32_at(address + 4),
            self.read_f32_at(address + 8),
        )
    }

    /// Writes a 12-byte vector cell.
    pub fn write_vector_at(&mut self, address: i32, value: Vector3) {
        self.write_f32_at(address, value.x);
        self.write_f32_at(address + 4, value.y);
        self.write_f32_at(address + 8, value.z);
    }

    /// Reads a 16-byte quaternion cell.
    pub fn read_quaternion_at(&mut self, address: i32) -> Quaternion {
        Quaternion::new(
            self.read_f32_at(address),
            self.read_f32_at(address + 4),
            self.read_f32_at(address + 8),
            self.read_f32_at(address + 12),
        )
    }

    /// Writes a 16-byte quaternion cell.
    pub fn write_quaternion_at(&mut self, address: i32, value: Quaternion) {
        self.write_f32_at(address, value.x);
        self.write_f32_at(address + 4, value.y);
        self.write_f32_at(address + 8, value.z);
        self.write_f32_at(address + 12, value.s);
    }

    /// Reads a NUL-terminated byte string. An unterminated run to the
    /// end of the buffer faults `BoundsCheck` and yields what was read.
    pub fn read_cstr_at(&mut self, address: i32) -> String {
        if address < 0 || address as usize >= self.buffer.len() {
            self.set_fault(FaultKind::BoundsCheck);
            return String::new();
        }
        let start = address as usize;
        match self.buffer[start..].iter().position(|&b| b == 0) {
            Some(nul) => String::from_utf8_lossy(&self.buffer[start..start + nul]).into_owned(),
            None => {
                self.set_fault(FaultKind::BoundsCheck);
                String::from_utf8_lossy(&self.buffer[start..]).into_owned()
            }
        }
    }

    /// Writes raw bytes.
    pub fn write_bytes_at(&mut self, address: i32, bytes: &[u8]) {
        if !self.check(address, bytes.len() as i32) {
            return;
        }
        let offset = address as usize;
        self.buffer[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    // === Instruction stream ===

    /// Reads one opcode or immediate byte and advances the cursor.
    pub fn next_u8(&mut self, cursor: &mut i32) -> u8 {
        let value = self.read_u8_at(*cursor);
        *cursor += 1;
        value
    }

    /// Reads a big-endian u16 immediate and advances the cursor.
    pub fn next_u16(&mut self, cursor: &mut i32) -> u16 {
        let value = self.read_u16_at(*cursor);
        *cursor += 2;
        value
    }

    /// Reads a big-endian i32 immediate and advances the cursor.
    pub fn next_i32(&mut self, cursor: &mut i32) -> i32 {
        let value = self.read_i32_at(*cursor);
        *cursor += 4;
        value
    }

    /// Reads a big-endian f32 immediate and advances the cursor.
    pub fn next_f32(&mut self, cursor: &mut i32) -> f32 {
        let value = self.read_f32_at(*cursor);
        *cursor += 4;
        value
    }

    /// Reads a 12-byte vector immediate and advances the cursor.
    pub fn next_vector(&mut self, cursor: &mut i32) -> Vector3 {
        let value = self.read_vector_at(*cursor);
        *cursor += 12;
        value
    }

    /// Reads a 16-byte quaternion immediate and advances the cursor.
    pub fn next_quaternion(&mut self, cursor: &mut i32) -> Quaternion {
        let value = self.read_quaternion_at(*cursor);
        *cursor += 16;
        value
    }

    /// Reads a NUL-terminated string immediate and advances the cursor
    /// past the terminator. The advance counts raw bytes, which can
    /// differ from the decoded length for non-UTF-8 payloads.
    pub fn next_cstr(&mut self, cursor: &mut i32) -> String {
        let text = self.read_cstr_at(*cursor);
        let mut end = *cursor;
        while end >= 0
            && (end as usize) < self.buffer.len()
            && self.buffer[end as usize] != 0
        {
            end += 1;
        }
        *cursor = end + 1;
        text
    }

    // === Stack ===

    fn push_room(&mut self, size: i32) -> Option<i32> {
        let sp = self.get_register(Register::Sp);
        let new_sp = sp - size;
        let hp = self.get_register(Register::Hp);
        if new_sp < hp {
            self.set_fault(FaultKind::StackHeapCollision);
            return None;
        }
        if !self.check(new_sp, size) {
            return None;
        }
        self.set_register(Register::Sp, new_sp);
        Some(new_sp)
    }

    /// Pushes an i32 cell; faults `StackHeapCollision` if SP would
    /// cross HP.
    pub fn push_i32(&mut self, value: i32) {
        if let Some(sp) = self.push_room(4) {
            self.write_i32_at(sp, value);
        }
    }

    /// Pushes an f32 cell.
    pub fn push_f32(&mut self, value: f32) {
        self.push_i32(value.to_bits() as i32);
    }

    /// Pushes a single byte.
    pub fn push_u8(&mut self, value: u8) {
        if let Some(sp) = self.push_room(1) {
            self.write_u8_at(sp, value);
        }
    }

    /// Pushes a vector (12 bytes, x at the lowest address).
    pub fn push_vector(&mut self, value: Vector3) {
        if let Some(sp) = self.push_room(12) {
            self.write_vector_at(sp, value);
        }
    }

    /// Pushes a quaternion (16 bytes).
    pub fn push_quaternion(&mut self, value: Quaternion) {
        if let Some(sp) = self.push_room(16) {
            self.write_quaternion_at(sp, value);
        }
    }

    /// Pushes `size` zero bytes of local space.
    pub fn push_zeroed(&mut self, size: i32) {
        if size <= 0 {
            return;
        }
        if let Some(sp) = self.push_room(size) {
            let start = sp as usize;
            self.buffer[start..start + size as usize].fill(0);
        }
    }

    fn pop_room(&mut self, size: i32) -> Option<i32> {
        let sp = self.get_register(Register::Sp);
        if sp < 0 || size < 0 || (sp as i64 + size as i64) > self.buffer.len() as i64 {
            self.set_fault(FaultKind::BoundsCheck);
            return None;
        }
        self.set_register(Register::Sp, sp + size);
        Some(sp)
    }

    /// Pops an i32 cell; faults `BoundsCheck` if SP is out of range.
    pub fn pop_i32(&mut self) -> i32 {
        match self.pop_room(4) {
            Some(sp) => self.read_i32_at(sp),
            None => 0,
        }
    }

    /// Pops an f32 cell.
    pub fn pop_f32(&mut self) -> f32 {
        f32::from_bits(self.pop_i32() as u32)
    }

    /// Pops a single byte.
    pub fn pop_u8(&mut self) -> u8 {
        match self.pop_room(1) {
            Some(sp) => self.read_u8_at(sp),
            None => 0,
        }
    }

    /// Pops a vector.
    pub fn pop_vector(&mut self) -> Vector3 {
        match self.pop_room(12) {
            Some(sp) => self.read_vector_at(sp),
            None => Vector3::ZERO,
        }
    }

    /// Pops a quaternion.
    pub fn pop_quaternion(&mut self) -> Quaternion {
        match self.pop_room(16) {
            Some(sp) => self.read_quaternion_at(sp),
            None => Quaternion::IDENTITY,
        }
    }

    /// Discards `size` bytes from the stack.
    pub fn pop_bytes(&mut self, size: i32) {
        self.pop_room(size);
    }

    // === Locals and globals ===

    /// Address of a frame-local slot: BP plus a signed offset.
    pub fn local_address(&self, offset: i32) -> i32 {
        self.get_register(Register::Bp) + offset
    }

    /// Reads a local i32 slot.
    pub fn local_load(&mut self, offset: i32) -> i32 {
        let address = self.local_address(offset);
        self.read_i32_at(address)
    }

    /// Writes a local i32 slot.
    pub fn local_store(&mut self, offset: i32, value: i32) {
        let address = self.local_address(offset);
        self.write_i32_at(address, value);
    }

    /// Reads a local vector slot.
    pub fn local_load_vector(&mut self, offset: i32) -> Vector3 {
        let address = self.local_address(offset);
        self.read_vector_at(address)
    }

    /// Writes a local vector slot.
    pub fn local_store_vector(&mut self, offset: i32, value: Vector3) {
        let address = self.local_address(offset);
        self.write_vector_at(address, value);
    }

    /// Reads a local quaternion slot.
    pub fn local_load_quaternion(&mut self, offset: i32) -> Quaternion {
        let address = self.local_address(offset);
        self.read_quaternion_at(address)
    }

    /// Writes a local quaternion slot.
    pub fn local_store_quaternion(&mut self, offset: i32, value: Quaternion) {
        let address = self.local_address(offset);
        self.write_quaternion_at(address, value);
    }

    /// Reads a global i32 slot.
    pub fn global_load(&mut self, offset: i32) -> i32 {
        self.read_i32_at(GLOBALS_BASE + offset)
    }

    /// Writes a global i32 slot.
    pub fn global_store(&mut self, offset: i32, value: i32) {
        self.write_i32_at(GLOBALS_BASE + offset, value);
    }

    /// Reads a global vector slot.
    pub fn global_load_vector(&mut self, offset: i32) -> Vector3 {
        self.read_vector_at(GLOBALS_BASE + offset)
    }

    /// Writes a global vector slot.
    pub fn global_store_vector(&mut self, offset: i32, value: Vector3) {
        self.write_vector_at(GLOBALS_BASE + offset, value);
    }

    /// Reads a global quaternion slot.
    pub fn global_load_quaternion(&mut self, offset: i32) -> Quaternion {
        self.read_quaternion_at(GLOBALS_BASE + offset)
    }

    /// Writes a global quaternion slot.
    pub fn global_store_quaternion(&mut self, offset: i32, value: Quaternion) {
        self.write_quaternion_at(GLOBALS_BASE + offset, value);
    }

    // === Heap addressing ===

    /// Converts a stack-held heap address (heap-relative, biased by one
    /// so zero means "no object") to an absolute buffer offset.
    pub fn heap_absolute(&self, biased: i32) -> Option<i32> {
        if biased == 0 {
            return None;
        }
        Some(biased + self.get_register(Register::Hr) - 1)
    }

    /// Converts an absolute buffer offset into the biased stack form.
    pub fn heap_biased(&self, absolute: i32) -> i32 {
        absolute - self.get_register(Register::Hr) + 1
    }

    /// The largest heap extent allowed, in bytes.
    pub fn max_heap_size(&self) -> i32 {
        self.get_register(Register::Tm) - self.get_register(Register::Hr)
    }

    // === State table ===

    /// Number of states in the state table.
    pub fn state_count(&mut self) -> i32 {
        let sr = self.get_register(Register::Sr);
        self.read_i32_at(sr)
    }

    /// The handled-events mask declared by a state.
    pub fn handled_events(&mut self, state: i32) -> u64 {
        let sr = self.get_register(Register::Sr);
        if state < 0 || state >= self.state_count() {
            self.set_fault(FaultKind::BoundsCheck);
            return 0;
        }
        let record = sr + 4 + state * 12;
        let high = self.read_i32_at(record) as u32;
        let low = self.read_i32_at(record + 4) as u32;
        ((high as u64) << 32) | low as u64
    }

    /// Handler entry offset and declared stack size for one event of
    /// one state, or `None` when the state does not handle the event.
    pub fn event_handler(&mut self, state: i32, kind: EventKind) -> Option<(i32, i32)> {
        let mask = self.handled_events(state);
        let bit = kind.bit();
        if mask & bit == 0 {
            return None;
        }
        let sr = self.get_register(Register::Sr);
        let record = sr + 4 + state * 12;
        let block = self.read_i32_at(record + 8);
        // Handlers are packed in ascending kind order; count the set
        // bits below this one to find the slot.
        let index = (mask & (bit - 1)).count_ones() as i32;
        let slot = block + index * 8;
        let entry = self.read_i32_at(slot);
        let stack_size = self.read_i32_at(slot + 4);
        Some((entry, stack_size))
    }
}

/// A point-in-time copy of the register file, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterDump {
    pub tm: i32,
    pub ip: i32,
    pub sp: i32,
    pub bp: i32,
    pub cs: i32,
    pub ns: i32,
    pub ce: u64,
    pub er: u64,
    pub ie: u64,
    pub hr: i32,
    pub hp: i32,
    pub gfr: i32,
    pub sr: i32,
    pub esr: f32,
    pub slr: f32,
    pub fr: i32,
    pub vn: i32,
}

impl RegisterDump {
    /// Captures the current register file.
    pub fn capture(memory: &MemoryImage) -> Self {
        let major = memory.major_version().unwrap_or(2);
        Self {
            tm: memory.get_register(Register::Tm),
            ip: memory.get_register(Register::Ip),
            sp: memory.get_register(Register::Sp),
            bp: memory.get_register(Register::Bp),
            cs: memory.get_register(Register::Cs),
            ns: memory.get_register(Register::Ns),
            ce: memory.get_event_register(Register::Ce, major),
            er: memory.get_event_register(Register::Er, major),
            ie: memory.get_event_register(Register::Ie, major),
            hr: memory.get_register(Register::Hr),
            hp: memory.get_register(Register::Hp),
            gfr: memory.get_register(Register::Gfr),
            sr: memory.get_register(Register::Sr),
            esr: memory.get_register_f32(Register::Esr),
            slr: memory.get_register_f32(Register::Slr),
            fr: memory.get_register(Register::Fr),
            vn: memory.get_register(Register::Vn),
        }
    }
}

impl fmt::Display for RegisterDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ip: {:#X}", self.ip)?;
        writeln!(f, "sp: {:#X}", self.sp)?;
        writeln!(f, "bp: {:#X}", self.bp)?;
        writeln!(f, "cs: {}", self.cs)?;
        writeln!(f, "ns: {}", self.ns)?;
        writeln!(f, "ce: {:#X}", self.ce)?;
        writeln!(f, "er: {:#X}", self.er)?;
        writeln!(f, "ie: {:#X}", self.ie)?;
        writeln!(f, "hr: {:#X}", self.hr)?;
        writeln!(f, "hp: {:#X}", self.hp)?;
        writeln!(f, "gfr: {:#X}", self.gfr)?;
        writeln!(f, "sr: {:#X}", self.sr)?;
        writeln!(f, "esr: {}", self.esr)?;
        writeln!(f, "slr: {}", self.slr)?;
        writeln!(f, "fr: {}", self.fr)?;
        write!(f, "vn: {:#X}", self.vn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_image(size: i32) -> MemoryImage {
        let mut buffer = vec![0u8; size as usize];
        buffer[0..4].copy_from_slice(&size.to_be_bytes());
        let mut image = MemoryImage::from_bytes(buffer).expect("valid image");
        image.set_register(Register::Vn, VERSION_2);
        image.set_register(Register::Hr, HEADER_SIZE);
        image.set_register(Register::Hp, HEADER_SIZE);
        image.set_register(Register::Sp, size);
        image.set_register(Register::Bp, size);
        image
    }

    #[test]
    fn rejects_truncated_images() {
        assert!(matches!(
            MemoryImage::from_bytes(vec![0u8; 16]),
            Err(VmError::ImageTooSmall { .. })
        ));
    }

    #[test]
    fn rejects_size_mismatch() {
        let mut buffer = vec![0u8; 256];
        buffer[0..4].copy_from_slice(&512i32.to_be_bytes());
        assert!(matches!(
            MemoryImage::from_bytes(buffer),
            Err(VmError::ImageSizeMismatch { .. })
        ));
    }

    #[test]
    fn push_pop_restores_sp() {
        let mut image = blank_image(256);
        let sp0 = image.get_register(Register::Sp);

        image.push_i32(0x1234_5678);
        image.push_f32(1.5);
        image.push_vector(Vector3::new(1.0, 2.0, 3.0));
        image.push_quaternion(Quaternion::new(0.0, 0.0, 0.0, 1.0));

        assert_eq!(image.pop_quaternion(), Quaternion::IDENTITY);
        assert_eq!(image.pop_vector(), Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(image.pop_f32(), 1.5);
        assert_eq!(image.pop_i32(), 0x1234_5678);

        assert_eq!(image.get_register(Register::Sp), sp0);
        assert_eq!(image.fault(), None);
    }

    #[test]
    fn push_beyond_heap_faults_collision() {
        let mut image = blank_image(128);
        image.set_register(Register::Hp, 124);
        image.set_register(Register::Sp, 128);
        image.push_i32(1);
        image.push_i32(2);
        assert_eq!(image.fault(), Some(FaultKind::StackHeapCollision));
        // The first push landed, the second did not move SP.
        assert_eq!(image.get_register(Register::Sp), 124);
    }

    #[test]
    fn pop_past_top_faults_bounds() {
        let mut image = blank_image(128);
        image.set_register(Register::Sp, 128);
        let value = image.pop_i32();
        assert_eq!(value, 0);
        assert_eq!(image.fault(), Some(FaultKind::BoundsCheck));
    }

    #[test]
    fn out_of_range_reads_fault_and_leave_memory() {
        let mut image = blank_image(128);
        let before = image.as_bytes().to_vec();
        assert_eq!(image.read_i32_at(10_000), 0);
        image.write_i32_at(-4, 7);
        assert_eq!(image.fault(), Some(FaultKind::BoundsCheck));
        let mut after = image.as_bytes().to_vec();
        // Only the fault register may differ.
        let fr = Register::Fr.offset() as usize;
        after[fr..fr + 4].copy_from_slice(&before[fr..fr + 4]);
        assert_eq!(before, after);
    }

    #[test]
    fn first_fault_wins() {
        let mut image = blank_image(128);
        image.set_fault(FaultKind::Math);
        image.set_fault(FaultKind::HeapError);
        assert_eq!(image.fault(), Some(FaultKind::Math));
        image.clear_fault();
        assert_eq!(image.fault(), None);
    }

    #[test]
    fn event_registers_mask_by_version() {
        let mut image = blank_image(128);
        let wide = 0x1_0000_0003u64;
        image.set_event_register(Register::Ce, wide, 2);
        assert_eq!(image.get_event_register(Register::Ce, 2), wide);
        image.set_event_register(Register::Ce, wide, 1);
        assert_eq!(image.get_event_register(Register::Ce, 2), 3);
    }

    #[test]
    fn heap_bias_round_trips() {
        let mut image = blank_image(256);
        image.set_register(Register::Hr, 100);
        assert_eq!(image.heap_absolute(0), None);
        assert_eq!(image.heap_absolute(1), Some(100));
        assert_eq!(image.heap_biased(100), 1);
        assert_eq!(image.heap_absolute(image.heap_biased(163)), Some(163));
    }

    #[test]
    fn locals_are_bp_relative() {
        let mut image = blank_image(256);
        image.set_register(Register::Bp, 200);
        image.local_store(-8, 42);
        assert_eq!(image.read_i32_at(192), 42);
        assert_eq!(image.local_load(-8), 42);
    }
}
