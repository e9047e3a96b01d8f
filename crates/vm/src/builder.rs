//! Programmatic construction of program images.
//!
//! [`ImageBuilder`] assembles a complete, runnable image: header
//! registers, globals, the function table, the state table with
//! per-event handler records, and an empty heap below a fresh stack.
//! It exists for tests, tooling and the diagnostic CLI; it is not a
//! compiler, but it does fix the frame conventions compiled code is
//! expected to follow (see [`CodeBuf::begin_function`]).

use crate::error::VmResult;
use crate::event::EventKind;
use crate::memory::{MemoryImage, Register, GLOBALS_BASE, VERSION_2};
use crate::op_code::OpCode;
use crate::value::{Quaternion, TypeTag, Vector3};

/// A growing buffer of encoded instructions.
#[derive(Debug, Clone, Default)]
pub struct CodeBuf {
    bytes: Vec<u8>,
}

impl CodeBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Emits a bare opcode.
    pub fn emit(&mut self, op: OpCode) -> &mut Self {
        self.bytes.push(op as u8);
        self
    }

    /// Emits a raw byte.
    pub fn emit_byte(&mut self, value: u8) -> &mut Self {
        self.bytes.push(value);
        self
    }

    /// Emits a big-endian i32 immediate.
    pub fn emit_i32(&mut self, value: i32) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Emits a big-endian f32 immediate.
    pub fn emit_f32(&mut self, value: f32) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_bits().to_be_bytes());
        self
    }

    /// Emits a NUL-terminated string immediate.
    pub fn emit_cstr(&mut self, text: &str) -> &mut Self {
        self.bytes.extend_from_slice(text.as_bytes());
        self.bytes.push(0);
        self
    }

    // === Immediate pushes ===

    pub fn push_integer(&mut self, value: i32) -> &mut Self {
        self.emit(OpCode::PushArgI).emit_i32(value)
    }

    pub fn push_float(&mut self, value: f32) -> &mut Self {
        self.emit(OpCode::PushArgF).emit_f32(value)
    }

    pub fn push_byte(&mut self, value: u8) -> &mut Self {
        self.emit(OpCode::PushArgB).emit_byte(value)
    }

    pub fn push_string(&mut self, text: &str) -> &mut Self {
        self.emit(OpCode::PushArgS).emit_cstr(text)
    }

    pub fn push_vector(&mut self, value: Vector3) -> &mut Self {
        self.emit(OpCode::PushArgV)
            .emit_f32(value.x)
            .emit_f32(value.y)
            .emit_f32(value.z)
    }

    pub fn push_quaternion(&mut self, value: Quaternion) -> &mut Self {
        self.emit(OpCode::PushArgQ)
            .emit_f32(value.x)
            .emit_f32(value.y)
            .emit_f32(value.z)
            .emit_f32(value.s)
    }

    // === Typed operations ===

    /// Emits a binary opcode with its type-pair byte.
    pub fn binary(&mut self, op: OpCode, left: TypeTag, right: TypeTag) -> &mut Self {
        self.emit(op)
            .emit_byte(((left as u8) << 4) | (right as u8))
    }

    /// Emits a unary opcode with its type byte.
    pub fn unary(&mut self, op: OpCode, tag: TypeTag) -> &mut Self {
        self.emit(op).emit_byte(tag as u8)
    }

    /// Emits a cast with its packed source/destination byte.
    pub fn cast(&mut self, from: TypeTag, to: TypeTag) -> &mut Self {
        self.emit(OpCode::Cast)
            .emit_byte(((from as u8) << 4) | (to as u8))
    }

    // === Control flow ===

    pub fn jump(&mut self, relative: i32) -> &mut Self {
        self.emit(OpCode::Jump).emit_i32(relative)
    }

    pub fn jump_if(&mut self, tag: TypeTag, relative: i32) -> &mut Self {
        self.emit(OpCode::JumpIf)
            .emit_byte(tag as u8)
            .emit_i32(relative)
    }

    pub fn jump_nif(&mut self, tag: TypeTag, relative: i32) -> &mut Self {
        self.emit(OpCode::JumpNif)
            .emit_byte(tag as u8)
            .emit_i32(relative)
    }

    pub fn state(&mut self, index: i32) -> &mut Self {
        self.emit(OpCode::State).emit_i32(index)
    }

    pub fn print(&mut self, tag: TypeTag) -> &mut Self {
        self.emit(OpCode::Print).emit_byte(tag as u8)
    }

    // === Frame conventions ===
    //
    // A function body is wrapped by `begin_function`/`end_function`.
    // The call site pushes arguments left to right, then emits CALL;
    // the preamble moves the stashed return address onto the stack,
    // saves the caller's BP, re-bases BP and zeroes `locals` bytes of
    // frame space (at least 24: the reserved word, the return-address
    // slot and the library return scratch live below BP).

    /// Emits the function preamble.
    pub fn begin_function(&mut self, locals: i32) -> &mut Self {
        self.emit(OpCode::Push)
            .emit_i32(-8)
            .emit(OpCode::PushBp)
            .emit(OpCode::PushSp)
            .emit(OpCode::PopBp)
            .emit(OpCode::PushArgE)
            .emit_i32(locals)
    }

    /// Emits the function epilogue: drops the frame and returns.
    pub fn end_function(&mut self, locals: i32) -> &mut Self {
        self.emit(OpCode::PopArg).emit_i32(locals).emit(OpCode::Return)
    }

    /// Pops the value on top of the stack into the caller-provided
    /// return slot, which sits just above this frame's arguments.
    pub fn store_return(&mut self, args_size: i32) -> &mut Self {
        self.emit(OpCode::LoadP).emit_i32(8 + args_size)
    }

    /// Calls a function: arguments must already be on the stack.
    pub fn call(&mut self, index: i32) -> &mut Self {
        self.emit(OpCode::Call).emit_i32(index)
    }

    /// Opens a library call frame: a placeholder return word and the
    /// saved BP. Arguments are pushed after this, then
    /// [`Self::call_library`].
    pub fn begin_lib_call(&mut self) -> &mut Self {
        self.emit(OpCode::PushE).emit(OpCode::PushBp)
    }

    /// Invokes library slot `index`.
    pub fn call_library(&mut self, index: u8) -> &mut Self {
        self.emit(OpCode::CallLib).emit_byte(index)
    }

    /// Invokes a library slot with the two-byte index form.
    pub fn call_library_wide(&mut self, index: u16) -> &mut Self {
        self.emit(OpCode::CallLib2)
            .emit_byte((index >> 8) as u8)
            .emit_byte((index & 0xFF) as u8)
    }

    /// Ends an event handler: unwinds to BP and returns to the
    /// scheduler (the frame's return address is zero).
    pub fn end_handler(&mut self) -> &mut Self {
        self.emit(OpCode::PushBp)
            .emit(OpCode::PopSp)
            .emit(OpCode::Return)
    }
}

/// One event handler of a state.
#[derive(Debug, Clone)]
pub struct HandlerDef {
    kind: EventKind,
    stack_size: i32,
    code: CodeBuf,
}

/// A state: its handled events and their handlers.
#[derive(Debug, Clone, Default)]
pub struct StateDef {
    handlers: Vec<HandlerDef>,
}

impl StateDef {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a handler. `stack_size` is the frame space the
    /// scheduler allocates (arguments included); 32 bytes is enough
    /// for the reserved slots of an argument-less handler.
    pub fn on(mut self, kind: EventKind, stack_size: i32, code: CodeBuf) -> Self {
        self.handlers.push(HandlerDef {
            kind,
            stack_size,
            code,
        });
        self
    }

    fn mask(&self) -> u64 {
        self.handlers.iter().map(|h| h.kind.bit()).sum()
    }
}

/// Assembles complete program images.
#[derive(Debug)]
pub struct ImageBuilder {
    version: i32,
    globals: Vec<u8>,
    functions: Vec<CodeBuf>,
    states: Vec<StateDef>,
    stack_size: i32,
    energy: f32,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            version: VERSION_2,
            globals: Vec::new(),
            functions: Vec::new(),
            states: Vec::new(),
            stack_size: 1024,
            energy: 10_000.0,
        }
    }

    /// Selects the version marker (default: version 2).
    pub fn version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    /// Sets the stack region size in bytes.
    pub fn stack_size(mut self, size: i32) -> Self {
        self.stack_size = size;
        self
    }

    /// Sets the initial energy reserve.
    pub fn energy(mut self, energy: f32) -> Self {
        self.energy = energy;
        self
    }

    /// Adds an integer global; returns its offset for PUSHG/STOREG.
    pub fn add_global_integer(&mut self, value: i32) -> i32 {
        let offset = self.globals.len() as i32;
        self.globals.extend_from_slice(&value.to_be_bytes());
        offset
    }

    /// Adds a float global.
    pub fn add_global_float(&mut self, value: f32) -> i32 {
        self.add_global_integer(value.to_bits() as i32)
    }

    /// Adds a vector global (12 bytes).
    pub fn add_global_vector(&mut self, value: Vector3) -> i32 {
        let offset = self.add_global_float(value.x);
        self.add_global_float(value.y);
        self.add_global_float(value.z);
        offset
    }

    /// Adds a function body (wrapped with `begin_function` /
    /// `end_function` by the caller); returns its CALL index.
    pub fn add_function(&mut self, code: CodeBuf) -> i32 {
        self.functions.push(code);
        self.functions.len() as i32 - 1
    }

    /// Adds a state; returns its index. State 0 is the initial state.
    pub fn add_state(&mut self, state: StateDef) -> i32 {
        self.states.push(state);
        self.states.len() as i32 - 1
    }

    /// Lays out and returns the image bytes.
    pub fn build(mut self) -> VmResult<Vec<u8>> {
        // Handler records are looked up by ascending kind order.
        for state in &mut self.states {
            state.handlers.sort_by_key(|h| h.kind as u8);
        }

        let gfr = GLOBALS_BASE + self.globals.len() as i32;

        // Function region: count, entry table, then per-function
        // blocks of (code offset, code).
        let entry_table = 4 + 4 * self.functions.len() as i32;
        let mut function_entries = Vec::new();
        let mut cursor = entry_table;
        for code in &self.functions {
            function_entries.push(cursor);
            cursor += 4 + code.len() as i32;
        }
        let sr = gfr + cursor;

        // State region: count, records, then per-state blocks of
        // handler slots followed by handler code.
        let records = 4 + 12 * self.states.len() as i32;
        let mut state_blocks = Vec::new();
        let mut cursor = sr + records;
        for state in &self.states {
            let block = cursor;
            let slots = 8 * state.handlers.len() as i32;
            let mut entries = Vec::new();
            let mut code_cursor = block + slots;
            for handler in &state.handlers {
                entries.push(code_cursor);
                code_cursor += handler.code.len() as i32;
            }
            state_blocks.push((block, entries));
            cursor = code_cursor;
        }
        let hr = cursor;
        let total = hr + self.stack_size;

        let mut buffer = vec![0u8; total as usize];
        fn put_i32(buffer: &mut [u8], at: i32, value: i32) {
            let at = at as usize;
            buffer[at..at + 4].copy_from_slice(&value.to_be_bytes());
        }

        // Globals.
        buffer[GLOBALS_BASE as usize..gfr as usize].copy_from_slice(&self.globals);

        // Function table.
        put_i32(&mut buffer, gfr, self.functions.len() as i32);
        for (index, entry) in function_entries.iter().enumerate() {
            put_i32(&mut buffer, gfr + 4 + 4 * index as i32, *entry);
            let block = gfr + entry;
            put_i32(&mut buffer, block, 4);
            let code = &self.functions[index];
            let start = (block + 4) as usize;
            buffer[start..start + code.len()].copy_from_slice(code.as_bytes());
        }

        // State table.
        put_i32(&mut buffer, sr, self.states.len() as i32);
        for (index, state) in self.states.iter().enumerate() {
            let record = sr + 4 + 12 * index as i32;
            let mask = state.mask();
            buffer[record as usize..record as usize + 8].copy_from_slice(&mask.to_be_bytes());
            let (block, entries) = &state_blocks[index];
            put_i32(&mut buffer, record + 8, *block);
            for (slot, (handler, entry)) in
                state.handlers.iter().zip(entries.iter()).enumerate()
            {
                let at = block + 8 * slot as i32;
                put_i32(&mut buffer, at, *entry);
                put_i32(&mut buffer, at + 4, handler.stack_size);
                let start = *entry as usize;
                buffer[start..start + handler.code.len()]
                    .copy_from_slice(handler.code.as_bytes());
            }
        }

        // Registers.
        let mut image = MemoryImage::from_bytes({
            put_i32(&mut buffer, Register::Tm.offset(), total);
            buffer
        })?;
        image.set_register(Register::Vn, self.version);
        image.set_register(Register::Sp, total);
        image.set_register(Register::Bp, total);
        image.set_register(Register::Hr, hr);
        image.set_register(Register::Hp, hr);
        image.set_register(Register::Gfr, gfr);
        image.set_register(Register::Sr, sr);
        image.set_register_f32(Register::Esr, self.energy);
        let major = image.major_version().unwrap_or(2);
        if let Some(first) = self.states.first() {
            image.set_event_register(Register::Ce, EventKind::StateEntry.bit(), major);
            image.set_event_register(Register::Er, first.mask(), major);
        }

        Ok(image.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryImage, Register};

    #[test]
    fn layout_regions_are_ordered() {
        let mut builder = ImageBuilder::new();
        builder.add_global_integer(7);
        let mut code = CodeBuf::new();
        code.begin_function(24).end_function(24);
        builder.add_function(code);

        let mut handler = CodeBuf::new();
        handler.end_handler();
        builder.add_state(StateDef::new().on(EventKind::StateEntry, 32, handler));

        let bytes = builder.build().expect("builds");
        let mut image = MemoryImage::from_bytes(bytes).expect("valid image");

        let gfr = image.get_register(Register::Gfr);
        let sr = image.get_register(Register::Sr);
        let hr = image.get_register(Register::Hr);
        let tm = image.get_register(Register::Tm);
        assert!(GLOBALS_BASE < gfr && gfr < sr && sr < hr && hr < tm);
        assert_eq!(image.get_register(Register::Hp), hr);
        assert_eq!(image.get_register(Register::Sp), tm);
        assert_eq!(image.global_load(0), 7);
    }

    #[test]
    fn state_records_resolve_handlers() {
        let mut builder = ImageBuilder::new();
        let mut touch = CodeBuf::new();
        touch.end_handler();
        let mut entry = CodeBuf::new();
        entry.end_handler();
        builder.add_state(
            StateDef::new()
                .on(EventKind::TouchStart, 48, touch)
                .on(EventKind::StateEntry, 32, entry),
        );
        let bytes = builder.build().expect("builds");
        let mut image = MemoryImage::from_bytes(bytes).expect("valid image");

        let mask = image.handled_events(0);
        assert_eq!(
            mask,
            EventKind::StateEntry.bit() | EventKind::TouchStart.bit()
        );

        let (entry_at, entry_stack) = image.event_handler(0, EventKind::StateEntry).unwrap();
        let (touch_at, touch_stack) = image.event_handler(0, EventKind::TouchStart).unwrap();
        assert_eq!(entry_stack, 32);
        assert_eq!(touch_stack, 48);
        assert!(entry_at < touch_at, "handlers pack in kind order");
        assert_eq!(image.event_handler(0, EventKind::Timer), None);
    }

    #[test]
    fn function_entries_double_indirect() {
        let mut builder = ImageBuilder::new();
        let mut code = CodeBuf::new();
        code.begin_function(24).end_function(24);
        let len = code.len() as i32;
        builder.add_function(code.clone());
        builder.add_function(code);
        let bytes = builder.build().expect("builds");
        let mut image = MemoryImage::from_bytes(bytes).expect("valid image");

        let gfr = image.get_register(Register::Gfr);
        assert_eq!(image.read_i32_at(gfr), 2);
        let entry0 = image.read_i32_at(gfr + 4);
        let entry1 = image.read_i32_at(gfr + 8);
        assert_eq!(entry1 - entry0, 4 + len);
        // Block begins with the code offset relative to itself.
        assert_eq!(image.read_i32_at(gfr + entry0), 4);
    }
}
