//! The virtual machine instance: image, event queue, library registry,
//! the `step` entry point and the event scheduler.

use std::fmt;
use std::io::Write;
use std::path::Path;

use bitflags::bitflags;
use log::warn;
use uuid::Uuid;

use crate::error::{FaultKind, VmResult};
use crate::event::{Event, EventKind, EventQueue};
use crate::heap;
use crate::library::{LibraryFunction, DEFAULT_LIBRARY};
use crate::memory::{MemoryImage, Register, RegisterDump};
use crate::value::ScriptValue;

/// Energy debited from ESR for every executed instruction.
pub const STEP_ENERGY_COST: f32 = 0.1;

bitflags! {
    /// Outcome of one `step` call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StepStatus: u8 {
        /// The script has completed and should be deleted.
        const DELETE = 0b001;
        /// Deletion should credit the script's owner.
        const CREDIT_MONEY = 0b010;
        /// The script is still running.
        const NO_DELETE = 0b100;
    }
}

/// A single-script virtual machine over one program image.
///
/// The host drives execution in slices: one instruction (or one
/// scheduler pass, when IP is zero) per [`ScriptVm::step`] call.
pub struct ScriptVm {
    pub(crate) memory: MemoryImage,
    pub(crate) events: EventQueue,
    pub(crate) library: Vec<LibraryFunction>,
    pub(crate) instruction_count: u64,
    pub(crate) print_out: Option<Box<dyn Write + Send>>,
    pub(crate) trace_out: Option<Box<dyn Write + Send>>,
}

impl fmt::Debug for ScriptVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptVm")
            .field("registers", &RegisterDump::capture(&self.memory))
            .field("pending_events", &self.events.len())
            .field("library_slots", &self.library.len())
            .field("instruction_count", &self.instruction_count)
            .finish()
    }
}

impl ScriptVm {
    /// Wraps a program image. The buffer must carry a valid header;
    /// the version marker is checked lazily by `step`, which faults
    /// `VersionMismatch` for unknown markers.
    pub fn new(image: Vec<u8>) -> VmResult<Self> {
        Ok(Self {
            memory: MemoryImage::from_bytes(image)?,
            events: EventQueue::new(),
            library: DEFAULT_LIBRARY.clone(),
            instruction_count: 0,
            print_out: None,
            trace_out: None,
        })
    }

    /// Reads a program image from disk.
    pub fn from_file(path: impl AsRef<Path>) -> VmResult<Self> {
        Self::new(std::fs::read(path)?)
    }

    /// Replaces a library registry slot. Slots between the current end
    /// of the registry and `slot` are filled with inert void entries.
    pub fn register_library(&mut self, slot: usize, function: LibraryFunction) -> VmResult<()> {
        function.validate(slot)?;
        while self.library.len() < slot {
            self.library.push(LibraryFunction {
                name: format!("reserved_{}", self.library.len()),
                args: String::new(),
                return_type: None,
                energy_use: 0.0,
                sleep_time: 0.0,
                exec: |_, _, _| {},
            });
        }
        if slot == self.library.len() {
            self.library.push(function);
        } else {
            self.library[slot] = function;
        }
        Ok(())
    }

    /// Appends an event to the pending queue and raises its bit in CE.
    /// The host is expected to filter events the script's states never
    /// handle.
    pub fn enqueue_event(&mut self, event: Event) {
        let major = self.memory.major_version().unwrap_or(2);
        let pending =
            self.memory.get_event_register(Register::Ce, major) | event.kind.bit();
        self.memory.set_event_register(Register::Ce, pending, major);
        self.events.push_back(event);
    }

    /// Executes one instruction, or one scheduler pass when no frame
    /// is in progress. Returns immediately once a fault is latched;
    /// [`Self::fault_message`] carries the message until the host
    /// clears it.
    pub fn step(&mut self, trace: bool, actor: &Uuid) -> StepStatus {
        let major = match self.memory.major_version() {
            Some(major) => major,
            None => {
                self.memory.set_fault(FaultKind::VersionMismatch);
                0
            }
        };
        if let Some(fault) = self.memory.fault() {
            if trace {
                self.trace_line(format_args!("fault: {}", fault.message()));
            }
            return StepStatus::NO_DELETE;
        }

        let ip = self.memory.get_register(Register::Ip);
        if ip != 0 {
            self.instruction_count += 1;
            let completed = self.execute_instruction(ip, major, trace, actor);
            self.memory.add_register_f32(Register::Esr, -STEP_ENERGY_COST);
            if trace {
                self.trace_registers();
            }
            if completed {
                StepStatus::DELETE | StepStatus::CREDIT_MONEY
            } else {
                StepStatus::NO_DELETE
            }
        } else {
            self.run_scheduler(major);
            StepStatus::NO_DELETE
        }
    }

    // === Scheduler ===

    /// Runs when IP is zero: commits state transitions, raising the
    /// synthetic exit/entry events at the boundary, then dispatches
    /// the highest-priority pending event the current state handles.
    fn run_scheduler(&mut self, major: u32) {
        self.memory.set_event_register(Register::Ie, 0, major);

        let next_state = self.memory.get_register(Register::Ns);
        let current_state = self.memory.get_register(Register::Cs);
        let mut current_events = self.memory.get_event_register(Register::Ce, major);
        let event_register = self.memory.get_event_register(Register::Er, major);

        if next_state != current_state {
            // State changes flush whatever was waiting.
            self.events.clear();

            let exit = EventKind::StateExit.bit();
            if current_events & exit != 0 {
                self.memory.set_event_register(Register::Ie, exit, major);
                current_events &= !exit;
                self.memory
                    .set_event_register(Register::Ce, current_events, major);
                if event_register & exit != 0 {
                    self.synthesize_frame(current_state, EventKind::StateExit, &[], major);
                    return;
                }
            }

            // Commit: the new state starts life with only state_entry
            // pending and its own handler mask in ER.
            self.memory.set_event_register(
                Register::Ce,
                EventKind::StateEntry.bit(),
                major,
            );
            self.memory.set_register(Register::Cs, next_state);
            let handled = self.memory.handled_events(next_state);
            self.memory.set_event_register(Register::Er, handled, major);
        }

        let current_state = self.memory.get_register(Register::Cs);
        let current_events = self.memory.get_event_register(Register::Ce, major);
        let event_register = self.memory.get_event_register(Register::Er, major);

        let entry = EventKind::StateEntry.bit();
        let rez = EventKind::Rez.bit();

        if current_events & entry != 0 && event_register & entry != 0 {
            self.synthesize_frame(current_state, EventKind::StateEntry, &[], major);
            return;
        }

        if current_events & rez != 0 && event_register & rez != 0 {
            if let Some(event) = self
                .events
                .remove_first_matching(|event| event.kind == EventKind::Rez)
            {
                self.synthesize_frame(current_state, EventKind::Rez, &event.args, major);
                return;
            }
        }

        loop {
            match self.events.pop_front() {
                Some(event) => {
                    if event.kind.bit() & event_register != 0 {
                        self.synthesize_frame(current_state, event.kind, &event.args, major);
                        return;
                    }
                    // The incoming filter should have caught this.
                    warn!(
                        "dropping {} event: state {} does not handle it",
                        event.kind.name(),
                        current_state
                    );
                }
                None => {
                    let pending = current_events & event_register;
                    if let Some(kind) = EventKind::first_in_mask(pending) {
                        self.synthesize_frame(current_state, kind, &[], major);
                    }
                    return;
                }
            }
        }
    }

    /// Builds an event-handler call frame: zero return address, saved
    /// SP, arguments, then padding out to the handler's declared frame
    /// size, with BP anchored above the argument area.
    fn synthesize_frame(
        &mut self,
        state: i32,
        kind: EventKind,
        args: &[ScriptValue],
        major: u32,
    ) {
        let Some((entry, declared)) = self.memory.event_handler(state, kind) else {
            warn!(
                "state {state} has no handler for {} despite its mask",
                kind.name()
            );
            return;
        };

        self.memory.push_i32(0);
        let sp = self.memory.get_register(Register::Sp);
        self.memory.push_i32(sp);

        let mut size = 0;
        for arg in args {
            size += self.push_event_arg(arg);
        }

        let additional = declared - size;
        self.memory.push_zeroed(additional);

        let sp = self.memory.get_register(Register::Sp);
        self.memory.set_register(Register::Bp, sp + additional + size);

        self.memory.set_event_register(Register::Ie, kind.bit(), major);
        let pending = self.memory.get_event_register(Register::Ce, major) & !kind.bit();
        self.memory.set_event_register(Register::Ce, pending, major);

        self.memory.set_register(Register::Ip, entry);
    }

    /// Pushes one event argument, materializing reference types onto
    /// the heap as provisional cells. Returns the pushed size.
    fn push_event_arg(&mut self, value: &ScriptValue) -> i32 {
        match value {
            ScriptValue::Integer(v) => self.memory.push_i32(*v),
            ScriptValue::Float(v) => self.memory.push_f32(*v),
            ScriptValue::Vector(v) => self.memory.push_vector(*v),
            ScriptValue::Quaternion(q) => self.memory.push_quaternion(*q),
            ScriptValue::String(_) | ScriptValue::Key(_) | ScriptValue::List(_) => {
                let max = self.memory.max_heap_size();
                let address = heap::heap_add(&mut self.memory, value, max, false);
                self.memory.push_i32(address);
            }
        }
        value.stack_footprint()
    }

    // === Introspection ===

    /// The current fault, if any.
    pub fn fault(&self) -> Option<FaultKind> {
        self.memory.fault()
    }

    /// The fault message string, empty when no fault is latched.
    pub fn fault_message(&self) -> &'static str {
        self.memory.fault().map(FaultKind::message).unwrap_or("")
    }

    /// Clears the fault register, letting `step` resume.
    pub fn clear_fault(&mut self) {
        self.memory.clear_fault();
    }

    /// Latches a host-asserted fault (sandbox limits, chat overrun,
    /// listen caps, missing inventory). First fault wins, as with
    /// faults raised by the interpreter itself.
    pub fn raise_fault(&mut self, fault: FaultKind) {
        self.memory.set_fault(fault);
    }

    /// Total instructions executed by this instance.
    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    /// A copy of the register file.
    pub fn registers(&self) -> RegisterDump {
        RegisterDump::capture(&self.memory)
    }

    /// Remaining energy reserve.
    pub fn energy(&self) -> f32 {
        self.memory.get_register_f32(Register::Esr)
    }

    /// Queued sleep time; the host skips `step` while this is positive.
    pub fn sleep_remaining(&self) -> f32 {
        self.memory.get_register_f32(Register::Slr)
    }

    /// Debits elapsed wall-clock time from the sleep register,
    /// clamping at zero. Called by the host between scheduling slices.
    pub fn reduce_sleep(&mut self, elapsed: f32) {
        let remaining = (self.sleep_remaining() - elapsed).max(0.0);
        self.memory.set_register_f32(Register::Slr, remaining);
    }

    /// Whether the VM has nothing left to do: no frame in progress, no
    /// transition pending, nothing dispatchable.
    pub fn is_idle(&self) -> bool {
        let major = self.memory.major_version().unwrap_or(2);
        let ip = self.memory.get_register(Register::Ip);
        let cs = self.memory.get_register(Register::Cs);
        let ns = self.memory.get_register(Register::Ns);
        let ce = self.memory.get_event_register(Register::Ce, major);
        let er = self.memory.get_event_register(Register::Er, major);
        ip == 0 && ns == cs && self.events.is_empty() && ce & er == 0
    }

    /// The image buffer is the snapshot: persistence is copying it.
    pub fn snapshot(&self) -> Vec<u8> {
        self.memory.as_bytes().to_vec()
    }

    /// Restores a snapshot taken from the same image.
    pub fn restore(&mut self, bytes: &[u8]) -> VmResult<()> {
        self.memory.restore(bytes)
    }

    /// Redirects script `PRINT` output (default: stdout).
    pub fn set_print_writer(&mut self, writer: Box<dyn Write + Send>) {
        self.print_out = Some(writer);
    }

    /// Redirects the instruction trace (default: the `log` facade at
    /// debug level, target `totem_vm::trace`).
    pub fn set_trace_writer(&mut self, writer: Box<dyn Write + Send>) {
        self.trace_out = Some(writer);
    }

    // === Output plumbing ===

    pub(crate) fn print_line(&mut self, text: &str) {
        match &mut self.print_out {
            Some(writer) => {
                let _ = writeln!(writer, "{text}");
            }
            None => println!("{text}"),
        }
    }

    pub(crate) fn trace_line(&mut self, args: fmt::Arguments<'_>) {
        match &mut self.trace_out {
            Some(writer) => {
                let _ = writeln!(writer, "{args}");
            }
            None => log::debug!(target: "totem_vm::trace", "{args}"),
        }
    }

    fn trace_registers(&mut self) {
        let ip = self.memory.get_register(Register::Ip);
        let sp = self.memory.get_register(Register::Sp);
        let bp = self.memory.get_register(Register::Bp);
        let hr = self.memory.get_register(Register::Hr);
        let hp = self.memory.get_register(Register::Hp);
        self.trace_line(format_args!(
            "ip: {ip:#X}\nsp: {sp:#X}\nbp: {bp:#X}\nhr: {hr:#X}\nhp: {hp:#X}"
        ));
    }
}
