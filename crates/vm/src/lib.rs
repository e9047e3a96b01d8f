//! # Totem virtual machine
//!
//! Execution core for the Totem scripting language: a bytecode VM that
//! runs untrusted, event-driven user scripts inside a multi-user
//! simulation. A VM instance owns one program image — a single flat
//! byte buffer holding registers, globals, the function and state
//! tables, a downward-growing stack and a reference-counted heap — and
//! is driven by the host one instruction at a time through
//! [`ScriptVm::step`].
//!
//! The host supplies built-in script functions through the library
//! registry ([`LibraryFunction`]) and feeds external stimuli through
//! the event queue ([`Event`]); the scheduler dispatches handlers of
//! the current state and performs state transitions when a frame is
//! not in progress.
//!
//! ```no_run
//! use totem_vm::ScriptVm;
//! use uuid::Uuid;
//!
//! let mut vm = ScriptVm::from_file("script.tvm")?;
//! let actor = Uuid::nil();
//! while vm.fault().is_none() && !vm.is_idle() {
//!     vm.step(false, &actor);
//! }
//! # Ok::<(), totem_vm::VmError>(())
//! ```

pub use self::builder::{CodeBuf, ImageBuilder, StateDef};
pub use self::error::{FaultKind, VmError, VmResult};
pub use self::event::{Event, EventKind, EventQueue};
pub use self::library::{LibraryExec, LibraryFunction, DEFAULT_LIBRARY};
pub use self::memory::{
    MemoryImage, Register, RegisterDump, GLOBALS_BASE, HEADER_SIZE, VERSION_1_END, VERSION_2,
};
pub use self::op_code::OpCode;
pub use self::value::{Quaternion, ScriptValue, TypeTag, Vector3};
pub use self::vm::{ScriptVm, StepStatus, STEP_ENERGY_COST};

pub mod builder;
pub mod error;
pub mod event;
pub mod heap;
mod interpreter;
pub mod library;
pub mod memory;
pub mod op_code;
mod ops;
#[cfg(test)]
mod tests;
pub mod value;
mod vm;
