//! The host library-call interface.
//!
//! The VM never implements built-in script functions itself; it holds
//! a registry of [`LibraryFunction`] descriptors populated by the host
//! before execution starts. `CALLLIB` marshals arguments off the stack
//! per the descriptor's signature string, invokes the host callback
//! synchronously, marshals the return value back, and debits the
//! energy and sleep registers.

use log::info;
use once_cell::sync::Lazy;
use uuid::Uuid;

use crate::error::{VmError, VmResult};
use crate::value::{ScriptValue, TypeTag};

/// Host callback: fills the return slot (when the descriptor declares
/// a return type) from the marshaled arguments. The actor id
/// identifies the entity running the script.
pub type LibraryExec = fn(&mut Option<ScriptValue>, &[ScriptValue], &Uuid);

/// Descriptor for one host-provided built-in function.
#[derive(Debug, Clone)]
pub struct LibraryFunction {
    /// Name used in traces and diagnostics.
    pub name: String,
    /// Argument signature: one letter per argument from `i f k s l v q`.
    pub args: String,
    /// Declared return type, or `None` for a void function.
    pub return_type: Option<TypeTag>,
    /// Energy debited from ESR per call.
    pub energy_use: f32,
    /// Sleep added to SLR per call.
    pub sleep_time: f32,
    /// The host implementation.
    pub exec: LibraryExec,
}

impl LibraryFunction {
    /// Checks the signature letters, rejecting malformed descriptors
    /// before they can corrupt argument marshaling.
    pub fn validate(&self, slot: usize) -> VmResult<()> {
        for letter in self.args.chars() {
            if TypeTag::from_letter(letter).is_none() {
                return Err(VmError::InvalidLibraryFunction {
                    slot,
                    reason: format!("unknown argument letter {letter:?} in {:?}", self.args),
                });
            }
        }
        Ok(())
    }
}

/// The default registry cloned into each new VM. Hosts overwrite any
/// slot with [`crate::ScriptVm::register_library`]; these few built-ins
/// keep bare images and the diagnostic CLI useful without a host.
pub static DEFAULT_LIBRARY: Lazy<Vec<LibraryFunction>> = Lazy::new(|| {
    vec![
        LibraryFunction {
            name: "log_message".into(),
            args: "s".into(),
            return_type: None,
            energy_use: 10.0,
            sleep_time: 0.0,
            exec: |_ret, args, actor| {
                if let Some(ScriptValue::String(text)) = args.first() {
                    info!(target: "totem_vm::script", "[{actor}] {text}");
                }
            },
        },
        LibraryFunction {
            name: "actor_key".into(),
            args: String::new(),
            return_type: Some(TypeTag::Key),
            energy_use: 5.0,
            sleep_time: 0.0,
            exec: |ret, _args, actor| {
                *ret = Some(ScriptValue::Key(actor.to_string()));
            },
        },
        LibraryFunction {
            name: "list_length".into(),
            args: "l".into(),
            return_type: Some(TypeTag::Integer),
            energy_use: 5.0,
            sleep_time: 0.0,
            exec: |ret, args, _actor| {
                let length = match args.first() {
                    Some(ScriptValue::List(items)) => items.len() as i32,
                    _ => 0,
                };
                *ret = Some(ScriptValue::Integer(length));
            },
        },
    ]
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_is_well_formed() {
        for (slot, function) in DEFAULT_LIBRARY.iter().enumerate() {
            function.validate(slot).expect("valid descriptor");
        }
    }

    #[test]
    fn validate_rejects_bad_letters() {
        let bad = LibraryFunction {
            name: "broken".into(),
            args: "ix".into(),
            return_type: None,
            energy_use: 0.0,
            sleep_time: 0.0,
            exec: |_, _, _| {},
        };
        assert!(bad.validate(3).is_err());
    }

    #[test]
    fn list_length_counts_elements() {
        let function = &DEFAULT_LIBRARY[2];
        let mut ret = None;
        let args = vec![ScriptValue::List(vec![
            ScriptValue::Integer(1),
            ScriptValue::Integer(2),
        ])];
        (function.exec)(&mut ret, &args, &Uuid::nil());
        assert_eq!(ret, Some(ScriptValue::Integer(2)));
    }
}
