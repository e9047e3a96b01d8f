//! Scenario tests driving whole images through the public API.

use std::io::Write;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::ScriptVm;

mod vm_execution;

/// A `Write` sink tests can read back, for capturing PRINT output and
/// instruction traces.
#[derive(Clone, Default)]
pub(crate) struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Steps the VM until it has nothing left to do, a fault latches, or
/// the step budget runs out (which fails the test).
pub(crate) fn run_to_idle(vm: &mut ScriptVm, max_steps: u32) {
    let actor = Uuid::nil();
    for _ in 0..max_steps {
        if vm.fault().is_some() || vm.is_idle() {
            return;
        }
        vm.step(false, &actor);
    }
    panic!("vm did not go idle within {max_steps} steps");
}
