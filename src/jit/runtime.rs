//! JIT driver: translate once, run once, release.
//!
//! Owns the executable buffer and the dispatch table for the duration of
//! one execution. On any translation error the buffer is discarded
//! without ever being entered.

use std::mem;

use tracing::debug;

use crate::cpu::{Cpu, Halt, VmError};

use super::compiler::{self, MAX_SNIPPET_BYTES, WRAPPER_BYTES};
use super::dispatch::DispatchTable;
use super::emitter::CodeBuf;
use super::exec::ExecMem;

/// Translates the VM's code section to host code and executes it.
///
/// On return the register file and guest memory reflect the completed
/// execution, exactly as the interpreter would have left them. The halt
/// reason mirrors the interpreter's: `Exit` for an exit ecall, `Break`
/// for an ebreak or for falling off the end of the code section.
pub fn run(vm: &mut Cpu) -> Result<Halt, VmError> {
    let words = (vm.layout.code_size / 4) as usize;
    let mut exec = ExecMem::new(words * MAX_SNIPPET_BYTES + WRAPPER_BYTES)?;
    let mut table = DispatchTable::new(vm.layout.code_offset, vm.layout.code_size);

    let code_base = exec.base() as usize;
    let code_len = {
        let mut asm = CodeBuf::new(exec.as_mut_slice());
        compiler::translate_section(vm, &mut asm, &mut table, code_base)?;
        asm.pos()
    };

    debug!(
        guest_bytes = vm.layout.code_size,
        host_bytes = code_len,
        slots = table.len(),
        "code section translated"
    );

    vm.halt = None;
    vm.pending_error = None;
    vm.refresh_mem_ptr();

    // SAFETY: the buffer holds a complete translation (any error above
    // returned before this point). The generated code follows the SysV
    // ABI: it only clobbers caller-saved registers plus rbx, which it
    // saves and restores, and every guest jump goes through the fully
    // populated dispatch table. `table` and `exec` outlive the call, and
    // the CPU-state pointer stays valid for its whole duration.
    unsafe {
        let entry: extern "C" fn(*mut Cpu) = mem::transmute(exec.base());
        entry(vm as *mut Cpu);
    }

    if let Some(err) = vm.pending_error.take() {
        return Err(err);
    }
    Ok(vm.halt.take().unwrap_or(Halt::Break))
}
