//! Ahead-of-execution translation of the guest code section to x86-64.
//!
//! The translator makes exactly one pass over the code section before
//! anything runs: each RV32I instruction is lowered to a short host
//! snippet, and a dispatch table maps every guest PC in the section to
//! the host address of its snippet. Control flow (branches, JAL, JALR)
//! goes through the table, which makes every snippet independently
//! relocatable.
//!
//! Generated code keeps no guest register in a host register across
//! snippet boundaries: every snippet loads its sources from the register
//! file in memory and writes its result straight back. If execution stops
//! between two snippets, the observable register state is identical to
//! the interpreter's at the same point.
//!
//! There is no re-translation, no tiering and no cache: the buffer and
//! dispatch table live for a single [`runtime::run`] call and are released
//! when it returns. Guest writes into the code section after translation
//! are not reflected in the generated code.

pub mod compiler;
pub mod dispatch;
pub mod emitter;
pub mod exec;
pub mod runtime;

pub use dispatch::DispatchTable;
pub use emitter::CodeBuf;
pub use exec::ExecMem;
pub use runtime::run;
