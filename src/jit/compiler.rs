//! Per-instruction lowering from RV32I to x86-64 snippets.
//!
//! Each guest instruction becomes one self-contained snippet: sources are
//! loaded from the register file slots, the operation runs in `eax` (with
//! `ecx`/`edx` as secondary scratch), and the result is stored back.
//! Writes to guest x0 are elided at emit time. Immediates, masked branch
//! targets, dispatch-slot addresses and the host ecall address are all
//! baked into the instruction stream, which is sound because translation
//! runs exactly once, before execution.
//!
//! Control transfers leave the snippet via an indirect jump through the
//! dispatch table; fall-through control continues into the next snippet.

use std::mem::offset_of;

use tracing::error;

use crate::cpu::{Cpu, VmError};
use crate::ecall;
use crate::inst::{funct3, funct7, opcode, Btype, Itype, Jtype, Rtype, Stype, Utype};

use super::dispatch::DispatchTable;
use super::emitter::{AluOp, CodeBuf, Cond, Scratch, ShiftOp};

const OFF_REGS: u32 = offset_of!(Cpu, regs) as u32;
const OFF_PC: u32 = offset_of!(Cpu, pc) as u32;
const OFF_MEM: u32 = offset_of!(Cpu, mem_ptr) as u32;

/// Upper bound on the emitted size of a single snippet, for sizing the
/// code buffer. The largest shape is JALR (register loads, masking,
/// link write, table indexing and the indirect jump).
pub const MAX_SNIPPET_BYTES: usize = 64;

/// Bytes emitted by the prolog plus the entry jump and trailing epilog.
pub const WRAPPER_BYTES: usize = 32;

#[inline]
fn reg_off(r: usize) -> u32 {
    OFF_REGS + r as u32 * 4
}

/// Emits the function prolog: saves `rbx` and points it at the CPU state
/// passed in `rdi`.
pub fn emit_prolog(asm: &mut CodeBuf) {
    asm.push_rbx();
    asm.mov_rbx_rdi();
}

/// Emits the function epilog restoring the caller's `rbx`.
pub fn emit_epilog(asm: &mut CodeBuf) {
    asm.pop_rbx();
    asm.ret();
}

/// Emits an indirect jump through the dispatch slot for `target`.
fn emit_jump_via_slot(
    asm: &mut CodeBuf,
    table: &DispatchTable,
    target: u32,
    pc: u32,
) -> Result<(), VmError> {
    let slot = table.slot_addr(target).ok_or_else(|| {
        error!(
            target = format_args!("{target:#010x}"),
            pc = format_args!("{pc:#010x}"),
            "jump target outside code section"
        );
        VmError::TargetOutOfRange { target, pc }
    })?;
    asm.mov_rax_imm64(slot as u64);
    asm.jmp_ind_rax();
    Ok(())
}

/// Bytes of the `mov rax, imm64; jmp [rax]` pair, for branch skip
/// distances.
const SLOT_JUMP_BYTES: i8 = 12;

/// Loads the effective address `(rs1 + imm) & mask` into `eax` and the
/// guest memory base into `rdx`.
fn emit_effective_address(asm: &mut CodeBuf, rs1: usize, imm: i32, mask: u32) {
    asm.load_state(Scratch::Eax, reg_off(rs1));
    if imm != 0 {
        asm.alu_eax_imm(AluOp::Add, imm as u32);
    }
    asm.alu_eax_imm(AluOp::And, mask);
    asm.load_state_ptr(Scratch::Edx, OFF_MEM);
}

/// Emits the shared compare-and-set tail: `setcc al; movzx eax, al` and
/// the store to `rd`.
fn emit_setcc_result(asm: &mut CodeBuf, cond: Cond, rd: usize) {
    asm.setcc_al(cond);
    asm.movzx_eax_al();
    asm.store_state(Scratch::Eax, reg_off(rd));
}

/// Lowers one guest instruction at `pc` into the code buffer.
///
/// Decode errors mirror the interpreter's taxonomy but are raised at
/// translation time; nothing is executed when any instruction fails.
pub fn translate_inst(
    asm: &mut CodeBuf,
    table: &DispatchTable,
    inst: u32,
    pc: u32,
    mask: u32,
) -> Result<(), VmError> {
    match opcode(inst) {
        opcode::OP => {
            let d = Rtype::from(inst);
            if d.rd == 0 {
                return Ok(());
            }

            match (d.funct3, d.funct7) {
                (funct3::ADD_SUB, funct7::BASE) => {
                    asm.load_state(Scratch::Eax, reg_off(d.rs1));
                    asm.alu_state(AluOp::Add, reg_off(d.rs2));
                    asm.store_state(Scratch::Eax, reg_off(d.rd));
                }
                (funct3::ADD_SUB, funct7::ALT) => {
                    asm.load_state(Scratch::Eax, reg_off(d.rs1));
                    asm.alu_state(AluOp::Sub, reg_off(d.rs2));
                    asm.store_state(Scratch::Eax, reg_off(d.rd));
                }
                (funct3::XOR, funct7::BASE) => {
                    asm.load_state(Scratch::Eax, reg_off(d.rs1));
                    asm.alu_state(AluOp::Xor, reg_off(d.rs2));
                    asm.store_state(Scratch::Eax, reg_off(d.rd));
                }
                (funct3::OR, funct7::BASE) => {
                    asm.load_state(Scratch::Eax, reg_off(d.rs1));
                    asm.alu_state(AluOp::Or, reg_off(d.rs2));
                    asm.store_state(Scratch::Eax, reg_off(d.rd));
                }
                (funct3::AND, funct7::BASE) => {
                    asm.load_state(Scratch::Eax, reg_off(d.rs1));
                    asm.alu_state(AluOp::And, reg_off(d.rs2));
                    asm.store_state(Scratch::Eax, reg_off(d.rd));
                }
                (funct3::SLL, funct7::BASE) => emit_shift_reg(asm, ShiftOp::Shl, &d),
                (funct3::SRL_SRA, funct7::BASE) => emit_shift_reg(asm, ShiftOp::Shr, &d),
                (funct3::SRL_SRA, funct7::ALT) => emit_shift_reg(asm, ShiftOp::Sar, &d),
                (funct3::SLT, funct7::BASE) => {
                    asm.load_state(Scratch::Eax, reg_off(d.rs1));
                    asm.alu_state(AluOp::Cmp, reg_off(d.rs2));
                    emit_setcc_result(asm, Cond::L, d.rd);
                }
                (funct3::SLTU, funct7::BASE) => {
                    asm.load_state(Scratch::Eax, reg_off(d.rs1));
                    asm.alu_state(AluOp::Cmp, reg_off(d.rs2));
                    emit_setcc_result(asm, Cond::B, d.rd);
                }
                _ => return Err(illegal("unknown R-type funct3/funct7", pc, inst)),
            }
        }
        opcode::OP_IMM => {
            let d = Itype::from(inst);
            if d.rd == 0 {
                return Ok(());
            }
            let imm = d.imm as u32;

            match d.funct3 {
                funct3::ADD_SUB => {
                    if d.rd == d.rs1 && d.imm == 0 {
                        return Ok(()); // canonical NOP shape
                    }
                    asm.load_state(Scratch::Eax, reg_off(d.rs1));
                    if d.imm != 0 {
                        asm.alu_eax_imm(AluOp::Add, imm);
                    }
                    asm.store_state(Scratch::Eax, reg_off(d.rd));
                }
                funct3::XOR => emit_alu_imm(asm, AluOp::Xor, &d),
                funct3::OR => emit_alu_imm(asm, AluOp::Or, &d),
                funct3::AND => emit_alu_imm(asm, AluOp::And, &d),
                funct3::SLT => {
                    asm.load_state(Scratch::Eax, reg_off(d.rs1));
                    asm.alu_eax_imm(AluOp::Cmp, imm);
                    emit_setcc_result(asm, Cond::L, d.rd);
                }
                funct3::SLTU => {
                    // The immediate is sign-extended before the unsigned
                    // compare, same as the interpreter.
                    asm.load_state(Scratch::Eax, reg_off(d.rs1));
                    asm.alu_eax_imm(AluOp::Cmp, imm);
                    emit_setcc_result(asm, Cond::B, d.rd);
                }
                funct3::SLL => {
                    if (imm >> 5) & 0x7F != funct7::BASE {
                        return Err(illegal("unknown SLLI funct7", pc, inst));
                    }
                    emit_shift_imm(asm, ShiftOp::Shl, &d);
                }
                funct3::SRL_SRA => match (imm >> 5) & 0x7F {
                    funct7::BASE => emit_shift_imm(asm, ShiftOp::Shr, &d),
                    funct7::ALT => emit_shift_imm(asm, ShiftOp::Sar, &d),
                    _ => return Err(illegal("unknown SRLI/SRAI funct7", pc, inst)),
                },
                _ => return Err(illegal("unknown I-type funct3", pc, inst)),
            }
        }
        opcode::LUI => {
            let d = Utype::from(inst);
            if d.rd != 0 {
                asm.store_state_imm(reg_off(d.rd), d.imm);
            }
        }
        opcode::AUIPC => {
            let d = Utype::from(inst);
            if d.rd != 0 {
                asm.store_state_imm(reg_off(d.rd), pc.wrapping_add(d.imm) & mask);
            }
        }
        opcode::LOAD => {
            let d = Itype::from(inst);
            if d.rd == 0 {
                return Ok(());
            }
            emit_effective_address(asm, d.rs1, d.imm, mask);
            match d.funct3 {
                funct3::LB => asm.load_mem_i8(),
                funct3::LH => asm.load_mem_i16(),
                funct3::LW => asm.load_mem_u32(),
                funct3::LBU => asm.load_mem_u8(),
                funct3::LHU => asm.load_mem_u16(),
                _ => return Err(illegal("unknown load funct3", pc, inst)),
            }
            asm.store_state(Scratch::Eax, reg_off(d.rd));
        }
        opcode::STORE => {
            let d = Stype::from(inst);
            emit_effective_address(asm, d.rs1, d.imm, mask);
            asm.load_state(Scratch::Ecx, reg_off(d.rs2));
            match d.funct3 {
                funct3::SB => asm.store_mem_u8(),
                funct3::SH => asm.store_mem_u16(),
                funct3::SW => asm.store_mem_u32(),
                _ => return Err(illegal("illegal store width", pc, inst)),
            }
        }
        opcode::BRANCH => {
            let d = Btype::from(inst);
            // Condition under which the branch is NOT taken, to skip the
            // indirect jump.
            let skip = match d.funct3 {
                funct3::BEQ => Cond::Ne,
                funct3::BNE => Cond::E,
                funct3::BLT => Cond::Ge,
                funct3::BGE => Cond::L,
                funct3::BLTU => Cond::Ae,
                funct3::BGEU => Cond::B,
                _ => return Err(illegal("unknown branch funct3", pc, inst)),
            };
            let target = pc.wrapping_add(d.imm as u32) & mask;

            asm.load_state(Scratch::Eax, reg_off(d.rs1));
            asm.alu_state(AluOp::Cmp, reg_off(d.rs2));
            asm.jcc_short(skip, SLOT_JUMP_BYTES);
            emit_jump_via_slot(asm, table, target, pc)?;
        }
        opcode::JAL => {
            let d = Jtype::from(inst);
            if d.rd != 0 {
                asm.store_state_imm(reg_off(d.rd), pc.wrapping_add(4) & mask);
            }
            let target = pc.wrapping_add(d.imm as u32) & mask;
            emit_jump_via_slot(asm, table, target, pc)?;
        }
        opcode::JALR => {
            let d = Itype::from(inst);
            if d.funct3 != 0 {
                return Err(illegal("unknown JALR funct3", pc, inst));
            }
            // rs1 is loaded before the link write, which matters when
            // rd == rs1.
            asm.load_state(Scratch::Eax, reg_off(d.rs1));
            if d.imm != 0 {
                asm.alu_eax_imm(AluOp::Add, d.imm as u32);
            }
            asm.alu_eax_imm(AluOp::And, mask & !1);
            if d.rd != 0 {
                asm.store_state_imm(reg_off(d.rd), pc.wrapping_add(4) & mask);
            }
            // Index the dispatch table with the effective guest PC. A
            // well-formed guest never jumps outside the code section; the
            // index is not validated at run time.
            if table.code_offset() != 0 {
                asm.alu_eax_imm(AluOp::Sub, table.code_offset());
            }
            asm.shift_eax_imm(ShiftOp::Shr, 2);
            asm.mov_rdx_imm64(table.base_addr() as u64);
            asm.jmp_ind_rdx_rax8();
        }
        opcode::SYSTEM => {
            let d = Itype::from(inst);
            if d.funct3 != 0 {
                return Err(illegal("unknown SYSTEM funct3", pc, inst));
            }
            match (inst >> 20) & 0xFFF {
                0 => {
                    // Keep the architectural PC current across the host
                    // call, then test its halt flag.
                    asm.store_state_imm(OFF_PC, pc.wrapping_add(4) & mask);
                    asm.mov_rdi_rbx();
                    asm.mov_rax_imm64(ecall::ecall_entry as usize as u64);
                    asm.call_rax();
                    asm.test_eax_eax();
                    asm.jcc_short(Cond::E, 2);
                    emit_epilog(asm);
                }
                1 => {
                    asm.store_state_imm(OFF_PC, pc.wrapping_add(4) & mask);
                    emit_epilog(asm);
                }
                _ => return Err(illegal("unknown SYSTEM function", pc, inst)),
            }
        }
        opcode::FENCE => {
            asm.nop();
        }
        _ => {
            error!(
                pc = format_args!("{pc:#010x}"),
                inst = format_args!("{inst:#010x}"),
                "unknown opcode during translation"
            );
            return Err(VmError::UnknownOpcode { pc, inst });
        }
    }

    Ok(())
}

fn emit_alu_imm(asm: &mut CodeBuf, op: AluOp, d: &Itype) {
    asm.load_state(Scratch::Eax, reg_off(d.rs1));
    asm.alu_eax_imm(op, d.imm as u32);
    asm.store_state(Scratch::Eax, reg_off(d.rd));
}

fn emit_shift_imm(asm: &mut CodeBuf, op: ShiftOp, d: &Itype) {
    let shamt = (d.imm & 0x1F) as u8;
    asm.load_state(Scratch::Eax, reg_off(d.rs1));
    if shamt != 0 {
        asm.shift_eax_imm(op, shamt);
    }
    asm.store_state(Scratch::Eax, reg_off(d.rd));
}

/// Variable shifts go through `cl`; the host masks the count to 5 bits
/// for 32-bit operands, matching the guest semantics.
fn emit_shift_reg(asm: &mut CodeBuf, op: ShiftOp, d: &Rtype) {
    asm.load_state(Scratch::Ecx, reg_off(d.rs2));
    asm.load_state(Scratch::Eax, reg_off(d.rs1));
    asm.shift_eax_cl(op);
    asm.store_state(Scratch::Eax, reg_off(d.rd));
}

fn illegal(what: &'static str, pc: u32, inst: u32) -> VmError {
    error!(
        pc = format_args!("{pc:#010x}"),
        inst = format_args!("{inst:#010x}"),
        what,
        "illegal instruction during translation"
    );
    VmError::IllegalInstruction { what, pc, inst }
}

/// Translates the whole code section into `asm`, filling the dispatch
/// table as it goes.
///
/// The prolog establishes the CPU-state register and jumps through the
/// dispatch slot for the image entry (the slot is read at run time, after
/// the table is complete). A trailing epilog catches fall-through past
/// the last instruction.
pub fn translate_section(
    vm: &Cpu,
    asm: &mut CodeBuf,
    table: &mut DispatchTable,
    code_base: usize,
) -> Result<(), VmError> {
    let mask = vm.mem_mask();
    let entry = vm.layout.entry & mask;

    emit_prolog(asm);
    emit_jump_via_slot(asm, table, entry, entry)?;

    let start = vm.layout.code_offset;
    let end = start + vm.layout.code_size;
    let mut pc = start;
    while pc < end {
        table.set(pc, code_base + asm.pos());
        let inst = vm.load(pc, 4);
        translate_inst(asm, table, inst, pc, mask)?;
        if asm.overflowed() {
            return Err(VmError::CodeBufferFull(asm.capacity()));
        }
        pc += 4;
    }

    emit_epilog(asm);
    if asm.overflowed() {
        return Err(VmError::CodeBufferFull(asm.capacity()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    fn lower(words: &[u32]) -> (Vec<u8>, DispatchTable) {
        let vm = vm_with_code(words);
        let mut mem = vec![0u8; words.len() * MAX_SNIPPET_BYTES + WRAPPER_BYTES];
        let mut table = DispatchTable::new(0, (words.len() * 4) as u32);
        let mut asm = CodeBuf::new(&mut mem);
        translate_section(&vm, &mut asm, &mut table, 0x1000).unwrap();
        let pos = asm.pos();
        (mem[..pos].to_vec(), table)
    }

    #[test]
    fn x0_destination_emits_nothing() {
        let (with_write, _) = lower(&[addi(1, 0, 5), ebreak()]);
        let (without_write, _) = lower(&[addi(0, 0, 5), ebreak()]);
        assert!(without_write.len() < with_write.len());
    }

    #[test]
    fn snippets_fit_the_size_bound() {
        // One of each shape, including the widest (JALR with nonzero
        // immediate and link).
        let words = [
            add(1, 2, 3),
            sltiu(4, 5, -1),
            sra(6, 7, 8),
            lw(9, 10, 0x40),
            sw(11, 12, -8),
            lui(13, 0xFFFFF),
            auipc(14, 1),
            beq(1, 2, -8),
            jal(1, -16),
            jalr(1, 1, 0x100),
            ecall(),
            fence(),
            ebreak(),
        ];
        let vm = vm_with_code(&words);
        let mut mem = vec![0u8; 4096];
        let mut table = DispatchTable::new(0, (words.len() * 4) as u32);
        let mut asm = CodeBuf::new(&mut mem);

        emit_prolog(&mut asm);
        let mut prev = asm.pos();
        for (i, &w) in words.iter().enumerate() {
            let pc = (i * 4) as u32;
            table.set(pc, asm.pos());
            translate_inst(&mut asm, &table, w, pc, vm.mem_mask()).unwrap();
            assert!(
                asm.pos() - prev <= MAX_SNIPPET_BYTES,
                "snippet {i} too large: {}",
                asm.pos() - prev
            );
            prev = asm.pos();
        }
    }

    #[test]
    fn dispatch_entries_cover_every_instruction() {
        let (_, table) = lower(&[addi(1, 0, 1), addi(2, 0, 2), ebreak()]);
        let a = table.get(0).unwrap();
        let b = table.get(4).unwrap();
        let c = table.get(8).unwrap();
        assert!(a >= 0x1000);
        assert!(b > a);
        assert!(c > b);
    }

    #[test]
    fn branch_outside_code_section_is_a_translation_error() {
        let vm = vm_with_code(&[beq(0, 0, 0x100)]);
        let mut mem = vec![0u8; 256];
        let mut table = DispatchTable::new(0, 4);
        let mut asm = CodeBuf::new(&mut mem);
        assert!(matches!(
            translate_section(&vm, &mut asm, &mut table, 0),
            Err(VmError::TargetOutOfRange { target: 0x100, .. })
        ));
    }

    #[test]
    fn unknown_opcode_aborts_translation() {
        let vm = vm_with_code(&[0x0000_007F]);
        let mut mem = vec![0u8; 256];
        let mut table = DispatchTable::new(0, 4);
        let mut asm = CodeBuf::new(&mut mem);
        assert!(matches!(
            translate_section(&vm, &mut asm, &mut table, 0),
            Err(VmError::UnknownOpcode { pc: 0, .. })
        ));
    }

    #[test]
    fn buffer_overflow_is_reported_not_executed() {
        let vm = vm_with_code(&[add(1, 2, 3), add(4, 5, 6), ebreak()]);
        let mut mem = vec![0u8; 24]; // far too small
        let mut table = DispatchTable::new(0, 12);
        let mut asm = CodeBuf::new(&mut mem);
        assert!(matches!(
            translate_section(&vm, &mut asm, &mut table, 0),
            Err(VmError::CodeBufferFull(24))
        ));
    }

    #[test]
    fn fence_lowers_to_nop() {
        let vm = vm_with_code(&[fence()]);
        let mut mem = vec![0u8; 256];
        let table = DispatchTable::new(0, 4);
        let (start, end) = {
            let mut asm = CodeBuf::new(&mut mem);
            emit_prolog(&mut asm);
            let start = asm.pos();
            translate_inst(&mut asm, &table, fence(), 0, vm.mem_mask()).unwrap();
            (start, asm.pos())
        };
        assert_eq!(mem[start..end], [0x90]);
    }
}
