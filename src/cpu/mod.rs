//! The execution facade.
//!
//! A [`Cpu`] owns the register file and a handle to the execute segment it currently runs
//! from. Whenever the program counter leaves that segment, [`Cpu::next_execute_segment`]
//! finds or decodes the segment covering the new address, consulting the execute-fault
//! handler and page traps on the way.
//!
//! Instruction semantics live in [`isa`]; the dispatch loop lives in [`crate::Machine`].

pub mod isa;

use std::{fmt, marker::PhantomData, sync::Arc};

use tracing::{debug, trace};

use crate::{
    address::{page_number, page_offset, Address, PAGE_SHIFT, PAGE_SIZE},
    decoder::SegmentHandle,
    memory::{Memory, TrapKind},
    utils::io::{push_address, read_address},
    Error, Result,
};

/// Number of times the fault handler or a page trap may redirect a single segment lookup.
pub const MAX_RESTARTS: usize = 4;

/// Register ABI names, indexed by register number.
pub const REGISTER_NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

/// Return address register.
pub const REG_RA: usize = 1;
/// Stack pointer register.
pub const REG_SP: usize = 2;
/// First argument and return value register.
pub const REG_A0: usize = 10;
/// System call number register.
pub const REG_A7: usize = 17;

/// Handles an instruction fetch from a page without execute permission.
///
/// The handler receives the CPU, the memory and the faulting address. It may make the page
/// executable or move the program counter with [`Cpu::jump`]; the lookup is then retried at
/// the (possibly new) program counter, up to [`MAX_RESTARTS`] times.
pub type ExecuteFaultHandler<A> =
    Arc<dyn Fn(&mut Cpu<A>, &mut Memory<A>, u64) -> Result<()> + Send + Sync>;

fn default_execute_fault_handler<A: Address>() -> ExecuteFaultHandler<A> {
    Arc::new(|_cpu: &mut Cpu<A>, _memory: &mut Memory<A>, addr: u64| {
        Err(Error::ExecutionSpaceProtectionFault { addr })
    })
}

/// The integer register file and program counter.
///
/// Values are stored zero-extended to 64 bits and always wrapped to the width of `A`.
/// Register `x0` reads as zero no matter what is written to it.
#[derive(Clone, PartialEq, Eq)]
pub struct Registers<A: Address> {
    /// Program counter
    pub pc: u64,
    x: [u64; 32],
    _width: PhantomData<A>,
}

impl<A: Address> Default for Registers<A> {
    fn default() -> Self {
        Registers {
            pc: 0,
            x: [0; 32],
            _width: PhantomData,
        }
    }
}

impl<A: Address> fmt::Debug for Registers<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl<A: Address> fmt::Display for Registers<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = A::BYTES * 2;
        writeln!(f, "[PC\t{:0width$X}]", self.pc)?;
        for (i, value) in self.x.iter().enumerate().skip(1) {
            write!(f, "[{}\t{:0width$X}] ", REGISTER_NAMES[i], value)?;
            if i % 4 == 3 {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

impl<A: Address> Registers<A> {
    /// Size of the register file in a snapshot: 32 registers and the program counter.
    #[must_use]
    pub const fn serialized_size() -> usize {
        33 * A::BYTES
    }

    /// Value of register `reg`.
    ///
    /// # Panics
    /// Panics if `reg` is not below 32.
    #[inline]
    #[must_use]
    pub fn get(&self, reg: usize) -> u64 {
        self.x[reg]
    }

    /// Writes register `reg`. Writes to `x0` are discarded.
    ///
    /// # Panics
    /// Panics if `reg` is not below 32.
    #[inline]
    pub fn set(&mut self, reg: usize, value: u64) {
        if reg != 0 {
            self.x[reg] = A::wrap(value);
        }
    }

    /// Encodes the registers followed by the program counter.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::serialized_size());
        for value in &self.x {
            push_address::<A>(&mut out, *value);
        }
        push_address::<A>(&mut out, self.pc);
        out
    }

    /// Decodes registers written by [`Registers::to_bytes`].
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if `data` has the wrong size.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != Self::serialized_size() {
            return Err(malformed_error!(
                "Register file of {} bytes, expected {}",
                data.len(),
                Self::serialized_size()
            ));
        }

        let mut regs = Registers::default();
        let mut offset = 0;
        for reg in 0..32 {
            let value = read_address::<A>(data, &mut offset)?;
            regs.set(reg, value);
        }
        regs.pc = read_address::<A>(data, &mut offset)?;
        Ok(regs)
    }
}

/// Register file, current execute segment and execute-fault policy of one hart.
pub struct Cpu<A: Address> {
    regs: Registers<A>,
    exec: Option<SegmentHandle<A>>,
    jumped: bool,
    fault_handler: ExecuteFaultHandler<A>,
}

impl<A: Address> fmt::Debug for Cpu<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cpu")
            .field("pc", &format_args!("{:#x}", self.regs.pc))
            .field("exec", &self.exec)
            .finish_non_exhaustive()
    }
}

impl<A: Address> Default for Cpu<A> {
    fn default() -> Self {
        Cpu::new()
    }
}

impl<A: Address> Clone for Cpu<A> {
    fn clone(&self) -> Self {
        Cpu {
            regs: self.regs.clone(),
            exec: None,
            jumped: false,
            fault_handler: self.fault_handler.clone(),
        }
    }
}

impl<A: Address> Cpu<A> {
    /// Creates a CPU with zeroed registers.
    #[must_use]
    pub fn new() -> Self {
        Cpu {
            regs: Registers::default(),
            exec: None,
            jumped: false,
            fault_handler: default_execute_fault_handler(),
        }
    }

    /// The register file.
    #[must_use]
    pub fn registers(&self) -> &Registers<A> {
        &self.regs
    }

    /// The register file, mutably.
    pub fn registers_mut(&mut self) -> &mut Registers<A> {
        &mut self.regs
    }

    /// Value of register `reg`.
    #[inline]
    #[must_use]
    pub fn reg(&self, reg: usize) -> u64 {
        self.regs.get(reg)
    }

    /// Writes register `reg`. Writes to `x0` are discarded.
    #[inline]
    pub fn set_reg(&mut self, reg: usize, value: u64) {
        self.regs.set(reg, value);
    }

    /// The program counter.
    #[inline]
    #[must_use]
    pub fn pc(&self) -> u64 {
        self.regs.pc
    }

    /// Moves the program counter to `addr`.
    ///
    /// Inside an instruction handler this also suppresses the automatic advance past the
    /// instruction.
    #[inline]
    pub fn jump(&mut self, addr: u64) {
        self.regs.pc = A::wrap(addr);
        self.jumped = true;
    }

    /// Moves the program counter forward by `len` bytes.
    #[inline]
    pub fn increment_pc(&mut self, len: usize) {
        self.regs.pc = A::wrap(self.regs.pc.wrapping_add(len as u64));
    }

    pub(crate) fn take_jumped(&mut self) -> bool {
        std::mem::take(&mut self.jumped)
    }

    /// The execute segment the CPU currently runs from.
    #[must_use]
    pub fn current_execute_segment(&self) -> Option<&SegmentHandle<A>> {
        self.exec.as_ref()
    }

    /// Forgets the current execute segment; the next step looks it up again.
    pub fn reset_execute_segment(&mut self) {
        self.exec = None;
    }

    /// Installs a new execute-fault handler, returning the previous one.
    pub fn set_execute_fault_handler(
        &mut self,
        handler: ExecuteFaultHandler<A>,
    ) -> ExecuteFaultHandler<A> {
        std::mem::replace(&mut self.fault_handler, handler)
    }

    /// The segment to execute `pc` from, if the current one still covers it.
    pub(crate) fn cached_segment_for(&self, pc: u64) -> Option<SegmentHandle<A>> {
        self.exec
            .as_ref()
            .filter(|segment| segment.is_within(pc, 2) && !segment.is_stale())
            .cloned()
    }

    /// Finds or creates the execute segment covering `pc` and makes it current.
    ///
    /// An existing segment is reused unless it was marked stale. Otherwise the page holding
    /// `pc` must be executable; if it is not, the execute-fault handler runs and the lookup
    /// restarts at the program counter it leaves behind. An MMIO trap on the page sees the
    /// fetch and may redirect it. The new segment spans every executable page contiguous
    /// with the page holding `pc`.
    ///
    /// Returns the segment and the program counter to continue at.
    ///
    /// # Errors
    /// Returns [`Error::ExecutionLoopDetected`] after [`MAX_RESTARTS`] redirections, errors
    /// of the execute-fault handler, and [`Error::InvalidProgram`] when the segment cannot
    /// be created.
    pub fn next_execute_segment(
        &mut self,
        memory: &mut Memory<A>,
        pc: u64,
    ) -> Result<(SegmentHandle<A>, u64)> {
        let mut pc = A::wrap(pc);
        let mut restarts = 0;

        'restart: loop {
            let existing = memory.exec_segment_for(pc).cloned();
            if let Some(segment) = &existing {
                if !segment.is_stale() {
                    self.exec = Some(segment.clone());
                    return Ok((segment.clone(), pc));
                }
            }

            self.regs.pc = pc;
            let base_pageno = page_number(pc);
            let (exec, has_trap) = {
                let page = memory.get_pageno(base_pageno)?;
                (page.attr.exec, page.has_trap())
            };

            if !exec {
                let handler = self.fault_handler.clone();
                handler(self, memory, pc)?;
                pc = self.regs.pc;
                restarts += 1;
                if restarts >= MAX_RESTARTS {
                    return Err(Error::ExecutionLoopDetected { pc });
                }
                continue 'restart;
            }

            if has_trap {
                let redirect = memory.get_pageno(base_pageno)?.trap(
                    page_offset(pc),
                    TrapKind::Exec,
                    0,
                    pc,
                );
                if let Some(new_pc) = redirect {
                    let new_pc = A::wrap(new_pc);
                    if page_number(new_pc) != base_pageno {
                        trace!("Exec trap redirected {pc:#x} -> {new_pc:#x}");
                        pc = new_pc;
                        restarts += 1;
                        if restarts >= MAX_RESTARTS {
                            return Err(Error::ExecutionLoopDetected { pc });
                        }
                        continue 'restart;
                    }
                    pc = new_pc;
                    self.regs.pc = pc;
                }
            }

            if let Some(segment) = existing {
                debug!(
                    "Evicting stale execute segment {:#x}..{:#x}",
                    segment.exec_begin(),
                    segment.exec_end()
                );
                if self
                    .exec
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, &segment))
                {
                    self.exec = None;
                }
                memory.evict_execute_segment(segment);
            }

            return self.create_segment_around(memory, pc, base_pageno);
        }
    }

    fn create_segment_around(
        &mut self,
        memory: &mut Memory<A>,
        pc: u64,
        base_pageno: u64,
    ) -> Result<(SegmentHandle<A>, u64)> {
        let last_pageno = page_number(A::wrap(u64::MAX));
        let is_exec = |memory: &Memory<A>, pageno: u64| -> Result<bool> {
            Ok(memory.get_pageno(pageno)?.attr.exec)
        };

        let mut begin = base_pageno;
        while begin > 0 && is_exec(memory, begin - 1)? {
            begin -= 1;
        }
        let mut end = base_pageno;
        while end <= last_pageno && is_exec(memory, end)? {
            end += 1;
        }
        if end <= begin {
            return Err(invalid_program!(
                "Failed to create execute segment",
                begin << PAGE_SHIFT
            ));
        }

        let n_pages = usize::try_from(end - begin)
            .map_err(|_| invalid_program!("Execute segment too large", end - begin))?;
        let mut area = vec![0_u8; n_pages * PAGE_SIZE];
        for (chunk, pageno) in area.chunks_exact_mut(PAGE_SIZE).zip(begin..end) {
            memory
                .get_pageno(pageno)?
                .with_data(|data| chunk.copy_from_slice(data));
        }

        let is_likely_jit = {
            let page = memory.get_pageno(base_pageno)?;
            page.attr.exec && page.attr.write
        };

        let segment =
            memory.create_execute_segment(&area, begin << PAGE_SHIFT, false, is_likely_jit)?;
        debug!(
            "Created execute segment {:#x}..{:#x} for pc {pc:#x}",
            segment.exec_begin(),
            segment.exec_end()
        );
        self.exec = Some(segment.clone());
        Ok((segment, pc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::PageAttributes, test::options};

    #[test]
    fn test_x0_is_hardwired() {
        let mut cpu = Cpu::<u64>::new();
        cpu.set_reg(0, 42);
        cpu.set_reg(5, 42);
        assert_eq!(cpu.reg(0), 0);
        assert_eq!(cpu.reg(5), 42);
    }

    #[test]
    fn test_rv32_registers_wrap() {
        let mut cpu = Cpu::<u32>::new();
        cpu.set_reg(1, 0x1_0000_0004);
        assert_eq!(cpu.reg(1), 4);
        cpu.jump(0xFFFF_FFFC);
        cpu.increment_pc(4);
        assert_eq!(cpu.pc(), 0);
    }

    #[test]
    fn test_register_bytes() {
        let mut regs = Registers::<u32>::default();
        regs.set(10, 0xdead_beef);
        regs.pc = 0x1000;
        let bytes = regs.to_bytes();
        assert_eq!(bytes.len(), Registers::<u32>::serialized_size());
        assert_eq!(Registers::<u32>::from_bytes(&bytes).unwrap(), regs);
        assert!(Registers::<u64>::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_segment_spans_contiguous_exec_pages() {
        let mut memory = Memory::<u64>::new(&options()).unwrap();
        memory.memset(0x3000, 0x13, 3 * 4096).unwrap();
        memory
            .set_page_attr(0x3000, 3 * 4096, PageAttributes::exec_only())
            .unwrap();

        let mut cpu = Cpu::<u64>::new();
        let (segment, pc) = cpu.next_execute_segment(&mut memory, 0x4004).unwrap();
        assert_eq!(pc, 0x4004);
        assert_eq!(segment.exec_begin(), 0x3000);
        assert_eq!(segment.exec_end(), 0x6000);
        assert!(cpu.cached_segment_for(0x5ffc).is_some());

        let (again, _) = cpu.next_execute_segment(&mut memory, 0x3000).unwrap();
        assert!(Arc::ptr_eq(&segment, &again));
        assert_eq!(memory.execute_segments_count(), 1);
    }

    #[test]
    fn test_fault_handler_redirects() {
        let mut memory = Memory::<u64>::new(&options()).unwrap();
        memory
            .set_page_attr(0x8000, 4096, PageAttributes::exec_only())
            .unwrap();

        let mut cpu = Cpu::<u64>::new();
        assert!(matches!(
            cpu.next_execute_segment(&mut memory, 0x2000),
            Err(Error::ExecutionSpaceProtectionFault { addr: 0x2000 })
        ));

        cpu.set_execute_fault_handler(Arc::new(|cpu: &mut Cpu<u64>, _: &mut Memory<u64>, _: u64| {
            cpu.jump(0x8000);
            Ok(())
        }));
        let (segment, pc) = cpu.next_execute_segment(&mut memory, 0x2000).unwrap();
        assert_eq!(pc, 0x8000);
        assert_eq!(segment.exec_begin(), 0x8000);
    }

    #[test]
    fn test_fault_loop_detected() {
        let mut memory = Memory::<u64>::new(&options()).unwrap();
        let mut cpu = Cpu::<u64>::new();
        cpu.set_execute_fault_handler(Arc::new(|_: &mut Cpu<u64>, _: &mut Memory<u64>, _: u64| {
            Ok(())
        }));
        assert!(matches!(
            cpu.next_execute_segment(&mut memory, 0x2000),
            Err(Error::ExecutionLoopDetected { pc: 0x2000 })
        ));
    }

    #[test]
    fn test_stale_segment_is_rebuilt() {
        let mut memory = Memory::<u64>::new(&options()).unwrap();
        memory
            .set_page_attr(0x3000, 4096, PageAttributes::with_permissions(true, true, true))
            .unwrap();

        let mut cpu = Cpu::<u64>::new();
        let (first, _) = cpu.next_execute_segment(&mut memory, 0x3000).unwrap();
        assert!(first.is_likely_jit());
        first.set_stale(true);

        let (second, _) = cpu.next_execute_segment(&mut memory, 0x3000).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_stale());
        assert_eq!(memory.execute_segments_count(), 1);
    }
}
