//! The machine: one [`Cpu`] and its [`Memory`].
//!
//! [`Machine::simulate`] is the dispatch loop. Each step looks up the decoder entry of the
//! program counter in the current execute segment and either runs it inline (rewritten jumps
//! and calls, stops, invalid entries) or calls the handler the entry refers to.
//!
//! # Examples
//!
//! ```rust
//! use rvmem::{prelude::*, machine::StopReason};
//!
//! // li a0, 42 ; ebreak
//! let code = [0x13, 0x05, 0xa0, 0x02, 0x73, 0x00, 0x10, 0x00];
//! let image = ProgramImage::new(code.to_vec(), 0x1_0000).with_segment(LoadSegment {
//!     vaddr: 0x1_0000,
//!     offset: 0,
//!     filesz: code.len() as u64,
//!     memsz: code.len() as u64,
//!     flags: SegmentFlags::READ | SegmentFlags::EXEC,
//! });
//!
//! let mut machine = Machine::<u64>::from_image(std::sync::Arc::new(image), MachineOptions::default())?;
//! assert_eq!(machine.simulate(100)?, StopReason::Stopped);
//! assert_eq!(machine.cpu.reg(10), 42);
//! # Ok::<(), rvmem::Error>(())
//! ```

use std::{fmt::Write, sync::Arc};

use tracing::{debug, trace};

use crate::{
    address::Address,
    config::MachineOptions,
    cpu::{isa, Cpu, Registers, REG_A0, REG_RA, REG_SP},
    decoder::{Bytecode, DecoderData, HandlerFn, Instruction, SegmentHandle},
    memory::{Memory, ProgramImage, SnapshotHeader},
    Error, Result,
};

/// Handles an `ECALL`. Receives the machine and the system call number from `a7`.
pub type SyscallHandler<A> = Arc<dyn Fn(&mut Machine<A>, u64) -> Result<()> + Send + Sync>;

/// Why [`Machine::simulate`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The guest stopped the machine, or [`Machine::stop`] was called
    Stopped,
    /// The instruction budget ran out
    InstructionLimit,
}

/// A RISC-V machine of address width `A`.
pub struct Machine<A: Address> {
    /// Registers and execute-segment state
    pub cpu: Cpu<A>,
    /// The guest address space
    pub memory: Memory<A>,
    options: MachineOptions<A>,
    counter: u64,
    max_counter: u64,
    stopped: bool,
    syscall_handler: Option<SyscallHandler<A>>,
}

impl<A: Address> std::fmt::Debug for Machine<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("cpu", &self.cpu)
            .field("memory", &self.memory)
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

impl<A: Address> Machine<A> {
    /// Creates a machine with an empty address space.
    ///
    /// # Errors
    /// Propagates [`Memory::new`] errors.
    pub fn new(options: MachineOptions<A>) -> Result<Self> {
        let memory = Memory::new(&options)?;
        Ok(Machine {
            cpu: Cpu::new(),
            memory,
            options,
            counter: 0,
            max_counter: 0,
            stopped: false,
            syscall_handler: None,
        })
    }

    /// Parses and loads a RISC-V ELF executable.
    ///
    /// # Errors
    /// Returns [`Error::InvalidProgram`] or [`Error::GoblinErr`] for rejected images and
    /// propagates loader errors.
    pub fn from_elf(binary: &[u8], options: MachineOptions<A>) -> Result<Self> {
        let image = ProgramImage::parse::<A>(binary, options.compressed_instructions)?;
        Machine::from_image(Arc::new(image), options)
    }

    /// Loads `image` and points the CPU at its entry with the initial stack pointer.
    ///
    /// # Errors
    /// Propagates [`Memory::load_program`] errors.
    pub fn from_image(image: Arc<ProgramImage>, options: MachineOptions<A>) -> Result<Self> {
        let mut machine = Machine::new(options)?;
        machine.memory.load_program(image, &machine.options)?;
        machine.cpu.set_reg(REG_SP, machine.memory.stack_initial());
        machine.cpu.registers_mut().pc = machine.memory.start_address();
        Ok(machine)
    }

    /// Creates a copy-on-write fork of this machine.
    ///
    /// The fork starts with the same registers, instruction counter and system call handler.
    /// See [`Memory::fork`] for how memory is shared.
    ///
    /// # Errors
    /// Propagates [`Memory::fork`] errors.
    pub fn fork(&self, options: MachineOptions<A>) -> Result<Self> {
        let memory = Memory::fork(&self.memory, &options)?;
        debug!("Forked machine at pc {:#x}", self.cpu.pc());
        Ok(Machine {
            cpu: self.cpu.clone(),
            memory,
            options,
            counter: self.counter,
            max_counter: 0,
            stopped: false,
            syscall_handler: self.syscall_handler.clone(),
        })
    }

    /// The options this machine was created with.
    #[must_use]
    pub fn options(&self) -> &MachineOptions<A> {
        &self.options
    }

    /// Number of instructions executed so far.
    #[must_use]
    pub fn instruction_counter(&self) -> u64 {
        self.counter
    }

    /// Overwrites the instruction counter.
    pub fn set_instruction_counter(&mut self, counter: u64) {
        self.counter = counter;
    }

    /// The counter value at which the current [`Machine::simulate`] call returns.
    #[must_use]
    pub fn max_instructions(&self) -> u64 {
        self.max_counter
    }

    /// Stops the machine after the current instruction.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Returns `true` if the machine stopped.
    #[must_use]
    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Installs the `ECALL` handler. Without one every system call stops the machine.
    pub fn set_syscall_handler(&mut self, handler: SyscallHandler<A>) {
        self.syscall_handler = Some(handler);
    }

    /// Runs the system call `number`.
    ///
    /// # Errors
    /// Propagates errors of the system call handler.
    pub fn system_call(&mut self, number: u64) -> Result<()> {
        match self.syscall_handler.clone() {
            Some(handler) => handler(self, number),
            None => {
                debug!("Unhandled system call {number}, stopping");
                self.stop();
                Ok(())
            }
        }
    }

    /// Runs until the guest stops the machine or `max_instructions` more instructions have
    /// executed.
    ///
    /// Reaching [`Memory::exit_address`] stops the machine.
    ///
    /// # Errors
    /// Returns the first guest fault. The program counter is left at the faulting
    /// instruction.
    pub fn simulate(&mut self, max_instructions: u64) -> Result<StopReason> {
        self.stopped = false;
        self.max_counter = self.counter.saturating_add(max_instructions);

        while self.counter < self.max_counter {
            self.execute_one()?;
            if self.stopped {
                return Ok(StopReason::Stopped);
            }
        }
        Ok(StopReason::InstructionLimit)
    }

    /// Executes a single instruction.
    ///
    /// # Errors
    /// Returns the guest fault raised by the instruction, if any.
    pub fn step_one(&mut self) -> Result<()> {
        self.stopped = false;
        self.execute_one()
    }

    /// Calls the guest function at `addr` with up to eight integer arguments and returns
    /// `a0`.
    ///
    /// The return address is [`Memory::exit_address`], so returning from the function stops
    /// the machine.
    ///
    /// # Errors
    /// Returns [`Error::InvalidProgram`] for more than eight arguments, guest faults, and
    /// [`Error::ExecutionLoopDetected`] if the function did not return within
    /// `max_instructions`.
    pub fn vmcall(&mut self, addr: u64, args: &[u64], max_instructions: u64) -> Result<u64> {
        if args.len() > 8 {
            return Err(invalid_program!("Too many function arguments", args.len()));
        }
        for (i, arg) in args.iter().enumerate() {
            self.cpu.set_reg(REG_A0 + i, *arg);
        }
        self.cpu.set_reg(REG_RA, self.memory.exit_address());
        self.cpu.set_reg(REG_SP, self.memory.stack_initial());
        self.cpu.registers_mut().pc = A::wrap(addr);

        match self.simulate(max_instructions)? {
            StopReason::Stopped => Ok(self.cpu.reg(REG_A0)),
            StopReason::InstructionLimit => Err(Error::ExecutionLoopDetected {
                pc: self.cpu.pc(),
            }),
        }
    }

    fn current_segment(&mut self) -> Result<(SegmentHandle<A>, u64)> {
        let pc = self.cpu.pc();
        match self.cpu.cached_segment_for(pc) {
            Some(segment) => Ok((segment, pc)),
            None => self.cpu.next_execute_segment(&mut self.memory, pc),
        }
    }

    fn execute_one(&mut self) -> Result<()> {
        if self.cpu.pc() == self.memory.exit_address() {
            trace!("Reached exit address {:#x}", self.cpu.pc());
            self.stop();
            return Ok(());
        }

        let (segment, pc) = self.current_segment()?;
        self.cpu.registers_mut().pc = pc;
        let entry = *segment
            .decoder_entry(pc)
            .ok_or(Error::ExecutionSpaceProtectionFault { addr: pc })?;
        self.counter += 1;

        match entry.get_bytecode() {
            #[allow(clippy::cast_possible_wrap)]
            Bytecode::FastJal => {
                isa::fast_jump(self, entry.instr as i32);
                self.cpu.take_jumped();
                Ok(())
            }
            #[allow(clippy::cast_possible_wrap)]
            Bytecode::FastCall => {
                isa::fast_call(self, entry.instr as i32, 4);
                self.cpu.take_jumped();
                Ok(())
            }
            Bytecode::Stop => {
                self.cpu.increment_pc(4);
                self.stop();
                Ok(())
            }
            Bytecode::Invalid if entry.is_invalid_handler() => {
                self.execute_invalid(&segment, pc, entry)
            }
            Bytecode::Funcblock => {
                let instr = Instruction(entry.instr);
                let handler = isa::decode::<A>(instr).handler;
                self.run_handler(handler, instr, segment.is_compressed())
            }
            _ => {
                let handler = self
                    .memory
                    .handlers()
                    .get(entry.handler)
                    .map(|h| h.handler)
                    .ok_or_else(|| invalid_program!("Unregistered handler index", entry.handler))?;
                self.run_handler(handler, Instruction(entry.instr), segment.is_compressed())
            }
        }
    }

    fn run_handler(
        &mut self,
        handler: HandlerFn<A>,
        instr: Instruction,
        compressed: bool,
    ) -> Result<()> {
        self.cpu.take_jumped();
        handler(self, instr)?;
        if !self.cpu.take_jumped() {
            let len = if compressed { instr.length() } else { 4 };
            self.cpu.increment_pc(len);
        }
        Ok(())
    }

    /// An entry decoded as invalid. If the entry was decoded from zero bytes but memory now
    /// holds code there, the segment was decoded too early (e.g. before a JIT wrote it) and
    /// is marked stale so the next step decodes it again.
    fn execute_invalid(
        &mut self,
        segment: &SegmentHandle<A>,
        pc: u64,
        entry: DecoderData,
    ) -> Result<()> {
        if entry.instr == 0 && matches!(self.memory.read::<u16>(pc), Ok(bits) if bits != 0) {
            debug!("Execute segment at {pc:#x} is stale, decoding again");
            segment.set_stale(true);
            self.cpu.reset_execute_segment();
            return Ok(());
        }
        Err(Error::IllegalOpcode {
            instr: entry.instr,
            pc,
        })
    }

    /// Describes a fault for humans: the error, the instruction at the program counter, the
    /// register file and a backtrace.
    #[must_use]
    pub fn describe_fault(&self, error: &Error) -> String {
        let pc = self.cpu.pc();
        let mut out = format!("{error}\n");

        if let Some(segment) = self.memory.exec_segment_for(pc) {
            let instr = segment.read_instruction(pc, segment.exec_end());
            let _ = writeln!(
                out,
                "Instruction {:?} ({}) at {pc:#x}",
                instr,
                isa::decode::<A>(instr).name
            );
        }
        out.push_str(&self.cpu.registers().to_string());
        out.push('\n');

        for frame in self
            .memory
            .backtrace(pc, Some(self.cpu.reg(REG_RA)))
            .into_iter()
            .filter(|frame| !frame.is_empty())
        {
            out.push_str(&frame);
            out.push('\n');
        }
        out
    }

    /// Appends a snapshot of the registers, counter and address space to `out`, returning
    /// the number of bytes written. Restore it with [`Machine::deserialize_from`].
    ///
    /// # Errors
    /// Returns [`Error::FeatureDisabled`] for machines with a flat arena.
    pub fn serialize_to(&self, out: &mut Vec<u8>) -> Result<usize> {
        let registers = self.cpu.registers().to_bytes();
        let (n_pages, n_datapages) = self.memory.serialized_page_counts();
        let header_size = SnapshotHeader::encoded_size::<A>(registers.len());
        let mem_offset = u32::try_from(header_size)
            .map_err(|_| malformed_error!("Snapshot header too large"))?;

        let header = SnapshotHeader {
            n_pages,
            n_datapages,
            cpu_offset: 32,
            mem_offset,
            registers,
            counter: self.counter,
            start_address: self.memory.start_address(),
            stack_address: self.memory.stack_initial(),
            mmap_address: self.memory.mmap_address(),
            heap_address: self.memory.heap_address(),
            exit_address: self.memory.exit_address(),
        };

        let start = out.len();
        header.encode::<A>(out);
        if let Err(e) = self.memory.serialize_to(out) {
            out.truncate(start);
            return Err(e);
        }
        debug!(
            "Serialized machine: {n_pages} pages, {} bytes",
            out.len() - start
        );
        Ok(out.len() - start)
    }

    /// Restores a snapshot written by [`Machine::serialize_to`].
    ///
    /// Every page is replaced and every execute segment evicted; code is decoded again from
    /// the restored pages when execution resumes.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] or [`Error::OutOfBounds`] for foreign or truncated
    /// snapshots, in which case the machine is unchanged, and [`Error::OutOfMemory`] when
    /// the pages exceed the budget.
    pub fn deserialize_from(&mut self, data: &[u8]) -> Result<()> {
        let header = SnapshotHeader::decode::<A>(data, Registers::<A>::serialized_size())?;
        let registers = Registers::<A>::from_bytes(&header.registers)?;

        self.cpu.reset_execute_segment();
        self.memory.deserialize_from(data, &header)?;
        *self.cpu.registers_mut() = registers;
        self.counter = header.counter;
        Ok(())
    }
}
