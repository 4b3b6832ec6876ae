mod cop0;
mod instruction;
mod register;

pub use instruction::{Instruction, Opcode};
pub use register::{RegisterType, Registers};

use cop0::{Cop0, CAUSE_BD, SR_BEV, SR_IEC};

use crate::frontend::TraceEvent;
use crate::gte::Gte;
use crate::memory::CpuBusProvider;
use crate::CYCLES_INST;

const RESET_VECTOR: u32 = 0x1FC0_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exception {
    Interrupt = 0x00,
    AddressErrorLoad = 0x04,
    AddressErrorStore = 0x05,
    BusErrorInstruction = 0x06,
    BusErrorData = 0x07,
    Syscall = 0x08,
    Breakpoint = 0x09,
    ReservedInstruction = 0x0A,
    CoprocessorUnusable = 0x0B,
    IntegerOverflow = 0x0C,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Empty,
    Waiting,
    Ready,
}

/// The branch-delay slot: a taken branch waits here for exactly one more
/// instruction before it commits to the new PC.
struct BranchSlot {
    state: SlotState,
    addr: u32,
    cond: bool,
}

#[derive(Clone, Copy)]
struct LoadSlot {
    state: SlotState,
    val: u32,
    /// cleared when a direct write overtakes the in-flight load
    proceed: bool,
    /// LWL/LWR merge with the pending value instead of the committed one
    is_lwlr: bool,
}

/// Per-register load-delay slots, with a dense list of the busy entries so
/// the common case never scans all 32.
struct LoadDelayQueue {
    v: [LoadSlot; 32],
    active: [u8; 32],
    n: usize,
}

impl Default for LoadDelayQueue {
    fn default() -> Self {
        Self {
            v: [LoadSlot {
                state: SlotState::Empty,
                val: 0,
                proceed: false,
                is_lwlr: false,
            }; 32],
            active: [0; 32],
            n: 0,
        }
    }
}

#[derive(Clone, Copy)]
struct CopWriteSlot {
    state: SlotState,
    val: u32,
}

/// Delayed coprocessor register writes; 64 entries cover data + control.
struct CopWriteQueue {
    v: [CopWriteSlot; 64],
    active: [u8; 64],
    n: usize,
}

impl Default for CopWriteQueue {
    fn default() -> Self {
        Self {
            v: [CopWriteSlot {
                state: SlotState::Empty,
                val: 0,
            }; 64],
            active: [0; 64],
            n: 0,
        }
    }
}

impl CopWriteQueue {
    /// Returns the value this slot held if it was already pending.
    fn push(&mut self, reg: usize, val: u32, delayed_ops: &mut u32) -> Option<u32> {
        let prev = if self.v[reg].state == SlotState::Empty {
            self.active[self.n] = reg as u8;
            self.n += 1;
            *delayed_ops += 1;
            None
        } else {
            Some(self.v[reg].val)
        };
        self.v[reg] = CopWriteSlot {
            state: SlotState::Waiting,
            val,
        };
        prev
    }
}

/// The R3000A interpreter.
///
/// Exactly one instruction advances per `next_inst` call; every side effect
/// that the real pipeline delays (branches, loads, coprocessor writes) goes
/// through a three-state slot that commits one dispatch later.
pub struct Cpu {
    regs: Registers,
    cop0: Cop0,
    gte: Box<dyn Gte>,

    branch: BranchSlot,
    ldelayed: LoadDelayQueue,
    cop0_writes: CopWriteQueue,
    cop2_writes: CopWriteQueue,
    /// total outstanding slots; zero lets dispatch skip the queue walks
    delayed_ops: u32,

    new_pc: u32,
    inst_word: u32,
    elapsed: u32,

    trace: bool,
    trace_buf: Vec<TraceEvent>,
}

impl Cpu {
    pub(crate) fn new(gte: Box<dyn Gte>) -> Self {
        let mut cpu = Self {
            regs: Registers::new(),
            cop0: Cop0::default(),
            gte,
            branch: BranchSlot {
                state: SlotState::Empty,
                addr: 0,
                cond: false,
            },
            ldelayed: LoadDelayQueue::default(),
            cop0_writes: CopWriteQueue::default(),
            cop2_writes: CopWriteQueue::default(),
            delayed_ops: 0,
            new_pc: 0,
            inst_word: 0,
            elapsed: 0,
            trace: false,
            trace_buf: Vec::new(),
        };
        cpu.first_reset();
        cpu
    }

    /// Reset without touching the bus: used at power-on.
    fn first_reset(&mut self) {
        self.cop0.epc = self.regs.pc;
        self.cop0.cause &= !CAUSE_BD;
        self.cop0.sr = (self.cop0.sr & 0xFFFF_FFC0) | ((self.cop0.sr & 0xF) << 2);
        self.cop0.cause &= 0xFFFF_FF83;
        self.cop0.sr |= SR_BEV;
        self.cop0.update_flags();
        self.regs.pc = RESET_VECTOR;
        self.new_pc = RESET_VECTOR;
    }

    /// Soft reset: an exception frame is pushed and execution restarts at
    /// the BIOS vector.
    pub(crate) fn reset(&mut self) {
        if self.branch.state != SlotState::Empty {
            self.branch.state = SlotState::Empty;
            self.delayed_ops -= 1;
        }
        self.gte.reset();
        self.first_reset();
    }

    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.regs
    }

    pub fn pc(&self) -> u32 {
        self.regs.pc
    }

    /// Debugger view of a COP0 register; reserved selectors read zero.
    pub fn cop0_reg(&self, reg: u32) -> u32 {
        self.cop0.read_reg(reg).unwrap_or(0)
    }

    pub(crate) fn set_trace_mode(&mut self, enable: bool) {
        self.trace = enable;
    }

    pub(crate) fn take_trace(&mut self) -> Vec<TraceEvent> {
        std::mem::take(&mut self.trace_buf)
    }

    /// Interpret one instruction; returns the cycles it consumed.
    pub(crate) fn next_inst<B: CpuBusProvider>(&mut self, bus: &mut B) -> u32 {
        // the external IRQ line mirrors into CAUSE.IP[10] and is sampled at
        // dispatch, never mid-instruction
        if bus.pending_interrupts() {
            self.cop0.cause |= 1 << 10;
        } else {
            self.cop0.cause &= !(1 << 10);
        }
        if self.cop0.sr & SR_IEC != 0 && self.cop0.sr & self.cop0.cause & 0xFF00 != 0 {
            self.exception(bus, Exception::Interrupt);
            self.regs.pc = self.new_pc;
            return CYCLES_INST;
        }

        self.elapsed = CYCLES_INST;

        // a failed fetch raises its exception and leaves the previous word
        // in the pipeline, which is what the hardware effectively does
        self.fetch(bus, self.regs.pc);
        if self.trace {
            self.trace_buf.push(TraceEvent::CpuInstruction {
                addr: self.regs.pc,
                word: self.inst_word,
            });
        }
        self.new_pc = self.regs.pc.wrapping_add(4);

        self.exec(bus);

        if self.delayed_ops > 0 {
            self.run_delayed_ops(bus);
        }

        self.regs.pc = self.new_pc;
        self.elapsed
    }
}

// field decode helpers
impl Cpu {
    #[inline]
    fn f_rs(&self) -> usize {
        ((self.inst_word >> 21) & 0x1F) as usize
    }

    #[inline]
    fn f_rt(&self) -> usize {
        ((self.inst_word >> 16) & 0x1F) as usize
    }

    #[inline]
    fn f_rd(&self) -> usize {
        ((self.inst_word >> 11) & 0x1F) as usize
    }

    #[inline]
    fn f_sa(&self) -> u32 {
        (self.inst_word >> 6) & 0x1F
    }

    #[inline]
    fn f_funct(&self) -> u32 {
        self.inst_word & 0x3F
    }

    #[inline]
    fn f_imm16(&self) -> u16 {
        self.inst_word as u16
    }

    #[inline]
    fn f_index(&self) -> u32 {
        self.inst_word & 0x03FF_FFFF
    }

    #[inline]
    fn sext16(v: u16) -> u32 {
        v as i16 as i32 as u32
    }

    #[inline]
    fn sext8(v: u8) -> u32 {
        v as i8 as i32 as u32
    }
}

// delayed-op machinery
impl Cpu {
    #[inline]
    fn set_reg(&mut self, reg: usize, val: u32) {
        if reg != 0 {
            self.regs.gpr[reg] = val;
            // a direct write beats an in-flight load to the same register
            self.ldelayed.v[reg].proceed = false;
        }
    }

    fn set_ldelayed(&mut self, reg: usize, val: u32, is_lwlr: bool) {
        if reg == 0 {
            return;
        }
        if self.ldelayed.v[reg].state == SlotState::Empty {
            self.ldelayed.active[self.ldelayed.n] = reg as u8;
            self.ldelayed.n += 1;
            self.delayed_ops += 1;
        }
        self.ldelayed.v[reg] = LoadSlot {
            state: SlotState::Waiting,
            val,
            proceed: true,
            is_lwlr,
        };
    }

    /// The value LWL/LWR merge into: the pending value when the pending
    /// entry is itself an unaligned load, the committed register otherwise.
    #[inline]
    fn lwlr_reg_val(&self, reg: usize) -> u32 {
        let slot = &self.ldelayed.v[reg];
        if slot.state != SlotState::Empty && slot.is_lwlr {
            slot.val
        } else {
            self.regs.gpr[reg]
        }
    }

    fn set_branch(&mut self, addr: u32, cond: bool) {
        if self.branch.state == SlotState::Empty {
            self.delayed_ops += 1;
        }
        self.branch = BranchSlot {
            state: SlotState::Waiting,
            addr,
            cond,
        };
    }

    fn set_cop0write(&mut self, reg: usize, val: u32) {
        if self
            .cop0_writes
            .push(reg, val, &mut self.delayed_ops)
            .is_some()
        {
            log::warn!("cop0 delayed write overwrites pending reg {}", reg);
        }
    }

    fn set_cop2write(&mut self, reg: usize, val: u32) {
        // a second write while one is pending flushes the old one now
        if let Some(prev) = self.cop2_writes.push(reg, val, &mut self.delayed_ops) {
            self.gte.write(reg, prev);
        }
    }

    fn update_ldelayed(&mut self) {
        let mut i = 0;
        while i < self.ldelayed.n {
            let reg = self.ldelayed.active[i] as usize;
            match self.ldelayed.v[reg].state {
                SlotState::Waiting => {
                    self.ldelayed.v[reg].state = SlotState::Ready;
                    i += 1;
                }
                SlotState::Ready => {
                    if self.ldelayed.v[reg].proceed {
                        self.regs.gpr[reg] = self.ldelayed.v[reg].val;
                    }
                    self.ldelayed.v[reg].state = SlotState::Empty;
                    self.ldelayed.n -= 1;
                    self.ldelayed.active[i] = self.ldelayed.active[self.ldelayed.n];
                    self.delayed_ops -= 1;
                }
                SlotState::Empty => unreachable!("empty slot in the active list"),
            }
        }
    }

    fn update_cop0write<B: CpuBusProvider>(&mut self, bus: &mut B) {
        let mut i = 0;
        while i < self.cop0_writes.n {
            let reg = self.cop0_writes.active[i] as usize;
            match self.cop0_writes.v[reg].state {
                SlotState::Waiting => {
                    self.cop0_writes.v[reg].state = SlotState::Ready;
                    i += 1;
                }
                SlotState::Ready => {
                    let val = self.cop0_writes.v[reg].val;
                    self.cop0_writes.v[reg].state = SlotState::Empty;
                    self.cop0_writes.n -= 1;
                    self.cop0_writes.active[i] = self.cop0_writes.active[self.cop0_writes.n];
                    self.delayed_ops -= 1;
                    if self.cop0.write_reg(reg as u32, val).is_err() {
                        self.exception(bus, Exception::ReservedInstruction);
                    }
                }
                SlotState::Empty => unreachable!("empty slot in the active list"),
            }
        }
    }

    fn update_cop2write(&mut self) {
        let mut i = 0;
        while i < self.cop2_writes.n {
            let reg = self.cop2_writes.active[i] as usize;
            match self.cop2_writes.v[reg].state {
                SlotState::Waiting => {
                    self.cop2_writes.v[reg].state = SlotState::Ready;
                    i += 1;
                }
                SlotState::Ready => {
                    let val = self.cop2_writes.v[reg].val;
                    self.gte.write(reg, val);
                    self.cop2_writes.v[reg].state = SlotState::Empty;
                    self.cop2_writes.n -= 1;
                    self.cop2_writes.active[i] = self.cop2_writes.active[self.cop2_writes.n];
                    self.delayed_ops -= 1;
                }
                SlotState::Empty => unreachable!("empty slot in the active list"),
            }
        }
    }

    fn run_delayed_ops<B: CpuBusProvider>(&mut self, bus: &mut B) {
        match self.branch.state {
            SlotState::Waiting => self.branch.state = SlotState::Ready,
            SlotState::Ready => {
                if self.branch.cond {
                    self.new_pc = self.branch.addr;
                }
                self.branch.state = SlotState::Empty;
                self.delayed_ops -= 1;
            }
            SlotState::Empty => {}
        }

        if self.ldelayed.n > 0 {
            self.update_ldelayed();
        }
        if self.cop0_writes.n > 0 {
            self.update_cop0write(bus);
        }
        if self.cop2_writes.n > 0 {
            self.update_cop2write();
        }
    }
}

// exceptions
impl Cpu {
    fn exception<B: CpuBusProvider>(&mut self, bus: &mut B, excp: Exception) {
        if self.branch.state == SlotState::Ready {
            // we are inside a branch delay slot
            self.cop0.epc = self.regs.pc.wrapping_sub(4);
            self.cop0.cause |= CAUSE_BD;
        } else {
            // if the interrupted instruction would have been a GTE command,
            // run it in place first; it has no memory side effects and
            // several titles depend on it not being lost
            let saved = self.inst_word;
            if let Some(word) = self.peek_code(bus, self.regs.pc) {
                if word & 0xFE00_0000 == 0x4A00_0000 {
                    self.inst_word = word;
                    self.op_cop2(bus);
                    self.inst_word = saved;
                }
            }
            self.cop0.epc = self.regs.pc;
            self.cop0.cause &= !CAUSE_BD;
        }

        if self.branch.state != SlotState::Empty {
            self.branch.state = SlotState::Empty;
            self.delayed_ops -= 1;
        }

        // KUp,IEp -> KUo,IEo; KUc,IEc -> KUp,IEp; 0,0 -> KUc,IEc
        self.cop0.sr = (self.cop0.sr & 0xFFFF_FFC0) | ((self.cop0.sr & 0xF) << 2);
        self.cop0.update_flags();

        self.cop0.cause = (self.cop0.cause & 0xFFFF_FF83) | ((excp as u32) << 2);

        self.new_pc = if self.cop0.sr & SR_BEV != 0 {
            0xBFC0_0180
        } else {
            0x8000_0080
        };
    }

    fn exception_cop<B: CpuBusProvider>(&mut self, bus: &mut B, excp: Exception, cop: u32) {
        self.cop0.cause = (self.cop0.cause & 0xCFFF_FFFF) | (cop << 27);
        self.exception(bus, excp);
    }

    fn exception_addr<B: CpuBusProvider>(&mut self, bus: &mut B, excp: Exception, addr: u32) {
        self.cop0.bad_vaddr = addr;
        self.exception(bus, excp);
    }
}

// memory access, with the segment rules
impl Cpu {
    /// Virtual -> physical, with the user-mode and overlay checks shared by
    /// every access width. `Err(true)` is an address error, `Err(false)` a
    /// bus error. Writes never reach this while the cache is isolated; the
    /// store paths swallow those first.
    fn translate(&mut self, addr: u32, is_data: bool) -> Result<u32, bool> {
        if addr < 0x8000_0000 {
            // kuseg
            if self.cop0.cache_isolated && is_data {
                log::warn!(
                    "access to cached memory ({:08X}) with the cache isolated; \
                     the cache is not modeled",
                    addr
                );
            }
            if !self.cop0.scratchpad_enabled && (0x1F80_0000..0x1F80_1000).contains(&addr) {
                log::warn!("access to the scratchpad ({:08X}) while disabled", addr);
                return Err(false);
            }
            Ok(addr)
        } else if addr < 0xA000_0000 {
            // kseg0
            if self.cop0.user_mode {
                return Err(true);
            }
            if self.cop0.cache_isolated && is_data {
                log::warn!(
                    "access to cached memory ({:08X}) with the cache isolated; \
                     the cache is not modeled",
                    addr
                );
            }
            if !self.cop0.scratchpad_enabled && (0x9F80_0000..0x9F80_1000).contains(&addr) {
                log::warn!("access to the scratchpad ({:08X}) while disabled", addr);
                return Err(false);
            }
            Ok(addr & 0x1FFF_FFFF)
        } else if addr < 0xC000_0000 {
            // kseg1, uncached: the scratchpad is not mapped here at all
            if self.cop0.user_mode {
                return Err(true);
            }
            if (0xBF80_0000..=0xBF80_1000).contains(&addr) {
                return Err(false);
            }
            Ok(addr & 0x1FFF_FFFF)
        } else {
            // only the cache-control window lives up here
            if self.cop0.user_mode {
                return Err(true);
            }
            Ok(addr)
        }
    }

    #[inline]
    fn is_garbage_region(addr: u32) -> bool {
        (0xFFFE_0000..0xFFFE_0020).contains(&addr)
            || (0xFFFE_0100..0xFFFE_0130).contains(&addr)
            || (0xFFFE_0132..0xFFFE_0140).contains(&addr)
    }

    fn trace_mem(&mut self, write: bool, addr: u32, data: u32, bits: u8, error: bool) {
        if self.trace {
            self.trace_buf.push(TraceEvent::MemAccess {
                write,
                addr,
                data,
                bits,
                error,
            });
        }
    }

    /// Instruction fetch; raises the fault itself and returns false on one.
    fn fetch<B: CpuBusProvider>(&mut self, bus: &mut B, addr: u32) -> bool {
        match self.mem_read(bus, addr, false) {
            Some(word) => {
                self.inst_word = word;
                true
            }
            None => false,
        }
    }

    /// Fault-free look at a code word; used by the exception path.
    fn peek_code<B: CpuBusProvider>(&mut self, bus: &mut B, addr: u32) -> Option<u32> {
        if addr & 3 != 0 {
            return None;
        }
        let phys = self.translate(addr, false).ok()?;
        if phys >= 0xC000_0000 {
            return None;
        }
        bus.read_u32(phys).ok()
    }

    fn mem_read<B: CpuBusProvider>(&mut self, bus: &mut B, addr: u32, is_data: bool) -> Option<u32> {
        if addr & 0x3 != 0 {
            self.exception_addr(bus, Exception::AddressErrorLoad, addr);
            return None;
        }
        let phys = match self.translate(addr, is_data) {
            Ok(a) => a,
            Err(true) => {
                self.exception_addr(bus, Exception::AddressErrorLoad, addr);
                return None;
            }
            Err(false) => {
                self.exception(
                    bus,
                    if is_data {
                        Exception::BusErrorData
                    } else {
                        Exception::BusErrorInstruction
                    },
                );
                return None;
            }
        };

        if phys >= 0xC000_0000 {
            // cache control and the garbage around it
            if phys == 0xFFFE_0130 {
                return Some(self.cop0.read_cache_control());
            }
            if Self::is_garbage_region(phys) {
                return Some(0);
            }
            self.exception(
                bus,
                if is_data {
                    Exception::BusErrorData
                } else {
                    Exception::BusErrorInstruction
                },
            );
            return None;
        }

        match bus.read_u32(phys) {
            Ok(v) => {
                self.trace_mem(false, phys, v, 32, false);
                Some(v)
            }
            Err(msg) => {
                log::warn!("bus error: u32 read {:08X}: {}", addr, msg);
                self.trace_mem(false, phys, 0, 32, true);
                self.exception(
                    bus,
                    if is_data {
                        Exception::BusErrorData
                    } else {
                        Exception::BusErrorInstruction
                    },
                );
                None
            }
        }
    }

    fn mem_read16<B: CpuBusProvider>(&mut self, bus: &mut B, addr: u32) -> Option<u16> {
        if addr & 0x1 != 0 {
            self.exception_addr(bus, Exception::AddressErrorLoad, addr);
            return None;
        }
        let is_le = self.cop0.is_le;
        let phys = match self.translate(addr, true) {
            Ok(a) => a,
            Err(true) => {
                self.exception_addr(bus, Exception::AddressErrorLoad, addr);
                return None;
            }
            Err(false) => {
                self.exception(bus, Exception::BusErrorData);
                return None;
            }
        };

        if phys >= 0xC000_0000 {
            if phys & !1 == 0xFFFE_0130 {
                let v = match (phys & 0x1) ^ (is_le as u32) {
                    0 => 0,
                    _ => self.cop0.read_cache_control() as u16,
                };
                return Some(v);
            }
            if Self::is_garbage_region(phys) {
                return Some(0);
            }
            self.exception(bus, Exception::BusErrorData);
            return None;
        }

        match bus.read_u16(phys, is_le) {
            Ok(v) => {
                self.trace_mem(false, phys, v as u32, 16, false);
                Some(v)
            }
            Err(msg) => {
                log::warn!("bus error: u16 read {:08X}: {}", addr, msg);
                self.trace_mem(false, phys, 0, 16, true);
                self.exception(bus, Exception::BusErrorData);
                None
            }
        }
    }

    fn mem_read8<B: CpuBusProvider>(&mut self, bus: &mut B, addr: u32) -> Option<u8> {
        let is_le = self.cop0.is_le;
        let phys = match self.translate(addr, true) {
            Ok(a) => a,
            Err(true) => {
                self.exception_addr(bus, Exception::AddressErrorLoad, addr);
                return None;
            }
            Err(false) => {
                self.exception(bus, Exception::BusErrorData);
                return None;
            }
        };

        if phys >= 0xC000_0000 {
            if phys & !3 == 0xFFFE_0130 {
                let v = match (phys & 0x3) ^ (is_le as u32 * 0x3) {
                    2 => (self.cop0.read_cache_control() >> 8) as u8,
                    3 => self.cop0.read_cache_control() as u8,
                    _ => 0,
                };
                return Some(v);
            }
            if Self::is_garbage_region(phys) {
                return Some(0);
            }
            self.exception(bus, Exception::BusErrorData);
            return None;
        }

        match bus.read_u8(phys, is_le) {
            Ok(v) => {
                self.trace_mem(false, phys, v as u32, 8, false);
                Some(v)
            }
            Err(msg) => {
                log::warn!("bus error: u8 read {:08X}: {}", addr, msg);
                self.trace_mem(false, phys, 0, 8, true);
                self.exception(bus, Exception::BusErrorData);
                None
            }
        }
    }

    fn mem_write<B: CpuBusProvider>(&mut self, bus: &mut B, addr: u32, data: u32) -> bool {
        if addr & 0x3 != 0 {
            self.exception_addr(bus, Exception::AddressErrorStore, addr);
            return false;
        }
        if self.cop0.cache_isolated && addr < 0xA000_0000 {
            // cache-tag initialization writes go nowhere
            return true;
        }
        let phys = match self.translate(addr, true) {
            Ok(a) => a,
            Err(true) => {
                self.exception_addr(bus, Exception::AddressErrorStore, addr);
                return false;
            }
            Err(false) => {
                self.exception(bus, Exception::BusErrorData);
                return false;
            }
        };

        if phys >= 0xC000_0000 {
            if phys == 0xFFFE_0130 {
                self.cop0.write_cache_control(data);
                return true;
            }
            if Self::is_garbage_region(phys) {
                return true;
            }
            self.exception(bus, Exception::BusErrorData);
            return false;
        }

        match bus.write_u32(phys, data) {
            Ok(()) => {
                self.trace_mem(true, phys, data, 32, false);
                true
            }
            Err(msg) => {
                log::warn!("bus error: u32 write {:08X}: {}", addr, msg);
                self.trace_mem(true, phys, data, 32, true);
                self.exception(bus, Exception::BusErrorData);
                false
            }
        }
    }

    fn mem_write16<B: CpuBusProvider>(&mut self, bus: &mut B, addr: u32, data: u16) -> bool {
        if addr & 0x1 != 0 {
            self.exception_addr(bus, Exception::AddressErrorStore, addr);
            return false;
        }
        if self.cop0.cache_isolated && addr < 0xA000_0000 {
            return true;
        }
        let is_le = self.cop0.is_le;
        let phys = match self.translate(addr, true) {
            Ok(a) => a,
            Err(true) => {
                self.exception_addr(bus, Exception::AddressErrorStore, addr);
                return false;
            }
            Err(false) => {
                self.exception(bus, Exception::BusErrorData);
                return false;
            }
        };

        if phys >= 0xC000_0000 {
            if phys & !1 == 0xFFFE_0130 {
                if (phys & 0x1) ^ (is_le as u32) == 1 {
                    self.cop0.write_cache_control(data as u32);
                }
                return true;
            }
            if Self::is_garbage_region(phys) {
                return true;
            }
            self.exception(bus, Exception::BusErrorData);
            return false;
        }

        match bus.write_u16(phys, data, is_le) {
            Ok(()) => {
                self.trace_mem(true, phys, data as u32, 16, false);
                true
            }
            Err(msg) => {
                log::warn!("bus error: u16 write {:08X}: {}", addr, msg);
                self.trace_mem(true, phys, data as u32, 16, true);
                self.exception(bus, Exception::BusErrorData);
                false
            }
        }
    }

    /// `data16` carries the full halfword for 16-bit-wide devices.
    fn mem_write8<B: CpuBusProvider>(
        &mut self,
        bus: &mut B,
        addr: u32,
        data: u8,
        data16: u16,
    ) -> bool {
        if self.cop0.cache_isolated && addr < 0xA000_0000 {
            return true;
        }
        let is_le = self.cop0.is_le;
        let phys = match self.translate(addr, true) {
            Ok(a) => a,
            Err(true) => {
                self.exception_addr(bus, Exception::AddressErrorStore, addr);
                return false;
            }
            Err(false) => {
                self.exception(bus, Exception::BusErrorData);
                return false;
            }
        };

        if phys >= 0xC000_0000 {
            if phys & !3 == 0xFFFE_0130 {
                let cc = self.cop0.read_cache_control();
                match (phys & 0x3) ^ (is_le as u32 * 0x3) {
                    2 => self
                        .cop0
                        .write_cache_control((cc & 0xFFFF_00FF) | (((data & 0x0A) as u32) << 8)),
                    3 => self
                        .cop0
                        .write_cache_control((cc & 0xFFFF_FF00) | (data & 0xBF) as u32),
                    _ => {}
                }
                return true;
            }
            if Self::is_garbage_region(phys) {
                return true;
            }
            self.exception(bus, Exception::BusErrorData);
            return false;
        }

        match bus.write_u8(phys, data, data16, is_le) {
            Ok(()) => {
                self.trace_mem(true, phys, data as u32, 8, false);
                true
            }
            Err(msg) => {
                log::warn!("bus error: u8 write {:08X}: {}", addr, msg);
                self.trace_mem(true, phys, data as u32, 8, true);
                self.exception(bus, Exception::BusErrorData);
                false
            }
        }
    }
}

// execution
impl Cpu {
    #[inline]
    fn check_overflow_add(a: u32, b: u32) -> (u32, bool) {
        let res = a.wrapping_add(b);
        (res, (!(a ^ b)) & (a ^ res) & 0x8000_0000 != 0)
    }

    fn exec<B: CpuBusProvider>(&mut self, bus: &mut B) {
        match self.inst_word >> 26 {
            0x00 => self.op_special(bus),
            0x01 => self.op_bcond(bus),
            0x02 => {
                // j
                let addr = (self.new_pc & 0xF000_0000) | (self.f_index() << 2);
                self.set_branch(addr, true);
            }
            0x03 => {
                // jal
                self.set_reg(31, self.new_pc.wrapping_add(4));
                let addr = (self.new_pc & 0xF000_0000) | (self.f_index() << 2);
                self.set_branch(addr, true);
            }
            0x04 => {
                // beq
                let addr = self.new_pc.wrapping_add(Self::sext16(self.f_imm16()) << 2);
                self.set_branch(addr, self.regs.gpr[self.f_rs()] == self.regs.gpr[self.f_rt()]);
            }
            0x05 => {
                // bne
                let addr = self.new_pc.wrapping_add(Self::sext16(self.f_imm16()) << 2);
                self.set_branch(addr, self.regs.gpr[self.f_rs()] != self.regs.gpr[self.f_rt()]);
            }
            0x06 => {
                // blez
                let addr = self.new_pc.wrapping_add(Self::sext16(self.f_imm16()) << 2);
                self.set_branch(addr, (self.regs.gpr[self.f_rs()] as i32) <= 0);
            }
            0x07 => {
                // bgtz
                let addr = self.new_pc.wrapping_add(Self::sext16(self.f_imm16()) << 2);
                self.set_branch(addr, (self.regs.gpr[self.f_rs()] as i32) > 0);
            }
            0x08 => {
                // addi
                let val = Self::sext16(self.f_imm16());
                let (res, ov) = Self::check_overflow_add(self.regs.gpr[self.f_rs()], val);
                if ov {
                    self.exception(bus, Exception::IntegerOverflow);
                } else {
                    self.set_reg(self.f_rt(), res);
                }
            }
            0x09 => {
                // addiu
                let val = self.regs.gpr[self.f_rs()].wrapping_add(Self::sext16(self.f_imm16()));
                self.set_reg(self.f_rt(), val);
            }
            0x0A => {
                // slti
                let v =
                    ((self.regs.gpr[self.f_rs()] as i32) < Self::sext16(self.f_imm16()) as i32) as u32;
                self.set_reg(self.f_rt(), v);
            }
            0x0B => {
                // sltiu
                let v = (self.regs.gpr[self.f_rs()] < Self::sext16(self.f_imm16())) as u32;
                self.set_reg(self.f_rt(), v);
            }
            0x0C => {
                // andi
                let v = self.regs.gpr[self.f_rs()] & self.f_imm16() as u32;
                self.set_reg(self.f_rt(), v);
            }
            0x0D => {
                // ori
                let v = self.regs.gpr[self.f_rs()] | self.f_imm16() as u32;
                self.set_reg(self.f_rt(), v);
            }
            0x0E => {
                // xori
                let v = self.regs.gpr[self.f_rs()] ^ self.f_imm16() as u32;
                self.set_reg(self.f_rt(), v);
            }
            0x0F => {
                // lui
                self.set_reg(self.f_rt(), (self.f_imm16() as u32) << 16);
            }
            0x10 => self.op_cop0(bus),
            0x12 => self.op_cop2(bus),
            0x20 => {
                // lb
                let addr = self.regs.gpr[self.f_rs()].wrapping_add(Self::sext16(self.f_imm16()));
                if let Some(v) = self.mem_read8(bus, addr) {
                    self.set_ldelayed(self.f_rt(), Self::sext8(v), false);
                }
            }
            0x21 => {
                // lh
                let addr = self.regs.gpr[self.f_rs()].wrapping_add(Self::sext16(self.f_imm16()));
                if let Some(v) = self.mem_read16(bus, addr) {
                    self.set_ldelayed(self.f_rt(), Self::sext16(v), false);
                }
            }
            0x22 => self.op_lwl(bus),
            0x23 => {
                // lw
                let addr = self.regs.gpr[self.f_rs()].wrapping_add(Self::sext16(self.f_imm16()));
                if let Some(v) = self.mem_read(bus, addr, true) {
                    self.set_ldelayed(self.f_rt(), v, false);
                }
            }
            0x24 => {
                // lbu
                let addr = self.regs.gpr[self.f_rs()].wrapping_add(Self::sext16(self.f_imm16()));
                if let Some(v) = self.mem_read8(bus, addr) {
                    self.set_ldelayed(self.f_rt(), v as u32, false);
                }
            }
            0x25 => {
                // lhu
                let addr = self.regs.gpr[self.f_rs()].wrapping_add(Self::sext16(self.f_imm16()));
                if let Some(v) = self.mem_read16(bus, addr) {
                    self.set_ldelayed(self.f_rt(), v as u32, false);
                }
            }
            0x26 => self.op_lwr(bus),
            0x28 => {
                // sb
                let addr = self.regs.gpr[self.f_rs()].wrapping_add(Self::sext16(self.f_imm16()));
                let rt = self.regs.gpr[self.f_rt()];
                self.mem_write8(bus, addr, rt as u8, rt as u16);
            }
            0x29 => {
                // sh
                let addr = self.regs.gpr[self.f_rs()].wrapping_add(Self::sext16(self.f_imm16()));
                let rt = self.regs.gpr[self.f_rt()];
                self.mem_write16(bus, addr, rt as u16);
            }
            0x2A => self.op_swl(bus),
            0x2B => {
                // sw
                let addr = self.regs.gpr[self.f_rs()].wrapping_add(Self::sext16(self.f_imm16()));
                let rt = self.regs.gpr[self.f_rt()];
                self.mem_write(bus, addr, rt);
            }
            0x2E => self.op_swr(bus),
            0x32 => {
                // lwc2
                if !self.cop0.cop2_enabled {
                    self.exception_cop(bus, Exception::CoprocessorUnusable, 2);
                    return;
                }
                let addr = self.regs.gpr[self.f_rs()].wrapping_add(Self::sext16(self.f_imm16()));
                if let Some(v) = self.mem_read(bus, addr, true) {
                    self.set_cop2write(self.f_rt(), v);
                }
            }
            0x3A => {
                // swc2
                if !self.cop0.cop2_enabled {
                    self.exception_cop(bus, Exception::CoprocessorUnusable, 2);
                    return;
                }
                let rt = self.f_rt();
                let (val, cost) = self.gte.read(rt);
                self.elapsed = cost;
                let addr = self.regs.gpr[self.f_rs()].wrapping_add(Self::sext16(self.f_imm16()));
                self.mem_write(bus, addr, val);
            }
            op => {
                log::warn!("unknown instruction, opcode {:02X}", op);
                self.exception(bus, Exception::ReservedInstruction);
            }
        }
    }

    fn op_special<B: CpuBusProvider>(&mut self, bus: &mut B) {
        match self.f_funct() {
            0x00 => {
                // sll
                let v = self.regs.gpr[self.f_rt()] << self.f_sa();
                self.set_reg(self.f_rd(), v);
            }
            0x02 => {
                // srl
                let v = self.regs.gpr[self.f_rt()] >> self.f_sa();
                self.set_reg(self.f_rd(), v);
            }
            0x03 => {
                // sra
                let v = ((self.regs.gpr[self.f_rt()] as i32) >> self.f_sa()) as u32;
                self.set_reg(self.f_rd(), v);
            }
            0x04 => {
                // sllv
                let v = self.regs.gpr[self.f_rt()] << (self.regs.gpr[self.f_rs()] & 0x1F);
                self.set_reg(self.f_rd(), v);
            }
            0x06 => {
                // srlv
                let v = self.regs.gpr[self.f_rt()] >> (self.regs.gpr[self.f_rs()] & 0x1F);
                self.set_reg(self.f_rd(), v);
            }
            0x07 => {
                // srav
                let v =
                    ((self.regs.gpr[self.f_rt()] as i32) >> (self.regs.gpr[self.f_rs()] & 0x1F)) as u32;
                self.set_reg(self.f_rd(), v);
            }
            0x08 => {
                // jr
                self.set_branch(self.regs.gpr[self.f_rs()], true);
            }
            0x09 => {
                // jalr
                if self.f_rd() != 0 {
                    self.set_reg(self.f_rd(), self.new_pc.wrapping_add(4));
                }
                self.set_branch(self.regs.gpr[self.f_rs()], true);
            }
            0x0C => self.exception(bus, Exception::Syscall),
            0x0D => self.exception(bus, Exception::Breakpoint),
            0x10 => {
                // mfhi
                self.set_reg(self.f_rd(), self.regs.hi);
            }
            0x11 => self.regs.hi = self.regs.gpr[self.f_rs()],
            0x12 => {
                // mflo
                self.set_reg(self.f_rd(), self.regs.lo);
            }
            0x13 => self.regs.lo = self.regs.gpr[self.f_rs()],
            0x18 => {
                // mult
                self.elapsed += 5;
                let rs = self.regs.gpr[self.f_rs()] as i32 as i64;
                let rt = self.regs.gpr[self.f_rt()] as i32 as i64;
                let res = (rs * rt) as u64;
                self.regs.lo = res as u32;
                self.regs.hi = (res >> 32) as u32;
            }
            0x19 => {
                // multu
                self.elapsed += 5;
                let res = self.regs.gpr[self.f_rs()] as u64 * self.regs.gpr[self.f_rt()] as u64;
                self.regs.lo = res as u32;
                self.regs.hi = (res >> 32) as u32;
            }
            0x1A => {
                // div; the edge cases follow the reference model, the
                // official documentation leaves them undefined
                self.elapsed += 10;
                let rs = self.regs.gpr[self.f_rs()];
                let rt = self.regs.gpr[self.f_rt()];
                if rt == 0 {
                    self.regs.lo = if rs & 0x8000_0000 != 0 { 1 } else { 0xFFFF_FFFF };
                    self.regs.hi = rs;
                } else if rs == 0x8000_0000 && rt == 0xFFFF_FFFF {
                    self.regs.lo = 0x8000_0000;
                    self.regs.hi = 0;
                } else {
                    self.regs.lo = ((rs as i32) / (rt as i32)) as u32;
                    self.regs.hi = ((rs as i32) % (rt as i32)) as u32;
                }
            }
            0x1B => {
                // divu
                self.elapsed += 10;
                let rs = self.regs.gpr[self.f_rs()];
                let rt = self.regs.gpr[self.f_rt()];
                if rt != 0 {
                    self.regs.lo = rs / rt;
                    self.regs.hi = rs % rt;
                } else {
                    self.regs.lo = 0xFFFF_FFFF;
                    self.regs.hi = rs;
                }
            }
            0x20 => {
                // add
                let (res, ov) =
                    Self::check_overflow_add(self.regs.gpr[self.f_rs()], self.regs.gpr[self.f_rt()]);
                if ov {
                    self.exception(bus, Exception::IntegerOverflow);
                } else {
                    self.set_reg(self.f_rd(), res);
                }
            }
            0x21 => {
                // addu
                let v = self.regs.gpr[self.f_rs()].wrapping_add(self.regs.gpr[self.f_rt()]);
                self.set_reg(self.f_rd(), v);
            }
            0x22 => {
                // sub, as an add of the complement so the overflow test is
                // shared with add
                let a = self.regs.gpr[self.f_rs()];
                let op2 = !self.regs.gpr[self.f_rt()];
                let res = a.wrapping_add(op2).wrapping_add(1);
                let ov = (!(a ^ op2)) & (a ^ res) & 0x8000_0000 != 0;
                if ov {
                    self.exception(bus, Exception::IntegerOverflow);
                } else {
                    self.set_reg(self.f_rd(), res);
                }
            }
            0x23 => {
                // subu
                let v = self.regs.gpr[self.f_rs()].wrapping_sub(self.regs.gpr[self.f_rt()]);
                self.set_reg(self.f_rd(), v);
            }
            0x24 => {
                let v = self.regs.gpr[self.f_rs()] & self.regs.gpr[self.f_rt()];
                self.set_reg(self.f_rd(), v);
            }
            0x25 => {
                let v = self.regs.gpr[self.f_rs()] | self.regs.gpr[self.f_rt()];
                self.set_reg(self.f_rd(), v);
            }
            0x26 => {
                let v = self.regs.gpr[self.f_rs()] ^ self.regs.gpr[self.f_rt()];
                self.set_reg(self.f_rd(), v);
            }
            0x27 => {
                let v = !(self.regs.gpr[self.f_rs()] | self.regs.gpr[self.f_rt()]);
                self.set_reg(self.f_rd(), v);
            }
            0x2A => {
                // slt
                let v = ((self.regs.gpr[self.f_rs()] as i32) < (self.regs.gpr[self.f_rt()] as i32))
                    as u32;
                self.set_reg(self.f_rd(), v);
            }
            0x2B => {
                // sltu
                let v = (self.regs.gpr[self.f_rs()] < self.regs.gpr[self.f_rt()]) as u32;
                self.set_reg(self.f_rd(), v);
            }
            funct => {
                log::warn!("unknown SPECIAL instruction, function {:02X}", funct);
                self.exception(bus, Exception::ReservedInstruction);
            }
        }
    }

    fn op_bcond<B: CpuBusProvider>(&mut self, bus: &mut B) {
        let addr = self.new_pc.wrapping_add(Self::sext16(self.f_imm16()) << 2);
        let rs = self.regs.gpr[self.f_rs()] as i32;
        match self.f_rt() {
            0x00 => self.set_branch(addr, rs < 0),
            0x01 => self.set_branch(addr, rs >= 0),
            0x10 => {
                self.set_reg(31, self.new_pc.wrapping_add(4));
                self.set_branch(addr, rs < 0);
            }
            0x11 => {
                self.set_reg(31, self.new_pc.wrapping_add(4));
                self.set_branch(addr, rs >= 0);
            }
            rt => {
                log::warn!("unknown BCOND instruction, function {:02X}", rt);
                self.exception(bus, Exception::ReservedInstruction);
            }
        }
    }

    fn op_cop0<B: CpuBusProvider>(&mut self, bus: &mut B) {
        if !self.cop0.cop0_enabled {
            self.exception_cop(bus, Exception::CoprocessorUnusable, 0);
            return;
        }

        if self.f_rs() & 0x10 != 0 {
            match self.f_funct() {
                0x10 => {
                    // rfe
                    self.cop0.sr = (self.cop0.sr & 0xFFFF_FFF0) | ((self.cop0.sr & 0x3C) >> 2);
                    self.cop0.update_flags();
                }
                0x01 | 0x02 | 0x06 | 0x08 => {
                    log::warn!("TLB instructions are not implemented");
                }
                funct => {
                    log::warn!("unknown COP0 instruction, cofunc {:02X}", funct);
                    self.exception(bus, Exception::ReservedInstruction);
                }
            }
        } else {
            match self.f_rs() {
                0x00 => {
                    // mfc0
                    match self.cop0.read_reg(self.f_rd() as u32) {
                        Some(val) => {
                            if self.f_rt() != 0 {
                                self.set_ldelayed(self.f_rt(), val, false);
                            }
                        }
                        None => self.exception(bus, Exception::ReservedInstruction),
                    }
                }
                0x04 => {
                    // mtc0
                    self.set_cop0write(self.f_rd(), self.regs.gpr[self.f_rt()]);
                }
                rs => {
                    log::warn!("unknown COP0 instruction, RS field {:02X}", rs);
                    self.exception(bus, Exception::ReservedInstruction);
                }
            }
        }
    }

    fn op_cop2<B: CpuBusProvider>(&mut self, bus: &mut B) {
        if !self.cop0.cop2_enabled {
            self.exception_cop(bus, Exception::CoprocessorUnusable, 2);
            return;
        }

        if self.f_rs() & 0x10 != 0 {
            let word = self.inst_word;
            self.elapsed = self.gte.execute(word);
        } else {
            match self.f_rs() {
                0x00 => {
                    // mfc2
                    let rd = self.f_rd();
                    let (val, cost) = self.gte.read(rd);
                    self.elapsed = cost;
                    if self.f_rt() != 0 {
                        self.set_ldelayed(self.f_rt(), val, false);
                    }
                }
                0x02 => {
                    // cfc2
                    let rd = self.f_rd() + 32;
                    let (val, cost) = self.gte.read(rd);
                    self.elapsed = cost;
                    if self.f_rt() != 0 {
                        self.set_ldelayed(self.f_rt(), val, false);
                    }
                }
                0x04 => {
                    // mtc2
                    self.set_cop2write(self.f_rd(), self.regs.gpr[self.f_rt()]);
                }
                0x06 => {
                    // ctc2
                    self.set_cop2write(self.f_rd() + 32, self.regs.gpr[self.f_rt()]);
                }
                rs => {
                    log::warn!("unknown COP2 instruction, RS field {:02X}", rs);
                    self.exception(bus, Exception::ReservedInstruction);
                }
            }
        }
    }

    fn op_lwl<B: CpuBusProvider>(&mut self, bus: &mut B) {
        // (shift, keep-mask) per alignment, little-endian then big-endian
        const OPS_LE: [(u32, u32); 4] = [
            (24, 0x00FF_FFFF),
            (16, 0x0000_FFFF),
            (8, 0x0000_00FF),
            (0, 0x0000_0000),
        ];
        const OPS_BE: [(u32, u32); 4] = [
            (0, 0x0000_0000),
            (8, 0x0000_00FF),
            (16, 0x0000_FFFF),
            (24, 0x00FF_FFFF),
        ];

        let addr = self.regs.gpr[self.f_rs()].wrapping_add(Self::sext16(self.f_imm16()));
        let Some(val) = self.mem_read(bus, addr & !3, true) else {
            return;
        };
        if self.f_rt() != 0 {
            let (shift, mask) = if self.cop0.is_le {
                OPS_LE[(addr & 3) as usize]
            } else {
                OPS_BE[(addr & 3) as usize]
            };
            let merged = (val << shift) | (self.lwlr_reg_val(self.f_rt()) & mask);
            self.set_ldelayed(self.f_rt(), merged, true);
        }
    }

    fn op_lwr<B: CpuBusProvider>(&mut self, bus: &mut B) {
        const OPS_LE: [(u32, u32); 4] = [
            (0, 0x0000_0000),
            (8, 0xFF00_0000),
            (16, 0xFFFF_0000),
            (24, 0xFFFF_FF00),
        ];
        const OPS_BE: [(u32, u32); 4] = [
            (24, 0xFFFF_FF00),
            (16, 0xFFFF_0000),
            (8, 0xFF00_0000),
            (0, 0x0000_0000),
        ];

        let addr = self.regs.gpr[self.f_rs()].wrapping_add(Self::sext16(self.f_imm16()));
        let Some(val) = self.mem_read(bus, addr & !3, true) else {
            return;
        };
        if self.f_rt() != 0 {
            let (shift, mask) = if self.cop0.is_le {
                OPS_LE[(addr & 3) as usize]
            } else {
                OPS_BE[(addr & 3) as usize]
            };
            let merged = (val >> shift) | (self.lwlr_reg_val(self.f_rt()) & mask);
            self.set_ldelayed(self.f_rt(), merged, true);
        }
    }

    fn op_swl<B: CpuBusProvider>(&mut self, bus: &mut B) {
        const OPS_LE: [(u32, u32); 4] = [
            (24, 0xFFFF_FF00),
            (16, 0xFFFF_0000),
            (8, 0xFF00_0000),
            (0, 0x0000_0000),
        ];
        const OPS_BE: [(u32, u32); 4] = [
            (0, 0x0000_0000),
            (8, 0xFF00_0000),
            (16, 0xFFFF_0000),
            (24, 0xFFFF_FF00),
        ];

        let addr = self.regs.gpr[self.f_rs()].wrapping_add(Self::sext16(self.f_imm16()));
        let Some(val) = self.mem_read(bus, addr & !3, true) else {
            return;
        };
        let (shift, mask) = if self.cop0.is_le {
            OPS_LE[(addr & 3) as usize]
        } else {
            OPS_BE[(addr & 3) as usize]
        };
        let merged = (self.regs.gpr[self.f_rt()] >> shift) | (val & mask);
        self.mem_write(bus, addr & !3, merged);
    }

    fn op_swr<B: CpuBusProvider>(&mut self, bus: &mut B) {
        const OPS_LE: [(u32, u32); 4] = [
            (0, 0x0000_0000),
            (8, 0x0000_00FF),
            (16, 0x0000_FFFF),
            (24, 0x00FF_FFFF),
        ];
        const OPS_BE: [(u32, u32); 4] = [
            (24, 0x00FF_FFFF),
            (16, 0x0000_FFFF),
            (8, 0x0000_00FF),
            (0, 0x0000_0000),
        ];

        let addr = self.regs.gpr[self.f_rs()].wrapping_add(Self::sext16(self.f_imm16()));
        let Some(val) = self.mem_read(bus, addr & !3, true) else {
            return;
        };
        let (shift, mask) = if self.cop0.is_le {
            OPS_LE[(addr & 3) as usize]
        } else {
            OPS_BE[(addr & 3) as usize]
        };
        let merged = (self.regs.gpr[self.f_rt()] << shift) | (val & mask);
        self.mem_write(bus, addr & !3, merged);
    }
}
