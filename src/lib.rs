//! A cycle-approximate PlayStation core.
//!
//! The crate models the time-synchronized hardware: the R3000A interpreter,
//! the physical bus, the interrupt aggregator, the 7-channel DMA, the GPU
//! command processor with its display timing, the three root counters, and
//! the event-horizon scheduler that keeps them in lockstep. Rasterization,
//! GTE math, CD internals and SPU synthesis are collaborator interfaces
//! ([`gpu::Renderer`], [`gte::Gte`], [`frontend::Frontend`]); the host
//! drives the machine stepwise through [`Psx::iter`] and [`Psx::trace`].

mod cdrom;
mod controller_mem_card;
pub mod cpu;
pub mod frontend;
pub mod gpu;
pub mod gte;
mod mdec;
pub mod memory;
mod spu;
mod timers;

use std::rc::Rc;

use frontend::Frontend;
use gpu::Renderer;
use gte::Gte;
use memory::{Bios, BusLine, BusOwner, CpuBus, Result};

pub use controller_mem_card::MEM_CARD_SIZE;
pub use frontend::{Buttons, ControllerState, HeadlessFrontend, Signals, TraceEvent};
pub use gpu::StatsRenderer;
pub use gte::NullGte;
pub use memory::BIOS_SIZE;

/// System clock frequency.
pub const CYCLES_PER_SEC: u32 = 33_868_800;

/// Baseline cycles per instruction.
pub const CYCLES_INST: u32 = 2;

#[derive(Debug)]
pub enum PsxError {
    CouldNotLoadBios,
    /// the BIOS image must be exactly 512 KiB
    InvalidBiosSize(usize),
    /// a memory card image must be exactly 128 KiB
    InvalidMemCardSize,
}

impl std::error::Error for PsxError {}
impl std::fmt::Display for PsxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PsxError::CouldNotLoadBios => write!(f, "Could not load BIOS"),
            PsxError::InvalidBiosSize(got) => {
                write!(f, "BIOS image must be {} bytes, got {}", BIOS_SIZE, got)
            }
            PsxError::InvalidMemCardSize => {
                write!(f, "memory card image must be {} bytes", MEM_CARD_SIZE)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PsxConfig {
    /// patch the BIOS so its TTY output driver loads
    pub patch_bios_tty: bool,
}

/// The machine. Owns the CPU and the bus (which owns everything else) and
/// runs the cooperative event-driven main loop.
pub struct Psx {
    cpu: cpu::Cpu,
    bus: CpuBus,
    frontend: Rc<dyn Frontend>,
    reset_pending: bool,
}

impl Psx {
    pub fn new(
        bios: Bios,
        config: PsxConfig,
        renderer: Box<dyn Renderer>,
        gte: Box<dyn Gte>,
        frontend: Rc<dyn Frontend>,
    ) -> Result<Self, PsxError> {
        Ok(Self {
            cpu: cpu::Cpu::new(gte),
            bus: CpuBus::new(bios, config, renderer),
            frontend,
            reset_pending: false,
        })
    }

    /// A machine with no host attached: stats-only renderer, null GTE,
    /// headless frontend. What the test suites run against.
    pub fn new_headless(bios: Bios) -> Result<Self, PsxError> {
        Self::new(
            bios,
            PsxConfig::default(),
            Box::new(StatsRenderer),
            Box::new(NullGte::default()),
            Rc::new(HeadlessFrontend),
        )
    }

    /// Request a soft reset; it is taken between iterations like the
    /// hardware reset line.
    pub fn reset(&mut self) {
        self.reset_pending = true;
    }

    fn do_reset(&mut self) {
        self.bus.reset();
        // the CPU restarts last so it fetches from a settled machine
        self.cpu.reset();
        self.reset_pending = false;
    }

    /// Run at least `cc` cycles (the final instruction may overshoot).
    /// Returns the cycles actually executed and the host's stop signal.
    ///
    /// Each round computes the event horizon, the minimum distance to the
    /// next observable event across every component, runs the current bus
    /// owner up to it, then lets every component catch up at once.
    pub fn iter(&mut self, cc: u32) -> (u32, bool) {
        let mut cc_remain = cc;
        let mut cc_total = 0u32;

        while cc_remain > 0 {
            let horizon = self.bus.next_event_horizon(cc_remain);
            self.bus.begin_slice(horizon);

            loop {
                match self.bus.bus_owner() {
                    BusOwner::Cpu => {
                        let used = self.cpu.next_inst(&mut self.bus);
                        self.bus.schedule.clock += used;
                    }
                    BusOwner::Dma => {
                        let used = self.bus.run_dma().max(1);
                        self.bus.schedule.clock += used;
                    }
                    BusOwner::CpuDma => {
                        let used = self.cpu.next_inst(&mut self.bus);
                        self.bus.schedule.clock += used;
                        self.bus.run_dma_cc(used);
                    }
                }
                if self.bus.schedule.clock >= self.bus.schedule.next_event_cc {
                    break;
                }
            }

            self.bus.end_iter_all(&*self.frontend);

            let ran = self.bus.schedule.clock;
            cc_total = cc_total.wrapping_add(ran);
            cc_remain = cc_remain.saturating_sub(ran);
        }

        let signals = self.frontend.check_signals();
        if signals.reset || self.reset_pending {
            self.do_reset();
        }

        (cc_total, signals.stop)
    }

    /// Run exactly one step of the current bus owner with tracing enabled,
    /// delivering every [`TraceEvent`] to the frontend. Returns the cycles
    /// the step took.
    pub fn trace(&mut self) -> u32 {
        self.bus.set_trace_mode(true);
        self.cpu.set_trace_mode(true);

        self.bus.begin_slice(1);
        match self.bus.bus_owner() {
            BusOwner::Cpu => {
                let used = self.cpu.next_inst(&mut self.bus);
                self.bus.schedule.clock += used;
            }
            BusOwner::Dma => {
                let used = self.bus.run_dma().max(1);
                self.bus.schedule.clock += used;
            }
            BusOwner::CpuDma => {
                let used = self.cpu.next_inst(&mut self.bus);
                self.bus.schedule.clock += used;
                self.bus.run_dma_cc(used);
            }
        }
        self.bus.end_iter_all(&*self.frontend);
        let ran = self.bus.schedule.clock;

        for event in self.cpu.take_trace() {
            self.frontend.trace_event(&event);
        }
        for event in self.bus.take_trace() {
            self.frontend.trace_event(&event);
        }

        self.cpu.set_trace_mode(false);
        self.bus.set_trace_mode(false);

        ran
    }

    pub fn cpu(&self) -> &cpu::Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut cpu::Cpu {
        &mut self.cpu
    }

    pub fn bus(&self) -> &CpuBus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut CpuBus {
        &mut self.bus
    }

    /// Copy a block into main RAM; `addr` is a physical RAM address. Meant
    /// for hosts that sideload executables.
    pub fn load_to_ram(&mut self, addr: u32, data: &[u8]) {
        self.bus.put_ram(data, addr);
    }

    pub fn plug_mem_card(&mut self, slot: usize, data: Option<Vec<u8>>) -> Result<(), PsxError> {
        self.bus.controller_mem_card_mut().plug_mem_card(slot, data)
    }

    pub fn take_mem_card(&mut self, slot: usize) -> Option<Vec<u8>> {
        self.bus.controller_mem_card_mut().take_mem_card(slot)
    }

    /// Decode the instruction at a (virtual) address, for debuggers.
    pub fn decode(&mut self, addr: u32) -> Option<cpu::Instruction> {
        let word = self.bus_read_u32(addr).ok()?;
        Some(cpu::Instruction::from_u32(word, addr))
    }

    /// Aligned word read through the full bus, for debuggers and tests.
    pub fn bus_read_u32(&mut self, addr: u32) -> Result<u32> {
        if addr % 4 != 0 {
            return Err("unaligned memory access".to_string());
        }
        self.bus.read_u32(addr & 0x1FFF_FFFF)
    }

    pub fn bus_write_u32(&mut self, addr: u32, data: u32) -> Result<()> {
        if addr % 4 != 0 {
            return Err("unaligned memory access".to_string());
        }
        self.bus.write_u32(addr & 0x1FFF_FFFF, data)
    }

    pub fn bus_read_u16(&mut self, addr: u32) -> Result<u16> {
        if addr % 2 != 0 {
            return Err("unaligned memory access".to_string());
        }
        self.bus.read_u16(addr & 0x1FFF_FFFF, true)
    }

    pub fn bus_read_u8(&mut self, addr: u32) -> Result<u8> {
        self.bus.read_u8(addr & 0x1FFF_FFFF, true)
    }
}
