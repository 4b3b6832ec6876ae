pub(crate) mod dma;
pub(crate) mod interrupts;
mod memory_control;
mod ram;

use std::fs::File;
use std::io::Read;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::cdrom::Cdrom;
use crate::controller_mem_card::ControllerAndMemCard;
use crate::frontend::{Frontend, TraceEvent};
use crate::gpu::{Gpu, Renderer};
use crate::mdec::Mdec;
use crate::spu::Spu;
use crate::timers::Timers;
use crate::{PsxConfig, PsxError};

use dma::Dma;
use interrupts::Interrupts;
use memory_control::{ExpansionRegion1, ExpansionRegion2, MemoryControl1, RamSize};
use ram::{MainRam, Scratchpad};

pub type Result<T, E = String> = std::result::Result<T, E>;

pub const BIOS_SIZE: usize = 512 * 1024;

/// Who owns the bus for the next step of the inner scheduler loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BusOwner {
    Cpu,
    Dma,
    /// the CPU runs and the DMA is charged the same cycles
    CpuDma,
}

/// The per-slice clock shared by every component.
///
/// `clock` counts CPU cycles executed since the slice began; `next_event_cc`
/// is the slice horizon. MMIO handlers shrink the horizon when a register
/// write moves a component's next event closer than the scheduler knew.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventSchedule {
    pub clock: u32,
    pub next_event_cc: u32,
}

impl EventSchedule {
    /// An event will happen `cc_from_now` cycles from the current clock.
    #[inline]
    pub fn shrink(&mut self, cc_from_now: u32) {
        let at = self.clock.saturating_add(cc_from_now);
        if at < self.next_event_cc {
            self.next_event_cc = at;
        }
    }
}

/// Word-addressed access to the physical bus. Byte and halfword operations
/// carry the CPU's current endianness so 16-bit-wide devices can pick the
/// right lane; byte writes also carry the full halfword (`data16`) because
/// the SPU bus transfers 16 bits regardless of the access size.
pub trait BusLine {
    fn read_u32(&mut self, addr: u32) -> Result<u32>;
    fn write_u32(&mut self, addr: u32, data: u32) -> Result<()>;
    fn read_u16(&mut self, addr: u32, is_le: bool) -> Result<u16>;
    fn write_u16(&mut self, addr: u32, data: u16, is_le: bool) -> Result<()>;
    fn read_u8(&mut self, addr: u32, is_le: bool) -> Result<u8>;
    fn write_u8(&mut self, addr: u32, data: u8, data16: u16, is_le: bool) -> Result<()>;
}

/// What the CPU needs from the bus besides plain access.
pub trait CpuBusProvider: BusLine {
    fn pending_interrupts(&self) -> bool;
}

pub struct Bios {
    data: Vec<u8>,
}

impl Bios {
    pub fn from_file<P: AsRef<Path>>(bios_file_path: P) -> Result<Self, PsxError> {
        let mut data = Vec::new();
        let mut file =
            File::open(bios_file_path).map_err(|_| PsxError::CouldNotLoadBios)?;
        file.read_to_end(&mut data)
            .map_err(|_| PsxError::CouldNotLoadBios)?;
        Self::from_bytes(data)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self, PsxError> {
        if data.len() != BIOS_SIZE {
            return Err(PsxError::InvalidBiosSize(data.len()));
        }
        Ok(Self { data })
    }

    fn write_u32(&mut self, addr: u32, data: u32) {
        let index = (addr as usize) & 0x7FFFC;
        LittleEndian::write_u32(&mut self.data[index..index + 4], data)
    }

    /// The stock BIOS hard-disables its TTY driver; flip the two stores so
    /// the driver loads and `std_out_putchar` produces output.
    pub(crate) fn apply_tty_patch(&mut self) {
        if self.read_u32(0x6F0C) == 0x3C01_A001 && self.read_u32(0x6F14) == 0xAC20_B9B0 {
            self.write_u32(0x6F0C, 0x3401_0001);
            self.write_u32(0x6F14, 0xAF81_A9C0);
        }
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        let index = (addr as usize) & 0x7FFFC;
        LittleEndian::read_u32(&self.data[index..index + 4])
    }

    pub fn read_u16(&self, addr: u32) -> u16 {
        let index = (addr as usize) & 0x7FFFE;
        LittleEndian::read_u16(&self.data[index..index + 2])
    }

    pub fn read_u8(&self, addr: u32) -> u8 {
        self.data[(addr as usize) & 0x7FFFF]
    }
}

/// The devices a DMA channel can reach, split from the rest of the bus so
/// the controller can hold `&mut` to all of them at once.
pub(crate) struct DmaBus {
    pub main_ram: MainRam,
    pub gpu: Gpu,
    pub cdrom: Cdrom,
    pub spu: Spu,
    pub mdec: Mdec,
}

/// The physical memory map. Owns every device; MMIO handlers catch the
/// target component up to the current slice clock before the access is
/// served, so reads always observe values consistent with "now".
pub struct CpuBus {
    pub(crate) schedule: EventSchedule,

    bios: Bios,
    mem_ctrl: MemoryControl1,
    ram_size: RamSize,

    expansion_region_1: ExpansionRegion1,
    expansion_region_2: ExpansionRegion2,

    interrupts: Interrupts,
    joy: ControllerAndMemCard,
    timers: Timers,

    dma: Dma,
    dma_bus: DmaBus,

    scratchpad: Scratchpad,
}

impl CpuBus {
    pub(crate) fn new(bios: Bios, config: PsxConfig, renderer: Box<dyn Renderer>) -> Self {
        let mut bios = bios;
        if config.patch_bios_tty {
            bios.apply_tty_patch();
        }
        Self {
            schedule: EventSchedule::default(),
            bios,
            mem_ctrl: MemoryControl1::default(),
            ram_size: RamSize::default(),
            expansion_region_1: ExpansionRegion1::default(),
            expansion_region_2: ExpansionRegion2::default(),
            interrupts: Interrupts::default(),
            joy: ControllerAndMemCard::default(),
            timers: Timers::default(),
            dma: Dma::default(),
            dma_bus: DmaBus {
                main_ram: MainRam::default(),
                gpu: Gpu::new(renderer),
                cdrom: Cdrom::default(),
                spu: Spu::default(),
                mdec: Mdec::default(),
            },
            scratchpad: Scratchpad::default(),
        }
    }

    /// Soft reset: the same components the hardware reset line touches.
    /// RAM, timers and the interrupt latches keep their content.
    pub(crate) fn reset(&mut self) {
        self.dma_bus.cdrom.reset();
        self.dma_bus.gpu.reset();
        self.dma_bus.mdec.reset();
        self.dma_bus.spu.reset();
        self.dma.reset();
        self.schedule = EventSchedule::default();
    }

    pub fn gpu(&self) -> &Gpu {
        &self.dma_bus.gpu
    }

    pub fn gpu_mut(&mut self) -> &mut Gpu {
        &mut self.dma_bus.gpu
    }

    pub fn controller_mem_card_mut(&mut self) -> &mut ControllerAndMemCard {
        &mut self.joy
    }

    pub(crate) fn put_ram(&mut self, data: &[u8], addr: u32) {
        self.dma_bus.main_ram.put_at_address(data, addr);
    }

    // ----- scheduler plumbing -----

    /// Minimum cycles until any component's next observable event, capped
    /// by `remaining`.
    pub(crate) fn next_event_horizon(&self, remaining: u32) -> u32 {
        let mut next = remaining;
        if let Some(cc) = self.dma.next_event_cc() {
            next = next.min(cc);
        }
        next = next.min(self.dma_bus.mdec.next_event_cc());
        if let Some(cc) = self.dma_bus.gpu.next_event_cc() {
            next = next.min(cc);
        }
        next = next.min(self.dma_bus.cdrom.next_event_cc());
        next = next.min(self.dma_bus.spu.next_event_cc());
        next = next.min(self.joy.next_event_cc());
        next = next.min(self.timers.next_event_cc());
        next.max(1)
    }

    pub(crate) fn begin_slice(&mut self, horizon: u32) {
        self.schedule.clock = 0;
        self.schedule.next_event_cc = horizon;
    }

    pub(crate) fn bus_owner(&self) -> BusOwner {
        self.dma.bus_owner()
    }

    fn drain_gpu_activation(&mut self) {
        if self.dma_bus.gpu.take_dma_activation() {
            self.dma.activate_channel(2);
        }
    }

    pub(crate) fn run_dma(&mut self) -> u32 {
        let cc = self.dma.run(
            &mut self.dma_bus,
            &mut self.schedule,
            &mut self.interrupts,
            &mut self.timers,
        );
        self.drain_gpu_activation();
        cc
    }

    pub(crate) fn run_dma_cc(&mut self, cc: u32) {
        self.dma.run_cc(
            cc,
            &mut self.dma_bus,
            &mut self.schedule,
            &mut self.interrupts,
            &mut self.timers,
        );
        self.drain_gpu_activation();
    }

    /// Pull every component forward to the slice clock, firing due events.
    pub(crate) fn end_iter_all(&mut self, frontend: &dyn Frontend) {
        self.dma.end_iter(&mut self.schedule);
        self.dma_bus.mdec.end_iter(&mut self.schedule);
        self.dma_bus
            .gpu
            .end_iter(&mut self.schedule, &mut self.interrupts, &mut self.timers);
        self.drain_gpu_activation();
        self.dma_bus
            .cdrom
            .end_iter(&mut self.schedule, &mut self.interrupts);
        self.dma_bus.spu.end_iter(&mut self.schedule, frontend);
        self.joy
            .end_iter(&mut self.schedule, &mut self.interrupts, frontend);
        self.timers.end_iter(&mut self.schedule, &mut self.interrupts);
    }

    pub(crate) fn set_trace_mode(&mut self, enable: bool) {
        self.interrupts.set_trace_mode(enable);
        self.dma.set_trace_mode(enable);
        self.dma_bus.gpu.set_trace_mode(enable);
    }

    pub(crate) fn take_trace(&mut self) -> Vec<TraceEvent> {
        let mut events = self.interrupts.take_trace();
        events.extend(self.dma.take_trace());
        events.extend(self.dma_bus.gpu.take_trace());
        events
    }

    fn timers_access_end(&mut self, mode_touched: bool) {
        if mode_touched {
            let want = self.timers.hblank_signal_wanted();
            self.dma_bus.gpu.signal_hblank(
                want,
                &mut self.schedule,
                &mut self.interrupts,
                &mut self.timers,
            );
        }
    }
}

impl BusLine for CpuBus {
    fn read_u32(&mut self, addr: u32) -> Result<u32> {
        debug_assert!(addr % 4 == 0, "unaligned u32 read");
        match addr {
            0x0000_0000..=0x007F_FFFF => Ok(self.dma_bus.main_ram.read_u32(addr)),
            0x1F80_0000..=0x1F80_03FF => Ok(self.scratchpad.read_u32(addr)),
            0x1F80_1000..=0x1F80_1023 => Ok(self.mem_ctrl.read(addr)),
            0x1F80_1040 => Ok(self.joy.rx_data()),
            0x1F80_1044 => Ok(self.joy.stat()),
            0x1F80_1050..=0x1F80_105F => {
                log::warn!("SIO read {:08X}, nothing attached", addr);
                Ok(0)
            }
            0x1F80_1060 => Ok(self.ram_size.read()),
            0x1F80_1070 => Ok(self.interrupts.read_stat()),
            0x1F80_1074 => Ok(self.interrupts.read_mask()),
            0x1F80_1080..=0x1F80_10FF => Ok(self.dma.read(addr & 0xFF)),
            0x1F80_1100..=0x1F80_112F => Ok(self
                .timers
                .read(addr & 0x3F, &mut self.schedule, &mut self.interrupts)),
            0x1F80_1810 => {
                let v = self.dma_bus.gpu.gpu_read(
                    &mut self.schedule,
                    &mut self.interrupts,
                    &mut self.timers,
                );
                self.drain_gpu_activation();
                Ok(v)
            }
            0x1F80_1814 => {
                let v = self.dma_bus.gpu.stat(
                    &mut self.schedule,
                    &mut self.interrupts,
                    &mut self.timers,
                );
                self.drain_gpu_activation();
                Ok(v)
            }
            0x1F80_1820 => Ok(self.dma_bus.mdec.data_read()),
            0x1F80_1824 => Ok(self.dma_bus.mdec.status()),
            0x1F80_1C00..=0x1F80_1FFF => {
                let lo = self.dma_bus.spu.read_u16(addr) as u32;
                let hi = self.dma_bus.spu.read_u16(addr + 2) as u32;
                Ok(lo | (hi << 16))
            }
            0x1FC0_0000..=0x1FC7_FFFF => Ok(self.bios.read_u32(addr)),
            _ => Err(format!("u32 read from unmapped {:08X}", addr)),
        }
    }

    fn write_u32(&mut self, addr: u32, data: u32) -> Result<()> {
        debug_assert!(addr % 4 == 0, "unaligned u32 write");
        match addr {
            0x0000_0000..=0x007F_FFFF => {
                self.dma_bus.main_ram.write_u32(addr, data);
                Ok(())
            }
            0x1F80_0000..=0x1F80_03FF => {
                self.scratchpad.write_u32(addr, data);
                Ok(())
            }
            0x1F80_1000..=0x1F80_1023 => {
                self.mem_ctrl.write(addr, data);
                Ok(())
            }
            0x1F80_1040 => {
                self.joy.tx_data(data, &mut self.schedule);
                Ok(())
            }
            0x1F80_1050..=0x1F80_105F => {
                log::warn!("SIO write {:08X} = {:08X}, nothing attached", addr, data);
                Ok(())
            }
            0x1F80_1060 => {
                self.ram_size.write(data);
                Ok(())
            }
            0x1F80_1070 => {
                self.interrupts.ack(data);
                Ok(())
            }
            0x1F80_1074 => {
                self.interrupts.write_mask(data);
                Ok(())
            }
            0x1F80_1080..=0x1F80_10FF => {
                self.dma.write(addr & 0xFF, data, &mut self.interrupts);
                Ok(())
            }
            0x1F80_1100..=0x1F80_112F => {
                self.timers
                    .write(addr & 0x3F, data, &mut self.schedule, &mut self.interrupts);
                self.timers_access_end(addr & 0xF == 4);
                Ok(())
            }
            0x1F80_1810 => {
                self.dma_bus.gpu.gp0(
                    data,
                    &mut self.schedule,
                    &mut self.interrupts,
                    &mut self.timers,
                );
                self.drain_gpu_activation();
                Ok(())
            }
            0x1F80_1814 => {
                self.dma_bus.gpu.gp1(
                    data,
                    &mut self.schedule,
                    &mut self.interrupts,
                    &mut self.timers,
                );
                self.drain_gpu_activation();
                Ok(())
            }
            0x1F80_1820 => {
                self.dma_bus.mdec.data_write(data);
                Ok(())
            }
            0x1F80_1824 => {
                self.dma_bus.mdec.control(data);
                Ok(())
            }
            0x1F80_1C00..=0x1F80_1FFF => {
                self.dma_bus
                    .spu
                    .write_u16(addr, data as u16, &mut self.interrupts);
                self.dma_bus
                    .spu
                    .write_u16(addr + 2, (data >> 16) as u16, &mut self.interrupts);
                Ok(())
            }
            _ => Err(format!("u32 write to unmapped {:08X}", addr)),
        }
    }

    fn read_u16(&mut self, addr: u32, is_le: bool) -> Result<u16> {
        debug_assert!(addr % 2 == 0, "unaligned u16 read");
        // a reversed-endianness CPU swaps halfword lanes on the bus
        let addr = if is_le { addr } else { addr ^ 2 };
        match addr {
            0x0000_0000..=0x007F_FFFF => Ok(self.dma_bus.main_ram.read_u16(addr)),
            0x1F80_0000..=0x1F80_03FF => Ok(self.scratchpad.read_u16(addr)),
            0x1F80_1044 => Ok(self.joy.stat() as u16),
            0x1F80_1048 => Ok(self.joy.mode_read()),
            0x1F80_104A => Ok(self.joy.ctrl_read()),
            0x1F80_104E => Ok(self.joy.baud_read()),
            0x1F80_1070 => Ok(self.interrupts.read_stat() as u16),
            0x1F80_1072 | 0x1F80_1076 => Ok(0),
            0x1F80_1074 => Ok(self.interrupts.read_mask() as u16),
            0x1F80_1100..=0x1F80_112F => {
                if addr & 0x2 == 0 {
                    Ok(self
                        .timers
                        .read(addr & 0x3F, &mut self.schedule, &mut self.interrupts)
                        as u16)
                } else {
                    Ok(0)
                }
            }
            0x1F80_1C00..=0x1F80_1FFF => Ok(self.dma_bus.spu.read_u16(addr)),
            0x1FC0_0000..=0x1FC7_FFFF => Ok(self.bios.read_u16(addr)),
            _ => Err(format!("u16 read from unmapped {:08X}", addr)),
        }
    }

    fn write_u16(&mut self, addr: u32, data: u16, is_le: bool) -> Result<()> {
        debug_assert!(addr % 2 == 0, "unaligned u16 write");
        let addr = if is_le { addr } else { addr ^ 2 };
        match addr {
            0x0000_0000..=0x007F_FFFF => {
                self.dma_bus.main_ram.write_u16(addr, data);
                Ok(())
            }
            0x1F80_0000..=0x1F80_03FF => {
                self.scratchpad.write_u16(addr, data);
                Ok(())
            }
            0x1F80_1048 => {
                self.joy.mode_write(data);
                Ok(())
            }
            0x1F80_104A => {
                self.joy.ctrl_write(data, &mut self.interrupts);
                Ok(())
            }
            0x1F80_104E => {
                self.joy.baud_write(data);
                Ok(())
            }
            0x1F80_1070 => {
                self.interrupts.ack(data as u32 | 0xFFFF_0000);
                Ok(())
            }
            0x1F80_1072 | 0x1F80_1076 => Ok(()),
            0x1F80_1074 => {
                self.interrupts.write_mask(data as u32);
                Ok(())
            }
            0x1F80_1100..=0x1F80_112F => {
                if addr & 0x2 == 0 {
                    self.timers.write(
                        addr & 0x3F,
                        data as u32,
                        &mut self.schedule,
                        &mut self.interrupts,
                    );
                    self.timers_access_end(addr & 0xF == 4);
                } else {
                    log::warn!("timer garbage write {:08X} = {:04X}", addr, data);
                }
                Ok(())
            }
            0x1F80_1C00..=0x1F80_1FFF => {
                self.dma_bus.spu.write_u16(addr, data, &mut self.interrupts);
                Ok(())
            }
            _ => Err(format!("u16 write to unmapped {:08X}", addr)),
        }
    }

    fn read_u8(&mut self, addr: u32, is_le: bool) -> Result<u8> {
        let addr = if is_le { addr } else { addr ^ 3 };
        match addr {
            0x0000_0000..=0x007F_FFFF => Ok(self.dma_bus.main_ram.read_u8(addr)),
            0x1F00_0000..=0x1F07_FFFF => Ok(self.expansion_region_1.read_u8(addr & 0xF_FFFF)),
            0x1F80_0000..=0x1F80_03FF => Ok(self.scratchpad.read_u8(addr)),
            0x1F80_1040 => Ok(self.joy.rx_data() as u8),
            0x1F80_1080..=0x1F80_10FF => {
                let word = self.dma.read(addr & 0xFC);
                Ok((word >> ((addr & 3) * 8)) as u8)
            }
            0x1F80_1800 => Ok(self.dma_bus.cdrom.status()),
            0x1F80_1801 => Ok(self.dma_bus.cdrom.port1_read()),
            0x1F80_1802 => Ok(self.dma_bus.cdrom.port2_read()),
            0x1F80_1803 => Ok(self.dma_bus.cdrom.port3_read()),
            0x1F80_1C00..=0x1F80_1FFF => {
                // the SPU bus is 16 bits wide; pick the byte lane
                let half = self.dma_bus.spu.read_u16(addr & !1);
                Ok(if addr & 1 == 0 {
                    half as u8
                } else {
                    (half >> 8) as u8
                })
            }
            0x1F80_2000..=0x1F80_20FF => Ok(self.expansion_region_2.read_u8(addr & 0xFF)),
            0x1FC0_0000..=0x1FC7_FFFF => Ok(self.bios.read_u8(addr)),
            _ => Err(format!("u8 read from unmapped {:08X}", addr)),
        }
    }

    fn write_u8(&mut self, addr: u32, data: u8, data16: u16, is_le: bool) -> Result<()> {
        let addr = if is_le { addr } else { addr ^ 3 };
        match addr {
            0x0000_0000..=0x007F_FFFF => {
                self.dma_bus.main_ram.write_u8(addr, data);
                Ok(())
            }
            0x1F00_0000..=0x1F07_FFFF => {
                self.expansion_region_1.write_u8(addr & 0xF_FFFF, data);
                Ok(())
            }
            0x1F80_0000..=0x1F80_03FF => {
                self.scratchpad.write_u8(addr, data);
                Ok(())
            }
            0x1F80_1040 => {
                self.joy.tx_data(data as u32, &mut self.schedule);
                Ok(())
            }
            0x1F80_1800 => {
                self.dma_bus.cdrom.set_index(data);
                Ok(())
            }
            0x1F80_1801 => {
                self.dma_bus.cdrom.port1_write(data, &mut self.schedule);
                Ok(())
            }
            0x1F80_1802 => {
                self.dma_bus.cdrom.port2_write(data, &mut self.interrupts);
                Ok(())
            }
            0x1F80_1803 => {
                self.dma_bus.cdrom.port3_write(data, &mut self.interrupts);
                Ok(())
            }
            0x1F80_1C00..=0x1F80_1FFF => {
                // the device sees the full halfword even on byte writes
                self.dma_bus
                    .spu
                    .write_u16(addr & !1, data16, &mut self.interrupts);
                Ok(())
            }
            0x1F80_2000..=0x1F80_20FF => {
                self.expansion_region_2.write_u8(addr & 0xFF, data);
                Ok(())
            }
            _ => Err(format!("u8 write to unmapped {:08X}", addr)),
        }
    }
}

impl CpuBusProvider for CpuBus {
    fn pending_interrupts(&self) -> bool {
        self.interrupts.pending()
    }
}
