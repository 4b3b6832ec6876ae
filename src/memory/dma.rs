use crate::frontend::TraceEvent;
use crate::timers::Timers;

use super::interrupts::{Interrupt, Interrupts};
use super::{BusOwner, DmaBus, EventSchedule};

/// Words moved per inner-loop quantum while the CPU is frozen. Small enough
/// that pending events stay close to their due time.
const BURST_CHUNK: u32 = 16;
const OTC_CHUNK: u32 = 128;

/// Approximate cost of one word on the CD-ROM port (the middle of the
/// 24..40 clk/word range NOCASH documents).
const CDROM_CC_PER_WORD: u32 = 24;

bitflags::bitflags! {
    #[derive(Default, Debug, Clone, Copy)]
    struct ChannelControl: u32 {
        const DIRECTION_FROM_RAM       = 0b00000000000000000000000000000001;
        const ADDRESS_STEP_DIRECTION   = 0b00000000000000000000000000000010;
        const CHOPPING_ENABLED         = 0b00000000000000000000000100000000;
        const SYNC_MODE                = 0b00000000000000000000011000000000;
        const CHOPPING_DMA_WINDOW_SIZE = 0b00000000000001110000000000000000;
        const CHOPPING_CPU_WINDOW_SIZE = 0b00000000011100000000000000000000;
        const START_BUSY               = 0b00000001000000000000000000000000;
        const START_TRIGGER            = 0b00010000000000000000000000000000;
        const UNKNOWN1                 = 0b00100000000000000000000000000000;
        const UNKNOWN2                 = 0b01000000000000000000000000000000;
        // const NOT_USED              = 0b10001110100010001111100011111100;
    }
}

impl ChannelControl {
    fn address_step(&self) -> i32 {
        if self.intersects(Self::ADDRESS_STEP_DIRECTION) {
            -4
        } else {
            4
        }
    }

    fn sync_mode(&self) -> u32 {
        (self.bits() & Self::SYNC_MODE.bits()) >> 9
    }

    fn from_ram(&self) -> bool {
        self.intersects(Self::DIRECTION_FROM_RAM)
    }

    fn in_progress(&self) -> bool {
        self.intersects(Self::START_BUSY)
    }

    fn finish_transfer(&mut self) {
        self.remove(Self::START_BUSY);
        self.remove(Self::START_TRIGGER);
    }

    /// In word units
    fn chopping_dma_window_size(&self) -> u32 {
        1 << ((self.bits() & Self::CHOPPING_DMA_WINDOW_SIZE.bits()) >> 16)
    }

    /// In cycle units
    fn chopping_cpu_window_size(&self) -> u32 {
        1 << ((self.bits() & Self::CHOPPING_CPU_WINDOW_SIZE.bits()) >> 20)
    }
}

bitflags::bitflags! {
    #[derive(Default, Debug, Clone, Copy)]
    struct DmaInterruptRegister: u32 {
        const UNKNOWN                = 0b00000000000000000000000000111111;
        const FORCE_IRQ              = 0b00000000000000001000000000000000;
        const IRQ_ENABLE             = 0b00000000011111110000000000000000;
        const IRQ_MASTER_ENABLE      = 0b00000000100000000000000000000000;
        const IRQ_FLAGS              = 0b01111111000000000000000000000000;
        const IRQ_MASTER_FLAG        = 0b10000000000000000000000000000000;
        // const NOT_USED            = 0b00000000000000000111111111000000;
    }
}

impl DmaInterruptRegister {
    #[inline]
    fn master_flag(&self) -> bool {
        self.intersects(Self::IRQ_MASTER_FLAG)
    }

    #[inline]
    fn request_interrupt(&mut self, channel: u32) {
        assert!(channel < 7);

        // the flag only latches when the per-channel enable is on
        if (self.bits() >> 16) & (1 << channel) != 0 {
            log::info!("DMA: channel {} raising its DICR flag", channel);
            *self |= Self::from_bits_retain(1 << (channel + 24));
        }
    }

    #[inline]
    fn compute_irq_master_flag(&self) -> bool {
        self.intersects(DmaInterruptRegister::FORCE_IRQ)
            || (self.intersects(DmaInterruptRegister::IRQ_MASTER_ENABLE)
                && (((self.bits() & DmaInterruptRegister::IRQ_ENABLE.bits()) >> 16)
                    & ((self.bits() & DmaInterruptRegister::IRQ_FLAGS.bits()) >> 24)
                    != 0))
    }
}

/// Resumable progress of a running channel.
#[derive(Debug, Clone, Copy)]
enum TransferState {
    /// Sync mode 0: back-to-back words, the CPU is frozen. With chopping the
    /// burst is sliced and `chop_cpu_left` counts the CPU window.
    Burst {
        remaining: u32,
        addr: u32,
        chop_cpu_left: u32,
    },
    /// Sync mode 1: one block per activation, re-synced with the device
    /// between blocks. Interleaved with the CPU.
    Blocks { addr: u32 },
    /// Sync mode 2: GPU linked list. Interleaved with the CPU.
    LinkedList { addr: u32 },
    /// Channel 6: build the GPU ordering table, backwards.
    Otc { remaining: u32, addr: u32 },
}

#[derive(Default)]
struct DmaChannel {
    base_address: u32,
    block_control: u32,
    channel_control: ChannelControl,

    state: Option<TransferState>,
    /// denied a device sync; waiting for `activate_channel`
    parked: bool,
    /// cycles of progress owed while interleaved with the CPU
    budget: u32,
}

impl DmaChannel {
    fn read(&self, addr: u32) -> u32 {
        match addr {
            0x0 => self.base_address,
            0x4 => self.block_control,
            0x8 | 0xC => self.channel_control.bits(),
            _ => unreachable!(),
        }
    }

    fn block_size(&self) -> u32 {
        let s = self.block_control & 0xFFFF;
        if s == 0 {
            0x10000
        } else {
            s
        }
    }

    fn block_count(&self) -> u32 {
        self.block_control >> 16
    }
}

/// The seven-channel DMA controller.
///
/// Channels are started by CHCR writes and progress either on their own
/// (burst modes, the CPU frozen) or by stealing the cycles the CPU just
/// consumed (block/linked-list modes and chopping windows). A channel whose
/// device denies a sync parks until the device re-activates it.
pub struct Dma {
    control: u32,
    interrupt: DmaInterruptRegister,

    channels: [DmaChannel; 7],

    trace: bool,
    trace_buf: Vec<TraceEvent>,
}

impl Default for Dma {
    fn default() -> Self {
        Self {
            control: 0x07654321,
            interrupt: Default::default(),
            channels: Default::default(),
            trace: false,
            trace_buf: Vec::new(),
        }
    }
}

impl Dma {
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    fn channel_enabled(&self, i: usize) -> bool {
        (self.control >> (i * 4)) & 0b1000 != 0
    }

    /// Highest-priority enabled channel with work to do. Priority value 0 is
    /// the strongest; ties go to the higher channel number.
    fn runnable(&self) -> Option<usize> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(i, ch)| self.channel_enabled(*i) && ch.state.is_some() && !ch.parked)
            .min_by_key(|(i, _)| ((self.control >> (i * 4)) & 0b111) as i32 * 100 - *i as i32)
            .map(|(i, _)| i)
    }

    /// Who should the scheduler hand the bus to right now.
    pub(crate) fn bus_owner(&self) -> BusOwner {
        match self.runnable() {
            None => BusOwner::Cpu,
            Some(i) => match self.channels[i].state.unwrap() {
                TransferState::Burst { chop_cpu_left, .. } => {
                    if chop_cpu_left > 0 {
                        BusOwner::CpuDma
                    } else {
                        BusOwner::Dma
                    }
                }
                TransferState::Otc { .. } => BusOwner::Dma,
                TransferState::Blocks { .. } | TransferState::LinkedList { .. } => BusOwner::CpuDma,
            },
        }
    }

    /// A device that previously denied a sync is ready again.
    pub(crate) fn activate_channel(&mut self, i: usize) {
        self.channels[i].parked = false;
    }

    pub(crate) fn set_trace_mode(&mut self, enable: bool) {
        self.trace = enable;
    }

    pub(crate) fn take_trace(&mut self) -> Vec<TraceEvent> {
        std::mem::take(&mut self.trace_buf)
    }

    fn trace_transfer(&mut self, channel: usize, to_ram: bool, addr: u32) {
        if self.trace {
            self.trace_buf
                .push(TraceEvent::DmaTransfer { channel, to_ram, addr });
        }
    }

    fn try_start(&mut self, i: usize) {
        let ch = &mut self.channels[i];
        if ch.state.is_some() || !ch.channel_control.in_progress() {
            return;
        }
        let mode = ch.channel_control.sync_mode();
        if mode == 0 && !ch.channel_control.intersects(ChannelControl::START_TRIGGER) {
            return;
        }

        let addr = ch.base_address & 0x1F_FFFC;
        let state = if i == 6 {
            TransferState::Otc {
                remaining: ch.block_size(),
                addr,
            }
        } else {
            match mode {
                0 => TransferState::Burst {
                    remaining: ch.block_size(),
                    addr,
                    chop_cpu_left: 0,
                },
                1 => TransferState::Blocks { addr },
                2 => {
                    if i != 2 {
                        log::warn!("DMA: linked-list mode on non-GPU channel {}", i);
                    }
                    TransferState::LinkedList { addr }
                }
                _ => {
                    log::warn!("DMA{}: reserved sync mode 3, ignoring start", i);
                    return;
                }
            }
        };
        ch.state = Some(state);
        ch.parked = false;
        ch.budget = 0;
        log::info!(
            "DMA{}: start, mode {}, madr {:06X}, bcr {:08X}",
            i,
            mode,
            ch.base_address,
            ch.block_control
        );
    }

    fn device_sync(
        &mut self,
        i: usize,
        nwords: u32,
        from_ram: bool,
        dma_bus: &mut DmaBus,
    ) -> bool {
        match i {
            0 => dma_bus.mdec.dma_in_sync(nwords),
            1 => dma_bus.mdec.dma_out_sync(nwords),
            2 => dma_bus.gpu.dma_sync(nwords),
            3 => dma_bus.cdrom.dma_sync(nwords),
            4 => dma_bus.spu.dma_sync(nwords, from_ram),
            _ => true,
        }
    }

    fn device_write(
        &mut self,
        i: usize,
        data: u32,
        dma_bus: &mut DmaBus,
        sched: &mut EventSchedule,
        int: &mut Interrupts,
        timers: &mut Timers,
    ) {
        match i {
            0 => dma_bus.mdec.dma_in_write(data),
            2 => dma_bus.gpu.dma_write(data, sched, int, timers),
            4 => dma_bus.spu.dma_write(data, int),
            _ => log::warn!("DMA{}: write to a read-only device port", i),
        }
    }

    fn device_read(
        &mut self,
        i: usize,
        dma_bus: &mut DmaBus,
        sched: &mut EventSchedule,
        int: &mut Interrupts,
        timers: &mut Timers,
    ) -> u32 {
        match i {
            1 => dma_bus.mdec.dma_out_read(),
            2 => dma_bus.gpu.dma_read(sched, int, timers),
            3 => dma_bus.cdrom.dma_read(),
            4 => dma_bus.spu.dma_read(int),
            _ => {
                log::warn!("DMA{}: read from a write-only device port", i);
                0xFFFF_FFFF
            }
        }
    }

    fn finish_channel(&mut self, i: usize, int: &mut Interrupts) {
        self.channels[i].state = None;
        self.channels[i].parked = false;
        self.channels[i].channel_control.finish_transfer();
        self.interrupt.request_interrupt(i as u32);
        self.update_master_flag(int);
        log::info!("DMA{}: finished", i);
    }

    fn update_master_flag(&mut self, int: &mut Interrupts) {
        let new_master_flag = self.interrupt.compute_irq_master_flag();
        if new_master_flag != self.interrupt.master_flag() {
            int.interruption(Interrupt::DMA, new_master_flag);
        }
        self.interrupt
            .set(DmaInterruptRegister::IRQ_MASTER_FLAG, new_master_flag);
    }

    /// One quantum of a bus-owning transfer (burst/OTC). Returns the cycles
    /// consumed. Owner must be `BusOwner::Dma`.
    pub(crate) fn run(
        &mut self,
        dma_bus: &mut DmaBus,
        sched: &mut EventSchedule,
        int: &mut Interrupts,
        timers: &mut Timers,
    ) -> u32 {
        let Some(i) = self.runnable() else { return 0 };

        match self.channels[i].state.unwrap() {
            TransferState::Otc { remaining, addr } => {
                let words = remaining.min(OTC_CHUNK);
                let mut current = addr;
                for n in 0..words {
                    let last = remaining - n == 1;
                    let value = if last {
                        0xFF_FFFF
                    } else {
                        current.wrapping_sub(4) & 0x1F_FFFC
                    };
                    dma_bus.main_ram.write_u32(current, value);
                    current = current.wrapping_sub(4) & 0x1F_FFFC;
                }
                self.trace_transfer(i, true, addr);
                let remaining = remaining - words;
                if remaining == 0 {
                    self.finish_channel(i, int);
                } else {
                    self.channels[i].state = Some(TransferState::Otc {
                        remaining,
                        addr: current,
                    });
                }
                words
            }
            TransferState::Burst {
                remaining,
                addr,
                chop_cpu_left: _,
            } => {
                let chopping = self.channels[i]
                    .channel_control
                    .intersects(ChannelControl::CHOPPING_ENABLED);
                let from_ram = self.channels[i].channel_control.from_ram();
                let step = self.channels[i].channel_control.address_step();

                if !self.device_sync(i, remaining, from_ram, dma_bus) {
                    self.channels[i].parked = true;
                    return 0;
                }

                let quantum = if chopping {
                    self.channels[i].channel_control.chopping_dma_window_size()
                } else {
                    BURST_CHUNK
                };
                let words = remaining.min(quantum);

                let mut a = addr;
                for _ in 0..words {
                    if from_ram {
                        let data = dma_bus.main_ram.read_u32(a);
                        self.device_write(i, data, dma_bus, sched, int, timers);
                    } else {
                        let data = self.device_read(i, dma_bus, sched, int, timers);
                        dma_bus.main_ram.write_u32(a, data);
                    }
                    a = (a as i32 + step) as u32 & 0x1F_FFFC;
                }
                self.trace_transfer(i, !from_ram, addr);

                let remaining = remaining - words;
                let cost = words * if i == 3 { CDROM_CC_PER_WORD } else { 1 };

                if remaining == 0 {
                    self.finish_channel(i, int);
                } else {
                    let chop_cpu_left = if chopping {
                        // chopping exposes progress through MADR/BCR
                        self.channels[i].base_address = a;
                        self.channels[i].block_control = remaining;
                        self.channels[i].channel_control.chopping_cpu_window_size()
                    } else {
                        0
                    };
                    self.channels[i].state = Some(TransferState::Burst {
                        remaining,
                        addr: a,
                        chop_cpu_left,
                    });
                }
                cost
            }
            _ => 0,
        }
    }

    /// Charge `cc` CPU cycles of progress to the interleaved transfer, if
    /// any. Called when the owner is `BusOwner::CpuDma`.
    pub(crate) fn run_cc(
        &mut self,
        cc: u32,
        dma_bus: &mut DmaBus,
        sched: &mut EventSchedule,
        int: &mut Interrupts,
        timers: &mut Timers,
    ) {
        let Some(i) = self.runnable() else { return };

        self.channels[i].budget += cc;
        loop {
            if self.channels[i].parked || self.channels[i].state.is_none() {
                break;
            }
            match self.channels[i].state.unwrap() {
                TransferState::Burst {
                    remaining,
                    addr,
                    chop_cpu_left,
                } if chop_cpu_left > 0 => {
                    // CPU window of a chopped burst
                    let used = chop_cpu_left.min(self.channels[i].budget);
                    self.channels[i].budget -= used;
                    self.channels[i].state = Some(TransferState::Burst {
                        remaining,
                        addr,
                        chop_cpu_left: chop_cpu_left - used,
                    });
                    if chop_cpu_left - used > 0 {
                        break;
                    }
                }
                TransferState::Burst { .. } | TransferState::Otc { .. } => {
                    // bus ownership changed under us; the scheduler will call
                    // `run` next iteration
                    break;
                }
                TransferState::Blocks { addr } => {
                    let block_size = self.channels[i].block_size();
                    if self.channels[i].budget < block_size {
                        break;
                    }
                    let from_ram = self.channels[i].channel_control.from_ram();
                    let step = self.channels[i].channel_control.address_step();

                    if !self.device_sync(i, block_size, from_ram, dma_bus) {
                        self.channels[i].parked = true;
                        break;
                    }
                    self.channels[i].budget -= block_size;

                    let mut a = addr;
                    for _ in 0..block_size {
                        if from_ram {
                            let data = dma_bus.main_ram.read_u32(a);
                            self.device_write(i, data, dma_bus, sched, int, timers);
                        } else {
                            let data = self.device_read(i, dma_bus, sched, int, timers);
                            dma_bus.main_ram.write_u32(a, data);
                        }
                        a = (a as i32 + step) as u32 & 0x1F_FFFC;
                    }
                    self.trace_transfer(i, !from_ram, addr);

                    // block-paced transfers expose progress in MADR/BCR
                    let blocks = self.channels[i].block_count().saturating_sub(1);
                    self.channels[i].block_control =
                        (self.channels[i].block_control & 0xFFFF) | (blocks << 16);
                    self.channels[i].base_address = a;

                    if blocks == 0 {
                        self.finish_channel(i, int);
                        break;
                    }
                    self.channels[i].state = Some(TransferState::Blocks { addr: a });
                }
                TransferState::LinkedList { addr } => {
                    let header = dma_bus.main_ram.read_u32(addr);
                    let nwords = header >> 24;
                    if self.channels[i].budget < nwords + 1 {
                        break;
                    }
                    if nwords > 0 && !self.device_sync(i, nwords, true, dma_bus) {
                        self.channels[i].parked = true;
                        break;
                    }
                    self.channels[i].budget -= nwords + 1;

                    for n in 1..=nwords {
                        let cmd = dma_bus.main_ram.read_u32(addr + n * 4);
                        self.device_write(i, cmd, dma_bus, sched, int, timers);
                    }
                    self.trace_transfer(i, false, addr);

                    let next = header & 0xFF_FFFF;
                    self.channels[i].base_address = next;
                    if next == 0xFF_FFFF {
                        self.finish_channel(i, int);
                        break;
                    }
                    self.channels[i].state = Some(TransferState::LinkedList {
                        addr: next & 0x1F_FFFC,
                    });
                }
            }
        }
    }

    pub(crate) fn end_iter(&mut self, _sched: &mut EventSchedule) {}

    pub(crate) fn next_event_cc(&self) -> Option<u32> {
        // transfers progress from the scheduler's arbitration, never from a
        // timed event
        None
    }

    // MMIO; `addr` is the offset within 0x1F801080..0x1F8010F8

    pub(crate) fn read(&self, addr: u32) -> u32 {
        match addr {
            0x80..=0xEF => {
                let channel_index = (addr >> 4) - 8;
                self.channels[channel_index as usize].read(addr & 0xF)
            }
            0xF0 => self.control,
            0xF4 => self.interrupt.bits(),
            // the two unknown read-only registers after DICR
            0xF8 => 0x7FFA_C68B,
            0xFC => 0x00FF_FF57,
            _ => {
                log::warn!("DMA: read from unknown register {:02X}", addr);
                0
            }
        }
    }

    pub(crate) fn write(&mut self, addr: u32, mut data: u32, int: &mut Interrupts) {
        match addr {
            0x80..=0xEF => {
                let channel_index = ((addr >> 4) - 8) as usize;
                match addr & 0xF {
                    0x0 => self.channels[channel_index].base_address = data & 0xFF_FFFF,
                    0x4 => self.channels[channel_index].block_control = data,
                    0x8 | 0xC => {
                        // channel 6 is hardwired except START/TRIGGER and one
                        // unknown bit; the step is always backwards
                        if channel_index == 6 {
                            data &= 0b0101_0001_0000_0000_0000_0000_0000_0000;
                            data |= 2;
                        }
                        self.channels[channel_index].channel_control =
                            ChannelControl::from_bits_retain(data);
                        self.try_start(channel_index);
                    }
                    _ => unreachable!(),
                }
            }
            0xF0 => {
                self.control = data;
                // a DPCR change re-asks any pending device sync
                for ch in self.channels.iter_mut() {
                    ch.parked = false;
                }
                for i in 0..7 {
                    self.try_start(i);
                }
            }
            0xF4 => {
                let old_interrupt = self.interrupt.bits();
                let new_data = data & 0xFF_FFFF;
                // writing 1 to a flag clears it
                let irq_flags_reset = data & 0x7F00_0000;

                // flags of channels whose enable went away are cleared too
                let irq_enable_mask = ((new_data >> 16) & 0x7F) ^ 0x7F;
                let irq_flags_reset = irq_flags_reset | (irq_enable_mask << 24);

                let new_interrupt = ((old_interrupt & 0xFF00_0000) & !irq_flags_reset) | new_data;
                self.interrupt = DmaInterruptRegister::from_bits_retain(new_interrupt);
                self.update_master_flag(int);
            }
            _ => log::warn!("DMA: write to unknown register {:02X} = {:08X}", addr, data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{Gpu, StatsRenderer};

    fn make_bus() -> DmaBus {
        DmaBus {
            main_ram: Default::default(),
            gpu: Gpu::new(Box::new(StatsRenderer::default())),
            cdrom: Default::default(),
            spu: Default::default(),
            mdec: Default::default(),
        }
    }

    fn ctx() -> (EventSchedule, Interrupts, Timers) {
        (EventSchedule::default(), Interrupts::default(), Timers::default())
    }

    #[test]
    fn priority_selects_lowest_value_then_highest_channel() {
        let mut dma = Dma::default();
        dma.control = 0b1000_1000_0000_0000_1000_1000_1000_1000;
        for i in [0, 1, 2, 3, 6] {
            dma.channels[i].state = Some(TransferState::Blocks { addr: 0 });
        }
        // all priority 0 among 0..3 -> highest index wins
        assert_eq!(dma.runnable(), Some(6));
        dma.channels[6].state = None;
        assert_eq!(dma.runnable(), Some(3));
    }

    #[test]
    fn parked_channels_release_the_bus() {
        let mut dma = Dma::default();
        dma.control = 0x0800_0000; // enable channel 6
        dma.channels[6].state = Some(TransferState::Otc {
            remaining: 4,
            addr: 0x100,
        });
        assert!(matches!(dma.bus_owner(), BusOwner::Dma));
        dma.channels[6].parked = true;
        assert!(matches!(dma.bus_owner(), BusOwner::Cpu));
    }

    #[test]
    fn otc_builds_the_ordering_table() {
        let mut dma = Dma::default();
        let mut bus = make_bus();
        let (mut sched, mut int, mut timers) = ctx();

        dma.write(0xF0, 0x0800_0000, &mut int); // DPCR: enable channel 6
        dma.write(0xE0, 0x100, &mut int); // MADR
        dma.write(0xE4, 4, &mut int); // 4 entries
        dma.write(0xE8, 0x1100_0000, &mut int); // start+trigger

        assert!(matches!(dma.bus_owner(), BusOwner::Dma));
        while dma.channels[6].state.is_some() {
            dma.run(&mut bus, &mut sched, &mut int, &mut timers);
        }

        assert_eq!(bus.main_ram.read_u32(0x100), 0x0000FC);
        assert_eq!(bus.main_ram.read_u32(0x0FC), 0x0000F8);
        assert_eq!(bus.main_ram.read_u32(0x0F8), 0x0000F4);
        assert_eq!(bus.main_ram.read_u32(0x0F4), 0xFFFFFF);
        // transfer done, channel idle again
        assert!(matches!(dma.bus_owner(), BusOwner::Cpu));
        assert_eq!(dma.read(0xE8) & 0x0100_0000, 0);
    }

    #[test]
    fn finished_channel_latches_dicr_flag_and_irq() {
        let mut dma = Dma::default();
        let mut bus = make_bus();
        let (mut sched, mut int, mut timers) = ctx();

        // master enable + channel 6 enable
        dma.write(0xF4, (1 << 23) | (1 << 22), &mut int);
        dma.write(0xF0, 0x0800_0000, &mut int);
        dma.write(0xE0, 0x40, &mut int);
        dma.write(0xE4, 1, &mut int);
        dma.write(0xE8, 0x1100_0000, &mut int);
        dma.run(&mut bus, &mut sched, &mut int, &mut timers);

        let dicr = dma.read(0xF4);
        assert_ne!(dicr & (1 << 30), 0, "channel 6 flag");
        assert_ne!(dicr & (1 << 31), 0, "master flag");
        assert_ne!(int.read_stat() & 0x8, 0, "I_STAT DMA bit");

        // acknowledging the flag drops the master flag
        dma.write(0xF4, (1 << 23) | (1 << 22) | (1 << 30), &mut int);
        assert_eq!(dma.read(0xF4) & (1 << 31), 0);
    }

    #[test]
    fn mode1_total_words_is_blocks_times_block_size() {
        let mut dma = Dma::default();
        let mut bus = make_bus();
        let (mut sched, mut int, mut timers) = ctx();

        // SPU write: mode 1, 3 blocks of 4 words from RAM
        for w in 0..12u32 {
            bus.main_ram.write_u32(0x200 + w * 4, w);
        }
        bus.spu.write_u16(0x1AA, 2 << 4, &mut int); // transfer mode = dma write
        bus.spu.write_u16(0x1A6, 0, &mut int);

        dma.write(0xF0, 0x0008_0000, &mut int); // DPCR: enable channel 4
        dma.write(0xC0, 0x200, &mut int);
        dma.write(0xC4, (3 << 16) | 4, &mut int);
        dma.write(0xC8, 0x0100_0201, &mut int); // start, mode 1, from ram
        assert!(matches!(dma.bus_owner(), BusOwner::CpuDma));

        // 12 words at one cycle each
        dma.run_cc(12, &mut bus, &mut sched, &mut int, &mut timers);
        assert!(dma.channels[4].state.is_none());

        bus.spu.write_u16(0x1A6, 0, &mut int);
        for w in 0..12u32 {
            assert_eq!(bus.spu.dma_read(&mut int), w);
        }
        // MADR advanced past the 12 words
        assert_eq!(dma.read(0xC0), 0x200 + 12 * 4);
    }
}
