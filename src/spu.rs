use byteorder::{ByteOrder, LittleEndian};

use crate::frontend::Frontend;
use crate::memory::interrupts::{Interrupt, Interrupts};
use crate::memory::EventSchedule;

/// 33868800 / 44100: CPU cycles per output sample frame.
const CC_PER_SAMPLE: u32 = 768;

/// Stereo frames per `play_sound` delivery.
const AUDIO_BUFFER_FRAMES: usize = 256;

const SPU_RAM_SIZE: usize = 512 * 1024;

bitflags::bitflags! {
    #[derive(Default, Debug, Clone, Copy)]
    struct SpuControl: u16 {
        const CD_AUDIO_ENABLE     = 1 << 0;
        const EXTERNAL_ENABLE     = 1 << 1;
        const CD_REVERB           = 1 << 2;
        const EXTERNAL_REVERB     = 1 << 3;
        const TRANSFER_MODE       = 0b11 << 4;
        const IRQ_ENABLE          = 1 << 6;
        const REVERB_MASTER       = 1 << 7;
        const NOISE_SHIFT         = 0b111111 << 8;
        const MUTE                = 1 << 14;
        const ENABLE              = 1 << 15;
    }
}

impl SpuControl {
    fn transfer_mode(&self) -> u16 {
        (self.bits() >> 4) & 0b11
    }
}

/// Sound processor bus/timing shell.
///
/// Voice synthesis, ADSR and reverb are outside the core; this module owns
/// what the rest of the machine interacts with: the 16-bit register file
/// (including the byte-lane quirk handled by the bus), 512 KiB of sound RAM
/// with the manual fifo and DMA channel 4, the address-match IRQ, and the
/// 44.1 kHz output cadence that feeds `Frontend::play_sound`. Until a
/// synthesis collaborator exists the output is silence, delivered at the
/// right rate.
pub struct Spu {
    /// raw register file, one u16 per even offset in 0x000..0x400
    regs: [u16; 0x200],
    control: SpuControl,
    ram: Vec<u8>,
    transfer_addr: u32,

    out_buf: Vec<i16>,
    cc: u32,
    cc_used: u32,
}

impl Default for Spu {
    fn default() -> Self {
        Self {
            regs: [0; 0x200],
            control: SpuControl::default(),
            ram: vec![0; SPU_RAM_SIZE],
            transfer_addr: 0,
            out_buf: Vec::with_capacity(AUDIO_BUFFER_FRAMES * 2),
            cc: 0,
            cc_used: 0,
        }
    }
}

// register file offsets (relative to 0x1F801C00)
const REG_KOFF_LO: usize = 0x18C;
const REG_ENDX_LO: usize = 0x19C;
const REG_IRQ_ADDR: usize = 0x1A4;
const REG_TRANSFER_ADDR: usize = 0x1A6;
const REG_TRANSFER_FIFO: usize = 0x1A8;
const REG_CONTROL: usize = 0x1AA;
const REG_TRANSFER_CTRL: usize = 0x1AC;
const REG_STATUS: usize = 0x1AE;

impl Spu {
    pub(crate) fn reset(&mut self) {
        let ram = std::mem::take(&mut self.ram);
        *self = Self {
            ram,
            ..Self::default()
        };
        self.ram.iter_mut().for_each(|b| *b = 0);
    }

    fn reg_index(addr: u32) -> usize {
        ((addr as usize) & 0x3FF) >> 1
    }

    fn irq_check(&mut self, byte_addr: u32, int: &mut Interrupts) {
        if !self.control.intersects(SpuControl::IRQ_ENABLE) {
            return;
        }
        let irq_addr = (self.regs[REG_IRQ_ADDR >> 1] as u32) * 8;
        if byte_addr & !0x7 == irq_addr & !0x7 {
            int.pulse(Interrupt::SPU);
        }
    }

    fn ram_write_u16(&mut self, data: u16, int: &mut Interrupts) {
        let addr = (self.transfer_addr as usize) % SPU_RAM_SIZE;
        LittleEndian::write_u16(&mut self.ram[addr..addr + 2], data);
        self.irq_check(self.transfer_addr, int);
        self.transfer_addr = (self.transfer_addr + 2) % SPU_RAM_SIZE as u32;
    }

    fn ram_read_u16(&mut self, int: &mut Interrupts) -> u16 {
        let addr = (self.transfer_addr as usize) % SPU_RAM_SIZE;
        let data = LittleEndian::read_u16(&self.ram[addr..addr + 2]);
        self.irq_check(self.transfer_addr, int);
        self.transfer_addr = (self.transfer_addr + 2) % SPU_RAM_SIZE as u32;
        data
    }

    fn status(&self) -> u16 {
        // low 6 bits mirror SPUCNT; the transfer-busy bit never sets because
        // shell transfers complete within the access
        self.control.bits() & 0x3F
    }

    /// MMIO read at even offset in 0x1F801C00..0x1F801E00.
    pub(crate) fn read_u16(&mut self, addr: u32) -> u16 {
        let index = Self::reg_index(addr);
        match index << 1 {
            REG_CONTROL => self.control.bits(),
            REG_STATUS => self.status(),
            REG_TRANSFER_FIFO => {
                log::warn!("SPU: reading the transfer fifo");
                0
            }
            // current-volume windows read back zero in the shell
            0x1B8..=0x1BA | 0x200..=0x25F => 0,
            _ => self.regs[index],
        }
    }

    /// MMIO write. `int` is needed for the address-match IRQ.
    pub(crate) fn write_u16(&mut self, addr: u32, data: u16, int: &mut Interrupts) {
        let index = Self::reg_index(addr);
        match index << 1 {
            REG_CONTROL => {
                self.control = SpuControl::from_bits_retain(data);
                if !self.control.intersects(SpuControl::IRQ_ENABLE) {
                    int.interruption(Interrupt::SPU, false);
                }
            }
            REG_TRANSFER_ADDR => {
                self.regs[index] = data;
                self.transfer_addr = (data as u32) * 8;
            }
            REG_TRANSFER_FIFO => self.ram_write_u16(data, int),
            REG_TRANSFER_CTRL => {
                if data != 0x0004 {
                    log::warn!("SPU: unusual transfer control {:04X}", data);
                }
                self.regs[index] = data;
            }
            REG_STATUS => {} // read only
            0x188 | 0x18A => {
                // key on: with no synthesis the voices "finish" immediately,
                // which is what ENDX reports
                self.regs[index] = data;
                self.regs[(REG_ENDX_LO >> 1) + (index & 1)] |= data;
            }
            REG_KOFF_LO | 0x18E => {
                self.regs[index] = data;
            }
            _ => self.regs[index] = data,
        }
    }

    // DMA channel 4

    pub(crate) fn dma_sync(&mut self, _nwords: u32, from_ram: bool) -> bool {
        let mode = self.control.transfer_mode();
        match (mode, from_ram) {
            (2, true) | (3, false) => {}
            _ => log::warn!(
                "SPU: DMA4 {} with transfer mode {}",
                if from_ram { "write" } else { "read" },
                mode
            ),
        }
        true
    }

    pub(crate) fn dma_write(&mut self, data: u32, int: &mut Interrupts) {
        self.ram_write_u16(data as u16, int);
        self.ram_write_u16((data >> 16) as u16, int);
    }

    pub(crate) fn dma_read(&mut self, int: &mut Interrupts) -> u32 {
        let lo = self.ram_read_u16(int) as u32;
        let hi = self.ram_read_u16(int) as u32;
        lo | (hi << 16)
    }

    fn clock(&mut self, frontend: &dyn Frontend) {
        let nsamples = self.cc / CC_PER_SAMPLE;
        self.cc %= CC_PER_SAMPLE;
        for _ in 0..nsamples {
            // silence until a synthesis collaborator is plugged in
            self.out_buf.push(0);
            self.out_buf.push(0);
            if self.out_buf.len() == AUDIO_BUFFER_FRAMES * 2 {
                frontend.play_sound(&self.out_buf);
                self.out_buf.clear();
            }
        }
    }

    pub(crate) fn end_iter(&mut self, sched: &mut EventSchedule, frontend: &dyn Frontend) {
        let cc = sched.clock.wrapping_sub(self.cc_used);
        if cc > 0 {
            self.cc += cc;
            self.cc_used += cc;
            if self.cc >= CC_PER_SAMPLE {
                self.clock(frontend);
            }
        }
        self.cc_used = 0;
        sched.shrink(self.next_event_cc());
    }

    pub(crate) fn next_event_cc(&self) -> u32 {
        CC_PER_SAMPLE - self.cc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct CountingFrontend {
        buffers: RefCell<usize>,
        samples: RefCell<usize>,
    }

    impl Frontend for CountingFrontend {
        fn play_sound(&self, samples: &[i16]) {
            *self.buffers.borrow_mut() += 1;
            *self.samples.borrow_mut() += samples.len();
        }
    }

    #[test]
    fn fifo_write_reaches_sound_ram() {
        let mut spu = Spu::default();
        let mut int = Interrupts::default();

        spu.write_u16(REG_TRANSFER_ADDR as u32, 0x100, &mut int); // *8 = 0x800
        spu.write_u16(REG_TRANSFER_FIFO as u32, 0xBEEF, &mut int);

        spu.write_u16(REG_TRANSFER_ADDR as u32, 0x100, &mut int);
        assert_eq!(spu.dma_read(&mut int) & 0xFFFF, 0xBEEF);
    }

    #[test]
    fn transfer_irq_on_address_match() {
        let mut spu = Spu::default();
        let mut int = Interrupts::default();

        spu.write_u16(REG_IRQ_ADDR as u32, 0x100, &mut int);
        spu.write_u16(REG_CONTROL as u32, 1 << 6, &mut int); // IRQ enable
        spu.write_u16(REG_TRANSFER_ADDR as u32, 0x100, &mut int);
        spu.write_u16(REG_TRANSFER_FIFO as u32, 0x1234, &mut int);

        assert_ne!(int.read_stat() & 0x200, 0);
    }

    #[test]
    fn sample_cadence_fills_buffers() {
        let mut spu = Spu::default();
        let frontend = CountingFrontend {
            buffers: RefCell::new(0),
            samples: RefCell::new(0),
        };
        let mut sched = EventSchedule::default();

        // one full buffer is 256 frames = 256 * 768 cycles
        let mut total = 256 * CC_PER_SAMPLE;
        while total > 0 {
            let step = spu.next_event_cc().min(total);
            sched.clock = step;
            spu.cc_used = 0;
            spu.end_iter(&mut sched, &frontend);
            total -= step;
        }

        assert_eq!(*frontend.buffers.borrow(), 1);
        assert_eq!(*frontend.samples.borrow(), 512);
    }

    #[test]
    fn key_on_reports_endx() {
        let mut spu = Spu::default();
        let mut int = Interrupts::default();

        spu.write_u16(0x188, 0x0005, &mut int);
        assert_eq!(spu.read_u16(REG_ENDX_LO as u32), 0x0005);
    }
}
