use std::collections::VecDeque;

use crate::memory::interrupts::{Interrupt, Interrupts};
use crate::memory::EventSchedule;

/// Rough cycles between a command write and its acknowledge response.
const CMD_RESPONSE_DELAY: u32 = 50_000;

/// CD-ROM controller MMIO shell.
///
/// The command table, seeking model and sector decoding live outside the
/// core. This shell carries what every other component can observe: the
/// index/port register file, parameter/response/data fifos, the interrupt
/// enable/flag pair with its ack semantics, DMA channel 3 service and event
/// scheduling. Commands are acknowledged with a "motor on, no disc" status
/// so BIOS probes run to completion.
pub struct Cdrom {
    index: u8,
    params: VecDeque<u8>,
    response: VecDeque<u8>,
    data: VecDeque<u8>,
    int_enable: u8,
    int_flag: u8,

    /// (cycles until delivery, response bytes, int number)
    pending_response: Option<(u32, Vec<u8>, u8)>,

    cc_used: u32,
}

impl Default for Cdrom {
    fn default() -> Self {
        Self {
            index: 0,
            params: VecDeque::new(),
            response: VecDeque::new(),
            data: VecDeque::new(),
            int_enable: 0,
            int_flag: 0,
            pending_response: None,
            cc_used: 0,
        }
    }
}

impl Cdrom {
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    fn stat_byte(&self) -> u8 {
        // motor on; shell open would be 0x10
        0x02
    }

    fn command(&mut self, cmd: u8) {
        log::warn!(
            "CDROM: command {:02X} ({} params) handled by the stub controller",
            cmd,
            self.params.len()
        );
        self.params.clear();
        // every command at least acknowledges with INT3(stat)
        self.pending_response = Some((CMD_RESPONSE_DELAY, vec![self.stat_byte()], 3));
    }

    fn update_irq(&self, int: &mut Interrupts) {
        int.interruption(Interrupt::CDROM, self.int_flag & self.int_enable & 0x7 != 0);
    }

    /// 0x1F801800: status register, same on every index.
    pub(crate) fn status(&self) -> u8 {
        let param_empty = self.params.is_empty();
        let param_ready = self.params.len() < 16;
        let response_ready = !self.response.is_empty();
        let data_ready = !self.data.is_empty();
        let busy = self.pending_response.is_some();
        (self.index & 0x3)
            | ((param_empty as u8) << 3)
            | ((param_ready as u8) << 4)
            | ((response_ready as u8) << 5)
            | ((data_ready as u8) << 6)
            | ((busy as u8) << 7)
    }

    pub(crate) fn set_index(&mut self, data: u8) {
        self.index = data & 0x3;
    }

    pub(crate) fn port1_write(&mut self, data: u8, sched: &mut EventSchedule) {
        match self.index {
            0 => {
                self.command(data);
                sched.shrink(self.next_event_cc());
            }
            3 => log::trace!("CDROM: right-cd-out volume {:02X}", data),
            _ => log::warn!("CDROM: port1.{} write {:02X}", self.index, data),
        }
    }

    pub(crate) fn port2_write(&mut self, data: u8, int: &mut Interrupts) {
        match self.index {
            0 => {
                if self.params.len() < 16 {
                    self.params.push_back(data);
                } else {
                    log::warn!("CDROM: parameter fifo overflow");
                }
            }
            1 => {
                self.int_enable = data & 0x1F;
                self.update_irq(int);
            }
            _ => log::trace!("CDROM: port2.{} write {:02X}", self.index, data),
        }
    }

    pub(crate) fn port3_write(&mut self, data: u8, int: &mut Interrupts) {
        match self.index {
            0 => {
                // request register; bit 7 wants data, we have none to give
                if data & 0x80 != 0 && self.data.is_empty() {
                    log::warn!("CDROM: data requested but no sector is buffered");
                }
                if data & 0x80 == 0 {
                    self.data.clear();
                }
            }
            1 => {
                // interrupt flag ack
                self.int_flag &= !(data & 0x1F);
                if data & 0x40 != 0 {
                    self.params.clear();
                }
                self.update_irq(int);
            }
            _ => log::trace!("CDROM: port3.{} write {:02X}", self.index, data),
        }
    }

    pub(crate) fn port1_read(&mut self) -> u8 {
        // response fifo on every index
        self.response.pop_front().unwrap_or(0)
    }

    pub(crate) fn port2_read(&mut self) -> u8 {
        self.data.pop_front().unwrap_or(0)
    }

    pub(crate) fn port3_read(&self) -> u8 {
        match self.index {
            0 | 2 => self.int_enable | 0xE0,
            _ => self.int_flag | 0xE0,
        }
    }

    // DMA channel 3

    pub(crate) fn dma_sync(&mut self, nwords: u32) -> bool {
        if self.data.len() < (nwords as usize) * 4 {
            log::warn!(
                "CDROM: DMA3 wants {} words but only {} bytes are buffered",
                nwords,
                self.data.len()
            );
        }
        true
    }

    pub(crate) fn dma_read(&mut self) -> u32 {
        let mut word = 0;
        for i in 0..4 {
            word |= (self.data.pop_front().unwrap_or(0) as u32) << (i * 8);
        }
        word
    }

    pub(crate) fn end_iter(&mut self, sched: &mut EventSchedule, int: &mut Interrupts) {
        let cc = sched.clock.wrapping_sub(self.cc_used);
        if cc > 0 {
            self.cc_used += cc;
            if let Some((left, bytes, int_num)) = self.pending_response.take() {
                if left <= cc {
                    self.response.extend(bytes);
                    self.int_flag = (self.int_flag & !0x7) | int_num;
                    self.update_irq(int);
                } else {
                    self.pending_response = Some((left - cc, bytes, int_num));
                }
            }
        }
        self.cc_used = 0;
        sched.shrink(self.next_event_cc());
    }

    pub(crate) fn next_event_cc(&self) -> u32 {
        match self.pending_response {
            Some((left, _, _)) => left,
            None => 0x0FFF_FFFF,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_acknowledges_with_int3() {
        let mut cdrom = Cdrom::default();
        let mut int = Interrupts::default();
        let mut sched = EventSchedule::default();

        cdrom.port2_write(0x1F, &mut int); // nothing selected yet, index 0 pushes param
        cdrom.set_index(1);
        cdrom.port2_write(0x1F, &mut int); // int enable
        cdrom.set_index(0);
        cdrom.port1_write(0x01, &mut sched); // GetStat

        assert_eq!(cdrom.next_event_cc(), CMD_RESPONSE_DELAY);
        sched.clock = CMD_RESPONSE_DELAY;
        cdrom.end_iter(&mut sched, &mut int);

        cdrom.set_index(1);
        assert_eq!(cdrom.port3_read() & 0x7, 3);
        assert_ne!(int.read_stat() & 0x4, 0);

        // acking the flag drops the line
        cdrom.port3_write(0x07, &mut int);
        int.ack(0);
        assert_eq!(int.read_stat() & 0x4, 0);

        // the response fifo carries the stub status
        assert_eq!(cdrom.port1_read(), 0x02);
    }
}
