use crate::memory::interrupts::{Interrupt, Interrupts};
use crate::memory::EventSchedule;

/// Horizon used when no IRQ is scheduled, so the timers still get clocked
/// at a reasonable cadence.
const IDLE_EVENT_CC: u32 = 100_000;

#[derive(Clone)]
struct Timer {
    counter: u16,
    /// 17 bits: 0x10000 means "target 0", which only matches on wrap.
    target: u32,
    clocks_to_target: i32,
    clocks_to_ffff: i32,
    sync_enabled: bool,
    sync_mode: u8,
    source: u8,
    paused: bool,
    reset_after_target: bool,
    irq_when_target: bool,
    irq_when_ffff: bool,
    irq_one_shot: bool,
    irq_toggle_bit: bool,
    irq_requested: bool,
    target_reached: bool,
    ffff_reached: bool,
    irq_triggered: bool,
}

impl Timer {
    fn new() -> Self {
        let mut t = Self {
            counter: 0,
            target: 0x10000,
            clocks_to_target: 0,
            clocks_to_ffff: 0,
            sync_enabled: false,
            sync_mode: 0,
            source: 0,
            paused: false,
            reset_after_target: false,
            irq_when_target: false,
            irq_when_ffff: false,
            irq_one_shot: true,
            irq_toggle_bit: false,
            irq_requested: false,
            target_reached: false,
            ffff_reached: false,
            irq_triggered: false,
        };
        t.update_clocks_to();
        t
    }

    fn update_clocks_to(&mut self) {
        self.clocks_to_ffff = if self.counter == 0xFFFF {
            0x10000
        } else {
            0xFFFF - self.counter as i32
        };

        self.clocks_to_target = if (self.counter as u32) >= self.target {
            (0x10000 - self.counter as i32) + self.target as i32
        } else {
            self.target as i32 - self.counter as i32
        };
    }

    fn set_counter_value(&mut self, val: u32) {
        self.counter = val as u16;
        self.update_clocks_to();
    }

    fn set_counter_mode(&mut self, data: u32) {
        self.sync_enabled = data & 0x1 != 0;
        self.sync_mode = ((data >> 1) & 0x3) as u8;
        self.reset_after_target = data & 0x8 != 0;
        self.irq_when_target = data & 0x10 != 0;
        self.irq_when_ffff = data & 0x20 != 0;
        self.irq_one_shot = data & 0x40 == 0;
        self.irq_toggle_bit = data & 0x80 != 0;
        self.source = ((data >> 8) & 0x3) as u8;

        // a mode write resets the counter and every latch
        self.irq_requested = false;
        self.target_reached = false;
        self.ffff_reached = false;
        self.counter = 0;
        self.paused = false;
        self.irq_triggered = false;
        self.update_clocks_to();
    }

    /// Reading the mode register clears the reached latches. Bit 10 reports
    /// the IRQ line inverted.
    fn counter_mode(&mut self) -> u32 {
        let ret = (self.sync_enabled as u32)
            | ((self.sync_mode as u32) << 1)
            | ((self.reset_after_target as u32) << 3)
            | ((self.irq_when_target as u32) << 4)
            | ((self.irq_when_ffff as u32) << 5)
            | (((!self.irq_one_shot) as u32) << 6)
            | ((self.irq_toggle_bit as u32) << 7)
            | ((self.source as u32) << 8)
            | (((!self.irq_requested) as u32) << 10)
            | ((self.target_reached as u32) << 11)
            | ((self.ffff_reached as u32) << 12);
        self.target_reached = false;
        self.ffff_reached = false;
        ret
    }

    fn set_target_value(&mut self, val: u32) {
        self.target = val & 0xFFFF;
        if self.target == 0 {
            self.target = 0x10000;
        }
        self.update_clocks_to();
    }

    /// 0 means no IRQ scheduled, in this timer's own clock domain.
    fn clocks_to_irq(&self) -> i32 {
        let mut ret = 0;
        if self.irq_when_target {
            ret = self.clocks_to_target;
        }
        if self.irq_when_ffff && (ret == 0 || self.clocks_to_ffff < ret) {
            ret = self.clocks_to_ffff;
        }
        ret
    }

    fn tick(&mut self, clocks: i32, irq: Interrupt, int: &mut Interrupts) {
        // the IRQ pulse lasts only a few cycles, model it as "until the next
        // clock batch"
        if self.irq_requested && !self.irq_toggle_bit {
            self.irq_requested = false;
            int.interruption(irq, false);
        }

        if self.paused {
            return;
        }

        let mut irqs = 0;
        let mut update = false;
        self.clocks_to_target -= clocks;
        self.clocks_to_ffff -= clocks;
        self.counter = self.counter.wrapping_add(clocks as u16);
        if self.clocks_to_target <= 0 {
            update = true;
            self.target_reached = true;
            if self.reset_after_target {
                self.counter = ((-self.clocks_to_target) % self.target as i32) as u16;
                if self.irq_when_target {
                    irqs = 1 + (-self.clocks_to_target) / self.target as i32;
                }
            } else if self.irq_when_target {
                irqs = 1;
            }
        }
        if self.clocks_to_ffff <= 0 {
            update = true;
            self.ffff_reached = true;
            if self.irq_when_ffff {
                irqs = 1;
            }
        }
        if update {
            self.update_clocks_to();
        }

        while irqs > 0 {
            irqs -= 1;
            if self.irq_one_shot && self.irq_triggered {
                return;
            }
            self.irq_triggered = true;
            if self.irq_toggle_bit {
                self.irq_requested = !self.irq_requested;
            } else {
                self.irq_requested = true;
            }
            if self.irq_requested {
                int.interruption(irq, true);
            } else {
                int.interruption(irq, false);
            }
        }
    }
}

const TIMER_IRQS: [Interrupt; 3] = [Interrupt::TIMER0, Interrupt::TIMER1, Interrupt::TIMER2];

/// The three root counters.
///
/// Timer 0 can count GPU dots, timer 1 HBlanks, timer 2 the system clock
/// divided by 8; everything else is the raw system clock. The module is
/// clocked lazily: every MMIO access and every scheduler sweep first pulls
/// the local clock up to the slice clock.
pub struct Timers {
    timers: [Timer; 3],
    t0_use_dotclock: bool,
    t1_use_hblank: bool,

    /// dotclock accumulator, in 1/11 CPU cycle ticks (7 ticks = 1 GPU cycle)
    dot_cc: i32,
    /// GPU cycles per dot, from the current horizontal resolution
    dot: i32,

    /// prescaler for timer 2's clock/8 source
    div8_cc: i32,
    div8_enabled: bool,

    cc_used: u32,
    cc: u32,
    cc_to_irq: u32,
    cc_to_event: u32,
}

impl Default for Timers {
    fn default() -> Self {
        let mut s = Self {
            timers: [Timer::new(), Timer::new(), Timer::new()],
            t0_use_dotclock: false,
            t1_use_hblank: false,
            dot_cc: 0,
            dot: 7, // matches the 256-pixel mode the GPU resets to
            div8_cc: 0,
            div8_enabled: false,
            cc_used: 0,
            cc: 0,
            cc_to_irq: 0,
            cc_to_event: 0,
        };
        s.update_timing_no_sched();
        s
    }
}

impl Timers {
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    fn update_timing_no_sched(&mut self) {
        self.cc_to_irq = 0;

        // timer 0, converting dots back to CPU cycles when needed
        if !self.timers[0].paused {
            let aux = self.timers[0].clocks_to_irq();
            if aux != 0 {
                let mut aux = aux;
                if self.t0_use_dotclock {
                    aux *= 7 * self.dot;
                    aux = aux / 11 + (aux % 11 != 0) as i32;
                }
                let aux = aux as u32;
                if self.cc_to_irq == 0 || aux < self.cc_to_irq {
                    self.cc_to_irq = aux;
                }
            }
        }

        // timer 1 in HBlank mode is ticked explicitly from the GPU, it never
        // contributes to the free-running horizon
        if !self.timers[1].paused && !self.t1_use_hblank {
            let aux = self.timers[1].clocks_to_irq();
            if aux != 0 {
                let aux = aux as u32;
                if self.cc_to_irq == 0 || aux < self.cc_to_irq {
                    self.cc_to_irq = aux;
                }
            }
        }

        if !self.timers[2].paused {
            let aux = self.timers[2].clocks_to_irq();
            if aux != 0 {
                let mut aux = aux as u32;
                if self.div8_enabled {
                    aux *= 8;
                }
                if self.cc_to_irq == 0 || aux < self.cc_to_irq {
                    self.cc_to_irq = aux;
                }
            }
        }

        self.cc_to_event = IDLE_EVENT_CC;
        if self.cc_to_irq != 0 && self.cc_to_irq < self.cc_to_event {
            self.cc_to_event = self.cc_to_irq;
        }
    }

    fn update_timing(&mut self, sched: &mut EventSchedule) {
        self.update_timing_no_sched();
        sched.shrink(self.next_event_cc());
    }

    /// Pull the counters up to the current slice clock.
    fn clock(&mut self, sched: &EventSchedule, int: &mut Interrupts) {
        let cc = sched.clock.wrapping_sub(self.cc_used);
        if cc > 0 && (cc as i32) > 0 {
            self.cc += cc;
            self.cc_used += cc;
        }
        if self.cc == 0 {
            return;
        }

        // timer 0 (dotclock accumulates in 1/11 CPU ticks)
        self.dot_cc += 11 * self.cc as i32;
        let dots = self.dot_cc / (7 * self.dot);
        self.dot_cc %= 7 * self.dot;
        if !self.t0_use_dotclock {
            self.timers[0].tick(self.cc as i32, TIMER_IRQS[0], int);
        } else if dots > 0 {
            self.timers[0].tick(dots, TIMER_IRQS[0], int);
        }

        // timer 1
        if !self.t1_use_hblank {
            self.timers[1].tick(self.cc as i32, TIMER_IRQS[1], int);
        }

        // timer 2
        self.div8_cc += self.cc as i32;
        let cc8 = self.div8_cc / 8;
        self.div8_cc %= 8;
        if !self.div8_enabled {
            self.timers[2].tick(self.cc as i32, TIMER_IRQS[2], int);
        } else if cc8 > 0 {
            self.timers[2].tick(cc8, TIMER_IRQS[2], int);
        }

        self.cc = 0;
        self.update_timing_no_sched();
    }

    pub(crate) fn end_iter(&mut self, sched: &mut EventSchedule, int: &mut Interrupts) {
        let cc = sched.clock.wrapping_sub(self.cc_used);
        if cc > 0 && (cc as i32) > 0 {
            self.cc += cc;
            self.cc_used += cc;
            if self.cc >= self.cc_to_event {
                self.clock(sched, int);
            }
        }
        self.cc_used = 0;
        sched.shrink(self.next_event_cc());
    }

    pub(crate) fn next_event_cc(&self) -> u32 {
        self.cc_to_event.saturating_sub(self.cc)
    }

    /// True when either timer 0 sync or timer 1's HBlank source needs the
    /// GPU to report HBlank edges.
    pub(crate) fn hblank_signal_wanted(&self) -> bool {
        self.timers[0].sync_enabled || self.t1_use_hblank
    }

    pub(crate) fn hblank_in(&mut self, sched: &mut EventSchedule, int: &mut Interrupts) {
        if self.timers[0].sync_enabled {
            self.clock(sched, int);
            match self.timers[0].sync_mode {
                0 => {
                    // pause during hblank
                    self.timers[0].paused = true;
                }
                1 | 2 => {
                    // reset to 0 at hblank (and, for 2, run only inside it)
                    self.timers[0].paused = false;
                    self.timers[0].counter = 0;
                    self.timers[0].update_clocks_to();
                }
                3 => {
                    // pause until the first hblank, then free-run
                    self.timers[0].paused = false;
                    self.timers[0].sync_enabled = false;
                }
                _ => unreachable!(),
            }
            self.update_timing(sched);
        }

        if self.t1_use_hblank {
            self.clock(sched, int);
            self.timers[1].tick(1, TIMER_IRQS[1], int);
        }
    }

    pub(crate) fn hblank_out(&mut self, sched: &mut EventSchedule, int: &mut Interrupts) {
        if self.timers[0].sync_enabled {
            self.clock(sched, int);
            match self.timers[0].sync_mode {
                0 => self.timers[0].paused = false,
                2 => self.timers[0].paused = true,
                _ => {}
            }
            self.update_timing(sched);
        }
    }

    pub(crate) fn vblank_in(&mut self, sched: &mut EventSchedule, int: &mut Interrupts) {
        if self.timers[1].sync_enabled {
            self.clock(sched, int);
            match self.timers[1].sync_mode {
                0 => self.timers[1].paused = true,
                1 | 2 => {
                    self.timers[1].paused = false;
                    self.timers[1].counter = 0;
                    self.timers[1].update_clocks_to();
                }
                3 => {
                    self.timers[1].paused = false;
                    self.timers[1].sync_enabled = false;
                }
                _ => unreachable!(),
            }
            self.update_timing(sched);
        }
    }

    pub(crate) fn vblank_out(&mut self, sched: &mut EventSchedule, int: &mut Interrupts) {
        if self.timers[1].sync_enabled {
            self.clock(sched, int);
            match self.timers[1].sync_mode {
                0 => self.timers[1].paused = false,
                2 => self.timers[1].paused = true,
                _ => {}
            }
            self.update_timing(sched);
        }
    }

    /// The GPU reports how many of its cycles one dot takes whenever the
    /// horizontal resolution changes.
    pub(crate) fn set_dot_gpucc(
        &mut self,
        gpucc: i32,
        sched: &mut EventSchedule,
        int: &mut Interrupts,
    ) {
        self.clock(sched, int);
        self.dot = gpucc;
        self.update_timing(sched);
    }

    /// MMIO read, `addr` is the offset inside `0x1F801100..0x1F801130`.
    pub(crate) fn read(
        &mut self,
        addr: u32,
        sched: &mut EventSchedule,
        int: &mut Interrupts,
    ) -> u32 {
        let timer = ((addr >> 4) & 0x3) as usize;
        if timer > 2 {
            log::warn!("read from unknown timer register {:02X}", addr & 0x3F);
            return 0;
        }
        match addr & 0xF {
            0x0 => {
                self.clock(sched, int);
                self.timers[timer].counter as u32
            }
            0x4 => {
                // mostly for the live irq_requested bit
                self.clock(sched, int);
                let v = self.timers[timer].counter_mode();
                self.update_timing(sched);
                v
            }
            0x8 => self.timers[timer].target & 0xFFFF,
            _ => {
                log::warn!("read from unknown timer register {:02X}", addr & 0x3F);
                0
            }
        }
    }

    /// MMIO write, `addr` is the offset inside `0x1F801100..0x1F801130`.
    pub(crate) fn write(
        &mut self,
        addr: u32,
        data: u32,
        sched: &mut EventSchedule,
        int: &mut Interrupts,
    ) {
        let timer = ((addr >> 4) & 0x3) as usize;
        if timer > 2 {
            log::warn!("write to unknown timer register {:02X}", addr & 0x3F);
            return;
        }
        self.clock(sched, int);
        match addr & 0xF {
            0x0 => {
                self.timers[timer].set_counter_value(data);
                self.update_timing(sched);
            }
            0x4 => {
                self.timers[timer].set_counter_mode(data);
                match timer {
                    0 => {
                        self.t0_use_dotclock = self.timers[0].source & 0x1 != 0;
                        if self.timers[0].sync_enabled && self.timers[0].sync_mode == 3 {
                            self.timers[0].paused = true;
                        }
                    }
                    1 => {
                        self.t1_use_hblank = self.timers[1].source & 0x1 != 0;
                        if self.timers[1].sync_enabled && self.timers[1].sync_mode == 3 {
                            self.timers[1].paused = true;
                        }
                    }
                    2 => {
                        self.div8_enabled = self.timers[2].source >= 2;
                        if self.timers[2].sync_enabled
                            && (self.timers[2].sync_mode == 0 || self.timers[2].sync_mode == 3)
                        {
                            self.timers[2].paused = true;
                        }
                    }
                    _ => unreachable!(),
                }
                // the IRQ line drops with the latches
                int.interruption(TIMER_IRQS[timer], false);
                self.update_timing(sched);
            }
            0x8 => {
                self.timers[timer].set_target_value(data);
                self.update_timing(sched);
            }
            _ => log::warn!("write to unknown timer register {:02X}", addr & 0x3F),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_cycles(timers: &mut Timers, int: &mut Interrupts, cycles: u32) {
        let mut sched = EventSchedule::default();
        let mut left = cycles;
        while left > 0 {
            sched.clock = 0;
            sched.next_event_cc = left.min(timers.next_event_cc().max(1));
            sched.clock = sched.next_event_cc;
            timers.end_iter(&mut sched, int);
            left -= sched.clock;
        }
    }

    #[test]
    fn free_run_counts_system_clock() {
        let mut timers = Timers::default();
        let mut int = Interrupts::default();
        let mut sched = EventSchedule::default();

        run_cycles(&mut timers, &mut int, 1234);
        assert_eq!(timers.read(0x20, &mut sched, &mut int), 1234);
    }

    #[test]
    fn target_irq_and_reset() {
        let mut timers = Timers::default();
        let mut int = Interrupts::default();
        let mut sched = EventSchedule::default();

        // timer 2, sysclock, reset on target, IRQ on target
        timers.write(0x28, 100, &mut sched, &mut int); // target
        timers.write(0x24, 0x8 | 0x10, &mut sched, &mut int); // mode

        run_cycles(&mut timers, &mut int, 100);
        assert_eq!(int.read_stat() & 0x40, 0x40);

        // counter wrapped back to 0 and the reached latch reads once
        let mode = timers.read(0x24, &mut sched, &mut int);
        assert_ne!(mode & 0x800, 0);
        let mode = timers.read(0x24, &mut sched, &mut int);
        assert_eq!(mode & 0x800, 0);
        assert!(timers.read(0x20, &mut sched, &mut int) < 100);
    }

    #[test]
    fn one_shot_fires_once_until_mode_rewrite() {
        let mut timers = Timers::default();
        let mut int = Interrupts::default();
        let mut sched = EventSchedule::default();

        timers.write(0x28, 10, &mut sched, &mut int);
        timers.write(0x24, 0x8 | 0x10, &mut sched, &mut int); // one-shot is bit6==0

        run_cycles(&mut timers, &mut int, 10);
        assert_eq!(int.read_stat() & 0x40, 0x40);
        int.ack(0);

        run_cycles(&mut timers, &mut int, 50);
        assert_eq!(int.read_stat() & 0x40, 0);

        // mode rewrite re-arms
        timers.write(0x24, 0x8 | 0x10, &mut sched, &mut int);
        run_cycles(&mut timers, &mut int, 10);
        assert_eq!(int.read_stat() & 0x40, 0x40);
    }

    #[test]
    fn div8_source_prescales() {
        let mut timers = Timers::default();
        let mut int = Interrupts::default();
        let mut sched = EventSchedule::default();

        timers.write(0x24, 2 << 8, &mut sched, &mut int); // source = sysclock/8

        run_cycles(&mut timers, &mut int, 800);
        assert_eq!(timers.read(0x20, &mut sched, &mut int), 100);
    }

    #[test]
    fn hblank_source_ticks_once_per_hblank() {
        let mut timers = Timers::default();
        let mut int = Interrupts::default();
        let mut sched = EventSchedule::default();

        timers.write(0x14, 1 << 8, &mut sched, &mut int); // timer1 source = hblank
        assert!(timers.hblank_signal_wanted());

        for _ in 0..263 {
            timers.hblank_in(&mut sched, &mut int);
        }
        assert_eq!(timers.read(0x10, &mut sched, &mut int), 263);
    }

    #[test]
    fn sync_mode_pause_during_blank() {
        let mut timers = Timers::default();
        let mut int = Interrupts::default();
        let mut sched = EventSchedule::default();

        // timer 1, sync enabled, mode 0 (pause during vblank)
        timers.write(0x14, 0x1, &mut sched, &mut int);

        run_cycles(&mut timers, &mut int, 100);
        timers.vblank_in(&mut sched, &mut int);
        run_cycles(&mut timers, &mut int, 100);
        timers.vblank_out(&mut sched, &mut int);
        run_cycles(&mut timers, &mut int, 100);

        assert_eq!(timers.read(0x10, &mut sched, &mut int), 200);
    }
}
