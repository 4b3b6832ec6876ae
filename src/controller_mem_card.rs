use std::collections::VecDeque;

use crate::frontend::Frontend;
use crate::memory::interrupts::{Interrupt, Interrupts};
use crate::memory::EventSchedule;
use crate::PsxError;

/// Cycles to shift one byte out at the usual 0x88 baud reload; used until
/// the guest programs JOY_BAUD itself.
const TRANSFER_CC: u32 = 1088;
/// Delay between a byte finishing and the device's /ACK pulse.
const ACK_CC: u32 = 100;

pub const MEM_CARD_SIZE: usize = 128 * 1024;

bitflags::bitflags! {
    #[derive(Default, Debug, Clone, Copy)]
    struct JoyControl: u16 {
        const TX_ENABLE      = 1 << 0;
        const SELECT         = 1 << 1;
        const RX_ENABLE      = 1 << 2;
        const ACKNOWLEDGE    = 1 << 4;
        const RESET          = 1 << 6;
        const ACK_INT_ENABLE = 1 << 12;
        const SLOT_2         = 1 << 13;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Target {
    None,
    Pad,
    MemCard,
}

#[derive(Debug, Clone, Copy)]
enum XferState {
    Idle,
    Shifting { cc_left: u32, tx: u8 },
    AckWait { cc_left: u32 },
}

/// The serial port that talks to pads and memory cards.
///
/// The full card protocol is collaborator territory; what lives here is the
/// JOY register file, the baud-paced byte exchange, the /ACK-driven IRQ7 and
/// the digital pad handshake answered from `Frontend::controller_state`.
pub struct ControllerAndMemCard {
    ctrl: JoyControl,
    mode: u16,
    baud: u16,
    rx_fifo: VecDeque<u8>,
    state: XferState,
    irq: bool,
    /// low while the device is pulling /ACK
    ack_level: bool,

    target: Target,
    seq: u8,
    /// buttons captured when the exchange addressed the pad
    buttons: u16,

    mem_cards: [Option<Vec<u8>>; 2],

    cc_used: u32,
}

impl Default for ControllerAndMemCard {
    fn default() -> Self {
        Self {
            ctrl: JoyControl::default(),
            mode: 0,
            baud: 0,
            rx_fifo: VecDeque::new(),
            state: XferState::Idle,
            irq: false,
            ack_level: false,
            target: Target::None,
            seq: 0,
            buttons: 0,
            mem_cards: [None, None],
            cc_used: 0,
        }
    }
}

impl ControllerAndMemCard {
    pub(crate) fn reset(&mut self) {
        let cards = std::mem::take(&mut self.mem_cards);
        *self = Self {
            mem_cards: cards,
            ..Self::default()
        };
    }

    pub(crate) fn plug_mem_card(&mut self, slot: usize, data: Option<Vec<u8>>) -> Result<(), PsxError> {
        if let Some(ref d) = data {
            if d.len() != MEM_CARD_SIZE {
                return Err(PsxError::InvalidMemCardSize);
            }
        }
        self.mem_cards[slot & 1] = data;
        Ok(())
    }

    pub(crate) fn take_mem_card(&mut self, slot: usize) -> Option<Vec<u8>> {
        self.mem_cards[slot & 1].take()
    }

    fn slot(&self) -> usize {
        self.ctrl.intersects(JoyControl::SLOT_2) as usize
    }

    /// Process one exchanged byte. Returns `(rx, ack)`.
    fn exchange(&mut self, tx: u8, frontend: &dyn Frontend) -> (u8, bool) {
        if self.target == Target::None && self.seq == 0 {
            match tx {
                0x01 => {
                    self.target = Target::Pad;
                    self.seq = 1;
                    let connected = frontend.controller_state(self.slot());
                    return match connected {
                        Some(state) => {
                            self.buttons = state.buttons.bits();
                            (0xFF, true)
                        }
                        None => {
                            self.target = Target::None;
                            (0xFF, false)
                        }
                    };
                }
                0x81 => {
                    self.target = Target::MemCard;
                    self.seq = 1;
                    if self.mem_cards[self.slot()].is_some() {
                        log::warn!(
                            "memory card in slot {} addressed; card protocol is stubbed",
                            self.slot()
                        );
                    }
                    // no /ACK: the stub card never answers
                    self.target = Target::None;
                    return (0xFF, false);
                }
                _ => {
                    log::warn!("serial port: unknown device address {:02X}", tx);
                    return (0xFF, false);
                }
            }
        }

        match self.target {
            Target::Pad => {
                let seq = self.seq;
                self.seq += 1;
                match seq {
                    1 => {
                        if tx != 0x42 {
                            log::warn!("pad: unsupported command {:02X}", tx);
                        }
                        // digital pad id
                        (0x41, true)
                    }
                    2 => (0x5A, true),
                    // switches are active-low on the wire
                    3 => ((!self.buttons) as u8, true),
                    4 => {
                        self.target = Target::None;
                        self.seq = 0;
                        (((!self.buttons) >> 8) as u8, false)
                    }
                    _ => (0xFF, false),
                }
            }
            _ => (0xFF, false),
        }
    }

    /// 8 bits at the programmed baud reload.
    fn transfer_cc(&self) -> u32 {
        if self.baud == 0 {
            TRANSFER_CC
        } else {
            self.baud as u32 * 8
        }
    }

    pub(crate) fn tx_data(&mut self, data: u32, sched: &mut EventSchedule) {
        if !self.ctrl.intersects(JoyControl::TX_ENABLE) {
            log::warn!("serial port: TX with transfer disabled");
            return;
        }
        if !matches!(self.state, XferState::Idle) {
            log::warn!("serial port: TX while a byte is already shifting");
        }
        let cc_left = self.transfer_cc();
        self.state = XferState::Shifting {
            cc_left,
            tx: data as u8,
        };
        sched.shrink(cc_left);
    }

    pub(crate) fn rx_data(&mut self) -> u32 {
        self.rx_fifo.pop_front().unwrap_or(0xFF) as u32
    }

    pub(crate) fn stat(&self) -> u32 {
        let tx_ready = matches!(self.state, XferState::Idle);
        (tx_ready as u32)
            | ((!self.rx_fifo.is_empty() as u32) << 1)
            | ((tx_ready as u32) << 2)
            | (((!self.ack_level) as u32) << 7)
            | ((self.irq as u32) << 9)
    }

    pub(crate) fn mode_write(&mut self, data: u16) {
        self.mode = data;
    }

    pub(crate) fn mode_read(&self) -> u16 {
        self.mode
    }

    pub(crate) fn ctrl_write(&mut self, data: u16, int: &mut Interrupts) {
        self.ctrl = JoyControl::from_bits_truncate(data);

        if self.ctrl.intersects(JoyControl::ACKNOWLEDGE) {
            self.irq = false;
            int.interruption(Interrupt::CONTROLLER_AND_MEMCARD, false);
            self.ctrl.remove(JoyControl::ACKNOWLEDGE);
        }
        if self.ctrl.intersects(JoyControl::RESET) {
            self.rx_fifo.clear();
            self.state = XferState::Idle;
            self.irq = false;
            int.interruption(Interrupt::CONTROLLER_AND_MEMCARD, false);
            self.ctrl = JoyControl::default();
        }
        if !self.ctrl.intersects(JoyControl::SELECT) {
            // deselect ends the session
            self.target = Target::None;
            self.seq = 0;
        }
    }

    pub(crate) fn ctrl_read(&self) -> u16 {
        self.ctrl.bits()
    }

    pub(crate) fn baud_write(&mut self, data: u16) {
        self.baud = data;
    }

    pub(crate) fn baud_read(&self) -> u16 {
        self.baud
    }

    pub(crate) fn end_iter(
        &mut self,
        sched: &mut EventSchedule,
        int: &mut Interrupts,
        frontend: &dyn Frontend,
    ) {
        let mut cc = sched.clock.wrapping_sub(self.cc_used);
        self.cc_used = sched.clock;

        while cc > 0 {
            match self.state {
                XferState::Idle => break,
                XferState::Shifting { cc_left, tx } => {
                    if cc_left > cc {
                        self.state = XferState::Shifting {
                            cc_left: cc_left - cc,
                            tx,
                        };
                        break;
                    }
                    cc -= cc_left;
                    let (rx, ack) = self.exchange(tx, frontend);
                    if self.rx_fifo.len() < 8 {
                        self.rx_fifo.push_back(rx);
                    }
                    if ack {
                        self.ack_level = true;
                        self.state = XferState::AckWait { cc_left: ACK_CC };
                    } else {
                        self.state = XferState::Idle;
                    }
                }
                XferState::AckWait { cc_left } => {
                    if cc_left > cc {
                        self.state = XferState::AckWait { cc_left: cc_left - cc };
                        break;
                    }
                    cc -= cc_left;
                    self.ack_level = false;
                    if self.ctrl.intersects(JoyControl::ACK_INT_ENABLE) && !self.irq {
                        self.irq = true;
                        int.interruption(Interrupt::CONTROLLER_AND_MEMCARD, true);
                    }
                    self.state = XferState::Idle;
                }
            }
        }

        self.cc_used = 0;
        sched.shrink(self.next_event_cc());
    }

    pub(crate) fn next_event_cc(&self) -> u32 {
        match self.state {
            XferState::Idle => 0x0FFF_FFFF,
            XferState::Shifting { cc_left, .. } => cc_left,
            XferState::AckWait { cc_left } => cc_left,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::{Buttons, ControllerState};

    struct PadFrontend(Buttons);

    impl Frontend for PadFrontend {
        fn controller_state(&self, slot: usize) -> Option<ControllerState> {
            (slot == 0).then(|| ControllerState { buttons: self.0 })
        }
    }

    fn run(joy: &mut ControllerAndMemCard, int: &mut Interrupts, fe: &dyn Frontend, cycles: u32) {
        let mut sched = EventSchedule::default();
        sched.clock = cycles;
        joy.end_iter(&mut sched, int, fe);
    }

    fn exchange_byte(
        joy: &mut ControllerAndMemCard,
        int: &mut Interrupts,
        fe: &dyn Frontend,
        tx: u8,
    ) -> u8 {
        let mut sched = EventSchedule::default();
        joy.tx_data(tx as u32, &mut sched);
        run(joy, int, fe, TRANSFER_CC + ACK_CC);
        joy.rx_data() as u8
    }

    #[test]
    fn digital_pad_handshake() {
        let mut joy = ControllerAndMemCard::default();
        let mut int = Interrupts::default();
        let fe = PadFrontend(Buttons::CROSS | Buttons::START);

        joy.ctrl_write(0x1003, &mut int); // TX enable + select + ack-int

        assert_eq!(exchange_byte(&mut joy, &mut int, &fe, 0x01), 0xFF);
        assert_eq!(exchange_byte(&mut joy, &mut int, &fe, 0x42), 0x41);
        assert_eq!(exchange_byte(&mut joy, &mut int, &fe, 0x00), 0x5A);

        let wire = (Buttons::CROSS | Buttons::START).bits();
        assert_eq!(exchange_byte(&mut joy, &mut int, &fe, 0x00), (!wire) as u8);
        assert_eq!(
            exchange_byte(&mut joy, &mut int, &fe, 0x00),
            ((!wire) >> 8) as u8
        );
    }

    #[test]
    fn ack_raises_irq7_and_ctrl_acks_it() {
        let mut joy = ControllerAndMemCard::default();
        let mut int = Interrupts::default();
        let fe = PadFrontend(Buttons::empty());

        joy.ctrl_write(0x1003, &mut int);
        exchange_byte(&mut joy, &mut int, &fe, 0x01);
        assert_ne!(int.read_stat() & 0x80, 0);
        assert_ne!(joy.stat() & 0x200, 0);

        joy.ctrl_write(0x1003 | 0x10, &mut int);
        int.ack(0);
        assert_eq!(joy.stat() & 0x200, 0);
        assert_eq!(int.read_stat() & 0x80, 0);
    }

    #[test]
    fn unplugged_slot_never_acks() {
        let mut joy = ControllerAndMemCard::default();
        let mut int = Interrupts::default();
        struct NoPad;
        impl Frontend for NoPad {}
        let fe = NoPad;

        joy.ctrl_write(0x1003, &mut int);
        assert_eq!(exchange_byte(&mut joy, &mut int, &fe, 0x01), 0xFF);
        assert_eq!(int.read_stat() & 0x80, 0);
    }

    #[test]
    fn mem_card_size_is_checked() {
        let mut joy = ControllerAndMemCard::default();
        assert!(joy.plug_mem_card(0, Some(vec![0; 123])).is_err());
        assert!(joy.plug_mem_card(0, Some(vec![0; MEM_CARD_SIZE])).is_ok());
        assert!(joy.take_mem_card(0).is_some());
    }
}
