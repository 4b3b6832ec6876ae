bitflags::bitflags! {
    /// Digital pad button bitmap, in the wire order of the pad's switch
    /// halfwords. A set bit means the button is pressed.
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Buttons: u16 {
        const SELECT   = 0x0001;
        const START    = 0x0008;
        const UP       = 0x0010;
        const RIGHT    = 0x0020;
        const DOWN     = 0x0040;
        const LEFT     = 0x0080;
        const L2       = 0x0100;
        const R2       = 0x0200;
        const L1       = 0x0400;
        const R1       = 0x0800;
        const TRIANGLE = 0x1000;
        const CIRCLE   = 0x2000;
        const CROSS    = 0x4000;
        const SQUARE   = 0x8000;
    }
}

#[derive(Default, Debug, Clone, Copy)]
pub struct ControllerState {
    pub buttons: Buttons,
}

/// What the host answered to the per-iteration signal poll.
#[derive(Default, Debug, Clone, Copy)]
pub struct Signals {
    pub stop: bool,
    pub reset: bool,
}

/// One event recorded while running in trace mode (see [`crate::Psx::trace`]).
///
/// Events are delivered in the order they were generated within the traced
/// step, CPU events first.
#[derive(Debug, Clone, Copy)]
pub enum TraceEvent {
    /// An instruction is about to be dispatched.
    CpuInstruction { addr: u32, word: u32 },
    /// A data access went through the physical bus.
    MemAccess {
        write: bool,
        addr: u32,
        data: u32,
        bits: u8,
        error: bool,
    },
    /// `I_STAT` changed because a source line rose, or was acknowledged.
    Interrupt {
        is_ack: bool,
        old_stat: u16,
        new_stat: u16,
        mask: u16,
    },
    /// A DMA channel moved a word block.
    DmaTransfer { channel: usize, to_ram: bool, addr: u32 },
    /// The GPU executed a queued command (first word of it).
    GpuCommand { word: u32 },
}

/// The host side of the emulator.
///
/// All methods take `&self`; hosts that need mutability keep it interior.
/// Everything has a default implementation so a unit struct is a valid
/// headless frontend.
pub trait Frontend {
    /// Polled once per [`crate::Psx::iter`] call, after the slice ran.
    fn check_signals(&self) -> Signals {
        Signals::default()
    }

    /// 256 stereo frames (512 interleaved i16 samples) at 44100 Hz.
    fn play_sound(&self, _samples: &[i16]) {}

    /// Current state of the pad in `slot` (0 or 1), `None` if nothing is
    /// plugged in.
    fn controller_state(&self, _slot: usize) -> Option<ControllerState> {
        None
    }

    /// Receives every [`TraceEvent`] generated by [`crate::Psx::trace`].
    fn trace_event(&self, _event: &TraceEvent) {}
}

/// A frontend that answers nothing; useful for tests and benchmarks.
pub struct HeadlessFrontend;

impl Frontend for HeadlessFrontend {}
