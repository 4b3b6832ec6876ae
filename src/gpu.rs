mod command;
mod renderer;

pub use renderer::{
    FrameGeometry, RenderStats, Renderer, RendererArgs, StatsRenderer, TextureMode, Transparency,
    VertexInfo, VRAM_HEIGHT, VRAM_SIZE, VRAM_WIDTH,
};

use crate::frontend::TraceEvent;
use crate::memory::interrupts::{Interrupt, Interrupts};
use crate::memory::EventSchedule;
use crate::timers::Timers;

/// The real fifo is 16 words deep; like the reference model this uses 32 so
/// multi-word commands always fit in one piece.
const FIFO_SIZE: usize = 32;

/// GPU cycles consumed per pixel for each horizontal resolution.
const CYCLES_PER_PIXEL: [i32; 5] = [10, 8, 5, 4, 7];

/// Visible lines and first visible line per TV mode, used to normalize the
/// display geometry handed to the renderer.
const MAX_LINES: [i32; 2] = [240, 288];
const FIRST_LINE_VISIBLE: [i32; 2] = [16, 20];

/// Render costs are modeled in rasterizer clocks that run at twice the
/// system clock; this converts them to GPU cycles.
const RENDER_CC_CORRECTION: f64 = (11.0 / 7.0) / 2.0;

const POLYLINE_TERMINATORS: [u32; 2] = [0x5555_5555, 0x5000_5000];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HRes {
    H256 = 0,
    H320 = 1,
    H512 = 2,
    H640 = 3,
    H368 = 4,
}

impl HRes {
    fn cycles_per_pixel(self) -> i32 {
        CYCLES_PER_PIXEL[self as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VRes {
    V240 = 0,
    V480 = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TvMode {
    Ntsc = 0,
    Pal = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferMode {
    Off = 0,
    Fifo = 1,
    DmaWrite = 2,
    DmaRead = 3,
}

struct DisplayConfig {
    enabled: bool,
    irq_enabled: bool,
    transfer_mode: TransferMode,
    /// origin of the displayed region inside VRAM
    x: i32,
    y: i32,
    /// horizontal display range, in GPU cycles within a scanline
    x1: u32,
    x2: u32,
    screen_x0: f64,
    screen_x1: f64,
    /// vertical display range, in scanlines
    y1: u32,
    y2: u32,
    screen_y0: f64,
    screen_y1: f64,
    hres: HRes,
    fb_line_width: i32,
    vres: VRes,
    vres_original: u32,
    vertical_interlace: bool,
    interlace_field: u32,
    color_depth_24bit: bool,
    reverseflag: bool,
    tv_mode: TvMode,
    texture_disable: bool,
}

/// Byte-by-byte GP0 decode state. The discriminant order matters: every
/// state from `PolySlineWaitVn` on keeps the command unit busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Gp0State {
    WaitCmd = 0,
    WaitWords,
    PolyMlineWaitV1,
    PolyMlineWaitV2,
    PolyMlineWaitVn,
    PolySlineWaitV1,
    PolySlineWaitC2,
    PolySlineWaitV2,
    PolySlineWaitCn,
    PolySlineWaitVn,
    WriteCopyWaitXy,
    WriteCopyWaitSize,
    WriteCopyData,
    ReadCopyWaitXy,
    ReadCopyWaitSize,
    ReadCopyData,
}

struct RenderState {
    state: Gp0State,
    /// words still expected for the command being collected
    nwords: u32,
    args: RendererArgs,
    def_args: RendererArgs,
    drawing_da_enabled: bool,
    texture_disabled: bool,
    off_x: i32,
    off_y: i32,
    e2_info: u32,
    e3_info: u32,
    e4_info: u32,
    e5_info: u32,
    is_pol4: bool,
    is_poly: bool,
    /// -1 = variable size rectangle, read from the fifo
    rec_w: i32,
    rec_h: i32,
    min_x: i32,
    max_x: i32,
    min_y: i32,
    max_y: i32,
    copy_mode_write: bool,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            state: Gp0State::WaitCmd,
            nwords: 0,
            args: RendererArgs::default(),
            def_args: RendererArgs::default(),
            drawing_da_enabled: false,
            texture_disabled: false,
            off_x: 0,
            off_y: 0,
            e2_info: 0,
            e3_info: 0,
            e4_info: 0,
            e5_info: 0,
            is_pol4: false,
            is_poly: false,
            rec_w: 0,
            rec_h: 0,
            min_x: 0,
            max_x: 0,
            min_y: 0,
            max_y: 0,
            copy_mode_write: false,
        }
    }
}

/// Cursor of an in-flight VRAM copy (either direction).
#[derive(Default)]
struct CopyState {
    x: i32,
    r: i32,
    c: i32,
    end_r: i32,
    end_c: i32,
}

#[derive(Default)]
struct ReadState {
    data: u32,
    vram_transfer: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FifoState {
    WaitCmd,
    PolyMline,
    PolySline,
    ReadDataCopy,
    WriteDataCopy,
}

struct Fifo {
    v: [u32; FIFO_SIZE],
    p: usize,
    n: usize,
    /// completed commands waiting for the unit to go idle
    nactions: u32,
    state: FifoState,
    busy: bool,
}

impl Default for Fifo {
    fn default() -> Self {
        Self {
            v: [0; FIFO_SIZE],
            p: 0,
            n: 0,
            nactions: 0,
            state: FifoState::WaitCmd,
            busy: false,
        }
    }
}

impl Fifo {
    fn push(&mut self, data: u32) {
        if self.n == FIFO_SIZE {
            log::warn!("GPU fifo full, dropping {:08X}", data);
            return;
        }
        self.v[(self.p + self.n) % FIFO_SIZE] = data;
        self.n += 1;
    }

    fn pop(&mut self) -> u32 {
        let val = self.v[self.p];
        self.p = (self.p + 1) % FIFO_SIZE;
        self.n -= 1;
        val
    }
}

/// Internal clock bookkeeping. `cc` counts in 1/11 CPU-cycle ticks; 7 ticks
/// make one GPU cycle (GPU clock = 7/11 x CPU clock x 11... i.e. 11/7 CPU).
/// All `cc_to_*` countdowns are in the same tick domain.
struct GpuTiming {
    cc: i32,
    cc_used: u32,
    enabled_vblank: bool,
    enabled_hblank: bool,
    signal_hblank: bool,
    cc_to_vblank_in: i32,
    cc_to_vblank_out: i32,
    cc_to_hblank_in: i32,
    cc_to_hblank_out: i32,
    cc_to_end_frame: i32,
    cc_to_event: i32,
    /// remaining busy time of the executing command
    cc_to_idle: i32,
    line: i32,
    ccline: i32,
    ccperline: i32,
    nlines: i32,
    update_timing_event: bool,
}

impl Default for GpuTiming {
    fn default() -> Self {
        Self {
            cc: 0,
            cc_used: 0,
            enabled_vblank: false,
            enabled_hblank: false,
            signal_hblank: false,
            cc_to_vblank_in: 0,
            cc_to_vblank_out: 0,
            cc_to_hblank_in: 0,
            cc_to_hblank_out: 0,
            cc_to_end_frame: 0,
            cc_to_event: 0,
            cc_to_idle: 0,
            line: 0,
            ccline: 0,
            ccperline: 3413,
            nlines: 263,
            update_timing_event: true,
        }
    }
}

/// The 2D graphics processor: GP0/GP1 decode, the command fifo with its
/// busy model, VRAM, and the display timing that generates HBlank/VBlank
/// for the timers and the frame flush for the renderer.
pub struct Gpu {
    renderer: Box<dyn Renderer>,
    vram: Vec<u16>,
    renderer_locked: bool,

    display: DisplayConfig,
    render: RenderState,
    copy: CopyState,
    read: ReadState,
    fifo: Fifo,
    timing: GpuTiming,

    dma_sync_request: bool,
    /// set when a parked DMA2 transfer may proceed again
    dma_activation: bool,

    trace: bool,
    trace_buf: Vec<TraceEvent>,
}

impl Gpu {
    pub(crate) fn new(renderer: Box<dyn Renderer>) -> Self {
        let mut s = Self {
            renderer,
            vram: vec![0; VRAM_SIZE],
            renderer_locked: true,
            display: DisplayConfig {
                enabled: false,
                irq_enabled: false,
                transfer_mode: TransferMode::Off,
                x: 0,
                y: 0,
                x1: 0,
                x2: 1,
                screen_x0: 0.0,
                screen_x1: 1.0,
                y1: 0,
                y2: 1,
                screen_y0: 0.0,
                screen_y1: 1.0,
                hres: HRes::H256,
                fb_line_width: 256,
                vres: VRes::V240,
                vres_original: 0,
                vertical_interlace: false,
                interlace_field: 0,
                color_depth_24bit: false,
                reverseflag: false,
                tv_mode: TvMode::Ntsc,
                texture_disable: false,
            },
            render: RenderState::default(),
            copy: CopyState::default(),
            read: ReadState::default(),
            fifo: Fifo::default(),
            timing: GpuTiming::default(),
            dma_sync_request: false,
            dma_activation: false,
            trace: false,
            trace_buf: Vec::new(),
        };
        s.unlock_renderer();
        s.reset_render();
        s.update_timing();
        s
    }

    /// Power-on / soft-reset state; keeps the renderer, clears everything
    /// else including VRAM.
    pub(crate) fn reset(&mut self) {
        self.lock_renderer();
        self.vram.iter_mut().for_each(|p| *p = 0);
        self.display.interlace_field = 0;
        self.read = ReadState::default();
        self.dma_sync_request = false;
        self.dma_activation = false;
        self.timing = GpuTiming::default();
        self.reset_cmd();
        self.unlock_renderer();
    }

    fn lock_renderer(&mut self) {
        if !self.renderer_locked {
            self.renderer_locked = true;
            self.renderer.lock(&mut self.vram);
        }
    }

    fn unlock_renderer(&mut self) {
        if self.renderer_locked {
            self.renderer_locked = false;
            self.renderer.unlock(&mut self.vram);
        }
    }

    /// Direct view of VRAM for the host/debugger; hands the buffer back to
    /// the GPU side first.
    pub fn vram(&mut self) -> &[u16] {
        self.lock_renderer();
        &self.vram
    }

    pub(crate) fn set_trace_mode(&mut self, enable: bool) {
        self.trace = enable;
    }

    pub(crate) fn take_trace(&mut self) -> Vec<TraceEvent> {
        std::mem::take(&mut self.trace_buf)
    }

    /// True while a parked DMA2 request got re-accepted; the bus forwards
    /// this to the DMA controller.
    pub(crate) fn take_dma_activation(&mut self) -> bool {
        std::mem::take(&mut self.dma_activation)
    }

    // ----- timing -----

    fn update_timing_event_values(&mut self) {
        self.timing.cc_to_event = 0;
        if self.fifo.busy {
            self.timing.cc_to_event = self.timing.cc_to_idle;
        }
        if self.timing.signal_hblank && self.timing.enabled_hblank {
            if self.timing.cc_to_event == 0 || self.timing.cc_to_hblank_in < self.timing.cc_to_event
            {
                self.timing.cc_to_event = self.timing.cc_to_hblank_in;
            }
            if self.timing.cc_to_hblank_out < self.timing.cc_to_event {
                self.timing.cc_to_event = self.timing.cc_to_hblank_out;
            }
        }
        if self.timing.enabled_vblank {
            if self.timing.cc_to_event == 0 || self.timing.cc_to_vblank_in < self.timing.cc_to_event
            {
                self.timing.cc_to_event = self.timing.cc_to_vblank_in;
            }
            if self.timing.cc_to_vblank_out < self.timing.cc_to_event {
                self.timing.cc_to_event = self.timing.cc_to_vblank_out;
            }
        } else if self.timing.cc_to_event == 0
            || self.timing.cc_to_end_frame < self.timing.cc_to_event
        {
            self.timing.cc_to_event = self.timing.cc_to_end_frame;
        }
    }

    fn update_timing_event(&mut self, sched: &mut EventSchedule) {
        if !self.timing.update_timing_event {
            return;
        }
        self.update_timing_event_values();
        if let Some(cc) = self.next_event_cc() {
            sched.shrink(cc);
        }
    }

    fn update_timing_vblank(&mut self) {
        let t = &mut self.timing;
        let d = &self.display;
        if d.y1 >= d.y2 || d.y2 >= t.nlines as u32 {
            t.enabled_vblank = false;
        } else {
            t.enabled_vblank = true;
            // the blanking window tracks the visible range, not a fixed
            // line count
            let gpucc = if t.line as u32 >= d.y2 {
                ((t.nlines - t.line) + d.y2 as i32) * t.ccperline - t.ccline
            } else {
                (d.y2 as i32 - t.line) * t.ccperline - t.ccline
            };
            t.cc_to_vblank_in = gpucc * 7;

            let gpucc = if t.line as u32 >= d.y1 {
                ((t.nlines - t.line) + d.y1 as i32) * t.ccperline - t.ccline
            } else {
                (d.y1 as i32 - t.line) * t.ccperline - t.ccline
            };
            t.cc_to_vblank_out = gpucc * 7;
        }
    }

    fn update_timing_hblank(&mut self) {
        let t = &mut self.timing;
        let d = &self.display;
        if !t.signal_hblank || d.x1 >= d.x2 || d.x2 >= (t.ccperline - 1) as u32 {
            t.enabled_hblank = false;
        } else {
            t.enabled_hblank = true;
            // blanking outside [x1, x2], generated on every line
            let gpucc = if (t.ccline as u32) < d.x2 {
                d.x2 as i32 + 1 - t.ccline
            } else {
                (d.x2 as i32 + 1) + (t.ccperline - t.ccline)
            };
            t.cc_to_hblank_in = gpucc * 7;

            let gpucc = if t.ccline as u32 >= d.x1 {
                (t.ccperline - t.ccline) + d.x1 as i32
            } else {
                d.x1 as i32 - t.ccline
            };
            t.cc_to_hblank_out = gpucc * 7;
        }
    }

    fn update_timing_end_frame(&mut self) {
        let t = &mut self.timing;
        let gpucc = (t.nlines - t.line) * t.ccperline - t.ccline;
        t.cc_to_end_frame = gpucc * 7;
    }

    fn update_timing_no_sched(&mut self) {
        match self.display.tv_mode {
            TvMode::Pal => {
                self.timing.nlines = 314;
                self.timing.ccperline = 3406;
            }
            TvMode::Ntsc => {
                self.timing.nlines = 263;
                self.timing.ccperline = 3413;
            }
        }

        if self.timing.ccline >= self.timing.ccperline {
            self.timing.line += self.timing.ccline / self.timing.ccperline;
            self.timing.ccline %= self.timing.ccperline;
        }
        if self.timing.line >= self.timing.nlines {
            self.timing.line %= self.timing.nlines;
        }

        self.update_timing_vblank();
        self.update_timing_hblank();
        self.update_timing_end_frame();
    }

    fn update_timing(&mut self) {
        self.update_timing_no_sched();
        // the schedule-shrink half runs from update_timing_event when a
        // slice is active
        self.update_timing_event_values();
    }

    /// Frame boundary handling for the scanline window `[line_b, line_e)`:
    /// crossing the bottom of the visible range flushes the frame and flips
    /// the interlace field.
    fn run_frame_window(&mut self, line_b: i32, line_e: i32) {
        if (line_b as u32) < self.display.y2 && line_e as u32 >= self.display.y2 {
            self.unlock_renderer();
            let d = &self.display;
            let mut height = ((d.y2 - d.y1) << (d.vres as u32)) as i32;
            if height > 480 {
                height = 480;
            }
            let g = FrameGeometry {
                x: d.x,
                y: d.y,
                width: d.fb_line_width,
                height,
                is_15bit: !d.color_depth_24bit,
                d_x0: d.screen_x0,
                d_x1: d.screen_x1,
                d_y0: d.screen_y0,
                d_y1: d.screen_y1,
            };
            self.renderer.draw(&g);

            if self.display.vertical_interlace {
                self.display.interlace_field ^= 1;
            } else {
                self.display.interlace_field = 0;
            }
        }
    }

    /// Catch the GPU up to the slice clock, firing anything that came due.
    fn clock(&mut self, sched: &mut EventSchedule, int: &mut Interrupts, timers: &mut Timers) {
        let cc = sched.clock.wrapping_sub(self.timing.cc_used);
        if cc > 0 && (cc as i32) > 0 {
            self.timing.cc += 11 * cc as i32;
            self.timing.cc_used += cc;
        }

        let gpucc = self.timing.cc / 7;
        let ccused = gpucc * 7;
        self.timing.cc %= 7;

        self.timing.cc_to_vblank_in -= ccused;
        self.timing.cc_to_vblank_out -= ccused;
        self.timing.cc_to_hblank_in -= ccused;
        self.timing.cc_to_hblank_out -= ccused;
        self.timing.cc_to_end_frame -= ccused;

        // command unit
        if self.fifo.busy {
            self.timing.cc_to_idle -= ccused;
            if self.timing.cc_to_idle <= 0 {
                self.timing.update_timing_event = false;
                self.timing.cc_to_idle = 0;
                self.fifo.busy = false;
                self.run_fifo_cmds(sched, int);
                self.update_dma_sync();
                self.timing.update_timing_event = true;
            }
        }

        // scanline position
        let mut new_line = self.timing.line + gpucc / self.timing.ccperline;
        let mut new_ccline = self.timing.ccline + gpucc % self.timing.ccperline;
        if new_ccline >= self.timing.ccperline {
            new_line += 1;
            new_ccline -= self.timing.ccperline;
        }
        while new_line >= self.timing.nlines {
            let (b, n) = (self.timing.line, self.timing.nlines);
            self.run_frame_window(b, n);
            self.timing.line = 0;
            self.timing.ccline = 0;
            new_line -= self.timing.nlines;
        }
        let b = self.timing.line;
        self.run_frame_window(b, new_line);
        self.timing.line = new_line;
        self.timing.ccline = new_ccline;

        if self.timing.enabled_vblank {
            let mut update = false;
            if self.timing.cc_to_vblank_in <= 0 {
                update = true;
                int.interruption(Interrupt::VBLANK, true);
                timers.vblank_in(sched, int);
            }
            if self.timing.cc_to_vblank_out <= 0 {
                update = true;
                int.interruption(Interrupt::VBLANK, false);
                timers.vblank_out(sched, int);
            }
            if update {
                self.update_timing_vblank();
            }
        }

        if self.timing.enabled_hblank {
            let mut update = false;
            if self.timing.cc_to_hblank_in <= 0 {
                update = true;
                if self.timing.signal_hblank {
                    timers.hblank_in(sched, int);
                }
            }
            if self.timing.cc_to_hblank_out <= 0 {
                update = true;
                if self.timing.signal_hblank {
                    timers.hblank_out(sched, int);
                }
            }
            if update {
                self.update_timing_hblank();
            }
        }

        if self.timing.cc_to_end_frame <= 0 {
            self.update_timing_end_frame();
        }

        self.update_timing_event(sched);
    }

    pub(crate) fn end_iter(
        &mut self,
        sched: &mut EventSchedule,
        int: &mut Interrupts,
        timers: &mut Timers,
    ) {
        let cc = sched.clock.wrapping_sub(self.timing.cc_used);
        if cc > 0 && (cc as i32) > 0 {
            self.timing.cc += 11 * cc as i32;
            self.timing.cc_used += cc;
            if self.timing.cc_to_event != 0 && self.timing.cc >= self.timing.cc_to_event {
                self.clock(sched, int, timers);
            }
        }
        self.timing.cc_used = 0;
        if let Some(cc) = self.next_event_cc() {
            sched.shrink(cc);
        }
    }

    /// CPU cycles until the next observable GPU event, `None` when nothing
    /// is scheduled.
    pub(crate) fn next_event_cc(&self) -> Option<u32> {
        if self.timing.cc_to_event != 0 {
            let cc = (self.timing.cc_to_event - self.timing.cc).max(0);
            Some((cc / 11 + (cc % 11 != 0) as i32) as u32)
        } else {
            None
        }
    }

    /// The timers tell the GPU whether anyone is listening to HBlank edges.
    pub(crate) fn signal_hblank(
        &mut self,
        enable: bool,
        sched: &mut EventSchedule,
        int: &mut Interrupts,
        timers: &mut Timers,
    ) {
        self.clock(sched, int, timers);
        self.timing.signal_hblank = enable;
        self.update_timing();
        self.update_timing_event(sched);
    }

    // ----- display configuration (GP1 side) -----

    fn enable_display(&mut self, enable: bool) {
        self.display.enabled = enable;
        self.renderer.enable_display(enable);
    }

    fn update_screen_x0_x1(&mut self) {
        // visible window width in GPU cycles on a 4:3 screen, with the
        // nominal left border
        const CC_VISIBLE: f64 = 2800.0;
        let d = &mut self.display;
        d.fb_line_width =
            (((d.x2 - d.x1) as i32 / d.hres.cycles_per_pixel()) + 2) & !3;
        if d.fb_line_width < 0 {
            d.fb_line_width = 1;
        }
        let off = if d.tv_mode == TvMode::Pal { 560.0 } else { 520.0 };
        d.screen_x0 = (d.x1 as f64 - off) / CC_VISIBLE;
        d.screen_x1 = (d.x2 as f64 - off) / CC_VISIBLE;
    }

    fn update_screen_y0_y1(&mut self) {
        let d = &mut self.display;
        let mheight = (MAX_LINES[d.tv_mode as usize] - 1) as f64;
        let firstline = FIRST_LINE_VISIBLE[d.tv_mode as usize] as f64;
        d.screen_y0 = (d.y1 as f64 - firstline) / mheight;
        d.screen_y1 = (d.y2 as f64 - firstline - 1.0) / mheight;
        if d.screen_y1 < 0.0 {
            d.screen_y1 = 0.0;
        }
    }

    fn set_x1_x2(&mut self, cmd: u32) {
        let x1 = cmd & 0xFFF;
        let x2 = (cmd >> 12) & 0xFFF;
        if x1 >= x2 {
            log::warn!("GPU: X1 ({}) >= X2 ({}), range ignored", x1, x2);
            return;
        }
        self.display.x1 = x1;
        self.display.x2 = x2;
        self.update_screen_x0_x1();
    }

    fn set_x1_x2_cmd(&mut self, cmd: u32, sched: &mut EventSchedule) {
        self.set_x1_x2(cmd);
        self.update_timing_hblank();
        self.update_timing_event(sched);
    }

    fn set_y1_y2(&mut self, cmd: u32) {
        let y1 = cmd & 0x3FF;
        let y2 = (cmd >> 10) & 0x3FF;
        if y1 >= y2 {
            log::warn!("GPU: Y1 ({}) >= Y2 ({}), range ignored", y1, y2);
            return;
        }
        self.display.y1 = y1;
        self.display.y2 = y2;
        self.update_screen_y0_y1();
    }

    fn set_y1_y2_cmd(&mut self, cmd: u32, sched: &mut EventSchedule) {
        self.set_y1_y2(cmd);
        self.update_timing_vblank();
        self.update_timing_event(sched);
    }

    fn set_display_mode(
        &mut self,
        cmd: u32,
        sched: &mut EventSchedule,
        int: &mut Interrupts,
        timers: &mut Timers,
    ) {
        let d = &mut self.display;
        d.tv_mode = if cmd & 0x8 != 0 { TvMode::Pal } else { TvMode::Ntsc };
        d.color_depth_24bit = cmd & 0x10 != 0;
        d.vertical_interlace = cmd & 0x20 != 0;
        d.reverseflag = cmd & 0x80 != 0;
        d.vres_original = (cmd & 0x4) >> 2;
        d.vres = if d.vertical_interlace && d.vres_original != 0 {
            VRes::V480
        } else {
            VRes::V240
        };
        d.hres = if cmd & 0x40 != 0 {
            HRes::H368
        } else {
            match cmd & 0x3 {
                0 => HRes::H256,
                1 => HRes::H320,
                2 => HRes::H512,
                _ => HRes::H640,
            }
        };
        timers.set_dot_gpucc(d.hres.cycles_per_pixel(), sched, int);

        self.update_screen_x0_x1();
        self.update_screen_y0_y1();
        self.update_timing();
        self.update_timing_event(sched);
    }

    fn reset_render(&mut self) {
        // rendering attributes E1..E6 all zero
        self.set_draw_mode(0xE100_0000);
        self.set_texture_window(0xE200_0000);
        self.set_draw_area_top_left(0xE300_0000);
        self.set_draw_area_bottom_right(0xE400_0000);
        self.set_drawing_offset(0xE500_0000);
        self.set_mask_bit(0xE600_0000);
        self.render.state = Gp0State::WaitCmd;
    }

    fn reset_cmd_buffer(&mut self, sched: &mut EventSchedule) {
        self.render.state = Gp0State::WaitCmd;
        self.render.nwords = 0;
        self.fifo.p = 0;
        self.fifo.n = 0;
        self.fifo.nactions = 0;
        self.fifo.state = FifoState::WaitCmd;
        self.fifo.busy = false;
        self.timing.cc_to_idle = 0;
        self.update_dma_sync();
        self.update_timing_event(sched);
    }

    fn reset_cmd(&mut self) {
        self.display.irq_enabled = false;
        self.enable_display(false);
        self.display.transfer_mode = TransferMode::Off;
        self.display.x = 0;
        self.display.y = 0;
        self.set_x1_x2(0x200 | ((0x200 + 256 * 10) << 12));
        self.set_y1_y2(0x010 | ((0x010 + 240) << 10));
        // display mode 0 without the timer/schedule plumbing: reset callers
        // re-derive timing afterwards
        self.display.tv_mode = TvMode::Ntsc;
        self.display.color_depth_24bit = false;
        self.display.vertical_interlace = false;
        self.display.reverseflag = false;
        self.display.vres_original = 0;
        self.display.vres = VRes::V240;
        self.display.hres = HRes::H256;
        self.update_screen_x0_x1();
        self.update_screen_y0_y1();
        self.update_timing();
        self.reset_render();

        self.render.state = Gp0State::WaitCmd;
        self.render.nwords = 0;
        self.fifo.p = 0;
        self.fifo.n = 0;
        self.fifo.nactions = 0;
        self.fifo.state = FifoState::WaitCmd;
        self.fifo.busy = false;
        self.timing.cc_to_idle = 0;
        self.update_dma_sync();
    }

    fn get_gpu_info(&mut self, cmd: u32) {
        self.read.vram_transfer = false;
        match cmd & 0xF {
            0x2 => self.read.data = self.render.e2_info,
            0x3 => self.read.data = self.render.e3_info,
            0x4 => self.read.data = self.render.e4_info,
            0x5 => self.read.data = self.render.e5_info,
            0x7 => self.read.data = 2, // GPU version
            0x8 => self.read.data = 0,
            // everything else keeps the previous GPUREAD value
            _ => {}
        }
    }

    // ----- DMA2 protocol -----

    /// Can the channel transfer right now; parks the request otherwise.
    fn check_dma_sync(&mut self) -> bool {
        match self.display.transfer_mode {
            TransferMode::Off | TransferMode::Fifo => {
                log::warn!("GPU (DMA2) sync: channel disabled, transfer will be ignored");
                true
            }
            TransferMode::DmaRead => true,
            TransferMode::DmaWrite => !self.fifo.busy,
        }
    }

    fn update_dma_sync(&mut self) {
        if !self.dma_sync_request {
            return;
        }
        if self.check_dma_sync() {
            self.dma_sync_request = false;
            self.dma_activation = true;
        }
    }

    pub(crate) fn dma_sync(&mut self, _nwords: u32) -> bool {
        // deny while a request is already parked
        if self.dma_sync_request {
            return false;
        }
        let ok = self.check_dma_sync();
        if !ok {
            self.dma_sync_request = true;
        }
        ok
    }

    pub(crate) fn dma_write(
        &mut self,
        data: u32,
        sched: &mut EventSchedule,
        int: &mut Interrupts,
        timers: &mut Timers,
    ) {
        if self.display.transfer_mode != TransferMode::DmaWrite {
            log::warn!("GPU (DMA2) write: channel is not in write mode");
            return;
        }
        self.clock(sched, int, timers);
        self.gp0_word(data, sched, int);
    }

    pub(crate) fn dma_read(
        &mut self,
        sched: &mut EventSchedule,
        int: &mut Interrupts,
        timers: &mut Timers,
    ) -> u32 {
        if self.display.transfer_mode != TransferMode::DmaRead {
            log::warn!("GPU (DMA2) read: channel is not in read mode");
            return 0xFF00_FF00;
        }
        self.clock(sched, int, timers);
        self.gpu_read_word()
    }

    // ----- MMIO -----

    pub(crate) fn gp0(
        &mut self,
        cmd: u32,
        sched: &mut EventSchedule,
        int: &mut Interrupts,
        timers: &mut Timers,
    ) {
        self.clock(sched, int, timers);
        self.gp0_word(cmd, sched, int);
        // pushing a word may have freed the fifo
        self.update_dma_sync();
    }

    pub(crate) fn gp1(
        &mut self,
        cmd: u32,
        sched: &mut EventSchedule,
        int: &mut Interrupts,
        timers: &mut Timers,
    ) {
        self.clock(sched, int, timers);

        match (cmd >> 24) & 0x3F {
            0x00 => {
                self.reset_cmd();
                timers.set_dot_gpucc(self.display.hres.cycles_per_pixel(), sched, int);
                self.update_timing_event(sched);
            }
            0x01 => self.reset_cmd_buffer(sched),
            0x02 => {
                self.display.irq_enabled = false;
                int.interruption(Interrupt::GPU, false);
            }
            0x03 => self.enable_display(cmd & 0x1 == 0),
            0x04 => {
                self.display.transfer_mode = match cmd & 0x3 {
                    0 => TransferMode::Off,
                    1 => TransferMode::Fifo,
                    2 => TransferMode::DmaWrite,
                    _ => TransferMode::DmaRead,
                };
                self.update_dma_sync();
            }
            0x05 => {
                self.display.x = (cmd & 0x3FE) as i32;
                self.display.y = ((cmd >> 10) & 0x1FF) as i32;
            }
            0x06 => self.set_x1_x2_cmd(cmd, sched),
            0x07 => self.set_y1_y2_cmd(cmd, sched),
            0x08 => self.set_display_mode(cmd, sched, int, timers),
            0x09 => self.display.texture_disable = cmd & 0x1 != 0,
            0x10..=0x1F => self.get_gpu_info(cmd),
            0x20 => {} // ancient texture disable
            _ => {}
        }
    }

    pub(crate) fn gpu_read(
        &mut self,
        sched: &mut EventSchedule,
        int: &mut Interrupts,
        timers: &mut Timers,
    ) -> u32 {
        self.clock(sched, int, timers);
        self.gpu_read_word()
    }

    fn gpu_read_word(&mut self) -> u32 {
        if self.read.vram_transfer {
            self.copy_vram_to_cpu()
        } else {
            self.read.data
        }
    }

    pub(crate) fn stat(
        &mut self,
        sched: &mut EventSchedule,
        int: &mut Interrupts,
        timers: &mut Timers,
    ) -> u32 {
        self.clock(sched, int, timers);

        let exec_cmd_busy = self.fifo.busy || self.render.state >= Gp0State::PolySlineWaitVn;
        let ready_vram2cpu = self.render.state == Gp0State::ReadCopyData;
        let dma_info = match self.display.transfer_mode {
            TransferMode::Off => false,
            TransferMode::Fifo => self.fifo.n != FIFO_SIZE,
            TransferMode::DmaWrite => !exec_cmd_busy,
            TransferMode::DmaRead => ready_vram2cpu,
        };
        let line = self.timing.line as u32;
        let interlace_odd = if line >= self.display.y1 && line < self.display.y2 {
            if self.display.vres == VRes::V240 {
                line % 2 == 1
            } else {
                self.display.interlace_field != 0
            }
        } else {
            false
        };

        let d = &self.display;
        let r = &self.render;
        // GP0(E1)
        (r.def_args.texpage_x as u32)
            | ((r.def_args.texpage_y as u32) << 4)
            | ((r.def_args.transparency as u32 & 0x3) << 5)
            | ((r.def_args.texture_mode as u32 & 0x3) << 7)
            | ((r.def_args.dithering as u32) << 9)
            | ((r.drawing_da_enabled as u32) << 10)
            | ((r.texture_disabled as u32) << 15)
            // GP0(E6)
            | ((r.args.set_mask as u32) << 11)
            | ((r.args.check_mask as u32) << 12)
            | ((d.interlace_field) << 13)
            // GP1(08)
            | ((d.reverseflag as u32) << 14)
            | (((d.hres == HRes::H368) as u32) << 16)
            | (((d.hres as u32) & 0x3) << 17)
            | (d.vres_original << 19)
            | (((d.tv_mode == TvMode::Pal) as u32) << 20)
            | ((d.color_depth_24bit as u32) << 21)
            | ((d.vertical_interlace as u32) << 22)
            // GP1(03)
            | ((!d.enabled as u32) << 23)
            // GP0(1F)/GP1(02)
            | ((d.irq_enabled as u32) << 24)
            | ((dma_info as u32) << 25)
            | (((!exec_cmd_busy && r.state != Gp0State::WriteCopyData) as u32) << 26)
            | ((ready_vram2cpu as u32) << 27)
            | ((!exec_cmd_busy as u32) << 28)
            | (((d.transfer_mode as u32) & 0x3) << 29)
            | ((interlace_odd as u32) << 31)
    }
}
