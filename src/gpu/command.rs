//! GP0 decode and execution: the byte-by-byte front end that collects
//! command words into the fifo, and the action executor that runs completed
//! commands once the drawing unit is idle.

use super::renderer::{RenderStats, TextureMode, Transparency};
use super::{FifoState, Gp0State, Gpu, POLYLINE_TERMINATORS, RENDER_CC_CORRECTION, VRAM_WIDTH};
use crate::frontend::TraceEvent;
use crate::memory::interrupts::{Interrupt, Interrupts};
use crate::memory::EventSchedule;

/// 11-bit sign extension used by vertex and offset fields.
#[inline]
fn sext11(v: u32) -> i32 {
    ((v as i32) << 21) >> 21
}

#[inline]
fn rgb15(r: u8, g: u8, b: u8) -> u16 {
    ((r >> 3) as u16) | (((g >> 3) as u16) << 5) | (((b >> 3) as u16) << 10)
}

enum TexWord {
    Clut,
    Page,
    Plain,
}

impl Gpu {
    // ----- attribute setters (E1..E6) -----

    pub(super) fn set_draw_mode(&mut self, cmd: u32) {
        let def = &mut self.render.def_args;
        def.texpage_x = (cmd & 0xF) as i32;
        def.texpage_y = ((cmd >> 4) & 0x1) as i32;
        def.transparency = Transparency::from_bits(cmd >> 5);
        def.texture_mode = TextureMode::from_bits(cmd >> 7);
        def.dithering = (cmd >> 9) & 0x1 == 0x1;
        self.render.drawing_da_enabled = (cmd >> 10) & 0x1 == 0x1;
        self.render.texture_disabled = (cmd >> 11) & 0x1 == 0x1;
        def.texflip_x = (cmd >> 12) & 0x1 == 0x1;
        def.texflip_y = (cmd >> 13) & 0x1 == 0x1;
    }

    pub(super) fn set_texture_window(&mut self, cmd: u32) {
        self.render.e2_info = cmd & 0xFFFFF;
        let mask_x = cmd & 0x1F;
        let mask_y = (cmd >> 5) & 0x1F;
        let def = &mut self.render.def_args;
        def.texwinmask_x = !((mask_x << 3) as u8);
        def.texwinmask_y = !((mask_y << 3) as u8);
        def.texwinoff_x = ((((cmd >> 10) & 0x1F) & mask_x) << 3) as u8;
        def.texwinoff_y = ((((cmd >> 15) & 0x1F) & mask_y) << 3) as u8;
    }

    pub(super) fn set_draw_area_top_left(&mut self, cmd: u32) {
        // x in the low halfword, y in the high one; shared by every command
        self.render.e3_info = cmd & 0x03FF_03FF;
        self.render.args.clip_x1 = (cmd & 0x3FF) as i32;
        self.render.args.clip_y1 = (((cmd >> 16) & 0x3FF) as i32).min(511);
    }

    pub(super) fn set_draw_area_bottom_right(&mut self, cmd: u32) {
        self.render.e4_info = cmd & 0x03FF_03FF;
        self.render.args.clip_x2 = (cmd & 0x3FF) as i32;
        self.render.args.clip_y2 = (((cmd >> 16) & 0x3FF) as i32).min(511);
    }

    pub(super) fn set_drawing_offset(&mut self, cmd: u32) {
        self.render.e5_info = cmd & 0x07FF_07FF;
        self.render.off_x = sext11(cmd & 0x7FF);
        self.render.off_y = sext11((cmd >> 16) & 0x7FF);
    }

    pub(super) fn set_mask_bit(&mut self, cmd: u32) {
        // shared by every command, including the copies
        self.render.args.set_mask = cmd & 0x1 == 0x1;
        self.render.args.check_mask = cmd & 0x2 == 0x2;
    }

    // ----- argument helpers -----

    fn init_maxmin_xy(&mut self) {
        self.render.min_x = 2000;
        self.render.min_y = 2000;
        self.render.max_x = -2000;
        self.render.max_y = -2000;
    }

    fn set_color(&mut self, arg: u32) {
        self.render.args.r = arg as u8;
        self.render.args.g = (arg >> 8) as u8;
        self.render.args.b = (arg >> 16) as u8;
    }

    fn set_vertex_color(&mut self, v: usize, arg: u32) {
        self.render.args.v[v].r = arg as u8;
        self.render.args.v[v].g = (arg >> 8) as u8;
        self.render.args.v[v].b = (arg >> 16) as u8;
    }

    fn set_vertex_xy(&mut self, v: usize, arg: u32) {
        let x = self.render.off_x + sext11(arg & 0x7FF);
        let y = self.render.off_y + sext11((arg >> 16) & 0x7FF);
        if x < self.render.min_x {
            self.render.min_x = x;
        } else if x > self.render.max_x {
            self.render.max_x = x;
        }
        if y < self.render.min_y {
            self.render.min_y = y;
        } else if y > self.render.max_y {
            self.render.max_y = y;
        }
        self.render.args.v[v].x = x;
        self.render.args.v[v].y = y;
    }

    fn set_vertex_rec(&mut self, arg: u32) {
        self.render.args.v[0].x = self.render.off_x + sext11(arg & 0x7FF);
        self.render.args.v[0].y = self.render.off_y + sext11((arg >> 16) & 0x7FF);
    }

    fn set_rec_width_height(&mut self, arg: u32) {
        self.render.rec_w = (arg & 0x3FF) as i32;
        self.render.rec_h = ((arg >> 16) & 0x1FF) as i32;
    }

    fn set_vertex_txy(&mut self, v: usize, arg: u32, word: TexWord) {
        self.render.args.v[v].u = arg as u8;
        self.render.args.v[v].v = (arg >> 8) as u8;
        match word {
            TexWord::Clut => {
                self.render.args.texclut_x = ((arg >> 16) & 0x3F) as i32;
                self.render.args.texclut_y = ((arg >> 22) & 0x1FF) as i32;
            }
            TexWord::Page => {
                // the in-command texture page overwrites the draw-mode
                // defaults, it is not local to this polygon
                let page_x = ((arg >> 16) & 0xF) as i32;
                let page_y = ((arg >> 20) & 0x1) as i32;
                self.render.def_args.texpage_x = page_x;
                self.render.args.texpage_x = page_x;
                self.render.def_args.texpage_y = page_y;
                self.render.args.texpage_y = page_y;
                self.render.def_args.transparency = Transparency::from_bits(arg >> 21);
                if self.render.args.transparency != Transparency::None {
                    self.render.args.transparency = self.render.def_args.transparency;
                }
                let mode = TextureMode::from_bits(arg >> 23);
                self.render.def_args.texture_mode = mode;
                self.render.args.texture_mode = mode;
            }
            TexWord::Plain => {}
        }
    }

    fn bbox_too_large(&self) -> bool {
        (self.render.max_x - self.render.min_x) > 1023
            || (self.render.max_y - self.render.min_y) > 511
    }

    // ----- busy-time model -----

    fn add_idle_cycles(&mut self, gpucc: f64, sched: &mut EventSchedule) {
        self.timing.cc_to_idle += 7 * ((gpucc * RENDER_CC_CORRECTION + 0.5) as i32);
        self.fifo.busy = self.timing.cc_to_idle > 0;
        self.update_timing_event(sched);
    }

    fn calc_timing_draw_pol(&mut self, stats: &RenderStats, sched: &mut EventSchedule) {
        let args = &self.render.args;
        let mut gpucc = 64 + 18 + 2;
        let extra = if args.gouraud && args.texture_mode != TextureMode::None {
            150 * 3
        } else if args.gouraud {
            96 * 3
        } else if args.texture_mode != TextureMode::None {
            60 * 3
        } else {
            0
        };
        gpucc += extra;
        if self.render.is_pol4 {
            gpucc += extra + 28 + 18;
        }

        gpucc += stats.nlines * 2;

        if args.gouraud || args.texture_mode != TextureMode::None {
            gpucc += stats.npixels * 2;
        } else if args.transparency != Transparency::None || args.check_mask {
            gpucc += (stats.npixels as f64 * 1.5 + 0.5) as i32;
        } else {
            gpucc += stats.npixels;
        }

        self.add_idle_cycles(gpucc as f64, sched);
    }

    fn calc_timing_draw_line(&mut self, stats: &RenderStats, sched: &mut EventSchedule) {
        let gpucc = 2 + 16 + stats.npixels * 2;
        self.add_idle_cycles(gpucc as f64, sched);
    }

    fn calc_timing_draw_rec(&mut self, stats: &RenderStats, sched: &mut EventSchedule) {
        let mut gpucc = 16 + 2;
        if self.render.rec_w == 0 {
            gpucc += self.render.rec_h >> 1;
        } else {
            gpucc += stats.npixels;
            if self.render.args.transparency != Transparency::None || self.render.args.check_mask {
                gpucc += stats.npixels / 2;
            }
        }
        self.add_idle_cycles(gpucc as f64, sched);
    }

    // ----- draw dispatch -----

    fn draw_pol(&mut self, gouraud: bool, textured: bool, sched: &mut EventSchedule) {
        if self.bbox_too_large() {
            return;
        }

        self.render.args.gouraud = gouraud;
        if textured {
            self.render.args.dithering = self.render.def_args.dithering;
            self.render.args.texwinmask_x = self.render.def_args.texwinmask_x;
            self.render.args.texwinmask_y = self.render.def_args.texwinmask_y;
            self.render.args.texwinoff_x = self.render.def_args.texwinoff_x;
            self.render.args.texwinoff_y = self.render.def_args.texwinoff_y;
            self.render.args.texflip_x = false;
            self.render.args.texflip_y = false;
            if self.display.texture_disable && self.render.texture_disabled {
                self.render.args.texture_mode = TextureMode::None;
            }
        } else {
            self.render.args.texture_mode = TextureMode::None;
            // dithering never applies to flat untextured polygons
            self.render.args.dithering = gouraud && self.render.def_args.dithering;
        }

        self.unlock_renderer();
        let stats = if self.render.is_pol4 {
            self.renderer.pol4(&self.render.args)
        } else {
            self.renderer.pol3(&self.render.args)
        };
        self.calc_timing_draw_pol(&stats, sched);
    }

    fn draw_line(&mut self, gouraud: bool, sched: &mut EventSchedule) {
        if self.bbox_too_large() {
            return;
        }
        self.render.args.gouraud = gouraud;
        self.render.args.dithering = self.render.def_args.dithering;
        self.unlock_renderer();
        let stats = self.renderer.line(&self.render.args);
        self.calc_timing_draw_line(&stats, sched);
    }

    fn draw_rec(&mut self, textured: bool, sched: &mut EventSchedule) {
        self.render.args.gouraud = false;
        self.render.args.dithering = false;
        if textured {
            self.render.args.texpage_x = self.render.def_args.texpage_x;
            self.render.args.texpage_y = self.render.def_args.texpage_y;
            self.render.args.texwinmask_x = self.render.def_args.texwinmask_x;
            self.render.args.texwinmask_y = self.render.def_args.texwinmask_y;
            self.render.args.texwinoff_x = self.render.def_args.texwinoff_x;
            self.render.args.texwinoff_y = self.render.def_args.texwinoff_y;
            self.render.args.texflip_x = self.render.def_args.texflip_x;
            self.render.args.texflip_y = self.render.def_args.texflip_y;
            if self.display.texture_disable && self.render.texture_disabled {
                self.render.args.texture_mode = TextureMode::None;
            } else {
                self.render.args.texture_mode = self.render.def_args.texture_mode;
            }
        } else {
            self.render.args.texture_mode = TextureMode::None;
        }
        self.unlock_renderer();
        let (w, h) = (self.render.rec_w, self.render.rec_h);
        let stats = self.renderer.rect(&self.render.args, w, h);
        self.calc_timing_draw_rec(&stats, sched);
    }

    fn prepare_next_line(&mut self) {
        self.render.args.v[0] = self.render.args.v[1];
        self.render.min_x = self.render.args.v[0].x;
        self.render.max_x = self.render.args.v[0].x;
        self.render.min_y = self.render.args.v[0].y;
        self.render.max_y = self.render.args.v[0].y;
    }

    // ----- GPU-side VRAM operations -----

    fn fill_rec(&mut self, sched: &mut EventSchedule) {
        let x = self.render.args.v[0].x;
        let y = self.render.args.v[0].y;
        let (width, height) = (self.render.rec_w, self.render.rec_h);
        let color = rgb15(self.render.args.r, self.render.args.g, self.render.args.b);

        self.lock_renderer();
        for r in y..y + height {
            let row = ((r & 0x1FF) as usize) * VRAM_WIDTH;
            for c in x..x + width {
                self.vram[row + (c & 0x3FF) as usize] = color;
            }
        }

        // the fill unit writes 16 pixels per clock plus per-line overhead
        let gpucc = ((width >> 3) + 9) * height + 46 + 2;
        self.add_idle_cycles(gpucc as f64, sched);
    }

    fn copy_vram2vram(&mut self, sched: &mut EventSchedule) {
        let (width, height) = (self.render.rec_w, self.render.rec_h);
        let (x0, y0) = (self.render.args.v[0].x, self.render.args.v[0].y);
        let (x1, y1) = (self.render.args.v[1].x, self.render.args.v[1].y);
        let mut npixels = 0;

        self.lock_renderer();
        for r in 0..height {
            let row_src = (((y0 + r) & 0x1FF) as usize) * VRAM_WIDTH;
            let row_dst = (((y1 + r) & 0x1FF) as usize) * VRAM_WIDTH;
            for c in 0..width {
                let pos = row_dst + ((x1 + c) & 0x3FF) as usize;
                if self.render.args.check_mask && self.vram[pos] & 0x8000 != 0 {
                    continue;
                }
                let mut pixel = self.vram[row_src + ((x0 + c) & 0x3FF) as usize];
                if self.render.args.set_mask {
                    pixel |= 0x8000;
                }
                self.vram[pos] = pixel;
                npixels += 1;
            }
        }

        let gpucc = 2 + npixels * 2;
        self.add_idle_cycles(gpucc as f64, sched);
    }

    /// One fifo word of a CPU->VRAM stream: two pixels, with mask policy.
    fn copy_cpu2vram(&mut self, arg: u32) {
        self.lock_renderer();

        for half in [arg & 0xFFFF, arg >> 16] {
            let row = ((self.copy.r & 0x1FF) as usize) * VRAM_WIDTH;
            let pos = row + (self.copy.c & 0x3FF) as usize;
            if !self.render.args.check_mask || self.vram[pos] & 0x8000 == 0 {
                let mut pixel = half as u16;
                if self.render.args.set_mask {
                    pixel |= 0x8000;
                }
                self.vram[pos] = pixel;
            }
            self.copy.c += 1;
            if self.copy.c == self.copy.end_c {
                self.copy.r += 1;
                if self.copy.r < self.copy.end_r {
                    self.copy.c = self.copy.x;
                } else {
                    self.fifo.state = FifoState::WaitCmd;
                    return;
                }
            }
        }
    }

    /// One word of a VRAM->CPU stream, drained through GPUREAD.
    pub(super) fn copy_vram_to_cpu(&mut self) -> u32 {
        self.lock_renderer();

        let mut ret = 0;
        for shift in [0u32, 16] {
            let row = ((self.copy.r & 0x1FF) as usize) * VRAM_WIDTH;
            ret |= (self.vram[row + (self.copy.c & 0x3FF) as usize] as u32) << shift;
            self.copy.c += 1;
            if self.copy.c == self.copy.end_c {
                self.copy.r += 1;
                if self.copy.r < self.copy.end_r {
                    self.copy.c = self.copy.x;
                } else {
                    self.fifo.state = FifoState::WaitCmd;
                    self.render.state = Gp0State::WaitCmd;
                    self.read.vram_transfer = false;
                    return ret;
                }
            }
        }
        ret
    }

    // ----- fifo executors -----

    fn fifo_cmd_polygon(&mut self, cmd: u32, sched: &mut EventSchedule) {
        let gouraud = (cmd >> 28) & 1 == 1;
        let quad = (cmd >> 27) & 1 == 1;
        let textured = (cmd >> 26) & 1 == 1;
        let semi = (cmd >> 25) & 1 == 1;
        let raw = (cmd >> 24) & 1 == 1;

        self.init_maxmin_xy();
        self.render.is_pol4 = quad;
        self.render.args.transparency = if semi {
            self.render.def_args.transparency
        } else {
            Transparency::None
        };
        if gouraud {
            self.set_vertex_color(0, cmd);
        } else if !(textured && raw) {
            self.set_color(cmd);
        }
        if textured {
            self.render.args.modulate_texture = !raw;
        }

        let nv = if quad { 4 } else { 3 };
        for v in 0..nv {
            if gouraud && v > 0 {
                let c = self.fifo.pop();
                self.set_vertex_color(v, c);
            }
            let xy = self.fifo.pop();
            self.set_vertex_xy(v, xy);
            if textured {
                let t = self.fifo.pop();
                let word = match v {
                    0 => TexWord::Clut,
                    1 => TexWord::Page,
                    _ => TexWord::Plain,
                };
                self.set_vertex_txy(v, t, word);
            }
        }

        self.draw_pol(gouraud, textured, sched);
    }

    fn fifo_cmd_line(&mut self, cmd: u32, sched: &mut EventSchedule) {
        let gouraud = (cmd >> 28) & 1 == 1;
        let poly = (cmd >> 27) & 1 == 1;
        let semi = (cmd >> 25) & 1 == 1;

        self.init_maxmin_xy();
        self.render.is_poly = poly;
        self.render.args.transparency = if semi {
            self.render.def_args.transparency
        } else {
            Transparency::None
        };

        if gouraud {
            self.set_vertex_color(0, cmd);
            let xy = self.fifo.pop();
            self.set_vertex_xy(0, xy);
            let c = self.fifo.pop();
            self.set_vertex_color(1, c);
            let xy = self.fifo.pop();
            self.set_vertex_xy(1, xy);
        } else {
            self.set_color(cmd);
            let xy = self.fifo.pop();
            self.set_vertex_xy(0, xy);
            let xy = self.fifo.pop();
            self.set_vertex_xy(1, xy);
        }
        self.draw_line(gouraud, sched);

        if poly {
            self.fifo.state = if gouraud {
                FifoState::PolySline
            } else {
                FifoState::PolyMline
            };
        }
    }

    fn fifo_cmd_rect(&mut self, cmd: u32, sched: &mut EventSchedule) {
        let textured = (cmd >> 26) & 1 == 1;
        let semi = (cmd >> 25) & 1 == 1;
        let raw = (cmd >> 24) & 1 == 1;

        self.set_color(cmd);
        self.render.args.transparency = if semi {
            self.render.def_args.transparency
        } else {
            Transparency::None
        };
        let (w, h) = match (cmd >> 27) & 0x3 {
            0 => (-1, -1),
            1 => (1, 1),
            2 => (8, 8),
            _ => (16, 16),
        };
        self.render.rec_w = w;
        self.render.rec_h = h;
        if textured {
            self.render.args.modulate_texture = !raw;
        }

        let xy = self.fifo.pop();
        self.set_vertex_rec(xy);
        if textured {
            let t = self.fifo.pop();
            self.set_vertex_txy(0, t, TexWord::Clut);
        }
        if self.render.rec_w == -1 {
            let size = self.fifo.pop();
            self.set_rec_width_height(size);
        }
        self.draw_rec(textured, sched);
    }

    fn fifo_cmd_copy_setup(&mut self) {
        let xy = self.fifo.pop();
        self.copy.c = (xy & 0x3FF) as i32;
        self.copy.x = self.copy.c;
        self.copy.r = ((xy >> 16) & 0x1FF) as i32;
        let size = self.fifo.pop();
        self.copy.end_c = self.copy.x + ((((size & 0x3FF) as i32) - 1) & 0x3FF) + 1;
        self.copy.end_r = self.copy.r + (((((size >> 16) & 0x1FF) as i32) - 1) & 0x1FF) + 1;

        if self.render.copy_mode_write {
            self.fifo.state = FifoState::WriteDataCopy;
        } else {
            self.fifo.state = FifoState::ReadDataCopy;
            self.read.vram_transfer = true;
        }
    }

    fn run_fifo_cmd(&mut self, sched: &mut EventSchedule, int: &mut Interrupts) {
        match self.fifo.state {
            FifoState::PolyMline => {
                let cmd = self.fifo.pop();
                if !POLYLINE_TERMINATORS.contains(&cmd) {
                    self.prepare_next_line();
                    self.set_vertex_xy(1, cmd);
                    self.draw_line(false, sched);
                } else {
                    self.fifo.state = FifoState::WaitCmd;
                }
            }
            FifoState::PolySline => {
                let cmd = self.fifo.pop();
                if !POLYLINE_TERMINATORS.contains(&cmd) {
                    self.prepare_next_line();
                    self.set_vertex_color(1, cmd);
                    let xy = self.fifo.pop();
                    self.set_vertex_xy(1, xy);
                    self.draw_line(true, sched);
                } else {
                    self.fifo.state = FifoState::WaitCmd;
                }
            }
            FifoState::WriteDataCopy => {
                let cmd = self.fifo.pop();
                self.copy_cpu2vram(cmd);
            }
            FifoState::ReadDataCopy => {
                let cmd = self.fifo.pop();
                log::warn!(
                    "GPU fifo: word {:08X} ignored, a VRAM to CPU transfer is in progress",
                    cmd
                );
            }
            FifoState::WaitCmd => {
                let cmd = self.fifo.pop();
                if self.trace {
                    self.trace_buf.push(TraceEvent::GpuCommand { word: cmd });
                }
                match cmd >> 24 {
                    0x01 => {} // clear cache: no texture cache modeled
                    0x02 => {
                        self.set_color(cmd);
                        let xy = self.fifo.pop();
                        self.render.args.v[0].x = (xy & 0x3FF) as i32;
                        self.render.args.v[0].y = ((xy >> 16) & 0x1FF) as i32;
                        let size = self.fifo.pop();
                        self.render.rec_w = (size & 0x3FF) as i32;
                        self.render.rec_h = ((size >> 16) & 0x1FF) as i32;
                        self.fill_rec(sched);
                    }
                    0x03 => {} // unknown
                    0x1F => {
                        if !self.display.irq_enabled {
                            self.display.irq_enabled = true;
                            int.interruption(Interrupt::GPU, true);
                        }
                    }
                    0x20..=0x3F => self.fifo_cmd_polygon(cmd, sched),
                    0x40..=0x5F => self.fifo_cmd_line(cmd, sched),
                    0x60..=0x7F => self.fifo_cmd_rect(cmd, sched),
                    0x80..=0x9F => {
                        let xy = self.fifo.pop();
                        self.render.args.v[0].x = (xy & 0x3FF) as i32;
                        self.render.args.v[0].y = ((xy >> 16) & 0x1FF) as i32;
                        let xy = self.fifo.pop();
                        self.render.args.v[1].x = (xy & 0x3FF) as i32;
                        self.render.args.v[1].y = ((xy >> 16) & 0x1FF) as i32;
                        let size = self.fifo.pop();
                        self.render.rec_w = ((((size & 0x3FF) as i32) - 1) & 0x3FF) + 1;
                        self.render.rec_h = (((((size >> 16) & 0x1FF) as i32) - 1) & 0x1FF) + 1;
                        self.copy_vram2vram(sched);
                    }
                    0xA0..=0xBF => {
                        self.render.copy_mode_write = true;
                        self.fifo_cmd_copy_setup();
                    }
                    0xC0..=0xDF => {
                        self.render.copy_mode_write = false;
                        self.fifo_cmd_copy_setup();
                    }
                    0xE1 => self.set_draw_mode(cmd),
                    0xE2 => self.set_texture_window(cmd),
                    0xE6 => self.set_mask_bit(cmd),
                    _ => log::warn!("GPU fifo: unknown command {:02X}", cmd >> 24),
                }
            }
        }
        self.fifo.nactions -= 1;
    }

    pub(super) fn run_fifo_cmds(&mut self, sched: &mut EventSchedule, int: &mut Interrupts) {
        while self.fifo.nactions > 0 && !self.fifo.busy {
            self.run_fifo_cmd(sched, int);
        }
    }

    fn insert_short_cmd(&mut self, cmd: u32, sched: &mut EventSchedule, int: &mut Interrupts) {
        self.fifo.push(cmd);
        self.fifo.nactions += 1;
        self.run_fifo_cmds(sched, int);
    }

    fn insert_long_cmd(&mut self, cmd: u32, nwords: u32) {
        self.fifo.push(cmd);
        self.render.state = Gp0State::WaitWords;
        self.render.nwords = nwords;
    }

    /// Number of parameter words that follow a polygon command word.
    fn polygon_words(cmd: u32) -> u32 {
        let gouraud = (cmd >> 28) & 1;
        let quad = (cmd >> 27) & 1;
        let textured = (cmd >> 26) & 1;
        let nv = 3 + quad;
        nv * (1 + textured) + (nv - 1) * gouraud
    }

    /// One word arriving on GP0, from MMIO or DMA2.
    pub(super) fn gp0_word(&mut self, cmd: u32, sched: &mut EventSchedule, int: &mut Interrupts) {
        match self.render.state {
            Gp0State::WaitCmd => match cmd >> 24 {
                0x00 => {} // nop
                0x01 | 0x03 | 0x1F => self.insert_short_cmd(cmd, sched, int),
                0x02 => self.insert_long_cmd(cmd, 2),
                0x04..=0x1E => {} // nop mirror
                0x20..=0x3F => self.insert_long_cmd(cmd, Self::polygon_words(cmd)),
                0x40..=0x43 => self.insert_long_cmd(cmd, 2),
                0x48..=0x4C => {
                    self.fifo.push(cmd);
                    self.render.state = Gp0State::PolyMlineWaitV1;
                }
                0x50..=0x53 | 0x55 => self.insert_long_cmd(cmd, 3),
                0x58..=0x5B | 0x5E => {
                    self.fifo.push(cmd);
                    self.render.state = Gp0State::PolySlineWaitV1;
                }
                0x60 | 0x62 => self.insert_long_cmd(cmd, 2),
                0x64..=0x67 => self.insert_long_cmd(cmd, 3),
                0x68 | 0x6A | 0x70 | 0x72 | 0x78 | 0x7A => self.insert_long_cmd(cmd, 1),
                0x6C..=0x6F | 0x74..=0x77 | 0x7C..=0x7F => self.insert_long_cmd(cmd, 2),
                0x80..=0x9F => self.insert_long_cmd(cmd, 3),
                0xA0..=0xBF => {
                    self.fifo.push(cmd);
                    self.render.state = Gp0State::WriteCopyWaitXy;
                }
                0xC0..=0xDF => {
                    self.fifo.push(cmd);
                    self.render.state = Gp0State::ReadCopyWaitXy;
                }
                0xE0 | 0xE7..=0xEF => {} // nop mirror
                0xE1 | 0xE2 | 0xE6 => self.insert_short_cmd(cmd, sched, int),
                0xE3 => self.set_draw_area_top_left(cmd),
                0xE4 => self.set_draw_area_bottom_right(cmd),
                0xE5 => self.set_drawing_offset(cmd),
                _ => log::warn!("GPU (GP0): unknown command {:02X}", cmd >> 24),
            },

            Gp0State::WaitWords => {
                self.fifo.push(cmd);
                self.render.nwords -= 1;
                if self.render.nwords == 0 {
                    self.render.state = Gp0State::WaitCmd;
                    self.fifo.nactions += 1;
                    self.run_fifo_cmds(sched, int);
                }
            }

            // monochrome polyline: every appended vertex draws
            Gp0State::PolyMlineWaitV1 => {
                self.fifo.push(cmd);
                self.render.state = Gp0State::PolyMlineWaitV2;
            }
            Gp0State::PolyMlineWaitV2 => {
                self.fifo.push(cmd);
                self.fifo.nactions += 1;
                self.run_fifo_cmds(sched, int);
                self.render.state = Gp0State::PolyMlineWaitVn;
            }
            Gp0State::PolyMlineWaitVn => {
                self.fifo.push(cmd);
                self.fifo.nactions += 1;
                // the terminator is an action too
                self.run_fifo_cmds(sched, int);
                if POLYLINE_TERMINATORS.contains(&cmd) {
                    self.render.state = Gp0State::WaitCmd;
                }
            }

            // shaded polyline: color+vertex pairs
            Gp0State::PolySlineWaitV1 => {
                self.fifo.push(cmd);
                self.render.state = Gp0State::PolySlineWaitC2;
            }
            Gp0State::PolySlineWaitC2 => {
                self.fifo.push(cmd);
                self.render.state = Gp0State::PolySlineWaitV2;
            }
            Gp0State::PolySlineWaitV2 => {
                self.fifo.push(cmd);
                self.fifo.nactions += 1;
                self.run_fifo_cmds(sched, int);
                self.render.state = Gp0State::PolySlineWaitCn;
            }
            Gp0State::PolySlineWaitCn => {
                self.fifo.push(cmd);
                if !POLYLINE_TERMINATORS.contains(&cmd) {
                    self.render.state = Gp0State::PolySlineWaitVn;
                } else {
                    self.fifo.nactions += 1;
                    self.run_fifo_cmds(sched, int);
                    self.render.state = Gp0State::WaitCmd;
                }
            }
            Gp0State::PolySlineWaitVn => {
                self.fifo.push(cmd);
                self.fifo.nactions += 1;
                self.run_fifo_cmds(sched, int);
                self.render.state = Gp0State::PolySlineWaitCn;
            }

            // CPU -> VRAM
            Gp0State::WriteCopyWaitXy => {
                self.fifo.push(cmd);
                self.render.state = Gp0State::WriteCopyWaitSize;
            }
            Gp0State::WriteCopyWaitSize => {
                let w = (((cmd & 0x3FF) as i32 - 1) & 0x3FF) + 1;
                let h = ((((cmd >> 16) & 0x1FF) as i32 - 1) & 0x1FF) + 1;
                let size = (w * h) as u32;
                self.render.nwords = size / 2 + (size % 2);
                self.fifo.push(cmd);
                self.fifo.nactions += 1;
                self.run_fifo_cmds(sched, int);
                self.render.state = if self.render.nwords > 0 {
                    Gp0State::WriteCopyData
                } else {
                    Gp0State::WaitCmd
                };
            }
            Gp0State::WriteCopyData => {
                self.fifo.push(cmd);
                self.fifo.nactions += 1;
                self.run_fifo_cmds(sched, int);
                self.render.nwords -= 1;
                if self.render.nwords == 0 {
                    self.render.state = Gp0State::WaitCmd;
                }
            }

            // VRAM -> CPU
            Gp0State::ReadCopyWaitXy => {
                self.fifo.push(cmd);
                self.render.state = Gp0State::ReadCopyWaitSize;
            }
            Gp0State::ReadCopyWaitSize => {
                self.fifo.push(cmd);
                self.fifo.nactions += 1;
                self.run_fifo_cmds(sched, int);
                self.render.state = Gp0State::ReadCopyData;
            }
            Gp0State::ReadCopyData => {
                log::warn!(
                    "GPU (GP0): word {:08X} ignored, a VRAM to CPU transfer is in progress",
                    cmd
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::StatsRenderer;
    use crate::timers::Timers;

    fn make_gpu() -> (Gpu, EventSchedule, Interrupts, Timers) {
        (
            Gpu::new(Box::new(StatsRenderer)),
            EventSchedule::default(),
            Interrupts::default(),
            Timers::default(),
        )
    }

    fn gp0(gpu: &mut Gpu, sched: &mut EventSchedule, int: &mut Interrupts, t: &mut Timers, w: u32) {
        gpu.gp0(w, sched, int, t);
    }

    fn drain(gpu: &mut Gpu, sched: &mut EventSchedule, int: &mut Interrupts, t: &mut Timers) {
        // enough catching up that any busy period elapses
        for _ in 0..64 {
            sched.clock = sched.clock.wrapping_add(10_000);
            gpu.end_iter(sched, int, t);
        }
    }

    #[test]
    fn draw_area_info_round_trips() {
        let (mut gpu, mut sched, mut int, mut t) = make_gpu();

        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0xE300_0000 | (40 << 16) | 20);
        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0xE400_0000 | (60 << 16) | 40);

        gpu.gp1(0x1000_0003, &mut sched, &mut int, &mut t);
        assert_eq!(gpu.gpu_read(&mut sched, &mut int, &mut t), (40 << 16) | 20);
        gpu.gp1(0x1000_0004, &mut sched, &mut int, &mut t);
        assert_eq!(gpu.gpu_read(&mut sched, &mut int, &mut t), (60 << 16) | 40);
    }

    #[test]
    fn fill_writes_every_pixel() {
        let (mut gpu, mut sched, mut int, mut t) = make_gpu();

        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0x02FF_FFFF);
        gp0(&mut gpu, &mut sched, &mut int, &mut t, (100 << 16) | 100);
        gp0(&mut gpu, &mut sched, &mut int, &mut t, (16 << 16) | 16);
        drain(&mut gpu, &mut sched, &mut int, &mut t);

        let vram = gpu.vram();
        for y in 100..116 {
            for x in 100..116 {
                assert_eq!(vram[y * VRAM_WIDTH + x], 0x7FFF, "pixel {},{}", x, y);
            }
        }
        assert_eq!(gpu.vram()[99 * VRAM_WIDTH + 100], 0);
    }

    #[test]
    fn cpu_vram_copy_round_trip() {
        let (mut gpu, mut sched, mut int, mut t) = make_gpu();

        // upload 4x4 pixels at (8, 8)
        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0xA000_0000);
        gp0(&mut gpu, &mut sched, &mut int, &mut t, (8 << 16) | 8);
        gp0(&mut gpu, &mut sched, &mut int, &mut t, (4 << 16) | 4);
        for i in 0..8u32 {
            let w = (2 * i + 1) | ((2 * i + 2) << 16);
            gp0(&mut gpu, &mut sched, &mut int, &mut t, w);
        }
        drain(&mut gpu, &mut sched, &mut int, &mut t);

        // read the same rectangle back
        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0xC000_0000);
        gp0(&mut gpu, &mut sched, &mut int, &mut t, (8 << 16) | 8);
        gp0(&mut gpu, &mut sched, &mut int, &mut t, (4 << 16) | 4);
        drain(&mut gpu, &mut sched, &mut int, &mut t);

        for i in 0..8u32 {
            let expected = (2 * i + 1) | ((2 * i + 2) << 16);
            assert_eq!(gpu.gpu_read(&mut sched, &mut int, &mut t), expected);
        }
    }

    #[test]
    fn fifo_word_count_returns_after_complete_command() {
        let (mut gpu, mut sched, mut int, mut t) = make_gpu();

        let before = gpu.fifo.n;
        // flat triangle: command + 3 vertices
        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0x2000_00FF);
        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0x0000_0000);
        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0x0000_0040);
        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0x0040_0000);
        drain(&mut gpu, &mut sched, &mut int, &mut t);
        assert_eq!(gpu.fifo.n, before);
    }

    #[test]
    fn polyline_terminator_ends_the_command() {
        let (mut gpu, mut sched, mut int, mut t) = make_gpu();

        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0x4800_00FF);
        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0x0000_0000);
        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0x0000_0010);
        drain(&mut gpu, &mut sched, &mut int, &mut t);
        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0x0010_0010);
        drain(&mut gpu, &mut sched, &mut int, &mut t);
        assert_ne!(gpu.render.state, Gp0State::WaitCmd);
        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0x5555_5555);
        drain(&mut gpu, &mut sched, &mut int, &mut t);
        assert_eq!(gpu.render.state, Gp0State::WaitCmd);
    }

    #[test]
    fn mask_check_protects_pixels() {
        let (mut gpu, mut sched, mut int, mut t) = make_gpu();

        // upload one pixel with the mask bit forced on
        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0xE600_0001); // set mask
        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0xA000_0000);
        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0);
        gp0(&mut gpu, &mut sched, &mut int, &mut t, (1 << 16) | 1);
        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0x1234);
        drain(&mut gpu, &mut sched, &mut int, &mut t);
        assert_eq!(gpu.vram()[0], 0x9234);

        // now check-mask on, try to overwrite
        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0xE600_0002);
        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0xA000_0000);
        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0);
        gp0(&mut gpu, &mut sched, &mut int, &mut t, (1 << 16) | 1);
        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0x4321);
        drain(&mut gpu, &mut sched, &mut int, &mut t);
        assert_eq!(gpu.vram()[0], 0x9234);
    }

    #[test]
    fn rendering_back_pressure_sets_busy() {
        let (mut gpu, mut sched, mut int, mut t) = make_gpu();

        // a sizeable fill keeps the unit busy for a while
        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0x0200_0000);
        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0);
        gp0(&mut gpu, &mut sched, &mut int, &mut t, (256 << 16) | 512);
        assert!(gpu.fifo.busy);
        let stat = gpu.stat(&mut sched, &mut int, &mut t);
        assert_eq!(stat & (1 << 28), 0, "not ready for dma while busy");
        drain(&mut gpu, &mut sched, &mut int, &mut t);
        assert!(!gpu.fifo.busy);
    }

    #[test]
    fn gp1_reset_restores_idle_stat() {
        let (mut gpu, mut sched, mut int, mut t) = make_gpu();

        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0xA000_0000);
        gp0(&mut gpu, &mut sched, &mut int, &mut t, 0);
        gpu.gp1(0x0000_0000, &mut sched, &mut int, &mut t);

        assert_eq!(gpu.render.state, Gp0State::WaitCmd);
        let stat = gpu.stat(&mut sched, &mut int, &mut t);
        // display disabled, ready for commands
        assert_ne!(stat & (1 << 23), 0);
        assert_ne!(stat & (1 << 26), 0);
        assert_ne!(stat & (1 << 28), 0);
    }
}
