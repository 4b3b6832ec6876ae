//! End-to-end scenarios driven through a whole machine with a stub BIOS.

use prism_core::cpu::RegisterType;
use prism_core::gpu::VRAM_WIDTH;
use prism_core::memory::Bios;
use prism_core::{Psx, BIOS_SIZE};

/// A BIOS image whose reset vector runs `program`, followed by a jump back
/// to itself so the CPU parks once the interesting part is done.
fn bios_with_program(program: &[u32]) -> Bios {
    let mut data = vec![0u8; BIOS_SIZE];
    let mut pos = 0;
    for word in program {
        data[pos..pos + 4].copy_from_slice(&word.to_le_bytes());
        pos += 4;
    }
    // j <self>; nop
    let park_addr = 0x1FC0_0000 + pos as u32;
    let park = 0x0800_0000 | ((park_addr >> 2) & 0x03FF_FFFF);
    data[pos..pos + 4].copy_from_slice(&park.to_le_bytes());
    Bios::from_bytes(data).unwrap()
}

fn machine(program: &[u32]) -> Psx {
    Psx::new_headless(bios_with_program(program)).unwrap()
}

/// A machine that just spins, for MMIO-driven tests.
fn idle_machine() -> Psx {
    machine(&[])
}

#[test]
fn bios_size_is_checked() {
    assert!(Bios::from_bytes(vec![0; 1234]).is_err());
    assert!(Bios::from_bytes(vec![0; BIOS_SIZE]).is_ok());
}

#[test]
fn ram_round_trips_through_the_bus() {
    let mut psx = idle_machine();
    for addr in [0x0000_0000u32, 0x0000_1234 & !3, 0x001F_FFFC] {
        psx.bus_write_u32(addr, 0xDEAD_BEEF ^ addr).unwrap();
        assert_eq!(psx.bus_read_u32(addr).unwrap(), 0xDEAD_BEEF ^ addr);
    }
    // kseg0/kseg1 mirrors reach the same storage
    psx.bus_write_u32(0x40, 0x1122_3344).unwrap();
    assert_eq!(psx.bus_read_u32(0x40).unwrap(), 0x1122_3344);
}

#[test]
fn add_with_overflow_raises_and_preserves_rd() {
    // add t2, t0, t1
    let mut psx = machine(&[0x0109_5020]);
    let regs = psx.cpu_mut().registers_mut();
    regs.write(RegisterType::T0, 0x7FFF_FFFF);
    regs.write(RegisterType::T1, 1);
    regs.write(RegisterType::T2, 0x5555_AAAA);

    psx.iter(2);

    let cpu = psx.cpu();
    assert_eq!(cpu.registers().read(RegisterType::T2), 0x5555_AAAA);
    assert_eq!(cpu.cop0_reg(14), 0x1FC0_0000, "EPC");
    assert_eq!((cpu.cop0_reg(13) >> 2) & 0x1F, 0x0C, "ExcCode");
    // BEV is set out of reset, so the ROM vector is used
    assert_eq!(cpu.pc(), 0xBFC0_0180);
}

#[test]
fn load_delay_slot_sees_the_old_value() {
    // lw t0, 0(a0) ; or t1, t0, zero ; or t2, t0, zero
    let mut psx = machine(&[0x8C88_0000, 0x0100_4825, 0x0100_5025]);
    psx.bus_write_u32(0x100, 0xCAFE_F00D).unwrap();
    let regs = psx.cpu_mut().registers_mut();
    regs.write(RegisterType::A0, 0x100);
    regs.write(RegisterType::T0, 0x1111_1111);

    psx.iter(7);

    let regs = psx.cpu().registers();
    assert_eq!(regs.read(RegisterType::T0), 0xCAFE_F00D);
    // the instruction in the load delay slot read the stale value
    assert_eq!(regs.read(RegisterType::T1), 0x1111_1111);
    // one instruction later the load has landed
    assert_eq!(regs.read(RegisterType::T2), 0xCAFE_F00D);
}

#[test]
fn branch_delay_slot_executes_before_the_target() {
    // j 0x1FC00100 ; addiu t0, t0, 1
    let target = 0x1FC0_0100u32;
    let mut psx = machine(&[0x0800_0000 | ((target >> 2) & 0x03FF_FFFF), 0x2508_0001]);

    psx.iter(4);

    assert_eq!(psx.cpu().registers().read(RegisterType::T0), 1);
    assert_eq!(psx.cpu().pc(), target);
}

#[test]
fn div_by_zero_follows_the_documented_edges() {
    // div t0, t1 ; mflo t2 ; mfhi t3
    let prog = [0x0109_001A, 0x0000_5012, 0x0000_5810];
    let mut psx = machine(&prog);
    let regs = psx.cpu_mut().registers_mut();
    regs.write(RegisterType::T0, 5);
    regs.write(RegisterType::T1, 0);
    psx.iter(16);
    let regs = psx.cpu().registers();
    assert_eq!(regs.read(RegisterType::T2), 0xFFFF_FFFF);
    assert_eq!(regs.read(RegisterType::T3), 5);

    let mut psx = machine(&prog);
    let regs = psx.cpu_mut().registers_mut();
    regs.write(RegisterType::T0, 0x8000_0000);
    regs.write(RegisterType::T1, 0xFFFF_FFFF);
    psx.iter(16);
    let regs = psx.cpu().registers();
    assert_eq!(regs.read(RegisterType::T2), 0x8000_0000);
    assert_eq!(regs.read(RegisterType::T3), 0);
}

#[test]
fn i_stat_write_is_acknowledge_only() {
    let mut psx = idle_machine();
    // no source has fired: writing ones must not set anything
    psx.bus_write_u32(0x1F80_1070, 0x7FF).unwrap();
    assert_eq!(psx.bus_read_u32(0x1F80_1070).unwrap() & 0x7FF, 0);
}

#[test]
fn gpu_draw_area_round_trip_through_mmio() {
    let mut psx = idle_machine();

    psx.bus_write_u32(0x1F80_1814, 0x0300_0000).unwrap();
    psx.bus_write_u32(0x1F80_1810, 0xE300_0000 | (40 << 16) | 20)
        .unwrap();
    psx.bus_write_u32(0x1F80_1810, 0xE400_0000 | (60 << 16) | 40)
        .unwrap();

    psx.bus_write_u32(0x1F80_1814, 0x1000_0003).unwrap();
    assert_eq!(psx.bus_read_u32(0x1F80_1810).unwrap(), (40 << 16) | 20);
    psx.bus_write_u32(0x1F80_1814, 0x1000_0004).unwrap();
    assert_eq!(psx.bus_read_u32(0x1F80_1810).unwrap(), (60 << 16) | 40);
}

#[test]
fn gpu_fill_paints_the_rectangle() {
    let mut psx = idle_machine();

    psx.bus_write_u32(0x1F80_1810, 0x02FF_FFFF).unwrap();
    psx.bus_write_u32(0x1F80_1810, (100 << 16) | 100).unwrap();
    psx.bus_write_u32(0x1F80_1810, (16 << 16) | 16).unwrap();

    // let the fill's busy time elapse
    psx.iter(20_000);

    let vram = psx.bus_mut().gpu_mut().vram();
    for y in 100..116usize {
        for x in 100..116usize {
            assert_eq!(vram[y * VRAM_WIDTH + x], 0x7FFF, "pixel {},{}", x, y);
        }
    }
    assert_eq!(vram[100 * VRAM_WIDTH + 99], 0);
    assert_eq!(vram[99 * VRAM_WIDTH + 100], 0);
}

#[test]
fn gpu_copy_round_trip_preserves_words() {
    let mut psx = idle_machine();

    psx.bus_write_u32(0x1F80_1810, 0xA000_0000).unwrap();
    psx.bus_write_u32(0x1F80_1810, (16 << 16) | 32).unwrap();
    psx.bus_write_u32(0x1F80_1810, (2 << 16) | 8).unwrap();
    let words: Vec<u32> = (0..8u32).map(|i| 0x8000_0000 | (i * 0x0101_0101)).collect();
    for w in &words {
        psx.bus_write_u32(0x1F80_1810, *w).unwrap();
    }
    psx.iter(20_000);

    psx.bus_write_u32(0x1F80_1810, 0xC000_0000).unwrap();
    psx.bus_write_u32(0x1F80_1810, (16 << 16) | 32).unwrap();
    psx.bus_write_u32(0x1F80_1810, (2 << 16) | 8).unwrap();
    psx.iter(20_000);

    for w in &words {
        assert_eq!(psx.bus_read_u32(0x1F80_1810).unwrap(), *w);
    }
}

#[test]
fn timer1_counts_hblanks_and_fires_once_per_mode_write() {
    let mut psx = idle_machine();

    // one NTSC frame in CPU cycles: 263 lines * 3413 GPU cycles * 7/11
    let frame_cc = 263u32 * 3413 * 7 / 11 + 1;

    psx.bus_write_u32(0x1F80_1118, 263).unwrap(); // target
    psx.bus_write_u32(0x1F80_1114, (1 << 8) | 0x10).unwrap(); // hblank source, IRQ on target

    psx.iter(frame_cc + 5_000);
    assert_ne!(
        psx.bus_read_u32(0x1F80_1070).unwrap() & 0x20,
        0,
        "timer 1 IRQ after one frame"
    );

    // one-shot: acknowledging and waiting another frame stays silent
    psx.bus_write_u32(0x1F80_1070, 0).unwrap();
    psx.iter(frame_cc + 5_000);
    assert_eq!(psx.bus_read_u32(0x1F80_1070).unwrap() & 0x20, 0);

    // a mode rewrite re-arms it
    psx.bus_write_u32(0x1F80_1114, (1 << 8) | 0x10).unwrap();
    psx.iter(frame_cc + 5_000);
    assert_ne!(psx.bus_read_u32(0x1F80_1070).unwrap() & 0x20, 0);
}

#[test]
fn vblank_fires_every_frame() {
    let mut psx = idle_machine();
    let frame_cc = 263u32 * 3413 * 7 / 11 + 1;

    for _ in 0..3 {
        psx.iter(frame_cc);
        assert_ne!(psx.bus_read_u32(0x1F80_1070).unwrap() & 0x1, 0);
        psx.bus_write_u32(0x1F80_1070, 0).unwrap();
    }
}

#[test]
fn dma2_block_upload_reaches_vram() {
    let mut psx = idle_machine();

    // source pixels in RAM
    let bytes: Vec<u8> = (1..=16u8).collect();
    psx.load_to_ram(0x200, &bytes);

    // prime the CPU->VRAM transfer: 4x2 pixels at (8, 8)
    psx.bus_write_u32(0x1F80_1810, 0xA000_0000).unwrap();
    psx.bus_write_u32(0x1F80_1810, (8 << 16) | 8).unwrap();
    psx.bus_write_u32(0x1F80_1810, (2 << 16) | 4).unwrap();
    // GP1(04h): DMA direction = CPU to GP0
    psx.bus_write_u32(0x1F80_1814, 0x0400_0002).unwrap();

    // DICR: enable channel 2 + master
    psx.bus_write_u32(0x1F80_10F4, (1 << 23) | (1 << 18)).unwrap();
    // DPCR: enable channel 2
    psx.bus_write_u32(0x1F80_10F0, 0x0765_4B21).unwrap();

    // channel 2: one block of 4 words, from RAM, sync mode 1
    psx.bus_write_u32(0x1F80_10A0, 0x200).unwrap();
    psx.bus_write_u32(0x1F80_10A4, (1 << 16) | 4).unwrap();
    psx.bus_write_u32(0x1F80_10A8, 0x0100_0201).unwrap();

    // the transfer steals cycles from the running CPU
    psx.iter(1_000);

    let vram = psx.bus_mut().gpu_mut().vram();
    assert_eq!(vram[8 * VRAM_WIDTH + 8], 0x0201);
    assert_eq!(vram[8 * VRAM_WIDTH + 9], 0x0403);
    assert_eq!(vram[8 * VRAM_WIDTH + 10], 0x0605);
    assert_eq!(vram[8 * VRAM_WIDTH + 11], 0x0807);
    assert_eq!(vram[9 * VRAM_WIDTH + 8], 0x0A09);

    // completion latched the channel flag and raised the DMA interrupt
    assert_ne!(psx.bus_read_u32(0x1F80_10F4).unwrap() & (1 << 26), 0);
    assert_ne!(psx.bus_read_u32(0x1F80_1070).unwrap() & 0x8, 0);
    // and the channel is no longer busy
    assert_eq!(psx.bus_read_u32(0x1F80_10A8).unwrap() & (1 << 24), 0);
}

#[test]
fn otc_dma_freezes_the_cpu_but_finishes() {
    let mut psx = idle_machine();

    // DPCR: enable channel 6
    psx.bus_write_u32(0x1F80_10F0, 0x0F65_4321).unwrap();
    psx.bus_write_u32(0x1F80_10E0, 0x1000).unwrap();
    psx.bus_write_u32(0x1F80_10E4, 8).unwrap();
    psx.bus_write_u32(0x1F80_10E8, 0x1100_0000).unwrap();

    psx.iter(100);

    assert_eq!(psx.bus_read_u32(0x1000).unwrap(), 0xFFC);
    assert_eq!(psx.bus_read_u32(0x1000 - 7 * 4).unwrap(), 0xFF_FFFF);
}

#[test]
fn scratchpad_is_separate_from_ram() {
    let mut psx = idle_machine();
    psx.bus_write_u32(0x1F80_0000, 0x1234_5678).unwrap();
    psx.bus_write_u32(0x0000_0000, 0x8765_4321).unwrap();
    assert_eq!(psx.bus_read_u32(0x1F80_0000).unwrap(), 0x1234_5678);
    assert_eq!(psx.bus_read_u32(0x0000_0000).unwrap(), 0x8765_4321);
}

#[test]
fn soft_reset_restarts_at_the_bios_vector() {
    let mut psx = machine(&[0x2508_0001]); // addiu t0, t0, 1
    psx.iter(8);
    assert_ne!(psx.cpu().pc(), 0x1FC0_0000);

    psx.reset();
    psx.iter(2);
    // the reset is taken between iterations, like the hardware line
    assert_eq!(psx.cpu().pc(), 0x1FC0_0000);
    // a soft reset does not scrub the register file
    assert_ne!(psx.cpu().registers().read(RegisterType::T0), 0);
}
