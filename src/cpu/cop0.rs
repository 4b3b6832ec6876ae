//! The system control coprocessor: exception state, breakpoint registers
//! and the cache-control shadow, plus the derived flags the interpreter
//! consults on every memory access.

pub(crate) const SR_IEC: u32 = 0x0000_0001;
pub(crate) const SR_KUC: u32 = 0x0000_0002;
pub(crate) const SR_ISC: u32 = 0x0001_0000;
pub(crate) const SR_BEV: u32 = 0x0040_0000;
pub(crate) const SR_RE: u32 = 0x0200_0000;
pub(crate) const SR_CU0: u32 = 0x1000_0000;
pub(crate) const SR_CU2: u32 = 0x4000_0000;

pub(crate) const CAUSE_BD: u32 = 0x8000_0000;

const CC_SCRATCHPAD_ENABLE_1: u32 = 0x0000_0008;
const CC_SCRATCHPAD_ENABLE_2: u32 = 0x0000_0080;

const SR_WRITE_MASK: u32 = 0xF27F_FF3F;
const CACHE_CONTROL_MASK: u32 = 0x0000_0ABF;

#[derive(Default)]
pub(crate) struct Cop0 {
    /// reg 3: breakpoint on execute
    pub bpc: u32,
    /// reg 5: breakpoint on data access
    pub bda: u32,
    /// reg 7: breakpoint control
    pub dcic: u32,
    /// reg 8: bad virtual address
    pub bad_vaddr: u32,
    /// reg 9: data access breakpoint mask
    pub bdam: u32,
    /// reg 11: execute breakpoint mask
    pub bpcm: u32,
    /// reg 12: status
    pub sr: u32,
    /// reg 13: exception cause
    pub cause: u32,
    /// reg 14: exception return address
    pub epc: u32,

    /// the register mapped at 0xFFFE0130
    pub cache_control: u32,

    // flags derived from SR and cache_control, recomputed on change
    pub cache_isolated: bool,
    pub scratchpad_enabled: bool,
    pub user_mode: bool,
    pub is_le: bool,
    pub cop0_enabled: bool,
    pub cop2_enabled: bool,
}

impl Cop0 {
    pub fn update_flags(&mut self) {
        self.scratchpad_enabled = self.cache_control
            & (CC_SCRATCHPAD_ENABLE_1 | CC_SCRATCHPAD_ENABLE_2)
            == (CC_SCRATCHPAD_ENABLE_1 | CC_SCRATCHPAD_ENABLE_2);

        self.cache_isolated = !self.scratchpad_enabled && (self.sr & SR_ISC) != 0;

        // KUc is inverted relative to the classic R3000 manual: 0 is kernel
        self.user_mode = self.sr & SR_KUC != 0;

        self.is_le = !self.user_mode || (self.sr & SR_RE) == 0;

        self.cop0_enabled = !self.user_mode || (self.sr & SR_CU0) != 0;
        self.cop2_enabled = self.sr & SR_CU2 != 0;
    }

    pub fn write_cache_control(&mut self, data: u32) {
        self.cache_control = data & CACHE_CONTROL_MASK;
        self.update_flags();
    }

    pub fn read_cache_control(&self) -> u32 {
        self.cache_control & CACHE_CONTROL_MASK
    }

    /// `mfc0` view of a register; `None` means a reserved selector.
    pub fn read_reg(&self, reg: u32) -> Option<u32> {
        let v = match reg {
            3 => self.bpc,
            5 => self.bda,
            6 => {
                log::warn!("cop0: JUMPDEST is not implemented, reading 0");
                0
            }
            7 => {
                log::warn!("cop0: reading DCIC, breakpoint logic is not implemented");
                self.dcic
            }
            8 => self.bad_vaddr,
            9 => self.bdam,
            11 => self.bpcm,
            12 => self.sr & SR_WRITE_MASK,
            13 => self.cause & 0xB000_FF7C,
            14 => self.epc,
            // PRID, the value NO$PSX reports
            15 => 0x0000_0002,
            // reads garbage on hardware, 0 is close enough
            16..=31 => 0,
            _ => return None,
        };
        Some(v)
    }

    /// `mtc0` commit. Returns `Ok(check_int)` where `check_int` asks the
    /// interpreter to re-test pending interrupts; `Err(())` flags a reserved
    /// selector.
    pub fn write_reg(&mut self, reg: u32, val: u32) -> Result<bool, ()> {
        match reg {
            3 => self.bpc = val,
            5 => self.bda = val,
            6 => {}
            7 => {
                self.dcic = val;
                log::warn!(
                    "cop0: DCIC written with {:08X}, breakpoint logic is not implemented",
                    val
                );
            }
            8 => {}
            9 => self.bdam = val,
            11 => self.bpcm = val,
            12 => {
                self.sr = val & SR_WRITE_MASK;
                self.update_flags();
                return Ok(true);
            }
            13 => {
                // only the two software interrupt bits are writable
                self.cause = (self.cause & 0xFFFF_FCFF) | (val & 0x0000_0300);
                return Ok(true);
            }
            14 | 15 => {}
            16..=31 => {}
            _ => return Err(()),
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_mode_and_endianness_flags() {
        let mut cop0 = Cop0::default();
        cop0.update_flags();
        assert!(!cop0.user_mode);
        assert!(cop0.is_le);

        cop0.write_reg(12, SR_KUC).unwrap();
        assert!(cop0.user_mode);
        // reverse-endianness only applies in user mode
        assert!(cop0.is_le);
        cop0.write_reg(12, SR_KUC | SR_RE).unwrap();
        assert!(!cop0.is_le);
    }

    #[test]
    fn cache_isolation_requires_scratchpad_off() {
        let mut cop0 = Cop0::default();
        cop0.write_reg(12, SR_ISC).unwrap();
        assert!(cop0.cache_isolated);

        cop0.write_cache_control(0x88);
        assert!(cop0.scratchpad_enabled);
        assert!(!cop0.cache_isolated);
    }

    #[test]
    fn reserved_selectors_are_reported() {
        let cop0 = Cop0::default();
        assert!(cop0.read_reg(0).is_none());
        assert!(cop0.read_reg(2).is_none());
        assert!(cop0.read_reg(3).is_some());
    }
}
