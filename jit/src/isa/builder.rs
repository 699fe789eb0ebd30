//! Fluent instruction-word builder (spec §4.2, component C2).
//!
//! An `InstrBuilder` wraps a raw [`super::encoding`] template and exposes
//! chained `set*` calls that OR operand bits into the right bitfield holes;
//! the final `finish()` yields the encoded 32-bit word. Mirrors the
//! teacher's binemit style of building an instruction word incrementally
//! rather than constructing a struct-of-fields and encoding it in one shot.

use crate::regs::Reg;

fn field(shift: u32, width: u32, value: u32) -> u32 {
    let mask = if width >= 32 { u32::MAX } else { (1u32 << width) - 1 };
    (value & mask) << shift
}

/// Builds a single AArch64 instruction word on top of a template from
/// [`super::encoding::templates`].
#[derive(Debug, Clone, Copy)]
pub struct InstrBuilder {
    word: u32,
}

impl InstrBuilder {
    /// Start from a raw template (operand fields zeroed).
    pub fn new(template: u32) -> Self {
        InstrBuilder { word: template }
    }

    fn reg_encoding(reg: Reg) -> u32 {
        reg.encoding().unwrap_or(31) as u32
    }

    /// Destination register field (`Rd`, bits 4:0).
    pub fn set_d(mut self, reg: Reg) -> Self {
        self.word |= field(0, 5, Self::reg_encoding(reg));
        self
    }

    /// First-source/base register field (`Rn`, bits 9:5).
    pub fn set_n(mut self, reg: Reg) -> Self {
        self.word |= field(5, 5, Self::reg_encoding(reg));
        self
    }

    /// Second-source/index register field (`Rm`, bits 20:16).
    pub fn set_m(mut self, reg: Reg) -> Self {
        self.word |= field(16, 5, Self::reg_encoding(reg));
        self
    }

    /// Transfer register field for loads/stores/branch-register forms
    /// (`Rt`, bits 4:0 — same physical slot as `Rd`, named separately to
    /// match how the spec refers to load/store operands).
    pub fn set_t(mut self, reg: Reg) -> Self {
        self.word |= field(0, 5, Self::reg_encoding(reg));
        self
    }

    /// First register of a pair-transfer instruction (`Rt`, bits 4:0).
    pub fn set_t1(self, reg: Reg) -> Self {
        self.set_t(reg)
    }

    /// Second register of a pair-transfer instruction (`Rt2`, bits 14:10).
    pub fn set_t2(mut self, reg: Reg) -> Self {
        self.word |= field(10, 5, Self::reg_encoding(reg));
        self
    }

    /// Accumulator register for three-source data-processing forms (`Ra`,
    /// bits 14:10 — `MADD`/`MSUB`).
    pub fn set_a(mut self, reg: Reg) -> Self {
        self.word |= field(10, 5, Self::reg_encoding(reg));
        self
    }

    /// 16-bit immediate (`MOVZ`/`MOVN`/`MOVK`, bits 20:5).
    pub fn set_imm16(mut self, imm: u16) -> Self {
        self.word |= field(5, 16, imm as u32);
        self
    }

    /// `hw` shift-amount field for the `MOV*` family (bits 22:21, in units
    /// of 16 bits).
    pub fn set_hw(mut self, hw: u8) -> Self {
        self.word |= field(21, 2, hw as u32);
        self
    }

    /// 12-bit unsigned immediate (`ADD`/`SUB`/`CMP`-immediate, bits 21:10).
    pub fn set_imm12(mut self, imm: u16) -> Self {
        self.word |= field(10, 12, imm as u32);
        self
    }

    /// `ADD`/`SUB`-immediate's left-shift-by-12 selector (bit 22).
    pub fn set_shift12(mut self, shifted: bool) -> Self {
        self.word |= field(22, 1, shifted as u32);
        self
    }

    /// 6-bit shift amount for register-shifted forms (bits 15:10).
    pub fn set_imm6(mut self, imm: u8) -> Self {
        self.word |= field(10, 6, imm as u32);
        self
    }

    /// Logical-immediate encoding's `N` bit (bit 22).
    pub fn set_n_bit(mut self, n: u32) -> Self {
        self.word |= field(22, 1, n);
        self
    }

    /// Logical-immediate encoding's `immr` field (bits 21:16).
    pub fn set_immr(mut self, immr: u32) -> Self {
        self.word |= field(16, 6, immr);
        self
    }

    /// Logical-immediate encoding's `imms` field (bits 15:10).
    pub fn set_imms(mut self, imms: u32) -> Self {
        self.word |= field(10, 6, imms);
        self
    }

    /// Condition-code field for `B.cond` (bits 3:0).
    pub fn set_cond_branch(mut self, cond: u8) -> Self {
        self.word |= field(0, 4, cond as u32);
        self
    }

    /// Condition-code field for `CSEL`/`CSINC` (bits 15:12).
    pub fn set_cond_select(mut self, cond: u8) -> Self {
        self.word |= field(12, 4, cond as u32);
        self
    }

    /// 26-bit signed word-granularity displacement (`B`/`BL`).
    pub fn set_imm26(mut self, imm: i32) -> Self {
        self.word |= field(0, 26, imm as u32);
        self
    }

    /// 19-bit signed word-granularity displacement (`B.cond`/`CBZ`/`CBNZ`).
    pub fn set_imm19(mut self, imm: i32) -> Self {
        self.word |= field(5, 19, imm as u32);
        self
    }

    /// `ADR`'s split 21-bit byte-granularity displacement (`immlo`:`immhi`).
    pub fn set_imm21_adr(mut self, imm: i32) -> Self {
        let imm = imm as u32;
        self.word |= field(29, 2, imm & 0b11);
        self.word |= field(5, 19, imm >> 2);
        self
    }

    /// 8-bit VFP modified immediate (`FMOV` scalar-immediate forms).
    pub fn set_imm8_float(mut self, imm: u8) -> Self {
        self.word |= field(13, 8, imm as u32);
        self
    }

    /// Scaled 12-bit unsigned offset for `LDR`/`STR` (immediate, unsigned
    /// offset form); `log2_size` is 2 for 32-bit transfers, 3 for 64-bit.
    pub fn set_scaled_offset12(mut self, byte_offset: i32, log2_size: u32) -> Self {
        debug_assert_eq!(byte_offset & ((1 << log2_size) - 1), 0, "misaligned offset");
        self.word |= field(10, 12, (byte_offset >> log2_size) as u32);
        self
    }

    /// Signed 9-bit unscaled offset used by pre/post-indexed and unscaled
    /// load/store-pair forms (bits 21:15, scaled by `log2_size` by the
    /// hardware for pairs).
    pub fn set_imm7_pair(mut self, scaled_offset: i32) -> Self {
        self.word |= field(15, 7, scaled_offset as u32);
        self
    }

    /// Signed 9-bit byte-granularity unscaled offset (`LDUR`/`STUR`, bits
    /// 20:12).
    pub fn set_imm9_unscaled(mut self, byte_offset: i32) -> Self {
        debug_assert!((-256..256).contains(&byte_offset));
        self.word |= field(12, 9, byte_offset as u32);
        self
    }

    /// Arbitrary extra bitfield, for the handful of one-off encodings that
    /// don't fit the named setters above.
    pub fn set_field(mut self, shift: u32, width: u32, value: u32) -> Self {
        self.word |= field(shift, width, value);
        self
    }

    /// Emit the finished instruction word.
    pub fn finish(self) -> u32 {
        self.word
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::encoding::templates;

    #[test]
    fn movz_builds_known_encoding() {
        // `movz w1, #5` = 0x52800000 | (5 << 5) | 1
        let word = InstrBuilder::new(templates::MOVZ32)
            .set_imm16(5)
            .set_d(Reg::Gpr(1))
            .finish();
        assert_eq!(word, templates::MOVZ32 | (5 << 5) | 1);
    }

    #[test]
    fn add_reg_sets_all_three_operands() {
        let word = InstrBuilder::new(templates::ADD_REG64)
            .set_d(Reg::Gpr(0))
            .set_n(Reg::Gpr(1))
            .set_m(Reg::Gpr(2))
            .finish();
        assert_eq!(word, templates::ADD_REG64 | (2 << 16) | (1 << 5) | 0);
    }

    #[test]
    fn adr_splits_immlo_and_immhi() {
        let word = InstrBuilder::new(templates::ADR).set_imm21_adr(9).set_d(Reg::Gpr(3)).finish();
        // imm = 9 = 0b1001: immlo = 0b01, immhi = 0b0010
        assert_eq!(word, templates::ADR | (0b01 << 29) | (0b0010 << 5) | 3);
    }
}
