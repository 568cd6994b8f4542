//! オペランドの解決
//!
//! オペコード中のレジスタ番号（r: 0..7, rp: 0..3, cc: 0..7）と
//! インデックスプレフィクス（DD/FD）から実際のレジスタ・実効アドレスを決める。
//! r=6 は (HL) / (IX+d) を指すので呼び出し側でメモリとして扱う。

use super::{flags, Cpu, Index, MemoryBus};

impl Cpu {
    /// プレフィクスに応じた HL / IX / IY
    pub(super) fn index_reg(&self) -> u16 {
        match self.index {
            Index::Hl => self.regs.hl(),
            Index::Ix => self.regs.ix,
            Index::Iy => self.regs.iy,
        }
    }

    pub(super) fn set_index_reg(&mut self, value: u16) {
        match self.index {
            Index::Hl => self.regs.set_hl(value),
            Index::Ix => self.regs.ix = value,
            Index::Iy => self.regs.iy = value,
        }
    }

    /// (HL) または (IX+d)/(IY+d) の実効アドレス
    ///
    /// インデックス時はディスプレースメントを読み、アドレス計算の分だけサイクルを足す。
    pub(super) fn memory_operand<M: MemoryBus>(&mut self, memory: &mut M) -> u16 {
        match self.index {
            Index::Hl => self.regs.hl(),
            _ => {
                let d = self.fetch_byte(memory) as i8;
                self.cycles += 8;
                self.index_reg().wrapping_add(d as i16 as u16)
            }
        }
    }

    /// 8ビットレジスタ（H/L はプレフィクス時 IXH/IXL など）
    pub(super) fn reg8(&self, r: u8) -> u8 {
        match r {
            4 => (self.index_reg() >> 8) as u8,
            5 => self.index_reg() as u8,
            _ => self.reg8_plain(r),
        }
    }

    pub(super) fn set_reg8(&mut self, r: u8, value: u8) {
        match r {
            4 => {
                let v = (self.index_reg() & 0x00FF) | ((value as u16) << 8);
                self.set_index_reg(v);
            }
            5 => {
                let v = (self.index_reg() & 0xFF00) | value as u16;
                self.set_index_reg(v);
            }
            _ => self.set_reg8_plain(r, value),
        }
    }

    /// H/L を置き換えない版（(IX+d) と組む命令用）
    pub(super) fn reg8_plain(&self, r: u8) -> u8 {
        match r {
            0 => self.regs.b,
            1 => self.regs.c,
            2 => self.regs.d,
            3 => self.regs.e,
            4 => self.regs.h,
            5 => self.regs.l,
            7 => self.regs.a,
            _ => 0xFF,
        }
    }

    pub(super) fn set_reg8_plain(&mut self, r: u8, value: u8) {
        match r {
            0 => self.regs.b = value,
            1 => self.regs.c = value,
            2 => self.regs.d = value,
            3 => self.regs.e = value,
            4 => self.regs.h = value,
            5 => self.regs.l = value,
            7 => self.regs.a = value,
            _ => {}
        }
    }

    /// r=6 ならメモリ、それ以外はレジスタを読む
    pub(super) fn read_r<M: MemoryBus>(&mut self, memory: &mut M, r: u8) -> u8 {
        if r == 6 {
            let address = self.memory_operand(memory);
            memory.read(address)
        } else {
            self.reg8(r)
        }
    }

    /// rp: BC, DE, HL(IX/IY), SP
    pub(super) fn reg16(&self, p: u8) -> u16 {
        match p {
            0 => self.regs.bc(),
            1 => self.regs.de(),
            2 => self.index_reg(),
            _ => self.regs.sp,
        }
    }

    pub(super) fn set_reg16(&mut self, p: u8, value: u16) {
        match p {
            0 => self.regs.set_bc(value),
            1 => self.regs.set_de(value),
            2 => self.set_index_reg(value),
            _ => self.regs.sp = value,
        }
    }

    /// rp2: BC, DE, HL(IX/IY), AF（PUSH/POP用）
    pub(super) fn reg16_af(&self, p: u8) -> u16 {
        if p == 3 {
            self.regs.af()
        } else {
            self.reg16(p)
        }
    }

    pub(super) fn set_reg16_af(&mut self, p: u8, value: u16) {
        if p == 3 {
            self.regs.set_af(value);
        } else {
            self.set_reg16(p, value);
        }
    }

    /// 条件コード: NZ, Z, NC, C, PO, PE, P, M
    pub(super) fn condition(&self, cc: u8) -> bool {
        let flag = match cc >> 1 {
            0 => flags::ZERO,
            1 => flags::CARRY,
            2 => flags::PARITY,
            _ => flags::SIGN,
        };
        self.regs.get_flag(flag) == (cc & 1 != 0)
    }

    /// 相対ジャンプ
    pub(super) fn jump_relative(&mut self, offset: u8) {
        self.regs.pc = self.regs.pc.wrapping_add(offset as i8 as i16 as u16);
    }
}
