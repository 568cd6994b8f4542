//! Z80 CPUエミュレータ
//!
//! PC-8801のメインCPU。マシン側とは `SystemBus` だけでつながる。
//! 割り込みは命令境界でのみ確認し、受理時にバス経由でベクタを取得する。

mod addressing;
mod opcodes;

use serde::{Deserialize, Serialize};

/// フラグレジスタのビット
pub mod flags {
    pub const CARRY: u8 = 0x01; // C
    pub const SUBTRACT: u8 = 0x02; // N
    pub const PARITY: u8 = 0x04; // P/V
    pub const X: u8 = 0x08; // 未定義（bit3）
    pub const HALF: u8 = 0x10; // H
    pub const Y: u8 = 0x20; // 未定義（bit5）
    pub const ZERO: u8 = 0x40; // Z
    pub const SIGN: u8 = 0x80; // S
}

/// CPUレジスタ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    pub a: u8,
    pub f: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    /// 裏レジスタ AF' BC' DE' HL'
    pub af_alt: u16,
    pub bc_alt: u16,
    pub de_alt: u16,
    pub hl_alt: u16,
    pub ix: u16,
    pub iy: u16,
    pub sp: u16,
    pub pc: u16,
    pub i: u8,
    pub r: u8,
    pub iff1: bool,
    pub iff2: bool,
    /// 割り込みモード（0/1/2）
    pub im: u8,
    pub halted: bool,
}

impl Default for Registers {
    fn default() -> Self {
        Registers {
            a: 0xFF,
            f: 0xFF,
            b: 0,
            c: 0,
            d: 0,
            e: 0,
            h: 0,
            l: 0,
            af_alt: 0,
            bc_alt: 0,
            de_alt: 0,
            hl_alt: 0,
            ix: 0xFFFF,
            iy: 0xFFFF,
            sp: 0xFFFF,
            pc: 0,
            i: 0,
            r: 0,
            iff1: false,
            iff2: false,
            im: 0,
            halted: false,
        }
    }
}

impl Registers {
    #[inline]
    pub fn af(&self) -> u16 {
        u16::from_be_bytes([self.a, self.f])
    }

    #[inline]
    pub fn bc(&self) -> u16 {
        u16::from_be_bytes([self.b, self.c])
    }

    #[inline]
    pub fn de(&self) -> u16 {
        u16::from_be_bytes([self.d, self.e])
    }

    #[inline]
    pub fn hl(&self) -> u16 {
        u16::from_be_bytes([self.h, self.l])
    }

    pub fn set_af(&mut self, v: u16) {
        [self.a, self.f] = v.to_be_bytes();
    }

    pub fn set_bc(&mut self, v: u16) {
        [self.b, self.c] = v.to_be_bytes();
    }

    pub fn set_de(&mut self, v: u16) {
        [self.d, self.e] = v.to_be_bytes();
    }

    pub fn set_hl(&mut self, v: u16) {
        [self.h, self.l] = v.to_be_bytes();
    }

    /// フラグをセット
    pub fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.f |= flag;
        } else {
            self.f &= !flag;
        }
    }

    /// フラグを取得
    pub fn get_flag(&self, flag: u8) -> bool {
        (self.f & flag) != 0
    }
}

/// メモリバスインターフェース
pub trait MemoryBus {
    /// メモリから1バイト読み取り
    fn read(&mut self, address: u16) -> u8;
    /// メモリに1バイト書き込み
    fn write(&mut self, address: u16, value: u8);
}

/// CPUから見たシステム全体（メモリ + I/O + 割り込み）
pub trait SystemBus: MemoryBus {
    fn io_read(&mut self, port: u16) -> u8;
    fn io_write(&mut self, port: u16, value: u8);
    /// 命令境界ごとに1回だけ呼ばれる
    fn irq_pending(&mut self) -> bool;
    /// 割り込み受理。モード2のベクタ下位バイトを返す
    fn irq_acknowledge(&mut self) -> u8;
}

/// インデックスプレフィクスの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Index {
    #[default]
    Hl,
    Ix,
    Iy,
}

/// Z80 CPU
#[derive(Debug, Clone, Default)]
pub struct Cpu {
    pub regs: Registers,
    /// 累積サイクル数
    pub total_cycles: u64,
    /// 現在の命令で消費したサイクル
    pub cycles: u32,
    /// EI直後の1命令は割り込みを受け付けない
    ei_delay: bool,
    /// 実行中のインデックスプレフィクス
    pub(crate) index: Index,
}

impl Cpu {
    pub fn new() -> Self {
        Self::default()
    }

    /// CPUをリセット（PC=0、割り込み禁止、モード0）
    pub fn reset(&mut self) {
        self.regs = Registers::default();
        self.cycles = 0;
        self.ei_delay = false;
        self.index = Index::Hl;
    }

    /// 1命令（または割り込み応答）を実行し、消費したサイクル数を返す
    pub fn step<B: SystemBus>(&mut self, bus: &mut B) -> u32 {
        self.cycles = 0;

        let ei_delay = std::mem::take(&mut self.ei_delay);
        if !ei_delay && self.regs.iff1 && bus.irq_pending() {
            self.accept_interrupt(bus);
            self.total_cycles += self.cycles as u64;
            return self.cycles;
        }

        if self.regs.halted {
            // HALT中はNOPを繰り返す
            self.bump_r();
            self.cycles = 4;
            self.total_cycles += 4;
            return 4;
        }

        let opcode = self.fetch_opcode(bus);
        self.index = Index::Hl;
        self.execute_main(bus, opcode);

        self.total_cycles += self.cycles as u64;
        self.cycles
    }

    /// 割り込み受理
    fn accept_interrupt<B: SystemBus>(&mut self, bus: &mut B) {
        self.regs.halted = false;
        self.regs.iff1 = false;
        self.regs.iff2 = false;
        self.bump_r();
        let vector = bus.irq_acknowledge();
        let pc = self.regs.pc;
        match self.regs.im {
            2 => {
                self.push_word(bus, pc);
                let table = u16::from_be_bytes([self.regs.i, vector & 0xFE]);
                self.regs.pc = self.read_word(bus, table);
                self.cycles = 19;
            }
            1 => {
                self.push_word(bus, pc);
                self.regs.pc = 0x0038;
                self.cycles = 13;
            }
            _ => {
                // モード0: データバス上の命令としてRSTを実行する
                self.push_word(bus, pc);
                self.regs.pc = (vector & 0x38) as u16;
                self.cycles = 13;
            }
        }
    }

    #[inline]
    fn bump_r(&mut self) {
        self.regs.r = (self.regs.r & 0x80) | (self.regs.r.wrapping_add(1) & 0x7F);
    }

    /// M1サイクル（Rレジスタを進める）
    fn fetch_opcode<M: MemoryBus>(&mut self, memory: &mut M) -> u8 {
        self.bump_r();
        self.fetch_byte(memory)
    }

    fn fetch_byte<M: MemoryBus>(&mut self, memory: &mut M) -> u8 {
        let value = memory.read(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(1);
        value
    }

    fn fetch_word<M: MemoryBus>(&mut self, memory: &mut M) -> u16 {
        let low = self.fetch_byte(memory);
        let high = self.fetch_byte(memory);
        u16::from_le_bytes([low, high])
    }

    fn read_word<M: MemoryBus>(&mut self, memory: &mut M, address: u16) -> u16 {
        let low = memory.read(address);
        let high = memory.read(address.wrapping_add(1));
        u16::from_le_bytes([low, high])
    }

    fn write_word<M: MemoryBus>(&mut self, memory: &mut M, address: u16, value: u16) {
        let [low, high] = value.to_le_bytes();
        memory.write(address, low);
        memory.write(address.wrapping_add(1), high);
    }

    fn push_word<M: MemoryBus>(&mut self, memory: &mut M, value: u16) {
        let [low, high] = value.to_le_bytes();
        self.regs.sp = self.regs.sp.wrapping_sub(1);
        memory.write(self.regs.sp, high);
        self.regs.sp = self.regs.sp.wrapping_sub(1);
        memory.write(self.regs.sp, low);
    }

    fn pop_word<M: MemoryBus>(&mut self, memory: &mut M) -> u16 {
        let low = memory.read(self.regs.sp);
        self.regs.sp = self.regs.sp.wrapping_add(1);
        let high = memory.read(self.regs.sp);
        self.regs.sp = self.regs.sp.wrapping_add(1);
        u16::from_le_bytes([low, high])
    }
}
