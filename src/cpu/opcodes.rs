//! オペコードの実装
//!
//! オペコードを x(2) y(3) z(3) ビットに分けて解読する。
//! p = y >> 1, q = y & 1。CB / ED / DD / FD プレフィクスもここで扱う。

use super::flags::{CARRY, HALF, PARITY, SIGN, SUBTRACT, X, Y, ZERO};
use super::{Cpu, Index, MemoryBus, SystemBus};

/// 無プレフィクス命令の基本サイクル（条件成立時の追加分は別途）
#[rustfmt::skip]
const CYCLES_MAIN: [u8; 256] = [
    4, 10,  7,  6,  4,  4,  7,  4,  4, 11,  7,  6,  4,  4,  7,  4, // 0x00
    8, 10,  7,  6,  4,  4,  7,  4, 12, 11,  7,  6,  4,  4,  7,  4, // 0x10
    7, 10, 16,  6,  4,  4,  7,  4,  7, 11, 16,  6,  4,  4,  7,  4, // 0x20
    7, 10, 13,  6, 11, 11, 10,  4,  7, 11, 13,  6,  4,  4,  7,  4, // 0x30
    4,  4,  4,  4,  4,  4,  7,  4,  4,  4,  4,  4,  4,  4,  7,  4, // 0x40
    4,  4,  4,  4,  4,  4,  7,  4,  4,  4,  4,  4,  4,  4,  7,  4, // 0x50
    4,  4,  4,  4,  4,  4,  7,  4,  4,  4,  4,  4,  4,  4,  7,  4, // 0x60
    7,  7,  7,  7,  7,  7,  4,  7,  4,  4,  4,  4,  4,  4,  7,  4, // 0x70
    4,  4,  4,  4,  4,  4,  7,  4,  4,  4,  4,  4,  4,  4,  7,  4, // 0x80
    4,  4,  4,  4,  4,  4,  7,  4,  4,  4,  4,  4,  4,  4,  7,  4, // 0x90
    4,  4,  4,  4,  4,  4,  7,  4,  4,  4,  4,  4,  4,  4,  7,  4, // 0xA0
    4,  4,  4,  4,  4,  4,  7,  4,  4,  4,  4,  4,  4,  4,  7,  4, // 0xB0
    5, 10, 10, 10, 10, 11,  7, 11,  5, 10, 10,  0, 10, 17,  7, 11, // 0xC0
    5, 10, 10, 11, 10, 11,  7, 11,  5,  4, 10, 11, 10,  0,  7, 11, // 0xD0
    5, 10, 10, 19, 10, 11,  7, 11,  5,  4, 10,  4, 10,  0,  7, 11, // 0xE0
    5, 10, 10,  4, 10, 11,  7, 11,  5,  6, 10,  4, 10,  0,  7, 11, // 0xF0
];

/// S, Z と未定義ビット X/Y
#[inline]
fn sz(v: u8) -> u8 {
    (v & (SIGN | Y | X)) | if v == 0 { ZERO } else { 0 }
}

#[inline]
fn parity(v: u8) -> u8 {
    if v.count_ones() % 2 == 0 {
        PARITY
    } else {
        0
    }
}

#[inline]
fn szp(v: u8) -> u8 {
    sz(v) | parity(v)
}

impl Cpu {
    /// 無プレフィクス命令（インデックス中はDD/FDの後続としても使う）
    pub(super) fn execute_main<B: SystemBus>(&mut self, bus: &mut B, opcode: u8) {
        self.cycles += CYCLES_MAIN[opcode as usize] as u32;
        let x = opcode >> 6;
        let y = (opcode >> 3) & 7;
        let z = opcode & 7;
        match x {
            0 => self.execute_x0(bus, y, z),
            1 if opcode == 0x76 => self.regs.halted = true,
            1 => self.load_r_r(bus, y, z),
            2 => {
                let v = self.read_r(bus, z);
                self.alu(y, v);
            }
            _ => self.execute_x3(bus, y, z),
        }
    }

    fn execute_x0<B: SystemBus>(&mut self, bus: &mut B, y: u8, z: u8) {
        let p = y >> 1;
        let q = y & 1;
        match z {
            0 => match y {
                0 => {}
                1 => {
                    let af = self.regs.af();
                    self.regs.set_af(self.regs.af_alt);
                    self.regs.af_alt = af;
                }
                2 => {
                    let d = self.fetch_byte(bus);
                    self.regs.b = self.regs.b.wrapping_sub(1);
                    if self.regs.b != 0 {
                        self.jump_relative(d);
                        self.cycles += 5;
                    }
                }
                3 => {
                    let d = self.fetch_byte(bus);
                    self.jump_relative(d);
                }
                _ => {
                    let d = self.fetch_byte(bus);
                    if self.condition(y - 4) {
                        self.jump_relative(d);
                        self.cycles += 5;
                    }
                }
            },
            1 => {
                if q == 0 {
                    let nn = self.fetch_word(bus);
                    self.set_reg16(p, nn);
                } else {
                    let result = self.add16(self.index_reg(), self.reg16(p));
                    self.set_index_reg(result);
                }
            }
            2 => match (q, p) {
                (0, 0) => bus.write(self.regs.bc(), self.regs.a),
                (0, 1) => bus.write(self.regs.de(), self.regs.a),
                (0, 2) => {
                    let nn = self.fetch_word(bus);
                    self.write_word(bus, nn, self.index_reg());
                }
                (0, _) => {
                    let nn = self.fetch_word(bus);
                    bus.write(nn, self.regs.a);
                }
                (_, 0) => self.regs.a = bus.read(self.regs.bc()),
                (_, 1) => self.regs.a = bus.read(self.regs.de()),
                (_, 2) => {
                    let nn = self.fetch_word(bus);
                    let v = self.read_word(bus, nn);
                    self.set_index_reg(v);
                }
                (_, _) => {
                    let nn = self.fetch_word(bus);
                    self.regs.a = bus.read(nn);
                }
            },
            3 => {
                let v = self.reg16(p);
                let v = if q == 0 { v.wrapping_add(1) } else { v.wrapping_sub(1) };
                self.set_reg16(p, v);
            }
            4 | 5 => {
                let dec = z == 5;
                if y == 6 {
                    let address = self.memory_operand(bus);
                    let v = bus.read(address);
                    let r = self.inc_dec8(v, dec);
                    bus.write(address, r);
                } else {
                    let r = self.inc_dec8(self.reg8(y), dec);
                    self.set_reg8(y, r);
                }
            }
            6 => {
                if y == 6 {
                    let address = self.memory_operand(bus);
                    let n = self.fetch_byte(bus);
                    bus.write(address, n);
                    if self.index != Index::Hl {
                        self.cycles -= 3;
                    }
                } else {
                    let n = self.fetch_byte(bus);
                    self.set_reg8(y, n);
                }
            }
            _ => self.accumulator_op(y),
        }
    }

    fn load_r_r<M: MemoryBus>(&mut self, memory: &mut M, y: u8, z: u8) {
        if z == 6 {
            let address = self.memory_operand(memory);
            let v = memory.read(address);
            self.set_reg8_plain(y, v);
        } else if y == 6 {
            let address = self.memory_operand(memory);
            memory.write(address, self.reg8_plain(z));
        } else {
            let v = self.reg8(z);
            self.set_reg8(y, v);
        }
    }

    fn execute_x3<B: SystemBus>(&mut self, bus: &mut B, y: u8, z: u8) {
        let p = y >> 1;
        let q = y & 1;
        match z {
            0 => {
                if self.condition(y) {
                    self.regs.pc = self.pop_word(bus);
                    self.cycles += 6;
                }
            }
            1 => match (q, p) {
                (0, _) => {
                    let v = self.pop_word(bus);
                    self.set_reg16_af(p, v);
                }
                (_, 0) => self.regs.pc = self.pop_word(bus),
                (_, 1) => {
                    let regs = &mut self.regs;
                    let (bc, de, hl) = (regs.bc(), regs.de(), regs.hl());
                    regs.set_bc(regs.bc_alt);
                    regs.set_de(regs.de_alt);
                    regs.set_hl(regs.hl_alt);
                    regs.bc_alt = bc;
                    regs.de_alt = de;
                    regs.hl_alt = hl;
                }
                (_, 2) => self.regs.pc = self.index_reg(),
                (_, _) => self.regs.sp = self.index_reg(),
            },
            2 => {
                let nn = self.fetch_word(bus);
                if self.condition(y) {
                    self.regs.pc = nn;
                }
            }
            3 => match y {
                0 => self.regs.pc = self.fetch_word(bus),
                1 => self.execute_cb(bus),
                2 => {
                    let n = self.fetch_byte(bus);
                    let port = u16::from_be_bytes([self.regs.a, n]);
                    bus.io_write(port, self.regs.a);
                }
                3 => {
                    let n = self.fetch_byte(bus);
                    let port = u16::from_be_bytes([self.regs.a, n]);
                    self.regs.a = bus.io_read(port);
                }
                4 => {
                    let sp = self.regs.sp;
                    let v = self.read_word(bus, sp);
                    self.write_word(bus, sp, self.index_reg());
                    self.set_index_reg(v);
                }
                5 => {
                    let de = self.regs.de();
                    self.regs.set_de(self.regs.hl());
                    self.regs.set_hl(de);
                }
                6 => {
                    self.regs.iff1 = false;
                    self.regs.iff2 = false;
                }
                _ => {
                    self.regs.iff1 = true;
                    self.regs.iff2 = true;
                    self.ei_delay = true;
                }
            },
            4 => {
                let nn = self.fetch_word(bus);
                if self.condition(y) {
                    self.call(bus, nn);
                    self.cycles += 7;
                }
            }
            5 => match (q, p) {
                (0, _) => {
                    let v = self.reg16_af(p);
                    self.push_word(bus, v);
                }
                (_, 0) => {
                    let nn = self.fetch_word(bus);
                    self.call(bus, nn);
                }
                (_, 1) => self.execute_indexed(bus, Index::Ix),
                (_, 2) => self.execute_ed(bus),
                (_, _) => self.execute_indexed(bus, Index::Iy),
            },
            6 => {
                let n = self.fetch_byte(bus);
                self.alu(y, n);
            }
            _ => {
                let pc = self.regs.pc;
                self.push_word(bus, pc);
                self.regs.pc = (y as u16) * 8;
            }
        }
    }

    fn call<M: MemoryBus>(&mut self, memory: &mut M, target: u16) {
        let pc = self.regs.pc;
        self.push_word(memory, pc);
        self.regs.pc = target;
    }

    /// DD / FD プレフィクス
    fn execute_indexed<B: SystemBus>(&mut self, bus: &mut B, index: Index) {
        self.cycles += 4;
        let opcode = self.fetch_opcode(bus);
        match opcode {
            // 連続したプレフィクスは前のものを捨てて次の命令として扱う
            0xDD | 0xFD | 0xED => self.regs.pc = self.regs.pc.wrapping_sub(1),
            0xCB => {
                self.index = index;
                self.execute_index_cb(bus);
                self.index = Index::Hl;
            }
            _ => {
                self.index = index;
                self.execute_main(bus, opcode);
                self.index = Index::Hl;
            }
        }
    }

    // ============================================================
    // CB プレフィクス
    // ============================================================

    fn execute_cb<M: MemoryBus>(&mut self, memory: &mut M) {
        let opcode = self.fetch_opcode(memory);
        let x = opcode >> 6;
        let y = (opcode >> 3) & 7;
        let z = opcode & 7;
        if z == 6 {
            let address = self.regs.hl();
            let v = memory.read(address);
            let r = self.bit_op(x, y, v);
            if x == 1 {
                self.cycles += 12;
            } else {
                memory.write(address, r);
                self.cycles += 15;
            }
        } else {
            let v = self.reg8_plain(z);
            let r = self.bit_op(x, y, v);
            if x != 1 {
                self.set_reg8_plain(z, r);
            }
            self.cycles += 8;
        }
    }

    /// DD CB d op / FD CB d op
    fn execute_index_cb<M: MemoryBus>(&mut self, memory: &mut M) {
        let d = self.fetch_byte(memory) as i8;
        let opcode = self.fetch_byte(memory);
        let x = opcode >> 6;
        let y = (opcode >> 3) & 7;
        let z = opcode & 7;
        let address = self.index_reg().wrapping_add(d as i16 as u16);
        let v = memory.read(address);
        let r = self.bit_op(x, y, v);
        if x == 1 {
            self.cycles += 16;
        } else {
            memory.write(address, r);
            if z != 6 {
                self.set_reg8_plain(z, r);
            }
            self.cycles += 19;
        }
    }

    /// x=0 ローテート/シフト, 1 BIT, 2 RES, 3 SET
    fn bit_op(&mut self, x: u8, y: u8, v: u8) -> u8 {
        match x {
            0 => self.rotate_shift(y, v),
            1 => {
                let bit = v & (1 << y);
                let mut f = (self.regs.f & CARRY) | HALF | (v & (X | Y));
                if bit == 0 {
                    f |= ZERO | PARITY;
                }
                if y == 7 && bit != 0 {
                    f |= SIGN;
                }
                self.regs.f = f;
                v
            }
            2 => v & !(1 << y),
            _ => v | (1 << y),
        }
    }

    /// RLC RRC RL RR SLA SRA SLL SRL
    fn rotate_shift(&mut self, y: u8, v: u8) -> u8 {
        let carry_in = self.regs.f & CARRY;
        let (r, carry) = match y {
            0 => (v.rotate_left(1), v >> 7),
            1 => (v.rotate_right(1), v & 1),
            2 => ((v << 1) | carry_in, v >> 7),
            3 => ((v >> 1) | (carry_in << 7), v & 1),
            4 => (v << 1, v >> 7),
            5 => ((v >> 1) | (v & 0x80), v & 1),
            6 => ((v << 1) | 1, v >> 7),
            _ => (v >> 1, v & 1),
        };
        self.regs.f = szp(r) | carry;
        r
    }

    // ============================================================
    // ED プレフィクス
    // ============================================================

    fn execute_ed<B: SystemBus>(&mut self, bus: &mut B) {
        let opcode = self.fetch_opcode(bus);
        let x = opcode >> 6;
        let y = (opcode >> 3) & 7;
        let z = opcode & 7;
        let p = y >> 1;
        let q = y & 1;
        match (x, z) {
            (1, 0) => {
                let v = bus.io_read(self.regs.bc());
                if y != 6 {
                    self.set_reg8_plain(y, v);
                }
                self.regs.f = (self.regs.f & CARRY) | szp(v);
                self.cycles += 12;
            }
            (1, 1) => {
                let v = if y == 6 { 0 } else { self.reg8_plain(y) };
                bus.io_write(self.regs.bc(), v);
                self.cycles += 12;
            }
            (1, 2) => {
                let v = self.reg16(p);
                if q == 0 {
                    self.sbc16(v);
                } else {
                    self.adc16(v);
                }
                self.cycles += 15;
            }
            (1, 3) => {
                let nn = self.fetch_word(bus);
                if q == 0 {
                    self.write_word(bus, nn, self.reg16(p));
                } else {
                    let v = self.read_word(bus, nn);
                    self.set_reg16(p, v);
                }
                self.cycles += 20;
            }
            (1, 4) => {
                let v = self.regs.a;
                self.regs.a = 0;
                self.regs.a = self.sub8(v, false);
                self.cycles += 8;
            }
            (1, 5) => {
                // RETN / RETI
                self.regs.pc = self.pop_word(bus);
                self.regs.iff1 = self.regs.iff2;
                self.cycles += 14;
            }
            (1, 6) => {
                self.regs.im = [0, 0, 1, 2][(y & 3) as usize];
                self.cycles += 8;
            }
            (1, 7) => self.execute_ed_misc(bus, y),
            (2, 0..=3) if y >= 4 => self.block_op(bus, y, z),
            _ => self.cycles += 8,
        }
    }

    fn execute_ed_misc<M: MemoryBus>(&mut self, memory: &mut M, y: u8) {
        match y {
            0 => {
                self.regs.i = self.regs.a;
                self.cycles += 9;
            }
            1 => {
                self.regs.r = self.regs.a;
                self.cycles += 9;
            }
            2 | 3 => {
                let v = if y == 2 { self.regs.i } else { self.regs.r };
                self.regs.a = v;
                self.regs.f = (self.regs.f & CARRY) | sz(v) | if self.regs.iff2 { PARITY } else { 0 };
                self.cycles += 9;
            }
            4 | 5 => {
                let address = self.regs.hl();
                let m = memory.read(address);
                let a = self.regs.a;
                let (new_m, new_a) = if y == 4 {
                    // RRD
                    ((a << 4) | (m >> 4), (a & 0xF0) | (m & 0x0F))
                } else {
                    // RLD
                    ((m << 4) | (a & 0x0F), (a & 0xF0) | (m >> 4))
                };
                memory.write(address, new_m);
                self.regs.a = new_a;
                self.regs.f = (self.regs.f & CARRY) | szp(new_a);
                self.cycles += 18;
            }
            _ => self.cycles += 8,
        }
    }

    /// LDI/LDD/CPI/CPD/INI/IND/OUTI/OUTD とリピート版
    fn block_op<B: SystemBus>(&mut self, bus: &mut B, y: u8, z: u8) {
        let step: u16 = if y & 1 == 0 { 1 } else { 0xFFFF };
        let repeat = y >= 6;
        let hl = self.regs.hl();
        self.cycles += 16;
        let again = match z {
            0 => {
                let v = bus.read(hl);
                let de = self.regs.de();
                bus.write(de, v);
                self.regs.set_hl(hl.wrapping_add(step));
                self.regs.set_de(de.wrapping_add(step));
                let bc = self.regs.bc().wrapping_sub(1);
                self.regs.set_bc(bc);
                let n = v.wrapping_add(self.regs.a);
                self.regs.f = (self.regs.f & (SIGN | ZERO | CARRY))
                    | (n & X)
                    | ((n << 4) & Y)
                    | if bc != 0 { PARITY } else { 0 };
                bc != 0
            }
            1 => {
                let v = bus.read(hl);
                let a = self.regs.a;
                let r = a.wrapping_sub(v);
                self.regs.set_hl(hl.wrapping_add(step));
                let bc = self.regs.bc().wrapping_sub(1);
                self.regs.set_bc(bc);
                let half = (a ^ v ^ r) & HALF;
                let n = r.wrapping_sub(if half != 0 { 1 } else { 0 });
                self.regs.f = (self.regs.f & CARRY)
                    | SUBTRACT
                    | (sz(r) & (SIGN | ZERO))
                    | half
                    | (n & X)
                    | ((n << 4) & Y)
                    | if bc != 0 { PARITY } else { 0 };
                bc != 0 && r != 0
            }
            2 => {
                let v = bus.io_read(self.regs.bc());
                bus.write(hl, v);
                self.regs.set_hl(hl.wrapping_add(step));
                self.regs.b = self.regs.b.wrapping_sub(1);
                self.regs.f = sz(self.regs.b) | SUBTRACT;
                self.regs.b != 0
            }
            _ => {
                let v = bus.read(hl);
                self.regs.b = self.regs.b.wrapping_sub(1);
                bus.io_write(self.regs.bc(), v);
                self.regs.set_hl(hl.wrapping_add(step));
                self.regs.f = sz(self.regs.b) | SUBTRACT;
                self.regs.b != 0
            }
        };
        if repeat && again {
            self.regs.pc = self.regs.pc.wrapping_sub(2);
            self.cycles += 5;
        }
    }

    // ============================================================
    // 演算
    // ============================================================

    /// ADD ADC SUB SBC AND XOR OR CP
    pub(super) fn alu(&mut self, op: u8, v: u8) {
        let carry = self.regs.f & CARRY != 0;
        match op {
            0 => self.add8(v, false),
            1 => self.add8(v, carry),
            2 => self.regs.a = self.sub8(v, false),
            3 => self.regs.a = self.sub8(v, carry),
            4 => {
                self.regs.a &= v;
                self.regs.f = szp(self.regs.a) | HALF;
            }
            5 => {
                self.regs.a ^= v;
                self.regs.f = szp(self.regs.a);
            }
            6 => {
                self.regs.a |= v;
                self.regs.f = szp(self.regs.a);
            }
            _ => {
                self.sub8(v, false);
                self.regs.f = (self.regs.f & !(X | Y)) | (v & (X | Y));
            }
        }
    }

    fn add8(&mut self, v: u8, carry_in: bool) {
        let a = self.regs.a;
        let wide = a as u16 + v as u16 + carry_in as u16;
        let r = wide as u8;
        let overflow = (a ^ v) & 0x80 == 0 && (a ^ r) & 0x80 != 0;
        self.regs.f = sz(r)
            | ((a ^ v ^ r) & HALF)
            | if overflow { PARITY } else { 0 }
            | if wide > 0xFF { CARRY } else { 0 };
        self.regs.a = r;
    }

    /// 減算してフラグを立て、結果を返す（Aには格納しない）
    fn sub8(&mut self, v: u8, carry_in: bool) -> u8 {
        let a = self.regs.a;
        let c = carry_in as u16;
        let r = (a as u16).wrapping_sub(v as u16).wrapping_sub(c) as u8;
        let overflow = (a ^ v) & 0x80 != 0 && (a ^ r) & 0x80 != 0;
        self.regs.f = sz(r)
            | SUBTRACT
            | ((a ^ v ^ r) & HALF)
            | if overflow { PARITY } else { 0 }
            | if (a as u16) < v as u16 + c { CARRY } else { 0 };
        r
    }

    fn inc_dec8(&mut self, v: u8, dec: bool) -> u8 {
        let carry = self.regs.f & CARRY;
        if dec {
            let r = v.wrapping_sub(1);
            self.regs.f = carry
                | SUBTRACT
                | sz(r)
                | if v & 0x0F == 0 { HALF } else { 0 }
                | if v == 0x80 { PARITY } else { 0 };
            r
        } else {
            let r = v.wrapping_add(1);
            self.regs.f = carry
                | sz(r)
                | if v & 0x0F == 0x0F { HALF } else { 0 }
                | if v == 0x7F { PARITY } else { 0 };
            r
        }
    }

    fn add16(&mut self, a: u16, b: u16) -> u16 {
        let wide = a as u32 + b as u32;
        let r = wide as u16;
        self.regs.f = (self.regs.f & (SIGN | ZERO | PARITY))
            | ((r >> 8) as u8 & (X | Y))
            | (((a ^ b ^ r) >> 8) as u8 & HALF)
            | if wide > 0xFFFF { CARRY } else { 0 };
        r
    }

    fn adc16(&mut self, v: u16) {
        let hl = self.regs.hl();
        let c = (self.regs.f & CARRY) as u32;
        let wide = hl as u32 + v as u32 + c;
        let r = wide as u16;
        let overflow = (hl ^ v) & 0x8000 == 0 && (hl ^ r) & 0x8000 != 0;
        self.regs.f = ((r >> 8) as u8 & (SIGN | X | Y))
            | if r == 0 { ZERO } else { 0 }
            | (((hl ^ v ^ r) >> 8) as u8 & HALF)
            | if overflow { PARITY } else { 0 }
            | if wide > 0xFFFF { CARRY } else { 0 };
        self.regs.set_hl(r);
    }

    fn sbc16(&mut self, v: u16) {
        let hl = self.regs.hl();
        let c = (self.regs.f & CARRY) as u32;
        let r = (hl as u32).wrapping_sub(v as u32).wrapping_sub(c) as u16;
        let overflow = (hl ^ v) & 0x8000 != 0 && (hl ^ r) & 0x8000 != 0;
        self.regs.f = ((r >> 8) as u8 & (SIGN | X | Y))
            | if r == 0 { ZERO } else { 0 }
            | SUBTRACT
            | (((hl ^ v ^ r) >> 8) as u8 & HALF)
            | if overflow { PARITY } else { 0 }
            | if (hl as u32) < v as u32 + c { CARRY } else { 0 };
        self.regs.set_hl(r);
    }

    /// RLCA RRCA RLA RRA DAA CPL SCF CCF
    fn accumulator_op(&mut self, y: u8) {
        let a = self.regs.a;
        let f = self.regs.f;
        let keep = f & (SIGN | ZERO | PARITY);
        match y {
            0..=3 => {
                let carry_in = f & CARRY;
                let (r, carry) = match y {
                    0 => (a.rotate_left(1), a >> 7),
                    1 => (a.rotate_right(1), a & 1),
                    2 => ((a << 1) | carry_in, a >> 7),
                    _ => ((a >> 1) | (carry_in << 7), a & 1),
                };
                self.regs.a = r;
                self.regs.f = keep | (r & (X | Y)) | carry;
            }
            4 => self.daa(),
            5 => {
                let r = !a;
                self.regs.a = r;
                self.regs.f = (f & (SIGN | ZERO | PARITY | CARRY)) | HALF | SUBTRACT | (r & (X | Y));
            }
            6 => self.regs.f = keep | CARRY | (a & (X | Y)),
            _ => {
                let carry = f & CARRY;
                self.regs.f = keep | (a & (X | Y)) | if carry != 0 { HALF } else { CARRY };
            }
        }
    }

    fn daa(&mut self) {
        let a = self.regs.a;
        let f = self.regs.f;
        let subtract = f & SUBTRACT != 0;
        let mut correction = 0u8;
        let mut carry = f & CARRY != 0;
        if f & HALF != 0 || (a & 0x0F) > 9 {
            correction |= 0x06;
        }
        if carry || a > 0x99 {
            correction |= 0x60;
            carry = true;
        }
        let (r, half) = if subtract {
            (a.wrapping_sub(correction), f & HALF != 0 && (a & 0x0F) < 6)
        } else {
            (a.wrapping_add(correction), (a & 0x0F) > 9)
        };
        self.regs.a = r;
        self.regs.f = szp(r)
            | (f & SUBTRACT)
            | if half { HALF } else { 0 }
            | if carry { CARRY } else { 0 };
    }
}
