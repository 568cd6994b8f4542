//! PC-8801 メモリサブシステム
//!
//! ROM / RAM / 拡張RAM / GVRAM / 辞書ROM をバンクテーブルに張り、
//! ポート$31・$32・$5C-$5F・$70・$71・$E2・$E3・$F0・$F1 の内容に応じて張り替える。
//! テキストウィンドウ（$8000-$83FF）だけはページ単位にならないのでここで解決する。

use crate::bank::{BankError, BankTable, BankTarget, BufferId, OPEN_BUS};
use crate::ports::{erom_select, Port31, Port32, PortE2, PortF1};
use serde::{Deserialize, Serialize};

pub const RAM_SIZE: usize = 0x10000;
pub const ROM_SIZE: usize = 0x8000;
/// N88拡張ROM（8KB×4）
pub const EROM_BANK_SIZE: usize = 0x2000;
pub const EROM_BANKS: usize = 4;
/// 拡張RAM（32KB×4）
pub const EXRAM_BANK_SIZE: usize = 0x8000;
pub const EXRAM_BANKS: usize = 4;
/// GVRAM（16KB×3プレーン）
pub const GVRAM_PLANE_SIZE: usize = 0x4000;
pub const GVRAM_PLANES: usize = 3;
/// 辞書ROM（16KB×32）
pub const DICROM_BANK_SIZE: usize = 0x4000;
pub const DICROM_BANKS: usize = 32;

/// 読み込めるROMの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RomKind {
    /// N88-BASIC（$0000-$7FFF）
    N88,
    /// N-BASIC（$0000-$7FFF）
    N80,
    /// N88拡張ROM（4バンク）
    N88Ext,
    /// 辞書ROM
    Dictionary,
}

/// セーブ用のメモリ状態
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryState {
    pub ram: Vec<u8>,
    pub exram: Vec<u8>,
    pub gvram: Vec<u8>,
    pub port31: u8,
    pub port32: u8,
    pub port71: u8,
    pub port_e2: u8,
    pub port_e3: u8,
    pub port_f0: u8,
    pub port_f1: u8,
    pub gvram_plane: Option<usize>,
    pub text_window: u8,
}

/// メモリシステム
pub struct Memory {
    /// 16ページのバンクテーブル
    pub bank: BankTable,
    ram: BufferId,
    n88rom: BufferId,
    n80rom: BufferId,
    n88erom: BufferId,
    exram: BufferId,
    gvram: BufferId,
    dicrom: BufferId,
    /// 辞書ROMが読み込まれているか
    dicrom_loaded: bool,
    port31: Port31,
    port32: Port32,
    /// 0xFF で拡張ROM非選択（bit0=0 で選択）
    port71: u8,
    port_e2: PortE2,
    port_e3: u8,
    port_f0: u8,
    port_f1: PortF1,
    /// $5C-$5E で選ばれたGVRAMプレーン（$5Fでメイン RAM）
    gvram_plane: Option<usize>,
    text_window: u8,
}

impl Memory {
    /// バッファを確保してリセット直後のマップを張る
    pub fn new() -> Result<Self, BankError> {
        let mut bank = BankTable::new();
        let ram = bank.add_buffer(RAM_SIZE, 0x00)?;
        let n88rom = bank.add_buffer(ROM_SIZE, 0xFF)?;
        let n80rom = bank.add_buffer(ROM_SIZE, 0xFF)?;
        let n88erom = bank.add_buffer(EROM_BANK_SIZE * EROM_BANKS, 0xFF)?;
        let exram = bank.add_buffer(EXRAM_BANK_SIZE * EXRAM_BANKS, 0x00)?;
        let gvram = bank.add_buffer(GVRAM_PLANE_SIZE * GVRAM_PLANES, 0x00)?;
        let dicrom = bank.add_buffer(DICROM_BANK_SIZE * DICROM_BANKS, 0xFF)?;

        let mut memory = Memory {
            bank,
            ram,
            n88rom,
            n80rom,
            n88erom,
            exram,
            gvram,
            dicrom,
            dicrom_loaded: false,
            port31: Port31::empty(),
            port32: Port32::empty(),
            port71: 0xFF,
            port_e2: PortE2::empty(),
            port_e3: 0,
            port_f0: 0,
            port_f1: PortF1::DICROM_OFF,
            gvram_plane: None,
            text_window: 0,
        };
        memory.try_remap()?;
        Ok(memory)
    }

    /// ROMイメージを読み込む（長さが足りない分は0xFFのまま）
    pub fn load_rom(&mut self, kind: RomKind, data: &[u8]) {
        let id = match kind {
            RomKind::N88 => self.n88rom,
            RomKind::N80 => self.n80rom,
            RomKind::N88Ext => self.n88erom,
            RomKind::Dictionary => {
                self.dicrom_loaded = !data.is_empty();
                self.dicrom
            }
        };
        if let Some(buf) = self.bank.buffer_mut(id) {
            let len = data.len().min(buf.len());
            buf[..len].copy_from_slice(&data[..len]);
            log::info!("Loaded {:?} ROM ({} bytes)", kind, len);
        }
        self.remap();
    }

    /// RAMとポートを電源投入状態へ戻す（ROMは保持）
    pub fn reset(&mut self) {
        for id in [self.ram, self.exram, self.gvram] {
            if let Some(buf) = self.bank.buffer_mut(id) {
                buf.fill(0);
            }
        }
        self.port31 = Port31::empty();
        self.port32 = Port32::empty();
        self.port71 = 0xFF;
        self.port_e2 = PortE2::empty();
        self.port_e3 = 0;
        self.port_f0 = 0;
        self.port_f1 = PortF1::DICROM_OFF;
        self.gvram_plane = None;
        self.text_window = 0;
        self.remap();
    }

    // ============================================================
    // CPUからのアクセス
    // ============================================================

    /// テキストウィンドウ有効時の実アドレス
    #[inline]
    fn text_window_address(&self, address: u16) -> Option<usize> {
        if address & 0xFC00 != 0x8000 {
            return None;
        }
        if self.port31.intersects(Port31::MMODE | Port31::RMODE) {
            Some(address as usize)
        } else {
            Some((((self.text_window as usize) << 8) + (address as usize & 0x3FF)) & 0xFFFF)
        }
    }

    #[inline]
    pub fn read(&self, address: u16) -> u8 {
        match self.text_window_address(address) {
            Some(real) => self.bank.buffer(self.ram).map_or(OPEN_BUS, |ram| ram[real]),
            None => self.bank.read(address),
        }
    }

    #[inline]
    pub fn write(&mut self, address: u16, value: u8) {
        match self.text_window_address(address) {
            Some(real) => {
                if let Some(ram) = self.bank.buffer_mut(self.ram) {
                    ram[real] = value;
                }
            }
            None => self.bank.write(address, value),
        }
    }

    #[cfg(test)]
    pub fn ram(&self) -> &[u8] {
        self.bank.buffer(self.ram).unwrap_or(&[])
    }

    // ============================================================
    // ポート
    // ============================================================

    pub fn port31(&self) -> Port31 {
        self.port31
    }

    pub fn port32(&self) -> Port32 {
        self.port32
    }

    pub fn write_port31(&mut self, value: u8) {
        let new = Port31::from_bits_retain(value);
        if (self.port31 ^ new).intersects(Port31::MMODE | Port31::RMODE) {
            self.port31 = new;
            self.remap();
        } else {
            self.port31 = new;
        }
    }

    pub fn write_port32(&mut self, value: u8) {
        let old = self.port32;
        self.port32 = Port32::from_bits_retain(value);
        if erom_select(old) != erom_select(self.port32) || (old ^ self.port32).contains(Port32::GVAM) {
            self.remap();
        }
    }

    /// $5C-$5E: GVRAMプレーン選択、$5F: メインRAM
    pub fn select_gvram(&mut self, port: u8) {
        let plane = match port & 3 {
            3 => None,
            p => Some(p as usize),
        };
        if plane != self.gvram_plane {
            self.gvram_plane = plane;
            self.remap();
        }
    }

    pub fn gvram_plane(&self) -> Option<usize> {
        self.gvram_plane
    }

    /// $70: テキストウィンドウ
    pub fn set_text_window(&mut self, value: u8) {
        self.text_window = value;
    }

    /// $78: テキストウィンドウのインクリメント
    pub fn increment_text_window(&mut self) {
        self.text_window = self.text_window.wrapping_add(1);
    }

    pub fn text_window(&self) -> u8 {
        self.text_window
    }

    /// $71: 拡張ROM選択
    pub fn write_port71(&mut self, value: u8) {
        if self.port71 != value {
            self.port71 = value;
            self.remap();
        }
    }

    pub fn port71(&self) -> u8 {
        self.port71
    }

    /// $E2: 拡張RAMの読み書き許可
    pub fn write_port_e2(&mut self, value: u8) {
        self.port_e2 = PortE2::from_bits_retain(value);
        self.remap();
    }

    /// $E3: 拡張RAMバンク選択
    pub fn write_port_e3(&mut self, value: u8) {
        self.port_e3 = value;
        self.remap();
    }

    /// $E2 の読み返し（実装されていないビットは1）
    pub fn read_port_e2(&self) -> u8 {
        !self.port_e2.bits()
    }

    pub fn read_port_e3(&self) -> u8 {
        self.port_e3
    }

    /// $F0: 辞書ROMバンク
    pub fn write_port_f0(&mut self, value: u8) {
        self.port_f0 = value;
        self.remap();
    }

    /// $F1: 辞書ROM有効/無効
    pub fn write_port_f1(&mut self, value: u8) {
        self.port_f1 = PortF1::from_bits_retain(value);
        self.remap();
    }

    // ============================================================
    // バンク張り替え
    // ============================================================

    /// マップを張り直す（範囲は全て固定値なので失敗はログに残すだけ）
    fn remap(&mut self) {
        if let Err(e) = self.try_remap() {
            log::error!("Memory map update failed: {}", e);
        }
    }

    fn try_remap(&mut self) -> Result<(), BankError> {
        self.update_low_memmap()?;
        self.update_high_memmap()
    }

    /// $0000-$7FFF
    fn update_low_memmap(&mut self) -> Result<(), BankError> {
        let exram_bank = (self.port_e3 & 0x0F) as usize;
        let exram = if exram_bank < EXRAM_BANKS {
            BankTarget::at(self.exram, EXRAM_BANK_SIZE * exram_bank)
        } else {
            BankTarget::Unmapped
        };
        let ram = BankTarget::at(self.ram, 0);

        if self.port_e2.contains(PortE2::RDEN) {
            self.bank.set_read_range(0x0000, 0x8000, exram)?;
        } else if self.port31.contains(Port31::MMODE) {
            self.bank.set_read_range(0x0000, 0x8000, ram)?;
        } else if self.port31.contains(Port31::RMODE) {
            self.bank.set_read_range(0x0000, 0x8000, BankTarget::at(self.n80rom, 0))?;
        } else {
            self.bank.set_read_range(0x0000, 0x6000, BankTarget::at(self.n88rom, 0))?;
            let window = if self.port71 & 0x01 == 0 {
                BankTarget::at(self.n88erom, EROM_BANK_SIZE * erom_select(self.port32))
            } else {
                BankTarget::at(self.n88rom, 0x6000)
            };
            self.bank.set_read_range(0x6000, 0x8000, window)?;
        }

        let write = if self.port_e2.contains(PortE2::WREN) { exram } else { ram };
        self.bank.set_write_range(0x0000, 0x8000, write)
    }

    /// $8000-$FFFF
    fn update_high_memmap(&mut self) -> Result<(), BankError> {
        self.bank.set_range(
            0x8000,
            0xC000,
            BankTarget::at(self.ram, 0x8000),
            BankTarget::at(self.ram, 0x8000),
        )?;

        let ram = BankTarget::at(self.ram, 0xC000);
        let gvram = match self.gvram_plane {
            Some(plane) if !self.port32.contains(Port32::GVAM) => {
                Some(BankTarget::at(self.gvram, GVRAM_PLANE_SIZE * plane))
            }
            _ => None,
        };
        if let Some(target) = gvram {
            return self.bank.set_range(0xC000, 0x10000, target, target);
        }

        let read = if self.dicrom_loaded && !self.port_f1.contains(PortF1::DICROM_OFF) {
            let bank = (self.port_f0 & 0x1F) as usize;
            BankTarget::at(self.dicrom, DICROM_BANK_SIZE * bank)
        } else {
            ram
        };
        self.bank.set_range(0xC000, 0x10000, ram, read)
    }

    // ============================================================
    // セーブ/ロード
    // ============================================================

    pub fn save_state(&self) -> MemoryState {
        let copy = |id| self.bank.buffer(id).map(|b| b.to_vec()).unwrap_or_default();
        MemoryState {
            ram: copy(self.ram),
            exram: copy(self.exram),
            gvram: copy(self.gvram),
            port31: self.port31.bits(),
            port32: self.port32.bits(),
            port71: self.port71,
            port_e2: self.port_e2.bits(),
            port_e3: self.port_e3,
            port_f0: self.port_f0,
            port_f1: self.port_f1.bits(),
            gvram_plane: self.gvram_plane,
            text_window: self.text_window,
        }
    }

    pub fn load_state(&mut self, state: &MemoryState) {
        for (id, data) in [(self.ram, &state.ram), (self.exram, &state.exram), (self.gvram, &state.gvram)] {
            if let Some(buf) = self.bank.buffer_mut(id) {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
            }
        }
        self.port31 = Port31::from_bits_retain(state.port31);
        self.port32 = Port32::from_bits_retain(state.port32);
        self.port71 = state.port71;
        self.port_e2 = PortE2::from_bits_retain(state.port_e2);
        self.port_e3 = state.port_e3;
        self.port_f0 = state.port_f0;
        self.port_f1 = PortF1::from_bits_retain(state.port_f1);
        self.gvram_plane = state.gvram_plane.filter(|&p| p < GVRAM_PLANES);
        self.text_window = state.text_window;
        self.remap();
    }
}
