//! サウンドボードのレジスタポート（OPN / OPNA）
//!
//! FM/SSG の合成はしない。ソフトが音源の有無と種類を判別できるように、
//! アドレスラッチ、SSGレジスタの読み返し、ステータスだけを持つ。
//! ボードなしの構成では全ポートがオープンバス（0xFF）になる。

use serde::{Deserialize, Serialize};

use crate::config::SoundBoard;

/// OPNA のIDレジスタ値
pub const OPNA_ID: u8 = 0x01;

/// IDレジスタ
const REG_ID: u8 = 0xFF;
/// SSGの読み返しできるレジスタの上限（$0E/$0F はジョイスティック入力）
const REG_SSG_LAST: u8 = 0x0D;
const REG_PORT_A: u8 = 0x0E;
const REG_PORT_B: u8 = 0x0F;

/// レジスタの数（拡張バンク込み）
const REG_COUNT: usize = 0x200;

/// セーブ用のレジスタ状態
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpnState {
    /// ポート$44 / $46 で選んだレジスタ番号
    pub address: [u8; 2],
    pub regs: Vec<u8>,
}

impl Default for OpnState {
    fn default() -> Self {
        OpnState {
            address: [0; 2],
            regs: vec![0; REG_COUNT],
        }
    }
}

/// ポート$44-$47
#[derive(Debug, Clone)]
pub struct SoundPorts {
    board: SoundBoard,
    st: OpnState,
}

impl SoundPorts {
    pub fn new(board: SoundBoard) -> Self {
        SoundPorts {
            board,
            st: OpnState::default(),
        }
    }

    /// ボード種別の差し替え（レジスタは保持）
    pub fn set_board(&mut self, board: SoundBoard) {
        if board != self.board {
            log::info!("Sound board: {:?}", board);
        }
        self.board = board;
    }

    pub fn reset(&mut self) {
        self.st = OpnState::default();
    }

    fn has_extended(&self) -> bool {
        self.board == SoundBoard::OpnA
    }

    pub fn read(&self, port: u8) -> u8 {
        match (self.board, port) {
            (SoundBoard::None, _) => 0xFF,
            // ビジーもタイマーフラグも立たない
            (_, 0x44) => 0x00,
            (_, 0x45) => self.read_register(),
            (SoundBoard::OpnA, 0x46) => 0x00,
            _ => 0xFF,
        }
    }

    fn read_register(&self) -> u8 {
        match self.st.address[0] {
            reg @ 0x00..=REG_SSG_LAST => self.st.regs[reg as usize],
            REG_PORT_A | REG_PORT_B => 0xFF,
            REG_ID if self.has_extended() => OPNA_ID,
            _ => 0xFF,
        }
    }

    pub fn write(&mut self, port: u8, value: u8) {
        match (self.board, port) {
            (SoundBoard::None, _) => {}
            (_, 0x44) => self.st.address[0] = value,
            (_, 0x45) => self.st.regs[self.st.address[0] as usize] = value,
            (SoundBoard::OpnA, 0x46) => self.st.address[1] = value,
            (SoundBoard::OpnA, 0x47) => self.st.regs[0x100 + self.st.address[1] as usize] = value,
            _ => log::trace!("OPN: write {:02X} to port {:02X} ignored", value, port),
        }
    }

    pub fn save_state(&self) -> OpnState {
        self.st.clone()
    }

    pub fn load_state(&mut self, state: &OpnState) {
        self.st = state.clone();
        self.st.regs.resize(REG_COUNT, 0);
    }
}
