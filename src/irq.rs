//! 割り込みラインアグリゲータ
//!
//! 8本の固定ラインからの要求を集め、静的優先度で1本を選んでCPUへベクタを渡す。
//! ラインはレベルトリガで、受理されるかデバイスが下げるまで立ちっぱなしになる。
//! PC-8801のマスク（ポート$E6）とプライオリティレベル（ポート$E4, i8214相当）も持つ。

use serde::{Deserialize, Serialize};

/// 割り込みライン（添字が小さいほど優先度が高い）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IrqLine {
    Usart = 0,
    Vrtc = 1,
    Timer = 2,
    Int4 = 3,
    Sound = 4,
    Int2 = 5,
    FdInt1 = 6,
    FdInt2 = 7,
}

impl IrqLine {
    /// 優先度順（高→低）
    pub const ALL: [IrqLine; 8] = [
        IrqLine::Usart,
        IrqLine::Vrtc,
        IrqLine::Timer,
        IrqLine::Int4,
        IrqLine::Sound,
        IrqLine::Int2,
        IrqLine::FdInt1,
        IrqLine::FdInt2,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn bit(self) -> u8 {
        1 << self.index()
    }

    /// Z80 モード2のベクタ（下位バイト）
    #[inline]
    pub fn vector_byte(self) -> u8 {
        (self.index() as u8) << 1
    }

    pub fn from_index(index: usize) -> Option<IrqLine> {
        Self::ALL.get(index).copied()
    }
}

/// セーブ用の割り込み状態
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IrqState {
    pub request: u8,
    pub enable_mask: u8,
    pub level_mask: u8,
}

/// 割り込みコントローラ
#[derive(Debug, Clone)]
pub struct InterruptController {
    /// 要求中のライン（ビット = ライン番号）
    request: u8,
    /// ポート$E6由来の許可マスク（マスク対象外のラインは常に1）
    enable_mask: u8,
    /// ポート$E4由来のレベルマスク
    level_mask: u8,
}

impl Default for InterruptController {
    fn default() -> Self {
        Self::new()
    }
}

/// ポート$E6で個別にマスクできるライン
const MASKABLE: u8 = (1 << IrqLine::Usart as u8) | (1 << IrqLine::Vrtc as u8) | (1 << IrqLine::Timer as u8);

impl InterruptController {
    /// マスクなし・要求なしの状態で作成
    pub fn new() -> Self {
        InterruptController {
            request: 0,
            enable_mask: 0xFF,
            level_mask: 0xFF,
        }
    }

    /// リセット後の状態（PC-8801は全ライン禁止で起動する）
    pub fn reset(&mut self) {
        self.request = 0;
        self.enable_mask = !MASKABLE;
        self.level_mask = 0;
    }

    pub fn raise(&mut self, line: IrqLine) {
        self.request |= line.bit();
    }

    pub fn lower(&mut self, line: IrqLine) {
        self.request &= !line.bit();
    }

    pub fn is_raised(&self, line: IrqLine) -> bool {
        self.request & line.bit() != 0
    }

    /// マスク後の有効な要求
    #[inline]
    fn active(&self) -> u8 {
        self.request & self.enable_mask & self.level_mask
    }

    /// 命令境界でCPUが問い合わせる
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.active() != 0
    }

    /// 最も優先度の高い要求ライン（要求がなければ `None`）
    pub fn vector(&self) -> Option<IrqLine> {
        let active = self.active();
        if active == 0 {
            return None;
        }
        IrqLine::from_index(active.trailing_zeros() as usize)
    }

    /// CPUが割り込みを受理した
    ///
    /// 選ばれたラインだけを下ろし、i8214と同様にレベルレジスタを無効化する。
    /// 他の要求は次の命令境界以降に持ち越す。
    pub fn acknowledge(&mut self) -> Option<IrqLine> {
        let line = self.vector()?;
        self.lower(line);
        self.level_mask = 0;
        Some(line)
    }

    /// ポート$E4: プライオリティレベル
    ///
    /// bit3が立っていれば全ライン許可、そうでなければ下位3ビットより
    /// 優先度の高い（ランクの小さい）ラインだけを許可する。
    pub fn set_level(&mut self, data: u8) {
        self.level_mask = if data & 0x08 != 0 {
            0xFF
        } else {
            !(0xFFu8 << (data & 0x07))
        };
    }

    /// ポート$E6: 割り込みマスク
    ///
    /// bit0 = タイマー, bit1 = VRTC, bit2 = USART（1で許可）
    pub fn set_mask(&mut self, data: u8) {
        let mut mask = !MASKABLE;
        if data & 0x01 != 0 {
            mask |= IrqLine::Timer.bit();
        }
        if data & 0x02 != 0 {
            mask |= IrqLine::Vrtc.bit();
        }
        if data & 0x04 != 0 {
            mask |= IrqLine::Usart.bit();
        }
        self.enable_mask = mask;
    }

    pub fn save_state(&self) -> IrqState {
        IrqState {
            request: self.request,
            enable_mask: self.enable_mask,
            level_mask: self.level_mask,
        }
    }

    pub fn load_state(&mut self, state: &IrqState) {
        self.request = state.request;
        self.enable_mask = state.enable_mask;
        self.level_mask = state.level_mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_higher_priority_wins_then_falls_back() {
        let mut irq = InterruptController::new();
        irq.raise(IrqLine::FdInt1);
        irq.raise(IrqLine::Vrtc);
        assert!(irq.is_pending());
        assert_eq!(irq.vector(), Some(IrqLine::Vrtc));

        // Vrtcだけを処理
        irq.lower(IrqLine::Vrtc);
        assert_eq!(irq.vector(), Some(IrqLine::FdInt1));
        irq.lower(IrqLine::FdInt1);
        assert!(!irq.is_pending());
        assert_eq!(irq.vector(), None);
    }

    #[test]
    fn test_acknowledge_clears_only_selected_line() {
        let mut irq = InterruptController::new();
        irq.raise(IrqLine::Timer);
        irq.raise(IrqLine::Sound);
        assert_eq!(irq.acknowledge(), Some(IrqLine::Timer));
        assert!(irq.is_raised(IrqLine::Sound));
        // レベルレジスタは受理で無効化される
        assert!(!irq.is_pending());
        irq.set_level(0x08);
        assert_eq!(irq.vector(), Some(IrqLine::Sound));
    }

    #[test]
    fn test_level_triggered_until_lowered() {
        let mut irq = InterruptController::new();
        irq.raise(IrqLine::Int4);
        assert!(irq.is_pending());
        assert!(irq.is_pending());
        irq.lower(IrqLine::Int4);
        assert!(!irq.is_pending());
    }

    #[test]
    fn test_mask_hides_without_clearing() {
        let mut irq = InterruptController::new();
        irq.reset();
        irq.set_level(0x08);
        irq.raise(IrqLine::Vrtc);
        assert!(!irq.is_pending());
        irq.set_mask(0x02);
        assert_eq!(irq.vector(), Some(IrqLine::Vrtc));
    }

    #[test]
    fn test_priority_level_blocks_lower_ranks() {
        let mut irq = InterruptController::new();
        irq.raise(IrqLine::Sound);
        irq.set_level(4);
        assert!(!irq.is_pending());
        irq.set_level(5);
        assert_eq!(irq.vector(), Some(IrqLine::Sound));
    }

    #[test]
    fn test_vector_byte() {
        assert_eq!(IrqLine::Usart.vector_byte(), 0);
        assert_eq!(IrqLine::Timer.vector_byte(), 4);
        assert_eq!(IrqLine::FdInt2.vector_byte(), 14);
    }
}
