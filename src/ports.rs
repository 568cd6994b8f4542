//! I/Oポートのビットフィールド
//!
//! 共有ポート配列からその都度ビットを取り出すのではなく、
//! レジスタごとに名前付きフラグ型を用意する。

bitflags::bitflags! {
    /// ポート$30（出力）: システムコントロール1
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Port30: u8 {
        /// 0 = 40桁, 1 = 80桁
        const COLUMNS80 = 0x01;
        /// 0 = カラー, 1 = 白黒
        const MONO      = 0x02;
        /// CMTモーター
        const MTON      = 0x08;
        /// 1 = RS-232C, 0 = CMT
        const RS232C    = 0x20;
    }
}

bitflags::bitflags! {
    /// ポート$31（出力）: システムコントロール2
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Port31: u8 {
        /// 1 = 64KB RAMモード（ROMを切り離す）
        const MMODE  = 0x02;
        /// 1 = N-BASIC ROM
        const RMODE  = 0x04;
        /// グラフィック表示
        const GRAPH  = 0x08;
        /// 高解像度カラー
        const HCOLOR = 0x10;
    }
}

bitflags::bitflags! {
    /// ポート$32: その他コントロール
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Port32: u8 {
        /// 拡張ROM選択（2ビット）
        const EROMSL = 0x03;
        const TMODE  = 0x10;
        const PMODE  = 0x20;
        /// 1 = 独立GVRAMアクセスモード
        const GVAM   = 0x40;
        /// 1 = サウンド割り込み禁止
        const SINTM  = 0x80;
    }
}

bitflags::bitflags! {
    /// ポート$40（出力）: ストローブ
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Port40Out: u8 {
        const PRINTER_STROBE = 0x01;
        const CALENDAR_STB   = 0x02;
        const CALENDAR_CLK   = 0x04;
        const GHSM           = 0x10;
        /// ビープ発振ON
        const BEEP           = 0x20;
        const JOP1           = 0x40;
        /// SING（スピーカー直接駆動）
        const SING           = 0x80;
    }
}

bitflags::bitflags! {
    /// ポート$40（入力）: ステータス
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Port40In: u8 {
        const PRINTER_BUSY = 0x01;
        /// 0 = 高解像度モニタ（24kHz）
        const MONITOR_STD  = 0x02;
        const CALENDAR_CDO = 0x10;
        /// 垂直帰線期間
        const VRTC         = 0x20;
    }
}

bitflags::bitflags! {
    /// ポート$53: 画面表示コントロール（1で非表示）
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Port53: u8 {
        const TEXTDS = 0x01;
        const G0DS   = 0x02;
        const G1DS   = 0x04;
        const G2DS   = 0x08;
    }
}

bitflags::bitflags! {
    /// ポート$E2: 拡張RAMコントロール
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PortE2: u8 {
        /// 読み取り許可
        const RDEN = 0x01;
        /// 書き込み許可
        const WREN = 0x10;
    }
}

bitflags::bitflags! {
    /// ポート$F1: 辞書ROMコントロール（0で有効）
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PortF1: u8 {
        const DICROM_OFF = 0x01;
    }
}

bitflags::bitflags! {
    /// FDCモーター制御（ポート$F8 出力）
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MotorControl: u8 {
        const DRIVE0 = 0x01;
        const DRIVE1 = 0x02;
    }
}

/// ポート$32の拡張ROM選択値
#[inline]
pub fn erom_select(port32: Port32) -> usize {
    (port32.bits() & Port32::EROMSL.bits()) as usize
}
