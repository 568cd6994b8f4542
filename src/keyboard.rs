//! キーボードマトリクス
//!
//! 仮想キーコード（Windows VK互換）から 15行×8列 のマトリクスを引き、
//! ポート$00-$0E の読み取り値（押下ビットが0）を作る。

/// マトリクスの行数
pub const KEY_ROWS: usize = 15;

/// 仮想キーコード
pub mod vk {
    pub const BACK: u8 = 0x08;
    pub const TAB: u8 = 0x09;
    pub const RETURN: u8 = 0x0D;
    pub const SHIFT: u8 = 0x10;
    pub const CONTROL: u8 = 0x11;
    pub const MENU: u8 = 0x12;
    pub const PAUSE: u8 = 0x13;
    pub const CAPITAL: u8 = 0x14;
    pub const KANA: u8 = 0x15;
    pub const ESCAPE: u8 = 0x1B;
    pub const SPACE: u8 = 0x20;
    pub const INSERT: u8 = 0x2D;
    pub const DELETE: u8 = 0x2E;
    pub const F1: u8 = 0x70;
    pub const F6: u8 = 0x75;
    pub const F10: u8 = 0x79;
    pub const LSHIFT: u8 = 0xA0;
    pub const RSHIFT: u8 = 0xA1;
}

/// VKコード → (行, 列)
#[rustfmt::skip]
const KEY_TABLE: [[u8; 8]; KEY_ROWS] = [
    [0x60, 0x61, 0x62, 0x63, 0x64, 0x65, 0x66, 0x67],
    [0x68, 0x69, 0x6A, 0x6B, 0x92, 0x6C, 0x6E, 0x0D],
    [0xC0, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47],
    [0x48, 0x49, 0x4A, 0x4B, 0x4C, 0x4D, 0x4E, 0x4F],
    [0x50, 0x51, 0x52, 0x53, 0x54, 0x55, 0x56, 0x57],
    [0x58, 0x59, 0x5A, 0xDB, 0xDC, 0xDD, 0xDE, 0xBD],
    [0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37],
    [0x38, 0x39, 0xBA, 0xBB, 0xBC, 0xBE, 0xBF, 0xE2],
    [0x24, 0x26, 0x27, 0x08, 0x12, 0x15, 0x10, 0x11],
    [0x13, 0x70, 0x71, 0x72, 0x73, 0x74, 0x20, 0x1B],
    [0x09, 0x28, 0x25, 0x23, 0x7B, 0x6D, 0x6F, 0x14],
    [0x21, 0x22, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    [0x75, 0x76, 0x77, 0x78, 0x79, 0x08, 0x2D, 0x2E],
    [0x1C, 0x1D, 0x7A, 0x19, 0x00, 0x00, 0x00, 0x00],
    [0x0D, 0x00, 0xA0, 0xA1, 0x00, 0x00, 0x00, 0x00],
];

/// 旧機種向けの読み替え（元キー, 置換キー, SHIFT併用）
const KEY_CONV_TABLE: [(u8, u8, bool); 7] = [
    (vk::INSERT, vk::DELETE, true),
    (0x75, 0x70, true),
    (0x76, 0x71, true),
    (0x77, 0x72, true),
    (0x78, 0x73, true),
    (0x79, 0x74, true),
    (vk::DELETE, vk::BACK, false),
];

/// キーボード状態
#[derive(Debug, Clone)]
pub struct Keyboard {
    /// 押下中のVKコード
    pressed: [bool; 256],
    /// 読み替えテーブルを使うか（拡張キーのない機種）
    convert: bool,
}

impl Default for Keyboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Keyboard {
    pub fn new() -> Self {
        Keyboard {
            pressed: [false; 256],
            convert: false,
        }
    }

    pub fn reset(&mut self) {
        self.pressed = [false; 256];
    }

    /// 拡張キーの読み替えを有効にする
    pub fn set_convert(&mut self, convert: bool) {
        self.convert = convert;
    }

    pub fn key_down(&mut self, code: u8, _repeat: bool) {
        self.pressed[code as usize] = true;
    }

    pub fn key_up(&mut self, code: u8) {
        self.pressed[code as usize] = false;
    }

    /// 読み替えを適用した押下状態
    fn effective(&self) -> [bool; 256] {
        let mut keys = self.pressed;
        if self.convert {
            for &(from, to, shift) in &KEY_CONV_TABLE {
                if self.pressed[from as usize] {
                    keys[from as usize] = false;
                    keys[to as usize] = true;
                    if shift {
                        keys[vk::SHIFT as usize] = true;
                    }
                }
            }
        }
        // 左右SHIFTは共通SHIFTも押したことにする
        if keys[vk::LSHIFT as usize] || keys[vk::RSHIFT as usize] {
            keys[vk::SHIFT as usize] = true;
        }
        keys
    }

    /// ポート$00-$0E の値（押されているビットが0）
    pub fn read_row(&self, row: usize) -> u8 {
        let Some(codes) = KEY_TABLE.get(row) else {
            return 0xFF;
        };
        let keys = self.effective();
        codes.iter().enumerate().fold(0xFF, |acc, (bit, &code)| {
            if code != 0 && keys[code as usize] {
                acc & !(1 << bit)
            } else {
                acc
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_rows() {
        let mut kbd = Keyboard::new();
        assert_eq!(kbd.read_row(2), 0xFF);
        kbd.key_down(0x41, false); // 'A'
        assert_eq!(kbd.read_row(2), 0xFD);
        kbd.key_down(vk::RETURN, false);
        assert_eq!(kbd.read_row(1), 0x7F);
        assert_eq!(kbd.read_row(14), 0xFE);
        kbd.key_up(0x41);
        assert_eq!(kbd.read_row(2), 0xFF);
        assert_eq!(kbd.read_row(15), 0xFF);
    }

    #[test]
    fn test_conversion_table() {
        let mut kbd = Keyboard::new();
        kbd.set_convert(true);
        kbd.key_down(vk::F6, false);
        // F1 と SHIFT が押されたことになる
        assert_eq!(kbd.read_row(9), 0xFD);
        assert_eq!(kbd.read_row(8), 0xBF);
        // F6 自身は見えない
        assert_eq!(kbd.read_row(12), 0xFF);
        kbd.key_up(vk::F6);

        kbd.key_down(vk::DELETE, false);
        assert_eq!(kbd.read_row(8), 0xF7);
    }

    #[test]
    fn test_lshift_sets_common_shift() {
        let mut kbd = Keyboard::new();
        kbd.key_down(vk::LSHIFT, false);
        assert_eq!(kbd.read_row(8), 0xBF);
        assert_eq!(kbd.read_row(14), 0xFB);
    }
}
