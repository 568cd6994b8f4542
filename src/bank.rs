//! バンクテーブル
//!
//! 64KBのアドレス空間を4KB×16ページに分割し、ページごとに
//! 読み取り先と書き込み先を独立に持つ。
//! バッファはアリーナ（`Vec<Vec<u8>>`）で保持し、ページは (バッファ番号, オフセット) を指す。
//! 実行時の参照は配列インデックス1回で済む。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// ページサイズ（4KB）
pub const PAGE_SIZE: usize = 0x1000;
/// ページ数
pub const PAGE_COUNT: usize = 16;
/// アドレス空間サイズ
pub const ADDRESS_SPACE: usize = PAGE_SIZE * PAGE_COUNT;
/// 未マップ領域の読み取り値（オープンバス）
pub const OPEN_BUS: u8 = 0xFF;

/// バンク操作のエラー
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BankError {
    #[error("range ${start:05X}-${end:05X} is not page aligned")]
    Misaligned { start: usize, end: usize },

    #[error("range ${start:05X}-${end:05X} is empty or outside the address space")]
    OutOfRange { start: usize, end: usize },

    #[error("buffer {buffer} cannot back {len} bytes at offset {offset}")]
    BufferTooSmall { buffer: usize, offset: usize, len: usize },

    #[error("unknown buffer {0}")]
    UnknownBuffer(usize),

    #[error("failed to allocate {0} bytes for a backing buffer")]
    Allocation(usize),
}

/// バッファ番号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferId(pub usize);

/// ページの参照先
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BankTarget {
    /// 未マップ（読み取りは0xFF、書き込みは破棄）
    Unmapped,
    /// バッファ内のオフセット
    Mapped { buffer: BufferId, offset: usize },
}

impl BankTarget {
    pub fn at(buffer: BufferId, offset: usize) -> Self {
        BankTarget::Mapped { buffer, offset }
    }
}

/// 1ページの読み書き先
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub read: BankTarget,
    pub write: BankTarget,
}

impl Default for Page {
    fn default() -> Self {
        Page {
            read: BankTarget::Unmapped,
            write: BankTarget::Unmapped,
        }
    }
}

/// バンクテーブル本体
#[derive(Debug, Clone)]
pub struct BankTable {
    pages: [Page; PAGE_COUNT],
    buffers: Vec<Vec<u8>>,
}

impl Default for BankTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BankTable {
    pub fn new() -> Self {
        BankTable {
            pages: [Page::default(); PAGE_COUNT],
            buffers: Vec::new(),
        }
    }

    /// バッキングバッファを確保してアリーナに追加
    ///
    /// 確保失敗はアドレス空間の整合性を保証できないため呼び出し側で致命扱いにする。
    pub fn add_buffer(&mut self, len: usize, fill: u8) -> Result<BufferId, BankError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len).map_err(|_| BankError::Allocation(len))?;
        buf.resize(len, fill);
        self.buffers.push(buf);
        Ok(BufferId(self.buffers.len() - 1))
    }

    pub fn buffer(&self, id: BufferId) -> Option<&[u8]> {
        self.buffers.get(id.0).map(|b| b.as_slice())
    }

    pub fn buffer_mut(&mut self, id: BufferId) -> Option<&mut [u8]> {
        self.buffers.get_mut(id.0).map(|b| b.as_mut_slice())
    }

    /// ページの現在の参照先
    pub fn page(&self, index: usize) -> Page {
        self.pages[index]
    }

    /// 範囲 [start, end) を検証してページ範囲を返す
    fn page_range(&self, start: usize, end: usize) -> Result<(usize, usize), BankError> {
        if start % PAGE_SIZE != 0 || end % PAGE_SIZE != 0 {
            return Err(BankError::Misaligned { start, end });
        }
        if start >= end || end > ADDRESS_SPACE {
            return Err(BankError::OutOfRange { start, end });
        }
        Ok((start / PAGE_SIZE, end / PAGE_SIZE))
    }

    /// ターゲットが指定ページ数ぶんのバッファを持つか
    fn check_target(&self, target: BankTarget, pages: usize) -> Result<(), BankError> {
        if let BankTarget::Mapped { buffer, offset } = target {
            let buf = self
                .buffers
                .get(buffer.0)
                .ok_or(BankError::UnknownBuffer(buffer.0))?;
            let len = pages * PAGE_SIZE;
            if offset.checked_add(len).map_or(true, |e| e > buf.len()) {
                return Err(BankError::BufferTooSmall {
                    buffer: buffer.0,
                    offset,
                    len,
                });
            }
        }
        Ok(())
    }

    /// ページ index に対するベースからの相対ターゲット
    #[inline]
    fn relative(target: BankTarget, delta_pages: usize) -> BankTarget {
        match target {
            BankTarget::Unmapped => BankTarget::Unmapped,
            BankTarget::Mapped { buffer, offset } => BankTarget::Mapped {
                buffer,
                offset: offset + delta_pages * PAGE_SIZE,
            },
        }
    }

    /// [start, end) の全ページの書き込み先・読み取り先を張り替える
    ///
    /// ページ i はベースから `(i - 先頭ページ) × PAGE_SIZE` ずれた位置を指す。
    /// 検証に失敗した場合はテーブルを一切変更しない。
    pub fn set_range(
        &mut self,
        start: usize,
        end: usize,
        write: BankTarget,
        read: BankTarget,
    ) -> Result<(), BankError> {
        let (first, last) = self.page_range(start, end)?;
        self.check_target(write, last - first)?;
        self.check_target(read, last - first)?;
        for index in first..last {
            let page = &mut self.pages[index];
            page.write = Self::relative(write, index - first);
            page.read = Self::relative(read, index - first);
        }
        Ok(())
    }

    /// 書き込み先だけを張り替える
    pub fn set_write_range(&mut self, start: usize, end: usize, write: BankTarget) -> Result<(), BankError> {
        let (first, last) = self.page_range(start, end)?;
        self.check_target(write, last - first)?;
        for index in first..last {
            self.pages[index].write = Self::relative(write, index - first);
        }
        Ok(())
    }

    /// 読み取り先だけを張り替える
    pub fn set_read_range(&mut self, start: usize, end: usize, read: BankTarget) -> Result<(), BankError> {
        let (first, last) = self.page_range(start, end)?;
        self.check_target(read, last - first)?;
        for index in first..last {
            self.pages[index].read = Self::relative(read, index - first);
        }
        Ok(())
    }

    #[inline]
    pub fn read(&self, address: u16) -> u8 {
        let address = address as usize;
        match self.pages[address >> 12].read {
            BankTarget::Unmapped => OPEN_BUS,
            BankTarget::Mapped { buffer, offset } => {
                self.buffers[buffer.0][offset + (address & (PAGE_SIZE - 1))]
            }
        }
    }

    #[inline]
    pub fn write(&mut self, address: u16, value: u8) {
        let address = address as usize;
        if let BankTarget::Mapped { buffer, offset } = self.pages[address >> 12].write {
            self.buffers[buffer.0][offset + (address & (PAGE_SIZE - 1))] = value;
        }
    }

    /// セーブ用: 全ページの参照先
    pub fn pages(&self) -> [Page; PAGE_COUNT] {
        self.pages
    }

    /// ロード用: ページ参照先の復元（範囲外を指すページは未マップにする）
    pub fn restore_pages(&mut self, pages: &[Page]) {
        for (index, page) in pages.iter().take(PAGE_COUNT).enumerate() {
            let valid = |t: BankTarget| match t {
                BankTarget::Unmapped => true,
                BankTarget::Mapped { buffer, offset } => self
                    .buffers
                    .get(buffer.0)
                    .map_or(false, |b| offset + PAGE_SIZE <= b.len()),
            };
            let read = if valid(page.read) { page.read } else { BankTarget::Unmapped };
            let write = if valid(page.write) { page.write } else { BankTarget::Unmapped };
            self.pages[index] = Page { read, write };
        }
    }
}
