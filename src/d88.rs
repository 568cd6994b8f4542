//! D88ディスクイメージ
//!
//! 1つのコンテナファイルに複数のディスク（バンク）が連結された形式。
//! 各バンクは 0x2B0 バイトのヘッダ（名前17バイト、ライトプロテクト、メディア種別、
//! 総サイズ@0x1C、トラックオフセット表164本）とセクタレコードの列からなる。
//! ファイルは読み取り・書き戻しの間だけ開き、すぐ閉じる。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::fdc_log;

/// 列挙するバンク数の上限
pub const MAX_D88_BANKS: usize = 64;
/// バンクヘッダサイズ
pub const D88_HEADER_SIZE: usize = 0x2B0;
/// トラックオフセット表のエントリ数
pub const D88_TRACKS: usize = 164;
/// ディスク名フィールド長
pub const NAME_LEN: usize = 17;

const OFFSET_PROTECT: usize = 0x1A;
const OFFSET_MEDIA: usize = 0x1B;
const OFFSET_SIZE: usize = 0x1C;
const OFFSET_TRACKS: usize = 0x20;
const SECTOR_HEADER_SIZE: usize = 0x10;

/// D88セクタステータス
pub mod status {
    pub const NORMAL: u8 = 0x00;
    pub const DELETED: u8 = 0x10;
    pub const ID_CRC_ERROR: u8 = 0xA0;
    pub const DATA_CRC_ERROR: u8 = 0xB0;
    pub const NO_ADDRESS_MARK: u8 = 0xE0;
    pub const NO_DATA_MARK: u8 = 0xF0;
}

/// メディアエラー
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bank header at offset {offset:#x} is truncated")]
    TruncatedHeader { offset: usize },

    #[error("bank at offset {offset:#x} declares invalid size {size}")]
    InvalidSize { offset: usize, size: u32 },

    #[error("bank {index} is out of range ({count} banks)")]
    BankOutOfRange { index: usize, count: usize },
}

/// メディア種別（ヘッダ0x1B）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Disk2D,
    Disk2DD,
    Disk2HD,
    Other(u8),
}

impl MediaType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => MediaType::Disk2D,
            0x10 => MediaType::Disk2DD,
            0x20 => MediaType::Disk2HD,
            other => MediaType::Other(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            MediaType::Disk2D => 0x00,
            MediaType::Disk2DD => 0x10,
            MediaType::Disk2HD => 0x20,
            MediaType::Other(b) => b,
        }
    }
}

#[inline]
fn read_u16(data: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([data[pos], data[pos + 1]])
}

#[inline]
fn read_u32(data: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
}

// ============================================================
// CRC-16/CCITT
// ============================================================

/// CRC-16/CCITT（多項式0x1021）を1バイト更新
#[inline]
pub fn crc16_update(crc: u16, byte: u8) -> u16 {
    let mut crc = crc ^ ((byte as u16) << 8);
    for _ in 0..8 {
        crc = if crc & 0x8000 != 0 {
            (crc << 1) ^ 0x1021
        } else {
            crc << 1
        };
    }
    crc
}

/// アドレスマーク/データマーク前のプリアンブル込みの初期CRC
pub fn crc_preamble(mfm: bool, mark: u8) -> u16 {
    let mut crc = 0xFFFF;
    if mfm {
        for _ in 0..3 {
            crc = crc16_update(crc, 0xA1);
        }
    }
    crc16_update(crc, mark)
}

/// IDフィールドのCRC
pub fn id_crc(id: SectorId, mfm: bool) -> u16 {
    [id.c, id.h, id.r, id.n]
        .iter()
        .fold(crc_preamble(mfm, 0xFE), |crc, &b| crc16_update(crc, b))
}

/// データフィールドのCRC
pub fn data_crc(data: &[u8], deleted: bool, mfm: bool) -> u16 {
    let mark = if deleted { 0xF8 } else { 0xFB };
    data.iter()
        .fold(crc_preamble(mfm, mark), |crc, &b| crc16_update(crc, b))
}

// ============================================================
// セクタ/トラック
// ============================================================

/// セクタID (C, H, R, N)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SectorId {
    pub c: u8,
    pub h: u8,
    pub r: u8,
    pub n: u8,
}

/// 1セクタ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sector {
    pub id: SectorId,
    /// MFM（倍密度）なら true
    pub mfm: bool,
    pub deleted: bool,
    /// D88ステータスバイト
    pub status: u8,
    pub data: Vec<u8>,
    /// IDフィールドに記録されたCRC
    pub stored_id_crc: u16,
    /// データフィールドに記録されたCRC
    pub stored_data_crc: u16,
}

impl Sector {
    /// 正常なCRCで新しいセクタを作成
    pub fn new(id: SectorId, mfm: bool, deleted: bool, data: Vec<u8>) -> Self {
        let stored_id_crc = id_crc(id, mfm);
        let stored_data_crc = data_crc(&data, deleted, mfm);
        Sector {
            id,
            mfm,
            deleted,
            status: if deleted { status::DELETED } else { status::NORMAL },
            data,
            stored_id_crc,
            stored_data_crc,
        }
    }

    /// IDフィールドがアドレスマークとして見えるか
    pub fn has_address_mark(&self) -> bool {
        self.status != status::NO_ADDRESS_MARK
    }

    /// データマークがあるか
    pub fn has_data_mark(&self) -> bool {
        self.status != status::NO_DATA_MARK
    }

    /// データを書き換える（CRCとステータスを作り直す）
    ///
    /// 足りない分は0で埋まる。
    pub fn write_data(&mut self, data: &[u8], deleted: bool) {
        let len = self.data.len();
        if data.len() < len {
            fdc_log::log_short_write(self.id, data.len(), len);
        }
        self.data.clear();
        self.data.extend_from_slice(&data[..data.len().min(len)]);
        self.data.resize(len, 0);
        self.deleted = deleted;
        self.status = if deleted { status::DELETED } else { status::NORMAL };
        self.stored_data_crc = data_crc(&self.data, deleted, self.mfm);
        self.stored_id_crc = id_crc(self.id, self.mfm);
    }
}

/// 1バンク分の解析済みディスク
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Floppy {
    pub name: [u8; NAME_LEN],
    /// イメージヘッダ上のライトプロテクト
    pub header_protected: bool,
    pub media: MediaType,
    /// トラック（添字 = シリンダ×2 + ヘッド）
    pub tracks: Vec<Vec<Sector>>,
    /// 書き込みがあったか
    pub modified: bool,
}

impl Floppy {
    /// 未フォーマットの空ディスク
    pub fn blank(name: &str, media: MediaType) -> Self {
        let mut raw = [0u8; NAME_LEN];
        for (dst, src) in raw.iter_mut().zip(name.bytes().take(NAME_LEN - 1)) {
            *dst = src;
        }
        Floppy {
            name: raw,
            header_protected: false,
            media,
            tracks: vec![Vec::new(); D88_TRACKS],
            modified: false,
        }
    }

    /// バンクのペイロードを解析
    pub fn parse(payload: &[u8]) -> Result<Self, MediaError> {
        if payload.len() < D88_HEADER_SIZE {
            return Err(MediaError::TruncatedHeader { offset: 0 });
        }
        let declared = read_u32(payload, OFFSET_SIZE);
        if (declared as usize) < D88_HEADER_SIZE {
            return Err(MediaError::InvalidSize {
                offset: 0,
                size: declared,
            });
        }
        let size = (declared as usize).min(payload.len());

        let mut name = [0u8; NAME_LEN];
        name.copy_from_slice(&payload[..NAME_LEN]);

        let mut tracks = vec![Vec::new(); D88_TRACKS];
        for (t, track) in tracks.iter_mut().enumerate() {
            let offset = read_u32(payload, OFFSET_TRACKS + t * 4) as usize;
            if offset == 0 {
                continue;
            }
            if offset < D88_HEADER_SIZE || offset + SECTOR_HEADER_SIZE > size {
                log::warn!("D88: track {} offset {:#x} outside the bank, ignored", t, offset);
                continue;
            }
            *track = Self::parse_track(payload, offset, size);
        }

        Ok(Floppy {
            name,
            header_protected: payload[OFFSET_PROTECT] & 0x10 != 0,
            media: MediaType::from_byte(payload[OFFSET_MEDIA]),
            tracks,
            modified: false,
        })
    }

    fn parse_track(payload: &[u8], offset: usize, size: usize) -> Vec<Sector> {
        let count = read_u16(payload, offset + 4) as usize;
        let mut sectors = Vec::with_capacity(count);
        let mut pos = offset;
        for _ in 0..count {
            if pos + SECTOR_HEADER_SIZE > size {
                break;
            }
            let h = &payload[pos..pos + SECTOR_HEADER_SIZE];
            let id = SectorId {
                c: h[0],
                h: h[1],
                r: h[2],
                n: h[3],
            };
            let mfm = h[6] & 0x40 == 0;
            let deleted = h[7] & 0x10 != 0;
            let sector_status = h[8];
            let data_len = read_u16(h, 0x0E) as usize;
            let start = pos + SECTOR_HEADER_SIZE;
            let end = (start + data_len).min(size);
            let data = payload[start..end].to_vec();

            let mut sector = Sector::new(id, mfm, deleted, data);
            sector.status = sector_status;
            if sector_status == status::ID_CRC_ERROR {
                sector.stored_id_crc = !sector.stored_id_crc;
            }
            if sector_status == status::DATA_CRC_ERROR {
                sector.stored_data_crc = !sector.stored_data_crc;
            }
            sectors.push(sector);
            pos = start + data_len;
        }
        sectors
    }

    /// バンクのペイロードへ直列化
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = vec![0u8; D88_HEADER_SIZE];
        out[..NAME_LEN].copy_from_slice(&self.name);
        out[OFFSET_PROTECT] = if self.header_protected { 0x10 } else { 0x00 };
        out[OFFSET_MEDIA] = self.media.to_byte();

        for (t, track) in self.tracks.iter().enumerate().take(D88_TRACKS) {
            if track.is_empty() {
                continue;
            }
            let offset = out.len() as u32;
            out[OFFSET_TRACKS + t * 4..OFFSET_TRACKS + t * 4 + 4].copy_from_slice(&offset.to_le_bytes());
            for sector in track {
                let mut header = [0u8; SECTOR_HEADER_SIZE];
                header[0] = sector.id.c;
                header[1] = sector.id.h;
                header[2] = sector.id.r;
                header[3] = sector.id.n;
                header[4..6].copy_from_slice(&(track.len() as u16).to_le_bytes());
                header[6] = if sector.mfm { 0x00 } else { 0x40 };
                header[7] = if sector.deleted { 0x10 } else { 0x00 };
                header[8] = sector.status;
                header[0x0E..0x10].copy_from_slice(&(sector.data.len() as u16).to_le_bytes());
                out.extend_from_slice(&header);
                out.extend_from_slice(&sector.data);
            }
        }

        let size = out.len() as u32;
        out[OFFSET_SIZE..OFFSET_SIZE + 4].copy_from_slice(&size.to_le_bytes());
        out
    }

    /// トラック番号（シリンダ, ヘッド）からトラックを取得
    pub fn track(&self, cylinder: u8, head: u8) -> Option<&Vec<Sector>> {
        self.tracks.get(cylinder as usize * 2 + (head & 1) as usize)
    }

    pub fn track_mut(&mut self, cylinder: u8, head: u8) -> Option<&mut Vec<Sector>> {
        self.tracks.get_mut(cylinder as usize * 2 + (head & 1) as usize)
    }

    /// トラックをフォーマット（既存のセクタは失われる）
    pub fn format_track(&mut self, cylinder: u8, head: u8, ids: &[SectorId], fill: u8, mfm: bool) -> bool {
        let Some(track) = self.track_mut(cylinder, head) else {
            return false;
        };
        *track = ids
            .iter()
            .map(|&id| {
                let len = 128usize << id.n.min(6);
                Sector::new(id, mfm, false, vec![fill; len])
            })
            .collect();
        self.modified = true;
        true
    }

    /// 表示用のディスク名
    pub fn display_name(&self) -> String {
        bank_name(&self.name)
    }
}

/// 名前フィールドを表示用文字列に変換（NUL以降は捨てる）
pub fn bank_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).trim_end().to_string()
}

// ============================================================
// コンテナ（複数バンク）
// ============================================================

/// コンテナ内の1バンク
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskBank {
    pub name: String,
    /// ヘッダの総サイズ（次のバンクの位置を決める）
    pub size: u32,
    /// 生ペイロード（ヘッダ込み）
    pub payload: Vec<u8>,
}

/// コンテナを走査してバンクを列挙
///
/// 先頭から 名前(17バイト) と 0x1C の総サイズ を読み、サイズ分進めて次を探す。
/// サイズ0、ファイル終端、上限数のいずれかで止まる。上限を超えたバンクは列挙しないだけで、
/// 末尾の残りバイトとして返す（書き戻しで失われないように）。
pub fn enumerate_banks(data: &[u8], max_banks: usize) -> Result<(Vec<DiskBank>, Vec<u8>), MediaError> {
    let mut banks = Vec::new();
    let mut offset = 0usize;

    while offset < data.len() && banks.len() < max_banks {
        if offset + OFFSET_SIZE + 4 > data.len() {
            if banks.is_empty() {
                return Err(MediaError::TruncatedHeader { offset });
            }
            break;
        }
        let size = read_u32(data, offset + OFFSET_SIZE);
        if size == 0 {
            if banks.is_empty() {
                return Err(MediaError::InvalidSize { offset, size });
            }
            break;
        }
        let len = size as usize;
        if len < D88_HEADER_SIZE || offset + len > data.len() {
            if banks.is_empty() {
                return Err(MediaError::InvalidSize { offset, size });
            }
            log::warn!("D88: bank at {:#x} declares {} bytes past the end, scan stopped", offset, size);
            break;
        }

        banks.push(DiskBank {
            name: bank_name(&data[offset..offset + NAME_LEN]),
            size,
            payload: data[offset..offset + len].to_vec(),
        });
        offset += len;
    }

    if banks.is_empty() {
        return Err(MediaError::TruncatedHeader { offset: 0 });
    }
    let trailer = data[offset.min(data.len())..].to_vec();
    Ok((banks, trailer))
}

/// ファイル全体を読む（読み終えたらすぐ閉じる）
fn read_file(path: &Path) -> Result<Vec<u8>, MediaError> {
    fs::read(path).map_err(|source| MediaError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// バンク名の一覧（メニュー表示用）
pub fn list_banks<P: AsRef<Path>>(path: P, max_banks: usize) -> Result<Vec<String>, MediaError> {
    let data = read_file(path.as_ref())?;
    let (banks, _) = enumerate_banks(&data, max_banks)?;
    Ok(banks.into_iter().map(|b| b.name).collect())
}

/// 空ディスクを作成
pub fn create_blank_disk<P: AsRef<Path>>(path: P, media: MediaType) -> Result<(), MediaError> {
    let path = path.as_ref();
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let floppy = Floppy::blank(&name, media);
    fs::write(path, floppy.serialize()).map_err(|source| MediaError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    log::info!("Created blank {:?} disk: {}", media, path.display());
    Ok(())
}

/// 挿入中のディスクイメージ
#[derive(Debug, Clone)]
pub struct DiskImage {
    pub path: PathBuf,
    banks: Vec<DiskBank>,
    /// 列挙しなかった末尾のバイト列
    trailer: Vec<u8>,
    current: usize,
    /// 現在のバンクの解析結果
    pub floppy: Floppy,
    /// バンクごとの未保存の変更（切り替え済みバンクの分）
    modified_banks: Vec<bool>,
}

impl DiskImage {
    /// コンテナを開いて指定バンクを選択
    pub fn open<P: AsRef<Path>>(path: P, bank: usize, max_banks: usize) -> Result<Self, MediaError> {
        let path = path.as_ref();
        let data = read_file(path)?;
        Self::from_bytes(path, &data, bank, max_banks)
    }

    /// メモリ上のコンテナから作成
    pub fn from_bytes<P: AsRef<Path>>(path: P, data: &[u8], bank: usize, max_banks: usize) -> Result<Self, MediaError> {
        let (banks, trailer) = enumerate_banks(data, max_banks)?;
        if bank >= banks.len() {
            return Err(MediaError::BankOutOfRange {
                index: bank,
                count: banks.len(),
            });
        }
        let floppy = Floppy::parse(&banks[bank].payload)?;
        log::info!(
            "D88: {} bank {}/{} \"{}\"",
            path.as_ref().display(),
            bank,
            banks.len(),
            banks[bank].name
        );
        Ok(DiskImage {
            path: path.as_ref().to_path_buf(),
            modified_banks: vec![false; banks.len()],
            banks,
            trailer,
            current: bank,
            floppy,
        })
    }

    pub fn bank_count(&self) -> usize {
        self.banks.len()
    }

    pub fn banks(&self) -> &[DiskBank] {
        &self.banks
    }

    pub fn current_bank(&self) -> usize {
        self.current
    }

    /// 現在のバンクの変更をペイロードへ戻す
    fn commit_current(&mut self) {
        if self.floppy.modified {
            let payload = self.floppy.serialize();
            let bank = &mut self.banks[self.current];
            bank.size = payload.len() as u32;
            bank.payload = payload;
            self.floppy.modified = false;
            self.modified_banks[self.current] = true;
        }
    }

    /// バンクを切り替える。範囲外や解析失敗では現在の選択を変えない
    pub fn select_bank(&mut self, index: usize) -> Result<(), MediaError> {
        if index >= self.banks.len() {
            return Err(MediaError::BankOutOfRange {
                index,
                count: self.banks.len(),
            });
        }
        let floppy = Floppy::parse(&self.banks[index].payload)?;
        self.commit_current();
        self.current = index;
        self.floppy = floppy;
        Ok(())
    }

    /// 未保存の変更があるか
    pub fn is_dirty(&self) -> bool {
        self.floppy.modified || self.modified_banks.iter().any(|&m| m)
    }

    /// コンテナ全体のバイト列
    pub fn to_bytes(&mut self) -> Vec<u8> {
        self.commit_current();
        self.container_bytes()
    }

    fn container_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for bank in &self.banks {
            out.extend_from_slice(&bank.payload);
        }
        out.extend_from_slice(&self.trailer);
        out
    }

    /// 変更があればファイルへ書き戻す
    pub fn flush(&mut self) -> Result<bool, MediaError> {
        if !self.is_dirty() {
            return Ok(false);
        }
        self.commit_current();
        self.merge_from_file();
        fs::write(&self.path, self.container_bytes()).map_err(|source| MediaError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.modified_banks.fill(false);
        log::info!("D88: wrote back {}", self.path.display());
        Ok(true)
    }

    /// 変更していないバンクをファイルの現在の内容で置き換える
    ///
    /// 同じコンテナの別バンクを他のドライブが書き戻していても、その変更を上書きしない。
    /// ファイルが読めないかバンク数が変わっていれば手元の内容をそのまま使う。
    fn merge_from_file(&mut self) {
        let on_disk = fs::read(&self.path)
            .ok()
            .and_then(|data| enumerate_banks(&data, self.banks.len()).ok());
        let Some((banks, trailer)) = on_disk else {
            return;
        };
        if banks.len() != self.banks.len() {
            log::warn!("D88: {} changed its bank layout, writing the whole image", self.path.display());
            return;
        }
        for (index, bank) in banks.into_iter().enumerate() {
            if self.modified_banks[index] {
                continue;
            }
            if index == self.current && bank != self.banks[index] {
                if let Ok(floppy) = Floppy::parse(&bank.payload) {
                    self.floppy = floppy;
                }
            }
            self.banks[index] = bank;
        }
        self.trailer = trailer;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// テスト用: 指定サイズのセクタを並べた1トラックのバンクを作る
    pub(crate) fn make_bank(name: &str, sectors: &[(SectorId, Vec<u8>)], pad_to: Option<usize>) -> Vec<u8> {
        let mut floppy = Floppy::blank(name, MediaType::Disk2D);
        for (id, data) in sectors {
            let index = id.c as usize * 2 + id.h as usize;
            floppy.tracks[index].push(Sector::new(*id, true, false, data.clone()));
        }
        let mut payload = floppy.serialize();
        if let Some(len) = pad_to {
            payload.resize(len, 0);
            payload[OFFSET_SIZE..OFFSET_SIZE + 4].copy_from_slice(&(len as u32).to_le_bytes());
        }
        payload
    }

    fn id(c: u8, h: u8, r: u8, n: u8) -> SectorId {
        SectorId { c, h, r, n }
    }

    #[test]
    fn test_two_banks_enumerate() {
        let mut data = make_bank("DISK A", &[], Some(327680));
        data.extend(make_bank("DISK B", &[], Some(327680)));
        let (banks, trailer) = enumerate_banks(&data, MAX_D88_BANKS).unwrap();
        assert_eq!(banks.len(), 2);
        assert_eq!(banks[0].name, "DISK A");
        assert_eq!(banks[1].name, "DISK B");
        assert!(trailer.is_empty());
    }

    #[test]
    fn test_select_out_of_range_keeps_current() {
        let mut data = make_bank("A", &[(id(0, 0, 1, 1), vec![1; 256])], Some(327680));
        data.extend(make_bank("B", &[(id(0, 0, 1, 1), vec![2; 256])], Some(327680)));
        let mut image = DiskImage::from_bytes("test.d88", &data, 0, MAX_D88_BANKS).unwrap();
        assert_eq!(image.bank_count(), 2);
        assert!(matches!(
            image.select_bank(2),
            Err(MediaError::BankOutOfRange { index: 2, count: 2 })
        ));
        assert_eq!(image.current_bank(), 0);
        assert_eq!(image.floppy.track(0, 0).unwrap()[0].data[0], 1);

        image.select_bank(1).unwrap();
        assert_eq!(image.floppy.track(0, 0).unwrap()[0].data[0], 2);
    }

    #[test]
    fn test_max_banks_limits_enumeration() {
        let mut data = Vec::new();
        for i in 0..3 {
            data.extend(make_bank(&format!("D{}", i), &[], None));
        }
        let (banks, trailer) = enumerate_banks(&data, 2).unwrap();
        assert_eq!(banks.len(), 2);
        assert_eq!(trailer.len(), D88_HEADER_SIZE);
    }

    #[test]
    fn test_zero_size_stops_scan() {
        let mut data = make_bank("A", &[], None);
        data.extend(vec![0u8; D88_HEADER_SIZE]);
        let (banks, _) = enumerate_banks(&data, MAX_D88_BANKS).unwrap();
        assert_eq!(banks.len(), 1);
    }

    #[test]
    fn test_malformed_first_bank_is_error() {
        assert!(enumerate_banks(&[0u8; 0x10], MAX_D88_BANKS).is_err());
        assert!(matches!(
            enumerate_banks(&vec![0u8; D88_HEADER_SIZE], MAX_D88_BANKS),
            Err(MediaError::InvalidSize { .. })
        ));
        let mut data = make_bank("A", &[], None);
        data[OFFSET_SIZE..OFFSET_SIZE + 4].copy_from_slice(&0x10_0000u32.to_le_bytes());
        assert!(enumerate_banks(&data, MAX_D88_BANKS).is_err());
    }

    #[test]
    fn test_parse_serialize_preserves_sectors() {
        let payload = make_bank(
            "SYS",
            &[(id(0, 0, 1, 1), vec![0xAA; 256]), (id(0, 0, 2, 1), vec![0x55; 256])],
            None,
        );
        let floppy = Floppy::parse(&payload).unwrap();
        let track = floppy.track(0, 0).unwrap();
        assert_eq!(track.len(), 2);
        assert_eq!(track[1].id.r, 2);
        assert_eq!(Floppy::parse(&floppy.serialize()).unwrap(), floppy);
        assert_eq!(floppy.display_name(), "SYS");
    }

    #[test]
    fn test_crc_error_status_breaks_stored_crc() {
        let mut payload = make_bank("X", &[(id(0, 0, 1, 1), vec![0; 256])], None);
        // 最初のセクタのステータスをデータCRCエラーに
        let track_offset = read_u32(&payload, OFFSET_TRACKS) as usize;
        payload[track_offset + 8] = status::DATA_CRC_ERROR;
        let floppy = Floppy::parse(&payload).unwrap();
        let sector = &floppy.track(0, 0).unwrap()[0];
        assert_ne!(sector.stored_data_crc, data_crc(&sector.data, false, true));
        assert_eq!(sector.stored_id_crc, id_crc(sector.id, true));
    }

    #[test]
    fn test_crc16_known_value() {
        // CRC-16/CCITT-FALSE("123456789") = 0x29B1
        let crc = b"123456789".iter().fold(0xFFFF, |c, &b| crc16_update(c, b));
        assert_eq!(crc, 0x29B1);
        // MFM IDAM プリアンブル A1 A1 A1 FE の既知値
        assert_eq!(crc_preamble(true, 0xFE), 0xB230);
    }

    #[test]
    fn test_blank_disk_and_write_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blank.d88");
        create_blank_disk(&path, MediaType::Disk2HD).unwrap();
        let mut image = DiskImage::open(&path, 0, MAX_D88_BANKS).unwrap();
        assert_eq!(image.floppy.media, MediaType::Disk2HD);
        assert!(image.floppy.tracks.iter().all(|t| t.is_empty()));

        let ids: Vec<SectorId> = (1..=8).map(|r| id(0, 0, r, 3)).collect();
        assert!(image.floppy.format_track(0, 0, &ids, 0xE5, true));
        assert!(image.flush().unwrap());
        assert!(!image.flush().unwrap());

        let reopened = DiskImage::open(&path, 0, MAX_D88_BANKS).unwrap();
        let track = reopened.floppy.track(0, 0).unwrap();
        assert_eq!(track.len(), 8);
        assert_eq!(track[0].data.len(), 1024);
        assert!(track[0].data.iter().all(|&b| b == 0xE5));
    }

    fn write_first_sector(image: &mut DiskImage, value: u8) {
        let sector = &mut image.floppy.track_mut(0, 0).unwrap()[0];
        sector.write_data(&[value; 256], false);
        image.floppy.modified = true;
    }

    #[test]
    fn test_flush_keeps_banks_written_through_other_images() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.d88");
        let mut data = Vec::new();
        for b in 0..2u8 {
            data.extend(make_bank(&format!("B{}", b), &[(id(0, 0, 1, 1), vec![0x40 + b; 256])], None));
        }
        std::fs::write(&path, data).unwrap();

        let mut first = DiskImage::open(&path, 0, MAX_D88_BANKS).unwrap();
        let mut second = DiskImage::open(&path, 1, MAX_D88_BANKS).unwrap();
        write_first_sector(&mut first, 0xAA);
        write_first_sector(&mut second, 0xBB);
        assert!(first.flush().unwrap());
        assert!(second.flush().unwrap());

        for (bank, expected) in [(0, 0xAA), (1, 0xBB)] {
            let reopened = DiskImage::open(&path, bank, MAX_D88_BANKS).unwrap();
            assert_eq!(reopened.floppy.track(0, 0).unwrap()[0].data[0], expected);
        }
        // 後から書いた側も相手のバンクを取り込んでいる
        assert_eq!(second.to_bytes(), std::fs::read(&path).unwrap());
    }

    #[test]
    fn test_short_write_zero_fills() {
        let mut sector = Sector::new(id(0, 0, 1, 1), true, false, vec![0x11; 256]);
        sector.write_data(&[0x77; 10], false);
        assert_eq!(sector.data.len(), 256);
        assert!(sector.data[..10].iter().all(|&b| b == 0x77));
        assert!(sector.data[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_open_missing_file_fails() {
        assert!(matches!(
            DiskImage::open("/nonexistent/disk.d88", 0, MAX_D88_BANKS),
            Err(MediaError::Io { .. })
        ));
    }
}
