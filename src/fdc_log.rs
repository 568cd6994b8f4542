//! FDCログシステム
//!
//! 原則:
//! 1. ログは「現象」ではなく「判断」を記録
//! 2. 状態遷移のみ記録（ステータスポーリングは記録しない）
//! 3. カテゴリ分離: FLOW / STATE / DECIDE / DATA
//!
//! 出力は `log` クレート経由（`RUST_LOG` と併用）。

use std::sync::atomic::{AtomicU32, Ordering};

use crate::d88::SectorId;

bitflags::bitflags! {
    /// ログカテゴリ
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FdcLogLevel: u32 {
        /// コマンドと結果（人間向け）
        const FLOW   = 0b0001;
        /// フェーズ遷移・シーク
        const STATE  = 0b0010;
        /// タイミング判断（待ち時間、ライトプロテクト、CRC）
        const DECIDE = 0b0100;
        /// 転送データ（短時間のみ）
        const DATA   = 0b1000;
    }
}

static LOG_LEVEL: AtomicU32 = AtomicU32::new(0);

pub fn set_log_level(level: FdcLogLevel) {
    LOG_LEVEL.store(level.bits(), Ordering::Relaxed);
}

pub fn get_log_level() -> FdcLogLevel {
    FdcLogLevel::from_bits_truncate(LOG_LEVEL.load(Ordering::Relaxed))
}

#[inline]
pub fn is_enabled(flag: FdcLogLevel) -> bool {
    (LOG_LEVEL.load(Ordering::Relaxed) & flag.bits()) != 0
}

/// カテゴリ名のカンマ区切り文字列から解析（"flow,state" など）
pub fn parse_levels(text: &str) -> FdcLogLevel {
    text.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .fold(FdcLogLevel::empty(), |acc, name| match name.as_str() {
            "flow" => acc | FdcLogLevel::FLOW,
            "state" => acc | FdcLogLevel::STATE,
            "decide" => acc | FdcLogLevel::DECIDE,
            "data" => acc | FdcLogLevel::DATA,
            "all" => FdcLogLevel::all(),
            _ => acc,
        })
}

// ============================================================
// ログ出力関数
// ============================================================

/// [FLOW] コマンド受理
pub fn log_command(name: &str, params: &[u8]) {
    if is_enabled(FdcLogLevel::FLOW) {
        log::info!("[FDC] {} {:02X?}", name, params);
    }
}

/// [FLOW] リザルト
pub fn log_result(result: &[u8]) {
    if is_enabled(FdcLogLevel::FLOW) {
        log::info!("[FDC] Result {:02X?}", result);
    }
}

/// [FLOW] セクタ位置決め
pub fn log_sector(unit: usize, c: u8, h: u8, r: u8, n: u8) {
    if is_enabled(FdcLogLevel::FLOW) {
        log::info!("[FDC] Drive {} sector C={} H={} R={} N={}", unit + 1, c, h, r, n);
    }
}

/// [STATE] フェーズ遷移
pub fn log_phase(from: &str, to: &str) {
    if is_enabled(FdcLogLevel::STATE) {
        log::debug!("[STATE] Phase {} -> {}", from, to);
    }
}

/// [STATE] シーク
pub fn log_seek(unit: usize, from: u8, to: u8) {
    if is_enabled(FdcLogLevel::STATE) {
        log::debug!("[STATE] Drive {} seek {} -> {}", unit + 1, from, to);
    }
}

/// [STATE] リセットによる中断
pub fn log_abort(phase: &str) {
    if is_enabled(FdcLogLevel::STATE) {
        log::debug!("[STATE] Reset aborted {} phase", phase);
    }
}

/// [DECIDE] 待ち時間の決定
pub fn log_latency(what: &str, cycles: u64) {
    if is_enabled(FdcLogLevel::DECIDE) {
        log::debug!("[DECIDE] {} latency {} cycles", what, cycles);
    }
}

/// [DECIDE] ライトプロテクトで拒否
pub fn log_write_protected(unit: usize) {
    if is_enabled(FdcLogLevel::DECIDE) {
        log::debug!("[DECIDE] Drive {} write protected, command rejected", unit + 1);
    }
}

/// [DECIDE] セクタ途中で打ち切られた書き込み
pub fn log_short_write(id: SectorId, written: usize, size: usize) {
    if is_enabled(FdcLogLevel::DECIDE) {
        log::debug!(
            "[DECIDE] Sector R={} written {}/{} bytes, rest zero-filled",
            id.r,
            written,
            size
        );
    }
}

/// [DECIDE] CRC不一致
pub fn log_crc_mismatch(field: &str, expected: u16, actual: u16, tolerated: bool) {
    if is_enabled(FdcLogLevel::DECIDE) {
        log::debug!(
            "[DECIDE] {} CRC {:04X} != {:04X}{}",
            field,
            actual,
            expected,
            if tolerated { " (ignored)" } else { "" }
        );
    }
}

/// [DATA] 転送済みセクタのダンプ
pub fn dump_sector(data: &[u8]) {
    if !is_enabled(FdcLogLevel::DATA) {
        return;
    }
    for (i, chunk) in data.chunks(16).enumerate() {
        log::trace!("[DUMP] {:04X}: {:02X?}", i * 16, chunk);
    }
}
