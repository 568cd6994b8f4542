//! セーブステート機能
//!
//! VMの状態を保存・復元する。中身はホストから見て不透明なスナップショットで、
//! JSONにエンコードして保存する。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::bank::Page;
use crate::cpu::Registers;
use crate::fdc::FdcState;
use crate::irq::IrqState;
use crate::memory::MemoryState;
use crate::opn::OpnState;
use crate::scheduler::{EventHandle, SchedulerState};

/// セーブ/ロードのエラー
#[derive(Debug, Error)]
pub enum SaveStateError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed save state: {0}")]
    Format(#[from] serde_json::Error),

    #[error("unsupported save state version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },
}

/// CPUの状態（セーブ用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuState {
    pub regs: Registers,
    pub total_cycles: u64,
}

/// 周辺デバイスのラッチとイベントハンドル（セーブ用）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceState {
    pub port30: u8,
    pub port40: u8,
    pub port53: u8,
    pub vrtc: bool,
    /// テキストDMAでまだ止めるCPUサイクル
    pub stall_cycles: u64,
    pub beep_on: bool,
    pub sing: bool,
    /// CPUサイクル → デバイスクロック換算の端数
    pub cycle_remainder: u32,
    /// 漢字ROMアドレス（ポート$E8/$E9）
    pub kanji_address: u16,
    /// 次のフレーム終端のクロック
    #[serde(default)]
    pub frame_end: u64,
    pub vrtc_start_event: Option<EventHandle>,
    pub vrtc_end_event: Option<EventHandle>,
    pub busreq_event: Option<EventHandle>,
    pub timer_event: Option<EventHandle>,
    pub beep_event: Option<EventHandle>,
}

/// 完全なVM状態
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveState {
    /// セーブフォーマットのバージョン
    pub version: u32,
    /// 保存日時（RFC 3339）
    pub timestamp: String,
    pub cpu: CpuState,
    pub memory: MemoryState,
    pub pages: Vec<Page>,
    pub irq: IrqState,
    pub scheduler: SchedulerState,
    pub fdc: FdcState,
    pub devices: DeviceState,
    /// サウンドボードのレジスタ
    #[serde(default)]
    pub opn: OpnState,
    pub frame_count: u64,
}

impl SaveState {
    pub const CURRENT_VERSION: u32 = 1;

    /// 現在時刻のタイムスタンプ
    pub fn now_timestamp() -> String {
        chrono::Local::now().to_rfc3339()
    }

    pub fn to_json(&self) -> Result<String, SaveStateError> {
        Ok(serde_json::to_string(self)?)
    }

    /// JSONから復元（バージョンが違えば拒否）
    pub fn from_json(text: &str) -> Result<Self, SaveStateError> {
        let state: SaveState = serde_json::from_str(text)?;
        if state.version != Self::CURRENT_VERSION {
            return Err(SaveStateError::Version {
                found: state.version,
                expected: Self::CURRENT_VERSION,
            });
        }
        Ok(state)
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), SaveStateError> {
        let json = self.to_json()?;
        fs::write(&path, json).map_err(|source| SaveStateError::Io {
            path: path.as_ref().display().to_string(),
            source,
        })
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, SaveStateError> {
        let text = fs::read_to_string(&path).map_err(|source| SaveStateError::Io {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }
}
