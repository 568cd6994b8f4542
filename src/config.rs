//! 設定管理モジュール
//!
//! `VmConfig` は実行中のVMに渡す設定のスナップショット（`update_config` で差し替える）。
//! `HostConfig` はホスト側の設定で、JSON形式で永続化する。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::fdc::MAX_DRIVES;

/// 設定ファイルのデフォルトファイル名
const CONFIG_FILENAME: &str = "pc88rs_config.json";

/// 最近使ったディスクの保持数
pub const MAX_RECENT_DISKS: usize = 8;

/// 実行ファイルのディレクトリを取得
pub fn get_exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// 相対パスを指定されたベースディレクトリからの絶対パスに解決
pub fn resolve_path_with_base(base: &str, relative: &str) -> PathBuf {
    let path = Path::new(relative);
    if path.is_absolute() {
        path.to_path_buf()
    } else if base.is_empty() {
        get_exe_dir().join(relative)
    } else {
        let base_path = Path::new(base);
        if base_path.is_absolute() {
            base_path.join(relative)
        } else {
            get_exe_dir().join(base).join(relative)
        }
    }
}

/// 設定ファイルのパスを取得
pub fn get_config_path() -> PathBuf {
    get_exe_dir().join(CONFIG_FILENAME)
}

/// CPU種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuType {
    /// 8MHz（4MHzの2倍で走らせる）
    Mhz8,
    Mhz4,
}

/// 起動モード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootMode {
    /// N88-BASIC V1(S)
    V1S,
    /// N88-BASIC V1(H)
    V1H,
    /// N88-BASIC V2
    V2,
    /// N-BASIC
    N,
}

/// サウンドボード種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SoundBoard {
    None,
    Opn,
    OpnA,
}

/// モニタ種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorType {
    /// 24kHz 高解像度
    HighResolution,
    /// 15kHz 標準
    Standard,
}

/// VMの実行時設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// CPUクロック倍率（1 = 等速）
    pub cpu_clock_multiplier: u32,
    pub cpu_type: CpuType,
    pub boot_mode: BootMode,
    pub sound_board: SoundBoard,
    pub monitor_type: MonitorType,
    /// ドライブごとのタイミング再現
    pub correct_disk_timing: [bool; MAX_DRIVES],
    /// ドライブごとのCRCエラー無視
    pub ignore_disk_crc: [bool; MAX_DRIVES],
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            cpu_clock_multiplier: 1,
            cpu_type: CpuType::Mhz4,
            boot_mode: BootMode::V2,
            sound_board: SoundBoard::Opn,
            monitor_type: MonitorType::HighResolution,
            correct_disk_timing: [true; MAX_DRIVES],
            ignore_disk_crc: [false; MAX_DRIVES],
        }
    }
}

impl VmConfig {
    /// CPUサイクル → デバイスクロックの分周比
    pub fn cpu_speed_ratio(&self) -> u32 {
        let base = self.cpu_clock_multiplier.clamp(1, 16);
        match self.cpu_type {
            CpuType::Mhz8 => base * 2,
            CpuType::Mhz4 => base,
        }
    }

    /// ポート$30 入力（ディップスイッチ1）
    pub fn dip_switch1(&self) -> u8 {
        let basic = if self.boot_mode == BootMode::N { 0x00 } else { 0x01 };
        0xC2 | basic
    }

    /// ポート$31 入力（ディップスイッチ2）
    pub fn dip_switch2(&self) -> u8 {
        match self.boot_mode {
            BootMode::V2 => 0x79,
            BootMode::V1H => 0xF9,
            BootMode::V1S | BootMode::N => 0xB9,
        }
    }
}

/// ホスト設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// ホームディレクトリ（相対パスの基準、空なら実行ファイルのディレクトリ）
    #[serde(default)]
    pub home: String,
    /// ROMディレクトリ
    #[serde(default = "default_rom_dir")]
    pub rom_dir: String,
    /// ディスクイメージディレクトリ
    #[serde(default = "default_disk_dir")]
    pub disk_dir: String,
    /// セーブデータディレクトリ
    #[serde(default = "default_save_dir")]
    pub save_dir: String,
    /// 最後に使ったディスク（ドライブ1, 2）
    #[serde(default)]
    pub last_disk1: Option<String>,
    #[serde(default)]
    pub last_disk2: Option<String>,
    /// 最近使ったディスク（新しい順）
    #[serde(default)]
    pub recent_disks: Vec<String>,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// サウンド有効
    #[serde(default = "default_true")]
    pub sound_enabled: bool,
    /// 音量 (0.0 - 1.0)
    #[serde(default = "default_volume")]
    pub volume: f32,
    /// FDCログカテゴリ（"flow,state" など）
    #[serde(default)]
    pub fdc_log: String,
    #[serde(default)]
    pub vm: VmConfig,
}

fn default_rom_dir() -> String { "roms".to_string() }
fn default_disk_dir() -> String { "disks".to_string() }
fn default_save_dir() -> String { "saves".to_string() }
fn default_sample_rate() -> u32 { crate::sound::SAMPLE_RATE }
fn default_volume() -> f32 { 0.5 }
fn default_true() -> bool { true }

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            home: String::new(),
            rom_dir: default_rom_dir(),
            disk_dir: default_disk_dir(),
            save_dir: default_save_dir(),
            last_disk1: None,
            last_disk2: None,
            recent_disks: Vec::new(),
            sample_rate: default_sample_rate(),
            sound_enabled: true,
            volume: default_volume(),
            fdc_log: String::new(),
            vm: VmConfig::default(),
        }
    }
}

impl HostConfig {
    /// 設定ファイルを読み込む（実行ファイルと同じディレクトリから）
    pub fn load() -> Self {
        Self::load_from(get_config_path())
    }

    /// 指定したパスから設定を読み込む（読めなければデフォルト）
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!("Failed to parse config {:?}: {}, using defaults", path.as_ref(), e);
                    HostConfig::default()
                }
            },
            Err(_) => HostConfig::default(),
        }
    }

    /// 指定したパスに設定を保存する
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), String> {
        let json = serde_json::to_string_pretty(self).map_err(|e| format!("Failed to serialize config: {}", e))?;
        fs::write(path, json).map_err(|e| format!("Failed to write config: {}", e))?;
        Ok(())
    }

    /// 相対パスをホームからの絶対パスに解決
    pub fn resolve_path(&self, relative: &str) -> PathBuf {
        resolve_path_with_base(&self.home, relative)
    }

    pub fn rom_dir_path(&self) -> PathBuf {
        self.resolve_path(&self.rom_dir)
    }

    pub fn disk_dir_path(&self) -> PathBuf {
        self.resolve_path(&self.disk_dir)
    }

    pub fn save_dir_path(&self) -> PathBuf {
        self.resolve_path(&self.save_dir)
    }

    /// セーブスロットのパス
    pub fn save_slot_path(&self, slot: u8) -> PathBuf {
        let filename = if slot == 0 {
            "quicksave.json".to_string()
        } else {
            format!("save_slot_{}.json", slot)
        };
        self.save_dir_path().join(filename)
    }

    /// 最近使ったディスクに追加（重複は先頭へ移動）
    pub fn push_recent_disk(&mut self, path: &str) {
        self.recent_disks.retain(|p| p != path);
        self.recent_disks.insert(0, path.to_string());
        self.recent_disks.truncate(MAX_RECENT_DISKS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: HostConfig = serde_json::from_str(r#"{"rom_dir": "/opt/pc88"}"#).unwrap();
        assert_eq!(config.rom_dir, "/opt/pc88");
        assert_eq!(config.disk_dir, "disks");
        assert_eq!(config.sample_rate, 44100);
        assert!(config.sound_enabled);
        assert_eq!(config.vm, VmConfig::default());

        let vm: VmConfig = serde_json::from_str(r#"{"ignore_disk_crc": [true, false]}"#).unwrap();
        assert_eq!(vm.ignore_disk_crc, [true, false]);
        assert_eq!(vm.correct_disk_timing, [true, true]);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = HostConfig::default();
        config.vm.boot_mode = BootMode::N;
        config.vm.cpu_type = CpuType::Mhz8;
        config.push_recent_disk("a.d88");
        config.save_to(&path).unwrap();

        let loaded = HostConfig::load_from(&path);
        assert_eq!(loaded.vm.boot_mode, BootMode::N);
        assert_eq!(loaded.vm.cpu_speed_ratio(), 2);
        assert_eq!(loaded.recent_disks, vec!["a.d88".to_string()]);
    }

    #[test]
    fn test_broken_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let loaded = HostConfig::load_from(&path);
        assert_eq!(loaded.rom_dir, "roms");
    }

    #[test]
    fn test_recent_disks_dedup_and_limit() {
        let mut config = HostConfig::default();
        for i in 0..10 {
            config.push_recent_disk(&format!("disk{}.d88", i));
        }
        config.push_recent_disk("disk5.d88");
        assert_eq!(config.recent_disks.len(), MAX_RECENT_DISKS);
        assert_eq!(config.recent_disks[0], "disk5.d88");
        assert_eq!(config.recent_disks.iter().filter(|p| *p == "disk5.d88").count(), 1);
    }

    #[test]
    fn test_dip_switches_follow_boot_mode() {
        let mut vm = VmConfig::default();
        assert_eq!(vm.dip_switch1() & 0x01, 0x01);
        vm.boot_mode = BootMode::N;
        assert_eq!(vm.dip_switch1() & 0x01, 0x00);
        assert_eq!(vm.dip_switch2(), 0xB9);
    }
}
