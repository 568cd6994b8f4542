//! PC88RS - NEC PC-8801 VM runner
//!
//! ROMディレクトリとディスクイメージを受け取り、ヘッドレスで指定フレーム数だけ走らせる。
//!
//! # 使用方法
//! ```text
//! pc88rs --rom-dir roms -1 game.d88 --frames 600
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;

use pc88rs::config::{BootMode, CpuType, HostConfig, MonitorType};
use pc88rs::d88::{self, MAX_D88_BANKS};
use pc88rs::fdc_log;
use pc88rs::host::{FramePacer, SharedVm};
use pc88rs::memory::{RomKind, EROM_BANKS, EROM_BANK_SIZE};
use pc88rs::pc88::{Pc88, FRAMES_PER_SECOND};

/// PC88RS - NEC PC-8801 virtual machine
#[derive(Parser, Debug)]
#[command(name = "pc88rs")]
#[command(author = "PC88RS Project")]
#[command(version = "0.1.0")]
#[command(about = "PC88RS - NEC PC-8801 virtual machine core", long_about = None)]
struct Args {
    /// ディスクイメージファイル（ドライブ1）
    #[arg(short = '1', long)]
    disk1: Option<String>,

    /// ディスクイメージファイル（ドライブ2）
    #[arg(short = '2', long)]
    disk2: Option<String>,

    /// ドライブ1のバンク番号
    #[arg(long, default_value = "0")]
    bank1: usize,

    /// ドライブ2のバンク番号
    #[arg(long, default_value = "0")]
    bank2: usize,

    /// ROMディレクトリ（省略時は設定ファイルの値）
    #[arg(long)]
    rom_dir: Option<String>,

    /// 設定ファイル
    #[arg(long)]
    config: Option<String>,

    /// 起動モード (v1s, v1h, v2, n)
    #[arg(short, long)]
    mode: Option<String>,

    /// CPUクロック (4, 8)
    #[arg(long)]
    cpu: Option<u32>,

    /// CPUクロック倍率
    #[arg(long)]
    multiplier: Option<u32>,

    /// 15kHz 標準モニタ
    #[arg(long)]
    standard_monitor: bool,

    /// ディスクのタイミングを再現しない（即時転送）
    #[arg(long)]
    fast_disk: bool,

    /// 実行するフレーム数（0で無限）
    #[arg(long, default_value = "600")]
    frames: u64,

    /// 速度倍率（1=通常、0=最高速）
    #[arg(long, default_value = "1")]
    speed: u32,

    /// 起動前に読み込むセーブステート
    #[arg(long)]
    load_state: Option<String>,

    /// 終了時に保存するセーブステート
    #[arg(long)]
    save_state: Option<String>,

    /// 空の2Dディスクを作成して終了
    #[arg(long)]
    create_disk: Option<String>,

    /// FDCログカテゴリ: flow,state,decide,data,all
    #[arg(long)]
    fdc_log: Option<String>,
}

/// 起動モード名を解析
fn parse_boot_mode(name: &str) -> Option<BootMode> {
    match name.to_ascii_lowercase().as_str() {
        "v1s" => Some(BootMode::V1S),
        "v1h" => Some(BootMode::V1H),
        "v2" => Some(BootMode::V2),
        "n" | "nbasic" => Some(BootMode::N),
        _ => None,
    }
}

/// ROMファイルを読む（無ければ None）
fn read_rom(dir: &Path, name: &str) -> Option<Vec<u8>> {
    let path = dir.join(name);
    match fs::read(&path) {
        Ok(data) => Some(data),
        Err(e) => {
            log::debug!("ROM {} not loaded: {}", path.display(), e);
            None
        }
    }
}

/// ROMディレクトリから全ROMを読み込む
fn load_roms(vm: &mut Pc88, dir: &Path) -> bool {
    let Some(n88) = read_rom(dir, "N88.ROM") else {
        eprintln!("N88.ROM not found in {}", dir.display());
        return false;
    };
    vm.load_rom(RomKind::N88, &n88);
    if let Some(n80) = read_rom(dir, "N80.ROM") {
        vm.load_rom(RomKind::N80, &n80);
    }

    // 拡張ROMは N88_0.ROM .. N88_3.ROM を連結
    let mut erom = vec![0xFF; EROM_BANK_SIZE * EROM_BANKS];
    for bank in 0..EROM_BANKS {
        if let Some(data) = read_rom(dir, &format!("N88_{}.ROM", bank)) {
            let len = data.len().min(EROM_BANK_SIZE);
            let start = bank * EROM_BANK_SIZE;
            erom[start..start + len].copy_from_slice(&data[..len]);
        }
    }
    vm.load_rom(RomKind::N88Ext, &erom);

    if let Some(kanji) = read_rom(dir, "KANJI1.ROM") {
        vm.load_kanji_rom(&kanji);
    }
    if let Some(dict) = read_rom(dir, "JISYO.ROM") {
        vm.load_rom(RomKind::Dictionary, &dict);
    }
    true
}

/// ディスクを挿入。ドライブ2が空でコンテナに2バンク以上あれば、バンク1を自動でドライブ2へ
fn insert_disks(vm: &mut Pc88, args: &Args, config: &mut HostConfig) {
    if let Some(ref path) = args.disk1 {
        if vm.open_disk(0, path, args.bank1) {
            println!("Drive 1: {}", path);
            config.last_disk1 = Some(path.clone());
            config.push_recent_disk(path);
        } else {
            eprintln!("Failed to open disk: {}", path);
        }
    }
    if let Some(ref path) = args.disk2 {
        if vm.open_disk(1, path, args.bank2) {
            println!("Drive 2: {}", path);
            config.last_disk2 = Some(path.clone());
            config.push_recent_disk(path);
        } else {
            eprintln!("Failed to open disk: {}", path);
        }
    }

    let Some(ref path) = args.disk1 else {
        return;
    };
    if vm.is_disk_inserted(0) && !vm.is_disk_inserted(1) {
        match d88::list_banks(path, MAX_D88_BANKS) {
            Ok(banks) if banks.len() >= 2 => {
                if vm.open_disk(1, path, 1) {
                    println!("Drive 2: {} (bank 1 \"{}\")", path, banks[1]);
                }
            }
            Ok(_) => {}
            Err(e) => log::debug!("Bank list unavailable: {}", e),
        }
    }
}

fn main() {
    env_logger::init();

    let args = Args::parse();

    if let Some(ref path) = args.create_disk {
        match d88::create_blank_disk(path, d88::MediaType::Disk2D) {
            Ok(()) => println!("Created {}", path),
            Err(e) => {
                eprintln!("Failed to create disk: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    let config_path = args
        .config
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(pc88rs::config::get_config_path);
    let mut config = HostConfig::load_from(&config_path);

    // コマンドライン指定で設定を上書き
    if let Some(ref mode) = args.mode {
        match parse_boot_mode(mode) {
            Some(boot_mode) => config.vm.boot_mode = boot_mode,
            None => eprintln!("Unknown boot mode: {}. Using {:?}", mode, config.vm.boot_mode),
        }
    }
    match args.cpu {
        Some(8) => config.vm.cpu_type = CpuType::Mhz8,
        Some(4) => config.vm.cpu_type = CpuType::Mhz4,
        Some(other) => eprintln!("Unsupported CPU clock: {}MHz", other),
        None => {}
    }
    if let Some(multiplier) = args.multiplier {
        config.vm.cpu_clock_multiplier = multiplier;
    }
    if args.standard_monitor {
        config.vm.monitor_type = MonitorType::Standard;
    }
    if args.fast_disk {
        config.vm.correct_disk_timing = [false; 2];
    }
    if let Some(ref levels) = args.fdc_log {
        config.fdc_log = levels.clone();
    }
    fdc_log::set_log_level(fdc_log::parse_levels(&config.fdc_log));

    println!("PC88RS v0.1 ({:?}, {:?})", config.vm.boot_mode, config.vm.cpu_type);

    let mut vm = match Pc88::new(config.vm.clone()) {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("Failed to create VM: {}", e);
            std::process::exit(1);
        }
    };
    vm.beeper.set_sample_rate(config.sample_rate);
    vm.beeper.set_volume(config.volume);
    vm.beeper.set_enabled(config.sound_enabled);

    let rom_dir = match args.rom_dir {
        Some(ref dir) => config.resolve_path(dir),
        None => config.rom_dir_path(),
    };
    if !load_roms(&mut vm, &rom_dir) {
        std::process::exit(1);
    }
    vm.reset();
    insert_disks(&mut vm, &args, &mut config);

    if let Some(ref path) = args.load_state {
        if !vm.load_state_from_file(path) {
            eprintln!("Failed to load state: {}", path);
        }
    }

    let shared = SharedVm::from_vm(vm);
    let mut pacer = FramePacer::new(args.speed);
    let samples_per_frame = (config.sample_rate as u64 / FRAMES_PER_SECOND) as usize;
    let mut frame: u64 = 0;
    let mut last_report = 0;

    while args.frames == 0 || frame < args.frames {
        shared.with(|vm| {
            vm.run_one_frame();
            // ホスト側の出力先がないので捨てる
            vm.create_sound(samples_per_frame);
            let accessed = vm.is_disk_accessed();
            if accessed != 0 {
                log::trace!("Disk access: {:02b}", accessed);
            }
        });
        frame += 1;

        if frame - last_report >= FRAMES_PER_SECOND * 10 {
            last_report = frame;
            let (pc, cycles) = shared.with(|vm| (vm.cpu.regs.pc, vm.cpu.total_cycles));
            log::info!("frame {} PC={:04X} cycles={}", frame, pc, cycles);
        }
        pacer.wait();
    }

    if pacer.late_frames > 0 {
        log::debug!("{} late frames", pacer.late_frames);
    }

    shared.with(|vm| {
        if let Some(ref path) = args.save_state {
            if !vm.save_state_to_file(path) {
                eprintln!("Failed to save state: {}", path);
            }
        }
        vm.close_disk(0);
        vm.close_disk(1);
    });

    if let Err(e) = config.save_to(&config_path) {
        eprintln!("Failed to save config: {}", e);
    }
}
