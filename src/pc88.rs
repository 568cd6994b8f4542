//! PC-8801 仮想マシン
//!
//! CPU、メモリ、割り込み、FDC、キーボード、ビープを統合し、
//! スケジューラの仮想クロックに沿って1フレームずつ進める。
//!
//! フレームの進め方:
//! 1. 次のイベント期限とフレーム終端の早い方を予算にする
//! 2. 予算に届くまでCPUを1命令ずつ実行する（途中で登録されたイベントで予算は縮む）
//! 3. 到達時刻までの期限切れイベントを期限順に各デバイスへ配送する

use std::path::Path;

use thiserror::Error;

use crate::bank::{BankError, PAGE_COUNT};
use crate::config::{BootMode, CpuType, MonitorType, VmConfig};
use crate::cpu::{Cpu, MemoryBus, SystemBus};
use crate::d88::{DiskImage, MediaError, MAX_D88_BANKS};
use crate::fdc::{Fdc, FdcContext, MAX_DRIVES};
use crate::irq::{InterruptController, IrqLine};
use crate::keyboard::Keyboard;
use crate::memory::{Memory, RomKind};
use crate::opn::SoundPorts;
use crate::ports::{Port30, Port31, Port40In, Port40Out, Port53};
use crate::savestate::{CpuState, DeviceState, SaveState, SaveStateError};
use crate::scheduler::{DeviceId, EventHandle, EventTag, FiredEvent, Scheduler, CLOCK_HZ};
use crate::sound::{Beeper, BEEP_FREQUENCY, SAMPLE_RATE};

/// フレームレート
pub const FRAMES_PER_SECOND: u64 = 60;
/// 1フレームのデバイスクロック数
pub const FRAME_CYCLES: u64 = CLOCK_HZ / FRAMES_PER_SECOND;
/// 1/600秒タイマー
pub const TIMER_PERIOD: u64 = CLOCK_HZ / 600;
/// ビープ発振器の半周期
pub const BEEP_HALF_PERIOD: u64 = CLOCK_HZ / (BEEP_FREQUENCY * 2);
/// 1文字行ぶんのテキストDMAで止まるCPUサイクル
pub const TEXT_DMA_CYCLES: u64 = 120;
/// 漢字ROMサイズ（第1水準）
pub const KANJI_ROM_SIZE: usize = 0x20000;

/// VMのエラー
#[derive(Debug, Error)]
pub enum VmError {
    #[error(transparent)]
    Bank(#[from] BankError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    SaveState(#[from] SaveStateError),

    #[error("drive {0} does not exist")]
    NoSuchDrive(usize),
}

/// 走査線の構成
#[derive(Debug, Clone, Copy)]
struct CrtcTiming {
    total_lines: u64,
    display_lines: u64,
    /// 1文字行の走査線数
    row_lines: u64,
}

impl CrtcTiming {
    fn for_monitor(monitor: MonitorType) -> Self {
        match monitor {
            MonitorType::HighResolution => CrtcTiming {
                total_lines: 448,
                display_lines: 400,
                row_lines: 16,
            },
            MonitorType::Standard => CrtcTiming {
                total_lines: 262,
                display_lines: 200,
                row_lines: 8,
            },
        }
    }

    fn line_cycles(&self) -> u64 {
        FRAME_CYCLES / self.total_lines
    }
}

/// 周期デバイスのイベントハンドル
#[derive(Debug, Clone, Copy, Default)]
struct DeviceEvents {
    vrtc_start: Option<EventHandle>,
    vrtc_end: Option<EventHandle>,
    busreq: Option<EventHandle>,
    timer: Option<EventHandle>,
    beep: Option<EventHandle>,
}

/// PC-8801本体
pub struct Pc88 {
    pub cpu: Cpu,
    pub memory: Memory,
    pub sched: Scheduler,
    pub irq: InterruptController,
    pub fdc: Fdc,
    pub keyboard: Keyboard,
    pub beeper: Beeper,
    pub sound: SoundPorts,
    config: VmConfig,
    kanji_rom: Vec<u8>,
    kanji_address: u16,
    port30: Port30,
    port40: Port40Out,
    port53: Port53,
    vrtc: bool,
    /// テキストDMAでCPUを止める残りサイクル
    stall_cycles: u64,
    /// CPUサイクル → デバイスクロック換算の端数
    cycle_remainder: u32,
    /// 現在の命令列が始まってから進んだデバイスクロック（スケジューラ未反映分）
    elapsed: u64,
    /// 現在のフレームが終わる仮想クロック（命令のはみ出しは次のフレームで吸収する）
    next_frame_end: u64,
    events: DeviceEvents,
    pub frame_count: u64,
}

/// メモリバス: CPUからのメモリアクセス
impl MemoryBus for Pc88 {
    #[inline]
    fn read(&mut self, address: u16) -> u8 {
        self.memory.read(address)
    }

    #[inline]
    fn write(&mut self, address: u16, value: u8) {
        self.memory.write(address, value);
    }
}

impl SystemBus for Pc88 {
    fn io_read(&mut self, port: u16) -> u8 {
        let port = (port & 0xFF) as u8;
        match port {
            0x00..=0x0E => self.keyboard.read_row(port as usize),
            0x30 => self.config.dip_switch1(),
            0x31 => self.config.dip_switch2(),
            0x32 => self.memory.port32().bits(),
            0x40 => self.read_port40(),
            0x44..=0x47 => self.sound.read(port),
            0x5C => 0xF8 | self.memory.gvram_plane().map_or(0, |p| 1 << p),
            // bit7 = 1 で4MHz
            0x6E => {
                if self.config.cpu_type == CpuType::Mhz4 {
                    0xFF
                } else {
                    0x7F
                }
            }
            0x70 => self.memory.text_window(),
            0x71 => self.memory.port71(),
            0xE2 => self.memory.read_port_e2(),
            0xE3 => self.memory.read_port_e3(),
            0xE8 => self.read_kanji(1),
            0xE9 => self.read_kanji(0),
            0xF8 => {
                let mut ctx = FdcContext::new(&mut self.sched, &mut self.irq, self.elapsed);
                self.fdc.terminal_count(&mut ctx);
                0xFF
            }
            0xFA => self.fdc.read_status(),
            0xFB => {
                let mut ctx = FdcContext::new(&mut self.sched, &mut self.irq, self.elapsed);
                self.fdc.read_data(&mut ctx)
            }
            _ => 0xFF,
        }
    }

    fn io_write(&mut self, port: u16, value: u8) {
        let port = (port & 0xFF) as u8;
        match port {
            0x30 => self.port30 = Port30::from_bits_retain(value),
            0x31 => self.memory.write_port31(value),
            0x32 => self.memory.write_port32(value),
            0x40 => self.write_port40(value),
            0x44..=0x47 => self.sound.write(port, value),
            0x53 => self.port53 = Port53::from_bits_retain(value),
            0x5C..=0x5F => self.memory.select_gvram(port),
            0x70 => self.memory.set_text_window(value),
            0x71 => self.memory.write_port71(value),
            0x78 => self.memory.increment_text_window(),
            0xE2 => self.memory.write_port_e2(value),
            0xE3 => self.memory.write_port_e3(value),
            0xE4 => self.irq.set_level(value),
            0xE6 => self.irq.set_mask(value),
            0xE8 => self.kanji_address = (self.kanji_address & 0xFF00) | value as u16,
            0xE9 => self.kanji_address = (self.kanji_address & 0x00FF) | ((value as u16) << 8),
            0xF0 => self.memory.write_port_f0(value),
            0xF1 => self.memory.write_port_f1(value),
            0xF8 => self.fdc.write_motor(value),
            0xFB => {
                let mut ctx = FdcContext::new(&mut self.sched, &mut self.irq, self.elapsed);
                self.fdc.write_data(&mut ctx, value);
            }
            _ => {}
        }
    }

    #[inline]
    fn irq_pending(&mut self) -> bool {
        self.irq.is_pending()
    }

    fn irq_acknowledge(&mut self) -> u8 {
        self.irq.acknowledge().map_or(0xFF, IrqLine::vector_byte)
    }
}

impl Pc88 {
    /// 新しいVMを作成してリセットする
    ///
    /// バッファの確保に失敗した場合だけエラーになる。
    pub fn new(config: VmConfig) -> Result<Self, VmError> {
        let mut vm = Pc88 {
            cpu: Cpu::new(),
            memory: Memory::new()?,
            sched: Scheduler::new(),
            irq: InterruptController::new(),
            fdc: Fdc::new(),
            keyboard: Keyboard::new(),
            beeper: Beeper::new(SAMPLE_RATE),
            sound: SoundPorts::new(config.sound_board),
            config,
            kanji_rom: Vec::new(),
            kanji_address: 0,
            port30: Port30::empty(),
            port40: Port40Out::empty(),
            port53: Port53::empty(),
            vrtc: false,
            stall_cycles: 0,
            cycle_remainder: 0,
            elapsed: 0,
            next_frame_end: FRAME_CYCLES,
            events: DeviceEvents::default(),
            frame_count: 0,
        };
        vm.apply_config();
        vm.reset();
        Ok(vm)
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// ROMをロード
    pub fn load_rom(&mut self, kind: RomKind, data: &[u8]) {
        self.memory.load_rom(kind, data);
    }

    /// 漢字ROM（第1水準）をロード
    pub fn load_kanji_rom(&mut self, data: &[u8]) {
        self.kanji_rom = data[..data.len().min(KANJI_ROM_SIZE)].to_vec();
        log::info!("Loaded kanji ROM ({} bytes)", self.kanji_rom.len());
    }

    fn read_kanji(&self, offset: usize) -> u8 {
        let index = self.kanji_address as usize * 2 + offset;
        self.kanji_rom.get(index).copied().unwrap_or(0xFF)
    }

    /// 現在時刻（実行中の命令列の経過分を含む）
    #[inline]
    fn now(&self) -> u64 {
        self.sched.clock() + self.elapsed
    }

    // ============================================================
    // リセット
    // ============================================================

    /// 電源投入相当のリセット
    ///
    /// 全デバイスのフェーズを打ち切り、スケジューラを空にしてから周期イベントを張り直す。
    pub fn reset(&mut self) {
        {
            let mut ctx = FdcContext::new(&mut self.sched, &mut self.irq, 0);
            self.fdc.reset(&mut ctx);
        }
        self.sched.reset();
        self.irq.reset();
        self.cpu.reset();
        self.memory.reset();
        self.keyboard.reset();
        self.beeper.reset(0);
        self.sound.reset();

        self.port30 = Port30::empty();
        self.port40 = Port40Out::empty();
        self.port53 = Port53::empty();
        self.vrtc = false;
        self.stall_cycles = 0;
        self.cycle_remainder = 0;
        self.elapsed = 0;
        self.kanji_address = 0;
        self.next_frame_end = FRAME_CYCLES;
        self.events = DeviceEvents::default();

        if self.config.boot_mode == BootMode::N {
            self.memory.write_port31(Port31::RMODE.bits());
        }

        self.start_crtc();
        self.events.timer = Some(self.sched.register(DeviceId::Timer, EventTag::TimerTick, TIMER_PERIOD, TIMER_PERIOD));
        let beep = self
            .sched
            .register(DeviceId::Beeper, EventTag::BeepToggle, BEEP_HALF_PERIOD, BEEP_HALF_PERIOD);
        self.sched.set_enabled(beep, false);
        self.events.beep = Some(beep);
        log::info!("PC-8801 reset ({:?})", self.config.boot_mode);
    }

    /// VRTCとテキストDMAのイベントを（張り直して）登録する
    fn start_crtc(&mut self) {
        for handle in [self.events.vrtc_start, self.events.vrtc_end, self.events.busreq]
            .into_iter()
            .flatten()
        {
            self.sched.cancel(handle);
        }
        let timing = CrtcTiming::for_monitor(self.config.monitor_type);
        let line = timing.line_cycles();
        let row = line * timing.row_lines;
        self.events.vrtc_start = Some(self.sched.register(
            DeviceId::Crtc,
            EventTag::VrtcStart,
            line * timing.display_lines,
            FRAME_CYCLES,
        ));
        self.events.vrtc_end = Some(self.sched.register(DeviceId::Crtc, EventTag::VrtcEnd, FRAME_CYCLES, FRAME_CYCLES));
        self.events.busreq = Some(self.sched.register(DeviceId::Crtc, EventTag::BusRequest, row, row));
        self.vrtc = false;
    }

    // ============================================================
    // 設定
    // ============================================================

    /// 実行中に設定を差し替える
    pub fn update_config(&mut self, config: &VmConfig) {
        let monitor_changed = config.monitor_type != self.config.monitor_type;
        self.config = config.clone();
        self.apply_config();
        if monitor_changed {
            self.start_crtc();
        }
    }

    fn apply_config(&mut self) {
        for unit in 0..MAX_DRIVES {
            self.fdc.set_drive_options(
                unit,
                self.config.correct_disk_timing[unit],
                self.config.ignore_disk_crc[unit],
            );
        }
        self.sound.set_board(self.config.sound_board);
        self.keyboard
            .set_convert(matches!(self.config.boot_mode, BootMode::V1S | BootMode::N));
    }

    // ============================================================
    // 実行
    // ============================================================

    /// CPUサイクルをデバイスクロックへ換算
    fn to_device_cycles(&mut self, cycles: u32) -> u64 {
        let ratio = self.config.cpu_speed_ratio();
        let total = cycles + self.cycle_remainder;
        self.cycle_remainder = total % ratio;
        (total / ratio) as u64
    }

    /// 1フレーム分実行
    pub fn run_one_frame(&mut self) {
        let frame_end = self.next_frame_end;
        self.next_frame_end += FRAME_CYCLES;

        while self.sched.clock() < frame_end {
            let start = self.sched.clock();
            let mut bound = self.sched.next_due().map_or(frame_end, |due| due.min(frame_end));
            self.elapsed = 0;

            while start + self.elapsed < bound {
                let remaining = bound - start - self.elapsed;
                if self.stall_cycles > 0 {
                    // テキストDMA中はCPUが止まる
                    let stall = self.stall_cycles.min(remaining);
                    self.stall_cycles -= stall;
                    self.elapsed += stall;
                    continue;
                }
                if self.cpu.regs.halted && !(self.cpu.regs.iff1 && self.irq.is_pending()) {
                    // 割り込みが来るまでHALTのまま
                    self.elapsed += remaining;
                    break;
                }

                let mut cpu = std::mem::take(&mut self.cpu);
                let cycles = cpu.step(self);
                self.cpu = cpu;
                self.elapsed += self.to_device_cycles(cycles);

                // 命令中にデバイスが近いイベントを登録したら予算を縮める
                if let Some(due) = self.sched.next_due() {
                    bound = bound.min(due);
                }
            }

            let target = start + self.elapsed;
            self.elapsed = 0;
            while let Some(event) = self.sched.pop_due(target) {
                self.dispatch(event);
            }
            self.sched.settle(target);
        }

        self.frame_count += 1;
    }

    /// イベントを持ち主のデバイスへ配送
    fn dispatch(&mut self, event: FiredEvent) {
        match event.owner {
            DeviceId::Crtc => self.crtc_event(event.tag),
            DeviceId::Timer => self.irq.raise(IrqLine::Timer),
            DeviceId::Beeper => self.beeper.toggle_oscillator(event.due),
            DeviceId::Fdc => {
                let mut ctx = FdcContext::new(&mut self.sched, &mut self.irq, 0);
                self.fdc.handle_event(&mut ctx, event.tag);
            }
        }
    }

    fn crtc_event(&mut self, tag: EventTag) {
        match tag {
            EventTag::VrtcStart => {
                self.vrtc = true;
                self.irq.raise(IrqLine::Vrtc);
            }
            EventTag::VrtcEnd => self.vrtc = false,
            EventTag::BusRequest => {
                if !self.vrtc && !self.port53.contains(Port53::TEXTDS) {
                    self.stall_cycles += TEXT_DMA_CYCLES;
                }
            }
            _ => {}
        }
    }

    fn read_port40(&self) -> u8 {
        let mut value = Port40In::empty();
        if self.config.monitor_type == MonitorType::Standard {
            value |= Port40In::MONITOR_STD;
        }
        if self.vrtc {
            value |= Port40In::VRTC;
        }
        0xC0 | value.bits()
    }

    fn write_port40(&mut self, value: u8) {
        let new = Port40Out::from_bits_retain(value);
        let now = self.now();
        if new.contains(Port40Out::BEEP) != self.port40.contains(Port40Out::BEEP) {
            let on = new.contains(Port40Out::BEEP);
            self.beeper.set_beep(on, now);
            if let Some(handle) = self.events.beep {
                self.sched.set_enabled(handle, on);
            }
        }
        if new.contains(Port40Out::SING) != self.port40.contains(Port40Out::SING) {
            self.beeper.set_sing(new.contains(Port40Out::SING), now);
        }
        self.port40 = new;
    }

    // ============================================================
    // サウンド
    // ============================================================

    /// 前回呼び出しからの音を `frame_count` フレームのステレオi16で返す
    pub fn create_sound(&mut self, frame_count: usize) -> Vec<i16> {
        let now = self.sched.clock();
        self.beeper.create_sound(frame_count, now)
    }

    // ============================================================
    // ディスク
    // ============================================================

    /// ディスクイメージを開いてドライブに挿入する
    ///
    /// 失敗した場合はドライブの状態を変えずに false を返す。
    pub fn open_disk<P: AsRef<Path>>(&mut self, drive: usize, path: P, bank: usize) -> bool {
        match self.try_open_disk(drive, path.as_ref(), bank) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to open disk {}: {}", path.as_ref().display(), e);
                false
            }
        }
    }

    fn try_open_disk(&mut self, drive: usize, path: &Path, bank: usize) -> Result<(), VmError> {
        if drive >= MAX_DRIVES {
            return Err(VmError::NoSuchDrive(drive));
        }
        // 同じコンテナを挿しているドライブの変更を先にファイルへ反映する
        self.flush_disks_at(path);
        let image = DiskImage::open(path, bank, MAX_D88_BANKS)?;
        self.close_disk(drive);
        self.fdc.insert(drive, image);
        log::info!("Drive {}: {} (bank {})", drive + 1, path.display(), bank);
        Ok(())
    }

    fn flush_disks_at(&mut self, path: &Path) {
        for unit in 0..MAX_DRIVES {
            let Some(image) = self.fdc.disk_mut(unit) else {
                continue;
            };
            if !same_file(&image.path, path) {
                continue;
            }
            if let Err(e) = image.flush() {
                log::error!("Failed to write back {}: {}", image.path.display(), e);
            }
        }
    }

    /// ディスクを取り出し、変更があればコンテナへ書き戻す
    pub fn close_disk(&mut self, drive: usize) {
        if let Some(mut image) = self.fdc.eject(drive) {
            if let Err(e) = image.flush() {
                log::error!("Failed to write back {}: {}", image.path.display(), e);
            }
        }
    }

    pub fn is_disk_inserted(&self, drive: usize) -> bool {
        self.fdc.is_inserted(drive)
    }

    pub fn is_disk_protected(&self, drive: usize) -> bool {
        self.fdc.is_protected(drive)
    }

    pub fn set_disk_protected(&mut self, drive: usize, value: bool) {
        self.fdc.set_protected(drive, value);
    }

    /// 前回呼び出し以降にアクセスのあったドライブ（ビット）
    pub fn is_disk_accessed(&mut self) -> u8 {
        self.fdc.take_accessed()
    }

    // ============================================================
    // キーボード
    // ============================================================

    pub fn key_down(&mut self, code: u8, repeat: bool) {
        self.keyboard.key_down(code, repeat);
    }

    pub fn key_up(&mut self, code: u8) {
        self.keyboard.key_up(code);
    }

    // ============================================================
    // セーブ/ロード
    // ============================================================

    pub fn save_state(&self) -> SaveState {
        SaveState {
            version: SaveState::CURRENT_VERSION,
            timestamp: SaveState::now_timestamp(),
            cpu: CpuState {
                regs: self.cpu.regs.clone(),
                total_cycles: self.cpu.total_cycles,
            },
            memory: self.memory.save_state(),
            pages: self.memory.bank.pages().to_vec(),
            irq: self.irq.save_state(),
            scheduler: self.sched.save_state(),
            fdc: self.fdc.save_state(),
            devices: DeviceState {
                port30: self.port30.bits(),
                port40: self.port40.bits(),
                port53: self.port53.bits(),
                vrtc: self.vrtc,
                stall_cycles: self.stall_cycles,
                beep_on: self.beeper.beep_on(),
                sing: self.beeper.sing(),
                cycle_remainder: self.cycle_remainder,
                kanji_address: self.kanji_address,
                frame_end: self.next_frame_end,
                vrtc_start_event: self.events.vrtc_start,
                vrtc_end_event: self.events.vrtc_end,
                busreq_event: self.events.busreq,
                timer_event: self.events.timer,
                beep_event: self.events.beep,
            },
            opn: self.sound.save_state(),
            frame_count: self.frame_count,
        }
    }

    pub fn load_state(&mut self, state: &SaveState) {
        self.cpu.reset();
        self.cpu.regs = state.cpu.regs.clone();
        self.cpu.total_cycles = state.cpu.total_cycles;
        self.memory.load_state(&state.memory);
        if state.pages.len() == PAGE_COUNT {
            self.memory.bank.restore_pages(&state.pages);
        }
        self.irq.load_state(&state.irq);
        self.sched.load_state(&state.scheduler);
        self.fdc.load_state(&state.fdc);
        self.sound.load_state(&state.opn);

        let devices = &state.devices;
        self.port30 = Port30::from_bits_retain(devices.port30);
        self.port40 = Port40Out::from_bits_retain(devices.port40);
        self.port53 = Port53::from_bits_retain(devices.port53);
        self.vrtc = devices.vrtc;
        self.stall_cycles = devices.stall_cycles;
        self.cycle_remainder = devices.cycle_remainder;
        self.kanji_address = devices.kanji_address;
        self.events = DeviceEvents {
            vrtc_start: devices.vrtc_start_event,
            vrtc_end: devices.vrtc_end_event,
            busreq: devices.busreq_event,
            timer: devices.timer_event,
            beep: devices.beep_event,
        };
        let clock = self.sched.clock();
        self.beeper.reset(clock);
        self.beeper.set_beep(devices.beep_on, clock);
        self.beeper.set_sing(devices.sing, clock);
        self.elapsed = 0;
        self.frame_count = state.frame_count;
        self.next_frame_end = if devices.frame_end > clock {
            devices.frame_end
        } else {
            clock + FRAME_CYCLES
        };
    }

    /// ファイルへ保存
    pub fn save_state_to_file<P: AsRef<Path>>(&self, path: P) -> bool {
        match self.save_state().save_to(&path) {
            Ok(()) => {
                log::info!("State saved to {}", path.as_ref().display());
                true
            }
            Err(e) => {
                log::warn!("Failed to save state: {}", e);
                false
            }
        }
    }

    /// ファイルから復元（失敗時は現在の状態を保つ）
    pub fn load_state_from_file<P: AsRef<Path>>(&mut self, path: P) -> bool {
        match SaveState::load_from(&path) {
            Ok(state) => {
                self.load_state(&state);
                log::info!("State loaded from {} ({})", path.as_ref().display(), state.timestamp);
                true
            }
            Err(e) => {
                log::warn!("Failed to load state: {}", e);
                false
            }
        }
    }
}

/// 2つのパスが同じファイルを指すか
fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SoundBoard;
    use crate::d88::tests::make_bank;
    use crate::d88::SectorId;
    use crate::fdc::Phase;
    use crate::memory::ROM_SIZE;

    /// 先頭にプログラムを置いたN88 ROMでVMを作る
    fn vm_with_program(program: &[u8], config: VmConfig) -> Pc88 {
        let mut vm = Pc88::new(config).unwrap();
        let mut rom = vec![0u8; ROM_SIZE];
        rom[..program.len()].copy_from_slice(program);
        vm.load_rom(RomKind::N88, &rom);
        vm.reset();
        vm
    }

    fn instant_config() -> VmConfig {
        VmConfig {
            correct_disk_timing: [false; MAX_DRIVES],
            ..VmConfig::default()
        }
    }

    fn disk_file(dir: &tempfile::TempDir, name: &str, banks: usize) -> std::path::PathBuf {
        let mut data = Vec::new();
        for b in 0..banks {
            data.extend(make_bank(
                &format!("BANK{}", b),
                &[(SectorId { c: 0, h: 0, r: 1, n: 1 }, vec![0x40 + b as u8; 256])],
                None,
            ));
        }
        let path = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_reset_maps_n88_rom_and_ram() {
        let mut vm = vm_with_program(&[0xF3, 0x76], VmConfig::default());
        assert_eq!(vm.memory.read(0x0000), 0xF3);
        vm.memory.write(0x9000, 0x12);
        assert_eq!(vm.memory.read(0x9000), 0x12);
    }

    #[test]
    fn test_frame_advances_clock_and_raises_periodic_lines() {
        // DI / HALT
        let mut vm = vm_with_program(&[0xF3, 0x76], VmConfig::default());
        vm.run_one_frame();
        assert!(vm.sched.clock() >= FRAME_CYCLES);
        assert!(vm.sched.clock() < FRAME_CYCLES + 32);
        assert!(vm.irq.is_raised(IrqLine::Timer));
        assert!(vm.irq.is_raised(IrqLine::Vrtc));
        assert_eq!(vm.frame_count, 1);
    }

    #[test]
    fn test_frame_boundaries_do_not_drift() {
        // JR $ は命令がフレーム境界をまたぐので、はみ出しが次のフレームに繰り越される
        let mut vm = vm_with_program(&[0x18, 0xFE], VmConfig::default());
        for _ in 0..1000 {
            vm.run_one_frame();
        }
        assert!(vm.sched.clock() >= 1000 * FRAME_CYCLES);
        assert!(vm.sched.clock() < 1000 * FRAME_CYCLES + 32);
    }

    #[test]
    fn test_vrtc_interrupt_dispatches_through_im2() {
        let mut program = vec![
            0x31, 0x00, 0xF0, // LD SP,0xF000
            0x3E, 0x01, // LD A,0x01
            0xED, 0x47, // LD I,A
            0xED, 0x5E, // IM 2
            0x3E, 0x02, // LD A,0x02
            0xD3, 0xE6, // OUT (0xE6),A
            0x3E, 0x08, // LD A,0x08
            0xD3, 0xE4, // OUT (0xE4),A
            0xFB, // EI
            0x76, // HALT
            0x18, 0xFD, // JR -3
        ];
        program.resize(0x102, 0);
        program.extend_from_slice(&[0x00, 0x02]);
        program.resize(0x200, 0);
        // LD A,0x5A / LD (0x9000),A / RET
        program.extend_from_slice(&[0x3E, 0x5A, 0x32, 0x00, 0x90, 0xC9]);

        let mut vm = vm_with_program(&program, VmConfig::default());
        vm.run_one_frame();
        assert_eq!(vm.memory.read(0x9000), 0x5A);
        assert!(!vm.irq.is_raised(IrqLine::Vrtc));
    }

    #[test]
    fn test_cpu_clock_multiplier_runs_more_instructions() {
        // OUT (0x53),A で表示を止めてから JR $
        let program = [0x3E, 0x01, 0xD3, 0x53, 0x18, 0xFE];
        let mut normal = vm_with_program(&program, VmConfig::default());
        normal.run_one_frame();

        let fast_config = VmConfig {
            cpu_clock_multiplier: 2,
            ..VmConfig::default()
        };
        let mut fast = vm_with_program(&program, fast_config);
        fast.run_one_frame();

        assert!(normal.cpu.total_cycles >= FRAME_CYCLES - 16);
        assert!(fast.cpu.total_cycles >= 2 * FRAME_CYCLES - 32);
    }

    #[test]
    fn test_text_dma_steals_cycles() {
        let mut vm = vm_with_program(&[0x18, 0xFE], VmConfig::default());
        vm.run_one_frame();
        assert!(vm.cpu.total_cycles < FRAME_CYCLES - TEXT_DMA_CYCLES);
    }

    #[test]
    fn test_keyboard_ports() {
        let mut vm = vm_with_program(&[0xF3, 0x76], VmConfig::default());
        vm.key_down(0x41, false);
        assert_eq!(vm.io_read(0x02), 0xFD);
        vm.key_up(0x41);
        assert_eq!(vm.io_read(0x02), 0xFF);
        assert_eq!(vm.io_read(0x0F), 0xFF);
    }

    #[test]
    fn test_disk_read_through_ports() {
        let dir = tempfile::tempdir().unwrap();
        let path = disk_file(&dir, "read.d88", 1);
        let mut vm = vm_with_program(&[0xF3, 0x76], instant_config());
        assert!(vm.open_disk(0, &path, 0));
        assert!(vm.is_disk_inserted(0));
        assert!(!vm.is_disk_protected(0));

        for b in [0x46, 0x00, 0, 0, 1, 1, 1, 0x1B, 0xFF] {
            vm.io_write(0xFB, b);
        }
        let data: Vec<u8> = (0..256).map(|_| vm.io_read(0xFB)).collect();
        assert!(data.iter().all(|&b| b == 0x40));
        vm.io_read(0xF8);
        assert_eq!(vm.fdc.phase(), Phase::Result);
        assert!(vm.irq.is_raised(IrqLine::FdInt1));
        let result: Vec<u8> = (0..7).map(|_| vm.io_read(0xFB)).collect();
        assert_eq!(result[0] & 0xC0, 0);
        assert_eq!(vm.is_disk_accessed(), 0x01);
        assert_eq!(vm.is_disk_accessed(), 0x00);
    }

    #[test]
    fn test_timed_disk_read_completes_during_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = disk_file(&dir, "timed.d88", 1);
        let mut vm = vm_with_program(&[0xF3, 0x76], VmConfig::default());
        assert!(vm.open_disk(0, &path, 0));
        for b in [0x46, 0x00, 0, 0, 1, 1, 1, 0x1B, 0xFF] {
            vm.io_write(0xFB, b);
        }
        assert_eq!(vm.io_read(0xFA) & 0x80, 0);
        for _ in 0..15 {
            vm.run_one_frame();
        }
        assert_ne!(vm.io_read(0xFA) & 0x80, 0);
        assert_eq!(vm.io_read(0xFB), 0x40);
    }

    #[test]
    fn test_open_disk_failure_keeps_prior_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = disk_file(&dir, "two.d88", 2);
        let mut vm = vm_with_program(&[0xF3, 0x76], instant_config());
        assert!(vm.open_disk(0, &path, 1));
        assert!(!vm.open_disk(0, dir.path().join("missing.d88"), 0));
        assert!(!vm.open_disk(0, &path, 2));
        assert!(!vm.open_disk(2, &path, 0));
        assert!(vm.is_disk_inserted(0));
        assert_eq!(vm.fdc.disk(0).unwrap().current_bank(), 1);
    }

    #[test]
    fn test_close_disk_writes_back_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = disk_file(&dir, "write.d88", 2);
        let mut vm = vm_with_program(&[0xF3, 0x76], instant_config());
        assert!(vm.open_disk(0, &path, 1));

        for b in [0x45, 0x00, 0, 0, 1, 1, 1, 0x1B, 0xFF] {
            vm.io_write(0xFB, b);
        }
        for _ in 0..256 {
            vm.io_write(0xFB, 0x99);
        }
        vm.io_read(0xF8);
        let result: Vec<u8> = (0..7).map(|_| vm.io_read(0xFB)).collect();
        assert_eq!(result[0] & 0xC0, 0);

        vm.close_disk(0);
        assert!(!vm.is_disk_inserted(0));
        let image = DiskImage::open(&path, 1, MAX_D88_BANKS).unwrap();
        assert_eq!(image.floppy.track(0, 0).unwrap()[0].data[0], 0x99);
        let other = DiskImage::open(&path, 0, MAX_D88_BANKS).unwrap();
        assert_eq!(other.floppy.track(0, 0).unwrap()[0].data[0], 0x40);
    }

    /// ポート経由で C0 H0 R1 に `value` を書く
    fn write_first_sector(vm: &mut Pc88, unit: u8, value: u8) {
        for b in [0x45, unit, 0, 0, 1, 1, 1, 0x1B, 0xFF] {
            vm.io_write(0xFB, b);
        }
        for _ in 0..256 {
            vm.io_write(0xFB, value);
        }
        vm.io_read(0xF8);
        let result: Vec<u8> = (0..7).map(|_| vm.io_read(0xFB)).collect();
        assert_eq!(result[0] & 0xC0, 0);
    }

    fn first_byte_on_file(path: &Path, bank: usize) -> u8 {
        let image = DiskImage::open(path, bank, MAX_D88_BANKS).unwrap();
        image.floppy.track(0, 0).unwrap()[0].data[0]
    }

    #[test]
    fn test_two_drives_on_one_file_keep_both_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = disk_file(&dir, "shared.d88", 2);
        let mut vm = vm_with_program(&[0xF3, 0x76], instant_config());
        assert!(vm.open_disk(0, &path, 0));
        assert!(vm.open_disk(1, &path, 1));

        write_first_sector(&mut vm, 0x00, 0xAA);
        write_first_sector(&mut vm, 0x01, 0xBB);
        vm.close_disk(0);
        vm.close_disk(1);

        assert_eq!(first_byte_on_file(&path, 0), 0xAA);
        assert_eq!(first_byte_on_file(&path, 1), 0xBB);
    }

    #[test]
    fn test_open_disk_sees_unflushed_writes_to_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = disk_file(&dir, "reopen.d88", 2);
        let mut vm = vm_with_program(&[0xF3, 0x76], instant_config());
        assert!(vm.open_disk(0, &path, 0));
        write_first_sector(&mut vm, 0x00, 0xAA);

        // ドライブ0の未保存の変更がドライブ1から見える
        assert!(vm.open_disk(1, &path, 0));
        let image = vm.fdc.disk(1).unwrap();
        assert_eq!(image.floppy.track(0, 0).unwrap()[0].data[0], 0xAA);
        assert!(!vm.fdc.disk(0).unwrap().is_dirty());
        assert_eq!(first_byte_on_file(&path, 0), 0xAA);
        assert_eq!(first_byte_on_file(&path, 1), 0x41);
    }

    #[test]
    fn test_write_protect_toggle() {
        let dir = tempfile::tempdir().unwrap();
        let path = disk_file(&dir, "wp.d88", 1);
        let mut vm = vm_with_program(&[0xF3, 0x76], instant_config());
        assert!(vm.open_disk(0, &path, 0));
        vm.set_disk_protected(0, true);
        assert!(vm.is_disk_protected(0));
        for b in [0x45, 0x00, 0, 0, 1, 1, 1, 0x1B, 0xFF] {
            vm.io_write(0xFB, b);
        }
        let result: Vec<u8> = (0..7).map(|_| vm.io_read(0xFB)).collect();
        assert_eq!(result[1], crate::fdc::st1::NOT_WRITABLE);
    }

    #[test]
    fn test_beep_produces_square_wave() {
        let mut vm = vm_with_program(&[0xF3, 0x76], VmConfig::default());
        vm.io_write(0x40, Port40Out::BEEP.bits());
        vm.run_one_frame();
        let samples = vm.create_sound(735);
        assert_eq!(samples.len(), 735 * 2);
        let max = samples.iter().copied().max().unwrap();
        let min = samples.iter().copied().min().unwrap();
        assert!(max > 0 && min < 0);
    }

    #[test]
    fn test_update_config_applies_drive_options() {
        let mut vm = vm_with_program(&[0xF3, 0x76], VmConfig::default());
        let mut config = vm.config().clone();
        config.monitor_type = MonitorType::Standard;
        config.boot_mode = BootMode::V1S;
        vm.update_config(&config);
        assert_eq!(vm.io_read(0x40) & Port40In::MONITOR_STD.bits(), Port40In::MONITOR_STD.bits());
        assert_eq!(vm.io_read(0x31), 0xB9);
        // 張り直しても周期イベントは重複しない
        assert_eq!(vm.sched.len(), 5);
    }

    #[test]
    fn test_sound_board_selects_port_answers() {
        let mut vm = vm_with_program(&[0xF3, 0x76], VmConfig::default());
        vm.io_write(0x44, 0xFF);
        assert_eq!(vm.io_read(0x44), 0x00);
        assert_eq!(vm.io_read(0x45), 0xFF);

        let mut config = vm.config().clone();
        config.sound_board = SoundBoard::OpnA;
        vm.update_config(&config);
        assert_eq!(vm.io_read(0x45), crate::opn::OPNA_ID);
        assert_eq!(vm.io_read(0x46), 0x00);

        config.sound_board = SoundBoard::None;
        vm.update_config(&config);
        for port in 0x44..=0x47 {
            assert_eq!(vm.io_read(port), 0xFF);
        }
    }

    #[test]
    fn test_sound_registers_survive_save_state() {
        let mut vm = vm_with_program(&[0xF3, 0x76], VmConfig::default());
        vm.io_write(0x44, 0x07);
        vm.io_write(0x45, 0x38);
        let json = vm.save_state().to_json().unwrap();

        let mut restored = vm_with_program(&[0xF3, 0x76], VmConfig::default());
        restored.load_state(&SaveState::from_json(&json).unwrap());
        assert_eq!(restored.io_read(0x45), 0x38);
    }

    #[test]
    fn test_save_state_round_trip_is_deterministic() {
        let program = [0x3E, 0x00, 0x3C, 0x32, 0x00, 0x90, 0x18, 0xFA];
        let mut vm = vm_with_program(&program, VmConfig::default());
        vm.run_one_frame();
        let json = vm.save_state().to_json().unwrap();

        let mut restored = vm_with_program(&program, VmConfig::default());
        restored.load_state(&SaveState::from_json(&json).unwrap());
        assert_eq!(restored.cpu.regs, vm.cpu.regs);
        assert_eq!(restored.sched.clock(), vm.sched.clock());

        vm.run_one_frame();
        restored.run_one_frame();
        assert_eq!(restored.cpu.regs, vm.cpu.regs);
        assert_eq!(restored.memory.read(0x9000), vm.memory.read(0x9000));
        assert_eq!(restored.frame_count, 2);
    }

    #[test]
    fn test_save_state_version_mismatch_rejected() {
        let vm = vm_with_program(&[0xF3, 0x76], VmConfig::default());
        let mut state = vm.save_state();
        state.version = 99;
        let json = state.to_json().unwrap();
        assert!(matches!(
            SaveState::from_json(&json),
            Err(SaveStateError::Version { found: 99, .. })
        ));
    }

    #[test]
    fn test_state_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut vm = vm_with_program(&[0xF3, 0x76], VmConfig::default());
        vm.run_one_frame();
        assert!(vm.save_state_to_file(&path));
        vm.run_one_frame();
        assert!(vm.load_state_from_file(&path));
        assert_eq!(vm.frame_count, 1);
        assert!(!vm.load_state_from_file(dir.path().join("none.json")));
        assert_eq!(vm.frame_count, 1);
    }

    #[test]
    fn test_kanji_rom_ports() {
        let mut vm = vm_with_program(&[0xF3, 0x76], VmConfig::default());
        let mut kanji = vec![0u8; KANJI_ROM_SIZE];
        kanji[0x1234 * 2] = 0xAB;
        kanji[0x1234 * 2 + 1] = 0xCD;
        vm.load_kanji_rom(&kanji);
        vm.io_write(0xE8, 0x34);
        vm.io_write(0xE9, 0x12);
        assert_eq!(vm.io_read(0xE9), 0xAB);
        assert_eq!(vm.io_read(0xE8), 0xCD);
    }
}
