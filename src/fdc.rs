//! uPD765A フロッピーディスクコントローラ
//!
//! フェーズ: Idle → Command → Execution → Result → Idle
//! データ転送はPIO（データポート経由の1バイトずつ）。
//! シーク・回転待ちは「正確なタイミング」モードのときだけスケジューラのイベントで表し、
//! 即時モードではコマンド受理の呼び出しの中で実行フェーズのデータが用意される。
//! どちらのモードでも転送されるデータとステータスは同じで、観測できる時刻だけが違う。

use serde::{Deserialize, Serialize};

use crate::d88::{self, DiskImage, SectorId};
use crate::fdc_log::{
    dump_sector, log_abort, log_command, log_crc_mismatch, log_latency, log_phase, log_result,
    log_sector, log_seek, log_write_protected,
};
use crate::irq::{InterruptController, IrqLine};
use crate::ports::MotorControl;
use crate::scheduler::{DeviceId, EventHandle, EventTag, Scheduler, CLOCK_HZ};

/// 接続されているドライブ数
pub const MAX_DRIVES: usize = 2;
/// コントローラが選択できるユニット数
const UNITS: usize = 4;

/// 1回転のサイクル数（300rpm）
pub const ROTATION_CYCLES: u64 = CLOCK_HZ / 5;
const CYCLES_PER_MS: u64 = CLOCK_HZ / 1000;
/// EOTの最終バイト後、TCを待つ猶予（CRC 2バイト分）
pub const TC_GRACE_CYCLES: u64 = 128;
/// セクタが見つからないときはインデックスを2回通過してから諦める
const MISSING_SECTOR_ROTATIONS: u64 = 2;

/// メインステータスレジスタ
pub mod msr {
    pub const RQM: u8 = 0x80;
    pub const DIO: u8 = 0x40;
    pub const EXM: u8 = 0x20;
    pub const CB: u8 = 0x10;
}

pub mod st0 {
    pub const ABNORMAL: u8 = 0x40;
    pub const INVALID: u8 = 0x80;
    pub const SEEK_END: u8 = 0x20;
    pub const NOT_READY: u8 = 0x08;
}

pub mod st1 {
    pub const END_OF_CYLINDER: u8 = 0x80;
    pub const DATA_ERROR: u8 = 0x20;
    pub const NO_DATA: u8 = 0x04;
    pub const NOT_WRITABLE: u8 = 0x02;
    pub const MISSING_ADDRESS_MARK: u8 = 0x01;
}

pub mod st2 {
    pub const CONTROL_MARK: u8 = 0x40;
    pub const DATA_ERROR_IN_DATA: u8 = 0x20;
    pub const WRONG_CYLINDER: u8 = 0x10;
    pub const BAD_CYLINDER: u8 = 0x02;
    pub const MISSING_DATA_MARK: u8 = 0x01;
}

pub mod st3 {
    pub const WRITE_PROTECT: u8 = 0x40;
    pub const READY: u8 = 0x20;
    pub const TRACK0: u8 = 0x10;
    pub const TWO_SIDE: u8 = 0x08;
}

const CMD_MT: u8 = 0x80;
const CMD_MF: u8 = 0x40;
const CMD_SK: u8 = 0x20;

/// コントローラのフェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Idle,
    Command,
    Execution,
    Result,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Idle => "IDLE",
            Phase::Command => "COMMAND",
            Phase::Execution => "EXECUTION",
            Phase::Result => "RESULT",
        }
    }
}

/// コマンド
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Specify,
    SenseDriveStatus,
    WriteData,
    ReadData,
    Recalibrate,
    SenseInterruptStatus,
    WriteDeletedData,
    ReadId,
    ReadDeletedData,
    FormatTrack,
    Seek,
    Invalid,
}

impl Command {
    /// コマンドバイトの下位5ビットで判別
    pub fn decode(byte: u8) -> Self {
        match byte & 0x1F {
            0x03 => Command::Specify,
            0x04 => Command::SenseDriveStatus,
            0x05 => Command::WriteData,
            0x06 => Command::ReadData,
            0x07 => Command::Recalibrate,
            0x08 => Command::SenseInterruptStatus,
            0x09 => Command::WriteDeletedData,
            0x0A => Command::ReadId,
            0x0C => Command::ReadDeletedData,
            0x0D => Command::FormatTrack,
            0x0F => Command::Seek,
            _ => Command::Invalid,
        }
    }

    /// コマンドバイトに続くパラメータ数
    pub fn param_count(self) -> usize {
        match self {
            Command::Specify => 2,
            Command::SenseDriveStatus => 1,
            Command::WriteData
            | Command::ReadData
            | Command::WriteDeletedData
            | Command::ReadDeletedData => 8,
            Command::Recalibrate => 1,
            Command::SenseInterruptStatus => 0,
            Command::ReadId => 1,
            Command::FormatTrack => 5,
            Command::Seek => 2,
            Command::Invalid => 0,
        }
    }

    /// ライトプロテクトを確認するコマンド
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Command::WriteData | Command::WriteDeletedData | Command::FormatTrack
        )
    }

    fn name(self) -> &'static str {
        match self {
            Command::Specify => "SPECIFY",
            Command::SenseDriveStatus => "SENSE DRIVE STATUS",
            Command::WriteData => "WRITE DATA",
            Command::ReadData => "READ DATA",
            Command::Recalibrate => "RECALIBRATE",
            Command::SenseInterruptStatus => "SENSE INTERRUPT STATUS",
            Command::WriteDeletedData => "WRITE DELETED DATA",
            Command::ReadId => "READ ID",
            Command::ReadDeletedData => "READ DELETED DATA",
            Command::FormatTrack => "FORMAT TRACK",
            Command::Seek => "SEEK",
            Command::Invalid => "INVALID",
        }
    }
}

/// ドライブごとの状態（セーブ対象）
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DriveState {
    /// 現在のシリンダ
    pub pcn: u8,
    /// 次にヘッドの下を通るセクタ（トラック内の添字）
    pub cursor: usize,
    /// 実行時のライトプロテクト
    pub protected: bool,
    pub bank: Option<usize>,
}

/// コントローラ状態
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FdcState {
    pub phase: Phase,
    pub command: Option<Command>,
    pub command_byte: u8,
    pub params: Vec<u8>,
    pub result: Vec<u8>,
    pub result_pos: usize,
    /// 実行フェーズの転送バッファ
    pub buffer: Vec<u8>,
    pub buffer_pos: usize,
    pub data_ready: bool,
    /// EOTを読み終えてTC待ち
    pub awaiting_tc: bool,
    /// 遅延中のリザルト（正確なタイミングモード）
    pub pending_result: Vec<u8>,
    pub unit: usize,
    pub head: u8,
    pub id: SectorId,
    pub eot: u8,
    pub dtl: u8,
    pub fill: u8,
    pub sector_index: usize,
    pub srt: u8,
    pub hut: u8,
    pub hlt: u8,
    pub non_dma: bool,
    /// 最後に計算したCRC
    pub crc: u16,
    pub data_crc_error: bool,
    pub stop_after_sector: bool,
    pub seek_status: [Option<u8>; UNITS],
    pub seek_target: [u8; UNITS],
    /// シーク中のドライブ（MSR下位4ビット）
    pub busy: u8,
    pub motor: u8,
    pub phase_event: Option<EventHandle>,
    pub seek_event: [Option<EventHandle>; UNITS],
    pub drives: [DriveState; UNITS],
}

/// 物理ドライブ
#[derive(Debug, Default)]
pub struct Drive {
    pub disk: Option<DiskImage>,
    pub correct_timing: bool,
    pub ignore_crc: bool,
}

/// デバイスハンドラに渡す実行コンテキスト
pub struct FdcContext<'a> {
    pub sched: &'a mut Scheduler,
    pub irq: &'a mut InterruptController,
    /// スケジューラのクロックから先行しているCPUサイクル
    pub elapsed: u64,
}

impl<'a> FdcContext<'a> {
    pub fn new(sched: &'a mut Scheduler, irq: &'a mut InterruptController, elapsed: u64) -> Self {
        FdcContext { sched, irq, elapsed }
    }

    /// 現在時刻
    pub fn now(&self) -> u64 {
        self.sched.clock() + self.elapsed
    }

    fn schedule(&mut self, tag: EventTag, delay: u64) -> EventHandle {
        self.sched.register(DeviceId::Fdc, tag, delay + self.elapsed, 0)
    }
}

/// 見つかったセクタ
struct Located {
    index: usize,
    count: usize,
    data: Vec<u8>,
    deleted: bool,
    data_crc_error: bool,
}

/// 現在時刻から、トラックの `index` 番目（全 `count` 個）のセクタがヘッドに来るまで
fn rotation_latency(now: u64, index: usize, count: usize) -> u64 {
    let target = ROTATION_CYCLES * index as u64 / count.max(1) as u64;
    let pos = now % ROTATION_CYCLES;
    (target + ROTATION_CYCLES - pos) % ROTATION_CYCLES
}

/// uPD765A
#[derive(Debug, Default)]
pub struct Fdc {
    st: FdcState,
    drives: [Drive; UNITS],
    /// アクセスのあったドライブ（ビット）
    accessed: u8,
}

impl Fdc {
    pub fn new() -> Self {
        Self::default()
    }

    // ============================================================
    // ドライブ/メディア
    // ============================================================

    /// ディスクを挿入。ライトプロテクトはイメージのヘッダから初期化する
    pub fn insert(&mut self, unit: usize, image: DiskImage) -> bool {
        if unit >= MAX_DRIVES {
            return false;
        }
        let state = &mut self.st.drives[unit];
        state.protected = image.floppy.header_protected;
        state.cursor = 0;
        state.bank = Some(image.current_bank());
        self.drives[unit].disk = Some(image);
        true
    }

    /// ディスクを取り出す
    pub fn eject(&mut self, unit: usize) -> Option<DiskImage> {
        let image = self.drives.get_mut(unit)?.disk.take();
        if image.is_some() {
            self.st.drives[unit].bank = None;
        }
        image
    }

    pub fn disk(&self, unit: usize) -> Option<&DiskImage> {
        self.drives.get(unit)?.disk.as_ref()
    }

    pub fn disk_mut(&mut self, unit: usize) -> Option<&mut DiskImage> {
        self.drives.get_mut(unit)?.disk.as_mut()
    }

    pub fn is_inserted(&self, unit: usize) -> bool {
        self.disk(unit).is_some()
    }

    pub fn is_protected(&self, unit: usize) -> bool {
        self.st.drives.get(unit).is_some_and(|d| d.protected)
    }

    pub fn set_protected(&mut self, unit: usize, protected: bool) {
        if let Some(state) = self.st.drives.get_mut(unit) {
            state.protected = protected;
        }
    }

    /// ドライブごとのタイミング/CRC設定
    pub fn set_drive_options(&mut self, unit: usize, correct_timing: bool, ignore_crc: bool) {
        if let Some(drive) = self.drives.get_mut(unit) {
            drive.correct_timing = correct_timing;
            drive.ignore_crc = ignore_crc;
        }
    }

    /// アクセスのあったドライブのビットマスクを返してクリア
    pub fn take_accessed(&mut self) -> u8 {
        std::mem::take(&mut self.accessed)
    }

    pub fn phase(&self) -> Phase {
        self.st.phase
    }

    pub fn pcn(&self, unit: usize) -> u8 {
        self.st.drives.get(unit).map_or(0, |d| d.pcn)
    }

    pub fn motor(&self) -> MotorControl {
        MotorControl::from_bits_truncate(self.st.motor)
    }

    /// ポート$F8書き込み
    pub fn write_motor(&mut self, value: u8) {
        self.st.motor = value & MotorControl::all().bits();
    }

    fn drive_ready(&self, unit: usize) -> bool {
        self.drives.get(unit).is_some_and(|d| d.disk.is_some())
    }

    fn timing(&self, unit: usize) -> bool {
        self.drives.get(unit).is_some_and(|d| d.correct_timing)
    }

    fn current_command(&self) -> Command {
        self.st.command.unwrap_or(Command::Invalid)
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.st.phase != phase {
            log_phase(self.st.phase.name(), phase.name());
            self.st.phase = phase;
        }
    }

    // ============================================================
    // ポート
    // ============================================================

    /// ポート$FA: メインステータスレジスタ
    pub fn read_status(&self) -> u8 {
        let mut value = self.st.busy & 0x0F;
        match self.st.phase {
            Phase::Idle => value |= msr::RQM,
            Phase::Command => value |= msr::RQM | msr::CB,
            Phase::Execution => {
                value |= msr::CB | msr::EXM;
                if self.st.data_ready {
                    value |= msr::RQM;
                    if !self.current_command().is_write() {
                        value |= msr::DIO;
                    }
                }
            }
            Phase::Result => value |= msr::RQM | msr::DIO | msr::CB,
        }
        value
    }

    /// ポート$FB読み出し
    pub fn read_data(&mut self, ctx: &mut FdcContext) -> u8 {
        match self.st.phase {
            Phase::Execution if self.st.data_ready && !self.current_command().is_write() => {
                let value = self.st.buffer.get(self.st.buffer_pos).copied().unwrap_or(0xFF);
                self.st.buffer_pos += 1;
                if self.st.buffer_pos >= self.st.buffer.len() {
                    self.sector_done(ctx);
                }
                value
            }
            Phase::Result => {
                if self.st.result_pos == 0 {
                    self.lower_interrupt(ctx);
                }
                let value = self.st.result.get(self.st.result_pos).copied().unwrap_or(0xFF);
                self.st.result_pos += 1;
                if self.st.result_pos >= self.st.result.len() {
                    self.st.result.clear();
                    self.st.result_pos = 0;
                    self.set_phase(Phase::Idle);
                }
                value
            }
            _ => 0xFF,
        }
    }

    /// ポート$FB書き込み
    pub fn write_data(&mut self, ctx: &mut FdcContext, value: u8) {
        match self.st.phase {
            Phase::Idle => {
                let command = Command::decode(value);
                self.st.command = Some(command);
                self.st.command_byte = value;
                self.st.params.clear();
                self.set_phase(Phase::Command);
                if command.param_count() == 0 {
                    self.execute(ctx);
                }
            }
            Phase::Command => {
                self.st.params.push(value);
                if self.st.params.len() >= self.current_command().param_count() {
                    self.execute(ctx);
                }
            }
            Phase::Execution if self.st.data_ready && self.current_command().is_write() => {
                if let Some(slot) = self.st.buffer.get_mut(self.st.buffer_pos) {
                    *slot = value;
                }
                self.st.buffer_pos += 1;
                if self.st.buffer_pos >= self.st.buffer.len() {
                    self.write_done(ctx);
                }
            }
            phase => log::trace!("FDC: data {:02X} ignored in {:?}", value, phase),
        }
    }

    /// ポート$F8読み出し: ターミナルカウント
    pub fn terminal_count(&mut self, ctx: &mut FdcContext) {
        if self.st.phase != Phase::Execution || !self.st.pending_result.is_empty() {
            return;
        }
        let command = self.current_command();
        match command {
            Command::ReadData | Command::ReadDeletedData | Command::WriteData | Command::WriteDeletedData => {
                let in_sector = self.st.data_ready && self.st.buffer_pos > 0;
                if in_sector && command.is_write() {
                    self.commit_write();
                }
                let id = if self.st.awaiting_tc || in_sector {
                    self.next_id()
                } else {
                    self.st.id
                };
                let result = self.transfer_result(0, 0, 0, id);
                self.enter_result(ctx, result, true);
            }
            Command::FormatTrack if self.st.data_ready => self.format_done(ctx),
            _ => {}
        }
    }

    // ============================================================
    // コマンド実行
    // ============================================================

    fn execute(&mut self, ctx: &mut FdcContext) {
        let command = self.current_command();
        let p = self.st.params.clone();
        log_command(command.name(), &p);
        match command {
            Command::Specify => {
                self.st.srt = p[0] >> 4;
                self.st.hut = p[0] & 0x0F;
                self.st.hlt = p[1] >> 1;
                self.st.non_dma = p[1] & 0x01 != 0;
                self.set_phase(Phase::Idle);
            }
            Command::SenseDriveStatus => {
                let status = self.drive_status((p[0] & 3) as usize, (p[0] >> 2) & 1);
                self.enter_result(ctx, vec![status], false);
            }
            Command::Recalibrate => self.start_seek(ctx, (p[0] & 3) as usize, 0),
            Command::Seek => self.start_seek(ctx, (p[0] & 3) as usize, p[1]),
            Command::SenseInterruptStatus => self.sense_interrupt(ctx),
            Command::ReadData | Command::ReadDeletedData | Command::WriteData | Command::WriteDeletedData => {
                self.start_transfer(ctx, &p)
            }
            Command::ReadId => self.start_read_id(ctx, p[0]),
            Command::FormatTrack => self.start_format(ctx, &p),
            Command::Invalid => self.enter_result(ctx, vec![st0::INVALID], false),
        }
    }

    fn drive_status(&self, unit: usize, head: u8) -> u8 {
        let mut status = unit as u8 | (head << 2) | st3::TWO_SIDE;
        if self.st.drives[unit].pcn == 0 {
            status |= st3::TRACK0;
        }
        if self.drive_ready(unit) {
            status |= st3::READY;
            if self.st.drives[unit].protected {
                status |= st3::WRITE_PROTECT;
            }
        }
        status
    }

    fn step_cycles(&self) -> u64 {
        (16 - self.st.srt.min(15)) as u64 * CYCLES_PER_MS
    }

    fn start_seek(&mut self, ctx: &mut FdcContext, unit: usize, target: u8) {
        self.set_phase(Phase::Idle);
        let from = self.st.drives[unit].pcn;
        log_seek(unit, from, target);
        if let Some(handle) = self.st.seek_event[unit].take() {
            ctx.sched.cancel(handle);
        }
        self.st.seek_target[unit] = target;
        self.st.busy |= 1 << unit;
        if self.timing(unit) {
            let steps = from.abs_diff(target).max(1) as u64;
            let delay = steps * self.step_cycles();
            log_latency("seek", delay);
            self.st.seek_event[unit] = Some(ctx.schedule(EventTag::FdcSeekEnd(unit as u8), delay));
        } else {
            self.complete_seek(ctx, unit);
        }
    }

    fn complete_seek(&mut self, ctx: &mut FdcContext, unit: usize) {
        self.st.busy &= !(1 << unit);
        self.st.seek_event[unit] = None;
        let state = &mut self.st.drives[unit];
        state.pcn = self.st.seek_target[unit];
        state.cursor = 0;
        let mut status = st0::SEEK_END | unit as u8;
        if !self.drive_ready(unit) {
            status |= st0::ABNORMAL | st0::NOT_READY;
        }
        self.st.seek_status[unit] = Some(status);
        ctx.irq.raise(IrqLine::FdInt1);
    }

    fn sense_interrupt(&mut self, ctx: &mut FdcContext) {
        let found = (0..UNITS).find_map(|u| self.st.seek_status[u].map(|s| (u, s)));
        match found {
            Some((unit, status)) => {
                self.st.seek_status[unit] = None;
                let pcn = self.st.drives[unit].pcn;
                self.enter_result(ctx, vec![status, pcn], false);
                self.lower_interrupt(ctx);
            }
            None => self.enter_result(ctx, vec![st0::INVALID], false),
        }
    }

    /// 割り込みを下げる。報告待ちのシークがあれば立て直す
    fn lower_interrupt(&mut self, ctx: &mut FdcContext) {
        ctx.irq.lower(IrqLine::FdInt1);
        if self.st.seek_status.iter().any(Option::is_some) {
            ctx.irq.raise(IrqLine::FdInt1);
        }
    }

    fn enter_result(&mut self, ctx: &mut FdcContext, result: Vec<u8>, interrupt: bool) {
        if let Some(handle) = self.st.phase_event.take() {
            ctx.sched.cancel(handle);
        }
        log_result(&result);
        self.st.result = result;
        self.st.result_pos = 0;
        self.st.pending_result.clear();
        self.st.data_ready = false;
        self.st.awaiting_tc = false;
        self.st.buffer.clear();
        self.st.buffer_pos = 0;
        self.set_phase(Phase::Result);
        if interrupt {
            ctx.irq.raise(IrqLine::FdInt1);
        }
    }

    /// リザルトへ移る。正確なタイミングモードでは `delay` 後のイベントで移る
    fn finish(&mut self, ctx: &mut FdcContext, result: Vec<u8>, delay: u64) {
        if self.timing(self.st.unit) && delay > 0 {
            log_latency("result", delay);
            self.st.data_ready = false;
            self.st.pending_result = result;
            self.st.phase_event = Some(ctx.schedule(EventTag::FdcResult, delay));
        } else {
            self.enter_result(ctx, result, true);
        }
    }

    fn transfer_result(&self, status0: u8, status1: u8, status2: u8, id: SectorId) -> Vec<u8> {
        let status0 = status0 | (self.st.head << 2) | self.st.unit as u8;
        vec![status0, status1, status2, id.c, id.h, id.r, id.n]
    }

    /// 転送終了時に報告するID
    fn next_id(&self) -> SectorId {
        let mut id = self.st.id;
        if id.r == self.st.eot {
            let multi_track = self.st.command_byte & CMD_MT != 0;
            id.r = 1;
            if multi_track {
                id.h ^= 1;
            }
            if !multi_track || self.st.head == 1 {
                id.c = id.c.wrapping_add(1);
            }
        } else {
            id.r = id.r.wrapping_add(1);
        }
        id
    }

    fn start_transfer(&mut self, ctx: &mut FdcContext, p: &[u8]) {
        self.st.unit = (p[0] & 3) as usize;
        self.st.head = (p[0] >> 2) & 1;
        self.st.id = SectorId {
            c: p[1],
            h: p[2],
            r: p[3],
            n: p[4],
        };
        self.st.eot = p[5];
        self.st.dtl = p[7];
        self.st.data_crc_error = false;
        self.st.stop_after_sector = false;
        self.st.awaiting_tc = false;
        self.st.pending_result.clear();
        self.set_phase(Phase::Execution);

        let unit = self.st.unit;
        if !self.drive_ready(unit) {
            let result = self.transfer_result(st0::ABNORMAL | st0::NOT_READY, 0, 0, self.st.id);
            return self.enter_result(ctx, result, true);
        }
        if self.current_command().is_write() && self.st.drives[unit].protected {
            log_write_protected(unit);
            let result = self.transfer_result(st0::ABNORMAL, st1::NOT_WRITABLE, 0, self.st.id);
            return self.enter_result(ctx, result, true);
        }
        self.accessed |= 1 << unit;
        self.locate_sector(ctx);
    }

    /// 現在のIDのセクタを探し、転送を準備する
    fn locate_sector(&mut self, ctx: &mut FdcContext) {
        let unit = self.st.unit;
        let id = self.st.id;
        log_sector(unit, id.c, id.h, id.r, id.n);
        let located = match self.search_sector(unit) {
            Ok(located) => located,
            Err((status1, status2)) => {
                let result = self.transfer_result(st0::ABNORMAL, status1, status2, id);
                return self.finish(ctx, result, MISSING_SECTOR_ROTATIONS * ROTATION_CYCLES);
            }
        };

        let command = self.current_command();
        self.st.sector_index = located.index;
        self.st.drives[unit].cursor = (located.index + 1) % located.count;

        if !command.is_write() {
            let want_deleted = command == Command::ReadDeletedData;
            if located.deleted != want_deleted {
                if self.st.command_byte & CMD_SK != 0 {
                    return self.next_sector(ctx);
                }
                self.st.stop_after_sector = true;
            }
            self.st.data_crc_error = located.data_crc_error;
            self.st.buffer = located.data;
        } else {
            self.st.buffer = vec![0; located.data.len()];
        }
        self.st.buffer_pos = 0;
        self.arm_data(ctx, located.index, located.count);
    }

    fn search_sector(&mut self, unit: usize) -> Result<Located, (u8, u8)> {
        let mfm = self.st.command_byte & CMD_MF != 0;
        let ignore_crc = self.drives[unit].ignore_crc;
        let state = self.st.drives[unit];
        let want = self.st.id;
        let track = self.drives[unit]
            .disk
            .as_ref()
            .and_then(|d| d.floppy.track(state.pcn, self.st.head))
            .ok_or((st1::MISSING_ADDRESS_MARK, 0))?;

        let count = track.len();
        if !track.iter().any(|s| s.has_address_mark() && s.mfm == mfm) {
            return Err((st1::MISSING_ADDRESS_MARK, 0));
        }

        let mut status2 = 0;
        for k in 0..count {
            let index = (state.cursor + k) % count;
            let sector = &track[index];
            if !sector.has_address_mark() || sector.mfm != mfm {
                continue;
            }
            let crc = d88::id_crc(sector.id, mfm);
            self.st.crc = crc;
            if crc != sector.stored_id_crc {
                log_crc_mismatch("ID", sector.stored_id_crc, crc, ignore_crc);
                if !ignore_crc {
                    if sector.id == want {
                        return Err((st1::DATA_ERROR, 0));
                    }
                    continue;
                }
            }
            if sector.id != want {
                if sector.id.r == want.r && sector.id.c != want.c {
                    status2 |= st2::WRONG_CYLINDER;
                    if sector.id.c == 0xFF {
                        status2 |= st2::BAD_CYLINDER;
                    }
                }
                continue;
            }
            if !sector.has_data_mark() {
                return Err((st1::MISSING_ADDRESS_MARK, st2::MISSING_DATA_MARK));
            }

            let nominal = if want.n == 0 {
                self.st.dtl as usize
            } else {
                128usize << want.n.min(7)
            };
            let len = sector.data.len().min(nominal);
            let crc = d88::data_crc(&sector.data, sector.deleted, mfm);
            self.st.crc = crc;
            let mismatch = crc != sector.stored_data_crc;
            if mismatch {
                log_crc_mismatch("DATA", sector.stored_data_crc, crc, ignore_crc);
            }
            return Ok(Located {
                index,
                count,
                data: sector.data[..len].to_vec(),
                deleted: sector.deleted,
                data_crc_error: mismatch && !ignore_crc,
            });
        }
        Err((st1::NO_DATA, status2))
    }

    /// データ転送を開始できる状態にする（正確なタイミングでは回転待ち後）
    fn arm_data(&mut self, ctx: &mut FdcContext, index: usize, count: usize) {
        self.st.data_ready = false;
        if self.timing(self.st.unit) {
            let latency = rotation_latency(ctx.now(), index, count);
            log_latency("rotation", latency);
            self.st.phase_event = Some(ctx.schedule(EventTag::FdcDataReady, latency));
        } else {
            self.on_data_ready(ctx);
        }
    }

    fn on_data_ready(&mut self, ctx: &mut FdcContext) {
        self.st.data_ready = true;
        if self.st.buffer.is_empty() {
            if self.current_command().is_write() {
                self.write_done(ctx);
            } else {
                self.sector_done(ctx);
            }
        }
    }

    /// 読み出し側で1セクタ分の転送が終わった
    fn sector_done(&mut self, ctx: &mut FdcContext) {
        self.st.data_ready = false;
        dump_sector(&self.st.buffer);
        if self.st.data_crc_error {
            let status2 = st2::DATA_ERROR_IN_DATA
                | if self.st.stop_after_sector { st2::CONTROL_MARK } else { 0 };
            let result = self.transfer_result(st0::ABNORMAL, st1::DATA_ERROR, status2, self.st.id);
            return self.enter_result(ctx, result, true);
        }
        if self.st.stop_after_sector {
            let result = self.transfer_result(0, 0, st2::CONTROL_MARK, self.next_id());
            return self.enter_result(ctx, result, true);
        }
        self.next_sector(ctx);
    }

    fn next_sector(&mut self, ctx: &mut FdcContext) {
        if self.st.id.r == self.st.eot {
            if self.st.command_byte & CMD_MT != 0 && self.st.head == 0 {
                self.st.head = 1;
                self.st.id.h ^= 1;
                self.st.id.r = 1;
                return self.locate_sector(ctx);
            }
            // TCが来なければ EN で異常終了
            self.st.awaiting_tc = true;
            self.st.data_ready = false;
            self.st.phase_event = Some(ctx.schedule(EventTag::FdcResult, TC_GRACE_CYCLES));
            return;
        }
        self.st.id.r = self.st.id.r.wrapping_add(1);
        self.locate_sector(ctx);
    }

    fn write_done(&mut self, ctx: &mut FdcContext) {
        if self.current_command() == Command::FormatTrack {
            return self.format_done(ctx);
        }
        self.commit_write();
        self.st.data_ready = false;
        self.next_sector(ctx);
    }

    /// 転送バッファを現在のセクタへ書き込む（残りは0で埋まる）
    fn commit_write(&mut self) {
        let unit = self.st.unit;
        let pcn = self.st.drives[unit].pcn;
        let deleted = self.current_command() == Command::WriteDeletedData;
        let Some(disk) = self.drives[unit].disk.as_mut() else {
            return;
        };
        let floppy = &mut disk.floppy;
        if let Some(sector) = floppy
            .track_mut(pcn, self.st.head)
            .and_then(|t| t.get_mut(self.st.sector_index))
        {
            let written = self.st.buffer_pos.min(self.st.buffer.len());
            sector.write_data(&self.st.buffer[..written], deleted);
            self.st.crc = sector.stored_data_crc;
        }
        floppy.modified = true;
    }

    fn start_read_id(&mut self, ctx: &mut FdcContext, p0: u8) {
        self.st.unit = (p0 & 3) as usize;
        self.st.head = (p0 >> 2) & 1;
        self.st.pending_result.clear();
        self.set_phase(Phase::Execution);
        let unit = self.st.unit;
        if !self.drive_ready(unit) {
            let result = self.transfer_result(st0::ABNORMAL | st0::NOT_READY, 0, 0, self.st.id);
            return self.enter_result(ctx, result, true);
        }
        self.accessed |= 1 << unit;

        let mfm = self.st.command_byte & CMD_MF != 0;
        let ignore_crc = self.drives[unit].ignore_crc;
        let state = self.st.drives[unit];
        let found = self.drives[unit]
            .disk
            .as_ref()
            .and_then(|d| d.floppy.track(state.pcn, self.st.head))
            .and_then(|track| {
                let count = track.len();
                (0..count)
                    .map(|k| (state.cursor + k) % count)
                    .find(|&i| track[i].has_address_mark() && track[i].mfm == mfm)
                    .map(|i| (i, count, track[i].id, track[i].stored_id_crc))
            });

        let Some((index, count, id, stored_crc)) = found else {
            let result = self.transfer_result(st0::ABNORMAL, st1::MISSING_ADDRESS_MARK, 0, self.st.id);
            return self.finish(ctx, result, MISSING_SECTOR_ROTATIONS * ROTATION_CYCLES);
        };

        self.st.drives[unit].cursor = (index + 1) % count;
        self.st.id = id;
        let crc = d88::id_crc(id, mfm);
        self.st.crc = crc;
        let result = if crc != stored_crc && !ignore_crc {
            log_crc_mismatch("ID", stored_crc, crc, false);
            self.transfer_result(st0::ABNORMAL, st1::DATA_ERROR, 0, id)
        } else {
            self.transfer_result(0, 0, 0, id)
        };
        let latency = rotation_latency(ctx.now(), index, count);
        self.finish(ctx, result, latency);
    }

    fn start_format(&mut self, ctx: &mut FdcContext, p: &[u8]) {
        self.st.unit = (p[0] & 3) as usize;
        self.st.head = (p[0] >> 2) & 1;
        self.st.id.n = p[1];
        self.st.fill = p[4];
        self.st.pending_result.clear();
        self.set_phase(Phase::Execution);

        let unit = self.st.unit;
        if !self.drive_ready(unit) {
            let result = self.transfer_result(st0::ABNORMAL | st0::NOT_READY, 0, 0, self.st.id);
            return self.enter_result(ctx, result, true);
        }
        if self.st.drives[unit].protected {
            log_write_protected(unit);
            let result = self.transfer_result(st0::ABNORMAL, st1::NOT_WRITABLE, 0, self.st.id);
            return self.enter_result(ctx, result, true);
        }
        self.accessed |= 1 << unit;
        self.st.buffer = vec![0; p[2] as usize * 4];
        self.st.buffer_pos = 0;
        // インデックスホールから書き始める
        self.arm_data(ctx, 0, 1);
    }

    fn format_done(&mut self, ctx: &mut FdcContext) {
        let unit = self.st.unit;
        let pcn = self.st.drives[unit].pcn;
        let mfm = self.st.command_byte & CMD_MF != 0;
        let written = self.st.buffer_pos.min(self.st.buffer.len());
        let ids: Vec<SectorId> = self.st.buffer[..written]
            .chunks_exact(4)
            .map(|b| SectorId {
                c: b[0],
                h: b[1],
                r: b[2],
                n: b[3],
            })
            .collect();
        if let Some(disk) = self.drives[unit].disk.as_mut() {
            disk.floppy.format_track(pcn, self.st.head, &ids, self.st.fill, mfm);
        }
        self.st.drives[unit].cursor = 0;
        self.st.data_ready = false;
        let last = ids.last().copied().unwrap_or(self.st.id);
        let result = self.transfer_result(0, 0, 0, last);
        self.finish(ctx, result, ROTATION_CYCLES);
    }

    // ============================================================
    // イベント/リセット/セーブ
    // ============================================================

    /// スケジューラから配送されたイベント
    pub fn handle_event(&mut self, ctx: &mut FdcContext, tag: EventTag) {
        match tag {
            EventTag::FdcSeekEnd(unit) => {
                let unit = unit as usize;
                if unit < UNITS && self.st.seek_event[unit].is_some() {
                    self.complete_seek(ctx, unit);
                }
            }
            EventTag::FdcDataReady => {
                self.st.phase_event = None;
                if self.st.phase == Phase::Execution {
                    self.on_data_ready(ctx);
                }
            }
            EventTag::FdcResult => {
                self.st.phase_event = None;
                if self.st.phase != Phase::Execution {
                    return;
                }
                if self.st.awaiting_tc {
                    let result = self.transfer_result(st0::ABNORMAL, st1::END_OF_CYLINDER, 0, self.next_id());
                    self.enter_result(ctx, result, true);
                } else {
                    let result = std::mem::take(&mut self.st.pending_result);
                    self.enter_result(ctx, result, true);
                }
            }
            _ => {}
        }
    }

    /// リセット: どのフェーズでも直ちにIdleへ戻る
    ///
    /// ヘッド位置・ライトプロテクト・モーターはコントローラの外にあるので残す。
    pub fn reset(&mut self, ctx: &mut FdcContext) {
        if self.st.phase != Phase::Idle {
            log_abort(self.st.phase.name());
        }
        if let Some(handle) = self.st.phase_event.take() {
            ctx.sched.cancel(handle);
        }
        for handle in self.st.seek_event.iter_mut().filter_map(Option::take) {
            ctx.sched.cancel(handle);
        }
        let drives = self.st.drives;
        let motor = self.st.motor;
        self.st = FdcState {
            drives,
            motor,
            ..FdcState::default()
        };
        ctx.irq.lower(IrqLine::FdInt1);
    }

    pub fn save_state(&self) -> FdcState {
        let mut state = self.st.clone();
        for (unit, drive) in self.drives.iter().enumerate() {
            state.drives[unit].bank = drive.disk.as_ref().map(DiskImage::current_bank);
        }
        state
    }

    /// 状態を復元。挿入中のディスクは保存時のバンクへ切り替える
    pub fn load_state(&mut self, state: &FdcState) {
        self.st = state.clone();
        for (unit, drive) in self.drives.iter_mut().enumerate() {
            let (Some(disk), Some(bank)) = (drive.disk.as_mut(), state.drives[unit].bank) else {
                continue;
            };
            if disk.current_bank() != bank {
                if let Err(e) = disk.select_bank(bank) {
                    log::warn!("FDC: drive {} bank {} not restored: {}", unit + 1, bank, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::d88::tests::make_bank;
    use crate::d88::{status, Floppy, MediaType, MAX_D88_BANKS};

    struct Rig {
        fdc: Fdc,
        sched: Scheduler,
        irq: InterruptController,
    }

    impl Rig {
        fn new(payload: &[u8], timing: bool) -> Self {
            let mut fdc = Fdc::new();
            let image = DiskImage::from_bytes("test.d88", payload, 0, MAX_D88_BANKS).unwrap();
            assert!(fdc.insert(0, image));
            fdc.set_drive_options(0, timing, false);
            Rig {
                fdc,
                sched: Scheduler::new(),
                irq: InterruptController::new(),
            }
        }

        fn send(&mut self, bytes: &[u8]) {
            for &b in bytes {
                let mut ctx = FdcContext::new(&mut self.sched, &mut self.irq, 0);
                self.fdc.write_data(&mut ctx, b);
            }
        }

        fn read(&mut self) -> u8 {
            let mut ctx = FdcContext::new(&mut self.sched, &mut self.irq, 0);
            self.fdc.read_data(&mut ctx)
        }

        fn read_n(&mut self, n: usize) -> Vec<u8> {
            (0..n).map(|_| self.read()).collect()
        }

        fn tc(&mut self) {
            let mut ctx = FdcContext::new(&mut self.sched, &mut self.irq, 0);
            self.fdc.terminal_count(&mut ctx);
        }

        fn run_until(&mut self, target: u64) {
            while let Some(event) = self.sched.pop_due(target) {
                let mut ctx = FdcContext::new(&mut self.sched, &mut self.irq, 0);
                self.fdc.handle_event(&mut ctx, event.tag);
            }
            self.sched.settle(target);
        }
    }

    fn id(c: u8, h: u8, r: u8, n: u8) -> SectorId {
        SectorId { c, h, r, n }
    }

    fn two_sector_disk() -> Vec<u8> {
        make_bank(
            "TEST",
            &[
                (id(0, 0, 1, 1), vec![0x11; 256]),
                (id(0, 0, 2, 1), (0..=255).collect()),
            ],
            None,
        )
    }

    /// READ DATA (MFM) C=0 H=0 R=r N=1 EOT=eot
    fn read_cmd(r: u8, eot: u8) -> [u8; 9] {
        [0x46, 0x00, 0, 0, r, 1, eot, 0x1B, 0xFF]
    }

    fn write_cmd(r: u8, eot: u8) -> [u8; 9] {
        [0x45, 0x00, 0, 0, r, 1, eot, 0x1B, 0xFF]
    }

    #[test]
    fn test_instant_read_completes_synchronously() {
        let mut rig = Rig::new(&two_sector_disk(), false);
        rig.send(&read_cmd(2, 2));
        assert_eq!(rig.fdc.phase(), Phase::Execution);
        assert_eq!(rig.fdc.read_status(), msr::RQM | msr::DIO | msr::EXM | msr::CB);
        assert!(rig.sched.is_empty());

        let data = rig.read_n(256);
        assert_eq!(data, (0..=255).collect::<Vec<u8>>());
        rig.tc();
        assert!(rig.sched.is_empty());
        assert_eq!(rig.fdc.phase(), Phase::Result);
        assert!(rig.irq.is_raised(IrqLine::FdInt1));

        let result = rig.read_n(7);
        assert_eq!(result, vec![0x00, 0x00, 0x00, 1, 0, 1, 1]);
        assert_eq!(rig.fdc.phase(), Phase::Idle);
        assert!(!rig.irq.is_raised(IrqLine::FdInt1));
        assert_eq!(rig.fdc.take_accessed(), 0x01);
        assert_eq!(rig.fdc.take_accessed(), 0x00);
    }

    #[test]
    fn test_timing_mode_same_bytes_after_latency() {
        let mut instant = Rig::new(&two_sector_disk(), false);
        instant.send(&read_cmd(1, 2));
        let expected = instant.read_n(512);

        let mut timed = Rig::new(&two_sector_disk(), true);
        timed.sched.settle(12345);
        timed.send(&read_cmd(1, 2));
        assert_eq!(timed.fdc.phase(), Phase::Execution);
        assert_eq!(timed.fdc.read_status() & msr::RQM, 0);
        assert!(!timed.sched.is_empty());

        let mut data = Vec::new();
        for _ in 0..2 {
            timed.run_until(timed.sched.clock() + ROTATION_CYCLES);
            assert_ne!(timed.fdc.read_status() & msr::RQM, 0);
            data.extend(timed.read_n(256));
        }
        assert_eq!(data, expected);

        timed.tc();
        instant.tc();
        assert_eq!(timed.read_n(7), instant.read_n(7));
    }

    #[test]
    fn test_end_of_cylinder_without_tc() {
        let mut rig = Rig::new(&two_sector_disk(), false);
        rig.send(&read_cmd(1, 1));
        rig.read_n(256);
        assert_eq!(rig.fdc.phase(), Phase::Execution);
        assert_eq!(rig.fdc.read_status() & msr::RQM, 0);
        rig.run_until(TC_GRACE_CYCLES);
        assert_eq!(rig.fdc.phase(), Phase::Result);
        let result = rig.read_n(7);
        assert_eq!(result[0] & 0xC0, st0::ABNORMAL);
        assert_eq!(result[1], st1::END_OF_CYLINDER);
    }

    #[test]
    fn test_write_protect_rejects_write_commands() {
        let mut rig = Rig::new(&two_sector_disk(), false);
        rig.fdc.set_protected(0, true);
        rig.send(&write_cmd(1, 1));
        assert_eq!(rig.fdc.phase(), Phase::Result);
        let result = rig.read_n(7);
        assert_eq!(result[0] & 0xC0, st0::ABNORMAL);
        assert_eq!(result[1], st1::NOT_WRITABLE);

        rig.send(&[0x4D, 0x00, 1, 16, 0x1B, 0xE5]);
        let result = rig.read_n(7);
        assert_eq!(result[1], st1::NOT_WRITABLE);
        assert!(!rig.fdc.disk(0).unwrap().is_dirty());
    }

    #[test]
    fn test_write_then_read_back() {
        let mut rig = Rig::new(&two_sector_disk(), false);
        rig.send(&write_cmd(1, 1));
        assert_eq!(rig.fdc.read_status(), msr::RQM | msr::EXM | msr::CB);
        assert!(rig.sched.is_empty());
        rig.send(&[0x77; 256]);
        rig.tc();
        assert!(rig.sched.is_empty());
        assert_eq!(rig.read_n(7)[0] & 0xC0, 0);
        assert!(rig.fdc.disk(0).unwrap().is_dirty());

        rig.send(&read_cmd(1, 1));
        assert!(rig.read_n(256).iter().all(|&b| b == 0x77));
    }

    #[test]
    fn test_tc_mid_sector_zero_fills_rest() {
        let mut rig = Rig::new(&two_sector_disk(), false);
        rig.send(&write_cmd(1, 1));
        rig.send(&[0x77; 16]);
        rig.tc();
        assert_eq!(rig.read_n(7)[0] & 0xC0, 0);

        let sector = &rig.fdc.disk(0).unwrap().floppy.track(0, 0).unwrap()[0];
        assert!(sector.data[..16].iter().all(|&b| b == 0x77));
        assert!(sector.data[16..].iter().all(|&b| b == 0));
        assert_eq!(sector.data.len(), 256);
    }

    #[test]
    fn test_instant_mode_registers_no_events() {
        let mut rig = Rig::new(&two_sector_disk(), false);
        rig.send(&[0x0F, 0x00, 5]);
        assert!(rig.sched.is_empty());
        rig.send(&[0x08]);
        rig.read_n(2);

        rig.send(&[0x07, 0x00]);
        assert!(rig.sched.is_empty());
        assert_eq!(rig.fdc.pcn(0), 0);
        rig.send(&[0x08]);
        rig.read_n(2);

        for cmd in [read_cmd(1, 2), write_cmd(1, 2)] {
            rig.send(&cmd);
            assert_eq!(rig.fdc.phase(), Phase::Execution);
            assert!(rig.sched.is_empty());
            rig.tc();
            rig.read_n(7);
            assert_eq!(rig.fdc.phase(), Phase::Idle);
        }
    }

    #[test]
    fn test_data_crc_error_and_tolerance() {
        let mut payload = two_sector_disk();
        let offset = u32::from_le_bytes(payload[0x20..0x24].try_into().unwrap()) as usize;
        payload[offset + 8] = status::DATA_CRC_ERROR;

        let mut strict = Rig::new(&payload, false);
        strict.send(&read_cmd(1, 1));
        strict.read_n(256);
        let result = strict.read_n(7);
        assert_eq!(result[0] & 0xC0, st0::ABNORMAL);
        assert_eq!(result[1], st1::DATA_ERROR);
        assert_eq!(result[2], st2::DATA_ERROR_IN_DATA);

        let mut lenient = Rig::new(&payload, false);
        lenient.fdc.set_drive_options(0, false, true);
        lenient.send(&read_cmd(1, 1));
        assert!(lenient.read_n(256).iter().all(|&b| b == 0x11));
        lenient.tc();
        assert_eq!(lenient.read_n(7)[0] & 0xC0, 0);
    }

    #[test]
    fn test_missing_sector_and_density_mismatch() {
        let mut rig = Rig::new(&two_sector_disk(), false);
        rig.send(&read_cmd(9, 9));
        let result = rig.read_n(7);
        assert_eq!(result[1], st1::NO_DATA);

        // FM指定ではMFMのセクタは見えない
        rig.send(&[0x06, 0x00, 0, 0, 1, 1, 1, 0x1B, 0xFF]);
        let result = rig.read_n(7);
        assert_eq!(result[1], st1::MISSING_ADDRESS_MARK);
    }

    #[test]
    fn test_missing_sector_waits_in_timing_mode() {
        let mut rig = Rig::new(&two_sector_disk(), true);
        rig.send(&read_cmd(9, 9));
        assert_eq!(rig.fdc.phase(), Phase::Execution);
        rig.run_until(ROTATION_CYCLES);
        assert_eq!(rig.fdc.phase(), Phase::Execution);
        rig.run_until(2 * ROTATION_CYCLES);
        assert_eq!(rig.fdc.phase(), Phase::Result);
        assert_eq!(rig.read_n(7)[1], st1::NO_DATA);
    }

    #[test]
    fn test_not_ready_drive() {
        let mut rig = Rig::new(&two_sector_disk(), false);
        rig.send(&[0x46, 0x01, 0, 0, 1, 1, 1, 0x1B, 0xFF]);
        let result = rig.read_n(7);
        assert_eq!(result[0], st0::ABNORMAL | st0::NOT_READY | 0x01);
    }

    #[test]
    fn test_seek_and_sense_interrupt() {
        let mut rig = Rig::new(&two_sector_disk(), false);
        rig.send(&[0x0F, 0x00, 5]);
        assert_eq!(rig.fdc.phase(), Phase::Idle);
        assert!(rig.irq.is_raised(IrqLine::FdInt1));
        assert_eq!(rig.fdc.pcn(0), 5);

        rig.send(&[0x08]);
        assert_eq!(rig.read_n(2), vec![st0::SEEK_END, 5]);
        assert!(!rig.irq.is_raised(IrqLine::FdInt1));

        // 報告すべきシークがなければ無効コマンド扱い
        rig.send(&[0x08]);
        assert_eq!(rig.read_n(1), vec![st0::INVALID]);
    }

    #[test]
    fn test_timed_seek_sets_busy_until_event() {
        let mut rig = Rig::new(&two_sector_disk(), true);
        rig.send(&[0x03, 0xA0, 0x03]);
        rig.send(&[0x0F, 0x00, 3]);
        assert_eq!(rig.fdc.read_status() & 0x01, 0x01);
        assert!(!rig.irq.is_raised(IrqLine::FdInt1));

        // SRT=0x0A → 6ms/ステップ
        rig.run_until(3 * 6 * CYCLES_PER_MS);
        assert_eq!(rig.fdc.read_status() & 0x0F, 0);
        assert!(rig.irq.is_raised(IrqLine::FdInt1));
        rig.send(&[0x07, 0x00]);
        rig.run_until(rig.sched.clock() + 3 * 6 * CYCLES_PER_MS);
        rig.send(&[0x08]);
        assert_eq!(rig.read_n(2), vec![st0::SEEK_END, 0]);
    }

    #[test]
    fn test_reset_aborts_execution() {
        let mut rig = Rig::new(&two_sector_disk(), true);
        rig.send(&read_cmd(1, 2));
        assert_eq!(rig.fdc.phase(), Phase::Execution);
        let mut ctx = FdcContext::new(&mut rig.sched, &mut rig.irq, 0);
        rig.fdc.reset(&mut ctx);
        assert_eq!(rig.fdc.phase(), Phase::Idle);
        assert!(rig.sched.is_empty());
        assert_eq!(rig.fdc.read_status(), msr::RQM);
    }

    #[test]
    fn test_sense_drive_status_and_invalid() {
        let mut rig = Rig::new(&two_sector_disk(), false);
        rig.send(&[0x04, 0x00]);
        assert_eq!(rig.read_n(1), vec![st3::READY | st3::TRACK0 | st3::TWO_SIDE]);
        rig.fdc.set_protected(0, true);
        rig.send(&[0x04, 0x00]);
        assert_ne!(rig.read_n(1)[0] & st3::WRITE_PROTECT, 0);
        rig.send(&[0x1F]);
        assert_eq!(rig.read_n(1), vec![st0::INVALID]);
    }

    #[test]
    fn test_read_id_walks_track() {
        let mut rig = Rig::new(&two_sector_disk(), false);
        rig.send(&[0x4A, 0x00]);
        assert_eq!(rig.read_n(7), vec![0, 0, 0, 0, 0, 1, 1]);
        rig.send(&[0x4A, 0x00]);
        assert_eq!(rig.read_n(7), vec![0, 0, 0, 0, 0, 2, 1]);
    }

    #[test]
    fn test_format_blank_track() {
        let blank = Floppy::blank("FMT", MediaType::Disk2D).serialize();
        let mut rig = Rig::new(&blank, false);
        rig.send(&[0x4D, 0x00, 1, 2, 0x1B, 0xE5]);
        assert_eq!(rig.fdc.phase(), Phase::Execution);
        rig.send(&[0, 0, 1, 1, 0, 0, 2, 1]);
        assert_eq!(rig.read_n(7)[0] & 0xC0, 0);

        rig.send(&read_cmd(2, 2));
        assert!(rig.read_n(256).iter().all(|&b| b == 0xE5));
    }

    #[test]
    fn test_deleted_mark_sets_control_mark() {
        let mut payload = two_sector_disk();
        let offset = u32::from_le_bytes(payload[0x20..0x24].try_into().unwrap()) as usize;
        payload[offset + 7] = 0x10;
        let mut rig = Rig::new(&payload, false);
        rig.fdc.set_drive_options(0, false, true);
        rig.send(&read_cmd(1, 2));
        rig.read_n(256);
        let result = rig.read_n(7);
        assert_eq!(result[2], st2::CONTROL_MARK);
        assert_eq!(result[5], 2);
    }

    #[test]
    fn test_state_round_trip_keeps_phase() {
        let mut rig = Rig::new(&two_sector_disk(), false);
        rig.send(&read_cmd(1, 1));
        rig.read_n(10);
        let state = rig.fdc.save_state();
        let json = serde_json::to_string(&state).unwrap();
        let restored: FdcState = serde_json::from_str(&json).unwrap();

        let mut other = Rig::new(&two_sector_disk(), false);
        other.fdc.load_state(&restored);
        assert_eq!(other.fdc.phase(), Phase::Execution);
        assert_eq!(other.read_n(246), rig.read_n(246));
    }
}
