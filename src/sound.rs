//! ビープ音 / SING エミュレーション (1bit Speaker)
//!
//! ポート$40 の BEEP ビットで 2400Hz の発振器がゲートされ、
//! SING ビットはスピーカーを直接駆動する。
//! 出力レベルの変化点を仮想クロックで記録しておき、ホストの要求時にサンプル化する。

use std::collections::VecDeque;

/// デフォルトのサンプルレート (Hz)
pub const SAMPLE_RATE: u32 = 44100;

/// ビープ発振周波数 (Hz)
pub const BEEP_FREQUENCY: u64 = 2400;

/// 変化点キューの上限
const MAX_CHANGES: usize = 8192;

/// 1-pole IIR ローパスフィルタ
struct LowPass {
    alpha: f32,
    z: f32,
}

impl LowPass {
    fn new(cutoff_hz: f32, sample_rate: f32) -> Self {
        let rc = 1.0 / (2.0 * std::f32::consts::PI * cutoff_hz);
        let dt = 1.0 / sample_rate;
        let alpha = dt / (rc + dt);
        Self { alpha, z: 0.0 }
    }

    fn process(&mut self, input: f32) -> f32 {
        self.z += self.alpha * (input - self.z);
        self.z
    }
}

/// スピーカー慣性
fn speaker_inertia(prev: f32, current: f32) -> f32 {
    prev + 0.2 * (current - prev)
}

/// ビープ/SING 合成器
pub struct Beeper {
    /// ボリューム（0.0 - 1.0）
    volume: f32,
    enabled: bool,
    /// ポート$40 BEEP
    beep_on: bool,
    /// ポート$40 SING
    sing: bool,
    /// 発振器の位相
    oscillator: bool,
    /// 最後に記録した出力レベル
    level: bool,
    /// (クロック, レベル) の変化点
    changes: VecDeque<(u64, bool)>,
    /// サンプル化済みのクロック
    rendered_clock: u64,
    /// サンプル化中のレベル
    render_level: bool,
    prev_output: f32,
    lpf: LowPass,
}

impl Default for Beeper {
    fn default() -> Self {
        Self::new(SAMPLE_RATE)
    }
}

impl Beeper {
    pub fn new(sample_rate: u32) -> Self {
        let sample_rate = sample_rate.max(1);
        Beeper {
            volume: 0.25,
            enabled: true,
            beep_on: false,
            sing: false,
            oscillator: false,
            level: false,
            changes: VecDeque::with_capacity(1024),
            rendered_clock: 0,
            render_level: false,
            prev_output: 0.0,
            lpf: LowPass::new(4000.0, sample_rate as f32),
        }
    }

    pub fn reset(&mut self, clock: u64) {
        self.beep_on = false;
        self.sing = false;
        self.oscillator = false;
        self.level = false;
        self.changes.clear();
        self.rendered_clock = clock;
        self.render_level = false;
        self.prev_output = 0.0;
        self.lpf.z = 0.0;
    }

    /// サンプルレート変更（フィルタも作り直す）
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.lpf = LowPass::new(4000.0, sample_rate.max(1) as f32);
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn beep_on(&self) -> bool {
        self.beep_on
    }

    pub fn sing(&self) -> bool {
        self.sing
    }

    /// 現在のスピーカー出力
    pub fn output(&self) -> bool {
        (self.beep_on && self.oscillator) || self.sing
    }

    pub fn set_beep(&mut self, on: bool, clock: u64) {
        self.beep_on = on;
        self.record(clock);
    }

    pub fn set_sing(&mut self, on: bool, clock: u64) {
        self.sing = on;
        self.record(clock);
    }

    /// 発振器の半周期ごとに呼ばれる
    pub fn toggle_oscillator(&mut self, clock: u64) {
        self.oscillator = !self.oscillator;
        self.record(clock);
    }

    fn record(&mut self, clock: u64) {
        let level = self.output();
        if level != self.level {
            self.level = level;
            self.changes.push_back((clock, level));
            if self.changes.len() > MAX_CHANGES {
                self.changes.pop_front();
            }
        }
    }

    /// 前回から `now` までを `frame_count` フレームのステレオi16にする
    pub fn create_sound(&mut self, frame_count: usize, now: u64) -> Vec<i16> {
        let mut samples = Vec::with_capacity(frame_count * 2);
        let start = self.rendered_clock.min(now);
        let span = now - start;

        for i in 0..frame_count {
            let sample_clock = start + (span as u128 * i as u128 / frame_count.max(1) as u128) as u64;
            while let Some(&(clock, level)) = self.changes.front() {
                if clock > sample_clock {
                    break;
                }
                self.render_level = level;
                self.changes.pop_front();
            }

            let raw = if self.render_level { 1.0 } else { -1.0 };
            let with_inertia = speaker_inertia(self.prev_output, raw);
            self.prev_output = with_inertia;
            let filtered = self.lpf.process(with_inertia);
            let value = if self.enabled {
                (filtered * self.volume * i16::MAX as f32) as i16
            } else {
                0
            };
            samples.push(value);
            samples.push(value);
        }

        // 残った変化点のうち now 以前のものは捨てる
        while let Some(&(clock, level)) = self.changes.front() {
            if clock > now {
                break;
            }
            self.render_level = level;
            self.changes.pop_front();
        }
        self.rendered_clock = now;
        samples
    }
}
