//! ホスト境界
//!
//! VM本体はスレッドを持たず、ロックもしない。UIスレッドとオーディオスレッドから
//! 触る場合は `SharedVm` のロックで出入りを直列化する。

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::VmConfig;
use crate::pc88::{Pc88, VmError, FRAMES_PER_SECOND};

/// 1フレームの実時間
pub const FRAME_DURATION: Duration = Duration::from_micros(1_000_000 / FRAMES_PER_SECOND);

/// スレッド間で共有するVM
#[derive(Clone)]
pub struct SharedVm {
    inner: Arc<Mutex<Pc88>>,
}

impl SharedVm {
    pub fn new(config: VmConfig) -> Result<Self, VmError> {
        Ok(Self::from_vm(Pc88::new(config)?))
    }

    pub fn from_vm(vm: Pc88) -> Self {
        SharedVm {
            inner: Arc::new(Mutex::new(vm)),
        }
    }

    /// ロックを取る
    ///
    /// 他スレッドがパニックしてもVMの状態は命令境界で一貫しているので、そのまま使う。
    pub fn lock(&self) -> MutexGuard<'_, Pc88> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// ロックを取ってクロージャを実行
    pub fn with<R>(&self, f: impl FnOnce(&mut Pc88) -> R) -> R {
        let mut vm = self.lock();
        f(&mut vm)
    }

    pub fn run_one_frame(&self) {
        self.lock().run_one_frame();
    }

    pub fn create_sound(&self, frame_count: usize) -> Vec<i16> {
        self.lock().create_sound(frame_count)
    }

    pub fn open_disk<P: AsRef<Path>>(&self, drive: usize, path: P, bank: usize) -> bool {
        self.lock().open_disk(drive, path, bank)
    }

    pub fn close_disk(&self, drive: usize) {
        self.lock().close_disk(drive);
    }
}

/// 60fps のフレームペーシング
pub struct FramePacer {
    frame_duration: Duration,
    next_frame: Instant,
    /// 追いつけなかったフレーム数
    pub late_frames: u64,
}

impl FramePacer {
    /// `speed` 倍速（0 で無制限）
    pub fn new(speed: u32) -> Self {
        let frame_duration = if speed == 0 {
            Duration::ZERO
        } else {
            FRAME_DURATION / speed
        };
        FramePacer {
            frame_duration,
            next_frame: Instant::now(),
            late_frames: 0,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.frame_duration.is_zero()
    }

    /// 次のフレーム時刻まで待つ
    ///
    /// 大きく遅れた場合は待ち合わせ基準を今に合わせ直す。
    pub fn wait(&mut self) {
        if self.is_unlimited() {
            return;
        }
        self.next_frame += self.frame_duration;
        let now = Instant::now();
        if self.next_frame > now {
            std::thread::sleep(self.next_frame - now);
        } else if now - self.next_frame > self.frame_duration * 4 {
            self.late_frames += 1;
            self.next_frame = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_vm_serializes_access_across_threads() {
        let shared = SharedVm::new(VmConfig::default()).unwrap();
        let worker = shared.clone();
        let handle = std::thread::spawn(move || {
            for _ in 0..3 {
                worker.run_one_frame();
            }
        });
        for _ in 0..3 {
            let samples = shared.create_sound(64);
            assert_eq!(samples.len(), 128);
        }
        handle.join().unwrap();
        assert_eq!(shared.with(|vm| vm.frame_count), 3);
    }

    #[test]
    fn test_unlimited_pacer_does_not_sleep() {
        let mut pacer = FramePacer::new(0);
        assert!(pacer.is_unlimited());
        let start = Instant::now();
        for _ in 0..100 {
            pacer.wait();
        }
        assert!(start.elapsed() < FRAME_DURATION * 10);
    }

    #[test]
    fn test_pacer_holds_frame_rate() {
        let mut pacer = FramePacer::new(4);
        let start = Instant::now();
        for _ in 0..4 {
            pacer.wait();
        }
        assert!(start.elapsed() >= FRAME_DURATION - Duration::from_millis(2));
    }
}
