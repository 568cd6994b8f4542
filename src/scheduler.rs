//! イベントスケジューラ
//!
//! 仮想クロック上の遅延イベントを管理する優先度キュー。
//! VRTC、タイマー、ビープ発振、バス解放ウィンドウ、FDCのシーク/回転待ちなど
//! 周辺デバイスのタイミングはすべてここを経由する。
//! CPUコアは「次のイベントまで何サイクルか」だけを問い合わせればよい。

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// デバイス基準クロック（Hz）
pub const CLOCK_HZ: u64 = 3_993_624;

/// イベントの所有デバイス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceId {
    /// CRTC（VRTC、バスリクエスト）
    Crtc,
    /// 1/600秒タイマー
    Timer,
    /// ビープ発振器
    Beeper,
    /// フロッピーディスクコントローラ
    Fdc,
}

/// イベントのペイロード（所有デバイスのハンドラへ配送される）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTag {
    /// 垂直帰線期間の開始
    VrtcStart,
    /// 垂直帰線期間の終了（フレーム先頭）
    VrtcEnd,
    /// 1ライン分のテキストDMAによるバス占有
    BusRequest,
    /// 1/600秒タイマー
    TimerTick,
    /// 2400Hzビープの半周期
    BeepToggle,
    /// シーク完了（ドライブ番号）
    FdcSeekEnd(u8),
    /// 回転待ち完了、実行フェーズのデータ転送開始
    FdcDataReady,
    /// リザルトフェーズへの遷移
    FdcResult,
}

/// 登録済みイベントのハンドル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventHandle(u64);

/// スケジュールされたイベント
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub owner: DeviceId,
    pub tag: EventTag,
    /// 絶対期限サイクル
    pub due: u64,
    /// 周期（0 = ワンショット）
    pub period: u64,
    pub enabled: bool,
}

/// 配送されたイベント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredEvent {
    pub handle: EventHandle,
    pub owner: DeviceId,
    pub tag: EventTag,
    /// 発火したサイクル
    pub due: u64,
}

/// セーブ用のスケジューラ状態
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerState {
    pub clock: u64,
    pub next_id: u64,
    pub events: Vec<(u64, ScheduledEvent)>,
}

/// 仮想クロックとイベントキュー
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    /// 現在の仮想クロック（デバイス基準サイクル）
    clock: u64,
    /// 次に払い出すハンドル番号（登録順＝同時刻の優先順）
    next_id: u64,
    /// 生きているイベント
    events: HashMap<u64, ScheduledEvent>,
    /// (期限, 登録番号) の最小ヒープ。取消や再スケジュールで古くなった要素は取り出し時に捨てる
    queue: BinaryHeap<Reverse<(u64, u64)>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 現在の仮想クロック
    #[inline]
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// イベントを登録
    ///
    /// `delay` サイクル後に発火し、`period` が 0 でなければ以後その周期で繰り返す。
    pub fn register(&mut self, owner: DeviceId, tag: EventTag, delay: u64, period: u64) -> EventHandle {
        let id = self.next_id;
        self.next_id += 1;
        let due = self.clock.saturating_add(delay);
        self.events.insert(
            id,
            ScheduledEvent {
                owner,
                tag,
                due,
                period,
                enabled: true,
            },
        );
        self.queue.push(Reverse((due, id)));
        EventHandle(id)
    }

    /// イベントを取り消す。未知または発火済みのハンドルは無視
    pub fn cancel(&mut self, handle: EventHandle) {
        self.events.remove(&handle.0);
    }

    /// ハンドルがまだ有効か
    pub fn is_registered(&self, handle: EventHandle) -> bool {
        self.events.contains_key(&handle.0)
    }

    /// 無効化されたイベントはキューに残るが配送されない（周期イベントは位相を保つ）
    pub fn set_enabled(&mut self, handle: EventHandle, enabled: bool) {
        if let Some(event) = self.events.get_mut(&handle.0) {
            event.enabled = enabled;
        }
    }

    /// 登録済みイベント数
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// 古くなったヒープ先頭を捨てる
    fn purge_stale(&mut self) {
        while let Some(&Reverse((due, id))) = self.queue.peek() {
            match self.events.get(&id) {
                Some(event) if event.due == due => break,
                _ => {
                    self.queue.pop();
                }
            }
        }
    }

    /// 次のイベントの期限
    pub fn next_due(&mut self) -> Option<u64> {
        self.purge_stale();
        self.queue.peek().map(|&Reverse((due, _))| due)
    }

    /// `target` 以下の期限を持つ次のイベントを1件取り出す
    ///
    /// クロックはそのイベントの期限まで進む。周期イベントは再登録される。
    /// ハンドラが配送中に新しいイベントを登録しても、期限が `target` 以下なら
    /// 同じ進行の中で順序通りに配送される。
    pub fn pop_due(&mut self, target: u64) -> Option<FiredEvent> {
        if target < self.clock {
            return None;
        }
        loop {
            let Reverse((due, id)) = *self.queue.peek()?;
            if due > target {
                return None;
            }
            self.queue.pop();

            let Some(event) = self.events.get_mut(&id) else {
                continue;
            };
            if event.due != due {
                continue;
            }

            self.clock = self.clock.max(due);
            let fired = FiredEvent {
                handle: EventHandle(id),
                owner: event.owner,
                tag: event.tag,
                due,
            };
            let enabled = event.enabled;
            if event.period > 0 {
                event.due = due + event.period;
                let next = event.due;
                self.queue.push(Reverse((next, id)));
            } else {
                self.events.remove(&id);
            }
            if enabled {
                return Some(fired);
            }
        }
    }

    /// 配送後にクロックを `target` まで進める（後退はしない）
    pub fn settle(&mut self, target: u64) {
        if target > self.clock {
            self.clock = target;
        }
    }

    /// `target` までの全イベントを期限順に配送してクロックを進める
    ///
    /// `target` が現在のクロックより前なら何もしない。
    pub fn advance(&mut self, target: u64) -> Vec<FiredEvent> {
        let mut fired = Vec::new();
        if target < self.clock {
            return fired;
        }
        while let Some(event) = self.pop_due(target) {
            fired.push(event);
        }
        self.settle(target);
        fired
    }

    /// 全イベントを破棄してクロックを0へ戻す
    ///
    /// ハンドル番号は巻き戻さない（古いハンドルが新しいイベントを指さないように）。
    pub fn reset(&mut self) {
        self.clock = 0;
        self.events.clear();
        self.queue.clear();
    }

    pub fn save_state(&self) -> SchedulerState {
        let mut events: Vec<(u64, ScheduledEvent)> =
            self.events.iter().map(|(&id, e)| (id, e.clone())).collect();
        events.sort_by_key(|(id, _)| *id);
        SchedulerState {
            clock: self.clock,
            next_id: self.next_id,
            events,
        }
    }

    pub fn load_state(&mut self, state: &SchedulerState) {
        self.clock = state.clock;
        self.next_id = state.next_id;
        self.events.clear();
        self.queue.clear();
        for (id, event) in &state.events {
            self.queue.push(Reverse((event.due, *id)));
            self.events.insert(*id, event.clone());
        }
    }

    #[cfg(test)]
    pub fn handle_from_raw(raw: u64) -> EventHandle {
        EventHandle(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_periodic_catch_up() {
        let mut sched = Scheduler::new();
        sched.register(DeviceId::Timer, EventTag::TimerTick, 4, 4);
        let fired: Vec<u64> = sched.advance(20).iter().map(|e| e.due).collect();
        assert_eq!(fired, vec![4, 8, 12, 16, 20]);
        assert_eq!(sched.clock(), 20);
        assert_eq!(sched.next_due(), Some(24));
    }

    #[test]
    fn test_never_delivers_future_events() {
        let mut sched = Scheduler::new();
        sched.register(DeviceId::Fdc, EventTag::FdcResult, 10, 0);
        sched.register(DeviceId::Fdc, EventTag::FdcDataReady, 11, 0);
        let fired = sched.advance(10);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].tag, EventTag::FdcResult);
        assert_eq!(sched.len(), 1);
    }

    #[test]
    fn test_ties_resolve_by_registration_order() {
        let mut sched = Scheduler::new();
        sched.register(DeviceId::Timer, EventTag::TimerTick, 100, 0);
        sched.register(DeviceId::Crtc, EventTag::VrtcStart, 100, 0);
        sched.register(DeviceId::Beeper, EventTag::BeepToggle, 50, 50);
        let tags: Vec<EventTag> = sched.advance(100).iter().map(|e| e.tag).collect();
        assert_eq!(
            tags,
            vec![
                EventTag::BeepToggle,
                EventTag::TimerTick,
                EventTag::VrtcStart,
                EventTag::BeepToggle
            ]
        );
    }

    #[test]
    fn test_cancel_unknown_and_fired_is_noop() {
        let mut sched = Scheduler::new();
        let handle = sched.register(DeviceId::Fdc, EventTag::FdcResult, 5, 0);
        assert_eq!(sched.advance(5).len(), 1);
        assert!(!sched.is_registered(handle));
        sched.cancel(handle);
        sched.cancel(Scheduler::handle_from_raw(999));
        assert!(sched.is_empty());
    }

    #[test]
    fn test_cancelled_event_not_delivered() {
        let mut sched = Scheduler::new();
        let a = sched.register(DeviceId::Fdc, EventTag::FdcDataReady, 5, 0);
        sched.register(DeviceId::Fdc, EventTag::FdcResult, 6, 0);
        sched.cancel(a);
        let fired = sched.advance(10);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].tag, EventTag::FdcResult);
    }

    #[test]
    fn test_backward_advance_is_noop() {
        let mut sched = Scheduler::new();
        sched.advance(100);
        sched.register(DeviceId::Timer, EventTag::TimerTick, 0, 0);
        assert!(sched.advance(50).is_empty());
        assert_eq!(sched.clock(), 100);
        assert_eq!(sched.advance(100).len(), 1);
    }

    #[test]
    fn test_disabled_periodic_keeps_phase() {
        let mut sched = Scheduler::new();
        let h = sched.register(DeviceId::Beeper, EventTag::BeepToggle, 10, 10);
        sched.set_enabled(h, false);
        assert!(sched.advance(35).is_empty());
        sched.set_enabled(h, true);
        let fired: Vec<u64> = sched.advance(50).iter().map(|e| e.due).collect();
        assert_eq!(fired, vec![40, 50]);
    }

    #[test]
    fn test_event_registered_during_dispatch_fires_in_order() {
        let mut sched = Scheduler::new();
        sched.register(DeviceId::Fdc, EventTag::FdcDataReady, 10, 0);
        sched.register(DeviceId::Timer, EventTag::TimerTick, 30, 0);
        let mut order = Vec::new();
        while let Some(event) = sched.pop_due(40) {
            if event.tag == EventTag::FdcDataReady {
                sched.register(DeviceId::Fdc, EventTag::FdcResult, 5, 0);
            }
            order.push((event.due, event.tag));
        }
        sched.settle(40);
        assert_eq!(
            order,
            vec![
                (10, EventTag::FdcDataReady),
                (15, EventTag::FdcResult),
                (30, EventTag::TimerTick)
            ]
        );
    }

    #[test]
    fn test_random_sequences_deliver_in_order() {
        // 簡易LCGで登録/取消を混ぜる
        let mut seed: u64 = 0x1234_5678;
        let mut next = || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            seed >> 33
        };
        let mut sched = Scheduler::new();
        let mut handles = Vec::new();
        for round in 0..50u64 {
            for _ in 0..8 {
                let delay = next() % 200;
                let period = if next() % 3 == 0 { 1 + next() % 50 } else { 0 };
                handles.push(sched.register(DeviceId::Timer, EventTag::TimerTick, delay, period));
            }
            if let Some(&h) = handles.get((next() as usize) % handles.len()) {
                sched.cancel(h);
            }
            let target = round * 37;
            let fired = sched.advance(target);
            let mut last = 0;
            for event in &fired {
                assert!(event.due <= target);
                assert!(event.due >= last);
                last = event.due;
            }
        }
    }

    #[test]
    fn test_state_roundtrip_preserves_order() {
        let mut sched = Scheduler::new();
        sched.register(DeviceId::Crtc, EventTag::VrtcStart, 10, 100);
        sched.register(DeviceId::Timer, EventTag::TimerTick, 10, 0);
        let state = sched.save_state();
        let mut restored = Scheduler::new();
        restored.load_state(&state);
        let tags: Vec<EventTag> = restored.advance(10).iter().map(|e| e.tag).collect();
        assert_eq!(tags, vec![EventTag::VrtcStart, EventTag::TimerTick]);
    }
}
