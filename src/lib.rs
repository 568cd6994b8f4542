//! PC88RS - NEC PC-8801 virtual machine core in Rust
//!
//! PC-8801 の仮想マシンコア:
//! - 仮想クロックのイベントスケジューラ
//! - 4KB単位のメモリバンクテーブル
//! - 割り込みラインアグリゲータ
//! - uPD765A FDC と D88 ディスクイメージ
//! - Z80 CPU

pub mod bank;
pub mod config;
pub mod cpu;
pub mod d88;
pub mod fdc;
pub mod fdc_log;
pub mod host;
pub mod irq;
pub mod keyboard;
pub mod memory;
pub mod opn;
pub mod pc88;
pub mod ports;
pub mod savestate;
pub mod scheduler;
pub mod sound;
