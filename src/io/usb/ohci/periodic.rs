// ============================================================================
// src/io/usb/ohci/periodic.rs - Periodic Schedule Tree
// ============================================================================
//!
//! # 周期スケジュールツリー
//!
//! HCCA の32エントリ割り込みテーブルを葉とする二分木。
//! 各レベル（32/16/8/4/2/1ms）のノードは常時スキップのダミーEDで、
//! 葉から根へ向かって NextED で連結される。
//!
//! ```text
//! HCCA[i] → dummy(32, i) → dummy(16, i%16) → ... → dummy(1, 0) → [iso EDs] → 0
//! ```
//!
//! 間隔 I のエンドポイントはグループ g (0..I) に属し、
//! ノード dummy(I, g) の直後（次のダミーの直前）に挿入される。
//! グループ g の葉は {g, g+I, g+2I, ...}。
//!
//! ## 帯域台帳
//! 葉ごとの負荷カウンタ（千分率）。エンドポイントはグループ内の全ての葉に
//! コストを加算するので、葉の値がそのまま根→葉パスの累積帯域になる。

use core::sync::atomic::{fence, Ordering};

use crate::io::usb::UsbSpeed;

use super::descriptor::ED_SKIP;
use super::hcca::{Hcca, INTERRUPT_TABLE_SIZE};
use super::pool::{DescriptorArena, EdIndex};
use super::schedule::EdRecord;

/// サポートする最大ポーリング間隔 (ms)
pub const MAX_INTERVAL: u8 = 32;

/// ツリーの内部ノード（ダミーED）数: 32+16+8+4+2+1
pub const TREE_NODE_COUNT: usize = 63;

/// フルスピード1フレームのビット時間
const FRAME_BITS: u32 = 12_000;

/// 間隔 `interval` のノード `branch` に対応するダミーEDのスロット番号
pub const fn node_slot(interval: u8, branch: u8) -> usize {
    interval as usize - 1 + branch as usize
}

/// ダミーED（ツリーの内部ノード）か
pub fn is_tree_node(ed: EdIndex) -> bool {
    ed.as_usize() < TREE_NODE_COUNT
}

/// 要求間隔を 32 以下の2の冪に切り下げる
pub fn clamp_interval(requested: u8) -> u8 {
    let mut interval = MAX_INTERVAL;
    while interval > 1 && interval > requested {
        interval /= 2;
    }
    interval
}

/// 1トランザクションあたりの帯域コスト（フレーム時間の千分率、切り上げ）
///
/// プロトコルオーバーヘッドはアイソクロナス 9 バイト、それ以外 13 バイト。
/// ビットスタッフィング分として 7/6 倍し、ロースピードは8倍。
pub fn bandwidth_cost(max_packet_size: u16, speed: UsbSpeed, isochronous: bool) -> u16 {
    let overhead = if isochronous { 9 } else { 13 };
    let mut bits = (max_packet_size as u32 + overhead) * 8 * 7 / 6;
    if speed == UsbSpeed::Low {
        bits *= 8;
    }
    let cost = (bits * 1000).div_ceil(FRAME_BITS);
    cost.clamp(1, u16::MAX as u32) as u16
}

// ============================================================================
// Bandwidth Ledger
// ============================================================================

/// 32分岐の帯域台帳
#[derive(Debug, Clone)]
pub struct PeriodicTree {
    loads: [u16; INTERRUPT_TABLE_SIZE],
}

impl PeriodicTree {
    pub const fn new() -> Self {
        Self {
            loads: [0; INTERRUPT_TABLE_SIZE],
        }
    }

    pub fn loads(&self) -> &[u16; INTERRUPT_TABLE_SIZE] {
        &self.loads
    }

    /// 葉 `leaf` の根→葉パス上の累積帯域
    pub fn path_load(&self, leaf: usize) -> u16 {
        self.loads[leaf]
    }

    fn group_leaves(interval: u8, group: u8) -> impl Iterator<Item = usize> {
        (group as usize..INTERRUPT_TABLE_SIZE).step_by(interval as usize)
    }

    /// グループ内の (最大負荷, 最小負荷)
    fn group_extremes(&self, interval: u8, group: u8) -> (u16, u16) {
        Self::group_leaves(interval, group).fold((0, u16::MAX), |(max, min), leaf| {
            (max.max(self.loads[leaf]), min.min(self.loads[leaf]))
        })
    }

    /// 挿入先グループを選択
    ///
    /// 最大負荷が最小のグループを選ぶ。同値なら最小負荷が小さい方、
    /// さらに同値なら番号の小さい方。選ばれたグループでも
    /// `ceiling - 最大負荷 < cost` なら `None`。
    pub fn select_group(&self, interval: u8, cost: u16, ceiling: u16) -> Option<u8> {
        let mut best: Option<(u8, u16, u16)> = None;
        for group in 0..interval {
            let (max, min) = self.group_extremes(interval, group);
            let better = match best {
                None => true,
                Some((_, best_max, best_min)) => {
                    max < best_max || (max == best_max && min < best_min)
                }
            };
            if better {
                best = Some((group, max, min));
            }
        }

        let (group, max, _) = best?;
        if ceiling.saturating_sub(max) < cost {
            return None;
        }
        Some(group)
    }

    /// グループの全ての葉に帯域を加算
    pub fn charge(&mut self, interval: u8, group: u8, cost: u16) {
        for leaf in Self::group_leaves(interval, group) {
            self.loads[leaf] = self.loads[leaf].saturating_add(cost);
        }
    }

    /// `charge` の逆操作
    pub fn release(&mut self, interval: u8, group: u8, cost: u16) {
        for leaf in Self::group_leaves(interval, group) {
            self.loads[leaf] = self.loads[leaf].saturating_sub(cost);
        }
    }
}

impl Default for PeriodicTree {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tree Linking
// ============================================================================

/// ダミーEDでツリーを構築し、HCCA 割り込みテーブルを設定
pub fn build_tree(eds: &mut [EdRecord], arena: &DescriptorArena, hcca: &Hcca) {
    let mut interval = 1u8;
    while interval <= MAX_INTERVAL {
        for branch in 0..interval {
            let slot = EdIndex(node_slot(interval, branch) as u16);
            let parent = (interval > 1).then(|| {
                let half = interval / 2;
                EdIndex(node_slot(half, branch % half) as u16)
            });

            let hw = arena.ed(slot);
            hw.clear();
            hw.set_control(ED_SKIP);
            hw.set_next_ed(parent.map_or(0, |p| arena.ed_bus(p)));

            let record = &mut eds[slot.as_usize()];
            *record = EdRecord::tree_node(interval, branch);
            record.next = parent;
        }
        interval *= 2;
    }

    for leaf in 0..INTERRUPT_TABLE_SIZE {
        let node = EdIndex(node_slot(MAX_INTERVAL, leaf as u8) as u16);
        hcca.set_interrupt_entry(leaf, arena.ed_bus(node));
    }
}

/// 周期EDをノード dummy(interval, group) の枝に挿入
///
/// 次のダミーEDの直前に入れる。インタラプトEDは同じ枝の最初の
/// アイソクロナスEDより前に、アイソクロナスEDは枝の末尾に入る。
pub fn link(eds: &mut [EdRecord], arena: &DescriptorArena, interval: u8, group: u8, ed: EdIndex) {
    let inserting_iso = eds[ed.as_usize()].is_isochronous();
    let mut prev = EdIndex(node_slot(interval, group) as u16);
    while let Some(next) = eds[prev.as_usize()].next {
        if is_tree_node(next) {
            break;
        }
        if !inserting_iso && eds[next.as_usize()].is_isochronous() {
            break;
        }
        prev = next;
    }

    let next = eds[prev.as_usize()].next;
    eds[ed.as_usize()].next = next;
    arena.ed(ed).set_next_ed(next.map_or(0, |n| arena.ed_bus(n)));
    // 新しいEDを完成させてから公開する
    fence(Ordering::Release);
    eds[prev.as_usize()].next = Some(ed);
    arena.ed(prev).set_next_ed(arena.ed_bus(ed));
}

/// 周期EDを枝から外す。見つからなければ何もしない。
pub fn unlink(
    eds: &mut [EdRecord],
    arena: &DescriptorArena,
    interval: u8,
    group: u8,
    ed: EdIndex,
) -> bool {
    let mut prev = EdIndex(node_slot(interval, group) as u16);
    loop {
        match eds[prev.as_usize()].next {
            Some(next) if next == ed => break,
            Some(next) => prev = next,
            None => return false,
        }
    }

    let next = eds[ed.as_usize()].next;
    eds[prev.as_usize()].next = next;
    arena.ed(prev).set_next_ed(next.map_or(0, |n| arena.ed_bus(n)));
    eds[ed.as_usize()].next = None;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_slots_cover_tree() {
        assert_eq!(node_slot(1, 0), 0);
        assert_eq!(node_slot(2, 1), 2);
        assert_eq!(node_slot(32, 0), 31);
        assert_eq!(node_slot(32, 31), TREE_NODE_COUNT - 1);
    }

    #[test]
    fn test_clamp_interval() {
        assert_eq!(clamp_interval(0), 1);
        assert_eq!(clamp_interval(1), 1);
        assert_eq!(clamp_interval(3), 2);
        assert_eq!(clamp_interval(10), 8);
        assert_eq!(clamp_interval(32), 32);
        assert_eq!(clamp_interval(255), 32);
    }

    #[test]
    fn test_bandwidth_cost() {
        // (8 + 13) * 8 * 7 / 6 = 196 bits → 16.3‰
        assert_eq!(bandwidth_cost(8, UsbSpeed::Full, false), 17);
        assert_eq!(bandwidth_cost(8, UsbSpeed::Low, false), 131);
        // (1023 + 9) * 8 * 7 / 6 = 9632 bits → 802.7‰
        assert_eq!(bandwidth_cost(1023, UsbSpeed::Full, true), 803);
    }

    #[test]
    fn test_min_max_selection_spreads_groups() {
        let mut tree = PeriodicTree::new();
        let mut groups = alloc::vec::Vec::new();
        for _ in 0..4 {
            let group = tree.select_group(8, 10, 900).unwrap();
            tree.charge(8, group, 10);
            groups.push(group);
        }
        assert_eq!(groups, [0, 1, 2, 3]);

        // 間隔1は全ての葉を1グループで共有する
        tree.charge(1, 0, 5);
        assert!(tree.loads().iter().all(|&l| l == 5 || l == 15));
    }

    #[test]
    fn test_selection_prefers_smallest_worst_case() {
        let mut tree = PeriodicTree::new();
        // グループ0 (間隔2) の片方の葉だけ重くする
        tree.charge(32, 0, 100);
        // 間隔2: グループ0 の最大は100、グループ1 は0
        assert_eq!(tree.select_group(2, 10, 900), Some(1));
    }

    #[test]
    fn test_ceiling_rejects_without_side_effects() {
        let mut tree = PeriodicTree::new();
        let cost = bandwidth_cost(1023, UsbSpeed::Full, true);
        let group = tree.select_group(1, cost, 900).unwrap();
        tree.charge(1, group, cost);

        let before = *tree.loads();
        assert_eq!(tree.select_group(1, cost, 900), None);
        assert_eq!(*tree.loads(), before);
        assert!((0..32).all(|leaf| tree.path_load(leaf) <= 900));

        tree.release(1, group, cost);
        assert!(tree.loads().iter().all(|&l| l == 0));
    }
}
