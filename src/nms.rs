// 该文件是 Yuanjing （远景） 项目的一部分。
// src/nms.rs - 非极大值抑制
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::collections::BTreeMap;

use tracing::debug;

use crate::decode::Candidate;

/// 按类别独立做贪心非极大值抑制
///
/// 每个类别内按置信度降序稳定排序（置信度相同时保持解码顺序），
/// 与已接受的同类框 IoU 严格大于 `iou_threshold` 的候选框被丢弃。
/// 输出按类别下标升序拼接，类内按置信度降序。
pub fn suppress(candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
  let total = candidates.len();
  let mut by_class: BTreeMap<usize, Vec<Candidate>> = BTreeMap::new();
  for candidate in candidates {
    by_class
      .entry(candidate.class_index)
      .or_default()
      .push(candidate);
  }

  let mut kept = Vec::with_capacity(total);
  for (_, mut group) in by_class {
    group.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let start = kept.len();
    for candidate in group {
      let overlaps = kept[start..]
        .iter()
        .any(|accepted: &Candidate| accepted.bbox.iou(&candidate.bbox) > iou_threshold);
      if !overlaps {
        kept.push(candidate);
      }
    }
  }

  debug!("非极大值抑制: {} 个候选框保留 {} 个", total, kept.len());
  kept
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::geometry::BBox;
  use proptest::prelude::*;

  fn candidate(class_index: usize, confidence: f32, bbox: [f32; 4]) -> Candidate {
    Candidate {
      class_index,
      confidence,
      bbox: BBox::new(bbox[0], bbox[1], bbox[2], bbox[3]),
    }
  }

  #[test]
  fn empty_input() {
    assert!(suppress(vec![], 0.45).is_empty());
  }

  #[test]
  fn overlapping_lower_confidence_is_suppressed() {
    let a = candidate(0, 0.7, [2.5, 0.0, 12.5, 10.0]);
    let b = candidate(0, 0.9, [0.0, 0.0, 10.0, 10.0]);
    let out = suppress(vec![a, b], 0.45);
    assert_eq!(out, vec![b]);
  }

  #[test]
  fn different_classes_do_not_suppress_each_other() {
    let a = candidate(1, 0.9, [0.0, 0.0, 10.0, 10.0]);
    let b = candidate(0, 0.8, [0.0, 0.0, 10.0, 10.0]);
    let out = suppress(vec![a, b], 0.45);
    // 按类别下标输出
    assert_eq!(out, vec![b, a]);
  }

  #[test]
  fn zero_threshold_drops_any_overlap_and_full_threshold_keeps_all() {
    let boxes = vec![
      candidate(0, 0.9, [0.0, 0.0, 10.0, 10.0]),
      candidate(0, 0.8, [9.0, 9.0, 19.0, 19.0]),
      candidate(0, 0.7, [0.0, 0.0, 10.0, 10.0]),
      candidate(0, 0.6, [50.0, 50.0, 60.0, 60.0]),
    ];
    let strict = suppress(boxes.clone(), 0.0);
    assert_eq!(strict, vec![boxes[0], boxes[3]]);

    let loose = suppress(boxes.clone(), 1.0);
    assert_eq!(loose.len(), 4);
  }

  #[test]
  fn equal_confidence_keeps_decode_order() {
    let first = candidate(0, 0.5, [0.0, 0.0, 10.0, 10.0]);
    let second = candidate(0, 0.5, [1.0, 1.0, 11.0, 11.0]);
    assert_eq!(suppress(vec![first, second], 0.3), vec![first]);
    assert_eq!(suppress(vec![second, first], 0.3), vec![second]);
  }

  fn arb_candidate() -> impl Strategy<Value = Candidate> {
    (0usize..3, 0.0f32..1.0, 0.0f32..100.0, 0.0f32..100.0, 1.0f32..40.0, 1.0f32..40.0)
      .prop_map(|(class_index, confidence, x, y, w, h)| Candidate {
        class_index,
        confidence,
        bbox: BBox::new(x, y, x + w, y + h),
      })
  }

  proptest! {
    #[test]
    fn never_keeps_same_class_pair_above_threshold(
      candidates in proptest::collection::vec(arb_candidate(), 0..40),
      threshold in 0.0f32..=1.0,
    ) {
      let kept = suppress(candidates.clone(), threshold);
      prop_assert!(kept.len() <= candidates.len());
      for (i, a) in kept.iter().enumerate() {
        for b in &kept[i + 1..] {
          if a.class_index == b.class_index {
            prop_assert!(a.bbox.iou(&b.bbox) <= threshold);
          }
        }
      }
      // 类别有序，类内置信度不升
      for pair in kept.windows(2) {
        prop_assert!(pair[0].class_index <= pair[1].class_index);
        if pair[0].class_index == pair[1].class_index {
          prop_assert!(pair[0].confidence >= pair[1].confidence);
        }
      }
    }
  }
}
