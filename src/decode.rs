// 该文件是 Yuanjing （远景） 项目的一部分。
// src/decode.rs - 原始输出张量解码
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

use tracing::{debug, error};

use crate::{
  error::DetectorError,
  geometry::BBox,
  model::{Activation, Architecture, BoxEncoding, LabelSet, LabelTree, OutputLayer, RawDetectionTensor},
};

/// 每个锚框的非类别项：tx, ty, tw, th, objectness
const BOX_ENTRIES: usize = 5;

/// 抑制前的候选框，坐标在网络输入空间
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
  pub class_index: usize,
  pub confidence: f32,
  pub bbox: BBox,
}

/// 类别打分策略
#[derive(Debug, Clone, Copy)]
pub enum ClassScoring<'a> {
  /// objectness 乘以最大类别概率
  Flat,
  /// 沿标签树自顶向下走，直到置信度不超过阈值
  Hierarchical { tree: &'a LabelTree, threshold: f32 },
}

impl<'a> ClassScoring<'a> {
  pub fn from_label_set(labels: &'a LabelSet, hier_thresh: f32) -> Self {
    match labels {
      LabelSet::Flat => ClassScoring::Flat,
      LabelSet::Tree(tree) => ClassScoring::Hierarchical {
        tree,
        threshold: hier_thresh,
      },
    }
  }
}

pub struct BoxDecoder<'a> {
  architecture: &'a Architecture,
  scoring: ClassScoring<'a>,
  classes: usize,
  net_w: u32,
  net_h: u32,
  thresh: f32,
}

impl<'a> BoxDecoder<'a> {
  /// `thresh` 为 [0, 1] 区间的置信度阈值
  pub fn new(
    architecture: &'a Architecture,
    scoring: ClassScoring<'a>,
    classes: usize,
    network_dims: (u32, u32),
    thresh: f32,
  ) -> Self {
    BoxDecoder {
      architecture,
      scoring,
      classes,
      net_w: network_dims.0,
      net_h: network_dims.1,
      thresh,
    }
  }

  /// 一次遍历整个张量，按层、锚框、单元的顺序输出候选框
  pub fn decode(&self, raw: &RawDetectionTensor) -> Result<Vec<Candidate>, DetectorError> {
    if raw.layers.len() != self.architecture.layers.len() {
      error!(
        "输出层数量不匹配: 期望 {}, 实际 {}",
        self.architecture.layers.len(),
        raw.layers.len()
      );
      return Err(DetectorError::dimension(format!(
        "输出层数量不匹配: 期望 {}, 实际 {}",
        self.architecture.layers.len(),
        raw.layers.len()
      )));
    }

    let mut candidates = Vec::new();
    let mut scratch = Vec::with_capacity(self.classes);
    let mut absolute = Vec::with_capacity(self.classes);

    for (layer_idx, (layer, spec)) in raw
      .layers
      .iter()
      .zip(&self.architecture.layers)
      .enumerate()
    {
      let anchors = spec.encoding.anchors();
      let expected = anchors.len() * (BOX_ENTRIES + self.classes) * layer.cells();
      if layer.cells() == 0 || layer.data.len() != expected {
        error!(
          "输出层 {} 大小不匹配: 网格 {}x{}, 期望 {}, 实际 {}",
          layer_idx,
          layer.grid_w,
          layer.grid_h,
          expected,
          layer.data.len()
        );
        return Err(DetectorError::dimension(format!(
          "输出层 {} 大小不匹配: 期望 {}, 实际 {}",
          layer_idx,
          expected,
          layer.data.len()
        )));
      }

      let before = candidates.len();
      for (anchor_idx, anchor) in anchors.iter().enumerate() {
        let view = EntryView {
          layer,
          base: anchor_idx * (BOX_ENTRIES + self.classes),
          activation: spec.activation,
        };

        for cell in 0..layer.cells() {
          let objectness = view.activated(4, cell);
          // objectness 不超过阈值时置信度不可能超过阈值
          if !(objectness > self.thresh) {
            continue;
          }

          scratch.clear();
          scratch.extend((0..self.classes).map(|c| view.activated(BOX_ENTRIES + c, cell)));

          let Some((class_index, confidence)) = self.score(objectness, &scratch, &mut absolute)
          else {
            continue;
          };
          if !(confidence > self.thresh) {
            continue;
          }

          let bbox = self.decode_box(&spec.encoding, anchor, &view, cell);
          candidates.push(Candidate {
            class_index,
            confidence,
            bbox,
          });
        }
      }

      debug!(
        "输出层 {} ({}x{}, {} 个锚框) 解码出 {} 个候选框",
        layer_idx,
        layer.grid_w,
        layer.grid_h,
        anchors.len(),
        candidates.len() - before
      );
    }

    Ok(candidates)
  }

  fn score(&self, objectness: f32, probs: &[f32], absolute: &mut Vec<f32>) -> Option<(usize, f32)> {
    match self.scoring {
      ClassScoring::Flat => {
        let mut best: Option<(usize, f32)> = None;
        for (idx, &p) in probs.iter().enumerate() {
          if best.is_none_or(|(_, best_p)| p > best_p) {
            best = Some((idx, p));
          }
        }
        best.map(|(idx, p)| (idx, objectness * p))
      }
      ClassScoring::Hierarchical { tree, threshold } => {
        tree.absolute_probabilities(probs, absolute);
        tree
          .top_prediction(absolute, objectness, threshold)
          .map(|(node, p)| (node, objectness * p))
      }
    }
  }

  fn decode_box(&self, encoding: &BoxEncoding, anchor: &[f32; 2], view: &EntryView, cell: usize) -> BBox {
    let grid_w = view.layer.grid_w as f32;
    let grid_h = view.layer.grid_h as f32;
    let col = (cell % view.layer.grid_w) as f32;
    let row = (cell / view.layer.grid_w) as f32;
    let net_w = self.net_w as f32;
    let net_h = self.net_h as f32;

    let cx = (col + view.activated(0, cell)) / grid_w * net_w;
    let cy = (row + view.activated(1, cell)) / grid_h * net_h;
    let tw = view.raw(2, cell).exp();
    let th = view.raw(3, cell).exp();

    let (w, h) = match encoding {
      BoxEncoding::Yolo { .. } => (tw * anchor[0], th * anchor[1]),
      BoxEncoding::Region { .. } => (tw * anchor[0] / grid_w * net_w, th * anchor[1] / grid_h * net_h),
    };

    BBox::from_center(cx, cy, w, h)
  }
}

struct EntryView<'a> {
  layer: &'a OutputLayer,
  base: usize,
  activation: Activation,
}

impl EntryView<'_> {
  fn raw(&self, entry: usize, cell: usize) -> f32 {
    self.layer.data[(self.base + entry) * self.layer.cells() + cell]
  }

  fn activated(&self, entry: usize, cell: usize) -> f32 {
    let value = self.raw(entry, cell);
    match self.activation {
      Activation::None => value,
      Activation::Logistic => sigmoid(value),
    }
  }
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::LayerSpec;
  use proptest::prelude::*;

  /// 构造单层张量，`cells` 为 (单元下标, tx, ty, tw, th, objectness, 类别概率)
  fn layer(grid: usize, classes: usize, cells: &[(usize, [f32; 5], &[f32])]) -> OutputLayer {
    let area = grid * grid;
    let mut data = vec![0.0; (BOX_ENTRIES + classes) * area];
    for (cell, entries, probs) in cells {
      for (e, v) in entries.iter().enumerate() {
        data[e * area + cell] = *v;
      }
      for (c, p) in probs.iter().enumerate() {
        data[(BOX_ENTRIES + c) * area + cell] = *p;
      }
    }
    OutputLayer {
      grid_w: grid,
      grid_h: grid,
      data,
    }
  }

  fn yolo_arch(anchor: [f32; 2], activation: Activation) -> Architecture {
    Architecture {
      layers: vec![LayerSpec {
        encoding: BoxEncoding::Yolo {
          anchors: vec![anchor],
        },
        activation,
      }],
    }
  }

  #[test]
  fn flat_decode_picks_max_class_and_decodes_box() {
    let arch = yolo_arch([100.0, 50.0], Activation::None);
    let raw = RawDetectionTensor {
      layers: vec![layer(
        13,
        3,
        &[
          (6 * 13 + 6, [0.5, 0.5, 0.0, 0.0, 0.9], &[0.1, 0.8, 0.3]),
          (0, [0.5, 0.5, 0.0, 0.0, 0.1], &[0.9, 0.0, 0.0]),
        ],
      )],
    };

    let decoder = BoxDecoder::new(&arch, ClassScoring::Flat, 3, (416, 416), 0.24);
    let out = decoder.decode(&raw).unwrap();
    assert_eq!(out.len(), 1);
    let c = out[0];
    assert_eq!(c.class_index, 1);
    assert!((c.confidence - 0.72).abs() < 1e-6);
    let (cx, cy) = c.bbox.center();
    assert!((cx - 208.0).abs() < 1e-3);
    assert!((cy - 208.0).abs() < 1e-3);
    assert!((c.bbox.width() - 100.0).abs() < 1e-3);
    assert!((c.bbox.height() - 50.0).abs() < 1e-3);
  }

  #[test]
  fn class_ties_go_to_lowest_index() {
    let arch = yolo_arch([10.0, 10.0], Activation::None);
    let raw = RawDetectionTensor {
      layers: vec![layer(2, 3, &[(3, [0.5, 0.5, 0.0, 0.0, 1.0], &[0.2, 0.6, 0.6])])],
    };
    let out = BoxDecoder::new(&arch, ClassScoring::Flat, 3, (64, 64), 0.1)
      .decode(&raw)
      .unwrap();
    assert_eq!(out[0].class_index, 1);
  }

  #[test]
  fn region_anchors_are_in_grid_units_and_logits_are_activated() {
    let arch = Architecture {
      layers: vec![LayerSpec {
        encoding: BoxEncoding::Region {
          anchors: vec![[2.0, 1.0]],
        },
        activation: Activation::Logistic,
      }],
    };
    // logit 0 -> 0.5，logit 10 -> ~1
    let raw = RawDetectionTensor {
      layers: vec![layer(4, 1, &[(0, [0.0, 0.0, 0.0, 0.0, 10.0], &[10.0])])],
    };
    let out = BoxDecoder::new(&arch, ClassScoring::Flat, 1, (128, 128), 0.5)
      .decode(&raw)
      .unwrap();
    assert_eq!(out.len(), 1);
    let (cx, cy) = out[0].bbox.center();
    assert!((cx - 16.0).abs() < 1e-3);
    assert!((cy - 16.0).abs() < 1e-3);
    assert!((out[0].bbox.width() - 64.0).abs() < 1e-3);
    assert!((out[0].bbox.height() - 32.0).abs() < 1e-3);
  }

  #[test]
  fn hierarchical_scoring_reports_ancestor() {
    let arch = yolo_arch([10.0, 10.0], Activation::None);
    let labels = LabelSet::Tree(LabelTree::from_parents(vec![None, Some(0), Some(0)]).unwrap());
    let raw = RawDetectionTensor {
      layers: vec![layer(2, 3, &[(0, [0.5, 0.5, 0.0, 0.0, 0.9], &[1.0, 0.55, 0.45])])],
    };

    let scoring = ClassScoring::from_label_set(&labels, 0.6);
    let out = BoxDecoder::new(&arch, scoring, 3, (64, 64), 0.2)
      .decode(&raw)
      .unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].class_index, 0);
    assert!((out[0].confidence - 0.9).abs() < 1e-6);

    let scoring = ClassScoring::from_label_set(&labels, 0.4);
    let out = BoxDecoder::new(&arch, scoring, 3, (64, 64), 0.2)
      .decode(&raw)
      .unwrap();
    assert_eq!(out[0].class_index, 1);
    assert!((out[0].confidence - 0.495).abs() < 1e-6);
  }

  #[test]
  fn size_mismatch_is_a_dimension_error() {
    let arch = yolo_arch([10.0, 10.0], Activation::None);
    let mut bad = layer(2, 3, &[]);
    bad.data.pop();
    let raw = RawDetectionTensor { layers: vec![bad] };
    let decoder = BoxDecoder::new(&arch, ClassScoring::Flat, 3, (64, 64), 0.2);
    assert!(matches!(decoder.decode(&raw), Err(DetectorError::Dimension(_))));

    let none = RawDetectionTensor::default();
    assert!(matches!(decoder.decode(&none), Err(DetectorError::Dimension(_))));
  }

  proptest! {
    #[test]
    fn full_threshold_yields_nothing(
      data in proptest::collection::vec(0.0f32..=1.0, (BOX_ENTRIES + 2) * 9),
      logistic in any::<bool>(),
    ) {
      let activation = if logistic { Activation::Logistic } else { Activation::None };
      let arch = yolo_arch([10.0, 10.0], activation);
      let raw = RawDetectionTensor {
        layers: vec![OutputLayer { grid_w: 3, grid_h: 3, data }],
      };
      let out = BoxDecoder::new(&arch, ClassScoring::Flat, 2, (96, 96), 1.0).decode(&raw).unwrap();
      prop_assert!(out.is_empty());
    }
  }
}
