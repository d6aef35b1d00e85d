// 该文件是 Yuanjing （远景） 项目的一部分。
// src/model/label_tree.rs - 树状类别标签
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

use crate::error::DetectorError;

/// 类别分类树，网络为每个节点输出条件概率 P(节点 | 父节点)
#[derive(Debug, Clone, PartialEq)]
pub struct LabelTree {
  parents: Vec<Option<usize>>,
  children: Vec<Vec<usize>>,
  roots: Vec<usize>,
}

impl LabelTree {
  /// 由父节点表构造，父节点必须排在子节点之前
  pub fn from_parents(parents: Vec<Option<usize>>) -> Result<Self, DetectorError> {
    let mut children = vec![Vec::new(); parents.len()];
    let mut roots = Vec::new();

    for (node, parent) in parents.iter().enumerate() {
      match *parent {
        None => roots.push(node),
        Some(p) if p < node => children[p].push(node),
        Some(p) => {
          return Err(DetectorError::dimension(format!(
            "标签树节点 {} 的父节点 {} 必须排在它之前",
            node, p
          )));
        }
      }
    }

    Ok(LabelTree {
      parents,
      children,
      roots,
    })
  }

  pub fn len(&self) -> usize {
    self.parents.len()
  }

  pub fn is_empty(&self) -> bool {
    self.parents.is_empty()
  }

  pub fn parent(&self, node: usize) -> Option<usize> {
    self.parents.get(node).copied().flatten()
  }

  pub fn children(&self, node: usize) -> &[usize] {
    self.children.get(node).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn roots(&self) -> &[usize] {
    &self.roots
  }

  /// 把条件概率沿路径相乘，得到每个节点的绝对概率
  ///
  /// 父节点总在子节点之前，因此一次顺序遍历即可。
  pub fn absolute_probabilities(&self, conditional: &[f32], out: &mut Vec<f32>) {
    out.clear();
    out.reserve(self.parents.len());
    for (node, parent) in self.parents.iter().enumerate() {
      let p = conditional.get(node).copied().unwrap_or(0.0);
      let prob = match parent {
        Some(parent) => p * out[*parent],
        None => p,
      };
      out.push(prob);
    }
  }

  /// 自顶向下贪心走树，返回最后一个置信度超过阈值的节点及其绝对概率
  ///
  /// 每一层选择绝对概率最大的子节点（下标小者优先），
  /// 当 `scale * P(节点) <= threshold` 时停止。
  pub fn top_prediction(&self, absolute: &[f32], scale: f32, threshold: f32) -> Option<(usize, f32)> {
    let mut group = self.roots.as_slice();
    let mut best = None;

    while !group.is_empty() {
      let mut pick: Option<(usize, f32)> = None;
      for &node in group {
        let p = absolute[node];
        if pick.is_none_or(|(_, best_p)| p > best_p) {
          pick = Some((node, p));
        }
      }
      match pick {
        Some((node, p)) if scale * p > threshold => {
          best = Some((node, p));
          group = self.children(node);
        }
        _ => break,
      }
    }

    best
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  // 0 animal ─┬─ 1 dog ── 3 husky
  //           └─ 2 cat
  // 4 vehicle
  fn tree() -> LabelTree {
    LabelTree::from_parents(vec![None, Some(0), Some(0), Some(1), None]).unwrap()
  }

  #[test]
  fn structure_is_indexed() {
    let t = tree();
    assert_eq!(t.roots(), &[0, 4]);
    assert_eq!(t.children(0), &[1, 2]);
    assert_eq!(t.parent(3), Some(1));
    assert_eq!(t.parent(0), None);
    assert!(t.children(99).is_empty());
  }

  #[test]
  fn forward_parent_reference_is_rejected() {
    assert!(LabelTree::from_parents(vec![Some(1), None]).is_err());
  }

  #[test]
  fn absolute_probabilities_multiply_along_path() {
    let t = tree();
    let mut abs = Vec::new();
    t.absolute_probabilities(&[0.9, 0.8, 0.2, 0.5, 0.1], &mut abs);
    let expected = [0.9, 0.72, 0.18, 0.36, 0.1];
    for (a, e) in abs.iter().zip(expected) {
      assert!((a - e).abs() < 1e-6);
    }
  }

  #[test]
  fn walk_stops_at_best_qualifying_ancestor() {
    let t = tree();
    let abs = [0.9, 0.72, 0.18, 0.36, 0.1];
    // husky 0.36 不够，退回到 dog
    assert_eq!(t.top_prediction(&abs, 1.0, 0.5), Some((1, 0.72)));
    // 阈值足够低时走到叶子
    assert_eq!(t.top_prediction(&abs, 1.0, 0.3), Some((3, 0.36)));
    // 根节点都不够
    assert_eq!(t.top_prediction(&abs, 1.0, 0.95), None);
    // objectness 参与比较
    assert_eq!(t.top_prediction(&abs, 0.5, 0.4), Some((0, 0.9)));
  }
}
