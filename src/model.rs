// 该文件是 Yuanjing （远景） 项目的一部分。
// src/model.rs - 模型句柄与网络接口
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

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{config::YoloConfig, error::DetectorError, lifecycle::CancelToken};

mod label_tree;
pub use self::label_tree::LabelTree;

/// 网络输入尺寸
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputDims {
  pub width: u32,
  pub height: u32,
  pub channels: u32,
}

impl InputDims {
  pub fn len(&self) -> usize {
    self.width as usize * self.height as usize * self.channels as usize
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// 归一化到 [0, 1] 的平面（CHW）浮点输入张量
#[derive(Debug, Clone)]
pub struct InputTensor {
  dims: InputDims,
  data: Box<[f32]>,
}

impl InputTensor {
  pub fn new(dims: InputDims, data: Vec<f32>) -> Result<Self, DetectorError> {
    if data.len() != dims.len() {
      return Err(DetectorError::dimension(format!(
        "输入张量长度不匹配: 期望 {}x{}x{}={}, 实际 {}",
        dims.channels,
        dims.height,
        dims.width,
        dims.len(),
        data.len()
      )));
    }
    Ok(InputTensor {
      dims,
      data: data.into_boxed_slice(),
    })
  }

  pub fn filled(dims: InputDims, value: f32) -> Self {
    InputTensor {
      dims,
      data: vec![value; dims.len()].into_boxed_slice(),
    }
  }

  pub fn dims(&self) -> InputDims {
    self.dims
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.data
  }
}

/// 一个输出层的原始数据
///
/// 排布与 darknet 相同：`data[(anchor * (5 + classes) + entry) * grid_w * grid_h + cell]`，
/// entry 依次为 tx, ty, tw, th, objectness, 各类别概率。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputLayer {
  pub grid_w: usize,
  pub grid_h: usize,
  pub data: Vec<f32>,
}

impl OutputLayer {
  pub fn cells(&self) -> usize {
    self.grid_w * self.grid_h
  }
}

/// 网络一次前向推理的原始输出
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDetectionTensor {
  pub layers: Vec<OutputLayer>,
}

/// 输出值是否还需要经过 sigmoid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
  /// 已经激活（darknet 的 yolo/region 层默认如此）
  #[default]
  None,
  /// 原始 logit，对 tx/ty/objectness/类别概率应用 sigmoid
  Logistic,
}

/// 边界框编码方式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BoxEncoding {
  /// YOLOv3 风格，锚框尺寸以网络输入像素为单位
  Yolo { anchors: Vec<[f32; 2]> },
  /// YOLOv2 region 风格，锚框尺寸以网格单元为单位
  Region { anchors: Vec<[f32; 2]> },
}

impl BoxEncoding {
  pub fn anchors(&self) -> &[[f32; 2]] {
    match self {
      BoxEncoding::Yolo { anchors } | BoxEncoding::Region { anchors } => anchors,
    }
  }

  pub fn num_anchors(&self) -> usize {
    self.anchors().len()
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
  pub encoding: BoxEncoding,
  #[serde(default)]
  pub activation: Activation,
}

/// 与模型一起提供的结构元数据，描述每个输出层如何解码
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Architecture {
  pub layers: Vec<LayerSpec>,
}

/// 类别集合：扁平标签或树状标签
#[derive(Debug, Clone, PartialEq)]
pub enum LabelSet {
  Flat,
  Tree(LabelTree),
}

/// 外部提供的网络前向推理
pub trait Network: Send + 'static {
  type Error: std::error::Error + Send + Sync + 'static;

  fn input_dims(&self) -> InputDims;
  /// 修改输入空间尺寸，通道数不变
  fn resize_input(&mut self, width: u32, height: u32) -> Result<(), Self::Error>;
  fn forward(&mut self, input: &InputTensor) -> Result<RawDetectionTensor, Self::Error>;
}

/// 外部模型提供者，在后台线程中被调用以构造模型句柄
pub trait ModelProvider: Send + 'static {
  type Network: Network;
  type Error: std::error::Error + Send + Sync + 'static;

  fn load(
    self,
    config: &YoloConfig,
    cancel: &CancelToken,
  ) -> Result<ModelHandle<Self::Network>, Self::Error>;
}

/// 已加载模型的句柄，由生命周期管理器独占
pub struct ModelHandle<N: Network> {
  network: N,
  dims: InputDims,
  names: Arc<[Arc<str>]>,
  labels: LabelSet,
  architecture: Architecture,
}

impl<N: Network> std::fmt::Debug for ModelHandle<N> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ModelHandle")
      .field("dims", &self.dims)
      .field("classes", &self.names.len())
      .field("labels", &self.labels)
      .field("architecture", &self.architecture)
      .finish_non_exhaustive()
  }
}

impl<N: Network> ModelHandle<N> {
  /// 类别数量等于名称表长度
  pub fn new<S: AsRef<str>>(
    network: N,
    architecture: Architecture,
    names: &[S],
  ) -> Result<Self, DetectorError> {
    let dims = network.input_dims();
    if dims.is_empty() {
      return Err(DetectorError::dimension(format!(
        "网络输入尺寸无效: {}x{}x{}",
        dims.width, dims.height, dims.channels
      )));
    }
    if architecture.layers.is_empty() {
      return Err(DetectorError::dimension("模型没有输出层"));
    }
    if let Some(idx) = architecture
      .layers
      .iter()
      .position(|layer| layer.encoding.num_anchors() == 0)
    {
      return Err(DetectorError::dimension(format!("输出层 {} 没有锚框", idx)));
    }
    if names.is_empty() {
      return Err(DetectorError::dimension("类别名称表为空"));
    }

    let names: Arc<[Arc<str>]> = names.iter().map(|name| Arc::from(name.as_ref())).collect();
    info!(
      "模型句柄已创建: 输入 {}x{}x{}, {} 个类别, {} 个输出层",
      dims.width,
      dims.height,
      dims.channels,
      names.len(),
      architecture.layers.len()
    );

    Ok(ModelHandle {
      network,
      dims,
      names,
      labels: LabelSet::Flat,
      architecture,
    })
  }

  /// 使用树状标签，树的节点数必须等于类别数
  pub fn with_label_tree(mut self, tree: LabelTree) -> Result<Self, DetectorError> {
    if tree.len() != self.names.len() {
      return Err(DetectorError::dimension(format!(
        "标签树节点数 {} 与类别数 {} 不一致",
        tree.len(),
        self.names.len()
      )));
    }
    self.labels = LabelSet::Tree(tree);
    Ok(self)
  }

  pub fn in_dims(&self) -> InputDims {
    self.dims
  }

  pub fn classes(&self) -> usize {
    self.names.len()
  }

  pub fn names(&self) -> &[Arc<str>] {
    &self.names
  }

  pub fn label(&self, class_index: usize) -> Option<&str> {
    self.names.get(class_index).map(|name| name.as_ref())
  }

  pub(crate) fn shared_names(&self) -> Arc<[Arc<str>]> {
    self.names.clone()
  }

  pub fn label_set(&self) -> &LabelSet {
    &self.labels
  }

  pub fn architecture(&self) -> &Architecture {
    &self.architecture
  }

  pub fn network(&self) -> &N {
    &self.network
  }

  pub(crate) fn forward(&mut self, input: &InputTensor) -> Result<RawDetectionTensor, DetectorError> {
    self
      .network
      .forward(input)
      .map_err(|e| DetectorError::Network(anyhow::Error::new(e)))
  }

  pub(crate) fn resize_in_dims(&mut self, width: u32, height: u32) -> Result<(), DetectorError> {
    if width == 0 || height == 0 {
      return Err(DetectorError::dimension(format!(
        "网络输入尺寸不能为零: {}x{}",
        width, height
      )));
    }
    self
      .network
      .resize_input(width, height)
      .map_err(|e| DetectorError::Network(anyhow::Error::new(e)))?;
    self.dims = InputDims {
      width,
      height,
      channels: self.dims.channels,
    };
    debug!("网络输入尺寸已调整为 {}x{}", width, height);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Debug, thiserror::Error)]
  #[error("无")]
  struct NoError;

  struct Fixed(InputDims);

  impl Network for Fixed {
    type Error = NoError;

    fn input_dims(&self) -> InputDims {
      self.0
    }

    fn resize_input(&mut self, width: u32, height: u32) -> Result<(), NoError> {
      self.0.width = width;
      self.0.height = height;
      Ok(())
    }

    fn forward(&mut self, _input: &InputTensor) -> Result<RawDetectionTensor, NoError> {
      Ok(RawDetectionTensor::default())
    }
  }

  fn arch() -> Architecture {
    Architecture {
      layers: vec![LayerSpec {
        encoding: BoxEncoding::Yolo {
          anchors: vec![[10.0, 14.0]],
        },
        activation: Activation::None,
      }],
    }
  }

  const DIMS: InputDims = InputDims {
    width: 416,
    height: 416,
    channels: 3,
  };

  #[test]
  fn handle_exposes_typed_accessors() {
    let handle = ModelHandle::new(Fixed(DIMS), arch(), &["person", "car"]).unwrap();
    assert_eq!(handle.in_dims(), DIMS);
    assert_eq!(handle.classes(), 2);
    assert_eq!(handle.label(1), Some("car"));
    assert_eq!(handle.label(2), None);
    assert_eq!(handle.label_set(), &LabelSet::Flat);
  }

  #[test]
  fn handle_rejects_empty_names_and_anchorless_layers() {
    let empty: [&str; 0] = [];
    assert!(ModelHandle::new(Fixed(DIMS), arch(), &empty).is_err());

    let bad = Architecture {
      layers: vec![LayerSpec {
        encoding: BoxEncoding::Region { anchors: vec![] },
        activation: Activation::None,
      }],
    };
    assert!(ModelHandle::new(Fixed(DIMS), bad, &["a"]).is_err());
  }

  #[test]
  fn label_tree_size_must_match() {
    let handle = ModelHandle::new(Fixed(DIMS), arch(), &["animal", "dog", "cat"]).unwrap();
    let tree = LabelTree::from_parents(vec![None, Some(0)]).unwrap();
    assert!(handle.with_label_tree(tree).is_err());
  }

  #[test]
  fn resize_keeps_channels() {
    let mut handle = ModelHandle::new(Fixed(DIMS), arch(), &["a"]).unwrap();
    handle.resize_in_dims(320, 256).unwrap();
    assert_eq!(
      handle.in_dims(),
      InputDims {
        width: 320,
        height: 256,
        channels: 3
      }
    );
    assert!(handle.resize_in_dims(0, 256).is_err());
  }

  #[test]
  fn input_tensor_length_is_checked() {
    let dims = InputDims {
      width: 2,
      height: 2,
      channels: 3,
    };
    assert!(InputTensor::new(dims, vec![0.0; 12]).is_ok());
    assert!(matches!(
      InputTensor::new(dims, vec![0.0; 11]),
      Err(DetectorError::Dimension(_))
    ));
  }

  #[test]
  fn architecture_deserializes_from_json() {
    let json = r#"{"layers":[{"encoding":{"kind":"region","anchors":[[1.0,2.0]]},"activation":"logistic"}]}"#;
    let arch: Architecture = serde_json::from_str(json).unwrap();
    assert_eq!(arch.layers[0].activation, Activation::Logistic);
    assert_eq!(arch.layers[0].encoding.num_anchors(), 1);
  }
}
