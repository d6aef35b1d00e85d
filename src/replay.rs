// 该文件是 Yuanjing （远景） 项目的一部分。
// src/replay.rs - 回放录制的网络输出
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

//! 不带推理引擎时使用的网络：每次前向推理都返回同一份录制好的原始输出。
//!
//! 录制文件为 JSON，路径由配置中的权重文件给出：
//!
//! ```json
//! {
//!   "input": { "width": 416, "height": 416, "channels": 3 },
//!   "names": ["person", "bicycle"],
//!   "architecture": { "layers": [ { "encoding": { "kind": "yolo", "anchors": [[10, 14]] } } ] },
//!   "output": { "layers": [ { "grid_w": 13, "grid_h": 13, "data": [] } ] }
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  config::YoloConfig,
  error::DetectorError,
  lifecycle::CancelToken,
  model::{
    Architecture, InputDims, InputTensor, LabelTree, ModelHandle, ModelProvider, Network,
    RawDetectionTensor,
  },
};

#[derive(Error, Debug)]
pub enum ReplayError {
  #[error("读取 {path} 失败: {source}")]
  IoError {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("解析录制文件失败: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("输入尺寸 {actual:?} 与录制尺寸 {expected:?} 不一致")]
  DimensionMismatch {
    expected: InputDims,
    actual: InputDims,
  },
  #[error("录制的网络不支持调整输入尺寸到 {width}x{height}")]
  Resize { width: u32, height: u32 },
  #[error("录制文件没有类别名称，也没有配置名称文件")]
  MissingNames,
  #[error("模型无效: {0}")]
  InvalidModel(#[from] DetectorError),
  #[error("加载已取消")]
  Cancelled,
}

/// 录制文件内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
  pub input: InputDims,
  #[serde(default)]
  pub names: Vec<String>,
  pub architecture: Architecture,
  /// 树状标签的父节点表
  #[serde(default)]
  pub parents: Option<Vec<Option<usize>>>,
  pub output: RawDetectionTensor,
}

impl Recording {
  pub fn read(path: &Path) -> Result<Self, ReplayError> {
    let text = std::fs::read_to_string(path).map_err(|source| ReplayError::IoError {
      path: path.to_path_buf(),
      source,
    })?;
    Ok(serde_json::from_str(&text)?)
  }
}

#[derive(Debug)]
pub struct ReplayNetwork {
  dims: InputDims,
  output: RawDetectionTensor,
  forwards: usize,
}

impl ReplayNetwork {
  pub fn new(dims: InputDims, output: RawDetectionTensor) -> Self {
    ReplayNetwork {
      dims,
      output,
      forwards: 0,
    }
  }

  /// 已执行的前向推理次数
  pub fn forwards(&self) -> usize {
    self.forwards
  }
}

impl Network for ReplayNetwork {
  type Error = ReplayError;

  fn input_dims(&self) -> InputDims {
    self.dims
  }

  fn resize_input(&mut self, width: u32, height: u32) -> Result<(), ReplayError> {
    if (width, height) == (self.dims.width, self.dims.height) {
      Ok(())
    } else {
      warn!("录制的网络无法调整输入尺寸到 {}x{}", width, height);
      Err(ReplayError::Resize { width, height })
    }
  }

  fn forward(&mut self, input: &InputTensor) -> Result<RawDetectionTensor, ReplayError> {
    if input.dims() != self.dims {
      return Err(ReplayError::DimensionMismatch {
        expected: self.dims,
        actual: input.dims(),
      });
    }
    self.forwards += 1;
    Ok(self.output.clone())
  }
}

/// 从录制文件构造模型
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayProvider;

impl ModelProvider for ReplayProvider {
  type Network = ReplayNetwork;
  type Error = ReplayError;

  fn load(
    self,
    config: &YoloConfig,
    cancel: &CancelToken,
  ) -> Result<ModelHandle<ReplayNetwork>, ReplayError> {
    let path = config.resolve_weightfile();
    info!(
      "回放网络: 录制文件 {}，推理线程数 {}（回放时不使用）",
      path.display(),
      config.threads
    );
    let recording = Recording::read(&path)?;
    if cancel.is_cancelled() {
      return Err(ReplayError::Cancelled);
    }

    let names = match config.resolve_namefile() {
      Some(namefile) => read_names(&namefile)?,
      None if !recording.names.is_empty() => recording.names,
      None => return Err(ReplayError::MissingNames),
    };
    debug!("读取到 {} 个类别名称", names.len());

    let network = ReplayNetwork::new(recording.input, recording.output);
    let handle = ModelHandle::new(network, recording.architecture, &names[..])?;
    let handle = match recording.parents {
      Some(parents) => handle.with_label_tree(LabelTree::from_parents(parents)?)?,
      None => handle,
    };
    Ok(handle)
  }
}

/// 名称文件每行一个类别，忽略空行
pub fn read_names(path: &Path) -> Result<Vec<String>, ReplayError> {
  let text = std::fs::read_to_string(path).map_err(|source| ReplayError::IoError {
    path: path.to_path_buf(),
    source,
  })?;
  Ok(
    text
      .lines()
      .map(str::trim)
      .filter(|line| !line.is_empty())
      .map(str::to_string)
      .collect(),
  )
}
