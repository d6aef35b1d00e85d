// 该文件是 Yuanjing （远景） 项目的一部分。
// tests/common/mod.rs - 集成测试共用的网络与模型提供者
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

#![allow(dead_code)]

use std::{
  sync::mpsc::{Receiver, RecvTimeoutError},
  time::{Duration, Instant},
};

use yuanjing::{
  CancelToken, DetectionPipeline, InputDims, InputTensor, LifecycleState, ModelHandle,
  ModelLifecycle, ModelProvider, Network, RawDetectionTensor, Thresholds, YoloConfig,
  model::{Architecture, BoxEncoding, LayerSpec, OutputLayer},
};

pub const GRID: usize = 13;
pub const CLASSES: usize = 2;
pub const NAMES: [&str; CLASSES] = ["person", "dog"];

#[derive(Debug, thiserror::Error)]
pub enum StubError {
  #[error("输入尺寸不一致")]
  Dims,
  #[error("加载失败: {0}")]
  Load(&'static str),
  #[error("加载已取消")]
  Cancelled,
}

/// 返回固定输出的网络，可以任意调整输入尺寸
pub struct StubNetwork {
  pub dims: InputDims,
  pub output: RawDetectionTensor,
}

impl Network for StubNetwork {
  type Error = StubError;

  fn input_dims(&self) -> InputDims {
    self.dims
  }

  fn resize_input(&mut self, width: u32, height: u32) -> Result<(), StubError> {
    self.dims.width = width;
    self.dims.height = height;
    Ok(())
  }

  fn forward(&mut self, input: &InputTensor) -> Result<RawDetectionTensor, StubError> {
    if input.dims() != self.dims {
      return Err(StubError::Dims);
    }
    Ok(self.output.clone())
  }
}

/// 一个锚框在某个单元上的输出
pub struct Entry {
  pub anchor: usize,
  pub col: usize,
  pub row: usize,
  pub tx: f32,
  pub ty: f32,
  pub tw: f32,
  pub th: f32,
  pub objectness: f32,
  pub probs: [f32; CLASSES],
}

impl Entry {
  /// 位于单元 (6, 6) 中心、尺寸等于锚框的 person
  pub fn centered(anchor: usize, objectness: f32) -> Self {
    Entry {
      anchor,
      col: 6,
      row: 6,
      tx: 0.5,
      ty: 0.5,
      tw: 0.0,
      th: 0.0,
      objectness,
      probs: [0.8, 0.1],
    }
  }
}

/// darknet 排布的单层 yolo 输出
pub fn yolo_output(anchors: usize, entries: &[Entry]) -> RawDetectionTensor {
  let cells = GRID * GRID;
  let stride = 5 + CLASSES;
  let mut data = vec![0.0; anchors * stride * cells];
  for entry in entries {
    let cell = entry.row * GRID + entry.col;
    let base = entry.anchor * stride;
    let values = [entry.tx, entry.ty, entry.tw, entry.th, entry.objectness];
    for (i, v) in values.iter().chain(entry.probs.iter()).enumerate() {
      data[(base + i) * cells + cell] = *v;
    }
  }
  RawDetectionTensor {
    layers: vec![OutputLayer {
      grid_w: GRID,
      grid_h: GRID,
      data,
    }],
  }
}

pub fn yolo_architecture(anchors: &[[f32; 2]]) -> Architecture {
  Architecture {
    layers: vec![LayerSpec {
      encoding: BoxEncoding::Yolo {
        anchors: anchors.to_vec(),
      },
      activation: Default::default(),
    }],
  }
}

pub fn dims(size: u32) -> InputDims {
  InputDims {
    width: size,
    height: size,
    channels: 3,
  }
}

pub fn stub_handle(anchors: &[[f32; 2]], entries: &[Entry]) -> ModelHandle<StubNetwork> {
  let network = StubNetwork {
    dims: dims(416),
    output: yolo_output(anchors.len(), entries),
  };
  ModelHandle::new(network, yolo_architecture(anchors), &NAMES).unwrap()
}

/// 单个 person 检测，网络空间中心 (208, 208)，尺寸 100x100
pub fn ready_pipeline() -> DetectionPipeline<StubNetwork> {
  let handle = stub_handle(&[[100.0, 100.0]], &[Entry::centered(0, 0.9)]);
  DetectionPipeline::new(ModelLifecycle::from_handle(handle), Thresholds::default())
}

/// 收到放行信号后才完成加载的提供者
pub struct GatedProvider {
  pub release: Receiver<()>,
  pub fail: bool,
}

impl ModelProvider for GatedProvider {
  type Network = StubNetwork;
  type Error = StubError;

  fn load(
    self,
    _config: &YoloConfig,
    cancel: &CancelToken,
  ) -> Result<ModelHandle<StubNetwork>, StubError> {
    loop {
      match self.release.recv_timeout(Duration::from_millis(10)) {
        Ok(()) => break,
        Err(RecvTimeoutError::Timeout) if !cancel.is_cancelled() => continue,
        Err(_) => return Err(StubError::Cancelled),
      }
    }
    if self.fail {
      return Err(StubError::Load("权重文件损坏"));
    }
    Ok(stub_handle(&[[100.0, 100.0]], &[Entry::centered(0, 0.9)]))
  }
}

/// 轮询直到离开 Loading 状态
pub fn wait_settled(pipeline: &mut DetectionPipeline<StubNetwork>) -> LifecycleState {
  let deadline = Instant::now() + Duration::from_secs(5);
  while Instant::now() < deadline {
    match pipeline.lifecycle_mut().poll() {
      Ok(LifecycleState::Loading) => std::thread::sleep(Duration::from_millis(5)),
      Ok(state) => return state,
      Err(_) => return LifecycleState::Failed,
    }
  }
  panic!("模型加载超时");
}

pub fn assert_close(actual: f32, expected: f32) {
  assert!(
    (actual - expected).abs() < 1e-2,
    "期望 {}, 实际 {}",
    expected,
    actual
  );
}
