// 该文件是 Yuanjing （远景） 项目的一部分。
// src/pipeline.rs - 目标检测流水线
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

use std::{
  sync::Arc,
  time::{Duration, Instant},
};

use image::{ImageBuffer, Pixel, RgbImage};
use tracing::{debug, error, info};

use crate::{
  config::{Thresholds, YoloConfig},
  decode::{BoxDecoder, ClassScoring},
  error::{DetectorError, LifecycleState},
  geometry::{BBox, LetterboxTransform, Placement, letterbox_image},
  lifecycle::{ModelLifecycle, Readiness},
  model::{InputDims, InputTensor, ModelHandle, ModelProvider, Network, RawDetectionTensor},
  nms::suppress,
  output::{DetectionMessage, Draw, SerialEmitter},
};

/// 最终检测结果
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub class_index: usize,
  pub label: Arc<str>,
  pub confidence: f32,
  pub bbox: BBox,
}

/// 一次 `compute_boxes` 的结果，坐标在 `dims()` 给出的原图空间
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSet {
  pub items: Box<[Detection]>,
  width: u32,
  height: u32,
}

impl DetectionSet {
  pub fn dims(&self) -> (u32, u32) {
    (self.width, self.height)
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Detection> {
    self.items.iter()
  }

  /// 把检测框映射到 `width x height` 的原图空间，再加上偏移
  pub fn placed(
    &self,
    width: u32,
    height: u32,
    x_offset: i32,
    y_offset: i32,
  ) -> Result<impl Iterator<Item = (&Detection, BBox)>, DetectorError> {
    let placement = Placement::new(self.dims(), (width, height), x_offset, y_offset)?;
    Ok(
      self
        .items
        .iter()
        .map(move |det| (det, placement.apply_box(&det.bbox))),
    )
  }
}

/// 图像尺寸与网络输入尺寸不同时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputResize {
  /// 保持网络尺寸，把图像按信箱方式缩放进去
  #[default]
  Letterbox,
  /// 把网络输入尺寸调整为图像尺寸（要求网络是全卷积的）
  ResizeNetwork,
}

/// 流水线状态（逻辑状态，叠加在模型生命周期之上）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
  Uninitialized,
  Predicted,
  BoxesReady,
}

#[derive(Debug, Clone, Copy)]
enum InputOrigin {
  /// 由图像经信箱变换得到
  Letterboxed(LetterboxTransform),
  /// 调用者直接提供的网络输入张量
  Tensor,
}

#[derive(Debug)]
struct Prediction {
  raw: RawDetectionTensor,
  origin: InputOrigin,
  net: InputDims,
}

#[derive(Debug)]
enum Stage {
  Uninitialized,
  Predicted(Prediction),
  BoxesReady(Prediction, DetectionSet),
}

/// 检测流水线：信箱变换 -> 前向推理 -> 解码 -> 非极大值抑制 -> 坐标还原
///
/// 不可重入，所有推理相关操作须在同一个线程中顺序调用。
/// 只有就绪标志（见 [`Readiness`]）可以跨线程查询。
pub struct DetectionPipeline<N: Network> {
  lifecycle: ModelLifecycle<N>,
  thresholds: Thresholds,
  draw: Draw,
  input_resize: InputResize,
  letterbox_cache: Option<LetterboxTransform>,
  stage: Stage,
}

impl<N: Network> DetectionPipeline<N> {
  pub fn new(lifecycle: ModelLifecycle<N>, thresholds: Thresholds) -> Self {
    DetectionPipeline {
      lifecycle,
      thresholds,
      draw: Draw::default(),
      input_resize: InputResize::default(),
      letterbox_cache: None,
      stage: Stage::Uninitialized,
    }
  }

  /// 在后台启动模型加载并立即返回
  pub fn load<P>(provider: P, config: YoloConfig) -> Self
  where
    P: ModelProvider<Network = N>,
  {
    let thresholds = config.thresholds();
    Self::new(ModelLifecycle::begin_load(provider, config), thresholds)
  }

  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = draw;
    self
  }

  pub fn with_input_resize(mut self, input_resize: InputResize) -> Self {
    self.input_resize = input_resize;
    self
  }

  pub fn set_thresholds(&mut self, thresholds: Thresholds) {
    self.thresholds = thresholds;
  }

  pub fn thresholds(&self) -> Thresholds {
    self.thresholds
  }

  pub fn is_ready(&self) -> bool {
    self.lifecycle.is_ready()
  }

  pub fn readiness(&self) -> Readiness {
    self.lifecycle.readiness()
  }

  pub fn lifecycle_state(&self) -> LifecycleState {
    self.lifecycle.state()
  }

  pub fn lifecycle_mut(&mut self) -> &mut ModelLifecycle<N> {
    &mut self.lifecycle
  }

  pub fn stage(&self) -> PipelineStage {
    match self.stage {
      Stage::Uninitialized => PipelineStage::Uninitialized,
      Stage::Predicted(_) => PipelineStage::Predicted,
      Stage::BoxesReady(..) => PipelineStage::BoxesReady,
    }
  }

  /// 上一次 `predict` 使用的信箱变换
  pub fn cached_transform(&self) -> Option<&LetterboxTransform> {
    self.letterbox_cache.as_ref()
  }

  /// 最近一次 `compute_boxes` 的结果
  pub fn detections(&self) -> Option<&DetectionSet> {
    match &self.stage {
      Stage::BoxesReady(_, set) => Some(set),
      _ => None,
    }
  }

  /// 网络输入尺寸 (宽, 高, 通道)
  pub fn in_dims(&mut self) -> Result<InputDims, DetectorError> {
    Ok(self.lifecycle.model()?.in_dims())
  }

  /// 修改网络输入空间尺寸，丢弃旧尺寸下的信箱变换与推理结果
  pub fn resize_in_dims(&mut self, width: u32, height: u32) -> Result<(), DetectorError> {
    let model = self.lifecycle.model_mut()?;
    model.resize_in_dims(width, height)?;
    self.letterbox_cache = None;
    self.stage = Stage::Uninitialized;
    info!("网络输入尺寸调整为 {}x{}", width, height);
    Ok(())
  }

  /// 对 8 位图像做信箱变换后推理，返回前向推理耗时
  ///
  /// 图像空间尺寸与网络不同时按 [`InputResize`] 处理，通道数不同则报错。
  pub fn predict<P>(&mut self, image: &ImageBuffer<P, Vec<u8>>) -> Result<Duration, DetectorError>
  where
    P: Pixel<Subpixel = u8> + 'static,
  {
    let mut net = self.lifecycle.model()?.in_dims();
    let channels = P::CHANNEL_COUNT as u32;
    if channels != net.channels {
      return Err(DetectorError::dimension(format!(
        "图像通道数 {} 与网络输入通道数 {} 不一致",
        channels, net.channels
      )));
    }

    let (orig_w, orig_h) = image.dimensions();
    if self.input_resize == InputResize::ResizeNetwork && (orig_w, orig_h) != (net.width, net.height) {
      info!(
        "图像尺寸 {}x{} 与网络 {}x{} 不同，调整网络输入尺寸",
        orig_w, orig_h, net.width, net.height
      );
      self.resize_in_dims(orig_w, orig_h)?;
      net = self.lifecycle.model()?.in_dims();
    }
    let transform = match self.letterbox_cache {
      Some(cached)
        if cached.original_dims() == (orig_w, orig_h)
          && cached.network_dims() == (net.width, net.height) =>
      {
        cached
      }
      _ => {
        let transform = LetterboxTransform::new(orig_w, orig_h, net.width, net.height)?;
        debug!(
          "信箱变换: 原图 {}x{} -> 网络 {}x{}, 缩放 {:.4}, 填充 {:?}",
          orig_w,
          orig_h,
          net.width,
          net.height,
          transform.scale(),
          transform.pad()
        );
        self.letterbox_cache = Some(transform);
        transform
      }
    };

    let tensor = letterbox_image(image, &transform)?;
    self.run_forward(tensor, InputOrigin::Letterboxed(transform))
  }

  /// 使用已归一化的平面浮点张量推理，返回前向推理耗时
  ///
  /// 空间尺寸与网络不同时自动调用 `resize_in_dims`，通道数不同则报错。
  pub fn predict_tensor(&mut self, tensor: InputTensor) -> Result<Duration, DetectorError> {
    let net = self.lifecycle.model()?.in_dims();
    let dims = tensor.dims();
    if dims.channels != net.channels {
      return Err(DetectorError::dimension(format!(
        "张量通道数 {} 与网络输入通道数 {} 不一致",
        dims.channels, net.channels
      )));
    }
    if (dims.width, dims.height) != (net.width, net.height) {
      info!(
        "输入张量尺寸 {}x{} 与网络 {}x{} 不同，调整网络输入尺寸",
        dims.width, dims.height, net.width, net.height
      );
      self.resize_in_dims(dims.width, dims.height)?;
    }
    self.run_forward(tensor, InputOrigin::Tensor)
  }

  fn run_forward(&mut self, tensor: InputTensor, origin: InputOrigin) -> Result<Duration, DetectorError> {
    let model = self.lifecycle.model_mut()?;
    let net = model.in_dims();

    // 新的推理使旧的检测结果失效
    self.stage = Stage::Uninitialized;

    let start = Instant::now();
    let raw = model.forward(&tensor)?;
    let elapsed = start.elapsed();
    debug!("前向推理完成，耗时: {:.2?}", elapsed);

    self.stage = Stage::Predicted(Prediction { raw, origin, net });
    Ok(elapsed)
  }

  /// 解码、抑制并把检测框还原到 `orig_w x orig_h` 的原图空间
  pub fn compute_boxes(&mut self, orig_w: u32, orig_h: u32) -> Result<&DetectionSet, DetectorError> {
    let model = self.lifecycle.model()?;
    let prediction = match std::mem::replace(&mut self.stage, Stage::Uninitialized) {
      Stage::Predicted(prediction) | Stage::BoxesReady(prediction, _) => prediction,
      Stage::Uninitialized => {
        error!("compute_boxes 必须在 predict 成功之后调用");
        return Err(DetectorError::state("compute_boxes 必须在 predict 成功之后调用"));
      }
    };

    match build_detections(model, &prediction, self.thresholds, orig_w, orig_h) {
      Ok(set) => self.stage = Stage::BoxesReady(prediction, set),
      Err(e) => {
        self.stage = Stage::Predicted(prediction);
        return Err(e);
      }
    }
    self.boxes_ready("compute_boxes")
  }

  fn boxes_ready(&self, op: &str) -> Result<&DetectionSet, DetectorError> {
    self.detections().ok_or_else(|| {
      error!("{} 必须在 compute_boxes 成功之后调用", op);
      DetectorError::state(format!("{} 必须在 compute_boxes 成功之后调用", op))
    })
  }

  /// 在目标图像 `(x_offset, y_offset)` 处、大小为 `orig_w x orig_h` 的区域中绘制检测框与标签
  pub fn draw_detections(
    &self,
    target: &mut RgbImage,
    orig_w: u32,
    orig_h: u32,
    x_offset: i32,
    y_offset: i32,
  ) -> Result<(), DetectorError> {
    self.draw_detections_with(&self.draw, target, orig_w, orig_h, x_offset, y_offset)
  }

  /// 同 [`Self::draw_detections`]，使用调用者给出的绘制器
  pub fn draw_detections_with(
    &self,
    draw: &Draw,
    target: &mut RgbImage,
    orig_w: u32,
    orig_h: u32,
    x_offset: i32,
    y_offset: i32,
  ) -> Result<(), DetectorError> {
    let set = self.boxes_ready("draw_detections")?;
    for (det, bbox) in set.placed(orig_w, orig_h, x_offset, y_offset)? {
      draw.draw_detection(target, &bbox, det);
    }
    Ok(())
  }

  /// 为每个检测结果发送一条消息，坐标在 `orig_w x orig_h` 的原图空间
  pub fn send_serial<E: SerialEmitter>(
    &self,
    emitter: &mut E,
    orig_w: u32,
    orig_h: u32,
  ) -> Result<(), DetectorError> {
    let set = self.boxes_ready("send_serial")?;
    for (det, bbox) in set.placed(orig_w, orig_h, 0, 0)? {
      let message = DetectionMessage::new(det, &bbox);
      emitter
        .emit(&message)
        .map_err(|e| DetectorError::Emit(anyhow::Error::new(e)))?;
    }
    Ok(())
  }
}

fn build_detections<N: Network>(
  model: &ModelHandle<N>,
  prediction: &Prediction,
  thresholds: Thresholds,
  orig_w: u32,
  orig_h: u32,
) -> Result<DetectionSet, DetectorError> {
  if orig_w == 0 || orig_h == 0 {
    return Err(DetectorError::dimension(format!(
      "原图尺寸不能为零: {}x{}",
      orig_w, orig_h
    )));
  }
  let scoring = ClassScoring::from_label_set(model.label_set(), thresholds.hier_thresh);
  let decoder = BoxDecoder::new(
    model.architecture(),
    scoring,
    model.classes(),
    (prediction.net.width, prediction.net.height),
    thresholds.thresh,
  );
  let candidates = decoder.decode(&prediction.raw)?;
  let decoded = candidates.len();
  let kept = suppress(candidates, thresholds.nms);

  // 先用推理时的信箱变换还原到原图，再缩放到调用者要求的尺寸
  let (transform, rescale) = match prediction.origin {
    InputOrigin::Letterboxed(transform) => {
      let rescale = Placement::new(transform.original_dims(), (orig_w, orig_h), 0, 0)?;
      (transform, rescale)
    }
    InputOrigin::Tensor => (
      LetterboxTransform::new(orig_w, orig_h, prediction.net.width, prediction.net.height)?,
      Placement::identity(),
    ),
  };

  let names = model.shared_names();
  let items = kept
    .into_iter()
    .map(|candidate| Detection {
      class_index: candidate.class_index,
      label: names
        .get(candidate.class_index)
        .cloned()
        .unwrap_or_else(|| Arc::from("unknown")),
      confidence: candidate.confidence,
      bbox: rescale.apply_box(&transform.box_to_original_space(&candidate.bbox)),
    })
    .collect::<Box<[_]>>();

  info!("检测到 {} 个物体（解码 {} 个候选框）", items.len(), decoded);
  Ok(DetectionSet {
    items,
    width: orig_w,
    height: orig_h,
  })
}
