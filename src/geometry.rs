// 该文件是 Yuanjing （远景） 项目的一部分。
// src/geometry.rs - 信箱变换与坐标空间映射
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

use image::{ImageBuffer, Pixel, imageops::FilterType};
use serde::Serialize;

use crate::{
  error::DetectorError,
  model::{InputDims, InputTensor},
};

/// 信箱填充值（归一化后的中性灰）
pub const LETTERBOX_FILL: f32 = 0.5;

/// 边界框，[x_min, y_min, x_max, y_max]，单位为所在坐标空间的像素
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BBox {
  pub x_min: f32,
  pub y_min: f32,
  pub x_max: f32,
  pub y_max: f32,
}

impl BBox {
  pub fn new(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
    BBox {
      x_min,
      y_min,
      x_max,
      y_max,
    }
  }

  pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
    BBox {
      x_min: cx - width / 2.0,
      y_min: cy - height / 2.0,
      x_max: cx + width / 2.0,
      y_max: cy + height / 2.0,
    }
  }

  pub fn width(&self) -> f32 {
    (self.x_max - self.x_min).max(0.0)
  }

  pub fn height(&self) -> f32 {
    (self.y_max - self.y_min).max(0.0)
  }

  pub fn center(&self) -> (f32, f32) {
    (
      (self.x_min + self.x_max) / 2.0,
      (self.y_min + self.y_max) / 2.0,
    )
  }

  pub fn area(&self) -> f32 {
    self.width() * self.height()
  }

  pub fn intersection(&self, other: &BBox) -> f32 {
    let w = self.x_max.min(other.x_max) - self.x_min.max(other.x_min);
    let h = self.y_max.min(other.y_max) - self.y_min.max(other.y_min);
    w.max(0.0) * h.max(0.0)
  }

  /// 交并比，两个框都退化时返回 0
  pub fn iou(&self, other: &BBox) -> f32 {
    let inter = self.intersection(other);
    let union = self.area() + other.area() - inter;
    if union > 0.0 { inter / union } else { 0.0 }
  }

  /// 对两个角点分别做映射
  pub fn map_corners(&self, f: impl Fn(f32, f32) -> (f32, f32)) -> BBox {
    let (x_min, y_min) = f(self.x_min, self.y_min);
    let (x_max, y_max) = f(self.x_max, self.y_max);
    BBox {
      x_min,
      y_min,
      x_max,
      y_max,
    }
  }
}

/// 原图坐标到网络输入坐标的信箱变换：`net = orig * scale + pad`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxTransform {
  scale: f64,
  pad_x: f64,
  pad_y: f64,
  orig_w: u32,
  orig_h: u32,
  net_w: u32,
  net_h: u32,
}

impl LetterboxTransform {
  /// 计算信箱变换，保持宽高比并居中
  ///
  /// 缩放后的图像尺寸取整到像素，填充量为整数像素，
  /// 与实际写入网络输入的像素位置完全一致。
  pub fn new(orig_w: u32, orig_h: u32, net_w: u32, net_h: u32) -> Result<Self, DetectorError> {
    if orig_w == 0 || orig_h == 0 || net_w == 0 || net_h == 0 {
      return Err(DetectorError::dimension(format!(
        "信箱变换的尺寸不能为零: 原图 {}x{}, 网络 {}x{}",
        orig_w, orig_h, net_w, net_h
      )));
    }

    let scale = (net_w as f64 / orig_w as f64).min(net_h as f64 / orig_h as f64);
    let new_w = scaled_len(orig_w, scale, net_w);
    let new_h = scaled_len(orig_h, scale, net_h);

    Ok(LetterboxTransform {
      scale,
      pad_x: ((net_w - new_w) / 2) as f64,
      pad_y: ((net_h - new_h) / 2) as f64,
      orig_w,
      orig_h,
      net_w,
      net_h,
    })
  }

  pub fn scale(&self) -> f64 {
    self.scale
  }

  pub fn pad(&self) -> (f64, f64) {
    (self.pad_x, self.pad_y)
  }

  pub fn original_dims(&self) -> (u32, u32) {
    (self.orig_w, self.orig_h)
  }

  pub fn network_dims(&self) -> (u32, u32) {
    (self.net_w, self.net_h)
  }

  /// 缩放后（填充前）的图像尺寸
  pub fn resized_dims(&self) -> (u32, u32) {
    (
      scaled_len(self.orig_w, self.scale, self.net_w),
      scaled_len(self.orig_h, self.scale, self.net_h),
    )
  }

  pub fn to_network_space(&self, x: f32, y: f32) -> (f32, f32) {
    (
      (x as f64 * self.scale + self.pad_x) as f32,
      (y as f64 * self.scale + self.pad_y) as f32,
    )
  }

  pub fn to_original_space(&self, x: f32, y: f32) -> (f32, f32) {
    (
      ((x as f64 - self.pad_x) / self.scale) as f32,
      ((y as f64 - self.pad_y) / self.scale) as f32,
    )
  }

  pub fn box_to_network_space(&self, bbox: &BBox) -> BBox {
    bbox.map_corners(|x, y| self.to_network_space(x, y))
  }

  pub fn box_to_original_space(&self, bbox: &BBox) -> BBox {
    bbox.map_corners(|x, y| self.to_original_space(x, y))
  }
}

fn scaled_len(len: u32, scale: f64, limit: u32) -> u32 {
  ((len as f64 * scale).round() as u32).clamp(1, limit)
}

/// 原图坐标到输出图像中某个放置区域的映射（缩放 + 偏移）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
  scale_x: f64,
  scale_y: f64,
  offset_x: f64,
  offset_y: f64,
}

impl Placement {
  /// 把 `from_w x from_h` 的坐标空间放到输出图像 `(offset_x, offset_y)` 处、
  /// 大小为 `to_w x to_h` 的区域
  pub fn new(
    from: (u32, u32),
    to: (u32, u32),
    offset_x: i32,
    offset_y: i32,
  ) -> Result<Self, DetectorError> {
    if from.0 == 0 || from.1 == 0 {
      return Err(DetectorError::dimension(format!(
        "放置区域的源尺寸不能为零: {}x{}",
        from.0, from.1
      )));
    }
    Ok(Placement {
      scale_x: to.0 as f64 / from.0 as f64,
      scale_y: to.1 as f64 / from.1 as f64,
      offset_x: offset_x as f64,
      offset_y: offset_y as f64,
    })
  }

  pub fn identity() -> Self {
    Placement {
      scale_x: 1.0,
      scale_y: 1.0,
      offset_x: 0.0,
      offset_y: 0.0,
    }
  }

  pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
    (
      (x as f64 * self.scale_x + self.offset_x) as f32,
      (y as f64 * self.scale_y + self.offset_y) as f32,
    )
  }

  pub fn invert(&self, x: f32, y: f32) -> (f32, f32) {
    (
      ((x as f64 - self.offset_x) / self.scale_x) as f32,
      ((y as f64 - self.offset_y) / self.scale_y) as f32,
    )
  }

  pub fn apply_box(&self, bbox: &BBox) -> BBox {
    bbox.map_corners(|x, y| self.apply(x, y))
  }
}

/// 按信箱变换缩放图像，并转为归一化的平面（CHW）浮点张量
pub fn letterbox_image<P>(
  image: &ImageBuffer<P, Vec<u8>>,
  transform: &LetterboxTransform,
) -> Result<InputTensor, DetectorError>
where
  P: Pixel<Subpixel = u8> + 'static,
{
  if image.dimensions() != transform.original_dims() {
    return Err(DetectorError::dimension(format!(
      "图像尺寸 {:?} 与信箱变换的原图尺寸 {:?} 不一致",
      image.dimensions(),
      transform.original_dims()
    )));
  }

  let (new_w, new_h) = transform.resized_dims();
  let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);

  let channels = P::CHANNEL_COUNT as usize;
  let (net_w, net_h) = transform.network_dims();
  let plane = net_w as usize * net_h as usize;
  let pad_x = transform.pad_x as usize;
  let pad_y = transform.pad_y as usize;

  let mut data = vec![LETTERBOX_FILL; channels * plane];
  for (x, y, pixel) in resized.enumerate_pixels() {
    let offset = (y as usize + pad_y) * net_w as usize + x as usize + pad_x;
    for (c, value) in pixel.channels().iter().enumerate() {
      data[c * plane + offset] = *value as f32 / 255.0;
    }
  }

  InputTensor::new(
    InputDims {
      width: net_w,
      height: net_h,
      channels: channels as u32,
    },
    data,
  )
}
