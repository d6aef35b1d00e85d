// 该文件是 Yuanjing （远景） 项目的一部分。
// src/output/draw.rs - 检测结果可视化
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

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use thiserror::Error;
use tracing::info;

use crate::{geometry::BBox, pipeline::Detection};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_TEXT_HEIGHT: i32 = 20;
const LABEL_CHAR_WIDTH: f32 = 9.0; // 没有字体时每字符的估计宽度
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const BOX_THICKNESS: i32 = 2;
const PALETTE_SIZE: usize = 80;

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("无效的字体文件: {0}")]
  InvalidFont(#[from] ab_glyph::InvalidFont),
}

/// 在图像上绘制检测框与标签
///
/// 没有字体时只绘制框和标签底色。
#[derive(Clone)]
pub struct Draw {
  font: Option<FontArc>,
  font_size: f32,
  label_text_height: i32,
  label_char_width: f32,
  label_text_vertical_padding: i32,
  thickness: i32,
  colors: Vec<Rgb<u8>>,
}

impl Default for Draw {
  fn default() -> Self {
    // 按类别均匀取色相
    let colors = (0..PALETTE_SIZE)
      .map(|i| {
        let hue = (i as f32 / PALETTE_SIZE as f32) * 360.0;
        hsv_to_rgb(hue, 0.8, 0.9)
      })
      .collect();

    Draw {
      font: None,
      font_size: LABEL_FONT_SIZE,
      label_text_height: LABEL_TEXT_HEIGHT,
      label_char_width: LABEL_CHAR_WIDTH,
      label_text_vertical_padding: LABEL_TEXT_VERTICAL_PADDING,
      thickness: BOX_THICKNESS,
      colors,
    }
  }
}

impl Draw {
  pub fn with_font(mut self, font: FontArc) -> Self {
    self.font = Some(font);
    self
  }

  pub fn with_font_file(self, path: impl AsRef<Path>) -> Result<Self, DrawError> {
    let data = std::fs::read(path.as_ref())?;
    let font = FontArc::try_from_vec(data)?;
    info!("加载标签字体: {}", path.as_ref().display());
    Ok(self.with_font(font))
  }

  pub fn with_thickness(mut self, thickness: i32) -> Self {
    self.thickness = thickness.max(1);
    self
  }

  pub fn color_for(&self, class_index: usize) -> Rgb<u8> {
    self.colors[class_index % self.colors.len()]
  }

  /// `bbox` 已经在目标图像坐标中，超出图像的部分被裁掉
  pub fn draw_detection(&self, image: &mut RgbImage, bbox: &BBox, detection: &Detection) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    let x_min = (bbox.x_min.floor() as i32).clamp(0, w - 1);
    let y_min = (bbox.y_min.floor() as i32).clamp(0, h - 1);
    let x_max = (bbox.x_max.ceil() as i32).clamp(0, w - 1);
    let y_max = (bbox.y_max.ceil() as i32).clamp(0, h - 1);
    if x_min >= x_max || y_min >= y_max {
      return;
    }

    let color = self.color_for(detection.class_index);

    // 由外向内加粗边框
    for t in 0..self.thickness {
      let rect_w = x_max - x_min + 1 - 2 * t;
      let rect_h = y_max - y_min + 1 - 2 * t;
      if rect_w <= 0 || rect_h <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(rect_w as u32, rect_h as u32);
      draw_hollow_rect_mut(image, rect, color);
    }

    let label = format!("{} {:.2}", detection.label, detection.confidence);
    self.draw_label(image, &label, x_min, y_min, color);
  }

  fn draw_label(&self, image: &mut RgbImage, label: &str, x: i32, y: i32, color: Rgb<u8>) {
    let scale = PxScale::from(self.font_size);
    let text_width = match &self.font {
      Some(font) => text_size(scale, font, label).0 as i32,
      None => (label.chars().count() as f32 * self.label_char_width) as i32,
    };

    // 标签放在边框上方，放不下时贴着图像顶部
    let label_y = (y - self.label_text_height).max(0);
    let label_width = text_width.min(image.width() as i32 - x);
    let label_height = self.label_text_height.min(image.height() as i32 - label_y);
    if label_width <= 0 || label_height <= 0 {
      return;
    }

    let rect = Rect::at(x, label_y).of_size(label_width as u32, label_height as u32);
    draw_filled_rect_mut(image, rect, color);

    if let Some(font) = &self.font {
      draw_text_mut(
        image,
        Rgb([255u8, 255u8, 255u8]),
        x,
        label_y + self.label_text_vertical_padding,
        scale,
        font,
        label,
      );
    }
  }
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = if h < 60.0 {
    (c, x, 0.0)
  } else if h < 120.0 {
    (x, c, 0.0)
  } else if h < 180.0 {
    (0.0, c, x)
  } else if h < 240.0 {
    (0.0, x, c)
  } else if h < 300.0 {
    (x, 0.0, c)
  } else {
    (c, 0.0, x)
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  fn detection(class_index: usize) -> Detection {
    Detection {
      class_index,
      label: Arc::from("person"),
      confidence: 0.87,
      bbox: BBox::new(0.0, 0.0, 0.0, 0.0),
    }
  }

  #[test]
  fn box_edges_are_painted() {
    let draw = Draw::default();
    let mut image = RgbImage::new(100, 100);
    let det = detection(3);
    draw.draw_detection(&mut image, &BBox::new(20.0, 40.0, 60.0, 80.0), &det);

    let color = draw.color_for(3);
    assert_eq!(*image.get_pixel(20, 60), color);
    assert_eq!(*image.get_pixel(21, 60), color);
    assert_eq!(*image.get_pixel(60, 60), color);
    assert_eq!(*image.get_pixel(40, 80), color);
    // 框内部不变
    assert_eq!(*image.get_pixel(40, 60), Rgb([0, 0, 0]));
    // 标签底色在框上方
    assert_eq!(*image.get_pixel(22, 30), color);
  }

  #[test]
  fn boxes_outside_the_image_are_clipped() {
    let draw = Draw::default();
    let mut image = RgbImage::new(50, 50);
    let det = detection(0);
    draw.draw_detection(&mut image, &BBox::new(-30.0, -30.0, 200.0, 200.0), &det);
    assert_eq!(*image.get_pixel(49, 25), draw.color_for(0));

    let mut untouched = RgbImage::new(50, 50);
    draw.draw_detection(&mut untouched, &BBox::new(80.0, 80.0, 90.0, 90.0), &det);
    assert!(untouched.pixels().all(|p| *p == Rgb([0, 0, 0])));
  }

  #[test]
  fn palette_wraps_around() {
    let draw = Draw::default();
    assert_eq!(draw.color_for(1), draw.color_for(1 + PALETTE_SIZE));
    assert_ne!(draw.color_for(0), draw.color_for(40));
  }

  #[test]
  fn missing_font_file_is_an_io_error() {
    let result = Draw::default().with_font_file("/nonexistent/font.ttf");
    assert!(matches!(result, Err(DrawError::IoError(_))));
  }
}
