// 该文件是 Yuanjing （远景） 项目的一部分。
// src/output/save_image_file.rs - 保存图像文件
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

use std::path::{Path, PathBuf};

use image::{RgbImage, imageops};
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  error::DetectorError,
  model::Network,
  output::{Draw, Render},
  pipeline::DetectionPipeline,
};

/// 输出图像的排布
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
  /// 直接在原图上绘制
  #[default]
  Overlay,
  /// 左边原图，右边绘制了检测结果的副本
  SideBySide,
}

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("检测器错误: {0}")]
  DetectorError(#[from] DetectorError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("参数 {key} 的值 '{value}' 无效")]
  InvalidValue { key: String, value: String },
}

/// `image:///path/out.png?layout=side-by-side&numbered`
///
/// 带 `numbered` 时每帧写入 `out_000001.png` 这样的独立文件，否则覆盖同一个文件。
pub struct SaveImageFileOutput {
  path: PathBuf,
  draw: Draw,
  layout: Layout,
  numbered: bool,
  frame_counter: u64,
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    let mut layout = Layout::Overlay;
    let mut numbered = false;
    for (key, value) in uri.query_pairs() {
      match (key.as_ref(), value.as_ref()) {
        ("layout", "overlay") => layout = Layout::Overlay,
        ("layout", "side-by-side") => layout = Layout::SideBySide,
        ("numbered", _) => numbered = true,
        (key, value) => {
          return Err(SaveImageFileError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
          });
        }
      }
    }

    Ok(SaveImageFileOutput {
      path: PathBuf::from(uri.path()),
      draw: Draw::default(),
      layout,
      numbered,
      frame_counter: 0,
    })
  }
}

impl SaveImageFileOutput {
  pub fn new(path: impl Into<PathBuf>, layout: Layout) -> Self {
    SaveImageFileOutput {
      path: path.into(),
      draw: Draw::default(),
      layout,
      numbered: false,
      frame_counter: 0,
    }
  }

  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = draw;
    self
  }

  pub fn layout(&self) -> Layout {
    self.layout
  }

  fn frame_path(&mut self) -> PathBuf {
    if !self.numbered {
      return self.path.clone();
    }

    self.frame_counter += 1;
    let stem = self
      .path
      .file_stem()
      .map(|s| s.to_string_lossy().into_owned())
      .unwrap_or_else(|| "frame".to_string());
    let extension = self
      .path
      .extension()
      .map(|s| s.to_string_lossy().into_owned())
      .unwrap_or_else(|| "png".to_string());
    self
      .path
      .with_file_name(format!("{}_{:06}.{}", stem, self.frame_counter, extension))
  }

  fn save_image(&mut self, image: &RgbImage) -> Result<(), SaveImageFileError> {
    let path = self.frame_path();
    if let Some(parent) = Path::new(&path).parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    image.save(&path)?;

    info!("保存图像到文件: {}", path.display());

    Ok(())
  }
}

impl<N: Network> Render<N> for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn render_result(
    &mut self,
    frame: &RgbImage,
    pipeline: &DetectionPipeline<N>,
  ) -> Result<(), Self::Error> {
    let (width, height) = frame.dimensions();
    let image = match self.layout {
      Layout::Overlay => {
        let mut canvas = frame.clone();
        pipeline.draw_detections_with(&self.draw, &mut canvas, width, height, 0, 0)?;
        canvas
      }
      Layout::SideBySide => {
        let mut canvas = RgbImage::new(width * 2, height);
        imageops::replace(&mut canvas, frame, 0, 0);
        imageops::replace(&mut canvas, frame, width as i64, 0);
        pipeline.draw_detections_with(&self.draw, &mut canvas, width, height, width as i32, 0)?;
        canvas
      }
    };
    self.save_image(&image)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn from_url_reads_layout() {
    let url = Url::parse("image:///tmp/out/result.png?layout=side-by-side&numbered").unwrap();
    let output = SaveImageFileOutput::from_url(&url).unwrap();
    assert_eq!(output.layout(), Layout::SideBySide);
    assert!(output.numbered);

    let bad = Url::parse("image:///tmp/out.png?layout=grid").unwrap();
    assert!(matches!(
      SaveImageFileOutput::from_url(&bad),
      Err(SaveImageFileError::InvalidValue { .. })
    ));

    let wrong = Url::parse("serial://stdout").unwrap();
    assert!(matches!(
      SaveImageFileOutput::from_url(&wrong),
      Err(SaveImageFileError::SchemeMismatch(_))
    ));
  }

  #[test]
  fn numbered_paths_count_up() {
    let mut output = SaveImageFileOutput::new("/tmp/out/result.png", Layout::Overlay);
    assert_eq!(output.frame_path(), PathBuf::from("/tmp/out/result.png"));

    output.numbered = true;
    assert_eq!(output.frame_path(), PathBuf::from("/tmp/out/result_000001.png"));
    assert_eq!(output.frame_path(), PathBuf::from("/tmp/out/result_000002.png"));
  }
}
