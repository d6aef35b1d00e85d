// 该文件是 Yuanjing （远景） 项目的一部分。
// src/output.rs - 输出定义
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

use image::RgbImage;
use thiserror::Error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, model::Network, pipeline::DetectionPipeline};

/// 把一帧的检测结果送到某处。`frame` 为原图，检测框已由 `compute_boxes` 算好。
pub trait Render<N: Network> {
  type Error;
  fn render_result(
    &mut self,
    frame: &RgbImage,
    pipeline: &DetectionPipeline<N>,
  ) -> Result<(), Self::Error>;
}

mod draw;
pub use self::draw::{Draw, DrawError};

mod serial;
pub use self::serial::{
  CollectEmitter, DetectionMessage, EmitError, JsonLinesEmitter, LineEmitter, SerialEmitter,
  SerialFormat, SerialOutput, SerialOutputError, TextEmitter,
};

#[cfg(feature = "save_image_file")]
mod save_image_file;
#[cfg(feature = "save_image_file")]
pub use self::save_image_file::{Layout, SaveImageFileError, SaveImageFileOutput};

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "save_image_file")]
  #[error("保存图像文件错误: {0}")]
  SaveImageFileError(#[from] SaveImageFileError),
  #[error("消息输出错误: {0}")]
  SerialOutputError(#[from] SerialOutputError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

pub enum OutputWrapper {
  #[cfg(feature = "save_image_file")]
  SaveImageFileOutput(SaveImageFileOutput),
  SerialOutput(SerialOutput),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      #[cfg(feature = "save_image_file")]
      SaveImageFileOutput::SCHEME => {
        let output = SaveImageFileOutput::from_url(url)?;
        Ok(OutputWrapper::SaveImageFileOutput(output))
      }
      SerialOutput::SCHEME => {
        let output = SerialOutput::from_url(url)?;
        Ok(OutputWrapper::SerialOutput(output))
      }
      other => Err(OutputError::SchemeMismatch(other.to_string())),
    }
  }
}

impl OutputWrapper {
  /// 替换图像输出使用的绘制器
  pub fn with_draw(self, draw: Draw) -> Self {
    match self {
      #[cfg(feature = "save_image_file")]
      OutputWrapper::SaveImageFileOutput(output) => {
        OutputWrapper::SaveImageFileOutput(output.with_draw(draw))
      }
      other => other,
    }
  }
}

impl<N: Network> Render<N> for OutputWrapper {
  type Error = OutputError;

  fn render_result(
    &mut self,
    frame: &RgbImage,
    pipeline: &DetectionPipeline<N>,
  ) -> Result<(), Self::Error> {
    match self {
      #[cfg(feature = "save_image_file")]
      OutputWrapper::SaveImageFileOutput(output) => output
        .render_result(frame, pipeline)
        .map_err(OutputError::from),
      OutputWrapper::SerialOutput(output) => output
        .render_result(frame, pipeline)
        .map_err(OutputError::from),
    }
  }
}

/// 依次交给每个输出
impl<N: Network, O: Render<N>> Render<N> for Vec<O> {
  type Error = O::Error;

  fn render_result(
    &mut self,
    frame: &RgbImage,
    pipeline: &DetectionPipeline<N>,
  ) -> Result<(), Self::Error> {
    for output in self.iter_mut() {
      output.render_result(frame, pipeline)?;
    }
    Ok(())
  }
}
