// 该文件是 Yuanjing （远景） 项目的一部分。
// src/output/serial.rs - 检测结果文本消息
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
  fs::File,
  io::{BufWriter, Write},
  path::Path,
};

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  error::DetectorError,
  geometry::BBox,
  model::Network,
  output::Render,
  pipeline::{Detection, DetectionPipeline},
};

/// 一条检测消息，坐标为原图像素，(x, y) 为左上角
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionMessage<'a> {
  pub label: &'a str,
  pub confidence: f32,
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

impl<'a> DetectionMessage<'a> {
  pub fn new(detection: &'a Detection, bbox: &BBox) -> Self {
    DetectionMessage {
      label: &detection.label,
      confidence: detection.confidence,
      x: bbox.x_min,
      y: bbox.y_min,
      width: bbox.width(),
      height: bbox.height(),
    }
  }
}

/// 外部消息发送端，每次调用发送一条消息
pub trait SerialEmitter {
  type Error: std::error::Error + Send + Sync + 'static;

  fn emit(&mut self, message: &DetectionMessage<'_>) -> Result<(), Self::Error>;
}

#[derive(Error, Debug)]
pub enum EmitError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// 每行一个 JSON 对象
pub struct JsonLinesEmitter<W: Write> {
  writer: W,
}

impl<W: Write> JsonLinesEmitter<W> {
  pub fn new(writer: W) -> Self {
    JsonLinesEmitter { writer }
  }

  pub fn into_inner(self) -> W {
    self.writer
  }
}

impl<W: Write> SerialEmitter for JsonLinesEmitter<W> {
  type Error = EmitError;

  fn emit(&mut self, message: &DetectionMessage<'_>) -> Result<(), EmitError> {
    serde_json::to_writer(&mut self.writer, message)?;
    self.writer.write_all(b"\n")?;
    self.writer.flush()?;
    Ok(())
  }
}

/// 纯文本：`标签: 置信度% x y 宽 高`，坐标取整
pub struct TextEmitter<W: Write> {
  writer: W,
}

impl<W: Write> TextEmitter<W> {
  pub fn new(writer: W) -> Self {
    TextEmitter { writer }
  }

  pub fn into_inner(self) -> W {
    self.writer
  }
}

impl<W: Write> SerialEmitter for TextEmitter<W> {
  type Error = EmitError;

  fn emit(&mut self, message: &DetectionMessage<'_>) -> Result<(), EmitError> {
    writeln!(
      self.writer,
      "{}: {:.1}% {:.0} {:.0} {:.0} {:.0}",
      message.label,
      message.confidence * 100.0,
      message.x,
      message.y,
      message.width,
      message.height
    )?;
    self.writer.flush()?;
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialFormat {
  Text,
  Json,
}

impl std::str::FromStr for SerialFormat {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "text" => Ok(SerialFormat::Text),
      "json" => Ok(SerialFormat::Json),
      other => Err(other.to_string()),
    }
  }
}

/// 按格式选择的发送端
pub enum LineEmitter<W: Write> {
  Text(TextEmitter<W>),
  Json(JsonLinesEmitter<W>),
}

impl<W: Write> LineEmitter<W> {
  pub fn new(format: SerialFormat, writer: W) -> Self {
    match format {
      SerialFormat::Text => LineEmitter::Text(TextEmitter::new(writer)),
      SerialFormat::Json => LineEmitter::Json(JsonLinesEmitter::new(writer)),
    }
  }
}

impl<W: Write> SerialEmitter for LineEmitter<W> {
  type Error = EmitError;

  fn emit(&mut self, message: &DetectionMessage<'_>) -> Result<(), EmitError> {
    match self {
      LineEmitter::Text(emitter) => emitter.emit(message),
      LineEmitter::Json(emitter) => emitter.emit(message),
    }
  }
}

#[derive(Error, Debug)]
pub enum SerialOutputError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("未知的消息格式: {0}")]
  InvalidFormat(String),
  #[error("未知的输出目标: {0}")]
  InvalidTarget(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("检测器错误: {0}")]
  DetectorError(#[from] DetectorError),
}

/// 把检测消息逐行写到标准输出或文件
///
/// `serial://stdout?format=text`，`serial:///path/to/log.jsonl?format=json`
pub struct SerialOutput {
  emitter: LineEmitter<Box<dyn Write + Send>>,
}

impl SerialOutput {
  pub fn new(format: SerialFormat, writer: Box<dyn Write + Send>) -> Self {
    SerialOutput {
      emitter: LineEmitter::new(format, writer),
    }
  }
}

impl FromUrlWithScheme for SerialOutput {
  const SCHEME: &'static str = "serial";
}

impl FromUrl for SerialOutput {
  type Error = SerialOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(SerialOutputError::SchemeMismatch(format!(
        "期望输出方式 '{}', 实际输出方式 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let mut format = SerialFormat::Text;
    for (key, value) in url.query_pairs() {
      if key == "format" {
        format = value.parse().map_err(SerialOutputError::InvalidFormat)?;
      }
    }

    let path = url.path();
    let writer: Box<dyn Write + Send> = if path.is_empty() || path == "/" {
      match url.host_str() {
        None | Some("") | Some("stdout") => {}
        Some(host) => return Err(SerialOutputError::InvalidTarget(host.to_string())),
      }
      debug!("检测消息输出到标准输出");
      Box::new(std::io::stdout())
    } else {
      if let Some(parent) = Path::new(path).parent()
        && !parent.as_os_str().is_empty()
      {
        std::fs::create_dir_all(parent)?;
      }
      debug!("检测消息输出到文件: {}", path);
      Box::new(BufWriter::new(File::create(path)?))
    };

    Ok(SerialOutput::new(format, writer))
  }
}

impl<N: Network> Render<N> for SerialOutput {
  type Error = SerialOutputError;

  fn render_result(
    &mut self,
    frame: &RgbImage,
    pipeline: &DetectionPipeline<N>,
  ) -> Result<(), Self::Error> {
    pipeline.send_serial(&mut self.emitter, frame.width(), frame.height())?;
    Ok(())
  }
}

/// 把消息收集在内存中
#[derive(Debug, Default, Clone)]
pub struct CollectEmitter {
  pub messages: Vec<(String, f32, BBox)>,
}

impl SerialEmitter for CollectEmitter {
  type Error = std::convert::Infallible;

  fn emit(&mut self, message: &DetectionMessage<'_>) -> Result<(), Self::Error> {
    self.messages.push((
      message.label.to_string(),
      message.confidence,
      BBox::new(
        message.x,
        message.y,
        message.x + message.width,
        message.y + message.height,
      ),
    ));
    Ok(())
  }
}
