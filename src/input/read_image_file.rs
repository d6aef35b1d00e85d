// 该文件是 Yuanjing （远景） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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
  collections::VecDeque,
  path::{Path, PathBuf},
};

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配: 期望 '{expected}', 实际 '{actual}'")]
  SchemeMismatch {
    expected: &'static str,
    actual: String,
  },
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("参数 {key} 的值 '{value}' 无效")]
  InvalidValue { key: String, value: String },
  #[error("目录中没有图像文件: {0}")]
  EmptyDirectory(PathBuf),
}

/// 从单个图像文件或一个目录中的全部图像依次读取帧
///
/// `image:///path/to/a.png?repeat=3`：同一张图重复 3 次。
/// `image:///path/to/dir`：按文件名顺序读取目录中的 png/jpg 图像。
#[derive(Debug)]
pub struct ImageFileInput {
  files: VecDeque<PathBuf>,
  current: Option<(PathBuf, usize)>,
  repeat: usize,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemeMismatch {
        expected: Self::SCHEME,
        actual: url.scheme().to_string(),
      });
    }

    let mut repeat = 1;
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "repeat" => {
          repeat = value
            .parse()
            .ok()
            .filter(|&n: &usize| n > 0)
            .ok_or_else(|| ImageFileInputError::InvalidValue {
              key: key.to_string(),
              value: value.to_string(),
            })?
        }
        other => {
          return Err(ImageFileInputError::InvalidValue {
            key: other.to_string(),
            value: value.to_string(),
          });
        }
      }
    }

    Self::open(url.path(), repeat)
  }
}

impl ImageFileInput {
  pub fn open(path: impl AsRef<Path>, repeat: usize) -> Result<Self, ImageFileInputError> {
    let path = path.as_ref();
    let files = if path.is_dir() {
      let mut files = std::fs::read_dir(path)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| is_image_file(p))
        .collect::<Vec<_>>();
      files.sort();
      if files.is_empty() {
        return Err(ImageFileInputError::EmptyDirectory(path.to_path_buf()));
      }
      files
    } else {
      // 提前检查文件能否打开
      ImageReader::open(path)?;
      vec![path.to_path_buf()]
    };

    debug!("图像输入: {} 个文件，每个重复 {} 次", files.len(), repeat);
    Ok(ImageFileInput {
      files: files.into(),
      current: None,
      repeat: repeat.max(1),
    })
  }

  fn load(path: &Path) -> Result<RgbImage, ImageFileInputError> {
    let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    Ok(image.into_rgb8())
  }
}

fn is_image_file(path: &Path) -> bool {
  path.is_file()
    && path
      .extension()
      .and_then(|e| e.to_str())
      .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

impl Iterator for ImageFileInput {
  type Item = RgbImage;

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      let (path, remaining) = match self.current.take() {
        Some((path, remaining)) if remaining > 0 => (path, remaining),
        _ => (self.files.pop_front()?, self.repeat),
      };

      match Self::load(&path) {
        Ok(image) => {
          debug!("读取图像: {}", path.display());
          self.current = Some((path, remaining - 1));
          return Some(image);
        }
        Err(e) => {
          error!("读取图像 {} 失败: {}", path.display(), e);
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn write_image(path: &Path, width: u32, height: u32) {
    RgbImage::from_pixel(width, height, image::Rgb([10, 20, 30]))
      .save(path)
      .unwrap();
  }

  #[test]
  fn single_file_repeats() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.png");
    write_image(&path, 8, 6);

    let url = Url::parse(&format!("image://{}?repeat=3", path.display())).unwrap();
    let frames: Vec<_> = ImageFileInput::from_url(&url).unwrap().collect();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].dimensions(), (8, 6));
  }

  #[test]
  fn directory_is_read_in_name_order() {
    let dir = tempfile::tempdir().unwrap();
    write_image(&dir.path().join("b.png"), 4, 4);
    write_image(&dir.path().join("a.png"), 2, 2);
    std::fs::write(dir.path().join("notes.txt"), "skip").unwrap();

    let frames: Vec<_> = ImageFileInput::open(dir.path(), 1).unwrap().collect();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].dimensions(), (2, 2));
    assert_eq!(frames[1].dimensions(), (4, 4));
  }

  #[test]
  fn bad_urls_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
      ImageFileInput::open(dir.path(), 1),
      Err(ImageFileInputError::EmptyDirectory(_))
    ));

    let zero = Url::parse("image:///tmp/a.png?repeat=0").unwrap();
    assert!(matches!(
      ImageFileInput::from_url(&zero),
      Err(ImageFileInputError::InvalidValue { .. })
    ));

    let wrong = Url::parse("yolo:///tmp/a.png").unwrap();
    assert!(matches!(
      ImageFileInput::from_url(&wrong),
      Err(ImageFileInputError::SchemeMismatch { .. })
    ));

    let missing = Url::parse("image:///nonexistent/a.png").unwrap();
    assert!(matches!(
      ImageFileInput::from_url(&missing),
      Err(ImageFileInputError::IoError(_))
    ));
  }
}
