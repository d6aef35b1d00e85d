// 该文件是 Yuanjing （远景） 项目的一部分。
// src/config.rs - 检测器参数配置
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

use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

const DEFAULT_DATAROOT: &str = "share/darknet/yolo";
const DEFAULT_DATACFG: &str = "cfg/coco.data";
const DEFAULT_CFGFILE: &str = "cfg/yolov3-tiny.cfg";
const DEFAULT_WEIGHTFILE: &str = "weights/yolov3-tiny.weights";
const DEFAULT_NMS: f32 = 45.0;
const DEFAULT_THRESH: f32 = 24.0;
const DEFAULT_HIERTHRESH: f32 = 50.0;
const DEFAULT_THREADS: usize = 6;
const MAX_THREADS: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
  #[error("URI 方案不匹配: 期望 '{expected}', 实际 '{actual}'")]
  SchemeMismatch {
    expected: &'static str,
    actual: String,
  },
  #[error("参数 {key} 的值 '{value}' 无法解析")]
  InvalidValue { key: String, value: String },
  #[error("参数 {key} 超出范围 [{min}, {max}]: {value}")]
  OutOfRange {
    key: &'static str,
    value: f64,
    min: f64,
    max: f64,
  },
  #[error("未知参数: {0}")]
  UnknownKey(String),
}

/// 检测器参数，阈值均为百分比
#[derive(Debug, Clone, PartialEq)]
pub struct YoloConfig {
  /// 数据、配置与权重文件的根目录
  pub dataroot: PathBuf,
  /// 数据配置文件（相对路径时相对于 dataroot）
  pub datacfg: PathBuf,
  /// 网络结构配置文件
  pub cfgfile: PathBuf,
  /// 网络权重文件
  pub weightfile: PathBuf,
  /// 类别名称文件，为空时由数据配置文件决定
  pub namefile: Option<PathBuf>,
  /// 非极大值抑制 IoU 阈值 (0 - 100)
  pub nms: f32,
  /// 检测置信度阈值 (0 - 100)
  pub thresh: f32,
  /// 树状类别的置信度阈值 (0 - 100)
  pub hierthresh: f32,
  /// 前向推理线程数 (1 - 1024)
  pub threads: usize,
}

impl Default for YoloConfig {
  fn default() -> Self {
    YoloConfig {
      dataroot: PathBuf::from(DEFAULT_DATAROOT),
      datacfg: PathBuf::from(DEFAULT_DATACFG),
      cfgfile: PathBuf::from(DEFAULT_CFGFILE),
      weightfile: PathBuf::from(DEFAULT_WEIGHTFILE),
      namefile: None,
      nms: DEFAULT_NMS,
      thresh: DEFAULT_THRESH,
      hierthresh: DEFAULT_HIERTHRESH,
      threads: DEFAULT_THREADS,
    }
  }
}

impl YoloConfig {
  pub fn validate(&self) -> Result<(), ConfigError> {
    check_percent("nms", self.nms)?;
    check_percent("thresh", self.thresh)?;
    check_percent("hierthresh", self.hierthresh)?;
    if !(1..=MAX_THREADS).contains(&self.threads) {
      return Err(ConfigError::OutOfRange {
        key: "threads",
        value: self.threads as f64,
        min: 1.0,
        max: MAX_THREADS as f64,
      });
    }
    Ok(())
  }

  fn resolve(&self, path: &Path) -> PathBuf {
    if path.is_absolute() {
      path.to_path_buf()
    } else {
      self.dataroot.join(path)
    }
  }

  pub fn resolve_datacfg(&self) -> PathBuf {
    self.resolve(&self.datacfg)
  }

  pub fn resolve_cfgfile(&self) -> PathBuf {
    self.resolve(&self.cfgfile)
  }

  pub fn resolve_weightfile(&self) -> PathBuf {
    self.resolve(&self.weightfile)
  }

  pub fn resolve_namefile(&self) -> Option<PathBuf> {
    self.namefile.as_deref().map(|path| self.resolve(path))
  }

  /// 转为 [0, 1] 区间的阈值
  pub fn thresholds(&self) -> Thresholds {
    Thresholds {
      nms: self.nms / 100.0,
      thresh: self.thresh / 100.0,
      hier_thresh: self.hierthresh / 100.0,
    }
  }
}

fn check_percent(key: &'static str, value: f32) -> Result<(), ConfigError> {
  if (0.0..=100.0).contains(&value) {
    Ok(())
  } else {
    Err(ConfigError::OutOfRange {
      key,
      value: value as f64,
      min: 0.0,
      max: 100.0,
    })
  }
}

/// 后处理阈值，[0, 1] 区间
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
  pub nms: f32,
  pub thresh: f32,
  pub hier_thresh: f32,
}

impl Default for Thresholds {
  fn default() -> Self {
    YoloConfig::default().thresholds()
  }
}

impl FromUrlWithScheme for YoloConfig {
  const SCHEME: &'static str = "yolo";
}

impl FromUrl for YoloConfig {
  type Error = ConfigError;

  /// `yolo:///dataroot?cfg=..&weights=..&names=..&datacfg=..&nms=45&thresh=24&hierthresh=50&threads=6`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ConfigError::SchemeMismatch {
        expected: Self::SCHEME,
        actual: url.scheme().to_string(),
      });
    }

    let mut config = YoloConfig::default();
    if !url.path().is_empty() && url.path() != "/" {
      config.dataroot = PathBuf::from(url.path());
    }

    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "datacfg" => config.datacfg = PathBuf::from(value.as_ref()),
        "cfg" => config.cfgfile = PathBuf::from(value.as_ref()),
        "weights" => config.weightfile = PathBuf::from(value.as_ref()),
        "names" if value.is_empty() => config.namefile = None,
        "names" => config.namefile = Some(PathBuf::from(value.as_ref())),
        "nms" => config.nms = parse_value(&key, &value)?,
        "thresh" => config.thresh = parse_value(&key, &value)?,
        "hierthresh" => config.hierthresh = parse_value(&key, &value)?,
        "threads" => config.threads = parse_value(&key, &value)?,
        other => return Err(ConfigError::UnknownKey(other.to_string())),
      }
    }

    config.validate()?;
    debug!("检测器配置: {:?}", config);
    Ok(config)
  }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
  value.parse().map_err(|_| ConfigError::InvalidValue {
    key: key.to_string(),
    value: value.to_string(),
  })
}
