// 该文件是 Yuanjing （远景） 项目的一部分。
// src/error.rs - 错误类型定义
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

use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::config::ConfigError;

/// 模型生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
  /// 后台线程正在加载模型
  Loading,
  /// 模型已就绪，可以推理
  Ready,
  /// 加载失败（终止状态）
  Failed,
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      LifecycleState::Loading => "加载中",
      LifecycleState::Ready => "就绪",
      LifecycleState::Failed => "失败",
    };
    f.write_str(name)
  }
}

/// 一次模型加载失败的原因，加载失败后保留供调用者查询
#[derive(Error, Debug, Clone)]
#[error("{0:#}")]
pub struct LoadFailedError(Arc<anyhow::Error>);

impl LoadFailedError {
  pub fn new(err: anyhow::Error) -> Self {
    LoadFailedError(Arc::new(err))
  }

  pub fn reason(&self) -> &anyhow::Error {
    &self.0
  }
}

#[derive(Error, Debug)]
pub enum DetectorError {
  /// 需要模型的操作在非就绪状态下被调用，稍后重试即可
  #[error("模型尚未就绪（当前状态: {state}）")]
  NotReady { state: LifecycleState },
  #[error("模型加载失败: {0}")]
  LoadFailed(#[from] LoadFailedError),
  /// 调用顺序错误，属于编程错误
  #[error("调用顺序错误: {0}")]
  State(String),
  #[error("维度不匹配: {0}")]
  Dimension(String),
  #[error("网络推理错误: {0}")]
  Network(#[source] anyhow::Error),
  #[error("串口消息发送错误: {0}")]
  Emit(#[source] anyhow::Error),
  #[error("配置错误: {0}")]
  Config(#[from] ConfigError),
}

impl DetectorError {
  pub fn dimension(msg: impl Into<String>) -> Self {
    DetectorError::Dimension(msg.into())
  }

  pub fn state(msg: impl Into<String>) -> Self {
    DetectorError::State(msg.into())
  }

  /// 是否可以在下一帧重试
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      DetectorError::NotReady {
        state: LifecycleState::Loading
      }
    )
  }
}
