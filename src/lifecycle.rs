// 该文件是 Yuanjing （远景） 项目的一部分。
// src/lifecycle.rs - 模型异步加载与生命周期
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
  panic::{self, AssertUnwindSafe},
  sync::{
    Arc,
    atomic::{AtomicBool, AtomicU8, Ordering},
    mpsc::{self, Receiver, TryRecvError},
  },
  thread::{self, JoinHandle},
};

use tracing::{debug, error, info, warn};

use crate::{
  config::YoloConfig,
  error::{DetectorError, LifecycleState, LoadFailedError},
  model::{ModelHandle, ModelProvider, Network},
};

const STATE_LOADING: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_FAILED: u8 = 2;

const LOADER_THREAD_NAME: &str = "yuanjing-loader";

/// 无锁的就绪状态视图，可在任意线程中查询
#[derive(Debug, Clone)]
pub struct Readiness(Arc<AtomicU8>);

impl Readiness {
  fn new(state: u8) -> Self {
    Readiness(Arc::new(AtomicU8::new(state)))
  }

  pub fn state(&self) -> LifecycleState {
    match self.0.load(Ordering::Acquire) {
      STATE_READY => LifecycleState::Ready,
      STATE_FAILED => LifecycleState::Failed,
      _ => LifecycleState::Loading,
    }
  }

  pub fn is_ready(&self) -> bool {
    self.0.load(Ordering::Acquire) == STATE_READY
  }

  fn set(&self, state: u8) {
    self.0.store(state, Ordering::Release);
  }
}

/// 加载取消标志，模型提供者应在耗时步骤之间检查
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::Acquire)
  }

  fn cancel(&self) {
    self.0.store(true, Ordering::Release);
  }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
  if let Some(msg) = payload.downcast_ref::<&str>() {
    *msg
  } else if let Some(msg) = payload.downcast_ref::<String>() {
    msg.as_str()
  } else {
    "未知原因"
  }
}

type LoadResult<N> = Result<ModelHandle<N>, LoadFailedError>;

/// 模型生命周期：Loading -> Ready 或 Loading -> Failed，终止状态不再变化
///
/// 加载在后台线程中进行，就绪标志由加载线程写入一次。
/// 需要模型的操作不会等待加载完成，而是立即返回 `NotReady`。
pub struct ModelLifecycle<N: Network> {
  readiness: Readiness,
  cancel: CancelToken,
  receiver: Option<Receiver<LoadResult<N>>>,
  worker: Option<JoinHandle<()>>,
  model: Option<ModelHandle<N>>,
  failure: Option<LoadFailedError>,
}

impl<N: Network> ModelLifecycle<N> {
  /// 启动后台加载并立即返回
  pub fn begin_load<P>(provider: P, config: YoloConfig) -> Self
  where
    P: ModelProvider<Network = N>,
  {
    let readiness = Readiness::new(STATE_LOADING);
    let cancel = CancelToken::default();
    let (sender, receiver) = mpsc::sync_channel::<LoadResult<N>>(1);

    let thread_state = readiness.clone();
    let thread_cancel = cancel.clone();
    let spawned = thread::Builder::new()
      .name(LOADER_THREAD_NAME.to_string())
      .spawn(move || {
        info!("开始加载模型: {}", config.resolve_cfgfile().display());
        let result = if thread_cancel.is_cancelled() {
          Err(LoadFailedError::new(anyhow::anyhow!("加载在开始前被取消")))
        } else {
          match panic::catch_unwind(AssertUnwindSafe(|| provider.load(&config, &thread_cancel))) {
            Ok(loaded) => loaded.map_err(|e| LoadFailedError::new(anyhow::Error::new(e))),
            Err(payload) => Err(LoadFailedError::new(anyhow::anyhow!(
              "模型提供者崩溃: {}",
              panic_message(payload.as_ref())
            ))),
          }
        };

        let next = match &result {
          Ok(handle) => {
            info!("模型加载完成: {:?}", handle.in_dims());
            STATE_READY
          }
          Err(e) => {
            error!("模型加载失败: {}", e);
            STATE_FAILED
          }
        };

        // 先交付结果再发布状态，保证读到 Ready 时结果已在通道中
        if sender.send(result).is_err() {
          debug!("生命周期已销毁，丢弃加载结果");
        }
        thread_state.set(next);
      });

    match spawned {
      Ok(worker) => ModelLifecycle {
        readiness,
        cancel,
        receiver: Some(receiver),
        worker: Some(worker),
        model: None,
        failure: None,
      },
      Err(e) => {
        error!("无法创建加载线程: {}", e);
        readiness.set(STATE_FAILED);
        ModelLifecycle {
          readiness,
          cancel,
          receiver: None,
          worker: None,
          model: None,
          failure: Some(LoadFailedError::new(
            anyhow::Error::new(e).context("无法创建加载线程"),
          )),
        }
      }
    }
  }

  /// 直接使用已构造好的模型句柄，状态立即为 Ready
  pub fn from_handle(handle: ModelHandle<N>) -> Self {
    ModelLifecycle {
      readiness: Readiness::new(STATE_READY),
      cancel: CancelToken::default(),
      receiver: None,
      worker: None,
      model: Some(handle),
      failure: None,
    }
  }

  pub fn state(&self) -> LifecycleState {
    self.readiness.state()
  }

  pub fn is_ready(&self) -> bool {
    self.readiness.is_ready()
  }

  pub fn readiness(&self) -> Readiness {
    self.readiness.clone()
  }

  /// 非阻塞地查询状态；加载失败时返回失败原因
  pub fn poll(&mut self) -> Result<LifecycleState, DetectorError> {
    self.settle();
    match &self.failure {
      Some(failure) => Err(DetectorError::LoadFailed(failure.clone())),
      None => Ok(self.state()),
    }
  }

  /// 加载失败的原因（仅在 Failed 状态下存在）
  pub fn failure(&mut self) -> Option<&LoadFailedError> {
    self.settle();
    self.failure.as_ref()
  }

  pub fn model(&mut self) -> Result<&ModelHandle<N>, DetectorError> {
    self.settle();
    let state = self.state();
    self.model.as_ref().ok_or(DetectorError::NotReady { state })
  }

  pub fn model_mut(&mut self) -> Result<&mut ModelHandle<N>, DetectorError> {
    self.settle();
    let state = self.state();
    self.model.as_mut().ok_or(DetectorError::NotReady { state })
  }

  /// 终止状态下从通道取出加载结果，不会阻塞
  fn settle(&mut self) {
    let Some(receiver) = &self.receiver else {
      return;
    };

    let finished = self.worker.as_ref().is_some_and(JoinHandle::is_finished);
    if self.readiness.state() == LifecycleState::Loading && !finished {
      return;
    }

    match receiver.try_recv() {
      Ok(Ok(handle)) => {
        debug!("取得已加载的模型句柄");
        self.model = Some(handle);
      }
      Ok(Err(failure)) => {
        self.failure = Some(failure);
      }
      Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
        if !finished {
          // 状态已发布但线程尚未退出，下次再取
          return;
        }
        error!("加载线程异常退出");
        self.readiness.set(STATE_FAILED);
        self.failure = Some(LoadFailedError::new(anyhow::anyhow!("加载线程异常退出")));
      }
    }

    self.receiver = None;
    self.reap_worker();
  }

  fn reap_worker(&mut self) {
    if let Some(worker) = self.worker.take()
      && worker.join().is_err()
    {
      warn!("加载线程发生 panic");
    }
  }
}

impl<N: Network> Drop for ModelLifecycle<N> {
  /// 取消并等待加载线程结束后才释放模型
  fn drop(&mut self) {
    if self.worker.is_some() {
      debug!("销毁生命周期，等待加载线程结束");
      self.cancel.cancel();
      self.reap_worker();
    }
  }
}
