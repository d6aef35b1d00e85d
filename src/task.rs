// 该文件是 Yuanjing （远景） 项目的一部分。
// src/task.rs - 任务定义
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
  sync::mpsc::Receiver,
  thread,
  time::{Duration, Instant},
};

use image::RgbImage;
use tracing::{debug, info, warn};

use crate::{
  error::LifecycleState, model::Network, output::Render, pipeline::DetectionPipeline,
};

pub trait Task<I, N: Network, O>: Sized {
  type Error;
  fn run_task(
    self,
    input: I,
    pipeline: &mut DetectionPipeline<N>,
    output: &mut O,
  ) -> Result<(), Self::Error>;
}

/// 一帧的完整处理：推理、计算检测框、输出，返回前向推理耗时
fn process_frame<N, O>(
  frame: &RgbImage,
  pipeline: &mut DetectionPipeline<N>,
  output: &mut O,
) -> anyhow::Result<Duration>
where
  N: Network,
  O: Render<N>,
  O::Error: std::error::Error + Sync + Send + 'static,
{
  let (width, height) = frame.dimensions();
  let elapsed = pipeline.predict(frame)?;
  let count = pipeline.compute_boxes(width, height)?.len();
  debug!("检测到 {} 个物体", count);
  output.render_result(frame, pipeline)?;
  Ok(elapsed)
}

/// 等待模型加载完成后处理第一帧
#[derive(Debug)]
pub struct OneShotTask {
  poll_interval: Duration,
  timeout: Option<Duration>,
}

impl Default for OneShotTask {
  fn default() -> Self {
    OneShotTask {
      poll_interval: Duration::from_millis(20),
      timeout: None,
    }
  }
}

impl OneShotTask {
  pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
    self.poll_interval = poll_interval;
    self
  }

  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }

  fn wait_ready<N: Network>(&self, pipeline: &mut DetectionPipeline<N>) -> anyhow::Result<()> {
    let start = Instant::now();
    loop {
      if pipeline.lifecycle_mut().poll()? == LifecycleState::Ready {
        info!("模型加载完成，等待 {:.2?}", start.elapsed());
        return Ok(());
      }
      if let Some(timeout) = self.timeout
        && start.elapsed() >= timeout
      {
        anyhow::bail!("等待模型加载超时 ({:.2?})", timeout);
      }
      thread::sleep(self.poll_interval);
    }
  }
}

impl<I, N, O> Task<I, N, O> for OneShotTask
where
  I: Iterator<Item = RgbImage>,
  N: Network,
  O: Render<N>,
  O::Error: std::error::Error + Sync + Send + 'static,
{
  type Error = anyhow::Error;

  fn run_task(
    self,
    mut input: I,
    pipeline: &mut DetectionPipeline<N>,
    output: &mut O,
  ) -> Result<(), Self::Error> {
    info!("开始任务...");
    self.wait_ready(pipeline)?;
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;
    info!("输入帧获取成功，开始推理...");
    let now = Instant::now();
    let elapsed = process_frame(&frame, pipeline, output)?;
    info!(
      "推理完成，耗时: {:.2?}，含输出共 {:.2?}",
      elapsed,
      now.elapsed()
    );

    Ok(())
  }
}

/// 逐帧处理输入；模型仍在加载时跳过该帧，加载失败时结束任务
#[derive(Default, Debug)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
  stop: Option<Receiver<()>>,
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  /// 收到信号后在当前帧处理完时退出
  pub fn with_stop_signal(mut self, stop: Receiver<()>) -> Self {
    self.stop = Some(stop);
    self
  }
}

impl<I, N, O> Task<I, N, O> for ContinuousTask
where
  I: Iterator<Item = RgbImage>,
  N: Network,
  O: Render<N>,
  O::Error: std::error::Error + Sync + Send + 'static,
{
  type Error = anyhow::Error;

  fn run_task(
    self,
    input: I,
    pipeline: &mut DetectionPipeline<N>,
    output: &mut O,
  ) -> Result<(), Self::Error> {
    info!("开始任务...");

    let mut frame_index = 0usize;
    let mut skipped = 0usize;
    let mut timing = FrameTiming::default();
    for frame in input {
      frame_index = frame_index.wrapping_add(1);

      match pipeline.lifecycle_mut().poll()? {
        LifecycleState::Ready => {
          info!("处理第 {} 帧图像", frame_index);
          let now = Instant::now();
          let elapsed = process_frame(&frame, pipeline, output)?;
          info!("推理完成，耗时: {:.2?} / {:.2?}", elapsed, now.elapsed());
          timing.record(elapsed);
        }
        state => {
          skipped += 1;
          debug!("模型状态为 {}，跳过第 {} 帧", state, frame_index);
        }
      }

      if self.frame_number.is_some_and(|n| frame_index >= n) {
        info!("达到指定帧数 {}, 退出任务循环", frame_index);
        break;
      }
      if self.stop.as_ref().is_some_and(|rx| rx.try_recv().is_ok()) {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }

    if skipped > 0 {
      warn!("模型加载期间跳过了 {} 帧", skipped);
    }
    if let Some(average) = timing.average() {
      warn!("平均推理时间: {:.2?}（{} 帧）", average, timing.frames);
    }

    info!("任务完成，退出");
    Ok(())
  }
}

/// 累计推理耗时，只保存总和与帧数
#[derive(Debug, Default, Clone, Copy)]
struct FrameTiming {
  total: Duration,
  frames: u64,
}

impl FrameTiming {
  fn record(&mut self, elapsed: Duration) {
    self.total = self.total.saturating_add(elapsed);
    self.frames = self.frames.saturating_add(1);
  }

  fn average(&self) -> Option<Duration> {
    (self.frames > 0).then(|| Duration::from_secs_f64(self.total.as_secs_f64() / self.frames as f64))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn frame_timing_averages_without_keeping_samples() {
    let mut timing = FrameTiming::default();
    assert_eq!(timing.average(), None);

    timing.record(Duration::from_millis(10));
    timing.record(Duration::from_millis(30));
    assert_eq!(timing.frames, 2);
    let average = timing.average().unwrap();
    assert!((average.as_secs_f64() - 0.020).abs() < 1e-9);
  }

  #[test]
  fn frame_timing_counts_past_u32() {
    let mut timing = FrameTiming {
      total: Duration::from_secs(u64::from(u32::MAX)),
      frames: u64::from(u32::MAX),
    };
    timing.record(Duration::from_secs(1));
    assert_eq!(timing.frames, u64::from(u32::MAX) + 1);
    let average = timing.average().unwrap();
    assert!((average.as_secs_f64() - 1.0).abs() < 1e-6);
  }
}
