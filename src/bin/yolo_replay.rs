// 该文件是 Yuanjing （远景） 项目的一部分。
// src/bin/yolo_replay.rs - 使用录制的网络输出运行检测流水线
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

use std::{path::PathBuf, sync::mpsc, thread, time::Duration};

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use url::Url;

use yuanjing::{
  DetectionPipeline, FromUrl, YoloConfig,
  input::ImageFileInput,
  output::{Draw, OutputWrapper, SerialFormat, SerialOutput},
  replay::ReplayProvider,
  task::{ContinuousTask, OneShotTask, Task},
};

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Serial {
  None,
  Text,
  Json,
}

#[derive(ValueEnum, Debug, Clone, Copy, Default)]
enum Mode {
  /// 等待模型加载完成后只处理第一帧
  Oneshot,
  /// 逐帧处理，模型加载期间的帧被跳过
  #[default]
  Continuous,
}

/// Yuanjing 检测流水线参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// 检测器配置，如 yolo:///data/yolo?weights=recording.json&thresh=30
  #[arg(long, value_name = "CONFIG")]
  config: Url,
  /// 输入来源，如 image:///data/frames
  #[arg(long, value_name = "SOURCE")]
  input: Url,
  /// 输出，可多次指定，如 image:///tmp/out.png 或 serial://stdout?format=json
  #[arg(long, value_name = "OUTPUT")]
  output: Vec<Url>,
  /// 额外在标准输出打印检测消息
  #[arg(long, value_enum, default_value = "none")]
  serial: Serial,
  #[arg(long, value_enum, default_value = "continuous")]
  mode: Mode,
  #[arg(long, value_name = "FRAME_NUMBER")]
  frame_number: Option<usize>,
  /// 标签字体文件 (ttf/otf)
  #[arg(long, value_name = "FONT")]
  font: Option<PathBuf>,
  /// 单帧模式下等待模型加载的最长时间（秒）
  #[arg(long, value_name = "SECONDS")]
  timeout: Option<u64>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("检测器配置: {}", args.config);
  info!("输入来源: {}", args.input);

  let config = YoloConfig::from_url(&args.config)?;
  let input = ImageFileInput::from_url(&args.input)?;

  let draw = match &args.font {
    Some(font) => Draw::default().with_font_file(font)?,
    None => Draw::default(),
  };

  let mut outputs = Vec::with_capacity(args.output.len() + 1);
  for url in &args.output {
    info!("输出: {}", url);
    outputs.push(OutputWrapper::from_url(url)?.with_draw(draw.clone()));
  }
  let serial = match args.serial {
    Serial::None => None,
    Serial::Text => Some(SerialFormat::Text),
    Serial::Json => Some(SerialFormat::Json),
  };
  if let Some(format) = serial {
    outputs.push(OutputWrapper::SerialOutput(SerialOutput::new(
      format,
      Box::new(std::io::stdout()),
    )));
  }
  if outputs.is_empty() {
    warn!("没有指定任何输出，检测结果只写入日志");
  }

  let mut pipeline = DetectionPipeline::load(ReplayProvider, config).with_draw(draw);

  match args.mode {
    Mode::Oneshot => OneShotTask::default()
      .with_timeout(args.timeout.map(Duration::from_secs))
      .run_task(input, &mut pipeline, &mut outputs)?,
    Mode::Continuous => {
      let (tx, rx) = mpsc::channel();
      ctrlc::set_handler(move || {
        info!("收到中断信号，准备退出...");
        let _ = tx.send(());
        thread::spawn(|| {
          thread::sleep(Duration::from_secs(30));
          warn!("强制退出程序");
          std::process::exit(1);
        });
      })?;

      ContinuousTask::default()
        .with_frame_number(args.frame_number)
        .with_stop_signal(rx)
        .run_task(input, &mut pipeline, &mut outputs)?
    }
  }

  Ok(())
}
