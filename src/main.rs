use std::{
    env,
    fs::File,
    io::{BufRead, BufReader},
    path::PathBuf,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use gesture_lifecycle::{
    CollectionEvent, EngineConfig, GestureService, Handedness, HandFrame, LandmarkSet,
    ServiceChannels, TrainingEvent,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;

const USAGE: &str = "usage: gesture-lifecycle <frames.jsonl> [--collect <gesture>] [--config <engine.json>]";

struct Args {
    frames: PathBuf,
    collect: Option<String>,
    config: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut frames = None;
    let mut collect = None;
    let mut config = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--collect" => collect = Some(args.next().context(USAGE)?),
            "--config" => config = Some(PathBuf::from(args.next().context(USAGE)?)),
            "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            other if frames.is_none() && !other.starts_with("--") => {
                frames = Some(PathBuf::from(other))
            }
            other => bail!("unexpected argument `{other}`\n{USAGE}"),
        }
    }

    Ok(Args {
        frames: frames.context(USAGE)?,
        collect,
        config,
    })
}

/// One line of a recorded landmark stream.
#[derive(Deserialize)]
struct RecordedFrame {
    hand: Option<RecordedHand>,
}

#[derive(Deserialize)]
struct RecordedHand {
    points: Vec<[f32; 3]>,
    #[serde(default)]
    handedness: Option<String>,
    #[serde(default)]
    handedness_score: Option<f32>,
    confidence: f32,
}

impl RecordedFrame {
    fn into_frame(self) -> HandFrame {
        HandFrame::new(self.hand.map(|hand| {
            let handedness = match (hand.handedness.as_deref(), hand.handedness_score) {
                (Some(label), _) => Handedness::from_label(label),
                (None, Some(score)) => Handedness::from_score(score),
                (None, None) => Handedness::Unknown,
            };
            LandmarkSet::new(hand.points, handedness, hand.confidence)
        }))
    }
}

fn collection_bar(target: usize) -> ProgressBar {
    let bar = ProgressBar::new(target as u64);
    if let Ok(style) =
        ProgressStyle::with_template("{msg:>12} [{bar:40.cyan/blue}] {pos}/{len} samples")
    {
        bar.set_style(style.progress_chars("=>-"));
    }
    bar
}

fn drain_collection_events(channels: &ServiceChannels, bar: Option<&ProgressBar>) -> bool {
    let mut submitted = false;
    while let Ok(event) = channels.collection.try_recv() {
        match event {
            CollectionEvent::Progress(progress) => {
                if let Some(bar) = bar {
                    bar.set_message(progress.gesture.clone());
                    bar.set_position(progress.count as u64);
                }
            }
            CollectionEvent::Complete { gesture } => {
                if let Some(bar) = bar {
                    bar.finish_with_message(gesture.clone());
                }
                println!("collected all samples for `{gesture}`, uploading");
                submitted = true;
            }
            CollectionEvent::Rejected { gesture, reason } => {
                println!("training for `{gesture}` not started: {reason}");
            }
        }
    }
    submitted
}

fn follow_training(channels: &ServiceChannels) {
    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_message("uploading samples");

    while let Ok(event) = channels.training.recv() {
        match &event {
            TrainingEvent::TaskStarted { task_id, gesture } => {
                spinner.set_message(format!("training `{gesture}` (task {task_id})"));
            }
            TrainingEvent::Progress { step, .. } => spinner.set_message(step.clone()),
            TrainingEvent::ModelReady {
                gesture,
                model_code,
                label_index,
            } => spinner.finish_with_message(format!(
                "model {model_code} ready: `{gesture}` is class {label_index}"
            )),
            TrainingEvent::Failed { gesture, reason } => {
                spinner.finish_with_message(format!("training `{gesture}` failed: {reason}"))
            }
        }
        if event.is_terminal() {
            break;
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::from_env(),
    };

    let (service, channels) = GestureService::start_default(&config)?;
    println!(
        "gesture model {} active",
        service.model_code().unwrap_or_else(|| "(none)".to_string())
    );

    let bar = match &args.collect {
        Some(gesture) => {
            service.start_collecting(gesture)?;
            Some(collection_bar(config.collector.target_count))
        }
        None => None,
    };

    let file = File::open(&args.frames)
        .with_context(|| format!("failed to open {}", args.frames.display()))?;
    let mut last_text = String::new();
    let mut submitted = false;
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", args.frames.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let recorded: RecordedFrame = match serde_json::from_str(&line) {
            Ok(recorded) => recorded,
            Err(err) => {
                log::warn!("skipping line {}: {err}", line_no + 1);
                continue;
            }
        };

        let result = service.process_frame(&recorded.into_frame());
        let text = result.display_text();
        if text != last_text {
            match &bar {
                Some(bar) => bar.println(format!("frame {}: {text}", line_no + 1)),
                None => println!("frame {}: {text}", line_no + 1),
            }
            last_text = text;
        }
        submitted |= drain_collection_events(&channels, bar.as_ref());
    }

    if submitted {
        follow_training(&channels);
    } else if let Some(bar) = bar {
        bar.abandon_with_message("not enough confident frames");
        service.cancel_collecting();
    }

    service.shutdown();
    Ok(())
}
