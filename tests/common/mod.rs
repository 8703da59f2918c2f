#![allow(dead_code)]

use std::fs::File;
use std::io::BufWriter;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use renderq::config::ResolvedPaths;
use renderq::events::{Event, EventKind, Frame};
use renderq::registry::JobRegistry;
use renderq::renderer::Renderer;
use serde_json::{Map, Value};
use tempfile::TempDir;

pub const MAX_WAIT: Duration = Duration::from_secs(30);

/// What the fake render CLI does after logging its invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliMode {
    /// Copies the fixture image to the `-o` path and exits 0.
    Render,
    /// Exits 3 without writing anything.
    Fail,
    /// Exits 0 without writing anything.
    NoOutput,
    /// Sleeps until signalled.
    Hang,
    /// Ignores SIGTERM and sleeps; only SIGKILL stops it.
    IgnoreTerm,
    /// Takes two seconds to answer `--help`, then sleeps until signalled.
    SlowHelp,
    /// Writes a file that is not a PNG to the `-o` path and exits 0.
    CorruptImage,
    /// Sleeps until signalled, leaving behind a helper that ignores SIGTERM
    /// and holds the output pipes.
    StubbornHelper,
}

/// A fake sd-cli plus model and output directories, all inside a tempdir.
pub struct TestEnv {
    pub dir: TempDir,
    pub registry: Arc<JobRegistry>,
}

impl TestEnv {
    pub fn new(mode: CliMode) -> Self {
        Self::with_grace(mode, Duration::from_secs(5))
    }

    pub fn with_grace(mode: CliMode, grace: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let model_dir = root.join("models");
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join("z-image-turbo-Q8_0.gguf"), b"").unwrap();
        std::fs::write(model_dir.join("ae-Q8_0.gguf"), b"").unwrap();

        let output_dir = root.join("outputs");
        std::fs::create_dir_all(&output_dir).unwrap();

        let fixture = root.join("fixture.png");
        write_png(&fixture);

        let sd_cli = root.join("sd-cli");
        write_cli(&sd_cli, mode, &fixture, &root.join("invocations.log"));

        let renderer = Renderer::new(ResolvedPaths {
            sd_cli,
            llm_path: model_dir.join("llm.gguf"),
            vae_path: model_dir.join("ae-Q8_0.gguf"),
            model_dir,
            output_dir,
        });
        let registry = Arc::new(JobRegistry::new(Arc::new(renderer), grace));
        TestEnv { dir, registry }
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.path().join("outputs")
    }

    /// One line per CLI run (the `--help` probe excluded): `seed=<n> out=<path>`.
    pub fn invocations(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("invocations.log"))
            .map(|text| text.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn invoked_seeds(&self) -> Vec<u32> {
        self.invocations()
            .iter()
            .filter_map(|line| line.strip_prefix("seed="))
            .filter_map(|rest| rest.split_whitespace().next())
            .map(|seed| seed.parse().unwrap())
            .collect()
    }
}

fn write_cli(path: &Path, mode: CliMode, fixture: &Path, log: &Path) {
    let help_delay = match mode {
        CliMode::SlowHelp => "  sleep 2\n",
        _ => "",
    };
    let setup = match mode {
        CliMode::IgnoreTerm => "trap '' TERM\n",
        CliMode::StubbornHelper => "trap '' TERM\n( sleep 30 ) &\ntrap - TERM\n",
        _ => "",
    };
    let body = match mode {
        CliMode::Render => format!("cp '{}' \"$out\"\n", fixture.display()),
        CliMode::Fail => "echo 'fatal: out of memory' >&2\nexit 3\n".to_string(),
        CliMode::NoOutput => "exit 0\n".to_string(),
        CliMode::Hang | CliMode::SlowHelp | CliMode::StubbornHelper => {
            "exec sleep 30\n".to_string()
        }
        CliMode::IgnoreTerm => "sleep 30\n".to_string(),
        CliMode::CorruptImage => "echo 'not an image' > \"$out\"\n".to_string(),
    };
    let script = format!(
        r#"#!/bin/sh
if [ "$1" = "--help" ]; then
{help_delay}  echo "usage: sd-cli [options]"
  exit 0
fi
out=""
seed=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift ;;
    --seed) seed="$2"; shift ;;
  esac
  shift
done
printf '\033[32mloading model\033[0m\n'
printf 'step 1/2\rstep 2/2\r\n' >&2
{setup}echo "seed=$seed out=$out" >> '{log}'
{body}"#,
        log = log.display(),
    );
    std::fs::write(path, script).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// A 4x4 RGB image with one text chunk that tagging must preserve.
pub fn write_png(path: &Path) {
    let file = File::create(path).unwrap();
    let mut encoder = png::Encoder::new(BufWriter::new(file), 4, 4);
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    encoder
        .add_text_chunk("Software".to_string(), "fixture".to_string())
        .unwrap();
    let mut writer = encoder.write_header().unwrap();
    writer.write_image_data(&[128u8; 4 * 4 * 3]).unwrap();
    writer.finish().unwrap();
}

pub fn request(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

/// All events of `job_id` until its stream closes.
pub async fn collect_events(registry: &JobRegistry, job_id: &str) -> Vec<Event> {
    let frames = registry.stream(job_id).await.unwrap();
    let frames: Vec<Frame> = tokio::time::timeout(MAX_WAIT, frames.collect())
        .await
        .expect("event stream did not close");
    frames
        .into_iter()
        .filter_map(|frame| match frame {
            Frame::Event(event) => Some(event),
            _ => None,
        })
        .collect()
}

pub fn kinds(events: &[Event]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

pub fn without_logs(events: &[Event]) -> Vec<EventKind> {
    events
        .iter()
        .map(|e| e.kind)
        .filter(|kind| *kind != EventKind::Log)
        .collect()
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(MAX_WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
