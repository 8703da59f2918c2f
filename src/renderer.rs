//! The stable-diffusion.cpp CLI as seen by the worker: how to invoke it for
//! one image and how to judge the result.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

use crate::config::ResolvedPaths;
use crate::error::RenderError;
use crate::job::Job;
use crate::metadata::{self, Provenance};
use crate::models;
use crate::request::RenderParams;
use crate::supervisor::{self, strip_ansi};

pub const SAMPLING_METHOD: &str = "euler";
pub const CFG_SCALE: f64 = 1.0;
pub const GUIDANCE: f64 = 0.0;
pub const GENERATOR: &str = "stable-diffusion.cpp sd-cli";
const FLASH_ATTENTION_FLAG: &str = "--diffusion-fa";

/// One successfully rendered and verified image.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedImage {
    pub path: PathBuf,
    pub filename: String,
    pub seed: u32,
    pub duration: Duration,
}

/// Result of rendering one batch item.
#[derive(Debug)]
pub enum ItemOutcome {
    Rendered(RenderedImage),
    Failed(RenderError),
    Cancelled,
}

#[derive(Debug)]
pub struct Renderer {
    paths: ResolvedPaths,
    help_text: OnceCell<String>,
}

impl Renderer {
    pub fn new(paths: ResolvedPaths) -> Self {
        Renderer {
            paths,
            help_text: OnceCell::new(),
        }
    }

    pub fn paths(&self) -> &ResolvedPaths {
        &self.paths
    }

    pub fn output_dir(&self) -> &Path {
        &self.paths.output_dir
    }

    pub async fn list_models(&self) -> Vec<String> {
        let dir = self.paths.model_dir.clone();
        tokio::task::spawn_blocking(move || models::list_models(&dir))
            .await
            .unwrap_or_default()
    }

    fn workdir(&self) -> Option<&Path> {
        self.paths
            .sd_cli
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
    }

    /// Whether the CLI's `--help` mentions `flag`. The help text is fetched
    /// once; a CLI that cannot be probed supports nothing optional.
    pub async fn supports(&self, flag: &str) -> bool {
        let help = self
            .help_text
            .get_or_init(|| async {
                let mut cmd = Command::new(&self.paths.sd_cli);
                cmd.arg("--help");
                if let Some(dir) = self.workdir() {
                    cmd.current_dir(dir);
                }
                match cmd.output().await {
                    Ok(output) => {
                        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                        text.push_str(&String::from_utf8_lossy(&output.stderr));
                        strip_ansi(&text)
                    }
                    Err(err) => {
                        debug!(error = %err, "Could not probe render CLI options");
                        String::new()
                    }
                }
            })
            .await;
        help.contains(flag)
    }

    /// Full argument list for one render of `params` with `model` and `seed`.
    pub async fn build_args(
        &self,
        params: &RenderParams,
        model: &str,
        seed: u32,
        output: &Path,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--diffusion-model".into(),
            self.paths.model_dir.join(model).into(),
            "--llm".into(),
            self.paths.llm_path.clone().into(),
            "--vae".into(),
            self.paths.vae_path.clone().into(),
            "-p".into(),
            params.prompt.clone().into(),
            "-W".into(),
            params.width.to_string().into(),
            "-H".into(),
            params.height.to_string().into(),
            "--steps".into(),
            params.steps.to_string().into(),
            "--seed".into(),
            seed.to_string().into(),
            "--cfg-scale".into(),
            format!("{CFG_SCALE:.1}").into(),
            "--guidance".into(),
            format!("{GUIDANCE:.1}").into(),
            "--sampling-method".into(),
            SAMPLING_METHOD.into(),
            "--clip-on-cpu".into(),
            "--vae-tiling".into(),
        ];
        if self.supports(FLASH_ATTENTION_FLAG).await {
            args.push(FLASH_ATTENTION_FLAG.into());
        }
        args.push("-o".into());
        args.push(output.into());
        args
    }

    /// Renders one image for `job`. A stop request observed once the process
    /// has exited wins over any failure it reported.
    #[instrument(skip(self, job, params), fields(job_id = %job.id()))]
    pub async fn render_item(
        &self,
        job: &Job,
        params: &RenderParams,
        model: &str,
        seed: u32,
    ) -> ItemOutcome {
        let filename = format!("out_{}_{}.png", Utc::now().timestamp(), seed);
        let output = self.paths.output_dir.join(&filename);
        let args = self.build_args(params, model, seed, &output).await;

        let started = Instant::now();
        let result = supervisor::run(job, &self.paths.sd_cli, &args, self.workdir()).await;
        let duration = started.elapsed();

        if job.stop_requested() {
            return ItemOutcome::Cancelled;
        }
        let status = match result {
            Ok(status) => status,
            Err(err) => return ItemOutcome::Failed(err),
        };
        if !status.success() {
            return ItemOutcome::Failed(RenderError::ExitStatus { status });
        }
        if !tokio::fs::try_exists(&output).await.unwrap_or(false) {
            return ItemOutcome::Failed(RenderError::MissingOutput { path: output });
        }

        let provenance = Provenance {
            prompt: params.prompt.clone(),
            seed,
            steps: params.steps,
            width: params.width,
            height: params.height,
            sampling_method: SAMPLING_METHOD.to_string(),
            cfg_scale: CFG_SCALE,
            guidance: GUIDANCE,
            diffusion_model: model.to_string(),
            llm: file_name(&self.paths.llm_path),
            vae: file_name(&self.paths.vae_path),
            generator: GENERATOR.to_string(),
            duration_sec: duration.as_secs_f64(),
            timestamp: Utc::now().timestamp(),
        };
        self.tag(job, &output, provenance).await;

        ItemOutcome::Rendered(RenderedImage {
            path: output,
            filename,
            seed,
            duration,
        })
    }

    /// Embeds `provenance` in the image. Failure is reported in the job log
    /// and otherwise ignored.
    async fn tag(&self, job: &Job, output: &Path, provenance: Provenance) {
        let path = output.to_path_buf();
        let attrs = provenance.to_map();
        let result =
            tokio::task::spawn_blocking(move || metadata::write_metadata(&path, &attrs)).await;
        let message = match result {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err.to_string(),
            Err(err) => err.to_string(),
        };
        warn!(path = %output.display(), error = %message, "Failed to write PNG metadata");
        job.emit_log(format!(
            "[meta] failed to write PNG metadata ({message}); the image is unaffected"
        ));
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
