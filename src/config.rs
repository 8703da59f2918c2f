use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

const LLM_FILE: &str = "Qwen3-4B-Instruct-2507-Q4_K_S-4.31bpw.gguf";
const VAE_FILE: &str = "ae-Q8_0.gguf";

/// Where stable-diffusion.cpp builds tend to leave the CLI, relative to a
/// search root.
const SD_CLI_CANDIDATES: &[&str] = &[
    "stable-diffusion.cpp/build/bin/Release/sd-cli.exe",
    "stable-diffusion.cpp/build/bin/sd-cli",
    "stable-diffusion.cpp/build/bin/sd",
    "stable-diffusion.cpp/build-linux/bin/sd-cli",
    "stable-diffusion.cpp/build-linux/bin/sd",
];

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version, about)]
pub struct Config {
    #[arg(long, env = "RENDERQ_HOST", default_value = "127.0.0.1", help = "Address to bind")]
    pub host: String,

    #[arg(short, long, env = "RENDERQ_PORT", default_value = "8000", help = "Port to bind")]
    pub port: u16,

    #[arg(long, env = "RENDERQ_MODEL_DIR", help = "Directory holding the .gguf models")]
    pub model_dir: Option<PathBuf>,

    #[arg(long, env = "RENDERQ_SD_CLI", help = "Path to the stable-diffusion.cpp CLI")]
    pub sd_cli: Option<PathBuf>,

    #[arg(long, env = "RENDERQ_LLM_PATH", help = "Text encoder model passed as --llm")]
    pub llm_path: Option<PathBuf>,

    #[arg(long, env = "RENDERQ_VAE_PATH", help = "VAE model passed as --vae")]
    pub vae_path: Option<PathBuf>,

    #[arg(
        long,
        env = "RENDERQ_OUTPUT_DIR",
        default_value = "outputs",
        help = "Directory rendered images are written to"
    )]
    pub output_dir: PathBuf,

    #[arg(
        long,
        env = "RENDERQ_STOP_GRACE_SECS",
        default_value = "5",
        help = "Seconds a stopped render may take to exit before it is killed"
    )]
    pub stop_grace_secs: u64,

    #[arg(long, env = "RENDERQ_JAEGER_ENDPOINT", help = "Jaeger collector URL for trace export")]
    pub jaeger_endpoint: Option<String>,
}

/// Filesystem locations the service works with, after defaults are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub sd_cli: PathBuf,
    pub model_dir: PathBuf,
    pub llm_path: PathBuf,
    pub vae_path: PathBuf,
    pub output_dir: PathBuf,
}

impl Config {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    /// Applies path defaults, searching `base` and its parent. Paths the
    /// user gave are taken as-is.
    pub fn resolve(&self, base: &Path) -> ResolvedPaths {
        let roots: Vec<&Path> = [Some(base), base.parent()].into_iter().flatten().collect();

        let model_dir = self.model_dir.clone().unwrap_or_else(|| {
            roots
                .iter()
                .map(|root| root.join("models"))
                .find(|dir| dir.is_dir())
                .unwrap_or_else(|| base.join("models"))
        });

        let sd_cli = self.sd_cli.clone().unwrap_or_else(|| {
            SD_CLI_CANDIDATES
                .iter()
                .flat_map(|candidate| roots.iter().map(move |root| root.join(candidate)))
                .find(|path| path.is_file())
                .unwrap_or_else(|| base.join("stable-diffusion.cpp/build-linux/bin/sd-cli"))
        });

        let llm_path = self
            .llm_path
            .clone()
            .unwrap_or_else(|| model_dir.join(LLM_FILE));
        let vae_path = self
            .vae_path
            .clone()
            .unwrap_or_else(|| model_dir.join(VAE_FILE));

        let output_dir = if self.output_dir.is_absolute() {
            self.output_dir.clone()
        } else {
            base.join(&self.output_dir)
        };

        ResolvedPaths {
            sd_cli,
            model_dir,
            llm_path,
            vae_path,
            output_dir,
        }
    }
}
