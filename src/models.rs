use std::path::Path;

use tracing::debug;

/// Models whose names start with this sort ahead of everything else.
const PREFERRED_PREFIX: &str = "z-image-turbo";
/// The VAE shipped next to the diffusion models.
const VAE_PREFIX: &str = "ae-";
/// Text-encoder models share the directory but are not diffusion models.
const TEXT_ENCODER_MARKER: &str = "qwen";

/// Diffusion model file names available in `dir`, preferred family first,
/// then alphabetical (case-insensitive).
pub fn list_models(dir: &Path) -> Vec<String> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(dir = %dir.display(), error = %err, "Model directory unreadable");
            return Vec::new();
        }
    };

    let mut models: Vec<String> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| is_diffusion_model(name))
        .collect();

    models.sort_by_cached_key(|name| {
        let lower = name.to_lowercase();
        (!lower.starts_with(PREFERRED_PREFIX), lower)
    });
    models
}

fn is_diffusion_model(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.ends_with(".gguf")
        && !lower.starts_with(VAE_PREFIX)
        && !lower.contains(TEXT_ENCODER_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_and_orders_models() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "flux-dev.gguf",
            "ae-Q8_0.gguf",
            "Qwen3-4B-Instruct.gguf",
            "Z-Image-Turbo-Q4.gguf",
            "Anime.GGUF",
            "notes.txt",
            "z-image-turbo-Q8.gguf",
        ] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        assert_eq!(
            list_models(dir.path()),
            vec![
                "Z-Image-Turbo-Q4.gguf",
                "z-image-turbo-Q8.gguf",
                "Anime.GGUF",
                "flux-dev.gguf",
            ]
        );
    }

    #[test]
    fn missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_models(&dir.path().join("nope")).is_empty());
    }
}
