//! Provenance tags embedded in rendered PNGs as text chunks.
//!
//! Every attribute is written as its own chunk so generic viewers can show
//! it, and the whole mapping is also stored as JSON under [`PROVENANCE_KEY`]
//! so it can be recovered with types intact.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::MetadataError;

/// Text chunk holding the full provenance mapping as JSON.
pub const PROVENANCE_KEY: &str = "zimage";

/// Generation parameters recorded on every rendered image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub prompt: String,
    pub seed: u32,
    pub steps: u32,
    pub width: u32,
    pub height: u32,
    pub sampling_method: String,
    pub cfg_scale: f64,
    pub guidance: f64,
    pub diffusion_model: String,
    pub llm: String,
    pub vae: String,
    pub generator: String,
    pub duration_sec: f64,
    pub timestamp: i64,
}

impl Provenance {
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Metadata recovered from an image. Flattened fields carry the raw chunk
/// text; anything absent or unreadable is `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImageMetadata {
    pub zimage: Option<Map<String, Value>>,
    pub prompt: Option<String>,
    pub seed: Option<String>,
    pub steps: Option<String>,
    pub width: Option<String>,
    pub height: Option<String>,
    pub sampling_method: Option<String>,
    pub diffusion_model: Option<String>,
    pub llm: Option<String>,
    pub vae: Option<String>,
    pub cfg_scale: Option<String>,
    pub guidance: Option<String>,
    pub duration_sec: Option<String>,
    pub timestamp: Option<String>,
}

impl ImageMetadata {
    fn from_chunks(chunks: &[(String, String)]) -> Self {
        let get = |key: &str| {
            chunks
                .iter()
                .rev()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };
        let zimage = get(PROVENANCE_KEY)
            .filter(|raw| !raw.trim().is_empty())
            .and_then(|raw| match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            });

        ImageMetadata {
            zimage,
            prompt: get("prompt"),
            seed: get("seed"),
            steps: get("steps"),
            width: get("width"),
            height: get("height"),
            sampling_method: get("sampling_method"),
            diffusion_model: get("diffusion_model"),
            llm: get("llm"),
            vae: get("vae"),
            cfg_scale: get("cfg_scale"),
            guidance: get("guidance"),
            duration_sec: get("duration_sec"),
            timestamp: get("timestamp"),
        }
    }
}

/// Rewrites the PNG at `path` with `attrs` embedded, keeping its pixels and
/// any unrelated text chunks. The file is replaced atomically.
pub fn write_metadata(path: &Path, attrs: &Map<String, Value>) -> Result<(), MetadataError> {
    let mut decoder = png::Decoder::new(BufReader::new(File::open(path)?));
    decoder.set_transformations(png::Transformations::EXPAND);
    decoder.set_ignore_text_chunk(false);
    let mut reader = decoder.read_info()?;

    let mut pixels = vec![0; reader.output_buffer_size().ok_or(MetadataError::BufferSize)?];
    let frame = reader.next_frame(&mut pixels)?;
    pixels.truncate(frame.buffer_size());

    let mut chunks: Vec<(String, String)> = text_chunks(reader.info())
        .into_iter()
        .filter(|(k, _)| k != PROVENANCE_KEY && !attrs.contains_key(k))
        .collect();
    for (key, value) in attrs {
        let text = match value {
            Value::Null => continue,
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        chunks.push((key.clone(), text));
    }
    chunks.push((PROVENANCE_KEY.to_string(), serde_json::to_string(attrs)?));

    let tmp = temp_path(path);
    let result = encode(&tmp, &frame, &pixels, chunks)
        .and_then(|()| std::fs::rename(&tmp, path).map_err(MetadataError::from));
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

/// Reads the provenance tags from the PNG at `path`. Missing or malformed
/// tags yield empty fields; only an unreadable file is an error.
pub fn read_metadata(path: &Path) -> Result<ImageMetadata, MetadataError> {
    let mut decoder = png::Decoder::new(BufReader::new(File::open(path)?));
    decoder.set_ignore_text_chunk(false);
    let reader = decoder.read_info()?;
    Ok(ImageMetadata::from_chunks(&text_chunks(reader.info())))
}

fn encode(
    path: &Path,
    frame: &png::OutputInfo,
    pixels: &[u8],
    chunks: Vec<(String, String)>,
) -> Result<(), MetadataError> {
    let file = File::create(path)?;
    let mut encoder = png::Encoder::new(BufWriter::new(file), frame.width, frame.height);
    encoder.set_color(frame.color_type);
    encoder.set_depth(frame.bit_depth);
    for (key, text) in chunks {
        encoder.add_itxt_chunk(key, text)?;
    }
    let mut writer = encoder.write_header()?;
    writer.write_image_data(pixels)?;
    writer.finish()?;
    Ok(())
}

fn text_chunks(info: &png::Info<'_>) -> Vec<(String, String)> {
    let mut chunks: Vec<(String, String)> = info
        .uncompressed_latin1_text
        .iter()
        .map(|chunk| (chunk.keyword.clone(), chunk.text.clone()))
        .collect();
    chunks.extend(info.compressed_latin1_text.iter().filter_map(|chunk| {
        chunk
            .get_text()
            .ok()
            .map(|text| (chunk.keyword.clone(), text))
    }));
    chunks.extend(info.utf8_text.iter().filter_map(|chunk| {
        chunk
            .get_text()
            .ok()
            .map(|text| (chunk.keyword.clone(), text))
    }));
    chunks
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_test_png(path: &Path, text: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut encoder = png::Encoder::new(BufWriter::new(file), 2, 2);
        encoder.set_color(png::ColorType::Rgb);
        encoder.set_depth(png::BitDepth::Eight);
        for (key, value) in text {
            encoder
                .add_text_chunk(key.to_string(), value.to_string())
                .unwrap();
        }
        let mut writer = encoder.write_header().unwrap();
        writer.write_image_data(&[7u8; 12]).unwrap();
        writer.finish().unwrap();
    }

    fn sample() -> Provenance {
        Provenance {
            prompt: "雪山下的湖 / a lake below snowy peaks".into(),
            seed: 10,
            steps: 8,
            width: 2,
            height: 2,
            sampling_method: "euler".into(),
            cfg_scale: 1.0,
            guidance: 0.0,
            diffusion_model: "z-image-turbo-Q8.gguf".into(),
            llm: "Qwen3-4B.gguf".into(),
            vae: "ae-Q8_0.gguf".into(),
            generator: "stable-diffusion.cpp sd-cli".into(),
            duration_sec: 12.5,
            timestamp: 1_760_000_000,
        }
    }

    #[test]
    fn provenance_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        write_test_png(&path, &[("parameters", "kept")]);

        let provenance = sample();
        write_metadata(&path, &provenance.to_map()).unwrap();

        let meta = read_metadata(&path).unwrap();
        let recovered: Provenance =
            serde_json::from_value(Value::Object(meta.zimage.clone().unwrap())).unwrap();
        assert_eq!(recovered, provenance);
        assert_eq!(meta.prompt.as_deref(), Some(provenance.prompt.as_str()));
        assert_eq!(meta.seed.as_deref(), Some("10"));
        assert_eq!(meta.cfg_scale.as_deref(), Some("1.0"));
        assert_eq!(meta.timestamp.as_deref(), Some("1760000000"));
        assert!(!dir.path().join("out.png.tmp").exists());

        let chunks = {
            let mut decoder = png::Decoder::new(BufReader::new(File::open(&path).unwrap()));
            decoder.set_ignore_text_chunk(false);
            let reader = decoder.read_info().unwrap();
            text_chunks(reader.info())
        };
        assert!(chunks.iter().any(|(k, v)| k == "parameters" && v == "kept"));
    }

    #[test]
    fn pixels_survive_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        write_test_png(&path, &[]);
        write_metadata(&path, &sample().to_map()).unwrap();

        let mut decoder = png::Decoder::new(BufReader::new(File::open(&path).unwrap()));
        decoder.set_transformations(png::Transformations::EXPAND);
        let mut reader = decoder.read_info().unwrap();
        let mut buf = vec![0; reader.output_buffer_size().unwrap()];
        let frame = reader.next_frame(&mut buf).unwrap();
        assert_eq!((frame.width, frame.height), (2, 2));
        assert_eq!(&buf[..frame.buffer_size()], &[7u8; 12]);
    }

    #[test]
    fn malformed_tags_degrade() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        write_test_png(&path, &[("zimage", "{not json"), ("seed", "5")]);

        let meta = read_metadata(&path).unwrap();
        assert!(meta.zimage.is_none());
        assert_eq!(meta.seed.as_deref(), Some("5"));
        assert!(meta.prompt.is_none());
    }

    #[test]
    fn untagged_image_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.png");
        write_test_png(&path, &[]);
        assert_eq!(read_metadata(&path).unwrap(), ImageMetadata::default());
    }

    #[test]
    fn non_png_fails_to_tag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.png");
        std::fs::write(&path, b"not a png").unwrap();
        let attrs = json!({ "seed": 1 }).as_object().unwrap().clone();
        assert!(write_metadata(&path, &attrs).is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"not a png");
    }
}
