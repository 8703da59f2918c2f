//! Turns the loosely typed submission body into validated render parameters.

use serde_json::{Map, Value};

use crate::error::RenderError;

pub const DEFAULT_PROMPT: &str = "A quiet mountain lake at dawn, mist drifting over the water, \
     pine forest on the shore, soft golden light, highly detailed";
pub const DEFAULT_WIDTH: u32 = 1080;
pub const DEFAULT_HEIGHT: u32 = 1080;
pub const DEFAULT_STEPS: u32 = 8;
pub const DEFAULT_BATCH_SIZE: u32 = 1;
pub const DEFAULT_SEED: i64 = 42;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedMode {
    /// Draw a fresh random seed for every batch item.
    Random,
    /// Use `base + item_index`, wrapping at 2^32.
    Sequential(i64),
}

impl SeedMode {
    pub fn seed_for(&self, idx: u32) -> u32 {
        match self {
            SeedMode::Random => rand::random::<u32>(),
            SeedMode::Sequential(base) => {
                base.wrapping_add(i64::from(idx)).rem_euclid(1 << 32) as u32
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderParams {
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub batch_size: u32,
    pub seed: SeedMode,
    /// Requested model name; empty when unset. Resolved against the catalog
    /// by [`RenderParams::choose_model`].
    pub sd_model: String,
}

impl RenderParams {
    pub fn from_request(request: &Map<String, Value>) -> Result<Self, RenderError> {
        let prompt = match request.get("prompt") {
            Some(v) if is_truthy(v) => text_field("prompt", v)?,
            _ => String::new(),
        };
        let prompt = match prompt.trim() {
            "" => DEFAULT_PROMPT.to_string(),
            trimmed => trimmed.to_string(),
        };

        let width = positive_field(request, "width", DEFAULT_WIDTH)?;
        let height = positive_field(request, "height", DEFAULT_HEIGHT)?;
        let steps = positive_field(request, "steps", DEFAULT_STEPS)?;
        let batch_size = positive_field(request, "batch_size", DEFAULT_BATCH_SIZE)?;

        let auto_random = match request.get("auto_random_seed") {
            None | Some(Value::Null) => true,
            Some(v) => is_truthy(v),
        };
        let seed = if auto_random {
            SeedMode::Random
        } else {
            SeedMode::Sequential(int_field(request, "seed")?.unwrap_or(DEFAULT_SEED))
        };

        let sd_model = match request.get("sd_model") {
            Some(v) if is_truthy(v) => text_field("sd_model", v)?.trim().to_string(),
            _ => String::new(),
        };

        Ok(RenderParams {
            prompt,
            width,
            height,
            steps,
            batch_size,
            seed,
            sd_model,
        })
    }

    /// The requested model if it is available, otherwise the first one.
    pub fn choose_model<'a>(&self, available: &'a [String]) -> Option<&'a str> {
        available
            .iter()
            .find(|name| **name == self.sd_model)
            .or_else(|| available.first())
            .map(String::as_str)
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn text_field(name: &str, value: &Value) -> Result<String, RenderError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(RenderError::InvalidRequest(format!("{name} must be text"))),
    }
}

/// Integer coercion for a field. Falsy values yield `None` so the caller
/// applies its default.
fn int_field(request: &Map<String, Value>, name: &str) -> Result<Option<i64>, RenderError> {
    let Some(value) = request.get(name).filter(|v| is_truthy(v)) else {
        return Ok(None);
    };
    let invalid = || RenderError::InvalidRequest(format!("{name} must be an integer, got {value}"));
    let parsed = match value {
        Value::Bool(b) => i64::from(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => i,
            None => {
                let f = n.as_f64().ok_or_else(invalid)?;
                if !f.is_finite() || f.abs() >= i64::MAX as f64 {
                    return Err(invalid());
                }
                f.trunc() as i64
            }
        },
        Value::String(s) => s.trim().parse::<i64>().map_err(|_| invalid())?,
        _ => return Err(invalid()),
    };
    Ok(Some(parsed))
}

fn positive_field(
    request: &Map<String, Value>,
    name: &str,
    default: u32,
) -> Result<u32, RenderError> {
    match int_field(request, name)? {
        None => Ok(default),
        Some(v) if v > 0 => u32::try_from(v)
            .map_err(|_| RenderError::InvalidRequest(format!("{name} is too large: {v}"))),
        Some(v) => Err(RenderError::InvalidRequest(format!(
            "{name} must be positive, got {v}"
        ))),
    }
}
