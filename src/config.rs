use std::{collections::HashSet, fs, path::Path};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    pub path: String,
    pub timeout: u64,
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum GpioCapability {
    Input,
    Output,
    PullUp,
    PullDown,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeDetect {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

impl EdgeDetect {
    /// Whether an observed transition satisfies this edge selection.
    pub fn matches(self, observed: EdgeDetect) -> bool {
        match self {
            EdgeDetect::None => false,
            EdgeDetect::Rising => observed == EdgeDetect::Rising,
            EdgeDetect::Falling => observed == EdgeDetect::Falling,
            EdgeDetect::Both => matches!(observed, EdgeDetect::Rising | EdgeDetect::Falling),
        }
    }

    /// Transition between two logic levels, if any.
    pub fn between(old: u8, new: u8) -> Option<EdgeDetect> {
        match (old, new) {
            (0, 1) => Some(EdgeDetect::Rising),
            (1, 0) => Some(EdgeDetect::Falling),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PinConfig {
    pub name: String,
    pub chip: String,
    pub line: u32,
    pub capabilities: HashSet<GpioCapability>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub gpios: FxHashMap<u32, PinConfig>,
    pub broadcast_capacity: usize,
    pub event_history_capacity: usize,
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        serde_json::from_str(&contents)
            .map_err(|e| AppError::Config(format!("Invalid config json: {e}")))
    }

    /// Resolves a channel label to its pin id.
    ///
    /// A label matches either a configured pin name exactly or the decimal
    /// pin id of a configured pin.
    pub fn resolve_pin(&self, label: &str) -> Result<u32, AppError> {
        if let Some((id, _)) = self.gpios.iter().find(|(_, cfg)| cfg.name == label) {
            return Ok(*id);
        }

        label
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|id| self.gpios.contains_key(id))
            .ok_or_else(|| AppError::InvalidChannel(label.to_string()))
    }

    pub fn pin(&self, pin_id: u32) -> Result<&PinConfig, AppError> {
        self.gpios
            .get(&pin_id)
            .ok_or_else(|| AppError::InvalidChannel(pin_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AppConfig {
        serde_json::from_str(
            r#"{
                "http": { "host": "localhost", "path": "/api", "timeout": 30 },
                "gpios": {
                    "7": { "name": "P8_7", "chip": "/dev/gpiochip0", "line": 7, "capabilities": ["input"] },
                    "12": { "name": "12", "chip": "/dev/gpiochip0", "line": 9, "capabilities": ["output"] }
                },
                "broadcast_capacity": 16,
                "event_history_capacity": 8
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn resolves_by_name_or_id() {
        let cfg = config();
        assert_eq!(cfg.resolve_pin("P8_7").unwrap(), 7);
        assert_eq!(cfg.resolve_pin("7").unwrap(), 7);
        assert_eq!(cfg.resolve_pin("12").unwrap(), 12);
    }

    #[test]
    fn unknown_label_is_invalid_channel() {
        let cfg = config();
        assert!(matches!(
            cfg.resolve_pin("P9_99"),
            Err(AppError::InvalidChannel(_))
        ));
        assert!(matches!(cfg.resolve_pin("3"), Err(AppError::InvalidChannel(_))));
    }

    #[test]
    fn edge_selection_matches_transitions() {
        assert!(EdgeDetect::Both.matches(EdgeDetect::Rising));
        assert!(EdgeDetect::Both.matches(EdgeDetect::Falling));
        assert!(!EdgeDetect::Rising.matches(EdgeDetect::Falling));
        assert!(!EdgeDetect::None.matches(EdgeDetect::Rising));
        assert_eq!(EdgeDetect::between(0, 1), Some(EdgeDetect::Rising));
        assert_eq!(EdgeDetect::between(1, 1), None);
    }
}
