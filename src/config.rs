use crate::db;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Process-level settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub log_level: String,
    pub log_json: bool,
    pub workspace: Option<PathBuf>,
}

impl Settings {
    pub fn from_env() -> Self {
        let log_level = std::env::var("BULLETIND_LOG")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "info".to_string());
        let log_json = std::env::var("BULLETIND_LOG_JSON")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let workspace = std::env::var("BULLETIND_WORKSPACE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);
        Self {
            log_level,
            log_json,
            workspace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemesterMatching {
    /// Records without a semester tag match every semester.
    Permissive,
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalePolicy {
    /// Raw values are read against the subject's current max score.
    Live,
    /// Values are rescaled from the max grade they were recorded out of.
    Recorded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Averaging {
    /// Subject averages are brought onto the reference scale before weighting.
    Reference,
    /// Subject averages are weighted in their own units.
    Native,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub semester_matching: SemesterMatching,
    pub scale_policy: ScalePolicy,
    pub averaging: Averaging,
    pub reference_scale: f64,
    pub pass_mark: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            semester_matching: SemesterMatching::Permissive,
            scale_policy: ScalePolicy::Live,
            averaging: Averaging::Reference,
            reference_scale: 20.0,
            pass_mark: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatriculeConfig {
    pub prefix: String,
    pub include_year: bool,
    pub padding: usize,
    pub separator: String,
}

impl Default for MatriculeConfig {
    fn default() -> Self {
        Self {
            prefix: "ELV".to_string(),
            include_year: true,
            padding: 4,
            separator: "-".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsSection {
    Engine,
    Matricule,
}

impl SettingsSection {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "engine" => Some(Self::Engine),
            "matricule" => Some(Self::Matricule),
            _ => None,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::Engine => "settings.engine",
            Self::Matricule => "settings.matricule",
        }
    }
}

fn parse_enum<T: DeserializeOwned>(v: &Value, key: &str, allowed: &str) -> Result<T, String> {
    serde_json::from_value(v.clone()).map_err(|_| format!("{} must be one of: {}", key, allowed))
}

fn parse_positive(v: &Value, key: &str) -> Result<f64, String> {
    let n = v
        .as_f64()
        .ok_or_else(|| format!("{} must be a number", key))?;
    if !n.is_finite() || n <= 0.0 {
        return Err(format!("{} must be > 0", key));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.chars().count() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

impl EngineConfig {
    pub fn merge_patch(&mut self, patch: &Map<String, Value>) -> Result<(), String> {
        for (k, v) in patch {
            match k.as_str() {
                "semesterMatching" => {
                    self.semester_matching = parse_enum(v, k, "permissive, strict")?
                }
                "scalePolicy" => self.scale_policy = parse_enum(v, k, "live, recorded")?,
                "averaging" => self.averaging = parse_enum(v, k, "reference, native")?,
                "referenceScale" => self.reference_scale = parse_positive(v, k)?,
                "passMark" => self.pass_mark = parse_positive(v, k)?,
                _ => return Err(format!("unknown engine field: {}", k)),
            }
        }
        if self.pass_mark > self.reference_scale {
            return Err("passMark must be <= referenceScale".to_string());
        }
        Ok(())
    }
}

impl MatriculeConfig {
    pub fn merge_patch(&mut self, patch: &Map<String, Value>) -> Result<(), String> {
        for (k, v) in patch {
            match k.as_str() {
                "prefix" => {
                    let s = parse_string_max(v, k, 12)?;
                    if s.is_empty() {
                        return Err("prefix must not be empty".to_string());
                    }
                    self.prefix = s;
                }
                "includeYear" => {
                    self.include_year = v
                        .as_bool()
                        .ok_or_else(|| format!("{} must be boolean", k))?
                }
                "padding" => {
                    let n = v
                        .as_u64()
                        .ok_or_else(|| format!("{} must be integer", k))?;
                    if !(1..=10).contains(&n) {
                        return Err(format!("{} must be in 1..=10", k));
                    }
                    self.padding = n as usize;
                }
                "separator" => self.separator = parse_string_max(v, k, 3)?,
                _ => return Err(format!("unknown matricule field: {}", k)),
            }
        }
        Ok(())
    }
}

/// Saved values are applied best-effort; a malformed historical entry must not
/// block results.
pub fn load_engine_config(conn: &Connection) -> anyhow::Result<EngineConfig> {
    let mut cfg = EngineConfig::default();
    if let Some(saved) = db::settings_get_json(conn, SettingsSection::Engine.key())? {
        if let Some(obj) = saved.as_object() {
            let mut candidate = cfg.clone();
            if candidate.merge_patch(obj).is_ok() {
                cfg = candidate;
            } else {
                tracing::warn!("ignoring malformed engine settings");
            }
        }
    }
    Ok(cfg)
}

pub fn load_matricule_config(conn: &Connection) -> anyhow::Result<MatriculeConfig> {
    let mut cfg = MatriculeConfig::default();
    if let Some(saved) = db::settings_get_json(conn, SettingsSection::Matricule.key())? {
        if let Some(obj) = saved.as_object() {
            let mut candidate = cfg.clone();
            if candidate.merge_patch(obj).is_ok() {
                cfg = candidate;
            } else {
                tracing::warn!("ignoring malformed matricule settings");
            }
        }
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn engine_patch_applies_known_fields() {
        let mut cfg = EngineConfig::default();
        let patch = json!({ "semesterMatching": "strict", "averaging": "native", "passMark": 12 });
        cfg.merge_patch(patch.as_object().unwrap()).expect("merge");
        assert_eq!(cfg.semester_matching, SemesterMatching::Strict);
        assert_eq!(cfg.averaging, Averaging::Native);
        assert_eq!(cfg.pass_mark, 12.0);
        assert_eq!(cfg.scale_policy, ScalePolicy::Live);
    }

    #[test]
    fn engine_patch_rejects_bad_values() {
        let mut cfg = EngineConfig::default();
        let bad_enum = json!({ "scalePolicy": "snapshot" });
        assert!(cfg.merge_patch(bad_enum.as_object().unwrap()).is_err());
        let bad_scale = json!({ "referenceScale": 0 });
        assert!(cfg.merge_patch(bad_scale.as_object().unwrap()).is_err());
        let unknown = json!({ "tieBreak": "index" });
        assert!(cfg.merge_patch(unknown.as_object().unwrap()).is_err());
        let mut cfg = EngineConfig::default();
        let pass_above_scale = json!({ "passMark": 25 });
        assert!(cfg.merge_patch(pass_above_scale.as_object().unwrap()).is_err());
    }

    #[test]
    fn matricule_patch_validates_padding() {
        let mut cfg = MatriculeConfig::default();
        let patch = json!({ "prefix": "PAR", "padding": 6, "includeYear": false });
        cfg.merge_patch(patch.as_object().unwrap()).expect("merge");
        assert_eq!(cfg.prefix, "PAR");
        assert_eq!(cfg.padding, 6);
        assert!(!cfg.include_year);
        let bad = json!({ "padding": 0 });
        assert!(cfg.merge_patch(bad.as_object().unwrap()).is_err());
    }
}
