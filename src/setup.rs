use crate::calc::{EvaluationWeights, MAX_SCORE, MIN_SCORE};
use crate::db;
use crate::transfer::{same_label, StudentStatus, TransferRules};
use anyhow::Context;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupSection {
    Grading,
    TransferRules,
}

impl SetupSection {
    pub const ALL: [SetupSection; 2] = [Self::Grading, Self::TransferRules];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "grading" => Some(Self::Grading),
            "transferRules" => Some(Self::TransferRules),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Grading => "grading",
            Self::TransferRules => "transferRules",
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::Grading => "setup.grading",
            Self::TransferRules => "setup.transferRules",
        }
    }
}

pub fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Grading => json!({
            "levels": ["6ème", "5ème", "4ème", "3ème"],
            "evaluationWeights": null
        }),
        SetupSection::TransferRules => json!({
            "minimumAverage": 10.0,
            "requiredStatus": "enrolled",
            "directTransfer": true,
            "deactivateSourceYearAfterTransfer": false
        }),
    }
}

/// Stored keys overlay the defaults, so sections gain new fields without a
/// migration.
pub fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut out = default_section(section);
    if let Some(stored) = db::settings_get_json(conn, section.key())? {
        if let (Some(dst), Some(src)) = (out.as_object_mut(), stored.as_object()) {
            for (k, v) in src {
                if dst.contains_key(k) {
                    dst.insert(k.clone(), v.clone());
                }
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradingConfig {
    pub levels: Vec<String>,
    pub evaluation_weights: Option<EvaluationWeights>,
}

pub fn load_grading(conn: &Connection) -> anyhow::Result<GradingConfig> {
    let v = load_section(conn, SetupSection::Grading)?;
    let levels = v
        .get("levels")
        .and_then(|l| l.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|x| x.as_str().map(|s| s.to_string()))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let evaluation_weights = match v.get("evaluationWeights") {
        None | Some(Value::Null) => None,
        Some(w) => Some(
            serde_json::from_value::<EvaluationWeights>(w.clone())
                .context("stored grading.evaluationWeights is malformed")?,
        ),
    };
    Ok(GradingConfig {
        levels,
        evaluation_weights,
    })
}

pub fn load_transfer_rules(conn: &Connection) -> anyhow::Result<TransferRules> {
    let v = load_section(conn, SetupSection::TransferRules)?;
    serde_json::from_value(v).context("stored transferRules section is malformed")
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let n = v
        .as_f64()
        .ok_or_else(|| format!("{} must be a number", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_levels(v: &Value) -> Result<Value, String> {
    let arr = v.as_array().ok_or("levels must be an array of strings")?;
    if arr.is_empty() || arr.len() > 20 {
        return Err("levels must contain 1..=20 entries".into());
    }
    let mut out: Vec<String> = Vec::with_capacity(arr.len());
    for item in arr {
        let s = item
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or("levels entries must be non-empty strings")?;
        if s.chars().count() > 32 {
            return Err("levels entries must be at most 32 characters".into());
        }
        if out.iter().any(|o| same_label(o, &s)) {
            return Err(format!("duplicate level: {}", s));
        }
        out.push(s);
    }
    Ok(json!(out))
}

fn parse_evaluation_weights(v: &Value, current: &Value) -> Result<Value, String> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    let patch = v
        .as_object()
        .ok_or("evaluationWeights must be an object or null")?;
    let mut merged = match current.as_object() {
        Some(c) => c.clone(),
        None => {
            let mut m = Map::new();
            m.insert("assignment1".into(), json!(1.0));
            m.insert("assignment2".into(), json!(1.0));
            m.insert("exam".into(), json!(1.0));
            m
        }
    };
    for (k, w) in patch {
        match k.as_str() {
            "assignment1" | "assignment2" | "exam" => {
                let n = parse_f64_range(w, &format!("evaluationWeights.{}", k), 0.0, 100.0)?;
                merged.insert(k.clone(), json!(n));
            }
            _ => return Err(format!("unknown evaluation type: {}", k)),
        }
    }
    let any_positive = merged.values().any(|w| w.as_f64().unwrap_or(0.0) > 0.0);
    if !any_positive {
        return Err("at least one evaluation weight must be positive".into());
    }
    Ok(Value::Object(merged))
}

pub fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Grading => match k.as_str() {
                "levels" => {
                    obj.insert(k.clone(), parse_levels(v)?);
                }
                "evaluationWeights" => {
                    let existing = obj.get(k).cloned().unwrap_or(Value::Null);
                    obj.insert(k.clone(), parse_evaluation_weights(v, &existing)?);
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
            SetupSection::TransferRules => match k.as_str() {
                "minimumAverage" => {
                    let n = parse_f64_range(v, k, MIN_SCORE, MAX_SCORE)?;
                    obj.insert(k.clone(), json!(n));
                }
                "requiredStatus" => {
                    let st = v.as_str().and_then(StudentStatus::parse).ok_or(
                        "requiredStatus must be one of: enrolled, transferred, withdrawn, completed",
                    )?;
                    obj.insert(k.clone(), Value::String(st.as_str().to_string()));
                }
                "directTransfer" | "deactivateSourceYearAfterTransfer" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown transferRules field: {}", k)),
            },
        }
    }
    Ok(())
}

/// Validates the whole patch before anything is written.
pub fn update_section(
    conn: &Connection,
    section: SetupSection,
    patch: &Map<String, Value>,
) -> Result<Value, SetupUpdateError> {
    let mut current = load_section(conn, section).map_err(SetupUpdateError::Storage)?;
    merge_section_patch(section, &mut current, patch).map_err(SetupUpdateError::Invalid)?;
    db::settings_set_json(conn, section.key(), &current).map_err(SetupUpdateError::Storage)?;
    Ok(current)
}

#[derive(Debug)]
pub enum SetupUpdateError {
    Invalid(String),
    Storage(anyhow::Error),
}
