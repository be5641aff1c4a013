//! Settings snapshot files
//!
//! A snapshot is a TOML document keyed by parameter name:
//!
//! ```toml
//! board = "NANO33BLE"
//! exported_at = "2026-01-10T12:00:00Z"
//!
//! [parameters]
//! TiltGain = 2.5
//! PanCenter = 1500
//! ServoReverse = 5
//! AccCalibration = "0000803f..."
//! ```
//!
//! Byte-valued parameters are stored as hex strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::param::{ParamDef, ParamKind, ParamValue, ParameterError};
use crate::store::ParameterStore;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Invalid snapshot file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Cannot write snapshot: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    board: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exported_at: Option<DateTime<Utc>>,
    #[serde(default)]
    parameters: toml::Table,
}

/// Outcome of applying a snapshot to a store
#[derive(Debug, Default)]
pub struct ImportReport {
    /// Names that were applied, in name order
    pub applied: Vec<String>,
    /// Names that were skipped and why
    pub skipped: Vec<(String, ParameterError)>,
}

impl ImportReport {
    pub fn skipped_names(&self) -> Vec<&str> {
        self.skipped.iter().map(|(n, _)| n.as_str()).collect()
    }
}

fn to_toml(value: &ParamValue) -> toml::Value {
    match value {
        ParamValue::Int(v) => toml::Value::Integer(i64::from(*v)),
        ParamValue::Float(v) => toml::Value::Float(f64::from(*v)),
        ParamValue::Bool(v) => toml::Value::Boolean(*v),
        ParamValue::Bitmask(v) => toml::Value::Integer(i64::from(*v)),
        ParamValue::Bytes(v) => toml::Value::String(hex::encode(v)),
    }
}

fn from_toml(def: &ParamDef, value: &toml::Value) -> Result<ParamValue, ParameterError> {
    let mismatch = || ParameterError::InvalidText {
        text: value.to_string(),
        kind: def.kind,
    };
    let out_of_range = || ParameterError::OutOfRange {
        name: def.name.to_string(),
        value: value.to_string(),
    };

    match (def.kind, value) {
        (ParamKind::Int, toml::Value::Integer(v)) => {
            i16::try_from(*v).map(ParamValue::Int).map_err(|_| out_of_range())
        }
        (ParamKind::Float, toml::Value::Float(v)) => Ok(ParamValue::Float(*v as f32)),
        (ParamKind::Float, toml::Value::Integer(v)) => Ok(ParamValue::Float(*v as f32)),
        (ParamKind::Bool, toml::Value::Boolean(v)) => Ok(ParamValue::Bool(*v)),
        (ParamKind::Bitmask, toml::Value::Integer(v)) => {
            u32::try_from(*v).map(ParamValue::Bitmask).map_err(|_| out_of_range())
        }
        // Strings go through the same parser the command line uses
        (kind, toml::Value::String(s)) => ParamValue::parse(kind, s),
        _ => Err(mismatch()),
    }
}

impl ParameterStore {
    /// Write every loaded parameter to a snapshot document
    pub fn export_snapshot(&self) -> Result<String, SnapshotError> {
        let parameters = self
            .values()
            .into_iter()
            .map(|(def, value)| (def.name.to_string(), to_toml(&value)))
            .collect();

        let file = SnapshotFile {
            board: Some(self.schema().board().to_string()),
            exported_at: Some(Utc::now()),
            parameters,
        };
        Ok(toml::to_string_pretty(&file)?)
    }

    /// Apply a snapshot document as local edits
    ///
    /// Each key is applied independently. Unknown names and invalid values
    /// are collected in the report instead of aborting the import.
    pub fn import_snapshot(&mut self, text: &str) -> Result<ImportReport, SnapshotError> {
        let file: SnapshotFile = toml::from_str(text)?;
        let board = self.schema().board();

        if let Some(ref name) = file.board {
            if !name.eq_ignore_ascii_case(board.as_str()) {
                warn!(file_board = %name, board = %board, "Snapshot was exported from a different board");
            }
        }

        let mut report = ImportReport::default();
        for (name, raw) in &file.parameters {
            let result = self
                .def_by_name(name)
                .and_then(|def| from_toml(def, raw).map(|v| (def, v)))
                .and_then(|(def, v)| self.set(def.id, v));

            match result {
                Ok(()) => report.applied.push(name.clone()),
                Err(e) => {
                    warn!(param = %name, error = %e, "Skipping snapshot entry");
                    report.skipped.push((name.clone(), e));
                }
            }
        }

        info!(
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            "Snapshot imported"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{BoardIdentity, BoardType, DEFAULT_MAX_PAYLOAD};
    use crate::codec::encode_value;
    use crate::param::ParamId;

    fn store() -> ParameterStore {
        let identity = BoardIdentity {
            board: BoardType::Nano33Ble,
            protocol_version: 2,
            capabilities: BoardType::Nano33Ble.features(),
            max_payload: DEFAULT_MAX_PAYLOAD,
            firmware_version: "v2.2".to_string(),
        };
        let mut store = ParameterStore::new(&identity);
        let entries = vec![
            (ParamId(2), encode_value(&ParamValue::Float(1.0)).unwrap()),
            (ParamId(6), encode_value(&ParamValue::Int(1500)).unwrap()),
            (ParamId(16), encode_value(&ParamValue::Bitmask(0b101)).unwrap()),
            (ParamId(19), encode_value(&ParamValue::Bool(true)).unwrap()),
            (ParamId(60), encode_value(&ParamValue::Bytes(vec![1, 2, 3])).unwrap()),
        ];
        store.apply_pull(&entries).unwrap();
        store
    }

    #[test]
    fn test_export_then_import_into_fresh_store() {
        let source = store();
        let text = source.export_snapshot().unwrap();
        assert!(text.contains("TiltGain = 1.0"));
        assert!(text.contains("AccCalibration = \"010203\""));

        let mut target = store();
        target.set(ParamId(2), ParamValue::Float(4.0)).unwrap();
        let report = target.import_snapshot(&text).unwrap();

        assert!(report.skipped.is_empty());
        assert_eq!(report.applied.len(), 5);
        assert_eq!(target.get(ParamId(2)).unwrap(), ParamValue::Float(1.0));
        assert!(!target.has_unsent_changes());
    }

    #[test]
    fn test_import_continues_past_bad_keys() {
        let mut store = store();
        let text = r#"
board = "NANO33BLE"

[parameters]
TiltGain = 2.5
NoSuchThing = 3
PanCenter = 90000
ResetOnTilt = "maybe"
ServoReverse = "0b011"
"#;
        let report = store.import_snapshot(text).unwrap();

        assert_eq!(report.applied, vec!["ServoReverse".to_string(), "TiltGain".to_string()]);
        let mut skipped = report.skipped_names();
        skipped.sort();
        assert_eq!(skipped, vec!["NoSuchThing", "PanCenter", "ResetOnTilt"]);
        assert!(matches!(
            report.skipped.iter().find(|(n, _)| n == "NoSuchThing").map(|(_, e)| e),
            Some(ParameterError::UnknownParameter(_))
        ));

        assert_eq!(store.get(ParamId(2)).unwrap(), ParamValue::Float(2.5));
        assert_eq!(store.get(ParamId(16)).unwrap(), ParamValue::Bitmask(0b011));
        assert_eq!(store.get(ParamId(6)).unwrap(), ParamValue::Int(1500));
    }

    #[test]
    fn test_import_rejects_garbage() {
        let mut store = store();
        assert!(matches!(
            store.import_snapshot("this is = = not toml"),
            Err(SnapshotError::Parse(_))
        ));
    }
}
