//! ParameterStore - confirmed board state plus pending local edits
//!
//! The store keeps two tables: the last values confirmed by the board and
//! the local values the user sees. A parameter is dirty while the two
//! differ. Nothing here performs I/O; the session layer moves the frames
//! produced and consumed here over the link.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::board::{BoardIdentity, Capabilities};
use crate::codec::{decode_value, encode_value};
use crate::param::{ParamDef, ParamId, ParamValue, ParameterError};
use crate::schema::{Schema, ACC_CALIBRATION, DISABLE_MAG, MAG_CALIBRATION};

/// One encoded parameter value ready to go into a SET_PARAM payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub id: ParamId,
    /// Size-prefixed value bytes
    pub bytes: Vec<u8>,
}

/// Aggregate dirty state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingChanges {
    /// Local edits not yet sent to the board
    pub unsent: bool,
    /// Values sent to the board's RAM but not saved to its flash
    pub unsaved_to_flash: bool,
}

impl PendingChanges {
    pub fn any(&self) -> bool {
        self.unsent || self.unsaved_to_flash
    }
}

#[derive(Debug, Clone)]
pub struct ParameterStore {
    schema: Schema,
    confirmed: BTreeMap<ParamId, ParamValue>,
    local: BTreeMap<ParamId, ParamValue>,
    dirty: BTreeSet<ParamId>,
    unsaved_to_flash: bool,
}

impl ParameterStore {
    /// Create an empty store for the board we are connected to
    pub fn new(identity: &BoardIdentity) -> Self {
        Self::with_schema(Schema::for_board(identity.board))
    }

    pub fn with_schema(schema: Schema) -> Self {
        Self {
            schema,
            confirmed: BTreeMap::new(),
            local: BTreeMap::new(),
            dirty: BTreeSet::new(),
            unsaved_to_flash: false,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn def(&self, id: ParamId) -> Result<&'static ParamDef, ParameterError> {
        self.schema
            .get(id)
            .ok_or_else(|| ParameterError::UnknownParameter(id.to_string()))
    }

    /// Look up a parameter definition by its snapshot name
    pub fn def_by_name(&self, name: &str) -> Result<&'static ParamDef, ParameterError> {
        self.schema
            .by_name(name)
            .ok_or_else(|| ParameterError::UnknownParameter(name.to_string()))
    }

    /// Current local value of a parameter
    pub fn get(&self, id: ParamId) -> Result<ParamValue, ParameterError> {
        let def = self.def(id)?;
        self.local
            .get(&id)
            .cloned()
            .ok_or_else(|| ParameterError::NotLoaded(def.name.to_string()))
    }

    /// Last value confirmed by the board
    pub fn confirmed(&self, id: ParamId) -> Option<&ParamValue> {
        self.confirmed.get(&id)
    }

    /// Edit a parameter locally
    ///
    /// On failure the stored value is left untouched.
    pub fn set(&mut self, id: ParamId, value: ParamValue) -> Result<(), ParameterError> {
        let def = self.def(id)?;
        def.validate(&value)?;

        if self.confirmed.get(&id) == Some(&value) {
            self.dirty.remove(&id);
        } else {
            self.dirty.insert(id);
        }
        debug!(param = def.name, value = %value, dirty = self.dirty.contains(&id), "Parameter set");
        self.local.insert(id, value);
        Ok(())
    }

    pub fn is_dirty(&self, id: ParamId) -> bool {
        self.dirty.contains(&id)
    }

    pub fn dirty_ids(&self) -> Vec<ParamId> {
        self.dirty.iter().copied().collect()
    }

    pub fn pending_changes(&self) -> PendingChanges {
        PendingChanges {
            unsent: !self.dirty.is_empty(),
            unsaved_to_flash: self.unsaved_to_flash,
        }
    }

    pub fn has_unsent_changes(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.unsaved_to_flash
    }

    /// Encode every dirty parameter, ascending by id
    ///
    /// Does not clear dirty bits; call [`ParameterStore::mark_sent`] once the
    /// board has acknowledged the frames.
    pub fn to_wire_frames(&self) -> Result<Vec<WireFrame>, ParameterError> {
        self.dirty
            .iter()
            .filter_map(|id| self.local.get(id).map(|v| (*id, v)))
            .map(|(id, v)| {
                Ok(WireFrame {
                    id,
                    bytes: encode_value(v)?,
                })
            })
            .collect()
    }

    /// Record that the board accepted `frames`
    ///
    /// A frame only clears its dirty bit if the local value still matches
    /// what was sent; an edit made while the push was in flight stays dirty.
    pub fn mark_sent(&mut self, frames: &[WireFrame]) {
        for frame in frames {
            let Ok(def) = self.def(frame.id) else { continue };
            let Ok(sent) = decode_value(def, &frame.bytes) else { continue };

            if !def.volatile && self.confirmed.get(&frame.id) != Some(&sent) {
                self.unsaved_to_flash = true;
            }
            if self.local.get(&frame.id) == Some(&sent) {
                self.dirty.remove(&frame.id);
            }
            self.confirmed.insert(frame.id, sent);
        }
    }

    /// Record that the board saved its RAM settings to flash
    pub fn mark_saved_to_flash(&mut self) {
        self.unsaved_to_flash = false;
    }

    /// Decode a value read from the board into the confirmed table
    pub fn apply_wire_frame(&mut self, id: ParamId, bytes: &[u8]) -> Result<(), ParameterError> {
        let def = self.def(id)?;
        let value = decode_value(def, bytes)?;
        self.commit_confirmed(id, value);
        Ok(())
    }

    /// Apply a complete pull from the board
    ///
    /// Every entry is decoded before anything is committed, so a pull that
    /// contains one bad value leaves the store unchanged. Ids outside this
    /// board's schema are skipped and returned.
    pub fn apply_pull(
        &mut self,
        entries: &[(ParamId, Vec<u8>)],
    ) -> Result<Vec<ParamId>, ParameterError> {
        let mut staged = Vec::with_capacity(entries.len());
        let mut unknown = Vec::new();

        for (id, bytes) in entries {
            match self.schema.get(*id) {
                Some(def) => staged.push((*id, decode_value(def, bytes)?)),
                None => {
                    warn!(param = %id, "Board reported a parameter outside its schema");
                    unknown.push(*id);
                }
            }
        }

        for (id, value) in staged {
            self.commit_confirmed(id, value);
        }

        let missing = self
            .schema
            .iter()
            .filter(|d| !self.confirmed.contains_key(&d.id))
            .count();
        if missing > 0 {
            warn!(missing, "Pull did not cover the whole schema");
        }

        Ok(unknown)
    }

    fn commit_confirmed(&mut self, id: ParamId, value: ParamValue) {
        if self.dirty.contains(&id) {
            // Keep the user's edit; it is only dirty if it still differs
            if self.local.get(&id) == Some(&value) {
                self.dirty.remove(&id);
            }
        } else {
            self.local.insert(id, value.clone());
        }
        self.confirmed.insert(id, value);
    }

    /// Whether every schema parameter has been read from the board
    pub fn is_loaded(&self) -> bool {
        self.schema.iter().all(|d| self.confirmed.contains_key(&d.id))
    }

    /// Copy out all loaded local values in id order
    pub fn values(&self) -> Vec<(&'static ParamDef, ParamValue)> {
        self.schema
            .iter()
            .filter_map(|d| self.local.get(&d.id).map(|v| (d, v.clone())))
            .collect()
    }

    /// Whether the sensor calibration looks like it was never run
    ///
    /// True when the accelerometer offsets are all zero, or the board has an
    /// enabled magnetometer whose hard-iron offsets are all zero.
    pub fn needs_calibration(&self, features: Capabilities) -> bool {
        let all_zero = |id: ParamId, len: usize| match self.local.get(&id) {
            Some(ParamValue::Bytes(b)) => b.iter().take(len).all(|x| *x == 0),
            _ => false,
        };

        let acc = all_zero(ACC_CALIBRATION, 12);
        let mag_enabled = features.contains(Capabilities::MAGNETOMETER)
            && !matches!(self.local.get(&DISABLE_MAG), Some(ParamValue::Bool(true)));
        acc || (mag_enabled && all_zero(MAG_CALIBRATION, 12))
    }
}
