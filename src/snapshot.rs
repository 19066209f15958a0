//! Binary persistence for [`Snapshot`]: the full set of knobs the engine
//! controls, sufficient for deterministic restore, serialised with
//! `bincode` behind an explicit format version.

use crate::error::SnapshotError;
use crate::model::DpdData;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const SNAPSHOT_FORMAT_VERSION: u8 = 1;
const FILENAME_PREFIX: &str = "adapt_";
const FILENAME_SUFFIX: &str = ".bin";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) enum WireDpdData {
    Poly {
        coefs_am: Vec<f64>,
        coefs_pm: Vec<f64>,
    },
    Lut {
        scale: f64,
        table: Vec<(f64, f64)>,
    },
}

impl From<&DpdData> for WireDpdData {
    fn from(data: &DpdData) -> Self {
        match data {
            DpdData::Poly { coefs_am, coefs_pm } => WireDpdData::Poly {
                coefs_am: coefs_am.to_vec(),
                coefs_pm: coefs_pm.to_vec(),
            },
            DpdData::Lut { scale, table } => WireDpdData::Lut {
                scale: *scale,
                table: table.to_vec(),
            },
        }
    }
}

impl TryFrom<WireDpdData> for DpdData {
    type Error = SnapshotError;

    fn try_from(data: WireDpdData) -> Result<Self, Self::Error> {
        match data {
            WireDpdData::Poly { coefs_am, coefs_pm } => {
                let am: [f64; crate::model::K] = coefs_am
                    .try_into()
                    .map_err(|_| SnapshotError::UnsupportedVersion(SNAPSHOT_FORMAT_VERSION))?;
                let pm: [f64; crate::model::K] = coefs_pm
                    .try_into()
                    .map_err(|_| SnapshotError::UnsupportedVersion(SNAPSHOT_FORMAT_VERSION))?;
                Ok(DpdData::Poly {
                    coefs_am: am,
                    coefs_pm: pm,
                })
            }
            WireDpdData::Lut { scale, table } => {
                let table: [(f64, f64); 32] = table
                    .try_into()
                    .map_err(|_| SnapshotError::UnsupportedVersion(SNAPSHOT_FORMAT_VERSION))?;
                Ok(DpdData::Lut { scale, table })
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireSnapshot {
    version: u8,
    tx_gain: f64,
    rx_gain: f64,
    digital_gain: f64,
    dpddata: WireDpdData,
}

/// Full set of knobs the engine controls at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub tx_gain: f64,
    pub rx_gain: f64,
    pub digital_gain: f64,
    pub dpddata: DpdData,
}

impl Snapshot {
    /// Write this snapshot to `path` in the versioned binary format.
    pub fn write_to(&self, path: &Path) -> Result<(), SnapshotError> {
        let wire = WireSnapshot {
            version: SNAPSHOT_FORMAT_VERSION,
            tx_gain: self.tx_gain,
            rx_gain: self.rx_gain,
            digital_gain: self.digital_gain,
            dpddata: (&self.dpddata).into(),
        };
        let bytes = bincode::serialize(&wire)?;
        fs::write(path, bytes)?;
        Ok(())
    }

    /// Read and validate a snapshot file, rejecting unsupported versions.
    pub fn read_from(path: &Path) -> Result<Self, SnapshotError> {
        let bytes = fs::read(path)?;
        let wire: WireSnapshot = bincode::deserialize(&bytes)?;
        if wire.version != SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(wire.version));
        }
        Ok(Snapshot {
            tx_gain: wire.tx_gain,
            rx_gain: wire.rx_gain,
            digital_gain: wire.digital_gain,
            dpddata: wire.dpddata.try_into()?,
        })
    }

    /// The synthetic "defaults" snapshot: identity model, gains left at
    /// the given current values.
    pub fn defaults(tx_gain: f64, rx_gain: f64, digital_gain: f64) -> Self {
        Snapshot {
            tx_gain,
            rx_gain,
            digital_gain,
            dpddata: DpdData::Poly {
                coefs_am: {
                    let mut am = [0.0; crate::model::K];
                    am[0] = 1.0;
                    am
                },
                coefs_pm: [0.0; crate::model::K],
            },
        }
    }
}

/// Filename for a snapshot keyed by a unix timestamp.
pub fn filename_for(unix_timestamp: i64) -> String {
    format!("{FILENAME_PREFIX}{unix_timestamp}{FILENAME_SUFFIX}")
}

fn timestamp_from_filename(name: &str) -> Option<String> {
    let stem = name.strip_prefix(FILENAME_PREFIX)?.strip_suffix(FILENAME_SUFFIX)?;
    Some(stem.to_string())
}

/// Enumerate snapshot ids (the unix-timestamp component of each filename)
/// present in `directory`, used at startup to repopulate `adapt_dumps`.
pub fn enumerate_dumps(directory: &Path) -> Result<Vec<String>, SnapshotError> {
    let mut ids = Vec::new();
    if !directory.exists() {
        return Ok(ids);
    }
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if let Some(id) = timestamp_from_filename(name) {
                ids.push(id);
            }
        }
    }
    ids.sort();
    Ok(ids)
}

pub fn path_for_id(directory: &Path, id: &str) -> PathBuf {
    directory.join(format!("{FILENAME_PREFIX}{id}{FILENAME_SUFFIX}"))
}
