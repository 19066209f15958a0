//! Pushes fitted coefficients to the modulator, manages gains, and
//! serialises/restores full engine snapshots, driving the wire client in
//! [`crate::modrc::ModulatorRc`].

use crate::capture::{CaptureClient, CaptureResult};
use crate::error::AdapterError;
use crate::model::{DpdData, K};
use crate::modrc::{self, ModulatorRc};
use crate::snapshot::Snapshot;
use std::fs;
use std::path::{Path, PathBuf};

const FORMAT_TAG_POLY: u32 = 1;
const FORMAT_TAG_LUT: u32 = 2;
const LUT_LEN: usize = 32;

/// Drives the modulator: gains, predistorter file, and capture requests.
/// Owns the RC client, the capture client, and the path to the
/// coefficient file the modulator is told to (re)load.
pub struct Adapter {
    rc: ModulatorRc,
    capture: CaptureClient,
    coef_file: PathBuf,
}

impl Adapter {
    pub fn new(rc: ModulatorRc, capture: CaptureClient, coef_file: PathBuf) -> Self {
        Adapter {
            rc,
            capture,
            coef_file,
        }
    }

    pub fn capture(&self) -> Result<CaptureResult, crate::error::CaptureError> {
        self.capture.capture()
    }

    /// RxAgc only needs the unaligned RX median; a full capture already
    /// computes it, so this is the same operation under a name that
    /// documents the caller's intent.
    pub fn capture_unaligned(&self) -> Result<CaptureResult, crate::error::CaptureError> {
        self.capture.capture()
    }

    pub fn set_txgain(&self, gain: f64) -> Result<(), AdapterError> {
        validate_gain(gain)?;
        self.rc.set("sdr", "txgain", &gain.to_string())?;
        Ok(())
    }

    /// Returns -1.0 on protocol error, the one non-fatal error channel.
    pub fn get_txgain(&self) -> f64 {
        self.rc
            .get("sdr", "txgain")
            .and_then(|reply| modrc::parse_single_f64(&reply))
            .unwrap_or(-1.0)
    }

    pub fn set_rxgain(&self, gain: f64) -> Result<(), AdapterError> {
        validate_gain(gain)?;
        self.rc.set("sdr", "rxgain", &gain.to_string())?;
        Ok(())
    }

    pub fn get_rxgain(&self) -> Result<f64, AdapterError> {
        let reply = self.rc.get("sdr", "rxgain")?;
        Ok(modrc::parse_single_f64(&reply)?)
    }

    pub fn set_digital_gain(&self, gain: f64) -> Result<(), AdapterError> {
        self.rc.set("digital", "gain", &gain.to_string())?;
        Ok(())
    }

    pub fn get_digital_gain(&self) -> f64 {
        self.rc
            .get("digital", "gain")
            .and_then(|reply| modrc::parse_single_f64(&reply))
            .unwrap_or(-1.0)
    }

    /// Write the coefficient file and instruct the modulator to load it.
    pub fn set_predistorter(&self, data: &DpdData) -> Result<(), AdapterError> {
        write_poly_file(&self.coef_file, data)?;
        self.rc
            .set("memlesspoly", "coeffile", self.coef_file.to_string_lossy().as_ref())?;
        Ok(())
    }

    pub fn get_predistorter(&self) -> Result<DpdData, AdapterError> {
        read_poly_file(&self.coef_file)
    }

    /// Persist the current adapter-visible state (gains queried live, the
    /// coefficients from the caller since the adapter itself does not own
    /// the model) to `path`.
    pub fn dump(&self, path: &Path, dpddata: DpdData) -> Result<(), AdapterError> {
        let snapshot = Snapshot {
            tx_gain: self.get_txgain(),
            rx_gain: self.get_rxgain()?,
            digital_gain: self.get_digital_gain(),
            dpddata,
        };
        snapshot.write_to(path)?;
        Ok(())
    }

    /// Restore a snapshot. To avoid transient overshoot: first set TX gain
    /// to 0, then restore digital gain, RX gain, predistorter, and TX gain
    /// last.
    pub fn restore(&self, path: &Path) -> Result<Snapshot, AdapterError> {
        let snapshot = Snapshot::read_from(path)?;
        self.set_txgain(0.0)?;
        self.set_digital_gain(snapshot.digital_gain)?;
        self.set_rxgain(snapshot.rx_gain)?;
        self.set_predistorter(&snapshot.dpddata)?;
        self.set_txgain(snapshot.tx_gain)?;
        Ok(snapshot)
    }
}

fn validate_gain(gain: f64) -> Result<(), AdapterError> {
    if !(0.0..=89.0).contains(&gain) {
        return Err(AdapterError::GainOutOfRange(gain));
    }
    Ok(())
}

/// Write a predistorter file in the engine's text format.
pub fn write_poly_file(path: &Path, data: &DpdData) -> Result<(), AdapterError> {
    let mut lines = Vec::new();
    match data {
        DpdData::Poly { coefs_am, coefs_pm } => {
            lines.push(FORMAT_TAG_POLY.to_string());
            lines.push(K.to_string());
            for c in coefs_am {
                lines.push(format!("{c:.17e}"));
            }
            for c in coefs_pm {
                lines.push(format!("{c:.17e}"));
            }
        }
        DpdData::Lut { scale, table } => {
            lines.push(FORMAT_TAG_LUT.to_string());
            lines.push((*scale as i64).to_string());
            for (re, im) in table {
                lines.push(format!("{re:.17e}"));
                lines.push(format!("{im:.17e}"));
            }
        }
    }
    fs::write(path, lines.join("\n") + "\n")?;
    Ok(())
}

/// Read and parse a predistorter file written by [`write_poly_file`].
pub fn read_poly_file(path: &Path) -> Result<DpdData, AdapterError> {
    let contents = fs::read_to_string(path)?;
    let mut lines = contents.lines();

    let tag: u32 = lines
        .next()
        .ok_or_else(|| AdapterError::Malformed("missing format tag".to_string()))?
        .trim()
        .parse()
        .map_err(|_| AdapterError::Malformed("format tag is not an integer".to_string()))?;

    match tag {
        FORMAT_TAG_POLY => {
            let k: usize = lines
                .next()
                .ok_or_else(|| AdapterError::Malformed("missing coefficient count".to_string()))?
                .trim()
                .parse()
                .map_err(|_| AdapterError::Malformed("coefficient count is not an integer".to_string()))?;
            if k != K {
                return Err(AdapterError::WrongEntryCount {
                    expected: K,
                    got: k,
                });
            }
            let values: Vec<f64> = lines
                .map(|l| {
                    l.trim()
                        .parse::<f64>()
                        .map_err(|_| AdapterError::Malformed(format!("bad coefficient value: {l}")))
                })
                .collect::<Result<_, _>>()?;
            if values.len() != 2 * K {
                return Err(AdapterError::WrongEntryCount {
                    expected: 2 * K,
                    got: values.len(),
                });
            }
            let coefs_am: [f64; K] = values[..K].try_into().unwrap();
            let coefs_pm: [f64; K] = values[K..].try_into().unwrap();
            Ok(DpdData::Poly { coefs_am, coefs_pm })
        }
        FORMAT_TAG_LUT => {
            let scale: f64 = lines
                .next()
                .ok_or_else(|| AdapterError::Malformed("missing lut scale".to_string()))?
                .trim()
                .parse()
                .map_err(|_| AdapterError::Malformed("lut scale is not a number".to_string()))?;
            let values: Vec<f64> = lines
                .map(|l| {
                    l.trim()
                        .parse::<f64>()
                        .map_err(|_| AdapterError::Malformed(format!("bad lut value: {l}")))
                })
                .collect::<Result<_, _>>()?;
            if values.len() != 2 * LUT_LEN {
                return Err(AdapterError::WrongEntryCount {
                    expected: 2 * LUT_LEN,
                    got: values.len(),
                });
            }
            let mut table = [(0.0, 0.0); LUT_LEN];
            for (i, entry) in table.iter_mut().enumerate() {
                *entry = (values[2 * i], values[2 * i + 1]);
            }
            Ok(DpdData::Lut { scale, table })
        }
        other => Err(AdapterError::UnknownFormat(other)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn poly_file_round_trips_to_float_text_precision() {
        let dir = std::env::temp_dir().join(format!("dpdce-adapter-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("coeffs.txt");

        let data = DpdData::Poly {
            coefs_am: [1.0, 0.123456, -0.5, 0.0, 2.5e-3],
            coefs_pm: [0.0, -0.01, 0.02, 0.03, -0.04],
        };
        write_poly_file(&path, &data).unwrap();
        let read_back = read_poly_file(&path).unwrap();
        assert_eq!(data, read_back);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rejects_wrong_coefficient_count() {
        let dir = std::env::temp_dir().join(format!("dpdce-adapter-test2-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("coeffs.txt");
        fs::write(&path, "1\n3\n1.0\n0.0\n0.0\n").unwrap();
        assert!(matches!(
            read_poly_file(&path),
            Err(AdapterError::WrongEntryCount { expected: 5, got: 3 })
        ));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rejects_unknown_format_tag() {
        let dir = std::env::temp_dir().join(format!("dpdce-adapter-test3-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("coeffs.txt");
        fs::write(&path, "7\n").unwrap();
        assert!(matches!(read_poly_file(&path), Err(AdapterError::UnknownFormat(7))));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn gain_out_of_range_is_rejected() {
        let rc = ModulatorRc::new("127.0.0.1:1".parse().unwrap());
        let capture = CaptureClient::new("127.0.0.1:1".parse().unwrap(), 1024);
        let adapter = Adapter::new(rc, capture, PathBuf::from("/tmp/nonexistent.txt"));
        assert!(matches!(
            adapter.set_txgain(100.0),
            Err(AdapterError::GainOutOfRange(_))
        ));
        assert!(matches!(
            adapter.set_txgain(-1.0),
            Err(AdapterError::GainOutOfRange(_))
        ));
    }
}
