use thiserror::Error;

/// Errors raised while pulling and aligning a TX/RX sample pair.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("could not connect to modulator DPD feedback port: {0}")]
    Connect(#[source] std::io::Error),
    #[error("communication with modulator DPD feedback port failed: {0}")]
    Io(#[source] std::io::Error),
    #[error("modulator closed the connection before sending {expected} bytes (got {got})")]
    ShortRead { expected: usize, got: usize },
    #[error("alignment failed, capture is unusable")]
    AlignmentFailed,
}

impl From<std::io::Error> for CaptureError {
    fn from(source: std::io::Error) -> Self {
        CaptureError::Io(source)
    }
}

/// Errors from the statistic extractor.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExtractError {
    #[error("tx and rx frames have different lengths ({tx} vs {rx})")]
    LengthMismatch { tx: usize, rx: usize },
    #[error("tx and rx signals are not normalised to the same median amplitude")]
    NotNormalised,
}

/// Errors from the polynomial model trainer.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("tx_mean, rx_mean and phase_mean must have the same length")]
    LengthMismatch,
    #[error("not enough data points ({got}) to fit {k} coefficients")]
    NotEnoughData { got: usize, k: usize },
    #[error("dpd data has wrong tag, expected 'poly'")]
    WrongTag,
}

/// Errors from the RX AGC.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AgcError {
    #[error(
        "{measurements}\nRX too hot: calculated gain {gain:.2} dB is below minimum {min:.2} dB"
    )]
    TooHot {
        gain: f64,
        min: f64,
        measurements: String,
    },
    #[error(
        "{measurements}\nRX too cold: calculated gain {gain:.2} dB is above maximum {max:.2} dB, reset to safe gain"
    )]
    TooCold {
        gain: f64,
        max: f64,
        measurements: String,
    },
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// Errors from the modulator remote-control text protocol client.
#[derive(Debug, Error)]
pub enum ModulatorError {
    #[error("could not connect to modulator remote control port: {0}")]
    Connect(#[source] std::io::Error),
    #[error("communication with modulator remote control failed: {0}")]
    Io(#[source] std::io::Error),
    #[error("modulator rejected request: {0}")]
    Rejected(String),
    #[error("modulator sent a malformed reply: {0}")]
    MalformedReply(String),
}

impl From<std::io::Error> for ModulatorError {
    fn from(source: std::io::Error) -> Self {
        ModulatorError::Io(source)
    }
}

/// Errors from the Adapter (gains, predistorter file, snapshots).
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("gain {0} out of range [0, 89]")]
    GainOutOfRange(f64),
    #[error(transparent)]
    Modulator(#[from] ModulatorError),
    #[error("could not read/write predistorter file: {0}")]
    Io(#[from] std::io::Error),
    #[error("predistorter file has unknown format tag {0}")]
    UnknownFormat(u32),
    #[error("predistorter file has wrong entry count: expected {expected}, got {got}")]
    WrongEntryCount { expected: usize, got: usize },
    #[error("predistorter file is malformed: {0}")]
    Malformed(String),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Errors from snapshot persistence.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("could not read/write snapshot file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not decode snapshot: {0}")]
    Decode(#[from] Box<bincode::ErrorKind>),
    #[error("unsupported snapshot format version {0}")]
    UnsupportedVersion(u8),
}

/// Errors surfaced at the configuration-loading boundary.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("configuration file {path} has no [dpdce] section")]
    MissingSection { path: String },
    #[error("configuration key {key} is missing or has an invalid value")]
    InvalidKey { key: String },
}

/// Crate-wide error returned at the RPC boundary: every failure ends up
/// as a well-formed error response with a human-readable reason.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("busy: a command is already in progress")]
    Busy,
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Agc(#[from] AgcError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("unknown snapshot {0}")]
    UnknownSnapshot(String),
    #[error("unknown rpc method {0}")]
    UnknownMethod(String),
    #[error("malformed rpc request: {0}")]
    MalformedRequest(String),
}
