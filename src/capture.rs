//! TCP client for the modulator's DPD feedback port: pulls a matched TX/RX
//! IQ sample pair, renormalises RX to TX's median amplitude, and hands the
//! pair to [`crate::align`].

use crate::align;
use crate::error::CaptureError;
use rustfft::num_complex::Complex64;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

const PROTOCOL_VERSION: u8 = 0x01;
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(4);

/// A timestamp in the modulator's (seconds, ticks) representation, tick
/// unit 1/16384000 s.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timestamp {
    pub seconds: u32,
    pub ticks: u32,
}

impl Timestamp {
    const TICK_HZ: f64 = 16_384_000.0;

    /// Convert to a monotonic double, seconds since the same epoch as `seconds`.
    pub fn as_seconds_f64(&self) -> f64 {
        self.seconds as f64 + self.ticks as f64 / Self::TICK_HZ
    }
}

/// Matched TX/RX IQ frames pulled from one capture, aligned and
/// renormalised.
#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub tx: Vec<Complex64>,
    pub rx: Vec<Complex64>,
    pub tx_ts: Timestamp,
    pub rx_ts: Timestamp,
    pub tx_median: f64,
    pub rx_median: f64,
}

/// Stateless helper holding only the modulator's feedback endpoint and the
/// sample-request count.
pub struct CaptureClient {
    address: SocketAddr,
    num_samps: u32,
}

impl CaptureClient {
    pub fn new(address: SocketAddr, num_samps: u32) -> Self {
        CaptureClient { address, num_samps }
    }

    /// Connect, request `num_samps` samples, align, and return the result.
    pub fn capture(&self) -> Result<CaptureResult, CaptureError> {
        let mut stream = TcpStream::connect_timeout(&self.address, Duration::from_secs(1))
            .map_err(CaptureError::Connect)?;
        stream.set_read_timeout(Some(RECEIVE_TIMEOUT))?;
        stream.set_write_timeout(Some(RECEIVE_TIMEOUT))?;

        stream.write_all(&[PROTOCOL_VERSION])?;
        stream.write_all(&self.num_samps.to_le_bytes())?;

        let mut header = [0u8; 12];
        read_exact_counted(&mut stream, &mut header)?;
        let num_samps = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let tx_second = u32::from_le_bytes(header[4..8].try_into().unwrap());
        let tx_pps = u32::from_le_bytes(header[8..12].try_into().unwrap());

        let mut tx_bytes = vec![0u8; num_samps as usize * 8];
        read_exact_counted(&mut stream, &mut tx_bytes)?;
        let tx = decode_iq(&tx_bytes);

        let mut rx_header = [0u8; 8];
        read_exact_counted(&mut stream, &mut rx_header)?;
        let rx_second = u32::from_le_bytes(rx_header[0..4].try_into().unwrap());
        let rx_pps = u32::from_le_bytes(rx_header[4..8].try_into().unwrap());

        let mut rx_bytes = vec![0u8; num_samps as usize * 8];
        read_exact_counted(&mut stream, &mut rx_bytes)?;
        let mut rx = decode_iq(&rx_bytes);

        let tx_median = median_abs(&tx);
        let rx_median_raw = median_abs(&rx);
        if rx_median_raw > 0.0 {
            let scale = tx_median / rx_median_raw;
            for s in rx.iter_mut() {
                *s *= scale;
            }
        }
        let rx_median = rx_median_raw;

        let (tx_aligned, rx_aligned) = align::align(&tx, &rx).ok_or(CaptureError::AlignmentFailed)?;

        Ok(CaptureResult {
            tx: tx_aligned,
            rx: rx_aligned,
            tx_ts: Timestamp {
                seconds: tx_second,
                ticks: tx_pps,
            },
            rx_ts: Timestamp {
                seconds: rx_second,
                ticks: rx_pps,
            },
            tx_median,
            rx_median,
        })
    }
}

fn read_exact_counted(stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), CaptureError> {
    match stream.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(CaptureError::ShortRead {
            expected: buf.len(),
            got: 0,
        }),
        Err(e) => Err(CaptureError::from(e)),
    }
}

fn decode_iq(bytes: &[u8]) -> Vec<Complex64> {
    bytes
        .chunks_exact(8)
        .map(|chunk| {
            let i = f32::from_le_bytes(chunk[0..4].try_into().unwrap());
            let q = f32::from_le_bytes(chunk[4..8].try_into().unwrap());
            Complex64::new(i as f64, q as f64)
        })
        .collect()
}

pub(crate) fn median_abs(samples: &[Complex64]) -> f64 {
    let mut mags: Vec<f64> = samples.iter().map(|s| s.norm()).collect();
    mags.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = mags.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 0 {
        (mags[n / 2 - 1] + mags[n / 2]) / 2.0
    } else {
        mags[n / 2]
    }
}
