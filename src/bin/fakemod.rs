//! Standalone mock modulator: serves the DPD feedback TCP protocol with a
//! synthetic mildly-compressing power amplifier, and the remote-control
//! text protocol with in-memory gains, for manual exercising of the engine
//! without real hardware. One thread per connection; `rand`/`rand_distr`
//! synthesize plausible measurement noise.

use rand::Rng;
use rand_distr::StandardNormal;
use std::f64::consts::TAU;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process;
use std::sync::{Arc, Mutex};
use std::thread;

/// Mild AM/AM compression, the PA model the engine is meant to linearise.
fn pa_gain(amplitude: f64) -> f64 {
    1.0 - 0.2 * amplitude * amplitude
}

struct ModulatorState {
    tx_gain: f64,
    rx_gain: f64,
    digital_gain: f64,
    coef_file: Option<String>,
}

impl ModulatorState {
    fn new() -> Self {
        ModulatorState {
            tx_gain: 65.0,
            rx_gain: 30.0,
            digital_gain: 1.0,
            coef_file: None,
        }
    }
}

fn dpd_feedback_connection(mut stream: TcpStream) {
    let mut version = [0u8; 1];
    if stream.read_exact(&mut version).is_err() {
        return;
    }
    let mut n_buf = [0u8; 4];
    if stream.read_exact(&mut n_buf).is_err() {
        return;
    }
    let num_samps = u32::from_le_bytes(n_buf);

    let mut rng = rand::rng();
    let mut tx = Vec::with_capacity(num_samps as usize);
    for k in 0..num_samps {
        let amp = 0.1 + 0.8 * ((k as f64 / num_samps as f64) * TAU * 3.0).sin().abs();
        let phase = TAU * (k as f64 / 41.0);
        tx.push((amp * phase.cos(), amp * phase.sin()));
    }

    let mut tx_bytes = Vec::with_capacity(tx.len() * 8);
    let mut rx_bytes = Vec::with_capacity(tx.len() * 8);
    for (i, q) in &tx {
        tx_bytes.extend((*i as f32).to_le_bytes());
        tx_bytes.extend((*q as f32).to_le_bytes());

        let amp = (i * i + q * q).sqrt();
        let gain = pa_gain(amp);
        let noise: f64 = rng.sample(StandardNormal);
        let rx_i = i * gain + noise * 0.001;
        let rx_q = q * gain + noise * 0.001;
        rx_bytes.extend((rx_i as f32).to_le_bytes());
        rx_bytes.extend((rx_q as f32).to_le_bytes());
    }

    let write_result = (|| -> std::io::Result<()> {
        stream.write_all(&num_samps.to_le_bytes())?;
        stream.write_all(&42u32.to_le_bytes())?;
        stream.write_all(&0u32.to_le_bytes())?;
        stream.write_all(&tx_bytes)?;
        stream.write_all(&42u32.to_le_bytes())?;
        stream.write_all(&100u32.to_le_bytes())?;
        stream.write_all(&rx_bytes)?;
        Ok(())
    })();
    if let Err(e) = write_result {
        println!("dpd feedback connection error: {e}");
    }
}

fn rc_connection(mut stream: TcpStream, state: Arc<Mutex<ModulatorState>>) {
    loop {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match stream.read(&mut byte) {
                Ok(0) => return,
                Ok(_) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    line.push(byte[0]);
                }
                Err(_) => return,
            }
        }
        let text = String::from_utf8_lossy(&line);
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let reply = handle_rc(&tokens, &state);
        if stream.write_all(format!("{reply}\n").as_bytes()).is_err() {
            return;
        }
    }
}

fn handle_rc(tokens: &[&str], state: &Arc<Mutex<ModulatorState>>) -> String {
    let mut guard = state.lock().unwrap();
    match tokens {
        ["ping"] => "ok pong".to_string(),
        ["get", "sdr", "txgain"] => format!("ok sdr txgain {}", guard.tx_gain),
        ["set", "sdr", "txgain", value] => match value.parse::<f64>() {
            Ok(v) => {
                guard.tx_gain = v;
                "ok sdr txgain".to_string()
            }
            Err(_) => "fail bad txgain value".to_string(),
        },
        ["get", "sdr", "rxgain"] => format!("ok sdr rxgain {}", guard.rx_gain),
        ["set", "sdr", "rxgain", value] => match value.parse::<f64>() {
            Ok(v) => {
                guard.rx_gain = v;
                "ok sdr rxgain".to_string()
            }
            Err(_) => "fail bad rxgain value".to_string(),
        },
        ["get", "digital", "gain"] => format!("ok digital gain {}", guard.digital_gain),
        ["set", "digital", "gain", value] => match value.parse::<f64>() {
            Ok(v) => {
                guard.digital_gain = v;
                "ok digital gain".to_string()
            }
            Err(_) => "fail bad digital gain value".to_string(),
        },
        ["set", "memlesspoly", "coeffile", path] => {
            guard.coef_file = Some((*path).to_string());
            "ok memlesspoly coeffile".to_string()
        }
        ["get", "memlesspoly", "coeffile"] => match &guard.coef_file {
            Some(path) => format!("ok memlesspoly coeffile {path}"),
            None => "fail no coeffile loaded".to_string(),
        },
        _ => "fail unknown command".to_string(),
    }
}

fn main() {
    let dpd_address = "127.0.0.1:50055";
    let rc_address = "127.0.0.1:9400";

    let state = Arc::new(Mutex::new(ModulatorState::new()));

    let dpd_listener = match TcpListener::bind(dpd_address) {
        Ok(l) => l,
        Err(err) => {
            println!("Failed to bind dpd feedback port {dpd_address} ({err})");
            process::exit(1);
        }
    };
    let rc_listener = match TcpListener::bind(rc_address) {
        Ok(l) => l,
        Err(err) => {
            println!("Failed to bind rc port {rc_address} ({err})");
            process::exit(1);
        }
    };

    println!("fakemod: dpd feedback on {dpd_address}, rc on {rc_address}");

    let rc_state = state.clone();
    let rc_thread = thread::spawn(move || {
        for stream in rc_listener.incoming() {
            match stream {
                Ok(stream) => {
                    let state = rc_state.clone();
                    thread::spawn(move || rc_connection(stream, state));
                }
                Err(err) => println!("Failed to accept rc connection ({err})"),
            }
        }
    });

    for stream in dpd_listener.incoming() {
        match stream {
            Ok(stream) => {
                thread::spawn(move || dpd_feedback_connection(stream));
            }
            Err(err) => println!("Failed to accept dpd feedback connection ({err})"),
        }
    }

    rc_thread.join().ok();
}
