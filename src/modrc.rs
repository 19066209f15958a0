//! Client for the modulator's remote-control protocol: multipart text
//! request/reply over TCP, one connection per request.

use crate::error::ModulatorError;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// One connection per request; the modulator's remote-control protocol is
/// request/reply, not a persistent session.
pub struct ModulatorRc {
    address: SocketAddr,
}

impl ModulatorRc {
    pub fn new(address: SocketAddr) -> Self {
        ModulatorRc { address }
    }

    /// Send `verb args...` and return the reply split into whitespace
    /// tokens. A leading `fail` token is turned into a `Rejected` error.
    pub fn request(&self, verb: &str, args: &[&str]) -> Result<Vec<String>, ModulatorError> {
        let mut stream = TcpStream::connect_timeout(&self.address, REQUEST_TIMEOUT)
            .map_err(ModulatorError::Connect)?;
        stream.set_read_timeout(Some(REQUEST_TIMEOUT))?;
        stream.set_write_timeout(Some(REQUEST_TIMEOUT))?;

        let mut line = verb.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        line.push('\n');
        stream.write_all(line.as_bytes())?;

        let mut reader = BufReader::new(stream);
        let mut reply = String::new();
        reader.read_line(&mut reply)?;
        let reply = reply.trim_end();

        let parts: Vec<String> = reply.split_whitespace().map(String::from).collect();
        if let Some(first) = parts.first() {
            if first == "fail" {
                let reason = parts[1..].join(" ");
                return Err(ModulatorError::Rejected(reason));
            }
        }
        Ok(parts)
    }

    pub fn get(&self, module: &str, param: &str) -> Result<Vec<String>, ModulatorError> {
        self.request("get", &[module, param])
    }

    pub fn set(&self, module: &str, param: &str, value: &str) -> Result<Vec<String>, ModulatorError> {
        self.request("set", &[module, param, value])
    }

    pub fn ping(&self) -> Result<(), ModulatorError> {
        self.request("ping", &[]).map(|_| ())
    }
}

/// Parse a single numeric reply token, the common shape of `get` replies.
pub fn parse_single_f64(reply: &[String]) -> Result<f64, ModulatorError> {
    reply
        .last()
        .ok_or_else(|| ModulatorError::MalformedReply("empty reply".to_string()))?
        .parse::<f64>()
        .map_err(|e| ModulatorError::MalformedReply(e.to_string()))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    fn serve_once(reply: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(socket.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let mut socket = socket;
            socket.write_all(reply.as_bytes()).unwrap();
        });
        addr
    }

    #[test]
    fn get_parses_a_numeric_reply() {
        let addr = serve_once("ok sdr rxgain 30.5\n");
        let rc = ModulatorRc::new(addr);
        let reply = rc.get("sdr", "rxgain").unwrap();
        assert!((parse_single_f64(&reply).unwrap() - 30.5).abs() < 1e-9);
    }

    #[test]
    fn fail_reply_surfaces_as_rejected() {
        let addr = serve_once("fail unknown parameter\n");
        let rc = ModulatorRc::new(addr);
        let err = rc.get("sdr", "bogus").unwrap_err();
        match err {
            ModulatorError::Rejected(reason) => assert_eq!(reason, "unknown parameter"),
            other => panic!("expected Rejected, got {other:?}"),
        }
    }
}
