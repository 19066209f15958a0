//! UDP "engine RPC": YAML-encoded request/response, one packet per call.

use crate::error::EngineError;
use crate::orchestrator::{Command, Orchestrator};
use crate::snapshot::WireDpdData;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_PACKET_BYTES: usize = 2048;

#[derive(Debug, Deserialize, Serialize)]
struct RpcRequest {
    #[allow(dead_code)]
    yamlrpc: String,
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    yamlrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunStateWire {
    n_runs: u32,
    current_dpddata: WireDpdData,
    state: String,
    stateprogress: u8,
    summary: Vec<String>,
    latest_plot_refs: Vec<String>,
    adapt_dumps: Vec<String>,
}

impl From<&crate::orchestrator::RunState> for RunStateWire {
    fn from(rs: &crate::orchestrator::RunState) -> Self {
        RunStateWire {
            n_runs: rs.n_runs,
            current_dpddata: (&rs.current_dpddata).into(),
            state: format!("{:?}", rs.state),
            stateprogress: rs.stateprogress,
            summary: rs.summary.clone(),
            latest_plot_refs: rs.latest_plot_refs.clone(),
            adapt_dumps: rs.adapt_dumps.clone(),
        }
    }
}

/// Blocking UDP server: receives one request per packet, dispatches to
/// `orchestrator`, and replies to the sender. Callers typically run this
/// on its own thread for the lifetime of the process; there is no
/// cancellation signal, only process exit.
pub fn serve(socket: UdpSocket, orchestrator: &Orchestrator) -> std::io::Result<()> {
    socket.set_read_timeout(Some(RECEIVE_TIMEOUT))?;
    let mut buf = [0u8; MAX_PACKET_BYTES];
    loop {
        let (n, src) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                continue;
            }
            Err(e) => return Err(e),
        };
        let reply = handle_packet(&buf[..n], orchestrator);
        send_reply(&socket, src, &reply);
    }
}

fn handle_packet(bytes: &[u8], orchestrator: &Orchestrator) -> RpcResponse {
    let request: RpcRequest = match serde_yaml::from_slice(bytes) {
        Ok(r) => r,
        Err(e) => {
            return RpcResponse {
                yamlrpc: "2.0",
                id: Value::Null,
                result: None,
                error: Some(format!("malformed rpc request: {e}")),
            };
        }
    };

    let outcome = dispatch(&request.method, &request.params, orchestrator);
    match outcome {
        Ok(result) => RpcResponse {
            yamlrpc: "2.0",
            id: request.id,
            result: Some(result),
            error: None,
        },
        Err(e) => RpcResponse {
            yamlrpc: "2.0",
            id: request.id,
            result: None,
            error: Some(e.to_string()),
        },
    }
}

fn dispatch(method: &str, params: &Value, orchestrator: &Orchestrator) -> Result<Value, EngineError> {
    match method {
        "calibrate" => {
            orchestrator.submit(Command::Calibrate)?;
            Ok(Value::Null)
        }
        "reset" => {
            orchestrator.submit(Command::Reset)?;
            Ok(Value::Null)
        }
        "trigger_run" => {
            orchestrator.submit(Command::TriggerRun)?;
            Ok(Value::Null)
        }
        "adapt" => {
            orchestrator.submit(Command::Adapt)?;
            Ok(Value::Null)
        }
        "restore_dump" => {
            let dump_id = params
                .get("dump_id")
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::MalformedRequest("missing dump_id".to_string()))?
                .to_string();
            orchestrator.submit(Command::RestoreDump { dump_id })?;
            Ok(Value::Null)
        }
        "get_results" => {
            let run_state = orchestrator.get_results();
            let wire = RunStateWire::from(&run_state);
            serde_yaml::to_value(wire)
                .map_err(|e| EngineError::MalformedRequest(format!("could not encode run state: {e}")))
        }
        other => Err(EngineError::UnknownMethod(other.to_string())),
    }
}

fn send_reply(socket: &UdpSocket, dest: SocketAddr, reply: &RpcResponse) {
    match serde_yaml::to_string(reply).map(String::into_bytes) {
        Ok(bytes) => {
            if bytes.len() > MAX_PACKET_BYTES {
                log::warn!("rpc reply exceeds packet size budget: {} bytes", bytes.len());
            }
            if let Err(e) = socket.send_to(&bytes, dest) {
                log::warn!("failed to send rpc reply to {dest}: {e}");
            }
        }
        Err(e) => log::error!("failed to encode rpc reply: {e}"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unknown_method_round_trips_as_an_error_reply() {
        let req = RpcRequest {
            yamlrpc: "2.0".to_string(),
            id: Value::from(1),
            method: "bogus".to_string(),
            params: Value::Null,
        };
        let bytes = serde_yaml::to_string(&serde_yaml::to_value(&req).unwrap())
            .unwrap()
            .into_bytes();
        let parsed: RpcRequest = serde_yaml::from_slice(&bytes).unwrap();
        assert_eq!(parsed.method, "bogus");
    }
}
