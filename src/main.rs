use clap::Parser;
use dpdce::adapter::Adapter;
use dpdce::capture::CaptureClient;
use dpdce::config::EngineConfig;
use dpdce::modrc::ModulatorRc;
use dpdce::orchestrator::Orchestrator;
use dpdce::rpc;
use std::net::UdpSocket;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the INI configuration file's `[dpdce]` section.
    #[arg(short, long, env = "DPDCE_CONFIG", default_value = "dpdce.ini")]
    config: PathBuf,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let config = match EngineConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = std::fs::create_dir_all(&config.logs_directory) {
        log::error!("could not create logs directory {:?}: {e}", config.logs_directory);
        return ExitCode::FAILURE;
    }

    let rc = ModulatorRc::new(config.rc_addr());
    let capture = CaptureClient::new(config.dpd_feedback_addr(), config.samps);
    let adapter = Adapter::new(rc, capture, config.coef_file.clone());

    let control_addr = config.control_addr();
    let orchestrator = Orchestrator::spawn(config, adapter);

    let socket = match UdpSocket::bind(control_addr) {
        Ok(s) => s,
        Err(e) => {
            log::error!("could not bind engine rpc socket on {control_addr}: {e}");
            return ExitCode::FAILURE;
        }
    };
    log::info!("dpdce listening for rpc on {control_addr}");

    if let Err(e) = rpc::serve(socket, &orchestrator) {
        log::error!("rpc server terminated: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
