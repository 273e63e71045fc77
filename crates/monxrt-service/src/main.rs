//! MONXRT service entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use monxrt_common::debug::ServiceOptions;
use monxrt_service::device::{dump_table, DeviceProvider, StubDevices};
use monxrt_service::render_loop;
use monxrt_service::server::Server;
use monxrt_service::socket::{ControlListener, DEFAULT_SOCKET_PATH};
use monxrt_compositor::HeadlessCompositor;
use monxrt_timing::DisplayTiming;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "monxrt-service")]
#[command(about = "MONXRT runtime service - arbitrates one HMD across clients")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the service.
    Service {
        /// Control socket path. Ignored when the supervisor passes a
        /// socket-activation fd.
        #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
        socket: PathBuf,
    },

    /// Probe and dump the device table, then exit.
    Test,
}

fn main() -> ExitCode {
    monxrt_common::init_tracing();

    let args = Args::parse();
    let options = ServiceOptions::from_env();

    match args.command {
        Command::Service { socket } => match run_service(options, &socket) {
            Ok(clean) => {
                if clean {
                    ExitCode::SUCCESS
                } else {
                    // Runtime failure after a successful start.
                    ExitCode::from(2)
                }
            }
            Err(err) => {
                error!(%err, "service failed to start");
                ExitCode::from(1)
            }
        },
        Command::Test => {
            let devices = StubDevices::new(&options);
            print!("{}", dump_table(&devices.table()));
            ExitCode::SUCCESS
        }
    }
}

/// Bring the service up and run the render loop on this thread. Returns
/// `Ok(true)` for a clean stop, `Ok(false)` for a runtime failure.
fn run_service(options: ServiceOptions, socket: &std::path::Path) -> Result<bool> {
    let devices = Box::new(StubDevices::new(&options));

    // The headless compositor synthesizes presentation feedback, so the
    // closed-loop pacer applies. A backend with no feedback would pick the
    // fake pacer here instead.
    let pacer = Box::new(DisplayTiming::new(devices.frame_interval_ns()));
    let compositor = Box::new(HeadlessCompositor::new(pacer));

    let server = Server::new(options, devices, compositor)?;

    let listener = match ControlListener::from_activation() {
        Some(listener) => listener,
        None => ControlListener::bind(socket)?,
    };

    render_loop::run(Arc::clone(&server), listener)?;

    Ok(server.clean_shutdown())
}
