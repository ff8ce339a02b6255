//! xs1-emu: emulator for XS1-class XCore devices.

use std::io::Write;

use xs1_emu::config::SimConfig;
use xs1_emu::loader::run_elf;
use xs1_emu::stats::SystemStats;
use xs1_emu::system::SystemState;
use xs1_emu::trace::LoggingTracer;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let mut config = SimConfig::load();
    let mut show_stats = false;
    let mut path = None;

    for arg in &args[1..] {
        match arg.as_str() {
            "--no-jit" => config.jit = false,
            "--slow-ports" => config.slow_ports = true,
            "--trace" => config.trace = true,
            "--stats" => show_stats = true,
            a if !a.starts_with('-') => path = Some(a),
            a => {
                eprintln!("unknown option: {}", a);
                std::process::exit(2);
            }
        }
    }

    let Some(path) = path else {
        eprintln!("usage: xs1-emu [--no-jit] [--slow-ports] [--trace] [--stats] <image.elf>");
        std::process::exit(2);
    };

    log::info!("Loading: {}", path);
    let data = std::fs::read(path)?;

    let (mut sys, core) = SystemState::single_core(config.clone());
    if config.trace {
        sys.set_tracer(Box::new(LoggingTracer));
    }

    let (status, stdout) = run_elf(&mut sys, core, &data)?;
    std::io::stdout().write_all(&stdout)?;

    if show_stats {
        eprintln!("{}", SystemStats::collect(&sys));
    }
    std::process::exit(status);
}
