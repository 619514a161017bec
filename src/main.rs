use std::path::PathBuf;
use std::sync::Arc;

use gdbremote::{ControllerConfig, DetachedHost, ProcessController};

struct Args {
    url: String,
    config: Option<PathBuf>,
}

fn parse_args() -> Option<Args> {
    let mut args = std::env::args().skip(1);
    let mut url = None;
    let mut config = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config = Some(PathBuf::from(args.next()?)),
            _ if url.is_none() => url = Some(arg),
            _ => return None,
        }
    }
    Some(Args { url: url?, config })
}

#[tokio::main]
async fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .with_module_level("gdbremote", log::LevelFilter::Debug)
        .init()
        .unwrap();

    let Some(args) = parse_args() else {
        eprintln!("usage: rspdbg <host:port> [--config <file.json>]");
        std::process::exit(2);
    };

    let config = match &args.config {
        Some(path) => match ControllerConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                log::error!("{}", e);
                std::process::exit(1);
            }
        },
        None => ControllerConfig::default(),
    };

    let controller = ProcessController::new(config, Arc::new(DetachedHost::new()));
    if let Err(e) = controller.connect_remote(&args.url).await {
        log::error!("Failed to connect to {}: {}", args.url, e);
        std::process::exit(1);
    }

    println!("state: {}", controller.state());
    if let Some(pid) = controller.pid() {
        println!("pid: {}", pid);
    }
    if let Some(stop) = controller.last_stop() {
        println!("stop signal: {}", stop.signal);
    }
    let threads: Vec<String> = controller.thread_ids().iter().map(|tid| format!("0x{}", tid)).collect();
    println!("threads: [{}]", threads.join(", "));

    if let Err(e) = controller.detach().await {
        log::warn!("Detach failed: {}", e);
    }
    log::info!("Final state: {}", controller.state());
}
