use config::Config;
use fault::Faults;
use output::PipelineEvent;
use pipeline::Pipeline;

mod config;
mod fault;
mod logging;
mod mosaic;
mod output;
mod pipeline;

fn load_config() -> Config {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config::DEFAULT_CONFIG_PATH.to_string());
    match Config::load(&path) {
        Ok(config) => config,
        Err(e) => {
            if let Err(log_err) = logging::init("info", None) {
                eprintln!("logger: {:#}", log_err);
            }
            log::error!(target: "pipeline", "{:#}", e);
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() -> ! {
    let config = load_config();
    if let Err(e) = logging::init(&config.log_level, config.log_file.as_deref()) {
        eprintln!("Error initializing logging: {:#}", e);
        std::process::exit(1);
    }
    if let Err(e) = ffmpeg_bus::init() {
        log::error!(target: "pipeline", "{:#}", e);
        std::process::exit(1);
    }

    let faults = Faults::new();
    let mut fault_rx = faults.subscribe();
    let mut pipeline = match Pipeline::initialize(&config, faults).await {
        Ok(pipeline) => pipeline,
        Err(e) => {
            log::error!(target: "pipeline", "startup failed: {:#}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = pipeline.start() {
        log::error!(target: "pipeline", "start failed: {:#}", e);
        pipeline.stop_all().await;
        std::process::exit(1);
    }

    let code = loop {
        tokio::select! {
            event = pipeline.next_event() => match event {
                Some(PipelineEvent::Broken { output }) => {
                    log::error!(target: "pipeline", "output {} broken, stopping", output);
                    break 1;
                }
                None => break 1,
            },
            fault = fault_rx.recv() => {
                if let Ok(fault) = fault {
                    log::warn!(target: "pipeline", "fault from {}: {}", fault.origin, fault.message);
                }
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!(target: "pipeline", "interrupted");
                break 0;
            },
        }
    };

    pipeline.stop_all().await;
    std::process::exit(code);
}
