use std::{
    fs::File,
    io::BufReader,
    sync::Arc,
    time::Instant,
};

use argument::Cli;
use clap::Parser;
use relayscan::{
    config::ScanConfig,
    expander::{self, CandidateSource},
    initialize_logging, report,
    scanner::{self, format_elapsed},
    scheduler::{self, Task, WorkerPool},
    sink::{self, RecordSink},
};
use tokio::runtime;

mod argument;

fn main() {
    if let Err(e) = run_application() {
        eprintln!("Error: {:?}", e);
        std::process::exit(1);
    }
}

fn run_application() -> anyhow::Result<()> {
    let options = Cli::parse();
    let config = ScanConfig::load(&options.config)?;

    let log_level = if !config.log_enabled {
        log::LevelFilter::Off
    } else {
        match options.log_level.as_str() {
            "debug" => log::LevelFilter::Debug,
            "info" => log::LevelFilter::Info,
            "warn" => log::LevelFilter::Warn,
            "error" => log::LevelFilter::Error,
            "trace" => log::LevelFilter::Trace,
            _ => log::LevelFilter::Off,
        }
    };
    initialize_logging(log_level)?;

    if options.clash || options.tvgate {
        return report::generate_selected(
            &config,
            options.clash,
            options.tvgate,
            options.input.as_deref(),
            options.output.as_deref(),
            &options.name,
            options.maxsec,
        );
    }

    let runtime = runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run_scan(config))
}

async fn run_scan(config: ScanConfig) -> anyhow::Result<()> {
    let started = Instant::now();
    let config = Arc::new(config);

    let ports = expander::expand_ports(&config.ports)?;
    let seed_file = File::open(&config.cidr_file)
        .map_err(|e| anyhow::anyhow!("cannot open seed file {}: {}", config.cidr_file, e))?;
    let candidates = CandidateSource::new(BufReader::new(seed_file), ports);

    let record_sink =
        RecordSink::start(&config.successful_ips_file, config.file_buffer_size).await?;
    let records = record_sink.sender();

    let workers = config.max_concurrent_requests;
    let pool = WorkerPool::start(workers, scheduler::default_queue_capacity(workers));
    for candidate in candidates {
        let config = Arc::clone(&config);
        let records = records.clone();
        let action = {
            let candidate = candidate.clone();
            async move {
                scanner::probe_candidate(config, candidate, records).await;
            }
        };
        pool.submit(Task::new(candidate, action)).await?;
    }
    drop(records);
    pool.wait().await;
    record_sink.finish().await;
    sink::delete_stream_files()?;

    println!(
        "扫描完成，耗时 {}，结果已写入 {}",
        format_elapsed(started.elapsed()),
        config.successful_ips_file
    );
    Ok(())
}
