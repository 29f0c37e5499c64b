use tether::logger::*;

// $ cargo run --bin logger_demo
// $ RUST_LOG=trace cargo run --bin logger_demo   (the configured filter is then ignored)
fn main() -> anyhow::Result<()> {
    let logger = Logger::new_bootstrap();
    trace!("bootstrap trace log");
    debug!("bootstrap debug log");
    info!("bootstrap info log");

    let config = LogConfig {
        filter: "tether=debug,warn".to_string(),
    };
    logger.reload_from_config(&config)?;
    trace!("application trace log");
    debug!("application debug log");
    info!("application info log");

    Ok(())
}
