#![deny(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use iotroute::conf::{Options, Settings};
use iotroute::context::RouterContext;
use iotroute::logger::{config_logger, logger_init};
use iotroute::outbound::Publisher;
use iotroute::repository::FileRepository;
use iotroute::signing::Sha256Signer;
use iotroute::{log, structopt::StructOpt, Result};

/// Stands in for the broker client, every batch is written to the log
struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        log::info!("publish {} bytes to {}", payload.len(), topic);
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    //init config
    let settings = Settings::init(Options::from_args()).expect("settings init failed");

    //init log
    let logger = config_logger(&settings.log).expect("logger config failed");
    logger_init(logger, settings.log.level.inner()).expect("logger init failed");

    settings.logs();

    let repository = Arc::new(FileRepository::new(&settings.repository.data_dir));
    let ctx = RouterContext::new(settings.clone(), Arc::new(LogPublisher), repository, Arc::new(Sha256Signer));
    ctx.start();
    log::info!("iotroute started, inbound topics: {:?}", ctx.inbound.topics().collect::<Vec<_>>());

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("unable to listen for shutdown signal, {}", e);
    }
    log::info!("shutting down");
    if let Err(e) = ctx.shutdown().await {
        log::error!("shutdown failed, {}", e);
    }
    log::info!("metrics: {}", ctx.metrics.to_json());
}
