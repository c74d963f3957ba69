#![deny(unsafe_code)]

//! Entry point of the pool control daemon. Grounded on
//! `drmemd/src/main.rs`'s `init_app`/`run`/`#[tokio::main]` shape:
//! read the boot configuration, install the global tracing
//! subscriber, build the system, and run it until the process is
//! killed.

mod actuator;
mod algorithms;
mod board_fake;
mod chemical_tank;
mod config;
mod filter_monitor;
mod flow_sensor;
mod lightlink_fake;
mod lightlink_net;
mod pool_config;
mod repository;
mod scheduler;
mod sensor;
mod system;
mod water;

use std::sync::Arc;

use tracing::info;

use board_fake::FakeBoard;
use lightlink_net::TcpLightLink;
use repository::MemoryRepository;
use system::System;

/// Determines the boot configuration and installs the log subscriber.
/// Returns `None` if the process should exit immediately (e.g.
/// `--print-config` was given).
async fn init_app() -> Option<config::Config> {
    if let Some(cfg) = config::get().await {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(cfg.get_log_level())
            .with_target(false)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("unable to set global default subscriber");
        Some(cfg)
    } else {
        None
    }
}

/// Builds and runs the installation. No real serial-link `Board`
/// implementation ships in this workspace (`spec.md` §1 treats the
/// hardware driver as an external collaborator); `FakeBoard` stands in
/// as the runtime default until one is plugged in. The LUMIPLUS light
/// link is real, since that's a plain TCP protocol this crate owns
/// end to end.
async fn run() -> poolctl_api::Result<()> {
    if let Some(cfg) = init_app().await {
        let board: Arc<dyn poolctl_api::Board> = Arc::new(FakeBoard::new());
        let light_link: Arc<dyn poolctl_api::LightLink> = Arc::new(TcpLightLink::new());
        let repo: Arc<dyn poolctl_api::Repository> = Arc::new(MemoryRepository::new());

        info!("starting pool controller");

        let system = System::new(board, light_link, repo, &cfg);
        system.load_state().await;
        system.start();

        info!("pool controller running");
        std::future::pending::<()>().await;
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}
