use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::info;

use portera::config::Config;
use portera::pool::postgres::PostgresBackend;
use portera::pool::Pool;
use portera::server::{stats, ListenerRole, Server, ServerStats};

#[derive(Parser)]
#[command(name = "portera")]
#[command(about = "A connection-routing proxy for PostgreSQL streaming-replication deployments")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Path to the portera configuration file
    #[arg(short = 'f', long = "config", value_name = "PATH", default_value = "/etc/portera/config.ini")]
    config: PathBuf,

    /// Address the stats HTTP endpoint listens on
    #[arg(short = 'p', long = "stats", value_name = "HOST:PORT", default_value = "127.0.0.1:6060")]
    stats: String,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let config = match Config::load_from_file(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            log::error!(
                "could not load configuration file {}: {err}",
                cli.config.display()
            );
            std::process::exit(1);
        }
    };

    let pool = Arc::new(Pool::new());
    for addr in config.backend_addrs() {
        let backend = match PostgresBackend::new(&addr, &config.health) {
            Ok(backend) => backend,
            Err(err) => {
                log::error!("invalid backend {addr}: {err}");
                std::process::exit(1);
            }
        };
        pool.register(Arc::new(backend)).await;
    }

    let server_stats = Arc::new(ServerStats::default());
    let server = Server::new(Arc::clone(&pool), Arc::clone(&server_stats));

    info!("starting up...");
    tokio::select! {
        res = server.listen(&config.main.primary, ListenerRole::Primary) => {
            if let Err(err) = res {
                log::error!("primary listener failed: {err}");
                std::process::exit(1);
            }
        }
        res = server.listen(&config.main.follower, ListenerRole::Follower) => {
            if let Err(err) = res {
                log::error!("follower listener failed: {err}");
                std::process::exit(1);
            }
        }
        res = stats::serve(&cli.stats, Arc::clone(&server_stats)) => {
            if let Err(err) = res {
                log::error!("stats endpoint failed: {err}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            pool.shutdown().await;
        }
    }
}
