use crate::cli::Commands;
use crate::config::ServerConfig;
use crate::master::Master;
use crate::Result;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::info;

pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Serve { config, bind } => handle_serve(config, bind).await,
        Commands::Config => handle_config(),
        Commands::Check { config } => handle_check(config),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<ServerConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            ServerConfig::load(&path)
        }
        None => Ok(ServerConfig::default()),
    }
}

async fn handle_serve(config: Option<PathBuf>, bind: Option<String>) -> Result<()> {
    let mut config = load_config(config)?;
    if let Some(bind) = bind {
        config.bind_address = bind;
    }

    let listener = TcpListener::bind(&config.bind_address).await?;
    let master = Master::with_memory_store(config).await?;

    master
        .serve(listener, async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
        })
        .await
}

fn handle_config() -> Result<()> {
    print!("{}", ServerConfig::default().to_yaml()?);
    Ok(())
}

fn handle_check(path: PathBuf) -> Result<()> {
    let config = ServerConfig::load(&path)?;
    println!(
        "{}: ok ({} storage group(s), admission {})",
        path.display(),
        config.storage.len(),
        config.admission_control
    );
    Ok(())
}
