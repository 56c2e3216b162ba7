use std::env;
use std::error::Error;
use std::io::Write;

use log::error;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};
use tokio::net::TcpListener;

use crate::bx::miner::MinerClient;
use crate::bx::pool::PoolServer;
use crate::bx::wallet::Wallet;
use crate::config::AppConfig;

mod bx;
mod config;

pub type Result<T> = std::result::Result<T, Box<dyn Error>>;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    print_banner()?;

    let config = AppConfig::from_env();
    config.log_config();

    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("serve") | None => serve(&config).await?,
        Some("mine") => {
            let address = args
                .get(2)
                .cloned()
                .or_else(|| env::var("BLIX_WALLET_ADDRESS").ok())
                .ok_or("usage: blix mine <wallet-address>")?;
            let miner = MinerClient::new(address, config.mining.lanes)?;
            if let Err(e) = miner.run(&config.network.coordinator).await {
                error!("miner stopped: {}", e);
            }
        }
        Some("wallet") => {
            let wallet = Wallet::generate();
            println!("address:    {}", wallet.address);
            println!("public key: {}", wallet.public_key_hex());
            println!("secret key: {}", wallet.secret_key_hex());
        }
        Some(other) => {
            eprintln!("unknown command: {}", other);
            print_usage();
        }
    }

    Ok(())
}

async fn serve(config: &AppConfig) -> Result<()> {
    let listener = TcpListener::bind((config.network.bind_ip, config.network.port)).await?;
    let server = PoolServer::from_config(&config.pool);
    server.run(listener).await?;
    Ok(())
}

fn print_banner() -> std::io::Result<()> {
    let mut stdout = StandardStream::stdout(ColorChoice::Auto);
    let mut header = ColorSpec::new();
    header.set_fg(Some(Color::Cyan)).set_bold(true);
    stdout.set_color(&header)?;
    writeln!(stdout, "blix — proof-of-work mining pool")?;
    stdout.reset()?;
    Ok(())
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  blix serve                  start the pool coordinator");
    eprintln!("  blix mine <wallet-address>  join the pool and mine");
    eprintln!("  blix wallet                 generate a keypair and address");
}
