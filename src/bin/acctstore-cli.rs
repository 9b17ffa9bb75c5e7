//! acctstore-cli
//!
//! Minimal command-line front end over the `acctstore` library, kept
//! deliberately thin: the manager is the product, this binary just
//! exercises it from a shell.
//!
//! Usage:
//!   acctstore-cli new --datadir <dir> --passphrase <pass>
//!   acctstore-cli list --datadir <dir>
//!   acctstore-cli sign --datadir <dir> --address <hex> --passphrase <pass> --hash <hex>

use acctstore::{Manager, ManagerConfig};
use alloy_primitives::{Address, B256};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "acctstore-cli", about = "Encrypted keystore account manager")]
struct Args {
    /// Keystore directory.
    #[arg(long, global = true, default_value = "keystore")]
    datadir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new account and write its encrypted key file.
    New {
        #[arg(long)]
        passphrase: String,
    },
    /// List every account currently indexed.
    List,
    /// Sign a 32-byte hash with an unlocked (or passphrase-supplied) key.
    Sign {
        #[arg(long)]
        address: String,
        #[arg(long)]
        passphrase: String,
        #[arg(long)]
        hash: String,
    },
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let manager = Manager::open(ManagerConfig::memory(args.datadir)).await?;

    match args.command {
        Command::New { passphrase } => {
            let account = manager.new_account(passphrase).await?;
            println!("{:#x}  {}", account.address, account.file.display());
        }
        Command::List => {
            for account in manager.accounts() {
                println!("{:#x}  {}", account.address, account.file.display());
            }
        }
        Command::Sign { address, passphrase, hash } => {
            let address: Address = address.parse()?;
            let hash: B256 = hash.parse()?;
            let account = acctstore::Account::by_address(address);
            let signature = manager.sign_with_passphrase(&account, &passphrase, hash).await?;
            println!("{signature:?}");
        }
    }

    manager.close().await;
    Ok(())
}
