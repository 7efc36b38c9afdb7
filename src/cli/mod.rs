use crate::client::{ClientConfig, TorrentClient};
use crate::error::{BittorrentError, Result};
use crate::peer::{CryptoMethods, PeerConfig};
use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "bittorrent-peerwire")]
#[command(about = "Download torrent pieces straight from known peers", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download pieces of a torrent from the given peers
    Download {
        /// Path to the .torrent file
        #[arg(short, long)]
        torrent: PathBuf,

        /// Peer address (repeatable)
        #[arg(short, long = "peer", required = true)]
        peers: Vec<SocketAddr>,

        /// Download directory
        #[arg(short, long, default_value = "./downloads")]
        output: PathBuf,

        /// Only fetch these pieces (repeatable, default all)
        #[arg(long = "piece")]
        pieces: Vec<u32>,

        /// Stream encryption to offer during the handshake
        #[arg(long, value_enum, default_value_t = Crypto::Plaintext)]
        crypto: Crypto,

        /// Connections tried per piece before giving up
        #[arg(long, default_value = "3")]
        max_attempts: usize,

        /// Hash existing files first and skip intact pieces
        #[arg(long)]
        recheck: bool,
    },

    /// Show information about a torrent file
    Info {
        /// Path to the .torrent file
        #[arg(short, long)]
        torrent: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Crypto {
    Plaintext,
    Rc4,
    Any,
}

impl From<Crypto> for CryptoMethods {
    fn from(crypto: Crypto) -> Self {
        match crypto {
            Crypto::Plaintext => CryptoMethods::PLAINTEXT,
            Crypto::Rc4 => CryptoMethods::RC4,
            Crypto::Any => CryptoMethods::ANY,
        }
    }
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Download {
                torrent,
                peers,
                output,
                pieces,
                crypto,
                max_attempts,
                recheck,
            } => {
                let config = ClientConfig {
                    download_dir: output.clone(),
                    max_attempts: *max_attempts,
                    peer: PeerConfig {
                        crypto: (*crypto).into(),
                        ..PeerConfig::default()
                    },
                };
                self.download(torrent, peers, pieces, config, *recheck).await?;
            }

            Commands::Info { torrent } => {
                self.show_torrent_info(torrent).await?;
            }
        }

        Ok(())
    }

    async fn download(
        &self,
        torrent_path: &Path,
        peers: &[SocketAddr],
        pieces: &[u32],
        config: ClientConfig,
        recheck: bool,
    ) -> Result<()> {
        let metainfo = crate::torrent::load_torrent_file(torrent_path).await?;
        info!("Torrent: {}", metainfo.info.name);
        info!("Info hash: {}", metainfo.info_hash_hex());

        let client = TorrentClient::new(config);
        let torrent = client.open(&metainfo);
        if recheck {
            client.recheck(&torrent).await?;
        }

        let summary = client.download(torrent, peers, pieces).await?;
        info!("Fetched {} pieces", summary.completed.len());

        if !summary.failed.is_empty() {
            error!("Gave up on pieces {:?}", summary.failed);
            return Err(BittorrentError::Incomplete(summary.failed.len()));
        }
        Ok(())
    }

    async fn show_torrent_info(&self, torrent_path: &Path) -> Result<()> {
        let metainfo = crate::torrent::load_torrent_file(torrent_path).await?;

        println!("Torrent Information");
        println!("==================");
        println!("Name: {}", metainfo.info.name);
        if let Some(announce) = &metainfo.announce {
            println!("Tracker: {}", announce);
        }
        println!("Total Size: {} bytes", metainfo.info.total_length);
        println!("Piece Length: {} bytes", metainfo.info.piece_length);
        println!("Number of Pieces: {}", metainfo.info.pieces.len());
        println!("Info Hash: {}", metainfo.info_hash_hex());
        println!("\nFiles:");

        for (i, file) in metainfo.info.file_details().iter().enumerate() {
            println!(
                "  {}: {} ({} bytes)",
                i + 1,
                file.relative_path().display(),
                file.len()
            );
        }

        Ok(())
    }
}
