use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[clap(name = "remora")]
#[command(version, about = "A leech-only BitTorrent client", long_about = None)]
pub struct Args {
    /// Path to the .torrent (metainfo) file to download.
    pub metainfo: PathBuf,

    /// Where to place the downloaded files, overriding the configuration.
    #[clap(short, long)]
    pub download_dir: Option<String>,
}
