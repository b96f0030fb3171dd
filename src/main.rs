use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use remora::{
    args::Args, config::CONFIG, error::Error, metainfo::Metainfo,
    torrent::Torrent,
};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .without_time()
        .with_target(false)
        .with_file(false)
        .with_max_level(Level::INFO)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    let buf = tokio::fs::read(&args.metainfo).await.map_err(|_| {
        Error::FileOpenError(args.metainfo.display().to_string())
    })?;
    let meta = Metainfo::parse(&buf)?;

    info!("loaded metainfo {}", args.metainfo.display());

    let download_dir = args
        .download_dir
        .unwrap_or_else(|| CONFIG.download_dir.clone());

    let torrent = Torrent::new(meta, download_dir);
    torrent.run().await
}
