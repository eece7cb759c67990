mod cli;

use anyhow::{Context, Result};
use cli::{Cli, Commands};
use indicatif::{ProgressBar, ProgressStyle};
use p2pshare::share::{self, FileDigest};
use p2pshare::{Config, ListedFile, PeerFetch, PeerServer, SharedFile, TrackerSession};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);

    let mut config = Config::load(cli.config.as_deref()).context("failed to load config")?;
    if let Some(tracker) = cli.tracker {
        config.tracker = tracker;
    }
    if let Some(share) = cli.share {
        config.share_dir = share;
    }
    let progress = !cli.no_progress;

    match cli.command {
        Commands::Serve => serve(&config).await?,
        Commands::List => list(&config).await?,
        Commands::Fetch { filename } => fetch(&config, &filename, progress).await?,
        Commands::Shell => shell(&config, progress).await?,
        Commands::Hash { path } => hash(&config, &path)?,
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn connect_tracker(config: &Config) -> Result<TrackerSession> {
    let (host, port) = config.tracker_addr()?;
    let session = TrackerSession::connect(&host, port, config.io_timeout)
        .await
        .with_context(|| format!("failed to connect to tracker at {}:{}", host, port))?
        .with_peer_ports(config.control_port, config.data_port);

    println!("{}", session.greeting());
    println!("✓ Connected to tracker at {}:{}", host, port);
    Ok(session)
}

async fn index_share(config: &Config, session: &mut TrackerSession) -> Result<Vec<SharedFile>> {
    let dir = config.share_dir.clone();
    let digest = config.digest;
    println!("Indexing files from {} with tracker...", dir.display());

    let files = tokio::task::spawn_blocking(move || share::scan(&dir, &*digest.digest()))
        .await??;
    let count = session
        .index(&files)
        .await
        .context("tracker rejected the share directory")?;

    println!("✓ Indexed {} files with tracker", count);
    Ok(files)
}

async fn bind_server(config: &Config) -> Result<PeerServer> {
    let server = PeerServer::bind(config.server_config())
        .await
        .context("failed to bind peer server ports")?;
    println!("✓ Serving {} on port {}", config.share_dir.display(), config.control_port);
    Ok(server)
}

fn fetcher(config: &Config, progress: bool) -> PeerFetch {
    let fetch = PeerFetch::new(config.fetch_config());
    if !progress {
        return fetch;
    }
    let style = ProgressStyle::with_template(
        "{spinner} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec})",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=> ");
    fetch.with_progress(ProgressBar::new(0).with_style(style))
}

async fn withdraw(session: &mut TrackerSession, files: &[SharedFile]) {
    for file in files {
        if let Err(e) = session.remove(&file.name, &file.hash).await {
            warn!(file = file.name.as_str(), error = %e, "could not withdraw file from tracker");
        }
    }
}

async fn serve(config: &Config) -> Result<()> {
    println!("p2pshare - Serve");
    println!("═══════════════════════════════════════");

    let mut session = connect_tracker(config).await?;
    let files = index_share(config, &mut session).await?;

    let server = bind_server(config).await?;
    println!("Press Ctrl-C to stop");

    let outcome = tokio::select! {
        result = server.run() => result.context("peer server stopped"),
        _ = tokio::signal::ctrl_c() => Ok(()),
    };

    println!();
    println!("Shutting down...");
    withdraw(&mut session, &files).await;
    session.quit().await.context("tracker did not properly reply to exit handshake")?;
    println!("✓ Closed connection to tracker");
    outcome
}

async fn list(config: &Config) -> Result<()> {
    let mut session = connect_tracker(config).await?;
    println!("Requesting list of files from tracker...");

    print_listing(&session.list().await?);

    session.quit().await?;
    Ok(())
}

fn print_listing(files: &[ListedFile]) {
    for (i, file) in files.iter().enumerate() {
        println!("file [{:2}]: {:>20} [size: {:>10}]", i + 1, file.name, file.size);
    }
    println!("✓ Received list of {} files from tracker", files.len());
}

async fn request_file(
    session: &mut TrackerSession,
    fetch: &PeerFetch,
    filename: &str,
) -> Result<()> {
    let offers = session.request(filename).await?;
    if offers.is_empty() {
        println!("File '{}' was not found on the tracker", filename);
        return Ok(());
    }

    println!("Fetching {} ({} peers)...", filename, offers.len());
    match fetch.fetch_first(filename, &offers).await {
        Ok(outcome) if outcome.is_complete() => {
            println!("✓ Transfer complete!");
            println!("File saved to: {}", outcome.path.display());
        }
        Ok(outcome) => {
            println!(
                "⚠ Peer {} sent {} of {} bytes, saved short file to {}",
                outcome.peer,
                outcome.received,
                outcome.declared_size,
                outcome.path.display()
            );
        }
        Err(e) => println!("✗ Could not fetch '{}': {}", filename, e),
    }
    Ok(())
}

async fn fetch(config: &Config, filename: &str, progress: bool) -> Result<()> {
    let mut session = connect_tracker(config).await?;
    let fetch = fetcher(config, progress);
    request_file(&mut session, &fetch, filename).await?;
    session.quit().await?;
    Ok(())
}

async fn shell(config: &Config, progress: bool) -> Result<()> {
    let mut session = connect_tracker(config).await?;
    let files = index_share(config, &mut session).await?;
    bind_server(config).await?.spawn();
    let fetch = fetcher(config, progress);

    println!("Ready for input: list, request <file>, quit");
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let Some(line) = stdin.next_line().await? else {
            break;
        };
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["list"] => {
                print_listing(&session.list().await?);
            }
            ["request", filename] => request_file(&mut session, &fetch, filename).await?,
            ["request"] => println!("Please specify a file after the request command"),
            ["quit"] => break,
            [] => {}
            _ => println!("Unknown command: {}", line.trim()),
        }
    }

    withdraw(&mut session, &files).await;
    session.quit().await.context("tracker did not properly reply to exit handshake")?;
    println!("✓ Closed connection to tracker");
    Ok(())
}

fn hash(config: &Config, path: &Path) -> Result<()> {
    let digest = config.digest.digest();
    let hash = digest.hash_file(path)?;
    println!("{} {}  {}", digest.name(), hash, path.display());
    Ok(())
}
