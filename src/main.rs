use anyhow::{bail, Result};
use modelstore::prelude::*;

fn mib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("modelstore=info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (url, name, version) = match (args.next(), args.next(), args.next()) {
        (Some(url), Some(name), Some(version)) => (url, name, version),
        _ => bail!("usage: modelstore <url> <name> <version> [sha256]"),
    };
    let sha256 = args.next();

    let root = std::env::var("MODELSTORE_ROOT").unwrap_or_else(|_| "modelstore-data".into());
    let manager = ModelManager::new(root, ManagerConfig::default()).await?;

    // Pick up anything a previous run left behind before starting new work.
    let resumed = manager.recover().await?;
    if !resumed.is_empty() {
        println!("resuming {} interrupted download(s)", resumed.len());
    }

    let config = ModelConfig {
        name: name.clone(),
        version: version.clone(),
        url,
        sha256,
        estimated_size: 0,
        min_memory_bytes: None,
    };

    let mut events = manager.ensure_installed(config).await?;
    while let Some(event) = events.next().await {
        match event {
            DownloadEvent::Started => println!("downloading {name}@{version}..."),
            DownloadEvent::Progress {
                fraction,
                bytes,
                total,
                speed_bps,
                eta,
            } => {
                let speed = speed_bps
                    .map(|s| format!("{:.1} MiB/s", s / (1024.0 * 1024.0)))
                    .unwrap_or_else(|| "-".into());
                let eta = eta
                    .map(|d| format!("{}s", d.as_secs()))
                    .unwrap_or_else(|| "?".into());
                println!(
                    "  {:>5.1}%  {:.1}/{:.1} MiB  {}  eta {}",
                    fraction * 100.0,
                    mib(bytes),
                    mib(total),
                    speed,
                    eta
                );
            }
            DownloadEvent::Installing => println!("verifying and installing..."),
            DownloadEvent::Paused { resumable } => {
                println!("paused (resumable: {resumable})");
            }
            DownloadEvent::Completed { path } => {
                println!("installed at {}", path.display());
                break;
            }
            DownloadEvent::Cancelled => bail!("download cancelled"),
            DownloadEvent::Failed { reason } => bail!("download failed: {reason}"),
        }
    }

    let info = manager.storage_info().await?;
    println!(
        "store: {:.1} MiB used, {:.1} MiB available",
        mib(info.used_bytes),
        mib(info.available_bytes)
    );
    for record in manager.list_installed().await? {
        println!(
            "  {}@{} ({:.1} MiB)",
            record.name,
            record.version,
            mib(record.size_bytes)
        );
    }

    // One cleanup pass so week-old partials do not accumulate. A long-lived
    // process would spawn run_maintenance instead.
    manager.maintain().await?;
    Ok(())
}
