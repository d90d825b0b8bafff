use std::thread;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use fpga::devicecache::Cache;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::error;
use tracing::info;

use crate::config::DaemonArgs;
use crate::inventory::Inventory;

/// Runs the scan loop until it fails or Ctrl+C is received.
///
/// The scanner lives on its own OS thread since it blocks on both sleeping
/// and sending. It is not cancelled on shutdown; the process exit ends it.
pub async fn run(args: DaemonArgs) -> Result<()> {
    let (layout, class_dir) = args
        .scan
        .resolve()
        .map_err(|report| anyhow::anyhow!("{report:?}"))?;
    let capacity = usize::try_from(args.channel_capacity).context("channel capacity too large")?;

    let (tx, mut rx) = mpsc::channel(capacity);
    let mut cache = Cache::new(&class_dir, &args.scan.devfs_dir, &args.scan.mode, tx)
        .map_err(|report| anyhow::anyhow!("{report:?}"))?
        .with_layout(layout);

    info!(
        class_dir = %class_dir.display(),
        devfs = %args.scan.devfs_dir.display(),
        mode = %cache.mode(),
        %layout,
        "FPGA inventory daemon configured"
    );

    let interval = Duration::from_secs(args.scan_interval);
    let (done_tx, done_rx) = oneshot::channel();
    thread::Builder::new()
        .name("fpga-scan".to_string())
        .spawn(move || {
            let _ = done_tx.send(cache.run(interval));
        })
        .context("failed to spawn scanner thread")?;

    let consumer = tokio::spawn(async move {
        let mut inventory = Inventory::default();
        while let Some(update) = rx.recv().await {
            inventory.apply(update);
            info!(
                classes = inventory.classes().len(),
                devices = inventory.device_count(),
                "inventory updated"
            );
        }
        inventory
    });

    tokio::select! {
        result = done_rx => {
            // the sender is dropped with the cache, which ends the consumer
            if let Err(e) = consumer.await {
                error!("inventory consumer failed: {e}");
            }
            match result {
                Ok(Err(report)) => {
                    error!("scanner stopped");
                    Err(anyhow::anyhow!("{report:?}"))
                }
                Ok(Ok(())) => Ok(()),
                Err(_) => Err(anyhow::anyhow!("scanner thread exited without a result")),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
    }
}
