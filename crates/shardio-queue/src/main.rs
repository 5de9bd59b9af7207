#![warn(missing_docs)]
//! Shardio simulation: drives one shard's admission queue against a scratch file

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use shardio_queue::{
    AdmitOptions, CapacityGroup, CapacityGroupConfig, FileBackend, Intent, IoBackend, IoQueue,
    IoQueueConfig, IoRequest, IoSink, IoVec,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const REQUEST_SIZE: usize = 8192;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let requests: usize = match args.get(1) {
        Some(s) => s.parse().context("requests must be a number")?,
        None => 64,
    };
    let cancel_every: usize = match args.get(2) {
        Some(s) => s.parse().context("cancel_every must be a number")?,
        None => 4,
    };

    let group = Arc::new(CapacityGroup::new(CapacityGroupConfig {
        initial_tokens: 16,
        ..Default::default()
    })?);
    let fg = group.register_priority_class("foreground", 300)?;
    let bg = group.register_priority_class("background", 100)?;

    let sink = Rc::new(IoSink::new());
    let config = IoQueueConfig {
        max_write_len: 4096,
        ..Default::default()
    };
    let mut queue = IoQueue::new(config, Arc::clone(&group), Rc::clone(&sink))?;

    let path = std::env::temp_dir().join(format!("shardio-sim-{}", std::process::id()));
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    let fd = file.as_raw_fd();
    let backend = FileBackend::new();
    info!("Simulating {} writes to {}", requests, path.display());

    let buffers: Vec<Vec<u8>> = (0..requests)
        .map(|i| vec![(i % 251) as u8 + 1; REQUEST_SIZE])
        .collect();
    let doomed = Intent::new();
    let mut handles = Vec::with_capacity(requests);
    for (i, buf) in buffers.iter().enumerate() {
        let class = if i % 2 == 0 { fg } else { bg };
        let pos = (i * REQUEST_SIZE) as u64;
        // SAFETY: `buffers` is neither mutated nor dropped until every handle has resolved
        let req = unsafe { IoRequest::make_write(fd, pos, IoVec::from_slice(buf), false) };
        let intent = (cancel_every > 0 && i % cancel_every == 0).then_some(&doomed);
        handles.push(queue.admit(class, req, intent, AdmitOptions::default())?);
    }
    doomed.cancel();

    let interval = group.config().replenish_interval();
    let mut now = Instant::now();
    let mut passes = 0u64;
    while !queue.is_empty() || !sink.is_empty() {
        now += interval;
        queue.tick(now);
        sink.drain_into(&backend);
        passes += 1;
    }

    let mut written = 0usize;
    let mut cancelled = 0usize;
    for handle in handles {
        match handle.await {
            Ok(len) => written += len,
            Err(e) if e.is_cancelled() => cancelled += 1,
            Err(e) => return Err(e).context("write failed"),
        }
    }
    drop(buffers);

    info!(written, cancelled, passes, "Simulation finished");
    for (name, class) in [("foreground", fg), ("background", bg)] {
        if let Some(stats) = queue.class_stats(class) {
            info!("{}: {}", name, serde_json::to_string(stats)?);
        }
    }
    info!("backend: {}", serde_json::to_string(&backend.stats())?);
    info!("group: {}", serde_json::to_string(&group.stats())?);

    drop(file);
    std::fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
    Ok(())
}
