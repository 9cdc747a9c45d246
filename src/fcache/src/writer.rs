use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use tracing::{debug, error, trace};

use crate::cache::{flush_chunks, CachePolicy, Tables};
use crate::FileServer;

pub(crate) struct WriterHandle {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

impl WriterHandle {
    pub fn stop(self) {
        // a send failure means the thread already exited
        let _ = self.stop_tx.send(());
        let _ = self.thread.join();
    }
}

/// Start the congestion-driven background writer.
///
/// The thread wakes on the configured interval (the stop channel doubles as
/// the shutdown signal). When the process-wide dirty count has reached the
/// threshold it flushes chunks, one at a time from any handle that has some,
/// until the count drops under the low-water mark; at least one chunk goes
/// out per firing wake. A flush failure poisons the cache and stops the
/// thread: foreground operations surface the failure on their next call.
pub(crate) fn spawn_writer(
    tables: Arc<RwLock<Tables>>,
    server: Arc<dyn FileServer>,
    policy: CachePolicy,
    poisoned: Arc<AtomicBool>,
) -> Result<WriterHandle, std::io::Error> {
    let (stop_tx, stop_rx) = bounded::<()>(1);

    let thread = std::thread::Builder::new()
        .name("bfs-writeback".into())
        .spawn(move || loop {
            match stop_rx.recv_timeout(policy.interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    trace!("background writer stopping");
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {}
            }

            if tables.read().total_dirty < policy.threshold {
                continue;
            }

            let mut tables = tables.write();
            debug!(
                total_dirty = tables.total_dirty,
                threshold = policy.threshold,
                "congestion threshold reached"
            );
            while tables.total_dirty >= policy.low_water {
                let Some(handle) = tables
                    .files
                    .iter()
                    .find(|(_, e)| !e.dirty.is_empty())
                    .map(|(h, _)| *h)
                else {
                    break;
                };
                match flush_chunks(&mut tables, server.as_ref(), handle, Some(1)) {
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "background write-back failed");
                        poisoned.store(true, Ordering::Relaxed);
                        return;
                    }
                }
            }
            debug!(total_dirty = tables.total_dirty, "congestion drained");
        })?;

    Ok(WriterHandle { stop_tx, thread })
}
