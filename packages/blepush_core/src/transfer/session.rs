//! Transfer session: runs the scheduler on a timer and fans blocks out.
//!
//! Two background tasks per session:
//! - the timer task ticks the scheduler once per interval and queues the
//!   resulting block for dispatch;
//! - the dispatch worker drains that queue in order and notifies every peer
//!   in the block's snapshot.
//!
//! The offset is committed inside the tick, before the block is queued, so a
//! slow transport never holds up the cadence and never rewinds the cursor.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::dispatcher::{fan_out, NotificationDispatcher};
use super::peers::SharedPeerRegistry;
use super::scheduler::{Block, BlockScheduler, SchedulerState, TickDecision};
use super::{TransferConfig, TransferError, TransferEvent};
use crate::ble::transport::BleAddress;

const EVENT_CHANNEL_CAPACITY: usize = 256;

enum DispatchJob {
    Block {
        generation: u64,
        block: Block,
        peers: Vec<BleAddress>,
    },
    Complete {
        generation: u64,
        total_bytes: usize,
        blocks: usize,
    },
}

struct SessionCore {
    config: TransferConfig,
    scheduler: Mutex<BlockScheduler>,
    peers: SharedPeerRegistry,
    dispatcher: Arc<dyn NotificationDispatcher>,
    events: broadcast::Sender<TransferEvent>,
    jobs: mpsc::UnboundedSender<DispatchJob>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl SessionCore {
    fn scheduler(&self) -> MutexGuard<'_, BlockScheduler> {
        self.scheduler.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: TransferEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Emit only if `generation` is still the live run. Holding the scheduler
    /// lock orders this against `stop`, so nothing follows `Stopped`.
    fn emit_if_current(&self, generation: u64, event: TransferEvent) -> bool {
        let scheduler = self.scheduler();
        if !scheduler.is_current(generation) {
            return false;
        }
        self.emit(event);
        true
    }

    /// Callers other than `Drop` hold the scheduler lock, so a handle stored
    /// by a concurrent `start` is never aborted by a stale cancel.
    fn cancel_timer(&self) {
        if let Some(handle) = self.timer().take() {
            handle.abort();
        }
    }

    /// One tick. Returns `false` when the timer should stop.
    fn tick(&self, generation: u64, peers: &HashSet<BleAddress>) -> bool {
        let mut scheduler = self.scheduler();
        match scheduler.tick(generation, peers) {
            TickDecision::Wait { entered } => {
                if entered {
                    log::debug!("No peers connected, holding at offset {}", scheduler.offset());
                    self.emit(TransferEvent::Waiting);
                }
                true
            }
            TickDecision::Dispatch { block, peers } => {
                log::debug!(
                    "Block {} [{}..{}) -> {} peer(s)",
                    block.index,
                    block.offset,
                    block.offset_after(),
                    peers.len()
                );
                self.emit(TransferEvent::BlockSent {
                    index: block.index,
                    offset: block.offset,
                    len: block.len(),
                    peers: peers.len(),
                });
                let job = DispatchJob::Block {
                    generation,
                    block,
                    peers,
                };
                if self.jobs.send(job).is_err() {
                    log::warn!("Dispatch worker is gone, stopping timer");
                    return false;
                }
                true
            }
            TickDecision::Complete {
                total_bytes,
                blocks,
            } => {
                let _ = self.jobs.send(DispatchJob::Complete {
                    generation,
                    total_bytes,
                    blocks,
                });
                false
            }
            TickDecision::Halt => false,
        }
    }
}

async fn run_timer(core: Arc<SessionCore>, generation: u64) {
    loop {
        let peers = core.peers.snapshot().await;
        if !core.tick(generation, &peers) {
            break;
        }
        tokio::time::sleep(core.config.interval()).await;
    }
}

async fn run_dispatch_worker(
    core: Arc<SessionCore>,
    mut jobs: mpsc::UnboundedReceiver<DispatchJob>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            DispatchJob::Block {
                generation,
                block,
                peers,
            } => {
                if !core.scheduler().is_current(generation) {
                    continue;
                }
                let results = fan_out(core.dispatcher.as_ref(), &peers, &block.data).await;
                for (peer, result) in results {
                    let event = match result {
                        Ok(()) => TransferEvent::PeerNotified {
                            peer,
                            index: block.index,
                        },
                        Err(e) => {
                            let failure = TransferError::DispatchFailed {
                                peer: peer.clone(),
                                reason: e.to_string(),
                            };
                            log::warn!("Block {}: {}", block.index, failure);
                            TransferEvent::DispatchFailed {
                                peer,
                                index: block.index,
                                reason: e.to_string(),
                            }
                        }
                    };
                    core.emit_if_current(generation, event);
                }
            }
            DispatchJob::Complete {
                generation,
                total_bytes,
                blocks,
            } => {
                if core.emit_if_current(
                    generation,
                    TransferEvent::Completed {
                        total_bytes,
                        blocks,
                    },
                ) {
                    log::info!("All data sent ({} bytes in {} blocks)", total_bytes, blocks);
                }
            }
        }
    }
}

/// A payload, the connected peers, and the loop pushing one to the other.
pub struct TransferSession {
    core: Arc<SessionCore>,
    worker: JoinHandle<()>,
}

impl TransferSession {
    /// Must be called from within a tokio runtime.
    pub fn new(config: TransferConfig, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (jobs, jobs_rx) = mpsc::unbounded_channel();
        let core = Arc::new(SessionCore {
            scheduler: Mutex::new(BlockScheduler::new(&config)),
            config,
            peers: SharedPeerRegistry::new(),
            dispatcher,
            events,
            jobs,
            timer: Mutex::new(None),
        });
        let worker = tokio::spawn(run_dispatch_worker(core.clone(), jobs_rx));
        Self { core, worker }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.core.events.subscribe()
    }

    pub fn config(&self) -> &TransferConfig {
        &self.core.config
    }

    /// Install a payload at offset 0, cancelling any run under the reset
    /// policy. Starts immediately if peers are already connected.
    pub async fn arm(&self, data: impl Into<Bytes>) -> Result<(), TransferError> {
        {
            let mut scheduler = self.core.scheduler();
            let was_active = scheduler.state().is_active();
            scheduler.arm(data)?;
            if was_active {
                log::info!("Re-armed while running, previous transfer cancelled");
            }
            log::info!("Armed {} byte payload", scheduler.payload_len());
            self.core.emit(TransferEvent::Armed {
                len: scheduler.payload_len(),
            });
            self.core.cancel_timer();
        }

        if !self.core.peers.is_empty().await {
            self.start();
        }
        Ok(())
    }

    /// Start the timer loop. Returns `false` if nothing is armed or a loop
    /// is already running (or finished).
    pub fn start(&self) -> bool {
        {
            let mut scheduler = self.core.scheduler();
            let Some(generation) = scheduler.start() else {
                return false;
            };
            self.core.emit(TransferEvent::Started);

            // The timer slot only changes under the scheduler lock.
            let handle = tokio::spawn(run_timer(self.core.clone(), generation));
            if let Some(previous) = self.core.timer().replace(handle) {
                previous.abort();
            }
        }
        log::info!(
            "Transfer started: block size {}, interval {:?}",
            self.core.config.block_size(),
            self.core.config.interval()
        );
        true
    }

    /// Cancel the loop and drop the payload. Returns `false` if already idle.
    pub fn stop(&self) -> bool {
        let stopped = {
            let mut scheduler = self.core.scheduler();
            let stopped = scheduler.stop();
            if stopped {
                self.core.emit(TransferEvent::Stopped);
            }
            self.core.cancel_timer();
            stopped
        };
        if stopped {
            log::info!("Transfer stopped");
        }
        stopped
    }

    pub async fn on_peer_connected(&self, peer: BleAddress) {
        if !self.core.peers.add(peer.clone()).await {
            return;
        }
        log::info!("Device connected: {}", peer);
        self.core.emit(TransferEvent::PeerConnected { peer });
        self.start();
    }

    pub async fn on_peer_disconnected(&self, peer: &BleAddress) {
        if !self.core.peers.remove(peer).await {
            return;
        }
        log::info!("Device disconnected: {}", peer);
        self.core.emit(TransferEvent::PeerDisconnected { peer: peer.clone() });
    }

    pub async fn peers(&self) -> HashSet<BleAddress> {
        self.core.peers.snapshot().await
    }

    pub fn state(&self) -> SchedulerState {
        self.core.scheduler().state()
    }

    pub fn offset(&self) -> usize {
        self.core.scheduler().offset()
    }

    pub fn payload_len(&self) -> usize {
        self.core.scheduler().payload_len()
    }

    pub fn tick_count(&self) -> u64 {
        self.core.scheduler().ticks()
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        self.core.cancel_timer();
        self.worker.abort();
    }
}
