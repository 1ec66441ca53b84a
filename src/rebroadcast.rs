//! # Rebroadcast Engine
//!
//! Re-announces not-yet-confirmed inventory (transactions) on a timer so
//! it propagates despite drops. One actor task owns the pending map; all
//! mutation arrives over a bounded command channel.
//!
//! The tick interval adapts to queue depth: with many pending entries
//! each item is re-announced less frequently, never faster than one
//! target block time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::chain::TxDesc;
use crate::message::Hash;
use crate::sync::SyncManager;

/// Items per interval-step of the adaptive timer.
const REBROADCAST_BATCH: usize = 50;

/// How many one-shot mempool-regain requests a process may issue.
pub const REGAIN_MP_LIMIT: u32 = 1;

/// Capacity of the actor's command channel.
const REBROADCAST_CHANNEL_SIZE: usize = 128;

/// Delay until the next rebroadcast tick: grows with queue depth so large
/// backlogs re-announce per item less often, clamped below by one block
/// time.
pub fn rebroadcast_interval(pending: usize, target_block_time: Duration) -> Duration {
    let scaled = target_block_time * (pending / REBROADCAST_BATCH) as u32;
    scaled.max(target_block_time)
}

enum Command {
    Add(Hash, TxDesc),
    Remove(Hash),
    RegainMempool,
    Quit,
}

/// Handle to the rebroadcast actor. Sends never block; a full channel
/// drops the command with a trace log.
#[derive(Clone)]
pub struct RebroadcastHandle {
    tx: mpsc::Sender<Command>,
}

impl RebroadcastHandle {
    fn send(&self, cmd: Command) {
        if let Err(e) = self.tx.try_send(cmd) {
            trace!("rebroadcast command dropped: {e}");
        }
    }

    pub fn add_inventory(&self, hash: Hash, desc: TxDesc) {
        self.send(Command::Add(hash, desc));
    }

    pub fn remove_inventory(&self, hash: Hash) {
        self.send(Command::Remove(hash));
    }

    /// Request a one-shot mempool refresh from all connected peers. Fires
    /// on the next tick if the regain budget is not exhausted and the
    /// chain is current.
    pub fn regain_mempool(&self) {
        self.send(Command::RegainMempool);
    }

    pub fn stop(&self) {
        self.send(Command::Quit);
    }
}

/// The rebroadcast actor.
pub struct Rebroadcast {
    sm: Arc<SyncManager>,
    rx: mpsc::Receiver<Command>,
    pending: HashMap<Hash, TxDesc>,
    regain_mp: bool,
    regain_mp_limit: u32,
}

impl Rebroadcast {
    /// Spawn the actor. Runs until `stop` or every handle drops.
    pub fn spawn(sm: Arc<SyncManager>) -> (RebroadcastHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(REBROADCAST_CHANNEL_SIZE);
        let actor = Rebroadcast {
            sm,
            rx,
            pending: HashMap::new(),
            regain_mp: false,
            regain_mp_limit: REGAIN_MP_LIMIT,
        };
        (RebroadcastHandle { tx }, tokio::spawn(actor.run()))
    }

    async fn run(mut self) {
        info!("rebroadcast engine started");
        let target = self.sm.config().target_block_time;
        let timer = tokio::time::sleep(target);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        None | Some(Command::Quit) => break,
                        Some(Command::Add(hash, desc)) => {
                            self.pending.insert(hash, desc);
                        }
                        Some(Command::Remove(hash)) => {
                            self.pending.remove(&hash);
                        }
                        Some(Command::RegainMempool) => {
                            if !self.regain_mp && self.regain_mp_limit > 0 {
                                self.regain_mp = true;
                            }
                        }
                    }
                }
                _ = &mut timer => {
                    self.on_tick();
                    timer.as_mut().reset(
                        Instant::now() + rebroadcast_interval(self.pending.len(), target),
                    );
                }
            }
        }
        info!("rebroadcast engine stopped");
    }

    fn on_tick(&mut self) {
        // Entries no longer in the mempool were confirmed or evicted;
        // drop them instead of re-announcing.
        let mempool = self.sm.mempool();
        self.pending
            .retain(|hash, _| mempool.have_transaction(hash));

        if !self.pending.is_empty() {
            let txs: Vec<TxDesc> = self.pending.values().cloned().collect();
            debug!(count = txs.len(), "rebroadcasting pending inventory");
            self.sm.peersync().relay_inventory(txs);
        }

        self.sm.peers().update_broadcasts();
        self.on_regain_mempool();
    }

    fn on_regain_mempool(&mut self) {
        if !self.regain_mp || self.regain_mp_limit == 0 {
            return;
        }
        if !self.sm.is_current() {
            return;
        }
        self.regain_mp = false;
        self.regain_mp_limit -= 1;
        info!("requesting mempool contents from connected peers");
        for pe in self.sm.peers().connected() {
            let sm = self.sm.clone();
            let id = pe.id();
            tokio::spawn(async move {
                if let Err(e) = sm.send_mempool_request(id).await {
                    trace!(peer = %id, "mempool request failed: {e}");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_clamps_to_block_time() {
        let target = Duration::from_secs(30);
        assert_eq!(rebroadcast_interval(0, target), target);
        assert_eq!(rebroadcast_interval(1, target), target);
        assert_eq!(rebroadcast_interval(49, target), target);
        assert_eq!(rebroadcast_interval(50, target), target);
    }

    #[test]
    fn interval_scales_with_queue_depth() {
        let target = Duration::from_secs(30);
        // 200 pending at a 30s block time re-announces every 120s.
        assert_eq!(rebroadcast_interval(200, target), Duration::from_secs(120));
        assert_eq!(rebroadcast_interval(100, target), Duration::from_secs(60));
        assert_eq!(rebroadcast_interval(150, target), Duration::from_secs(90));
    }
}
