//! Block scheduler state machine
//!
//! Pure decision logic for one tick. The session owns the timer and calls
//! `tick` once per interval; this type never sleeps or performs I/O, which
//! keeps every transition testable without a runtime.
//!
//! ```text
//!   arm ──► Idle ──start──► Sending ◄──peers──► Waiting
//!                              │                   │
//!                              └─ payload done ────┴─(peers present)─► Complete
//!   stop: any state ──► Idle (payload discarded)
//! ```

use std::collections::HashSet;

use bytes::Bytes;
use serde::Serialize;

use super::payload::{NextBlock, PayloadStore};
use super::{RearmPolicy, TransferConfig, TransferError};
use crate::ble::transport::BleAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// No timer running. A payload may or may not be armed.
    Idle,
    /// Timer running, no peers connected; the cursor is parked.
    Waiting,
    /// Timer running, one block dispatched per tick.
    Sending,
    /// Every byte was sent; the timer has stopped.
    Complete,
}

impl SchedulerState {
    pub fn is_active(self) -> bool {
        matches!(self, SchedulerState::Sending | SchedulerState::Waiting)
    }
}

/// One payload slice, sized to fit a single notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub index: usize,
    pub offset: usize,
    pub data: Bytes,
    pub is_final: bool,
}

impl Block {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn offset_after(&self) -> usize {
        self.offset + self.data.len()
    }
}

/// What the session must do after a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickDecision {
    /// No peers. Nothing sent; tick again after the interval.
    /// `entered` is set on the tick that moved the scheduler into `Waiting`.
    Wait { entered: bool },
    /// Notify `peers` with `block`, then tick again after the interval.
    /// The cursor has already moved past this block.
    Dispatch { block: Block, peers: Vec<BleAddress> },
    /// The transfer just finished. Do not tick again.
    Complete { total_bytes: usize, blocks: usize },
    /// This tick belongs to a cancelled or finished run. Do not tick again.
    Halt,
}

pub struct BlockScheduler {
    state: SchedulerState,
    payload: PayloadStore,
    block_size: usize,
    rearm_policy: RearmPolicy,
    /// Bumped by `arm` and `stop` so ticks from an older run become no-ops.
    generation: u64,
    blocks_sent: usize,
    ticks: u64,
}

impl BlockScheduler {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            state: SchedulerState::Idle,
            payload: PayloadStore::new(),
            block_size: config.block_size(),
            rearm_policy: config.rearm_policy(),
            generation: 0,
            blocks_sent: 0,
            ticks: 0,
        }
    }

    /// Install a fresh payload and return to `Idle`.
    ///
    /// While `Sending` or `Waiting` this follows the re-arm policy. A rejected
    /// or invalid payload leaves the current transfer untouched.
    pub fn arm(&mut self, data: impl Into<Bytes>) -> Result<(), TransferError> {
        if self.state.is_active() && self.rearm_policy == RearmPolicy::Reject {
            return Err(TransferError::SchedulerAlreadyActive);
        }
        let mut fresh = PayloadStore::new();
        fresh.arm(data)?;

        self.payload = fresh;
        self.state = SchedulerState::Idle;
        self.generation += 1;
        self.blocks_sent = 0;
        Ok(())
    }

    /// Begin ticking. Only valid from `Idle` with a payload armed; returns
    /// the generation the timer must pass to `tick`.
    pub fn start(&mut self) -> Option<u64> {
        if self.state != SchedulerState::Idle || !self.payload.is_armed() {
            return None;
        }
        self.state = SchedulerState::Sending;
        Some(self.generation)
    }

    /// Run one tick against a point-in-time peer snapshot.
    pub fn tick(&mut self, generation: u64, peers: &HashSet<BleAddress>) -> TickDecision {
        if generation != self.generation || !self.state.is_active() {
            return TickDecision::Halt;
        }
        self.ticks += 1;

        if peers.is_empty() {
            let entered = self.state != SchedulerState::Waiting;
            self.state = SchedulerState::Waiting;
            return TickDecision::Wait { entered };
        }

        match self.payload.next_block(self.block_size) {
            NextBlock::Complete => {
                self.state = SchedulerState::Complete;
                TickDecision::Complete {
                    total_bytes: self.payload.len(),
                    blocks: self.blocks_sent,
                }
            }
            NextBlock::Block {
                data,
                offset,
                offset_after,
            } => {
                // next_block only hands out forward, in-bounds ranges.
                if self.payload.commit(offset_after).is_err() {
                    self.state = SchedulerState::Complete;
                    return TickDecision::Halt;
                }
                let block = Block {
                    index: self.blocks_sent,
                    offset,
                    data,
                    is_final: offset_after == self.payload.len(),
                };
                self.blocks_sent += 1;
                self.state = SchedulerState::Sending;

                let mut peers: Vec<BleAddress> = peers.iter().cloned().collect();
                peers.sort();
                TickDecision::Dispatch { block, peers }
            }
        }
    }

    /// Cancel the run and discard the payload. Returns `true` if a run was
    /// active or finished, `false` if already idle.
    pub fn stop(&mut self) -> bool {
        let was_running = self.state != SchedulerState::Idle;
        self.state = SchedulerState::Idle;
        self.payload.disarm();
        self.generation += 1;
        self.blocks_sent = 0;
        was_running
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    pub fn offset(&self) -> usize {
        self.payload.offset()
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_armed(&self) -> bool {
        self.payload.is_armed()
    }

    pub fn blocks_sent(&self) -> usize {
        self.blocks_sent
    }

    /// Ticks executed across all runs.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn peer() -> BleAddress {
        BleAddress::Simulated(Uuid::new_v4())
    }

    fn counter_payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    fn armed(len: usize, config: &TransferConfig) -> (BlockScheduler, u64) {
        let mut s = BlockScheduler::new(config);
        s.arm(counter_payload(len)).unwrap();
        let generation = s.start().unwrap();
        (s, generation)
    }

    #[test]
    fn test_start_requires_payload() {
        let mut s = BlockScheduler::new(&TransferConfig::default());
        assert_eq!(s.start(), None);
        assert_eq!(s.state(), SchedulerState::Idle);

        s.arm(counter_payload(10)).unwrap();
        assert!(s.start().is_some());
        assert_eq!(s.state(), SchedulerState::Sending);

        // A second start while running does not spawn another loop.
        assert_eq!(s.start(), None);
    }

    #[test]
    fn test_empty_registry_parks_cursor() {
        let (mut s, g) = armed(1000, &TransferConfig::default());
        let nobody = HashSet::new();

        assert_eq!(s.tick(g, &nobody), TickDecision::Wait { entered: true });
        assert_eq!(s.tick(g, &nobody), TickDecision::Wait { entered: false });
        assert_eq!(s.state(), SchedulerState::Waiting);
        assert_eq!(s.offset(), 0);
    }

    #[test]
    fn test_scenario_late_joiner_receives_all_blocks() {
        // 1000 bytes, 160-byte blocks, nobody connected for three ticks.
        let (mut s, g) = armed(1000, &TransferConfig::default());
        let nobody = HashSet::new();
        for _ in 0..3 {
            assert!(matches!(s.tick(g, &nobody), TickDecision::Wait { .. }));
        }
        assert_eq!(s.blocks_sent(), 0);

        let a = peer();
        let peers: HashSet<BleAddress> = [a.clone()].into_iter().collect();
        let mut lens = Vec::new();
        loop {
            match s.tick(g, &peers) {
                TickDecision::Dispatch { block, peers } => {
                    assert_eq!(peers, vec![a.clone()]);
                    lens.push(block.len());
                }
                TickDecision::Complete {
                    total_bytes,
                    blocks,
                } => {
                    assert_eq!(total_bytes, 1000);
                    assert_eq!(blocks, 7);
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(lens, vec![160, 160, 160, 160, 160, 160, 40]);
        assert_eq!(s.state(), SchedulerState::Complete);

        // No further ticks after completion.
        assert_eq!(s.tick(g, &peers), TickDecision::Halt);
    }

    #[test]
    fn test_scenario_reconnect_resumes_without_replay() {
        let (mut s, g) = armed(1000, &TransferConfig::default());
        let a = peer();
        let with_a: HashSet<BleAddress> = [a.clone()].into_iter().collect();

        let mut offsets = Vec::new();
        for _ in 0..3 {
            if let TickDecision::Dispatch { block, .. } = s.tick(g, &with_a) {
                offsets.push(block.offset);
            }
        }
        assert_eq!(offsets, vec![0, 160, 320]);

        // Peer drops; the cursor stays where it was.
        assert_eq!(
            s.tick(g, &HashSet::new()),
            TickDecision::Wait { entered: true }
        );
        assert_eq!(s.offset(), 480);

        // Peer back: block 4 (index 3) comes next.
        match s.tick(g, &with_a) {
            TickDecision::Dispatch { block, peers } => {
                assert_eq!(block.index, 3);
                assert_eq!(block.offset, 480);
                assert_eq!(peers, vec![a]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_offset_monotonic_and_bounded() {
        let config = TransferConfig::new(7, std::time::Duration::from_millis(1)).unwrap();
        let (mut s, g) = armed(100, &config);
        let peers: HashSet<BleAddress> = [peer()].into_iter().collect();
        let nobody = HashSet::new();

        let mut last = s.offset();
        for i in 0..40 {
            let who = if i % 3 == 0 { &nobody } else { &peers };
            let _ = s.tick(g, who);
            assert!(s.offset() >= last);
            assert!(s.offset() - last <= 7);
            assert!(s.offset() <= 100);
            last = s.offset();
        }
    }

    #[test]
    fn test_completion_signalled_once() {
        let (mut s, g) = armed(10, &TransferConfig::default());
        let peers: HashSet<BleAddress> = [peer()].into_iter().collect();

        let first = s.tick(g, &peers);
        assert!(matches!(first, TickDecision::Dispatch { ref block, .. } if block.is_final));

        let completions = (0..5)
            .map(|_| s.tick(g, &peers))
            .filter(|d| matches!(d, TickDecision::Complete { .. }))
            .count();
        assert_eq!(completions, 1);
        assert_eq!(s.ticks(), 2);
    }

    #[test]
    fn test_completion_waits_for_a_peer() {
        let (mut s, g) = armed(10, &TransferConfig::default());
        let peers: HashSet<BleAddress> = [peer()].into_iter().collect();
        assert!(matches!(s.tick(g, &peers), TickDecision::Dispatch { .. }));

        // Payload exhausted but nobody listening: keep polling.
        assert!(matches!(
            s.tick(g, &HashSet::new()),
            TickDecision::Wait { .. }
        ));
        assert!(matches!(s.tick(g, &peers), TickDecision::Complete { .. }));
    }

    #[test]
    fn test_arm_empty_fails() {
        let mut s = BlockScheduler::new(&TransferConfig::default());
        assert!(matches!(
            s.arm(Vec::new()),
            Err(TransferError::InvalidPayload(_))
        ));
        assert_eq!(s.state(), SchedulerState::Idle);
        assert!(!s.is_armed());
    }

    #[test]
    fn test_rearm_reject_policy() {
        let config = TransferConfig::default().with_rearm_policy(RearmPolicy::Reject);
        let (mut s, g) = armed(1000, &config);
        let peers: HashSet<BleAddress> = [peer()].into_iter().collect();
        s.tick(g, &peers);

        assert_eq!(
            s.arm(counter_payload(10)),
            Err(TransferError::SchedulerAlreadyActive)
        );
        assert_eq!(s.offset(), 160);
        assert_eq!(s.state(), SchedulerState::Sending);
        assert!(s.is_current(g));
    }

    #[test]
    fn test_rearm_reset_policy_invalidates_old_run() {
        let (mut s, g) = armed(1000, &TransferConfig::default());
        let peers: HashSet<BleAddress> = [peer()].into_iter().collect();
        s.tick(g, &peers);

        s.arm(counter_payload(50)).unwrap();
        assert_eq!(s.state(), SchedulerState::Idle);
        assert_eq!(s.offset(), 0);
        assert_eq!(s.payload_len(), 50);

        // The old timer's next tick is a no-op.
        assert_eq!(s.tick(g, &peers), TickDecision::Halt);
        assert_eq!(s.offset(), 0);

        let g2 = s.start().unwrap();
        assert_ne!(g, g2);
        match s.tick(g2, &peers) {
            TickDecision::Dispatch { block, .. } => {
                assert_eq!(block.index, 0);
                assert_eq!(block.len(), 50);
                assert!(block.is_final);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_invalid_rearm_keeps_current_transfer() {
        let (mut s, g) = armed(1000, &TransferConfig::default());
        assert!(s.arm(Vec::new()).is_err());
        assert!(s.is_current(g));
        assert_eq!(s.state(), SchedulerState::Sending);
        assert_eq!(s.payload_len(), 1000);
    }

    #[test]
    fn test_stop_discards_payload() {
        let (mut s, g) = armed(1000, &TransferConfig::default());
        let peers: HashSet<BleAddress> = [peer()].into_iter().collect();
        s.tick(g, &peers);

        assert!(s.stop());
        assert_eq!(s.state(), SchedulerState::Idle);
        assert_eq!(s.tick(g, &peers), TickDecision::Halt);

        // Nothing to resume: a peer connecting now cannot start a run.
        assert_eq!(s.start(), None);
        assert!(!s.stop());
    }

    #[test]
    fn test_dispatch_peers_sorted() {
        let (mut s, g) = armed(10, &TransferConfig::default());
        let a = BleAddress::Real([3, 0, 0, 0, 0, 0]);
        let b = BleAddress::Real([1, 0, 0, 0, 0, 0]);
        let peers: HashSet<BleAddress> = [a.clone(), b.clone()].into_iter().collect();
        match s.tick(g, &peers) {
            TickDecision::Dispatch { peers, .. } => assert_eq!(peers, vec![b, a]),
            other => panic!("unexpected {:?}", other),
        }
    }
}
