/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The outer process loop and the periodic holding review.
//!
//! One call to [`process`](ConsensusCore::process) is one cooperative scheduling step: drain
//! buffered block snapshots, review holding, drain the ack and message queues, re-execute the
//! review queue, and pump the per-invocation process channel, calling
//! [`update_state`](ConsensusCore::update_state) between messages so process lists advance as
//! soon as their prerequisites land. Every phase yields by exhausting its room; there is no
//! preemption. The caller loops on the returned progress flag and sleeps when it goes false.

use std::collections::VecDeque;
use std::time::SystemTime;

use crate::{
    consensus::executor::Validity,
    consensus::state::{ConsensusCore, IGNORE_MISSING_SECS},
    events::{Event, ReviewHoldingEvent},
    messages::{Message, Payload},
    networking::network::Network,
    networking::queues::INMSGQUEUE_LOW,
    storage::pluggables::BlockStore,
    types::data_types::{DbHeight, Minute},
};

/// Capacity of the per-invocation process channel.
const PROCESS_CHANNEL_CAPACITY: usize = 10_000;
/// Producers stop feeding the process channel a little before capacity.
const PROCESS_CHANNEL_ROOM: usize = PROCESS_CHANNEL_CAPACITY - 5;

/// Minimum period between two holding reviews, in milliseconds.
const REVIEW_PERIOD_MILLIS: i64 = 300;

impl<S: BlockStore, N: Network> ConsensusCore<S, N> {
    /// One step of the process loop. Returns whether any message was processed.
    pub fn process(&mut self) -> bool {
        let mut progress = false;

        if self.reset_request {
            self.reset_request = false;
            self.do_reset();
            return false;
        }

        // If we are not running the leader, look to see whether we have waited long enough to
        // start. Once we start, the clock begins on ignoring missing messages, so we don't
        // conflict with the network's recent past after a reboot.
        let now = self.get_timestamp();
        let now_millis = now.millis() as i64;
        if !self.run_leader {
            if now_millis - self.start_delay > self.config.start_delay_limit_millis
                && self.db_finished
            {
                self.run_leader = true;
                if !self.ignore_done {
                    self.start_delay = now_millis;
                    self.ignore_done = true;
                }
            }
        } else if self.ignore_missing
            && now_millis - self.start_delay > self.config.start_delay_limit_millis
        {
            self.ignore_missing = false;
        }
        self.recompute_leadership();

        if self.leader {
            let vm_unstarted = self
                .process_lists
                .get(self.lleader_height)
                .and_then(|pl| pl.vms.get(self.leader_vm_index.index()))
                .map(|vm| vm.height == 0)
                .unwrap_or(false);
            if vm_unstarted {
                self.send_dbsig(self.lleader_height, self.leader_vm_index);
            }
        }

        let mut process: VecDeque<Message> = VecDeque::with_capacity(PROCESS_CHANNEL_CAPACITY);
        let room = |process: &VecDeque<Message>| process.len() < PROCESS_CHANNEL_ROOM;

        // Move buffered snapshots that became applicable into the process channel.
        while room(&process) {
            let ix = self.highest_saved_blk().int() as i64 - self.snapshots_received_base + 1;
            if ix < 0 || ix >= self.snapshots_received.len() as i64 {
                break;
            }
            match self.snapshots_received[ix as usize].take() {
                Some(msg) => process.push_back(msg),
                None => break,
            }
        }

        self.review_holding();

        // Process acknowledgements if we have some.
        while room(&process) {
            let mut ack_msg = match self.ack_queue.try_recv() {
                Some(msg) => msg,
                None => break,
            };
            if let Payload::Ack(ack) = &ack_msg.payload {
                if ack.db_height >= self.lleader_height
                    && self.validate(&ack_msg) == Validity::Valid
                {
                    let recent = ack_msg.timestamp().secs_until(now) < IGNORE_MISSING_SECS;
                    if !self.ignore_missing || recent {
                        self.execute_msg(&mut ack_msg);
                    }
                }
            }
            progress = true;
        }

        // Process inbound messages.
        while room(&process) {
            let mut msg = match self.msg_queue.try_recv() {
                Some(msg) => msg,
                None => break,
            };
            if self.execute_msg(&mut msg) && !msg.is_peer_to_peer() {
                self.sender.send_out(&msg);
            }
        }

        // Reprocess stalled messages, but not so much compared to inbound messages. Whatever
        // does not fit stays queued for the next invocation.
        let review = std::mem::take(&mut self.x_review);
        for (index, msg) in review.iter().enumerate() {
            if !room(&process) {
                let mut leftover = review[index..].to_vec();
                leftover.extend(std::mem::take(&mut self.x_review));
                self.x_review = leftover;
                break;
            }
            let mut msg = msg.clone();
            process.push_back(msg.clone());
            progress = self.execute_msg(&mut msg) || progress;
        }

        // Pump the process channel, advancing process lists between messages.
        while let Some(mut msg) = process.pop_front() {
            self.execute_msg(&mut msg);
            if !msg.is_peer_to_peer() {
                self.sender.send_out(&msg);
            }
            self.update_state();
        }

        progress
    }

    /// Recompute whether this node leads, and which VM it leads, for the current minute.
    pub(crate) fn recompute_leadership(&mut self) {
        let minute = Minute::new(self.current_minute.min(9));
        let identity = self.config.identity_chain_id;
        let now = self.get_timestamp();
        let seed = self.pl_seed();
        if let Some(pl) = self
            .process_lists
            .get_or_create(self.lleader_height, &seed, now)
        {
            let (leader, vm_index) = pl.get_virtual_servers(minute, &identity);
            self.leader = leader;
            self.leader_vm_index = vm_index;
        }
    }

    /// Place the messages in the holding map back into the review queue, pruning everything that
    /// can no longer matter.
    pub fn review_holding(&mut self) {
        if !self.x_review.is_empty() {
            return;
        }
        if self.in_msg_depth() > INMSGQUEUE_LOW {
            return;
        }

        let now = self.get_timestamp();
        if self.resend_holding.is_none() {
            self.resend_holding = Some(now);
        }
        if let Some(last) = self.resend_holding {
            if last.millis_until(now) < REVIEW_PERIOD_MILLIS {
                return;
            }
        }

        self.store.trim();
        self.resend_holding = Some(now);

        let highest = self.highest_known_block();
        let saved = self.highest_saved_blk();
        let mut promoted = 0usize;
        let mut expired = 0usize;

        // Anything we are holding, we need to reprocess.
        for hash in self.holding.hashes() {
            let msg = match self.holding.get(&hash) {
                Some(msg) => msg.clone(),
                None => continue,
            };

            // A backlog this deep means we catch up through snapshots, not messages.
            if highest - saved > 1000 {
                self.counters.holding_outputs += 1;
                self.holding.remove(&hash);
                continue;
            }

            match &msg.payload {
                Payload::MissingMsgResponse(mmr) => {
                    if let Some(inner) = &mmr.msg_response {
                        if let Payload::FullServerFault(ff) = &inner.payload {
                            if ff.db_height() < saved {
                                self.counters.holding_outputs += 1;
                                self.holding.remove(&hash);
                            }
                        }
                    }
                    continue;
                }
                Payload::ServerFault(sf) => {
                    if sf.db_height < saved {
                        self.counters.holding_outputs += 1;
                        self.holding.remove(&hash);
                        continue;
                    }
                }
                Payload::FullServerFault(ff) => {
                    if ff.db_height() < saved {
                        self.counters.holding_outputs += 1;
                        self.holding.remove(&hash);
                        continue;
                    }
                }
                Payload::EndOfMinute(eom) => {
                    let stale = (eom.db_height <= saved && saved.int() > 0)
                        || (highest.int() > 2
                            && (eom.db_height.int() as i64) < highest.int() as i64 - 3);
                    if stale {
                        self.counters.holding_outputs += 1;
                        self.holding.remove(&hash);
                        continue;
                    }
                }
                Payload::BlockSnapshot(snapshot) => {
                    if saved.int() > 0
                        && (snapshot.db_height().int() as i64) < saved.int() as i64 - 1
                    {
                        self.counters.holding_outputs += 1;
                        self.holding.remove(&hash);
                        continue;
                    }
                }
                Payload::DirectoryBlockSignature(dbs) => {
                    let stale = (dbs.db_height <= saved && saved.int() > 0)
                        || (highest.int() > 2
                            && (dbs.db_height.int() as i64) < highest.int() as i64 - 3);
                    if stale {
                        self.counters.holding_outputs += 1;
                        self.holding.remove(&hash);
                        continue;
                    }
                }
                _ => {}
            }

            if !self
                .replay
                .valid(crate::replay::ReplayKind::Internal, &msg.repeat_hash(), msg.timestamp(), now)
            {
                self.counters.holding_outputs += 1;
                self.holding.remove(&hash);
                continue;
            }

            if self.holding.expired(&hash, now) {
                self.counters.expire_cnt += 1;
                self.counters.holding_outputs += 1;
                expired += 1;
                self.holding.remove(&hash);
                continue;
            }

            if self.holding.should_resend(&hash, now) && self.validate(&msg) == Validity::Valid {
                self.counters.resend_cnt += 1;
                self.sender.send_out(&msg);
                self.holding.mark_resent(&hash, now);
                continue;
            }

            if self.validate(&msg) == Validity::Invalid {
                self.counters.holding_outputs += 1;
                self.holding.remove(&hash);
                continue;
            }

            self.counters.x_review_inputs += 1;
            self.counters.holding_outputs += 1;
            promoted += 1;
            self.x_review.push(msg);
            self.holding.remove(&hash);
        }

        Event::ReviewHolding(ReviewHoldingEvent {
            timestamp: SystemTime::now(),
            promoted,
            expired,
        })
        .publish(&self.event_publisher);
    }

    /// Advance every live process list as far as its prerequisites allow, and persist snapshots
    /// that became ready. Returns whether anything moved.
    pub fn update_state(&mut self) -> bool {
        self.db_states_update_state();
        let mut progress = false;
        for db_height in self.process_lists.heights() {
            progress |= self.process_list_once(db_height);
        }
        progress
    }

    /// Consume as many slots as currently possible from the process list at `db_height`.
    fn process_list_once(&mut self, db_height: DbHeight) -> bool {
        let mut progress = false;

        // The system list first: faults gate minute closure.
        loop {
            let (position, slot) = match self.process_lists.get(db_height) {
                Some(pl) => (
                    pl.system.height,
                    pl.system.list.get(pl.system.height).cloned().flatten(),
                ),
                None => return progress,
            };
            let mut fault_msg = match slot {
                Some(fault_msg) => fault_msg,
                None => break,
            };
            let consumed = self.process_full_server_fault(&mut fault_msg);
            match self.process_lists.get_mut(db_height) {
                Some(pl) => {
                    // Keep the accumulated tally state in the slot.
                    if position < pl.system.list.len() {
                        pl.system.list[position] = Some(fault_msg);
                    }
                    if consumed {
                        pl.system.height += 1;
                        progress = true;
                    } else {
                        break;
                    }
                }
                None => break,
            }
        }

        let vm_count = match self.process_lists.get(db_height) {
            Some(pl) => pl.vms.len(),
            None => return progress,
        };
        for vm_index in 0..vm_count {
            loop {
                let slot = self.process_lists.get(db_height).and_then(|pl| {
                    let vm = pl.vms.get(vm_index)?;
                    vm.list.get(vm.height).cloned().flatten()
                });
                let (_, msg) = match slot {
                    Some(slot) => slot,
                    None => break,
                };
                let mut msg = msg;
                if self.dispatch_process(db_height, &mut msg) {
                    if let Some(pl) = self.process_lists.get_mut(db_height) {
                        if let Some(vm) = pl.vms.get_mut(vm_index) {
                            vm.height += 1;
                        }
                    }
                    progress = true;
                } else {
                    break;
                }
            }
        }

        progress
    }

    fn dispatch_process(&mut self, db_height: DbHeight, msg: &mut Message) -> bool {
        match &msg.payload {
            Payload::EndOfMinute(_) => self.process_eom(db_height, msg),
            Payload::DirectoryBlockSignature(_) => self.process_dbsig(db_height, msg),
            Payload::CommitChain(_) => self.process_commit_chain(db_height, msg),
            Payload::CommitEntry(_) => self.process_commit_entry(db_height, msg),
            Payload::RevealEntry(_) => self.process_reveal_entry(db_height, msg),
            Payload::AddServer(_) => self.process_add_server(db_height, msg),
            Payload::RemoveServer(_) => self.process_remove_server(db_height, msg),
            Payload::ChangeServerKey(_) => self.process_change_server_key(db_height, msg),
            Payload::FullServerFault(_) => self.process_full_server_fault(msg),
            // Anything else acknowledged into a list consumes its slot without further effect.
            _ => true,
        }
    }
}
