/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The consensus core's state: one struct owning every map, flag and queue the protocol mutates,
//! plus its configuration, counters, and small accessors.

use std::collections::HashMap;
use std::sync::mpsc::Sender;

use crate::{
    commits::Commits,
    consensus::ledger::LedgerState,
    dbstate::DBStateLedger,
    events::Event,
    holding::Holding,
    messages::{Ack, Message},
    networking::{
        network::{Network, SenderHandle},
        queues::{QueueReceiver, QueueSender},
    },
    process_list::window::ProcessLists,
    replay::ReplayFilter,
    storage::pluggables::BlockStore,
    types::{
        authority::{AuthoritySet, Server},
        blocks::Entry,
        crypto_primitives::Keypair,
        data_types::{Address, CryptoHash, DbHeight, SaltNumber, ServerId, Timestamp, VmIndex},
    },
};

/// How long a booting node ignores old messages, in seconds.
pub const IGNORE_MISSING_SECS: i64 = 60 * 15;

/// Identity material re-read from configuration when the ack-change height is reached.
pub struct IdentityConfig {
    pub identity_chain_id: ServerId,
    pub keypair: Keypair,
}

/// Hot-reloadable configuration. The embedder decides where it comes from (a file, an
/// environment, a test fixture); the core only asks for the current values.
pub trait ConfigSource: Send + 'static {
    /// The height at which the node should re-read its identity. Zero disables the re-read.
    fn ack_change(&self) -> u32;

    /// The identity to switch to when the ack-change height is reached.
    fn identity(&self) -> Option<IdentityConfig>;
}

/// Static configuration of the consensus core.
pub struct CoreConfig {
    pub identity_chain_id: ServerId,
    pub keypair: Keypair,
    /// Node-local salt. Its leading bytes are stamped into every ack this node signs.
    pub salt: CryptoHash,
    /// Network name. Checkpoints are only enforced on the main network.
    pub network_name: String,
    /// Checkpointed key Merkle roots by height, in full hex.
    pub checkpoints: HashMap<u32, String>,
    /// How long after boot the node waits before acting as a leader, in milliseconds.
    pub start_delay_limit_millis: i64,
    /// Base fault timeout, in seconds. The fault tiebreak cooldown is half of it.
    pub fault_timeout_secs: i64,
    /// Keep our own directory block signature even when a majority disagrees with it.
    pub keep_mismatch: bool,
    /// Initial ack-change height; kept current through the [`ConfigSource`].
    pub ack_change: u32,
    pub initial_fed_servers: Vec<Server>,
    pub initial_audit_servers: Vec<Server>,
}

/// An entry block this node knows it is missing, waiting for a matching data response.
pub struct MissingEntryBlock {
    pub eb_key_mr: CryptoHash,
    pub db_height: DbHeight,
}

/// Drop counters. Protocol noise is dropped silently; these are the observability trail it
/// leaves.
#[derive(Default)]
pub struct Counters {
    pub expire_cnt: u64,
    pub resend_cnt: u64,
    pub dbstate_ignore_cnt: u64,
    pub dbstate_applied_cnt: u64,
    pub missing_request_ignore_cnt: u64,
    pub missing_request_reply_cnt: u64,
    pub missing_response_applied_cnt: u64,
    pub holding_inputs: u64,
    pub holding_outputs: u64,
    pub acks_inputs: u64,
    pub commits_outputs: u64,
    pub x_review_inputs: u64,
}

/// The inbound and outbound queue ends owned by the core.
pub struct CoreChannels {
    pub ack_queue: QueueReceiver<Message>,
    pub msg_queue: QueueReceiver<Message>,
    pub network_invalid: QueueSender<Message>,
    pub write_entry: QueueSender<Entry>,
}

/// The consensus core. See the [module documentation](crate::consensus).
pub struct ConsensusCore<S: BlockStore, N: Network> {
    pub(crate) config: CoreConfig,
    pub(crate) config_source: Option<Box<dyn ConfigSource>>,
    pub(crate) store: S,
    pub(crate) sender: SenderHandle<N>,
    pub(crate) event_publisher: Option<Sender<Event>>,

    pub(crate) ack_queue: QueueReceiver<Message>,
    pub(crate) msg_queue: QueueReceiver<Message>,
    pub(crate) network_invalid: QueueSender<Message>,
    pub(crate) write_entry: QueueSender<Entry>,

    pub(crate) replay: ReplayFilter,
    pub(crate) holding: Holding,
    pub(crate) acks: HashMap<CryptoHash, Ack>,
    pub(crate) commits: Commits,
    pub(crate) process_lists: ProcessLists,
    pub(crate) db_states: DBStateLedger,
    pub(crate) ledger: LedgerState,
    pub(crate) authorities: AuthoritySet,

    pub(crate) x_review: Vec<Message>,
    pub(crate) snapshots_received: Vec<Option<Message>>,
    pub(crate) snapshots_received_base: i64,
    pub(crate) missing_entry_blocks: Vec<MissingEntryBlock>,

    // Leadership and minute machine state.
    pub(crate) lleader_height: DbHeight,
    pub(crate) current_minute: u8,
    pub(crate) current_minute_start: Timestamp,
    pub(crate) leader: bool,
    pub(crate) leader_vm_index: VmIndex,
    pub(crate) syncing: bool,
    pub(crate) eom: bool,
    pub(crate) eom_done: bool,
    pub(crate) eom_sys: bool,
    pub(crate) eom_syncing: bool,
    pub(crate) eom_limit: usize,
    pub(crate) eom_processed: i32,
    pub(crate) eom_minute: u8,
    pub(crate) dbsig: bool,
    pub(crate) dbsig_done: bool,
    pub(crate) dbsig_sys: bool,
    pub(crate) dbsig_limit: usize,
    pub(crate) dbsig_processed: i32,
    pub(crate) saving: bool,

    // Boot window state.
    pub(crate) run_leader: bool,
    pub(crate) ignore_missing: bool,
    pub(crate) ignore_done: bool,
    pub(crate) db_finished: bool,
    pub(crate) start_delay: i64,

    pub(crate) highest_known: DbHeight,
    pub(crate) highest_ack: DbHeight,
    pub(crate) entry_db_height_complete: DbHeight,
    pub(crate) reset_request: bool,
    pub(crate) leader_timestamp: Timestamp,
    pub(crate) temp_balance_hash: CryptoHash,
    pub(crate) resend_holding: Option<Timestamp>,
    pub(crate) last_tiebreak: i64,
    pub(crate) last_fault_action: i64,

    pub counters: Counters,

    now_override: Option<Timestamp>,
}

impl<S: BlockStore, N: Network> ConsensusCore<S, N> {
    pub fn new(
        config: CoreConfig,
        config_source: Option<Box<dyn ConfigSource>>,
        store: S,
        network: N,
        channels: CoreChannels,
        authorities: AuthoritySet,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        let db_states = DBStateLedger::new(config.checkpoints.clone());
        let now = Timestamp::now();
        let mut core = Self {
            config,
            config_source,
            store,
            sender: SenderHandle::new(network),
            event_publisher,
            ack_queue: channels.ack_queue,
            msg_queue: channels.msg_queue,
            network_invalid: channels.network_invalid,
            write_entry: channels.write_entry,
            replay: ReplayFilter::new(),
            holding: Holding::new(),
            acks: HashMap::new(),
            commits: Commits::new(),
            process_lists: ProcessLists::new(DbHeight::new(0)),
            db_states,
            ledger: LedgerState::new(DbHeight::new(0)),
            authorities,
            x_review: Vec::new(),
            snapshots_received: Vec::new(),
            snapshots_received_base: 0,
            missing_entry_blocks: Vec::new(),
            lleader_height: DbHeight::new(0),
            current_minute: 0,
            current_minute_start: now,
            leader: false,
            leader_vm_index: VmIndex::new(0),
            syncing: false,
            eom: false,
            eom_done: false,
            eom_sys: false,
            eom_syncing: false,
            eom_limit: 0,
            eom_processed: 0,
            eom_minute: 0,
            dbsig: false,
            dbsig_done: false,
            dbsig_sys: false,
            dbsig_limit: 0,
            dbsig_processed: 0,
            saving: false,
            run_leader: false,
            ignore_missing: true,
            ignore_done: false,
            db_finished: true,
            start_delay: now.millis() as i64,
            highest_known: DbHeight::new(0),
            highest_ack: DbHeight::new(0),
            entry_db_height_complete: DbHeight::new(0),
            reset_request: false,
            leader_timestamp: now,
            temp_balance_hash: CryptoHash::zero(),
            resend_holding: None,
            last_tiebreak: 0,
            last_fault_action: 0,
            counters: Counters::default(),
            now_override: None,
        };
        // Open the first process list so leadership can be computed before any message arrives.
        let seed = core.pl_seed();
        core.process_lists
            .get_or_create(core.lleader_height, &seed, now);
        core
    }

    /// The core's notion of "now". Overridable so deterministic runs can be replayed.
    pub(crate) fn get_timestamp(&self) -> Timestamp {
        self.now_override.unwrap_or_else(Timestamp::now)
    }

    /// Pin the core's clock. Mostly useful for replaying recorded runs and in tests.
    pub fn set_now(&mut self, now: Timestamp) {
        self.now_override = Some(now);
    }

    /// Node-local salt derivative for `timestamp`.
    pub(crate) fn get_salt(&self, timestamp: Timestamp) -> SaltNumber {
        let mut bytes = self.config.salt.bytes().to_vec();
        bytes.extend_from_slice(&timestamp.millis().to_le_bytes());
        SaltNumber::new(u32::from_le_bytes(
            CryptoHash::of(&bytes).bytes()[..4].try_into().unwrap(),
        ))
    }

    /// This is the highest block signed off and recorded in the database.
    pub fn highest_saved_blk(&self) -> DbHeight {
        self.db_states.highest_saved()
    }

    /// This is the highest block signed off, but not necessarily validated.
    pub fn highest_completed_blk(&self) -> DbHeight {
        self.db_states.highest_completed()
    }

    /// The lowest block currently under construction by the leader.
    pub fn leader_height(&self) -> DbHeight {
        self.lleader_height
    }

    /// The highest block for which we have received a message; can run ahead of the block under
    /// construction depending on arrival order.
    pub fn highest_known_block(&self) -> DbHeight {
        self.highest_known
    }

    pub fn highest_ack(&self) -> DbHeight {
        self.highest_ack
    }

    pub fn set_highest_ack(&mut self, db_height: DbHeight) {
        if db_height > self.highest_ack {
            self.highest_ack = db_height;
        }
    }

    pub fn current_minute(&self) -> u8 {
        self.current_minute
    }

    pub fn is_leader(&self) -> bool {
        self.leader
    }

    pub fn identity_chain_id(&self) -> ServerId {
        self.config.identity_chain_id
    }

    /// Server sets for seeding a process list when no older list exists.
    pub(crate) fn pl_seed(&self) -> (Vec<Server>, Vec<Server>) {
        (
            self.config.initial_fed_servers.clone(),
            self.config.initial_audit_servers.clone(),
        )
    }

    /// Factoid balance of `address`. With `real_time` set, the temp overlay of the list under
    /// construction is consulted first.
    pub fn factoid_balance(&self, real_time: bool, address: &Address) -> i64 {
        if real_time {
            if let Some(pl) = self.process_lists.get(self.lleader_height) {
                if let Some(v) = pl.factoid_balances_t.lock().unwrap().get(address) {
                    return *v;
                }
            }
        }
        *self
            .ledger
            .factoid_balances
            .lock()
            .unwrap()
            .get(address)
            .unwrap_or(&0)
    }

    /// Write a factoid balance. With `real_time` set, only the temp overlay changes.
    pub fn put_factoid_balance(&mut self, real_time: bool, address: Address, value: i64) {
        if real_time {
            if let Some(pl) = self.process_lists.get(self.lleader_height) {
                pl.factoid_balances_t.lock().unwrap().insert(address, value);
            }
        } else {
            self.ledger
                .factoid_balances
                .lock()
                .unwrap()
                .insert(address, value);
        }
    }

    /// Entry credit balance of `address`, overlay first when `real_time` is set.
    pub fn ec_balance(&self, real_time: bool, address: &Address) -> i64 {
        if real_time {
            if let Some(pl) = self.process_lists.get(self.lleader_height) {
                if let Some(v) = pl.ec_balances_t.lock().unwrap().get(address) {
                    return *v;
                }
            }
        }
        *self
            .ledger
            .ec_balances
            .lock()
            .unwrap()
            .get(address)
            .unwrap_or(&0)
    }

    pub fn put_ec_balance(&mut self, real_time: bool, address: Address, value: i64) {
        if real_time {
            if let Some(pl) = self.process_lists.get(self.lleader_height) {
                pl.ec_balances_t.lock().unwrap().insert(address, value);
            }
        } else {
            self.ledger.ec_balances.lock().unwrap().insert(address, value);
        }
    }

    /// The `(ack, message)` pair at a given slot, if this node holds it.
    pub fn get_msg(
        &self,
        vm_index: VmIndex,
        db_height: DbHeight,
        height: usize,
    ) -> Option<&(Ack, Message)> {
        self.process_lists.get(db_height)?.get_slot(vm_index, height)
    }

    /// Create a new acknowledgement. Must be called by a leader; assumes all the pieces are in
    /// place.
    pub(crate) fn new_ack(&mut self, msg: &mut Message, balance_hash: Option<CryptoHash>) -> Ack {
        msg.set_leader_chain_id(self.config.identity_chain_id);
        let now = self.get_timestamp();
        let vm_index = msg.vm_index();
        let message_hash = msg.msg_hash();
        let salt_number = self.get_salt(now);
        let mut salt = [0u8; 8];
        salt.copy_from_slice(&self.config.salt.bytes()[..8]);

        let pl = self
            .process_lists
            .get(self.lleader_height)
            .expect("a leader always has the process list it leads");
        let vm = &pl.vms[vm_index.index()];
        let minute = vm.leader_minute;
        let (height, serial_hash) = match vm.last_ack() {
            Some(last) => (last.height.next(), last.next_serial_hash(&message_hash)),
            None => (
                crate::types::data_types::ListHeight::new(0),
                message_hash,
            ),
        };

        let mut ack = Ack {
            db_height: self.lleader_height,
            vm_index,
            height,
            minute,
            timestamp: now,
            salt,
            salt_number,
            message_hash,
            serial_hash,
            leader_chain_id: self.config.identity_chain_id,
            balance_hash,
            signature: crate::types::data_types::SignatureBytes::zero(),
        };
        ack.sign(&self.config.keypair);
        ack
    }

    /// Is this node's identity currently in the audit pool at `db_height`?
    pub(crate) fn is_audit_server(&self, db_height: DbHeight) -> bool {
        self.process_lists
            .get(db_height)
            .map(|pl| {
                pl.audit_servers
                    .iter()
                    .any(|s| s.id == self.config.identity_chain_id)
            })
            .unwrap_or(false)
    }

    /// Handle a reset request: drop in-flight sync state and fall back to the last saved block.
    pub(crate) fn do_reset(&mut self) {
        self.syncing = false;
        self.eom = false;
        self.eom_done = false;
        self.eom_sys = false;
        self.eom_processed = 0;
        self.dbsig = false;
        self.dbsig_done = false;
        self.dbsig_processed = 0;
        self.saving = false;
        self.x_review.clear();
        self.acks.clear();
    }

}

/// Read-only views used by API surfaces and by tests that assert on consensus internals.
impl<S: BlockStore, N: Network> ConsensusCore<S, N> {
    pub fn process_list(&self, db_height: DbHeight) -> Option<&crate::process_list::ProcessList> {
        self.process_lists.get(db_height)
    }

    pub fn db_state(&self, db_height: DbHeight) -> Option<&crate::dbstate::DBState> {
        self.db_states.get(db_height)
    }

    pub fn holding(&self) -> &Holding {
        &self.holding
    }

    pub fn commit_registry(&self) -> &Commits {
        &self.commits
    }

    pub fn has_pending_ack(&self, message_hash: &CryptoHash) -> bool {
        self.acks.contains_key(message_hash)
    }

    pub fn leader_vm_index(&self) -> VmIndex {
        self.leader_vm_index
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    pub fn is_saving(&self) -> bool {
        self.saving
    }

    pub fn eom_in_progress(&self) -> bool {
        self.eom
    }

    pub fn eom_done(&self) -> bool {
        self.eom_done
    }

    pub fn eom_processed(&self) -> i32 {
        self.eom_processed
    }

    pub fn dbsig_done(&self) -> bool {
        self.dbsig_done
    }

    pub fn authority_set(&self) -> &AuthoritySet {
        &self.authorities
    }

    pub fn review_queue_len(&self) -> usize {
        self.x_review.len()
    }

    pub fn last_fault_action(&self) -> i64 {
        self.last_fault_action
    }

    /// Digest of the permanent balances as of the last fully-unwound minute.
    pub fn temp_balance_hash(&self) -> CryptoHash {
        self.temp_balance_hash
    }

    /// When the current minute opened.
    pub fn current_minute_start(&self) -> Timestamp {
        self.current_minute_start
    }

    /// Whether an end-of-minute wave has been opened for the block under construction.
    pub fn eom_syncing(&self) -> bool {
        self.eom_syncing
    }
}
