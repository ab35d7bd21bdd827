//! Builders for cores, leaders, and the messages they exchange.
//!
//! `LeaderSim` plays the role of a remote federated server: it signs end-of-minute markers and
//! builds the acknowledgement chains its virtual servers would produce, so tests can feed a core
//! exactly the traffic a live network peer would.

use std::collections::HashMap;

use ed25519_dalek::SigningKey;
use rand_core::OsRng;

use fedchain_rs::{
    consensus::state::{ConsensusCore, CoreChannels, CoreConfig},
    messages::{
        Ack, BlockSnapshot, CommitChain, CommitEntry, EndOfMinute, Message, Payload, RevealEntry,
    },
    networking::queues::{bounded, QueueReceiver, QueueSender},
    types::{
        authority::{Authority, AuthoritySet, Server, ServerClass},
        blocks::{AdminBlock, DirectoryBlock, Entry, EntryCreditBlock, FactoidBlock},
        crypto_primitives::Keypair,
        data_types::{
            Address, CryptoHash, DbHeight, EntryCredits, ListHeight, Minute, SaltNumber, ServerId,
            SignatureBytes, Timestamp, VmIndex,
        },
    },
};

use super::{mem_store::MemStore, mock_network::RecordingNetwork};

/// A simulated federated (or audit) server with its own identity and ack chains.
pub(crate) struct LeaderSim {
    pub(crate) keypair: Keypair,
    pub(crate) id: ServerId,
    last_acks: HashMap<(u32, u8), Ack>,
}

impl LeaderSim {
    pub(crate) fn new() -> LeaderSim {
        let keypair = Keypair::new(SigningKey::generate(&mut OsRng));
        let id = ServerId::new(CryptoHash::of(&keypair.public().to_bytes()).bytes());
        LeaderSim {
            keypair,
            id,
            last_acks: HashMap::new(),
        }
    }

    pub(crate) fn server(&self) -> Server {
        Server::new(self.id)
    }

    pub(crate) fn authority(&self, class: ServerClass) -> Authority {
        Authority::new(self.id, self.keypair.public().to_bytes(), class)
    }

    /// Build the acknowledgement this leader would stamp on `msg` at the next position of
    /// `vm_index`.
    pub(crate) fn ack(
        &mut self,
        msg: &Message,
        db_height: DbHeight,
        vm_index: VmIndex,
        minute: Minute,
        now: Timestamp,
    ) -> Message {
        let message_hash = msg.msg_hash();
        let key = (db_height.int(), vm_index.int());
        let (height, serial_hash) = match self.last_acks.get(&key) {
            Some(last) => (last.height.next(), last.next_serial_hash(&message_hash)),
            None => (ListHeight::new(0), message_hash),
        };
        let mut ack = Ack {
            db_height,
            vm_index,
            height,
            minute,
            timestamp: now,
            salt: [7u8; 8],
            salt_number: SaltNumber::new(7),
            message_hash,
            serial_hash,
            leader_chain_id: self.id,
            balance_hash: None,
            signature: SignatureBytes::zero(),
        };
        ack.sign(&self.keypair);
        self.last_acks.insert(key, ack.clone());
        Message::new(Payload::Ack(ack), now)
    }

    /// Build this leader's signed end-of-minute marker.
    pub(crate) fn eom(
        &self,
        db_height: DbHeight,
        vm_index: VmIndex,
        minute: Minute,
        now: Timestamp,
    ) -> Message {
        let mut eom = EndOfMinute {
            db_height,
            vm_index,
            minute,
            server_id: self.id,
            sys_height: 0,
            sys_hash: None,
            timestamp: now,
            signature: SignatureBytes::zero(),
        };
        eom.sign(&self.keypair);
        Message::new(Payload::EndOfMinute(eom), now)
    }
}

/// A consensus core wired to in-memory collaborators, plus the clock it runs on. The queue
/// senders are held so the core's receivers stay connected for the duration of a test.
pub(crate) struct TestCore {
    pub(crate) core: ConsensusCore<MemStore, RecordingNetwork>,
    pub(crate) network: RecordingNetwork,
    #[allow(dead_code)]
    pub(crate) store: MemStore,
    pub(crate) invalid_rx: QueueReceiver<Message>,
    pub(crate) entries_rx: QueueReceiver<Entry>,
    #[allow(dead_code)]
    pub(crate) ack_tx: QueueSender<Message>,
    #[allow(dead_code)]
    pub(crate) msg_tx: QueueSender<Message>,
    pub(crate) now: Timestamp,
}

pub(crate) fn build_core(
    me: &LeaderSim,
    feds: &[&LeaderSim],
    audits: &[&LeaderSim],
    network_name: &str,
    checkpoints: HashMap<u32, String>,
) -> TestCore {
    let store = MemStore::new();
    let network = RecordingNetwork::new();

    let (ack_tx, ack_rx) = bounded(10_000);
    let (msg_tx, msg_rx) = bounded(10_000);
    let (invalid_tx, invalid_rx) = bounded(10_000);
    let (write_entry_tx, entries_rx) = bounded(10_000);

    let mut authorities = AuthoritySet::new();
    for fed in feds {
        authorities.register(fed.authority(ServerClass::Federated));
    }
    for audit in audits {
        authorities.register(audit.authority(ServerClass::Audit));
    }

    let config = CoreConfig {
        identity_chain_id: me.id,
        keypair: me.keypair.clone(),
        salt: CryptoHash::of(&me.id.bytes()),
        network_name: network_name.to_string(),
        checkpoints,
        start_delay_limit_millis: 0,
        fault_timeout_secs: 120,
        keep_mismatch: false,
        ack_change: 0,
        initial_fed_servers: feds.iter().map(|f| f.server()).collect(),
        initial_audit_servers: audits.iter().map(|a| a.server()).collect(),
    };

    let core = ConsensusCore::new(
        config,
        None,
        store.clone(),
        network.clone(),
        CoreChannels {
            ack_queue: ack_rx,
            msg_queue: msg_rx,
            network_invalid: invalid_tx,
            write_entry: write_entry_tx,
        },
        authorities,
        None,
    );

    let now = Timestamp::now();
    TestCore {
        core,
        network,
        store,
        invalid_rx,
        entries_rx,
        ack_tx,
        msg_tx,
        now,
    }
}

impl TestCore {
    /// Move the core's clock forward and return the new "now".
    pub(crate) fn advance(&mut self, millis: u64) -> Timestamp {
        self.now = Timestamp::new(self.now.millis() + millis);
        self.core.set_now(self.now);
        self.now
    }

    /// Apply a saved genesis block, leaving the core building block 1.
    pub(crate) fn seed_genesis(&mut self) {
        self.advance(1);
        let mut genesis = genesis_snapshot(self.now);
        self.core.execute_msg(&mut genesis);
        assert_eq!(self.core.highest_saved_blk(), DbHeight::new(0));
        assert_eq!(self.core.leader_height(), DbHeight::new(1));
    }

    /// Run the boot window: after this the core acts on its leader role and stops ignoring
    /// recent history.
    pub(crate) fn boot(&mut self) {
        self.advance(60_000);
        self.core.process();
        self.advance(10);
        self.core.process();
    }

    /// Drive process-list consumption until quiescent (bounded by `rounds`).
    pub(crate) fn run_update(&mut self, rounds: usize) {
        for _ in 0..rounds {
            self.core.update_state();
        }
    }

    /// Deliver a message straight into the executor.
    pub(crate) fn deliver(&mut self, msg: &Message) -> bool {
        let mut msg = msg.clone();
        self.core.execute_msg(&mut msg)
    }
}

pub(crate) fn genesis_snapshot(now: Timestamp) -> Message {
    let height = DbHeight::new(0);
    let snapshot = BlockSnapshot {
        directory_block: DirectoryBlock::new(height, now),
        admin_block: AdminBlock::new(height),
        factoid_block: FactoidBlock::new(height),
        entry_credit_block: EntryCreditBlock::new(height),
        eblocks: vec![],
        entries: vec![],
        is_in_db: false,
    };
    Message::new(Payload::BlockSnapshot(snapshot), now)
}

pub(crate) fn commit_chain_msg(
    entry: &Entry,
    credits: u8,
    ec_address: Address,
    now: Timestamp,
) -> Message {
    Message::new(
        Payload::CommitChain(CommitChain {
            entry_hash: entry.hash(),
            chain_id_hash: CryptoHash::of(&entry.chain_id.bytes()),
            credits: EntryCredits::new(credits),
            ec_address,
            timestamp: now,
            signature: SignatureBytes::zero(),
        }),
        now,
    )
}

#[allow(dead_code)]
pub(crate) fn commit_entry_msg(
    entry: &Entry,
    credits: u8,
    ec_address: Address,
    now: Timestamp,
) -> Message {
    Message::new(
        Payload::CommitEntry(CommitEntry {
            entry_hash: entry.hash(),
            credits: EntryCredits::new(credits),
            ec_address,
            timestamp: now,
            signature: SignatureBytes::zero(),
        }),
        now,
    )
}

pub(crate) fn reveal_msg(entry: &Entry, is_entry: bool, now: Timestamp) -> Message {
    Message::new(
        Payload::RevealEntry(RevealEntry {
            entry: entry.clone(),
            is_entry,
            timestamp: now,
        }),
        now,
    )
}
