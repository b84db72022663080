//! Simulated transaction workloads shared by the integration tests and
//! benchmarks.

use block_stm::{KVStore, MemDb, MultiMemDb, MultiStoreView, StoreId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Store layout used by the bank workload: nonces and balances live in
/// separate stores.
pub const STORE_AUTH: StoreId = 0;
/// Balance store id.
pub const STORE_BANK: StoreId = 1;
/// Number of stores the bank workload touches.
pub const BANK_STORES: usize = 2;

/// A deterministic simulated transaction.
#[derive(Clone, Debug)]
pub enum MockTx {
    /// Bumps the sender's nonce.
    Noop { sender: u64 },
    /// Bumps the sender's nonce and moves funds.
    Transfer {
        sender: u64,
        receiver: u64,
        amount: u64,
    },
}

impl MockTx {
    /// Runs the transaction body against a view.
    pub fn run(&self, view: &MultiStoreView<'_>) {
        match self {
            MockTx::Noop { sender } => increase_nonce(*sender, view),
            MockTx::Transfer {
                sender,
                receiver,
                amount,
            } => {
                increase_nonce(*sender, view);
                bank_transfer(*sender, *receiver, *amount, view);
            }
        }
    }
}

/// `nonce<account>` key in the auth store.
pub fn nonce_key(account: u64) -> Vec<u8> {
    format!("nonce{account:04}").into_bytes()
}

/// `balance<account>` key in the bank store.
pub fn balance_key(account: u64) -> Vec<u8> {
    format!("balance{account:04}").into_bytes()
}

/// Big-endian u64 encoding used for counters and balances.
pub fn encode_u64(value: u64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

/// Decodes a counter, treating an absent value as zero.
pub fn decode_u64(value: Option<Vec<u8>>) -> u64 {
    value.map_or(0, |bytes| {
        u64::from_be_bytes(bytes.as_slice().try_into().expect("eight bytes"))
    })
}

fn increase_nonce(sender: u64, view: &MultiStoreView<'_>) {
    let key = nonce_key(sender);
    let nonce = decode_u64(view.get(STORE_AUTH, &key));
    view.set(STORE_AUTH, key.clone(), encode_u64(nonce + 1));

    // read-your-own-write sanity check, mirroring real nonce handling
    assert_eq!(decode_u64(view.get(STORE_AUTH, &key)), nonce + 1);
}

fn bank_transfer(sender: u64, receiver: u64, amount: u64, view: &MultiStoreView<'_>) {
    if sender == receiver {
        // self transfer, rewrite the balance unchanged
        let key = balance_key(sender);
        let balance = decode_u64(view.get(STORE_BANK, &key));
        view.set(STORE_BANK, key, encode_u64(balance));
        return;
    }

    let sender_key = balance_key(sender);
    let receiver_key = balance_key(receiver);

    let mut sender_balance = decode_u64(view.get(STORE_BANK, &sender_key));
    let mut receiver_balance = decode_u64(view.get(STORE_BANK, &receiver_key));

    if sender_balance >= amount {
        sender_balance -= amount;
        receiver_balance += amount;
    }

    view.set(STORE_BANK, sender_key, encode_u64(sender_balance));
    view.set(STORE_BANK, receiver_key, encode_u64(receiver_balance));
}

/// A randomized block over `accounts` accounts.
pub fn test_block(size: usize, accounts: u64, seed: u64) -> Vec<MockTx> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..size)
        .map(|_| {
            let sender = rng.gen_range(0..accounts);
            if rng.gen_bool(0.5) {
                MockTx::Noop { sender }
            } else {
                MockTx::Transfer {
                    sender,
                    receiver: rng.gen_range(0..accounts),
                    amount: rng.gen_range(1..100),
                }
            }
        })
        .collect()
}

/// A multi-store with every account funded in the bank store.
pub fn funded_storage(accounts: u64, balance: u64) -> MultiMemDb {
    let mut storage = MultiMemDb::new(BANK_STORES);
    for account in 0..accounts {
        storage
            .db_mut(STORE_BANK)
            .set(balance_key(account), encode_u64(balance));
    }
    storage
}

/// All entries of one store, in key order.
pub fn collect_store(db: &MemDb) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut iter = db.iterator(None, None);
    let mut entries = Vec::new();
    while iter.valid() {
        entries.push((iter.key().to_vec(), iter.value().to_vec()));
        iter.next();
    }
    entries
}

/// Byte equality of two multi-stores.
pub fn stores_equal(a: &MultiMemDb, b: &MultiMemDb, num_stores: usize) -> bool {
    (0..num_stores).all(|store| collect_store(a.db(store)) == collect_store(b.db(store)))
}
