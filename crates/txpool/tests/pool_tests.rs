//! Integration tests: pool drain against a real staging context.

use pofcore_chain::{Chain, Committer, MemChain, Provider};
use pofcore_txpool::TransactionPool;
use pofcore_types::{Address, Transaction};

fn push_transfer(pool: &TransactionPool, from: Address, seq: u64, ts: u64) {
    let tx = Transaction::transfer(from, Address::new([0xee; 20]), seq, 1, ts);
    pool.push(0, tx.content_hash(), tx, vec![], vec![]).unwrap();
}

#[test]
fn drain_releases_a_full_sequence_run_in_order() {
    let chain = MemChain::new(1, 1_000);
    let pool = TransactionPool::new();
    let sender = Address::new([1u8; 20]);

    // Pushed out of order; the sequence gate releases them 1, 2, 3.
    push_transfer(&pool, sender, 2, 30);
    push_transfer(&pool, sender, 1, 10);
    push_transfer(&pool, sender, 3, 20);

    let generator = Address::new([9u8; 20]);
    let ctx = chain.new_context();
    let mut bc = chain.new_block_creator(ctx, generator, vec![]).unwrap();

    let mut locked = pool.lock();
    let mut released = Vec::new();
    loop {
        let ctx = bc.context_mut();
        let sn = ctx.snapshot();
        let item = locked.unsafe_pop(&*ctx);
        bc.context_mut().revert(sn);
        let Some(item) = item else { break };
        released.push(item.transaction.seq);
        bc.unsafe_add_tx(
            generator,
            item.tx_type,
            item.tx_hash,
            item.transaction,
            item.signatures,
            item.signers,
        )
        .unwrap();
    }
    drop(locked);

    assert_eq!(released, vec![1, 2, 3]);
    assert_eq!(pool.size(), 0);

    let (block, ctx) = bc.finalize(2_000).unwrap();
    assert_eq!(block.transactions.len(), 3);
    chain.connect_block_with_context(&block, ctx).unwrap();
    assert_eq!(chain.height(), 1);
    assert_eq!(chain.account_seq(&sender), 3);
    chain.close();
}

#[test]
fn unready_transactions_stay_pooled() {
    let chain = MemChain::new(1, 1_000);
    let pool = TransactionPool::new();
    push_transfer(&pool, Address::new([1u8; 20]), 5, 10);

    let ctx = chain.new_context();
    let mut locked = pool.lock();
    assert!(locked.unsafe_pop(&*ctx).is_none());
    drop(locked);
    assert_eq!(pool.size(), 1);
}
