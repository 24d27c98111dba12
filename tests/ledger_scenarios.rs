//! End-to-end ledger scenarios: bootstrap, transfers, double spends,
//! validator selection and fork resolution

use contribchain::block::Block;
use contribchain::blockchain::{BlockOrigin, Blockchain};
use contribchain::config::{ChainConfig, ConsensusConfig, GenesisAllocation};
use contribchain::consensus::ConsensusEngine;
use contribchain::crypto::KeyPair;
use contribchain::error::{ChainError, ErrorKind};
use contribchain::transaction::{Amount, Payload, TokenKind, Transaction};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn config(alice: &KeyPair) -> ChainConfig {
    ChainConfig {
        difficulty: 1,
        genesis_allocations: vec![
            GenesisAllocation {
                identity: alice.identity(),
                token: TokenKind::B,
                amount: Amount::from_tokens(1000),
            },
            GenesisAllocation {
                identity: alice.identity(),
                token: TokenKind::P,
                amount: Amount::from_tokens(50),
            },
        ],
        ..ChainConfig::default()
    }
}

fn transfer(from: &KeyPair, to: &str, tokens: u64, token: TokenKind) -> Transaction {
    let mut tx = Transaction::create(
        &from.identity(),
        to,
        Amount::from_tokens(tokens),
        token,
        Payload::default(),
    );
    tx.sign(Some(from)).unwrap();
    tx
}

fn chain_with_validator(alice: &KeyPair) -> (Blockchain, String) {
    let mut chain = Blockchain::in_memory(config(alice)).unwrap();
    let validator = KeyPair::generate().unwrap().identity();
    chain.register_validator(&validator, 200).unwrap();
    (chain, validator)
}

#[test]
fn test_genesis_transfer_and_balances() {
    let alice = KeyPair::generate().unwrap();
    let bob = KeyPair::generate().unwrap().identity();
    let (mut chain, validator) = chain_with_validator(&alice);
    assert_eq!(chain.height(), 0);
    assert_eq!(chain.get_balance(&bob, TokenKind::B), Amount::ZERO);

    chain
        .submit_transaction(transfer(&alice, &bob, 100, TokenKind::B))
        .unwrap();
    chain.mine_and_commit(&[validator.clone()], None).unwrap();

    assert_eq!(chain.height(), 1);
    assert_eq!(chain.get_balance(&alice.identity(), TokenKind::B), Amount::from_tokens(900));
    assert_eq!(chain.get_balance(&bob, TokenKind::B), Amount::from_tokens(100));
    // token kinds are accounted independently
    assert_eq!(chain.get_balance(&alice.identity(), TokenKind::P), Amount::from_tokens(50));
    assert_eq!(chain.get_balance(&bob, TokenKind::P), Amount::ZERO);
    // the validator reward is part of the committed block
    assert_eq!(chain.get_balance(&validator, TokenKind::B), chain.config().validator_reward);

    let status = chain.status();
    assert_eq!(status.height, 1);
    assert_eq!(status.pending_transactions, 0);
    assert_eq!(status.validator_count, 1);
    assert!(chain.is_chain_valid());
}

#[test]
fn test_combined_spends_over_balance() {
    let alice = KeyPair::generate().unwrap();
    let bob = KeyPair::generate().unwrap().identity();
    let carol = KeyPair::generate().unwrap().identity();
    let (mut chain, _) = chain_with_validator(&alice);

    let first = chain.submit_transaction(transfer(&alice, &bob, 600, TokenKind::B));
    let second = chain.submit_transaction(transfer(&alice, &carol, 500, TokenKind::B));

    assert!(first.is_ok());
    assert!(matches!(second, Err(ChainError::InsufficientBalance { .. })));
    assert_eq!(chain.mempool().len(), 1);
}

#[test]
fn test_weighted_selection_favors_high_scores() {
    let mut engine = ConsensusEngine::new(ConsensusConfig::default());
    engine.set_score("A", 1000);
    engine.set_score("B", 100);
    let candidates = vec!["A".to_string(), "B".to_string()];
    let mut rng = StdRng::seed_from_u64(42);

    let mut picked_a = 0;
    let trials = 2_000;
    for _ in 0..trials {
        if engine.select_validator_with(&candidates, &mut rng).unwrap() == "A" {
            picked_a += 1;
        }
    }
    assert!(picked_a > trials - picked_a);
    // roughly 10:1
    assert!(picked_a > trials * 8 / 10);
}

#[test]
fn test_resolve_conflicts_adopts_longer_valid_chain() {
    let alice = KeyPair::generate().unwrap();
    let bob = KeyPair::generate().unwrap().identity();
    let (mut local, _) = chain_with_validator(&alice);
    let (mut remote, remote_validator) = chain_with_validator(&alice);

    for tokens in [10, 20] {
        remote
            .submit_transaction(transfer(&alice, &bob, tokens, TokenKind::B))
            .unwrap();
        remote.mine_and_commit(&[remote_validator.clone()], None).unwrap();
    }
    let candidate = remote.blocks().to_vec();

    let mut tampered = candidate.clone();
    tampered[2].transactions[0].amount = Amount::from_tokens(999);
    assert!(matches!(
        local.resolve_conflicts(vec![tampered]),
        Err(ChainError::Conflict(_))
    ));
    assert_eq!(local.height(), 0);

    assert_eq!(local.resolve_conflicts(vec![candidate.clone()]).unwrap(), 2);
    assert_eq!(local.get_balance(&bob, TokenKind::B), Amount::from_tokens(30));

    // equal length is never adopted
    assert!(local.resolve_conflicts(vec![candidate]).is_err());
}

#[test]
fn test_foreign_genesis_is_a_conflict() {
    let alice = KeyPair::generate().unwrap();
    let stranger = KeyPair::generate().unwrap();
    let bob = KeyPair::generate().unwrap().identity();
    let (mut local, _) = chain_with_validator(&alice);
    let (mut foreign, validator) = chain_with_validator(&stranger);

    foreign
        .submit_transaction(transfer(&stranger, &bob, 5, TokenKind::B))
        .unwrap();
    foreign.mine_and_commit(&[validator], None).unwrap();

    let err = local
        .resolve_conflicts(vec![foreign.blocks().to_vec()])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(local.height(), 0);
}

#[test]
fn test_serialization_preserves_hashes() {
    let alice = KeyPair::generate().unwrap();
    let bob = KeyPair::generate().unwrap().identity();
    let (mut chain, validator) = chain_with_validator(&alice);
    let tx = transfer(&alice, &bob, 7, TokenKind::P);
    chain.submit_transaction(tx.clone()).unwrap();
    let block = chain.mine_and_commit(&[validator], None).unwrap();

    let restored_tx = Transaction::from_bytes(&tx.to_bytes().unwrap()).unwrap();
    assert_eq!(restored_tx.content_hash, tx.content_hash);
    assert_eq!(restored_tx.unique_id(), tx.unique_id());

    let restored_block = Block::from_bytes(&block.to_bytes().unwrap()).unwrap();
    assert_eq!(restored_block.hash, block.hash);
    assert_eq!(Block::calculate_merkle_root(&restored_block.transactions), block.header.merkle_root);
}

#[test]
fn test_tampering_flips_validity() {
    let alice = KeyPair::generate().unwrap();
    let bob = KeyPair::generate().unwrap().identity();
    let (mut chain, validator) = chain_with_validator(&alice);
    chain
        .submit_transaction(transfer(&alice, &bob, 100, TokenKind::B))
        .unwrap();
    let block = chain.mine_and_commit(&[validator], None).unwrap();
    let genesis = chain.blocks()[0].clone();
    assert!(block.is_valid(Some(&genesis)));

    let mut tampered = block.clone();
    tampered.transactions[0].amount = Amount::from_tokens(1);
    assert!(!tampered.is_valid(Some(&genesis)));

    // a forged hash does not survive deserialization either
    let mut forged = block;
    forged.header.nonce += 1;
    assert!(Block::from_bytes(&forged.to_bytes().unwrap()).is_err());
}

#[test]
fn test_export_import_between_nodes() {
    let alice = KeyPair::generate().unwrap();
    let bob = KeyPair::generate().unwrap().identity();
    let (mut source, validator) = chain_with_validator(&alice);
    source
        .submit_transaction(transfer(&alice, &bob, 42, TokenKind::B))
        .unwrap();
    source.mine_and_commit(&[validator], None).unwrap();

    let (mut target, _) = chain_with_validator(&alice);
    let height = target.import_chain(&source.export_chain().unwrap()).unwrap();
    assert_eq!(height, 1);
    assert_eq!(target.get_balance(&bob, TokenKind::B), Amount::from_tokens(42));
    assert!(target.is_chain_valid());
}

#[test]
fn test_lone_validator_hits_repeat_cap() {
    let alice = KeyPair::generate().unwrap();
    let bob = KeyPair::generate().unwrap().identity();
    let (mut chain, validator) = chain_with_validator(&alice);

    for tokens in 1..=3 {
        chain
            .submit_transaction(transfer(&alice, &bob, tokens, TokenKind::B))
            .unwrap();
        chain.mine_and_commit(&[validator.clone()], None).unwrap();
    }
    chain
        .submit_transaction(transfer(&alice, &bob, 4, TokenKind::B))
        .unwrap();
    let err = chain
        .mine_and_commit(&[validator.clone()], None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Consensus);
    assert!(err.is_retryable());
    assert_eq!(chain.height(), 3);
    assert_eq!(chain.consensus().validator_history(100).len(), 3);
}

#[test]
fn test_rotating_validators_keep_producing() {
    let alice = KeyPair::generate().unwrap();
    let bob = KeyPair::generate().unwrap().identity();
    let (mut chain, first) = chain_with_validator(&alice);
    let mut validators = vec![first];
    for _ in 0..3 {
        let id = KeyPair::generate().unwrap().identity();
        chain.register_validator(&id, 200).unwrap();
        validators.push(id);
    }

    for tokens in 1..=12 {
        chain
            .submit_transaction(transfer(&alice, &bob, tokens, TokenKind::B))
            .unwrap();
        chain.mine_and_commit(&validators, None).unwrap();
    }
    assert_eq!(chain.height(), 12);
    for id in &validators {
        assert!(chain.consensus().recent_selections(id) <= 3);
    }
    assert!(chain.is_chain_valid());
}

#[test]
fn test_remote_block_over_repeat_cap_is_rejected() {
    let alice = KeyPair::generate().unwrap();
    let bob = KeyPair::generate().unwrap().identity();
    let (mut local, _) = chain_with_validator(&alice);
    let (mut remote, validator) = chain_with_validator(&alice);
    local.register_validator(&validator, 200).unwrap();

    for tokens in 1..=3 {
        remote
            .submit_transaction(transfer(&alice, &bob, tokens, TokenKind::B))
            .unwrap();
        let block = remote.mine_and_commit(&[validator.clone()], None).unwrap();
        local.add_block(block, BlockOrigin::Remote).unwrap();
    }
    assert_eq!(local.consensus().recent_selections(&validator), 3);

    // the remote side bypasses selection and produces a fourth block anyway
    let tx = transfer(&alice, &bob, 4, TokenKind::B);
    let mut block = remote.assemble_block(vec![tx], &validator).unwrap();
    block.mine();
    assert!(matches!(
        local.add_block(block, BlockOrigin::Remote),
        Err(ChainError::Consensus(_))
    ));
    assert_eq!(local.height(), 3);
    assert_eq!(local.consensus().recent_selections(&validator), 3);
}

#[test]
fn test_mempool_after_remote_block() {
    let alice = KeyPair::generate().unwrap();
    let bob = KeyPair::generate().unwrap().identity();
    let carol = KeyPair::generate().unwrap().identity();
    let (mut local, _) = chain_with_validator(&alice);
    let (mut remote, validator) = chain_with_validator(&alice);
    local.register_validator(&validator, 200).unwrap();

    // relayed to both sides, then included by the remote validator
    let shared = transfer(&alice, &bob, 100, TokenKind::B);
    local.submit_transaction(shared.clone()).unwrap();
    remote.submit_transaction(shared.clone()).unwrap();
    // only the local side knows about this one, and it loses the race
    let stale = transfer(&alice, &carol, 850, TokenKind::B);
    local.submit_transaction(stale.clone()).unwrap();
    remote
        .submit_transaction(transfer(&alice, &carol, 800, TokenKind::B))
        .unwrap();

    let block = remote.mine_and_commit(&[validator.clone()], None).unwrap();
    local.add_block(block, BlockOrigin::Remote).unwrap();

    assert!(local.mempool().is_empty());
    assert_eq!(local.get_balance(&alice.identity(), TokenKind::B), Amount::from_tokens(100));
    assert_eq!(local.status().pending_transactions, 0);
}
