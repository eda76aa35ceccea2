//! Stake-weighted vote collection.
//!
//! Peers deliver votes as messages over a channel; a collector task gathers
//! exactly `k` votes from distinct voters, tallies them, and feeds the batch
//! majority into a Snowball instance. Closing the channel drains whatever
//! partial batch remains without tallying it and exits; the round driver
//! uses that to impose deadlines.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::accounts;
use crate::identity::{AccountId, RoundId};
use crate::round::Round;
use crate::snowball::Snowball;
use crate::tree::StateTree;

/// A peer's answer to "am I out of sync?".
#[derive(Clone, Debug)]
pub struct SyncVote {
    pub voter: AccountId,
    pub out_of_sync: bool,
}

/// A peer's preferred round for finalization.
#[derive(Clone, Debug)]
pub struct FinalizationVote {
    pub voter: AccountId,
    pub round: Round,
}

/// Parameters shared by both collectors.
#[derive(Clone, Debug)]
pub struct VoteParams {
    /// Votes per batch.
    pub k: usize,
    /// Stake floor applied before weighting.
    pub minimum_stake: u64,
    /// Weight fraction a sync bucket must reach to become the majority.
    pub sync_vote_threshold: f64,
}

/// Tally one sync batch: stake-weighted, `max_stake`-normalized.
///
/// Returns the first boolean bucket (in vote arrival order) whose share of
/// total weight reaches the threshold, or `None` when neither does.
pub fn tally_sync_votes(
    snapshot: &StateTree,
    votes: &[SyncVote],
    minimum_stake: u64,
    threshold: f64,
) -> Option<bool> {
    let mut stakes: HashMap<AccountId, f64> = HashMap::with_capacity(votes.len());
    let mut max_stake = 0f64;

    for vote in votes {
        let stake = accounts::read_stake(snapshot, &vote.voter)
            .unwrap_or(0)
            .max(minimum_stake) as f64;
        stakes.insert(vote.voter, stake);
        if stake > max_stake {
            max_stake = stake;
        }
    }
    if max_stake == 0.0 {
        return None;
    }

    let mut weights: HashMap<bool, f64> = HashMap::with_capacity(2);
    let mut total_weight = 0f64;

    for vote in votes {
        let percent = stakes[&vote.voter] / max_stake;
        *weights.entry(vote.out_of_sync).or_insert(0.0) += percent;
        total_weight += percent;
    }

    votes
        .iter()
        .find(|vote| weights[&vote.out_of_sync] / total_weight >= threshold)
        .map(|vote| vote.out_of_sync)
}

/// Collect sync votes until the channel closes.
///
/// One vote per peer per batch; a second vote from the same voter within a
/// batch is silently dropped so the sampling stays fair.
pub async fn collect_sync_votes(
    accounts_tree: Arc<RwLock<StateTree>>,
    snowball: Arc<Mutex<Snowball<bool>>>,
    mut votes_rx: mpsc::Receiver<SyncVote>,
    params: VoteParams,
) {
    let mut votes: Vec<SyncVote> = Vec::with_capacity(params.k);
    let mut voters: HashSet<AccountId> = HashSet::with_capacity(params.k);

    while let Some(vote) = votes_rx.recv().await {
        if !voters.insert(vote.voter) {
            continue;
        }
        votes.push(vote);

        if votes.len() == params.k {
            let snapshot = accounts_tree.read().snapshot();
            let majority = tally_sync_votes(
                &snapshot,
                &votes,
                params.minimum_stake,
                params.sync_vote_threshold,
            );
            if majority.is_none() {
                tracing::debug!("sync vote batch reached no majority, discarded");
            }
            snowball.lock().tick(majority.as_ref());

            voters.clear();
            votes.clear();
        }
    }
}

/// Collect finalization votes until the channel closes.
///
/// Tallies accumulate `transactions_count` per round ID and persist across
/// batches; each full batch feeds the highest-tallied candidate (first-seen
/// breaks ties) into the Snowball instance.
pub async fn collect_finalization_votes(
    snowball: Arc<Mutex<Snowball<Round>>>,
    mut votes_rx: mpsc::Receiver<FinalizationVote>,
    params: VoteParams,
) {
    let mut votes: Vec<FinalizationVote> = Vec::with_capacity(params.k);
    let mut voters: HashSet<AccountId> = HashSet::with_capacity(params.k);
    let mut tallies: HashMap<RoundId, u32> = HashMap::new();

    while let Some(vote) = votes_rx.recv().await {
        if !voters.insert(vote.voter) {
            continue;
        }
        *tallies.entry(vote.round.id).or_insert(0) += vote.round.transactions_count;
        votes.push(vote);

        if votes.len() == params.k {
            let mut majority: Option<&Round> = None;
            let mut majority_tally = 0u32;
            for vote in &votes {
                let tally = tallies[&vote.round.id];
                if majority.is_none() || tally > majority_tally {
                    majority = Some(&vote.round);
                    majority_tally = tally;
                }
            }

            snowball.lock().tick(majority);

            voters.clear();
            votes.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::write_stake;
    use crate::identity::MerkleDigest;
    use crate::transaction::{encode_payload, Tag, Transaction, TransferPayload};

    fn voter(seed: u8) -> AccountId {
        AccountId([seed; 32])
    }

    fn params(k: usize, minimum_stake: u64, threshold: f64) -> VoteParams {
        VoteParams {
            k,
            minimum_stake,
            sync_vote_threshold: threshold,
        }
    }

    fn test_round(seed: u8, transactions_count: u32) -> Round {
        let tx = Transaction::new_unsigned(
            AccountId([seed; 32]),
            AccountId([seed; 32]),
            vec![],
            0,
            Tag::Transfer,
            encode_payload(&TransferPayload {
                recipient: AccountId([0; 32]),
                amount: 0,
                invoke: None,
            }),
        )
        .unwrap();
        Round::new(
            seed as u64,
            tx.clone(),
            tx,
            MerkleDigest([seed; 16]),
            transactions_count,
        )
    }

    /// Property 7, equal stakes: 3-of-5 at threshold 0.6 wins.
    #[test]
    fn sync_tally_equal_stakes() {
        let mut tree = StateTree::new();
        for seed in 1..=5 {
            write_stake(&mut tree, &voter(seed), 10);
        }

        let votes: Vec<SyncVote> = [true, true, true, false, false]
            .iter()
            .enumerate()
            .map(|(i, &b)| SyncVote {
                voter: voter(i as u8 + 1),
                out_of_sync: b,
            })
            .collect();

        assert_eq!(tally_sync_votes(&tree, &votes, 10, 0.6), Some(true));
    }

    /// Property 7, skewed stakes: the floor normalizes a whale's weight.
    #[test]
    fn sync_tally_minimum_stake_floor() {
        let mut tree = StateTree::new();
        write_stake(&mut tree, &voter(1), 100);
        for seed in 2..=5 {
            write_stake(&mut tree, &voter(seed), 1);
        }

        let votes: Vec<SyncVote> = [false, true, true, true, true]
            .iter()
            .enumerate()
            .map(|(i, &b)| SyncVote {
                voter: voter(i as u8 + 1),
                out_of_sync: b,
            })
            .collect();

        // Floored at 100 every voter weighs 1.0: true holds 0.8 >= 0.6.
        assert_eq!(tally_sync_votes(&tree, &votes, 100, 0.6), Some(true));
    }

    #[test]
    fn sync_tally_no_majority() {
        let mut tree = StateTree::new();
        for seed in 1..=4 {
            write_stake(&mut tree, &voter(seed), 10);
        }
        let votes: Vec<SyncVote> = [true, true, false, false]
            .iter()
            .enumerate()
            .map(|(i, &b)| SyncVote {
                voter: voter(i as u8 + 1),
                out_of_sync: b,
            })
            .collect();

        assert_eq!(tally_sync_votes(&tree, &votes, 10, 0.6), None);
    }

    /// Property 6: a duplicate voter contributes exactly once per batch.
    #[tokio::test]
    async fn duplicate_voter_dropped() {
        let tree = Arc::new(RwLock::new(StateTree::new()));
        let snowball = Arc::new(Mutex::new(Snowball::new(1, 1)));
        let (tx, rx) = mpsc::channel(16);

        let collector = tokio::spawn(collect_sync_votes(
            tree,
            Arc::clone(&snowball),
            rx,
            params(2, 10, 0.6),
        ));

        // The duplicate false vote must not complete the batch.
        tx.send(SyncVote {
            voter: voter(1),
            out_of_sync: false,
        })
        .await
        .unwrap();
        tx.send(SyncVote {
            voter: voter(1),
            out_of_sync: false,
        })
        .await
        .unwrap();
        tx.send(SyncVote {
            voter: voter(2),
            out_of_sync: true,
        })
        .await
        .unwrap();
        drop(tx);
        collector.await.unwrap();

        // 1 x false + 1 x true at threshold 0.6: no bucket qualifies, so the
        // only way the snowball stays undecided is if the duplicate was
        // dropped (three counted votes would have been two batches).
        assert!(!snowball.lock().decided());
        assert!(snowball.lock().preferred().is_none());
    }

    #[tokio::test]
    async fn sync_collector_reaches_decision() {
        let mut state = StateTree::new();
        for seed in 1..=3 {
            write_stake(&mut state, &voter(seed), 50);
        }
        let tree = Arc::new(RwLock::new(state));
        let snowball = Arc::new(Mutex::new(Snowball::new(2, 10)));
        let (tx, rx) = mpsc::channel(16);

        let collector = tokio::spawn(collect_sync_votes(
            tree,
            Arc::clone(&snowball),
            rx,
            params(3, 10, 0.6),
        ));

        // Two unanimous batches at beta1 = 2 decide.
        for batch in 0u8..2 {
            for seed in 1u8..=3 {
                tx.send(SyncVote {
                    voter: voter(seed + batch * 10),
                    out_of_sync: true,
                })
                .await
                .unwrap();
            }
        }
        drop(tx);
        collector.await.unwrap();

        assert!(snowball.lock().decided());
        assert_eq!(snowball.lock().preferred(), Some(&true));
    }

    /// S5: tallies persist across batches; the heavier round takes over.
    #[tokio::test]
    async fn finalization_tallies_persist_across_batches() {
        let snowball = Arc::new(Mutex::new(Snowball::new(100, 3)));
        let (tx, rx) = mpsc::channel(32);

        let collector = tokio::spawn(collect_finalization_votes(
            Arc::clone(&snowball),
            rx,
            params(3, 10, 0.6),
        ));

        let r1 = test_round(1, 5);
        let r2 = test_round(2, 10);

        // Batch 1: three votes for r1 -> tallies[r1] = 15, tick(r1).
        for seed in 1..=3 {
            tx.send(FinalizationVote {
                voter: voter(seed),
                round: r1.clone(),
            })
            .await
            .unwrap();
        }
        // Batches 2-4: r2 accumulates 30, 60, 90 and out-tallies r1.
        for batch in 0u8..3 {
            for seed in 1u8..=3 {
                tx.send(FinalizationVote {
                    voter: voter(seed + (batch + 1) * 10),
                    round: r2.clone(),
                })
                .await
                .unwrap();
            }
        }
        drop(tx);
        collector.await.unwrap();

        let snowball = snowball.lock();
        assert_eq!(snowball.preferred().map(|r| r.id), Some(r2.id));
    }

    #[tokio::test]
    async fn finalization_partial_batch_is_discarded() {
        let snowball: Arc<Mutex<Snowball<Round>>> = Arc::new(Mutex::new(Snowball::new(1, 1)));
        let (tx, rx) = mpsc::channel(8);

        let collector = tokio::spawn(collect_finalization_votes(
            Arc::clone(&snowball),
            rx,
            params(3, 10, 0.6),
        ));

        // Two of three required votes, then the deadline closes the channel.
        for seed in 1..=2 {
            tx.send(FinalizationVote {
                voter: voter(seed),
                round: test_round(1, 5),
            })
            .await
            .unwrap();
        }
        drop(tx);
        collector.await.unwrap();

        assert!(!snowball.lock().decided());
    }
}
