//! Block sampler
//!
//! Draws blocks from the enabled pool without replacement. Each namespace
//! keeps its own cycle: a persisted list of pool indices not yet handed out.
//! When the list runs dry, or the pool size changes under it, the cycle
//! resets and its counter moves forward.
//!
//! Every pick is a single `BEGIN IMMEDIATE` transaction, so callers in
//! different processes never receive the same index from the same cycle.

use rand::Rng;
use serde::Serialize;
use sqlx::SqliteConnection;
use thiserror::Error;
use tracing::warn;

use crate::db::{enabled_pool, now_ms, Database, IpBlock, Stored};

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("no blocks available in the pool")]
    NoBlocksAvailable,
    #[error("sampler store error: {0}")]
    Store(#[from] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct Pick {
    pub block: IpBlock,
    pub index: usize,
    pub cycle: i64,
    /// Indices still unused in this cycle after the pick
    pub remaining: usize,
}

/// Persisted cycle state for one namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleState {
    pub total: usize,
    pub remaining: Vec<u32>,
    pub cycle: i64,
}

impl CycleState {
    /// State for a namespace that has never been sampled
    fn empty() -> Self {
        Self {
            total: 0,
            remaining: Vec::new(),
            cycle: 0,
        }
    }

    /// True when `remaining` is a duplicate-free subset of `[0, total)`
    fn is_consistent(&self) -> bool {
        let mut seen = vec![false; self.total];
        self.remaining.iter().all(|&i| {
            let i = i as usize;
            i < self.total && !std::mem::replace(&mut seen[i], true)
        })
    }

    fn needs_reset(&self, pool_size: usize) -> bool {
        self.remaining.is_empty() || self.total != pool_size || !self.is_consistent()
    }

    fn reset(&mut self, pool_size: usize) {
        self.total = pool_size;
        self.remaining = (0..pool_size as u32).collect();
        self.cycle += 1;
    }

    /// Remove and return a uniformly chosen unused index.
    ///
    /// The last element is swapped into the chosen slot, so removal is O(1)
    /// and `remaining` loses its order.
    fn draw<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<usize> {
        if self.remaining.is_empty() {
            return None;
        }
        let r = rng.gen_range(0..self.remaining.len());
        Some(self.remaining.swap_remove(r) as usize)
    }
}

#[derive(Clone)]
pub struct BlockSampler {
    db: Database,
}

impl BlockSampler {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Pick the next block for `namespace` from the enabled pool.
    pub async fn pick(&self, namespace: &str) -> Result<Pick, SamplerError> {
        let mut tx = self.db.begin_immediate().await?;
        let outcome = pick_in_tx(&mut tx, namespace).await;
        self.db.finish(tx, outcome).await
    }

    /// Current cycle state, if the namespace has ever been sampled
    pub async fn cycle_state(&self, namespace: &str) -> Result<Option<CycleState>, SamplerError> {
        let row: Option<(i64, String, i64)> = sqlx::query_as(
            "SELECT total, remaining, cycle FROM sampler_state WHERE namespace = ?",
        )
        .bind(namespace)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.map(|(total, remaining, cycle)| CycleState {
            total: total.max(0) as usize,
            remaining: Stored::<Vec<u32>>::from_json(Some(&remaining))
                .value()
                .unwrap_or_default(),
            cycle,
        }))
    }
}

async fn pick_in_tx(conn: &mut SqliteConnection, namespace: &str) -> Result<Pick, SamplerError> {
    let pool = enabled_pool(conn).await?;
    if pool.is_empty() {
        return Err(SamplerError::NoBlocksAvailable);
    }

    let mut state = load_state(conn, namespace).await?;
    if state.needs_reset(pool.len()) {
        state.reset(pool.len());
    }

    let index = {
        let mut rng = rand::thread_rng();
        state.draw(&mut rng)
    };
    // A reset state always holds at least one index for a non-empty pool
    let index = index.ok_or(SamplerError::NoBlocksAvailable)?;

    let remaining = serde_json::to_string(&state.remaining)
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    sqlx::query(
        r#"
        INSERT INTO sampler_state (namespace, total, remaining, cycle, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (namespace) DO UPDATE SET
            total = excluded.total,
            remaining = excluded.remaining,
            cycle = excluded.cycle,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(namespace)
    .bind(state.total as i64)
    .bind(remaining)
    .bind(state.cycle)
    .bind(now_ms())
    .execute(&mut *conn)
    .await?;

    Ok(Pick {
        block: pool[index].clone(),
        index,
        cycle: state.cycle,
        remaining: state.remaining.len(),
    })
}

async fn load_state(conn: &mut SqliteConnection, namespace: &str) -> Result<CycleState, sqlx::Error> {
    let row: Option<(i64, Option<String>, i64)> = sqlx::query_as(
        "SELECT total, remaining, cycle FROM sampler_state WHERE namespace = ?",
    )
    .bind(namespace)
    .fetch_optional(&mut *conn)
    .await?;

    let Some((total, raw, cycle)) = row else {
        return Ok(CycleState::empty());
    };

    let remaining = match Stored::<Vec<u32>>::from_json(raw.as_deref()) {
        Stored::Value(v) => v,
        Stored::Absent => Vec::new(),
        Stored::Corrupt(reason) => {
            warn!(namespace, "Sampler state unreadable, starting a new cycle: {}", reason);
            Vec::new()
        }
    };

    Ok(CycleState {
        total: total.max(0) as usize,
        remaining,
        cycle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_db;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    async fn seeded(blocks: &str) -> (Database, tempfile::TempDir) {
        let (db, dir) = temp_db().await;
        let seed = dir.path().join("blocks.txt");
        std::fs::write(&seed, blocks).unwrap();
        db.seed_blocks_if_empty(&seed).await.unwrap();
        (db, dir)
    }

    #[test]
    fn draw_exhausts_without_repeats() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut state = CycleState::empty();
        state.reset(5);
        assert_eq!(state.cycle, 1);

        let mut seen = HashSet::new();
        while let Some(i) = state.draw(&mut rng) {
            assert!(i < 5);
            assert!(seen.insert(i), "index {} drawn twice", i);
        }
        assert_eq!(seen.len(), 5);
        assert!(state.needs_reset(5));
    }

    #[test]
    fn inconsistent_state_forces_reset() {
        let dupes = CycleState {
            total: 3,
            remaining: vec![1, 1],
            cycle: 4,
        };
        assert!(dupes.needs_reset(3));

        let out_of_range = CycleState {
            total: 3,
            remaining: vec![0, 3],
            cycle: 4,
        };
        assert!(out_of_range.needs_reset(3));

        let resized = CycleState {
            total: 3,
            remaining: vec![0, 2],
            cycle: 4,
        };
        assert!(resized.needs_reset(4));
        assert!(!resized.needs_reset(3));
    }

    #[tokio::test]
    async fn two_block_pool_cycles() {
        let (db, _dir) = seeded("10.0.0.0/24\n10.0.1.0/24\n").await;
        let sampler = BlockSampler::new(db);

        let a = sampler.pick("default").await.unwrap();
        let b = sampler.pick("default").await.unwrap();
        assert_eq!((a.cycle, b.cycle), (1, 1));
        let firsts: HashSet<_> = [a.block.cidr.clone(), b.block.cidr.clone()].into();
        assert_eq!(firsts.len(), 2);
        assert_eq!(b.remaining, 0);

        let c = sampler.pick("default").await.unwrap();
        assert_eq!(c.cycle, 2);
        assert!(firsts.contains(&c.block.cidr));
    }

    #[tokio::test]
    async fn k_picks_are_distinct_then_cycle_advances() {
        let blocks: String = (0..7).map(|i| format!("10.0.{}.0/24\n", i)).collect();
        let (db, _dir) = seeded(&blocks).await;
        let sampler = BlockSampler::new(db);

        let mut indices = HashSet::new();
        for _ in 0..7 {
            let pick = sampler.pick("ns").await.unwrap();
            assert_eq!(pick.cycle, 1);
            assert!(indices.insert(pick.index));
        }
        assert_eq!(sampler.pick("ns").await.unwrap().cycle, 2);
    }

    #[tokio::test]
    async fn concurrent_pickers_never_share_an_index() {
        let blocks: String = (0..12).map(|i| format!("10.1.{}.0/24\n", i)).collect();
        let (db, _dir) = seeded(&blocks).await;
        let sampler = BlockSampler::new(db);

        let handles: Vec<_> = (0..12)
            .map(|_| {
                let sampler = sampler.clone();
                tokio::spawn(async move { sampler.pick("shared").await.unwrap() })
            })
            .collect();

        let mut indices = HashSet::new();
        for handle in handles {
            let pick = handle.await.unwrap();
            assert_eq!(pick.cycle, 1);
            assert!(indices.insert(pick.index));
        }
        assert_eq!(indices.len(), 12);
    }

    #[tokio::test]
    async fn pool_resize_starts_new_cycle() {
        let (db, _dir) = seeded("10.0.0.0/24\n10.0.1.0/24\n10.0.2.0/24\n").await;
        let sampler = BlockSampler::new(db.clone());

        sampler.pick("default").await.unwrap();
        db.set_block_enabled("10.0.2.0/24", false).await.unwrap();

        let pick = sampler.pick("default").await.unwrap();
        assert_eq!(pick.cycle, 2);
        assert_ne!(pick.block.cidr, "10.0.2.0/24");
        let state = sampler.cycle_state("default").await.unwrap().unwrap();
        assert_eq!(state.total, 2);
        assert_eq!(state.remaining.len(), 1);
    }

    #[tokio::test]
    async fn namespaces_are_independent() {
        let (db, _dir) = seeded("10.0.0.0/24\n10.0.1.0/24\n").await;
        let sampler = BlockSampler::new(db);

        sampler.pick("a").await.unwrap();
        sampler.pick("a").await.unwrap();
        assert_eq!(sampler.pick("b").await.unwrap().cycle, 1);
        assert_eq!(sampler.pick("a").await.unwrap().cycle, 2);
    }

    #[tokio::test]
    async fn corrupt_state_resets_instead_of_failing() {
        let (db, _dir) = seeded("10.0.0.0/24\n10.0.1.0/24\n").await;
        sqlx::query(
            "INSERT INTO sampler_state (namespace, total, remaining, cycle, updated_at) VALUES ('default', 2, '[0,', 3, 0)",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let pick = BlockSampler::new(db).pick("default").await.unwrap();
        assert_eq!(pick.cycle, 4);
        assert_eq!(pick.remaining, 1);
    }

    #[tokio::test]
    async fn empty_pool_is_reported() {
        let (db, _dir) = temp_db().await;
        let err = BlockSampler::new(db).pick("default").await.unwrap_err();
        assert!(matches!(err, SamplerError::NoBlocksAvailable));
    }
}
