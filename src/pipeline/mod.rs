//! Run ingestion pipeline
//!
//! One invocation is one run: pick `blocks_per_run` blocks in turn, run the
//! producer against each, and fold its output into the endpoint tables.
//! Producer trouble is confined to its block ([`BlockError`]); only an empty
//! pool or a failing sampler/store ends the run early ([`RunAbortError`]).

mod parse;
mod producer;

pub use parse::extract_endpoint;
pub use producer::exit_parts;

use anyhow::{anyhow, Result};
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

use crate::config::{PipelineConfig, ProducerConfig};
use crate::db::{now_ms, Database, InitiatedBy, Observation, RunRecord, RunStatus, SeedOutcome};
use crate::sampler::{BlockSampler, SamplerError};
use producer::{BoundedLines, ProducerLine};

/// Recoverable failure confined to one block
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("failed to spawn producer: {0}")]
    Spawn(#[source] io::Error),
    #[error("producer I/O error: {0}")]
    Io(#[source] io::Error),
    #[error("producer exited with code {0}")]
    Exited(i32),
    #[error("producer terminated by signal {0}")]
    Signaled(i32),
    #[error("producer exceeded its {0}s time limit")]
    TimedOut(u64),
}

/// Failure that ends the whole run
#[derive(Debug, Error)]
pub enum RunAbortError {
    #[error("address pool is empty")]
    EmptyPool,
    #[error("block sampler failed: {0}")]
    Sampler(#[from] SamplerError),
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BlockReport {
    pub lines: u64,
    pub accepted: u64,
    pub dropped: u64,
    pub store_failures: usize,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub run: RunRecord,
    pub abort: Option<RunAbortError>,
}

pub struct Pipeline {
    db: Database,
    sampler: BlockSampler,
    settings: PipelineConfig,
    producer: ProducerConfig,
}

impl Pipeline {
    pub fn new(db: Database, settings: PipelineConfig, producer: ProducerConfig) -> Self {
        let sampler = BlockSampler::new(db.clone());
        Self {
            db,
            sampler,
            settings,
            producer,
        }
    }

    /// Execute one run end to end and return its finalized record.
    ///
    /// Errors only when the run record itself cannot be created or closed.
    pub async fn execute(&self, initiated_by: InitiatedBy) -> Result<RunOutcome> {
        let run = self.db.create_run(initiated_by).await?;
        info!(
            target: "oplog",
            run_id = %run.run_id,
            initiated_by = %initiated_by,
            blocks = self.settings.blocks_per_run,
            "Run started"
        );

        let outcome = self.scan_blocks(&run.run_id).await;
        let status = match &outcome {
            Ok(()) => RunStatus::Completed,
            Err(e) => {
                error!(target: "oplog", run_id = %run.run_id, "Run aborted: {}", e);
                RunStatus::Failed
            }
        };

        let record = self
            .db
            .finalize_run(&run.run_id, status)
            .await?
            .ok_or_else(|| anyhow!("run {} was already finalized", run.run_id))?;
        info!(
            target: "oplog",
            run_id = %record.run_id,
            status = record.status.as_str(),
            blocks_scanned = record.blocks_scanned,
            ips_found = record.ips_found,
            "Run finished"
        );

        Ok(RunOutcome {
            run: record,
            abort: outcome.err(),
        })
    }

    async fn preflight(&self) -> Result<(), RunAbortError> {
        match self
            .db
            .seed_blocks_if_empty(Path::new(&self.settings.seed_file))
            .await
        {
            Ok(SeedOutcome::Seeded { inserted, rejected }) => {
                info!(target: "oplog", inserted, rejected, "Seeded block pool from {}", self.settings.seed_file);
            }
            Ok(_) => {}
            Err(e) => warn!("Could not seed block pool: {:#}", e),
        }

        if self.db.count_enabled_blocks().await? == 0 {
            return Err(RunAbortError::EmptyPool);
        }
        Ok(())
    }

    async fn scan_blocks(&self, run_id: &str) -> Result<(), RunAbortError> {
        self.preflight().await?;

        let total = self.settings.blocks_per_run;
        for n in 1..=total {
            let pick = self.sampler.pick(&self.settings.namespace).await?;
            let block = pick.block.cidr.as_str();
            info!(
                target: "oplog",
                run_id,
                block,
                index = pick.index,
                cycle = pick.cycle,
                "Block picked ({}/{})",
                n,
                total
            );

            self.db
                .record_run_block(
                    run_id,
                    block,
                    now_ms(),
                    pick.block.source_file.as_deref(),
                    &self.settings.namespace,
                )
                .await?;

            match self.scan_block(run_id, block).await {
                Ok(report) => info!(
                    target: "oplog",
                    run_id,
                    block,
                    lines = report.lines,
                    accepted = report.accepted,
                    dropped = report.dropped,
                    "Block done"
                ),
                Err(e) => warn!(target: "oplog", run_id, block, "Block failed, continuing: {}", e),
            }

            if let Err(e) = self.db.increment_blocks_scanned(run_id).await {
                warn!(run_id, block, "Could not count scanned block: {}", e);
            }
        }

        Ok(())
    }

    /// Run the producer against one block and ingest everything it prints.
    ///
    /// Whatever was ingested before a failure stays stored.
    async fn scan_block(&self, run_id: &str, block: &str) -> Result<BlockReport, BlockError> {
        let mut child = producer::spawn(&self.producer, block).map_err(BlockError::Spawn)?;
        let stdout = child.stdout.take();
        let mirror = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(producer::mirror_stderr(stderr, block.to_string())));

        let mut sink = EndpointSink::new(&self.db, run_id, block, &self.producer.source, self.settings.flush_batch);
        let mut report = BlockReport::default();

        let streamed = async {
            if let Some(stdout) = stdout {
                self.ingest(stdout, &mut sink, &mut report).await?;
            }
            child.wait().await.map_err(BlockError::Io)
        };

        let exited = match self.producer.timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), streamed)
                .await
                .unwrap_or(Err(BlockError::TimedOut(secs))),
            None => streamed.await,
        };

        if exited.is_err() {
            // Stream error or timeout: make sure the producer is gone
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        sink.flush().await;
        report.store_failures = sink.failures;

        if let Some(handle) = mirror {
            if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
                debug!("Producer stderr for {} still open after exit", block);
            }
        }

        let status = exited?;
        match exit_parts(&status) {
            _ if status.success() => Ok(report),
            (_, Some(signal)) => Err(BlockError::Signaled(signal)),
            (code, None) => Err(BlockError::Exited(code.unwrap_or(-1))),
        }
    }

    async fn ingest<R>(
        &self,
        stdout: R,
        sink: &mut EndpointSink<'_>,
        report: &mut BlockReport,
    ) -> Result<(), BlockError>
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = FramedRead::new(stdout, BoundedLines::new(self.settings.max_line_len));

        while let Some(line) = lines.next().await {
            report.lines += 1;
            let endpoint = match line.map_err(BlockError::Io)? {
                ProducerLine::Text(line) => extract_endpoint(&line, self.producer.port),
                ProducerLine::TooLong | ProducerLine::NotUtf8 => None,
            };
            match endpoint {
                Some((ip, port)) => {
                    report.accepted += 1;
                    sink.push(Observation {
                        ip,
                        port,
                        seen_at: now_ms(),
                    })
                    .await;
                }
                None => report.dropped += 1,
            }
        }

        Ok(())
    }
}

/// Buffers observations for one block and writes them in arrival order
struct EndpointSink<'a> {
    db: &'a Database,
    run_id: &'a str,
    block: &'a str,
    source: &'a str,
    batch: usize,
    pending: Vec<Observation>,
    failures: usize,
}

impl<'a> EndpointSink<'a> {
    fn new(db: &'a Database, run_id: &'a str, block: &'a str, source: &'a str, batch: usize) -> Self {
        let batch = batch.max(1);
        Self {
            db,
            run_id,
            block,
            source,
            batch,
            pending: Vec::with_capacity(batch),
            failures: 0,
        }
    }

    async fn push(&mut self, observation: Observation) {
        self.pending.push(observation);
        if self.pending.len() >= self.batch {
            self.flush().await;
        }
    }

    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        match self
            .db
            .upsert_observations(self.run_id, self.block, self.source, &self.pending)
            .await
        {
            Ok(failed) => self.failures += failed,
            Err(e) => {
                warn!(
                    block = self.block,
                    "Failed to store {} endpoints: {}",
                    self.pending.len(),
                    e
                );
                self.failures += self.pending.len();
            }
        }
        self.pending.clear();
    }
}
