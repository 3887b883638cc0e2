//! Parallel worker redistribution for hashed aggregation.
//!
//! Each of N workers routes every input row to a destination worker by the
//! hash of a single grouping key column. Rows for a peer go through a
//! bounded lock-free ring buffer, overflowing into a spool file when the
//! ring is full. Once a worker's local input ends it publishes its spools,
//! then consumes whatever its peers routed to it. Workers advance through
//! `None -> Init -> ProduceDone -> ConsumeDone`; observing an `Error` peer
//! aborts.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use quern_error::{QuernError, Result};
use quern_row::{DataType, Row, ScalarValue};

use crate::config::Interrupts;
use crate::execution::operators::util::hash::hash_scalars;
use crate::io::SpoolFile;

const DEFAULT_RING_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    None,
    Init,
    ProduceDone,
    ConsumeDone,
    Error,
}

impl WorkerStatus {
    fn from_u8(v: u8) -> WorkerStatus {
        match v {
            0 => WorkerStatus::None,
            1 => WorkerStatus::Init,
            2 => WorkerStatus::ProduceDone,
            3 => WorkerStatus::ConsumeDone,
            _ => WorkerStatus::Error,
        }
    }
}

/// Shared redistribution state for one aggregate node across N workers.
pub struct RedistributeState {
    nworkers: usize,
    status: Vec<AtomicU8>,
    /// One ring per (producer, consumer) pair; index = from * n + to.
    rings: Vec<ArrayQueue<Vec<u8>>>,
    /// Overflow spools, written by the producer and handed to the consumer
    /// after ProduceDone.
    spools: Vec<Mutex<Option<SpoolFile>>>,
    /// Rows routed per (producer, consumer) pair, ring and spool combined.
    sent: Vec<AtomicU64>,
}

impl std::fmt::Debug for RedistributeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedistributeState")
            .field("nworkers", &self.nworkers)
            .finish_non_exhaustive()
    }
}

impl RedistributeState {
    pub fn new(nworkers: usize) -> Arc<Self> {
        Self::with_ring_capacity(nworkers, DEFAULT_RING_CAPACITY)
    }

    pub fn with_ring_capacity(nworkers: usize, ring_capacity: usize) -> Arc<Self> {
        let pairs = nworkers * nworkers;
        Arc::new(RedistributeState {
            nworkers,
            status: (0..nworkers).map(|_| AtomicU8::new(0)).collect(),
            rings: (0..pairs).map(|_| ArrayQueue::new(ring_capacity)).collect(),
            spools: (0..pairs).map(|_| Mutex::new(None)).collect(),
            sent: (0..pairs).map(|_| AtomicU64::new(0)).collect(),
        })
    }

    pub fn nworkers(&self) -> usize {
        self.nworkers
    }

    pub fn status_of(&self, worker: usize) -> WorkerStatus {
        WorkerStatus::from_u8(self.status[worker].load(Ordering::SeqCst))
    }

    fn set_status(&self, worker: usize, status: WorkerStatus) {
        self.status[worker].store(status as u8, Ordering::SeqCst);
    }

    fn pair(&self, from: usize, to: usize) -> usize {
        from * self.nworkers + to
    }
}

/// Destination worker for a redistribution key value.
///
/// Null keys go to worker 0. Integer keys place by `value mod 2^N mod N`,
/// which is not a uniform hash.
/// TODO: revisit the integer placement; low-cardinality keys concentrate
/// on few workers.
pub fn redistribute_worker(value: &ScalarValue, nworkers: usize) -> usize {
    match value {
        ScalarValue::Null => 0,
        ScalarValue::Boolean(v) => mod_placement(*v as i64, nworkers),
        ScalarValue::Int32(v) => mod_placement(*v as i64, nworkers),
        ScalarValue::Int64(v) => mod_placement(*v, nworkers),
        other => hash_scalars(std::slice::from_ref(other)) as usize % nworkers,
    }
}

fn mod_placement(value: i64, nworkers: usize) -> usize {
    let modulus = 1u64 << nworkers.min(63);
    (((value as u64) % modulus) % nworkers as u64) as usize
}

/// One worker's handle onto the shared redistribution state.
#[derive(Debug)]
pub struct WorkerLink {
    state: Arc<RedistributeState>,
    worker_idx: usize,
    interrupts: Interrupts,
    key: Option<(usize, DataType)>,

    /// Consumer-side spools taken from the shared state, one per producer.
    open_spools: Vec<Option<SpoolFile>>,
    spool_done: Vec<bool>,
    received: Vec<u64>,
}

impl WorkerLink {
    pub fn new(state: Arc<RedistributeState>, worker_idx: usize, interrupts: Interrupts) -> Self {
        let n = state.nworkers();
        state.set_status(worker_idx, WorkerStatus::Init);
        WorkerLink {
            state,
            worker_idx,
            interrupts,
            key: None,
            open_spools: (0..n).map(|_| None).collect(),
            spool_done: vec![false; n],
            received: vec![0; n],
        }
    }

    pub fn worker_idx(&self) -> usize {
        self.worker_idx
    }

    /// Choose the redistribution key: the first group-by column in plan
    /// order. Called by the executor before consuming input.
    pub fn bind_key(&mut self, column: usize, datatype: DataType) {
        self.key = Some((column, datatype));
    }

    /// Route one row. Returns true when the row stays on this worker.
    pub fn route(&self, row: &Row) -> Result<bool> {
        let (column, _) = self
            .key
            .ok_or_else(|| QuernError::internal("redistribution key not bound"))?;
        let value = row.column(column)?;
        let dest = redistribute_worker(value, self.state.nworkers());
        if dest == self.worker_idx {
            return Ok(true);
        }

        let pair = self.state.pair(self.worker_idx, dest);
        let mut bytes = Vec::new();
        row.encode_into(&mut bytes);

        if let Err(bytes) = self.state.rings[pair].push(bytes) {
            // Ring full: spill to the overflow spool for this destination.
            let mut guard = self.state.spools[pair].lock();
            if guard.is_none() {
                *guard = Some(SpoolFile::create()?);
            }
            let spool = guard
                .as_mut()
                .ok_or_else(|| QuernError::internal("overflow spool vanished under lock"))?;
            spool.write_all(&(bytes.len() as u32).to_le_bytes())?;
            spool.write_all(&bytes)?;
            spool.note_record_written();
        }
        self.state.sent[pair].fetch_add(1, Ordering::SeqCst);
        Ok(false)
    }

    /// Flush overflow spools for reading and advertise that production is
    /// done.
    pub fn finish_produce(&mut self) -> Result<()> {
        for dest in 0..self.state.nworkers() {
            if dest == self.worker_idx {
                continue;
            }
            let pair = self.state.pair(self.worker_idx, dest);
            let mut spool = self.state.spools[pair].lock();
            if let Some(spool) = spool.as_mut() {
                spool.rewind()?;
            }
        }
        self.state.set_status(self.worker_idx, WorkerStatus::ProduceDone);
        Ok(())
    }

    /// Pull the next row routed to this worker by any peer. Returns None
    /// once every peer has finished producing and all rings and spools
    /// destined here are drained.
    pub fn consume_next(&mut self) -> Result<Option<Row>> {
        let n = self.state.nworkers();
        loop {
            self.interrupts.check()?;

            let mut producing_peers = false;
            for from in 0..n {
                if from == self.worker_idx {
                    continue;
                }
                let pair = self.state.pair(from, self.worker_idx);

                if let Some(bytes) = self.state.rings[pair].pop() {
                    self.received[from] += 1;
                    let (row, _) = Row::decode_from(&bytes)?;
                    return Ok(Some(row));
                }

                match self.state.status_of(from) {
                    WorkerStatus::Error => {
                        return Err(QuernError::ParallelPeerError(format!(
                            "worker {from} signalled an error during redistribution"
                        )))
                    }
                    WorkerStatus::ProduceDone | WorkerStatus::ConsumeDone => {
                        if self.spool_done[from] {
                            continue;
                        }
                        if self.open_spools[from].is_none() {
                            self.open_spools[from] = self.state.spools[pair].lock().take();
                            if self.open_spools[from].is_none() {
                                self.spool_done[from] = true;
                                continue;
                            }
                        }
                        if let Some(row) = self.read_spool_row(from)? {
                            self.received[from] += 1;
                            return Ok(Some(row));
                        }
                        self.spool_done[from] = true;
                    }
                    WorkerStatus::None | WorkerStatus::Init => {
                        producing_peers = true;
                    }
                }
            }

            if !producing_peers {
                let drained = (0..n).filter(|&f| f != self.worker_idx).all(|f| {
                    self.spool_done[f]
                        && self.state.rings[self.state.pair(f, self.worker_idx)].is_empty()
                });
                if drained {
                    self.verify_receipt()?;
                    return Ok(None);
                }
            }
            std::thread::yield_now();
        }
    }

    fn read_spool_row(&mut self, from: usize) -> Result<Option<Row>> {
        let spool = self.open_spools[from]
            .as_mut()
            .ok_or_else(|| QuernError::internal("reading a spool that was never opened"))?;

        let mut len_bytes = [0u8; 4];
        if !spool.read_exact_or_eof(&mut len_bytes)? {
            return Ok(None);
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut bytes = vec![0u8; len];
        spool.read_exact(&mut bytes)?;
        spool.note_record_read();
        let (row, _) = Row::decode_from(&bytes)?;
        Ok(Some(row))
    }

    /// Check that every row a peer routed here actually arrived.
    fn verify_receipt(&self) -> Result<()> {
        for from in 0..self.state.nworkers() {
            if from == self.worker_idx {
                continue;
            }
            let pair = self.state.pair(from, self.worker_idx);
            let sent = self.state.sent[pair].load(Ordering::SeqCst);
            if sent != self.received[from] {
                return Err(QuernError::internal(format!(
                    "worker {from} routed {sent} rows here but {} arrived",
                    self.received[from]
                )));
            }
        }
        Ok(())
    }

    pub fn finish_consume(&mut self) -> Result<()> {
        self.state.set_status(self.worker_idx, WorkerStatus::ConsumeDone);
        Ok(())
    }

    /// Signal failure to peers; they abort on observing it.
    pub fn mark_error(&self) {
        self.state.set_status(self.worker_idx, WorkerStatus::Error);
    }
}
