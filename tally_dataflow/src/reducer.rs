//! The reduce transform service and its group reduction machinery.
//!
//! Unlike a map, a reduction's output depends on the accumulated state of
//! its group (e.g. all usage of one organization this month), so at most
//! one reduction per group may run at a time. Inputs sharing a group key
//! are coalesced into batches by a per-group queue drained by a single
//! worker, and the worker holds the group's keyed mutex for the duration
//! of a batch. Unrelated groups proceed in parallel: throughput scales
//! with the number of distinct groups, not total document volume.
//!
//! The last accumulated output is answered by a three-tier read — an
//! in-memory cache, an epoch-0 cache document, then a bounded descending
//! range scan of the output database — and written back with the revision
//! obtained at read time, so a writer that somehow bypassed the group lock
//! is rejected by a conflict instead of silently overwritten.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::Arc;

use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use tally_dedup::DupFilter;
use tally_store::{AllDocs, PartitionedStore, RangeOptions};
use tally_types::{id, kturi, tkuri, Doc, StoreError, TimeProvider};

use crate::lock::KeyedMutex;
use crate::mapper::projected_output_ids;
use crate::sink::SinkDispatch;
use crate::{
    check_duplicates, link_field, location, Body, Created, DataflowError, Environment, ReduceFn,
    Service, ServiceConfig,
};

/// Inputs drained per reduction, bounding reduce-function latency.
const MAX_BATCH: usize = 64;

/// How far back the fallback accumulation scan looks: the current plus the
/// previous monthly epoch.
const ACCUM_SCAN_MILLIS: i64 = 62 * 86_400_000;

/// A dataflow service reducing inputs against a per-group accumulation.
pub struct Reducer {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServiceConfig,
    reduce_fn: Arc<dyn ReduceFn>,
    input_db: Arc<PartitionedStore>,
    output_db: Arc<PartitionedStore>,
    dedup: Option<DupFilter>,
    sink: Option<SinkDispatch>,
    env: Environment,
    groups: parking_lot::Mutex<HashMap<String, GroupState>>,
    locks: KeyedMutex,
    cache: AccumCache,
    tasks: TaskTracker,
}

#[derive(Debug, Default)]
struct GroupState {
    queue: VecDeque<Pending>,
    running: bool,
}

/// An accepted input waiting for its group's worker.
#[derive(Debug, Clone)]
struct Pending {
    ilog: Doc,
    oids: Vec<String>,
}

impl Debug for Reducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reducer")
            .field("input", &self.inner.config.input.db_name)
            .field("output", &self.inner.config.output.db_name)
            .finish()
    }
}

impl Reducer {
    pub fn new(
        config: ServiceConfig,
        reduce_fn: Arc<dyn ReduceFn>,
        input_db: Arc<PartitionedStore>,
        output_db: Arc<PartitionedStore>,
        env: Environment,
    ) -> Self {
        let dedup = config
            .dedup
            .map(|cfg| DupFilter::new(cfg, Arc::clone(&env.clock)));
        let sink = config
            .sink
            .clone()
            .map(|cfg| SinkDispatch::new(cfg, Arc::clone(&env.sink_client)));
        let cache = AccumCache::new(Arc::clone(&output_db), Arc::clone(&env.clock));
        Self {
            inner: Arc::new(Inner {
                config,
                reduce_fn,
                input_db,
                output_db,
                dedup,
                sink,
                env,
                groups: Default::default(),
                locks: KeyedMutex::new(),
                cache,
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Accept one input document.
    pub async fn play(&self, auth: Option<&str>, body: Body) -> Result<Created, DataflowError> {
        let inner = &self.inner;

        if let Some(schema) = &inner.config.input.schema {
            schema.validate(&body)?;
        }
        if let Some(wscope) = &inner.config.input.wscope {
            inner.env.authorizer.authorize(auth, &wscope(&body))?;
        }

        let ikey = (inner.config.input.key)(&body);
        let itime = (inner.config.input.time)(&body);
        let iid = tkuri(&ikey, &itime);
        let oids = projected_output_ids(&inner.config, &body, &itime);
        let group = match &inner.config.input.group {
            Some(group) => group(&body),
            None => ikey,
        };

        check_duplicates(inner.dedup.as_ref(), &inner.output_db, &oids).await?;

        let mut ilog = Doc::dbify(iid.clone(), &body);
        ilog.processed = Some(inner.env.clock.now());
        match inner.input_db.put(&ilog).await {
            Ok(_) => {}
            Err(StoreError::Conflict { .. }) => {
                return Err(DataflowError::Duplicate { id: iid });
            }
            Err(err) => return Err(err.into()),
        }
        debug!(id = %iid, %group, "logged input");

        self.submit(group, Pending { ilog, oids });

        Ok(Created {
            location: location(&inner.config.input.route, &iid),
            id: iid,
        })
    }

    /// Queue a pending input for its group, starting the group's worker if
    /// none is draining the queue.
    fn submit(&self, group: String, pending: Pending) {
        let inner = &self.inner;
        let start_worker = {
            let mut groups = inner.groups.lock();
            let state = groups.entry(group.clone()).or_default();
            state.queue.push_back(pending);
            if state.running {
                false
            } else {
                state.running = true;
                true
            }
        };

        if start_worker {
            let inner = Arc::clone(inner);
            self.inner.tasks.spawn(async move {
                inner.run_group(group).await;
            });
        }
    }

    /// Wait for all queued reductions to settle.
    pub async fn drain(&self) {
        let tasks = &self.inner.tasks;
        tasks.close();
        tasks.wait().await;
        tasks.reopen();
    }
}

impl Inner {
    async fn run_group(&self, group: String) {
        loop {
            let batch: Vec<Pending> = {
                let mut groups = self.groups.lock();
                let state = groups.get_mut(&group).expect("running group has state");
                if state.queue.is_empty() {
                    groups.remove(&group);
                    break;
                }
                let n = state.queue.len().min(MAX_BATCH);
                state.queue.drain(..n).collect()
            };

            // Serialize with any other holder of this group (e.g. replay);
            // the guard releases on drop even when reduction fails.
            let _guard = self.locks.lock(&group).await;
            if let Err(err) = self.reduce_batch(&batch).await {
                warn!(%group, %err, "group reduction failed; replay will repair");
            }
        }
    }

    async fn reduce_batch(&self, batch: &[Pending]) -> Result<(), DataflowError> {
        let okey = batch[0]
            .oids
            .first()
            .and_then(|oid| id::key(oid))
            .ok_or_else(|| {
                DataflowError::Transform(format!("input {} projects no output", batch[0].ilog.id))
            })?
            .to_owned();

        let accumulated = self.cache.read(&okey).await?;
        let inputs: Vec<Doc> = batch.iter().map(|p| p.ilog.clone()).collect();
        let results = self.reduce_fn.reduce(accumulated.as_ref(), &inputs).await?;
        if results.len() != batch.len() {
            return Err(DataflowError::Transform(format!(
                "reduce returned {} result sets for a batch of {}",
                results.len(),
                batch.len()
            )));
        }

        let link = link_field(&self.config.input.doc_type);
        let mut last: Option<Doc> = None;
        for (pending, outs) in batch.iter().zip(results) {
            if outs.len() != pending.oids.len() {
                return Err(DataflowError::Transform(format!(
                    "reduce produced {} outputs where {} were projected for {}",
                    outs.len(),
                    pending.oids.len(),
                    pending.ilog.id
                )));
            }
            for (obody, oid) in outs.iter().zip(&pending.oids) {
                let mut olog = Doc::dbify(oid.clone(), obody)
                    .with_field(link.clone(), pending.ilog.id.clone());
                olog.processed = Some(self.env.clock.now());

                if let Some(sink) = &self.sink {
                    sink.forward(&olog)
                        .await
                        .map_err(|e| DataflowError::Transform(e.to_string()))?;
                    debug!(id = %oid, "forwarded output to sink");
                }

                match self.output_db.put(&olog).await {
                    Ok(_) => debug!(id = %oid, "logged output"),
                    Err(StoreError::Conflict { .. }) => {
                        debug!(id = %oid, "output already logged");
                    }
                    Err(err) => return Err(err.into()),
                }
                last = Some(olog);
            }
        }

        if let Some(last) = last {
            self.cache
                .write_back(&okey, &last, accumulated.as_ref())
                .await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Service for Reducer {
    fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    fn input_db(&self) -> &Arc<PartitionedStore> {
        &self.inner.input_db
    }

    fn output_db(&self) -> &Arc<PartitionedStore> {
        &self.inner.output_db
    }

    async fn replay_input(&self, input: Doc) -> Result<(), DataflowError> {
        let body = match input.undbify() {
            serde_json::Value::Object(m) => m,
            _ => return Err(DataflowError::Transform("input is not an object".into())),
        };
        let itime = input
            .time()
            .ok_or_else(|| DataflowError::Transform(format!("input {} has no time", input.id)))?
            .to_owned();
        let oids = projected_output_ids(&self.inner.config, &body, &itime);
        let group = match &self.inner.config.input.group {
            Some(group) => group(&body),
            None => (self.inner.config.input.key)(&body),
        };

        // Take the group lock so replay serializes with live workers.
        let _guard = self.inner.locks.lock(&group).await;
        self.inner
            .reduce_batch(&[Pending { ilog: input, oids }])
            .await
    }
}

/// The accumulation cache: last-known output per output key.
struct AccumCache {
    mem: parking_lot::Mutex<HashMap<String, Doc>>,
    db: Arc<PartitionedStore>,
    clock: Arc<dyn TimeProvider>,
}

impl AccumCache {
    fn new(db: Arc<PartitionedStore>, clock: Arc<dyn TimeProvider>) -> Self {
        Self {
            mem: Default::default(),
            db,
            clock,
        }
    }

    fn cache_id(okey: &str) -> String {
        // The synthetic epoch-0 slot of the output key.
        kturi(okey, "0")
    }

    /// Read the last accumulated output for an output key: memory, then
    /// the epoch-0 cache document, then a bounded descending scan.
    async fn read(&self, okey: &str) -> Result<Option<Doc>, DataflowError> {
        if let Some(doc) = self.mem.lock().get(okey) {
            return Ok(Some(doc.clone()));
        }

        let cache_id = Self::cache_id(okey);
        if let Some(doc) = self.db.get(&cache_id).await? {
            self.mem.lock().insert(okey.to_owned(), doc.clone());
            return Ok(Some(doc));
        }

        // No cache document; look for the most recent output itself. The
        // scan is bounded to the epochs a live accumulation can span.
        let now = self.clock.now();
        let floor = (now - ACCUM_SCAN_MILLIS).max(1);
        let scan = RangeOptions::new(
            format!("{}ZZZ", kturi(okey, &now.to_string())),
            kturi(okey, &floor.to_string()),
        )
        .descending()
        .limit(1);
        let rows = self.db.all_docs(AllDocs::Range(scan)).await?;
        debug!(%okey, found = !rows.is_empty(), "accumulation fallback scan");

        Ok(rows.into_iter().next().and_then(|row| row.doc).map(|doc| {
            // Re-home the output under the cache id; the first write-back
            // creates the cache document.
            Doc {
                id: cache_id,
                rev: None,
                processed: doc.processed,
                fields: doc.fields,
            }
        }))
    }

    /// Write the new accumulated state back under the revision observed at
    /// read time. A conflict means a concurrent writer bypassed the group
    /// lock; the write is dropped and the stale memory entry evicted.
    async fn write_back(
        &self,
        okey: &str,
        last: &Doc,
        previous: Option<&Doc>,
    ) -> Result<(), DataflowError> {
        let mut cdoc = Doc {
            id: Self::cache_id(okey),
            rev: previous.and_then(|p| p.rev.clone()),
            processed: last.processed,
            fields: last.fields.clone(),
        };
        match self.db.put(&cdoc).await {
            Ok(result) => {
                cdoc.rev = Some(result.rev);
                self.mem.lock().insert(okey.to_owned(), cdoc);
                Ok(())
            }
            Err(StoreError::Conflict { .. }) => {
                warn!(%okey, "accumulation cache write conflicted; entry evicted");
                self.mem.lock().remove(okey);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Debug for AccumCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccumCache")
            .field("entries", &self.mem.lock().len())
            .finish()
    }
}
