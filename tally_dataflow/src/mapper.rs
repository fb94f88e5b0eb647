//! The map transform service.

use std::fmt::Debug;
use std::sync::Arc;

use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use tally_dedup::DupFilter;
use tally_store::PartitionedStore;
use tally_types::{kturi, tkuri, Doc, StoreError};

use crate::sink::SinkDispatch;
use crate::{
    check_duplicates, link_field, location, Body, Created, DataflowError, Environment, MapFn,
    Service, ServiceConfig,
};

/// A dataflow service whose outputs are a pure function of one input.
///
/// `play` validates, authorizes and duplicate-checks the input, durably
/// logs it, and answers with its location. Output production — running the
/// map function, forwarding each output to the sink and persisting it —
/// happens on a tracked background task; its failures are logged and
/// repaired by replay, never surfaced to the caller.
pub struct Mapper {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServiceConfig,
    map_fn: Arc<dyn MapFn>,
    input_db: Arc<PartitionedStore>,
    output_db: Arc<PartitionedStore>,
    dedup: Option<DupFilter>,
    sink: Option<SinkDispatch>,
    env: Environment,
    tasks: TaskTracker,
}

impl Debug for Mapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapper")
            .field("input", &self.inner.config.input.db_name)
            .field("output", &self.inner.config.output.db_name)
            .finish()
    }
}

impl Mapper {
    pub fn new(
        config: ServiceConfig,
        map_fn: Arc<dyn MapFn>,
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
        Self {
            inner: Arc::new(Inner {
                config,
                map_fn,
                input_db,
                output_db,
                dedup,
                sink,
                env,
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

        check_duplicates(inner.dedup.as_ref(), &inner.output_db, &oids).await?;

        // Log the input; this is the durability point of the call. An
        // already-logged input is a duplicate submission.
        let mut ilog = Doc::dbify(iid.clone(), &body);
        ilog.processed = Some(inner.env.clock.now());
        match inner.input_db.put(&ilog).await {
            Ok(_) => {}
            Err(StoreError::Conflict { .. }) => {
                return Err(DataflowError::Duplicate { id: iid });
            }
            Err(err) => return Err(err.into()),
        }
        debug!(id = %iid, "logged input");

        let task_inner = Arc::clone(inner);
        inner.tasks.spawn(async move {
            if let Err(err) = task_inner.produce(&ilog, &oids).await {
                warn!(input = %ilog.id, %err, "output production failed; replay will repair");
            }
        });

        Ok(Created {
            location: location(&inner.config.input.route, &iid),
            id: iid,
        })
    }

    /// Wait for all in-flight output production to settle.
    pub async fn drain(&self) {
        let tasks = &self.inner.tasks;
        tasks.close();
        tasks.wait().await;
        tasks.reopen();
    }
}

impl Inner {
    /// Run the map function and push each output downstream, then into the
    /// output database. The sink sees an output before it is logged:
    /// an output document's existence is the replay marker for "fully
    /// processed", so persisting first would let a crash in between lose
    /// the forward forever.
    async fn produce(&self, ilog: &Doc, oids: &[String]) -> Result<(), DataflowError> {
        let odocs = self.map_fn.map(ilog).await?;
        if odocs.len() != oids.len() {
            return Err(DataflowError::Transform(format!(
                "map produced {} outputs where {} were projected for {}",
                odocs.len(),
                oids.len(),
                ilog.id
            )));
        }

        let link = link_field(&self.config.input.doc_type);
        for (obody, oid) in odocs.iter().zip(oids) {
            let mut olog = Doc::dbify(oid.clone(), obody)
                .with_field(link.clone(), ilog.id.clone());
            olog.processed = Some(self.env.clock.now());

            if let Some(sink) = &self.sink {
                sink.forward(&olog)
                    .await
                    .map_err(|e| DataflowError::Transform(e.to_string()))?;
                debug!(id = %oid, "forwarded output to sink");
            }

            match self.output_db.put(&olog).await {
                Ok(_) => debug!(id = %oid, "logged output"),
                // Another process already produced this output.
                Err(StoreError::Conflict { .. }) => {
                    debug!(id = %oid, "output already logged");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

/// Ids of the outputs an input will produce, projected before mapping so
/// duplicates are detected without running the transform.
pub(crate) fn projected_output_ids(config: &ServiceConfig, body: &Body, itime: &str) -> Vec<String> {
    let okeys = (config.output.keys)(body);
    let otimes = (config.output.times)(body, itime);
    okeys
        .into_iter()
        .zip(otimes)
        .map(|(k, t)| kturi(&k, &t))
        .collect()
}

#[async_trait::async_trait]
impl Service for Mapper {
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
        self.inner.produce(&input, &oids).await
    }
}
