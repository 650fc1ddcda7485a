//! Partition actor: one cache instance behind a command queue.
//!
//! Activation replays the partition's journal into a fresh engine, then
//! starts the archiver on the live notification stream, so every mutation
//! served afterwards is journaled. All operations funnel through one mpsc
//! queue; the actor task is the only holder of the engine, so a partition
//! never processes two commands concurrently against its own state.
//!
//! Replication lives here too: a `Put` or `Remove` applies locally, then
//! fans out to the rest of the key's replica set without waiting; a `Get`
//! that misses locally consults the replicas in ring order and repairs
//! itself from the first hit. The replica-side twins (`PutReplica`,
//! `GetReplica`, `RemoveReplica`) are terminal (local only, no onward
//! forwarding), which is what stops repair storms and forwarding loops.

use crate::config::ClusterConfig;
use crate::transport::Router;
use crate::ClusterError;
use bytes::Bytes;
use kombu_engine::{CacheEngine, CacheValue, EngineConfig};
use kombu_events::{combine, Notification, NotificationHub};
use kombu_journal::{restore, Archiver};
use kombu_observe::{Meter, PartitionEvt, PartitionKind, VizEvent};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot};

const COMMAND_DEPTH: usize = 256;

enum Command {
    Put {
        key: String,
        flags: u64,
        expiry: Option<SystemTime>,
        data: Bytes,
        reply: oneshot::Sender<bool>,
    },
    PutReplica {
        key: String,
        flags: u64,
        expiry: Option<SystemTime>,
        data: Bytes,
        reply: oneshot::Sender<bool>,
    },
    Get {
        key: String,
        reply: oneshot::Sender<Option<CacheValue>>,
    },
    GetReplica {
        key: String,
        reply: oneshot::Sender<Option<CacheValue>>,
    },
    Remove {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    RemoveReplica {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    Watch {
        reply: oneshot::Sender<mpsc::Receiver<Notification>>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<(), ClusterError>>,
    },
}

/// Cloneable handle to a running partition actor.
#[derive(Clone)]
pub struct PartitionHandle {
    name: String,
    sender: mpsc::Sender<Command>,
}

impl PartitionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Primary write: unconditional local store, then replica fan-out.
    /// Returns the local engine's verdict; replica outcomes never affect it.
    pub async fn put(
        &self,
        key: String,
        flags: u64,
        expiry: Option<SystemTime>,
        data: Bytes,
    ) -> Result<bool, ClusterError> {
        self.request(|reply| Command::Put {
            key,
            flags,
            expiry,
            data,
            reply,
        })
        .await
    }

    /// Replica write: local only, no onward forwarding.
    pub async fn put_replica(
        &self,
        key: String,
        flags: u64,
        expiry: Option<SystemTime>,
        data: Bytes,
    ) -> Result<bool, ClusterError> {
        self.request(|reply| Command::PutReplica {
            key,
            flags,
            expiry,
            data,
            reply,
        })
        .await
    }

    /// Routed read: local hit, or replica consultation plus read repair.
    pub async fn get(&self, key: String) -> Result<Option<CacheValue>, ClusterError> {
        self.request(|reply| Command::Get { key, reply }).await
    }

    /// Replica read: local only, terminal.
    pub async fn get_replica(&self, key: String) -> Result<Option<CacheValue>, ClusterError> {
        self.request(|reply| Command::GetReplica { key, reply }).await
    }

    /// Primary remove with replica fan-out.
    pub async fn remove(&self, key: String) -> Result<bool, ClusterError> {
        self.request(|reply| Command::Remove { key, reply }).await
    }

    /// Replica remove: local only.
    pub async fn remove_replica(&self, key: String) -> Result<bool, ClusterError> {
        self.request(|reply| Command::RemoveReplica { key, reply }).await
    }

    /// Opens a notification stream that replays the partition's current
    /// contents as snapshot records, then continues with live mutations,
    /// deduplicated and ordered by event id.
    pub async fn watch(&self) -> Result<mpsc::Receiver<Notification>, ClusterError> {
        self.request(|reply| Command::Watch { reply }).await
    }

    /// Stops the actor after flushing and closing its journal.
    pub async fn shutdown(&self) -> Result<(), ClusterError> {
        self.request(|reply| Command::Shutdown { reply }).await?
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ClusterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(make(reply_tx))
            .await
            .map_err(|_| ClusterError::PartitionGone(self.name.clone()))?;
        reply_rx
            .await
            .map_err(|_| ClusterError::PartitionGone(self.name.clone()))
    }
}

pub struct PartitionActor;

impl PartitionActor {
    /// Restores the partition from its journal, starts the archiver, and
    /// spawns the serving task.
    pub async fn spawn(
        config: &ClusterConfig,
        name: String,
        partition: u32,
        router: Arc<Router>,
        meter: Arc<dyn Meter>,
    ) -> Result<PartitionHandle, ClusterError> {
        let hub = Arc::new(NotificationHub::new(config.notification_capacity));
        let engine = Arc::new(CacheEngine::new(
            EngineConfig {
                capacity_bytes: config.capacity_bytes,
                partition,
            },
            hub.clone(),
            config.eviction.strategy(),
            meter.clone(),
        ));

        let archive = config.archive_config(&name, partition);
        let report = restore(&archive, meter.clone(), |note| engine.apply(&note)).await?;
        tracing::info!(
            partition = %name,
            replayed = report.records_replayed,
            truncated = report.truncated,
            "partition restored from journal"
        );

        // Subscribe before serving so no committed mutation can slip between
        // replay and the journal tail.
        let archiver = Archiver::spawn(archive, hub.subscribe(), meter.clone()).await?;
        meter.emit(VizEvent::Partition(PartitionEvt {
            partition,
            kind: PartitionKind::Activated {
                replayed: report.records_replayed,
            },
        }));

        let (tx, rx) = mpsc::channel(COMMAND_DEPTH);
        let actor = Actor {
            name: name.clone(),
            partition,
            engine,
            hub,
            router,
            meter,
            watch_buffer: config.notification_capacity,
        };
        tokio::spawn(actor.run(archiver, rx));

        Ok(PartitionHandle { name, sender: tx })
    }
}

struct Actor {
    name: String,
    partition: u32,
    engine: Arc<CacheEngine>,
    hub: Arc<NotificationHub>,
    router: Arc<Router>,
    meter: Arc<dyn Meter>,
    watch_buffer: usize,
}

impl Actor {
    async fn run(self, archiver: Archiver, mut commands: mpsc::Receiver<Command>) {
        let mut archiver = Some(archiver);

        while let Some(command) = commands.recv().await {
            match command {
                Command::Put {
                    key,
                    flags,
                    expiry,
                    data,
                    reply,
                } => {
                    let applied = self.engine.store(&key, flags, expiry, data.clone());
                    let _ = reply.send(applied);
                    if applied {
                        for target in self.other_replicas(&key) {
                            self.forward_put(target, key.clone(), flags, expiry, data.clone());
                        }
                    }
                }
                Command::PutReplica {
                    key,
                    flags,
                    expiry,
                    data,
                    reply,
                } => {
                    let _ = reply.send(self.engine.store(&key, flags, expiry, data));
                }
                Command::Get { key, reply } => {
                    let value = match self.engine.get(&key) {
                        Some(value) => Some(value),
                        None => self.repair_from_replicas(&key).await,
                    };
                    let _ = reply.send(value);
                }
                Command::GetReplica { key, reply } => {
                    let _ = reply.send(self.engine.get(&key));
                }
                Command::Remove { key, reply } => {
                    let removed = self.engine.remove(&key);
                    let _ = reply.send(removed);
                    if removed {
                        for target in self.other_replicas(&key) {
                            self.forward_remove(target, key.clone());
                        }
                    }
                }
                Command::RemoveReplica { key, reply } => {
                    let _ = reply.send(self.engine.remove(&key));
                }
                Command::Watch { reply } => {
                    let _ = reply.send(self.open_watch());
                }
                Command::Shutdown { reply } => {
                    let result = match archiver.take() {
                        Some(archiver) => archiver.close().await.map_err(ClusterError::from),
                        None => Ok(()),
                    };
                    let _ = reply.send(result);
                    break;
                }
            }
        }

        // All handles dropped without an explicit shutdown: still flush.
        if let Some(archiver) = archiver.take() {
            if let Err(e) = archiver.close().await {
                tracing::warn!(
                    partition = %self.name,
                    error = %e,
                    "journal close failed on implicit shutdown"
                );
            }
        }
        self.meter.emit(VizEvent::Partition(PartitionEvt {
            partition: self.partition,
            kind: PartitionKind::Deactivated,
        }));
    }

    /// The key's replica set minus this partition.
    fn other_replicas(&self, key: &str) -> Vec<String> {
        self.router
            .replica_set(key)
            .into_iter()
            .filter(|target| target != &self.name)
            .collect()
    }

    /// Consults the other replicas in ring order. The first hit is stored
    /// locally (read repair) and forwarded to the replicas that were not yet
    /// asked. A failed or slow replica counts as a miss there and the next
    /// one is tried.
    async fn repair_from_replicas(&self, key: &str) -> Option<CacheValue> {
        let replicas = self.other_replicas(key);
        for (position, replica) in replicas.iter().enumerate() {
            let attempt = tokio::time::timeout(
                self.router.replica_timeout,
                self.router.transport.get_replica(replica, key),
            )
            .await;
            match attempt {
                Ok(Ok(Some(value))) => {
                    self.meter.emit(VizEvent::Partition(PartitionEvt {
                        partition: self.partition,
                        kind: PartitionKind::ReadRepair,
                    }));
                    tracing::debug!(key, partition = %self.name, source = %replica, "read repair");

                    // The recovered value carries no expiry, so the repaired
                    // copy lives until overwritten, removed, or evicted.
                    self.engine.store(key, value.flags, None, value.data.clone());
                    for target in &replicas[position + 1..] {
                        self.forward_put(
                            target.clone(),
                            key.to_string(),
                            value.flags,
                            None,
                            value.data.clone(),
                        );
                    }
                    return Some(value);
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    tracing::warn!(replica = %replica, error = %e, "replica read failed")
                }
                Err(_) => tracing::warn!(replica = %replica, "replica read timed out"),
            }
        }
        None
    }

    /// Fire-and-forget write to one replica. A failure or timeout is logged
    /// and counted; the read path repairs the replica later.
    fn forward_put(
        &self,
        target: String,
        key: String,
        flags: u64,
        expiry: Option<SystemTime>,
        data: Bytes,
    ) {
        let router = self.router.clone();
        let partition = self.partition;
        tokio::spawn(async move {
            let attempt = tokio::time::timeout(
                router.replica_timeout,
                router.transport.put_replica(&target, &key, flags, expiry, data),
            )
            .await;
            report_fanout(attempt, &target, partition, &router, "replica write");
        });
    }

    fn forward_remove(&self, target: String, key: String) {
        let router = self.router.clone();
        let partition = self.partition;
        tokio::spawn(async move {
            let attempt = tokio::time::timeout(
                router.replica_timeout,
                router.transport.remove_replica(&target, &key),
            )
            .await;
            report_fanout(attempt, &target, partition, &router, "replica remove");
        });
    }

    /// Snapshot-then-live stream for one subscriber. The live subscription
    /// is taken first so an event committed in between shows up in both
    /// halves and gets deduplicated, rather than in neither.
    fn open_watch(&self) -> mpsc::Receiver<Notification> {
        let live = self.hub.subscribe();
        let snapshot = self.engine.snapshot();

        let (historic_tx, historic_rx) = mpsc::channel(snapshot.len().max(1));
        for note in snapshot {
            // Capacity covers the whole snapshot, so try_send cannot fail.
            let _ = historic_tx.try_send(note);
        }
        drop(historic_tx);

        combine(historic_rx, live, self.watch_buffer)
    }
}

fn report_fanout<T>(
    attempt: Result<Result<T, ClusterError>, tokio::time::error::Elapsed>,
    target: &str,
    partition: u32,
    router: &Arc<Router>,
    what: &'static str,
) {
    let dropped = match attempt {
        Ok(Ok(_)) => false,
        Ok(Err(e)) => {
            tracing::warn!(replica = %target, error = %e, "{what} dropped");
            true
        }
        Err(_) => {
            tracing::warn!(replica = %target, "{what} timed out");
            true
        }
    };
    if dropped {
        router.meter.emit(VizEvent::Partition(PartitionEvt {
            partition,
            kind: PartitionKind::ReplicaDropped,
        }));
    }
}
