//! Replicated handler (memcached)
//!
//! Keeps `replicate_to` copies of each key on an ordered pool of
//! interchangeable nodes and heals divergent replicas on read.
//!
//! # Read path
//!
//! 1. Probe every node concurrently with up to `attempts_max` node-targeted
//!    reads each, classifying it as holding / missing / unreachable.
//! 2. Take the value of the earliest holder.
//! 3. Plan and apply the repair pass ([`super::repair`]): backfill active
//!    nodes lacking a copy, trim copies beyond the target.
//!
//! Repair runs inside the read call, so a read that repairs pays for the
//! extra round trips.
//!
//! # Write path
//!
//! The first `replicate_to` nodes receive the value, every later node has the
//! key deleted. Placement is static: earlier nodes are preferred holders.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use tracing::{debug, warn};

use super::pooled::PooledHandler;
use super::repair::{first_hit, plan_repair, ProbeOutcome, RepairAction, RepairPlan};
use crate::config::ReplicationOptions;
use crate::metrics::CacheMetrics;
use crate::node::{NodeError, NodePool};

/// Memcached handler with replication
pub struct ReplicatedHandler {
    inner: PooledHandler,
    identifier: String,
    options: ReplicationOptions,
    metrics: Arc<CacheMetrics>,
}

impl ReplicatedHandler {
    pub fn new(
        identifier: impl Into<String>,
        pool: NodePool,
        options: ReplicationOptions,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        let identifier = identifier.into();
        Self {
            inner: PooledHandler::new(identifier.clone(), pool, metrics.clone()),
            identifier,
            options,
            metrics,
        }
    }

    pub fn options(&self) -> &ReplicationOptions {
        &self.options
    }

    pub fn pool(&self) -> &NodePool {
        self.inner.pool()
    }

    /// Pool-routed view used when replication is off, and for flush/stats
    pub fn pooled(&self) -> &PooledHandler {
        &self.inner
    }

    /// Read a key, repairing replicas as a side effect.
    ///
    /// `expires` is the TTL given to repair writes; freshness itself is left
    /// to the nodes' own expiry.
    pub async fn get(&self, key: &str, expires: u32) -> Option<Bytes> {
        if !self.options.replication {
            return self.inner.get(key).await;
        }

        let outcomes = self.probe_all(key).await;
        let value = first_hit(&outcomes)?;

        let plan = plan_repair(&outcomes, self.options.replicate_to);
        if !plan.is_empty() {
            debug!(
                identifier = %self.identifier,
                key,
                holders = plan.holders,
                active = plan.active,
                target = plan.max_replication,
                "Repairing replicas"
            );
            self.apply_repair(key, &value, expires, &plan).await;
        }
        Some(value)
    }

    /// Write to the first `replicate_to` nodes, delete from the rest
    pub async fn set(&self, key: &str, value: Bytes, ttl: u32) {
        if !self.options.replication {
            return self.inner.set(key, value, ttl).await;
        }

        let pool = self.pool();
        let writes = (0..pool.len()).map(|index| {
            let value = value.clone();
            async move {
                if index < self.options.replicate_to {
                    ("set", index, pool.set_by_key(index, key, value, ttl).await)
                } else {
                    ("delete", index, pool.delete_by_key(index, key).await)
                }
            }
        });

        for (op, index, result) in join_all(writes).await {
            self.log_failure(op, index, key, result);
        }
    }

    /// Delete from every node
    pub async fn delete(&self, key: &str) {
        if !self.options.replication {
            return self.inner.delete(key).await;
        }

        let pool = self.pool();
        let deletes =
            (0..pool.len()).map(|index| async move { (index, pool.delete_by_key(index, key).await) });

        for (index, result) in join_all(deletes).await {
            self.log_failure("delete", index, key, result);
        }
    }

    async fn probe_all(&self, key: &str) -> Vec<ProbeOutcome> {
        let probes = (0..self.pool().len()).map(|index| self.probe(index, key));
        join_all(probes).await
    }

    async fn probe(&self, index: usize, key: &str) -> ProbeOutcome {
        let attempts = self.options.attempts_max.max(1);
        for attempt in 0..attempts {
            let backoff = self.options.backoff(attempt);
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }

            match self.pool().get_by_key(index, key).await {
                Ok(value) if !value.is_empty() => return ProbeOutcome::Holding(value),
                Ok(_) => return ProbeOutcome::Missing,
                Err(e) if e.is_answer() => return ProbeOutcome::Missing,
                Err(e) => {
                    debug!(
                        identifier = %self.identifier,
                        endpoint = %self.pool().endpoint(index),
                        attempt = attempt + 1,
                        error = %e,
                        "Replica read failed"
                    );
                }
            }
        }

        self.metrics.record_node_failure();
        ProbeOutcome::Unreachable
    }

    async fn apply_repair(&self, key: &str, value: &Bytes, ttl: u32, plan: &RepairPlan) {
        let pool = self.pool();
        let actions = plan.actions.iter().map(|action| async move {
            match *action {
                RepairAction::Write(index) => {
                    (*action, pool.set_by_key(index, key, value.clone(), ttl).await)
                }
                RepairAction::Trim(index) => (*action, pool.delete_by_key(index, key).await),
            }
        });

        for (action, result) in join_all(actions).await {
            match (action, result) {
                (RepairAction::Write(_), Ok(())) => self.metrics.record_repair_write(),
                (RepairAction::Trim(_), Ok(())) | (RepairAction::Trim(_), Err(NodeError::NotFound)) => {
                    self.metrics.record_replica_trim()
                }
                (RepairAction::Write(index), Err(e)) | (RepairAction::Trim(index), Err(e)) => {
                    warn!(
                        identifier = %self.identifier,
                        endpoint = %pool.endpoint(index),
                        key,
                        error = %e,
                        ?action,
                        "Replica repair failed"
                    );
                }
            }
        }
    }

    fn log_failure(&self, op: &str, index: usize, key: &str, result: Result<(), NodeError>) {
        match result {
            Ok(()) | Err(NodeError::NotFound) => {}
            Err(e) => {
                self.metrics.record_node_failure();
                warn!(
                    identifier = %self.identifier,
                    endpoint = %self.pool().endpoint(index),
                    op,
                    key,
                    error = %e,
                    "Replica write failed"
                );
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
