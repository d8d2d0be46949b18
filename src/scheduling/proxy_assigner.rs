//! # Proxy Assigner
//!
//! Maps worker indices onto the run's proxy pool in contiguous runs: workers
//! sharing a proxy are neighbours, and no proxy serves more than `⌈G / P⌉`
//! workers. The mapping is fixed before dispatch.

use thiserror::Error;

use crate::domain::{Proxy, ProxyEndpoint};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssignmentError {
    #[error("No proxies configured and local egress is disallowed (scraping.use_own_ip = false)")]
    NoEgressAvailable,
}

/// Ordered egress pool of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyPool {
    proxies: Vec<Proxy>,
}

impl ProxyPool {
    /// Builds the pool from the loaded proxies.
    ///
    /// An empty proxy list resolves to a single local-egress entry when
    /// `allow_local_egress` is set. Configured proxies are used exclusively.
    ///
    /// # Errors
    /// `AssignmentError::NoEgressAvailable` when the list is empty and local
    /// egress is disallowed.
    pub fn resolve(
        proxies: Vec<ProxyEndpoint>,
        allow_local_egress: bool,
    ) -> Result<Self, AssignmentError> {
        if proxies.is_empty() {
            if allow_local_egress {
                return Ok(Self {
                    proxies: vec![Proxy::LocalEgress],
                });
            }
            return Err(AssignmentError::NoEgressAvailable);
        }

        Ok(Self {
            proxies: proxies.into_iter().map(Proxy::Remote).collect(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    #[must_use]
    pub fn proxies(&self) -> &[Proxy] {
        &self.proxies
    }

    #[must_use]
    pub fn uses_local_egress_only(&self) -> bool {
        self.proxies.iter().all(Proxy::is_local)
    }

    /// Fixes the worker → proxy mapping for `group_count` workers
    #[must_use]
    pub fn assign(&self, group_count: usize) -> ProxyAssignment<'_> {
        ProxyAssignment {
            pool: &self.proxies,
            group_count,
        }
    }
}

/// Worker index → proxy mapping for one run
#[derive(Debug, Clone, Copy)]
pub struct ProxyAssignment<'a> {
    pool: &'a [Proxy],
    group_count: usize,
}

impl<'a> ProxyAssignment<'a> {
    /// Upper bound on how many consecutive workers share one proxy
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.group_count.div_ceil(self.pool.len().max(1)).max(1)
    }

    /// Proxy of worker `worker_index`, `None` outside `0..group_count`.
    ///
    /// Worker `i` gets `pool[⌊i·P / G⌋]`. Runs are contiguous with lengths
    /// `⌊G/P⌋` or `⌈G/P⌉`, so every proxy is used whenever `G ≥ P`. This
    /// departs from `pool[i / chunk_size]`, which leaves proxies idle (5 workers
    /// over 4 proxies would use only 3).
    #[must_use]
    pub fn proxy_for(&self, worker_index: usize) -> Option<&'a Proxy> {
        if worker_index >= self.group_count || self.pool.is_empty() {
            return None;
        }
        let slot = worker_index * self.pool.len() / self.group_count;
        self.pool.get(slot)
    }

    /// All `(worker_index, proxy)` pairs in worker order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &'a Proxy)> + '_ {
        (0..self.group_count).filter_map(move |i| self.proxy_for(i).map(|p| (i, p)))
    }
}
