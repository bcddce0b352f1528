//! # Introduce Iterator
//!
//! Discovers peers starting from a seed list. Workers pop pending peers,
//! issue Introduce queries, and fold each reply's self-description into the
//! responded set and its sampled peers into the pending pool. The iteration
//! finishes once enough distinct peers have responded, the pool drains, or
//! errors accumulate past the tolerance.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::config::IntroduceConfig;
use crate::id::Id;
use crate::peer::{Peer, PeerAddress};

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Introduction failure kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntroduceError {
    /// No seeds were provided to start from.
    NoBootstrapPeers,
    /// The iteration hit a fatal error.
    Fatal(String),
}

impl std::fmt::Display for IntroduceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntroduceError::NoBootstrapPeers => write!(f, "no bootstrap peers provided"),
            IntroduceError::Fatal(msg) => write!(f, "introduction failed: {}", msg),
        }
    }
}

impl std::error::Error for IntroduceError {}

/// Introduction parameters, derived from [`IntroduceConfig`].
#[derive(Debug, Clone)]
pub struct IntroduceParams {
    pub target_num_peers: usize,
    pub num_peers_per_request: u32,
    pub concurrency: usize,
    pub n_max_errors: usize,
    pub query_timeout: Duration,
    pub timeout: Duration,
}

impl From<&IntroduceConfig> for IntroduceParams {
    fn from(config: &IntroduceConfig) -> Self {
        Self {
            target_num_peers: config.target_num_peers.max(1),
            num_peers_per_request: config.num_peers_per_request.max(1),
            concurrency: config.concurrency.max(1),
            n_max_errors: config.n_max_errors.max(1),
            query_timeout: config.query_timeout,
            timeout: config.timeout,
        }
    }
}

/// Shared mutable state of one introduction.
pub struct IntroduceResult {
    unqueried: VecDeque<Peer>,
    seen: HashSet<Id>,
    pub responded: HashMap<Id, Peer>,
    pub errored: HashMap<Id, String>,
    pub fatal: Option<String>,
    in_flight: usize,
}

impl IntroduceResult {
    fn new() -> Self {
        Self {
            unqueried: VecDeque::new(),
            seen: HashSet::new(),
            responded: HashMap::new(),
            errored: HashMap::new(),
            fatal: None,
            in_flight: 0,
        }
    }

    fn add_unqueried(&mut self, peer: Peer) {
        if !self.responded.contains_key(&peer.id) && self.seen.insert(peer.id) {
            self.unqueried.push_back(peer);
        }
    }
}

/// One introduction run.
pub struct Introduction {
    pub self_id: Id,
    pub params: IntroduceParams,
    result: Mutex<IntroduceResult>,
}

impl Introduction {
    pub fn new(self_id: Id, params: IntroduceParams) -> Self {
        Self {
            self_id,
            params,
            result: Mutex::new(IntroduceResult::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, IntroduceResult> {
        self.result.lock().expect("introduction mutex poisoned")
    }

    pub fn num_responded(&self) -> usize {
        self.lock().responded.len()
    }

    pub fn responded_peers(&self) -> Vec<Peer> {
        self.lock().responded.values().cloned().collect()
    }

    pub fn errored(&self) -> bool {
        errored_locked(&self.lock(), self.params.n_max_errors)
    }

    pub fn exhausted(&self) -> bool {
        exhausted_locked(&self.lock())
    }

    pub fn finished(&self) -> bool {
        finished_locked(&self.lock(), &self.params)
    }
}

fn errored_locked(result: &IntroduceResult, n_max_errors: usize) -> bool {
    result.fatal.is_some() || result.errored.len() >= n_max_errors
}

fn exhausted_locked(result: &IntroduceResult) -> bool {
    result.unqueried.is_empty() && result.in_flight == 0
}

fn finished_locked(result: &IntroduceResult, params: &IntroduceParams) -> bool {
    result.responded.len() >= params.target_num_peers
        || errored_locked(result, params.n_max_errors)
        || exhausted_locked(result)
}

/// Reply to one Introduce query.
#[derive(Debug, Clone)]
pub struct IntroduceReply {
    pub self_address: PeerAddress,
    pub peers: Vec<PeerAddress>,
}

/// Issues Introduce queries on behalf of the workers.
#[async_trait]
pub trait IntroduceQuerier: Send + Sync {
    async fn introduce(&self, peer: &Peer, num_peers: u32) -> Result<IntroduceReply>;
}

/// Runs introductions with a bounded worker pool.
#[derive(Clone)]
pub struct Introducer {
    querier: Arc<dyn IntroduceQuerier>,
    stop: watch::Receiver<bool>,
}

impl Introducer {
    pub fn new(querier: Arc<dyn IntroduceQuerier>, stop: watch::Receiver<bool>) -> Self {
        Self { querier, stop }
    }

    /// Run the introduction to completion from the given seeds.
    pub async fn introduce(
        &self,
        intro: &Arc<Introduction>,
        seeds: Vec<Peer>,
    ) -> Result<(), IntroduceError> {
        if seeds.is_empty() {
            return Err(IntroduceError::NoBootstrapPeers);
        }
        {
            let mut result = intro.lock();
            for seed in seeds {
                if seed.id != intro.self_id {
                    result.add_unqueried(seed);
                }
            }
        }

        let mut workers = JoinSet::new();
        for _ in 0..intro.params.concurrency {
            let intro = intro.clone();
            let querier = self.querier.clone();
            workers.spawn(async move { work(intro, querier).await });
        }

        let drain = async {
            while workers.join_next().await.is_some() {}
        };
        let mut stop = self.stop.clone();
        tokio::select! {
            outcome = tokio::time::timeout(intro.params.timeout, drain) => {
                if outcome.is_err() {
                    debug!("introduction timed out");
                }
            }
            _ = stop.changed() => {
                debug!("introduction interrupted by shutdown");
            }
        }

        let mut result = intro.lock();
        result.in_flight = 0;
        if !finished_locked(&result, &intro.params) {
            result.unqueried.clear();
        }
        if let Some(fatal) = result.fatal.clone() {
            return Err(IntroduceError::Fatal(fatal));
        }
        Ok(())
    }
}

enum Step {
    Query(Peer),
    Wait,
    Done,
}

async fn work(intro: Arc<Introduction>, querier: Arc<dyn IntroduceQuerier>) {
    loop {
        let step = {
            let mut result = intro.lock();
            if finished_locked(&result, &intro.params) {
                Step::Done
            } else if let Some(peer) = result.unqueried.pop_front() {
                result.in_flight += 1;
                Step::Query(peer)
            } else if result.in_flight > 0 {
                Step::Wait
            } else {
                Step::Done
            }
        };

        let peer = match step {
            Step::Done => break,
            Step::Wait => {
                tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                continue;
            }
            Step::Query(peer) => peer,
        };

        let outcome = tokio::time::timeout(
            intro.params.query_timeout,
            querier.introduce(&peer, intro.params.num_peers_per_request),
        )
        .await;

        let mut result = intro.lock();
        result.in_flight -= 1;
        match outcome {
            Ok(Ok(reply)) => {
                trace!(
                    peer = %reply.self_address.peer_id,
                    n_peers = reply.peers.len(),
                    "introduction succeeded"
                );
                process_reply(&mut result, &intro, reply);
            }
            Ok(Err(e)) => {
                result.errored.insert(peer.id, e.to_string());
            }
            Err(_) => {
                result.errored.insert(peer.id, "query timeout".to_string());
            }
        }
    }
}

fn process_reply(result: &mut IntroduceResult, intro: &Introduction, reply: IntroduceReply) {
    let responder = Peer::from_address(&reply.self_address);
    result.seen.insert(responder.id);
    result.responded.insert(responder.id, responder);
    for address in reply.peers {
        if address.peer_id == intro.self_id {
            continue;
        }
        result.add_unqueried(Peer::from_address(&address));
    }
}
