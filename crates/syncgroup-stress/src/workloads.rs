use std::future::pending;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use syncgroup::{BoolFuncs, Calls, Fetched, RefCache, Releaser};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

impl WorkloadsConfig {
    pub fn get(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).context("failed to open workloads file")?;
        serde_yaml::from_reader(file).context("failed to parse workloads YAML")
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    #[serde(flatten)]
    pub payload: Payload,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
    /// Coalesced calls over `keys` distinct keys.
    Calls {
        keys: usize,
        #[serde(with = "humantime_serde")]
        work: Duration,
        /// Every n-th callback rejects its result.
        #[serde(default)]
        reject_every: Option<usize>,
    },
    /// Cached values over `keys` distinct keys.
    RefCache {
        keys: usize,
        #[serde(with = "humantime_serde")]
        work: Duration,
        /// Every n-th operation evicts its key after using the value.
        #[serde(default)]
        evict_every: Option<usize>,
    },
    /// Batches of `width` parallel functions.
    Funcs {
        width: usize,
        #[serde(with = "humantime_serde")]
        work: Duration,
    },
}

/// A workload together with the shared primitive it exercises.
pub enum ParsedPayload {
    Calls {
        calls: Calls<usize, usize>,
        keys: usize,
        work: Duration,
        reject_every: Option<usize>,
    },
    RefCache {
        cache: RefCache<usize, usize>,
        released: Arc<AtomicUsize>,
        keys: usize,
        work: Duration,
        evict_every: Option<usize>,
    },
    Funcs {
        width: usize,
        work: Duration,
    },
}

pub struct PreparedWorkload {
    payload: ParsedPayload,
    seq: AtomicUsize,
}

pub fn prepare_payload(payload: Payload) -> PreparedWorkload {
    let payload = match payload {
        Payload::Calls {
            keys,
            work,
            reject_every,
        } => ParsedPayload::Calls {
            calls: Calls::new(),
            keys: keys.max(1),
            work,
            reject_every,
        },
        Payload::RefCache {
            keys,
            work,
            evict_every,
        } => ParsedPayload::RefCache {
            cache: RefCache::new(),
            released: Arc::default(),
            keys: keys.max(1),
            work,
            evict_every,
        },
        Payload::Funcs { width, work } => ParsedPayload::Funcs { width, work },
    };
    PreparedWorkload {
        payload,
        seq: AtomicUsize::new(0),
    }
}

fn is_nth(seq: usize, every: Option<usize>) -> bool {
    every.is_some_and(|every| every > 0 && seq % every == every - 1)
}

pub async fn process_payload(workload: &PreparedWorkload) {
    let seq = workload.seq.fetch_add(1, Ordering::Relaxed);

    match &workload.payload {
        ParsedPayload::Calls {
            calls,
            keys,
            work,
            reject_every,
        } => {
            let (_value, status) = calls
                .run(seq % keys, pending(), || async {
                    tokio::time::sleep(*work).await;
                    (seq, !is_nth(seq, *reject_every))
                })
                .await;
            tracing::trace!(seq, status = status.as_str(), "Finished call");
        }
        ParsedPayload::RefCache {
            cache,
            released,
            keys,
            work,
            evict_every,
        } => {
            let key = seq % keys;
            let fetch = || async {
                tokio::time::sleep(*work).await;
                let released = Arc::clone(released);
                let releaser: Releaser = Box::new(move || {
                    released.fetch_add(1, Ordering::Relaxed);
                });
                (key, Some(releaser))
            };
            if let Fetched::Cached(value) = cache.get(key, pending(), fetch).await {
                debug_assert_eq!(*value, key);
                if is_nth(seq, *evict_every) {
                    cache.delete(&key);
                }
            }
        }
        ParsedPayload::Funcs { width, work } => {
            let funcs = BoolFuncs::new();
            let work = *work;
            funcs.extend((0..*width).map(|_| async move {
                tokio::time::sleep(work).await;
                true
            }));
            funcs.all_done().wait().await;
        }
    }
}

impl PreparedWorkload {
    /// Describes the state the workload left behind.
    pub fn summary(&self) -> Option<String> {
        match &self.payload {
            ParsedPayload::RefCache {
                cache, released, ..
            } => Some(format!(
                "{} cached values, {} released",
                cache.len(),
                released.load(Ordering::Relaxed)
            )),
            _ => None,
        }
    }
}
