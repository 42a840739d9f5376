//! Layered artifact builds: base, then every target, then every fuzzer bound
//! to a target that came up ready.

mod backend;
mod cache;
mod graph;

pub use backend::{image_tag, BuildBackend, DockerBackend};
pub use cache::ArtifactCache;
pub use graph::{ArtifactGraph, BuildStatus};

use anyhow::{anyhow, Result};
use fuzzlab_core::{ArtifactId, BuildError, CancelToken, WorkerPool};
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Ready { cached: bool },
    Failed(String),
    Skipped(String),
}

impl BuildOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, BuildOutcome::Ready { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub outcomes: Vec<(ArtifactId, BuildOutcome)>,
}

impl BuildReport {
    pub fn outcome(&self, artifact: &ArtifactId) -> Option<&BuildOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == artifact)
            .map(|(_, outcome)| outcome)
    }

    pub fn failures(&self) -> Vec<(&ArtifactId, &str)> {
        self.outcomes
            .iter()
            .filter_map(|(id, outcome)| match outcome {
                BuildOutcome::Ready { .. } => None,
                BuildOutcome::Failed(reason) | BuildOutcome::Skipped(reason) => {
                    Some((id, reason.as_str()))
                }
            })
            .collect()
    }

    pub fn ready_count(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_ready()).count()
    }

    pub fn is_success(&self) -> bool {
        self.ready_count() == self.outcomes.len()
    }
}

struct Built {
    digest: Option<String>,
    cached: bool,
}

struct Completion {
    artifact: ArtifactId,
    result: Result<Built, BuildError>,
}

pub struct ArtifactBuilder {
    backend: Arc<dyn BuildBackend>,
    concurrency: usize,
    cache: Option<ArtifactCache>,
    cancel: CancelToken,
}

impl ArtifactBuilder {
    pub fn new(backend: impl BuildBackend + 'static, concurrency: usize) -> Self {
        Self {
            backend: Arc::new(backend),
            concurrency,
            cache: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cache(mut self, cache: ArtifactCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Builds base, every target and every (target, fuzzer) pair.
    ///
    /// A failure is recorded against its artifact and the artifacts that
    /// depend on it; unrelated artifacts keep building. With concurrency 0
    /// the batch runs on this thread and stops at the first failure.
    pub fn build_all(&self, targets: &[String], fuzzers: &[String]) -> Result<BuildReport> {
        let mut graph = ArtifactGraph::plan(targets, fuzzers);
        let mut outcomes: HashMap<ArtifactId, BuildOutcome> = HashMap::new();
        let mut digests: HashMap<ArtifactId, String> = HashMap::new();

        if self.cancel.is_cancelled() {
            return Ok(finish(&graph, outcomes, "cancelled"));
        }

        tracing::info!(
            targets = targets.len(),
            fuzzers = fuzzers.len(),
            concurrency = self.concurrency,
            "building artifacts"
        );
        graph.set(&ArtifactId::Base, BuildStatus::Building);
        let base = build_one(
            self.backend.as_ref(),
            self.cache.as_ref(),
            &ArtifactId::Base,
            None,
        );
        let base_ready = settle(
            &mut graph,
            &mut outcomes,
            &mut digests,
            Completion {
                artifact: ArtifactId::Base,
                result: base,
            },
        );
        if !base_ready {
            return Ok(finish(&graph, outcomes, "dependency base failed"));
        }

        let pool = WorkerPool::new("build", self.concurrency)?;
        let sequential = pool.is_inline();
        let (tx, rx) = mpsc::channel::<Completion>();
        let mut queue: VecDeque<ArtifactId> = graph.targets().cloned().collect();
        let mut in_flight = 0usize;
        let mut halted: Option<&'static str> = None;

        loop {
            while halted.is_none() {
                if self.cancel.is_cancelled() {
                    halted = Some("cancelled");
                    break;
                }
                let Some(next) = queue.pop_front() else {
                    break;
                };
                if !graph.can_start(&next) {
                    let dependency = next.parent().unwrap_or(ArtifactId::Base);
                    return Err(BuildError::DependencyNotReady {
                        artifact: next,
                        dependency,
                    }
                    .into());
                }
                graph.set(&next, BuildStatus::Building);
                let parent_digest = next.parent().and_then(|p| digests.get(&p).cloned());
                let backend = self.backend.clone();
                let cache = self.cache.clone();
                let tx = tx.clone();
                pool.execute(move || {
                    let result = build_one(backend.as_ref(), cache.as_ref(), &next, parent_digest);
                    let _ = tx.send(Completion {
                        artifact: next,
                        result,
                    });
                })?;
                in_flight += 1;
                if sequential {
                    break;
                }
            }
            if in_flight == 0 {
                break;
            }
            let done = rx
                .recv()
                .map_err(|_| anyhow!("build workers exited unexpectedly"))?;
            in_flight -= 1;
            let artifact = done.artifact.clone();
            let ready = settle(&mut graph, &mut outcomes, &mut digests, done);
            if let ArtifactId::Target { name } = &artifact {
                let dependents: Vec<ArtifactId> = graph.fuzzers_of(name).cloned().collect();
                if ready {
                    queue.extend(dependents);
                } else {
                    for fuzzer in dependents {
                        graph.set(&fuzzer, BuildStatus::Failed);
                        outcomes.insert(
                            fuzzer,
                            BuildOutcome::Skipped(format!("dependency {} failed", artifact)),
                        );
                    }
                }
            }
            if !ready && sequential {
                halted = Some("not attempted after an earlier failure");
            }
        }
        drop(tx);
        pool.join();

        Ok(finish(
            &graph,
            outcomes,
            halted.unwrap_or("not attempted"),
        ))
    }
}

fn build_one(
    backend: &dyn BuildBackend,
    cache: Option<&ArtifactCache>,
    artifact: &ArtifactId,
    parent_digest: Option<String>,
) -> Result<Built, BuildError> {
    let digest = match (cache, backend.context_dir(artifact)) {
        (Some(cache), Some(context)) => match cache.digest(&context, parent_digest.as_deref()) {
            Ok(digest) => Some(digest),
            Err(err) => {
                tracing::warn!(%artifact, error = %err, "failed to digest build context");
                None
            }
        },
        _ => None,
    };
    if let (Some(cache), Some(digest)) = (cache, digest.as_deref()) {
        if cache.is_fresh(artifact, digest) && backend.exists(artifact) {
            tracing::info!(%artifact, "up to date");
            return Ok(Built {
                digest: Some(digest.to_string()),
                cached: true,
            });
        }
    }

    tracing::info!(%artifact, kind = artifact.kind().as_str(), "building");
    match backend.build(artifact) {
        Ok(()) => {
            if let (Some(cache), Some(digest)) = (cache, digest.as_deref()) {
                if let Err(err) = cache.record(artifact, digest) {
                    tracing::warn!(%artifact, error = %err, "failed to record build stamp");
                }
            }
            tracing::info!(%artifact, "done");
            Ok(Built {
                digest,
                cached: false,
            })
        }
        Err(err) => {
            if let Some(cache) = cache {
                cache.invalidate(artifact);
            }
            Err(err)
        }
    }
}

/// Applies a completion to the graph; returns whether the artifact is ready.
fn settle(
    graph: &mut ArtifactGraph,
    outcomes: &mut HashMap<ArtifactId, BuildOutcome>,
    digests: &mut HashMap<ArtifactId, String>,
    done: Completion,
) -> bool {
    match done.result {
        Ok(built) => {
            graph.set(&done.artifact, BuildStatus::Ready);
            if let Some(digest) = built.digest {
                digests.insert(done.artifact.clone(), digest);
            }
            outcomes.insert(done.artifact, BuildOutcome::Ready { cached: built.cached });
            true
        }
        Err(err) => {
            tracing::warn!(artifact = %done.artifact, error = %err, "build failed");
            graph.set(&done.artifact, BuildStatus::Failed);
            outcomes.insert(done.artifact, BuildOutcome::Failed(err.to_string()));
            false
        }
    }
}

fn finish(
    graph: &ArtifactGraph,
    mut outcomes: HashMap<ArtifactId, BuildOutcome>,
    unattempted: &str,
) -> BuildReport {
    let outcomes = graph
        .artifacts()
        .iter()
        .map(|id| {
            let outcome = outcomes
                .remove(id)
                .unwrap_or_else(|| BuildOutcome::Skipped(unattempted.to_string()));
            (id.clone(), outcome)
        })
        .collect();
    BuildReport { outcomes }
}
