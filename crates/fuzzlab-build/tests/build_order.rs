use fuzzlab_build::{ArtifactBuilder, ArtifactCache, BuildBackend, BuildOutcome, BuildReport};
use fuzzlab_core::{ArtifactId, BuildError, CancelToken};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Start(ArtifactId),
    Finish(ArtifactId, bool),
}

#[derive(Clone, Default)]
struct MockBackend {
    events: Arc<Mutex<Vec<Event>>>,
    failing: Arc<HashSet<ArtifactId>>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    builds: Arc<AtomicUsize>,
    delay: Duration,
    context_root: Option<PathBuf>,
    present: bool,
    cancel_on: Option<(ArtifactId, CancelToken)>,
}

impl MockBackend {
    fn failing(ids: &[ArtifactId]) -> Self {
        Self {
            failing: Arc::new(ids.iter().cloned().collect()),
            ..Self::default()
        }
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn position(&self, event: &Event) -> usize {
        self.events()
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("missing event {:?}", event))
    }
}

impl BuildBackend for MockBackend {
    fn build(&self, artifact: &ArtifactId) -> Result<(), BuildError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.events
            .lock()
            .unwrap()
            .push(Event::Start(artifact.clone()));
        if let Some((trigger, cancel)) = &self.cancel_on {
            if trigger == artifact {
                cancel.cancel();
            }
        }
        thread::sleep(self.delay);
        let ok = !self.failing.contains(artifact);
        self.events
            .lock()
            .unwrap()
            .push(Event::Finish(artifact.clone(), ok));
        self.running.fetch_sub(1, Ordering::SeqCst);
        if ok {
            Ok(())
        } else {
            Err(BuildError::Failed {
                artifact: artifact.clone(),
                reason: "exit 1".to_string(),
            })
        }
    }

    fn exists(&self, _artifact: &ArtifactId) -> bool {
        self.present
    }

    fn context_dir(&self, artifact: &ArtifactId) -> Option<PathBuf> {
        let root = self.context_root.as_ref()?;
        match artifact {
            ArtifactId::Base => Some(root.join("base")),
            ArtifactId::Target { name } => Some(root.join("targets").join(name)),
            ArtifactId::Fuzzer { name, .. } => Some(root.join("fuzzers").join(name)),
        }
    }
}

fn names(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn fuzzer_never_starts_before_its_target_is_ready() {
    let backend = MockBackend {
        delay: Duration::from_millis(5),
        ..MockBackend::default()
    };
    let builder = ArtifactBuilder::new(backend.clone(), 4);
    let report = builder
        .build_all(&names(&["a", "b", "c"]), &names(&["x", "y"]))
        .expect("build");

    assert!(report.is_success(), "{:?}", report.failures());
    assert_eq!(report.outcomes.len(), 1 + 3 + 6);
    for target in ["a", "b", "c"] {
        let ready = backend.position(&Event::Finish(ArtifactId::target(target), true));
        assert!(backend.position(&Event::Finish(ArtifactId::Base, true)) < ready);
        for fuzzer in ["x", "y"] {
            let start = backend.position(&Event::Start(ArtifactId::fuzzer(target, fuzzer)));
            assert!(ready < start, "{}/{} started before its target", target, fuzzer);
        }
    }
    assert!(backend.peak.load(Ordering::SeqCst) <= 4);
}

#[test]
fn failure_is_isolated_to_dependents() {
    let backend = MockBackend::failing(&[ArtifactId::target("b"), ArtifactId::fuzzer("a", "y")]);
    let builder = ArtifactBuilder::new(backend.clone(), 2);
    let report = builder
        .build_all(&names(&["a", "b"]), &names(&["x", "y"]))
        .expect("build");

    assert!(report
        .outcome(&ArtifactId::fuzzer("a", "x"))
        .expect("a/x")
        .is_ready());
    assert!(matches!(
        report.outcome(&ArtifactId::fuzzer("a", "y")),
        Some(BuildOutcome::Failed(_))
    ));
    assert!(matches!(
        report.outcome(&ArtifactId::target("b")),
        Some(BuildOutcome::Failed(_))
    ));
    match report.outcome(&ArtifactId::fuzzer("b", "x")) {
        Some(BuildOutcome::Skipped(reason)) => assert!(reason.contains("target:b"), "{}", reason),
        other => panic!("unexpected outcome {:?}", other),
    }
    let failed: HashSet<String> = report
        .failures()
        .iter()
        .map(|(id, _)| id.to_string())
        .collect();
    assert_eq!(
        failed,
        ["target:b", "fuzzer:a/y", "fuzzer:b/x", "fuzzer:b/y"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    );
    assert!(!backend
        .events()
        .contains(&Event::Start(ArtifactId::fuzzer("b", "x"))));
}

#[test]
fn sequential_builds_all_targets_then_fuzzers() {
    let backend = MockBackend::default();
    let builder = ArtifactBuilder::new(backend.clone(), 0);
    let report = builder
        .build_all(&names(&["a", "b"]), &names(&["x"]))
        .expect("build");
    assert!(report.is_success());

    let starts: Vec<String> = backend
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Start(id) => Some(id.to_string()),
            Event::Finish(..) => None,
        })
        .collect();
    assert_eq!(
        starts,
        vec!["base", "target:a", "target:b", "fuzzer:a/x", "fuzzer:b/x"]
    );
    assert_eq!(backend.peak.load(Ordering::SeqCst), 1);
}

#[test]
fn sequential_mode_stops_at_first_failure() {
    let backend = MockBackend::failing(&[ArtifactId::target("a")]);
    let builder = ArtifactBuilder::new(backend.clone(), 0);
    let report = builder
        .build_all(&names(&["a", "b"]), &names(&["x"]))
        .expect("build");

    assert_eq!(report.ready_count(), 1);
    assert!(matches!(
        report.outcome(&ArtifactId::target("b")),
        Some(BuildOutcome::Skipped(_))
    ));
    assert_eq!(backend.builds.load(Ordering::SeqCst), 2);
}

#[test]
fn parallel_mode_keeps_going_after_failure() {
    let backend = MockBackend::failing(&[ArtifactId::target("a")]);
    let builder = ArtifactBuilder::new(backend.clone(), 2);
    let report = builder
        .build_all(&names(&["a", "b"]), &names(&["x"]))
        .expect("build");

    assert!(report
        .outcome(&ArtifactId::fuzzer("b", "x"))
        .expect("b/x")
        .is_ready());
    assert_eq!(report.failures().len(), 2);
}

#[test]
fn base_failure_skips_everything() {
    let backend = MockBackend::failing(&[ArtifactId::Base]);
    let report = ArtifactBuilder::new(backend.clone(), 3)
        .build_all(&names(&["a"]), &names(&["x"]))
        .expect("build");
    assert_eq!(report.ready_count(), 0);
    assert_eq!(backend.builds.load(Ordering::SeqCst), 1);
    assert!(matches!(
        report.outcome(&ArtifactId::fuzzer("a", "x")),
        Some(BuildOutcome::Skipped(_))
    ));
}

fn contexts(root: &Path) -> MockBackend {
    for dir in ["base", "targets/a", "fuzzers/x"] {
        let path = root.join(dir);
        std::fs::create_dir_all(&path).expect("mkdir");
        std::fs::write(path.join("Dockerfile"), dir).expect("write");
    }
    MockBackend {
        context_root: Some(root.to_path_buf()),
        present: true,
        ..MockBackend::default()
    }
}

fn cached_build(backend: &MockBackend, cache_dir: &Path) -> BuildReport {
    ArtifactBuilder::new(backend.clone(), 2)
        .with_cache(ArtifactCache::new(cache_dir))
        .build_all(&names(&["a"]), &names(&["x"]))
        .expect("build")
}

#[test]
fn unchanged_contexts_are_reused() {
    let root = tempfile::tempdir().expect("tempdir");
    let backend = contexts(root.path());
    let cache_dir = root.path().join("cache");

    let first = cached_build(&backend, &cache_dir);
    assert_eq!(
        first.outcome(&ArtifactId::target("a")),
        Some(&BuildOutcome::Ready { cached: false })
    );
    assert_eq!(backend.builds.load(Ordering::SeqCst), 3);

    let second = cached_build(&backend, &cache_dir);
    assert_eq!(
        second.outcome(&ArtifactId::fuzzer("a", "x")),
        Some(&BuildOutcome::Ready { cached: true })
    );
    assert_eq!(
        second.outcome(&ArtifactId::Base),
        Some(&BuildOutcome::Ready { cached: true })
    );
    assert_eq!(backend.builds.load(Ordering::SeqCst), 3);

    std::fs::write(root.path().join("targets/a/Dockerfile"), "changed").expect("write");
    let third = cached_build(&backend, &cache_dir);
    assert_eq!(
        third.outcome(&ArtifactId::fuzzer("a", "x")),
        Some(&BuildOutcome::Ready { cached: false })
    );
    assert_eq!(
        third.outcome(&ArtifactId::Base),
        Some(&BuildOutcome::Ready { cached: true })
    );
    assert_eq!(backend.builds.load(Ordering::SeqCst), 5);
}

#[test]
fn base_change_rebuilds_every_layer() {
    let root = tempfile::tempdir().expect("tempdir");
    let backend = contexts(root.path());
    let cache_dir = root.path().join("cache");
    cached_build(&backend, &cache_dir);
    assert_eq!(backend.builds.load(Ordering::SeqCst), 3);

    std::fs::write(root.path().join("base/Dockerfile"), "FROM ubuntu:24.04").expect("write");
    let report = cached_build(&backend, &cache_dir);
    for id in [ArtifactId::Base, ArtifactId::target("a"), ArtifactId::fuzzer("a", "x")] {
        assert_eq!(
            report.outcome(&id),
            Some(&BuildOutcome::Ready { cached: false }),
            "{}",
            id
        );
    }
    assert_eq!(backend.builds.load(Ordering::SeqCst), 6);
}

#[test]
fn cancelled_batch_builds_nothing() {
    let backend = MockBackend::default();
    let cancel = CancelToken::new();
    cancel.cancel();
    let report = ArtifactBuilder::new(backend.clone(), 2)
        .with_cancel(cancel)
        .build_all(&names(&["a"]), &names(&["x"]))
        .expect("build");
    assert_eq!(report.ready_count(), 0);
    assert_eq!(backend.builds.load(Ordering::SeqCst), 0);
}

#[test]
fn cancel_mid_batch_drains_in_flight_and_starts_no_fuzzers() {
    let cancel = CancelToken::new();
    let backend = MockBackend {
        delay: Duration::from_millis(20),
        cancel_on: Some((ArtifactId::target("a"), cancel.clone())),
        ..MockBackend::default()
    };
    let report = ArtifactBuilder::new(backend.clone(), 2)
        .with_cancel(cancel)
        .build_all(&names(&["a", "b"]), &names(&["x"]))
        .expect("build");

    let events = backend.events();
    assert!(!events
        .iter()
        .any(|e| matches!(e, Event::Start(ArtifactId::Fuzzer { .. }))));
    for event in &events {
        if let Event::Start(id) = event {
            assert!(
                events.contains(&Event::Finish(id.clone(), true)),
                "{} was left in flight",
                id
            );
        }
    }
    assert!(report
        .outcome(&ArtifactId::target("a"))
        .expect("target:a")
        .is_ready());
    assert_eq!(
        report.outcome(&ArtifactId::fuzzer("a", "x")),
        Some(&BuildOutcome::Skipped("cancelled".to_string()))
    );
    assert_eq!(backend.running.load(Ordering::SeqCst), 0);
}
