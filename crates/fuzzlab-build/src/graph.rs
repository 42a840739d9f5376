use fuzzlab_core::ArtifactId;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Unbuilt,
    Building,
    Ready,
    Failed,
}

/// The base -> target -> fuzzer tree for one build invocation, in the order
/// artifacts were declared.
#[derive(Debug, Clone)]
pub struct ArtifactGraph {
    order: Vec<ArtifactId>,
    status: HashMap<ArtifactId, BuildStatus>,
}

impl ArtifactGraph {
    pub fn plan(targets: &[String], fuzzers: &[String]) -> Self {
        let mut order = vec![ArtifactId::Base];
        order.extend(targets.iter().map(ArtifactId::target));
        for target in targets {
            order.extend(fuzzers.iter().map(|f| ArtifactId::fuzzer(target.clone(), f.clone())));
        }
        let mut status = HashMap::new();
        order.retain(|id| status.insert(id.clone(), BuildStatus::Unbuilt).is_none());
        Self { order, status }
    }

    pub fn artifacts(&self) -> &[ArtifactId] {
        &self.order
    }

    pub fn targets(&self) -> impl Iterator<Item = &ArtifactId> {
        self.order
            .iter()
            .filter(|id| matches!(id, ArtifactId::Target { .. }))
    }

    pub fn fuzzers_of<'a>(&'a self, target: &'a str) -> impl Iterator<Item = &'a ArtifactId> {
        self.order.iter().filter(move |id| {
            matches!(id, ArtifactId::Fuzzer { target: t, .. } if t == target)
        })
    }

    pub fn status(&self, id: &ArtifactId) -> BuildStatus {
        self.status.get(id).copied().unwrap_or(BuildStatus::Unbuilt)
    }

    pub fn set(&mut self, id: &ArtifactId, status: BuildStatus) {
        self.status.insert(id.clone(), status);
    }

    /// An artifact may start only while unbuilt and once its parent is ready.
    pub fn can_start(&self, id: &ArtifactId) -> bool {
        self.status(id) == BuildStatus::Unbuilt
            && id
                .parent()
                .map(|p| self.status(&p) == BuildStatus::Ready)
                .unwrap_or(true)
    }
}
