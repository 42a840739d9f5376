use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Base,
    Target,
    Fuzzer,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Base => "base",
            ArtifactKind::Target => "target",
            ArtifactKind::Fuzzer => "fuzzer",
        }
    }
}

/// Identity of a build artifact. The graph is base -> target -> fuzzer and a
/// fuzzer artifact is always bound to exactly one target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactId {
    Base,
    Target { name: String },
    Fuzzer { target: String, name: String },
}

impl ArtifactId {
    pub fn target(name: impl Into<String>) -> Self {
        ArtifactId::Target { name: name.into() }
    }

    pub fn fuzzer(target: impl Into<String>, name: impl Into<String>) -> Self {
        ArtifactId::Fuzzer {
            target: target.into(),
            name: name.into(),
        }
    }

    pub fn kind(&self) -> ArtifactKind {
        match self {
            ArtifactId::Base => ArtifactKind::Base,
            ArtifactId::Target { .. } => ArtifactKind::Target,
            ArtifactId::Fuzzer { .. } => ArtifactKind::Fuzzer,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ArtifactId::Base => "base",
            ArtifactId::Target { name } | ArtifactId::Fuzzer { name, .. } => name,
        }
    }

    /// The artifact that must be ready before this one may start building.
    pub fn parent(&self) -> Option<ArtifactId> {
        match self {
            ArtifactId::Base => None,
            ArtifactId::Target { .. } => Some(ArtifactId::Base),
            ArtifactId::Fuzzer { target, .. } => Some(ArtifactId::target(target.clone())),
        }
    }

    /// Filesystem-safe key, unique per artifact.
    pub fn cache_key(&self) -> String {
        match self {
            ArtifactId::Base => "base".to_string(),
            ArtifactId::Target { name } => format!("target/{}", name),
            ArtifactId::Fuzzer { target, name } => format!("fuzzer/{}__{}", target, name),
        }
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactId::Base => write!(f, "base"),
            ArtifactId::Target { name } => write!(f, "target:{}", name),
            ArtifactId::Fuzzer { target, name } => write!(f, "fuzzer:{}/{}", target, name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrialKey {
    pub target: String,
    pub fuzzer: String,
    pub trial: usize,
}

impl TrialKey {
    pub fn new(target: impl Into<String>, fuzzer: impl Into<String>, trial: usize) -> Self {
        Self {
            target: target.into(),
            fuzzer: fuzzer.into(),
            trial,
        }
    }

    pub fn artifact(&self) -> ArtifactId {
        ArtifactId::fuzzer(self.target.clone(), self.fuzzer.clone())
    }
}

impl fmt::Display for TrialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.target, self.fuzzer, self.trial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parents_follow_the_layer_chain() {
        let fuzzer = ArtifactId::fuzzer("libpng", "afl");
        assert_eq!(fuzzer.parent(), Some(ArtifactId::target("libpng")));
        assert_eq!(
            ArtifactId::target("libpng").parent(),
            Some(ArtifactId::Base)
        );
        assert_eq!(ArtifactId::Base.parent(), None);
        assert_eq!(fuzzer.kind(), ArtifactKind::Fuzzer);
        assert_eq!(fuzzer.name(), "afl");
    }

    #[test]
    fn cache_keys_do_not_collide_across_targets() {
        let a = ArtifactId::fuzzer("libpng", "afl").cache_key();
        let b = ArtifactId::fuzzer("libxml2", "afl").cache_key();
        assert_ne!(a, b);
        assert_eq!(ArtifactId::target("libpng").to_string(), "target:libpng");
        assert_eq!(TrialKey::new("libpng", "afl", 3).to_string(), "libpng/afl#3");
    }
}
