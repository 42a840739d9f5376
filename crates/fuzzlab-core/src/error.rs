use crate::ids::ArtifactId;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{artifact}: dependency {dependency} is not ready")]
    DependencyNotReady {
        artifact: ArtifactId,
        dependency: ArtifactId,
    },
    #[error("{artifact}: build failed: {reason}")]
    Failed { artifact: ArtifactId, reason: String },
    #[error("{artifact}: spawn: {source}")]
    Spawn {
        artifact: ArtifactId,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("executable not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("failed to prepare trial: {0}")]
    Prepare(String),
    #[error("spawn: {0}")]
    Io(#[from] io::Error),
}

impl LaunchError {
    pub fn from_spawn(program: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => LaunchError::NotFound(program.to_string()),
            io::ErrorKind::PermissionDenied => LaunchError::PermissionDenied(program.to_string()),
            _ => LaunchError::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_errors_are_classified() {
        let missing = io::Error::new(io::ErrorKind::NotFound, "no such file");
        assert!(matches!(
            LaunchError::from_spawn("docker", missing),
            LaunchError::NotFound(p) if p == "docker"
        ));
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(
            LaunchError::from_spawn("./fuzz", denied),
            LaunchError::PermissionDenied(_)
        ));
        let other = io::Error::new(io::ErrorKind::Other, "boom");
        assert!(matches!(
            LaunchError::from_spawn("x", other),
            LaunchError::Io(_)
        ));
    }
}
