use fuzzlab_core::{ArtifactId, BuildError};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Produces named, cacheable artifacts from build descriptions located by
/// artifact identity.
pub trait BuildBackend: Send + Sync {
    fn build(&self, artifact: &ArtifactId) -> Result<(), BuildError>;

    /// Whether a previously built artifact is still present in the store.
    fn exists(&self, _artifact: &ArtifactId) -> bool {
        false
    }

    /// File or directory whose contents determine the artifact's cache digest.
    fn context_dir(&self, _artifact: &ArtifactId) -> Option<PathBuf> {
        None
    }
}

/// Builds docker images: `<prefix>/base`, `<prefix>/target/<t>` and
/// `<prefix>/target/<t>/<f>`, each layered on the previous one.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    root: PathBuf,
    prefix: String,
    log_dir: Option<PathBuf>,
}

impl DockerBackend {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
            log_dir: None,
        }
    }

    /// Send build output to per-artifact log files instead of the terminal.
    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }

    pub fn tag(&self, artifact: &ArtifactId) -> String {
        image_tag(&self.prefix, artifact)
    }

    pub fn log_path(&self, artifact: &ArtifactId) -> Option<PathBuf> {
        let dir = self.log_dir.as_ref()?;
        let name = match artifact {
            ArtifactId::Base => "base.log".to_string(),
            ArtifactId::Target { name } => format!("{}.log", name),
            ArtifactId::Fuzzer { target, name } => format!("{}_{}.log", target, name),
        };
        Some(dir.join(name))
    }

    pub fn command(&self, artifact: &ArtifactId) -> Command {
        let tag = self.tag(artifact);
        let mut cmd = Command::new("docker");
        cmd.arg("build").args(["--tag", &tag]);
        cmd.args(["--build-arg", "BUILDKIT_INLINE_CACHE=1"]);
        match artifact {
            ArtifactId::Base => {
                cmd.args(["--cache-from", &tag]);
                cmd.arg(&self.root);
            }
            ArtifactId::Target { .. } => {
                cmd.args(["--build-arg", "B_SRC=/"]);
                cmd.args(["--build-arg", "B_OUT=/out"]);
                cmd.args(["--cache-from", &tag]);
                let context = self.context_path(artifact);
                cmd.arg("--file").arg(context.join("Dockerfile"));
                cmd.arg(context);
            }
            ArtifactId::Fuzzer { target, .. } => {
                let parent = image_tag(&self.prefix, &ArtifactId::target(target.clone()));
                cmd.arg("--build-arg")
                    .arg(format!("parent_image={}", parent));
                cmd.args(["--cache-from", &tag]);
                let context = self.context_path(artifact);
                cmd.arg("--file").arg(context.join("Dockerfile"));
                cmd.arg(context);
            }
        }
        cmd
    }

    fn context_path(&self, artifact: &ArtifactId) -> PathBuf {
        match artifact {
            ArtifactId::Base => self.root.clone(),
            ArtifactId::Target { name } => self.root.join("targets").join(name),
            ArtifactId::Fuzzer { name, .. } => self.root.join("fuzzers").join(name),
        }
    }

    fn redirect_output(&self, cmd: &mut Command, log_path: &Path) -> std::io::Result<()> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let log = File::create(log_path)?;
        cmd.stdout(Stdio::from(log.try_clone()?));
        cmd.stderr(Stdio::from(log));
        Ok(())
    }
}

pub fn image_tag(prefix: &str, artifact: &ArtifactId) -> String {
    match artifact {
        ArtifactId::Base => format!("{}/base", prefix),
        ArtifactId::Target { name } => format!("{}/target/{}", prefix, name),
        ArtifactId::Fuzzer { target, name } => format!("{}/target/{}/{}", prefix, target, name),
    }
}

impl BuildBackend for DockerBackend {
    fn build(&self, artifact: &ArtifactId) -> Result<(), BuildError> {
        let mut cmd = self.command(artifact);
        cmd.stdin(Stdio::null());
        let log_path = self.log_path(artifact);
        if let Some(path) = log_path.as_deref() {
            self.redirect_output(&mut cmd, path)
                .map_err(|source| BuildError::Spawn {
                    artifact: artifact.clone(),
                    source,
                })?;
        }
        tracing::debug!(%artifact, ?cmd, "docker build");
        let status = cmd.status().map_err(|source| BuildError::Spawn {
            artifact: artifact.clone(),
            source,
        })?;
        if status.success() {
            return Ok(());
        }
        let mut reason = match status.code() {
            Some(code) => format!("docker build exited with {}", code),
            None => "docker build terminated by signal".to_string(),
        };
        if let Some(path) = log_path {
            reason.push_str(&format!(" (log: {})", path.display()));
        }
        Err(BuildError::Failed {
            artifact: artifact.clone(),
            reason,
        })
    }

    fn exists(&self, artifact: &ArtifactId) -> bool {
        Command::new("docker")
            .args(["image", "inspect", &self.tag(artifact)])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn context_dir(&self, artifact: &ArtifactId) -> Option<PathBuf> {
        // The base context is the whole tree; only its Dockerfile is stamped.
        let path = match artifact {
            ArtifactId::Base => self.root.join("Dockerfile"),
            _ => self.context_path(artifact),
        };
        path.exists().then_some(path)
    }
}
