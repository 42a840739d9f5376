use crate::job::LaunchConfig;
use fuzzlab_core::{CancelToken, LaunchError};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::fs::File;
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const GROUP_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

pub trait TrialProcess: Send {
    fn id(&self) -> u32;

    /// Non-blocking exit check. Once reaped, keeps returning the same exit.
    fn try_wait(&mut self) -> io::Result<Option<ExitInfo>>;

    /// Terminates the whole process tree: SIGTERM to the group, up to `grace`
    /// for it to go away, then SIGKILL. A forced `cancel` cuts the grace
    /// short. Returns once the leader is reaped.
    fn terminate_tree(&mut self, grace: Duration, cancel: &CancelToken) -> io::Result<ExitInfo>;

    /// Called after the leader exited on its own. Terminates any members of
    /// the tree still running and reports whether there were any.
    fn reap_group(&mut self, _grace: Duration, _cancel: &CancelToken) -> io::Result<bool> {
        Ok(false)
    }
}

pub trait Launcher: Send + Sync {
    fn launch(&self, config: &LaunchConfig) -> Result<Box<dyn TrialProcess>, LaunchError>;
}

#[derive(Debug)]
pub struct ProcessGroup {
    child: Child,
    pgid: Pid,
}

impl ProcessGroup {
    pub fn spawn(mut cmd: Command) -> Result<Self, LaunchError> {
        let program = cmd.get_program().to_string_lossy().to_string();
        cmd.process_group(0);
        let child = cmd
            .spawn()
            .map_err(|err| LaunchError::from_spawn(&program, err))?;
        let pgid = Pid::from_raw(child.id() as i32);
        Ok(Self { child, pgid })
    }

    fn group_alive(&self) -> bool {
        killpg(self.pgid, None::<Signal>).is_ok()
    }

    fn signal_group(&self, signal: Signal) {
        if let Err(err) = killpg(self.pgid, signal) {
            tracing::debug!(pgid = %self.pgid, ?signal, error = %err, "killpg");
        }
    }
}

impl TrialProcess for ProcessGroup {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitInfo>> {
        Ok(self.child.try_wait()?.map(ExitInfo::from))
    }

    fn terminate_tree(&mut self, grace: Duration, cancel: &CancelToken) -> io::Result<ExitInfo> {
        self.signal_group(Signal::SIGTERM);
        let deadline = Instant::now().checked_add(grace);
        let mut exit = None;
        loop {
            if exit.is_none() {
                exit = self.try_wait()?;
            }
            if exit.is_some() && !self.group_alive() {
                break;
            }
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining == Some(Duration::ZERO) || cancel.is_forced() {
                tracing::warn!(
                    pgid = %self.pgid,
                    forced = cancel.is_forced(),
                    "process group still alive, killing"
                );
                self.signal_group(Signal::SIGKILL);
                break;
            }
            thread::sleep(remaining.map_or(GROUP_POLL, |r| GROUP_POLL.min(r)));
        }
        match exit {
            Some(exit) => Ok(exit),
            None => Ok(self.child.wait()?.into()),
        }
    }

    fn reap_group(&mut self, grace: Duration, cancel: &CancelToken) -> io::Result<bool> {
        if !self.group_alive() {
            return Ok(false);
        }
        tracing::warn!(pgid = %self.pgid, "leader exited with members still running");
        self.terminate_tree(grace, cancel)?;
        Ok(true)
    }
}

fn log_stdio(log: &File) -> io::Result<(Stdio, Stdio)> {
    Ok((Stdio::from(log.try_clone()?), Stdio::from(log.try_clone()?)))
}

fn open_log(config: &LaunchConfig) -> Result<File, LaunchError> {
    File::create(&config.paths.log).map_err(|err| {
        LaunchError::Prepare(format!("{}: {}", config.paths.log.display(), err))
    })
}

/// Runs each trial as `docker run` of the fuzzer image with the trial
/// directory mounted at `/data`.
#[derive(Debug, Clone)]
pub struct DockerLauncher {
    prefix: String,
}

impl DockerLauncher {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn command(&self, config: &LaunchConfig) -> Command {
        let artifact = config.key.artifact();
        let mut cmd = Command::new("docker");
        cmd.arg("run");
        cmd.args(["-e", &format!("FUZZ_TIMEOUT={}", config.timeout_arg())]);
        cmd.args(["--rm", "--cpus=1"]);
        cmd.arg(format!("--cpuset-cpus={}", config.cpu));
        cmd.args(["-v", &format!("{}:/data", config.paths.root.display())]);
        cmd.args(["--name", &config.name]);
        cmd.arg(fuzzlab_build::image_tag(&self.prefix, &artifact));
        cmd
    }
}

impl Launcher for DockerLauncher {
    fn launch(&self, config: &LaunchConfig) -> Result<Box<dyn TrialProcess>, LaunchError> {
        let mut cmd = self.command(config);
        let (stdout, stderr) = log_stdio(&open_log(config)?)?;
        cmd.stdin(Stdio::null()).stdout(stdout).stderr(stderr);
        tracing::debug!(trial = %config.key, ?cmd, "docker run");
        let group = ProcessGroup::spawn(cmd)?;
        Ok(Box::new(DockerProcess {
            group,
            name: config.name.clone(),
        }))
    }
}

/// The docker client plus the container it started. Killing the client alone
/// can leave the container running, so forced termination also removes it.
struct DockerProcess {
    group: ProcessGroup,
    name: String,
}

impl TrialProcess for DockerProcess {
    fn id(&self) -> u32 {
        self.group.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitInfo>> {
        self.group.try_wait()
    }

    fn terminate_tree(&mut self, grace: Duration, cancel: &CancelToken) -> io::Result<ExitInfo> {
        let exit = self.group.terminate_tree(grace, cancel)?;
        let removed = Command::new("docker")
            .args(["rm", "-f", &self.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(err) = removed {
            tracing::warn!(container = %self.name, error = %err, "docker rm failed");
        }
        Ok(exit)
    }

    fn reap_group(&mut self, grace: Duration, cancel: &CancelToken) -> io::Result<bool> {
        self.group.reap_group(grace, cancel)
    }
}

/// Runs a configured command on the host. Arguments may use `{target}`,
/// `{fuzzer}`, `{trial}`, `{input}`, `{output}` and `{cpu}`.
#[derive(Debug, Clone)]
pub struct LocalLauncher {
    command: Vec<String>,
}

impl LocalLauncher {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    pub fn command(&self, config: &LaunchConfig) -> Result<Command, LaunchError> {
        let mut parts = self.command.iter().map(|arg| expand(arg, config));
        let program = parts
            .next()
            .ok_or_else(|| LaunchError::Prepare("empty local command".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(parts);
        cmd.current_dir(&config.paths.root);
        cmd.env("FUZZ_TIMEOUT", config.timeout_arg());
        cmd.env("FUZZ_INPUT_DIR", &config.paths.input);
        cmd.env("FUZZ_OUTPUT_DIR", &config.paths.output);
        Ok(cmd)
    }
}

fn expand(arg: &str, config: &LaunchConfig) -> String {
    arg.replace("{target}", &config.key.target)
        .replace("{fuzzer}", &config.key.fuzzer)
        .replace("{trial}", &config.key.trial.to_string())
        .replace("{input}", &config.paths.input.to_string_lossy())
        .replace("{output}", &config.paths.output.to_string_lossy())
        .replace("{cpu}", &config.cpu.to_string())
}

#[cfg(target_os = "linux")]
fn pin_to_core(cmd: &mut Command, cpu: usize) -> Result<(), LaunchError> {
    use nix::sched::{sched_setaffinity, CpuSet};

    let mut set = CpuSet::new();
    set.set(cpu)
        .map_err(|err| LaunchError::Prepare(format!("cpu {}: {}", cpu, err)))?;
    // SAFETY: sched_setaffinity is a single syscall and allocates nothing.
    unsafe {
        cmd.pre_exec(move || sched_setaffinity(Pid::from_raw(0), &set).map_err(io::Error::from));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn pin_to_core(_cmd: &mut Command, _cpu: usize) -> Result<(), LaunchError> {
    Ok(())
}

impl Launcher for LocalLauncher {
    fn launch(&self, config: &LaunchConfig) -> Result<Box<dyn TrialProcess>, LaunchError> {
        let mut cmd = self.command(config)?;
        pin_to_core(&mut cmd, config.cpu)?;
        let (stdout, stderr) = log_stdio(&open_log(config)?)?;
        cmd.stdin(Stdio::null()).stdout(stdout).stderr(stderr);
        tracing::debug!(trial = %config.key, ?cmd, "spawn");
        Ok(Box::new(ProcessGroup::spawn(cmd)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::TrialPaths;
    use fuzzlab_core::TrialKey;
    use std::path::Path;

    fn config(data_dir: &Path) -> LaunchConfig {
        let key = TrialKey::new("libpng", "afl", 1);
        LaunchConfig {
            paths: TrialPaths::new(data_dir, &key),
            key,
            cpu: 3,
            timeout: Duration::from_secs(600),
            name: "fuzzlab-1-libpng-afl-1".to_string(),
        }
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn docker_run_pins_one_core_and_mounts_trial_dir() {
        let config = config(Path::new("/results"));
        let args = args(&DockerLauncher::new("fuzztest").command(&config));
        assert_eq!(
            args,
            vec![
                "run",
                "-e",
                "FUZZ_TIMEOUT=600",
                "--rm",
                "--cpus=1",
                "--cpuset-cpus=3",
                "-v",
                "/results/trial_1/libpng/afl:/data",
                "--name",
                "fuzzlab-1-libpng-afl-1",
                "fuzztest/target/libpng/afl",
            ]
        );
    }

    #[test]
    fn local_command_expands_placeholders() {
        let config = config(Path::new("/results"));
        let launcher = LocalLauncher::new(vec![
            "./run-{fuzzer}.sh".to_string(),
            "--target={target}".to_string(),
            "{input}".to_string(),
            "{output}".to_string(),
            "cpu{cpu}/t{trial}".to_string(),
        ]);
        let cmd = launcher.command(&config).expect("command");
        assert_eq!(cmd.get_program(), "./run-afl.sh");
        assert_eq!(
            args(&cmd),
            vec![
                "--target=libpng",
                "/results/trial_1/libpng/afl/input",
                "/results/trial_1/libpng/afl/output",
                "cpu3/t1",
            ]
        );
        let timeout = cmd
            .get_envs()
            .find(|(k, _)| *k == "FUZZ_TIMEOUT")
            .and_then(|(_, v)| v)
            .map(|v| v.to_string_lossy().to_string());
        assert_eq!(timeout.as_deref(), Some("600"));
    }

    #[test]
    fn empty_local_command_is_a_launch_error() {
        let config = config(Path::new("/results"));
        assert!(matches!(
            LocalLauncher::new(Vec::new()).command(&config),
            Err(LaunchError::Prepare(_))
        ));
    }

    #[test]
    fn missing_executable_is_not_found() {
        let err = ProcessGroup::spawn(Command::new("/nonexistent/fuzzlab-unit")).unwrap_err();
        assert!(matches!(err, LaunchError::NotFound(_)), "{}", err);
    }

    #[test]
    fn exit_info_reports_code() {
        let mut group = ProcessGroup::spawn({
            let mut cmd = Command::new("sh");
            cmd.args(["-c", "exit 7"]);
            cmd
        })
        .expect("spawn");
        let exit = loop {
            if let Some(exit) = group.try_wait().expect("try_wait") {
                break exit;
            }
            thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(exit.code, Some(7));
        assert!(!exit.success());
        assert_eq!(group.try_wait().expect("cached"), Some(exit));
    }
}
