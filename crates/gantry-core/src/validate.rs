//! Offline bootstrap validation with an Envoy binary.

use std::{
    ffi::OsString,
    io::{self, Read, Write},
    path::PathBuf,
    process::{Command, Stdio},
    time::{Duration, Instant},
};

use serde::Deserialize;

use crate::{Error, Result};

/// The environment variable that overrides the path to the Envoy binary.
pub const ENVOY_PATH_ENV: &str = "ENVOY_BINARY_PATH";

/// Where Envoy is expected to live when [ENVOY_PATH_ENV] isn't set.
pub const DEFAULT_ENVOY_PATH: &str = "/usr/local/bin/envoy";

const ENVOY_VALIDATE_ARGS: &[&str] = &[
    "--mode",
    "validate",
    "--config-path",
    "/dev/stdin",
    "-l",
    "critical",
    "--log-format",
    "%v",
];

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for a [Validator].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// The path to the Envoy binary.
    pub envoy_path: PathBuf,

    /// How long to let Envoy run before giving up on it. There is no limit by
    /// default.
    pub timeout: Option<Duration>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            envoy_path: PathBuf::from(DEFAULT_ENVOY_PATH),
            timeout: None,
        }
    }
}

impl ValidatorConfig {
    /// Build a config using the Envoy path from the environment, if one is
    /// set.
    pub fn from_env() -> Self {
        Self::with_envoy_path(std::env::var_os(ENVOY_PATH_ENV))
    }

    fn with_envoy_path(envoy_path: Option<OsString>) -> Self {
        match envoy_path {
            Some(path) if !path.is_empty() => Self {
                envoy_path: PathBuf::from(path),
                ..Default::default()
            },
            _ => Self::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A single run of an external program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub stdin: Vec<u8>,
    pub timeout: Option<Duration>,
}

/// The result of a program that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// The exit code of the process, or `None` if it was killed by a signal.
    pub exit_code: Option<i32>,

    /// Everything the process wrote to stderr. Stdout is never captured.
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Something that can run an external program.
///
/// Implementations must return an error with [io::ErrorKind::NotFound] when
/// the program doesn't exist, and should return [io::ErrorKind::TimedOut] if
/// the program runs past its timeout.
pub trait ProcessRunner: Send + Sync {
    fn run(&self, invocation: &Invocation) -> io::Result<ProcessOutput>;
}

/// A [ProcessRunner] that runs real processes with [std::process].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> io::Result<ProcessOutput> {
        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        // stdin and stderr are both pipes, so feed and drain them on their own
        // threads. a child blocked writing to a full stderr pipe never finishes
        // reading stdin.
        let mut stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let input = invocation.stdin.clone();
        let writer = std::thread::spawn(move || match stdin.write_all(&input) {
            // the process is allowed to exit without reading all of its input
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
            res => res,
        });

        let mut stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;
        let reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).map(|_| buf)
        });

        let status = match invocation.timeout {
            Some(timeout) => wait_with_timeout(&mut child, timeout)?,
            None => child.wait()?,
        };

        join_io(writer)??;
        let stderr = join_io(reader)??;

        Ok(ProcessOutput {
            exit_code: status.code(),
            stderr,
        })
    }
}

fn missing_pipe(name: &str) -> io::Error {
    io::Error::other(format!("child process has no {name} pipe"))
}

fn join_io<T>(handle: std::thread::JoinHandle<T>) -> io::Result<T> {
    handle
        .join()
        .map_err(|_| io::Error::other("child process io thread panicked"))
}

fn wait_with_timeout(
    child: &mut std::process::Child,
    timeout: Duration,
) -> io::Result<std::process::ExitStatus> {
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }

        if Instant::now() >= deadline {
            child.kill()?;
            child.wait()?;
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("process did not exit within {timeout:?}"),
            ));
        }

        std::thread::sleep(WAIT_POLL_INTERVAL);
    }
}

/// Validates bootstraps by running Envoy in `validate` mode.
///
/// Validation is skipped, with a warning, when there's no Envoy binary at the
/// configured path. Environments without Envoy still work, they just don't get
/// the extra check.
pub struct Validator {
    config: ValidatorConfig,
    runner: Box<dyn ProcessRunner>,
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(ValidatorConfig::default())
    }
}

impl Validator {
    /// Create a validator that runs Envoy as a real process.
    pub fn new(config: ValidatorConfig) -> Self {
        Self::with_runner(config, SystemRunner)
    }

    /// Create a validator that runs Envoy with a custom [ProcessRunner].
    pub fn with_runner(config: ValidatorConfig, runner: impl ProcessRunner + 'static) -> Self {
        Self {
            config,
            runner: Box::new(runner),
        }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Validate a serialized bootstrap.
    ///
    /// Returns [Error::Rejected] with Envoy's output and the bootstrap if Envoy
    /// exits with anything but success.
    pub fn validate(&self, bootstrap: &str) -> Result<()> {
        let invocation = Invocation {
            program: self.config.envoy_path.clone(),
            args: ENVOY_VALIDATE_ARGS.iter().map(|s| s.to_string()).collect(),
            stdin: bootstrap.as_bytes().to_vec(),
            timeout: self.config.timeout,
        };

        tracing::debug!(
            envoy_path = %invocation.program.display(),
            bootstrap_length = bootstrap.len(),
            "validating bootstrap",
        );

        let output = match self.runner.run(&invocation) {
            Ok(output) => output,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(
                    envoy_path = %invocation.program.display(),
                    "envoy binary not found, skipping bootstrap validation",
                );
                return Ok(());
            }
            Err(e) => return Err(Error::Io(e)),
        };

        if output.success() {
            tracing::debug!("bootstrap accepted");
            return Ok(());
        }

        let output_text = String::from_utf8_lossy(&output.stderr).trim().to_string();
        tracing::debug!(
            exit_code = ?output.exit_code,
            output = %output_text,
            "bootstrap rejected",
        );
        Err(Error::Rejected {
            exit_code: output.exit_code,
            output: output_text,
            bootstrap: bootstrap.to_string(),
        })
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::test::capture_logs;

    #[derive(Clone)]
    struct FakeRunner {
        result: Arc<dyn Fn() -> io::Result<ProcessOutput> + Send + Sync>,
        invocations: Arc<Mutex<Vec<Invocation>>>,
    }

    impl FakeRunner {
        fn new(result: impl Fn() -> io::Result<ProcessOutput> + Send + Sync + 'static) -> Self {
            Self {
                result: Arc::new(result),
                invocations: Default::default(),
            }
        }

        fn exiting(exit_code: i32, stderr: &'static str) -> Self {
            Self::new(move || {
                Ok(ProcessOutput {
                    exit_code: Some(exit_code),
                    stderr: stderr.as_bytes().to_vec(),
                })
            })
        }

        fn invocations(&self) -> Vec<Invocation> {
            self.invocations.lock().unwrap().clone()
        }
    }

    impl ProcessRunner for FakeRunner {
        fn run(&self, invocation: &Invocation) -> io::Result<ProcessOutput> {
            self.invocations.lock().unwrap().push(invocation.clone());
            (self.result)()
        }
    }

    #[test]
    fn test_config_from_env_value() {
        assert_eq!(
            ValidatorConfig::with_envoy_path(None),
            ValidatorConfig::default()
        );
        assert_eq!(
            ValidatorConfig::with_envoy_path(Some(OsString::new())),
            ValidatorConfig::default()
        );
        assert_eq!(
            ValidatorConfig::with_envoy_path(Some("/opt/envoy/bin/envoy".into())).envoy_path,
            PathBuf::from("/opt/envoy/bin/envoy"),
        );
        assert_eq!(
            ValidatorConfig::default().envoy_path,
            PathBuf::from("/usr/local/bin/envoy")
        );
    }

    #[test]
    fn test_config_deserialize() {
        let config: ValidatorConfig =
            serde_json::from_str(r#"{"envoy_path": "/bin/envoy"}"#).unwrap();
        assert_eq!(config.envoy_path, PathBuf::from("/bin/envoy"));
        assert_eq!(config.timeout, None);

        let config: ValidatorConfig =
            serde_json::from_str(r#"{"timeout": {"secs": 5, "nanos": 0}}"#).unwrap();
        assert_eq!(config.envoy_path, PathBuf::from(DEFAULT_ENVOY_PATH));
        assert_eq!(config.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_validate_accepted() {
        let runner = FakeRunner::exiting(0, "");
        let config = ValidatorConfig {
            envoy_path: "/test/envoy".into(),
            timeout: Some(Duration::from_secs(3)),
        };
        let validator = Validator::with_runner(config, runner.clone());

        validator.validate(r#"{"node": {}}"#).unwrap();

        assert_eq!(
            runner.invocations(),
            vec![Invocation {
                program: "/test/envoy".into(),
                args: vec![
                    "--mode".to_string(),
                    "validate".to_string(),
                    "--config-path".to_string(),
                    "/dev/stdin".to_string(),
                    "-l".to_string(),
                    "critical".to_string(),
                    "--log-format".to_string(),
                    "%v".to_string(),
                ],
                stdin: br#"{"node": {}}"#.to_vec(),
                timeout: Some(Duration::from_secs(3)),
            }]
        );
    }

    #[test]
    fn test_validate_rejected() {
        let validator = Validator::with_runner(
            ValidatorConfig::default(),
            FakeRunner::exiting(1, "unknown cluster 'web'\n"),
        );

        let err = validator.validate("{}").unwrap_err();
        assert!(err.is_rejection());
        match err {
            Error::Rejected {
                exit_code,
                output,
                bootstrap,
            } => {
                assert_eq!(exit_code, Some(1));
                assert_eq!(output, "unknown cluster 'web'");
                assert_eq!(bootstrap, "{}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_validate_killed_is_rejected() {
        let validator = Validator::with_runner(
            ValidatorConfig::default(),
            FakeRunner::new(|| {
                Ok(ProcessOutput {
                    exit_code: None,
                    stderr: vec![],
                })
            }),
        );

        let err = validator.validate("{}").unwrap_err();
        assert!(matches!(err, Error::Rejected { exit_code: None, .. }));
    }

    #[test]
    fn test_validate_missing_binary_is_skipped() {
        let validator = Validator::with_runner(
            ValidatorConfig::default(),
            FakeRunner::new(|| Err(io::ErrorKind::NotFound.into())),
        );

        let (res, logs) = capture_logs(|| validator.validate("{}"));
        assert!(res.is_ok());
        assert!(logs.contains("WARN"), "missing warning: {logs}");
        assert!(logs.contains("skipping bootstrap validation"));
    }

    #[test]
    fn test_validate_io_error() {
        let validator = Validator::with_runner(
            ValidatorConfig::default(),
            FakeRunner::new(|| Err(io::ErrorKind::PermissionDenied.into())),
        );

        let err = validator.validate("{}").unwrap_err();
        assert!(!err.is_rejection());
        assert!(
            matches!(&err, Error::Io(e) if e.kind() == io::ErrorKind::PermissionDenied),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn test_system_runner_missing_binary() {
        let config = ValidatorConfig {
            envoy_path: "/this/path/does/not/exist/envoy".into(),
            timeout: None,
        };
        let validator = Validator::new(config);

        let (res, logs) = capture_logs(|| validator.validate("{}"));
        assert!(res.is_ok(), "validation should be skipped: {res:?}");
        assert!(logs.contains("envoy binary not found"), "missing warning: {logs}");
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_pipes() {
        let invocation = Invocation {
            program: "sh".into(),
            args: vec!["-c".to_string(), "cat >&2; echo ignored; exit 3".to_string()],
            stdin: b"hello envoy".to_vec(),
            timeout: None,
        };

        let output = SystemRunner.run(&invocation).unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        assert_eq!(output.stderr, b"hello envoy");
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_timeout() {
        let invocation = Invocation {
            program: "sh".into(),
            args: vec!["-c".to_string(), "exec sleep 10".to_string()],
            stdin: vec![],
            timeout: Some(Duration::from_millis(50)),
        };

        let start = Instant::now();
        let err = SystemRunner.run(&invocation).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
