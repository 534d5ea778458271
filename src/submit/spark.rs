//! `spark-submit` launcher
//!
//! Runs `spark-submit` in cluster mode with `waitAppCompletion=false`, so
//! the process exits once YARN has accepted the application. The output is
//! scanned for the application id. The whole call is bounded by
//! `timeouts.submit_seconds`; an overrun kills the process.
//!
//! Secret environment values never appear on the command line. They are
//! written to an owner-only `--properties-file` (seeded with the cluster's
//! `spark-defaults.conf`, which that flag would otherwise replace) and the
//! file is removed once the launcher exits.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use regex_lite::Regex;
use tracing::{debug, info, warn};

use crate::artifact::RuntimeEnvironment;
use crate::auth::PrincipalCredential;
use crate::config::ClusterSettings;
use crate::environment::EnvValue;

use super::{ApplicationHandle, IdentityDirective, LaunchError, LaunchRequest, ResourceManager};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Diagnostic lines kept from a failed launch
const DIAGNOSTIC_LINES: usize = 20;

/// Find `application_<cluster timestamp>_<sequence>` in launcher output
pub fn parse_application_id(output: &str) -> Option<String> {
    let re = Regex::new(r"application_\d+_\d+").ok()?;
    re.find_iter(output).last().map(|m| m.as_str().to_string())
}

/// How secret environment values are rendered into the argument vector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretArgs {
    /// Shown as the redaction marker, for printing
    Redacted,
    /// Left out; they travel in the properties file
    Omitted,
}

/// Launches through the `spark-submit` executable
pub struct SparkSubmitLauncher {
    cluster: ClusterSettings,
    credential: Option<PrincipalCredential>,
    timeout: Duration,
}

struct Finished {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

impl SparkSubmitLauncher {
    pub fn new(cluster: ClusterSettings, credential: Option<PrincipalCredential>, timeout: Duration) -> Self {
        Self {
            cluster,
            credential,
            timeout,
        }
    }

    /// Full argument vector, up to and including the entry point arguments
    pub fn build_args(&self, request: &LaunchRequest, secrets: SecretArgs) -> Vec<String> {
        self.build_args_with(request, secrets, None)
    }

    fn build_args_with(
        &self,
        request: &LaunchRequest,
        secrets: SecretArgs,
        properties_file: Option<&Path>,
    ) -> Vec<String> {
        let value = |v: &EnvValue| match (v.is_secret(), secrets) {
            (false, _) => Some(v.expose().to_string()),
            (true, SecretArgs::Redacted) => Some(v.display_value().to_string()),
            (true, SecretArgs::Omitted) => None,
        };
        let profile = &request.resources;

        let mut args = vec![
            "--master".to_string(),
            self.cluster.master.clone(),
            "--deploy-mode".to_string(),
            self.cluster.deploy_mode.clone(),
            "--name".to_string(),
            request.app_name.clone(),
            "--queue".to_string(),
            request.queue.clone(),
        ];

        match &request.identity {
            IdentityDirective::PrincipalKeytab { principal, keytab } => {
                args.push("--principal".to_string());
                args.push(principal.clone());
                args.push("--keytab".to_string());
                args.push(keytab.display().to_string());
            }
            IdentityDirective::ProxyUser { user } => {
                args.push("--proxy-user".to_string());
                args.push(user.clone());
            }
        }

        args.extend([
            "--driver-memory".to_string(),
            profile.driver_memory.to_string(),
            "--executor-memory".to_string(),
            profile.executor_memory.to_string(),
            "--driver-cores".to_string(),
            profile.driver_cores.to_string(),
            "--executor-cores".to_string(),
            profile.executor_cores.to_string(),
        ]);

        let mut conf = |key: String, val: String| {
            args.push("--conf".to_string());
            args.push(format!("{}={}", key, val));
        };

        conf("spark.driver.memoryOverhead".to_string(), profile.driver_memory_overhead.to_string());
        conf(
            "spark.executor.memoryOverhead".to_string(),
            profile.executor_memory_overhead.to_string(),
        );
        for (key, val) in &request.conf {
            conf(key.clone(), val.clone());
        }
        for (key, val) in &request.environment.shared {
            if let Some(val) = value(val) {
                conf(format!("spark.yarn.appMasterEnv.{}", key), val.clone());
                conf(format!("spark.executorEnv.{}", key), val);
            }
        }
        for (key, val) in &request.environment.coordinator_only {
            if let Some(val) = value(val) {
                conf(format!("spark.yarn.appMasterEnv.{}", key), val);
            }
        }
        if !request.environment.coordinator_jvm_options.is_empty() {
            conf(
                "spark.driver.extraJavaOptions".to_string(),
                request.environment.coordinator_jvm_options.join(" "),
            );
        }

        if !request.files.is_empty() {
            args.push("--files".to_string());
            args.push(
                request
                    .files
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }

        if let RuntimeEnvironment::Archive { path, alias } = &request.runtime {
            args.push("--archives".to_string());
            args.push(format!("{}#{}", path.display(), alias));
        }

        if !request.packages.is_empty() {
            args.push("--jars".to_string());
            args.push(request.packages.join(","));
        }

        if let Some(path) = properties_file {
            args.push("--properties-file".to_string());
            args.push(path.display().to_string());
        }

        args.push(request.entry_point.clone());
        args.extend(request.arguments.iter().cloned());
        args
    }

    /// Printable command line with secrets redacted
    pub fn command_line(&self, request: &LaunchRequest) -> String {
        std::iter::once(self.cluster.submit_command.clone())
            .chain(self.build_args(request, SecretArgs::Redacted).into_iter().map(|a| shell_quote(&a)))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// `--conf` entries carrying secret values, exposed
    pub fn secret_properties(&self, request: &LaunchRequest) -> Vec<(String, String)> {
        let mut props = Vec::new();
        for (key, val) in request.environment.shared.iter().filter(|(_, v)| v.is_secret()) {
            props.push((format!("spark.yarn.appMasterEnv.{}", key), val.expose().to_string()));
            props.push((format!("spark.executorEnv.{}", key), val.expose().to_string()));
        }
        for (key, val) in request
            .environment
            .coordinator_only
            .iter()
            .filter(|(_, v)| v.is_secret())
        {
            props.push((format!("spark.yarn.appMasterEnv.{}", key), val.expose().to_string()));
        }
        props
    }

    /// Write the secret properties file, or `None` when there are no secrets
    fn write_properties_file(&self, request: &LaunchRequest) -> io::Result<Option<PropertiesFile>> {
        let props = self.secret_properties(request);
        if props.is_empty() {
            return Ok(None);
        }

        let mut contents = String::new();
        if let Some(defaults) = &self.cluster.defaults_file {
            match fs::read_to_string(defaults) {
                Ok(text) => {
                    contents.push_str(&text);
                    if !contents.ends_with('\n') {
                        contents.push('\n');
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %defaults.display(), "no cluster defaults file")
                }
                Err(e) => return Err(e),
            }
        }
        for (key, val) in &props {
            contents.push_str(&format!("{}={}\n", escape_property(key), escape_property(val)));
        }

        let path = std::env::temp_dir().join(format!(
            ".geo-batch-submit.{}.properties",
            uuid::Uuid::new_v4().simple()
        ));
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut handle = options.open(&path)?;
        let file = PropertiesFile { path };
        handle.write_all(contents.as_bytes())?;
        handle.sync_all()?;
        Ok(Some(file))
    }

    /// Refresh the service principal's ticket; failures are only logged
    fn refresh_ticket(&self) {
        let (Some(kinit), Some(credential)) = (&self.cluster.kinit_command, &self.credential) else {
            debug!("no kinit command or credential, skipping ticket refresh");
            return;
        };

        let mut command = Command::new(kinit);
        command
            .arg("-kt")
            .arg(&credential.keytab)
            .arg(&credential.principal);

        match run_bounded(command, self.timeout) {
            Ok(done) if done.status.success() => {
                debug!(principal = %credential.principal, "ticket refreshed")
            }
            Ok(done) => warn!(
                principal = %credential.principal,
                status = %done.status,
                stderr = %tail(&done.stderr, 3),
                "ticket refresh failed"
            ),
            Err(e) => warn!(principal = %credential.principal, error = %e, "ticket refresh failed"),
        }
    }
}

impl ResourceManager for SparkSubmitLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<ApplicationHandle, LaunchError> {
        self.refresh_ticket();

        let properties = self.write_properties_file(request).map_err(LaunchError::Spawn)?;
        let mut command = Command::new(&self.cluster.submit_command);
        command.args(self.build_args_with(
            request,
            SecretArgs::Omitted,
            properties.as_ref().map(|p| p.path.as_path()),
        ));
        info!(job_id = %request.job_id, app_name = %request.app_name, "launching");

        let done = run_bounded(command, self.timeout);
        drop(properties);
        let done = done?;
        let combined = format!("{}\n{}", done.stdout, done.stderr);

        if !done.status.success() {
            return Err(classify(&tail(&done.stderr, DIAGNOSTIC_LINES)));
        }

        parse_application_id(&combined)
            .map(|application_id| ApplicationHandle { application_id })
            .ok_or_else(|| {
                LaunchError::Rejected(format!(
                    "no application id in launcher output: {}",
                    tail(&combined, DIAGNOSTIC_LINES)
                ))
            })
    }
}

/// Secret properties file, removed on drop
struct PropertiesFile {
    path: PathBuf,
}

impl Drop for PropertiesFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove properties file");
        }
    }
}

/// Escape a key or value for the Java properties format
fn escape_property(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '=' | ':' | '#' | '!' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Map a failed launch's diagnostic onto a launch error
fn classify(diagnostic: &str) -> LaunchError {
    let lower = diagnostic.to_ascii_lowercase();
    if ["gss", "kerberos", "authenticat", "accesscontrolexception", "tgt"]
        .iter()
        .any(|m| lower.contains(m))
    {
        LaunchError::Authentication(diagnostic.to_string())
    } else if ["connection refused", "unknownhost", "failed to connect", "no route to host"]
        .iter()
        .any(|m| lower.contains(m))
    {
        LaunchError::Unreachable(diagnostic.to_string())
    } else {
        LaunchError::Rejected(diagnostic.to_string())
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,#@+%".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn reader<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    })
}

/// Run `command` to completion or kill it after `timeout`
fn run_bounded(mut command: Command, timeout: Duration) -> Result<Finished, LaunchError> {
    let mut child: Child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(LaunchError::Spawn)?;

    let stdout = reader(child.stdout.take());
    let stderr = reader(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait().map_err(LaunchError::Spawn)? {
            Some(status) => break status,
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(LaunchError::Timeout(timeout));
            }
            None => thread::sleep(POLL_INTERVAL),
        }
    };

    Ok(Finished {
        status,
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactRef, ArtifactSet, FileManifest};
    use crate::auth::{IdentityMode, ImpersonationTarget};
    use crate::config::{EnvironmentSettings, ResourceDefaults, RuntimeSettings, SpeculationSettings};
    use crate::envelope::SubmissionEnvelope;
    use crate::environment::EnvironmentPropagator;
    use crate::job::JobRequestBuilder;
    use crate::mock::MockResourceManager;
    use crate::resources::{ResourceConfigBuilder, ResourceHints};
    use crate::submit::SubmissionInvoker;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn request(identity: IdentityMode) -> LaunchRequest {
        let job = JobRequestBuilder::new("alice", "/jobs/pg.json", "/out/j-1")
            .job_id("j-1")
            .build()
            .unwrap();
        let profile = ResourceConfigBuilder::new(ResourceDefaults::default())
            .build(&ResourceHints::default())
            .unwrap();
        let artifacts = ArtifactSet {
            extensions: ArtifactRef::Local(PathBuf::from("/work/geotrellis-extensions-2.4.0.jar")),
            backend_assembly: ArtifactRef::Remote("https://example.org/assembly.jar".to_string()),
            logging: None,
            runtime: RuntimeEnvironment::Archive {
                path: PathBuf::from("/work/venv_static.zip"),
                alias: "venv".to_string(),
            },
            manifest: FileManifest::default(),
        };
        let host: BTreeMap<String, String> = [("AWS_SECRET_ACCESS_KEY", "s3cr3t"), ("AWS_REGION", "eu")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let environment =
            EnvironmentPropagator::new(EnvironmentSettings::default(), RuntimeSettings::default(), host)
                .propagate(&job, &profile, &artifacts);
        let envelope = SubmissionEnvelope::new(&job, identity, profile, artifacts, environment, "batch_job.py", "d")
            .unwrap();

        SubmissionInvoker::new(
            ClusterSettings::default(),
            SpeculationSettings::default(),
            Arc::new(MockResourceManager::new()),
        )
        .compose(&envelope)
    }

    fn launcher() -> SparkSubmitLauncher {
        SparkSubmitLauncher::new(ClusterSettings::default(), None, Duration::from_secs(5))
    }

    fn proxied() -> IdentityMode {
        IdentityMode::Impersonation(ImpersonationTarget {
            user: "bob".to_string(),
        })
    }

    #[test]
    fn test_parse_application_id() {
        let output = "INFO Client: Submitted application application_1700000000000_0042\n\
                      INFO Client: Application report for application_1700000000000_0042 (state: ACCEPTED)";
        assert_eq!(
            parse_application_id(output).as_deref(),
            Some("application_1700000000000_0042")
        );
        assert_eq!(parse_application_id("no id here"), None);
    }

    #[test]
    fn test_args_proxy_user() {
        let args = launcher().build_args(&request(proxied()), SecretArgs::Omitted);
        let joined = args.join(" ");

        assert!(joined.starts_with("--master yarn --deploy-mode cluster"));
        assert!(joined.contains("--proxy-user bob"));
        assert!(!joined.contains("--principal"));
        assert!(!joined.contains("--keytab"));
        assert!(joined.contains("--archives /work/venv_static.zip#venv"));
        assert!(joined.contains(
            "--jars /work/geotrellis-extensions-2.4.0.jar,https://example.org/assembly.jar"
        ));
        assert!(joined.contains("spark.yarn.submit.waitAppCompletion=false"));
        assert!(joined.contains("spark.executorEnv.AWS_REGION=eu"));
        assert!(joined.contains("spark.yarn.appMasterEnv.AWS_REGION=eu"));
        assert!(joined.contains("spark.yarn.appMasterEnv.PYTHON_EGG_CACHE=./"));
        assert!(!joined.contains("spark.executorEnv.PYTHON_EGG_CACHE"));

        let tail: Vec<&str> = args.iter().rev().take(10).rev().map(String::as_str).collect();
        assert_eq!(tail[0], "batch_job.py");
        assert_eq!(tail[1], "pg.json");
        assert_eq!(tail[8], "alice");
    }

    #[test]
    fn test_args_direct_principal() {
        let direct = IdentityMode::DirectPrincipal(PrincipalCredential {
            principal: "openeo@REALM".to_string(),
            keytab: PathBuf::from("/opt/openeo.keytab"),
        });
        let joined = launcher().build_args(&request(direct), SecretArgs::Omitted).join(" ");
        assert!(joined.contains("--principal openeo@REALM --keytab /opt/openeo.keytab"));
        assert!(!joined.contains("--proxy-user"));
    }

    #[test]
    fn test_secrets_stay_off_the_command_line() {
        let request = request(proxied());
        let launcher = launcher();

        let launched = launcher.build_args(&request, SecretArgs::Omitted).join(" ");
        assert!(!launched.contains("s3cr3t"));
        assert!(!launched.contains("AWS_SECRET_ACCESS_KEY"));
        assert!(launched.contains("spark.executorEnv.AWS_REGION=eu"));

        assert_eq!(
            launcher.secret_properties(&request),
            vec![
                (
                    "spark.yarn.appMasterEnv.AWS_SECRET_ACCESS_KEY".to_string(),
                    "s3cr3t".to_string()
                ),
                ("spark.executorEnv.AWS_SECRET_ACCESS_KEY".to_string(), "s3cr3t".to_string()),
            ]
        );

        let printed = launcher.command_line(&request);
        assert!(!printed.contains("s3cr3t"));
        assert!(printed.contains("spark.executorEnv.AWS_SECRET_ACCESS_KEY=<redacted>"));
        assert!(printed.starts_with("spark-submit "));
    }

    #[test]
    fn test_escape_property() {
        assert_eq!(escape_property("plain"), "plain");
        assert_eq!(escape_property("a=b:c"), r"a\=b\:c");
        assert_eq!(escape_property("line\nbreak\\"), r"line\nbreak\\");
    }

    #[test]
    fn test_properties_file_carries_defaults_and_secrets() {
        let dir = tempfile::TempDir::new().unwrap();
        let defaults = dir.path().join("spark-defaults.conf");
        fs::write(&defaults, "spark.eventLog.enabled true").unwrap();

        let mut cluster = ClusterSettings::default();
        cluster.defaults_file = Some(defaults);
        let launcher = SparkSubmitLauncher::new(cluster, None, Duration::from_secs(5));

        let file = launcher.write_properties_file(&request(proxied())).unwrap().unwrap();
        let path = file.path.clone();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("spark.eventLog.enabled true\n"));
        assert!(contents.contains("spark.executorEnv.AWS_SECRET_ACCESS_KEY=s3cr3t\n"));
        assert!(!contents.contains("AWS_REGION"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        drop(file);
        assert!(!path.exists());
    }

    #[test]
    fn test_no_properties_file_without_secrets() {
        let mut request = request(proxied());
        request.environment.shared.retain(|_, v| !v.is_secret());
        assert!(launcher().write_properties_file(&request).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_launch_passes_secrets_by_file_and_removes_it() {
        let mut cluster = ClusterSettings::default();
        cluster.submit_command = "echo".to_string();
        cluster.kinit_command = None;
        cluster.defaults_file = None;
        let launcher = SparkSubmitLauncher::new(cluster, None, Duration::from_secs(10));

        // echo prints its arguments, which end up in the diagnostic
        let err = launcher.launch(&request(proxied())).unwrap_err();
        let output = match err {
            LaunchError::Rejected(output) => output,
            other => panic!("unexpected error: {other}"),
        };
        assert!(!output.contains("s3cr3t"));

        let words: Vec<&str> = output.split_whitespace().collect();
        let at = words.iter().position(|w| *w == "--properties-file").unwrap();
        assert!(!Path::new(words[at + 1]).exists());
    }

    #[test]
    fn test_classify_diagnostics() {
        assert!(matches!(
            classify("javax.security.sasl.SaslException: GSS initiate failed"),
            LaunchError::Authentication(_)
        ));
        assert!(matches!(
            classify("java.net.ConnectException: Connection refused"),
            LaunchError::Unreachable(_)
        ));
        assert!(matches!(
            classify("Queue urgent does not exist"),
            LaunchError::Rejected(_)
        ));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("--master"), "--master");
        assert_eq!(shell_quote("openEO batch_j-1_user alice"), "'openEO batch_j-1_user alice'");
        assert_eq!(shell_quote(r#"["job-17"]"#), r#"'["job-17"]'"#);
    }

    #[cfg(unix)]
    #[test]
    fn test_launch_through_fake_submit_command() {
        let mut cluster = ClusterSettings::default();
        cluster.submit_command = "echo".to_string();
        cluster.kinit_command = None;
        cluster.defaults_file = None;
        let launcher = SparkSubmitLauncher::new(cluster, None, Duration::from_secs(10));

        // echo prints its arguments; no application id among them
        let err = launcher.launch(&request(proxied())).unwrap_err();
        assert!(matches!(err, LaunchError::Rejected(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_launch_missing_executable() {
        let mut cluster = ClusterSettings::default();
        cluster.submit_command = "/nonexistent/spark-submit".to_string();
        cluster.kinit_command = None;
        let launcher = SparkSubmitLauncher::new(cluster, None, Duration::from_secs(1));
        assert!(matches!(
            launcher.launch(&request(proxied())),
            Err(LaunchError::Spawn(_))
        ));
    }
}
