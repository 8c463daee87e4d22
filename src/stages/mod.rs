use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::StageError;
use crate::pipeline::{Stage, StageContext, StageParameters, StageRegistry, StageReport};
use crate::process::Invocation;

pub mod container;

pub const DEFAULT_GATE_TIMEOUT: Duration = Duration::from_secs(120);

pub fn register_defaults(registry: &mut StageRegistry) {
    registry.register("checkout", |params| {
        Ok(Box::new(CheckoutStage::from_params(params)?))
    });
    registry.register("build", |params| {
        Ok(Box::new(BuildStage::from_params(params)?))
    });
    registry.register("analysis", |params| {
        Ok(Box::new(AnalysisStage::from_params(params)?))
    });
    registry.register("quality_gate", |params| {
        Ok(Box::new(QualityGateStage::from_params(params)?))
    });
    registry.register("shell", |params| {
        Ok(Box::new(ShellStage::from_params(params)?))
    });
    container::register(registry);
}

struct CheckoutStage {
    repository: String,
    branch: String,
    depth: Option<u32>,
}

impl CheckoutStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let repository = take_string(&mut params, "repository")
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| anyhow!("checkout stage requires 'repository' parameter"))?;
        let branch = take_string(&mut params, "branch").unwrap_or_else(|| "main".to_string());
        let depth = take_u32(&mut params, "depth")?;
        reject_unknown("checkout", &params)?;
        Ok(Self {
            repository,
            branch,
            depth,
        })
    }

    fn git(workspace: &Path) -> Invocation {
        Invocation::new("git")
            .arg("-C")
            .arg(workspace.to_string_lossy())
    }
}

impl Stage for CheckoutStage {
    fn kind(&self) -> &'static str {
        "checkout"
    }

    fn run(&self, ctx: &StageContext<'_>, report: &mut StageReport) -> Result<(), StageError> {
        let workspace = ctx.workspace;
        let depth = self.depth.map(|depth| format!("--depth={depth}"));

        if workspace.join(".git").is_dir() {
            info!(branch = self.branch.as_str(), "Updating existing checkout");
            ctx.execute(
                report,
                Self::git(workspace).args(["remote", "set-url", "origin", self.repository.as_str()]),
            )
            .map_err(StageError::Checkout)?;
            ctx.execute(
                report,
                Self::git(workspace)
                    .args(["fetch", "--prune"])
                    .args(depth.clone())
                    .args(["origin", self.branch.as_str()]),
            )
            .map_err(StageError::Checkout)?;
            ctx.execute(
                report,
                Self::git(workspace).args(["checkout", "--force", "-B", self.branch.as_str(), "FETCH_HEAD"]),
            )
            .map_err(StageError::Checkout)?;
        } else {
            if let Some(parent) = workspace.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).map_err(|err| {
                    StageError::Checkout(format!(
                        "cannot create workspace parent {}: {err}",
                        parent.display()
                    ))
                })?;
            }
            info!(branch = self.branch.as_str(), "Cloning repository");
            ctx.execute(
                report,
                Invocation::new("git")
                    .args(["clone", "--branch", self.branch.as_str(), "--single-branch"])
                    .args(depth)
                    .arg(&self.repository)
                    .arg(workspace.to_string_lossy()),
            )
            .map_err(StageError::Checkout)?;
        }

        let head = ctx
            .execute(report, Self::git(workspace).args(["rev-parse", "HEAD"]))
            .map_err(StageError::Checkout)?;
        let commit = head.stdout.trim();
        if !commit.is_empty() {
            info!(commit, "Checked out revision");
            report.line(format!("Checked out {} at {commit}", self.branch));
        }
        Ok(())
    }
}

struct BuildStage {
    program: String,
    args: Vec<String>,
    dir: Option<String>,
    env: BTreeMap<String, String>,
    artifact: Option<String>,
}

impl BuildStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let program = take_string(&mut params, "program").unwrap_or_else(|| "mvn".to_string());
        let mut args = take_string_list(&mut params, "args")?
            .unwrap_or_else(|| vec!["clean".to_string(), "package".to_string()]);
        let skip_tests = take_bool(&mut params, "skip_tests")?.unwrap_or(true);
        if skip_tests && is_maven(&program) && !args.iter().any(|arg| arg.starts_with("-DskipTests"))
        {
            args.push("-DskipTests".to_string());
        }
        let dir = take_string(&mut params, "dir");
        let env = take_string_map(&mut params, "env")?;
        let artifact = take_string(&mut params, "artifact");
        if let Some(pattern) = &artifact {
            glob::Pattern::new(pattern)
                .map_err(|err| anyhow!("build stage 'artifact' is not a valid glob: {err}"))?;
        }
        reject_unknown("build", &params)?;
        Ok(Self {
            program,
            args,
            dir,
            env,
            artifact,
        })
    }
}

impl Stage for BuildStage {
    fn kind(&self) -> &'static str {
        "build"
    }

    fn run(&self, ctx: &StageContext<'_>, report: &mut StageReport) -> Result<(), StageError> {
        let dir = ctx.resolve(self.dir.as_deref());
        ctx.execute(
            report,
            Invocation::new(&self.program)
                .args(self.args.iter().cloned())
                .current_dir(&dir)
                .envs(&self.env),
        )
        .map_err(StageError::Build)?;

        if let Some(pattern) = &self.artifact {
            let full = dir.join(pattern);
            let matches: Vec<_> = glob::glob(&full.to_string_lossy())
                .map_err(|err| StageError::Build(format!("invalid artifact pattern: {err}")))?
                .filter_map(|entry| entry.ok())
                .filter(|path| path.is_file())
                .collect();
            if matches.is_empty() {
                return Err(StageError::Build(format!(
                    "no build output matched '{}'",
                    full.display()
                )));
            }
            for path in &matches {
                report.line(format!("Artifact: {}", path.display()));
            }
        }
        Ok(())
    }
}

struct AnalysisStage {
    program: String,
    dir: Option<String>,
    project_key: String,
    project_name: Option<String>,
    host_url: String,
    token_env: String,
    token_property: String,
    args: Vec<String>,
}

impl AnalysisStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let program = take_string(&mut params, "program").unwrap_or_else(|| "mvn".to_string());
        let project_key = take_string(&mut params, "project_key")
            .ok_or_else(|| anyhow!("analysis stage requires 'project_key' parameter"))?;
        let host_url = take_string(&mut params, "host_url")
            .ok_or_else(|| anyhow!("analysis stage requires 'host_url' parameter"))?;
        let project_name = take_string(&mut params, "project_name");
        let token_env =
            take_string(&mut params, "token_env").unwrap_or_else(|| "SONAR_TOKEN".to_string());
        let token_property = take_string(&mut params, "token_property")
            .unwrap_or_else(|| "sonar.token".to_string());
        let dir = take_string(&mut params, "dir");
        let args = take_string_list(&mut params, "args")?.unwrap_or_default();
        reject_unknown("analysis", &params)?;
        Ok(Self {
            program,
            dir,
            project_key,
            project_name,
            host_url,
            token_env,
            token_property,
            args,
        })
    }
}

impl Stage for AnalysisStage {
    fn kind(&self) -> &'static str {
        "analysis"
    }

    fn run(&self, ctx: &StageContext<'_>, report: &mut StageReport) -> Result<(), StageError> {
        ctx.gates.reset(&self.project_key);

        let mut invocation = Invocation::new(&self.program).current_dir(ctx.resolve(self.dir.as_deref()));
        if is_maven(&self.program) {
            invocation = invocation.arg("sonar:sonar");
        }
        invocation = invocation
            .arg(format!("-Dsonar.projectKey={}", self.project_key))
            .arg(format!("-Dsonar.host.url={}", self.host_url));
        if let Some(name) = &self.project_name {
            invocation = invocation.arg(format!("-Dsonar.projectName={name}"));
        }
        match std::env::var(&self.token_env) {
            Ok(token) if !token.is_empty() => {
                invocation = invocation
                    .arg(format!("-D{}={token}", self.token_property))
                    .secret(token);
            }
            _ => {
                warn!(
                    token_env = self.token_env.as_str(),
                    "Analysis token not set; running unauthenticated"
                );
                report.line(format!("{} is not set; analysis runs unauthenticated", self.token_env));
            }
        }
        invocation = invocation.args(self.args.iter().cloned());

        ctx.execute(report, invocation)
            .map_err(StageError::Analysis)?;
        Ok(())
    }
}

struct QualityGateStage {
    project_key: String,
}

impl QualityGateStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let project_key = take_string(&mut params, "project_key")
            .ok_or_else(|| anyhow!("quality_gate stage requires 'project_key' parameter"))?;
        reject_unknown("quality_gate", &params)?;
        Ok(Self { project_key })
    }
}

impl Stage for QualityGateStage {
    fn kind(&self) -> &'static str {
        "quality_gate"
    }

    fn run(&self, ctx: &StageContext<'_>, report: &mut StageReport) -> Result<(), StageError> {
        let timeout = ctx.timeout.unwrap_or(DEFAULT_GATE_TIMEOUT);
        info!(
            project = self.project_key.as_str(),
            timeout_secs = timeout.as_secs(),
            "Waiting for quality gate"
        );
        report.line(format!(
            "Waiting up to {}s for quality gate of '{}'",
            timeout.as_secs(),
            self.project_key
        ));

        let Some(result) = ctx.gates.wait(&self.project_key, timeout) else {
            return Err(StageError::QualityGateTimeout {
                project: self.project_key.clone(),
                timeout,
            });
        };

        report.line(format!(
            "Quality gate status {} (analysed at {})",
            result.gate_status,
            result.analysed_at.to_rfc3339()
        ));
        for condition in &result.failed_conditions {
            report.line(format!(
                "  {} is {} (value {}, threshold {})",
                condition.metric,
                condition.status,
                condition.value.as_deref().unwrap_or("-"),
                condition.threshold.as_deref().unwrap_or("-")
            ));
        }

        let passed = result.passed();
        let status = result.gate_status.clone();
        report.gate = Some(result);
        if passed {
            Ok(())
        } else {
            Err(StageError::QualityGateRejected {
                project: self.project_key.clone(),
                status,
            })
        }
    }
}

struct ShellStage {
    command: String,
    dir: Option<String>,
    env: BTreeMap<String, String>,
}

impl ShellStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let command = take_string(&mut params, "command")
            .filter(|command| !command.trim().is_empty())
            .ok_or_else(|| anyhow!("shell stage requires 'command' parameter"))?;
        let dir = take_string(&mut params, "dir");
        let env = take_string_map(&mut params, "env")?;
        reject_unknown("shell", &params)?;
        Ok(Self { command, dir, env })
    }
}

impl Stage for ShellStage {
    fn kind(&self) -> &'static str {
        "shell"
    }

    fn run(&self, ctx: &StageContext<'_>, report: &mut StageReport) -> Result<(), StageError> {
        ctx.execute(
            report,
            Invocation::new("sh")
                .arg("-c")
                .arg(&self.command)
                .current_dir(ctx.resolve(self.dir.as_deref()))
                .envs(&self.env),
        )
        .map_err(StageError::Step)?;
        Ok(())
    }
}

fn is_maven(program: &str) -> bool {
    let name = Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(program);
    matches!(name, "mvn" | "mvnw" | "mvn.cmd" | "mvnw.cmd")
}

pub(crate) fn reject_unknown(stage: &str, params: &StageParameters) -> Result<()> {
    if params.is_empty() {
        return Ok(());
    }
    let mut keys: Vec<_> = params.keys().map(String::as_str).collect();
    keys.sort();
    bail!("{stage} stage does not accept parameter(s): {}", keys.join(", "))
}

fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(num) => num.as_u64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Some(true),
            "false" | "no" | "off" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn value_as_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

pub(crate) fn take_string(params: &mut StageParameters, key: &str) -> Option<String> {
    params.remove(key).and_then(|value| match value {
        Value::Null => None,
        other => Some(value_as_string(other)),
    })
}

pub(crate) fn take_u32(params: &mut StageParameters, key: &str) -> Result<Option<u32>> {
    let Some(value) = params.remove(key) else {
        return Ok(None);
    };
    let parsed: Option<u32> = match &value {
        Value::Null => return Ok(None),
        Value::Number(num) => num.as_u64().and_then(|n| n.try_into().ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed
        .map(Some)
        .ok_or_else(|| anyhow!("'{key}' must be a non-negative integer, got {value}"))
}

pub(crate) fn take_bool(params: &mut StageParameters, key: &str) -> Result<Option<bool>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value_as_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("'{key}' must be true or false, got {value}")),
    }
}

pub(crate) fn take_string_list(
    params: &mut StageParameters,
    key: &str,
) -> Result<Option<Vec<String>>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => Ok(Some(items.into_iter().map(value_as_string).collect())),
        Some(Value::String(s)) => Ok(Some(s.split_whitespace().map(str::to_string).collect())),
        Some(other) => bail!("'{key}' must be a list of strings, got {other}"),
    }
}

pub(crate) fn take_string_map(
    params: &mut StageParameters,
    key: &str,
) -> Result<BTreeMap<String, String>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::Object(map)) => Ok(map
            .into_iter()
            .map(|(k, v)| (k, value_as_string(v)))
            .collect()),
        Some(other) => bail!("'{key}' must be a mapping, got {other}"),
    }
}
