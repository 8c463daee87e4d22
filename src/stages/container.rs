//! Container deployment through the docker (or podman) CLI.
//!
//! A deploy replaces whatever container currently holds the configured name:
//! remove by name, build the image from the stage's context directory, then
//! start a detached container publishing one host port.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow};
use tracing::info;

use super::{reject_unknown, take_string, take_string_map, take_u32};
use crate::error::StageError;
use crate::pipeline::{Stage, StageContext, StageParameters, StageRegistry, StageReport};
use crate::process::Invocation;

const SUPPORTED_ENGINES: [&str; 2] = ["docker", "podman"];

pub fn register(registry: &mut StageRegistry) {
    registry.register("container_deploy", |params| {
        Ok(Box::new(ContainerDeployStage::from_params(params)?))
    });
}

/// Thin wrapper over a container engine CLI.
pub struct ContainerEngine<'a, 'ctx> {
    program: &'a str,
    ctx: &'a StageContext<'ctx>,
}

impl<'a, 'ctx> ContainerEngine<'a, 'ctx> {
    pub fn new(program: &'a str, ctx: &'a StageContext<'ctx>) -> Self {
        Self { program, ctx }
    }

    /// Force-remove `name`. A missing container is not an error.
    pub fn remove(&self, report: &mut StageReport, name: &str) -> Result<bool, String> {
        let invocation = Invocation::new(self.program).args(["rm", "-f", name]);
        let output = self.ctx.run_command(report, &invocation)?;
        if output.success() {
            return Ok(!output.stdout.trim().is_empty());
        }
        if is_not_found(&output.stderr) {
            report.line(format!("No existing container named {name}"));
            return Ok(false);
        }
        Err(format!(
            "`{}` {}",
            invocation.display(),
            output.describe_failure()
        ))
    }

    pub fn build(
        &self,
        report: &mut StageReport,
        image: &str,
        context: &str,
        dockerfile: Option<&str>,
        build_args: &BTreeMap<String, String>,
    ) -> Result<(), String> {
        let mut invocation = Invocation::new(self.program).args(["build", "-t", image]);
        if let Some(dockerfile) = dockerfile {
            invocation = invocation.args(["-f", dockerfile]);
        }
        for (key, value) in build_args {
            invocation = invocation.arg("--build-arg").arg(format!("{key}={value}"));
        }
        self.ctx.execute(report, invocation.arg(context))?;
        Ok(())
    }

    pub fn run_detached(
        &self,
        report: &mut StageReport,
        name: &str,
        image: &str,
        ports: (u16, u16),
        env: &BTreeMap<String, String>,
    ) -> Result<String, String> {
        let mut invocation = Invocation::new(self.program)
            .args(["run", "-d", "--name", name, "-p"])
            .arg(format!("{}:{}", ports.0, ports.1));
        for (key, value) in env {
            invocation = invocation.arg("-e").arg(format!("{key}={value}"));
        }
        let output = self.ctx.execute(report, invocation.arg(image))?;
        Ok(output.stdout.trim().to_string())
    }
}

fn is_not_found(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    lowered.contains("no such container") || lowered.contains("no container with name")
}

struct ContainerDeployStage {
    engine: String,
    name: String,
    image: String,
    context: String,
    dockerfile: Option<String>,
    host_port: u16,
    container_port: u16,
    env: BTreeMap<String, String>,
    build_args: BTreeMap<String, String>,
}

impl ContainerDeployStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let engine = take_string(&mut params, "engine").unwrap_or_else(|| "docker".to_string());
        if !SUPPORTED_ENGINES.contains(&engine.as_str()) {
            return Err(anyhow!(
                "container_deploy engine '{engine}' is not supported (expected one of: {})",
                SUPPORTED_ENGINES.join(", ")
            ));
        }
        let name = take_string(&mut params, "name")
            .ok_or_else(|| anyhow!("container_deploy stage requires 'name' parameter"))?;
        let image = take_string(&mut params, "image")
            .ok_or_else(|| anyhow!("container_deploy stage requires 'image' parameter"))?;
        let context = take_string(&mut params, "context")
            .ok_or_else(|| anyhow!("container_deploy stage requires 'context' parameter"))?;
        let dockerfile = take_string(&mut params, "dockerfile");
        let container_port = take_port(&mut params, "container_port")?
            .ok_or_else(|| anyhow!("container_deploy stage requires 'container_port' parameter"))?;
        let host_port = take_port(&mut params, "host_port")?.unwrap_or(container_port);
        let env = take_string_map(&mut params, "env")?;
        let build_args = take_string_map(&mut params, "build_args")?;
        reject_unknown("container_deploy", &params)?;
        Ok(Self {
            engine,
            name,
            image,
            context,
            dockerfile,
            host_port,
            container_port,
            env,
            build_args,
        })
    }
}

impl Stage for ContainerDeployStage {
    fn kind(&self) -> &'static str {
        "container_deploy"
    }

    fn run(&self, ctx: &StageContext<'_>, report: &mut StageReport) -> Result<(), StageError> {
        let engine = ContainerEngine::new(&self.engine, ctx);
        let container = ctx.naming.container(&self.name);
        let image = ctx.naming.image(&self.image);
        let context = ctx.resolve(Some(&self.context));
        let dockerfile = self
            .dockerfile
            .as_deref()
            .map(|file| ctx.resolve(Some(file)).to_string_lossy().into_owned());

        let replaced = engine
            .remove(report, &container)
            .map_err(StageError::Deploy)?;
        if replaced {
            info!(container = container.as_str(), "Removed previous container");
        }

        engine
            .build(
                report,
                &image,
                &context.to_string_lossy(),
                dockerfile.as_deref(),
                &self.build_args,
            )
            .map_err(StageError::Deploy)?;

        let id = engine
            .run_detached(
                report,
                &container,
                &image,
                (self.host_port, self.container_port),
                &self.env,
            )
            .map_err(StageError::Deploy)?;

        info!(
            container = container.as_str(),
            image = image.as_str(),
            host_port = self.host_port,
            container_port = self.container_port,
            "Container started"
        );
        report.line(format!(
            "Started {container} ({}) on port {}",
            if id.is_empty() { "unknown id" } else { id.as_str() },
            self.host_port
        ));
        Ok(())
    }
}

fn take_port(params: &mut StageParameters, key: &str) -> Result<Option<u16>> {
    match take_u32(params, key)? {
        Some(port) => u16::try_from(port)
            .ok()
            .filter(|port| *port != 0)
            .map(Some)
            .ok_or_else(|| anyhow!("'{key}' must be a port between 1 and 65535")),
        None => Ok(None),
    }
}
