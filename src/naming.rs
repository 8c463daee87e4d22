use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerScope {
    /// Names are used exactly as configured; one run at a time.
    #[default]
    Fixed,
    /// Names and image tags carry the short run id so runs never collide.
    PerRun,
}

/// Resolves container and image names for one run.
#[derive(Debug, Clone)]
pub struct ResourceNamer {
    scope: ContainerScope,
    suffix: String,
}

impl ResourceNamer {
    pub fn new(scope: ContainerScope, run_id: Uuid) -> Self {
        let simple = run_id.simple().to_string();
        Self {
            scope,
            suffix: simple[..8].to_string(),
        }
    }

    pub fn scope(&self) -> ContainerScope {
        self.scope
    }

    pub fn container(&self, name: &str) -> String {
        match self.scope {
            ContainerScope::Fixed => name.to_string(),
            ContainerScope::PerRun => format!("{name}-{}", self.suffix),
        }
    }

    pub fn image(&self, image: &str) -> String {
        match self.scope {
            ContainerScope::Fixed => image.to_string(),
            ContainerScope::PerRun => {
                let name_start = image.rfind('/').map(|idx| idx + 1).unwrap_or(0);
                if image[name_start..].contains(':') {
                    format!("{image}-{}", self.suffix)
                } else {
                    format!("{image}:{}", self.suffix)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_scope_keeps_names() {
        let namer = ResourceNamer::new(ContainerScope::Fixed, Uuid::new_v4());
        assert_eq!(namer.container("backend"), "backend");
        assert_eq!(namer.image("registry:5000/app:1.0"), "registry:5000/app:1.0");
    }

    #[test]
    fn per_run_scope_suffixes_names_and_tags() {
        let run_id = Uuid::parse_str("1b4e28ba-2fa1-11d2-883f-0016d3cca427").unwrap();
        let namer = ResourceNamer::new(ContainerScope::PerRun, run_id);
        assert_eq!(namer.container("backend"), "backend-1b4e28ba");
        assert_eq!(namer.image("app-backend"), "app-backend:1b4e28ba");
        assert_eq!(namer.image("app:1.0"), "app:1.0-1b4e28ba");
        assert_eq!(
            namer.image("registry:5000/app"),
            "registry:5000/app:1b4e28ba"
        );
    }
}
