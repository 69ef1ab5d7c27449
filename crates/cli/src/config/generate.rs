//! Sample `general.yaml` / `secrets.yaml` scaffolding.

use std::path::{Path, PathBuf};

use handlebars::Handlebars;
use serde_json::json;
use tracing::info;

use super::model::HetznerMode;
use super::parser::{GENERAL_CONFIG_FILE, SECRETS_CONFIG_FILE};
use crate::error::{Error, Result};

const COMMON_GENERAL: &str = include_str!("../../templates/samples/common.general.yaml.hbs");
const COMMON_SECRETS: &str = include_str!("../../templates/samples/common.secrets.yaml");

/// Which sample to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    Aws,
    Azure,
    Hetzner(HetznerMode),
    Local,
    BareMetal,
}

impl SampleKind {
    fn slug(self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Azure => "azure",
            Self::Hetzner(HetznerMode::Hcloud) => "hetzner-hcloud",
            Self::Hetzner(HetznerMode::BareMetal) => "hetzner-bare-metal",
            Self::Hetzner(HetznerMode::Hybrid) => "hetzner-hybrid",
            Self::Local => "local",
            Self::BareMetal => "bare-metal",
        }
    }

    fn cloud_general(self) -> &'static str {
        match self {
            Self::Aws => include_str!("../../templates/samples/aws.general.yaml"),
            Self::Azure => include_str!("../../templates/samples/azure.general.yaml"),
            Self::Hetzner(HetznerMode::Hcloud) => {
                include_str!("../../templates/samples/hetzner-hcloud.general.yaml")
            }
            Self::Hetzner(HetznerMode::BareMetal) => {
                include_str!("../../templates/samples/hetzner-bare-metal.general.yaml")
            }
            Self::Hetzner(HetznerMode::Hybrid) => {
                include_str!("../../templates/samples/hetzner-hybrid.general.yaml")
            }
            Self::Local => include_str!("../../templates/samples/local.general.yaml"),
            Self::BareMetal => include_str!("../../templates/samples/bare-metal.general.yaml"),
        }
    }

    fn cloud_secrets(self) -> &'static str {
        match self {
            Self::Aws => include_str!("../../templates/samples/aws.secrets.yaml"),
            Self::Azure => include_str!("../../templates/samples/azure.secrets.yaml"),
            Self::Hetzner(HetznerMode::Hcloud) => {
                include_str!("../../templates/samples/hetzner-hcloud.secrets.yaml")
            }
            Self::Hetzner(_) => include_str!("../../templates/samples/hetzner-robot.secrets.yaml"),
            Self::Local | Self::BareMetal => "",
        }
    }
}

/// Render the sample documents for `kind`.
///
/// # Errors
///
/// Returns a template error if the embedded sample does not render.
pub fn render_sample(kind: SampleKind) -> Result<(String, String)> {
    let mut handlebars = Handlebars::new();
    handlebars.register_escape_fn(handlebars::no_escape);

    let common = handlebars.render_template(COMMON_GENERAL, &json!({ "cloud": kind.slug() }))
        .map_err(|e| Error::config(format!("failed rendering sample config: {e}")))?;

    let general = format!("{common}{}", kind.cloud_general());
    let secrets = format!("{COMMON_SECRETS}{}", kind.cloud_secrets());
    Ok((general, secrets))
}

/// Write sample `general.yaml` and `secrets.yaml` into `configs_dir`, creating it.
///
/// # Errors
///
/// Returns [`Error::StatePrecondition`] when either file exists and `force` is not set.
pub fn generate_sample_config(
    configs_dir: &Path,
    kind: SampleKind,
    force: bool,
) -> Result<Vec<PathBuf>> {
    let general_path = configs_dir.join(GENERAL_CONFIG_FILE);
    let secrets_path = configs_dir.join(SECRETS_CONFIG_FILE);

    if !force {
        if let Some(existing) = [&general_path, &secrets_path].into_iter().find(|p| p.exists()) {
            return Err(Error::precondition(format!(
                "{} already exists, pass --force to overwrite it",
                existing.display()
            )));
        }
    }

    let (general, secrets) = render_sample(kind)?;

    std::fs::create_dir_all(configs_dir)?;
    std::fs::write(&general_path, general)?;
    std::fs::write(&secrets_path, secrets)?;

    info!(dir = %configs_dir.display(), sample = kind.slug(), "Generated sample config");
    Ok(vec![general_path, secrets_path])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::GeneralConfig;
    use crate::config::secrets::SecretsConfig;
    use crate::config::CloudKind;

    const ALL: [SampleKind; 7] = [
        SampleKind::Aws,
        SampleKind::Azure,
        SampleKind::Hetzner(HetznerMode::Hcloud),
        SampleKind::Hetzner(HetznerMode::BareMetal),
        SampleKind::Hetzner(HetznerMode::Hybrid),
        SampleKind::Local,
        SampleKind::BareMetal,
    ];

    #[test]
    fn test_samples_match_the_schema() {
        for kind in ALL {
            let (general, secrets) = render_sample(kind).unwrap();
            let general: GeneralConfig = serde_yaml::from_str(&general)
                .unwrap_or_else(|e| panic!("{} general: {e}", kind.slug()));
            let _: SecretsConfig = serde_yaml::from_str(&secrets)
                .unwrap_or_else(|e| panic!("{} secrets: {e}", kind.slug()));

            let expected = match kind {
                SampleKind::Aws => CloudKind::Aws,
                SampleKind::Azure => CloudKind::Azure,
                SampleKind::Hetzner(mode) => {
                    assert_eq!(general.cloud.hetzner.as_ref().unwrap().mode, mode);
                    CloudKind::Hetzner
                }
                SampleKind::Local => CloudKind::Local,
                SampleKind::BareMetal => CloudKind::BareMetal,
            };
            assert_eq!(CloudKind::detect(&general.cloud).unwrap(), expected);
            assert!(general.cluster.name.starts_with("kubeaid-demo-"));
        }
    }

    #[test]
    fn test_refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let configs = dir.path().join("outputs").join("configs");

        let written = generate_sample_config(&configs, SampleKind::Local, false).unwrap();
        assert_eq!(written.len(), 2);

        let err = generate_sample_config(&configs, SampleKind::Aws, false).unwrap_err();
        assert!(matches!(err, Error::StatePrecondition(_)));

        generate_sample_config(&configs, SampleKind::Aws, true).unwrap();
        let general = std::fs::read_to_string(configs.join(GENERAL_CONFIG_FILE)).unwrap();
        assert!(general.contains("aws:"));
    }
}
