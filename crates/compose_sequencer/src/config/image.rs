//! Image version overrides (`-a name:tag`)

use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// An image reference given on the command line to replace the image of
/// every service built from the same image name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppVersion {
    reference: String,
}

impl AppVersion {
    /// Full replacement reference, e.g. `registry.local/api:1.4.2`
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Image name without registry, path, tag or digest
    pub fn name(&self) -> &str {
        image_name(&self.reference)
    }
}

impl FromStr for AppVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let reference = s.trim();
        let tagged = strip_tag(reference) != reference;
        if !tagged || image_name(reference).is_empty() {
            return Err(format!(
                "Invalid app version '{}'. Expected <image>:<version>",
                s
            ));
        }
        Ok(Self {
            reference: reference.to_string(),
        })
    }
}

impl fmt::Display for AppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reference)
    }
}

/// Reference without its `:tag` and `@digest`. A colon followed by a path
/// separator belongs to a registry port, not a tag.
fn strip_tag(reference: &str) -> &str {
    let reference = reference.split('@').next().unwrap_or(reference);
    match reference.rfind(':') {
        Some(i) if !reference[i..].contains('/') => &reference[..i],
        _ => reference,
    }
}

/// Last path component of an image reference, e.g. `api` for
/// `localhost:5000/team/api:1.0`
pub fn image_name(reference: &str) -> &str {
    let repository = strip_tag(reference);
    repository.rsplit('/').next().unwrap_or(repository)
}

/// Service images to replace: service name to new reference. Versions that
/// match no service are reported and skipped.
pub fn image_overrides<'a>(
    images: impl IntoIterator<Item = (&'a str, &'a str)>,
    versions: &[AppVersion],
) -> IndexMap<String, String> {
    let mut overrides = IndexMap::new();
    let mut used = vec![false; versions.len()];

    for (service, image) in images {
        let name = image_name(image);
        if let Some(i) = versions.iter().position(|v| v.name() == name) {
            used[i] = true;
            overrides.insert(service.to_string(), versions[i].reference.clone());
        }
    }

    for (version, used) in versions.iter().zip(used) {
        if !used {
            log::warn!("No service uses image '{}'; ignoring {}", version.name(), version);
        }
    }
    overrides
}

#[derive(Serialize)]
struct OverrideFile<'a> {
    services: IndexMap<&'a str, OverrideService<'a>>,
}

#[derive(Serialize)]
struct OverrideService<'a> {
    image: &'a str,
}

/// Compose file that sets the overridden images, merged after the others
pub fn override_document(
    overrides: &IndexMap<String, String>,
) -> Result<String, serde_yaml::Error> {
    let services = overrides
        .iter()
        .map(|(service, image)| (service.as_str(), OverrideService { image: image.as_str() }))
        .collect();
    let file = OverrideFile { services };
    serde_yaml::to_string(&file)
}
