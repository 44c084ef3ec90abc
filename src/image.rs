//! Image reference resolution
//!
//! The setup catalog can name an image either directly
//! (`projects/<project>/global/images/<name>`) or through a family
//! (`projects/<project>/global/images/family/<family>`). Before an instance is
//! created the reference is checked against the provider; anything that
//! doesn't parse or can't be found degrades to the configured default image
//! rather than failing the create.

use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, info};

use crate::compute::ComputeService;

/// A parsed image reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageRef<'a> {
    /// A specific image
    Image {
        /// Project owning the image
        project: &'a str,
        /// Image name
        name: &'a str,
    },
    /// The latest image of a family
    Family {
        /// Project owning the family
        project: &'a str,
        /// Family name
        family: &'a str,
    },
}

fn image_path_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"projects/(.+)/global/images/(family/)*(.+)")
            .unwrap_or_else(|e| panic!("invalid image path pattern: {e}"))
    })
}

/// Parse an image path, returning `None` if it isn't structurally valid
pub fn parse_image_path(path: &str) -> Option<ImageRef<'_>> {
    let captures = image_path_pattern().captures(path)?;
    let project = captures.get(1)?.as_str();
    let name = captures.get(3)?.as_str();
    if captures.get(2).is_some() {
        Some(ImageRef::Family {
            project,
            family: name,
        })
    } else {
        Some(ImageRef::Image { project, name })
    }
}

/// Resolve `image` to a path that is known to exist
///
/// Returns `image` unchanged when the provider confirms it exists and
/// `default_image` otherwise. Never fails.
pub async fn resolve_image_path(
    compute: &dyn ComputeService,
    image: &str,
    default_image: &str,
) -> String {
    if let Some(image_ref) = parse_image_path(image) {
        let lookup = match image_ref {
            ImageRef::Image { project, name } => compute.images_get(project, name).await,
            ImageRef::Family { project, family } => {
                compute.images_get_from_family(project, family).await
            }
        };
        match lookup {
            Ok(_) => return image.to_string(),
            Err(e) => debug!(image = %image, error = %e, "Image lookup failed"),
        }
    }

    info!(
        image = %image,
        default = %default_image,
        "Could not find image, falling back to default"
    );
    default_image.to_string()
}
