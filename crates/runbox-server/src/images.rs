//! Pre-pulling sandbox images ahead of serving.
//!
//! Sessions assume their image is already present; pulling on the hot path
//! would blow through the provisioning deadline. Operators run `runbox-server
//! pull` once per host instead.

use runbox_core::{ContainerRuntime, LanguageTable, SessionKind};
use std::collections::BTreeSet;

use crate::error::{Result, ServerError};

/// Distinct images used by `languages`, or by every language when empty.
pub fn images_for(table: &LanguageTable, languages: &[String]) -> Result<BTreeSet<String>> {
    let mut images = BTreeSet::new();
    let mut add = |profile: &runbox_core::LanguageProfile| {
        for kind in [SessionKind::Terminal, SessionKind::Run] {
            images.insert(profile.spec_for(kind).image.clone());
        }
    };

    if languages.is_empty() {
        for profile in table.sorted().values() {
            add(profile);
        }
    } else {
        for name in languages {
            let profile = table
                .get(name)
                .ok_or_else(|| ServerError::UnknownLanguage(name.clone()))?;
            add(profile);
        }
    }
    Ok(images)
}

/// Pull every image used by `languages`, stopping at the first failure.
pub async fn pull_images(
    runtime: &dyn ContainerRuntime,
    table: &LanguageTable,
    languages: &[String],
) -> Result<Vec<String>> {
    let images = images_for(table, languages)?;
    let mut pulled = Vec::with_capacity(images.len());
    for image in images {
        log::info!("Pulling image {}", image);
        runtime.pull_image(&image).await?;
        pulled.push(image);
    }
    Ok(pulled)
}
