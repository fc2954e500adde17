// Release Resolver
// Reads the release feed, picks the installable asset of the latest release
// and compares its version against the running one

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

use crate::auto_update::{AppInfo, ReleaseInfo, Transfer, UpdateError, UpdateTarget, UpdaterConfig};

/// Release as served by the feed (GitHub "latest release" shape)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedRelease {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<FeedAsset>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedAsset {
    pub name: String,
    pub browser_download_url: String,
}

/// Strip surrounding whitespace and one leading `v`/`V` from a release tag
pub fn normalize_tag(tag: &str) -> &str {
    let tag = tag.trim();
    tag.strip_prefix('v')
        .or_else(|| tag.strip_prefix('V'))
        .unwrap_or(tag)
}

/// Parse `major.minor.patch`; missing minor/patch count as 0
pub fn parse_version(version: &str) -> Result<semver::Version, UpdateError> {
    let version = normalize_tag(version);
    if let Ok(parsed) = semver::Version::parse(version) {
        return Ok(parsed);
    }

    // Tags like "2" or "1.4" are not strict semver
    let core = version.split(['-', '+']).next().unwrap_or_default();
    let mut parts = core.split('.');
    let mut next = || -> Result<u64, UpdateError> {
        match parts.next() {
            None => Ok(0),
            Some(part) => part
                .parse()
                .map_err(|_| UpdateError::Decode(format!("Invalid version: {}", version))),
        }
    };
    let (major, minor, patch) = (next()?, next()?, next()?);
    if parts.next().is_some() || core.is_empty() {
        return Err(UpdateError::Decode(format!("Invalid version: {}", version)));
    }
    Ok(semver::Version::new(major, minor, patch))
}

/// Compare two versions on major.minor.patch only
pub fn compare_versions(current: &str, candidate: &str) -> Result<Ordering, UpdateError> {
    let current = parse_version(current)?;
    let candidate = parse_version(candidate)?;
    Ok((candidate.major, candidate.minor, candidate.patch).cmp(&(
        current.major,
        current.minor,
        current.patch,
    )))
}

/// Whether `candidate` is strictly newer than `current`
///
/// Unparsable versions are never newer.
pub fn is_newer(current: &str, candidate: &str) -> bool {
    matches!(compare_versions(current, candidate), Ok(Ordering::Greater))
}

/// Decide what `release` means for a build running `current_version`
///
/// # Returns
/// * `Ok(Some(ReleaseInfo))` - Newer release with an asset ending in `package_extension`
/// * `Ok(None)` - Release is not newer
/// * `Err(UpdateError::NoAssetFound)` - Newer release without an installable asset
/// * `Err(UpdateError::Decode)` - Tag is not a version
pub fn select_update(
    release: &FeedRelease,
    current_version: &str,
    package_extension: &str,
) -> Result<Option<ReleaseInfo>, UpdateError> {
    let version = normalize_tag(&release.tag_name).to_string();
    if compare_versions(current_version, &version)? != Ordering::Greater {
        return Ok(None);
    }

    let asset = release
        .assets
        .iter()
        .find(|asset| asset.name.ends_with(package_extension))
        .ok_or_else(|| UpdateError::NoAssetFound {
            version: version.clone(),
        })?;

    Ok(Some(ReleaseInfo {
        version,
        download_url: asset.browser_download_url.clone(),
    }))
}

/// Checks the release feed for a newer packaged build
pub struct ReleaseResolver {
    feed_url: String,
    package_extension: String,
    transfer: Transfer,
    app_info: Arc<dyn AppInfo>,
}

impl ReleaseResolver {
    pub fn new(config: &UpdaterConfig, transfer: Transfer, app_info: Arc<dyn AppInfo>) -> Self {
        Self {
            feed_url: config.feed_url.clone(),
            package_extension: config.package_extension.clone(),
            transfer,
            app_info,
        }
    }

    pub fn feed_url(&self) -> &str {
        &self.feed_url
    }

    /// Fetch and decode the latest release from the feed
    pub async fn fetch_release(&self) -> Result<FeedRelease, UpdateError> {
        self.transfer.fetch_json(&self.feed_url).await
    }

    /// Check for an update
    ///
    /// # Returns
    /// * `Ok(Some(UpdateTarget))` - A newer packaged build can be installed
    /// * `Ok(None)` - Checked, nothing to install (up to date, development
    ///   build, or newer release without a package)
    /// * `Err(UpdateError)` - Could not check (feed unreachable or malformed)
    pub async fn check_for_update(&self) -> Result<Option<UpdateTarget>, UpdateError> {
        if !self.app_info.is_packaged() {
            log::debug!("[Updater] Not a packaged build, skipping update check");
            return Ok(None);
        }

        let release = self.fetch_release().await?;
        let current_version = self.app_info.current_version();

        match select_update(&release, &current_version, &self.package_extension) {
            Ok(Some(info)) => {
                log::info!("[Updater] New version available: {}", info.version);
                Ok(Some(info.into()))
            }
            Ok(None) => {
                log::info!("[Updater] No updates available.");
                Ok(None)
            }
            Err(UpdateError::NoAssetFound { version }) => {
                log::warn!(
                    "[Updater] Release {} has no {} asset, treating as no update",
                    version,
                    self.package_extension
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
