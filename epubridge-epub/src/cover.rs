use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use epubridge_core::{local_path_for_url, BridgeConfig, BridgeError, BridgeResult};
use image::imageops::{self, FilterType};
use image::RgbaImage;
use png::{BitDepth, ColorType, Encoder};
use rayon::prelude::*;
use tracing::{debug, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::publication::Publication;

/// Size of a `width`×`height` image scaled to fit a guide box, keeping
/// its aspect ratio. A guide dimension of zero or less is unconstrained.
/// The source size is kept when nothing constrains it or when the guide
/// is larger in both dimensions.
pub fn fit_within(width: u32, height: u32, guide_width: f64, guide_height: f64) -> (u32, u32) {
    let sanitize = |guide: f64| if guide.is_finite() { guide } else { 0.0 };
    let (guide_width, guide_height) = (sanitize(guide_width), sanitize(guide_height));
    let (source_width, source_height) = (f64::from(width), f64::from(height));

    if (guide_width <= 0.0 && guide_height <= 0.0)
        || (guide_width > source_width && guide_height > source_height)
    {
        return (width, height);
    }

    let ratio = source_width / source_height;
    let mut target_width = if guide_width <= 0.0 { source_width } else { guide_width };
    let mut target_height = if guide_height <= 0.0 { source_height } else { guide_height };
    if target_width / target_height > ratio {
        target_width = target_height * ratio;
    } else {
        target_height = target_width / ratio;
    }

    let pixels = |value: f64| (value.round() as u32).max(1);
    (pixels(target_width), pixels(target_height))
}

pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut encoder = Encoder::new(&mut buffer, image.width(), image.height());
    encoder.set_color(ColorType::Rgba);
    encoder.set_depth(BitDepth::Eight);
    let mut writer = encoder.write_header()?;
    writer.write_image_data(image.as_raw())?;
    writer.finish()?;
    Ok(buffer)
}

fn file_uri(path: &Path) -> BridgeResult<String> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .map_err(|err| BridgeError::WriteFailed(err.into()))?
    };
    Url::from_file_path(&absolute)
        .map(String::from)
        .map_err(|_| BridgeError::WriteFailed(anyhow!("{:?} has no file URI", absolute)))
}

/// Extracts publication covers into a cache directory as PNG files.
#[derive(Debug, Clone)]
pub struct CoverService {
    cache_dir: PathBuf,
}

impl CoverService {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        Ok(Self::new(config.cover_cache_dir()?))
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Writes the cover of the publication at `path`, fitted to the guide
    /// box, to a freshly named file and returns its path.
    #[instrument(skip(self))]
    pub fn store_cover(&self, path: &Path, guide_width: f64, guide_height: f64) -> BridgeResult<PathBuf> {
        let publication = Publication::open(path).map_err(BridgeError::OpenFailed)?;
        let bytes = match publication.cover_bytes() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Err(BridgeError::NoCover),
            Err(err) => {
                warn!(?err, "declared cover could not be read");
                return Err(BridgeError::NoCover);
            }
        };
        let cover = image::load_from_memory(&bytes).map_err(|err| {
            warn!(%err, "declared cover is not a decodable image");
            BridgeError::NoCover
        })?;

        let (width, height) = fit_within(cover.width(), cover.height(), guide_width, guide_height);
        let pixels = if (width, height) == (cover.width(), cover.height()) {
            cover.to_rgba8()
        } else {
            debug!(from = ?(cover.width(), cover.height()), to = ?(width, height), "resizing cover");
            imageops::resize(&cover, width, height, FilterType::Triangle)
        };
        let encoded = encode_png(&pixels).map_err(BridgeError::WriteFailed)?;

        self.write(&encoded).map_err(BridgeError::WriteFailed)
    }

    fn write(&self, encoded: &[u8]) -> Result<PathBuf> {
        fs::create_dir_all(&self.cache_dir)
            .with_context(|| format!("failed to create cover directory {:?}", self.cache_dir))?;
        let target = self.cache_dir.join(format!("{}.png", Uuid::new_v4()));
        fs::write(&target, encoded).with_context(|| format!("failed to write cover {:?}", target))?;
        Ok(target)
    }

    /// Extracts several covers in parallel; results keep the input order.
    pub fn store_covers(
        &self,
        paths: &[PathBuf],
        guide_width: f64,
        guide_height: f64,
    ) -> Vec<BridgeResult<String>> {
        paths
            .par_iter()
            .map(|path| {
                let stored = self.store_cover(path, guide_width, guide_height)?;
                file_uri(&stored)
            })
            .collect()
    }

    /// Resolves to the `file://` URI of the stored cover. The work runs on
    /// the blocking pool.
    #[instrument(skip(self))]
    pub async fn get_cover_image(
        &self,
        file_path: &str,
        guide_width: f64,
        guide_height: f64,
    ) -> BridgeResult<String> {
        let path = local_path_for_url(file_path)?;
        let service = self.clone();
        let stored = tokio::task::spawn_blocking(move || service.store_cover(&path, guide_width, guide_height))
            .await
            .map_err(|_| BridgeError::Cancelled)??;
        file_uri(&stored)
    }
}
