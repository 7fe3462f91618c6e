//! Open slide handle.
//!
//! A [`Slide`] owns everything built for one slide: the validated instances,
//! the level pyramid, the memoized frame indices and the tile cache. It is
//! only handed out once fully validated, and stops serving reads after
//! [`Slide::close`].

use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use super::collector::{group_instances, AssociatedImage, SlideExtent, SlideIdentity};
use super::frame_index::{FrameIndex, FrameIndexRegistry, TileCoord};
use super::pyramid::{Level, LevelDescriptor, LevelPyramid, LevelRequest, Point};
use crate::config::SlideConfig;
use crate::error::{FrameIndexError, OpenError, PyramidError, RegionError};
use crate::format::{
    is_whole_slide_image, Dataset, DatasetParser, DicomObjectParser, FocalPlane, FrameDecoder,
    Instance, OpticalPath, OpticalPathInfo, PaletteLut, SlideWarning, ValidationReport,
    WarningKind,
};
use crate::io::{FileRangeReader, RangeReader};
use crate::tile::{
    CacheStats, CancelToken, DecodedTile, Region, RegionRequest, RegionStitcher, TileCache,
};

/// A parsed dataset and the stream its frame ranges refer to.
pub struct InstanceSource {
    pub dataset: Box<dyn Dataset>,
    pub reader: Arc<dyn RangeReader>,
}

impl InstanceSource {
    pub fn new(dataset: impl Dataset + 'static, reader: Arc<dyn RangeReader>) -> Self {
        Self {
            dataset: Box::new(dataset),
            reader,
        }
    }
}

/// Lifecycle state of a slide handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SlideState {
    Open = 0,
    Closed = 1,
}

struct SlideInner {
    pyramid: Arc<LevelPyramid>,
    indices: Arc<FrameIndexRegistry>,
    stitcher: RegionStitcher,
    identity: SlideIdentity,
    extent: SlideExtent,
    optical_paths: Vec<OpticalPath>,
    optical_path_info: Vec<OpticalPathInfo>,
    focal_planes: Vec<FocalPlane>,
    associated_images: Vec<AssociatedImage>,
    warnings: Vec<SlideWarning>,
    state: AtomicU8,
}

/// An open whole slide image.
///
/// Cloning is cheap; clones share the same caches and state.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use wsi_mosaic::{ImageFrameDecoder, Slide, SlideConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let slide = Slide::open_paths(
///     ["slide/level0.dcm", "slide/level1.dcm"],
///     Arc::new(ImageFrameDecoder::new()),
///     SlideConfig::default(),
/// )
/// .await?;
///
/// let region = slide
///     .read_region(0, &Default::default(), Default::default(), 1000, 2000, 512, 512)
///     .await?;
/// assert_eq!(region.len(), 512 * 512 * 3);
///
/// slide.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Slide {
    inner: Arc<SlideInner>,
}

impl Slide {
    // -------------------------------------------------------------------------
    // Opening
    // -------------------------------------------------------------------------

    /// Parse every source and open the slide they form.
    ///
    /// # Errors
    ///
    /// Returns `OpenError::Dataset` if a source cannot be parsed, plus every
    /// error of [`open_datasets`](Self::open_datasets).
    pub async fn open(
        sources: Vec<Arc<dyn RangeReader>>,
        parser: &dyn DatasetParser,
        decoder: Arc<dyn FrameDecoder>,
        config: SlideConfig,
    ) -> Result<Self, OpenError> {
        config.validate()?;

        let mut parsed = Vec::with_capacity(sources.len());
        for reader in sources {
            let dataset = parser.parse(reader.as_ref()).await?;
            debug!(identifier = reader.identifier(), "Parsed dataset");
            parsed.push(InstanceSource { dataset, reader });
        }

        Self::open_datasets(parsed, decoder, config)
    }

    /// Open local DICOM files with the built-in [`DicomObjectParser`].
    ///
    /// # Errors
    ///
    /// Returns `OpenError::Io` if a file cannot be opened, plus every error
    /// of [`open`](Self::open).
    pub async fn open_paths<P: AsRef<Path>>(
        paths: impl IntoIterator<Item = P>,
        decoder: Arc<dyn FrameDecoder>,
        config: SlideConfig,
    ) -> Result<Self, OpenError> {
        Self::open_paths_with(paths, &DicomObjectParser::new(), decoder, config).await
    }

    /// Open local files through a caller-supplied parser.
    ///
    /// # Errors
    ///
    /// Same as [`open_paths`](Self::open_paths).
    pub async fn open_paths_with<P: AsRef<Path>>(
        paths: impl IntoIterator<Item = P>,
        parser: &dyn DatasetParser,
        decoder: Arc<dyn FrameDecoder>,
        config: SlideConfig,
    ) -> Result<Self, OpenError> {
        let mut sources: Vec<Arc<dyn RangeReader>> = Vec::new();
        for path in paths {
            sources.push(Arc::new(FileRangeReader::open(path).await?));
        }
        Self::open(sources, parser, decoder, config).await
    }

    /// Open a slide from already parsed datasets.
    ///
    /// Datasets that are not whole slide images are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns `OpenError::Config` for invalid configuration,
    /// `OpenError::Validation` if an instance or the set of instances is
    /// unusable, and `OpenError::InconsistentConcatenation` for broken
    /// concatenations under the fail-slide policy.
    pub fn open_datasets(
        sources: Vec<InstanceSource>,
        decoder: Arc<dyn FrameDecoder>,
        config: SlideConfig,
    ) -> Result<Self, OpenError> {
        config.validate()?;
        info!(sources = sources.len(), "Opening slide");

        let mut report = ValidationReport::new();
        let mut instances = Vec::with_capacity(sources.len());
        for source in sources {
            let dataset = source.dataset.as_ref();
            if !is_whole_slide_image(dataset) {
                report.add_warning(
                    WarningKind::UnsupportedInstance,
                    format!("{} is not a whole slide image, skipped", dataset.identifier()),
                );
                continue;
            }
            instances.push(Instance::from_dataset(
                dataset,
                source.reader,
                config.strict_attributes,
                &mut report,
            )?);
        }

        let collected = group_instances(instances, &config, &mut report)?;

        let pyramid = Arc::new(LevelPyramid::new(collected.levels));
        let indices = Arc::new(FrameIndexRegistry::new(Arc::clone(&pyramid)));
        let cache = TileCache::new(config.cache_capacity());

        let mut warnings = report.into_warnings();
        warnings.extend(cache.capacity_warning().cloned());

        let stitcher = RegionStitcher::new(
            Arc::clone(&pyramid),
            Arc::clone(&indices),
            cache,
            decoder,
            &config,
        );

        info!(
            levels = pyramid.len(),
            width = pyramid.levels()[0].width,
            height = pyramid.levels()[0].height,
            warnings = warnings.len(),
            "Opened slide"
        );

        Ok(Self {
            inner: Arc::new(SlideInner {
                pyramid,
                indices,
                stitcher,
                identity: collected.identity,
                extent: collected.extent,
                optical_paths: collected.optical_paths,
                optical_path_info: collected.optical_path_info,
                focal_planes: collected.focal_planes,
                associated_images: collected.associated_images,
                warnings,
                state: AtomicU8::new(SlideState::Open as u8),
            }),
        })
    }

    // -------------------------------------------------------------------------
    // Metadata
    // -------------------------------------------------------------------------

    /// Levels, finest first.
    pub fn levels(&self) -> &[Level] {
        self.inner.pyramid.levels()
    }

    pub fn level(&self, index: usize) -> Result<&Level, PyramidError> {
        self.inner.pyramid.level(index)
    }

    pub fn level_descriptors(&self) -> Vec<LevelDescriptor> {
        self.levels().iter().map(Level::descriptor).collect()
    }

    pub fn pyramid(&self) -> &LevelPyramid {
        &self.inner.pyramid
    }

    pub fn identity(&self) -> &SlideIdentity {
        &self.inner.identity
    }

    pub fn extent(&self) -> SlideExtent {
        self.inner.extent
    }

    pub fn optical_paths(&self) -> &[OpticalPath] {
        &self.inner.optical_paths
    }

    /// Description of an optical path, when its instances carry one.
    pub fn optical_path_info(&self, path: &OpticalPath) -> Option<&OpticalPathInfo> {
        self.inner
            .optical_path_info
            .iter()
            .find(|info| &info.identifier == path)
    }

    /// ICC profile embedded for an optical path.
    pub fn icc_profile(&self, path: &OpticalPath) -> Option<&[u8]> {
        self.optical_path_info(path)?.icc_profile.as_deref()
    }

    /// Palette color lookup table of an optical path.
    pub fn lookup_table(&self, path: &OpticalPath) -> Option<&PaletteLut> {
        self.optical_path_info(path)?.lut.as_ref()
    }

    pub fn focal_planes(&self) -> &[FocalPlane] {
        &self.inner.focal_planes
    }

    pub fn associated_images(&self) -> &[AssociatedImage] {
        &self.inner.associated_images
    }

    /// Warnings from opening, plus those recorded while building frame
    /// indices so far.
    pub fn warnings(&self) -> Vec<SlideWarning> {
        let mut warnings = self.inner.warnings.clone();
        warnings.extend(self.inner.indices.warnings());
        warnings
    }

    pub fn state(&self) -> SlideState {
        match self.inner.state.load(Ordering::Acquire) {
            0 => SlideState::Open,
            _ => SlideState::Closed,
        }
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.inner.stitcher.cache().stats().await
    }

    /// Frame index of one channel, built on first use.
    pub fn frame_index(
        &self,
        level: usize,
        optical_path: &OpticalPath,
        focal_plane: FocalPlane,
    ) -> Result<Arc<FrameIndex>, FrameIndexError> {
        self.inner.indices.get(level, optical_path, focal_plane)
    }

    // -------------------------------------------------------------------------
    // Pyramid Queries
    // -------------------------------------------------------------------------

    /// Select the level best matching a resolution. See
    /// [`LevelPyramid::select_level`].
    pub fn select_level(
        &self,
        request: LevelRequest,
        allow_upscale: bool,
    ) -> Result<&Level, PyramidError> {
        self.inner.pyramid.select_level(request, allow_upscale)
    }

    pub fn map_coordinate(
        &self,
        point: Point,
        from: usize,
        to: usize,
    ) -> Result<Point, PyramidError> {
        self.inner.pyramid.map_coordinate(point, from, to)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    fn ensure_open(&self) -> Result<(), RegionError> {
        match self.state() {
            SlideState::Open => Ok(()),
            SlideState::Closed => Err(RegionError::SlideClosed),
        }
    }

    /// Read a rectangle of one channel with the configured bounds policy.
    ///
    /// The result holds `width * height * samples * bytes_per_sample` bytes.
    #[allow(clippy::too_many_arguments)]
    pub async fn read_region(
        &self,
        level: usize,
        optical_path: &OpticalPath,
        focal_plane: FocalPlane,
        x: i64,
        y: i64,
        width: u32,
        height: u32,
    ) -> Result<Region, RegionError> {
        let request = RegionRequest::new(level, x, y, width, height)
            .with_channel(optical_path.clone(), focal_plane);
        self.read(&request).await
    }

    pub async fn read(&self, request: &RegionRequest) -> Result<Region, RegionError> {
        self.ensure_open()?;
        self.inner.stitcher.read(request).await
    }

    /// Read a region that can be abandoned through `cancel`.
    pub async fn read_region_cancellable(
        &self,
        request: &RegionRequest,
        cancel: &CancelToken,
    ) -> Result<Region, RegionError> {
        self.ensure_open()?;
        self.inner.stitcher.read_cancellable(request, cancel).await
    }

    /// Read one whole decoded tile.
    pub async fn read_tile(
        &self,
        level: usize,
        optical_path: &OpticalPath,
        focal_plane: FocalPlane,
        column: u32,
        row: u32,
    ) -> Result<Arc<DecodedTile>, RegionError> {
        self.ensure_open()?;
        self.inner
            .stitcher
            .tile(level, optical_path, focal_plane, TileCoord::new(column, row))
            .await
    }

    // -------------------------------------------------------------------------
    // Closing
    // -------------------------------------------------------------------------

    /// Stop serving reads, drop cached tiles and release every stream.
    ///
    /// Metadata stays accessible. Closing twice is a no-op.
    pub async fn close(&self) {
        let previous = self
            .inner
            .state
            .swap(SlideState::Closed as u8, Ordering::AcqRel);
        if previous == SlideState::Closed as u8 {
            return;
        }

        self.inner.stitcher.cache().close().await;
        for level in self.levels() {
            for instance in &level.instances {
                instance.release();
            }
        }
        info!(levels = self.levels().len(), "Closed slide");
    }
}

impl std::fmt::Debug for Slide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slide")
            .field("identity", &self.inner.identity)
            .field("levels", &self.inner.pyramid.len())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
