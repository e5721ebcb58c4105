//! Frame renderer interface and network catalog.
//!
//! The coordinator treats a renderer as a timestamp-agnostic image transform
//! with a fixed [`SCALE_FACTOR`]. Renderers own their device and queue.
//! [`wait_for_idle`](FrameRenderer::wait_for_idle) is the barrier the
//! coordinator waits on after every frame.
//!
//! [`ResampleRenderer`] is a CPU renderer built on `image` resampling. It
//! accepts the same network names as the neural renderers and maps each one
//! to a resampling filter.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use image::RgbaImage;
use image::imageops::{self, FilterType};

use crate::codec::DecodedFrame;
use crate::error::{Result, UpscaleError};

/// Output pixels per input pixel along each axis.
pub const SCALE_FACTOR: u32 = 2;

/// An upscaling renderer.
#[allow(async_fn_in_trait)]
pub trait FrameRenderer {
    /// Upscale `frame` by [`scale_factor`](Self::scale_factor).
    async fn render(&mut self, frame: &DecodedFrame) -> Result<RgbaImage>;

    /// Wait until all work submitted to the device has completed.
    async fn wait_for_idle(&mut self) -> Result<()>;

    /// Load a different network. `weights` is the raw weight file.
    fn switch_network(&mut self, name: &str, weights: &[u8]) -> Result<()>;

    /// Output pixels per input pixel. Rendered frames are checked against it.
    fn scale_factor(&self) -> u32 {
        SCALE_FACTOR
    }
}

/// Network capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NetworkSize {
    /// Fastest.
    Small,
    /// Balanced.
    #[default]
    Medium,
    /// Highest quality.
    Large,
}

impl NetworkSize {
    fn code(self) -> char {
        match self {
            NetworkSize::Small => 's',
            NetworkSize::Medium => 'm',
            NetworkSize::Large => 'l',
        }
    }
}

impl FromStr for NetworkSize {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "s" | "small" => Ok(NetworkSize::Small),
            "m" | "medium" => Ok(NetworkSize::Medium),
            "l" | "large" => Ok(NetworkSize::Large),
            other => Err(format!("unknown network size '{other}' (use small, medium or large)")),
        }
    }
}

/// Kind of content the weights were trained on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContentStyle {
    /// Live-action footage.
    #[default]
    RealLife,
    /// Animation.
    Animation,
    /// 3D renders.
    ThreeD,
}

impl ContentStyle {
    fn code(self) -> &'static str {
        match self {
            ContentStyle::RealLife => "rl",
            ContentStyle::Animation => "an",
            ContentStyle::ThreeD => "3d",
        }
    }
}

impl FromStr for ContentStyle {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rl" | "real-life" | "reallife" => Ok(ContentStyle::RealLife),
            "an" | "animation" => Ok(ContentStyle::Animation),
            "3d" => Ok(ContentStyle::ThreeD),
            other => Err(format!("unknown content style '{other}' (use rl, an or 3d)")),
        }
    }
}

/// A network and the weights to load into it.
///
/// ```
/// use upscaler::{ContentStyle, NetworkSelection, NetworkSize};
///
/// let selection = NetworkSelection::new(NetworkSize::Large, ContentStyle::Animation);
/// assert_eq!(selection.network_name(), "anime4k/cnn-2x-l");
/// assert_eq!(selection.weights_file(), "cnn-2x-l-an.json");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NetworkSelection {
    /// Network capacity.
    pub size: NetworkSize,
    /// Training content.
    pub style: ContentStyle,
}

impl NetworkSelection {
    /// Select a network.
    pub fn new(size: NetworkSize, style: ContentStyle) -> Self {
        Self { size, style }
    }

    /// Name passed to [`FrameRenderer::switch_network`].
    pub fn network_name(&self) -> String {
        format!("anime4k/cnn-2x-{}", self.size.code())
    }

    /// File name of the weights for this selection.
    pub fn weights_file(&self) -> String {
        format!("cnn-2x-{}-{}.json", self.size.code(), self.style.code())
    }
}

impl Display for NetworkSelection {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{} ({})", self.network_name(), self.style.code())
    }
}

fn filter_for(name: &str) -> Option<FilterType> {
    let filter = match name {
        "anime4k/cnn-2x-s" | "triangle" => FilterType::Triangle,
        "anime4k/cnn-2x-m" | "catmull-rom" => FilterType::CatmullRom,
        "anime4k/cnn-2x-l" | "lanczos3" => FilterType::Lanczos3,
        "gaussian" => FilterType::Gaussian,
        "nearest" => FilterType::Nearest,
        _ => return None,
    };
    Some(filter)
}

/// CPU renderer that resamples each frame to twice its size.
#[derive(Debug, Clone)]
pub struct ResampleRenderer {
    network: String,
    filter: FilterType,
    frames_rendered: u64,
}

impl ResampleRenderer {
    /// Renderer using the default network.
    pub fn new() -> Self {
        let network = NetworkSelection::default().network_name();
        Self {
            filter: FilterType::CatmullRom,
            network,
            frames_rendered: 0,
        }
    }

    /// Renderer using a named network or filter.
    pub fn with_network(name: &str) -> Result<Self> {
        let mut renderer = Self::new();
        renderer.switch_network(name, &[])?;
        Ok(renderer)
    }

    /// Name of the active network.
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Number of frames rendered so far.
    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }
}

impl Default for ResampleRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRenderer for ResampleRenderer {
    async fn render(&mut self, frame: &DecodedFrame) -> Result<RgbaImage> {
        let (w, h) = frame.dimensions();
        if w == 0 || h == 0 {
            return Err(UpscaleError::Render(format!("cannot upscale a {w}x{h} frame")));
        }
        self.frames_rendered += 1;
        Ok(imageops::resize(
            &frame.image,
            w * self.scale_factor(),
            h * self.scale_factor(),
            self.filter,
        ))
    }

    async fn wait_for_idle(&mut self) -> Result<()> {
        tokio::task::yield_now().await;
        Ok(())
    }

    fn switch_network(&mut self, name: &str, weights: &[u8]) -> Result<()> {
        let filter = filter_for(name)
            .ok_or_else(|| UpscaleError::Render(format!("unknown network '{name}'")))?;
        log::info!("switching renderer to {name} ({} weight bytes)", weights.len());
        self.filter = filter;
        self.network = name.to_string();
        Ok(())
    }
}
