//! Keeps the annotation layer in sync with the displayed image.
//!
//! The renderer never measures anything itself. A host feeds it the image
//! source, load-complete and resize signals, and an [`ImageSurface`] probe at
//! attach time. The renderer turns those into an [`OverlayScene`] of
//! rendered-space primitives.

use crate::geometry::{DetectionBox, ImageGeometry, RenderedBox, ScaleFactor};
use crate::palette::{label_text, Palette};
use image::Rgba;
use serde::Serialize;
use std::path::PathBuf;

/// Where the base image comes from. Only used to detect source changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Path(PathBuf),
    Url(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPhase {
    Unloaded,
    Measuring,
    Ready,
}

/// What the host can tell about the displayed image when the renderer attaches.
pub trait ImageSurface {
    /// Intrinsic size, or `None` while the image is still decoding.
    fn natural_size(&self) -> Option<(f64, f64)>;
    /// Current on-screen size.
    fn rendered_size(&self) -> (f64, f64);
}

/// A surface with fixed, known dimensions (already-decoded image).
#[derive(Debug, Clone, Copy)]
pub struct StaticSurface {
    pub natural: Option<(f64, f64)>,
    pub rendered: (f64, f64),
}

impl ImageSurface for StaticSurface {
    fn natural_size(&self) -> Option<(f64, f64)> {
        self.natural
    }

    fn rendered_size(&self) -> (f64, f64) {
        self.rendered
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendMode {
    Multiply,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnotatedBox {
    pub rect: RenderedBox,
    pub label: String,
    #[serde(serialize_with = "serialize_rgba")]
    pub color: Rgba<u8>,
    pub malformed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "boxes", rename_all = "snake_case")]
pub enum OverlayContent {
    /// Geometry not known yet; draw nothing over the base.
    Pending,
    /// The detection list is empty; draw the placeholder.
    NoDetections,
    Boxes(Vec<AnnotatedBox>),
}

/// Everything needed to draw one frame of the overlay, bottom to top:
/// base image, optional heatmap, then boxes or placeholder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverlayScene {
    pub phase: LoadPhase,
    pub geometry: ImageGeometry,
    pub heatmap: Option<BlendMode>,
    pub content: OverlayContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type GeometryObserver = Box<dyn FnMut(&ImageGeometry)>;

pub struct OverlayRenderer {
    palette: Palette,
    source: Option<ImageSource>,
    phase: LoadPhase,
    geometry: ImageGeometry,
    detections: Vec<DetectionBox>,
    heatmap: bool,
    attached: bool,
    observers: Vec<(ObserverId, GeometryObserver)>,
    next_observer: u64,
}

impl Default for OverlayRenderer {
    fn default() -> Self {
        Self::new(Palette::default())
    }
}

impl OverlayRenderer {
    pub fn new(palette: Palette) -> Self {
        Self {
            palette,
            source: None,
            phase: LoadPhase::Unloaded,
            geometry: ImageGeometry::default(),
            detections: Vec::new(),
            heatmap: false,
            attached: false,
            observers: Vec::new(),
            next_observer: 0,
        }
    }

    pub fn phase(&self) -> LoadPhase {
        self.phase
    }

    pub fn geometry(&self) -> ImageGeometry {
        self.geometry
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Switch to a new image. An unchanged source keeps the current state.
    pub fn set_source(&mut self, source: ImageSource) {
        if self.source.as_ref() == Some(&source) {
            return;
        }
        log::debug!("overlay source changed, measuring");
        self.source = Some(source);
        self.phase = LoadPhase::Measuring;
        self.geometry.natural_width = 0.0;
        self.geometry.natural_height = 0.0;
    }

    /// Start listening for load/resize signals. Probes the surface for an
    /// image that finished decoding before the renderer was attached.
    pub fn attach(&mut self, surface: &dyn ImageSurface) {
        self.attached = true;
        let (rw, rh) = surface.rendered_size();
        self.geometry.rendered_width = rw;
        self.geometry.rendered_height = rh;
        if self.phase == LoadPhase::Measuring {
            if let Some((nw, nh)) = surface.natural_size() {
                self.measured(nw, nh);
            }
        }
    }

    /// Drop listeners and observers. Signals after this are ignored.
    pub fn detach(&mut self) {
        self.attached = false;
        self.observers.clear();
    }

    /// Load-complete signal from the host.
    pub fn on_load(&mut self, natural_width: f64, natural_height: f64, rendered_width: f64, rendered_height: f64) {
        if !self.attached {
            log::debug!("ignoring load signal on detached overlay");
            return;
        }
        if self.phase == LoadPhase::Unloaded {
            log::debug!("ignoring load signal without a source");
            return;
        }
        self.geometry.rendered_width = rendered_width;
        self.geometry.rendered_height = rendered_height;
        self.measured(natural_width, natural_height);
    }

    /// Viewport-resize signal from the host.
    pub fn on_resize(&mut self, rendered_width: f64, rendered_height: f64) {
        if !self.attached {
            log::debug!("ignoring resize signal on detached overlay");
            return;
        }
        self.geometry.rendered_width = rendered_width;
        self.geometry.rendered_height = rendered_height;
        if self.phase == LoadPhase::Ready {
            self.notify();
        }
    }

    fn measured(&mut self, natural_width: f64, natural_height: f64) {
        self.geometry.natural_width = natural_width;
        self.geometry.natural_height = natural_height;
        if self.geometry.is_measurable() {
            self.phase = LoadPhase::Ready;
            self.notify();
        } else {
            log::warn!("image reported unusable dimensions {natural_width}x{natural_height}");
        }
    }

    pub fn subscribe(&mut self, observer: impl FnMut(&ImageGeometry) + 'static) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        self.observers.len() != before
    }

    fn notify(&mut self) {
        let geometry = self.geometry;
        for (_, observer) in &mut self.observers {
            observer(&geometry);
        }
    }

    pub fn set_detections(&mut self, detections: Vec<DetectionBox>) {
        self.detections = detections;
    }

    pub fn detections(&self) -> &[DetectionBox] {
        &self.detections
    }

    pub fn set_heatmap(&mut self, enabled: bool) {
        self.heatmap = enabled;
    }

    pub fn scene(&self) -> OverlayScene {
        let content = if self.detections.is_empty() {
            OverlayContent::NoDetections
        } else {
            match (self.phase, ScaleFactor::from_geometry(&self.geometry)) {
                (LoadPhase::Ready, Ok(scale)) => OverlayContent::Boxes(
                    self.detections
                        .iter()
                        .map(|det| AnnotatedBox {
                            rect: scale.map(det),
                            label: label_text(det),
                            color: self.palette.color_for(&det.class_label),
                            malformed: det.is_malformed(),
                        })
                        .collect(),
                ),
                _ => OverlayContent::Pending,
            }
        };
        OverlayScene {
            phase: self.phase,
            geometry: self.geometry,
            heatmap: self.heatmap.then_some(BlendMode::Multiply),
            content,
        }
    }
}

fn serialize_rgba<S: serde::Serializer>(color: &Rgba<u8>, serializer: S) -> Result<S::Ok, S::Error> {
    let [r, g, b, a] = color.0;
    serializer.serialize_str(&format!("#{r:02X}{g:02X}{b:02X}{a:02X}"))
}
