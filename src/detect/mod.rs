mod backend;
mod backends;
mod result;

pub use backend::{DetectorBackend, DetectorOutput};
pub use backends::{ReplayBackend, ScriptedBackend};
pub use result::{BBox, Centroid, Detection, DetectionFilter};
