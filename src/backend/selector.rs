// Physical device selection
//
// Scoring is a pure function over probed candidates: disqualify anything that
// misses a hard requirement, score the rest, keep the first device with the
// strictly highest score.

use std::fmt;

use ash::vk;

use super::probe::{DeviceCandidate, QueueFamily, SurfaceSupport};
use crate::error::{RendererError, RendererResult};

/// Device extensions the renderer cannot run without
pub const REQUIRED_DEVICE_EXTENSIONS: &[&str] = &["VK_KHR_swapchain"];

/// Score bonus for a discrete GPU
pub const DISCRETE_GPU_BONUS: u64 = 50_000;
/// Score bonus for an integrated GPU
pub const INTEGRATED_GPU_BONUS: u64 = 5_000;

/// Queue family assignment discovered for one device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// Find a graphics family and a family that can present to the surface.
    ///
    /// A family that does both wins, so graphics and present share a queue
    /// whenever the hardware allows it. Otherwise the first family of each
    /// kind is used.
    pub fn find(families: &[QueueFamily]) -> Self {
        if let Some(shared) = first_family(families, |f| f.supports_graphics() && f.supports_present) {
            return Self {
                graphics: Some(shared),
                present: Some(shared),
            };
        }

        Self {
            graphics: first_family(families, QueueFamily::supports_graphics),
            present: first_family(families, |f| f.queue_count > 0 && f.supports_present),
        }
    }

    #[cfg(test)]
    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// Resolve into concrete indices, if both are known
    pub fn complete(&self) -> Option<QueueFamilies> {
        Some(QueueFamilies {
            graphics: self.graphics?,
            present: self.present?,
        })
    }
}

fn first_family(families: &[QueueFamily], pred: impl Fn(&QueueFamily) -> bool) -> Option<u32> {
    families.iter().position(|f| pred(f)).map(|i| i as u32)
}

/// Resolved queue family indices of the selected device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    pub fn shared(&self) -> bool {
        self.graphics == self.present
    }
}

/// Why a candidate was not considered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disqualification {
    MissingExtensions(Vec<String>),
    IncompleteQueueFamilies { graphics: bool, present: bool },
    NoSurfaceFormats,
    NoPresentModes,
    /// Capability queries failed, so nothing else could be checked
    ProbeFailed(vk::Result),
}

impl fmt::Display for Disqualification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disqualification::MissingExtensions(missing) => {
                write!(f, "missing required extensions [{}]", missing.join(", "))
            }
            Disqualification::IncompleteQueueFamilies { graphics, present } => {
                let mut lacking = Vec::new();
                if !graphics {
                    lacking.push("graphics");
                }
                if !present {
                    lacking.push("presentation");
                }
                write!(f, "no queue family with {} support", lacking.join(" or "))
            }
            Disqualification::NoSurfaceFormats => f.write_str("surface exposes no formats"),
            Disqualification::NoPresentModes => f.write_str("surface exposes no present modes"),
            Disqualification::ProbeFailed(result) => write!(f, "capability probing failed: {}", result),
        }
    }
}

/// A disqualified device and the reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub device: String,
    pub reason: Disqualification,
}

/// The winning device
#[derive(Debug, Clone)]
pub struct SelectedDevice {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub score: u64,
    pub queue_families: QueueFamilies,
    /// Surface snapshot taken during probing
    pub surface: SurfaceSupport,
}

/// Extensions from `required` that `available` lacks
pub fn missing_extensions(available: &[String], required: &[&str]) -> Vec<String> {
    required
        .iter()
        .filter(|req| !available.iter().any(|ext| ext == *req))
        .map(|req| req.to_string())
        .collect()
}

/// Preference score, higher wins
pub fn score(device_type: vk::PhysicalDeviceType, max_image_dimension_2d: u32) -> u64 {
    let class_bonus = match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => DISCRETE_GPU_BONUS,
        vk::PhysicalDeviceType::INTEGRATED_GPU => INTEGRATED_GPU_BONUS,
        _ => 0,
    };
    class_bonus + u64::from(max_image_dimension_2d)
}

/// Check the hard requirements and score the candidate
pub fn evaluate(
    candidate: &DeviceCandidate,
    required_extensions: &[&str],
) -> Result<(QueueFamilies, u64), Disqualification> {
    let missing = missing_extensions(&candidate.extensions, required_extensions);
    if !missing.is_empty() {
        return Err(Disqualification::MissingExtensions(missing));
    }

    let indices = QueueFamilyIndices::find(&candidate.queue_families);
    let families = indices
        .complete()
        .ok_or(Disqualification::IncompleteQueueFamilies {
            graphics: indices.graphics.is_some(),
            present: indices.present.is_some(),
        })?;

    if candidate.surface.formats.is_empty() {
        return Err(Disqualification::NoSurfaceFormats);
    }
    if candidate.surface.present_modes.is_empty() {
        return Err(Disqualification::NoPresentModes);
    }

    Ok((
        families,
        score(candidate.device_type, candidate.max_image_dimension_2d),
    ))
}

/// Pick the best candidate.
///
/// Ties keep the first-seen device. When nothing qualifies, the error lists
/// every device with its unmet requirement, starting with `probe_failures`.
pub fn select_device(
    candidates: Vec<DeviceCandidate>,
    probe_failures: Vec<Rejection>,
    required_extensions: &[&str],
) -> RendererResult<SelectedDevice> {
    let mut best: Option<(DeviceCandidate, QueueFamilies, u64)> = None;
    let mut rejections = probe_failures;

    for candidate in candidates {
        match evaluate(&candidate, required_extensions) {
            Ok((families, score)) => {
                log::info!("Found suitable physical device {} with score {}", candidate.name, score);
                let better = best.as_ref().map_or(true, |(_, _, best_score)| score > *best_score);
                if better {
                    best = Some((candidate, families, score));
                }
            }
            Err(reason) => {
                log::info!("Rejected physical device {}: {}", candidate.name, reason);
                rejections.push(Rejection {
                    device: candidate.name,
                    reason,
                });
            }
        }
    }

    let (candidate, queue_families, score) =
        best.ok_or(RendererError::NoSuitableDevice(rejections))?;

    log::info!("Chose physical device {} with score of {}", candidate.name, score);

    Ok(SelectedDevice {
        handle: candidate.handle,
        name: candidate.name,
        score,
        queue_families,
        surface: candidate.surface,
    })
}
