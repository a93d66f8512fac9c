// Capability probing
//
// Pure queries against a physical device and a surface. Nothing here creates
// or mutates driver state; the results are snapshots the selector scores.

use std::ffi::CStr;

use ash::extensions::khr::Surface;
use ash::prelude::VkResult;
use ash::vk;

use super::selector::{Disqualification, Rejection};
use crate::error::{RendererError, RendererResult};

/// One queue family as seen by the prober
#[derive(Debug, Clone, Copy)]
pub struct QueueFamily {
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    /// Whether this family can present to the probed surface
    pub supports_present: bool,
}

impl QueueFamily {
    pub fn supports_graphics(&self) -> bool {
        self.queue_count > 0 && self.flags.contains(vk::QueueFlags::GRAPHICS)
    }
}

/// Surface properties for one device, retained for swapchain (re)creation
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    /// Query capabilities, formats and present modes of `surface` on `physical_device`
    pub fn query(
        surface_loader: &Surface,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> VkResult<Self> {
        unsafe {
            Ok(Self {
                capabilities: surface_loader
                    .get_physical_device_surface_capabilities(physical_device, surface)?,
                formats: surface_loader
                    .get_physical_device_surface_formats(physical_device, surface)?,
                present_modes: surface_loader
                    .get_physical_device_surface_present_modes(physical_device, surface)?,
            })
        }
    }
}

/// Everything the selector needs to know about one physical device
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub max_image_dimension_2d: u32,
    pub extensions: Vec<String>,
    pub queue_families: Vec<QueueFamily>,
    pub surface: SurfaceSupport,
}

/// Probe a single physical device against `surface`.
///
/// Any enumeration failure aborts the probe of this device only.
pub fn probe_device(
    instance: &ash::Instance,
    surface_loader: &Surface,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
) -> VkResult<DeviceCandidate> {
    let properties = unsafe { instance.get_physical_device_properties(physical_device) };
    let name = device_name(&properties);

    let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device)? }
        .iter()
        .map(|ext| {
            unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }
                .to_string_lossy()
                .into_owned()
        })
        .collect();

    let family_properties =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    let queue_families = family_properties
        .iter()
        .enumerate()
        .map(|(index, props)| {
            let supports_present = unsafe {
                surface_loader.get_physical_device_surface_support(
                    physical_device,
                    index as u32,
                    surface,
                )?
            };
            Ok(QueueFamily {
                flags: props.queue_flags,
                queue_count: props.queue_count,
                supports_present,
            })
        })
        .collect::<VkResult<Vec<_>>>()?;

    let surface = SurfaceSupport::query(surface_loader, physical_device, surface)?;

    Ok(DeviceCandidate {
        handle: physical_device,
        name,
        device_type: properties.device_type,
        max_image_dimension_2d: properties.limits.max_image_dimension2_d,
        extensions,
        queue_families,
        surface,
    })
}

fn device_name(properties: &vk::PhysicalDeviceProperties) -> String {
    unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// Result of probing every physical device
#[derive(Debug, Default)]
pub struct ProbeReport {
    pub candidates: Vec<DeviceCandidate>,
    /// Devices whose probe failed, already disqualified
    pub failures: Vec<Rejection>,
}

/// Enumerate every physical device and probe each one.
///
/// Failing to enumerate devices at all is fatal; a device whose probe fails
/// is reported as a rejection so selection diagnostics still name it.
pub fn probe_devices(
    instance: &ash::Instance,
    surface_loader: &Surface,
    surface: vk::SurfaceKHR,
) -> RendererResult<ProbeReport> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|result| {
        RendererError::Enumeration {
            context: "physical devices",
            result,
        }
    })?;

    log::info!("Found {} physical device(s)", devices.len());

    let mut report = ProbeReport {
        candidates: Vec::with_capacity(devices.len()),
        failures: Vec::new(),
    };
    for device in devices {
        match probe_device(instance, surface_loader, surface, device) {
            Ok(candidate) => {
                log::debug!(
                    "Probed {} ({:?}): {} queue families, {} surface formats, {} present modes",
                    candidate.name,
                    candidate.device_type,
                    candidate.queue_families.len(),
                    candidate.surface.formats.len(),
                    candidate.surface.present_modes.len()
                );
                report.candidates.push(candidate);
            }
            Err(result) => {
                let properties = unsafe { instance.get_physical_device_properties(device) };
                let name = device_name(&properties);
                log::warn!("Probing physical device {} failed: {}", name, result);
                report.failures.push(Rejection {
                    device: name,
                    reason: Disqualification::ProbeFailed(result),
                });
            }
        }
    }

    Ok(report)
}
