//! Renderer error taxonomy.
//!
//! Every variant here is fatal. Recoverable preference fallbacks (surface
//! format, present mode) are reported through
//! [`Preference`](crate::backend::swapchain::Preference) instead.

use std::fmt;

use ash::vk;
use thiserror::Error;

use crate::backend::selector::Rejection;
use crate::backend::shader::ShaderError;

/// Renderer error type.
#[derive(Error, Debug)]
pub enum RendererError {
    /// The Vulkan loader library could not be opened
    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    /// Instance, debug messenger or surface creation failed
    #[error("Instance setup failed ({context}): {result}")]
    Instance {
        context: &'static str,
        result: vk::Result,
    },

    /// The driver could not list devices, extensions or surface properties
    #[error("Enumeration failed ({context}): {result}")]
    Enumeration {
        context: &'static str,
        result: vk::Result,
    },

    /// Every candidate failed at least one hard requirement
    #[error("Device selection failed: no suitable device{}", describe_rejections(.0))]
    NoSuitableDevice(Vec<Rejection>),

    /// Logical device creation was rejected
    #[error("Device selection failed: logical device creation rejected: {0}")]
    DeviceCreation(vk::Result),

    /// Swapchain negotiation or creation failed
    #[error("Swapchain build failed ({context}): {result}")]
    Swapchain {
        context: &'static str,
        result: vk::Result,
    },

    /// Shader blob could not be used
    #[error("Pipeline build failed: {0}")]
    Shader(#[from] ShaderError),

    /// Render pass, pipeline, framebuffer or command buffer creation failed
    #[error("Pipeline build failed ({context}): {result}")]
    Pipeline {
        context: &'static str,
        result: vk::Result,
    },

    /// Semaphore or fence creation failed
    #[error("Frame scheduler setup failed: {0}")]
    SyncObjects(vk::Result),

    /// A frame-loop call reported an error; treated as device loss
    #[error("Frame submission failed while {step}: {result}")]
    Frame { step: FrameStep, result: vk::Result },

    /// The presentation engine returned an image index we do not track
    #[error("Frame submission failed: acquired image {index} but swapchain has {count} images")]
    ImageIndexOutOfRange { index: u32, count: usize },
}

/// Result type alias for renderer operations.
pub type RendererResult<T> = std::result::Result<T, RendererError>;

/// The frame-loop call that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStep {
    WaitForSlot,
    AcquireImage,
    WaitForImage,
    ResetFence,
    Submit,
    Present,
    WaitIdle,
}

impl fmt::Display for FrameStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FrameStep::WaitForSlot => "waiting for the frame slot fence",
            FrameStep::AcquireImage => "acquiring a swapchain image",
            FrameStep::WaitForImage => "waiting for the swapchain image fence",
            FrameStep::ResetFence => "resetting the frame slot fence",
            FrameStep::Submit => "submitting to the graphics queue",
            FrameStep::Present => "presenting",
            FrameStep::WaitIdle => "waiting for the device to go idle",
        };
        f.write_str(text)
    }
}

fn describe_rejections(rejections: &[Rejection]) -> String {
    if rejections.is_empty() {
        return " (no Vulkan devices were enumerated)".to_string();
    }
    rejections
        .iter()
        .map(|r| format!("\n  {}: {}", r.device, r.reason))
        .collect()
}
