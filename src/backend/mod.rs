// Backend module - Vulkan abstraction layer
//
// Stages, in the order the renderer builds them:
// probe -> selector -> device -> swapchain -> pipeline/commands -> frame

pub mod commands;
pub mod device;
pub mod frame;
pub mod instance;
pub mod pipeline;
pub mod probe;
pub mod selector;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use frame::{FrameScheduler, MAX_FRAMES_IN_FLIGHT};
pub use instance::InstanceContext;
pub use shader::ShaderSet;
pub use swapchain::Swapchain;
