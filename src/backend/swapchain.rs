// Swapchain - Window presentation
//
// Negotiates format, present mode, extent and image count against the
// surface capabilities, then builds the swapchain and one view per image.
// The choice functions are pure so they can be checked without a GPU.

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::prelude::VkResult;
use ash::vk;

use super::device::VulkanDevice;
use super::probe::SurfaceSupport;
use super::selector::QueueFamilies;
use crate::error::{RendererError, RendererResult};

/// Outcome of a preference-driven choice.
///
/// `Fallback` is recoverable: the caller continues with the substituted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preference<T> {
    Preferred(T),
    Fallback(T),
}

impl<T> Preference<T> {
    pub fn value(self) -> T {
        match self {
            Preference::Preferred(value) | Preference::Fallback(value) => value,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Preference::Fallback(_))
    }
}

/// Prefer B8G8R8A8_SRGB / SRGB_NONLINEAR, else the first format the driver lists.
///
/// Returns `None` only for an empty list.
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> Option<Preference<vk::SurfaceFormatKHR>> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .map(|&f| Preference::Preferred(f))
        .or_else(|| formats.first().map(|&f| Preference::Fallback(f)))
}

/// Prefer MAILBOX; FIFO is always supported and needs no check.
pub fn choose_present_mode(present_modes: &[vk::PresentModeKHR]) -> Preference<vk::PresentModeKHR> {
    if present_modes.contains(&vk::PresentModeKHR::MAILBOX) {
        Preference::Preferred(vk::PresentModeKHR::MAILBOX)
    } else {
        Preference::Fallback(vk::PresentModeKHR::FIFO)
    }
}

/// Use the platform-fixed extent, or clamp `desired` when the surface lets us pick.
pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, desired: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    let min = capabilities.min_image_extent;
    let max = capabilities.max_image_extent;
    vk::Extent2D {
        width: desired.width.max(min.width).min(max.width),
        height: desired.height.max(min.height).min(max.height),
    }
}

/// One more than the minimum, capped by the maximum (0 means unbounded)
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let image_count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 && image_count > capabilities.max_image_count {
        capabilities.max_image_count
    } else {
        image_count
    }
}

/// How swapchain images are shared between the graphics and present families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSharing {
    Exclusive,
    Concurrent([u32; 2]),
}

impl ImageSharing {
    pub fn for_families(families: &QueueFamilies) -> Self {
        if families.shared() {
            ImageSharing::Exclusive
        } else {
            ImageSharing::Concurrent([families.graphics, families.present])
        }
    }

    pub fn mode(&self) -> vk::SharingMode {
        match self {
            ImageSharing::Exclusive => vk::SharingMode::EXCLUSIVE,
            ImageSharing::Concurrent(_) => vk::SharingMode::CONCURRENT,
        }
    }

    pub fn family_indices(&self) -> &[u32] {
        match self {
            ImageSharing::Exclusive => &[],
            ImageSharing::Concurrent(indices) => indices,
        }
    }
}

/// Everything negotiated before the swapchain is created
#[derive(Debug, Clone, Copy)]
pub struct SwapchainDescriptor {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub sharing: ImageSharing,
}

impl SwapchainDescriptor {
    /// Run the choice functions, logging any fallbacks
    pub fn negotiate(
        support: &SurfaceSupport,
        families: &QueueFamilies,
        desired_extent: vk::Extent2D,
    ) -> RendererResult<Self> {
        let surface_format = match choose_surface_format(&support.formats) {
            Some(Preference::Preferred(format)) => format,
            Some(Preference::Fallback(format)) => {
                log::warn!(
                    "Preferred surface format/color space not available. Falling back to {:?} / {:?}",
                    format.format,
                    format.color_space
                );
                format
            }
            None => {
                return Err(RendererError::Swapchain {
                    context: "surface exposes no formats",
                    result: vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
                })
            }
        };

        let present_mode = choose_present_mode(&support.present_modes);
        if present_mode.is_fallback() {
            log::info!("Mailbox present mode not available, using FIFO");
        }

        Ok(Self {
            surface_format,
            present_mode: present_mode.value(),
            extent: choose_extent(&support.capabilities, desired_extent),
            image_count: choose_image_count(&support.capabilities),
            pre_transform: support.capabilities.current_transform,
            sharing: ImageSharing::for_families(families),
        })
    }
}

/// Swapchain plus one view per image
pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: SwapchainLoader,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    pub fn new(
        instance: &ash::Instance,
        device: &VulkanDevice,
        surface: vk::SurfaceKHR,
        descriptor: &SwapchainDescriptor,
    ) -> RendererResult<Self> {
        let swapchain_loader = SwapchainLoader::new(instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(descriptor.image_count)
            .image_format(descriptor.surface_format.format)
            .image_color_space(descriptor.surface_format.color_space)
            .image_extent(descriptor.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(descriptor.sharing.mode())
            .queue_family_indices(descriptor.sharing.family_indices())
            .pre_transform(descriptor.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(descriptor.present_mode)
            .clipped(true);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(|result| RendererError::Swapchain {
                context: "swapchain creation",
                result,
            })?;

        let images = match unsafe { swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(result) => {
                unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(RendererError::Swapchain {
                    context: "swapchain images",
                    result,
                });
            }
        };

        let mut this = Self {
            swapchain,
            swapchain_loader,
            images,
            image_views: Vec::new(),
            format: descriptor.surface_format.format,
            extent: descriptor.extent,
        };

        for &image in &this.images {
            match create_image_view(&device.device, image, this.format) {
                Ok(view) => this.image_views.push(view),
                Err(result) => {
                    unsafe { this.destroy(&device.device) };
                    return Err(RendererError::Swapchain {
                        context: "image view creation",
                        result,
                    });
                }
            }
        }

        log::info!(
            "Successfully created a swapchain: {} images, {}x{}, {:?}, {:?}",
            this.images.len(),
            this.extent.width,
            this.extent.height,
            this.format,
            descriptor.present_mode
        );

        Ok(this)
    }

    /// Acquire next image for rendering, returns (index, suboptimal)
    pub fn acquire_next_image(&self, timeout: u64, semaphore: vk::Semaphore) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                timeout,
                semaphore,
                vk::Fence::null(),
            )
        }
    }

    /// Present rendered image to screen, returns whether it was suboptimal
    pub fn present(&self, queue: vk::Queue, image_index: u32, wait_semaphores: &[vk::Semaphore]) -> VkResult<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe { self.swapchain_loader.queue_present(queue, &present_info) }
    }

    /// Destroy image views and the swapchain.
    ///
    /// # Safety
    /// No framebuffer may still reference the views and the device must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for view in self.image_views.drain(..) {
            device.destroy_image_view(view, None);
        }
        self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        self.swapchain = vk::SwapchainKHR::null();
    }
}

/// 2D color view with identity swizzle, one mip level and one layer
fn create_image_view(device: &ash::Device, image: vk::Image, format: vk::Format) -> VkResult<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe { device.create_image_view(&create_info, None) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn sentinel_caps() -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn test_choose_surface_format_prefers_bgra_srgb() {
        let formats = [format(vk::Format::R8G8B8A8_SRGB), format(vk::Format::B8G8R8A8_SRGB)];
        let chosen = choose_surface_format(&formats).unwrap();
        assert!(!chosen.is_fallback());
        assert_eq!(chosen.value().format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(chosen.value().color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn test_choose_surface_format_is_order_independent() {
        let forward = [
            format(vk::Format::R8G8B8A8_UNORM),
            format(vk::Format::B8G8R8A8_SRGB),
            format(vk::Format::A2B10G10R10_UNORM_PACK32),
        ];
        let mut reversed = forward;
        reversed.reverse();
        let a = choose_surface_format(&forward).unwrap().value();
        let b = choose_surface_format(&reversed).unwrap().value();
        assert_eq!(a.format, b.format);
        assert_eq!(a.color_space, b.color_space);
    }

    #[test]
    fn test_choose_surface_format_requires_matching_color_space() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
            },
            format(vk::Format::R8G8B8A8_UNORM),
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert!(chosen.is_fallback());
        assert_eq!(chosen.value().color_space, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT);
    }

    #[test]
    fn test_choose_surface_format_fallback_and_empty() {
        let chosen = choose_surface_format(&[format(vk::Format::R8G8B8A8_UNORM)]).unwrap();
        assert!(chosen.is_fallback());
        assert_eq!(chosen.value().format, vk::Format::R8G8B8A8_UNORM);
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn test_choose_present_mode() {
        let with_mailbox = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(
            choose_present_mode(&with_mailbox),
            Preference::Preferred(vk::PresentModeKHR::MAILBOX)
        );

        let mut reversed = with_mailbox;
        reversed.reverse();
        assert_eq!(choose_present_mode(&reversed).value(), vk::PresentModeKHR::MAILBOX);

        let without = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&without),
            Preference::Fallback(vk::PresentModeKHR::FIFO)
        );
    }

    #[test]
    fn test_choose_extent_within_bounds() {
        let chosen = choose_extent(&sentinel_caps(), extent(3840, 2160));
        assert_eq!((chosen.width, chosen.height), (3840, 2160));
    }

    #[test]
    fn test_choose_extent_clamps_each_axis() {
        let chosen = choose_extent(&sentinel_caps(), extent(8000, 2000));
        assert_eq!((chosen.width, chosen.height), (4096, 2000));

        let chosen = choose_extent(&sentinel_caps(), extent(0, 0));
        assert_eq!((chosen.width, chosen.height), (1, 1));
    }

    #[test]
    fn test_choose_extent_uses_fixed_current_extent() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: extent(1920, 1080),
            ..sentinel_caps()
        };
        let chosen = choose_extent(&caps, extent(800, 600));
        assert_eq!((chosen.width, chosen.height), (1920, 1080));
    }

    #[test]
    fn test_choose_extent_is_idempotent() {
        let caps = sentinel_caps();
        for desired in [extent(8000, 2000), extent(0, 5000), extent(640, 480)] {
            let once = choose_extent(&caps, desired);
            let twice = choose_extent(&caps, once);
            assert_eq!((once.width, once.height), (twice.width, twice.height));
        }
    }

    #[test]
    fn test_choose_image_count() {
        let mut caps = sentinel_caps();
        assert_eq!(choose_image_count(&caps), 3); // unbounded

        caps.max_image_count = 2;
        assert_eq!(choose_image_count(&caps), 2);

        caps.min_image_count = 1;
        caps.max_image_count = 8;
        assert_eq!(choose_image_count(&caps), 2);
    }

    #[test]
    fn test_image_sharing() {
        let shared = QueueFamilies {
            graphics: 0,
            present: 0,
        };
        assert_eq!(ImageSharing::for_families(&shared), ImageSharing::Exclusive);
        assert!(ImageSharing::Exclusive.family_indices().is_empty());

        let split = QueueFamilies {
            graphics: 0,
            present: 1,
        };
        let sharing = ImageSharing::for_families(&split);
        assert_eq!(sharing.mode(), vk::SharingMode::CONCURRENT);
        assert_eq!(sharing.family_indices(), &[0, 1]);
    }

    #[test]
    fn test_negotiate_descriptor() {
        let support = SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                ..sentinel_caps()
            },
            formats: vec![format(vk::Format::R8G8B8A8_SRGB), format(vk::Format::B8G8R8A8_SRGB)],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        let families = QueueFamilies {
            graphics: 0,
            present: 0,
        };

        let descriptor = SwapchainDescriptor::negotiate(&support, &families, extent(1280, 720)).unwrap();
        assert_eq!(descriptor.surface_format.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(descriptor.present_mode, vk::PresentModeKHR::FIFO);
        assert_eq!((descriptor.extent.width, descriptor.extent.height), (1280, 720));
        assert_eq!(descriptor.image_count, 3);
        assert_eq!(descriptor.pre_transform, vk::SurfaceTransformFlagsKHR::IDENTITY);
        assert_eq!(descriptor.sharing, ImageSharing::Exclusive);
    }

    #[test]
    fn test_negotiate_without_formats_fails() {
        let support = SurfaceSupport {
            capabilities: sentinel_caps(),
            formats: Vec::new(),
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        let families = QueueFamilies {
            graphics: 0,
            present: 0,
        };
        assert!(matches!(
            SwapchainDescriptor::negotiate(&support, &families, extent(1, 1)),
            Err(RendererError::Swapchain { .. })
        ));
    }
}
