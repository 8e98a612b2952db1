// Renderer error taxonomy
//
// Everything here is fatal except PresentationStale, which the frame loop
// absorbs by recreating the swapchain.

use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no memory type in filter {type_filter:#034b} has properties {required:?}")]
    NoSuitableMemoryType {
        type_filter: u32,
        required: vk::MemoryPropertyFlags,
    },

    #[error("failed to create {what}: {result}")]
    ResourceCreation {
        what: &'static str,
        result: vk::Result,
    },

    #[error("unsupported image layout transition {from:?} -> {to:?}")]
    UnsupportedTransition {
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    },

    #[error("format {format:?} is unsupported: {reason}")]
    UnsupportedFormat {
        format: vk::Format,
        reason: &'static str,
    },

    #[error("swapchain is out of date")]
    PresentationStale,

    #[error("queue submission failed: {0}")]
    Submission(vk::Result),
}

impl RenderError {
    /// Shorthand for wrapping a failed `vkCreate*`/`vkAllocate*` call.
    pub fn creation(what: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| Self::ResourceCreation { what, result }
    }
}
