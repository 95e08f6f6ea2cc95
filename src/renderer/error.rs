use ash::vk;
use thiserror::Error;
use crate::renderer::frame::FramePhase;
use crate::renderer::pipeline::ShaderStageKind;

/// Why a pipeline could not be compiled
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("no {0:?} shader stage was provided")]
    MissingStage(ShaderStageKind),

    #[error("more than one {0:?} shader stage was provided")]
    DuplicateStage(ShaderStageKind),

    #[error("pipeline layout is null")]
    MissingLayout,

    #[error("render pass declares {expected} color attachment(s) but {found} blend attachment(s) were provided")]
    BlendAttachmentMismatch { expected: u32, found: u32 },

    #[error("depth/stencil state present: {has_depth_state}, render pass depth attachment: {pass_has_depth}")]
    DepthStateMismatch { has_depth_state: bool, pass_has_depth: bool },

    #[error("driver rejected the pipeline: {0}")]
    Driver(vk::Result),
}

impl PipelineError {
    /// Status code of the failure, as the driver would report it
    pub fn status(&self) -> vk::Result {
        match self {
            Self::Driver(status) => *status,
            _ => vk::Result::ERROR_INITIALIZATION_FAILED,
        }
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    /// A setup step could not create one of its resources
    #[error("failed to acquire {resource}: {status}")]
    AcquisitionFailure {
        resource: &'static str,
        status: vk::Result,
    },

    #[error("pipeline compilation failed: {0}")]
    PipelineCompilationFailed(#[from] PipelineError),

    /// The frame was dropped but the loop can keep going
    #[error("frame skipped while {phase:?}: {status}")]
    TransientFrameFailure {
        phase: FramePhase,
        status: vk::Result,
    },

    /// No further GPU progress can be assumed
    #[error("fatal device failure while {phase:?}: {status}")]
    FatalDeviceFailure {
        phase: FramePhase,
        status: vk::Result,
    },
}

impl RenderError {
    pub fn acquisition(resource: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |status| Self::AcquisitionFailure { resource, status }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalDeviceFailure { .. })
    }

    pub fn status(&self) -> vk::Result {
        match self {
            Self::AcquisitionFailure { status, .. }
            | Self::TransientFrameFailure { status, .. }
            | Self::FatalDeviceFailure { status, .. } => *status,
            Self::PipelineCompilationFailed(err) => err.status(),
        }
    }
}
