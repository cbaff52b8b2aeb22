// Layout lookup tables
//
// Every layout kind maps to the pipeline stages and access bits that touch
// an image while it sits in that layout. A transition is derived from two
// lookups: the old layout gives the source scope, the new one the
// destination scope.

use ash::vk;

use crate::error::{FrameError, FrameResult};

/// Stages the acquire semaphore is waited at. An image leaving PRESENT_SRC
/// must use these as its source stages so the barrier chains to the wait.
pub const ACQUIRE_WAIT_STAGES: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT.as_raw() | vk::PipelineStageFlags::TRANSFER.as_raw(),
);

const SHADER_STAGES: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::VERTEX_SHADER.as_raw()
        | vk::PipelineStageFlags::FRAGMENT_SHADER.as_raw()
        | vk::PipelineStageFlags::COMPUTE_SHADER.as_raw(),
);

const FRAGMENT_TESTS: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS.as_raw()
        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS.as_raw(),
);

/// Layouts the tracker knows how to move between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutKind {
    Undefined,
    Preinitialized,
    /// General/storage layout. Needs an `AccessKind` alongside.
    General,
    ColorAttachment,
    DepthStencilAttachment,
    DepthStencilReadOnly,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    Present,
}

impl LayoutKind {
    pub const ALL: [LayoutKind; 10] = [
        LayoutKind::Undefined,
        LayoutKind::Preinitialized,
        LayoutKind::General,
        LayoutKind::ColorAttachment,
        LayoutKind::DepthStencilAttachment,
        LayoutKind::DepthStencilReadOnly,
        LayoutKind::ShaderReadOnly,
        LayoutKind::TransferSrc,
        LayoutKind::TransferDst,
        LayoutKind::Present,
    ];

    pub fn to_vk(self) -> vk::ImageLayout {
        match self {
            LayoutKind::Undefined => vk::ImageLayout::UNDEFINED,
            LayoutKind::Preinitialized => vk::ImageLayout::PREINITIALIZED,
            LayoutKind::General => vk::ImageLayout::GENERAL,
            LayoutKind::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            LayoutKind::DepthStencilAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            LayoutKind::DepthStencilReadOnly => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            LayoutKind::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            LayoutKind::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            LayoutKind::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            LayoutKind::Present => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    /// Only the general layout is ambiguous about direction
    pub fn needs_access_kind(self) -> bool {
        self == LayoutKind::General
    }

    /// Whether an image may be moved into this layout
    pub fn is_valid_target(self) -> bool {
        !matches!(self, LayoutKind::Undefined | LayoutKind::Preinitialized)
    }
}

/// Direction of shader access for the general/storage layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessKind {
    fn shader_access(self) -> vk::AccessFlags {
        match self {
            AccessKind::ReadOnly => vk::AccessFlags::SHADER_READ,
            AccessKind::WriteOnly => vk::AccessFlags::SHADER_WRITE,
            AccessKind::ReadWrite => vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        }
    }
}

/// Stages + access bits on one side of a barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scope {
    pub stages: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
}

impl Scope {
    /// Cheapest possible source scope: nothing to wait for
    pub const NONE: Scope = Scope {
        stages: vk::PipelineStageFlags::TOP_OF_PIPE,
        access: vk::AccessFlags::empty(),
    };

    const fn new(stages: vk::PipelineStageFlags, access: vk::AccessFlags) -> Self {
        Self { stages, access }
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty() && self.access.is_empty()
    }

    /// Scope of work that used the image while it was in `layout`
    pub fn source(layout: LayoutKind, access: Option<AccessKind>) -> FrameResult<Self> {
        Ok(match layout {
            LayoutKind::Undefined => Scope::NONE,
            LayoutKind::Preinitialized => Scope::new(vk::PipelineStageFlags::HOST, vk::AccessFlags::HOST_WRITE),
            // Presentation engine reads are covered by the acquire semaphore
            LayoutKind::Present => Scope::new(ACQUIRE_WAIT_STAGES, vk::AccessFlags::empty()),
            other => Self::common(other, access)?,
        })
    }

    /// Scope of work that will use the image once it is in `layout`
    pub fn destination(layout: LayoutKind, access: Option<AccessKind>) -> FrameResult<Self> {
        match layout {
            LayoutKind::Undefined | LayoutKind::Preinitialized => {
                Err(FrameError::InvalidTargetLayout(layout))
            }
            LayoutKind::Present => Ok(Scope::new(
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::AccessFlags::empty(),
            )),
            other => Self::common(other, access),
        }
    }

    fn common(layout: LayoutKind, access: Option<AccessKind>) -> FrameResult<Self> {
        let scope = match layout {
            LayoutKind::General => {
                let access = access.ok_or(FrameError::MissingAccessKind(layout))?;
                Scope::new(SHADER_STAGES, access.shader_access())
            }
            LayoutKind::ColorAttachment => Scope::new(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ),
            LayoutKind::DepthStencilAttachment => Scope::new(
                FRAGMENT_TESTS,
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ),
            LayoutKind::DepthStencilReadOnly => Scope::new(
                FRAGMENT_TESTS | vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::SHADER_READ,
            ),
            LayoutKind::ShaderReadOnly => Scope::new(SHADER_STAGES, vk::AccessFlags::SHADER_READ),
            LayoutKind::TransferSrc => {
                Scope::new(vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_READ)
            }
            LayoutKind::TransferDst => {
                Scope::new(vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE)
            }
            LayoutKind::Undefined | LayoutKind::Preinitialized | LayoutKind::Present => {
                unreachable!("handled by source/destination")
            }
        };
        Ok(scope)
    }
}

/// A derived layout change. Never stored; computed per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src: Scope,
    pub dst: Scope,
}

impl LayoutTransition {
    /// Derive the barrier scopes for `old -> new`.
    ///
    /// With `discard` the previous contents are don't-care: the source scope
    /// becomes `Scope::NONE` and the old layout UNDEFINED, so no false
    /// dependency on earlier work is created. An image leaving PRESENT_SRC
    /// still waits at the acquire stages, otherwise the layout change could
    /// run before the presentation engine released it.
    pub fn derive(
        old: LayoutKind,
        old_access: Option<AccessKind>,
        new: LayoutKind,
        new_access: Option<AccessKind>,
        discard: bool,
    ) -> FrameResult<Self> {
        let dst = Scope::destination(new, new_access)?;
        let (old_layout, src) = if discard {
            let src = match old {
                LayoutKind::Present => Scope::source(old, None)?,
                _ => Scope::NONE,
            };
            (vk::ImageLayout::UNDEFINED, src)
        } else {
            (old.to_vk(), Scope::source(old, old_access)?)
        };

        Ok(Self {
            old_layout,
            new_layout: new.to_vk(),
            src,
            dst,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access_for(layout: LayoutKind) -> Option<AccessKind> {
        layout.needs_access_kind().then_some(AccessKind::ReadWrite)
    }

    #[test]
    fn test_every_transition_has_a_sync_scope() {
        for old in LayoutKind::ALL {
            for new in LayoutKind::ALL.into_iter().filter(|l| l.is_valid_target()) {
                let t = LayoutTransition::derive(old, access_for(old), new, access_for(new), false)
                    .unwrap();
                assert!(!t.src.stages.is_empty(), "{old:?} -> {new:?} has no source stage");
                assert!(!t.dst.stages.is_empty(), "{old:?} -> {new:?} has no destination stage");
                assert!(!(t.src.is_empty() && t.dst.is_empty()));
            }
        }
    }

    #[test]
    fn test_undefined_and_preinitialized_are_not_targets() {
        for target in [LayoutKind::Undefined, LayoutKind::Preinitialized] {
            let err = LayoutTransition::derive(LayoutKind::General, Some(AccessKind::ReadOnly), target, None, false)
                .unwrap_err();
            assert!(matches!(err, FrameError::InvalidTargetLayout(l) if l == target));
        }
    }

    #[test]
    fn test_general_requires_access_kind() {
        let err = LayoutTransition::derive(LayoutKind::Undefined, None, LayoutKind::General, None, false)
            .unwrap_err();
        assert!(matches!(err, FrameError::MissingAccessKind(LayoutKind::General)));

        let err = LayoutTransition::derive(LayoutKind::General, None, LayoutKind::ShaderReadOnly, None, false)
            .unwrap_err();
        assert!(matches!(err, FrameError::MissingAccessKind(LayoutKind::General)));
    }

    #[test]
    fn test_storage_direction_changes_access_mask() {
        let t = LayoutTransition::derive(
            LayoutKind::General,
            Some(AccessKind::ReadOnly),
            LayoutKind::General,
            Some(AccessKind::WriteOnly),
            false,
        )
        .unwrap();
        assert_eq!(t.old_layout, t.new_layout);
        assert_eq!(t.src.access, vk::AccessFlags::SHADER_READ);
        assert_eq!(t.dst.access, vk::AccessFlags::SHADER_WRITE);
    }

    #[test]
    fn test_discard_uses_cheap_source_scope() {
        let t = LayoutTransition::derive(
            LayoutKind::ShaderReadOnly,
            None,
            LayoutKind::ColorAttachment,
            None,
            true,
        )
        .unwrap();
        assert_eq!(t.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(t.src, Scope::NONE);
        assert_eq!(t.dst.stages, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
    }

    #[test]
    fn test_discarding_present_image_still_waits_for_acquire() {
        let t = LayoutTransition::derive(LayoutKind::Present, None, LayoutKind::ColorAttachment, None, true)
            .unwrap();
        assert_eq!(t.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(t.src.stages, ACQUIRE_WAIT_STAGES);
    }

    #[test]
    fn test_leaving_present_chains_to_acquire_wait() {
        let t = LayoutTransition::derive(LayoutKind::Present, None, LayoutKind::TransferDst, None, false)
            .unwrap();
        assert_eq!(t.src.stages, ACQUIRE_WAIT_STAGES);
        assert!(t.src.access.is_empty());
        assert_eq!(t.dst.access, vk::AccessFlags::TRANSFER_WRITE);
    }
}
