// Swapchain pool - one view's runtime-owned ring of render targets
//
// The pool is the only place that maps an acquired image index back to its
// target handle. It tracks the single outstanding image and refuses calls
// that would break the acquire -> wait -> release cycle before they reach
// the runtime.

use std::time::Duration;

use crate::backend::PixelFormat;
use crate::error::{Completion, XrError, XrResult};
use crate::runtime::{Extent2D, ImageWait, RuntimeSwapchain, SwapchainId, TargetHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outstanding {
    None,
    Acquired(u32),
    Waited(u32),
}

pub struct SwapchainPool<S: RuntimeSwapchain> {
    view_index: usize,
    swapchain: S,
    targets: Vec<TargetHandle>,
    format: PixelFormat,
    extent: Extent2D,
    outstanding: Outstanding,
}

impl<S: RuntimeSwapchain> SwapchainPool<S> {
    /// Take ownership of `swapchain` and enumerate its images.
    pub fn new(view_index: usize, mut swapchain: S, format: PixelFormat, extent: Extent2D) -> XrResult<Self> {
        let targets = swapchain.enumerate_images()?;
        if targets.is_empty() {
            return Err(XrError::Consistency(format!(
                "swapchain for view {} has no images",
                view_index
            )));
        }

        log::info!(
            "View {} swapchain {:?}: {} images, {}x{} {}",
            view_index,
            swapchain.id(),
            targets.len(),
            extent.width,
            extent.height,
            format.name
        );

        Ok(Self {
            view_index,
            swapchain,
            targets,
            format,
            extent,
            outstanding: Outstanding::None,
        })
    }

    pub fn view_index(&self) -> usize {
        self.view_index
    }

    pub fn id(&self) -> SwapchainId {
        self.swapchain.id()
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn extent(&self) -> Extent2D {
        self.extent
    }

    /// Ring size.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Index of the image acquired and not yet released, if any.
    pub fn outstanding(&self) -> Option<u32> {
        match self.outstanding {
            Outstanding::None => None,
            Outstanding::Acquired(index) | Outstanding::Waited(index) => Some(index),
        }
    }

    pub fn acquire(&mut self) -> XrResult<u32> {
        if let Some(index) = self.outstanding() {
            return Err(XrError::protocol(
                "xrAcquireSwapchainImage",
                format!("view {} still holds image {}", self.view_index, index),
            ));
        }

        let index = self.swapchain.acquire_image()?;
        if index as usize >= self.targets.len() {
            return Err(XrError::Consistency(format!(
                "runtime acquired image {} but view {} only has {} images",
                index,
                self.view_index,
                self.targets.len()
            )));
        }

        log::trace!("View {} acquired image {}", self.view_index, index);
        self.outstanding = Outstanding::Acquired(index);
        Ok(index)
    }

    /// Wait for the outstanding image. A timeout leaves it acquired but
    /// not writable.
    pub fn wait(&mut self, timeout: Duration) -> XrResult<ImageWait> {
        let index = self.outstanding().ok_or_else(|| {
            XrError::protocol(
                "xrWaitSwapchainImage",
                format!("view {} has no acquired image", self.view_index),
            )
        })?;

        let wait = self.swapchain.wait_image(timeout)?;
        if wait == ImageWait::Ready {
            self.outstanding = Outstanding::Waited(index);
        }
        Ok(wait)
    }

    /// Target behind the outstanding image, once it is writable.
    pub fn writable_target(&self) -> XrResult<TargetHandle> {
        match self.outstanding {
            Outstanding::Waited(index) => Ok(self.targets[index as usize]),
            _ => Err(XrError::protocol(
                "render_to_target",
                format!("view {} has no writable image", self.view_index),
            )),
        }
    }

    pub fn release(&mut self) -> XrResult<Completion> {
        if self.outstanding == Outstanding::None {
            return Err(XrError::protocol(
                "xrReleaseSwapchainImage",
                format!("view {} has no acquired image", self.view_index),
            ));
        }

        let completion = self.swapchain.release_image()?;
        log::trace!("View {} released image", self.view_index);
        self.outstanding = Outstanding::None;
        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::format;
    use crate::config::SimulationConfig;
    use crate::error::StatusCode;
    use crate::runtime::simulated::{Call, Op, SimulatedRuntime, SimulatedSwapchain, SimulationHandle};
    use crate::runtime::{Runtime, SwapchainCreateInfo};

    fn pool() -> (SwapchainPool<SimulatedSwapchain>, SimulationHandle) {
        let mut runtime = SimulatedRuntime::new(SimulationConfig::default());
        let handle = runtime.handle();
        let extent = Extent2D::new(32, 32);
        let swapchain = runtime
            .create_swapchain(&SwapchainCreateInfo {
                format: format::R16G16B16A16_SFLOAT.code,
                extent,
                sample_count: 1,
            })
            .unwrap();
        let pool = SwapchainPool::new(0, swapchain, format::R16G16B16A16_SFLOAT, extent).unwrap();
        (pool, handle)
    }

    #[test]
    fn full_cycle_walks_the_ring() {
        let (mut pool, _handle) = pool();
        assert_eq!(pool.len(), 3);

        for expected in [0, 1, 2, 0] {
            let index = pool.acquire().unwrap();
            assert_eq!(index, expected);
            assert_eq!(pool.wait(Duration::ZERO).unwrap(), ImageWait::Ready);
            assert_eq!(pool.writable_target().unwrap(), TargetHandle(u64::from(index) + 1));
            pool.release().unwrap();
            assert_eq!(pool.outstanding(), None);
        }
    }

    #[test]
    fn double_acquire_never_reaches_runtime() {
        let (mut pool, handle) = pool();
        pool.acquire().unwrap();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, XrError::Protocol { .. }));
        assert_eq!(handle.count(|c| matches!(c, Call::AcquireImage(_))), 1);
    }

    #[test]
    fn timed_out_image_is_not_writable_but_releasable() {
        let (mut pool, handle) = pool();
        handle.time_out_image_waits(1);

        pool.acquire().unwrap();
        assert_eq!(pool.wait(Duration::ZERO).unwrap(), ImageWait::TimedOut);
        assert!(pool.writable_target().is_err());
        pool.release().unwrap();
        assert_eq!(handle.outstanding_images(), 0);
    }

    #[test]
    fn wait_and_release_need_an_acquired_image() {
        let (mut pool, handle) = pool();
        assert!(matches!(pool.wait(Duration::ZERO), Err(XrError::Protocol { .. })));
        assert!(matches!(pool.release(), Err(XrError::Protocol { .. })));
        assert_eq!(handle.count(|c| matches!(c, Call::WaitImage(_) | Call::ReleaseImage(_))), 0);
    }

    #[test]
    fn failed_acquire_leaves_nothing_outstanding() {
        let (mut pool, handle) = pool();
        handle.script(Op::AcquireImage, StatusCode::ERROR_RUNTIME_FAILURE);
        let err = pool.acquire().unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::ERROR_RUNTIME_FAILURE));
        assert_eq!(pool.outstanding(), None);
    }
}
