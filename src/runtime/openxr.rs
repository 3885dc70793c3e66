// OpenXR runtime - loader-backed implementation of the runtime seams
//
// Bring-up order matters to the runtime:
// 1. Load the loader, create the instance, find the HMD system
// 2. Query Vulkan requirements (mandatory before session creation)
// 3. Create the Vulkan device on the GPU the runtime names, with the
//    instance/device extensions it asks for
// 4. Create the session, reference spaces and the action set
//
// Render targets are the runtime's own VkImages, handed out as raw handles.

use anyhow::Result;
use ash::vk::{self, Handle};
use openxr as xr;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{
    BlendMode, CompositionSubmission, Event, Fov, FrameState, ImageWait, Pose, ReferenceSpaceType, Runtime,
    RuntimeSwapchain, SessionState, SwapchainCreateInfo, SwapchainId, TargetHandle, Time, View,
    ViewConfiguration, ViewConfigurationType, ViewConfigurationView, ViewStateFlags,
};
use crate::backend::device::{parse_extension_list, DeviceRequirements};
use crate::backend::VulkanDevice;
use crate::error::{check, Completion, StatusCode, XrError, XrResult};

const HAPTIC_PROFILE: &str = "/interaction_profiles/khr/simple_controller";
const HAPTIC_BINDING: &str = "/user/hand/right/output/haptic";

fn fail(operation: &'static str) -> impl FnOnce(xr::sys::Result) -> XrError {
    move |result| {
        let status = StatusCode(result.into_raw());
        log::error!("{} failed: {}", operation, status);
        XrError::runtime(operation, status)
    }
}

fn completion(operation: &'static str, result: xr::sys::Result) -> XrResult<Completion> {
    check(operation, StatusCode(result.into_raw()))
}

fn to_xr_view_configuration(kind: ViewConfigurationType) -> xr::ViewConfigurationType {
    match kind {
        ViewConfigurationType::PrimaryMono => xr::ViewConfigurationType::PRIMARY_MONO,
        ViewConfigurationType::PrimaryStereo => xr::ViewConfigurationType::PRIMARY_STEREO,
    }
}

fn to_xr_space(space: ReferenceSpaceType) -> xr::ReferenceSpaceType {
    match space {
        ReferenceSpaceType::View => xr::ReferenceSpaceType::VIEW,
        ReferenceSpaceType::Local => xr::ReferenceSpaceType::LOCAL,
        ReferenceSpaceType::Stage => xr::ReferenceSpaceType::STAGE,
    }
}

fn from_xr_space(space: xr::ReferenceSpaceType) -> Option<ReferenceSpaceType> {
    match space {
        xr::ReferenceSpaceType::VIEW => Some(ReferenceSpaceType::View),
        xr::ReferenceSpaceType::LOCAL => Some(ReferenceSpaceType::Local),
        xr::ReferenceSpaceType::STAGE => Some(ReferenceSpaceType::Stage),
        _ => None,
    }
}

fn to_xr_blend_mode(mode: BlendMode) -> xr::EnvironmentBlendMode {
    match mode {
        BlendMode::Opaque => xr::EnvironmentBlendMode::OPAQUE,
        BlendMode::Additive => xr::EnvironmentBlendMode::ADDITIVE,
        BlendMode::AlphaBlend => xr::EnvironmentBlendMode::ALPHA_BLEND,
    }
}

fn from_xr_state(state: xr::SessionState) -> Option<SessionState> {
    let state = match state {
        xr::SessionState::IDLE => SessionState::Idle,
        xr::SessionState::READY => SessionState::Ready,
        xr::SessionState::SYNCHRONIZED => SessionState::Synchronized,
        xr::SessionState::VISIBLE => SessionState::Visible,
        xr::SessionState::FOCUSED => SessionState::Focused,
        xr::SessionState::STOPPING => SessionState::Stopping,
        xr::SessionState::LOSS_PENDING => SessionState::LossPending,
        xr::SessionState::EXITING => SessionState::Exiting,
        _ => return None,
    };
    Some(state)
}

fn to_xr_pose(pose: &Pose) -> xr::Posef {
    xr::Posef {
        orientation: xr::Quaternionf {
            x: pose.orientation.x,
            y: pose.orientation.y,
            z: pose.orientation.z,
            w: pose.orientation.w,
        },
        position: xr::Vector3f {
            x: pose.position.x,
            y: pose.position.y,
            z: pose.position.z,
        },
    }
}

fn from_xr_view(view: &xr::View) -> View {
    let o = view.pose.orientation;
    let p = view.pose.position;
    View {
        pose: Pose {
            position: glam::Vec3::new(p.x, p.y, p.z),
            orientation: glam::Quat::from_xyzw(o.x, o.y, o.z, o.w),
        },
        fov: Fov {
            angle_left: view.fov.angle_left,
            angle_right: view.fov.angle_right,
            angle_up: view.fov.angle_up,
            angle_down: view.fov.angle_down,
        },
    }
}

/// Single action set; the haptic action only exists so the set has
/// something bound when it is synchronized.
struct Gameplay {
    action_set: xr::ActionSet,
    _player_hit: xr::Action<xr::Haptic>,
}

impl Gameplay {
    fn new(instance: &xr::Instance, session: &xr::Session<xr::Vulkan>) -> Result<Self> {
        let action_set = instance
            .create_action_set("gameplay", "Gameplay", 0)
            .map_err(|e| anyhow::anyhow!("OpenXR action set: {e:?}"))?;
        let player_hit = action_set
            .create_action::<xr::Haptic>("player_hit", "Player hit", &[])
            .map_err(|e| anyhow::anyhow!("OpenXR haptic action: {e:?}"))?;

        let profile = instance
            .string_to_path(HAPTIC_PROFILE)
            .map_err(|e| anyhow::anyhow!("OpenXR profile path: {e:?}"))?;
        let binding = instance
            .string_to_path(HAPTIC_BINDING)
            .map_err(|e| anyhow::anyhow!("OpenXR binding path: {e:?}"))?;
        if let Err(e) =
            instance.suggest_interaction_profile_bindings(profile, &[xr::Binding::new(&player_hit, binding)])
        {
            log::warn!("Binding suggestion rejected for {}: {:?}", HAPTIC_PROFILE, e);
        }

        session
            .attach_action_sets(&[&action_set])
            .map_err(|e| anyhow::anyhow!("OpenXR attach action sets: {e:?}"))?;

        Ok(Self {
            action_set,
            _player_hit: player_hit,
        })
    }
}

pub struct OpenXrRuntime {
    instance: xr::Instance,
    system: xr::SystemId,
    session: xr::Session<xr::Vulkan>,
    frame_waiter: xr::FrameWaiter,
    frame_stream: xr::FrameStream<xr::Vulkan>,
    spaces: HashMap<ReferenceSpaceType, xr::Space>,
    gameplay: Gameplay,
    view_kind: ViewConfigurationType,
    event_buffer: xr::EventDataBuffer,
}

impl OpenXrRuntime {
    /// Bring up instance, Vulkan device and session. The device is returned
    /// so the Vulkan backend draws on the GPU the runtime composites from.
    pub fn new(app_name: &str, validation: bool) -> Result<(Self, Arc<VulkanDevice>)> {
        let entry = unsafe { xr::Entry::load() }
            .map_err(|e| anyhow::anyhow!("Failed to load the OpenXR loader: {e:?}"))?;

        let available = entry
            .enumerate_extensions()
            .map_err(|e| anyhow::anyhow!("OpenXR extension enumeration: {e:?}"))?;
        if !available.khr_vulkan_enable {
            anyhow::bail!("OpenXR runtime does not offer XR_KHR_vulkan_enable");
        }
        let mut extensions = xr::ExtensionSet::default();
        extensions.khr_vulkan_enable = true;

        let instance = entry
            .create_instance(
                &xr::ApplicationInfo {
                    application_name: app_name,
                    application_version: 1,
                    engine_name: "xr-renderer",
                    engine_version: 1,
                },
                &extensions,
                &[],
            )
            .map_err(|e| anyhow::anyhow!("OpenXR create_instance: {e:?}"))?;
        if let Ok(props) = instance.properties() {
            let version = props.runtime_version;
            log::info!(
                "OpenXR runtime: {} {}.{}.{}",
                props.runtime_name,
                version.major(),
                version.minor(),
                version.patch()
            );
        }

        let system = instance
            .system(xr::FormFactor::HEAD_MOUNTED_DISPLAY)
            .map_err(|e| anyhow::anyhow!("No head-mounted display available: {e:?}"))?;

        // Required before any session exists
        let requirements = instance
            .graphics_requirements::<xr::Vulkan>(system)
            .map_err(|e| anyhow::anyhow!("OpenXR Vulkan requirements: {e:?}"))?;
        let min = requirements.min_api_version_supported;
        let instance_extensions = instance
            .vulkan_legacy_instance_extensions(system)
            .map_err(|e| anyhow::anyhow!("OpenXR Vulkan instance extensions: {e:?}"))?;
        let device_extensions = instance
            .vulkan_legacy_device_extensions(system)
            .map_err(|e| anyhow::anyhow!("OpenXR Vulkan device extensions: {e:?}"))?;

        let device_requirements = DeviceRequirements {
            app_name: app_name.to_string(),
            validation,
            api_version: vk::make_api_version(0, min.major() as u32, min.minor() as u32, min.patch())
                .max(vk::API_VERSION_1_1),
            instance_extensions: parse_extension_list(&instance_extensions),
            device_extensions: parse_extension_list(&device_extensions),
        };

        let device = VulkanDevice::with_physical_device(&device_requirements, |vk_instance| {
            let raw = unsafe { instance.vulkan_graphics_device(system, vk_instance.handle().as_raw() as *const _) }
                .map_err(|e| anyhow::anyhow!("OpenXR Vulkan graphics device: {e:?}"))?;
            Ok(vk::PhysicalDevice::from_raw(raw as u64))
        })?;

        let create_info = xr::vulkan::SessionCreateInfo {
            instance: device.instance.handle().as_raw() as *const _,
            physical_device: device.physical_device.as_raw() as *const _,
            device: device.device.handle().as_raw() as *const _,
            queue_family_index: device.graphics_queue_family,
            queue_index: 0,
        };
        let (session, frame_waiter, frame_stream) = unsafe {
            instance
                .create_session::<xr::Vulkan>(system, &create_info)
                .map_err(|e| anyhow::anyhow!("OpenXR create_session: {e:?}"))?
        };

        let mut spaces = HashMap::new();
        let supported = session
            .enumerate_reference_spaces()
            .map_err(|e| anyhow::anyhow!("OpenXR reference spaces: {e:?}"))?;
        for space in supported.into_iter().filter_map(from_xr_space) {
            let handle = session
                .create_reference_space(to_xr_space(space), to_xr_pose(&Pose::IDENTITY))
                .map_err(|e| anyhow::anyhow!("OpenXR create {:?} space: {e:?}", space))?;
            spaces.insert(space, handle);
        }

        let gameplay = Gameplay::new(&instance, &session)?;
        log::info!("OpenXR session created ({} reference spaces)", spaces.len());

        Ok((
            Self {
                instance,
                system,
                session,
                frame_waiter,
                frame_stream,
                spaces,
                gameplay,
                view_kind: ViewConfigurationType::PrimaryStereo,
                event_buffer: xr::EventDataBuffer::new(),
            },
            device,
        ))
    }

}

fn lookup_space(spaces: &HashMap<ReferenceSpaceType, xr::Space>, space: ReferenceSpaceType) -> XrResult<&xr::Space> {
    spaces
        .get(&space)
        .ok_or_else(|| XrError::Unsupported(format!("reference space {:?} was not created", space)))
}

impl Runtime for OpenXrRuntime {
    type Swapchain = OpenXrSwapchain;

    fn poll_event(&mut self) -> XrResult<Option<Event>> {
        let event = self
            .instance
            .poll_event(&mut self.event_buffer)
            .map_err(fail("xrPollEvent"))?;

        let translated = match event {
            None => return Ok(None),
            Some(xr::Event::SessionStateChanged(e)) => match from_xr_state(e.state()) {
                Some(state) => Event::SessionStateChanged {
                    state,
                    time: Time(e.time().as_nanos()),
                },
                None => Event::Unknown { type_code: None },
            },
            Some(xr::Event::InstanceLossPending(e)) => Event::InstanceLossPending {
                loss_time: Time(e.loss_time().as_nanos()),
            },
            Some(xr::Event::EventsLost(e)) => Event::EventsLost {
                lost_event_count: e.lost_event_count(),
            },
            Some(xr::Event::InteractionProfileChanged(_)) => Event::InteractionProfileChanged,
            Some(xr::Event::ReferenceSpaceChangePending(e)) => match from_xr_space(e.reference_space_type()) {
                Some(space) => Event::ReferenceSpaceChangePending { space },
                None => Event::Unknown { type_code: None },
            },
            Some(_) => Event::Unknown { type_code: None },
        };
        Ok(Some(translated))
    }

    fn begin_session(&mut self, view_configuration: ViewConfigurationType) -> XrResult<Completion> {
        self.view_kind = view_configuration;
        let result = self
            .session
            .begin(to_xr_view_configuration(view_configuration))
            .map_err(fail("xrBeginSession"))?;
        completion("xrBeginSession", result)
    }

    fn end_session(&mut self) -> XrResult<Completion> {
        let result = self.session.end().map_err(fail("xrEndSession"))?;
        completion("xrEndSession", result)
    }

    fn request_exit_session(&mut self) -> XrResult<Completion> {
        self.session.request_exit().map_err(fail("xrRequestExitSession"))?;
        Ok(Completion::Success)
    }

    fn wait_frame(&mut self) -> XrResult<FrameState> {
        let state = self.frame_waiter.wait().map_err(fail("xrWaitFrame"))?;
        Ok(FrameState {
            predicted_display_time: Time(state.predicted_display_time.as_nanos()),
            predicted_display_period: Duration::from_nanos(state.predicted_display_period.as_nanos().max(0) as u64),
            should_render: state.should_render,
        })
    }

    fn begin_frame(&mut self) -> XrResult<Completion> {
        let result = self.frame_stream.begin().map_err(fail("xrBeginFrame"))?;
        completion("xrBeginFrame", result)
    }

    fn end_frame(&mut self, submission: &CompositionSubmission) -> XrResult<Completion> {
        let display_time = xr::Time::from_nanos(submission.display_time.as_nanos());
        let blend_mode = to_xr_blend_mode(submission.blend_mode);

        // A begun frame must still be ended, so a bad layer goes out as no layers.
        if let Some(space) = submission.missing_space(|space| self.spaces.contains_key(&space)) {
            self.frame_stream
                .end(display_time, blend_mode, &[])
                .map_err(fail("xrEndFrame"))?;
            return Err(XrError::Unsupported(format!("reference space {:?} was not created", space)));
        }

        let mut view_sets = Vec::with_capacity(submission.layers.len());
        for layer in &submission.layers {
            let views: Vec<xr::CompositionLayerProjectionView<xr::Vulkan>> = layer
                .views
                .iter()
                .map(|view| {
                    let rect = view.sub_image.rect;
                    let sub_image = unsafe {
                        xr::SwapchainSubImage::from_raw(xr::sys::SwapchainSubImage {
                            swapchain: xr::sys::Swapchain::from_raw(view.sub_image.swapchain.0),
                            image_rect: xr::Rect2Di {
                                offset: xr::Offset2Di { x: rect.x, y: rect.y },
                                extent: xr::Extent2Di {
                                    width: rect.extent.width as i32,
                                    height: rect.extent.height as i32,
                                },
                            },
                            image_array_index: view.sub_image.array_index,
                        })
                    };
                    xr::CompositionLayerProjectionView::new()
                        .pose(to_xr_pose(&view.pose))
                        .fov(xr::Fovf {
                            angle_left: view.fov.angle_left,
                            angle_right: view.fov.angle_right,
                            angle_up: view.fov.angle_up,
                            angle_down: view.fov.angle_down,
                        })
                        .sub_image(sub_image)
                })
                .collect();
            view_sets.push(views);
        }

        let mut projections = Vec::with_capacity(submission.layers.len());
        for (layer, views) in submission.layers.iter().zip(&view_sets) {
            let flags = if layer.blend_texture_source_alpha {
                xr::CompositionLayerFlags::BLEND_TEXTURE_SOURCE_ALPHA
            } else {
                xr::CompositionLayerFlags::EMPTY
            };
            projections.push(
                xr::CompositionLayerProjection::new()
                    .layer_flags(flags)
                    .space(lookup_space(&self.spaces, layer.space)?)
                    .views(views),
            );
        }
        let layers: Vec<&xr::CompositionLayerBase<xr::Vulkan>> = projections.iter().map(|layer| &**layer).collect();

        self.frame_stream
            .end(display_time, blend_mode, &layers)
            .map_err(fail("xrEndFrame"))?;
        Ok(Completion::Success)
    }

    fn locate_views(
        &mut self,
        display_time: Time,
        space: ReferenceSpaceType,
    ) -> XrResult<(ViewStateFlags, Vec<View>)> {
        let (flags, views) = self
            .session
            .locate_views(
                to_xr_view_configuration(self.view_kind),
                xr::Time::from_nanos(display_time.as_nanos()),
                lookup_space(&self.spaces, space)?,
            )
            .map_err(fail("xrLocateViews"))?;
        Ok((
            ViewStateFlags(flags.into_raw()),
            views.iter().map(from_xr_view).collect(),
        ))
    }

    fn sync_actions(&mut self) -> XrResult<Completion> {
        self.session
            .sync_actions(&[xr::ActiveActionSet::new(&self.gameplay.action_set)])
            .map_err(fail("xrSyncActions"))?;
        Ok(Completion::Success)
    }

    fn view_configuration(&mut self, kind: ViewConfigurationType) -> XrResult<ViewConfiguration> {
        let views = self
            .instance
            .enumerate_view_configuration_views(self.system, to_xr_view_configuration(kind))
            .map_err(fail("xrEnumerateViewConfigurationViews"))?;
        let views = views
            .iter()
            .map(|view| ViewConfigurationView {
                recommended_width: view.recommended_image_rect_width,
                recommended_height: view.recommended_image_rect_height,
                max_width: view.max_image_rect_width,
                max_height: view.max_image_rect_height,
                recommended_sample_count: view.recommended_swapchain_sample_count,
                max_sample_count: view.max_swapchain_sample_count,
            })
            .collect();
        Ok(ViewConfiguration::new(kind, views))
    }

    fn environment_blend_modes(&mut self, kind: ViewConfigurationType) -> XrResult<Vec<BlendMode>> {
        let modes = self
            .instance
            .enumerate_environment_blend_modes(self.system, to_xr_view_configuration(kind))
            .map_err(fail("xrEnumerateEnvironmentBlendModes"))?;
        Ok(modes
            .into_iter()
            .filter_map(|mode| match mode {
                xr::EnvironmentBlendMode::OPAQUE => Some(BlendMode::Opaque),
                xr::EnvironmentBlendMode::ADDITIVE => Some(BlendMode::Additive),
                xr::EnvironmentBlendMode::ALPHA_BLEND => Some(BlendMode::AlphaBlend),
                _ => None,
            })
            .collect())
    }

    fn reference_spaces(&mut self) -> XrResult<Vec<ReferenceSpaceType>> {
        let spaces = self
            .session
            .enumerate_reference_spaces()
            .map_err(fail("xrEnumerateReferenceSpaces"))?;
        Ok(spaces.into_iter().filter_map(from_xr_space).collect())
    }

    fn swapchain_formats(&mut self) -> XrResult<Vec<i64>> {
        let formats = self
            .session
            .enumerate_swapchain_formats()
            .map_err(fail("xrEnumerateSwapchainFormats"))?;
        Ok(formats.into_iter().map(i64::from).collect())
    }

    fn create_swapchain(&mut self, info: &SwapchainCreateInfo) -> XrResult<OpenXrSwapchain> {
        let format = u32::try_from(info.format)
            .map_err(|_| XrError::runtime("xrCreateSwapchain", StatusCode::ERROR_SWAPCHAIN_FORMAT_UNSUPPORTED))?;
        let swapchain = self
            .session
            .create_swapchain(&xr::SwapchainCreateInfo {
                create_flags: xr::SwapchainCreateFlags::EMPTY,
                usage_flags: xr::SwapchainUsageFlags::COLOR_ATTACHMENT | xr::SwapchainUsageFlags::TRANSFER_DST,
                format,
                sample_count: info.sample_count.max(1),
                width: info.extent.width,
                height: info.extent.height,
                face_count: 1,
                array_size: 1,
                mip_count: 1,
            })
            .map_err(fail("xrCreateSwapchain"))?;
        Ok(OpenXrSwapchain {
            instance: self.instance.clone(),
            swapchain,
        })
    }
}

pub struct OpenXrSwapchain {
    instance: xr::Instance,
    swapchain: xr::Swapchain<xr::Vulkan>,
}

impl RuntimeSwapchain for OpenXrSwapchain {
    fn id(&self) -> SwapchainId {
        SwapchainId(self.swapchain.as_raw().into_raw())
    }

    fn enumerate_images(&mut self) -> XrResult<Vec<TargetHandle>> {
        let images = self
            .swapchain
            .enumerate_images()
            .map_err(fail("xrEnumerateSwapchainImages"))?;
        Ok(images.into_iter().map(TargetHandle).collect())
    }

    fn acquire_image(&mut self) -> XrResult<u32> {
        self.swapchain
            .acquire_image()
            .map_err(fail("xrAcquireSwapchainImage"))
    }

    fn wait_image(&mut self, timeout: Duration) -> XrResult<ImageWait> {
        // The safe wrapper folds TIMEOUT_EXPIRED into success
        let info = xr::sys::SwapchainImageWaitInfo {
            ty: xr::sys::SwapchainImageWaitInfo::TYPE,
            next: std::ptr::null(),
            timeout: xr::Duration::from_nanos(i64::try_from(timeout.as_nanos()).unwrap_or(i64::MAX)),
        };
        let result = unsafe { (self.instance.fp().wait_swapchain_image)(self.swapchain.as_raw(), &info) };
        match StatusCode(result.into_raw()) {
            StatusCode::TIMEOUT_EXPIRED => Ok(ImageWait::TimedOut),
            status => check("xrWaitSwapchainImage", status).map(|_| ImageWait::Ready),
        }
    }

    fn release_image(&mut self) -> XrResult<Completion> {
        self.swapchain
            .release_image()
            .map_err(fail("xrReleaseSwapchainImage"))?;
        Ok(Completion::Success)
    }
}
