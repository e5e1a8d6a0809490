//! Physical device filtering and queue family assignment.
//!
//! Everything here operates on plain data gathered from the driver
//! ([`PhysicalDeviceCandidate`]) so the selection rules can be exercised
//! without a GPU. [`crate::device::Device::create`] gathers candidates,
//! calls [`select_candidate`] and builds the logical device from the
//! winning [`Evaluation`].
//!
//! Each queue family gets a specialization score:
//!
//! ```text
//! score = 10 * graphics + 8 * compute_only + 6 * transfer_only - 1 / queue_count
//! ```
//!
//! Roles then pick the family that maximises their role score: graphics
//! and present take the raw score, compute subtracts the graphics term so
//! a dedicated compute family wins, and transfer negates it so the least
//! specialised transfer-capable family (a pure DMA family when present)
//! wins.

use std::ffi::{CStr, CString};

use ash::vk;
use thiserror::Error;

use crate::instance::VkVersion;

/// How queue roles are spread over families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    /// Each role takes its best scoring family.
    #[default]
    Auto,
    /// Compute and transfer share the graphics family.
    Unified,
    /// Like `Unified`, and only one queue is created for that family.
    Single,
}

/// Descriptor indexing feature bits reported by a physical device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorIndexingSupport {
    pub runtime_array: bool,
    pub partially_bound: bool,
    pub variable_count: bool,
    pub sampled_image_update_after_bind: bool,
    pub storage_buffer_update_after_bind: bool,
    pub non_uniform_sampled_image_indexing: bool,
}

impl DescriptorIndexingSupport {
    /// The subset needed for variable-count, partially bound,
    /// update-after-bind texture arrays.
    pub fn supports_bindless_textures(&self) -> bool {
        self.runtime_array
            && self.partially_bound
            && self.variable_count
            && self.sampled_image_update_after_bind
    }
}

/// What the caller needs from a physical device.
#[derive(Debug, Clone)]
pub struct DeviceRequirements {
    /// Reject anything that is not `DISCRETE_GPU`.
    pub discrete_only: bool,
    /// Extensions on top of the ones the renderer itself needs.
    pub extensions: Vec<CString>,
    pub descriptor_indexing: bool,
    pub queue_mode: QueueMode,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            discrete_only: true,
            extensions: Vec::new(),
            descriptor_indexing: false,
            queue_mode: QueueMode::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueFamilyInfo {
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    pub supports_present: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Graphics,
    Compute,
    Transfer,
    Present,
}

impl QueueRole {
    pub const ALL: [QueueRole; 4] = [
        QueueRole::Graphics,
        QueueRole::Compute,
        QueueRole::Transfer,
        QueueRole::Present,
    ];
}

impl std::fmt::Display for QueueRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QueueRole::Graphics => "graphics",
            QueueRole::Compute => "compute",
            QueueRole::Transfer => "transfer",
            QueueRole::Present => "present",
        };
        f.write_str(name)
    }
}

/// Specialization score of a queue family. Families with no queues are
/// never selected, see [`role_score`].
pub fn family_score(family: &QueueFamilyInfo) -> f32 {
    let flags = family.flags;
    let graphics = flags.contains(vk::QueueFlags::GRAPHICS);
    let compute_only = flags.contains(vk::QueueFlags::COMPUTE) && !graphics;
    let transfer_only = flags.contains(vk::QueueFlags::TRANSFER)
        && !graphics
        && !flags.contains(vk::QueueFlags::COMPUTE);

    10.0 * graphics as u32 as f32
        + 8.0 * compute_only as u32 as f32
        + 6.0 * transfer_only as u32 as f32
        - 1.0 / family.queue_count.max(1) as f32
}

/// Score of `family` for `role`, or `None` if it cannot serve the role.
pub fn role_score(role: QueueRole, family: &QueueFamilyInfo) -> Option<f32> {
    if family.queue_count == 0 {
        return None;
    }
    let flags = family.flags;
    let score = family_score(family);
    let graphics = flags.contains(vk::QueueFlags::GRAPHICS);
    match role {
        QueueRole::Graphics => graphics.then_some(score),
        QueueRole::Compute => flags
            .contains(vk::QueueFlags::COMPUTE)
            .then_some(score - if graphics { 10.0 } else { 0.0 }),
        // Graphics and compute families accept transfer commands even when
        // the bit is not reported.
        QueueRole::Transfer => flags
            .intersects(
                vk::QueueFlags::TRANSFER
                    | vk::QueueFlags::GRAPHICS
                    | vk::QueueFlags::COMPUTE,
            )
            .then_some(-score),
        QueueRole::Present => family.supports_present.then_some(score),
    }
}

/// Best family for `role`. Equal scores resolve to the lowest index.
pub fn pick_family(role: QueueRole, families: &[QueueFamilyInfo]) -> Option<u32> {
    families
        .iter()
        .enumerate()
        .filter_map(|(idx, fam)| role_score(role, fam).map(|s| (idx, s)))
        .max_by(|(i1, s1), (i2, s2)| s1.total_cmp(s2).then(i2.cmp(i1)))
        .map(|(idx, _)| idx as u32)
}

/// Family index chosen for each of the four queue roles. Several roles
/// may share a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyAssignment {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
    pub present: u32,
}

impl QueueFamilyAssignment {
    pub fn family(&self, role: QueueRole) -> u32 {
        match role {
            QueueRole::Graphics => self.graphics,
            QueueRole::Compute => self.compute,
            QueueRole::Transfer => self.transfer,
            QueueRole::Present => self.present,
        }
    }

    /// Number of compute/transfer roles served outside the graphics
    /// family.
    pub fn dedicated_roles(&self) -> u32 {
        (self.compute != self.graphics) as u32
            + (self.transfer != self.graphics) as u32
    }
}

/// Assigns every role or reports the first role nothing can serve.
pub fn assign_queue_families(
    families: &[QueueFamilyInfo],
    mode: QueueMode,
) -> Result<QueueFamilyAssignment, QueueRole> {
    let pick = |role| pick_family(role, families).ok_or(role);
    let graphics = pick(QueueRole::Graphics)?;
    let present = pick(QueueRole::Present)?;
    match mode {
        QueueMode::Auto => Ok(QueueFamilyAssignment {
            graphics,
            compute: pick(QueueRole::Compute)?,
            transfer: pick(QueueRole::Transfer)?,
            present,
        }),
        QueueMode::Unified | QueueMode::Single => {
            let graphics_presents = families[graphics as usize].supports_present;
            if !families[graphics as usize]
                .flags
                .contains(vk::QueueFlags::COMPUTE)
            {
                return Err(QueueRole::Compute);
            }
            Ok(QueueFamilyAssignment {
                graphics,
                compute: graphics,
                transfer: graphics,
                present: if graphics_presents { graphics } else { present },
            })
        }
    }
}

/// Driver-reported facts about one physical device.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceCandidate {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: VkVersion,
    pub extensions: Vec<CString>,
    pub queue_families: Vec<QueueFamilyInfo>,
    pub surface_format_count: usize,
    pub present_mode_count: usize,
    pub descriptor_indexing: DescriptorIndexingSupport,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum Rejection {
    #[error("device type {0:?} is not a discrete GPU")]
    NotDiscrete(vk::PhysicalDeviceType),
    #[error("device only supports Vulkan {0}, 1.1 is required")]
    UnsupportedVersion(VkVersion),
    #[error("missing device extensions {0:?}")]
    MissingExtensions(Vec<String>),
    #[error("surface reports no formats")]
    NoSurfaceFormats,
    #[error("surface reports no present modes")]
    NoPresentModes,
    #[error("descriptor indexing requested but not supported")]
    DescriptorIndexingUnsupported,
    #[error("no queue family can serve the {0} role")]
    MissingQueue(QueueRole),
}

/// A candidate that passed every filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub queues: QueueFamilyAssignment,
    /// Extensions to enable when creating the logical device.
    pub extensions: Vec<CString>,
    /// Dynamic rendering and synchronization2 come from extensions rather
    /// than core.
    pub uses_khr_fallbacks: bool,
}

impl PhysicalDeviceCandidate {
    pub fn has_extension(&self, name: &CStr) -> bool {
        self.extensions.iter().any(|ext| ext.as_c_str() == name)
    }

    /// Extensions the renderer needs on this device given its API version.
    fn required_extensions(&self, req: &DeviceRequirements) -> Vec<CString> {
        let mut required: Vec<CString> = vec![ash::khr::swapchain::NAME.into()];
        if !self.api_version.at_least(VkVersion::V1_3) {
            required.push(ash::khr::dynamic_rendering::NAME.into());
            required.push(ash::khr::synchronization2::NAME.into());
            if !self.api_version.at_least(VkVersion::V1_2) {
                required.push(ash::khr::depth_stencil_resolve::NAME.into());
                required.push(ash::khr::create_renderpass2::NAME.into());
            }
        }
        if req.descriptor_indexing && !self.api_version.at_least(VkVersion::V1_2) {
            required.push(ash::ext::descriptor_indexing::NAME.into());
        }
        for ext in &req.extensions {
            if !required.contains(ext) {
                required.push(ext.clone());
            }
        }
        required
    }

    /// Applies the hard filters, then assigns queue families.
    pub fn evaluate(&self, req: &DeviceRequirements) -> Result<Evaluation, Rejection> {
        if req.discrete_only && self.device_type != vk::PhysicalDeviceType::DISCRETE_GPU {
            return Err(Rejection::NotDiscrete(self.device_type));
        }
        if !self.api_version.at_least(VkVersion::V1_1) {
            return Err(Rejection::UnsupportedVersion(self.api_version));
        }

        let extensions = self.required_extensions(req);
        let missing: Vec<String> = extensions
            .iter()
            .filter(|ext| !self.has_extension(ext))
            .map(|ext| ext.to_string_lossy().into_owned())
            .collect();
        if !missing.is_empty() {
            return Err(Rejection::MissingExtensions(missing));
        }

        if self.surface_format_count == 0 {
            return Err(Rejection::NoSurfaceFormats);
        }
        if self.present_mode_count == 0 {
            return Err(Rejection::NoPresentModes);
        }
        if req.descriptor_indexing && !self.descriptor_indexing.supports_bindless_textures() {
            return Err(Rejection::DescriptorIndexingUnsupported);
        }

        let queues = assign_queue_families(&self.queue_families, req.queue_mode)
            .map_err(Rejection::MissingQueue)?;

        Ok(Evaluation {
            queues,
            extensions,
            uses_khr_fallbacks: !self.api_version.at_least(VkVersion::V1_3),
        })
    }
}

fn device_type_priority(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 3,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
        _ => 0,
    }
}

#[derive(Debug, Error)]
pub enum SelectDeviceError {
    #[error("No suitable physical device found (rejected: {rejected:?})")]
    NoSuitableDevice { rejected: Vec<(String, Rejection)> },
}

/// Picks the best passing candidate: most roles on dedicated families
/// first, then device type. Returns its index and evaluation.
pub fn select_candidate(
    candidates: &[PhysicalDeviceCandidate],
    req: &DeviceRequirements,
) -> Result<(usize, Evaluation), SelectDeviceError> {
    let mut rejected = Vec::new();
    let mut best: Option<((u32, u32), usize, Evaluation)> = None;

    for (idx, candidate) in candidates.iter().enumerate() {
        match candidate.evaluate(req) {
            Ok(eval) => {
                let rank = (
                    eval.queues.dedicated_roles(),
                    device_type_priority(candidate.device_type),
                );
                tracing::debug!(
                    "Candidate {:?} accepted, rank {rank:?}, queues {:?}",
                    candidate.name,
                    eval.queues
                );
                if best.as_ref().is_none_or(|(r, _, _)| rank > *r) {
                    best = Some((rank, idx, eval));
                }
            }
            Err(why) => {
                tracing::debug!("Skipping {:?}: {why}", candidate.name);
                rejected.push((candidate.name.clone(), why));
            }
        }
    }

    best.map(|(_, idx, eval)| (idx, eval))
        .ok_or(SelectDeviceError::NoSuitableDevice { rejected })
}

#[cfg(test)]
mod tests {
    use super::*;

    const G: vk::QueueFlags = vk::QueueFlags::GRAPHICS;
    const C: vk::QueueFlags = vk::QueueFlags::COMPUTE;
    const T: vk::QueueFlags = vk::QueueFlags::TRANSFER;

    fn fam(flags: vk::QueueFlags, count: u32, present: bool) -> QueueFamilyInfo {
        QueueFamilyInfo {
            flags,
            queue_count: count,
            supports_present: present,
        }
    }

    /// Graphics family, 2 DMA queues, 8 async compute queues.
    fn discrete_layout() -> Vec<QueueFamilyInfo> {
        vec![
            fam(G | C | T, 16, true),
            fam(T, 2, false),
            fam(C | T, 8, false),
        ]
    }

    fn candidate(
        device_type: vk::PhysicalDeviceType,
        families: Vec<QueueFamilyInfo>,
    ) -> PhysicalDeviceCandidate {
        PhysicalDeviceCandidate {
            name: "test gpu".into(),
            device_type,
            api_version: VkVersion::V1_3,
            extensions: vec![ash::khr::swapchain::NAME.into()],
            queue_families: families,
            surface_format_count: 2,
            present_mode_count: 3,
            descriptor_indexing: DescriptorIndexingSupport::default(),
        }
    }

    #[test]
    fn score_follows_formula() {
        let s = family_score(&fam(G | C | T, 16, true));
        assert!((s - (10.0 - 1.0 / 16.0)).abs() < f32::EPSILON);
        let s = family_score(&fam(C | T, 8, false));
        assert!((s - (8.0 - 0.125)).abs() < f32::EPSILON);
        let s = family_score(&fam(T, 2, false));
        assert!((s - 5.5).abs() < f32::EPSILON);
    }

    #[test]
    fn discrete_layout_uses_dedicated_families() {
        let assignment =
            assign_queue_families(&discrete_layout(), QueueMode::Auto).unwrap();
        assert_eq!(
            assignment,
            QueueFamilyAssignment {
                graphics: 0,
                compute: 2,
                transfer: 1,
                present: 0,
            }
        );
        assert_eq!(assignment.dedicated_roles(), 2);
    }

    #[test]
    fn single_family_device_aliases_everything() {
        let families = vec![fam(G | C | T, 1, true)];
        let assignment =
            assign_queue_families(&families, QueueMode::Auto).unwrap();
        for role in QueueRole::ALL {
            assert_eq!(assignment.family(role), 0);
        }
        assert_eq!(assignment.dedicated_roles(), 0);
    }

    #[test]
    fn present_falls_back_to_non_graphics_family() {
        let families = vec![fam(G | C | T, 4, false), fam(C | T, 2, true)];
        let assignment =
            assign_queue_families(&families, QueueMode::Auto).unwrap();
        assert_eq!(assignment.graphics, 0);
        assert_eq!(assignment.present, 1);
    }

    #[test]
    fn unified_mode_collapses_compute_and_transfer() {
        let assignment =
            assign_queue_families(&discrete_layout(), QueueMode::Unified)
                .unwrap();
        assert_eq!(assignment.compute, 0);
        assert_eq!(assignment.transfer, 0);
        assert_eq!(assignment.present, 0);
    }

    #[test]
    fn missing_graphics_is_reported() {
        let families = vec![fam(C | T, 4, true)];
        assert_eq!(
            assign_queue_families(&families, QueueMode::Auto),
            Err(QueueRole::Graphics)
        );
    }

    #[test]
    fn empty_families_are_never_picked() {
        let families = vec![fam(G | C | T, 0, true), fam(G | C | T, 1, true)];
        assert_eq!(pick_family(QueueRole::Graphics, &families), Some(1));
    }

    #[test]
    fn chosen_family_is_never_outscored_for_its_role() {
        let layouts = [
            discrete_layout(),
            vec![fam(G | C | T, 1, true)],
            vec![
                fam(T, 1, false),
                fam(G | T, 2, true),
                fam(C, 4, false),
                fam(C | T, 2, true),
                fam(T, 4, false),
            ],
        ];
        for families in layouts {
            for role in QueueRole::ALL {
                let Some(chosen) = pick_family(role, &families) else {
                    continue;
                };
                let chosen_score =
                    role_score(role, &families[chosen as usize]).unwrap();
                for other in &families {
                    if let Some(s) = role_score(role, other) {
                        assert!(s <= chosen_score, "{role} picked a lower score");
                    }
                }
            }
        }
    }

    #[test]
    fn integrated_gpu_rejected_when_discrete_required() {
        let cand = candidate(
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            discrete_layout(),
        );
        assert_eq!(
            cand.evaluate(&DeviceRequirements::default()),
            Err(Rejection::NotDiscrete(vk::PhysicalDeviceType::INTEGRATED_GPU))
        );
        let relaxed = DeviceRequirements {
            discrete_only: false,
            ..Default::default()
        };
        assert!(cand.evaluate(&relaxed).is_ok());
    }

    #[test]
    fn surface_without_formats_or_modes_is_rejected() {
        let mut cand =
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, discrete_layout());
        cand.present_mode_count = 0;
        assert_eq!(
            cand.evaluate(&DeviceRequirements::default()),
            Err(Rejection::NoPresentModes)
        );
        cand.surface_format_count = 0;
        assert_eq!(
            cand.evaluate(&DeviceRequirements::default()),
            Err(Rejection::NoSurfaceFormats)
        );
    }

    #[test]
    fn pre_1_3_device_needs_khr_fallbacks() {
        let mut cand =
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, discrete_layout());
        cand.api_version = VkVersion::new(1, 2, 198);
        let Err(Rejection::MissingExtensions(missing)) =
            cand.evaluate(&DeviceRequirements::default())
        else {
            panic!("expected missing extensions");
        };
        assert!(missing.contains(&"VK_KHR_dynamic_rendering".to_string()));

        cand.extensions.push(ash::khr::dynamic_rendering::NAME.into());
        cand.extensions.push(ash::khr::synchronization2::NAME.into());
        let eval = cand.evaluate(&DeviceRequirements::default()).unwrap();
        assert!(eval.uses_khr_fallbacks);
        assert_eq!(eval.extensions.len(), 3);
    }

    #[test]
    fn caller_extensions_are_required() {
        let cand =
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, discrete_layout());
        let req = DeviceRequirements {
            extensions: vec![c"VK_EXT_mesh_shader".into()],
            ..Default::default()
        };
        assert_eq!(
            cand.evaluate(&req),
            Err(Rejection::MissingExtensions(vec![
                "VK_EXT_mesh_shader".into()
            ]))
        );
    }

    #[test]
    fn descriptor_indexing_checks_feature_bits() {
        let mut cand =
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, discrete_layout());
        let req = DeviceRequirements {
            descriptor_indexing: true,
            ..Default::default()
        };
        assert_eq!(
            cand.evaluate(&req),
            Err(Rejection::DescriptorIndexingUnsupported)
        );
        cand.descriptor_indexing = DescriptorIndexingSupport {
            runtime_array: true,
            partially_bound: true,
            variable_count: true,
            sampled_image_update_after_bind: true,
            ..Default::default()
        };
        assert!(cand.evaluate(&req).is_ok());
    }

    #[test]
    fn selection_prefers_dedicated_queues_then_device_type() {
        let req = DeviceRequirements {
            discrete_only: false,
            ..Default::default()
        };
        let candidates = vec![
            candidate(
                vk::PhysicalDeviceType::DISCRETE_GPU,
                vec![fam(G | C | T, 16, true)],
            ),
            candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, discrete_layout()),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, discrete_layout()),
        ];
        let (idx, _) = select_candidate(&candidates, &req).unwrap();
        assert_eq!(idx, 2);
    }

    #[test]
    fn no_candidate_is_fatal() {
        let candidates = vec![candidate(
            vk::PhysicalDeviceType::CPU,
            discrete_layout(),
        )];
        let err = select_candidate(&candidates, &DeviceRequirements::default())
            .unwrap_err();
        let SelectDeviceError::NoSuitableDevice { rejected } = err;
        assert_eq!(rejected.len(), 1);
    }
}
