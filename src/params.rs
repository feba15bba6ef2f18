// Copyright 2025 The MppC2 Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Typed parameter store backing the component interface.
//!
//! The host configures the component through a vector of parameter values;
//! the setter validates each field independently and reports per-field
//! failures without giving up on the rest of the vector. Getters hand out
//! copies of the current snapshot; the pipelines compare snapshots between
//! submissions to detect dynamic changes.

use bytes::Bytes;

use crate::work::Status;
use crate::Resolution;

pub const MAX_VIDEO_WIDTH: u32 = 8192;
pub const MAX_VIDEO_HEIGHT: u32 = 4320;

/// Picture type bit set attached to output buffers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureType(u32);

impl PictureType {
    pub const SYNC_FRAME: PictureType = PictureType(1 << 0);
    pub const I_FRAME: PictureType = PictureType(1 << 1);
    pub const P_FRAME: PictureType = PictureType(1 << 2);
    pub const B_FRAME: PictureType = PictureType(1 << 3);

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: PictureType) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(&self, other: PictureType) -> PictureType {
        PictureType(self.0 | other.0)
    }
}

/// Color range as carried in VUI / ISO color description.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ColorRange {
    #[default]
    Unspecified,
    Full,
    Limited,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ColorPrimaries {
    #[default]
    Unspecified,
    Bt709,
    Bt601_625,
    Bt601_525,
    Bt2020,
    Bt470M,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ColorTransfer {
    #[default]
    Unspecified,
    Linear,
    Srgb,
    Smpte170M,
    Gamma22,
    Gamma28,
    St2084,
    Hlg,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ColorMatrix {
    #[default]
    Unspecified,
    Bt709,
    Bt601,
    Bt2020,
    Bt470M,
}

/// The four color-description values negotiated between bitstream, host and
/// display.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ColorAspects {
    pub range: ColorRange,
    pub primaries: ColorPrimaries,
    pub transfer: ColorTransfer,
    pub matrix: ColorMatrix,
}

/// Codec profile, engine-facing subset.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Profile {
    #[default]
    AvcBaseline,
    AvcMain,
    AvcHigh,
    HevcMain,
    HevcMain10,
    Vp8Any,
    Vp9Profile0,
    Vp9Profile2,
}

impl Profile {
    /// Whether the AVC profile permits CABAC and the 8x8 transform.
    pub fn is_avc_high(&self) -> bool {
        matches!(self, Profile::AvcHigh)
    }
}

/// Codec level. Only the values that matter to DPB sizing are enumerated;
/// everything else maps onto `Other`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Level {
    #[default]
    Other,
    Avc5,
    Avc51,
    Avc52,
    Avc6,
    Avc61,
    Avc62,
    HevcMain5,
    HevcMain51,
    HevcMain52,
    HevcMain6,
    HevcMain61,
    HevcMain62,
    HevcHigh5,
    HevcHigh51,
    HevcHigh52,
    HevcHigh6,
    HevcHigh61,
    HevcHigh62,
    Vp9Level5,
    Vp9Level51,
    Vp9Level52,
    Vp9Level6,
    Vp9Level61,
    Vp9Level62,
}

/// Rate-control mode requested by the host.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BitrateMode {
    #[default]
    Vbr,
    Cbr,
    Cq,
    /// Fixed-QP; quality pinned, bitrate free-running.
    FixQp,
}

/// One layer descriptor in the declarative GOP syntax.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GopLayer {
    pub kind: PictureType,
    pub count: u32,
}

/// Intra-refresh request.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct IntraRefresh {
    pub mode: IntraRefreshMode,
    /// Refresh period in frames; 0 disables.
    pub period: f32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum IntraRefreshMode {
    #[default]
    Disabled,
    Arbitrary,
}

/// Quantizer bounds for one frame class.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QpRange {
    pub min: i32,
    pub max: i32,
}

/// Per-frame-class quantization tuning.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureQuantization {
    pub i: Option<QpRange>,
    pub p: Option<QpRange>,
    pub b: Option<QpRange>,
}

/// Quality floor hint; `SHandheld` enables the VMAF-driven floor.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MinQuality {
    #[default]
    None,
    SHandheld,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PrependHeaderMode {
    #[default]
    ToFirst,
    ToAllSync,
}

/// Mirror/flip/rotation pre-processing.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PreProcess {
    /// Clockwise rotation in degrees: 0, 90, 180 or 270.
    pub rotation: u32,
    pub mirror: bool,
    pub flip: bool,
}

/// Large-frame drop / re-encode policy.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SuperProcess {
    /// 0 = off, 1 = drop, 2 = re-encode.
    pub mode: u32,
    /// I-frame threshold as a multiple of the per-frame bit budget.
    pub i_thd: u32,
    /// P-frame threshold as a multiple of the per-frame bit budget.
    pub p_thd: u32,
    /// Re-encode attempts before giving up and emitting the oversized packet.
    pub reenc_times: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SceneMode {
    #[default]
    General,
    Ipc,
}

/// Super-encoding ("smart" rate control) selection.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SuperEncoding {
    #[default]
    Off,
    QualityFirst,
    CompressFirst,
    /// NN-driven region hinting; requires an external detection session.
    NnDriven,
}

/// One region-of-interest specification.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RoiRegion {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub force_intra: bool,
    /// true = absolute QP, false = relative adjustment.
    pub qp_mode: bool,
    pub qp_val: i32,
}

pub const MAX_ROI_REGIONS: usize = 4;

/// Live controls of the low-latency streaming extension. A negative value
/// means "not requested"; each control is one-shot and cleared after issue.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MlvecControls {
    pub mark_ltr: i32,
    pub use_ltr: i32,
    pub frame_qp: i32,
    pub base_layer_pid: i32,
    pub slice_spacing: i32,
    pub trigger_time: i64,
    /// Number of long-term reference slots reserved at setup.
    pub num_ltr_frames: i32,
    /// Explicit sample aspect ratio, when set.
    pub sar: Option<Resolution>,
    /// Host drives the input queue externally.
    pub input_queue_control: bool,
}

impl Default for MlvecControls {
    fn default() -> Self {
        Self {
            mark_ltr: -1,
            use_ltr: -1,
            frame_qp: -1,
            base_layer_pid: -1,
            slice_spacing: -1,
            trigger_time: -1,
            num_ltr_frames: 0,
            sar: None,
            input_queue_control: false,
        }
    }
}

impl MlvecControls {
    /// Whether any extension field was ever configured, which decides
    /// whether the extension compiler pass runs at all.
    pub fn enabled(&self) -> bool {
        self.slice_spacing >= 0
            || self.num_ltr_frames > 0
            || self.sar.is_some()
            || self.input_queue_control
    }
}

/// Temporal layering request, 1..=4 layers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TemporalLayering {
    pub layer_count: u32,
    pub b_layer_count: u32,
}

impl Default for TemporalLayering {
    fn default() -> Self {
        Self { layer_count: 1, b_layer_count: 0 }
    }
}

/// A single typed parameter value. Used three ways: host→component setting,
/// component→host config update riding on a worklet, and per-buffer info.
#[derive(Clone, Debug, PartialEq)]
pub enum Param {
    PictureSize(Resolution),
    PixelFormat(crate::RawFormat),
    FrameRate(f32),
    Profile(Profile),
    Level(Level),
    ColorAspects(ColorAspects),
    Usage(u64),

    // Decoder side.
    OutputDelay(u32),
    MaxPictureSize(Resolution),
    BlockSize(Resolution),
    MaxInputSize(u32),
    LowLatencyMode(bool),
    DisableDpbCheck(bool),
    DisableErrorMark(bool),
    LowMemoryMode(bool),
    FbcDisable(bool),
    OutputCropEnable(bool),
    TunneledPlayback(bool),
    TunneledSideband(Bytes),
    CodedColorAspects(ColorAspects),
    DefaultColorAspects(ColorAspects),

    // Encoder side.
    Bitrate(u32),
    BitrateMode(BitrateMode),
    Gop { sync_frame_period: i64, layers: Vec<GopLayer> },
    RequestSyncFrame(bool),
    SyncFramePeriodUs(i64),
    IntraRefresh(IntraRefresh),
    PrependHeaderMode(PrependHeaderMode),
    PreProcess(PreProcess),
    SuperProcess(SuperProcess),
    SceneMode(SceneMode),
    SliceSize(u32),
    PictureQuantization(PictureQuantization),
    MinQuality(MinQuality),
    TemporalLayering(TemporalLayering),
    InputScaler(Resolution),
    SuperEncoding(SuperEncoding),
    DisableSei(bool),
    RoiRegions(Vec<RoiRegion>),
    MlvecMarkLtr(i32),
    MlvecUseLtr(i32),
    MlvecFrameQp(i32),
    MlvecBaseLayerPid(i32),
    MlvecSliceSpacing(i32),
    MlvecTriggerTime(i64),
    MlvecNumLtrFrames(i32),
    MlvecSar(Resolution),
    MlvecInputQueueControl(bool),

    // Output-side payloads.
    CodecSpecificData(Bytes),
    PictureType(PictureType),
}

impl Param {
    /// Stable field name used in per-field failure reports.
    pub fn field(&self) -> &'static str {
        match self {
            Param::PictureSize(_) => "picture-size",
            Param::PixelFormat(_) => "pixel-format",
            Param::FrameRate(_) => "frame-rate",
            Param::Profile(_) => "profile",
            Param::Level(_) => "level",
            Param::ColorAspects(_) => "color-aspects",
            Param::Usage(_) => "usage",
            Param::OutputDelay(_) => "output-delay",
            Param::MaxPictureSize(_) => "max-picture-size",
            Param::BlockSize(_) => "block-size",
            Param::MaxInputSize(_) => "max-input-size",
            Param::LowLatencyMode(_) => "low-latency-mode",
            Param::DisableDpbCheck(_) => "disable-dpb-check",
            Param::DisableErrorMark(_) => "disable-error-mark",
            Param::LowMemoryMode(_) => "low-memory-mode",
            Param::FbcDisable(_) => "fbc-disable",
            Param::OutputCropEnable(_) => "output-crop-enable",
            Param::TunneledPlayback(_) => "tunneled-playback",
            Param::TunneledSideband(_) => "tunneled-sideband",
            Param::CodedColorAspects(_) => "coded-color-aspects",
            Param::DefaultColorAspects(_) => "default-color-aspects",
            Param::Bitrate(_) => "bitrate",
            Param::BitrateMode(_) => "bitrate-mode",
            Param::Gop { .. } => "gop",
            Param::RequestSyncFrame(_) => "request-sync-frame",
            Param::SyncFramePeriodUs(_) => "sync-frame-period",
            Param::IntraRefresh(_) => "intra-refresh",
            Param::PrependHeaderMode(_) => "prepend-header-mode",
            Param::PreProcess(_) => "pre-process",
            Param::SuperProcess(_) => "super-process",
            Param::SceneMode(_) => "scene-mode",
            Param::SliceSize(_) => "slice-size",
            Param::PictureQuantization(_) => "picture-quantization",
            Param::MinQuality(_) => "min-quality",
            Param::TemporalLayering(_) => "temporal-layering",
            Param::InputScaler(_) => "input-scaler",
            Param::SuperEncoding(_) => "super-encoding",
            Param::DisableSei(_) => "disable-sei",
            Param::RoiRegions(_) => "roi-regions",
            Param::MlvecMarkLtr(_) => "mlvec-mark-ltr",
            Param::MlvecUseLtr(_) => "mlvec-use-ltr",
            Param::MlvecFrameQp(_) => "mlvec-frame-qp",
            Param::MlvecBaseLayerPid(_) => "mlvec-base-layer-pid",
            Param::MlvecSliceSpacing(_) => "mlvec-slice-spacing",
            Param::MlvecTriggerTime(_) => "mlvec-trigger-time",
            Param::MlvecNumLtrFrames(_) => "mlvec-num-ltr-frames",
            Param::MlvecSar(_) => "mlvec-sar",
            Param::MlvecInputQueueControl(_) => "mlvec-input-queue-control",
            Param::CodecSpecificData(_) => "codec-specific-data",
            Param::PictureType(_) => "picture-type",
        }
    }
}

/// A rejected field from a bulk parameter update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettingFailure {
    pub field: &'static str,
    pub status: Status,
}

/// Full parameter snapshot. Cloned out under the interface lock; mutated
/// only through [`Params::apply`].
#[derive(Clone, Debug)]
pub struct Params {
    pub picture_size: Resolution,
    pub pixel_format: crate::RawFormat,
    pub frame_rate: f32,
    pub profile: Profile,
    pub level: Level,
    pub color_aspects: ColorAspects,
    pub usage: u64,

    pub output_delay: u32,
    pub max_picture_size: Resolution,
    pub block_size: Resolution,
    pub max_input_size: u32,
    pub low_latency_mode: bool,
    pub disable_dpb_check: bool,
    pub disable_error_mark: bool,
    pub low_memory_mode: bool,
    pub fbc_disable: bool,
    pub output_crop_enable: bool,
    pub tunneled_playback: bool,
    pub tunneled_sideband: Option<Bytes>,
    pub coded_color_aspects: ColorAspects,
    pub default_color_aspects: ColorAspects,

    pub bitrate: u32,
    pub bitrate_mode: BitrateMode,
    pub gop_sync_frame_period: i64,
    pub gop_layers: Vec<GopLayer>,
    pub request_sync_frame: bool,
    pub sync_frame_period_us: i64,
    pub intra_refresh: IntraRefresh,
    pub prepend_header_mode: PrependHeaderMode,
    pub pre_process: PreProcess,
    pub super_process: SuperProcess,
    pub scene_mode: SceneMode,
    pub slice_size: u32,
    pub picture_quantization: PictureQuantization,
    pub min_quality: MinQuality,
    pub temporal_layering: TemporalLayering,
    pub input_scaler: Resolution,
    pub super_encoding: SuperEncoding,
    pub disable_sei: bool,
    pub roi_regions: Vec<RoiRegion>,
    pub mlvec: MlvecControls,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            picture_size: Resolution::new(320, 240),
            pixel_format: crate::RawFormat::Nv12,
            frame_rate: 30.0,
            profile: Profile::default(),
            level: Level::default(),
            color_aspects: ColorAspects::default(),
            usage: 0,
            output_delay: 0,
            max_picture_size: Resolution::new(MAX_VIDEO_WIDTH, MAX_VIDEO_HEIGHT),
            block_size: Resolution::new(16, 16),
            max_input_size: 0,
            low_latency_mode: false,
            disable_dpb_check: false,
            disable_error_mark: false,
            low_memory_mode: false,
            fbc_disable: false,
            output_crop_enable: false,
            tunneled_playback: false,
            tunneled_sideband: None,
            coded_color_aspects: ColorAspects::default(),
            default_color_aspects: ColorAspects::default(),
            bitrate: 64_000,
            bitrate_mode: BitrateMode::default(),
            gop_sync_frame_period: 0,
            gop_layers: Vec::new(),
            request_sync_frame: false,
            sync_frame_period_us: 0,
            intra_refresh: IntraRefresh::default(),
            prepend_header_mode: PrependHeaderMode::default(),
            pre_process: PreProcess::default(),
            super_process: SuperProcess::default(),
            scene_mode: SceneMode::default(),
            slice_size: 0,
            picture_quantization: PictureQuantization::default(),
            min_quality: MinQuality::default(),
            temporal_layering: TemporalLayering::default(),
            input_scaler: Resolution::default(),
            super_encoding: SuperEncoding::default(),
            disable_sei: false,
            roi_regions: Vec::new(),
            mlvec: MlvecControls::default(),
        }
    }
}

pub const BITRATE_MIN: u32 = 4096;
pub const BITRATE_MAX: u32 = 200 * 1024 * 1024 - 1;

impl Params {
    /// Apply a vector of parameter values. Invalid fields are reported in
    /// the returned vector and leave the previous value untouched; clampable
    /// numeric fields are clamped rather than rejected.
    pub fn apply(&mut self, updates: Vec<Param>) -> Vec<SettingFailure> {
        let mut failures = Vec::new();

        for update in updates {
            let field = update.field();
            match update {
                Param::PictureSize(size) => {
                    if size.width < 2
                        || size.height < 2
                        || size.width > MAX_VIDEO_WIDTH
                        || size.height > MAX_VIDEO_HEIGHT
                    {
                        failures.push(SettingFailure { field, status: Status::BadValue });
                    } else {
                        self.picture_size = size;
                    }
                }
                Param::PixelFormat(format) => self.pixel_format = format,
                Param::FrameRate(fps) => {
                    if fps <= 0.0 || fps > 960.0 {
                        failures.push(SettingFailure { field, status: Status::BadValue });
                    } else {
                        self.frame_rate = fps;
                    }
                }
                Param::Profile(profile) => self.profile = profile,
                Param::Level(level) => self.level = level,
                Param::ColorAspects(aspects) => self.color_aspects = aspects,
                Param::Usage(usage) => self.usage = usage,
                Param::OutputDelay(delay) => self.output_delay = delay,
                Param::MaxPictureSize(size) => self.max_picture_size = size,
                Param::BlockSize(size) => self.block_size = size,
                Param::MaxInputSize(size) => self.max_input_size = size,
                Param::LowLatencyMode(on) => self.low_latency_mode = on,
                Param::DisableDpbCheck(on) => self.disable_dpb_check = on,
                Param::DisableErrorMark(on) => self.disable_error_mark = on,
                Param::LowMemoryMode(on) => self.low_memory_mode = on,
                Param::FbcDisable(on) => self.fbc_disable = on,
                Param::OutputCropEnable(on) => self.output_crop_enable = on,
                Param::TunneledPlayback(on) => self.tunneled_playback = on,
                Param::TunneledSideband(handle) => self.tunneled_sideband = Some(handle),
                Param::CodedColorAspects(aspects) => self.coded_color_aspects = aspects,
                Param::DefaultColorAspects(aspects) => self.default_color_aspects = aspects,
                Param::Bitrate(bps) => {
                    self.bitrate = bps.clamp(BITRATE_MIN, BITRATE_MAX);
                }
                Param::BitrateMode(mode) => self.bitrate_mode = mode,
                Param::Gop { sync_frame_period, layers } => {
                    self.gop_sync_frame_period = sync_frame_period;
                    self.gop_layers = layers;
                }
                Param::RequestSyncFrame(on) => self.request_sync_frame = on,
                Param::SyncFramePeriodUs(period) => self.sync_frame_period_us = period,
                Param::IntraRefresh(refresh) => self.intra_refresh = refresh,
                Param::PrependHeaderMode(mode) => self.prepend_header_mode = mode,
                Param::PreProcess(pre) => {
                    if pre.rotation % 90 != 0 || pre.rotation >= 360 {
                        failures.push(SettingFailure { field, status: Status::BadValue });
                    } else {
                        self.pre_process = pre;
                    }
                }
                Param::SuperProcess(sp) => self.super_process = sp,
                Param::SceneMode(mode) => self.scene_mode = mode,
                Param::SliceSize(size) => self.slice_size = size,
                Param::PictureQuantization(qp) => {
                    let valid = [qp.i, qp.p, qp.b]
                        .iter()
                        .flatten()
                        .all(|range| range.min >= 0 && range.min <= range.max);
                    if valid {
                        self.picture_quantization = qp;
                    } else {
                        failures.push(SettingFailure { field, status: Status::BadValue });
                    }
                }
                Param::MinQuality(quality) => self.min_quality = quality,
                Param::TemporalLayering(layers) => {
                    if layers.layer_count < 1 || layers.layer_count > 4 {
                        failures.push(SettingFailure { field, status: Status::BadValue });
                    } else {
                        self.temporal_layering = layers;
                    }
                }
                Param::InputScaler(size) => self.input_scaler = size,
                Param::SuperEncoding(mode) => self.super_encoding = mode,
                Param::DisableSei(on) => self.disable_sei = on,
                Param::RoiRegions(regions) => {
                    if regions.len() > MAX_ROI_REGIONS {
                        failures.push(SettingFailure { field, status: Status::BadValue });
                    } else {
                        self.roi_regions = regions;
                    }
                }
                Param::MlvecMarkLtr(v) => self.mlvec.mark_ltr = v,
                Param::MlvecUseLtr(v) => self.mlvec.use_ltr = v,
                Param::MlvecFrameQp(v) => self.mlvec.frame_qp = v,
                Param::MlvecBaseLayerPid(v) => self.mlvec.base_layer_pid = v,
                Param::MlvecSliceSpacing(v) => self.mlvec.slice_spacing = v,
                Param::MlvecTriggerTime(v) => self.mlvec.trigger_time = v,
                Param::MlvecNumLtrFrames(v) => self.mlvec.num_ltr_frames = v,
                Param::MlvecSar(sar) => self.mlvec.sar = Some(sar),
                Param::MlvecInputQueueControl(on) => self.mlvec.input_queue_control = on,
                Param::CodecSpecificData(_) | Param::PictureType(_) => {
                    // Output-only payloads; not settable by the host.
                    failures.push(SettingFailure { field, status: Status::BadValue });
                }
            }
        }

        failures
    }
}
