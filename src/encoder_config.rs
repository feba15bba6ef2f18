// Copyright 2025 The MppC2 Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Compilation of the host parameter snapshot into the engine configuration
//! namespace.
//!
//! The compiler runs a fixed sequence of passes, each owning one group of
//! engine keys. The order matters: later passes read values earlier passes
//! derived (the QP pass reads the rate-control mode, the extension pass
//! overrides the split mode). Dynamic reconfiguration reuses the same passes
//! but only re-runs the groups whose source parameters actually changed, so
//! one engine `apply_config` carries exactly the delta.

use crate::caps::ChipCapInfo;
use crate::engine::EncCfg;
use crate::params::{
    BitrateMode, ColorAspects, GopLayer, IntraRefreshMode, Level, MinQuality, Params,
    PictureType, PrependHeaderMode, Profile, SceneMode, SuperEncoding,
};
use crate::utils::{align, color_aspects_to_iso};
use crate::work::Status;
use crate::CodedFormat;
use crate::RawFormat;

/// GOP structure distilled from the declarative layer syntax.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GopParams {
    /// Sync frame interval in frames.
    pub sync_interval: u32,
    /// Consecutive B frames between references.
    pub max_b_frames: u32,
}

/// Fold the layer list into interval and B-frame depth. Each layer
/// contributes `count + 1` pictures to the interval; a layer carrying both
/// P and B classes declares the B run length.
pub fn parse_gop(layers: &[GopLayer]) -> GopParams {
    let mut sync_interval: u32 = 1;
    let mut max_b_frames: u32 = 0;
    for layer in layers {
        sync_interval = sync_interval.saturating_mul(layer.count + 1);
        if layer.kind.contains(PictureType::P_FRAME.union(PictureType::B_FRAME)) {
            max_b_frames = layer.count;
        }
    }
    GopParams { sync_interval, max_b_frames }
}

/// Effective sync interval in frames: the declarative GOP wins, then the
/// period request, then a one-second default.
pub fn effective_gop(params: &Params) -> u32 {
    if !params.gop_layers.is_empty() {
        return parse_gop(&params.gop_layers).sync_interval;
    }
    if params.sync_frame_period_us > 0 {
        let frames =
            (params.sync_frame_period_us as f64 * params.frame_rate as f64 / 1_000_000.0).round();
        return (frames as u32).max(1);
    }
    params.frame_rate.round() as u32
}

/// Position of the next input inside the temporal layer cycle. Sync frame
/// requests are only honored at position 0, the base-layer slot.
pub fn layer_position(input_count: u64, layer_count: u32) -> u64 {
    if layer_count < 2 {
        return 0;
    }
    input_count % (2u64 << (layer_count - 2))
}

/// Engine bitrate bounds derived from the target and the rate-control mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BitrateBounds {
    pub target: u32,
    pub max: u32,
    pub min: u32,
}

const ENGINE_BPS_FLOOR: u32 = 1025;
const ENGINE_BPS_CEIL: u32 = 200 * 1024 * 1024 - 1;

pub fn bitrate_bounds(bps: u32, mode: BitrateMode) -> BitrateBounds {
    let target = bps.clamp(ENGINE_BPS_FLOOR, ENGINE_BPS_CEIL);
    match mode {
        BitrateMode::Cbr => BitrateBounds {
            target,
            max: target.saturating_add(target / 16).min(ENGINE_BPS_CEIL),
            min: target - target / 16,
        },
        // Quality modes float below the target.
        BitrateMode::Vbr | BitrateMode::Cq | BitrateMode::FixQp => {
            BitrateBounds { target, max: target, min: (target / 16).max(ENGINE_BPS_FLOOR) }
        }
    }
}

/// Parameter groups the dynamic path can re-compile independently.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigChange {
    pub size: bool,
    pub bitrate: bool,
    pub frame_rate: bool,
    pub profile: bool,
    pub intra_refresh: bool,
}

impl ConfigChange {
    pub fn any(&self) -> bool {
        self.size || self.bitrate || self.frame_rate || self.profile || self.intra_refresh
    }
}

/// Compare two snapshots for the dynamically reconfigurable groups.
pub fn diff(old: &Params, new: &Params) -> ConfigChange {
    ConfigChange {
        size: old.picture_size != new.picture_size,
        bitrate: old.bitrate != new.bitrate || old.bitrate_mode != new.bitrate_mode,
        frame_rate: old.frame_rate != new.frame_rate
            || old.gop_layers != new.gop_layers
            || old.sync_frame_period_us != new.sync_frame_period_us,
        profile: old.profile != new.profile || old.level != new.level,
        intra_refresh: old.intra_refresh != new.intra_refresh,
    }
}

/// Compile the full snapshot. Pass order is fixed; see the module docs.
pub fn compile(params: &Params, coding: CodedFormat) -> Result<EncCfg, Status> {
    let mut cfg = EncCfg::new();
    setup_base_codec(&mut cfg, params, coding)?;
    setup_input_scaler(&mut cfg, params);
    setup_pre_process(&mut cfg, params);
    setup_super_process(&mut cfg, params);
    setup_scene_mode(&mut cfg, params);
    setup_slice_size(&mut cfg, params);
    setup_frame_rate(&mut cfg, params);
    setup_bitrate(&mut cfg, params);
    setup_profile(&mut cfg, params, coding)?;
    setup_qp(&mut cfg, params, coding);
    setup_vui(&mut cfg, params, coding);
    setup_temporal_layers(&mut cfg, params, coding)?;
    setup_prepend_header(&mut cfg, params);
    setup_super_encoding(&mut cfg, params);
    setup_mlvec(&mut cfg, params, coding);
    Ok(cfg)
}

/// Compile only the changed groups. `None` when nothing changed.
pub fn compile_dynamic(
    params: &Params,
    coding: CodedFormat,
    change: ConfigChange,
) -> Result<Option<EncCfg>, Status> {
    if !change.any() {
        return Ok(None);
    }
    let mut cfg = EncCfg::new();
    if change.size {
        setup_base_codec(&mut cfg, params, coding)?;
    }
    if change.bitrate {
        setup_bitrate(&mut cfg, params);
    }
    if change.frame_rate || change.intra_refresh {
        setup_frame_rate(&mut cfg, params);
    }
    if change.profile {
        setup_profile(&mut cfg, params, coding)?;
    }
    Ok(Some(cfg))
}

fn setup_base_codec(cfg: &mut EncCfg, params: &Params, coding: CodedFormat) -> Result<(), Status> {
    let size = params.picture_size;
    if size.width < 2 || size.height < 2 {
        return Err(Status::BadValue);
    }
    cfg.set_str(
        "codec:type",
        match coding {
            CodedFormat::H264 => "h264",
            CodedFormat::H265 => "h265",
            CodedFormat::VP8 => "vp8",
            CodedFormat::VP9 | CodedFormat::AV1 => return Err(Status::BadValue),
        },
    );
    cfg.set_u32("prep:width", size.width);
    cfg.set_u32("prep:height", size.height);
    cfg.set_u32("prep:hor_stride", align(size.width, 16));
    // The VP8 engine writes reconstruction rows in 16-row bands.
    let ver_align = if coding == CodedFormat::VP8 { 16 } else { 8 };
    cfg.set_u32("prep:ver_stride", align(size.height, ver_align));
    cfg.set_u32("prep:format", raw_format_code(params.pixel_format));
    Ok(())
}

fn setup_input_scaler(cfg: &mut EncCfg, params: &Params) {
    let scaled = params.input_scaler;
    if scaled.get_area() > 0 && scaled != params.picture_size {
        cfg.set_u32("prep:scale_width", scaled.width);
        cfg.set_u32("prep:scale_height", scaled.height);
    }
}

fn setup_pre_process(cfg: &mut EncCfg, params: &Params) {
    let pre = params.pre_process;
    if pre.rotation != 0 {
        cfg.set_u32("prep:rotation", pre.rotation);
    }
    if pre.mirror {
        cfg.set_u32("prep:mirroring", 1);
    }
    if pre.flip {
        cfg.set_u32("prep:flip", 1);
    }
}

fn setup_super_process(cfg: &mut EncCfg, params: &Params) {
    let sp = params.super_process;
    if sp.mode == 0 {
        return;
    }
    cfg.set_u32("sp:mode", sp.mode);
    cfg.set_u32("sp:i_thd", sp.i_thd.max(1));
    cfg.set_u32("sp:p_thd", sp.p_thd.max(1));
    if sp.mode == 2 {
        cfg.set_u32("sp:reenc_times", sp.reenc_times.max(1));
    }
}

fn setup_scene_mode(cfg: &mut EncCfg, params: &Params) {
    cfg.set_u32(
        "tune:scene_mode",
        match params.scene_mode {
            SceneMode::General => 0,
            SceneMode::Ipc => 1,
        },
    );
}

fn setup_slice_size(cfg: &mut EncCfg, params: &Params) {
    if params.slice_size > 0 {
        cfg.set_u32("split:mode", 1);
        cfg.set_u32("split:arg", params.slice_size);
    }
}

fn setup_frame_rate(cfg: &mut EncCfg, params: &Params) {
    cfg.set_f32("rc:fps", params.frame_rate);
    cfg.set_i32("rc:gop", effective_gop(params) as i32);

    let gop = parse_gop(&params.gop_layers);
    if gop.max_b_frames > 0 {
        cfg.set_u32("rc:max_bframes", gop.max_b_frames);
    }

    let refresh = params.intra_refresh;
    if refresh.mode != IntraRefreshMode::Disabled && refresh.period > 0.0 {
        cfg.set_u32("rc:refresh_mode", 1);
        cfg.set_u32("rc:refresh_num", refresh.period.round() as u32);
    }
}

fn setup_bitrate(cfg: &mut EncCfg, params: &Params) {
    let bounds = bitrate_bounds(params.bitrate, params.bitrate_mode);
    cfg.set_u32(
        "rc:mode",
        match params.bitrate_mode {
            BitrateMode::Vbr => 0,
            BitrateMode::Cbr => 1,
            BitrateMode::FixQp => 2,
            BitrateMode::Cq => 3,
        },
    );
    cfg.set_u32("rc:bps_target", bounds.target);
    cfg.set_u32("rc:bps_max", bounds.max);
    cfg.set_u32("rc:bps_min", bounds.min);
}

fn setup_profile(cfg: &mut EncCfg, params: &Params, coding: CodedFormat) -> Result<(), Status> {
    match coding {
        CodedFormat::H264 => {
            let profile = match params.profile {
                Profile::AvcBaseline => 66,
                Profile::AvcMain => 77,
                Profile::AvcHigh => 100,
                _ => return Err(Status::BadValue),
            };
            cfg.set_u32("h264:profile", profile);
            cfg.set_u32("h264:level", avc_level_code(params.level));
            cfg.set_u32("h264:cabac_en", u32::from(params.profile != Profile::AvcBaseline));
            cfg.set_u32("h264:trans8x8", u32::from(params.profile.is_avc_high()));
        }
        CodedFormat::H265 => {
            let profile = match params.profile {
                Profile::HevcMain => 1,
                Profile::HevcMain10 => 2,
                _ => return Err(Status::BadValue),
            };
            cfg.set_u32("h265:profile", profile);
            cfg.set_u32("h265:level", hevc_level_code(params.level));
        }
        CodedFormat::VP8 => {
            if params.profile != Profile::Vp8Any {
                return Err(Status::BadValue);
            }
        }
        _ => return Err(Status::BadValue),
    }
    Ok(())
}

fn setup_qp(cfg: &mut EncCfg, params: &Params, coding: CodedFormat) {
    let (codec_min, codec_max) = if coding == CodedFormat::VP8 { (0, 127) } else { (1, 51) };

    let (mut min, mut max) = (codec_min, codec_max);
    // Small sessions get a quality guard against QP runaway.
    if coding != CodedFormat::VP8 && params.picture_size.get_area() <= 320 * 240 {
        min = 1;
        max = 40;
    }
    if params.min_quality == MinQuality::SHandheld {
        max = if coding == CodedFormat::VP8 { 90 } else { 35 };
    }

    let qp = params.picture_quantization;
    if let Some(range) = qp.p {
        min = range.min.max(codec_min);
        max = range.max.min(codec_max);
    }

    cfg.set_i32("rc:qp_min", min);
    cfg.set_i32("rc:qp_max", max.max(min));
    if let Some(range) = qp.i {
        cfg.set_i32("rc:qp_min_i", range.min.max(codec_min));
        cfg.set_i32("rc:qp_max_i", range.max.min(codec_max));
    }

    if params.bitrate_mode == BitrateMode::FixQp {
        let pinned = qp.i.map(|range| range.min.clamp(codec_min, codec_max)).unwrap_or(10);
        cfg.set_i32("rc:qp_init", pinned);
        cfg.set_i32("rc:qp_min", pinned);
        cfg.set_i32("rc:qp_max", pinned);
    } else {
        cfg.set_i32("rc:qp_init", -1);
    }
}

fn setup_vui(cfg: &mut EncCfg, params: &Params, coding: CodedFormat) {
    if !coding.has_vui_color_aspects() {
        return;
    }
    let iso = color_aspects_to_iso(effective_aspects(params));
    cfg.set_u32("vui:primaries", iso.primaries);
    cfg.set_u32("vui:transfer", iso.transfer);
    cfg.set_u32("vui:matrix", iso.matrix);
    cfg.set_u32("vui:full_range", u32::from(iso.full_range));
}

fn effective_aspects(params: &Params) -> ColorAspects {
    let mut aspects = params.color_aspects;
    crate::utils::pair_default_color_aspects(&mut aspects, params.picture_size);
    aspects
}

/// Per-slot keys of the temporal reference cycle handed to the engine.
pub const REF_SLOT_TID: [&str; 8] = [
    "ref:frm0:tid",
    "ref:frm1:tid",
    "ref:frm2:tid",
    "ref:frm3:tid",
    "ref:frm4:tid",
    "ref:frm5:tid",
    "ref:frm6:tid",
    "ref:frm7:tid",
];
pub const REF_SLOT_NON_REF: [&str; 8] = [
    "ref:frm0:non_ref",
    "ref:frm1:non_ref",
    "ref:frm2:non_ref",
    "ref:frm3:non_ref",
    "ref:frm4:non_ref",
    "ref:frm5:non_ref",
    "ref:frm6:non_ref",
    "ref:frm7:non_ref",
];
pub const REF_SLOT_REF_GAP: [&str; 8] = [
    "ref:frm0:ref_gap",
    "ref:frm1:ref_gap",
    "ref:frm2:ref_gap",
    "ref:frm3:ref_gap",
    "ref:frm4:ref_gap",
    "ref:frm5:ref_gap",
    "ref:frm6:ref_gap",
    "ref:frm7:ref_gap",
];

/// Layer-id cycle of the hierarchical-P structure for 2/3/4 layers.
fn tsvc_layer_ids(layer_count: u32) -> &'static [u32] {
    match layer_count {
        2 => &[0, 1],
        3 => &[0, 2, 1, 2],
        4 => &[0, 3, 2, 3, 1, 3, 2, 3],
        _ => &[0],
    }
}

fn setup_temporal_layers(
    cfg: &mut EncCfg,
    params: &Params,
    coding: CodedFormat,
) -> Result<(), Status> {
    let layers = params.temporal_layering;
    if layers.layer_count <= 1 {
        return Ok(());
    }
    if coding == CodedFormat::VP8 {
        log::warn!("temporal layering unsupported for vp8, keeping single layer");
        return Ok(());
    }
    if !(2..=4).contains(&layers.layer_count) {
        return Err(Status::BadValue);
    }
    cfg.set_u32("ref:tsvc_layers", layers.layer_count);

    // The engine takes the whole cycle as a table: layer id, droppability
    // and the distance back to the slot each frame references. The base
    // slot references the previous cycle's base; every other slot the
    // closest earlier frame of a lower layer. Top-layer frames are never
    // referenced and can be dropped on the wire.
    let cycle = tsvc_layer_ids(layers.layer_count);
    cfg.set_u32("ref:cycle_len", cycle.len() as u32);
    for (i, &tid) in cycle.iter().enumerate() {
        cfg.set_u32(REF_SLOT_TID[i], tid);
        cfg.set_u32(REF_SLOT_NON_REF[i], u32::from(tid == layers.layer_count - 1));
        let gap = if tid == 0 {
            cycle.len()
        } else {
            i - cycle[..i].iter().rposition(|&t| t < tid).unwrap()
        };
        cfg.set_u32(REF_SLOT_REF_GAP[i], gap as u32);
    }
    Ok(())
}

fn setup_prepend_header(cfg: &mut EncCfg, params: &Params) {
    cfg.set_u32(
        "sps:head_mode",
        match params.prepend_header_mode {
            PrependHeaderMode::ToFirst => 0,
            PrependHeaderMode::ToAllSync => 1,
        },
    );
}

/// Bounds on the per-region QP offsets a super-encoding variant may apply,
/// split between detected foreground and the remaining background blocks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeltaQpBounds {
    pub fg_min: i32,
    pub fg_max: i32,
    pub bg_min: i32,
    pub bg_max: i32,
}

pub fn super_encoding_qp_bounds(mode: SuperEncoding) -> DeltaQpBounds {
    match mode {
        SuperEncoding::Off => DeltaQpBounds { fg_min: 0, fg_max: 0, bg_min: 0, bg_max: 0 },
        // Quality-first spends bits on the foreground and barely taxes the
        // rest; compress-first does the opposite.
        SuperEncoding::QualityFirst => {
            DeltaQpBounds { fg_min: -6, fg_max: 0, bg_min: 0, bg_max: 3 }
        }
        SuperEncoding::CompressFirst => {
            DeltaQpBounds { fg_min: -3, fg_max: 0, bg_min: 0, bg_max: 6 }
        }
        SuperEncoding::NnDriven => DeltaQpBounds { fg_min: -6, fg_max: 0, bg_min: 0, bg_max: 6 },
    }
}

fn setup_super_encoding(cfg: &mut EncCfg, params: &Params) {
    let mut mode = match params.super_encoding {
        SuperEncoding::Off => 0,
        SuperEncoding::QualityFirst => 1,
        SuperEncoding::CompressFirst => 2,
        SuperEncoding::NnDriven => 3,
    };
    if mode == 3 && !ChipCapInfo::get().scale_meta_cap {
        // The detector feeds on the hardware's downscaled thumbnails.
        log::warn!("nn super encoding without scaling metadata, using quality-first bounds");
        mode = 1;
    }
    if mode == 0 {
        return;
    }
    cfg.set_u32("tune:super_enc", mode);
    let bounds = super_encoding_qp_bounds(params.super_encoding);
    cfg.set_i32("tune:fg_dqp_min", bounds.fg_min);
    cfg.set_i32("tune:fg_dqp_max", bounds.fg_max);
    cfg.set_i32("tune:bg_dqp_min", bounds.bg_min);
    cfg.set_i32("tune:bg_dqp_max", bounds.bg_max);
}

fn setup_mlvec(cfg: &mut EncCfg, params: &Params, coding: CodedFormat) {
    let mlvec = &params.mlvec;
    if !mlvec.enabled() {
        return;
    }
    if mlvec.slice_spacing >= 0 {
        // Overrides the byte-based split request.
        cfg.set_u32("split:mode", 2);
        cfg.set_i32("split:arg", mlvec.slice_spacing);
    }
    if mlvec.num_ltr_frames > 0 {
        cfg.set_i32("mlvec:ltr_frames", mlvec.num_ltr_frames);
        // Long-term reference structure: one engine slot per LTR index,
        // refreshed only on an explicit mark, while short-term frames keep
        // referencing their immediate predecessor.
        cfg.set_u32("ref:lt_cnt", mlvec.num_ltr_frames as u32);
        cfg.set_u32("ref:lt_gap", 0);
        cfg.set_u32("ref:st_gap", 1);
    }
    if let Some(sar) = mlvec.sar {
        cfg.set_u32("vui:sar_width", sar.width);
        cfg.set_u32("vui:sar_height", sar.height);
    }
    if coding == CodedFormat::H264 {
        // LTR signalling needs explicit picture order counts.
        cfg.set_u32("h264:poc_type", 2);
    }
}

fn raw_format_code(format: RawFormat) -> u32 {
    match format {
        RawFormat::Nv12 => 0,
        RawFormat::Nv12_10 => 1,
        RawFormat::P010 => 2,
        RawFormat::Rgba8888 => 3,
        RawFormat::Fbc8 => 4,
        RawFormat::Fbc10 => 5,
    }
}

fn avc_level_code(level: Level) -> u32 {
    match level {
        Level::Avc5 => 50,
        Level::Avc51 => 51,
        Level::Avc52 => 52,
        Level::Avc6 => 60,
        Level::Avc61 => 61,
        Level::Avc62 => 62,
        _ => 41,
    }
}

fn hevc_level_code(level: Level) -> u32 {
    match level {
        Level::HevcMain5 | Level::HevcHigh5 => 150,
        Level::HevcMain51 | Level::HevcHigh51 => 153,
        Level::HevcMain52 | Level::HevcHigh52 => 156,
        Level::HevcMain6 | Level::HevcHigh6 => 180,
        Level::HevcMain61 | Level::HevcHigh61 => 183,
        Level::HevcMain62 | Level::HevcHigh62 => 186,
        _ => 120,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{PictureQuantization, QpRange, SuperProcess, TemporalLayering};
    use crate::Resolution;

    fn base_params() -> Params {
        let mut params = Params::default();
        params.picture_size = Resolution::new(1280, 720);
        params.bitrate = 2_000_000;
        params
    }

    #[test]
    fn gop_layers_fold() {
        // 1 I followed by 29 P.
        let layers = [
            GopLayer { kind: PictureType::I_FRAME, count: 0 },
            GopLayer { kind: PictureType::P_FRAME, count: 29 },
        ];
        assert_eq!(parse_gop(&layers), GopParams { sync_interval: 30, max_b_frames: 0 });

        let layers = [
            GopLayer { kind: PictureType::I_FRAME, count: 0 },
            GopLayer { kind: PictureType::P_FRAME.union(PictureType::B_FRAME), count: 2 },
        ];
        assert_eq!(parse_gop(&layers), GopParams { sync_interval: 3, max_b_frames: 2 });
    }

    #[test]
    fn sync_period_to_gop_frames() {
        let mut params = base_params();
        params.frame_rate = 30.0;
        params.sync_frame_period_us = 1_000_000;
        assert_eq!(effective_gop(&params), 30);

        params.sync_frame_period_us = 2_000_000;
        assert_eq!(effective_gop(&params), 60);

        // Declarative GOP wins over the period.
        params.gop_layers = vec![GopLayer { kind: PictureType::P_FRAME, count: 14 }];
        assert_eq!(effective_gop(&params), 15);
    }

    #[test]
    fn layer_cycle_position() {
        assert_eq!(layer_position(0, 1), 0);
        assert_eq!(layer_position(7, 1), 0);
        // Two layers cycle every 2 inputs, three every 4, four every 8.
        assert_eq!(layer_position(5, 2), 1);
        assert_eq!(layer_position(4, 3), 0);
        assert_eq!(layer_position(6, 3), 2);
        assert_eq!(layer_position(8, 4), 0);
        assert_eq!(layer_position(9, 4), 1);
    }

    #[test]
    fn cbr_bounds_sixteenth() {
        let bounds = bitrate_bounds(1_600_000, BitrateMode::Cbr);
        assert_eq!(bounds.target, 1_600_000);
        assert_eq!(bounds.max, 1_700_000);
        assert_eq!(bounds.min, 1_500_000);
    }

    #[test]
    fn vbr_floats_below_target() {
        let bounds = bitrate_bounds(1_600_000, BitrateMode::Vbr);
        assert_eq!(bounds.max, 1_600_000);
        assert_eq!(bounds.min, 100_000);
        // Engine floor applies even when a sixteenth would be lower.
        let bounds = bitrate_bounds(4096, BitrateMode::Vbr);
        assert_eq!(bounds.min, ENGINE_BPS_FLOOR);
    }

    #[test]
    fn full_compile_covers_all_groups() {
        let mut params = base_params();
        params.profile = Profile::AvcHigh;
        params.super_process = SuperProcess { mode: 2, i_thd: 2, p_thd: 2, reenc_times: 2 };
        params.temporal_layering = TemporalLayering { layer_count: 3, b_layer_count: 0 };
        let cfg = compile(&params, CodedFormat::H264).unwrap();

        assert_eq!(cfg.get_str("codec:type"), Some("h264"));
        assert_eq!(cfg.get_u32("prep:width"), Some(1280));
        assert_eq!(cfg.get_u32("prep:hor_stride"), Some(1280));
        assert_eq!(cfg.get_u32("prep:ver_stride"), Some(720));
        assert_eq!(cfg.get_u32("h264:profile"), Some(100));
        assert_eq!(cfg.get_u32("h264:trans8x8"), Some(1));
        assert_eq!(cfg.get_u32("sp:mode"), Some(2));
        assert_eq!(cfg.get_u32("ref:tsvc_layers"), Some(3));
        assert_eq!(cfg.get_u32("ref:cycle_len"), Some(4));
        assert_eq!(cfg.get_u32("rc:bps_target"), Some(2_000_000));
        assert!(cfg.get_u32("vui:matrix").is_some());
    }

    #[test]
    fn temporal_layer_reference_structure() {
        let mut params = base_params();
        params.temporal_layering = TemporalLayering { layer_count: 3, b_layer_count: 0 };
        let cfg = compile_h264(&mut params);
        assert_eq!(cfg.get_u32("ref:cycle_len"), Some(4));
        let read = |keys: &[&'static str; 8]| -> Vec<u32> {
            (0..4).map(|i| cfg.get_u32(keys[i]).unwrap()).collect()
        };
        assert_eq!(read(&REF_SLOT_TID), vec![0, 2, 1, 2]);
        assert_eq!(read(&REF_SLOT_NON_REF), vec![0, 1, 0, 1]);
        assert_eq!(read(&REF_SLOT_REF_GAP), vec![4, 1, 2, 1]);

        params.temporal_layering = TemporalLayering { layer_count: 4, b_layer_count: 0 };
        let cfg = compile_h264(&mut params);
        assert_eq!(cfg.get_u32("ref:cycle_len"), Some(8));
        let tids: Vec<u32> = (0..8).map(|i| cfg.get_u32(REF_SLOT_TID[i]).unwrap()).collect();
        assert_eq!(tids, vec![0, 3, 2, 3, 1, 3, 2, 3]);
        let gaps: Vec<u32> = (0..8).map(|i| cfg.get_u32(REF_SLOT_REF_GAP[i]).unwrap()).collect();
        assert_eq!(gaps, vec![8, 1, 2, 1, 4, 1, 2, 1]);
    }

    #[test]
    fn vp8_vertical_stride_is_16_aligned() {
        let mut params = base_params();
        params.picture_size = Resolution::new(640, 360);
        params.profile = Profile::Vp8Any;
        let cfg = compile(&params, CodedFormat::VP8).unwrap();
        assert_eq!(cfg.get_u32("prep:ver_stride"), Some(368));

        let cfg = compile_h264(&mut params);
        assert_eq!(cfg.get_u32("prep:ver_stride"), Some(360));
    }

    fn compile_h264(params: &mut Params) -> EncCfg {
        params.profile = Profile::AvcBaseline;
        compile(params, CodedFormat::H264).unwrap()
    }

    #[test]
    fn qp_defaults_per_codec() {
        let mut params = base_params();
        params.profile = Profile::Vp8Any;
        let cfg = compile(&params, CodedFormat::VP8).unwrap();
        assert_eq!(cfg.get_i32("rc:qp_min"), Some(0));
        assert_eq!(cfg.get_i32("rc:qp_max"), Some(127));

        let cfg = compile_h264(&mut params);
        assert_eq!(cfg.get_i32("rc:qp_min"), Some(1));
        assert_eq!(cfg.get_i32("rc:qp_max"), Some(51));
    }

    #[test]
    fn qp_low_resolution_guard() {
        let mut params = base_params();
        params.picture_size = Resolution::new(320, 240);
        let cfg = compile_h264(&mut params);
        assert_eq!(cfg.get_i32("rc:qp_max"), Some(40));
    }

    #[test]
    fn qp_fixed_mode_pins() {
        let mut params = base_params();
        params.bitrate_mode = BitrateMode::FixQp;
        let cfg = compile_h264(&mut params);
        assert_eq!(cfg.get_i32("rc:qp_init"), Some(10));
        assert_eq!(cfg.get_i32("rc:qp_min"), Some(10));
        assert_eq!(cfg.get_i32("rc:qp_max"), Some(10));

        params.picture_quantization =
            PictureQuantization { i: Some(QpRange { min: 24, max: 30 }), p: None, b: None };
        let cfg = compile_h264(&mut params);
        assert_eq!(cfg.get_i32("rc:qp_init"), Some(24));
    }

    #[test]
    fn handheld_quality_caps_qp() {
        let mut params = base_params();
        params.min_quality = MinQuality::SHandheld;
        let cfg = compile_h264(&mut params);
        assert_eq!(cfg.get_i32("rc:qp_max"), Some(35));
    }

    #[test]
    fn dynamic_recompiles_only_changed_groups() {
        let old = base_params();
        let mut new = old.clone();
        new.bitrate = 4_000_000;

        let change = diff(&old, &new);
        assert!(change.bitrate);
        assert!(!change.size && !change.frame_rate && !change.profile);

        let cfg = compile_dynamic(&new, CodedFormat::H264, change).unwrap().unwrap();
        assert_eq!(cfg.get_u32("rc:bps_target"), Some(4_000_000));
        assert!(cfg.get_u32("prep:width").is_none());
        assert!(cfg.get_u32("h264:profile").is_none());
    }

    #[test]
    fn dynamic_noop_yields_none() {
        let params = base_params();
        let change = diff(&params, &params.clone());
        assert!(!change.any());
        assert!(compile_dynamic(&params, CodedFormat::H264, change).unwrap().is_none());
    }

    #[test]
    fn extension_split_overrides_byte_split() {
        let mut params = base_params();
        params.slice_size = 1500;
        params.mlvec.slice_spacing = 8;
        params.mlvec.num_ltr_frames = 2;
        let cfg = compile_h264(&mut params);
        assert_eq!(cfg.get_u32("split:mode"), Some(2));
        assert_eq!(cfg.get_i32("split:arg"), Some(8));
        assert_eq!(cfg.get_u32("h264:poc_type"), Some(2));
        // LTR slots carry their own reference structure.
        assert_eq!(cfg.get_u32("ref:lt_cnt"), Some(2));
        assert_eq!(cfg.get_u32("ref:st_gap"), Some(1));
    }

    #[test]
    fn super_encoding_emits_qp_bound_table() {
        let mut params = base_params();
        params.super_encoding = SuperEncoding::QualityFirst;
        let cfg = compile_h264(&mut params);
        assert_eq!(cfg.get_u32("tune:super_enc"), Some(1));
        assert_eq!(cfg.get_i32("tune:fg_dqp_min"), Some(-6));
        assert_eq!(cfg.get_i32("tune:fg_dqp_max"), Some(0));
        assert_eq!(cfg.get_i32("tune:bg_dqp_max"), Some(3));

        params.super_encoding = SuperEncoding::CompressFirst;
        let cfg = compile_h264(&mut params);
        assert_eq!(cfg.get_u32("tune:super_enc"), Some(2));
        assert_eq!(cfg.get_i32("tune:fg_dqp_min"), Some(-3));
        assert_eq!(cfg.get_i32("tune:bg_dqp_max"), Some(6));

        params.super_encoding = SuperEncoding::Off;
        let cfg = compile_h264(&mut params);
        assert!(cfg.get_u32("tune:super_enc").is_none());
    }

    #[test]
    fn vp9_encode_rejected() {
        let params = base_params();
        assert!(compile(&params, CodedFormat::VP9).is_err());
    }
}
