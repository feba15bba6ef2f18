// Copyright 2025 The MppC2 Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-SoC capability table.
//!
//! Resolved once per process from the platform compatible string; all
//! lookups afterwards are plain reads of an immutable record. Unknown
//! platforms fall back to a conservative default.

use std::fs;
use std::sync::OnceLock;

use crate::CodedFormat;

/// Frame-buffer compression families a decoder may emit.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FbcMode {
    #[default]
    None,
    Afbc16x16,
    Rfbc64x4,
}

/// Compression capability of one codec on one SoC, with the pixel offset
/// the compressed layout pads the origin by.
#[derive(Copy, Clone, Debug)]
pub struct FbcCap {
    pub coding: CodedFormat,
    pub mode: FbcMode,
    pub offset_x: u32,
    pub offset_y: u32,
}

/// 10-bit decode capability bits.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TenBitCaps {
    pub avc: bool,
    pub hevc: bool,
    pub vp9: bool,
}

/// Static description of one SoC's codec-relevant hardware.
#[derive(Clone, Debug)]
pub struct ChipCapInfo {
    pub chip_name: &'static str,
    pub fbc_caps: &'static [FbcCap],
    pub cap_10bit: TenBitCaps,
    /// Hardware carries scaling metadata alongside decoded frames.
    pub scale_meta_cap: bool,
    /// A dedicated hardware encoder block is present.
    pub has_hw_encoder: bool,
    /// The encoder accepts arbitrary strides without a blit.
    pub free_align_encoder: bool,
    /// HDR dynamic metadata survives the decode path.
    pub hdr_meta_cap: bool,
}

const FBC_CAPS_GEN2: &[FbcCap] = &[
    FbcCap { coding: CodedFormat::H264, mode: FbcMode::Afbc16x16, offset_x: 0, offset_y: 4 },
    FbcCap { coding: CodedFormat::H265, mode: FbcMode::Afbc16x16, offset_x: 0, offset_y: 4 },
    FbcCap { coding: CodedFormat::VP9, mode: FbcMode::Afbc16x16, offset_x: 0, offset_y: 0 },
];

const FBC_CAPS_GEN3: &[FbcCap] = &[
    FbcCap { coding: CodedFormat::H264, mode: FbcMode::Afbc16x16, offset_x: 0, offset_y: 4 },
    FbcCap { coding: CodedFormat::H265, mode: FbcMode::Afbc16x16, offset_x: 0, offset_y: 4 },
    FbcCap { coding: CodedFormat::VP9, mode: FbcMode::Afbc16x16, offset_x: 0, offset_y: 0 },
    FbcCap { coding: CodedFormat::AV1, mode: FbcMode::Afbc16x16, offset_x: 0, offset_y: 8 },
];

const TEN_BIT_ALL: TenBitCaps = TenBitCaps { avc: true, hevc: true, vp9: true };

const CHIP_CAP_DEFAULT: ChipCapInfo = ChipCapInfo {
    chip_name: "unknown",
    fbc_caps: &[],
    cap_10bit: TenBitCaps { avc: false, hevc: false, vp9: false },
    scale_meta_cap: false,
    has_hw_encoder: false,
    free_align_encoder: false,
    hdr_meta_cap: false,
};

static CHIP_CAP_INFOS: &[ChipCapInfo] = &[
    ChipCapInfo {
        chip_name: "rk3288",
        fbc_caps: &[],
        cap_10bit: TenBitCaps { avc: false, hevc: false, vp9: false },
        scale_meta_cap: false,
        has_hw_encoder: true,
        free_align_encoder: false,
        hdr_meta_cap: false,
    },
    ChipCapInfo {
        chip_name: "rk3399",
        fbc_caps: &[],
        cap_10bit: TEN_BIT_ALL,
        scale_meta_cap: false,
        has_hw_encoder: true,
        free_align_encoder: false,
        hdr_meta_cap: false,
    },
    ChipCapInfo {
        chip_name: "rk3566",
        fbc_caps: FBC_CAPS_GEN2,
        cap_10bit: TEN_BIT_ALL,
        scale_meta_cap: false,
        has_hw_encoder: true,
        free_align_encoder: true,
        hdr_meta_cap: true,
    },
    ChipCapInfo {
        chip_name: "rk3568",
        fbc_caps: FBC_CAPS_GEN2,
        cap_10bit: TEN_BIT_ALL,
        scale_meta_cap: false,
        has_hw_encoder: true,
        free_align_encoder: true,
        hdr_meta_cap: true,
    },
    ChipCapInfo {
        chip_name: "rk3588",
        fbc_caps: FBC_CAPS_GEN3,
        cap_10bit: TEN_BIT_ALL,
        scale_meta_cap: true,
        has_hw_encoder: true,
        free_align_encoder: true,
        hdr_meta_cap: true,
    },
    ChipCapInfo {
        chip_name: "rk3528",
        fbc_caps: FBC_CAPS_GEN3,
        cap_10bit: TEN_BIT_ALL,
        scale_meta_cap: true,
        has_hw_encoder: true,
        free_align_encoder: true,
        hdr_meta_cap: true,
    },
    ChipCapInfo {
        chip_name: "rk3562",
        fbc_caps: &[],
        cap_10bit: TenBitCaps { avc: false, hevc: false, vp9: false },
        scale_meta_cap: false,
        has_hw_encoder: true,
        free_align_encoder: true,
        hdr_meta_cap: false,
    },
];

impl ChipCapInfo {
    /// Match a platform compatible string against the table.
    pub fn from_name(name: &str) -> &'static ChipCapInfo {
        for info in CHIP_CAP_INFOS {
            if name.contains(info.chip_name) {
                log::info!("matched chip {}", info.chip_name);
                return info;
            }
        }
        log::info!("unknown platform '{}', using default caps", name.trim());
        &CHIP_CAP_DEFAULT
    }

    /// Process-wide record, resolved once from the device tree.
    pub fn get() -> &'static ChipCapInfo {
        static INSTANCE: OnceLock<&'static ChipCapInfo> = OnceLock::new();
        INSTANCE.get_or_init(|| {
            let name = fs::read_to_string("/proc/device-tree/compatible").unwrap_or_default();
            ChipCapInfo::from_name(&name)
        })
    }

    pub fn fbc_output_mode(&self, coding: CodedFormat) -> FbcMode {
        self.fbc_caps
            .iter()
            .find(|cap| cap.coding == coding)
            .map(|cap| cap.mode)
            .unwrap_or(FbcMode::None)
    }

    pub fn fbc_output_offset(&self, coding: CodedFormat) -> (u32, u32) {
        self.fbc_caps
            .iter()
            .find(|cap| cap.coding == coding)
            .map(|cap| (cap.offset_x, cap.offset_y))
            .unwrap_or((0, 0))
    }

    pub fn is_10bit_supported(&self, coding: CodedFormat) -> bool {
        match coding {
            CodedFormat::H264 => self.cap_10bit.avc,
            CodedFormat::H265 => self.cap_10bit.hevc,
            CodedFormat::VP9 => self.cap_10bit.vp9,
            _ => false,
        }
    }
}
