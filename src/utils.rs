// Copyright 2025 The MppC2 Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Geometry, DPB sizing and pixel-format helpers shared by both pipelines.

use crate::params::{ColorAspects, ColorMatrix, ColorPrimaries, ColorRange, ColorTransfer};
use crate::work::Status;
use crate::CodedFormat;
use crate::RawFormat;
use crate::Resolution;

/// Round `value` up to a multiple of `alignment` (a power of two).
pub const fn align(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

pub const fn align_usize(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Smallest input-buffer capacity the decoder advertises.
pub const MIN_INPUT_BUFFER_SIZE: u32 = 2 * 1024 * 1024;

/// Worst-case compressed access-unit size for a stream geometry.
pub fn max_input_size(size: Resolution) -> u32 {
    let blocks = size.width.div_ceil(64) * size.height.div_ceil(64);
    (blocks * 3072).max(MIN_INPUT_BUFFER_SIZE)
}

struct LevelDpbInfo {
    level: crate::params::Level,
    max_dpb_pixels: u64,
}

use crate::params::Level;

/// maxDpbMbs * 256 per AVC level.
const H264_DPB_INFOS: &[LevelDpbInfo] = &[
    LevelDpbInfo { level: Level::Avc5, max_dpb_pixels: 110_400 * 256 },
    LevelDpbInfo { level: Level::Avc51, max_dpb_pixels: 184_320 * 256 },
    LevelDpbInfo { level: Level::Avc52, max_dpb_pixels: 184_320 * 256 },
    LevelDpbInfo { level: Level::Avc6, max_dpb_pixels: 696_320 * 256 },
    LevelDpbInfo { level: Level::Avc61, max_dpb_pixels: 696_320 * 256 },
    LevelDpbInfo { level: Level::Avc62, max_dpb_pixels: 696_320 * 256 },
];

/// maxLumaPs * 6 per HEVC level.
const H265_DPB_INFOS: &[LevelDpbInfo] = &[
    LevelDpbInfo { level: Level::HevcMain5, max_dpb_pixels: 8_912_896 * 6 },
    LevelDpbInfo { level: Level::HevcMain51, max_dpb_pixels: 8_912_896 * 6 },
    LevelDpbInfo { level: Level::HevcMain52, max_dpb_pixels: 8_912_896 * 6 },
    LevelDpbInfo { level: Level::HevcMain6, max_dpb_pixels: 35_651_584 * 6 },
    LevelDpbInfo { level: Level::HevcMain61, max_dpb_pixels: 35_651_584 * 6 },
    LevelDpbInfo { level: Level::HevcMain62, max_dpb_pixels: 35_651_584 * 6 },
    LevelDpbInfo { level: Level::HevcHigh5, max_dpb_pixels: 8_912_896 * 6 },
    LevelDpbInfo { level: Level::HevcHigh51, max_dpb_pixels: 8_912_896 * 6 },
    LevelDpbInfo { level: Level::HevcHigh52, max_dpb_pixels: 8_912_896 * 6 },
    LevelDpbInfo { level: Level::HevcHigh6, max_dpb_pixels: 35_651_584 * 6 },
    LevelDpbInfo { level: Level::HevcHigh61, max_dpb_pixels: 35_651_584 * 6 },
    LevelDpbInfo { level: Level::HevcHigh62, max_dpb_pixels: 35_651_584 * 6 },
];

/// maxLumaPs * 4 per VP9 level.
const VP9_DPB_INFOS: &[LevelDpbInfo] = &[
    LevelDpbInfo { level: Level::Vp9Level5, max_dpb_pixels: 8_912_896 * 4 },
    LevelDpbInfo { level: Level::Vp9Level51, max_dpb_pixels: 8_912_896 * 4 },
    LevelDpbInfo { level: Level::Vp9Level52, max_dpb_pixels: 8_912_896 * 4 },
    LevelDpbInfo { level: Level::Vp9Level6, max_dpb_pixels: 35_651_584 * 4 },
    LevelDpbInfo { level: Level::Vp9Level61, max_dpb_pixels: 35_651_584 * 4 },
    LevelDpbInfo { level: Level::Vp9Level62, max_dpb_pixels: 35_651_584 * 4 },
];

const H264_MIN_REF_COUNT: u32 = 4;
const H264_MAX_REF_COUNT: u32 = 16;
const H265_MIN_REF_COUNT: u32 = 6;
const H265_MAX_REF_COUNT: u32 = 16;
const VP9_MIN_REF_COUNT: u32 = 5;
const VP9_MAX_REF_COUNT: u32 = 16;
const AV1_DEF_REF_COUNT: u32 = 10;
const DEFAULT_REF_COUNT: u32 = 8;
/// Extra frames reserved for the deinterlacer on streams it can handle.
const IEP_DEF_REF_COUNT: u32 = 5;

fn dpb_pixels(infos: &[LevelDpbInfo], level: Level) -> u64 {
    // Level 5.1 is the fallback when the stream does not declare one.
    infos
        .iter()
        .find(|info| info.level == level)
        .map(|info| info.max_dpb_pixels)
        .unwrap_or(infos[1].max_dpb_pixels)
}

/// Protocol DPB requirement for a stream geometry: the number of output
/// slots the host must provision so the decoder never starves.
pub fn video_ref_count(coding: CodedFormat, size: Resolution, level: Level) -> u32 {
    let area = size.get_area().max(1) as u64;
    match coding {
        CodedFormat::H264 => {
            let mut count = (dpb_pixels(H264_DPB_INFOS, level) / area) as u32;
            count = count.clamp(H264_MIN_REF_COUNT, H264_MAX_REF_COUNT);
            if size.width <= 1920 || size.height <= 1920 {
                // reserved for deinterlace
                count += IEP_DEF_REF_COUNT;
            }
            count
        }
        CodedFormat::H265 => {
            let count = (dpb_pixels(H265_DPB_INFOS, level) / area) as u32;
            count.clamp(H265_MIN_REF_COUNT, H265_MAX_REF_COUNT)
        }
        CodedFormat::VP9 => {
            let count = (dpb_pixels(VP9_DPB_INFOS, level) / area) as u32;
            count.clamp(VP9_MIN_REF_COUNT, VP9_MAX_REF_COUNT)
        }
        CodedFormat::AV1 => AV1_DEF_REF_COUNT,
        _ => {
            log::debug!("use default ref frame count {}", DEFAULT_REF_COUNT);
            DEFAULT_REF_COUNT
        }
    }
}

/// Extra output slots decoupling producer from consumer jitter.
pub const RENDER_SMOOTHNESS_FACTOR: u32 = 4;

/// Output delay advertised to the host, and the number of slots trimmed off
/// in low-memory mode.
pub fn derive_output_delay(num_slots: u32, low_memory: bool) -> (u32, u32) {
    if low_memory {
        let reduce = num_slots.min(RENDER_SMOOTHNESS_FACTOR - 1);
        (num_slots - reduce, reduce)
    } else {
        (num_slots, 0)
    }
}

/// ISO/IEC 23001-8 color description triple plus full-range flag.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IsoColorDescription {
    pub primaries: u32,
    pub transfer: u32,
    pub matrix: u32,
    pub full_range: bool,
}

pub fn color_aspects_to_iso(aspects: ColorAspects) -> IsoColorDescription {
    let primaries = match aspects.primaries {
        ColorPrimaries::Unspecified => 2,
        ColorPrimaries::Bt709 => 1,
        ColorPrimaries::Bt601_625 => 5,
        ColorPrimaries::Bt601_525 => 6,
        ColorPrimaries::Bt2020 => 9,
        ColorPrimaries::Bt470M => 4,
    };
    let transfer = match aspects.transfer {
        ColorTransfer::Unspecified => 2,
        ColorTransfer::Linear => 8,
        ColorTransfer::Srgb => 13,
        ColorTransfer::Smpte170M => 6,
        ColorTransfer::Gamma22 => 4,
        ColorTransfer::Gamma28 => 5,
        ColorTransfer::St2084 => 16,
        ColorTransfer::Hlg => 18,
    };
    let matrix = match aspects.matrix {
        ColorMatrix::Unspecified => 2,
        ColorMatrix::Bt709 => 1,
        ColorMatrix::Bt601 => 6,
        ColorMatrix::Bt2020 => 9,
        ColorMatrix::Bt470M => 4,
    };
    IsoColorDescription {
        primaries,
        transfer,
        matrix,
        full_range: aspects.range == ColorRange::Full,
    }
}

pub fn iso_to_color_aspects(iso: IsoColorDescription) -> ColorAspects {
    ColorAspects {
        range: if iso.full_range { ColorRange::Full } else { ColorRange::Limited },
        primaries: match iso.primaries {
            1 => ColorPrimaries::Bt709,
            4 => ColorPrimaries::Bt470M,
            5 => ColorPrimaries::Bt601_625,
            6 | 7 => ColorPrimaries::Bt601_525,
            9 => ColorPrimaries::Bt2020,
            _ => ColorPrimaries::Unspecified,
        },
        transfer: match iso.transfer {
            1 | 6 | 14 | 15 => ColorTransfer::Smpte170M,
            4 => ColorTransfer::Gamma22,
            5 => ColorTransfer::Gamma28,
            8 => ColorTransfer::Linear,
            13 => ColorTransfer::Srgb,
            16 => ColorTransfer::St2084,
            18 => ColorTransfer::Hlg,
            _ => ColorTransfer::Unspecified,
        },
        matrix: match iso.matrix {
            1 => ColorMatrix::Bt709,
            4 => ColorMatrix::Bt470M,
            5 | 6 => ColorMatrix::Bt601,
            9 | 10 => ColorMatrix::Bt2020,
            _ => ColorMatrix::Unspecified,
        },
    }
}

/// Fill unspecified primaries/matrix from their specified counterpart, so
/// downstream consumers always see a coherent pair. SD streams default to
/// the 525-line variant at or below 720x480, the 625-line variant above.
pub fn pair_default_color_aspects(aspects: &mut ColorAspects, size: Resolution) {
    let sd_525 = size.width <= 720 && size.height <= 480;

    if aspects.primaries == ColorPrimaries::Unspecified
        && aspects.matrix != ColorMatrix::Unspecified
    {
        aspects.primaries = match aspects.matrix {
            ColorMatrix::Bt709 => ColorPrimaries::Bt709,
            ColorMatrix::Bt601 => {
                if sd_525 {
                    ColorPrimaries::Bt601_525
                } else {
                    ColorPrimaries::Bt601_625
                }
            }
            ColorMatrix::Bt2020 => ColorPrimaries::Bt2020,
            ColorMatrix::Bt470M => ColorPrimaries::Bt470M,
            ColorMatrix::Unspecified => ColorPrimaries::Unspecified,
        };
    }

    if aspects.matrix == ColorMatrix::Unspecified
        && aspects.primaries != ColorPrimaries::Unspecified
    {
        aspects.matrix = match aspects.primaries {
            ColorPrimaries::Bt709 => ColorMatrix::Bt709,
            ColorPrimaries::Bt601_625 | ColorPrimaries::Bt601_525 => ColorMatrix::Bt601,
            ColorPrimaries::Bt2020 => ColorMatrix::Bt2020,
            ColorPrimaries::Bt470M => ColorMatrix::Bt470M,
            ColorPrimaries::Unspecified => ColorMatrix::Unspecified,
        };
    }
}

/// Copy NV12 `src` (strided) into a tightly packed `dst`.
pub fn nv12_copy(
    src: &[u8],
    dst: &mut [u8],
    width: usize,
    height: usize,
    hor_stride: usize,
    ver_stride: usize,
) {
    let mut out = 0;
    for row in 0..height {
        let line = &src[row * hor_stride..row * hor_stride + width];
        dst[out..out + width].copy_from_slice(line);
        out += width;
    }

    let chroma = &src[hor_stride * ver_stride..];
    let width = (width + 1) & !1;
    for row in 0..height.div_ceil(2) {
        let line = &chroma[row * hor_stride..row * hor_stride + width];
        dst[out..out + width].copy_from_slice(line);
        out += width;
    }
}

/// Unpack one row of engine-packed 10-bit samples (4 pixels in 5 bytes)
/// into 16-bit values.
fn unpack_10bit_row(src: &[u8], dst: &mut [u16], width: usize) {
    for k in 0..width.div_ceil(8) {
        let base = &src[k * 10..];
        let word = |i: usize| u16::from_le_bytes([base[i * 2], base[i * 2 + 1]]);
        let out = &mut dst[k * 8..];

        out[0] = word(0) & 0x03ff;
        out[1] = (word(0) & 0xfc00) >> 10 | (word(1) & 0x000f) << 6;
        out[2] = (word(1) & 0x3ff0) >> 4;
        out[3] = (word(1) & 0xc000) >> 14 | (word(2) & 0x00ff) << 2;
        out[4] = (word(2) & 0xff00) >> 8 | (word(3) & 0x0003) << 8;
        out[5] = (word(3) & 0x0ffc) >> 2;
        out[6] = (word(3) & 0xf000) >> 12 | (word(4) & 0x003f) << 4;
        out[7] = (word(4) & 0xffc0) >> 6;
    }
}

/// Convert packed 10-bit NV12 into P010 (10 significant bits left-aligned
/// in a 16-bit container).
pub fn convert_10bit_nv12_to_p010(
    dst: &mut [u8],
    dst_stride: usize,
    src: &[u8],
    hor_stride: usize,
    ver_stride: usize,
    width: usize,
    height: usize,
) {
    let mut row_buf = vec![0u16; align_usize(width, 8)];

    let rows = height + height / 2;
    for row in 0..rows {
        // Chroma plane starts at the aligned luma end.
        let src_off = if row < height {
            row * hor_stride
        } else {
            hor_stride * ver_stride + (row - height) * hor_stride
        };
        unpack_10bit_row(&src[src_off..], &mut row_buf, width);
        let out = &mut dst[row * dst_stride..];
        for (i, &sample) in row_buf.iter().take(width).enumerate() {
            let value = sample << 6;
            out[i * 2..i * 2 + 2].copy_from_slice(&value.to_le_bytes());
        }
    }
}

/// Convert packed 10-bit NV12 into 8-bit NV12, discarding the low bits.
pub fn convert_10bit_nv12_to_nv12(
    dst: &mut [u8],
    dst_stride: usize,
    src: &[u8],
    hor_stride: usize,
    ver_stride: usize,
    width: usize,
    height: usize,
) {
    let mut row_buf = vec![0u16; align_usize(width, 8)];

    let rows = height + height / 2;
    for row in 0..rows {
        let src_off = if row < height {
            row * hor_stride
        } else {
            hor_stride * ver_stride + (row - height) * hor_stride
        };
        unpack_10bit_row(&src[src_off..], &mut row_buf, width);
        let out = &mut dst[row * dst_stride..];
        for (i, &sample) in row_buf.iter().take(width).enumerate() {
            out[i] = (sample >> 2) as u8;
        }
    }
}

/// One copy-out request against the 2D blitter.
pub struct BlitRequest<'a> {
    pub data: &'a [u8],
    pub src_format: RawFormat,
    pub dst_format: RawFormat,
    pub size: Resolution,
    pub hor_stride: u32,
    pub ver_stride: u32,
}

/// Hardware copy/convert service. The decoder's copy-out path tries it
/// first and falls back to a CPU copy when the blit fails; compressed
/// source layouts can only be resolved here.
pub trait Blitter: Send {
    fn convert(&mut self, request: &BlitRequest<'_>, dst: &mut [u8]) -> Result<(), Status>;
}
