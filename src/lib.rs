// Copyright 2025 The MppC2 Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Asynchronous component adapter for hardware video codec engines.
//!
//! The crate exposes a Codec2-style component surface (`queue_nb`,
//! `flush_sm`, `drain_nb`, lifecycle calls and a listener) and drives an
//! underlying vendor video processing engine to decode or encode elementary
//! streams. Decoder and encoder share the work queue, the event loop and the
//! buffer plumbing but implement their own per-tick bodies.

pub mod buffer;
pub mod caps;
pub mod component;
pub mod encoder_config;
pub mod engine;
pub mod inspect;
pub mod params;
pub mod utils;
pub mod work;
pub mod work_queue;

use std::fmt;
use std::str::FromStr;

/// A frame resolution in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn get_area(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self { width: value.0, height: value.1 }
    }
}

/// Compressed stream formats understood by the adapter.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CodedFormat {
    H264,
    H265,
    VP8,
    VP9,
    AV1,
}

impl CodedFormat {
    /// Whether the codec carries color description in its VUI.
    pub fn has_vui_color_aspects(&self) -> bool {
        matches!(self, CodedFormat::H264 | CodedFormat::H265)
    }
}

impl FromStr for CodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" => Ok(CodedFormat::H264),
            "h265" | "H265" => Ok(CodedFormat::H265),
            "vp8" | "VP8" => Ok(CodedFormat::VP8),
            "vp9" | "VP9" => Ok(CodedFormat::VP9),
            "av1" | "AV1" => Ok(CodedFormat::AV1),
            _ => Err("unrecognized coded format. Valid values: h264, h265, vp8, vp9, av1"),
        }
    }
}

impl fmt::Display for CodedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodedFormat::H264 => write!(f, "h264"),
            CodedFormat::H265 => write!(f, "h265"),
            CodedFormat::VP8 => write!(f, "vp8"),
            CodedFormat::VP9 => write!(f, "vp9"),
            CodedFormat::AV1 => write!(f, "av1"),
        }
    }
}

/// Raw frame memory layouts exchanged with the engine and the block pool.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum RawFormat {
    /// 8-bit 4:2:0, interleaved chroma.
    #[default]
    Nv12,
    /// Packed 10-bit 4:2:0, interleaved chroma, as produced by the engine.
    Nv12_10,
    /// 16-bit-container 10-bit 4:2:0 (high 10 bits significant).
    P010,
    /// 8-bit RGBA.
    Rgba8888,
    /// Compressed framebuffer layout negotiated with the display.
    Fbc8,
    /// Compressed framebuffer layout, 10-bit.
    Fbc10,
}

impl RawFormat {
    pub fn is_compressed(&self) -> bool {
        matches!(self, RawFormat::Fbc8 | RawFormat::Fbc10)
    }

    pub fn is_10bit(&self) -> bool {
        matches!(self, RawFormat::Nv12_10 | RawFormat::P010 | RawFormat::Fbc10)
    }

    /// Bytes needed for one frame at the given strides.
    pub fn frame_size(&self, hor_stride: usize, ver_stride: usize) -> usize {
        match self {
            RawFormat::Nv12 | RawFormat::Nv12_10 | RawFormat::Fbc8 | RawFormat::Fbc10 => {
                hor_stride * ver_stride * 3 / 2
            }
            RawFormat::P010 => hor_stride * ver_stride * 3,
            RawFormat::Rgba8888 => hor_stride * ver_stride * 4,
        }
    }
}

impl FromStr for RawFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nv12" | "NV12" => Ok(RawFormat::Nv12),
            "nv12_10" | "NV12_10" => Ok(RawFormat::Nv12_10),
            "p010" | "P010" => Ok(RawFormat::P010),
            "rgba" | "RGBA" => Ok(RawFormat::Rgba8888),
            _ => Err("unrecognized raw format. Valid values: nv12, nv12_10, p010, rgba"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coded_format_from_str() {
        assert_eq!(CodedFormat::from_str("h264"), Ok(CodedFormat::H264));
        assert_eq!(CodedFormat::from_str("AV1"), Ok(CodedFormat::AV1));
        assert!(CodedFormat::from_str("mpeg2").is_err());
    }

    #[test]
    fn raw_format_sizes() {
        assert_eq!(RawFormat::Nv12.frame_size(1920, 1088), 1920 * 1088 * 3 / 2);
        assert_eq!(RawFormat::P010.frame_size(1920, 1088), 1920 * 1088 * 3);
        assert_eq!(RawFormat::Rgba8888.frame_size(1280, 720), 1280 * 720 * 4);
    }
}
