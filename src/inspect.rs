// Copyright 2025 The MppC2 Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Lightweight inspection of codec-specific data.
//!
//! The decoder probes the first configuration payload for two facts it needs
//! before the engine reports anything: the stream bit depth (to pick the
//! output pixel format) and the reference frame count (to size the output
//! delay). Both probes are fail-soft; a malformed or unsupported payload
//! falls back to defaults rather than failing component configuration.
//!
//! Payloads arrive either as Annex-B byte streams or as the length-prefixed
//! configuration records containers use (`avcC`/`hvcC`).

use anyhow::{anyhow, Context, Result};
use bitreader::BitReader;

use crate::CodedFormat;

const NAL_AVC_SPS: u8 = 7;
const NAL_HEVC_VPS: u8 = 32;
const NAL_HEVC_SPS: u8 = 33;

/// Probe the luma bit depth of the stream. Returns 8 when the payload does
/// not parse or the codec carries no depth signalling we read.
pub fn detect_bit_depth(data: &[u8], coding: CodedFormat) -> u32 {
    let result = match coding {
        CodedFormat::H264 => avc_bit_depth(data),
        CodedFormat::H265 => hevc_bit_depth(data),
        _ => return 8,
    };
    match result {
        Ok(depth) => depth,
        Err(err) => {
            log::debug!("bit depth probe failed ({:#}), assuming 8", err);
            8
        }
    }
}

/// Probe the maximum reference frame count declared by the stream headers.
/// `None` when the payload does not parse; the caller falls back to the
/// level-derived count.
pub fn detect_max_ref_count(data: &[u8], coding: CodedFormat) -> Option<u32> {
    let result = match coding {
        CodedFormat::H264 => avc_max_ref_count(data),
        CodedFormat::H265 => hevc_max_ref_count(data),
        _ => return None,
    };
    match result {
        Ok(count) => Some(count),
        Err(err) => {
            log::debug!("ref count probe failed ({:#})", err);
            None
        }
    }
}

fn avc_bit_depth(data: &[u8]) -> Result<u32> {
    let sps = find_avc_nal(data, NAL_AVC_SPS).context("no SPS in payload")?;
    let profile_idc = *sps.get(1).ok_or_else(|| anyhow!("truncated SPS"))?;
    // High 10 is the only 10-bit AVC profile the engine decodes.
    Ok(if profile_idc == 110 { 10 } else { 8 })
}

fn avc_max_ref_count(data: &[u8]) -> Result<u32> {
    let sps = find_avc_nal(data, NAL_AVC_SPS).context("no SPS in payload")?;
    let rbsp = strip_emulation_prevention(&sps[1..]);
    let mut reader = BitReader::new(&rbsp);

    let profile_idc = reader.read_u8(8)?;
    reader.skip(8)?; // constraint flags + reserved
    reader.skip(8)?; // level_idc
    read_ue(&mut reader)?; // seq_parameter_set_id

    if is_avc_high_family(profile_idc) {
        let chroma_format_idc = read_ue(&mut reader)?;
        if chroma_format_idc == 3 {
            reader.skip(1)?; // separate_colour_plane_flag
        }
        read_ue(&mut reader)?; // bit_depth_luma_minus8
        read_ue(&mut reader)?; // bit_depth_chroma_minus8
        reader.skip(1)?; // qpprime_y_zero_transform_bypass_flag
        if reader.read_bool()? {
            let list_count = if chroma_format_idc != 3 { 8 } else { 12 };
            for i in 0..list_count {
                if reader.read_bool()? {
                    skip_scaling_list(&mut reader, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    read_ue(&mut reader)?; // log2_max_frame_num_minus4
    let pic_order_cnt_type = read_ue(&mut reader)?;
    if pic_order_cnt_type == 0 {
        read_ue(&mut reader)?; // log2_max_pic_order_cnt_lsb_minus4
    } else if pic_order_cnt_type == 1 {
        reader.skip(1)?; // delta_pic_order_always_zero_flag
        read_se(&mut reader)?; // offset_for_non_ref_pic
        read_se(&mut reader)?; // offset_for_top_to_bottom_field
        let cycle_len = read_ue(&mut reader)?;
        if cycle_len > 255 {
            return Err(anyhow!("bad ref frame cycle length {}", cycle_len));
        }
        for _ in 0..cycle_len {
            read_se(&mut reader)?;
        }
    }

    let max_num_ref_frames = read_ue(&mut reader)?;
    if max_num_ref_frames > 16 {
        return Err(anyhow!("implausible max_num_ref_frames {}", max_num_ref_frames));
    }
    Ok(max_num_ref_frames)
}

fn hevc_bit_depth(data: &[u8]) -> Result<u32> {
    let sps = find_hevc_nal(data, NAL_HEVC_SPS).context("no SPS in payload")?;
    let rbsp = strip_emulation_prevention(&sps[2..]);
    let mut reader = BitReader::new(&rbsp);

    reader.skip(4)?; // sps_video_parameter_set_id
    reader.skip(3)?; // sps_max_sub_layers_minus1
    reader.skip(1)?; // sps_temporal_id_nesting_flag
    reader.skip(2)?; // general_profile_space
    reader.skip(1)?; // general_tier_flag
    let profile_idc = reader.read_u8(5)?;
    // Main 10.
    Ok(if profile_idc == 2 { 10 } else { 8 })
}

fn hevc_max_ref_count(data: &[u8]) -> Result<u32> {
    let vps = find_hevc_nal(data, NAL_HEVC_VPS).context("no VPS in payload")?;
    let rbsp = strip_emulation_prevention(&vps[2..]);
    let mut reader = BitReader::new(&rbsp);

    reader.skip(4)?; // vps_video_parameter_set_id
    if reader.read_u8(2)? != 3 {
        return Err(anyhow!("vps_reserved_three_2bits mismatch"));
    }
    reader.skip(6)?; // vps_max_layers_minus1
    let max_sub_layers_minus1 = reader.read_u8(3)? as u32;
    if max_sub_layers_minus1 > 6 {
        return Err(anyhow!("bad vps_max_sub_layers_minus1 {}", max_sub_layers_minus1));
    }
    reader.skip(1)?; // vps_temporal_id_nesting_flag
    if reader.read_u16(16)? != 0xffff {
        return Err(anyhow!("vps_reserved_0xffff_16bits mismatch"));
    }

    // profile_tier_level, general part.
    reader.skip(88)?;
    reader.skip(8)?; // general_level_idc
    let mut profile_present = [false; 7];
    let mut level_present = [false; 7];
    for i in 0..max_sub_layers_minus1 as usize {
        profile_present[i] = reader.read_bool()?;
        level_present[i] = reader.read_bool()?;
    }
    if max_sub_layers_minus1 > 0 {
        for _ in max_sub_layers_minus1..8 {
            reader.skip(2)?; // reserved_zero_2bits
        }
    }
    for i in 0..max_sub_layers_minus1 as usize {
        if profile_present[i] {
            reader.skip(88)?;
        }
        if level_present[i] {
            reader.skip(8)?;
        }
    }

    let ordering_info_present = reader.read_bool()?;
    let start = if ordering_info_present { 0 } else { max_sub_layers_minus1 };
    let mut ref_count = 0u32;
    for _ in start..=max_sub_layers_minus1 {
        let max_dec_pic_buffering_minus1 = read_ue(&mut reader)?;
        read_ue(&mut reader)?; // vps_max_num_reorder_pics
        read_ue(&mut reader)?; // vps_max_latency_increase_plus1
        ref_count += max_dec_pic_buffering_minus1 + 1;
    }

    if ref_count > 17 {
        return Err(anyhow!("implausible DPB size {}", ref_count));
    }
    Ok(ref_count)
}

fn is_avc_high_family(profile_idc: u8) -> bool {
    matches!(profile_idc, 100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135)
}

fn skip_scaling_list(reader: &mut BitReader, size: u32) -> Result<()> {
    let mut last_scale: i64 = 8;
    let mut next_scale: i64 = 8;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = read_se(reader)? as i64;
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

/// Exp-Golomb, unsigned.
fn read_ue(reader: &mut BitReader) -> Result<u32> {
    let mut leading_zeros = 0u8;
    while !reader.read_bool()? {
        leading_zeros += 1;
        if leading_zeros > 31 {
            return Err(anyhow!("exp-Golomb run too long"));
        }
    }
    if leading_zeros == 0 {
        return Ok(0);
    }
    let suffix = reader.read_u32(leading_zeros)?;
    Ok((1u32 << leading_zeros) - 1 + suffix)
}

/// Exp-Golomb, signed.
fn read_se(reader: &mut BitReader) -> Result<i32> {
    let code = read_ue(reader)? as i64;
    let value = if code % 2 == 0 { -(code / 2) } else { (code + 1) / 2 };
    Ok(value as i32)
}

fn strip_emulation_prevention(nal: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nal.len());
    let mut zeros = 0;
    for &byte in nal {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        if byte == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(byte);
    }
    out
}

/// Iterate Annex-B NAL units (payloads between start codes).
fn annex_b_nals(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    for (n, &start) in starts.iter().enumerate() {
        let mut end = if n + 1 < starts.len() { starts[n + 1] - 3 } else { data.len() };
        // Trim the third zero of a four-byte start code.
        while end > start && data[end - 1] == 0 {
            end -= 1;
        }
        if end > start {
            nals.push(&data[start..end]);
        }
    }
    nals
}

fn has_start_code(data: &[u8]) -> bool {
    data.windows(3).take(62).any(|w| w == [0, 0, 1])
}

/// Locate an AVC NAL of the wanted type, in Annex-B or `avcC` framing.
fn find_avc_nal(data: &[u8], nal_type: u8) -> Option<&[u8]> {
    if has_start_code(data) {
        return annex_b_nals(data)
            .into_iter()
            .find(|nal| nal[0] & 0x80 == 0 && nal[0] & 0x1f == nal_type);
    }

    // avcC: configurationVersion == 1, SPS entries at offset 6.
    if data.first() != Some(&1) || data.len() < 7 {
        return None;
    }
    let num_sps = (data[5] & 0x1f) as usize;
    let mut offset = 6;
    for _ in 0..num_sps {
        let len = u16::from_be_bytes([*data.get(offset)?, *data.get(offset + 1)?]) as usize;
        offset += 2;
        let nal = data.get(offset..offset + len)?;
        if !nal.is_empty() && nal[0] & 0x1f == nal_type {
            return Some(nal);
        }
        offset += len;
    }
    None
}

/// Locate an HEVC NAL of the wanted type, in Annex-B or `hvcC` framing.
fn find_hevc_nal(data: &[u8], nal_type: u8) -> Option<&[u8]> {
    if has_start_code(data) {
        return annex_b_nals(data)
            .into_iter()
            .find(|nal| nal.len() >= 2 && (nal[0] >> 1) & 0x3f == nal_type);
    }

    // hvcC: 23-byte header, then arrays of length-prefixed NALs.
    if data.first() != Some(&1) || data.len() < 23 {
        return None;
    }
    let num_arrays = data[22] as usize;
    let mut offset = 23;
    for _ in 0..num_arrays {
        let array_type = *data.get(offset)? & 0x3f;
        let num_nals =
            u16::from_be_bytes([*data.get(offset + 1)?, *data.get(offset + 2)?]) as usize;
        offset += 3;
        for _ in 0..num_nals {
            let len = u16::from_be_bytes([*data.get(offset)?, *data.get(offset + 1)?]) as usize;
            offset += 2;
            let nal = data.get(offset..offset + len)?;
            offset += len;
            if array_type == nal_type && nal.len() >= 2 {
                return Some(nal);
            }
        }
    }
    None
}
