//! Wire protocol: command frames, response frames, payload schemas and the
//! 2bpp raster packing the frame firmware expects.
//!
//! Commands travel on the control characteristic as `[opcode][utf8 param]`.
//! Responses come back as notifications, `[code][payload]`. There is no length
//! field or checksum; one BLE write or notification is one frame.

use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

use crate::dithering::Orientation;
use crate::error::{FrameError, Result};

/// Native panel width; the device raster is always addressed landscape.
pub const DEVICE_WIDTH: usize = 800;
/// Native panel height.
pub const DEVICE_HEIGHT: usize = 480;
/// Four 2-bit pixels per byte.
pub const PACKED_LEN: usize = DEVICE_WIDTH * DEVICE_HEIGHT * 2 / 8;
/// Bytes per bulk-data write.
pub const CHUNK_SIZE: usize = 256;
/// How long a command waits for its response.
pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    GetInfo = 0x01,
    GetImages = 0x02,
    DisplayImage = 0x03,
    NextImage = 0x04,
    PrevImage = 0x05,
    DeleteImage = 0x06,
    DeleteAll = 0x07,
    StartUpload = 0x10,
    /// Reserved. Chunks go out raw on the data characteristic, never with
    /// this prefix.
    UploadChunk = 0x11,
    FinishUpload = 0x12,
    CancelUpload = 0x13,
    GetSettings = 0x20,
    SetSlideshow = 0x21,
    SetInterval = 0x22,
    Restart = 0x30,
    SleepNow = 0x31,
}

impl Opcode {
    pub fn byte(self) -> u8 {
        self as u8
    }
}

/// Leading byte of a response notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    Ok = 0x00,
    Error = 0x01,
    Info = 0x02,
    ImageList = 0x03,
    Settings = 0x04,
    Progress = 0x05,
}

impl TryFrom<u8> for ResponseCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        Ok(match value {
            0x00 => ResponseCode::Ok,
            0x01 => ResponseCode::Error,
            0x02 => ResponseCode::Info,
            0x03 => ResponseCode::ImageList,
            0x04 => ResponseCode::Settings,
            0x05 => ResponseCode::Progress,
            other => return Err(other),
        })
    }
}

/// Builds a command frame: the opcode followed by the UTF-8 parameter, if any.
pub fn build_command(opcode: Opcode, parameter: Option<&str>) -> Vec<u8> {
    let param = parameter.map(str::as_bytes).unwrap_or_default();
    let mut out = Vec::with_capacity(1 + param.len());
    out.push(opcode.byte());
    out.extend_from_slice(param);
    out
}

/// A response notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    raw: Vec<u8>,
}

/// Parses a notification. Empty notifications are line noise and yield `None`.
pub fn parse_response(bytes: &[u8]) -> Option<ResponseFrame> {
    if bytes.is_empty() {
        return None;
    }
    Some(ResponseFrame {
        raw: bytes.to_vec(),
    })
}

impl ResponseFrame {
    pub fn code_byte(&self) -> u8 {
        self.raw[0]
    }

    pub fn code(&self) -> Option<ResponseCode> {
        ResponseCode::try_from(self.raw[0]).ok()
    }

    pub fn is(&self, code: ResponseCode) -> bool {
        self.raw[0] == code as u8
    }

    /// Everything after the code byte.
    pub fn payload(&self) -> &[u8] {
        &self.raw[1..]
    }

    /// UTF-8 payload starting at `offset` into the frame (1 skips the code).
    pub fn text_from(&self, offset: usize) -> Result<&str> {
        let bytes = self.raw.get(offset..).unwrap_or_default();
        let text = std::str::from_utf8(bytes)
            .map_err(|e| FrameError::payload(format!("payload is not UTF-8: {e}")))?;
        Ok(text.trim_end_matches('\0'))
    }

    pub fn text(&self) -> Result<&str> {
        self.text_from(1)
    }

    /// Message carried by an ERROR frame, lossily decoded.
    pub fn error_message(&self) -> String {
        let msg = String::from_utf8_lossy(self.payload());
        let msg = msg.trim_end_matches('\0').trim();
        if msg.is_empty() {
            "no reason given".to_string()
        } else {
            msg.to_string()
        }
    }

    pub fn device_info(&self) -> Result<DeviceInfo> {
        Ok(serde_json::from_str(self.text()?.trim())?)
    }

    pub fn settings(&self) -> Result<DeviceSettings> {
        Ok(serde_json::from_str(self.text()?.trim())?)
    }

    pub fn image_list(&self) -> Result<Vec<String>> {
        Ok(parse_image_list(self.text()?))
    }

    /// Upload offset from a PROGRESS frame: 24-bit big-endian at bytes 1..=3.
    /// The frame carries no total.
    pub fn progress_offset(&self) -> Result<u32> {
        match self.raw.get(1..4) {
            Some(&[b1, b2, b3]) => Ok((u32::from(b1) << 16) | (u32::from(b2) << 8) | u32::from(b3)),
            _ => Err(FrameError::payload(format!(
                "progress frame needs 3 offset bytes, got {}",
                self.raw.len() - 1
            ))),
        }
    }
}

/// Splits a newline-separated image list; blank lines are dropped.
pub fn parse_image_list(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.trim_end_matches('\r').trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Storage and geometry report from GET_INFO.
///
/// The firmware emits loosely typed JSON. Missing fields read as zero and
/// numbers may arrive quoted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceInfo {
    #[serde(alias = "total", deserialize_with = "lenient_u64")]
    pub total_bytes: u64,
    #[serde(alias = "used", deserialize_with = "lenient_u64")]
    pub used_bytes: u64,
    #[serde(alias = "free", deserialize_with = "lenient_u64")]
    pub free_bytes: u64,
    #[serde(alias = "count", alias = "images", deserialize_with = "lenient_u32")]
    pub image_count: u32,
    #[serde(alias = "max", deserialize_with = "lenient_u32")]
    pub max_images: u32,
    #[serde(deserialize_with = "lenient_u32")]
    pub width: u32,
    #[serde(deserialize_with = "lenient_u32")]
    pub height: u32,
}

/// Slideshow settings from GET_SETTINGS.
///
/// Flags may be JSON booleans, the numbers `1`/`0`, or the strings
/// `"1"`/`"0"`. Missing fields fall back to off / zero / empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceSettings {
    #[serde(alias = "slideshow", deserialize_with = "lenient_bool")]
    pub slideshow_enabled: bool,
    #[serde(alias = "interval", deserialize_with = "lenient_u32")]
    pub interval_minutes: u32,
    #[serde(alias = "random", deserialize_with = "lenient_bool")]
    pub random_order: bool,
    #[serde(alias = "current", alias = "currentImage")]
    pub current_image_name: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Loose {
    Bool(bool),
    Int(u64),
    Float(f64),
    Text(String),
}

fn lenient_bool<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<bool, D::Error> {
    match Loose::deserialize(d)? {
        Loose::Bool(b) => Ok(b),
        Loose::Int(n) => Ok(n != 0),
        Loose::Float(f) => Ok(f != 0.0),
        Loose::Text(s) => match s.trim() {
            "1" | "true" => Ok(true),
            "0" | "false" | "" => Ok(false),
            other => Err(D::Error::custom(format!("not a flag: {other:?}"))),
        },
    }
}

fn lenient_u64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u64, D::Error> {
    match Loose::deserialize(d)? {
        Loose::Int(n) => Ok(n),
        Loose::Float(f) if f >= 0.0 => Ok(f as u64),
        Loose::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("not a number: {s:?}"))),
        _ => Err(D::Error::custom("expected a non-negative number")),
    }
}

fn lenient_u32<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u32, D::Error> {
    let n = lenient_u64(d)?;
    u32::try_from(n).map_err(|_| D::Error::custom(format!("{n} out of range")))
}

/// Packs per-pixel palette codes into the panel's 2bpp raster.
///
/// `codes` is the working grid in row-major order: 800x480 for horizontal,
/// 480x800 for vertical. The output is always the 800x480 device raster,
/// four pixels per byte with the first pixel in the top two bits. Vertical
/// grids are rotated 90 degrees clockwise on the way in.
pub fn pack_codes(codes: &[u8], orientation: Orientation) -> Result<Vec<u8>> {
    if codes.len() != DEVICE_WIDTH * DEVICE_HEIGHT {
        return Err(FrameError::InvalidImage(format!(
            "expected {} codes, got {}",
            DEVICE_WIDTH * DEVICE_HEIGHT,
            codes.len()
        )));
    }
    let mut out = vec![0u8; PACKED_LEN];
    for y in 0..DEVICE_HEIGHT {
        for x in 0..DEVICE_WIDTH {
            let src = match orientation {
                Orientation::Horizontal => y * DEVICE_WIDTH + x,
                // working grid is DEVICE_HEIGHT wide
                Orientation::Vertical => x * DEVICE_HEIGHT + (DEVICE_HEIGHT - 1 - y),
            };
            let code = codes[src];
            if code > 0b11 {
                return Err(FrameError::InvalidImage(format!(
                    "code {code} does not fit in 2 bits"
                )));
            }
            let p = y * DEVICE_WIDTH + x;
            out[p / 4] |= code << ((3 - p % 4) * 2);
        }
    }
    Ok(out)
}

/// Reads a packed buffer back into device-raster codes (800x480, row-major).
pub fn unpack_codes(packed: &[u8]) -> Result<Vec<u8>> {
    if packed.len() != PACKED_LEN {
        return Err(FrameError::InvalidImage(format!(
            "packed buffer must be {PACKED_LEN} bytes, got {}",
            packed.len()
        )));
    }
    let codes = (0..DEVICE_WIDTH * DEVICE_HEIGHT)
        .map(|p| (packed[p / 4] >> ((3 - p % 4) * 2)) & 0b11)
        .collect();
    Ok(codes)
}

/// Splits data into chunks of given size.
///
/// - `data`: input bytes
/// - `chunk_size`: size of each chunk; 0 sends everything at once
///
/// Returns Vec of byte slices
pub fn chunk_data(data: &[u8], chunk_size: usize) -> Vec<&[u8]> {
    if chunk_size == 0 {
        return vec![data];
    }
    data.chunks(chunk_size).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame(bytes: &[u8]) -> ResponseFrame {
        parse_response(bytes).unwrap()
    }

    #[test]
    fn builds_bare_and_parameterised_commands() {
        assert_eq!(build_command(Opcode::GetInfo, None), vec![0x01]);
        assert_eq!(
            build_command(Opcode::StartUpload, Some("cat.bin")),
            b"\x10cat.bin".to_vec()
        );
        assert_eq!(build_command(Opcode::SetInterval, Some("15")), b"\x2215".to_vec());
        assert_eq!(build_command(Opcode::SetSlideshow, Some("0")), b"\x210".to_vec());
        // UTF-8 names pass through untouched
        assert_eq!(build_command(Opcode::DeleteImage, Some("é")), vec![0x06, 0xC3, 0xA9]);
    }

    #[test]
    fn empty_notification_is_ignored() {
        assert!(parse_response(&[]).is_none());
    }

    #[test]
    fn response_codes_round_trip_through_u8() {
        for code in 0u8..=5 {
            let parsed = ResponseCode::try_from(code).unwrap();
            assert_eq!(parsed as u8, code);
        }
        assert_eq!(ResponseCode::try_from(0x42), Err(0x42));
        assert_eq!(frame(&[0x42]).code(), None);
    }

    #[test]
    fn parses_image_list() {
        let f = frame(b"\x03beach.bin\n\nkids.bin\r\n  \ncat.bin\n");
        assert!(f.is(ResponseCode::ImageList));
        assert_eq!(f.image_list().unwrap(), vec!["beach.bin", "kids.bin", "cat.bin"]);
        assert!(frame(&[0x03]).image_list().unwrap().is_empty());
    }

    #[test]
    fn parses_device_info() {
        let mut raw = vec![0x02];
        raw.extend_from_slice(
            br#"{"totalBytes":1048576,"usedBytes":96000,"freeBytes":952576,"imageCount":2,"maxImages":20,"width":800,"height":480}"#,
        );
        let f = frame(&raw);
        let info = f.device_info().unwrap();
        assert_eq!(info.total_bytes, 1_048_576);
        assert_eq!(info.image_count, 2);
        assert_eq!(info.max_images, 20);
        assert_eq!((info.width, info.height), (800, 480));
    }

    #[test]
    fn device_info_tolerates_short_names_and_quoted_numbers() {
        let mut raw = vec![0x02];
        raw.extend_from_slice(br#"{"total":"2048","used":1024,"count":"3"}"#);
        let info = frame(&raw).device_info().unwrap();
        assert_eq!(info.total_bytes, 2048);
        assert_eq!(info.used_bytes, 1024);
        assert_eq!(info.free_bytes, 0);
        assert_eq!(info.image_count, 3);
    }

    #[test]
    fn settings_normalise_flag_encodings() {
        let mut raw = vec![0x04];
        raw.extend_from_slice(
            br#"{"slideshowEnabled":"1","intervalMinutes":30,"randomOrder":0,"currentImageName":"a.bin"}"#,
        );
        let s = frame(&raw).settings().unwrap();
        assert!(s.slideshow_enabled);
        assert!(!s.random_order);
        assert_eq!(s.interval_minutes, 30);
        assert_eq!(s.current_image_name, "a.bin");

        let mut raw = vec![0x04];
        raw.extend_from_slice(br#"{"slideshowEnabled":0,"randomOrder":"1","intervalMinutes":"5"}"#);
        let s = frame(&raw).settings().unwrap();
        assert!(!s.slideshow_enabled);
        assert!(s.random_order);
        assert_eq!(s.interval_minutes, 5);
        assert_eq!(s.current_image_name, "");
    }

    #[test]
    fn settings_reject_garbage_flags() {
        let mut raw = vec![0x04];
        raw.extend_from_slice(br#"{"slideshowEnabled":"maybe"}"#);
        assert!(frame(&raw).settings().is_err());
        assert!(frame(b"\x04not json").settings().is_err());
    }

    #[test]
    fn progress_offset_is_24_bit_big_endian() {
        assert_eq!(frame(&[0x05, 0x00, 0xBB, 0x80]).progress_offset().unwrap(), 48_000);
        assert_eq!(frame(&[0x05, 0x12, 0x34, 0x56]).progress_offset().unwrap(), 0x12_3456);
        assert!(frame(&[0x05, 0x01]).progress_offset().is_err());
    }

    #[test]
    fn text_from_honours_offset() {
        let f = frame(b"\x01\x00disk full\0");
        assert_eq!(f.text_from(2).unwrap(), "disk full");
        assert_eq!(f.text_from(99).unwrap(), "");
        assert!(frame(&[0x01, 0xFF, 0xFE]).text().is_err());
    }

    #[test]
    fn error_message_falls_back() {
        assert_eq!(frame(b"\x01no space").error_message(), "no space");
        assert_eq!(frame(&[0x01]).error_message(), "no reason given");
    }

    #[test]
    fn packed_length_is_fixed() {
        let codes = vec![0u8; DEVICE_WIDTH * DEVICE_HEIGHT];
        for orientation in [Orientation::Horizontal, Orientation::Vertical] {
            assert_eq!(pack_codes(&codes, orientation).unwrap().len(), 96_000);
        }
        assert_eq!(PACKED_LEN, 96_000);
    }

    #[test]
    fn first_pixel_occupies_high_bits() {
        let mut codes = vec![0u8; DEVICE_WIDTH * DEVICE_HEIGHT];
        codes[0] = 3;
        codes[1] = 1;
        codes[3] = 2;
        let packed = pack_codes(&codes, Orientation::Horizontal).unwrap();
        assert_eq!(packed[0], 0b11_01_00_10);
        assert!(packed[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn horizontal_round_trip() {
        let codes: Vec<u8> = (0..DEVICE_WIDTH * DEVICE_HEIGHT)
            .map(|i| ((i * 7 + i / 13) % 4) as u8)
            .collect();
        let packed = pack_codes(&codes, Orientation::Horizontal).unwrap();
        assert_eq!(unpack_codes(&packed).unwrap(), codes);
    }

    #[test]
    fn vertical_rotation_is_a_bijection() {
        // Push each working-cell index through the packer two bits at a time,
        // then rebuild which cell every device pixel was read from.
        let cells = DEVICE_WIDTH * DEVICE_HEIGHT;
        let mut source = vec![0usize; cells];
        for plane in 0..10 {
            let shift = plane * 2;
            let codes: Vec<u8> = (0..cells).map(|i| ((i >> shift) & 0b11) as u8).collect();
            let device = unpack_codes(&pack_codes(&codes, Orientation::Vertical).unwrap()).unwrap();
            for (p, &code) in device.iter().enumerate() {
                source[p] |= (code as usize) << shift;
            }
        }

        let mut seen = vec![false; cells];
        for y in 0..DEVICE_HEIGHT {
            for x in 0..DEVICE_WIDTH {
                let from = source[y * DEVICE_WIDTH + x];
                assert_eq!(from, x * DEVICE_HEIGHT + (DEVICE_HEIGHT - 1 - y), "device ({x},{y})");
                assert!(!seen[from], "cell {from} read twice");
                seen[from] = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn vertical_packing_rotates_clockwise() {
        let (w, h) = (DEVICE_HEIGHT, DEVICE_WIDTH);
        let mut codes = vec![0u8; w * h];
        // bottom-left of the portrait canvas ends up at device (799, 479)...
        codes[(h - 1) * w] = 1;
        // ...and top-left at device (0, 479)
        codes[0] = 2;
        let device = unpack_codes(&pack_codes(&codes, Orientation::Vertical).unwrap()).unwrap();
        assert_eq!(device[(DEVICE_HEIGHT - 1) * DEVICE_WIDTH + DEVICE_WIDTH - 1], 1);
        assert_eq!(device[(DEVICE_HEIGHT - 1) * DEVICE_WIDTH], 2);
        assert_eq!(device.iter().filter(|&&c| c != 0).count(), 2);
    }

    #[test]
    fn pack_rejects_misuse() {
        assert!(pack_codes(&[0u8; 10], Orientation::Horizontal).is_err());
        let mut codes = vec![0u8; DEVICE_WIDTH * DEVICE_HEIGHT];
        codes[5] = 4;
        assert!(pack_codes(&codes, Orientation::Horizontal).is_err());
        assert!(unpack_codes(&[0u8; 12]).is_err());
    }

    #[test]
    fn chunking_leaves_short_tail() {
        let data = vec![0xAAu8; 2600];
        let chunks = chunk_data(&data, CHUNK_SIZE);
        assert_eq!(chunks.len(), 11);
        assert_eq!(chunks[10].len(), 40);
        assert_eq!(chunk_data(&data, 0).len(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]
        #[test]
        fn vertical_round_trip_matches_formula(seed in any::<u64>()) {
            let (w, h) = (DEVICE_HEIGHT, DEVICE_WIDTH);
            let codes: Vec<u8> = (0..w * h)
                .map(|i| ((seed.wrapping_mul(i as u64 + 1) >> 17) & 0b11) as u8)
                .collect();
            let device = unpack_codes(&pack_codes(&codes, Orientation::Vertical).unwrap()).unwrap();
            for y in 0..DEVICE_HEIGHT {
                for x in 0..DEVICE_WIDTH {
                    let expected = codes[x * w + (DEVICE_HEIGHT - 1 - y)];
                    prop_assert_eq!(device[y * DEVICE_WIDTH + x], expected);
                }
            }
        }
    }
}
