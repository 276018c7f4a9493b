//! EXIF APP1 segment generation
//!
//! Produces a little-endian TIFF structure with IFD0, the Exif sub-IFD, an
//! optional GPS sub-IFD and, when a thumbnail is supplied, IFD1 pointing at
//! the embedded thumbnail JPEG.

use chrono::{DateTime, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::capture::frame::Size;
use crate::{CaptureError, Result};

/// Denominator used when converting floating point values to rationals
pub const RATIONAL_DENOMINATOR: u32 = 10_000;

/// Capture parameters carried into the image metadata
#[derive(Debug, Clone, Default)]
pub struct CaptureParams {
    pub image_size: Size,
    pub capture_time: NaiveDateTime,
    pub make: String,
    pub model: String,
    /// Clockwise rotation in degrees: 0, 90, 180 or 270
    pub orientation: u32,
    /// Seconds
    pub exposure_time: Option<f64>,
    pub f_number: Option<f32>,
    /// Millimetres
    pub focal_length: Option<f32>,
    pub iso: Option<u16>,
    pub gps: Option<GpsFix>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Metres above sea level
    pub altitude: f64,
    /// UTC seconds since the epoch
    pub timestamp: i64,
    pub processing_method: String,
}

/// Turns capture parameters and an optional thumbnail into an opaque APP1 block
pub trait MetadataEncoder: Send {
    /// Returns a complete segment: marker, length and payload
    fn encode(&mut self, params: &CaptureParams, thumbnail: Option<&[u8]>) -> Result<Vec<u8>>;
}

/// Fixed-point rational with four decimal digits
pub fn to_rational(value: f64) -> (u32, u32) {
    let scaled = (value.abs() * RATIONAL_DENOMINATOR as f64).round();
    (scaled.min(u32::MAX as f64) as u32, RATIONAL_DENOMINATOR)
}

enum Value {
    Byte(Vec<u8>),
    Ascii(String),
    Short(Vec<u16>),
    Long(Vec<u32>),
    Rational(Vec<(u32, u32)>),
    Undefined(Vec<u8>),
}

impl Value {
    fn type_code(&self) -> u16 {
        match self {
            Value::Byte(_) => 1,
            Value::Ascii(_) => 2,
            Value::Short(_) => 3,
            Value::Long(_) => 4,
            Value::Rational(_) => 5,
            Value::Undefined(_) => 7,
        }
    }

    fn count(&self) -> u32 {
        match self {
            Value::Byte(v) | Value::Undefined(v) => v.len() as u32,
            Value::Ascii(s) => s.len() as u32 + 1,
            Value::Short(v) => v.len() as u32,
            Value::Long(v) => v.len() as u32,
            Value::Rational(v) => v.len() as u32,
        }
    }

    fn bytes(&self) -> Vec<u8> {
        match self {
            Value::Byte(v) | Value::Undefined(v) => v.clone(),
            Value::Ascii(s) => {
                let mut b = s.as_bytes().to_vec();
                b.push(0);
                b
            }
            Value::Short(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Value::Long(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Value::Rational(v) => v
                .iter()
                .flat_map(|(n, d)| n.to_le_bytes().into_iter().chain(d.to_le_bytes()))
                .collect(),
        }
    }
}

struct Entry {
    tag: u16,
    value: Value,
}

fn entry(tag: u16, value: Value) -> Entry {
    Entry { tag, value }
}

struct Ifd(Vec<Entry>);

impl Ifd {
    fn new(mut entries: Vec<Entry>) -> Self {
        entries.sort_by_key(|e| e.tag);
        Ifd(entries)
    }

    /// Directory plus its out-of-line data, each payload padded to even length
    fn len(&self) -> usize {
        let data: usize = self
            .0
            .iter()
            .map(|e| e.value.bytes().len())
            .filter(|&l| l > 4)
            .map(|l| l + (l & 1))
            .sum();
        2 + self.0.len() * 12 + 4 + data
    }

    /// Appends the directory at the current end of `tiff`
    fn write(&self, tiff: &mut Vec<u8>, next: u32) {
        let base = tiff.len();
        let mut data_offset = base + 2 + self.0.len() * 12 + 4;
        let mut data = Vec::new();

        tiff.extend_from_slice(&(self.0.len() as u16).to_le_bytes());
        for e in &self.0 {
            let bytes = e.value.bytes();
            tiff.extend_from_slice(&e.tag.to_le_bytes());
            tiff.extend_from_slice(&e.value.type_code().to_le_bytes());
            tiff.extend_from_slice(&e.value.count().to_le_bytes());
            if bytes.len() <= 4 {
                let mut inline = [0u8; 4];
                inline[..bytes.len()].copy_from_slice(&bytes);
                tiff.extend_from_slice(&inline);
            } else {
                tiff.extend_from_slice(&(data_offset as u32).to_le_bytes());
                let padded = bytes.len() + (bytes.len() & 1);
                data.extend_from_slice(&bytes);
                data.resize(data.len() + padded - bytes.len(), 0);
                data_offset += padded;
            }
        }
        tiff.extend_from_slice(&next.to_le_bytes());
        tiff.extend_from_slice(&data);
    }
}

mod tag {
    pub const COMPRESSION: u16 = 0x0103;
    pub const MAKE: u16 = 0x010F;
    pub const MODEL: u16 = 0x0110;
    pub const ORIENTATION: u16 = 0x0112;
    pub const X_RESOLUTION: u16 = 0x011A;
    pub const Y_RESOLUTION: u16 = 0x011B;
    pub const RESOLUTION_UNIT: u16 = 0x0128;
    pub const DATE_TIME: u16 = 0x0132;
    pub const THUMBNAIL_OFFSET: u16 = 0x0201;
    pub const THUMBNAIL_LENGTH: u16 = 0x0202;
    pub const YCBCR_POSITIONING: u16 = 0x0213;
    pub const EXPOSURE_TIME: u16 = 0x829A;
    pub const F_NUMBER: u16 = 0x829D;
    pub const EXIF_IFD: u16 = 0x8769;
    pub const ISO: u16 = 0x8827;
    pub const GPS_IFD: u16 = 0x8825;
    pub const EXIF_VERSION: u16 = 0x9000;
    pub const DATE_TIME_ORIGINAL: u16 = 0x9003;
    pub const DATE_TIME_DIGITIZED: u16 = 0x9004;
    pub const COMPONENTS: u16 = 0x9101;
    pub const FOCAL_LENGTH: u16 = 0x920A;
    pub const FLASHPIX_VERSION: u16 = 0xA000;
    pub const COLOR_SPACE: u16 = 0xA001;
    pub const PIXEL_X: u16 = 0xA002;
    pub const PIXEL_Y: u16 = 0xA003;
    pub const GPS_VERSION: u16 = 0x0000;
    pub const GPS_LAT_REF: u16 = 0x0001;
    pub const GPS_LAT: u16 = 0x0002;
    pub const GPS_LON_REF: u16 = 0x0003;
    pub const GPS_LON: u16 = 0x0004;
    pub const GPS_ALT_REF: u16 = 0x0005;
    pub const GPS_ALT: u16 = 0x0006;
    pub const GPS_TIME: u16 = 0x0007;
    pub const GPS_METHOD: u16 = 0x001B;
    pub const GPS_DATE: u16 = 0x001D;
}

fn orientation_tag(degrees: u32) -> u16 {
    match degrees % 360 {
        90 => 6,
        180 => 3,
        270 => 8,
        _ => 1,
    }
}

fn degrees_minutes_seconds(value: f64) -> Vec<(u32, u32)> {
    let value = value.abs();
    let degrees = value.floor();
    let minutes = ((value - degrees) * 60.0).floor();
    let seconds = ((value - degrees) * 60.0 - minutes) * 60.0;
    vec![(degrees as u32, 1), (minutes as u32, 1), to_rational(seconds)]
}

fn gps_entries(fix: &GpsFix) -> Vec<Entry> {
    let mut entries = vec![
        entry(tag::GPS_VERSION, Value::Byte(vec![2, 2, 0, 0])),
        entry(
            tag::GPS_LAT_REF,
            Value::Ascii(if fix.latitude < 0.0 { "S" } else { "N" }.into()),
        ),
        entry(tag::GPS_LAT, Value::Rational(degrees_minutes_seconds(fix.latitude))),
        entry(
            tag::GPS_LON_REF,
            Value::Ascii(if fix.longitude < 0.0 { "W" } else { "E" }.into()),
        ),
        entry(tag::GPS_LON, Value::Rational(degrees_minutes_seconds(fix.longitude))),
        entry(tag::GPS_ALT_REF, Value::Byte(vec![u8::from(fix.altitude < 0.0)])),
        entry(tag::GPS_ALT, Value::Rational(vec![to_rational(fix.altitude)])),
    ];
    if let Some(utc) = DateTime::from_timestamp(fix.timestamp, 0) {
        let time = utc.time();
        entries.push(entry(
            tag::GPS_TIME,
            Value::Rational(vec![(time.hour(), 1), (time.minute(), 1), (time.second(), 1)]),
        ));
        entries.push(entry(
            tag::GPS_DATE,
            Value::Ascii(utc.format("%Y:%m:%d").to_string()),
        ));
    }
    if !fix.processing_method.is_empty() {
        let mut method = b"ASCII\0\0\0".to_vec();
        method.extend_from_slice(fix.processing_method.as_bytes());
        entries.push(entry(tag::GPS_METHOD, Value::Undefined(method)));
    }
    entries
}

fn ifd0(params: &CaptureParams, stamp: &str, exif_at: u32, gps_at: Option<u32>) -> Ifd {
    let mut entries = vec![
        entry(tag::MAKE, Value::Ascii(params.make.clone())),
        entry(tag::MODEL, Value::Ascii(params.model.clone())),
        entry(
            tag::ORIENTATION,
            Value::Short(vec![orientation_tag(params.orientation)]),
        ),
        entry(tag::X_RESOLUTION, Value::Rational(vec![(72, 1)])),
        entry(tag::Y_RESOLUTION, Value::Rational(vec![(72, 1)])),
        entry(tag::RESOLUTION_UNIT, Value::Short(vec![2])),
        entry(tag::DATE_TIME, Value::Ascii(stamp.to_owned())),
        entry(tag::YCBCR_POSITIONING, Value::Short(vec![1])),
        entry(tag::EXIF_IFD, Value::Long(vec![exif_at])),
    ];
    if let Some(at) = gps_at {
        entries.push(entry(tag::GPS_IFD, Value::Long(vec![at])));
    }
    Ifd::new(entries)
}

fn exif_ifd(params: &CaptureParams, stamp: &str) -> Ifd {
    let mut entries = vec![
        entry(tag::EXIF_VERSION, Value::Undefined(b"0220".to_vec())),
        entry(tag::DATE_TIME_ORIGINAL, Value::Ascii(stamp.to_owned())),
        entry(tag::DATE_TIME_DIGITIZED, Value::Ascii(stamp.to_owned())),
        entry(tag::COMPONENTS, Value::Undefined(vec![1, 2, 3, 0])),
        entry(tag::FLASHPIX_VERSION, Value::Undefined(b"0100".to_vec())),
        entry(tag::COLOR_SPACE, Value::Short(vec![1])),
        entry(tag::PIXEL_X, Value::Long(vec![params.image_size.width])),
        entry(tag::PIXEL_Y, Value::Long(vec![params.image_size.height])),
    ];
    if let Some(t) = params.exposure_time {
        entries.push(entry(tag::EXPOSURE_TIME, Value::Rational(vec![to_rational(t)])));
    }
    if let Some(f) = params.f_number {
        entries.push(entry(tag::F_NUMBER, Value::Rational(vec![to_rational(f as f64)])));
    }
    if let Some(f) = params.focal_length {
        entries.push(entry(
            tag::FOCAL_LENGTH,
            Value::Rational(vec![to_rational(f as f64)]),
        ));
    }
    if let Some(iso) = params.iso {
        entries.push(entry(tag::ISO, Value::Short(vec![iso])));
    }
    Ifd::new(entries)
}

fn ifd1(thumb_at: u32, thumb_len: usize) -> Ifd {
    Ifd::new(vec![
        entry(tag::COMPRESSION, Value::Short(vec![6])),
        entry(tag::X_RESOLUTION, Value::Rational(vec![(72, 1)])),
        entry(tag::Y_RESOLUTION, Value::Rational(vec![(72, 1)])),
        entry(tag::RESOLUTION_UNIT, Value::Short(vec![2])),
        entry(tag::THUMBNAIL_OFFSET, Value::Long(vec![thumb_at])),
        entry(tag::THUMBNAIL_LENGTH, Value::Long(vec![thumb_len as u32])),
    ])
}

const TIFF_HEADER_LEN: usize = 8;

/// Default [`MetadataEncoder`]
#[derive(Debug, Default)]
pub struct ExifWriter;

impl MetadataEncoder for ExifWriter {
    fn encode(&mut self, params: &CaptureParams, thumbnail: Option<&[u8]>) -> Result<Vec<u8>> {
        let stamp = params.capture_time.format("%Y:%m:%d %H:%M:%S").to_string();
        let exif = exif_ifd(params, &stamp);
        let gps = params.gps.as_ref().map(|fix| Ifd::new(gps_entries(fix)));

        // Offsets only affect inline LONG values, so sizes can be taken from
        // directories built with placeholder pointers
        let ifd0_len = ifd0(params, &stamp, 0, gps.as_ref().map(|_| 0)).len();
        let exif_at = TIFF_HEADER_LEN + ifd0_len;
        let gps_at = exif_at + exif.len();
        let ifd1_at = gps_at + gps.as_ref().map_or(0, Ifd::len);
        let ifd0 = ifd0(
            params,
            &stamp,
            exif_at as u32,
            gps.as_ref().map(|_| gps_at as u32),
        );
        let ifd1 = thumbnail.map(|thumb| {
            let thumb_at = ifd1_at + ifd1(0, thumb.len()).len();
            (ifd1(thumb_at as u32, thumb.len()), thumb)
        });

        let mut tiff = Vec::with_capacity(ifd1_at + 128 + thumbnail.map_or(0, <[u8]>::len));
        tiff.extend_from_slice(b"II");
        tiff.extend_from_slice(&42u16.to_le_bytes());
        tiff.extend_from_slice(&(TIFF_HEADER_LEN as u32).to_le_bytes());
        let next = if ifd1.is_some() { ifd1_at as u32 } else { 0 };
        ifd0.write(&mut tiff, next);
        exif.write(&mut tiff, 0);
        if let Some(gps) = &gps {
            gps.write(&mut tiff, 0);
        }
        if let Some((ifd1, thumb)) = &ifd1 {
            ifd1.write(&mut tiff, 0);
            tiff.extend_from_slice(thumb);
        }

        // Segment length counts itself, the Exif header and the TIFF body
        let segment_len = 2 + 6 + tiff.len();
        if segment_len > u16::MAX as usize {
            return Err(CaptureError::Encode(format!(
                "APP1 segment of {segment_len} bytes does not fit"
            )));
        }
        let mut app1 = Vec::with_capacity(segment_len + 2);
        app1.extend_from_slice(&[0xFF, 0xE1]);
        app1.extend_from_slice(&(segment_len as u16).to_be_bytes());
        app1.extend_from_slice(b"Exif\0\0");
        app1.extend_from_slice(&tiff);
        Ok(app1)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    const TIFF_START: usize = 10;

    fn u16_at(b: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([b[at], b[at + 1]])
    }

    fn u32_at(b: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
    }

    /// (type, count, value-or-offset) of `wanted` in the IFD at `ifd`
    fn find(tiff: &[u8], ifd: usize, wanted: u16) -> Option<(u16, u32, u32)> {
        let count = u16_at(tiff, ifd) as usize;
        (0..count).map(|i| ifd + 2 + i * 12).find_map(|e| {
            (u16_at(tiff, e) == wanted).then(|| (u16_at(tiff, e + 2), u32_at(tiff, e + 4), u32_at(tiff, e + 8)))
        })
    }

    fn params() -> CaptureParams {
        CaptureParams {
            image_size: Size::new(640, 480),
            capture_time: NaiveDate::from_ymd_opt(2024, 5, 17)
                .and_then(|d| d.and_hms_opt(13, 45, 2))
                .unwrap(),
            make: "Generic UVC webcam".into(),
            model: "Generic UVC webcam".into(),
            orientation: 90,
            focal_length: Some(3.04),
            ..CaptureParams::default()
        }
    }

    #[test]
    fn segment_carries_header_and_length() {
        let app1 = ExifWriter.encode(&params(), None).unwrap();
        assert_eq!(&app1[..2], &[0xFF, 0xE1]);
        assert_eq!(u16::from_be_bytes([app1[2], app1[3]]) as usize, app1.len() - 2);
        assert_eq!(&app1[4..TIFF_START], b"Exif\0\0");
        assert_eq!(&app1[TIFF_START..TIFF_START + 4], b"II*\0");
    }

    #[test]
    fn ifd0_points_at_make_and_exif() {
        let app1 = ExifWriter.encode(&params(), None).unwrap();
        let tiff = &app1[TIFF_START..];
        let ifd0 = u32_at(tiff, 4) as usize;

        let (kind, count, at) = find(tiff, ifd0, tag::MAKE).unwrap();
        assert_eq!(kind, 2);
        let at = at as usize;
        assert_eq!(&tiff[at..at + count as usize - 1], b"Generic UVC webcam");

        let (_, _, orientation) = find(tiff, ifd0, tag::ORIENTATION).unwrap();
        assert_eq!(orientation & 0xFFFF, 6);

        let (_, _, exif_at) = find(tiff, ifd0, tag::EXIF_IFD).unwrap();
        let (_, _, focal_at) = find(tiff, exif_at as usize, tag::FOCAL_LENGTH).unwrap();
        let focal_at = focal_at as usize;
        assert_eq!(u32_at(tiff, focal_at), 30_400);
        assert_eq!(u32_at(tiff, focal_at + 4), RATIONAL_DENOMINATOR);
    }

    #[test]
    fn thumbnail_is_addressed_by_ifd1() {
        let thumb = [0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9];
        let app1 = ExifWriter.encode(&params(), Some(&thumb)).unwrap();
        let tiff = &app1[TIFF_START..];
        let ifd0 = u32_at(tiff, 4) as usize;
        let count = u16_at(tiff, ifd0) as usize;
        let ifd1 = u32_at(tiff, ifd0 + 2 + count * 12) as usize;
        assert_ne!(ifd1, 0);

        let (_, _, at) = find(tiff, ifd1, tag::THUMBNAIL_OFFSET).unwrap();
        let (_, _, len) = find(tiff, ifd1, tag::THUMBNAIL_LENGTH).unwrap();
        let at = at as usize;
        assert_eq!(&tiff[at..at + len as usize], &thumb);
    }

    #[test]
    fn gps_fix_adds_sub_ifd() {
        let mut p = params();
        p.gps = Some(GpsFix {
            latitude: -33.8568,
            longitude: 151.2153,
            altitude: 12.5,
            timestamp: 1_715_953_502,
            processing_method: "GPS".into(),
        });
        let app1 = ExifWriter.encode(&p, None).unwrap();
        let tiff = &app1[TIFF_START..];
        let ifd0 = u32_at(tiff, 4) as usize;
        let (_, _, gps_at) = find(tiff, ifd0, tag::GPS_IFD).unwrap();
        let (_, _, lat_ref) = find(tiff, gps_at as usize, tag::GPS_LAT_REF).unwrap();
        assert_eq!(lat_ref & 0xFF, b'S' as u32);
        assert!(find(tiff, gps_at as usize, tag::GPS_DATE).is_some());
    }

    #[test]
    fn rationals_keep_four_decimals() {
        assert_eq!(to_rational(0.03333), (333, 10_000));
        assert_eq!(to_rational(2.0), (20_000, 10_000));
    }

    #[test]
    fn oversized_thumbnail_is_rejected() {
        let thumb = vec![0u8; 70 * 1024];
        assert!(matches!(
            ExifWriter.encode(&params(), Some(&thumb)),
            Err(CaptureError::Encode(_))
        ));
    }
}
