use std::collections::HashMap;
use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::convention::PLY;
use crate::error::{DataError, FormatError, SplatResult};
use crate::math::{clamp_u8, sigmoid, Vec3};
use crate::splat::{SplatBuffer, SplatRecord};

pub const HEADER_CHUNK_SIZE: usize = 50;
pub const MAX_HEADER_BYTES: usize = 64 * 1024;
pub const SH_C0: f32 = 0.282_094_8;

const END_HEADER: &[u8] = b"end_header";
const DEFAULT_SCALE: Vec3 = Vec3::new(0.01, 0.01, 0.01);
const DEFAULT_COLOR: [u8; 3] = [255, 0, 0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlyType {
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Float,
    Double,
}

impl PlyType {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "char" | "int8" => Some(Self::Char),
            "uchar" | "uint8" => Some(Self::UChar),
            "short" | "int16" => Some(Self::Short),
            "ushort" | "uint16" => Some(Self::UShort),
            "int" | "int32" => Some(Self::Int),
            "uint" | "uint32" => Some(Self::UInt),
            "float" | "float32" => Some(Self::Float),
            "double" | "float64" => Some(Self::Double),
            _ => None,
        }
    }

    pub fn size(self) -> usize {
        match self {
            Self::Char | Self::UChar => 1,
            Self::Short | Self::UShort => 2,
            Self::Int | Self::UInt | Self::Float => 4,
            Self::Double => 8,
        }
    }

    fn read_as_f32(self, bytes: &[u8]) -> f32 {
        match self {
            Self::Char => i8::from_le_bytes([bytes[0]]) as f32,
            Self::UChar => bytes[0] as f32,
            Self::Short => i16::from_le_bytes([bytes[0], bytes[1]]) as f32,
            Self::UShort => u16::from_le_bytes([bytes[0], bytes[1]]) as f32,
            Self::Int => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32,
            Self::UInt => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32,
            Self::Float => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            Self::Double => {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&bytes[0..8]);
                f64::from_le_bytes(arr) as f32
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Field {
    offset: usize,
    ty: PlyType,
}

impl Field {
    fn read(self, row: &[u8]) -> f32 {
        self.ty.read_as_f32(&row[self.offset..self.offset + self.ty.size()])
    }
}

/// Parsed vertex element of a PLY header.
#[derive(Debug, Clone)]
pub struct PlyHeader {
    pub vertex_count: usize,
    pub stride: usize,
    /// Byte offset of the first vertex row.
    pub data_offset: usize,
    pub sh_rest_coefficients: usize,
    fields: HashMap<String, Field>,
}

impl PlyHeader {
    /// Spherical-harmonics degree implied by the `f_rest_*` count, if exact.
    pub fn sh_degree(&self) -> Option<u32> {
        if self.sh_rest_coefficients % 3 != 0 {
            return None;
        }
        let per_channel = self.sh_rest_coefficients / 3;
        (0..=4u32).find(|d| ((d + 1) * (d + 1) - 1) as usize == per_channel)
    }

    fn field(&self, name: &str) -> Option<Field> {
        self.fields.get(name).copied()
    }
}

/// Finds the end of the header by scanning `data` in fixed-size chunks.
/// Returns the offset of the first vertex byte.
fn find_header_end(data: &[u8]) -> SplatResult<usize> {
    let mut scanned = 0usize;
    loop {
        let next = (scanned + HEADER_CHUNK_SIZE).min(data.len()).min(MAX_HEADER_BYTES);
        if next == scanned {
            return Err(FormatError::MissingEndHeader { scanned }.into());
        }
        scanned = next;
        // Re-scan the tail of the previous chunk so a marker split across chunks is found.
        let from = scanned.saturating_sub(HEADER_CHUNK_SIZE + END_HEADER.len() + 1);
        if let Some(end) = find_end_header_line(data, from, scanned) {
            return Ok(end);
        }
    }
}

fn find_end_header_line(data: &[u8], from: usize, to: usize) -> Option<usize> {
    let window = &data[from..to];
    let mut search = 0;
    while let Some(pos) = window[search..]
        .windows(END_HEADER.len())
        .position(|w| w == END_HEADER)
    {
        let start = from + search + pos;
        search += pos + 1;
        let at_line_start = start == 0 || data[start - 1] == b'\n';
        let mut end = start + END_HEADER.len();
        if data.get(end) == Some(&b'\r') {
            end += 1;
        }
        if at_line_start && data.get(end) == Some(&b'\n') {
            return Some(end + 1);
        }
    }
    None
}

pub fn parse_header(data: &[u8]) -> SplatResult<PlyHeader> {
    let data_offset = find_header_end(data)?;
    let header_text = std::str::from_utf8(&data[..data_offset])
        .map_err(|e| FormatError::InvalidHeader(format!("header is not UTF-8: {e}")))?;

    let mut encoding: Option<String> = None;
    let mut vertex_count: Option<usize> = None;
    let mut in_vertex_element = false;
    let mut fields = HashMap::new();
    let mut stride = 0usize;
    let mut sh_rest_coefficients = 0usize;

    for line in header_text.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(keyword) = parts.first() else {
            continue;
        };
        match *keyword {
            "ply" | "comment" | "obj_info" | "end_header" => {}
            "format" => {
                encoding = parts.get(1).map(|s| s.to_string());
            }
            "element" => {
                if parts.len() < 3 {
                    return Err(FormatError::InvalidHeader(format!("malformed line '{line}'")).into());
                }
                if in_vertex_element {
                    // Only the vertex element is read; anything after it lies past the rows.
                    in_vertex_element = false;
                    continue;
                }
                if parts[1] == "vertex" {
                    let count = parts[2].parse::<usize>().map_err(|_| {
                        FormatError::InvalidHeader(format!("bad vertex count '{}'", parts[2]))
                    })?;
                    vertex_count = Some(count);
                    in_vertex_element = true;
                } else if vertex_count.is_none() {
                    return Err(FormatError::InvalidHeader(format!(
                        "element '{}' precedes the vertex element",
                        parts[1]
                    ))
                    .into());
                }
            }
            "property" if in_vertex_element => {
                if parts.get(1) == Some(&"list") {
                    return Err(FormatError::InvalidHeader(
                        "list properties in vertex element are unsupported".to_string(),
                    )
                    .into());
                }
                if parts.len() < 3 {
                    return Err(FormatError::InvalidHeader(format!("malformed line '{line}'")).into());
                }
                let ty = PlyType::parse(parts[1])
                    .ok_or_else(|| FormatError::UnsupportedPropertyType(parts[1].to_string()))?;
                let name = parts[2];
                if name.starts_with("f_rest_") {
                    sh_rest_coefficients += 1;
                }
                fields.insert(name.to_string(), Field { offset: stride, ty });
                stride += ty.size();
            }
            "property" => {}
            other => {
                return Err(FormatError::InvalidHeader(format!("unknown keyword '{other}'")).into());
            }
        }
    }

    match encoding.as_deref() {
        Some("binary_little_endian") => {}
        Some(other) => return Err(FormatError::UnsupportedEncoding(other.to_string()).into()),
        None => return Err(FormatError::InvalidHeader("missing format line".to_string()).into()),
    }
    let vertex_count = vertex_count
        .ok_or_else(|| FormatError::InvalidHeader("missing vertex element".to_string()))?;
    if vertex_count == 0 {
        return Err(DataError::Empty.into());
    }
    if stride == 0 {
        return Err(FormatError::InvalidHeader("vertex element has no properties".to_string()).into());
    }

    Ok(PlyHeader {
        vertex_count,
        stride,
        data_offset,
        sh_rest_coefficients,
        fields,
    })
}

/// Named fields the decoder reads from every row.
#[derive(Debug, Clone, Copy)]
struct RowFields {
    position: [Option<Field>; 3],
    scale: Option<[Field; 3]>,
    rotation: Option<[Field; 4]>,
    dc: Option<[Field; 3]>,
    rgb: Option<[Field; 3]>,
    opacity: Option<Field>,
}

fn all_of<const N: usize>(header: &PlyHeader, names: [&str; N]) -> Option<[Field; N]> {
    let mut out = [Field { offset: 0, ty: PlyType::Float }; N];
    for (slot, name) in out.iter_mut().zip(names) {
        *slot = header.field(name)?;
    }
    Some(out)
}

impl RowFields {
    fn resolve(header: &PlyHeader) -> Self {
        Self {
            position: [header.field("x"), header.field("y"), header.field("z")],
            scale: all_of(header, ["scale_0", "scale_1", "scale_2"]),
            rotation: all_of(header, ["rot_0", "rot_1", "rot_2", "rot_3"]),
            dc: all_of(header, ["f_dc_0", "f_dc_1", "f_dc_2"]),
            rgb: all_of(header, ["red", "green", "blue"]),
            opacity: header.field("opacity"),
        }
    }

    /// Volume times opacity; 0 without scale properties.
    fn importance(&self, row: &[u8]) -> f32 {
        let Some(scale) = self.scale else {
            return 0.0;
        };
        let size = scale.iter().map(|f| f.read(row).exp()).product::<f32>();
        let opacity = self.opacity.map_or(1.0, |f| sigmoid(f.read(row)));
        let score = size * opacity;
        if score.is_nan() {
            0.0
        } else {
            score
        }
    }

    fn decode(&self, row: &[u8]) -> SplatRecord {
        let [px, py, pz] = self.position.map(|f| f.map_or(0.0, |f| f.read(row)));
        let scale = match self.scale {
            Some([s0, s1, s2]) => Vec3::new(s0.read(row).exp(), s1.read(row).exp(), s2.read(row).exp()),
            None => DEFAULT_SCALE,
        };
        let rotation = match self.rotation {
            Some(fields) => PLY.apply_rotation(fields.map(|f| f.read(row))),
            None => [1.0, 0.0, 0.0, 0.0],
        };
        let rgb = if let Some(dc) = self.dc {
            dc.map(|f| clamp_u8((0.5 + SH_C0 * f.read(row)) * 255.0))
        } else if let Some(rgb) = self.rgb {
            rgb.map(|f| match f.ty {
                PlyType::Float | PlyType::Double => clamp_u8(f.read(row) * 255.0),
                _ => clamp_u8(f.read(row)),
            })
        } else {
            DEFAULT_COLOR
        };
        let alpha = self
            .opacity
            .map_or(255, |f| clamp_u8(sigmoid(f.read(row)) * 255.0));

        SplatRecord {
            center: PLY.apply_position(Vec3::new(px, py, pz)),
            scale,
            rotation,
            color: [rgb[0], rgb[1], rgb[2], alpha],
        }
    }
}

pub fn decode_ply_bytes(data: &[u8]) -> SplatResult<SplatBuffer> {
    let started = Instant::now();
    let header = parse_header(data)?;

    let needed = header
        .vertex_count
        .checked_mul(header.stride)
        .and_then(|vertex_bytes| header.data_offset.checked_add(vertex_bytes))
        .ok_or_else(|| FormatError::InvalidHeader("vertex block size overflows".to_string()))?;
    if data.len() < needed {
        return Err(DataError::Truncated {
            needed,
            have: data.len(),
        }
        .into());
    }
    let rows = &data[header.data_offset..needed];

    match header.sh_degree() {
        Some(degree) => debug!(
            degree,
            coefficients = header.sh_rest_coefficients,
            "detected spherical harmonics, decoding DC term only"
        ),
        None => debug!(
            coefficients = header.sh_rest_coefficients,
            "f_rest count does not match a spherical harmonics degree"
        ),
    }

    let fields = RowFields::resolve(&header);

    let importance_started = Instant::now();
    let scores: Vec<f32> = rows
        .par_chunks_exact(header.stride)
        .map(|row| fields.importance(row))
        .collect();
    let mut order: Vec<usize> = (0..header.vertex_count).collect();
    if fields.scale.is_some() {
        order.par_sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    }
    debug!(elapsed = ?importance_started.elapsed(), "importance reorder");

    let records: Vec<SplatRecord> = order
        .par_iter()
        .map(|&row| {
            let start = row * header.stride;
            fields.decode(&rows[start..start + header.stride])
        })
        .collect();

    let buffer = SplatBuffer::from_records(&records)?;
    info!(
        vertices = header.vertex_count,
        stride = header.stride,
        elapsed = ?started.elapsed(),
        "PLY decoded"
    );
    Ok(buffer)
}
