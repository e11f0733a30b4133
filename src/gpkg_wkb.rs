//! Encoding of geometries according to the GeoPackage [specification](https://www.geopackage.org/spec130/#gpb_spec)
//!
//! A blob is a fixed header (magic, version, flags, srs id), an optional
//! envelope, and an ISO WKB body. The header byte order is declared in the
//! flags; every WKB geometry in the body declares its own.

use crate::result::{Error, Result};
use crate::types::*;
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};

// "GP" in ASCII
const MAGIC: [u8; 2] = [0x47, 0x50];
// version number, 0 means version 1
const VERSION: u8 = 0;
const HEADER_LEN: usize = 8;
// byte order + type code, the smallest possible WKB geometry prefix
const WKB_PREFIX_LEN: usize = 5;
// collections nested deeper than this are treated as hostile input
const MAX_NESTING: usize = 32;

/// Options for [encode_with]. Decoding accepts every combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct CodecOptions {
    /// Byte order for the header and every WKB geometry in the body.
    pub little_endian: bool,
    /// Whether non-empty geometries get an envelope in the header.
    pub write_envelope: bool,
}

impl Default for CodecOptions {
    fn default() -> Self {
        CodecOptions {
            little_endian: true,
            write_envelope: true,
        }
    }
}

/// The result of decoding a geometry blob.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedGeometry {
    pub geometry: Geometry,
    pub srs_id: i32,
    /// The header envelope, or one computed from the geometry when the
    /// header carried none. `None` only for empty geometries.
    pub envelope: Option<Envelope>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnvelopeType {
    Missing,
    XY,
    XYZ,
    XYM,
    XYZM,
}

impl EnvelopeType {
    fn for_dimensions(dims: Dimensions) -> Self {
        match dims {
            Dimensions::Xy => EnvelopeType::XY,
            Dimensions::Xyz => EnvelopeType::XYZ,
            Dimensions::Xym => EnvelopeType::XYM,
            Dimensions::Xyzm => EnvelopeType::XYZM,
        }
    }

    fn doubles(self) -> usize {
        match self {
            EnvelopeType::Missing => 0,
            EnvelopeType::XY => 4,
            EnvelopeType::XYZ | EnvelopeType::XYM => 6,
            EnvelopeType::XYZM => 8,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct GPKGGeomFlags {
    extended: bool,
    empty_geom: bool,
    little_endian: bool,
    envelope: EnvelopeType,
}

impl GPKGGeomFlags {
    // https://www.geopackage.org/spec130/#flags_layout
    fn from_byte(b: u8) -> Result<Self> {
        let extended = ((b >> 5) & 1) > 0;
        let empty_geom = ((b >> 4) & 1) > 0;
        let little_endian = (b & 1) > 0;
        let envelope = match (b >> 1) & 0b111 {
            0 => EnvelopeType::Missing,
            1 => EnvelopeType::XY,
            2 => EnvelopeType::XYZ,
            3 => EnvelopeType::XYM,
            4 => EnvelopeType::XYZM,
            other => {
                return Err(Error::format(format!(
                    "invalid envelope indicator {}",
                    other
                )))
            }
        };
        if extended {
            return Err(Error::format("extended GeoPackage geometries are not supported"));
        }
        Ok(GPKGGeomFlags {
            extended,
            empty_geom,
            little_endian,
            envelope,
        })
    }

    fn to_byte(self) -> u8 {
        let mut flags = 0u8;
        let envelope_val = match self.envelope {
            EnvelopeType::Missing => 0,
            EnvelopeType::XY => 1,
            EnvelopeType::XYZ => 2,
            EnvelopeType::XYM => 3,
            EnvelopeType::XYZM => 4,
        };
        flags |= (self.extended as u8) << 5;
        flags |= (self.empty_geom as u8) << 4;
        flags |= envelope_val << 1;
        flags |= self.little_endian as u8;

        flags
    }
}

/// Encodes with the default options: little endian, envelope included.
pub fn encode(geometry: &Geometry, srs_id: i32) -> Result<Vec<u8>> {
    encode_with(geometry, srs_id, &CodecOptions::default())
}

pub fn encode_with(geometry: &Geometry, srs_id: i32, options: &CodecOptions) -> Result<Vec<u8>> {
    let mut nan = false;
    geometry.for_each_coord(&mut |c| {
        nan |= c.x.is_nan() || c.y.is_nan() || c.z.map_or(false, f64::is_nan) || c.m.map_or(false, f64::is_nan)
    });
    if nan {
        // NaN is how WKB spells an empty point, it cannot be stored as a value
        return Err(Error::validation(format!(
            "{} geometry contains a NaN ordinate",
            geometry.geometry_type()
        )));
    }
    if options.little_endian {
        encode_ordered::<LittleEndian>(geometry, srs_id, options.write_envelope)
    } else {
        encode_ordered::<BigEndian>(geometry, srs_id, options.write_envelope)
    }
}

fn encode_ordered<B: ByteOrder>(
    geometry: &Geometry,
    srs_id: i32,
    write_envelope: bool,
) -> Result<Vec<u8>> {
    let envelope = match write_envelope {
        true => geometry.envelope(),
        false => None,
    };
    let flags = GPKGGeomFlags {
        extended: false,
        empty_geom: geometry.is_empty(),
        little_endian: is_little::<B>(),
        envelope: envelope
            .map(|e| EnvelopeType::for_dimensions(e.dimensions()))
            .unwrap_or(EnvelopeType::Missing),
    };
    let mut out: Vec<u8> = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.push(VERSION);
    out.push(flags.to_byte());
    out.write_i32::<B>(srs_id)?;
    if let Some(env) = envelope {
        for v in [env.min_x, env.max_x, env.min_y, env.max_y] {
            out.write_f64::<B>(v)?;
        }
        for (lo, hi) in env.z.into_iter().chain(env.m) {
            out.write_f64::<B>(lo)?;
            out.write_f64::<B>(hi)?;
        }
    }
    write_wkb::<B>(geometry, &mut out)?;
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<DecodedGeometry> {
    let header = read_header(bytes)?;
    let mut cursor = Cursor::new(&bytes[header.body_offset..]);
    let geometry = read_wkb(&mut cursor, 0)?;
    if cursor.position() as usize != bytes.len() - header.body_offset {
        return Err(Error::format("trailing bytes after the WKB geometry"));
    }
    if header.flags.empty_geom != geometry.is_empty() {
        return Err(Error::format(
            "the header empty flag disagrees with the WKB geometry",
        ));
    }
    let envelope = match header.envelope {
        Some(e) => Some(e),
        None => geometry.envelope(),
    };
    Ok(DecodedGeometry {
        geometry,
        srs_id: header.srs_id,
        envelope,
    })
}

/// Reads the envelope from the header alone. Only blobs without a header
/// envelope have their body decoded.
pub fn decode_envelope(bytes: &[u8]) -> Result<Option<Envelope>> {
    let header = read_header(bytes)?;
    if header.envelope.is_some() || header.flags.empty_geom {
        return Ok(header.envelope);
    }
    Ok(decode(bytes)?.envelope)
}

struct Header {
    flags: GPKGGeomFlags,
    srs_id: i32,
    envelope: Option<Envelope>,
    body_offset: usize,
}

fn read_header(bytes: &[u8]) -> Result<Header> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::format("geometry blob is shorter than its header"));
    }
    if bytes[0..2] != MAGIC {
        return Err(Error::format(format!(
            "bad geometry blob magic {:#04x} {:#04x}",
            bytes[0], bytes[1]
        )));
    }
    if bytes[2] != VERSION {
        return Err(Error::format(format!(
            "unsupported geometry blob version {}",
            bytes[2]
        )));
    }
    let flags = GPKGGeomFlags::from_byte(bytes[3])?;
    let envelope_len = flags.envelope.doubles() * 8;
    let body_offset = HEADER_LEN + envelope_len;
    if bytes.len() < body_offset + WKB_PREFIX_LEN {
        return Err(Error::format(format!(
            "geometry blob of {} bytes cannot hold a {} byte envelope and a geometry",
            bytes.len(),
            envelope_len
        )));
    }
    let mut r = Cursor::new(&bytes[4..body_offset]);
    match flags.little_endian {
        true => read_header_fields::<LittleEndian>(&mut r, flags, body_offset),
        false => read_header_fields::<BigEndian>(&mut r, flags, body_offset),
    }
}

fn read_header_fields<B: ByteOrder>(
    r: &mut Cursor<&[u8]>,
    flags: GPKGGeomFlags,
    body_offset: usize,
) -> Result<Header> {
    let srs_id = r.read_i32::<B>()?;
    let mut doubles = Vec::with_capacity(flags.envelope.doubles());
    for _ in 0..flags.envelope.doubles() {
        doubles.push(r.read_f64::<B>()?);
    }
    let envelope = match flags.envelope {
        // empty geometries may carry an all-NaN envelope
        EnvelopeType::Missing => None,
        _ if flags.empty_geom => None,
        t => {
            let mut env = Envelope::new(doubles[0], doubles[2], doubles[1], doubles[3]);
            let mut extra = doubles[4..].chunks(2).map(|p| (p[0], p[1]));
            match t {
                EnvelopeType::XYZ => env.z = extra.next(),
                EnvelopeType::XYM => env.m = extra.next(),
                EnvelopeType::XYZM => {
                    env.z = extra.next();
                    env.m = extra.next();
                }
                _ => {}
            }
            Some(env)
        }
    };
    Ok(Header {
        flags,
        srs_id,
        envelope,
        body_offset,
    })
}

fn is_little<B: ByteOrder>() -> bool {
    B::read_u16(&[1, 0]) == 1
}

fn type_code(geometry_type: GeometryType, dims: Dimensions) -> u32 {
    let offset = match dims {
        Dimensions::Xy => 0,
        Dimensions::Xyz => 1000,
        Dimensions::Xym => 2000,
        Dimensions::Xyzm => 3000,
    };
    geometry_type.wkb_code() + offset
}

// accepts ISO codes (1001, 2003, ...) as well as the EWKB high bit flags
fn parse_type_code(code: u32) -> Result<(GeometryType, Dimensions)> {
    if code & 0x2000_0000 != 0 {
        return Err(Error::format("EWKB geometries with an embedded SRID are not supported"));
    }
    let ewkb_z = code & 0x8000_0000 != 0;
    let ewkb_m = code & 0x4000_0000 != 0;
    let iso = code & 0x0FFF_FFFF;
    let (iso_z, iso_m) = match iso / 1000 {
        0 => (false, false),
        1 => (true, false),
        2 => (false, true),
        3 => (true, true),
        _ => return Err(Error::format(format!("unknown WKB geometry type {}", code))),
    };
    let geometry_type = match iso % 1000 {
        1 => GeometryType::Point,
        2 => GeometryType::LineString,
        3 => GeometryType::Polygon,
        4 => GeometryType::MultiPoint,
        5 => GeometryType::MultiLineString,
        6 => GeometryType::MultiPolygon,
        7 => GeometryType::GeometryCollection,
        _ => return Err(Error::format(format!("unknown WKB geometry type {}", code))),
    };
    Ok((geometry_type, Dimensions::from_flags(iso_z || ewkb_z, iso_m || ewkb_m)))
}

fn write_prefix<B: ByteOrder>(w: &mut impl Write, geometry_type: GeometryType, dims: Dimensions) -> Result<()> {
    w.write_u8(is_little::<B>() as u8)?;
    w.write_u32::<B>(type_code(geometry_type, dims))?;
    Ok(())
}

fn write_coord<B: ByteOrder>(w: &mut impl Write, c: &Coord) -> Result<()> {
    w.write_f64::<B>(c.x)?;
    w.write_f64::<B>(c.y)?;
    if let Some(z) = c.z {
        w.write_f64::<B>(z)?;
    }
    if let Some(m) = c.m {
        w.write_f64::<B>(m)?;
    }
    Ok(())
}

fn write_coords<B: ByteOrder>(w: &mut impl Write, cs: &[Coord]) -> Result<()> {
    w.write_u32::<B>(cs.len() as u32)?;
    for c in cs {
        write_coord::<B>(w, c)?;
    }
    Ok(())
}

fn write_rings<B: ByteOrder>(w: &mut impl Write, rings: &[Vec<Coord>]) -> Result<()> {
    w.write_u32::<B>(rings.len() as u32)?;
    for ring in rings {
        write_coords::<B>(w, ring)?;
    }
    Ok(())
}

fn write_wkb<B: ByteOrder>(geometry: &Geometry, w: &mut impl Write) -> Result<()> {
    let dims = geometry.dimensions();
    write_prefix::<B>(w, geometry.geometry_type(), dims)?;
    match geometry.shape() {
        Shape::Point(Some(c)) => write_coord::<B>(w, c)?,
        Shape::Point(None) => {
            // an empty point is written with every ordinate set to NaN
            let ordinates = 2 + dims.has_z() as usize + dims.has_m() as usize;
            for _ in 0..ordinates {
                w.write_f64::<B>(f64::NAN)?;
            }
        }
        Shape::LineString(cs) => write_coords::<B>(w, cs)?,
        Shape::Polygon(rings) => write_rings::<B>(w, rings)?,
        Shape::MultiPoint(cs) => {
            w.write_u32::<B>(cs.len() as u32)?;
            for c in cs {
                write_prefix::<B>(w, GeometryType::Point, dims)?;
                write_coord::<B>(w, c)?;
            }
        }
        Shape::MultiLineString(lines) => {
            w.write_u32::<B>(lines.len() as u32)?;
            for line in lines {
                write_prefix::<B>(w, GeometryType::LineString, dims)?;
                write_coords::<B>(w, line)?;
            }
        }
        Shape::MultiPolygon(polys) => {
            w.write_u32::<B>(polys.len() as u32)?;
            for poly in polys {
                write_prefix::<B>(w, GeometryType::Polygon, dims)?;
                write_rings::<B>(w, poly)?;
            }
        }
        Shape::GeometryCollection(members) => {
            w.write_u32::<B>(members.len() as u32)?;
            for member in members {
                write_wkb::<B>(member, w)?;
            }
        }
    }
    Ok(())
}

fn read_wkb(r: &mut Cursor<&[u8]>, depth: usize) -> Result<Geometry> {
    if depth > MAX_NESTING {
        return Err(Error::format("geometry collections are nested too deeply"));
    }
    // the resolution of this issue (https://github.com/rust-lang/rust/issues/83701)
    // would let us bind the byte order once instead of dispatching here
    match r.read_u8()? {
        0 => read_wkb_ordered::<BigEndian>(r, depth),
        1 => read_wkb_ordered::<LittleEndian>(r, depth),
        other => Err(Error::format(format!("invalid WKB byte order {}", other))),
    }
}

fn read_wkb_ordered<B: ByteOrder>(r: &mut Cursor<&[u8]>, depth: usize) -> Result<Geometry> {
    let (geometry_type, dims) = parse_type_code(r.read_u32::<B>()?)?;
    let shape = match geometry_type {
        GeometryType::Point => {
            let c = read_coord::<B>(r, dims)?;
            let all_nan = c.x.is_nan()
                && c.y.is_nan()
                && c.z.map_or(true, f64::is_nan)
                && c.m.map_or(true, f64::is_nan);
            Shape::Point(if all_nan { None } else { Some(c) })
        }
        GeometryType::LineString => Shape::LineString(read_coords::<B>(r, dims)?),
        GeometryType::Polygon => Shape::Polygon(read_rings::<B>(r, dims)?),
        GeometryType::MultiPoint => {
            let members = read_members::<B>(r, depth, dims, GeometryType::Point)?;
            let mut points = Vec::with_capacity(members.len());
            for m in members {
                match m.shape() {
                    Shape::Point(Some(c)) => points.push(*c),
                    _ => return Err(Error::format("empty point inside a multipoint")),
                }
            }
            Shape::MultiPoint(points)
        }
        GeometryType::MultiLineString => {
            let members = read_members::<B>(r, depth, dims, GeometryType::LineString)?;
            Shape::MultiLineString(
                members
                    .into_iter()
                    .map(|m| match m.shape() {
                        Shape::LineString(cs) => cs.clone(),
                        _ => unreachable!(),
                    })
                    .collect(),
            )
        }
        GeometryType::MultiPolygon => {
            let members = read_members::<B>(r, depth, dims, GeometryType::Polygon)?;
            Shape::MultiPolygon(
                members
                    .into_iter()
                    .map(|m| match m.shape() {
                        Shape::Polygon(rings) => rings.clone(),
                        _ => unreachable!(),
                    })
                    .collect(),
            )
        }
        GeometryType::GeometryCollection => {
            Shape::GeometryCollection(read_members::<B>(r, depth, dims, GeometryType::Geometry)?)
        }
        GeometryType::Geometry => unreachable!("parse_type_code never yields GEOMETRY"),
    };
    Geometry::new(dims, shape).map_err(|e| Error::format(e.to_string()))
}

// reads a count and checks it against the bytes left so a corrupt count
// cannot trigger a huge allocation
fn read_count<B: ByteOrder>(r: &mut Cursor<&[u8]>, min_item_len: usize) -> Result<usize> {
    let n = r.read_u32::<B>()? as usize;
    let remaining = r.get_ref().len() - r.position() as usize;
    if n.saturating_mul(min_item_len) > remaining {
        return Err(Error::format(format!(
            "WKB count {} exceeds the {} bytes left",
            n, remaining
        )));
    }
    Ok(n)
}

fn coord_len(dims: Dimensions) -> usize {
    8 * (2 + dims.has_z() as usize + dims.has_m() as usize)
}

fn read_coord<B: ByteOrder>(r: &mut Cursor<&[u8]>, dims: Dimensions) -> Result<Coord> {
    let x = r.read_f64::<B>()?;
    let y = r.read_f64::<B>()?;
    let z = match dims.has_z() {
        true => Some(r.read_f64::<B>()?),
        false => None,
    };
    let m = match dims.has_m() {
        true => Some(r.read_f64::<B>()?),
        false => None,
    };
    Ok(Coord { x, y, z, m })
}

fn read_coords<B: ByteOrder>(r: &mut Cursor<&[u8]>, dims: Dimensions) -> Result<Vec<Coord>> {
    let num_points = read_count::<B>(r, coord_len(dims))?;
    let mut out_vec = Vec::with_capacity(num_points);
    for _ in 0..num_points {
        out_vec.push(read_coord::<B>(r, dims)?);
    }
    Ok(out_vec)
}

fn read_rings<B: ByteOrder>(r: &mut Cursor<&[u8]>, dims: Dimensions) -> Result<Vec<Vec<Coord>>> {
    let num_rings = read_count::<B>(r, 4)?;
    let mut rings = Vec::with_capacity(num_rings);
    for _ in 0..num_rings {
        rings.push(read_coords::<B>(r, dims)?);
    }
    Ok(rings)
}

fn read_members<B: ByteOrder>(
    r: &mut Cursor<&[u8]>,
    depth: usize,
    dims: Dimensions,
    member_type: GeometryType,
) -> Result<Vec<Geometry>> {
    let n = read_count::<B>(r, WKB_PREFIX_LEN)?;
    let mut members = Vec::with_capacity(n);
    for _ in 0..n {
        let m = read_wkb(r, depth + 1)?;
        if !member_type.accepts(m.geometry_type()) {
            return Err(Error::format(format!(
                "{} found where a {} was expected",
                m.geometry_type(),
                member_type
            )));
        }
        if m.dimensions() != dims {
            return Err(Error::format(format!(
                "{:?} member inside a {:?} collection",
                m.dimensions(),
                dims
            )));
        }
        members.push(m);
    }
    Ok(members)
}
