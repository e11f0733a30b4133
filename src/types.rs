//! The geometry model stored in feature tables.
//!
//! Geometries are a closed set of shapes tagged with the ordinates every
//! coordinate carries, so an empty `LINESTRING Z` keeps its dimensionality
//! through a write and a read.

use crate::result::{Error, Result};

/// Which ordinates beyond X and Y a geometry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimensions {
    Xy,
    Xyz,
    Xym,
    Xyzm,
}

impl Dimensions {
    pub fn from_flags(has_z: bool, has_m: bool) -> Self {
        match (has_z, has_m) {
            (false, false) => Dimensions::Xy,
            (true, false) => Dimensions::Xyz,
            (false, true) => Dimensions::Xym,
            (true, true) => Dimensions::Xyzm,
        }
    }

    pub fn has_z(self) -> bool {
        matches!(self, Dimensions::Xyz | Dimensions::Xyzm)
    }

    pub fn has_m(self) -> bool {
        matches!(self, Dimensions::Xym | Dimensions::Xyzm)
    }
}

/// A single position. `z` and `m` are present exactly when the owning
/// geometry's [Dimensions] say so.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
    pub m: Option<f64>,
}

impl Coord {
    pub fn xy(x: f64, y: f64) -> Self {
        Coord {
            x,
            y,
            z: None,
            m: None,
        }
    }

    pub fn xyz(x: f64, y: f64, z: f64) -> Self {
        Coord {
            x,
            y,
            z: Some(z),
            m: None,
        }
    }

    pub fn xym(x: f64, y: f64, m: f64) -> Self {
        Coord {
            x,
            y,
            z: None,
            m: Some(m),
        }
    }

    pub fn xyzm(x: f64, y: f64, z: f64, m: f64) -> Self {
        Coord {
            x,
            y,
            z: Some(z),
            m: Some(m),
        }
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::from_flags(self.z.is_some(), self.m.is_some())
    }
}

/// Geometry type names as they appear in `gpkg_geometry_columns`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeometryType {
    Geometry,
    Point,
    LineString,
    Polygon,
    MultiPoint,
    MultiLineString,
    MultiPolygon,
    GeometryCollection,
}

impl GeometryType {
    pub fn name(self) -> &'static str {
        match self {
            GeometryType::Geometry => "GEOMETRY",
            GeometryType::Point => "POINT",
            GeometryType::LineString => "LINESTRING",
            GeometryType::Polygon => "POLYGON",
            GeometryType::MultiPoint => "MULTIPOINT",
            GeometryType::MultiLineString => "MULTILINESTRING",
            GeometryType::MultiPolygon => "MULTIPOLYGON",
            GeometryType::GeometryCollection => "GEOMETRYCOLLECTION",
        }
    }

    /// Parses a geometry type name, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        let t = match name.to_ascii_uppercase().as_str() {
            "GEOMETRY" => GeometryType::Geometry,
            "POINT" => GeometryType::Point,
            "LINESTRING" => GeometryType::LineString,
            "POLYGON" => GeometryType::Polygon,
            "MULTIPOINT" => GeometryType::MultiPoint,
            "MULTILINESTRING" => GeometryType::MultiLineString,
            "MULTIPOLYGON" => GeometryType::MultiPolygon,
            "GEOMETRYCOLLECTION" => GeometryType::GeometryCollection,
            _ => return None,
        };
        Some(t)
    }

    /// The base WKB type code, without the Z/M offset.
    pub(crate) fn wkb_code(self) -> u32 {
        match self {
            GeometryType::Geometry => 0,
            GeometryType::Point => 1,
            GeometryType::LineString => 2,
            GeometryType::Polygon => 3,
            GeometryType::MultiPoint => 4,
            GeometryType::MultiLineString => 5,
            GeometryType::MultiPolygon => 6,
            GeometryType::GeometryCollection => 7,
        }
    }

    /// Whether a column declared with this type may hold a geometry of type `other`.
    pub fn accepts(self, other: GeometryType) -> bool {
        match self {
            GeometryType::Geometry => true,
            GeometryType::GeometryCollection => matches!(
                other,
                GeometryType::GeometryCollection
                    | GeometryType::MultiPoint
                    | GeometryType::MultiLineString
                    | GeometryType::MultiPolygon
            ),
            _ => self == other,
        }
    }
}

impl std::fmt::Display for GeometryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The shape of a geometry, one arm per subtype. An empty vector (or a
/// `Point(None)`) is the empty geometry of that subtype.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Point(Option<Coord>),
    LineString(Vec<Coord>),
    Polygon(Vec<Vec<Coord>>),
    MultiPoint(Vec<Coord>),
    MultiLineString(Vec<Vec<Coord>>),
    MultiPolygon(Vec<Vec<Vec<Coord>>>),
    GeometryCollection(Vec<Geometry>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    dimensions: Dimensions,
    shape: Shape,
}

impl Geometry {
    /// Builds a geometry, checking that every coordinate (and every member of
    /// a collection) carries exactly the ordinates `dimensions` asks for.
    pub fn new(dimensions: Dimensions, shape: Shape) -> Result<Self> {
        let geom = Geometry { dimensions, shape };
        let mut mismatch = None;
        geom.for_each_coord(&mut |c| {
            if mismatch.is_none() && c.dimensions() != dimensions {
                mismatch = Some(c.dimensions());
            }
        });
        if let Shape::GeometryCollection(members) = &geom.shape {
            if let Some(m) = members.iter().find(|m| m.dimensions != dimensions) {
                mismatch = Some(m.dimensions);
            }
        }
        match mismatch {
            Some(found) => Err(Error::validation(format!(
                "{} geometry declared as {:?} contains {:?} ordinates",
                geom.geometry_type(),
                dimensions,
                found
            ))),
            None => Ok(geom),
        }
    }

    pub fn point(x: f64, y: f64) -> Self {
        Geometry {
            dimensions: Dimensions::Xy,
            shape: Shape::Point(Some(Coord::xy(x, y))),
        }
    }

    /// The empty geometry of a subtype. `GeometryType::Geometry` has no empty
    /// form of its own and yields an empty collection.
    pub fn empty(geometry_type: GeometryType, dimensions: Dimensions) -> Self {
        let shape = match geometry_type {
            GeometryType::Point => Shape::Point(None),
            GeometryType::LineString => Shape::LineString(Vec::new()),
            GeometryType::Polygon => Shape::Polygon(Vec::new()),
            GeometryType::MultiPoint => Shape::MultiPoint(Vec::new()),
            GeometryType::MultiLineString => Shape::MultiLineString(Vec::new()),
            GeometryType::MultiPolygon => Shape::MultiPolygon(Vec::new()),
            GeometryType::Geometry | GeometryType::GeometryCollection => {
                Shape::GeometryCollection(Vec::new())
            }
        };
        Geometry { dimensions, shape }
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn geometry_type(&self) -> GeometryType {
        match self.shape {
            Shape::Point(_) => GeometryType::Point,
            Shape::LineString(_) => GeometryType::LineString,
            Shape::Polygon(_) => GeometryType::Polygon,
            Shape::MultiPoint(_) => GeometryType::MultiPoint,
            Shape::MultiLineString(_) => GeometryType::MultiLineString,
            Shape::MultiPolygon(_) => GeometryType::MultiPolygon,
            Shape::GeometryCollection(_) => GeometryType::GeometryCollection,
        }
    }

    pub fn is_empty(&self) -> bool {
        let mut any = false;
        self.for_each_coord(&mut |_| any = true);
        !any
    }

    /// The bounding box over every ordinate present, `None` for empty geometries.
    pub fn envelope(&self) -> Option<Envelope> {
        let mut env: Option<Envelope> = None;
        self.for_each_coord(&mut |c| match env.as_mut() {
            Some(e) => e.expand_to_include(c),
            None => env = Some(Envelope::of_coord(c)),
        });
        env
    }

    pub(crate) fn for_each_coord(&self, f: &mut impl FnMut(&Coord)) {
        match &self.shape {
            Shape::Point(p) => p.iter().for_each(|c| f(c)),
            Shape::LineString(cs) | Shape::MultiPoint(cs) => cs.iter().for_each(|c| f(c)),
            Shape::Polygon(rings) | Shape::MultiLineString(rings) => {
                rings.iter().flatten().for_each(|c| f(c))
            }
            Shape::MultiPolygon(polys) => polys.iter().flatten().flatten().for_each(|c| f(c)),
            Shape::GeometryCollection(members) => {
                for m in members {
                    m.for_each_coord(f)
                }
            }
        }
    }
}

/// Axis aligned bounds of a geometry. X and Y are always present, Z and M
/// only when the geometry carries them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
    pub z: Option<(f64, f64)>,
    pub m: Option<(f64, f64)>,
}

impl Envelope {
    /// A two dimensional envelope, e.g. for a bounding box query.
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Envelope {
            min_x,
            max_x,
            min_y,
            max_y,
            z: None,
            m: None,
        }
    }

    fn of_coord(c: &Coord) -> Self {
        Envelope {
            min_x: c.x,
            max_x: c.x,
            min_y: c.y,
            max_y: c.y,
            z: c.z.map(|z| (z, z)),
            m: c.m.map(|m| (m, m)),
        }
    }

    fn expand_to_include(&mut self, c: &Coord) {
        self.min_x = self.min_x.min(c.x);
        self.max_x = self.max_x.max(c.x);
        self.min_y = self.min_y.min(c.y);
        self.max_y = self.max_y.max(c.y);
        if let (Some((lo, hi)), Some(z)) = (self.z.as_mut(), c.z) {
            *lo = lo.min(z);
            *hi = hi.max(z);
        }
        if let (Some((lo, hi)), Some(m)) = (self.m.as_mut(), c.m) {
            *lo = lo.min(m);
            *hi = hi.max(m);
        }
    }

    /// The smallest XY envelope covering both, Z and M are dropped.
    pub fn union_xy(&self, other: &Envelope) -> Envelope {
        Envelope::new(
            self.min_x.min(other.min_x),
            self.min_y.min(other.min_y),
            self.max_x.max(other.max_x),
            self.max_y.max(other.max_y),
        )
    }

    /// Inclusive XY intersection test, touching edges count.
    pub fn intersects(&self, other: &Envelope) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::from_flags(self.z.is_some(), self.m.is_some())
    }
}

// conversions from the geo-types model, always two dimensional

fn coords_from_geo(ls: &geo_types::LineString<f64>) -> Vec<Coord> {
    ls.0.iter().map(|c| Coord::xy(c.x, c.y)).collect()
}

fn rings_from_geo(poly: &geo_types::Polygon<f64>) -> Vec<Vec<Coord>> {
    if poly.exterior().0.is_empty() && poly.interiors().is_empty() {
        return Vec::new();
    }
    std::iter::once(poly.exterior())
        .chain(poly.interiors())
        .map(coords_from_geo)
        .collect()
}

fn xy(shape: Shape) -> Geometry {
    Geometry {
        dimensions: Dimensions::Xy,
        shape,
    }
}

impl From<geo_types::Point<f64>> for Geometry {
    fn from(p: geo_types::Point<f64>) -> Self {
        Geometry::point(p.x(), p.y())
    }
}

impl From<geo_types::LineString<f64>> for Geometry {
    fn from(ls: geo_types::LineString<f64>) -> Self {
        xy(Shape::LineString(coords_from_geo(&ls)))
    }
}

impl From<geo_types::Polygon<f64>> for Geometry {
    fn from(poly: geo_types::Polygon<f64>) -> Self {
        xy(Shape::Polygon(rings_from_geo(&poly)))
    }
}

impl From<geo_types::MultiPoint<f64>> for Geometry {
    fn from(mp: geo_types::MultiPoint<f64>) -> Self {
        xy(Shape::MultiPoint(
            mp.0.iter().map(|p| Coord::xy(p.x(), p.y())).collect(),
        ))
    }
}

impl From<geo_types::MultiLineString<f64>> for Geometry {
    fn from(mls: geo_types::MultiLineString<f64>) -> Self {
        xy(Shape::MultiLineString(
            mls.0.iter().map(coords_from_geo).collect(),
        ))
    }
}

impl From<geo_types::MultiPolygon<f64>> for Geometry {
    fn from(mp: geo_types::MultiPolygon<f64>) -> Self {
        xy(Shape::MultiPolygon(mp.0.iter().map(rings_from_geo).collect()))
    }
}

impl From<geo_types::GeometryCollection<f64>> for Geometry {
    fn from(gc: geo_types::GeometryCollection<f64>) -> Self {
        xy(Shape::GeometryCollection(
            gc.0.into_iter().map(Geometry::from).collect(),
        ))
    }
}

impl From<geo_types::Geometry<f64>> for Geometry {
    fn from(g: geo_types::Geometry<f64>) -> Self {
        match g {
            geo_types::Geometry::Point(p) => p.into(),
            geo_types::Geometry::Line(l) => {
                geo_types::LineString::from(vec![l.start, l.end]).into()
            }
            geo_types::Geometry::LineString(ls) => ls.into(),
            geo_types::Geometry::Polygon(poly) => poly.into(),
            geo_types::Geometry::MultiPoint(mp) => mp.into(),
            geo_types::Geometry::MultiLineString(mls) => mls.into(),
            geo_types::Geometry::MultiPolygon(mp) => mp.into(),
            geo_types::Geometry::GeometryCollection(gc) => gc.into(),
            geo_types::Geometry::Rect(r) => r.to_polygon().into(),
            geo_types::Geometry::Triangle(t) => t.to_polygon().into(),
        }
    }
}

fn linestring_to_geo(cs: &[Coord]) -> geo_types::LineString<f64> {
    geo_types::LineString::from(cs.iter().map(|c| (c.x, c.y)).collect::<Vec<_>>())
}

fn polygon_to_geo(rings: &[Vec<Coord>]) -> geo_types::Polygon<f64> {
    match rings.split_first() {
        Some((exterior, interiors)) => geo_types::Polygon::new(
            linestring_to_geo(exterior),
            interiors.iter().map(|r| linestring_to_geo(r)).collect(),
        ),
        None => geo_types::Polygon::new(geo_types::LineString::from(Vec::<(f64, f64)>::new()), vec![]),
    }
}

/// Projects onto XY; Z and M ordinates are dropped. geo-types has no empty
/// point, so an empty point is a validation error.
impl TryFrom<&Geometry> for geo_types::Geometry<f64> {
    type Error = Error;

    fn try_from(g: &Geometry) -> Result<Self> {
        let out = match &g.shape {
            Shape::Point(Some(c)) => geo_types::Point::new(c.x, c.y).into(),
            Shape::Point(None) => {
                return Err(Error::validation("empty points have no geo-types form"))
            }
            Shape::LineString(cs) => linestring_to_geo(cs).into(),
            Shape::Polygon(rings) => polygon_to_geo(rings).into(),
            Shape::MultiPoint(cs) => geo_types::MultiPoint::from(
                cs.iter().map(|c| (c.x, c.y)).collect::<Vec<_>>(),
            )
            .into(),
            Shape::MultiLineString(lines) => {
                geo_types::MultiLineString(lines.iter().map(|l| linestring_to_geo(l)).collect())
                    .into()
            }
            Shape::MultiPolygon(polys) => {
                geo_types::MultiPolygon(polys.iter().map(|p| polygon_to_geo(p)).collect()).into()
            }
            Shape::GeometryCollection(members) => {
                geo_types::Geometry::GeometryCollection(geo_types::GeometryCollection(
                    members
                        .iter()
                        .map(geo_types::Geometry::try_from)
                        .collect::<Result<Vec<_>>>()?,
                ))
            }
        };
        Ok(out)
    }
}
