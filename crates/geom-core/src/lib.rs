use nalgebra::{Matrix3, SymmetricEigen, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Vec3 = Vector3<f64>;

/// Minimum separation below which two axis endpoints count as coincident.
pub const MIN_AXIS_LENGTH: f64 = 1e-9;

#[derive(Debug, Error, PartialEq)]
pub enum GeomError {
    #[error("radius must be non-negative, got {0}")]
    NegativeRadius(f64),
    #[error("axis endpoints coincide (height below {MIN_AXIS_LENGTH})")]
    DegenerateAxis,
    #[error("normal vector has zero length")]
    ZeroNormal,
}

/// The shape family a fit request targets, or that a result reports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeatureType {
    Any,
    Plane,
    Sphere,
    Cylinder,
    Cone,
    Torus,
}

impl FeatureType {
    /// The concrete families tried when the target is `Any`.
    pub const CONCRETE: [FeatureType; 5] = [
        FeatureType::Plane,
        FeatureType::Sphere,
        FeatureType::Cylinder,
        FeatureType::Cone,
        FeatureType::Torus,
    ];

    /// Tie-break rank for equal-RMS candidates: lower wins.
    pub fn priority(self) -> u8 {
        match self {
            FeatureType::Plane => 0,
            FeatureType::Sphere => 1,
            FeatureType::Cylinder => 2,
            FeatureType::Cone => 3,
            FeatureType::Torus => 4,
            FeatureType::Any => u8::MAX,
        }
    }
}

// --- Shapes ---------------------------------------------------------------

/// A bounded planar patch given by its four corners, wound so that
/// `(lower_right - lower_left) x (upper_left - lower_left)` points along the
/// patch normal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plane {
    pub lower_left: Vec3,
    pub lower_right: Vec3,
    pub upper_right: Vec3,
    pub upper_left: Vec3,
}

impl Plane {
    pub fn new(lower_left: Vec3, lower_right: Vec3, upper_right: Vec3, upper_left: Vec3) -> Self {
        Self {
            lower_left,
            lower_right,
            upper_right,
            upper_left,
        }
    }

    /// Builds the corner quad from a center, an in-plane basis and half extents.
    pub fn from_frame(center: Vec3, u: Vec3, v: Vec3, half_u: f64, half_v: f64) -> Self {
        Self {
            lower_left: center - u * half_u - v * half_v,
            lower_right: center + u * half_u - v * half_v,
            upper_right: center + u * half_u + v * half_v,
            upper_left: center - u * half_u + v * half_v,
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.lower_left + self.lower_right + self.upper_right + self.upper_left) / 4.0
    }

    pub fn normal(&self) -> Vec3 {
        let e0 = self.lower_right - self.lower_left;
        let e1 = self.upper_left - self.lower_left;
        let n = e0.cross(&e1);
        let len = n.norm();
        if len < MIN_AXIS_LENGTH {
            Vec3::z()
        } else {
            n / len
        }
    }

    pub fn distance_to(&self, p: &Vec3) -> f64 {
        (p - self.center()).dot(&self.normal()).abs()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sphere {
    pub center: Vec3,
    pub radius: f64,
}

impl Sphere {
    pub fn new(center: Vec3, radius: f64) -> Result<Self, GeomError> {
        if radius < 0.0 {
            return Err(GeomError::NegativeRadius(radius));
        }
        Ok(Self { center, radius })
    }

    pub fn distance_to(&self, p: &Vec3) -> f64 {
        ((p - self.center).norm() - self.radius).abs()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cylinder {
    pub bottom: Vec3,
    pub top: Vec3,
    pub radius: f64,
}

impl Cylinder {
    pub fn new(bottom: Vec3, top: Vec3, radius: f64) -> Result<Self, GeomError> {
        if radius < 0.0 {
            return Err(GeomError::NegativeRadius(radius));
        }
        if (top - bottom).norm() < MIN_AXIS_LENGTH {
            return Err(GeomError::DegenerateAxis);
        }
        Ok(Self {
            bottom,
            top,
            radius,
        })
    }

    /// Unit axis pointing from `bottom` to `top`.
    pub fn axis(&self) -> Vec3 {
        (self.top - self.bottom).normalize()
    }

    pub fn center(&self) -> Vec3 {
        (self.bottom + self.top) / 2.0
    }

    pub fn height(&self) -> f64 {
        (self.top - self.bottom).norm()
    }

    pub fn distance_to(&self, p: &Vec3) -> f64 {
        let axis = self.axis();
        let v = p - self.bottom;
        let radial = v - axis * v.dot(&axis);
        (radial.norm() - self.radius).abs()
    }
}

/// A conical frustum. Construction flips the axis when needed so that
/// `bottom_radius >= top_radius`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cone {
    pub bottom: Vec3,
    pub top: Vec3,
    pub bottom_radius: f64,
    pub top_radius: f64,
}

impl Cone {
    pub fn new(
        bottom: Vec3,
        top: Vec3,
        bottom_radius: f64,
        top_radius: f64,
    ) -> Result<Self, GeomError> {
        if bottom_radius < 0.0 {
            return Err(GeomError::NegativeRadius(bottom_radius));
        }
        if top_radius < 0.0 {
            return Err(GeomError::NegativeRadius(top_radius));
        }
        if (top - bottom).norm() < MIN_AXIS_LENGTH {
            return Err(GeomError::DegenerateAxis);
        }
        let (bottom, top, bottom_radius, top_radius) = if bottom_radius >= top_radius {
            (bottom, top, bottom_radius, top_radius)
        } else {
            (top, bottom, top_radius, bottom_radius)
        };
        Ok(Self {
            bottom,
            top,
            bottom_radius,
            top_radius,
        })
    }

    /// Unit axis pointing from `bottom` (wider end) to `top`.
    pub fn axis(&self) -> Vec3 {
        (self.top - self.bottom).normalize()
    }

    pub fn center(&self) -> Vec3 {
        (self.bottom + self.top) / 2.0
    }

    pub fn height(&self) -> f64 {
        (self.top - self.bottom).norm()
    }

    /// Half-angle of the lateral surface against the axis, in radians.
    pub fn half_angle(&self) -> f64 {
        ((self.bottom_radius - self.top_radius) / self.height()).atan()
    }

    /// Perpendicular distance to the lateral surface: the distance in axial
    /// coordinates `(t, rho)` to the slant line from `(0, bottom_radius)` to
    /// `(height, top_radius)`.
    pub fn distance_to(&self, p: &Vec3) -> f64 {
        let axis = self.axis();
        let v = p - self.bottom;
        let t = v.dot(&axis);
        let rho = (v - axis * t).norm();
        let h = self.height();
        let dr = self.bottom_radius - self.top_radius;
        let slant = (h * h + dr * dr).sqrt();
        (t * dr + (rho - self.bottom_radius) * h).abs() / slant
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Torus {
    pub center: Vec3,
    pub normal: Vec3,
    pub mean_radius: f64,
    pub tube_radius: f64,
}

impl Torus {
    pub fn new(
        center: Vec3,
        normal: Vec3,
        mean_radius: f64,
        tube_radius: f64,
    ) -> Result<Self, GeomError> {
        if mean_radius < 0.0 {
            return Err(GeomError::NegativeRadius(mean_radius));
        }
        if tube_radius < 0.0 {
            return Err(GeomError::NegativeRadius(tube_radius));
        }
        let len = normal.norm();
        if len < MIN_AXIS_LENGTH {
            return Err(GeomError::ZeroNormal);
        }
        Ok(Self {
            center,
            normal: normal / len,
            mean_radius,
            tube_radius,
        })
    }

    pub fn distance_to(&self, p: &Vec3) -> f64 {
        let v = p - self.center;
        let z = v.dot(&self.normal);
        let rho = (v - self.normal * z).norm();
        let ring = ((rho - self.mean_radius).powi(2) + z * z).sqrt();
        (ring - self.tube_radius).abs()
    }
}

/// The closed sum over the five shape families.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Primitive {
    Plane(Plane),
    Sphere(Sphere),
    Cylinder(Cylinder),
    Cone(Cone),
    Torus(Torus),
}

impl Primitive {
    pub fn feature_type(&self) -> FeatureType {
        match self {
            Primitive::Plane(_) => FeatureType::Plane,
            Primitive::Sphere(_) => FeatureType::Sphere,
            Primitive::Cylinder(_) => FeatureType::Cylinder,
            Primitive::Cone(_) => FeatureType::Cone,
            Primitive::Torus(_) => FeatureType::Torus,
        }
    }

    /// Unsigned perpendicular distance from `p` to the surface.
    pub fn distance_to(&self, p: &Vec3) -> f64 {
        match self {
            Primitive::Plane(s) => s.distance_to(p),
            Primitive::Sphere(s) => s.distance_to(p),
            Primitive::Cylinder(s) => s.distance_to(p),
            Primitive::Cone(s) => s.distance_to(p),
            Primitive::Torus(s) => s.distance_to(p),
        }
    }
}

// --- Point statistics -----------------------------------------------------

pub fn centroid(points: &[Vec3]) -> Vec3 {
    if points.is_empty() {
        return Vec3::zeros();
    }
    points.iter().fold(Vec3::zeros(), |acc, p| acc + p) / points.len() as f64
}

pub fn covariance(points: &[Vec3], centroid: &Vec3) -> Matrix3<f64> {
    let mut cov = Matrix3::zeros();
    for p in points {
        let v = p - centroid;
        cov += v * v.transpose();
    }
    cov
}

/// Eigen decomposition of a covariance matrix with eigenvalues sorted
/// ascending, so that `vectors[0]` spans the thinnest direction.
pub struct PrincipalAxes {
    pub values: [f64; 3],
    pub vectors: [Vec3; 3],
}

pub fn principal_axes(cov: &Matrix3<f64>) -> PrincipalAxes {
    let eigen = SymmetricEigen::new(*cov);
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[a]
            .partial_cmp(&eigen.eigenvalues[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let value = |i: usize| eigen.eigenvalues[order[i]];
    let vector = |i: usize| {
        let col = eigen.eigenvectors.column(order[i]);
        Vec3::new(col[0], col[1], col[2])
    };
    PrincipalAxes {
        values: [value(0), value(1), value(2)],
        vectors: [vector(0), vector(1), vector(2)],
    }
}

/// An orthonormal pair spanning the plane perpendicular to `n` (unit length).
pub fn orthonormal_basis(n: &Vec3) -> (Vec3, Vec3) {
    let pick = if n.x.abs() < 0.9 { Vec3::x() } else { Vec3::y() };
    let u = n.cross(&pick).normalize();
    let v = n.cross(&u);
    (u, v)
}
