use cloud_index::{CloudError, PointBuffer, VoxelGrid};
use fit::{estimate, min_support, Estimate, EstimateError};
use geom_core::{Cylinder, FeatureType, Primitive, Sphere, Vec3};
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Residual tolerance is this multiple of the configured measurement
/// accuracy, both while growing and when classifying inliers.
const TOLERANCE_FACTOR: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    OutOfMemory,
    InvalidOperation,
    InvalidValue,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Error::InvalidOperation(_) => ErrorKind::InvalidOperation,
            Error::InvalidValue(_) => ErrorKind::InvalidValue,
        }
    }
}

impl From<CloudError> for Error {
    fn from(err: CloudError) -> Self {
        match err {
            CloudError::OutOfMemory(_) => Error::OutOfMemory(err.to_string()),
            _ => Error::InvalidValue(err.to_string()),
        }
    }
}

// --- Configuration --------------------------------------------------------

/// Growth aggressiveness on one axis of the search: 0 disables growth along
/// that axis entirely, 10 is the most radical setting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SearchLevel(u8);

impl SearchLevel {
    pub const OFF: SearchLevel = SearchLevel(0);
    pub const DEFAULT: SearchLevel = SearchLevel(5);
    pub const RADICAL: SearchLevel = SearchLevel(10);

    pub fn new(level: u8) -> Result<Self, Error> {
        if level > 10 {
            return Err(Error::InvalidValue(format!(
                "search level must be 0..=10, got {level}"
            )));
        }
        Ok(SearchLevel(level))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn is_off(self) -> bool {
        self.0 == 0
    }
}

/// Independently toggleable post-fit substitutions of a near-degenerate
/// primitive by its simpler equivalent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversionOptions {
    pub cone_to_cylinder: bool,
    pub torus_to_sphere: bool,
    pub torus_to_cylinder: bool,
}

impl ConversionOptions {
    pub fn all() -> Self {
        Self {
            cone_to_cylinder: true,
            torus_to_sphere: true,
            torus_to_cylinder: true,
        }
    }
}

/// Session-wide parameters; persist across fit calls until changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub radial_expansion: SearchLevel,
    pub lateral_extension: SearchLevel,
    pub measurement_accuracy: f64,
    pub mean_distance: f64,
    pub conversions: ConversionOptions,
}

impl Config {
    pub fn new(measurement_accuracy: f64, mean_distance: f64) -> Result<Self, Error> {
        let config = Self {
            radial_expansion: SearchLevel::DEFAULT,
            lateral_extension: SearchLevel::DEFAULT,
            measurement_accuracy,
            mean_distance,
            conversions: ConversionOptions::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !(self.measurement_accuracy > 0.0) || !self.measurement_accuracy.is_finite() {
            return Err(Error::InvalidValue(format!(
                "measurement accuracy must be positive, got {}",
                self.measurement_accuracy
            )));
        }
        if !(self.mean_distance > 0.0) || !self.mean_distance.is_finite() {
            return Err(Error::InvalidValue(format!(
                "mean distance must be positive, got {}",
                self.mean_distance
            )));
        }
        Ok(())
    }

    fn tolerance(&self) -> f64 {
        TOLERANCE_FACTOR * self.measurement_accuracy
    }
}

// --- Results --------------------------------------------------------------

/// Boolean-per-point classification over the whole cloud, with the counts
/// cached at construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InlierFlags {
    flags: Vec<bool>,
    inlier_count: usize,
    outlier_count: usize,
}

impl InlierFlags {
    fn new(flags: Vec<bool>) -> Self {
        let inlier_count = flags.iter().filter(|&&f| f).count();
        let outlier_count = flags.len() - inlier_count;
        Self {
            flags,
            inlier_count,
            outlier_count,
        }
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn is_inlier(&self, index: usize) -> bool {
        self.flags[index]
    }

    pub fn is_outlier(&self, index: usize) -> bool {
        !self.flags[index]
    }

    pub fn inlier_count(&self) -> usize {
        self.inlier_count
    }

    pub fn outlier_count(&self) -> usize {
        self.outlier_count
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FitResult {
    pub primitive: Primitive,
    pub rms_error: f64,
    pub inlier_flags: Option<InlierFlags>,
}

// --- Session --------------------------------------------------------------

struct Cloud {
    points: Vec<Vec3>,
    index: VoxelGrid,
    extent: f64,
}

/// One fitting context: configuration plus the currently assigned cloud.
/// Sequential use per session; callers needing concurrency construct
/// independent sessions.
pub struct Session {
    config: Config,
    cloud: Option<Cloud>,
}

impl Session {
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            config,
            cloud: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn set_measurement_accuracy(&mut self, accuracy: f64) -> Result<(), Error> {
        let mut next = self.config.clone();
        next.measurement_accuracy = accuracy;
        next.validate()?;
        self.config = next;
        Ok(())
    }

    pub fn set_mean_distance(&mut self, distance: f64) -> Result<(), Error> {
        let mut next = self.config.clone();
        next.mean_distance = distance;
        next.validate()?;
        self.config = next;
        Ok(())
    }

    pub fn set_radial_expansion(&mut self, level: SearchLevel) {
        self.config.radial_expansion = level;
    }

    pub fn set_lateral_extension(&mut self, level: SearchLevel) {
        self.config.lateral_extension = level;
    }

    pub fn set_conversions(&mut self, options: ConversionOptions) {
        self.config.conversions = options;
    }

    /// Validates and copies a caller-owned buffer, then rebuilds the spatial
    /// index. Any previously assigned cloud is dropped.
    pub fn set_point_cloud(&mut self, buffer: &PointBuffer) -> Result<(), Error> {
        let points = buffer.to_points()?;
        self.assign(points)
    }

    pub fn set_points_f32(&mut self, points: &[[f32; 3]]) -> Result<(), Error> {
        self.assign(cloud_index::points_from_f32(points))
    }

    pub fn set_points(&mut self, points: Vec<Vec3>) -> Result<(), Error> {
        self.assign(points)
    }

    fn assign(&mut self, points: Vec<Vec3>) -> Result<(), Error> {
        if points.is_empty() {
            return Err(Error::InvalidValue(CloudError::EmptyCloud.to_string()));
        }
        let cell = 2.0 * self.config.mean_distance;
        let index = VoxelGrid::build(&points, cell)?;
        let extent = bounds_diagonal(&points);
        self.cloud = Some(Cloud {
            points,
            index,
            extent,
        });
        Ok(())
    }

    pub fn clear_point_cloud(&mut self) {
        self.cloud = None;
    }

    pub fn point_count(&self) -> Option<usize> {
        self.cloud.as_ref().map(|c| c.points.len())
    }

    pub fn find_plane(
        &self,
        seed_index: usize,
        seed_radius: f64,
        request_inlier_flags: bool,
    ) -> Result<FitResult, Error> {
        self.find_surface(FeatureType::Plane, seed_index, seed_radius, request_inlier_flags)
    }

    pub fn find_sphere(
        &self,
        seed_index: usize,
        seed_radius: f64,
        request_inlier_flags: bool,
    ) -> Result<FitResult, Error> {
        self.find_surface(FeatureType::Sphere, seed_index, seed_radius, request_inlier_flags)
    }

    pub fn find_cylinder(
        &self,
        seed_index: usize,
        seed_radius: f64,
        request_inlier_flags: bool,
    ) -> Result<FitResult, Error> {
        self.find_surface(
            FeatureType::Cylinder,
            seed_index,
            seed_radius,
            request_inlier_flags,
        )
    }

    pub fn find_cone(
        &self,
        seed_index: usize,
        seed_radius: f64,
        request_inlier_flags: bool,
    ) -> Result<FitResult, Error> {
        self.find_surface(FeatureType::Cone, seed_index, seed_radius, request_inlier_flags)
    }

    pub fn find_torus(
        &self,
        seed_index: usize,
        seed_radius: f64,
        request_inlier_flags: bool,
    ) -> Result<FitResult, Error> {
        self.find_surface(FeatureType::Torus, seed_index, seed_radius, request_inlier_flags)
    }

    /// Runs one fit: validation, region growing, smart conversion and the
    /// optional full-cloud classification. Never returns a partial result.
    pub fn find_surface(
        &self,
        family: FeatureType,
        seed_index: usize,
        seed_radius: f64,
        request_inlier_flags: bool,
    ) -> Result<FitResult, Error> {
        self.config.validate()?;
        let cloud = self
            .cloud
            .as_ref()
            .ok_or_else(|| Error::InvalidOperation("no point cloud assigned".into()))?;
        if seed_index >= cloud.points.len() {
            return Err(Error::InvalidOperation(format!(
                "seed index {seed_index} out of range for {} points",
                cloud.points.len()
            )));
        }
        if !(seed_radius > 0.0) || !seed_radius.is_finite() {
            return Err(Error::InvalidOperation(format!(
                "seed radius must be positive, got {seed_radius}"
            )));
        }

        let grown = match family {
            FeatureType::Any => self.grow_any(cloud, seed_index, seed_radius)?,
            concrete => self
                .grow_family(concrete, cloud, seed_index, seed_radius)
                .map_err(|failure| failure.into_error(concrete))?,
        };

        let primitive = smart_convert(
            grown.estimate.primitive.clone(),
            &gather(&cloud.points, &grown.inliers),
            &self.config,
        );

        let inlier_flags = if request_inlier_flags {
            Some(classify(
                &cloud.points,
                &primitive,
                self.config.tolerance(),
            )?)
        } else {
            None
        };

        Ok(FitResult {
            primitive,
            rms_error: grown.estimate.rms,
            inlier_flags,
        })
    }

    /// Tries all five families and keeps the best RMS. Candidates within a
    /// narrow band of each other count as tied and the fixed family priority
    /// decides, so a higher-freedom family cannot win by overfitting noise.
    fn grow_any(
        &self,
        cloud: &Cloud,
        seed_index: usize,
        seed_radius: f64,
    ) -> Result<Grown, Error> {
        let outcomes: Vec<(FeatureType, Result<Grown, GrowFailure>)> = FeatureType::CONCRETE
            .par_iter()
            .map(|&family| {
                (
                    family,
                    self.grow_family(family, cloud, seed_index, seed_radius),
                )
            })
            .collect();

        let tie_band = 0.1 * self.config.measurement_accuracy;
        let mut best: Option<(FeatureType, Grown)> = None;
        let mut best_failed_rms = f64::INFINITY;
        for (family, outcome) in outcomes {
            match outcome {
                Ok(grown) => {
                    let better = match &best {
                        None => true,
                        Some((prev_family, prev)) => {
                            let tied = (grown.estimate.rms - prev.estimate.rms).abs() <= tie_band;
                            if tied {
                                family.priority() < prev_family.priority()
                            } else {
                                grown.estimate.rms < prev.estimate.rms
                            }
                        }
                    };
                    if better {
                        best = Some((family, grown));
                    }
                }
                Err(failure) => {
                    debug!("family {family:?} did not converge: {failure}");
                    if let Some(rms) = failure.last_rms() {
                        best_failed_rms = best_failed_rms.min(rms);
                    }
                }
            }
        }
        match best {
            Some((_, grown)) => Ok(grown),
            None if best_failed_rms.is_finite() => Err(Error::InvalidOperation(format!(
                "no surface family converged (best rms before failure {best_failed_rms:.6})"
            ))),
            None => Err(Error::InvalidOperation(
                "no surface family converged".into(),
            )),
        }
    }

    fn grow_family(
        &self,
        family: FeatureType,
        cloud: &Cloud,
        seed_index: usize,
        seed_radius: f64,
    ) -> Result<Grown, GrowFailure> {
        let config = &self.config;
        let seed = cloud.points[seed_index];
        let tolerance = config.tolerance();
        let needed = min_support(family);

        let mut inliers = cloud.index.neighbors(&cloud.points, &seed, seed_radius);
        if inliers.len() < needed {
            return Err(GrowFailure::SeedTooSparse {
                found: inliers.len(),
                needed,
            });
        }

        let radial = config.radial_expansion.get();
        let lateral = config.lateral_extension.get();
        let max_rounds = 4 + 2 * radial.max(lateral) as usize;
        let radial_factor = 1.0 + 0.15 * radial as f64;

        let mut current = estimate(
            family,
            &gather(&cloud.points, &inliers),
            config.measurement_accuracy,
        )
        .map_err(GrowFailure::Estimator)?;
        let mut search_radius = seed_radius;

        for round in 0..max_rounds {
            if radial > 0 {
                search_radius = (search_radius * radial_factor).min(cloud.extent);
            }
            let lateral_limit = lateral_limit(family, lateral, seed_radius, round);
            let candidates = cloud.index.neighbors(&cloud.points, &seed, search_radius);
            let next: Vec<u32> = candidates
                .into_iter()
                .filter(|&i| {
                    let p = &cloud.points[i as usize];
                    current.primitive.distance_to(p) <= tolerance
                        && lateral_distance(&current.primitive, &seed, p) <= lateral_limit
                })
                .collect();

            if next.len() < needed {
                return Err(GrowFailure::Collapsed {
                    rms: current.rms,
                    round,
                });
            }
            if next == inliers {
                debug!("{family:?} stable after {round} rounds with {} inliers", next.len());
                break;
            }
            inliers = next;
            current = estimate(
                family,
                &gather(&cloud.points, &inliers),
                config.measurement_accuracy,
            )
            .map_err(GrowFailure::Estimator)?;
        }

        if !current.rms.is_finite() {
            return Err(GrowFailure::Collapsed {
                rms: current.rms,
                round: max_rounds,
            });
        }
        Ok(Grown {
            estimate: current,
            inliers,
        })
    }
}

struct Grown {
    estimate: Estimate,
    inliers: Vec<u32>,
}

#[derive(Debug, Error)]
enum GrowFailure {
    #[error("seed region holds {found} points but the family needs {needed}")]
    SeedTooSparse { found: usize, needed: usize },
    #[error(transparent)]
    Estimator(EstimateError),
    #[error("inlier set collapsed in round {round} (rms {rms:.6})")]
    Collapsed { rms: f64, round: usize },
}

impl GrowFailure {
    fn last_rms(&self) -> Option<f64> {
        match self {
            GrowFailure::Collapsed { rms, .. } if rms.is_finite() => Some(*rms),
            _ => None,
        }
    }

    fn into_error(self, family: FeatureType) -> Error {
        Error::InvalidOperation(format!("{family:?} fit failed: {self}"))
    }
}

fn gather(points: &[Vec3], indices: &[u32]) -> Vec<Vec3> {
    indices.iter().map(|&i| points[i as usize]).collect()
}

fn bounds_diagonal(points: &[Vec3]) -> f64 {
    let mut lo = Vec3::repeat(f64::MAX);
    let mut hi = Vec3::repeat(f64::MIN);
    for p in points {
        lo = lo.inf(p);
        hi = hi.sup(p);
    }
    (hi - lo).norm().max(f64::MIN_POSITIVE)
}

/// How far along the fitted surface the window may reach this round.
/// Lateral control only applies to open surfaces; spheres and tori are
/// closed, so their window is unbounded.
fn lateral_limit(family: FeatureType, level: u8, seed_radius: f64, round: usize) -> f64 {
    match family {
        FeatureType::Sphere | FeatureType::Torus => f64::INFINITY,
        _ if level == 0 => seed_radius,
        _ => seed_radius * (1.0 + 0.5 * level as f64 * (round + 1) as f64),
    }
}

/// In-surface distance between the seed and a candidate: tangential for a
/// plane, axial plus arc length for cylinders and cones.
fn lateral_distance(primitive: &Primitive, seed: &Vec3, p: &Vec3) -> f64 {
    match primitive {
        Primitive::Plane(plane) => {
            let n = plane.normal();
            let w = p - seed;
            (w - n * w.dot(&n)).norm()
        }
        Primitive::Cylinder(cyl) => {
            arc_distance(seed, p, &cyl.bottom, &cyl.axis(), cyl.radius)
        }
        Primitive::Cone(cone) => {
            let mid_radius = (cone.bottom_radius + cone.top_radius) / 2.0;
            arc_distance(seed, p, &cone.bottom, &cone.axis(), mid_radius)
        }
        Primitive::Sphere(_) | Primitive::Torus(_) => 0.0,
    }
}

fn arc_distance(seed: &Vec3, p: &Vec3, origin: &Vec3, axis: &Vec3, radius: f64) -> f64 {
    let ws = seed - origin;
    let wp = p - origin;
    let axial = wp.dot(axis) - ws.dot(axis);
    let rs = ws - axis * ws.dot(axis);
    let rp = wp - axis * wp.dot(axis);
    let (ns, np) = (rs.norm(), rp.norm());
    if ns < f64::EPSILON || np < f64::EPSILON {
        return axial.abs();
    }
    let angle = (rs.dot(&rp) / (ns * np)).clamp(-1.0, 1.0).acos();
    (axial * axial + (radius * angle).powi(2)).sqrt()
}

// --- Smart conversion -----------------------------------------------------

/// Near-degeneracy bands are this multiple of the measurement accuracy.
const CONVERSION_FACTOR: f64 = 2.0;
/// A torus ring at least this many tube radii across counts as locally flat.
const FLAT_RING_RATIO: f64 = 25.0;

/// Substitutes the simpler equivalent family when the converged parameters
/// sit on a degeneracy boundary and the matching option is enabled. Only the
/// parametrization changes; the inlier set and RMS are kept as grown.
fn smart_convert(primitive: Primitive, inlier_points: &[Vec3], config: &Config) -> Primitive {
    let band = CONVERSION_FACTOR * config.measurement_accuracy;
    match primitive {
        Primitive::Cone(cone)
            if config.conversions.cone_to_cylinder
                && cone.bottom_radius - cone.top_radius <= band =>
        {
            let radius = (cone.bottom_radius + cone.top_radius) / 2.0;
            match Cylinder::new(cone.bottom, cone.top, radius) {
                Ok(cylinder) => {
                    debug!("smart conversion: cone -> cylinder (radius {radius:.6})");
                    Primitive::Cylinder(cylinder)
                }
                Err(_) => Primitive::Cone(cone),
            }
        }
        Primitive::Torus(torus)
            if config.conversions.torus_to_sphere
                && (torus.mean_radius - torus.tube_radius).abs() <= band =>
        {
            match Sphere::new(torus.center, torus.mean_radius) {
                Ok(sphere) => {
                    debug!("smart conversion: torus -> sphere (radius {:.6})", sphere.radius);
                    Primitive::Sphere(sphere)
                }
                Err(_) => Primitive::Torus(torus),
            }
        }
        Primitive::Torus(torus)
            if config.conversions.torus_to_cylinder
                && torus.mean_radius
                    > FLAT_RING_RATIO * torus.tube_radius.max(config.measurement_accuracy) =>
        {
            match flat_ring_to_cylinder(&torus, inlier_points) {
                Some(cylinder) => {
                    debug!("smart conversion: torus -> cylinder (radius {:.6})", cylinder.radius);
                    Primitive::Cylinder(cylinder)
                }
                None => Primitive::Torus(torus),
            }
        }
        other => other,
    }
}

/// A locally flat ring patch is re-read as a cylinder: the axis is the ring
/// tangent at the patch center, the radius is the tube radius.
fn flat_ring_to_cylinder(torus: &geom_core::Torus, inlier_points: &[Vec3]) -> Option<Cylinder> {
    if inlier_points.is_empty() {
        return None;
    }
    let patch = geom_core::centroid(inlier_points);
    let w = patch - torus.center;
    let radial = w - torus.normal * w.dot(&torus.normal);
    let len = radial.norm();
    if len < f64::EPSILON {
        return None;
    }
    let radial = radial / len;
    let tangent = torus.normal.cross(&radial);
    let axis_point = torus.center + radial * torus.mean_radius;

    let mut t_min = f64::MAX;
    let mut t_max = f64::MIN;
    for p in inlier_points {
        let t = (p - axis_point).dot(&tangent);
        t_min = t_min.min(t);
        t_max = t_max.max(t);
    }
    Cylinder::new(
        axis_point + tangent * t_min,
        axis_point + tangent * t_max,
        torus.tube_radius,
    )
    .ok()
}

// --- Inlier classification ------------------------------------------------

/// O(N) pass over the whole cloud, including points the growth never
/// visited.
fn classify(points: &[Vec3], primitive: &Primitive, tolerance: f64) -> Result<InlierFlags, Error> {
    let mut flags = Vec::new();
    flags
        .try_reserve_exact(points.len())
        .map_err(|_| Error::OutOfMemory(format!("inlier flags for {} points", points.len())))?;
    flags.extend(
        points
            .par_iter()
            .map(|p| primitive.distance_to(p) <= tolerance)
            .collect::<Vec<bool>>(),
    );
    Ok(InlierFlags::new(flags))
}

#[cfg(test)]
mod tests {
    use super::*;
    use geom_core::Torus;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::f64::consts::TAU;

    fn noise(rng: &mut StdRng, sigma: f64) -> f64 {
        let u1: f64 = rng.gen_range(1e-12..1.0);
        let u2: f64 = rng.gen_range(0.0..1.0);
        sigma * (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
    }

    /// 1000 points on a radius-2, height-10 cylinder. The first points form
    /// an exact on-surface patch around (2, 0, 5) so a 0.5 seed radius is
    /// always viable.
    fn cylinder_cloud(sigma: f64) -> Vec<Vec3> {
        let mut rng = StdRng::seed_from_u64(101);
        let mut points = Vec::with_capacity(1000);
        points.push(Vec3::new(2.0, 0.0, 5.0));
        for i in 0..15 {
            let angle = (i as f64 / 15.0 - 0.5) * 0.4;
            let z = 5.0 + ((i % 5) as f64 - 2.0) * 0.15;
            points.push(Vec3::new(2.0 * angle.cos(), 2.0 * angle.sin(), z));
        }
        while points.len() < 1000 {
            let angle = rng.gen_range(0.0..TAU);
            let z = rng.gen_range(0.0..10.0);
            let r = 2.0 + noise(&mut rng, sigma);
            points.push(Vec3::new(r * angle.cos(), r * angle.sin(), z));
        }
        points
    }

    fn plane_cloud(half: f64, n: usize, sigma: f64) -> Vec<Vec3> {
        let mut rng = StdRng::seed_from_u64(103);
        let mut points = Vec::with_capacity(n);
        points.push(Vec3::zeros());
        while points.len() < n {
            points.push(Vec3::new(
                rng.gen_range(-half..half),
                rng.gen_range(-half..half),
                noise(&mut rng, sigma),
            ));
        }
        points
    }

    fn sphere_cloud(center: Vec3, radius: f64, n: usize, sigma: f64) -> Vec<Vec3> {
        let mut rng = StdRng::seed_from_u64(107);
        let mut points = Vec::with_capacity(n);
        points.push(center + Vec3::new(radius, 0.0, 0.0));
        while points.len() < n {
            let dir = Vec3::new(
                noise(&mut rng, 1.0),
                noise(&mut rng, 1.0),
                noise(&mut rng, 1.0),
            )
            .normalize();
            points.push(center + dir * (radius + noise(&mut rng, sigma)));
        }
        points
    }

    fn frustum_cloud(r_bottom: f64, r_top: f64, height: f64, n: usize, sigma: f64) -> Vec<Vec3> {
        let mut rng = StdRng::seed_from_u64(109);
        let mut points = Vec::with_capacity(n);
        points.push(Vec3::new(r_bottom + (r_top - r_bottom) * 0.5, 0.0, height / 2.0));
        while points.len() < n {
            let angle = rng.gen_range(0.0..TAU);
            let z = rng.gen_range(0.0..height);
            let r = r_bottom + (r_top - r_bottom) * z / height + noise(&mut rng, sigma);
            points.push(Vec3::new(r * angle.cos(), r * angle.sin(), z));
        }
        points
    }

    fn session_with(points: Vec<Vec3>, accuracy: f64, mean_distance: f64) -> Session {
        let config = Config::new(accuracy, mean_distance).unwrap();
        let mut session = Session::new(config).unwrap();
        session.set_points(points).unwrap();
        session
    }

    #[test]
    fn cylinder_scenario_recovers_radius() {
        let session = session_with(cylinder_cloud(0.01), 0.02, 0.4);
        let result = session.find_cylinder(0, 0.5, false).unwrap();
        let Primitive::Cylinder(cyl) = &result.primitive else {
            panic!("expected a cylinder, got {:?}", result.primitive.feature_type());
        };
        assert!(
            cyl.radius > 1.95 && cyl.radius < 2.05,
            "radius {} outside [1.95, 2.05]",
            cyl.radius
        );
        assert!(result.rms_error < 0.02);
        assert!(result.inlier_flags.is_none());
    }

    #[test]
    fn fit_is_deterministic() {
        let session = session_with(cylinder_cloud(0.01), 0.02, 0.4);
        let a = session.find_cylinder(0, 0.5, true).unwrap();
        let b = session.find_cylinder(0, 0.5, true).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn plane_fit_recovers_normal() {
        let session = session_with(plane_cloud(5.0, 1500, 0.01), 0.02, 0.3);
        let result = session.find_plane(0, 0.6, false).unwrap();
        let Primitive::Plane(plane) = &result.primitive else {
            panic!("expected a plane");
        };
        assert!(plane.normal().z.abs() > 0.999);
        assert!(result.rms_error <= 0.02);
    }

    #[test]
    fn sphere_fit_recovers_center() {
        let center = Vec3::new(0.5, -1.0, 2.0);
        let session = session_with(sphere_cloud(center, 1.5, 1200, 0.01), 0.02, 0.15);
        let result = session.find_sphere(0, 0.5, false).unwrap();
        let Primitive::Sphere(sphere) = &result.primitive else {
            panic!("expected a sphere");
        };
        assert!((sphere.center - center).norm() < 0.05);
        assert!((sphere.radius - 1.5).abs() < 0.05);
    }

    #[test]
    fn any_family_picks_a_sphere_for_sphere_data() {
        let center = Vec3::new(0.0, 0.0, 0.0);
        let session = session_with(sphere_cloud(center, 1.5, 1200, 0.005), 0.015, 0.15);
        let result = session
            .find_surface(FeatureType::Any, 0, 0.6, false)
            .unwrap();
        assert_eq!(result.primitive.feature_type(), FeatureType::Sphere);
    }

    #[test]
    fn radial_expansion_never_shrinks_the_inlier_set() {
        let points = plane_cloud(5.0, 1500, 0.005);
        let mut counts = Vec::new();
        for level in [0u8, 3, 6, 10] {
            let mut session = session_with(points.clone(), 0.02, 0.3);
            session.set_radial_expansion(SearchLevel::new(level).unwrap());
            let result = session.find_plane(0, 0.6, true).unwrap();
            counts.push(result.inlier_flags.unwrap().inlier_count());
        }
        assert!(
            counts.windows(2).all(|w| w[0] <= w[1]),
            "inlier counts not monotone: {counts:?}"
        );
    }

    #[test]
    fn sparse_seed_fails_with_invalid_operation() {
        let session = session_with(plane_cloud(5.0, 600, 0.005), 0.02, 0.3);
        // A radius far below the sampling distance isolates the seed point.
        let err = session.find_plane(0, 1e-4, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    }

    #[test]
    fn fit_without_cloud_is_invalid_operation() {
        let session = Session::new(Config::new(0.02, 0.3).unwrap()).unwrap();
        let err = session.find_plane(0, 0.5, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    }

    #[test]
    fn out_of_range_seed_is_rejected_before_fitting() {
        let session = session_with(plane_cloud(2.0, 100, 0.005), 0.02, 0.3);
        let err = session.find_plane(100, 0.5, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
        let err = session.find_plane(0, -1.0, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    }

    #[test]
    fn config_rejects_bad_values() {
        assert_eq!(
            Config::new(0.0, 0.3).unwrap_err().kind(),
            ErrorKind::InvalidValue
        );
        assert_eq!(
            Config::new(0.02, -1.0).unwrap_err().kind(),
            ErrorKind::InvalidValue
        );
        assert!(SearchLevel::new(11).is_err());
        assert_eq!(SearchLevel::new(10).unwrap(), SearchLevel::RADICAL);
    }

    #[test]
    fn near_cylindrical_cone_converts_when_enabled() {
        let points = frustum_cloud(1.5, 1.49, 4.0, 1200, 0.004);
        let mut session = session_with(points.clone(), 0.02, 0.25);
        session.set_conversions(ConversionOptions {
            cone_to_cylinder: true,
            ..ConversionOptions::default()
        });
        let converted = session.find_cone(0, 0.6, false).unwrap();
        assert_eq!(converted.primitive.feature_type(), FeatureType::Cylinder);

        let session = session_with(points, 0.02, 0.25);
        let kept = session.find_cone(0, 0.6, false).unwrap();
        let Primitive::Cone(cone) = &kept.primitive else {
            panic!("expected a cone with conversion disabled");
        };
        assert!((cone.bottom_radius - cone.top_radius).abs() < 0.04);
    }

    #[test]
    fn torus_to_sphere_conversion_is_gated() {
        let torus = Torus::new(Vec3::zeros(), Vec3::z(), 1.0, 0.99).unwrap();
        let config = Config::new(0.02, 0.1).unwrap();
        let kept = smart_convert(Primitive::Torus(torus.clone()), &[], &config);
        assert_eq!(kept.feature_type(), FeatureType::Torus);

        let mut enabled = config.clone();
        enabled.conversions.torus_to_sphere = true;
        let converted = smart_convert(Primitive::Torus(torus), &[], &enabled);
        let Primitive::Sphere(sphere) = converted else {
            panic!("expected a sphere");
        };
        assert_eq!(sphere.radius, 1.0);
    }

    #[test]
    fn flat_torus_converts_to_cylinder() {
        let torus = Torus::new(Vec3::zeros(), Vec3::z(), 100.0, 0.5).unwrap();
        let patch: Vec<Vec3> = (0..20)
            .map(|i| Vec3::new(100.0, (i as f64 - 10.0) * 0.1, 0.0))
            .collect();
        let mut config = Config::new(0.02, 0.1).unwrap();
        config.conversions.torus_to_cylinder = true;
        let converted = smart_convert(Primitive::Torus(torus), &patch, &config);
        let Primitive::Cylinder(cylinder) = converted else {
            panic!("expected a cylinder");
        };
        assert_eq!(cylinder.radius, 0.5);
        assert!(cylinder.axis().y.abs() > 0.99);
    }

    #[test]
    fn inlier_flags_cover_the_whole_cloud() {
        let points = plane_cloud(3.0, 800, 0.005);
        let total = points.len();
        let session = session_with(points, 0.02, 0.3);
        let result = session.find_plane(0, 0.6, true).unwrap();
        let flags = result.inlier_flags.expect("flags were requested");
        assert_eq!(flags.len(), total);
        assert_eq!(flags.inlier_count() + flags.outlier_count(), total);
        let tolerance = TOLERANCE_FACTOR * 0.02;
        for i in 0..flags.len() {
            if flags.is_inlier(i) {
                assert!(result.primitive.distance_to(&session.cloud.as_ref().unwrap().points[i]) <= tolerance);
            }
        }
    }
}
